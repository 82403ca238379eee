//! Minimal type system the layout synthesizer consumes.
//!
//! Only what array construction needs is modelled: identity, whether a type
//! is a reference, its storage size and the reference offsets of value types.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rt_abi::{
    ELEMENT_TYPE_BOOLEAN, ELEMENT_TYPE_CHAR, ELEMENT_TYPE_CLASS, ELEMENT_TYPE_I, ELEMENT_TYPE_I1,
    ELEMENT_TYPE_I2, ELEMENT_TYPE_I4, ELEMENT_TYPE_I8, ELEMENT_TYPE_OBJECT, ELEMENT_TYPE_R4,
    ELEMENT_TYPE_R8, ELEMENT_TYPE_STRING, ELEMENT_TYPE_SZARRAY, ELEMENT_TYPE_ARRAY,
    ELEMENT_TYPE_U, ELEMENT_TYPE_U1, ELEMENT_TYPE_U2, ELEMENT_TYPE_U4, ELEMENT_TYPE_U8,
    ELEMENT_TYPE_VALUETYPE, ELEMENT_TYPE_VOID, POINTER_SIZE,
};
use serde::Serialize;

use crate::array::ArrayKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    I,
    U,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 15] = [
        PrimitiveType::Void,
        PrimitiveType::Boolean,
        PrimitiveType::Char,
        PrimitiveType::I1,
        PrimitiveType::U1,
        PrimitiveType::I2,
        PrimitiveType::U2,
        PrimitiveType::I4,
        PrimitiveType::U4,
        PrimitiveType::I8,
        PrimitiveType::U8,
        PrimitiveType::R4,
        PrimitiveType::R8,
        PrimitiveType::I,
        PrimitiveType::U,
    ];

    pub fn size(self) -> u32 {
        match self {
            PrimitiveType::Void => 0,
            PrimitiveType::Boolean | PrimitiveType::I1 | PrimitiveType::U1 => 1,
            PrimitiveType::Char | PrimitiveType::I2 | PrimitiveType::U2 => 2,
            PrimitiveType::I4 | PrimitiveType::U4 | PrimitiveType::R4 => 4,
            PrimitiveType::I8 | PrimitiveType::U8 | PrimitiveType::R8 => 8,
            PrimitiveType::I | PrimitiveType::U => POINTER_SIZE,
        }
    }

    pub fn element_code(self) -> u8 {
        match self {
            PrimitiveType::Void => ELEMENT_TYPE_VOID,
            PrimitiveType::Boolean => ELEMENT_TYPE_BOOLEAN,
            PrimitiveType::Char => ELEMENT_TYPE_CHAR,
            PrimitiveType::I1 => ELEMENT_TYPE_I1,
            PrimitiveType::U1 => ELEMENT_TYPE_U1,
            PrimitiveType::I2 => ELEMENT_TYPE_I2,
            PrimitiveType::U2 => ELEMENT_TYPE_U2,
            PrimitiveType::I4 => ELEMENT_TYPE_I4,
            PrimitiveType::U4 => ELEMENT_TYPE_U4,
            PrimitiveType::I8 => ELEMENT_TYPE_I8,
            PrimitiveType::U8 => ELEMENT_TYPE_U8,
            PrimitiveType::R4 => ELEMENT_TYPE_R4,
            PrimitiveType::R8 => ELEMENT_TYPE_R8,
            PrimitiveType::I => ELEMENT_TYPE_I,
            PrimitiveType::U => ELEMENT_TYPE_U,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Void => "void",
            PrimitiveType::Boolean => "bool",
            PrimitiveType::Char => "char",
            PrimitiveType::I1 => "int8",
            PrimitiveType::U1 => "uint8",
            PrimitiveType::I2 => "int16",
            PrimitiveType::U2 => "uint16",
            PrimitiveType::I4 => "int32",
            PrimitiveType::U4 => "uint32",
            PrimitiveType::I8 => "int64",
            PrimitiveType::U8 => "uint64",
            PrimitiveType::R4 => "float32",
            PrimitiveType::R8 => "float64",
            PrimitiveType::I => "nint",
            PrimitiveType::U => "nuint",
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, PrimitiveType::R4 | PrimitiveType::R8)
    }

    /// Unsigned integers collapse onto the signed type of the same width.
    /// Arrays whose elements normalize to the same type are interchangeable;
    /// `bool` and `char` stay distinct from the integers they are sized like.
    pub fn normalized_integral(self) -> Self {
        match self {
            PrimitiveType::U1 => PrimitiveType::I1,
            PrimitiveType::U2 => PrimitiveType::I2,
            PrimitiveType::U4 => PrimitiveType::I4,
            PrimitiveType::U8 => PrimitiveType::I8,
            PrimitiveType::U => PrimitiveType::I,
            other => other,
        }
    }
}

/// Storage shape of a value type: its size and the byte offsets of the
/// object references it embeds, in the order they were declared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValueTypeLayout {
    pub size: u32,
    pub ref_offsets: Vec<u32>,
    /// Stack-only types cannot be boxed or stored in arrays.
    pub byref_like: bool,
}

impl ValueTypeLayout {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            ref_offsets: Vec::new(),
            byref_like: false,
        }
    }

    pub fn from_ref_offsets(size: u32, ref_offsets: impl Into<Vec<u32>>) -> Self {
        Self {
            size,
            ref_offsets: ref_offsets.into(),
            byref_like: false,
        }
    }

    pub fn contains_references(&self) -> bool {
        !self.ref_offsets.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Primitive(PrimitiveType),
    Object,
    String,
    Class { parent: TypeId },
    ValueType(ValueTypeLayout),
    Array {
        element: TypeId,
        rank: u32,
        kind: ArrayKind,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypeDesc {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
}

pub type TypeHandle = Arc<TypeDesc>;

impl TypeDesc {
    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object | TypeKind::String | TypeKind::Class { .. } | TypeKind::Array { .. }
        )
    }

    pub fn is_vector(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Array {
                kind: ArrayKind::Vector,
                ..
            }
        )
    }

    /// Bytes one instance occupies when stored inline, e.g. as an array
    /// element. References are stored as a pointer.
    pub fn storage_size(&self) -> u32 {
        match &self.kind {
            TypeKind::Primitive(primitive) => primitive.size(),
            TypeKind::ValueType(layout) => layout.size,
            _ => POINTER_SIZE,
        }
    }

    pub fn element_code(&self) -> u8 {
        match &self.kind {
            TypeKind::Primitive(primitive) => primitive.element_code(),
            TypeKind::Object => ELEMENT_TYPE_OBJECT,
            TypeKind::String => ELEMENT_TYPE_STRING,
            TypeKind::Class { .. } => ELEMENT_TYPE_CLASS,
            TypeKind::ValueType(_) => ELEMENT_TYPE_VALUETYPE,
            TypeKind::Array {
                kind: ArrayKind::Vector,
                ..
            } => ELEMENT_TYPE_SZARRAY,
            TypeKind::Array { .. } => ELEMENT_TYPE_ARRAY,
        }
    }

    pub fn value_layout(&self) -> Option<&ValueTypeLayout> {
        match &self.kind {
            TypeKind::ValueType(layout) => Some(layout),
            _ => None,
        }
    }
}

struct UniverseState {
    types: Vec<TypeHandle>,
    by_name: HashMap<String, TypeId>,
    arrays: HashMap<(TypeId, u32, ArrayKind), TypeId>,
}

/// Registry of every type known to one loader. Handles are never removed.
pub struct TypeUniverse {
    state: RwLock<UniverseState>,
}

const OBJECT_ID: TypeId = TypeId(0);
const STRING_ID: TypeId = TypeId(1);
const FIRST_PRIMITIVE_ID: u32 = 2;

impl Default for TypeUniverse {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeUniverse {
    pub fn new() -> Self {
        let mut state = UniverseState {
            types: Vec::new(),
            by_name: HashMap::new(),
            arrays: HashMap::new(),
        };
        push_type(&mut state, "object".to_string(), TypeKind::Object);
        push_type(&mut state, "string".to_string(), TypeKind::String);
        for primitive in PrimitiveType::ALL {
            push_type(
                &mut state,
                primitive.name().to_string(),
                TypeKind::Primitive(primitive),
            );
        }
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn object(&self) -> TypeHandle {
        self.expect_builtin(OBJECT_ID)
    }

    pub fn string(&self) -> TypeHandle {
        self.expect_builtin(STRING_ID)
    }

    pub fn primitive(&self, primitive: PrimitiveType) -> TypeHandle {
        let index = PrimitiveType::ALL
            .iter()
            .position(|candidate| *candidate == primitive)
            .unwrap_or_default() as u32;
        self.expect_builtin(TypeId(FIRST_PRIMITIVE_ID + index))
    }

    pub fn define_class(&self, name: &str, parent: Option<TypeId>) -> TypeHandle {
        let parent = parent.unwrap_or(OBJECT_ID);
        self.define(name, TypeKind::Class { parent })
    }

    pub fn define_value_type(&self, name: &str, layout: ValueTypeLayout) -> TypeHandle {
        self.define(name, TypeKind::ValueType(layout))
    }

    /// Returns the interned array type over `element`.
    pub fn array_type(&self, element: &TypeDesc, rank: u32, kind: ArrayKind) -> TypeHandle {
        let key = (element.id, rank, kind);
        if let Some(handle) = self.read_array(key) {
            return handle;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = state.arrays.get(&key) {
            return state.types[id.0 as usize].clone();
        }
        let name = format!("{}{}", element.name, array_suffix(rank, kind));
        let handle = push_type(
            &mut state,
            name,
            TypeKind::Array {
                element: element.id,
                rank,
                kind,
            },
        );
        state.arrays.insert(key, handle.id);
        handle
    }

    pub fn get(&self, id: TypeId) -> Option<TypeHandle> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .get(id.0 as usize)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<TypeHandle> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_name
            .get(name)
            .and_then(|id| state.types.get(id.0 as usize))
            .cloned()
    }

    /// Number of vector levels below `ty`: `int32[]` is 0, `int32[][]` is 1.
    pub fn vector_nesting_depth(&self, ty: &TypeDesc) -> u32 {
        let mut depth = 0;
        let mut current = match &ty.kind {
            TypeKind::Array { element, .. } => self.get(*element),
            _ => None,
        };
        while let Some(element) = current {
            match &element.kind {
                TypeKind::Array {
                    element: inner,
                    kind: ArrayKind::Vector,
                    ..
                } => {
                    depth += 1;
                    current = self.get(*inner);
                }
                _ => break,
            }
        }
        depth
    }

    /// Whether a reference of exact type `source` may be stored where
    /// `target` is expected, including array covariance.
    pub fn is_assignable(&self, source: TypeId, target: TypeId) -> bool {
        if source == target {
            return true;
        }
        let (Some(source), Some(target)) = (self.get(source), self.get(target)) else {
            return false;
        };
        if !source.is_reference() || !target.is_reference() {
            return false;
        }
        match (&source.kind, &target.kind) {
            (_, TypeKind::Object) => true,
            (TypeKind::Class { parent }, _) => {
                *parent != source.id && self.is_assignable(*parent, target.id)
            }
            (
                TypeKind::Array {
                    element: source_element,
                    rank: source_rank,
                    kind: source_kind,
                },
                TypeKind::Array {
                    element: target_element,
                    rank: target_rank,
                    kind: target_kind,
                },
            ) => {
                if source_rank != target_rank || source_kind != target_kind {
                    return false;
                }
                if source_element == target_element {
                    return true;
                }
                if let (Some(source), Some(target)) =
                    (self.get(*source_element), self.get(*target_element))
                {
                    if let (TypeKind::Primitive(source), TypeKind::Primitive(target)) =
                        (&source.kind, &target.kind)
                    {
                        return source.normalized_integral() == target.normalized_integral();
                    }
                }
                self.get(*source_element)
                    .is_some_and(|element| element.is_reference())
                    && self.is_assignable(*source_element, *target_element)
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .types
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn define(&self, name: &str, kind: TypeKind) -> TypeHandle {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        push_type(&mut state, name.to_string(), kind)
    }

    fn read_array(&self, key: (TypeId, u32, ArrayKind)) -> Option<TypeHandle> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .arrays
            .get(&key)
            .and_then(|id| state.types.get(id.0 as usize))
            .cloned()
    }

    fn expect_builtin(&self, id: TypeId) -> TypeHandle {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        // Built-ins are registered in `new` and never removed.
        state.types[id.0 as usize].clone()
    }
}

fn push_type(state: &mut UniverseState, name: String, kind: TypeKind) -> TypeHandle {
    let id = TypeId(state.types.len() as u32);
    let handle = Arc::new(TypeDesc {
        id,
        name: name.clone(),
        kind,
    });
    state.types.push(handle.clone());
    state.by_name.insert(name, id);
    handle
}

fn array_suffix(rank: u32, kind: ArrayKind) -> String {
    match (kind, rank) {
        (ArrayKind::Vector, _) => "[]".to_string(),
        (ArrayKind::General, 1) => "[*]".to_string(),
        (ArrayKind::General, rank) => format!("[{}]", ",".repeat(rank as usize - 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_stable_ids() {
        let universe = TypeUniverse::new();
        assert_eq!(universe.object().id, OBJECT_ID);
        assert_eq!(universe.string().id, STRING_ID);
        assert_eq!(universe.primitive(PrimitiveType::I4).name, "int32");
        assert_eq!(universe.primitive(PrimitiveType::I4).storage_size(), 4);
        assert_eq!(
            universe.by_name("float64").map(|ty| ty.id),
            Some(universe.primitive(PrimitiveType::R8).id)
        );
    }

    #[test]
    fn array_types_are_interned_and_named() {
        let universe = TypeUniverse::new();
        let int = universe.primitive(PrimitiveType::I4);
        let vector = universe.array_type(&int, 1, ArrayKind::Vector);
        assert_eq!(vector.name, "int32[]");
        assert_eq!(universe.array_type(&int, 1, ArrayKind::Vector).id, vector.id);
        assert_eq!(universe.array_type(&int, 2, ArrayKind::General).name, "int32[,]");
        assert_eq!(universe.array_type(&int, 1, ArrayKind::General).name, "int32[*]");

        let jagged = universe.array_type(&vector, 1, ArrayKind::Vector);
        assert_eq!(universe.vector_nesting_depth(&vector), 0);
        assert_eq!(universe.vector_nesting_depth(&jagged), 1);
    }

    #[test]
    fn assignability_follows_class_chain_and_array_covariance() {
        let universe = TypeUniverse::new();
        let animal = universe.define_class("Animal", None);
        let dog = universe.define_class("Dog", Some(animal.id));
        let int = universe.primitive(PrimitiveType::I4);

        assert!(universe.is_assignable(dog.id, animal.id));
        assert!(!universe.is_assignable(animal.id, dog.id));
        assert!(universe.is_assignable(universe.string().id, universe.object().id));

        let dogs = universe.array_type(&dog, 1, ArrayKind::Vector);
        let animals = universe.array_type(&animal, 1, ArrayKind::Vector);
        assert!(universe.is_assignable(dogs.id, animals.id));
        assert!(!universe.is_assignable(animals.id, dogs.id));

        let ints = universe.array_type(&int, 1, ArrayKind::Vector);
        let objects = universe.array_type(&universe.object(), 1, ArrayKind::Vector);
        assert!(!universe.is_assignable(ints.id, objects.id));
        assert!(universe.is_assignable(ints.id, universe.object().id));
    }

    #[test]
    fn integral_arrays_ignore_signedness_only() {
        let universe = TypeUniverse::new();
        let vector = |primitive| {
            universe.array_type(&universe.primitive(primitive), 1, ArrayKind::Vector)
        };
        assert!(universe.is_assignable(vector(PrimitiveType::U4).id, vector(PrimitiveType::I4).id));
        assert!(universe.is_assignable(vector(PrimitiveType::I8).id, vector(PrimitiveType::U8).id));
        assert!(universe.is_assignable(vector(PrimitiveType::U).id, vector(PrimitiveType::I).id));
        assert!(!universe.is_assignable(vector(PrimitiveType::Boolean).id, vector(PrimitiveType::U1).id));
        assert!(!universe.is_assignable(vector(PrimitiveType::Char).id, vector(PrimitiveType::I2).id));
        assert!(!universe.is_assignable(vector(PrimitiveType::I4).id, vector(PrimitiveType::I8).id));
        assert!(!universe.is_assignable(vector(PrimitiveType::R4).id, vector(PrimitiveType::I4).id));
    }
}
