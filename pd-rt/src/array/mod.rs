//! Array method-table synthesis.
//!
//! Array types have no metadata of their own. Their layout, GC descriptor,
//! dispatch table and accessor methods are built here when a type is first
//! requested. Arrays of ordinary reference types alias the tables of the
//! `object` array with the same kind and rank.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rt_abi::{
    ARRAY_BOUND_WORD_SIZE, ARRAY_BOUND_WORDS_PER_RANK, ARRAY_BOUNDS_OFFSET, CALLCONV_HASTHIS,
    ELEMENT_TYPE_I4, ELEMENT_TYPE_VOID, MAX_ARRAY_RANK, MAX_COMPONENT_SIZE,
    METHOD_ATTR_PUBLIC, METHOD_ATTR_RT_SPECIAL_NAME, OBJ_HEADER_SIZE, VECTOR_DATA_OFFSET,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArrayAccessFault, RtResult, TypeLoadError};
use crate::logging::Component;
use crate::types::{PrimitiveType, TypeDesc, TypeHandle, TypeId, TypeKind, TypeUniverse};

mod accessor;
mod gcdesc;
mod list_dispatch;
mod signature;

pub use accessor::{
    AccessorArgs, AccessorBody, AccessorOp, AccessorOutcome, ArrayObject, ElementValue, ObjectRef,
};
pub use gcdesc::{GcDesc, GcSeries, PatternItem};
pub use list_dispatch::{ListHelperCall, is_implicit_vector_interface, resolve_list_method};
pub use signature::SignatureBuilder;

/// Vectors are single-dimension and zero-based; general arrays carry a
/// length and lower bound per dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayKind {
    Vector,
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutOwnership {
    Owns,
    AliasesCanonical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualSlot {
    pub owner: &'static str,
    pub name: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualTable {
    pub slots: Vec<VirtualSlot>,
}

const ARRAY_VIRTUALS: [(&str, &str); 9] = [
    ("object", "ToString"),
    ("object", "Equals"),
    ("object", "GetHashCode"),
    ("object", "Finalize"),
    ("Array", "ICloneable.Clone"),
    ("Array", "IList.get_Item"),
    ("Array", "IList.set_Item"),
    ("Array", "ICollection.get_Count"),
    ("Array", "IEnumerable.GetEnumerator"),
];

impl VirtualTable {
    pub fn for_arrays() -> Self {
        Self {
            slots: ARRAY_VIRTUALS
                .into_iter()
                .map(|(owner, name)| VirtualSlot { owner, name })
                .collect(),
        }
    }
}

/// How a generic interface on an array is instantiated. Shared tables leave
/// the argument open and take it from the concrete element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceInstantiation {
    NonGeneric,
    Exact(TypeId),
    Canonical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceEntry {
    pub name: &'static str,
    pub instantiation: InterfaceInstantiation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceMap {
    pub entries: Vec<InterfaceEntry>,
}

const NON_GENERIC_INTERFACES: [&str; 6] = [
    "ICloneable",
    "IList",
    "ICollection",
    "IEnumerable",
    "IStructuralComparable",
    "IStructuralEquatable",
];

const VECTOR_GENERIC_INTERFACES: [&str; 5] = [
    "IList`1",
    "ICollection`1",
    "IEnumerable`1",
    "IReadOnlyList`1",
    "IReadOnlyCollection`1",
];

impl InterfaceMap {
    pub fn for_array(element: &TypeDesc, kind: ArrayKind, canonical: bool) -> Self {
        let mut entries: Vec<InterfaceEntry> = NON_GENERIC_INTERFACES
            .into_iter()
            .map(|name| InterfaceEntry {
                name,
                instantiation: InterfaceInstantiation::NonGeneric,
            })
            .collect();
        if kind == ArrayKind::Vector {
            let instantiation = if canonical {
                InterfaceInstantiation::Canonical
            } else {
                InterfaceInstantiation::Exact(element.id)
            };
            entries.extend(VECTOR_GENERIC_INTERFACES.into_iter().map(|name| InterfaceEntry {
                name,
                instantiation,
            }));
        }
        Self { entries }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMethodKind {
    Get,
    Set,
    Address,
    Ctor { arity: u32 },
}

impl ArrayMethodKind {
    /// Metadata flags: every array method is public and constructors are
    /// additionally runtime-special-named.
    pub fn attributes(self) -> u16 {
        match self {
            ArrayMethodKind::Ctor { .. } => METHOD_ATTR_PUBLIC | METHOD_ATTR_RT_SPECIAL_NAME,
            _ => METHOD_ATTR_PUBLIC,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArrayMethodDesc {
    kind: ArrayMethodKind,
    name: &'static str,
    signature: Vec<u8>,
    body: Option<AccessorBody>,
}

impl ArrayMethodDesc {
    pub fn kind(&self) -> ArrayMethodKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn body(&self) -> Option<&AccessorBody> {
        self.body.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArrayMethodSnapshot {
    pub name: &'static str,
    pub kind: ArrayMethodKind,
    pub attributes: u16,
    pub signature: String,
    pub body_ops: usize,
}

/// Deterministic description of a built array type, used to compare layouts
/// across runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArrayLayoutSnapshot {
    pub name: String,
    pub element: String,
    pub rank: u32,
    pub kind: ArrayKind,
    pub component_size: u32,
    pub base_size: u32,
    pub data_offset: u32,
    pub ownership: LayoutOwnership,
    pub gc_desc: GcDesc,
    pub gc_desc_bytes: String,
    pub vtable: Vec<String>,
    pub interfaces: Vec<String>,
    pub methods: Vec<ArrayMethodSnapshot>,
}

#[derive(Debug)]
pub struct ArrayMethodTable {
    array_type: TypeHandle,
    element: TypeHandle,
    rank: u32,
    kind: ArrayKind,
    component_size: u32,
    base_size: u32,
    data_offset: u32,
    gc_desc: GcDesc,
    vtable: Arc<VirtualTable>,
    interfaces: Arc<InterfaceMap>,
    methods: Arc<[ArrayMethodDesc]>,
    ownership: LayoutOwnership,
}

impl ArrayMethodTable {
    pub fn id(&self) -> TypeId {
        self.array_type.id
    }

    pub fn name(&self) -> &str {
        &self.array_type.name
    }

    pub fn array_type(&self) -> &TypeHandle {
        &self.array_type
    }

    pub fn element(&self) -> &TypeHandle {
        &self.element
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn component_size(&self) -> u32 {
        self.component_size
    }

    /// Size of an empty instance including the object header.
    pub fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Offset of the first element from the object pointer.
    pub fn data_offset(&self) -> u32 {
        self.data_offset
    }

    pub fn gc_desc(&self) -> &GcDesc {
        &self.gc_desc
    }

    pub fn vtable(&self) -> &Arc<VirtualTable> {
        &self.vtable
    }

    pub fn interfaces(&self) -> &Arc<InterfaceMap> {
        &self.interfaces
    }

    pub fn methods(&self) -> &[ArrayMethodDesc] {
        &self.methods
    }

    pub fn method(&self, kind: ArrayMethodKind) -> Option<&ArrayMethodDesc> {
        self.methods.iter().find(|method| method.kind == kind)
    }

    pub fn constructors(&self) -> impl Iterator<Item = &ArrayMethodDesc> {
        self.methods
            .iter()
            .filter(|method| matches!(method.kind, ArrayMethodKind::Ctor { .. }))
    }

    pub fn ownership(&self) -> LayoutOwnership {
        self.ownership
    }

    /// Whether both tables dispatch through the same vtable instance.
    pub fn shares_layout_with(&self, other: &ArrayMethodTable) -> bool {
        Arc::ptr_eq(&self.vtable, &other.vtable)
    }

    pub fn instance_size(&self, element_count: u64) -> u64 {
        u64::from(self.base_size) + element_count * u64::from(self.component_size)
    }

    pub fn snapshot(&self) -> ArrayLayoutSnapshot {
        ArrayLayoutSnapshot {
            name: self.name().to_string(),
            element: self.element.name.clone(),
            rank: self.rank,
            kind: self.kind,
            component_size: self.component_size,
            base_size: self.base_size,
            data_offset: self.data_offset,
            ownership: self.ownership,
            gc_desc: self.gc_desc.clone(),
            gc_desc_bytes: hex(&self.gc_desc.encode()),
            vtable: self
                .vtable
                .slots
                .iter()
                .map(|slot| format!("{}::{}", slot.owner, slot.name))
                .collect(),
            interfaces: self
                .interfaces
                .entries
                .iter()
                .map(|entry| match entry.instantiation {
                    InterfaceInstantiation::NonGeneric => entry.name.to_string(),
                    InterfaceInstantiation::Exact(_) => {
                        format!("{}<{}>", entry.name, self.element.name)
                    }
                    InterfaceInstantiation::Canonical => format!("{}<__Canon>", entry.name),
                })
                .collect(),
            methods: self
                .methods
                .iter()
                .map(|method| ArrayMethodSnapshot {
                    name: method.name,
                    kind: method.kind,
                    attributes: method.kind.attributes(),
                    signature: hex(&method.signature),
                    body_ops: method.body.as_ref().map_or(0, |body| body.ops.len()),
                })
                .collect(),
        }
    }
}

type CacheKey = (TypeId, u32, ArrayKind);

pub struct ArrayTypeLoader {
    universe: Arc<TypeUniverse>,
    cache: RwLock<HashMap<CacheKey, Arc<ArrayMethodTable>>>,
}

impl ArrayTypeLoader {
    pub fn new(universe: Arc<TypeUniverse>) -> Self {
        Self {
            universe,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn universe(&self) -> &Arc<TypeUniverse> {
        &self.universe
    }

    /// Builds, or returns the cached, method table for an array of `element`.
    ///
    /// Concurrent first requests may each build a table; the first to reach
    /// the cache wins and the others are dropped.
    pub fn build_array_type(
        &self,
        element: &TypeHandle,
        rank: u32,
        kind: ArrayKind,
    ) -> Result<Arc<ArrayMethodTable>, TypeLoadError> {
        validate_rank(rank, kind)?;
        validate_element(element)?;
        let key = (element.id, rank, kind);
        if let Some(table) = self.cached(key) {
            return Ok(table);
        }
        if element.id == self.universe.object().id {
            return self.canonical_table(rank, kind);
        }
        let table = if self.shares_canonical(element) {
            self.alias_canonical(element, rank, kind)?
        } else {
            Arc::new(self.build_owned(element, rank, kind, false)?)
        };
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(key).or_insert(table).clone())
    }

    /// The `object` array table of this shape, which every shared reference
    /// array of the same kind and rank aliases. Built once per loader and
    /// kept for its lifetime.
    pub fn canonical_table(
        &self,
        rank: u32,
        kind: ArrayKind,
    ) -> Result<Arc<ArrayMethodTable>, TypeLoadError> {
        validate_rank(rank, kind)?;
        let object = self.universe.object();
        let key = (object.id, rank, kind);
        if let Some(table) = self.cached(key) {
            return Ok(table);
        }
        let built = Arc::new(self.build_owned(&object, rank, kind, true)?);
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(key).or_insert(built).clone())
    }

    pub fn canonical_object_vector(&self) -> Result<Arc<ArrayMethodTable>, TypeLoadError> {
        self.canonical_table(1, ArrayKind::Vector)
    }

    pub fn cached_count(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs a constructor of `table` with `args`. Vectors of vectors with
    /// more than one argument allocate every nested level.
    pub fn construct(&self, table: &Arc<ArrayMethodTable>, args: &[i64]) -> RtResult<ArrayObject> {
        let arity = args.len() as u32;
        if table.method(ArrayMethodKind::Ctor { arity }).is_none() {
            let expected = table
                .constructors()
                .filter_map(|ctor| match ctor.kind {
                    ArrayMethodKind::Ctor { arity } => Some(arity as usize),
                    _ => None,
                })
                .max()
                .unwrap_or_default();
            return Err(ArrayAccessFault::BadArguments {
                expected,
                got: args.len(),
            }
            .into());
        }
        if table.kind == ArrayKind::General {
            let rank = table.rank as usize;
            return if args.len() == rank {
                Ok(ArrayObject::new(table.clone(), args)?)
            } else {
                let bounds: Vec<(i64, i64)> =
                    args.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
                Ok(ArrayObject::with_bounds(table.clone(), &bounds)?)
            };
        }

        let mut array = ArrayObject::new(table.clone(), &args[..1])?;
        if args.len() > 1 {
            let TypeKind::Array {
                element: inner,
                rank,
                kind,
            } = table.element.kind
            else {
                return Err(ArrayAccessFault::BadArguments {
                    expected: 1,
                    got: args.len(),
                }
                .into());
            };
            let inner = self
                .universe
                .get(inner)
                .ok_or(TypeLoadError::InvalidElement { element: inner })?;
            let nested = self.build_array_type(&inner, rank, kind)?;
            let set = table
                .method(ArrayMethodKind::Set)
                .cloned()
                .ok_or(ArrayAccessFault::ArrayTypeMismatch)?;
            for index in 0..args[0] {
                let child = self.construct(&nested, &args[1..])?;
                let value = ElementValue::Ref(Some(ObjectRef::Array(Arc::new(child))));
                array.invoke(&set, &AccessorArgs::set([index], value), &self.universe)?;
            }
        }
        Ok(array)
    }

    pub fn invoke_accessor(
        &self,
        array: &mut ArrayObject,
        kind: ArrayMethodKind,
        args: &AccessorArgs,
    ) -> Result<AccessorOutcome, ArrayAccessFault> {
        let table = array.method_table().clone();
        let method = table.method(kind).ok_or(ArrayAccessFault::BadArguments {
            expected: table.rank() as usize,
            got: args.indices.len(),
        })?;
        array.invoke(method, args, &self.universe)
    }

    fn cached(&self, key: CacheKey) -> Option<Arc<ArrayMethodTable>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Nested vectors keep their own tables because their constructor count
    /// depends on the nesting depth.
    fn shares_canonical(&self, element: &TypeDesc) -> bool {
        element.is_reference() && element.id != self.universe.object().id && !element.is_vector()
    }

    fn alias_canonical(
        &self,
        element: &TypeHandle,
        rank: u32,
        kind: ArrayKind,
    ) -> Result<Arc<ArrayMethodTable>, TypeLoadError> {
        let canonical = self.canonical_table(rank, kind)?;
        let (data_offset, base_size) = layout_sizes(rank, kind);
        let component_size = element.storage_size();
        let gc_desc = GcDesc::for_array(element, data_offset, base_size, component_size)?;
        let array_type = self.universe.array_type(element, rank, kind);
        debug!(
            "{} {} aliases {}",
            Component::Layout,
            array_type.name,
            canonical.name()
        );
        Ok(Arc::new(ArrayMethodTable {
            array_type,
            element: element.clone(),
            rank,
            kind,
            component_size,
            base_size,
            data_offset,
            gc_desc,
            vtable: canonical.vtable.clone(),
            interfaces: canonical.interfaces.clone(),
            methods: canonical.methods.clone(),
            ownership: LayoutOwnership::AliasesCanonical,
        }))
    }

    fn build_owned(
        &self,
        element: &TypeHandle,
        rank: u32,
        kind: ArrayKind,
        canonical: bool,
    ) -> Result<ArrayMethodTable, TypeLoadError> {
        let component_size = element.storage_size();
        if component_size > MAX_COMPONENT_SIZE {
            return Err(TypeLoadError::ElementTooLarge {
                element: element.id,
                size: component_size,
            });
        }
        let (data_offset, base_size) = layout_sizes(rank, kind);
        let gc_desc = GcDesc::for_array(element, data_offset, base_size, component_size)?;
        let array_type = self.universe.array_type(element, rank, kind);
        let nesting = self.universe.vector_nesting_depth(&array_type);
        let methods = synthesize_methods(rank, kind, nesting, element.is_reference());
        debug!(
            "{} built {}: base {base_size}, component {component_size}, gc count {}, {} methods",
            Component::Layout,
            array_type.name,
            gc_desc.count(),
            methods.len()
        );
        Ok(ArrayMethodTable {
            array_type,
            element: element.clone(),
            rank,
            kind,
            component_size,
            base_size,
            data_offset,
            gc_desc,
            vtable: Arc::new(VirtualTable::for_arrays()),
            interfaces: Arc::new(InterfaceMap::for_array(element, kind, canonical)),
            methods: methods.into(),
            ownership: LayoutOwnership::Owns,
        })
    }
}

fn validate_rank(rank: u32, kind: ArrayKind) -> Result<(), TypeLoadError> {
    let valid = match kind {
        ArrayKind::Vector => rank == 1,
        ArrayKind::General => (1..=MAX_ARRAY_RANK).contains(&rank),
    };
    if valid {
        Ok(())
    } else {
        Err(TypeLoadError::InvalidRank { rank, kind })
    }
}

fn validate_element(element: &TypeDesc) -> Result<(), TypeLoadError> {
    let invalid = match &element.kind {
        TypeKind::Primitive(PrimitiveType::Void) => true,
        TypeKind::ValueType(layout) => layout.byref_like,
        _ => false,
    };
    if invalid {
        Err(TypeLoadError::InvalidElement {
            element: element.id,
        })
    } else {
        Ok(())
    }
}

/// Returns `(data_offset, base_size)` for the array shape.
fn layout_sizes(rank: u32, kind: ArrayKind) -> (u32, u32) {
    let data_offset = match kind {
        ArrayKind::Vector => VECTOR_DATA_OFFSET,
        ArrayKind::General => {
            ARRAY_BOUNDS_OFFSET + rank * ARRAY_BOUND_WORDS_PER_RANK * ARRAY_BOUND_WORD_SIZE
        }
    };
    (data_offset, data_offset + OBJ_HEADER_SIZE)
}

fn synthesize_methods(
    rank: u32,
    kind: ArrayKind,
    nesting: u32,
    element_is_reference: bool,
) -> Vec<ArrayMethodDesc> {
    let ctor_arities: Vec<u32> = match kind {
        ArrayKind::Vector => (1..=1 + nesting).collect(),
        ArrayKind::General => vec![rank, rank * 2],
    };
    let kinds = [
        ArrayMethodKind::Get,
        ArrayMethodKind::Set,
        ArrayMethodKind::Address,
    ]
    .into_iter()
    .chain(
        ctor_arities
            .into_iter()
            .map(|arity| ArrayMethodKind::Ctor { arity }),
    );
    kinds
        .map(|method| ArrayMethodDesc {
            kind: method,
            name: method_name(method),
            signature: method_signature(method, rank),
            body: AccessorBody::generate(method, rank, kind, element_is_reference),
        })
        .collect()
}

fn method_name(kind: ArrayMethodKind) -> &'static str {
    match kind {
        ArrayMethodKind::Get => "Get",
        ArrayMethodKind::Set => "Set",
        ArrayMethodKind::Address => "Address",
        ArrayMethodKind::Ctor { .. } => ".ctor",
    }
}

/// Element positions are written as class type variable 0 so one blob is
/// valid for every instantiation sharing the method.
fn method_signature(kind: ArrayMethodKind, rank: u32) -> Vec<u8> {
    let compressed = |value| SignatureBuilder::compressed_len(value);
    let index_bytes = rank as usize;
    match kind {
        ArrayMethodKind::Get => {
            let mut sig =
                SignatureBuilder::with_predicted_len(1 + compressed(rank) + 2 + index_bytes);
            sig.calling_convention(CALLCONV_HASTHIS)
                .compressed(rank)
                .type_var(0)
                .elements(ELEMENT_TYPE_I4, rank);
            sig.finish()
        }
        ArrayMethodKind::Set => {
            let mut sig =
                SignatureBuilder::with_predicted_len(1 + compressed(rank + 1) + 1 + index_bytes + 2);
            sig.calling_convention(CALLCONV_HASTHIS)
                .compressed(rank + 1)
                .element(ELEMENT_TYPE_VOID)
                .elements(ELEMENT_TYPE_I4, rank)
                .type_var(0);
            sig.finish()
        }
        ArrayMethodKind::Address => {
            let mut sig =
                SignatureBuilder::with_predicted_len(1 + compressed(rank) + 3 + index_bytes);
            sig.calling_convention(CALLCONV_HASTHIS)
                .compressed(rank)
                .by_ref()
                .type_var(0)
                .elements(ELEMENT_TYPE_I4, rank);
            sig.finish()
        }
        ArrayMethodKind::Ctor { arity } => {
            let mut sig =
                SignatureBuilder::with_predicted_len(1 + compressed(arity) + 1 + arity as usize);
            sig.calling_convention(CALLCONV_HASTHIS)
                .compressed(arity)
                .element(ELEMENT_TYPE_VOID)
                .elements(ELEMENT_TYPE_I4, arity);
            sig.finish()
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
