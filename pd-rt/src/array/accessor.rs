//! Synthesized bodies for array `Get`, `Set` and `Address`, plus a small
//! interpreter that runs them against an [`ArrayObject`].

use std::sync::Arc;

use serde::Serialize;

use super::{ArrayKind, ArrayMethodDesc, ArrayMethodKind, ArrayMethodTable};
use crate::error::ArrayAccessFault;
use crate::types::{PrimitiveType, TypeId, TypeKind, TypeUniverse};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessorOp {
    LoadIndex(u8),
    LoadConst(i64),
    /// Total element count.
    LoadLength,
    LoadDimLength(u8),
    LoadLowerBound(u8),
    StoreLocal(u8),
    LoadLocal(u8),
    Add,
    Sub,
    Mul,
    /// Pops `length` then `index`; jumps when `index` is not below `length`
    /// as an unsigned compare.
    BranchIfOutOfRange(u16),
    /// Pops a flat element index, pushes that element's byte offset.
    ElementAddress,
    /// Faults unless the hidden type token, when one is passed, names the
    /// element type exactly.
    CheckTypeToken,
    /// Covariant store check of the value argument.
    StoreCheck,
    ReturnElement,
    ReturnAddress,
    StoreElement,
    ThrowIndexOutOfRange,
}

const LOCAL_INDEX: u8 = 0;
const LOCAL_TOTAL: u8 = 1;
const LOCAL_COUNT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessorBody {
    pub ops: Vec<AccessorOp>,
}

impl AccessorBody {
    /// Builds the body of `method` on a `rank` array. Returns `None` for
    /// constructors, which the allocator implements directly.
    pub fn generate(
        method: ArrayMethodKind,
        rank: u32,
        kind: ArrayKind,
        element_is_reference: bool,
    ) -> Option<Self> {
        if matches!(method, ArrayMethodKind::Ctor { .. }) {
            return None;
        }
        let mut ops = Vec::new();
        if method == ArrayMethodKind::Address && element_is_reference {
            ops.push(AccessorOp::CheckTypeToken);
        }
        let mut throw_fixups = Vec::new();
        if kind == ArrayKind::Vector {
            ops.push(AccessorOp::LoadIndex(0));
            ops.push(AccessorOp::LoadLength);
            throw_fixups.push(ops.len());
            ops.push(AccessorOp::BranchIfOutOfRange(0));
            ops.push(AccessorOp::LoadIndex(0));
        } else {
            ops.push(AccessorOp::LoadConst(0));
            ops.push(AccessorOp::StoreLocal(LOCAL_TOTAL));
            for dim in 0..rank as u8 {
                ops.push(AccessorOp::LoadIndex(dim));
                ops.push(AccessorOp::LoadLowerBound(dim));
                ops.push(AccessorOp::Sub);
                ops.push(AccessorOp::StoreLocal(LOCAL_INDEX));
                ops.push(AccessorOp::LoadLocal(LOCAL_INDEX));
                ops.push(AccessorOp::LoadDimLength(dim));
                throw_fixups.push(ops.len());
                ops.push(AccessorOp::BranchIfOutOfRange(0));
                ops.push(AccessorOp::LoadLocal(LOCAL_TOTAL));
                ops.push(AccessorOp::LoadDimLength(dim));
                ops.push(AccessorOp::Mul);
                ops.push(AccessorOp::LoadLocal(LOCAL_INDEX));
                ops.push(AccessorOp::Add);
                ops.push(AccessorOp::StoreLocal(LOCAL_TOTAL));
            }
            ops.push(AccessorOp::LoadLocal(LOCAL_TOTAL));
        }
        ops.push(AccessorOp::ElementAddress);
        match method {
            ArrayMethodKind::Get => ops.push(AccessorOp::ReturnElement),
            ArrayMethodKind::Address => ops.push(AccessorOp::ReturnAddress),
            ArrayMethodKind::Set => {
                if element_is_reference {
                    ops.push(AccessorOp::StoreCheck);
                }
                ops.push(AccessorOp::StoreElement);
            }
            ArrayMethodKind::Ctor { .. } => return None,
        }
        let throw_at = ops.len() as u16;
        ops.push(AccessorOp::ThrowIndexOutOfRange);
        for fixup in throw_fixups {
            ops[fixup] = AccessorOp::BranchIfOutOfRange(throw_at);
        }
        Some(Self { ops })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ElementValue {
    Int(i64),
    Float(f64),
    Ref(Option<ObjectRef>),
    Struct(Vec<ElementValue>),
}

impl ElementValue {
    pub const NULL: ElementValue = ElementValue::Ref(None);

    fn default_for(kind: &TypeKind) -> Self {
        match kind {
            TypeKind::Primitive(primitive) if primitive.is_floating() => ElementValue::Float(0.0),
            TypeKind::Primitive(_) => ElementValue::Int(0),
            TypeKind::ValueType(_) => ElementValue::Struct(Vec::new()),
            _ => ElementValue::NULL,
        }
    }
}

/// A reference stored in an array slot. Only the exact type matters for
/// store checks.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectRef {
    Object { type_id: TypeId, id: u64 },
    Array(Arc<ArrayObject>),
}

impl ObjectRef {
    pub fn object(type_id: TypeId, id: u64) -> Self {
        ObjectRef::Object { type_id, id }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            ObjectRef::Object { type_id, .. } => *type_id,
            ObjectRef::Array(array) => array.method_table.id(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessorArgs {
    pub indices: Vec<i64>,
    pub value: Option<ElementValue>,
    pub type_token: Option<TypeId>,
}

impl AccessorArgs {
    pub fn get(indices: impl Into<Vec<i64>>) -> Self {
        Self {
            indices: indices.into(),
            ..Self::default()
        }
    }

    pub fn set(indices: impl Into<Vec<i64>>, value: ElementValue) -> Self {
        Self {
            indices: indices.into(),
            value: Some(value),
            type_token: None,
        }
    }

    pub fn with_type_token(mut self, token: TypeId) -> Self {
        self.type_token = Some(token);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AccessorOutcome {
    Value(ElementValue),
    Stored,
    /// Byte offset of the element relative to the object pointer.
    Address(u64),
}

/// An array instance: method table, dimension words and element storage.
#[derive(Clone, Debug)]
pub struct ArrayObject {
    method_table: Arc<ArrayMethodTable>,
    lengths: Vec<u32>,
    lower_bounds: Vec<i32>,
    elements: Vec<ElementValue>,
}

impl PartialEq for ArrayObject {
    fn eq(&self, other: &Self) -> bool {
        self.method_table.id() == other.method_table.id()
            && self.lengths == other.lengths
            && self.lower_bounds == other.lower_bounds
            && self.elements == other.elements
    }
}

impl ArrayObject {
    /// Allocates with zero lower bounds.
    pub fn new(method_table: Arc<ArrayMethodTable>, lengths: &[i64]) -> Result<Self, ArrayAccessFault> {
        let bounds: Vec<(i64, i64)> = lengths.iter().map(|len| (0, *len)).collect();
        Self::with_bounds(method_table, &bounds)
    }

    /// Allocates from `(lower_bound, length)` pairs, one per dimension.
    pub fn with_bounds(
        method_table: Arc<ArrayMethodTable>,
        bounds: &[(i64, i64)],
    ) -> Result<Self, ArrayAccessFault> {
        if bounds.len() != method_table.rank() as usize {
            return Err(ArrayAccessFault::BadArguments {
                expected: method_table.rank() as usize,
                got: bounds.len(),
            });
        }
        let mut lengths = Vec::with_capacity(bounds.len());
        let mut lower_bounds = Vec::with_capacity(bounds.len());
        let mut total: u64 = 1;
        for &(lower, length) in bounds {
            let length = u32::try_from(length).map_err(|_| ArrayAccessFault::Overflow)?;
            let lower = i32::try_from(lower).map_err(|_| ArrayAccessFault::Overflow)?;
            if method_table.kind() == ArrayKind::Vector && lower != 0 {
                return Err(ArrayAccessFault::IndexOutOfRange);
            }
            total = total
                .checked_mul(u64::from(length))
                .filter(|total| *total <= u64::from(u32::MAX))
                .ok_or(ArrayAccessFault::Overflow)?;
            lengths.push(length);
            lower_bounds.push(lower);
        }
        let fill = ElementValue::default_for(&method_table.element().kind);
        Ok(Self {
            elements: vec![fill; total as usize],
            method_table,
            lengths,
            lower_bounds,
        })
    }

    pub fn method_table(&self) -> &Arc<ArrayMethodTable> {
        &self.method_table
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn lengths(&self) -> &[u32] {
        &self.lengths
    }

    pub fn lower_bounds(&self) -> &[i32] {
        &self.lower_bounds
    }

    pub fn elements(&self) -> &[ElementValue] {
        &self.elements
    }

    /// Total size of the instance including its object header.
    pub fn object_size(&self) -> u64 {
        u64::from(self.method_table.base_size())
            + self.elements.len() as u64 * u64::from(self.method_table.component_size())
    }

    /// Runs `method`'s accessor body with `args`, raising the fault a managed
    /// caller would observe.
    pub fn invoke(
        &mut self,
        method: &ArrayMethodDesc,
        args: &AccessorArgs,
        universe: &TypeUniverse,
    ) -> Result<AccessorOutcome, ArrayAccessFault> {
        let Some(body) = method.body() else {
            return Err(ArrayAccessFault::BadArguments {
                expected: 0,
                got: args.indices.len(),
            });
        };
        let rank = self.method_table.rank() as usize;
        if args.indices.len() != rank {
            return Err(ArrayAccessFault::BadArguments {
                expected: rank,
                got: args.indices.len(),
            });
        }
        if method.kind() == ArrayMethodKind::Set && args.value.is_none() {
            return Err(ArrayAccessFault::BadArguments {
                expected: rank + 1,
                got: rank,
            });
        }

        let mut stack: Vec<i64> = Vec::with_capacity(4);
        let mut locals = [0i64; LOCAL_COUNT];
        let mut pc = 0usize;
        while let Some(op) = body.ops.get(pc) {
            pc += 1;
            match *op {
                AccessorOp::LoadIndex(dim) => stack.push(args.indices[dim as usize]),
                AccessorOp::LoadConst(value) => stack.push(value),
                AccessorOp::LoadLength => stack.push(self.elements.len() as i64),
                AccessorOp::LoadDimLength(dim) => {
                    stack.push(i64::from(self.lengths[dim as usize]))
                }
                AccessorOp::LoadLowerBound(dim) => {
                    stack.push(i64::from(self.lower_bounds[dim as usize]))
                }
                AccessorOp::StoreLocal(slot) => locals[slot as usize] = pop(&mut stack),
                AccessorOp::LoadLocal(slot) => stack.push(locals[slot as usize]),
                AccessorOp::Add => binary(&mut stack, i64::wrapping_add),
                AccessorOp::Sub => binary(&mut stack, i64::wrapping_sub),
                AccessorOp::Mul => binary(&mut stack, i64::wrapping_mul),
                AccessorOp::BranchIfOutOfRange(target) => {
                    let length = pop(&mut stack);
                    let index = pop(&mut stack);
                    if index as u64 >= length as u64 {
                        pc = target as usize;
                    }
                }
                AccessorOp::ElementAddress => {
                    let index = pop(&mut stack);
                    let offset = i64::from(self.method_table.data_offset())
                        + index * i64::from(self.method_table.component_size());
                    stack.push(offset);
                }
                AccessorOp::CheckTypeToken => {
                    if args
                        .type_token
                        .is_some_and(|token| token != self.method_table.element().id)
                    {
                        return Err(ArrayAccessFault::TypeMismatch);
                    }
                }
                AccessorOp::StoreCheck => {
                    if let Some(ElementValue::Ref(Some(value))) = &args.value {
                        let element = self.method_table.element().id;
                        let exact = value.type_id();
                        if exact != element && !universe.is_assignable(exact, element) {
                            return Err(ArrayAccessFault::ArrayTypeMismatch);
                        }
                    }
                }
                AccessorOp::ReturnElement => {
                    let slot = self.slot_of(pop(&mut stack));
                    return Ok(AccessorOutcome::Value(self.elements[slot].clone()));
                }
                AccessorOp::ReturnAddress => {
                    return Ok(AccessorOutcome::Address(pop(&mut stack) as u64));
                }
                AccessorOp::StoreElement => {
                    let slot = self.slot_of(pop(&mut stack));
                    let value = args.value.clone().unwrap_or(ElementValue::NULL);
                    if !self.value_fits(&value) {
                        return Err(ArrayAccessFault::ArrayTypeMismatch);
                    }
                    self.elements[slot] = value;
                    return Ok(AccessorOutcome::Stored);
                }
                AccessorOp::ThrowIndexOutOfRange => {
                    return Err(ArrayAccessFault::IndexOutOfRange);
                }
            }
        }
        Err(ArrayAccessFault::BadArguments {
            expected: rank,
            got: args.indices.len(),
        })
    }

    fn slot_of(&self, offset: i64) -> usize {
        let data = i64::from(self.method_table.data_offset());
        let size = i64::from(self.method_table.component_size()).max(1);
        ((offset - data) / size) as usize
    }

    fn value_fits(&self, value: &ElementValue) -> bool {
        match (&self.method_table.element().kind, value) {
            (TypeKind::Primitive(PrimitiveType::R4 | PrimitiveType::R8), ElementValue::Float(_)) => {
                true
            }
            (TypeKind::Primitive(primitive), ElementValue::Int(_)) => !primitive.is_floating(),
            (TypeKind::ValueType(_), ElementValue::Struct(_)) => true,
            (_, ElementValue::Ref(_)) => self.method_table.element().is_reference(),
            _ => false,
        }
    }
}

fn pop(stack: &mut Vec<i64>) -> i64 {
    stack.pop().unwrap_or_default()
}

fn binary(stack: &mut Vec<i64>, op: fn(i64, i64) -> i64) {
    let rhs = pop(stack);
    let lhs = pop(stack);
    stack.push(op(lhs, rhs));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_get_is_a_single_bounds_check() {
        let body = AccessorBody::generate(ArrayMethodKind::Get, 1, ArrayKind::Vector, false)
            .expect("body");
        assert_eq!(
            body.ops,
            vec![
                AccessorOp::LoadIndex(0),
                AccessorOp::LoadLength,
                AccessorOp::BranchIfOutOfRange(6),
                AccessorOp::LoadIndex(0),
                AccessorOp::ElementAddress,
                AccessorOp::ReturnElement,
                AccessorOp::ThrowIndexOutOfRange,
            ]
        );
    }

    #[test]
    fn general_bodies_check_every_dimension() {
        let body = AccessorBody::generate(ArrayMethodKind::Set, 3, ArrayKind::General, true)
            .expect("body");
        let checks = body
            .ops
            .iter()
            .filter(|op| matches!(op, AccessorOp::BranchIfOutOfRange(_)))
            .count();
        assert_eq!(checks, 3);
        let throw_at = body.ops.len() as u16 - 1;
        assert!(body
            .ops
            .iter()
            .filter_map(|op| match op {
                AccessorOp::BranchIfOutOfRange(target) => Some(*target),
                _ => None,
            })
            .all(|target| target == throw_at));
        assert!(body.ops.contains(&AccessorOp::StoreCheck));
    }

    #[test]
    fn address_on_reference_arrays_checks_the_type_token() {
        let refs = AccessorBody::generate(ArrayMethodKind::Address, 1, ArrayKind::Vector, true)
            .expect("body");
        assert_eq!(refs.ops[0], AccessorOp::CheckTypeToken);
        let values = AccessorBody::generate(ArrayMethodKind::Address, 1, ArrayKind::Vector, false)
            .expect("body");
        assert!(!values.ops.contains(&AccessorOp::CheckTypeToken));
        assert!(
            AccessorBody::generate(ArrayMethodKind::Ctor { arity: 1 }, 1, ArrayKind::Vector, true)
                .is_none()
        );
    }
}
