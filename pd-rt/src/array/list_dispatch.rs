//! Generic list interfaces on vectors.
//!
//! Vectors implement `IList<T>` and its relatives without carrying the
//! methods in their own tables. A call through one of those interfaces is
//! routed to a shared helper instantiated over the element type.

use serde::Serialize;

use super::{ArrayKind, ArrayMethodTable};
use crate::types::{TypeId, TypeUniverse};

/// Helper methods in the order the interfaces declare them. Each interface
/// starts at a fixed index determined by how many generic interfaces it
/// inherits from.
const LIST_HELPERS: [&str; 13] = [
    "GetEnumerator",
    "get_Count",
    "get_IsReadOnly",
    "Add",
    "Clear",
    "Contains",
    "CopyTo",
    "Remove",
    "get_Item",
    "set_Item",
    "IndexOf",
    "Insert",
    "RemoveAt",
];

/// `(name, first helper, method count)`.
const VECTOR_LIST_INTERFACES: [(&str, usize, u32); 5] = [
    ("IEnumerable`1", 0, 1),
    ("ICollection`1", 1, 7),
    ("IReadOnlyCollection`1", 1, 1),
    ("IList`1", 8, 5),
    ("IReadOnlyList`1", 8, 1),
];

const GET_ENUMERATOR: usize = 0;

/// Whether `interface` is one a vector implements implicitly.
pub fn is_implicit_vector_interface(interface: &str) -> bool {
    VECTOR_LIST_INTERFACES
        .iter()
        .any(|(name, _, _)| *name == interface)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListHelperCall {
    pub helper: &'static str,
    /// Reference elements collapse to `object` for everything but
    /// `GetEnumerator`, whose enumerator type is observable.
    pub type_arg: TypeId,
}

/// Resolves slot `slot` of `interface` on a vector to the helper that
/// implements it. `None` when the table is not a vector, the interface is
/// not one vectors implement or the slot is past the interface's methods.
pub fn resolve_list_method(
    universe: &TypeUniverse,
    table: &ArrayMethodTable,
    interface: &str,
    slot: u32,
) -> Option<ListHelperCall> {
    if table.kind() != ArrayKind::Vector {
        return None;
    }
    let (_, first, count) = VECTOR_LIST_INTERFACES
        .iter()
        .find(|(name, _, _)| *name == interface)?;
    if slot >= *count {
        return None;
    }
    let index = first + slot as usize;
    let element = table.element();
    let type_arg = if index != GET_ENUMERATOR && element.is_reference() {
        universe.object().id
    } else {
        element.id
    };
    Some(ListHelperCall {
        helper: LIST_HELPERS[index],
        type_arg,
    })
}
