use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BlockId, ThrowKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddCodeKey {
    pub kind: ThrowKind,
    pub region: u32,
}

/// A shared block that raises one kind of runtime exception for every fault
/// site of that kind in a region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCodeDsc {
    pub kind: ThrowKind,
    #[serde(default)]
    pub region: u32,
    pub dest: BlockId,
    #[serde(default)]
    pub used: bool,
    /// Outgoing stack depth shared by every site reaching the target. Only
    /// tracked when arguments are pushed.
    #[serde(default)]
    pub stack_depth: Option<u32>,
    #[serde(default)]
    pub materialized: bool,
}

impl AddCodeDsc {
    pub fn new(kind: ThrowKind, region: u32, dest: BlockId) -> Self {
        Self {
            kind,
            region,
            dest,
            used: false,
            stack_depth: None,
            materialized: false,
        }
    }

    pub fn key(&self) -> AddCodeKey {
        AddCodeKey {
            kind: self.kind,
            region: self.region,
        }
    }
}

/// Exception targets ordered by key, so iteration is stable across runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddCodeMap {
    entries: BTreeMap<AddCodeKey, AddCodeDsc>,
}

impl AddCodeMap {
    pub fn insert(&mut self, kind: ThrowKind, region: u32, dest: BlockId) {
        self.insert_dsc(AddCodeDsc::new(kind, region, dest));
    }

    pub fn insert_dsc(&mut self, dsc: AddCodeDsc) {
        self.entries.insert(dsc.key(), dsc);
    }

    pub fn get(&self, key: AddCodeKey) -> Option<&AddCodeDsc> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: AddCodeKey) -> Option<&mut AddCodeDsc> {
        self.entries.get_mut(&key)
    }

    pub fn remove(&mut self, key: AddCodeKey) -> Option<AddCodeDsc> {
        self.entries.remove(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddCodeDsc> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AddCodeDsc> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
