//! The slice of the JIT backend IR the stack-level pass runs over.
//!
//! A method is a list of basic blocks in layout order, each holding nodes in
//! execution order. Only node shapes that push outgoing arguments, consume
//! them, or may raise a runtime exception are distinguished.

use std::collections::HashSet;

use rt_abi::{
    THROW_ARGUMENT, THROW_ARITHMETIC, THROW_DIV_BY_ZERO, THROW_INDEX, THROW_NULL_CHECK,
    THROW_OVERFLOW, THROW_RANGE_CHECK, ThrowHelper,
};
use serde::{Deserialize, Serialize};

use crate::error::StackLevelError;

mod add_code;
mod stack_level;

pub use add_code::{AddCodeDsc, AddCodeKey, AddCodeMap};
pub use stack_level::{StackLevelOptions, StackLevelReport, run_stack_level_pass};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockId(pub u32);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThrowKind {
    RangeCheck,
    Argument,
    Index,
    Overflow,
    Arithmetic,
    DivByZero,
    NullCheck,
}

impl ThrowKind {
    pub fn helper(self) -> &'static ThrowHelper {
        let index = match self {
            ThrowKind::RangeCheck => THROW_RANGE_CHECK,
            ThrowKind::Argument => THROW_ARGUMENT,
            ThrowKind::Index => THROW_INDEX,
            ThrowKind::Overflow => THROW_OVERFLOW,
            ThrowKind::Arithmetic => THROW_ARITHMETIC,
            ThrowKind::DivByZero => THROW_DIV_BY_ZERO,
            ThrowKind::NullCheck => THROW_NULL_CHECK,
        };
        &rt_abi::THROW_HELPERS[index as usize]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeKind {
    Other,
    /// Pushes one outgoing stack argument of `slots` pointer-sized slots.
    PutArgStk { slots: u32 },
    /// Consumes the listed `PutArgStk` nodes.
    Call {
        #[serde(default)]
        stack_args: Vec<NodeId>,
    },
    BoundsCheck { kind: ThrowKind },
    CheckedArith,
    CkFinite,
    Div {
        #[serde(default)]
        may_div_by_zero: bool,
        #[serde(default)]
        may_overflow: bool,
    },
    /// Vectorized integer division, which checks for both zero divisors and
    /// `MIN / -1`.
    VectorIntDiv,
    NullCheck,
    /// Call to the shared throw helper, emitted into an exception target.
    ThrowHelperCall { kind: ThrowKind },
}

impl NodeKind {
    /// Exception targets a node of this kind may jump to.
    pub fn throw_kinds(&self) -> Vec<ThrowKind> {
        match self {
            NodeKind::BoundsCheck { kind } => vec![*kind],
            NodeKind::CheckedArith => vec![ThrowKind::Overflow],
            NodeKind::CkFinite => vec![ThrowKind::Arithmetic],
            NodeKind::Div {
                may_div_by_zero,
                may_overflow,
            } => {
                let mut kinds = Vec::new();
                if *may_div_by_zero {
                    kinds.push(ThrowKind::DivByZero);
                }
                if *may_overflow {
                    kinds.push(ThrowKind::Arithmetic);
                }
                kinds
            }
            NodeKind::VectorIntDiv => vec![ThrowKind::DivByZero, ThrowKind::Overflow],
            NodeKind::NullCheck => vec![ThrowKind::NullCheck],
            NodeKind::Other
            | NodeKind::PutArgStk { .. }
            | NodeKind::Call { .. }
            | NodeKind::ThrowHelperCall { .. } => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Protected region the block belongs to; exception targets are shared
    /// per kind within a region.
    #[serde(default)]
    pub region: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcEncoding {
    #[default]
    FullyInterruptible,
    PartiallyInterruptible,
}

/// Serialized form of a method handed to the pass by tools and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescription {
    #[serde(default)]
    pub name: String,
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub add_codes: Vec<AddCodeDsc>,
    #[serde(default)]
    pub gc_encoding: GcEncoding,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodBody {
    pub name: String,
    pub blocks: Vec<BasicBlock>,
    pub add_codes: AddCodeMap,
    pub frame_pointer_required: bool,
    pub gc_encoding: GcEncoding,
    next_node: u32,
}

impl MethodBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds a body from its description, rejecting exception targets
    /// that name blocks the method does not have.
    pub fn from_description(description: MethodDescription) -> Result<Self, StackLevelError> {
        let blocks: HashSet<BlockId> = description.blocks.iter().map(|block| block.id).collect();
        let mut add_codes = AddCodeMap::default();
        for dsc in description.add_codes {
            if !blocks.contains(&dsc.dest) {
                return Err(StackLevelError::UnknownBlock(dsc.dest));
            }
            add_codes.insert_dsc(dsc);
        }
        let next_node = description
            .blocks
            .iter()
            .flat_map(|block| block.nodes.iter().map(|node| node.id.0 + 1))
            .max()
            .unwrap_or_default();
        Ok(Self {
            name: description.name,
            blocks: description.blocks,
            add_codes,
            frame_pointer_required: false,
            gc_encoding: description.gc_encoding,
            next_node,
        })
    }

    pub fn add_block(&mut self, region: u32) -> BlockId {
        let id = BlockId(
            self.blocks
                .iter()
                .map(|block| block.id.0 + 1)
                .max()
                .unwrap_or_default(),
        );
        self.blocks.push(BasicBlock {
            id,
            region,
            nodes: Vec::new(),
        });
        id
    }

    /// Appends a node to `block`. Unknown blocks are ignored and still
    /// consume an id.
    pub fn push(&mut self, block: BlockId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        if let Some(target) = self.block_mut(block) {
            target.nodes.push(Node { id, kind });
        }
        id
    }

    pub fn add_code(&mut self, kind: ThrowKind, region: u32, dest: BlockId) {
        self.add_codes.insert(kind, region, dest);
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|block| block.id == id)
    }

    pub fn remove_block(&mut self, id: BlockId) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|block| block.id != id);
        self.blocks.len() != before
    }

    pub(crate) fn next_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throw_kinds_map_to_abi_helpers() {
        assert_eq!(ThrowKind::RangeCheck.helper().index, THROW_RANGE_CHECK);
        assert_eq!(ThrowKind::DivByZero.helper().index, THROW_DIV_BY_ZERO);
        assert_eq!(
            NodeKind::Div {
                may_div_by_zero: true,
                may_overflow: true
            }
            .throw_kinds(),
            vec![ThrowKind::DivByZero, ThrowKind::Arithmetic]
        );
        assert!(NodeKind::PutArgStk { slots: 2 }.throw_kinds().is_empty());
    }

    #[test]
    fn descriptions_deserialize_with_tagged_nodes() {
        let json = r#"{
            "name": "Sum",
            "blocks": [
                {"id": 0, "nodes": [
                    {"id": 1, "op": "put_arg_stk", "slots": 2},
                    {"id": 2, "op": "bounds_check", "kind": "range_check"},
                    {"id": 3, "op": "call", "stack_args": [1]}
                ]},
                {"id": 7}
            ],
            "add_codes": [{"kind": "range_check", "region": 0, "dest": 7}]
        }"#;
        let description: MethodDescription = serde_json::from_str(json).expect("parse");
        let mut body = MethodBody::from_description(description).expect("body");
        assert_eq!(body.blocks[0].nodes[0].kind, NodeKind::PutArgStk { slots: 2 });
        assert_eq!(
            body.blocks[0].nodes[2].kind,
            NodeKind::Call {
                stack_args: vec![NodeId(1)]
            }
        );
        assert_eq!(body.next_node_id(), NodeId(4));
    }

    #[test]
    fn exception_targets_must_name_existing_blocks() {
        let description = MethodDescription {
            name: "Bad".to_string(),
            blocks: vec![BasicBlock {
                id: BlockId(0),
                region: 0,
                nodes: Vec::new(),
            }],
            add_codes: vec![AddCodeDsc::new(ThrowKind::Overflow, 0, BlockId(5))],
            gc_encoding: GcEncoding::default(),
        };
        assert_eq!(
            MethodBody::from_description(description),
            Err(StackLevelError::UnknownBlock(BlockId(5)))
        );
    }
}
