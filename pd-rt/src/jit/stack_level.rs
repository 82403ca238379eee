//! Outgoing-argument stack accounting and throw-helper liveness.
//!
//! Blocks are walked last node first. A call is met before the `PutArgStk`
//! nodes that feed it, so scanning the call raises the level by the slots of
//! its stack arguments and each `PutArgStk` lowers it again. The level seen
//! at a faulting node is therefore the number of slots pushed ahead of it,
//! which is the depth its exception target must be entered with.

use std::collections::HashMap;

use rt_abi::MAX_PTR_ARG_COUNT;
use serde::Serialize;
use tracing::{debug, warn};

use super::{AddCodeKey, BasicBlock, BlockId, GcEncoding, MethodBody, Node, NodeId, NodeKind};
use crate::config::RuntimeConfig;
use crate::error::StackLevelError;
use crate::logging::Component;

/// Pushed-argument depth at which an esp-relative frame can no longer
/// describe the stack.
const MAX_ESP_FRAME_PUSHED_ARGS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StackLevelOptions {
    pub optimize: bool,
    pub fixed_outgoing_area: bool,
}

impl From<&RuntimeConfig> for StackLevelOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            optimize: config.optimize,
            fixed_outgoing_area: config.fixed_outgoing_area,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StackLevelReport {
    pub method: String,
    pub peak_stack_level: u32,
    pub frame_pointer_required: bool,
    pub gc_encoding: GcEncoding,
    pub used: Vec<AddCodeKey>,
    pub removed_blocks: Vec<BlockId>,
    pub materialized: Vec<AddCodeKey>,
}

/// Runs the pass over every block of `body`, then prunes or materializes
/// exception targets.
///
/// An unbalanced block aborts the pass and leaves `body` partially updated;
/// the method must not be emitted.
pub fn run_stack_level_pass(
    body: &mut MethodBody,
    options: &StackLevelOptions,
) -> Result<StackLevelReport, StackLevelError> {
    if let Some(missing) = body
        .add_codes
        .iter()
        .map(|dsc| dsc.dest)
        .find(|dest| body.block(*dest).is_none())
    {
        return Err(StackLevelError::UnknownBlock(missing));
    }

    let mut setter = StackLevelSetter {
        track_levels: !options.fixed_outgoing_area,
        current: 0,
        peak: 0,
        pending: HashMap::new(),
        frame_pointer_required: body.frame_pointer_required,
    };
    for block in &body.blocks {
        setter.process_block(block, &mut body.add_codes)?;
    }

    let mut report = StackLevelReport {
        method: body.name.clone(),
        peak_stack_level: setter.peak,
        ..StackLevelReport::default()
    };

    if !options.optimize {
        for dsc in body.add_codes.iter_mut() {
            dsc.used = true;
        }
    }
    let unused: Vec<(AddCodeKey, BlockId)> = body
        .add_codes
        .iter()
        .filter(|dsc| !dsc.used)
        .map(|dsc| (dsc.key(), dsc.dest))
        .collect();
    for (key, dest) in unused {
        body.add_codes.remove(key);
        if body.remove_block(dest) {
            debug!(
                "{} {}: removed unused {:?} target {:?}",
                Component::Jit,
                body.name,
                key.kind,
                dest
            );
            report.removed_blocks.push(dest);
        }
    }

    let to_materialize: Vec<(AddCodeKey, BlockId)> = body
        .add_codes
        .iter()
        .filter(|dsc| dsc.used && !dsc.materialized)
        .map(|dsc| (dsc.key(), dsc.dest))
        .collect();
    for (key, dest) in to_materialize {
        let id = body.next_node_id();
        if let Some(block) = body.block_mut(dest) {
            block.nodes.push(Node {
                id,
                kind: NodeKind::ThrowHelperCall { kind: key.kind },
            });
        }
        if let Some(dsc) = body.add_codes.get_mut(key) {
            dsc.materialized = true;
        }
        report.materialized.push(key);
    }
    report.used = body.add_codes.iter().map(|dsc| dsc.key()).collect();

    if setter.peak >= MAX_PTR_ARG_COUNT {
        warn!(
            "{} {}: {} pushed argument slots, using partially interruptible encoding",
            Component::Jit,
            body.name,
            setter.peak
        );
        body.gc_encoding = GcEncoding::PartiallyInterruptible;
    }
    if setter.peak >= MAX_ESP_FRAME_PUSHED_ARGS {
        setter.frame_pointer_required = true;
    }
    body.frame_pointer_required = setter.frame_pointer_required;

    report.frame_pointer_required = body.frame_pointer_required;
    report.gc_encoding = body.gc_encoding;
    debug!(
        "{} {}: peak {} slots, {} targets used, {} removed, frame pointer {}",
        Component::Jit,
        body.name,
        report.peak_stack_level,
        report.used.len(),
        report.removed_blocks.len(),
        report.frame_pointer_required
    );
    Ok(report)
}

struct StackLevelSetter {
    track_levels: bool,
    current: u32,
    peak: u32,
    /// Slots of stack arguments whose call has been scanned but whose
    /// `PutArgStk` has not.
    pending: HashMap<NodeId, u32>,
    frame_pointer_required: bool,
}

impl StackLevelSetter {
    fn process_block(
        &mut self,
        block: &BasicBlock,
        add_codes: &mut super::AddCodeMap,
    ) -> Result<(), StackLevelError> {
        if self.current != 0 {
            return Err(StackLevelError::Unbalanced {
                block: block.id,
                level: self.current,
            });
        }
        let arg_slots: HashMap<NodeId, u32> = block
            .nodes
            .iter()
            .filter_map(|node| match node.kind {
                NodeKind::PutArgStk { slots } => Some((node.id, slots)),
                _ => None,
            })
            .collect();

        for node in block.nodes.iter().rev() {
            match &node.kind {
                NodeKind::Call { stack_args } if self.track_levels => {
                    for arg in stack_args {
                        let slots = arg_slots.get(arg).copied().ok_or(
                            StackLevelError::MissingArgument {
                                block: block.id,
                                call: node.id.0,
                                arg: arg.0,
                            },
                        )?;
                        self.pending.insert(*arg, slots);
                        self.current = self.current.checked_add(slots).ok_or(
                            StackLevelError::LevelOverflow {
                                block: block.id,
                                call: node.id.0,
                            },
                        )?;
                    }
                    self.peak = self.peak.max(self.current);
                }
                NodeKind::PutArgStk { .. } if self.track_levels => {
                    let slots = self.pending.remove(&node.id).ok_or(
                        StackLevelError::OrphanArgument {
                            block: block.id,
                            node: node.id.0,
                        },
                    )?;
                    self.current -= slots;
                }
                kind => {
                    for throw_kind in kind.throw_kinds() {
                        self.mark_used(
                            add_codes,
                            AddCodeKey {
                                kind: throw_kind,
                                region: block.region,
                            },
                        );
                    }
                }
            }
        }

        if self.current != 0 || !self.pending.is_empty() {
            let level = self.current;
            self.current = 0;
            self.pending.clear();
            return Err(StackLevelError::Unbalanced {
                block: block.id,
                level,
            });
        }
        Ok(())
    }

    fn mark_used(&mut self, add_codes: &mut super::AddCodeMap, key: AddCodeKey) {
        // Faults without a shared target raise inline.
        let Some(dsc) = add_codes.get_mut(key) else {
            return;
        };
        let first_use = !dsc.used;
        dsc.used = true;
        if !self.track_levels {
            return;
        }
        match dsc.stack_depth {
            None if first_use => dsc.stack_depth = Some(self.current),
            None => {}
            Some(depth) if depth != self.current => {
                if !self.frame_pointer_required {
                    debug!(
                        "{} {:?} target entered at depths {depth} and {}, frame pointer required",
                        Component::Jit,
                        key.kind,
                        self.current
                    );
                }
                self.frame_pointer_required = true;
            }
            Some(_) => {}
        }
    }
}
