//! Batched graph writes.
//!
//! Instructions refer to elements created earlier in the same batch through
//! numbered slots, so a whole action fragment can be described before any of
//! it exists on the server.

use crate::{EdgeKind, NodeKind, NodeRef, TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of an element created inside a batch.
pub type SlotId = usize;

/// Endpoint of an edge instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Element created (or preset) under this slot
    Slot(SlotId),
    /// Existing element
    Node(NodeRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    CreateNode {
        slot: SlotId,
        kind: NodeKind,
    },
    CreateLink {
        slot: SlotId,
        content: String,
    },
    CreateEdge {
        from: Operand,
        to: Operand,
        kind: EdgeKind,
        relation: Option<NodeRef>,
    },
}

/// Slot → element assignments for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotBindings {
    slots: BTreeMap<SlotId, NodeRef>,
}

impl SlotBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, slot: SlotId, node: NodeRef) {
        self.slots.insert(slot, node);
    }

    pub fn get(&self, slot: SlotId) -> Option<NodeRef> {
        self.slots.get(&slot).copied()
    }

    pub fn is_bound(&self, slot: SlotId) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, NodeRef)> + '_ {
        self.slots.iter().map(|(slot, node)| (*slot, *node))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve an operand against the current assignments.
    pub fn resolve(&self, operand: Operand) -> TransportResult<NodeRef> {
        match operand {
            Operand::Node(node) => Ok(node),
            Operand::Slot(slot) => self.get(slot).ok_or(TransportError::UnboundSlot(slot)),
        }
    }
}
