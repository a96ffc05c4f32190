//! kbagent graph: the knowledge-base side of the agent protocol
//!
//! A remote agent is driven entirely through the graph: the client writes an
//! *action* node plus its arguments, marks it initiated, and the server links
//! one of three sentinel nodes to the action once it is done.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    KNOWLEDGE BASE (black box)                    │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │   action_initiated ──►┐                                          │
//! │   action_auth ───────►│                                          │
//! │                   ┌───┴────┐  rrel_1   ┌────────┐                │
//! │                   │ action │─────────► │ "user" │ (link)         │
//! │                   │  node  │  rrel_2   ┌────────┐                │
//! │                   │        │─────────► │ "pass" │ (link)         │
//! │                   └───┬────┘           └────────┘                │
//! │                       │ nrel_result                              │
//! │                       ▼                                          │
//! │                   ┌────────┐                                     │
//! │                   │ struct │──► members (links / nodes)          │
//! │                   └────────┘                                     │
//! │   action_finished_successfully ──► action node (completion)      │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! This crate only models that surface:
//! - `pattern`: search patterns and the bindings they produce
//! - `write`: batched creation instructions with slot placeholders
//! - `transport`: the [`KbTransport`] trait every client speaks
//! - `memory`: [`MemoryKb`], an in-process knowledge base with its own event
//!   dispatcher and server-side agent procedures

pub mod memory;
pub mod pattern;
pub mod transport;
pub mod write;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::{ActionRequest, AgentHandler, AgentVerdict, MemoryKb};
pub use pattern::{Binding, Pattern, Term, Triple};
pub use transport::{EdgeEvent, EventCallback, EventKind, KbTransport};
pub use write::{Instruction, Operand, SlotBindings, SlotId};

/// Identifiers of the protocol markers every agent server defines.
pub mod idtf {
    pub const ACTION_INITIATED: &str = "action_initiated";
    pub const ACTION_FINISHED_SUCCESSFULLY: &str = "action_finished_successfully";
    pub const ACTION_FINISHED_UNSUCCESSFULLY: &str = "action_finished_unsuccessfully";
    pub const ACTION_FINISHED_WITH_ERROR: &str = "action_finished_with_error";
    pub const NREL_RESULT: &str = "nrel_result";
    pub const NREL_MAIN_IDTF: &str = "nrel_main_idtf";
    /// Prefix of positional role relations (`rrel_1`, `rrel_2`, ...)
    pub const ROLE_PREFIX: &str = "rrel_";
    /// Number of positional roles seeded by default
    pub const DEFAULT_ROLE_COUNT: u32 = 10;

    /// Identifier of the positional role `index`.
    pub fn role(index: u32) -> String {
        format!("{ROLE_PREFIX}{index}")
    }

    /// Inverse of [`role`]; `None` for non-positional identifiers.
    pub fn role_index(idtf: &str) -> Option<u32> {
        idtf.strip_prefix(ROLE_PREFIX)?.parse().ok()
    }
}

// ============================================================================
// Element Identities
// ============================================================================

/// Address of a node or link in the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeRef(u64);

impl NodeRef {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of an edge (arc) in the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EdgeRef(u64);

impl EdgeRef {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EdgeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~{}", self.0)
    }
}

/// Handle returned by [`KbTransport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Element Kinds
// ============================================================================

/// Class of a node. Markers are resolved by `(identifier, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain constant node (action nodes, entities)
    Node,
    /// Class node (action kinds, concepts, sentinels)
    Class,
    /// Role relation (`rrel_*`)
    Role,
    /// Non-role binary relation (`nrel_*`)
    NoRole,
    /// Structure node (result containers)
    Struct,
    /// Tuple node (grouped arguments)
    Tuple,
    /// Content-bearing leaf
    Link,
}

impl NodeKind {
    /// Whether a node of kind `self` satisfies a pattern constraint `wanted`.
    ///
    /// `Node` is the wildcard for every non-link kind; links only match links.
    pub fn satisfies(self, wanted: NodeKind) -> bool {
        match wanted {
            NodeKind::Node => self != NodeKind::Link,
            other => self == other,
        }
    }
}

/// Kind of an arc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Membership arc (`class -> element`, `action -> argument`)
    Access,
    /// Binary-relation arc (`action => result structure`)
    Common,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("knowledge base is not connected")]
    Disconnected,
    #[error("unresolved identifier '{idtf}' ({kind:?})")]
    UnresolvedIdentifier { idtf: String, kind: NodeKind },
    #[error("unknown element {0}")]
    UnknownElement(u64),
    #[error("slot {0} referenced before it was created")]
    UnboundSlot(SlotId),
    #[error("pattern variable '{0}' referenced before it was bound")]
    UnboundVariable(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    #[error("element {0} is not a link")]
    NotALink(NodeRef),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
