//! Well-known marker nodes and their process-wide cache.
//!
//! Marker identities are immutable for the lifetime of a server, so positive
//! resolutions are cached. Failures are never cached, and the whole cache can
//! be dropped when the server comes back with fresh identities.

use crate::waiter::CompletionOutcome;
use kbagent_graph::{idtf, KbTransport, NodeKind, NodeRef, TransportResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Identifiers
// ============================================================================

/// Names of the protocol markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolIdtfs {
    pub initiated: String,
    pub succeeded: String,
    pub unsuccessful: String,
    pub errored: String,
    pub result_relation: String,
    pub role_prefix: String,
}

impl Default for ProtocolIdtfs {
    fn default() -> Self {
        Self {
            initiated: idtf::ACTION_INITIATED.to_string(),
            succeeded: idtf::ACTION_FINISHED_SUCCESSFULLY.to_string(),
            unsuccessful: idtf::ACTION_FINISHED_UNSUCCESSFULLY.to_string(),
            errored: idtf::ACTION_FINISHED_WITH_ERROR.to_string(),
            result_relation: idtf::NREL_RESULT.to_string(),
            role_prefix: idtf::ROLE_PREFIX.to_string(),
        }
    }
}

impl ProtocolIdtfs {
    /// Identifier of positional role `index`.
    pub fn role(&self, index: u32) -> String {
        format!("{}{}", self.role_prefix, index)
    }
}

/// A marker named by identifier and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerRef {
    pub idtf: String,
    pub kind: NodeKind,
}

impl MarkerRef {
    pub fn new(idtf: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            idtf: idtf.into(),
            kind,
        }
    }

    pub fn class(idtf: impl Into<String>) -> Self {
        Self::new(idtf, NodeKind::Class)
    }

    pub fn role(idtf: impl Into<String>) -> Self {
        Self::new(idtf, NodeKind::Role)
    }
}

// ============================================================================
// Resolved Markers
// ============================================================================

/// The three completion sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    pub succeeded: NodeRef,
    pub unsuccessful: NodeRef,
    pub errored: NodeRef,
}

impl Sentinels {
    /// Outcome signalled by an edge coming from `source`, if any.
    pub fn classify(&self, source: NodeRef) -> Option<CompletionOutcome> {
        if source == self.succeeded {
            Some(CompletionOutcome::Succeeded)
        } else if source == self.unsuccessful {
            Some(CompletionOutcome::Failed)
        } else if source == self.errored {
            Some(CompletionOutcome::Errored)
        } else {
            None
        }
    }
}

/// Protocol markers needed by every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMarkers {
    pub initiated: NodeRef,
    pub sentinels: Sentinels,
    pub result_relation: NodeRef,
}

// ============================================================================
// Cache
// ============================================================================

pub struct MarkerCache {
    idtfs: ProtocolIdtfs,
    entries: RwLock<HashMap<MarkerRef, NodeRef>>,
}

impl MarkerCache {
    pub fn new(idtfs: ProtocolIdtfs) -> Self {
        Self {
            idtfs,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn idtfs(&self) -> &ProtocolIdtfs {
        &self.idtfs
    }

    /// Resolve through the cache; only successful lookups are remembered.
    pub fn resolve(&self, transport: &dyn KbTransport, marker: &MarkerRef) -> TransportResult<NodeRef> {
        if let Some(node) = self.entries.read().get(marker) {
            return Ok(*node);
        }
        let node = transport.resolve_marker(&marker.idtf, marker.kind)?;
        self.entries.write().insert(marker.clone(), node);
        Ok(node)
    }

    pub fn protocol(&self, transport: &dyn KbTransport) -> TransportResult<ProtocolMarkers> {
        let class = |name: &str| self.resolve(transport, &MarkerRef::class(name));
        Ok(ProtocolMarkers {
            initiated: class(&self.idtfs.initiated)?,
            sentinels: Sentinels {
                succeeded: class(&self.idtfs.succeeded)?,
                unsuccessful: class(&self.idtfs.unsuccessful)?,
                errored: class(&self.idtfs.errored)?,
            },
            result_relation: self.resolve(
                transport,
                &MarkerRef::new(&self.idtfs.result_relation, NodeKind::NoRole),
            )?,
        })
    }

    /// Forget every cached identity (e.g. after a server restart).
    pub fn invalidate(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            tracing::debug!(dropped = entries.len(), "invalidating marker cache");
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
