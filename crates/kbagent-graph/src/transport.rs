//! The client connection to a knowledge-base server.

use crate::{
    Binding, EdgeKind, EdgeRef, Instruction, NodeKind, NodeRef, Pattern, SlotBindings,
    SubscriptionHandle, TransportResult,
};
use std::sync::Arc;

/// Which edges of a subscribed element raise events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new edge was created pointing into the element
    IncomingEdge,
    /// A new edge was created leaving the element
    OutgoingEdge,
}

/// Notification delivered to a subscription callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Element the subscription was registered on
    pub subscribed: NodeRef,
    pub edge: EdgeRef,
    pub source: NodeRef,
    pub target: NodeRef,
}

impl EdgeEvent {
    /// The endpoint of the edge that is not the subscribed element.
    pub fn peer(&self) -> NodeRef {
        if self.source == self.subscribed {
            self.target
        } else {
            self.source
        }
    }
}

/// Subscription callback. Runs on a transport-owned thread.
pub type EventCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

/// Operations the invocation bridge consumes from the knowledge base.
///
/// Implementations must be usable from many threads at once; every method is
/// a synchronous round-trip.
pub trait KbTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Look up a well-known marker. Never creates it.
    fn resolve_marker(&self, idtf: &str, kind: NodeKind) -> TransportResult<NodeRef>;

    fn create_link(&self, content: &str) -> TransportResult<NodeRef>;

    fn create_node(&self, kind: NodeKind) -> TransportResult<NodeRef>;

    fn create_edge(
        &self,
        from: NodeRef,
        to: NodeRef,
        kind: EdgeKind,
        relation: Option<NodeRef>,
    ) -> TransportResult<EdgeRef>;

    fn subscribe(
        &self,
        node: NodeRef,
        event: EventKind,
        callback: EventCallback,
    ) -> TransportResult<SubscriptionHandle>;

    fn unsubscribe(&self, handle: SubscriptionHandle) -> TransportResult<()>;

    /// Apply a batch of creations. Slots already bound in `preset` are taken
    /// as-is; the returned bindings include every slot of the batch.
    fn write_fragment(
        &self,
        instructions: &[Instruction],
        preset: &SlotBindings,
    ) -> TransportResult<SlotBindings>;

    fn search(&self, pattern: &Pattern) -> TransportResult<Vec<Binding>> {
        self.search_from(pattern, &Binding::new())
    }

    /// Search with some variables already bound (referenced through `Term::Ref`).
    /// Seed variables are carried into every returned binding.
    fn search_from(&self, pattern: &Pattern, seed: &Binding) -> TransportResult<Vec<Binding>>;

    fn read_link_content(&self, link: NodeRef) -> TransportResult<String>;
}
