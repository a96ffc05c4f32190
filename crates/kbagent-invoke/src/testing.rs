//! Shared fixtures for the unit tests.

use kbagent_graph::{
    Binding, EdgeKind, EdgeRef, EventCallback, EventKind, Instruction, KbTransport, MemoryKb,
    NodeKind, NodeRef, Pattern, SlotBindings, SubscriptionHandle, TransportError, TransportResult,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A [`MemoryKb`] with injectable faults. Link reads can fail with a fixed
/// error (for every node or only one), and queued writes can stall and then
/// be rejected as if the markers were stale. Everything else goes through to
/// the knowledge base.
#[derive(Clone)]
pub struct FaultyKb {
    pub kb: MemoryKb,
    read_error: Option<TransportError>,
    read_only: Option<NodeRef>,
    stale_writes: Arc<Mutex<VecDeque<Duration>>>,
}

impl FaultyKb {
    pub fn new(kb: MemoryKb) -> Self {
        Self {
            kb,
            read_error: None,
            read_only: None,
            stale_writes: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn failing_reads(mut self, error: TransportError) -> Self {
        self.read_error = Some(error);
        self
    }

    /// Restrict read failures to `node`.
    pub fn only(mut self, node: NodeRef) -> Self {
        self.read_only = Some(node);
        self
    }

    /// The next write sleeps for `delay`, then fails with `UnknownElement`.
    pub fn stale_write_after(self, delay: Duration) -> Self {
        self.stale_writes.lock().push_back(delay);
        self
    }
}

impl KbTransport for FaultyKb {
    fn is_connected(&self) -> bool {
        self.kb.is_connected()
    }

    fn resolve_marker(&self, idtf: &str, kind: NodeKind) -> TransportResult<NodeRef> {
        self.kb.resolve_marker(idtf, kind)
    }

    fn create_link(&self, content: &str) -> TransportResult<NodeRef> {
        self.kb.create_link(content)
    }

    fn create_node(&self, kind: NodeKind) -> TransportResult<NodeRef> {
        self.kb.create_node(kind)
    }

    fn create_edge(
        &self,
        from: NodeRef,
        to: NodeRef,
        kind: EdgeKind,
        relation: Option<NodeRef>,
    ) -> TransportResult<EdgeRef> {
        self.kb.create_edge(from, to, kind, relation)
    }

    fn subscribe(
        &self,
        node: NodeRef,
        event: EventKind,
        callback: EventCallback,
    ) -> TransportResult<SubscriptionHandle> {
        self.kb.subscribe(node, event, callback)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> TransportResult<()> {
        self.kb.unsubscribe(handle)
    }

    fn write_fragment(
        &self,
        instructions: &[Instruction],
        preset: &SlotBindings,
    ) -> TransportResult<SlotBindings> {
        if let Some(delay) = self.stale_writes.lock().pop_front() {
            std::thread::sleep(delay);
            return Err(TransportError::UnknownElement(u64::MAX));
        }
        self.kb.write_fragment(instructions, preset)
    }

    fn search_from(&self, pattern: &Pattern, seed: &Binding) -> TransportResult<Vec<Binding>> {
        self.kb.search_from(pattern, seed)
    }

    fn read_link_content(&self, link: NodeRef) -> TransportResult<String> {
        match (&self.read_error, self.read_only) {
            (Some(error), None) => Err(error.clone()),
            (Some(error), Some(node)) if node == link => Err(error.clone()),
            _ => self.kb.read_link_content(link),
        }
    }
}
