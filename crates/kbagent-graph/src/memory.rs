//! In-process knowledge base.
//!
//! `MemoryKb` implements [`KbTransport`] against an in-memory graph and plays
//! the server's part of the agent protocol:
//!
//! - every created edge is queued to a dedicated dispatcher thread, which
//!   fans it out to matching subscriptions (callbacks never run on the
//!   writer's thread);
//! - an `action_initiated` arc into a member of a registered action class
//!   runs that class's [`AgentHandler`] on its own worker thread, after which
//!   the verdict's sentinel is linked to the action node.
//!
//! It also exposes the knobs tests need: connection loss, subscription
//! accounting, server restarts with fresh identities and raw event injection.

use crate::transport::{EdgeEvent, EventCallback, EventKind, KbTransport};
use crate::write::{Instruction, Operand, SlotBindings};
use crate::{
    idtf, Binding, EdgeKind, EdgeRef, NodeKind, NodeRef, Pattern, SubscriptionHandle, Term,
    TransportError, TransportResult, Triple,
};
use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

// ============================================================================
// Server-side Agents
// ============================================================================

/// What a server-side agent reports when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentVerdict {
    Succeeded,
    Failed,
    Errored,
    /// Finish without linking any sentinel (simulates a hung agent)
    Silent,
}

/// An initiated action as seen by a server-side agent.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: NodeRef,
    pub kind: String,
    /// Positional arguments: role index → argument element
    pub arguments: BTreeMap<u32, NodeRef>,
}

impl ActionRequest {
    pub fn argument(&self, role: u32) -> Option<NodeRef> {
        self.arguments.get(&role).copied()
    }
}

pub type AgentHandler = Arc<dyn Fn(&MemoryKb, &ActionRequest) -> AgentVerdict + Send + Sync>;

// ============================================================================
// Graph Storage
// ============================================================================

#[derive(Debug, Clone)]
struct NodeRecord {
    kind: NodeKind,
    content: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct EdgeRecord {
    id: EdgeRef,
    source: NodeRef,
    target: NodeRef,
    kind: EdgeKind,
    relation: Option<NodeRef>,
}

#[derive(Default)]
struct Graph {
    nodes: AHashMap<NodeRef, NodeRecord>,
    /// All edges in creation order
    edges: Vec<EdgeRecord>,
    /// node -> indexes into `edges` (creation order)
    outgoing: AHashMap<NodeRef, Vec<usize>>,
    incoming: AHashMap<NodeRef, Vec<usize>>,
}

impl Graph {
    fn contains(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node)
    }

    fn kind_of(&self, node: NodeRef) -> Option<NodeKind> {
        self.nodes.get(&node).map(|n| n.kind)
    }

    fn require(&self, node: NodeRef) -> TransportResult<()> {
        if self.contains(node) {
            Ok(())
        } else {
            Err(TransportError::UnknownElement(node.raw()))
        }
    }

    fn push_edge(&mut self, edge: EdgeRecord) {
        let index = self.edges.len();
        self.outgoing.entry(edge.source).or_default().push(index);
        self.incoming.entry(edge.target).or_default().push(index);
        self.edges.push(edge);
    }

    fn edges_from(&self, node: NodeRef) -> impl Iterator<Item = &EdgeRecord> {
        self.outgoing
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.edges.get(i))
    }

    fn edges_into(&self, node: NodeRef) -> impl Iterator<Item = &EdgeRecord> {
        self.incoming
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.edges.get(i))
    }

    // ------------------------------------------------------------------------
    // Pattern matching
    // ------------------------------------------------------------------------

    fn match_triple(
        &self,
        triple: &Triple,
        row: &Binding,
        markers: &AHashMap<String, NodeRef>,
    ) -> TransportResult<Vec<Binding>> {
        let source = self.fixed(&triple.source, row, markers)?;
        let target = self.fixed(&triple.target, row, markers)?;

        let candidates: Vec<&EdgeRecord> = match (source, target) {
            (Some(s), _) => self.edges_from(s).collect(),
            (None, Some(t)) => self.edges_into(t).collect(),
            (None, None) => self.edges.iter().collect(),
        };

        let mut out = Vec::new();
        for edge in candidates {
            if edge.kind != triple.edge {
                continue;
            }
            let mut next = row.clone();
            if !self.unify(&triple.source, edge.source, &mut next, markers)? {
                continue;
            }
            if !self.unify(&triple.target, edge.target, &mut next, markers)? {
                continue;
            }
            if let Some(relation) = &triple.relation {
                let Some(label) = edge.relation else {
                    continue;
                };
                if !self.unify(relation, label, &mut next, markers)? {
                    continue;
                }
            }
            out.push(next);
        }
        Ok(out)
    }

    /// Concrete element for a term, if it is already determined.
    fn fixed(
        &self,
        term: &Term,
        row: &Binding,
        markers: &AHashMap<String, NodeRef>,
    ) -> TransportResult<Option<NodeRef>> {
        match term {
            Term::Node(node) => Ok(Some(*node)),
            Term::Idtf(name) => Ok(markers.get(name).copied()),
            Term::Ref(name) => row
                .get(name)
                .map(Some)
                .ok_or_else(|| TransportError::UnboundVariable(name.clone())),
            Term::Var { name, .. } => Ok(row.get(name)),
        }
    }

    fn unify(
        &self,
        term: &Term,
        node: NodeRef,
        row: &mut Binding,
        markers: &AHashMap<String, NodeRef>,
    ) -> TransportResult<bool> {
        if let Some(fixed) = self.fixed(term, row, markers)? {
            return Ok(fixed == node);
        }
        let Term::Var { name, kind } = term else {
            return Ok(false);
        };
        if let Some(wanted) = kind {
            match self.kind_of(node) {
                Some(actual) if actual.satisfies(*wanted) => {}
                _ => return Ok(false),
            }
        }
        row.insert(name.clone(), node);
        Ok(true)
    }
}

// ============================================================================
// MemoryKb
// ============================================================================

struct Subscription {
    node: NodeRef,
    event: EventKind,
    callback: EventCallback,
}

enum Dispatch {
    Edge(EdgeEvent),
    Injected(EdgeEvent),
}

struct KbInner {
    graph: RwLock<Graph>,
    /// identifier -> marker
    markers: DashMap<String, NodeRef>,
    /// marker -> identifier
    names: DashMap<NodeRef, String>,
    /// Marker definitions, replayed on restart
    definitions: Mutex<Vec<(String, NodeKind)>>,
    subscriptions: DashMap<u64, Subscription>,
    agents: DashMap<String, AgentHandler>,
    next_element: AtomicU64,
    next_subscription: AtomicU64,
    connected: AtomicBool,
    dispatch: Mutex<mpsc::Sender<Dispatch>>,
}

/// In-process knowledge base. Cloning shares the same graph.
#[derive(Clone)]
pub struct MemoryKb {
    inner: Arc<KbInner>,
}

impl Default for MemoryKb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKb {
    /// Empty knowledge base with no markers.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::new(KbInner {
            graph: RwLock::new(Graph::default()),
            markers: DashMap::new(),
            names: DashMap::new(),
            definitions: Mutex::new(Vec::new()),
            subscriptions: DashMap::new(),
            agents: DashMap::new(),
            next_element: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            dispatch: Mutex::new(tx),
        });

        let weak: Weak<KbInner> = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("kbagent_memory_dispatch".to_string())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let kb = MemoryKb { inner };
                    match message {
                        Dispatch::Edge(event) => {
                            kb.fan_out(event);
                            kb.maybe_run_agent(event);
                        }
                        Dispatch::Injected(event) => kb.fan_out(event),
                    }
                }
            })
            .expect("failed to spawn memory kb dispatcher");

        Self { inner }
    }

    /// Knowledge base seeded with the protocol markers.
    pub fn with_protocol_markers() -> Self {
        let kb = Self::new();
        for (name, kind) in protocol_markers() {
            kb.define_marker(&name, kind);
        }
        kb
    }

    /// Define (or look up) a marker node.
    pub fn define_marker(&self, name: &str, kind: NodeKind) -> NodeRef {
        if let Some(existing) = self.inner.markers.get(name) {
            return *existing;
        }
        let node = self.alloc_node(kind, None);
        self.inner.markers.insert(name.to_string(), node);
        self.inner.names.insert(node, name.to_string());
        self.inner.definitions.lock().push((name.to_string(), kind));
        node
    }

    /// Identifier of a marker node.
    pub fn name_of(&self, node: NodeRef) -> Option<String> {
        self.inner.names.get(&node).map(|n| n.clone())
    }

    /// Register the server-side procedure for an action class.
    pub fn register_agent<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&MemoryKb, &ActionRequest) -> AgentVerdict + Send + Sync + 'static,
    {
        self.define_marker(kind, NodeKind::Class);
        self.inner.agents.insert(kind.to_string(), Arc::new(handler));
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of edges created so far.
    pub fn edge_count(&self) -> usize {
        self.inner.graph.read().edges.len()
    }

    /// Simulate a server restart: the graph and subscriptions are lost and
    /// every marker comes back under a fresh identity.
    pub fn restart(&self) {
        *self.inner.graph.write() = Graph::default();
        self.inner.subscriptions.clear();
        self.inner.markers.clear();
        self.inner.names.clear();
        let definitions = std::mem::take(&mut *self.inner.definitions.lock());
        for (name, kind) in definitions {
            self.define_marker(&name, kind);
        }
        tracing::debug!(markers = self.inner.markers.len(), "memory kb restarted");
    }

    /// Deliver an edge event to matching subscriptions as if the edge had
    /// been created, without touching the graph or running agents.
    pub fn inject_event(&self, event: EdgeEvent) {
        let _ = self.inner.dispatch.lock().send(Dispatch::Injected(event));
    }

    // ------------------------------------------------------------------------
    // Helpers for agent handlers and fixtures
    // ------------------------------------------------------------------------

    /// Create the `nrel_result` structure of `action` with the given members.
    pub fn attach_result(&self, action: NodeRef, members: &[NodeRef]) -> TransportResult<NodeRef> {
        let relation = self.marker(idtf::NREL_RESULT)?;
        let structure = self.create_node(NodeKind::Struct)?;
        self.create_edge(action, structure, EdgeKind::Common, Some(relation))?;
        for member in members {
            self.create_edge(structure, *member, EdgeKind::Access, None)?;
        }
        Ok(structure)
    }

    /// Give `node` a main identifier link.
    pub fn set_main_idtf(&self, node: NodeRef, text: &str) -> TransportResult<NodeRef> {
        let relation = self.marker(idtf::NREL_MAIN_IDTF)?;
        let link = self.create_link(text)?;
        self.create_edge(node, link, EdgeKind::Common, Some(relation))?;
        Ok(link)
    }

    /// Make `node` a member of the class `class`.
    pub fn add_to_class(&self, class: &str, node: NodeRef) -> TransportResult<()> {
        let class = self.marker(class)?;
        self.create_edge(class, node, EdgeKind::Access, None)?;
        Ok(())
    }

    /// Content of the argument under `role`, if it is a link.
    pub fn argument_text(&self, request: &ActionRequest, role: u32) -> Option<String> {
        self.read_link_content(request.argument(role)?).ok()
    }

    fn marker(&self, name: &str) -> TransportResult<NodeRef> {
        self.inner
            .markers
            .get(name)
            .map(|m| *m)
            .ok_or_else(|| TransportError::UnresolvedIdentifier {
                idtf: name.to_string(),
                kind: NodeKind::Node,
            })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn alloc_node(&self, kind: NodeKind, content: Option<String>) -> NodeRef {
        let node = NodeRef::new(self.inner.next_element.fetch_add(1, Ordering::SeqCst));
        self.inner
            .graph
            .write()
            .nodes
            .insert(node, NodeRecord { kind, content });
        node
    }

    fn alloc_edge(
        &self,
        graph: &mut Graph,
        source: NodeRef,
        target: NodeRef,
        kind: EdgeKind,
        relation: Option<NodeRef>,
    ) -> EdgeEvent {
        let id = EdgeRef::new(self.inner.next_element.fetch_add(1, Ordering::SeqCst));
        graph.push_edge(EdgeRecord {
            id,
            source,
            target,
            kind,
            relation,
        });
        EdgeEvent {
            subscribed: target,
            edge: id,
            source,
            target,
        }
    }

    fn enqueue(&self, events: Vec<EdgeEvent>) {
        let tx = self.inner.dispatch.lock();
        for event in events {
            let _ = tx.send(Dispatch::Edge(event));
        }
    }

    fn fan_out(&self, event: EdgeEvent) {
        let callbacks: Vec<(NodeRef, EventCallback)> = self
            .inner
            .subscriptions
            .iter()
            .filter_map(|entry| {
                let sub = entry.value();
                let hit = match sub.event {
                    EventKind::IncomingEdge => sub.node == event.target,
                    EventKind::OutgoingEdge => sub.node == event.source,
                };
                hit.then(|| (sub.node, Arc::clone(&sub.callback)))
            })
            .collect();

        for (node, callback) in callbacks {
            callback(EdgeEvent {
                subscribed: node,
                ..event
            });
        }
    }

    fn maybe_run_agent(&self, event: EdgeEvent) {
        let Some(source_name) = self.name_of(event.source) else {
            return;
        };
        if source_name != idtf::ACTION_INITIATED {
            return;
        }
        let action = event.target;

        let (kind, handler, arguments) = {
            let graph = self.inner.graph.read();
            let mut found = None;
            for edge in graph.edges_into(action) {
                if edge.kind != EdgeKind::Access {
                    continue;
                }
                let Some(name) = self.name_of(edge.source) else {
                    continue;
                };
                if let Some(handler) = self.inner.agents.get(&name) {
                    found = Some((name, Arc::clone(handler.value())));
                    break;
                }
            }
            let Some((kind, handler)) = found else {
                tracing::debug!(action = %action, "initiated action has no registered agent");
                return;
            };

            let mut arguments = BTreeMap::new();
            for edge in graph.edges_from(action) {
                let role = edge
                    .relation
                    .and_then(|r| self.name_of(r))
                    .and_then(|name| idtf::role_index(&name));
                if let (EdgeKind::Access, Some(role)) = (edge.kind, role) {
                    arguments.insert(role, edge.target);
                }
            }
            (kind, handler, arguments)
        };

        let kb = self.clone();
        let request = ActionRequest {
            action,
            kind,
            arguments,
        };
        std::thread::spawn(move || {
            let verdict = handler(&kb, &request);
            tracing::debug!(action = %request.action, kind = %request.kind, ?verdict, "agent finished");
            let sentinel = match verdict {
                AgentVerdict::Succeeded => idtf::ACTION_FINISHED_SUCCESSFULLY,
                AgentVerdict::Failed => idtf::ACTION_FINISHED_UNSUCCESSFULLY,
                AgentVerdict::Errored => idtf::ACTION_FINISHED_WITH_ERROR,
                AgentVerdict::Silent => return,
            };
            let linked = kb
                .marker(sentinel)
                .and_then(|s| kb.create_edge(s, request.action, EdgeKind::Access, None));
            if let Err(err) = linked {
                tracing::warn!(action = %request.action, error = %err, "failed to link completion sentinel");
            }
        });
    }
}

/// Protocol markers every agent server defines.
pub fn protocol_markers() -> Vec<(String, NodeKind)> {
    let mut out = vec![
        (idtf::ACTION_INITIATED.to_string(), NodeKind::Class),
        (idtf::ACTION_FINISHED_SUCCESSFULLY.to_string(), NodeKind::Class),
        (idtf::ACTION_FINISHED_UNSUCCESSFULLY.to_string(), NodeKind::Class),
        (idtf::ACTION_FINISHED_WITH_ERROR.to_string(), NodeKind::Class),
        (idtf::NREL_RESULT.to_string(), NodeKind::NoRole),
        (idtf::NREL_MAIN_IDTF.to_string(), NodeKind::NoRole),
    ];
    out.extend((1..=idtf::DEFAULT_ROLE_COUNT).map(|i| (idtf::role(i), NodeKind::Role)));
    out
}

// ============================================================================
// KbTransport
// ============================================================================

impl KbTransport for MemoryKb {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn resolve_marker(&self, name: &str, kind: NodeKind) -> TransportResult<NodeRef> {
        self.ensure_connected()?;
        let unresolved = || TransportError::UnresolvedIdentifier {
            idtf: name.to_string(),
            kind,
        };
        let node = self.inner.markers.get(name).map(|m| *m).ok_or_else(unresolved)?;
        match self.inner.graph.read().kind_of(node) {
            Some(actual) if actual == kind => Ok(node),
            _ => Err(unresolved()),
        }
    }

    fn create_link(&self, content: &str) -> TransportResult<NodeRef> {
        self.ensure_connected()?;
        Ok(self.alloc_node(NodeKind::Link, Some(content.to_string())))
    }

    fn create_node(&self, kind: NodeKind) -> TransportResult<NodeRef> {
        self.ensure_connected()?;
        Ok(self.alloc_node(kind, None))
    }

    fn create_edge(
        &self,
        from: NodeRef,
        to: NodeRef,
        kind: EdgeKind,
        relation: Option<NodeRef>,
    ) -> TransportResult<EdgeRef> {
        self.ensure_connected()?;
        let event = {
            let mut graph = self.inner.graph.write();
            graph.require(from)?;
            graph.require(to)?;
            if let Some(relation) = relation {
                graph.require(relation)?;
            }
            self.alloc_edge(&mut graph, from, to, kind, relation)
        };
        self.enqueue(vec![event]);
        Ok(event.edge)
    }

    fn subscribe(
        &self,
        node: NodeRef,
        event: EventKind,
        callback: EventCallback,
    ) -> TransportResult<SubscriptionHandle> {
        self.ensure_connected()?;
        self.inner.graph.read().require(node)?;
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.inner.subscriptions.insert(
            id,
            Subscription {
                node,
                event,
                callback,
            },
        );
        Ok(SubscriptionHandle::new(id))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> TransportResult<()> {
        self.ensure_connected()?;
        self.inner
            .subscriptions
            .remove(&handle.raw())
            .map(|_| ())
            .ok_or(TransportError::UnknownSubscription(handle.raw()))
    }

    fn write_fragment(
        &self,
        instructions: &[Instruction],
        preset: &SlotBindings,
    ) -> TransportResult<SlotBindings> {
        self.ensure_connected()?;
        let mut slots = preset.clone();
        let mut events = Vec::new();
        {
            let mut graph = self.inner.graph.write();

            // Validate the whole batch before creating anything.
            let mut declared: HashSet<usize> = HashSet::new();
            let check = |operand: Operand, declared: &HashSet<usize>, graph: &Graph| match operand {
                Operand::Node(node) => graph.require(node),
                Operand::Slot(slot) if preset.is_bound(slot) || declared.contains(&slot) => Ok(()),
                Operand::Slot(slot) => Err(TransportError::UnboundSlot(slot)),
            };
            for instruction in instructions {
                match instruction {
                    Instruction::CreateNode { slot, .. } | Instruction::CreateLink { slot, .. } => {
                        declared.insert(*slot);
                    }
                    Instruction::CreateEdge {
                        from, to, relation, ..
                    } => {
                        check(*from, &declared, &*graph)?;
                        check(*to, &declared, &*graph)?;
                        if let Some(relation) = relation {
                            graph.require(*relation)?;
                        }
                    }
                }
            }
            for (_, node) in preset.iter() {
                graph.require(node)?;
            }

            for instruction in instructions {
                match instruction {
                    Instruction::CreateNode { slot, kind } => {
                        if !slots.is_bound(*slot) {
                            let node = NodeRef::new(self.inner.next_element.fetch_add(1, Ordering::SeqCst));
                            graph.nodes.insert(
                                node,
                                NodeRecord {
                                    kind: *kind,
                                    content: None,
                                },
                            );
                            slots.bind(*slot, node);
                        }
                    }
                    Instruction::CreateLink { slot, content } => {
                        let node = NodeRef::new(self.inner.next_element.fetch_add(1, Ordering::SeqCst));
                        graph.nodes.insert(
                            node,
                            NodeRecord {
                                kind: NodeKind::Link,
                                content: Some(content.clone()),
                            },
                        );
                        slots.bind(*slot, node);
                    }
                    Instruction::CreateEdge {
                        from,
                        to,
                        kind,
                        relation,
                    } => {
                        let from = slots.resolve(*from)?;
                        let to = slots.resolve(*to)?;
                        events.push(self.alloc_edge(&mut graph, from, to, *kind, *relation));
                    }
                }
            }
        }
        self.enqueue(events);
        Ok(slots)
    }

    fn search_from(&self, pattern: &Pattern, seed: &Binding) -> TransportResult<Vec<Binding>> {
        self.ensure_connected()?;

        let mut markers: AHashMap<String, NodeRef> = AHashMap::new();
        for triple in &pattern.triples {
            let terms = [Some(&triple.source), Some(&triple.target), triple.relation.as_ref()];
            for term in terms.into_iter().flatten() {
                if let Term::Idtf(name) = term {
                    let node = self.marker(name)?;
                    markers.insert(name.clone(), node);
                }
            }
        }

        let graph = self.inner.graph.read();
        let mut rows = vec![seed.clone()];
        for triple in &pattern.triples {
            let mut next = Vec::new();
            for row in &rows {
                next.extend(graph.match_triple(triple, row, &markers)?);
            }
            rows = next;
            if rows.is_empty() {
                break;
            }
        }
        Ok(rows)
    }

    fn read_link_content(&self, link: NodeRef) -> TransportResult<String> {
        self.ensure_connected()?;
        let graph = self.inner.graph.read();
        let record = graph
            .nodes
            .get(&link)
            .ok_or(TransportError::UnknownElement(link.raw()))?;
        record.content.clone().ok_or(TransportError::NotALink(link))
    }
}
