//! CompletionWaiter: one subscription per in-flight action, resolved once.
//!
//! ```text
//!  caller thread                         transport callback thread
//!  ─────────────                         ─────────────────────────
//!  register(action) ──subscribe──►  KB
//!  write fragment
//!  wait() ── recv_timeout ─┐             edge sentinel ─► action
//!                          │             classify(source)
//!                          │             resolver.take() ── Some(tx) ─► send
//!                          ◄─────────────────────────────────────────────┘
//!  unsubscribe (always)
//! ```
//!
//! The resolver holds the only sender of a capacity-one channel. Whoever
//! takes it first (the callback on a sentinel match, or the caller on
//! deadline expiry) decides the outcome, so resolution is exactly-once.

use crate::keynodes::Sentinels;
use kbagent_graph::{
    EdgeEvent, EventCallback, EventKind, KbTransport, NodeRef, SubscriptionHandle, TransportError,
    TransportResult,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Which sentinel the server linked to the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(CompletionOutcome),
    /// No sentinel arrived before the deadline
    TimedOut(Duration),
}

/// Per-call identity of one invocation.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub id: Uuid,
    pub action: NodeRef,
    pub started: Instant,
    pub deadline: Instant,
}

impl CorrelationContext {
    pub fn new(action: NodeRef, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            id: Uuid::new_v4(),
            action,
            started,
            deadline: started + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Single-use handoff between the callback and the waiting caller.
struct Resolver {
    sender: Mutex<Option<mpsc::SyncSender<CompletionOutcome>>>,
}

impl Resolver {
    fn take(&self) -> Option<mpsc::SyncSender<CompletionOutcome>> {
        self.sender.lock().take()
    }
}

// ============================================================================
// Pending completion
// ============================================================================

/// A registered, not yet awaited completion. Dropping it cancels the
/// subscription.
pub struct PendingCompletion {
    transport: Arc<dyn KbTransport>,
    context: CorrelationContext,
    handle: Option<SubscriptionHandle>,
    resolver: Arc<Resolver>,
    receiver: mpsc::Receiver<CompletionOutcome>,
}

impl PendingCompletion {
    pub fn context(&self) -> &CorrelationContext {
        &self.context
    }

    /// Block until a sentinel arrives or the deadline passes.
    pub fn wait(mut self) -> WaitOutcome {
        let outcome = match self.receiver.recv_timeout(self.context.remaining()) {
            Ok(outcome) => WaitOutcome::Completed(outcome),
            Err(RecvTimeoutError::Timeout) => {
                if self.resolver.take().is_some() {
                    WaitOutcome::TimedOut(self.context.started.elapsed())
                } else {
                    // The callback took the sender first; its send is in flight.
                    match self.receiver.recv() {
                        Ok(outcome) => WaitOutcome::Completed(outcome),
                        Err(_) => WaitOutcome::TimedOut(self.context.started.elapsed()),
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(action = %self.context.action, "completion channel closed without an outcome");
                WaitOutcome::TimedOut(self.context.started.elapsed())
            }
        };
        self.release();
        outcome
    }

    fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.transport.unsubscribe(handle) {
            Ok(()) => {}
            Err(TransportError::UnknownSubscription(_)) => {
                tracing::debug!(action = %self.context.action, "subscription already gone");
            }
            Err(err) => {
                tracing::warn!(action = %self.context.action, error = %err, "failed to cancel completion subscription");
            }
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Waiter
// ============================================================================

pub struct CompletionWaiter {
    transport: Arc<dyn KbTransport>,
}

impl CompletionWaiter {
    pub fn new(transport: Arc<dyn KbTransport>) -> Self {
        Self { transport }
    }

    /// Subscribe to incoming edges of `action`. Must happen before the
    /// fragment that initiates the action is written.
    pub fn register(
        &self,
        action: NodeRef,
        sentinels: Sentinels,
        timeout: Duration,
    ) -> TransportResult<PendingCompletion> {
        let context = CorrelationContext::new(action, timeout);
        let (tx, rx) = mpsc::sync_channel(1);
        let resolver = Arc::new(Resolver {
            sender: Mutex::new(Some(tx)),
        });

        let callback_resolver = Arc::clone(&resolver);
        let correlation = context.id;
        let callback: EventCallback = Arc::new(move |event: EdgeEvent| {
            if event.subscribed != action || event.target != action {
                return;
            }
            let Some(outcome) = sentinels.classify(event.source) else {
                return;
            };
            match callback_resolver.take() {
                Some(tx) => {
                    tracing::debug!(%correlation, action = %action, ?outcome, "completion received");
                    let _ = tx.send(outcome);
                }
                None => {
                    tracing::debug!(%correlation, action = %action, ?outcome, "ignoring completion after resolution");
                }
            }
        });

        let handle = self.transport.subscribe(action, EventKind::IncomingEdge, callback)?;
        Ok(PendingCompletion {
            transport: Arc::clone(&self.transport),
            context,
            handle: Some(handle),
            resolver,
            receiver: rx,
        })
    }

    /// Register and wait in one step, for actions initiated elsewhere
    /// after this call subscribes.
    pub fn await_completion(
        &self,
        action: NodeRef,
        sentinels: Sentinels,
        timeout: Duration,
    ) -> TransportResult<WaitOutcome> {
        Ok(self.register(action, sentinels, timeout)?.wait())
    }
}
