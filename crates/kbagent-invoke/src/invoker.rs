//! AgentInvoker: build → subscribe → write → wait → extract.
//!
//! Every call owns its correlation context, subscription and result
//! channel. The only state shared between calls is the marker cache.

use crate::catalog::ActionCatalog;
use crate::config::InvokerConfig;
use crate::error::{InvokeError, InvokeResult};
use crate::extract::{ExtractError, MalformedResult, Payload, ResultExtractor, ResultSpec};
use crate::fragment::{ActionFragment, GraphFragmentBuilder, RoleArg, ACTION_SLOT};
use crate::keynodes::{MarkerCache, MarkerRef};
use crate::waiter::{CompletionOutcome, CompletionWaiter, PendingCompletion, WaitOutcome};
use kbagent_graph::{KbTransport, NodeKind, NodeRef, SlotBindings, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the server made of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Ok(Payload),
    /// Linked to the "unsuccessful" sentinel
    Failed,
    /// Linked to the "error" sentinel
    Errored,
    /// No sentinel within the deadline; carries the time waited
    TimedOut(Duration),
    /// Success was reported but the result subgraph did not match the requested shape
    Malformed(MalformedResult),
}

impl Invocation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Invocation::Ok(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Invocation::Ok(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Invocation::Ok(payload) => Some(payload),
            _ => None,
        }
    }
}

pub struct AgentInvoker {
    transport: Arc<dyn KbTransport>,
    markers: MarkerCache,
    builder: GraphFragmentBuilder,
    waiter: CompletionWaiter,
    extractor: ResultExtractor,
    catalog: ActionCatalog,
    config: InvokerConfig,
}

impl AgentInvoker {
    /// Invoker with the default protocol names and the standard catalog.
    pub fn new(transport: Arc<dyn KbTransport>) -> Self {
        Self::with_config(transport, InvokerConfig::default(), ActionCatalog::standard())
    }

    pub fn with_config(
        transport: Arc<dyn KbTransport>,
        config: InvokerConfig,
        catalog: ActionCatalog,
    ) -> Self {
        Self {
            markers: MarkerCache::new(config.protocol.clone()),
            builder: GraphFragmentBuilder::new(config.protocol.clone()),
            waiter: CompletionWaiter::new(Arc::clone(&transport)),
            extractor: ResultExtractor::new(
                Arc::clone(&transport),
                config.protocol.result_relation.clone(),
            ),
            transport,
            catalog,
            config,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    pub fn markers(&self) -> &MarkerCache {
        &self.markers
    }

    /// Deadline of `kind`: the catalog's, else the configured default.
    pub fn timeout_for(&self, kind: &str) -> Duration {
        self.catalog
            .get(kind)
            .map(|spec| spec.timeout())
            .unwrap_or_else(|| self.config.default_timeout())
    }

    /// Invoke a catalogued action with its declared result shape and deadline.
    pub fn call(&self, kind: &str, args: &[RoleArg]) -> InvokeResult<Invocation> {
        let spec = self
            .catalog
            .get(kind)
            .ok_or_else(|| InvokeError::UnknownAction(kind.to_string()))?;
        self.invoke(kind, args, &spec.result, spec.timeout())
    }

    /// Invoke with an explicit result shape and the kind's deadline.
    pub fn invoke_shape(
        &self,
        kind: &str,
        args: &[RoleArg],
        spec: &ResultSpec,
    ) -> InvokeResult<Invocation> {
        self.invoke(kind, args, spec, self.timeout_for(kind))
    }

    /// Run `kind(args)` on the server and wait up to `timeout` for it.
    ///
    /// Transport and resolution problems are errors; every outcome the
    /// server reports (including silence) is an [`Invocation`].
    pub fn invoke(
        &self,
        kind: &str,
        args: &[RoleArg],
        spec: &ResultSpec,
        timeout: Duration,
    ) -> InvokeResult<Invocation> {
        if !self.transport.is_connected() {
            return Err(InvokeError::Disconnected);
        }
        if self.config.validate_catalog {
            if let Some(declared) = self.catalog.get(kind) {
                declared.check_args(args)?;
            }
        }
        let fragment = self.builder.build(kind, args)?;

        let span = tracing::debug_span!("invoke", kind, correlation = tracing::field::Empty);
        let _enter = span.enter();

        let started = Instant::now();
        let deadline = started + timeout;
        let (action, pending) = match self.initiate(&fragment, timeout, &span) {
            Err(InvokeError::Transport(TransportError::UnknownElement(element))) => {
                // Cached markers outlived the server's identities. Nothing was
                // written, so the action can be initiated again.
                tracing::warn!(element, "stale marker identity, refreshing marker cache");
                self.markers.invalidate();
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::warn!("deadline spent before the action was initiated");
                    return Ok(Invocation::TimedOut(started.elapsed()));
                }
                self.initiate(&fragment, remaining, &span)?
            }
            other => other?,
        };
        self.complete(action, pending, spec, started)
    }

    /// Resolve markers, subscribe and write the fragment. Returns once the
    /// action is initiated on the server.
    fn initiate(
        &self,
        fragment: &ActionFragment,
        timeout: Duration,
        span: &tracing::Span,
    ) -> InvokeResult<(NodeRef, PendingCompletion)> {
        let transport = &*self.transport;
        let protocol = self.markers.protocol(transport)?;

        let mut resolved: HashMap<MarkerRef, NodeRef> = HashMap::new();
        for marker in fragment.required_markers() {
            let node = self.markers.resolve(transport, &marker)?;
            resolved.insert(marker, node);
        }
        let instructions = fragment.lower(|marker| {
            resolved.get(marker).copied().ok_or_else(|| InvokeError::UnresolvedIdentifier {
                idtf: marker.idtf.clone(),
                kind: marker.kind,
            })
        })?;

        let action = transport.create_node(NodeKind::Node)?;
        let pending = self.waiter.register(action, protocol.sentinels, timeout)?;
        span.record("correlation", tracing::field::display(pending.context().id));

        let mut preset = SlotBindings::new();
        preset.bind(ACTION_SLOT, action);
        transport.write_fragment(&instructions, &preset)?;
        tracing::debug!(action = %action, instructions = instructions.len(), "action initiated");
        Ok((action, pending))
    }

    /// Wait for the sentinel and read the result. Never re-initiates: any
    /// transport error from here on aborts the call.
    fn complete(
        &self,
        action: NodeRef,
        pending: PendingCompletion,
        spec: &ResultSpec,
        started: Instant,
    ) -> InvokeResult<Invocation> {
        let invocation = match pending.wait() {
            WaitOutcome::TimedOut(_) => {
                // Measured from the start of the call, across a re-initiation.
                let after = started.elapsed();
                tracing::warn!(action = %action, waited_ms = after.as_millis() as u64, "action timed out");
                Invocation::TimedOut(after)
            }
            WaitOutcome::Completed(CompletionOutcome::Failed) => Invocation::Failed,
            WaitOutcome::Completed(CompletionOutcome::Errored) => {
                tracing::warn!(action = %action, "action finished with a server error");
                Invocation::Errored
            }
            WaitOutcome::Completed(CompletionOutcome::Succeeded) => {
                match self.extractor.extract_succeeded(action, spec) {
                    Ok(payload) => Invocation::Ok(payload),
                    Err(ExtractError::Malformed(malformed)) => {
                        tracing::warn!(
                            action = %action,
                            reason = %malformed.reason,
                            raw = ?malformed.raw,
                            "malformed action result"
                        );
                        Invocation::Malformed(malformed)
                    }
                    Err(ExtractError::Transport(err)) => return Err(err.into()),
                }
            }
        };
        tracing::debug!(action = %action, ok = invocation.is_ok(), "invocation finished");
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests;
