//! kbagent invoke: synchronous remote-agent calls over a graph knowledge base
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          AgentInvoker                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  invoke(kind, args, spec, timeout)                                   │
//! │     │                                                                │
//! │     ├─► ActionCatalog::check_args      (before any round trip)       │
//! │     ├─► GraphFragmentBuilder::build    (pure write plan)             │
//! │     ├─► MarkerCache::resolve           (process-wide, read-mostly)   │
//! │     ├─► CompletionWaiter::register     (subscribe BEFORE writing)    │
//! │     ├─► KbTransport::write_fragment    (action + args + initiated)   │
//! │     ├─► PendingCompletion::wait        (single-use channel, deadline)│
//! │     └─► ResultExtractor::extract       (declarative ResultSpec)      │
//! │                                                                      │
//! │  → Invocation { Ok(payload) | Failed | Errored | TimedOut | Malformed}│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `remote` wraps the invoker for async callers and `services` provides
//! typed call sites for every catalogued action.

pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod fragment;
pub mod invoker;
pub mod keynodes;
pub mod remote;
pub mod services;
pub mod waiter;

#[cfg(test)]
mod testing;

pub use catalog::{ActionCatalog, ActionSpec, RoleSpec};
pub use config::InvokerConfig;
pub use error::{BuildError, InvokeError, InvokeResult};
pub use extract::{
    Cardinality, ExtractError, FieldSpec, FieldValue, MalformedResult, Payload, ReadAs, Record,
    RecordSpec, ResultExtractor, ResultSpec, ScalarType,
};
pub use fragment::{ActionFragment, ArgValue, GraphFragmentBuilder, RoleArg};
pub use invoker::{AgentInvoker, Invocation};
pub use keynodes::{MarkerCache, MarkerRef, ProtocolIdtfs, ProtocolMarkers, Sentinels};
pub use remote::{AsyncAgentInvoker, RemoteAgent};
pub use services::{AgentServices, ServiceReply};
pub use waiter::{CompletionOutcome, CompletionWaiter, CorrelationContext, PendingCompletion, WaitOutcome};
