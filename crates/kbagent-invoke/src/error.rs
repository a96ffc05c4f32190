//! Errors that abort an invocation.
//!
//! Outcomes the server reports (failed, errored, timed out, malformed
//! result) are not errors here; they come back as [`crate::Invocation`]
//! variants.

use kbagent_graph::{NodeKind, TransportError};

/// Caller-side mistakes in the argument list of an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("role index {0} is used more than once")]
    DuplicateRole(u32),
    #[error("role indices start at 1")]
    ZeroRole,
    #[error("tuple role '{0}' is used more than once")]
    DuplicateTupleRole(String),
    #[error("tuple argument for role {0} has no members")]
    EmptyTuple(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("knowledge base is not connected")]
    Disconnected,
    #[error("unresolved identifier '{idtf}' ({kind:?})")]
    UnresolvedIdentifier { idtf: String, kind: NodeKind },
    #[error("invalid argument spec: {0}")]
    InvalidArgumentSpec(#[from] BuildError),
    #[error("unknown action kind '{0}'")]
    UnknownAction(String),
    #[error("arguments for '{kind}' do not match the catalog: {reason}")]
    CatalogMismatch { kind: String, reason: String },
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<TransportError> for InvokeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => InvokeError::Disconnected,
            TransportError::UnresolvedIdentifier { idtf, kind } => {
                InvokeError::UnresolvedIdentifier { idtf, kind }
            }
            other => InvokeError::Transport(other),
        }
    }
}

pub type InvokeResult<T> = Result<T, InvokeError>;
