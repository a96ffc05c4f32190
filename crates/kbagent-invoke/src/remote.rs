//! Async facade over [`AgentInvoker`].
//!
//! The invoker blocks while it waits for the server; here that wait runs on
//! tokio's blocking pool so only the calling task is suspended.

use crate::error::{InvokeError, InvokeResult};
use crate::extract::ResultSpec;
use crate::fragment::RoleArg;
use crate::invoker::{AgentInvoker, Invocation};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Remote procedure calls against the knowledge base, awaitable.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    async fn invoke(
        &self,
        kind: String,
        args: Vec<RoleArg>,
        spec: ResultSpec,
        timeout: Duration,
    ) -> InvokeResult<Invocation>;

    /// Catalogued action with its declared result shape and deadline.
    async fn call(&self, kind: String, args: Vec<RoleArg>) -> InvokeResult<Invocation>;
}

#[derive(Clone)]
pub struct AsyncAgentInvoker {
    inner: Arc<AgentInvoker>,
}

impl AsyncAgentInvoker {
    pub fn new(inner: Arc<AgentInvoker>) -> Self {
        Self { inner }
    }

    pub fn blocking(&self) -> &AgentInvoker {
        &self.inner
    }

    async fn run<F>(&self, job: F) -> InvokeResult<Invocation>
    where
        F: FnOnce(&AgentInvoker) -> InvokeResult<Invocation> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || job(&inner))
            .await
            .map_err(|err| InvokeError::Runtime(format!("invocation task failed: {err}")))?
    }
}

#[async_trait]
impl RemoteAgent for AsyncAgentInvoker {
    async fn invoke(
        &self,
        kind: String,
        args: Vec<RoleArg>,
        spec: ResultSpec,
        timeout: Duration,
    ) -> InvokeResult<Invocation> {
        self.run(move |invoker| invoker.invoke(&kind, &args, &spec, timeout))
            .await
    }

    async fn call(&self, kind: String, args: Vec<RoleArg>) -> InvokeResult<Invocation> {
        self.run(move |invoker| invoker.call(&kind, &args)).await
    }
}
