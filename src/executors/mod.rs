// Module: Executors
// The per-task pipeline contract plus the built-in scrape executors.

pub mod scrape;

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::errors::ExecError;
use crate::journal::StatusData;

/// Output of one executor run.
#[derive(Debug, Clone)]
pub struct Patch {
    /// JSON stored in the journal under the executor's name. An empty
    /// object is legal.
    pub value: Value,

    /// Whether real work happened. When false the scheduler records the
    /// success without bumping `<name>_last_run`.
    pub updated: bool,
}

impl Patch {
    /// A result from real work; stamps `<name>_last_run`.
    pub fn updated(value: Value) -> Self {
        Self {
            value,
            updated: true,
        }
    }

    /// A no-op success; leaves `<name>_last_run` untouched.
    pub fn unchanged(value: Value) -> Self {
        Self {
            value,
            updated: false,
        }
    }
}

/// One named async step of a task pipeline.
///
/// The name is an explicit part of the value: it is the journal key under
/// which the executor's output (`<name>`), status (`<name>_status`) and run
/// timestamp (`<name>_last_run`) land.
///
/// Failure contract: return a recoverable [`ExecError`] variant to mark the
/// task errored and move on to the next task, or [`ExecError::Fatal`] to
/// abort the whole run.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Processes one task. `status` is the task's current journal entry,
    /// including prior executors' output from this and earlier runs.
    async fn run(
        &self,
        ctx: &Context,
        key: &str,
        status: &StatusData,
    ) -> Result<Patch, ExecError>;
}

/// Adapts a plain async function into the [`Executor`] contract.
///
/// This is the convenience for executors that have no state of their own:
/// supply the name and a function producing the patch, and the scheduler
/// handles namespacing and bookkeeping.
///
/// ```ignore
/// let probe = FnExecutor::new("probe", |_ctx, _key, _status| async move {
///     Ok(Patch::updated(serde_json::json!({"checked": true})))
/// });
/// ```
pub struct FnExecutor<F> {
    name: String,
    body: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Context, String, StatusData) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Patch, ExecError>> + Send,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Context, String, StatusData) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Patch, ExecError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        ctx: &Context,
        key: &str,
        status: &StatusData,
    ) -> Result<Patch, ExecError> {
        (self.body)(ctx.clone(), key.to_string(), status.clone()).await
    }
}
