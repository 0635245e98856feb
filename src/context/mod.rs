// Module: Context
// The per-run resource bundle handed to every executor invocation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::proxies::ProxyProvider;

/// Sentinel force name meaning "re-run every executor".
pub const FORCE_ALL: &str = "all";

/// Shared resources for one `execute` call.
///
/// Created once per call and dropped when it returns; the HTTP session's
/// connection pool is scoped to that lifetime. Cloning is cheap: every
/// field is either small or reference-counted.
#[derive(Clone)]
pub struct Context {
    /// Working directory holding journals and per-task scratch files.
    pub dir: PathBuf,

    /// Pooled HTTP session, shared across all workers.
    pub session: reqwest::Client,

    /// Executor names to re-run even if previously successful. May contain
    /// the [`FORCE_ALL`] sentinel.
    pub forced: HashSet<String>,

    /// Global concurrency gate bounding how many tasks are inside the
    /// executor pipeline at once.
    pub semaphore: Arc<Semaphore>,

    /// Wall-clock budget for one task's whole pipeline.
    pub timeout: Duration,

    /// Optional proxy supplier for scrape-style executors.
    pub proxy_provider: Option<Arc<dyn ProxyProvider>>,
}

impl Context {
    /// Whether executor `name` must re-run regardless of prior success.
    pub fn is_forced(&self, name: &str) -> bool {
        self.forced.contains(FORCE_ALL) || self.forced.contains(name)
    }

    /// Conventional scratch path for a task-owned file, `<key>.<suffix>`.
    ///
    /// Executors must not touch another task's files.
    pub fn task_file(&self, key: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{key}.{suffix}"))
    }
}
