//! # Scheduler
//!
//! The `execute` primitive: materializes the task list, spawns one logical
//! worker per task under a global concurrency gate, drives each task's
//! executor pipeline in order, classifies failures, and returns the keys of
//! the tasks whose every executor settled in `SUCCESS` or `SKIPPED`.
//!
//! ## Per-task pipeline
//!
//! ```text
//! acquire gate permit
//!   └─ load / create journal entry
//!        └─ for each executor, in caller order:
//!             prior SUCCESS and not forced?  → SKIPPED, persist, continue
//!             run under the pipeline deadline
//!               success            → merge patch, SUCCESS, persist
//!               recoverable error  → ERROR <Kind>::<msg>, persist, stop task
//!               fatal error        → persist, propagate out of execute
//! ```
//!
//! The deadline is one wall-clock budget for the task's whole pipeline,
//! started right after the permit is acquired; it is not reset between
//! executors.
//!
//! Recoverable failures never abort sibling tasks. A fatal failure lets
//! already-running workers finish (each persists its own journal entry)
//! and then escapes to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::context::Context;
use crate::errors::ExecError;
use crate::executors::Executor;
use crate::journal::{self, ExecStatus, StatusData};
use crate::proxies::ProxyProvider;

/// Default per-task pipeline budget.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default concurrency when the caller does not pick one.
pub const DEFAULT_MAX_PARALLEL: usize = 16;

/// Hard ceiling on the concurrency gate.
pub const MAX_PARALLEL_CEILING: usize = 100;

/// The task list handed to [`execute`].
#[derive(Debug, Clone)]
pub enum Tasks {
    /// Admission form: key → params. Journal entries are created or merged
    /// (name and params written, prior executor results preserved) before
    /// any executor runs.
    Admit(Vec<(String, Map<String, Value>)>),

    /// Replay form: keys whose journal entries must already exist. A key
    /// with no entry is reported failed and skipped, not a crash.
    Replay(Vec<String>),
}

impl Tasks {
    /// Maps a JSON value onto a task list: an object is the admission
    /// form, an array of strings the replay form.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                let mut items = Vec::with_capacity(map.len());
                for (key, params) in map {
                    let Value::Object(params) = params else {
                        bail!("params for task '{key}' must be a JSON object");
                    };
                    items.push((key, params));
                }
                Ok(Self::Admit(items))
            }
            Value::Array(values) => {
                let mut keys = Vec::with_capacity(values.len());
                for value in values {
                    let Value::String(key) = value else {
                        bail!("replay task list must contain only strings");
                    };
                    keys.push(key);
                }
                Ok(Self::Replay(keys))
            }
            _ => bail!("tasks must be a JSON object (admission) or array of keys (replay)"),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Admit(items) => items.len(),
            Self::Replay(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tuning knobs for one [`execute`] call.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Wall-clock budget for each task's whole pipeline.
    /// `None` → [`DEFAULT_TIMEOUT_SECS`].
    pub timeout: Option<Duration>,

    /// Executor names to re-run regardless of prior success. The single
    /// entry `"all"` forces everything.
    pub force_executors: Vec<String>,

    /// Concurrency gate capacity, clamped to `[1, 100]`.
    /// `None` → [`DEFAULT_MAX_PARALLEL`].
    pub max_parallelism: Option<usize>,

    /// Optional proxy supplier handed to scrape-style executors.
    pub proxy_provider: Option<Arc<dyn ProxyProvider>>,
}

impl ExecuteOptions {
    /// Options seeded from the environment:
    /// `SCRAPERUNNER_MAX_PARALLEL` and `SCRAPERUNNER_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(raw) = std::env::var("SCRAPERUNNER_MAX_PARALLEL") {
            if let Ok(n) = raw.parse() {
                options.max_parallelism = Some(n);
            }
        }
        if let Ok(raw) = std::env::var("SCRAPERUNNER_TIMEOUT_SECS") {
            if let Ok(secs) = raw.parse() {
                options.timeout = Some(Duration::from_secs(secs));
            }
        }

        options
    }
}

/// Clamps the requested gate capacity into `[1, MAX_PARALLEL_CEILING]`.
fn effective_parallelism(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_MAX_PARALLEL)
        .clamp(1, MAX_PARALLEL_CEILING)
}

/// Per-task worker input: admission params or a replay marker.
enum TaskForm {
    Admit(Map<String, Value>),
    Replay,
}

/// Runs every task through every executor and returns the keys of the
/// tasks that fully succeeded, in admission order.
///
/// Fatal conditions (duplicate keys, corrupt journal on replay, executor
/// programming errors) make the whole call fail after in-flight tasks have
/// flushed their journal entries.
pub async fn execute(
    executors: &[Arc<dyn Executor>],
    dir: &Path,
    tasks: Tasks,
    options: ExecuteOptions,
) -> Result<Vec<String>> {
    let items: Vec<(String, TaskForm)> = match tasks {
        Tasks::Admit(entries) => entries
            .into_iter()
            .map(|(key, params)| (key, TaskForm::Admit(params)))
            .collect(),
        Tasks::Replay(keys) => keys
            .into_iter()
            .map(|key| (key, TaskForm::Replay))
            .collect(),
    };

    let mut seen = HashSet::new();
    for (key, _) in &items {
        if key.is_empty() {
            bail!("task keys must be non-empty");
        }
        if !seen.insert(key.as_str()) {
            bail!("task '{key}' admitted twice in one run");
        }
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("create working directory {}", dir.display()))?;

    let max_parallel = effective_parallelism(options.max_parallelism);
    let ctx = Context {
        dir: dir.to_path_buf(),
        session: reqwest::Client::new(),
        forced: options.force_executors.into_iter().collect(),
        semaphore: Arc::new(Semaphore::new(max_parallel)),
        timeout: options
            .timeout
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        proxy_provider: options.proxy_provider,
    };
    let executors: Arc<Vec<Arc<dyn Executor>>> = Arc::new(executors.to_vec());

    info!(
        tasks = items.len(),
        executors = executors.len(),
        max_parallel,
        dir = %dir.display(),
        "starting run"
    );

    let mut workers = JoinSet::new();
    for (index, (key, form)) in items.into_iter().enumerate() {
        let ctx = ctx.clone();
        let executors = executors.clone();
        workers.spawn(async move {
            let verdict = run_task(&ctx, &executors, &key, form).await;
            (index, key, verdict)
        });
    }

    let mut succeeded: Vec<(usize, String)> = Vec::new();
    let mut fatal: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, key, Ok(true))) => succeeded.push((index, key)),
            Ok((_, _, Ok(false))) => {}
            Ok((_, key, Err(err))) => {
                error!(key = %key, error = %format!("{err:#}"), "task failed fatally");
                if fatal.is_none() {
                    fatal = Some(err.context(format!("task '{key}'")));
                }
            }
            Err(join_err) => {
                if fatal.is_none() {
                    fatal = Some(anyhow::anyhow!("worker join error: {join_err}"));
                }
            }
        }
    }

    if let Some(err) = fatal {
        return Err(err);
    }

    succeeded.sort_by_key(|(index, _)| *index);
    let keys: Vec<String> = succeeded.into_iter().map(|(_, key)| key).collect();
    info!(succeeded = keys.len(), "run finished");
    Ok(keys)
}

/// Drives one task through the executor pipeline.
///
/// `Ok(true)` when every executor settled good, `Ok(false)` for a
/// recoverable per-task failure, `Err` for conditions fatal to the run.
async fn run_task(
    ctx: &Context,
    executors: &[Arc<dyn Executor>],
    key: &str,
    form: TaskForm,
) -> Result<bool> {
    let _permit = ctx
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .context("concurrency gate closed")?;

    let mut status = match form {
        TaskForm::Admit(params) => {
            // Merge over any prior entry so earlier executor results survive.
            let mut status = journal::load(&ctx.dir, key)?.unwrap_or_default();
            status.set("name", Value::String(key.to_string()));
            status.set("params", Value::Object(params));
            journal::save(&ctx.dir, key, &status)?;
            status
        }
        TaskForm::Replay => match journal::load(&ctx.dir, key)? {
            Some(existing) => existing,
            None => {
                error!(key = %key, "no journal entry for replayed task");
                return Ok(false);
            }
        },
    };

    // One budget for the whole pipeline, started once the gate is passed.
    let deadline = Instant::now() + ctx.timeout;

    for executor in executors {
        let name = executor.name();

        // SUCCESS skips, and SKIPPED stays skipped: only an error (or a
        // force) earns a re-run.
        let prior = status.executor_status(name);
        if prior.as_ref().is_some_and(ExecStatus::is_ok) && !ctx.is_forced(name) {
            status.set_executor_status(name, &ExecStatus::Skipped);
            journal::save(&ctx.dir, key, &status)?;
            info!(key = %key, executor = %name, "skipped (already successful)");
            continue;
        }

        info!(key = %key, executor = %name, "running executor");
        let outcome = match timeout_at(deadline, executor.run(ctx, key, &status)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ExecError::Timeout),
        };

        match outcome {
            Ok(patch) => {
                status.record_result(name, patch.value);
                status.set_executor_status(name, &ExecStatus::Success);
                if patch.updated {
                    status.stamp_last_run(name, journal::timestamp());
                }
                journal::save(&ctx.dir, key, &status)?;
            }
            Err(ExecError::Fatal(err)) => {
                // Flush what is known before letting the error escape.
                journal::save(&ctx.dir, key, &status)?;
                return Err(err.context(format!("executor '{name}'")));
            }
            Err(err) => {
                let label = err.status_label();
                warn!(key = %key, executor = %name, status = %label, "executor failed");
                status.set_executor_status(name, &ExecStatus::Error(err.status_detail()));
                status.stamp_last_run(name, journal::timestamp());
                journal::save(&ctx.dir, key, &status)?;
                return Ok(false);
            }
        }
    }

    Ok(status.is_complete(executors.iter().map(|e| e.name())))
}

/// Journal file path for a task key; exported for callers that want to
/// inspect entries after a run.
pub fn journal_path(dir: &Path, key: &str) -> PathBuf {
    journal::journal_path(dir, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::executors::scrape::ScrapeExecutor;
    use crate::executors::{FnExecutor, Patch};

    fn admit(entries: &[(&str, Value)]) -> Tasks {
        let items = entries
            .iter()
            .map(|(key, params)| {
                (
                    key.to_string(),
                    params.as_object().cloned().unwrap_or_default(),
                )
            })
            .collect();
        Tasks::Admit(items)
    }

    fn scrape_executors() -> Vec<Arc<dyn Executor>> {
        vec![Arc::new(ScrapeExecutor::new())]
    }

    async fn mock_page(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.as_bytes().to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_cold_scrape_of_two_urls() {
        let server = MockServer::start().await;
        mock_page(&server, "/g", "X").await;
        mock_page(&server, "/b", "YY").await;

        let dir = tempfile::tempdir().unwrap();
        let tasks = admit(&[
            ("g", json!({"url": format!("{}/g", server.uri())})),
            ("b", json!({"url": format!("{}/b", server.uri())})),
        ]);

        let done = execute(
            &scrape_executors(),
            dir.path(),
            tasks,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(done, vec!["g".to_string(), "b".to_string()]);

        let g = journal::load(dir.path(), "g").unwrap().unwrap();
        assert_eq!(g.name(), Some("g"));
        assert_eq!(g.get("scraper").unwrap()["size"], json!(1));
        assert_eq!(
            g.get("scraper").unwrap()["content"],
            json!(format!("{:x}", md5::compute("X")))
        );
        assert_eq!(g.executor_status("scraper"), Some(ExecStatus::Success));
        assert!(g.last_run("scraper").is_some());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("g.scrape")).unwrap(),
            "X"
        );

        let b = journal::load(dir.path(), "b").unwrap().unwrap();
        assert_eq!(b.get("scraper").unwrap()["size"], json!(2));
    }

    #[tokio::test]
    async fn test_replay_skips_success_and_reruns_error() {
        let server = MockServer::start().await;
        mock_page(&server, "/g", "X").await;
        mock_page(&server, "/b", "YY").await;

        let dir = tempfile::tempdir().unwrap();

        // Seed: g already succeeded, b previously errored.
        let mut g = StatusData::new(
            "g",
            json!({"url": format!("{}/g", server.uri())})
                .as_object()
                .cloned()
                .unwrap(),
        );
        g.record_result("scraper", json!({"size": 1}));
        g.set_executor_status("scraper", &ExecStatus::Success);
        g.stamp_last_run("scraper", "2022-08-05 16:03:52.336815".to_string());
        journal::save(dir.path(), "g", &g).unwrap();

        let mut b = StatusData::new(
            "b",
            json!({"url": format!("{}/b", server.uri())})
                .as_object()
                .cloned()
                .unwrap(),
        );
        b.set_executor_status(
            "scraper",
            &ExecStatus::Error("RuntimeError::HTTP response 500".to_string()),
        );
        b.stamp_last_run("scraper", "2022-08-05 16:03:52.336815".to_string());
        journal::save(dir.path(), "b", &b).unwrap();

        let done = execute(
            &scrape_executors(),
            dir.path(),
            Tasks::Replay(vec!["g".to_string(), "b".to_string()]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(done, vec!["g".to_string(), "b".to_string()]);

        let g = journal::load(dir.path(), "g").unwrap().unwrap();
        assert_eq!(g.executor_status("scraper"), Some(ExecStatus::Skipped));
        assert_eq!(g.last_run("scraper"), Some("2022-08-05 16:03:52.336815"));

        let b = journal::load(dir.path(), "b").unwrap().unwrap();
        assert_eq!(b.executor_status("scraper"), Some(ExecStatus::Success));
        assert_ne!(b.last_run("scraper"), Some("2022-08-05 16:03:52.336815"));
    }

    #[tokio::test]
    async fn test_force_all_reruns_everything() {
        let server = MockServer::start().await;
        mock_page(&server, "/g", "X").await;

        let dir = tempfile::tempdir().unwrap();
        let mut g = StatusData::new(
            "g",
            json!({"url": format!("{}/g", server.uri())})
                .as_object()
                .cloned()
                .unwrap(),
        );
        g.record_result("scraper", json!({}));
        g.set_executor_status("scraper", &ExecStatus::Success);
        g.stamp_last_run("scraper", "2022-08-05 16:03:52.336815".to_string());
        journal::save(dir.path(), "g", &g).unwrap();

        let options = ExecuteOptions {
            force_executors: vec!["all".to_string()],
            ..Default::default()
        };
        let done = execute(
            &scrape_executors(),
            dir.path(),
            Tasks::Replay(vec!["g".to_string()]),
            options,
        )
        .await
        .unwrap();

        assert_eq!(done, vec!["g".to_string()]);
        let g = journal::load(dir.path(), "g").unwrap().unwrap();
        assert_eq!(g.executor_status("scraper"), Some(ExecStatus::Success));
        assert_ne!(g.last_run("scraper"), Some("2022-08-05 16:03:52.336815"));
    }

    #[tokio::test]
    async fn test_http_500_is_recorded_and_task_excluded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/err"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tasks = admit(&[("k", json!({"url": format!("{}/err", server.uri())}))]);

        let done = execute(
            &scrape_executors(),
            dir.path(),
            tasks,
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(done.is_empty());
        let k = journal::load(dir.path(), "k").unwrap().unwrap();
        assert_eq!(
            k.executor_status("scraper"),
            Some(ExecStatus::Error(
                "RuntimeError::HTTP response 500".to_string()
            ))
        );
        assert!(!dir.path().join("k.scrape").exists());
    }

    #[tokio::test]
    async fn test_timeout_marks_task_and_leaves_siblings_alone() {
        let slow = FnExecutor::new("slow", |_ctx, key, _status| async move {
            if key == "stuck" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Patch::updated(json!({})))
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(slow)];

        let dir = tempfile::tempdir().unwrap();
        let tasks = admit(&[("stuck", json!({})), ("quick", json!({}))]);
        let options = ExecuteOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };

        let done = execute(&executors, dir.path(), tasks, options).await.unwrap();

        assert_eq!(done, vec!["quick".to_string()]);
        let stuck = journal::load(dir.path(), "stuck").unwrap().unwrap();
        let raw = stuck.get("slow_status").unwrap().as_str().unwrap();
        assert!(raw.starts_with("ERROR TimeoutError::"), "got {raw}");
    }

    #[tokio::test]
    async fn test_validation_rejection_removes_file_sibling_passes() {
        let server = MockServer::start().await;
        mock_page(&server, "/good", "body with MARKER inside").await;
        mock_page(&server, "/bad", "nothing to see").await;

        let executors: Vec<Arc<dyn Executor>> =
            vec![Arc::new(ScrapeExecutor::with_validation(|body| {
                if body.windows(6).any(|w| w == b"MARKER") {
                    Ok(())
                } else {
                    Err("marker not found in body".to_string())
                }
            }))];

        let dir = tempfile::tempdir().unwrap();
        let tasks = admit(&[
            ("good", json!({"url": format!("{}/good", server.uri())})),
            ("bad", json!({"url": format!("{}/bad", server.uri())})),
        ]);

        let done = execute(&executors, dir.path(), tasks, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(done, vec!["good".to_string()]);
        assert!(dir.path().join("good.scrape").exists());
        assert!(!dir.path().join("bad.scrape").exists());

        let bad = journal::load(dir.path(), "bad").unwrap().unwrap();
        let raw = bad.get("scraper_status").unwrap().as_str().unwrap();
        assert!(raw.starts_with("ERROR RuntimeError::"), "got {raw}");
    }

    #[tokio::test]
    async fn test_second_run_skips_without_touching_last_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_exec = runs.clone();
        let probe = FnExecutor::new("probe", move |_ctx, _key, _status| {
            let runs = runs_in_exec.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(Patch::updated(json!({"ok": true})))
            }
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(probe)];

        let dir = tempfile::tempdir().unwrap();
        let tasks = admit(&[("t", json!({}))]);

        let first = execute(
            &executors,
            dir.path(),
            tasks.clone(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(first, vec!["t".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stamped = journal::load(dir.path(), "t")
            .unwrap()
            .unwrap()
            .last_run("probe")
            .unwrap()
            .to_string();

        let second = execute(
            &executors,
            dir.path(),
            tasks.clone(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(second, vec!["t".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 1, "skip must not re-run");

        let t = journal::load(dir.path(), "t").unwrap().unwrap();
        assert_eq!(t.executor_status("probe"), Some(ExecStatus::Skipped));
        assert_eq!(t.last_run("probe"), Some(stamped.as_str()));

        // A third run finds SKIPPED and still does not re-run.
        let third = execute(&executors, dir.path(), tasks, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(third, vec!["t".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrent_pipelines() {
        let current = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));
        let (current_in, max_in) = (current.clone(), observed_max.clone());

        let probe = FnExecutor::new("probe", move |_ctx, _key, _status| {
            let current = current_in.clone();
            let observed_max = max_in.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Patch::updated(json!({})))
            }
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(probe)];

        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<(String, Map<String, Value>)> = (0..10)
            .map(|i| (format!("t{i}"), Map::new()))
            .collect();
        let options = ExecuteOptions {
            max_parallelism: Some(2),
            ..Default::default()
        };

        let done = execute(&executors, dir.path(), Tasks::Admit(entries), options)
            .await
            .unwrap();

        assert_eq!(done.len(), 10);
        assert!(
            observed_max.load(Ordering::SeqCst) <= 2,
            "gate capacity exceeded: {}",
            observed_max.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_max_parallelism_one_serializes() {
        let current = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));
        let (current_in, max_in) = (current.clone(), observed_max.clone());

        let probe = FnExecutor::new("probe", move |_ctx, _key, _status| {
            let current = current_in.clone();
            let observed_max = max_in.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Patch::updated(json!({})))
            }
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(probe)];

        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<(String, Map<String, Value>)> =
            (0..5).map(|i| (format!("t{i}"), Map::new())).collect();
        let options = ExecuteOptions {
            max_parallelism: Some(1),
            ..Default::default()
        };

        execute(&executors, dir.path(), Tasks::Admit(entries), options)
            .await
            .unwrap();
        assert_eq!(observed_max.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parallelism_clamping() {
        assert_eq!(effective_parallelism(None), DEFAULT_MAX_PARALLEL);
        assert_eq!(effective_parallelism(Some(0)), 1);
        assert_eq!(effective_parallelism(Some(1)), 1);
        assert_eq!(effective_parallelism(Some(100)), 100);
        assert_eq!(effective_parallelism(Some(5000)), 100);
    }

    #[tokio::test]
    async fn test_replay_of_unknown_key_fails_without_crash() {
        let dir = tempfile::tempdir().unwrap();
        let done = execute(
            &scrape_executors(),
            dir.path(),
            Tasks::Replay(vec!["ghost".to_string()]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(done.is_empty());
        assert!(journal::load(dir.path(), "ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Tasks::Replay(vec!["k".to_string(), "k".to_string()]);

        let err = execute(
            &scrape_executors(),
            dir.path(),
            tasks,
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("admitted twice"));
    }

    #[tokio::test]
    async fn test_error_halts_remaining_executors_for_task() {
        let second_ran = Arc::new(AtomicUsize::new(0));
        let second_ran_in = second_ran.clone();

        let failing = FnExecutor::new("first", |_ctx, _key, _status| async move {
            Err::<Patch, _>(ExecError::runtime("boom"))
        });
        let recording = FnExecutor::new("second", move |_ctx, _key, _status| {
            let counter = second_ran_in.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Patch::updated(json!({})))
            }
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(failing), Arc::new(recording)];

        let dir = tempfile::tempdir().unwrap();
        let done = execute(
            &executors,
            dir.path(),
            admit(&[("t", json!({}))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(done.is_empty());
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);

        let t = journal::load(dir.path(), "t").unwrap().unwrap();
        assert_eq!(
            t.executor_status("first"),
            Some(ExecStatus::Error("RuntimeError::boom".to_string()))
        );
        assert!(t.executor_status("second").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_patch_skips_last_run_stamp() {
        let noop = FnExecutor::new("noop", |_ctx, _key, _status| async move {
            Ok(Patch::unchanged(json!({})))
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(noop)];

        let dir = tempfile::tempdir().unwrap();
        let done = execute(
            &executors,
            dir.path(),
            admit(&[("t", json!({}))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(done, vec!["t".to_string()]);
        let t = journal::load(dir.path(), "t").unwrap().unwrap();
        assert_eq!(t.executor_status("noop"), Some(ExecStatus::Success));
        assert_eq!(t.get("noop"), Some(&json!({})));
        assert!(t.last_run("noop").is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_escapes_after_flush() {
        let fatal = FnExecutor::new("fatal", |_ctx, _key, _status| async move {
            Err::<Patch, _>(ExecError::Fatal(anyhow::anyhow!("programming error")))
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(fatal)];

        let dir = tempfile::tempdir().unwrap();
        let err = execute(
            &executors,
            dir.path(),
            admit(&[("t", json!({}))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("programming error"));
        // The admission write survived the abort.
        let t = journal::load(dir.path(), "t").unwrap().unwrap();
        assert_eq!(t.name(), Some("t"));
    }

    #[tokio::test]
    async fn test_admission_merge_preserves_prior_results() {
        let dir = tempfile::tempdir().unwrap();

        let mut prior = StatusData::new(
            "t",
            json!({"url": "http://old/"}).as_object().cloned().unwrap(),
        );
        prior.record_result("scraper", json!({"size": 7}));
        prior.set_executor_status("scraper", &ExecStatus::Success);
        journal::save(dir.path(), "t", &prior).unwrap();

        let probe = FnExecutor::new("probe", |_ctx, _key, _status| async move {
            Ok(Patch::updated(json!({})))
        });
        let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(probe)];

        execute(
            &executors,
            dir.path(),
            admit(&[("t", json!({"url": "http://new/"}))]),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

        let t = journal::load(dir.path(), "t").unwrap().unwrap();
        // New params won, old executor output survived.
        assert_eq!(t.params().unwrap().get("url"), Some(&json!("http://new/")));
        assert_eq!(t.get("scraper"), Some(&json!({"size": 7})));
        assert_eq!(t.executor_status("probe"), Some(ExecStatus::Success));
    }

    #[test]
    fn test_tasks_from_json_forms() {
        let admit = Tasks::from_json(json!({"k": {"url": "http://a/"}})).unwrap();
        assert!(matches!(admit, Tasks::Admit(ref items) if items.len() == 1));

        let replay = Tasks::from_json(json!(["a", "b"])).unwrap();
        assert!(matches!(replay, Tasks::Replay(ref keys) if keys.len() == 2));

        assert!(Tasks::from_json(json!(42)).is_err());
        assert!(Tasks::from_json(json!({"k": "not an object"})).is_err());
    }
}
