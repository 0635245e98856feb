//! # scraperunner - Parallel Task Execution Engine
//!
//! Executes fleets of independent tasks (typically URL fetches followed by
//! post-processing) through a fixed, ordered sequence of executors, while
//! persisting per-task progress to a durable on-disk journal.
//!
//! The journal makes runs resumable and selectively re-executable: executors
//! that already succeeded for a task are skipped on the next run unless
//! explicitly forced, and every outcome (success, skip, or classified error)
//! is visible in the task's `<key>.status.json` file.
//!
//! ```text
//! caller ──> scheduler::execute(executors, dir, tasks, options)
//!                  │
//!                  ├── worker per task (bounded by a semaphore)
//!                  │       └── executor pipeline, journaled step by step
//!                  └──> list of task keys that fully succeeded
//! ```

/// Per-run resource bundle handed to every executor invocation.
pub mod context;

/// Recoverable/fatal error taxonomy for executor runs.
pub mod errors;

/// The executor contract plus the built-in scrape executors.
pub mod executors;

/// Durable per-task status records with atomic writes.
pub mod journal;

/// Parsing for the task and proxy files handed to the CLI.
pub mod loader;

/// Proxy provider interface and the bucketed proxy pool.
pub mod proxies;

/// Summary utilities over a directory of journals.
pub mod report;

/// The `execute` primitive: admission, sequencing, concurrency, timeouts.
pub mod scheduler;
