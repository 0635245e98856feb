//! # scraperunner CLI
//!
//! Thin front-end over the engine: load a tasks file, run every task
//! through the scrape pipeline, and inspect the resulting journals.
//!
//! ```bash
//! # Admit and scrape a batch of URLs
//! scraperunner run --dir ./work --tasks tasks.json
//!
//! # Re-run previously failed tasks only (replay form tasks file)
//! scraperunner run --dir ./work --tasks keys.json
//!
//! # Force everything to re-run, through proxies, 8 at a time
//! scraperunner run --dir ./work --tasks tasks.json \
//!     --force all --max-parallel 8 --proxies proxies.json
//!
//! # Inspect the journals
//! scraperunner status --dir ./work
//! scraperunner summary --dir ./work
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use uuid::Uuid;

use scraperunner::executors::scrape::ScrapeExecutor;
use scraperunner::executors::Executor;
use scraperunner::loader;
use scraperunner::proxies::ProxyProvider;
use scraperunner::report;
use scraperunner::scheduler::{self, ExecuteOptions};

#[derive(Parser)]
#[command(name = "scraperunner")]
#[command(about = "Parallel scrape-task runner with a durable status journal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Only log errors. Ideal for CI.
    #[arg(long, short = 's', global = true, default_value = "false")]
    silent: bool,

    /// Log debug detail for every task and executor.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the scrape pipeline for every task in a tasks file.
    Run {
        /// Working directory for journals and scrape files.
        #[arg(short, long)]
        dir: PathBuf,

        /// Tasks file: JSON object (key → params) to admit tasks, or JSON
        /// array of keys to replay existing ones.
        #[arg(short, long)]
        tasks: PathBuf,

        /// Per-task pipeline timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Executor name to re-run even if previously successful.
        /// Repeatable; `--force all` re-runs everything.
        #[arg(long = "force")]
        force: Vec<String>,

        /// Concurrency cap (clamped to 1..=100).
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Proxies file: JSON array of URLs or object of country → URLs.
        #[arg(long)]
        proxies: Option<PathBuf>,
    },

    /// Print every journal entry as a table.
    Status {
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Print a per-executor histogram of journal statuses.
    Summary {
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Probe every proxy in a proxies file and report the dead ones.
    CheckProxies {
        #[arg(short, long)]
        proxies: PathBuf,

        /// Per-probe timeout in seconds.
        #[arg(long, default_value = "10")]
        timeout_secs: u64,

        /// Extra attempts per proxy after the first.
        #[arg(long, default_value = "1")]
        retries: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.silent {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.into()),
        )
        .try_init();

    let exit_code = match cli.command {
        Commands::Run {
            dir,
            tasks,
            timeout_secs,
            force,
            max_parallel,
            proxies,
        } => run(dir, tasks, timeout_secs, force, max_parallel, proxies).await,
        Commands::Status { dir } => status(dir),
        Commands::Summary { dir } => summary(dir),
        Commands::CheckProxies {
            proxies,
            timeout_secs,
            retries,
        } => check_proxies(proxies, timeout_secs, retries).await,
    };

    std::process::exit(exit_code);
}

async fn run(
    dir: PathBuf,
    tasks_path: PathBuf,
    timeout_secs: Option<u64>,
    force: Vec<String>,
    max_parallel: Option<usize>,
    proxies_path: Option<PathBuf>,
) -> i32 {
    let run_id = Uuid::new_v4().to_string();
    info!(run_id = %run_id, "scraperunner starting");

    let tasks = match loader::load_tasks_from_file(&tasks_path) {
        Ok(tasks) => tasks,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load tasks file");
            return 1;
        }
    };
    let total = tasks.len();

    let mut options = ExecuteOptions::from_env();
    if let Some(secs) = timeout_secs {
        options.timeout = Some(Duration::from_secs(secs));
    }
    if max_parallel.is_some() {
        options.max_parallelism = max_parallel;
    }
    options.force_executors = force;

    if let Some(path) = proxies_path {
        match loader::load_proxies_from_file(&path) {
            Ok(pool) => {
                options.proxy_provider = Some(Arc::new(pool) as Arc<dyn ProxyProvider>);
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load proxies file");
                return 1;
            }
        }
    }

    let executors: Vec<Arc<dyn Executor>> = vec![Arc::new(ScrapeExecutor::new())];

    match scheduler::execute(&executors, &dir, tasks, options).await {
        Ok(done) => {
            for key in &done {
                println!("{key}");
            }
            if done.len() < total {
                info!(
                    run_id = %run_id,
                    succeeded = done.len(),
                    failed = total - done.len(),
                    "run finished with failures"
                );
                1
            } else {
                info!(run_id = %run_id, succeeded = done.len(), "run finished");
                0
            }
        }
        Err(err) => {
            error!(run_id = %run_id, error = %format!("{err:#}"), "run aborted");
            1
        }
    }
}

fn status(dir: PathBuf) -> i32 {
    match report::dump_table(&dir) {
        Ok(table) => {
            print!("{table}");
            0
        }
        Err(err) => {
            error!(error = %err, "failed to scan journal directory");
            1
        }
    }
}

fn summary(dir: PathBuf) -> i32 {
    match report::status_histogram(&dir) {
        Ok((histogram, corrupt)) => {
            for (executor, buckets) in &histogram {
                println!("{executor}:");
                for (bucket, count) in buckets {
                    println!("  {count:>6}  {bucket}");
                }
            }
            for entry in &corrupt {
                println!("corrupt: {entry}");
            }
            0
        }
        Err(err) => {
            error!(error = %err, "failed to scan journal directory");
            1
        }
    }
}

async fn check_proxies(proxies_path: PathBuf, timeout_secs: u64, retries: u32) -> i32 {
    let pool = match loader::load_proxies_from_file(&proxies_path) {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load proxies file");
            return 1;
        }
    };

    pool.check_proxies(Duration::from_secs(timeout_secs), retries)
        .await;

    let dead = pool.bad_proxies().await;
    if dead.is_empty() {
        info!("all proxies answered the probe");
        0
    } else {
        for proxy in &dead {
            println!("{proxy}");
        }
        info!(dead = dead.len(), "some proxies failed the probe");
        1
    }
}
