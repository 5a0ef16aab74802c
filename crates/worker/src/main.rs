use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ctsieve_core::api::MAX_UPLOAD_BATCH;
use ctsieve_core::filter::SuffixFilter;
use ctsieve_worker::cli::Cli;
use ctsieve_worker::ctlog::CtLogClient;
use ctsieve_worker::fetch::{FetchConfig, run_category_loop};
use ctsieve_worker::manager_api::ManagerClient;
use ctsieve_worker::shutdown::spawn_signal_handler;
use ctsieve_worker::spool::{Spool, run_spool_reaper};

/// Budget for draining buffers and resuming assignments on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn generated_worker_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..12])
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.batch_size == 0 || cli.batch_size > MAX_UPLOAD_BATCH {
        eprintln!(
            "error: --batch-size must be between 1 and {MAX_UPLOAD_BATCH} (got {})",
            cli.batch_size
        );
        std::process::exit(1);
    }
    if cli.categories.iter().all(|c| c.trim().is_empty()) {
        eprintln!("error: no log categories configured");
        std::process::exit(1);
    }

    let worker_name = cli
        .worker_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(generated_worker_name);
    info!(worker = %worker_name, manager = %cli.manager_url, "starting");

    let manager = match ManagerClient::new(
        cli.manager_url.clone(),
        worker_name,
        Duration::from_secs(cli.control_timeout_secs),
        Duration::from_secs(cli.upload_timeout_secs),
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("error: build manager client: {err:#}");
            std::process::exit(1);
        }
    };

    let ctlog = match CtLogClient::new(
        &cli.proxies,
        Duration::from_secs(cli.fetch_timeout_secs),
        cli.fetch_retry_cap,
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("error: build ct log client: {err:#}");
            std::process::exit(1);
        }
    };

    let spool = match Spool::open(&cli.spool_dir) {
        Ok(spool) => Arc::new(spool),
        Err(err) => {
            eprintln!(
                "error: open spool directory {}: {err:#}",
                cli.spool_dir.display()
            );
            std::process::exit(1);
        }
    };

    // the manager must be reachable before any task starts
    let mut reachable = false;
    for attempt in 1..=cli.startup_retries.max(1) {
        match manager.health().await {
            Ok(()) => {
                reachable = true;
                break;
            }
            Err(err) => {
                warn!(attempt, "manager not reachable yet: {err:#}");
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }
    }
    if !reachable {
        eprintln!(
            "error: manager unreachable at {} after {} attempts",
            cli.manager_url, cli.startup_retries
        );
        std::process::exit(2);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    spawn_signal_handler(cancel_tx);

    let mut tasks = JoinSet::new();
    tasks.spawn(run_spool_reaper(
        spool.clone(),
        manager.clone(),
        Duration::from_secs(cli.spool_interval_secs.max(1)),
        cancel_rx.clone(),
    ));

    let suffix = SuffixFilter::new(&cli.suffix);
    for category in cli
        .categories
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
    {
        let cfg = FetchConfig {
            category: category.to_string(),
            suffix: suffix.clone(),
            upload_batch: cli.batch_size,
            fetch_batch: cli.fetch_batch.max(1),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs.max(1)),
            flush_interval: Duration::from_secs(cli.flush_secs.max(1)),
        };
        tasks.spawn(run_category_loop(
            cfg,
            manager.clone(),
            ctlog.clone(),
            spool.clone(),
            cancel_rx.clone(),
        ));
    }

    let mut cancel_watch = cancel_rx.clone();
    loop {
        tokio::select! {
            changed = cancel_watch.changed() => {
                if changed.is_err() || *cancel_watch.borrow() {
                    break;
                }
            }
            res = tasks.join_next() => {
                match res {
                    None => {
                        warn!("all worker tasks exited");
                        return;
                    }
                    Some(Ok(())) => {}
                    Some(Err(err)) => warn!("worker task failed: {err}"),
                }
            }
        }
    }

    if tokio::time::timeout(DRAIN_DEADLINE, drain_all(&mut tasks))
        .await
        .is_err()
    {
        warn!("drain deadline exceeded; aborting remaining tasks");
        tasks.abort_all();
        drain_all(&mut tasks).await;
    }
    info!("clean shutdown");
}

async fn drain_all(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            if !err.is_cancelled() {
                warn!("worker task failed during drain: {err}");
            }
        }
    }
}
