use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctsieve_manager::cache::DedupCache;
use ctsieve_manager::cli::Cli;
use ctsieve_manager::coordinator::Coordinator;
use ctsieve_manager::http::{AppState, router};
use ctsieve_manager::store::{CatalogLog, Store};

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let store = match Store::open(&cli.db) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("error: open database {}: {err:#}", cli.db.display());
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.catalog {
        let logs: Vec<CatalogLog> = match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(logs) => logs,
            Err(err) => {
                eprintln!("error: load catalog {}: {err:#}", path.display());
                std::process::exit(1);
            }
        };
        let created = store
            .apply_catalog(&logs, cli.chunk_width)
            .context("apply catalog")?;
        info!(
            logs = logs.len(),
            new_ranges = created,
            "catalog loaded from {}",
            path.display()
        );
    }

    let cache = Arc::new(DedupCache::new(cli.cache_max_size));
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        cli.stale_secs,
        cli.abandon_secs,
    ));

    let reaper = {
        let coordinator = coordinator.clone();
        let mut tick = tokio::time::interval(Duration::from_secs(cli.reap_interval_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                match coordinator.reap_stale() {
                    Ok(summary) if summary.stalled > 0 || summary.reclaimed > 0 => {
                        info!(
                            stalled = summary.stalled,
                            reclaimed = summary.reclaimed,
                            "reaped stale assignments"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!("reap sweep failed: {err}"),
                }
            }
        })
    };

    let app = router(AppState {
        store,
        coordinator,
        cache,
    });
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    info!("listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serve http api")?;

    reaper.abort();
    Ok(())
}
