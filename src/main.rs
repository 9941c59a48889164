//! listing-relay binary entrypoint.
//! Loads configuration, opens the announcement store, starts the optional
//! status server and drives relay cycles until Ctrl-C / SIGTERM.
//!
//! `listing-relay --once` runs a single cycle and exits.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use listing_relay::api::{create_router, AppState};
use listing_relay::config::AppConfig;
use listing_relay::history::CycleHistory;
use listing_relay::metrics::Metrics;
use listing_relay::pipeline::Pipeline;
use listing_relay::scheduler::{spawn_signal_listener, Scheduler};
use listing_relay::store::{AnnouncementStore, JsonStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    listing_relay::init_tracing();

    let once = std::env::args().any(|a| a == "--once");

    let cfg = AppConfig::load()?;
    let store: Arc<dyn AnnouncementStore> = match cfg.store.path.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => Arc::new(JsonStore::open(p).await.context("opening announcement store")?),
        None => {
            tracing::warn!(target: "store", "no store path configured, state is not persisted");
            Arc::new(JsonStore::in_memory())
        }
    };

    let pipeline = Arc::new(Pipeline::from_config(&cfg, store.clone())?);

    if once {
        let report = pipeline.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let history = Arc::new(CycleHistory::default());

    if let Some(bind) = cfg.server.bind.clone() {
        let metrics = Metrics::init()?;
        let app = create_router(AppState {
            store: store.clone(),
            history: history.clone(),
            metrics: Some(metrics),
        });
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding status server to {bind}"))?;
        tracing::info!(target: "listing_relay", %bind, "status server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(target: "listing_relay", error = %e, "status server stopped");
            }
        });
    }

    let scheduler = Scheduler::new(
        pipeline,
        Duration::from_secs(cfg.scheduler.interval_secs),
        Duration::from_secs(cfg.scheduler.error_cooldown_secs),
        history,
    );
    spawn_signal_listener(scheduler.shutdown_flag());
    scheduler.run().await;

    Ok(())
}
