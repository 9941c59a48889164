// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod history;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::AppConfig;
pub use crate::error::{CycleError, ExtractionFailure, FetchError, PersistenceError, PublishError};
pub use crate::pipeline::{CycleReport, Pipeline};
pub use crate::store::{AnnouncementStore, JsonStore};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn,html5ever=warn,selectors=warn";

/// Install the global tracing subscriber.
/// Compact output by default, JSON lines when `LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialised: {e}");
    }
}
