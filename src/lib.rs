//! Proxy Pool - Proxy Source Ingestion and Validation
//!
//! Keeps a catalog of third-party proxies fresh: candidates are pulled from
//! configured sources, every proxy is re-verified against two identity
//! oracles, dead ones are evicted and the working subset is served as the
//! live pool.

pub mod config;
pub mod database;
pub mod error;
pub mod proxy;
pub mod scheduler;
pub mod settings;

pub use config::Config;
pub use database::Database;
pub use error::Error;
pub use proxy::*;
pub use scheduler::{register_jobs, Scheduler, TokioScheduler};
pub use settings::{Settings, SettingsProvider, SharedSettings};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

/// Application result type
pub type Result<T> = std::result::Result<T, Error>;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the fmt subscriber once. Honours `RUST_LOG`, defaults to `info`.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
