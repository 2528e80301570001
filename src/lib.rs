pub mod allocator;
pub mod config;
pub mod db;
pub mod distance;
pub mod engine;
pub mod errors;
pub mod geocode;
pub mod model;
pub mod scoring;
pub mod store;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseContext};
use crate::engine::AssignmentEngine;
use crate::errors::AppResult;
use crate::geocode::GeocodeResolver;
use crate::store::EntityStore;
use crate::telemetry::TelemetryLog;

pub use crate::engine::{RunOutcome, RunReport};

pub struct AppState {
    db: Arc<Mutex<SqlConnection>>,
    db_path: PathBuf,
    config: AppConfig,
    store: EntityStore,
    telemetry: TelemetryLog,
    resolver: Arc<GeocodeResolver>,
}

impl AppState {
    pub fn initialize(data_dir: &Path) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();

        std::fs::create_dir_all(data_dir)?;
        let DatabaseContext { connection, path } = bootstrap(data_dir, &config.database_file_name)?;
        let db = Arc::new(Mutex::new(connection));
        let store = EntityStore::new(Arc::clone(&db));
        let telemetry = TelemetryLog::new(data_dir, &config)?;
        let resolver = Arc::new(GeocodeResolver::from_config(&config)?);

        if let Err(err) = telemetry.record(
            "app_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "telemetry_enabled": config.telemetry_enabled_by_default,
            }),
        ) {
            warn!(?err, "failed to queue startup event");
        }

        Ok(Self {
            db,
            db_path: path,
            config,
            store,
            telemetry,
            resolver,
        })
    }

    pub fn engine(&self) -> AssignmentEngine {
        AssignmentEngine::new(
            self.config.clone(),
            self.store.clone(),
            Arc::clone(&self.resolver),
            self.telemetry.clone(),
        )
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connection(&self) -> Arc<Mutex<SqlConnection>> {
        Arc::clone(&self.db)
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,optishift=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
