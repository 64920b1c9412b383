//! Application state wiring stores, configuration and the engine together.
//!
//! Core services are generic over repository traits; AppState pins them to
//! the SQLite implementations in cadence-infra.

use std::sync::Arc;

use anyhow::Context;
use cadence_core::engine::{env_snapshot, Engine, EngineSettings};
use cadence_core::preset::PresetLocator;
use cadence_core::schedule::TaskService;
use cadence_infra::config::{load_global_config, resolve_presets_dir};
use cadence_infra::credentials::FileCredentialResolver;
use cadence_infra::filesystem::DataDir;
use cadence_infra::handlers::{builtin_registry, NotifyHandler};
use cadence_infra::sqlite::{DatabasePool, SqliteRunRepository, SqliteTaskRepository};
use cadence_types::config::GlobalConfig;

/// Task service pinned to the SQLite stores.
pub type ConcreteTaskService = TaskService<SqliteTaskRepository, SqliteRunRepository>;

/// Shared state for every command.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: DataDir,
    pub config: GlobalConfig,
    pub db_pool: DatabasePool,
    pub tasks: SqliteTaskRepository,
    pub runs: SqliteRunRepository,
    pub locator: PresetLocator,
}

impl AppState {
    /// Resolve the data directory, load config and open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = DataDir::resolve();
        data_dir.ensure().await.with_context(|| {
            format!("Failed to create data directory {}", data_dir.root().display())
        })?;

        let config = load_global_config(data_dir.root()).await;
        let presets_dir = resolve_presets_dir(&config, data_dir.root());

        let db_pool = DatabasePool::open(data_dir.root())
            .await
            .with_context(|| format!("Failed to open database {}", data_dir.database().display()))?;

        tracing::debug!(
            data_dir = %data_dir.root().display(),
            presets_dir = %presets_dir.display(),
            "application state initialized"
        );

        Ok(Self {
            tasks: SqliteTaskRepository::new(db_pool.clone()),
            runs: SqliteRunRepository::new(db_pool.clone()),
            locator: PresetLocator::new(presets_dir),
            data_dir,
            config,
            db_pool,
        })
    }

    pub fn task_service(&self) -> ConcreteTaskService {
        TaskService::new(self.tasks.clone(), self.runs.clone(), self.locator.clone())
    }

    /// Build an engine with the built-in handlers and configured limits.
    /// Reads `credentials.toml` once per call.
    pub fn engine(&self, notify: NotifyHandler) -> anyhow::Result<Engine> {
        let credentials_path = self.data_dir.credentials_file();
        let credentials = FileCredentialResolver::load(&credentials_path)
            .with_context(|| format!("Failed to load {}", credentials_path.display()))?
            .with_env(env_snapshot());

        let registry = builtin_registry(Arc::new(credentials), notify)
            .context("Failed to initialize HTTP client")?;

        Ok(Engine::new(registry).with_settings(EngineSettings::from(&self.config.engine)))
    }
}
