// Dependency wiring (composition root)

use crate::config::AppConfig;
use anyhow::{Context, Result};
use fhir_export_core::application::{
    AdvanceScheduler, ExportOrchestrator, ResultPackager, RetentionSweeper,
};
use fhir_export_core::port::id_provider::UuidProvider;
use fhir_export_core::port::time_provider::SystemTimeProvider;
use fhir_export_core::port::{ObjectStore, TimeProvider};
use fhir_export_infra_sqlite::{create_pool, run_migrations, SqliteJobStore, SqliteMaintenance};
use fhir_export_infra_storage::{FsObjectStore, HmacUrlSigner};
use fhir_export_infra_system::{SubprocessRunner, SystemProbeImpl};
use std::sync::Arc;
use tracing::info;

/// Everything a command needs, built once from the configuration
pub struct App {
    pub config: AppConfig,
    pub orchestrator: Arc<ExportOrchestrator>,
    pub maintenance: Arc<SqliteMaintenance>,
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl App {
    pub async fn build(config: AppConfig) -> Result<Self> {
        // 1. Database
        if let Some(dir) = config.database_dir() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }
        let database_url = config.database_url();
        info!(database_url = %database_url, "Initializing database...");
        let pool = create_pool(&database_url)
            .await
            .context("DB pool creation failed")?;
        run_migrations(&pool).await.context("Migration failed")?;

        // 2. Adapters
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let store = Arc::new(SqliteJobStore::new(pool.clone()));
        let maintenance = Arc::new(SqliteMaintenance::new(pool));
        let object_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.results_root()));
        let signer = Arc::new(
            HmacUrlSigner::new(
                config.signing_identity(),
                config.results.base_url.clone(),
                config.results.signing_secret.clone(),
            )
            .context("results.signing_secret must be set (FHIR_EXPORT__RESULTS__SIGNING_SECRET)")?,
        );
        let runner = Arc::new(SubprocessRunner::new(
            config.runner_config(),
            Arc::new(SystemProbeImpl::new()),
        ));

        // 3. Application services
        let packager = Arc::new(ResultPackager::new(
            object_store.clone(),
            signer,
            time_provider.clone(),
            config.url_ttl_ms(),
        ));
        let orchestrator = Arc::new(
            ExportOrchestrator::new(
                config.orchestrator_config(),
                store,
                runner,
                packager,
                Arc::new(UuidProvider),
                time_provider.clone(),
            )
            .context("Invalid orchestrator configuration")?,
        );

        Ok(Self {
            config,
            orchestrator,
            maintenance,
            object_store,
            time_provider,
        })
    }

    pub fn scheduler(&self) -> AdvanceScheduler {
        AdvanceScheduler::new(self.orchestrator.clone(), self.config.poll_interval())
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            self.maintenance.clone(),
            self.object_store.clone(),
            self.time_provider.clone(),
            self.config.results.bucket.clone(),
            self.config.retention_config(),
        )
    }

    pub fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }
}
