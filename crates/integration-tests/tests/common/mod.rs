//! Shared wiring for the integration tests: SQLite file database,
//! filesystem result store and HMAC signer under one temp directory.

#![allow(dead_code)]

use fhir_export_core::application::{ExportOrchestrator, OrchestratorConfig, ResultPackager};
use fhir_export_core::domain::ObjectLocation;
use fhir_export_core::port::id_provider::mocks::SequentialIdProvider;
use fhir_export_core::port::time_provider::mocks::ManualClock;
use fhir_export_core::port::{JobRunner, SigningIdentity};
use fhir_export_infra_sqlite::{create_pool, run_migrations, SqliteJobStore, SqliteMaintenance};
use fhir_export_infra_storage::{FsObjectStore, HmacUrlSigner};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const START: i64 = 1_700_000_000_000;
pub const BUCKET: &str = "results";
pub const MAX_AGE_MS: i64 = 60_000;
pub const TTL_MS: i64 = 600_000;
pub const URL_TTL_MS: i64 = 3_600_000;

pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub store: Arc<SqliteJobStore>,
    pub maintenance: Arc<SqliteMaintenance>,
    pub objects: Arc<FsObjectStore>,
    pub signer: Arc<HmacUrlSigner>,
    pub clock: Arc<ManualClock>,
    ids: Arc<SequentialIdProvider>,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_start_attempts: 3,
        start_backoff_base_ms: 1_000,
        start_backoff_factor: 2.0,
        max_job_age_ms: MAX_AGE_MS,
        job_ttl_ms: TTL_MS,
        call_timeout: Duration::from_secs(5),
        advance_concurrency: 4,
        enable_multi_tenancy: false,
        results_bucket: BUCKET.to_string(),
        worker_type: "G.2X".to_string(),
        worker_count: 2,
    }
}

pub fn database_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("export-jobs.db").display())
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&database_url(dir.path())).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let objects = Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let signer = Arc::new(
            HmacUrlSigner::new(
                SigningIdentity {
                    role: "export-results-signer".to_string(),
                    bucket: BUCKET.to_string(),
                    key_id: "it-key".to_string(),
                },
                "https://exports.example.org/files",
                "integration-secret",
            )
            .unwrap(),
        );

        Self {
            store: Arc::new(SqliteJobStore::new(pool.clone())),
            maintenance: Arc::new(SqliteMaintenance::new(pool.clone())),
            pool,
            objects,
            signer,
            clock: Arc::new(ManualClock::new(START)),
            ids: Arc::new(SequentialIdProvider::new("job")),
            dir,
        }
    }

    pub fn results_root(&self) -> PathBuf {
        self.objects.root().to_path_buf()
    }

    pub fn orchestrator(&self, runner: Arc<dyn JobRunner>) -> ExportOrchestrator {
        self.orchestrator_with(runner, test_config())
    }

    pub fn orchestrator_with(
        &self,
        runner: Arc<dyn JobRunner>,
        config: OrchestratorConfig,
    ) -> ExportOrchestrator {
        let packager = Arc::new(ResultPackager::new(
            self.objects.clone(),
            self.signer.clone(),
            self.clock.clone(),
            URL_TTL_MS,
        ));
        ExportOrchestrator::new(
            config,
            self.store.clone(),
            runner,
            packager,
            self.ids.clone(),
            self.clock.clone(),
        )
        .unwrap()
    }

    /// Write one result object and return its `bucket/key` location
    pub fn write_result(&self, job_id: &str, file: &str, contents: &str) -> String {
        let path = self.results_root().join(BUCKET).join(job_id).join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        format!("{}/{}/{}", BUCKET, job_id, file)
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.results_root().join(BUCKET).join(job_id)
    }

    /// Check a manifest URL against the signer
    pub fn url_is_valid(&self, url: &str, location: &str, expires_at: i64, now: i64) -> bool {
        let Some(signature) = url.split("signature=").nth(1) else {
            return false;
        };
        let location = ObjectLocation::parse(location).unwrap();
        self.signer.verify(&location, expires_at, signature, now)
    }
}
