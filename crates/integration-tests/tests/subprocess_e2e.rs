//! End to end with the real subprocess runner (unix only): a shell script
//! plays the extraction engine and writes NDJSON into the result store.

#![cfg(unix)]

mod common;

use common::{TestEnv, BUCKET};
use fhir_export_core::application::{AdvanceOutcome, ExportOrchestrator};
use fhir_export_core::domain::{ExportRequest, JobStatus, RequesterIdentity};
use fhir_export_core::port::system_probe::mocks::MockSystemProbe;
use fhir_export_core::port::JobStore;
use fhir_export_infra_system::{SubprocessRunner, SubprocessRunnerConfig};
use std::sync::Arc;
use std::time::Duration;

fn runner(env: &TestEnv, script: &str) -> Arc<SubprocessRunner> {
    Arc::new(SubprocessRunner::new(
        SubprocessRunnerConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env_allowlist: vec!["PATH".to_string()],
            results_root: env.results_root(),
            log_dir: env.dir.path().join("runs"),
            max_concurrent_runs: 2,
            cpu_throttle_percent: 90.0,
            min_free_memory_mb: 0,
            stop_grace_period: Duration::from_millis(200),
        },
        Arc::new(MockSystemProbe::new(5.0)),
    ))
}

/// Advance until the job leaves `status` (bounded)
async fn advance_while(orchestrator: &ExportOrchestrator, env: &TestEnv, job_id: &str, status: JobStatus) {
    for _ in 0..200 {
        let job = env.store.get(job_id).await.unwrap().unwrap();
        if job.status != status {
            return;
        }
        orchestrator.advance_job(job_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} stuck in {}", job_id, status);
}

#[tokio::test]
async fn test_subprocess_export_completes() {
    let env = TestEnv::new().await;
    let orchestrator = env.orchestrator(runner(
        &env,
        r#"for t in $(echo "$EXPORT_RESOURCE_TYPES" | tr ',' ' '); do
               printf '{"resourceType":"%s"}\n' "$t" > "$EXPORT_OUTPUT_DIR/$t.ndjson"
           done"#,
    ));
    let alice = RequesterIdentity::new("alice");

    let request = ExportRequest::new("Group/cohort-7".parse().unwrap())
        .with_resource_types(["Patient", "Condition"]);
    let job_id = orchestrator.start_export(&alice, request).await.unwrap();
    assert_eq!(
        env.store.get(&job_id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    advance_while(&orchestrator, &env, &job_id, JobStatus::Running).await;

    let view = orchestrator.job_status(&alice, &job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error_message);
    let manifest = view.manifest.unwrap();
    let types: Vec<_> = manifest
        .entries
        .iter()
        .map(|entry| entry.resource_type.clone().unwrap())
        .collect();
    assert_eq!(types, vec!["Condition", "Patient"]);

    let job = env.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(
        job.output_locations,
        vec![
            format!("{}/{}/Condition.ndjson", BUCKET, job_id),
            format!("{}/{}/Patient.ndjson", BUCKET, job_id),
        ]
    );
    for (entry, location) in manifest.entries.iter().zip(&job.output_locations) {
        assert!(env.url_is_valid(&entry.url, location, manifest.expires_at, common::START));
    }
}

#[tokio::test]
async fn test_subprocess_failure_fails_job() {
    let env = TestEnv::new().await;
    let orchestrator = env.orchestrator(runner(&env, "echo 'source FHIR server returned 503' >&2; exit 2"));
    let alice = RequesterIdentity::new("alice");

    let job_id = orchestrator
        .start_export(&alice, ExportRequest::new("Patient".parse().unwrap()))
        .await
        .unwrap();
    advance_while(&orchestrator, &env, &job_id, JobStatus::Running).await;

    let view = orchestrator.job_status(&alice, &job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error_message.unwrap().contains("returned 503"));
    assert!(view.manifest.is_none());
}

#[tokio::test]
async fn test_subprocess_stop_cancels_export() {
    let env = TestEnv::new().await;
    let orchestrator = env.orchestrator(runner(&env, "sleep 30"));
    let alice = RequesterIdentity::new("alice");

    let job_id = orchestrator
        .start_export(&alice, ExportRequest::new("Patient".parse().unwrap()))
        .await
        .unwrap();

    let ack = orchestrator.stop_export(&alice, &job_id).await.unwrap();
    assert_eq!(ack.status, JobStatus::Canceling);

    advance_while(&orchestrator, &env, &job_id, JobStatus::Canceling).await;
    let job = env.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.output_locations.is_empty());

    // Terminal: advancing again changes nothing
    assert_eq!(
        orchestrator.advance_job(&job_id).await.unwrap(),
        AdvanceOutcome::NoOp
    );
}

#[tokio::test]
async fn test_export_started_by_one_process_is_advanced_by_another() {
    let env = TestEnv::new().await;
    let script = r#"sleep 0.2; printf '{"resourceType":"Patient"}\n' > "$EXPORT_OUTPUT_DIR/Patient.ndjson""#;
    let alice = RequesterIdentity::new("alice");

    // `submit` from the CLI: its runner goes away with the process
    let job_id = env
        .orchestrator(runner(&env, script))
        .start_export(&alice, ExportRequest::new("Patient/123".parse().unwrap()))
        .await
        .unwrap();

    let daemon = env.orchestrator(runner(&env, script));
    advance_while(&daemon, &env, &job_id, JobStatus::Running).await;

    let view = daemon.job_status(&alice, &job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error_message);
    assert_eq!(view.manifest.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn test_export_stopped_from_another_process() {
    let env = TestEnv::new().await;
    let alice = RequesterIdentity::new("alice");

    let job_id = env
        .orchestrator(runner(&env, "sleep 30"))
        .start_export(&alice, ExportRequest::new("Patient".parse().unwrap()))
        .await
        .unwrap();

    let other = env.orchestrator(runner(&env, "sleep 30"));
    let ack = other.stop_export(&alice, &job_id).await.unwrap();
    assert_eq!(ack.status, JobStatus::Canceling);

    advance_while(&other, &env, &job_id, JobStatus::Canceling).await;
    assert_eq!(
        env.store.get(&job_id).await.unwrap().unwrap().status,
        JobStatus::Canceled
    );
}
