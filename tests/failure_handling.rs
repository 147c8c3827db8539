//! Failure classification, retries, deadlines and apply-time consistency.

mod common;

use common::cloud::*;
use crossvault::domain::{RecordStatus, SecretVersion};
use crossvault::replication::{
    FailureKind, ReconcileState, ReconcilerSettings, ReplicationError, RetryPolicy,
};
use crossvault::secrets::{CloudOperation, WriteKind};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_throttling_is_retried_with_exponential_backoff() {
    let settings = ReconcilerSettings {
        retry: RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10)),
        ..Default::default()
    };
    let h = Harness::with_settings(settings);
    h.cloud.throttle(CloudOperation::GetSecretValue, 3);

    let started = Instant::now();
    let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

    assert_eq!(outcome.state, ReconcileState::Synced);
    assert_eq!(outcome.attempts, 4);
    // 100ms + 200ms + 400ms of backoff before the fourth attempt.
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(outcome.trail.iter().filter(|s| **s == ReconcileState::Retrying).count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_attempt_cap() {
    let settings = ReconcilerSettings {
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
        ..Default::default()
    };
    let h = Harness::with_settings(settings);
    h.cloud.throttle(CloudOperation::DescribeSecret, 10);
    let target = target(&["svc-a"]);

    let outcome = h.reconciler.reconcile(&target).await;

    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::Throttled));
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(outcome.error, Some(ReplicationError::Throttled { .. })));

    let record = h.state.get(&target.key()).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed(FailureKind::Throttled));
    assert_eq!(record.attempt_count, 3);
}

#[tokio::test]
async fn test_permanent_trust_denial_is_not_retried() {
    let h = Harness::new();
    h.cloud.revoke_trust(DEST, DEST_ROLE);

    let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

    // Destination-side denials are reported as write failures.
    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::WriteError));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.cloud.write_count(&dest()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_trust_denial_is_retried() {
    let h = Harness::new();
    h.cloud.deny_exchange_transiently(SOURCE, 2);

    let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

    assert_eq!(outcome.state, ReconcileState::Synced);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.trail.contains(&ReconcileState::Failed(FailureKind::TrustDenied)));
}

#[tokio::test]
async fn test_access_denied_source_is_not_retried() {
    let h = Harness::new();
    h.cloud.deny_reads(SOURCE, SOURCE_PATH);

    let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::AccessDenied));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_inconsistent_read_is_reread_once() {
    let h = Harness::new();
    // The value read lands on a newer version than the one just described.
    h.cloud.schedule_write_after(
        CloudOperation::DescribeSecret,
        SOURCE,
        SOURCE_PATH,
        "db-password-v2",
    );

    let outcome = h.reconciler.reconcile(&target(&["svc-a"])).await;

    assert_eq!(outcome.state, ReconcileState::Synced);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.source_version, Some(SecretVersion::new("v2")));
    assert_eq!(
        h.cloud.secret_value(&dest(), &dest_path()).unwrap().expose_bytes(),
        b"db-password-v2"
    );
}

#[tokio::test]
async fn test_source_change_before_value_write_fails_pass() {
    let h = Harness::new();
    let target = target(&["svc-a"]);
    h.reconciler.reconcile(&target).await;

    h.cloud.seed_secret(SOURCE, SOURCE_PATH, "db-password-v2", "alias/source");
    h.cloud.schedule_write_after(
        CloudOperation::GetSecretValue,
        SOURCE,
        SOURCE_PATH,
        "db-password-v3",
    );
    h.cloud.reset_counters();

    let outcome = h.reconciler.reconcile(&target).await;

    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::Inconsistent));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.cloud.writes_of_kind(&dest(), WriteKind::PutSecretValue), 0);

    let record = h.state.get(&target.key()).await.unwrap().unwrap();
    assert_eq!(record.last_dest_version, Some(SecretVersion::new("v1")));

    // The next pass picks up the newest version.
    let outcome = h.reconciler.reconcile(&target).await;
    assert_eq!(outcome.state, ReconcileState::Synced);
    assert_eq!(
        h.cloud.secret_value(&dest(), &dest_path()).unwrap().expose_bytes(),
        b"db-password-v3"
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expiry_writes_no_record() {
    let settings = ReconcilerSettings { pass_deadline: Duration::from_secs(2), ..fast_settings() };
    let h = Harness::with_settings(settings);
    h.cloud.set_write_latency(Duration::from_secs(30));
    let target = target(&["svc-a"]);

    let outcome = h.reconciler.reconcile(&target).await;

    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::Timeout));
    assert!(matches!(outcome.error, Some(ReplicationError::Timeout { deadline_ms: 2000, .. })));
    assert!(h.state.get(&target.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_destination_key_is_a_write_error() {
    let h = Harness::new();
    let mut target = target(&["svc-a"]);
    target.dest_key = crossvault::domain::KeyRef::new("alias/absent");

    let outcome = h.reconciler.reconcile(&target).await;

    assert_eq!(outcome.state, ReconcileState::Failed(FailureKind::WriteError));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_dry_run_reports_drift_without_writes() {
    let settings = ReconcilerSettings { dry_run: true, ..fast_settings() };
    let h = Harness::with_settings(settings);
    let target = target(&["svc-a", "svc-b"]);

    let outcome = h.reconciler.reconcile(&target).await;

    assert_eq!(outcome.state, ReconcileState::Planned);
    assert_eq!(outcome.patch.unwrap().to_add.len(), 2);
    assert_eq!(h.cloud.write_count(&dest()), 0);
    assert!(h.cloud.secret_version(&dest(), &dest_path()).is_none());
    assert!(h.state.get(&target.key()).await.unwrap().is_none());
}
