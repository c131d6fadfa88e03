//! Checkpoint-driven idempotency of the engine

use super::Harness;
use crate::checkpoint::{CheckpointLease, CheckpointState, CheckpointStore};
use crate::error::ProcessorError;
use crate::models::UnitOutcome;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_second_run_performs_no_work() {
    let harness = Harness::new();
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |day| 280.0 + day as f64);

    let cancel = CancellationToken::new();
    let first = harness.engine.process(&unit, &cancel).await.unwrap();
    let archive = match &first {
        UnitOutcome::Completed { archive, monthly } => {
            assert!(archive.is_file());
            assert!(monthly.is_file());
            archive.clone()
        }
        other => panic!("Expected Completed, got {other:?}"),
    };
    assert_eq!(harness.state(&unit), Some(CheckpointState::Completed));

    let calls = harness.calls();
    let second = harness.engine.process(&unit, &cancel).await.unwrap();
    assert_eq!(second, UnitOutcome::AlreadyComplete { archive });
    assert_eq!(harness.calls(), calls);
}

#[tokio::test]
async fn test_archive_path_follows_layout() {
    let harness = Harness::new();
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);

    let outcome = harness
        .engine
        .process(&unit, &CancellationToken::new())
        .await
        .unwrap();

    let proc = &harness.config().paths.proc;
    assert_eq!(
        outcome,
        UnitOutcome::Completed {
            archive: proc.join("tas/day/native/2024/tas_day_era5_202406.parquet"),
            monthly: proc.join("tas/mon/native/2024/tas_mon_era5_202406.parquet"),
        }
    );
}

#[tokio::test]
async fn test_overwrite_reprocesses_completed_unit() {
    let harness = Harness::with_config(|config| config.with_overwrite(true));
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);
    let cancel = CancellationToken::new();

    harness.engine.process(&unit, &cancel).await.unwrap();
    let (fetches, _) = harness.calls();

    let outcome = harness.engine.process(&unit, &cancel).await.unwrap();
    assert!(matches!(outcome, UnitOutcome::Completed { .. }));
    assert_eq!(harness.calls().0, fetches * 2);
}

#[tokio::test]
async fn test_completed_marker_without_archive_is_not_trusted() {
    let harness = Harness::new();
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);
    harness
        .checkpoints
        .mark_completed(&unit.checkpoint_key())
        .unwrap();

    let outcome = harness
        .engine
        .process(&unit, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, UnitOutcome::Completed { .. }));
    assert!(unit.archive_path.is_file());
}

#[tokio::test]
async fn test_started_unit_is_skipped_without_resume() {
    let harness = Harness::with_config(|config| config.with_resume_partial(false));
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);
    harness.checkpoints.mark_started(&unit.checkpoint_key()).unwrap();

    let outcome = harness
        .engine
        .process(&unit, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, UnitOutcome::SkippedPartial);
    assert_eq!(harness.calls(), (0, 0));
    assert_eq!(harness.state(&unit), Some(CheckpointState::Started));
}

#[tokio::test]
async fn test_started_unit_is_resumed_by_default() {
    let harness = Harness::new();
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);
    harness.checkpoints.mark_started(&unit.checkpoint_key()).unwrap();

    let outcome = harness
        .engine
        .process(&unit, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, UnitOutcome::Completed { .. }));
    assert_eq!(harness.state(&unit), Some(CheckpointState::Completed));
}

#[tokio::test]
async fn test_held_lease_makes_unit_busy() {
    let harness = Harness::new();
    let unit = harness.unit("t2m", 2024, 6);
    harness.write_daily_month(&unit, "t2m", 30, |_| 290.0);

    let key = unit.checkpoint_key();
    let lease = CheckpointLease::acquire(harness.checkpoints.as_ref(), &key).unwrap();
    let result = harness.engine.process(&unit, &CancellationToken::new()).await;
    match result {
        Err(ProcessorError::CheckpointBusy { key }) => assert_eq!(key, "2024_06_t2m"),
        other => panic!("Expected CheckpointBusy, got {other:?}"),
    }
    assert_eq!(harness.calls(), (0, 0));
    assert_eq!(harness.state(&unit), None);

    drop(lease);
    let outcome = harness
        .engine
        .process(&unit, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.archive_path(), Some(&unit.archive_path));
}
