use chrono::{DateTime, FixedOffset, NaiveDate};
use mykiop_agent::archive::DayCheck;
use mykiop_agent::cache::EntryKind;
use mykiop_agent::reconcile::Disposition;
use mykiop_agent::remote::RemoteAggregate;
use mykiop_devkit::{MemoryRemote, TestHarness, TEST_DEVICE};

fn ts(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

fn closed_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn day_totals() -> RemoteAggregate {
    RemoteAggregate {
        enter_count: 120,
        myki_taps: 100,
        offender_count: 20,
        last_updated: Some(ts("2024-05-01T09:00:00+10:00")),
    }
}

async fn harness_with_day_totals() -> TestHarness {
    let remote = MemoryRemote::new().with_record(TEST_DEVICE, day_totals());
    TestHarness::build(remote, false).await.unwrap()
}

#[tokio::test]
async fn bootstrap_seeds_boundary_from_remote() {
    let harness = harness_with_day_totals().await;
    assert_eq!(
        harness.coordinator.archiver().previous_timestamp(),
        day_totals().last_updated
    );
}

#[tokio::test]
async fn same_day_check_is_a_no_op() {
    let mut harness = harness_with_day_totals().await;
    harness.clock.set(ts("2024-05-01T23:59:00+10:00"));

    assert_eq!(harness.coordinator.check_day_boundary().await, DayCheck::SameDay);
    assert_eq!(harness.remote.record(TEST_DEVICE), Some(day_totals()));
    assert!(harness.remote.uploads().is_empty());
}

#[tokio::test]
async fn new_day_archives_uploads_and_resets() {
    let mut harness = harness_with_day_totals().await;
    let midnight = ts("2024-05-02T00:00:30+10:00");
    harness.clock.set(midnight);

    let result = harness.coordinator.check_day_boundary().await;

    assert_eq!(
        result,
        DayCheck::Archived {
            date: closed_day(),
            upload: Disposition::Committed,
        }
    );

    let archive = harness
        .data_dir()
        .join("archive/630/2024-05-01/daily_data_2024-05-01.json");
    let written: RemoteAggregate =
        serde_json::from_slice(&std::fs::read(&archive).unwrap()).unwrap();
    assert_eq!(written, day_totals());

    let uploads = harness.remote.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].object, "630/2024-05-01/daily_data_2024-05-01.json");

    let reset = harness.remote.record(TEST_DEVICE).unwrap();
    assert_eq!(reset, RemoteAggregate::reset_at(midnight));
    assert_eq!(harness.telemetry.last(), Some(reset));
    assert_eq!(harness.coordinator.archiver().previous_timestamp(), Some(midnight));

    // Later the same day nothing happens again
    harness.clock.set(ts("2024-05-02T08:00:00+10:00"));
    assert_eq!(harness.coordinator.check_day_boundary().await, DayCheck::SameDay);
    assert_eq!(harness.remote.uploads().len(), 1);
}

#[tokio::test]
async fn offline_boundary_waits_for_network() {
    let mut harness = harness_with_day_totals().await;
    harness.go_offline().await;
    harness.clock.set(ts("2024-05-02T06:00:00+10:00"));

    assert_eq!(harness.coordinator.check_day_boundary().await, DayCheck::Deferred);
    assert_eq!(
        harness.coordinator.archiver().previous_timestamp(),
        day_totals().last_updated
    );
    assert_eq!(harness.remote.record(TEST_DEVICE), Some(day_totals()));

    harness.reconnect().await;
    assert!(matches!(
        harness.coordinator.check_day_boundary().await,
        DayCheck::Archived { upload: Disposition::Committed, .. }
    ));
}

#[tokio::test]
async fn failed_reset_rearchives_on_next_check() {
    let mut harness = harness_with_day_totals().await;
    harness.clock.set(ts("2024-05-02T00:01:00+10:00"));
    harness.remote.reject_next_sets(1);

    assert!(matches!(
        harness.coordinator.check_day_boundary().await,
        DayCheck::Failed(_)
    ));
    assert_eq!(
        harness.coordinator.archiver().previous_timestamp(),
        day_totals().last_updated
    );
    assert_eq!(harness.remote.record(TEST_DEVICE), Some(day_totals()));

    let retry = harness.coordinator.check_day_boundary().await;
    assert_eq!(
        retry,
        DayCheck::Archived {
            date: closed_day(),
            upload: Disposition::Committed,
        }
    );
    assert_eq!(harness.remote.uploads().len(), 2);
    assert_eq!(harness.remote.record(TEST_DEVICE).unwrap().enter_count, 0);
}

#[tokio::test]
async fn archive_upload_failure_is_cached_and_reset_proceeds() {
    let mut harness = harness_with_day_totals().await;
    harness.clock.set(ts("2024-05-02T00:01:00+10:00"));
    harness.remote.set_reject_uploads(true);

    let result = harness.coordinator.check_day_boundary().await;

    assert_eq!(
        result,
        DayCheck::Archived {
            date: closed_day(),
            upload: Disposition::Deferred,
        }
    );
    let cached = harness.cached().await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].kind, EntryKind::ArchiveUpload);
    assert_eq!(harness.remote.record(TEST_DEVICE).unwrap().enter_count, 0);

    harness.remote.set_reject_uploads(false);
    harness.coordinator.drain().await;
    assert_eq!(
        harness.remote.uploads()[0].object,
        "630/2024-05-01/daily_data_2024-05-01.json"
    );
    assert!(harness.cached().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_remote_record_has_nothing_to_archive() {
    let mut harness = TestHarness::new().await.unwrap();
    harness.clock.set(ts("2024-05-02T00:01:00+10:00"));

    assert_eq!(
        harness.coordinator.check_day_boundary().await,
        DayCheck::NothingToArchive
    );
    assert!(harness.remote.uploads().is_empty());
    assert_eq!(harness.coordinator.check_day_boundary().await, DayCheck::SameDay);
}

#[tokio::test]
async fn sessions_after_reset_count_from_zero() {
    let mut harness = harness_with_day_totals().await;
    harness.clock.set(ts("2024-05-02T00:01:00+10:00"));
    harness.coordinator.check_day_boundary().await;

    harness.clock.set(ts("2024-05-02T07:15:00+10:00"));
    harness.run_session(4, 3, 1).await.unwrap();

    let record = harness.remote.record(TEST_DEVICE).unwrap();
    assert_eq!(
        (record.enter_count, record.myki_taps, record.offender_count),
        (4, 3, 1)
    );
    assert_eq!(record.last_updated, Some(ts("2024-05-02T07:15:00+10:00")));
}
