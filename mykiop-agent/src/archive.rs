//! Day-boundary archiving
//!
//! Once the vehicle's local date moves past the day of the last observed
//! `last_updated`, the prior day's totals are written to a dated JSON file,
//! uploaded (or cached for upload), and the remote counters are reset. The
//! boundary only advances after the reset is confirmed, so a failure part
//! way through leads to a re-archive on the next check rather than a day
//! of totals silently vanishing.

use crate::cache::PendingOp;
use crate::reconcile::{Disposition, Reconciler};
use crate::remote::RemoteAggregate;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// A day's totals written locally, awaiting upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveArtifact {
    pub file_path: PathBuf,
    pub filename: String,
    pub date: NaiveDate,
}

impl ArchiveArtifact {
    /// Remote object key: `{device}/{YYYY-MM-DD}/{filename}`
    pub fn object_name(&self, device_id: &str) -> String {
        format!("{}/{}/{}", device_id, self.date.format("%Y-%m-%d"), self.filename)
    }
}

/// Result of one boundary check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayCheck {
    /// Boundary state was missing and has now been seeded
    Initialized,
    SameDay,
    /// Network unavailable or remote read failed; nothing changed
    Deferred,
    /// No remote record existed for the closed day
    NothingToArchive,
    Archived { date: NaiveDate, upload: Disposition },
    /// Archive could not be prepared or the reset failed; will retry
    Failed(String),
}

/// Holds `previous_timestamp` and runs the archive-and-reset sequence
#[derive(Debug)]
pub struct DayBoundaryArchiver {
    previous_timestamp: Option<DateTime<FixedOffset>>,
    archive_root: PathBuf,
}

impl DayBoundaryArchiver {
    /// `archive_root` receives `{device}/{date}/daily_data_{date}.json`
    pub fn new<P: Into<PathBuf>>(archive_root: P) -> Self {
        Self {
            previous_timestamp: None,
            archive_root: archive_root.into(),
        }
    }

    pub fn previous_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.previous_timestamp
    }

    /// Seed from a fetched record: its `last_updated`, or `now` when the
    /// record is absent or unstamped.
    pub fn initialize(&mut self, record: Option<&RemoteAggregate>, now: DateTime<FixedOffset>) {
        let seed = record.and_then(|r| r.last_updated).unwrap_or(now);
        debug!("Day boundary seeded at {}", seed);
        self.previous_timestamp = Some(seed);
    }

    pub async fn check(&mut self, engine: &mut Reconciler) -> DayCheck {
        let now = engine.clock().now();

        let Some(previous) = self.previous_timestamp else {
            if !engine.check_reachable().await {
                return DayCheck::Deferred;
            }
            return match engine.fetch_aggregate().await {
                Ok(record) => {
                    self.initialize(record.as_ref(), now);
                    DayCheck::Initialized
                }
                Err(e) => {
                    warn!("Cannot seed day boundary: {}", e);
                    DayCheck::Deferred
                }
            };
        };

        let closed_day = engine.clock().local_date(&previous);
        if closed_day == engine.clock().local_date(&now) {
            return DayCheck::SameDay;
        }

        info!("New day detected, archiving totals for {}", closed_day);
        if !engine.check_reachable().await {
            return DayCheck::Deferred;
        }

        let record = match engine.fetch_aggregate().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("No remote totals for {}, nothing to archive", closed_day);
                self.previous_timestamp = Some(now);
                return DayCheck::NothingToArchive;
            }
            Err(e) => {
                warn!("Cannot fetch totals for archive: {}", e);
                return DayCheck::Deferred;
            }
        };

        let artifact = match self.write_artifact(engine.device_id(), closed_day, &record).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("Failed to write daily archive for {}: {}", closed_day, e);
                return DayCheck::Failed(e.to_string());
            }
        };

        let upload = engine.submit(PendingOp::ArchiveUpload(artifact)).await;

        match engine.reset_remote().await {
            Ok(reset) => {
                self.previous_timestamp = reset.last_updated.or(Some(now));
                info!("Day {} archived ({:?}) and counters reset", closed_day, upload);
                DayCheck::Archived {
                    date: closed_day,
                    upload,
                }
            }
            Err(e) => {
                warn!("Counter reset failed, day {} will be re-archived: {}", closed_day, e);
                DayCheck::Failed(e.to_string())
            }
        }
    }

    async fn write_artifact(
        &self,
        device_id: &str,
        date: NaiveDate,
        record: &RemoteAggregate,
    ) -> anyhow::Result<ArchiveArtifact> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let filename = format!("daily_data_{}.json", date_str);
        let folder = self.archive_root.join(device_id).join(&date_str);
        tokio::fs::create_dir_all(&folder).await?;

        let file_path = folder.join(&filename);
        tokio::fs::write(&file_path, serde_json::to_vec_pretty(record)?).await?;
        debug!("Daily data written to {}", file_path.display());

        Ok(ArchiveArtifact {
            file_path,
            filename,
            date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn object_name_is_dated() {
        let artifact = ArchiveArtifact {
            file_path: PathBuf::from("/data/630/2024-05-01/daily_data_2024-05-01.json"),
            filename: "daily_data_2024-05-01.json".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        };
        assert_eq!(
            artifact.object_name("630"),
            "630/2024-05-01/daily_data_2024-05-01.json"
        );
    }

    #[test]
    fn initialize_prefers_remote_timestamp() {
        let mut archiver = DayBoundaryArchiver::new("/tmp/unused");
        let stamped = RemoteAggregate {
            last_updated: Some(ts("2024-05-01T22:00:00+10:00")),
            ..RemoteAggregate::default()
        };
        let now = ts("2024-05-02T08:00:00+10:00");

        archiver.initialize(Some(&stamped), now);
        assert_eq!(archiver.previous_timestamp(), stamped.last_updated);

        archiver.initialize(None, now);
        assert_eq!(archiver.previous_timestamp(), Some(now));
    }

    #[tokio::test]
    async fn artifact_holds_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = DayBoundaryArchiver::new(dir.path());
        let record = RemoteAggregate {
            enter_count: 120,
            myki_taps: 100,
            offender_count: 20,
            last_updated: Some(ts("2024-05-01T23:59:00+10:00")),
        };
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let artifact = archiver.write_artifact("630", date, &record).await.unwrap();

        assert_eq!(
            artifact.file_path,
            dir.path().join("630/2024-05-01/daily_data_2024-05-01.json")
        );
        let written: RemoteAggregate =
            serde_json::from_slice(&std::fs::read(&artifact.file_path).unwrap()).unwrap();
        assert_eq!(written, record);
    }
}
