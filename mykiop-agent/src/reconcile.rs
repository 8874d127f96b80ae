//! Reconciliation engine
//!
//! Every remote operation goes through [`Reconciler::submit`]: it is either
//! committed right away or deferred to the durable cache. Deferred entries
//! are replayed by [`Reconciler::drain`], which applies each one through the
//! same code path and rewrites the cache once with whatever did not commit.
//!
//! Counter merges are read-merge-write against a store without
//! compare-and-swap, which is only sound with a single writer per device.
//! A crash after a confirmed write but before the cache rewrite replays the
//! delta on the next drain; that window is accepted.

use crate::cache::{CacheEntry, DurableCache, PendingOp};
use crate::clock::VehicleClock;
use crate::error::{ApplyError, RemoteError};
use crate::network::ReachabilityProbe;
use crate::remote::{AggregateStore, ObjectStore, RemoteAggregate};
use crate::session::SessionCounters;
use crate::telemetry::TelemetrySink;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub aggregates: Arc<dyn AggregateStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

/// Where a submitted operation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Committed,
    Deferred,
    /// Permanently failed; nothing was cached
    Dropped,
}

/// Result of one drain sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub committed: usize,
    /// Attempted and failed, kept for the next sweep
    pub retained: usize,
    /// Not attempted because the network was down
    pub skipped: usize,
    pub dropped: usize,
}

impl DrainReport {
    pub fn remaining(&self) -> usize {
        self.retained + self.skipped
    }
}

/// Owner of the remote mirror, the network flag and the cache
pub struct Reconciler {
    device_id: String,
    remote: Collaborators,
    cache: DurableCache,
    clock: VehicleClock,
    remote_timeout: Duration,
    network_available: bool,
    mirror: RemoteAggregate,
}

impl Reconciler {
    pub fn new(
        device_id: &str,
        remote: Collaborators,
        cache: DurableCache,
        clock: VehicleClock,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            remote,
            cache,
            clock,
            remote_timeout,
            network_available: true,
            mirror: RemoteAggregate::default(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn clock(&self) -> &VehicleClock {
        &self.clock
    }

    pub fn cache(&self) -> &DurableCache {
        &self.cache
    }

    /// Last totals this node confirmed on the remote side
    pub fn mirror(&self) -> &RemoteAggregate {
        &self.mirror
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    /// Record a reachability observation. Returns true on recovery
    /// (unavailable → available).
    pub fn set_network_available(&mut self, available: bool) -> bool {
        let recovered = available && !self.network_available;
        if available != self.network_available {
            if available {
                info!("Network restored");
            } else {
                warn!("Network marked unavailable");
            }
        }
        self.network_available = available;
        recovered
    }

    fn mark_unavailable(&mut self, reason: &str) {
        if self.network_available {
            warn!("Network unavailable: {}", reason);
        }
        self.network_available = false;
    }

    /// Gate for every remote attempt: skip outright when the flag is
    /// already down, otherwise confirm with a probe.
    pub async fn check_reachable(&mut self) -> bool {
        if !self.network_available {
            debug!("Network flagged unavailable, skipping remote attempt");
            return false;
        }
        if self.remote.probe.is_reachable().await {
            true
        } else {
            self.mark_unavailable("reachability probe failed");
            false
        }
    }

    /// Commit `op` now, or defer it to the cache
    pub async fn submit(&mut self, op: PendingOp) -> Disposition {
        if !self.check_reachable().await {
            info!("Network unavailable, deferring {:?}", op.kind());
            return self.defer(op).await;
        }

        match self.apply(&op).await {
            Ok(()) => Disposition::Committed,
            Err(ApplyError::Permanent(reason)) => {
                error!("Dropping {:?}: {}", op.kind(), reason);
                Disposition::Dropped
            }
            Err(e) => {
                if e.is_unreachable() {
                    self.mark_unavailable(&e.to_string());
                }
                warn!("Failed to apply {:?}: {}, deferring", op.kind(), e);
                self.defer(op).await
            }
        }
    }

    async fn defer(&mut self, op: PendingOp) -> Disposition {
        let entry = match CacheEntry::new(&op, self.clock.now()) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Cannot encode {:?} for the cache, operation lost: {}", op, e);
                return Disposition::Dropped;
            }
        };

        match self.cache.append(entry).await {
            Ok(pending) => info!("Saved {:?} to cache ({} pending)", op, pending),
            Err(e) => error!("Failed to cache {:?}, operation lost: {}", op, e),
        }
        Disposition::Deferred
    }

    /// Replay every cached entry. Entries that fail stay, in order; the
    /// cache file is rewritten once at the end.
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        let entries = match self.cache.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Cannot read cache for drain: {}", e);
                return report;
            }
        };

        if entries.is_empty() {
            debug!("Cache empty, nothing to drain");
            return report;
        }

        if !self.check_reachable().await {
            report.skipped = entries.len();
            info!("Network unavailable, {} cached entries wait", entries.len());
            return report;
        }

        info!("Draining {} cached entries", entries.len());
        let mut survivors = Vec::with_capacity(entries.len());

        for entry in entries {
            if !self.network_available {
                report.skipped += 1;
                survivors.push(entry);
                continue;
            }

            let op = match entry.op() {
                Ok(op) => op,
                Err(e) => {
                    error!("Dropping undecodable {:?} entry: {}", entry.kind, e);
                    report.dropped += 1;
                    continue;
                }
            };

            match self.apply(&op).await {
                Ok(()) => report.committed += 1,
                Err(ApplyError::Permanent(reason)) => {
                    error!("Dropping cached {:?}: {}", entry.kind, reason);
                    report.dropped += 1;
                }
                Err(e) => {
                    if e.is_unreachable() {
                        self.mark_unavailable(&e.to_string());
                    }
                    warn!("Cached {:?} still failing: {}", entry.kind, e);
                    report.retained += 1;
                    survivors.push(entry);
                }
            }
        }

        if let Err(e) = self.cache.replace_all(&survivors).await {
            error!(
                "Failed to rewrite cache after drain, {} committed entries may replay: {}",
                report.committed, e
            );
        }

        info!(
            "Drain done - committed: {}, retained: {}, skipped: {}, dropped: {}",
            report.committed, report.retained, report.skipped, report.dropped
        );
        report
    }

    async fn apply(&mut self, op: &PendingOp) -> Result<(), ApplyError> {
        match op {
            PendingOp::CounterMerge(delta) => {
                self.merge_delta(delta).await?;
            }
            PendingOp::MediaUpload(artifact) => {
                let object = format!(
                    "{}/{}/{}",
                    self.device_id,
                    self.clock.today().format("%Y-%m-%d"),
                    artifact.name
                );
                self.upload(&object, &artifact.path).await?;
                info!("Video {} uploaded", artifact.name);
            }
            PendingOp::ArchiveUpload(artifact) => {
                let object = artifact.object_name(&self.device_id);
                self.upload(&object, &artifact.file_path).await?;
                info!("Daily data file {} uploaded", artifact.filename);
            }
        }
        Ok(())
    }

    /// Read the current aggregate, add `delta`, write it back. The mirror
    /// and telemetry only move once the write is confirmed.
    async fn merge_delta(&mut self, delta: &SessionCounters) -> Result<RemoteAggregate, RemoteError> {
        let current = bounded(self.remote_timeout, self.remote.aggregates.get(&self.device_id))
            .await?
            .unwrap_or_default();

        let merged = current.merged(delta, self.clock.now());
        bounded(
            self.remote_timeout,
            self.remote.aggregates.set(&self.device_id, &merged),
        )
        .await?;

        info!(
            "Aggregate updated - Entered: {}, Taps: {}, Offenders: {}",
            merged.enter_count, merged.myki_taps, merged.offender_count
        );
        self.confirm(merged.clone()).await;
        Ok(merged)
    }

    async fn upload(&self, object: &str, local: &Path) -> Result<(), RemoteError> {
        bounded(self.remote_timeout, self.remote.objects.upload(object, local)).await
    }

    async fn confirm(&mut self, totals: RemoteAggregate) {
        self.mirror = totals;
        self.remote.telemetry.publish(&self.mirror).await;
    }

    /// Read the remote aggregate without changing anything
    pub async fn fetch_aggregate(&mut self) -> Result<Option<RemoteAggregate>, RemoteError> {
        self.require_network()?;
        let fetched = bounded(self.remote_timeout, self.remote.aggregates.get(&self.device_id)).await;
        self.observe(fetched)
    }

    /// Fetch the aggregate and adopt it as the mirror
    pub async fn refresh_mirror(&mut self) -> Result<Option<RemoteAggregate>, RemoteError> {
        let record = self.fetch_aggregate().await?;
        if let Some(record) = &record {
            info!(
                "Fetched aggregate - Entered: {}, Offenders: {}, Last updated: {:?}",
                record.enter_count, record.offender_count, record.last_updated
            );
            self.confirm(record.clone()).await;
        }
        Ok(record)
    }

    /// Zero the remote counters with a fresh timestamp
    pub async fn reset_remote(&mut self) -> Result<RemoteAggregate, RemoteError> {
        self.require_network()?;
        let reset = RemoteAggregate::reset_at(self.clock.now());
        let written = bounded(
            self.remote_timeout,
            self.remote.aggregates.set(&self.device_id, &reset),
        )
        .await;
        self.observe(written)?;

        info!("Remote counters reset");
        self.confirm(reset.clone()).await;
        Ok(reset)
    }

    fn require_network(&self) -> Result<(), RemoteError> {
        if self.network_available {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("network flagged unavailable".into()))
        }
    }

    fn observe<T>(&mut self, result: Result<T, RemoteError>) -> Result<T, RemoteError> {
        if let Err(e) = &result {
            if e.is_unreachable() {
                self.mark_unavailable(&e.to_string());
            }
        }
        result
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RemoteError::Unreachable(format!("no answer within {:?}", limit)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_times_out_as_unreachable() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(())
        };
        let err = bounded(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn remaining_counts_retained_and_skipped() {
        let report = DrainReport {
            committed: 3,
            retained: 1,
            skipped: 2,
            dropped: 1,
        };
        assert_eq!(report.remaining(), 3);
    }
}
