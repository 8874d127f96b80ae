//! Single owner of the agent's mutable state
//!
//! Session counters, the remote mirror, the network flag and the cache file
//! all live behind this task. Sensor ingress, the network monitor and the
//! housekeeping timer only talk to it through [`Command`]s, so there is never
//! more than one commit or drain touching the cache at a time.

use crate::archive::{DayBoundaryArchiver, DayCheck};
use crate::cache::PendingOp;
use crate::media::{MediaArtifact, MediaPipeline};
use crate::reconcile::{Disposition, DrainReport, Reconciler};
use crate::remote::RemoteAggregate;
use crate::sensor::SensorEvent;
use crate::session::{SessionAggregator, SessionCounters};
use chrono::{DateTime, FixedOffset};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests accepted by the coordinator
#[derive(Debug)]
pub enum Command {
    /// Parsed door controller notification
    Sensor(SensorEvent),
    /// Latest reachability observation from the network monitor
    Reachability(bool),
    DrainCache,
    CheckDayBoundary,
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown,
}

/// Point-in-time view of the coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub totals: RemoteAggregate,
    pub network_available: bool,
    pub pending_entries: usize,
    pub session_open: bool,
    pub session: SessionCounters,
    pub previous_timestamp: Option<DateTime<FixedOffset>>,
}

/// What a session report turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// `None` when the session counted nothing and no merge was submitted
    pub counters: Option<Disposition>,
    pub media: Option<Disposition>,
}

pub struct Coordinator {
    session: SessionAggregator,
    engine: Reconciler,
    archiver: DayBoundaryArchiver,
    media: Box<dyn MediaPipeline>,
    last_recording: Option<MediaArtifact>,
}

impl Coordinator {
    pub fn new(
        engine: Reconciler,
        archiver: DayBoundaryArchiver,
        media: Box<dyn MediaPipeline>,
    ) -> Self {
        Self {
            session: SessionAggregator::new(),
            engine,
            archiver,
            media,
            last_recording: None,
        }
    }

    pub fn engine(&self) -> &Reconciler {
        &self.engine
    }

    pub fn archiver(&self) -> &DayBoundaryArchiver {
        &self.archiver
    }

    /// Seed the mirror and the day boundary from the remote store, then
    /// flush anything left in the cache by a previous run.
    pub async fn bootstrap(&mut self) {
        if self.engine.check_reachable().await {
            match self.engine.refresh_mirror().await {
                Ok(record) => {
                    let now = self.engine.clock().now();
                    self.archiver.initialize(record.as_ref(), now);
                }
                Err(e) => warn!("Initial fetch failed: {}", e),
            }
        } else {
            warn!("Network unavailable at startup, skipping initial fetch");
        }

        self.engine.drain().await;
    }

    /// Process commands until the channel closes or `Shutdown` arrives
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.bootstrap().await;
        info!("Coordinator ready for sensor events");

        while let Some(command) = commands.recv().await {
            if self.handle(command).await.is_break() {
                break;
            }
        }

        info!("Coordinator stopped");
    }

    pub async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Sensor(event) => self.on_sensor(event).await,
            Command::Reachability(available) => {
                if self.engine.set_network_available(available) {
                    info!("Network restored, attempting to send cached data");
                    self.engine.drain().await;
                }
            }
            Command::DrainCache => {
                self.drain().await;
            }
            Command::CheckDayBoundary => {
                self.check_day_boundary().await;
            }
            Command::Status(reply) => {
                let snapshot = self.status().await;
                if reply.send(snapshot).is_err() {
                    debug!("Status requester went away");
                }
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub async fn drain(&mut self) -> DrainReport {
        self.engine.drain().await
    }

    pub async fn check_day_boundary(&mut self) -> DayCheck {
        let result = self.archiver.check(&mut self.engine).await;
        if result != DayCheck::SameDay {
            debug!("Day boundary check: {:?}", result);
        }
        result
    }

    pub async fn status(&mut self) -> StatusSnapshot {
        StatusSnapshot {
            totals: self.engine.mirror().clone(),
            network_available: self.engine.network_available(),
            pending_entries: self.engine.cache().len().await,
            session_open: self.session.is_open(),
            session: self.session.current(),
            previous_timestamp: self.archiver.previous_timestamp(),
        }
    }

    async fn on_sensor(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::DoorOpen => {
                info!("Door opened");
                self.session.open();
                if let Err(e) = self.media.start_recording().await {
                    error!("Failed to start recording: {:#}", e);
                }
            }
            SensorEvent::DoorClose => {
                info!("Door closed");
                self.session.close();
                match self.media.stop_recording().await {
                    Ok(Some(artifact)) => self.last_recording = Some(artifact),
                    Ok(None) => {}
                    Err(e) => error!("Failed to stop recording: {:#}", e),
                }
            }
            SensorEvent::SessionReport(counters) => {
                self.on_session_report(counters).await;
            }
        }
    }

    /// Hand a finished session to the engine and reset it
    pub async fn on_session_report(&mut self, report: SessionCounters) -> SessionOutcome {
        let counters = self.session.record_session_end(
            report.enter_count,
            report.myki_taps,
            report.offender_count,
        );
        info!(
            "Session counts - Entered: {}, Myki Taps: {}, Offenders: {}",
            counters.enter_count, counters.myki_taps, counters.offender_count
        );

        let media = self.route_recording(&counters).await;

        let outcome = if counters.is_zero() {
            debug!("Empty session, nothing to commit");
            None
        } else {
            Some(self.engine.submit(PendingOp::CounterMerge(counters)).await)
        };
        self.session.reset();

        if self.engine.network_available() {
            self.engine.drain().await;
        }

        SessionOutcome {
            counters: outcome,
            media,
        }
    }

    /// Upload the session's recording only when it caught an offender
    async fn route_recording(&mut self, counters: &SessionCounters) -> Option<Disposition> {
        let artifact = self.last_recording.take()?;

        if counters.offender_count == 0 {
            info!("No offenders, video retained locally: {}", artifact.path.display());
            return None;
        }

        let disposition = self.engine.submit(PendingOp::MediaUpload(artifact.clone())).await;
        if disposition != Disposition::Committed {
            warn!("Video upload {:?}, path kept for retry: {}", disposition, artifact.path.display());
        }
        Some(disposition)
    }
}

/// Feed `CheckDayBoundary` into the coordinator on a fixed period
pub fn spawn_day_boundary_timer(period: Duration, commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; bootstrap already seeded the state
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if commands.send(Command::CheckDayBoundary).await.is_err() {
                debug!("Coordinator gone, stopping day boundary timer");
                break;
            }
        }
    })
}
