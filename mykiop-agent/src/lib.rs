//! MykiOp Agent - vehicle edge node for boarding and fare-compliance counting
//!
//! Turns door controller sessions into counter updates on a shared remote
//! aggregate and keeps counting through network outages:
//! - Session aggregation per door-open period
//! - Read-merge-write commits of session deltas
//! - Durable JSON cache for deferred uploads, drained on reconnect
//! - Daily archive and reset of the remote totals
//! - MQTT sensor ingress and telemetry/display output

pub mod archive;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod mqtt;
pub mod network;
pub mod reconcile;
pub mod remote;
pub mod sensor;
pub mod session;
pub mod telemetry;

pub use archive::{ArchiveArtifact, DayBoundaryArchiver, DayCheck};
pub use cache::{CacheEntry, DurableCache, EntryKind, PendingOp};
pub use clock::{Clock, SystemClock, VehicleClock};
pub use config::AgentConfig;
pub use coordinator::{Command, Coordinator, SessionOutcome, StatusSnapshot};
pub use media::{MediaArtifact, MediaPipeline};
pub use reconcile::{Collaborators, Disposition, DrainReport, Reconciler};
pub use remote::{AggregateStore, ObjectStore, RemoteAggregate};
pub use sensor::SensorEvent;
pub use session::{SessionAggregator, SessionCounters};
pub use telemetry::TelemetrySink;
