/*!
Stubs des collaborateurs distants pour tests sans réseau

- `MemoryRemote`: store d'agrégats + store d'objets en mémoire, avec
  simulation de coupure réseau et de refus serveur
- `RecordingTelemetry`: enregistre chaque total publié
- `ToggleProbe`: sonde de connectivité pilotée par le test
*/

use async_trait::async_trait;
use mykiop_agent::error::RemoteError;
use mykiop_agent::network::ReachabilityProbe;
use mykiop_agent::remote::{AggregateStore, ObjectStore, RemoteAggregate};
use mykiop_agent::telemetry::TelemetrySink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Objet reçu par `MemoryRemote::upload`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub object: String,
    pub source: PathBuf,
    pub size: usize,
}

/// Remote en mémoire implémentant les deux stores
#[derive(Default)]
pub struct MemoryRemote {
    records: Mutex<HashMap<String, RemoteAggregate>>,
    uploads: Mutex<Vec<UploadedObject>>,
    unreachable: AtomicBool,
    reject_uploads: AtomicBool,
    /// Nombre de `set` à refuser avant d'accepter à nouveau
    rejected_sets: AtomicUsize,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pré-remplit un enregistrement
    pub fn with_record(self, key: &str, record: RemoteAggregate) -> Self {
        self.records.lock().insert(key.to_string(), record);
        self
    }

    pub fn insert(&self, key: &str, record: RemoteAggregate) {
        self.records.lock().insert(key.to_string(), record);
    }

    pub fn record(&self, key: &str) -> Option<RemoteAggregate> {
        self.records.lock().get(key).cloned()
    }

    pub fn uploads(&self) -> Vec<UploadedObject> {
        self.uploads.lock().clone()
    }

    /// Toutes les requêtes échouent en `Unreachable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Les uploads répondent 503
    pub fn set_reject_uploads(&self, reject: bool) {
        self.reject_uploads.store(reject, Ordering::SeqCst);
    }

    /// Les `count` prochains `set` répondent 500
    pub fn reject_next_sets(&self, count: usize) {
        self.rejected_sets.store(count, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<RemoteAggregate>, RemoteError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_link()?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, record: &RemoteAggregate) -> Result<(), RemoteError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check_link()?;

        let rejected = self
            .rejected_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(RemoteError::Rejected {
                status: 500,
                message: "simulated server error".into(),
            });
        }

        self.records.lock().insert(key.to_string(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryRemote {
    async fn upload(&self, object: &str, local: &Path) -> Result<(), RemoteError> {
        self.check_link()?;

        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| RemoteError::LocalFile {
                path: local.to_path_buf(),
                source,
            })?;

        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected {
                status: 503,
                message: "simulated storage outage".into(),
            });
        }

        self.uploads.lock().push(UploadedObject {
            object: object.to_string(),
            source: local.to_path_buf(),
            size: bytes.len(),
        });
        Ok(())
    }
}

/// Capture les totaux publiés
#[derive(Default)]
pub struct RecordingTelemetry {
    published: Mutex<Vec<RemoteAggregate>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<RemoteAggregate> {
        self.published.lock().clone()
    }

    pub fn last(&self) -> Option<RemoteAggregate> {
        self.published.lock().last().cloned()
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn publish(&self, totals: &RemoteAggregate) {
        self.published.lock().push(totals.clone());
    }
}

/// Sonde de connectivité basculée à la main
pub struct ToggleProbe {
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl ToggleProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for ToggleProbe {
    async fn is_reachable(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}
