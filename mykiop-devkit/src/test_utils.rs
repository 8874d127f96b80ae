/*!
Test Harness pour l'agent MykiOp

Monte un `Coordinator` complet sur un répertoire temporaire avec:
- Remote, télémétrie et sonde en mémoire (voir `remote_stub`)
- Horloge manuelle dans le fuseau du véhicule
- Enregistreur vidéo scripté qui écrit de vrais fichiers
*/

use crate::remote_stub::{MemoryRemote, RecordingTelemetry, ToggleProbe};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use mykiop_agent::cache::{CacheEntry, DurableCache};
use mykiop_agent::clock::{Clock, VehicleClock};
use mykiop_agent::coordinator::{Command, Coordinator, StatusSnapshot};
use mykiop_agent::media::{DisabledMedia, MediaArtifact, MediaPipeline};
use mykiop_agent::reconcile::{Collaborators, Reconciler};
use mykiop_agent::sensor::SensorEvent;
use mykiop_agent::DayBoundaryArchiver;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_DEVICE: &str = "630";

/// 2024-05-01 10:00 à Melbourne
pub const TEST_START: &str = "2024-05-01T10:00:00+10:00";

/// Init du logging pour les tests, idempotent
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mykiop_agent=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Horloge avancée à la main par le test
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(rfc3339: &str) -> Result<Self> {
        let start = DateTime::parse_from_rfc3339(rfc3339)?.with_timezone(&Utc);
        Ok(Self {
            now: Mutex::new(start),
        })
    }

    pub fn set(&self, instant: DateTime<FixedOffset>) {
        *self.now.lock() = instant.with_timezone(&Utc);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Enregistreur qui crée un fichier factice par ouverture de porte
pub struct ScriptedMedia {
    dir: PathBuf,
    recording: Option<PathBuf>,
    started: usize,
}

impl ScriptedMedia {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            recording: None,
            started: 0,
        }
    }
}

#[async_trait]
impl MediaPipeline for ScriptedMedia {
    async fn start_recording(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.started += 1;
        let path = self.dir.join(format!("video_{}.h264", self.started));
        tokio::fs::write(&path, b"scripted frames").await?;
        self.recording = Some(path);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Option<MediaArtifact>> {
        Ok(self.recording.take().map(|path| MediaArtifact {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path,
        }))
    }
}

/// Harness de test complet pour l'agent
pub struct TestHarness {
    pub remote: Arc<MemoryRemote>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub probe: Arc<ToggleProbe>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Coordinator,
    dir: TempDir,
}

impl TestHarness {
    /// Véhicule en ligne, remote vide, sans enregistrement vidéo
    pub async fn new() -> Result<Self> {
        Self::build(MemoryRemote::new(), false).await
    }

    /// Véhicule en ligne avec l'enregistreur scripté
    pub async fn with_recorder() -> Result<Self> {
        Self::build(MemoryRemote::new(), true).await
    }

    /// Construit le coordinator et exécute son bootstrap
    pub async fn build(remote: MemoryRemote, recorder: bool) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::build_in(dir, remote, recorder).await
    }

    /// Comme `build`, mais dans un répertoire préparé par le test (cache existant...)
    pub async fn build_in(dir: TempDir, remote: MemoryRemote, recorder: bool) -> Result<Self> {
        init_test_logging();

        let remote = Arc::new(remote);
        let telemetry = Arc::new(RecordingTelemetry::new());
        let probe = Arc::new(ToggleProbe::new(true));
        let clock = Arc::new(ManualClock::at(TEST_START)?);

        let cache = DurableCache::open(Self::cache_path_in(dir.path())).await?;
        let vehicle_clock = VehicleClock::new(clock.clone(), chrono_tz::Australia::Melbourne);
        let collaborators = Collaborators {
            aggregates: remote.clone(),
            objects: remote.clone(),
            telemetry: telemetry.clone(),
            probe: probe.clone(),
        };
        let engine = Reconciler::new(
            TEST_DEVICE,
            collaborators,
            cache,
            vehicle_clock,
            std::time::Duration::from_secs(2),
        );
        let archiver = DayBoundaryArchiver::new(dir.path().join("archive"));

        let media: Box<dyn MediaPipeline> = if recorder {
            Box::new(ScriptedMedia::new(dir.path().join("videos")))
        } else {
            Box::new(DisabledMedia)
        };

        let mut coordinator = Coordinator::new(engine, archiver, media);
        coordinator.bootstrap().await;
        tracing::debug!("Harness ready in {}", dir.path().display());

        Ok(Self {
            remote,
            telemetry,
            probe,
            clock,
            coordinator,
            dir,
        })
    }

    pub fn cache_path_in(dir: &Path) -> PathBuf {
        dir.join("data_cache.json")
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache_path(&self) -> PathBuf {
        Self::cache_path_in(self.dir.path())
    }

    /// Entrées actuellement dans le cache disque
    pub async fn cached(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.coordinator.engine().cache().load_all().await?)
    }

    /// Coupe ou rétablit le lien sans prévenir le coordinator
    pub fn set_link(&self, online: bool) {
        self.probe.set(online);
        self.remote.set_unreachable(!online);
    }

    /// Coupe le lien et transmet l'observation du moniteur réseau
    pub async fn go_offline(&mut self) {
        self.set_link(false);
        let _ = self.coordinator.handle(Command::Reachability(false)).await;
    }

    /// Rétablit le lien et transmet l'observation du moniteur réseau
    pub async fn reconnect(&mut self) {
        self.set_link(true);
        let _ = self.coordinator.handle(Command::Reachability(true)).await;
    }

    /// Injecte une notification brute du contrôleur de porte
    pub async fn notify(&mut self, notification: &str) -> Result<()> {
        let event = SensorEvent::parse(notification)?;
        let _ = self.coordinator.handle(Command::Sensor(event)).await;
        Ok(())
    }

    /// Cycle complet: ouverture, fermeture, rapport de session
    pub async fn run_session(&mut self, enter: u64, taps: u64, offenders: u64) -> Result<()> {
        self.notify("Door Open").await?;
        self.notify("Door Close").await?;
        self.notify(&format!("E:{};T:{};O:{}", enter, taps, offenders))
            .await
    }

    pub async fn status(&mut self) -> StatusSnapshot {
        self.coordinator.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(TEST_START).unwrap();
        clock.advance(Duration::hours(15));
        assert_eq!(
            clock.now_utc(),
            DateTime::parse_from_rfc3339("2024-05-02T01:00:00+10:00").unwrap()
        );
    }

    #[tokio::test]
    async fn scripted_media_produces_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut media = ScriptedMedia::new(dir.path());

        media.start_recording().await.unwrap();
        let artifact = media.stop_recording().await.unwrap().unwrap();

        assert_eq!(artifact.name, "video_1.h264");
        assert!(artifact.path.exists());
        assert_eq!(media.stop_recording().await.unwrap(), None);
    }

    #[tokio::test]
    async fn harness_boots_online_with_empty_cache() {
        let mut harness = TestHarness::new().await.unwrap();

        let status = harness.status().await;
        assert!(status.network_available);
        assert_eq!(status.pending_entries, 0);
        assert!(harness.cache_path().exists());
        assert_eq!(harness.remote.get_calls(), 1);
    }
}
