//! Durable offline cache of pending remote operations
//!
//! The cache is a single JSON file holding an array of
//! `{"type": ..., "data": ..., "timestamp": ...}` entries, oldest first.
//! Every rewrite goes through a temporary file and a rename so a crash
//! leaves either the old or the new array on disk, never a torn one. A file
//! that does not parse is replaced by `[]`: this is a best-effort buffer,
//! losing it beats refusing to count.
//!
//! The coordinator is the only writer, which makes the load/modify/replace
//! cycle atomic without a file lock.

use crate::archive::ArchiveArtifact;
use crate::error::CacheError;
use crate::media::MediaArtifact;
use crate::session::SessionCounters;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Discriminant stored in the `type` field of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    CounterMerge,
    MediaUpload,
    ArchiveUpload,
}

/// An operation against the remote side that may have to wait for the network
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Session delta to merge into the remote aggregate. Always a delta,
    /// never an absolute total.
    CounterMerge(SessionCounters),
    MediaUpload(MediaArtifact),
    ArchiveUpload(ArchiveArtifact),
}

impl PendingOp {
    pub fn kind(&self) -> EntryKind {
        match self {
            PendingOp::CounterMerge(_) => EntryKind::CounterMerge,
            PendingOp::MediaUpload(_) => EntryKind::MediaUpload,
            PendingOp::ArchiveUpload(_) => EntryKind::ArchiveUpload,
        }
    }
}

/// One persisted pending operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<FixedOffset>,
}

impl CacheEntry {
    pub fn new(op: &PendingOp, enqueued_at: DateTime<FixedOffset>) -> Result<Self, CacheError> {
        let data = match op {
            PendingOp::CounterMerge(delta) => serde_json::to_value(delta)?,
            PendingOp::MediaUpload(artifact) => serde_json::to_value(artifact)?,
            PendingOp::ArchiveUpload(artifact) => serde_json::to_value(artifact)?,
        };

        Ok(Self {
            kind: op.kind(),
            data,
            timestamp: enqueued_at,
        })
    }

    /// Decode the payload back into the operation it describes
    pub fn op(&self) -> Result<PendingOp, serde_json::Error> {
        let data = self.data.clone();
        Ok(match self.kind {
            EntryKind::CounterMerge => PendingOp::CounterMerge(serde_json::from_value(data)?),
            EntryKind::MediaUpload => PendingOp::MediaUpload(serde_json::from_value(data)?),
            EntryKind::ArchiveUpload => PendingOp::ArchiveUpload(serde_json::from_value(data)?),
        })
    }
}

/// Handle on the cache file
#[derive(Debug, Clone)]
pub struct DurableCache {
    path: PathBuf,
}

impl DurableCache {
    /// Open the cache, creating `[]` if the file is missing and repairing it
    /// if it is corrupt.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self, CacheError> {
        let cache = Self { path: path.into() };

        if let Some(parent) = cache.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| cache.io_error(source))?;
            }
        }

        if !tokio::fs::try_exists(&cache.path)
            .await
            .map_err(|source| cache.io_error(source))?
        {
            cache.replace_all(&[]).await?;
            info!("Created empty cache at {}", cache.path.display());
        } else {
            let pending = cache.load_all().await?;
            info!(
                "Opened cache at {} with {} pending entries",
                cache.path.display(),
                pending.len()
            );
        }

        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every pending entry, oldest first.
    ///
    /// A blank or unparseable file is reset to `[]`. Inside a valid array,
    /// only the elements that do not decode are dropped; the file is then
    /// rewritten once with the rest.
    pub async fn load_all(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        if content.trim().is_empty() {
            debug!("Cache file {} is blank, writing []", self.path.display());
            self.replace_all(&[]).await?;
            return Ok(Vec::new());
        }

        let raw = match serde_json::from_str::<Vec<serde_json::Value>>(&content) {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    "Cache file {} is corrupt ({}), reinitializing; pending operations are lost",
                    self.path.display(),
                    e
                );
                self.replace_all(&[]).await?;
                return Ok(Vec::new());
            }
        };

        let total = raw.len();
        let mut entries = Vec::with_capacity(total);
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => error!("Dropping unreadable cache entry #{}: {}", index, e),
            }
        }

        if entries.len() != total {
            warn!(
                "Kept {} of {} cache entries in {}",
                entries.len(),
                total,
                self.path.display()
            );
            self.replace_all(&entries).await?;
        }
        Ok(entries)
    }

    /// Atomically replace the whole cache with `entries`
    pub async fn replace_all(&self, entries: &[CacheEntry]) -> Result<(), CacheError> {
        let json = serde_json::to_vec(entries)?;
        let tmp = self.temp_path();

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &self.path).await
        };

        if let Err(source) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(self.io_error(source));
        }

        debug!("Cache rewritten with {} entries", entries.len());
        Ok(())
    }

    /// Add one entry at the tail. Returns the number of pending entries.
    pub async fn append(&self, entry: CacheEntry) -> Result<usize, CacheError> {
        let mut entries = self.load_all().await?;
        entries.push(entry);
        self.replace_all(&entries).await?;
        Ok(entries.len())
    }

    pub async fn len(&self) -> usize {
        match self.load_all().await {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!("Could not read cache: {}", e);
                0
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cache".into());
        name.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ts() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00+10:00").unwrap()
    }

    fn merge(enter: u64, taps: u64, offenders: u64) -> CacheEntry {
        CacheEntry::new(
            &PendingOp::CounterMerge(SessionCounters::new(enter, taps, offenders)),
            ts(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn open_creates_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data_cache.json");

        let cache = DurableCache::open(&path).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(cache.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DurableCache::open(dir.path().join("c.json")).await.unwrap();

        cache.append(merge(1, 1, 0)).await.unwrap();
        let len = cache.append(merge(2, 2, 1)).await.unwrap();

        assert_eq!(len, 2);
        let entries = cache.load_all().await.unwrap();
        assert_eq!(entries, vec![merge(1, 1, 0), merge(2, 2, 1)]);
    }

    #[tokio::test]
    async fn corrupt_file_is_repaired_and_appends_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "[{\"type\": \"counter-merge\", \"da").unwrap();

        let cache = DurableCache::open(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");

        cache.append(merge(5, 4, 1)).await.unwrap();
        assert_eq!(cache.load_all().await.unwrap(), vec![merge(5, 4, 1)]);
    }

    #[tokio::test]
    async fn empty_file_counts_as_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "").unwrap();

        let cache = DurableCache::open(&path).await.unwrap();
        assert!(cache.is_empty().await);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
    }

    #[tokio::test]
    async fn whitespace_file_is_rewritten_as_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let cache = DurableCache::open(&path).await.unwrap();
        std::fs::write(&path, "  \n").unwrap();

        assert!(cache.load_all().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
    }

    #[tokio::test]
    async fn bad_element_drops_only_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(
            &path,
            r#"[
                {"type":"counter-merge","data":{"enter_count":5,"myki_taps":4,"offenders":1},"timestamp":"2024-05-01T10:00:00+10:00"},
                {"type":"counter-merge","data":{"enter_count":1,"myki_taps":1,"offenders":0},"timestamp":"not-a-date"},
                {"type":"teleport","data":{},"timestamp":"2024-05-01T10:00:00+10:00"},
                {"type":"counter-merge","data":{"enter_count":2,"myki_taps":2,"offenders":0},"timestamp":"2024-05-01T10:00:00+10:00"}
            ]"#,
        )
        .unwrap();

        let cache = DurableCache::open(&path).await.unwrap();

        let expected = vec![merge(5, 4, 1), merge(2, 2, 0)];
        assert_eq!(cache.load_all().await.unwrap(), expected);
        let on_disk: Vec<CacheEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, expected);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DurableCache::open(dir.path().join("c.json")).await.unwrap();
        cache.append(merge(1, 0, 0)).await.unwrap();
        cache.replace_all(&[]).await.unwrap();

        let names: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(names, vec![dir.path().join("c.json")]);
    }

    #[test]
    fn entry_wire_format() {
        let entry = merge(5, 4, 1);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["type"], "counter-merge");
        assert_eq!(
            json["data"],
            serde_json::json!({"enter_count": 5, "myki_taps": 4, "offenders": 1})
        );
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00+10:00");
    }

    #[test]
    fn media_entry_decodes_back_to_its_operation() {
        let artifact = MediaArtifact {
            path: PathBuf::from("/data/630/video.h264"),
            name: "video.h264".to_string(),
        };
        let entry = CacheEntry::new(&PendingOp::MediaUpload(artifact.clone()), ts()).unwrap();

        assert_eq!(entry.kind, EntryKind::MediaUpload);
        assert_eq!(entry.op().unwrap(), PendingOp::MediaUpload(artifact));
    }
}
