//! Remote aggregate record and the stores behind it
//!
//! The remote side offers plain `get`/`set` on a keyed record with no
//! compare-and-swap, plus an object store for recordings and daily archives.
//! Correct counting therefore rests on the merge in
//! [`RemoteAggregate::merged`]: read, add the delta, write back.

use crate::error::RemoteError;
use crate::session::SessionCounters;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Day-to-date totals for one vehicle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAggregate {
    #[serde(default)]
    pub enter_count: u64,
    #[serde(default)]
    pub myki_taps: u64,
    #[serde(default, rename = "offenders")]
    pub offender_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<FixedOffset>>,
}

impl RemoteAggregate {
    /// Zeroed totals stamped with `now`
    pub fn reset_at(now: DateTime<FixedOffset>) -> Self {
        Self {
            last_updated: Some(now),
            ..Self::default()
        }
    }

    /// Current totals plus `delta`, stamped with the writer's clock
    pub fn merged(&self, delta: &SessionCounters, now: DateTime<FixedOffset>) -> Self {
        Self {
            enter_count: self.enter_count.saturating_add(delta.enter_count),
            myki_taps: self.myki_taps.saturating_add(delta.myki_taps),
            offender_count: self.offender_count.saturating_add(delta.offender_count),
            last_updated: Some(now),
        }
    }
}

/// Keyed aggregate record store
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RemoteAggregate>, RemoteError>;
    async fn set(&self, key: &str, record: &RemoteAggregate) -> Result<(), RemoteError>;
}

/// Blob upload target
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local` under `object`
    async fn upload(&self, object: &str, local: &Path) -> Result<(), RemoteError>;
}

/// Realtime-database style REST store plus an upload endpoint
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    database_url: String,
    storage_url: String,
    collection: String,
}

impl HttpRemote {
    pub fn new(
        database_url: &str,
        storage_url: &str,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("mykiop-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            database_url: database_url.trim_end_matches('/').to_string(),
            storage_url: storage_url.trim_end_matches('/').to_string(),
            collection: collection.trim_matches('/').to_string(),
        })
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/{}/{}.json", self.database_url, self.collection, key)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(rejected(status, message))
}

fn rejected(status: StatusCode, message: String) -> RemoteError {
    RemoteError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl AggregateStore for HttpRemote {
    async fn get(&self, key: &str) -> Result<Option<RemoteAggregate>, RemoteError> {
        let url = self.record_url(key);
        debug!("GET {}", url);

        let response = ensure_success(self.client.get(&url).send().await?).await?;
        let body = response.text().await?;

        // The database answers `null` for a missing record
        serde_json::from_str::<Option<RemoteAggregate>>(&body)
            .map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    async fn set(&self, key: &str, record: &RemoteAggregate) -> Result<(), RemoteError> {
        let url = self.record_url(key);
        debug!("PUT {}", url);

        ensure_success(self.client.put(&url).json(record).send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for HttpRemote {
    async fn upload(&self, object: &str, local: &Path) -> Result<(), RemoteError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| RemoteError::LocalFile {
                path: local.to_path_buf(),
                source,
            })?;

        debug!("Uploading {} ({} bytes)", object, bytes.len());
        let request = self
            .client
            .post(&self.storage_url)
            .query(&[("name", object)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);

        ensure_success(request.send().await?).await?;
        Ok(())
    }
}
