//! Reachability probing and the background network monitor

use crate::coordinator::Command;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Boolean liveness check for the uplink
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// TCP connect to a well-known external host, bounded by a timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe {}:{} failed: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                debug!("Probe {}:{} timed out", self.host, self.port);
                false
            }
        }
    }
}

/// Poll the probe forever and report every observation to the coordinator.
///
/// The coordinator owns the `network_available` flag and reacts to the
/// unavailable→available transition by draining the cache; reporting every
/// poll lets it notice recovery even after it flipped the flag itself on a
/// failed remote call.
pub fn spawn_network_monitor(
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    commands: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<bool> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let reachable = probe.is_reachable().await;

            if last != Some(reachable) {
                info!(
                    "Network monitor: uplink {}",
                    if reachable { "reachable" } else { "unreachable" }
                );
                last = Some(reachable);
            }

            if commands.send(Command::Reachability(reachable)).await.is_err() {
                debug!("Coordinator gone, stopping network monitor");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for Toggle {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn tcp_probe_sees_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.is_reachable().await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(!probe.is_reachable().await);
    }

    #[tokio::test]
    async fn monitor_reports_each_poll() {
        let probe = Arc::new(Toggle(AtomicBool::new(false)));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_network_monitor(probe.clone(), Duration::from_millis(10), tx);

        assert!(matches!(rx.recv().await, Some(Command::Reachability(false))));
        probe.0.store(true, Ordering::SeqCst);
        loop {
            if let Some(Command::Reachability(true)) = rx.recv().await {
                break;
            }
        }

        drop(rx);
        handle.await.unwrap();
    }
}
