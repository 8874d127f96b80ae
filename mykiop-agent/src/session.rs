//! Per-door-session counters
//!
//! A session is the interval between a door opening and the session report
//! that follows it. Counters live only in memory; once a report has been
//! handed to the reconciliation engine they are reset.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Counter deltas for one session
///
/// Serialized with the remote record's field names because counter-merge
/// cache entries carry exactly this payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    #[serde(default)]
    pub enter_count: u64,
    #[serde(default)]
    pub myki_taps: u64,
    #[serde(default, rename = "offenders")]
    pub offender_count: u64,
}

impl SessionCounters {
    pub fn new(enter_count: u64, myki_taps: u64, offender_count: u64) -> Self {
        Self {
            enter_count,
            myki_taps,
            offender_count,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Owner of the in-flight session counters
#[derive(Debug, Default)]
pub struct SessionAggregator {
    counters: SessionCounters,
    open: bool,
}

impl SessionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a door-open period. Opening twice is a controller protocol
    /// violation; the stale session is discarded instead of failing.
    pub fn open(&mut self) {
        if self.open {
            warn!(
                "Door opened while a session was already open, discarding {:?}",
                self.counters
            );
        }
        self.reset();
        self.open = true;
    }

    /// Door closed; the report for this session may still arrive.
    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn current(&self) -> SessionCounters {
        self.counters
    }

    /// Replace the counters with the report's full session totals and
    /// return the snapshot to commit.
    pub fn record_session_end(
        &mut self,
        enter_count: u64,
        myki_taps: u64,
        offender_count: u64,
    ) -> SessionCounters {
        self.counters = SessionCounters::new(enter_count, myki_taps, offender_count);
        self.open = false;
        debug!("Session ended with {:?}", self.counters);
        self.counters
    }

    pub fn reset(&mut self) {
        self.counters = SessionCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_replaces_rather_than_accumulates() {
        let mut session = SessionAggregator::new();
        session.open();
        session.record_session_end(2, 2, 0);
        let snapshot = session.record_session_end(5, 4, 1);

        assert_eq!(snapshot, SessionCounters::new(5, 4, 1));
        assert_eq!(session.current(), snapshot);
    }

    #[test]
    fn double_open_forces_reset() {
        let mut session = SessionAggregator::new();
        session.open();
        session.record_session_end(3, 3, 0);
        session.open();
        session.open();

        assert!(session.is_open());
        assert!(session.current().is_zero());
    }

    #[test]
    fn reset_zeroes_counters() {
        let mut session = SessionAggregator::new();
        session.record_session_end(1, 0, 1);
        session.reset();
        assert!(session.current().is_zero());
    }

    #[test]
    fn counters_use_remote_field_names() {
        let json = serde_json::to_value(SessionCounters::new(5, 4, 1)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"enter_count": 5, "myki_taps": 4, "offenders": 1})
        );
    }
}
