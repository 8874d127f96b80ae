//! Door sensor notifications
//!
//! The door controller sends short text notifications over BLE; a bridge
//! forwards them verbatim. Three shapes exist:
//! - `Door Open`
//! - `Door Close`
//! - `E:<entered>;T:<myki taps>;O:<offenders>` (full session totals)

use crate::error::SensorError;
use crate::session::SessionCounters;

/// One event from the door controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    DoorOpen,
    DoorClose,
    SessionReport(SessionCounters),
}

impl SensorEvent {
    /// Parse a raw notification payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self, SensorError> {
        let text = std::str::from_utf8(payload).map_err(|_| SensorError::NotUtf8)?;
        Self::parse(text)
    }

    /// Parse a notification string
    pub fn parse(notification: &str) -> Result<Self, SensorError> {
        let notification = notification.trim();

        match notification {
            "Door Open" => return Ok(SensorEvent::DoorOpen),
            "Door Close" => return Ok(SensorEvent::DoorClose),
            _ => {}
        }

        let parts: Vec<&str> = notification.split(';').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(SensorError::UnknownFormat(notification.to_string()));
        }

        let enter_count = counter(parts[0], "E:", "enter_count", notification)?;
        let myki_taps = counter(parts[1], "T:", "myki_taps", notification)?;
        let offender_count = counter(parts[2], "O:", "offender_count", notification)?;

        Ok(SensorEvent::SessionReport(SessionCounters {
            enter_count,
            myki_taps,
            offender_count,
        }))
    }
}

fn counter(
    part: &str,
    prefix: &str,
    field: &'static str,
    raw: &str,
) -> Result<u64, SensorError> {
    let value = part
        .strip_prefix(prefix)
        .ok_or_else(|| SensorError::UnknownFormat(raw.to_string()))?;

    value.trim().parse().map_err(|_| SensorError::InvalidCounter {
        field,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_door_events() {
        assert_eq!(SensorEvent::parse("Door Open"), Ok(SensorEvent::DoorOpen));
        assert_eq!(SensorEvent::parse("Door Close\r\n"), Ok(SensorEvent::DoorClose));
    }

    #[test]
    fn parses_session_report() {
        let event = SensorEvent::parse("E:5;T:4;O:1").unwrap();
        assert_eq!(
            event,
            SensorEvent::SessionReport(SessionCounters {
                enter_count: 5,
                myki_taps: 4,
                offender_count: 1,
            })
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            SensorEvent::parse("Door Ajar"),
            Err(SensorError::UnknownFormat(_))
        ));
        assert!(matches!(
            SensorEvent::parse("T:4;E:5;O:1"),
            Err(SensorError::UnknownFormat(_))
        ));
        assert!(matches!(
            SensorEvent::parse("E:5;T:-4;O:1"),
            Err(SensorError::InvalidCounter { field: "myki_taps", .. })
        ));
        assert_eq!(
            SensorEvent::from_bytes(&[0xff, 0xfe]),
            Err(SensorError::NotUtf8)
        );
    }
}
