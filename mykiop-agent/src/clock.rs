//! Wall-clock access in the fixed vehicle timezone

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

/// Source of the current UTC instant
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock bound to the vehicle timezone.
///
/// Every timestamp the agent writes (remote `last_updated`, cache entries,
/// recording names) comes from here, so all of them carry the same offset.
#[derive(Clone)]
pub struct VehicleClock {
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl VehicleClock {
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { clock, tz }
    }

    pub fn system(tz: Tz) -> Self {
        Self::new(Arc::new(SystemClock), tz)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current local time with its UTC offset
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now_utc().with_timezone(&self.tz).fixed_offset()
    }

    /// Calendar date of `ts` as seen in the vehicle timezone
    pub fn local_date(&self, ts: &DateTime<FixedOffset>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.local_date(&self.now())
    }
}

impl std::fmt::Debug for VehicleClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VehicleClock").field("tz", &self.tz).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Fixed(DateTime<Utc>);

    impl Clock for Fixed {
        fn now_utc(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn local_date_follows_vehicle_timezone() {
        // 14:30 UTC is already the next day in Melbourne (+10/+11)
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap();
        let clock = VehicleClock::new(Arc::new(Fixed(utc)), chrono_tz::Australia::Melbourne);

        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!(clock.now().offset().local_minus_utc(), 10 * 3600);
    }

    #[test]
    fn local_date_of_foreign_offset_timestamp() {
        let clock = VehicleClock::system(chrono_tz::Australia::Melbourne);
        let ts = DateTime::parse_from_rfc3339("2024-05-01T23:30:00+00:00").unwrap();
        assert_eq!(clock.local_date(&ts), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }
}
