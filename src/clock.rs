use chrono::{DateTime, FixedOffset, Utc};

/// Source of evidence timestamps. The trusted time source lives outside
/// the crate; anything that can say what time it is in JST fits here.
pub trait Clock {
    fn now(&self) -> DateTime<FixedOffset>;

    /// `2024-05-01 13:45:10.123`
    fn timestamp(&self) -> String {
        self.now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// `2024-05-01_13-45-10`, safe for folder names
    fn folder_stamp(&self) -> String {
        self.now().format("%Y-%m-%d_%H-%M-%S").to_string()
    }
}

pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("+09:00 is a valid offset")
}

/// System clock converted to JST.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&jst())
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl FixedClock {
    pub fn from_rfc3339(s: &str) -> Option<FixedClock> {
        DateTime::parse_from_rfc3339(s).ok().map(FixedClock)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats() {
        let clock = FixedClock::from_rfc3339("2024-05-01T13:45:10.123+09:00").unwrap();
        assert_eq!(clock.timestamp(), "2024-05-01 13:45:10.123");
        assert_eq!(clock.folder_stamp(), "2024-05-01_13-45-10");
    }

    #[test]
    fn system_clock_is_jst() {
        assert_eq!(SystemClock.now().offset().local_minus_utc(), 9 * 3600);
    }
}
