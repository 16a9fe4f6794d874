use chrono::Timelike;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Wall-clock time of day, stored as minutes since midnight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(TimeOfDay(hour as u16 * 60 + minute as u16))
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    pub fn now_local() -> Self {
        let now = chrono::Local::now();
        // hour() < 24 and minute() < 60, so this is always in range.
        TimeOfDay((now.hour() * 60 + now.minute()) as u16)
    }

    /// Renders as `hh:mm AM`/`hh:mm PM`.
    pub fn to_12h(self) -> String {
        let (h, suffix) = match self.hour() {
            0 => (12, "AM"),
            h @ 1..=11 => (h, "AM"),
            12 => (12, "PM"),
            h => (h - 12, "PM"),
        };
        format!("{h:02}:{:02} {suffix}", self.minute())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day '{}', expected H:MM", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    /// Accepts `HH:MM` as well as the unpadded `H:M` form (e.g. `7:5`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || m.is_empty() || h.len() > 2 || m.len() > 2 {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        TimeOfDay::new(hour, minute).ok_or_else(err)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Daily interval during which notifications are archived but not forwarded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietWindow {
    pub enabled: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl QuietWindow {
    pub fn contains(&self, now: TimeOfDay) -> bool {
        is_quiet(self.enabled, self.start, self.end, now)
    }

    pub fn is_quiet_now(&self) -> bool {
        self.contains(TimeOfDay::now_local())
    }

    pub fn summary(&self) -> String {
        if !self.enabled {
            return "off".to_string();
        }
        format!("{} - {}", self.start.to_12h(), self.end.to_12h())
    }
}

/// Both bounds are exclusive. A window with `start >= end` wraps past midnight,
/// so `start == end` covers the whole day except that single minute.
pub fn is_quiet(enabled: bool, start: TimeOfDay, end: TimeOfDay, now: TimeOfDay) -> bool {
    if !enabled {
        return false;
    }
    if start < end {
        start < now && now < end
    } else {
        now > start || now < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let (start, end) = (t("22:00"), t("06:00"));
        assert!(is_quiet(true, start, end, t("23:00")));
        assert!(is_quiet(true, start, end, t("00:30")));
        assert!(!is_quiet(true, start, end, t("12:00")));
        assert!(!is_quiet(true, start, end, t("06:00")));
        assert!(!is_quiet(true, start, end, t("22:00")));
    }

    #[test]
    fn same_day_window_is_exclusive() {
        let (start, end) = (t("09:00"), t("17:00"));
        assert!(is_quiet(true, start, end, t("12:00")));
        assert!(!is_quiet(true, start, end, t("08:59")));
        assert!(!is_quiet(true, start, end, t("09:00")));
        assert!(!is_quiet(true, start, end, t("17:00")));
        assert!(is_quiet(true, start, end, t("16:59")));
    }

    #[test]
    fn disabled_window_is_never_quiet() {
        for m in (0..24 * 60u16).step_by(7) {
            let now = TimeOfDay::new((m / 60) as u8, (m % 60) as u8).unwrap();
            assert!(!is_quiet(false, t("22:00"), t("06:00"), now));
            assert!(!is_quiet(false, t("00:00"), t("00:00"), now));
        }
    }

    #[test]
    fn equal_bounds_cover_all_but_the_boundary_minute() {
        let w = QuietWindow {
            enabled: true,
            start: t("08:00"),
            end: t("08:00"),
        };
        assert!(w.contains(t("07:59")));
        assert!(w.contains(t("08:01")));
        assert!(!w.contains(t("08:00")));
    }

    #[test]
    fn parses_padded_and_unpadded_times() {
        assert_eq!(t("7:5"), TimeOfDay::new(7, 5).unwrap());
        assert_eq!(t("07:05"), TimeOfDay::new(7, 5).unwrap());
        assert_eq!(t(" 23:59 "), TimeOfDay::new(23, 59).unwrap());
        assert_eq!(t("0:0"), TimeOfDay::MIDNIGHT);

        for bad in ["24:00", "12:60", "12", ":30", "12:", "a:b", "123:00", "-1:00"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn formats_24h_and_12h() {
        assert_eq!(t("7:5").to_string(), "07:05");
        assert_eq!(t("00:15").to_12h(), "12:15 AM");
        assert_eq!(t("11:59").to_12h(), "11:59 AM");
        assert_eq!(t("12:00").to_12h(), "12:00 PM");
        assert_eq!(t("22:30").to_12h(), "10:30 PM");
    }

    #[test]
    fn window_round_trips_through_json() {
        let w = QuietWindow {
            enabled: true,
            start: t("22:00"),
            end: t("6:30"),
        };
        let json = serde_json::to_value(w).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"enabled": true, "start": "22:00", "end": "06:30"})
        );
        let back: QuietWindow = serde_json::from_value(json).unwrap();
        assert_eq!(back, w);

        let bad = serde_json::json!({"enabled": true, "start": "25:00", "end": "06:00"});
        assert!(serde_json::from_value::<QuietWindow>(bad).is_err());
    }
}
