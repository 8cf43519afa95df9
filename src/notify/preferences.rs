//! Notification preferences, parsed or defaulted at the boundary.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How often digest-style notifications go out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
  #[default]
  Daily,
  Instant,
  Hourly,
  Weekly,
}

impl Frequency {
  fn parse(s: &str) -> Option<Self> {
    match s {
      "daily" => Some(Self::Daily),
      "instant" => Some(Self::Instant),
      "hourly" => Some(Self::Hourly),
      "weekly" => Some(Self::Weekly),
      _ => None,
    }
  }
}

/// Wall-clock time of day, written as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime {
  hour: u8,
  minute: u8,
}

impl ClockTime {
  pub fn new(hour: u8, minute: u8) -> Option<Self> {
    (hour < 24 && minute < 60).then_some(Self { hour, minute })
  }

  pub fn parse(s: &str) -> Option<Self> {
    let (h, m) = s.split_once(':')?;
    let two_digits = |p: &str| p.len() == 2 && p.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(h) || !two_digits(m) {
      return None;
    }
    Self::new(h.parse().ok()?, m.parse().ok()?)
  }

  fn minutes(&self) -> u32 {
    self.hour as u32 * 60 + self.minute as u32
  }
}

impl fmt::Display for ClockTime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:02}:{:02}", self.hour, self.minute)
  }
}

impl TryFrom<String> for ClockTime {
  type Error = String;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    Self::parse(&s).ok_or_else(|| format!("invalid time of day: {}", s))
  }
}

impl From<ClockTime> for String {
  fn from(t: ClockTime) -> Self {
    t.to_string()
  }
}

/// Window during which notifications are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
  pub enabled: bool,
  pub start: ClockTime,
  pub end: ClockTime,
}

impl Default for QuietHours {
  fn default() -> Self {
    Self {
      enabled: false,
      start: ClockTime { hour: 22, minute: 0 },
      end: ClockTime { hour: 8, minute: 0 },
    }
  }
}

impl QuietHours {
  /// Whether `time` falls inside the window. A window whose end is before its
  /// start wraps past midnight; `start == end` is an empty window.
  pub fn contains(&self, time: NaiveTime) -> bool {
    if !self.enabled {
      return false;
    }
    let now = time.hour() * 60 + time.minute();
    let (start, end) = (self.start.minutes(), self.end.minutes());
    if start <= end {
      start <= now && now < end
    } else {
      now >= start || now < end
    }
  }

  fn merge(value: &Value) -> Self {
    let mut quiet = Self::default();
    let Some(obj) = value.as_object() else {
      return quiet;
    };
    if let Some(enabled) = obj.get("enabled").and_then(Value::as_bool) {
      quiet.enabled = enabled;
    }
    if let Some(start) = obj.get("start").and_then(Value::as_str).and_then(ClockTime::parse) {
      quiet.start = start;
    }
    if let Some(end) = obj.get("end").and_then(Value::as_str).and_then(ClockTime::parse) {
      quiet.end = end;
    }
    quiet
  }
}

/// Upper bound accepted for `maxDailyNotifications`.
const MAX_DAILY_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
  pub daily_horoscope: bool,
  pub transit_alerts: bool,
  pub frequency_reminders: bool,
  pub app_updates: bool,
  pub frequency: Frequency,
  pub quiet_hours: QuietHours,
  pub max_daily_notifications: u32,
}

impl Default for NotificationPreferences {
  fn default() -> Self {
    Self {
      daily_horoscope: true,
      transit_alerts: true,
      frequency_reminders: false,
      app_updates: true,
      frequency: Frequency::Daily,
      quiet_hours: QuietHours::default(),
      max_daily_notifications: 5,
    }
  }
}

impl NotificationPreferences {
  /// Build preferences from untrusted input.
  ///
  /// Starts from the defaults and takes every field that is individually well
  /// typed; anything else (including a non-object value) keeps its default.
  pub fn from_value(value: Option<&Value>) -> Self {
    let mut prefs = Self::default();
    let Some(obj) = value.and_then(Value::as_object) else {
      return prefs;
    };

    let flag = |name: &str, slot: &mut bool| {
      if let Some(v) = obj.get(name).and_then(Value::as_bool) {
        *slot = v;
      }
    };
    flag("dailyHoroscope", &mut prefs.daily_horoscope);
    flag("transitAlerts", &mut prefs.transit_alerts);
    flag("frequencyReminders", &mut prefs.frequency_reminders);
    flag("appUpdates", &mut prefs.app_updates);

    if let Some(f) = obj.get("frequency").and_then(Value::as_str).and_then(Frequency::parse) {
      prefs.frequency = f;
    }
    if let Some(q) = obj.get("quietHours") {
      prefs.quiet_hours = QuietHours::merge(q);
    }
    if let Some(n) = obj
      .get("maxDailyNotifications")
      .and_then(Value::as_u64)
      .filter(|n| *n <= MAX_DAILY_LIMIT)
    {
      prefs.max_daily_notifications = n as u32;
    }

    prefs
  }

  /// Whether `value` is a complete, well-typed preference object.
  pub fn is_valid(value: &Value) -> bool {
    serde_json::from_value::<Self>(value.clone())
      .map(|p| p.max_daily_notifications as u64 <= MAX_DAILY_LIMIT)
      .unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn at(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
  }

  #[test]
  fn test_invalid_shape_gives_defaults() {
    let prefs = NotificationPreferences::from_value(Some(&json!({"not": "valid"})));
    assert_eq!(prefs, NotificationPreferences::default());
    assert_eq!(NotificationPreferences::from_value(Some(&json!(42))), NotificationPreferences::default());
    assert_eq!(NotificationPreferences::from_value(None), NotificationPreferences::default());
  }

  #[test]
  fn test_partial_merge_keeps_valid_fields() {
    let prefs = NotificationPreferences::from_value(Some(&json!({
      "dailyHoroscope": false,
      "transitAlerts": "yes",
      "frequency": "weekly",
      "quietHours": {"enabled": true, "start": "23:30", "end": "7am"},
      "maxDailyNotifications": -3
    })));

    assert!(!prefs.daily_horoscope);
    assert!(prefs.transit_alerts);
    assert_eq!(prefs.frequency, Frequency::Weekly);
    assert!(prefs.quiet_hours.enabled);
    assert_eq!(prefs.quiet_hours.start.to_string(), "23:30");
    assert_eq!(prefs.quiet_hours.end.to_string(), "08:00");
    assert_eq!(prefs.max_daily_notifications, 5);
  }

  #[test]
  fn test_serialized_defaults_are_valid() {
    let value = serde_json::to_value(NotificationPreferences::default()).unwrap();
    assert_eq!(value["quietHours"]["start"], "22:00");
    assert!(NotificationPreferences::is_valid(&value));
    assert!(!NotificationPreferences::is_valid(&json!({"not": "valid"})));
  }

  #[test]
  fn test_clock_time_parse() {
    assert_eq!(ClockTime::parse("09:05"), ClockTime::new(9, 5));
    assert!(ClockTime::parse("24:00").is_none());
    assert!(ClockTime::parse("9:05").is_none());
    assert!(ClockTime::parse("noon").is_none());
    assert!(ClockTime::parse("+9:05").is_none());
    assert!(ClockTime::parse("09:+5").is_none());
  }

  #[test]
  fn test_quiet_hours_wraps_midnight() {
    let quiet = QuietHours {
      enabled: true,
      ..QuietHours::default()
    };
    assert!(quiet.contains(at(23, 0)));
    assert!(quiet.contains(at(2, 30)));
    assert!(!quiet.contains(at(8, 0)));
    assert!(!quiet.contains(at(12, 0)));

    let daytime = QuietHours {
      enabled: true,
      start: ClockTime::new(13, 0).unwrap(),
      end: ClockTime::new(14, 0).unwrap(),
    };
    assert!(daytime.contains(at(13, 30)));
    assert!(!daytime.contains(at(14, 0)));

    assert!(!QuietHours::default().contains(at(23, 0)));
  }
}
