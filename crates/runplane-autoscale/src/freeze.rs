//! Freeze windows: weekly time ranges during which a pool takes no new work.
//!
//! Weekdays are numbered 1 (Mon) to 7 (Sun). Bounds are "HH:MM" in UTC and
//! inclusive at minute granularity. A window whose end is earlier than its
//! start wraps past midnight; only the weekday of the current instant is
//! matched.

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, warn};

use runplane_state::{AgentPool, FreezeSchedule};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Result of evaluating a pool's freeze configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeStatus {
    Open,
    /// Inside a window, but a one-time unfreeze is active.
    Unfrozen,
    Frozen { reason: String },
}

impl FreezeStatus {
    pub fn is_frozen(&self) -> bool {
        matches!(self, FreezeStatus::Frozen { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            FreezeStatus::Frozen { reason } => Some(reason),
            FreezeStatus::Unfrozen => Some("One-time unfreeze active"),
            FreezeStatus::Open => None,
        }
    }
}

fn minutes_of_day(hhmm: &str) -> Option<u32> {
    let (hours, minutes) = hhmm.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

fn in_window(current: u32, from: u32, to: u32) -> bool {
    if from <= to {
        current >= from && current <= to
    } else {
        current >= from || current <= to
    }
}

fn format_weekdays(weekdays: &[u8]) -> String {
    weekdays
        .iter()
        .filter_map(|d| DAY_NAMES.get(usize::from(*d).checked_sub(1)?))
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whether `now` falls inside any of the schedules.
pub fn freeze_window(schedules: &[FreezeSchedule], now: DateTime<Utc>) -> FreezeStatus {
    let weekday = now.weekday().number_from_monday() as u8;
    let minute = now.hour() * 60 + now.minute();

    for schedule in schedules {
        if !schedule.weekdays.contains(&weekday) {
            continue;
        }
        let (Some(from), Some(to)) = (
            minutes_of_day(&schedule.from_time),
            minutes_of_day(&schedule.to_time),
        ) else {
            warn!(
                from = %schedule.from_time,
                to = %schedule.to_time,
                "ignoring freeze schedule with malformed bounds"
            );
            continue;
        };
        if in_window(minute, from, to) {
            return FreezeStatus::Frozen {
                reason: format!(
                    "Freeze window: {} - {} on {}",
                    schedule.from_time,
                    schedule.to_time,
                    format_weekdays(&schedule.weekdays)
                ),
            };
        }
    }
    FreezeStatus::Open
}

/// Like [`freeze_window`], but an unexpired one-time unfreeze (unix seconds)
/// overrides every schedule.
pub fn freeze_window_with_unfreeze(
    schedules: &[FreezeSchedule],
    unfreeze_until: Option<u64>,
    now: DateTime<Utc>,
) -> FreezeStatus {
    let status = freeze_window(schedules, now);
    match unfreeze_until {
        Some(until) if status.is_frozen() && now.timestamp() < until as i64 => {
            debug!(until, "one-time unfreeze overrides freeze window");
            FreezeStatus::Unfrozen
        }
        _ => status,
    }
}

/// Freeze status of a pool at `now`.
pub fn pool_freeze_status(pool: &AgentPool, now: DateTime<Utc>) -> FreezeStatus {
    freeze_window_with_unfreeze(&pool.freeze_schedules, pool.one_time_unfreeze_until, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(weekdays: &[u8], from: &str, to: &str) -> FreezeSchedule {
        FreezeSchedule {
            weekdays: weekdays.to_vec(),
            from_time: from.to_string(),
            to_time: to.to_string(),
        }
    }

    // 2026-10-16 is a Friday.
    fn friday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, hour, minute, 0).unwrap()
    }

    #[test]
    fn no_schedules_is_open() {
        assert_eq!(freeze_window(&[], friday(12, 0)), FreezeStatus::Open);
    }

    #[test]
    fn same_day_window_is_inclusive() {
        let schedules = [schedule(&[1, 5], "09:00", "17:00")];
        assert!(freeze_window(&schedules, friday(9, 0)).is_frozen());
        assert!(freeze_window(&schedules, friday(17, 0)).is_frozen());
        assert!(!freeze_window(&schedules, friday(17, 1)).is_frozen());
        assert!(!freeze_window(&schedules, friday(8, 59)).is_frozen());
    }

    #[test]
    fn reason_names_window_and_days() {
        let schedules = [schedule(&[1, 5], "09:00", "17:00")];
        let status = freeze_window(&schedules, friday(12, 0));
        assert_eq!(status.reason(), Some("Freeze window: 09:00 - 17:00 on Mon, Fri"));
    }

    #[test]
    fn cross_midnight_window() {
        let schedules = [schedule(&[5], "23:00", "02:00")];
        assert!(freeze_window(&schedules, friday(23, 30)).is_frozen());
        assert!(freeze_window(&schedules, friday(1, 15)).is_frozen());
        assert!(!freeze_window(&schedules, friday(12, 0)).is_frozen());
    }

    #[test]
    fn other_weekdays_are_open() {
        let schedules = [schedule(&[6, 7], "00:00", "23:59")];
        assert_eq!(freeze_window(&schedules, friday(12, 0)), FreezeStatus::Open);
    }

    #[test]
    fn malformed_bounds_are_ignored() {
        let schedules = [schedule(&[5], "nine", "17:00"), schedule(&[5], "25:00", "26:00")];
        assert_eq!(freeze_window(&schedules, friday(12, 0)), FreezeStatus::Open);
    }

    #[test]
    fn one_time_unfreeze_overrides_until_it_expires() {
        let schedules = [schedule(&[5], "00:00", "23:59")];
        let now = friday(12, 0);
        let later = now.timestamp() as u64 + 600;

        assert_eq!(
            freeze_window_with_unfreeze(&schedules, Some(later), now),
            FreezeStatus::Unfrozen
        );
        assert!(freeze_window_with_unfreeze(&schedules, Some(now.timestamp() as u64), now).is_frozen());
        assert!(freeze_window_with_unfreeze(&schedules, None, now).is_frozen());
    }
}
