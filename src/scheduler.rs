//! Weekly background sync.
//!
//! A single task sleeps until the configured weekday and time (UTC), runs
//! the full pipeline, and goes back to sleep. Invalid schedule settings
//! disable the task entirely rather than guessing a replacement slot.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sync::{PhaseOutcome, SyncService, SyncSummary, WEEKLY_PHASES};

/// A weekly time slot, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
}

impl Schedule {
    /// Builds the weekly slot from configuration values.
    pub fn from_settings(day: &str, hour: u32, minute: u32) -> Option<Self> {
        let weekday = match day.parse::<Weekday>() {
            Ok(weekday) => weekday,
            Err(_) => {
                error!(day, "Invalid sync day, scheduler disabled");
                return None;
            }
        };
        if hour > 23 || minute > 59 {
            error!(hour, minute, "Sync time out of range, scheduler disabled");
            return None;
        }
        Some(Schedule {
            weekday,
            hour,
            minute,
        })
    }

    /// The next occurrence of the slot strictly after the given instant.
    /// A run that lands exactly on the slot rolls over to the next week.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut date = now.date_naive();
        for _ in 0..8 {
            if date.weekday() == self.weekday {
                let at = date.and_hms_opt(self.hour, self.minute, 0)?.and_utc();
                if at > now {
                    return Some(at);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Starts the scheduler loop on the current runtime.
pub fn spawn(sync: Arc<SyncService>, schedule: Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            day = %schedule.weekday,
            hour = schedule.hour,
            minute = schedule.minute,
            "Weekly sync scheduled"
        );
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_run_after(now) else {
                warn!("No runnable slot found, stopping scheduler");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(at = %next, "Next scheduled sync");
            tokio::time::sleep(wait).await;

            info!("Starting scheduled sync");
            match sync.run(WEEKLY_PHASES).await {
                Ok(summary) => log_summary(&summary),
                Err(error) => error!(error = %error, "Scheduled sync failed"),
            }
        }
    })
}

fn log_summary(summary: &SyncSummary) {
    log_phase("paradas", &summary.paradas);
    log_phase("lineas", &summary.lineas);
    log_phase("relaciones", &summary.relaciones);
    log_phase("direcciones", &summary.direcciones);
}

fn log_phase<T: Debug>(name: &str, outcome: &Option<PhaseOutcome<T>>) {
    match outcome {
        Some(PhaseOutcome::Completed(value)) => {
            info!(phase = name, result = ?value, "Sync phase completed");
        }
        Some(PhaseOutcome::Failed(error)) => {
            warn!(phase = name, error = %error, "Sync phase failed");
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sunday_four_am() -> Schedule {
        Schedule::from_settings("sun", 4, 0).unwrap()
    }

    #[test]
    fn finds_the_slot_later_this_week() {
        let now = Utc.with_ymd_and_hms(2026, 8, 19, 12, 0, 0).unwrap();
        let next = sunday_four_am().next_run_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 23, 4, 0, 0).unwrap());
    }

    #[test]
    fn finds_the_slot_later_today() {
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 3, 0, 0).unwrap();
        let next = sunday_four_am().next_run_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 23, 4, 0, 0).unwrap());
    }

    #[test]
    fn a_passed_slot_rolls_to_next_week() {
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 5, 0, 0).unwrap();
        let next = sunday_four_am().next_run_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 30, 4, 0, 0).unwrap());
    }

    #[test]
    fn the_exact_slot_instant_rolls_over() {
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 4, 0, 0).unwrap();
        let next = sunday_four_am().next_run_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 30, 4, 0, 0).unwrap());
    }

    #[test]
    fn invalid_settings_disable_the_schedule() {
        assert_eq!(Schedule::from_settings("someday", 4, 0), None);
        assert_eq!(Schedule::from_settings("sun", 24, 0), None);
        assert_eq!(Schedule::from_settings("sun", 4, 60), None);
        assert!(Schedule::from_settings("Mon", 0, 0).is_some());
    }
}
