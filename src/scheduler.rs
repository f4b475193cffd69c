//! Periodic jobs: the check-in cron and the primary-site recovery probe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tokio::task::JoinHandle;

use crate::state::AppState;

/// Compute the next local fire time strictly after `now` for an
/// hours-of-day list x minute schedule.
#[must_use]
pub fn next_fire_after(now: DateTime<Local>, hours: &[u32], minute: u32) -> Option<DateTime<Local>> {
    let mut hours: Vec<u32> = hours.iter().copied().filter(|&h| h < 24).collect();
    if hours.is_empty() || minute > 59 {
        return None;
    }
    hours.sort_unstable();
    hours.dedup();

    for day_offset in 0..=2u64 {
        let date = now.date_naive() + chrono::Days::new(day_offset);
        for &hour in &hours {
            let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                continue;
            };
            // Skip wall-clock times that do not exist locally (DST gaps).
            let Some(candidate) = Local.from_local_datetime(&naive).earliest() else {
                continue;
            };
            if candidate > now {
                return Some(candidate);
            }
        }
    }
    None
}

/// Spawn the check-in cron job.
pub fn spawn_checkin_job(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let hours = state.config.checkin.cron_hours.clone();
        let minute = state.config.checkin.cron_minute;
        tracing::info!(?hours, minute, "check-in scheduler started");
        loop {
            let now = Local::now();
            let Some(next) = next_fire_after(now, &hours, minute) else {
                tracing::error!("check-in schedule yields no next fire time, job exiting");
                return;
            };
            state.checkin.note_next_run(next.timestamp() as u64);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            tracing::debug!(
                next = %next.format("%Y-%m-%d %H:%M:%S"),
                wait_secs = wait.as_secs(),
                "check-in sleeping until next fire"
            );
            tokio::time::sleep(wait).await;
            tracing::info!("scheduled check-in started");
            crate::checkin::run_for_all_accounts(&state).await;
        }
    })
}

/// Spawn the fixed-interval primary-site recovery probe. Only probes while
/// a mirror is serving; a healthy probe switches straight back to the
/// primary.
pub fn spawn_primary_probe_job(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.config.primary_check.interval_minutes * 60);
        tracing::info!(
            interval_minutes = state.config.primary_check.interval_minutes,
            "primary site health check enabled"
        );
        loop {
            tokio::time::sleep(interval).await;
            if state.sites.current_index() == 0 {
                tracing::debug!("already on primary, skipping probe");
                continue;
            }
            let (_, current) = state.sites.current();
            tracing::info!(current = %current.name, "probing primary site health");
            let cookies = state.waf.peek().await;
            if state.sites.probe_primary(&state.transport, &cookies).await {
                state.sites.force_primary();
                tracing::info!("primary site healthy again, switched back");
            } else {
                tracing::info!("primary site still unavailable");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .earliest()
            .unwrap()
    }

    #[test]
    fn test_next_fire_same_day() {
        let now = local(2025, 3, 10, 9, 0);
        let next = next_fire_after(now, &[2, 8, 14, 20], 30).unwrap();
        assert_eq!((next.hour(), next.minute()), (14, 30));
        assert_eq!(next.day(), 10);
    }

    #[test]
    fn test_next_fire_rolls_to_next_day() {
        let now = local(2025, 3, 10, 21, 0);
        let next = next_fire_after(now, &[2, 8, 14, 20], 30).unwrap();
        assert_eq!((next.hour(), next.minute()), (2, 30));
        assert_eq!(next.day(), 11);
    }

    #[test]
    fn test_next_fire_is_strictly_after_now() {
        let now = local(2025, 3, 10, 14, 30);
        let next = next_fire_after(now, &[14], 30).unwrap();
        assert_eq!(next.day(), 11);
    }

    #[test]
    fn test_unsorted_and_duplicate_hours() {
        let now = local(2025, 3, 10, 3, 0);
        let next = next_fire_after(now, &[20, 8, 8, 2], 30).unwrap();
        assert_eq!((next.hour(), next.minute()), (8, 30));
    }

    #[test]
    fn test_invalid_schedule_yields_none() {
        let now = local(2025, 3, 10, 3, 0);
        assert!(next_fire_after(now, &[], 30).is_none());
        assert!(next_fire_after(now, &[25], 30).is_none());
        assert!(next_fire_after(now, &[8], 60).is_none());
    }
}
