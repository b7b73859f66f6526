//! Schedule planner: next-run computation, blackout windows, and
//! history-driven adaptive scheduling.
//!
//! All calendar math happens in the schedule's configured IANA zone and is
//! converted back to UTC at the edges. Pure functions throughout; the
//! orchestrator feeds in `now` and the execution history.

pub mod adaptive;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use warden_store::models::{ScheduleConfig, ScheduleKind};

use crate::history::ExecutionRecord;

/// Parse an IANA zone name, falling back to the configured default and
/// finally UTC.
pub fn resolve_timezone(name: &str, default_tz: &str) -> Tz {
    if let Ok(tz) = name.parse::<Tz>() {
        return tz;
    }
    warn!(zone = name, "unknown time zone, using default");
    default_tz.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}

/// Convert a zone-local naive timestamp to UTC.
///
/// DST gaps make some local times nonexistent and some ambiguous; the
/// earliest valid interpretation is used, and `None` means the local time
/// does not exist at all.
fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// True when `instant` falls inside any of the schedule's blackout windows,
/// evaluated in the schedule's zone.
pub fn in_blackout(config: &ScheduleConfig, instant: DateTime<Utc>, default_tz: &str) -> bool {
    if config.blackout_windows.is_empty() {
        return false;
    }
    let tz = resolve_timezone(&config.timezone, default_tz);
    let local_time = instant.with_timezone(&tz).time();
    config
        .blackout_windows
        .iter()
        .any(|w| w.contains(local_time))
}

/// First instant at or after `instant` that is outside every blackout
/// window. Returns `instant` unchanged when it is already clear.
pub fn next_blackout_exit(
    config: &ScheduleConfig,
    instant: DateTime<Utc>,
    default_tz: &str,
) -> DateTime<Utc> {
    let tz = resolve_timezone(&config.timezone, default_tz);
    let mut candidate = instant;

    // Overlapping windows can chain; bound the walk defensively.
    for _ in 0..8 {
        let local = candidate.with_timezone(&tz);
        let time = local.time();
        let Some(window) = config.blackout_windows.iter().find(|w| w.contains(time)) else {
            return candidate;
        };

        // The exit is one second past the window's end, on the day the end
        // lands on. For a midnight-crossing window entered in its evening
        // half, that end is tomorrow.
        let end_date = if window.start > window.end && time >= window.start {
            local.date_naive() + Duration::days(1)
        } else {
            local.date_naive()
        };
        let exit_naive = end_date.and_time(window.end) + Duration::seconds(1);
        candidate = match local_to_utc(tz, exit_naive) {
            Some(utc) => utc,
            // Nonexistent local time (DST gap): nudge an hour forward.
            None => candidate + Duration::hours(1),
        };
    }
    candidate
}

/// Compute the next run time for a recurring schedule.
///
/// `history` feeds the adaptive kind; every other kind ignores it.
pub fn next_run(
    config: &ScheduleConfig,
    now: DateTime<Utc>,
    history: &[ExecutionRecord],
    default_tz: &str,
) -> DateTime<Utc> {
    match config.kind {
        ScheduleKind::Continuous => now + Duration::seconds(30),
        ScheduleKind::Interval => {
            let minutes = config.interval_minutes.unwrap_or(60);
            now + Duration::minutes(i64::from(minutes))
        }
        ScheduleKind::Daily => next_daily(config, now, default_tz),
        ScheduleKind::Weekly => next_weekly(config, now, default_tz),
        ScheduleKind::Monthly => next_monthly(config, now, default_tz),
        ScheduleKind::Adaptive => adaptive::next_adaptive_run(history, now),
        // Custom schedules are driven externally; fall back to an hourly
        // re-check.
        ScheduleKind::Custom => now + Duration::hours(1),
    }
}

fn configured_times(config: &ScheduleConfig) -> Vec<NaiveTime> {
    if config.specific_times.is_empty() {
        vec![NaiveTime::MIN]
    } else {
        config.specific_times.clone()
    }
}

fn next_daily(config: &ScheduleConfig, now: DateTime<Utc>, default_tz: &str) -> DateTime<Utc> {
    let tz = resolve_timezone(&config.timezone, default_tz);
    let local_now = now.with_timezone(&tz);

    let mut candidates = Vec::new();
    for time in configured_times(config) {
        let mut date = local_now.date_naive();
        if time <= local_now.time() {
            date += Duration::days(1);
        }
        if config.blackout_windows.iter().any(|w| w.contains(time)) {
            continue;
        }
        if let Some(utc) = local_to_utc(tz, date.and_time(time)) {
            candidates.push(utc);
        }
    }
    candidates
        .into_iter()
        .min()
        .unwrap_or(now + Duration::days(1))
}

fn next_weekly(config: &ScheduleConfig, now: DateTime<Utc>, default_tz: &str) -> DateTime<Utc> {
    let tz = resolve_timezone(&config.timezone, default_tz);
    let local_now = now.with_timezone(&tz);
    let times = configured_times(config);
    let days = if config.days_of_week.is_empty() {
        vec![chrono::Weekday::Mon]
    } else {
        config.days_of_week.clone()
    };

    let mut candidates = Vec::new();
    for day in days {
        let today = local_now.weekday().num_days_from_monday() as i64;
        let target = day.num_days_from_monday() as i64;
        let mut ahead = (target - today).rem_euclid(7);
        // Same-day slots already past move to next week.
        if ahead == 0 && times.iter().all(|t| *t <= local_now.time()) {
            ahead = 7;
        }
        let date = local_now.date_naive() + Duration::days(ahead);
        for time in &times {
            if ahead == 0 && *time <= local_now.time() {
                continue;
            }
            if config.blackout_windows.iter().any(|w| w.contains(*time)) {
                continue;
            }
            if let Some(utc) = local_to_utc(tz, date.and_time(*time)) {
                candidates.push(utc);
            }
        }
    }
    candidates
        .into_iter()
        .min()
        .unwrap_or(now + Duration::weeks(1))
}

fn next_monthly(config: &ScheduleConfig, now: DateTime<Utc>, default_tz: &str) -> DateTime<Utc> {
    let tz = resolve_timezone(&config.timezone, default_tz);
    let local_now = now.with_timezone(&tz);
    let time = configured_times(config)[0];

    let next_date = local_now
        .date_naive()
        .checked_add_months(Months::new(1))
        .unwrap_or(local_now.date_naive() + Duration::days(30));
    local_to_utc(tz, next_date.and_time(time)).unwrap_or(now + Duration::days(30))
}
