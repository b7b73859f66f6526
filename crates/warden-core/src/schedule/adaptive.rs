//! History-driven scheduling: pick run times from past success patterns.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use rand::Rng;

use warden_store::models::{ScheduleConfig, ScheduleKind};

use crate::history::ExecutionRecord;

/// Minimum history before adaptive scheduling trusts the data.
const MIN_RUNS_FOR_ADAPTIVE: usize = 10;

/// Minimum history before the optimizer rewrites a schedule.
const MIN_RUNS_FOR_OPTIMIZE: usize = 20;

/// Next run for an adaptive schedule.
///
/// With fewer than ten recorded runs there is nothing to learn from, so the
/// task falls back to a four-hour interval. Otherwise the hour-of-day with
/// the most successful runs wins; the task is scheduled at that hour's next
/// occurrence with ±30 minutes of uniform jitter so that instances sharing
/// a config do not land on the same instant.
pub fn next_adaptive_run(history: &[ExecutionRecord], now: DateTime<Utc>) -> DateTime<Utc> {
    if history.len() < MIN_RUNS_FOR_ADAPTIVE {
        return now + Duration::hours(4);
    }

    let mut success_by_hour: HashMap<u32, usize> = HashMap::new();
    for record in history {
        if record.success {
            *success_by_hour.entry(record.started_at.hour()).or_default() += 1;
        }
    }

    let Some(best_hour) = success_by_hour
        .into_iter()
        // Deterministic tie-break on the earlier hour.
        .max_by_key(|(hour, count)| (*count, u32::MAX - *hour))
        .map(|(hour, _)| hour)
    else {
        // Nothing ever succeeded; push further out.
        return now + Duration::hours(6);
    };

    let today_at_best = now
        .date_naive()
        .and_hms_opt(best_hour, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now + Duration::hours(4));

    let mut next = if today_at_best <= now {
        today_at_best + Duration::days(1)
    } else {
        today_at_best
    };

    let jitter_minutes: i64 = rand::rng().random_range(-30..=30);
    next += Duration::minutes(jitter_minutes);
    next.max(now)
}

/// Hourly optimization pass: rewrite an adaptive schedule into a daily one
/// pinned to its three best-performing hours.
///
/// Hours are scored by success rate weighted toward faster runs. Returns
/// `None` when the history is too thin or the schedule is not adaptive.
pub fn optimize_schedule(
    config: &ScheduleConfig,
    history: &[ExecutionRecord],
) -> Option<ScheduleConfig> {
    if config.kind != ScheduleKind::Adaptive || history.len() < MIN_RUNS_FOR_OPTIMIZE {
        return None;
    }

    let mut outcomes_by_hour: HashMap<u32, Vec<&ExecutionRecord>> = HashMap::new();
    for record in history {
        outcomes_by_hour
            .entry(record.started_at.hour())
            .or_default()
            .push(record);
    }

    let mut scored: Vec<(u32, f64)> = outcomes_by_hour
        .into_iter()
        .map(|(hour, records)| {
            let successes = records.iter().filter(|r| r.success).count();
            let success_rate = successes as f64 / records.len() as f64;
            let avg_duration =
                records.iter().map(|r| r.duration_secs).sum::<f64>() / records.len() as f64;
            (hour, success_rate * (1.0 / (1.0 + avg_duration / 60.0)))
        })
        .collect();

    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut best_hours: Vec<u32> = scored.into_iter().take(3).map(|(hour, _)| hour).collect();
    best_hours.sort_unstable();

    Some(ScheduleConfig {
        kind: ScheduleKind::Daily,
        interval_minutes: None,
        specific_times: best_hours
            .into_iter()
            .filter_map(|h| NaiveTime::from_hms_opt(h, 0, 0))
            .collect(),
        days_of_week: Vec::new(),
        timezone: config.timezone.clone(),
        blackout_windows: config.blackout_windows.clone(),
        min_cpu_available: config.min_cpu_available,
        min_memory_available: config.min_memory_available,
        priority: config.priority,
        max_concurrent: config.max_concurrent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn record_at_hour(hour: u32, success: bool, duration: f64) -> ExecutionRecord {
        ExecutionRecord {
            task_id: Uuid::new_v4(),
            started_at: Utc.with_ymd_and_hms(2025, 3, 10, hour, 15, 0).single().unwrap(),
            duration_secs: duration,
            success,
            error: None,
            items_collected: 0,
            resource_usage: HashMap::new(),
        }
    }

    #[test]
    fn thin_history_falls_back_to_four_hours() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).single().unwrap();
        let history: Vec<ExecutionRecord> = (0..5).map(|_| record_at_hour(3, true, 10.0)).collect();
        assert_eq!(next_adaptive_run(&history, now), now + Duration::hours(4));
    }

    #[test]
    fn adaptive_targets_the_most_successful_hour() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).single().unwrap();
        let mut history = Vec::new();
        for _ in 0..8 {
            history.push(record_at_hour(3, true, 10.0));
        }
        for _ in 0..4 {
            history.push(record_at_hour(15, true, 10.0));
        }

        // Hour 3 already passed today, so the target is tomorrow 03:00
        // with at most 30 minutes of jitter either way.
        let next = next_adaptive_run(&history, now);
        let target = Utc.with_ymd_and_hms(2025, 3, 11, 3, 0, 0).single().unwrap();
        let offset = (next - target).num_minutes().abs();
        assert!(offset <= 30, "jitter offset {offset} exceeds half an hour");
    }

    #[test]
    fn optimizer_needs_twenty_runs() {
        let mut cfg = ScheduleConfig::custom();
        cfg.kind = ScheduleKind::Adaptive;
        let history: Vec<ExecutionRecord> =
            (0..10).map(|_| record_at_hour(3, true, 10.0)).collect();
        assert!(optimize_schedule(&cfg, &history).is_none());
    }

    #[test]
    fn optimizer_rewrites_to_daily_at_best_hours() {
        let mut cfg = ScheduleConfig::custom();
        cfg.kind = ScheduleKind::Adaptive;
        cfg.timezone = "Europe/Berlin".to_owned();

        let mut history = Vec::new();
        // Hour 2: perfect and fast. Hour 9: perfect but slow. Hour 14:
        // mixed. Hour 20: all failures.
        for _ in 0..6 {
            history.push(record_at_hour(2, true, 5.0));
        }
        for _ in 0..6 {
            history.push(record_at_hour(9, true, 300.0));
        }
        for _ in 0..6 {
            history.push(record_at_hour(14, true, 30.0));
            history.push(record_at_hour(14, false, 30.0));
        }
        for _ in 0..6 {
            history.push(record_at_hour(20, false, 30.0));
        }

        let optimized = optimize_schedule(&cfg, &history).expect("should optimize");
        assert_eq!(optimized.kind, ScheduleKind::Daily);
        assert_eq!(optimized.timezone, "Europe/Berlin");
        let hours: Vec<u32> = optimized.specific_times.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![2, 9, 14]);
    }

    #[test]
    fn optimizer_ignores_non_adaptive_schedules() {
        let cfg = ScheduleConfig::custom();
        let history: Vec<ExecutionRecord> =
            (0..30).map(|_| record_at_hour(3, true, 10.0)).collect();
        assert!(optimize_schedule(&cfg, &history).is_none());
    }
}
