//! Core configuration.
//!
//! Every option is optional in the serialized form and falls back to the
//! documented default, so an empty TOML table is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Upper bound on concurrently dispatched tasks.
    pub max_workers: usize,
    /// Dispatcher loop cadence in milliseconds.
    pub dispatcher_tick_ms: u64,
    /// Execution timeout applied when a task carries no override.
    pub default_task_timeout_s: u64,
    /// Response window for messages that do not set their own.
    pub default_message_response_timeout_s: u64,
    /// IANA zone used for blackout checks when a task names none.
    pub blackout_check_tz: String,
    /// Dead-letter retention before pruning, in hours.
    pub dead_letter_retention_h: u64,
    /// Retention window for terminal tasks, in hours.
    pub terminal_task_retention_h: u64,
    /// Every Nth dispatcher tick considers a low-priority-first scan.
    pub antistarvation_scan_every_n_ticks: u64,
    /// How long the top queue must stay non-empty before the scan flips.
    pub antistarvation_window_s: u64,
    /// Worker inactivity before health degrades, in minutes.
    pub worker_degrade_after_min: u64,
    /// Worker inactivity before it is marked unhealthy and deactivated.
    pub worker_unhealthy_after_min: u64,
    /// Grace window after a CancelRequest before forcing cancellation.
    pub cancel_grace_s: u64,
    /// Maximum queue claims per dispatcher tick.
    pub dispatch_batch_per_tick: usize,
    /// Re-enqueue delay when resource gates fail, in seconds.
    pub resource_defer_s: u64,
    /// Re-enqueue delay when no capable worker exists, in seconds.
    pub no_worker_defer_s: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            dispatcher_tick_ms: 100,
            default_task_timeout_s: 300,
            default_message_response_timeout_s: 30,
            blackout_check_tz: "UTC".to_owned(),
            dead_letter_retention_h: 72,
            terminal_task_retention_h: 24,
            antistarvation_scan_every_n_ticks: 10,
            antistarvation_window_s: 60,
            worker_degrade_after_min: 5,
            worker_unhealthy_after_min: 10,
            cancel_grace_s: 30,
            dispatch_batch_per_tick: 10,
            resource_defer_s: 300,
            no_worker_defer_s: 5,
        }
    }
}

impl CoreConfig {
    /// Parse a TOML document; missing keys take defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn dispatcher_tick(&self) -> Duration {
        Duration::from_millis(self.dispatcher_tick_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_s)
    }

    pub fn default_message_response_timeout(&self) -> Duration {
        Duration::from_secs(self.default_message_response_timeout_s)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_s)
    }
}
