//! Backoff policy for device-level encode/decode failures.
//!
//! Errors closer together than the burst window form one burst. A burst that
//! grows past `max_count` errors or `max_duration_ms` is fatal; anything short
//! of that restarts the affected filter and encoder stages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwErrorLimits {
    pub burst_window_ms: i64,
    pub max_duration_ms: i64,
    pub max_count: u32,
}

impl Default for HwErrorLimits {
    fn default() -> Self {
        Self {
            burst_window_ms: 5_000,
            max_duration_ms: 300,
            max_count: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwErrorAction {
    /// Tear down filter and encoder; they are recreated on the next cycle.
    RestartStages,
    /// The burst exceeded its limits.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct HwErrorPolicy {
    limits: HwErrorLimits,
    last_error_ms: Option<i64>,
    count: u32,
    duration_ms: i64,
}

impl HwErrorPolicy {
    pub fn new(limits: HwErrorLimits) -> Self {
        Self {
            limits,
            last_error_ms: None,
            count: 0,
            duration_ms: 0,
        }
    }

    /// Records a hardware error observed at `now_ms`.
    pub fn record(&mut self, now_ms: i64) -> HwErrorAction {
        match self.last_error_ms {
            Some(prev) if now_ms - prev < self.limits.burst_window_ms => {
                self.count += 1;
                self.duration_ms += now_ms - prev;
            }
            _ => {
                self.count = 1;
                self.duration_ms = 0;
            }
        }
        self.last_error_ms = Some(now_ms);

        if self.count > self.limits.max_count || self.duration_ms > self.limits.max_duration_ms {
            log::error!(
                "hardware error burst over limit: count={} duration={}ms",
                self.count,
                self.duration_ms
            );
            HwErrorAction::Fatal
        } else {
            log::warn!(
                "hardware error: count={} duration={}ms, restarting encoder stages",
                self.count,
                self.duration_ms
            );
            HwErrorAction::RestartStages
        }
    }

    /// Errors in the current burst.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }
}
