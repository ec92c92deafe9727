//! Wait-time arithmetic for the frame source.
//!
//! All timestamps are microseconds on the frame source's monotonic clock. The
//! [`Pacer`] never sleeps itself; it tells the caller how long to wait and is
//! told what happened afterwards.

/// Added to a constant-rate wait when a frame arrived during the previous
/// processing slot.
pub const SAFETY_MARGIN_US: i64 = 3_000;
/// Lower bound of any computed wait.
pub const MIN_WAIT_US: i64 = 10_000;
/// A push wakes the consumer once it has been idle this close to one interval.
pub const NOTIFY_SLACK_US: i64 = 1_000;
pub const DEFAULT_START_FPS: u32 = 60;
/// Consecutive render-paced timeouts before waits widen to `1/min_fps`.
pub const STALL_TIMEOUTS: u32 = 30;
pub const RENDER_POLL_STEPS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Fixed cadence at the nominal frame rate.
    Constant { latency_optimization: bool },
    /// Cadence follows frame arrival, bounded by a minimum rate.
    RenderPaced { min_fps: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Notified,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPlan {
    pub timeout_us: i64,
    /// Number of sub-waits the timeout is split into.
    pub steps: u32,
}

#[derive(Debug, Clone)]
pub struct Pacer {
    mode: PacingMode,
    fps: u32,
    interval_us: i64,
    last_consumed: i64,
    last_produced: i64,
    /// Production time of the frame most recently handed to the consumer.
    last_consumed_produced: i64,
    leftover: i64,
    timeout_count: u32,
    warmup_remaining: u32,
    /// The last planned wait belonged to the warm-up phase.
    warming: bool,
}

fn interval_for(fps: u32) -> i64 {
    let fps = if fps == 0 { DEFAULT_START_FPS } else { fps };
    1_000_000 / fps as i64
}

impl Pacer {
    pub fn new(mode: PacingMode, fps: u32, now: i64) -> Self {
        let start_fps = if fps == 0 { DEFAULT_START_FPS } else { fps };
        Self {
            mode,
            fps,
            interval_us: interval_for(fps),
            last_consumed: now,
            last_produced: now,
            last_consumed_produced: now,
            leftover: 0,
            timeout_count: 0,
            warmup_remaining: start_fps * 4,
            warming: false,
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    pub fn interval_us(&self) -> i64 {
        self.interval_us
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    pub fn set_frame_rate(&mut self, fps: u32) {
        self.fps = fps;
        self.interval_us = interval_for(fps);
        self.leftover = self.leftover.min(self.interval_us);
    }

    /// Longest constant-rate wait for the current interval.
    pub fn max_wait_us(&self) -> i64 {
        (self.interval_us + SAFETY_MARGIN_US).max(MIN_WAIT_US)
    }

    /// Records a push at `now` and reports whether the consumer should be woken.
    pub fn on_push(&mut self, now: i64) -> bool {
        let idle = now - self.last_consumed_produced;
        let previous = self.last_produced - self.last_consumed;
        self.last_produced = now;
        match self.mode {
            PacingMode::Constant {
                latency_optimization: true,
            } => {
                idle >= self.interval_us - NOTIFY_SLACK_US
                    && !(previous > 0 && previous < SAFETY_MARGIN_US)
            }
            PacingMode::Constant {
                latency_optimization: false,
            } => false,
            PacingMode::RenderPaced { .. } => true,
        }
    }

    /// How long the consumer should wait at `now` before taking a frame.
    pub fn plan(&mut self, now: i64) -> WaitPlan {
        match self.mode {
            PacingMode::Constant {
                latency_optimization,
            } => WaitPlan {
                timeout_us: self.constant_wait(now, latency_optimization),
                steps: 1,
            },
            PacingMode::RenderPaced { min_fps } => WaitPlan {
                timeout_us: self.render_wait(min_fps),
                steps: RENDER_POLL_STEPS,
            },
        }
    }

    fn constant_wait(&self, now: i64, latency_optimization: bool) -> i64 {
        let interval = self.interval_us;
        let raw = if latency_optimization {
            let elapsed = (now - self.last_consumed).max(0);
            let mut wait = interval - elapsed % interval + self.leftover;
            if self.last_consumed <= self.last_produced {
                wait += SAFETY_MARGIN_US;
            }
            wait
        } else {
            self.last_consumed + interval - now
        };
        raw.clamp(MIN_WAIT_US, self.max_wait_us())
    }

    fn render_wait(&mut self, min_fps: u32) -> i64 {
        self.warming = self.warmup_remaining > 0;
        let stalled_fps = if self.warming {
            self.warmup_remaining -= 1;
            if self.fps == 0 { DEFAULT_START_FPS } else { self.fps }
        } else {
            min_fps
        };
        if self.timeout_count < STALL_TIMEOUTS || stalled_fps == 0 {
            self.interval_us * 11 / 10
        } else {
            1_000_000 / stalled_fps as i64
        }
    }

    /// Updates carried-over state after the consumer woke at `now`.
    pub fn on_wake(&mut self, now: i64, wake: Wake) {
        match self.mode {
            PacingMode::Constant { .. } => {
                self.leftover = match wake {
                    Wake::TimedOut => 0,
                    Wake::Notified => {
                        let remaining =
                            self.interval_us + self.leftover - (now - self.last_consumed);
                        if remaining > 0 && remaining < self.interval_us {
                            remaining
                        } else {
                            0
                        }
                    }
                };
            }
            PacingMode::RenderPaced { .. } => match wake {
                Wake::TimedOut => {
                    self.last_produced = now;
                    self.timeout_count = self.timeout_count.saturating_add(1);
                }
                // warm-up keeps counting timeouts across notifies
                Wake::Notified if !self.warming => self.timeout_count = 0,
                Wake::Notified => {}
            },
        }
    }

    /// Records that a frame was handed to the consumer at `now`.
    pub fn on_consumed(&mut self, now: i64) {
        self.last_consumed = now;
        self.last_consumed_produced = self.last_produced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSTANT: PacingMode = PacingMode::Constant {
        latency_optimization: true,
    };

    #[test]
    fn constant_wait_stays_within_floor_and_interval_plus_margin() {
        for fps in [1u32, 15, 24, 30, 60, 90, 120, 144, 240] {
            let mut pacer = Pacer::new(CONSTANT, fps, 0);
            let max = pacer.max_wait_us();
            let mut now = 0i64;
            for step in 0..500i64 {
                if step % 3 != 0 {
                    pacer.on_push(now + step * 7);
                }
                let plan = pacer.plan(now);
                assert!(plan.timeout_us >= MIN_WAIT_US, "fps {} wait {}", fps, plan.timeout_us);
                assert!(plan.timeout_us <= max, "fps {} wait {}", fps, plan.timeout_us);
                let woke_at = now + plan.timeout_us / (1 + step % 4);
                let wake = if step % 4 == 0 { Wake::TimedOut } else { Wake::Notified };
                pacer.on_wake(woke_at, wake);
                pacer.on_consumed(woke_at);
                now = woke_at + (step * 1_337) % 40_000;
            }
        }
    }

    #[test]
    fn late_consumer_is_clamped_to_floor() {
        let mut pacer = Pacer::new(
            PacingMode::Constant {
                latency_optimization: false,
            },
            30,
            0,
        );
        assert_eq!(pacer.plan(10_000_000).timeout_us, MIN_WAIT_US);
        assert_eq!(pacer.plan(1_000).timeout_us, 32_333);
    }

    #[test]
    fn leftover_is_capped_below_one_interval() {
        let mut pacer = Pacer::new(CONSTANT, 30, 0);
        pacer.on_wake(1_000, Wake::Notified);
        assert!(pacer.leftover > 0 && pacer.leftover < pacer.interval_us());
        pacer.on_wake(1_000_000, Wake::Notified);
        assert_eq!(pacer.leftover, 0);
        pacer.on_wake(2_000, Wake::TimedOut);
        assert_eq!(pacer.leftover, 0);
    }

    #[test]
    fn latency_mode_notifies_idle_consumer_only() {
        let mut pacer = Pacer::new(CONSTANT, 30, 0);
        pacer.on_consumed(0);
        assert!(!pacer.on_push(10_000));
        pacer.on_consumed(40_000);
        // previous push was produced at 10ms, 40ms of idle time has passed
        assert!(pacer.on_push(50_000));

        let mut quiet = Pacer::new(
            PacingMode::Constant {
                latency_optimization: false,
            },
            30,
            0,
        );
        assert!(!quiet.on_push(1_000_000));
    }

    #[test]
    fn render_mode_warms_up_then_widens_after_stall() {
        let mut pacer = Pacer::new(PacingMode::RenderPaced { min_fps: 5 }, 30, 0);
        for i in 0..STALL_TIMEOUTS {
            let plan = pacer.plan(0);
            assert_eq!(plan.timeout_us, 36_666);
            assert_eq!(plan.steps, RENDER_POLL_STEPS);
            pacer.on_wake(i as i64, Wake::TimedOut);
        }
        // stalled warm-up falls back to the start rate
        assert_eq!(pacer.plan(0).timeout_us, 33_333);
        pacer.on_wake(0, Wake::Notified);
        assert_eq!(pacer.timeout_count(), STALL_TIMEOUTS);
        for _ in 0..(120 - STALL_TIMEOUTS - 1) {
            assert_eq!(pacer.plan(0).timeout_us, 33_333);
        }

        assert_eq!(pacer.plan(0).timeout_us, 200_000);
        pacer.on_wake(0, Wake::Notified);
        assert_eq!(pacer.timeout_count(), 0);
        assert_eq!(pacer.plan(0).timeout_us, 36_666);
        assert!(pacer.on_push(1));
    }
}
