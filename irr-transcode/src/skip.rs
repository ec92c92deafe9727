//! Skipped-frame accounting reported to the encoder's rate control.

/// Restart the measurement cycle after this long without encoding.
const RESTART_GAP_US: i64 = 3_000_000;
const CYCLE_US: i64 = 1_000_000;

/// Counts frames that should have been encoded at the nominal cadence but
/// were not, over one-second measurement cycles.
#[derive(Debug, Clone, Default)]
pub struct SkipFrameCounter {
    cycle_start: Option<i64>,
    encoded: i64,
    total_skipped: i64,
}

impl SkipFrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per encode cycle at `now_us`; returns the newly skipped
    /// frames since the previous call.
    pub fn update(&mut self, now_us: i64, frame_us: i64) -> u32 {
        if frame_us <= 0 {
            return 0;
        }
        let start = match self.cycle_start {
            Some(start) if now_us - start < RESTART_GAP_US => {
                self.encoded += 1;
                start
            }
            _ => {
                self.cycle_start = Some(now_us);
                self.encoded = 0;
                self.total_skipped = 0;
                now_us
            }
        };

        let delta = now_us - (start + self.encoded * frame_us);
        let skipped = if delta > 0 {
            (delta / frame_us - self.total_skipped).max(0)
        } else {
            0
        };
        self.total_skipped += skipped;

        if now_us - start >= CYCLE_US {
            self.cycle_start = Some(now_us);
            self.encoded = 0;
            self.total_skipped = 0;
        }
        skipped as u32
    }

    /// Skipped frames accumulated in the current cycle.
    pub fn total_skipped(&self) -> i64 {
        self.total_skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: i64 = 33_333;

    #[test]
    fn on_time_encoding_skips_nothing() {
        let mut counter = SkipFrameCounter::new();
        for i in 0..100 {
            assert_eq!(counter.update(i * FRAME, FRAME), 0);
        }
    }

    #[test]
    fn stall_reports_missing_frames_once() {
        let mut counter = SkipFrameCounter::new();
        assert_eq!(counter.update(0, FRAME), 0);
        assert_eq!(counter.update(FRAME, FRAME), 0);
        // four frame slots pass before the next encode
        assert_eq!(counter.update(6 * FRAME, FRAME), 4);
        assert_eq!(counter.update(7 * FRAME, FRAME), 0);
        assert_eq!(counter.total_skipped(), 4);
    }

    #[test]
    fn cycle_resets_after_one_second() {
        let mut counter = SkipFrameCounter::new();
        counter.update(0, FRAME);
        counter.update(500_000, FRAME);
        assert!(counter.total_skipped() > 0);
        counter.update(1_000_000, FRAME);
        counter.update(1_010_000, FRAME);
        assert_eq!(counter.total_skipped(), 0);
    }

    #[test]
    fn never_negative_when_encoding_runs_fast() {
        let mut counter = SkipFrameCounter::new();
        for i in 0..200 {
            counter.update(i * 1_000, FRAME);
            assert!(counter.total_skipped() >= 0);
        }
    }

    #[test]
    fn stall_right_after_cycle_end_is_counted() {
        let mut counter = SkipFrameCounter::new();
        for i in 0..=31 {
            assert_eq!(counter.update(i * FRAME, FRAME), 0);
        }
        // the update at 31 frames closed the first cycle
        let skipped = counter.update(31 * FRAME + 500_000, FRAME);
        assert_eq!(skipped, 14);
        assert_eq!(counter.total_skipped(), 14);
    }

    #[test]
    fn long_gap_restarts_cycle() {
        let mut counter = SkipFrameCounter::new();
        counter.update(0, FRAME);
        assert_eq!(counter.update(4_000_000, FRAME), 0);
        assert_eq!(counter.total_skipped(), 0);
    }
}
