//! Running statistics for the encode loop and latency probes.

/// Packets growing by more than this many bytes over their predecessor are logged.
pub const SIZE_CHANGE_THRESHOLD: usize = 5_000;

const FPS_WINDOW_US: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: u32,
    pub min_us: i64,
    pub avg_us: i64,
    pub max_us: i64,
}

/// Min/avg/max latency over every `period` samples.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    label: &'static str,
    period: u32,
    count: u32,
    min_us: i64,
    max_us: i64,
    total_us: i64,
}

impl LatencyStats {
    pub fn new(label: &'static str, period: u32) -> Self {
        Self {
            label,
            period: period.max(1),
            count: 0,
            min_us: i64::MAX,
            max_us: 0,
            total_us: 0,
        }
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    /// Adds a sample; returns the summary when a period completes.
    pub fn record(&mut self, latency_us: i64) -> Option<LatencySummary> {
        let latency_us = latency_us.max(0);
        self.count += 1;
        self.total_us += latency_us;
        self.min_us = self.min_us.min(latency_us);
        self.max_us = self.max_us.max(latency_us);
        if self.count < self.period {
            return None;
        }
        let summary = LatencySummary {
            samples: self.count,
            min_us: self.min_us,
            avg_us: self.total_us / self.count as i64,
            max_us: self.max_us,
        };
        log::info!(
            "{} latency over {} frames: min={}us avg={}us max={}us",
            self.label,
            summary.samples,
            summary.min_us,
            summary.avg_us,
            summary.max_us
        );
        *self = Self::new(self.label, self.period);
        Some(summary)
    }
}

#[derive(Debug, Clone)]
pub struct EncodeStats {
    total_frames: u64,
    window_start: Option<i64>,
    window_frames: u64,
    fps: f64,
    cycle_len: u32,
    cycle_frames: u32,
    cycle_bytes: u64,
    kbps: u64,
    target_bitrate: u64,
    last_packet_size: usize,
    size_jumps: u64,
}

impl EncodeStats {
    pub fn new(framerate: u32, target_bitrate: u64) -> Self {
        Self {
            total_frames: 0,
            window_start: None,
            window_frames: 0,
            fps: 0.0,
            cycle_len: framerate.max(1),
            cycle_frames: 0,
            cycle_bytes: 0,
            kbps: 0,
            target_bitrate,
            last_packet_size: 0,
            size_jumps: 0,
        }
    }

    /// Restarts the bitrate cycle, e.g. after a framerate change.
    pub fn reset_cycle(&mut self, framerate: u32) {
        self.cycle_len = framerate.max(1);
        self.cycle_frames = 0;
        self.cycle_bytes = 0;
    }

    pub fn set_target_bitrate(&mut self, bitrate: u64) {
        self.target_bitrate = bitrate;
    }

    /// Accounts one encoded packet written at `now_us`.
    pub fn record_packet(&mut self, now_us: i64, size: usize, track_bitrate: bool) {
        self.total_frames += 1;
        self.window_frames += 1;
        match self.window_start {
            None => {
                self.window_start = Some(now_us);
                self.window_frames = 0;
            }
            Some(start) if now_us - start >= FPS_WINDOW_US => {
                self.fps = self.window_frames as f64 * 1_000_000.0 / (now_us - start) as f64;
                log::info!("encoder frame={} fps={:.1}", self.total_frames, self.fps);
                self.window_start = Some(now_us);
                self.window_frames = 0;
            }
            Some(_) => {}
        }

        if track_bitrate {
            self.cycle_frames += 1;
            self.cycle_bytes += size as u64;
            if self.cycle_frames >= self.cycle_len {
                self.kbps = self.cycle_bytes * 8 / 1000;
                log::debug!(
                    "encoder bitrate={}kbps target={}kbps",
                    self.kbps,
                    self.target_bitrate / 1000
                );
                self.cycle_frames = 0;
                self.cycle_bytes = 0;
            }
        }

        if self.last_packet_size > 0 && size > self.last_packet_size + SIZE_CHANGE_THRESHOLD {
            self.size_jumps += 1;
            log::warn!(
                "encoded packet grew from {} to {} bytes",
                self.last_packet_size,
                size
            );
        }
        self.last_packet_size = size;
    }

    pub fn frames(&self) -> u64 {
        self.total_frames
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn kbps(&self) -> u64 {
        self.kbps
    }

    pub fn size_jumps(&self) -> u64 {
        self.size_jumps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_summary_per_period() {
        let mut stats = LatencyStats::new("ingress", 3);
        assert!(stats.record(100).is_none());
        assert!(stats.record(300).is_none());
        let summary = stats.record(200).unwrap();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.min_us, 100);
        assert_eq!(summary.avg_us, 200);
        assert_eq!(summary.max_us, 300);
        assert!(stats.record(50).is_none());
    }

    #[test]
    fn fps_over_one_second_window() {
        let mut stats = EncodeStats::new(30, 0);
        for i in 0..=30 {
            stats.record_packet(i * 33_334, 1_000, false);
        }
        assert_eq!(stats.frames(), 31);
        assert!((stats.fps() - 30.0).abs() < 0.1, "fps {}", stats.fps());
    }

    #[test]
    fn kbps_per_framerate_cycle() {
        let mut stats = EncodeStats::new(10, 1_000_000);
        for i in 0..10 {
            stats.record_packet(i * 100_000, 12_500, true);
        }
        assert_eq!(stats.kbps(), 1_000);
        stats.reset_cycle(5);
        for i in 0..5 {
            stats.record_packet(i * 200_000, 1_000, true);
        }
        assert_eq!(stats.kbps(), 40);
    }

    #[test]
    fn size_jumps_are_counted() {
        let mut stats = EncodeStats::new(30, 0);
        stats.record_packet(0, 1_000, false);
        stats.record_packet(1, 5_000, false);
        stats.record_packet(2, 12_000, false);
        assert_eq!(stats.size_jumps(), 1);
    }
}
