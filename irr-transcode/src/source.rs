//! Paced ingress of externally rendered frames.
//!
//! An external producer pushes frames at whatever cadence it renders them.
//! [`FrameSource`] keeps only the latest unread frame and hands one packet to
//! the transcoder per [`FrameSource::pull`], waiting as long as the [`Pacer`]
//! says. A pull never fails while the source runs: with nothing new to hand
//! out it repeats the previously delivered picture.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::{
    backend::Demux,
    directive::Directive,
    error::{Result, TranscodeError},
    frame::SurfaceId,
    packet::{Packet, Payload},
    pacing::{Pacer, PacingMode, Wake},
    pool::FramePool,
    stats::LatencyStats,
    stream::{PixelFormat, Rational, StreamDescriptor},
};

#[derive(Debug, Clone)]
pub struct FrameSourceParams {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Nominal frames per second, zero when unknown.
    pub frame_rate: u32,
    pub surface_backed: bool,
    pub latency_optimization: bool,
    pub render_paced: bool,
    pub min_fps: u32,
    pub max_outstanding: usize,
}

impl Default for FrameSourceParams {
    fn default() -> Self {
        Self {
            width: 576,
            height: 960,
            pixel_format: PixelFormat::Rgba,
            frame_rate: 30,
            surface_backed: false,
            latency_optimization: true,
            render_paced: false,
            min_fps: 1,
            max_outstanding: 5,
        }
    }
}

impl FrameSourceParams {
    fn pacing_mode(&self) -> PacingMode {
        if self.render_paced {
            PacingMode::RenderPaced {
                min_fps: self.min_fps,
            }
        } else {
            PacingMode::Constant {
                latency_optimization: self.latency_optimization,
            }
        }
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::raw_video(
            self.width,
            self.height,
            self.pixel_format,
            Rational::new(self.frame_rate as i32, 1),
        )
    }
}

/// A frame as handed over by the renderer.
#[derive(Debug, Clone, Copy)]
pub enum IngressFrame<'a> {
    /// CPU pixels, `stride` bytes per row, optionally stored bottom-up.
    Raw {
        data: &'a [u8],
        stride: usize,
        flip: bool,
    },
    Surface(SurfaceId),
}

struct PendingFrame {
    payload: Payload,
    user_data: Option<Bytes>,
    pushed_at: i64,
}

struct SourceState {
    running: bool,
    params: FrameSourceParams,
    descriptor: StreamDescriptor,
    pool: Option<FramePool>,
    pacer: Pacer,
    pending: Option<PendingFrame>,
    last_delivered: Option<Payload>,
    notified: bool,
    interrupted: bool,
    latency: Option<LatencyStats>,
}

pub struct FrameSource {
    state: Mutex<SourceState>,
    cond: Condvar,
    origin: Instant,
}

impl Default for FrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource {
    pub fn new() -> Self {
        let params = FrameSourceParams::default();
        Self {
            state: Mutex::new(SourceState {
                running: false,
                descriptor: params.descriptor(),
                pacer: Pacer::new(params.pacing_mode(), params.frame_rate, 0),
                params,
                pool: None,
                pending: None,
                last_delivered: None,
                notified: false,
                interrupted: false,
                latency: None,
            }),
            cond: Condvar::new(),
            origin: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    pub fn start(&self, params: FrameSourceParams) -> Result<()> {
        if params.width == 0 || params.height == 0 {
            return Err(TranscodeError::invalid(format!(
                "frame source resolution {}x{}",
                params.width, params.height
            )));
        }
        let mut state = self.lock();
        if state.running {
            return Err(TranscodeError::AlreadyRunning);
        }
        let now = self.now_us();
        let buffer_size = params.pixel_format.buffer_size(params.width, params.height);
        let blank = if params.surface_backed {
            Payload::Surface(SurfaceId::INVALID)
        } else {
            Payload::Data(Bytes::from(vec![0u8; buffer_size]))
        };
        log::info!(
            "frame source started: {}x{} {:?} fps={} mode={:?}",
            params.width,
            params.height,
            params.pixel_format,
            params.frame_rate,
            params.pacing_mode()
        );
        state.pool = (!params.surface_backed)
            .then(|| FramePool::new(buffer_size, params.max_outstanding));
        state.pacer = Pacer::new(params.pacing_mode(), params.frame_rate, now);
        state.descriptor = params.descriptor();
        state.params = params;
        state.pending = None;
        state.last_delivered = Some(blank);
        state.notified = false;
        state.interrupted = false;
        state.running = true;
        Ok(())
    }

    /// Stops the source, dropping the pending and last delivered frames.
    pub fn stop(&self) {
        let mut state = self.lock();
        if state.running {
            log::info!("frame source stopped");
        }
        state.running = false;
        state.pending = None;
        state.last_delivered = None;
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Replaces the pending frame with `frame` without blocking.
    ///
    /// Unread display-control `user_data` of a replaced frame is carried over
    /// unless the new push brings its own. Fails with `PoolExhausted` when all
    /// buffers are checked out; the frame is dropped in that case.
    pub fn push(&self, frame: IngressFrame<'_>, user_data: Option<Bytes>) -> Result<()> {
        let (pool, width, height, bpp) = {
            let state = self.lock();
            if !state.running {
                return Err(TranscodeError::NotRunning);
            }
            (
                state.pool.clone(),
                state.params.width as usize,
                state.params.height as usize,
                state.params.pixel_format.bytes_per_pixel(),
            )
        };

        let payload = match frame {
            IngressFrame::Surface(id) => Payload::Surface(id),
            IngressFrame::Raw { data, stride, flip } => {
                let pool = pool.ok_or_else(|| {
                    TranscodeError::invalid("raw frame pushed to a surface-backed source")
                })?;
                let row = width * bpp;
                let needed = stride
                    .checked_mul(height.saturating_sub(1))
                    .and_then(|n| n.checked_add(row));
                if stride < row || needed.is_none_or(|needed| data.len() < needed) {
                    return Err(TranscodeError::invalid(format!(
                        "raw frame of {} bytes with stride {} does not cover {}x{}",
                        data.len(),
                        stride,
                        width,
                        height
                    )));
                }
                let mut buf = pool.try_acquire().inspect_err(|e| {
                    log::debug!("dropping pushed frame: {}", e);
                })?;
                for (y, dst) in buf.chunks_exact_mut(row).take(height).enumerate() {
                    let src_row = if flip { height - 1 - y } else { y };
                    let offset = src_row * stride;
                    dst.copy_from_slice(&data[offset..offset + row]);
                }
                Payload::Data(buf.freeze())
            }
        };

        let mut state = self.lock();
        if !state.running {
            return Err(TranscodeError::NotRunning);
        }
        let now = self.now_us();
        let carried = state.pending.take().and_then(|p| p.user_data);
        state.pending = Some(PendingFrame {
            payload,
            user_data: user_data.or(carried),
            pushed_at: now,
        });
        if state.pacer.on_push(now) {
            state.notified = true;
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Waits for the paced moment and returns exactly one packet.
    ///
    /// Returns `EndOfStream` once the source has been stopped.
    pub fn pull(&self) -> Result<Packet> {
        let mut state = self.lock();
        if !state.running {
            return Err(TranscodeError::EndOfStream);
        }
        let plan = state.pacer.plan(self.now_us());
        let steps = plan.steps.max(1);
        let step = Duration::from_micros((plan.timeout_us / steps as i64).max(1) as u64);

        let mut wake = Wake::TimedOut;
        'wait: for _ in 0..steps {
            let deadline = Instant::now() + step;
            loop {
                if state.notified {
                    wake = Wake::Notified;
                    break 'wait;
                }
                if state.interrupted || !state.running {
                    break 'wait;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
        }
        state.notified = false;
        state.interrupted = false;
        if !state.running {
            return Err(TranscodeError::EndOfStream);
        }

        let now = self.now_us();
        state.pacer.on_wake(now, wake);
        state.pacer.on_consumed(now);
        let interval = state.pacer.interval_us();

        let mut side_data = Vec::new();
        let payload = match state.pending.take() {
            Some(pending) => {
                if let Some(latency) = state.latency.as_mut() {
                    latency.record(now - pending.pushed_at);
                }
                if let Some(blob) = pending.user_data {
                    side_data.push(Directive::UserData(blob));
                }
                state.last_delivered = Some(pending.payload.clone());
                pending.payload
            }
            None => match &state.last_delivered {
                Some(payload) => payload.clone(),
                None => return Err(TranscodeError::EndOfStream),
            },
        };

        let mut packet = Packet::new(payload, 0, Rational::MICROS);
        packet.set_timestamps(Some(now), Some(now));
        packet.set_duration(interval);
        packet.set_key(true);
        for directive in side_data {
            packet.push_side_data(directive);
        }
        Ok(packet)
    }

    /// Wakes a blocked `pull` so it returns immediately.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    pub fn update_frame_rate(&self, fps: u32) {
        let mut state = self.lock();
        state.pacer.set_frame_rate(fps);
        state.params.frame_rate = fps;
        state.descriptor.frame_rate = Rational::new(fps as i32, 1);
        log::info!("frame source rate updated to {} fps", fps);
    }

    /// Enables push-to-pull latency reporting every `period` frames; zero disables.
    pub fn set_latency_stats(&self, period: u32) {
        self.lock().latency = (period > 0).then(|| LatencyStats::new("ingress", period));
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        self.lock().descriptor.clone()
    }

    pub fn frame_rate(&self) -> u32 {
        self.lock().params.frame_rate
    }

    pub fn render_paced(&self) -> bool {
        self.lock().params.render_paced
    }

    /// Buffers checked out of the ingress pool, zero for surface-backed sources.
    pub fn outstanding(&self) -> usize {
        self.lock().pool.as_ref().map_or(0, FramePool::outstanding)
    }
}

impl Demux for FrameSource {
    fn streams(&self) -> Vec<StreamDescriptor> {
        vec![self.descriptor()]
    }

    fn read_packet(&self) -> Result<Packet> {
        self.pull()
    }

    fn interrupt(&self) {
        FrameSource::interrupt(self);
    }

    fn close(&self) {
        self.stop();
    }

    fn is_surface_backed(&self) -> bool {
        self.lock().params.surface_backed
    }

    fn frame_rate(&self) -> u32 {
        FrameSource::frame_rate(self)
    }

    fn render_paced(&self) -> bool {
        FrameSource::render_paced(self)
    }

    fn update_frame_rate(&self, fps: u32) {
        FrameSource::update_frame_rate(self, fps);
    }

    fn set_latency_stats(&self, period: u32) {
        FrameSource::set_latency_stats(self, period);
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
