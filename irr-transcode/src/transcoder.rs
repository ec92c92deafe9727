//! The transcoding orchestrator.
//!
//! A [`Transcoder`] owns one worker thread that pulls packets from a [`Demux`],
//! runs them through per-stream decoder, filter and encoder stages created
//! lazily by a [`CodecBackend`], and writes the encoded packets to an
//! [`OutputSink`]. Control-plane calls only stage changes on the
//! [`ParameterChannel`]; the worker applies them at the next frame boundary.
//!
//! State machine: `Stopped -> Starting -> Running -> Flushing -> Stopped`, with
//! `Running -> Restarting -> Running` while output stages are rebuilt after a
//! hardware error or a restart-class parameter change.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::{
    backend::{CodecBackend, DecoderStage, Demux, EncoderOptions, EncoderStage, FilterStage, SurfaceContext},
    capture::ScreenCapture,
    config::{Plugin, RateControlMode, TranscoderConfig},
    directive::{Directive, IntraRefresh, Roi, sort_directives},
    error::{Result, TranscodeError},
    frame::{FrameData, VideoFrame},
    hwerror::{HwErrorAction, HwErrorPolicy},
    params::{CropInfo, ParameterChannel, ProfileLevel, RestartRequest},
    sink::OutputSink,
    skip::SkipFrameCounter,
    stats::{EncodeStats, LatencyStats},
    stream::{CodecId, PixelFormat, Rational, StreamDescriptor},
};

/// Sleep between polls while no client is connected.
const IDLE_POLL: Duration = Duration::from_millis(3);
const MAX_IN_FLIGHT_PROBES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Stopped,
    Starting,
    Running,
    Flushing,
    Restarting,
}

/// Gate consulted before every iteration.
pub type RunPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
/// Called when the hardware error policy gives up.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Default fatal handler: terminate so a supervisor can restart the process.
pub fn exit_process(reason: &str) {
    log::error!("fatal transcoder failure, exiting: {}", reason);
    std::process::exit(1);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscoderStats {
    pub frames_encoded: u64,
    pub fps: f64,
    pub kbps: u64,
    pub hw_errors: u64,
    pub stage_restarts: u64,
}

struct Control {
    state: TranscoderState,
    stop: bool,
}

struct Shared {
    control: Mutex<Control>,
    sink: Mutex<Box<dyn OutputSink>>,
    properties: Mutex<BTreeMap<String, String>>,
    capture: Mutex<ScreenCapture>,
    latency_period: AtomicU32,
    stats: Mutex<TranscoderStats>,
}

fn locked<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: TranscoderState) {
        locked(&self.control).state = state;
    }

    fn stop_requested(&self) -> bool {
        locked(&self.control).stop
    }
}

pub struct Transcoder {
    config: TranscoderConfig,
    demux: Arc<dyn Demux>,
    params: Arc<ParameterChannel>,
    shared: Arc<Shared>,
    backend: Mutex<Option<Box<dyn CodecBackend>>>,
    worker: Mutex<Option<JoinHandle<Box<dyn CodecBackend>>>>,
    allow_run: RunPredicate,
    fatal: FatalHandler,
}

impl Transcoder {
    pub fn new(
        config: TranscoderConfig,
        demux: Arc<dyn Demux>,
        backend: Box<dyn CodecBackend>,
        sink: Box<dyn OutputSink>,
    ) -> Result<Self> {
        config.validate()?;
        let properties = config.output_options.clone();
        let capture = ScreenCapture::new(config.capture.interval_frames, config.capture_quality());
        let params = ParameterChannel::new(config.encoder_settings());
        params.set_skip_frame_flag(config.skip_frame)?;
        demux.set_latency_stats(config.latency_stats_period);
        Ok(Self {
            demux,
            params: Arc::new(params),
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: TranscoderState::Stopped,
                    stop: false,
                }),
                sink: Mutex::new(sink),
                properties: Mutex::new(properties),
                capture: Mutex::new(capture),
                latency_period: AtomicU32::new(config.latency_stats_period),
                stats: Mutex::new(TranscoderStats::default()),
            }),
            backend: Mutex::new(Some(backend)),
            worker: Mutex::new(None),
            allow_run: Arc::new(|| true),
            fatal: Arc::new(exit_process),
            config,
        })
    }

    /// Installs the external "allowed to run" predicate.
    pub fn with_run_predicate(mut self, allow_run: RunPredicate) -> Self {
        self.allow_run = allow_run;
        self
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn state(&self) -> TranscoderState {
        locked(&self.shared.control).state
    }

    pub fn stats(&self) -> TranscoderStats {
        locked(&self.shared.stats).clone()
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut control = locked(&self.shared.control);
            if control.state != TranscoderState::Stopped {
                return Err(TranscodeError::AlreadyRunning);
            }
            control.state = TranscoderState::Starting;
            control.stop = false;
        }
        let finished = locked(&self.worker).take();
        if let Some(finished) = finished {
            self.reclaim(finished);
        }

        let Some(mut backend) = locked(&self.backend).take() else {
            self.shared.set_state(TranscoderState::Stopped);
            return Err(TranscodeError::ResourceExhausted(
                "codec backend unavailable".to_string(),
            ));
        };

        let surfaces = if self.demux.is_surface_backed() || self.config.capabilities.hardware_surface_sharing {
            match backend.create_surface_context(self.config.plugin) {
                Ok(surfaces) => Some(surfaces),
                Err(e) => {
                    log::error!("surface context allocation failed: {}", e);
                    *locked(&self.backend) = Some(backend);
                    self.shared.set_state(TranscoderState::Stopped);
                    return Err(match e {
                        TranscodeError::ResourceExhausted(_) => e,
                        other => TranscodeError::ResourceExhausted(other.to_string()),
                    });
                }
            }
        } else {
            None
        };

        log::info!(
            "transcoder starting: backend={} codec={} {}x{}@{}",
            backend.name(),
            self.config.codec.name(),
            self.config.width,
            self.config.height,
            self.config.framerate
        );
        let pipeline = Pipeline::new(
            self.config.clone(),
            Arc::clone(&self.demux),
            Arc::clone(&self.params),
            Arc::clone(&self.shared),
            backend,
            surfaces,
            Arc::clone(&self.allow_run),
            Arc::clone(&self.fatal),
        );
        let handle = std::thread::Builder::new()
            .name("irr-transcode".to_string())
            .spawn(move || pipeline.run())
            .map_err(|e| {
                self.shared.set_state(TranscoderState::Stopped);
                TranscodeError::ResourceExhausted(format!("worker thread: {}", e))
            })?;
        *locked(&self.worker) = Some(handle);

        let mut control = locked(&self.shared.control);
        if control.state == TranscoderState::Starting {
            control.state = TranscoderState::Running;
        }
        Ok(())
    }

    fn reclaim(&self, handle: JoinHandle<Box<dyn CodecBackend>>) {
        match handle.join() {
            Ok(backend) => *locked(&self.backend) = Some(backend),
            Err(_) => log::error!("transcoder worker panicked"),
        }
    }

    /// Stops the worker after its current iteration and a flush pass, then
    /// releases the input.
    pub fn stop(&self) {
        locked(&self.shared.control).stop = true;
        self.demux.interrupt();
        let handle = locked(&self.worker).take();
        if let Some(handle) = handle {
            self.reclaim(handle);
        }
        self.demux.close();
        if let Err(e) = locked(&self.shared.sink).finish() {
            log::warn!("sink finish failed: {}", e);
        }
        self.shared.set_state(TranscoderState::Stopped);
        log::info!("transcoder stopped");
    }

    /// Blocks until the worker exits on its own, e.g. at end of stream.
    pub fn wait(&self) {
        let handle = locked(&self.worker).take();
        if let Some(handle) = handle {
            self.reclaim(handle);
        }
    }

    pub fn parameters(&self) -> &ParameterChannel {
        &self.params
    }

    pub fn force_key_frame(&self) -> Result<()> {
        self.params.force_key_frame()
    }

    pub fn set_qp(&self, qp: u32) -> Result<()> {
        self.require_rate_control(&[RateControlMode::Cqp], "qp")?;
        self.params.set_qp(qp)
    }

    pub fn set_bitrate(&self, bitrate: u64) -> Result<()> {
        self.require_rate_control(&[RateControlMode::Cbr, RateControlMode::Vbr], "bitrate")?;
        self.params.set_bitrate(bitrate)
    }

    pub fn set_max_bitrate(&self, max_bitrate: u64) -> Result<()> {
        self.require_rate_control(&[RateControlMode::Vbr], "max bitrate")?;
        self.params.set_max_bitrate(max_bitrate)
    }

    pub fn set_framerate(&self, framerate: u32) -> Result<()> {
        self.params.set_framerate(framerate)
    }

    pub fn set_max_frame_size(&self, size: u32) -> Result<()> {
        self.params.set_max_frame_size(size)
    }

    pub fn set_rolling_intra_refresh(&self, refresh: IntraRefresh) -> Result<()> {
        self.params.set_rolling_intra_refresh(refresh)
    }

    pub fn set_region_of_interest(&self, regions: Vec<Roi>) -> Result<()> {
        if !self.config.capabilities.roi_supported {
            log::warn!("rejected parameter change: roi not supported by encoder");
            return Err(TranscodeError::invalid("roi not supported by encoder"));
        }
        self.params.set_region_of_interest(regions)
    }

    pub fn set_min_max_qp(&self, min_qp: u32, max_qp: u32) -> Result<()> {
        self.require_rate_control(&[RateControlMode::Cbr, RateControlMode::Vbr], "qp range")?;
        self.params.set_min_max_qp(min_qp, max_qp)
    }

    pub fn change_resolution(&self, width: u32, height: u32) -> Result<()> {
        self.params.change_resolution(width, height)
    }

    pub fn change_codec(&self, codec: CodecId) -> Result<()> {
        self.params.change_codec(codec)
    }

    pub fn change_profile_level(&self, profile: &str, level: Option<&str>) -> Result<()> {
        self.params.change_profile_level(profile, level)
    }

    pub fn set_gop_size(&self, gop_size: u32) -> Result<()> {
        self.params.set_gop_size(gop_size)
    }

    pub fn set_sei(&self, sei_type: u32, user_id: u32) -> Result<()> {
        self.params.set_sei(sei_type, user_id)
    }

    pub fn set_skip_frame_flag(&self, enabled: bool) -> Result<()> {
        self.params.set_skip_frame_flag(enabled)
    }

    pub fn set_crop(&self, crop: CropInfo) -> Result<()> {
        self.params.set_crop(crop)
    }

    /// Reports ingress and pipeline latency every `period` frames; zero disables.
    pub fn set_latency_stats(&self, period: u32) -> Result<()> {
        self.demux.set_latency_stats(period);
        self.shared.latency_period.store(period, Ordering::SeqCst);
        log::info!("latency stats period set to {}", period);
        Ok(())
    }

    /// Stores an encoder option used the next time an encoder is opened.
    pub fn set_output_property(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(TranscodeError::invalid("empty output property key"));
        }
        locked(&self.shared.properties).insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_screen_capture(&self, interval_frames: u32, quality: u8) -> Result<()> {
        *locked(&self.shared.capture) = ScreenCapture::new(interval_frames, quality);
        Ok(())
    }

    pub fn send_message(&self, message: &[u8]) -> Result<()> {
        locked(&self.shared.sink).send_message(message)?;
        Ok(())
    }

    fn require_rate_control(&self, modes: &[RateControlMode], what: &str) -> Result<()> {
        if modes.iter().any(|m| self.config.capabilities.supports(*m)) {
            return Ok(());
        }
        log::warn!("rejected parameter change: {} needs {:?} rate control", what, modes);
        Err(TranscodeError::invalid(format!(
            "{} needs one of {:?} rate control",
            what, modes
        )))
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if locked(&self.worker).is_some() {
            self.stop();
        }
    }
}

/// Encoder-side settings the next stage (re)creation uses.
#[derive(Debug, Clone)]
struct OutputTarget {
    codec: CodecId,
    width: u32,
    height: u32,
    framerate: u32,
    bitrate: u64,
    gop_size: u32,
    profile_level: Option<ProfileLevel>,
}

struct Pipeline {
    config: TranscoderConfig,
    demux: Arc<dyn Demux>,
    params: Arc<ParameterChannel>,
    shared: Arc<Shared>,
    backend: Box<dyn CodecBackend>,
    surfaces: Option<Box<dyn SurfaceContext>>,
    decoders: BTreeMap<usize, Box<dyn DecoderStage>>,
    filters: BTreeMap<usize, Box<dyn FilterStage>>,
    encoders: BTreeMap<usize, Box<dyn EncoderStage>>,
    registered: BTreeSet<usize>,
    discarded: BTreeSet<usize>,
    target: OutputTarget,
    hw_policy: HwErrorPolicy,
    skip: SkipFrameCounter,
    stats: EncodeStats,
    latency: Option<LatencyStats>,
    in_flight: VecDeque<Instant>,
    allow_run: RunPredicate,
    fatal: FatalHandler,
    origin: Instant,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: TranscoderConfig,
        demux: Arc<dyn Demux>,
        params: Arc<ParameterChannel>,
        shared: Arc<Shared>,
        backend: Box<dyn CodecBackend>,
        surfaces: Option<Box<dyn SurfaceContext>>,
        allow_run: RunPredicate,
        fatal: FatalHandler,
    ) -> Self {
        let settings = params.current();
        let target = OutputTarget {
            codec: settings.codec,
            width: settings.width,
            height: settings.height,
            framerate: settings.framerate,
            bitrate: settings.bitrate,
            gop_size: settings.gop_size,
            profile_level: config.profile.as_ref().map(|profile| ProfileLevel {
                profile: profile.clone(),
                level: config.level.clone(),
            }),
        };
        Self {
            hw_policy: HwErrorPolicy::new(config.hw_error),
            stats: EncodeStats::new(target.framerate, target.bitrate),
            config,
            demux,
            params,
            shared,
            backend,
            surfaces,
            decoders: BTreeMap::new(),
            filters: BTreeMap::new(),
            encoders: BTreeMap::new(),
            registered: BTreeSet::new(),
            discarded: BTreeSet::new(),
            target,
            skip: SkipFrameCounter::new(),
            latency: None,
            in_flight: VecDeque::new(),
            allow_run,
            fatal,
            origin: Instant::now(),
        }
    }

    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn run(mut self) -> Box<dyn CodecBackend> {
        log::info!("transcoder worker started");
        loop {
            if self.shared.stop_requested() {
                break;
            }
            match self.iterate() {
                Ok(()) => {}
                Err(TranscodeError::EndOfStream) => {
                    log::info!("end of stream");
                    break;
                }
                Err(e) => {
                    log::error!("transcoder worker stopping: {}", e);
                    break;
                }
            }
        }
        self.shared.set_state(TranscoderState::Flushing);
        self.flush();
        self.shared.set_state(TranscoderState::Stopped);
        log::info!(
            "transcoder worker finished after {} frames",
            self.stats.frames()
        );
        self.backend
    }

    fn iterate(&mut self) -> Result<()> {
        let (requires_clients, clients) = {
            let mut sink = locked(&self.shared.sink);
            let clients = sink.check_connection();
            (sink.requires_clients(), clients)
        };
        if !self.config.encode_unconditionally {
            let allowed = (self.allow_run)();
            if !allowed || (requires_clients && clients == 0) {
                std::thread::sleep(IDLE_POLL);
                return Ok(());
            }
        }
        if locked(&self.shared.sink).wants_key_frame() {
            self.params.force_key_frame()?;
        }
        self.sync_latency_probe();

        let packet = match self.demux.read_packet() {
            Ok(packet) => packet,
            Err(e) => return self.recover(e),
        };
        if self.latency.is_some() {
            if self.in_flight.len() >= MAX_IN_FLIGHT_PROBES {
                self.in_flight.pop_front();
            }
            self.in_flight.push_back(Instant::now());
        }
        match self.process_input(packet) {
            Ok(()) => Ok(()),
            Err(e) => self.recover(e),
        }
    }

    /// Handles an error locally where the taxonomy allows it.
    fn recover(&mut self, err: TranscodeError) -> Result<()> {
        match err {
            TranscodeError::Transient(_)
            | TranscodeError::StreamNotFound(_)
            | TranscodeError::InvalidArgument(_)
            | TranscodeError::PoolExhausted { .. }
            | TranscodeError::Backend(_) => {
                log::warn!("discarding packet: {}", err);
                Ok(())
            }
            TranscodeError::Hardware(_) => self.on_hardware_error(err),
            other => Err(other),
        }
    }

    fn on_hardware_error(&mut self, err: TranscodeError) -> Result<()> {
        locked(&self.shared.stats).hw_errors += 1;
        let now_ms = self.origin.elapsed().as_millis() as i64;
        match self.hw_policy.record(now_ms) {
            HwErrorAction::RestartStages => {
                self.teardown_output_stages(&format!("{}", err));
                Ok(())
            }
            HwErrorAction::Fatal => {
                (self.fatal)(&err.to_string());
                Err(err)
            }
        }
    }

    fn sync_latency_probe(&mut self) {
        let period = self.shared.latency_period.load(Ordering::SeqCst);
        let current = self.latency.as_ref().map_or(0, LatencyStats::period);
        if period != current {
            self.latency = (period > 0).then(|| LatencyStats::new("pipeline", period));
            self.in_flight.clear();
        }
    }

    fn teardown_output_stages(&mut self, reason: &str) {
        if self.filters.is_empty() && self.encoders.is_empty() {
            return;
        }
        log::warn!("restarting filter and encoder stages: {}", reason);
        self.shared.set_state(TranscoderState::Restarting);
        self.filters.clear();
        self.encoders.clear();
        self.registered.clear();
        locked(&self.shared.stats).stage_restarts += 1;
    }

    fn apply_restart(&mut self, request: RestartRequest) {
        let mut reasons = Vec::new();
        if let Some((width, height)) = request.resolution {
            self.target.width = width;
            self.target.height = height;
            reasons.push(format!("resolution {}x{}", width, height));
        }
        if let Some(codec) = request.codec {
            self.target.codec = codec;
            self.target.profile_level = None;
            reasons.push(format!("codec {}", codec.name()));
        }
        if let Some(profile_level) = request.profile_level {
            reasons.push(format!(
                "profile {} level {:?}",
                profile_level.profile, profile_level.level
            ));
            self.target.profile_level = Some(profile_level);
        }
        self.teardown_output_stages(&reasons.join(", "));
    }

    fn process_input(&mut self, packet: crate::packet::Packet) -> Result<()> {
        let index = packet.index();
        if self.discarded.contains(&index) {
            return Ok(());
        }
        if !self.decoders.contains_key(&index) {
            let stream = self
                .demux
                .stream_info(index)
                .ok_or(TranscodeError::StreamNotFound(index))?;
            if !stream.is_video() {
                log::info!(
                    "discarding stream {} of type {:?}",
                    index,
                    stream.media_type
                );
                self.discarded.insert(index);
                return Ok(());
            }
            let decoder = self
                .backend
                .open_decoder(&stream, self.surfaces.as_deref())?;
            log::info!(
                "decoder opened for stream {}: {} {}x{} {:?}",
                index,
                stream.codec.name(),
                stream.width,
                stream.height,
                stream.pixel_format
            );
            self.decoders.insert(index, decoder);
        }
        if let Some(decoder) = self.decoders.get_mut(&index) {
            decoder.write(Some(packet))?;
        }
        self.decode(index)
    }

    fn decode(&mut self, index: usize) -> Result<()> {
        loop {
            let frame = match self.decoders.get_mut(&index) {
                Some(decoder) => decoder.read()?,
                None => None,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            self.filter_frame(index, frame)?;
        }
    }

    fn filter_frame(&mut self, index: usize, mut frame: VideoFrame) -> Result<()> {
        frame.crop = self.params.crop_for_frame();
        let restart = self.params.take_restart();
        if !restart.is_empty() {
            self.apply_restart(restart);
        }

        let invalid_surface = matches!(frame.data, FrameData::Surface(id) if !id.is_valid());
        if let (true, Some(surfaces)) = (invalid_surface, &self.surfaces) {
            frame.data = FrameData::Surface(surfaces.fallback_surface());
        }

        if !self.filters.contains_key(&index) {
            let src = self
                .decoders
                .get(&index)
                .map(|d| d.descriptor().clone())
                .ok_or(TranscodeError::StreamNotFound(index))?;
            let src = StreamDescriptor {
                width: frame.width,
                height: frame.height,
                pixel_format: frame.format,
                ..src
            };
            let sink = StreamDescriptor {
                width: self.target.width,
                height: self.target.height,
                frame_rate: Rational::new(self.target.framerate as i32, 1),
                pixel_format: self.sink_pixel_format(),
                ..src.clone()
            };
            let filter = self
                .backend
                .open_filter(&src, &sink, self.config.filter_threads)?;
            log::info!(
                "filter opened for stream {}: {}x{} -> {}x{}",
                index,
                src.width,
                src.height,
                sink.width,
                sink.height
            );
            self.filters.insert(index, filter);
        }
        if let Some(filter) = self.filters.get_mut(&index) {
            filter.push(Some(frame))?;
        }
        self.drain_filter(index)
    }

    fn sink_pixel_format(&self) -> PixelFormat {
        match (&self.surfaces, self.config.plugin) {
            (Some(surfaces), _) => surfaces.format(),
            (None, Plugin::Software) => PixelFormat::Yuv420p,
            (None, _) => PixelFormat::Nv12,
        }
    }

    fn drain_filter(&mut self, index: usize) -> Result<()> {
        loop {
            let frame = match self.filters.get_mut(&index) {
                Some(filter) => filter.pop()?,
                None => None,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            self.encode_frame(index, frame)?;
        }
    }

    fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            codec: self.target.codec,
            plugin: self.config.plugin,
            capabilities: self.config.capabilities.clone(),
            bitrate: self.target.bitrate,
            gop_size: self.target.gop_size,
            framerate: self.target.framerate,
            low_power: self.config.low_power,
            profile_level: self.target.profile_level.clone(),
            properties: locked(&self.shared.properties).clone(),
        }
    }

    /// Collects this frame's directives: staged parameter changes, per-frame
    /// side data and the skipped-frame count.
    fn collect_directives(&mut self, frame: &mut VideoFrame) -> Vec<Directive> {
        let mut directives = self.params.take_directives();
        directives.append(&mut frame.side_data);
        if self.params.skip_frame_enabled() {
            let fps = self.demux.frame_rate();
            if fps > 0 {
                let skipped = self.skip.update(self.now_us(), 1_000_000 / fps as i64);
                if skipped > 0 {
                    directives.push(Directive::SkipFrames(skipped));
                }
            }
        }
        for directive in &directives {
            match directive {
                Directive::Framerate(fps) => {
                    self.target.framerate = *fps;
                    self.demux.update_frame_rate(*fps);
                    self.stats.reset_cycle(*fps);
                }
                Directive::RateControl(rc) => {
                    self.target.bitrate = rc.bitrate;
                    self.stats.set_target_bitrate(rc.bitrate);
                }
                Directive::GopSize(gop) => self.target.gop_size = *gop,
                _ => {}
            }
        }
        sort_directives(&mut directives);
        directives
    }

    fn encode_frame(&mut self, index: usize, mut frame: VideoFrame) -> Result<()> {
        if !self.encoders.contains_key(&index) {
            let input = self
                .filters
                .get(&index)
                .map(|f| f.sink_descriptor().clone())
                .ok_or(TranscodeError::StreamNotFound(index))?;
            let options = self.encoder_options();
            let encoder = self.backend.open_encoder(&input, &options)?;
            log::info!(
                "encoder opened for stream {}: {} {}x{} gop={} bitrate={}",
                index,
                options.codec.name(),
                input.width,
                input.height,
                options.gop_size,
                options.bitrate
            );
            self.encoders.insert(index, encoder);
            self.shared.set_state(TranscoderState::Running);
        }

        frame.side_data = self.collect_directives(&mut frame);
        let capture = self.capture_jpeg(&frame);
        let staged = frame.side_data.clone();

        let written = match self.encoders.get_mut(&index) {
            Some(encoder) => encoder.write(Some(frame)),
            None => Ok(()),
        };
        if let Err(e) = written {
            self.params.restage(staged);
            return Err(e);
        }
        if let Some(jpeg) = capture {
            if let Err(e) = locked(&self.shared.sink).write_capture(jpeg) {
                log::warn!("screen capture delivery failed: {}", e);
            }
        }
        self.write_packets(index)
    }

    fn capture_jpeg(&self, frame: &VideoFrame) -> Option<Bytes> {
        let mut capture = locked(&self.shared.capture);
        if !capture.due() {
            return None;
        }
        match capture.encode(frame) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::warn!("screen capture failed: {}", e);
                None
            }
        }
    }

    fn write_packets(&mut self, index: usize) -> Result<()> {
        let mut packets = Vec::new();
        if let Some(encoder) = self.encoders.get_mut(&index) {
            while let Some(packet) = encoder.read()? {
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            return Ok(());
        }

        let track_bitrate = !self.demux.render_paced();
        let mut sink = locked(&self.shared.sink);
        if !self.registered.contains(&index) {
            if let Some(encoder) = self.encoders.get(&index) {
                sink.add_stream(encoder.descriptor())?;
                log::info!("output stream {} registered", index);
            }
            self.registered.insert(index);
        }
        for mut packet in packets {
            packet.set_index(index);
            let now = self.origin.elapsed().as_micros() as i64;
            self.stats.record_packet(now, packet.size(), track_bitrate);
            if let (Some(latency), Some(pulled)) = (self.latency.as_mut(), self.in_flight.pop_front()) {
                latency.record(pulled.elapsed().as_micros() as i64);
            }
            sink.write(packet)?;
        }
        drop(sink);

        let mut stats = locked(&self.shared.stats);
        stats.frames_encoded = self.stats.frames();
        stats.fps = self.stats.fps();
        stats.kbps = self.stats.kbps();
        Ok(())
    }

    fn flush_stream(&mut self, index: usize) -> Result<()> {
        if let Some(decoder) = self.decoders.get_mut(&index) {
            decoder.write(None)?;
        }
        self.decode(index)?;
        if let Some(filter) = self.filters.get_mut(&index) {
            filter.push(None)?;
        }
        self.drain_filter(index)?;
        if let Some(encoder) = self.encoders.get_mut(&index) {
            encoder.write(None)?;
        }
        self.write_packets(index)
    }

    /// Drains every stage once with end-of-stream, then releases them.
    fn flush(&mut self) {
        let indices: Vec<usize> = self.decoders.keys().copied().collect();
        for index in indices {
            if let Err(e) = self.flush_stream(index) {
                log::warn!("flush of stream {} failed: {}", index, e);
            }
        }
        self.encoders.clear();
        self.filters.clear();
        self.decoders.clear();
        self.surfaces = None;
    }
}

#[cfg(test)]
#[path = "transcoder_test.rs"]
mod transcoder_test;
