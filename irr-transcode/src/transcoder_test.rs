use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::mpsc;

use super::*;
use crate::backend::raw::{RawBackend, RawProbe};
use crate::directive::RateControl;
use crate::hwerror::HwErrorLimits;
use crate::packet::{Packet, Payload};

const SIZE: u32 = 64;

struct TestDemux {
    descriptor: StreamDescriptor,
    packets: Mutex<mpsc::Receiver<Packet>>,
    reads: AtomicUsize,
    fps: AtomicU32,
    surface_backed: bool,
}

impl TestDemux {
    fn live(surface_backed: bool) -> (Arc<Self>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel();
        let demux = Arc::new(Self {
            descriptor: StreamDescriptor::raw_video(SIZE, SIZE, PixelFormat::Rgba, Rational::new(30, 1)),
            packets: Mutex::new(rx),
            reads: AtomicUsize::new(0),
            fps: AtomicU32::new(30),
            surface_backed,
        });
        (demux, tx)
    }

    fn scripted(count: u8) -> Arc<Self> {
        let (demux, tx) = Self::live(false);
        for value in 0..count {
            tx.send(test_packet(value)).unwrap();
        }
        demux
    }
}

impl Demux for TestDemux {
    fn streams(&self) -> Vec<StreamDescriptor> {
        vec![self.descriptor.clone()]
    }

    fn read_packet(&self) -> Result<Packet> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match locked(&self.packets).recv_timeout(Duration::from_millis(5)) {
            Ok(packet) => Ok(packet),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TranscodeError::Transient("no packet".into())),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TranscodeError::EndOfStream),
        }
    }

    fn is_surface_backed(&self) -> bool {
        self.surface_backed
    }

    fn frame_rate(&self) -> u32 {
        self.fps.load(Ordering::SeqCst)
    }

    fn update_frame_rate(&self, fps: u32) {
        self.fps.store(fps, Ordering::SeqCst);
    }
}

fn test_packet(value: u8) -> Packet {
    let data = Bytes::from(vec![value; (SIZE * SIZE * 4) as usize]);
    let mut packet = Packet::new(Payload::Data(data), 0, Rational::MICROS);
    packet.set_timestamps(Some(value as i64 * 33_333), Some(value as i64 * 33_333));
    packet
}

#[derive(Default)]
struct Recorded {
    streams: Vec<StreamDescriptor>,
    packets: Vec<Packet>,
    captures: Vec<Bytes>,
    finished: bool,
}

#[derive(Clone, Default)]
struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
    clients: Arc<AtomicUsize>,
    requires_clients: bool,
    key_request: Arc<AtomicBool>,
}

impl RecordingSink {
    fn gated() -> Self {
        Self {
            requires_clients: true,
            ..Self::default()
        }
    }

    fn packet_count(&self) -> usize {
        locked(&self.recorded).packets.len()
    }
}

impl OutputSink for RecordingSink {
    fn add_stream(&mut self, stream: &StreamDescriptor) -> anyhow::Result<()> {
        locked(&self.recorded).streams.push(stream.clone());
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> anyhow::Result<()> {
        locked(&self.recorded).packets.push(packet);
        Ok(())
    }

    fn check_connection(&mut self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    fn wants_key_frame(&mut self) -> bool {
        self.key_request.swap(false, Ordering::SeqCst)
    }

    fn write_capture(&mut self, jpeg: Bytes) -> anyhow::Result<()> {
        locked(&self.recorded).captures.push(jpeg);
        Ok(())
    }

    fn requires_clients(&self) -> bool {
        self.requires_clients
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        locked(&self.recorded).finished = true;
        Ok(())
    }
}

fn config() -> TranscoderConfig {
    TranscoderConfig {
        width: SIZE,
        height: SIZE,
        hw_error: HwErrorLimits {
            max_duration_ms: 60_000,
            ..HwErrorLimits::default()
        },
        ..TranscoderConfig::default()
    }
}

fn build(
    config: TranscoderConfig,
    demux: Arc<TestDemux>,
    sink: &RecordingSink,
) -> (Transcoder, Arc<RawProbe>) {
    let backend = RawBackend::new();
    let probe = backend.probe();
    let transcoder = Transcoder::new(config, demux, Box::new(backend), Box::new(sink.clone()))
        .unwrap()
        .with_fatal_handler(Arc::new(|reason: &str| panic!("unexpected fatal: {}", reason)));
    (transcoder, probe)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn end_of_stream_flushes_every_packet() {
    let sink = RecordingSink::default();
    let (transcoder, probe) = build(config(), TestDemux::scripted(5), &sink);
    transcoder.start().unwrap();
    transcoder.wait();

    assert_eq!(transcoder.state(), TranscoderState::Stopped);
    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.streams.len(), 1);
    assert_eq!(recorded.streams[0].codec, CodecId::H264);
    assert_eq!(recorded.packets.len(), 5);
    assert!(recorded.packets[0].is_key());
    assert!(!recorded.packets[1].is_key());
    drop(recorded);
    assert_eq!(transcoder.stats().frames_encoded, 5);
    assert_eq!((probe.decoders_opened(), probe.encoders_opened()), (1, 1));
}

#[test]
fn second_start_is_rejected() {
    let sink = RecordingSink::default();
    let (demux, _tx) = TestDemux::live(false);
    let (transcoder, _) = build(config(), demux, &sink);
    transcoder.start().unwrap();
    assert!(matches!(transcoder.start(), Err(TranscodeError::AlreadyRunning)));
    transcoder.stop();
    assert_eq!(transcoder.state(), TranscoderState::Stopped);
    assert!(locked(&sink.recorded).finished);

    transcoder.start().unwrap();
    transcoder.stop();
}

#[test]
fn surface_context_failure_aborts_start() {
    let sink = RecordingSink::default();
    let (demux, _tx) = TestDemux::live(true);
    let (transcoder, probe) = build(config(), demux, &sink);
    probe.fail_surface_context(true);

    let err = transcoder.start().unwrap_err();
    assert!(matches!(err, TranscodeError::ResourceExhausted(_)));
    assert_eq!(transcoder.state(), TranscoderState::Stopped);
    assert_eq!(probe.decoders_opened(), 0);

    probe.fail_surface_context(false);
    transcoder.start().unwrap();
    assert_eq!(probe.surface_contexts(), 1);
    transcoder.stop();
}

#[test]
fn hardware_error_burst_becomes_fatal_on_eleventh_error() {
    let sink = RecordingSink::default();
    let backend = RawBackend::new();
    let probe = backend.probe();
    probe.inject_encoder_faults(15);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let fatal_reasons = Arc::clone(&reasons);
    let transcoder = Transcoder::new(
        config(),
        TestDemux::scripted(15),
        Box::new(backend),
        Box::new(sink.clone()),
    )
    .unwrap()
    .with_fatal_handler(Arc::new(move |reason: &str| {
        locked(&fatal_reasons).push(reason.to_string())
    }));

    transcoder.start().unwrap();
    transcoder.wait();

    assert_eq!(locked(&reasons).len(), 1);
    let stats = transcoder.stats();
    assert_eq!(stats.hw_errors, 11);
    assert_eq!(stats.stage_restarts, 10);
    assert_eq!(probe.decoders_opened(), 1);
    assert_eq!(probe.encoders_opened(), 11);
    assert_eq!(sink.packet_count(), 0);
}

#[test]
fn hardware_errors_below_the_limit_rebuild_only_output_stages() {
    let sink = RecordingSink::default();
    let (transcoder, probe) = build(config(), TestDemux::scripted(5), &sink);
    probe.inject_encoder_faults(3);
    transcoder.start().unwrap();
    transcoder.wait();

    let stats = transcoder.stats();
    assert_eq!(stats.hw_errors, 3);
    assert_eq!(stats.stage_restarts, 3);
    assert_eq!(probe.decoders_opened(), 1);
    assert_eq!(probe.filters_opened(), 4);
    assert_eq!(probe.encoders_opened(), 4);
    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.packets.len(), 2);
    assert!(recorded.packets[0].is_key());
    assert!(recorded.finished);
}

#[test]
fn transcoder_idles_until_a_client_connects() {
    let sink = RecordingSink::gated();
    let (demux, tx) = TestDemux::live(false);
    let (transcoder, _) = build(config(), Arc::clone(&demux), &sink);
    tx.send(test_packet(1)).unwrap();
    transcoder.start().unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(demux.reads.load(Ordering::SeqCst), 0);

    sink.key_request.store(true, Ordering::SeqCst);
    sink.clients.store(1, Ordering::SeqCst);
    wait_for("first packet", || sink.packet_count() == 1);
    transcoder.stop();

    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.packets[0].side_data(), &[Directive::ForceKeyFrame]);
}

#[test]
fn run_predicate_gates_unless_unconditional() {
    let sink = RecordingSink::gated();
    let (demux, _tx) = TestDemux::live(false);
    let (transcoder, _) = build(config(), Arc::clone(&demux), &sink);
    let transcoder = transcoder.with_run_predicate(Arc::new(|| false));
    sink.clients.store(1, Ordering::SeqCst);
    transcoder.start().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(demux.reads.load(Ordering::SeqCst), 0);
    transcoder.stop();

    let sink = RecordingSink::gated();
    let (demux, _tx) = TestDemux::live(false);
    let config = TranscoderConfig {
        encode_unconditionally: true,
        ..config()
    };
    let (transcoder, _) = build(config, Arc::clone(&demux), &sink);
    let transcoder = transcoder.with_run_predicate(Arc::new(|| false));
    transcoder.start().unwrap();
    wait_for("reads", || demux.reads.load(Ordering::SeqCst) > 0);
    transcoder.stop();
}

#[test]
fn staged_parameters_reach_the_next_frame_once() {
    let sink = RecordingSink::default();
    let demux = TestDemux::scripted(3);
    let (transcoder, _) = build(config(), Arc::clone(&demux), &sink);
    transcoder.set_qp(20).unwrap();
    transcoder.set_qp(30).unwrap();
    transcoder.set_bitrate(2_000_000).unwrap();
    transcoder.force_key_frame().unwrap();
    transcoder.set_framerate(60).unwrap();

    transcoder.start().unwrap();
    transcoder.wait();

    let recorded = locked(&sink.recorded);
    let first = recorded.packets[0].side_data();
    assert_eq!(first.len(), 4);
    assert_eq!(first[0], Directive::ForceKeyFrame);
    assert_eq!(first[1], Directive::Qp(30));
    assert!(matches!(
        first[2],
        Directive::RateControl(RateControl { bitrate: 2_000_000, .. })
    ));
    assert_eq!(first[3], Directive::Framerate(60));
    assert!(recorded.packets[1].side_data().is_empty());
    assert!(recorded.packets[2].side_data().is_empty());
    assert_eq!(demux.fps.load(Ordering::SeqCst), 60);
}

#[test]
fn resolution_changes_coalesce_into_one_restart() {
    let sink = RecordingSink::default();
    let (demux, tx) = TestDemux::live(false);
    let (transcoder, probe) = build(config(), demux, &sink);
    transcoder.start().unwrap();

    tx.send(test_packet(1)).unwrap();
    wait_for("first packet", || sink.packet_count() == 1);
    transcoder.change_resolution(48, 48).unwrap();
    transcoder.change_resolution(40, 40).unwrap();
    tx.send(test_packet(2)).unwrap();
    wait_for("second packet", || sink.packet_count() == 2);
    transcoder.stop();

    assert_eq!(probe.decoders_opened(), 1);
    assert_eq!(probe.filters_opened(), 2);
    assert_eq!(probe.encoders_opened(), 2);
    assert_eq!(transcoder.stats().stage_restarts, 1);
    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.streams.len(), 2);
    assert_eq!((recorded.streams[1].width, recorded.streams[1].height), (40, 40));
    assert_eq!(recorded.packets[1].size(), 40 * 40 * 4);
    assert!(recorded.packets[1].is_key());
}

#[test]
fn skipped_frames_are_reported_to_the_encoder() {
    let sink = RecordingSink::default();
    let (demux, tx) = TestDemux::live(false);
    let (transcoder, _) = build(config(), demux, &sink);
    transcoder.set_skip_frame_flag(true).unwrap();
    transcoder.start().unwrap();

    tx.send(test_packet(1)).unwrap();
    wait_for("first packet", || sink.packet_count() == 1);
    // roughly seven frame slots at 30 fps pass without input
    std::thread::sleep(Duration::from_millis(250));
    tx.send(test_packet(2)).unwrap();
    wait_for("second packet", || sink.packet_count() == 2);
    transcoder.stop();

    let recorded = locked(&sink.recorded);
    assert!(recorded.packets[0].side_data().is_empty());
    match recorded.packets[1].side_data() {
        [Directive::SkipFrames(skipped)] => assert!(*skipped >= 5, "skipped {}", skipped),
        other => panic!("Expected one skip directive, got {:?}", other),
    }
}

fn client_area(client_width: u32, client_height: u32) -> CropInfo {
    CropInfo {
        client_width,
        client_height,
        fb_width: SIZE,
        fb_height: SIZE,
        left: 0,
        top: 0,
    }
}

#[test]
fn crop_resizes_the_output_with_one_restart() {
    let sink = RecordingSink::default();
    let (transcoder, probe) = build(config(), TestDemux::scripted(3), &sink);
    transcoder.set_crop(client_area(48, 32)).unwrap();
    transcoder.start().unwrap();
    transcoder.wait();

    assert_eq!(transcoder.stats().stage_restarts, 1);
    assert_eq!(probe.filters_opened(), 1);
    assert_eq!(probe.encoders_opened(), 1);
    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.streams.len(), 1);
    assert_eq!((recorded.streams[0].width, recorded.streams[0].height), (48, 32));
    assert_eq!(recorded.packets.len(), 3);
    assert!(recorded.packets.iter().all(|p| p.size() == 48 * 32 * 4));
}

#[test]
fn explicit_resolution_beats_crop_in_the_same_cycle() {
    let sink = RecordingSink::default();
    let (transcoder, probe) = build(config(), TestDemux::scripted(2), &sink);
    transcoder.change_resolution(40, 40).unwrap();
    transcoder.set_crop(client_area(48, 32)).unwrap();
    transcoder.start().unwrap();
    transcoder.wait();

    assert_eq!(transcoder.stats().stage_restarts, 1);
    assert_eq!(probe.encoders_opened(), 1);
    let recorded = locked(&sink.recorded);
    assert_eq!((recorded.streams[0].width, recorded.streams[0].height), (40, 40));
    assert_eq!(recorded.packets.len(), 2);
    assert!(recorded.packets.iter().all(|p| p.size() == 40 * 40 * 4));
}

#[test]
fn unsupported_controls_are_rejected_at_the_call_site() {
    let mut config = config();
    config.capabilities.rate_control = [RateControlMode::Cqp].into_iter().collect();
    config.capabilities.roi_supported = false;
    let sink = RecordingSink::default();
    let (demux, _tx) = TestDemux::live(false);
    let (transcoder, _) = build(config, demux, &sink);

    assert!(transcoder.set_qp(25).is_ok());
    assert!(transcoder.set_bitrate(1_000_000).is_err());
    assert!(transcoder.set_min_max_qp(10, 40).is_err());
    let roi = Roi {
        x: 0,
        y: 0,
        width: 16,
        height: 16,
        qp_offset: -4,
    };
    assert!(transcoder.set_region_of_interest(vec![roi]).is_err());
    assert!(transcoder.parameters().take_directives() == vec![Directive::Qp(25)]);
}

#[test]
fn screen_capture_is_delivered_as_jpeg() {
    let sink = RecordingSink::default();
    let (transcoder, _) = build(config(), TestDemux::scripted(4), &sink);
    transcoder.set_screen_capture(2, 70).unwrap();
    transcoder.start().unwrap();
    transcoder.wait();

    let recorded = locked(&sink.recorded);
    assert_eq!(recorded.captures.len(), 2);
    assert_eq!(&recorded.captures[0][..2], &[0xFF, 0xD8]);
}

#[test]
fn invalid_config_is_rejected() {
    let sink = RecordingSink::default();
    let (demux, _tx) = TestDemux::live(false);
    let config = TranscoderConfig {
        gop_size: 0,
        ..config()
    };
    let result = Transcoder::new(config, demux, Box::new(RawBackend::new()), Box::new(sink));
    assert!(matches!(result, Err(TranscodeError::InvalidArgument(_))));
}
