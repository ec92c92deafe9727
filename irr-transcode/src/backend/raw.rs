//! Software rawvideo backend.
//!
//! Decoding unwraps packet payloads into frames, filtering crops and scales
//! packed pixel formats with nearest-neighbour sampling, and encoding emits the
//! frame bytes unchanged with the applied directives echoed in the packet's
//! side data. Useful without any media library installed and in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::{
    backend::{
        CodecBackend, DecoderStage, EncoderOptions, EncoderStage, FilterStage, SurfaceContext,
    },
    config::Plugin,
    directive::Directive,
    error::{Result, TranscodeError},
    frame::{CropRect, FrameData, SurfaceId, VideoFrame},
    packet::{Packet, Payload},
    stream::{PixelFormat, Rational, StreamDescriptor},
};

/// Counters and fault switches shared by a [`RawBackend`] and its stages.
#[derive(Debug, Default)]
pub struct RawProbe {
    decoders_opened: AtomicUsize,
    filters_opened: AtomicUsize,
    encoders_opened: AtomicUsize,
    surface_contexts: AtomicUsize,
    encoder_faults: AtomicU32,
    fail_surface_context: AtomicBool,
    decode_delay_ms: AtomicU64,
}

impl RawProbe {
    pub fn decoders_opened(&self) -> usize {
        self.decoders_opened.load(Ordering::SeqCst)
    }

    pub fn filters_opened(&self) -> usize {
        self.filters_opened.load(Ordering::SeqCst)
    }

    pub fn encoders_opened(&self) -> usize {
        self.encoders_opened.load(Ordering::SeqCst)
    }

    pub fn surface_contexts(&self) -> usize {
        self.surface_contexts.load(Ordering::SeqCst)
    }

    /// The next `count` encoder writes fail with a hardware error.
    pub fn inject_encoder_faults(&self, count: u32) {
        self.encoder_faults.store(count, Ordering::SeqCst);
    }

    pub fn fail_surface_context(&self, fail: bool) {
        self.fail_surface_context.store(fail, Ordering::SeqCst);
    }

    /// Makes every decoder write sleep, simulating slow decoding.
    pub fn set_decode_delay(&self, delay: Duration) {
        self.decode_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_encoder_fault(&self) -> bool {
        self.encoder_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
pub struct RawBackend {
    probe: Arc<RawProbe>,
}

impl RawBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> Arc<RawProbe> {
        Arc::clone(&self.probe)
    }
}

struct RawSurfaceContext {
    format: PixelFormat,
}

impl SurfaceContext for RawSurfaceContext {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn fallback_surface(&self) -> SurfaceId {
        SurfaceId(0)
    }
}

impl CodecBackend for RawBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn create_surface_context(&mut self, plugin: Plugin) -> Result<Box<dyn SurfaceContext>> {
        if self.probe.fail_surface_context.load(Ordering::SeqCst) {
            return Err(TranscodeError::ResourceExhausted(format!(
                "no {:?} surface context available",
                plugin
            )));
        }
        self.probe.surface_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RawSurfaceContext {
            format: plugin.surface_format(),
        }))
    }

    fn open_decoder(
        &mut self,
        stream: &StreamDescriptor,
        _surfaces: Option<&dyn SurfaceContext>,
    ) -> Result<Box<dyn DecoderStage>> {
        self.probe.decoders_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RawDecoder {
            descriptor: stream.clone(),
            frames: VecDeque::new(),
            probe: Arc::clone(&self.probe),
        }))
    }

    fn open_filter(
        &mut self,
        src: &StreamDescriptor,
        sink: &StreamDescriptor,
        _threads: u32,
    ) -> Result<Box<dyn FilterStage>> {
        let packed = matches!(
            src.pixel_format,
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Rgb24
        );
        let resizes = src.width != sink.width || src.height != sink.height;
        if resizes && !packed && !src.pixel_format.is_hardware() {
            return Err(TranscodeError::Transient(format!(
                "raw filter cannot scale {:?}",
                src.pixel_format
            )));
        }
        self.probe.filters_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RawFilter {
            src: src.clone(),
            sink: StreamDescriptor {
                pixel_format: src.pixel_format,
                ..sink.clone()
            },
            frames: VecDeque::new(),
        }))
    }

    fn open_encoder(
        &mut self,
        input: &StreamDescriptor,
        options: &EncoderOptions,
    ) -> Result<Box<dyn EncoderStage>> {
        self.probe.encoders_opened.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "raw encoder {} {}x{} gop={}",
            options.codec.name(),
            input.width,
            input.height,
            options.gop_size
        );
        Ok(Box::new(RawEncoder {
            descriptor: StreamDescriptor::for_encoder_output(input, options.codec),
            gop_size: options.gop_size.max(1),
            framerate: options.framerate,
            frame_index: 0,
            packets: VecDeque::new(),
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct RawDecoder {
    descriptor: StreamDescriptor,
    frames: VecDeque<VideoFrame>,
    probe: Arc<RawProbe>,
}

impl DecoderStage for RawDecoder {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn write(&mut self, packet: Option<Packet>) -> Result<()> {
        let Some(mut packet) = packet else {
            return Ok(());
        };
        let delay = self.probe.decode_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if packet.is_corrupt() {
            return Err(TranscodeError::Transient("corrupt packet".to_string()));
        }
        let side_data = packet.take_side_data();
        let pts = packet.pts();
        let d = &self.descriptor;
        let mut frame = match packet.into_payload() {
            Payload::Data(data) => VideoFrame::cpu(data, d.width, d.height, d.pixel_format),
            Payload::Surface(id) => VideoFrame::surface(id, d.width, d.height, d.pixel_format),
        };
        frame.pts = pts;
        frame.side_data = side_data;
        self.frames.push_back(frame);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.pop_front())
    }
}

struct RawFilter {
    src: StreamDescriptor,
    sink: StreamDescriptor,
    frames: VecDeque<VideoFrame>,
}

fn crop_and_scale(
    data: &[u8],
    src_width: u32,
    bpp: usize,
    crop: CropRect,
    dst_width: u32,
    dst_height: u32,
) -> Bytes {
    let crop_width = (crop.right - crop.left) as usize;
    let crop_height = (crop.bottom - crop.top) as usize;
    let (dst_width, dst_height) = (dst_width as usize, dst_height as usize);
    let src_stride = src_width as usize * bpp;
    let mut out = BytesMut::zeroed(dst_width * dst_height * bpp);
    for y in 0..dst_height {
        let sy = crop.top as usize + y * crop_height / dst_height;
        for x in 0..dst_width {
            let sx = crop.left as usize + x * crop_width / dst_width;
            let src = sy * src_stride + sx * bpp;
            let dst = (y * dst_width + x) * bpp;
            if let Some(pixel) = data.get(src..src + bpp) {
                out[dst..dst + bpp].copy_from_slice(pixel);
            }
        }
    }
    out.freeze()
}

impl FilterStage for RawFilter {
    fn src_descriptor(&self) -> &StreamDescriptor {
        &self.src
    }

    fn sink_descriptor(&self) -> &StreamDescriptor {
        &self.sink
    }

    fn push(&mut self, frame: Option<VideoFrame>) -> Result<()> {
        let Some(mut frame) = frame else {
            return Ok(());
        };
        let full = CropRect {
            left: 0,
            top: 0,
            right: frame.width,
            bottom: frame.height,
        };
        let crop = frame
            .crop
            .take()
            .filter(|c| {
                c.left < c.right
                    && c.top < c.bottom
                    && c.right <= frame.width
                    && c.bottom <= frame.height
            })
            .unwrap_or(full);
        let (width, height) = (self.sink.width, self.sink.height);
        let resized = crop != full || width != frame.width || height != frame.height;
        let scaled = match &frame.data {
            FrameData::Cpu(data) if resized => {
                let bpp = frame.format.bytes_per_pixel();
                Some(crop_and_scale(data, frame.width, bpp, crop, width, height))
            }
            _ => None,
        };
        if let Some(scaled) = scaled {
            frame.data = FrameData::Cpu(scaled);
        }
        frame.width = width;
        frame.height = height;
        self.frames.push_back(frame);
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.pop_front())
    }
}

struct RawEncoder {
    descriptor: StreamDescriptor,
    gop_size: u32,
    framerate: u32,
    frame_index: u64,
    packets: VecDeque<Packet>,
    probe: Arc<RawProbe>,
}

impl EncoderStage for RawEncoder {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn write(&mut self, frame: Option<VideoFrame>) -> Result<()> {
        let Some(mut frame) = frame else {
            return Ok(());
        };
        if self.probe.take_encoder_fault() {
            return Err(TranscodeError::Hardware("encoder device lost".to_string()));
        }
        if frame.width != self.descriptor.width || frame.height != self.descriptor.height {
            return Err(TranscodeError::Transient(format!(
                "frame {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.descriptor.width, self.descriptor.height
            )));
        }

        let directives = std::mem::take(&mut frame.side_data);
        let mut key = self.frame_index % self.gop_size as u64 == 0;
        for directive in &directives {
            match directive {
                Directive::GopSize(gop) => self.gop_size = (*gop).max(1),
                Directive::Framerate(fps) => self.framerate = *fps,
                _ => {}
            }
            key |= directive.requests_key_frame();
            log::trace!("raw encoder applied {}", directive.name());
        }

        let data = match frame.data {
            FrameData::Cpu(data) => Bytes::copy_from_slice(&data),
            FrameData::Surface(id) => Bytes::copy_from_slice(&id.0.to_le_bytes()),
        };
        let mut packet = Packet::new(Payload::Data(data), self.descriptor.index, Rational::MICROS);
        packet.set_timestamps(frame.pts, frame.pts);
        if self.framerate > 0 {
            packet.set_duration(1_000_000 / self.framerate as i64);
        }
        packet.set_key(key);
        for directive in directives {
            packet.push_side_data(directive);
        }
        self.frame_index += 1;
        self.packets.push_back(packet);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Packet>> {
        Ok(self.packets.pop_front())
    }

    fn encoded_frames(&self) -> u64 {
        self.frame_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::CodecId;

    #[test]
    fn filter_crops_then_scales() {
        let src = StreamDescriptor::raw_video(4, 2, PixelFormat::Rgb24, Rational::new(30, 1));
        let sink = src.with_resolution(2, 1);
        let mut backend = RawBackend::new();
        let mut filter = backend.open_filter(&src, &sink, 1).unwrap();

        let pixels: Vec<u8> = (0..8u8).flat_map(|p| [p; 3]).collect();
        let mut frame = VideoFrame::cpu(Bytes::from(pixels), 4, 2, PixelFormat::Rgb24);
        frame.crop = Some(CropRect {
            left: 2,
            top: 0,
            right: 4,
            bottom: 2,
        });
        filter.push(Some(frame)).unwrap();
        let out = filter.pop().unwrap().unwrap();
        assert_eq!((out.width, out.height), (2, 1));
        assert_eq!(out.cpu_data().unwrap().as_ref(), &[2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn planar_resize_is_refused() {
        let src = StreamDescriptor::raw_video(4, 4, PixelFormat::Nv12, Rational::new(30, 1));
        let mut backend = RawBackend::new();
        assert!(backend.open_filter(&src, &src.with_resolution(2, 2), 1).is_err());
    }

    #[test]
    fn encoder_echoes_directives_and_marks_keys() {
        let input = StreamDescriptor::raw_video(1, 1, PixelFormat::Rgba, Rational::new(30, 1));
        let mut backend = RawBackend::new();
        let options = EncoderOptions {
            codec: CodecId::H264,
            plugin: Plugin::Software,
            capabilities: Default::default(),
            bitrate: 0,
            gop_size: 3,
            framerate: 30,
            low_power: false,
            profile_level: None,
            properties: Default::default(),
        };
        let mut encoder = backend.open_encoder(&input, &options).unwrap();
        let mut keys = Vec::new();
        for i in 0..4 {
            let mut frame =
                VideoFrame::cpu(Bytes::from_static(&[1, 2, 3, 4]), 1, 1, PixelFormat::Rgba);
            if i == 1 {
                frame.side_data.push(Directive::Qp(22));
            }
            encoder.write(Some(frame)).unwrap();
            let packet = encoder.read().unwrap().unwrap();
            if i == 1 {
                assert_eq!(packet.side_data(), &[Directive::Qp(22)]);
            }
            keys.push(packet.is_key());
        }
        assert_eq!(keys, vec![true, false, false, true]);
        assert_eq!(encoder.encoded_frames(), 4);
        assert_eq!(encoder.descriptor().codec, CodecId::H264);
    }

    #[test]
    fn injected_faults_surface_as_hardware_errors() {
        let input = StreamDescriptor::raw_video(1, 1, PixelFormat::Rgba, Rational::new(30, 1));
        let mut backend = RawBackend::new();
        backend.probe().inject_encoder_faults(1);
        let options = EncoderOptions {
            codec: CodecId::H264,
            plugin: Plugin::Software,
            capabilities: Default::default(),
            bitrate: 0,
            gop_size: 30,
            framerate: 30,
            low_power: false,
            profile_level: None,
            properties: Default::default(),
        };
        let mut encoder = backend.open_encoder(&input, &options).unwrap();
        let frame = VideoFrame::cpu(Bytes::from_static(&[0; 4]), 1, 1, PixelFormat::Rgba);
        assert!(encoder.write(Some(frame.clone())).unwrap_err().is_hardware());
        assert!(encoder.write(Some(frame)).is_ok());
    }
}
