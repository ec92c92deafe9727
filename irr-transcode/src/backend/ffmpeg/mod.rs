//! libav* backed stages.
//!
//! Frames cross the stage boundary as tightly packed CPU images; each stage
//! copies into and out of `AVFrame`s. Hardware encoders are preferred and fall
//! back to their software counterpart when they cannot be opened.

use std::ptr;

use ffmpeg_next::ffi;

use crate::{
    backend::{
        CodecBackend, DecoderStage, EncoderOptions, EncoderStage, FilterStage, SurfaceContext,
    },
    config::Plugin,
    error::{Result, TranscodeError},
    frame::SurfaceId,
    stream::{CodecId, PixelFormat, StreamDescriptor},
};

mod decoder;
mod encoder;
mod frame;
mod hw;
mod scaler;

pub use decoder::AvDecoder;
pub use encoder::AvEncoder;
pub use scaler::AvScaler;

pub(crate) fn codec_id(codec: CodecId) -> Option<ffmpeg_next::codec::Id> {
    use ffmpeg_next::codec::Id;
    match codec {
        CodecId::RawVideo => Some(Id::RAWVIDEO),
        CodecId::H264 => Some(Id::H264),
        CodecId::Hevc => Some(Id::HEVC),
        CodecId::Av1 => Some(Id::AV1),
        CodecId::Mjpeg => Some(Id::MJPEG),
        CodecId::Aac => Some(Id::AAC),
        CodecId::Unknown => None,
    }
}

pub(crate) fn pixel(format: PixelFormat) -> ffmpeg_next::format::Pixel {
    use ffmpeg_next::format::Pixel;
    match format {
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Vaapi => Pixel::VAAPI,
        PixelFormat::Qsv => Pixel::QSV,
        PixelFormat::Unknown => Pixel::None,
    }
}

pub(crate) fn pixel_format(format: ffmpeg_next::format::Pixel) -> PixelFormat {
    use ffmpeg_next::format::Pixel;
    match format {
        Pixel::RGBA => PixelFormat::Rgba,
        Pixel::BGRA => PixelFormat::Bgra,
        Pixel::RGB24 => PixelFormat::Rgb24,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::YUV420P => PixelFormat::Yuv420p,
        Pixel::VAAPI => PixelFormat::Vaapi,
        Pixel::QSV => PixelFormat::Qsv,
        _ => PixelFormat::Unknown,
    }
}

/// Maps a libav error. Device failures of hardware codecs surface as
/// [`TranscodeError::Hardware`] so the transcoder can restart its stages.
pub(crate) fn av_error(err: ffmpeg_next::Error, hardware: bool, what: &str) -> TranscodeError {
    let device_failure = matches!(
        err,
        ffmpeg_next::Error::External | ffmpeg_next::Error::Bug | ffmpeg_next::Error::Other { errno: ffmpeg_next::util::error::EIO }
    );
    if hardware && device_failure {
        TranscodeError::Hardware(format!("{}: {}", what, err))
    } else {
        TranscodeError::Transient(format!("{}: {}", what, err))
    }
}

/// A libav hardware device context.
struct AvDeviceContext {
    device: *mut ffi::AVBufferRef,
    format: PixelFormat,
}

// The device reference is only touched through libav's refcounting API.
unsafe impl Send for AvDeviceContext {}

impl AvDeviceContext {
    fn create(plugin: Plugin) -> Result<Self> {
        let kind = match plugin {
            Plugin::Vaapi => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            Plugin::Qsv => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
            Plugin::Software => {
                return Err(TranscodeError::ResourceExhausted(
                    "software plugin has no surface device".to_string(),
                ));
            }
        };
        let mut device: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe { ffi::av_hwdevice_ctx_create(&mut device, kind, ptr::null(), ptr::null_mut(), 0) };
        if ret < 0 || device.is_null() {
            return Err(TranscodeError::ResourceExhausted(format!(
                "{:?} device: {}",
                plugin,
                ffmpeg_next::Error::from(ret)
            )));
        }
        log::info!("{:?} device context created", plugin);
        Ok(Self {
            device,
            format: plugin.surface_format(),
        })
    }
}

impl Drop for AvDeviceContext {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.device) };
    }
}

impl SurfaceContext for AvDeviceContext {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn fallback_surface(&self) -> SurfaceId {
        SurfaceId(0)
    }
}

#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CodecBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn create_surface_context(&mut self, plugin: Plugin) -> Result<Box<dyn SurfaceContext>> {
        Ok(Box::new(AvDeviceContext::create(plugin)?))
    }

    fn open_decoder(
        &mut self,
        stream: &StreamDescriptor,
        _surfaces: Option<&dyn SurfaceContext>,
    ) -> Result<Box<dyn DecoderStage>> {
        Ok(Box::new(AvDecoder::new(stream)?))
    }

    fn open_filter(
        &mut self,
        src: &StreamDescriptor,
        sink: &StreamDescriptor,
        threads: u32,
    ) -> Result<Box<dyn FilterStage>> {
        Ok(Box::new(AvScaler::new(src, sink, threads)?))
    }

    fn open_encoder(
        &mut self,
        input: &StreamDescriptor,
        options: &EncoderOptions,
    ) -> Result<Box<dyn EncoderStage>> {
        Ok(Box::new(AvEncoder::new(input, options)?))
    }
}
