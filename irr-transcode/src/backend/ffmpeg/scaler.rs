use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use ffmpeg_next::software::scaling;

use super::{
    frame::{from_av, to_av},
    pixel,
};
use crate::{
    backend::FilterStage,
    error::{Result, TranscodeError},
    frame::{CropRect, FrameData, VideoFrame},
    stream::{PixelFormat, StreamDescriptor},
};

struct Context(scaling::Context);

// Used only from the worker thread that owns the stage.
unsafe impl Send for Context {}

/// Crop plus swscale conversion to the encoder's size and pixel format.
pub struct AvScaler {
    src: StreamDescriptor,
    sink: StreamDescriptor,
    context: Option<((u32, u32, PixelFormat), Context)>,
    frames: VecDeque<VideoFrame>,
}

fn crop_packed(data: &Bytes, width: u32, bpp: usize, crop: CropRect) -> Bytes {
    let stride = width as usize * bpp;
    let row = (crop.right - crop.left) as usize * bpp;
    let mut out = BytesMut::with_capacity(row * (crop.bottom - crop.top) as usize);
    for y in crop.top as usize..crop.bottom as usize {
        let start = y * stride + crop.left as usize * bpp;
        out.extend_from_slice(&data[start..start + row]);
    }
    out.freeze()
}

impl AvScaler {
    pub fn new(src: &StreamDescriptor, sink: &StreamDescriptor, threads: u32) -> Result<Self> {
        if src.pixel_format.is_hardware() || sink.pixel_format.is_hardware() {
            return Err(TranscodeError::Transient(
                "hardware surfaces need a device filter".to_string(),
            ));
        }
        log::debug!(
            "libav scaler {}x{} {:?} -> {}x{} {:?} threads={}",
            src.width,
            src.height,
            src.pixel_format,
            sink.width,
            sink.height,
            sink.pixel_format,
            threads
        );
        Ok(Self {
            src: src.clone(),
            sink: sink.clone(),
            context: None,
            frames: VecDeque::new(),
        })
    }

    fn apply_crop(frame: &mut VideoFrame) {
        let Some(crop) = frame.crop.take() else {
            return;
        };
        let bpp = match frame.format {
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Rgb24 => frame.format.bytes_per_pixel(),
            _ => return,
        };
        let fits = crop.left < crop.right
            && crop.top < crop.bottom
            && crop.right <= frame.width
            && crop.bottom <= frame.height;
        if let (true, FrameData::Cpu(data)) = (fits, &frame.data) {
            let cropped = crop_packed(data, frame.width, bpp, crop);
            frame.data = FrameData::Cpu(cropped);
            frame.width = crop.right - crop.left;
            frame.height = crop.bottom - crop.top;
        }
    }

    fn scaler_for(&mut self, key: (u32, u32, PixelFormat)) -> Result<&mut scaling::Context> {
        let stale = self.context.as_ref().is_none_or(|(current, _)| *current != key);
        if stale {
            let context = scaling::Context::get(
                pixel(key.2),
                key.0,
                key.1,
                pixel(self.sink.pixel_format),
                self.sink.width,
                self.sink.height,
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| TranscodeError::Transient(format!("scaler: {}", e)))?;
            self.context = Some((key, Context(context)));
        }
        match self.context.as_mut() {
            Some((_, context)) => Ok(&mut context.0),
            None => Err(TranscodeError::Transient("scaler unavailable".to_string())),
        }
    }
}

impl FilterStage for AvScaler {
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
        Self::apply_crop(&mut frame);
        let side_data = std::mem::take(&mut frame.side_data);
        let input = to_av(&frame)?;
        let mut output = ffmpeg_next::frame::Video::empty();
        self.scaler_for((frame.width, frame.height, frame.format))?
            .run(&input, &mut output)
            .map_err(|e| TranscodeError::Transient(format!("scale: {}", e)))?;
        let mut scaled = from_av(&output)?;
        scaled.pts = frame.pts;
        scaled.side_data = side_data;
        self.frames.push_back(scaled);
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.pop_front())
    }
}
