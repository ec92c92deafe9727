use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder};

use crate::{
    config::DEFAULT_CAPTURE_QUALITY,
    error::{Result, TranscodeError},
    frame::{FrameData, VideoFrame},
    stream::PixelFormat,
};

/// Periodic JPEG snapshots of filtered frames.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    interval: u32,
    quality: u8,
    counter: u32,
}

impl ScreenCapture {
    pub fn new(interval: u32, quality: u8) -> Self {
        let quality = if (1..=100).contains(&quality) {
            quality
        } else {
            DEFAULT_CAPTURE_QUALITY
        };
        Self {
            interval,
            quality,
            counter: 0,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Counts one encoded frame; true every `interval` frames.
    pub fn due(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.counter += 1;
        if self.counter >= self.interval {
            self.counter = 0;
            true
        } else {
            false
        }
    }

    /// JPEG-encodes a CPU frame. Surfaces and planar formats yield `None`.
    pub fn encode(&self, frame: &VideoFrame) -> Result<Option<Bytes>> {
        let FrameData::Cpu(data) = &frame.data else {
            return Ok(None);
        };
        let color = match frame.format {
            PixelFormat::Rgba => ColorType::Rgba,
            PixelFormat::Bgra => ColorType::Bgra,
            PixelFormat::Rgb24 => ColorType::Rgb,
            _ => return Ok(None),
        };
        let (Ok(width), Ok(height)) = (u16::try_from(frame.width), u16::try_from(frame.height))
        else {
            return Err(TranscodeError::invalid(format!(
                "capture of {}x{} exceeds jpeg limits",
                frame.width, frame.height
            )));
        };
        let needed = frame.format.buffer_size(frame.width, frame.height);
        if data.len() < needed {
            return Err(TranscodeError::Transient(format!(
                "capture frame has {} bytes, expected {}",
                data.len(),
                needed
            )));
        }

        let mut jpeg = Vec::new();
        Encoder::new(&mut jpeg, self.quality)
            .encode(&data[..needed], width, height, color)
            .map_err(|e| anyhow::anyhow!("jpeg encode: {}", e))?;
        Ok(Some(Bytes::from(jpeg)))
    }
}
