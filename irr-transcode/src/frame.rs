use std::fmt;

use bytes::Bytes;

use crate::{directive::Directive, stream::PixelFormat};

/// Handle to an accelerator-resident surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    pub const INVALID: SurfaceId = SurfaceId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

#[derive(Debug, Clone)]
pub enum FrameData {
    Cpu(Bytes),
    Surface(SurfaceId),
}

/// Offsets of the visible client area inside a decoded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// A decoded or filtered video picture.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: FrameData,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: Option<i64>,
    pub crop: Option<CropRect>,
    /// Directives to apply to the encoder before this frame.
    pub side_data: Vec<Directive>,
}

impl VideoFrame {
    pub fn cpu(data: Bytes, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: FrameData::Cpu(data),
            width,
            height,
            format,
            pts: None,
            crop: None,
            side_data: Vec::new(),
        }
    }

    pub fn surface(id: SurfaceId, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: FrameData::Surface(id),
            width,
            height,
            format,
            pts: None,
            crop: None,
            side_data: Vec::new(),
        }
    }

    pub fn cpu_data(&self) -> Option<&Bytes> {
        match &self.data {
            FrameData::Cpu(data) => Some(data),
            FrameData::Surface(_) => None,
        }
    }

    pub fn surface_id(&self) -> Option<SurfaceId> {
        match self.data {
            FrameData::Surface(id) => Some(id),
            FrameData::Cpu(_) => None,
        }
    }
}

impl fmt::Display for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VideoFrame {}x{} {:?} pts={:?}",
            self.width, self.height, self.format, self.pts
        )?;
        if let FrameData::Surface(id) = self.data {
            write!(f, " surface={}", id.0)?;
        }
        Ok(())
    }
}
