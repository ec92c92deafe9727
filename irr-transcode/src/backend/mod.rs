//! Contract between the transcoder and the media library doing the actual
//! decode, filter and encode work.
//!
//! Every stage is single-threaded and owned by the transcoder's worker. Stage
//! `write`/`push` with `None` starts draining; `read`/`pop` returns `Ok(None)`
//! when nothing is ready. Device failures are reported as
//! [`TranscodeError::Hardware`](crate::error::TranscodeError::Hardware).

use std::collections::BTreeMap;

use crate::{
    config::{Capabilities, Plugin},
    error::Result,
    frame::{SurfaceId, VideoFrame},
    packet::Packet,
    params::ProfileLevel,
    stream::{CodecId, PixelFormat, StreamDescriptor},
};

pub mod raw;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

/// Packet input of the pipeline.
pub trait Demux: Send + Sync {
    fn streams(&self) -> Vec<StreamDescriptor>;

    fn stream_info(&self, index: usize) -> Option<StreamDescriptor> {
        self.streams().into_iter().find(|s| s.index == index)
    }

    /// Blocks until the next packet; `EndOfStream` once the input is exhausted.
    fn read_packet(&self) -> Result<Packet>;

    /// Makes a blocked `read_packet` return promptly.
    fn interrupt(&self) {}

    fn close(&self) {}

    fn is_surface_backed(&self) -> bool {
        false
    }

    /// Nominal input rate in frames per second, zero if unknown.
    fn frame_rate(&self) -> u32 {
        0
    }

    fn render_paced(&self) -> bool {
        false
    }

    fn update_frame_rate(&self, _fps: u32) {}

    fn set_latency_stats(&self, _period: u32) {}
}

pub trait DecoderStage: Send {
    fn descriptor(&self) -> &StreamDescriptor;
    fn write(&mut self, packet: Option<Packet>) -> Result<()>;
    fn read(&mut self) -> Result<Option<VideoFrame>>;
}

pub trait FilterStage: Send {
    fn src_descriptor(&self) -> &StreamDescriptor;
    fn sink_descriptor(&self) -> &StreamDescriptor;
    fn push(&mut self, frame: Option<VideoFrame>) -> Result<()>;
    fn pop(&mut self) -> Result<Option<VideoFrame>>;
}

/// Encoder stage. Directives in a written frame's `side_data` are applied
/// before that frame is encoded.
pub trait EncoderStage: Send {
    fn descriptor(&self) -> &StreamDescriptor;
    fn write(&mut self, frame: Option<VideoFrame>) -> Result<()>;
    fn read(&mut self) -> Result<Option<Packet>>;
    fn encoded_frames(&self) -> u64;
}

/// Accelerator memory pool shared by decoder, filter and encoder.
pub trait SurfaceContext: Send {
    fn format(&self) -> PixelFormat;
    /// Surface substituted for frames that arrive with an invalid handle.
    fn fallback_surface(&self) -> SurfaceId;
}

#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub codec: CodecId,
    pub plugin: Plugin,
    pub capabilities: Capabilities,
    pub bitrate: u64,
    pub gop_size: u32,
    pub framerate: u32,
    pub low_power: bool,
    pub profile_level: Option<ProfileLevel>,
    /// Free-form `setOutputProperty` values applied at open time.
    pub properties: BTreeMap<String, String>,
}

pub trait CodecBackend: Send {
    fn name(&self) -> &'static str;

    fn create_surface_context(&mut self, plugin: Plugin) -> Result<Box<dyn SurfaceContext>>;

    fn open_decoder(
        &mut self,
        stream: &StreamDescriptor,
        surfaces: Option<&dyn SurfaceContext>,
    ) -> Result<Box<dyn DecoderStage>>;

    fn open_filter(
        &mut self,
        src: &StreamDescriptor,
        sink: &StreamDescriptor,
        threads: u32,
    ) -> Result<Box<dyn FilterStage>>;

    fn open_encoder(
        &mut self,
        input: &StreamDescriptor,
        options: &EncoderOptions,
    ) -> Result<Box<dyn EncoderStage>>;
}
