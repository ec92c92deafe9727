//! Real-time transcoding core for streaming rendered frames to remote clients.
//!
//! A renderer pushes frames into a [`source::FrameSource`]; a
//! [`transcoder::Transcoder`] paces them through a [`backend::CodecBackend`]
//! and writes the encoded stream to a [`sink::OutputSink`]. Encoder
//! parameters can be changed live through the transcoder's control methods.

/// Registers the media library when the `ffmpeg` backend is compiled in.
/// Call once at startup.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

#[cfg(not(feature = "ffmpeg"))]
pub fn init() -> anyhow::Result<()> {
    Ok(())
}

pub mod backend;
pub mod capture;
pub mod config;
pub mod directive;
pub mod error;
pub mod frame;
pub mod hwerror;
pub mod packet;
pub mod pacing;
pub mod params;
pub mod pool;
pub mod session;
pub mod sink;
pub mod skip;
pub mod source;
pub mod stats;
pub mod stream;
pub mod transcoder;

pub use error::{Result, TranscodeError};
