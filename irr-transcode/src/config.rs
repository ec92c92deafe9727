//! Transcoder options, supplied pre-parsed by the embedding application.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TranscodeError},
    hwerror::HwErrorLimits,
    params::{EncoderSettings, MAX_FRAMERATE, MAX_RESOLUTION},
    source::FrameSourceParams,
    stream::{CodecId, PixelFormat},
};

pub const DEFAULT_CAPTURE_QUALITY: u8 = 80;

/// Acceleration plugin used for surfaces and encoders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plugin {
    #[default]
    Software,
    Vaapi,
    Qsv,
}

impl Plugin {
    pub fn surface_format(&self) -> PixelFormat {
        match self {
            Plugin::Software => PixelFormat::Nv12,
            Plugin::Vaapi => PixelFormat::Vaapi,
            Plugin::Qsv => PixelFormat::Qsv,
        }
    }

    /// Library encoder name for `codec` under this plugin.
    pub fn encoder_name(&self, codec: CodecId) -> String {
        match (self, codec) {
            (Plugin::Software, CodecId::H264) => "libx264".to_string(),
            (Plugin::Software, CodecId::Hevc) => "libx265".to_string(),
            (Plugin::Software, CodecId::Av1) => "libaom-av1".to_string(),
            (Plugin::Vaapi, codec) => format!("{}_vaapi", codec.name()),
            (Plugin::Qsv, codec) => format!("{}_qsv", codec.name()),
            (Plugin::Software, codec) => codec.name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControlMode {
    Cqp,
    Cbr,
    Vbr,
}

/// What the encoder stack can do; components branch on these at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub hardware_surface_sharing: bool,
    pub rate_control: BTreeSet<RateControlMode>,
    pub roi_supported: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            hardware_surface_sharing: false,
            rate_control: [RateControlMode::Cqp, RateControlMode::Cbr, RateControlMode::Vbr]
                .into_iter()
                .collect(),
            roi_supported: true,
        }
    }
}

impl Capabilities {
    pub fn supports(&self, mode: RateControlMode) -> bool {
        self.rate_control.contains(&mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture every N encoded frames, zero disables.
    pub interval_frames: u32,
    pub quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_frames: 0,
            quality: DEFAULT_CAPTURE_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub codec: CodecId,
    pub plugin: Plugin,
    pub capabilities: Capabilities,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target bitrate with optional `K`/`M` suffix, e.g. `"4M"`.
    pub bitrate: String,
    pub gop_size: u32,
    pub profile: Option<String>,
    pub level: Option<String>,
    pub low_power: bool,
    pub output_options: BTreeMap<String, String>,
    pub filter_threads: u32,
    pub latency_optimization: bool,
    pub render_paced: bool,
    pub min_fps: u32,
    pub max_outstanding_frames: usize,
    pub skip_frame: bool,
    pub hw_error: HwErrorLimits,
    pub encode_unconditionally: bool,
    pub capture: CaptureConfig,
    pub latency_stats_period: u32,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecId::H264,
            plugin: Plugin::Software,
            capabilities: Capabilities::default(),
            width: 576,
            height: 960,
            framerate: 30,
            bitrate: "4M".to_string(),
            gop_size: 120,
            profile: None,
            level: None,
            low_power: false,
            output_options: BTreeMap::new(),
            filter_threads: 1,
            latency_optimization: true,
            render_paced: false,
            min_fps: 1,
            max_outstanding_frames: 5,
            skip_frame: false,
            hw_error: HwErrorLimits::default(),
            encode_unconditionally: false,
            capture: CaptureConfig::default(),
            latency_stats_period: 0,
        }
    }
}

/// Parses a bitrate such as `"4000000"`, `"500K"` or `"4M"` into bits per second.
pub fn parse_bitrate(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1_000),
        Some((i, 'm' | 'M')) => (&value[..i], 1_000_000),
        _ => (value, 1),
    };
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| (v * scale as f64).round() as u64)
        .ok_or_else(|| TranscodeError::invalid(format!("bitrate {:?} not understood", value)))
}

impl TranscoderConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.codec, CodecId::H264 | CodecId::Hevc | CodecId::Av1) {
            return Err(TranscodeError::invalid(format!(
                "codec {} not supported",
                self.codec.name()
            )));
        }
        let min = self.codec.min_dimension();
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(min..=MAX_RESOLUTION).contains(&value) {
                return Err(TranscodeError::invalid(format!(
                    "{} {} outside [{}, {}]",
                    name, value, min, MAX_RESOLUTION
                )));
            }
        }
        if self.framerate == 0 || self.framerate > MAX_FRAMERATE {
            return Err(TranscodeError::invalid(format!(
                "framerate {} outside [1, {}]",
                self.framerate, MAX_FRAMERATE
            )));
        }
        if self.gop_size == 0 {
            return Err(TranscodeError::invalid("gop size must be at least 1"));
        }
        if self.max_outstanding_frames == 0 {
            return Err(TranscodeError::invalid("max outstanding frames must be at least 1"));
        }
        self.initial_bitrate()?;
        Ok(())
    }

    pub fn initial_bitrate(&self) -> Result<u64> {
        if self.bitrate.is_empty() {
            return Ok(0);
        }
        parse_bitrate(&self.bitrate)
    }

    /// Capture quality clamped to 1..=100, falling back to the default.
    pub fn capture_quality(&self) -> u8 {
        match self.capture.quality {
            1..=100 => self.capture.quality,
            _ => DEFAULT_CAPTURE_QUALITY,
        }
    }

    pub fn source_params(&self) -> FrameSourceParams {
        let surface_backed = self.capabilities.hardware_surface_sharing;
        FrameSourceParams {
            width: self.width,
            height: self.height,
            pixel_format: if surface_backed {
                self.plugin.surface_format()
            } else {
                PixelFormat::Rgba
            },
            frame_rate: self.framerate,
            surface_backed,
            latency_optimization: self.latency_optimization,
            render_paced: self.render_paced,
            min_fps: self.min_fps,
            max_outstanding: self.max_outstanding_frames,
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            codec: self.codec,
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            bitrate: self.initial_bitrate().unwrap_or(0),
            gop_size: self.gop_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_suffixes() {
        assert_eq!(parse_bitrate("4M").unwrap(), 4_000_000);
        assert_eq!(parse_bitrate("500k").unwrap(), 500_000);
        assert_eq!(parse_bitrate("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_bitrate("2500000").unwrap(), 2_500_000);
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("-1M").is_err());
    }

    #[test]
    fn json_with_defaults() {
        let config: TranscoderConfig = serde_json::from_str(
            r#"{
                "codec": "hevc",
                "plugin": "vaapi",
                "width": 1280,
                "height": 720,
                "capabilities": { "rate_control": ["cbr"], "roi_supported": false },
                "hw_error": { "max_count": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.codec, CodecId::Hevc);
        assert_eq!(config.plugin, Plugin::Vaapi);
        assert_eq!(config.framerate, 30);
        assert!(config.capabilities.supports(RateControlMode::Cbr));
        assert!(!config.capabilities.supports(RateControlMode::Cqp));
        assert_eq!(config.hw_error.max_count, 3);
        assert_eq!(config.hw_error.burst_window_ms, 5_000);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_geometry() {
        let config = TranscoderConfig {
            codec: CodecId::Hevc,
            width: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = TranscoderConfig {
            gop_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn capture_quality_falls_back() {
        let mut config = TranscoderConfig::default();
        config.capture.quality = 0;
        assert_eq!(config.capture_quality(), 80);
        config.capture.quality = 101;
        assert_eq!(config.capture_quality(), 80);
        config.capture.quality = 55;
        assert_eq!(config.capture_quality(), 55);
    }

    #[test]
    fn encoder_names_follow_plugin() {
        assert_eq!(Plugin::Vaapi.encoder_name(CodecId::Hevc), "hevc_vaapi");
        assert_eq!(Plugin::Qsv.encoder_name(CodecId::H264), "h264_qsv");
        assert_eq!(Plugin::Software.encoder_name(CodecId::H264), "libx264");
    }
}
