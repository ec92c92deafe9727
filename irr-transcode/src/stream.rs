use serde::{Deserialize, Serialize};

/// A rational number, used for frame rates and time bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational(pub i32, pub i32);

impl Rational {
    /// Microsecond time base; every timestamp produced by the frame source uses it.
    pub const MICROS: Rational = Rational(1, 1_000_000);

    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Self(numerator, denominator)
    }

    pub fn numerator(&self) -> i32 {
        self.0
    }

    pub fn denominator(&self) -> i32 {
        self.1
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0 && self.1 > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.1 == 0 {
            0.0
        } else {
            self.0 as f64 / self.1 as f64
        }
    }

    pub fn invert(&self) -> Rational {
        Rational(self.1, self.0)
    }

    /// Converts `value` expressed in `from` units into `to` units, rounding to nearest.
    pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
        let num = value as i128 * from.0 as i128 * to.1 as i128;
        let den = from.1 as i128 * to.0 as i128;
        if den == 0 {
            return value;
        }
        let half = den.abs() / 2;
        let rounded = if (num >= 0) == (den > 0) {
            (num.abs() + half) / den.abs()
        } else {
            -((num.abs() + half) / den.abs())
        };
        rounded as i64
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Data,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    #[serde(rename = "rawvideo")]
    RawVideo,
    H264,
    Hevc,
    Av1,
    Mjpeg,
    Aac,
    Unknown,
}

impl CodecId {
    pub fn name(&self) -> &'static str {
        match self {
            CodecId::RawVideo => "rawvideo",
            CodecId::H264 => "h264",
            CodecId::Hevc => "hevc",
            CodecId::Av1 => "av1",
            CodecId::Mjpeg => "mjpeg",
            CodecId::Aac => "aac",
            CodecId::Unknown => "unknown",
        }
    }

    /// Parses codec names as they appear in stream urls and options
    /// (`irrv:264`, `hevc`, `h265`, ...).
    pub fn from_name(name: &str) -> CodecId {
        let name = name.trim().to_ascii_lowercase();
        let name = name.strip_prefix("irrv:").unwrap_or(&name);
        match name {
            "264" | "h264" | "avc" => CodecId::H264,
            "265" | "h265" | "hevc" => CodecId::Hevc,
            "av1" => CodecId::Av1,
            "mjpeg" => CodecId::Mjpeg,
            "rawvideo" => CodecId::RawVideo,
            "aac" => CodecId::Aac,
            _ => CodecId::Unknown,
        }
    }

    /// Smallest width/height the encoder accepts for this codec.
    pub fn min_dimension(&self) -> u32 {
        match self {
            CodecId::Hevc | CodecId::Av1 => 128,
            _ => 32,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            CodecId::Aac => MediaType::Audio,
            CodecId::Unknown => MediaType::Unknown,
            _ => MediaType::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgb24,
    Nv12,
    Yuv420p,
    /// Opaque accelerator surfaces.
    Vaapi,
    Qsv,
    Unknown,
}

impl PixelFormat {
    pub fn is_hardware(&self) -> bool {
        matches!(self, PixelFormat::Vaapi | PixelFormat::Qsv)
    }

    /// Bytes needed for one tightly packed image, zero for hardware surfaces.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => pixels * 4,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Nv12 | PixelFormat::Yuv420p => pixels * 3 / 2,
            _ => 0,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Nv12 | PixelFormat::Yuv420p => 1,
            _ => 0,
        }
    }
}

/// Describes one stream as seen by a single stage. Each stage derives its own
/// copy from its predecessor's.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Rational,
    pub time_base: Rational,
    pub bit_rate: u64,
}

impl StreamDescriptor {
    pub fn raw_video(width: u32, height: u32, pixel_format: PixelFormat, frame_rate: Rational) -> Self {
        Self {
            index: 0,
            media_type: MediaType::Video,
            codec: CodecId::RawVideo,
            width,
            height,
            pixel_format,
            frame_rate,
            time_base: Rational::MICROS,
            bit_rate: 0,
        }
    }

    /// Descriptor for an encoder's output: same geometry and timing as `input`
    /// but carrying `codec`.
    pub fn for_encoder_output(input: &StreamDescriptor, codec: CodecId) -> Self {
        Self {
            media_type: MediaType::Video,
            codec,
            ..input.clone()
        }
    }

    pub fn with_resolution(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    pub fn fps(&self) -> f64 {
        self.frame_rate.as_f64()
    }

    /// Nominal frame interval in microseconds, zero when the rate is unknown.
    pub fn frame_duration_us(&self) -> i64 {
        if !self.frame_rate.is_valid() {
            return 0;
        }
        1_000_000i64 * self.frame_rate.1 as i64 / self.frame_rate.0 as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_between_time_bases() {
        assert_eq!(Rational::rescale(1_000_000, Rational::MICROS, Rational(1, 90_000)), 90_000);
        assert_eq!(Rational::rescale(3, Rational(1, 30), Rational::MICROS), 100_000);
        assert_eq!(Rational::rescale(-3, Rational(1, 30), Rational::MICROS), -100_000);
    }

    #[test]
    fn codec_names() {
        assert_eq!(CodecId::from_name("irrv:264"), CodecId::H264);
        assert_eq!(CodecId::from_name("H265"), CodecId::Hevc);
        assert_eq!(CodecId::from_name("vp9"), CodecId::Unknown);
        assert_eq!(CodecId::Hevc.min_dimension(), 128);
        assert_eq!(CodecId::H264.min_dimension(), 32);
    }

    #[test]
    fn descriptor_geometry() {
        let desc = StreamDescriptor::raw_video(576, 960, PixelFormat::Rgba, Rational(30, 1));
        assert!(desc.is_portrait());
        assert_eq!(desc.frame_duration_us(), 33_333);
        let out = StreamDescriptor::for_encoder_output(&desc, CodecId::H264);
        assert_eq!(out.codec, CodecId::H264);
        assert_eq!(out.width, 576);
        assert_eq!(PixelFormat::Rgba.buffer_size(4, 2), 32);
        assert_eq!(PixelFormat::Nv12.buffer_size(4, 2), 12);
    }
}
