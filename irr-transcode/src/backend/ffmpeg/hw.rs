//! Hardware encoder discovery.

use crate::{config::Plugin, stream::CodecId};

fn candidates(codec: CodecId) -> &'static [&'static str] {
    match codec {
        CodecId::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        CodecId::Hevc => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        CodecId::Av1 => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    }
}

pub(super) fn is_hardware_encoder(name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// First hardware encoder for `codec` present in the linked libavcodec,
/// trying the plugin's own encoder first. The software plugin never probes.
pub(super) fn find_hw_encoder(codec: CodecId, plugin: Plugin) -> Option<ffmpeg_next::Codec> {
    if plugin == Plugin::Software {
        return None;
    }
    let preferred = plugin.encoder_name(codec);
    std::iter::once(preferred.as_str())
        .chain(candidates(codec).iter().copied())
        .find_map(|name| {
            let found = ffmpeg_next::encoder::find_by_name(name);
            if found.is_some() {
                log::info!("found hardware encoder: {}", name);
            }
            found
        })
}

/// Software encoder name for `codec`.
pub(super) fn software_encoder(codec: CodecId) -> String {
    Plugin::Software.encoder_name(codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_names_are_recognised() {
        assert!(is_hardware_encoder("h264_vaapi"));
        assert!(is_hardware_encoder("hevc_qsv"));
        assert!(!is_hardware_encoder("libx264"));
        assert_eq!(software_encoder(CodecId::Hevc), "libx265");
    }
}
