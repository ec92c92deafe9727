use std::path::Path;

use irr_transcode::config::TranscoderConfig;
use serde::{Deserialize, Serialize};

/// Set to `1` to keep encoding while no client is connected.
pub const ENCODE_UNLIMIT_ENV: &str = "IRR_ENCODE_UNLIMIT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub listen: String,
    /// Rate of the built-in test pattern renderer.
    pub pattern_fps: u32,
    pub transcoder: TranscoderConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8554".to_string(),
            pattern_fps: 30,
            transcoder: TranscoderConfig::default(),
        }
    }
}

impl StreamerConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config: StreamerConfig = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
                serde_json::from_str(&text)?
            }
            None => StreamerConfig::default(),
        };
        if std::env::var(ENCODE_UNLIMIT_ENV).is_ok_and(|v| v == "1") {
            config.transcoder.encode_unconditionally = true;
        }
        config.transcoder.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StreamerConfig =
            serde_json::from_str(r#"{"listen":"127.0.0.1:9000","transcoder":{"bitrate":"2M"}}"#)
                .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.pattern_fps, 30);
        assert_eq!(config.transcoder.initial_bitrate().unwrap(), 2_000_000);
        assert_eq!(config.transcoder.gop_size, 120);
    }
}
