//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use voicebridge_core::Config as CoreConfig;

/// Server configuration: the engine config plus server-only knobs.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The full engine configuration (providers, pipelines, streaming,
    /// transports, tools, ari, metrics).
    #[serde(flatten)]
    pub engine: CoreConfig,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("VOICEBRIDGE_ARI_URL") {
            self.engine.ari.base_url = value;
        }
        if let Ok(value) = std::env::var("VOICEBRIDGE_ARI_USERNAME") {
            self.engine.ari.username = value;
        }
        if let Ok(value) = std::env::var("VOICEBRIDGE_ARI_PASSWORD") {
            self.engine.ari.password = value;
        }
        if let Ok(value) = std::env::var("VOICEBRIDGE_METRICS_BIND") {
            self.engine.metrics.bind = value;
            self.engine.metrics.enabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.engine.streaming.chunk_size_ms, 20);
        assert!(config.engine.pipelines.is_empty());
    }

    #[test]
    fn yaml_round_trip_covers_nested_sections() {
        let yaml = r#"
default_provider: deepgram
providers:
  deepgram:
    type: deepgram
    api_key: dg-key
    model: nova-3
pipelines:
  default:
    stt: local_stt
    llm: local_llm
    tts: local_tts
    tools: [transfer, hangup_call]
active_pipeline: default
streaming:
  min_start_ms: 160
  egress_swap_mode: force_false
rtp:
  port_range: {start: 20000, end: 20100}
  lock_remote_endpoint: true
tools:
  attended_transfer:
    enabled: true
    dial_timeout_seconds: 25
  destinations:
    support_agent:
      type: extension
      target: "2002"
      attended_allowed: true
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.default_provider.as_deref(), Some("deepgram"));
        assert_eq!(config.engine.streaming.min_start_ms, 160);
        assert_eq!(config.engine.rtp.port_range.normalized(), (20000, 20100));
        assert!(config.engine.tools.attended_transfer.enabled);
        assert_eq!(
            config.engine.tools.destinations["support_agent"].target,
            "2002"
        );
        let pipeline = &config.engine.pipelines["default"];
        assert_eq!(pipeline.stt, "local_stt");
        assert_eq!(pipeline.tools.as_ref().unwrap().len(), 2);
    }
}
