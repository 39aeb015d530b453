//! Engine configuration model.
//!
//! All structures deserialize from the server's YAML file; every field has a
//! serde default so partial configs stay valid. Hot-reload semantics are
//! snapshot-based: in-flight calls keep the `Arc<Config>` they were admitted
//! with, new calls read the current one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stream::Encoding;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Provider definitions keyed by name ("deepgram", "local", …).
    pub providers: HashMap<String, ProviderConfig>,

    /// Composed STT/LLM/TTS pipelines keyed by name.
    pub pipelines: HashMap<String, PipelineEntry>,

    /// Pipeline selected for new calls when set.
    pub active_pipeline: Option<String>,

    /// Full-agent provider used when no pipeline applies.
    pub default_provider: Option<String>,

    pub streaming: StreamingSettings,
    pub audiosocket: AudioSocketSettings,
    pub rtp: RtpSettings,
    pub tools: ToolsSettings,
    pub ari: AriSettings,
    pub metrics: MetricsSettings,
}

/// A provider entry: a kind tag plus whatever options that kind understands.
///
/// Unknown keys are collected into `options` so adapter-specific settings
/// survive deserialization without a schema change here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,

    pub api_key: Option<String>,
    pub model: Option<String>,
    pub tts_model: Option<String>,
    pub prompt: Option<String>,
    pub greeting: Option<String>,

    pub input_encoding: Option<String>,
    pub input_sample_rate_hz: Option<u32>,
    pub output_encoding: Option<String>,
    pub output_sample_rate_hz: Option<u32>,

    /// WebSocket endpoint for socket-bridged providers.
    pub ws_url: Option<String>,
    /// Preferred over `ws_url` when both are set.
    pub base_url: Option<String>,
    pub connect_timeout_sec: Option<f64>,
    pub response_timeout_sec: Option<f64>,
    /// Send batching interval for socket-bridged providers.
    pub chunk_ms: Option<u64>,
    /// "full" or "stt" for hybrid pipelines with a cloud LLM.
    pub mode: Option<String>,

    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            enabled: true,
            api_key: None,
            model: None,
            tts_model: None,
            prompt: None,
            greeting: None,
            input_encoding: None,
            input_sample_rate_hz: None,
            output_encoding: None,
            output_sample_rate_hz: None,
            ws_url: None,
            base_url: None,
            connect_timeout_sec: None,
            response_timeout_sec: None,
            chunk_ms: None,
            mode: None,
            options: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// WebSocket URL preference: `base_url` wins over `ws_url`.
    pub fn effective_ws_url(&self) -> Option<&str> {
        self.base_url.as_deref().or(self.ws_url.as_deref())
    }
}

/// One composed pipeline: component keys of the form `<provider>_<role>`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineEntry {
    pub stt: String,
    pub llm: String,
    pub tts: String,
    pub options: PipelineOptions,
    /// Tool allowlist for calls on this pipeline. `None` allows all.
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineOptions {
    pub stt: HashMap<String, serde_json::Value>,
    pub llm: HashMap<String, serde_json::Value>,
    pub tts: HashMap<String, serde_json::Value>,
}

/// Egress PCM16 byte-order handling for the streaming manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EgressSwapMode {
    /// Probe the first egress frame and correct automatically.
    #[default]
    Auto,
    /// Always byte-swap PCM16 egress.
    ForceTrue,
    /// Never byte-swap, regardless of probe results.
    ForceFalse,
}

impl EgressSwapMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ForceTrue => "force_true",
            Self::ForceFalse => "force_false",
        }
    }
}

/// Streaming playback tuning (the `streaming:` config section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub sample_rate: u32,
    pub jitter_buffer_ms: u64,
    pub chunk_size_ms: u64,
    pub min_start_ms: u64,
    pub low_watermark_ms: u64,
    pub provider_grace_ms: u64,
    pub fallback_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// Greeting-specific warm-up override; 0 uses `min_start_ms`.
    pub greeting_min_start_ms: u64,
    pub egress_swap_mode: EgressSwapMode,
    pub egress_force_mulaw: bool,
    pub diag_enable_taps: bool,
    pub diag_pre_secs: u64,
    pub diag_post_secs: u64,
    pub diag_out_dir: String,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            jitter_buffer_ms: 50,
            chunk_size_ms: 20,
            min_start_ms: 120,
            low_watermark_ms: 80,
            provider_grace_ms: 500,
            fallback_timeout_ms: 4000,
            keepalive_interval_ms: 5000,
            connection_timeout_ms: 10_000,
            greeting_min_start_ms: 0,
            egress_swap_mode: EgressSwapMode::Auto,
            egress_force_mulaw: false,
            diag_enable_taps: false,
            diag_pre_secs: 2,
            diag_post_secs: 2,
            diag_out_dir: "/tmp/voicebridge-taps".to_string(),
        }
    }
}

/// AudioSocket transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSocketSettings {
    pub host: String,
    pub port: u16,
    pub format: Encoding,
    /// Debug: send outbound frames to every known connection for the call.
    pub broadcast_debug: bool,
}

impl Default for AudioSocketSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            format: Encoding::Ulaw,
            broadcast_debug: false,
        }
    }
}

/// External Media RTP transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtpSettings {
    pub host: String,
    /// Inclusive port range for per-call UDP sockets.
    pub port_range: PortRange,
    /// Asterisk-side codec: "ulaw" or "slin16".
    pub codec: String,
    /// Engine-side format delivered to providers.
    pub format: Encoding,
    /// Engine-side sample rate delivered to providers.
    pub sample_rate: u32,
    /// Drop packets from sources other than the first learned endpoint.
    pub lock_remote_endpoint: bool,
    pub allowed_remote_hosts: Option<Vec<String>>,
}

impl Default for RtpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port_range: PortRange {
                start: 18_000,
                end: 18_099,
            },
            codec: "ulaw".to_string(),
            format: Encoding::Slin16,
            sample_rate: 16_000,
            lock_remote_endpoint: true,
            allowed_remote_hosts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Normalized (start ≤ end) iterator bounds.
    #[must_use]
    pub fn normalized(self) -> (u16, u16) {
        if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        }
    }
}

/// Telephony-action tool settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSettings {
    /// Transfer destination catalog keyed by destination name.
    pub destinations: HashMap<String, DestinationConfig>,
    pub ai_identity: AiIdentity,
    pub transfer: TransferSettings,
    pub attended_transfer: AttendedTransferSettings,
    pub hangup_call: HangupSettings,
    pub request_transcript: RequestTranscriptSettings,
    pub leave_voicemail: VoicemailSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DestinationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub description: Option<String>,
    pub attended_allowed: bool,
    pub dial_string: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiIdentity {
    pub name: String,
    pub number: String,
}

impl Default for AiIdentity {
    fn default() -> Self {
        Self {
            name: "AI Agent".to_string(),
            number: "6789".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub enabled: bool,
    /// Channel technology used to build dial strings (e.g. "PJSIP").
    pub technology: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            technology: "PJSIP".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttendedTransferSettings {
    pub enabled: bool,
    pub dial_timeout_seconds: u64,
    pub moh_class: String,
    /// Message the AI speaks when the agent declines.
    pub declined_message: String,
}

impl Default for AttendedTransferSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dial_timeout_seconds: 30,
            moh_class: "default".to_string(),
            declined_message: "They're unavailable right now. Can I help with something else?"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HangupSettings {
    pub farewell_message: String,
}

impl Default for HangupSettings {
    fn default() -> Self {
        Self {
            farewell_message: "Thank you for calling. Goodbye!".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RequestTranscriptSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VoicemailSettings {
    pub enabled: bool,
    pub extension: Option<String>,
    /// Dialplan context entered via ARI `continue`.
    pub context: Option<String>,
}

/// ARI connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AriSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    /// Directory the fallback path writes µ-law files into; must be
    /// readable by Asterisk under `sound:` resolution.
    pub media_dir: String,
}

impl Default for AriSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088/ari".to_string(),
            username: "voicebridge".to_string(),
            password: String::new(),
            app_name: "voicebridge".to_string(),
            media_dir: "/var/lib/asterisk/sounds/voicebridge".to_string(),
        }
    }
}

/// Prometheus exposition settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:9321".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.streaming.chunk_size_ms, 20);
        assert_eq!(config.streaming.min_start_ms, 120);
        assert_eq!(config.rtp.codec, "ulaw");
        assert!(config.rtp.lock_remote_endpoint);
        assert_eq!(config.audiosocket.format, Encoding::Ulaw);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn provider_config_prefers_base_url() {
        let provider: ProviderConfig = serde_json::from_str(
            r#"{"type": "local", "ws_url": "ws://a", "base_url": "ws://b"}"#,
        )
        .unwrap();
        assert_eq!(provider.effective_ws_url(), Some("ws://b"));
    }

    #[test]
    fn provider_config_collects_unknown_keys() {
        let provider: ProviderConfig =
            serde_json::from_str(r#"{"type": "deepgram", "custom_knob": 3}"#).unwrap();
        assert_eq!(provider.options.get("custom_knob").unwrap(), &3);
    }

    #[test]
    fn egress_swap_mode_parses_snake_case() {
        let mode: EgressSwapMode = serde_json::from_str(r#""force_true""#).unwrap();
        assert_eq!(mode, EgressSwapMode::ForceTrue);
    }

    #[test]
    fn port_range_normalizes_reversed_bounds() {
        let range = PortRange {
            start: 200,
            end: 100,
        };
        assert_eq!(range.normalized(), (100, 200));
    }

    #[test]
    fn pipeline_entry_parses_components() {
        let entry: PipelineEntry = serde_json::from_str(
            r#"{"stt": "local_stt", "llm": "openai_llm", "tts": "deepgram_tts",
                "tools": ["transfer", "hangup_call"]}"#,
        )
        .unwrap();
        assert_eq!(entry.stt, "local_stt");
        assert_eq!(entry.tools.unwrap().len(), 2);
    }
}
