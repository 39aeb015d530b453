//! Full-agent voice providers.
//!
//! A provider owns one wire session per call (WebSocket today) and emits
//! [`ProviderEvent`]s towards the engine: audio bursts, transcripts, tool
//! calls, and lifecycle errors. Audio leaving a provider is canonicalized
//! to µ-law@8000 so the streaming manager sees one format regardless of
//! what the vendor actually produces.

pub mod deepgram;
pub mod local;

pub use deepgram::DeepgramProvider;
pub use local::LocalProvider;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ProviderResult;
use crate::stream::{AudioFormat, Encoding};

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    /// Provider-side correlation id, echoed back with the result.
    pub invocation_id: Option<String>,
}

/// Events a provider session emits towards the engine.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// One chunk of agent speech audio.
    AgentAudio {
        call_id: String,
        data: Bytes,
        format: AudioFormat,
    },
    /// The current audio burst is complete.
    AgentAudioDone { call_id: String },
    /// A transcript line for the conversation history.
    ConversationText {
        call_id: String,
        role: crate::session::Role,
        text: String,
    },
    /// The model requested one or more tool executions.
    ToolCall {
        call_id: String,
        calls: Vec<ToolInvocation>,
        /// Text the agent should speak alongside the tool execution.
        speak_text: Option<String>,
    },
    /// The farewell finished; the engine may hang up.
    HangupReady { call_id: String },
    /// Fatal provider-session error.
    Error { call_id: String, message: String },
}

/// Per-session lifecycle of a streaming voice-agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSessionState {
    #[default]
    Idle,
    Connecting,
    SettingsSent,
    /// Settings acknowledged, or the fallback readiness timer fired.
    Ready,
    /// Receiving a binary audio burst.
    StreamingBurst,
    /// Between bursts.
    StreamingSilent,
    Closing,
    Closed,
}

/// Channel used by providers to reach the engine.
pub type ProviderEventSender = mpsc::Sender<ProviderEvent>;

/// A monolithic voice agent (STT+LLM+TTS behind one wire protocol).
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Opens the wire session for a call.
    async fn start_session(&self, call_id: &str, context: Option<Value>) -> ProviderResult<()>;

    /// Feeds one inbound caller-audio frame.
    async fn send_audio(&self, chunk: Bytes);

    /// Asks the agent to speak the given text verbatim.
    async fn speak(&self, text: &str) -> ProviderResult<()>;

    /// Returns a tool-execution result to the provider's function-output
    /// channel, triggering a new response generation.
    async fn send_tool_result(
        &self,
        _invocation_id: Option<&str>,
        _tool_name: &str,
        _result: Value,
    ) -> ProviderResult<()> {
        Ok(())
    }

    /// Closes the wire session (or returns it to an idle pool).
    async fn stop_session(&self);

    /// Telephony codecs this provider can accept on its input leg.
    fn supported_codecs(&self) -> Vec<Encoding>;

    /// Configuration-consistency warnings for the current transport setup.
    fn describe_alignment(
        &self,
        audiosocket_format: Encoding,
        streaming_format: AudioFormat,
    ) -> Vec<String>;

    /// Whether the provider is configured well enough to take a call.
    fn is_ready(&self) -> bool;
}

/// Infers the actual inbound frame format from its canonical 20 ms size:
/// 160 B ≈ µ-law@8k, 320 B ≈ PCM16@8k, 640 B ≈ PCM16@16k. Returns `None`
/// for anything else (callers fall back to the declared config).
#[must_use]
pub fn detect_inbound_format(frame_len: usize) -> Option<AudioFormat> {
    match frame_len {
        160 => Some(AudioFormat::new(Encoding::Ulaw, 8000)),
        320 => Some(AudioFormat::new(Encoding::Slin16, 8000)),
        640 => Some(AudioFormat::new(Encoding::Slin16, 16000)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_format_detection_covers_canonical_sizes() {
        assert_eq!(
            detect_inbound_format(160),
            Some(AudioFormat::new(Encoding::Ulaw, 8000))
        );
        assert_eq!(
            detect_inbound_format(320),
            Some(AudioFormat::new(Encoding::Slin16, 8000))
        );
        assert_eq!(
            detect_inbound_format(640),
            Some(AudioFormat::new(Encoding::Slin16, 16000))
        );
        assert_eq!(detect_inbound_format(100), None);
        assert_eq!(detect_inbound_format(0), None);
    }
}
