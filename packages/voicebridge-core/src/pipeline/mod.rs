//! Composed STT → LLM → TTS pipelines.
//!
//! A pipeline is declared in configuration as three component keys of the
//! form `<provider>_<role>`. The orchestrator resolves keys to adapters
//! through a factory registry; unresolved keys fall back to the wildcard
//! `*_<role>` placeholder, which fails loudly when invoked so that a
//! misconfiguration is detected on the first real call rather than
//! silently swallowed.

pub mod local;
pub mod orchestrator;

pub use orchestrator::{PipelineOrchestrator, PipelineResolution};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{ProviderError, ProviderResult};
use crate::session::HistoryTurn;

/// Component options as declared under `pipelines.<name>.options.<role>`.
pub type ComponentOptions = HashMap<String, Value>;

/// Context handed to the LLM for one generation turn.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    /// Rolling conversation history, oldest first.
    pub history: Vec<HistoryTurn>,
    /// Tool-result frames from the current turn, if any.
    pub tool_results: Vec<Value>,
    /// System prompt override for this call.
    pub system_prompt: Option<String>,
}

/// Speech-to-text component.
///
/// `transcribe` must be idempotent under replay of the same audio.
#[async_trait]
pub trait SttComponent: Send + Sync {
    async fn transcribe(
        &self,
        call_id: &str,
        audio_pcm16: &[u8],
        sample_rate_hz: u32,
        options: &ComponentOptions,
    ) -> ProviderResult<String>;

    /// Best-effort boot-time reachability check. Failure never removes the
    /// pipeline from service.
    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        Ok(())
    }

    async fn close_call(&self, _call_id: &str) {}

    async fn stop(&self) {}
}

/// Large-language-model component.
#[async_trait]
pub trait LlmComponent: Send + Sync {
    /// Generates the assistant reply for a transcript. The reply MAY embed
    /// tool invocations as `<tool_call>{…}</tool_call>` markers.
    async fn generate(
        &self,
        call_id: &str,
        transcript: &str,
        context: &LlmContext,
        options: &ComponentOptions,
    ) -> ProviderResult<String>;

    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        Ok(())
    }

    async fn close_call(&self, _call_id: &str) {}

    async fn stop(&self) {}
}

/// Text-to-speech component.
#[async_trait]
pub trait TtsComponent: Send + Sync {
    /// Synthesizes `text` into a finite, non-restartable chunk sequence.
    /// The receiver is fed straight into the streaming playback manager.
    async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        options: &ComponentOptions,
    ) -> ProviderResult<mpsc::Receiver<Bytes>>;

    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        Ok(())
    }

    async fn close_call(&self, _call_id: &str) {}

    async fn stop(&self) {}
}

/// A resolved adapter of any role.
#[derive(Clone)]
pub enum ComponentAdapter {
    Stt(Arc<dyn SttComponent>),
    Llm(Arc<dyn LlmComponent>),
    Tts(Arc<dyn TtsComponent>),
}

impl ComponentAdapter {
    #[must_use]
    pub const fn role(&self) -> ComponentRole {
        match self {
            Self::Stt(_) => ComponentRole::Stt,
            Self::Llm(_) => ComponentRole::Llm,
            Self::Tts(_) => ComponentRole::Tts,
        }
    }
}

/// The three pipeline roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    Stt,
    Llm,
    Tts,
}

impl ComponentRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }

    /// Extracts the role from a component key such as `local_stt`.
    pub fn from_key(component_key: &str) -> Option<Self> {
        match component_key.rsplit_once('_')?.1 {
            "stt" => Some(Self::Stt),
            "llm" => Some(Self::Llm),
            "tts" => Some(Self::Tts),
            _ => None,
        }
    }
}

/// Factory producing an adapter for a component key with its options.
pub type ComponentFactory =
    Arc<dyn Fn(&str, ComponentOptions) -> ComponentAdapter + Send + Sync>;

// ── Placeholders ────────────────────────────────────────────────────────

/// Placeholder adapter: resolves cleanly, fails on first use.
pub struct PlaceholderComponent {
    component_key: String,
}

impl PlaceholderComponent {
    pub fn new(component_key: impl Into<String>) -> Self {
        Self {
            component_key: component_key.into(),
        }
    }

    fn unimplemented(&self) -> ProviderError {
        ProviderError::NotConfigured(format!(
            "placeholder adapter '{}' is not implemented",
            self.component_key
        ))
    }
}

#[async_trait]
impl SttComponent for PlaceholderComponent {
    async fn transcribe(
        &self,
        _call_id: &str,
        _audio_pcm16: &[u8],
        _sample_rate_hz: u32,
        _options: &ComponentOptions,
    ) -> ProviderResult<String> {
        Err(self.unimplemented())
    }
}

#[async_trait]
impl LlmComponent for PlaceholderComponent {
    async fn generate(
        &self,
        _call_id: &str,
        _transcript: &str,
        _context: &LlmContext,
        _options: &ComponentOptions,
    ) -> ProviderResult<String> {
        Err(self.unimplemented())
    }
}

#[async_trait]
impl TtsComponent for PlaceholderComponent {
    async fn synthesize(
        &self,
        _call_id: &str,
        _text: &str,
        _options: &ComponentOptions,
    ) -> ProviderResult<mpsc::Receiver<Bytes>> {
        Err(self.unimplemented())
    }
}

/// Factory for a placeholder of the given role.
#[must_use]
pub fn placeholder_factory(role: ComponentRole) -> ComponentFactory {
    Arc::new(move |key: &str, _options: ComponentOptions| {
        let placeholder = Arc::new(PlaceholderComponent::new(key));
        match role {
            ComponentRole::Stt => ComponentAdapter::Stt(placeholder),
            ComponentRole::Llm => ComponentAdapter::Llm(placeholder),
            ComponentRole::Tts => ComponentAdapter::Tts(placeholder),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_extraction_from_keys() {
        assert_eq!(ComponentRole::from_key("local_stt"), Some(ComponentRole::Stt));
        assert_eq!(
            ComponentRole::from_key("openai_realtime_llm"),
            Some(ComponentRole::Llm)
        );
        assert_eq!(ComponentRole::from_key("deepgram_tts"), Some(ComponentRole::Tts));
        assert_eq!(ComponentRole::from_key("*_stt"), Some(ComponentRole::Stt));
        assert_eq!(ComponentRole::from_key("badkey"), None);
        assert_eq!(ComponentRole::from_key("local_vad"), None);
    }

    #[tokio::test]
    async fn placeholder_fails_loudly_when_invoked() {
        let factory = placeholder_factory(ComponentRole::Stt);
        let ComponentAdapter::Stt(stt) = factory("ghost_stt", ComponentOptions::new()) else {
            panic!("factory produced wrong role");
        };
        let err = stt
            .transcribe("c1", &[0u8; 320], 8000, &ComponentOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost_stt"));
    }

    #[tokio::test]
    async fn placeholder_validates_and_stops_quietly() {
        let factory = placeholder_factory(ComponentRole::Tts);
        let ComponentAdapter::Tts(tts) = factory("*_tts", ComponentOptions::new()) else {
            panic!("factory produced wrong role");
        };
        // Lifecycle calls tolerate placeholders.
        assert!(tts.validate_connectivity(&ComponentOptions::new()).await.is_ok());
        tts.close_call("c1").await;
        tts.stop().await;
    }
}
