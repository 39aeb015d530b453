//! Local AI Server component adapters.
//!
//! The local server speaks a small JSON-over-WebSocket protocol: audio
//! batches go up as base64 PCM16, results come back as typed messages
//! (`stt_result`, `llm_response`, `tts_response`) with TTS audio either
//! base64-embedded or as a following binary frame. Each request here uses
//! a short-lived connection; the full-agent [`crate::providers::local`]
//! provider is the one that holds a persistent session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{Config, ProviderConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::pipeline::{
    ComponentAdapter, ComponentFactory, ComponentOptions, LlmComponent, LlmContext, SttComponent,
    TtsComponent,
};

/// Outbound TTS audio is re-chunked to this size (~400 ms of µ-law@8k) so
/// the jitter buffer sees a steady sequence instead of one huge buffer.
const TTS_CHUNK_BYTES: usize = 3200;

/// Connection parameters shared by the three adapters.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub ws_url: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl LocalEndpoint {
    pub fn from_provider(provider: &ProviderConfig) -> Option<Self> {
        let ws_url = provider.effective_ws_url()?.to_string();
        Some(Self {
            ws_url,
            connect_timeout: Duration::from_secs_f64(provider.connect_timeout_sec.unwrap_or(5.0)),
            response_timeout: Duration::from_secs_f64(
                provider.response_timeout_sec.unwrap_or(5.0),
            ),
        })
    }

    /// Sends one request and waits for the first message matching
    /// `expect_type` (or a binary frame when `accept_binary`).
    async fn request(
        &self,
        payload: Value,
        expect_type: &str,
        accept_binary: bool,
    ) -> ProviderResult<LocalReply> {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(&self.ws_url));
        let (mut ws, _) = connect
            .await
            .map_err(|_| ProviderError::Connect(format!("connect timeout to {}", self.ws_url)))?
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        ws.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| ProviderError::Closed(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let _ = ws.close(None).await;
                return Err(ProviderError::Protocol(format!(
                    "no '{expect_type}' reply within {:?}",
                    self.response_timeout
                )));
            }
            let message = tokio::time::timeout(remaining, ws.next()).await;
            match message {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|e| ProviderError::Protocol(e.to_string()))?;
                    if value.get("type").and_then(Value::as_str) == Some(expect_type) {
                        let _ = ws.close(None).await;
                        return Ok(LocalReply::Json(value));
                    }
                    // Unrelated server chatter; keep waiting.
                }
                Ok(Some(Ok(Message::Binary(data)))) if accept_binary => {
                    let _ = ws.close(None).await;
                    return Ok(LocalReply::Binary(Bytes::from(data)));
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(ProviderError::Closed(e.to_string())),
                Ok(None) => {
                    return Err(ProviderError::Closed(
                        "local server closed mid-request".into(),
                    ))
                }
                Err(_) => {
                    let _ = ws.close(None).await;
                    return Err(ProviderError::Protocol(format!(
                        "no '{expect_type}' reply within {:?}",
                        self.response_timeout
                    )));
                }
            }
        }
    }

    async fn probe(&self) -> ProviderResult<()> {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(&self.ws_url));
        let (mut ws, _) = connect
            .await
            .map_err(|_| ProviderError::Connect(format!("connect timeout to {}", self.ws_url)))?
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let _ = ws.close(None).await;
        Ok(())
    }
}

enum LocalReply {
    Json(Value),
    Binary(Bytes),
}

// ── STT ─────────────────────────────────────────────────────────────────

pub struct LocalSttAdapter {
    endpoint: LocalEndpoint,
}

#[async_trait]
impl SttComponent for LocalSttAdapter {
    async fn transcribe(
        &self,
        call_id: &str,
        audio_pcm16: &[u8],
        sample_rate_hz: u32,
        _options: &ComponentOptions,
    ) -> ProviderResult<String> {
        let payload = json!({
            "type": "audio",
            "data": base64::engine::general_purpose::STANDARD.encode(audio_pcm16),
            "rate": sample_rate_hz,
            "format": "pcm16le",
            "call_id": call_id,
            "mode": "stt",
        });
        match self.endpoint.request(payload, "stt_result", false).await? {
            LocalReply::Json(value) => Ok(value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()),
            LocalReply::Binary(_) => Err(ProviderError::Protocol(
                "unexpected binary reply to STT request".into(),
            )),
        }
    }

    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        self.endpoint.probe().await
    }
}

// ── LLM ─────────────────────────────────────────────────────────────────

pub struct LocalLlmAdapter {
    endpoint: LocalEndpoint,
}

#[async_trait]
impl LlmComponent for LocalLlmAdapter {
    async fn generate(
        &self,
        call_id: &str,
        transcript: &str,
        context: &LlmContext,
        _options: &ComponentOptions,
    ) -> ProviderResult<String> {
        let history: Vec<Value> = context
            .history
            .iter()
            .map(|turn| {
                json!({
                    "role": match turn.role {
                        crate::session::Role::User => "user",
                        crate::session::Role::Assistant => "assistant",
                        crate::session::Role::Tool => "tool",
                    },
                    "content": turn.content,
                })
            })
            .collect();
        let payload = json!({
            "type": "llm_request",
            "call_id": call_id,
            "text": transcript,
            "history": history,
            "system_prompt": context.system_prompt,
            "tool_results": context.tool_results,
        });
        match self.endpoint.request(payload, "llm_response", false).await? {
            LocalReply::Json(value) => Ok(value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()),
            LocalReply::Binary(_) => Err(ProviderError::Protocol(
                "unexpected binary reply to LLM request".into(),
            )),
        }
    }

    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        self.endpoint.probe().await
    }
}

// ── TTS ─────────────────────────────────────────────────────────────────

pub struct LocalTtsAdapter {
    endpoint: LocalEndpoint,
}

#[async_trait]
impl TtsComponent for LocalTtsAdapter {
    async fn synthesize(
        &self,
        call_id: &str,
        text: &str,
        _options: &ComponentOptions,
    ) -> ProviderResult<mpsc::Receiver<Bytes>> {
        let payload = json!({
            "type": "tts_request",
            "call_id": call_id,
            "text": text,
        });
        let reply = self.endpoint.request(payload, "tts_response", true).await?;
        let audio = match reply {
            LocalReply::Binary(data) => data,
            LocalReply::Json(value) => {
                let encoded = value
                    .get("audio_data")
                    .or_else(|| value.get("audio"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProviderError::Protocol("tts_response carried no audio".into())
                    })?;
                Bytes::from(
                    base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| ProviderError::Protocol(format!("bad tts base64: {e}")))?,
                )
            }
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in audio.chunks(TTS_CHUNK_BYTES) {
                if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn validate_connectivity(&self, _options: &ComponentOptions) -> ProviderResult<()> {
        self.endpoint.probe().await
    }
}

// ── Registration ────────────────────────────────────────────────────────

/// Registers `local_stt` / `local_llm` / `local_tts` factories when the
/// configuration carries a usable local provider.
pub fn register_local_factories(
    config: &Config,
    registry: &mut HashMap<String, ComponentFactory>,
) {
    let provider = config
        .providers
        .get("local")
        .or_else(|| {
            config.providers.iter().find_map(|(name, p)| {
                (name.starts_with("local_") || p.kind.eq_ignore_ascii_case("local")).then_some(p)
            })
        })
        .filter(|p| p.enabled);
    let Some(provider) = provider else {
        log::debug!("[Pipeline] Local adapters not registered - provider unavailable or disabled");
        return;
    };
    let Some(endpoint) = LocalEndpoint::from_provider(provider) else {
        log::warn!("[Pipeline] Local provider has no WebSocket URL; adapters not registered");
        return;
    };

    let stt_endpoint = endpoint.clone();
    registry.insert(
        "local_stt".to_string(),
        Arc::new(move |_key, _options| {
            ComponentAdapter::Stt(Arc::new(LocalSttAdapter {
                endpoint: stt_endpoint.clone(),
            }))
        }),
    );
    let llm_endpoint = endpoint.clone();
    registry.insert(
        "local_llm".to_string(),
        Arc::new(move |_key, _options| {
            ComponentAdapter::Llm(Arc::new(LocalLlmAdapter {
                endpoint: llm_endpoint.clone(),
            }))
        }),
    );
    let tts_endpoint = endpoint;
    registry.insert(
        "local_tts".to_string(),
        Arc::new(move |_key, _options| {
            ComponentAdapter::Tts(Arc::new(LocalTtsAdapter {
                endpoint: tts_endpoint.clone(),
            }))
        }),
    );
    log::info!("[Pipeline] Local adapters registered: local_stt, local_llm, local_tts");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with_url(url: &str) -> ProviderConfig {
        ProviderConfig {
            kind: "local".to_string(),
            ws_url: Some(url.to_string()),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn endpoint_prefers_base_url() {
        let mut provider = provider_with_url("ws://fallback:8765");
        provider.base_url = Some("ws://preferred:8765".to_string());
        let endpoint = LocalEndpoint::from_provider(&provider).unwrap();
        assert_eq!(endpoint.ws_url, "ws://preferred:8765");
    }

    #[test]
    fn registration_requires_url() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".into(), ProviderConfig::default());
        let mut registry = HashMap::new();
        register_local_factories(&config, &mut registry);
        assert!(registry.is_empty());
    }

    #[test]
    fn registration_covers_three_roles() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".into(), provider_with_url("ws://127.0.0.1:8765"));
        let mut registry = HashMap::new();
        register_local_factories(&config, &mut registry);
        assert_eq!(registry.len(), 3);
        assert!(registry.contains_key("local_stt"));
        assert!(registry.contains_key("local_llm"));
        assert!(registry.contains_key("local_tts"));
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let mut config = Config::default();
        let mut provider = provider_with_url("ws://127.0.0.1:8765");
        provider.enabled = false;
        config.providers.insert("local".into(), provider);
        let mut registry = HashMap::new();
        register_local_factories(&config, &mut registry);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stt_connectivity_failure_is_reported() {
        let adapter = LocalSttAdapter {
            endpoint: LocalEndpoint {
                ws_url: "ws://127.0.0.1:1/".to_string(),
                connect_timeout: Duration::from_millis(200),
                response_timeout: Duration::from_millis(200),
            },
        };
        let err = adapter
            .validate_connectivity(&ComponentOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Connect(_)));
    }
}
