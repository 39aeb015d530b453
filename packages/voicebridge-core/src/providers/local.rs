//! Local AI Server provider: a full agent bridged over one persistent
//! WebSocket.
//!
//! The local server runs STT → LLM → TTS on its side; this client batches
//! caller audio up as base64 PCM16@16k, and receives typed JSON replies
//! plus binary TTS audio. The connection survives across calls:
//! `stop_session` only discards queued audio, and the active call id is
//! kept until TTS playback completes so late agent audio still finds its
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::ari::RECONNECT_BACKOFF_SECS;
use crate::audio::{mulaw_to_pcm16le, resample};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::{ProviderEvent, ProviderEventSender, VoiceProvider};
use crate::session::Role;
use crate::stream::{AudioFormat, Encoding};
use crate::tools::parser::parse_response_with_tools;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Bound on the audio send queue; overflow drops the oldest frames
/// instead of back-pressuring the RTP receiver.
const SEND_QUEUE_FRAMES: usize = 200;

/// What the engine feeds into `send_audio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Mulaw8k,
    Pcm16At8k,
    Pcm16At16k,
}

impl InputMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mulaw8k" | "ulaw8k" | "mulaw" => Some(Self::Mulaw8k),
            "pcm16_8k" => Some(Self::Pcm16At8k),
            "pcm16_16k" => Some(Self::Pcm16At16k),
            _ => None,
        }
    }
}

/// Coalesces an audio batch into PCM16@16k for the wire.
fn batch_to_pcm16k(batch: &[Bytes], mode: InputMode) -> Vec<u8> {
    match mode {
        InputMode::Pcm16At16k => batch.concat(),
        InputMode::Pcm16At8k => {
            let pcm8k = batch.concat();
            resample(&pcm8k, 8000, 16_000, None).0
        }
        InputMode::Mulaw8k => {
            let mut pcm8k = Vec::new();
            for chunk in batch {
                pcm8k.extend_from_slice(&mulaw_to_pcm16le(chunk));
            }
            resample(&pcm8k, 8000, 16_000, None).0
        }
    }
}

struct LocalInner {
    events: ProviderEventSender,
    ws_url: String,
    connect_timeout: Duration,
    batch_interval: Duration,
    /// "full" (all-local) or "stt" (hybrid with a cloud LLM).
    server_mode: String,

    writer: tokio::sync::Mutex<Option<WsSink>>,
    connected: AtomicBool,
    discard_audio: AtomicBool,
    active_call_id: Mutex<Option<String>>,
    input_mode: Mutex<InputMode>,
    initial_greeting: Mutex<Option<String>>,

    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalInner {
    /// Connects with the shared backoff schedule, replacing the writer.
    /// Returns the new read half.
    async fn reconnect(self: &Arc<Self>) -> ProviderResult<WsSource> {
        let mut total_elapsed = 0u64;
        for (attempt, &delay) in RECONNECT_BACKOFF_SECS.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ProviderError::Closed("provider shutting down".into()));
            }
            if attempt == 0 {
                log::info!(
                    "[Local] Connecting to Local AI Server: url={} (server may be warming up models)",
                    self.ws_url
                );
            } else {
                log::info!(
                    "[Local] Reconnect attempt {}/{}: url={}, elapsed={total_elapsed}s",
                    attempt + 1,
                    RECONNECT_BACKOFF_SECS.len(),
                    self.ws_url,
                );
            }

            let connect = tokio::time::timeout(self.connect_timeout, connect_async(&self.ws_url));
            match connect.await {
                Ok(Ok((ws, _response))) => {
                    let (sink, source) = ws.split();
                    *self.writer.lock().await = Some(sink);
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("[Local] Connected to Local AI Server: elapsed={total_elapsed}s");
                    return Ok(source);
                }
                Ok(Err(e)) => {
                    log::debug!(
                        "[Local] Connection attempt {} failed (likely warmup): {e}",
                        attempt + 1
                    );
                }
                Err(_) => {
                    log::debug!("[Local] Connection attempt {} timed out", attempt + 1);
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(ProviderError::Closed("provider shutting down".into()));
                }
                () = tokio::time::sleep(Duration::from_secs(delay)) => {
                    total_elapsed += delay;
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        log::warn!(
            "[Local] Connection failed after all retries: attempts={}, total_elapsed={total_elapsed}s",
            RECONNECT_BACKOFF_SECS.len()
        );
        Err(ProviderError::Connect(format!(
            "Local AI Server unreachable after {total_elapsed}s of retries"
        )))
    }

    async fn send_text(&self, payload: &Value) -> ProviderResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ProviderError::Closed("not connected".into()));
        };
        sink.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                ProviderError::Closed(e.to_string())
            })
    }

    /// Routes one JSON message from the server into provider events.
    async fn handle_text_message(self: &Arc<Self>, text: &str) {
        let Ok(data) = serde_json::from_str::<Value>(text) else {
            log::warn!("[Local] Non-JSON text message from server");
            return;
        };
        let fallback_call = || self.active_call_id.lock().clone();
        let message_call = data
            .get("call_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(fallback_call);

        match data.get("type").and_then(Value::as_str).unwrap_or("") {
            "tts_response" => {
                let Some(call_id) = message_call else {
                    log::debug!("[Local] Dropping TTS audio - no active call to attribute");
                    return;
                };
                let Some(encoded) = data
                    .get("audio_data")
                    .or_else(|| data.get("audio"))
                    .and_then(Value::as_str)
                else {
                    return;
                };
                let Ok(audio) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                    log::warn!("[Local] Invalid base64 in tts_response");
                    return;
                };
                if audio.is_empty() {
                    return;
                }
                let _ = self
                    .events
                    .send(ProviderEvent::AgentAudio {
                        call_id: call_id.clone(),
                        data: Bytes::from(audio),
                        format: AudioFormat::ulaw_8k(),
                    })
                    .await;
                let _ = self
                    .events
                    .send(ProviderEvent::AgentAudioDone { call_id })
                    .await;
            }
            "stt_result" => {
                let text = data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let is_final = data.get("is_final").and_then(Value::as_bool).unwrap_or(true);
                if let (Some(call_id), false, true) = (message_call, text.is_empty(), is_final) {
                    let _ = self
                        .events
                        .send(ProviderEvent::ConversationText {
                            call_id,
                            role: Role::User,
                            text,
                        })
                        .await;
                }
            }
            "llm_response" => {
                let Some(call_id) = message_call else { return };
                let llm_text = data.get("text").and_then(Value::as_str).unwrap_or_default();
                let (clean_text, tool_calls) = parse_response_with_tools(llm_text);

                let spoken = if clean_text.is_empty() {
                    llm_text.to_string()
                } else {
                    clean_text.clone()
                };
                if !spoken.is_empty() {
                    let _ = self
                        .events
                        .send(ProviderEvent::ConversationText {
                            call_id: call_id.clone(),
                            role: Role::Assistant,
                            text: spoken,
                        })
                        .await;
                }
                if !tool_calls.is_empty() {
                    log::info!(
                        "[Local] Tool calls detected in LLM response: call={call_id}, tools={:?}",
                        tool_calls.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
                    );
                    let _ = self
                        .events
                        .send(ProviderEvent::ToolCall {
                            call_id,
                            calls: tool_calls,
                            speak_text: (!clean_text.is_empty()).then_some(clean_text),
                        })
                        .await;
                }
            }
            other => log::debug!("[Local] Unhandled message type '{other}'"),
        }
    }

    /// Receive loop with automatic reconnect on close.
    async fn receive_loop(self: Arc<Self>, mut source: WsSource) {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return,
                msg = source.next() => msg,
            };
            match message {
                Some(Ok(Message::Binary(data))) => {
                    let Some(call_id) = self.active_call_id.lock().clone() else {
                        log::debug!("[Local] Dropping AgentAudio - no active call");
                        continue;
                    };
                    let _ = self
                        .events
                        .send(ProviderEvent::AgentAudio {
                            call_id: call_id.clone(),
                            data: Bytes::from(data),
                            format: AudioFormat::ulaw_8k(),
                        })
                        .await;
                    // Each binary message is one complete utterance; the
                    // server does not interleave partial frames today.
                    let _ = self
                        .events
                        .send(ProviderEvent::AgentAudioDone { call_id })
                        .await;
                }
                Some(Ok(Message::Text(text))) => {
                    self.handle_text_message(&text).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    log::warn!("[Local] Connection closed; attempting reconnect");
                    match self.reconnect().await {
                        Ok(new_source) => {
                            source = new_source;
                            log::info!("[Local] Reconnected; receive loop restarted");
                        }
                        Err(e) => {
                            log::error!("[Local] Reconnect failed: {e}");
                            let call_id = self.active_call_id.lock().clone().unwrap_or_default();
                            let _ = self
                                .events
                                .send(ProviderEvent::Error {
                                    call_id,
                                    message: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[Local] Receive error: {e}");
                    self.connected.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Sender loop: coalesces queued frames into one batched audio
    /// message per interval.
    async fn sender_loop(self: Arc<Self>, mut audio_rx: mpsc::Receiver<Bytes>) {
        loop {
            let first = tokio::select! {
                () = self.cancel.cancelled() => return,
                chunk = audio_rx.recv() => chunk,
            };
            let Some(first) = first else { return };
            if self.discard_audio.load(Ordering::SeqCst) {
                continue;
            }

            let mut batch = vec![first];
            while let Ok(chunk) = audio_rx.try_recv() {
                batch.push(chunk);
            }

            let mode = *self.input_mode.lock();
            let pcm16k = batch_to_pcm16k(&batch, mode);
            let payload = json!({
                "type": "audio",
                "data": base64::engine::general_purpose::STANDARD.encode(&pcm16k),
                "rate": 16_000,
                "format": "pcm16le",
                "call_id": self.active_call_id.lock().clone(),
                "mode": self.server_mode,
            });
            if let Err(e) = self.send_text(&payload).await {
                log::warn!(
                    "[Local] Batch send failed ({} frames): {e}; reconnect pending",
                    batch.len()
                );
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.batch_interval) => {}
            }
        }
    }
}

/// Full-agent provider backed by the Local AI Server.
pub struct LocalProvider {
    inner: Arc<LocalInner>,
}

impl LocalProvider {
    pub fn new(config: ProviderConfig, events: ProviderEventSender) -> Self {
        let ws_url = config
            .effective_ws_url()
            .unwrap_or("ws://127.0.0.1:8765")
            .to_string();
        let (audio_tx, audio_rx) = mpsc::channel(SEND_QUEUE_FRAMES);
        Self {
            inner: Arc::new(LocalInner {
                events,
                ws_url,
                connect_timeout: Duration::from_secs_f64(
                    config.connect_timeout_sec.unwrap_or(5.0),
                ),
                batch_interval: Duration::from_millis(config.chunk_ms.unwrap_or(200).max(5)),
                server_mode: config.mode.clone().unwrap_or_else(|| "full".to_string()),
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                discard_audio: AtomicBool::new(false),
                active_call_id: Mutex::new(None),
                input_mode: Mutex::new(InputMode::default()),
                initial_greeting: Mutex::new(config.greeting.clone()),
                audio_tx,
                audio_rx: tokio::sync::Mutex::new(Some(audio_rx)),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_input_mode(&self, mode: InputMode) {
        *self.inner.input_mode.lock() = mode;
    }

    pub fn set_initial_greeting(&self, text: Option<&str>) {
        let value = text.map(str::trim).filter(|t| !t.is_empty());
        *self.inner.initial_greeting.lock() = value.map(str::to_string);
    }

    /// Asks the local server to synthesize and play the configured
    /// greeting for this call.
    pub async fn play_initial_greeting(&self, call_id: &str) -> ProviderResult<()> {
        let Some(greeting) = self.inner.initial_greeting.lock().clone() else {
            log::info!("[Local] No initial greeting configured; skipping: call={call_id}");
            return Ok(());
        };
        *self.inner.active_call_id.lock() = Some(call_id.to_string());
        self.inner
            .send_text(&json!({
                "type": "tts_request",
                "call_id": call_id,
                "text": greeting,
            }))
            .await?;
        log::info!("[Local] Greeting TTS request sent: call={call_id}");
        Ok(())
    }

    /// Clears the call attribution once TTS playback has fully drained.
    pub fn clear_active_call_id(&self) {
        *self.inner.active_call_id.lock() = None;
        log::debug!("[Local] Active call id cleared after TTS completion");
    }
}

#[async_trait]
impl VoiceProvider for LocalProvider {
    async fn start_session(&self, call_id: &str, _context: Option<Value>) -> ProviderResult<()> {
        self.inner.discard_audio.store(false, Ordering::SeqCst);
        *self.inner.active_call_id.lock() = Some(call_id.to_string());

        if self.inner.connected.load(Ordering::SeqCst) {
            log::debug!("[Local] Reusing existing connection: call={call_id}");
            return Ok(());
        }

        let source = self.inner.reconnect().await?;
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).receive_loop(source),
        ));
        if let Some(audio_rx) = self.inner.audio_rx.try_lock().ok().and_then(|mut g| g.take()) {
            tasks.push(tokio::spawn(
                Arc::clone(&self.inner).sender_loop(audio_rx),
            ));
        }
        Ok(())
    }

    async fn send_audio(&self, chunk: Bytes) {
        if chunk.is_empty() || self.inner.discard_audio.load(Ordering::SeqCst) {
            return;
        }
        // Drop on overflow rather than back-pressuring the media path.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.audio_tx.try_send(chunk) {
            log::debug!("[Local] Audio send queue full; frame dropped");
        }
    }

    async fn speak(&self, _text: &str) -> ProviderResult<()> {
        // This provider streams STT→LLM→TTS server-side; direct speech
        // injection is not part of its protocol.
        log::warn!("[Local] Direct speak() not supported; use the streaming pipeline");
        Ok(())
    }

    async fn send_tool_result(
        &self,
        invocation_id: Option<&str>,
        tool_name: &str,
        result: Value,
    ) -> ProviderResult<()> {
        let call_id = self.inner.active_call_id.lock().clone();
        self.inner
            .send_text(&json!({
                "type": "tool_result",
                "call_id": call_id,
                "id": invocation_id,
                "name": tool_name,
                "result": result,
            }))
            .await
    }

    async fn stop_session(&self) {
        // Keep the WebSocket and listener alive for the next call; only
        // stop feeding audio and discard what is queued.
        self.inner.discard_audio.store(true, Ordering::SeqCst);
        log::info!(
            "[Local] Session stopped; connection kept alive, call id preserved for TTS tail"
        );
    }

    fn supported_codecs(&self) -> Vec<Encoding> {
        vec![Encoding::Ulaw]
    }

    fn describe_alignment(
        &self,
        _audiosocket_format: Encoding,
        streaming_format: AudioFormat,
    ) -> Vec<String> {
        let mut issues = Vec::new();
        if streaming_format.encoding != Encoding::Ulaw || streaming_format.sample_rate != 8000 {
            issues.push(format!(
                "Local AI Server emits µ-law@8000 but streaming is configured for {}@{}.",
                streaming_format.encoding.as_str(),
                streaming_format.sample_rate
            ));
        }
        issues
    }

    fn is_ready(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Drop for LocalProvider {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
