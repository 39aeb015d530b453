//! Deepgram Voice Agent provider.
//!
//! One WebSocket session per call against the converse endpoint. The
//! session sends a Settings frame first, then streams caller audio up and
//! receives interleaved JSON control frames and binary agent audio. Any
//! JSON frame arriving mid-burst marks a burst boundary and is surfaced as
//! `AgentAudioDone`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::audio::{
    alaw_to_pcm16le, byteswap, mulaw_to_pcm16le, pcm16le_to_mulaw, probe_endianness, resample,
    rms, ResampleState,
};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use crate::providers::{
    detect_inbound_format, ProviderEvent, ProviderEventSender, ProviderSessionState,
    ToolInvocation, VoiceProvider,
};
use crate::session::Role;
use crate::stream::{AudioFormat, Encoding};

/// Voice Agent converse endpoint.
const AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
/// Fallback readiness timer: if no server frame acknowledges the settings
/// within this window, streaming starts anyway.
const READY_FALLBACK: Duration = Duration::from_millis(250);
/// Silence window before the greeting is injected a second time.
const GREETING_SILENCE_WINDOW: Duration = Duration::from_millis(1500);
/// Maximum greeting injections per session.
const GREETING_CAP: u8 = 2;
/// Pre-stream frames buffered until the session is ready (~200 ms).
const PRESTREAM_CAP: usize = 10;
/// Keepalive cadence while no audio is flowing.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ── Input normalization ─────────────────────────────────────────────────

/// Converts canonical inbound frames into the declared Deepgram input
/// format, carrying resampler state across frames.
struct InputNormalizer {
    declared: AudioFormat,
    resample_state: Option<ResampleState>,
    low_rms_warned: bool,
}

impl InputNormalizer {
    fn new(declared: AudioFormat) -> Self {
        Self {
            declared,
            resample_state: None,
            low_rms_warned: false,
        }
    }

    /// Returns the wire payload for one caller frame.
    fn convert(&mut self, chunk: &[u8]) -> Vec<u8> {
        let actual = detect_inbound_format(chunk.len()).unwrap_or(AudioFormat::new(
            if self.declared.encoding.is_g711() {
                Encoding::Ulaw
            } else {
                Encoding::Slin16
            },
            if self.declared.encoding.is_g711() {
                8000
            } else {
                self.declared.sample_rate
            },
        ));

        // Everything goes through PCM16 so the RMS check and resampling
        // see linear samples.
        let (pcm, src_rate) = match actual.encoding {
            Encoding::Ulaw => (mulaw_to_pcm16le(chunk), 8000),
            Encoding::Alaw => (alaw_to_pcm16le(chunk), 8000),
            Encoding::Slin16 => (chunk.to_vec(), actual.sample_rate),
        };

        let level = rms(&pcm);
        if level < 100 && !self.low_rms_warned {
            self.low_rms_warned = true;
            log::warn!(
                "[Deepgram] Low inbound RMS ({level}); possible codec mismatch: declared={}@{}, frame_bytes={}",
                self.declared.encoding.as_str(),
                self.declared.sample_rate,
                chunk.len(),
            );
        } else if level >= 100 {
            self.low_rms_warned = false;
        }

        let target_rate = self.declared.sample_rate.max(1);
        let resampled = if target_rate != src_rate {
            let (out, next) = resample(&pcm, src_rate, target_rate, self.resample_state);
            self.resample_state = next;
            out
        } else {
            self.resample_state = None;
            pcm
        };

        match self.declared.encoding {
            Encoding::Ulaw | Encoding::Alaw => pcm16le_to_mulaw(&resampled),
            Encoding::Slin16 => resampled,
        }
    }
}

// ── Output normalization ────────────────────────────────────────────────

/// Canonicalizes provider audio to µ-law@8000 for the streaming manager.
struct OutputNormalizer {
    declared: AudioFormat,
    /// Operator opt-in: re-detect the actual G.711 law / byte order even
    /// when the configured output format is known.
    autodetect: bool,
    endian_checked: bool,
    swap: bool,
    law_checked: bool,
    law: Encoding,
    resample_state: Option<ResampleState>,
}

impl OutputNormalizer {
    fn new(declared: AudioFormat, autodetect: bool) -> Self {
        Self {
            declared,
            autodetect,
            endian_checked: false,
            swap: false,
            law_checked: false,
            law: declared.encoding,
            resample_state: None,
        }
    }

    fn convert(&mut self, chunk: &[u8]) -> Vec<u8> {
        match self.declared.encoding {
            Encoding::Slin16 => {
                // PCM16 at any rate: probe byte order once, resample to
                // 8 kHz, compand.
                if !self.endian_checked {
                    self.endian_checked = true;
                    self.swap = probe_endianness(chunk);
                    if self.swap {
                        log::warn!("[Deepgram] Output PCM16 arrived byte-swapped; correcting");
                    }
                }
                let pcm = if self.swap {
                    byteswap(chunk)
                } else {
                    chunk.to_vec()
                };
                let pcm_8k = if self.declared.sample_rate != 8000 {
                    let (out, next) =
                        resample(&pcm, self.declared.sample_rate, 8000, self.resample_state);
                    self.resample_state = next;
                    out
                } else {
                    pcm
                };
                pcm16le_to_mulaw(&pcm_8k)
            }
            Encoding::Ulaw | Encoding::Alaw => {
                // G.711: optionally probe which law the bytes really are.
                // Decoding with the wrong law inflates RMS (µ-law silence
                // 0xFF decodes loud under A-law), so the quieter decode
                // wins.
                if self.autodetect && !self.law_checked {
                    self.law_checked = true;
                    let window = &chunk[..chunk.len().min(960)];
                    let as_ulaw = rms(&mulaw_to_pcm16le(window));
                    let as_alaw = rms(&alaw_to_pcm16le(window));
                    self.law = if as_alaw < as_ulaw / 2 {
                        Encoding::Alaw
                    } else if as_ulaw < as_alaw / 2 {
                        Encoding::Ulaw
                    } else {
                        self.declared.encoding
                    };
                    if self.law != self.declared.encoding {
                        log::warn!(
                            "[Deepgram] Output G.711 law corrected: declared={}, detected={}",
                            self.declared.encoding.as_str(),
                            self.law.as_str(),
                        );
                    }
                }
                match self.law {
                    Encoding::Ulaw => chunk.to_vec(),
                    Encoding::Alaw => pcm16le_to_mulaw(&alaw_to_pcm16le(chunk)),
                    Encoding::Slin16 => pcm16le_to_mulaw(chunk),
                }
            }
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────────

struct Inner {
    config: ProviderConfig,
    events: ProviderEventSender,

    state: Mutex<ProviderSessionState>,
    call_id: Mutex<Option<String>>,
    request_id: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,

    ready_to_stream: AtomicBool,
    in_audio_burst: AtomicBool,
    audio_flowing: AtomicBool,
    burst_observed: AtomicBool,
    first_output_logged: AtomicBool,
    greeting_injections: AtomicU8,
    closing: AtomicBool,

    prestream: Mutex<VecDeque<Bytes>>,
    input: Mutex<InputNormalizer>,
    output: Mutex<OutputNormalizer>,

    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Deepgram Voice Agent session client.
pub struct DeepgramProvider {
    inner: Arc<Inner>,
}

impl DeepgramProvider {
    pub fn new(config: ProviderConfig, events: ProviderEventSender) -> Self {
        let input_format = AudioFormat::new(
            config
                .input_encoding
                .as_deref()
                .and_then(Encoding::parse)
                .unwrap_or(Encoding::Slin16),
            config.input_sample_rate_hz.unwrap_or(8000),
        );
        let output_format = AudioFormat::new(
            config
                .output_encoding
                .as_deref()
                .and_then(Encoding::parse)
                .unwrap_or(Encoding::Ulaw),
            config.output_sample_rate_hz.unwrap_or(8000),
        );
        let autodetect = config
            .options
            .get("output_autodetect")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            inner: Arc::new(Inner {
                config,
                events,
                state: Mutex::new(ProviderSessionState::Idle),
                call_id: Mutex::new(None),
                request_id: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                ready_to_stream: AtomicBool::new(false),
                in_audio_burst: AtomicBool::new(false),
                audio_flowing: AtomicBool::new(false),
                burst_observed: AtomicBool::new(false),
                first_output_logged: AtomicBool::new(false),
                greeting_injections: AtomicU8::new(0),
                closing: AtomicBool::new(false),
                prestream: Mutex::new(VecDeque::new()),
                input: Mutex::new(InputNormalizer::new(input_format)),
                output: Mutex::new(OutputNormalizer::new(output_format, autodetect)),
                cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session_state(&self) -> ProviderSessionState {
        *self.inner.state.lock()
    }

    /// Request id captured from the connection handshake.
    pub fn request_id(&self) -> Option<String> {
        self.inner.request_id.lock().clone()
    }

    /// The V1 Settings frame: audio formats plus the listen/think/speak
    /// agent configuration. Greeting precedence: provider override, then
    /// a safe default.
    fn build_settings(config: &ProviderConfig) -> Value {
        let input_encoding = config.input_encoding.as_deref().unwrap_or("linear16");
        let input_rate = config.input_sample_rate_hz.unwrap_or(8000);
        let output_encoding = config.output_encoding.as_deref().unwrap_or("mulaw");
        let output_rate = config.output_sample_rate_hz.unwrap_or(8000);
        let greeting = config
            .greeting
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .unwrap_or("Hello, how can I help you today?");
        let think_model = config
            .options
            .get("think_model")
            .and_then(Value::as_str)
            .unwrap_or("gpt-4o-mini");

        json!({
            "type": "Settings",
            "audio": {
                "input": {"encoding": input_encoding, "sample_rate": input_rate},
                "output": {"encoding": output_encoding, "sample_rate": output_rate, "container": "none"},
            },
            "agent": {
                "greeting": greeting,
                "language": "en",
                "listen": {"provider": {"type": "deepgram", "model": config.model, "smart_format": true}},
                "think": {"provider": {"type": "open_ai", "model": think_model}, "prompt": config.prompt},
                "speak": {"provider": {"type": "deepgram", "model": config.tts_model}},
            },
        })
    }

    async fn send_json(&self, value: &Value) -> ProviderResult<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ProviderError::Closed("no active session".into()));
        };
        sink.send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| ProviderError::Closed(e.to_string()))
    }

    async fn send_binary(&self, payload: Vec<u8>) -> ProviderResult<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ProviderError::Closed("no active session".into()));
        };
        sink.send(Message::Binary(payload.into()))
            .await
            .map_err(|e| ProviderError::Closed(e.to_string()))
    }

    /// Injects the greeting, bounded by [`GREETING_CAP`] per session.
    async fn inject_greeting(&self) {
        let Some(greeting) = self
            .inner
            .config
            .greeting
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
        else {
            return;
        };
        let count = self.inner.greeting_injections.fetch_add(1, Ordering::SeqCst);
        if count >= GREETING_CAP {
            self.inner.greeting_injections.store(GREETING_CAP, Ordering::SeqCst);
            return;
        }
        if let Err(e) = self.speak(greeting).await {
            log::warn!("[Deepgram] Greeting injection failed: {e}");
        } else {
            log::info!("[Deepgram] Greeting injected (attempt {})", count + 1);
        }
    }

    async fn receive_loop(inner: Arc<Inner>, mut source: WsSource, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                msg = source.next() => msg,
            };
            let Some(message) = message else { break };
            match message {
                Ok(Message::Text(text)) => {
                    inner.ready_to_stream.store(true, Ordering::SeqCst);
                    let call_id = inner.call_id.lock().clone().unwrap_or_default();

                    // Any JSON frame mid-burst is a burst boundary.
                    if inner.in_audio_burst.swap(false, Ordering::SeqCst) {
                        *inner.state.lock() = ProviderSessionState::StreamingSilent;
                        let _ = inner
                            .events
                            .send(ProviderEvent::AgentAudioDone {
                                call_id: call_id.clone(),
                            })
                            .await;
                    }

                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        log::error!("[Deepgram] Failed to parse JSON message");
                        continue;
                    };
                    Self::route_control_frame(&inner, &call_id, &value).await;
                }
                Ok(Message::Binary(data)) => {
                    inner.ready_to_stream.store(true, Ordering::SeqCst);
                    inner.burst_observed.store(true, Ordering::SeqCst);
                    inner.in_audio_burst.store(true, Ordering::SeqCst);
                    *inner.state.lock() = ProviderSessionState::StreamingBurst;

                    let call_id = inner.call_id.lock().clone().unwrap_or_default();
                    let mulaw = inner.output.lock().convert(&data);
                    if !inner.first_output_logged.swap(true, Ordering::SeqCst) {
                        log::info!(
                            "[Deepgram] First agent audio chunk: call={call_id}, wire_bytes={}, canonical_bytes={}",
                            data.len(),
                            mulaw.len(),
                        );
                    }
                    let _ = inner
                        .events
                        .send(ProviderEvent::AgentAudio {
                            call_id,
                            data: Bytes::from(mulaw),
                            format: AudioFormat::ulaw_8k(),
                        })
                        .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    if !inner.closing.load(Ordering::SeqCst) {
                        log::warn!("[Deepgram] Connection error: {e}");
                    }
                    break;
                }
            }
        }

        // A socket ending mid-burst still closes the burst cleanly, and an
        // unexpected close is fatal to the provider session.
        let call_id = inner.call_id.lock().clone().unwrap_or_default();
        if inner.in_audio_burst.swap(false, Ordering::SeqCst) {
            let _ = inner
                .events
                .send(ProviderEvent::AgentAudioDone {
                    call_id: call_id.clone(),
                })
                .await;
        }
        if !inner.closing.load(Ordering::SeqCst) {
            let _ = inner
                .events
                .send(ProviderEvent::Error {
                    call_id,
                    message: "Deepgram session closed unexpectedly".to_string(),
                })
                .await;
        }
        *inner.state.lock() = ProviderSessionState::Closed;
    }

    async fn route_control_frame(inner: &Arc<Inner>, call_id: &str, value: &Value) {
        match value.get("type").and_then(Value::as_str).unwrap_or("") {
            "Welcome" | "SettingsApplied" => {
                *inner.state.lock() = ProviderSessionState::Ready;
                if let Some(id) = value.get("request_id").and_then(Value::as_str) {
                    *inner.request_id.lock() = Some(id.to_string());
                    log::info!("[Deepgram] Session acknowledged: request_id={id}");
                }
            }
            "ConversationText" => {
                let role = match value.get("role").and_then(Value::as_str) {
                    Some("assistant") => Role::Assistant,
                    _ => Role::User,
                };
                let text = value
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !text.is_empty() {
                    let _ = inner
                        .events
                        .send(ProviderEvent::ConversationText {
                            call_id: call_id.to_string(),
                            role,
                            text,
                        })
                        .await;
                }
            }
            "FunctionCallRequest" => {
                let calls: Vec<ToolInvocation> = value
                    .get("functions")
                    .and_then(Value::as_array)
                    .map(|functions| {
                        functions
                            .iter()
                            .filter_map(|f| {
                                let name = f.get("name")?.as_str()?.to_string();
                                let arguments = match f.get("arguments") {
                                    Some(Value::String(raw)) => {
                                        serde_json::from_str(raw).unwrap_or(Value::Null)
                                    }
                                    Some(other) => other.clone(),
                                    None => Value::Null,
                                };
                                Some(ToolInvocation {
                                    name,
                                    arguments,
                                    invocation_id: f
                                        .get("id")
                                        .and_then(Value::as_str)
                                        .map(str::to_string),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if !calls.is_empty() {
                    let _ = inner
                        .events
                        .send(ProviderEvent::ToolCall {
                            call_id: call_id.to_string(),
                            calls,
                            speak_text: None,
                        })
                        .await;
                }
            }
            "AgentAudioDone" => {
                let _ = inner
                    .events
                    .send(ProviderEvent::AgentAudioDone {
                        call_id: call_id.to_string(),
                    })
                    .await;
            }
            "Error" => {
                let message = value
                    .get("description")
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified provider error")
                    .to_string();
                log::error!("[Deepgram] Provider error frame: call={call_id}, {message}");
                let _ = inner
                    .events
                    .send(ProviderEvent::Error {
                        call_id: call_id.to_string(),
                        message,
                    })
                    .await;
            }
            "Warning" => {
                log::warn!("[Deepgram] Provider warning frame: call={call_id}, {value}");
            }
            other => log::debug!("[Deepgram] Unhandled control frame '{other}'"),
        }
    }

    async fn keepalive_loop(inner: Arc<Inner>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
            }
            if !inner.audio_flowing.swap(false, Ordering::SeqCst) {
                let mut writer = inner.writer.lock().await;
                let Some(sink) = writer.as_mut() else { return };
                if sink
                    .send(Message::Text(
                        json!({"type": "KeepAlive"}).to_string().into(),
                    ))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl VoiceProvider for DeepgramProvider {
    async fn start_session(&self, call_id: &str, _context: Option<Value>) -> ProviderResult<()> {
        let api_key = self
            .inner
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::NotConfigured("deepgram.api_key missing".into()))?;

        *self.inner.state.lock() = ProviderSessionState::Connecting;
        let mut request = AGENT_URL
            .into_client_request()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {api_key}")
                .parse()
                .map_err(|_| ProviderError::Auth("api key is not header-safe".into()))?,
        );

        log::info!("[Deepgram] Connecting to Voice Agent: call={call_id}");
        let (ws, response) = connect_async(request).await.map_err(|e| {
            *self.inner.state.lock() = ProviderSessionState::Closed;
            ProviderError::Connect(e.to_string())
        })?;
        if let Some(id) = response
            .headers()
            .get("dg-request-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.inner.request_id.lock() = Some(id.to_string());
            log::info!("[Deepgram] Connected: call={call_id}, request_id={id}");
        } else {
            log::info!("[Deepgram] Connected: call={call_id}");
        }

        let (sink, source) = ws.split();
        *self.inner.writer.lock().await = Some(sink);
        *self.inner.call_id.lock() = Some(call_id.to_string());
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.ready_to_stream.store(false, Ordering::SeqCst);
        self.inner.burst_observed.store(false, Ordering::SeqCst);
        self.inner.greeting_injections.store(0, Ordering::SeqCst);

        let settings = Self::build_settings(&self.inner.config);
        self.send_json(&settings).await?;
        *self.inner.state.lock() = ProviderSessionState::SettingsSent;
        log::info!(
            "[Deepgram] Agent configured: call={call_id}, input={}@{}, output={}@{}",
            settings["audio"]["input"]["encoding"],
            settings["audio"]["input"]["sample_rate"],
            settings["audio"]["output"]["encoding"],
            settings["audio"]["output"]["sample_rate"],
        );
        // The Settings greeting counts as the first injection.
        self.inner.greeting_injections.store(1, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(Self::receive_loop(
            Arc::clone(&self.inner),
            source,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Self::keepalive_loop(
            Arc::clone(&self.inner),
            cancel.clone(),
        )));

        // Fallback readiness: stream even when no ack arrives in time.
        let ready_inner = Arc::clone(&self.inner);
        let ready_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                () = ready_cancel.cancelled() => {}
                () = tokio::time::sleep(READY_FALLBACK) => {
                    if !ready_inner.ready_to_stream.swap(true, Ordering::SeqCst) {
                        log::debug!("[Deepgram] Readiness fallback timer fired");
                        let mut state = ready_inner.state.lock();
                        if *state == ProviderSessionState::SettingsSent {
                            *state = ProviderSessionState::Ready;
                        }
                    }
                }
            }
        }));

        // Re-inject the greeting once if the agent stays silent.
        let provider = Self {
            inner: Arc::clone(&self.inner),
        };
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(GREETING_SILENCE_WINDOW) => {
                    if !provider.inner.burst_observed.load(Ordering::SeqCst) {
                        log::info!("[Deepgram] No audio burst observed; re-injecting greeting");
                        provider.inject_greeting().await;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn send_audio(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.inner.audio_flowing.store(true, Ordering::SeqCst);
        let payload = self.inner.input.lock().convert(&chunk);

        if !self.inner.ready_to_stream.load(Ordering::SeqCst) {
            let mut prestream = self.inner.prestream.lock();
            prestream.push_back(Bytes::from(payload));
            while prestream.len() > PRESTREAM_CAP {
                prestream.pop_front();
            }
            return;
        }

        // Flush frames buffered before readiness, in order.
        let queued: Vec<Bytes> = self.inner.prestream.lock().drain(..).collect();
        for frame in queued {
            if let Err(e) = self.send_binary(frame.to_vec()).await {
                log::debug!("[Deepgram] Prestream flush failed: {e}");
                return;
            }
        }
        if let Err(e) = self.send_binary(payload).await {
            log::debug!("[Deepgram] Audio send failed: {e}");
        }
    }

    async fn speak(&self, text: &str) -> ProviderResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.send_json(&json!({"type": "InjectAgentMessage", "message": text}))
            .await
    }

    async fn send_tool_result(
        &self,
        invocation_id: Option<&str>,
        tool_name: &str,
        result: Value,
    ) -> ProviderResult<()> {
        self.send_json(&json!({
            "type": "FunctionCallResponse",
            "id": invocation_id,
            "name": tool_name,
            "content": result.to_string(),
        }))
        .await
    }

    async fn stop_session(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state.lock() = ProviderSessionState::Closing;
        self.inner.cancel.lock().cancel();

        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
        *self.inner.state.lock() = ProviderSessionState::Closed;
        *self.inner.call_id.lock() = None;
        self.inner.prestream.lock().clear();
        log::info!("[Deepgram] Disconnected from Voice Agent");
    }

    fn supported_codecs(&self) -> Vec<Encoding> {
        vec![Encoding::Ulaw]
    }

    fn describe_alignment(
        &self,
        audiosocket_format: Encoding,
        streaming_format: AudioFormat,
    ) -> Vec<String> {
        let mut issues = Vec::new();
        let declared = self
            .inner
            .config
            .input_encoding
            .as_deref()
            .and_then(Encoding::parse);
        let declared_rate = self.inner.config.input_sample_rate_hz.unwrap_or(0);

        if declared.is_some_and(Encoding::is_g711) && declared_rate != 0 && declared_rate != 8000 {
            issues.push(format!(
                "Deepgram configuration declares µ-law at {declared_rate} Hz; µ-law transport must be 8000 Hz."
            ));
        }
        if declared == Some(Encoding::Slin16) && audiosocket_format != Encoding::Slin16 {
            issues.push(format!(
                "Deepgram expects PCM16 input but audiosocket.format is {}. \
                 Set audiosocket.format=slin16 or change the deepgram input_encoding.",
                audiosocket_format.as_str()
            ));
        }
        if streaming_format.encoding != Encoding::Ulaw {
            issues.push(format!(
                "Streaming manager emits {} frames but Deepgram output is canonical µ-law. \
                 Ensure downstream playback converts provider audio back to µ-law.",
                streaming_format.encoding.as_str()
            ));
        }
        if streaming_format.sample_rate != 8000 {
            issues.push(format!(
                "Streaming sample rate is {} Hz but Deepgram output is canonicalized to 8000 Hz.",
                streaming_format.sample_rate
            ));
        }
        issues
    }

    fn is_ready(&self) -> bool {
        self.inner
            .config
            .api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn provider_config() -> ProviderConfig {
        ProviderConfig {
            kind: "deepgram".to_string(),
            api_key: Some("dg-test-key".to_string()),
            model: Some("nova-3".to_string()),
            tts_model: Some("aura-2-thalia-en".to_string()),
            prompt: Some("You are a helpful phone agent.".to_string()),
            greeting: Some("Hi there!".to_string()),
            input_encoding: Some("linear16".to_string()),
            input_sample_rate_hz: Some(16_000),
            output_encoding: Some("mulaw".to_string()),
            output_sample_rate_hz: Some(8000),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn settings_frame_carries_audio_and_greeting() {
        let settings = DeepgramProvider::build_settings(&provider_config());
        assert_eq!(settings["type"], "Settings");
        assert_eq!(settings["audio"]["input"]["encoding"], "linear16");
        assert_eq!(settings["audio"]["input"]["sample_rate"], 16_000);
        assert_eq!(settings["audio"]["output"]["encoding"], "mulaw");
        assert_eq!(settings["audio"]["output"]["container"], "none");
        assert_eq!(settings["agent"]["greeting"], "Hi there!");
        assert_eq!(
            settings["agent"]["listen"]["provider"]["model"],
            "nova-3"
        );
    }

    #[test]
    fn settings_greeting_defaults_when_blank() {
        let mut config = provider_config();
        config.greeting = Some("   ".to_string());
        let settings = DeepgramProvider::build_settings(&config);
        assert_eq!(
            settings["agent"]["greeting"],
            "Hello, how can I help you today?"
        );
    }

    #[test]
    fn input_normalizer_converts_ulaw_to_linear16_at_16k() {
        let mut normalizer =
            InputNormalizer::new(AudioFormat::new(Encoding::Slin16, 16_000));
        // 160 µ-law bytes (20 ms @ 8 kHz) → PCM16 @ 16 kHz = 640 bytes.
        let out = normalizer.convert(&[0x0Au8; 160]);
        assert_eq!(out.len(), 640);
    }

    #[test]
    fn input_normalizer_passes_matching_pcm16() {
        let mut normalizer = InputNormalizer::new(AudioFormat::new(Encoding::Slin16, 8000));
        let frame = vec![0x22u8; 320];
        let out = normalizer.convert(&frame);
        assert_eq!(out, frame);
    }

    #[test]
    fn input_normalizer_compands_for_ulaw_declared() {
        let mut normalizer = InputNormalizer::new(AudioFormat::new(Encoding::Ulaw, 8000));
        // PCM16@8k inbound (320 B) declared µ-law → 160 companded bytes.
        let out = normalizer.convert(&vec![0x11u8; 320]);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn output_normalizer_resamples_pcm_to_ulaw_8k() {
        let mut normalizer =
            OutputNormalizer::new(AudioFormat::new(Encoding::Slin16, 24_000), false);
        // 480 samples @ 24 kHz (20 ms) → 160 µ-law bytes @ 8 kHz.
        let pcm: Vec<u8> = (0..480)
            .flat_map(|i| ((i % 128) as i16 * 100).to_le_bytes())
            .collect();
        let out = normalizer.convert(&pcm);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn output_normalizer_passes_declared_ulaw() {
        let mut normalizer = OutputNormalizer::new(AudioFormat::ulaw_8k(), false);
        let chunk = vec![0x7Fu8; 160];
        assert_eq!(normalizer.convert(&chunk), chunk);
    }

    #[test]
    fn output_normalizer_autodetects_alaw_mislabeled_as_ulaw() {
        // A-law silence (0xD5) decoded as µ-law reads loud; with
        // autodetect on, the law probe must flip to A-law and produce
        // proper silence.
        let mut normalizer = OutputNormalizer::new(AudioFormat::ulaw_8k(), true);
        let alaw_silence = vec![0xD5u8; 320];
        let out = normalizer.convert(&alaw_silence);
        let decoded = mulaw_to_pcm16le(&out);
        assert!(rms(&decoded) < 50, "autodetected A-law should be quiet");
    }

    #[test]
    fn output_normalizer_without_autodetect_trusts_config() {
        let mut normalizer = OutputNormalizer::new(AudioFormat::ulaw_8k(), false);
        let alaw_silence = vec![0xD5u8; 320];
        // Passed through untouched: configuration wins unless the
        // operator opts in to autodetection.
        assert_eq!(normalizer.convert(&alaw_silence), alaw_silence);
    }

    #[test]
    fn alignment_warnings_for_mismatched_transport() {
        let (tx, _rx) = mpsc::channel(4);
        let provider = DeepgramProvider::new(provider_config(), tx);
        let issues = provider.describe_alignment(
            Encoding::Ulaw,
            AudioFormat::new(Encoding::Slin16, 16_000),
        );
        assert_eq!(issues.len(), 3);
        assert!(issues[0].contains("PCM16 input"));
    }

    #[test]
    fn is_ready_requires_api_key() {
        let (tx, _rx) = mpsc::channel(4);
        let provider = DeepgramProvider::new(provider_config(), tx);
        assert!(provider.is_ready());

        let (tx, _rx) = mpsc::channel(4);
        let mut config = provider_config();
        config.api_key = None;
        let provider = DeepgramProvider::new(config, tx);
        assert!(!provider.is_ready());
    }

    #[tokio::test]
    async fn start_session_without_key_fails_fast() {
        let (tx, _rx) = mpsc::channel(4);
        let mut config = provider_config();
        config.api_key = Some(String::new());
        let provider = DeepgramProvider::new(config, tx);
        let err = provider.start_session("c1", None).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn prestream_buffer_caps_at_ten_frames() {
        let (tx, _rx) = mpsc::channel(4);
        let provider = DeepgramProvider::new(provider_config(), tx);
        // Session not ready: frames accumulate in the prestream queue.
        for _ in 0..15 {
            provider.send_audio(Bytes::from(vec![0xFFu8; 160])).await;
        }
        assert_eq!(provider.inner.prestream.lock().len(), PRESTREAM_CAP);
    }

    #[tokio::test]
    async fn control_frames_route_to_typed_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let provider = DeepgramProvider::new(provider_config(), tx);
        *provider.inner.call_id.lock() = Some("c1".to_string());

        let frame = json!({
            "type": "FunctionCallRequest",
            "functions": [{"id": "f1", "name": "transfer", "arguments": "{\"destination\": \"sales\"}"}],
        });
        DeepgramProvider::route_control_frame(&provider.inner, "c1", &frame).await;

        match rx.recv().await.unwrap() {
            ProviderEvent::ToolCall { call_id, calls, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "transfer");
                assert_eq!(calls[0].arguments["destination"], "sales");
                assert_eq!(calls[0].invocation_id.as_deref(), Some("f1"));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conversation_text_maps_roles() {
        let (tx, mut rx) = mpsc::channel(8);
        let provider = DeepgramProvider::new(provider_config(), tx);

        let frame = json!({"type": "ConversationText", "role": "assistant", "content": "Hello!"});
        DeepgramProvider::route_control_frame(&provider.inner, "c1", &frame).await;
        match rx.recv().await.unwrap() {
            ProviderEvent::ConversationText { role, text, .. } => {
                assert_eq!(role, Role::Assistant);
                assert_eq!(text, "Hello!");
            }
            other => panic!("expected ConversationText, got {other:?}"),
        }
    }
}
