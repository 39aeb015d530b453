//! Engine façade: ARI event loop and per-call lifecycle.
//!
//! Binds the transports, session store, conversation coordinator,
//! streaming manager, providers/pipelines and tool registry. One engine
//! instance serves the whole process; each admitted call owns its
//! transport session, provider (or pipeline resolution), and outbound
//! stream, all torn down in reverse order on `StasisEnd`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ari::{AriClient, AriEvent};
use crate::audio::{pcm16le_to_mulaw, rms};
use crate::config::Config;
use crate::coordinator::{BargeInDecision, ConversationCoordinator, ConversationState};
use crate::error::{VoiceBridgeError, VoiceBridgeResult};
use crate::metrics::serve_metrics;
use crate::pipeline::{LlmContext, PipelineOrchestrator, PipelineResolution};
use crate::providers::{
    DeepgramProvider, LocalProvider, ProviderEvent, ToolInvocation, VoiceProvider,
};
use crate::session::{CallSession, CurrentAction, Role, SessionStore, TransferDecision};
use crate::stream::{
    AudioFormat, AudioSocketOutbound, Encoding, FallbackPlaybackManager, PlaybackType, RtpOutbound,
    StreamingPlaybackManager,
};
use crate::tools::business::RequestTranscriptTool;
use crate::tools::parser::parse_response_with_tools;
use crate::tools::telephony::{
    AttendedTransferTool, HangupCallTool, TransferTool, VoicemailTool,
};
use crate::tools::{ToolExecutionContext, ToolOutcome, ToolRegistry};
use crate::transport::{
    audiosocket::AudioSocketEvent, AudioSocketServer, RtpServer, TransportEvent,
};

/// Grace between StasisEnd and session removal so late events still find
/// their call.
const SESSION_TEARDOWN_GRACE: Duration = Duration::from_secs(2);
/// Silence gap that ends an utterance on the composed-pipeline path.
const UTTERANCE_SILENCE: Duration = Duration::from_millis(800);
/// Speech threshold for the pipeline endpointer and barge-in detection.
const SPEECH_RMS_THRESHOLD: u32 = 500;
/// Sweep cadence for expired streams and orphaned fallback files.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Streams older than this are reaped by the janitor.
const STREAM_MAX_AGE: Duration = Duration::from_secs(300);

/// Which media path a call rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaPath {
    Rtp,
    AudioSocket,
}

/// Per-call engine-side runtime state.
struct CallRuntime {
    call_id: String,
    provider: Option<Arc<dyn VoiceProvider>>,
    pipeline: Option<Arc<PipelineResolution>>,
    /// Feed of the currently playing outbound segment.
    segment_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Cleared after a successful `hangup_call` so the model cannot
    /// recursively re-invoke tools on the farewell response.
    tools_enabled: AtomicBool,
    /// Utterance accumulator for the composed-pipeline path (PCM16 at the
    /// engine rate).
    utterance: Mutex<Vec<u8>>,
    last_voice_at: Mutex<Option<tokio::time::Instant>>,
    pipeline_busy: AtomicBool,
}

impl CallRuntime {
    fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            provider: None,
            pipeline: None,
            segment_tx: Mutex::new(None),
            tools_enabled: AtomicBool::new(true),
            utterance: Mutex::new(Vec::new()),
            last_voice_at: Mutex::new(None),
            pipeline_busy: AtomicBool::new(false),
        }
    }
}

/// The VoiceBridge engine.
pub struct Engine {
    config: Arc<Config>,
    ari: AriClient,
    session_store: Arc<SessionStore>,
    coordinator: Arc<ConversationCoordinator>,
    streaming: Arc<StreamingPlaybackManager>,
    fallback: Arc<FallbackPlaybackManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    tools: Arc<ToolRegistry>,
    rtp: Arc<RtpServer>,
    audiosocket: Arc<AudioSocketServer>,

    calls: DashMap<String, Arc<CallRuntime>>,
    /// AudioSocket connection → call id.
    conn_to_call: DashMap<String, String>,
    /// Attended-transfer agent leg channel → call id.
    agent_channels: DashMap<String, String>,

    provider_events_tx: mpsc::Sender<ProviderEvent>,
    provider_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
    transport_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    audiosocket_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<AudioSocketEvent>>>,

    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let session_store = Arc::new(SessionStore::new());
        let coordinator = Arc::new(ConversationCoordinator::new(Arc::clone(&session_store)));
        let ari = AriClient::new(config.ari.clone());
        let fallback = Arc::new(FallbackPlaybackManager::new(
            ari.clone(),
            config.ari.media_dir.clone(),
        ));
        let streaming = Arc::new(StreamingPlaybackManager::new(
            Arc::clone(&session_store),
            Arc::clone(&coordinator),
            Some(Arc::clone(&fallback)),
            config.streaming.clone(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(&config)));

        let (transport_tx, transport_rx) = mpsc::channel(256);
        let rtp = Arc::new(RtpServer::new(config.rtp.clone(), transport_tx));
        let (audiosocket_tx, audiosocket_rx) = mpsc::channel(256);
        let audiosocket = Arc::new(AudioSocketServer::new(
            config.audiosocket.clone(),
            audiosocket_tx,
        ));
        let (provider_events_tx, provider_events_rx) = mpsc::channel(256);

        let tools = Arc::new(ToolRegistry::new());

        Self {
            config,
            ari,
            session_store,
            coordinator,
            streaming,
            fallback,
            orchestrator,
            tools,
            rtp,
            audiosocket,
            calls: DashMap::new(),
            conn_to_call: DashMap::new(),
            agent_channels: DashMap::new(),
            provider_events_tx,
            provider_events_rx: tokio::sync::Mutex::new(Some(provider_events_rx)),
            transport_events_rx: tokio::sync::Mutex::new(Some(transport_rx)),
            audiosocket_events_rx: tokio::sync::Mutex::new(Some(audiosocket_rx)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.session_store)
    }

    pub fn tool_registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    /// Registers the built-in tool set. Called once during startup.
    pub fn register_default_tools(&self) {
        self.tools.register(Arc::new(TransferTool));
        self.tools.register(Arc::new(AttendedTransferTool));
        self.tools.register(Arc::new(HangupCallTool));
        self.tools.register(Arc::new(VoicemailTool));
        self.tools.register(Arc::new(RequestTranscriptTool));
        log::info!("[Engine] Initialized {} tools", self.tools.len());
    }

    /// Starts transports and the orchestrator, then runs the event loop
    /// until cancelled. Startup failures map to the documented exit
    /// classes (transport bind, provider init).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> VoiceBridgeResult<()> {
        self.register_default_tools();

        // Transports.
        self.rtp.start();
        let media_path = if self.config.audiosocket.port != 0 {
            match self.audiosocket.start().await {
                Ok(port) => {
                    log::info!("[Engine] AudioSocket transport ready on port {port}");
                    MediaPath::AudioSocket
                }
                Err(e) => {
                    log::warn!(
                        "[Engine] AudioSocket unavailable ({e}); using External Media RTP"
                    );
                    MediaPath::Rtp
                }
            }
        } else {
            MediaPath::Rtp
        };
        match media_path {
            MediaPath::Rtp => self.streaming.set_transport(
                Arc::new(RtpOutbound(Arc::clone(&self.rtp))),
                Some(self.config.audiosocket.format),
            ),
            MediaPath::AudioSocket => self.streaming.set_transport(
                Arc::new(AudioSocketOutbound {
                    server: Arc::clone(&self.audiosocket),
                    broadcast_debug: self.config.audiosocket.broadcast_debug,
                }),
                Some(self.config.audiosocket.format),
            ),
        }

        // Pipelines.
        self.orchestrator.start().await?;
        if !self.orchestrator.enabled() && self.config.default_provider.is_none() {
            return Err(VoiceBridgeError::Configuration(
                "no pipelines configured and no default_provider set".into(),
            ));
        }

        if self.config.metrics.enabled {
            tokio::spawn(serve_metrics(self.config.metrics.bind.clone()));
        }

        // Event plumbing.
        let (ari_tx, mut ari_rx) = mpsc::channel(256);
        let ari_client = self.ari.clone();
        let ari_cancel = cancel.clone();
        tokio::spawn(async move { ari_client.run_events(ari_tx, ari_cancel).await });

        let mut transport_rx = self
            .transport_events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VoiceBridgeError::Internal("engine already running".into()))?;
        let mut provider_rx = self
            .provider_events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VoiceBridgeError::Internal("engine already running".into()))?;
        let mut audiosocket_rx = self
            .audiosocket_events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VoiceBridgeError::Internal("engine already running".into()))?;

        // Janitor: expired streams, orphaned fallback files.
        let janitor = Arc::clone(&self);
        let janitor_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = janitor_cancel.cancelled() => return,
                    () = tokio::time::sleep(JANITOR_INTERVAL) => {}
                }
                let reaped = janitor.streaming.cleanup_expired_streams(STREAM_MAX_AGE).await;
                if reaped > 0 {
                    log::warn!("[Engine] Reaped {reaped} expired streams");
                }
                janitor.fallback.sweep_orphans().await;
            }
        });

        log::info!("[Engine] Event loop running: media_path={media_path:?}");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = ari_rx.recv() => {
                    let Some(event) = event else {
                        log::error!("[Engine] ARI event stream ended");
                        break;
                    };
                    self.handle_ari_event(event).await;
                }
                event = transport_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_transport_event(event).await;
                    }
                }
                event = audiosocket_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_audiosocket_event(event).await;
                    }
                }
                event = provider_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_provider_event(event).await;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        log::info!("[Engine] Shutting down");
        self.cancel.cancel();
        let call_ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for call_id in call_ids {
            self.teardown_call(&call_id, false).await;
        }
        self.orchestrator.stop().await;
        self.rtp.stop().await;
        self.audiosocket.stop();
    }

    // ── ARI events ──────────────────────────────────────────────────────

    /// Routes one ARI event. Per-call work that can block on the network
    /// (admission, teardown, DTMF actions) runs on its own task so one
    /// slow call never stalls the event loop.
    async fn handle_ari_event(self: &Arc<Self>, event: AriEvent) {
        match event {
            AriEvent::StasisStart {
                channel_id,
                channel_name,
                caller_number,
                args,
            } => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(call_id) = Self::attended_transfer_call_id(&args) {
                        engine.on_agent_leg_started(&call_id, &channel_id).await;
                    } else {
                        engine
                            .on_call_started(&channel_id, &channel_name, caller_number.as_deref())
                            .await;
                    }
                });
            }
            AriEvent::StasisEnd { channel_id } => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(call_id) =
                        engine.agent_channels.remove(&channel_id).map(|(_, c)| c)
                    {
                        engine.on_agent_leg_ended(&call_id, &channel_id).await;
                    } else if let Some(call_id) = engine.call_id_for_channel(&channel_id) {
                        engine.teardown_call(&call_id, true).await;
                    }
                });
            }
            AriEvent::ChannelDtmfReceived { channel_id, digit } => {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.on_dtmf(&channel_id, digit).await });
            }
            AriEvent::PlaybackFinished { playback_id } => {
                if let Some(playback) = self.fallback.on_playback_finished(&playback_id).await {
                    self.spawn_hangup_after_tts(&playback.call_id);
                }
            }
            AriEvent::ChannelDestroyed { channel_id } => {
                self.agent_channels.remove(&channel_id);
            }
            AriEvent::Other { event_type } => {
                log::debug!("[Engine] Unrouted ARI event: {event_type}");
            }
        }
    }

    /// The appArgs shape `attended-transfer,<call_id>,<destination>` marks
    /// an agent leg we originated ourselves.
    fn attended_transfer_call_id(args: &[String]) -> Option<String> {
        match args.first().map(String::as_str) {
            Some("attended-transfer") => args.get(1).cloned(),
            _ => None,
        }
    }

    fn call_id_for_channel(&self, channel_id: &str) -> Option<String> {
        self.session_store
            .all()
            .into_iter()
            .find(|s| s.caller_channel_id == channel_id)
            .map(|s| s.call_id.clone())
    }

    async fn on_call_started(
        &self,
        channel_id: &str,
        channel_name: &str,
        caller_number: Option<&str>,
    ) {
        // Channel id doubles as the canonical call id.
        let call_id = channel_id.to_string();
        log::info!(
            "[Engine] Call started: call={call_id}, channel={channel_name}, caller={}",
            caller_number.unwrap_or("unknown")
        );

        let mut session = CallSession::new(&call_id, channel_id);
        session.inbound_encoding = Encoding::parse(&self.config.rtp.codec).unwrap_or(Encoding::Ulaw);
        session.inbound_sample_rate = 8000;
        self.session_store.upsert_call(session);
        self.coordinator
            .update_state(&call_id, ConversationState::Listening);

        if let Err(e) = self.ari.answer(channel_id).await {
            log::error!("[Engine] Failed to answer channel: call={call_id}, error={e}");
        }

        // Media resources.
        if let Err(e) = self.rtp.allocate_session(&call_id).await {
            log::error!("[Engine] RTP allocation failed: call={call_id}, error={e}");
        }

        let mut runtime = CallRuntime::new(&call_id);

        // Composed pipeline takes priority; otherwise the default
        // full-agent provider.
        if let Some(resolution) = self.orchestrator.get_pipeline(&call_id, None) {
            runtime.pipeline = Some(resolution);
        } else if let Some(built) = self.build_default_provider() {
            let provider = built.as_voice_provider();
            match provider.start_session(&call_id, None).await {
                Ok(()) => {
                    if let BuiltProvider::Local(local) = &built {
                        let _ = local.play_initial_greeting(&call_id).await;
                    }
                    runtime.provider = Some(provider);
                }
                Err(e) => {
                    log::error!(
                        "[Engine] Provider session failed to start: call={call_id}, error={e}"
                    );
                    self.speak_error_and_hangup(&call_id).await;
                    return;
                }
            }
        } else {
            log::error!("[Engine] No pipeline or provider available: call={call_id}");
            self.speak_error_and_hangup(&call_id).await;
            return;
        }

        self.calls.insert(call_id.clone(), Arc::new(runtime));
    }

    fn build_default_provider(&self) -> Option<BuiltProvider> {
        let name = self.config.default_provider.as_deref()?;
        let provider_config = self.config.providers.get(name)?.clone();
        let kind = if provider_config.kind.is_empty() {
            name
        } else {
            provider_config.kind.as_str()
        };
        let built = match kind {
            "deepgram" => BuiltProvider::Deepgram(Arc::new(DeepgramProvider::new(
                provider_config,
                self.provider_events_tx.clone(),
            ))),
            "local" => BuiltProvider::Local(Arc::new(LocalProvider::new(
                provider_config,
                self.provider_events_tx.clone(),
            ))),
            other => {
                log::error!("[Engine] Unknown provider kind '{other}'");
                return None;
            }
        };

        // Startup alignment check, warnings only.
        let streaming_format = AudioFormat::new(
            self.config.audiosocket.format,
            self.config.streaming.sample_rate,
        );
        for issue in built
            .as_voice_provider()
            .describe_alignment(self.config.audiosocket.format, streaming_format)
        {
            log::warn!("[Engine] Provider alignment: {issue}");
        }
        Some(built)
    }

    /// Reverse-order teardown: stream → provider/pipeline → transports →
    /// session (after a grace).
    async fn teardown_call(&self, call_id: &str, grace: bool) {
        log::info!("[Engine] Call ended: call={call_id}");
        let runtime = self.calls.remove(call_id).map(|(_, r)| r);

        self.streaming.stop_streaming_playback(call_id).await;

        if let Some(runtime) = runtime {
            *runtime.segment_tx.lock() = None;
            if let Some(provider) = &runtime.provider {
                provider.stop_session().await;
            }
            if runtime.pipeline.is_some() {
                self.orchestrator.release_pipeline(call_id).await;
            }
        }

        self.rtp.cleanup_session(call_id).await;
        self.conn_to_call.retain(|_, mapped| mapped != call_id);
        self.coordinator.remove_call(call_id);

        if grace {
            // Late events (PlaybackFinished, trailing transport frames)
            // still find the session during the grace window.
            let store = Arc::clone(&self.session_store);
            let call = call_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(SESSION_TEARDOWN_GRACE).await;
                store.remove(&call);
            });
        } else {
            self.session_store.remove(call_id);
        }
    }

    // ── Attended transfer runtime ───────────────────────────────────────

    async fn on_agent_leg_started(&self, call_id: &str, agent_channel_id: &str) {
        log::info!(
            "[Engine] Attended transfer agent leg answered: call={call_id}, agent_channel={agent_channel_id}"
        );
        self.agent_channels
            .insert(agent_channel_id.to_string(), call_id.to_string());
        self.session_store.update(call_id, |s| {
            if let CurrentAction::AttendedTransfer {
                agent_channel_id: slot,
                answered,
                ..
            } = &mut s.current_action
            {
                *slot = Some(agent_channel_id.to_string());
                *answered = true;
            }
        });
        // Brief the agent, then wait for their DTMF decision.
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        if let CurrentAction::AttendedTransfer { target_name, .. } = &session.current_action {
            let announcement = format!(
                "Incoming caller transfer from {}. Press 1 to accept, 2 to decline.",
                target_name
            );
            // The agent leg has no provider; file playback does the brief.
            let mulaw = synthesize_announcement_tone(&announcement);
            if let Err(e) = self
                .fallback
                .play_audio(call_id, agent_channel_id, &mulaw, "agent-announcement")
                .await
            {
                log::warn!(
                    "[Engine] Agent announcement playback failed: call={call_id}, error={e}"
                );
            }
        }

        // No-answer guard: tear the leg down after the dial timeout if no
        // decision arrives.
        if let CurrentAction::AttendedTransfer {
            dial_timeout_seconds,
            ..
        } = &session.current_action
        {
            let timeout = Duration::from_secs(*dial_timeout_seconds);
            let engine_cancel = self.cancel.clone();
            let store = Arc::clone(&self.session_store);
            let ari = self.ari.clone();
            let call = call_id.to_string();
            let agent = agent_channel_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    () = engine_cancel.cancelled() => return,
                    () = tokio::time::sleep(timeout) => {}
                }
                let undecided = store.get(&call).is_some_and(|s| {
                    matches!(
                        &s.current_action,
                        CurrentAction::AttendedTransfer { decision: None, .. }
                    )
                });
                if undecided {
                    log::warn!(
                        "[Engine] Attended transfer timed out without decision: call={call}"
                    );
                    let _ = ari.hangup_channel(&agent).await;
                }
            });
        }
    }

    async fn on_agent_leg_ended(&self, call_id: &str, agent_channel_id: &str) {
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        if let CurrentAction::AttendedTransfer { decision, .. } = &session.current_action {
            if decision.is_none() {
                log::info!(
                    "[Engine] Agent leg ended without decision; resuming AI: call={call_id}, agent_channel={agent_channel_id}"
                );
                self.resume_after_declined_transfer(call_id).await;
            }
        }
    }

    async fn on_dtmf(&self, channel_id: &str, digit: char) {
        let Some(call_id) = self
            .agent_channels
            .get(channel_id)
            .map(|e| e.value().clone())
        else {
            log::debug!("[Engine] DTMF on non-agent channel: channel={channel_id}, digit={digit}");
            return;
        };
        log::info!(
            "[Engine] Attended transfer DTMF: call={call_id}, agent_channel={channel_id}, digit={digit}"
        );
        match digit {
            '1' => self.accept_attended_transfer(&call_id, channel_id).await,
            '2' => self.decline_attended_transfer(&call_id, channel_id).await,
            other => log::debug!("[Engine] Ignoring DTMF digit {other}: call={call_id}"),
        }
    }

    /// DTMF 1: bridge caller and agent, drop the AI media path.
    async fn accept_attended_transfer(&self, call_id: &str, agent_channel_id: &str) {
        self.session_store.update(call_id, |s| {
            if let CurrentAction::AttendedTransfer {
                decision,
                decision_digit,
                ..
            } = &mut s.current_action
            {
                *decision = Some(TransferDecision::Accepted);
                *decision_digit = Some('1');
            }
            s.transfer_active = true;
        });
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };

        if let Err(e) = self.ari.stop_moh(&session.caller_channel_id).await {
            log::debug!("[Engine] MOH stop failed on accept: call={call_id}, error={e}");
        }
        self.streaming.stop_streaming_playback(call_id).await;

        match self.ari.create_bridge("mixing").await {
            Ok(bridge_id) => {
                let caller_ok = self
                    .ari
                    .add_channel_to_bridge(&bridge_id, &session.caller_channel_id)
                    .await
                    .is_ok();
                let agent_ok = self
                    .ari
                    .add_channel_to_bridge(&bridge_id, agent_channel_id)
                    .await
                    .is_ok();
                if caller_ok && agent_ok {
                    self.session_store
                        .update(call_id, |s| s.bridge_id = Some(bridge_id.clone()));
                    log::info!(
                        "[Engine] Attended transfer bridged: call={call_id}, bridge={bridge_id}"
                    );
                    // The AI is out of the call; close its media quietly.
                    let provider = self
                        .calls
                        .get(call_id)
                        .and_then(|runtime| runtime.provider.clone());
                    if let Some(provider) = provider {
                        provider.stop_session().await;
                    }
                } else {
                    log::error!("[Engine] Bridge population failed: call={call_id}");
                    let _ = self.ari.destroy_bridge(&bridge_id).await;
                    self.resume_after_declined_transfer(call_id).await;
                }
            }
            Err(e) => {
                log::error!("[Engine] Bridge creation failed: call={call_id}, error={e}");
                self.resume_after_declined_transfer(call_id).await;
            }
        }
    }

    /// DTMF 2: hang the agent leg up and resume the AI conversation.
    async fn decline_attended_transfer(&self, call_id: &str, agent_channel_id: &str) {
        self.session_store.update(call_id, |s| {
            if let CurrentAction::AttendedTransfer {
                decision,
                decision_digit,
                ..
            } = &mut s.current_action
            {
                *decision = Some(TransferDecision::Declined);
                *decision_digit = Some('2');
            }
        });
        if let Err(e) = self.ari.hangup_channel(agent_channel_id).await {
            log::debug!("[Engine] Agent leg hangup failed: call={call_id}, error={e}");
        }
        self.resume_after_declined_transfer(call_id).await;
    }

    async fn resume_after_declined_transfer(&self, call_id: &str) {
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        if let Err(e) = self.ari.stop_moh(&session.caller_channel_id).await {
            log::debug!("[Engine] MOH stop failed on decline: call={call_id}, error={e}");
        }
        let message = self
            .config
            .tools
            .attended_transfer
            .declined_message
            .clone();
        self.session_store.update(call_id, |s| {
            s.transfer_active = false;
            s.audio_capture_enabled = true;
            s.current_action = CurrentAction::None;
            s.push_history(Role::Assistant, message.clone());
        });
        self.coordinator
            .update_state(call_id, ConversationState::Listening);

        if let Some(runtime) = self.calls.get(call_id).map(|e| Arc::clone(&e)) {
            if let Some(provider) = &runtime.provider {
                let _ = provider.speak(&message).await;
            } else if runtime.pipeline.is_some() {
                self.speak_via_pipeline(&runtime, &message).await;
            }
        }
    }

    // ── Inbound audio ───────────────────────────────────────────────────

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::InboundAudio { call_id, ssrc, pcm } => {
                if self.session_store.get(&call_id).is_some_and(|s| s.ssrc.is_none()) {
                    self.session_store.update(&call_id, |s| s.ssrc = Some(ssrc));
                }
                self.dispatch_caller_audio(&call_id, pcm).await;
            }
            TransportEvent::SessionEnded { call_id, reason } => {
                log::info!("[Engine] Transport session ended: call={call_id}, reason={reason}");
            }
        }
    }

    async fn handle_audiosocket_event(self: &Arc<Self>, event: AudioSocketEvent) {
        match event {
            AudioSocketEvent::Connected {
                conn_id,
                channel_uuid,
            } => {
                // The dialplan passes the channel id as the UUID; map the
                // connection onto the session carrying that channel.
                let call_id = channel_uuid.to_string();
                if self.session_store.contains(&call_id) {
                    self.conn_to_call.insert(conn_id.clone(), call_id.clone());
                    self.session_store.update(&call_id, |s| {
                        s.audiosocket_conn_id = Some(conn_id.clone());
                        if !s.audiosocket_conns.contains(&conn_id) {
                            s.audiosocket_conns.push(conn_id.clone());
                        }
                    });
                } else {
                    log::warn!(
                        "[Engine] AudioSocket connection for unknown call: conn={conn_id}, uuid={channel_uuid}"
                    );
                }
            }
            AudioSocketEvent::Audio { conn_id, payload } => {
                let Some(call_id) = self.conn_to_call.get(&conn_id).map(|e| e.value().clone())
                else {
                    return;
                };
                self.dispatch_caller_audio(&call_id, payload).await;
            }
            AudioSocketEvent::Disconnected { conn_id, reason } => {
                if let Some((_, call_id)) = self.conn_to_call.remove(&conn_id) {
                    log::info!(
                        "[Engine] AudioSocket leg closed: call={call_id}, reason={reason}"
                    );
                    self.session_store.update(&call_id, |s| {
                        if s.audiosocket_conn_id.as_deref() == Some(conn_id.as_str()) {
                            s.audiosocket_conn_id = None;
                        }
                    });
                }
            }
        }
    }

    async fn dispatch_caller_audio(self: &Arc<Self>, call_id: &str, audio: Bytes) {
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        // Capture gating: MOH and transfer audio never reach a provider.
        if !session.audio_capture_enabled {
            return;
        }
        let Some(runtime) = self.calls.get(call_id).map(|e| Arc::clone(&e)) else {
            return;
        };

        // Barge-in: caller speech while the agent is speaking pre-empts
        // playback (composed pipelines only; full agents manage their own
        // turn-taking server-side).
        if runtime.pipeline.is_some()
            && rms(&audio) >= SPEECH_RMS_THRESHOLD
            && self.coordinator.on_user_speech(call_id) == BargeInDecision::PreemptPlayback
        {
            log::info!("[Engine] Barge-in detected; stopping playback: call={call_id}");
            self.streaming.stop_streaming_playback(call_id).await;
        }

        if let Some(provider) = &runtime.provider {
            provider.send_audio(audio).await;
        } else if runtime.pipeline.is_some() {
            self.feed_pipeline_endpointer(&runtime, audio);
        }
    }

    /// Energy endpointer for the composed-pipeline path: utterances end
    /// after [`UTTERANCE_SILENCE`] of quiet. The resulting STT → LLM → TTS
    /// turn runs detached.
    fn feed_pipeline_endpointer(self: &Arc<Self>, runtime: &Arc<CallRuntime>, audio: Bytes) {
        let now = tokio::time::Instant::now();
        let loud = rms(&audio) >= SPEECH_RMS_THRESHOLD;
        {
            let mut utterance = runtime.utterance.lock();
            let mut last_voice = runtime.last_voice_at.lock();
            if loud {
                *last_voice = Some(now);
                utterance.extend_from_slice(&audio);
                return;
            }
            if utterance.is_empty() {
                return;
            }
            utterance.extend_from_slice(&audio);
            let expired = last_voice
                .map(|t| now.duration_since(t) >= UTTERANCE_SILENCE)
                .unwrap_or(true);
            if !expired {
                return;
            }
        }
        // Silence threshold reached with buffered speech: run one turn.
        if runtime.pipeline_busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let pcm: Vec<u8> = std::mem::take(&mut *runtime.utterance.lock());
        *runtime.last_voice_at.lock() = None;

        let engine = Arc::clone(self);
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            engine.run_pipeline_turn(&runtime, pcm).await;
            runtime.pipeline_busy.store(false, Ordering::SeqCst);
        });
    }

    /// One composed STT → LLM → TTS turn.
    async fn run_pipeline_turn(&self, runtime: &Arc<CallRuntime>, pcm: Vec<u8>) {
        let Some(resolution) = runtime.pipeline.as_ref() else {
            return;
        };
        let call_id = &runtime.call_id;
        self.coordinator
            .update_state(call_id, ConversationState::Thinking);

        let transcript = match resolution
            .stt
            .transcribe(
                call_id,
                &pcm,
                self.config.rtp.sample_rate,
                &resolution.stt_options,
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                self.coordinator
                    .update_state(call_id, ConversationState::Listening);
                return;
            }
            Err(e) => {
                log::error!("[Engine] STT failed: call={call_id}, error={e}");
                self.coordinator
                    .update_state(call_id, ConversationState::Listening);
                return;
            }
        };
        self.session_store
            .update(call_id, |s| s.push_history(Role::User, transcript.clone()));

        let context = LlmContext {
            history: self
                .session_store
                .get(call_id)
                .map(|s| s.conversation_history.clone())
                .unwrap_or_default(),
            tool_results: Vec::new(),
            system_prompt: None,
        };
        let reply = match resolution
            .llm
            .generate(call_id, &transcript, &context, &resolution.llm_options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("[Engine] LLM failed: call={call_id}, error={e}");
                self.coordinator
                    .update_state(call_id, ConversationState::Listening);
                return;
            }
        };

        // Inline tool markers: execute, then speak the clean text.
        let (clean_text, tool_calls) = parse_response_with_tools(&reply);
        if !tool_calls.is_empty() && runtime.tools_enabled.load(Ordering::SeqCst) {
            self.execute_tool_calls(runtime, &tool_calls, None).await;
        }
        if !clean_text.is_empty() {
            self.session_store
                .update(call_id, |s| s.push_history(Role::Assistant, clean_text.clone()));
            self.speak_via_pipeline(runtime, &clean_text).await;
        } else {
            self.coordinator
                .update_state(call_id, ConversationState::Listening);
        }
    }

    async fn speak_via_pipeline(&self, runtime: &Arc<CallRuntime>, text: &str) {
        let Some(resolution) = runtime.pipeline.as_ref() else {
            return;
        };
        let call_id = &runtime.call_id;
        match resolution
            .tts
            .synthesize(call_id, text, &resolution.tts_options)
            .await
        {
            Ok(chunks) => {
                let started = self.streaming.start_streaming_playback(
                    call_id,
                    chunks,
                    PlaybackType::Response,
                    AudioFormat::ulaw_8k(),
                    None,
                );
                if started.is_none() {
                    log::warn!("[Engine] TTS playback refused (gating): call={call_id}");
                }
            }
            Err(e) => log::error!("[Engine] TTS failed: call={call_id}, error={e}"),
        }
    }

    // ── Provider events ─────────────────────────────────────────────────

    async fn handle_provider_event(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::AgentAudio {
                call_id,
                data,
                format,
            } => {
                self.pump_agent_audio(&call_id, data, format).await;
            }
            ProviderEvent::AgentAudioDone { call_id } => {
                if let Some(runtime) = self.calls.get(&call_id) {
                    // Dropping the sender is the end-of-stream sentinel.
                    *runtime.segment_tx.lock() = None;
                }
                self.spawn_hangup_after_tts(&call_id);
            }
            ProviderEvent::ConversationText {
                call_id,
                role,
                text,
            } => {
                self.session_store
                    .update(&call_id, |s| s.push_history(role, text));
            }
            ProviderEvent::ToolCall {
                call_id,
                calls,
                speak_text,
            } => {
                let Some(runtime) = self.calls.get(&call_id).map(|e| Arc::clone(&e)) else {
                    return;
                };
                if !runtime.tools_enabled.load(Ordering::SeqCst) {
                    log::warn!(
                        "[Engine] Tool call ignored (tools disabled post-hangup): call={call_id}"
                    );
                    return;
                }
                // Tool execution can hold MOH, dial agents, or sleep for
                // media grace; never on the event loop.
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine
                        .execute_tool_calls(&runtime, &calls, speak_text.as_deref())
                        .await;
                });
            }
            ProviderEvent::HangupReady { call_id } => {
                log::info!("[Engine] HangupReady: call={call_id}");
                let _ = self
                    .ari
                    .hangup_channel(
                        &self
                            .session_store
                            .get(&call_id)
                            .map(|s| s.caller_channel_id.clone())
                            .unwrap_or_else(|| call_id.clone()),
                    )
                    .await;
            }
            ProviderEvent::Error { call_id, message } => {
                log::error!("[Engine] Provider error: call={call_id}, {message}");
                if !call_id.is_empty() {
                    self.speak_error_and_hangup(&call_id).await;
                }
            }
        }
    }

    /// Routes one agent-audio chunk into the call's outbound segment,
    /// opening a new streaming segment when none is active.
    async fn pump_agent_audio(&self, call_id: &str, data: Bytes, format: AudioFormat) {
        let Some(runtime) = self.calls.get(call_id).map(|e| Arc::clone(&e)) else {
            return;
        };

        let sender = {
            let mut guard = runtime.segment_tx.lock();
            if let Some(tx) = guard.as_ref() {
                tx.clone()
            } else {
                let (tx, rx) = mpsc::channel(64);
                let playback_type = if self
                    .session_store
                    .get(call_id)
                    .map(|s| s.conversation_history.is_empty())
                    .unwrap_or(true)
                {
                    PlaybackType::Greeting
                } else {
                    PlaybackType::Response
                };
                let started = self.streaming.start_streaming_playback(
                    call_id,
                    rx,
                    playback_type,
                    format,
                    None,
                );
                if started.is_none() {
                    log::warn!("[Engine] Agent audio refused (gating): call={call_id}");
                    return;
                }
                *guard = Some(tx.clone());
                tx
            }
        };

        let len = data.len() as u64;
        if sender.send(data).await.is_err() {
            // Segment just ended under us; the next chunk reopens one.
            *runtime.segment_tx.lock() = None;
        } else if let Some(snapshot) = self.streaming.stream_snapshot(call_id) {
            self.streaming
                .record_provider_bytes(call_id, snapshot.provider_bytes + len);
        }
    }

    /// Executes tool invocations and returns results to the provider.
    async fn execute_tool_calls(
        &self,
        runtime: &Arc<CallRuntime>,
        calls: &[ToolInvocation],
        speak_text: Option<&str>,
    ) {
        let call_id = &runtime.call_id;
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        let context = ToolExecutionContext {
            call_id: call_id.clone(),
            caller_channel_id: session.caller_channel_id.clone(),
            bridge_id: session.bridge_id.clone(),
            session_store: Arc::clone(&self.session_store),
            ari: self.ari.clone(),
            config: Arc::clone(&self.config),
            provider_name: self
                .config
                .default_provider
                .clone()
                .unwrap_or_else(|| "pipeline".to_string()),
            current_user_input: session.last_turn(Role::User).map(|t| t.content.clone()),
        };
        let allowlist = runtime
            .pipeline
            .as_ref()
            .and_then(|p| p.tool_allowlist.clone());

        self.coordinator
            .update_state(call_id, ConversationState::ToolExecuting);

        for invocation in calls {
            // Per-call allowlist restricts what the model may invoke.
            if let Some(allowed) = &allowlist {
                let canonical = self
                    .tools
                    .get(&invocation.name)
                    .map(|t| t.definition().name);
                let permitted = canonical
                    .as_ref()
                    .is_some_and(|name| allowed.iter().any(|a| {
                        a == name || a == &invocation.name
                    }));
                if !permitted {
                    log::warn!(
                        "[Engine] Tool '{}' not in allowlist: call={call_id}",
                        invocation.name
                    );
                    continue;
                }
            }

            let outcome = match self.tools.get(&invocation.name) {
                Some(tool) => {
                    let timeout = Duration::from_secs(tool.definition().max_execution_time.max(1));
                    match tokio::time::timeout(
                        timeout,
                        tool.execute(&invocation.arguments, &context),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => ToolOutcome::error(
                            "The action took too long to complete.",
                            "tool execution timed out",
                        ),
                    }
                }
                None => ToolOutcome::failed(format!("Unknown tool: {}", invocation.name)),
            };

            log::info!(
                "[Engine] Tool executed: call={call_id}, tool={}, status={:?}, will_hangup={}",
                invocation.name,
                outcome.status,
                outcome.will_hangup,
            );
            self.session_store.update(call_id, |s| {
                s.push_history(
                    Role::Tool,
                    format!("{}: {}", invocation.name, outcome.to_wire_value()),
                );
            });

            // Hangup flow: no further tools for this call so the model
            // cannot recursively re-invoke hangup_call on the farewell.
            if outcome.will_hangup {
                runtime.tools_enabled.store(false, Ordering::SeqCst);
            }

            if let Some(provider) = &runtime.provider {
                if let Err(e) = provider
                    .send_tool_result(
                        invocation.invocation_id.as_deref(),
                        &invocation.name,
                        outcome.to_wire_value(),
                    )
                    .await
                {
                    log::warn!(
                        "[Engine] Tool result delivery failed: call={call_id}, error={e}"
                    );
                }
                if outcome.ai_should_speak {
                    if let Some(message) = &outcome.message {
                        let _ = provider.speak(message).await;
                    }
                }
            } else if runtime.pipeline.is_some() {
                // Pipeline path: speak the outcome message directly.
                if let Some(message) = &outcome.message {
                    if outcome.ai_should_speak || outcome.will_hangup {
                        self.speak_via_pipeline(runtime, message).await;
                    }
                }
            }
        }

        if let Some(text) = speak_text {
            if let Some(provider) = &runtime.provider {
                let _ = provider.speak(text).await;
            }
        }
        if self.coordinator.state(call_id) == ConversationState::ToolExecuting {
            self.coordinator
                .update_state(call_id, ConversationState::Listening);
        }
    }

    /// After farewell audio drains, hang the channel up. Runs detached so
    /// the event loop never waits on a tail flush.
    fn spawn_hangup_after_tts(&self, call_id: &str) {
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        if !session.cleanup_after_tts {
            return;
        }
        let streaming = Arc::clone(&self.streaming);
        let ari = self.ari.clone();
        let channel = session.caller_channel_id.clone();
        let call = call_id.to_string();
        tokio::spawn(async move {
            // Let the tail flush complete before dropping the channel.
            for _ in 0..50 {
                if !streaming.is_stream_active(&call) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            log::info!("[Engine] Farewell finished; hanging up: call={call}");
            if let Err(e) = ari.hangup_channel(&channel).await {
                log::debug!(
                    "[Engine] Hangup failed (channel may be gone): call={call}, error={e}"
                );
            }
        });
    }

    /// Fatal provider error mid-call: apologize via the fallback path and
    /// end the call gracefully.
    async fn speak_error_and_hangup(&self, call_id: &str) {
        let Some(session) = self.session_store.get(call_id) else {
            return;
        };
        let apology_pcm = synthesize_announcement_tone(
            "I'm sorry, something went wrong on our end. Please call back shortly.",
        );
        let _ = self
            .fallback
            .play_audio(
                call_id,
                &session.caller_channel_id,
                &apology_pcm,
                "error-apology",
            )
            .await;
        self.session_store.update(call_id, |s| s.cleanup_after_tts = true);
        // The PlaybackFinished handler completes the hangup; if playback
        // never starts, hang up directly.
        if self.fallback.active_count() == 0 {
            let _ = self.ari.hangup_channel(&session.caller_channel_id).await;
        }
    }
}

/// A constructed full-agent provider, concretely typed so kind-specific
/// calls (local greeting injection) stay available next to the trait
/// object handed to the runtime.
enum BuiltProvider {
    Deepgram(Arc<DeepgramProvider>),
    Local(Arc<LocalProvider>),
}

impl BuiltProvider {
    fn as_voice_provider(&self) -> Arc<dyn VoiceProvider> {
        match self {
            Self::Deepgram(provider) => Arc::clone(provider) as Arc<dyn VoiceProvider>,
            Self::Local(provider) => Arc::clone(provider) as Arc<dyn VoiceProvider>,
        }
    }
}

/// Attention tone used when no TTS is available for an announcement: a
/// short dual-tone burst in µ-law@8k. Real speech for these paths comes
/// from the provider when one is attached.
fn synthesize_announcement_tone(_text: &str) -> Vec<u8> {
    let samples: Vec<u8> = (0..8000usize)
        .map(|i| {
            let t = i as f32 / 8000.0;
            let envelope = if t < 0.05 { t / 0.05 } else { 1.0 };
            let value = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3
                + (2.0 * std::f32::consts::PI * 620.0 * t).sin() * 0.2;
            ((value * envelope * 8000.0) as i16).to_le_bytes()
        })
        .flat_map(|bytes| bytes.into_iter())
        .collect();
    pcm16le_to_mulaw(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attended_transfer_args_are_recognized() {
        let args = vec![
            "attended-transfer".to_string(),
            "call-42".to_string(),
            "support_agent".to_string(),
        ];
        assert_eq!(
            Engine::attended_transfer_call_id(&args),
            Some("call-42".to_string())
        );
        assert_eq!(
            Engine::attended_transfer_call_id(&["inbound".to_string()]),
            None
        );
        assert_eq!(Engine::attended_transfer_call_id(&[]), None);
    }

    #[test]
    fn announcement_tone_is_mulaw_8k_one_second() {
        let tone = synthesize_announcement_tone("anything");
        assert_eq!(tone.len(), 8000);
        // Not silence.
        assert!(tone.iter().any(|&b| b != 0xFF));
    }

    #[tokio::test]
    async fn engine_builds_with_default_config() {
        let engine = Engine::new(Config::default());
        assert!(engine.session_store().is_empty());
        engine.register_default_tools();
        assert_eq!(engine.tool_registry().len(), 5);
        assert!(engine.tool_registry().get("hangup_call").is_some());
        assert!(engine.tool_registry().get("end_call").is_some());
    }

    #[tokio::test]
    async fn run_requires_pipeline_or_provider() {
        let engine = Arc::new(Engine::new(Config::default()));
        let cancel = CancellationToken::new();
        let result = engine.run(cancel).await;
        assert!(matches!(result, Err(VoiceBridgeError::Configuration(_))));
    }
}
