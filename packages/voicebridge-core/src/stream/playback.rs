//! Streaming playback manager.
//!
//! Sends provider audio to the caller over the active media transport with
//! jitter buffering, adaptive warm-up, low-watermark dribble, underflow
//! filler, endianness auto-correction, and automatic fallback to file
//! playback when streaming cannot keep up.
//!
//! Three cooperating tasks run per stream:
//! - **producer**: drains the provider's chunk channel into the jitter
//!   buffer, detecting provider stalls (`fallback_timeout_ms`),
//! - **pacer**: drains the jitter buffer, converts chunks to the target
//!   format, and transmits (framed at 20 ms cadence on AudioSocket,
//!   chunk-at-a-time on RTP),
//! - **keepalive**: watches chunk liveness (`connection_timeout_ms`).
//!
//! Per-stream state machine:
//! `created → warming → streaming → tail_flushing → ended(reason)`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{
    alaw_to_pcm16le, apply_bias, byteswap, dc_offset, mulaw_to_pcm16le, pcm16le_to_mulaw,
    probe_endianness, resample, rms, DcBlocker, ResampleState,
};
use crate::config::{EgressSwapMode, StreamingSettings};
use crate::coordinator::ConversationCoordinator;
use crate::metrics::metrics;
use crate::session::{epoch_ms, CallSession, SessionStore};
use crate::stream::{stream_id, AudioFormat, Encoding, FallbackPlaybackManager, PlaybackType};
use crate::transport::{AudioSocketServer, RtpServer};

/// Hard cap on the rebuild/tail-flush grace regardless of configuration.
const GRACE_CAP: Duration = Duration::from_millis(60);
/// Resume-floor bounds for back-to-back segments.
const RESUME_FLOOR_MIN_MS: u64 = 160;
const RESUME_FLOOR_MAX_MS: u64 = 200;

/// Which segmentation discipline a transport needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Frame-exact 20 ms segmentation with paced sends.
    AudioSocket,
    /// Chunk-at-a-time sends; the RTP layer stamps timing.
    Rtp,
}

/// Seam between the pacer and the concrete media transport.
pub trait OutboundAudio: Send + Sync {
    /// Sends one outbound buffer for the call. `false` means the endpoint
    /// is unknown, the socket would block, or no recipient accepted.
    fn send_audio(&self, session: &CallSession, buffer: &[u8]) -> bool;
    fn kind(&self) -> TransportKind;
}

/// RTP binding: forwards to the per-call UDP session.
pub struct RtpOutbound(pub Arc<RtpServer>);

impl OutboundAudio for RtpOutbound {
    fn send_audio(&self, session: &CallSession, buffer: &[u8]) -> bool {
        self.0.send_audio(&session.call_id, buffer, session.ssrc)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Rtp
    }
}

/// AudioSocket binding with optional broadcast-debug fan-out.
pub struct AudioSocketOutbound {
    pub server: Arc<AudioSocketServer>,
    pub broadcast_debug: bool,
}

impl OutboundAudio for AudioSocketOutbound {
    fn send_audio(&self, session: &CallSession, buffer: &[u8]) -> bool {
        let Some(conn_id) = session.audiosocket_conn_id.as_deref() else {
            log::warn!(
                "[Stream] Streaming transport missing AudioSocket connection: call={}",
                session.call_id
            );
            return false;
        };
        if self.broadcast_debug && session.audiosocket_conns.len() > 1 {
            let mut sent = 0usize;
            for conn in &session.audiosocket_conns {
                if self.server.send_audio(conn, buffer) {
                    sent += 1;
                }
            }
            if sent == 0 {
                log::warn!(
                    "[Stream] AudioSocket broadcast send failed (no recipients): call={}",
                    session.call_id
                );
                return false;
            }
            return true;
        }
        self.server.send_audio(conn_id, buffer)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::AudioSocket
    }
}

/// Per-stream lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Created,
    Warming,
    Streaming,
    TailFlushing,
    Ended,
}

/// Shared state of one active stream.
struct StreamContext {
    stream_id: String,
    call_id: String,
    playback_type: PlaybackType,
    started_at: Instant,

    source: AudioFormat,
    target: AudioFormat,
    egress_swap_mode: EgressSwapMode,

    // Warm-up thresholds, resolved at start.
    min_start_chunks: usize,
    low_watermark_chunks: usize,
    resume_floor_chunks: usize,
    jitter_buffer_chunks: usize,

    phase: Mutex<StreamPhase>,
    startup_ready: AtomicBool,
    producer_done: AtomicBool,
    first_frame_observed: AtomicBool,

    egress_swap: AtomicBool,
    egress_probe_done: AtomicBool,
    src_endian_probe_done: AtomicBool,
    src_endian_swapped: AtomicBool,
    src_dc_correction_logged: AtomicBool,
    post_resample_dc_logged: AtomicBool,
    warned_grace_cap: AtomicBool,
    cleanup_done: AtomicBool,

    /// Bytes currently in the jitter queue (enqueue adds, dequeue removes).
    buffered_bytes: AtomicU64,
    queued_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    frames_sent: AtomicU64,
    underflow_events: AtomicU64,
    provider_bytes: AtomicU64,

    last_chunk_time: Mutex<Instant>,
    end_reason: Mutex<Option<String>>,
    /// Set when producer/keepalive wants the pacer to run file fallback.
    fallback_reason: Mutex<Option<String>>,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamContext {
    fn set_phase(&self, phase: StreamPhase) {
        *self.phase.lock() = phase;
    }

    fn set_end_reason_if_unset(&self, reason: &str) {
        let mut guard = self.end_reason.lock();
        if guard.is_none() {
            *guard = Some(reason.to_string());
        }
    }

    /// Frame-count estimate from queue bytes plus the pacer's remainder.
    fn available_frames(&self, remainder_len: usize, frame_size: usize) -> usize {
        let bytes = self.buffered_bytes.load(Ordering::Relaxed) as usize + remainder_len;
        bytes / frame_size.max(1)
    }

    fn decrement_buffered(&self, amount: usize) {
        let mut current = self.buffered_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount as u64);
            if current < amount as u64 {
                log::warn!(
                    "[Stream] buffered_bytes underflow clamped: call={}, have={current}, take={amount}",
                    self.call_id
                );
            }
            match self.buffered_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Counters and thresholds snapshot, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub playback_type: PlaybackType,
    pub phase: StreamPhase,
    pub min_start_chunks: usize,
    pub low_watermark_chunks: usize,
    pub resume_floor_chunks: usize,
    pub jitter_buffer_chunks: usize,
    pub buffered_bytes: u64,
    pub queued_bytes: u64,
    pub tx_bytes: u64,
    pub frames_sent: u64,
    pub underflow_events: u64,
    pub provider_bytes: u64,
    pub egress_swap: bool,
    pub end_reason: Option<String>,
}

/// Manages streaming audio playback with automatic file-playback fallback.
pub struct StreamingPlaybackManager {
    session_store: Arc<SessionStore>,
    coordinator: Arc<ConversationCoordinator>,
    fallback: Option<Arc<FallbackPlaybackManager>>,
    settings: StreamingSettings,
    transport: parking_lot::RwLock<Option<Arc<dyn OutboundAudio>>>,
    /// Target format of the AudioSocket leg (dialplan contract).
    audiosocket_format: parking_lot::RwLock<Encoding>,

    streams: DashMap<String, Arc<StreamContext>>,
    last_segment_end: DashMap<String, Instant>,
}

impl StreamingPlaybackManager {
    pub fn new(
        session_store: Arc<SessionStore>,
        coordinator: Arc<ConversationCoordinator>,
        fallback: Option<Arc<FallbackPlaybackManager>>,
        settings: StreamingSettings,
    ) -> Self {
        log::info!(
            "[Stream] Playback manager initialized: sample_rate={}, jitter_buffer_ms={}, chunk_size_ms={}, egress_swap_mode={}",
            settings.sample_rate,
            settings.jitter_buffer_ms,
            settings.chunk_size_ms,
            settings.egress_swap_mode.as_str(),
        );
        Self {
            session_store,
            coordinator,
            fallback,
            settings,
            transport: parking_lot::RwLock::new(None),
            audiosocket_format: parking_lot::RwLock::new(Encoding::Ulaw),
            streams: DashMap::new(),
            last_segment_end: DashMap::new(),
        }
    }

    /// Binds (or replaces) the outbound media transport.
    pub fn set_transport(
        &self,
        transport: Arc<dyn OutboundAudio>,
        audiosocket_format: Option<Encoding>,
    ) {
        *self.transport.write() = Some(transport);
        if let Some(format) = audiosocket_format {
            *self.audiosocket_format.write() = format;
        }
    }

    pub fn is_stream_active(&self, call_id: &str) -> bool {
        self.streams
            .get(call_id)
            .is_some_and(|ctx| !ctx.cleanup_done.load(Ordering::SeqCst))
    }

    /// Records the cumulative bytes the provider reported for this segment.
    pub fn record_provider_bytes(&self, call_id: &str, provider_bytes: u64) {
        if let Some(ctx) = self.streams.get(call_id) {
            ctx.provider_bytes.store(provider_bytes, Ordering::Relaxed);
        }
    }

    pub fn stream_snapshot(&self, call_id: &str) -> Option<StreamSnapshot> {
        let ctx = self.streams.get(call_id)?;
        let snapshot = StreamSnapshot {
            stream_id: ctx.stream_id.clone(),
            playback_type: ctx.playback_type,
            phase: *ctx.phase.lock(),
            min_start_chunks: ctx.min_start_chunks,
            low_watermark_chunks: ctx.low_watermark_chunks,
            resume_floor_chunks: ctx.resume_floor_chunks,
            jitter_buffer_chunks: ctx.jitter_buffer_chunks,
            buffered_bytes: ctx.buffered_bytes.load(Ordering::Relaxed),
            queued_bytes: ctx.queued_bytes.load(Ordering::Relaxed),
            tx_bytes: ctx.tx_bytes.load(Ordering::Relaxed),
            frames_sent: ctx.frames_sent.load(Ordering::Relaxed),
            underflow_events: ctx.underflow_events.load(Ordering::Relaxed),
            provider_bytes: ctx.provider_bytes.load(Ordering::Relaxed),
            egress_swap: ctx.egress_swap.load(Ordering::Relaxed),
            end_reason: ctx.end_reason.lock().clone(),
        };
        Some(snapshot)
    }

    /// Starts streaming playback for a call.
    ///
    /// Idempotent while a stream is active: returns the existing stream id.
    /// Returns `None` on gating-token contention or an unknown call.
    pub fn start_streaming_playback(
        self: &Arc<Self>,
        call_id: &str,
        audio_chunks: mpsc::Receiver<Bytes>,
        playback_type: PlaybackType,
        source: AudioFormat,
        target: Option<AudioFormat>,
    ) -> Option<String> {
        if let Some(existing) = self.streams.get(call_id) {
            if !existing.cleanup_done.load(Ordering::SeqCst) {
                log::debug!(
                    "[Stream] Streaming already active: call={call_id}, stream={}",
                    existing.stream_id
                );
                return Some(existing.stream_id.clone());
            }
        }
        if self.session_store.get(call_id).is_none() {
            log::error!("[Stream] Cannot start streaming - call session not found: call={call_id}");
            return None;
        }

        let sid = stream_id(playback_type, call_id, epoch_ms());
        let chunk_ms = self.settings.chunk_size_ms.max(1);
        let jb_chunks = (self.settings.jitter_buffer_ms.div_ceil(chunk_ms)).max(1) as usize;

        // Adaptive warm-up from the gap since the previous segment ended:
        // back-to-back resumes start shallow, cold resumes build depth.
        let gap_ms = self
            .last_segment_end
            .get(call_id)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(u64::MAX);
        let grace_ms = self.settings.provider_grace_ms;
        let base_min_ms = self.settings.min_start_ms.max(1);
        let back_to_back = gap_ms <= grace_ms;

        let adaptive_min_ms = match playback_type {
            PlaybackType::Greeting => base_min_ms,
            _ if back_to_back => (base_min_ms / 2).max(80),
            _ => base_min_ms.max(400),
        };
        let resume_floor_ms = match playback_type {
            PlaybackType::Greeting => base_min_ms,
            _ if back_to_back => adaptive_min_ms.clamp(RESUME_FLOOR_MIN_MS, RESUME_FLOOR_MAX_MS),
            _ => adaptive_min_ms,
        };
        let configured_min_chunks = if playback_type == PlaybackType::Greeting
            && self.settings.greeting_min_start_ms > 0
        {
            self.settings.greeting_min_start_ms.div_ceil(chunk_ms).max(1) as usize
        } else {
            adaptive_min_ms.div_ceil(chunk_ms).max(1) as usize
        };
        let resume_floor_chunks = resume_floor_ms.div_ceil(chunk_ms).max(1) as usize;

        // Never demand more buffered chunks than the queue can hold, and
        // leave one spare slot so playback does not dip below the
        // watermark on the very first frame.
        let max_startable = jb_chunks.saturating_sub(1).max(1);
        let min_start_chunks = configured_min_chunks.min(max_startable).max(1);
        if configured_min_chunks > min_start_chunks {
            log::debug!(
                "[Stream] min_start clamped: call={call_id}, configured={configured_min_chunks}, jitter={jb_chunks}, applied={min_start_chunks}"
            );
        }

        // Low watermark: configured value is a floor, scaled to ~2/3 of the
        // effective warm-up, capped below min_start and half the queue.
        let configured_lw_chunks = (self.settings.low_watermark_ms.div_ceil(chunk_ms)) as usize;
        let scaled_lw = min_start_chunks.saturating_mul(2).div_ceil(3);
        let wanted_lw = configured_lw_chunks.max(scaled_lw);
        let lw_cap = min_start_chunks.saturating_sub(1).min(jb_chunks / 2);
        let low_watermark_chunks = wanted_lw.min(lw_cap);
        if wanted_lw > low_watermark_chunks {
            log::debug!(
                "[Stream] low_watermark clamped: call={call_id}, wanted={wanted_lw}, applied={low_watermark_chunks}, min_start={min_start_chunks}"
            );
        }

        let initial_startup_ready = back_to_back;
        log::info!(
            "[Stream] Adaptive warm-up: call={call_id}, type={}, gap_ms={}, adaptive_min_ms={adaptive_min_ms}, resume_floor_chunks={resume_floor_chunks}, min_start_chunks={min_start_chunks}, low_watermark_chunks={low_watermark_chunks}, jitter_chunks={jb_chunks}, startup_ready_reused={initial_startup_ready}",
            playback_type.as_str(),
            if gap_ms == u64::MAX { -1i64 } else { gap_ms as i64 },
        );

        // Resolve the downstream target for this stream.
        let audiosocket_format = *self.audiosocket_format.read();
        let mut resolved_target = target.unwrap_or(AudioFormat::new(
            audiosocket_format,
            self.settings.sample_rate,
        ));
        if self.settings.egress_force_mulaw && audiosocket_format == Encoding::Ulaw {
            resolved_target = AudioFormat::ulaw_8k();
        }
        if resolved_target.sample_rate == 0 {
            resolved_target.sample_rate = resolved_target.encoding.default_sample_rate();
        }

        // Gating: the stream speaks only while it holds the token.
        if !self.coordinator.on_tts_start(call_id, &sid) {
            log::error!("[Stream] Failed to start streaming gating: call={call_id}, stream={sid}");
            return None;
        }

        // Egress swap preset: forced modes decide now, auto starts from the
        // inbound probe verdict and is confirmed by the egress probe.
        let inbound_swap = self
            .session_store
            .get(call_id)
            .map(|s| s.vad_state.get("pcm16_inbound_swap").copied().unwrap_or(false))
            .unwrap_or(false);
        let egress_swap = match self.settings.egress_swap_mode {
            EgressSwapMode::ForceTrue => true,
            EgressSwapMode::ForceFalse => false,
            EgressSwapMode::Auto => {
                resolved_target.encoding == Encoding::Slin16 && inbound_swap
            }
        };

        let ctx = Arc::new(StreamContext {
            stream_id: sid.clone(),
            call_id: call_id.to_string(),
            playback_type,
            started_at: Instant::now(),
            source,
            target: resolved_target,
            egress_swap_mode: self.settings.egress_swap_mode,
            min_start_chunks,
            low_watermark_chunks,
            resume_floor_chunks,
            jitter_buffer_chunks: jb_chunks,
            phase: Mutex::new(StreamPhase::Created),
            startup_ready: AtomicBool::new(initial_startup_ready),
            producer_done: AtomicBool::new(false),
            first_frame_observed: AtomicBool::new(false),
            egress_swap: AtomicBool::new(egress_swap),
            egress_probe_done: AtomicBool::new(false),
            src_endian_probe_done: AtomicBool::new(false),
            src_endian_swapped: AtomicBool::new(false),
            src_dc_correction_logged: AtomicBool::new(false),
            post_resample_dc_logged: AtomicBool::new(false),
            warned_grace_cap: AtomicBool::new(false),
            cleanup_done: AtomicBool::new(false),
            buffered_bytes: AtomicU64::new(0),
            queued_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            underflow_events: AtomicU64::new(0),
            provider_bytes: AtomicU64::new(0),
            last_chunk_time: Mutex::new(Instant::now()),
            end_reason: Mutex::new(None),
            fallback_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        self.streams.insert(call_id.to_string(), Arc::clone(&ctx));

        metrics()
            .streaming_active
            .with_label_values(&[call_id])
            .set(1);
        metrics()
            .stream_started_total
            .with_label_values(&[call_id, playback_type.as_str()])
            .inc();
        self.session_store.update(call_id, |s| {
            s.streaming_started = true;
            s.current_stream_id = Some(sid.clone());
        });

        let (jitter_tx, jitter_rx) = mpsc::channel::<Bytes>(jb_chunks);

        let producer = tokio::spawn(Self::producer_loop(
            Arc::clone(self),
            Arc::clone(&ctx),
            audio_chunks,
            jitter_tx,
        ));
        let pacer = tokio::spawn(Self::pacer_loop(
            Arc::clone(self),
            Arc::clone(&ctx),
            jitter_rx,
        ));
        let keepalive = tokio::spawn(Self::keepalive_loop(Arc::clone(self), Arc::clone(&ctx)));
        ctx.tasks.lock().extend([producer, pacer, keepalive]);
        ctx.set_phase(if initial_startup_ready {
            StreamPhase::Streaming
        } else {
            StreamPhase::Warming
        });

        log::info!(
            "[Stream] Streaming playback started: call={call_id}, stream={sid}, type={}, source={}@{}, target={}@{}",
            playback_type.as_str(),
            source.encoding.as_str(),
            source.sample_rate,
            resolved_target.encoding.as_str(),
            resolved_target.sample_rate,
        );
        Some(sid)
    }

    /// Stops streaming playback. The second call for the same stream is a
    /// no-op returning `false`.
    pub async fn stop_streaming_playback(&self, call_id: &str) -> bool {
        let Some(ctx) = self.streams.get(call_id).map(|c| Arc::clone(&c)) else {
            log::warn!("[Stream] No active streaming to stop: call={call_id}");
            return false;
        };
        ctx.set_end_reason_if_unset("stopped");
        ctx.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = ctx.tasks.lock().drain(..).collect();
        for handle in handles {
            // The pacer promises to exit within one chunk duration plus the
            // capped tail-flush grace; give it a generous bound.
            if tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .is_err()
            {
                log::warn!("[Stream] Stream task slow to stop: call={call_id}");
            }
        }
        // Pacer normally runs cleanup on exit; cover the abort path.
        self.cleanup_stream(&ctx, &mut Vec::new(), None).await;
        log::info!(
            "[Stream] Streaming playback stopped: call={call_id}, stream={}",
            ctx.stream_id
        );
        true
    }

    /// Ends streams older than `max_age`. Returns how many were reaped.
    pub async fn cleanup_expired_streams(&self, max_age: Duration) -> usize {
        let expired: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| entry.started_at.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        let mut reaped = 0;
        for call_id in expired {
            if let Some(ctx) = self.streams.get(&call_id).map(|c| Arc::clone(&c)) {
                ctx.set_end_reason_if_unset("expired");
                if self.stop_streaming_playback(&call_id).await {
                    reaped += 1;
                }
            }
        }
        reaped
    }

    // ── Producer ────────────────────────────────────────────────────────

    /// Drains the provider chunk channel into the jitter buffer. A stall
    /// longer than `fallback_timeout_ms` hands the stream to the fallback
    /// path; channel closure is the end-of-stream sentinel.
    async fn producer_loop(
        manager: Arc<Self>,
        ctx: Arc<StreamContext>,
        mut audio_chunks: mpsc::Receiver<Bytes>,
        jitter_tx: mpsc::Sender<Bytes>,
    ) {
        let fallback_timeout = Duration::from_millis(manager.settings.fallback_timeout_ms.max(1));
        loop {
            let chunk = tokio::select! {
                () = ctx.cancel.cancelled() => break,
                received = tokio::time::timeout(fallback_timeout, audio_chunks.recv()) => {
                    match received {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => {
                            log::info!(
                                "[Stream] End of stream: call={}, stream={}",
                                ctx.call_id, ctx.stream_id
                            );
                            ctx.set_end_reason_if_unset("end-of-stream");
                            break;
                        }
                        Err(_) => {
                            let reason =
                                format!("timeout>{}s", fallback_timeout.as_secs_f64());
                            log::warn!(
                                "[Stream] Producer timeout, falling back to file playback: call={}, stream={}, {reason}",
                                ctx.call_id, ctx.stream_id
                            );
                            manager.record_fallback(&ctx, &reason);
                            *ctx.fallback_reason.lock() = Some(reason.clone());
                            ctx.set_end_reason_if_unset(&reason);
                            ctx.cancel.cancel();
                            break;
                        }
                    }
                }
            };
            if chunk.is_empty() {
                continue;
            }

            *ctx.last_chunk_time.lock() = Instant::now();
            metrics()
                .streaming_bytes_total
                .with_label_values(&[ctx.call_id.as_str()])
                .inc_by(chunk.len() as u64);

            let len = chunk.len();
            // Account before the send so the pacer's decrement can never
            // observe the chunk ahead of the increment.
            ctx.buffered_bytes.fetch_add(len as u64, Ordering::Relaxed);
            ctx.queued_bytes.fetch_add(len as u64, Ordering::Relaxed);
            // Bounded channel: this send blocks when the jitter buffer is
            // full, back-pressuring the provider.
            if jitter_tx.send(chunk).await.is_err() {
                ctx.decrement_buffered(len);
                break;
            }

            let depth =
                (jitter_tx.max_capacity() - jitter_tx.capacity()).min(ctx.jitter_buffer_chunks);
            metrics()
                .streaming_jitter_depth
                .with_label_values(&[ctx.call_id.as_str()])
                .set(depth as i64);
            manager.session_store.update(&ctx.call_id, |s| {
                s.streaming_bytes_sent += len as u64;
                s.streaming_jitter_buffer_depth = depth;
            });
        }
        ctx.producer_done.store(true, Ordering::SeqCst);
    }

    // ── Pacer ───────────────────────────────────────────────────────────

    /// Drains the jitter buffer, converts, and transmits. Owns the frame
    /// remainder and all per-stream codec state, runs the tail flush, and
    /// performs cleanup exactly once on exit.
    async fn pacer_loop(
        manager: Arc<Self>,
        ctx: Arc<StreamContext>,
        mut jitter_rx: mpsc::Receiver<Bytes>,
    ) {
        let chunk_ms = manager.settings.chunk_size_ms.max(1);
        let chunk_dur = Duration::from_millis(chunk_ms);
        let frame_size = ctx.target.frame_bytes(chunk_ms as u32);
        let idle_dur = Duration::from_millis((chunk_ms / 10).max(1));

        let mut remainder: Vec<u8> = Vec::new();
        let mut resample_state: Option<ResampleState> = None;
        let mut dc_block = DcBlocker::new();
        let mut transport_failed = false;

        'run: loop {
            if ctx.cancel.is_cancelled() {
                break;
            }

            // Warm-up gate: hold all sends until the buffer has the minimum
            // startup depth, the producer already finished, or the segment
            // was admitted as a back-to-back resume.
            if !ctx.startup_ready.load(Ordering::SeqCst) {
                let available = ctx.available_frames(remainder.len(), frame_size);
                if available >= ctx.min_start_chunks || ctx.producer_done.load(Ordering::SeqCst) {
                    ctx.startup_ready.store(true, Ordering::SeqCst);
                    ctx.set_phase(StreamPhase::Streaming);
                    log::debug!(
                        "[Stream] Warm-up complete: call={}, stream={}, buffered_frames={available}",
                        ctx.call_id, ctx.stream_id
                    );
                } else {
                    tokio::select! {
                        () = ctx.cancel.cancelled() => break 'run,
                        () = tokio::time::sleep(idle_dur) => continue 'run,
                    }
                }
            }

            match jitter_rx.try_recv() {
                Ok(chunk) => {
                    ctx.decrement_buffered(chunk.len());
                    let processed = manager.process_chunk(
                        &ctx,
                        &chunk,
                        &mut resample_state,
                        &mut dc_block,
                    );
                    let Some(processed) = processed else { continue };

                    match manager.transport_kind() {
                        Some(TransportKind::AudioSocket) => {
                            remainder.extend_from_slice(&processed);
                            while remainder.len() >= frame_size {
                                if ctx.cancel.is_cancelled() {
                                    break 'run;
                                }
                                let frame: Vec<u8> = remainder.drain(..frame_size).collect();
                                if !manager.send_buffer(&ctx, &frame) {
                                    transport_failed = true;
                                    break 'run;
                                }
                                tokio::time::sleep(chunk_dur).await;
                            }
                            // Cadence guard: if this chunk drained everything
                            // and nothing else is queued, one filler frame
                            // keeps the 20 ms clock from stalling.
                            if remainder.is_empty()
                                && ctx.buffered_bytes.load(Ordering::Relaxed) == 0
                                && !ctx.producer_done.load(Ordering::SeqCst)
                            {
                                let filler =
                                    vec![ctx.target.encoding.silence_byte(); frame_size];
                                if manager.send_buffer(&ctx, &filler) {
                                    ctx.underflow_events.fetch_add(1, Ordering::Relaxed);
                                    metrics()
                                        .stream_underflow_events_total
                                        .with_label_values(&[ctx.call_id.as_str()])
                                        .inc();
                                    metrics()
                                        .stream_filler_bytes_total
                                        .with_label_values(&[ctx.call_id.as_str()])
                                        .inc_by(filler.len() as u64);
                                }
                                tokio::time::sleep(chunk_dur).await;
                            }
                        }
                        Some(TransportKind::Rtp) => {
                            if !manager.send_buffer(&ctx, &processed) {
                                transport_failed = true;
                                break 'run;
                            }
                        }
                        None => {
                            log::warn!(
                                "[Stream] Streaming transport unavailable: call={}",
                                ctx.call_id
                            );
                            transport_failed = true;
                            break 'run;
                        }
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    // AudioSocket: a remainder can hold whole frames even
                    // with an empty queue; keep the cadence going.
                    if manager.transport_kind() == Some(TransportKind::AudioSocket)
                        && remainder.len() >= frame_size
                    {
                        let frame: Vec<u8> = remainder.drain(..frame_size).collect();
                        if !manager.send_buffer(&ctx, &frame) {
                            transport_failed = true;
                            break 'run;
                        }
                        tokio::time::sleep(chunk_dur).await;
                        continue;
                    }

                    let available = ctx.available_frames(remainder.len(), frame_size);
                    if available == 0 && ctx.low_watermark_chunks > 0 {
                        // True empty: bounded rebuild wait, then dribble.
                        manager.rebuild_wait(&ctx, remainder.len(), frame_size).await;
                    }
                    tokio::select! {
                        () = ctx.cancel.cancelled() => break 'run,
                        () = tokio::time::sleep(idle_dur) => {}
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // Producer finished and the queue is drained.
                    break 'run;
                }
            }
        }

        let fallback_reason = ctx.fallback_reason.lock().clone();
        if transport_failed && fallback_reason.is_none() {
            manager.record_fallback(&ctx, "transport-failure");
            ctx.set_end_reason_if_unset("transport-failure");
            manager
                .run_file_fallback(&ctx, &mut jitter_rx, "transport-failure")
                .await;
            manager.cleanup_stream(&ctx, &mut remainder, Some(&mut jitter_rx)).await;
            return;
        }
        if let Some(reason) = fallback_reason {
            manager.run_file_fallback(&ctx, &mut jitter_rx, &reason).await;
            manager.cleanup_stream(&ctx, &mut remainder, Some(&mut jitter_rx)).await;
            return;
        }

        manager.cleanup_stream(&ctx, &mut remainder, Some(&mut jitter_rx)).await;
    }

    /// Low-watermark rebuild: waits (bounded by the capped grace) for the
    /// buffer to reach the resume target before dribbling resumes.
    async fn rebuild_wait(&self, ctx: &StreamContext, remainder_len: usize, frame_size: usize) {
        let target = ctx.min_start_chunks.max(ctx.low_watermark_chunks + 1);
        let configured = Duration::from_millis(self.settings.provider_grace_ms);
        if configured > GRACE_CAP && !ctx.warned_grace_cap.swap(true, Ordering::SeqCst) {
            log::warn!(
                "[Stream] provider_grace_ms capped: call={}, configured_ms={}, cap_ms={}",
                ctx.call_id,
                self.settings.provider_grace_ms,
                GRACE_CAP.as_millis(),
            );
        }
        let max_wait = configured.min(GRACE_CAP);
        let chunk_dur = Duration::from_millis(self.settings.chunk_size_ms.max(1));
        let t0 = Instant::now();
        while ctx.available_frames(remainder_len, frame_size) < target
            && t0.elapsed() < max_wait
            && !ctx.cancel.is_cancelled()
            && !ctx.producer_done.load(Ordering::SeqCst)
        {
            tokio::time::sleep(chunk_dur.min(max_wait)).await;
        }
        let after = ctx.available_frames(remainder_len, frame_size);
        if after > 0 && after <= ctx.low_watermark_chunks {
            log::debug!(
                "[Stream] Dribble mode active: call={}, stream={}, buffered_frames={after}, target_frames={target}",
                ctx.call_id, ctx.stream_id
            );
        }
    }

    // ── Keepalive ───────────────────────────────────────────────────────

    /// Chunk-liveness watchdog: a gap beyond `connection_timeout_ms` ends
    /// the stream through the fallback path.
    async fn keepalive_loop(manager: Arc<Self>, ctx: Arc<StreamContext>) {
        let interval = Duration::from_millis(manager.settings.keepalive_interval_ms.max(1));
        let timeout = Duration::from_millis(manager.settings.connection_timeout_ms.max(1));
        loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            if ctx.cleanup_done.load(Ordering::SeqCst) {
                return;
            }

            let since_last = ctx.last_chunk_time.lock().elapsed();
            metrics()
                .streaming_keepalives_sent_total
                .with_label_values(&[ctx.call_id.as_str()])
                .inc();
            manager
                .session_store
                .update(&ctx.call_id, |s| s.streaming_keepalive_sent += 1);

            if since_last > timeout {
                let reason = format!("keepalive-timeout>{:.2}s", since_last.as_secs_f64());
                log::warn!(
                    "[Stream] Connection timeout: call={}, stream={}, since_last_chunk={:.2}s",
                    ctx.call_id,
                    ctx.stream_id,
                    since_last.as_secs_f64(),
                );
                metrics()
                    .streaming_keepalive_timeouts_total
                    .with_label_values(&[ctx.call_id.as_str()])
                    .inc();
                manager.session_store.update(&ctx.call_id, |s| {
                    s.streaming_keepalive_timeouts += 1;
                    s.last_streaming_error = Some(reason.clone());
                });
                *ctx.fallback_reason.lock() = Some("keepalive-timeout".to_string());
                ctx.set_end_reason_if_unset("keepalive-timeout");
                ctx.cancel.cancel();
                return;
            }
            log::debug!(
                "[Stream] Keepalive tick: call={}, stream={}",
                ctx.call_id,
                ctx.stream_id
            );
        }
    }

    // ── Chunk processing ────────────────────────────────────────────────

    /// Converts one provider chunk into the stream's target format,
    /// carrying resampler and DC-block state across chunks.
    fn process_chunk(
        &self,
        ctx: &StreamContext,
        chunk: &[u8],
        resample_state: &mut Option<ResampleState>,
        dc_block: &mut DcBlocker,
    ) -> Option<Vec<u8>> {
        if chunk.is_empty() {
            return None;
        }
        let source = ctx.source;
        let target = ctx.target;

        // Fast path: µ-law in, µ-law out at the same rate.
        if source.encoding == Encoding::Ulaw
            && target.encoding == Encoding::Ulaw
            && source.sample_rate == target.sample_rate
        {
            *resample_state = None;
            return Some(chunk.to_vec());
        }
        // Fast path: PCM16 in and out at the same rate. The source probe
        // is skipped here; the egress probe alone decides the byte order.
        if source.encoding == Encoding::Slin16
            && target.encoding == Encoding::Slin16
            && source.sample_rate == target.sample_rate
        {
            *resample_state = None;
            return Some(self.apply_egress_endianness(ctx, chunk.to_vec()));
        }

        // Normalize the source to PCM16.
        let mut working = match source.encoding {
            Encoding::Ulaw => mulaw_to_pcm16le(chunk),
            Encoding::Alaw => alaw_to_pcm16le(chunk),
            Encoding::Slin16 => {
                let corrected = self.correct_source_endianness(ctx, chunk);
                // Strip any gross DC offset before resampling.
                let dc = dc_offset(&corrected);
                if dc.unsigned_abs() >= 1024 {
                    if !ctx.src_dc_correction_logged.swap(true, Ordering::SeqCst) {
                        log::info!(
                            "[Stream] Source PCM16 DC correction applied: call={}, dc_before={dc}",
                            ctx.call_id
                        );
                    }
                    apply_bias(&corrected, -dc)
                } else {
                    corrected
                }
            }
        };

        // Resample to the target rate.
        if source.sample_rate != target.sample_rate {
            let (resampled, next) = resample(
                &working,
                source.sample_rate,
                target.sample_rate,
                *resample_state,
            );
            working = resampled;
            *resample_state = next;
        } else {
            *resample_state = None;
        }

        // Post-resample clamp at a lower threshold for residual bias.
        let dc2 = dc_offset(&working);
        if dc2.unsigned_abs() >= 256 {
            if !ctx.post_resample_dc_logged.swap(true, Ordering::SeqCst) {
                log::info!(
                    "[Stream] Post-resample DC correction applied: call={}, dc_before={dc2}",
                    ctx.call_id
                );
            }
            working = apply_bias(&working, -dc2);
        }

        match target.encoding {
            Encoding::Ulaw | Encoding::Alaw => Some(pcm16le_to_mulaw(&working)),
            Encoding::Slin16 => {
                let filtered = dc_block.process(&working);
                Some(self.apply_egress_endianness(ctx, filtered))
            }
        }
    }

    /// One-shot inbound probe for PCM16 sources, then consistent swapping.
    fn correct_source_endianness(&self, ctx: &StreamContext, chunk: &[u8]) -> Vec<u8> {
        if !ctx.src_endian_probe_done.swap(true, Ordering::SeqCst) {
            let prefer_swapped = probe_endianness(chunk);
            log::info!(
                "[Stream] Source PCM16 endian probe: call={}, prefer_swapped={prefer_swapped}",
                ctx.call_id
            );
            if prefer_swapped {
                ctx.src_endian_swapped.store(true, Ordering::SeqCst);
            }
        }
        if ctx.src_endian_swapped.load(Ordering::SeqCst) {
            byteswap(chunk)
        } else {
            chunk.to_vec()
        }
    }

    /// Egress byte-order handling for PCM16 targets: probe once on the
    /// first frame (auto mode), then swap consistently for the stream.
    fn apply_egress_endianness(&self, ctx: &StreamContext, pcm: Vec<u8>) -> Vec<u8> {
        if pcm.is_empty() || ctx.target.encoding != Encoding::Slin16 {
            return pcm;
        }
        let mode = ctx.egress_swap_mode;

        if mode == EgressSwapMode::ForceTrue {
            ctx.egress_swap.store(true, Ordering::SeqCst);
            return byteswap(&pcm);
        }

        if !ctx.egress_probe_done.swap(true, Ordering::SeqCst) {
            let rms_native = rms(&pcm);
            let swapped = byteswap(&pcm);
            let rms_swapped = rms(&swapped);
            log::info!(
                "[Stream] Egress probe: call={}, stream={}, mode={}, rms_native={rms_native}, rms_swapped={rms_swapped}",
                ctx.call_id,
                ctx.stream_id,
                mode.as_str(),
            );
            if mode != EgressSwapMode::ForceFalse
                && !ctx.egress_swap.load(Ordering::SeqCst)
                && rms_swapped >= 512.max(4 * rms_native.max(1))
            {
                ctx.egress_swap.store(true, Ordering::SeqCst);
                metrics()
                    .stream_endian_corrections_total
                    .with_label_values(&[ctx.call_id.as_str(), mode.as_str()])
                    .inc();
                log::warn!(
                    "[Stream] Auto-correcting PCM16 egress endianness: call={}, stream={}, rms_native={rms_native}, rms_swapped={rms_swapped}",
                    ctx.call_id,
                    ctx.stream_id,
                );
                return swapped;
            }
        }

        if mode != EgressSwapMode::ForceFalse && ctx.egress_swap.load(Ordering::SeqCst) {
            byteswap(&pcm)
        } else {
            pcm
        }
    }

    // ── Transmission ────────────────────────────────────────────────────

    fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.read().as_ref().map(|t| t.kind())
    }

    fn send_buffer(&self, ctx: &StreamContext, buffer: &[u8]) -> bool {
        let Some(transport) = self.transport.read().clone() else {
            return false;
        };
        let Some(session) = self.session_store.get(&ctx.call_id) else {
            log::warn!("[Stream] Cannot stream audio - session not found: call={}", ctx.call_id);
            return false;
        };

        let success = transport.send_audio(&session, buffer);
        if !success {
            log::warn!(
                "[Stream] Transport send failed: call={}, stream={}",
                ctx.call_id,
                ctx.stream_id
            );
            return false;
        }

        ctx.tx_bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        ctx.frames_sent.fetch_add(1, Ordering::Relaxed);
        metrics()
            .stream_tx_bytes_total
            .with_label_values(&[ctx.call_id.as_str()])
            .inc_by(buffer.len() as u64);
        metrics()
            .stream_frames_sent_total
            .with_label_values(&[ctx.call_id.as_str()])
            .inc();

        if !ctx.first_frame_observed.swap(true, Ordering::SeqCst) {
            let first = ctx.started_at.elapsed().as_secs_f64();
            metrics()
                .stream_first_frame_seconds
                .with_label_values(&[ctx.call_id.as_str(), ctx.playback_type.as_str()])
                .observe(first);
            log::info!(
                "[Stream] First outbound frame: call={}, stream={}, bytes={}, latency={first:.3}s, target={}@{}, egress_swap={}",
                ctx.call_id,
                ctx.stream_id,
                buffer.len(),
                ctx.target.encoding.as_str(),
                ctx.target.sample_rate,
                ctx.egress_swap.load(Ordering::Relaxed),
            );
        }
        true
    }

    // ── Fallback ────────────────────────────────────────────────────────

    fn record_fallback(&self, ctx: &StreamContext, reason: &str) {
        metrics()
            .streaming_fallbacks_total
            .with_label_values(&[ctx.call_id.as_str()])
            .inc();
        self.session_store.update(&ctx.call_id, |s| {
            s.streaming_fallback_count += 1;
            s.last_streaming_error = Some(reason.to_string());
        });
    }

    /// Converts everything left in the jitter buffer to µ-law@8k and plays
    /// it through the file-playback path.
    async fn run_file_fallback(
        &self,
        ctx: &StreamContext,
        jitter_rx: &mut mpsc::Receiver<Bytes>,
        reason: &str,
    ) {
        let Some(fallback) = self.fallback.as_ref() else {
            log::error!(
                "[Stream] No fallback playback manager available: call={}",
                ctx.call_id
            );
            return;
        };
        let Some(session) = self.session_store.get(&ctx.call_id) else {
            return;
        };

        let mut remaining = Vec::new();
        while let Ok(chunk) = jitter_rx.try_recv() {
            ctx.decrement_buffered(chunk.len());
            remaining.extend_from_slice(&chunk);
        }
        if remaining.is_empty() {
            return;
        }

        // Normalize the provider buffer to µ-law @ 8 kHz for file playback.
        let source = ctx.source;
        let (pcm, rate) = match source.encoding {
            Encoding::Ulaw => (mulaw_to_pcm16le(&remaining), 8000),
            Encoding::Alaw => (alaw_to_pcm16le(&remaining), 8000),
            Encoding::Slin16 => (remaining, source.sample_rate),
        };
        let pcm_8k = if rate != 8000 {
            resample(&pcm, rate, 8000, None).0
        } else {
            pcm
        };
        let mulaw = pcm16le_to_mulaw(&pcm_8k);

        match fallback
            .play_audio(
                &ctx.call_id,
                &session.caller_channel_id,
                &mulaw,
                "streaming-fallback",
            )
            .await
        {
            Ok(playback_id) => log::info!(
                "[Stream] Switched to file playback: call={}, stream={}, fallback={playback_id}, reason={reason}",
                ctx.call_id,
                ctx.stream_id,
            ),
            Err(e) => log::error!(
                "[Stream] Failed to start fallback file playback: call={}, stream={}, error={e}",
                ctx.call_id,
                ctx.stream_id,
            ),
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────────

    /// Tail flush, gating release, metrics, and stream removal. Runs once
    /// per stream no matter how many exit paths race into it.
    async fn cleanup_stream(
        &self,
        ctx: &Arc<StreamContext>,
        remainder: &mut Vec<u8>,
        jitter_rx: Option<&mut mpsc::Receiver<Bytes>>,
    ) {
        if ctx.cleanup_done.swap(true, Ordering::SeqCst) {
            return;
        }
        ctx.set_phase(StreamPhase::TailFlushing);

        // Give the provider a short grace so a trailing chunk can land,
        // then flush the remainder.
        let grace = Duration::from_millis(self.settings.provider_grace_ms).min(GRACE_CAP);
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        // A trailing chunk may have arrived during the grace; it joins the
        // remainder flush rather than being dropped.
        if let Some(rx) = jitter_rx {
            while let Ok(chunk) = rx.try_recv() {
                ctx.decrement_buffered(chunk.len());
                let mut state = None;
                let mut dc = DcBlocker::new();
                if let Some(processed) = self.process_chunk(ctx, &chunk, &mut state, &mut dc) {
                    remainder.extend_from_slice(&processed);
                }
            }
        }

        if !remainder.is_empty() {
            let chunk_ms = self.settings.chunk_size_ms.max(1);
            let frame_size = ctx.target.frame_bytes(chunk_ms as u32);
            match self.transport_kind() {
                Some(TransportKind::AudioSocket) => {
                    // Send whole frames, then zero-pad the tail to a frame
                    // boundary so Asterisk never sees a short frame.
                    while remainder.len() >= frame_size {
                        let frame: Vec<u8> = remainder.drain(..frame_size).collect();
                        if !self.send_buffer(ctx, &frame) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(chunk_ms)).await;
                    }
                    if !remainder.is_empty() {
                        let mut tail = std::mem::take(remainder);
                        tail.resize(frame_size, 0);
                        if self.send_buffer(ctx, &tail) {
                            tokio::time::sleep(Duration::from_millis(chunk_ms)).await;
                        }
                    }
                }
                Some(TransportKind::Rtp) => {
                    let tail = std::mem::take(remainder);
                    self.send_buffer(ctx, &tail);
                }
                None => {}
            }
        }

        // Release gating and return the conversation to listening.
        self.coordinator
            .on_tts_end(&ctx.call_id, &ctx.stream_id, "streaming-ended");

        let reason = ctx
            .end_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "streaming-ended".to_string());
        let wall_seconds = ctx.started_at.elapsed().as_secs_f64();
        metrics()
            .stream_segment_duration_seconds
            .with_label_values(&[ctx.call_id.as_str(), ctx.playback_type.as_str()])
            .observe(wall_seconds);
        metrics()
            .stream_end_reason_total
            .with_label_values(&[ctx.call_id.as_str(), reason.as_str()])
            .inc();

        // Tuning summary: effective audio seconds vs wall clock.
        let bytes_per_second = (ctx.target.encoding.bytes_per_sample() as u64
            * u64::from(ctx.target.sample_rate))
        .max(1);
        let tx = ctx.tx_bytes.load(Ordering::Relaxed);
        let effective_seconds = tx as f64 / bytes_per_second as f64;
        let drift_pct = if wall_seconds > 0.0 {
            (effective_seconds - wall_seconds) / wall_seconds * 100.0
        } else {
            0.0
        };
        log::info!(
            "[Stream] Segment summary: call={}, stream={}, reason={reason}, tx_bytes={tx}, frames_sent={}, underflow_events={}, provider_bytes={}, effective_seconds={effective_seconds:.3}, wall_seconds={wall_seconds:.3}, drift_pct={drift_pct:.1}",
            ctx.call_id,
            ctx.stream_id,
            ctx.frames_sent.load(Ordering::Relaxed),
            ctx.underflow_events.load(Ordering::Relaxed),
            ctx.provider_bytes.load(Ordering::Relaxed),
        );

        ctx.set_phase(StreamPhase::Ended);
        self.last_segment_end
            .insert(ctx.call_id.clone(), Instant::now());
        self.streams
            .remove_if(&ctx.call_id, |_, stored| stored.stream_id == ctx.stream_id);

        metrics()
            .streaming_active
            .with_label_values(&[ctx.call_id.as_str()])
            .set(0);
        metrics()
            .streaming_jitter_depth
            .with_label_values(&[ctx.call_id.as_str()])
            .set(0);
        self.session_store.update(&ctx.call_id, |s| {
            s.streaming_started = false;
            if s.current_stream_id.as_deref() == Some(ctx.stream_id.as_str()) {
                s.current_stream_id = None;
            }
        });
        log::debug!(
            "[Stream] Cleanup completed: call={}, stream={}",
            ctx.call_id,
            ctx.stream_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ConversationState;

    /// Recording transport double. `fail` makes every send report failure.
    struct MockTransport {
        kind: TransportKind,
        frames: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl MockTransport {
        fn new(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                frames: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn total_bytes(&self) -> usize {
            self.frames.lock().iter().map(Vec::len).sum()
        }

        fn frame_count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl OutboundAudio for MockTransport {
        fn send_audio(&self, _session: &CallSession, buffer: &[u8]) -> bool {
            if self.fail.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(buffer.to_vec());
            true
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }
    }

    struct Harness {
        manager: Arc<StreamingPlaybackManager>,
        transport: Arc<MockTransport>,
        store: Arc<SessionStore>,
        coordinator: Arc<ConversationCoordinator>,
    }

    fn harness(call_id: &str, kind: TransportKind, settings: StreamingSettings) -> Harness {
        let store = Arc::new(SessionStore::new());
        let mut session = CallSession::new(call_id, "chan-1");
        session.audiosocket_conn_id = Some("conn-1".into());
        store.upsert_call(session);

        let coordinator = Arc::new(ConversationCoordinator::new(Arc::clone(&store)));
        let manager = Arc::new(StreamingPlaybackManager::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            None,
            settings,
        ));
        let transport = MockTransport::new(kind);
        manager.set_transport(
            Arc::clone(&transport) as Arc<dyn OutboundAudio>,
            Some(Encoding::Ulaw),
        );
        Harness {
            manager,
            transport,
            store,
            coordinator,
        }
    }

    /// Test defaults: no surprise keepalive/fallback firing under the
    /// paused clock unless a test opts in.
    fn quiet_settings() -> StreamingSettings {
        StreamingSettings {
            jitter_buffer_ms: 200,
            min_start_ms: 20,
            low_watermark_ms: 0,
            provider_grace_ms: 40,
            fallback_timeout_ms: 600_000,
            keepalive_interval_ms: 600_000,
            connection_timeout_ms: 1_200_000,
            ..StreamingSettings::default()
        }
    }

    async fn wait_until_ended(manager: &StreamingPlaybackManager, call_id: &str) {
        for _ in 0..500 {
            if !manager.is_stream_active(call_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stream never ended for {call_id}");
    }

    fn end_reason_recorded(call_id: &str, reason: &str) -> bool {
        metrics()
            .render()
            .lines()
            .any(|line| line.contains(call_id) && line.contains(reason))
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_playback_sends_every_byte() {
        // 50 provider chunks totalling 48 000 µ-law bytes; RTP sends each
        // processed chunk as one packet.
        let call = "pb-greeting";
        let h = harness(
            call,
            TransportKind::Rtp,
            StreamingSettings {
                jitter_buffer_ms: 50,
                min_start_ms: 120,
                ..quiet_settings()
            },
        );

        let (tx, rx) = mpsc::channel(8);
        let sid = h
            .manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::ulaw_8k(),
                Some(AudioFormat::ulaw_8k()),
            )
            .expect("stream should start");
        assert!(sid.starts_with("stream:greeting:pb-greeting:"));

        for _ in 0..50 {
            tx.send(Bytes::from(vec![0x7Fu8; 960])).await.unwrap();
        }
        drop(tx);
        wait_until_ended(&h.manager, call).await;

        assert_eq!(h.transport.frame_count(), 50);
        assert_eq!(h.transport.total_bytes(), 48_000);
        assert!(end_reason_recorded(call, "end-of-stream"));
        // Gating token released, conversation back to listening.
        assert!(h.store.get(call).unwrap().current_stream_id.is_none());
        assert_eq!(h.coordinator.state(call), ConversationState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_active() {
        let call = "pb-idem";
        let h = harness(call, TransportKind::Rtp, quiet_settings());

        let (_tx, rx) = mpsc::channel(8);
        let first = h
            .manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();

        let (_tx2, rx2) = mpsc::channel(8);
        let second = h
            .manager
            .start_streaming_playback(
                call,
                rx2,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        assert_eq!(first, second);
        h.manager.stop_streaming_playback(call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_returns_true_then_false() {
        let call = "pb-stop";
        let h = harness(call, TransportKind::Rtp, quiet_settings());
        let (_tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();

        assert!(h.manager.stop_streaming_playback(call).await);
        assert!(!h.manager.stop_streaming_playback(call).await);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_holds_frames_until_min_start() {
        let call = "pb-warmup";
        let h = harness(
            call,
            TransportKind::AudioSocket,
            StreamingSettings {
                jitter_buffer_ms: 200,
                min_start_ms: 120, // 6 chunks at 20 ms
                ..quiet_settings()
            },
        );

        let (tx, rx) = mpsc::channel(16);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::ulaw_8k(),
                Some(AudioFormat::ulaw_8k()),
            )
            .unwrap();
        assert_eq!(
            h.manager.stream_snapshot(call).unwrap().phase,
            StreamPhase::Warming
        );

        // Two frames buffered: still below min_start, nothing sent.
        for _ in 0..2 {
            tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.frame_count(), 0, "sent during warm-up");

        // Four more reach the threshold; playback begins.
        for _ in 0..4 {
            tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(h.transport.frame_count() > 0, "no frames after warm-up");

        drop(tx);
        wait_until_ended(&h.manager, call).await;
        // All six audio frames delivered; the provider pause may have
        // added filler frames on top.
        let audio_frames = h
            .transport
            .frames
            .lock()
            .iter()
            .filter(|f| f.iter().all(|&b| b == 0x55))
            .count();
        assert_eq!(audio_frames, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_segment_skips_warm_up() {
        let call = "pb-b2b";
        let h = harness(call, TransportKind::Rtp, quiet_settings());

        // First segment ends normally.
        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        drop(tx);
        wait_until_ended(&h.manager, call).await;

        // Second segment starts within provider_grace_ms: streams at once.
        let (_tx2, rx2) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx2,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        assert_eq!(
            h.manager.stream_snapshot(call).unwrap().phase,
            StreamPhase::Streaming
        );
        h.manager.stop_streaming_playback(call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn producer_timeout_triggers_fallback_bookkeeping() {
        let call = "pb-timeout";
        let h = harness(
            call,
            TransportKind::Rtp,
            StreamingSettings {
                fallback_timeout_ms: 100,
                ..quiet_settings()
            },
        );

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        // Producer now starves; keep the sender alive so closure is not
        // mistaken for end-of-stream.
        wait_until_ended(&h.manager, call).await;
        drop(tx);

        let session = h.store.get(call).unwrap();
        assert_eq!(session.streaming_fallback_count, 1);
        assert!(
            session
                .last_streaming_error
                .as_deref()
                .unwrap_or_default()
                .starts_with("timeout>"),
            "last error: {:?}",
            session.last_streaming_error
        );
        assert!(end_reason_recorded(call, "timeout>"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_ends_stream() {
        let call = "pb-keepalive";
        let h = harness(
            call,
            TransportKind::Rtp,
            StreamingSettings {
                keepalive_interval_ms: 50,
                connection_timeout_ms: 200,
                fallback_timeout_ms: 600_000,
                ..quiet_settings()
            },
        );

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Response,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        wait_until_ended(&h.manager, call).await;
        drop(tx);

        let session = h.store.get(call).unwrap();
        assert_eq!(session.streaming_keepalive_timeouts, 1);
        assert!(
            session
                .last_streaming_error
                .as_deref()
                .unwrap_or_default()
                .starts_with("keepalive-timeout"),
        );
        assert!(end_reason_recorded(call, "keepalive-timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn underflow_filler_keeps_cadence() {
        let call = "pb-filler";
        let h = harness(call, TransportKind::AudioSocket, quiet_settings());

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::ulaw_8k(),
                Some(AudioFormat::ulaw_8k()),
            )
            .unwrap();
        // One exact frame, then silence from the provider.
        tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = h.manager.stream_snapshot(call).unwrap();
        assert_eq!(snapshot.underflow_events, 1);

        let frames = h.transport.frames.lock().clone();
        assert_eq!(frames.len(), 2, "audio frame plus one filler");
        assert!(frames[0].iter().all(|&b| b == 0x55));
        // µ-law silence filler.
        assert!(frames[1].iter().all(|&b| b == 0xFF));
        assert_eq!(frames[1].len(), 160);

        drop(tx);
        wait_until_ended(&h.manager, call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn egress_endianness_auto_corrects() {
        let call = "pb-endian";
        let h = harness(call, TransportKind::AudioSocket, quiet_settings());
        h.manager.set_transport(
            Arc::clone(&h.transport) as Arc<dyn OutboundAudio>,
            Some(Encoding::Slin16),
        );

        // Byte-swapped PCM16: native read is quiet (64), swapped is loud
        // (16384), so the probe must flip egress_swap.
        let swapped_pcm: Vec<u8> = std::iter::repeat([0x40u8, 0x00u8])
            .take(160)
            .flatten()
            .collect();

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::new(Encoding::Slin16, 8000),
                Some(AudioFormat::new(Encoding::Slin16, 8000)),
            )
            .unwrap();
        tx.send(Bytes::from(swapped_pcm)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = h.manager.stream_snapshot(call).unwrap();
        assert!(snapshot.egress_swap, "probe should have set egress_swap");
        assert!(metrics()
            .render()
            .lines()
            .any(|l| l.contains(call) && l.contains("endian_corrections")));

        // Transmitted frames carry the corrected (swapped) byte order.
        let frames = h.transport.frames.lock().clone();
        assert!(!frames.is_empty());
        assert_eq!(frames[0][0], 0x00);
        assert_eq!(frames[0][1], 0x40);

        drop(tx);
        wait_until_ended(&h.manager, call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn egress_force_false_never_swaps() {
        let call = "pb-forcefalse";
        let h = harness(
            call,
            TransportKind::AudioSocket,
            StreamingSettings {
                egress_swap_mode: EgressSwapMode::ForceFalse,
                ..quiet_settings()
            },
        );
        h.manager.set_transport(
            Arc::clone(&h.transport) as Arc<dyn OutboundAudio>,
            Some(Encoding::Slin16),
        );

        let swapped_pcm: Vec<u8> = std::iter::repeat([0x40u8, 0x00u8])
            .take(160)
            .flatten()
            .collect();

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::new(Encoding::Slin16, 8000),
                Some(AudioFormat::new(Encoding::Slin16, 8000)),
            )
            .unwrap();
        tx.send(Bytes::from(swapped_pcm)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = h.manager.stream_snapshot(call).unwrap();
        assert!(!snapshot.egress_swap);
        let frames = h.transport.frames.lock().clone();
        assert!(!frames.is_empty());
        assert_eq!(frames[0][0], 0x40, "force_false must keep native order");

        drop(tx);
        wait_until_ended(&h.manager, call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn min_start_is_clamped_to_queue_capacity() {
        let call = "pb-clamp";
        let h = harness(
            call,
            TransportKind::AudioSocket,
            StreamingSettings {
                jitter_buffer_ms: 100, // 5 chunks
                min_start_ms: 1000,    // would need 50
                ..quiet_settings()
            },
        );

        let (tx, rx) = mpsc::channel(16);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::ulaw_8k(),
                Some(AudioFormat::ulaw_8k()),
            )
            .unwrap();
        let snapshot = h.manager.stream_snapshot(call).unwrap();
        assert_eq!(snapshot.jitter_buffer_chunks, 5);
        assert_eq!(snapshot.min_start_chunks, 4, "clamped to jitter − 1");

        // Playback still starts once the clamped depth is reached.
        for _ in 0..4 {
            tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.transport.frame_count() > 0);

        drop(tx);
        wait_until_ended(&h.manager, call).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_records_fallback() {
        let call = "pb-transportfail";
        let h = harness(call, TransportKind::Rtp, quiet_settings());
        h.transport.fail.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(8);
        h.manager
            .start_streaming_playback(
                call,
                rx,
                PlaybackType::Greeting,
                AudioFormat::ulaw_8k(),
                None,
            )
            .unwrap();
        tx.send(Bytes::from(vec![0x55u8; 160])).await.unwrap();
        wait_until_ended(&h.manager, call).await;
        drop(tx);

        let session = h.store.get(call).unwrap();
        assert_eq!(session.streaming_fallback_count, 1);
        assert_eq!(
            session.last_streaming_error.as_deref(),
            Some("transport-failure")
        );
        assert!(end_reason_recorded(call, "transport-failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_stream_waits_for_gating_token() {
        // A foreign token (e.g. a stale stream id) blocks new playback.
        let call = "pb-gating";
        let h = harness(call, TransportKind::Rtp, quiet_settings());
        assert!(h.store.set_gating_token(call, "someone-else"));

        let (_tx, rx) = mpsc::channel(8);
        let result = h.manager.start_streaming_playback(
            call,
            rx,
            PlaybackType::Response,
            AudioFormat::ulaw_8k(),
            None,
        );
        assert!(result.is_none(), "contended token must refuse playback");
    }
}
