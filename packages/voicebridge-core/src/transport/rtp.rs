//! RTP server for Asterisk External Media.
//!
//! One UDP socket per call, allocated from a configured port range. Each
//! session runs a receiver task that parses RTP v2, filters echoes of our
//! own outbound SSRC, locks onto the first remote endpoint, and forwards
//! decoded engine-format PCM to the engine through the transport event
//! channel. Outbound audio is sequenced continuously with the inbound
//! stream so the far end sees one coherent RTP flow.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{mulaw_to_pcm16le, resample, ResampleState};
use crate::config::RtpSettings;
use crate::error::{TransportError, TransportResult};
use crate::metrics::metrics;
use crate::stream::Encoding;
use crate::transport::TransportEvent;

/// RTP protocol version handled here.
const RTP_VERSION: u8 = 2;
/// Fixed header length; extensions and CSRC lists are not used by Asterisk
/// External Media.
const RTP_HEADER_SIZE: usize = 12;
/// Asterisk-side sample rate (codec-dependent).
const WIRE_SAMPLE_RATE: u32 = 8000;
/// 20 ms at 8 kHz.
const SAMPLES_PER_PACKET: u32 = 160;
/// Static payload type for µ-law.
const PT_PCMU: u8 = 0;
/// Static payload type for L16/1 channel.
const PT_L16_MONO: u8 = 11;

/// Mutable per-session state, guarded by one short-lived lock.
#[derive(Debug)]
struct SessionState {
    remote: Option<SocketAddr>,
    ssrc: Option<u32>,
    outbound_ssrc: Option<u32>,
    sequence: u16,
    timestamp: u32,
    send_sequence_initialized: bool,
    send_timestamp_initialized: bool,
    expected_sequence: Option<u16>,
    packet_loss_count: u64,
    out_of_order_count: u64,
    frames_received: u64,
    frames_processed: u64,
    echo_packets_filtered: u64,
    resample_state: Option<ResampleState>,
    last_packet_at: Instant,
}

/// One active RTP session for a call.
pub struct RtpSession {
    call_id: String,
    local_port: u16,
    socket: Arc<UdpSocket>,
    created_at: Instant,
    state: Mutex<SessionState>,
}

/// Read-only diagnostics snapshot of a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RtpSessionInfo {
    pub call_id: String,
    pub local_port: u16,
    pub remote: Option<SocketAddr>,
    pub ssrc: Option<u32>,
    pub outbound_ssrc: Option<u32>,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub packet_loss_count: u64,
    pub out_of_order_count: u64,
    pub echo_packets_filtered: u64,
}

/// Aggregate server statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RtpStats {
    pub running: bool,
    pub sessions_total: usize,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub packet_loss_total: u64,
    pub echo_filtered_total: u64,
}

/// RTP server handling bidirectional audio for Asterisk External Media.
pub struct RtpServer {
    settings: RtpSettings,
    wire_encoding: Encoding,
    sessions: DashMap<String, Arc<RtpSession>>,
    receiver_tasks: DashMap<String, JoinHandle<()>>,
    port_allocation: DashMap<u16, String>,
    ssrc_to_call_id: DashMap<u32, String>,
    events: mpsc::Sender<TransportEvent>,
    running: AtomicBool,
}

impl RtpServer {
    /// Creates the server. Sessions are allocated per call via
    /// [`allocate_session`](Self::allocate_session) after [`start`](Self::start).
    pub fn new(settings: RtpSettings, events: mpsc::Sender<TransportEvent>) -> Self {
        let wire_encoding = Encoding::parse(&settings.codec).unwrap_or(Encoding::Ulaw);
        log::info!(
            "[Rtp] Server initialized: host={}, ports={}-{}, codec={}, format={}, rate={}, lock_remote={}",
            settings.host,
            settings.port_range.normalized().0,
            settings.port_range.normalized().1,
            wire_encoding.as_str(),
            settings.format.as_str(),
            settings.sample_rate,
            settings.lock_remote_endpoint,
        );
        Self {
            settings,
            wire_encoding,
            sessions: DashMap::new(),
            receiver_tasks: DashMap::new(),
            port_allocation: DashMap::new(),
            ssrc_to_call_id: DashMap::new(),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Marks the server ready; per-call sockets are bound on demand.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("[Rtp] Server already running");
            return;
        }
        log::info!("[Rtp] Server ready");
    }

    /// Stops the server and tears down every session.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let call_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for call_id in call_ids {
            self.cleanup_session(&call_id).await;
        }
        log::info!("[Rtp] Server stopped");
    }

    /// Allocates and binds a UDP socket for a call, returning the port.
    ///
    /// Idempotent: a second call for the same call id returns the existing
    /// port.
    pub async fn allocate_session(self: &Arc<Self>, call_id: &str) -> TransportResult<u16> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("RTP server not started".into()));
        }
        if let Some(session) = self.sessions.get(call_id) {
            return Ok(session.local_port);
        }

        let (socket, port) = self.bind_in_range(call_id)?;
        let session = Arc::new(RtpSession {
            call_id: call_id.to_string(),
            local_port: port,
            socket: Arc::new(socket),
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                remote: None,
                ssrc: None,
                outbound_ssrc: None,
                sequence: 0,
                timestamp: 0,
                send_sequence_initialized: false,
                send_timestamp_initialized: false,
                expected_sequence: None,
                packet_loss_count: 0,
                out_of_order_count: 0,
                frames_received: 0,
                frames_processed: 0,
                echo_packets_filtered: 0,
                resample_state: None,
                last_packet_at: Instant::now(),
            }),
        });
        self.sessions
            .insert(call_id.to_string(), Arc::clone(&session));

        let server = Arc::clone(self);
        let task_session = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            server.receiver_loop(task_session).await;
        });
        self.receiver_tasks.insert(call_id.to_string(), handle);

        log::info!(
            "[Rtp] Session allocated: call={call_id}, port={port}, codec={}",
            self.wire_encoding.as_str()
        );
        Ok(port)
    }

    /// Tears down one session: cancels the receiver, closes the socket,
    /// releases the port and SSRC mapping.
    pub async fn cleanup_session(&self, call_id: &str) {
        let Some((_, session)) = self.sessions.remove(call_id) else {
            return;
        };
        if let Some((_, handle)) = self.receiver_tasks.remove(call_id) {
            handle.abort();
        }
        self.port_allocation.remove(&session.local_port);
        let ssrc = session.state.lock().ssrc;
        if let Some(ssrc) = ssrc {
            self.ssrc_to_call_id
                .remove_if(&ssrc, |_, mapped| mapped == call_id);
        }
        log::info!(
            "[Rtp] Session cleaned up: call={call_id}, port={}, lived={:?}",
            session.local_port,
            session.created_at.elapsed()
        );
    }

    /// Records an SSRC → call id mapping established out-of-band.
    pub fn map_ssrc_to_call_id(&self, ssrc: u32, call_id: &str) {
        self.ssrc_to_call_id.insert(ssrc, call_id.to_string());
        if let Some(session) = self.sessions.get(call_id) {
            session.state.lock().ssrc = Some(ssrc);
        }
        log::info!("[Rtp] SSRC {ssrc:#010x} mapped to call {call_id}");
    }

    pub fn call_id_for_ssrc(&self, ssrc: u32) -> Option<String> {
        self.ssrc_to_call_id.get(&ssrc).map(|e| e.value().clone())
    }

    /// True once the inbound remote endpoint has been learned.
    pub fn has_remote_endpoint(&self, call_id: &str) -> bool {
        self.sessions
            .get(call_id)
            .is_some_and(|s| s.state.lock().remote.is_some())
    }

    /// Sends provider audio back to Asterisk as RTP.
    ///
    /// Returns `false` when the endpoint is still unknown or the socket
    /// send would block; both are recoverable conditions for the pacer.
    pub fn send_audio(&self, call_id: &str, chunk: &[u8], ssrc_hint: Option<u32>) -> bool {
        if chunk.is_empty() {
            return true;
        }
        let Some(session) = self.sessions.get(call_id).map(|e| Arc::clone(&e)) else {
            log::debug!("[Rtp] Send skipped (no session): call={call_id}");
            return false;
        };

        let (packet, remote) = {
            let mut state = session.state.lock();
            let Some(remote) = state.remote else {
                log::debug!("[Rtp] Send deferred; remote endpoint unknown: call={call_id}");
                return false;
            };

            if state.outbound_ssrc.is_none() {
                // Derive an SSRC distinct from the caller's so our own
                // packets are identifiable for echo filtering.
                let inbound = state.ssrc.or(ssrc_hint);
                let outbound = match inbound {
                    Some(ssrc) => ssrc ^ 0xFFFF_FFFF,
                    None => rand::rng().random(),
                };
                state.outbound_ssrc = Some(outbound);
                log::info!(
                    "[Rtp] Outbound SSRC established: call={call_id}, outbound={outbound:#010x}, inbound={:?}",
                    inbound.map(|s| format!("{s:#010x}")),
                );
            }
            let out_ssrc = state.outbound_ssrc.unwrap_or_default();

            // First transmit seeds sequence/timestamp if the receiver has
            // not already done so from inbound packets.
            if !state.send_sequence_initialized {
                if state.sequence == 0 {
                    state.sequence = rand::rng().random();
                }
                state.send_sequence_initialized = true;
            }
            if !state.send_timestamp_initialized {
                if state.timestamp == 0 {
                    state.timestamp = rand::rng().random();
                }
                state.send_timestamp_initialized = true;
            }

            let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + chunk.len());
            packet.push(RTP_VERSION << 6);
            packet.push(self.payload_type());
            packet.extend_from_slice(&state.sequence.to_be_bytes());
            packet.extend_from_slice(&state.timestamp.to_be_bytes());
            packet.extend_from_slice(&out_ssrc.to_be_bytes());
            packet.extend_from_slice(chunk);

            state.sequence = state.sequence.wrapping_add(1);
            state.timestamp = state.timestamp.wrapping_add(SAMPLES_PER_PACKET);
            state.frames_processed += 1;
            (packet, remote)
        };

        match session.socket.try_send_to(&packet, remote) {
            Ok(sent) if sent == packet.len() => true,
            Ok(sent) => {
                log::debug!(
                    "[Rtp] Short send: call={call_id}, expected={}, sent={sent}",
                    packet.len()
                );
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("[Rtp] Send would block: call={call_id}");
                false
            }
            Err(e) => {
                log::error!("[Rtp] Send failed: call={call_id}, error={e}");
                false
            }
        }
    }

    pub fn session_info(&self, call_id: &str) -> Option<RtpSessionInfo> {
        let session = self.sessions.get(call_id)?;
        let state = session.state.lock();
        Some(RtpSessionInfo {
            call_id: session.call_id.clone(),
            local_port: session.local_port,
            remote: state.remote,
            ssrc: state.ssrc,
            outbound_ssrc: state.outbound_ssrc,
            frames_received: state.frames_received,
            frames_processed: state.frames_processed,
            packet_loss_count: state.packet_loss_count,
            out_of_order_count: state.out_of_order_count,
            echo_packets_filtered: state.echo_packets_filtered,
        })
    }

    pub fn stats(&self) -> RtpStats {
        let mut stats = RtpStats {
            running: self.running.load(Ordering::SeqCst),
            sessions_total: self.sessions.len(),
            frames_received: 0,
            frames_processed: 0,
            packet_loss_total: 0,
            echo_filtered_total: 0,
        };
        for entry in self.sessions.iter() {
            let state = entry.state.lock();
            stats.frames_received += state.frames_received;
            stats.frames_processed += state.frames_processed;
            stats.packet_loss_total += state.packet_loss_count;
            stats.echo_filtered_total += state.echo_packets_filtered;
        }
        stats
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Binds a socket on the first free port in the configured range.
    fn bind_in_range(&self, call_id: &str) -> TransportResult<(UdpSocket, u16)> {
        let (start, end) = self.settings.port_range.normalized();
        for port in start..=end {
            if self.port_allocation.contains_key(&port) {
                continue;
            }
            let addr: SocketAddr = format!("{}:{port}", self.settings.host)
                .parse()
                .map_err(|_| TransportError::Closed(format!("bad RTP host {}", self.settings.host)))?;
            let raw = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
            raw.set_reuse_address(true)?;
            // RTP arrives in 20 ms bursts; a deeper kernel buffer rides out
            // scheduler hiccups without drops.
            raw.set_recv_buffer_size(256 * 1024)?;
            raw.set_nonblocking(true)?;
            if raw.bind(&addr.into()).is_err() {
                continue;
            }
            let socket = UdpSocket::from_std(raw.into())?;
            self.port_allocation.insert(port, call_id.to_string());
            return Ok((socket, port));
        }
        Err(TransportError::PortRangeExhausted)
    }

    const fn payload_type(&self) -> u8 {
        match self.wire_encoding {
            Encoding::Ulaw | Encoding::Alaw => PT_PCMU,
            Encoding::Slin16 => PT_L16_MONO,
        }
    }

    /// Per-session receive loop. Exits on cancel, socket error, or event
    /// channel closure; errors never affect other sessions.
    async fn receiver_loop(self: Arc<Self>, session: Arc<RtpSession>) {
        let call_id = session.call_id.clone();
        log::debug!(
            "[Rtp] Receiver loop started: call={call_id}, port={}",
            session.local_port
        );

        let mut buf = vec![0u8; 1500];
        let end_reason: String = loop {
            if !self.running.load(Ordering::SeqCst) || !self.sessions.contains_key(&call_id) {
                break "session-removed".into();
            }
            let (len, addr) = match session.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        log::error!("[Rtp] Receiver error: call={call_id}, error={e}");
                    }
                    break format!("recv-error: {e}");
                }
            };
            let data = &buf[..len];

            if len < RTP_HEADER_SIZE {
                continue;
            }
            let version = data[0] >> 6;
            if version != RTP_VERSION {
                log::debug!("[Rtp] Invalid RTP version {version}: call={call_id}");
                continue;
            }

            let sequence = u16::from_be_bytes([data[2], data[3]]);
            let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            let payload = &data[RTP_HEADER_SIZE..];

            let decoded = {
                let mut state = session.state.lock();

                // Echo filter: our own outbound stream reflected back by the
                // bridge must never reach the provider.
                if state.outbound_ssrc == Some(ssrc) {
                    state.echo_packets_filtered += 1;
                    metrics()
                        .rtp_echo_filtered_total
                        .with_label_values(&[call_id.as_str()])
                        .inc();
                    if state.echo_packets_filtered <= 5 {
                        log::debug!(
                            "[Rtp] Echo packet filtered (our own SSRC): call={call_id}, count={}",
                            state.echo_packets_filtered
                        );
                    }
                    continue;
                }

                if !self.admit_source(&mut state, &call_id, addr) {
                    continue;
                }

                if state.ssrc.is_none() {
                    state.ssrc = Some(ssrc);
                    drop(state);
                    self.ssrc_to_call_id.insert(ssrc, call_id.clone());
                    log::info!(
                        "[Rtp] Inbound SSRC established (caller audio): call={call_id}, ssrc={ssrc:#010x}"
                    );
                    state = session.state.lock();
                }

                // Seed outbound continuity with inbound values.
                if !state.send_sequence_initialized {
                    state.sequence = sequence;
                }
                if !state.send_timestamp_initialized {
                    state.timestamp = timestamp;
                }

                state.frames_received += 1;
                state.last_packet_at = Instant::now();
                self.track_ordering(&mut state, &call_id, sequence);

                match self.decode_payload(payload) {
                    Ok(pcm) => {
                        let (resampled, next) = if self.settings.sample_rate != WIRE_SAMPLE_RATE {
                            resample(
                                &pcm,
                                WIRE_SAMPLE_RATE,
                                self.settings.sample_rate,
                                state.resample_state,
                            )
                        } else {
                            (pcm, None)
                        };
                        state.resample_state = next;
                        state.frames_processed += 1;
                        resampled
                    }
                    Err(e) => {
                        log::error!("[Rtp] Payload decode failed: call={call_id}, error={e}");
                        continue;
                    }
                }
            };

            let event = TransportEvent::InboundAudio {
                call_id: call_id.clone(),
                ssrc,
                pcm: decoded.into(),
            };
            if self.events.send(event).await.is_err() {
                break "engine-gone".into();
            }
        };

        self.port_allocation.remove(&session.local_port);
        let _ = self
            .events
            .send(TransportEvent::SessionEnded {
                call_id: call_id.clone(),
                reason: end_reason,
            })
            .await;
        log::debug!(
            "[Rtp] Receiver loop stopped: call={call_id}, port={}",
            session.local_port
        );
    }

    /// Endpoint learning and locking. Returns false when the packet must
    /// be dropped.
    fn admit_source(&self, state: &mut SessionState, call_id: &str, addr: SocketAddr) -> bool {
        let host_allowed = |a: &SocketAddr| match self.settings.allowed_remote_hosts.as_ref() {
            Some(hosts) => hosts.iter().any(|h| h == &a.ip().to_string()),
            None => true,
        };

        match state.remote {
            None => {
                if !host_allowed(&addr) {
                    log::warn!("[Rtp] Packet rejected (source not allowed): call={call_id}, source={addr}");
                    return false;
                }
                state.remote = Some(addr);
                log::info!("[Rtp] Remote endpoint established: call={call_id}, remote={addr}");
                true
            }
            Some(known) if known == addr => true,
            Some(known) => {
                if !host_allowed(&addr) {
                    log::warn!("[Rtp] Packet rejected (source not allowed): call={call_id}, source={addr}");
                    return false;
                }
                if self.settings.lock_remote_endpoint {
                    log::warn!(
                        "[Rtp] Remote endpoint mismatch (locked; dropping): call={call_id}, expected={known}, actual={addr}"
                    );
                    return false;
                }
                state.remote = Some(addr);
                log::info!("[Rtp] Remote endpoint updated: call={call_id}, remote={addr}");
                true
            }
        }
    }

    /// Packet loss / ordering diagnostics. Out-of-order packets are logged
    /// but not reordered; provider-side VAD tolerates small reorder.
    fn track_ordering(&self, state: &mut SessionState, call_id: &str, sequence: u16) {
        if let Some(expected) = state.expected_sequence {
            if sequence != expected {
                let ahead = sequence.wrapping_sub(expected);
                if ahead < 0x8000 {
                    state.packet_loss_count += u64::from(ahead);
                    log::debug!(
                        "[Rtp] Packet loss detected: call={call_id}, expected={expected}, received={sequence}, lost={ahead}"
                    );
                } else {
                    state.out_of_order_count += 1;
                    log::debug!(
                        "[Rtp] Out-of-order packet: call={call_id}, expected={expected}, received={sequence}"
                    );
                }
            }
        }
        state.expected_sequence = Some(sequence.wrapping_add(1));
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<Vec<u8>, crate::error::ProtocolError> {
        match self.wire_encoding {
            Encoding::Ulaw => Ok(mulaw_to_pcm16le(payload)),
            Encoding::Alaw => Ok(crate::audio::alaw_to_pcm16le(payload)),
            Encoding::Slin16 => Ok(payload.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn test_settings(start: u16, end: u16) -> RtpSettings {
        RtpSettings {
            host: "127.0.0.1".to_string(),
            port_range: PortRange { start, end },
            codec: "ulaw".to_string(),
            format: Encoding::Slin16,
            sample_rate: 16_000,
            lock_remote_endpoint: true,
            allowed_remote_hosts: None,
        }
    }

    fn build_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![RTP_VERSION << 6, pt];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&ts.to_be_bytes());
        packet.extend_from_slice(&ssrc.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    async fn recv_audio(events: &mut mpsc::Receiver<TransportEvent>) -> Option<(String, u32)> {
        match events.recv().await? {
            TransportEvent::InboundAudio { call_id, ssrc, .. } => Some((call_id, ssrc)),
            TransportEvent::SessionEnded { .. } => None,
        }
    }

    #[tokio::test]
    async fn allocates_distinct_ports_and_is_idempotent() {
        let (tx, _rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_300, 19_310), tx));
        server.start();

        let port_a = server.allocate_session("call-a").await.unwrap();
        let port_b = server.allocate_session("call-b").await.unwrap();
        assert_ne!(port_a, port_b);
        assert_eq!(server.allocate_session("call-a").await.unwrap(), port_a);

        server.stop().await;
    }

    #[tokio::test]
    async fn port_range_exhaustion_is_reported() {
        let (tx, _rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_320, 19_320), tx));
        server.start();

        server.allocate_session("call-a").await.unwrap();
        let err = server.allocate_session("call-b").await.unwrap_err();
        assert!(matches!(err, TransportError::PortRangeExhausted));

        server.stop().await;
    }

    #[tokio::test]
    async fn inbound_packet_learns_endpoint_and_ssrc() {
        let (tx, mut rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_330, 19_340), tx));
        server.start();
        let port = server.allocate_session("call-a").await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = build_packet(PT_PCMU, 100, 5000, 0x1234_5678, &[0xFFu8; 160]);
        sender
            .send_to(&packet, format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        let (call_id, ssrc) = recv_audio(&mut rx).await.unwrap();
        assert_eq!(call_id, "call-a");
        assert_eq!(ssrc, 0x1234_5678);
        assert_eq!(server.call_id_for_ssrc(0x1234_5678).as_deref(), Some("call-a"));
        assert!(server.has_remote_endpoint("call-a"));

        server.stop().await;
    }

    #[tokio::test]
    async fn echo_packets_are_filtered() {
        let (tx, mut rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_350, 19_360), tx));
        server.start();
        let port = server.allocate_session("call-a").await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{port}");

        // First packet establishes endpoint + inbound SSRC.
        sender
            .send_to(&build_packet(PT_PCMU, 1, 160, 0xAAAA_0001, &[0xFF; 160]), &target)
            .await
            .unwrap();
        recv_audio(&mut rx).await.unwrap();

        // Outbound send derives outbound SSRC = inbound ^ 0xFFFFFFFF.
        assert!(server.send_audio("call-a", &[0xFF; 160], None));
        let info = server.session_info("call-a").unwrap();
        let out_ssrc = info.outbound_ssrc.unwrap();
        assert_eq!(out_ssrc, 0xAAAA_0001 ^ 0xFFFF_FFFF);
        assert_ne!(out_ssrc, info.ssrc.unwrap());

        // Three echoes with our own SSRC: all dropped.
        for seq in 2..5u16 {
            sender
                .send_to(
                    &build_packet(PT_PCMU, seq, 320, out_ssrc, &[0xFF; 160]),
                    &target,
                )
                .await
                .unwrap();
        }
        // One legitimate packet follows; it must be the next delivery.
        sender
            .send_to(&build_packet(PT_PCMU, 5, 640, 0xAAAA_0001, &[0xFF; 160]), &target)
            .await
            .unwrap();
        let (_, ssrc) = recv_audio(&mut rx).await.unwrap();
        assert_eq!(ssrc, 0xAAAA_0001);

        let info = server.session_info("call-a").unwrap();
        assert_eq!(info.echo_packets_filtered, 3);

        server.stop().await;
    }

    #[tokio::test]
    async fn send_before_endpoint_known_returns_false() {
        let (tx, _rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_370, 19_380), tx));
        server.start();
        server.allocate_session("call-a").await.unwrap();

        assert!(!server.send_audio("call-a", &[0xFF; 160], None));
        server.stop().await;
    }

    #[tokio::test]
    async fn outbound_sequencing_continues_from_inbound() {
        let (tx, mut rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_390, 19_400), tx));
        server.start();
        let port = server.allocate_session("call-a").await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(
                &build_packet(PT_PCMU, 4242, 99_000, 0xBEEF_0000, &[0xFF; 160]),
                format!("127.0.0.1:{port}"),
            )
            .await
            .unwrap();
        recv_audio(&mut rx).await.unwrap();

        // First outbound packet echoes the seeded sequence, then advances.
        assert!(server.send_audio("call-a", &[0xFF; 160], None));
        let mut buf = [0u8; 1500];
        let (len, _) = sender.recv_from(&mut buf).await.unwrap();
        assert!(len >= RTP_HEADER_SIZE);
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        let ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(seq, 4242);
        assert_eq!(ts, 99_000);

        assert!(server.send_audio("call-a", &[0xFF; 160], None));
        let (_, _) = sender.recv_from(&mut buf).await.unwrap();
        let seq2 = u16::from_be_bytes([buf[2], buf[3]]);
        let ts2 = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(seq2, 4243);
        assert_eq!(ts2, 99_000 + SAMPLES_PER_PACKET);

        server.stop().await;
    }

    #[tokio::test]
    async fn locked_endpoint_drops_other_sources() {
        let (tx, mut rx) = mpsc::channel(64);
        let server = Arc::new(RtpServer::new(test_settings(19_410, 19_420), tx));
        server.start();
        let port = server.allocate_session("call-a").await.unwrap();
        let target = format!("127.0.0.1:{port}");

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first
            .send_to(&build_packet(PT_PCMU, 1, 0, 0xC001, &[0xFF; 160]), &target)
            .await
            .unwrap();
        recv_audio(&mut rx).await.unwrap();

        // A different socket (different source port) must be dropped.
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second
            .send_to(&build_packet(PT_PCMU, 2, 160, 0xC002, &[0xFF; 160]), &target)
            .await
            .unwrap();
        first
            .send_to(&build_packet(PT_PCMU, 2, 160, 0xC001, &[0xFF; 160]), &target)
            .await
            .unwrap();

        let (_, ssrc) = recv_audio(&mut rx).await.unwrap();
        assert_eq!(ssrc, 0xC001, "locked endpoint should drop the stranger");

        server.stop().await;
    }
}
