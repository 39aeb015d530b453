//! AudioSocket transport: the framed TCP alternative to External Media RTP.
//!
//! Asterisk's AudioSocket protocol frames every message as one kind byte,
//! a big-endian u16 payload length, and the payload. The dialplan opens one
//! connection per channel and immediately sends a UUID frame identifying
//! it; audio frames then flow both ways, sized to 20 ms
//! (160 B µ-law@8k, 320 B PCM16@8k, 640 B PCM16@16k).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AudioSocketSettings;
use crate::error::{TransportError, TransportResult};
use crate::stream::AudioFormat;

/// Frame kind: channel hangup / terminate.
pub const AUDIOSOCKET_KIND_HANGUP: u8 = 0x00;
/// Frame kind: 16-byte channel UUID, sent first by the dialplan.
pub const AUDIOSOCKET_KIND_UUID: u8 = 0x01;
/// Frame kind: signed linear audio payload.
pub const AUDIOSOCKET_KIND_AUDIO: u8 = 0x10;
/// Frame kind: error report from Asterisk.
pub const AUDIOSOCKET_KIND_ERROR: u8 = 0xFF;

/// Outbound frames queued per connection before sends report failure.
const WRITER_QUEUE_FRAMES: usize = 32;

/// Events emitted towards the engine.
#[derive(Debug, Clone)]
pub enum AudioSocketEvent {
    /// New connection identified by its channel UUID.
    Connected { conn_id: String, channel_uuid: Uuid },
    /// One inbound audio frame.
    Audio { conn_id: String, payload: Bytes },
    /// Connection ended (hangup frame, error frame, or socket close).
    Disconnected { conn_id: String, reason: String },
}

struct Connection {
    writer: mpsc::Sender<Bytes>,
}

/// Framed TCP server for Asterisk AudioSocket channels.
pub struct AudioSocketServer {
    settings: AudioSocketSettings,
    connections: DashMap<String, Connection>,
    events: mpsc::Sender<AudioSocketEvent>,
    running: AtomicBool,
}

impl AudioSocketServer {
    pub fn new(settings: AudioSocketSettings, events: mpsc::Sender<AudioSocketEvent>) -> Self {
        Self {
            settings,
            connections: DashMap::new(),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Expected 20 ms frame size for the configured format.
    #[must_use]
    pub fn frame_size(&self, sample_rate: u32) -> usize {
        AudioFormat::new(self.settings.format, sample_rate).frame_bytes(20)
    }

    /// Binds the listener and returns the accept-loop future's spawn handle.
    pub async fn start(self: &Arc<Self>) -> TransportResult<u16> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.settings.port);
        self.running.store(true, Ordering::SeqCst);
        log::info!("[AudioSocket] Listening on {addr}");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !server.running.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn_id = Uuid::new_v4().to_string();
                        log::info!("[AudioSocket] Connection accepted: conn={conn_id}, peer={peer}");
                        let per_conn = Arc::clone(&server);
                        tokio::spawn(async move {
                            per_conn.connection_loop(conn_id, stream).await;
                        });
                    }
                    Err(e) => {
                        if server.running.load(Ordering::SeqCst) {
                            log::warn!("[AudioSocket] Accept failed: {e}");
                        }
                        break;
                    }
                }
            }
        });
        Ok(local_port)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connections.clear();
        log::info!("[AudioSocket] Server stopped");
    }

    /// Queues one audio frame for a connection.
    ///
    /// Returns `false` when the connection is unknown or its writer queue
    /// is full (slow peer back-pressure).
    pub fn send_audio(&self, conn_id: &str, frame: &[u8]) -> bool {
        let Some(conn) = self.connections.get(conn_id) else {
            log::debug!("[AudioSocket] Send skipped (unknown conn): conn={conn_id}");
            return false;
        };
        match conn.writer.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("[AudioSocket] Writer queue full: conn={conn_id}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("[AudioSocket] Writer gone: conn={conn_id}");
                false
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Per-connection loop: registers a writer task, then reads frames
    /// until hangup or socket close.
    async fn connection_loop(self: Arc<Self>, conn_id: String, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[AudioSocket] set_nodelay failed: conn={conn_id}, error={e}");
        }
        let (mut reader, mut writer) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE_FRAMES);
        self.connections
            .insert(conn_id.clone(), Connection { writer: writer_tx });

        let writer_conn = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let mut message = Vec::with_capacity(3 + frame.len());
                message.push(AUDIOSOCKET_KIND_AUDIO);
                message.extend_from_slice(&(frame.len() as u16).to_be_bytes());
                message.extend_from_slice(&frame);
                if let Err(e) = writer.write_all(&message).await {
                    log::debug!("[AudioSocket] Write failed: conn={writer_conn}, error={e}");
                    break;
                }
            }
        });

        let reason = loop {
            let mut header = [0u8; 3];
            if let Err(e) = reader.read_exact(&mut header).await {
                break format!("socket-closed: {e}");
            }
            let kind = header[0];
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut payload = vec![0u8; len];
            if len > 0 {
                if let Err(e) = reader.read_exact(&mut payload).await {
                    break format!("socket-closed: {e}");
                }
            }

            match kind {
                AUDIOSOCKET_KIND_UUID => {
                    let channel_uuid = Uuid::from_slice(&payload).unwrap_or_else(|_| {
                        log::warn!(
                            "[AudioSocket] Malformed UUID frame ({len} bytes): conn={conn_id}"
                        );
                        Uuid::nil()
                    });
                    log::info!(
                        "[AudioSocket] Channel identified: conn={conn_id}, uuid={channel_uuid}"
                    );
                    if self
                        .events
                        .send(AudioSocketEvent::Connected {
                            conn_id: conn_id.clone(),
                            channel_uuid,
                        })
                        .await
                        .is_err()
                    {
                        break "engine-gone".to_string();
                    }
                }
                AUDIOSOCKET_KIND_AUDIO => {
                    if self
                        .events
                        .send(AudioSocketEvent::Audio {
                            conn_id: conn_id.clone(),
                            payload: Bytes::from(payload),
                        })
                        .await
                        .is_err()
                    {
                        break "engine-gone".to_string();
                    }
                }
                AUDIOSOCKET_KIND_HANGUP => break "hangup".to_string(),
                AUDIOSOCKET_KIND_ERROR => {
                    log::warn!(
                        "[AudioSocket] Error frame from Asterisk: conn={conn_id}, payload={payload:?}"
                    );
                    break "asterisk-error".to_string();
                }
                other => {
                    // Unknown kinds are skipped, not fatal.
                    log::debug!("[AudioSocket] Unknown frame kind {other:#04x}: conn={conn_id}");
                }
            }
        };

        self.connections.remove(&conn_id);
        writer_task.abort();
        let _ = self
            .events
            .send(AudioSocketEvent::Disconnected {
                conn_id: conn_id.clone(),
                reason: reason.clone(),
            })
            .await;
        log::info!("[AudioSocket] Connection closed: conn={conn_id}, reason={reason}");
    }
}
