//! Telephony media transports: External Media RTP and AudioSocket.

pub mod audiosocket;
pub mod rtp;

pub use audiosocket::{AudioSocketServer, AUDIOSOCKET_KIND_AUDIO};
pub use rtp::{RtpServer, RtpSessionInfo, RtpStats};

use bytes::Bytes;

/// Events emitted by a transport towards the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Decoded inbound caller audio in the engine format.
    InboundAudio {
        call_id: String,
        /// Inbound RTP SSRC, or 0 for AudioSocket connections.
        ssrc: u32,
        pcm: Bytes,
    },
    /// A per-call transport session ended (socket error, disconnect,
    /// cleanup). The engine decides whether the call survives.
    SessionEnded { call_id: String, reason: String },
}
