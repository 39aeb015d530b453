//! Centralized error types for the VoiceBridge core library.
//!
//! Each subsystem defines a structured error enum with `thiserror`; the
//! crate-level [`VoiceBridgeError`] aggregates them and maps every variant
//! to a stable machine-readable code used in logs and tool results.

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Transport-layer failures (UDP/TCP sockets, frame I/O).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket bind failed for the given address.
    #[error("Socket bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No free port remained in the configured RTP range.
    #[error("No free RTP ports available in configured range")]
    PortRangeExhausted,

    /// A send was attempted before the remote endpoint was learned.
    #[error("Remote endpoint unknown for call {0}")]
    EndpointUnknown(String),

    /// A non-blocking send would have blocked.
    #[error("Send would block for call {0}")]
    WouldBlock(String),

    /// The peer closed the connection.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Other socket I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "transport_bind_failed",
            Self::PortRangeExhausted => "rtp_port_range_exhausted",
            Self::EndpointUnknown(_) => "remote_endpoint_unknown",
            Self::WouldBlock(_) => "send_would_block",
            Self::Closed(_) => "connection_closed",
            Self::Io(_) => "transport_io_error",
        }
    }
}

/// Wire-format violations. Counted and dropped, never fatal to a session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("RTP packet shorter than header ({0} bytes)")]
    ShortPacket(usize),

    #[error("Unsupported RTP version {0}")]
    BadVersion(u8),

    #[error("Unsupported codec '{0}'")]
    UnsupportedCodec(String),

    #[error("Frame size mismatch: expected {expected}, got {actual}")]
    ShortFrame { expected: usize, actual: usize },
}

impl ErrorCode for ProtocolError {
    fn code(&self) -> &'static str {
        match self {
            Self::ShortPacket(_) => "rtp_short_packet",
            Self::BadVersion(_) => "rtp_bad_version",
            Self::UnsupportedCodec(_) => "unsupported_codec",
            Self::ShortFrame { .. } => "short_frame",
        }
    }
}

/// Failures of an AI provider session. Fatal to that session.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider connect failed: {0}")]
    Connect(String),

    #[error("Provider authentication failed: {0}")]
    Auth(String),

    #[error("Provider did not acknowledge settings in time")]
    AckTimeout,

    #[error("Provider session closed: {0}")]
    Closed(String),

    #[error("Provider protocol error: {0}")]
    Protocol(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ErrorCode for ProviderError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "provider_connect_failed",
            Self::Auth(_) => "provider_auth_failed",
            Self::AckTimeout => "provider_ack_timeout",
            Self::Closed(_) => "provider_closed",
            Self::Protocol(_) => "provider_protocol_error",
            Self::NotConfigured(_) => "provider_not_configured",
        }
    }
}

/// ARI control-plane failures.
#[derive(Debug, Error)]
pub enum AriError {
    #[error("ARI request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ARI returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("ARI event WebSocket error: {0}")]
    WebSocket(String),

    #[error("ARI payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ErrorCode for AriError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "ari_request_failed",
            Self::Status { .. } => "ari_error_status",
            Self::WebSocket(_) => "ari_websocket_error",
            Self::Payload(_) => "ari_payload_error",
        }
    }
}

/// Application-wide error type for the VoiceBridge engine.
#[derive(Debug, Error)]
pub enum VoiceBridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Ari(#[from] AriError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VoiceBridgeError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.code(),
            Self::Protocol(e) => e.code(),
            Self::Provider(e) => e.code(),
            Self::Ari(e) => e.code(),
            Self::Configuration(_) => "configuration_error",
            Self::Tool(_) => "tool_error",
            Self::CallNotFound(_) => "call_not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Convenient Result aliases.
pub type TransportResult<T> = Result<T, TransportError>;
pub type ProviderResult<T> = Result<T, ProviderError>;
pub type AriResult<T> = Result<T, AriError>;
pub type VoiceBridgeResult<T> = Result<T, VoiceBridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_codes() {
        assert_eq!(
            TransportError::PortRangeExhausted.code(),
            "rtp_port_range_exhausted"
        );
        assert_eq!(
            TransportError::EndpointUnknown("c1".into()).code(),
            "remote_endpoint_unknown"
        );
    }

    #[test]
    fn aggregate_error_delegates_codes() {
        let err: VoiceBridgeError = ProviderError::AckTimeout.into();
        assert_eq!(err.code(), "provider_ack_timeout");
        let err = VoiceBridgeError::Configuration("bad".into());
        assert_eq!(err.code(), "configuration_error");
    }
}
