//! VoiceBridge core: the per-call media and session engine of a real-time
//! telephony voice agent.
//!
//! Bridges Asterisk (ARI control plane, External Media RTP or AudioSocket
//! media) to AI backends: monolithic voice agents (Deepgram, Local) or
//! composed STT → LLM → TTS pipelines. The heart of the crate is the
//! streaming playback manager, which converts, buffers, paces, and
//! transmits agent audio back to the caller with graceful fallback to
//! file playback.

pub mod ari;
pub mod audio;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod session;
pub mod stream;
pub mod tools;
pub mod transport;

pub use ari::{AriClient, AriEvent};
pub use config::Config;
pub use coordinator::{ConversationCoordinator, ConversationState};
pub use engine::Engine;
pub use error::{VoiceBridgeError, VoiceBridgeResult};
pub use session::{CallSession, SessionStore};
pub use stream::{
    AudioFormat, Encoding, FallbackPlaybackManager, PlaybackType, StreamingPlaybackManager,
};
