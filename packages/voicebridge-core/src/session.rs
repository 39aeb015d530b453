//! Per-call session state and the session store.
//!
//! The store hands out copy-on-read snapshots (`Arc<CallSession>`) so read
//! paths never contend with writers. All mutations go through
//! [`SessionStore::upsert_call`], which applies a versioned replace; the
//! gating token is only ever changed through its CAS operations, which is
//! what guarantees at most one active outbound stream per call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::stream::Encoding;

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One entry of the per-call rolling conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
    /// Unix epoch milliseconds.
    pub ts: u64,
}

/// Outcome of an attended transfer decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDecision {
    Accepted,
    Declined,
}

/// The telephony action a call is currently engaged in, if any.
#[derive(Debug, Clone, Default)]
pub enum CurrentAction {
    #[default]
    None,
    AttendedTransfer {
        destination_key: String,
        target: String,
        target_name: String,
        dial_endpoint: String,
        dial_timeout_seconds: u64,
        moh_class: String,
        started_at_ms: u64,
        agent_channel_id: Option<String>,
        answered: bool,
        decision: Option<TransferDecision>,
        decision_digit: Option<char>,
    },
    Voicemail {
        extension: String,
    },
}

impl CurrentAction {
    #[must_use]
    pub fn is_attended_transfer(&self) -> bool {
        matches!(self, Self::AttendedTransfer { .. })
    }
}

/// State of one live call. Created on StasisStart, destroyed on StasisEnd
/// plus a grace period.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Canonical, stable call id.
    pub call_id: String,
    pub caller_channel_id: String,
    pub bridge_id: Option<String>,

    /// Inbound RTP synchronization source, once learned.
    pub ssrc: Option<u32>,
    /// Our outbound SSRC, derived from the inbound one.
    pub outbound_ssrc: Option<u32>,
    /// Active AudioSocket connection, if that transport is in use.
    pub audiosocket_conn_id: Option<String>,
    /// All AudioSocket connections seen for this call (broadcast debug).
    pub audiosocket_conns: Vec<String>,

    pub inbound_encoding: Encoding,
    pub inbound_sample_rate: u32,

    /// Voice-activity flags keyed by detector name; also carries the
    /// inbound PCM16 byte-swap verdict as `pcm16_inbound_swap`.
    pub vad_state: HashMap<String, bool>,

    // Streaming counters, mirrored from the playback manager.
    pub streaming_started: bool,
    pub streaming_bytes_sent: u64,
    pub streaming_fallback_count: u64,
    pub streaming_jitter_buffer_depth: usize,
    pub streaming_keepalive_sent: u64,
    pub streaming_keepalive_timeouts: u64,
    pub last_streaming_error: Option<String>,

    /// Gating token: the stream id currently allowed to send audio.
    pub current_stream_id: Option<String>,

    pub conversation_history: Vec<HistoryTurn>,
    pub current_action: CurrentAction,
    pub transfer_active: bool,
    pub audio_capture_enabled: bool,
    pub cleanup_after_tts: bool,

    pub created_at_ms: u64,
    /// Bumped on every upsert; diagnostic only.
    pub version: u64,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, caller_channel_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            caller_channel_id: caller_channel_id.into(),
            bridge_id: None,
            ssrc: None,
            outbound_ssrc: None,
            audiosocket_conn_id: None,
            audiosocket_conns: Vec::new(),
            inbound_encoding: Encoding::Ulaw,
            inbound_sample_rate: 8000,
            vad_state: HashMap::new(),
            streaming_started: false,
            streaming_bytes_sent: 0,
            streaming_fallback_count: 0,
            streaming_jitter_buffer_depth: 0,
            streaming_keepalive_sent: 0,
            streaming_keepalive_timeouts: 0,
            last_streaming_error: None,
            current_stream_id: None,
            conversation_history: Vec::new(),
            current_action: CurrentAction::None,
            transfer_active: false,
            audio_capture_enabled: true,
            cleanup_after_tts: false,
            created_at_ms: epoch_ms(),
            version: 0,
        }
    }

    /// Appends a turn to the conversation history.
    pub fn push_history(&mut self, role: Role, content: impl Into<String>) {
        self.conversation_history.push(HistoryTurn {
            role,
            content: content.into(),
            ts: epoch_ms(),
        });
    }

    /// Most recent non-empty turn for the given role.
    pub fn last_turn(&self, role: Role) -> Option<&HistoryTurn> {
        self.conversation_history
            .iter()
            .rev()
            .find(|turn| turn.role == role && !turn.content.trim().is_empty())
    }
}

/// Unix epoch in milliseconds.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory session store with copy-on-read snapshots.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<CallSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a session. The returned `Arc` never observes later
    /// mutations; re-read for fresh state.
    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).map(|entry| Arc::clone(&entry))
    }

    /// Versioned replace. The stored version always advances by one,
    /// regardless of the version carried by the caller's snapshot.
    pub fn upsert_call(&self, mut session: CallSession) {
        let call_id = session.call_id.clone();
        match self.sessions.entry(call_id) {
            Entry::Occupied(mut entry) => {
                session.version = entry.get().version + 1;
                entry.insert(Arc::new(session));
            }
            Entry::Vacant(entry) => {
                session.version = 1;
                entry.insert(Arc::new(session));
            }
        }
    }

    /// Applies a closure to the live session under the entry lock.
    ///
    /// Returns false when the call is unknown. Prefer this over
    /// get-modify-upsert when the mutation must not race other writers.
    pub fn update<F>(&self, call_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut CallSession),
    {
        match self.sessions.get_mut(call_id) {
            Some(mut entry) => {
                let mut session = (**entry).clone();
                mutate(&mut session);
                session.version += 1;
                *entry = Arc::new(session);
                true
            }
            None => false,
        }
    }

    /// CAS: acquires the gating token iff it is empty or already equals
    /// `token`. This is what enforces one active stream per call.
    pub fn set_gating_token(&self, call_id: &str, token: &str) -> bool {
        match self.sessions.get_mut(call_id) {
            Some(mut entry) => {
                let current = entry.current_stream_id.as_deref();
                if current.is_none() || current == Some(token) {
                    let mut session = (**entry).clone();
                    session.current_stream_id = Some(token.to_string());
                    session.version += 1;
                    *entry = Arc::new(session);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// CAS: clears the gating token iff it currently equals `token`.
    pub fn clear_gating_token(&self, call_id: &str, token: &str) -> bool {
        match self.sessions.get_mut(call_id) {
            Some(mut entry) => {
                if entry.current_stream_id.as_deref() == Some(token) {
                    let mut session = (**entry).clone();
                    session.current_stream_id = None;
                    session.version += 1;
                    *entry = Arc::new(session);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.remove(call_id).map(|(_, session)| session)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<Arc<CallSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_call(call_id: &str) -> SessionStore {
        let store = SessionStore::new();
        store.upsert_call(CallSession::new(call_id, "chan-1"));
        store
    }

    #[test]
    fn upsert_bumps_version() {
        let store = store_with_call("c1");
        assert_eq!(store.get("c1").unwrap().version, 1);

        let mut session = (*store.get("c1").unwrap()).clone();
        session.transfer_active = true;
        store.upsert_call(session);

        let snapshot = store.get("c1").unwrap();
        assert_eq!(snapshot.version, 2);
        assert!(snapshot.transfer_active);
    }

    #[test]
    fn snapshots_do_not_observe_later_writes() {
        let store = store_with_call("c1");
        let before = store.get("c1").unwrap();
        store.update("c1", |s| s.cleanup_after_tts = true);
        assert!(!before.cleanup_after_tts);
        assert!(store.get("c1").unwrap().cleanup_after_tts);
    }

    #[test]
    fn gating_token_cas_acquire() {
        let store = store_with_call("c1");
        assert!(store.set_gating_token("c1", "stream-a"));
        // Re-acquiring with the same token is idempotent.
        assert!(store.set_gating_token("c1", "stream-a"));
        // A different stream must be refused.
        assert!(!store.set_gating_token("c1", "stream-b"));
    }

    #[test]
    fn gating_token_cas_clear() {
        let store = store_with_call("c1");
        assert!(store.set_gating_token("c1", "stream-a"));
        // Wrong token never clears.
        assert!(!store.clear_gating_token("c1", "stream-b"));
        assert!(store.clear_gating_token("c1", "stream-a"));
        // Second clear is a no-op.
        assert!(!store.clear_gating_token("c1", "stream-a"));
        // Token free again.
        assert!(store.set_gating_token("c1", "stream-b"));
    }

    #[test]
    fn gating_token_on_unknown_call_fails() {
        let store = SessionStore::new();
        assert!(!store.set_gating_token("nope", "stream-a"));
        assert!(!store.clear_gating_token("nope", "stream-a"));
    }

    #[test]
    fn history_tracks_last_turn_per_role() {
        let mut session = CallSession::new("c1", "chan-1");
        session.push_history(Role::User, "hello");
        session.push_history(Role::Assistant, "hi there");
        session.push_history(Role::User, "  ");
        session.push_history(Role::User, "bye");

        assert_eq!(session.last_turn(Role::User).unwrap().content, "bye");
        assert_eq!(
            session.last_turn(Role::Assistant).unwrap().content,
            "hi there"
        );
        assert!(session.last_turn(Role::Tool).is_none());
    }

    #[test]
    fn remove_returns_final_snapshot() {
        let store = store_with_call("c1");
        let removed = store.remove("c1").unwrap();
        assert_eq!(removed.call_id, "c1");
        assert!(store.get("c1").is_none());
    }
}
