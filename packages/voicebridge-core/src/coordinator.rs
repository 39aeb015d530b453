//! Conversation coordinator: per-call conversation-state machine and
//! TTS/STT gating.
//!
//! The coordinator owns the conversation FSM and is the only component
//! that acquires or releases the gating token on behalf of playback. The
//! engine owns both the coordinator and the streaming manager and injects
//! the coordinator at construction; barge-in is therefore a decision the
//! coordinator returns, not a call it makes back into the manager.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::session::SessionStore;

/// Conversation state of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    ToolExecuting,
}

/// What the engine should do about a user-speech event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInDecision {
    /// Nothing is playing; continue as normal.
    Ignore,
    /// The agent is speaking; the caller interrupted. The engine may stop
    /// the active stream.
    PreemptPlayback,
}

/// Coordinates conversation state with streaming playback gating.
pub struct ConversationCoordinator {
    session_store: Arc<SessionStore>,
    states: DashMap<String, ConversationState>,
}

impl ConversationCoordinator {
    pub fn new(session_store: Arc<SessionStore>) -> Self {
        Self {
            session_store,
            states: DashMap::new(),
        }
    }

    pub fn state(&self, call_id: &str) -> ConversationState {
        self.states
            .get(call_id)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn update_state(&self, call_id: &str, state: ConversationState) {
        let previous = self.states.insert(call_id.to_string(), state);
        if previous != Some(state) {
            log::debug!(
                "[Coordinator] State change: call={call_id}, {:?} -> {state:?}",
                previous.unwrap_or_default()
            );
        }
    }

    /// Acquires the gating token for a stream and enters `Speaking`.
    ///
    /// Fails (returns false) when another stream already holds the token;
    /// the caller must not send audio in that case.
    pub fn on_tts_start(&self, call_id: &str, stream_id: &str) -> bool {
        if !self.session_store.set_gating_token(call_id, stream_id) {
            log::warn!(
                "[Coordinator] Gating token contention: call={call_id}, stream={stream_id}"
            );
            return false;
        }
        self.update_state(call_id, ConversationState::Speaking);
        true
    }

    /// Releases the gating token iff this stream still holds it, and
    /// returns the call to `Listening`.
    pub fn on_tts_end(&self, call_id: &str, stream_id: &str, reason: &str) {
        let cleared = self.session_store.clear_gating_token(call_id, stream_id);
        if cleared {
            log::debug!(
                "[Coordinator] TTS ended: call={call_id}, stream={stream_id}, reason={reason}"
            );
        } else {
            log::debug!(
                "[Coordinator] TTS end ignored (token not held): call={call_id}, stream={stream_id}, reason={reason}"
            );
        }
        // Token cleared ⇒ the call is listening again, even when a racing
        // stream already replaced the token (that stream will set Speaking
        // itself on acquisition).
        if cleared {
            self.update_state(call_id, ConversationState::Listening);
        }
    }

    /// Barge-in hook: call on a detected user-speech event.
    pub fn on_user_speech(&self, call_id: &str) -> BargeInDecision {
        match self.state(call_id) {
            ConversationState::Speaking => BargeInDecision::PreemptPlayback,
            _ => BargeInDecision::Ignore,
        }
    }

    /// Drops all per-call state. Called at call teardown.
    pub fn remove_call(&self, call_id: &str) {
        self.states.remove(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallSession;

    fn coordinator_with_call(call_id: &str) -> ConversationCoordinator {
        let store = Arc::new(SessionStore::new());
        store.upsert_call(CallSession::new(call_id, "chan-1"));
        ConversationCoordinator::new(store)
    }

    #[test]
    fn tts_start_sets_token_and_speaking() {
        let coordinator = coordinator_with_call("c1");
        coordinator.update_state("c1", ConversationState::Listening);

        assert!(coordinator.on_tts_start("c1", "stream-a"));
        assert_eq!(coordinator.state("c1"), ConversationState::Speaking);
    }

    #[test]
    fn second_stream_is_refused_while_first_holds_token() {
        let coordinator = coordinator_with_call("c1");
        assert!(coordinator.on_tts_start("c1", "stream-a"));
        assert!(!coordinator.on_tts_start("c1", "stream-b"));
        // First stream keeps speaking.
        assert_eq!(coordinator.state("c1"), ConversationState::Speaking);
    }

    #[test]
    fn tts_end_clears_token_and_returns_to_listening() {
        let coordinator = coordinator_with_call("c1");
        assert!(coordinator.on_tts_start("c1", "stream-a"));
        coordinator.on_tts_end("c1", "stream-a", "end-of-stream");

        assert_eq!(coordinator.state("c1"), ConversationState::Listening);
        // Token is free: a new stream may acquire.
        assert!(coordinator.on_tts_start("c1", "stream-b"));
    }

    #[test]
    fn tts_end_with_wrong_stream_keeps_state() {
        let coordinator = coordinator_with_call("c1");
        assert!(coordinator.on_tts_start("c1", "stream-a"));
        coordinator.on_tts_end("c1", "stream-b", "stale");
        assert_eq!(coordinator.state("c1"), ConversationState::Speaking);
    }

    #[test]
    fn barge_in_only_preempts_while_speaking() {
        let coordinator = coordinator_with_call("c1");
        assert_eq!(coordinator.on_user_speech("c1"), BargeInDecision::Ignore);

        assert!(coordinator.on_tts_start("c1", "stream-a"));
        assert_eq!(
            coordinator.on_user_speech("c1"),
            BargeInDecision::PreemptPlayback
        );

        coordinator.on_tts_end("c1", "stream-a", "end-of-stream");
        assert_eq!(coordinator.on_user_speech("c1"), BargeInDecision::Ignore);
    }
}
