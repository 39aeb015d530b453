//! Tool execution context.

use std::sync::Arc;

use crate::ari::AriClient;
use crate::config::Config;
use crate::session::{CallSession, SessionStore};

/// Everything a tool may need while executing.
///
/// Carries handles, not state: session reads go through the store so the
/// tool always sees the latest snapshot.
#[derive(Clone)]
pub struct ToolExecutionContext {
    pub call_id: String,
    pub caller_channel_id: String,
    pub bridge_id: Option<String>,
    pub session_store: Arc<SessionStore>,
    pub ari: AriClient,
    /// Config captured at call admission.
    pub config: Arc<Config>,
    /// Provider that requested the execution (schema/wording hints).
    pub provider_name: String,
    /// What the caller most recently said, when the provider passes it.
    pub current_user_input: Option<String>,
}

impl ToolExecutionContext {
    pub fn get_session(&self) -> Option<Arc<CallSession>> {
        self.session_store.get(&self.call_id)
    }

    /// Serialized mutation of the live session.
    pub fn update_session<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut CallSession),
    {
        self.session_store.update(&self.call_id, mutate)
    }
}
