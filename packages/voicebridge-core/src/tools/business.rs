//! Business tools.
//!
//! Only the transcript request lives here: it validates the address and
//! marks the session so the post-call pipeline (outside this crate) sends
//! the email after hangup.

use async_trait::async_trait;
use serde_json::Value;

use crate::session::Role;
use crate::tools::{
    Tool, ToolCategory, ToolDefinition, ToolExecutionContext, ToolOutcome, ToolParameter,
};

/// Minimal address sanity check: something@domain.tld.
fn plausible_email(address: &str) -> bool {
    let trimmed = address.trim();
    let Some((user, domain)) = trimmed.split_once('@') else {
        return false;
    };
    !user.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !trimmed.contains(char::is_whitespace)
}

/// Offers to email the caller a transcript of the conversation.
pub struct RequestTranscriptTool;

#[async_trait]
impl Tool for RequestTranscriptTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "request_transcript".to_string(),
            description: concat!(
                "Email the caller a transcript of this conversation. Use when the caller asks ",
                "for a transcript or accepts your offer to send one. Always confirm the email ",
                "address back to the caller before hanging up."
            )
            .to_string(),
            category: ToolCategory::Business,
            parameters: vec![ToolParameter::string(
                "email",
                "Email address to send the transcript to.",
                true,
            )],
            requires_channel: false,
            max_execution_time: 10,
        }
    }

    async fn execute(&self, parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome {
        if !context.config.tools.request_transcript.enabled {
            return ToolOutcome::failed("Transcript delivery is not available");
        }
        let Some(email) = parameters.get("email").and_then(Value::as_str) else {
            return ToolOutcome::failed("Missing email address");
        };
        if !plausible_email(email) {
            return ToolOutcome::failed(format!(
                "That doesn't look like a valid email address: {email}"
            ));
        }

        let email = email.trim().to_string();
        log::info!(
            "[Tools] Transcript requested: call={}, email={email}",
            context.call_id
        );
        // Record the request in the history; the post-call pipeline picks
        // it up from there.
        context.update_session(|s| {
            s.push_history(Role::Tool, format!("transcript_requested:{email}"));
        });
        ToolOutcome::success(format!(
            "I'll email the transcript to {email} after we hang up. Is that address correct?"
        ))
        .with_extra("email", Value::String(email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ari::AriClient;
    use crate::config::{AriSettings, Config};
    use crate::session::{CallSession, SessionStore};
    use crate::tools::ToolStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn test_context(enabled: bool) -> ToolExecutionContext {
        let store = Arc::new(SessionStore::new());
        store.upsert_call(CallSession::new("c1", "chan-1"));
        let mut config = Config::default();
        config.tools.request_transcript.enabled = enabled;
        ToolExecutionContext {
            call_id: "c1".to_string(),
            caller_channel_id: "chan-1".to_string(),
            bridge_id: None,
            session_store: store,
            ari: AriClient::new(AriSettings::default()),
            config: Arc::new(config),
            provider_name: "test".to_string(),
            current_user_input: None,
        }
    }

    #[test]
    fn email_plausibility() {
        assert!(plausible_email("alice@example.com"));
        assert!(plausible_email(" bob@mail.example.org "));
        assert!(!plausible_email("no-at-sign.com"));
        assert!(!plausible_email("a@b"));
        assert!(!plausible_email("a b@example.com"));
        assert!(!plausible_email("x@.com"));
    }

    #[tokio::test]
    async fn success_records_request_in_history() {
        let context = test_context(true);
        let outcome = RequestTranscriptTool
            .execute(&json!({"email": "alice@example.com"}), &context)
            .await;
        assert_eq!(outcome.status, ToolStatus::Success);

        let session = context.get_session().unwrap();
        assert!(session
            .conversation_history
            .iter()
            .any(|t| t.content.contains("transcript_requested:alice@example.com")));
    }

    #[tokio::test]
    async fn invalid_email_fails() {
        let context = test_context(true);
        let outcome = RequestTranscriptTool
            .execute(&json!({"email": "not-an-email"}), &context)
            .await;
        assert_eq!(outcome.status, ToolStatus::Failed);
    }

    #[tokio::test]
    async fn disabled_feature_fails() {
        let context = test_context(false);
        let outcome = RequestTranscriptTool
            .execute(&json!({"email": "alice@example.com"}), &context)
            .await;
        assert_eq!(outcome.status, ToolStatus::Failed);
    }
}
