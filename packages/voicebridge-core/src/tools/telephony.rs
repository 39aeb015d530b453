//! Telephony action tools: transfer, attended transfer, hangup, voicemail.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::DestinationConfig;
use crate::session::{epoch_ms, CurrentAction, Role};
use crate::tools::{
    Tool, ToolCategory, ToolDefinition, ToolExecutionContext, ToolOutcome, ToolParameter,
};

/// Grace before a voicemail transfer leaves Stasis, letting in-flight TTS
/// clear the media path. Without it the VoiceMail greeting stalls until
/// the caller speaks.
const VOICEMAIL_MEDIA_GRACE: Duration = Duration::from_millis(800);

// ── Destination resolution ──────────────────────────────────────────────

/// Spoken-alias table for common transfer requests. Illustrative, not
/// authoritative: configuration keys and descriptions are matched first.
const DESTINATION_ALIASES: [(&str, &[&str]); 6] = [
    ("sales", &["sales"]),
    ("support", &["support", "tech"]),
    ("agent", &["agent", "human", "representative", "rep", "person", "operator"]),
    ("human", &["agent", "human", "representative", "rep", "person", "operator"]),
    ("real person", &["agent", "human", "representative", "rep", "person", "operator"]),
    ("live agent", &["agent", "human", "representative", "rep", "person", "operator"]),
];

/// Resolves a model-provided destination against the configured catalog:
/// exact key, case-insensitive key, target extension, key/description
/// substring, then the alias table. Multiple matches prefer a single
/// `*_agent` key; otherwise the resolution is ambiguous and fails.
pub fn resolve_destination_key(
    user_value: &str,
    destinations: &HashMap<String, DestinationConfig>,
    candidates: &HashMap<String, DestinationConfig>,
) -> Option<String> {
    if destinations.contains_key(user_value) {
        return Some(user_value.to_string());
    }
    let raw = user_value.trim();
    if raw.is_empty() {
        return None;
    }
    let raw_lower = raw.to_lowercase();

    for key in destinations.keys() {
        if key.to_lowercase() == raw_lower {
            return Some(key.clone());
        }
    }

    let pool = if candidates.is_empty() {
        destinations
    } else {
        candidates
    };

    // Extension number match.
    for (key, config) in pool {
        let target = config.target.trim();
        if !target.is_empty() && (raw == target || raw_lower == target.to_lowercase()) {
            return Some(key.clone());
        }
    }

    // Substring of the key or its description.
    let mut matches: Vec<String> = pool
        .iter()
        .filter(|(key, config)| {
            key.to_lowercase().contains(&raw_lower)
                || config
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase()
                    .contains(&raw_lower)
        })
        .map(|(key, _)| key.clone())
        .collect();

    if matches.is_empty() {
        if let Some((_, tokens)) = DESTINATION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == raw_lower)
        {
            matches = pool
                .iter()
                .filter(|(key, config)| {
                    let key_lower = key.to_lowercase();
                    let desc_lower = config
                        .description
                        .as_deref()
                        .unwrap_or_default()
                        .to_lowercase();
                    tokens
                        .iter()
                        .any(|t| key_lower.contains(t) || desc_lower.contains(t))
                })
                .map(|(key, _)| key.clone())
                .collect();
        }
    }

    match matches.len() {
        1 => matches.pop(),
        0 => None,
        _ => {
            let preferred: Vec<String> = matches
                .iter()
                .filter(|m| m.to_lowercase().ends_with("_agent"))
                .cloned()
                .collect();
            (preferred.len() == 1).then(|| preferred[0].clone())
        }
    }
}

fn attended_allowed(
    destinations: &HashMap<String, DestinationConfig>,
) -> HashMap<String, DestinationConfig> {
    destinations
        .iter()
        .filter(|(_, config)| config.kind == "extension" && config.attended_allowed)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn build_ai_caller_id(context: &ToolExecutionContext) -> String {
    let identity = &context.config.tools.ai_identity;
    format!("\"{}\" <{}>", identity.name, identity.number)
}

fn dial_endpoint(
    extension: &str,
    destination: &DestinationConfig,
    context: &ToolExecutionContext,
) -> String {
    if let Some(dial_string) = destination.dial_string.as_deref() {
        return dial_string.to_string();
    }
    format!("{}/{extension}", context.config.tools.transfer.technology)
}

// ── transfer ────────────────────────────────────────────────────────────

/// Blind transfer: resolves the destination and sends the channel back
/// into the dialplan at the target extension.
pub struct TransferTool;

#[async_trait]
impl Tool for TransferTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "transfer".to_string(),
            description: concat!(
                "Transfer the caller to a configured destination. Use when the caller asks ",
                "for a department, a specific extension, or a human agent. The destination ",
                "must be one of the configured destination keys."
            )
            .to_string(),
            category: ToolCategory::Telephony,
            parameters: vec![ToolParameter::string(
                "destination",
                "Name of the configured destination to dial, e.g. 'sales'.",
                true,
            )],
            requires_channel: true,
            max_execution_time: 15,
        }
    }

    async fn execute(&self, parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome {
        let Some(requested) = parameters
            .get("destination")
            .or_else(|| parameters.get("target"))
            .and_then(Value::as_str)
        else {
            return ToolOutcome::failed("Missing destination");
        };

        let destinations = &context.config.tools.destinations;
        let Some(key) = resolve_destination_key(requested, destinations, &HashMap::new()) else {
            let known: Vec<&str> = destinations.keys().map(String::as_str).collect();
            return ToolOutcome::failed(format!(
                "Unknown destination: {requested}. Configured destinations: {}",
                known.join(", ")
            ));
        };
        let destination = &destinations[&key];
        let target = destination.target.trim();
        if target.is_empty() {
            return ToolOutcome::failed(format!("Invalid destination target for: {key}"));
        }
        let description = destination.description.clone().unwrap_or_else(|| key.clone());

        log::info!(
            "[Tools] Transfer requested: call={}, destination={key}, target={target}",
            context.call_id
        );
        context.update_session(|s| {
            s.transfer_active = true;
            s.audio_capture_enabled = false;
        });

        match context
            .ari
            .continue_to_dialplan(&context.caller_channel_id, "from-internal", target, 1)
            .await
        {
            Ok(()) => ToolOutcome::success(format!("Transferring you to {description} now."))
                .with_extra("destination", Value::String(key)),
            Err(e) => {
                log::error!(
                    "[Tools] Transfer failed: call={}, error={e}",
                    context.call_id
                );
                context.update_session(|s| {
                    s.transfer_active = false;
                    s.audio_capture_enabled = true;
                });
                ToolOutcome::failed(format!("Unable to transfer the call to {description}."))
            }
        }
    }
}

// ── attended_transfer ───────────────────────────────────────────────────

/// Warm transfer: caller on MOH, agent leg originated with the AI caller
/// id, then DTMF acceptance (1=accept, 2=decline) handled by the engine.
pub struct AttendedTransferTool;

#[async_trait]
impl Tool for AttendedTransferTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "attended_transfer".to_string(),
            description: concat!(
                "Warm transfer to a configured extension with a one-way announcement to the ",
                "agent, then DTMF acceptance (1=accept, 2=decline). The caller is placed on ",
                "hold music while the agent is contacted. Use when you must brief a human ",
                "before connecting the caller."
            )
            .to_string(),
            category: ToolCategory::Telephony,
            parameters: vec![ToolParameter::string(
                "destination",
                "Name of the configured destination to dial (must allow attended transfer). Example: 'support_agent'.",
                true,
            )],
            requires_channel: true,
            max_execution_time: 30,
        }
    }

    async fn execute(&self, parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome {
        let Some(requested) = parameters
            .get("destination")
            .or_else(|| parameters.get("target"))
            .and_then(Value::as_str)
        else {
            return ToolOutcome::failed("Missing destination");
        };

        let settings = &context.config.tools.attended_transfer;
        if !settings.enabled {
            return ToolOutcome::failed("Attended transfer is not enabled");
        }

        let destinations = &context.config.tools.destinations;
        let allowed = attended_allowed(destinations);
        let Some(key) = resolve_destination_key(requested, destinations, &allowed) else {
            let mut names: Vec<&str> = allowed.keys().map(String::as_str).collect();
            names.sort_unstable();
            return ToolOutcome::failed(format!(
                "Unknown destination: {requested}.{} Use one of the configured destination keys.",
                if names.is_empty() {
                    String::new()
                } else {
                    format!(" Allowed attended destinations: {}.", names.join(", "))
                }
            ));
        };

        let destination = &destinations[&key];
        if destination.kind != "extension" {
            return ToolOutcome::failed(
                "Attended transfer is only supported for extension destinations",
            );
        }
        if !destination.attended_allowed {
            return ToolOutcome::failed(format!(
                "Attended transfer is not enabled for destination: {key}"
            ));
        }
        let extension = destination.target.trim().to_string();
        if extension.is_empty() {
            return ToolOutcome::failed(format!("Invalid destination target for: {key}"));
        }
        let description = destination.description.clone().unwrap_or_else(|| key.clone());
        let endpoint = dial_endpoint(&extension, destination, context);

        log::info!(
            "[Tools] Attended transfer requested: call={}, destination={key}, extension={extension}, endpoint={endpoint}",
            context.call_id
        );

        // Caller waits on hold music while we dial the agent.
        if let Err(e) = context
            .ari
            .start_moh(&context.caller_channel_id, &settings.moh_class)
            .await
        {
            log::warn!(
                "[Tools] Failed to start MOH for attended transfer: call={}, error={e}",
                context.call_id
            );
        }

        // Record the action and stop feeding MOH into STT.
        context.update_session(|s| {
            s.current_action = CurrentAction::AttendedTransfer {
                destination_key: key.clone(),
                target: extension.clone(),
                target_name: description.clone(),
                dial_endpoint: endpoint.clone(),
                dial_timeout_seconds: settings.dial_timeout_seconds,
                moh_class: settings.moh_class.clone(),
                started_at_ms: epoch_ms(),
                agent_channel_id: None,
                answered: false,
                decision: None,
                decision_digit: None,
            };
            s.audio_capture_enabled = false;
        });

        let caller_id = build_ai_caller_id(context);
        let originate = context
            .ari
            .originate(
                &endpoint,
                &caller_id,
                settings.dial_timeout_seconds,
                &format!("attended-transfer,{},{key}", context.call_id),
                json!({
                    "AGENT_ACTION": "attended_transfer",
                    "AGENT_CALL_ID": context.call_id,
                    "AGENT_TARGET": extension,
                    "VB_TRANSFER_DESTINATION_KEY": key,
                }),
            )
            .await;

        match originate {
            Ok(agent_channel_id) => {
                context.update_session(|s| {
                    if let CurrentAction::AttendedTransfer {
                        agent_channel_id: slot,
                        ..
                    } = &mut s.current_action
                    {
                        *slot = Some(agent_channel_id.clone());
                    }
                });
                log::info!(
                    "[Tools] Attended transfer agent leg originated: call={}, agent_channel={agent_channel_id}",
                    context.call_id
                );
                ToolOutcome::success(format!("Please hold while I connect you to {description}."))
                    .with_extra("destination", Value::String(key))
                    .with_extra("type", Value::String("attended_transfer".to_string()))
            }
            Err(e) => {
                log::error!(
                    "[Tools] Failed to originate attended transfer agent leg: call={}, error={e}",
                    context.call_id
                );
                // Roll back: stop MOH, clear the recorded action.
                let _ = context.ari.stop_moh(&context.caller_channel_id).await;
                context.update_session(|s| {
                    s.current_action = CurrentAction::None;
                    s.audio_capture_enabled = true;
                });
                ToolOutcome::failed(format!("Unable to place the transfer call to {description}."))
            }
        }
    }
}

// ── hangup_call ─────────────────────────────────────────────────────────

const AFFIRMATIVE_MARKERS: [&str; 11] = [
    "yes",
    "yeah",
    "yep",
    "correct",
    "that's correct",
    "thats correct",
    "that's right",
    "thats right",
    "right",
    "exactly",
    "affirmative",
];

const END_CALL_MARKERS: [&str; 14] = [
    "bye",
    "goodbye",
    "hang up",
    "hangup",
    "end the call",
    "end call",
    "that's all",
    "thats all",
    "nothing else",
    "no thanks",
    "no thank you",
    "i'm done",
    "im done",
    "all set",
];

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn looks_like_emailish(text: &str) -> bool {
    let t = normalize(text);
    if t.is_empty() {
        return false;
    }
    if let Some(at) = t.find('@') {
        // A domain-ish tail after the '@'.
        let tail = &t[at + 1..];
        return tail
            .find('.')
            .is_some_and(|dot| dot > 0 && tail.len() > dot + 2);
    }
    // Spoken-email pattern: "alice at example dot com".
    let padded = format!(" {t} ");
    if padded.contains(" at ") {
        return padded.contains(" dot ")
            || [".com", ".net", ".org", ".io", ".co"]
                .iter()
                .any(|tld| t.contains(tld));
    }
    false
}

fn is_affirmative(text: &str) -> bool {
    let t = normalize(text);
    !t.is_empty() && AFFIRMATIVE_MARKERS.iter().any(|m| t.contains(m))
}

fn is_end_call_intent(text: &str) -> bool {
    let t = normalize(text);
    !t.is_empty() && END_CALL_MARKERS.iter().any(|m| t.contains(m))
}

fn assistant_is_confirming_contact(text: &str) -> bool {
    let t = normalize(text);
    if t.is_empty() {
        return false;
    }
    if t.contains("is that correct") || t.contains("is that right") || t.contains("did i get that")
    {
        return true;
    }
    if t.contains("email") && t.ends_with('?') {
        return true;
    }
    t.contains("email address") && (t.contains("confirm") || t.contains("correct"))
}

/// Ends the call with a farewell, guarded against premature hangups while
/// contact details are being confirmed or a transcript offer is owed.
pub struct HangupCallTool;

#[async_trait]
impl Tool for HangupCallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "hangup_call".to_string(),
            description: concat!(
                "End the current call with a farewell message. Use this tool when:\n",
                "- User says goodbye, bye, see you, talk to you later, take care, etc.\n",
                "- User says 'that's all', 'nothing else', 'I'm good', 'I'm done', 'all set'\n",
                "- User thanks you after receiving help: 'thanks', 'thank you', 'appreciate it'\n",
                "- Conversation naturally concludes after completing the user's request\n",
                "- User explicitly requests to end the call\n",
                "IMPORTANT: Only use this tool when you are confident the caller wants to end the call.\n",
                "SEQUENCE: call hangup_call with farewell_message set to the exact goodbye sentence you\n",
                "intend to say, then immediately speak that exact sentence as your final response.\n",
                "If you are uncertain, ask 'Is there anything else I can help with?' as a normal response\n",
                "(do NOT call this tool)."
            )
            .to_string(),
            category: ToolCategory::Telephony,
            parameters: vec![ToolParameter::string(
                "farewell_message",
                "Farewell message to speak before hanging up. Should be warm and professional.",
                false,
            )],
            requires_channel: true,
            max_execution_time: 5,
        }
    }

    async fn execute(&self, parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome {
        let farewell = parameters
            .get("farewell_message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| context.config.tools.hangup_call.farewell_message.clone());

        if let Some(session) = context.get_session() {
            let last_user = session
                .last_turn(Role::User)
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let last_assistant = session
                .last_turn(Role::Assistant)
                .map(|t| t.content.clone())
                .unwrap_or_default();

            // Guardrail 1: transcript offer owed. When transcript sending
            // is enabled and the caller is wrapping up, the offer must
            // come before the goodbye.
            if context.config.tools.request_transcript.enabled && is_end_call_intent(&last_user) {
                let recent: String = session
                    .conversation_history
                    .iter()
                    .rev()
                    .take(10)
                    .map(|t| t.content.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(" ");
                if !recent.contains("transcript") {
                    log::info!(
                        "[Tools] Hangup blocked: transcript not offered yet: call={}",
                        context.call_id
                    );
                    return ToolOutcome::blocked(
                        "Before we hang up, would you like me to email you a transcript of our conversation?",
                    );
                }
            }

            // Guardrail 2: the caller just supplied an email that the
            // assistant asked about but has not yet confirmed.
            let pending_contact_confirmation = looks_like_emailish(&last_user)
                && !is_affirmative(&last_user)
                && assistant_is_confirming_contact(&last_assistant)
                && !is_end_call_intent(&last_user);
            if pending_contact_confirmation {
                log::info!(
                    "[Tools] Hangup blocked: pending contact confirmation: call={}",
                    context.call_id
                );
                return ToolOutcome::blocked(
                    "Before we hang up, I just need to confirm the email address for the transcript. \
                     Could you please confirm if that's correct?",
                );
            }
        }

        log::info!(
            "[Tools] Hangup requested: call={}, farewell={farewell}",
            context.call_id
        );
        // The engine hangs up only after the farewell audio finishes.
        context.update_session(|s| s.cleanup_after_tts = true);
        ToolOutcome::success(farewell).with_hangup()
    }
}

// ── leave_voicemail ─────────────────────────────────────────────────────

/// Routes the caller into the switch's voicemail dialplan.
pub struct VoicemailTool;

#[async_trait]
impl Tool for VoicemailTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "leave_voicemail".to_string(),
            description: "Send the caller to voicemail so they can leave a message".to_string(),
            category: ToolCategory::Telephony,
            parameters: vec![],
            requires_channel: true,
            max_execution_time: 15,
        }
    }

    async fn execute(&self, _parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome {
        let settings = &context.config.tools.leave_voicemail;
        if !settings.enabled {
            log::warn!("[Tools] Voicemail tool not configured: call={}", context.call_id);
            return ToolOutcome::failed("Voicemail is not available");
        }
        let Some(extension) = settings.extension.as_deref().filter(|e| !e.is_empty()) else {
            log::error!(
                "[Tools] Voicemail extension not configured: call={}",
                context.call_id
            );
            return ToolOutcome::failed("Voicemail is not configured properly");
        };

        log::info!(
            "[Tools] Voicemail transfer requested: call={}, extension={extension}",
            context.call_id
        );

        // Flag the transfer before leaving Stasis so cleanup does not hang
        // up the caller channel.
        context.update_session(|s| {
            s.transfer_active = true;
            s.current_action = CurrentAction::Voicemail {
                extension: extension.to_string(),
            };
        });

        // Let the current TTS clear the RTP path before the channel leaves
        // Stasis.
        tokio::time::sleep(VOICEMAIL_MEDIA_GRACE).await;

        let dialplan_context = settings.context.as_deref().unwrap_or("ext-local");
        let dialplan_extension = format!("vmu{extension}");
        match context
            .ari
            .continue_to_dialplan(
                &context.caller_channel_id,
                dialplan_context,
                &dialplan_extension,
                1,
            )
            .await
        {
            Ok(()) => {
                log::info!(
                    "[Tools] Voicemail transfer executed: call={}, extension={extension}",
                    context.call_id
                );
                // A question prompts the caller to speak, which establishes
                // the two-way media path the VoiceMail app waits for.
                ToolOutcome::success("Are you ready to leave a message now?")
            }
            Err(e) => {
                log::error!(
                    "[Tools] Voicemail transfer failed: call={}, error={e}",
                    context.call_id
                );
                context.update_session(|s| {
                    s.transfer_active = false;
                    s.current_action = CurrentAction::None;
                });
                ToolOutcome::failed("Unable to transfer to voicemail at this time")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ari::AriClient;
    use crate::config::{AriSettings, Config, VoicemailSettings};
    use crate::session::{CallSession, SessionStore};
    use crate::tools::ToolStatus;
    use std::sync::Arc;

    fn destination(kind: &str, target: &str, description: &str, attended: bool) -> DestinationConfig {
        DestinationConfig {
            kind: kind.to_string(),
            target: target.to_string(),
            description: Some(description.to_string()),
            attended_allowed: attended,
            dial_string: None,
        }
    }

    fn catalog() -> HashMap<String, DestinationConfig> {
        HashMap::from([
            (
                "sales".to_string(),
                destination("extension", "2001", "Sales team", false),
            ),
            (
                "support_agent".to_string(),
                destination("extension", "2002", "Technical support", true),
            ),
            (
                "billing_agent".to_string(),
                destination("extension", "2003", "Billing department", true),
            ),
        ])
    }

    fn test_context(config: Config) -> ToolExecutionContext {
        let store = Arc::new(SessionStore::new());
        store.upsert_call(CallSession::new("c1", "chan-1"));
        ToolExecutionContext {
            call_id: "c1".to_string(),
            caller_channel_id: "chan-1".to_string(),
            bridge_id: None,
            session_store: store,
            // Unroutable ARI endpoint: command calls fail fast.
            ari: AriClient::new(AriSettings {
                base_url: "http://127.0.0.1:1/ari".into(),
                ..AriSettings::default()
            }),
            config: Arc::new(config),
            provider_name: "test".to_string(),
            current_user_input: None,
        }
    }

    mod destination_resolution {
        use super::*;

        #[test]
        fn exact_and_case_insensitive_keys() {
            let catalog = catalog();
            assert_eq!(
                resolve_destination_key("sales", &catalog, &HashMap::new()),
                Some("sales".to_string())
            );
            assert_eq!(
                resolve_destination_key("SALES", &catalog, &HashMap::new()),
                Some("sales".to_string())
            );
        }

        #[test]
        fn matches_by_target_extension() {
            let catalog = catalog();
            assert_eq!(
                resolve_destination_key("2002", &catalog, &HashMap::new()),
                Some("support_agent".to_string())
            );
        }

        #[test]
        fn matches_by_description_substring() {
            let catalog = catalog();
            assert_eq!(
                resolve_destination_key("billing", &catalog, &HashMap::new()),
                Some("billing_agent".to_string())
            );
        }

        #[test]
        fn alias_with_multiple_agent_matches_is_ambiguous() {
            // "human" maps to the agent token set; both *_agent keys match,
            // so no single preferred key exists.
            let catalog = catalog();
            assert_eq!(resolve_destination_key("human", &catalog, &HashMap::new()), None);
        }

        #[test]
        fn alias_resolves_when_one_agent_key_matches() {
            let mut catalog = catalog();
            catalog.remove("billing_agent");
            assert_eq!(
                resolve_destination_key("human", &catalog, &HashMap::new()),
                Some("support_agent".to_string())
            );
        }

        #[test]
        fn unknown_destination_is_none() {
            assert_eq!(
                resolve_destination_key("warehouse", &catalog(), &HashMap::new()),
                None
            );
        }

        #[test]
        fn restricted_candidates_limit_fuzzy_matches() {
            let catalog = catalog();
            let allowed = attended_allowed(&catalog);
            // "sales" is not attended-allowed; exact key still resolves…
            assert_eq!(
                resolve_destination_key("sales", &catalog, &allowed),
                Some("sales".to_string())
            );
            // …but fuzzy matching by target only sees the allowed pool.
            assert_eq!(resolve_destination_key("2001", &catalog, &allowed), None);
        }
    }

    mod hangup_guardrails {
        use super::*;

        #[test]
        fn emailish_detection() {
            assert!(looks_like_emailish("it's alice@example.com"));
            assert!(looks_like_emailish("alice at example dot com"));
            assert!(!looks_like_emailish("thanks, bye"));
            assert!(!looks_like_emailish("we met at noon"));
        }

        #[test]
        fn end_call_intent_detection() {
            assert!(is_end_call_intent("thanks, bye"));
            assert!(is_end_call_intent("that's all for today"));
            assert!(!is_end_call_intent("what are your hours"));
        }

        #[tokio::test]
        async fn transcript_offer_blocks_hangup() {
            let mut config = Config::default();
            config.tools.request_transcript.enabled = true;
            let context = test_context(config);
            context.update_session(|s| {
                s.push_history(Role::Assistant, "Happy to help!");
                s.push_history(Role::User, "thanks, bye");
            });

            let outcome = HangupCallTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Blocked);
            assert!(!outcome.will_hangup);
            assert!(outcome.ai_should_speak);
            assert!(outcome.message.unwrap().contains("transcript"));
            // The session must not be marked for cleanup.
            assert!(!context.get_session().unwrap().cleanup_after_tts);
        }

        #[tokio::test]
        async fn hangup_allowed_after_transcript_was_discussed() {
            let mut config = Config::default();
            config.tools.request_transcript.enabled = true;
            let context = test_context(config);
            context.update_session(|s| {
                s.push_history(Role::Assistant, "Would you like a transcript emailed?");
                s.push_history(Role::User, "no thanks, bye");
            });

            let outcome = HangupCallTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Success);
            assert!(outcome.will_hangup);
            assert!(context.get_session().unwrap().cleanup_after_tts);
        }

        #[tokio::test]
        async fn pending_email_confirmation_blocks_hangup() {
            let context = test_context(Config::default());
            context.update_session(|s| {
                s.push_history(Role::Assistant, "Your email is alice@example.com, is that correct?");
                s.push_history(Role::User, "alice at example dot com");
            });

            let outcome = HangupCallTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Blocked);
            assert!(outcome.message.unwrap().contains("confirm"));
        }

        #[tokio::test]
        async fn plain_goodbye_hangs_up_with_configured_farewell() {
            let context = test_context(Config::default());
            context.update_session(|s| {
                s.push_history(Role::User, "goodbye");
            });

            let outcome = HangupCallTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Success);
            assert!(outcome.will_hangup);
            assert_eq!(
                outcome.message.as_deref(),
                Some("Thank you for calling. Goodbye!")
            );
        }

        #[tokio::test]
        async fn explicit_farewell_parameter_wins() {
            let context = test_context(Config::default());
            let outcome = HangupCallTool
                .execute(&json!({"farewell_message": "Take care now!"}), &context)
                .await;
            assert_eq!(outcome.message.as_deref(), Some("Take care now!"));
        }
    }

    mod voicemail {
        use super::*;

        #[tokio::test]
        async fn disabled_voicemail_fails() {
            let context = test_context(Config::default());
            let outcome = VoicemailTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Failed);
        }

        #[tokio::test]
        async fn missing_extension_fails() {
            let mut config = Config::default();
            config.tools.leave_voicemail = VoicemailSettings {
                enabled: true,
                extension: None,
                context: None,
            };
            let context = test_context(config);
            let outcome = VoicemailTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Failed);
            assert!(outcome.message.unwrap().contains("not configured"));
        }

        #[tokio::test(start_paused = true)]
        async fn ari_failure_rolls_back_transfer_flag() {
            let mut config = Config::default();
            config.tools.leave_voicemail = VoicemailSettings {
                enabled: true,
                extension: Some("100".to_string()),
                context: None,
            };
            let context = test_context(config);

            let outcome = VoicemailTool.execute(&json!({}), &context).await;
            assert_eq!(outcome.status, ToolStatus::Failed);
            let session = context.get_session().unwrap();
            assert!(!session.transfer_active, "flag must be rolled back");
            assert!(matches!(session.current_action, CurrentAction::None));
        }
    }

    mod attended {
        use super::*;

        #[tokio::test]
        async fn disabled_attended_transfer_fails() {
            let mut config = Config::default();
            config.tools.destinations = catalog();
            let context = test_context(config);
            let outcome = AttendedTransferTool
                .execute(&json!({"destination": "support_agent"}), &context)
                .await;
            assert_eq!(outcome.status, ToolStatus::Failed);
            assert!(outcome.message.unwrap().contains("not enabled"));
        }

        #[tokio::test]
        async fn destination_without_attended_permission_fails() {
            let mut config = Config::default();
            config.tools.destinations = catalog();
            config.tools.attended_transfer.enabled = true;
            let context = test_context(config);
            let outcome = AttendedTransferTool
                .execute(&json!({"destination": "sales"}), &context)
                .await;
            assert_eq!(outcome.status, ToolStatus::Failed);
        }

        #[tokio::test]
        async fn originate_failure_rolls_back_moh_and_action() {
            let mut config = Config::default();
            config.tools.destinations = catalog();
            config.tools.attended_transfer.enabled = true;
            let context = test_context(config);

            let outcome = AttendedTransferTool
                .execute(&json!({"destination": "support_agent"}), &context)
                .await;
            assert_eq!(outcome.status, ToolStatus::Failed);

            let session = context.get_session().unwrap();
            assert!(matches!(session.current_action, CurrentAction::None));
            assert!(session.audio_capture_enabled);
        }
    }
}
