//! Tool calling: definitions, registry, wire-schema translation, and the
//! telephony/business tool implementations.
//!
//! Tools are registered once at startup and immutable afterwards. The
//! registry is a plain handle owned by the engine (no process-global
//! state); lookups resolve the provider-compatibility aliases so a model
//! asking for `end_call` still reaches `hangup_call`.

pub mod business;
pub mod context;
pub mod parser;
pub mod schema;
pub mod telephony;

pub use context::ToolExecutionContext;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serialized tool results larger than this are truncated before they are
/// sent back to the provider.
pub const MAX_RESULT_BYTES: usize = 12 * 1024;

/// Alias → canonical tool name, for provider naming differences.
const TOOL_ALIASES: [(&str, &str); 4] = [
    ("transfer_call", "transfer"),
    ("hangup", "hangup_call"),
    ("end_call", "hangup_call"),
    ("transfer_to_queue", "transfer"),
];

/// Coarse grouping used for filtering and prompt generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Telephony,
    Business,
    Info,
}

impl ToolCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Telephony => "telephony",
            Self::Business => "business",
            Self::Info => "info",
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolParameter {
    pub name: String,
    /// JSON-schema type name ("string", "number", …).
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn string(name: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: "string".to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// Immutable description of a tool, translated per provider wire format.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub parameters: Vec<ToolParameter>,
    pub requires_channel: bool,
    /// Seconds the engine allows the execution to run.
    pub max_execution_time: u64,
}

/// Execution verdict carried back to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Failed,
    Error,
    Blocked,
}

/// Structured tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub will_hangup: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ai_should_speak: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tool-specific extra fields, flattened into the serialized result.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            message: Some(message.into()),
            will_hangup: false,
            ai_should_speak: false,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            message: Some(message.into()),
            will_hangup: false,
            ai_should_speak: false,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            message: Some(message.into()),
            will_hangup: false,
            ai_should_speak: false,
            error: Some(error.into()),
            extra: Map::new(),
        }
    }

    /// A guardrail verdict: the call continues and the agent speaks
    /// `message` instead of performing the action.
    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Blocked,
            message: Some(message.into()),
            will_hangup: false,
            ai_should_speak: true,
            error: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_hangup(mut self) -> Self {
        self.will_hangup = true;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Serializes with the size cap applied.
    pub fn to_wire_value(&self) -> Value {
        sanitize_result(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

/// Caps a serialized tool result at [`MAX_RESULT_BYTES`] by truncating the
/// message and dropping extras until it fits.
pub fn sanitize_result(mut value: Value) -> Value {
    let size = |v: &Value| v.to_string().len();
    if size(&value) <= MAX_RESULT_BYTES {
        return value;
    }
    if let Value::Object(map) = &mut value {
        // Drop non-contract extras first, largest payload last.
        let keep = ["status", "message", "will_hangup", "ai_should_speak", "error"];
        map.retain(|k, _| keep.contains(&k.as_str()));
        if size(&value) > MAX_RESULT_BYTES {
            if let Some(Value::String(message)) =
                value.as_object_mut().and_then(|m| m.get_mut("message"))
            {
                let mut cut = MAX_RESULT_BYTES / 2;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
        }
    }
    value
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, parameters: &Value, context: &ToolExecutionContext) -> ToolOutcome;
}

/// Registry mapping tool names (and aliases) to implementations.
///
/// Read-only after startup; `register`/`unregister` exist for startup
/// wiring and tests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let definition = tool.definition();
        let mut tools = self.tools.write();
        if tools.insert(definition.name.clone(), tool).is_some() {
            log::warn!("[Tools] Tool {} already registered, overwriting", definition.name);
        } else {
            log::info!(
                "[Tools] Registered tool: {} ({})",
                definition.name,
                definition.category.as_str()
            );
        }
    }

    /// Lookup with alias resolution.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read();
        if let Some(tool) = tools.get(name) {
            return Some(Arc::clone(tool));
        }
        TOOL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .and_then(|(_, canonical)| tools.get(*canonical).map(Arc::clone))
    }

    /// Exact-name membership check (no alias resolution).
    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Unregister by exact name (no alias resolution).
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().remove(name).is_some();
        if removed {
            log::info!("[Tools] Unregistered tool: {name}");
        }
        removed
    }

    pub fn list_tools(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .map(|tool| tool.definition())
            .collect()
    }

    pub fn by_category(&self, category: ToolCategory) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| d.category == category)
            .collect()
    }

    /// Definitions restricted to an allowlist (with alias resolution and
    /// de-duplication). `None` allows everything.
    pub fn definitions_filtered(&self, allowlist: Option<&[String]>) -> Vec<ToolDefinition> {
        match allowlist {
            None => self.definitions(),
            Some(names) => {
                let mut seen = std::collections::HashSet::new();
                names
                    .iter()
                    .filter_map(|name| self.get(name))
                    .map(|tool| tool.definition())
                    .filter(|definition| seen.insert(definition.name.clone()))
                    .collect()
            }
        }
    }

    pub fn clear(&self) {
        self.tools.write().clear();
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for NoopTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.to_string(),
                description: "test tool".to_string(),
                category: ToolCategory::Info,
                parameters: vec![],
                requires_channel: false,
                max_execution_time: 5,
            }
        }

        async fn execute(&self, _p: &Value, _c: &ToolExecutionContext) -> ToolOutcome {
            ToolOutcome::success("ok")
        }
    }

    fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let registry = ToolRegistry::new();
        for name in names {
            registry.register(Arc::new(NoopTool { name }));
        }
        registry
    }

    #[test]
    fn alias_lookup_resolves_canonical_tool() {
        let registry = registry_with(&["hangup_call", "transfer"]);
        assert!(registry.get("hangup_call").is_some());
        assert!(registry.get("end_call").is_some());
        assert!(registry.get("hangup").is_some());
        assert!(registry.get("transfer_call").is_some());
        assert!(registry.get("nonexistent").is_none());
        // `has` is exact-name only.
        assert!(!registry.has("end_call"));
    }

    #[test]
    fn register_unregister_register_is_single_register() {
        let registry = registry_with(&["transfer"]);
        assert!(registry.unregister("transfer"));
        assert!(!registry.unregister("transfer"));
        registry.register(Arc::new(NoopTool { name: "transfer" }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("transfer").is_some());
    }

    #[test]
    fn allowlist_filters_and_dedupes() {
        let registry = registry_with(&["transfer", "hangup_call", "leave_voicemail"]);
        let allow = vec![
            "transfer".to_string(),
            "transfer_call".to_string(), // alias of transfer → deduped
            "hangup_call".to_string(),
            "ghost".to_string(), // unknown → skipped
        ];
        let definitions = registry.definitions_filtered(Some(&allow));
        assert_eq!(definitions.len(), 2);

        let all = registry.definitions_filtered(None);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn outcome_serializes_contract_fields() {
        let outcome = ToolOutcome::success("done")
            .with_hangup()
            .with_extra("destination", Value::String("sales".into()));
        let value = outcome.to_wire_value();
        assert_eq!(value["status"], "success");
        assert_eq!(value["message"], "done");
        assert_eq!(value["will_hangup"], true);
        assert_eq!(value["destination"], "sales");
        // false flags are omitted from the wire form.
        assert!(value.get("ai_should_speak").is_none());
    }

    #[test]
    fn blocked_outcome_asks_agent_to_speak() {
        let value = ToolOutcome::blocked("confirm first").to_wire_value();
        assert_eq!(value["status"], "blocked");
        assert_eq!(value["ai_should_speak"], true);
        assert!(value.get("will_hangup").is_none());
    }

    #[test]
    fn oversized_results_are_capped() {
        let huge = "x".repeat(40 * 1024);
        let outcome = ToolOutcome::success(huge).with_extra("blob", Value::String("y".repeat(20_000)));
        let value = outcome.to_wire_value();
        assert!(value.to_string().len() <= MAX_RESULT_BYTES);
        assert!(value.get("blob").is_none(), "extras dropped first");
        assert_eq!(value["status"], "success");
    }
}
