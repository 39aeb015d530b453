//! Wire-schema translation for tool definitions.
//!
//! Providers disagree on shape: chat-completions APIs nest the function
//! under a `function` key, realtime APIs flatten it, and local models get
//! a prompt section with inline JSON. All variants share one JSON-schema
//! parameters object built here.

use serde_json::{json, Map, Value};

use crate::tools::{ToolDefinition, ToolRegistry};

/// JSON-schema `parameters` object shared by every wire format.
pub fn parameters_schema(definition: &ToolDefinition) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for parameter in &definition.parameters {
        properties.insert(
            parameter.name.clone(),
            json!({
                "type": parameter.kind,
                "description": parameter.description,
            }),
        );
        if parameter.required {
            required.push(Value::String(parameter.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Nested format (chat-completions style).
pub fn to_nested_schema(definition: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": definition.name,
            "description": definition.description,
            "parameters": parameters_schema(definition),
        },
    })
}

/// Flat format (realtime style).
pub fn to_flat_schema(definition: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "name": definition.name,
        "description": definition.description,
        "parameters": parameters_schema(definition),
    })
}

/// Voice-agent format (Deepgram functions list entry).
pub fn to_agent_schema(definition: &ToolDefinition) -> Value {
    json!({
        "name": definition.name,
        "description": definition.description,
        "parameters": parameters_schema(definition),
    })
}

/// All (optionally allowlisted) tools in one wire format.
pub fn registry_schemas(
    registry: &ToolRegistry,
    allowlist: Option<&[String]>,
    translate: fn(&ToolDefinition) -> Value,
) -> Vec<Value> {
    registry
        .definitions_filtered(allowlist)
        .iter()
        .map(translate)
        .collect()
}

/// Prompt section injected into local-LLM system prompts: tool JSON plus
/// the invocation format contract.
pub fn to_local_llm_prompt(registry: &ToolRegistry, allowlist: Option<&[String]>) -> String {
    let definitions = registry.definitions_filtered(allowlist);
    if definitions.is_empty() {
        return String::new();
    }
    let tools_json = serde_json::to_string_pretty(
        &definitions.iter().map(to_agent_schema).collect::<Vec<_>>(),
    )
    .unwrap_or_default();

    format!(
        r#"## Available Tools

You have access to the following tools. When you need to use a tool, output EXACTLY this format:

<tool_call>
{{"name": "tool_name", "arguments": {{"param": "value"}}}}
</tool_call>

After outputting a tool call, provide a brief spoken response.

### Tool Definitions:
{tools_json}

### Important Rules:
- When the user says goodbye, farewell, or wants to end the call, use hangup_call
- When the user asks to email the transcript, use request_transcript
- When the user wants to transfer, use transfer
- Always provide a spoken response along with tool calls
- Only use tools when the user's intent clearly matches the tool's purpose
"#
    )
}
