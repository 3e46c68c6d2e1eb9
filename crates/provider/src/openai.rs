//! OpenAI-compatible chat-completions adapter.
//!
//! Works against any endpoint speaking the `/chat/completions` dialect
//! (OpenAI, Ollama, vLLM, llama.cpp server). Non-streaming: the engine
//! consumes complete responses.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;
use crate::types::{
    AssistantReply, ChatRequest, ChatResponse, ContentPart, Message, MessageContent, Role,
    ToolCall, ToolChoice, ToolDefinition, Usage,
};
use crate::Provider;

pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn from_config(config: &drover_config::ProviderConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        Self::new(config.base_url.clone(), api_key)
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<Value> {
        let mut msgs = Vec::new();
        if let Some(system) = &request.system {
            msgs.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            match &msg.content {
                MessageContent::Text(text) => {
                    msgs.push(json!({"role": role_str(&msg.role), "content": text}));
                }
                MessageContent::Parts(parts) => {
                    push_parts(&mut msgs, &msg.role, parts);
                }
            }
        }
        msgs
    }

    fn build_tools(&self, tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Tool-use parts become an assistant message with `tool_calls`; tool-result
/// parts become `role: tool` messages. Plain text parts keep their role.
fn push_parts(msgs: &mut Vec<Value>, role: &Role, parts: &[ContentPart]) {
    let mut tool_calls = Vec::new();
    let mut texts = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => texts.push(text.clone()),
            ContentPart::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                }));
            }
            ContentPart::ToolResult { tool_use_id, content } => {
                msgs.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
        }
    }
    if !tool_calls.is_empty() {
        let mut msg = json!({"role": "assistant", "tool_calls": tool_calls});
        if !texts.is_empty() {
            msg["content"] = json!(texts.join("\n"));
        }
        msgs.push(msg);
    } else if !texts.is_empty() {
        msgs.push(json!({"role": role_str(role), "content": texts.join("\n")}));
    }
}

#[async_trait]
impl Provider for OpenAiCompatible {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": request.model,
            "messages": self.build_messages(request),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(self.build_tools(&request.tools));
            body["tool_choice"] = match request.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Required => json!("required"),
                ToolChoice::None => json!("none"),
            };
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("context_length_exceeded") || body.contains("maximum context") {
                return Err(ProviderError::ContextOverflow(body));
            }
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Deserialization(e.to_string()))?;

        parse_completion(&payload)
    }
}

fn parse_completion(payload: &Value) -> Result<ChatResponse, ProviderError> {
    let message = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| ProviderError::Deserialization("missing choices[0].message".into()))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let function = call
                .get("function")
                .ok_or_else(|| ProviderError::Deserialization("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::Deserialization("tool call without name".into()))?
                .to_string();
            let raw_args = function
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args)
                .unwrap_or(Value::Object(serde_json::Map::new()));
            tool_calls.push(ToolCall { id, name, arguments });
        }
    }

    let usage = payload.get("usage").map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    });

    Ok(ChatResponse {
        reply: AssistantReply { text, tool_calls },
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_completion() {
        let payload = json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2},
        });
        let response = parse_completion(&payload).unwrap();
        assert_eq!(response.reply.text.as_deref(), Some("hello"));
        assert!(response.reply.tool_calls.is_empty());
        assert_eq!(response.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn parse_tool_call_completion() {
        let payload = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "read_file", "arguments": "{\"path\": \"src/main.rs\"}"},
                }],
            }}],
        });
        let response = parse_completion(&payload).unwrap();
        let call = &response.reply.tool_calls[0];
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments["path"], "src/main.rs");
    }

    #[test]
    fn parse_rejects_missing_message() {
        let payload = json!({"choices": []});
        assert!(parse_completion(&payload).is_err());
    }

    #[test]
    fn message_building_converts_tool_results() {
        let adapter = OpenAiCompatible::new("http://localhost", None);
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "ok".into(),
                }]),
            }],
            tools: vec![],
            tool_choice: ToolChoice::Auto,
            max_tokens: None,
            temperature: None,
            system: Some("sys".into()),
        };
        let msgs = adapter.build_messages(&request);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["tool_call_id"], "call_1");
    }
}
