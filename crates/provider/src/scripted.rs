//! Scripted provider for deterministic tests.
//!
//! Returns queued replies in order, recording every request it sees. Used by
//! core's agent and orchestrator tests so no network or model is required.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{AssistantReply, ChatRequest, ChatResponse, ToolCall};
use crate::Provider;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub tool_names: Vec<String>,
    pub message_count: usize,
    pub system: Option<String>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<Vec<ScriptedReply>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

enum ScriptedReply {
    Reply(AssistantReply),
    Error(ProviderError),
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text reply.
    pub fn push_text(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .expect("scripted replies lock")
            .push(ScriptedReply::Reply(AssistantReply {
                text: Some(text.into()),
                tool_calls: vec![],
            }));
    }

    /// Queue a structured tool-call reply.
    pub fn push_tool_call(&self, name: &str, arguments: serde_json::Value) {
        self.replies
            .lock()
            .expect("scripted replies lock")
            .push(ScriptedReply::Reply(AssistantReply {
                text: None,
                tool_calls: vec![ToolCall {
                    id: format!("call_{name}"),
                    name: name.to_string(),
                    arguments,
                }],
            }));
    }

    /// Queue a provider error (e.g. to exercise retry paths).
    pub fn push_error(&self, error: ProviderError) {
        self.replies
            .lock()
            .expect("scripted replies lock")
            .push(ScriptedReply::Error(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("scripted requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("scripted replies lock").len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests
            .lock()
            .expect("scripted requests lock")
            .push(RecordedRequest {
                model: request.model.clone(),
                tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
                message_count: request.messages.len(),
                system: request.system.clone(),
            });

        let next = {
            let mut replies = self.replies.lock().expect("scripted replies lock");
            if replies.is_empty() {
                None
            } else {
                Some(replies.remove(0))
            }
        };

        match next {
            Some(ScriptedReply::Reply(reply)) => Ok(ChatResponse { reply, usage: None }),
            Some(ScriptedReply::Error(e)) => Err(e),
            None => Ok(ChatResponse {
                reply: AssistantReply {
                    text: Some(String::new()),
                    tool_calls: vec![],
                },
                usage: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ToolChoice};
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            tool_choice: ToolChoice::Auto,
            max_tokens: None,
            temperature: None,
            system: None,
        }
    }

    #[tokio::test]
    async fn replies_are_consumed_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_text("first");
        provider.push_tool_call("read_file", json!({"path": "a"}));

        let r1 = provider.chat(&request()).await.unwrap();
        assert_eq!(r1.reply.text.as_deref(), Some("first"));

        let r2 = provider.chat(&request()).await.unwrap();
        assert_eq!(r2.reply.tool_calls[0].name, "read_file");
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn errors_are_surfaced() {
        let provider = ScriptedProvider::new();
        provider.push_error(ProviderError::Http {
            status: 500,
            body: "boom".into(),
        });
        let err = provider.chat(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let provider = ScriptedProvider::new();
        provider.push_text("ok");
        provider.chat(&request()).await.unwrap();
        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message_count, 1);
    }
}
