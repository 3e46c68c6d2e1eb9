//! LLM gateway for drover.
//!
//! Providers adapt concrete transports to one `chat` shape; the [`Gateway`]
//! sits above them and enforces the tool-list invariants the engine depends
//! on, plus text-to-tool-call recovery for models that answer in prose.

pub mod error;
pub mod openai;
pub mod recovery;
pub mod scripted;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::ProviderError;
pub use types::{
    AssistantReply, ChatRequest, ChatResponse, ContentPart, Message, MessageContent, Role,
    ToolCall, ToolChoice, ToolDefinition, Usage,
};

#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// One gateway call. `curated_tools` distinguishes "caller passed nothing"
/// (`None`) from "caller passed an explicitly empty list" (`Some(vec![])`);
/// the two normalize differently.
#[derive(Clone)]
pub struct CallSpec {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// The caller's curated tool list, forwarded verbatim when non-empty.
    pub curated_tools: Option<Vec<ToolDefinition>>,
    /// A schema selector's retrieval result, if one ran for this call.
    pub selected_tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: ToolChoice,
    /// Text-only mode: when false no tools are attached no matter what else
    /// was supplied. Planner calls rely on this.
    pub supports_tools: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CallSpec {
    pub fn text_only(model: &str, system: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.to_string(),
            system,
            messages,
            curated_tools: None,
            selected_tools: None,
            tool_choice: ToolChoice::None,
            supports_tools: false,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// True when the tool call was extracted from prose rather than the
    /// structured channel.
    pub recovered: bool,
    pub usage: Option<Usage>,
}

impl GatewayReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

pub struct Gateway {
    provider: Arc<dyn Provider>,
    /// Registry-backed default offered when a caller passes no tools at all.
    default_tools: Vec<ToolDefinition>,
}

impl Gateway {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            default_tools: Vec::new(),
        }
    }

    pub fn with_default_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.default_tools = tools;
        self
    }

    /// Decide which tools the provider actually receives.
    ///
    /// Invariants, in order:
    /// 1. `supports_tools == false` means no tools, unconditionally.
    /// 2. A non-empty selector result is used as-is.
    /// 3. An empty selector result NEVER erases a non-empty curated list;
    ///    the curated list is forwarded verbatim instead.
    /// 4. `Some(vec![])` from the caller normalizes to no tools.
    /// 5. `None` from the caller falls back to the registry default.
    fn resolve_tools(&self, spec: &CallSpec) -> Vec<ToolDefinition> {
        if !spec.supports_tools {
            return Vec::new();
        }
        if let Some(selected) = &spec.selected_tools {
            if !selected.is_empty() {
                return selected.clone();
            }
            if let Some(curated) = &spec.curated_tools {
                if !curated.is_empty() {
                    tracing::warn!(
                        curated = curated.len(),
                        "schema selector returned no tools; falling back to curated list"
                    );
                    return curated.clone();
                }
            }
            return Vec::new();
        }
        match &spec.curated_tools {
            Some(curated) => curated.clone(),
            None => self.default_tools.clone(),
        }
    }

    pub async fn chat(&self, spec: &CallSpec) -> Result<GatewayReply, ProviderError> {
        let tools = self.resolve_tools(spec);
        let allowed_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();

        let request = ChatRequest {
            model: spec.model.clone(),
            messages: spec.messages.clone(),
            tools,
            tool_choice: spec.tool_choice,
            max_tokens: spec.max_tokens,
            temperature: spec.temperature,
            system: spec.system.clone(),
        };

        let response = self.provider.chat(&request).await?;
        let AssistantReply { text, tool_calls } = response.reply;

        if !tool_calls.is_empty() {
            return Ok(GatewayReply {
                text,
                tool_calls,
                recovered: false,
                usage: response.usage,
            });
        }

        // Prose instead of a structured call: try bounded recovery over the
        // tool set this call actually offered.
        if let Some(raw) = &text {
            if !allowed_names.is_empty() {
                if let Some(call) = recovery::recover(raw, &allowed_names) {
                    tracing::debug!(tool = %call.name, "recovered tool call from prose");
                    return Ok(GatewayReply {
                        text,
                        tool_calls: vec![call],
                        recovered: true,
                        usage: response.usage,
                    });
                }
            }
        }

        Ok(GatewayReply {
            text,
            tool_calls: vec![],
            recovered: false,
            usage: response.usage,
        })
    }
}
