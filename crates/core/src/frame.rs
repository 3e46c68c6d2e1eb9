use drover_provider::{Message, MessageContent, Role};

/// Default ceilings: compaction kicks in past 30 messages, keeping the
/// system message and the most recent 20 verbatim.
pub const DEFAULT_MAX_MESSAGES: usize = 30;
pub const DEFAULT_KEEP_RECENT: usize = 20;

/// Ordered role-tagged messages for one LLM call. Not persisted across
/// tasks as a whole; the orchestrator compacts it when it outgrows the
/// budget.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    messages: Vec<Message>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// chars/4 estimate, used only to trigger compaction and to fill the
    /// session summary's token field. Never authoritative.
    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.content.as_text().len())
            .sum::<usize>()
            / 4
    }

    pub fn needs_compaction(&self, max_messages: usize, token_budget: usize) -> bool {
        self.messages.len() > max_messages || self.estimated_tokens() > token_budget
    }

    /// Replace the middle of the frame with one synthetic session-summary
    /// message. The leading system message (when present) and the most
    /// recent `keep_recent` messages survive verbatim.
    pub fn compact(&mut self, summary: &str, keep_recent: usize) {
        let has_system = self
            .messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false);
        let head = usize::from(has_system);

        if self.messages.len() <= head + keep_recent {
            return;
        }

        let tail_start = self.messages.len() - keep_recent;
        let mut compacted = Vec::with_capacity(head + 1 + keep_recent);
        if has_system {
            compacted.push(self.messages[0].clone());
        }
        compacted.push(Message {
            role: Role::User,
            content: MessageContent::Text(format!("[Session summary]\n{summary}")),
        });
        compacted.extend_from_slice(&self.messages[tail_start..]);
        self.messages = compacted;
    }
}
