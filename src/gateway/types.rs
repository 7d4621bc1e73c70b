//! Core types for the model gateway.

use serde::{Deserialize, Serialize};

// =============================================================================
// REQUEST
// =============================================================================

/// Request for one structured generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// System prompt.
    pub system_instructions: String,
    /// Rendered user prompt.
    pub user_prompt: String,
    /// Provider model id, e.g. "anthropic/claude-sonnet-4.5".
    pub model: String,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Whether to request JSON output.
    pub json_mode: bool,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Which code path made this call, for debugging.
    pub caller: &'static str,
}

impl GenerateRequest {
    pub fn new(
        model: impl Into<String>,
        system_instructions: impl Into<String>,
        user_prompt: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            system_instructions: system_instructions.into(),
            user_prompt: user_prompt.into(),
            model: model.into(),
            temperature: 0.0,
            json_mode: false,
            max_tokens: None,
            caller,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub(crate) fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_instructions.trim().is_empty() {
            messages.push(Message::system(&self.system_instructions));
        }
        messages.push(Message::user(&self.user_prompt));
        messages
    }
}

// =============================================================================
// CHAT MESSAGES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Unknown(s) => s,
        }
    }
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }
}

/// Response from a generation.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Generated content.
    pub content: String,
    pub usage: TokenUsage,
    /// Wall time of the provider call.
    pub execution_time_ms: u64,
    /// Model that actually served the request (providers may route).
    pub model: String,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_is_sum() {
        let u = TokenUsage::new(120, 30);
        assert_eq!(u.total, 150);
    }

    #[test]
    fn finish_reason_round_trips_known_values() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(FinishReason::from(None).as_str(), "none");
        assert_eq!(FinishReason::from(Some("eos".into())).as_str(), "eos");
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let req = GenerateRequest::new("m", "  ", "hello", "test");
        let messages = req.to_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn builder_sets_json_mode() {
        let req = GenerateRequest::new("m", "sys", "user", "test")
            .temperature(0.4)
            .max_tokens(512)
            .json();
        assert!(req.json_mode);
        assert_eq!(req.max_tokens, Some(512));
        assert!((req.temperature - 0.4).abs() < f32::EPSILON);
        assert_eq!(req.to_messages().len(), 2);
    }
}
