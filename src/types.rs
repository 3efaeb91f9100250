//! Core data model
//!
//! Canonical record types exchanged between the iteration driver, the
//! sandbox backends, the LM router, and the observers. Every type
//! serializes to the snake_case dict form consumed by the log observer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Messages
// ============================================================================

/// Chat role for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single chat turn as sent to an LM adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Context payload
// ============================================================================

/// The caller-supplied context a completion runs over.
///
/// Three shapes are accepted: plain text, an ordered sequence of arbitrary
/// values, or a keyed collection of arbitrary values. The engine never
/// interprets the payload beyond deriving [`QueryMetadata`] from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextPayload {
    Text(String),
    Sequence(Vec<Value>),
    Mapping(Map<String, Value>),
}

impl ContextPayload {
    /// Tag naming the payload shape, inserted verbatim into prompts.
    pub fn shape(&self) -> &'static str {
        match self {
            ContextPayload::Text(_) => "text",
            ContextPayload::Sequence(_) => "sequence",
            ContextPayload::Mapping(_) => "mapping",
        }
    }

    /// Character length of one chunk's textual form.
    fn chunk_len(value: &Value) -> usize {
        match value {
            Value::String(text) => text.chars().count(),
            other => other.to_string().chars().count(),
        }
    }

    /// Per-chunk character lengths: sequence elements, mapping values, or a
    /// single entry for text payloads.
    pub fn chunk_chars(&self) -> Vec<usize> {
        match self {
            ContextPayload::Text(text) => vec![text.chars().count()],
            ContextPayload::Sequence(items) => items.iter().map(Self::chunk_len).collect(),
            ContextPayload::Mapping(map) => map.values().map(Self::chunk_len).collect(),
        }
    }

    /// Derive the read-only query metadata for this payload.
    pub fn metadata(&self) -> QueryMetadata {
        let chunk_chars = self.chunk_chars();
        QueryMetadata {
            shape: self.shape().to_string(),
            total_chars: chunk_chars.iter().sum(),
            chunk_chars,
        }
    }

    /// Textual form used by the depth-exhausted fallback path: text payloads
    /// pass through, structured payloads are JSON-stringified.
    pub fn to_prompt_text(&self) -> String {
        match self {
            ContextPayload::Text(text) => text.clone(),
            ContextPayload::Sequence(items) => {
                serde_json::to_string(items).unwrap_or_else(|_| format!("{items:?}"))
            }
            ContextPayload::Mapping(map) => {
                serde_json::to_string(map).unwrap_or_else(|_| format!("{map:?}"))
            }
        }
    }
}

impl From<String> for ContextPayload {
    fn from(text: String) -> Self {
        ContextPayload::Text(text)
    }
}

impl From<&str> for ContextPayload {
    fn from(text: &str) -> Self {
        ContextPayload::Text(text.to_string())
    }
}

impl From<Vec<Value>> for ContextPayload {
    fn from(items: Vec<Value>) -> Self {
        ContextPayload::Sequence(items)
    }
}

impl From<Map<String, Value>> for ContextPayload {
    fn from(map: Map<String, Value>) -> Self {
        ContextPayload::Mapping(map)
    }
}

/// Read-only metadata derived from a context payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub shape: String,
    pub total_chars: usize,
    pub chunk_chars: Vec<usize>,
}

// ============================================================================
// Usage accounting
// ============================================================================

/// Per-model call and token counters. Monotonic per router instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Mapping from model name to its accumulated usage.
pub type UsageSummary = BTreeMap<String, ModelUsage>;

/// Build a one-entry summary for a single tracked call.
pub fn single_call_summary(model: &str, input_tokens: u64, output_tokens: u64) -> UsageSummary {
    let mut summary = UsageSummary::new();
    summary.insert(
        model.to_string(),
        ModelUsage {
            calls: 1,
            input_tokens,
            output_tokens,
        },
    );
    summary
}

// ============================================================================
// Execution records
// ============================================================================

/// One sub-LM call issued from inside a code execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlmCall {
    pub model: String,
    pub prompt: Value,
    pub response: String,
    pub usage: UsageSummary,
    pub execution_time: f64,
}

/// Result of one code execution inside a sandbox session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    /// Post-execution snapshot of non-reserved top-level identifiers.
    pub locals: Map<String, Value>,
    pub execution_time: f64,
    pub rlm_calls: Vec<RlmCall>,
}

impl ReplResult {
    /// Reify a spawn / timeout / infrastructure failure as an execution
    /// result the LM can see on its next turn.
    pub fn failure(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// A fenced code block paired with its execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub result: ReplResult,
}

/// One turn of the iteration loop: the history the LM saw, its raw
/// response, the code blocks executed from it, and the optional final
/// answer that terminated the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub history: Vec<Message>,
    pub response: String,
    pub code_blocks: Vec<CodeBlock>,
    pub final_answer: Option<String>,
    pub iteration_time: f64,
}

// ============================================================================
// Completion-level records
// ============================================================================

/// Emitted once per completion, before any iteration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub root_model: String,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub backend: String,
    /// Sanitized sandbox configuration bag (sensitive keys stripped).
    pub environment: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_models: Option<Vec<String>>,
}

/// Return value of one end-to-end completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub root_model: String,
    pub prompt: Option<String>,
    pub response: String,
    pub usage_summary: UsageSummary,
    pub execution_time: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_metadata() {
        let payload = ContextPayload::from("hello");
        let meta = payload.metadata();
        assert_eq!(meta.shape, "text");
        assert_eq!(meta.total_chars, 5);
        assert_eq!(meta.chunk_chars, vec![5]);
    }

    #[test]
    fn sequence_payload_metadata() {
        let payload = ContextPayload::Sequence(vec![json!("abc"), json!({"k": 1})]);
        let meta = payload.metadata();
        assert_eq!(meta.shape, "sequence");
        assert_eq!(meta.chunk_chars.len(), 2);
        assert_eq!(meta.chunk_chars[0], 3);
        assert_eq!(meta.total_chars, meta.chunk_chars.iter().sum::<usize>());
    }

    #[test]
    fn mapping_payload_metadata() {
        let mut map = Map::new();
        map.insert("a".to_string(), json!("xy"));
        map.insert("b".to_string(), json!([1, 2, 3]));
        let payload = ContextPayload::from(map);
        let meta = payload.metadata();
        assert_eq!(meta.shape, "mapping");
        assert_eq!(meta.chunk_chars[0], 2);
    }

    #[test]
    fn multibyte_text_counts_chars_not_bytes() {
        let payload = ContextPayload::from("héllo");
        assert_eq!(payload.metadata().total_chars, 5);
    }

    #[test]
    fn single_call_summary_has_one_entry() {
        let summary = single_call_summary("m", 10, 20);
        assert_eq!(summary.len(), 1);
        let usage = &summary["m"];
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn message_roles_serialize_lowercase() {
        let message = Message::assistant("hi");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
    }
}
