//! LM provider adapters
//!
//! The router and the driver both speak to backends through the
//! [`ModelProvider`] trait: any text-completion backend that can turn a
//! message list into text (and optionally report token usage) plugs in here.

mod openai;

pub use openai::{OpenAiCompatProvider, OpenAiConfig, OpenAiError};

use crate::types::Message;
use async_trait::async_trait;

/// Token usage reported by an adapter for one call. Absent fields are
/// treated as zero by the usage tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// A text-completion backend with a stable model name.
///
/// Failures raised here bubble out of the direct completion path, and are
/// surfaced as HTTP 500 when the call arrived over the router.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable identifier used as the model name in usage summaries and
    /// routing decisions.
    fn model_name(&self) -> &str;

    /// Produce a completion for the given message history.
    async fn generate(&self, messages: &[Message]) -> anyhow::Result<Generation>;
}
