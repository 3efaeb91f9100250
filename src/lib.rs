//! Recursive Language Model execution engine
//!
//! Transforms a single "answer this query over this context" request into
//! a bounded iterative dialogue between a language model and a sandboxed
//! code REPL, in which the model may chunk the context programmatically
//! and issue recursive sub-LM calls from inside executed code.

// Public modules
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod observers;
pub mod parsing;
pub mod prompts;
pub mod providers;
pub mod router;
pub mod sandbox;
pub mod types;

// Re-export commonly used types
pub use config::DriverConfig;
pub use driver::RlmDriver;
pub use error::{EngineError, Result};
pub use observers::{IterationObserver, JsonlLogObserver, VerboseObserver};
pub use providers::{Generation, ModelProvider, TokenUsage};
pub use router::{LlmRouter, RouterAddress, UsageTracker};
pub use sandbox::{PersistentSession, SandboxSession};
pub use types::{Completion, ContextPayload, Iteration, Message, ReplResult, Role, UsageSummary};
