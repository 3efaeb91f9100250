//! Sandbox session abstraction
//!
//! Every backend hosts a stateful code REPL for the life of one completion
//! (or longer, for persistent sessions) behind the same four-call contract:
//! `setup / load_context / execute_code / cleanup`. Backends that can span
//! multiple completions additionally implement [`PersistentSession`].

pub mod container;
pub mod local;
mod runner;

pub use container::ContainerSandbox;
pub use local::LocalSandbox;

use crate::error::EngineError;
use crate::router::RouterAddress;
use crate::types::{ContextPayload, Message, ReplResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Backend name for the local child-interpreter sandbox.
pub const LOCAL_BACKEND: &str = "local";

/// Backend name for the container sandbox.
pub const CONTAINER_BACKEND: &str = "container";

// ============================================================================
// Errors
// ============================================================================

/// Infrastructure failures raised by sandbox backends.
///
/// User-code failures never appear here: they are captured into the
/// execution result's stderr so the LM sees them on its next turn.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to spawn interpreter: {0}")]
    SpawnFailed(String),

    #[error("Docker not available: {0}")]
    DockerNotAvailable(String),

    #[error("Failed to create container: {0}")]
    ContainerCreationFailed(String),

    #[error("Failed to start container: {0}")]
    ContainerStartFailed(String),

    #[error("Failed to execute command in container: {0}")]
    ExecFailed(String),

    #[error("Hook proxy error: {0}")]
    ProxyError(String),

    #[error("Failed to load payload into the REPL: {0}")]
    PayloadLoadFailed(String),

    #[error("Sandbox session is closed")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

// ============================================================================
// Session contract
// ============================================================================

/// Uniform session contract implemented by every backend.
#[async_trait]
pub trait SandboxSession: Send {
    /// One-time initialization of backing resources.
    async fn setup(&mut self) -> SandboxResult<()>;

    /// Make the payload visible in the REPL under the identifier `context`.
    async fn load_context(&mut self, payload: &ContextPayload) -> SandboxResult<()>;

    /// Run code against the session's current state, persist any
    /// mutations, and return the result.
    async fn execute_code(&mut self, code: &str) -> SandboxResult<ReplResult>;

    /// Release all backing resources. Idempotent and safe after partial
    /// setup.
    async fn cleanup(&mut self) -> SandboxResult<()>;

    /// The persistence extension, for backends that support reuse across
    /// completions.
    fn as_persistent(&mut self) -> Option<&mut dyn PersistentSession> {
        None
    }
}

/// Optional extension allowing one session to span multiple completions
/// with an evolving stack of named contexts and histories.
#[async_trait]
pub trait PersistentSession: SandboxSession {
    /// Rebind the loopback router endpoint for subsequent executions.
    fn update_handler_address(&mut self, address: &RouterAddress);

    /// Append a new context as `context_N` (aliasing the N=0 slot as
    /// `context`); returns the assigned index.
    async fn add_context(
        &mut self,
        payload: &ContextPayload,
        index: Option<usize>,
    ) -> SandboxResult<usize>;

    /// Snapshot a completed message history as `history_N`; returns the
    /// assigned index.
    async fn add_history(
        &mut self,
        messages: &[Message],
        index: Option<usize>,
    ) -> SandboxResult<usize>;

    fn context_count(&self) -> usize;

    fn history_count(&self) -> usize;
}

// ============================================================================
// Factory
// ============================================================================

/// True when the named backend implements the persistence extension.
pub fn supports_persistence(backend: &str) -> bool {
    backend == LOCAL_BACKEND
}

/// Instantiate a session for the named backend, told where to reach the
/// router and which recursion depth its sub-LM calls carry.
pub fn create_session(
    backend: &str,
    config: &Map<String, Value>,
    router: &RouterAddress,
    depth: u32,
) -> crate::error::Result<Box<dyn SandboxSession>> {
    match backend {
        LOCAL_BACKEND => Ok(Box::new(LocalSandbox::new(config, router, depth)?)),
        CONTAINER_BACKEND => Ok(Box::new(ContainerSandbox::new(config, router, depth))),
        other => Err(EngineError::UnknownBackend(other.to_string())),
    }
}
