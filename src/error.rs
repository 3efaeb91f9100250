//! Engine error types

use thiserror::Error;

/// Errors surfaced by the iteration driver and the LM router.
///
/// Sandbox execution failures never appear here: they are reified into the
/// execution result so the LM can see them on its next turn.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown sandbox backend name. Fatal at construction.
    #[error("Unknown sandbox backend: {0}. Supported backends: local, container")]
    UnknownBackend(String),

    /// Persistence requested with a backend lacking the extension. Fatal at
    /// construction.
    #[error("Persistent sessions require a backend with the persistence extension (supported: local), got: {0}")]
    PersistenceUnsupported(String),

    /// LM adapter failure on the direct completion path.
    #[error("Model provider error: {0}")]
    Provider(String),

    /// Sandbox infrastructure failure (spawn, container, scratch dir).
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    /// Router lifecycle failure (bind, shutdown).
    #[error("Router error: {0}")]
    Router(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
