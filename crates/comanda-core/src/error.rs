use thiserror::Error;

/// Top-level error type for Comanda.
#[derive(Debug, Error)]
pub enum ComandaError {
    /// Error from the messaging transport (connect, send, pairing).
    #[error("transport error: {0}")]
    Transport(String),

    /// Error from the upstream agent service.
    #[error("agent error: {0}")]
    Agent(String),

    /// Conversation history store error.
    #[error("history error: {0}")]
    History(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a single bounded delivery attempt against the session.
///
/// Every send resolves into exactly one of these — nothing panics or hangs
/// across the session boundary.
#[derive(Debug, Error)]
pub enum SendError {
    /// No live authenticated session; the attempt failed fast.
    #[error("not connected to the messaging network")]
    NotConnected,

    /// The send exceeded the wall-clock ceiling and was abandoned.
    #[error("delivery timed out after {0}s")]
    Timeout(u64),

    /// The transport reported a failure before the ceiling.
    #[error("delivery failed: {0}")]
    Transport(String),
}
