use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, CoreErr>;

#[derive(Error, Debug)]
pub enum CoreErr {
    /// Configuration document was rejected at load time. The previous
    /// snapshot (if any) stays in effect.
    #[error("config error: {0}")]
    Config(String),

    /// An adapter failed while producing observations. Converted to an
    /// ALERT at the ingress boundary; never crashes the bus.
    #[error("adapter `{name}` error: {message}")]
    Adapter { name: String, message: String },

    /// The agent orchestration did not finish within the budget deadline.
    #[error("agent call exceeded its {0} ms budget")]
    AgentDeadline(u64),

    /// Raised by memory-service implementations. The core swallows these
    /// (fail-open) and only counts them.
    #[error("memory error: {0}")]
    Memory(String),

    /// Shutdown join did not complete within the grace period. Logged by
    /// the caller, never a crash.
    #[error("shutdown join timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
