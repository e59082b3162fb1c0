use thiserror::Error;

/// Errors surfaced by the core. Transient errors are retried at the call
/// site and never reach here as a terminal value; everything that does
/// reach here is either logged and the chain continues, or causes the
/// process to exit (handled by the caller via `.expect()`/panic rather
/// than a variant of this enum).
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("AWS API error: {0}")]
    Aws(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timestamp out of range: {0}")]
    ChronoOutOfRange(#[from] chrono::OutOfRangeError),

    #[error("bad timestamp: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Caller-visible configuration/input error.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// Drop silently: do not retry, do not log as a failure (e.g. a cancel
    /// for an event never added to the store).
    #[error("terminal: {0}")]
    Terminal(String),

    /// Node not found during a mutation. Callers decide whether this is a
    /// successful no-op (node already gone) or should propagate.
    #[error("node not found: {0}")]
    NodeNotFound(String),
}

impl Error {
    pub fn aws(err: impl std::fmt::Display) -> Self {
        Error::Aws(err.to_string())
    }

    /// True for the narrow set of errors that should never be retried or
    /// surfaced as a failure -- just dropped.
    pub fn is_terminal_for_event(&self) -> bool {
        matches!(self, Error::Terminal(_))
    }
}
