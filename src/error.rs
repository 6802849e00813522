use thiserror::Error;

/// Failures surfaced by the chat session and classification APIs.
///
/// Storage and provider internals work with `anyhow`; everything that leaves
/// the session manager is collapsed into one of these.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed import file or malformed persisted session.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// Non-2xx response, unreachable endpoint or malformed response body.
    #[error("API error: {0}")]
    Api(String),
    /// A reply is already pending.
    #[error("a reply is already pending")]
    Busy,
    #[error("no chat log loaded; import one first")]
    NoSession,
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Storage(err)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::InvalidFormat(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
