use thiserror::Error;

/// Failure talking to the shared presence/history/fan-out backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors scoped to a single session request. The display text is what the
/// client sees in its `error` event.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("user with this name already logged in")]
    NameTaken(String),
    #[error("invalid username `{0}`")]
    InvalidName(String),
    #[error("login required")]
    NotLoggedIn,
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("no direct conversation possible with `{0}`")]
    InvalidRecipient(String),
    #[error("temporary server error, try again")]
    Store(#[from] StoreError),
}

impl RelayError {
    /// True for failures caused by the backend rather than the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Store(_))
    }
}
