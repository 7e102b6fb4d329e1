use thiserror::Error;

pub type SigbakResult<T> = Result<T, SigbakError>;

#[derive(Debug, Error)]
pub enum SigbakError {
    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(String),

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("decryption failure: {0}")]
    DecryptionFailure(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SigbakError {
    /// Errors confined to a single frame, attachment or row.
    ///
    /// Stream callers may record these and keep going; everything else
    /// leaves the session in a state that cannot be continued.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            SigbakError::AuthenticationFailure(_)
                | SigbakError::ParseFailure(_)
                | SigbakError::ConsistencyViolation(_)
        )
    }
}
