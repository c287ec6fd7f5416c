use std::io;
use thiserror::Error;

/// Errors delivered to callers through their registered callbacks.
///
/// Nothing in the session returns these to the caller directly: precondition
/// and encoding failures are reported synchronously through the callback,
/// transport failures asynchronously, and teardown failures are only logged.
#[derive(Debug, Error)]
pub enum CbtError {
    #[error("device not connected")]
    NotConnected,

    #[error("cannot encode payload as {charset}: {reason}")]
    Encoding { charset: String, reason: String },

    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    #[error("failed to release connection: {0}")]
    Teardown(#[source] io::Error),

    #[error("bluetooth session has been shut down")]
    SessionClosed,
}

impl CbtError {
    pub fn encoding(charset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encoding {
            charset: charset.into(),
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for CbtError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

pub type CbtResult<T> = Result<T, CbtError>;
