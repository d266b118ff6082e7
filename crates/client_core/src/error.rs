use thiserror::Error;

use crate::engine::{Failure, FailureKind};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("topic must not be empty")]
    InvalidTopic,
    #[error("failed to start analysis: {0}")]
    Initiation(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("analysis failed: {0}")]
    Application(String),
    #[error("connection closed before the analysis completed: {0}")]
    AbnormalClose(String),
    #[error("idle timeout: {0}")]
    IdleTimeout(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid simulation fixture: {0}")]
    Fixture(String),
}

impl From<Failure> for ClientError {
    fn from(failure: Failure) -> Self {
        let Failure { kind, message } = failure;
        match kind {
            FailureKind::Initiation => Self::Initiation(message),
            FailureKind::Transport => Self::Transport(message),
            FailureKind::Application => Self::Application(message),
            FailureKind::AbnormalClose => Self::AbnormalClose(message),
            FailureKind::IdleTimeout => Self::IdleTimeout(message),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
