use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors that abort a whole run before or instead of any delivery.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("generation step failed: {0}")]
    Generation(String),
}

/// Why a single (channel, recipient) delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("interaction failed: {0}")]
    Interaction(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ArtifactMissing,
    Timeout,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ArtifactMissing => f.write_str("artifact missing"),
            SkipReason::Timeout => f.write_str("run budget exceeded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("upload failed: {0}")]
    Transport(String),
}

impl From<UploadError> for FailureReason {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Auth(message) => FailureReason::Auth(message),
            UploadError::Transport(message) => FailureReason::Transport(message),
        }
    }
}

#[derive(Debug, Error)]
#[error("mail submission failed: {0}")]
pub struct MailError(pub String);
