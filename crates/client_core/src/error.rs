use shared::{domain::IdentityError, error::ApiError};
use thiserror::Error;

use crate::transport::ApiResponse;

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server failure: HTTP {}: {}", .error.status, .error.message)]
    Server {
        error: ApiError,
        response: ApiResponse,
    },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl CallError {
    /// The response that came back, if the call got that far.
    pub fn response(&self) -> Option<&ApiResponse> {
        match self {
            Self::Server { response, .. } => Some(response),
            Self::Transport(_) | Self::Decode(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("session already started; use retry to refetch offers")]
    AlreadyStarted,
    #[error("session has not been started")]
    NotStarted,
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("failed to fetch offers: {0}")]
    FetchFailed(CallError),
    #[error("offer fetch superseded by a newer request")]
    Superseded,
    #[error("failed to wrap session: {0}")]
    WrapFailed(CallError),
    #[error("failed to get session details: {0}")]
    SessionDetailsFailed(CallError),
}
