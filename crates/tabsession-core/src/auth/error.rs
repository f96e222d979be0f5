use thiserror::Error;

use crate::api::ApiError;
use crate::storage::StorageError;

/// Errors a collaborator can see from the session core.
///
/// Refresh rejection and ownership conflicts never appear here as such: the
/// core handles them itself and reports them only as `SessionEnded`, together
/// with a `SessionEnded` signal on the logout channel.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Unable to reach the server: {0}")]
    NetworkFailure(String),

    #[error("Session ended - please log in again")]
    SessionEnded,

    #[error(transparent)]
    Api(ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ApiError> for SessionError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(msg) => SessionError::NetworkFailure(msg),
            other => SessionError::Api(other),
        }
    }
}

impl SessionError {
    /// Map a login failure: rejection by the server is the user's to correct.
    pub fn from_login(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized | ApiError::BadRequest(_) => SessionError::InvalidCredentials,
            other => other.into(),
        }
    }
}
