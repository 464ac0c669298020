use teloxide::{ApiError, RequestError};
use thiserror::Error;

/// Failure of a single outbound platform call, after rate-limit retries have
/// already been absorbed by the dispatcher wrapper.
#[derive(Debug, Error)]
pub enum SendError {
    /// The recipient cannot be reached, typically because they blocked the
    /// bot or never opened a conversation with it.
    #[error("recipient is unreachable")]
    Blocked,

    /// The referenced chat, user or message does not exist (any more).
    #[error("chat, user or message not found")]
    NotFound,

    /// Anything else the platform or the network reported.
    #[error("platform request failed: {0}")]
    Platform(#[source] RequestError),
}

impl SendError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, SendError::Blocked)
    }
}

impl From<RequestError> for SendError {
    fn from(err: RequestError) -> Self {
        match &err {
            RequestError::Api(api) => match api {
                ApiError::BotBlocked
                | ApiError::CantInitiateConversation
                | ApiError::UserDeactivated => SendError::Blocked,
                ApiError::ChatNotFound
                | ApiError::UserNotFound
                | ApiError::MessageToDeleteNotFound
                | ApiError::MessageIdInvalid => SendError::NotFound,
                _ => SendError::Platform(err),
            },
            _ => SendError::Platform(err),
        }
    }
}
