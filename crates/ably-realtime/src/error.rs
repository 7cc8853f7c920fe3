use tokio_tungstenite::tungstenite;

use crate::protocol::{ErrorInfo, error_code};
use crate::types::BoxError;

/// Errors returned by this crate.
///
/// Every variant maps onto a structured [`ErrorInfo`] through
/// [`Error::info`], so callers can branch on stable codes rather than text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(ErrorInfo),

    #[error("invalid request: {0}")]
    InvalidRequest(ErrorInfo),

    #[error("insecure request: {0}")]
    InsecureRequest(ErrorInfo),

    #[error("token request failed: {0}")]
    TokenRequestFailed(ErrorInfo),

    #[error("invalid response body: {0}")]
    InvalidResponseBody(ErrorInfo),

    #[error("connection error: {0}")]
    Connection(ErrorInfo),

    #[error("channel error: {0}")]
    Channel(ErrorInfo),

    #[error("presence error: {0}")]
    Presence(ErrorInfo),

    #[error("message delivery failed: {0}")]
    Delivery(ErrorInfo),

    #[error("Ably protocol error: {0}")]
    Protocol(ErrorInfo),

    #[error("operation timed out: {0}")]
    Timeout(ErrorInfo),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Token fetch failed: {0}")]
    TokenFetch(BoxError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Structured view of the error: code, HTTP-like status and message.
    pub fn info(&self) -> ErrorInfo {
        match self {
            Error::Configuration(info)
            | Error::InvalidRequest(info)
            | Error::InsecureRequest(info)
            | Error::TokenRequestFailed(info)
            | Error::InvalidResponseBody(info)
            | Error::Connection(info)
            | Error::Channel(info)
            | Error::Presence(info)
            | Error::Delivery(info)
            | Error::Protocol(info)
            | Error::Timeout(info) => info.clone(),
            Error::WebSocket(e) => {
                ErrorInfo::new(error_code::DISCONNECTED, None, e.to_string())
            }
            Error::Http(e) => ErrorInfo::new(
                error_code::INTERNAL,
                e.status().map(|s| i32::from(s.as_u16())),
                e.to_string(),
            ),
            Error::MsgpackEncode(e) => ErrorInfo::new(error_code::INTERNAL, Some(500), e.to_string()),
            Error::Json(e) => ErrorInfo::new(error_code::BAD_REQUEST, Some(400), e.to_string()),
            Error::Url(e) => ErrorInfo::new(error_code::INVALID_PARAMETER, Some(400), e.to_string()),
            Error::TokenFetch(e) => ErrorInfo::new(
                error_code::AUTH_CALLBACK_FAILED,
                Some(401),
                format!("auth callback failed: {e}"),
            ),
        }
    }

    pub fn code(&self) -> i32 {
        self.info().code
    }

    pub fn status_code(&self) -> Option<i32> {
        self.info().status_code
    }

    pub(crate) fn invalid_request(code: i32, message: impl Into<String>) -> Self {
        Error::InvalidRequest(ErrorInfo::new(code, Some(400), message))
    }

    pub(crate) fn configuration(code: i32, message: impl Into<String>) -> Self {
        Error::Configuration(ErrorInfo::new(code, Some(400), message))
    }

    /// A copy for fanning one failure out to several waiters. Wrapped
    /// lower-level errors keep their [`ErrorInfo`] but not their source.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Configuration(info) => Error::Configuration(info.clone()),
            Error::InvalidRequest(info) => Error::InvalidRequest(info.clone()),
            Error::InsecureRequest(info) => Error::InsecureRequest(info.clone()),
            Error::TokenRequestFailed(info) => Error::TokenRequestFailed(info.clone()),
            Error::InvalidResponseBody(info) => Error::InvalidResponseBody(info.clone()),
            Error::Connection(info) => Error::Connection(info.clone()),
            Error::Channel(info) => Error::Channel(info.clone()),
            Error::Presence(info) => Error::Presence(info.clone()),
            Error::Delivery(info) => Error::Delivery(info.clone()),
            Error::Protocol(info) => Error::Protocol(info.clone()),
            Error::Timeout(info) => Error::Timeout(info.clone()),
            Error::TokenFetch(_) | Error::Http(_) => Error::TokenRequestFailed(self.info()),
            Error::WebSocket(_) | Error::MsgpackEncode(_) | Error::Json(_) | Error::Url(_) => {
                Error::Connection(self.info())
            }
        }
    }
}
