use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the miner.
///
/// The split matters operationally: `Request` kinds are retried with
/// backoff, `RequestInvalid` and `Gql` surface to the caller,
/// `WebsocketClosed` is local to one connection, and `Login`/
/// `CaptchaRequired` pause mining until the user intervenes.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal invariant violation. Fatal.
    #[error("Miner error: {0}")]
    Miner(String),

    /// Transient network or server-side failure; retried with backoff.
    #[error("Request error: {0}")]
    Request(String),

    /// HTTP 4xx (except 429); not retryable.
    #[error("Invalid request: HTTP {status}")]
    RequestInvalid { status: u16 },

    /// Platform-level GraphQL error payload.
    #[error("GQL error: {0}")]
    Gql(String),

    /// A websocket connection closed; `received` marks a server-side close.
    #[error("Websocket closed (received: {received})")]
    WebsocketClosed { received: bool },

    /// Login flow failure requiring user intervention.
    #[error("Login error: {0}")]
    Login(String),

    /// The platform answered the login flow with a challenge.
    #[error("Captcha required")]
    CaptchaRequired,

    /// Non-blocking limiter acquisition found an empty bucket.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Control command referenced an unknown channel.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Control command referenced an offline channel.
    #[error("Channel is offline: {0}")]
    ChannelOffline(String),

    /// Shutdown requested; propagates through cancellation.
    #[error("Exit requested")]
    ExitRequest,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the HTTP/GQL retry loops may try again after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let code = status.as_u16();
            // 429 and 5xx are retryable, other 4xx are not
            if status.is_client_error() && code != 429 {
                return Error::RequestInvalid { status: code };
            }
        }
        Error::Request(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Error::WebsocketClosed { received: true }
            }
            other => Error::Request(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Request("connection reset".into()).is_transient());
        assert!(!Error::RequestInvalid { status: 404 }.is_transient());
        assert!(!Error::Gql("service unavailable".into()).is_transient());
        assert!(!Error::ExitRequest.is_transient());
    }

    #[test]
    fn test_display_formats() {
        let err = Error::ChannelOffline("somechannel".into());
        assert_eq!(err.to_string(), "Channel is offline: somechannel");
        let err = Error::RequestInvalid { status: 403 };
        assert_eq!(err.to_string(), "Invalid request: HTTP 403");
    }
}
