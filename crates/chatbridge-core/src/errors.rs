/// Core error type for the bridge.
///
/// Backend and adapter implementations map their failures into this type so
/// the workers can decide consistently between retry, reconnect and report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Connection refused, timeout or I/O failure talking to the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected status, or a body/frame that does not decode.
    #[error("protocol error: {message}")]
    Protocol {
        status: Option<u16>,
        message: String,
    },

    /// Raised by the adapter while processing an inbound payload.
    #[error("application error: {0}")]
    Application(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            status: Some(status),
            message: format!("HTTP {status}: {}", message.into()),
        }
    }

    /// Whether the failure came from the wire and is worth another attempt.
    ///
    /// Serialization failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol { .. } | Error::Io(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Error::protocol(format!("undecodable body: {e}"));
        }
        if let Some(status) = e.status() {
            return Error::status(status.as_u16(), e.to_string());
        }
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_display_includes_status_when_known() {
        assert_eq!(
            Error::status(500, "boom").to_string(),
            "protocol error: HTTP 500: boom"
        );
        assert_eq!(
            Error::protocol("bad frame").to_string(),
            "protocol error: bad frame"
        );
    }

    #[test]
    fn application_errors_are_not_retryable() {
        assert!(Error::Transport("refused".into()).is_retryable());
        assert!(Error::status(502, "bad gateway").is_retryable());
        assert!(!Error::Application("handler failed".into()).is_retryable());
        assert!(!Error::Config("missing".into()).is_retryable());
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::from(json).is_retryable());
    }
}
