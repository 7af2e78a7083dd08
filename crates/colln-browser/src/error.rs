use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("network error: {0}")]
    Network(String),

    #[error("navigation timed out: {0}")]
    Timeout(String),

    #[error("browser api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("browser session is closed")]
    Closed,
}

impl BrowserError {
    /// Client-side route changes tear down the page's JS context mid-wait.
    pub fn is_context_destroyed(&self) -> bool {
        match self {
            BrowserError::Api { message, .. } | BrowserError::Network(message) => {
                message.contains("Execution context was destroyed")
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            BrowserError::Timeout(_) => true,
            BrowserError::Api { status, message } => {
                *status == 408 || message.contains("TimeoutError") || message.contains("Navigation timeout")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrowserError::Timeout(err.to_string())
        } else {
            BrowserError::Network(err.to_string())
        }
    }
}
