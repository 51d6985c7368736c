use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Navigation timeout of {0:?} exceeded")]
    NavigationTimeout(Duration),

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Render queue is full ({limit} jobs waiting)")]
    QueueFull { limit: usize },

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    /// chromiumoxide gave up waiting on a protocol response; the executor
    /// reclassifies it by the operation that was running.
    #[error("Browser request timed out")]
    BrowserTimeout,

    #[error("Render task ended without a result: {0}")]
    Internal(String),
}

impl RenderError {
    /// Only navigation timeouts trigger the leaked request report.
    pub fn is_navigation_timeout(&self) -> bool {
        matches!(self, RenderError::NavigationTimeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RenderError::NavigationTimeout(_)
                | RenderError::OperationTimeout { .. }
                | RenderError::BrowserTimeout
        )
    }

    /// Stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::NavigationTimeout(_) => "navigation_timeout",
            RenderError::OperationTimeout { .. } => "operation_timeout",
            RenderError::PageError(_) => "page_error",
            RenderError::QueueFull { .. } => "queue_full",
            RenderError::BrowserLaunch(_) => "browser_launch",
            RenderError::InvalidUrl(_) => "invalid_url",
            RenderError::Configuration(_) => "configuration",
            RenderError::Io(_) => "io",
            RenderError::BrowserTimeout => "browser_timeout",
            RenderError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::PageError(format!("unexpected evaluation result: {err}"))
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        match err {
            chromiumoxide::error::CdpError::Timeout => RenderError::BrowserTimeout,
            err => RenderError::PageError(err.to_string()),
        }
    }
}
