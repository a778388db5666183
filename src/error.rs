use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Bytes did not decode as a raster image.
    #[error("Image decode failed: {0}")]
    Decode(String),

    /// The browser process or its DevTools connection became unusable.
    #[error("Browser transport failed: {0}")]
    Transport(String),

    /// A page failed to load. Treated like a transport failure.
    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    /// Transport failures mean the browser must be relaunched before the
    /// same item is tried again. A failed navigation counts as one.
    pub fn is_transport(&self) -> bool {
        matches!(self, CaptureError::Transport(_) | CaptureError::Navigation(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Transport(_)
                | CaptureError::Navigation(_)
                | CaptureError::ElementNotFound(_)
                | CaptureError::Network(_)
                | CaptureError::Timeout(_)
                | CaptureError::CaptureFailed(_)
                | CaptureError::Storage(_)
        )
    }

    /// Short machine-readable label used in metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Decode(_) => "decode",
            CaptureError::Transport(_) => "transport",
            CaptureError::Navigation(_) => "navigation",
            CaptureError::ElementNotFound(_) => "element_not_found",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::Network(_) => "network",
            CaptureError::CaptureFailed(_) => "capture",
            CaptureError::Storage(_) => "storage",
            CaptureError::Configuration(_) => "configuration",
            CaptureError::Manifest(_) => "manifest",
            CaptureError::Io(_) => "io",
            CaptureError::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CaptureError::Network(format!("timed out: {err}"))
        } else {
            CaptureError::Network(err.to_string())
        }
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        use chromiumoxide::error::CdpError;

        match err {
            // The websocket or the handler task is gone: the browser is dead.
            CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
                CaptureError::Transport(err.to_string())
            }
            CdpError::Timeout => CaptureError::CaptureFailed("devtools request timed out".to_string()),
            other => CaptureError::CaptureFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_counts_as_transport() {
        assert!(CaptureError::Transport("ws closed".to_string()).is_transport());
        assert!(CaptureError::Navigation("net::ERR_CONNECTION_RESET".to_string()).is_transport());
        assert!(!CaptureError::Network("HTTP 404".to_string()).is_transport());
        assert!(!CaptureError::Decode("bad png".to_string()).is_transport());
    }

    #[test]
    fn configuration_errors_are_not_retried() {
        assert!(CaptureError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CaptureError::Configuration("concurrency".to_string()).is_retryable());
        assert!(!CaptureError::Manifest("line 1".to_string()).is_retryable());
    }
}
