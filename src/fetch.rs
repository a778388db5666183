//! Direct HTTP fetches of creative bytes
//!
//! Embedded and plain images are downloaded outside the browser so the stored
//! pixels are the served file, not a re-rasterized screenshot.

use crate::{CaptureError, Config};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// GET `url`, sending `referer` when known.
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<Vec<u8>, CaptureError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeouts.fetch)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<Vec<u8>, CaptureError> {
        crate::validate_url(url)?;

        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Network(format!("{url}: HTTP {status}")));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(CaptureError::Network(format!("{url}: empty body")));
        }

        debug!(url, bytes = bytes.len(), "Fetched creative bytes");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_http_scheme_is_rejected_before_any_request() {
        let fetcher = HttpFetcher::new(&Config::default()).unwrap();
        let err = fetcher.fetch("ftp://cdn.example/banner.png", None).await.unwrap_err();
        assert!(matches!(err, CaptureError::Network(ref m) if m.contains("unsupported scheme ftp")));
        assert!(!err.is_transport());
    }
}
