//! Image downloads for the `download_images` capture mode.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub mod rate_limiter;

pub use rate_limiter::RateLimiter;

use crate::config::MediaConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::utils::extract_domain;

/// Fetches card images over HTTP, at most `max_images` per product.
pub struct MediaFetcher {
    client: Client,
    limiter: RateLimiter,
    max_images: usize,
}

impl MediaFetcher {
    pub fn new(config: &MediaConfig) -> CrawlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| CrawlError::config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            limiter: RateLimiter::new(Duration::from_millis(config.per_domain_delay_ms)),
            max_images: config.max_images_per_product,
        })
    }

    /// Canonical download URL: query string and fragment dropped,
    /// protocol-relative URLs promoted to https, relative paths joined onto
    /// `page_url`. `None` for inline data or when nothing absolute results.
    pub fn canonical_url(raw: &str, page_url: Option<&Url>) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") {
            return None;
        }

        let mut url = if raw.starts_with("//") {
            Url::parse(&format!("https:{}", raw)).ok()?
        } else {
            match Url::parse(raw) {
                Ok(url) => url,
                Err(url::ParseError::RelativeUrlWithoutBase) => page_url?.join(raw).ok()?,
                Err(_) => return None,
            }
        };
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_query(None);
        url.set_fragment(None);
        Some(url.to_string())
    }

    /// Download one image.
    pub async fn fetch(&self, url: &str) -> CrawlResult<Vec<u8>> {
        if let Some(domain) = extract_domain(url) {
            self.limiter.wait_for_domain(&domain).await;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CrawlError::media(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::media(url, format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CrawlError::media(url, e.to_string()))?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    /// Download up to `max_images` of `urls`, resolving relative sources
    /// against `page_url`. Each entry keeps the position of its URL among
    /// the usable ones; failures are logged and skipped.
    pub async fn fetch_images(&self, urls: &[String], page_url: Option<&str>) -> Vec<(usize, Vec<u8>)> {
        let base = page_url.and_then(|u| Url::parse(u).ok());
        let mut downloaded = Vec::new();
        let usable = urls
            .iter()
            .filter_map(|u| Self::canonical_url(u, base.as_ref()))
            .take(self.max_images);

        for (index, url) in usable.enumerate() {
            match self.fetch(&url).await {
                Ok(bytes) => downloaded.push((index, bytes)),
                Err(e) => warn!("Skipping image {}: {}", url, e),
            }
        }
        downloaded
    }
}
