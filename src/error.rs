use thiserror::Error;

use crate::browser::BrowserError;
use crate::storage::StorageError;

/// Error types for catalog-crawler
#[derive(Error, Debug)]
pub enum CrawlError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid configuration file: {path}")]
    InvalidConfig { path: String },

    // Browser session errors
    #[error("Browser session lost: {message}")]
    SessionLost { message: String },

    #[error("Navigation failed: {message}")]
    Navigation { message: String },

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },

    // Output errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Media download failed: {url} - {message}")]
    Media { url: String, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    // Generic errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CrawlError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a navigation error
    pub fn navigation(message: impl Into<String>) -> Self {
        Self::Navigation { message: message.into() }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Create a media error
    pub fn media(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Media { url: url.into(), message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Fatal errors abort the whole traversal; everything else is
    /// recovered at the card, sibling or field level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionLost { .. } | Self::Storage { .. } | Self::Configuration { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } | Self::InvalidConfig { .. } => "configuration",
            Self::SessionLost { .. } => "session",
            Self::Navigation { .. } | Self::Timeout { .. } => "navigation",
            Self::Storage { .. } => "storage",
            Self::Media { .. } | Self::Network { .. } => "network",
            Self::Cancelled | Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for catalog-crawler
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

impl From<BrowserError> for CrawlError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Disconnected(message) => Self::SessionLost { message },
            BrowserError::NotFound(what) => Self::Timeout { what },
            BrowserError::Stale => Self::Navigation { message: "stale element reference".to_string() },
            BrowserError::ClickIntercepted(message) | BrowserError::Navigation(message) => {
                Self::Navigation { message }
            }
            BrowserError::Script(message) | BrowserError::Other(message) => Self::Internal { message },
        }
    }
}

impl From<StorageError> for CrawlError {
    fn from(err: StorageError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network { message: err.to_string() }
    }
}
