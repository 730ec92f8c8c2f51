use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{CrawlError, CrawlResult};
use crate::extract::{BatchMode, CaptureMode, InclusionFilter};
use crate::logging::LoggingConfig;
use crate::site::SiteProfile;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name of the active site profile (built-in or declared under `sites`).
    pub site: String,
    pub crawl: CrawlConfig,
    pub probe: ProbeConfig,
    pub extraction: ExtractionConfig,
    pub output: OutputConfig,
    pub media: MediaConfig,
    pub browser: BrowserConfig,
    pub logging: LoggingConfig,
    pub sites: HashMap<String, SiteProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_depth: usize,
    pub max_fan_out: usize,
    pub settle_delay_ms: u64,
    pub prefer_href: bool,
    pub dismiss_cookies: bool,
    pub root_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub capture: CaptureMode,
    pub batch_mode: BatchMode,
    pub max_expansions: usize,
    pub max_cards_per_page: Option<usize>,
    pub full_scroll: bool,
    pub max_scroll_rounds: usize,
    pub filter: InclusionFilter,
    /// Listing order passed through the site's sort parameter, e.g. `BEST_SELLER`.
    pub listing_sort: Option<String>,
    pub detail_pages: bool,
    pub detail_images: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub request_timeout_seconds: u64,
    pub user_agent: String,
    pub max_images_per_product: usize,
    pub per_domain_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: String,
    pub viewport_width: i32,
    pub viewport_height: i32,
    pub timeout_ms: u32,
}

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_fan_out: 50,
            settle_delay_ms: 2000,
            prefer_href: false,
            dismiss_cookies: true,
            root_label: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureMode::TextOnly,
            batch_mode: BatchMode::PerLeaf,
            max_expansions: 20,
            max_cards_per_page: None,
            full_scroll: true,
            max_scroll_rounds: 30,
            filter: InclusionFilter::All,
            listing_sort: None,
            detail_pages: false,
            detail_images: 3,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: get_data_directory().join("products"),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_images_per_product: 3,
            per_domain_delay_ms: 500,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, writing defaults when absent
    pub async fn load() -> CrawlResult<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            info!("No configuration file found, using defaults");
            let config = Self::with_defaults();
            config.save_to(&config_path).await?;
            Ok(config)
        }
    }

    /// Load configuration from specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> CrawlResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|_| CrawlError::InvalidConfig {
            path: path.display().to_string(),
        })?;
        let config = Self::from_toml(&content)?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> CrawlResult<Self> {
        let mut config: AppConfig =
            toml::from_str(content).map_err(|e| CrawlError::config(format!("Invalid TOML: {}", e)))?;
        if config.site.is_empty() {
            config.site = "ebay".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults with the eBay profile selected
    pub fn with_defaults() -> Self {
        Self {
            site: "ebay".to_string(),
            ..Self::default()
        }
    }

    /// Save configuration to a file
    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> CrawlResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CrawlError::storage(format!("{}: {}", parent.display(), e)))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| CrawlError::internal(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| CrawlError::storage(format!("{}: {}", path.display(), e)))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> CrawlResult<()> {
        if self.crawl.max_depth == 0 {
            return Err(CrawlError::config("crawl.max_depth must be > 0"));
        }

        if self.crawl.max_fan_out == 0 {
            return Err(CrawlError::config("crawl.max_fan_out must be > 0"));
        }

        if self.probe.max_attempts == 0 {
            return Err(CrawlError::config("probe.max_attempts must be > 0"));
        }

        if self.probe.max_backoff_ms < self.probe.initial_backoff_ms {
            return Err(CrawlError::config("probe.max_backoff_ms must be >= probe.initial_backoff_ms"));
        }

        if self.probe.backoff_multiplier < 1.0 {
            return Err(CrawlError::config("probe.backoff_multiplier must be >= 1.0"));
        }

        if self.extraction.max_cards_per_page == Some(0) {
            return Err(CrawlError::config("extraction.max_cards_per_page must be > 0 when set"));
        }

        if self.output.directory.as_os_str().is_empty() {
            return Err(CrawlError::config("output.directory must not be empty"));
        }

        if self.extraction.detail_pages && self.extraction.batch_mode == BatchMode::PerExpansion {
            return Err(CrawlError::config(
                "extraction.detail_pages needs batch_mode = \"per_leaf\"",
            ));
        }

        self.extraction.filter.compile()?;
        let site = self.site_profile()?;

        if self.extraction.listing_sort.is_some() && site.sort_param.is_none() {
            return Err(CrawlError::config(format!(
                "extraction.listing_sort is set but site '{}' has no sort_param",
                site.name
            )));
        }

        if self.extraction.detail_pages && site.detail.is_none() {
            return Err(CrawlError::config(format!(
                "extraction.detail_pages is set but site '{}' has no detail locators",
                site.name
            )));
        }

        Ok(())
    }

    /// Resolve the active site profile; custom profiles shadow built-ins
    pub fn site_profile(&self) -> CrawlResult<SiteProfile> {
        self.sites
            .get(&self.site)
            .cloned()
            .or_else(|| SiteProfile::builtin(&self.site))
            .ok_or_else(|| CrawlError::config(format!("Unknown site profile: {}", self.site)))
    }
}

/// Get the default data directory
fn get_data_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "catalog", "crawler")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"))
}

/// Get the configuration file path
pub fn get_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "catalog", "crawler")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("config.toml"))
}

/// Environment-based configuration overrides
pub struct ConfigOverrides;

impl ConfigOverrides {
    /// Apply environment variable overrides to configuration
    pub fn apply(config: &mut AppConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_from(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CATALOG_CRAWLER_OUTPUT_DIR") {
            config.output.directory = PathBuf::from(dir);
        }

        if let Some(site) = lookup("CATALOG_CRAWLER_SITE") {
            config.site = site;
        }

        if let Some(depth) = lookup("CATALOG_CRAWLER_MAX_DEPTH").and_then(|v| v.parse().ok()) {
            config.crawl.max_depth = depth;
        }

        if let Some(fan_out) = lookup("CATALOG_CRAWLER_MAX_FAN_OUT").and_then(|v| v.parse().ok()) {
            config.crawl.max_fan_out = fan_out;
        }

        if let Some(expansions) = lookup("CATALOG_CRAWLER_MAX_EXPANSIONS").and_then(|v| v.parse().ok()) {
            config.extraction.max_expansions = expansions;
        }

        if let Some(settle) = lookup("CATALOG_CRAWLER_SETTLE_MS").and_then(|v| v.parse().ok()) {
            config.crawl.settle_delay_ms = settle;
        }

        if let Some(order) = lookup("CATALOG_CRAWLER_SORT") {
            config.extraction.listing_sort = Some(order);
        }

        if let Some(level) = lookup("CATALOG_CRAWLER_LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}
