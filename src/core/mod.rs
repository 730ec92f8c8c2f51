use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::browser::BrowserSession;
use crate::config::AppConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::extract::{CaptureMode, ExtractionOptions, LeafHarvest, ProductExtractor};
use crate::logging::{LogContext, RunIdGenerator};
use crate::media::MediaFetcher;
use crate::probe::{PageProbe, RetryPolicy};
use crate::storage::{FsPersistence, Persistence};
use crate::walker::{CategoryWalker, TraversalError, TraversalOptions, TraversalReport};

/// Wires configuration, a live browser session and persistence into a
/// ready-to-run walker.
pub struct Crawler {
    config: AppConfig,
    extractor: Arc<ProductExtractor>,
    walker: CategoryWalker,
    run_id: String,
}

impl Crawler {
    pub fn new(
        config: AppConfig,
        session: Arc<dyn BrowserSession>,
        persistence: Arc<dyn Persistence>,
    ) -> CrawlResult<Self> {
        config.validate()?;
        let run_id = RunIdGenerator::generate();

        let site = config.site_profile()?;
        let probe = Arc::new(PageProbe::new(
            session,
            site,
            RetryPolicy::from(&config.probe),
            Duration::from_millis(config.crawl.settle_delay_ms),
        ));

        let options = ExtractionOptions::from(&config.extraction);
        let media = match options.capture {
            CaptureMode::DownloadImages => Some(Arc::new(MediaFetcher::new(&config.media)?)),
            _ => None,
        };
        let extractor = Arc::new(ProductExtractor::new(probe.clone(), persistence, media, options)?);

        let walker = CategoryWalker::new(
            probe,
            extractor.clone(),
            TraversalOptions::from(&config.crawl),
            run_id.clone(),
        );

        let context = LogContext::new("core", "init")
            .with_run_id(&run_id)
            .with_string_field("site", &config.site);
        crate::log_info!(context, "Crawler initialized");

        Ok(Self {
            config,
            extractor,
            walker,
            run_id,
        })
    }

    /// Crawler writing batches under `output.directory`.
    pub fn with_filesystem(config: AppConfig, session: Arc<dyn BrowserSession>) -> CrawlResult<Self> {
        let persistence = Arc::new(FsPersistence::new(config.output.directory.clone()));
        Self::new(config, session, persistence)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Full traversal below `start_url`.
    pub async fn traverse(&self, start_url: &str, cancel: &CancellationToken) -> Result<TraversalReport, TraversalError> {
        self.walker.traverse(start_url, cancel).await
    }

    /// Follow `labels` from `start_url` and harvest the category reached.
    pub async fn scrape_category(
        &self,
        start_url: &str,
        labels: &[String],
        cancel: &CancellationToken,
    ) -> CrawlResult<LeafHarvest> {
        let node = self.walker.descend_to(start_url, labels).await?;
        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }

        self.extractor.apply_sort().await?;
        self.extractor.prepare_page().await?;
        let harvest = self
            .extractor
            .expand_and_continue(&node.path, cancel)
            .await
            .map_err(|e| e.source)?;

        info!("{} records from {}", harvest.record_count(), node.display_path());
        Ok(harvest)
    }
}

/// One-shot traversal with the given configuration.
pub async fn traverse(
    config: AppConfig,
    session: Arc<dyn BrowserSession>,
    persistence: Arc<dyn Persistence>,
    start_url: &str,
    cancel: &CancellationToken,
) -> Result<TraversalReport, TraversalError> {
    let crawler = Crawler::new(config, session, persistence).map_err(|source| TraversalError {
        source,
        partial: TraversalReport::default(),
    })?;
    crawler.traverse(start_url, cancel).await
}
