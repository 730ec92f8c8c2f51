//! Harvesting product records from a leaf category page.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod parse;

use crate::browser::ElementRef;
use crate::config::ExtractionConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::media::MediaFetcher;
use crate::models::{display_path, CategoryPath, ProductBatch, ProductRecord};
use crate::probe::PageProbe;
use crate::storage::{MediaKind, Persistence};
use crate::utils::{product_key, resolve_link};

/// What is captured for each product besides its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    TextOnly,
    Screenshot,
    DownloadImages,
}

/// When gathered records are written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One batch per leaf, after the last expansion.
    #[default]
    PerLeaf,
    /// One batch per page state: the initial page and each "load more".
    PerExpansion,
}

/// Optional predicate a record must satisfy to be kept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InclusionFilter {
    #[default]
    All,
    RawTextContains {
        needle: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    RawTextMatches {
        pattern: String,
    },
    HasSoldCount,
}

impl InclusionFilter {
    /// Compile into a ready-to-apply predicate.
    pub fn compile(&self) -> CrawlResult<RecordFilter> {
        Ok(match self {
            InclusionFilter::All => RecordFilter::All,
            InclusionFilter::RawTextContains { needle, case_sensitive: true } => {
                RecordFilter::Contains(needle.clone())
            }
            InclusionFilter::RawTextContains { needle, case_sensitive: false } => {
                RecordFilter::ContainsIgnoreCase(needle.to_lowercase())
            }
            InclusionFilter::RawTextMatches { pattern } => RecordFilter::Matches(
                Regex::new(pattern).map_err(|e| CrawlError::config(format!("Invalid filter pattern: {}", e)))?,
            ),
            InclusionFilter::HasSoldCount => RecordFilter::HasSoldCount,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RecordFilter {
    All,
    Contains(String),
    ContainsIgnoreCase(String),
    Matches(Regex),
    HasSoldCount,
}

impl RecordFilter {
    pub fn accepts(&self, record: &ProductRecord) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Contains(needle) => record.raw_text.contains(needle.as_str()),
            RecordFilter::ContainsIgnoreCase(needle) => record.raw_text.to_lowercase().contains(needle.as_str()),
            RecordFilter::Matches(regex) => regex.is_match(&record.raw_text),
            RecordFilter::HasSoldCount => record.sold_count.is_some(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub capture: CaptureMode,
    pub batch_mode: BatchMode,
    pub max_expansions: usize,
    pub max_cards_per_page: Option<usize>,
    pub full_scroll: bool,
    pub max_scroll_rounds: usize,
    pub filter: InclusionFilter,
    /// Value for the site's sort parameter, applied before a leaf is scraped.
    pub listing_sort: Option<String>,
    /// Visit each kept product's own page after the listing is exhausted.
    pub detail_pages: bool,
    pub detail_images: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self::from(&ExtractionConfig::default())
    }
}

impl From<&ExtractionConfig> for ExtractionOptions {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            capture: config.capture,
            batch_mode: config.batch_mode,
            max_expansions: config.max_expansions,
            max_cards_per_page: config.max_cards_per_page,
            full_scroll: config.full_scroll,
            max_scroll_rounds: config.max_scroll_rounds,
            filter: config.filter.clone(),
            listing_sort: config.listing_sort.clone(),
            detail_pages: config.detail_pages,
            detail_images: config.detail_images,
        }
    }
}

/// Everything one leaf produced.
#[derive(Debug, Clone, Default)]
pub struct LeafHarvest {
    pub category_path: CategoryPath,
    /// Batches in the order they were persisted.
    pub batches: Vec<ProductBatch>,
    pub written: Vec<PathBuf>,
    pub expansions: usize,
    pub card_failures: usize,
    pub cancelled: bool,
}

impl LeafHarvest {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(ProductBatch::len).sum()
    }
}

/// A fatal failure mid-harvest, with whatever was persisted before it.
#[derive(Error, Debug)]
#[error("harvest of {} aborted: {source}", display_path(&.partial.category_path))]
pub struct HarvestError {
    pub source: CrawlError,
    pub partial: LeafHarvest,
}

/// Per-leaf bookkeeping across expansions.
#[derive(Default)]
struct HarvestState {
    seen: HashSet<(String, Option<String>)>,
    used_keys: HashSet<String>,
    pending: Vec<ProductRecord>,
    harvest: LeafHarvest,
}

/// Pulls product records off leaf pages and hands them to persistence.
pub struct ProductExtractor {
    probe: Arc<PageProbe>,
    persistence: Arc<dyn Persistence>,
    media: Option<Arc<MediaFetcher>>,
    filter: RecordFilter,
    options: ExtractionOptions,
}

impl ProductExtractor {
    pub fn new(
        probe: Arc<PageProbe>,
        persistence: Arc<dyn Persistence>,
        media: Option<Arc<MediaFetcher>>,
        options: ExtractionOptions,
    ) -> CrawlResult<Self> {
        if options.capture == CaptureMode::DownloadImages && media.is_none() {
            return Err(CrawlError::config("download_images capture needs a media fetcher"));
        }
        let filter = options.filter.compile()?;
        Ok(Self {
            probe,
            persistence,
            media,
            filter,
            options,
        })
    }

    /// Make lazily rendered listings visible before products are counted.
    pub async fn prepare_page(&self) -> CrawlResult<()> {
        if self.options.full_scroll {
            let rounds = self.probe.full_scroll(self.options.max_scroll_rounds).await?;
            debug!("Full scroll finished after {} rounds", rounds);
        }
        Ok(())
    }

    /// Reorder the current listing when a sort order is configured. True
    /// when the page was reloaded and needs preparing again.
    pub async fn apply_sort(&self) -> CrawlResult<bool> {
        match &self.options.listing_sort {
            Some(order) => self.probe.apply_listing_sort(order).await,
            None => Ok(false),
        }
    }

    /// One pass over the cards currently rendered. Nothing is persisted
    /// here; media side-files are written as cards are captured.
    pub async fn scrape_current_page(&self, category_path: &[String]) -> CrawlResult<ProductBatch> {
        let mut state = HarvestState::default();
        self.scrape_pass(category_path, &mut state).await?;
        Ok(ProductBatch {
            category_path: category_path.to_vec(),
            records: state.pending,
        })
    }

    /// Scrape, then keep pressing "load more" until it disappears, the
    /// expansion bound is hit, or `cancel` fires. Gathered records are
    /// persisted even when the loop ends early.
    pub async fn expand_and_continue(
        &self,
        category_path: &[String],
        cancel: &CancellationToken,
    ) -> Result<LeafHarvest, HarvestError> {
        let mut state = HarvestState::default();
        state.harvest.category_path = category_path.to_vec();

        loop {
            if let Err(e) = self.scrape_pass(category_path, &mut state).await {
                return Err(self.abort(category_path, state, e).await);
            }

            if self.options.batch_mode == BatchMode::PerExpansion {
                if let Err(e) = self.flush(category_path, &mut state).await {
                    return Err(self.abort(category_path, state, e).await);
                }
            }

            if state.harvest.expansions >= self.options.max_expansions {
                info!(
                    "Reached {} expansions on {}",
                    self.options.max_expansions,
                    display_path(category_path)
                );
                break;
            }

            if cancel.is_cancelled() {
                info!("Cancelled before next expansion on {}", display_path(category_path));
                state.harvest.cancelled = true;
                break;
            }

            match self.probe.has_load_more_control().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(self.abort(category_path, state, e).await),
            }

            match self.probe.trigger_load_more().await {
                Ok(()) => state.harvest.expansions += 1,
                Err(e) if e.is_fatal() => return Err(self.abort(category_path, state, e).await),
                Err(e) => {
                    warn!("Load more failed on {}: {}", display_path(category_path), e);
                    break;
                }
            }
        }

        if self.options.detail_pages && !state.harvest.cancelled {
            if let Err(e) = self.read_details(category_path, &mut state, cancel).await {
                return Err(self.abort(category_path, state, e).await);
            }
        }

        if let Err(e) = self.flush(category_path, &mut state).await {
            return Err(self.abort(category_path, state, e).await);
        }

        info!(
            "Harvested {} records in {} batches from {}",
            state.harvest.record_count(),
            state.harvest.batches.len(),
            display_path(category_path)
        );
        Ok(state.harvest)
    }

    async fn scrape_pass(&self, category_path: &[String], state: &mut HarvestState) -> CrawlResult<()> {
        let cards = self.probe.product_cards().await?;
        // Cards already taken on an earlier pass stay listed; the bound counts new ones.
        let limit = self.options.max_cards_per_page.unwrap_or(usize::MAX);
        let mut fresh = 0;
        debug!("Scraping {} cards on {}", cards.len(), display_path(category_path));

        for card in cards {
            if fresh >= limit {
                debug!("Card bound of {} reached on {}", limit, display_path(category_path));
                break;
            }
            self.probe.scroll_into_view(card).await?;

            let mut record = match self.probe.extract_product_card(card, category_path).await {
                Ok(record) => record,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Skipping card on {}: {}", display_path(category_path), e);
                    state.harvest.card_failures += 1;
                    continue;
                }
            };

            if !record.is_valid() {
                debug!("Card without text skipped");
                continue;
            }
            if !state.seen.insert(record.dedup_key()) {
                continue;
            }
            fresh += 1;
            if !self.filter.accepts(&record) {
                debug!("Filtered out: {}", record.title);
                continue;
            }

            self.capture_media(card, category_path, &mut record, state).await?;
            state.pending.push(record);
        }

        Ok(())
    }

    async fn capture_media(
        &self,
        card: ElementRef,
        category_path: &[String],
        record: &mut ProductRecord,
        state: &mut HarvestState,
    ) -> CrawlResult<()> {
        if self.options.capture == CaptureMode::TextOnly {
            return Ok(());
        }

        let index = state.harvest.record_count() + state.pending.len();
        let mut key = product_key(&record.title, index);
        if !state.used_keys.insert(key.clone()) {
            key = format!("{}_{}", key, index);
            state.used_keys.insert(key.clone());
        }

        match self.options.capture {
            CaptureMode::Screenshot => match self.probe.session().screenshot(card).await {
                Ok(png) => {
                    match self
                        .persistence
                        .write_media(category_path, &key, 0, MediaKind::Screenshot, &png)
                        .await
                    {
                        Ok(rel) => record.screenshot_path = Some(rel),
                        Err(e) => warn!("Screenshot for {} not saved: {}", key, e),
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Screenshot for {} failed: {}", key, e),
            },
            CaptureMode::DownloadImages => {
                if let Some(media) = &self.media {
                    let page_url = match self.probe.session().current_url().await {
                        Ok(url) => Some(url),
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(_) => None,
                    };
                    for (n, bytes) in media.fetch_images(&record.image_urls, page_url.as_deref()).await {
                        match self
                            .persistence
                            .write_media(category_path, &key, n, MediaKind::Image, &bytes)
                            .await
                        {
                            Ok(rel) => record.image_refs.push(rel),
                            Err(e) => warn!("Image {} for {} not saved: {}", n, key, e),
                        }
                    }
                }
            }
            CaptureMode::TextOnly => {}
        }

        Ok(())
    }

    /// Attach each pending record's product page, then reopen the listing.
    async fn read_details(
        &self,
        category_path: &[String],
        state: &mut HarvestState,
        cancel: &CancellationToken,
    ) -> CrawlResult<()> {
        let listing_url = self.probe.session().current_url().await?;
        let mut left_listing = false;
        let mut read = 0;

        for record in state.pending.iter_mut() {
            if cancel.is_cancelled() {
                info!("Cancelled during product pages of {}", display_path(category_path));
                state.harvest.cancelled = true;
                break;
            }
            let Some(url) = record.source_url.as_deref().and_then(|link| resolve_link(link, &listing_url)) else {
                continue;
            };

            left_listing = true;
            match self.probe.read_product_detail(&url, self.options.detail_images).await {
                Ok(detail) => {
                    record.detail = Some(detail);
                    read += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Product page {} skipped: {}", url, e),
            }
        }

        debug!("Read {} product pages for {}", read, display_path(category_path));
        if left_listing && !self.probe.return_to(&listing_url).await? {
            warn!("Listing {} not restored after product pages", listing_url);
        }
        Ok(())
    }

    /// Persist pending records as one batch. Empty sets are not written.
    async fn flush(&self, category_path: &[String], state: &mut HarvestState) -> CrawlResult<()> {
        if state.pending.is_empty() {
            return Ok(());
        }

        let records = std::mem::take(&mut state.pending);
        let timestamp_key = chrono::Utc::now().timestamp().to_string();
        let written = self
            .persistence
            .write_batch(category_path, &records, &timestamp_key)
            .await?;

        state.harvest.written.push(written);
        state.harvest.batches.push(ProductBatch {
            category_path: category_path.to_vec(),
            records,
        });
        Ok(())
    }

    /// Keep what was gathered, then report the failure.
    async fn abort(&self, category_path: &[String], mut state: HarvestState, source: CrawlError) -> HarvestError {
        if let Err(e) = self.flush(category_path, &mut state).await {
            warn!("Partial batch for {} lost: {}", display_path(category_path), e);
        }
        HarvestError {
            source,
            partial: state.harvest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_probe, MemoryPersistence, MockBrowser, MockCard, MockDetail, MockPage};

    const LEAF: &str = "https://shop.test/lamps";

    fn leaf_path() -> Vec<String> {
        vec!["Home".to_string(), "Lamps".to_string()]
    }

    fn extractor(browser: &MockBrowser, store: &Arc<MemoryPersistence>, options: ExtractionOptions) -> ProductExtractor {
        ProductExtractor::new(Arc::new(test_probe(browser)), store.clone(), None, options).unwrap()
    }

    fn paginated(initial: usize, reveals: &[usize]) -> MockBrowser {
        let mut page = MockPage::new().cards((0..initial).map(|i| MockCard::titled(format!("Lamp {}", i)).price("$10.00")));
        let mut next = initial;
        for &count in reveals {
            page = page.load_more_batch((next..next + count).map(|i| MockCard::titled(format!("Lamp {}", i))));
            next += count;
        }
        let browser = MockBrowser::new().page(LEAF, page);
        browser.goto(LEAF);
        browser
    }

    #[tokio::test]
    async fn test_load_more_collects_all_without_duplicates() {
        let browser = paginated(10, &[5]);
        let store = Arc::new(MemoryPersistence::default());
        let extractor = extractor(&browser, &store, ExtractionOptions::default());

        let harvest = extractor
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.expansions, 1);
        assert_eq!(harvest.batches.len(), 1);
        assert_eq!(harvest.record_count(), 15);

        let written = store.batches();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].category_path, leaf_path());
        let keys: HashSet<_> = written[0].records.iter().map(|r| r.dedup_key()).collect();
        assert_eq!(keys.len(), 15);
    }

    #[tokio::test]
    async fn test_per_expansion_batches() {
        let browser = paginated(4, &[3, 2]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            batch_mode: BatchMode::PerExpansion,
            ..ExtractionOptions::default()
        };

        let harvest = extractor(&browser, &store, options)
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        let sizes: Vec<usize> = store.batches().iter().map(ProductBatch::len).collect();
        assert_eq!(sizes, vec![4, 3, 2]);
        assert_eq!(harvest.written.len(), 3);
    }

    #[tokio::test]
    async fn test_expansions_are_bounded() {
        let browser = paginated(1, &[1, 1, 1, 1, 1]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            max_expansions: 2,
            ..ExtractionOptions::default()
        };

        let harvest = extractor(&browser, &store, options)
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.expansions, 2);
        assert_eq!(harvest.record_count(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_still_persists_gathered_records() {
        let browser = paginated(3, &[3]);
        let store = Arc::new(MemoryPersistence::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let harvest = extractor(&browser, &store, ExtractionOptions::default())
            .expand_and_continue(&leaf_path(), &cancel)
            .await
            .unwrap();

        assert!(harvest.cancelled);
        assert_eq!(harvest.expansions, 0);
        assert_eq!(store.batches().len(), 1);
        assert_eq!(store.batches()[0].len(), 3);
    }

    #[tokio::test]
    async fn test_failed_load_more_ends_loop_gracefully() {
        let browser = paginated(2, &[2]);
        browser.fail_clicks_on("button.load-more");
        let store = Arc::new(MemoryPersistence::default());

        let harvest = extractor(&browser, &store, ExtractionOptions::default())
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.expansions, 0);
        assert_eq!(harvest.record_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_mid_loop_persists_partial() {
        let browser = paginated(2, &[2]);
        browser.disconnect_after_clicks(1);
        let store = Arc::new(MemoryPersistence::default());

        let err = extractor(&browser, &store, ExtractionOptions::default())
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.source.is_fatal());
        assert_eq!(err.partial.record_count(), 2);
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_filter_and_empty_page() {
        let browser = MockBrowser::new()
            .page(
                LEAF,
                MockPage::new()
                    .card(MockCard::titled("Lamp A").line("12 sold"))
                    .card(MockCard::titled("Lamp B"))
                    .card(MockCard::titled("Lamp C").line("3 SOLD")),
            )
            .page("https://shop.test/empty", MockPage::new());
        browser.goto(LEAF);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            filter: InclusionFilter::RawTextContains {
                needle: "sold".to_string(),
                case_sensitive: false,
            },
            ..ExtractionOptions::default()
        };
        let extractor = extractor(&browser, &store, options);

        let batch = extractor.scrape_current_page(&leaf_path()).await.unwrap();
        let titles: Vec<_> = batch.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Lamp A", "Lamp C"]);

        browser.goto("https://shop.test/empty");
        let harvest = extractor
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(harvest.record_count(), 0);
        assert!(harvest.batches.is_empty());
        assert!(store.batches().is_empty());
    }

    #[tokio::test]
    async fn test_cards_per_page_bound() {
        let browser = paginated(8, &[]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            max_cards_per_page: Some(5),
            ..ExtractionOptions::default()
        };

        let batch = extractor(&browser, &store, options)
            .scrape_current_page(&leaf_path())
            .await
            .unwrap();
        assert_eq!(batch.len(), 5);
    }

    #[tokio::test]
    async fn test_cards_per_page_bound_counts_new_cards_after_load_more() {
        let browser = paginated(5, &[5]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            max_cards_per_page: Some(5),
            ..ExtractionOptions::default()
        };

        let harvest = extractor(&browser, &store, options)
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.expansions, 1);
        assert_eq!(harvest.record_count(), 10);
        let titles: Vec<_> = store.batches()[0].records.iter().map(|r| r.title.clone()).collect();
        assert_eq!(titles.last().map(String::as_str), Some("Lamp 9"));
    }

    #[tokio::test]
    async fn test_cancel_after_first_reveal_keeps_revealed_cards() {
        let browser = paginated(3, &[3, 3]);
        let cancel = CancellationToken::new();
        browser.cancel_on_load_more(cancel.clone());
        let store = Arc::new(MemoryPersistence::default());

        let harvest = extractor(&browser, &store, ExtractionOptions::default())
            .expand_and_continue(&leaf_path(), &cancel)
            .await
            .unwrap();

        assert!(harvest.cancelled);
        assert_eq!(harvest.expansions, 1);
        let written = store.batches();
        assert_eq!(written.len(), 1);
        let titles: Vec<_> = written[0].records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Lamp 0", "Lamp 1", "Lamp 2", "Lamp 3", "Lamp 4", "Lamp 5"]);
    }

    fn with_product_pages(browser: MockBrowser, n: usize) -> MockBrowser {
        (0..n).fold(browser, |browser, i| {
            browser.page(
                format!("https://shop.test/p/{}", i),
                MockPage::new().detail(MockDetail::titled(format!("Lamp {} full name", i)).reviews(format!("({})", i * 10))),
            )
        })
    }

    #[tokio::test]
    async fn test_product_pages_enrich_records_and_listing_is_restored() {
        let page = MockPage::new()
            .cards((0..3).map(|i| MockCard::titled(format!("Lamp {}", i)).link(format!("/p/{}", i))))
            .card(MockCard::titled("Lamp without link"));
        let browser = with_product_pages(MockBrowser::new().page(LEAF, page), 3);
        browser.goto(LEAF);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            detail_pages: true,
            ..ExtractionOptions::default()
        };

        let harvest = extractor(&browser, &store, options)
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.record_count(), 4);
        let records = &store.batches()[0].records;
        let detail = records[2].detail.as_ref().unwrap();
        assert_eq!(detail.url, "https://shop.test/p/2");
        assert_eq!(detail.title.as_deref(), Some("Lamp 2 full name"));
        assert_eq!(detail.review_count, Some(20));
        assert!(records[3].detail.is_none());
        assert_eq!(browser.current(), LEAF);
    }

    #[tokio::test]
    async fn test_product_pages_skipped_when_cancelled() {
        let page = MockPage::new().cards((0..2).map(|i| MockCard::titled(format!("Lamp {}", i)).link(format!("/p/{}", i))));
        let browser = with_product_pages(MockBrowser::new().page(LEAF, page), 2);
        browser.goto(LEAF);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            detail_pages: true,
            ..ExtractionOptions::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let harvest = extractor(&browser, &store, options)
            .expand_and_continue(&leaf_path(), &cancel)
            .await
            .unwrap();

        assert!(harvest.cancelled);
        assert_eq!(store.batches()[0].len(), 2);
        assert!(store.batches()[0].records.iter().all(|r| r.detail.is_none()));
        assert_eq!(browser.navigations(), vec![LEAF.to_string()]);
    }

    #[tokio::test]
    async fn test_apply_sort_reloads_listing() {
        let browser = paginated(2, &[]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            listing_sort: Some("BEST_SELLER".to_string()),
            ..ExtractionOptions::default()
        };
        let sorted = extractor(&browser, &store, options);

        assert!(sorted.apply_sort().await.unwrap());
        assert_eq!(browser.current(), format!("{}?sort=BEST_SELLER", LEAF));
        assert!(!sorted.apply_sort().await.unwrap());

        let unsorted = extractor(&browser, &store, ExtractionOptions::default());
        assert!(!unsorted.apply_sort().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_card_is_skipped_not_fatal() {
        let browser = paginated(3, &[]);
        browser.stale_text_for_card(1);
        let store = Arc::new(MemoryPersistence::default());

        let harvest = extractor(&browser, &store, ExtractionOptions::default())
            .expand_and_continue(&leaf_path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harvest.record_count(), 2);
        assert_eq!(harvest.card_failures, 1);
    }

    #[tokio::test]
    async fn test_screenshot_capture_records_path() {
        let browser = paginated(2, &[]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            capture: CaptureMode::Screenshot,
            ..ExtractionOptions::default()
        };

        let batch = extractor(&browser, &store, options)
            .scrape_current_page(&leaf_path())
            .await
            .unwrap();

        assert_eq!(batch.records[0].screenshot_path.as_deref(), Some("Lamp_0/screenshot.png"));
        assert_eq!(batch.records[1].screenshot_path.as_deref(), Some("Lamp_1/screenshot.png"));
        assert_eq!(store.media().len(), 2);
    }

    #[test]
    fn test_download_mode_requires_fetcher() {
        let browser = paginated(1, &[]);
        let store = Arc::new(MemoryPersistence::default());
        let options = ExtractionOptions {
            capture: CaptureMode::DownloadImages,
            ..ExtractionOptions::default()
        };

        let result = ProductExtractor::new(Arc::new(test_probe(&browser)), store, None, options);
        assert!(matches!(result, Err(CrawlError::Configuration { .. })));
    }

    #[test]
    fn test_filter_compile() {
        let record = ProductRecord {
            raw_text: "Lamp\n1,204 sold".to_string(),
            sold_count: Some(1204),
            ..Default::default()
        };

        assert!(InclusionFilter::All.compile().unwrap().accepts(&record));
        assert!(InclusionFilter::HasSoldCount.compile().unwrap().accepts(&record));
        assert!(!InclusionFilter::RawTextContains { needle: "SOLD".into(), case_sensitive: true }
            .compile()
            .unwrap()
            .accepts(&record));
        assert!(InclusionFilter::RawTextMatches { pattern: r"\d+ sold".into() }
            .compile()
            .unwrap()
            .accepts(&record));
        assert!(InclusionFilter::RawTextMatches { pattern: "(".into() }.compile().is_err());
    }
}
