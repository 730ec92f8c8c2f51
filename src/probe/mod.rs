//! Queries against the live page, expressed in terms of semantic roles.
//!
//! Every lookup that can legitimately come back empty goes through the
//! retry policy and degrades to "absent" once attempts are exhausted. Only a
//! lost browser session surfaces as an error.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod retry;

pub use retry::RetryPolicy;

use crate::browser::{BrowserError, BrowserSession, ElementRef, Locator};
use crate::error::{CrawlError, CrawlResult};
use crate::extract::parse;
use crate::models::{CategoryNode, ProductDetail, ProductRecord};
use crate::site::SiteProfile;
use crate::utils::{resolve_link, same_page, with_query_param};

const SCROLL_HEIGHT_SCRIPT: &str = "return document.body.scrollHeight;";
const SCROLL_TO_BOTTOM_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight);";

/// Role-based view of the current page.
pub struct PageProbe {
    session: Arc<dyn BrowserSession>,
    site: SiteProfile,
    retry: RetryPolicy,
    settle_delay: Duration,
}

impl PageProbe {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        site: SiteProfile,
        retry: RetryPolicy,
        settle_delay: Duration,
    ) -> Self {
        Self {
            session,
            site,
            retry,
            settle_delay,
        }
    }

    pub fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.session
    }

    /// Pause after a DOM-mutating action so rendering can catch up.
    pub async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Product cards currently on the page, in DOM order.
    pub async fn product_cards(&self) -> CrawlResult<Vec<ElementRef>> {
        self.lookup_all(None, &self.site.product_card, "product cards").await
    }

    /// Number of product cards on the page; zero is a normal answer.
    pub async fn count_products(&self) -> CrawlResult<usize> {
        let count = self.product_cards().await?.len();
        debug!("Counted {} product cards", count);
        Ok(count)
    }

    /// The element wrapping the current node's child categories, if rendered.
    ///
    /// Sites whose menu starts collapsed get their opener clicked first.
    pub async fn category_container(&self) -> CrawlResult<Option<ElementRef>> {
        let container = &self.site.category_container;
        let Some(opener) = &self.site.menu_open else {
            return self.lookup_one(None, container, "category container").await;
        };

        if let Some(element) = self.field(None, container).await? {
            return Ok(Some(element));
        }
        if let Some(button) = self.lookup_one(None, opener, "category menu opener").await? {
            if self.click_quietly(button).await? {
                debug!("Opened category menu");
            }
        }
        self.lookup_one(None, container, "category container").await
    }

    /// Immediate children of `parent` as rendered on the current page.
    pub async fn list_category_children(&self, parent: &CategoryNode) -> CrawlResult<Vec<CategoryNode>> {
        let container = self.category_container().await?;
        self.list_category_children_in(parent, container).await
    }

    /// Children found under an explicit container reference. A missing
    /// container yields an empty list.
    pub async fn list_category_children_in(
        &self,
        parent: &CategoryNode,
        container: Option<ElementRef>,
    ) -> CrawlResult<Vec<CategoryNode>> {
        let Some(container) = container else {
            return Ok(Vec::new());
        };

        let items = self
            .lookup_all(Some(container), &self.site.category_item, "category items")
            .await?;

        let mut children = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let Some(label) = self.item_label(item).await? else {
                continue;
            };
            let href = self.item_href(item).await?;
            children.push(parent.child(label, index, href));
        }

        debug!("Found {} child categories under {}", children.len(), parent.display_path());
        Ok(children)
    }

    /// Re-resolve a child's element after the page has been re-rendered.
    ///
    /// The recorded sibling index is tried first; if the label there no
    /// longer matches, the first sibling with the same label wins.
    pub async fn locate_child(&self, child: &CategoryNode) -> CrawlResult<Option<ElementRef>> {
        let Some(container) = self.category_container().await? else {
            return Ok(None);
        };
        let items = self
            .lookup_all(Some(container), &self.site.category_item, "category items")
            .await?;

        if let Some(&item) = items.get(child.index) {
            if self.item_label(item).await?.as_deref() == Some(child.label.as_str()) {
                return Ok(Some(item));
            }
        }

        for item in items {
            if self.item_label(item).await?.as_deref() == Some(child.label.as_str()) {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Whether a "load more" affordance is currently rendered.
    pub async fn has_load_more_control(&self) -> CrawlResult<bool> {
        match &self.site.load_more {
            Some(locator) => Ok(self.lookup_one(None, locator, "load more control").await?.is_some()),
            None => Ok(false),
        }
    }

    /// Activate the "load more" control and wait for the page to settle.
    pub async fn trigger_load_more(&self) -> CrawlResult<()> {
        let locator = self
            .site
            .load_more
            .as_ref()
            .ok_or_else(|| CrawlError::navigation("site has no load more control"))?;

        let control = self
            .lookup_one(None, locator, "load more control")
            .await?
            .ok_or_else(|| CrawlError::Timeout { what: "load more control".to_string() })?;

        self.scroll_into_view(control).await?;
        self.session.click(control).await?;
        self.settle().await;
        Ok(())
    }

    /// Reload the current listing ordered by `order`. False when the site
    /// has no sort parameter, the listing is already ordered or the reload failed.
    pub async fn apply_listing_sort(&self, order: &str) -> CrawlResult<bool> {
        let Some(param) = &self.site.sort_param else {
            return Ok(false);
        };
        let current = self.session.current_url().await?;
        let Some(sorted) = with_query_param(&current, param, order) else {
            return Ok(false);
        };

        match self.session.navigate_to(&sorted).await {
            Ok(()) => {
                info!("Listing ordered by {}", order);
                self.settle().await;
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Could not order listing by {}: {}", order, e);
                Ok(false)
            }
        }
    }

    /// Open a product's own page and read what the site's detail locators
    /// expose. Missing fields stay empty; the gallery yields at most
    /// `max_images` absolute URLs.
    pub async fn read_product_detail(&self, url: &str, max_images: usize) -> CrawlResult<ProductDetail> {
        let profile = self
            .site
            .detail
            .as_ref()
            .ok_or_else(|| CrawlError::config(format!("site '{}' has no product page locators", self.site.name)))?;

        self.session.navigate_to(url).await?;
        self.settle().await;

        if let Some(locator) = &profile.dismiss {
            if let Some(button) = self.field(None, locator).await? {
                self.click_quietly(button).await?;
            }
        }

        let title = match &profile.title {
            Some(locator) => match self.lookup_one(None, locator, "product title").await? {
                Some(element) => self.element_text(element).await?,
                None => None,
            },
            None => None,
        };
        let price = self
            .optional_field_text(None, profile.price.as_ref())
            .await?
            .and_then(|text| parse::parse_price(&text));
        let rating = self
            .optional_field_text(None, profile.rating.as_ref())
            .await?
            .map(|text| parse::parse_rating(&text).unwrap_or(text));
        let review_count = self
            .optional_field_text(None, profile.review_count.as_ref())
            .await?
            .and_then(|text| parse::parse_count(&text));

        let mut gallery = Vec::new();
        if let Some(locator) = profile.gallery_image.as_ref().filter(|_| max_images > 0) {
            if let Some(opener) = &profile.gallery_open {
                if let Some(button) = self.field(None, opener).await? {
                    self.click_quietly(button).await?;
                }
            }
            let images = match self.session.find_all(None, locator).await {
                Ok(images) => images,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(_) => Vec::new(),
            };
            for image in images {
                let src = match self.attribute(image, "src").await? {
                    Some(src) => Some(src),
                    None => self.attribute(image, "data-src").await?,
                };
                if let Some(src) = src.and_then(|src| resolve_link(&src, url)) {
                    if !gallery.contains(&src) {
                        gallery.push(src);
                    }
                }
                if gallery.len() >= max_images {
                    break;
                }
            }
        }

        debug!("Read product page {}", url);
        Ok(ProductDetail {
            url: url.to_string(),
            title,
            price,
            rating,
            review_count,
            gallery,
        })
    }

    /// Bring the browser back to `url` after leaving it. True once it shows that page again.
    pub async fn return_to(&self, url: &str) -> CrawlResult<bool> {
        if same_page(&self.session.current_url().await?, url) {
            return Ok(true);
        }
        match self.session.navigate_to(url).await {
            Ok(()) => {
                self.settle().await;
                Ok(same_page(&self.session.current_url().await?, url))
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Could not return to {}: {}", url, e);
                Ok(false)
            }
        }
    }

    /// Read one product card. Missing sub-elements leave the matching field
    /// empty; only a vanished card or a lost session is an error.
    pub async fn extract_product_card(&self, card: ElementRef, category_path: &[String]) -> CrawlResult<ProductRecord> {
        let raw_text = match &self.site.card_text {
            Some(locator) => match self.field_text(Some(card), locator).await? {
                Some(text) => text,
                None => self.session.get_text(card).await?,
            },
            None => self.session.get_text(card).await?,
        };
        let raw_text = raw_text.trim().to_string();

        let title = match self.optional_field_text(Some(card), self.site.card_title.as_ref()).await? {
            Some(title) => title,
            None => parse::first_line(&raw_text).unwrap_or_default(),
        };

        let price = match self.optional_field_text(Some(card), self.site.card_price.as_ref()).await? {
            Some(text) => parse::parse_price(&text).or_else(|| parse::parse_price(&raw_text)),
            None => parse::parse_price(&raw_text),
        };

        let original_price = match self.optional_field_text(Some(card), self.site.card_original_price.as_ref()).await? {
            Some(text) => parse::parse_price(&text),
            None => parse::parse_original_price(&raw_text),
        };

        let rating = match self.optional_field_text(Some(card), self.site.card_rating.as_ref()).await? {
            Some(text) => parse::parse_rating(&text).or(Some(text)),
            None => parse::parse_rating(&raw_text),
        };

        let source_url = match &self.site.card_link {
            Some(locator) => match self.field(Some(card), locator).await? {
                Some(link) => self.attribute(link, "href").await?,
                None => None,
            },
            None => None,
        };
        let source_url = match source_url {
            Some(url) => Some(url),
            None => self.attribute(card, "href").await?,
        };

        let mut image_urls = Vec::new();
        if let Some(locator) = &self.site.card_image {
            let images = match self.session.find_all(Some(card), locator).await {
                Ok(images) => images,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(_) => Vec::new(),
            };
            for image in images {
                let src = match self.attribute(image, "src").await? {
                    Some(src) => Some(src),
                    None => self.attribute(image, "data-src").await?,
                };
                if let Some(src) = src {
                    image_urls.push(src);
                }
            }
        }

        Ok(ProductRecord {
            title,
            price,
            original_price,
            sold_count: parse::parse_sold_count(&raw_text),
            rating,
            image_refs: Vec::new(),
            screenshot_path: None,
            category_path: category_path.to_vec(),
            source_url,
            image_urls,
            raw_text,
            detail: None,
        })
    }

    /// Bring an element into the viewport so lazy content renders.
    /// Failures other than a lost session are ignored.
    pub async fn scroll_into_view(&self, element: ElementRef) -> CrawlResult<()> {
        match self.session.scroll_into_view(element).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!("scroll into view failed: {}", e);
                Ok(())
            }
        }
    }

    /// Scroll to the bottom until the document stops growing. Returns the
    /// number of scroll rounds performed.
    pub async fn full_scroll(&self, max_rounds: usize) -> CrawlResult<usize> {
        let mut last_height = match self.script_number(SCROLL_HEIGHT_SCRIPT).await? {
            Some(height) => height,
            None => return Ok(0),
        };

        for round in 1..=max_rounds {
            self.script_number(SCROLL_TO_BOTTOM_SCRIPT).await?;
            self.settle().await;

            let height = self.script_number(SCROLL_HEIGHT_SCRIPT).await?.unwrap_or(last_height);
            if height <= last_height {
                return Ok(round);
            }
            last_height = height;
        }

        Ok(max_rounds)
    }

    /// Click the cookie consent button if the site shows one.
    pub async fn dismiss_cookie_banner(&self) -> CrawlResult<bool> {
        let Some(locator) = &self.site.cookie_accept else {
            return Ok(false);
        };
        let Some(button) = self.lookup_one(None, locator, "cookie banner").await? else {
            debug!("No cookie banner present");
            return Ok(false);
        };

        let dismissed = self.click_quietly(button).await?;
        if dismissed {
            info!("Dismissed cookie banner");
        }
        Ok(dismissed)
    }

    /// Click and settle. Failures other than a lost session only return false.
    async fn click_quietly(&self, element: ElementRef) -> CrawlResult<bool> {
        match self.session.click(element).await {
            Ok(()) => {
                self.settle().await;
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!("click failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn lookup_all(&self, scope: Option<ElementRef>, locator: &Locator, what: &str) -> CrawlResult<Vec<ElementRef>> {
        let found = self
            .retry
            .run(what, || async move {
                let elements = self.session.find_all(scope, locator).await?;
                Ok(if elements.is_empty() { None } else { Some(elements) })
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn lookup_one(&self, scope: Option<ElementRef>, locator: &Locator, what: &str) -> CrawlResult<Option<ElementRef>> {
        let found = self
            .retry
            .run(what, || async move {
                match self.session.find_one(scope, locator).await {
                    Ok(element) => Ok(Some(element)),
                    Err(BrowserError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(found)
    }

    /// Single-shot lookup under `scope`; absence is final.
    async fn field(&self, scope: Option<ElementRef>, locator: &Locator) -> CrawlResult<Option<ElementRef>> {
        match self.session.find_one(scope, locator).await {
            Ok(element) => Ok(Some(element)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn field_text(&self, scope: Option<ElementRef>, locator: &Locator) -> CrawlResult<Option<String>> {
        let Some(element) = self.field(scope, locator).await? else {
            return Ok(None);
        };
        self.element_text(element).await
    }

    async fn element_text(&self, element: ElementRef) -> CrawlResult<Option<String>> {
        match self.session.get_text(element).await {
            Ok(text) => {
                let text = text.trim().to_string();
                Ok(if text.is_empty() { None } else { Some(text) })
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn optional_field_text(&self, scope: Option<ElementRef>, locator: Option<&Locator>) -> CrawlResult<Option<String>> {
        match locator {
            Some(locator) => self.field_text(scope, locator).await,
            None => Ok(None),
        }
    }

    async fn attribute(&self, element: ElementRef, name: &str) -> CrawlResult<Option<String>> {
        match self.session.get_attribute(element, name).await {
            Ok(value) => Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn item_label(&self, item: ElementRef) -> CrawlResult<Option<String>> {
        match self.session.get_text(item).await {
            Ok(text) => Ok(parse::first_line(&text)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn item_href(&self, item: ElementRef) -> CrawlResult<Option<String>> {
        if let Some(href) = self.attribute(item, "href").await? {
            return Ok(Some(href));
        }
        match self.field(Some(item), &Locator::css("a")).await? {
            Some(anchor) => self.attribute(anchor, "href").await,
            None => Ok(None),
        }
    }

    async fn script_number(&self, script: &str) -> CrawlResult<Option<f64>> {
        match self.session.execute_script(script, &[]).await {
            Ok(value) => Ok(value.as_f64()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                debug!("script failed: {}", e);
                Ok(None)
            }
        }
    }
}
