use async_trait::async_trait;
use playwright::api::{Browser, BrowserContext, ElementHandle, Page, Viewport};
use playwright::Playwright;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BrowserError, BrowserSession, ElementRef, HandleRegistry, Locator};
use crate::config::BrowserConfig;

/// Browser session backed by a Playwright-driven Chromium tab.
///
/// Element handles are kept in a registry keyed by [`ElementRef`] so the
/// crawler can pass plain ids around. Handles are dropped on navigation and
/// whenever a lookup finds the page on a different URL.
pub struct PlaywrightSession {
    _playwright: Playwright,
    browser: Browser,
    _context: BrowserContext,
    page: Page,
    elements: HandleRegistry<ElementHandle>,
}

impl PlaywrightSession {
    /// Launch Chromium and open a single page.
    pub async fn launch(config: &BrowserConfig) -> Result<Self, BrowserError> {
        debug!("Launching Chromium (headless: {})", config.headless);

        let playwright = Playwright::initialize().await.map_err(classify)?;
        playwright.prepare().map_err(|e| BrowserError::Other(e.to_string()))?;

        let browser = playwright
            .chromium()
            .launcher()
            .headless(config.headless)
            .launch()
            .await
            .map_err(classify)?;

        let context = browser
            .context_builder()
            .user_agent(&config.user_agent)
            .viewport(Some(Viewport {
                width: config.viewport_width,
                height: config.viewport_height,
            }))
            .build()
            .await
            .map_err(classify)?;

        let page = context.new_page().await.map_err(classify)?;
        page.set_default_timeout(config.timeout_ms);

        Ok(Self {
            _playwright: playwright,
            browser,
            _context: context,
            page,
            elements: HandleRegistry::new(),
        })
    }

    /// Close the browser. Errors are logged and swallowed.
    pub async fn close(self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
    }

    fn handle(&self, element: ElementRef) -> Result<Arc<ElementHandle>, BrowserError> {
        self.elements.get(element)
    }

    /// Invalidate handles if the page moved on since the last lookup.
    fn observe_document(&self) -> Result<(), BrowserError> {
        let url = self.page.url().map_err(classify)?;
        if self.elements.observe(&url) {
            debug!("Page changed to {}, element handles dropped", url);
        }
        Ok(())
    }

    fn selector(locator: &Locator) -> String {
        match locator {
            Locator::Css(s) => s.clone(),
            Locator::XPath(s) => format!("xpath={}", s),
        }
    }
}

#[async_trait(?Send)]
impl BrowserSession for PlaywrightSession {
    async fn navigate_to(&self, url: &str) -> Result<(), BrowserError> {
        self.elements.clear();
        self.page
            .goto_builder(url)
            .goto()
            .await
            .map_err(|e| match classify(e) {
                BrowserError::Other(message) => BrowserError::Navigation(message),
                other => other,
            })?;
        Ok(())
    }

    async fn go_back(&self) -> Result<(), BrowserError> {
        self.elements.clear();
        self.page
            .go_back_builder()
            .go_back()
            .await
            .map_err(|e| match classify(e) {
                BrowserError::Other(message) => BrowserError::Navigation(message),
                other => other,
            })?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.page.url().map_err(classify)
    }

    async fn find_one(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<ElementRef, BrowserError> {
        self.observe_document()?;
        let selector = Self::selector(locator);
        let found = match scope {
            Some(parent) => {
                let parent = self.handle(parent)?;
                parent.query_selector(&selector).await.map_err(classify)?
            }
            None => self.page.query_selector(&selector).await.map_err(classify)?,
        };
        found
            .map(|handle| self.elements.register(handle))
            .ok_or_else(|| BrowserError::NotFound(locator.to_string()))
    }

    async fn find_all(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<Vec<ElementRef>, BrowserError> {
        self.observe_document()?;
        let selector = Self::selector(locator);
        let handles = match scope {
            Some(parent) => {
                let parent = self.handle(parent)?;
                parent.query_selector_all(&selector).await.map_err(classify)?
            }
            None => self.page.query_selector_all(&selector).await.map_err(classify)?,
        };
        Ok(handles.into_iter().map(|handle| self.elements.register(handle)).collect())
    }

    async fn click(&self, element: ElementRef) -> Result<(), BrowserError> {
        let handle = self.handle(element)?;
        handle.click_builder().click().await.map_err(|e| match classify(e) {
            BrowserError::Other(message) => BrowserError::ClickIntercepted(message),
            other => other,
        })
    }

    async fn get_text(&self, element: ElementRef) -> Result<String, BrowserError> {
        let handle = self.handle(element)?;
        handle.inner_text().await.map_err(classify)
    }

    async fn get_attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>, BrowserError> {
        let handle = self.handle(element)?;
        handle.get_attribute(name).await.map_err(classify)
    }

    async fn execute_script(&self, script: &str, args: &[ElementRef]) -> Result<serde_json::Value, BrowserError> {
        if !args.is_empty() {
            return Err(BrowserError::Script(
                "element arguments are not supported by this session".to_string(),
            ));
        }
        let wrapped = format!("() => {{ {} }}", script);
        self.page
            .evaluate::<(), serde_json::Value>(&wrapped, ())
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))
    }

    async fn screenshot(&self, element: ElementRef) -> Result<Vec<u8>, BrowserError> {
        let handle = self.handle(element)?;
        handle.screenshot_builder().screenshot().await.map_err(classify)
    }

    async fn scroll_into_view(&self, element: ElementRef) -> Result<(), BrowserError> {
        let handle = self.handle(element)?;
        handle.scroll_into_view_if_needed(None).await.map_err(classify)
    }
}

/// Map a Playwright error onto the crawler's browser taxonomy.
fn classify(err: impl std::fmt::Display) -> BrowserError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("target closed") || lower.contains("browser has been closed") || lower.contains("connection closed") {
        BrowserError::Disconnected(message)
    } else if lower.contains("not attached") || lower.contains("detached") {
        BrowserError::Stale
    } else if lower.contains("intercept") {
        BrowserError::ClickIntercepted(message)
    } else if lower.contains("timeout") {
        BrowserError::NotFound(message)
    } else {
        BrowserError::Other(message)
    }
}
