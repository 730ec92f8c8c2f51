//! Browser session collaborator.
//!
//! The crawler never launches or closes a browser. It is handed a live
//! session and drives it through [`BrowserSession`]. Element handles are
//! opaque [`ElementRef`] ids that may go stale whenever the page re-renders
//! or navigates.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[cfg(feature = "browser")]
pub mod playwright;

/// Opaque handle to an element owned by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementRef(pub u64);

/// How to locate elements on a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Self::XPath(expression.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Css(s) | Self::XPath(s) => s,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={}", s),
            Self::XPath(s) => write!(f, "xpath={}", s),
        }
    }
}

/// Failures reported by a browser session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("element not found: {0}")]
    NotFound(String),

    #[error("stale element reference")]
    Stale,

    #[error("click intercepted: {0}")]
    ClickIntercepted(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script failed: {0}")]
    Script(String),

    #[error("browser session disconnected: {0}")]
    Disconnected(String),

    #[error("browser error: {0}")]
    Other(String),
}

impl BrowserError {
    /// The session is unusable; nothing after this can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Element not rendered yet, or detached by a re-render.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Stale)
    }
}

/// Operations the crawler needs from a controlled browser tab.
///
/// All calls act on the single active page. `scope` restricts a lookup to
/// descendants of an element; `None` searches the whole document.
#[async_trait(?Send)]
pub trait BrowserSession {
    async fn navigate_to(&self, url: &str) -> Result<(), BrowserError>;

    async fn go_back(&self) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn find_one(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<ElementRef, BrowserError>;

    /// An empty vector is a normal answer, not an error.
    async fn find_all(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<Vec<ElementRef>, BrowserError>;

    async fn click(&self, element: ElementRef) -> Result<(), BrowserError>;

    async fn get_text(&self, element: ElementRef) -> Result<String, BrowserError>;

    async fn get_attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>, BrowserError>;

    /// Run a script in the page. Elements in `args` are exposed to the
    /// script as `arguments[0..]`.
    async fn execute_script(&self, script: &str, args: &[ElementRef]) -> Result<serde_json::Value, BrowserError>;

    /// PNG bytes of the element's bounding box.
    async fn screenshot(&self, element: ElementRef) -> Result<Vec<u8>, BrowserError>;

    async fn scroll_into_view(&self, element: ElementRef) -> Result<(), BrowserError> {
        self.execute_script(
            "arguments[0].scrollIntoView({block: 'center', inline: 'nearest'});",
            &[element],
        )
        .await
        .map(|_| ())
    }
}

/// Native element handles behind [`ElementRef`] ids, valid for one document.
///
/// A session calls [`observe`](Self::observe) with the page URL before every
/// lookup; once the URL differs from the last one seen, every outstanding
/// handle is dropped and resolves as [`BrowserError::Stale`]. This covers
/// navigations the session did not start itself, such as a click on a link.
pub struct HandleRegistry<H> {
    document: Mutex<Option<String>>,
    handles: DashMap<u64, Arc<H>>,
    next_id: AtomicU64,
}

impl<H> HandleRegistry<H> {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(None),
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Note the URL the page currently shows. True when it changed and the
    /// registry was emptied.
    pub fn observe(&self, url: &str) -> bool {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        if document.as_deref() == Some(url) {
            return false;
        }
        let changed = document.is_some();
        *document = Some(url.to_string());
        if changed {
            self.handles.clear();
        }
        changed
    }

    pub fn register(&self, handle: H) -> ElementRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(id, Arc::new(handle));
        ElementRef(id)
    }

    pub fn get(&self, element: ElementRef) -> Result<Arc<H>, BrowserError> {
        self.handles
            .get(&element.0)
            .map(|handle| Arc::clone(handle.value()))
            .ok_or(BrowserError::Stale)
    }

    /// Drop every handle; the next observed URL starts a fresh document.
    pub fn clear(&self) {
        self.handles.clear();
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<H> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
