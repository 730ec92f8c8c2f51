//! Scripted browser and in-memory persistence for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserError, BrowserSession, ElementRef, Locator};
use crate::models::{ProductBatch, ProductRecord};
use crate::probe::{PageProbe, RetryPolicy};
use crate::site::{DetailProfile, SiteProfile};
use crate::storage::{MediaKind, Persistence, StorageError};

/// Locators matching the markup [`MockBrowser`] pretends to render.
pub fn test_site() -> SiteProfile {
    SiteProfile {
        name: "mock".to_string(),
        category_container: Locator::css("nav.categories"),
        category_item: Locator::css("li.category"),
        product_card: Locator::css("li.card"),
        card_text: None,
        card_title: Some(Locator::css(".title")),
        card_price: Some(Locator::css(".price")),
        card_original_price: Some(Locator::css(".was")),
        card_rating: Some(Locator::css(".rating")),
        card_image: Some(Locator::css("img")),
        card_link: Some(Locator::css("a")),
        load_more: Some(Locator::css("button.load-more")),
        cookie_accept: Some(Locator::css("#accept")),
        menu_open: Some(Locator::css("button.all-categories")),
        sort_param: Some("sort".to_string()),
        detail: Some(DetailProfile {
            dismiss: Some(Locator::css("#skip-location")),
            title: Some(Locator::css(".pd-title")),
            price: Some(Locator::css(".pd-price")),
            rating: Some(Locator::css(".pd-rating")),
            review_count: Some(Locator::css(".pd-reviews")),
            gallery_open: Some(Locator::css(".gallery-open")),
            gallery_image: Some(Locator::css(".gallery img")),
        }),
    }
}

/// Probe over `browser` with instant retries and no settle delay.
pub fn test_probe(browser: &MockBrowser) -> PageProbe {
    PageProbe::new(Arc::new(browser.clone()), test_site(), RetryPolicy::no_wait(3), Duration::ZERO)
}

#[derive(Debug, Clone, Default)]
pub struct MockCard {
    title: Option<String>,
    body: Option<String>,
    price: Option<String>,
    was: Option<String>,
    rating: Option<String>,
    lines: Vec<String>,
    images: Vec<String>,
    link: Option<String>,
}

impl MockCard {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// A card with no sub-elements at all, only a text block.
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            body: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    pub fn was(mut self, price: impl Into<String>) -> Self {
        self.was = Some(price.into());
        self
    }

    pub fn rating(mut self, rating: impl Into<String>) -> Self {
        self.rating = Some(rating.into());
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }

    pub fn link(mut self, url: impl Into<String>) -> Self {
        self.link = Some(url.into());
        self
    }

    fn text(&self) -> String {
        if let Some(body) = &self.body {
            return body.clone();
        }
        [&self.title, &self.price, &self.was, &self.rating]
            .into_iter()
            .flatten()
            .chain(self.lines.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn field(&self, field: CardField) -> Option<String> {
        match field {
            CardField::Title => self.title.clone(),
            CardField::Price => self.price.clone(),
            CardField::Was => self.was.clone(),
            CardField::Rating => self.rating.clone(),
            CardField::Link => self.link.as_ref().map(|_| String::new()),
        }
    }
}

/// A product's own page.
#[derive(Debug, Clone, Default)]
pub struct MockDetail {
    title: Option<String>,
    price: Option<String>,
    rating: Option<String>,
    reviews: Option<String>,
    images: Vec<String>,
    location_prompt: bool,
}

impl MockDetail {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn price(mut self, price: impl Into<String>) -> Self {
        self.price = Some(price.into());
        self
    }

    pub fn rating(mut self, rating: impl Into<String>) -> Self {
        self.rating = Some(rating.into());
        self
    }

    pub fn reviews(mut self, reviews: impl Into<String>) -> Self {
        self.reviews = Some(reviews.into());
        self
    }

    /// Gallery image, rendered only once the gallery is opened.
    pub fn image(mut self, src: impl Into<String>) -> Self {
        self.images.push(src.into());
        self
    }

    /// The title stays hidden behind a prompt until it is clicked away.
    pub fn location_prompt(mut self) -> Self {
        self.location_prompt = true;
        self
    }

    fn field(&self, field: DetailField) -> Option<String> {
        match field {
            DetailField::Title => self.title.clone(),
            DetailField::Price => self.price.clone(),
            DetailField::Rating => self.rating.clone(),
            DetailField::Reviews => self.reviews.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockPage {
    categories: Vec<(String, String)>,
    cards: Vec<MockCard>,
    reveals: Vec<Vec<MockCard>>,
    cookie_banner: bool,
    collapsed_menu: bool,
    detail: Option<MockDetail>,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child category entry whose text is `text` and which links to `href`.
    pub fn category(mut self, text: impl Into<String>, href: impl Into<String>) -> Self {
        self.categories.push((text.into(), href.into()));
        self
    }

    pub fn card(mut self, card: MockCard) -> Self {
        self.cards.push(card);
        self
    }

    pub fn cards(mut self, cards: impl IntoIterator<Item = MockCard>) -> Self {
        self.cards.extend(cards);
        self
    }

    /// Cards revealed by one press of "load more".
    pub fn load_more_batch(mut self, cards: impl IntoIterator<Item = MockCard>) -> Self {
        self.reveals.push(cards.into_iter().collect());
        self
    }

    pub fn cookie_banner(mut self) -> Self {
        self.cookie_banner = true;
        self
    }

    /// Categories render only after the menu opener is clicked.
    pub fn collapsed_menu(mut self) -> Self {
        self.collapsed_menu = true;
        self
    }

    pub fn detail(mut self, detail: MockDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardField {
    Title,
    Price,
    Was,
    Rating,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailField {
    Title,
    Price,
    Rating,
    Reviews,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Container,
    MenuOpener,
    Category(usize),
    Card(usize),
    Field(usize, CardField),
    Image(usize, usize),
    LoadMore,
    Cookie,
    Prompt,
    Detail(DetailField),
    GalleryOpener,
    GalleryImage(usize),
}

#[derive(Default)]
struct MockState {
    pages: HashMap<String, MockPage>,
    history: Vec<String>,
    navigations: Vec<String>,
    generation: u64,
    next_id: u64,
    elements: HashMap<u64, (u64, Node)>,
    revealed: usize,
    cookie_dismissed: HashSet<String>,
    hidden_card_lookups: usize,
    failing_clicks: HashSet<String>,
    stale_cards: HashSet<usize>,
    disconnected: bool,
    clicks: usize,
    disconnect_after_clicks: Option<usize>,
    scroll_growth: usize,
    scroll_rounds: usize,
    broken_back: bool,
    cancel_on_load_more: Option<CancellationToken>,
    menu_open: bool,
    gallery_open: bool,
    prompt_dismissed: bool,
}

impl MockState {
    fn current(&self) -> String {
        self.history.last().cloned().unwrap_or_else(|| "about:blank".to_string())
    }

    /// The scripted page for the current URL; a query string alone does not change the page.
    fn page(&self) -> MockPage {
        let current = self.current();
        let without_query = current.split('?').next().unwrap_or_default();
        self.pages
            .get(&current)
            .or_else(|| self.pages.get(without_query))
            .cloned()
            .unwrap_or_default()
    }

    fn visible_cards(&self) -> Vec<MockCard> {
        let page = self.page();
        let mut cards = page.cards.clone();
        for batch in page.reveals.iter().take(self.revealed) {
            cards.extend(batch.iter().cloned());
        }
        cards
    }

    fn load(&mut self, url: &str) {
        self.history.push(url.to_string());
        self.navigations.push(url.to_string());
        self.rerender();
    }

    fn rerender(&mut self) {
        self.generation += 1;
        self.revealed = 0;
        self.scroll_rounds = 0;
        self.menu_open = false;
        self.gallery_open = false;
        self.prompt_dismissed = false;
    }

    fn register(&mut self, node: Node) -> ElementRef {
        self.next_id += 1;
        self.elements.insert(self.next_id, (self.generation, node));
        ElementRef(self.next_id)
    }

    fn resolve(&self, element: ElementRef) -> Result<Node, BrowserError> {
        match self.elements.get(&element.0) {
            Some((generation, node)) if *generation == self.generation => Ok(*node),
            _ => Err(BrowserError::Stale),
        }
    }

    fn alive(&self) -> Result<(), BrowserError> {
        if self.disconnected {
            Err(BrowserError::Disconnected("mock session closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn query(&mut self, scope: Option<Node>, selector: &str) -> Vec<Node> {
        let page = self.page();
        match (scope, selector) {
            (None, "li.card") => {
                if self.hidden_card_lookups > 0 {
                    self.hidden_card_lookups -= 1;
                    return Vec::new();
                }
                (0..self.visible_cards().len()).map(Node::Card).collect()
            }
            (None, "nav.categories") if !page.categories.is_empty() && (!page.collapsed_menu || self.menu_open) => {
                vec![Node::Container]
            }
            (None, "button.all-categories") if page.collapsed_menu && !self.menu_open => vec![Node::MenuOpener],
            (Some(Node::Container), "li.category") => (0..page.categories.len()).map(Node::Category).collect(),
            (None, "button.load-more") if self.revealed < page.reveals.len() => vec![Node::LoadMore],
            (None, "#accept") if page.cookie_banner && !self.cookie_dismissed.contains(&self.current()) => {
                vec![Node::Cookie]
            }
            (None, "#skip-location") if page.detail.as_ref().is_some_and(|d| d.location_prompt) && !self.prompt_dismissed => {
                vec![Node::Prompt]
            }
            (None, ".gallery-open") if page.detail.as_ref().is_some_and(|d| !d.images.is_empty()) => {
                vec![Node::GalleryOpener]
            }
            (None, ".gallery img") if self.gallery_open => {
                let count = page.detail.map(|d| d.images.len()).unwrap_or_default();
                (0..count).map(Node::GalleryImage).collect()
            }
            (None, detail_selector) if page.detail.is_some() => {
                let field = match detail_selector {
                    ".pd-title" if page.detail.as_ref().is_some_and(|d| d.location_prompt) && !self.prompt_dismissed => {
                        return Vec::new()
                    }
                    ".pd-title" => DetailField::Title,
                    ".pd-price" => DetailField::Price,
                    ".pd-rating" => DetailField::Rating,
                    ".pd-reviews" => DetailField::Reviews,
                    _ => return Vec::new(),
                };
                page.detail
                    .and_then(|d| d.field(field))
                    .map(|_| vec![Node::Detail(field)])
                    .unwrap_or_default()
            }
            (Some(Node::Card(i)), field_selector) => {
                let Some(card) = self.visible_cards().get(i).cloned() else {
                    return Vec::new();
                };
                let field = match field_selector {
                    ".title" => CardField::Title,
                    ".price" => CardField::Price,
                    ".was" => CardField::Was,
                    ".rating" => CardField::Rating,
                    "a" => CardField::Link,
                    "img" => return (0..card.images.len()).map(|j| Node::Image(i, j)).collect(),
                    _ => return Vec::new(),
                };
                card.field(field).map(|_| vec![Node::Field(i, field)]).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }
}

/// A scripted multi-page site. Clones share state, so a test can keep a
/// handle while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockBrowser {
    state: Arc<Mutex<MockState>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: impl Into<String>, page: MockPage) -> Self {
        self.state.lock().unwrap().pages.insert(url.into(), page);
        self
    }

    /// Load `url` directly, invalidating outstanding handles.
    pub fn goto(&self, url: &str) {
        self.state.lock().unwrap().load(url);
    }

    pub fn current(&self) -> String {
        self.state.lock().unwrap().current()
    }

    /// Every URL loaded so far, including history steps.
    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    /// Product lookups return nothing for the next `n` attempts.
    pub fn hide_cards_for_lookups(&self, n: usize) {
        self.state.lock().unwrap().hidden_card_lookups = n;
    }

    /// Clicks on the load-more control (by its selector) or on a category
    /// (by its label) are intercepted.
    pub fn fail_clicks_on(&self, target: &str) {
        self.state.lock().unwrap().failing_clicks.insert(target.to_string());
    }

    pub fn stale_text_for_card(&self, index: usize) {
        self.state.lock().unwrap().stale_cards.insert(index);
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
    }

    /// The session dies right after the `n`th successful click.
    pub fn disconnect_after_clicks(&self, n: usize) {
        self.state.lock().unwrap().disconnect_after_clicks = Some(n);
    }

    /// The document grows on each of the next `n` scrolls to the bottom.
    pub fn grow_page_for_scrolls(&self, n: usize) {
        self.state.lock().unwrap().scroll_growth = n;
    }

    /// Fire `token` as soon as a "load more" press has revealed its cards.
    pub fn cancel_on_load_more(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_load_more = Some(token);
    }

    /// History navigation lands on a blank page instead of the previous one.
    pub fn break_back_navigation(&self) {
        self.state.lock().unwrap().broken_back = true;
    }
}

#[async_trait(?Send)]
impl BrowserSession for MockBrowser {
    async fn navigate_to(&self, url: &str) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.alive()?;
        state.load(url);
        Ok(())
    }

    async fn go_back(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.alive()?;
        state.history.pop();
        if state.broken_back || state.history.is_empty() {
            state.history.push("about:blank".to_string());
        }
        let current = state.current();
        state.navigations.push(current);
        state.rerender();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        state.alive()?;
        Ok(state.current())
    }

    async fn find_one(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<ElementRef, BrowserError> {
        self.find_all(scope, locator)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BrowserError::NotFound(locator.to_string()))
    }

    async fn find_all(&self, scope: Option<ElementRef>, locator: &Locator) -> Result<Vec<ElementRef>, BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.alive()?;
        let scope = scope.map(|element| state.resolve(element)).transpose()?;
        let nodes = state.query(scope, locator.as_str());
        Ok(nodes.into_iter().map(|node| state.register(node)).collect())
    }

    async fn click(&self, element: ElementRef) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.alive()?;
        let node = state.resolve(element)?;
        let page = state.page();

        match node {
            Node::LoadMore => {
                if state.failing_clicks.contains("button.load-more") {
                    return Err(BrowserError::ClickIntercepted("overlay".to_string()));
                }
                state.revealed += 1;
                if let Some(token) = &state.cancel_on_load_more {
                    token.cancel();
                }
            }
            Node::Category(i) => {
                let (text, href) = page.categories[i].clone();
                let label = text.lines().next().unwrap_or_default().trim().to_string();
                if state.failing_clicks.contains(&label) {
                    return Err(BrowserError::ClickIntercepted(label));
                }
                state.load(&href);
            }
            Node::Cookie => {
                let current = state.current();
                state.cookie_dismissed.insert(current);
            }
            Node::MenuOpener => state.menu_open = true,
            Node::GalleryOpener => state.gallery_open = true,
            Node::Prompt => state.prompt_dismissed = true,
            _ => {}
        }

        state.clicks += 1;
        if state.disconnect_after_clicks.is_some_and(|n| state.clicks >= n) {
            state.disconnected = true;
        }
        Ok(())
    }

    async fn get_text(&self, element: ElementRef) -> Result<String, BrowserError> {
        let state = self.state.lock().unwrap();
        state.alive()?;
        let cards = state.visible_cards();
        Ok(match state.resolve(element)? {
            Node::Category(i) => state.page().categories[i].0.clone(),
            Node::Card(i) if state.stale_cards.contains(&i) => return Err(BrowserError::Stale),
            Node::Card(i) => cards[i].text(),
            Node::Field(i, field) => cards[i].field(field).unwrap_or_default(),
            Node::LoadMore => "Load more".to_string(),
            Node::Cookie => "Accept all".to_string(),
            Node::Detail(field) => state.page().detail.and_then(|d| d.field(field)).unwrap_or_default(),
            Node::MenuOpener => "All categories".to_string(),
            Node::Container | Node::Image(..) | Node::Prompt | Node::GalleryOpener | Node::GalleryImage(_) => {
                String::new()
            }
        })
    }

    async fn get_attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>, BrowserError> {
        let state = self.state.lock().unwrap();
        state.alive()?;
        let cards = state.visible_cards();
        Ok(match (state.resolve(element)?, name) {
            (Node::Category(i), "href") => Some(state.page().categories[i].1.clone()),
            (Node::Field(i, CardField::Link), "href") => cards[i].link.clone(),
            (Node::Image(i, j), "src") => Some(cards[i].images[j].clone()),
            (Node::GalleryImage(j), "src") => state.page().detail.map(|d| d.images[j].clone()),
            _ => None,
        })
    }

    async fn execute_script(&self, script: &str, args: &[ElementRef]) -> Result<serde_json::Value, BrowserError> {
        let mut state = self.state.lock().unwrap();
        state.alive()?;
        for arg in args {
            state.resolve(*arg)?;
        }

        if script.contains("scrollTo") {
            state.scroll_rounds += 1;
            return Ok(serde_json::Value::Null);
        }
        if script.contains("scrollHeight") {
            let grown = state.scroll_rounds.min(state.scroll_growth);
            return Ok(serde_json::json!(1000 + 500 * grown));
        }
        Ok(serde_json::Value::Null)
    }

    async fn screenshot(&self, element: ElementRef) -> Result<Vec<u8>, BrowserError> {
        let state = self.state.lock().unwrap();
        state.alive()?;
        state.resolve(element)?;
        Ok(b"\x89PNG mock".to_vec())
    }
}

/// Persistence that keeps everything in memory.
#[derive(Default)]
pub struct MemoryPersistence {
    batches: Mutex<Vec<ProductBatch>>,
    media: Mutex<Vec<String>>,
    failing: bool,
}

impl MemoryPersistence {
    /// Every write fails with an I/O error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<ProductBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn media(&self) -> Vec<String> {
        self.media.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing {
            Err(StorageError::Io {
                path: PathBuf::from("/dev/full"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn write_batch(
        &self,
        category_path: &[String],
        records: &[ProductRecord],
        timestamp_key: &str,
    ) -> Result<PathBuf, StorageError> {
        self.check()?;
        let mut batches = self.batches.lock().unwrap();
        batches.push(ProductBatch {
            category_path: category_path.to_vec(),
            records: records.to_vec(),
        });
        Ok(PathBuf::from(category_path.join("/")).join(format!("products_{}_{}.json", timestamp_key, batches.len())))
    }

    async fn write_media(
        &self,
        _category_path: &[String],
        product_key: &str,
        index: usize,
        kind: MediaKind,
        _bytes: &[u8],
    ) -> Result<String, StorageError> {
        self.check()?;
        let relative = format!("{}/{}", product_key, kind.file_name(index));
        self.media.lock().unwrap().push(relative.clone());
        Ok(relative)
    }
}
