//! Binding of semantic page roles to concrete locators.
//!
//! The walker and extractor only talk about roles (category container,
//! product card, "load more" control). Which CSS class or XPath expression
//! implements a role on a given marketplace lives here, so selector churn
//! never touches traversal logic.

use serde::{Deserialize, Serialize};

use crate::browser::Locator;

/// Locators for one marketplace layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    /// Element wrapping the child category entries of the current node.
    pub category_container: Locator,
    /// A child category entry, relative to the container.
    pub category_item: Locator,
    /// A product card on a listing page.
    pub product_card: Locator,
    /// Sub-element holding the card's text block; the whole card when absent.
    #[serde(default)]
    pub card_text: Option<Locator>,
    #[serde(default)]
    pub card_title: Option<Locator>,
    #[serde(default)]
    pub card_price: Option<Locator>,
    #[serde(default)]
    pub card_original_price: Option<Locator>,
    #[serde(default)]
    pub card_rating: Option<Locator>,
    #[serde(default)]
    pub card_image: Option<Locator>,
    #[serde(default)]
    pub card_link: Option<Locator>,
    #[serde(default)]
    pub load_more: Option<Locator>,
    #[serde(default)]
    pub cookie_accept: Option<Locator>,
    /// Control that unfolds the category menu when it starts collapsed.
    #[serde(default)]
    pub menu_open: Option<Locator>,
    /// Query parameter selecting the listing order, e.g. `sst` on Trendyol.
    #[serde(default)]
    pub sort_param: Option<String>,
    #[serde(default)]
    pub detail: Option<DetailProfile>,
}

/// Locators on a single product's page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailProfile {
    /// Overlay clicked away before reading, such as a location prompt.
    pub dismiss: Option<Locator>,
    pub title: Option<Locator>,
    pub price: Option<Locator>,
    pub rating: Option<Locator>,
    pub review_count: Option<Locator>,
    /// Opens the image gallery when images only render inside it.
    pub gallery_open: Option<Locator>,
    pub gallery_image: Option<Locator>,
}

const TRENDYOL_DETAIL_INFO: &str = "//*[@id='product-detail-app']/div/div[2]/div/div[2]/div[2]/div/div[1]";

impl SiteProfile {
    /// eBay browse pages: flyout category navigation and list-style cards.
    pub fn ebay() -> Self {
        Self {
            name: "ebay".to_string(),
            category_container: Locator::css("section.b-module.b-list.b-speciallinks, #vl-flyout-nav"),
            category_item: Locator::css("ul > li"),
            product_card: Locator::css("li.brwrvr__item-card.brwrvr__item-card--list"),
            card_text: Some(Locator::xpath("./div/div/div[2]")),
            card_title: Some(Locator::css("h3.textual-display.bsig__title__text, .s-item__title")),
            card_price: Some(Locator::css("span.textual-display.bsig__price, span.s-item__price")),
            card_original_price: Some(Locator::css("span.textual-display.strikethrough, span.STRIKETHROUGH")),
            card_rating: Some(Locator::css("span.clipped, .x-star-rating")),
            card_image: Some(Locator::css("img")),
            card_link: Some(Locator::css("a")),
            load_more: Some(Locator::css("button.brw-pagination__show-more, a.pagination__next")),
            cookie_accept: Some(Locator::css("#gdpr-banner-accept")),
            menu_open: None,
            sort_param: None,
            detail: None,
        }
    }

    /// Trendyol listing pages: navigation wrapper menus and product grid.
    pub fn trendyol() -> Self {
        Self {
            name: "trendyol".to_string(),
            category_container: Locator::xpath("//*[@id='navigation-wrapper']/nav/div/div/div/div[2]"),
            category_item: Locator::xpath("./div/div/ul/li | ./div/div[1]/div"),
            product_card: Locator::css("div.p-card-wrppr"),
            card_text: None,
            card_title: Some(Locator::css("span.prdct-desc-cntnr-name, h3")),
            card_price: Some(Locator::css("div.prc-box-dscntd, span.prc-dsc")),
            card_original_price: Some(Locator::css("div.prc-box-orgnl")),
            card_rating: Some(Locator::css("span.rating-score, span.pr-rnr-sm-p")),
            card_image: Some(Locator::css("img.p-card-img")),
            card_link: Some(Locator::css("a")),
            load_more: None,
            cookie_accept: Some(Locator::css("#onetrust-accept-btn-handler")),
            menu_open: Some(Locator::xpath("/html/body/div[1]/div[2]/div/div/div[1]/nav/div/div/div/div")),
            sort_param: Some("sst".to_string()),
            detail: Some(Self::trendyol_detail()),
        }
    }

    /// Trendyol product pages render two layouts; each field unions both.
    fn trendyol_detail() -> DetailProfile {
        let info = |a: &str, b: &str| Locator::xpath(format!("{info}{a} | {info}{b}", info = TRENDYOL_DETAIL_INFO));
        DetailProfile {
            dismiss: Some(Locator::xpath(format!(
                "{}/aside/div/div/div[2]/div/div[2]/div/div/button",
                TRENDYOL_DETAIL_INFO
            ))),
            title: Some(info("/div[2]/div/div/div[1]/h1", "/div[1]/div/div/div[1]/h1")),
            price: Some(info("/div[2]/div/div/div[3]", "/div[1]/div/div/div[3]")),
            rating: Some(info(
                "/div[1]/div/div/div[2]/div/div[1]/div/div[1]/div/div[1]",
                "/div[2]/div/div/div[2]/div/div[1]/div/div[1]/div/div[1]",
            )),
            review_count: Some(info("/div[1]/div/div/div[2]/div/div[3]", "/div[2]/div/div/div[2]/div/div[3]")),
            gallery_open: Some(Locator::xpath("//*[@id='product-detail-app']/div/div[2]/div/div[2]/div[1]/div")),
            gallery_image: Some(Locator::css("#product-detail-app div.gallery-modal > div > img")),
        }
    }

    /// Amazon search/browse result pages.
    pub fn amazon() -> Self {
        Self {
            name: "amazon".to_string(),
            category_container: Locator::css("#departments ul, #s-refinements div[role='navigation']"),
            category_item: Locator::css("li"),
            product_card: Locator::css("div.s-result-item[data-asin]:not([data-asin=''])"),
            card_text: None,
            card_title: Some(Locator::css("h2 span")),
            card_price: Some(Locator::css("span.a-price > span.a-offscreen")),
            card_original_price: Some(Locator::css("span.a-price.a-text-price > span.a-offscreen")),
            card_rating: Some(Locator::css("span.a-icon-alt")),
            card_image: Some(Locator::css("img.s-image")),
            card_link: Some(Locator::css("h2 a, a.a-link-normal")),
            load_more: Some(Locator::css("a.s-pagination-next")),
            cookie_accept: Some(Locator::css("#sp-cc-accept")),
            menu_open: None,
            sort_param: None,
            detail: None,
        }
    }

    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ebay" => Some(Self::ebay()),
            "trendyol" => Some(Self::trendyol()),
            "amazon" => Some(Self::amazon()),
            _ => None,
        }
    }

    /// Names of the built-in profiles.
    pub fn builtin_names() -> &'static [&'static str] {
        &["ebay", "trendyol", "amazon"]
    }
}
