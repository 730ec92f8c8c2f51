//! Data carried between the walker, the extractor and persistence.

use serde::{Deserialize, Serialize};

/// Labels from the taxonomy root down to a node.
pub type CategoryPath = Vec<String>;

/// One entry of the category tree as currently rendered.
///
/// Nodes are rebuilt from the live page on every visit and are never
/// persisted on their own. `path.len() == depth + 1` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub label: String,
    pub depth: usize,
    pub path: CategoryPath,
    /// Position among the siblings returned by the probe.
    pub index: usize,
    pub href: Option<String>,
}

impl CategoryNode {
    /// Create the root node of a traversal.
    pub fn root(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            path: vec![label.clone()],
            label,
            depth: 0,
            index: 0,
            href: None,
        }
    }

    /// Create a child of `self` at sibling position `index`.
    pub fn child(&self, label: impl Into<String>, index: usize, href: Option<String>) -> Self {
        let label = label.into();
        let mut path = self.path.clone();
        path.push(label.clone());
        Self {
            label,
            depth: self.depth + 1,
            path,
            index,
            href,
        }
    }

    /// Path rendered as `a > b > c` for log lines.
    pub fn display_path(&self) -> String {
        display_path(&self.path)
    }
}

/// Render a category path for logs and reports.
pub fn display_path(path: &[String]) -> String {
    path.join(" > ")
}

/// One scraped listing.
///
/// `raw_text` is the ground truth; the structured fields are best-effort
/// parses of it and stay `None` when parsing fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub title: String,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub sold_count: Option<u64>,
    pub rating: Option<String>,
    #[serde(rename = "full_text")]
    pub raw_text: String,
    #[serde(rename = "images", default, skip_serializing_if = "Vec::is_empty")]
    pub image_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    pub category_path: CategoryPath,
    pub source_url: Option<String>,
    /// Remote image locations seen on the card; only used to drive downloads.
    #[serde(skip)]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ProductDetail>,
}

/// Fields read from a product's own page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub url: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub rating: Option<String>,
    pub review_count: Option<u64>,
    /// Leading gallery images, absolute URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gallery: Vec<String>,
}

impl ProductRecord {
    /// A record is only kept when some text was captured.
    pub fn is_valid(&self) -> bool {
        !self.raw_text.trim().is_empty()
    }

    /// Identity used to suppress duplicates across "load more" expansions.
    pub fn dedup_key(&self) -> (String, Option<String>) {
        (self.raw_text.clone(), self.source_url.clone())
    }
}

/// Records captured for one category path in one scrape pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductBatch {
    pub category_path: CategoryPath,
    pub records: Vec<ProductRecord>,
}

impl ProductBatch {
    pub fn new(category_path: CategoryPath) -> Self {
        Self {
            category_path,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
