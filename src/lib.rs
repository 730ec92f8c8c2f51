//! catalog-crawler - category-tree traversal and product extraction for
//! dynamically rendered marketplace pages
//!
//! This library provides:
//! - A role-based page probe with bounded retries over a browser session
//! - A depth-first category walker with loop protection and backtracking
//! - A product extractor that follows "load more" expansions
//! - Filesystem persistence of product batches and media side-files

pub mod browser;
pub mod config;
pub mod core;
pub mod error;
pub mod extract;
pub mod logging;
pub mod media;
pub mod models;
pub mod probe;
pub mod site;
pub mod storage;
pub mod utils;
pub mod walker;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export main types for convenience
pub use crate::browser::{BrowserError, BrowserSession, ElementRef, Locator};
pub use crate::config::AppConfig;
pub use crate::core::{traverse, Crawler};
pub use crate::error::{CrawlError, CrawlResult};
pub use crate::models::{CategoryNode, ProductBatch, ProductRecord};
pub use crate::walker::{CategoryWalker, TraversalError, TraversalReport};
