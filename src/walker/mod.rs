//! Depth-first traversal of a rendered category tree.
//!
//! At each node products win: a page with product cards is harvested and
//! its children are ignored. Otherwise the walker descends into each child
//! in the order the page lists them, then returns to the parent before
//! moving on to the next sibling.

use futures::future::{FutureExt, LocalBoxFuture};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CrawlConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::extract::{HarvestError, LeafHarvest, ProductExtractor};
use crate::logging::{LogContext, PerformanceLogger};
use crate::models::{display_path, CategoryNode, CategoryPath, ProductBatch};
use crate::probe::PageProbe;
use crate::utils::same_page;
use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub max_depth: usize,
    pub max_fan_out: usize,
    pub prefer_href: bool,
    pub dismiss_cookies: bool,
    pub root_label: Option<String>,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for TraversalOptions {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_fan_out: config.max_fan_out,
            prefer_href: config.prefer_href,
            dismiss_cookies: config.dismiss_cookies,
            root_label: config.root_label.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Click intercepted, stale reference or the parent page could not be restored.
    Navigation,
    /// An expected element never showed up.
    Timeout,
    /// The node was listed but could not be found again.
    Vanished,
    /// Entering the node landed on a page already open higher up the descent.
    Cycle,
}

impl SkipReason {
    fn of(error: &CrawlError) -> Self {
        match error {
            CrawlError::Timeout { .. } => SkipReason::Timeout,
            _ => SkipReason::Navigation,
        }
    }
}

/// A category path the traversal gave up on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPath {
    pub path: CategoryPath,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Scraped { records: usize, batches: usize },
    /// No products and no children.
    Empty,
    Descended { children: usize },
    /// No products at the depth bound; children were not listed.
    DepthLimited,
    Failed { reason: SkipReason },
    Cancelled,
    /// A fatal error stopped the traversal at this node.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeVisit {
    pub path: CategoryPath,
    pub outcome: NodeOutcome,
}

/// What a traversal produced, in completion order.
#[derive(Debug, Clone, Default)]
pub struct TraversalReport {
    pub batches: Vec<ProductBatch>,
    pub written: Vec<PathBuf>,
    pub failures: Vec<SkippedPath>,
    /// One entry per path the walker accounted for.
    pub visits: Vec<NodeVisit>,
    pub cancelled: bool,
}

impl TraversalReport {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(ProductBatch::len).sum()
    }

    fn merge_harvest(&mut self, harvest: LeafHarvest) {
        self.written.extend(harvest.written);
        self.batches.extend(harvest.batches);
        if harvest.cancelled {
            self.cancelled = true;
        }
    }

    fn visit(&mut self, path: &[String], outcome: NodeOutcome) -> usize {
        self.visits.push(NodeVisit {
            path: path.to_vec(),
            outcome,
        });
        self.visits.len() - 1
    }

    fn fail(&mut self, path: &[String], reason: SkipReason, detail: impl Into<String>) {
        self.failures.push(SkippedPath {
            path: path.to_vec(),
            reason,
            detail: detail.into(),
        });
    }
}

/// A fatal failure, with everything persisted before it.
#[derive(Error, Debug)]
#[error("traversal aborted: {source}")]
pub struct TraversalError {
    pub source: CrawlError,
    pub partial: TraversalReport,
}

/// Loop protection and the active descent.
#[derive(Debug, Default)]
pub struct TraversalState {
    pub visited_paths: HashSet<CategoryPath>,
    pub current_stack: Vec<CategoryNode>,
    /// Page URL of each node on `current_stack`, same order.
    pub landed_urls: Vec<String>,
}

impl TraversalState {
    /// Record `path`; false when it was already visited.
    pub fn mark_visited(&mut self, path: &[String]) -> bool {
        self.visited_paths.insert(path.to_vec())
    }

    /// Whether `url` is the page of a node on the active descent.
    pub fn leads_back(&self, url: &str) -> bool {
        self.landed_urls.iter().any(|landed| same_page(landed, url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    AtNode,
    Scraping,
    Descending,
    Backtracking,
    Done,
}

impl WalkState {
    pub fn can_transition_to(self, next: WalkState) -> bool {
        use WalkState::*;
        matches!(
            (self, next),
            (AtNode, Scraping)
                | (AtNode, Descending)
                | (AtNode, Backtracking)
                | (Scraping, Backtracking)
                | (Descending, AtNode)
                | (Descending, Backtracking)
                | (Backtracking, Descending)
                | (Backtracking, AtNode)
                | (_, Done)
        )
    }
}

/// Drives one browser session through a category tree.
pub struct CategoryWalker {
    probe: Arc<PageProbe>,
    extractor: Arc<ProductExtractor>,
    options: TraversalOptions,
    run_id: String,
}

impl CategoryWalker {
    pub fn new(
        probe: Arc<PageProbe>,
        extractor: Arc<ProductExtractor>,
        options: TraversalOptions,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            probe,
            extractor,
            options,
            run_id: run_id.into(),
        }
    }

    /// Walk the tree below `start_url`. Fatal errors come back with the
    /// partial report; everything else ends up in `failures`.
    pub async fn traverse(&self, start_url: &str, cancel: &CancellationToken) -> Result<TraversalReport, TraversalError> {
        let context = LogContext::new("walker", "traverse")
            .with_run_id(&self.run_id)
            .with_url(start_url);
        let timer = PerformanceLogger::new(context.clone());
        log_info!(context, "Starting traversal");

        let mut walk = Walk::new(self, cancel);
        let root = CategoryNode::root(self.root_label(start_url));

        let result = match self.open(start_url).await {
            Ok(()) => walk.start(root).await,
            Err(e) => Err(e),
        };
        walk.transition(WalkState::Done);

        match result {
            Ok(()) => {
                let report = walk.report;
                timer.finish(&format!(
                    "Traversal finished: {} records in {} batches, {} failures",
                    report.record_count(),
                    report.batches.len(),
                    report.failures.len()
                ));
                Ok(report)
            }
            Err(source) => {
                let context = context
                    .with_duration(timer.elapsed())
                    .with_status("aborted")
                    .with_error_category(source.category());
                log_error!(context, source, "Traversal aborted");
                Err(TraversalError {
                    source,
                    partial: walk.report,
                })
            }
        }
    }

    /// Follow `labels` down from `start_url`, matching each level by
    /// case-insensitive substring, and return the node reached.
    pub async fn descend_to(&self, start_url: &str, labels: &[String]) -> CrawlResult<CategoryNode> {
        self.open(start_url).await?;
        let mut node = CategoryNode::root(self.root_label(start_url));

        for label in labels {
            let wanted = label.to_lowercase();
            let children = self.probe.list_category_children(&node).await?;
            let child = children
                .into_iter()
                .find(|c| c.label.to_lowercase().contains(&wanted))
                .ok_or_else(|| {
                    CrawlError::navigation(format!("no category matching '{}' under {}", label, node.display_path()))
                })?;

            if let Some((_, detail)) = self.enter(&child).await? {
                return Err(CrawlError::navigation(format!("could not open {}: {}", child.display_path(), detail)));
            }
            info!("Descended to {}", child.display_path());
            node = child;
        }

        Ok(node)
    }

    async fn open(&self, start_url: &str) -> CrawlResult<()> {
        self.probe.session().navigate_to(start_url).await?;
        self.probe.settle().await;
        if self.options.dismiss_cookies {
            self.probe.dismiss_cookie_banner().await?;
        }
        Ok(())
    }

    fn root_label(&self, start_url: &str) -> String {
        self.options
            .root_label
            .clone()
            .unwrap_or_else(|| root_label_for(start_url))
    }

    /// Open a child's page. `Ok(Some(..))` means the child was skipped.
    async fn enter(&self, child: &CategoryNode) -> CrawlResult<Option<(SkipReason, String)>> {
        let session = self.probe.session();

        if self.options.prefer_href {
            if let Some(href) = &child.href {
                return match session.navigate_to(href).await {
                    Ok(()) => {
                        self.probe.settle().await;
                        Ok(None)
                    }
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => Ok(Some((SkipReason::Navigation, e.to_string()))),
                };
            }
        }

        let Some(element) = self.probe.locate_child(child).await? else {
            return Ok(Some((SkipReason::Vanished, "no longer listed".to_string())));
        };

        self.probe.scroll_into_view(element).await?;
        match session.click(element).await {
            Ok(()) => {
                self.probe.settle().await;
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                let error = CrawlError::from(e);
                Ok(Some((SkipReason::of(&error), error.to_string())))
            }
        }
    }

    /// Make sure the page shows `parent_url`, loading it if necessary.
    async fn restore(&self, parent_url: &str) -> CrawlResult<bool> {
        let session = self.probe.session();
        if session.current_url().await? == parent_url {
            return Ok(true);
        }

        debug!("Reloading parent page {}", parent_url);
        match session.navigate_to(parent_url).await {
            Ok(()) => {
                self.probe.settle().await;
                Ok(session.current_url().await? == parent_url)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Could not reload {}: {}", parent_url, e);
                Ok(false)
            }
        }
    }

    /// Undo a child visit: history back, verified against `parent_url`.
    async fn backtrack(&self, parent_url: &str, child_url: &str) -> CrawlResult<bool> {
        if child_url != parent_url {
            match self.probe.session().go_back().await {
                Ok(()) => self.probe.settle().await,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!("History back failed: {}", e),
            }
        }
        self.restore(parent_url).await
    }
}

/// Default root label: the last path segment of the start URL, else its host.
fn root_label_for(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return "root".to_string();
    };
    parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        .or_else(|| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "root".to_string())
}

/// State of one traversal run.
struct Walk<'w> {
    walker: &'w CategoryWalker,
    cancel: &'w CancellationToken,
    state: TraversalState,
    report: TraversalReport,
    walk_state: WalkState,
}

impl<'w> Walk<'w> {
    fn new(walker: &'w CategoryWalker, cancel: &'w CancellationToken) -> Self {
        Self {
            walker,
            cancel,
            state: TraversalState::default(),
            report: TraversalReport::default(),
            walk_state: WalkState::AtNode,
        }
    }

    fn transition(&mut self, next: WalkState) {
        debug_assert!(
            self.walk_state.can_transition_to(next) || self.walk_state == next,
            "{:?} -> {:?}",
            self.walk_state,
            next
        );
        self.walk_state = next;
    }

    fn context(&self, node: &CategoryNode, operation: &str) -> LogContext {
        LogContext::new("walker", operation)
            .with_run_id(&self.walker.run_id)
            .with_category_path(&node.path)
    }

    async fn start(&mut self, root: CategoryNode) -> CrawlResult<()> {
        let url = self.walker.probe.session().current_url().await?;
        self.state.mark_visited(&root.path);
        self.visit(root, url).await
    }

    /// Visit a node whose page, `url`, is currently shown.
    fn visit<'a>(&'a mut self, node: CategoryNode, url: String) -> LocalBoxFuture<'a, CrawlResult<()>> {
        async move {
            if self.cancel.is_cancelled() {
                self.report.cancelled = true;
                self.report.visit(&node.path, NodeOutcome::Cancelled);
                return Ok(());
            }

            self.walk_state = WalkState::AtNode;
            self.state.current_stack.push(node.clone());
            self.state.landed_urls.push(url);
            let result = self.classify(&node).await;
            self.state.landed_urls.pop();
            self.state.current_stack.pop();

            if result.is_err() && !self.report.visits.iter().any(|v| v.path == node.path) {
                self.report.visit(&node.path, NodeOutcome::Aborted);
            }
            result
        }
        .boxed_local()
    }

    async fn classify(&mut self, node: &CategoryNode) -> CrawlResult<()> {
        let probe = &self.walker.probe;
        let extractor = &self.walker.extractor;

        extractor.prepare_page().await?;
        let count = probe.count_products().await?;

        if count > 0 {
            if extractor.apply_sort().await? {
                extractor.prepare_page().await?;
            }
            self.transition(WalkState::Scraping);
            let context = self.context(node, "scrape").with_number_field("cards", count as i64);
            log_info!(context, "Products found");
            return self.harvest(node).await;
        }

        if node.depth >= self.walker.options.max_depth {
            debug!("Depth bound reached at {}", node.display_path());
            self.report.visit(&node.path, NodeOutcome::DepthLimited);
            self.transition(WalkState::Backtracking);
            return Ok(());
        }

        let mut children = probe.list_category_children(node).await?;
        if children.is_empty() {
            debug!("Dead end at {}", node.display_path());
            self.report.visit(&node.path, NodeOutcome::Empty);
            self.transition(WalkState::Backtracking);
            return Ok(());
        }

        let max_fan_out = self.walker.options.max_fan_out;
        if children.len() > max_fan_out {
            warn!(
                "{} lists {} children, keeping the first {}",
                node.display_path(),
                children.len(),
                max_fan_out
            );
            children.truncate(max_fan_out);
        }

        let context = self.context(node, "descend").with_number_field("children", children.len() as i64);
        log_info!(context, "Descending");
        let visit_index = self.report.visit(&node.path, NodeOutcome::Descended { children: children.len() });
        self.descend(node, children, visit_index).await
    }

    async fn harvest(&mut self, node: &CategoryNode) -> CrawlResult<()> {
        let result = self.walker.extractor.expand_and_continue(&node.path, self.cancel).await;
        self.transition(WalkState::Backtracking);

        match result {
            Ok(harvest) => {
                let context = self
                    .context(node, "harvest")
                    .with_number_field("records", harvest.record_count() as i64)
                    .with_bool_field("cancelled", harvest.cancelled);
                log_info!(context, "Leaf harvested");
                let outcome = NodeOutcome::Scraped {
                    records: harvest.record_count(),
                    batches: harvest.batches.len(),
                };
                self.report.merge_harvest(harvest);
                self.report.visit(&node.path, outcome);
                Ok(())
            }
            Err(HarvestError { source, partial }) => {
                self.report.merge_harvest(partial);
                self.report.visit(&node.path, NodeOutcome::Aborted);
                Err(source)
            }
        }
    }

    async fn descend(&mut self, node: &CategoryNode, children: Vec<CategoryNode>, visit_index: usize) -> CrawlResult<()> {
        let session = self.walker.probe.session().clone();
        let parent_url = session.current_url().await?;

        for child in children {
            if self.cancel.is_cancelled() {
                info!("Cancelled before {}", child.display_path());
                self.report.cancelled = true;
                break;
            }

            if !self.state.mark_visited(&child.path) {
                let context = self.context(&child, "enter");
                log_debug!(context, "Already visited, skipping");
                continue;
            }

            self.transition(WalkState::Descending);
            if let Some((reason, detail)) = self.walker.enter(&child).await? {
                let context = self
                    .context(&child, "enter")
                    .with_error_category("navigation")
                    .with_string_field("detail", &detail);
                log_warn!(context, "Skipping category");
                self.report.fail(&child.path, reason, detail);
                self.report.visit(&child.path, NodeOutcome::Failed { reason });

                self.transition(WalkState::Backtracking);
                if !self.walker.restore(&parent_url).await? {
                    self.abandon(node, visit_index, &parent_url);
                    return Ok(());
                }
                continue;
            }

            let child_url = session.current_url().await?;
            if self.state.leads_back(&child_url) {
                let context = self.context(&child, "enter").with_url(&child_url);
                log_debug!(context, "Leads back into the current descent");
                self.report.fail(&child.path, SkipReason::Cycle, format!("leads back to {}", child_url));
                self.report.visit(&child.path, NodeOutcome::Failed { reason: SkipReason::Cycle });
            } else {
                self.visit(child, child_url.clone()).await?;
            }

            self.transition(WalkState::Backtracking);
            if !self.walker.backtrack(&parent_url, &child_url).await? {
                self.abandon(node, visit_index, &parent_url);
                return Ok(());
            }
        }

        Ok(())
    }

    /// The parent page is gone; its remaining children are dropped.
    fn abandon(&mut self, node: &CategoryNode, visit_index: usize, parent_url: &str) {
        warn!("Could not return to {}, abandoning its remaining children", node.display_path());
        self.report.fail(
            &node.path,
            SkipReason::Navigation,
            format!("could not return to {}", parent_url),
        );
        self.report.visits[visit_index].outcome = NodeOutcome::Failed {
            reason: SkipReason::Navigation,
        };
    }
}

/// Paths rendered for a human-readable summary.
pub fn summarize(report: &TraversalReport) -> Vec<String> {
    report
        .failures
        .iter()
        .map(|f| format!("{} ({:?}: {})", display_path(&f.path), f.reason, f.detail))
        .collect()
}
