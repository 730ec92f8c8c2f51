use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use catalog_crawler::config::{get_config_path, AppConfig, ConfigOverrides};
use catalog_crawler::extract::CaptureMode;
use catalog_crawler::logging::{init_logging, LogContext};
use catalog_crawler::site::SiteProfile;

#[derive(Parser)]
#[command(name = "catalog-crawler")]
#[command(about = "Walk marketplace category trees and save product listings")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Traverse every category below a start page
    Crawl {
        #[arg(help = "Start page URL")]
        url: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Follow a label path from a start page and scrape that category
    Descend {
        #[arg(help = "Start page URL")]
        url: String,

        #[arg(required = true, help = "Category labels, matched by case-insensitive substring")]
        labels: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List available site profiles
    Sites,

    /// Validate the configuration and print where it was loaded from
    CheckConfig,
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(short, long, help = "Output directory")]
    output: Option<PathBuf>,

    #[arg(short, long, help = "Site profile")]
    site: Option<String>,

    #[arg(long, help = "Maximum category depth")]
    max_depth: Option<usize>,

    #[arg(long, help = "What to capture per product", value_enum)]
    capture: Option<CaptureArg>,

    #[arg(long, help = "Listing order passed through the site's sort parameter, e.g. BEST_SELLER")]
    sort: Option<String>,

    #[arg(long, help = "Also read each product's own page")]
    details: bool,

    #[arg(long, help = "Show the browser window")]
    headed: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum CaptureArg {
    Text,
    Screenshot,
    Images,
}

impl From<CaptureArg> for CaptureMode {
    fn from(arg: CaptureArg) -> Self {
        match arg {
            CaptureArg::Text => CaptureMode::TextOnly,
            CaptureArg::Screenshot => CaptureMode::Screenshot,
            CaptureArg::Images => CaptureMode::DownloadImages,
        }
    }
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(output) = &self.output {
            config.output.directory = output.clone();
        }
        if let Some(site) = &self.site {
            config.site = site.clone();
        }
        if let Some(depth) = self.max_depth {
            config.crawl.max_depth = depth;
        }
        if let Some(capture) = self.capture {
            config.extraction.capture = capture.into();
        }
        if let Some(sort) = &self.sort {
            config.extraction.listing_sort = Some(sort.clone());
        }
        if self.details {
            config.extraction.detail_pages = true;
        }
        if self.headed {
            config.browser.headless = false;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load().await?,
    };
    ConfigOverrides::apply(&mut config);
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;

    let context = LogContext::new("main", "startup").with_string_field("version", env!("CARGO_PKG_VERSION"));
    catalog_crawler::log_info!(context, "catalog-crawler starting up");

    match cli.command {
        Commands::Sites => {
            for name in SiteProfile::builtin_names() {
                println!("{} (built-in)", name);
            }
            let mut custom: Vec<_> = config.sites.keys().collect();
            custom.sort();
            for name in custom {
                println!("{} (config)", name);
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            let source = cli.config.unwrap_or_else(get_config_path);
            println!("Configuration OK ({})", source.display());
            println!("Site profile: {}", config.site);
            println!("Output directory: {}", config.output.directory.display());
        }
        Commands::Crawl { url, run } => {
            run.apply(&mut config);
            config.validate()?;
            run_browser::crawl(config, &url).await?;
        }
        Commands::Descend { url, labels, run } => {
            run.apply(&mut config);
            config.validate()?;
            run_browser::descend(config, &url, &labels).await?;
        }
    }

    info!("catalog-crawler shutting down");
    Ok(())
}

#[cfg(feature = "browser")]
mod run_browser {
    use anyhow::Result;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, warn};

    use catalog_crawler::browser::playwright::PlaywrightSession;
    use catalog_crawler::browser::BrowserSession;
    use catalog_crawler::config::AppConfig;
    use catalog_crawler::walker::summarize;
    use catalog_crawler::Crawler;

    fn cancel_on_ctrl_c() -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current step");
                trigger.cancel();
            }
        });
        cancel
    }

    pub async fn crawl(config: AppConfig, url: &str) -> Result<()> {
        let cancel = cancel_on_ctrl_c();
        let session = Arc::new(PlaywrightSession::launch(&config.browser).await?);
        let crawler = Crawler::with_filesystem(config, session.clone() as Arc<dyn BrowserSession>)?;
        println!(
            "Run {} writing to {}",
            crawler.run_id(),
            crawler.config().output.directory.display()
        );

        let outcome = crawler.traverse(url, &cancel).await;
        drop(crawler);
        close(session).await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                error!("{}", e);
                println!("Aborted after {} batches", e.partial.batches.len());
                return Err(e.source.into());
            }
        };

        println!(
            "Saved {} records in {} batches{}",
            report.record_count(),
            report.batches.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        for path in &report.written {
            println!("  {}", path.display());
        }
        for line in summarize(&report) {
            warn!("Skipped {}", line);
            println!("  skipped: {}", line);
        }
        Ok(())
    }

    pub async fn descend(config: AppConfig, url: &str, labels: &[String]) -> Result<()> {
        let cancel = cancel_on_ctrl_c();
        let session = Arc::new(PlaywrightSession::launch(&config.browser).await?);
        let crawler = Crawler::with_filesystem(config, session.clone() as Arc<dyn BrowserSession>)?;
        println!(
            "Run {} writing to {}",
            crawler.run_id(),
            crawler.config().output.directory.display()
        );

        let outcome = crawler.scrape_category(url, labels, &cancel).await;
        drop(crawler);
        close(session).await;

        let harvest = outcome?;
        println!(
            "Saved {} records from {}",
            harvest.record_count(),
            harvest.category_path.join(" > ")
        );
        for path in &harvest.written {
            println!("  {}", path.display());
        }
        Ok(())
    }

    async fn close(session: Arc<PlaywrightSession>) {
        match Arc::try_unwrap(session) {
            Ok(session) => session.close().await,
            Err(_) => warn!("Browser session still in use, leaving it to exit with the process"),
        }
    }
}

#[cfg(not(feature = "browser"))]
mod run_browser {
    use anyhow::{bail, Result};
    use catalog_crawler::config::AppConfig;

    pub async fn crawl(_config: AppConfig, _url: &str) -> Result<()> {
        bail!("this build has no browser support; rebuild with `--features browser`")
    }

    pub async fn descend(_config: AppConfig, _url: &str, _labels: &[String]) -> Result<()> {
        bail!("this build has no browser support; rebuild with `--features browser`")
    }
}
