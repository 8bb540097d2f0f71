//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use webindex_core::orchestrator::{ProcessMode, ProgressReporter, RunSummary, StepReport};
use webindex_core::retry::ProcessOutcome;
use webindex_core::service::IndexService;
use webindex_shared::{
    AppConfig, DispatchStrategy, IndexId, IndexStatus, OrgId, ScrapeOptions, TransformStrategy,
    expand_home, init_config, load_config,
};
use webindex_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// webindex: crawl, deduplicate, and embed web content.
#[derive(Parser)]
#[command(
    name = "webindex",
    version,
    about = "Register URLs and crawl origins, then fetch, deduplicate, and embed their content.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Organization to act for (defaults to `defaults.organization`).
    #[arg(long, env = "WEBINDEX_ORG", global = true)]
    pub org: Option<String>,

    /// Database file (defaults to `defaults.database_path`).
    #[arg(long, env = "WEBINDEX_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Register a single page for indexing.
    Submit {
        url: String,

        /// Index this text instead of fetching the URL.
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,

        /// Read the content to index from a file.
        #[arg(long)]
        content_file: Option<PathBuf>,
    },

    /// Register a crawl origin and queue it.
    Crawl {
        url: String,

        /// Treat the URL as a sitemap and enumerate its pages.
        #[arg(long)]
        sitemap: bool,

        #[command(flatten)]
        options: CrawlArgs,
    },

    /// Process claimable items in-process.
    Step {
        /// Keep claiming until nothing is left.
        #[arg(long)]
        all: bool,

        /// Stop after this many items (implies --all).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show how many items still need work.
    Pending,

    /// Item counts per status.
    Stats,

    /// Request processing of existing items again.
    Reprocess {
        #[arg(required = true)]
        ids: Vec<IndexId>,

        /// Re-embed stored content without refetching.
        #[arg(long, conflicts_with = "content_only")]
        embeddings_only: bool,

        /// Refetch and store content; embed in a separate task.
        #[arg(long)]
        content_only: bool,
    },

    /// Reprocess every item of the organization.
    IndexAll,

    /// Consume the task queue (requires `dispatch.strategy = "queued"`).
    Worker {
        /// Exit once no task is due instead of polling.
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// List indexed items.
    List {
        /// Only items in this status (e.g. PENDING, DONE).
        #[arg(long)]
        status: Option<IndexStatus>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one item.
    Show {
        id: IndexId,

        /// Also print the stored content.
        #[arg(long)]
        content: bool,
    },

    /// Delete an item.
    Delete {
        id: IndexId,

        /// Also delete every item discovered from it.
        #[arg(long)]
        subtree: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Scrape options for a crawl origin.
#[derive(Args)]
pub(crate) struct CrawlArgs {
    /// Link depth limit (defaults to `crawl.max_depth`).
    #[arg(long)]
    max_depth: Option<u32>,

    /// Only follow links matching this regex.
    #[arg(long)]
    allow: Option<String>,

    /// Never follow links matching this regex.
    #[arg(long)]
    exclude: Option<String>,

    /// Follow links into subdomains of the origin host.
    #[arg(long)]
    allow_subdomains: bool,

    /// CSS selector to remove before conversion (repeatable).
    #[arg(long = "strip")]
    strip_queries: Vec<String>,

    #[arg(long)]
    strip_links: bool,

    #[arg(long)]
    strip_images: bool,

    #[arg(long)]
    strip_header: bool,

    #[arg(long)]
    strip_footer: bool,

    /// Convert pages with the LLM instead of the markdown converter.
    #[arg(long)]
    llm: bool,
}

impl CrawlArgs {
    fn into_options(self, config: &AppConfig) -> ScrapeOptions {
        ScrapeOptions {
            strip_links: self.strip_links,
            strip_images: self.strip_images,
            strip_header: self.strip_header,
            strip_footer: self.strip_footer,
            strip_queries: self.strip_queries,
            allow_subdomains: self.allow_subdomains,
            allow_links_regexp: self.allow,
            exclude_links_regexp: self.exclude,
            max_depth: Some(self.max_depth.unwrap_or(config.crawl.max_depth)),
            transform_strategy: if self.llm {
                TransformStrategy::Llm
            } else {
                TransformStrategy::Markdown
            },
        }
    }
}

impl Command {
    /// Commands that only report on the database open it read-only.
    fn reads_only(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Stats | Self::List { .. } | Self::Show { .. }
        )
    }
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "webindex=info",
        1 => "webindex=debug",
        _ => "webindex=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Opened database plus the organization the command acts for.
struct Context {
    config: AppConfig,
    service: IndexService,
    org: OrgId,
}

impl Context {
    async fn open(db: Option<PathBuf>, org: Option<String>, readonly: bool) -> Result<Self> {
        let config = load_config()?;
        let db = match db {
            Some(path) => path,
            None => expand_home(&config.defaults.database_path)?,
        };
        let storage = if readonly {
            if !db.exists() {
                return Err(eyre!("no database at '{}', nothing indexed yet", db.display()));
            }
            Storage::open_readonly(&db).await?
        } else {
            Storage::open(&db).await?
        };
        let storage = Arc::new(storage);
        let service = IndexService::from_config(&config, storage)?;
        let org = OrgId::new(org.unwrap_or_else(|| config.defaults.organization.clone()));
        info!(db = %db.display(), org = %org, readonly, "database opened");
        Ok(Self {
            config,
            service,
            org,
        })
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
        command => {
            let ctx = Context::open(cli.db, cli.org, command.reads_only()).await?;
            run_command(&ctx, command).await
        }
    }
}

async fn run_command(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Submit {
            url,
            content,
            content_file,
        } => cmd_submit(ctx, &url, content, content_file).await,
        Command::Crawl {
            url,
            sitemap,
            options,
        } => cmd_crawl(ctx, &url, sitemap, options).await,
        Command::Step { all, limit } => cmd_step(ctx, all || limit.is_some(), limit).await,
        Command::Pending => {
            println!("{}", ctx.service.pending_count(&ctx.org).await?);
            Ok(())
        }
        Command::Stats => cmd_stats(ctx).await,
        Command::Reprocess {
            ids,
            embeddings_only,
            content_only,
        } => {
            let mode = if embeddings_only {
                ProcessMode::EmbedOnly
            } else if content_only {
                ProcessMode::ContentOnly
            } else {
                ProcessMode::Full
            };
            ctx.service.reprocess(&ctx.org, &ids, mode).await?;
            println!("Requested {:?} processing of {} item(s).", mode, ids.len());
            Ok(())
        }
        Command::IndexAll => {
            ctx.service.index_all(&ctx.org).await?;
            println!("Every item of '{}' is queued for reindexing.", ctx.org);
            Ok(())
        }
        Command::Worker { exit_when_idle } => cmd_worker(ctx, exit_when_idle).await,
        Command::List { status, json } => cmd_list(ctx, status, json).await,
        Command::Show { id, content } => cmd_show(ctx, &id, content).await,
        Command::Delete { id, subtree } => {
            if subtree {
                let deleted = ctx.service.delete_subtree(&ctx.org, &id).await?;
                println!("Deleted {deleted} item(s).");
            } else {
                ctx.service.delete(&ctx.org, &id).await?;
                println!("Deleted {id}.");
            }
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(
    ctx: &Context,
    url: &str,
    content: Option<String>,
    content_file: Option<PathBuf>,
) -> Result<()> {
    let content = match content_file {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?,
        ),
        None => content,
    };

    let submission = ctx.service.submit_url(&ctx.org, url, content).await?;
    println!("{}  {}  {}", submission.item.id, submission.item.status, submission.item.url);
    if let Some(persisted) = submission.persisted {
        println!("  {persisted:?}");
    }
    Ok(())
}

async fn cmd_crawl(ctx: &Context, url: &str, sitemap: bool, args: CrawlArgs) -> Result<()> {
    let options = args.into_options(&ctx.config);
    let item = ctx.service.submit_crawl(&ctx.org, url, sitemap, options).await?;
    println!("{}  {}  {}", item.id, item.status, item.url);
    Ok(())
}

async fn cmd_step(ctx: &Context, all: bool, limit: Option<usize>) -> Result<()> {
    if !all {
        match ctx.service.step(&ctx.org).await? {
            Some(report) => println!("{}  {}", report.url, describe(&report.outcome)),
            None => println!("Nothing to process."),
        }
        return Ok(());
    }

    let reporter = CliProgress::new();
    let summary = ctx.service.run_until_idle(&ctx.org, &reporter, limit).await?;

    println!();
    println!("  Processed: {}", summary.processed);
    println!("  Done:      {}", summary.done);
    println!("  Scraped:   {}", summary.scraped);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Failed:    {}", summary.failed);
    if summary.superseded > 0 {
        println!("  Lost:      {} (reclaimed by another worker)", summary.superseded);
    }
    println!("  Pending:   {}", ctx.service.pending_count(&ctx.org).await?);
    println!();
    Ok(())
}

async fn cmd_stats(ctx: &Context) -> Result<()> {
    let counts = ctx.service.status_counts(&ctx.org).await?;
    for status in IndexStatus::ALL {
        let count = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n);
        println!("  {:<14} {count}", status.as_str());
    }
    Ok(())
}

async fn cmd_worker(ctx: &Context, exit_when_idle: bool) -> Result<()> {
    if ctx.config.dispatch.strategy != DispatchStrategy::Queued {
        warn!("dispatch.strategy is not \"queued\"; this process enqueues no tasks");
    }
    let worker = ctx.service.queue_worker(&ctx.config);
    let stats = worker.run_until_ctrl_c(exit_when_idle).await;

    println!();
    println!("  Completed:     {}", stats.completed);
    println!("  Retried:       {}", stats.retried);
    println!("  Deferred:      {}", stats.deferred);
    println!("  Dead-lettered: {}", stats.dead_lettered);
    println!();
    Ok(())
}

async fn cmd_list(ctx: &Context, status: Option<IndexStatus>, json: bool) -> Result<()> {
    let items = ctx.service.list(&ctx.org, status).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }
    for item in &items {
        let marker = if item.do_crawl { "*" } else { " " };
        println!(
            "{}  {:<13} {marker} d{} {}",
            item.id,
            item.status.as_str(),
            item.depth,
            item.url
        );
    }
    Ok(())
}

async fn cmd_show(ctx: &Context, id: &IndexId, content: bool) -> Result<()> {
    let item = ctx.service.get(&ctx.org, id).await?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    if content {
        match ctx.service.content(&ctx.org, id).await? {
            Some(text) => println!("\n{text}"),
            None => println!("\n(no stored content)"),
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn describe(outcome: &ProcessOutcome) -> String {
    match outcome {
        ProcessOutcome::Done { chunks } => format!("done ({chunks} chunks)"),
        ProcessOutcome::Scraped => "scraped".into(),
        ProcessOutcome::SitemapRead { children } => format!("sitemap read ({children} pages)"),
        ProcessOutcome::Skipped { reason } => format!("skipped: {reason}"),
        ProcessOutcome::Superseded => "superseded by another worker".into(),
        ProcessOutcome::Failed { error, .. } => format!("failed: {error}"),
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn item_started(&self, url: &str) {
        self.spinner.set_message(format!("Processing {url}"));
    }

    fn item_finished(&self, report: &StepReport, summary: &RunSummary) {
        if let ProcessOutcome::Failed { error, .. } = &report.outcome {
            self.spinner.println(format!("  failed {}: {error}", report.url));
        }
        self.spinner.set_message(format!(
            "[{} done, {} failed] {}",
            summary.done, summary.failed, report.url
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
