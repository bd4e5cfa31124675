//! CLI binary for pdfraster.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig`,
//! renders the selected pages of one file through a `PdfProcessor` and
//! writes one image per page.

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use pdfraster::{
    read_file, AssignmentPolicy, DocumentReport, EngineStrategy, PageImage, PageSelection,
    PdfProcessor, PipelineConfig, WorkerPool,
};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Render every page into ./pages
  pdfraster document.pdf -o pages

  # First five pages, two engines shared by four workers
  pdfraster --pages 1-5 --engines shared --coordinators 2 book.pdf

  # Machine-readable report
  pdfraster --json paper.pdf > report.json

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH     Directory or file of an existing libpdfium
  RUST_LOG            Overrides the log filter (e.g. pdfraster=debug)
  PDFRASTER_*         Fallback for every flag (e.g. PDFRASTER_WORKERS=2)
"#;

/// Render PDF pages to images through a bounded worker pool.
#[derive(Parser, Debug)]
#[command(
    name = "pdfraster",
    version,
    about = "Render PDF pages to JPEG/PNG files through a bounded worker pool",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Directory for the rendered pages.
    #[arg(short, long, env = "PDFRASTER_OUTPUT", default_value = "pages")]
    output: PathBuf,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDFRASTER_PAGES", default_value = "all")]
    pages: String,

    /// Maximum number of workers in the pool.
    #[arg(short, long, env = "PDFRASTER_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Engine strategy: one engine per worker, or shared engines.
    #[arg(long, env = "PDFRASTER_ENGINES", value_enum, default_value = "dedicated")]
    engines: EngineArg,

    /// Number of shared engines (only with `--engines shared`).
    #[arg(long, env = "PDFRASTER_COORDINATORS", default_value_t = 1)]
    coordinators: usize,

    /// Pick coordinators round-robin instead of least loaded.
    #[arg(long, env = "PDFRASTER_ROUND_ROBIN")]
    round_robin: bool,

    /// Pages rendered concurrently.
    #[arg(short, long, env = "PDFRASTER_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Retries per page after the first failure.
    #[arg(long, env = "PDFRASTER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-page render timeout in seconds.
    #[arg(long, env = "PDFRASTER_PAGE_TIMEOUT", default_value_t = 30)]
    page_timeout: u64,

    /// Show pipeline-internal error details instead of a generic message.
    #[arg(long, env = "PDFRASTER_SHOW_INTERNAL_ERRORS")]
    show_internal_errors: bool,

    /// Print the JSON report on stdout.
    #[arg(long, env = "PDFRASTER_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFRASTER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFRASTER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFRASTER_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EngineArg {
    Dedicated,
    Shared,
}

impl From<EngineArg> for EngineStrategy {
    fn from(v: EngineArg) -> Self {
        match v {
            EngineArg::Dedicated => EngineStrategy::Dedicated,
            EngineArg::Shared => EngineStrategy::Shared,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let selection = parse_pages(&cli.pages)?;
    let started = Instant::now();

    let file = read_file(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    tokio::fs::create_dir_all(&cli.output)
        .await
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;

    let mask = config.mask_internal_errors;
    let pool = WorkerPool::with_pdfium(config);
    let processor = match PdfProcessor::new(pool.clone(), file.file_name.clone()).await {
        Ok(processor) => processor,
        Err(e) => {
            error!(kind = ?e.kind, "Failed to start processor: {}", e.message);
            anyhow::bail!("Failed to start processor: {}", e.display_masked(mask));
        }
    };

    let result = render(&cli, &processor, &file.bytes, &selection, show_progress).await;
    processor.cleanup().await;
    pool.terminate_all();
    let report = result?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        summarize(&report, &cli.output, started.elapsed());
    }

    report.outcome().context("Rendering incomplete")?;
    Ok(())
}

async fn render(
    cli: &Cli,
    processor: &PdfProcessor,
    bytes: &[u8],
    selection: &PageSelection,
    show_progress: bool,
) -> Result<DocumentReport> {
    let doc = match processor.process_file(bytes.to_vec()).await {
        Ok(doc) => doc,
        Err(e) => anyhow::bail!("Failed to open PDF: {}", processor.describe_error(&e)),
    };
    let pages = selection.to_page_numbers(doc.total_pages);
    if pages.is_empty() {
        anyhow::bail!(
            "Page selection '{}' matches no page of a {}-page document",
            cli.pages,
            doc.total_pages
        );
    }

    let bar = if show_progress {
        progress_bar(pages.len())
    } else {
        ProgressBar::hidden()
    };
    bar.println(format!(
        "{} {}",
        cyan("◆"),
        bold(&format!("Rendering {} of {} pages…", pages.len(), doc.total_pages))
    ));

    // Callers beyond the processor's cap just queue; this bound only limits
    // how many encoded pages sit in memory waiting to be written.
    let in_flight = cli.concurrency.max(1) * 2;
    let results: Vec<_> = stream::iter(pages.iter().copied())
        .map(|page| {
            let bar = bar.clone();
            async move {
                let result = match processor.get_page(page).await {
                    Ok(image) => match write_page(&cli.output, &image).await {
                        Ok(path) => {
                            bar.println(format!(
                                "  {} Page {:>4}  {}x{}  {}",
                                green("✓"),
                                page,
                                image.width,
                                image.height,
                                dim(&path.display().to_string())
                            ));
                            Ok(image)
                        }
                        Err(e) => Err(pdfraster::RenderError::new(
                            pdfraster::ErrorKind::Unknown,
                            format!("failed to write page {page}: {e}"),
                        )),
                    },
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    let shown = processor.describe_error(e);
                    bar.println(format!("  {} Page {:>4}  {}", red("✗"), page, red(&shown)));
                }
                bar.inc(1);
                (page, result)
            }
        })
        .buffer_unordered(in_flight)
        .collect()
        .await;
    bar.finish_and_clear();

    Ok(DocumentReport::collect(processor.file_name(), doc.total_pages, results))
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>4}/{len} pages  \
         ⏱ {elapsed_precise}  ETA {eta_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    bar.set_style(style);
    bar.set_prefix("Rendering");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

async fn write_page(dir: &Path, image: &PageImage) -> io::Result<PathBuf> {
    let ext = if image.mime_type == "image/png" { "png" } else { "jpg" };
    let path = dir.join(format!("page-{:04}.{ext}", image.page_number));
    tokio::fs::write(&path, &image.data).await?;
    Ok(path)
}

fn summarize(report: &DocumentReport, output: &Path, elapsed: Duration) {
    let selected = report.rendered.len() + report.failed.len();
    let bytes: usize = report.rendered.iter().map(|r| r.bytes).sum();
    if report.failed.is_empty() {
        eprintln!(
            "{} {}/{} pages  {}ms  →  {}",
            green("✔"),
            bold(&report.rendered.len().to_string()),
            selected,
            elapsed.as_millis(),
            bold(&output.display().to_string()),
        );
    } else {
        eprintln!(
            "{} {}/{} pages rendered  ({} failed)",
            if report.rendered.is_empty() { red("✘") } else { cyan("⚠") },
            bold(&report.rendered.len().to_string()),
            selected,
            red(&report.failed.len().to_string()),
        );
    }
    eprintln!("   {}", dim(&format!("{} KiB written", bytes / 1024)));
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let assignment = if cli.round_robin {
        AssignmentPolicy::RoundRobin
    } else {
        AssignmentPolicy::LeastLoaded
    };
    PipelineConfig::builder()
        .max_workers(cli.workers)
        .engine_strategy(cli.engines.into())
        .coordinator_count(cli.coordinators)
        .assignment(assignment)
        .default_concurrency(cli.concurrency)
        .max_retries(cli.max_retries)
        .request_timeout_ms(cli.page_timeout.saturating_mul(1000))
        .mask_internal_errors(!cli.show_internal_errors)
        .build()
        .context("Invalid configuration")
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;
        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }
        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(p) = pages.iter().find(|p| **p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }
        return Ok(PageSelection::Set(pages));
    }

    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok(PageSelection::Single(page))
}
