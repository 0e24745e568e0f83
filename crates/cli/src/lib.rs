pub mod source;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use readium_core::{GeneratorConfig, GeneratorEvent, ThumbnailGenerator};
use readium_render::{PageSource, RenderBackend, RenderQuality, SyntheticDocument, ViewerDpiProfile};
use serde::Serialize;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::source::ImageFolderSource;

/// Upper bound on how long one page may keep the run waiting.
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "readium-thumbs")]
#[command(about = "Readium thumbnail renderer")]
pub struct Cli {
    /// More logging on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write the log to this file instead of stderr.
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render a thumbnail PNG for every page.
    Render(RenderArgs),
    /// Render one full page for viewing.
    Page(PageArgs),
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Directory of page images (PNG or JPEG), one page per file.
    #[arg(
        long,
        value_name = "DIR",
        conflicts_with = "synthetic",
        required_unless_present = "synthetic"
    )]
    images: Option<PathBuf>,

    /// Generated test document with this many pages.
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Generator settings in TOML; command-line flags win.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    quality: Option<f64>,

    /// Maximum concurrent render jobs.
    #[arg(long)]
    jobs: Option<usize>,

    #[arg(long, default_value = "thumbnails")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Page number, starting at 1.
    #[arg(long, default_value_t = 1)]
    page: usize,

    #[arg(long, default_value_t = 1.0)]
    zoom: f64,

    /// draft, normal, high or ultra.
    #[arg(long, default_value = "high")]
    quality: RenderQuality,

    /// Base DPI at 100% zoom.
    #[arg(long, default_value_t = 72.0)]
    dpi: f64,

    #[arg(long, default_value_t = 1.0)]
    device_pixel_ratio: f64,

    #[arg(long, default_value = "page.png")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct PageSummary {
    page: usize,
    width: u32,
    height: u32,
    output: String,
}

#[derive(Debug, Serialize)]
struct RenderSummary {
    pages: usize,
    generated: usize,
    errors: usize,
    output: String,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Render(args) => run_render(&args),
        Commands::Page(args) => run_page(&args),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = log_level(verbose);
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            WriteLogger::init(level, Config::default(), file)?;
        }
        None => {
            TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)?;
        }
    }
    Ok(())
}

fn generator_config(args: &RenderArgs) -> Result<GeneratorConfig> {
    let mut config = match &args.config {
        Some(path) => GeneratorConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GeneratorConfig::default(),
    };

    if args.width.is_some() || args.height.is_some() {
        let size = config.thumbnail_size;
        config = config.with_thumbnail_size(
            args.width.unwrap_or(size.width),
            args.height.unwrap_or(size.height),
        );
    }
    if let Some(quality) = args.quality {
        config = config.with_quality(quality);
    }
    if let Some(jobs) = args.jobs {
        config = config.with_max_concurrent_jobs(jobs);
    }
    if config.thumbnail_size.is_empty() {
        anyhow::bail!("thumbnail size must be non-zero");
    }
    Ok(config)
}

fn open_source(args: &InputArgs) -> Result<Arc<dyn PageSource>> {
    match (&args.images, args.synthetic) {
        (Some(dir), _) => Ok(Arc::new(ImageFolderSource::open(dir)?)),
        (None, Some(0)) => anyhow::bail!("--synthetic needs at least one page"),
        (None, Some(pages)) => Ok(Arc::new(SyntheticDocument::letter(pages))),
        (None, None) => anyhow::bail!("no input given"),
    }
}

fn run_render(args: &RenderArgs) -> Result<()> {
    let config = generator_config(args)?;
    let source = open_source(&args.input)?;
    let pages = source.num_pages();

    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let generator = ThumbnailGenerator::new(config);
    generator.set_document(Some(source));
    let events = generator.subscribe();

    generator.generate_thumbnail_range(0, pages - 1, None, None)?;
    let timeout = PAGE_TIMEOUT * pages.min(u32::MAX as usize) as u32;
    if !generator.wait_idle(timeout) {
        anyhow::bail!("rendering did not finish within {timeout:?}");
    }

    let mut generated = 0;
    let mut errors = 0;
    for event in events.try_iter() {
        match event {
            GeneratorEvent::ThumbnailGenerated { page, bitmap, .. } => {
                let path = args.output.join(format!("page-{}.png", page + 1));
                bitmap
                    .save(&path)
                    .with_context(|| format!("failed to write image to {}", path.display()))?;
                generated += 1;
            }
            GeneratorEvent::ThumbnailError { page, message } => {
                log::error!("Page {}: {message}", page + 1);
                errors += 1;
            }
            _ => {}
        }
    }

    let stats = generator.statistics();
    log::info!(
        "Rendered {generated}/{pages} page(s), {} attempt(s) failed, average {:?}",
        stats.total_errors,
        stats.average_render_time()
    );

    let summary = RenderSummary {
        pages,
        generated,
        errors,
        output: args.output.display().to_string(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn run_page(args: &PageArgs) -> Result<()> {
    let source = open_source(&args.input)?;
    let pages = source.num_pages();
    if args.page == 0 || args.page > pages {
        anyhow::bail!("page {} out of range 1-{pages}", args.page);
    }

    let backend = RenderBackend::default();
    backend
        .dpi_calculator()
        .set_device_pixel_ratio(args.device_pixel_ratio);
    let profile = ViewerDpiProfile::new(args.dpi, args.dpi, args.quality);
    let bitmap = backend.render_page(source.as_ref(), args.page - 1, &profile, args.zoom)?;

    if let Some(parent) = args.output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    bitmap
        .save(&args.output)
        .with_context(|| format!("failed to write image to {}", args.output.display()))?;

    let summary = PageSummary {
        page: args.page,
        width: bitmap.width(),
        height: bitmap.height(),
        output: args.output.display().to_string(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_args(args: &[&str]) -> RenderArgs {
        let cli = Cli::try_parse_from(["readium-thumbs", "render"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Render(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(log_level(0), LevelFilter::Warn);
        assert_eq!(log_level(1), LevelFilter::Info);
        assert_eq!(log_level(2), LevelFilter::Debug);
        assert_eq!(log_level(7), LevelFilter::Trace);

        let cli = Cli::try_parse_from(["readium-thumbs", "-vv", "version"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_input_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["readium-thumbs", "render"]).is_err());
        assert!(Cli::try_parse_from([
            "readium-thumbs",
            "render",
            "--images",
            "pages",
            "--synthetic",
            "2"
        ])
        .is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = render_args(&["--synthetic", "2", "--width", "80", "--jobs", "20"]);
        let config = generator_config(&args).unwrap();
        assert_eq!(config.thumbnail_size.width, 80);
        assert_eq!(config.thumbnail_size.height, 160);
        assert_eq!(config.max_concurrent_jobs, 8);

        let args = render_args(&["--synthetic", "2", "--height", "0"]);
        assert!(generator_config(&args).is_err());
    }

    #[test]
    fn test_empty_synthetic_rejected() {
        let args = render_args(&["--synthetic", "0"]);
        assert!(open_source(&args.input).is_err());
    }

    #[test]
    fn test_page_args_parse_quality() {
        let cli = Cli::try_parse_from([
            "readium-thumbs",
            "page",
            "--synthetic",
            "2",
            "--quality",
            "draft",
            "--zoom",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Page(args) => {
                assert_eq!(args.quality, RenderQuality::Draft);
                assert_eq!(args.zoom, 2.0);
                assert_eq!(args.page, 1);
            }
            _ => unreachable!(),
        }

        assert!(Cli::try_parse_from(["readium-thumbs", "page", "--synthetic", "1", "--quality", "best"]).is_err());
    }
}
