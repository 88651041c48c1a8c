//! `provider-mirror build` - build a mirror from a manifest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use tokio_util::sync::CancellationToken;

use provider_mirror::{BuildConfig, Builder};

use crate::ui::progress::TerminalProgress;

/// Build a provider mirror from a manifest.
///
/// The build is atomic: either it succeeds completely or produces no
/// output. Downloads are cached for efficient re-runs.
#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Path to the manifest file
    #[arg(short, long, default_value = "mirror.yaml")]
    pub manifest: PathBuf,

    /// Output directory for the mirror
    #[arg(short, long, default_value = "./mirror")]
    pub output: PathBuf,

    /// Cache directory for downloads (default: system temp)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Ignore cached downloads and re-download all files
    #[arg(long)]
    pub no_cache: bool,

    /// Number of parallel downloads
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Number of retries for failed downloads
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Maximum backoff time in seconds
    #[arg(long, default_value_t = 60)]
    pub max_backoff: u64,
}

pub async fn run(
    args: BuildArgs,
    quiet: bool,
    show_progress: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let config = BuildConfig {
        manifest_path: args.manifest.clone(),
        output_dir: args.output.clone(),
        cache_dir: args.cache_dir,
        no_cache: args.no_cache,
        concurrency: args.concurrency,
        retries: args.retries,
        max_backoff: Duration::from_secs(args.max_backoff),
    };

    let mut builder = Builder::new(config)?;
    if show_progress {
        builder = builder.with_progress(Arc::new(TerminalProgress::new()));
    }

    if !quiet {
        println!("Building mirror from {}", args.manifest.display());
        println!("Output directory: {}", args.output.display());
        println!();
    }

    let start = Instant::now();
    let summary = builder.build(cancel).await?;

    if !quiet {
        println!("✓ Mirror built successfully");
        println!("  Providers: {}", summary.providers);
        println!("  Versions:  {}", summary.versions);
        println!(
            "  Files:     {} ({} downloaded, {} from cache) in {:.1}s",
            summary.files,
            summary.downloaded,
            summary.from_cache,
            start.elapsed().as_secs_f64()
        );
    }

    Ok(())
}
