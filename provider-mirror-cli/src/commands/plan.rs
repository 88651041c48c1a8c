//! `provider-mirror plan` - dry-run preview of a build.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use provider_mirror::httpclient::{self, HttpClient};
use provider_mirror::manifest::Manifest;
use provider_mirror::planner::Planner;
use provider_mirror::registry::HttpRegistryClient;

/// Show what would be downloaded without building the mirror (dry-run).
#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Path to the manifest file
    #[arg(short, long, default_value = "mirror.yaml")]
    pub manifest: PathBuf,
}

pub async fn run(args: PlanArgs, quiet: bool, cancel: &CancellationToken) -> anyhow::Result<()> {
    let manifest = Manifest::load(&args.manifest)?;

    let http = Arc::new(HttpClient::new(httpclient::Config::default())?);
    let client = Arc::new(HttpRegistryClient::new(http));

    let plan = Planner::new(client).plan(cancel, &manifest).await?;

    if !quiet {
        println!(
            "Plan: {} providers, {} versions, {} downloads",
            plan.providers.len(),
            plan.total_versions,
            plan.total_downloads
        );
        println!();
        for provider in &plan.providers {
            println!("  {}", provider.source);
            for version in &provider.versions {
                println!(
                    "    {} ({} platforms)",
                    version.version,
                    version.platforms.len()
                );
            }
        }
    }

    Ok(())
}
