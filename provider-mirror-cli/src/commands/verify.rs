//! `provider-mirror verify` - validate an existing mirror.

use std::path::PathBuf;

use anyhow::bail;
use clap::Args;
use tokio_util::sync::CancellationToken;

use provider_mirror::verifier::Verifier;

/// Verify a provider mirror's integrity.
///
/// Validates that all files named by the lock file are present, that their
/// checksums and package hashes match, and that the mirror structure is
/// valid for both Terraform and OpenTofu.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Path to the mirror directory
    #[arg(long, default_value = "./mirror")]
    pub mirror: PathBuf,
}

pub async fn run(args: VerifyArgs, quiet: bool, cancel: &CancellationToken) -> anyhow::Result<()> {
    let verifier = Verifier::new(&args.mirror);

    let cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || verifier.verify(&cancel)).await??;

    if !result.valid {
        if !quiet {
            println!("✗ Mirror verification failed:");
            for error in &result.errors {
                println!("  - {error}");
            }
        }
        bail!("mirror is invalid");
    }

    if !quiet {
        println!("✓ Mirror verified successfully");
        println!("  Providers: {}", result.provider_count);
        println!("  Versions:  {}", result.version_count);
        println!("  Files:     {}", result.file_count);
    }

    Ok(())
}
