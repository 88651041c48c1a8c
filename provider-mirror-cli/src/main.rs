//! Provider Mirror CLI.

use std::io::IsTerminal;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "provider-mirror",
    version,
    about = "Build reproducible Terraform and OpenTofu provider mirrors",
    long_about = "Provider Mirror is a CLI utility for building reproducible Terraform\n\
                  and OpenTofu provider mirrors as static build artifacts.\n\n\
                  It takes a declarative YAML manifest describing required providers and\n\
                  generates a filesystem mirror consumable by both Terraform and OpenTofu."
)]
struct Cli {
    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase verbosity (-v for verbose, -vv for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Build(commands::build::BuildArgs),
    Plan(commands::plan::PlanArgs),
    Verify(commands::verify::VerifyArgs),
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            if err
                .downcast_ref::<provider_mirror::Error>()
                .is_some_and(provider_mirror::Error::is_cancelled)
            {
                eprintln!("\nInterrupted");
                std::process::exit(130);
            }
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging(&cli)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Progress bars need a terminal, text output, and a non-quiet run.
    let show_progress =
        !cli.quiet && cli.log_format == LogFormat::Text && std::io::stderr().is_terminal();

    match cli.command {
        Command::Build(args) => commands::build::run(args, cli.quiet, show_progress, &cancel).await,
        Command::Plan(args) => commands::plan::run(args, cli.quiet, &cancel).await,
        Command::Verify(args) => commands::verify::run(args, cli.quiet, &cancel).await,
        Command::Version => {
            println!("provider-mirror {}", env!("CARGO_PKG_VERSION"));
            println!(
                "  commit:       {}",
                option_env!("PROVIDER_MIRROR_COMMIT").unwrap_or("unknown")
            );
            println!(
                "  built:        {}",
                option_env!("PROVIDER_MIRROR_BUILD_TIME").unwrap_or("unknown")
            );
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    if cli.quiet && cli.verbose > 0 {
        bail!("--quiet and --verbose are mutually exclusive");
    }

    let level = if cli.quiet {
        "error"
    } else if cli.verbose >= 2 {
        "debug"
    } else if cli.verbose == 1 {
        "info"
    } else {
        // Normal mode keeps the human-readable command output as the
        // primary surface; structured logs start at -v.
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Trips the cancellation token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}
