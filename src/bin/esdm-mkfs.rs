//! esdm-mkfs - format and check the storage roots named in an ESDM configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use esdm::{Accessibility, Esdm, EsdmConfig, FormatFlags};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "esdm-mkfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "esdm.conf", global = true)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (and optionally wipe) backend roots
    Format {
        /// Remove existing roots first
        #[arg(short = 'r', long)]
        remove: bool,
        /// Create missing roots and layout directories
        #[arg(short = 'c', long)]
        create: bool,
        /// Log failures and continue
        #[arg(short = 'i', long)]
        ignore_errors: bool,
        /// Shorthand for --remove --create --ignore-errors
        #[arg(short = 'f', long)]
        purge_recreate: bool,
        /// Which backends to format
        #[arg(short, long, value_enum, default_value_t = Target::Global)]
        target: Target,
    },
    /// Validate backend roots and repair their layout
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Global,
    NodeLocal,
}

impl From<Target> for Accessibility {
    fn from(target: Target) -> Self {
        match target {
            Target::Global => Accessibility::Global,
            Target::NodeLocal => Accessibility::NodeLocal,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EsdmConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let esdm = Esdm::init(config).await.context("initializing backends")?;

    match cli.command {
        Commands::Format {
            remove,
            create,
            ignore_errors,
            purge_recreate,
            target,
        } => {
            let mut flags = FormatFlags::from_bits(0);
            if remove {
                flags = flags | FormatFlags::DELETE;
            }
            if create {
                flags = flags | FormatFlags::CREATE;
            }
            if ignore_errors {
                flags = flags | FormatFlags::IGNORE_ERRORS;
            }
            if purge_recreate {
                flags = flags | FormatFlags::PURGE_RECREATE;
            }
            if flags.bits() == 0 {
                bail!("nothing to do: pass --create, --remove or --purge-recreate");
            }

            esdm.mkfs(flags, target.into()).await.context("mkfs failed")?;
            println!("Formatted backends (flags {:#x})", flags.bits());
        }
        Commands::Check => {
            let report = esdm.fsck().await.context("fsck failed")?;
            println!("Checked {} entries", report.checked);
            for repaired in &report.repaired {
                println!("  repaired: {}", repaired);
            }
            for corrupt in &report.corrupt {
                println!("  corrupt:  {}", corrupt);
            }
            if !report.is_clean() {
                bail!("{} corrupt entries found", report.corrupt.len());
            }
        }
    }

    esdm.finalize().await?;
    Ok(())
}
