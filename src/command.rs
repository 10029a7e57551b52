//! Command-line surface shared by the binaries.
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::db::{self, Pool};
use crate::formatter::FragmentFormatter;
use crate::model::ItemKind;
use crate::preflight;
use crate::reconcile::{self, SweepOptions};
use crate::transfer::{TransferClient, TransferOptions};
use crate::transport::SftpTransport;

/// Flags of the transfer commands; each binary picks the kind of item.
#[derive(Debug, Args)]
pub struct TransferArgs {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Upload pending items to ASP
    #[arg(long)]
    pub upload: bool,

    /// Download and process ASP feedback files
    #[arg(long)]
    pub download: bool,

    /// Perform remote writes and persist changes (dry run otherwise)
    #[arg(long)]
    pub wet_run: bool,

    /// Substitute sandbox SIRETs for ASP's test platform
    #[arg(long)]
    pub test: bool,

    /// Render every pending item without transferring anything
    #[arg(long)]
    pub preflight: bool,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Purge orphan employee records and re-arm archived ones whose approval changed"
)]
pub struct SweepArgs {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Persist changes (dry run otherwise)
    #[arg(long)]
    pub wet_run: bool,

    /// Maximum update notifications created by one run (defaults to config)
    #[arg(long)]
    pub max_notifications: Option<usize>,

    /// Also archive records whose approval expired past the grace period
    #[arg(long)]
    pub archive: bool,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

async fn open(config_path: &Path) -> Result<(Config, Pool)> {
    let cfg = config::load(Some(config_path))
        .with_context(|| format!("loading {}", config_path.display()))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok((cfg, pool))
}

/// Runs the transfer command for one kind of item.
pub async fn run_transfer(kind: ItemKind, args: TransferArgs) -> Result<()> {
    let (cfg, pool) = open(&args.config).await?;
    let formatter = if args.test {
        info!("using sandbox SIRETs");
        FragmentFormatter::sandboxed(cfg.exchange.test_sirets.clone())
    } else {
        FragmentFormatter::new()
    };

    if args.preflight {
        let checked = preflight::check_pending(&pool, &formatter, kind, Utc::now())
            .await
            .context("preflight failed")?;
        info!(checked, "all pending items render");
        return Ok(());
    }

    if !args.upload && !args.download {
        warn!("neither --upload nor --download given; nothing to do");
        return Ok(());
    }

    let dry_run = !args.wet_run;
    if dry_run {
        info!("dry run: no remote write, no deletion, no state change");
    }
    let transport = SftpTransport::connect(&cfg.sftp)
        .await
        .with_context(|| format!("connecting to {}:{}", cfg.sftp.host, cfg.sftp.port))?;
    let client = TransferClient::new(
        &pool,
        &transport,
        &formatter,
        TransferOptions {
            kind,
            dry_run,
            max_batches: cfg.exchange.max_batches_per_run,
        },
    );

    // Feedback first: it may free items for this run's upload.
    if args.download {
        let report = client.download().await?;
        info!(
            files = report.files,
            completed = report.completed.len(),
            kept = report.kept.len(),
            skipped = report.skipped.len(),
            "download finished"
        );
    }
    if args.upload {
        let report = client.upload().await?;
        info!(
            files = report.uploaded.len(),
            items = report.items_sent,
            failed_batches = report.failed_batches,
            failed_items = report.failed_items,
            "upload finished"
        );
    }
    Ok(())
}

pub async fn run_sweep(args: SweepArgs) -> Result<()> {
    let (cfg, pool) = open(&args.config).await?;
    let options = SweepOptions {
        dry_run: !args.wet_run,
        max_notifications: args
            .max_notifications
            .unwrap_or(cfg.exchange.max_sweep_notifications),
        max_archive: cfg.exchange.max_archive_per_run,
        archive: args.archive,
    };
    reconcile::run(&pool, options, Utc::now()).await?;
    Ok(())
}
