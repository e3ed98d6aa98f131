// Ralph batch runner - runs a shell command for every item, in parallel

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use ralph_batch_lib::config::{credentials_from_env, BatchConfig, PartialBatchConfig};
use ralph_batch_lib::credentials::{CredentialPool, RateLimitDetector};
use ralph_batch_lib::parallel::{ParallelCoordinator, RunReport, WorkerContext};
use ralph_batch_lib::sanitize::sanitize_path;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Ralph Batch - run one command per work item on a bounded worker pool
#[derive(Parser, Debug)]
#[command(name = "ralph-batch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Item ID to process (repeatable)
    #[arg(short, long = "item")]
    items: Vec<String>,

    /// File with one item ID per line ('#' starts a comment)
    #[arg(long)]
    items_file: Option<PathBuf>,

    /// Concurrent workers (default 3, capped at 10)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Project directory searched for .ralph-ui/batch.toml
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Base directory for per-item output directories
    #[arg(long, default_value = ".ralph-batch")]
    output_dir: PathBuf,

    /// Environment variable holding the credential list
    #[arg(long)]
    credentials_env: Option<String>,

    /// Run without a credential pool
    #[arg(long)]
    no_credentials: bool,

    /// List the items that would run and exit
    #[arg(long)]
    dry_run: bool,

    /// Write the IDs of items that never started to this JSON file
    #[arg(long, env = "RALPH_BATCH_CHECKPOINT_FILE")]
    checkpoint_file: Option<PathBuf>,

    /// Write the full run report to this JSON file
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Shell command to run for each item
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) if report.is_clean() => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: &Cli) -> Result<RunReport> {
    let overrides = PartialBatchConfig {
        max_workers: cli.workers,
        credentials_env: cli.credentials_env.clone(),
        ..Default::default()
    };
    let config = BatchConfig::load(cli.project_dir.as_deref(), overrides)?;

    let items = collect_items(cli)?;
    if items.is_empty() {
        bail!("No items given (use --item or --items-file)");
    }

    let mut coordinator = ParallelCoordinator::from_config(&config)?;

    if cli.dry_run {
        return Ok(coordinator.execute(&items, |id| id.clone(), |_, _| Ok(()), true));
    }

    if cli.command.is_empty() {
        bail!("No command given (pass it after `--`)");
    }
    let script = cli.command.join(" ");

    if !cli.no_credentials {
        let credentials = credentials_from_env(&config.credentials_env)?;
        let pool = CredentialPool::with_backoff(credentials, config.backoff_window())?;
        coordinator = coordinator.with_credentials(Arc::new(pool));
    }

    fs::create_dir_all(&cli.output_dir).map_err(|e| {
        anyhow!(
            "Failed to create output directory '{}': {}",
            cli.output_dir.display(),
            e
        )
    })?;

    let detector = RateLimitDetector::new();
    let backoff = config.backoff_window();

    let report = coordinator.execute(
        &items,
        |id| id.clone(),
        |id, ctx| run_item(id, ctx, &script, &cli.output_dir, &detector, backoff),
        false,
    );

    if let Some(path) = &cli.checkpoint_file {
        write_json(path, &report.checkpoints)?;
        if !report.checkpoints.is_empty() {
            log::info!(
                "Wrote {} checkpointed items to {}",
                report.checkpoints.len(),
                path.display()
            );
        }
    }
    if let Some(path) = &cli.report_file {
        write_json(path, &report)?;
    }

    Ok(report)
}

fn run_item(
    id: &str,
    ctx: &mut WorkerContext<'_>,
    script: &str,
    output_dir: &Path,
    detector: &RateLimitDetector,
    default_backoff: std::time::Duration,
) -> Result<()> {
    let item_dir = sanitize_path(Path::new(id), output_dir)?;
    fs::create_dir_all(&item_dir).map_err(|e| {
        anyhow!(
            "Failed to create item directory '{}': {}",
            item_dir.display(),
            e
        )
    })?;

    let mut command = shell_command(script);
    command.env("RALPH_ITEM_ID", id).env("RALPH_ITEM_DIR", &item_dir);
    if let Some(credential) = ctx.credential() {
        command.env("RALPH_CREDENTIAL", credential.expose());
    }

    let output = command
        .output()
        .map_err(|e| anyhow!("Failed to run command: {}", e))?;

    ctx.print(&String::from_utf8_lossy(&output.stdout));
    let stderr = String::from_utf8_lossy(&output.stderr);
    ctx.print(&stderr);

    if let Some(signal) = detector.detect(&stderr) {
        let window = signal.retry_after.unwrap_or(default_backoff);
        log::warn!(
            "[{}] Rate limit detected ({:?}), backing off credential for {:?}",
            id,
            signal.kind,
            window
        );
        ctx.mark_rate_limited_for(window)?;
    }

    if !output.status.success() {
        bail!("command exited with {}", output.status);
    }
    Ok(())
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

fn collect_items(cli: &Cli) -> Result<Vec<String>> {
    let mut items = cli.items.clone();

    if let Some(path) = &cli.items_file {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read items file '{}': {}", path.display(), e))?;
        items.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    Ok(items)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow!("Failed to serialize {}: {}", path.display(), e))?;
    fs::write(path, json).map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))
}
