//! Scalpel CLI - recursive dissection of binary evidence
//!
//! Runs every file given on the command line through the worker pool and
//! prints the resulting dissection trees.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scalpel_core::DissectionDatabase;
use scalpel_engine::{DissectionEngine, DissectionNode, DissectorRegistry, EngineConfig, PoolConfig, WorkerPool};
use scalpel_ledger::{JsonLedger, JsonLedgerConfig, RedbLedger};
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "scalpel")]
#[command(about = "Scalpel - recursive forensic dissection of binary containers", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Dissect one or more files
    Dissect {
        /// Files to dissect
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Concurrent jobs (defaults to available parallelism)
        #[arg(long)]
        workers: Option<usize>,

        /// Deepest nesting level dissected
        #[arg(long, default_value = "16")]
        max_depth: usize,

        /// Always dissect, ignoring stored records
        #[arg(long)]
        no_cache: bool,

        /// Record ledger, as json:PATH or redb:PATH
        #[arg(long, value_parser = parse_ledger)]
        ledger: Option<LedgerSpec>,

        /// Output format
        #[arg(long, value_enum, default_value = "tree")]
        format: Format,

        /// Per-file time limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List registered dissectors
    Formats,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Tree,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LedgerSpec {
    Json(PathBuf),
    Redb(PathBuf),
}

fn parse_ledger(value: &str) -> std::result::Result<LedgerSpec, String> {
    match value.split_once(':') {
        Some(("json", path)) if !path.is_empty() => Ok(LedgerSpec::Json(PathBuf::from(path))),
        Some(("redb", path)) if !path.is_empty() => Ok(LedgerSpec::Redb(PathBuf::from(path))),
        _ => Err(format!("expected json:PATH or redb:PATH, got '{}'", value)),
    }
}

impl LedgerSpec {
    fn open(&self) -> Result<Arc<dyn DissectionDatabase>> {
        Ok(match self {
            LedgerSpec::Json(path) => Arc::new(
                JsonLedger::open(path, JsonLedgerConfig { pretty: true })
                    .with_context(|| format!("opening JSON ledger {}", path.display()))?,
            ),
            LedgerSpec::Redb(path) => Arc::new(
                RedbLedger::open(path)
                    .with_context(|| format!("opening redb ledger {}", path.display()))?,
            ),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(
        DissectorRegistry::builder()
            .register_all(scalpel_zones::dissectors())?
            .build(),
    );

    match cli.command {
        Command::Dissect {
            files,
            workers,
            max_depth,
            no_cache,
            ledger,
            format,
            timeout,
        } => {
            let config = EngineConfig {
                max_depth,
                use_cache: !no_cache,
                ..EngineConfig::default()
            };
            let mut engine = DissectionEngine::new(registry, config);
            if let Some(spec) = &ledger {
                engine = engine.with_database(spec.open()?);
            }

            let mut pool_config = PoolConfig {
                job_timeout: timeout.map(Duration::from_secs),
                ..PoolConfig::default()
            };
            if let Some(workers) = workers {
                pool_config.workers = workers.max(1);
            }

            cmd_dissect(engine, pool_config, &files, format)
        }
        Command::Formats => {
            cmd_formats(&registry);
            Ok(())
        }
    }
}

fn cmd_dissect(engine: DissectionEngine, config: PoolConfig, files: &[PathBuf], format: Format) -> Result<()> {
    info!(files = files.len(), workers = config.workers, "Dissecting");
    let pool = WorkerPool::new(engine, config).context("starting worker pool")?;
    let handles: Vec<_> = files.iter().map(|path| pool.submit_path(path)).collect();

    let mut failures = 0usize;
    let mut reports = Vec::with_capacity(files.len());
    for (path, handle) in files.iter().zip(handles) {
        match handle.wait() {
            Ok(node) => {
                match format {
                    Format::Tree => {
                        let mut rendered = String::new();
                        write_tree(&mut rendered, &node)?;
                        print!("{}", rendered);
                    }
                    Format::Json => reports.push(serde_json::json!({
                        "path": path.display().to_string(),
                        "result": node,
                    })),
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("Error: {}: {}", path.display(), e);
                if format == Format::Json {
                    reports.push(serde_json::json!({
                        "path": path.display().to_string(),
                        "error": e.to_string(),
                    }));
                }
            }
        }
    }

    pool.shutdown();
    info!(files = files.len(), failures, "Dissection complete");

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failures > 0 {
        bail!("{} of {} files failed", failures, files.len());
    }
    Ok(())
}

fn cmd_formats(registry: &DissectorRegistry) {
    println!("{:<10} {:<9} {:<22} {}", "Name", "Priority", "Media types", "Description");
    println!("{}", "-".repeat(70));
    for info in registry.infos() {
        let media_types = if info.media_types.is_empty() {
            "*".to_string()
        } else {
            info.media_types.join(",")
        };
        println!(
            "{:<10} {:<9} {:<22} {}",
            info.name, info.priority, media_types, info.description
        );
    }
}

/// Indented one-line-per-node rendering, depth first
fn write_tree(out: &mut impl fmt::Write, root: &DissectionNode) -> fmt::Result {
    let mut stack = vec![(root, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        let indent = "  ".repeat(depth);
        write!(
            out,
            "{}{} [{}] {} {}",
            indent,
            node.name,
            format_bytes(node.length),
            node.fingerprint.short(),
            node.outcome
        )?;
        if let Some(dissector) = &node.dissector {
            write!(out, " by {}", dissector)?;
        }
        if let Some(reason) = &node.reason {
            write!(out, " ({})", reason)?;
        }
        if node.cached {
            out.write_str(" (cached)")?;
        }
        if !node.labels.is_empty() {
            write!(out, " labels={}", node.labels.join(","))?;
        }
        writeln!(out)?;
        for error in &node.errors {
            writeln!(out, "{}  ! {}", indent, error)?;
        }
        stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1_048_576 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else if bytes < 1_073_741_824 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    }
}
