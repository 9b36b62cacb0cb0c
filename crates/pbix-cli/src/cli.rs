use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pbix_package::ConnectionBinding;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::manifest::{BindingManifest, Job};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pbix-connection")]
#[command(about = "Strip or rebind the live connection stored inside PowerBI report packages.")]
pub struct Cli {
    /// Log more detail (repeatable). `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Remove the live connection so the package can be distributed as a template.
    Strip {
        /// Package to rewrite in place.
        package: PathBuf,
    },
    /// Point the package at a dataset in a workspace, replacing any existing connection.
    Bind {
        /// Package to rewrite in place.
        package: PathBuf,

        /// Workspace (group) id used as the connection's catalog.
        #[arg(long)]
        workspace_id: String,

        /// Dataset id the report should read from.
        #[arg(long)]
        dataset_id: String,
    },
    /// Print the workspace and dataset a package is bound to.
    Show {
        package: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Strip or bind every package listed in a JSON manifest.
    Apply {
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,
    },
    /// Delete temp files left next to packages by interrupted rewrites.
    CleanTemp {
        /// Directory holding the packages.
        dir: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct JsonBinding<'a> {
    package: String,
    bound: bool,
    workspace_id: Option<&'a str>,
    dataset_id: Option<&'a str>,
}

pub fn run() -> Result<()> {
    run_with_args(Cli::parse())
}

pub fn run_with_args(cli: Cli) -> Result<()> {
    init_logging(cli.verbose);

    match cli.command {
        Command::Strip { package } => {
            pbix_package::strip(&package)
                .with_context(|| format!("strip connection from {}", package.display()))?;
            emit(format_args!("stripped {}", package.display()))
        }
        Command::Bind {
            package,
            workspace_id,
            dataset_id,
        } => {
            pbix_package::bind(&package, &workspace_id, &dataset_id)
                .with_context(|| format!("bind {}", package.display()))?;
            emit(format_args!(
                "bound {} to workspace {workspace_id}, dataset {dataset_id}",
                package.display()
            ))
        }
        Command::Show { package, format } => {
            let binding = pbix_package::read_connection(&package)
                .with_context(|| format!("read connection from {}", package.display()))?;
            show(&package, binding.as_ref(), format)
        }
        Command::Apply { manifest } => apply(&manifest),
        Command::CleanTemp { dir } => {
            let removed = pbix_fs::clean_stale_temp_files(&dir)
                .with_context(|| format!("clean temp files in {}", dir.display()))?;
            for path in &removed {
                emit(format_args!("removed {}", path.display()))?;
            }
            emit(format_args!("{} temp file(s) removed", removed.len()))
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // `log` records from the library crates are forwarded by the subscriber's log bridge.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn show(package: &Path, binding: Option<&ConnectionBinding>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => match binding {
            Some(binding) => emit(format_args!(
                "{}: workspace {}, dataset {}",
                package.display(),
                binding.workspace_id.as_deref().unwrap_or("(unknown)"),
                binding.dataset_id
            )),
            None => emit(format_args!("{}: no connection", package.display())),
        },
        OutputFormat::Json => {
            let report = JsonBinding {
                package: package.display().to_string(),
                bound: binding.is_some(),
                workspace_id: binding.and_then(|b| b.workspace_id.as_deref()),
                dataset_id: binding.map(|b| b.dataset_id.as_str()),
            };
            let json = serde_json::to_string_pretty(&report)?;
            emit(format_args!("{json}"))
        }
    }
}

fn apply(manifest: &Path) -> Result<()> {
    // Resolve everything up front so a bad entry fails the run before any package is rewritten.
    let jobs = BindingManifest::load_jobs(manifest)?;
    log::info!("applying {} job(s) from {}", jobs.len(), manifest.display());

    for job in &jobs {
        match job {
            Job::Strip { path } => {
                pbix_package::strip(path)
                    .with_context(|| format!("strip connection from {}", path.display()))?;
                emit(format_args!("stripped {}", path.display()))?;
            }
            Job::Bind {
                path,
                workspace_id,
                dataset_id,
            } => {
                pbix_package::bind(path, workspace_id, dataset_id)
                    .with_context(|| format!("bind {}", path.display()))?;
                emit(format_args!(
                    "bound {} to workspace {workspace_id}, dataset {dataset_id}",
                    path.display()
                ))?;
            }
        }
    }
    Ok(())
}

/// Print one line to stdout. A closed pipe (e.g. `pbix-connection show ... | head`) is not an
/// error.
fn emit(line: std::fmt::Arguments<'_>) -> Result<()> {
    let mut out = io::stdout().lock();
    match writeln!(out, "{line}").and_then(|()| out.flush()) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}
