//! mocker - minimal container runtime CLI
//!
//! ## Usage
//!
//! ```sh
//! mocker pull <name> [tag]
//! mocker images
//! mocker run <name> [tag] [--cpu PERCENT] [--memory MB] [-- cmd...]
//! ```
//!
//! `run` exits with the container's status. Failures before the container
//! starts exit with 125, or 126/127 when the command cannot be executed.

use clap::{Parser, Subcommand};
use mocker::{
    Config, ContainerLauncher, ImageRecord, ImageService, LaunchRequest, Platform, ResourceLimits,
    format_size,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI Parsing
// =============================================================================

/// mocker - pull images and run them in isolated containers
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Pull an image into the local store.
    Pull {
        /// Image name (`hello-world`, `library/alpine:3.18`).
        name: String,
        /// Tag, overriding any tag in the name.
        tag: Option<String>,
    },

    /// List stored images.
    Images,

    /// Run a command from an image in a new container.
    Run {
        /// Image name.
        name: String,
        /// Tag, overriding any tag in the name.
        tag: Option<String>,
        /// CPU ceiling in percent of one CPU.
        #[arg(long)]
        cpu: Option<u32>,
        /// Memory ceiling in MiB.
        #[arg(long)]
        memory: Option<u64>,
        /// Command replacing the image's default.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_pull(config: &Config, name: &str, tag: Option<&str>) -> mocker::Result<ExitCode> {
    let images = ImageService::new(config)?;
    let reference = images.parse_reference(name, tag)?;
    let manifest = images.pull(&reference).await?;
    eprintln!(
        "Pulled {}:{} ({} layers)",
        manifest.name,
        manifest.tag,
        manifest.unique_layers().len()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_images(config: &Config) -> mocker::Result<ExitCode> {
    let images = ImageService::new(config)?;
    print!("{}", render_images(&images.list()?));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    config: &Config,
    name: &str,
    tag: Option<&str>,
    cpu: Option<u32>,
    memory: Option<u64>,
    command: Vec<String>,
) -> mocker::Result<ExitCode> {
    let platform = Platform::detect(&config.cgroup.root);
    debug!(platform = %platform, "host detected");
    platform.require_container_support()?;

    let launcher = ContainerLauncher::new(config)?;
    let mut request = LaunchRequest::new(launcher.images().parse_reference(name, tag)?);
    if !command.is_empty() {
        request.command = Some(command);
    }
    if cpu.is_some() || memory.is_some() {
        request.limits = Some(ResourceLimits {
            cpu_percent: cpu.unwrap_or(config.limits.cpu_percent),
            memory_mb: memory.unwrap_or(config.limits.memory_mb),
        });
    }

    let outcome = launcher.launch(request).await?;
    if let Some(signal) = &outcome.cancelled_by {
        eprintln!("Container {} stopped by {}", outcome.container, signal);
    }
    Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(u8::MAX)))
}

/// Renders the image listing as an ASCII table.
fn render_images(records: &[ImageRecord]) -> String {
    let headers = ["NAME", "TAG", "SIZE", "RECORD"];
    let rows: Vec<[String; 4]> = records
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                r.tag.clone(),
                format_size(r.size_bytes),
                r.record_path.display().to_string(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let separator = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |cells: &[&str]| {
        let body: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!(" {:<w$} ", cell, w = w))
            .collect();
        format!("|{}|\n", body.join("|"))
    };

    let mut out = separator.clone();
    out.push_str(&line(&headers));
    out.push_str(&separator);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push_str(&line(&cells));
    }
    out.push_str(&separator);
    out
}

// =============================================================================
// Main
// =============================================================================

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "mocker=info",
        1 => "mocker=debug",
        _ => "mocker=trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn dispatch(cli: Cli) -> mocker::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Cmd::Pull { name, tag } => cmd_pull(&config, &name, tag.as_deref()).await,
        Cmd::Images => cmd_images(&config),
        Cmd::Run {
            name,
            tag,
            cpu,
            memory,
            command,
        } => cmd_run(&config, &name, tag.as_deref(), cpu, memory, command).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
