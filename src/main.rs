//! devrack: start, stop and watch the dev servers of a project.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `.dev/servers.json`, and drives the lifecycle operations,
//! printing their progress and results.

mod config;
mod error;
mod events;
mod follow;
mod health;
mod lifecycle;
mod output;
mod ports;
mod process;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{DevPaths, ServersConfig};
use crate::error::DevError;
use crate::events::Event;
use crate::follow::{follow_logs, FollowExit, SERVER_POLL_INTERVAL};
use crate::lifecycle::{Lifecycle, StartOutcome, StartSettings, StopOutcome};
use crate::ports::{AnnouncementPattern, SystemPorts, DEFAULT_ANNOUNCEMENT};
use crate::process::{OsSupervisor, Supervisor};
use crate::state::RuntimeRecord;

const DEFAULT_GRACE_MS: u64 = 3000;
const TRACING_ENV: &str = "DEVRACK_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Start, stop and watch local dev servers",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Project root containing the .dev directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Command used to follow logs (default: $DEV_LOG_VIEWER, then "tail -f").
    #[arg(long, global = true)]
    log_viewer: Option<String>,
    /// Increase diagnostic output (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create .dev/servers.json from the scripts in package.json.
    Init,
    /// Start a server (the first configured one by default).
    Start(StartArgs),
    /// Stop a server, or every running server.
    Stop { name: Option<String> },
    /// List recorded servers and prune dead ones.
    Status,
    /// Print the port of every running server.
    Port,
    /// Follow the log of a running server.
    Logs { name: Option<String> },
    /// Remove records of servers that are no longer running.
    Cleanup,
    /// `devrack <name>` is shorthand for `devrack start <name>`.
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(Debug, Parser)]
#[command(name = "start")]
struct StartArgs {
    /// Server to start.
    name: Option<String>,
    /// Return after the server is healthy instead of following its log.
    #[arg(long)]
    detach: bool,
    /// Milliseconds to wait after launch before detecting the port.
    #[arg(long, default_value_t = DEFAULT_GRACE_MS)]
    grace_ms: u64,
    /// Regex with one capture group matching the port a server announces.
    #[arg(long)]
    port_pattern: Option<String>,
}

impl StartArgs {
    fn from_shorthand(args: &[String]) -> Result<Self> {
        let argv = std::iter::once("start".to_string()).chain(args.iter().cloned());
        Ok(StartArgs::try_parse_from(argv)?)
    }

    fn settings(&self) -> Result<StartSettings> {
        let pattern = self.port_pattern.as_deref().unwrap_or(DEFAULT_ANNOUNCEMENT);
        let mut settings = StartSettings::new(AnnouncementPattern::new(pattern)?);
        settings.startup_grace = Duration::from_millis(self.grace_ms);
        Ok(settings)
    }
}

impl Default for StartArgs {
    fn default() -> Self {
        Self {
            name: None,
            detach: false,
            grace_ms: DEFAULT_GRACE_MS,
            port_pattern: None,
        }
    }
}

/// Shared handles for one invocation.
struct Invocation {
    paths: DevPaths,
    supervisor: Arc<dyn Supervisor>,
    log_viewer: Option<String>,
}

impl Invocation {
    fn lifecycle(&self, settings: StartSettings) -> Lifecycle {
        Lifecycle::new(
            self.paths.clone(),
            Arc::clone(&self.supervisor),
            Arc::new(SystemPorts),
            settings,
        )
    }

    fn plain_lifecycle(&self) -> Result<Lifecycle> {
        Ok(self.lifecycle(StartArgs::default().settings()?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let ctx = Invocation {
        paths: DevPaths::new(root),
        supervisor: Arc::new(OsSupervisor::new()),
        log_viewer: cli.log_viewer,
    };

    match cli.command {
        None => run_start(&ctx, StartArgs::default()).await,
        Some(Commands::Init) => run_init(&ctx),
        Some(Commands::Start(args)) => run_start(&ctx, args).await,
        Some(Commands::External(args)) => run_start(&ctx, StartArgs::from_shorthand(&args)?).await,
        Some(Commands::Stop { name }) => run_stop(&ctx, name.as_deref()).await,
        Some(Commands::Status) => run_status(&ctx).await,
        Some(Commands::Port) => run_port(&ctx),
        Some(Commands::Logs { name }) => run_logs(&ctx, name.as_deref()).await,
        Some(Commands::Cleanup) => run_cleanup(&ctx).await,
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(TRACING_ENV).unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(ctx: &Invocation) -> Result<()> {
    let names = config::init_project(&ctx.paths)?;
    println!(
        "Created {} with servers: {}",
        ctx.paths.servers_file().display(),
        names.join(", ")
    );
    println!("Run `devrack start <name>` to launch one.");
    Ok(())
}

fn load_servers(ctx: &Invocation) -> Result<ServersConfig> {
    config::load_servers(&ctx.paths).context("failed to load server config")
}

async fn run_start(ctx: &Invocation, args: StartArgs) -> Result<()> {
    let servers = load_servers(ctx)?;
    let name = match &args.name {
        Some(name) => name.clone(),
        None => servers
            .first()
            .map(str::to_string)
            .ok_or(DevError::NoServersConfigured)?,
    };

    let (event_tx, event_rx) = mpsc::channel(32);
    let printer = spawn_event_printer(event_rx);
    let outcome = {
        let lifecycle = ctx.lifecycle(args.settings()?).with_events(event_tx);
        lifecycle.start(&servers, &name).await
    };
    let _ = printer.await;

    match outcome? {
        StartOutcome::AlreadyRunning { name, record } => {
            println!(
                "{} is already running on port {} (pid {})",
                name, record.port, record.pid
            );
            Ok(())
        }
        StartOutcome::Started {
            name,
            record,
            port_source,
        } => {
            println!(
                "{} is running on port {} (pid {}, port {})",
                name, record.port, record.pid, port_source
            );
            println!("Logs: {}", ctx.paths.log_file(&name).display());
            if args.detach {
                return Ok(());
            }
            follow(ctx, &name, record.pid).await
        }
    }
}

async fn run_stop(ctx: &Invocation, name: Option<&str>) -> Result<()> {
    let outcomes = ctx.plain_lifecycle()?.stop(name).await?;
    if outcomes.is_empty() {
        println!("No servers running");
    }
    for outcome in outcomes {
        match outcome {
            StopOutcome::Stopped { name, record } => {
                println!("Stopped {} (pid {}, port {})", name, record.pid, record.port)
            }
            StopOutcome::AlreadyDead { name, record } => {
                println!("{} was not running (pid {} gone), record removed", name, record.pid)
            }
            StopOutcome::NotRunning { name } => println!("{} is not running", name),
        }
    }
    Ok(())
}

async fn run_status(ctx: &Invocation) -> Result<()> {
    let entries = ctx.plain_lifecycle()?.status().await?;
    if entries.is_empty() {
        println!("No servers running");
        return Ok(());
    }
    println!("Running servers:");
    for entry in entries {
        if entry.alive {
            println!("  {}", describe_record(&entry.name, &entry.record));
        } else {
            println!(
                "  {}: DEAD (pid {}) cleaning up",
                entry.name, entry.record.pid
            );
        }
    }
    Ok(())
}

fn run_port(ctx: &Invocation) -> Result<()> {
    let running = ctx.plain_lifecycle()?.running()?;
    if running.is_empty() {
        println!("No servers running");
    }
    for (name, record) in running {
        println!("{}: {}", name, record.port);
    }
    Ok(())
}

async fn run_cleanup(ctx: &Invocation) -> Result<()> {
    let removed = ctx.plain_lifecycle()?.cleanup().await?;
    if removed.is_empty() {
        println!("No stale entries");
    }
    for entry in removed {
        println!(
            "Cleaned up stale entry: {} (pid {})",
            entry.name, entry.record.pid
        );
    }
    Ok(())
}

async fn run_logs(ctx: &Invocation, name: Option<&str>) -> Result<()> {
    let running = ctx.plain_lifecycle()?.running()?;
    let target = match name {
        Some(name) => running.into_iter().find(|(candidate, _)| candidate == name),
        None if running.len() > 1 => {
            println!("Several servers are running; pick one:");
            for (name, record) in &running {
                println!("  devrack logs {}  (port {})", name, record.port);
            }
            return Ok(());
        }
        None => running.into_iter().next(),
    };

    match (target, name) {
        (Some((name, record)), _) => follow(ctx, &name, record.pid).await,
        (None, Some(name)) => {
            println!("{} is not running", name);
            Ok(())
        }
        (None, None) => {
            println!("No servers running");
            Ok(())
        }
    }
}

async fn follow(ctx: &Invocation, name: &str, pid: u32) -> Result<()> {
    let lifecycle = ctx.plain_lifecycle()?;
    let viewer = config::log_viewer_command(ctx.log_viewer.as_deref());
    let log_file = lifecycle.paths().log_file(name);
    let exit = follow_logs(
        &viewer,
        &log_file,
        pid,
        Arc::clone(&ctx.supervisor),
        SERVER_POLL_INTERVAL,
    )
    .await?;

    match exit {
        FollowExit::Interrupted(signal) => {
            println!();
            println!(
                "Stopped following ({:?}); {} keeps running, use `devrack stop {}` to stop it",
                signal, name, name
            );
        }
        FollowExit::ViewerExited => {}
        FollowExit::ServerExited => {
            lifecycle.forget(name, pid).await?;
            println!("{} (pid {}) exited; record removed", name, pid);
        }
    }
    Ok(())
}

fn spawn_event_printer(mut rx: mpsc::Receiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::StaleRecordDropped { name, pid } => {
                    println!("Removed stale entry for {} (pid {} is gone)", name, pid)
                }
                Event::Starting { name, command } => println!("Starting {}: {}", name, command),
                Event::Spawned { name, pid } => {
                    println!("  {} spawned as pid {}, waiting for startup...", name, pid)
                }
                Event::PortResolved { name, resolved } => {
                    println!("  {} uses port {} ({})", name, resolved.port, resolved.source)
                }
                Event::HealthChecking { name, url } => {
                    println!("  checking {} at {}", name, url)
                }
                Event::Terminating { name, pid } => {
                    println!("  {} did not respond, stopping pid {}", name, pid)
                }
            }
        }
    })
}

fn describe_record(name: &str, record: &RuntimeRecord) -> String {
    let uptime = record
        .started_at()
        .map(|started| format_uptime((Utc::now() - started).num_seconds()))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "{}: port {}, pid {}, {}, up {}",
        name, record.port, record.pid, record.status, uptime
    )
}

fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
