//! sprync: sync directories with Sprite VMs
//!
//! A push/pull/diff driver over the sprite control API. The heavy
//! lifting lives in sprync-core (manifests, diffs, tars) and
//! sprync-transport (API client, agent sessions); this crate is
//! argument parsing, token lookup, orchestration, and output.

mod auth;
mod diff;
mod doctor;
mod embedded;
mod pull;
mod push;

use std::fmt::Write as _;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::builder::Styles;
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use sprync_core::Manifest;
use sprync_transport::{Client, Session};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "sprync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Sync directories with Sprite VMs")]
#[command(long_about = r#"
sprync pushes and pulls directory trees between your machine and Sprite
sandbox VMs, transferring only what changed.

Examples:
  sprync push ./project mybox:/app          One-way push
  sprync pull mybox:/app ./project          One-way pull
  sprync diff ./project mybox:/app --json   Machine-readable plan
  sprync push src-box:/app dst-box:/app     Sprite-to-sprite copy
"#)]
struct Cli {
    /// Sprite API token
    #[arg(long, global = true, env = "SPRITE_TOKEN")]
    token: Option<String>,

    /// Sprite API base URL
    #[arg(long, global = true, default_value = "https://api.sprites.dev")]
    api: String,

    /// Operation timeout in seconds
    #[arg(long, global = true, default_value_t = 300, value_name = "SECONDS")]
    timeout: u64,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SyncFlags {
    /// Delete extra files on target
    #[arg(long)]
    delete: bool,

    /// Show what would happen without doing it
    #[arg(long)]
    dry_run: bool,

    /// Exclude pattern (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Gzip tarballs
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    compress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a local directory (or another sprite's directory) to a sprite
    Push {
        /// Source: local directory or sprite:dir
        source: String,
        /// Destination sprite:dir
        target: String,
        #[command(flatten)]
        flags: SyncFlags,
    },
    /// Pull a sprite directory to a local directory
    Pull {
        /// Source sprite:dir
        target: String,
        /// Destination local directory
        local: String,
        #[command(flatten)]
        flags: SyncFlags,
    },
    /// Show what push or pull would do
    Diff {
        /// Local directory
        local: String,
        /// Remote sprite:dir
        target: String,
        #[command(flatten)]
        flags: SyncFlags,
        /// Diff direction: push or pull
        #[arg(long, default_value = "push")]
        mode: String,
        /// JSON output
        #[arg(long)]
        json: bool,
    },
    /// Verify sprite connectivity
    Doctor {
        /// Sprite name
        sprite: String,
    },
    /// Print version
    Version,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    configure_logging(cli.verbose);

    let app = App {
        api: cli.api.clone(),
        token: cli.token.clone(),
    };
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Push {
            source,
            target,
            flags,
        } => with_deadline(timeout, push::run(&app, &source, &target, &flags)).await,
        Commands::Pull {
            target,
            local,
            flags,
        } => with_deadline(timeout, pull::run(&app, &target, &local, &flags)).await,
        Commands::Diff {
            local,
            target,
            flags,
            mode,
            json,
        } => with_deadline(timeout, diff::run(&app, &local, &target, &flags, &mode, json)).await,
        Commands::Doctor { sprite } => with_deadline(timeout, doctor::run(&app, &sprite)).await,
    }
}

async fn with_deadline(timeout: Duration, fut: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("operation timed out after {}s", timeout.as_secs())),
    }
}

fn configure_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Per-invocation API settings shared by the subcommands.
pub(crate) struct App {
    api: String,
    token: Option<String>,
}

impl App {
    /// Build a client authorized for `sprite`, resolving a token from
    /// the flag/env or the sprite CLI.
    pub(crate) async fn client_for(&self, sprite: &str) -> Result<Client> {
        let token = self.require_token(sprite).await?;
        let base = format!("{}/v1/sprites", self.api.trim_end_matches('/'));
        Ok(Client::new(&base, &token))
    }

    async fn require_token(&self, sprite: &str) -> Result<String> {
        if let Some(tok) = &self.token {
            if !tok.is_empty() {
                return Ok(tok.clone());
            }
        }
        tracing::debug!("no token provided, trying sprite CLI");
        let sprite = sprite.to_string();
        tokio::task::spawn_blocking(move || auth::resolve_token(&sprite))
            .await
            .map_err(|e| eyre!("token task: {e}"))?
            .wrap_err("no token: set SPRITE_TOKEN, use --token, or log in with 'sprite login'")
    }
}

/// Open a session on `sprite` with the embedded agent binary.
pub(crate) async fn open_session(client: &Client, sprite: &str) -> Result<Session> {
    let binary = embedded::agent_binary()?;
    Session::open(client.clone(), sprite, binary)
        .await
        .wrap_err("open session")
}

/// Split `sprite:dir`; both halves must be non-empty.
pub(crate) fn parse_target(s: &str) -> Result<(String, String)> {
    match s.split_once(':') {
        Some((sprite, dir)) if !sprite.is_empty() && !dir.is_empty() => {
            Ok((sprite.to_string(), dir.to_string()))
        }
        _ => Err(eyre!("invalid target {s:?} (want sprite:dir)")),
    }
}

pub(crate) fn human_bytes(n: u64) -> String {
    if n >= 1 << 20 {
        format!("{:.1} MB", n as f64 / f64::from(1u32 << 20))
    } else if n >= 1 << 10 {
        format!("{:.1} KB", n as f64 / f64::from(1u32 << 10))
    } else {
        format!("{n} B")
    }
}

/// Render the change list: `+` new, `~` changed, `-` deleted.
pub(crate) fn print_changes(
    transfers: &[String],
    deletes: &[String],
    source_m: &Manifest,
    target_m: &Manifest,
) {
    let mut out = String::new();
    for p in transfers {
        let prefix = if target_m.contains_key(p) { "~" } else { "+" };
        if let Some(e) = source_m.get(p) {
            let _ = writeln!(out, "  {prefix} {p} ({})", human_bytes(e.size));
        }
    }
    for p in deletes {
        let _ = writeln!(out, "  - {p}");
    }
    print!("{out}");
}

/// The `N to transfer (size)[, M to delete]` summary line.
pub(crate) fn summary_line(transfers: usize, bytes: u64, deletes: usize) -> String {
    let mut line = format!("{transfers} to transfer ({})", human_bytes(bytes));
    if deletes > 0 {
        let _ = write!(line, ", {deletes} to delete");
    }
    line
}

pub(crate) fn transfer_size(paths: &[String], m: &Manifest) -> u64 {
    paths.iter().filter_map(|p| m.get(p)).map(|e| e.size).sum()
}
