//! `orbitdock-sync` runs the sync engine from a terminal.
//!
//! `watch` mirrors the server and prints what changes; `status` checks that
//! the server answers on `/health`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use orbitdock_client::health::check_health;
use orbitdock_client::logging::init_logging;
use orbitdock_client::{DataPaths, EngineEvent, SyncConfig, SyncEngine, VERSION};
use orbitdock_protocol::ServerMessage;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "orbitdock-sync", version, about = "Mirror OrbitDock sessions")]
struct Cli {
    /// Data directory (config file, auth token, logs).
    #[arg(long, env = "ORBITDOCK_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// WebSocket URL of the server.
    #[arg(long, env = "ORBITDOCK_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Bearer token for the server.
    #[arg(long, env = "ORBITDOCK_AUTH_TOKEN", global = true, hide_env_values = true)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect and print session activity until interrupted.
    Watch {
        /// Session ids to subscribe to for full live state.
        #[arg(long = "session", value_name = "ID")]
        sessions: Vec<String>,

        /// Also write engine logs to stderr.
        #[arg(long)]
        log_stderr: bool,
    },
    /// Check whether the server is reachable.
    Status {
        /// Request timeout in milliseconds.
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

impl Cli {
    fn config(&self, paths: &DataPaths) -> anyhow::Result<SyncConfig> {
        let mut config = SyncConfig::load(paths)
            .with_context(|| format!("loading config from {}", paths.root().display()))?;
        if let Some(url) = &self.server_url {
            config.server_url = url.clone();
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    let mut config = cli.config(&paths)?;

    match cli.command {
        Command::Watch {
            sessions,
            log_stderr,
        } => {
            config.log.stderr |= log_stderr;
            let logging = init_logging(&paths, &config.log)?;
            info!(
                component = "cli",
                event = "cli.watch.start",
                run_id = %logging.run_id,
                log_path = %logging.log_path.display(),
                server_url = %config.server_url,
                sessions = sessions.len(),
            );
            let result = watch(config, sessions).await;
            drop(logging);
            result
        }
        Command::Status { timeout_ms } => status(&config, &paths, timeout_ms).await,
    }
}

async fn watch(config: SyncConfig, sessions: Vec<String>) -> anyhow::Result<()> {
    let handle = SyncEngine::spawn_ws(config);
    let mut events = handle.events();
    for id in &sessions {
        handle.subscribe(id).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&handle, &event),
                Err(RecvError::Lagged(n)) => println!("  (skipped {n} events)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn print_event(handle: &orbitdock_client::EngineHandle, event: &EngineEvent) {
    match event {
        EngineEvent::Connection(state) => println!("  connection: {state:?}"),
        EngineEvent::ServerError {
            code,
            message,
            session_id,
        } => println!(
            "  error [{code}] {message}{}",
            session_id
                .as_deref()
                .map(|id| format!(" (session {id})"))
                .unwrap_or_default()
        ),
        EngineEvent::Server(msg) => match msg.as_ref() {
            ServerMessage::SessionsList { .. } => {
                println!("  sessions: {}", handle.sessions().len());
                for s in handle.sessions().iter() {
                    println!(
                        "    {} {:?} {:?} {}",
                        s.id,
                        s.status,
                        s.work_status,
                        s.custom_name
                            .as_deref()
                            .or(s.project_name.as_deref())
                            .unwrap_or(&s.project_path)
                    );
                }
            }
            ServerMessage::SessionSnapshot { session } => println!(
                "  {}: snapshot, {} messages",
                session.id,
                session.messages.len()
            ),
            ServerMessage::MessageAppended {
                session_id,
                message,
            } => println!(
                "  {session_id}: {:?} {}",
                message.message_type,
                preview(&message.content)
            ),
            ServerMessage::ApprovalRequested {
                session_id,
                request,
            } => println!(
                "  {session_id}: approval requested ({:?}) {}",
                request.approval_type,
                request
                    .command
                    .as_deref()
                    .or(request.file_path.as_deref())
                    .or(request.question.as_deref())
                    .unwrap_or_default()
            ),
            ServerMessage::TokensUpdated { session_id, usage } => println!(
                "  {session_id}: context {:.0}% full, cache hits {:.0}%",
                usage.context_fill_percent(),
                usage.cache_hit_percent()
            ),
            ServerMessage::SessionEnded { session_id, reason } => {
                println!("  {session_id}: ended ({reason})")
            }
            _ => {}
        },
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(80).collect();
    if line.chars().count() > 80 {
        out.push('…');
    }
    out
}

async fn status(config: &SyncConfig, paths: &DataPaths, timeout_ms: u64) -> anyhow::Result<()> {
    println!();
    println!("  OrbitDock Sync v{}", VERSION);
    println!("  Data dir: {}", paths.root().display());
    println!("  Server: {}", config.server_url);
    println!(
        "  Auth token: {}",
        if config.auth_token.is_some() {
            "configured"
        } else {
            "none"
        }
    );

    let base = config.http_base_url();
    match check_health(&base, Duration::from_millis(timeout_ms)).await {
        Ok(report) => println!(
            "  Health: {} ({}, {} ms)",
            report.body,
            report.url,
            report.latency.as_millis()
        ),
        Err(e) => {
            println!("  Health: unreachable ({e})");
            println!();
            anyhow::bail!("server at {base} is not healthy");
        }
    }
    println!();
    Ok(())
}
