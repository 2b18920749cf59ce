//! wbconsole - browser workbench console server.
//!
//! **Default** (`wbconsole` or `wbconsole serve`): serves `/console/ws` and
//! `/health`, spawning one PTY-backed process per WebSocket connection.
//!
//! **TUI** (`wbconsole tui`): the launcher run inside default-mode consoles.

use anyhow::Context;
use clap::{Args, Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wbconsole::{api, config::ConsoleConfig, tui};

/// wbconsole - browser workbench console
///
/// Bridges browser terminals to shells and the workbench TUI over WebSocket.
#[derive(ClapParser, Debug)]
#[command(name = "wbconsole", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the console server (default)
    Serve(ServeArgs),
    /// Run the terminal UI launcher in the current terminal
    Tui,
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Path to a TOML config file
    #[arg(long, env = "WBCONSOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server
    #[arg(long, env = "WBCONSOLE_BIND")]
    bind: Option<SocketAddr>,

    /// Maximum concurrent console sessions
    #[arg(long, env = "WBCONSOLE_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Idle timeout in seconds (0 disables)
    #[arg(long, env = "WBCONSOLE_IDLE_TIMEOUT")]
    idle_timeout: Option<f64>,

    /// Reaper interval in seconds
    #[arg(long, env = "WBCONSOLE_REAP_INTERVAL")]
    reap_interval: Option<f64>,

    /// Shell spawned for `?mode=shell`
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Program spawned for default-mode consoles (defaults to this binary)
    #[arg(long)]
    tui_program: Option<PathBuf>,
}

impl ServeArgs {
    /// Layer command-line overrides on top of the file config.
    fn apply(&self, config: &mut ConsoleConfig) -> anyhow::Result<()> {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout =
                Duration::try_from_secs_f64(secs).context("invalid --idle-timeout")?;
        }
        if let Some(secs) = self.reap_interval {
            config.reap_interval =
                Duration::try_from_secs_f64(secs).context("invalid --reap-interval")?;
        }
        if let Some(shell) = &self.shell {
            config.shell = shell.clone();
        }
        if let Some(program) = &self.tui_program {
            config.tui_program = Some(program.clone());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // The launcher owns the terminal; no log output.
        Some(Commands::Tui) => Ok(tui::run()?),
        Some(Commands::Serve(args)) => {
            init_tracing();
            run_serve(args).await
        }
        None => {
            init_tracing();
            run_serve(cli.serve).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wbconsole=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = ConsoleConfig::load_or_default(args.config.as_deref())?;
    args.apply(&mut config)?;
    config.validate()?;
    config.resolve_tui_program()?;

    let bind = config.bind;
    let reap_interval = config.reap_interval;
    let state = api::AppState::new(config);
    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();

    let reaper = registry.spawn_reaper(reap_interval, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        max_sessions = registry.max_sessions(),
        idle_timeout_secs = registry.idle_timeout().as_secs_f64(),
        "console server listening"
    );

    let app = api::router(state);
    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            tracing::info!("received Ctrl+C");
        }
        result = &mut server => {
            // Only reachable if the server died on its own.
            shutdown.cancel();
            registry.drain();
            result??;
            return Ok(());
        }
    }

    // Bridges send their close frames, then every process goes.
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let drained = registry.drain();
    tracing::info!(sessions = drained, "console sessions closed");

    if let Err(e) = server.await? {
        tracing::warn!(error = %e, "HTTP server exited with error");
    }
    if let Err(e) = reaper.await {
        tracing::warn!(?e, "reaper task panicked");
    }

    tracing::info!("wbconsole exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["wbconsole"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.serve.bind.is_none());
    }

    #[test]
    fn cli_parses_tui_subcommand() {
        let cli = Cli::try_parse_from(["wbconsole", wbconsole::config::TUI_SUBCOMMAND]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Tui)));
    }

    #[test]
    fn serve_flags_override_config() {
        let cli = Cli::try_parse_from([
            "wbconsole",
            "serve",
            "--bind",
            "127.0.0.1:9999",
            "--max-sessions",
            "2",
            "--idle-timeout",
            "1.5",
            "--shell",
            "/bin/sh",
        ])
        .unwrap();
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve subcommand");
        };

        let mut config = ConsoleConfig::default();
        args.apply(&mut config).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.shell, PathBuf::from("/bin/sh"));
        assert_eq!(config.reap_interval, Duration::from_secs(30));
    }

    #[test]
    fn negative_idle_timeout_is_rejected() {
        let args = ServeArgs {
            idle_timeout: Some(-1.0),
            ..ServeArgs::default()
        };
        assert!(args.apply(&mut ConsoleConfig::default()).is_err());
    }
}
