#![forbid(unsafe_code)]

//! `claps` — multi-channel orchestrator binary.
//!
//! Bootstraps configuration, registers the channel adapters, starts the
//! authorization gateway and the GitHub poller, and runs the task engine
//! until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use claps::channels::http::HttpPollAdapter;
use claps::channels::line::LineAdapter;
use claps::channels::slack::SlackAdapter;
use claps::channels::{ChannelCallbacks, ChannelHealth};
use claps::config::GlobalConfig;
use claps::config_watcher::AdminConfigWatcher;
use claps::engine::TaskEngine;
use claps::gateway::{self, GatewayState};
use claps::git::github::GithubClient;
use claps::git::poller;
use claps::history::HistoryStore;
use claps::identity::IdentityResolver;
use claps::queue::TaskQueue;
use claps::registry::ChannelRegistry;
use claps::router::NotificationRouter;
use claps::runner::AgentRunner;
use claps::session::SessionStore;
use claps::worktree::WorktreeManager;
use claps::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "claps", about = "Multi-channel orchestrator for a coding-agent CLI", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the authorization gateway port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("claps orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

#[allow(clippy::too_many_lines)] // Startup sequence is inherently sequential.
async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.gateway_port = port;
    }
    config.load_credentials();
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.home_dir)
        .await
        .map_err(|err| AppError::Config(format!("cannot create state dir: {err}")))?;
    info!(home = %config.home_dir.display(), "configuration loaded");

    // ── Identity (hot-reloadable admin config) ──────────
    let admin_watcher = AdminConfigWatcher::new(&config.admin_config_path())?;
    let identity = IdentityResolver::new(admin_watcher.shared());

    // ── Core services ───────────────────────────────────
    let queue = Arc::new(TaskQueue::new());
    let sessions = Arc::new(
        SessionStore::load(config.sessions_path(), config.session_max_age_hours).await,
    );
    let worktrees = Arc::new(WorktreeManager::new(Arc::clone(&config)));
    let runner = Arc::new(AgentRunner::new(Arc::clone(&config)));
    let github = GithubClient::new(config.github.token.clone());
    let history = HistoryStore::new(config.history_path());
    info!("core services ready");

    // ── Channel adapters & registry ─────────────────────
    // The first registered adapter is the default interaction surface:
    // Slack when configured, the HTTP polling channel otherwise.
    let mut registry = ChannelRegistry::new();
    if let Some(slack_config) = config.slack.clone() {
        registry.register(Arc::new(SlackAdapter::new(slack_config, identity.clone())));
    }
    if let Some(line_config) = config.line.clone() {
        registry.register(Arc::new(LineAdapter::new(line_config, identity.clone())));
    }
    let http_enabled = config.http.as_ref().is_none_or(|http| http.enabled);
    let http_adapter = if http_enabled {
        let adapter = Arc::new(HttpPollAdapter::new(identity.clone()));
        registry.register(Arc::clone(&adapter) as Arc<dyn claps::channels::ChannelAdapter>);
        Some(adapter)
    } else {
        None
    };
    let registry = Arc::new(registry);
    if registry.default_adapter().is_none() {
        return Err(AppError::Config(
            "no channel adapters configured; enable slack, line, or http".into(),
        ));
    }
    if let Some(adapter) = &http_adapter {
        adapter.bind_registry(Arc::clone(&registry));
    }
    let router = Arc::new(NotificationRouter::new(Arc::clone(&registry)));

    // ── Authorization gateway ───────────────────────────
    let ct = CancellationToken::new();
    let gateway_state = Arc::new(GatewayState::new(
        Arc::clone(&router),
        config.auth_token_path(),
        config.gateway_port,
        ct.child_token(),
    ));
    let api_router = http_adapter
        .as_ref()
        .map(|adapter| adapter.api_router(Arc::clone(&gateway_state)));
    let gateway_handle = {
        let state = Arc::clone(&gateway_state);
        let gateway_ct = ct.clone();
        let shutdown_ct = ct.clone();
        tokio::spawn(async move {
            if let Err(err) = gateway::serve(state, api_router, gateway_ct).await {
                error!(%err, "gateway failed — initiating shutdown");
                shutdown_ct.cancel();
            }
        })
    };

    // ── Task engine ─────────────────────────────────────
    let engine = Arc::new(TaskEngine::new(
        Arc::clone(&config),
        Arc::clone(&queue),
        Arc::clone(&sessions),
        Arc::clone(&worktrees),
        Arc::clone(&runner),
        Arc::clone(&router),
        Arc::clone(&gateway_state),
        identity.clone(),
        github.clone(),
        history,
    ));
    let engine_handle = engine.spawn_loop(ct.clone());

    // ── Inbound pump: adapter callbacks → queue ─────────
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let callbacks = ChannelCallbacks {
        inbound: inbound_tx,
    };
    let inbound_queue = Arc::clone(&queue);
    let inbound_ct = ct.clone();
    let inbound_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = inbound_ct.cancelled() => break,
                message = inbound_rx.recv() => match message {
                    Some(message) => {
                        inbound_queue.add(message.prompt, message.metadata).await;
                    }
                    None => break,
                }
            }
        }
    });

    // ── Start adapters ──────────────────────────────────
    registry.init_all(&callbacks).await;
    registry.start_all().await;

    // The primary adapter is the mandatory interaction surface: abort
    // startup when it is unhealthy after start.
    if let Some(primary) = registry.default_adapter() {
        if let ChannelHealth::Down(reason) = primary.health().await {
            error!(name = primary.name(), reason, "primary adapter unhealthy; aborting");
            registry.stop_all().await;
            ct.cancel();
            return Err(AppError::Channel(format!(
                "primary adapter '{}' unhealthy: {reason}",
                primary.name()
            )));
        }
    }

    // ── GitHub issue poller ─────────────────────────────
    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let poller_handle = if config.github.repos.is_empty() {
        info!("no github repos configured; poller disabled");
        None
    } else {
        Some(poller::spawn_issue_poller(
            config.github.clone(),
            github,
            Arc::clone(&queue),
            closed_tx,
            ct.clone(),
        ))
    };
    let lifecycle_engine = Arc::clone(&engine);
    let lifecycle_ct = ct.clone();
    let lifecycle_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = lifecycle_ct.cancelled() => break,
                signal = closed_rx.recv() => match signal {
                    Some(closed) => {
                        lifecycle_engine
                            .handle_issue_closed(&closed.owner, &closed.repo, closed.issue_number)
                            .await;
                    }
                    None => break,
                }
            }
        }
    });

    info!("claps orchestrator ready");

    // ── Wait for first shutdown signal ──────────────────
    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    // Second signal forces an exit.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    // ── Graceful shutdown with timeout ──────────────────
    let shutdown = async {
        registry.stop_all().await;
        worktrees.cleanup_all().await;
        let _ = gateway_handle.await;
        let _ = engine_handle.await;
        let _ = inbound_handle.await;
        if let Some(handle) = poller_handle {
            let _ = handle.await;
        }
        let _ = lifecycle_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "graceful shutdown timed out — exiting"
        );
    }

    drop(admin_watcher);
    info!("claps shut down");
    Ok(())
}

/// Maximum time to wait for graceful shutdown before force-exiting.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
