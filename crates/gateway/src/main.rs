//! KubeJump Gateway
//!
//! Opens proxied shell sessions from the local terminal and manages the
//! gateway configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway::config::{default_config_path, Config};
use gateway::proxy::{AssetInfo, ConnectInfo, ConnectionOptions, ProxyContext, ProxyServer, UserInfo};
use gateway::session::{ContainerInfo, SessionExit, SessionRegistry};
use gateway::{PtyConnectionFactory, RawModeGuard, RoomRegistry, StdioConnection};
use protocol::TerminalTask;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// KubeJump Gateway - session proxy and broadcast engine.
#[derive(Parser, Debug)]
#[command(name = "kubejump-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open a proxied shell session on this terminal
    Shell(ShellArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Target of a shell session.
#[derive(clap::Args, Debug, Clone)]
pub struct ShellArgs {
    /// Login name recorded for the session (defaults to $USER)
    #[arg(long)]
    pub user: Option<String>,

    /// Cluster name
    #[arg(long, default_value = "local")]
    pub cluster: String,

    /// Namespace of the pod
    #[arg(long, short, default_value = "default")]
    pub namespace: String,

    /// Pod to open the shell in
    #[arg(long, short)]
    pub pod: String,

    /// Container inside the pod (defaults to the pod's first container)
    #[arg(long)]
    pub container: Option<String>,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Check the configuration file for errors
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Shell(args) => {
            let config = load_config(&config_path)?;
            let level = log_level(&config, cli.verbose);
            // Raw terminal output would be garbled by log lines on stderr.
            let log_guard = init_file_tracing(&level, &config.gateway.data_dir.join("logs"))?;

            let code = match run_shell(config, args).await {
                Ok(exit) => {
                    eprintln!("\r\nSession closed: {}", describe_exit(&exit));
                    0
                }
                Err(e) => {
                    tracing::error!(error = %e, "Shell session failed");
                    eprintln!("\r\nError: {:#}", e);
                    1
                }
            };

            drop(log_guard);
            std::process::exit(code);
        }
        Commands::Config(cmd) => {
            // The file being managed may be broken, so its logging settings
            // are only a preference here.
            let _log_guard = match Config::load(&config_path) {
                Ok(config) if config.gateway.log_to_file => Some(init_file_tracing(
                    &log_level(&config, cli.verbose),
                    &config.gateway.data_dir.join("logs"),
                )?),
                _ => {
                    let filter = if cli.verbose { "debug" } else { "warn" };
                    tracing_subscriber::fmt()
                        .with_env_filter(EnvFilter::new(filter))
                        .with_writer(std::io::stderr)
                        .init();
                    None
                }
            };
            run_config_command(cmd, &config_path)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn log_level(config: &Config, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.gateway.log_level.clone()
    }
}

/// Logs to a daily rolling file under `dir`.
fn init_file_tracing(level: &str, dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, "gateway.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

/// Builds the authorisation of a locally started session.
fn local_connect_info(args: &ShellArgs) -> ConnectInfo {
    let username = args
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "local".to_string());

    ConnectInfo {
        id: Uuid::new_v4().to_string(),
        user: UserInfo {
            id: 0,
            name: username.clone(),
            username,
        },
        asset: AssetInfo {
            id: 0,
            cluster_name: args.cluster.clone(),
            namespace: args.namespace.clone(),
            pod_name: args.pod.clone(),
            pod_ip: String::new(),
        },
        expire_at: None,
    }
}

async fn run_shell(config: Config, args: ShellArgs) -> anyhow::Result<SessionExit> {
    let auth = local_connect_info(&args);
    let mut options = ConnectionOptions::new(auth);
    if let Some(container) = &args.container {
        options = options.with_container(ContainerInfo {
            cluster: args.cluster.clone(),
            namespace: args.namespace.clone(),
            pod: args.pod.clone(),
            container: container.clone(),
        });
    }

    let rooms = Arc::new(RoomRegistry::new());
    let sessions = Arc::new(SessionRegistry::new());
    let factory = Arc::new(PtyConnectionFactory::new(config.backend.shell.clone()));
    let ctx = ProxyContext::from_config(&config, factory, sessions.clone(), rooms);

    tracing::info!(
        gateway = %config.gateway.name,
        target = %options.container(),
        "Starting local shell session"
    );

    let user_conn = Arc::new(StdioConnection::new());
    let proxy = ProxyServer::new(user_conn, options, ctx);
    let session_id = proxy.id().to_string();

    let shutdown = tokio::spawn(terminate_on_signal(sessions, session_id));

    let result = {
        let _raw = RawModeGuard::enable()?;
        proxy.proxy().await
    };

    shutdown.abort();
    Ok(result?)
}

/// Terminates the session when the process is asked to stop.
async fn terminate_on_signal(sessions: Arc<SessionRegistry>, session_id: String) {
    wait_for_shutdown_signal().await;
    tracing::info!(session_id = %session_id, "Received shutdown signal");
    if let Err(e) = sessions
        .dispatch(&session_id, TerminalTask::kill("system"))
        .await
    {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to terminate session");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGHUP handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sighup.recv() => tracing::info!("Received SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn describe_exit(exit: &SessionExit) -> String {
    match exit {
        SessionExit::MaxSessionTime => "maximum session time reached".to_string(),
        SessionExit::IdleTimeout => "idle timeout".to_string(),
        SessionExit::PermissionExpired => "permission expired".to_string(),
        SessionExit::Terminated { operator } => format!("terminated by {}", operator),
        SessionExit::BackendClosed => "shell exited".to_string(),
        SessionExit::FrontendClosed => "terminal closed".to_string(),
        SessionExit::WindowClosed => "terminal stopped reporting its size".to_string(),
    }
}

fn run_config_command(cmd: ConfigCommands, path: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let mut config = Config::load(path)?;
            config.apply_env_overrides();
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigCommands::Validate => {
            load_config(path)?;
            println!("Configuration OK: {}", path.display());
        }
    }
    Ok(())
}
