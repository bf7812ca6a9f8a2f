use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use tokio::net::TcpListener;

use nbgate::api::{AppState, create_router};
use nbgate::bridge::{BridgeManager, BridgeOptions};
use nbgate::cloud::{CloudOptions, CloudSessionService};
use nbgate::config::{
    APP_NAME, AppConfig, default_config_dir, default_data_dir, default_state_dir,
    expand_str_path,
};
use nbgate::process::{CommandLauncher, ProcessLauncher};
use nbgate::resolver::{RuntimeResolver, SiblingLayout};
use nbgate::runtime::{HealthProbe, RegistryOptions, RuntimeRegistry};
use nbgate::sync::{SyncOptions, SyncServerManager};
use nbgate::tunnel::{TunnelClient, TunnelOptions};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        return handle_completions(shell);
    }

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Resolve { language } => handle_resolve(&ctx, &language),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { .. } => Ok(()),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "nbgate - runtime orchestration and relay tunneling for notebooks.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Print where the backend for a language would be found
    Resolve {
        /// Language name, e.g. python, r, julia
        language: String,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (defaults to server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (defaults to server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        if !paths.config_file.exists() {
            AppConfig::write_default(&paths.config_file)?;
        }
        let config = AppConfig::load(&paths.config_file)?;
        let paths = paths.apply_overrides(&config)?;
        for dir in [&paths.data_dir, &paths.state_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("nbgate={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // For crates that log through the `log` facade
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn resolver(&self) -> Result<RuntimeResolver> {
        let runtimes = &self.config.runtimes;
        let mut languages = runtimes.languages.clone();
        for (name, spec) in nbgate::resolver::default_languages() {
            languages.entry(name).or_insert(spec);
        }

        let mut resolver = RuntimeResolver::new(languages);
        if !runtimes.sibling_roots.is_empty() {
            let roots = runtimes
                .sibling_roots
                .iter()
                .map(|root| expand_str_path(root))
                .collect::<Result<Vec<_>>>()?;
            resolver = resolver.with_candidates(SiblingLayout::new(roots));
        }
        let bundled = match &runtimes.bundled_dir {
            Some(dir) => expand_str_path(dir)?,
            None => self.paths.data_dir.join("runtimes"),
        };
        Ok(resolver.with_bundled_dir(bundled))
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_str_path(&path.to_string_lossy())?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(CommandLauncher);

    let registry = RuntimeRegistry::new(
        ctx.resolver()?,
        launcher.clone(),
        HealthProbe::new(
            config.cloud.capabilities_path.clone(),
            Duration::from_millis(config.cloud.probe_timeout_ms),
        ),
        RegistryOptions {
            host: config.runtimes.host.clone(),
            default_language: config.runtimes.default_language.clone(),
            stop_grace: Duration::from_millis(config.runtimes.stop_grace_ms),
            state_dir: Some(ctx.paths.state_dir.clone()),
        },
    );
    let reaped = registry.reap_orphans();
    if reaped > 0 {
        info!("Terminated {} orphaned runtime(s) from a previous run", reaped);
    }

    let sync = SyncServerManager::new(
        SyncOptions::from_config(&config.sync, ctx.paths.state_dir.clone()),
        launcher,
    );

    let tunnel = TunnelClient::new(TunnelOptions::from_config(&config.tunnel));
    let tunnel_task = if config.tunnel.enabled {
        if config.tunnel.url.is_empty() || config.tunnel.user.is_empty() {
            warn!("Tunnel enabled but tunnel.url or tunnel.user is empty; not connecting");
            None
        } else {
            info!("Connecting to relay tunnel at {}", config.tunnel.url);
            Some(tunnel.spawn())
        }
    } else {
        None
    };

    let cloud = CloudSessionService::new(
        registry.clone(),
        Some(tunnel.clone()),
        CloudOptions::from_config(&config.cloud),
    );
    let bridges = BridgeManager::new(BridgeOptions::from_config(&config.bridge));

    let state = AppState::new(cloud, sync.clone(), bridges.clone(), config.tunnel.enabled);
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping runtimes and sync servers");

        let bridged = bridges.stop_all().await;
        if bridged > 0 {
            info!("Stopped {} document bridge(s)", bridged);
        }
        registry.stop_all().await;
        let stopped = sync.shutdown().await;
        if stopped > 0 {
            info!("Released {} sync server(s)", stopped);
        }
        tunnel.shutdown();
        if let Some(task) = tunnel_task {
            task.abort();
        }
        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn handle_resolve(ctx: &RuntimeContext, language: &str) -> Result<()> {
    let resolver = ctx.resolver()?;
    let location = resolver
        .resolve(language)
        .ok_or_else(|| anyhow!("no runtime available for language '{language}'"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&location).context("serializing resolved location")?
    );
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
