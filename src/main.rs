use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use nighthound::ai::{build_driver, AiPipeline, AiSettings};
use nighthound::api::{self, AppState, GatewayLimits};
use nighthound::assets::AssetRepository;
use nighthound::auth::{hash_password, AuthConfig, AuthState};
use nighthound::db::Database;
use nighthound::events::EventBus;
use nighthound::hunt::{HuntRepository, HuntScheduler, ModuleRegistry};
use nighthound::intelligence::{FindingStore, TimelineRecorder};
use nighthound::session::{SessionManager, SessionManagerConfig, SessionRepository};
use nighthound::ssh::SshSettings;
use nighthound::users::{Role, UserRepository};

const APP_NAME: &str = "nighthound";

// Exit codes: 0 clean shutdown, 2 configuration error, 3 database
// unreachable, 4 migration failure.
const EXIT_CONFIG: u8 = 2;
const EXIT_DATABASE: u8 = 3;
const EXIT_MIGRATION: u8 = 4;

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            ExitCode::from(classify_exit(&err))
        }
    }
}

fn classify_exit(err: &anyhow::Error) -> u8 {
    let chain = format!("{err:?}");
    if chain.contains("running database migrations") {
        EXIT_MIGRATION
    } else if chain.contains("connecting to database") || chain.contains("creating database") {
        EXIT_DATABASE
    } else if chain.contains("configuration") {
        EXIT_CONFIG
    } else {
        1
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    log::debug!("resolved config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Users { command } => async_users(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_users(ctx: RuntimeContext, cmd: UsersCommand) -> Result<()> {
    handle_users(&ctx, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Nighthound - security-hunting orchestrator server.",
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
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and a default config file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage analyst accounts
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// Create an analyst account
    Add(UsersAddCommand),
}

#[derive(Debug, Clone, Args)]
struct UsersAddCommand {
    /// Username for the new account
    #[arg(short, long)]
    username: String,
    /// Initial password
    #[arg(short, long)]
    password: String,
    /// Account role
    #[arg(short, long, value_enum, default_value_t = RoleArg::Analyst)]
    role: RoleArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Analyst,
    Admin,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Analyst => Role::Analyst,
            RoleArg::Admin => Role::Admin,
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    paths: PathsConfig,
    logging: LoggingConfig,
    auth: AuthConfig,
    ssh: SshConfig,
    sessions: SessionsConfig,
    hunts: HuntsConfig,
    ai: AiSettings,
    limits: LimitsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
            ssh: SshConfig::default(),
            sessions: SessionsConfig::default(),
            hunts: HuntsConfig::default(),
            ai: AiSettings::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    /// Base directory for the database and hunt modules.
    data_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SshConfig {
    dial_timeout_secs: u64,
    keepalive_secs: u64,
    reconnect_attempts: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 10,
            keepalive_secs: 30,
            reconnect_attempts: 3,
        }
    }
}

impl SshConfig {
    fn settings(&self) -> SshSettings {
        SshSettings {
            dial_timeout: std::time::Duration::from_secs(self.dial_timeout_secs),
            keepalive: std::time::Duration::from_secs(self.keepalive_secs),
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    max_sessions: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { max_sessions: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct HuntsConfig {
    /// Directory of hunt module markdown files. Defaults to
    /// `<data_dir>/hunt_modules`.
    modules_dir: Option<String>,
    max_concurrent_per_session: usize,
}

impl Default for HuntsConfig {
    fn default() -> Self {
        Self {
            modules_dir: None,
            max_concurrent_per_session: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LimitsConfig {
    terminal_rate_bytes: u64,
    terminal_burst_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            terminal_rate_bytes: 64 * 1024,
            terminal_burst_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => path.clone(),
            None => default_config_path(),
        };

        let mut builder = Config::builder();
        if config_file.exists() {
            builder = builder.add_source(
                File::from(config_file.clone()).format(FileFormat::Toml),
            );
        }
        let raw = builder
            .add_source(Environment::with_prefix("NIGHTHOUND").separator("__"))
            .build()
            .context("loading configuration")?;

        let config: AppConfig = raw
            .try_deserialize()
            .context("invalid configuration")?;

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = match self.common.verbose {
            0 => self.config.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("nighthound={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || std::env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Compatibility init for log-crate users.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&level));
        builder.try_init().ok();
    }

    fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.paths.data_dir)
    }

    fn modules_dir(&self) -> PathBuf {
        match &self.config.hunts.modules_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.data_dir().join("hunt_modules"),
        }
    }
}

fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("NIGHTHOUND_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("nighthound.toml")
}

fn write_default_config(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
    }
    let default = AppConfig::default();
    let toml = toml_string(&default)?;
    std::fs::write(path, toml)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn toml_string(config: &AppConfig) -> Result<String> {
    // config is serialized via serde_json as an intermediate because the
    // config crate has no serializer; a flat TOML rendering is enough here.
    let value = serde_json::to_value(config).context("serializing configuration")?;
    Ok(render_toml(&value, ""))
}

fn render_toml(value: &serde_json::Value, prefix: &str) -> String {
    let mut scalars = String::new();
    let mut tables = String::new();
    if let serde_json::Value::Object(map) = value {
        for (key, val) in map {
            match val {
                serde_json::Value::Object(_) => {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    tables.push_str(&format!("\n[{path}]\n"));
                    tables.push_str(&render_toml(val, &path));
                }
                serde_json::Value::String(s) => {
                    scalars.push_str(&format!("{key} = \"{s}\"\n"));
                }
                serde_json::Value::Null => {}
                other => scalars.push_str(&format!("{key} = {other}\n")),
            }
        }
    }
    format!("{scalars}{tables}")
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.config_file.display()
        ));
    }
    write_default_config(&ctx.config_file)?;
    std::fs::create_dir_all(ctx.modules_dir()).context("creating hunt modules directory")?;
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
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_users(ctx: &RuntimeContext, cmd: UsersCommand) -> Result<()> {
    let db_path = ctx.data_dir().join("nighthound.db");
    let database = Database::new(&db_path).await?;
    let users = UserRepository::new(database.pool().clone());

    match cmd {
        UsersCommand::Add(add) => {
            if add.password.len() < 8 {
                return Err(anyhow!("configuration error: password must be at least 8 characters"));
            }
            let hash = hash_password(&add.password)
                .map_err(|e| anyhow!("hashing password: {e}"))?;
            let user = users.create(&add.username, &hash, add.role.into()).await?;
            println!("Created {} account: {}", user.role, user.username);
        }
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("starting nighthound server...");

    ctx.config
        .auth
        .validate()
        .map_err(|e| anyhow!("configuration error: {e}"))?;

    let db_path = ctx.data_dir().join("nighthound.db");
    info!("database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let modules_dir = ctx.modules_dir();
    std::fs::create_dir_all(&modules_dir).context("creating hunt modules directory")?;
    info!("hunt modules directory: {}", modules_dir.display());

    let bus = Arc::new(EventBus::new());
    let auth_state = AuthState::new(&ctx.config.auth);

    let users = UserRepository::new(database.pool().clone());
    if users.count().await? == 0 {
        warn!("no analyst accounts exist; create one with `{APP_NAME} users add`");
    }

    let assets = AssetRepository::new(database.pool().clone());
    let sessions = SessionRepository::new(database.pool().clone());
    let hunts = HuntRepository::new(database.pool().clone());
    let findings = FindingStore::new(database.pool().clone());
    let timeline = TimelineRecorder::new(database.pool().clone(), bus.clone());

    let modules = Arc::new(ModuleRegistry::new(&modules_dir));

    let driver = build_driver(&ctx.config.ai)
        .map_err(|e| anyhow!("configuration error: {e}"))?;
    let pipeline = driver.map(|driver| {
        info!("ai driver: {}", driver.name());
        Arc::new(AiPipeline::new(
            driver,
            bus.clone(),
            hunts.clone(),
            findings.clone(),
            timeline.clone(),
            ctx.config.ai.clone(),
        ))
    });
    if pipeline.is_none() {
        info!("ai analysis disabled (no provider configured)");
    }

    let scheduler = Arc::new(HuntScheduler::new(
        bus.clone(),
        hunts.clone(),
        timeline.clone(),
        modules.clone(),
        pipeline,
        ctx.config.hunts.max_concurrent_per_session,
    ));

    let manager = Arc::new(SessionManager::new(
        bus.clone(),
        sessions.clone(),
        assets.clone(),
        timeline.clone(),
        SessionManagerConfig {
            max_sessions: ctx.config.sessions.max_sessions,
            ssh: ctx.config.ssh.settings(),
        },
    ));

    let state = AppState {
        bus,
        auth: auth_state,
        users,
        assets,
        sessions,
        manager: manager.clone(),
        modules,
        scheduler: scheduler.clone(),
        hunts,
        findings,
        timeline,
        limits: GatewayLimits {
            terminal_rate: ctx.config.limits.terminal_rate_bytes,
            terminal_burst: ctx.config.limits.terminal_burst_bytes,
        },
    };
    let router = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| anyhow!("configuration error: invalid listen address: {e}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Stop accepting work, cancel in-flight hunts, close every session.
    info!("shutting down");
    scheduler.cancel_all();
    manager.shutdown_all().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to install shutdown handler: {err}");
    }
    info!("shutdown signal received");
}
