use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, debug, info};

use chatwatch::config::{self, AppConfig};
use chatwatch::session::{self, ExitReason};
use chatwatch::store::Store;
use chatwatch_protocol::{Call, Message};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext) -> Result<()> {
    match session::serve(&ctx.config).await? {
        ExitReason::Signal => info!("Shutdown complete"),
        ExitReason::LoggedOut => info!("Session logged out, exiting"),
    }
    Ok(())
}

#[tokio::main]
async fn async_history(ctx: RuntimeContext, cmd: HistoryCommand) -> Result<()> {
    handle_history(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => async_serve(ctx),
        Command::History(cmd) => async_history(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Watch a messaging account and fan events out to local display clients.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
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
    /// Run the watcher (default)
    Serve,
    /// Print the most recent stored events
    History(HistoryCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct HistoryCommand {
    /// Show calls instead of messages
    #[arg(long)]
    calls: bool,
    /// Number of rows to show
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => path.clone(),
            None => config::default_config_path()?,
        };
        let config = config::load(common.config.as_deref())
            .with_context(|| format!("loading configuration {}", config_file.display()))?;

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
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
            .unwrap_or_else(|_| EnvFilter::new(format!("chatwatch={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
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
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // Library code logs through `log`.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

async fn handle_history(ctx: &RuntimeContext, cmd: HistoryCommand) -> Result<()> {
    let limits = ctx.config.store.limits().context("invalid store limits")?;
    let store = Store::open(&ctx.config.store.path, limits)
        .await
        .with_context(|| format!("opening history database {}", ctx.config.store.path.display()))?;

    let mut out = io::stdout().lock();
    if cmd.calls {
        for call in store.calls().recent(cmd.limit).await? {
            if ctx.common.json {
                writeln!(out, "{}", serde_json::to_string(&call)?)?;
            } else {
                writeln!(out, "{}", call_line(&call))?;
            }
        }
    } else {
        for message in store.messages().recent(cmd.limit).await? {
            if ctx.common.json {
                writeln!(out, "{}", serde_json::to_string(&message)?)?;
            } else {
                writeln!(out, "{}", message_line(&message))?;
            }
        }
    }
    store.close().await;
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
            };
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", ctx.config_file.display()),
    }
    Ok(())
}

fn clock(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn message_line(message: &Message) -> String {
    let name = match &message.group_name {
        Some(group) if message.is_group => format!("{} @ {}", message.sender_name, group),
        _ => message.sender_name.clone(),
    };
    format!("{} {}: {}", clock(message.timestamp), name, message.text)
}

fn call_line(call: &Call) -> String {
    match &call.group_name {
        Some(group) if call.is_group => {
            format!("{} {}: [Group call] {}", clock(call.timestamp), call.caller_name, group)
        }
        _ => format!("{} {}: [Call]", clock(call.timestamp), call.caller_name),
    }
}
