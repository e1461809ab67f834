// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pgpull::app_config::{self, Config};
use pgpull::{CommandRunner, DryRunRunner, Migration, ProcessRunner};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the remote database and swap it into the local one (default command)
    Migrate(MigrateArgs),

    /// Validate the config and check the local database is reachable
    Check(CheckArgs),

    /// Write a template configuration file
    Init(InitArgs),

    /// Generate shell completions for pgpull
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config_path: PathBuf,

    /// Set logging level
    #[arg(short, long, value_enum)]
    log_level: Option<CliLogLevel>,

    /// Print the commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config_path: PathBuf,

    /// Set logging level
    #[arg(short, long, value_enum)]
    log_level: Option<CliLogLevel>,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config_path: PathBuf,

    /// Overwrite an existing file
    #[arg(short, long)]
    force: bool,
}

/// pgpull - pull a remote PostgreSQL database into a local server
///
/// Dumps a database on a remote host over SSH, copies the dump locally,
/// restores it into a fresh database and renames it over the local one.
#[derive(Parser, Debug)]
#[command(name = "pgpull")]
#[command(version)]
#[command(about = "Copy a remote PostgreSQL database over SSH into a local server")]
#[command(args_conflicts_with_subcommands = true)]
#[command(long_about = "pgpull dumps a PostgreSQL database on a remote host over SSH, copies the dump
locally and restores it into the local server, replacing the local database.

EXAMPLES:
    pgpull                                  # Migrate using ./config.json
    pgpull -c prod.json                     # Use another config file
    pgpull -c config.yml                    # YAML configs are read by extension
    pgpull --dry-run                        # Print the commands without running them
    pgpull check                            # Only check the local database is reachable
    pgpull init -c prod.json                # Write a template config
    pgpull completions bash > pgpull.bash   # Generate bash completions

WARNING:
    The local database named in local_db.database is dropped and replaced.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    migrate: MigrateArgs,
}

// @struct: Custom logger implementation, filtered by log::max_level()
struct CustomLogger;

impl CustomLogger {
    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger))?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Emoji for log level
    fn get_emoji_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "❌ ",
            Level::Warn => "🚧 ",
            Level::Info => " ",
            Level::Debug => "🔍 ",
            Level::Trace => "📋 ",
        }
    }

    // @returns: ANSI color code for log level
    fn get_color_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "1;31",
            Level::Warn => "1;33",
            Level::Info => "1;32",
            Level::Debug => "1;36",
            Level::Trace => "1;35",
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let mut stderr = std::io::stderr();
            let _ = writeln!(
                stderr,
                "\x1B[{}m{} {} {}\x1B[0m",
                Self::get_color_for_level(record.level()),
                now,
                Self::get_emoji_for_level(record.level()),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_filter(level: &app_config::LogLevel) -> LevelFilter {
    match level {
        app_config::LogLevel::Error => LevelFilter::Error,
        app_config::LogLevel::Warn => LevelFilter::Warn,
        app_config::LogLevel::Info => LevelFilter::Info,
        app_config::LogLevel::Debug => LevelFilter::Debug,
        app_config::LogLevel::Trace => LevelFilter::Trace,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Info until the config says otherwise
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    match cli.command {
        Some(Commands::Completions { shell }) => {
            let mut cmd = CommandLineOptions::command();
            generate(shell, &mut cmd, "pgpull", &mut std::io::stdout());
            Ok(())
        }
        Some(Commands::Init(args)) => run_init(args),
        Some(Commands::Check(args)) => run_check(args).await,
        Some(Commands::Migrate(args)) => run_migrate(args).await,
        None => run_migrate(cli.migrate).await,
    }
}

/// Load, override and validate the configuration, then apply its log level
fn load_config(config_path: &Path, log_level: Option<CliLogLevel>) -> Result<Config> {
    info!("-> Config file: {}", config_path.display());

    let mut config = Config::load(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path.display()))?;

    if let Some(level) = log_level {
        config.log_level = level.into();
    }
    log::set_max_level(level_filter(&config.log_level));

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn run_init(args: InitArgs) -> Result<()> {
    if args.config_path.exists() && !args.force {
        return Err(anyhow!(
            "Config file already exists: {} (use --force to overwrite)",
            args.config_path.display()
        ));
    }

    Config::example()
        .save(&args.config_path)
        .with_context(|| format!("Failed to write config file: {}", args.config_path.display()))?;

    info!("Wrote template config to {}", args.config_path.display());
    Ok(())
}

async fn run_check(args: CheckArgs) -> Result<()> {
    let config = load_config(&args.config_path, args.log_level)?;
    let runner = ProcessRunner::with_timeout(config.command_timeout_secs.map(Duration::from_secs));

    Migration::new(&config, &runner)
        .check()
        .await
        .with_context(|| format!("Local database {} is not reachable", config.local_db.database))?;

    info!(
        "Local database {} on {}:{} is reachable",
        config.local_db.database, config.local_db.host, config.local_db.port
    );
    Ok(())
}

async fn run_migrate(args: MigrateArgs) -> Result<()> {
    let config = load_config(&args.config_path, args.log_level)?;

    let process_runner = ProcessRunner::with_timeout(config.command_timeout_secs.map(Duration::from_secs));
    let dry_run_runner = DryRunRunner;
    let runner: &dyn CommandRunner = if args.dry_run {
        warn!("Dry run: no command will be executed");
        &dry_run_runner
    } else {
        &process_runner
    };

    let report = Migration::new(&config, runner)
        .with_progress(!args.dry_run)
        .run()
        .await
        .context("Migration failed")?;

    info!(
        "Migration {} completed in {} ({} steps, {} temporary resources removed)",
        report.run_id,
        format_duration(report.elapsed),
        report.steps,
        report.cleaned_up.len()
    );
    Ok(())
}

/// Format a duration as `1h 2m 3s` / `2m 3s` / `3.4s`
fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
