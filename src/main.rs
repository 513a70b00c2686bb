use clap::{Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, error};

use hostgc::config::{ConfigOverrides, RunConfiguration};

/// Garbage-collect build-tool leftovers on this host
#[derive(Parser)]
#[command(name = "hostgc")]
#[command(about = "Clean up old containers, images, tmp dirs and local caches", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// When to color log output
    #[arg(long, value_enum, default_value_t = LogColor::Auto, global = true)]
    log_color: LogColor,

    /// Log line layout
    #[arg(long, value_enum, default_value_t = LogFormat::Full, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogColor {
    Auto,
    Always,
    Never,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Full,
    Compact,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean up stale local state (default command)
    Cleanup(CleanupArgs),
}

#[derive(clap::Args, Default)]
struct CleanupArgs {
    /// Override the tmp root (env: HOSTGC_TMP_DIR)
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Override the home root (env: HOSTGC_HOME_DIR)
    #[arg(long)]
    home_dir: Option<PathBuf>,

    /// Path to the container engine auth config (env: DOCKER_CONFIG)
    #[arg(long)]
    docker_config: Option<PathBuf>,

    /// Allow non-TLS/unverified registry access
    #[arg(long)]
    insecure_registry: bool,

    /// Report what would be removed without mutating anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let ansi = match cli.log_color {
        LogColor::Auto => std::io::stdout().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_ansi(ansi)
        .with_target(cli.verbose >= 2);
    match cli.log_format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
    }

    debug!("hostgc {} starting", env!("CARGO_PKG_VERSION"));

    let args = match cli.command {
        Some(Commands::Cleanup(args)) => args,
        None => CleanupArgs::default(),
    };

    if let Err(e) = run_cleanup(args).await {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_cleanup(args: CleanupArgs) -> anyhow::Result<()> {
    let config = RunConfiguration::resolve(ConfigOverrides {
        tmp_dir: args.tmp_dir,
        home_dir: args.home_dir,
        docker_config: args.docker_config,
        insecure_registry: args.insecure_registry,
        dry_run: args.dry_run,
    })?;

    let summary = hostgc::run::run(&config).await?;
    println!("{summary}");
    Ok(())
}
