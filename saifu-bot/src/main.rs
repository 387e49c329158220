//! Saifu CLI - Custodial Wallet Bot
//!
//! A command-line interface for running the saifu wallet bot service.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use clap::{Args, Parser, Subcommand};
use saifu_bot::error::{BotError, Result};
use saifu_bot::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Saifu - custodial wallet bot with multi-platform support
#[derive(Parser)]
#[command(name = "saifu")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "SAIFU_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and setup
    Init(InitArgs),

    /// Start the bot gateway (all platforms + wallet engine)
    Gateway(GatewayArgs),

    /// Show bot status and configuration
    Status,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the init command
#[derive(Args)]
struct InitArgs {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    force: bool,
}

/// Arguments for the gateway command
#[derive(Args)]
struct GatewayArgs {
    /// Disable the interactive CLI platform
    #[arg(long)]
    no_cli: bool,

    /// Run against an in-memory node instead of a live one
    #[arg(long)]
    simulate: bool,

    /// Node URL (overrides config)
    #[arg(short, long, env = "SAIFU_NODE_URL")]
    node_url: Option<String>,
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
    /// Edit configuration in default editor
    Edit,
    /// Validate configuration
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbose);

    // Run the async main
    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "saifu_bot={level},saifu={level},{}",
            if verbosity >= 2 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init(args) => cmd_init(args).await,
        Commands::Gateway(args) => cmd_gateway(args, cli.config).await,
        Commands::Status => cmd_status(cli.config).await,
        Commands::Config(args) => cmd_config(args, cli.config).await,
    }
}

/// Initialize configuration.
async fn cmd_init(args: InitArgs) -> Result<()> {
    use saifu_bot::config::{config_path, init_config};

    let config_file = config_path();

    if config_file.exists() && !args.force {
        println!("Configuration already exists at: {}", config_file.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    init_config().await?;

    println!("Configuration created: {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. saifu config edit");
    println!("  2. saifu gateway --simulate   (trial run on an in-memory node)");
    println!("  3. saifu gateway");

    Ok(())
}

/// Start the gateway.
async fn cmd_gateway(args: GatewayArgs, config_path: Option<PathBuf>) -> Result<()> {
    use saifu_bot::config::{load_config, load_config_from};

    tracing::info!("Starting saifu gateway...");

    // Load config
    let mut config = if let Some(path) = config_path {
        load_config_from(&path).await?
    } else {
        load_config().await.unwrap_or_default()
    };

    // Override the node endpoint if specified
    if let Some(url) = args.node_url {
        config.node.url = url;
    }

    // Build gateway
    let gateway = GatewayBuilder::new()
        .bot_config(config)
        .interactive(!args.no_cli)
        .simulate(args.simulate)
        .build()
        .await?;

    println!("Gateway running. Press Ctrl+C to stop.\n");

    // Run with graceful shutdown
    tokio::select! {
        result = gateway.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            Ok(())
        }
    }
}

/// Show status.
async fn cmd_status(config_path: Option<PathBuf>) -> Result<()> {
    use saifu_bot::config::{config_path as default_config_path, load_config_from};

    let config_file = config_path.unwrap_or_else(default_config_path);

    println!("Saifu Status\n");

    // Configuration
    println!("Configuration:");
    println!("  Path:   {}", config_file.display());
    println!(
        "  Exists: {}",
        if config_file.exists() { "yes" } else { "no" }
    );

    if config_file.exists() {
        match load_config_from(&config_file).await {
            Ok(config) => {
                println!("  Valid:  yes");
                println!();
                println!("Node:");
                println!("  URL:     {}", config.node.url);
                println!("  Network: {}", config.wallet.network);
                println!();
                println!("Platforms:");
                print_platform_status("CLI", config.platforms.cli.enabled);
                print_platform_status("Telegram", config.platforms.telegram.enabled);
                print_platform_status("Discord", config.platforms.discord.enabled);
                print_platform_status("Twitter", config.platforms.twitter.enabled);
                println!();
                println!("Wallet:");
                println!(
                    "  Fee rate:   {} sats/byte",
                    config.wallet.fee_rate_sats_per_byte
                );
                println!("  Dust limit: {} sats", config.wallet.dust_limit_sats);
                println!("  Minimum:    {} sats", config.wallet.min_output_sats);
                println!("  Data dir:   {}", config.data_dir().display());
            }
            Err(e) => {
                println!("  Valid:  no ({e})");
            }
        }
    }

    println!();
    println!("Environment:");
    print_env_status("SAIFU_CONFIG");
    print_env_status("SAIFU_NODE_URL");

    Ok(())
}

/// Configuration management.
async fn cmd_config(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    use saifu_bot::config::{config_path as default_config_path, load_config_from, IssueLevel};

    let config_file = config_path.unwrap_or_else(default_config_path);

    match args.command {
        ConfigCommands::Path => {
            println!("{}", config_file.display());
        }
        ConfigCommands::Show => {
            if config_file.exists() {
                let content = tokio::fs::read_to_string(&config_file)
                    .await
                    .map_err(BotError::Io)?;
                println!("{content}");
            } else {
                println!("Configuration file does not exist.");
                println!("Run 'saifu init' to create one.");
            }
        }
        ConfigCommands::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            std::process::Command::new(&editor)
                .arg(&config_file)
                .status()
                .map_err(BotError::Io)?;
        }
        ConfigCommands::Validate => {
            if !config_file.exists() {
                println!("error: configuration file does not exist");
                return Ok(());
            }

            match load_config_from(&config_file).await {
                Ok(config) => {
                    let issues = config.validate();
                    if issues.is_empty() {
                        println!("Configuration is valid");
                    } else {
                        for issue in &issues {
                            let level = match issue.level {
                                IssueLevel::Error => "error",
                                IssueLevel::Warning => "warning",
                            };
                            println!("{level}: {}: {}", issue.field, issue.message);
                        }
                        println!();
                        if config.is_valid() {
                            println!("Configuration is valid (warnings only)");
                        } else {
                            println!("Configuration is invalid");
                        }
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        }
    }

    Ok(())
}

/// Print one platform toggle.
fn print_platform_status(name: &str, enabled: bool) {
    println!("  {name}: {}", if enabled { "enabled" } else { "disabled" });
}

/// Print environment variable status.
fn print_env_status(name: &str) {
    let status = if std::env::var(name).is_ok() {
        "set"
    } else {
        "-"
    };
    println!("  {name}: {status}");
}
