//! CLI platform adapter for local terminal sessions.
//!
//! The adapter prints notifications addressed to the CLI platform;
//! [`run_interactive`] owns stdin, parses lines into wallet commands and
//! publishes them on the bus.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::bus::CommandBus;
use crate::error::{CommandError, CommandResult, PlatformError, PlatformResult};
use crate::events::{CommandRequest, Notification};
use crate::platform::{AdapterBase, AdapterState, AdapterStatus, Platform, PlatformAdapter};
use crate::util::normalize_handle;

/// Configuration for the CLI adapter and interactive session.
#[derive(Debug, Clone)]
pub struct CliAdapterConfig {
    /// Prompt shown before each input line.
    pub prompt: String,
    /// Handle the local session acts as.
    pub operator: String,
}

impl Default for CliAdapterConfig {
    fn default() -> Self {
        Self { prompt: "saifu> ".to_string(), operator: "operator".to_string() }
    }
}

impl CliAdapterConfig {
    /// Sets the prompt string.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Sets the operator handle.
    #[must_use]
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }
}

/// Adapter delivering notifications to the local terminal.
#[derive(Debug)]
pub struct CliAdapter {
    base: AdapterBase,
    config: CliAdapterConfig,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl CliAdapter {
    /// Creates an adapter with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CliAdapterConfig::default())
    }

    /// Creates an adapter with the given configuration.
    #[must_use]
    pub fn with_config(config: CliAdapterConfig) -> Self {
        Self {
            base: AdapterBase::new(Platform::Cli),
            config,
            shutdown_tx: RwLock::new(None),
        }
    }
}

impl Default for CliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformAdapter for CliAdapter {
    fn platform(&self) -> Platform {
        Platform::Cli
    }

    async fn start(&self, bus: &CommandBus) -> PlatformResult<()> {
        self.base.set_state(AdapterState::Starting).await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let mut notifications = bus.subscribe_platform(Platform::Cli).await;
        let prompt = self.config.prompt.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = notifications.recv() => match maybe {
                        Some(notification) => print_notification(&notification.text, &prompt),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("CLI printer stopped");
        });

        self.base.set_state(AdapterState::Running).await;
        info!("CLI adapter started");
        Ok(())
    }

    async fn stop(&self) -> PlatformResult<()> {
        self.base.set_state(AdapterState::Stopping).await;
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        self.base.set_state(AdapterState::Stopped).await;
        info!("CLI adapter stopped");
        Ok(())
    }

    async fn send(&self, notification: &Notification) -> PlatformResult<()> {
        print_notification(&notification.text, &self.config.prompt);
        self.base.record_sent().await;
        Ok(())
    }

    async fn status(&self) -> AdapterStatus {
        self.base.build_status().await
    }
}

#[allow(clippy::print_stdout)] // terminal output is this adapter's job
fn print_notification(text: &str, prompt: &str) {
    println!("\n{text}");
    print!("{prompt}");
    let _ = std::io::stdout().flush();
}

#[allow(clippy::print_stdout)] // terminal output is this adapter's job
fn print_prompt(prompt: &str) {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
}

/// Runs an interactive wallet session on stdin until `exit` or EOF.
///
/// Parsed commands are published on the bus under the configured operator
/// handle. Replies are printed by the running [`CliAdapter`].
///
/// # Errors
///
/// Returns an error if the command bus closes underneath the session.
#[allow(clippy::print_stdout)] // interactive sessions talk to the terminal
pub async fn run_interactive(bus: &CommandBus, config: CliAdapterConfig) -> PlatformResult<()> {
    println!("saifu wallet - type \"help\" for commands, \"exit\" to quit");

    // A blocking task owns stdin; lines are bridged onto the runtime.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(8);
    let reader = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    print_prompt(&config.prompt);
    while let Some(line) = line_rx.recv().await {
        let line = line.trim();
        if line.is_empty() {
            print_prompt(&config.prompt);
            continue;
        }
        if matches!(line, "exit" | "quit" | "/quit") {
            println!("Goodbye!");
            break;
        }
        if line == "help" {
            println!("{}", help_text());
            print_prompt(&config.prompt);
            continue;
        }
        match parse_command(line) {
            Ok(command) => {
                let request =
                    CommandRequest::new(Platform::Cli, &config.operator, "direct", command);
                bus.publish_command(request)
                    .await
                    .map_err(|err| PlatformError::internal(err.to_string()))?;
                // The adapter's printer shows the reply and the next prompt.
            }
            Err(err) => {
                println!("{err}");
                println!("Type \"help\" for the command list.");
                print_prompt(&config.prompt);
            }
        }
    }

    reader.abort();
    Ok(())
}

fn help_text() -> &'static str {
    "Commands (amounts are satoshis):\n  \
     balance                      Show your account balance\n  \
     deposit                      Show your deposit address\n  \
     give <user> <amount>         Send sats to another user here\n  \
     withdraw <address> <amount>  Send sats to an external address\n  \
     link <secret>                Pool balances with another identity\n  \
     exit                         Quit"
}

/// Parses one input line into a wallet command.
///
/// # Errors
///
/// Returns [`CommandError::Unknown`] for an unrecognized command word,
/// [`CommandError::Usage`] for wrong arity and
/// [`CommandError::InvalidAmount`] for unparseable amounts.
pub fn parse_command(line: &str) -> CommandResult<crate::events::Command> {
    use crate::events::Command;

    let mut parts = line.split_whitespace();
    let word = parts.next().unwrap_or_default().to_lowercase();
    let command = match word.as_str() {
        "balance" => Command::Balance,
        "deposit" | "address" => Command::DepositAddress,
        "give" => {
            let (to, amount) = two_args(&mut parts, "give <user> <amount-sats>")?;
            Command::Give { to: normalize_handle(&to), amount_sats: parse_amount(&amount)? }
        }
        "withdraw" => {
            let (address, amount) = two_args(&mut parts, "withdraw <address> <amount-sats>")?;
            Command::Withdraw { address, amount_sats: parse_amount(&amount)? }
        }
        "link" => {
            let secret = parts
                .next()
                .ok_or_else(|| CommandError::Usage("link <secret>".to_string()))?
                .to_string();
            Command::Link { secret }
        }
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    if parts.next().is_some() {
        return Err(CommandError::Usage(format!("{word} takes fewer arguments")));
    }
    Ok(command)
}

fn two_args<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    usage: &str,
) -> CommandResult<(String, String)> {
    match (parts.next(), parts.next()) {
        (Some(first), Some(second)) => Ok((first.to_string(), second.to_string())),
        _ => Err(CommandError::Usage(usage.to_string())),
    }
}

/// Parses a satoshi amount, allowing `_` separators like `1_000_000`.
fn parse_amount(raw: &str) -> CommandResult<u64> {
    let cleaned = raw.replace('_', "");
    let amount = cleaned
        .parse::<u64>()
        .map_err(|_| CommandError::InvalidAmount(raw.to_string()))?;
    if amount == 0 {
        return Err(CommandError::InvalidAmount("amount must be positive".to_string()));
    }
    Ok(amount)
}
