//! Gateway service wiring the wallet engine, store, handler and platforms
//! into one runnable unit.
//!
//! The gateway owns the two long-lived pumps: the node feed drains into
//! the wallet (the single consumer, so event order is preserved), and
//! wallet events drain into the handler. The handler never takes the
//! wallet lock while processing a wallet event, which is what keeps those
//! two pumps deadlock-free.

use std::sync::Arc;
use std::time::Duration;

use bip39::Mnemonic;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use saifu::error::WalletError;
use saifu::manager::{InitUser, WalletEvent, WalletManager};
use saifu::node::{FeedEvent, HttpNodeClient, MemoryNode, feed_channel};

use crate::bus::CommandBus;
use crate::config::{BotConfig, IssueLevel};
use crate::error::{BotError, ConfigError, Result};
use crate::handler::{CommandHandler, HandlerConfig, WalletRef};
use crate::platform::AdapterManager;
use crate::platforms::cli::{CliAdapter, CliAdapterConfig, run_interactive};
use crate::store::{FileStore, StoreTransferLookup, WalletStore};

/// Builder assembling a [`Gateway`] from configuration.
pub struct GatewayBuilder {
    config: BotConfig,
    cli_config: CliAdapterConfig,
    interactive: bool,
    simulate: bool,
    store: Option<Arc<dyn WalletStore>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BotConfig::default(),
            cli_config: CliAdapterConfig::default(),
            interactive: true,
            simulate: false,
            store: None,
        }
    }

    /// Uses the given bot configuration.
    #[must_use]
    pub fn bot_config(mut self, config: BotConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses the given CLI session configuration.
    #[must_use]
    pub fn cli_config(mut self, config: CliAdapterConfig) -> Self {
        self.cli_config = config;
        self
    }

    /// Whether to run an interactive CLI session (default true).
    #[must_use]
    pub const fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Runs against an in-memory node instead of a real one.
    #[must_use]
    pub const fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Overrides the record store, e.g. with an in-memory one.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn WalletStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the gateway: connects the node, restores every known user's
    /// key, reconciles the ledger and backfills missed deposits.
    ///
    /// # Errors
    ///
    /// Returns a config error for an invalid configuration and a wallet
    /// `FatalInit` error if the node or stored key material is unusable.
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        let mut errors = Vec::new();
        for issue in config.validate() {
            match issue.level {
                IssueLevel::Warning => warn!(field = %issue.field, "{}", issue.message),
                IssueLevel::Error => errors.push(format!("{}: {}", issue.field, issue.message)),
            }
        }
        if !errors.is_empty() {
            return Err(ConfigError::invalid(errors.join("; ")).into());
        }

        let (feed_tx, feed_rx) = feed_channel();
        let (node, node_task): (Arc<dyn saifu::node::NodeClient>, Option<JoinHandle<()>>) =
            if self.simulate {
                info!("simulation mode: using an in-memory node");
                (Arc::new(MemoryNode::new().with_events(feed_tx)), None)
            } else {
                let client =
                    HttpNodeClient::new(config.node.url.clone(), config.retry_policy(), feed_tx)
                        .map_err(|err| {
                            WalletError::fatal_init(format!("node client: {err}"))
                        })?;
                client.check_connectivity().await.map_err(|err| {
                    WalletError::fatal_init(format!("node unreachable at {}: {err}", config.node.url))
                })?;
                let task = client.spawn_feed();
                info!(url = %config.node.url, "node connected");
                (Arc::new(client), Some(task))
            };

        let store: Arc<dyn WalletStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::new(config.data_dir())),
        };
        let lookup = Arc::new(StoreTransferLookup::new(Arc::clone(&store)));

        let (manager, events_rx) = WalletManager::builder()
            .with_derivation(config.derivation_params()?)
            .with_fee_rate(config.wallet.fee_rate_sats_per_byte)
            .with_dust_limit(config.wallet.dust_limit_sats)
            .with_node(node)
            .with_transfers(lookup)
            .build()?;
        let wallet: WalletRef = Arc::new(RwLock::new(manager));

        // Restore every known user before anything else can run.
        let users = store.users().await?;
        let mut inits = Vec::with_capacity(users.len());
        for record in users {
            let mnemonic = Mnemonic::parse_normalized(&record.mnemonic).map_err(|err| {
                WalletError::fatal_init(format!("stored mnemonic for {}: {err}", record.user_id))
            })?;
            inits.push(InitUser {
                user_id: record.user_id,
                account_id: record.account_id,
                seed: mnemonic.to_seed("").to_vec(),
            });
        }
        wallet.write().await.init(inits).await?;

        let bus = CommandBus::new();
        let handler = Arc::new(CommandHandler::new(
            Arc::clone(&wallet),
            Arc::clone(&store),
            bus.clone(),
            HandlerConfig {
                network: config.network()?,
                min_output_sats: config.wallet.min_output_sats,
                bot_user: config.service.bot_user.clone(),
                poll_interval: Duration::from_secs(1),
            },
        ));
        handler.backfill_deposits().await?;

        let adapters = AdapterManager::new(bus.clone());
        let cli_enabled = config.platforms.cli.enabled;
        if cli_enabled {
            adapters.register(CliAdapter::with_config(self.cli_config.clone())).await;
        }

        Ok(Gateway {
            bus,
            adapters,
            handler,
            wallet,
            cli_config: self.cli_config,
            interactive: self.interactive && cli_enabled,
            simulate: self.simulate,
            feed_rx: Mutex::new(Some(feed_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            node_task: Mutex::new(node_task),
            running: Arc::new(RwLock::new(false)),
        })
    }
}

/// The assembled service.
pub struct Gateway {
    bus: CommandBus,
    adapters: AdapterManager,
    handler: Arc<CommandHandler>,
    wallet: WalletRef,
    cli_config: CliAdapterConfig,
    interactive: bool,
    simulate: bool,
    feed_rx: Mutex<Option<mpsc::Receiver<FeedEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<WalletEvent>>>,
    node_task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
}

impl Gateway {
    /// Runs the gateway until the CLI session ends or [`stop`](Self::stop)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway was already run or a component
    /// fails irrecoverably.
    pub async fn run(&self) -> Result<()> {
        let Some(mut feed_rx) = self.feed_rx.lock().await.take() else {
            return Err(BotError::internal("gateway already consumed its feed"));
        };
        let Some(mut events_rx) = self.events_rx.lock().await.take() else {
            return Err(BotError::internal("gateway already consumed its events"));
        };
        *self.running.write().await = true;
        info!(simulate = self.simulate, interactive = self.interactive, "gateway starting");

        // Single consumer of the node feed; event order is preserved.
        let wallet = Arc::clone(&self.wallet);
        let feed_task = tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                wallet.write().await.handle_feed_event(event).await;
            }
            debug!("node feed closed");
        });

        // Wallet events touch only the store and the bus, never the
        // wallet lock held by the feed task above.
        let handler = Arc::clone(&self.handler);
        let events_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                handler.handle_wallet_event(event).await;
            }
            debug!("wallet events closed");
        });

        for (platform, result) in self.adapters.start_all().await {
            if result.is_ok() {
                info!(%platform, "platform up");
            }
        }
        info!("gateway started");

        let result = if self.interactive {
            let runner = {
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move { handler.run().await })
            };
            let session = run_interactive(&self.bus, self.cli_config.clone()).await;
            self.handler.stop().await;
            runner.await??;
            session.map_err(BotError::from)
        } else {
            self.handler.run().await
        };

        info!("gateway stopping");
        self.adapters.stop_all().await;
        feed_task.abort();
        events_task.abort();
        if let Some(task) = self.node_task.lock().await.take() {
            task.abort();
        }
        *self.running.write().await = false;
        info!("gateway stopped");
        result
    }

    /// Asks the gateway to shut down.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.handler.stop().await;
    }

    /// Whether the gateway is currently running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// The bus commands and notifications flow through.
    #[must_use]
    pub const fn bus(&self) -> &CommandBus {
        &self.bus
    }

    /// Point-in-time status of the whole service.
    pub async fn status(&self) -> GatewayStatus {
        let stats = self.bus.stats().await;
        let platforms = self
            .adapters
            .status_all()
            .await
            .into_iter()
            .map(|status| PlatformStatusInfo {
                platform: status.platform.to_string(),
                state: format!("{:?}", status.state),
                healthy: status.healthy,
            })
            .collect();
        GatewayStatus {
            running: *self.running.read().await,
            simulate: self.simulate,
            platforms,
            commands_processed: stats.commands_count,
            notifications_sent: stats.notifications_count,
            tracked_outputs: self.wallet.read().await.tracked_outputs(),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("interactive", &self.interactive)
            .field("simulate", &self.simulate)
            .finish_non_exhaustive()
    }
}

/// Serializable status snapshot of the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Whether the gateway loop is active.
    pub running: bool,
    /// Whether the in-memory node is in use.
    pub simulate: bool,
    /// Per-platform adapter status.
    pub platforms: Vec<PlatformStatusInfo>,
    /// Commands processed since start.
    pub commands_processed: u64,
    /// Notifications published since start.
    pub notifications_sent: u64,
    /// Outputs currently tracked by the wallet ledger.
    pub tracked_outputs: usize,
}

/// Status of one platform adapter inside [`GatewayStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatusInfo {
    /// Platform name.
    pub platform: String,
    /// Lifecycle state name.
    pub state: String,
    /// Running with no recorded error.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Command, CommandRequest};
    use crate::platform::Platform;
    use crate::store::MemoryStore;

    fn test_builder() -> GatewayBuilder {
        GatewayBuilder::new()
            .simulate(true)
            .interactive(false)
            .store(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = BotConfig::default();
        config.wallet.network = "moonnet".to_string();
        let err = test_builder().bot_config(config).build().await.unwrap_err();
        assert!(matches!(err, BotError::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_command_round_trip_through_gateway() {
        let gateway = Arc::new(test_builder().build().await.unwrap());
        let bus = gateway.bus().clone();
        let mut replies = bus.subscribe_all();

        let runner = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.run().await })
        };

        let request = CommandRequest::new(Platform::Cli, "operator", "direct", Command::Balance);
        bus.publish_command(request).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.text, "Balance: 0 sats");

        let status = gateway.status().await;
        assert!(status.running);
        assert!(status.simulate);

        gateway.stop().await;
        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();
        assert!(!gateway.is_running().await);
    }
}
