//! Platform adapter abstraction for connecting chat surfaces to the bus.
//!
//! An adapter owns one chat platform: it parses user input into
//! [`CommandRequest`](crate::events::CommandRequest)s, publishes them on the
//! [`CommandBus`], and delivers [`Notification`]s back to the platform.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::bus::CommandBus;
use crate::error::{PlatformError, PlatformResult};
use crate::events::Notification;

/// Chat platforms the service can face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Interactive terminal session.
    Cli,
    /// Telegram bot.
    Telegram,
    /// Discord bot.
    Discord,
    /// Twitter/X mentions.
    Twitter,
}

impl Platform {
    /// Every platform the service knows about.
    pub const ALL: [Self; 4] = [Self::Cli, Self::Telegram, Self::Discord, Self::Twitter];

    /// Lowercase name used in user ids and config keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cli" => Ok(Self::Cli),
            "telegram" => Ok(Self::Telegram),
            "discord" => Ok(Self::Discord),
            "twitter" => Ok(Self::Twitter),
            other => Err(PlatformError::Unknown(other.to_string())),
        }
    }
}

/// Lifecycle state of a platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// Not yet started or fully stopped.
    #[default]
    Stopped,
    /// Start requested, not yet serving.
    Starting,
    /// Serving traffic.
    Running,
    /// Stop requested, draining.
    Stopping,
    /// Failed; see `last_error`.
    Error,
}

/// Point-in-time status snapshot of an adapter.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    /// Which platform this adapter serves.
    pub platform: Platform,
    /// Current lifecycle state.
    pub state: AdapterState,
    /// Commands published since start.
    pub commands_received: u64,
    /// Notifications delivered since start.
    pub notifications_sent: u64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Running with no recorded error.
    pub healthy: bool,
}

/// A connection to one chat platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// The platform this adapter serves.
    fn platform(&self) -> Platform;

    /// Starts the adapter and wires it to the bus.
    async fn start(&self, bus: &CommandBus) -> PlatformResult<()>;

    /// Stops the adapter.
    async fn stop(&self) -> PlatformResult<()>;

    /// Delivers one notification to the platform.
    async fn send(&self, notification: &Notification) -> PlatformResult<()>;

    /// Returns the adapter's current status.
    async fn status(&self) -> AdapterStatus;

    /// Whether the adapter is currently serving.
    async fn is_running(&self) -> bool {
        matches!(self.status().await.state, AdapterState::Running)
    }
}

/// Boxed adapter for dynamic registration.
pub type BoxedAdapter = Box<dyn PlatformAdapter>;

/// Registry owning every adapter and their shared bus.
pub struct AdapterManager {
    adapters: RwLock<Vec<Arc<dyn PlatformAdapter>>>,
    bus: CommandBus,
}

impl AdapterManager {
    /// Creates a manager for adapters sharing `bus`.
    #[must_use]
    pub fn new(bus: CommandBus) -> Self {
        Self { adapters: RwLock::new(Vec::new()), bus }
    }

    /// Registers an adapter.
    pub async fn register(&self, adapter: impl PlatformAdapter + 'static) {
        self.register_arc(Arc::new(adapter)).await;
    }

    /// Registers an already shared adapter.
    pub async fn register_arc(&self, adapter: Arc<dyn PlatformAdapter>) {
        info!(platform = %adapter.platform(), "platform registered");
        self.adapters.write().await.push(adapter);
    }

    /// Starts every registered adapter. A failing adapter is logged and
    /// skipped; the rest still start.
    pub async fn start_all(&self) -> Vec<(Platform, PlatformResult<()>)> {
        let adapters = self.adapters.read().await;
        let mut results = Vec::with_capacity(adapters.len());
        for adapter in adapters.iter() {
            let platform = adapter.platform();
            let result = adapter.start(&self.bus).await;
            if let Err(ref err) = result {
                error!(platform = %platform, error = %err, "platform failed to start");
            }
            results.push((platform, result));
        }
        results
    }

    /// Stops every registered adapter.
    pub async fn stop_all(&self) {
        let adapters = self.adapters.read().await;
        for adapter in adapters.iter() {
            if let Err(err) = adapter.stop().await {
                error!(platform = %adapter.platform(), error = %err, "platform failed to stop");
            }
        }
    }

    /// Status of every registered adapter.
    pub async fn status_all(&self) -> Vec<AdapterStatus> {
        let adapters = self.adapters.read().await;
        let mut statuses = Vec::with_capacity(adapters.len());
        for adapter in adapters.iter() {
            statuses.push(adapter.status().await);
        }
        statuses
    }

    /// The bus adapters publish to.
    #[must_use]
    pub const fn bus(&self) -> &CommandBus {
        &self.bus
    }

    /// Number of registered adapters.
    pub async fn adapter_count(&self) -> usize {
        self.adapters.read().await.len()
    }
}

impl fmt::Debug for AdapterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterManager").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct AdapterStats {
    commands_received: u64,
    notifications_sent: u64,
    last_error: Option<String>,
}

/// Shared plumbing for adapter implementations: state tracking and counters.
#[derive(Debug)]
pub struct AdapterBase {
    platform: Platform,
    state: RwLock<AdapterState>,
    stats: RwLock<AdapterStats>,
}

impl AdapterBase {
    /// Creates idle plumbing for `platform`.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: RwLock::new(AdapterState::default()),
            stats: RwLock::new(AdapterStats::default()),
        }
    }

    /// The platform this base belongs to.
    #[must_use]
    pub const fn platform(&self) -> Platform {
        self.platform
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> AdapterState {
        *self.state.read().await
    }

    /// Moves to a new lifecycle state.
    pub async fn set_state(&self, state: AdapterState) {
        let mut current = self.state.write().await;
        debug!(platform = %self.platform, from = ?*current, to = ?state, "adapter state change");
        *current = state;
    }

    /// Counts one command published from this platform.
    pub async fn record_received(&self) {
        self.stats.write().await.commands_received += 1;
    }

    /// Counts one notification delivered to this platform.
    pub async fn record_sent(&self) {
        self.stats.write().await.notifications_sent += 1;
    }

    /// Records an adapter error for status reporting.
    pub async fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(platform = %self.platform, error = %message, "adapter error");
        self.stats.write().await.last_error = Some(message);
    }

    /// Builds a status snapshot from the current state and counters.
    pub async fn build_status(&self) -> AdapterStatus {
        let state = *self.state.read().await;
        let stats = self.stats.read().await;
        AdapterStatus {
            platform: self.platform,
            state,
            commands_received: stats.commands_received,
            notifications_sent: stats.notifications_sent,
            last_error: stats.last_error.clone(),
            healthy: state == AdapterState::Running && stats.last_error.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!(matches!("matrix".parse::<Platform>(), Err(PlatformError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_adapter_base_lifecycle() {
        let base = AdapterBase::new(Platform::Cli);
        assert_eq!(base.state().await, AdapterState::Stopped);

        base.set_state(AdapterState::Running).await;
        base.record_received().await;
        base.record_received().await;
        base.record_sent().await;

        let status = base.build_status().await;
        assert_eq!(status.state, AdapterState::Running);
        assert_eq!(status.commands_received, 2);
        assert_eq!(status.notifications_sent, 1);
        assert!(status.healthy);

        base.record_error("socket dropped").await;
        let status = base.build_status().await;
        assert!(!status.healthy);
        assert_eq!(status.last_error.as_deref(), Some("socket dropped"));
    }

    #[tokio::test]
    async fn test_manager_registration() {
        let manager = AdapterManager::new(CommandBus::new());
        assert_eq!(manager.adapter_count().await, 0);
        manager.register(crate::platforms::CliAdapter::new()).await;
        assert_eq!(manager.adapter_count().await, 1);
        let statuses = manager.status_all().await;
        assert_eq!(statuses[0].platform, Platform::Cli);
        assert_eq!(statuses[0].state, AdapterState::Stopped);
    }
}
