//! Async command bus decoupling platform adapters from the command handler.
//!
//! Adapters publish [`CommandRequest`]s onto a bounded queue the handler
//! drains; the handler publishes [`Notification`]s that fan out to every
//! subscriber plus any per-platform queues.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, trace};

use crate::error::{BusError, BusResult};
use crate::events::{CommandRequest, Notification};
use crate::platform::Platform;

/// Default capacity of the command queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Counters for bus monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    /// Commands published since creation.
    pub commands_count: u64,
    /// Notifications published since creation.
    pub notifications_count: u64,
    /// Notifications a platform subscriber failed to take.
    pub dropped_count: u64,
}

struct CommandBusInner {
    commands_tx: mpsc::Sender<CommandRequest>,
    commands_rx: RwLock<Option<mpsc::Receiver<CommandRequest>>>,
    notify_tx: broadcast::Sender<Notification>,
    platform_subscribers: RwLock<HashMap<Platform, Vec<mpsc::Sender<Notification>>>>,
    stats: RwLock<BusStats>,
}

/// Shared command bus. Cloning is cheap and every clone reaches the same
/// queues.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<CommandBusInner>,
}

impl CommandBus {
    /// Creates a bus with default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, DEFAULT_BROADCAST_CAPACITY)
    }

    /// Creates a bus with explicit queue and broadcast capacities.
    #[must_use]
    pub fn with_capacity(queue_capacity: usize, broadcast_capacity: usize) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(queue_capacity);
        let (notify_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            inner: Arc::new(CommandBusInner {
                commands_tx,
                commands_rx: RwLock::new(Some(commands_rx)),
                notify_tx,
                platform_subscribers: RwLock::new(HashMap::new()),
                stats: RwLock::new(BusStats::default()),
            }),
        }
    }

    /// Publishes a command for the handler to execute.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CommandsClosed`] if the handler side is gone.
    pub async fn publish_command(&self, request: CommandRequest) -> BusResult<()> {
        trace!(id = %request.id, platform = %request.platform, "publishing command");
        self.inner
            .commands_tx
            .send(request)
            .await
            .map_err(|_| BusError::CommandsClosed)?;
        self.inner.stats.write().await.commands_count += 1;
        Ok(())
    }

    /// Takes the next pending command, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn consume_command(&self) -> Option<CommandRequest> {
        let mut guard = self.inner.commands_rx.write().await;
        match guard.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    /// Like [`consume_command`](Self::consume_command) but gives up after
    /// `timeout`.
    pub async fn consume_command_timeout(&self, timeout: Duration) -> Option<CommandRequest> {
        tokio::time::timeout(timeout, self.consume_command()).await.ok().flatten()
    }

    /// Publishes a notification to every subscriber.
    ///
    /// Broadcast delivery is best-effort; a platform subscriber that has
    /// gone away is logged and counted, not an error.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for backpressure.
    pub async fn publish_notification(&self, notification: Notification) -> BusResult<()> {
        trace!(id = %notification.id, platform = %notification.platform, "publishing notification");

        // No receiver on the broadcast side is fine.
        let _ = self.inner.notify_tx.send(notification.clone());

        let subscribers = self.inner.platform_subscribers.read().await;
        let mut dropped = 0u64;
        if let Some(senders) = subscribers.get(&notification.platform) {
            for sender in senders {
                if sender.send(notification.clone()).await.is_err() {
                    debug!(platform = %notification.platform, "platform subscriber disconnected");
                    dropped += 1;
                }
            }
        }
        drop(subscribers);

        let mut stats = self.inner.stats.write().await;
        stats.notifications_count += 1;
        stats.dropped_count += dropped;
        Ok(())
    }

    /// Subscribes to every notification regardless of platform.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.inner.notify_tx.subscribe()
    }

    /// Subscribes to notifications addressed to one platform.
    pub async fn subscribe_platform(&self, platform: Platform) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(DEFAULT_BROADCAST_CAPACITY);
        self.inner.platform_subscribers.write().await.entry(platform).or_default().push(tx);
        rx
    }

    /// Current counters.
    pub async fn stats(&self) -> BusStats {
        *self.inner.stats.read().await
    }

    /// Handle for publishing commands without holding the whole bus.
    #[must_use]
    pub fn command_handle(&self) -> CommandHandle {
        CommandHandle { tx: self.inner.commands_tx.clone() }
    }

    /// Handle for publishing notifications without holding the whole bus.
    #[must_use]
    pub fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle { bus: self.clone() }
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus").finish_non_exhaustive()
    }
}

/// Cheap handle that can only publish commands.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<CommandRequest>,
}

impl CommandHandle {
    /// Publishes a command for the handler to execute.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::CommandsClosed`] if the handler side is gone.
    pub async fn publish(&self, request: CommandRequest) -> BusResult<()> {
        self.tx.send(request).await.map_err(|_| BusError::CommandsClosed)
    }
}

/// Cheap handle that can only publish notifications.
#[derive(Clone)]
pub struct NotifyHandle {
    bus: CommandBus,
}

impl NotifyHandle {
    /// Publishes a notification to every subscriber.
    ///
    /// # Errors
    ///
    /// See [`CommandBus::publish_notification`].
    pub async fn publish(&self, notification: Notification) -> BusResult<()> {
        self.bus.publish_notification(notification).await
    }
}

/// Builder for buses with non-default capacities.
#[derive(Debug, Default)]
pub struct CommandBusBuilder {
    queue_capacity: Option<usize>,
    broadcast_capacity: Option<usize>,
}

impl CommandBusBuilder {
    /// Creates a builder with default capacities.
    #[must_use]
    pub const fn new() -> Self {
        Self { queue_capacity: None, broadcast_capacity: None }
    }

    /// Sets the command queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Sets the notification broadcast capacity.
    #[must_use]
    pub const fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = Some(capacity);
        self
    }

    /// Builds the bus.
    #[must_use]
    pub fn build(self) -> CommandBus {
        CommandBus::with_capacity(
            self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            self.broadcast_capacity.unwrap_or(DEFAULT_BROADCAST_CAPACITY),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Command;

    #[tokio::test]
    async fn test_command_round_trip() {
        let bus = CommandBus::new();
        bus.publish_command(CommandRequest::cli(Command::Balance)).await.unwrap();

        let request = bus.consume_command().await.unwrap();
        assert_eq!(request.command, Command::Balance);
        assert_eq!(bus.stats().await.commands_count, 1);
    }

    #[tokio::test]
    async fn test_notification_broadcast_reaches_all_subscribers() {
        let bus = CommandBus::new();
        let mut first = bus.subscribe_all();
        let mut second = bus.subscribe_all();

        let note = Notification::new(Platform::Cli, "direct", "Balance: 0 sats");
        bus.publish_notification(note).await.unwrap();

        assert_eq!(first.recv().await.unwrap().text, "Balance: 0 sats");
        assert_eq!(second.recv().await.unwrap().text, "Balance: 0 sats");
    }

    #[tokio::test]
    async fn test_platform_subscription_filters() {
        let bus = CommandBus::new();
        let mut cli_rx = bus.subscribe_platform(Platform::Cli).await;

        bus.publish_notification(Notification::new(Platform::Telegram, "965", "for telegram"))
            .await
            .unwrap();
        bus.publish_notification(Notification::new(Platform::Cli, "direct", "for cli"))
            .await
            .unwrap();

        let received = cli_rx.recv().await.unwrap();
        assert_eq!(received.text, "for cli");
        assert!(cli_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handles_publish() {
        let bus = CommandBusBuilder::new().queue_capacity(8).broadcast_capacity(8).build();
        let commands = bus.command_handle();
        let notifies = bus.notify_handle();
        let mut all = bus.subscribe_all();

        commands.publish(CommandRequest::cli(Command::Balance)).await.unwrap();
        notifies.publish(Notification::new(Platform::Cli, "direct", "hi")).await.unwrap();

        assert!(bus.consume_command_timeout(Duration::from_millis(100)).await.is_some());
        assert_eq!(all.recv().await.unwrap().text, "hi");
    }

    #[tokio::test]
    async fn test_consume_timeout_expires() {
        let bus = CommandBus::new();
        assert!(bus.consume_command_timeout(Duration::from_millis(10)).await.is_none());
    }
}
