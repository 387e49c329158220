//! Error types for the saifu bot service.

use thiserror::Error;

// ============================================================================
// Top-level error
// ============================================================================

/// Top-level error type encompassing all bot failures.
#[derive(Error, Debug)]
pub enum BotError {
    /// Command bus errors.
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    /// Platform adapter errors.
    #[error("platform: {0}")]
    Platform(#[from] PlatformError),

    /// Command parsing and argument errors.
    #[error("command: {0}")]
    Command(#[from] CommandError),

    /// Configuration errors.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Record store errors.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Wallet engine errors.
    #[error("wallet: {0}")]
    Wallet(#[from] saifu::error::WalletError),

    /// IO errors.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Task join errors.
    #[error("task: {0}")]
    Task(String),

    /// Catch-all internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl BotError {
    /// Creates an internal error from any displayable value.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<tokio::task::JoinError> for BotError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Convenient result alias for bot operations.
pub type Result<T> = std::result::Result<T, BotError>;

// ============================================================================
// Bus errors
// ============================================================================

/// Errors from the command bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// The command queue has been closed.
    #[error("command queue closed")]
    CommandsClosed,

    /// The notification channel has been closed.
    #[error("notification channel closed")]
    NotificationsClosed,
}

/// Result alias for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

// ============================================================================
// Platform errors
// ============================================================================

/// Errors from platform adapters.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// The adapter failed to start.
    #[error("failed to start: {0}")]
    StartFailed(String),

    /// The adapter failed to stop cleanly.
    #[error("failed to stop: {0}")]
    StopFailed(String),

    /// Delivering a notification failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The adapter is not running.
    #[error("adapter not running")]
    NotRunning,

    /// No such platform.
    #[error("unknown platform: {0}")]
    Unknown(String),

    /// Adapter-internal error.
    #[error("platform internal: {0}")]
    Internal(String),
}

impl PlatformError {
    /// Creates a start failure from any displayable value.
    #[inline]
    pub fn start(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    /// Creates a send failure from any displayable value.
    #[inline]
    pub fn send(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }

    /// Creates an internal adapter error from any displayable value.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result alias for platform operations.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

// ============================================================================
// Command errors
// ============================================================================

/// Errors from parsing or validating user commands.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command word is not recognized.
    #[error("unknown command: {0}")]
    Unknown(String),

    /// The command was called with the wrong arguments.
    #[error("usage: {0}")]
    Usage(String),

    /// The amount argument did not parse or is out of range.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// Result alias for command parsing.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

// ============================================================================
// Config errors
// ============================================================================

/// Errors from configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the config file failed.
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON.
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// A required setting is absent.
    #[error("missing config: {0}")]
    Missing(String),

    /// A setting has an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Creates a missing-setting error.
    #[inline]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }

    /// Creates an invalid-setting error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result alias for config operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Storage errors
// ============================================================================

/// Errors from the record store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem access failed.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record did not deserialize.
    #[error("storage json: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Creates a not-found error.
    #[inline]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Error context extension
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wraps the error with a static message.
    ///
    /// # Errors
    ///
    /// Returns the original error annotated with `msg`.
    fn context(self, msg: &str) -> Result<T>;

    /// Wraps the error with a lazily built message.
    ///
    /// # Errors
    ///
    /// Returns the original error annotated with the built message.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Display> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|err| BotError::Internal(format!("{msg}: {err}")))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|err| BotError::Internal(format!("{}: {err}", f())))
    }
}
