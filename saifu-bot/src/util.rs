//! Small shared utilities.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock reads before the epoch.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Unique id for bus messages.
#[must_use]
pub fn generate_message_id() -> String {
    format!("msg-{}", Uuid::new_v4().simple())
}

/// Unique id with a caller-chosen prefix, e.g. `acct-...`.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// The user's home directory, falling back to the current directory.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Directory holding the bot's configuration (`~/.saifu`).
#[must_use]
pub fn config_dir() -> PathBuf {
    home_dir().join(".saifu")
}

/// Default directory for persisted records (`~/.saifu/data`).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    config_dir().join("data")
}

/// Normalizes a platform handle: trims whitespace, strips a leading `@`
/// and lowercases, so `@Alice` and `alice` name the same user.
#[must_use]
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}
