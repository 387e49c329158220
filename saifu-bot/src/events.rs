//! Command and notification events flowing through the bus.

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::util::{generate_message_id, timestamp_ms};

/// A wallet command a user typed on some platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Show the pooled balance of the sender's account.
    Balance,
    /// Show the sender's deposit address.
    DepositAddress,
    /// Move sats to another user on the same platform.
    Give {
        /// Recipient handle, already normalized.
        to: String,
        /// Amount in satoshis.
        amount_sats: u64,
    },
    /// Send sats to an external address.
    Withdraw {
        /// Destination address string, parsed later against the
        /// configured network.
        address: String,
        /// Amount in satoshis.
        amount_sats: u64,
    },
    /// Attach the sender's identity to the account owning this secret.
    Link {
        /// Link secret shown to the account's existing owner.
        secret: String,
    },
}

/// A parsed command together with who sent it and where to reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique request id.
    pub id: String,
    /// Platform the command arrived on.
    pub platform: Platform,
    /// Sender's handle within the platform.
    pub sender: String,
    /// Conversation the reply goes to.
    pub chat_id: String,
    /// The command itself.
    pub command: Command,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl CommandRequest {
    /// Creates a request with a fresh id and the current timestamp.
    pub fn new(
        platform: Platform,
        sender: impl Into<String>,
        chat_id: impl Into<String>,
        command: Command,
    ) -> Self {
        Self {
            id: generate_message_id(),
            platform,
            sender: sender.into(),
            chat_id: chat_id.into(),
            command,
            timestamp: timestamp_ms(),
        }
    }

    /// Creates a CLI request from the local operator.
    pub fn cli(command: Command) -> Self {
        Self::new(Platform::Cli, "operator", "direct", command)
    }

    /// Platform-scoped user id, e.g. `cli:operator`.
    ///
    /// The same handle on two platforms is two different users.
    #[must_use]
    pub fn user_id(&self) -> String {
        format!("{}:{}", self.platform, self.sender)
    }
}

/// A message the service sends back to a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification id.
    pub id: String,
    /// Platform to deliver on.
    pub platform: Platform,
    /// Conversation to deliver to.
    pub chat_id: String,
    /// Message body.
    pub text: String,
    /// Id of the request this answers, if any.
    pub reply_to: Option<String>,
}

impl Notification {
    /// Creates an unsolicited notification, e.g. a deposit alert.
    pub fn new(platform: Platform, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            platform,
            chat_id: chat_id.into(),
            text: text.into(),
            reply_to: None,
        }
    }

    /// Creates a reply to `request` on its own platform and chat.
    pub fn reply_to(request: &CommandRequest, text: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            platform: request.platform,
            chat_id: request.chat_id.clone(),
            text: text.into(),
            reply_to: Some(request.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_creation() {
        let request = CommandRequest::new(Platform::Cli, "alice", "direct", Command::Balance);
        assert_eq!(request.platform, Platform::Cli);
        assert_eq!(request.user_id(), "cli:alice");
        assert!(request.id.starts_with("msg-"));
        assert!(request.timestamp > 0);
    }

    #[test]
    fn test_same_handle_differs_by_platform() {
        let cli = CommandRequest::new(Platform::Cli, "alice", "direct", Command::Balance);
        let tg = CommandRequest::new(Platform::Telegram, "alice", "965", Command::Balance);
        assert_ne!(cli.user_id(), tg.user_id());
    }

    #[test]
    fn test_reply_targets_request_chat() {
        let request = CommandRequest::cli(Command::DepositAddress);
        let reply = Notification::reply_to(&request, "Deposit address: bc1...");
        assert_eq!(reply.platform, request.platform);
        assert_eq!(reply.chat_id, request.chat_id);
        assert_eq!(reply.reply_to.as_deref(), Some(request.id.as_str()));
    }

    #[test]
    fn test_command_wire_format() {
        let command: Command =
            serde_json::from_str(r#"{"type":"give","to":"bob","amount_sats":5000}"#).unwrap();
        assert_eq!(command, Command::Give { to: "bob".to_string(), amount_sats: 5000 });
    }
}
