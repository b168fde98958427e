use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::ChatId,
    protocol::{OutboundChatMessage, SEND_DESTINATION},
};
use tracing::{debug, warn};

use crate::{
    connection::{ConnectionManager, ConnectionState, PublishReceipt},
    error::{ConnectionError, ValidationError},
};

/// Result of a send. Expected failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Accepted while the link was down; goes out after the next handshake.
    Queued,
    Rejected(ValidationError),
    Unavailable { retryable: bool, reason: String },
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Sent | Self::Queued)
    }
}

pub struct OutboundDispatcher {
    connection: Arc<ConnectionManager>,
    ready_timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, ready_timeout: Duration) -> Self {
        Self {
            connection,
            ready_timeout,
        }
    }

    /// Publishes `{chatId?, username, text, timestamp}` to the send
    /// destination. The server echo comes back as an ordinary NEW event.
    pub async fn send(&self, chat_id: Option<&ChatId>, target: &str, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Rejected(ValidationError::EmptyMessage);
        }
        let target = target.trim();
        if target.is_empty() {
            return SendOutcome::Rejected(ValidationError::EmptyRecipient);
        }

        if self.connection.state() != ConnectionState::Connected {
            debug!(timeout = ?self.ready_timeout, "dispatcher: waiting for connection");
            if !self.connection.wait_for_connected(self.ready_timeout).await {
                warn!("dispatcher: connection not ready, send refused");
                return SendOutcome::Unavailable {
                    retryable: true,
                    reason: ConnectionError::NotConnected.to_string(),
                };
            }
        }

        let payload = OutboundChatMessage {
            chat_id: chat_id.cloned(),
            username: target.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(err) => {
                return SendOutcome::Unavailable {
                    retryable: false,
                    reason: err.to_string(),
                }
            }
        };

        match self.connection.publish(SEND_DESTINATION, body).await {
            Ok(PublishReceipt::Sent) => SendOutcome::Sent,
            Ok(PublishReceipt::Queued) => SendOutcome::Queued,
            Err(err) => {
                warn!("dispatcher: publish failed: {err}");
                SendOutcome::Unavailable {
                    retryable: !matches!(err, ConnectionError::Closed),
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
