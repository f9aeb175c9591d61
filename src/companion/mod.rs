//! Feedback delivery to the paired wearable.

pub mod message;
pub mod service;
pub mod tcp;

pub use message::{FeedbackMessage, FieldValue, MessageFields, MessageKind};
pub use service::{CompanionHandle, CompanionService};
pub use tcp::TcpLink;

use futures::future::BoxFuture;
use tracing::warn;

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }
}

/// Transport to the wearable.
pub trait CompanionLink: Send + Sync {
    /// Establish the session. Messages are held back until this succeeds.
    fn activate(&self) -> BoxFuture<'_, Result<(), LinkError>>;

    fn is_reachable(&self) -> bool;

    /// Direct reliable send. Resolves once the receiver acknowledged.
    fn send_message<'a>(&'a self, fields: &'a MessageFields) -> BoxFuture<'a, Result<(), LinkError>>;

    /// Best-effort queued delivery.
    fn transfer_user_info<'a>(
        &'a self,
        fields: &'a MessageFields,
    ) -> BoxFuture<'a, Result<(), LinkError>>;

    /// Replace the receiver's latest state snapshot.
    fn update_context<'a>(&'a self, fields: &'a MessageFields)
        -> BoxFuture<'a, Result<(), LinkError>>;
}

/// Last-resort local notification when every delivery path failed.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &FeedbackMessage) -> anyhow::Result<()>;
}

/// Surfaces undeliverable messages in the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &FeedbackMessage) -> anyhow::Result<()> {
        warn!(
            kind = message.kind().as_str(),
            id = %message.id(),
            angle = message.angle().unwrap_or("-"),
            successful = ?message.is_successful(),
            "companion unavailable, feedback shown locally"
        );
        Ok(())
    }
}
