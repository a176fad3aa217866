//! Ports for row-change notifications emitted by the state store.
//!
//! A [`NotificationConnector`] opens connections subscribed to a set of
//! channels. The change listener owns the single live
//! [`NotificationConnection`] and forwards what it receives to a
//! [`ListenerHandler`].

use async_trait::async_trait;

use super::define_port_error;

/// Channel carrying changes to `repositories`.
pub const REPOSITORIES_CHANNEL: &str = "repositories_updates";
/// Channel carrying changes to `storage_repositories`.
pub const STORAGE_REPOSITORIES_CHANNEL: &str = "storage_repositories_updates";

define_port_error! {
    /// Errors raised by notification connections.
    pub enum NotificationError {
        /// The connection could not be opened or was lost.
        Connection { message: String } => "notification connection failed: {message}",
        /// The server answered unexpectedly.
        Protocol { message: String } => "notification protocol error: {message}",
    }
}

/// One notification received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Opens subscribed notification connections.
#[async_trait]
pub trait NotificationConnector: Send + Sync {
    /// Connect and subscribe to every channel in `channels`.
    async fn connect(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn NotificationConnection>, NotificationError>;
}

/// A live subscribed connection.
#[async_trait]
pub trait NotificationConnection: Send {
    /// Wait for the next notification.
    ///
    /// Must be cancel-safe: dropping the future loses no notification.
    async fn recv(&mut self) -> Result<Notification, NotificationError>;

    /// Ping the connection.
    async fn ping(&mut self) -> Result<(), NotificationError>;

    /// Close the connection.
    async fn close(self: Box<Self>);
}

/// Receives the change listener's events.
///
/// Calls happen on the listener task and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait ListenerHandler: Send + Sync {
    /// A notification arrived.
    fn notification(&self, notification: &Notification);

    /// The connection was lost; notifications may have been missed.
    fn disconnect(&self, error: &NotificationError);

    /// A connection was (re)established and subscribed.
    fn connected(&self);
}
