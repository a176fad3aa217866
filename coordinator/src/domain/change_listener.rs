//! Long-lived subscriber to the state store's change notifications.
//!
//! The listener owns exactly one subscribed connection. It forwards every
//! notification to its [`ListenerHandler`], pings the connection every
//! `ping_period`, and on connection loss reconnects with a doubling delay
//! bounded by `[min_reconnect, max_reconnect]`. Only the first connection
//! error is surfaced to the caller; later ones are logged and retried.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::domain::ports::{
    ListenerHandler, Notification, NotificationConnection, NotificationConnector,
    NotificationError, define_port_error,
};

define_port_error! {
    /// Errors raised when starting the change listener.
    pub enum ListenerError {
        /// A channel was named more than once.
        DuplicateChannel { channel: String } => "channel {channel} is listed more than once",
        /// No channel was named.
        NoChannels => "at least one channel is required",
        /// The first connection attempt failed.
        InitialConnect { message: String } => "initial notification connection failed: {message}",
    }
}

/// Timing of the change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Interval between health pings.
    pub ping_period: Duration,
    /// First delay before reconnecting.
    pub min_reconnect: Duration,
    /// Upper bound of the reconnect delay.
    pub max_reconnect: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(10),
            min_reconnect: Duration::from_secs(5),
            max_reconnect: Duration::from_secs(40),
        }
    }
}

/// Handle of a running change listener.
pub struct ChangeListener {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChangeListener {
    /// Validate `channels`, connect, and spawn the listening task.
    ///
    /// `handler.connected()` is invoked once the first connection is
    /// subscribed.
    pub async fn start<C>(
        connector: Arc<C>,
        channels: Vec<String>,
        handler: Arc<dyn ListenerHandler>,
        config: ListenerConfig,
    ) -> Result<Self, ListenerError>
    where
        C: NotificationConnector + 'static,
    {
        validate_channels(&channels)?;

        let connection = connector
            .connect(&channels)
            .await
            .map_err(|err| ListenerError::initial_connect(err.to_string()))?;
        info!(channels = ?channels, "change listener connected");
        handler.connected();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = ListenerTask {
            connector,
            channels,
            handler,
            config,
        };
        let task = tokio::spawn(worker.run(connection, shutdown_rx));
        Ok(Self { shutdown, task })
    }

    /// Stop listening and close the connection.
    pub async fn close(self) {
        // The task may already have exited; nothing is left to signal then.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "change listener task ended abnormally");
        }
    }
}

fn validate_channels(channels: &[String]) -> Result<(), ListenerError> {
    if channels.is_empty() {
        return Err(ListenerError::no_channels());
    }
    let mut seen = BTreeSet::new();
    for channel in channels {
        if !seen.insert(channel.as_str()) {
            return Err(ListenerError::duplicate_channel(channel.as_str()));
        }
    }
    Ok(())
}

enum ListenEvent {
    Shutdown,
    Ping,
    Received(Result<Notification, NotificationError>),
}

enum ListenOutcome {
    Shutdown,
    Disconnected(NotificationError),
}

struct ListenerTask<C> {
    connector: Arc<C>,
    channels: Vec<String>,
    handler: Arc<dyn ListenerHandler>,
    config: ListenerConfig,
}

impl<C> ListenerTask<C>
where
    C: NotificationConnector + 'static,
{
    async fn run(
        self,
        mut connection: Box<dyn NotificationConnection>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            match self.listen(connection.as_mut(), &mut shutdown).await {
                ListenOutcome::Shutdown => {
                    connection.close().await;
                    info!("change listener stopped");
                    return;
                }
                ListenOutcome::Disconnected(err) => {
                    warn!(error = %err, "change listener lost its connection");
                    connection.close().await;
                    self.handler.disconnect(&err);
                    match self.reconnect(&mut shutdown).await {
                        Some(next) => connection = next,
                        None => {
                            info!("change listener stopped");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn listen(
        &self,
        connection: &mut dyn NotificationConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ListenOutcome {
        let period = self.config.ping_period;
        let mut ping = time::interval_at(Instant::now() + period, period);

        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        ListenEvent::Shutdown
                    } else {
                        continue;
                    }
                }
                _ = ping.tick() => ListenEvent::Ping,
                received = connection.recv() => ListenEvent::Received(received),
            };

            match event {
                ListenEvent::Shutdown => return ListenOutcome::Shutdown,
                ListenEvent::Ping => {
                    if let Err(err) = connection.ping().await {
                        warn!(error = %err, "change listener health ping failed");
                        return ListenOutcome::Disconnected(err);
                    }
                    debug!("change listener health ping succeeded");
                }
                ListenEvent::Received(Ok(notification)) => {
                    debug!(channel = %notification.channel, "change notification received");
                    self.handler.notification(&notification);
                }
                ListenEvent::Received(Err(err)) => return ListenOutcome::Disconnected(err),
            }
        }
    }

    /// Reconnect until it succeeds or shutdown is requested.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn NotificationConnection>> {
        let mut delay = self.config.min_reconnect;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                    continue;
                }
                () = time::sleep(delay) => {}
            }

            match self.connector.connect(&self.channels).await {
                Ok(connection) => {
                    info!("change listener reconnected");
                    self.handler.connected();
                    return Some(connection);
                }
                Err(err) => {
                    warn!(error = %err, delay = ?delay, "change listener reconnect failed");
                    delay = next_reconnect_delay(delay, self.config.max_reconnect);
                }
            }
        }
    }
}

fn next_reconnect_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests;
