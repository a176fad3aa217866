//! `LISTEN`/`NOTIFY` connections backed by the sqlx PostgreSQL listener.
//!
//! Each connection is a dedicated [`PgListener`]. A lost connection is
//! reported as an error rather than silently re-established, so the change
//! listener can tell its handler that notifications may have been missed.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgNotification};
use tracing::debug;

use crate::domain::ports::{
    Notification, NotificationConnection, NotificationConnector, NotificationError,
};

/// Opens sqlx listener connections to one database.
#[derive(Debug, Clone)]
pub struct PgNotificationConnector {
    database_url: String,
}

impl PgNotificationConnector {
    /// Create a connector for `database_url`.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

fn map_sqlx_error(error: sqlx::Error) -> NotificationError {
    match error {
        sqlx::Error::Protocol(message) => NotificationError::protocol(message),
        sqlx::Error::Database(err) => NotificationError::protocol(err.to_string()),
        other => NotificationError::connection(other.to_string()),
    }
}

fn into_notification(notification: PgNotification) -> Notification {
    Notification {
        channel: notification.channel().to_owned(),
        payload: notification.payload().to_owned(),
    }
}

#[async_trait]
impl NotificationConnector for PgNotificationConnector {
    async fn connect(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn NotificationConnection>, NotificationError> {
        let mut listener = PgListener::connect(&self.database_url)
            .await
            .map_err(map_sqlx_error)?;
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(map_sqlx_error)?;
        debug!(channels = ?channels, "notification channels subscribed");
        Ok(Box::new(PgNotificationConnection { listener }))
    }
}

struct PgNotificationConnection {
    listener: PgListener,
}

#[async_trait]
impl NotificationConnection for PgNotificationConnection {
    async fn recv(&mut self) -> Result<Notification, NotificationError> {
        match self.listener.try_recv().await.map_err(map_sqlx_error)? {
            Some(notification) => Ok(into_notification(notification)),
            None => Err(NotificationError::connection(
                "notification connection closed",
            )),
        }
    }

    async fn ping(&mut self) -> Result<(), NotificationError> {
        sqlx::query("SELECT 1")
            .execute(&mut self.listener)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) {
        if let Err(err) = self.listener.unlisten_all().await {
            debug!(error = %err, "unlisten on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn protocol_errors_stay_protocol_errors() {
        let error = map_sqlx_error(sqlx::Error::Protocol("unexpected message".into()));
        assert_eq!(error, NotificationError::protocol("unexpected message"));
    }

    #[rstest]
    fn io_errors_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = map_sqlx_error(sqlx::Error::Io(io));
        assert!(matches!(error, NotificationError::Connection { .. }));
    }

    #[rstest]
    fn pool_timeouts_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            NotificationError::Connection { .. }
        ));
    }
}
