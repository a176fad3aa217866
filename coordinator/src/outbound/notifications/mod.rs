//! Notification adapters for the change listener.

mod pg_listener;

pub use pg_listener::PgNotificationConnector;
