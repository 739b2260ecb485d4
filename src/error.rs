//! Error taxonomy returned to callers of the connection manager.
//!
//! Connection failures and unexpected disconnects never show up here:
//! the manager absorbs them into retries and only reports them in logs.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration (e.g. backoff bounds). Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `open_channel` was called while no connection is held.
    #[error("not connected to the broker")]
    NotConnected,

    /// The broker client failed to open a channel on a live connection.
    #[error("failed to open channel: {0:#}")]
    Channel(anyhow::Error),

    /// The manager did not answer within the caller's timeout.
    #[error("no reply from connection manager within {0:?}")]
    Timeout(Duration),

    /// The manager has shut down.
    #[error("connection manager has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
