//! `BrokerClient` trait — the capability the connection manager drives.
//!
//! The manager never speaks a wire protocol itself. Implementations
//! establish connections, open channels on them, close them, and report
//! when a connection terminates so the manager can reconnect.

#[cfg(test)]
pub(crate) mod fake;
pub mod tcp;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

pub use tcp::{TcpBroker, TcpChannel, TcpConnection};

/// Why a watched connection terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request through `BrokerClient::close`.
    Closed,
    /// The remote end closed the connection.
    PeerClosed,
    /// Transport error.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::PeerClosed => write!(f, "closed by peer"),
            DisconnectReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Connection parameters (host, credentials, TLS…), opaque to the manager.
    type Options: Send + Sync + 'static;
    type Connection: Send + Sync + 'static;
    type Channel: Send + 'static;

    async fn connect(&self, options: &Self::Options) -> Result<Self::Connection>;

    async fn open_channel(&self, connection: &Self::Connection) -> Result<Self::Channel>;

    /// Asks the connection to close. Termination is confirmed by `closed`.
    async fn close(&self, connection: &Self::Connection) -> Result<()>;

    /// Resolves once the connection has terminated, for whatever reason.
    /// Must be safe to call several times on the same connection.
    async fn closed(&self, connection: &Self::Connection) -> DisconnectReason;
}
