//! Keeps a single supervised connection to a message broker.
//!
//! [`ConnectionManager`] connects through a [`BrokerClient`], watches the
//! live connection, and reconnects with exponential backoff
//! ([`BackoffPolicy`]) when an attempt fails or the connection drops.
//! Callers open channels on whatever connection is current through a
//! [`ManagerHandle`].

pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod manager;

pub use backoff::{Backoff, BackoffPolicy, BackoffState};
pub use broker::{BrokerClient, DisconnectReason};
pub use error::{Error, Result};
pub use manager::{ConnectionManager, LinkState, ManagerHandle, MonitorToken, Status};
