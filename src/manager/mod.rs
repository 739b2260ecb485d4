//! Connection manager — owns the broker connection lifecycle.
//!
//! `ConnectionManager::start` spawns an actor task that connects,
//! watches the live connection, and reconnects with exponential backoff
//! when an attempt fails or the connection dies. Callers talk to it
//! through a cloneable [`ManagerHandle`]; every input (caller requests,
//! retry timers, monitor notifications) is funneled into the actor's
//! queue, so state is only ever touched by the actor itself.

mod actor;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::BackoffState;
use crate::error::{Error, Result};

pub use actor::ConnectionManager;

/// Capacity of the caller → actor command queue.
const COMMAND_QUEUE: usize = 100;

/// Identifies one monitored connection. Notifications carrying any other
/// token are stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    /// Shut down; no connection is held and none will be attempted.
    Stopped,
}

/// Snapshot published by the actor after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: LinkState,
    pub backoff: BackoffState,
    /// Consecutive failed attempts and unexpected disconnects since the
    /// last successful connection.
    pub failures: u32,
    /// Token of the monitored connection, if any.
    pub monitor: Option<MonitorToken>,
}

impl Status {
    fn initial() -> Self {
        Self {
            state: LinkState::Disconnected,
            backoff: BackoffState::Idle,
            failures: 0,
            monitor: None,
        }
    }
}

pub(crate) enum Command<Ch> {
    OpenChannel { reply: oneshot::Sender<Result<Ch>> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Caller-side handle to a running [`ConnectionManager`].
///
/// Dropping every handle shuts the manager down.
pub struct ManagerHandle<Ch> {
    commands: mpsc::Sender<Command<Ch>>,
    status: watch::Receiver<Status>,
}

impl<Ch> Clone for ManagerHandle<Ch> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
        }
    }
}

impl<Ch: Send + 'static> ManagerHandle<Ch> {
    /// Opens a channel on the current connection.
    ///
    /// Fails immediately with [`Error::NotConnected`] while disconnected;
    /// never waits for a future connection. `timeout` bounds how long the
    /// caller waits for the broker's answer.
    pub async fn open_channel(&self, timeout: Duration) -> Result<Ch> {
        let (reply, rx) = oneshot::channel();
        let request = async {
            self.commands
                .send(Command::OpenChannel { reply })
                .await
                .map_err(|_| Error::Stopped)?;
            rx.await.map_err(|_| Error::Stopped)?
        };
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Stops the manager, closing the held connection if any.
    /// Returns once the connection is confirmed closed. Never fails.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Receives a new [`Status`] after every transition.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == LinkState::Connected
    }
}
