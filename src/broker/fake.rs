//! In-memory `BrokerClient` used by the manager tests.
//!
//! Clones share state, so a test keeps one handle to flip reachability,
//! kill connections and inspect counters after giving the other to the
//! manager.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::watch;

use super::{BrokerClient, DisconnectReason};

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    reachable: AtomicBool,
    hang_connect: AtomicBool,
    fail_close: AtomicBool,
    channel_delay_ms: AtomicU64,
    attempts: AtomicUsize,
    closes: AtomicUsize,
    watchers: AtomicUsize,
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<watch::Sender<Option<DisconnectReason>>>>>,
}

pub(crate) struct FakeConnection {
    pub id: u64,
    state: Arc<watch::Sender<Option<DisconnectReason>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeChannel {
    pub connection: u64,
}

/// Decrements the watcher count even when the monitor task is aborted.
struct WatchGuard<'a>(&'a AtomicUsize);

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBroker {
    pub fn reachable() -> Self {
        let broker = Self::default();
        broker.set_reachable(true);
        broker
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Connect attempts never complete.
    pub fn hang_connect(&self) {
        self.shared.hang_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.shared.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn set_channel_delay(&self, delay: Duration) {
        self.shared
            .channel_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Terminates every live connection as if the broker dropped it.
    pub fn kill_connections(&self) {
        let connections = self.shared.connections.lock().unwrap();
        for state in connections.iter() {
            state.send_if_modified(|s| {
                if s.is_none() {
                    *s = Some(DisconnectReason::PeerClosed);
                    true
                } else {
                    false
                }
            });
        }
    }

    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Number of `closed()` futures currently waiting.
    pub fn watchers(&self) -> usize {
        self.shared.watchers.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        let connections = self.shared.connections.lock().unwrap();
        connections.iter().filter(|s| s.borrow().is_none()).count()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    type Options = String;
    type Connection = FakeConnection;
    type Channel = FakeChannel;

    async fn connect(&self, _options: &String) -> Result<FakeConnection> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.shared.reachable.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (state, _) = watch::channel(None);
        let state = Arc::new(state);
        self.shared.connections.lock().unwrap().push(state.clone());
        Ok(FakeConnection { id, state })
    }

    async fn open_channel(&self, connection: &FakeConnection) -> Result<FakeChannel> {
        let delay = self.shared.channel_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if connection.state.borrow().is_some() {
            bail!("connection {} is closed", connection.id);
        }
        Ok(FakeChannel {
            connection: connection.id,
        })
    }

    async fn close(&self, connection: &FakeConnection) -> Result<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_close.load(Ordering::SeqCst) {
            bail!("close-ok never arrived");
        }
        connection.state.send_if_modified(|s| {
            if s.is_none() {
                *s = Some(DisconnectReason::Closed);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn closed(&self, connection: &FakeConnection) -> DisconnectReason {
        self.shared.watchers.fetch_add(1, Ordering::SeqCst);
        let _guard = WatchGuard(&self.shared.watchers);
        let mut rx = connection.state.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| DisconnectReason::Error("state dropped".into()))
    }
}
