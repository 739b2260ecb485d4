use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Command, LinkState, ManagerHandle, MonitorToken, Status, COMMAND_QUEUE};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::broker::{BrokerClient, DisconnectReason};
use crate::error::{Error, Result};

/// Internal events, produced by tasks the actor spawned.
pub(super) enum Event<C> {
    /// A retry timer fired. Only the latest generation is honoured.
    AttemptDue { generation: u64 },
    /// The in-flight connect attempt finished.
    AttemptFinished(anyhow::Result<C>),
    /// A monitored connection terminated.
    ConnectionLost {
        token: MonitorToken,
        reason: DisconnectReason,
    },
}

enum Link<C> {
    Disconnected,
    Connected {
        connection: Arc<C>,
        token: MonitorToken,
        /// Resolves with the termination reason once the connection is gone.
        monitor: JoinHandle<DisconnectReason>,
    },
}

/// The connection manager actor.
///
/// Owns the connection and all lifecycle state; runs on its own task and
/// is only reachable through a [`ManagerHandle`].
pub struct ConnectionManager<B: BrokerClient> {
    client: Arc<B>,
    options: Arc<B::Options>,
    backoff: Backoff,
    link: Link<B::Connection>,
    /// In-flight connect task; at most one at a time.
    attempt: Option<JoinHandle<()>>,
    /// Pending retry timer.
    retry: Option<JoinHandle<()>>,
    generation: u64,
    next_token: u64,
    failures: u32,
    events: mpsc::UnboundedSender<Event<B::Connection>>,
    status: watch::Sender<Status>,
}

impl<B: BrokerClient> ConnectionManager<B> {
    /// Spawns the manager and immediately starts connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        client: B,
        options: B::Options,
        policy: BackoffPolicy,
    ) -> ManagerHandle<B::Channel> {
        let (manager, events_rx, status_rx) = Self::new(client, options, policy);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(manager.run(commands_rx, events_rx));
        ManagerHandle {
            commands: commands_tx,
            status: status_rx,
        }
    }

    fn new(
        client: B,
        options: B::Options,
        policy: BackoffPolicy,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Event<B::Connection>>,
        watch::Receiver<Status>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::initial());
        let manager = Self {
            client: Arc::new(client),
            options: Arc::new(options),
            backoff: Backoff::new(policy),
            link: Link::Disconnected,
            attempt: None,
            retry: None,
            generation: 0,
            next_token: 0,
            failures: 0,
            events: events_tx,
            status: status_tx,
        };
        (manager, events_rx, status_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<B::Channel>>,
        mut events: mpsc::UnboundedReceiver<Event<B::Connection>>,
    ) {
        info!("Connection manager started");
        self.begin_attempt();

        let done = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(Command::OpenChannel { reply }) => self.open_channel(reply),
                    Some(Command::Shutdown { done }) => break Some(done),
                    None => {
                        debug!("All manager handles dropped");
                        break None;
                    }
                },
            }
        };

        self.shutdown(&mut events).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn handle_event(&mut self, event: Event<B::Connection>) {
        match event {
            Event::AttemptDue { generation } => self.on_attempt_due(generation),
            Event::AttemptFinished(result) => self.on_attempt_finished(result),
            Event::ConnectionLost { token, reason } => self.on_connection_lost(token, reason),
        }
        self.publish();
    }

    fn on_attempt_due(&mut self, generation: u64) {
        if generation != self.generation {
            debug!("Ignoring stale retry timer (generation {generation})");
            return;
        }
        self.retry = None;
        if matches!(self.link, Link::Connected { .. }) || self.attempt.is_some() {
            debug!("Ignoring retry timer, connection already in progress or established");
            return;
        }
        self.begin_attempt();
    }

    /// Runs `connect` on its own task; the result comes back as an event.
    fn begin_attempt(&mut self) {
        info!(
            "Connecting to broker (attempt {})...",
            self.backoff.attempt + 1
        );
        let client = self.client.clone();
        let options = self.options.clone();
        let events = self.events.clone();
        self.attempt = Some(tokio::spawn(async move {
            let result = client.connect(&options).await;
            let _ = events.send(Event::AttemptFinished(result));
        }));
    }

    fn on_attempt_finished(&mut self, result: anyhow::Result<B::Connection>) {
        self.attempt = None;
        match result {
            Ok(connection) => self.on_connected(connection),
            Err(e) => {
                warn!("Connection attempt failed: {e:#}");
                self.failures = self.failures.saturating_add(1);
                self.schedule_retry();
            }
        }
    }

    fn on_connected(&mut self, connection: B::Connection) {
        // Attempts are only issued while disconnected
        debug_assert!(matches!(self.link, Link::Disconnected));
        let connection = Arc::new(connection);
        self.next_token += 1;
        let token = MonitorToken(self.next_token);
        let monitor = self.spawn_monitor(connection.clone(), token);
        self.link = Link::Connected {
            connection,
            token,
            monitor,
        };
        self.backoff.reset();
        self.failures = 0;
        info!("Connected to broker, backoff reset");
    }

    fn spawn_monitor(
        &self,
        connection: Arc<B::Connection>,
        token: MonitorToken,
    ) -> JoinHandle<DisconnectReason> {
        let client = self.client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let reason = client.closed(&connection).await;
            let _ = events.send(Event::ConnectionLost {
                token,
                reason: reason.clone(),
            });
            reason
        })
    }

    fn on_connection_lost(&mut self, token: MonitorToken, reason: DisconnectReason) {
        match &self.link {
            Link::Connected { token: current, .. } if *current == token => {}
            _ => {
                debug!("Ignoring stale monitor notification for {token:?} ({reason})");
                return;
            }
        }
        self.link = Link::Disconnected;
        warn!("Connection to broker lost: {reason}");
        self.failures = self.failures.saturating_add(1);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let delay = match self.backoff.next_delay() {
            Some(delay) => {
                info!("Reconnecting in {}ms...", delay.as_millis());
                delay
            }
            None => {
                info!("Backoff range exhausted, reconnecting now and restarting the ramp");
                Duration::ZERO
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        if let Some(previous) = self.retry.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::AttemptDue { generation });
        })) {
            previous.abort();
        }
    }

    /// Never blocks the loop: the open runs on its own task and answers
    /// the caller directly.
    fn open_channel(&self, reply: oneshot::Sender<Result<B::Channel>>) {
        let connection = match &self.link {
            Link::Connected { connection, .. } => connection.clone(),
            Link::Disconnected => {
                let _ = reply.send(Err(Error::NotConnected));
                return;
            }
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client.open_channel(&connection).await.map_err(Error::Channel);
            let _ = reply.send(result);
        });
    }

    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<Event<B::Connection>>) {
        info!("Connection manager shutting down");

        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(attempt) = self.attempt.take() {
            debug!("Cancelling in-flight connection attempt");
            attempt.abort();
            let _ = attempt.await;
        }

        if let Link::Connected {
            connection,
            monitor,
            ..
        } = std::mem::replace(&mut self.link, Link::Disconnected)
        {
            self.close(connection, monitor).await;
        }

        // An attempt may have completed just before it was cancelled
        events.close();
        while let Ok(event) = events.try_recv() {
            if let Event::AttemptFinished(Ok(connection)) = event {
                let connection = Arc::new(connection);
                let monitor = self.spawn_monitor(connection.clone(), MonitorToken(0));
                self.close(connection, monitor).await;
            }
        }

        self.status.send_replace(Status {
            state: LinkState::Stopped,
            backoff: self.backoff.state(),
            failures: self.failures,
            monitor: None,
        });
        info!("Connection manager stopped");
    }

    /// Closes the connection and waits for its monitor to confirm.
    /// A failed close cancels the monitor instead.
    async fn close(&self, connection: Arc<B::Connection>, monitor: JoinHandle<DisconnectReason>) {
        match self.client.close(&connection).await {
            Ok(()) => match monitor.await {
                Ok(reason) => info!("Connection to broker {reason}"),
                Err(e) => warn!("Connection monitor failed: {e}"),
            },
            Err(e) => {
                warn!("Failed to close connection: {e:#}");
                monitor.abort();
                let _ = monitor.await;
            }
        }
    }

    fn publish(&self) {
        let (state, monitor) = match &self.link {
            Link::Disconnected => (LinkState::Disconnected, None),
            Link::Connected { token, .. } => (LinkState::Connected, Some(*token)),
        };
        self.status.send_replace(Status {
            state,
            backoff: self.backoff.state(),
            failures: self.failures,
            monitor,
        });
    }
}
