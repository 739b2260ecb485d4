/// TCP (optionally TLS) transport for the connection manager.
///
/// Establishes the socket, keeps a background task reading from it so
/// that a peer close or transport error is noticed, and allocates channel
/// numbers on the connection. No broker protocol is spoken here.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio_native_tls::TlsConnector;
use tracing::{debug, info, warn};

use super::{BrokerClient, DisconnectReason};
use crate::config::BrokerConfig;

trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBroker;

pub struct TcpConnection {
    addr: String,
    virtual_host: String,
    channel_max: u16,
    next_channel: AtomicU32,
    close: Arc<Notify>,
    state: watch::Receiver<Option<DisconnectReason>>,
}

/// A channel number allocated on a `TcpConnection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpChannel {
    pub id: u16,
    pub virtual_host: String,
}

impl TcpBroker {
    pub fn new() -> Self {
        Self
    }
}

impl TcpConnection {
    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }
}

#[async_trait]
impl BrokerClient for TcpBroker {
    type Options = BrokerConfig;
    type Connection = TcpConnection;
    type Channel = TcpChannel;

    async fn connect(&self, options: &BrokerConfig) -> Result<TcpConnection> {
        let addr = format!("{}:{}", options.host, options.port);
        let timeout = options.connect_timeout();
        debug!("Opening TCP connection to {addr}...");

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("TCP connect to {addr} timed out after {timeout:?}"))?
            .with_context(|| format!("TCP connect to {addr}"))?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn BrokerStream> = match options.tls.as_ref().filter(|t| t.enabled) {
            Some(tls) => {
                let domain = tls.server_name.as_deref().unwrap_or(&options.host);
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(!tls.verify)
                    .build()?;
                let connector = TlsConnector::from(connector);
                let tls_stream = tokio::time::timeout(timeout, connector.connect(domain, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with {addr} timed out"))?
                    .with_context(|| format!("TLS handshake with {addr}"))?;
                debug!("TLS established with {domain}");
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let (state_tx, state_rx) = watch::channel(None);
        let close = Arc::new(Notify::new());
        tokio::spawn(watch_stream(stream, addr.clone(), close.clone(), state_tx));

        info!("Connected to {}", options.endpoint_description());

        Ok(TcpConnection {
            addr,
            virtual_host: options.virtual_host.clone(),
            channel_max: options.channel_max,
            next_channel: AtomicU32::new(1),
            close,
            state: state_rx,
        })
    }

    async fn open_channel(&self, connection: &TcpConnection) -> Result<TcpChannel> {
        if connection.is_closed() {
            bail!("connection to {} is closed", connection.addr);
        }
        let id = connection.next_channel.fetch_add(1, Ordering::Relaxed);
        if id > u32::from(connection.channel_max) {
            bail!(
                "channel limit ({}) reached on {}",
                connection.channel_max,
                connection.addr
            );
        }
        Ok(TcpChannel {
            id: id as u16,
            virtual_host: connection.virtual_host.clone(),
        })
    }

    async fn close(&self, connection: &TcpConnection) -> Result<()> {
        if !connection.is_closed() {
            connection.close.notify_one();
        }
        Ok(())
    }

    async fn closed(&self, connection: &TcpConnection) -> DisconnectReason {
        let mut state = connection.state.clone();
        let reason = match state.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| DisconnectReason::Error("connection watcher exited".into()))
    }
}

/// Owns the stream for its whole life: reads until EOF, error, or a close
/// request, then publishes why it ended.
async fn watch_stream(
    mut stream: Box<dyn BrokerStream>,
    addr: String,
    close: Arc<Notify>,
    state: watch::Sender<Option<DisconnectReason>>,
) {
    let mut buf = vec![0u8; 4096];
    let reason = loop {
        tokio::select! {
            _ = close.notified() => {
                if let Err(e) = stream.shutdown().await {
                    debug!("Shutdown of {addr} failed: {e}");
                }
                break DisconnectReason::Closed;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    warn!("Connection to {addr} closed by peer");
                    break DisconnectReason::PeerClosed;
                }
                Ok(n) => debug!("Discarding {n} unsolicited bytes from {addr}"),
                Err(e) => {
                    warn!("Read error on {addr}: {e}");
                    break DisconnectReason::Error(e.to_string());
                }
            },
        }
    };
    state.send_replace(Some(reason));
}
