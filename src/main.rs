use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use brokerlink::broker::TcpBroker;
use brokerlink::config::Config;
use brokerlink::{ConnectionManager, Error, LinkState};

fn print_help() {
    println!(
        "\
brokerlink v{}

Keeps a connection to a message broker open, reconnecting with
exponential backoff whenever it fails or drops.

USAGE:
    brokerlink [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/brokerlink.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG           Log level filter for tracing
                       (e.g. debug, brokerlink=debug,warn)
    BROKER_PASSWORD    Broker password, if the config references it
                       (used by authenticating clients; the TCP
                       transport does not send it)

EXAMPLES:
    brokerlink                               # uses config/brokerlink.toml
    brokerlink /etc/brokerlink/broker.toml   # custom config path
    RUST_LOG=debug brokerlink                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("brokerlink v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("brokerlink=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/brokerlink.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    let policy = config.backoff.policy()?;

    info!("Broker: {}", config.broker.endpoint_description());
    info!(
        "Backoff: {}ms → {}ms",
        policy.min().as_millis(),
        policy.max().as_millis()
    );

    let manager = ConnectionManager::start(TcpBroker::new(), config.broker.clone(), policy);
    let channel_timeout = config.manager.channel_timeout();

    let mut probe = config.manager.probe_interval().map(|every| {
        info!("Probing the connection every {}s", every.as_secs());
        tokio::time::interval(every)
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = tick(&mut probe) => {
                let result = tokio::select! {
                    result = manager.open_channel(channel_timeout) => result,
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received during probe");
                        break;
                    }
                };
                match result {
                    Ok(channel) => info!("Probe: opened channel {}", channel.id),
                    Err(Error::NotConnected) => {
                        let status = manager.status();
                        warn!(
                            "Probe: not connected ({} consecutive failures)",
                            status.failures
                        );
                    }
                    Err(e) => warn!("Probe failed: {e}"),
                }
            }
        }
    }

    // Bound the graceful close ourselves; the manager waits for the broker
    if tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
        .await
        .is_err()
    {
        warn!("Timed out waiting for the broker connection to close");
    }
    if manager.status().state == LinkState::Stopped {
        info!("Disconnected cleanly");
    }
    Ok(())
}

/// Waits for the next probe tick, or forever when probing is disabled.
async fn tick(probe: &mut Option<tokio::time::Interval>) {
    match probe {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
