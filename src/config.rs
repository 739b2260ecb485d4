use serde::Deserialize;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_username")]
    pub username: String,
    /// Supports ${ENV_VAR} substitution. Carried for protocol clients that
    /// authenticate; the plain TCP transport does not send it.
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Highest channel number handed out on one connection
    #[serde(default = "default_channel_max")]
    pub channel_max: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Set to false for self-signed certs (dev brokers)
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Name checked against the certificate; defaults to `host`
    pub server_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// How long callers wait for a channel before giving up
    #[serde(default = "default_channel_timeout_ms")]
    pub channel_timeout_ms: u64,
    /// When set, the binary opens a channel at this interval to probe the link
    pub probe_interval_secs: Option<u64>,
}

fn default_port() -> u16 {
    5672
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_channel_max() -> u16 {
    2047
}

fn default_true() -> bool {
    true
}

fn default_backoff_min_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_channel_timeout_ms() -> u64 {
    5000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: default_backoff_min_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            channel_timeout_ms: default_channel_timeout_ms(),
            probe_interval_secs: None,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }

    /// Human-readable endpoint, never includes the password
    pub fn endpoint_description(&self) -> String {
        let scheme = if self.tls_enabled() { "amqps" } else { "amqp" };
        format!(
            "{scheme}://{}@{}:{}{}",
            self.username,
            self.host,
            self.port,
            if self.virtual_host.starts_with('/') {
                self.virtual_host.clone()
            } else {
                format!("/{}", self.virtual_host)
            }
        )
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> Result<BackoffPolicy, crate::Error> {
        BackoffPolicy::new(
            Duration::from_millis(self.min_ms),
            Duration::from_millis(self.max_ms),
        )
    }
}

impl ManagerConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding environment variables like ${BROKER_PASSWORD}.
    /// Backoff bounds are validated here so a bad file fails at startup.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.backoff.policy()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[broker]
host = "localhost"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.virtual_host, "/");
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.broker.password, "guest");
        assert_eq!(config.broker.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.broker.channel_max, 2047);
        assert!(!config.broker.tls_enabled());
        assert_eq!(config.backoff.min_ms, 1000);
        assert_eq!(config.backoff.max_ms, 30_000);
        assert_eq!(config.manager.channel_timeout(), Duration::from_secs(5));
        assert_eq!(config.manager.probe_interval(), None);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[broker]
host = "mq.example.com"
port = 5671
virtual_host = "orders"
username = "svc"
password = "s3cret"
connect_timeout_ms = 2500
channel_max = 16

[broker.tls]
verify = false
server_name = "mq.internal"

[backoff]
min_ms = 100
max_ms = 1000

[manager]
channel_timeout_ms = 750
probe_interval_secs = 10
"#,
        )
        .unwrap();

        assert_eq!(config.broker.port, 5671);
        assert_eq!(config.broker.channel_max, 16);
        let tls = config.broker.tls.as_ref().unwrap();
        assert!(tls.enabled);
        assert!(!tls.verify);
        assert_eq!(tls.server_name.as_deref(), Some("mq.internal"));

        let policy = config.backoff.policy().unwrap();
        assert_eq!(policy.min(), Duration::from_millis(100));
        assert_eq!(policy.max(), Duration::from_millis(1000));
        assert_eq!(config.manager.channel_timeout(), Duration::from_millis(750));
        assert_eq!(config.manager.probe_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let err = Config::parse(
            r#"
[broker]
host = "localhost"

[backoff]
min_ms = 5000
max_ms = 100
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn test_zero_probe_interval_disables_probe() {
        let config = Config::parse(
            r#"
[broker]
host = "localhost"

[manager]
probe_interval_secs = 0
"#,
        )
        .unwrap();
        assert_eq!(config.manager.probe_interval(), None);
    }

    #[test]
    fn test_missing_broker_section_rejected() {
        assert!(Config::parse("[backoff]\nmin_ms = 10\n").is_err());
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("BROKERLINK_TEST_PASSWORD", "from-env");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[broker]\nhost = \"localhost\"\npassword = \"${{BROKERLINK_TEST_PASSWORD}}\"\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker.password, "from-env");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/brokerlink.toml").is_err());
    }

    // ── endpoint_description tests ──────────────────────

    #[test]
    fn test_endpoint_description_plain() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(
            config.broker.endpoint_description(),
            "amqp://guest@localhost:5672/"
        );
    }

    #[test]
    fn test_endpoint_description_tls_hides_password() {
        let config = Config::parse(
            r#"
[broker]
host = "mq.example.com"
port = 5671
virtual_host = "orders"
username = "svc"
password = "hunter2"

[broker.tls]
"#,
        )
        .unwrap();
        let description = config.broker.endpoint_description();
        assert_eq!(description, "amqps://svc@mq.example.com:5671/orders");
        assert!(!description.contains("hunter2"));
    }
}
