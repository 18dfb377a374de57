use std::str::FromStr;
use std::time::Duration;

use crate::domain::{Error, LoadTarget};

pub const DEFAULT_MAX_ERRORS: i64 = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_DATABASE_PORT: u16 = 21212;
pub const DEFAULT_QUEUE_HOST: &str = "localhost";
pub const DEFAULT_PREFETCH: u16 = 1;
/// Upper bound on the final drain. Effectively unlimited; pick something
/// shorter for production deployments.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);
pub const DEFAULT_ROW_CHANNEL_CAPACITY: usize = 16;

pub const EXCHANGE_TYPES: [&str; 4] = ["direct", "topic", "headers", "fanout"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAndPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostAndPort {
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl FromStr for HostAndPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("Bad host specifier: {s}"))?;
                (host, Some(port))
            }
            None => (s, None),
        };
        if host.is_empty() || host.contains(':') {
            return Err(format!("Bad host specifier: {s}"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl core::fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// What the parser does with a line it cannot tokenize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseErrorPolicy {
    /// Stop reading and report a graceful end of input.
    #[default]
    End,
    /// Log the failure and continue with the next line.
    Skip,
    /// Surface the failure and abort the pipeline.
    Fail,
}

impl FromStr for ParseErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "end" => Ok(Self::End),
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(format!("Invalid parse error policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub host: HostAndPort,
    pub amqp_uri: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub exchange_type: Option<String>,
    pub bindings: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub durable: bool,
    pub prefetch: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: HostAndPort {
                host: DEFAULT_QUEUE_HOST.to_string(),
                port: None,
            },
            amqp_uri: None,
            queue: None,
            exchange: None,
            exchange_type: None,
            bindings: Vec::new(),
            user: None,
            password: None,
            vhost: None,
            durable: false,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl QueueConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Name of the queue to consume from. An exchange-only setup consumes from
    /// a queue named after the exchange.
    pub fn queue_name(&self) -> &str {
        self.queue
            .as_deref()
            .or(self.exchange.as_deref())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.exchange.is_none() && self.queue.is_none() && self.amqp_uri.is_none() {
            return Err(Error::Config(
                "One of these options must be specified: --exchange, --queue, or --amqp".into(),
            ));
        }
        for (name, value) in [
            ("Queue name", &self.queue),
            ("Exchange name", &self.exchange),
            ("User name", &self.user),
            ("Virtual host name", &self.vhost),
            ("AMQP URI", &self.amqp_uri),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(Error::Config(format!("{name} is empty.")));
            }
        }
        if let Some(kind) = &self.exchange_type {
            if !EXCHANGE_TYPES.contains(&kind.as_str()) {
                return Err(Error::Config(format!("Invalid exchange type: {kind}")));
            }
        }
        if self.prefetch == 0 {
            return Err(Error::Config("Prefetch count must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub servers: Vec<HostAndPort>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            servers: vec![HostAndPort {
                host: "localhost".to_string(),
                port: None,
            }],
            port: DEFAULT_DATABASE_PORT,
            user: None,
            password: None,
        }
    }
}

impl DatabaseConfig {
    /// Server list with the default port filled in where none was given.
    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.servers
            .iter()
            .map(|server| (server.host.clone(), server.port_or(self.port)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub target: LoadTarget,
    /// Tolerated row failures. Zero or negative never trips.
    pub max_errors: i64,
    pub flush_interval: Duration,
    /// Only meaningful when loading into a table.
    pub batch_size: usize,
    pub parse_errors: ParseErrorPolicy,
    /// Reject rows whose field count differs from the first row.
    pub strict_columns: bool,
    pub drain_timeout: Duration,
    pub row_channel_capacity: usize,
}

impl LoaderConfig {
    pub fn new(queue: QueueConfig, target: LoadTarget) -> Self {
        Self {
            queue,
            database: DatabaseConfig::default(),
            target,
            max_errors: DEFAULT_MAX_ERRORS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            parse_errors: ParseErrorPolicy::default(),
            strict_columns: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            row_channel_capacity: DEFAULT_ROW_CHANNEL_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.queue.validate()?;

        if self.target.name().trim().is_empty() {
            return Err(Error::Config(format!(
                "The {} name must not be empty",
                self.target.kind()
            )));
        }
        if self.target.is_batched() && self.batch_size == 0 {
            return Err(Error::Config("Batch size must be > 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("Periodic flush interval must be > 0".into()));
        }
        if self.database.servers.is_empty() {
            return Err(Error::Config("At least one database server is required".into()));
        }
        if self.row_channel_capacity == 0 {
            return Err(Error::Config("Row channel capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_config() -> LoaderConfig {
        LoaderConfig::new(QueueConfig::for_queue("rows"), LoadTarget::Table("T".into()))
    }

    #[test]
    fn host_specifiers_parse_with_and_without_port() {
        let hp: HostAndPort = "mq.local:5673".parse().unwrap();
        assert_eq!(hp.host, "mq.local");
        assert_eq!(hp.port, Some(5673));

        let hp: HostAndPort = "mq.local".parse().unwrap();
        assert_eq!(hp.port, None);
        assert_eq!(hp.port_or(5672), 5672);

        assert!("mq.local:port".parse::<HostAndPort>().is_err());
        assert!(":5672".parse::<HostAndPort>().is_err());
    }

    #[test]
    fn defaults_validate() {
        let config = table_config();
        assert_eq!(config.max_errors, 100);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_flush_interval_and_batch() {
        let mut config = table_config();
        config.flush_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = table_config();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        // batch size is ignored for procedures
        let mut config = LoaderConfig::new(
            QueueConfig::for_queue("rows"),
            LoadTarget::Procedure("Insert".into()),
        );
        config.batch_size = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn queue_requires_a_source_and_known_exchange_type() {
        let queue = QueueConfig::default();
        assert!(queue.validate().is_err());

        let mut queue = QueueConfig::for_queue("rows");
        queue.exchange = Some("events".into());
        queue.exchange_type = Some("fanout".into());
        assert!(queue.validate().is_ok());

        queue.exchange_type = Some("broadcast".into());
        assert!(queue.validate().is_err());

        let mut queue = QueueConfig::for_queue("rows");
        queue.vhost = Some(" ".into());
        assert!(queue.validate().is_err());
    }

    #[test]
    fn database_endpoints_fill_in_default_port() {
        let database = DatabaseConfig {
            servers: vec!["a".parse().unwrap(), "b:3000".parse().unwrap()],
            ..DatabaseConfig::default()
        };
        assert_eq!(
            database.endpoints(),
            vec![("a".to_string(), 21212), ("b".to_string(), 3000)]
        );
    }

    #[test]
    fn parse_error_policy_from_str() {
        assert_eq!("SKIP".parse::<ParseErrorPolicy>(), Ok(ParseErrorPolicy::Skip));
        assert!("ignore".parse::<ParseErrorPolicy>().is_err());
    }
}
