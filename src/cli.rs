use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_DATABASE_PORT, DEFAULT_MAX_ERRORS, DatabaseConfig, HostAndPort,
    LoaderConfig, ParseErrorPolicy, QueueConfig,
};
use crate::domain::{Error, LoadTarget};

/// Loads CSV rows from a RabbitMQ queue into a table or a stored procedure.
#[derive(Debug, Parser)]
#[command(name = "rmq_bulk_loader", version)]
pub struct Cli {
    /// RabbitMQ host[:port]
    #[arg(long, default_value = "localhost")]
    pub host: HostAndPort,

    /// AMQP URI, overrides --host and the credentials
    #[arg(long, env = "RMQ_LOADER_AMQP_URI")]
    pub amqp: Option<String>,

    /// RabbitMQ queue name
    #[arg(long)]
    pub queue: Option<String>,

    /// RabbitMQ exchange name
    #[arg(long)]
    pub exchange: Option<String>,

    /// RabbitMQ exchange type: direct/topic/headers/fanout
    #[arg(long)]
    pub extype: Option<String>,

    /// Comma-separated RabbitMQ binding keys
    #[arg(long, value_delimiter = ',')]
    pub mqbinding: Vec<String>,

    /// RabbitMQ user
    #[arg(long)]
    pub mquser: Option<String>,

    /// RabbitMQ password
    #[arg(long, env = "RMQ_LOADER_MQ_PASSWORD", hide_env_values = true)]
    pub mqpassword: Option<String>,

    /// RabbitMQ virtual host
    #[arg(long)]
    pub vhost: Option<String>,

    /// Declare the queue as durable
    #[arg(long)]
    pub durable: bool,

    /// Comma-separated database server(s)
    #[arg(short, long, value_delimiter = ',', default_value = "localhost")]
    pub servers: Vec<HostAndPort>,

    /// Database port for servers listed without one
    #[arg(long, default_value_t = DEFAULT_DATABASE_PORT)]
    pub port: u16,

    /// Database user
    #[arg(long)]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "RMQ_LOADER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Insert the data into this table
    #[arg(required_unless_present = "procedure", conflicts_with = "procedure")]
    pub table: Option<String>,

    /// Insert the data using this procedure
    #[arg(short, long)]
    pub procedure: Option<String>,

    /// Maximum number of errors before giving up (0 or less: unlimited)
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_ERRORS, allow_negative_numbers = true)]
    pub maxerrors: i64,

    /// Periodic flush interval in seconds
    #[arg(short, long, default_value_t = 10)]
    pub flush: u64,

    /// Batch size for table inserts
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch: usize,

    /// What to do with unparseable input: end, skip or fail
    #[arg(long, default_value = "end")]
    pub parse_errors: ParseErrorPolicy,

    /// Treat rows with a different column count as parse errors
    #[arg(long)]
    pub strict_columns: bool,

    /// Seconds to wait for outstanding rows on shutdown
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Replay messages from a file (one per line, `-` for stdin) instead of a broker
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Append rejected rows to this CSV file
    #[arg(long)]
    pub rejected: Option<PathBuf>,

    /// Fallback log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn loader_config(&self) -> Result<LoaderConfig, Error> {
        let target = match (&self.table, &self.procedure) {
            (Some(table), None) => LoadTarget::Table(table.trim().to_string()),
            (None, Some(procedure)) => LoadTarget::Procedure(procedure.trim().to_string()),
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "Either a procedure name or a table name is required, but not both".into(),
                ));
            }
            (None, None) => {
                return Err(Error::Config(
                    "Either a procedure name or a table name is required".into(),
                ));
            }
        };

        let queue = QueueConfig {
            host: self.host.clone(),
            amqp_uri: self.amqp.clone(),
            queue: self.queue.clone(),
            exchange: self.exchange.clone(),
            exchange_type: self.extype.as_ref().map(|t| t.trim().to_ascii_lowercase()),
            bindings: self.mqbinding.clone(),
            user: self.mquser.clone(),
            password: self.mqpassword.clone(),
            vhost: self.vhost.clone(),
            durable: self.durable,
            ..QueueConfig::default()
        };

        let database = DatabaseConfig {
            servers: self.servers.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
        };

        let mut config = LoaderConfig::new(queue, target);
        config.database = database;
        config.max_errors = self.maxerrors;
        config.flush_interval = Duration::from_secs(self.flush);
        config.batch_size = self.batch;
        config.parse_errors = self.parse_errors;
        config.strict_columns = self.strict_columns;
        if let Some(secs) = self.drain_timeout {
            config.drain_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("rmq_bulk_loader").chain(args.iter().copied()))
    }

    #[test]
    fn table_load_with_defaults() {
        let cli = parse(&["--queue", "rows", "--servers", "a,b:3000", "Orders"]).unwrap();
        let config = cli.loader_config().unwrap();

        assert_eq!(config.target, LoadTarget::Table("Orders".into()));
        assert_eq!(config.queue.queue.as_deref(), Some("rows"));
        assert_eq!(config.max_errors, 100);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(
            config.database.endpoints(),
            vec![("a".to_string(), 21212), ("b".to_string(), 3000)]
        );
    }

    #[test]
    fn procedure_load_with_exchange_bindings() {
        let cli = parse(&[
            "--exchange",
            "events",
            "--extype",
            "Topic",
            "--mqbinding",
            "a.*,b.#",
            "-p",
            "InsertOrder",
            "-m",
            "-1",
            "-f",
            "3",
        ])
        .unwrap();
        let config = cli.loader_config().unwrap();

        assert_eq!(config.target, LoadTarget::Procedure("InsertOrder".into()));
        assert_eq!(config.queue.exchange_type.as_deref(), Some("topic"));
        assert_eq!(config.queue.bindings, vec!["a.*", "b.#"]);
        assert_eq!(config.queue.queue_name(), "events");
        assert_eq!(config.max_errors, -1);
        assert_eq!(config.flush_interval, Duration::from_secs(3));
    }

    #[test]
    fn table_and_procedure_are_mutually_exclusive() {
        assert!(parse(&["--queue", "q", "-p", "Proc", "Table"]).is_err());
        assert!(parse(&["--queue", "q"]).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cli = parse(&["--queue", "q", "--flush", "0", "T"]).unwrap();
        assert!(matches!(cli.loader_config(), Err(Error::Config(_))));

        let cli = parse(&["T"]).unwrap();
        assert!(cli.loader_config().is_err());

        assert!(parse(&["--queue", "q", "--host", "mq:notaport", "T"]).is_err());
        assert!(parse(&["--queue", "q", "--parse-errors", "ignore", "T"]).is_err());
    }
}
