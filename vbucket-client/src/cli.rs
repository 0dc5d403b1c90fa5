use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{config::ClientConfig, error::Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated cluster on loopback until ctrl-c.
    Sim(SimArgs),
    /// Fetch a document and print it.
    Get(KeyArgs),
    /// Store a document.
    Set(SetArgs),
    /// Remove a document.
    Delete(KeyArgs),
    /// Increment a decimal counter.
    Incr(CounterArgs),
    /// Decrement a decimal counter, stopping at zero.
    Decr(CounterArgs),
    /// Remove every document from every node of the bucket.
    Flush(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimArgs {
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,

    #[arg(long, default_value_t = 64)]
    pub partitions: u16,

    #[arg(long, default_value = "default")]
    pub bucket: String,

    #[arg(long, default_value = "")]
    pub password: String,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Administrative endpoint of any cluster node.
    #[arg(long, default_value = "http://127.0.0.1:8091")]
    pub url: String,

    #[arg(long, default_value = "default")]
    pub bucket: String,

    #[arg(long, default_value = "")]
    pub password: String,

    /// JSON client configuration. Flags given on the command line win.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Per-operation timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl ConnectArgs {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json_file(path)?,
            None => ClientConfig::default(),
        };
        config.bootstrap_urls = vec![self.url.clone()];
        config.bucket = self.bucket.clone();
        config.password = self.password.clone();
        // A one-shot command never lives long enough to need polling.
        config.topology_poll_interval = None;
        if let Some(millis) = self.timeout_ms {
            config.operation_timeout = Duration::from_millis(millis);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    pub key: String,

    pub value: String,

    /// Expiry in seconds; 0 keeps the document forever.
    #[arg(long, default_value_t = 0)]
    pub expiry: u64,

    #[arg(long, default_value_t = 0)]
    pub flags: u32,
}

#[derive(Args, Debug, Clone)]
pub struct CounterArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    pub key: String,

    #[arg(long, default_value_t = 1)]
    pub delta: u64,

    /// Create the counter with this value if it does not exist.
    #[arg(long)]
    pub initial: Option<u64>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "vbucket-client",
            "get",
            "--url",
            "http://10.0.0.1:8091",
            "--timeout-ms",
            "750",
            "user::1",
        ]);
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        let config = args.connect.client_config().expect("valid");

        assert_eq!(args.key, "user::1");
        assert_eq!(config.bootstrap_urls, vec!["http://10.0.0.1:8091".to_string()]);
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
        assert_eq!(config.topology_poll_interval, None);
    }
}
