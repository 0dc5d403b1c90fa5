use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use vbucket_client::{
    Client, StoreMode, StoreOptions,
    cli::{Cli, Command, ConnectArgs},
    sim::{SimCluster, SimClusterConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Sim(args) => {
            let cluster = SimCluster::start(SimClusterConfig {
                nodes: args.nodes,
                partitions: args.partitions,
                bucket: args.bucket,
                password: args.password,
                ..SimClusterConfig::default()
            })
            .await?;
            info!("admin endpoint at {}", cluster.admin_url());
            println!("{}", cluster.admin_url());

            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            cluster.shutdown().await?;
        }
        Command::Get(args) => {
            let client = connect(&args.connect).await?;
            let found = client.get(&args.key).await;
            client.shutdown().await;
            let found = found.with_context(|| format!("get {}", args.key))?;
            println!("{}", String::from_utf8_lossy(&found.value));
            info!(cas = found.cas, flags = found.flags, "fetched");
        }
        Command::Set(args) => {
            let client = connect(&args.connect).await?;
            let options = StoreOptions {
                flags: args.flags,
                expiry: (args.expiry > 0).then(|| Duration::from_secs(args.expiry)),
                cas: None,
            };
            let stored = client
                .store(StoreMode::Set, &args.key, args.value, options)
                .await;
            client.shutdown().await;
            let stored = stored.with_context(|| format!("set {}", args.key))?;
            println!("cas {}", stored.cas);
        }
        Command::Delete(args) => {
            let client = connect(&args.connect).await?;
            let deleted = client.delete(&args.key).await;
            client.shutdown().await;
            deleted.with_context(|| format!("delete {}", args.key))?;
        }
        Command::Incr(args) => {
            let client = connect(&args.connect).await?;
            let counted = client.incr(&args.key, args.delta, args.initial).await;
            client.shutdown().await;
            let counted = counted.with_context(|| format!("incr {}", args.key))?;
            println!("{}", counted.value);
        }
        Command::Decr(args) => {
            let client = connect(&args.connect).await?;
            let counted = client.decr(&args.key, args.delta, args.initial).await;
            client.shutdown().await;
            let counted = counted.with_context(|| format!("decr {}", args.key))?;
            println!("{}", counted.value);
        }
        Command::Flush(args) => {
            let client = connect(&args).await?;
            let flushed = client.flush().await;
            client.shutdown().await;
            flushed.context("flush")?;
        }
    }

    Ok(())
}

async fn connect(args: &ConnectArgs) -> Result<Client> {
    let config = args.client_config()?;
    Client::connect(config)
        .await
        .with_context(|| format!("connect to {}", args.url))
}
