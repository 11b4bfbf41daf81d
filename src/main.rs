use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use registry_store::EtcdStorage;
use registry_store::KeeperExit;
use registry_store::LeaseKeeper;
use registry_store::Result;
use registry_store::Storage;
use registry_store::StorageConfig;
use serde::Serialize;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Inspect and drive a registry key space")]
struct Cli {
    /// Extra configuration file layered over `CONFIG_PATH` and defaults
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the subtree rooted at KEY
    Get { key: String },
    /// Write a leased leaf
    Set { key: String, value: String },
    /// Refresh an existing leaf
    Update { key: String, value: String },
    /// Remove KEY and everything beneath it
    Delete { key: String },
    /// Stream changes under KEY until interrupted
    Watch {
        key: String,
        /// Last index already seen; 0 starts from now
        #[arg(long, default_value_t = 0)]
        index: u64,
    },
    /// Register KEY and keep it alive until interrupted, then remove it
    Keep { key: String, value: String },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_observability();
    debug!("Parsed CLI arguments: {cli:?}");

    let mut config = StorageConfig::new()?;
    if let Some(path) = &cli.config {
        config = config.with_override_config(path)?;
    }
    let config = config.validate()?;
    debug!("{:?}", config);

    let storage = Arc::new(EtcdStorage::connect(&config).await?);

    match cli.command {
        Command::Get { key } => print_json(&storage.get(&key).await?),
        Command::Set { key, value } => storage.set(&key, &value).await?,
        Command::Update { key, value } => storage.update(&key, &value).await?,
        Command::Delete { key } => storage.delete(&key).await?,
        Command::Watch { key, index } => {
            let mut watcher = storage.watch(&key, index).await?;
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        watcher.stop();
                        break;
                    }
                    event = watcher.next() => {
                        let Some(event) = event else {
                            if watcher.overflowed() {
                                warn!("fell behind, resume with --index {}", watcher.last_index());
                            } else if watcher.failed() {
                                warn!("watch failed, resume with --index {}", watcher.last_index());
                            }
                            break;
                        };
                        print_json(&event);
                    }
                }
            }
        }
        Command::Keep { key, value } => {
            let mut keeper = LeaseKeeper::register(storage.clone(), &key, value, &config.lease).await?;
            info!("Registered {key}. Waiting for CTRL+C signal...");

            tokio::select! {
                _ = shutdown_signal() => {
                    keeper.shutdown().await;
                    storage.delete(&key).await?;
                    info!("Deregistered {key}");
                }
                exit = keeper.wait() => {
                    if exit != KeeperExit::Stopped {
                        warn!("Registration of {key} lost: {exit:?}");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            warn!("SIGTERM handler not installed: {}", e);
            None
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
        _ = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {
            info!("SIGTERM detected.");
        },
    }
}

fn print_json<T: Serialize + std::fmt::Debug>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{value:?}"),
    }
}

fn init_observability() {
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();
}
