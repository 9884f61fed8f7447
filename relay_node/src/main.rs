use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use relay_node::{
    api::{create_router, serve, AppState},
    chains::{load_geo_zone, HostedChains},
    config::NodeConfig,
    onchain::{GenesisDoc, LocalChain},
    protocol::{ChainIo, HandlerMsg, ProtocolHandler, TxCodec},
    registry::RegistryView,
    storage::{MemoryStorage, Storage},
    Engine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Relay Node Arguments
#[derive(Parser)]
#[clap(name = "relay-node")]
#[clap(about = "Servicer node for a decentralized RPC relay network")]
struct Args {
    /// Path to node configuration file (TOML, YAML or JSON)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Overrides `listen_addr`
    #[clap(long)]
    listen: Option<String>,

    /// Overrides `data_dir`
    #[clap(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Starting relay node...");
    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    info!("Data dir: {:?}", config.data_dir);

    let keys = config.servicer_keys()?;

    let chains_path = config.chains_path();
    let chains = if chains_path.exists() {
        HostedChains::load(&chains_path)?
    } else {
        warn!("{} not found, hosting no chains", chains_path.display());
        HostedChains::default()
    };
    let chains = Arc::new(chains);
    let geo_zone = load_geo_zone(config.geozone_path())?;
    info!("Hosting chains {:?} in geo zone {:?}", chains.ids(), geo_zone.as_ref().map(|z| &z.id));

    let genesis_path = config
        .devnet
        .genesis_path
        .clone()
        .unwrap_or_else(|| config.data_dir.join("config").join("genesis.json"));
    let genesis = if genesis_path.exists() {
        GenesisDoc::load(&genesis_path)?
    } else {
        warn!("{} not found, starting from an empty genesis", genesis_path.display());
        GenesisDoc::default()
    };
    let chain = Arc::new(LocalChain::new(
        genesis.into_state(),
        TxCodec::new(config.codec_upgrade_height),
        config.network_id.clone(),
    ));
    info!("Devnet chain initialized at height {}", chain.latest_height());

    let store = open_store(&config)?;
    let engine = Arc::new(Engine::new(
        config.clone(),
        chain.clone() as Arc<dyn RegistryView>,
        chains.clone(),
        geo_zone,
        keys,
        store,
    )?);
    info!("Engine initialized with {} servicers", engine.identities().count());

    let handler = ProtocolHandler::new(engine.clone(), chain.clone() as Arc<dyn ChainIo>)?;
    let recovered = handler.recover()?;
    if recovered > 0 {
        info!("Recovered {} claim records", recovered);
    }
    let handle = handler.spawn()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush_task = engine.spawn_flush_task(shutdown_rx.clone());

    let block_task = {
        let chain = chain.clone();
        let sender = handle.sender();
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_millis(config.devnet.block_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match chain.commit_block() {
                        Ok(height) => {
                            if sender.send(HandlerMsg::BlockCommitted(height)).is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("block commit failed: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    #[cfg(unix)]
    let reload_task = {
        let chains = chains.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .context("installing SIGHUP handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        // errors are logged and the old map is kept
                        let _ = chains.reload(&chains_path);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let router = create_router(AppState::new(engine.clone()));
    serve(listener, router, shutdown_signal()).await?;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = block_task.await;
    let _ = flush_task.await;
    #[cfg(unix)]
    let _ = reload_task.await;
    handle.shutdown().await;
    let flushed = engine.flush_all()?;
    info!("Flushed {} entries, bye", flushed);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
        futures::future::pending::<()>().await;
    }
}

#[cfg(feature = "persistence")]
fn open_store(config: &NodeConfig) -> Result<Arc<dyn Storage>> {
    if config.persistence {
        let path = config.store_path();
        let store = relay_node::storage::RocksDbStorage::open(&path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        info!("Using RocksDB store at {}", path.display());
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(MemoryStorage::new()))
}

#[cfg(not(feature = "persistence"))]
fn open_store(config: &NodeConfig) -> Result<Arc<dyn Storage>> {
    if config.persistence {
        warn!("persistence requested but the node was built without the `persistence` feature");
    }
    Ok(Arc::new(MemoryStorage::new()))
}
