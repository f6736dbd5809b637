//! Dice Round Server
//!
//! Runs the round engine behind the WebSocket front end. Store contents are
//! kept in memory and saved to a snapshot file, if one is configured.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dice_round::{
    engine::{EngineConfig, GameEngine, Stores},
    network::{AuthConfig, GameServer, ServerConfig},
    store::{MemoryLedger, MemoryRoundStore, MemorySettings, StoreSnapshot},
    BETTING_WINDOW_TICKS, TICK_INTERVAL_MS, VERSION,
};

/// How often the snapshot is written while running.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

struct MemoryStores {
    ledger: Arc<MemoryLedger>,
    rounds: Arc<MemoryRoundStore>,
    settings: Arc<MemorySettings>,
}

impl MemoryStores {
    async fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        let restored = match path {
            Some(path) => StoreSnapshot::load(path)
                .await
                .with_context(|| format!("reading snapshot {}", path.display()))?,
            None => None,
        };

        let (ledger, rounds, settings) = match restored {
            Some(snapshot) => {
                info!(
                    saved_at = %snapshot.saved_at,
                    accounts = snapshot.accounts.len(),
                    rounds = snapshot.rounds.len(),
                    "Restored snapshot"
                );
                snapshot.into_stores()
            }
            None => (MemoryLedger::new(), MemoryRoundStore::new(), MemorySettings::default()),
        };

        Ok(Self {
            ledger: Arc::new(ledger),
            rounds: Arc::new(rounds),
            settings: Arc::new(settings),
        })
    }

    fn stores(&self) -> Stores {
        Stores {
            ledger: self.ledger.clone(),
            rounds: self.rounds.clone(),
            settings: self.settings.clone(),
        }
    }

    async fn save(&self, engine: &GameEngine, path: &Path) -> anyhow::Result<()> {
        let snapshot = engine
            .capture_snapshot(&self.ledger, &self.rounds, &self.settings)
            .await;
        snapshot
            .save(path)
            .await
            .with_context(|| format!("writing snapshot {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Dice Round Server v{}", VERSION);
    info!("Tick: {} ms, betting window: {} ticks", TICK_INTERVAL_MS, BETTING_WINDOW_TICKS);

    let server_config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    let auth_config = AuthConfig::from_env();
    if !auth_config.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; every login will be rejected");
    }

    let snapshot_path: Option<PathBuf> = server_config.snapshot_path.clone();
    let stores = Arc::new(MemoryStores::open(snapshot_path.as_deref()).await?);

    let engine = GameEngine::new(engine_config, stores.stores())
        .await
        .context("building engine")?;
    let first_round = engine.start().await.context("starting engine")?;
    info!("First round: {}", first_round);

    let autosave = snapshot_path.clone().map(|path| {
        let stores = stores.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut every = tokio::time::interval(SNAPSHOT_INTERVAL);
            every.tick().await;
            loop {
                every.tick().await;
                if let Err(e) = stores.save(&engine, &path).await {
                    error!("Autosave failed: {:#}", e);
                }
            }
        })
    });

    let server = Arc::new(GameServer::new(server_config, engine.clone(), auth_config));
    let listener = server.bind().await.context("binding listener")?;

    let serving = server.clone();
    let server_task = tokio::spawn(async move { serving.serve(listener).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");

    engine.stop().await;
    server.shutdown();
    if let Some(task) = autosave {
        task.abort();
    }

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    if let Some(path) = snapshot_path {
        stores.save(&engine, &path).await?;
        info!("Snapshot written to {}", path.display());
    }

    Ok(())
}
