//! Settings Store
//!
//! House edge and maintenance flag, plus [`HouseEdgeConfig`]: the live
//! value the engine draws with, backed by the store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::game::dice::{HouseEdge, HouseEdgeError};
use crate::store::StoreError;

/// Settings update failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    /// House edge outside 0..=100.
    #[error(transparent)]
    OutOfRange(#[from] HouseEdgeError),

    /// Storing the new value failed.
    #[error("failed to store setting: {0}")]
    Store(#[from] StoreError),
}

/// Stored admin settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Probability the draw favors the house.
    pub house_edge: HouseEdge,
    /// New bets are refused while set.
    pub maintenance: bool,
}

/// Persistence of admin settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Stored house edge (default when never set).
    async fn house_edge(&self) -> Result<HouseEdge, StoreError>;

    /// Store a new house edge.
    async fn set_house_edge(&self, edge: HouseEdge) -> Result<(), StoreError>;

    /// Whether maintenance mode is on.
    async fn maintenance(&self) -> Result<bool, StoreError>;

    /// Turn maintenance mode on or off.
    async fn set_maintenance(&self, on: bool) -> Result<(), StoreError>;
}

/// In-memory settings.
#[derive(Debug, Default)]
pub struct MemorySettings {
    settings: RwLock<Settings>,
}

impl MemorySettings {
    /// Start from the given values.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Current values, for snapshots.
    pub async fn get(&self) -> Settings {
        *self.settings.read().await
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn house_edge(&self) -> Result<HouseEdge, StoreError> {
        Ok(self.settings.read().await.house_edge)
    }

    async fn set_house_edge(&self, edge: HouseEdge) -> Result<(), StoreError> {
        self.settings.write().await.house_edge = edge;
        Ok(())
    }

    async fn maintenance(&self) -> Result<bool, StoreError> {
        Ok(self.settings.read().await.maintenance)
    }

    async fn set_maintenance(&self, on: bool) -> Result<(), StoreError> {
        self.settings.write().await.maintenance = on;
        Ok(())
    }
}

// =============================================================================
// LIVE HOUSE EDGE
// =============================================================================

/// House edge read once from the store and updated live.
pub struct HouseEdgeConfig {
    current: RwLock<HouseEdge>,
    store: Arc<dyn SettingsStore>,
}

impl HouseEdgeConfig {
    /// Load the stored value.
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Self, StoreError> {
        let edge = store.house_edge().await?;
        Ok(Self {
            current: RwLock::new(edge),
            store,
        })
    }

    /// Current value.
    pub async fn edge(&self) -> HouseEdge {
        *self.current.read().await
    }

    /// Current value as a percentage.
    pub async fn percent(&self) -> f64 {
        self.edge().await.percent()
    }

    /// Validate, store and apply a new percentage.
    ///
    /// The live value only changes once the store accepted it.
    pub async fn set_percent(&self, percent: f64) -> Result<HouseEdge, SettingsError> {
        let edge = HouseEdge::from_percent(percent)?;
        self.store.set_house_edge(edge).await?;
        *self.current.write().await = edge;
        info!(percent = edge.percent(), "House edge updated");
        Ok(edge)
    }
}
