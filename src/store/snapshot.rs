//! Store Snapshot
//!
//! Bincode image of the in-memory stores so balances and round numbering
//! survive a restart.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::game::state::{PendingWager, PlayerId};
use crate::store::ledger::MemoryLedger;
use crate::store::rounds::{MemoryRoundStore, RoundRecord, WagerRecord};
use crate::store::settings::{MemorySettings, Settings};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Snapshot failures.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Reading or writing the file failed.
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed.
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// File written by an incompatible version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version {
        /// Version in the file.
        found: u32,
        /// Version this build reads.
        expected: u32,
    },
}

/// Everything the in-memory stores hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Player balances.
    pub accounts: Vec<(PlayerId, u64)>,
    /// Stakes of the unfinished round, credited back on restore.
    pub pending: Vec<PendingWager>,
    /// Finalized rounds.
    pub rounds: Vec<RoundRecord>,
    /// Persisted wagers.
    pub wagers: Vec<WagerRecord>,
    /// Admin settings.
    pub settings: Settings,
}

impl StoreSnapshot {
    /// Capture the stores.
    pub async fn capture(
        ledger: &MemoryLedger,
        rounds: &MemoryRoundStore,
        settings: &MemorySettings,
    ) -> Self {
        let (round_records, wager_records) = rounds.records().await;
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            accounts: ledger.accounts().await,
            pending: Vec::new(),
            rounds: round_records,
            wagers: wager_records,
            settings: settings.get().await,
        }
    }

    /// Record stakes that were deducted but never written as wagers.
    pub fn with_pending(mut self, pending: Vec<PendingWager>) -> Self {
        self.pending = pending;
        self
    }

    /// Build fresh stores from this snapshot. Pending stakes are refunded,
    /// since their round never finished.
    pub fn into_stores(self) -> (MemoryLedger, MemoryRoundStore, MemorySettings) {
        let mut accounts: BTreeMap<PlayerId, u64> = self.accounts.into_iter().collect();
        for wager in &self.pending {
            let coins = accounts.entry(wager.player_id).or_insert(0);
            *coins = coins.saturating_add(wager.amount);
        }
        if !self.pending.is_empty() {
            info!(wagers = self.pending.len(), "Refunded stakes of unfinished round");
        }

        (
            MemoryLedger::with_accounts(accounts),
            MemoryRoundStore::from_records(self.rounds, self.wagers),
            MemorySettings::new(self.settings),
        )
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes, checking the version.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        // The version leads the encoding, so check it before the body
        let version: u32 = bincode::deserialize(data)?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(bincode::deserialize(data)?)
    }

    /// Write to `path`, replacing it atomically via a temp file.
    pub async fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(
            path = %path.display(),
            rounds = self.rounds.len(),
            accounts = self.accounts.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Read from `path`. `Ok(None)` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::dice::{DiceRoll, HouseEdge};
    use crate::game::state::Side;
    use crate::store::{BalanceLedger, RoundStore, SettingsStore};

    #[tokio::test]
    async fn test_snapshot_restores_stores() {
        let player = PlayerId::new([3; 16]);
        let ledger = MemoryLedger::with_accounts([(player, 750)]);
        let rounds = MemoryRoundStore::new();
        let settings = MemorySettings::default();

        let roll = DiceRoll::from_dice(4, 4, 4).unwrap();
        let round_id = rounds.create_round(41, &roll).await.unwrap();
        let wager_id = rounds.create_wager(player, round_id, Side::High, 50).await.unwrap();
        rounds.set_wager_win(wager_id, true).await.unwrap();
        settings.set_house_edge(HouseEdge::from_percent(12.5).unwrap()).await.unwrap();

        let snapshot = StoreSnapshot::capture(&ledger, &rounds, &settings).await;
        let decoded = StoreSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);

        let (ledger, rounds, settings) = decoded.into_stores();
        assert_eq!(ledger.balance(player).await.unwrap(), 750);
        assert_eq!(rounds.last_round_number().await.unwrap(), 41);
        assert_eq!(rounds.wagers_for_round(round_id).await.unwrap()[0].win, Some(true));
        assert_eq!(settings.house_edge().await.unwrap().percent(), 12.5);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let mut snapshot = StoreSnapshot::capture(
            &MemoryLedger::new(),
            &MemoryRoundStore::new(),
            &MemorySettings::default(),
        )
        .await;
        snapshot.version = 99;

        let bytes = bincode::serialize(&snapshot).unwrap();
        assert!(matches!(
            StoreSnapshot::from_bytes(&bytes),
            Err(SnapshotError::Version { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!("dice-snapshot-{}.bin", uuid::Uuid::new_v4()));
        assert!(StoreSnapshot::load(&path).await.unwrap().is_none());

        let snapshot = StoreSnapshot::capture(
            &MemoryLedger::with_accounts([(PlayerId::new([1; 16]), 5)]),
            &MemoryRoundStore::new(),
            &MemorySettings::default(),
        )
        .await;
        snapshot.save(&path).await.unwrap();

        let loaded = StoreSnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.accounts, snapshot.accounts);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_stakes_refunded_on_restore() {
        let alice = PlayerId::new([1; 16]);
        let bob = PlayerId::new([2; 16]);
        let snapshot = StoreSnapshot::capture(
            &MemoryLedger::with_accounts([(alice, 800)]),
            &MemoryRoundStore::new(),
            &MemorySettings::default(),
        )
        .await
        .with_pending(vec![
            PendingWager::new(alice, Side::High, 200),
            PendingWager::new(bob, Side::Low, 30),
        ]);

        let decoded = StoreSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        let (ledger, _, _) = decoded.into_stores();
        assert_eq!(ledger.balance(alice).await.unwrap(), 1000);
        assert_eq!(ledger.balance(bob).await.unwrap(), 30);
    }
}
