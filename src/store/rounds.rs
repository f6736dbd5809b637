//! Round Store
//!
//! Finalized rounds and their wagers. Round records are written once at
//! reveal and never changed; a wager's win flag is set at most once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;

use crate::game::dice::DiceRoll;
use crate::game::state::{PlayerId, Side};
use crate::store::StoreError;

/// Storage id of a round record.
pub type RoundId = u64;

/// Storage id of a wager record.
pub type WagerId = u64;

/// A finalized round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Storage id.
    pub id: RoundId,
    /// Round number.
    pub round_number: u64,
    /// Drawn dice.
    pub dice: [u8; 3],
    /// Sum of dice.
    pub total: u8,
    /// Winning side.
    pub outcome: Side,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

/// A persisted wager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WagerRecord {
    /// Storage id.
    pub id: WagerId,
    /// Owning player.
    pub player_id: PlayerId,
    /// Round this wager belongs to.
    pub round_id: RoundId,
    /// Chosen side.
    pub side: Side,
    /// Staked credits.
    pub amount: u64,
    /// `None` until settled.
    pub win: Option<bool>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

/// One line of a player's betting history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerBet {
    /// The wager.
    pub wager: WagerRecord,
    /// The round it was placed on.
    pub round: RoundRecord,
}

/// Lifetime betting statistics for one player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    /// Wagers placed.
    pub total_bets: u64,
    /// Settled wins.
    pub wins: u64,
    /// Settled losses.
    pub losses: u64,
    /// Sum of stakes.
    pub total_wagered: u64,
    /// Winnings minus stakes over settled wagers.
    pub net_profit: i64,
}

/// Frequency of one outcome over a window of rounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeStats {
    /// The outcome.
    pub outcome: Side,
    /// Rounds that landed on it.
    pub count: u64,
    /// Mean total among those rounds (0 when count is 0).
    pub average_total: f64,
}

/// Persistence of rounds and wagers.
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Record a finalized round.
    async fn create_round(&self, round_number: u64, roll: &DiceRoll) -> Result<RoundId, StoreError>;

    /// Highest recorded round number, 0 if none.
    async fn last_round_number(&self) -> Result<u64, StoreError>;

    /// Record a wager against a round.
    async fn create_wager(
        &self,
        player: PlayerId,
        round_id: RoundId,
        side: Side,
        amount: u64,
    ) -> Result<WagerId, StoreError>;

    /// Set the win flag. Returns `true` only if this call settled the wager;
    /// an already settled wager is left untouched.
    async fn set_wager_win(&self, wager_id: WagerId, win: bool) -> Result<bool, StoreError>;

    /// Most recent rounds, newest first.
    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError>;

    /// Look up a round by number.
    async fn round_by_number(&self, round_number: u64) -> Result<Option<RoundRecord>, StoreError>;

    /// Wagers of one round in placement order.
    async fn wagers_for_round(&self, round_id: RoundId) -> Result<Vec<WagerRecord>, StoreError>;

    /// A player's wagers, newest first.
    async fn player_history(
        &self,
        player: PlayerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PlayerBet>, StoreError>;

    /// Lifetime statistics for a player.
    async fn player_stats(&self, player: PlayerId) -> Result<PlayerStats, StoreError>;

    /// Per-outcome counts over the last `last_n` rounds.
    async fn outcome_stats(&self, last_n: usize) -> Result<Vec<OutcomeStats>, StoreError>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    /// Indexed by `id - 1`.
    rounds: Vec<RoundRecord>,
    wagers: BTreeMap<WagerId, WagerRecord>,
    by_number: BTreeMap<u64, RoundId>,
    next_wager_id: WagerId,
}

impl Tables {
    fn round(&self, id: RoundId) -> Option<&RoundRecord> {
        id.checked_sub(1).and_then(|idx| self.rounds.get(idx as usize))
    }
}

/// In-memory round store.
#[derive(Debug, Default)]
pub struct MemoryRoundStore {
    tables: RwLock<Tables>,
}

impl MemoryRoundStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from saved records.
    ///
    /// Round ids must be `1..=n` in order, as produced by this store.
    pub fn from_records(rounds: Vec<RoundRecord>, wagers: Vec<WagerRecord>) -> Self {
        let by_number = rounds.iter().map(|r| (r.round_number, r.id)).collect();
        let next_wager_id = wagers.iter().map(|w| w.id).max().unwrap_or(0);
        let wagers = wagers.into_iter().map(|w| (w.id, w)).collect();

        Self {
            tables: RwLock::new(Tables {
                rounds,
                wagers,
                by_number,
                next_wager_id,
            }),
        }
    }

    /// Copy of every record, for snapshots.
    pub async fn records(&self) -> (Vec<RoundRecord>, Vec<WagerRecord>) {
        let tables = self.tables.read().await;
        (
            tables.rounds.clone(),
            tables.wagers.values().cloned().collect(),
        )
    }
}

#[async_trait]
impl RoundStore for MemoryRoundStore {
    async fn create_round(&self, round_number: u64, roll: &DiceRoll) -> Result<RoundId, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.by_number.contains_key(&round_number) {
            return Err(StoreError::DuplicateRound(round_number));
        }

        let id = tables.rounds.len() as RoundId + 1;
        tables.rounds.push(RoundRecord {
            id,
            round_number,
            dice: roll.dice,
            total: roll.total,
            outcome: roll.outcome,
            created_at: Utc::now(),
        });
        tables.by_number.insert(round_number, id);
        Ok(id)
    }

    async fn last_round_number(&self) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .by_number
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn create_wager(
        &self,
        player: PlayerId,
        round_id: RoundId,
        side: Side,
        amount: u64,
    ) -> Result<WagerId, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.round(round_id).is_none() {
            return Err(StoreError::RoundNotFound(round_id));
        }

        tables.next_wager_id += 1;
        let id = tables.next_wager_id;
        tables.wagers.insert(
            id,
            WagerRecord {
                id,
                player_id: player,
                round_id,
                side,
                amount,
                win: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn set_wager_win(&self, wager_id: WagerId, win: bool) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let wager = tables
            .wagers
            .get_mut(&wager_id)
            .ok_or(StoreError::WagerNotFound(wager_id))?;

        if wager.win.is_some() {
            return Ok(false);
        }
        wager.win = Some(win);
        Ok(true)
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_number
            .values()
            .rev()
            .take(limit)
            .filter_map(|id| tables.round(*id).cloned())
            .collect())
    }

    async fn round_by_number(&self, round_number: u64) -> Result<Option<RoundRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_number
            .get(&round_number)
            .and_then(|id| tables.round(*id))
            .cloned())
    }

    async fn wagers_for_round(&self, round_id: RoundId) -> Result<Vec<WagerRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .wagers
            .values()
            .filter(|w| w.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn player_history(
        &self,
        player: PlayerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PlayerBet>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .wagers
            .values()
            .rev()
            .filter(|w| w.player_id == player)
            .skip(offset)
            .take(limit)
            .filter_map(|w| {
                tables.round(w.round_id).map(|round| PlayerBet {
                    wager: w.clone(),
                    round: round.clone(),
                })
            })
            .collect())
    }

    async fn player_stats(&self, player: PlayerId) -> Result<PlayerStats, StoreError> {
        let tables = self.tables.read().await;
        let mut stats = PlayerStats::default();

        for wager in tables.wagers.values().filter(|w| w.player_id == player) {
            stats.total_bets += 1;
            stats.total_wagered = stats.total_wagered.saturating_add(wager.amount);
            // Winners are paid twice the stake, so the net is +stake or -stake
            match wager.win {
                Some(true) => {
                    stats.wins += 1;
                    stats.net_profit = stats.net_profit.saturating_add(wager.amount as i64);
                }
                Some(false) => {
                    stats.losses += 1;
                    stats.net_profit = stats.net_profit.saturating_sub(wager.amount as i64);
                }
                None => {}
            }
        }

        Ok(stats)
    }

    async fn outcome_stats(&self, last_n: usize) -> Result<Vec<OutcomeStats>, StoreError> {
        let recent = self.recent_rounds(last_n).await?;

        Ok([Side::High, Side::Low]
            .into_iter()
            .map(|outcome| {
                let totals: Vec<u64> = recent
                    .iter()
                    .filter(|r| r.outcome == outcome)
                    .map(|r| r.total as u64)
                    .collect();
                let count = totals.len() as u64;
                let average_total = if count == 0 {
                    0.0
                } else {
                    totals.iter().sum::<u64>() as f64 / count as f64
                };
                OutcomeStats {
                    outcome,
                    count,
                    average_total,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    fn roll(d: [u8; 3]) -> DiceRoll {
        DiceRoll::from_dice(d[0], d[1], d[2]).unwrap()
    }

    #[tokio::test]
    async fn test_last_round_number() {
        let store = MemoryRoundStore::new();
        assert_eq!(store.last_round_number().await.unwrap(), 0);

        store.create_round(41, &roll([1, 2, 3])).await.unwrap();
        assert_eq!(store.last_round_number().await.unwrap(), 41);

        assert_eq!(
            store.create_round(41, &roll([1, 2, 3])).await,
            Err(StoreError::DuplicateRound(41))
        );
    }

    #[tokio::test]
    async fn test_wager_win_set_once() {
        let store = MemoryRoundStore::new();
        let round_id = store.create_round(1, &roll([6, 6, 6])).await.unwrap();
        let wager_id = store.create_wager(player(1), round_id, Side::High, 200).await.unwrap();

        assert!(store.set_wager_win(wager_id, true).await.unwrap());
        assert!(!store.set_wager_win(wager_id, false).await.unwrap());

        let wagers = store.wagers_for_round(round_id).await.unwrap();
        assert_eq!(wagers.len(), 1);
        assert_eq!(wagers[0].win, Some(true));

        assert_eq!(store.set_wager_win(999, true).await, Err(StoreError::WagerNotFound(999)));
    }

    #[tokio::test]
    async fn test_wager_requires_round() {
        let store = MemoryRoundStore::new();
        assert_eq!(
            store.create_wager(player(1), 7, Side::Low, 10).await,
            Err(StoreError::RoundNotFound(7))
        );
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let store = MemoryRoundStore::new();
        let r1 = store.create_round(1, &roll([6, 6, 6])).await.unwrap();
        let r2 = store.create_round(2, &roll([1, 1, 2])).await.unwrap();

        let w1 = store.create_wager(player(1), r1, Side::High, 200).await.unwrap();
        let w2 = store.create_wager(player(1), r2, Side::High, 50).await.unwrap();
        let w3 = store.create_wager(player(2), r2, Side::Low, 70).await.unwrap();
        store.set_wager_win(w1, true).await.unwrap();
        store.set_wager_win(w2, false).await.unwrap();
        store.set_wager_win(w3, true).await.unwrap();

        let history = store.player_history(player(1), 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].wager.id, w2);
        assert_eq!(history[0].round.round_number, 2);

        let page = store.player_history(player(1), 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].wager.id, w1);

        let stats = store.player_stats(player(1)).await.unwrap();
        assert_eq!(stats, PlayerStats {
            total_bets: 2,
            wins: 1,
            losses: 1,
            total_wagered: 250,
            net_profit: 150,
        });
    }

    #[tokio::test]
    async fn test_recent_rounds_and_outcome_stats() {
        let store = MemoryRoundStore::new();
        store.create_round(1, &roll([1, 1, 1])).await.unwrap();
        store.create_round(2, &roll([6, 6, 6])).await.unwrap();
        store.create_round(3, &roll([5, 5, 2])).await.unwrap();

        let recent = store.recent_rounds(2).await.unwrap();
        let numbers: Vec<u64> = recent.iter().map(|r| r.round_number).collect();
        assert_eq!(numbers, vec![3, 2]);

        let stats = store.outcome_stats(2).await.unwrap();
        let high = stats.iter().find(|s| s.outcome == Side::High).unwrap();
        let low = stats.iter().find(|s| s.outcome == Side::Low).unwrap();
        assert_eq!(high.count, 2);
        assert_eq!(high.average_total, 15.0);
        assert_eq!(low.count, 0);
        assert_eq!(low.average_total, 0.0);

        assert_eq!(store.round_by_number(1).await.unwrap().unwrap().total, 3);
        assert!(store.round_by_number(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_records_continues_ids() {
        let store = MemoryRoundStore::new();
        let r = store.create_round(5, &roll([2, 2, 2])).await.unwrap();
        store.create_wager(player(1), r, Side::Low, 10).await.unwrap();

        let (rounds, wagers) = store.records().await;
        let restored = MemoryRoundStore::from_records(rounds, wagers);
        assert_eq!(restored.last_round_number().await.unwrap(), 5);

        let next = restored.create_wager(player(1), r, Side::Low, 10).await.unwrap();
        assert_eq!(next, 2);
    }
}
