//! Settlement Unit
//!
//! Two steps: [`decide`] computes every win/lose decision for a drawn
//! outcome without touching storage, then [`apply`] writes each decision
//! on its own so one failing wager never blocks the rest.
//!
//! A wager's win flag is set before its payout is credited. A retry sees
//! the flag already set and pays nothing, so a winner can never be paid
//! twice.

use tracing::{debug, error, warn};

use crate::game::state::{PendingWager, PlayerId, Side};
use crate::store::{BalanceLedger, RoundId, RoundStore, StoreError, WagerId};

/// Winners receive this multiple of their stake.
pub const PAYOUT_MULTIPLIER: u64 = 2;

/// A wager that made it into the round store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistedWager {
    /// Storage id.
    pub wager_id: WagerId,
    /// Owning player.
    pub player_id: PlayerId,
    /// Chosen side.
    pub side: Side,
    /// Staked credits.
    pub amount: u64,
}

/// Outcome of one wager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlementDecision {
    /// Storage id.
    pub wager_id: WagerId,
    /// Owning player.
    pub player_id: PlayerId,
    /// Whether the wager won.
    pub win: bool,
    /// Credits owed (0 for losers).
    pub payout: u64,
}

/// Per-wager failure. Logged and collected; the batch carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementFailure {
    /// The wager record could not be written.
    #[error("failed to persist wager of {player} ({amount} on {side}): {source}")]
    Persist {
        /// Owning player (short hex).
        player: String,
        /// Chosen side.
        side: Side,
        /// Staked credits.
        amount: u64,
        /// Underlying error.
        source: StoreError,
    },

    /// The win flag could not be written.
    #[error("failed to mark wager {wager_id}: {source}")]
    Mark {
        /// Storage id.
        wager_id: WagerId,
        /// Underlying error.
        source: StoreError,
    },

    /// The flag was set but the payout was not credited.
    #[error("failed to credit {payout} to {player} for wager {wager_id}: {source}")]
    Credit {
        /// Storage id.
        wager_id: WagerId,
        /// Owning player (short hex).
        player: String,
        /// Credits owed.
        payout: u64,
        /// Underlying error.
        source: StoreError,
    },
}

/// What a settlement pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettlementReport {
    /// Wagers newly settled as wins.
    pub winners: u32,
    /// Wagers newly settled as losses.
    pub losers: u32,
    /// Credits paid out.
    pub paid_out: u64,
    /// Wagers skipped because they were already settled.
    pub already_settled: u32,
    /// Wagers that failed.
    pub failures: Vec<SettlementFailure>,
}

impl SettlementReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: SettlementReport) {
        self.winners += other.winners;
        self.losers += other.losers;
        self.paid_out = self.paid_out.saturating_add(other.paid_out);
        self.already_settled += other.already_settled;
        self.failures.extend(other.failures);
    }
}

/// Decide every wager against `outcome`.
pub fn decide(wagers: &[PersistedWager], outcome: Side) -> Vec<SettlementDecision> {
    wagers
        .iter()
        .map(|w| {
            let win = w.side == outcome;
            SettlementDecision {
                wager_id: w.wager_id,
                player_id: w.player_id,
                win,
                payout: if win { w.amount.saturating_mul(PAYOUT_MULTIPLIER) } else { 0 },
            }
        })
        .collect()
}

/// Write each pool member as a wager of `round_id`.
///
/// Members that fail to persist are reported and left out of the result.
pub async fn persist_pool(
    round_id: RoundId,
    pool: &[PendingWager],
    rounds: &dyn RoundStore,
) -> (Vec<PersistedWager>, Vec<SettlementFailure>) {
    let mut persisted = Vec::with_capacity(pool.len());
    let mut failures = Vec::new();

    for wager in pool {
        match rounds
            .create_wager(wager.player_id, round_id, wager.side, wager.amount)
            .await
        {
            Ok(wager_id) => persisted.push(PersistedWager {
                wager_id,
                player_id: wager.player_id,
                side: wager.side,
                amount: wager.amount,
            }),
            Err(source) => {
                error!(
                    player = %wager.player_id.short(),
                    amount = wager.amount,
                    error = %source,
                    "Failed to persist wager"
                );
                failures.push(SettlementFailure::Persist {
                    player: wager.player_id.short(),
                    side: wager.side,
                    amount: wager.amount,
                    source,
                });
            }
        }
    }

    (persisted, failures)
}

/// Apply decisions one wager at a time.
pub async fn apply(
    decisions: &[SettlementDecision],
    rounds: &dyn RoundStore,
    ledger: &dyn BalanceLedger,
) -> SettlementReport {
    let mut report = SettlementReport::default();

    for decision in decisions {
        let newly_settled = match rounds.set_wager_win(decision.wager_id, decision.win).await {
            Ok(newly) => newly,
            Err(source) => {
                error!(wager_id = decision.wager_id, error = %source, "Failed to mark wager");
                report.failures.push(SettlementFailure::Mark {
                    wager_id: decision.wager_id,
                    source,
                });
                continue;
            }
        };

        if !newly_settled {
            debug!(wager_id = decision.wager_id, "Wager already settled, skipping");
            report.already_settled += 1;
            continue;
        }

        if !decision.win {
            report.losers += 1;
            continue;
        }

        report.winners += 1;
        match ledger.credit(decision.player_id, decision.payout).await {
            Ok(_) => report.paid_out = report.paid_out.saturating_add(decision.payout),
            Err(source) => {
                warn!(
                    wager_id = decision.wager_id,
                    player = %decision.player_id.short(),
                    payout = decision.payout,
                    error = %source,
                    "Winner marked but payout failed"
                );
                report.failures.push(SettlementFailure::Credit {
                    wager_id: decision.wager_id,
                    player: decision.player_id.short(),
                    payout: decision.payout,
                    source,
                });
            }
        }
    }

    report
}
