//! Round Manager
//!
//! Owns the current round and its betting pool. Every mutation goes through
//! one async mutex, so scheduler ticks and bet requests interleave but never
//! overlap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::core::rng::DeterministicRng;
use crate::game::dice::{self, DiceRoll, Draw, DrawPath, HouseEdge};
use crate::game::settlement::{self, SettlementFailure, SettlementReport};
use crate::game::state::{PendingWager, PlayerId, RoundSnapshot, RoundStatus, Side};
use crate::store::{BalanceLedger, RoundId, RoundStore, StoreError};
use crate::BETTING_WINDOW_TICKS;

// =============================================================================
// ERRORS
// =============================================================================

/// Reasons a bet is refused. Nothing is applied when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BetError {
    /// No round is open for betting.
    #[error("Betting is closed")]
    BettingClosed,

    /// Side is not high/low (or tai/xiu).
    #[error("Invalid bet side: {0}")]
    InvalidSide(String),

    /// Amount is not a positive whole number.
    #[error("Invalid bet amount")]
    InvalidAmount,

    /// Balance is below the stake.
    #[error("Insufficient balance")]
    InsufficientFunds,

    /// The conditional deduction did not go through.
    #[error("Failed to deduct coins")]
    DeductionFailed,

    /// Betting is paused by an administrator.
    #[error("Game is under maintenance")]
    Maintenance,

    /// No running engine to take the bet.
    #[error("Game engine not running")]
    EngineUnavailable,

    /// Too many bets from one player in a short window.
    #[error("Slow down! Too many bets.")]
    RateLimited,

    /// Reading the balance failed.
    #[error("Balance unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Round-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundError {
    /// No open or locked round to process.
    #[error("no active round")]
    NoActiveRound,
}

// =============================================================================
// RESULTS
// =============================================================================

/// An accepted bet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BetReceipt {
    /// Round the bet joined.
    pub round_number: u64,
    /// Chosen side.
    pub side: Side,
    /// Stake.
    pub amount: u64,
    /// Balance after the deduction.
    pub new_balance: u64,
}

/// Result of processing a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundSummary {
    /// Round number.
    pub round_number: u64,
    /// Drawn dice.
    pub roll: DiceRoll,
    /// How the dice were drawn.
    pub path: DrawPath,
    /// Stored round id, `None` if the round record could not be written.
    pub round_id: Option<RoundId>,
    /// Settlement counts and failures.
    pub settlement: SettlementReport,
}

impl RoundSummary {
    /// Wagers settled as wins.
    pub fn winners(&self) -> u32 {
        self.settlement.winners
    }

    /// Wagers settled as losses.
    pub fn losers(&self) -> u32 {
        self.settlement.losers
    }
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Debug)]
struct CurrentRound {
    round_number: u64,
    status: RoundStatus,
    time_left: u32,
    created_at: DateTime<Utc>,
    pool: Vec<PendingWager>,
}

impl CurrentRound {
    fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_number: self.round_number,
            status: self.status,
            time_left: self.time_left,
            created_at: self.created_at,
            pool: self.pool.clone(),
        }
    }
}

/// Sole writer of round state.
pub struct RoundManager {
    current: Mutex<Option<CurrentRound>>,
    ledger: Arc<dyn BalanceLedger>,
    rounds: Arc<dyn RoundStore>,
    betting_window: u32,
}

impl RoundManager {
    /// Create a manager with the default betting window.
    pub fn new(ledger: Arc<dyn BalanceLedger>, rounds: Arc<dyn RoundStore>) -> Self {
        Self::with_betting_window(ledger, rounds, BETTING_WINDOW_TICKS)
    }

    /// Create a manager whose rounds open with `betting_window` ticks left.
    pub fn with_betting_window(
        ledger: Arc<dyn BalanceLedger>,
        rounds: Arc<dyn RoundStore>,
        betting_window: u32,
    ) -> Self {
        Self {
            current: Mutex::new(None),
            ledger,
            rounds,
            betting_window,
        }
    }

    /// The ledger bets are drawn from.
    pub fn ledger(&self) -> &Arc<dyn BalanceLedger> {
        &self.ledger
    }

    /// The store rounds are written to.
    pub fn rounds(&self) -> &Arc<dyn RoundStore> {
        &self.rounds
    }

    /// Open round `round_number` with an empty pool.
    ///
    /// Stakes left in an unprocessed pool are credited back first.
    pub async fn start_new_round(&self, round_number: u64) {
        let mut current = self.current.lock().await;
        if let Some(prev) = current.as_mut() {
            if prev.status != RoundStatus::Revealed && !prev.pool.is_empty() {
                warn!(
                    round = prev.round_number,
                    wagers = prev.pool.len(),
                    "Unprocessed pool, refunding"
                );
                self.refund(prev).await;
            }
        }

        *current = Some(CurrentRound {
            round_number,
            status: RoundStatus::Open,
            time_left: self.betting_window,
            created_at: Utc::now(),
            pool: Vec::new(),
        });
        info!(round = round_number, "Round opened");
    }

    /// Abandon the current round: close betting and credit every pending
    /// stake back. Returns the credits refunded.
    pub async fn refund_pool(&self) -> u64 {
        let mut current = self.current.lock().await;
        match current.as_mut() {
            Some(round) if round.status != RoundStatus::Revealed => {
                round.status = RoundStatus::Locked;
                round.time_left = 0;
                self.refund(round).await
            }
            _ => 0,
        }
    }

    async fn refund(&self, round: &mut CurrentRound) -> u64 {
        let mut refunded = 0u64;
        for wager in std::mem::take(&mut round.pool) {
            match self.ledger.credit(wager.player_id, wager.amount).await {
                Ok(_) => refunded = refunded.saturating_add(wager.amount),
                Err(e) => error!(
                    round = round.round_number,
                    player = %wager.player_id.short(),
                    amount = wager.amount,
                    error = %e,
                    "Refund failed"
                ),
            }
        }
        if refunded > 0 {
            info!(round = round.round_number, refunded, "Pool refunded");
        }
        refunded
    }

    /// Validate, deduct and add a wager to the pool.
    pub async fn place_bet(
        &self,
        player: PlayerId,
        side: Side,
        amount: u64,
    ) -> Result<BetReceipt, BetError> {
        let mut current = self.current.lock().await;
        let round = match current.as_mut() {
            Some(round) if round.status == RoundStatus::Open => round,
            _ => return Err(BetError::BettingClosed),
        };

        if amount == 0 {
            return Err(BetError::InvalidAmount);
        }

        let balance = self.ledger.balance(player).await?;
        if balance < amount {
            return Err(BetError::InsufficientFunds);
        }

        match self.ledger.try_deduct(player, amount).await {
            Ok(true) => {}
            Ok(false) => return Err(BetError::DeductionFailed),
            Err(e) => {
                error!(player = %player.short(), amount, error = %e, "Deduction error");
                return Err(BetError::DeductionFailed);
            }
        }

        let new_balance = self
            .ledger
            .balance(player)
            .await
            .unwrap_or(balance - amount);

        round.pool.push(PendingWager::new(player, side, amount));
        debug!(
            round = round.round_number,
            player = %player.short(),
            %side,
            amount,
            pool = round.pool.len(),
            "Bet accepted"
        );

        Ok(BetReceipt {
            round_number: round.round_number,
            side,
            amount,
            new_balance,
        })
    }

    /// Close betting. Returns `false` if there was nothing to lock.
    pub async fn lock_betting(&self) -> bool {
        let mut current = self.current.lock().await;
        match current.as_mut() {
            Some(round) if round.status == RoundStatus::Open => {
                round.status = RoundStatus::Locked;
                round.time_left = 0;
                info!(round = round.round_number, wagers = round.pool.len(), "Betting locked");
                true
            }
            _ => false,
        }
    }

    /// Update the countdown shown in snapshots.
    pub async fn set_time_left(&self, time_left: u32) {
        if let Some(round) = self.current.lock().await.as_mut() {
            round.time_left = time_left;
        }
    }

    /// Draw, persist and settle the current round.
    ///
    /// Storage failures are logged and reported in the summary; the round is
    /// marked revealed either way.
    pub async fn process_round(
        &self,
        edge: HouseEdge,
        rng: &mut DeterministicRng,
    ) -> Result<RoundSummary, RoundError> {
        self.settle_with(|pool| dice::draw(pool, edge, rng)).await
    }

    /// Like [`process_round`](Self::process_round), but with the dice given.
    pub async fn process_round_with_roll(&self, roll: DiceRoll) -> Result<RoundSummary, RoundError> {
        self.settle_with(|_| Draw { roll, path: DrawPath::Fixed }).await
    }

    async fn settle_with(
        &self,
        draw: impl FnOnce(&[PendingWager]) -> Draw,
    ) -> Result<RoundSummary, RoundError> {
        let mut current = self.current.lock().await;
        let round = match current.as_mut() {
            Some(round) if round.status != RoundStatus::Revealed => round,
            _ => return Err(RoundError::NoActiveRound),
        };

        round.status = RoundStatus::Revealed;
        round.time_left = 0;
        let pool = std::mem::take(&mut round.pool);
        let round_number = round.round_number;

        let draw = draw(&pool);
        let roll = draw.roll;
        info!(
            round = round_number,
            dice = ?roll.dice,
            total = roll.total,
            outcome = %roll.outcome,
            path = ?draw.path,
            "Dice drawn"
        );

        let mut settlement = SettlementReport::default();
        let round_id = match self.rounds.create_round(round_number, &roll).await {
            Ok(id) => {
                let (persisted, failures) =
                    settlement::persist_pool(id, &pool, self.rounds.as_ref()).await;
                settlement.failures = failures;

                let decisions = settlement::decide(&persisted, roll.outcome);
                settlement.merge(
                    settlement::apply(&decisions, self.rounds.as_ref(), self.ledger.as_ref()).await,
                );
                Some(id)
            }
            Err(e) => {
                error!(round = round_number, error = %e, "Failed to persist round; stakes written off");
                settlement.failures = pool
                    .iter()
                    .map(|w| SettlementFailure::Persist {
                        player: w.player_id.short(),
                        side: w.side,
                        amount: w.amount,
                        source: e.clone(),
                    })
                    .collect();
                None
            }
        };

        info!(
            round = round_number,
            winners = settlement.winners,
            losers = settlement.losers,
            paid_out = settlement.paid_out,
            failures = settlement.failures.len(),
            "Round settled"
        );

        Ok(RoundSummary {
            round_number,
            roll,
            path: draw.path,
            round_id,
            settlement,
        })
    }

    /// Read-only view of the current round.
    pub async fn current_round(&self) -> Option<RoundSnapshot> {
        self.current.lock().await.as_ref().map(CurrentRound::snapshot)
    }

    /// Hold off every bet, settlement and refund until the guard drops.
    pub async fn freeze(&self) -> RoundGuard<'_> {
        RoundGuard(self.current.lock().await)
    }
}

/// Exclusive hold on the current round, from [`RoundManager::freeze`].
pub struct RoundGuard<'a>(MutexGuard<'a, Option<CurrentRound>>);

impl RoundGuard<'_> {
    /// Stakes deducted but not yet written as wagers.
    pub fn pending(&self) -> Vec<PendingWager> {
        match self.0.as_ref() {
            Some(round) if round.status != RoundStatus::Revealed => round.pool.clone(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedger, MemoryRoundStore};

    fn player(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    fn manager(accounts: &[(u8, u64)]) -> (RoundManager, Arc<MemoryLedger>, Arc<MemoryRoundStore>) {
        let ledger = Arc::new(MemoryLedger::with_accounts(
            accounts.iter().map(|(p, c)| (player(*p), *c)),
        ));
        let rounds = Arc::new(MemoryRoundStore::new());
        (RoundManager::new(ledger.clone(), rounds.clone()), ledger, rounds)
    }

    #[tokio::test]
    async fn test_no_round_rejects_bets() {
        let (mgr, _, _) = manager(&[(1, 100)]);
        assert_eq!(mgr.place_bet(player(1), Side::High, 10).await, Err(BetError::BettingClosed));
        assert!(mgr.current_round().await.is_none());
    }

    #[tokio::test]
    async fn test_bet_deducts_and_joins_pool() {
        let (mgr, ledger, _) = manager(&[(1, 1000)]);
        mgr.start_new_round(1).await;

        let receipt = mgr.place_bet(player(1), Side::High, 200).await.unwrap();
        assert_eq!(receipt.new_balance, 800);
        assert_eq!(receipt.round_number, 1);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 800);

        let snap = mgr.current_round().await.unwrap();
        assert_eq!(snap.status, RoundStatus::Open);
        assert_eq!(snap.time_left, BETTING_WINDOW_TICKS);
        assert_eq!(snap.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_bet_validation() {
        let (mgr, ledger, _) = manager(&[(1, 100)]);
        mgr.start_new_round(1).await;

        assert_eq!(mgr.place_bet(player(1), Side::Low, 0).await, Err(BetError::InvalidAmount));
        assert_eq!(mgr.place_bet(player(1), Side::Low, 101).await, Err(BetError::InsufficientFunds));
        assert_eq!(mgr.place_bet(player(9), Side::Low, 1).await, Err(BetError::InsufficientFunds));

        assert_eq!(ledger.balance(player(1)).await.unwrap(), 100);
        assert!(mgr.current_round().await.unwrap().pool.is_empty());
    }

    #[tokio::test]
    async fn test_locked_round_rejects_any_bet() {
        let (mgr, _, _) = manager(&[(1, 100)]);
        mgr.start_new_round(1).await;
        assert!(mgr.lock_betting().await);
        assert!(!mgr.lock_betting().await);

        for amount in [0, 1, 100, 1_000_000] {
            for side in [Side::High, Side::Low] {
                assert_eq!(mgr.place_bet(player(1), side, amount).await, Err(BetError::BettingClosed));
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_bets_respect_balance() {
        let (mgr, ledger, _) = manager(&[(1, 300)]);
        let mgr = Arc::new(mgr);
        mgr.start_new_round(1).await;

        let a = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.place_bet(player(1), Side::High, 200).await }
        });
        let b = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.place_bet(player(1), Side::Low, 200).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        assert!(results.iter().any(|r| r == &Err(BetError::InsufficientFunds)));
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_process_round_settles_pool() {
        let (mgr, ledger, rounds) = manager(&[(1, 1000), (2, 1000)]);
        mgr.start_new_round(7).await;
        mgr.place_bet(player(1), Side::High, 300).await.unwrap();
        mgr.place_bet(player(2), Side::Low, 100).await.unwrap();
        mgr.lock_betting().await;

        let mut rng = DeterministicRng::new(5);
        let summary = mgr.process_round(HouseEdge::ALWAYS, &mut rng).await.unwrap();

        // Heavier high pool forces a low outcome
        assert_eq!(summary.roll.outcome, Side::Low);
        assert_eq!(summary.path, DrawPath::Biased);
        assert_eq!(summary.winners(), 1);
        assert_eq!(summary.losers(), 1);

        assert_eq!(ledger.balance(player(1)).await.unwrap(), 700);
        assert_eq!(ledger.balance(player(2)).await.unwrap(), 1100);

        let record = rounds.round_by_number(7).await.unwrap().unwrap();
        assert_eq!(Some(record.id), summary.round_id);
        assert_eq!(rounds.wagers_for_round(record.id).await.unwrap().len(), 2);

        let snap = mgr.current_round().await.unwrap();
        assert_eq!(snap.status, RoundStatus::Revealed);
        assert!(snap.pool.is_empty());
    }

    #[tokio::test]
    async fn test_process_round_requires_active_round() {
        let (mgr, _, _) = manager(&[]);
        let mut rng = DeterministicRng::new(1);
        assert_eq!(
            mgr.process_round(HouseEdge::NONE, &mut rng).await,
            Err(RoundError::NoActiveRound)
        );

        mgr.start_new_round(1).await;
        mgr.process_round(HouseEdge::NONE, &mut rng).await.unwrap();
        assert_eq!(
            mgr.process_round(HouseEdge::NONE, &mut rng).await,
            Err(RoundError::NoActiveRound)
        );
    }

    #[tokio::test]
    async fn test_duplicate_round_number_reports_failures() {
        let (mgr, ledger, rounds) = manager(&[(1, 100)]);
        rounds
            .create_round(3, &DiceRoll::from_dice(1, 2, 3).unwrap())
            .await
            .unwrap();

        mgr.start_new_round(3).await;
        mgr.place_bet(player(1), Side::High, 40).await.unwrap();
        let summary = mgr
            .process_round(HouseEdge::NONE, &mut DeterministicRng::new(2))
            .await
            .unwrap();

        assert!(summary.round_id.is_none());
        assert_eq!(summary.settlement.failures.len(), 1);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 60);

        // The next round still opens normally
        mgr.start_new_round(4).await;
        assert_eq!(mgr.current_round().await.unwrap().status, RoundStatus::Open);
    }

    #[tokio::test]
    async fn test_refund_pool_restores_stakes() {
        let (mgr, ledger, rounds) = manager(&[(1, 1000), (2, 50)]);
        mgr.start_new_round(1).await;
        mgr.place_bet(player(1), Side::High, 200).await.unwrap();
        mgr.place_bet(player(2), Side::Low, 50).await.unwrap();

        assert_eq!(mgr.refund_pool().await, 250);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 1000);
        assert_eq!(ledger.balance(player(2)).await.unwrap(), 50);
        assert_eq!(rounds.last_round_number().await.unwrap(), 0);

        // Betting stays closed and a second refund is a no-op
        assert_eq!(mgr.place_bet(player(1), Side::High, 1).await, Err(BetError::BettingClosed));
        assert_eq!(mgr.refund_pool().await, 0);
    }

    #[tokio::test]
    async fn test_new_round_refunds_unprocessed_pool() {
        let (mgr, ledger, _) = manager(&[(1, 500)]);
        mgr.start_new_round(1).await;
        mgr.place_bet(player(1), Side::Low, 300).await.unwrap();
        mgr.lock_betting().await;

        mgr.start_new_round(2).await;
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 500);
        assert!(mgr.current_round().await.unwrap().pool.is_empty());
    }

    #[tokio::test]
    async fn test_revealed_round_has_nothing_to_refund() {
        let (mgr, ledger, _) = manager(&[(1, 100)]);
        mgr.start_new_round(1).await;
        mgr.place_bet(player(1), Side::High, 100).await.unwrap();
        mgr.process_round_with_roll(DiceRoll::from_dice(1, 1, 1).unwrap()).await.unwrap();

        assert_eq!(mgr.refund_pool().await, 0);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fixed_roll_settles_like_a_draw() {
        let (mgr, ledger, _) = manager(&[(1, 1000)]);
        mgr.start_new_round(1).await;
        mgr.place_bet(player(1), Side::High, 200).await.unwrap();

        let summary = mgr
            .process_round_with_roll(DiceRoll::from_dice(6, 6, 6).unwrap())
            .await
            .unwrap();
        assert_eq!(summary.path, DrawPath::Fixed);
        assert_eq!(summary.roll.total, 18);
        assert_eq!(summary.winners(), 1);
        assert_eq!(ledger.balance(player(1)).await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn test_freeze_blocks_bets_and_exposes_pool() {
        let (mgr, _, _) = manager(&[(1, 100)]);
        let mgr = Arc::new(mgr);
        mgr.start_new_round(1).await;
        mgr.place_bet(player(1), Side::High, 40).await.unwrap();

        let guard = mgr.freeze().await;
        assert_eq!(guard.pending().len(), 1);

        let bet = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.place_bet(player(1), Side::High, 10).await }
        });
        tokio::task::yield_now().await;
        assert!(!bet.is_finished());

        drop(guard);
        assert!(bet.await.unwrap().is_ok());
    }
}
