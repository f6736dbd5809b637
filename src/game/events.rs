//! Round Events
//!
//! Lifecycle notifications fanned out to every connected client.
//! Field names are camelCase on the wire.

use serde::{Serialize, Deserialize};

use crate::game::dice::DiceRoll;
use crate::game::state::{PlayerId, RoundStatus, Side};

/// Event broadcast to all clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    /// A round opened for betting.
    #[serde(rename_all = "camelCase")]
    RoundStart {
        /// Round number.
        round_number: u64,
        /// Always `open`.
        status: RoundStatus,
        /// Betting window in ticks.
        time_left: u32,
    },

    /// Countdown moved; negative while locked.
    #[serde(rename_all = "camelCase")]
    TimerUpdate {
        /// Ticks until lock.
        time_left: i32,
    },

    /// Bets are no longer accepted.
    BettingLocked,

    /// Dice animation started.
    DiceRolling,

    /// Result of the round.
    #[serde(rename_all = "camelCase")]
    RoundResult {
        /// Round number.
        round_number: u64,
        /// First die.
        dice1: u8,
        /// Second die.
        dice2: u8,
        /// Third die.
        dice3: u8,
        /// Sum of dice.
        total: u8,
        /// Winning side.
        result: Side,
    },

    /// Balances changed; clients should refresh theirs.
    BalanceUpdateAll,

    /// Someone placed a bet.
    #[serde(rename_all = "camelCase")]
    BetPlaced {
        /// Player who bet (UUID string).
        player_ref: String,
        /// Chosen side.
        side: Side,
        /// Stake.
        amount: u64,
    },
}

impl RoundEvent {
    /// Create round start event.
    pub fn round_start(round_number: u64, time_left: u32) -> Self {
        Self::RoundStart {
            round_number,
            status: RoundStatus::Open,
            time_left,
        }
    }

    /// Create round result event.
    pub fn round_result(round_number: u64, roll: &DiceRoll) -> Self {
        let [dice1, dice2, dice3] = roll.dice;
        Self::RoundResult {
            round_number,
            dice1,
            dice2,
            dice3,
            total: roll.total,
            result: roll.outcome,
        }
    }

    /// Create bet placed event.
    pub fn bet_placed(player: PlayerId, side: Side, amount: u64) -> Self {
        Self::BetPlaced {
            player_ref: player.to_uuid_string(),
            side,
            amount,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundStart { .. } => "round_start",
            Self::TimerUpdate { .. } => "timer_update",
            Self::BettingLocked => "betting_locked",
            Self::DiceRolling => "dice_rolling",
            Self::RoundResult { .. } => "round_result",
            Self::BalanceUpdateAll => "balance_update_all",
            Self::BetPlaced { .. } => "bet_placed",
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
