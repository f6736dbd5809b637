//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON objects tagged by `type`; payload fields are camelCase.
//! Lifecycle broadcasts use [`RoundEvent`](crate::game::events::RoundEvent)
//! directly and share the same tagging.

use serde::{Serialize, Deserialize};

use crate::game::round::{BetError, BetReceipt};
use crate::game::state::{RoundSnapshot, RoundStatus, Side};
use crate::store::{OutcomeStats, PlayerBet, PlayerStats, RoundRecord};

/// Largest stake accepted from the wire (2^53, the last exactly
/// representable JSON integer).
pub const MAX_WIRE_AMOUNT: f64 = 9_007_199_254_740_992.0;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Ask for the current round.
    JoinGame,

    /// Stake credits on a side.
    PlaceBet(BetRequest),

    /// Ask for own balance.
    RequestBalance,

    /// Ask for the latest finished rounds.
    #[serde(rename_all = "camelCase")]
    RecentRounds {
        /// Rounds to return.
        #[serde(default = "default_page")]
        limit: usize,
    },

    /// Ask for own betting history.
    #[serde(rename_all = "camelCase")]
    History {
        /// Entries to return.
        #[serde(default = "default_page")]
        limit: usize,
        /// Entries to skip.
        #[serde(default)]
        offset: usize,
    },

    /// Ask for own lifetime statistics.
    Stats,

    /// Ask for per-outcome statistics over recent rounds.
    #[serde(rename_all = "camelCase")]
    OutcomeStats {
        /// Window size in rounds.
        #[serde(default = "default_window")]
        last_n: usize,
    },

    /// Ask for the richest players.
    #[serde(rename_all = "camelCase")]
    Leaderboard {
        /// Entries to return.
        #[serde(default = "default_page")]
        limit: usize,
    },

    /// Admin: change the house edge.
    #[serde(rename_all = "camelCase")]
    SetHouseEdge {
        /// New value, 0-100.
        percent: f64,
    },

    /// Admin: toggle maintenance mode.
    #[serde(rename_all = "camelCase")]
    SetMaintenance {
        /// On or off.
        enabled: bool,
    },

    /// Admin: overwrite a player's balance.
    #[serde(rename_all = "camelCase")]
    SetBalance {
        /// Target player (UUID string).
        player_ref: String,
        /// New balance.
        coins: u64,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

fn default_page() -> usize {
    20
}

fn default_window() -> usize {
    100
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// JWT issued by the external auth provider.
    pub token: String,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: String,
}

/// Bet request as sent by the client.
///
/// Fields are loosely typed so malformed input can be answered with the
/// matching bet error instead of a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRequest {
    /// "high"/"low" (or "tai"/"xiu").
    pub side: String,
    /// Stake; must be a positive whole number.
    pub amount: f64,
}

impl BetRequest {
    /// Check side, then amount.
    pub fn validate(&self) -> Result<(Side, u64), BetError> {
        let side: Side = self.side.parse()?;

        let amount = self.amount;
        if !amount.is_finite() || amount <= 0.0 || amount.fract() != 0.0 || amount > MAX_WIRE_AMOUNT {
            return Err(BetError::InvalidAmount);
        }

        Ok((side, amount as u64))
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Replies sent to a single client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Current round, in reply to `join_game`.
    CurrentRound(CurrentRoundInfo),

    /// Bet accepted.
    BetSuccess(BetSuccess),

    /// Bet refused.
    BetError {
        /// Human-readable reason.
        error: String,
    },

    /// Own balance.
    BalanceUpdate {
        /// Credits held.
        coins: u64,
    },

    /// Latest finished rounds, newest first.
    RecentRounds {
        /// Rounds.
        rounds: Vec<RoundView>,
    },

    /// Own betting history, newest first.
    History {
        /// Bets.
        bets: Vec<BetView>,
    },

    /// Own lifetime statistics.
    Stats(PlayerStats),

    /// Per-outcome statistics.
    OutcomeStats {
        /// One entry per outcome.
        outcomes: Vec<OutcomeStats>,
    },

    /// Richest players.
    Leaderboard {
        /// Entries, highest first.
        entries: Vec<LeaderboardEntry>,
    },

    /// Settings after an admin change.
    #[serde(rename_all = "camelCase")]
    Settings {
        /// House edge percent.
        house_edge: f64,
        /// Maintenance mode flag.
        maintenance: bool,
    },

    /// Pong response.
    #[serde(rename_all = "camelCase")]
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix ms).
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Player id (UUID string) if successful.
    pub player_ref: Option<String>,
    /// Balance if successful.
    pub coins: Option<u64>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Current round summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRoundInfo {
    /// Round number, `None` before the first round.
    pub round_number: Option<u64>,
    /// Round status.
    pub status: Option<RoundStatus>,
    /// Ticks left to bet.
    pub time_left: u32,
    /// Wagers in the pool.
    pub bet_count: usize,
    /// Credits staked on high.
    pub total_high: u64,
    /// Credits staked on low.
    pub total_low: u64,
}

impl CurrentRoundInfo {
    /// Build from an optional snapshot.
    pub fn from_snapshot(snapshot: Option<&RoundSnapshot>) -> Self {
        match snapshot {
            Some(round) => {
                let total = |side: Side| {
                    round
                        .pool
                        .iter()
                        .filter(|w| w.side == side)
                        .map(|w| w.amount)
                        .sum()
                };
                Self {
                    round_number: Some(round.round_number),
                    status: Some(round.status),
                    time_left: round.time_left,
                    bet_count: round.pool.len(),
                    total_high: total(Side::High),
                    total_low: total(Side::Low),
                }
            }
            None => Self {
                round_number: None,
                status: None,
                time_left: 0,
                bet_count: 0,
                total_high: 0,
                total_low: 0,
            },
        }
    }
}

/// Accepted bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSuccess {
    /// Round joined.
    pub round_number: u64,
    /// Chosen side.
    pub side: Side,
    /// Stake.
    pub amount: u64,
    /// Balance after deduction.
    pub new_balance: u64,
}

impl From<BetReceipt> for BetSuccess {
    fn from(receipt: BetReceipt) -> Self {
        Self {
            round_number: receipt.round_number,
            side: receipt.side,
            amount: receipt.amount,
            new_balance: receipt.new_balance,
        }
    }
}

/// A finished round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundView {
    /// Round number.
    pub round_number: u64,
    /// First die.
    pub dice1: u8,
    /// Second die.
    pub dice2: u8,
    /// Third die.
    pub dice3: u8,
    /// Sum.
    pub total: u8,
    /// Winning side.
    pub result: Side,
    /// When it was recorded (RFC 3339).
    pub created_at: String,
}

impl From<&RoundRecord> for RoundView {
    fn from(record: &RoundRecord) -> Self {
        let [dice1, dice2, dice3] = record.dice;
        Self {
            round_number: record.round_number,
            dice1,
            dice2,
            dice3,
            total: record.total,
            result: record.outcome,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

/// One of the player's bets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetView {
    /// Round number.
    pub round_number: u64,
    /// Chosen side.
    pub side: Side,
    /// Stake.
    pub amount: u64,
    /// `None` until settled.
    pub win: Option<bool>,
    /// Round total.
    pub total: u8,
    /// Round outcome.
    pub result: Side,
}

impl From<&PlayerBet> for BetView {
    fn from(bet: &PlayerBet) -> Self {
        Self {
            round_number: bet.round.round_number,
            side: bet.wager.side,
            amount: bet.wager.amount,
            win: bet.wager.win,
            total: bet.round.total,
            result: bet.round.outcome,
        }
    }
}

/// Leaderboard line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// Player (UUID string).
    pub player_ref: String,
    /// Balance.
    pub coins: u64,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input.
    InvalidInput,
    /// Admin rights required.
    Forbidden,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Shorthand for an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_place_bet_parsing() {
        let msg = ClientMessage::from_json(r#"{"type":"place_bet","side":"tai","amount":200}"#).unwrap();
        let ClientMessage::PlaceBet(req) = msg else {
            panic!("Wrong message type");
        };
        assert_eq!(req.validate().unwrap(), (Side::High, 200));
    }

    #[test]
    fn test_bet_validation_order() {
        let bad_both = BetRequest { side: "middle".into(), amount: -1.0 };
        assert!(matches!(bad_both.validate(), Err(BetError::InvalidSide(_))));

        for amount in [0.0, -5.0, 10.5, f64::NAN, f64::INFINITY, 1e300] {
            let req = BetRequest { side: "low".into(), amount };
            assert_eq!(req.validate(), Err(BetError::InvalidAmount), "amount {}", amount);
        }
    }

    #[test]
    fn test_defaults_for_paged_requests() {
        let msg = ClientMessage::from_json(r#"{"type":"history"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::History { limit: 20, offset: 0 }));

        let msg = ClientMessage::from_json(r#"{"type":"outcome_stats","lastN":10}"#).unwrap();
        assert!(matches!(msg, ClientMessage::OutcomeStats { last_n: 10 }));
    }

    #[test]
    fn test_bet_success_wire_format() {
        let msg = ServerMessage::BetSuccess(BetSuccess {
            round_number: 3,
            side: Side::High,
            amount: 200,
            new_balance: 800,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({
            "type": "bet_success",
            "roundNumber": 3,
            "side": "high",
            "amount": 200,
            "newBalance": 800,
        }));
    }

    #[test]
    fn test_bet_error_and_balance_wire_format() {
        let msg = ServerMessage::BetError { error: BetError::InsufficientFunds.to_string() };
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"bet_error","error":"Insufficient balance"}"#);

        let msg = ServerMessage::BalanceUpdate { coins: 1200 };
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"balance_update","coins":1200}"#);
    }

    #[test]
    fn test_current_round_totals() {
        use crate::game::state::{PendingWager, PlayerId};

        let snapshot = RoundSnapshot {
            round_number: 9,
            status: RoundStatus::Open,
            time_left: 12,
            created_at: chrono::Utc::now(),
            pool: vec![
                PendingWager::new(PlayerId::new([1; 16]), Side::High, 300),
                PendingWager::new(PlayerId::new([2; 16]), Side::Low, 100),
                PendingWager::new(PlayerId::new([3; 16]), Side::High, 50),
            ],
        };

        let info = CurrentRoundInfo::from_snapshot(Some(&snapshot));
        assert_eq!(info.round_number, Some(9));
        assert_eq!(info.bet_count, 3);
        assert_eq!(info.total_high, 350);
        assert_eq!(info.total_low, 100);

        let empty = CurrentRoundInfo::from_snapshot(None);
        assert!(empty.round_number.is_none());
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::error(ErrorCode::AuthFailed, "Invalid token");
        let json = msg.to_json().unwrap();
        assert!(json.contains("auth_failed"));
        assert!(ServerMessage::from_json(&json).is_ok());
    }
}
