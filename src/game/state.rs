//! Round State Definitions
//!
//! Identity, wager and round-status types shared by the engine,
//! the stores and the wire protocol.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::game::round::BetError;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique player identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

// =============================================================================
// SIDE
// =============================================================================

/// The two mutually exclusive outcomes, split at dice-sum 11.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Total 11..=18 ("tai").
    #[serde(alias = "tai")]
    High,
    /// Total 3..=10 ("xiu").
    #[serde(alias = "xiu")]
    Low,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Self {
        match self {
            Side::High => Side::Low,
            Side::Low => Side::High,
        }
    }

    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::High => "high",
            Side::Low => "low",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = BetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "tai" => Ok(Side::High),
            "low" | "xiu" => Ok(Side::Low),
            _ => Err(BetError::InvalidSide(s.to_string())),
        }
    }
}

// =============================================================================
// ROUND STATUS
// =============================================================================

/// Status of the current round record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Accepting bets.
    Open,
    /// Betting closed, result not drawn yet.
    Locked,
    /// Result drawn and settled.
    Revealed,
}

impl RoundStatus {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Open => "open",
            RoundStatus::Locked => "locked",
            RoundStatus::Revealed => "revealed",
        }
    }
}

// =============================================================================
// WAGERS
// =============================================================================

/// A wager intent held in the betting pool until reveal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWager {
    /// Owning player.
    pub player_id: PlayerId,
    /// Chosen side.
    pub side: Side,
    /// Staked credits (already deducted from the player's balance).
    pub amount: u64,
    /// When the stake was accepted.
    pub placed_at: DateTime<Utc>,
}

impl PendingWager {
    /// Create a wager stamped with the current time.
    pub fn new(player_id: PlayerId, side: Side, amount: u64) -> Self {
        Self {
            player_id,
            side,
            amount,
            placed_at: Utc::now(),
        }
    }
}

/// Read-only view of the current round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Round number.
    pub round_number: u64,
    /// Current status.
    pub status: RoundStatus,
    /// Ticks left in the betting window (0 once locked).
    pub time_left: u32,
    /// When the round opened.
    pub created_at: DateTime<Utc>,
    /// Pending wagers in acceptance order.
    pub pool: Vec<PendingWager>,
}
