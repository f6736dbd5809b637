//! Storage Contracts
//!
//! Async traits the engine persists through, plus in-memory
//! implementations and a bincode snapshot of their contents.
//!
//! ## Module Structure
//!
//! - `ledger`: player balances with conditional deduction
//! - `rounds`: finalized rounds, wagers, history and statistics
//! - `settings`: house edge and maintenance flag
//! - `snapshot`: save/load of the in-memory stores

pub mod ledger;
pub mod rounds;
pub mod settings;
pub mod snapshot;

pub use ledger::{BalanceLedger, MemoryLedger};
pub use rounds::{
    RoundStore, MemoryRoundStore, RoundId, WagerId, RoundRecord, WagerRecord,
    PlayerBet, PlayerStats, OutcomeStats,
};
pub use settings::{SettingsStore, MemorySettings, HouseEdgeConfig, SettingsError};
pub use snapshot::{StoreSnapshot, SnapshotError};

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No account exists for the player.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// A round with this number was already recorded.
    #[error("round {0} already recorded")]
    DuplicateRound(u64),

    /// Round id does not exist.
    #[error("round id {0} not found")]
    RoundNotFound(RoundId),

    /// Wager id does not exist.
    #[error("wager {0} not found")]
    WagerNotFound(WagerId),

    /// Crediting would overflow the balance.
    #[error("balance overflow for account {0}")]
    Overflow(String),

    /// Backend could not serve the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
