//! # Dice Round Server
//!
//! Authoritative engine for a continuously repeating high/low dice round:
//! players stake credits on "high" (total 11-18) or "low" (total 3-10)
//! before a deadline, three dice are drawn and every wager is settled.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DICE ROUND SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  └── rng.rs      - Seedable Xorshift128+ PRNG                │
//! │                                                              │
//! │  game/           - Round logic                               │
//! │  ├── state.rs    - Players, sides, wagers                    │
//! │  ├── dice.rs     - Outcome generator (fair / house-biased)   │
//! │  ├── settlement.rs - Win/lose decisions and payouts          │
//! │  ├── round.rs    - Round manager (current round + pool)      │
//! │  ├── clock.rs    - Phase state machine                       │
//! │  └── events.rs   - Broadcast events                          │
//! │                                                              │
//! │  engine.rs       - Timer driver and command entry point      │
//! │                                                              │
//! │  store/          - Storage contracts + in-memory backend     │
//! │  ├── ledger.rs   - Balances (conditional deduct)             │
//! │  ├── rounds.rs   - Rounds, wagers, history, statistics       │
//! │  ├── settings.rs - House edge, maintenance                   │
//! │  └── snapshot.rs - Bincode save/load                         │
//! │                                                              │
//! │  network/        - WebSocket front end                       │
//! │  ├── server.rs   - Connections and event fan-out             │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Round Timing
//!
//! One tick per second. Betting is open for 15 ticks, locked for 5, the
//! dice roll for 2, and the result is shown for 3 before the next round.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod store;
pub mod engine;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::state::{PlayerId, Side, RoundStatus};
pub use game::dice::{DiceRoll, HouseEdge};
pub use game::round::{BetError, BetReceipt, RoundError};
pub use game::events::RoundEvent;
pub use engine::{GameEngine, EngineConfig, EngineError, Stores};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Length of one tick in milliseconds.
pub const TICK_INTERVAL_MS: u64 = 1000;

/// Ticks bets are accepted.
pub const BETTING_WINDOW_TICKS: u32 = 15;

/// Ticks between betting lock and the dice roll.
pub const LOCK_TICKS: u32 = 5;

/// Ticks of dice animation before the result.
pub const REVEAL_TICKS: u32 = 2;

/// Ticks between the result and the next round.
pub const COOLDOWN_TICKS: u32 = 3;

/// Credits given to a newly opened account.
pub const DEFAULT_STARTING_BALANCE: u64 = 1000;
