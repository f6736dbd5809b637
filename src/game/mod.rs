//! Game Logic Module
//!
//! Round lifecycle, outcome generation and settlement.
//!
//! ## Module Structure
//!
//! - `state`: player ids, sides, wagers, round snapshots
//! - `dice`: outcome generator (fair and house-biased draws)
//! - `settlement`: win/lose decisions and their application
//! - `round`: round manager, the sole writer of round state
//! - `clock`: phase state machine driven by ticks
//! - `events`: broadcast notifications

pub mod state;
pub mod dice;
pub mod settlement;
pub mod round;
pub mod clock;
pub mod events;

// Re-export key types
pub use state::{PlayerId, Side, RoundStatus, PendingWager, RoundSnapshot};
pub use dice::{DiceRoll, HouseEdge, HouseEdgeError, DrawPath};
pub use round::{RoundManager, BetError, RoundError, BetReceipt, RoundSummary};
pub use clock::{RoundClock, RoundTimings, ClockPhase, ClockAction};
pub use events::RoundEvent;
