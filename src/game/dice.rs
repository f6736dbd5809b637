//! Outcome Generator
//!
//! Draws three dice for a round. With probability equal to the house edge,
//! and only when the pool has a strictly heavier side, the draw is steered
//! to the opposite outcome; otherwise the dice are fair.
//!
//! The steered path is uniform over the eight totals of the target range,
//! then uniform over the triples producing that total. It is deliberately
//! not uniform over raw triples.

use std::ops::RangeInclusive;

use serde::{Serialize, Deserialize};

use crate::core::rng::{DeterministicRng, BASIS_POINTS};
use crate::game::state::{PendingWager, Side};

/// Lowest three-dice total.
pub const MIN_TOTAL: u8 = 3;

/// Highest three-dice total.
pub const MAX_TOTAL: u8 = 18;

/// Totals at or above this are `High`.
pub const HIGH_THRESHOLD: u8 = 11;

/// Number of ordered triples for three six-sided dice.
pub const TRIPLE_COUNT: usize = 216;

/// Outcome for a dice total.
#[inline]
pub fn outcome_for_total(total: u8) -> Side {
    if total >= HIGH_THRESHOLD {
        Side::High
    } else {
        Side::Low
    }
}

/// Totals that produce `side`.
pub fn total_range(side: Side) -> RangeInclusive<u8> {
    match side {
        Side::High => HIGH_THRESHOLD..=MAX_TOTAL,
        Side::Low => MIN_TOTAL..=(HIGH_THRESHOLD - 1),
    }
}

/// Every ordered (d1, d2, d3) with faces in 1..=6 summing to `total`.
///
/// Empty for totals outside 3..=18.
pub fn combinations_for_total(total: u8) -> Vec<[u8; 3]> {
    let mut combos = Vec::new();
    for d1 in 1..=6u8 {
        for d2 in 1..=6u8 {
            for d3 in 1..=6u8 {
                if d1 + d2 + d3 == total {
                    combos.push([d1, d2, d3]);
                }
            }
        }
    }
    combos
}

// =============================================================================
// DICE ROLL
// =============================================================================

/// A drawn result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    /// The three faces.
    pub dice: [u8; 3],
    /// Sum of faces, 3..=18.
    pub total: u8,
    /// Outcome derived from the total.
    pub outcome: Side,
}

impl DiceRoll {
    /// Build a roll from three faces. `None` if any face is outside 1..=6.
    pub fn from_dice(d1: u8, d2: u8, d3: u8) -> Option<Self> {
        if ![d1, d2, d3].iter().all(|d| (1..=6).contains(d)) {
            return None;
        }
        let total = d1 + d2 + d3;
        Some(Self {
            dice: [d1, d2, d3],
            total,
            outcome: outcome_for_total(total),
        })
    }
}

// =============================================================================
// HOUSE EDGE
// =============================================================================

/// House edge outside 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("house edge must be between 0 and 100, got {0}")]
pub struct HouseEdgeError(pub f64);

/// Probability that the draw favors the house, in basis points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct HouseEdge(u16);

impl HouseEdge {
    /// Fair dice, never steered.
    pub const NONE: HouseEdge = HouseEdge(0);

    /// Always steered when the pool allows it.
    pub const ALWAYS: HouseEdge = HouseEdge(BASIS_POINTS as u16);

    /// Default used when no setting has been stored.
    pub const DEFAULT: HouseEdge = HouseEdge(4_800);

    /// Build from a percentage (fractions allowed, e.g. 48.5).
    pub fn from_percent(percent: f64) -> Result<Self, HouseEdgeError> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(HouseEdgeError(percent));
        }
        Ok(Self((percent * 100.0).round() as u16))
    }

    /// Percentage value.
    pub fn percent(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Basis points value.
    pub fn basis_points(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for HouseEdge {
    type Error = HouseEdgeError;

    fn try_from(basis_points: u16) -> Result<Self, Self::Error> {
        if basis_points as u32 > BASIS_POINTS {
            return Err(HouseEdgeError(basis_points as f64 / 100.0));
        }
        Ok(Self(basis_points))
    }
}

impl From<HouseEdge> for u16 {
    fn from(edge: HouseEdge) -> Self {
        edge.0
    }
}

impl Default for HouseEdge {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// =============================================================================
// DRAW
// =============================================================================

/// Stake totals per side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeTotals {
    /// Credits staked on high.
    pub high: u64,
    /// Credits staked on low.
    pub low: u64,
}

impl StakeTotals {
    /// Sum stakes per side.
    pub fn from_pool(pool: &[PendingWager]) -> Self {
        pool.iter().fold(Self::default(), |mut totals, wager| {
            match wager.side {
                Side::High => totals.high = totals.high.saturating_add(wager.amount),
                Side::Low => totals.low = totals.low.saturating_add(wager.amount),
            }
            totals
        })
    }

    /// Outcome the house wants: the side opposite the heavier stake.
    /// `None` on an exact tie.
    pub fn house_target(&self) -> Option<Side> {
        use std::cmp::Ordering;
        match self.high.cmp(&self.low) {
            Ordering::Greater => Some(Side::Low),
            Ordering::Less => Some(Side::High),
            Ordering::Equal => None,
        }
    }
}

/// Which path produced a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawPath {
    /// Independent fair dice.
    Fair,
    /// Steered toward the lighter side.
    Biased,
    /// Supplied by the caller instead of drawn.
    Fixed,
}

/// A roll plus the path that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Draw {
    /// The dice.
    pub roll: DiceRoll,
    /// How they were chosen.
    pub path: DrawPath,
}

/// Three independent fair dice.
pub fn roll_fair(rng: &mut DeterministicRng) -> DiceRoll {
    let d1 = rng.roll_die();
    let d2 = rng.roll_die();
    let d3 = rng.roll_die();
    DiceRoll {
        dice: [d1, d2, d3],
        total: d1 + d2 + d3,
        outcome: outcome_for_total(d1 + d2 + d3),
    }
}

/// Dice guaranteed to land on `target`.
///
/// Total is uniform over the target's eight totals; the triple is uniform
/// over all triples for that total.
pub fn roll_for_outcome(target: Side, rng: &mut DeterministicRng) -> DiceRoll {
    let range = total_range(target);
    let total = rng.next_int_range(*range.start() as u32, *range.end() as u32) as u8;
    let combos = combinations_for_total(total);
    // Every total in 3..=18 has at least one triple
    let dice = rng.choose(&combos).copied().unwrap_or([1, 1, 1]);
    DiceRoll {
        dice,
        total,
        outcome: target,
    }
}

/// Draw the result for a round.
pub fn draw(pool: &[PendingWager], edge: HouseEdge, rng: &mut DeterministicRng) -> Draw {
    let favor_house = rng.next_basis_points() < edge.basis_points() as u32;

    if favor_house && !pool.is_empty() {
        if let Some(target) = StakeTotals::from_pool(pool).house_target() {
            return Draw {
                roll: roll_for_outcome(target, rng),
                path: DrawPath::Biased,
            };
        }
    }

    Draw {
        roll: roll_fair(rng),
        path: DrawPath::Fair,
    }
}
