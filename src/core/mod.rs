//! Core primitives.
//!
//! Seedable randomness shared by the outcome generator and tests.

pub mod rng;

// Re-export core types
pub use rng::{DeterministicRng, entropy_seed};
