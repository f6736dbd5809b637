//! Seedable Random Number Generator
//!
//! Uses Xorshift128+ for fast, high-quality randomness.
//! Given the same seed, produces the identical sequence on all platforms,
//! which lets tests and replays pin every dice draw.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Number of faces on a die.
pub const DIE_FACES: u32 = 6;

/// Basis points in 100%.
pub const BASIS_POINTS: u32 = 10_000;

/// Seedable PRNG using the Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use dice_round::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Xorshift must never run on an all-zero state
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG seeded from process entropy.
    ///
    /// Used by the live engine; tests construct with [`DeterministicRng::new`].
    pub fn from_entropy() -> Self {
        Self::new(entropy_seed())
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random u32.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    /// Generate a random integer in range [0, max).
    ///
    /// Rejection sampling keeps every value in range exactly equally likely.
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        let max = max as u64;
        // 2^64 mod max: values below this would over-represent low residues
        let threshold = max.wrapping_neg() % max;
        loop {
            let x = self.next_u64();
            if x >= threshold {
                return (x % max) as u32;
            }
        }
    }

    /// Generate a random integer in range [min, max].
    #[inline]
    pub fn next_int_range(&mut self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        min + self.next_int(max - min + 1)
    }

    /// Roll a single fair die: 1..=6.
    #[inline]
    pub fn roll_die(&mut self) -> u8 {
        self.next_int_range(1, DIE_FACES) as u8
    }

    /// Draw a uniform value in [0, 10000) basis points.
    #[inline]
    pub fn next_basis_points(&mut self) -> u32 {
        self.next_int(BASIS_POINTS)
    }

    /// Select a random element from a slice.
    pub fn choose<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        if slice.is_empty() {
            None
        } else {
            let idx = self.next_int(slice.len() as u32) as usize;
            Some(&slice[idx])
        }
    }

    /// Get current state (for checkpointing/debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from saved state.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a fresh 64-bit seed from OS randomness and the wall clock.
///
/// A v4 UUID carries 122 bits from the OS generator; the timestamp only
/// separates two processes that somehow drew the same UUID.
pub fn entropy_seed() -> u64 {
    let nonce = uuid::Uuid::new_v4();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"DICE_ROUND_SEED_V1");
    hasher.update(nonce.as_bytes());
    hasher.update(nanos.to_le_bytes());

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
