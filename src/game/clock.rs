//! Round Clock
//!
//! Phase state machine for the round lifecycle. Each call to
//! [`RoundClock::tick`] advances one time unit and returns the actions the
//! engine must perform, in order. The clock does no I/O, so a full cycle can
//! be simulated by calling `tick` in a loop.
//!
//! ```text
//!   start ──► Open(15) ──► Locked(5) ──► Revealing(2) ──► Cooldown(3) ──┐
//!               ▲                                                      │
//!               └──────────────────── next round ◄─────────────────────┘
//! ```
//!
//! The displayed countdown keeps running through the lock window, so
//! `timer_update` reports 14..0 while open and -1..-5 while locked.

use serde::{Serialize, Deserialize};

use crate::{BETTING_WINDOW_TICKS, COOLDOWN_TICKS, LOCK_TICKS, REVEAL_TICKS};

/// Phase durations in ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTimings {
    /// Ticks bets are accepted.
    pub betting: u32,
    /// Ticks between lock and the dice roll.
    pub lock: u32,
    /// Ticks of roll animation before the reveal.
    pub reveal: u32,
    /// Ticks between reveal and the next round.
    pub cooldown: u32,
}

impl Default for RoundTimings {
    fn default() -> Self {
        Self {
            betting: BETTING_WINDOW_TICKS,
            lock: LOCK_TICKS,
            reveal: REVEAL_TICKS,
            cooldown: COOLDOWN_TICKS,
        }
    }
}

impl RoundTimings {
    /// Same timings with every phase at least one tick long.
    pub fn sanitized(self) -> Self {
        Self {
            betting: self.betting.max(1),
            lock: self.lock.max(1),
            reveal: self.reveal.max(1),
            cooldown: self.cooldown.max(1),
        }
    }

    /// Ticks in one full cycle.
    pub fn cycle_len(&self) -> u32 {
        self.betting + self.lock + self.reveal + self.cooldown
    }
}

/// Clock phase with ticks remaining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ClockPhase {
    /// Not started or stopped.
    Stopped,
    /// Bets accepted.
    Open {
        /// Ticks until lock.
        remaining: u32,
    },
    /// Bets refused, waiting for the roll.
    Locked {
        /// Ticks until the roll.
        remaining: u32,
    },
    /// Dice rolling.
    Revealing {
        /// Ticks until the result.
        remaining: u32,
    },
    /// Result shown.
    Cooldown {
        /// Ticks until the next round.
        remaining: u32,
    },
}

/// Work the engine performs for a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockAction {
    /// Open a new round.
    StartRound {
        /// Round to open.
        round_number: u64,
        /// Betting window length.
        time_left: u32,
    },
    /// Countdown moved.
    TimerUpdate {
        /// Ticks until lock; negative once locked.
        time_left: i32,
    },
    /// Close betting.
    LockBetting,
    /// Tell clients the dice are rolling.
    RollDice,
    /// Draw, settle and publish the result.
    Reveal,
}

/// The round lifecycle state machine.
#[derive(Clone, Debug)]
pub struct RoundClock {
    timings: RoundTimings,
    phase: ClockPhase,
    round_number: u64,
    time_left: i32,
}

impl RoundClock {
    /// Create a stopped clock.
    pub fn new(timings: RoundTimings) -> Self {
        Self {
            timings: timings.sanitized(),
            phase: ClockPhase::Stopped,
            round_number: 0,
            time_left: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    /// Round the clock is driving (0 before start).
    pub fn round_number(&self) -> u64 {
        self.round_number
    }

    /// Phase durations.
    pub fn timings(&self) -> RoundTimings {
        self.timings
    }

    /// Whether the clock is running.
    pub fn is_running(&self) -> bool {
        self.phase != ClockPhase::Stopped
    }

    /// Begin at `first_round`. No-op if already running.
    pub fn start(&mut self, first_round: u64) -> Vec<ClockAction> {
        if self.is_running() {
            return Vec::new();
        }
        self.round_number = first_round;
        vec![self.open_round()]
    }

    /// Stop. Returns `false` if already stopped.
    pub fn stop(&mut self) -> bool {
        let was_running = self.is_running();
        self.phase = ClockPhase::Stopped;
        was_running
    }

    /// Advance one tick.
    pub fn tick(&mut self) -> Vec<ClockAction> {
        let mut actions = Vec::new();

        match self.phase {
            ClockPhase::Stopped => {}

            ClockPhase::Open { remaining } => {
                let remaining = remaining.saturating_sub(1);
                self.time_left -= 1;
                actions.push(ClockAction::TimerUpdate { time_left: self.time_left });

                if remaining == 0 {
                    self.phase = ClockPhase::Locked { remaining: self.timings.lock };
                    actions.push(ClockAction::LockBetting);
                } else {
                    self.phase = ClockPhase::Open { remaining };
                }
            }

            ClockPhase::Locked { remaining } => {
                let remaining = remaining.saturating_sub(1);
                self.time_left -= 1;
                actions.push(ClockAction::TimerUpdate { time_left: self.time_left });

                if remaining == 0 {
                    self.phase = ClockPhase::Revealing { remaining: self.timings.reveal };
                    actions.push(ClockAction::RollDice);
                } else {
                    self.phase = ClockPhase::Locked { remaining };
                }
            }

            ClockPhase::Revealing { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.phase = ClockPhase::Cooldown { remaining: self.timings.cooldown };
                    actions.push(ClockAction::Reveal);
                } else {
                    self.phase = ClockPhase::Revealing { remaining };
                }
            }

            ClockPhase::Cooldown { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.round_number += 1;
                    actions.push(self.open_round());
                } else {
                    self.phase = ClockPhase::Cooldown { remaining };
                }
            }
        }

        actions
    }

    fn open_round(&mut self) -> ClockAction {
        self.phase = ClockPhase::Open { remaining: self.timings.betting };
        self.time_left = self.timings.betting as i32;
        ClockAction::StartRound {
            round_number: self.round_number,
            time_left: self.timings.betting,
        }
    }
}
