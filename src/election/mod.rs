//! Broker Id Election
//!
//! A campaign races other runners for one broker id through the coordination
//! service's election primitive. Every vote counts against a budget of
//! `3 × broker_count` attempts that lasts for the whole process, reconnects
//! included; between votes the campaign sleeps a random slice of
//! `[0, broker_count)` jitter units so contenders don't retry in lockstep.

mod campaign;

pub use campaign::ElectionCampaign;

use std::time::Duration;

use rand::Rng;

/// Vote attempts allowed per broker slot
pub const ATTEMPTS_PER_BROKER: u32 = 3;

/// Campaign state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not registered as a contender
    Idle,
    /// Vote cast, no verdict yet
    Campaigning,
    /// This runner owns the broker id
    Won,
    /// Another runner owns the broker id
    Lost,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "IDLE"),
            ElectionState::Campaigning => write!(f, "CAMPAIGNING"),
            ElectionState::Won => write!(f, "WON"),
            ElectionState::Lost => write!(f, "LOST"),
        }
    }
}

/// What the campaign does after a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stop: the seat is ours
    Won,
    /// Back off and vote again
    Retry,
    /// Budget spent: give up
    Exhausted,
}

/// Vote attempts over the lifetime of the process. Never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounter {
    attempts: u32,
    budget: u32,
}

impl AttemptCounter {
    /// Counter with a budget of `3 × broker_count`
    pub fn new(broker_count: u32) -> Self {
        Self {
            attempts: 0,
            budget: broker_count.saturating_mul(ATTEMPTS_PER_BROKER),
        }
    }

    /// Record one vote and return the new count
    pub fn increment(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Votes so far
    pub fn count(&self) -> u32 {
        self.attempts
    }

    /// Votes allowed before giving up
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// True once the count has gone past the budget
    pub fn exceeded(&self) -> bool {
        self.attempts > self.budget
    }
}

/// Transition taken after a vote left the campaign in `state`
pub fn next_step(state: ElectionState, attempts: &AttemptCounter) -> Step {
    match state {
        ElectionState::Won => Step::Won,
        _ if attempts.exceeded() => Step::Exhausted,
        _ => Step::Retry,
    }
}

/// Jittered pause between votes
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    broker_count: u32,
    unit: Duration,
}

impl Backoff {
    /// Backoff drawing from `[0, broker_count)` units
    pub fn new(broker_count: u32, unit: Duration) -> Self {
        Self { broker_count, unit }
    }

    /// Draw the next pause
    pub fn delay<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.broker_count == 0 {
            return Duration::ZERO;
        }
        let units = rng.gen_range(0.0..f64::from(self.broker_count));
        self.unit.mul_f64(units)
    }

    /// Upper bound (exclusive) of any pause
    pub fn max_delay(&self) -> Duration {
        self.unit * self.broker_count
    }
}
