//! Election campaign for a single broker id

use std::time::Duration;

use rand::Rng;

use super::{next_step, AttemptCounter, Backoff, ElectionState, Step};
use crate::coordination::{Contender, Session, VoteOutcome};
use crate::error::{Error, Result};

/// Drives one broker id to Won, or gives up once the attempt budget is spent.
///
/// The campaign outlives coordination sessions: after a session loss
/// [`reset`](Self::reset) drops the contender and returns to `Idle`, while the
/// broker id and the attempt count carry over to the next [`run`](Self::run).
pub struct ElectionCampaign {
    identity: u32,
    hostname: String,
    state: ElectionState,
    attempts: AttemptCounter,
    backoff: Backoff,
    contender: Option<Box<dyn Contender>>,
}

impl ElectionCampaign {
    /// Create a campaign for `identity` among `broker_count` slots
    pub fn new(identity: u32, broker_count: u32, hostname: String, jitter_unit: Duration) -> Self {
        Self {
            identity,
            hostname,
            state: ElectionState::Idle,
            attempts: AttemptCounter::new(broker_count),
            backoff: Backoff::new(broker_count, jitter_unit),
            contender: None,
        }
    }

    /// Broker id this campaign is for
    pub fn identity(&self) -> u32 {
        self.identity
    }

    /// Current state
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Votes cast so far, across every session
    pub fn attempts(&self) -> u32 {
        self.attempts.count()
    }

    /// Name of the election for this broker id
    pub fn election_name(&self) -> String {
        format!("kafka-{}", self.identity)
    }

    /// Vote until the seat is won or the budget runs out.
    ///
    /// A session loss while voting returns the error untouched and leaves the
    /// campaign `Idle`; the caller reconnects and calls `run` again.
    pub async fn run<R: Rng + Send>(
        &mut self,
        session: &dyn Session,
        rng: &mut R,
    ) -> Result<()> {
        if self.state == ElectionState::Won {
            return Ok(());
        }

        let name = self.election_name();
        if self.contender.is_none() {
            self.contender = Some(session.contender(&name, &self.hostname).await?);
        }
        self.state = ElectionState::Campaigning;

        loop {
            let attempt = self.attempts.increment();
            tracing::info!(
                attempt,
                budget = self.attempts.budget(),
                "Trying to get elected for {}...",
                name
            );

            let contender = self.contender.as_mut().ok_or(Error::SessionClosed)?;
            let outcome = match contender.vote().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.is_session_loss() {
                        self.contender = None;
                        self.state = ElectionState::Idle;
                    }
                    return Err(e);
                }
            };

            self.state = match outcome {
                VoteOutcome::Leader => ElectionState::Won,
                VoteOutcome::Follower => ElectionState::Lost,
                VoteOutcome::Pending => ElectionState::Campaigning,
            };

            match next_step(self.state, &self.attempts) {
                Step::Won => {
                    tracing::info!(attempt, "Won election for {}", name);
                    return Ok(());
                }
                Step::Exhausted => {
                    tracing::error!(
                        attempts = attempt,
                        "Couldn't become broker {}: election budget spent",
                        self.identity
                    );
                    self.withdraw().await;
                    return Err(Error::ElectionExhausted {
                        identity: self.identity,
                        attempts: attempt,
                    });
                }
                Step::Retry => {
                    if self.state == ElectionState::Lost {
                        tracing::info!(attempt, "Lost election for {}", name);
                    }
                    let delay = self.backoff.delay(rng);
                    tracing::debug!(?delay, "Backing off before the next vote");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Forget the current session: withdraw the contender and go back to `Idle`
    pub async fn reset(&mut self) {
        self.withdraw().await;
        self.state = ElectionState::Idle;
    }

    async fn withdraw(&mut self) {
        if let Some(mut contender) = self.contender.take() {
            if let Err(e) = contender.close().await {
                tracing::warn!("Failed to withdraw from election {}: {}", self.election_name(), e);
            }
        }
    }
}
