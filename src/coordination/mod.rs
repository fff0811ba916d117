//! Coordination Module
//!
//! Sessions against the coordination service (ZooKeeper in production, an
//! in-process ensemble in tests). A session lists the identity registry, hands
//! out election contenders and reports when the server expires it.

#[cfg(any(test, feature = "testing"))]
mod memory;
mod zookeeper;

#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCoordinator, MemoryEnsemble};
pub use zookeeper::ZooKeeperCoordinator;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::Result;

/// Parent path of all election nodes
pub const ELECTION_ROOT: &str = "/_elections";

/// Prefix of ephemeral sequential vote nodes
pub const VOTE_PREFIX: &str = "_vote_";

/// Result of one vote round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// This contender holds the seat
    Leader,
    /// Another contender holds the seat; we follow it
    Follower,
    /// The election has not settled yet
    Pending,
}

/// Opens sessions against the coordination service
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// Connect to `endpoints`, rooted at `namespace`, failing with
    /// `ConnectTimeout` once `timeout` elapses
    async fn connect(
        &self,
        endpoints: &[String],
        namespace: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Session>>;
}

/// An established coordination session
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Children of `path` parsed as identities. A missing or empty path is an empty set.
    async fn registered_identities(&self, path: &str) -> Result<BTreeSet<u32>>;

    /// Join the election called `election`, publishing `data` with the vote
    async fn contender(&self, election: &str, data: &str) -> Result<Box<dyn Contender>>;

    /// Resolves once the server has expired this session
    async fn expired(&self);

    /// Release the session. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// One participant in a single election
#[async_trait::async_trait]
pub trait Contender: Send + Sync {
    /// Cast (or re-check) this contender's vote
    async fn vote(&mut self) -> Result<VoteOutcome>;

    /// Withdraw from the election. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Path of the election directory for `election`
pub fn election_path(election: &str) -> String {
    format!("{}/{}", ELECTION_ROOT, election)
}

/// Parse registry children into identities, skipping anything that is not a number
pub fn parse_identities<I, S>(children: I) -> BTreeSet<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    children
        .into_iter()
        .filter_map(|child| {
            let child = child.as_ref();
            match child.parse::<u32>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(child, "Ignoring non-numeric broker registration");
                    None
                }
            }
        })
        .collect()
}

/// Sequence number of a vote node (`_vote_<token>-0000000042`)
pub fn vote_sequence(node: &str) -> Option<u64> {
    node.rsplit('-').next().and_then(|seq| seq.parse().ok())
}

/// Decide the outcome for `own` given every vote node in the election.
/// The lowest sequence leads.
pub fn vote_outcome<S: AsRef<str>>(votes: &[S], own: &str) -> VoteOutcome {
    let leader = votes
        .iter()
        .map(|v| v.as_ref())
        .filter_map(|v| vote_sequence(v).map(|seq| (seq, v)))
        .min();

    match leader {
        Some((_, leader)) if leader == own => VoteOutcome::Leader,
        Some(_) if votes.iter().any(|v| v.as_ref() == own) => VoteOutcome::Follower,
        _ => VoteOutcome::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identities_skips_garbage() {
        let ids = parse_identities(["3", "0", "x", "12"]);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 3, 12]);
    }

    #[test]
    fn test_vote_sequence() {
        assert_eq!(vote_sequence("_vote_abc-def-0000000042"), Some(42));
        assert_eq!(vote_sequence("leader"), None);
    }

    #[test]
    fn test_lowest_sequence_leads() {
        let votes = ["_vote_b-0000000007", "_vote_a-0000000003", "_vote_c-0000000009"];
        assert_eq!(vote_outcome(&votes, "_vote_a-0000000003"), VoteOutcome::Leader);
        assert_eq!(vote_outcome(&votes, "_vote_b-0000000007"), VoteOutcome::Follower);
        assert_eq!(vote_outcome(&votes, "_vote_d-0000000001"), VoteOutcome::Pending);
        assert_eq!(vote_outcome::<&str>(&[], "_vote_a-0000000003"), VoteOutcome::Pending);
    }
}
