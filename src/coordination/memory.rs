//! In-process coordination ensemble
//!
//! Mirrors the ZooKeeper semantics the runner depends on: ephemeral nodes bound
//! to a session, sequential vote nodes where the lowest sequence leads, and
//! session expiry that drops every ephemeral node the session owned. Tests drive
//! expiry and unreachability by hand.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use super::{
    election_path, parse_identities, vote_outcome, Contender, Coordinator, Session, VoteOutcome,
    VOTE_PREFIX,
};
use crate::error::{Error, Result};

/// A stored node
#[derive(Debug, Clone)]
struct Node {
    data: String,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

#[derive(Default)]
struct EnsembleState {
    next_session: u64,
    next_sequence: u64,
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, watch::Sender<bool>>,
    expired: HashSet<u64>,
    unreachable: bool,
    connects: u32,
}

impl EnsembleState {
    fn check_session(&self, id: u64) -> Result<()> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else if self.expired.contains(&id) {
            Err(Error::SessionExpired)
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let rest = &path[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn drop_ephemerals(&mut self, session: u64) {
        self.nodes.retain(|_, node| node.owner != Some(session));
    }
}

/// Shared in-memory ensemble. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    /// Create an empty ensemble
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a persistent node at `path` (absolute, including any namespace)
    pub fn create_persistent(&self, path: &str, data: &str) {
        self.lock().nodes.insert(
            path.to_string(),
            Node {
                data: data.to_string(),
                owner: None,
            },
        );
    }

    /// Register a broker id the way a running broker would
    pub fn register_identity(&self, namespace: &str, registry: &str, id: u32) {
        self.create_persistent(&format!("{}{}/{}", namespace, registry, id), "");
    }

    /// Add a vote that nobody will ever withdraw, as a stale registration would
    pub fn add_stale_vote(&self, namespace: &str, election: &str, data: &str) -> String {
        let mut state = self.lock();
        let seq = state.next_sequence;
        state.next_sequence += 1;
        let name = format!("{}stale-{:010}", VOTE_PREFIX, seq);
        state.nodes.insert(
            format!("{}{}/{}", namespace, election_path(election), name),
            Node {
                data: data.to_string(),
                owner: None,
            },
        );
        name
    }

    /// Names of the direct children of `path`
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children(path)
    }

    /// Data stored at `path`
    pub fn data(&self, path: &str) -> Option<String> {
        self.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Expire one session: its ephemeral nodes vanish and its holder is notified
    pub fn expire_session(&self, id: u64) {
        let mut state = self.lock();
        if let Some(notifier) = state.sessions.remove(&id) {
            state.drop_ephemerals(id);
            state.expired.insert(id);
            let _ = notifier.send(true);
            tracing::debug!(session = id, "Expired in-memory session");
        }
    }

    /// Expire every live session
    pub fn expire_all(&self) {
        let ids: Vec<u64> = self.lock().sessions.keys().copied().collect();
        for id in ids {
            self.expire_session(id);
        }
    }

    /// Make new connections fail (or succeed again)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Ids of the live sessions
    pub fn live_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    fn open_session(&self) -> (u64, watch::Receiver<bool>) {
        let mut state = self.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.connects += 1;
        let (tx, rx) = watch::channel(false);
        state.sessions.insert(id, tx);
        (id, rx)
    }

    fn close_session(&self, id: u64) {
        let mut state = self.lock();
        if state.sessions.remove(&id).is_some() {
            state.drop_ephemerals(id);
        }
    }
}

/// Coordinator backed by a [`MemoryEnsemble`]
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
}

impl MemoryCoordinator {
    /// Create a coordinator for `ensemble`
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self { ensemble }
    }

    /// The ensemble this coordinator connects to
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn connect(
        &self,
        endpoints: &[String],
        namespace: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Session>> {
        if self.ensemble.lock().unreachable {
            tokio::time::sleep(timeout).await;
            return Err(Error::ConnectTimeout {
                endpoints: endpoints.join(","),
                timeout,
            });
        }

        let (id, expired) = self.ensemble.open_session();
        tracing::debug!(session = id, namespace, "Opened in-memory session");

        Ok(Box::new(MemorySession {
            ensemble: self.ensemble.clone(),
            id,
            namespace: namespace.to_string(),
            expired,
            closed: false,
        }))
    }
}

/// Session against a [`MemoryEnsemble`]
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: u64,
    namespace: String,
    expired: watch::Receiver<bool>,
    closed: bool,
}

impl MemorySession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.ensemble.close_session(self.id);
        }
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn registered_identities(&self, path: &str) -> Result<BTreeSet<u32>> {
        let state = self.ensemble.lock();
        state.check_session(self.id)?;
        let children = state.children(&format!("{}{}", self.namespace, path));
        Ok(parse_identities(children))
    }

    async fn contender(&self, election: &str, data: &str) -> Result<Box<dyn Contender>> {
        self.ensemble.lock().check_session(self.id)?;
        Ok(Box::new(MemoryContender {
            ensemble: self.ensemble.clone(),
            session: self.id,
            dir: format!("{}{}", self.namespace, election_path(election)),
            data: data.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            node: None,
        }))
    }

    async fn expired(&self) {
        let mut expired = self.expired.clone();
        let observed = expired.wait_for(|e| *e).await.map(|_| ());
        if observed.is_err() {
            // Closed locally: it can no longer expire.
            std::future::pending::<()>().await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Contender in a [`MemoryEnsemble`] election
pub struct MemoryContender {
    ensemble: MemoryEnsemble,
    session: u64,
    dir: String,
    data: String,
    token: String,
    node: Option<String>,
}

impl MemoryContender {
    fn release(&mut self) {
        if let Some(node) = self.node.take() {
            let mut state = self.ensemble.lock();
            let path = format!("{}/{}", self.dir, node);
            if state.nodes.get(&path).map(|n| n.owner) == Some(Some(self.session)) {
                state.nodes.remove(&path);
            }
        }
    }
}

#[async_trait::async_trait]
impl Contender for MemoryContender {
    async fn vote(&mut self) -> Result<VoteOutcome> {
        let mut state = self.ensemble.lock();
        state.check_session(self.session)?;

        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let seq = state.next_sequence;
                state.next_sequence += 1;
                let node = format!("{}{}-{:010}", VOTE_PREFIX, self.token, seq);
                state.nodes.insert(
                    format!("{}/{}", self.dir, node),
                    Node {
                        data: self.data.clone(),
                        owner: Some(self.session),
                    },
                );
                self.node = Some(node.clone());
                node
            }
        };

        let votes = state.children(&self.dir);
        Ok(vote_outcome(&votes, &node))
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryContender {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(coordinator: &MemoryCoordinator) -> Box<dyn Session> {
        coordinator
            .connect(&["mem:2181".to_string()], "/kafka-test", Duration::from_millis(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_registered_identities() {
        let ensemble = MemoryEnsemble::new();
        let coordinator = MemoryCoordinator::new(ensemble.clone());
        let session = connect(&coordinator).await;

        assert!(session.registered_identities("/brokers/ids").await.unwrap().is_empty());

        ensemble.register_identity("/kafka-test", "/brokers/ids", 2);
        ensemble.register_identity("/kafka-test", "/brokers/ids", 0);
        ensemble.register_identity("/kafka-other", "/brokers/ids", 1);

        let ids = session.registered_identities("/brokers/ids").await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_first_contender_leads() {
        let coordinator = MemoryCoordinator::default();
        let first = connect(&coordinator).await;
        let second = connect(&coordinator).await;

        let mut a = first.contender("kafka-1", "host-a").await.unwrap();
        let mut b = second.contender("kafka-1", "host-b").await.unwrap();

        assert_eq!(a.vote().await.unwrap(), VoteOutcome::Leader);
        assert_eq!(b.vote().await.unwrap(), VoteOutcome::Follower);

        // The follower takes over once the leader withdraws
        a.close().await.unwrap();
        assert_eq!(b.vote().await.unwrap(), VoteOutcome::Leader);
    }

    #[tokio::test]
    async fn test_vote_publishes_data() {
        let coordinator = MemoryCoordinator::default();
        let session = connect(&coordinator).await;
        let mut contender = session.contender("kafka-4", "broker-host").await.unwrap();
        contender.vote().await.unwrap();

        let dir = "/kafka-test/_elections/kafka-4";
        let votes = coordinator.ensemble().children(dir);
        assert_eq!(votes.len(), 1);
        assert_eq!(
            coordinator.ensemble().data(&format!("{}/{}", dir, votes[0])).as_deref(),
            Some("broker-host")
        );
    }

    #[tokio::test]
    async fn test_expiry_drops_votes_and_notifies() {
        let coordinator = MemoryCoordinator::default();
        let ensemble = coordinator.ensemble().clone();
        let session = connect(&coordinator).await;
        let mut contender = session.contender("kafka-0", "host").await.unwrap();
        assert_eq!(contender.vote().await.unwrap(), VoteOutcome::Leader);

        ensemble.expire_all();

        tokio::time::timeout(Duration::from_secs(1), session.expired())
            .await
            .expect("expiry should be observed");
        assert!(ensemble.children("/kafka-test/_elections/kafka-0").is_empty());
        assert!(matches!(contender.vote().await, Err(Error::SessionExpired)));
        assert!(matches!(
            session.registered_identities("/brokers/ids").await,
            Err(Error::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_expiry_before_first_poll_is_reported() {
        let coordinator = MemoryCoordinator::default();
        let session = connect(&coordinator).await;

        // Nobody is waiting yet when the session expires
        coordinator.ensemble().expire_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), session.expired())
                .await
                .expect("expiry should stay observable");
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_votes() {
        let coordinator = MemoryCoordinator::default();
        let ensemble = coordinator.ensemble().clone();
        let mut session = connect(&coordinator).await;
        let mut contender = session.contender("kafka-0", "host").await.unwrap();
        contender.vote().await.unwrap();

        contender.close().await.unwrap();
        contender.close().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(ensemble.live_sessions().is_empty());
        assert!(ensemble.children("/kafka-test/_elections/kafka-0").is_empty());
        assert!(matches!(
            session.registered_identities("/brokers/ids").await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_times_out() {
        let coordinator = MemoryCoordinator::default();
        coordinator.ensemble().set_unreachable(true);

        let result = coordinator
            .connect(&["mem:2181".to_string()], "/kafka-test", Duration::from_millis(5))
            .await;
        assert!(matches!(result, Err(Error::ConnectTimeout { .. })));
        assert_eq!(coordinator.ensemble().connect_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_vote_keeps_the_seat() {
        let coordinator = MemoryCoordinator::default();
        coordinator.ensemble().add_stale_vote("/kafka-test", "kafka-2", "old-host");

        let session = connect(&coordinator).await;
        let mut contender = session.contender("kafka-2", "host").await.unwrap();
        assert_eq!(contender.vote().await.unwrap(), VoteOutcome::Follower);
        assert_eq!(contender.vote().await.unwrap(), VoteOutcome::Follower);
    }
}
