//! ZooKeeper coordination backend
//!
//! Votes are ephemeral sequential nodes `/_elections/<name>/_vote_<token>-<seq>`
//! inside the cluster chroot, which is created on connect if missing. The node with the lowest sequence holds the seat;
//! everyone else follows it until it disappears.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use zookeeper_client as zk;

use super::{
    election_path, parse_identities, vote_outcome, Contender, Coordinator, Session, VoteOutcome,
    VOTE_PREFIX,
};
use crate::error::{Error, Result};

fn coordination_error(err: zk::Error) -> Error {
    match err {
        zk::Error::SessionExpired => Error::SessionExpired,
        other => Error::Coordination(other.to_string()),
    }
}

/// Opens ZooKeeper sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperCoordinator;

#[async_trait::async_trait]
impl Coordinator for ZooKeeperCoordinator {
    async fn connect(
        &self,
        endpoints: &[String],
        namespace: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Session>> {
        let endpoints = endpoints.join(",");

        let client = match tokio::time::timeout(timeout, zk::Client::connect(&endpoints)).await {
            Ok(result) => result.map_err(coordination_error)?,
            Err(_) => return Err(Error::ConnectTimeout { endpoints, timeout }),
        };

        // Taken before anything else can happen to the session, so an expiry
        // is never consumed by a watcher nobody polls
        let states = client.state_watcher();

        // Kafka expects the chroot to exist, and so does every path below it
        ensure_path(&client, namespace).await?;
        let client = client
            .chroot(namespace)
            .map_err(|_| Error::Config(format!("invalid ZooKeeper chroot {:?}", namespace)))?;

        tracing::info!(endpoints = %endpoints, namespace, "Connected to ZooKeeper");
        Ok(Box::new(ZooKeeperSession {
            client: Some(client),
            states: Mutex::new(states),
            expired: AtomicBool::new(false),
        }))
    }
}

/// How a session state change affects the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateChange {
    /// The server expired the session
    Expired,
    /// Closed on our side; it can no longer expire
    Closed,
    /// Anything else (disconnects, reconnects)
    Transient,
}

fn classify(state: &zk::SessionState) -> StateChange {
    match state {
        zk::SessionState::Expired => StateChange::Expired,
        zk::SessionState::Closed => StateChange::Closed,
        _ => StateChange::Transient,
    }
}

/// Create every missing node along `path`
async fn ensure_path(client: &zk::Client, path: &str) -> Result<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        match client.create(&current, &[], &options).await {
            Ok(_) | Err(zk::Error::NodeExists) => {}
            Err(err) => return Err(coordination_error(err)),
        }
    }
    Ok(())
}

/// An open ZooKeeper session
pub struct ZooKeeperSession {
    client: Option<zk::Client>,
    states: Mutex<zk::StateWatcher>,
    /// Latched once expiry has been observed
    expired: AtomicBool,
}

impl ZooKeeperSession {
    fn client(&self) -> Result<&zk::Client> {
        self.client.as_ref().ok_or(Error::SessionClosed)
    }
}

#[async_trait::async_trait]
impl Session for ZooKeeperSession {
    async fn registered_identities(&self, path: &str) -> Result<BTreeSet<u32>> {
        match self.client()?.list_children(path).await {
            Ok(children) => Ok(parse_identities(children)),
            Err(zk::Error::NoNode) => Ok(BTreeSet::new()),
            Err(err) => Err(coordination_error(err)),
        }
    }

    async fn contender(&self, election: &str, data: &str) -> Result<Box<dyn Contender>> {
        let client = self.client()?.clone();
        let dir = election_path(election);
        ensure_path(&client, &dir).await?;

        Ok(Box::new(ZooKeeperContender {
            client,
            dir,
            data: data.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            node: None,
        }))
    }

    async fn expired(&self) {
        if self.expired.load(Ordering::Acquire) {
            return;
        }
        if self.client.is_none() {
            return std::future::pending().await;
        }

        let mut states = self.states.lock().await;
        loop {
            let state = states.changed().await;
            match classify(&state) {
                StateChange::Expired => {
                    self.expired.store(true, Ordering::Release);
                    return;
                }
                StateChange::Closed => return std::future::pending().await,
                StateChange::Transient => {
                    tracing::debug!(?state, "ZooKeeper session state changed")
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the last handle closes the session and its ephemeral nodes.
        if self.client.take().is_some() {
            tracing::debug!("Closed ZooKeeper session");
        }
        Ok(())
    }
}

/// Contender in a ZooKeeper election
pub struct ZooKeeperContender {
    client: zk::Client,
    dir: String,
    data: String,
    token: String,
    node: Option<String>,
}

impl ZooKeeperContender {
    fn own_prefix(&self) -> String {
        format!("{}{}-", VOTE_PREFIX, self.token)
    }
}

#[async_trait::async_trait]
impl Contender for ZooKeeperContender {
    async fn vote(&mut self) -> Result<VoteOutcome> {
        if self.node.is_none() {
            let path = format!("{}/{}", self.dir, self.own_prefix());
            let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
            self.client
                .create(&path, self.data.as_bytes(), &options)
                .await
                .map_err(coordination_error)?;
        }

        let votes = self
            .client
            .list_children(&self.dir)
            .await
            .map_err(coordination_error)?;

        if self.node.is_none() {
            let prefix = self.own_prefix();
            self.node = votes.iter().find(|v| v.starts_with(&prefix)).cloned();
        }

        match &self.node {
            Some(node) if votes.contains(node) => Ok(vote_outcome(&votes, node)),
            _ => {
                // Our vote is gone; cast a fresh one next round.
                self.node = None;
                Ok(VoteOutcome::Pending)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };

        let path = format!("{}/{}", self.dir, node);
        match self.client.delete(&path, None).await {
            Ok(()) | Err(zk::Error::NoNode) | Err(zk::Error::SessionExpired) => Ok(()),
            Err(err) => Err(coordination_error(err)),
        }
    }
}
