//! Broker Runner
//!
//! Owns everything that lives for the whole process: the coordination session,
//! the campaign for the chosen broker id, the attempt count and the random
//! generator. The broker id is picked once; session losses only re-run the
//! campaign for that same id.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{ClusterConfig, RunnerConfig};
use crate::coordination::{Coordinator, Session};
use crate::election::ElectionCampaign;
use crate::error::{Error, Result};
use crate::identity;
use crate::supervisor::{unpack_archive, IdentityLease, LaunchPlan, ProcessSupervisor, WorkerCommand};
use crate::tuning::{self, HeapOptions};

/// Timing and paths the runner needs from the configuration file
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// How long to wait for a session
    pub connect_timeout: Duration,
    /// Pause between dropping an expired session and reconnecting
    pub reconnect_cooldown: Duration,
    /// Identity registry path
    pub registry_path: String,
    /// One unit of election backoff
    pub jitter_unit: Duration,
}

impl From<&RunnerConfig> for RunnerSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect_cooldown: config.reconnect_cooldown(),
            registry_path: config.coordination.registry_path.clone(),
            jitter_unit: config.jitter_unit(),
        }
    }
}

/// Process-wide coordination context
pub struct Runner {
    coordinator: Box<dyn Coordinator>,
    cluster: ClusterConfig,
    settings: RunnerSettings,
    hostname: String,
    rng: StdRng,
    session: Option<Box<dyn Session>>,
    campaign: Option<ElectionCampaign>,
}

impl Runner {
    /// Create a runner; nothing is connected yet
    pub fn new(
        coordinator: Box<dyn Coordinator>,
        cluster: ClusterConfig,
        settings: RunnerSettings,
        hostname: String,
        rng: StdRng,
    ) -> Self {
        Self {
            coordinator,
            cluster,
            settings,
            hostname,
            rng,
            session: None,
            campaign: None,
        }
    }

    /// The broker id being campaigned for, once picked
    pub fn identity(&self) -> Option<u32> {
        self.campaign.as_ref().map(|c| c.identity())
    }

    /// The campaign, once a broker id has been picked
    pub fn campaign(&self) -> Option<&ElectionCampaign> {
        self.campaign.as_ref()
    }

    /// Open a coordination session
    pub async fn connect(&mut self) -> Result<()> {
        let namespace = self.cluster.namespace();
        tracing::info!(
            endpoints = %self.cluster.endpoints.join(","),
            namespace = %namespace,
            "Connecting to ZooKeeper"
        );
        let session = self
            .coordinator
            .connect(&self.cluster.endpoints, &namespace, self.settings.connect_timeout)
            .await?;
        self.session = Some(session);
        Ok(())
    }

    /// Pick a free broker id and campaign until it is ours
    pub async fn claim_identity(&mut self) -> Result<u32> {
        if self.session.is_none() {
            self.connect().await?;
        }

        let session = self.session.as_deref().ok_or(Error::SessionClosed)?;
        let registered = session
            .registered_identities(&self.settings.registry_path)
            .await?;
        let broker_id = identity::allocate(self.cluster.broker_count, &registered, &mut self.rng)?;
        tracing::info!(broker_id, "Picked broker id to campaign for");

        self.campaign = Some(ElectionCampaign::new(
            broker_id,
            self.cluster.broker_count,
            self.hostname.clone(),
            self.settings.jitter_unit,
        ));
        self.campaign_until_won().await?;
        Ok(broker_id)
    }

    /// Reconnect after a session loss and win the same broker id again
    pub async fn recover_session(&mut self) -> Result<()> {
        self.reconnect().await?;
        self.campaign_until_won().await
    }

    async fn campaign_until_won(&mut self) -> Result<()> {
        loop {
            let session = self.session.as_deref().ok_or(Error::SessionClosed)?;
            let campaign = self.campaign.as_mut().ok_or(Error::SessionClosed)?;

            let result = campaign.run(session, &mut self.rng).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_session_loss() => {
                    tracing::warn!("Lost ZooKeeper session while campaigning: {}", e);
                    self.reconnect().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(campaign) = self.campaign.as_mut() {
            campaign.reset().await;
        }
        self.close_session().await;

        tracing::info!(
            cooldown = ?self.settings.reconnect_cooldown,
            broker_id = ?self.identity(),
            "Reconnecting to ZooKeeper"
        );
        tokio::time::sleep(self.settings.reconnect_cooldown).await;
        self.connect().await
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::warn!("Failed to close ZooKeeper session: {}", e);
            }
        }
    }

    /// Withdraw from the election, then close the session. Idempotent.
    pub async fn close(&mut self) {
        if let Some(campaign) = self.campaign.as_mut() {
            campaign.reset().await;
        }
        self.close_session().await;
    }
}

#[async_trait::async_trait]
impl IdentityLease for Runner {
    async fn lost(&mut self) {
        match self.session.as_deref() {
            Some(session) => session.expired().await,
            None => std::future::pending().await,
        }
    }

    async fn restore(&mut self) -> Result<()> {
        self.recover_session().await
    }
}

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Parsed configuration file
    pub config: RunnerConfig,
    /// Number of broker slots
    pub broker_count: u32,
    /// Broker heap size in MB
    pub heap_mb: u64,
    /// Broker ports; index 1 is JMX
    pub ports: Vec<u16>,
    /// Fixed generator seed, for reproducible picks
    pub seed: Option<u64>,
    /// This host's name
    pub hostname: String,
}

/// Claim a broker id and supervise the broker. Only returns on failure; the
/// contender and session are released on every path out, including SIGINT and
/// SIGTERM.
pub async fn run(coordinator: Box<dyn Coordinator>, options: RunOptions) -> Result<Infallible> {
    run_until(coordinator, options, shutdown_signal()).await
}

/// Like [`run`], but stops with `ShuttingDown` once `shutdown` resolves
pub async fn run_until<F>(
    coordinator: Box<dyn Coordinator>,
    options: RunOptions,
    shutdown: F,
) -> Result<Infallible>
where
    F: Future<Output = Result<()>>,
{
    let mut cluster = options.config.cluster_config(options.broker_count)?;
    let mut rng = identity::seeded_rng(options.seed);
    cluster.endpoints.shuffle(&mut rng);

    let mut runner = Runner::new(
        coordinator,
        cluster,
        RunnerSettings::from(&options.config),
        options.hostname.clone(),
        rng,
    );

    // Dropping `drive` kills the broker before the lease is released
    let result = tokio::select! {
        result = drive(&mut runner, &options) => result,
        signal = shutdown => match signal {
            Ok(()) => Err(Error::ShuttingDown),
            Err(e) => Err(e),
        },
    };
    runner.close().await;
    result
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}

async fn drive(runner: &mut Runner, options: &RunOptions) -> Result<Infallible> {
    runner.connect().await?;
    let broker_id = runner.claim_identity().await?;

    let heap = HeapOptions::new(options.heap_mb);
    tuning::check_heap(&heap);

    let plan = LaunchPlan {
        broker_id,
        heap,
        ports: options.ports.clone(),
        cluster: runner.cluster.clone(),
        hostname: options.hostname.clone(),
    };

    let launch = &options.config.launch;
    plan.write_properties(&launch.template, &launch.output)?;
    let env = plan.environment(launch)?;

    if let Some(archive) = &launch.archive {
        unpack_archive(archive).await?;
    }

    let worker = WorkerCommand::new(launch.command.clone(), env);
    let mut supervisor = ProcessSupervisor::new(worker, options.config.flap_threshold());
    supervisor.run(runner).await
}
