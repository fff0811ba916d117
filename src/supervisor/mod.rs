//! Broker Supervision
//!
//! Runs the broker forever, restarting it as soon as it exits. Restarts that come
//! too close together abort the runner. While the broker runs, the supervisor
//! also watches the lease on the broker id and restores it when the
//! coordination session expires. Dropping the supervisor's future kills the
//! running broker.

mod flap;
mod launch;

pub use flap::{FlapDetector, SupervisionRecord};
pub use launch::{unpack_archive, LaunchPlan, WorkerCommand};

use std::convert::Infallible;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Ownership of the broker id, as seen by the supervisor
#[async_trait::async_trait]
pub trait IdentityLease: Send {
    /// Resolves when the lease is lost (the coordination session expired)
    async fn lost(&mut self);

    /// Win the lease back for the same broker id
    async fn restore(&mut self) -> Result<()>;
}

/// Describe how a worker ended
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    match status.signal() {
        Some(signal) => match nix::sys::signal::Signal::try_from(signal) {
            Ok(name) => format!("signal {}", name),
            Err(_) => format!("signal {}", signal),
        },
        None => "unknown status".to_string(),
    }
}

/// Restarts the broker and enforces the flap threshold
pub struct ProcessSupervisor {
    worker: WorkerCommand,
    flap: FlapDetector,
}

impl ProcessSupervisor {
    /// Supervise `worker`, aborting when launches are closer than `flap_threshold`
    pub fn new(worker: WorkerCommand, flap_threshold: Duration) -> Self {
        Self {
            worker,
            flap: FlapDetector::new(flap_threshold),
        }
    }

    /// Run the broker until something fatal happens. Never returns `Ok`.
    pub async fn run<L: IdentityLease + ?Sized>(&mut self, lease: &mut L) -> Result<Infallible> {
        loop {
            let record = self.flap.record_launch(Instant::now())?;
            tracing::info!(
                launch = record.launch,
                started_at = %record.started_at,
                command = %self.worker.command,
                "About to run broker"
            );
            tracing::debug!(env = ?self.worker.env, "Broker environment");

            let status = self.supervise_once(lease).await?;
            tracing::warn!("Broker exited with {}", describe_exit(&status));
        }
    }

    /// Launch the broker once and wait for it, restoring the lease as needed
    async fn supervise_once<L: IdentityLease + ?Sized>(&mut self, lease: &mut L) -> Result<ExitStatus> {
        let mut child = self
            .worker
            .to_command()
            .spawn()
            .map_err(|e| Error::Launch(format!("{}: {}", self.worker.command, e)))?;

        loop {
            tokio::select! {
                status = child.wait() => return Ok(status?),
                _ = lease.lost() => {
                    tracing::warn!("ZooKeeper session expired");
                    lease.restore().await?;
                    tracing::info!("Broker id lease restored");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Lease that is lost a fixed number of times
    struct FlakyLease {
        losses: u32,
        restores: u32,
        fail_restore: bool,
    }

    impl FlakyLease {
        fn new(losses: u32) -> Self {
            Self {
                losses,
                restores: 0,
                fail_restore: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl IdentityLease for FlakyLease {
        async fn lost(&mut self) {
            if self.losses == 0 {
                std::future::pending::<()>().await;
            }
            self.losses -= 1;
        }

        async fn restore(&mut self) -> Result<()> {
            self.restores += 1;
            if self.fail_restore {
                return Err(Error::ElectionExhausted {
                    identity: 0,
                    attempts: 4,
                });
            }
            Ok(())
        }
    }

    fn supervisor(command: &str, threshold: Duration) -> ProcessSupervisor {
        ProcessSupervisor::new(WorkerCommand::new(command, BTreeMap::new()), threshold)
    }

    #[tokio::test]
    async fn test_quick_exits_are_flapping_after_one_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let command = format!("echo run >> {}; exit 3", marker.display());
        let mut supervisor = supervisor(&command, Duration::from_millis(200));
        let mut lease = FlakyLease::new(0);

        let err = supervisor.run(&mut lease).await.unwrap_err();
        assert!(matches!(err, Error::Flapping { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_FLAPPING);

        // The first quick exit is relaunched; the second one aborts
        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 2);
        assert_eq!(supervisor.flap.last().map(|r| r.launch), Some(2));
    }

    #[tokio::test]
    async fn test_dropping_the_supervisor_kills_the_broker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let command = format!("sleep 1; touch {}", marker.display());
        let mut supervisor = supervisor(&command, Duration::from_secs(120));
        let mut lease = FlakyLease::new(0);

        let result =
            tokio::time::timeout(Duration::from_millis(200), supervisor.run(&mut lease)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_slow_runs_are_restarted() {
        // Each run takes ~300ms, above the 200ms threshold, until the marker
        // file makes the third run exit at once
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let command = format!(
            "echo run >> {m}; if [ $(wc -l < {m}) -lt 3 ]; then sleep 0.3; fi",
            m = marker.display()
        );
        let mut supervisor = supervisor(&command, Duration::from_millis(200));
        let mut lease = FlakyLease::new(0);

        let err = supervisor.run(&mut lease).await.unwrap_err();
        assert!(matches!(err, Error::Flapping { .. }));
        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 3);
        assert_eq!(supervisor.flap.last().map(|r| r.launch), Some(3));
    }

    #[tokio::test]
    async fn test_lost_lease_is_restored_while_broker_runs() {
        let mut supervisor = supervisor("sleep 0.2", Duration::from_secs(120));
        let mut lease = FlakyLease::new(2);

        let err = supervisor.run(&mut lease).await.unwrap_err();
        assert!(matches!(err, Error::Flapping { .. }));
        assert_eq!(lease.restores, 2);
    }

    #[tokio::test]
    async fn test_failed_restore_is_fatal() {
        let mut supervisor = supervisor("sleep 5", Duration::from_secs(120));
        let mut lease = FlakyLease::new(1);
        lease.fail_restore = true;

        let started = Instant::now();
        let err = supervisor.run(&mut lease).await.unwrap_err();
        assert!(matches!(err, Error::ElectionExhausted { .. }));
        // The broker was killed rather than waited for
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_describe_exit() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(describe_exit(&ExitStatus::from_raw(3 << 8)), "exit code 3");
        assert_eq!(describe_exit(&ExitStatus::from_raw(9)), "signal SIGKILL");
    }
}
