//! Flap detection
//!
//! Launch start times are compared pairwise: if a launch comes less than the
//! threshold after the previous one, the broker is crash-looping. The first run
//! is exempt, so a broker that dies once right after startup gets one relaunch.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Start of the most recent launch
#[derive(Debug, Clone, Copy)]
pub struct SupervisionRecord {
    /// Monotonic start time, used for the spacing check
    pub started: Instant,
    /// Wall clock start time, for logs
    pub started_at: DateTime<Utc>,
    /// 1-based launch number
    pub launch: u64,
}

/// Tracks launch spacing
#[derive(Debug, Clone)]
pub struct FlapDetector {
    threshold: Duration,
    last: Option<SupervisionRecord>,
}

impl FlapDetector {
    /// Detector that rejects launches closer together than `threshold`
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    /// The most recent launch, if any
    pub fn last(&self) -> Option<&SupervisionRecord> {
        self.last.as_ref()
    }

    /// Record a launch starting at `now`. Fails with `Flapping` when the previous
    /// launch started less than the threshold before. The first two launches
    /// always pass: only the second and later runs are measured.
    pub fn record_launch(&mut self, now: Instant) -> Result<&SupervisionRecord> {
        let launch = match &self.last {
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous.started);
                if previous.launch > 1 && elapsed < self.threshold {
                    return Err(Error::Flapping {
                        elapsed,
                        threshold: self.threshold,
                    });
                }
                previous.launch + 1
            }
            None => 1,
        };

        Ok(&*self.last.insert(SupervisionRecord {
            started: now,
            started_at: Utc::now(),
            launch,
        }))
    }
}
