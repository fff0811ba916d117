//! Kafka Runner Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status when every broker id is already registered
pub const EXIT_NO_IDENTITY: u8 = 2;
/// Exit status when the election budget ran out
pub const EXIT_ELECTION_EXHAUSTED: u8 = 3;
/// Exit status when the broker restarts too quickly
pub const EXIT_FLAPPING: u8 = 4;
/// Exit status after an interrupt
pub const EXIT_INTERRUPTED: u8 = 130;
/// Exit status for everything else
pub const EXIT_FAILURE: u8 = 1;

/// Kafka runner error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination errors
    #[error("Timed out connecting to {endpoints} after {timeout:?}")]
    ConnectTimeout { endpoints: String, timeout: Duration },

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination session is closed")]
    SessionClosed,

    // Allocation and election errors
    #[error("No missing brokers found: every broker id is registered")]
    NoIdentityAvailable,

    #[error("Couldn't become broker {identity}: gave up after {attempts} election attempts")]
    ElectionExhausted { identity: u32, attempts: u32 },

    // Supervision errors
    #[error("Kafka exited too soon: relaunch after {elapsed:?} (threshold {threshold:?})")]
    Flapping { elapsed: Duration, threshold: Duration },

    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Template error: {0}")]
    Template(#[from] liquid::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown requested")]
    ShuttingDown,
}

impl Error {
    /// Check if this error means the coordination session is gone and can be re-established
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionExpired | Error::SessionClosed)
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NoIdentityAvailable => EXIT_NO_IDENTITY,
            Error::ElectionExhausted { .. } => EXIT_ELECTION_EXHAUSTED,
            Error::Flapping { .. } => EXIT_FLAPPING,
            Error::ShuttingDown => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_conditions_have_distinct_exit_codes() {
        let codes = [
            Error::NoIdentityAvailable.exit_code(),
            Error::ElectionExhausted { identity: 1, attempts: 13 }.exit_code(),
            Error::Flapping {
                elapsed: Duration::from_secs(15),
                threshold: Duration::from_secs(120),
            }
            .exit_code(),
            Error::Coordination("boom".into()).exit_code(),
        ];

        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_session_loss_classification() {
        assert!(Error::SessionExpired.is_session_loss());
        assert!(Error::SessionClosed.is_session_loss());
        assert!(!Error::Coordination("lost".into()).is_session_loss());
        assert!(!Error::ShuttingDown.is_session_loss());
    }
}
