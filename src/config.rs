//! Configuration for the consensus client.

use std::time::Duration;

/// Configuration for a quorum replica.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base timeout before a follower becomes a candidate or a candidate
    /// restarts a failed election.
    pub election_timeout: Duration,

    /// Upper bound of the uniform jitter added to the election timeout when
    /// a candidate schedules a retry. Resampled per election.
    pub election_jitter: Duration,

    /// Backoff before retrying leader discovery or a failed connection.
    pub retry_backoff: Duration,

    /// Per-request timeout; after this the request is considered failed and
    /// may be re-issued.
    pub request_timeout: Duration,

    /// Bound on the network channel's pending-send and synthesized-response
    /// queues. `None` sizes the queues to the peer set at client
    /// construction (`max(10, 2 * voters)`). Overflow is fatal.
    pub max_pending_sends: Option<usize>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(10_000),
            election_jitter: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            request_timeout: Duration::from_millis(5_000),
            max_pending_sends: None,
        }
    }
}

impl RaftConfig {
    /// Create config from environment variables, falling back to defaults.
    ///
    /// Recognized variables: `QUORUM_ELECTION_TIMEOUT_MS`,
    /// `QUORUM_ELECTION_JITTER_MS`, `QUORUM_RETRY_BACKOFF_MS`,
    /// `QUORUM_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        fn duration_var(name: &str, default: Duration) -> Result<Duration, String> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| format!("Invalid {}: {}", name, e)),
                Err(_) => Ok(default),
            }
        }

        Ok(Self {
            election_timeout: duration_var("QUORUM_ELECTION_TIMEOUT_MS", defaults.election_timeout)?,
            election_jitter: duration_var("QUORUM_ELECTION_JITTER_MS", defaults.election_jitter)?,
            retry_backoff: duration_var("QUORUM_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
            request_timeout: duration_var("QUORUM_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            max_pending_sends: defaults.max_pending_sends,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.election_timeout.is_zero() {
            errors.push("election_timeout must be positive".to_string());
        }

        if self.request_timeout.is_zero() {
            errors.push("request_timeout must be positive".to_string());
        }

        if self.request_timeout >= self.election_timeout {
            errors.push(format!(
                "request_timeout ({:?}) should be less than election_timeout ({:?})",
                self.request_timeout, self.election_timeout
            ));
        }

        if self.retry_backoff >= self.election_timeout {
            errors.push(format!(
                "retry_backoff ({:?}) must be less than election_timeout ({:?})",
                self.retry_backoff, self.election_timeout
            ));
        }

        if let Some(0) = self.max_pending_sends {
            errors.push("max_pending_sends must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub(crate) fn election_timeout_ms(&self) -> u64 {
        self.election_timeout.as_millis() as u64
    }

    pub(crate) fn election_jitter_ms(&self) -> u64 {
        self.election_jitter.as_millis() as u64
    }

    pub(crate) fn retry_backoff_ms(&self) -> u64 {
        self.retry_backoff.as_millis() as u64
    }

    pub(crate) fn request_timeout_ms(&self) -> u64 {
        self.request_timeout.as_millis() as u64
    }
}
