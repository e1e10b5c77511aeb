//! Id, timestamp and counter source
//!
//! Every engine instance owns exactly one [`Clock`] and threads it through
//! each mutating call; there is no process-wide clock state, so two engines
//! in one process never interfere.

use crate::config::{ClockConfig, ClockMode};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    mode: ClockMode,
    counter: u64,
}

impl Clock {
    pub fn system() -> Self {
        Self {
            mode: ClockMode::System,
            counter: 0,
        }
    }

    pub fn deterministic(seed: u64) -> Self {
        Self {
            mode: ClockMode::Deterministic { seed },
            counter: 0,
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        Self {
            mode: config.mode,
            counter: 0,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self.mode, ClockMode::Deterministic { .. })
    }

    /// Current counter value (the last value handed out)
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Reset the counter, e.g. after a rolled-back transaction or on reopen
    pub fn restore(&mut self, counter: u64) {
        self.counter = counter;
    }

    /// Next value of the monotonically increasing counter
    pub fn next_count(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// RFC 3339 timestamp with millisecond precision
    ///
    /// Deterministic mode counts milliseconds from the Unix epoch.
    pub fn now(&mut self) -> String {
        let at = match self.mode {
            ClockMode::System => Utc::now(),
            ClockMode::Deterministic { .. } => {
                let millis = i64::try_from(self.next_count()).unwrap_or(i64::MAX);
                DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
            }
        };
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Fresh UUID-formatted id
    pub fn new_id(&mut self) -> String {
        match self.mode {
            ClockMode::System => Uuid::new_v4().to_string(),
            ClockMode::Deterministic { seed } => {
                let n = self.next_count();
                let mut hasher = Sha256::new();
                hasher.update(seed.to_be_bytes());
                hasher.update(n.to_be_bytes());
                let digest = hasher.finalize();
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&digest[..16]);
                uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .to_string()
            }
        }
    }
}
