//! Run-wide configuration and the per-invocation context.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::random::DeterministicRandom;
use crate::retry::{Backoff, Retry};

/// Settings shared by every check in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root seed. Generated (and logged) when absent.
    pub seed: Option<u64>,

    /// Deadline for a whole check invocation.
    pub timeout: Duration,

    /// Independent units of work in flight at once.
    pub concurrency: usize,

    /// Attempts at capturing a topology snapshot.
    pub snapshot_attempts: usize,

    /// Delay between snapshot capture attempts.
    pub snapshot_retry_delay: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: None,
            timeout: Duration::from_secs(30 * 60),
            concurrency: 4,
            snapshot_attempts: 3,
            snapshot_retry_delay: Duration::from_secs(1),
        }
    }
}

impl RunConfig {
    /// Read overrides from `SWARMCHECK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            seed: parse_var(&lookup, "SWARMCHECK_SEED")?.or(defaults.seed),
            timeout: parse_var(&lookup, "SWARMCHECK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            concurrency: parse_var(&lookup, "SWARMCHECK_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            snapshot_attempts: parse_var(&lookup, "SWARMCHECK_SNAPSHOT_ATTEMPTS")?
                .unwrap_or(defaults.snapshot_attempts),
            snapshot_retry_delay: defaults.snapshot_retry_delay,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidOptions("timeout must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidOptions("concurrency must be at least 1".into()));
        }
        if self.snapshot_attempts == 0 {
            return Err(Error::InvalidOptions("snapshot_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::InvalidOptions(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

/// State that lives for exactly one check invocation: the seed and the
/// deadline every network call and retry loop is bound to.
#[derive(Debug, Clone)]
pub struct CheckContext {
    random: DeterministicRandom,
    deadline: Instant,
    concurrency: usize,
    snapshot_attempts: usize,
    snapshot_retry_delay: Duration,
}

impl CheckContext {
    /// Start an invocation now.
    ///
    /// Fails with [`Error::InvalidOptions`] when the timeout reaches past
    /// what the clock can represent.
    pub fn start(config: &RunConfig) -> Result<Self> {
        config.validate()?;
        let deadline = Instant::now()
            .checked_add(config.timeout)
            .ok_or_else(|| Error::InvalidOptions(format!("timeout {:?} is out of range", config.timeout)))?;
        Ok(Self {
            random: DeterministicRandom::from_option(config.seed),
            deadline,
            concurrency: config.concurrency,
            snapshot_attempts: config.snapshot_attempts,
            snapshot_retry_delay: config.snapshot_retry_delay,
        })
    }

    pub fn seed(&self) -> u64 {
        self.random.seed()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// One independent random stream per unit of work.
    pub fn streams(&self, count: usize) -> Vec<StdRng> {
        self.random.streams(count)
    }

    /// A retry loop bound to this invocation's deadline.
    pub fn retry(&self, budget: usize, backoff: Backoff) -> Retry {
        Retry::new(budget, backoff).with_deadline(self.deadline)
    }

    /// Retry policy for snapshot capture.
    pub fn snapshot_retry(&self) -> Retry {
        self.retry(self.snapshot_attempts, Backoff::Fixed(self.snapshot_retry_delay))
    }

    /// Run `fut`, failing with [`Error::DeadlineExceeded`] if the deadline
    /// passes first.
    pub async fn within<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = RunConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn env_overrides() {
        let config = RunConfig::from_lookup(lookup(&[
            ("SWARMCHECK_SEED", "1234"),
            ("SWARMCHECK_TIMEOUT_SECS", "60"),
            ("SWARMCHECK_CONCURRENCY", " 8 "),
        ]))
        .unwrap();
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.snapshot_attempts, 3);
    }

    #[test]
    fn malformed_env_is_reported() {
        let err = RunConfig::from_lookup(lookup(&[("SWARMCHECK_SEED", "abc")])).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(msg) if msg.contains("SWARMCHECK_SEED")));
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = RunConfig::from_lookup(lookup(&[("SWARMCHECK_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn oversized_timeout_is_rejected_at_start() {
        let config = RunConfig::from_lookup(lookup(&[
            ("SWARMCHECK_SEED", "1"),
            ("SWARMCHECK_TIMEOUT_SECS", &u64::MAX.to_string()),
        ]))
        .unwrap();
        let err = CheckContext::start(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(msg) if msg.contains("timeout")));
    }

    #[test]
    fn deserializes_partial_config() {
        let config: RunConfig = serde_json::from_str(r#"{"seed": 5, "concurrency": 2}"#).unwrap();
        assert_eq!(config.seed, Some(5));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.timeout, RunConfig::default().timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn within_enforces_deadline() {
        let config = RunConfig {
            seed: Some(1),
            timeout: Duration::from_secs(10),
            ..RunConfig::default()
        };
        let ctx = CheckContext::start(&config).unwrap();
        assert_eq!(ctx.seed(), 1);

        let err = ctx
            .within(async {
                tokio::time::sleep(Duration::from_secs(11)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }
}
