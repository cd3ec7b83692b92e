//! Check results.
//!
//! A check keeps going after an individual assertion fails. Every failure
//! is recorded with the chunk, node and step it belongs to, and the check
//! fails overall if any were recorded.

use serde::Serialize;
use swarmcheck_dht::Address;

use crate::error::{Error, Result};

/// One failed assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Protocol step the failure belongs to.
    pub step: &'static str,
    pub chunk: Option<Address>,
    pub node: Option<String>,
    pub reason: String,
}

impl Failure {
    pub fn new(step: &'static str, reason: impl std::fmt::Display) -> Self {
        Self {
            step,
            chunk: None,
            node: None,
            reason: reason.to_string(),
        }
    }

    pub fn chunk(mut self, chunk: &Address) -> Self {
        self.chunk = Some(chunk.clone());
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.step)?;
        if let Some(chunk) = &self.chunk {
            write!(f, " chunk {chunk}")?;
        }
        if let Some(node) = &self.node {
            write!(f, " on {node}")?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Outcome of one check invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub check: String,
    /// Root seed, for replaying the run.
    pub seed: u64,
    /// Assertions that held.
    pub passed: usize,
    pub failures: Vec<Failure>,
}

impl CheckReport {
    pub fn new(check: impl Into<String>, seed: u64) -> Self {
        Self {
            check: check.into(),
            seed,
            passed: 0,
            failures: Vec::new(),
        }
    }

    /// Record a passing assertion.
    pub fn pass(&mut self) {
        self.passed += 1;
    }

    /// Record a failing assertion.
    pub fn fail(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    /// Fold a unit's partial report into this one.
    pub fn absorb(&mut self, other: CheckReport) {
        self.passed += other.passed;
        self.failures.extend(other.failures);
    }

    /// Total assertions evaluated.
    pub fn assertions(&self) -> usize {
        self.passed + self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(self)` if nothing failed, otherwise [`Error::CheckFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::CheckFailed(Box::new(self)))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (seed {}): {} passed, {} failed",
            self.check,
            self.seed,
            self.passed,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}
