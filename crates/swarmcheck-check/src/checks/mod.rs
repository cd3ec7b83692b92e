//! Consistency checks.
//!
//! Every check follows the same shape:
//!
//! ```text
//! Arrange  pick nodes and chunks from the seeded streams
//! Act      perform the network operation under test
//! Await    poll nodes until the predicted state holds or the budget runs out
//! Assert   record a pass or a failure per chunk / node pair
//! ```
//!
//! A failed assertion never stops the remaining ones. Only fatal errors
//! (deadline, broken preconditions) end an invocation early.

mod chunkrepair;
mod pullsync;
mod pushsync;
mod reserve;

use async_trait::async_trait;

use crate::config::CheckContext;
use crate::error::{Error, Result};
use crate::node::{ClusterProvider, NamedNode};
use crate::report::{CheckReport, Failure};

pub use chunkrepair::{ChunkRepairCheck, ChunkRepairOptions};
pub use pullsync::{PullSyncCheck, PullSyncOptions};
pub use pushsync::{PushSyncCheck, PushSyncOptions};
pub use reserve::{ReserveCheck, ReserveOptions};

/// A runnable consistency check.
#[async_trait]
pub trait Check: Send + Sync {
    /// Short name used in reports, logs and metrics.
    fn name(&self) -> &'static str;

    /// Run once against `cluster`.
    ///
    /// Returns the report on success and [`Error::CheckFailed`] carrying it
    /// when any assertion failed.
    async fn run(&self, cluster: &dyn ClusterProvider, ctx: &CheckContext) -> Result<CheckReport>;
}

/// Record a step's error as a failure unless it is fatal.
fn settle(report: &mut CheckReport, outcome: Result<()>, failure: impl FnOnce(Error) -> Failure) -> Result<()> {
    match outcome {
        Ok(()) => {
            report.pass();
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            report.fail(failure(e));
            Ok(())
        }
    }
}

/// Where in a check's protocol an error happened.
struct StepError {
    step: &'static str,
    node: String,
    error: Error,
}

impl StepError {
    fn new(step: &'static str, node: &NamedNode, error: Error) -> Self {
        Self {
            step,
            node: node.name.clone(),
            error,
        }
    }

    /// Propagate fatal errors; record anything else against the step.
    fn settle(self, report: &mut CheckReport, chunk: Option<&swarmcheck_dht::Address>) -> Result<()> {
        if self.error.is_fatal() {
            return Err(self.error);
        }
        let mut failure = Failure::new(self.step, self.error).node(&self.node);
        if let Some(chunk) = chunk {
            failure = failure.chunk(chunk);
        }
        report.fail(failure);
        Ok(())
    }
}

trait AtStep<T> {
    fn at(self, step: &'static str, node: &NamedNode) -> std::result::Result<T, StepError>;
}

impl<T> AtStep<T> for Result<T> {
    fn at(self, step: &'static str, node: &NamedNode) -> std::result::Result<T, StepError> {
        self.map_err(|error| StepError::new(step, node, error))
    }
}

fn require(condition: bool, what: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::InvalidOptions(what()))
    }
}
