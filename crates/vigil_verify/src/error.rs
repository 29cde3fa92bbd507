//! Error taxonomy for the verification engine.
//!
//! The split that matters here is transient vs fatal: transient errors
//! (unreachable endpoint, no member answering a topology sample) are absorbed
//! by the convergence poller up to its deadline, while everything else
//! propagates to the running scenario, which performs no recovery.

use std::time::Duration;

use thiserror::Error;

/// Opaque failure surfaced verbatim from the deployment collaborator.
///
/// The engine never interprets deployment-layer causes; it only reports them.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct DeploymentError(#[from] pub anyhow::Error);

impl DeploymentError {
    /// Wraps a plain message as a deployment failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(anyhow::anyhow!(message.into()))
    }
}

/// All failures the verification engine can produce.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Could not open a connection to a database endpoint.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    /// A statement failed on an established connection. Transactional batches
    /// roll back before this is returned.
    #[error("statement failed on {endpoint}: {source}")]
    Statement {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    /// No cluster member was reachable for a topology sample.
    #[error("topology unavailable: no member reachable ({detail})")]
    TopologyUnavailable { detail: String },

    /// A convergence check did not resolve within its deadline. Carries the
    /// last observed failure for diagnostics.
    #[error("deadline exceeded after {timeout:?}: last observed failure: {last}")]
    DeadlineExceeded { timeout: Duration, last: String },

    /// The continuous-writes workload (or replication of it) stopped making
    /// progress on a member.
    #[error("continuous writes stalled on member {member}: max value stuck at {observed} (baseline {baseline})")]
    StalledWrites {
        member: String,
        baseline: i64,
        observed: i64,
    },

    /// A committed value that must exist is absent, or an observed max went
    /// backwards. Always fatal, never retried.
    #[error("data loss on member {member}: {detail}")]
    DataLoss { member: String, detail: String },

    /// Failure delegated from the deployment collaborator.
    #[error("deployment failure: {0}")]
    Deployment(#[from] DeploymentError),

    /// Invalid poller configuration, rejected before any attempt runs.
    #[error("invalid poll configuration: {0}")]
    Config(String),
}

impl VerifyError {
    /// Whether the poller may treat this failure as "not yet" and retry it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VerifyError::Connection { .. } | VerifyError::TopologyUnavailable { .. }
        )
    }
}
