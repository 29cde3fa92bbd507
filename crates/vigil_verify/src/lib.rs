//! Convergence-verification engine for replicated SQL cluster HA testing.
//!
//! While an external workload continuously writes a strictly increasing
//! integer sequence through the cluster primary, this crate:
//! - observes cluster membership (role and health per member),
//! - polls evolving cluster state until liveness/consistency properties
//!   hold within bounded deadlines,
//! - asserts no committed write is ever lost across failover and rescale,
//! - drives primary-kill, rescale, and cluster-isolation scenarios.
//!
//! Deployment, credential retrieval, and the workload itself are external
//! collaborators behind the [`deploy`] traits; the engine only observes
//! committed database state through the [`query::QueryRunner`] seam.

pub mod deploy;
pub mod error;
pub mod poll;
pub mod query;
pub mod scenario;
pub mod topology;
pub mod writes;

pub use deploy::{ClusterHandle, CredentialSource, Deployment, MemberRef};
pub use error::{DeploymentError, VerifyError};
pub use poll::{PollMode, Poller};
pub use query::{AdminCredentials, Endpoint, PgRunner, QueryRunner, Row};
pub use scenario::{FailoverStage, HaScenario, ScenarioConfig, ScenarioContext};
pub use topology::{
    ClusterMember, MemberHealth, MemberRole, TopologyObserver, TopologySnapshot,
};
pub use writes::{ContinuousWrites, WritesConfig, WritesTable};
