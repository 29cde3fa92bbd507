//! Interfaces to the external collaborators the engine drives but does
//! not own: the deployment layer (unit lifecycle) and the credential store.
//!
//! The engine treats every operation here as fallible with an opaque
//! `DeploymentError`; it never interprets deployment-layer causes.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeploymentError;
use crate::query::{AdminCredentials, Endpoint};

/// Opaque handle to one deployed cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub name: String,
}

/// A deployed unit as the deployment layer knows it: identity plus the SQL
/// endpoint it serves. Role and health are the topology observer's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub unit_id: String,
    pub endpoint: Endpoint,
}

/// Unit-lifecycle operations supplied by the deployment collaborator.
#[async_trait]
pub trait Deployment: Send + Sync {
    async fn get_cluster_handle(&self, name: &str) -> Result<ClusterHandle, DeploymentError>;

    async fn list_members(&self, handle: &ClusterHandle)
        -> Result<Vec<MemberRef>, DeploymentError>;

    /// Tears down one unit. The kill itself is external; observing its
    /// consequences is the engine's job.
    async fn destroy_member(
        &self,
        handle: &ClusterHandle,
        unit_id: &str,
    ) -> Result<(), DeploymentError>;

    /// Requests `count` additional units.
    async fn add_members(&self, handle: &ClusterHandle, count: usize)
        -> Result<(), DeploymentError>;

    /// Blocks until the deployment layer reports the given status for the
    /// whole application, or the timeout lapses.
    async fn wait_until_status(
        &self,
        handle: &ClusterHandle,
        status: &str,
        timeout: Duration,
    ) -> Result<(), DeploymentError>;
}

/// Credential retrieval. The engine never generates or stores credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn get_admin_credentials(
        &self,
        member: &MemberRef,
    ) -> Result<AdminCredentials, DeploymentError>;
}
