//! High-availability test scenarios.
//!
//! Scenarios compose the topology observer and the continuous-writes
//! verifier around externally triggered topology changes (unit kill, scale
//! request) supplied by the deployment collaborator. One scenario owns its
//! context exclusively; scenarios never run concurrently against the same
//! cluster.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::deploy::{ClusterHandle, CredentialSource, Deployment, MemberRef};
use crate::error::{DeploymentError, VerifyError};
use crate::poll::{PollMode, Poller};
use crate::query::{AdminCredentials, Endpoint, QueryRunner};
use crate::topology::{ClusterMember, MemberHealth, TopologyObserver};
use crate::writes::{ContinuousWrites, WritesConfig};

/// Schema holding scratch tables created by replication/isolation probes.
const SCRATCH_SCHEMA: &str = "vigil_scratch";

/// Stages of the primary-failover scenario, logged as the run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStage {
    Stable,
    PrimaryKilled,
    ElectionPending,
    NewPrimaryConfirmed,
    MembershipRestored,
}

/// Deadlines and sizing for scenario runs.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Expected steady-state online member count.
    pub cluster_size: usize,
    /// How long a primary election may take before the scenario fails.
    pub election_timeout: Duration,
    /// How long membership may take to return to the expected size.
    pub membership_timeout: Duration,
    /// Per-member window for a probe row to become visible.
    pub replication_timeout: Duration,
    pub poll_interval: Duration,
    /// Outer bound handed to the deployment layer's own status wait.
    pub deployment_status_timeout: Duration,
    pub writes: WritesConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            cluster_size: 3,
            election_timeout: Duration::from_secs(600),
            membership_timeout: Duration::from_secs(600),
            replication_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            deployment_status_timeout: Duration::from_secs(1200),
            writes: WritesConfig::default(),
        }
    }
}

/// Per-scenario mutable state: the cluster handle, admin credentials, and
/// the verified floor of the continuous-writes sequence.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub handle: ClusterHandle,
    pub credentials: AdminCredentials,
    pub last_max: i64,
}

/// Scenario driver wiring collaborators to the verification engine.
pub struct HaScenario<R: QueryRunner + Clone> {
    deployment: Arc<dyn Deployment>,
    credentials: Arc<dyn CredentialSource>,
    observer: TopologyObserver<R>,
    writes: ContinuousWrites<R>,
    runner: R,
    config: ScenarioConfig,
}

impl<R: QueryRunner + Clone> HaScenario<R> {
    pub fn new(
        deployment: Arc<dyn Deployment>,
        credentials: Arc<dyn CredentialSource>,
        runner: R,
        config: ScenarioConfig,
    ) -> Self {
        let observer = TopologyObserver::new(runner.clone());
        let writes = ContinuousWrites::new(runner.clone(), config.writes.clone());
        Self {
            deployment,
            credentials,
            observer,
            writes,
            runner,
            config,
        }
    }

    /// Resolves the cluster handle and admin credentials for one scenario.
    pub async fn bootstrap(&self, cluster_name: &str) -> Result<ScenarioContext, VerifyError> {
        let handle = self.deployment.get_cluster_handle(cluster_name).await?;
        let members = self.deployment.list_members(&handle).await?;
        let first = members.first().ok_or_else(|| {
            VerifyError::Deployment(DeploymentError::msg(format!(
                "cluster {cluster_name} has no members"
            )))
        })?;
        let credentials = self.credentials.get_admin_credentials(first).await?;
        Ok(ScenarioContext {
            handle,
            credentials,
            last_max: 0,
        })
    }

    async fn members(&self, ctx: &ScenarioContext) -> Result<Vec<MemberRef>, VerifyError> {
        Ok(self.deployment.list_members(&ctx.handle).await?)
    }

    async fn endpoints(&self, ctx: &ScenarioContext) -> Result<Vec<Endpoint>, VerifyError> {
        Ok(self
            .members(ctx)
            .await?
            .into_iter()
            .map(|m| m.endpoint)
            .collect())
    }

    /// Takes a fresh topology snapshot through any reachable member.
    pub async fn sample(
        &self,
        ctx: &ScenarioContext,
    ) -> Result<crate::topology::TopologySnapshot, VerifyError> {
        let endpoints = self.endpoints(ctx).await?;
        self.observer.sample(&endpoints, &ctx.credentials).await
    }

    async fn online_members(
        &self,
        ctx: &ScenarioContext,
    ) -> Result<Vec<ClusterMember>, VerifyError> {
        let snapshot = self.sample(ctx).await?;
        Ok(snapshot
            .members()
            .iter()
            .filter(|m| m.health == MemberHealth::Online)
            .cloned()
            .collect())
    }

    /// Runs the continuous-writes verifier over all online members and
    /// advances the context's verified floor.
    pub async fn verify_continuous_writes(
        &self,
        ctx: &mut ScenarioContext,
    ) -> Result<(), VerifyError> {
        let members = self.online_members(ctx).await?;
        let new_max = self
            .writes
            .assert_incrementing_and_complete(&members, &ctx.credentials, ctx.last_max)
            .await?;
        ctx.last_max = new_max;
        Ok(())
    }

    /// Waits until the cluster reports a unique online primary, optionally
    /// required to differ from a previous primary's identity.
    async fn await_primary(
        &self,
        ctx: &ScenarioContext,
        differing_from: Option<&str>,
    ) -> Result<ClusterMember, VerifyError> {
        let poller = Poller::new(self.config.election_timeout, self.config.poll_interval)?;
        let found: RefCell<Option<ClusterMember>> = RefCell::new(None);
        let last_view: RefCell<String> = RefCell::new("no snapshot taken".to_string());

        let result = poller
            .await_condition(PollMode::Converge, || {
                let found = &found;
                let last_view = &last_view;
                async move {
                    let snapshot = self.sample(ctx).await?;
                    *last_view.borrow_mut() = snapshot.describe();
                    match snapshot.primary() {
                        Some(primary) if differing_from != Some(primary.label.as_str()) => {
                            *found.borrow_mut() = Some(primary.clone());
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {
                let primary = found.into_inner().expect("primary recorded on success");
                info!(primary = %primary.label, "online primary confirmed");
                Ok(primary)
            }
            Err(VerifyError::DeadlineExceeded { timeout, .. }) => {
                Err(VerifyError::DeadlineExceeded {
                    timeout,
                    last: format!(
                        "no {}primary elected; last topology: {}",
                        if differing_from.is_some() { "new " } else { "" },
                        last_view.into_inner()
                    ),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Waits until exactly `expected` members are online.
    async fn await_online_count(
        &self,
        ctx: &ScenarioContext,
        expected: usize,
    ) -> Result<(), VerifyError> {
        let poller = Poller::new(self.config.membership_timeout, self.config.poll_interval)?;
        let last_view: RefCell<String> = RefCell::new("no snapshot taken".to_string());

        let result = poller
            .await_condition(PollMode::Converge, || {
                let last_view = &last_view;
                async move {
                    let snapshot = self.sample(ctx).await?;
                    *last_view.borrow_mut() = snapshot.describe();
                    Ok(snapshot.online_count() == expected)
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(VerifyError::DeadlineExceeded { timeout, .. }) => {
                Err(VerifyError::DeadlineExceeded {
                    timeout,
                    last: format!(
                        "online member count never reached {expected}; last topology: {}",
                        last_view.into_inner()
                    ),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Kills the current primary, verifies a different member wins the
    /// election, restores membership, and confirms no write regression.
    ///
    /// Stages: Stable -> PrimaryKilled -> ElectionPending ->
    /// NewPrimaryConfirmed -> MembershipRestored -> Stable. Returns the new
    /// primary's label.
    pub async fn kill_primary_and_verify_reelection(
        &self,
        ctx: &mut ScenarioContext,
    ) -> Result<String, VerifyError> {
        let mut stage = FailoverStage::Stable;
        info!(cluster = %ctx.handle.name, ?stage, "failover scenario starting");

        // Baseline: writes must be healthy before the kill.
        self.verify_continuous_writes(ctx).await?;

        let old_primary = self.await_primary(ctx, None).await?;
        info!(primary = %old_primary.label, "destroying current primary");
        self.deployment
            .destroy_member(&ctx.handle, &old_primary.label)
            .await?;
        stage = FailoverStage::PrimaryKilled;
        info!(?stage, killed = %old_primary.label, "primary torn down");

        // The election start has no observable signal of its own.
        stage = FailoverStage::ElectionPending;
        info!(?stage, "waiting for re-election");
        let new_primary = self
            .await_primary(ctx, Some(old_primary.label.as_str()))
            .await?;
        stage = FailoverStage::NewPrimaryConfirmed;
        info!(?stage, new_primary = %new_primary.label, "new primary elected");

        self.deployment.add_members(&ctx.handle, 1).await?;
        self.deployment
            .wait_until_status(&ctx.handle, "active", self.config.deployment_status_timeout)
            .await?;
        self.await_online_count(ctx, self.config.cluster_size)
            .await?;
        stage = FailoverStage::MembershipRestored;
        info!(?stage, online = self.config.cluster_size, "membership restored");

        self.verify_continuous_writes(ctx).await?;
        stage = FailoverStage::Stable;
        info!(?stage, "failover scenario complete");
        Ok(new_primary.label)
    }

    /// Scales the cluster up by one member and back down, asserting a
    /// marker row written before the scale survives on every member.
    pub async fn scale_without_data_loss(
        &self,
        ctx: &mut ScenarioContext,
    ) -> Result<(), VerifyError> {
        let table = format!("{SCRATCH_SCHEMA}.instance_state_replication");
        let marker = random_marker();
        let primary = self.await_primary(ctx, None).await?;

        let seed = vec![
            format!("CREATE SCHEMA IF NOT EXISTS {SCRATCH_SCHEMA}"),
            format!("CREATE TABLE IF NOT EXISTS {table} (id varchar(64) PRIMARY KEY)"),
            format!("INSERT INTO {table} (id) VALUES ('{marker}')"),
        ];
        self.runner
            .execute(&primary.endpoint, &ctx.credentials, &seed, true)
            .await?;
        info!(marker = %marker, "seeded marker row before scale up");

        let before: Vec<String> = self
            .members(ctx)
            .await?
            .into_iter()
            .map(|m| m.unit_id)
            .collect();

        self.deployment.add_members(&ctx.handle, 1).await?;
        self.deployment
            .wait_until_status(&ctx.handle, "active", self.config.deployment_status_timeout)
            .await?;
        self.await_online_count(ctx, self.config.cluster_size + 1)
            .await?;

        self.assert_row_on_all_members(ctx, &table, &marker).await?;

        let added = self
            .members(ctx)
            .await?
            .into_iter()
            .find(|m| !before.contains(&m.unit_id))
            .ok_or_else(|| {
                VerifyError::Deployment(DeploymentError::msg("scale-up produced no new member"))
            })?;
        info!(unit = %added.unit_id, "scaling back down");
        self.deployment
            .destroy_member(&ctx.handle, &added.unit_id)
            .await?;
        self.deployment
            .wait_until_status(&ctx.handle, "active", self.config.deployment_status_timeout)
            .await?;
        self.await_online_count(ctx, self.config.cluster_size)
            .await?;

        self.assert_row_on_all_members(ctx, &table, &marker).await?;

        let primary = self.await_primary(ctx, None).await?;
        self.runner
            .execute(
                &primary.endpoint,
                &ctx.credentials,
                &[format!("DROP TABLE IF EXISTS {table}")],
                true,
            )
            .await?;
        Ok(())
    }

    /// Inserts a random marker row transactionally on the primary and polls
    /// every online member until it is visible, then drops the scratch
    /// table. Returns the marker value.
    pub async fn insert_and_validate_replication(
        &self,
        ctx: &ScenarioContext,
        table_name: &str,
    ) -> Result<String, VerifyError> {
        let table = format!("{SCRATCH_SCHEMA}.{table_name}");
        let marker = random_marker();
        let primary = self.await_primary(ctx, None).await?;

        let seed = vec![
            format!("CREATE SCHEMA IF NOT EXISTS {SCRATCH_SCHEMA}"),
            format!("CREATE TABLE IF NOT EXISTS {table} (id varchar(64) PRIMARY KEY)"),
            format!("INSERT INTO {table} (id) VALUES ('{marker}')"),
        ];
        self.runner
            .execute(&primary.endpoint, &ctx.credentials, &seed, true)
            .await?;

        self.assert_row_on_all_members(ctx, &table, &marker).await?;

        self.runner
            .execute(
                &primary.endpoint,
                &ctx.credentials,
                &[format!("DROP TABLE IF EXISTS {table}")],
                true,
            )
            .await?;
        Ok(marker)
    }

    /// Polls each online member (sequentially, fresh deadline each) until
    /// the marker row is visible there.
    async fn assert_row_on_all_members(
        &self,
        ctx: &ScenarioContext,
        table: &str,
        marker: &str,
    ) -> Result<(), VerifyError> {
        let members = self.online_members(ctx).await?;
        let poller = Poller::new(self.config.replication_timeout, self.config.poll_interval)?;
        let select = format!("SELECT id FROM {table} WHERE id = '{marker}'");

        for member in &members {
            let select = select.as_str();
            let result = poller
                .await_condition(PollMode::Converge, || async move {
                    let rows = self
                        .runner
                        .execute(
                            &member.endpoint,
                            &ctx.credentials,
                            &[select.to_string()],
                            false,
                        )
                        .await?;
                    Ok(rows.iter().any(|row| row.first().map(String::as_str) == Some(marker)))
                })
                .await;
            match result {
                Ok(()) => {}
                Err(VerifyError::DeadlineExceeded { timeout, .. }) => {
                    warn!(member = %member.label, marker, "marker row never replicated");
                    return Err(VerifyError::DeadlineExceeded {
                        timeout,
                        last: format!(
                            "member {} missing marker row {marker} in {table}",
                            member.label
                        ),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Direct cross-contamination check between two independently deployed
    /// clusters: each writes its own cluster name to the same scratch table
    /// and the two single-record reads must differ. A single immediate
    /// assertion, not a convergence check.
    pub async fn assert_clusters_isolated(
        &self,
        a: &ScenarioContext,
        b: &ScenarioContext,
    ) -> Result<(), VerifyError> {
        let table = format!("{SCRATCH_SCHEMA}.cluster_isolation");

        let mut records = Vec::with_capacity(2);
        for ctx in [a, b] {
            let primary = self.await_primary(ctx, None).await?;
            let seed = vec![
                format!("CREATE SCHEMA IF NOT EXISTS {SCRATCH_SCHEMA}"),
                format!("DROP TABLE IF EXISTS {table}"),
                format!("CREATE TABLE {table} (id varchar(64) PRIMARY KEY)"),
                format!("INSERT INTO {table} (id) VALUES ('{}')", ctx.handle.name),
            ];
            self.runner
                .execute(&primary.endpoint, &ctx.credentials, &seed, true)
                .await?;
        }

        for ctx in [a, b] {
            let primary = self.await_primary(ctx, None).await?;
            let rows = self
                .runner
                .execute(
                    &primary.endpoint,
                    &ctx.credentials,
                    &[format!("SELECT id FROM {table}")],
                    false,
                )
                .await?;
            if rows.len() != 1 {
                return Err(VerifyError::DataLoss {
                    member: ctx.handle.name.clone(),
                    detail: format!(
                        "expected exactly one isolation record, found {}",
                        rows.len()
                    ),
                });
            }
            records.push(rows[0].first().cloned().unwrap_or_default());
        }

        if records[0] == records[1] {
            return Err(VerifyError::DataLoss {
                member: format!("{}/{}", a.handle.name, b.handle.name),
                detail: format!(
                    "isolation record {:?} replicated across independent clusters",
                    records[0]
                ),
            });
        }
        info!(
            a = %a.handle.name,
            b = %b.handle.name,
            "clusters hold distinct isolation records"
        );
        Ok(())
    }
}

/// Random identifier for probe rows, so reruns never collide.
fn random_marker() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}
