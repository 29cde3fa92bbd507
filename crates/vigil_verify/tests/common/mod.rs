//! Shared helpers for integration tests: an in-memory fake fleet standing
//! in for the deployment layer, the credential store, and the database
//! endpoints of one or more replicated clusters.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vigil_verify::{
    AdminCredentials, ClusterHandle, CredentialSource, Deployment, DeploymentError, Endpoint,
    MemberRef, QueryRunner, Row, VerifyError,
};

/// One simulated cluster member.
struct FakeMember {
    label: String,
    role: String,
    state: String,
    reachable: bool,
    /// Highest continuous-writes value visible on this member.
    max: i64,
    /// Injected gaps in the member's value history.
    missing: BTreeSet<i64>,
    /// Scripted per-query max overrides, consumed front to back.
    max_script: VecDeque<i64>,
    /// Membership ticks left until a recovering member comes online.
    recover_countdown: u32,
}

struct ClusterState {
    members: BTreeMap<String, FakeMember>,
    /// Scratch tables keyed by qualified name, rows cluster-wide.
    tables: HashMap<String, Vec<String>>,
    committed_max: i64,
    /// Values appended to the committed sequence per max-query, zero when
    /// the simulated workload is stalled.
    auto_increment: i64,
    /// Membership queries left until a killed primary's replacement wins.
    election_countdown: Option<u32>,
    elections_enabled: bool,
    /// Units destroyed through the deployment layer; they stay in the
    /// membership table as stale offline rows but leave the unit list.
    removed: BTreeSet<String>,
    next_unit: usize,
}

/// A single simulated cluster.
pub struct FakeCluster {
    pub name: String,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(name: &str, size: usize) -> Arc<Self> {
        let mut members = BTreeMap::new();
        for idx in 0..size {
            let label = format!("{name}-{idx}");
            members.insert(
                label.clone(),
                FakeMember {
                    label,
                    role: if idx == 0 { "primary" } else { "secondary" }.to_string(),
                    state: "online".to_string(),
                    reachable: true,
                    max: 0,
                    missing: BTreeSet::new(),
                    max_script: VecDeque::new(),
                    recover_countdown: 0,
                },
            );
        }
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(ClusterState {
                members,
                tables: HashMap::new(),
                committed_max: 0,
                auto_increment: 3,
                election_countdown: None,
                elections_enabled: true,
                removed: BTreeSet::new(),
                next_unit: size,
            }),
        })
    }

    pub fn set_auto_increment(&self, step: i64) {
        self.state.lock().unwrap().auto_increment = step;
    }

    pub fn disable_elections(&self) {
        self.state.lock().unwrap().elections_enabled = false;
    }

    /// Pins one member's visible max (and raises the committed sequence to
    /// match, so values up to `max` count as committed).
    pub fn set_member_max(&self, label: &str, max: i64) {
        let mut state = self.state.lock().unwrap();
        state.committed_max = state.committed_max.max(max);
        state.members.get_mut(label).expect("member").max = max;
    }

    pub fn inject_gap(&self, label: &str, value: i64) {
        let mut state = self.state.lock().unwrap();
        state
            .members
            .get_mut(label)
            .expect("member")
            .missing
            .insert(value);
    }

    pub fn script_max(&self, label: &str, script: &[i64]) {
        let mut state = self.state.lock().unwrap();
        state.members.get_mut(label).expect("member").max_script = script.iter().copied().collect();
    }

    pub fn primary_label(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .members
            .values()
            .find(|m| m.role == "primary" && m.state == "online")
            .map(|m| m.label.clone())
    }

    pub fn has_table(&self, qualified: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(qualified)
    }

    fn contains_endpoint(&self, host: &str) -> bool {
        self.state.lock().unwrap().members.contains_key(host)
    }
}

impl ClusterState {
    /// Advances membership-driven transitions: elections and recoveries.
    fn tick_membership(&mut self) {
        if let Some(countdown) = self.election_countdown {
            if countdown <= 1 {
                self.election_countdown = None;
                if let Some(candidate) = self
                    .members
                    .values_mut()
                    .find(|m| m.state == "online" && m.role == "secondary")
                {
                    candidate.role = "primary".to_string();
                }
            } else {
                self.election_countdown = Some(countdown - 1);
            }
        }
        let committed = self.committed_max;
        for member in self.members.values_mut() {
            if member.state == "recovering" {
                if member.recover_countdown <= 1 {
                    member.state = "online".to_string();
                    member.max = committed;
                } else {
                    member.recover_countdown -= 1;
                }
            }
        }
    }

    /// Advances the simulated workload and replicates to online members.
    fn tick_writes(&mut self) {
        if self.auto_increment > 0 {
            self.committed_max += self.auto_increment;
            let committed = self.committed_max;
            for member in self.members.values_mut() {
                if member.state == "online" {
                    member.max = committed;
                }
            }
        }
    }

    fn membership_rows(&self) -> Vec<Row> {
        self.members
            .values()
            .map(|m| {
                vec![
                    m.label.clone(),
                    format!("{}:5432", m.label),
                    m.role.clone(),
                    m.state.clone(),
                ]
            })
            .collect()
    }
}

/// Routes queries and deployment operations to one or more fake clusters.
pub struct FakeFleet {
    clusters: Vec<Arc<FakeCluster>>,
    /// When true, scratch-table DML replicates across every cluster,
    /// simulating the cross-contamination bug the isolation check exists
    /// to catch.
    linked: bool,
}

impl FakeFleet {
    pub fn new(clusters: Vec<Arc<FakeCluster>>) -> Arc<Self> {
        Arc::new(Self {
            clusters,
            linked: false,
        })
    }

    pub fn new_linked(clusters: Vec<Arc<FakeCluster>>) -> Arc<Self> {
        Arc::new(Self {
            clusters,
            linked: true,
        })
    }

    fn cluster_by_name(&self, name: &str) -> Result<&Arc<FakeCluster>, DeploymentError> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DeploymentError::msg(format!("unknown cluster {name}")))
    }

    fn cluster_by_endpoint(&self, host: &str) -> Option<&Arc<FakeCluster>> {
        self.clusters.iter().find(|c| c.contains_endpoint(host))
    }

    /// Applies a scratch-table mutation, spilling across clusters when the
    /// fleet is linked.
    fn scratch_apply(&self, origin: &FakeCluster, apply: impl Fn(&mut ClusterState)) {
        if self.linked {
            for cluster in &self.clusters {
                apply(&mut cluster.state.lock().unwrap());
            }
        } else {
            apply(&mut origin.state.lock().unwrap());
        }
    }
}

fn unreachable_error(endpoint: &Endpoint) -> VerifyError {
    VerifyError::Connection {
        endpoint: endpoint.to_string(),
        source: anyhow::anyhow!("connection refused"),
    }
}

/// Pulls the table name out of statements shaped like the engine's SQL.
fn table_token(statement: &str, keyword: &str) -> Option<String> {
    let rest = statement.split(keyword).nth(1)?;
    let token = rest.split_whitespace().next()?;
    Some(token.trim_end_matches(';').to_string())
}

fn quoted_value(statement: &str) -> Option<String> {
    let start = statement.find('\'')? + 1;
    let end = statement[start..].find('\'')? + start;
    Some(statement[start..end].to_string())
}

#[async_trait]
impl QueryRunner for FakeFleet {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        _credentials: &AdminCredentials,
        statements: &[String],
        _transactional: bool,
    ) -> Result<Vec<Row>, VerifyError> {
        let cluster = self
            .cluster_by_endpoint(&endpoint.host)
            .ok_or_else(|| unreachable_error(endpoint))?;

        {
            let state = cluster.state.lock().unwrap();
            let member = state
                .members
                .get(&endpoint.host)
                .ok_or_else(|| unreachable_error(endpoint))?;
            if !member.reachable {
                return Err(unreachable_error(endpoint));
            }
        }

        let mut rows = Vec::new();
        for statement in statements {
            let statement = statement.trim();
            if statement.starts_with("SELECT member_label") {
                let mut state = cluster.state.lock().unwrap();
                state.tick_membership();
                rows.extend(state.membership_rows());
            } else if statement.starts_with("SELECT MAX(number)") {
                let mut state = cluster.state.lock().unwrap();
                state.tick_writes();
                let member = state.members.get_mut(&endpoint.host).unwrap();
                let max = member.max_script.pop_front().unwrap_or(member.max);
                member.max = max;
                rows.push(vec![if max == 0 {
                    String::new()
                } else {
                    max.to_string()
                }]);
            } else if statement.starts_with("SELECT number") {
                let state = cluster.state.lock().unwrap();
                let member = state.members.get(&endpoint.host).unwrap();
                for value in 1..=member.max {
                    if !member.missing.contains(&value) {
                        rows.push(vec![value.to_string()]);
                    }
                }
            } else if statement.starts_with("CREATE SCHEMA") {
                // Schemas are implicit in the fake.
            } else if statement.starts_with("CREATE TABLE") {
                let table = table_token(statement, "TABLE IF NOT EXISTS ")
                    .or_else(|| table_token(statement, "TABLE "))
                    .expect("table name");
                self.scratch_apply(cluster, |state| {
                    state.tables.entry(table.clone()).or_default();
                });
            } else if statement.starts_with("DROP TABLE") {
                let table = table_token(statement, "IF EXISTS ").expect("table name");
                self.scratch_apply(cluster, |state| {
                    state.tables.remove(&table);
                });
            } else if statement.starts_with("INSERT INTO") {
                let table = table_token(statement, "INTO ").expect("table name");
                let value = quoted_value(statement).expect("inserted value");
                self.scratch_apply(cluster, |state| {
                    state.tables.entry(table.clone()).or_default().push(value.clone());
                });
            } else if statement.starts_with("SELECT id FROM") {
                let table = table_token(statement, "FROM ").expect("table name");
                let wanted = quoted_value(statement);
                let state = cluster.state.lock().unwrap();
                if let Some(values) = state.tables.get(&table) {
                    for value in values {
                        if wanted.as_deref().map_or(true, |w| w == value) {
                            rows.push(vec![value.clone()]);
                        }
                    }
                }
            } else {
                return Err(VerifyError::Statement {
                    endpoint: endpoint.to_string(),
                    source: anyhow::anyhow!("fake cluster cannot parse: {statement}"),
                });
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl Deployment for FakeFleet {
    async fn get_cluster_handle(&self, name: &str) -> Result<ClusterHandle, DeploymentError> {
        self.cluster_by_name(name)?;
        Ok(ClusterHandle {
            name: name.to_string(),
        })
    }

    async fn list_members(
        &self,
        handle: &ClusterHandle,
    ) -> Result<Vec<MemberRef>, DeploymentError> {
        let cluster = self.cluster_by_name(&handle.name)?;
        let state = cluster.state.lock().unwrap();
        Ok(state
            .members
            .values()
            .filter(|m| !state.removed.contains(&m.label))
            .map(|m| MemberRef {
                unit_id: m.label.clone(),
                endpoint: Endpoint::new(m.label.clone(), 5432),
            })
            .collect())
    }

    async fn destroy_member(
        &self,
        handle: &ClusterHandle,
        unit_id: &str,
    ) -> Result<(), DeploymentError> {
        let cluster = self.cluster_by_name(&handle.name)?;
        let mut state = cluster.state.lock().unwrap();
        let was_primary = {
            let member = state
                .members
                .get_mut(unit_id)
                .ok_or_else(|| DeploymentError::msg(format!("unknown unit {unit_id}")))?;
            member.state = "offline".to_string();
            member.reachable = false;
            member.role == "primary"
        };
        state.removed.insert(unit_id.to_string());
        if was_primary && state.elections_enabled {
            state.election_countdown = Some(2);
        }
        Ok(())
    }

    async fn add_members(
        &self,
        handle: &ClusterHandle,
        count: usize,
    ) -> Result<(), DeploymentError> {
        let cluster = self.cluster_by_name(&handle.name)?;
        let mut state = cluster.state.lock().unwrap();
        for _ in 0..count {
            let label = format!("{}-{}", cluster.name, state.next_unit);
            state.next_unit += 1;
            state.members.insert(
                label.clone(),
                FakeMember {
                    label,
                    role: "secondary".to_string(),
                    state: "recovering".to_string(),
                    reachable: true,
                    max: 0,
                    missing: BTreeSet::new(),
                    max_script: VecDeque::new(),
                    recover_countdown: 2,
                },
            );
        }
        Ok(())
    }

    async fn wait_until_status(
        &self,
        handle: &ClusterHandle,
        _status: &str,
        _timeout: Duration,
    ) -> Result<(), DeploymentError> {
        self.cluster_by_name(&handle.name)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialSource for FakeFleet {
    async fn get_admin_credentials(
        &self,
        _member: &MemberRef,
    ) -> Result<AdminCredentials, DeploymentError> {
        Ok(AdminCredentials {
            username: "serverconfig".to_string(),
            password: "fake-password".to_string(),
        })
    }
}

/// Installs a test-writer subscriber once per process so engine logs
/// surface under `RUST_LOG` when a test fails.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Scenario deadlines shrunk for paused-clock tests.
pub fn fast_config() -> vigil_verify::ScenarioConfig {
    let mut config = vigil_verify::ScenarioConfig::default();
    config.election_timeout = Duration::from_secs(5);
    config.membership_timeout = Duration::from_secs(5);
    config.replication_timeout = Duration::from_secs(2);
    config.poll_interval = Duration::from_millis(100);
    config.deployment_status_timeout = Duration::from_secs(5);
    config.writes.per_member_timeout = Duration::from_secs(2);
    config.writes.poll_interval = Duration::from_millis(50);
    config
}
