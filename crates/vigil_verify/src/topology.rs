//! Topology observer: point-in-time cluster membership snapshots.
//!
//! Every sample is a fresh, immutable view built from the group-replication
//! membership table of the first reachable member. Ambiguous or partial
//! states (a recovering joiner, a stale primary flag on an offline member,
//! split-brain look-alikes) are encoded as role/health values in the
//! snapshot rather than raised as errors, so callers apply their own
//! tolerance policy.

use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::VerifyError;
use crate::query::{AdminCredentials, Endpoint, QueryRunner, Row};

/// Membership view queried on any reachable member. Column order:
/// label, endpoint, role, state.
pub const GROUP_MEMBERS_QUERY: &str = "SELECT member_label, member_endpoint, member_role, \
     member_state FROM replication_group_members";

/// Replication role of a member as reported by the cluster itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Primary,
    Secondary,
    Unknown,
}

impl MemberRole {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" | "r/w" => MemberRole::Primary,
            "secondary" | "r/o" => MemberRole::Secondary,
            _ => MemberRole::Unknown,
        }
    }
}

/// Health of a member. Unrecognized states map to `Error` so a consumer
/// never mistakes a bad member for a healthy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberHealth {
    Online,
    Offline,
    Recovering,
    Error,
}

impl MemberHealth {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => MemberHealth::Online,
            "offline" | "(missing)" => MemberHealth::Offline,
            "recovering" => MemberHealth::Recovering,
            _ => MemberHealth::Error,
        }
    }
}

/// One cluster member as seen in a single sample. Never cached between
/// samples: membership can change between polls.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterMember {
    /// Opaque unit/node identity assigned by the deployment layer.
    pub label: String,
    /// SQL endpoint of this member.
    pub endpoint: Endpoint,
    pub role: MemberRole,
    pub health: MemberHealth,
}

/// Immutable membership snapshot taken at one point in time.
///
/// Members keep the order the membership query returned them in.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    members: Vec<ClusterMember>,
    #[serde(skip)]
    pub taken_at: SystemTime,
}

impl TopologySnapshot {
    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }

    pub fn member(&self, label: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.label == label)
    }

    /// All online members currently claiming the primary role. More than one
    /// entry here is a split-brain view.
    pub fn online_primaries(&self) -> Vec<&ClusterMember> {
        self.members
            .iter()
            .filter(|m| m.health == MemberHealth::Online && m.role == MemberRole::Primary)
            .collect()
    }

    /// The unique online primary, if exactly one exists. Offline members
    /// retain stale role data and are deliberately ignored here.
    pub fn primary(&self) -> Option<&ClusterMember> {
        let primaries = self.online_primaries();
        match primaries.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    pub fn online_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.health == MemberHealth::Online)
            .count()
    }

    /// Compact JSON rendering attached to failure diagnostics.
    pub fn describe(&self) -> String {
        serde_json::to_string(&self.members).unwrap_or_else(|_| format!("{:?}", self.members))
    }
}

/// Samples cluster membership through the query runner.
pub struct TopologyObserver<R: QueryRunner> {
    runner: R,
    status_query: String,
}

impl<R: QueryRunner> TopologyObserver<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            status_query: GROUP_MEMBERS_QUERY.to_string(),
        }
    }

    /// Overrides the membership query, for clusters exposing the view under
    /// a different name.
    pub fn with_status_query(mut self, query: impl Into<String>) -> Self {
        self.status_query = query.into();
        self
    }

    /// Takes a snapshot by asking the first of `candidates` that can serve
    /// the membership view.
    ///
    /// Reading membership does not require the primary: every member serves
    /// the same group view. A candidate that is unreachable, or that accepts
    /// the connection but cannot answer the status query (a joiner whose
    /// view table is not created yet), is skipped. The only terminal error
    /// is `TopologyUnavailable`, raised when every candidate was skipped and
    /// carrying the last failure seen.
    pub async fn sample(
        &self,
        candidates: &[Endpoint],
        credentials: &AdminCredentials,
    ) -> Result<TopologySnapshot, VerifyError> {
        let statements = [self.status_query.clone()];
        let mut last_failure = "no candidate members supplied".to_string();

        for endpoint in candidates {
            match self
                .runner
                .execute(endpoint, credentials, &statements, false)
                .await
            {
                Ok(rows) => {
                    let snapshot = parse_snapshot(rows);
                    debug!(
                        via = %endpoint,
                        members = snapshot.members.len(),
                        online = snapshot.online_count(),
                        "sampled topology"
                    );
                    return Ok(snapshot);
                }
                Err(err) if err.is_transient() => {
                    debug!(via = %endpoint, error = %err, "member unreachable for sample");
                    last_failure = err.to_string();
                }
                Err(err) => {
                    debug!(via = %endpoint, error = %err, "member cannot serve membership view");
                    last_failure = err.to_string();
                }
            }
        }

        Err(VerifyError::TopologyUnavailable {
            detail: last_failure,
        })
    }
}

fn parse_snapshot(rows: Vec<Row>) -> TopologySnapshot {
    let mut members = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 4 {
            warn!(?row, "skipping malformed membership row");
            continue;
        }
        members.push(ClusterMember {
            label: row[0].clone(),
            endpoint: Endpoint::parse(&row[1], 5432),
            role: MemberRole::parse(&row[2]),
            health: MemberHealth::parse(&row[3]),
        });
    }
    TopologySnapshot {
        members,
        taken_at: SystemTime::now(),
    }
}
