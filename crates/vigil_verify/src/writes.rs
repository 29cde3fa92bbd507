//! Continuous-writes verifier.
//!
//! An external workload writes a strictly increasing integer sequence
//! through the primary. This module asserts, per member, that (i) the
//! maximum written value keeps increasing over time and (ii) every value
//! up to a member's observed maximum is present: a later-observed higher
//! value implies every lower value was committed, so any missing integer
//! is committed-then-lost data.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::VerifyError;
use crate::poll::{PollMode, Poller};
use crate::query::{AdminCredentials, Endpoint, QueryRunner};
use crate::topology::ClusterMember;

/// Location of the workload's writes table.
#[derive(Debug, Clone)]
pub struct WritesTable {
    pub schema: String,
    pub table: String,
}

impl Default for WritesTable {
    fn default() -> Self {
        Self {
            schema: "continuous_writes".to_string(),
            table: "data".to_string(),
        }
    }
}

impl WritesTable {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Tuning for the per-member convergence window.
#[derive(Debug, Clone)]
pub struct WritesConfig {
    pub table: WritesTable,
    /// Fresh absolute deadline granted to every member in turn, so a slow
    /// earlier member does not starve later ones.
    pub per_member_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WritesConfig {
    fn default() -> Self {
        Self {
            table: WritesTable::default(),
            per_member_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Verifies workload progress and completeness across cluster members.
pub struct ContinuousWrites<R: QueryRunner> {
    runner: R,
    config: WritesConfig,
}

impl<R: QueryRunner> ContinuousWrites<R> {
    pub fn new(runner: R, config: WritesConfig) -> Self {
        Self { runner, config }
    }

    /// Reads the maximum written value on one member. An empty table reads
    /// as zero, matching the workload's 1-based sequence.
    pub async fn max_written(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
    ) -> Result<i64, VerifyError> {
        let statement = format!(
            "SELECT MAX(number) FROM {}",
            self.config.table.qualified()
        );
        let rows = self
            .runner
            .execute(endpoint, credentials, &[statement], false)
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0))
    }

    async fn written_values(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
    ) -> Result<BTreeSet<i64>, VerifyError> {
        let statement = format!("SELECT number FROM {}", self.config.table.qualified());
        let rows = self
            .runner
            .execute(endpoint, credentials, &[statement], false)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|value| value.parse::<i64>().ok())
            .collect())
    }

    /// Asserts that writes are incrementing and complete on every member,
    /// checked sequentially with independent deadlines.
    ///
    /// Per member: poll until its observed max exceeds `baseline_max`
    /// (deadline exhaustion is `StalledWrites`), then within the same
    /// attempt assert the member holds every value in `[1, max)`; a gap is
    /// `DataLoss` and is never retried. A max that moves backwards between
    /// attempts is also `DataLoss`. Returns the minimum of all members'
    /// observed maxes, a valid floor for the next invocation.
    pub async fn assert_incrementing_and_complete(
        &self,
        members: &[ClusterMember],
        credentials: &AdminCredentials,
        baseline_max: i64,
    ) -> Result<i64, VerifyError> {
        let poller = Poller::new(self.config.per_member_timeout, self.config.poll_interval)?;
        let mut new_baseline = i64::MAX;

        for member in members {
            let observed = Cell::new(baseline_max);
            let result = poller
                .await_condition(PollMode::Invariant, || {
                    let observed = &observed;
                    async move {
                        let max = self.max_written(&member.endpoint, credentials).await?;
                        if max < observed.get() {
                            return Err(VerifyError::DataLoss {
                                member: member.label.clone(),
                                detail: format!(
                                    "max written value decreased from {} to {max}",
                                    observed.get()
                                ),
                            });
                        }
                        observed.set(max);
                        if max <= baseline_max {
                            return Ok(false);
                        }

                        // Completeness is checked in the same attempt so the
                        // value set corresponds to the max just observed.
                        let values = self.written_values(&member.endpoint, credentials).await?;
                        if let Some(missing) = first_gap(&values, max) {
                            return Err(VerifyError::DataLoss {
                                member: member.label.clone(),
                                detail: format!("missing value {missing} (observed max {max})"),
                            });
                        }
                        Ok(true)
                    }
                })
                .await;

            match result {
                Ok(()) => {
                    info!(
                        member = %member.label,
                        max = observed.get(),
                        baseline_max,
                        "continuous writes incrementing and complete"
                    );
                    new_baseline = new_baseline.min(observed.get());
                }
                Err(VerifyError::DeadlineExceeded { last, timeout }) => {
                    warn!(
                        member = %member.label,
                        last_failure = %last,
                        ?timeout,
                        "writes never advanced past baseline"
                    );
                    return Err(VerifyError::StalledWrites {
                        member: member.label.clone(),
                        baseline: baseline_max,
                        observed: observed.get(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        if members.is_empty() {
            return Ok(baseline_max);
        }
        Ok(new_baseline)
    }
}

/// Smallest value in `[1, max)` absent from `values`, if any.
fn first_gap(values: &BTreeSet<i64>, max: i64) -> Option<i64> {
    let mut expected = 1;
    for value in values.range(1..max) {
        if *value != expected {
            return Some(expected);
        }
        expected += 1;
    }
    if expected < max {
        Some(expected)
    } else {
        None
    }
}
