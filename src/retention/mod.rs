//! Retention horizons and snapshot compaction.
//!
//! Old executions and reality checks are dropped outright once they age past
//! their horizon. Valuation snapshots are not dropped; days older than the
//! compaction age are thinned to the day's last observation so daily
//! roll-ups keep their closing values. Rows younger than a horizon are never
//! touched, and the current day is always left alone.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub keep_executions_days: i64,
    pub compact_valuations_after_days: i64,
    pub keep_reality_checks_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_executions_days: 730,
            compact_valuations_after_days: 90,
            keep_reality_checks_days: 365,
        }
    }
}

/// Counts of rows affected by one retention run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub executions_deleted: usize,
    pub reality_checks_deleted: usize,
    pub valuations_compacted: usize,
}

/// Apply the retention policy as of `now`.
pub fn run(
    conn: &Connection,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<CompactionReport> {
    let today = now.date_naive();

    let execution_horizon = today - Duration::days(policy.keep_executions_days);
    let executions_deleted = conn.execute(
        "DELETE FROM executions WHERE date(executed_at) < ?1",
        params![execution_horizon],
    )?;

    let reality_horizon = today - Duration::days(policy.keep_reality_checks_days);
    let reality_checks_deleted = conn.execute(
        "DELETE FROM reality_checks WHERE check_date < ?1",
        params![reality_horizon],
    )?;

    // thin each old day to its last snapshot; the MAX() subquery pins the
    // row that daily roll-ups use as the day's close
    let compaction_horizon = today - Duration::days(policy.compact_valuations_after_days);
    let valuations_compacted = conn.execute(
        r#"DELETE FROM valuation_snapshots AS v
           WHERE date(v.snapshot_time) < ?1
             AND v.snapshot_time < (
                 SELECT MAX(s.snapshot_time)
                 FROM valuation_snapshots AS s
                 WHERE s.account_id = v.account_id
                   AND date(s.snapshot_time) = date(v.snapshot_time)
             )"#,
        params![compaction_horizon],
    )?;

    let report = CompactionReport {
        executions_deleted,
        reality_checks_deleted,
        valuations_compacted,
    };
    log::info!(
        "retention run: {} executions, {} reality checks deleted, {} snapshots compacted",
        report.executions_deleted,
        report.reality_checks_deleted,
        report.valuations_compacted
    );
    Ok(report)
}
