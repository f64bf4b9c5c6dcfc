//! Equity curve aggregation over valuation snapshots.
//!
//! Derived views only: every call recomputes from committed rows, so results
//! are always consistent with the latest data at the cost of O(n) work.
//! Daily roll-ups use last-observation semantics (the day's closing values
//! come from its latest snapshot, not an average).

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;

use crate::models::{DailyRollup, EquityPoint, MonthlyReturn, PnlPoint, ValuationSnapshot};

/// Relative tolerance for the equity = cash + invested write invariant.
const BALANCE_TOLERANCE: f64 = 1e-6;

/// Save one valuation snapshot. Snapshot times are truncated to the minute;
/// a second snapshot in the same minute updates the first.
pub fn save_snapshot(conn: &Connection, snapshot: &ValuationSnapshot) -> Result<()> {
    let truncated = snapshot
        .snapshot_time
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(snapshot.snapshot_time);

    conn.execute(
        r#"INSERT INTO valuation_snapshots
           (account_id, snapshot_time, total_equity, cash_balance, invested_value,
            total_pnl, daily_pnl, currency, account_mode)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT (account_id, snapshot_time) DO UPDATE SET
               total_equity = excluded.total_equity,
               cash_balance = excluded.cash_balance,
               invested_value = excluded.invested_value,
               total_pnl = excluded.total_pnl,
               daily_pnl = excluded.daily_pnl"#,
        params![
            snapshot.account_id,
            truncated,
            snapshot.total_equity,
            snapshot.cash_balance,
            snapshot.invested_value,
            snapshot.total_pnl,
            snapshot.daily_pnl,
            snapshot.currency,
            snapshot.account_mode,
        ],
    )?;
    Ok(())
}

pub fn save_snapshots_batch(conn: &Connection, snapshots: &[ValuationSnapshot]) -> Result<usize> {
    for snapshot in snapshots {
        save_snapshot(conn, snapshot)?;
    }
    Ok(snapshots.len())
}

fn map_snapshot(row: &Row) -> rusqlite::Result<ValuationSnapshot> {
    Ok(ValuationSnapshot {
        account_id: row.get("account_id")?,
        snapshot_time: row.get("snapshot_time")?,
        total_equity: row.get("total_equity")?,
        cash_balance: row.get("cash_balance")?,
        invested_value: row.get("invested_value")?,
        total_pnl: row.get("total_pnl")?,
        daily_pnl: row.get("daily_pnl")?,
        currency: row.get("currency")?,
        account_mode: row.get("account_mode")?,
    })
}

/// All snapshots for an account, time ascending.
fn load_snapshots(conn: &Connection, account_id: &str) -> Result<Vec<ValuationSnapshot>> {
    let mut stmt = conn.prepare(
        r#"SELECT account_id, snapshot_time, total_equity, cash_balance, invested_value,
                  total_pnl, daily_pnl, currency, account_mode
           FROM valuation_snapshots
           WHERE account_id = ?1
           ORDER BY snapshot_time ASC"#,
    )?;
    let snapshots = stmt
        .query_map(params![account_id], map_snapshot)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(snapshots)
}

/// Write invariant: equity must equal cash + invested. Violating rows are
/// excluded from every aggregate, with a warning; the rest of the batch is
/// unaffected.
fn is_balanced(snapshot: &ValuationSnapshot) -> bool {
    let expected = snapshot.cash_balance + snapshot.invested_value;
    let scale = snapshot.total_equity.abs().max(1.0);
    let balanced = (snapshot.total_equity - expected).abs() <= BALANCE_TOLERANCE * scale;
    if !balanced {
        log::warn!(
            "excluding unbalanced snapshot for {} at {}: equity {} != cash {} + invested {}",
            snapshot.account_id,
            snapshot.snapshot_time,
            snapshot.total_equity,
            snapshot.cash_balance,
            snapshot.invested_value
        );
    }
    balanced
}

/// Daily roll-ups for an account over [from, to], date ascending.
pub fn daily_rollups(
    conn: &Connection,
    account_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyRollup>> {
    let snapshots = load_snapshots(conn, account_id)?;

    let mut by_day: BTreeMap<NaiveDate, Vec<&ValuationSnapshot>> = BTreeMap::new();
    for snapshot in snapshots.iter().filter(|s| is_balanced(s)) {
        let date = snapshot.snapshot_time.date_naive();
        if date >= from && date <= to {
            by_day.entry(date).or_default().push(snapshot);
        }
    }

    let rollups = by_day
        .into_iter()
        .map(|(date, day)| {
            // loaded in ascending time order, so the last entry closes the day
            let closing = day.last().expect("day groups are non-empty");
            let high = day.iter().map(|s| s.total_equity).fold(f64::MIN, f64::max);
            let low = day.iter().map(|s| s.total_equity).fold(f64::MAX, f64::min);
            DailyRollup {
                date,
                close_equity: closing.total_equity,
                close_cash: closing.cash_balance,
                close_invested: closing.invested_value,
                high_equity: high,
                low_equity: low,
                daily_pnl: closing.daily_pnl,
                snapshot_count: day.len(),
            }
        })
        .collect();

    Ok(rollups)
}

/// Monthly returns for an account, oldest month first.
///
/// Opening equity is the month's first snapshot, closing its last. A month
/// opening at zero or negative equity returns 0 (freshly funded accounts).
pub fn monthly_returns(conn: &Connection, account_id: &str) -> Result<Vec<MonthlyReturn>> {
    let snapshots = load_snapshots(conn, account_id)?;

    let mut by_month: BTreeMap<(i32, u32), (f64, f64)> = BTreeMap::new();
    for snapshot in snapshots.iter().filter(|s| is_balanced(s)) {
        let key = (
            snapshot.snapshot_time.year(),
            snapshot.snapshot_time.month(),
        );
        by_month
            .entry(key)
            .and_modify(|(_, closing)| *closing = snapshot.total_equity)
            .or_insert((snapshot.total_equity, snapshot.total_equity));
    }

    let returns = by_month
        .into_iter()
        .map(|((year, month), (opening, closing))| {
            let return_pct = if opening > 0.0 {
                (closing - opening) / opening * 100.0
            } else {
                0.0
            };
            MonthlyReturn {
                year,
                month,
                opening_equity: opening,
                closing_equity: closing,
                return_pct,
            }
        })
        .collect();

    Ok(returns)
}

/// Cumulative PnL series: a date-ordered lazy running sum of each day's
/// realized PnL net of that day's execution fees. Nothing is persisted; a
/// fresh call always reflects the latest committed rows.
pub fn cumulative_pnl(
    conn: &Connection,
    account_id: &str,
) -> Result<impl Iterator<Item = PnlPoint>> {
    let snapshots = load_snapshots(conn, account_id)?;

    let mut daily: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for snapshot in snapshots.iter().filter(|s| is_balanced(s)) {
        // ascending order: the last write per day wins (closing snapshot)
        daily.insert(snapshot.snapshot_time.date_naive(), snapshot.daily_pnl);
    }

    let mut fees: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut stmt = conn.prepare(
        r#"SELECT date(executed_at) AS day, COALESCE(SUM(fee), 0) AS fees
           FROM executions
           WHERE account_id = ?1
           GROUP BY date(executed_at)"#,
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        Ok((row.get::<_, NaiveDate>("day")?, row.get::<_, f64>("fees")?))
    })?;
    for row in rows {
        let (day, fee) = row?;
        fees.insert(day, fee);
    }

    let series = daily.into_iter().scan(0.0, move |running, (date, pnl)| {
        let day_fees = fees.get(&date).copied().unwrap_or(0.0);
        *running += pnl - day_fees;
        Some(PnlPoint {
            date,
            daily_pnl: pnl,
            fees: day_fees,
            cumulative_pnl: *running,
        })
    });

    Ok(series)
}

/// Per-snapshot equity curve over [start, end] with running drawdown from
/// peak and return from the first observation.
pub fn equity_curve(
    conn: &Connection,
    account_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<EquityPoint>> {
    let snapshots = load_snapshots(conn, account_id)?;

    let mut initial: Option<f64> = None;
    let mut peak = f64::MIN;
    let mut curve = Vec::new();

    for snapshot in snapshots.iter().filter(|s| is_balanced(s)) {
        if snapshot.snapshot_time < start || snapshot.snapshot_time > end {
            continue;
        }
        let equity = snapshot.total_equity;
        let first = *initial.get_or_insert(equity);
        peak = peak.max(equity);

        let drawdown_pct = if peak > 0.0 {
            (peak - equity) / peak * 100.0
        } else {
            0.0
        };
        let return_pct = if first > 0.0 {
            (equity - first) / first * 100.0
        } else {
            0.0
        };

        curve.push(EquityPoint {
            timestamp: snapshot.snapshot_time,
            equity,
            drawdown_pct,
            return_pct,
        });
    }

    Ok(curve)
}
