//! Record store for executions and the per-(account, source) sync cursor.
//!
//! Executions are append-only: the dedup key (account, source, order, trade)
//! makes re-delivery a no-op at the storage layer. Cursor updates are a
//! read-then-decide upsert so the monotonicity rule is visible in code.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::{ExecutionRecord, NewExecution, Side, SyncCursor, SyncStatus};

/// Insert one execution unless its dedup key already exists.
///
/// Returns true when a new row was written. A key collision is a success
/// no-op, never an error.
pub fn insert_if_absent(
    conn: &Connection,
    exec: &NewExecution,
    now: DateTime<Utc>,
) -> Result<bool> {
    let trade_id = exec.trade_id.clone().unwrap_or_default();
    let raw_data = exec
        .raw_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let inserted = conn.execute(
        r#"INSERT OR IGNORE INTO executions
           (id, account_id, source, executed_at, symbol, normalized_symbol, side,
            quantity, price, amount, fee, fee_currency,
            order_id, trade_id, order_type, raw_data, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
        params![
            Uuid::new_v4().to_string(),
            exec.account_id,
            exec.source,
            exec.executed_at,
            exec.symbol,
            exec.normalized_symbol,
            exec.side.as_str(),
            exec.quantity,
            exec.price,
            exec.amount,
            exec.fee,
            exec.fee_currency,
            exec.order_id,
            trade_id,
            exec.order_type,
            raw_data,
            now,
        ],
    )?;

    Ok(inserted > 0)
}

/// Insert a batch of executions, returning the number of newly written rows
/// (duplicates do not count).
pub fn insert_batch(
    conn: &Connection,
    executions: &[NewExecution],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut inserted = 0;
    for exec in executions {
        if insert_if_absent(conn, exec, now)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn map_execution(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    let side: String = row.get("side")?;
    let trade_id: String = row.get("trade_id")?;
    let raw: Option<String> = row.get("raw_data")?;

    Ok(ExecutionRecord {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        source: row.get("source")?,
        executed_at: row.get("executed_at")?,
        symbol: row.get("symbol")?,
        normalized_symbol: row.get("normalized_symbol")?,
        side: Side::from_str(&side).unwrap_or(Side::Buy),
        quantity: row.get("quantity")?,
        price: row.get("price")?,
        amount: row.get("amount")?,
        fee: row.get("fee")?,
        fee_currency: row.get("fee_currency")?,
        order_id: row.get("order_id")?,
        trade_id: if trade_id.is_empty() { None } else { Some(trade_id) },
        order_type: row.get("order_type")?,
        raw_data: raw.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get("created_at")?,
    })
}

/// All executions for an account+source, newest first.
pub fn get_all_executions(
    conn: &Connection,
    account_id: &str,
    source: &str,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, account_id, source, executed_at, symbol, normalized_symbol, side,
                  quantity, price, amount, fee, fee_currency,
                  order_id, trade_id, order_type, raw_data, created_at
           FROM executions
           WHERE account_id = ?1 AND source = ?2
           ORDER BY executed_at DESC"#,
    )?;

    let records = stmt
        .query_map(params![account_id, source], map_execution)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Executions for an account+source within [start, end], newest first.
pub fn get_executions_in_range(
    conn: &Connection,
    account_id: &str,
    source: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, account_id, source, executed_at, symbol, normalized_symbol, side,
                  quantity, price, amount, fee, fee_currency,
                  order_id, trade_id, order_type, raw_data, created_at
           FROM executions
           WHERE account_id = ?1 AND source = ?2
             AND executed_at >= ?3 AND executed_at <= ?4
           ORDER BY executed_at DESC"#,
    )?;

    let records = stmt
        .query_map(params![account_id, source, start, end], map_execution)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn count_executions(conn: &Connection, account_id: &str, source: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE account_id = ?1 AND source = ?2",
        params![account_id, source],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Load the sync cursor for an account+source, if one exists.
pub fn get_cursor(
    conn: &Connection,
    account_id: &str,
    source: &str,
) -> Result<Option<SyncCursor>> {
    let cursor = conn
        .query_row(
            r#"SELECT account_id, source, earliest_date, latest_date, total_records,
                      last_sync_at, last_sync_status, last_sync_message
               FROM sync_cursors
               WHERE account_id = ?1 AND source = ?2"#,
            params![account_id, source],
            |row| {
                let status: Option<String> = row.get("last_sync_status")?;
                Ok(SyncCursor {
                    account_id: row.get("account_id")?,
                    source: row.get("source")?,
                    earliest_date: row.get("earliest_date")?,
                    latest_date: row.get("latest_date")?,
                    total_records: row.get("total_records")?,
                    last_sync_at: row.get("last_sync_at")?,
                    last_sync_status: status.as_deref().and_then(SyncStatus::from_str),
                    last_sync_message: row.get("last_sync_message")?,
                })
            },
        )
        .optional()?;
    Ok(cursor)
}

/// Advance the cursor after a batch has been durably written.
///
/// The latest date only ever moves forward; the earliest only backward.
/// `inserted` is added to the running record count (received-but-duplicate
/// rows do not count).
pub fn advance_cursor(
    conn: &Connection,
    account_id: &str,
    source: &str,
    batch_earliest: Option<NaiveDate>,
    batch_latest: Option<NaiveDate>,
    inserted: usize,
    status: SyncStatus,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let existing = get_cursor(conn, account_id, source)?;

    let (earliest, latest, total) = match &existing {
        Some(cur) => (
            min_date(cur.earliest_date, batch_earliest),
            max_date(cur.latest_date, batch_latest),
            cur.total_records + inserted as i64,
        ),
        None => (batch_earliest, batch_latest, inserted as i64),
    };

    conn.execute(
        r#"INSERT INTO sync_cursors
           (account_id, source, earliest_date, latest_date, total_records,
            last_sync_at, last_sync_status, last_sync_message)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
           ON CONFLICT (account_id, source) DO UPDATE SET
               earliest_date = excluded.earliest_date,
               latest_date = excluded.latest_date,
               total_records = excluded.total_records,
               last_sync_at = excluded.last_sync_at,
               last_sync_status = excluded.last_sync_status,
               last_sync_message = excluded.last_sync_message"#,
        params![
            account_id,
            source,
            earliest,
            latest,
            total,
            now,
            status.as_str(),
            message,
        ],
    )?;

    Ok(())
}

/// Record a failed attempt without touching the synchronized range.
pub fn record_failed_attempt(
    conn: &Connection,
    account_id: &str,
    source: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        r#"UPDATE sync_cursors
           SET last_sync_at = ?3, last_sync_status = ?4, last_sync_message = ?5
           WHERE account_id = ?1 AND source = ?2"#,
        params![account_id, source, now, SyncStatus::Failed.as_str(), message],
    )?;

    if updated == 0 {
        conn.execute(
            r#"INSERT INTO sync_cursors
               (account_id, source, total_records, last_sync_at, last_sync_status, last_sync_message)
               VALUES (?1, ?2, 0, ?3, ?4, ?5)"#,
            params![account_id, source, now, SyncStatus::Failed.as_str(), message],
        )?;
    }

    Ok(())
}

fn min_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn max_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
