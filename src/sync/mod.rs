//! Incremental execution sync engine.
//!
//! Pulls paged execution history from an external source adapter, normalizes
//! each record, writes it through the dedup key and advances the per-account
//! cursor only after the batch is durably stored. Transient source failures
//! are reported as `partial`/`failed` outcomes, never as errors: only storage
//! failures propagate to the caller.

pub mod store;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

use crate::equity;
use crate::models::{
    NewExecution, RawExecution, SyncCursor, SyncReport, SyncStatus, ValuationSnapshot,
};

/// Pagination hard stop per sync call.
const MAX_PAGES: usize = 50;

/// Safety overlap when resuming from a cursor, to tolerate source-side late
/// arrivals. Overlapping records are deduplicated by the record store.
const OVERLAP_DAYS: i64 = 1;

/// Transient failure reported by a source adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// One page of raw execution records.
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub records: Vec<RawExecution>,
    /// None signals the terminal page.
    pub next_page_token: Option<String>,
}

/// Seam for brokerage/exchange connectors. Implementations live outside this
/// crate; they expose a paged "list executions since" call and nothing more.
pub trait SourceAdapter {
    /// Source identifier recorded with every execution (e.g. "kis", "binance").
    fn source_name(&self) -> &str;

    /// Fetch one page of executions for an account. `since = None` requests
    /// full history; `page_token` continues a previous page's result.
    fn fetch_executions(
        &self,
        account_id: &str,
        since: Option<NaiveDate>,
        page_token: Option<&str>,
    ) -> std::result::Result<ExecutionPage, SourceError>;
}

// One in-flight sync per (account, source); concurrent calls for the same
// pair would race on cursor advancement.
static SYNC_LEASES: Lazy<Mutex<HashSet<(String, String)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

struct SyncLease {
    key: (String, String),
}

impl SyncLease {
    fn acquire(account_id: &str, source: &str) -> Option<Self> {
        let key = (account_id.to_string(), source.to_string());
        let mut held = SYNC_LEASES.lock().expect("sync lease registry poisoned");
        if held.insert(key.clone()) {
            Some(Self { key })
        } else {
            None
        }
    }
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        let mut held = SYNC_LEASES.lock().expect("sync lease registry poisoned");
        held.remove(&self.key);
    }
}

/// Normalize a raw symbol. Six-digit numeric codes are KRX listings and get a
/// `.KS` suffix; everything else is upper-cased as-is.
pub fn normalize_symbol(symbol: &str) -> String {
    let trimmed = symbol.trim();
    if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("{}.KS", trimmed)
    } else {
        trimmed.to_uppercase()
    }
}

/// Normalize one raw execution into its storable form.
fn normalize(account_id: &str, source: &str, raw: RawExecution) -> NewExecution {
    let symbol = raw.symbol.trim().to_string();
    let amount = raw.amount.unwrap_or(raw.quantity * raw.price);
    let fee_currency = raw.fee_currency.clone().or_else(|| Some("USD".to_string()));

    NewExecution {
        account_id: account_id.to_string(),
        source: source.to_string(),
        executed_at: raw.executed_at,
        normalized_symbol: Some(normalize_symbol(&symbol)),
        symbol,
        side: raw.side,
        quantity: raw.quantity,
        price: raw.price,
        amount,
        fee: raw.fee,
        fee_currency,
        order_id: raw.order_id,
        trade_id: raw.trade_id,
        order_type: raw.order_type,
        raw_data: raw.raw_data,
    }
}

fn report(
    status: SyncStatus,
    pages: usize,
    received: usize,
    inserted: usize,
    latest: Option<NaiveDate>,
    message: Option<String>,
) -> SyncReport {
    SyncReport {
        status,
        pages_fetched: pages,
        records_received: received,
        records_inserted: inserted,
        latest_date: latest,
        message,
    }
}

/// Synchronize one (account, source) pair.
///
/// Re-running with an unchanged or overlapping window inserts zero additional
/// rows; the dedup key, not engine bookkeeping, enforces this. The returned
/// report mirrors what was written to the cursor.
pub fn sync_account(
    conn: &Connection,
    adapter: &dyn SourceAdapter,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<SyncReport> {
    let source = adapter.source_name().to_string();

    let _lease = match SyncLease::acquire(account_id, &source) {
        Some(lease) => lease,
        None => {
            log::warn!(
                "sync already in progress for {}/{}, skipping",
                account_id,
                source
            );
            return Ok(report(
                SyncStatus::Failed,
                0,
                0,
                0,
                None,
                Some("sync already in progress".to_string()),
            ));
        }
    };

    let cursor = store::get_cursor(conn, account_id, &source)?;
    let since = cursor
        .as_ref()
        .and_then(|c| c.latest_date)
        .map(|d| d - Duration::days(OVERLAP_DAYS));

    log::debug!(
        "syncing {}/{} since {:?} (cursor: {:?})",
        account_id,
        source,
        since,
        cursor.as_ref().map(|c| c.latest_date)
    );

    let mut page_token: Option<String> = None;
    let mut pages_ok = 0usize;
    let mut received = 0usize;
    let mut inserted = 0usize;
    let mut batch_earliest: Option<NaiveDate> = None;
    let mut batch_latest: Option<NaiveDate> = None;

    loop {
        if pages_ok >= MAX_PAGES {
            // Stop here; the advanced cursor lets the next run resume.
            let message = format!("page limit of {} reached, resuming next run", MAX_PAGES);
            log::warn!("{}/{}: {}", account_id, source, message);
            store::advance_cursor(
                conn,
                account_id,
                &source,
                batch_earliest,
                batch_latest,
                inserted,
                SyncStatus::Partial,
                Some(&message),
                now,
            )?;
            return Ok(report(
                SyncStatus::Partial,
                pages_ok,
                received,
                inserted,
                batch_latest,
                Some(message),
            ));
        }

        let page = match adapter.fetch_executions(account_id, since, page_token.as_deref()) {
            Ok(page) => page,
            Err(e) => {
                if pages_ok == 0 {
                    // Nothing written this call: the cursor range stays put.
                    let message = format!("fetch failed on first page: {}", e);
                    log::warn!("{}/{}: {}", account_id, source, message);
                    store::record_failed_attempt(conn, account_id, &source, &message, now)?;
                    return Ok(report(
                        SyncStatus::Failed,
                        0,
                        0,
                        0,
                        None,
                        Some(message),
                    ));
                }

                // Pages before the failure are durable; advance to that
                // contiguous boundary so the next run resumes behind it.
                let message = format!("fetch failed after page {}: {}", pages_ok, e);
                log::warn!("{}/{}: {}", account_id, source, message);
                store::advance_cursor(
                    conn,
                    account_id,
                    &source,
                    batch_earliest,
                    batch_latest,
                    inserted,
                    SyncStatus::Partial,
                    Some(&message),
                    now,
                )?;
                return Ok(report(
                    SyncStatus::Partial,
                    pages_ok,
                    received,
                    inserted,
                    batch_latest,
                    Some(message),
                ));
            }
        };

        let normalized: Vec<NewExecution> = page
            .records
            .into_iter()
            .map(|raw| normalize(account_id, &source, raw))
            .collect();

        received += normalized.len();
        inserted += store::insert_batch(conn, &normalized, now)?;

        for exec in &normalized {
            let date = exec.executed_at.date_naive();
            batch_earliest = Some(batch_earliest.map_or(date, |d| d.min(date)));
            batch_latest = Some(batch_latest.map_or(date, |d| d.max(date)));
        }

        pages_ok += 1;

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    store::advance_cursor(
        conn,
        account_id,
        &source,
        batch_earliest,
        batch_latest,
        inserted,
        SyncStatus::Success,
        None,
        now,
    )?;

    log::info!(
        "synced {}/{}: {} pages, {} received, {} new",
        account_id,
        source,
        pages_ok,
        received,
        inserted
    );

    Ok(report(
        SyncStatus::Success,
        pages_ok,
        received,
        inserted,
        batch_latest,
        None,
    ))
}

/// Cursor snapshot for UI "last synced" indicators.
pub fn get_status(
    conn: &Connection,
    account_id: &str,
    source: &str,
) -> Result<Option<SyncCursor>> {
    store::get_cursor(conn, account_id, source)
}

/// Rebuild a daily valuation history from cached executions.
///
/// Walks daily net cash flow backwards from the current equity: a buy reduces
/// cash, a sell adds the proceeds. Produces one noon-UTC snapshot per trading
/// day, which the equity aggregator then rolls up like any poller-written
/// snapshot. Returns the number of snapshots written.
pub fn rebuild_equity_history(
    conn: &Connection,
    account_id: &str,
    source: &str,
    current_equity: f64,
    currency: &str,
    account_mode: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let executions = store::get_all_executions(conn, account_id, source)?;
    if executions.is_empty() {
        return Ok(0);
    }

    let mut daily_flow: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for exec in &executions {
        let date = exec.executed_at.date_naive();
        let flow = match exec.side {
            crate::models::Side::Buy => -exec.amount,
            crate::models::Side::Sell => exec.amount,
        };
        *daily_flow.entry(date).or_insert(0.0) += flow - exec.fee.unwrap_or(0.0);
    }

    let today = now.date_naive();
    let mut equity = current_equity;
    let mut daily_equity: Vec<(NaiveDate, f64)> = vec![(today, equity)];

    for date in daily_flow.keys().rev() {
        if *date >= today {
            continue;
        }
        if let Some(&flow) = daily_flow.get(date) {
            equity -= flow;
        }
        daily_equity.push((*date, equity));
    }
    daily_equity.sort_by_key(|(d, _)| *d);

    let snapshots: Vec<ValuationSnapshot> = daily_equity
        .iter()
        .map(|(date, eq)| ValuationSnapshot {
            account_id: account_id.to_string(),
            snapshot_time: Utc
                .from_utc_datetime(&date.and_hms_opt(12, 0, 0).expect("noon is valid")),
            total_equity: *eq,
            cash_balance: *eq,
            invested_value: 0.0,
            total_pnl: *eq - current_equity,
            daily_pnl: daily_flow.get(date).copied().unwrap_or(0.0),
            currency: currency.to_string(),
            account_mode: account_mode.map(String::from),
        })
        .collect();

    let saved = equity::save_snapshots_batch(conn, &snapshots)?;
    log::info!(
        "rebuilt {} daily equity points from {} executions for {}",
        saved,
        executions.len(),
        account_id
    );
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::Side;
    use chrono::TimeZone;

    struct MockAdapter {
        name: String,
        pages: Vec<std::result::Result<ExecutionPage, String>>,
    }

    impl MockAdapter {
        fn new(name: &str, pages: Vec<std::result::Result<ExecutionPage, String>>) -> Self {
            Self { name: name.to_string(), pages }
        }
    }

    impl SourceAdapter for MockAdapter {
        fn source_name(&self) -> &str {
            &self.name
        }

        fn fetch_executions(
            &self,
            _account_id: &str,
            _since: Option<NaiveDate>,
            page_token: Option<&str>,
        ) -> std::result::Result<ExecutionPage, SourceError> {
            let index: usize = page_token.map_or(0, |t| t.parse().unwrap());
            match &self.pages[index] {
                Ok(page) => Ok(page.clone()),
                Err(msg) => Err(SourceError::Unavailable(msg.clone())),
            }
        }
    }

    fn raw(order_id: &str, day: u32, price: f64) -> RawExecution {
        RawExecution {
            executed_at: Utc.with_ymd_and_hms(2025, 3, day, 10, 0, 0).unwrap(),
            symbol: "005930".to_string(),
            side: Side::Buy,
            quantity: 1.0,
            price,
            amount: None,
            fee: Some(1.0),
            fee_currency: None,
            order_id: order_id.to_string(),
            trade_id: None,
            order_type: None,
            raw_data: None,
        }
    }

    fn page(records: Vec<RawExecution>, next: Option<&str>) -> ExecutionPage {
        ExecutionPage {
            records,
            next_page_token: next.map(String::from),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 20, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_full_history_sync_success() {
        let conn = db::init_in_memory().unwrap();
        let adapter = MockAdapter::new(
            "mock-a",
            vec![
                Ok(page(vec![raw("o1", 1, 100.0), raw("o2", 2, 101.0)], Some("1"))),
                Ok(page(vec![raw("o3", 3, 102.0)], None)),
            ],
        );

        let result = sync_account(&conn, &adapter, "acct", fixed_now()).unwrap();
        assert_eq!(result.status, SyncStatus::Success);
        assert_eq!(result.pages_fetched, 2);
        assert_eq!(result.records_inserted, 3);

        let cursor = store::get_cursor(&conn, "acct", "mock-a").unwrap().unwrap();
        assert_eq!(cursor.latest_date, NaiveDate::from_ymd_opt(2025, 3, 3));
        assert_eq!(cursor.earliest_date, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(cursor.total_records, 3);
        assert_eq!(cursor.last_sync_status, Some(SyncStatus::Success));
    }

    #[test]
    fn test_rerun_with_overlap_inserts_nothing() {
        let conn = db::init_in_memory().unwrap();
        let adapter = MockAdapter::new(
            "mock-b",
            vec![Ok(page(vec![raw("o1", 1, 100.0), raw("o2", 2, 101.0)], None))],
        );

        let first = sync_account(&conn, &adapter, "acct", fixed_now()).unwrap();
        assert_eq!(first.records_inserted, 2);

        let second = sync_account(&conn, &adapter, "acct", fixed_now()).unwrap();
        assert_eq!(second.status, SyncStatus::Success);
        assert_eq!(second.records_received, 2);
        assert_eq!(second.records_inserted, 0);

        assert_eq!(store::count_executions(&conn, "acct", "mock-b").unwrap(), 2);
    }

    #[test]
    fn test_partial_page_failure_and_resume() {
        let conn = db::init_in_memory().unwrap();

        // Page 1 lands, page 2 dies.
        let page1: Vec<RawExecution> = (0..25).map(|i| raw(&format!("p1-{}", i), 5, 100.0)).collect();
        let failing = MockAdapter::new(
            "mock-c",
            vec![
                Ok(page(page1.clone(), Some("1"))),
                Err("rate limited at page 2".to_string()),
            ],
        );

        let result = sync_account(&conn, &failing, "acct", fixed_now()).unwrap();
        assert_eq!(result.status, SyncStatus::Partial);
        assert_eq!(result.records_inserted, 25);

        let cursor = store::get_cursor(&conn, "acct", "mock-c").unwrap().unwrap();
        assert_eq!(cursor.latest_date, NaiveDate::from_ymd_opt(2025, 3, 5));
        assert_eq!(cursor.total_records, 25);
        assert_eq!(cursor.last_sync_status, Some(SyncStatus::Partial));
        assert!(cursor.last_sync_message.unwrap().contains("page 1"));

        // Next run: the source re-serves page 1 (overlap) plus the missing page.
        let mut page2: Vec<RawExecution> =
            (0..25).map(|i| raw(&format!("p2-{}", i), 6, 101.0)).collect();
        let mut both = page1;
        both.append(&mut page2);
        let recovered = MockAdapter::new("mock-c", vec![Ok(page(both, None))]);

        let resumed = sync_account(&conn, &recovered, "acct", fixed_now()).unwrap();
        assert_eq!(resumed.status, SyncStatus::Success);
        assert_eq!(resumed.records_received, 50);
        assert_eq!(resumed.records_inserted, 25); // page 1 rows deduplicated

        let cursor = store::get_cursor(&conn, "acct", "mock-c").unwrap().unwrap();
        assert_eq!(cursor.latest_date, NaiveDate::from_ymd_opt(2025, 3, 6));
        assert_eq!(cursor.total_records, 50);
        assert_eq!(store::count_executions(&conn, "acct", "mock-c").unwrap(), 50);
    }

    #[test]
    fn test_first_page_failure_leaves_cursor_unchanged() {
        let conn = db::init_in_memory().unwrap();
        let good = MockAdapter::new("mock-d", vec![Ok(page(vec![raw("o1", 4, 100.0)], None))]);
        sync_account(&conn, &good, "acct", fixed_now()).unwrap();

        let bad = MockAdapter::new("mock-d", vec![Err("connection refused".to_string())]);
        let result = sync_account(&conn, &bad, "acct", fixed_now()).unwrap();
        assert_eq!(result.status, SyncStatus::Failed);

        let cursor = store::get_cursor(&conn, "acct", "mock-d").unwrap().unwrap();
        assert_eq!(cursor.latest_date, NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(cursor.total_records, 1);
        assert_eq!(cursor.last_sync_status, Some(SyncStatus::Failed));
    }

    #[test]
    fn test_concurrent_sync_for_same_pair_is_rejected() {
        let conn = db::init_in_memory().unwrap();
        let _lease = SyncLease::acquire("acct", "mock-e").unwrap();

        let adapter = MockAdapter::new("mock-e", vec![Ok(page(vec![], None))]);
        let result = sync_account(&conn, &adapter, "acct", fixed_now()).unwrap();
        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.message.as_deref(), Some("sync already in progress"));
        assert!(store::get_cursor(&conn, "acct", "mock-e").unwrap().is_none());
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("005930"), "005930.KS");
        assert_eq!(normalize_symbol(" aapl "), "AAPL");
        assert_eq!(normalize_symbol("BTC/USDT"), "BTC/USDT");
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let exec = normalize("acct", "mock", raw("o1", 1, 250.0));
        assert_eq!(exec.amount, 250.0);
        assert_eq!(exec.fee_currency.as_deref(), Some("USD"));
        assert_eq!(exec.normalized_symbol.as_deref(), Some("005930.KS"));
    }

    #[test]
    fn test_rebuild_equity_history_walks_backwards() {
        let conn = db::init_in_memory().unwrap();
        let now = fixed_now();

        // One buy of 1000 on day 10 (fee 1), one sell of 600 on day 12 (fee 1).
        let mut buy = raw("b1", 10, 1000.0);
        buy.fee = Some(1.0);
        let mut sell = raw("s1", 12, 600.0);
        sell.side = Side::Sell;
        sell.fee = Some(1.0);
        let adapter = MockAdapter::new("mock-f", vec![Ok(page(vec![buy, sell], None))]);
        sync_account(&conn, &adapter, "acct", now).unwrap();

        let saved =
            rebuild_equity_history(&conn, "acct", "mock-f", 5000.0, "USD", Some("real"), now)
                .unwrap();
        // day 10, day 12 and today
        assert_eq!(saved, 3);

        let rollups = equity::daily_rollups(
            &conn,
            "acct",
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            now.date_naive(),
        )
        .unwrap();
        assert_eq!(rollups.len(), 3);

        // today holds the current equity; the sell day is 599 lower
        // (5000 - (600 - 1)); the buy day adds the 1001 spent back.
        let today = rollups.iter().find(|r| r.date == now.date_naive()).unwrap();
        assert!((today.close_equity - 5000.0).abs() < 1e-9);
        let sell_day = rollups
            .iter()
            .find(|r| r.date == NaiveDate::from_ymd_opt(2025, 3, 12).unwrap())
            .unwrap();
        assert!((sell_day.close_equity - 4401.0).abs() < 1e-9);
        let buy_day = rollups
            .iter()
            .find(|r| r.date == NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
            .unwrap();
        assert!((buy_day.close_equity - 5402.0).abs() < 1e-9);
    }
}
