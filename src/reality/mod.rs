//! Recommendation snapshots and their verification against later prices.
//!
//! A snapshot freezes a symbol's state on the day it was recommended. Some
//! days later, `verify` compares the frozen entry price against a fresh
//! price observation and records the outcome. Verification is idempotent:
//! re-running for the same (check date, symbol, source) overwrites only the
//! exit-side fields and keeps the original entry record intact.

pub mod stats;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    PriceObservation, RealityCheckResult, RecommendationInput, RecommendationSnapshot,
};

/// Source of price observations used to verify recommendations.
pub trait PriceFeed {
    fn latest_price(&self, symbol: &str, date: NaiveDate) -> Result<Option<PriceObservation>>;
}

/// Record recommendation snapshots for a day. A snapshot that already exists
/// for (date, symbol, source) is left untouched; returns the number of new
/// rows.
pub fn save_recommendations(
    conn: &Connection,
    snapshot_date: NaiveDate,
    inputs: &[RecommendationInput],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut inserted = 0;
    for input in inputs {
        let changed = conn.execute(
            r#"INSERT OR IGNORE INTO recommendation_snapshots
               (snapshot_date, symbol, source, close_price, volume, rank, score,
                expected_return, expected_holding_days, market, sector, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                snapshot_date,
                input.symbol,
                input.source,
                input.close_price,
                input.volume,
                input.rank,
                input.score,
                input.expected_return,
                input.expected_holding_days,
                input.market,
                input.sector,
                now,
            ],
        )?;
        inserted += changed;
    }
    Ok(inserted)
}

fn map_snapshot(row: &Row) -> rusqlite::Result<RecommendationSnapshot> {
    Ok(RecommendationSnapshot {
        snapshot_date: row.get("snapshot_date")?,
        symbol: row.get("symbol")?,
        source: row.get("source")?,
        close_price: row.get("close_price")?,
        volume: row.get("volume")?,
        rank: row.get("rank")?,
        score: row.get("score")?,
        expected_return: row.get("expected_return")?,
        expected_holding_days: row.get("expected_holding_days")?,
        market: row.get("market")?,
        sector: row.get("sector")?,
        created_at: row.get("created_at")?,
    })
}

/// All recommendation snapshots recorded on a given day.
pub fn get_recommendations(
    conn: &Connection,
    snapshot_date: NaiveDate,
) -> Result<Vec<RecommendationSnapshot>> {
    let mut stmt = conn.prepare(
        r#"SELECT snapshot_date, symbol, source, close_price, volume, rank, score,
                  expected_return, expected_holding_days, market, sector, created_at
           FROM recommendation_snapshots
           WHERE snapshot_date = ?1
           ORDER BY source, rank, symbol"#,
    )?;
    let snapshots = stmt
        .query_map(params![snapshot_date], map_snapshot)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(snapshots)
}

/// Verify the recommendations of `recommend_date` against prices observed on
/// `check_date`.
///
/// Symbols without a price on the check date are skipped and can be retried
/// by a later run. Returns the results that were written this call.
pub fn verify(
    conn: &Connection,
    feed: &dyn PriceFeed,
    recommend_date: NaiveDate,
    check_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<RealityCheckResult>> {
    if check_date <= recommend_date {
        bail!(
            "check date {} must be after recommend date {}",
            check_date,
            recommend_date
        );
    }

    let snapshots = get_recommendations(conn, recommend_date)?;
    log::info!(
        "verifying {} recommendations from {} against {}",
        snapshots.len(),
        recommend_date,
        check_date
    );

    let mut results = Vec::new();
    for snapshot in snapshots {
        if snapshot.close_price <= 0.0 {
            log::warn!(
                "skipping {} ({}): non-positive entry price {}",
                snapshot.symbol,
                snapshot.source,
                snapshot.close_price
            );
            continue;
        }

        let observation = match feed.latest_price(&snapshot.symbol, check_date)? {
            Some(obs) => obs,
            None => {
                log::debug!("no price for {} on {}, skipping", snapshot.symbol, check_date);
                continue;
            }
        };

        let result = build_result(&snapshot, &observation, check_date, now);
        upsert_result(conn, &result)?;
        results.push(result);
    }

    Ok(results)
}

fn build_result(
    snapshot: &RecommendationSnapshot,
    observation: &PriceObservation,
    check_date: NaiveDate,
    now: DateTime<Utc>,
) -> RealityCheckResult {
    let entry = snapshot.close_price;
    let exit = observation.close;
    let actual_return = (exit - entry) / entry * 100.0;

    let volume_change = match (snapshot.volume, observation.volume) {
        (Some(entry_vol), Some(exit_vol)) if entry_vol > 0 => {
            Some((exit_vol - entry_vol) as f64 / entry_vol as f64 * 100.0)
        }
        _ => None,
    };

    // path stats only when the feed reports the day's range
    let (max_profit, max_drawdown, volatility) = match (observation.high, observation.low) {
        (Some(high), Some(low)) => (
            Some((high - entry) / entry * 100.0),
            Some((low - entry) / entry * 100.0),
            Some((high - low) / entry),
        ),
        _ => (None, None, None),
    };

    RealityCheckResult {
        check_date,
        recommend_date: snapshot.snapshot_date,
        symbol: snapshot.symbol.clone(),
        source: snapshot.source.clone(),
        rank: snapshot.rank,
        score: snapshot.score,
        entry_price: entry,
        entry_volume: snapshot.volume,
        exit_price: exit,
        exit_volume: observation.volume,
        actual_return,
        is_profitable: exit >= entry,
        volume_change,
        expected_return: snapshot.expected_return,
        return_error: snapshot.expected_return.map(|e| actual_return - e),
        max_profit,
        max_drawdown,
        volatility,
        market: snapshot.market.clone(),
        sector: snapshot.sector.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Read-then-decide upsert on (check_date, symbol, source). An existing row
/// keeps its entry-side fields and created_at; only the exit side and
/// updated_at are overwritten.
fn upsert_result(conn: &Connection, result: &RealityCheckResult) -> Result<()> {
    let existing: Option<DateTime<Utc>> = conn
        .query_row(
            "SELECT created_at FROM reality_checks
             WHERE check_date = ?1 AND symbol = ?2 AND source = ?3",
            params![result.check_date, result.symbol, result.source],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(_) => {
            conn.execute(
                r#"UPDATE reality_checks SET
                       exit_price = ?4,
                       exit_volume = ?5,
                       actual_return = ?6,
                       is_profitable = ?7,
                       volume_change = ?8,
                       return_error = ?9,
                       max_profit = ?10,
                       max_drawdown = ?11,
                       volatility = ?12,
                       updated_at = ?13
                   WHERE check_date = ?1 AND symbol = ?2 AND source = ?3"#,
                params![
                    result.check_date,
                    result.symbol,
                    result.source,
                    result.exit_price,
                    result.exit_volume,
                    result.actual_return,
                    result.is_profitable,
                    result.volume_change,
                    result.return_error,
                    result.max_profit,
                    result.max_drawdown,
                    result.volatility,
                    result.updated_at,
                ],
            )?;
        }
        None => {
            conn.execute(
                r#"INSERT INTO reality_checks
                   (check_date, symbol, source, recommend_date, rank, score,
                    entry_price, entry_volume, exit_price, exit_volume,
                    actual_return, is_profitable, volume_change, expected_return,
                    return_error, max_profit, max_drawdown, volatility,
                    market, sector, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                           ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"#,
                params![
                    result.check_date,
                    result.symbol,
                    result.source,
                    result.recommend_date,
                    result.rank,
                    result.score,
                    result.entry_price,
                    result.entry_volume,
                    result.exit_price,
                    result.exit_volume,
                    result.actual_return,
                    result.is_profitable,
                    result.volume_change,
                    result.expected_return,
                    result.return_error,
                    result.max_profit,
                    result.max_drawdown,
                    result.volatility,
                    result.market,
                    result.sector,
                    result.created_at,
                    result.updated_at,
                ],
            )?;
        }
    }

    Ok(())
}

fn map_result(row: &Row) -> rusqlite::Result<RealityCheckResult> {
    Ok(RealityCheckResult {
        check_date: row.get("check_date")?,
        recommend_date: row.get("recommend_date")?,
        symbol: row.get("symbol")?,
        source: row.get("source")?,
        rank: row.get("rank")?,
        score: row.get("score")?,
        entry_price: row.get("entry_price")?,
        entry_volume: row.get("entry_volume")?,
        exit_price: row.get("exit_price")?,
        exit_volume: row.get("exit_volume")?,
        actual_return: row.get("actual_return")?,
        is_profitable: row.get("is_profitable")?,
        volume_change: row.get("volume_change")?,
        expected_return: row.get("expected_return")?,
        return_error: row.get("return_error")?,
        max_profit: row.get("max_profit")?,
        max_drawdown: row.get("max_drawdown")?,
        volatility: row.get("volatility")?,
        market: row.get("market")?,
        sector: row.get("sector")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// All verified results for a check date.
pub fn get_results(conn: &Connection, check_date: NaiveDate) -> Result<Vec<RealityCheckResult>> {
    let mut stmt = conn.prepare(
        r#"SELECT check_date, symbol, source, recommend_date, rank, score,
                  entry_price, entry_volume, exit_price, exit_volume,
                  actual_return, is_profitable, volume_change, expected_return,
                  return_error, max_profit, max_drawdown, volatility,
                  market, sector, created_at, updated_at
           FROM reality_checks
           WHERE check_date = ?1
           ORDER BY source, symbol"#,
    )?;
    let results = stmt
        .query_map(params![check_date], map_result)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}
