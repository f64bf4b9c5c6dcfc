//! On-demand aggregates over verified reality checks.
//!
//! Nothing here is persisted. Every function recomputes from the
//! `reality_checks` table, so results always reflect the latest
//! verification run. Win rates count `is_profitable` rows; averages are
//! over `actual_return`.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// Per-day verification outcome counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub check_date: NaiveDate,
    pub total: i64,
    pub profitable: i64,
    pub win_rate: f64,
    pub avg_return: f64,
}

/// Per-source verification quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub source: String,
    pub total: i64,
    pub profitable: i64,
    pub win_rate: f64,
    pub avg_return: f64,
    pub avg_return_error: Option<f64>,
}

/// Outcome quality by recommendation rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankStats {
    pub rank: i32,
    pub total: i64,
    pub profitable: i64,
    pub win_rate: f64,
    pub avg_return: f64,
}

/// Aggregate over an arbitrary filtered subset of reality checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total: i64,
    pub profitable: i64,
    pub win_rate: f64,
    pub avg_return: f64,
    pub best_return: Option<f64>,
    pub worst_return: Option<f64>,
}

fn win_rate(profitable: i64, total: i64) -> f64 {
    if total > 0 {
        profitable as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// Daily outcome counts, most recent day first, up to `limit` days.
pub fn daily_stats(conn: &Connection, limit: usize) -> Result<Vec<DailyStats>> {
    let mut stmt = conn.prepare(
        r#"SELECT check_date,
                  COUNT(*) AS total,
                  SUM(is_profitable) AS profitable,
                  AVG(actual_return) AS avg_return
           FROM reality_checks
           GROUP BY check_date
           ORDER BY check_date DESC
           LIMIT ?1"#,
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            let total: i64 = row.get("total")?;
            let profitable: i64 = row.get("profitable")?;
            Ok(DailyStats {
                check_date: row.get("check_date")?,
                total,
                profitable,
                win_rate: win_rate(profitable, total),
                avg_return: row.get("avg_return")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Outcome quality per recommendation source, best win rate first.
pub fn source_stats(conn: &Connection) -> Result<Vec<SourceStats>> {
    let mut stmt = conn.prepare(
        r#"SELECT source,
                  COUNT(*) AS total,
                  SUM(is_profitable) AS profitable,
                  AVG(actual_return) AS avg_return,
                  AVG(return_error) AS avg_return_error
           FROM reality_checks
           GROUP BY source
           ORDER BY CAST(SUM(is_profitable) AS REAL) / COUNT(*) DESC"#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            let total: i64 = row.get("total")?;
            let profitable: i64 = row.get("profitable")?;
            Ok(SourceStats {
                source: row.get("source")?,
                total,
                profitable,
                win_rate: win_rate(profitable, total),
                avg_return: row.get("avg_return")?,
                avg_return_error: row.get("avg_return_error")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Outcome quality by rank, ascending. Unranked rows are excluded.
pub fn rank_stats(conn: &Connection) -> Result<Vec<RankStats>> {
    let mut stmt = conn.prepare(
        r#"SELECT rank,
                  COUNT(*) AS total,
                  SUM(is_profitable) AS profitable,
                  AVG(actual_return) AS avg_return
           FROM reality_checks
           WHERE rank IS NOT NULL
           GROUP BY rank
           ORDER BY rank ASC"#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            let total: i64 = row.get("total")?;
            let profitable: i64 = row.get("profitable")?;
            Ok(RankStats {
                rank: row.get("rank")?,
                total,
                profitable,
                win_rate: win_rate(profitable, total),
                avg_return: row.get("avg_return")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn map_summary(row: &Row) -> rusqlite::Result<StatsSummary> {
    let total: i64 = row.get("total")?;
    let profitable: i64 = row.get::<_, Option<i64>>("profitable")?.unwrap_or(0);
    Ok(StatsSummary {
        total,
        profitable,
        win_rate: win_rate(profitable, total),
        avg_return: row.get::<_, Option<f64>>("avg_return")?.unwrap_or(0.0),
        best_return: row.get("best_return")?,
        worst_return: row.get("worst_return")?,
    })
}

/// Summary over the subset matching the given filters. All filters are
/// optional and combine with AND.
pub fn stats_filtered(
    conn: &Connection,
    source: Option<&str>,
    rank: Option<i32>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<StatsSummary> {
    let summary = conn.query_row(
        r#"SELECT COUNT(*) AS total,
                  SUM(is_profitable) AS profitable,
                  AVG(actual_return) AS avg_return,
                  MAX(actual_return) AS best_return,
                  MIN(actual_return) AS worst_return
           FROM reality_checks
           WHERE (?1 IS NULL OR source = ?1)
             AND (?2 IS NULL OR rank = ?2)
             AND (?3 IS NULL OR check_date >= ?3)
             AND (?4 IS NULL OR check_date <= ?4)"#,
        params![source, rank, from, to],
        map_summary,
    )?;
    Ok(summary)
}

/// Summary for one source over the trailing `days` days ending at `today`.
pub fn recent_performance(
    conn: &Connection,
    source: &str,
    days: i64,
    today: NaiveDate,
) -> Result<StatsSummary> {
    let from = today - Duration::days(days);
    stats_filtered(conn, Some(source), None, Some(from), Some(today))
}

/// Explicitly refreshed projection of the per-source and per-rank views.
///
/// Callers hold it in memory and compare `refreshed_at` against their own
/// staleness threshold instead of relying on a stored aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsBoard {
    pub refreshed_at: DateTime<Utc>,
    pub sources: Vec<SourceStats>,
    pub ranks: Vec<RankStats>,
}

impl StatsBoard {
    pub fn refresh(conn: &Connection, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            refreshed_at: now,
            sources: source_stats(conn)?,
            ranks: rank_stats(conn)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{PriceObservation, RecommendationInput};
    use crate::reality::{save_recommendations, verify, PriceFeed};
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct MapFeed {
        prices: HashMap<String, PriceObservation>,
    }

    impl PriceFeed for MapFeed {
        fn latest_price(&self, symbol: &str, _date: NaiveDate) -> Result<Option<PriceObservation>> {
            Ok(self.prices.get(symbol).copied())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, d).unwrap()
    }

    fn seed(conn: &Connection) {
        let now = Utc.with_ymd_and_hms(2025, 5, 8, 16, 0, 0).unwrap();
        let inputs = vec![
            RecommendationInput {
                symbol: "UP".to_string(),
                source: "screener".to_string(),
                close_price: 100.0,
                volume: None,
                rank: Some(1),
                score: None,
                expected_return: None,
                expected_holding_days: None,
                market: None,
                sector: None,
            },
            RecommendationInput {
                symbol: "DOWN".to_string(),
                source: "screener".to_string(),
                close_price: 100.0,
                volume: None,
                rank: Some(2),
                score: None,
                expected_return: None,
                expected_holding_days: None,
                market: None,
                sector: None,
            },
            RecommendationInput {
                symbol: "UP".to_string(),
                source: "momentum".to_string(),
                close_price: 100.0,
                volume: None,
                rank: Some(1),
                score: None,
                expected_return: None,
                expected_holding_days: None,
                market: None,
                sector: None,
            },
        ];
        save_recommendations(conn, day(1), &inputs, now).unwrap();

        let feed = MapFeed {
            prices: HashMap::from([
                (
                    "UP".to_string(),
                    PriceObservation { close: 120.0, volume: None, high: None, low: None },
                ),
                (
                    "DOWN".to_string(),
                    PriceObservation { close: 80.0, volume: None, high: None, low: None },
                ),
            ]),
        };
        verify(conn, &feed, day(1), day(8), now).unwrap();
    }

    #[test]
    fn test_daily_stats_counts_and_win_rate() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let stats = daily_stats(&conn, 30).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 3);
        assert_eq!(stats[0].profitable, 2);
        assert!((stats[0].win_rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_source_stats_orders_by_win_rate() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let stats = source_stats(&conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].source, "momentum");
        assert_eq!(stats[0].win_rate, 100.0);
        assert_eq!(stats[1].source, "screener");
        assert_eq!(stats[1].win_rate, 50.0);
    }

    #[test]
    fn test_rank_stats_groups_by_rank() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let stats = rank_stats(&conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].rank, 1);
        assert_eq!(stats[0].total, 2);
        assert_eq!(stats[0].win_rate, 100.0);
        assert_eq!(stats[1].rank, 2);
        assert_eq!(stats[1].win_rate, 0.0);
    }

    #[test]
    fn test_stats_filtered_combines_filters() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let all = stats_filtered(&conn, None, None, None, None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.best_return, Some(20.0));
        assert_eq!(all.worst_return, Some(-20.0));

        let screener_rank1 = stats_filtered(&conn, Some("screener"), Some(1), None, None).unwrap();
        assert_eq!(screener_rank1.total, 1);
        assert_eq!(screener_rank1.win_rate, 100.0);

        let empty = stats_filtered(&conn, Some("nobody"), None, None, None).unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.win_rate, 0.0);
    }

    #[test]
    fn test_recent_performance_window() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let recent = recent_performance(&conn, "screener", 30, day(20)).unwrap();
        assert_eq!(recent.total, 2);

        let stale = recent_performance(&conn, "screener", 3, day(20)).unwrap();
        assert_eq!(stale.total, 0);
    }

    #[test]
    fn test_stats_board_refresh() {
        let conn = db::init_in_memory().unwrap();
        seed(&conn);

        let now = Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap();
        let board = StatsBoard::refresh(&conn, now).unwrap();
        assert_eq!(board.refreshed_at, now);
        assert_eq!(board.sources.len(), 2);
        assert_eq!(board.ranks.len(), 2);
    }
}
