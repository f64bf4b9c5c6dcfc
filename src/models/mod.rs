//! Domain types shared across the pipeline.
//!
//! Conventions:
//! - monetary values are f64 (stored as REAL)
//! - partition dates are `NaiveDate`, instants are `DateTime<Utc>`
//! - everything externally visible serializes as camelCase

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// Opaque per-venue payload attached to an execution.
///
/// Known fields are typed; everything else the venue sends is preserved in
/// `extra` so nothing is lost on round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidity_flag: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One execution as returned by a source adapter, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExecution {
    pub executed_at: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    /// Total fill amount; computed as quantity * price when the source omits it.
    pub amount: Option<f64>,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub order_id: String,
    pub trade_id: Option<String>,
    pub order_type: Option<String>,
    pub raw_data: Option<RawPayload>,
}

/// A normalized execution ready for insertion into the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExecution {
    pub account_id: String,
    pub source: String,
    pub executed_at: DateTime<Utc>,
    pub symbol: String,
    pub normalized_symbol: Option<String>,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub amount: f64,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub order_id: String,
    /// Missing trade ids are stored as an empty-string sentinel so the
    /// dedup key (account, source, order, trade) stays total.
    pub trade_id: Option<String>,
    pub order_type: Option<String>,
    pub raw_data: Option<RawPayload>,
}

/// A stored execution record. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub account_id: String,
    pub source: String,
    pub executed_at: DateTime<Utc>,
    pub symbol: String,
    pub normalized_symbol: Option<String>,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub amount: f64,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub order_id: String,
    pub trade_id: Option<String>,
    pub order_type: Option<String>,
    pub raw_data: Option<RawPayload>,
    pub created_at: DateTime<Utc>,
}

/// Outcome classification of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Per-(account, source) sync bookmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub account_id: String,
    pub source: String,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub total_records: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub last_sync_message: Option<String>,
}

/// Result of a single `sync_account` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub status: SyncStatus,
    pub pages_fetched: usize,
    pub records_received: usize,
    pub records_inserted: usize,
    pub latest_date: Option<NaiveDate>,
    pub message: Option<String>,
}

/// Point-in-time account valuation, written by an external poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationSnapshot {
    pub account_id: String,
    pub snapshot_time: DateTime<Utc>,
    pub total_equity: f64,
    pub cash_balance: f64,
    pub invested_value: f64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub currency: String,
    pub account_mode: Option<String>,
}

/// Input for recording a recommendation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationInput {
    pub symbol: String,
    pub source: String,
    pub close_price: f64,
    pub volume: Option<i64>,
    pub rank: Option<i32>,
    pub score: Option<f64>,
    pub expected_return: Option<f64>,
    pub expected_holding_days: Option<i32>,
    pub market: Option<String>,
    pub sector: Option<String>,
}

/// Immutable record of a symbol's state at the moment it was recommended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationSnapshot {
    pub snapshot_date: NaiveDate,
    pub symbol: String,
    pub source: String,
    pub close_price: f64,
    pub volume: Option<i64>,
    pub rank: Option<i32>,
    pub score: Option<f64>,
    pub expected_return: Option<f64>,
    pub expected_holding_days: Option<i32>,
    pub market: Option<String>,
    pub sector: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Verified outcome of a recommendation against a later price observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityCheckResult {
    pub check_date: NaiveDate,
    pub recommend_date: NaiveDate,
    pub symbol: String,
    pub source: String,
    pub rank: Option<i32>,
    pub score: Option<f64>,
    pub entry_price: f64,
    pub entry_volume: Option<i64>,
    pub exit_price: f64,
    pub exit_volume: Option<i64>,
    pub actual_return: f64,
    pub is_profitable: bool,
    pub volume_change: Option<f64>,
    pub expected_return: Option<f64>,
    pub return_error: Option<f64>,
    pub max_profit: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub volatility: Option<f64>,
    pub market: Option<String>,
    pub sector: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A price observation from the external price feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceObservation {
    pub close: f64,
    pub volume: Option<i64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// One calendar day of valuation data, closing values from the day's last
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub close_equity: f64,
    pub close_cash: f64,
    pub close_invested: f64,
    pub high_equity: f64,
    pub low_equity: f64,
    pub daily_pnl: f64,
    pub snapshot_count: usize,
}

/// Monthly open/close return.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub opening_equity: f64,
    pub closing_equity: f64,
    pub return_pct: f64,
}

/// One element of the cumulative PnL series.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlPoint {
    pub date: NaiveDate,
    pub daily_pnl: f64,
    pub fees: f64,
    pub cumulative_pnl: f64,
}

/// Equity curve data point with running drawdown and return.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub drawdown_pct: f64,
    pub return_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_round_trip() {
        assert_eq!(Side::from_str("BUY"), Some(Side::Buy));
        assert_eq!(Side::from_str(Side::Sell.as_str()), Some(Side::Sell));
        assert_eq!(Side::from_str("short"), None);
    }

    #[test]
    fn test_sync_status_round_trip() {
        for status in [SyncStatus::Success, SyncStatus::Partial, SyncStatus::Failed] {
            assert_eq!(SyncStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_raw_payload_preserves_unknown_fields() {
        let json = r#"{"venueStatus":"FILLED","exchangeSeq":42,"desk":"alpha"}"#;
        let payload: RawPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.venue_status.as_deref(), Some("FILLED"));
        assert_eq!(payload.extra.get("exchangeSeq").and_then(|v| v.as_i64()), Some(42));

        let back = serde_json::to_string(&payload).unwrap();
        assert!(back.contains("desk"));
    }
}
