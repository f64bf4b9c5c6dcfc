use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

/// Open (or create) the pipeline database at the given path and ensure the
/// schema exists.
pub fn init_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Enable WAL mode for better concurrent access
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with full schema, for tests and scratch runs.
pub fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- =============================================================================
        -- Record store: normalized trade executions from external sources
        -- =============================================================================

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            source TEXT NOT NULL,
            executed_at TEXT NOT NULL,
            symbol TEXT NOT NULL,
            normalized_symbol TEXT,
            side TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL NOT NULL,
            amount REAL NOT NULL,
            fee REAL,
            fee_currency TEXT,
            order_id TEXT NOT NULL,
            trade_id TEXT NOT NULL DEFAULT '',
            order_type TEXT,
            raw_data TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (account_id, source, order_id, trade_id)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_account_date
            ON executions (account_id, executed_at DESC);
        CREATE INDEX IF NOT EXISTS idx_executions_symbol_date
            ON executions (symbol, executed_at DESC);

        -- Per-(account, source) bookmark of incremental sync progress
        CREATE TABLE IF NOT EXISTS sync_cursors (
            account_id TEXT NOT NULL,
            source TEXT NOT NULL,
            earliest_date TEXT,
            latest_date TEXT,
            total_records INTEGER NOT NULL DEFAULT 0,
            last_sync_at TEXT,
            last_sync_status TEXT,
            last_sync_message TEXT,
            PRIMARY KEY (account_id, source)
        );

        -- =============================================================================
        -- Point-in-time account valuations (written by an external poller)
        -- =============================================================================

        CREATE TABLE IF NOT EXISTS valuation_snapshots (
            account_id TEXT NOT NULL,
            snapshot_time TEXT NOT NULL,
            total_equity REAL NOT NULL,
            cash_balance REAL NOT NULL,
            invested_value REAL NOT NULL,
            total_pnl REAL NOT NULL DEFAULT 0,
            daily_pnl REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'USD',
            account_mode TEXT,
            PRIMARY KEY (account_id, snapshot_time)
        );

        CREATE INDEX IF NOT EXISTS idx_valuation_account_time
            ON valuation_snapshots (account_id, snapshot_time DESC);

        -- =============================================================================
        -- Recommendation snapshots and their verified outcomes
        -- =============================================================================

        CREATE TABLE IF NOT EXISTS recommendation_snapshots (
            snapshot_date TEXT NOT NULL,
            symbol TEXT NOT NULL,
            source TEXT NOT NULL,
            close_price REAL NOT NULL,
            volume INTEGER,
            rank INTEGER,
            score REAL,
            expected_return REAL,
            expected_holding_days INTEGER,
            market TEXT,
            sector TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (snapshot_date, symbol, source)
        );

        CREATE INDEX IF NOT EXISTS idx_recommendation_symbol_date
            ON recommendation_snapshots (symbol, snapshot_date DESC);

        CREATE TABLE IF NOT EXISTS reality_checks (
            check_date TEXT NOT NULL,
            symbol TEXT NOT NULL,
            source TEXT NOT NULL,
            recommend_date TEXT NOT NULL,
            rank INTEGER,
            score REAL,
            entry_price REAL NOT NULL,
            entry_volume INTEGER,
            exit_price REAL NOT NULL,
            exit_volume INTEGER,
            actual_return REAL NOT NULL,
            is_profitable INTEGER NOT NULL,
            volume_change REAL,
            expected_return REAL,
            return_error REAL,
            max_profit REAL,
            max_drawdown REAL,
            volatility REAL,
            market TEXT,
            sector TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (check_date, symbol, source)
        );

        CREATE INDEX IF NOT EXISTS idx_reality_symbol_date
            ON reality_checks (symbol, check_date DESC);
        CREATE INDEX IF NOT EXISTS idx_reality_source_date
            ON reality_checks (source, check_date DESC);
        "#,
    )?;

    Ok(())
}
