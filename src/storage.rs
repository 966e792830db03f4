// =============================================================================
// Persistence Layer — SQLite-backed state store
// =============================================================================
//
// The teacher persists only a coarse runtime-config JSON snapshot via an
// atomic write-tmp-then-rename (see `config::save_bootstrap_snapshot`,
// carried over from `runtime_config.rs::save`). Spec §6 additionally needs a
// durable store for the logical collections `bots`, `trades`, `bot_candles`,
// `memory_<agent>`, and `collective_memory` — this module provides that,
// grounded on `uprootiny-arbitragefx/src/storage.rs`'s `StateStore` pattern
// (`rusqlite::Connection`, `execute_batch` for schema, `transaction()` +
// per-row insert + `commit()` for batched writes).

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::warn;

use crate::bot::Bot;
use crate::bot::Trade;
use crate::candles::CandleWindow;
use crate::error::{ErrorKind, FleetError};
use crate::memory::MemoryRecord;

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if absent) the SQLite database at `path` and ensure the
    /// schema exists.
    pub fn open(path: &str) -> Result<Self, FleetError> {
        let conn = Connection::open(path)
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store, useful for tests and for `STORAGE_URL=:memory:`.
    pub fn open_in_memory() -> Result<Self, FleetError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), FleetError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS bots (
                bot_id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                execution_timestamp INTEGER NOT NULL,
                json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bot_candles (
                bot_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                trade_id TEXT,
                json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                record_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                json TEXT NOT NULL
            );
            COMMIT;",
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    pub fn persist_bot(&self, bot: &Bot) -> Result<(), FleetError> {
        let json = serde_json::to_string(bot)
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bots (bot_id, json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(bot_id) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![bot.bot_id, json, now_ms()],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    pub fn persist_trade(&self, trade: &Trade) -> Result<(), FleetError> {
        let json = serde_json::to_string(trade)
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO trades (trade_id, bot_id, symbol, execution_timestamp, json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![trade.trade_id, trade.bot_id, trade.symbol, trade.execution_timestamp, json],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    pub fn persist_candle_window(&self, window: &CandleWindow) -> Result<(), FleetError> {
        let json = serde_json::to_string(window)
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let trade_id = window.sell_trade_id.clone().or_else(|| window.buy_trade_id.clone());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_candles (bot_id, phase, trade_id, json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![window.bot_id, window.phase.as_str(), trade_id, json, now_ms()],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    pub fn persist_memory_record(&self, record: &MemoryRecord) -> Result<(), FleetError> {
        let json = serde_json::to_string(record)
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_records (id, agent, record_type, timestamp, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id, record.agent, record.record_type, record.timestamp, json],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
        Ok(())
    }

    /// Read memory records for one agent, newest first, optionally filtered
    /// by type and minimum timestamp, bounded by `limit`.
    pub fn load_memory_records(
        &self,
        agent: &str,
        record_type: Option<&str>,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, FleetError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT json FROM memory_records WHERE agent = ?1
                 AND (?2 IS NULL OR record_type = ?2)
                 AND (?3 IS NULL OR timestamp >= ?3)
                 ORDER BY timestamp DESC LIMIT ?4",
            )
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;

        let rows = stmt
            .query_map(params![agent, record_type, since, limit as i64], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))?;
            match serde_json::from_str(&json) {
                Ok(rec) => out.push(rec),
                Err(e) => warn!(error = %e, "skipping corrupt memory record row"),
            }
        }
        Ok(out)
    }

    /// Read trades newest-first, optionally filtered by `exit_reason`,
    /// bounded by `limit`. Empty on backend outage rather than erroring,
    /// per spec §4.4's "reads return empty on backend outage" policy applied
    /// uniformly to read paths that feed dashboards.
    pub fn load_trades(&self, limit: usize, exit_reason: Option<&str>) -> Vec<Trade> {
        let conn = self.conn.lock();
        let query = "SELECT json FROM trades ORDER BY execution_timestamp DESC LIMIT ?1";
        let mut stmt = match conn.prepare(query) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "trade read failed, returning empty");
                return Vec::new();
            }
        };
        let rows = match stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0)) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "trade read failed, returning empty");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for row in rows.flatten() {
            if let Ok(trade) = serde_json::from_str::<Trade>(&row) {
                match exit_reason {
                    Some(r) if trade.exit_reason.as_deref() != Some(r) => continue,
                    _ => out.push(trade),
                }
            }
        }
        out
    }

    /// Delete sealed candle windows (`bot_candles` rows, all of which are
    /// only ever written once sealed — see `persist_candle_window`) last
    /// touched before `cutoff_ms`. Returns the number of rows removed.
    /// Spec §4.3: "windows older than 30 days and sealed are eligible for
    /// deletion".
    pub fn gc_sealed_candle_windows(&self, cutoff_ms: i64) -> Result<usize, FleetError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM bot_candles WHERE updated_at < ?1",
            params![cutoff_ms],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))
    }

    /// Delete memory records older than `cutoff_ms` (spec §3: "periodic
    /// compaction removes records older than the [retention] window").
    pub fn compact_memory_records(&self, cutoff_ms: i64) -> Result<usize, FleetError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memory_records WHERE timestamp < ?1",
            params![cutoff_ms],
        )
        .map_err(|e| FleetError::new(ErrorKind::Storage, e.to_string()))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
