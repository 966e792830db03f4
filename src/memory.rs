// =============================================================================
// Memory Store (C4) — append-only per-agent structured memories
// =============================================================================
//
// No direct teacher analogue (the teacher has no long-term memory concept).
// Grounded in spirit on `decision_envelope.rs`'s append-only,
// UUID-identified, constructor-helper-driven audit record pattern,
// generalized from a single decision type to the spec's `MemoryRecord`
// taxonomy. Writes are best-effort and never block the trading path — a
// persistence failure is logged via `tracing::warn!` and swallowed, matching
// the teacher's principle (seen in `reconcile.rs`) that background
// bookkeeping must not destabilize a bot's tick.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::bot::{ExitReason, Trade};
use crate::candles::CandleWindow;
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Positive,
    Neutral,
    Negative,
}

/// An append-only structured memory belonging to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub agent: String,
    pub record_type: String,
    pub content: serde_json::Value,
    pub metadata: serde_json::Value,
    pub timestamp: i64,
}

impl MemoryRecord {
    fn new(agent: &str, record_type: &str, content: serde_json::Value, metadata: serde_json::Value, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            record_type: record_type.to_string(),
            content,
            metadata,
            timestamp: now,
        }
    }
}

/// Aggregate view over `(symbol, strategy)` trade_learning records.
/// Recomputed on demand; no stale-cache contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternInsight {
    pub total_trades: u64,
    pub success_rate: f64,
    pub avg_pnl: f64,
    pub recommendation: Recommendation,
    pub lessons: Vec<String>,
}

pub struct MemoryStore {
    store: Arc<StateStore>,
}

impl MemoryStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Append a structured memory. Best-effort: failures are logged, never
    /// propagated.
    pub fn store(&self, agent: &str, record_type: &str, content: serde_json::Value, metadata: serde_json::Value, now: i64) {
        let record = MemoryRecord::new(agent, record_type, content, metadata, now);
        if let Err(e) = self.store.persist_memory_record(&record) {
            warn!(agent, error = %e, "failed to persist memory record");
        }
    }

    /// Read back an agent's memories, optionally filtered by type and a
    /// minimum timestamp. Returns empty on backend outage rather than an
    /// error (spec §4.4's read-path failure policy).
    pub fn retrieve(&self, agent: &str, record_type: Option<&str>, since: Option<i64>, limit: usize) -> Vec<MemoryRecord> {
        self.store
            .load_memory_records(agent, record_type, since, limit)
            .unwrap_or_default()
    }

    /// Synthesize a `trade_learning` record from a closed trade, extracting
    /// lessons from execution quality, slippage, and (when available) the
    /// candle bundle around the trade.
    pub fn learn_from_trade(
        &self,
        trade: &Trade,
        outcome: Outcome,
        pnl: f64,
        candle_bundle: Option<(&CandleWindow, &CandleWindow, Option<&CandleWindow>)>,
        now: i64,
    ) {
        let mut lessons = Vec::new();

        if trade.execution_delay_seconds < 2.0 {
            lessons.push("fast execution: low latency between decision and fill".to_string());
        } else if trade.execution_delay_seconds > 10.0 {
            lessons.push("slow execution: decision-to-fill delay exceeded 10s".to_string());
        }

        if trade.price_slippage_percent > 0.1 {
            lessons.push("favorable slippage on execution".to_string());
        } else if trade.price_slippage_percent < -0.2 {
            lessons.push("adverse slippage on execution".to_string());
        }

        if let Some((pre_trade, during_trade, post_trade)) = candle_bundle {
            if let (Some(&first), Some(&last)) = (pre_trade.closes().first(), pre_trade.closes().last()) {
                let pre_trend_up = last > first;
                let buy_won = matches!(outcome, Outcome::Success);
                if pre_trend_up == buy_won {
                    lessons.push("pre-trade trend direction matched the outcome".to_string());
                } else {
                    lessons.push("pre-trade trend direction contradicted the outcome".to_string());
                }
            }

            let closes = during_trade.closes();
            if !closes.is_empty() {
                let entry = closes[0];
                let mfe = closes
                    .iter()
                    .map(|&c| (c - entry) / entry.max(1e-9))
                    .fold(f64::MIN, f64::max);
                if mfe > pnl + 0.01 {
                    lessons.push("missed-take-profit: max favorable excursion exceeded realized P&L".to_string());
                }
            }

            if let Some(post) = post_trade {
                if post.sealed {
                    lessons.push("post-trade window fully sealed for continuation analysis".to_string());
                }
            }
        }

        let content = serde_json::json!({
            "trade_id": trade.trade_id,
            "symbol": trade.symbol,
            "strategy": trade.strategy,
            "confidence": trade.confidence,
            "outcome": outcome,
            "pnl": pnl,
            "exit_reason": trade.exit_reason,
            "lessons": lessons,
        });

        self.store("system", "trade_learning", content, serde_json::json!({}), now);
    }

    /// Compute `pattern_insights` for a `(symbol, strategy)` pair over the
    /// last `since_days` days of `trade_learning` records.
    pub fn pattern_insights(&self, symbol: &str, strategy: &str, since_days: i64, now: i64) -> PatternInsight {
        let since = now - since_days * 86_400_000;
        let records = self.retrieve("system", Some("trade_learning"), Some(since), usize::MAX);

        let matching: Vec<&MemoryRecord> = records
            .iter()
            .filter(|r| {
                r.content.get("symbol").and_then(|v| v.as_str()) == Some(symbol)
                    && r.content.get("strategy").and_then(|v| v.as_str()) == Some(strategy)
            })
            .collect();

        let total_trades = matching.len() as u64;
        if total_trades == 0 {
            return PatternInsight {
                total_trades: 0,
                success_rate: 0.0,
                avg_pnl: 0.0,
                recommendation: Recommendation::Neutral,
                lessons: Vec::new(),
            };
        }

        let successes = matching
            .iter()
            .filter(|r| r.content.get("outcome").and_then(|v| v.as_str()) == Some("success"))
            .count();
        let success_rate = successes as f64 / total_trades as f64 * 100.0;

        let avg_pnl = matching
            .iter()
            .filter_map(|r| r.content.get("pnl").and_then(|v| v.as_f64()))
            .sum::<f64>()
            / total_trades as f64;

        let recommendation = if success_rate > 60.0 && avg_pnl > 0.0 {
            Recommendation::Positive
        } else if success_rate < 40.0 || (success_rate < 50.0 && avg_pnl < 0.0) {
            Recommendation::Negative
        } else {
            Recommendation::Neutral
        };

        let mut lessons: Vec<String> = matching
            .iter()
            .filter_map(|r| r.content.get("lessons").and_then(|v| v.as_array()))
            .flat_map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)))
            .collect();
        lessons.sort();
        lessons.dedup();

        PatternInsight {
            total_trades,
            success_rate,
            avg_pnl,
            recommendation,
            lessons,
        }
    }

    /// Drop records older than the retention window (spec §3: "periodic
    /// compaction removes records older than the window"). Best-effort: a
    /// storage failure is logged and swallowed, matching every other write
    /// path in this module.
    pub fn compact(&self, retention_days: i64, now: i64) -> usize {
        let cutoff = now - retention_days * 86_400_000;
        match self.store.compact_memory_records(cutoff) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "memory compaction failed");
                0
            }
        }
    }
}

pub fn outcome_for(exit_reason: Option<ExitReason>, pnl: f64) -> Outcome {
    match exit_reason {
        Some(ExitReason::StopLoss) => Outcome::Failure,
        _ if pnl > 0.0 => Outcome::Success,
        _ if pnl < 0.0 => Outcome::Failure,
        _ => Outcome::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> Trade {
        Trade {
            trade_id: "t1".into(),
            bot_id: "b1".into(),
            symbol: "ETHUSDT".into(),
            side: crate::bot::TradeSide::Sell,
            quantity: 1.0,
            decision_price: 2000.0,
            execution_price: 2001.0,
            decision_timestamp: 0,
            execution_timestamp: 1,
            execution_delay_seconds: 1.0,
            price_slippage_percent: 0.05,
            realized_pnl: Some(0.008),
            exit_reason: Some("TAKE_PROFIT".to_string()),
            strategy: "rsi".into(),
            confidence: 0.7,
            indicators: serde_json::json!({}),
        }
    }

    #[test]
    fn learn_from_trade_persists_a_record() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let memory = MemoryStore::new(store.clone());
        memory.learn_from_trade(&trade(), Outcome::Success, 0.008, None, 1000);
        let records = memory.retrieve("system", Some("trade_learning"), None, 10);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn pattern_insights_empty_is_neutral() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let memory = MemoryStore::new(store);
        let insight = memory.pattern_insights("BTCUSDT", "rsi", 90, 100_000);
        assert_eq!(insight.total_trades, 0);
        assert_eq!(insight.recommendation, Recommendation::Neutral);
    }

    #[test]
    fn pattern_insights_positive_recommendation() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let memory = MemoryStore::new(store);
        for i in 0..10 {
            let mut t = trade();
            t.trade_id = format!("t{i}");
            let outcome = if i < 7 { Outcome::Success } else { Outcome::Failure };
            let pnl = if i < 7 { 0.02 } else { -0.01 };
            memory.learn_from_trade(&t, outcome, pnl, None, 1000 + i);
        }
        let insight = memory.pattern_insights("ETHUSDT", "rsi", 90, 100_000);
        assert_eq!(insight.total_trades, 10);
        assert_eq!(insight.recommendation, Recommendation::Positive);
    }

    #[test]
    fn outcome_for_stop_loss_is_failure_even_if_pnl_positive() {
        assert_eq!(outcome_for(Some(ExitReason::StopLoss), 0.01), Outcome::Failure);
    }
}
