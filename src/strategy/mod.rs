// =============================================================================
// Strategy Library (C2) — pure functions over an OHLCV window
// =============================================================================
//
// Generalizes the teacher's `strategy.rs` (one monolithic `evaluate_symbol`
// combining indicators, regime lookup, and position sizing) into the spec's
// model: each named strategy is a pure `analyze(window) -> output` function
// with no I/O and no mutation, registered by name so the bot engine (C5)
// dispatches by string only (spec §9 "polymorphism without inheritance").

mod bollinger_bands;
mod combined;
mod grid;
mod ma_crossover;
mod macd;
mod rsi;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::exchange::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Output of one strategy evaluation. `confidence` is always in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub signal: Signal,
    pub confidence: f64,
    pub reason: String,
    pub indicators: serde_json::Value,
}

impl StrategyOutput {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            signal: Signal::Hold,
            confidence: 0.0,
            reason: reason.into(),
            indicators: serde_json::json!({}),
        }
    }
}

pub type StrategyFn = fn(&[Candle]) -> Result<StrategyOutput, FleetError>;

#[derive(Clone, Copy)]
pub struct StrategyEntry {
    pub name: &'static str,
    pub analyze: StrategyFn,
    pub min_window: usize,
}

/// Build the name-keyed strategy registry. New strategies are added here by
/// registering `{name, analyze, min_window}` — the bot engine never matches
/// on strategy name itself, only looks it up.
pub fn registry() -> HashMap<&'static str, StrategyEntry> {
    let entries = [
        StrategyEntry {
            name: "ma_crossover",
            analyze: ma_crossover::analyze,
            min_window: ma_crossover::MIN_WINDOW,
        },
        StrategyEntry {
            name: "rsi",
            analyze: rsi::analyze,
            min_window: rsi::MIN_WINDOW,
        },
        StrategyEntry {
            name: "macd",
            analyze: macd::analyze,
            min_window: macd::MIN_WINDOW,
        },
        StrategyEntry {
            name: "bollinger_bands",
            analyze: bollinger_bands::analyze,
            min_window: bollinger_bands::MIN_WINDOW,
        },
        StrategyEntry {
            name: "combined",
            analyze: combined::analyze,
            min_window: combined::MIN_WINDOW,
        },
        StrategyEntry {
            name: "grid",
            analyze: grid::analyze,
            min_window: grid::MIN_WINDOW,
        },
    ];

    entries.into_iter().map(|e| (e.name, e)).collect()
}

fn closes_of(window: &[Candle]) -> Vec<f64> {
    window.iter().map(|c| c.close).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_all_required_strategies() {
        let reg = registry();
        for name in [
            "ma_crossover",
            "rsi",
            "macd",
            "bollinger_bands",
            "combined",
            "grid",
        ] {
            assert!(reg.contains_key(name), "missing strategy {name}");
        }
    }

    #[test]
    fn strategy_output_in_signal_confidence_domain() {
        let reg = registry();
        let closes: Vec<f64> = (1..=250).map(|i| 100.0 + (i as f64 * 0.1).sin() * 5.0).collect();
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64,
                close_time: i as i64,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1.0,
                quote_volume: 1.0,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 0.5,
                is_closed: true,
            })
            .collect();

        for (name, entry) in reg.iter() {
            if candles.len() < entry.min_window {
                continue;
            }
            let out = (entry.analyze)(&candles).unwrap_or_else(|_| panic!("{name} failed"));
            assert!((0.0..=1.0).contains(&out.confidence), "{name} confidence out of range");
        }
    }
}
