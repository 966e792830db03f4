// RSI(14). BUY when RSI crosses above 30 (boost to 0.85 if < 25 on the last
// bar); SELL symmetrically at 70/75. Grounded on `indicators/rsi.rs`'s
// Wilder-smoothed series.

use super::{closes_of, Signal, StrategyOutput};
use crate::candles::require_window;
use crate::error::FleetError;
use crate::exchange::Candle;
use crate::indicators::rsi::calculate_rsi;

const PERIOD: usize = 14;
pub const MIN_WINDOW: usize = PERIOD + 2;

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let closes = closes_of(window);
    require_window(&closes, MIN_WINDOW)?;

    let series = calculate_rsi(&closes, PERIOD);
    if series.len() < 2 {
        return Ok(StrategyOutput::hold("insufficient RSI series"));
    }

    let prev = series[series.len() - 2];
    let now = series[series.len() - 1];

    let (signal, mut confidence, reason) = if prev < 30.0 && now >= 30.0 {
        (Signal::Buy, 0.6, "RSI crossed above 30".to_string())
    } else if prev > 70.0 && now <= 70.0 {
        (Signal::Sell, 0.6, "RSI crossed below 70".to_string())
    } else {
        (Signal::Hold, 0.0, "no RSI threshold cross".to_string())
    };

    if signal == Signal::Buy && now < 25.0 {
        confidence = 0.85;
    }
    if signal == Signal::Sell && now > 75.0 {
        confidence = 0.85;
    }

    Ok(StrategyOutput {
        signal,
        confidence,
        reason,
        indicators: serde_json::json!({ "rsi": now }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64,
                close_time: i as i64,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
                quote_volume: 1.0,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 0.5,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn buy_on_cross_above_thirty() {
        // Strictly descending then a sharp one-bar bounce should cross RSI
        // from below 30 to above it.
        let mut closes: Vec<f64> = (0..30).rev().map(|x| 100.0 + x as f64).collect();
        closes.push(*closes.last().unwrap() + 5.0);
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Buy);
    }

    #[test]
    fn hold_when_no_cross() {
        let closes = vec![100.0; 30];
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Hold);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn confidence_in_range() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 4.0).collect();
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert!((0.0..=1.0).contains(&out.confidence));
    }
}
