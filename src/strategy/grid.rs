// Grid: levels at +/- i*spacing% around a reference price (the window's
// first close). BUY on a lower-level touch, SELL on an upper-level touch.
// No teacher counterpart — written fresh to mirror the other strategies'
// pure-function shape.

use super::{closes_of, Signal, StrategyOutput};
use crate::candles::require_window;
use crate::error::FleetError;
use crate::exchange::Candle;

const LEVELS: i32 = 5;
const SPACING_PCT: f64 = 0.01;
pub const MIN_WINDOW: usize = 2;

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let closes = closes_of(window);
    require_window(&closes, MIN_WINDOW)?;

    let reference = closes[0];
    let now_close = *closes.last().unwrap();

    let mut nearest_level = 0i32;
    let mut nearest_price = reference;
    let mut nearest_dist = f64::MAX;
    for i in -LEVELS..=LEVELS {
        let level_price = reference * (1.0 + i as f64 * SPACING_PCT);
        let dist = (now_close - level_price).abs();
        if dist < nearest_dist {
            nearest_dist = dist;
            nearest_level = i;
            nearest_price = level_price;
        }
    }

    let proximity_pct = nearest_dist / nearest_price.abs().max(1e-9);
    const TOUCH_TOLERANCE: f64 = 0.001;

    let (signal, reason) = if proximity_pct > TOUCH_TOLERANCE {
        (Signal::Hold, "not at a grid level".to_string())
    } else if nearest_level < 0 {
        (Signal::Buy, format!("touched lower grid level {nearest_level}"))
    } else if nearest_level > 0 {
        (Signal::Sell, format!("touched upper grid level {nearest_level}"))
    } else {
        (Signal::Hold, "at the reference level".to_string())
    };

    let confidence = if signal == Signal::Hold {
        0.0
    } else {
        (nearest_level.unsigned_abs() as f64 / LEVELS as f64).max(0.1).min(1.0)
    };

    Ok(StrategyOutput {
        signal,
        confidence,
        reason,
        indicators: serde_json::json!({ "reference": reference, "nearest_level": nearest_level, "nearest_price": nearest_price }),
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
    fn rejects_empty_window() {
        assert!(analyze(&[]).is_err());
    }

    #[test]
    fn buy_on_lower_level_touch() {
        let candles = candles_from(&[100.0, 99.0]);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Buy);
    }

    #[test]
    fn sell_on_upper_level_touch() {
        let candles = candles_from(&[100.0, 101.0]);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Sell);
    }

    #[test]
    fn hold_between_levels() {
        let candles = candles_from(&[100.0, 100.3]);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Hold);
    }
}
