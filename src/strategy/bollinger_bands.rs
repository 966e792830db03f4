// Bollinger Bands(20, 2σ). BUY on a bounce off the lower band, SELL off the
// upper band; an extreme overshoot raises confidence to 0.8. Grounded on
// `indicators/bollinger.rs`.

use super::{closes_of, Signal, StrategyOutput};
use crate::candles::require_window;
use crate::error::FleetError;
use crate::exchange::Candle;
use crate::indicators::bollinger::calculate_bollinger;

const PERIOD: usize = 20;
const NUM_STD: f64 = 2.0;
pub const MIN_WINDOW: usize = PERIOD + 1;

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let closes = closes_of(window);
    require_window(&closes, MIN_WINDOW)?;

    let prev_closes = &closes[..closes.len() - 1];
    let bb_now = calculate_bollinger(&closes, PERIOD, NUM_STD)
        .ok_or_else(|| FleetError::new(crate::error::ErrorKind::StrategyInput, "bollinger bands undefined"))?;
    let bb_prev = calculate_bollinger(prev_closes, PERIOD, NUM_STD)
        .ok_or_else(|| FleetError::new(crate::error::ErrorKind::StrategyInput, "bollinger bands undefined"))?;

    let prev_close = *prev_closes.last().unwrap();
    let now_close = *closes.last().unwrap();

    let (signal, reason) = if prev_close <= bb_prev.lower && now_close > bb_now.lower {
        (Signal::Buy, "bounced off the lower band".to_string())
    } else if prev_close >= bb_prev.upper && now_close < bb_now.upper {
        (Signal::Sell, "bounced off the upper band".to_string())
    } else {
        (Signal::Hold, "price inside the bands".to_string())
    };

    let confidence = match signal {
        Signal::Hold => 0.0,
        _ => {
            let overshoot = match signal {
                Signal::Buy => (bb_prev.lower - prev_close) / bb_prev.lower.abs().max(1e-9),
                Signal::Sell => (prev_close - bb_prev.upper) / bb_prev.upper.abs().max(1e-9),
                Signal::Hold => 0.0,
            };
            if overshoot > 0.01 {
                0.8
            } else {
                0.55
            }
        }
    };

    Ok(StrategyOutput {
        signal,
        confidence,
        reason,
        indicators: serde_json::json!({
            "upper": bb_now.upper, "middle": bb_now.middle, "lower": bb_now.lower, "width": bb_now.width,
        }),
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
    fn rejects_short_window() {
        let candles = candles_from(&[1.0, 2.0, 3.0]);
        assert!(analyze(&candles).is_err());
    }

    #[test]
    fn hold_on_flat_series() {
        let closes = vec![100.0; 25];
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Hold);
    }

    #[test]
    fn confidence_in_range() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.4).sin() * 5.0).collect();
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert!((0.0..=1.0).contains(&out.confidence));
    }
}
