// SMA(fast=20) vs SMA(slow=50) crossover. Grounded on the teacher's
// `indicators/ema.rs` trend-alignment style (compare the last two points of
// two series to detect a cross) applied to `indicators/sma.rs`.

use super::{closes_of, Signal, StrategyOutput};
use crate::candles::require_window;
use crate::error::FleetError;
use crate::exchange::Candle;
use crate::indicators::sma::calculate_sma;

const FAST: usize = 20;
const SLOW: usize = 50;
pub const MIN_WINDOW: usize = SLOW + 1;

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let closes = closes_of(window);
    require_window(&closes, MIN_WINDOW)?;

    let fast = calculate_sma(&closes, FAST);
    let slow = calculate_sma(&closes, SLOW);

    // Align the two series on the same tail index (fast has more points).
    let offset = fast.len() - slow.len();
    let fast_prev = fast[fast.len() - 2];
    let fast_now = fast[fast.len() - 1];
    let slow_prev = slow[slow.len() - 2];
    let slow_now = slow[slow.len() - 1];
    let _ = offset;

    let gap = (fast_now - slow_now) / slow_now;
    let confidence = gap.abs().min(1.0).max(0.05);

    let signal = if fast_prev <= slow_prev && fast_now > slow_now {
        Signal::Buy
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        Signal::Sell
    } else {
        Signal::Hold
    };

    let reason = match signal {
        Signal::Buy => "fast SMA crossed above slow SMA".to_string(),
        Signal::Sell => "fast SMA crossed below slow SMA".to_string(),
        Signal::Hold => "no crossover".to_string(),
    };

    Ok(StrategyOutput {
        signal,
        confidence: if signal == Signal::Hold { 0.0 } else { confidence },
        reason,
        indicators: serde_json::json!({ "sma_fast": fast_now, "sma_slow": slow_now, "gap_pct": gap }),
    })
}
