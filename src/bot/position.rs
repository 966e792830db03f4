// =============================================================================
// Risk Gate — stop-loss / take-profit-arm / trailing-exit evaluation
// =============================================================================
//
// Spec §4.5 step 2. Generalizes the teacher's `position_engine.rs` trailing-
// stop mechanics (`highest_price`/`lowest_price` accumulators, a
// `TRAILING_STOP_PCT`-style constant) down to the spec's single-position,
// no-partial-close model — the teacher's TP1/TP2 staged exits are dropped
// (see DESIGN.md's final trim).

use super::types::{Direction, ExitReason, Position};

#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    /// Negative fraction, e.g. -0.05 for -5%.
    pub stop_loss_pct: f64,
    pub tp_min_pct: f64,
    pub tp_trail_pct: f64,
    pub fee_rate: f64,
}

/// Evaluate the risk gate for one tick. Mutates `position`'s trailing
/// accumulators and arming flag in place, then returns an exit reason if the
/// position must be closed this tick.
pub fn evaluate(position: &mut Position, mark: f64, cfg: &RiskConfig) -> Option<ExitReason> {
    position.update_trail(mark);
    let unrealized = position.unrealized_pnl_pct(mark, cfg.fee_rate);

    if unrealized <= cfg.stop_loss_pct {
        return Some(ExitReason::StopLoss);
    }

    if !position.tp_armed && unrealized >= cfg.tp_min_pct {
        position.tp_armed = true;
    }

    if position.tp_armed {
        let best = position.best_excursion();
        if best != 0.0 {
            let retracement = match position.direction {
                Direction::Long => (best - mark) / best,
                Direction::Short => (mark - best) / best,
            };
            if retracement >= cfg.tp_trail_pct {
                return Some(ExitReason::TakeProfit);
            }
        }
    }

    None
}

/// The minimum-take-profit guard on a strategy-driven SIGNAL-SELL/close
/// (spec §4.5 step 4, SELL/LONG branch): only stop-loss and trailing
/// take-profit may close a position below the `tp_min_pct` floor.
pub fn signal_close_permitted(position: &Position, mark: f64, cfg: &RiskConfig) -> bool {
    position.unrealized_pnl_pct(mark, cfg.fee_rate) >= cfg.tp_min_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig {
            stop_loss_pct: -0.05,
            tp_min_pct: 0.02,
            tp_trail_pct: 0.03,
            fee_rate: 0.0,
        }
    }

    #[test]
    fn stop_loss_fires_at_exactly_threshold() {
        let mut pos = Position::new(Direction::Long, 2000.0, 1.0, 0, 2000.0, "t1".into());
        // -5% of 2000 = 1900
        let reason = evaluate(&mut pos, 1900.0, &cfg());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn stop_loss_bypasses_signal_guard() {
        // S2 — bot buys at 50000, falls to 47500 (-5%).
        let mut pos = Position::new(Direction::Long, 50_000.0, 1.0, 0, 50_000.0, "t1".into());
        let reason = evaluate(&mut pos, 47_500.0, &cfg());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn take_profit_arms_then_trails() {
        // S1 — ETHUSDT long at 2000, rises to 2080 (armed at +2%), retraces
        // to 2016 (~3.08% from 2080) -> take-profit fires.
        let mut pos = Position::new(Direction::Long, 2000.0, 1.0, 0, 2000.0, "t1".into());
        assert_eq!(evaluate(&mut pos, 2050.0, &cfg()), None); // arms (+2.5%)
        assert!(pos.tp_armed);
        assert_eq!(evaluate(&mut pos, 2080.0, &cfg()), None); // new high, no retrace yet
        let reason = evaluate(&mut pos, 2016.0, &cfg());
        assert_eq!(reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn take_profit_does_not_arm_below_minimum() {
        let mut pos = Position::new(Direction::Long, 100.0, 1.0, 0, 100.0, "t1".into());
        evaluate(&mut pos, 101.0, &cfg()); // +1%, below 2% floor
        assert!(!pos.tp_armed);
    }

    #[test]
    fn short_trailing_exit_on_bounce() {
        // S4 — MARGIN short at 50000, drops to 48500, bounces to ~49955.
        let mut pos = Position::new(Direction::Short, 50_000.0, 1.0, 0, 50_000.0, "t1".into());
        assert_eq!(evaluate(&mut pos, 48_500.0, &cfg()), None); // arms (+3%)
        assert!(pos.tp_armed);
        let reason = evaluate(&mut pos, 49_955.0, &cfg());
        assert_eq!(reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn signal_close_boundary_exactly_two_percent_permitted() {
        let pos = Position::new(Direction::Long, 100.0, 1.0, 0, 100.0, "t1".into());
        assert!(signal_close_permitted(&pos, 102.0, &cfg()));
    }

    #[test]
    fn signal_close_boundary_just_under_rejected() {
        // S3 — LONG at 100, mark 101.5 (+1.5%) -> rejected.
        let pos = Position::new(Direction::Long, 100.0, 1.0, 0, 100.0, "t1".into());
        assert!(!signal_close_permitted(&pos, 101.5, &cfg()));
        assert!(!signal_close_permitted(&pos, 101.99, &cfg()));
    }
}
