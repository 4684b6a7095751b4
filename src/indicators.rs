// =============================================================================
// Indicator support math — RSI, EMA, ATR, ADX
// =============================================================================
//
// Pure, side-effect-free helpers consumed by the strategy and regime
// classifier. Every function returns `Option` so callers are forced to handle
// insufficient data.
//
// RSI uses Wilder's smoothing; ATR and ADX use the same smoothing over true
// range and directional movement.
// =============================================================================

use crate::types::Candle;

/// Latest RSI value over `closes` with the given `period`, in [0, 100].
///
/// Returns `None` with fewer than `period + 1` closes. A market with no
/// losses reads 100, no gains reads 0, no movement at all reads 50.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    // Seed with the simple average of the first `period` deltas.
    for w in closes[..=period].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    let period_f = period as f64;
    avg_gain /= period_f;
    avg_loss /= period_f;

    // Wilder smoothing over the remainder.
    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    value.is_finite().then_some(value)
}

/// Latest EMA of `values` with the given `period`.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    // Seed with the SMA of the first `period` values.
    let mut current: f64 = values[..period].iter().sum::<f64>() / period as f64;
    for &v in &values[period..] {
        current = v * alpha + current * (1.0 - alpha);
    }
    current.is_finite().then_some(current)
}

/// True range of a candle given the previous close.
fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Latest ATR over `candles` with the given `period` (Wilder smoothing).
///
/// The result is in price units; divide by price for the normalized form.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| true_range(&w[1], w[0].close))
        .collect();

    let period_f = period as f64;
    let mut smoothed: f64 = trs[..period].iter().sum::<f64>() / period_f;
    for &tr in &trs[period..] {
        smoothed = (smoothed * (period_f - 1.0) + tr) / period_f;
    }

    smoothed.is_finite().then_some(smoothed)
}

/// Latest ADX over `candles` with the given `period`, in [0, 100].
///
/// Needs at least `2 * period + 1` candles: one `period` to seed the
/// smoothed DM/TR sums, another to seed the DX average.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;

    // Per-bar +DM / -DM / TR.
    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    let mut trs = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let up = w[1].high - w[0].high;
        let down = w[0].low - w[1].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        trs.push(true_range(&w[1], w[0].close));
    }

    // Wilder-smoothed sums seeded from the first `period` bars.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = trs[..period].iter().sum();

    let dx_at = |sp: f64, sm: f64, st: f64| -> f64 {
        if st <= 0.0 {
            return 0.0;
        }
        let pdi = 100.0 * sp / st;
        let mdi = 100.0 * sm / st;
        let sum = pdi + mdi;
        if sum <= 0.0 {
            0.0
        } else {
            100.0 * (pdi - mdi).abs() / sum
        }
    };

    let mut dx_values = vec![dx_at(sm_plus, sm_minus, sm_tr)];
    for i in period..trs.len() {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + trs[i];
        dx_values.push(dx_at(sm_plus, sm_minus, sm_tr));
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX = Wilder-smoothed DX.
    let mut adx_val: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx_val = (adx_val * (period_f - 1.0) + dx) / period_f;
    }

    adx_val.is_finite().then_some(adx_val)
}
