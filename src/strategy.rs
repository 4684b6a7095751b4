// =============================================================================
// APEX Strategy — pure signal generation
// =============================================================================
//
// No side effects, no I/O: candles + regime in, at most one Signal per symbol
// per cycle out.
//
// Pipeline:
//   1. Classify regime (TRENDING / RANGING / VOLATILE) with a confidence
//      derived from distance to the classification thresholds.
//   2. Score LONG and SHORT candidates on five weighted factors:
//        trend 25, momentum 20, price-action 20, volume 15, structure 20.
//   3. Require multi-timeframe RSI agreement (>= 70% concordance across
//      base / 5x / 15x) for the winning direction.
//   4. Reject below the entry threshold (60). Scores >= 80 earn a
//      strong-entry confidence boost.
//   5. Derive the stop from normalized ATR and targets from the stop.
// =============================================================================

use tracing::debug;

use crate::indicators::{adx, atr, ema, rsi};
use crate::types::{Candle, Regime, Side, Signal, Timeframe};

/// Minimum composite score for any entry.
const ENTRY_THRESHOLD: f64 = 60.0;
/// Score at which the strong-entry confidence boost applies.
const STRONG_ENTRY_THRESHOLD: f64 = 80.0;
/// Required multi-timeframe RSI concordance.
const MTF_CONCORDANCE_MIN: f64 = 0.70;

/// Factor weights (sum 100).
const WEIGHT_TREND: f64 = 25.0;
const WEIGHT_MOMENTUM: f64 = 20.0;
const WEIGHT_PRICE_ACTION: f64 = 20.0;
const WEIGHT_VOLUME: f64 = 15.0;
const WEIGHT_STRUCTURE: f64 = 20.0;

/// Base half-width of the RSI band before volatility weighting.
const BASE_BAND_WIDTH: f64 = 10.0;

const RSI_PERIOD: usize = 14;
const ATR_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Candles for one symbol across the three agreement timeframes.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    pub base_tf: Timeframe,
    pub base: Vec<Candle>,
    /// 5x the base timeframe.
    pub mid: Vec<Candle>,
    /// 15x the base timeframe.
    pub high: Vec<Candle>,
}

/// Output of the regime classifier.
#[derive(Debug, Clone, Copy)]
pub struct RegimeReading {
    pub regime: Regime,
    pub adx: f64,
    /// ATR / price, fractional.
    pub atr_norm: f64,
    /// Confidence in [0, 1], from distance to the classification thresholds.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Regime classification
// ---------------------------------------------------------------------------

/// Classify the market regime from the base-timeframe candles.
///
/// TRENDING when ADX > 25; RANGING when ADX < 20 and ATR/price < 3%;
/// VOLATILE otherwise.
pub fn classify_regime(candles: &[Candle]) -> Option<RegimeReading> {
    let adx_val = adx(candles, ADX_PERIOD)?;
    let atr_val = atr(candles, ATR_PERIOD)?;
    let price = candles.last()?.close;
    if price <= 0.0 {
        return None;
    }
    let atr_norm = atr_val / price;

    let (regime, confidence) = if adx_val > 25.0 {
        // Deeper into trend territory = more confident.
        (Regime::Trending, ((adx_val - 25.0) / 20.0).clamp(0.1, 1.0))
    } else if adx_val < 20.0 && atr_norm < 0.03 {
        let adx_conf = (20.0 - adx_val) / 20.0;
        let atr_conf = (0.03 - atr_norm) / 0.03;
        (Regime::Ranging, (0.5 * adx_conf + 0.5 * atr_conf).clamp(0.1, 1.0))
    } else {
        // Between thresholds, or quiet ADX with elevated range.
        let distance = ((adx_val - 22.5).abs() / 22.5).min(atr_norm / 0.03);
        (Regime::Volatile, (1.0 - distance).clamp(0.1, 1.0))
    };

    Some(RegimeReading {
        regime,
        adx: adx_val,
        atr_norm,
        confidence,
    })
}

// ---------------------------------------------------------------------------
// Volatility-weighted RSI band
// ---------------------------------------------------------------------------

/// Half-width of the RSI band, centered at 50, clamped to [5, 20].
///
/// `atr_norm_pct` is ATR/price expressed in percent (0.5 = half a percent);
/// `adx` in [0, 100]. High volatility and strong trend both narrow the band.
pub fn volatility_band_width(atr_norm_pct: f64, adx: f64) -> f64 {
    let denom = 0.6 * atr_norm_pct.max(0.0) + 0.4 * (1.0 - (adx / 100.0).clamp(0.0, 1.0));
    let width = if denom > f64::EPSILON {
        BASE_BAND_WIDTH / denom
    } else {
        20.0
    };
    width.clamp(5.0, 20.0)
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Analyze one symbol. Returns at most one signal per cycle, or `None` when
/// no side clears the gates.
pub fn analyze(symbol: &str, series: &CandleSeries, reading: RegimeReading) -> Option<Signal> {
    let base = &series.base;
    if base.len() < 2 * ADX_PERIOD + 1 {
        return None;
    }

    let closes: Vec<f64> = base.iter().map(|c| c.close).collect();
    let price = *closes.last()?;
    if price <= 0.0 {
        return None;
    }

    let rsi_base = rsi(&closes, RSI_PERIOD)?;
    let band_width = volatility_band_width(reading.atr_norm * 100.0, reading.adx);

    let long_score = score_side(Side::Long, base, &closes, rsi_base, band_width)?;
    let short_score = score_side(Side::Short, base, &closes, rsi_base, band_width)?;

    let (side, score) = if long_score >= short_score {
        (Side::Long, long_score)
    } else {
        (Side::Short, short_score)
    };

    if score < ENTRY_THRESHOLD {
        debug!(symbol, score, threshold = ENTRY_THRESHOLD, "score below entry threshold");
        return None;
    }

    // Multi-timeframe RSI agreement for the winning direction.
    let concordance = mtf_concordance(side, series)?;
    if concordance < MTF_CONCORDANCE_MIN {
        debug!(
            symbol,
            side = %side,
            concordance,
            "multi-timeframe RSI disagreement; no signal"
        );
        return None;
    }

    // Stop from normalized ATR; targets as multiples of the stop.
    let stop_pct = (1.5 * reading.atr_norm).clamp(0.008, 0.03);
    let targets = vec![2.0 * stop_pct, 3.0 * stop_pct];

    let mut confidence = reading.confidence;
    if score >= STRONG_ENTRY_THRESHOLD {
        confidence = (confidence + 0.15).min(1.0);
    }

    let reason = format!(
        "score={score:.0} rsi={rsi_base:.0} band=\u{b1}{band_width:.1} adx={adx:.0} \
         regime={regime} mtf={concordance:.2}",
        adx = reading.adx,
        regime = reading.regime,
    );

    debug!(
        symbol,
        tf = %series.base_tf,
        side = %side,
        score,
        stop_pct,
        confidence,
        "entry signal generated"
    );

    Some(Signal {
        symbol: symbol.to_string(),
        side,
        score,
        suggested_stop_pct: stop_pct,
        targets,
        reason,
        regime: reading.regime,
        confidence,
    })
}

/// Score one side on the five weighted factors. Returns a value in [0, 100].
fn score_side(
    side: Side,
    candles: &[Candle],
    closes: &[f64],
    rsi_value: f64,
    band_width: f64,
) -> Option<f64> {
    let price = *closes.last()?;

    // ── Trend (25): EMA 9/21/55 alignment ───────────────────────────────
    let ema9 = ema(closes, 9)?;
    let ema21 = ema(closes, 21)?;
    let ema55 = ema(closes, 55).unwrap_or(ema21);

    let aligned = match side {
        Side::Long => ema9 > ema21 && ema21 > ema55,
        Side::Short => ema9 < ema21 && ema21 < ema55,
    };
    let partially = match side {
        Side::Long => ema9 > ema21,
        Side::Short => ema9 < ema21,
    };
    let trend = if aligned {
        WEIGHT_TREND
    } else if partially {
        WEIGHT_TREND * 0.6
    } else if (side == Side::Long && price > ema21) || (side == Side::Short && price < ema21) {
        WEIGHT_TREND * 0.3
    } else {
        0.0
    };

    // ── Momentum (20): RSI position within the volatility band ──────────
    // Full credit for momentum inside the band in our direction; reduced
    // credit once the band is breached (overextension).
    let offset = side.direction() * (rsi_value - 50.0);
    let momentum = if offset <= 0.0 {
        0.0
    } else if offset < band_width {
        WEIGHT_MOMENTUM * (offset / band_width)
    } else {
        WEIGHT_MOMENTUM * 0.25
    };

    // ── Price action (20): close location within the recent 10-bar range ─
    let tail = &candles[candles.len().saturating_sub(10)..];
    let range_high = tail.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let range_low = tail.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let span = range_high - range_low;
    let location = if span > f64::EPSILON {
        ((price - range_low) / span).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let price_action = match side {
        Side::Long => WEIGHT_PRICE_ACTION * location,
        Side::Short => WEIGHT_PRICE_ACTION * (1.0 - location),
    };

    // ── Volume (15): last volume against the 20-bar average ─────────────
    let vol_tail = &candles[candles.len().saturating_sub(20)..];
    let avg_volume: f64 =
        vol_tail.iter().map(|c| c.volume).sum::<f64>() / vol_tail.len().max(1) as f64;
    let last_volume = candles.last()?.volume;
    let volume = if avg_volume > f64::EPSILON {
        WEIGHT_VOLUME * (last_volume / (2.0 * avg_volume)).min(1.0)
    } else {
        0.0
    };

    // ── Structure (20): proximity to a 20-bar breakout ───────────────────
    let struct_tail = &candles[candles.len().saturating_sub(20)..];
    let struct_high = struct_tail.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let struct_low = struct_tail.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let struct_span = struct_high - struct_low;
    let structure = if struct_span > f64::EPSILON {
        let breakout_proximity = match side {
            Side::Long => 1.0 - (struct_high - price) / struct_span,
            Side::Short => 1.0 - (price - struct_low) / struct_span,
        };
        WEIGHT_STRUCTURE * breakout_proximity.clamp(0.0, 1.0)
    } else {
        WEIGHT_STRUCTURE * 0.5
    };

    Some(trend + momentum + price_action + volume + structure)
}

/// Fraction of timeframes whose RSI agrees with `side`. Timeframes without
/// enough data are excluded; returns `None` when even the base lacks data.
fn mtf_concordance(side: Side, series: &CandleSeries) -> Option<f64> {
    let mut agreeing = 0usize;
    let mut available = 0usize;

    for candles in [&series.base, &series.mid, &series.high] {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let Some(value) = rsi(&closes, RSI_PERIOD) else {
            continue;
        };
        available += 1;
        let direction = if value >= 50.0 { Side::Long } else { Side::Short };
        if direction == side {
            agreeing += 1;
        }
    }

    if available == 0 {
        return None;
    }
    Some(agreeing as f64 / available as f64)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 * (1.0 + 0.01 * i as f64);
                Candle::new(
                    i as i64 * 60_000,
                    base * 0.999,
                    base * 1.002,
                    base * 0.997,
                    base,
                    1_000.0 + 10.0 * i as f64,
                )
            })
            .collect()
    }

    fn trending_down(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 300.0 * (1.0 - 0.008 * i as f64);
                Candle::new(
                    i as i64 * 60_000,
                    base * 1.001,
                    base * 1.003,
                    base * 0.998,
                    base,
                    1_000.0 + 10.0 * i as f64,
                )
            })
            .collect()
    }

    fn flat_chop(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = if i % 2 == 0 { 100.0 } else { 100.4 };
                Candle::new(i as i64 * 60_000, c, c + 0.5, c - 0.5, c, 1_000.0)
            })
            .collect()
    }

    fn wild_swings(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = if i % 2 == 0 { 100.0 } else { 110.0 };
                Candle::new(i as i64 * 60_000, c, c + 8.0, c - 8.0, c, 1_000.0)
            })
            .collect()
    }

    // ---- regime ----------------------------------------------------------

    #[test]
    fn strong_trend_classifies_trending() {
        let reading = classify_regime(&trending_up(60)).unwrap();
        assert_eq!(reading.regime, Regime::Trending);
        assert!(reading.adx > 25.0);
        assert!(reading.confidence > 0.0 && reading.confidence <= 1.0);
    }

    #[test]
    fn quiet_chop_classifies_ranging() {
        let reading = classify_regime(&flat_chop(60)).unwrap();
        assert_eq!(reading.regime, Regime::Ranging);
        assert!(reading.adx < 20.0);
        assert!(reading.atr_norm < 0.03);
    }

    #[test]
    fn wide_swings_classify_volatile() {
        let reading = classify_regime(&wild_swings(60)).unwrap();
        assert_eq!(reading.regime, Regime::Volatile);
        assert!(reading.atr_norm >= 0.03);
    }

    #[test]
    fn regime_needs_enough_candles() {
        assert!(classify_regime(&trending_up(10)).is_none());
    }

    // ---- band width ------------------------------------------------------

    #[test]
    fn band_width_clamped() {
        // Very high volatility narrows to the floor.
        assert!((volatility_band_width(50.0, 0.0) - 5.0).abs() < 1e-9);
        // Very quiet market widens to the cap.
        assert!((volatility_band_width(0.0, 100.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn band_width_monotone_in_volatility() {
        let quiet = volatility_band_width(0.3, 20.0);
        let loud = volatility_band_width(3.0, 20.0);
        assert!(loud < quiet, "higher ATR must narrow the band");
    }

    // ---- analyze ---------------------------------------------------------

    #[test]
    fn uptrend_emits_long_signal() {
        let base = trending_up(80);
        let series = CandleSeries {
            base_tf: Timeframe::M1,
            base: base.clone(),
            mid: trending_up(40),
            high: trending_up(30),
        };
        let reading = classify_regime(&series.base).unwrap();

        let signal = analyze("BTC-USD", &series, reading).expect("expected a signal");
        assert_eq!(signal.side, Side::Long);
        assert!(signal.score >= ENTRY_THRESHOLD);
        assert!(signal.suggested_stop_pct >= 0.008 && signal.suggested_stop_pct <= 0.03);
        assert_eq!(signal.targets.len(), 2);
        assert!(signal.targets[0] < signal.targets[1]);
        // Targets are fractional (0.016 not 1.6).
        assert!(signal.targets.iter().all(|&t| t < 0.10));
    }

    #[test]
    fn downtrend_emits_short_signal() {
        let series = CandleSeries {
            base_tf: Timeframe::M1,
            base: trending_down(80),
            mid: trending_down(40),
            high: trending_down(30),
        };
        let reading = classify_regime(&series.base).unwrap();

        let signal = analyze("ETH-USD", &series, reading).expect("expected a signal");
        assert_eq!(signal.side, Side::Short);
    }

    #[test]
    fn flat_market_emits_nothing() {
        let series = CandleSeries {
            base_tf: Timeframe::M1,
            base: flat_chop(80),
            mid: flat_chop(40),
            high: flat_chop(30),
        };
        let reading = classify_regime(&series.base).unwrap();
        assert!(analyze("BTC-USD", &series, reading).is_none());
    }

    #[test]
    fn higher_timeframe_disagreement_blocks_entry() {
        // Base and mid scream LONG; the 15x timeframe is falling. 2/3 < 70%.
        let series = CandleSeries {
            base_tf: Timeframe::M1,
            base: trending_up(80),
            mid: trending_up(40),
            high: trending_down(30),
        };
        let reading = classify_regime(&series.base).unwrap();
        assert!(analyze("BTC-USD", &series, reading).is_none());
    }

    #[test]
    fn insufficient_data_is_none() {
        let series = CandleSeries {
            base_tf: Timeframe::M1,
            base: trending_up(10),
            mid: Vec::new(),
            high: Vec::new(),
        };
        let reading = RegimeReading {
            regime: Regime::Trending,
            adx: 30.0,
            atr_norm: 0.01,
            confidence: 0.5,
        };
        assert!(analyze("BTC-USD", &series, reading).is_none());
    }
}
