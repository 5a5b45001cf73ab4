//! Candidate normalization: heterogeneous scanner payloads in, canonical
//! opportunities out.
//!
//! Scanners return loosely structured JSON rows. This module maps them onto a
//! single `Opportunity` record with a fixed metric-resolution order:
//!
//! 1. `raw.computed[key]`
//! 2. `raw[key]`
//! 3. strategy-local alias list (same two levels, in alias order)
//! 4. null
//!
//! Normalization never fails. A degenerate row yields an opportunity with the
//! `N/A` symbol sentinel, null metrics, and a `notes` entry naming the gap.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Origin class of an opportunity. Stock picks hold no options metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Options,
    Stock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvRvFlag {
    Rich,
    Cheap,
    Balanced,
}

/// Auxiliary display metrics attached to every opportunity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub price: Option<f64>,
    pub rsi14: Option<f64>,
    pub ema20: Option<f64>,
    pub iv_rv_ratio: Option<f64>,
    pub trend: Option<Trend>,
    pub iv_rv_flag: Option<IvRvFlag>,
    pub liquidity: Option<f64>,
}

/// Prior model inference carried through from the raw candidate, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelNote {
    pub status: Option<String>,
    pub recommendation: Option<String>,
    pub confidence: Option<f64>,
    pub summary: Option<String>,
}

/// Canonical normalized record emitted by the scanner pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    /// Lowercase canonicalized strategy tag.
    pub strategy: String,
    pub source_type: SourceType,
    pub source_scanner: String,
    /// Normalized base score in [0, 100].
    pub score: f64,
    pub ev: Option<f64>,
    pub pop: Option<f64>,
    pub ror: Option<f64>,
    pub key_metrics: KeyMetrics,
    pub model: Option<ModelNote>,
    /// Opaque pass-through of the raw candidate for downstream action payloads.
    pub trade: Value,
    pub trade_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Strategy canonicalization
// ---------------------------------------------------------------------------

/// Closed alias table: known strategy spellings → canonical tag.
const STRATEGY_ALIASES: &[(&str, &str)] = &[
    ("put_credit_spread", "credit_spread"),
    ("call_credit_spread", "credit_spread"),
    ("bull_put_spread", "credit_spread"),
    ("bear_call_spread", "credit_spread"),
    ("call_debit_spread", "debit_spread"),
    ("put_debit_spread", "debit_spread"),
    ("bull_call_spread", "debit_spread"),
    ("bear_put_spread", "debit_spread"),
    ("iron_condor", "iron_condor"),
    ("iron_butterfly", "butterfly"),
    ("covered_call", "income"),
    ("cash_secured_put", "income"),
    ("calendar_spread", "calendar"),
    ("diagonal_spread", "calendar"),
];

/// Canonicalize a strategy tag: exact alias first, then the closed substring
/// families (credit/debit/condor/butterfly/calendar/income).
pub fn canonical_strategy(tag: &str) -> String {
    let lower = tag.trim().to_lowercase();
    for (alias, canon) in STRATEGY_ALIASES {
        if lower == *alias {
            return (*canon).to_string();
        }
    }
    if lower.contains("condor") {
        return "iron_condor".to_string();
    }
    if lower.contains("butterfly") || lower.contains("fly") {
        return "butterfly".to_string();
    }
    if lower.contains("calendar") || lower.contains("diagonal") {
        return "calendar".to_string();
    }
    if lower.contains("credit") {
        return "credit_spread".to_string();
    }
    if lower.contains("debit") {
        return "debit_spread".to_string();
    }
    if lower.contains("income") {
        return "income".to_string();
    }
    lower
}

// ---------------------------------------------------------------------------
// Field resolution
// ---------------------------------------------------------------------------

/// Numeric coercion: JSON numbers plus numeric strings (scanner payloads mix
/// both encodings).
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lookup<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    let v = raw.get(key)?;
    if v.is_null() {
        None
    } else {
        Some(v)
    }
}

/// Resolve a numeric metric with the contractual four-tier order.
pub fn resolve_metric(raw: &Value, key: &str, aliases: &[&str]) -> Option<f64> {
    let computed = raw.get("computed");
    if let Some(v) = computed.and_then(|c| lookup(c, key)).and_then(as_number) {
        return Some(v);
    }
    if let Some(v) = lookup(raw, key).and_then(as_number) {
        return Some(v);
    }
    for alias in aliases {
        if let Some(v) = computed.and_then(|c| lookup(c, alias)).and_then(as_number) {
            return Some(v);
        }
        if let Some(v) = lookup(raw, alias).and_then(as_number) {
            return Some(v);
        }
    }
    None
}

fn resolve_str(raw: &Value, key: &str, aliases: &[&str]) -> Option<String> {
    let get = |k: &str| -> Option<String> {
        raw.get("computed")
            .and_then(|c| lookup(c, k))
            .or_else(|| lookup(raw, k))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    get(key).or_else(|| aliases.iter().find_map(|a| get(a)))
}

fn clamp_score(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Liquidity in [0, 100]: spread-based when a spread is quoted, otherwise a
/// volume/open-interest blend, otherwise null.
fn derive_liquidity(raw: &Value) -> Option<f64> {
    if let Some(spread_pct) = resolve_metric(raw, "bid_ask_spread_pct", &["spread_pct"]) {
        return Some(clamp_score(100.0 - spread_pct * 100.0));
    }
    let volume = resolve_metric(raw, "volume", &["vol"]);
    let oi = resolve_metric(raw, "open_interest", &["oi"]);
    if volume.is_none() && oi.is_none() {
        return None;
    }
    let vol_part = (volume.unwrap_or(0.0) / 1000.0) * 40.0;
    let oi_part = (oi.unwrap_or(0.0) / 3000.0) * 60.0;
    Some(clamp_score(vol_part + oi_part))
}

/// Return-on-risk: a directly reported value always wins over derivation.
fn derive_ror(raw: &Value) -> Option<f64> {
    if let Some(direct) = resolve_metric(raw, "return_on_risk", &["ror"]) {
        return Some(direct);
    }
    let max_profit = resolve_metric(raw, "max_profit", &[])?;
    let max_loss = resolve_metric(raw, "max_loss", &[])?;
    if max_loss > 0.0 {
        Some(max_profit / max_loss)
    } else {
        None
    }
}

/// Compatibility shim: some upstream paths encode probability-of-profit as a
/// percentage. Applied here exactly once, nowhere else.
fn normalize_pop(pop: f64) -> f64 {
    if pop > 1.0 {
        pop / 100.0
    } else {
        pop
    }
}

fn parse_trend(raw: &Value) -> Option<Trend> {
    match resolve_str(raw, "trend", &[])?.to_lowercase().as_str() {
        "up" | "uptrend" => Some(Trend::Up),
        "down" | "downtrend" => Some(Trend::Down),
        "range" | "sideways" => Some(Trend::Range),
        _ => None,
    }
}

fn parse_iv_rv_flag(raw: &Value, ratio: Option<f64>) -> Option<IvRvFlag> {
    if let Some(s) = resolve_str(raw, "iv_rv_flag", &[]) {
        return match s.to_lowercase().as_str() {
            "rich" => Some(IvRvFlag::Rich),
            "cheap" => Some(IvRvFlag::Cheap),
            "balanced" => Some(IvRvFlag::Balanced),
            _ => None,
        };
    }
    // Fall back to the ratio when the flag itself is absent.
    let r = ratio?;
    if r > 1.2 {
        Some(IvRvFlag::Rich)
    } else if r < 0.8 {
        Some(IvRvFlag::Cheap)
    } else {
        Some(IvRvFlag::Balanced)
    }
}

fn parse_model(raw: &Value) -> Option<ModelNote> {
    let m = lookup(raw, "model").or_else(|| lookup(raw, "model_evaluation"))?;
    let obj = m.as_object()?;
    Some(ModelNote {
        status: obj.get("status").and_then(Value::as_str).map(str::to_string),
        recommendation: obj
            .get("recommendation")
            .and_then(Value::as_str)
            .map(str::to_string),
        confidence: obj.get("confidence").and_then(as_number),
        summary: obj
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Trade key
// ---------------------------------------------------------------------------

/// Render a strike without a trailing `.0` (145.0 → "145", 147.5 → "147.5").
fn fmt_strike(strike: f64) -> String {
    if strike.fract() == 0.0 {
        format!("{strike:.0}")
    } else {
        format!("{strike}")
    }
}

fn key_part_num(v: Option<f64>) -> String {
    v.map_or_else(|| "NA".to_string(), fmt_strike)
}

/// Deterministic opportunity identifier:
/// `<SYMBOL>|<EXPIRATION-or-NA>|<STRATEGY>|<SHORT_STRIKE-or-NA>|<LONG_STRIKE-or-NA>|<DTE-or-NA>`
pub fn trade_key(raw: &Value, symbol: &str, strategy: &str) -> String {
    let expiration = resolve_str(raw, "expiration", &["exp_date", "expiry"])
        .unwrap_or_else(|| "NA".to_string());
    let short_strike = key_part_num(resolve_metric(raw, "short_strike", &[]));
    let long_strike = key_part_num(resolve_metric(raw, "long_strike", &[]));
    let dte = resolve_metric(raw, "dte", &["days_to_expiration"])
        .map_or_else(|| "NA".to_string(), |d| format!("{d:.0}"));
    format!(
        "{}|{expiration}|{strategy}|{short_strike}|{long_strike}|{dte}",
        symbol.to_uppercase()
    )
}

// ---------------------------------------------------------------------------
// Normalization entry point
// ---------------------------------------------------------------------------

/// Map one raw candidate onto the canonical record. Infallible by contract.
pub fn normalize(
    raw: &Value,
    source_scanner: &str,
    strategy_id: &str,
    source_type: SourceType,
) -> Opportunity {
    let mut notes = Vec::new();

    let symbol = resolve_str(raw, "symbol", &["ticker"])
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            notes.push("missing symbol in candidate payload".to_string());
            "N/A".to_string()
        });

    let strategy_tag = resolve_str(raw, "strategy_id", &["strategy"])
        .unwrap_or_else(|| strategy_id.to_string());
    let strategy = canonical_strategy(&strategy_tag);

    let score = resolve_metric(raw, "composite_score", &["score", "rank_score"])
        .map(clamp_score)
        .unwrap_or_else(|| {
            notes.push("no score reported; defaulted to 0".to_string());
            0.0
        });

    // Stock picks hold options metrics null by contract.
    let (ev, pop, ror) = match source_type {
        SourceType::Stock => (None, None, None),
        SourceType::Options => {
            let ev = resolve_metric(raw, "expected_value", &["ev"]);
            let pop = resolve_metric(raw, "pop", &["win_probability", "prob_of_profit"])
                .map(normalize_pop);
            let ror = derive_ror(raw);
            if ev.is_none() && pop.is_none() && ror.is_none() {
                notes.push("no options metrics available".to_string());
            }
            (ev, pop, ror)
        }
    };

    let iv_rv_ratio = resolve_metric(raw, "iv_rv_ratio", &["iv_rv"]);
    let key_metrics = KeyMetrics {
        price: resolve_metric(raw, "price", &["last", "close", "underlying_price"]),
        rsi14: resolve_metric(raw, "rsi14", &["rsi"]),
        ema20: resolve_metric(raw, "ema20", &["ema"]),
        iv_rv_ratio,
        trend: parse_trend(raw),
        iv_rv_flag: parse_iv_rv_flag(raw, iv_rv_ratio),
        liquidity: derive_liquidity(raw),
    };

    let trade_key = trade_key(raw, &symbol, &strategy);

    Opportunity {
        symbol,
        strategy,
        source_type,
        source_scanner: source_scanner.to_string(),
        score,
        ev,
        pop,
        ror,
        key_metrics,
        model: parse_model(raw),
        trade: raw.clone(),
        trade_key,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(raw: serde_json::Value) -> Opportunity {
        normalize(&raw, "credit_put", "put_credit_spread", SourceType::Options)
    }

    #[test]
    fn computed_takes_precedence_over_top_level() {
        let o = opts(json!({
            "symbol": "SPY",
            "pop": 0.50,
            "computed": { "pop": 0.72 }
        }));
        assert_eq!(o.pop, Some(0.72));
    }

    #[test]
    fn top_level_beats_alias() {
        let o = opts(json!({
            "symbol": "SPY",
            "expected_value": 12.0,
            "computed": { "ev": 99.0 }
        }));
        // "expected_value" is the canonical key; "ev" only an alias.
        assert_eq!(o.ev, Some(12.0));
    }

    #[test]
    fn alias_used_when_canonical_absent() {
        let o = opts(json!({ "symbol": "SPY", "win_probability": 0.61 }));
        assert_eq!(o.pop, Some(0.61));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let o = opts(json!({ "symbol": "SPY", "computed": { "pop": "0.55" } }));
        assert_eq!(o.pop, Some(0.55));
    }

    #[test]
    fn percent_like_pop_divided_once() {
        let o = opts(json!({ "symbol": "SPY", "computed": { "pop": 75 } }));
        assert_eq!(o.pop, Some(0.75));
    }

    #[test]
    fn pop_never_exceeds_one_after_normalization() {
        for raw_pop in [0.2, 0.99, 1.0, 55.0, 100.0] {
            let o = opts(json!({ "symbol": "SPY", "pop": raw_pop }));
            assert!(o.pop.unwrap() <= 1.0, "pop {raw_pop} not normalized");
        }
    }

    #[test]
    fn stock_opportunities_hold_null_metrics() {
        let raw = json!({
            "symbol": "qqq",
            "computed": { "pop": 0.9, "expected_value": 5.0, "return_on_risk": 0.4 },
            "composite_score": 81.0
        });
        let o = normalize(&raw, "stock_scanner", "stock", SourceType::Stock);
        assert_eq!(o.symbol, "QQQ");
        assert!(o.ev.is_none() && o.pop.is_none() && o.ror.is_none());
        assert_eq!(o.score, 81.0);
    }

    #[test]
    fn score_clamped_to_range() {
        let o = opts(json!({ "symbol": "SPY", "composite_score": 140.0 }));
        assert_eq!(o.score, 100.0);
        let o = opts(json!({ "symbol": "SPY", "composite_score": -3.0 }));
        assert_eq!(o.score, 0.0);
    }

    #[test]
    fn direct_ror_beats_derivation() {
        let o = opts(json!({
            "symbol": "SPY",
            "return_on_risk": 0.25,
            "max_profit": 100.0,
            "max_loss": 400.0
        }));
        assert_eq!(o.ror, Some(0.25));
    }

    #[test]
    fn ror_derived_from_profit_and_loss() {
        let o = opts(json!({ "symbol": "SPY", "max_profit": 80.0, "max_loss": 320.0 }));
        assert_eq!(o.ror, Some(0.25));
    }

    #[test]
    fn ror_null_when_max_loss_not_positive() {
        let o = opts(json!({ "symbol": "SPY", "max_profit": 80.0, "max_loss": 0.0 }));
        assert!(o.ror.is_none());
    }

    #[test]
    fn liquidity_from_spread() {
        let o = opts(json!({ "symbol": "SPY", "bid_ask_spread_pct": 0.08 }));
        assert_eq!(o.key_metrics.liquidity, Some(92.0));
    }

    #[test]
    fn liquidity_from_volume_and_oi() {
        let o = opts(json!({ "symbol": "SPY", "volume": 500, "open_interest": 1500 }));
        // (500/1000)*40 + (1500/3000)*60 = 20 + 30
        assert_eq!(o.key_metrics.liquidity, Some(50.0));
    }

    #[test]
    fn liquidity_clamped_at_100() {
        let o = opts(json!({ "symbol": "SPY", "volume": 50_000, "open_interest": 90_000 }));
        assert_eq!(o.key_metrics.liquidity, Some(100.0));
    }

    #[test]
    fn liquidity_null_without_inputs() {
        let o = opts(json!({ "symbol": "SPY" }));
        assert!(o.key_metrics.liquidity.is_none());
    }

    #[test]
    fn degenerate_row_gets_sentinel_and_note() {
        let o = opts(json!({ "short_strike": 500.0 }));
        assert_eq!(o.symbol, "N/A");
        assert!(o.notes.iter().any(|n| n.contains("missing symbol")));
    }

    #[test]
    fn canonical_strategy_aliases() {
        assert_eq!(canonical_strategy("put_credit_spread"), "credit_spread");
        assert_eq!(canonical_strategy("Bull_Put_Spread"), "credit_spread");
        assert_eq!(canonical_strategy("reverse_iron_condor"), "iron_condor");
        assert_eq!(canonical_strategy("long_call_butterfly"), "butterfly");
        assert_eq!(canonical_strategy("double_calendar"), "calendar");
        assert_eq!(canonical_strategy("covered_call"), "income");
        assert_eq!(canonical_strategy("stock"), "stock");
    }

    #[test]
    fn trade_key_format_and_strike_rendering() {
        let raw = json!({
            "symbol": "spy",
            "expiration": "2026-09-18",
            "short_strike": 500.0,
            "long_strike": 497.5,
            "dte": 45
        });
        let o = opts(raw);
        assert_eq!(
            o.trade_key,
            "SPY|2026-09-18|credit_spread|500|497.5|45"
        );
    }

    #[test]
    fn trade_key_uses_na_sentinels() {
        let o = opts(json!({ "symbol": "SPY" }));
        assert_eq!(o.trade_key, "SPY|NA|credit_spread|NA|NA|NA");
    }

    #[test]
    fn trade_key_stable_through_renormalization() {
        let raw = json!({
            "symbol": "IWM",
            "strategy_id": "iron_condor",
            "expiration": "2026-08-21",
            "short_strike": 220.0,
            "dte": 20,
            "computed": { "pop": 0.7 }
        });
        let first = normalize(&raw, "iron_condor", "iron_condor", SourceType::Options);
        let second = normalize(
            &first.trade,
            "iron_condor",
            "iron_condor",
            SourceType::Options,
        );
        assert_eq!(first.trade_key, second.trade_key);
    }

    #[test]
    fn iv_rv_flag_derived_from_ratio() {
        let rich = opts(json!({ "symbol": "SPY", "iv_rv_ratio": 1.4 }));
        assert_eq!(rich.key_metrics.iv_rv_flag, Some(IvRvFlag::Rich));
        let cheap = opts(json!({ "symbol": "SPY", "iv_rv_ratio": 0.6 }));
        assert_eq!(cheap.key_metrics.iv_rv_flag, Some(IvRvFlag::Cheap));
        let balanced = opts(json!({ "symbol": "SPY", "iv_rv_ratio": 1.0 }));
        assert_eq!(balanced.key_metrics.iv_rv_flag, Some(IvRvFlag::Balanced));
    }

    #[test]
    fn explicit_iv_rv_flag_wins_over_ratio() {
        let o = opts(json!({ "symbol": "SPY", "iv_rv_ratio": 1.4, "iv_rv_flag": "cheap" }));
        assert_eq!(o.key_metrics.iv_rv_flag, Some(IvRvFlag::Cheap));
    }

    #[test]
    fn model_note_parsed_from_payload() {
        let o = opts(json!({
            "symbol": "SPY",
            "model": { "status": "ok", "recommendation": "ACCEPT", "confidence": 0.82, "summary": "solid" }
        }));
        let m = o.model.unwrap();
        assert_eq!(m.recommendation.as_deref(), Some("ACCEPT"));
        assert_eq!(m.confidence, Some(0.82));
    }
}
