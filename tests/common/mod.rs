#![allow(dead_code)]

//! Scripted mock provider shared by the integration suites.
//!
//! Every capability has a response queue; when a queue is empty the mock
//! falls back to a canned success, or to a persistent per-route failure
//! installed with `fail_route` / `fail_field`. All calls are appended to a
//! log so tests can assert on ordering and fan-out counts.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use optscan::error::ProviderError;
use optscan::provider::{
    GenerateParams, GeneratedReport, MarketProvider, ModelAnalyzer, ScanPayload,
};
use optscan::snapshot::{
    ComponentScore, ModelEvaluation, PlaybookLanes, PlaybookReport, Recommendation,
    RegimeComponents, RegimeLabel, RegimeReport, SourceStatus, SuggestedPlaybook,
};

type ScanResult = Result<ScanPayload, ProviderError>;

#[derive(Default)]
pub struct MockProvider {
    pub calls: Mutex<Vec<String>>,
    stock_queue: Mutex<VecDeque<ScanResult>>,
    strategy_queues: Mutex<HashMap<String, VecDeque<ScanResult>>>,
    generate_queue: Mutex<VecDeque<Result<GeneratedReport, ProviderError>>>,
    regime_queue: Mutex<VecDeque<Result<RegimeReport, ProviderError>>>,
    playbook_queue: Mutex<VecDeque<Result<PlaybookReport, ProviderError>>>,
    /// Routes that fail persistently once their queue is drained.
    failing_routes: Mutex<HashMap<String, ProviderError>>,
    /// Dashboard fields (regime/signals/...) that fail persistently.
    failing_fields: Mutex<HashMap<String, ProviderError>>,
    /// Artificial latencies by call name, for timeout/cancellation tests.
    delays: Mutex<HashMap<String, std::time::Duration>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    pub fn push_stock(&self, result: ScanResult) {
        self.stock_queue.lock().unwrap().push_back(result);
    }

    pub fn push_strategy(&self, route: &str, result: ScanResult) {
        self.strategy_queues
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn push_generate(&self, result: Result<GeneratedReport, ProviderError>) {
        self.generate_queue.lock().unwrap().push_back(result);
    }

    pub fn push_regime(&self, result: Result<RegimeReport, ProviderError>) {
        self.regime_queue.lock().unwrap().push_back(result);
    }

    pub fn push_playbook(&self, result: Result<PlaybookReport, ProviderError>) {
        self.playbook_queue.lock().unwrap().push_back(result);
    }

    /// Make a scanner route fail persistently (after its queue drains).
    pub fn fail_route(&self, route: &str, error: ProviderError) {
        self.failing_routes
            .lock()
            .unwrap()
            .insert(route.to_string(), error);
    }

    /// Make a dashboard field fail persistently.
    pub fn fail_field(&self, field: &str, error: ProviderError) {
        self.failing_fields
            .lock()
            .unwrap()
            .insert(field.to_string(), error);
    }

    pub fn delay_call(&self, name: &str, delay: std::time::Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    async fn maybe_delay(&self, name: &str) {
        let delay = self.delays.lock().unwrap().get(name).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn field_result(&self, field: &str) -> Result<Value, ProviderError> {
        if let Some(e) = self.failing_fields.lock().unwrap().get(field) {
            return Err(e.clone());
        }
        Ok(json!({ "mock": field }))
    }
}

// -- canned payload builders ------------------------------------------------

/// One raw options candidate the normalizer understands.
pub fn candidate(symbol: &str, strategy: &str, score: f64) -> Value {
    json!({
        "symbol": symbol,
        "strategy_id": strategy,
        "expiration": "2026-09-18",
        "short_strike": 500.0,
        "long_strike": 495.0,
        "dte": 48,
        "bid_ask_spread_pct": 0.05,
        "composite_score": score,
        "computed": {
            "pop": 0.72,
            "expected_value": 14.0,
            "max_profit": 100.0,
            "max_loss": 400.0
        }
    })
}

pub fn stock_candidate(symbol: &str, score: f64) -> Value {
    json!({
        "symbol": symbol,
        "strategy_id": "stock",
        "composite_score": score,
        "price": 512.5,
        "rsi14": 55.0,
        "trend": "up",
        "volume": 1500
    })
}

pub fn scan_payload(candidates: Vec<Value>) -> ScanPayload {
    ScanPayload {
        candidates,
        report_stats: json!({ "scanned": 100 }),
        notes: vec![],
        source_health: HashMap::new(),
    }
}

pub fn sample_regime() -> RegimeReport {
    let component = |score: f64| ComponentScore {
        score,
        signals: vec![],
    };
    RegimeReport {
        regime_label: RegimeLabel::Neutral,
        regime_score: 55.0,
        components: RegimeComponents {
            trend: component(60.0),
            volatility: component(50.0),
            breadth: component(55.0),
            rates: component(45.0),
            momentum: component(58.0),
        },
        suggested_playbook: SuggestedPlaybook::default(),
        source_health: HashMap::new(),
    }
}

pub fn sample_report() -> GeneratedReport {
    GeneratedReport {
        trades: vec![
            candidate("SPY", "put_credit_spread", 82.0),
            candidate("QQQ", "put_credit_spread", 74.0),
        ],
        report_stats: json!({ "scanned": 120, "kept": 2 }),
        diagnostics: json!({ "stage_counts": { "filtered": 118 } }),
    }
}

fn green(name: &str) -> (String, SourceStatus) {
    (
        name.to_string(),
        SourceStatus {
            status: optscan::snapshot::HealthColor::Green,
            message: "ok".to_string(),
            last_http: Some(200),
        },
    )
}

#[async_trait]
impl MarketProvider for MockProvider {
    async fn fetch_stock_scanner(
        &self,
        symbols: &[String],
        _cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError> {
        self.log("stock");
        if let Some(result) = self.stock_queue.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(e) = self.failing_routes.lock().unwrap().get("stock") {
            return Err(e.clone());
        }
        Ok(scan_payload(
            symbols
                .iter()
                .map(|s| stock_candidate(s, 60.0))
                .collect(),
        ))
    }

    async fn fetch_strategy_candidates(
        &self,
        route: &str,
        symbols: &[String],
        _cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError> {
        self.log(format!("scan:{route}"));
        self.maybe_delay(route).await;
        if let Some(result) = self
            .strategy_queues
            .lock()
            .unwrap()
            .get_mut(route)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        if let Some(e) = self.failing_routes.lock().unwrap().get(route) {
            return Err(e.clone());
        }
        let strategy = route.split('/').next().unwrap_or(route);
        Ok(scan_payload(
            symbols
                .iter()
                .map(|s| candidate(s, strategy, 70.0))
                .collect(),
        ))
    }

    async fn generate_strategy_report(
        &self,
        strategy_id: &str,
        _params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GeneratedReport, ProviderError> {
        self.log(format!("generate:{strategy_id}"));
        self.maybe_delay("generate").await;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if let Some(result) = self.generate_queue.lock().unwrap().pop_front() {
            return result;
        }
        Ok(sample_report())
    }

    async fn get_regime(&self) -> Result<RegimeReport, ProviderError> {
        self.log("regime");
        if let Some(result) = self.regime_queue.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(e) = self.failing_fields.lock().unwrap().get("regime") {
            return Err(e.clone());
        }
        Ok(sample_regime())
    }

    async fn get_playbook(&self) -> Result<PlaybookReport, ProviderError> {
        self.log("playbook");
        if let Some(result) = self.playbook_queue.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(e) = self.failing_fields.lock().unwrap().get("playbook") {
            return Err(e.clone());
        }
        Ok(PlaybookReport {
            regime: Some("NEUTRAL".to_string()),
            playbook: PlaybookLanes::default(),
        })
    }

    async fn get_signals(&self) -> Result<Value, ProviderError> {
        self.log("signals");
        self.field_result("signals")
    }

    async fn get_source_health(
        &self,
    ) -> Result<HashMap<String, SourceStatus>, ProviderError> {
        self.log("source_health");
        if let Some(e) = self.failing_fields.lock().unwrap().get("source_health") {
            return Err(e.clone());
        }
        Ok([green("finnhub"), green("tradier")].into_iter().collect())
    }

    async fn get_market_summary(&self) -> Result<Value, ProviderError> {
        self.log("market");
        self.field_result("market")
    }

    async fn get_sector_map(&self) -> Result<Value, ProviderError> {
        self.log("sectors");
        self.field_result("sectors")
    }

    async fn get_active_trades(&self) -> Result<Value, ProviderError> {
        self.log("active_trades");
        self.maybe_delay("active_trades").await;
        self.field_result("active_trades")
    }

    async fn get_broker_orders(&self) -> Result<Value, ProviderError> {
        self.log("broker_orders");
        self.maybe_delay("broker_orders").await;
        self.field_result("broker_orders")
    }

    async fn get_broker_account(&self) -> Result<Value, ProviderError> {
        self.log("broker_account");
        self.field_result("broker_account")
    }

    async fn list_reports(&self, strategy_id: &str) -> Result<Vec<String>, ProviderError> {
        self.log(format!("list_reports:{strategy_id}"));
        Err(ProviderError::NotImplemented(
            "mock hosts no upstream reports".to_string(),
        ))
    }

    async fn fetch_report(
        &self,
        strategy_id: &str,
        name: &str,
    ) -> Result<Value, ProviderError> {
        self.log(format!("fetch_report:{strategy_id}/{name}"));
        Err(ProviderError::NotImplemented(
            "mock hosts no upstream reports".to_string(),
        ))
    }
}

#[async_trait]
impl ModelAnalyzer for MockProvider {
    async fn analyze_trade(
        &self,
        _trade: &Value,
        _source: &str,
    ) -> Result<ModelEvaluation, ProviderError> {
        self.log("analyze");
        Ok(ModelEvaluation {
            recommendation: Recommendation::Accept,
            confidence: Some(0.82),
            summary: "Defined-risk setup with favorable pop".to_string(),
            risk_level: Some("moderate".to_string()),
            key_factors: vec!["pop 0.72".to_string(), "tight spread".to_string()],
        })
    }
}
