//! Provider capabilities: abstract access to market data and model inference.
//!
//! Upstream wire protocols are out of scope; implementations only have to map
//! their failures onto the `ProviderError` taxonomy and tag each call with a
//! `ProviderKind` so the rate limiter can pace by provider.

pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::snapshot::{ModelEvaluation, PlaybookReport, RegimeReport, SourceStatus};

/// Upstream providers the limiter paces independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Finnhub,
    Yahoo,
    Tradier,
    Fred,
    Model,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Finnhub => "finnhub",
            ProviderKind::Yahoo => "yahoo",
            ProviderKind::Tradier => "tradier",
            ProviderKind::Fred => "fred",
            ProviderKind::Model => "model",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameters for a strategy report generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub preset: Option<String>,
    pub symbols: Vec<String>,
    pub advanced_enabled: bool,
    /// Remaining `<filter_k>=<v>` pairs, passed through untouched.
    pub filters: HashMap<String, String>,
}

/// Raw result of one scanner invocation, before normalization.
#[derive(Debug, Clone, Default)]
pub struct ScanPayload {
    pub candidates: Vec<Value>,
    pub report_stats: Value,
    pub notes: Vec<String>,
    pub source_health: HashMap<String, SourceStatus>,
}

/// Content produced by a strategy report generation run. Persistence is the
/// report store's concern; the provider only yields the content.
#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub trades: Vec<Value>,
    pub report_stats: Value,
    pub diagnostics: Value,
}

/// Market-data capability set (C1). All methods classify failures into the
/// `ProviderError` taxonomy; long-running calls accept a cancellation token.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    async fn fetch_stock_scanner(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError>;

    /// Run one options scanner route over the symbol universe.
    async fn fetch_strategy_candidates(
        &self,
        route: &str,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError>;

    async fn generate_strategy_report(
        &self,
        strategy_id: &str,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GeneratedReport, ProviderError>;

    async fn get_regime(&self) -> Result<RegimeReport, ProviderError>;

    async fn get_playbook(&self) -> Result<PlaybookReport, ProviderError>;

    async fn get_signals(&self) -> Result<Value, ProviderError>;

    async fn get_source_health(&self) -> Result<HashMap<String, SourceStatus>, ProviderError>;

    /// SPY / VIX / macro summary block, pass-through.
    async fn get_market_summary(&self) -> Result<Value, ProviderError>;

    async fn get_sector_map(&self) -> Result<Value, ProviderError>;

    /// Broker-reported open positions.
    async fn get_active_trades(&self) -> Result<Value, ProviderError>;

    async fn get_broker_orders(&self) -> Result<Value, ProviderError>;

    async fn get_broker_account(&self) -> Result<Value, ProviderError>;

    /// Report listing for providers that host reports upstream; the local
    /// report store remains the system of record.
    async fn list_reports(&self, strategy_id: &str) -> Result<Vec<String>, ProviderError>;

    async fn fetch_report(&self, strategy_id: &str, name: &str)
        -> Result<Value, ProviderError>;
}

/// Model-analysis inference capability (separate service upstream).
#[async_trait]
pub trait ModelAnalyzer: Send + Sync {
    async fn analyze_trade(
        &self,
        trade: &Value,
        source: &str,
    ) -> Result<ModelEvaluation, ProviderError>;
}
