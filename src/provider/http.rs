//! HTTP-backed provider: one upstream aggregator endpoint per capability,
//! with wire failures mapped onto the `ProviderError` taxonomy.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::{GenerateParams, GeneratedReport, MarketProvider, ModelAnalyzer, ScanPayload};
use crate::snapshot::{ModelEvaluation, PlaybookReport, RegimeReport, SourceStatus};

const TIMEOUT_SECS: u64 = 60;

pub struct HttpMarketProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMarketProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Option<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Create from environment. Returns `None` if `MARKET_API_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("MARKET_API_URL").ok()?;
        if base_url.is_empty() {
            return None;
        }
        Self::new(base_url, std::env::var("MARKET_API_KEY").ok())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Map a reqwest transport failure onto the taxonomy.
    fn transport_error(context: &str, e: &reqwest::Error) -> ProviderError {
        if e.is_timeout() || e.is_connect() {
            ProviderError::Transient(format!("{context}: {e}"))
        } else {
            ProviderError::Fatal(format!("{context}: {e}"))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let mut req = self.client.get(self.url(path)).query(query);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Self::transport_error(path, &e))?;

        if let Some(err) = ProviderError::from_status(resp.status().as_u16(), path) {
            return Err(err);
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("{path}: malformed response: {e}")))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ProviderError> {
        let mut req = self.client.post(self.url(path)).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Self::transport_error(path, &e))?;

        if let Some(err) = ProviderError::from_status(resp.status().as_u16(), path) {
            return Err(err);
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("{path}: malformed response: {e}")))
    }

    /// Race a request against cooperative cancellation.
    async fn cancellable<T>(
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::select! {
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            res = fut => res,
        }
    }

    fn parse_scan_payload(body: Value) -> ScanPayload {
        let candidates = body
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let notes = body
            .get("notes")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let source_health = body
            .get("source_health")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        ScanPayload {
            candidates,
            report_stats: body.get("report_stats").cloned().unwrap_or(Value::Null),
            notes,
            source_health,
        }
    }
}

#[async_trait]
impl MarketProvider for HttpMarketProvider {
    async fn fetch_stock_scanner(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError> {
        let query = [("symbols", symbols.join(","))];
        let body: Value =
            Self::cancellable(cancel, self.get_json("/scanner/stock", &query)).await?;
        Ok(Self::parse_scan_payload(body))
    }

    async fn fetch_strategy_candidates(
        &self,
        route: &str,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanPayload, ProviderError> {
        let path = format!("/scanners/{route}");
        let query = [("symbols", symbols.join(","))];
        let body: Value = Self::cancellable(cancel, self.get_json(&path, &query)).await?;
        Ok(Self::parse_scan_payload(body))
    }

    async fn generate_strategy_report(
        &self,
        strategy_id: &str,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<GeneratedReport, ProviderError> {
        let path = format!("/strategies/{strategy_id}/generate");
        let body = serde_json::json!({
            "preset": params.preset,
            "symbols": params.symbols,
            "advanced_enabled": params.advanced_enabled,
            "filters": params.filters,
        });
        let resp: Value = Self::cancellable(cancel, self.post_json(&path, &body)).await?;
        let trades = resp
            .get("trades")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(GeneratedReport {
            trades,
            report_stats: resp.get("report_stats").cloned().unwrap_or(Value::Null),
            diagnostics: resp.get("diagnostics").cloned().unwrap_or(Value::Null),
        })
    }

    async fn get_regime(&self) -> Result<RegimeReport, ProviderError> {
        self.get_json("/regime", &[]).await
    }

    async fn get_playbook(&self) -> Result<PlaybookReport, ProviderError> {
        self.get_json("/playbook", &[]).await
    }

    async fn get_signals(&self) -> Result<Value, ProviderError> {
        self.get_json("/signals", &[]).await
    }

    async fn get_source_health(&self) -> Result<HashMap<String, SourceStatus>, ProviderError> {
        self.get_json("/health/sources", &[]).await
    }

    async fn get_market_summary(&self) -> Result<Value, ProviderError> {
        self.get_json("/market/summary", &[]).await
    }

    async fn get_sector_map(&self) -> Result<Value, ProviderError> {
        self.get_json("/market/sectors", &[]).await
    }

    async fn get_active_trades(&self) -> Result<Value, ProviderError> {
        self.get_json("/broker/positions", &[]).await
    }

    async fn get_broker_orders(&self) -> Result<Value, ProviderError> {
        self.get_json("/broker/orders", &[]).await
    }

    async fn get_broker_account(&self) -> Result<Value, ProviderError> {
        self.get_json("/broker/account", &[]).await
    }

    async fn list_reports(&self, strategy_id: &str) -> Result<Vec<String>, ProviderError> {
        let path = format!("/strategies/{strategy_id}/reports");
        let body: Value = self.get_json(&path, &[]).await?;
        Ok(body
            .get("reports")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_report(
        &self,
        strategy_id: &str,
        name: &str,
    ) -> Result<Value, ProviderError> {
        let path = format!("/strategies/{strategy_id}/reports/{name}");
        self.get_json(&path, &[]).await
    }
}

#[async_trait]
impl ModelAnalyzer for HttpMarketProvider {
    async fn analyze_trade(
        &self,
        trade: &Value,
        source: &str,
    ) -> Result<ModelEvaluation, ProviderError> {
        let body = serde_json::json!({ "trade": trade, "source": source });
        let resp: Value = self.post_json("/model/analyze", &body).await?;
        let evaluation = resp
            .get("evaluated_trade")
            .and_then(|t| t.get("model_evaluation"))
            .or_else(|| resp.get("model_evaluation"))
            .cloned()
            .ok_or_else(|| {
                ProviderError::Fatal("/model/analyze: missing model_evaluation".to_string())
            })?;
        serde_json::from_value(evaluation)
            .map_err(|e| ProviderError::Fatal(format!("/model/analyze: malformed evaluation: {e}")))
    }
}
