//! Full-app refresh pipeline: ordered phases with per-phase timeout and
//! continue-vs-stop policy.
//!
//! A critical phase failure stops the pipeline; an optional failure logs a
//! warning and continues; a non-critical, non-optional failure continues but
//! counts toward the run's warnings. `stop()` cancels the current phase's
//! context and refuses further phases. Run state:
//! `Idle → Running → (Stopping) → Done{success|failed|stopped}`.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::HomeCache;
use crate::error::ProviderError;
use crate::limiter::RateLimiter;
use crate::orchestrator::{Orchestrator, SuiteOptions};
use crate::playbook;
use crate::provider::{MarketProvider, ProviderKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    HomeDashboard,
    BrokerPositions,
    BrokerOrders,
    BrokerAccount,
    ScannerSuite,
    RegimeRefresh,
    SignalsRefresh,
    SourceHealthRefresh,
}

pub const PHASES: [Phase; 8] = [
    Phase::HomeDashboard,
    Phase::BrokerPositions,
    Phase::BrokerOrders,
    Phase::BrokerAccount,
    Phase::ScannerSuite,
    Phase::RegimeRefresh,
    Phase::SignalsRefresh,
    Phase::SourceHealthRefresh,
];

impl Phase {
    pub fn id(self) -> &'static str {
        match self {
            Phase::HomeDashboard => "home_dashboard",
            Phase::BrokerPositions => "broker_positions",
            Phase::BrokerOrders => "broker_orders",
            Phase::BrokerAccount => "broker_account",
            Phase::ScannerSuite => "scanner_suite",
            Phase::RegimeRefresh => "regime_refresh",
            Phase::SignalsRefresh => "signals_refresh",
            Phase::SourceHealthRefresh => "source_health_refresh",
        }
    }

    /// Per-phase execution policy.
    pub fn policy(self) -> PhasePolicy {
        match self {
            Phase::HomeDashboard => PhasePolicy {
                timeout: Duration::from_secs(120),
                critical: true,
                optional: false,
            },
            Phase::BrokerPositions | Phase::BrokerOrders | Phase::BrokerAccount => PhasePolicy {
                timeout: Duration::from_secs(30),
                critical: false,
                optional: true,
            },
            Phase::ScannerSuite => PhasePolicy {
                timeout: Duration::from_secs(300),
                critical: false,
                optional: false,
            },
            Phase::RegimeRefresh | Phase::SignalsRefresh | Phase::SourceHealthRefresh => {
                PhasePolicy {
                    timeout: Duration::from_secs(60),
                    critical: false,
                    optional: false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhasePolicy {
    pub timeout: Duration,
    pub critical: bool,
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Done(RunOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub id: &'static str,
    pub ok: bool,
    pub error: Option<String>,
    pub warning: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub outcome: RunOutcome,
    pub phases: Vec<PhaseReport>,
    pub warnings: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct RefreshPipeline {
    provider: Arc<dyn MarketProvider>,
    limiter: Arc<RateLimiter>,
    cache: Arc<HomeCache>,
    orchestrator: Arc<Orchestrator>,
    state: Mutex<RunState>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RefreshPipeline {
    pub fn new(
        provider: Arc<dyn MarketProvider>,
        limiter: Arc<RateLimiter>,
        cache: Arc<HomeCache>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            provider,
            limiter,
            cache,
            orchestrator,
            state: Mutex::new(RunState::Idle),
            cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().expect("pipeline state")
    }

    /// Request cooperative cancellation of the running pipeline. No-op when
    /// nothing is running.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("pipeline state");
        if *state == RunState::Running {
            *state = RunState::Stopping;
            if let Some(token) = self.cancel.lock().expect("pipeline cancel").as_ref() {
                token.cancel();
            }
            tracing::info!("refresh pipeline stop requested");
        }
    }

    /// Run all phases in order. Errors only when a run is already active.
    pub async fn run(&self) -> anyhow::Result<PipelineReport> {
        {
            let mut state = self.state.lock().expect("pipeline state");
            if matches!(*state, RunState::Running | RunState::Stopping) {
                anyhow::bail!("refresh pipeline already running");
            }
            *state = RunState::Running;
        }
        let token = CancellationToken::new();
        *self.cancel.lock().expect("pipeline cancel") = Some(token.clone());

        let started = Instant::now();
        let mut phases: Vec<PhaseReport> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut warnings = 0usize;
        let mut outcome = RunOutcome::Success;

        for phase in PHASES {
            if token.is_cancelled() {
                outcome = RunOutcome::Stopped;
                break;
            }

            let policy = phase.policy();
            let phase_started = Instant::now();
            let result = tokio::time::timeout(policy.timeout, self.run_phase(phase, &token))
                .await
                .map_err(|_| ProviderError::Timeout(policy.timeout))
                .and_then(|r| r);
            let duration_ms = phase_started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    tracing::debug!(phase = phase.id(), duration_ms, "pipeline phase ok");
                    phases.push(PhaseReport {
                        id: phase.id(),
                        ok: true,
                        error: None,
                        warning: false,
                        duration_ms,
                    });
                }
                Err(ProviderError::Cancelled) => {
                    phases.push(PhaseReport {
                        id: phase.id(),
                        ok: false,
                        error: Some("cancelled".to_string()),
                        warning: false,
                        duration_ms,
                    });
                    outcome = RunOutcome::Stopped;
                    break;
                }
                Err(e) => {
                    let message = format!("{}: {e}", phase.id());
                    phases.push(PhaseReport {
                        id: phase.id(),
                        ok: false,
                        error: Some(message.clone()),
                        warning: !policy.critical,
                        duration_ms,
                    });
                    if policy.critical {
                        tracing::error!(phase = phase.id(), "critical pipeline phase failed: {e}");
                        errors.push(message);
                        outcome = RunOutcome::Failed;
                        break;
                    }
                    if policy.optional {
                        tracing::warn!(phase = phase.id(), "optional pipeline phase failed: {e}");
                    } else {
                        tracing::warn!(phase = phase.id(), "pipeline phase failed: {e}");
                        errors.push(message);
                    }
                    warnings += 1;
                }
            }
        }

        if token.is_cancelled() && outcome == RunOutcome::Success {
            outcome = RunOutcome::Stopped;
        }

        {
            let mut state = self.state.lock().expect("pipeline state");
            *state = RunState::Done(outcome);
        }
        *self.cancel.lock().expect("pipeline cancel") = None;

        let report = PipelineReport {
            outcome,
            phases,
            warnings,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(outcome = ?report.outcome, warnings = report.warnings,
            duration_ms = report.duration_ms, "refresh pipeline finished");
        Ok(report)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        match phase {
            Phase::HomeDashboard => {
                self.cache.refresh_now(true).await;
                Ok(())
            }
            Phase::BrokerPositions => {
                let value = self
                    .broker_call(cancel, "broker_positions", || {
                        let p = self.provider.clone();
                        async move { p.get_active_trades().await }
                    })
                    .await?;
                self.cache.update(|data, _| data.active_trades = Some(value));
                Ok(())
            }
            Phase::BrokerOrders => {
                let value = self
                    .broker_call(cancel, "broker_orders", || {
                        let p = self.provider.clone();
                        async move { p.get_broker_orders().await }
                    })
                    .await?;
                self.cache.update(|data, _| data.broker_orders = Some(value));
                Ok(())
            }
            Phase::BrokerAccount => {
                let value = self
                    .broker_call(cancel, "broker_account", || {
                        let p = self.provider.clone();
                        async move { p.get_broker_account().await }
                    })
                    .await?;
                self.cache.update(|data, _| data.broker_account = Some(value));
                Ok(())
            }
            Phase::ScannerSuite => {
                let suite = self
                    .orchestrator
                    .run_scanner_suite(&SuiteOptions::default(), cancel, |_| {})
                    .await;
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                let suite_errors = suite.errors.clone();
                let partial = suite.partial;
                self.cache.update(move |data, meta| {
                    data.opportunities = playbook::rank(
                        &suite.opportunities,
                        data.playbook.as_ref(),
                        data.regime.as_ref(),
                    );
                    for err in &suite_errors {
                        meta.push_error(format!("scanner: {err}"));
                    }
                    if partial {
                        meta.partial = true;
                    }
                });
                Ok(())
            }
            Phase::RegimeRefresh => {
                let regime = self
                    .limiter
                    .run_step(ProviderKind::Finnhub, "regime_refresh", cancel, || {
                        let p = self.provider.clone();
                        async move { p.get_regime().await }
                    })
                    .await?
                    .value;
                self.cache.update(|data, _| data.regime = Some(regime));
                Ok(())
            }
            Phase::SignalsRefresh => {
                let signals = self
                    .limiter
                    .run_step(ProviderKind::Yahoo, "signals_refresh", cancel, || {
                        let p = self.provider.clone();
                        async move { p.get_signals().await }
                    })
                    .await?
                    .value;
                self.cache.update(|data, _| data.signals = Some(signals));
                Ok(())
            }
            Phase::SourceHealthRefresh => {
                let health = self
                    .limiter
                    .run_step(ProviderKind::Fred, "source_health_refresh", cancel, || {
                        let p = self.provider.clone();
                        async move { p.get_source_health().await }
                    })
                    .await?
                    .value;
                self.cache.update(|data, _| data.source_health = Some(health));
                Ok(())
            }
        }
    }

    async fn broker_call<F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        step: F,
    ) -> Result<serde_json::Value, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value, ProviderError>>,
    {
        Ok(self
            .limiter
            .run_step(ProviderKind::Tradier, label, cancel, step)
            .await?
            .value)
    }
}
