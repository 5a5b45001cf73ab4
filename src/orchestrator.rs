//! Scanner orchestrator: fan out the scanner suite, normalize and aggregate
//! candidates, and produce the base-sorted opportunity set.
//!
//! The stock scanner always runs first (providers pace it loosest), then the
//! options scanners in declaration order. Every step is guarded by the rate
//! limiter and a per-step timeout; optional steps fail soft, a failing
//! critical step aborts the remainder of the suite. No failure mode escapes
//! as a panic or error: the result always documents what happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::limiter::RateLimiter;
use crate::opportunity::{normalize, Opportunity, SourceType};
use crate::provider::MarketProvider;
use crate::scanners::{all_scanners, find_scanner, ScannerDef};
use crate::universe::SymbolUniverse;

/// Size of the headline opportunity list.
pub const TOP_N: usize = 9;

/// Filter strictness requested by the client; scales step timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLevel {
    Strict,
    Conservative,
    #[default]
    Balanced,
    Wide,
}

impl FilterLevel {
    pub fn timeout_factor(self) -> f64 {
        match self {
            FilterLevel::Strict => 0.8,
            FilterLevel::Conservative | FilterLevel::Balanced => 1.0,
            FilterLevel::Wide => 1.4,
        }
    }
}

/// Per-step outcome delivered to the `on_step` callback, exactly once per
/// executed step, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub label: String,
    pub ok: bool,
    pub error: Option<String>,
    pub trade_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMeta {
    pub ran_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scanners_run: usize,
    pub scanners_failed: usize,
    pub total_candidates: usize,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub opportunities: Vec<Opportunity>,
    pub all_candidates: Vec<Opportunity>,
    pub scan_meta: ScanMeta,
    pub errors: Vec<String>,
    /// True when any optional step failed while the suite still completed.
    pub partial: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Scanner ids to run; defaults to the full table.
    pub scanner_ids: Option<Vec<String>>,
    /// Symbols to scan; defaults to the symbol universe.
    pub symbols: Option<Vec<String>>,
    pub level: FilterLevel,
}

pub struct Orchestrator {
    provider: Arc<dyn MarketProvider>,
    limiter: Arc<RateLimiter>,
    universe: Arc<SymbolUniverse>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn MarketProvider>,
        limiter: Arc<RateLimiter>,
        universe: Arc<SymbolUniverse>,
    ) -> Self {
        Self {
            provider,
            limiter,
            universe,
        }
    }

    /// Run the scanner suite. Infallible by contract: failures are folded
    /// into `errors` / `partial` rather than propagated.
    pub async fn run_scanner_suite(
        &self,
        opts: &SuiteOptions,
        cancel: &CancellationToken,
        mut on_step: impl FnMut(StepReport),
    ) -> RunResult {
        let started = Instant::now();
        let ran_at = Utc::now();

        let mut errors: Vec<String> = Vec::new();
        let scanners = resolve_scanners(opts.scanner_ids.as_deref(), &mut errors);
        let symbols = opts
            .symbols
            .clone()
            .unwrap_or_else(|| self.universe.get());

        let mut all_candidates: Vec<Opportunity> = Vec::new();
        let mut scanners_run = 0usize;
        let mut scanners_failed = 0usize;
        let mut partial = false;

        if symbols.is_empty() {
            tracing::info!("scanner suite skipped: empty symbol universe");
            return RunResult {
                opportunities: vec![],
                all_candidates: vec![],
                scan_meta: ScanMeta {
                    ran_at,
                    duration_ms: started.elapsed().as_millis() as u64,
                    scanners_run: 0,
                    scanners_failed: 0,
                    total_candidates: 0,
                    top_n: TOP_N,
                },
                errors,
                partial: false,
            };
        }

        for def in &scanners {
            let budget = step_budget(def, opts.level);
            let outcome = self.run_step(def, &symbols, budget, cancel).await;
            scanners_run += 1;

            match outcome {
                Ok(candidates) => {
                    let count = candidates.len();
                    tracing::info!(scanner = def.id, candidates = count, "scanner step ok");
                    all_candidates.extend(candidates);
                    on_step(StepReport {
                        id: def.id.to_string(),
                        label: def.label.to_string(),
                        ok: true,
                        error: None,
                        trade_count: count,
                    });
                }
                Err(e) => {
                    scanners_failed += 1;
                    let message = format!("{}: {e}", def.label);
                    tracing::warn!(scanner = def.id, optional = def.optional,
                        "scanner step failed: {e}");
                    errors.push(message.clone());
                    on_step(StepReport {
                        id: def.id.to_string(),
                        label: def.label.to_string(),
                        ok: false,
                        error: Some(message),
                        trade_count: 0,
                    });
                    if def.optional {
                        partial = true;
                    } else {
                        // A critical scanner failed; the rest of the suite
                        // is not worth running on a broken base.
                        break;
                    }
                }
            }
        }

        sort_base(&mut all_candidates);
        let opportunities: Vec<Opportunity> =
            all_candidates.iter().take(TOP_N).cloned().collect();

        RunResult {
            opportunities,
            scan_meta: ScanMeta {
                ran_at,
                duration_ms: started.elapsed().as_millis() as u64,
                scanners_run,
                scanners_failed,
                total_candidates: all_candidates.len(),
                top_n: TOP_N,
            },
            all_candidates,
            errors,
            partial,
        }
    }

    /// One rate-limited, timeout-bounded scanner invocation, normalized.
    async fn run_step(
        &self,
        def: &ScannerDef,
        symbols: &[String],
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Opportunity>, ProviderError> {
        let provider = self.provider.clone();
        let step = self.limiter.run_step(def.provider, def.label, cancel, || {
            let provider = provider.clone();
            async move {
                match def.source_type {
                    SourceType::Stock => provider.fetch_stock_scanner(symbols, cancel).await,
                    SourceType::Options => {
                        provider
                            .fetch_strategy_candidates(def.route, symbols, cancel)
                            .await
                    }
                }
            }
        });

        let output = tokio::time::timeout(budget, step)
            .await
            .map_err(|_| ProviderError::Timeout(budget))??;

        let payload = output.value;
        Ok(payload
            .candidates
            .iter()
            .map(|raw| normalize(raw, def.id, def.strategy_id, def.source_type))
            .collect())
    }
}

/// Resolve requested ids against the table, stock scanner first. Unknown ids
/// are reported, not fatal.
fn resolve_scanners(ids: Option<&[String]>, errors: &mut Vec<String>) -> Vec<ScannerDef> {
    let mut defs: Vec<ScannerDef> = match ids {
        None => all_scanners(),
        Some(ids) => ids
            .iter()
            .filter_map(|id| {
                let found = find_scanner(id);
                if found.is_none() {
                    errors.push(format!("unknown scanner id: {id}"));
                }
                found
            })
            .collect(),
    };
    defs.sort_by_key(|d| match d.source_type {
        SourceType::Stock => 0,
        SourceType::Options => 1,
    });
    defs
}

fn step_budget(def: &ScannerDef, level: FilterLevel) -> Duration {
    def.timeout.mul_f64(level.timeout_factor())
}

/// Descending on value; entries without a value sort last.
pub(crate) fn desc_nulls_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Base ordering before playbook re-weighting: score, then liquidity, then
/// expected value.
pub fn sort_base(opportunities: &mut [Opportunity]) {
    opportunities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| desc_nulls_last(a.key_metrics.liquidity, b.key_metrics.liquidity))
            .then_with(|| desc_nulls_last(a.ev, b.ev))
    });
}
