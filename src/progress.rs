//! Report-generation progress stream.
//!
//! `spawn_generate` starts a producer task and hands back the receiving half
//! of a bounded channel. The producer emits staged `status` events, then
//! exactly one terminal event: `done` with the persisted filename, or
//! `error`. When the consumer drops the receiver (client disconnect), the
//! producer observes the closed channel, cancels the in-flight provider
//! call, and emits nothing further. A failed generation persists no report
//! file.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::limiter::RateLimiter;
use crate::provider::{GenerateParams, MarketProvider, ProviderKind};
use crate::reports::ReportStore;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Error {
        stage: String,
        error_type: String,
        error_message: String,
        trace_id: String,
        hint: Option<String>,
    },
    Completed {
        filename: Option<String>,
        message: String,
    },
    Status {
        stage: String,
        message: String,
    },
    Done {
        filename: Option<String>,
    },
}

impl ProgressEvent {
    /// SSE event name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Done { .. } => "done",
            ProgressEvent::Error { .. } => "error",
        }
    }

    /// The stream closes after the first terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Done { .. } | ProgressEvent::Error { .. }
        )
    }

    fn status(stage: &str, message: impl Into<String>) -> Self {
        ProgressEvent::Status {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

fn hint_for(err: &ProviderError) -> Option<String> {
    match err {
        ProviderError::Transient(_) => {
            Some("The upstream provider is rate limited or unavailable; retry shortly.".into())
        }
        ProviderError::NotImplemented(_) => {
            Some("This strategy has no generation route on the configured provider.".into())
        }
        ProviderError::Timeout(_) => {
            Some("Generation exceeded its time budget; narrow the symbol list or retry.".into())
        }
        ProviderError::Fatal(_) | ProviderError::Cancelled => None,
    }
}

/// Provider lane a generation run paces on; falls back to Tradier for
/// strategies outside the scanner table.
fn generation_lane(strategy_id: &str) -> ProviderKind {
    crate::scanners::all_scanners()
        .iter()
        .find(|s| s.strategy_id == strategy_id)
        .map_or(ProviderKind::Tradier, |s| s.provider)
}

/// Start a generation run. Events arrive on the returned receiver; dropping
/// it cancels the run.
pub fn spawn_generate(
    provider: Arc<dyn MarketProvider>,
    limiter: Arc<RateLimiter>,
    reports: Arc<ReportStore>,
    strategy_id: String,
    params: GenerateParams,
    budget: Duration,
) -> mpsc::Receiver<ProgressEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let trace_id = uuid::Uuid::new_v4().to_string();
        run_generate(
            &provider, &limiter, &reports, &strategy_id, &params, budget, &cancel, &trace_id, &tx,
        )
        .await;
    });

    rx
}

/// Send helper: a failed send means the client is gone, which ends the run.
async fn emit(tx: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[allow(clippy::too_many_arguments)]
async fn run_generate(
    provider: &Arc<dyn MarketProvider>,
    limiter: &RateLimiter,
    reports: &ReportStore,
    strategy_id: &str,
    params: &GenerateParams,
    budget: Duration,
    cancel: &CancellationToken,
    trace_id: &str,
    tx: &mpsc::Sender<ProgressEvent>,
) {
    if !emit(
        tx,
        ProgressEvent::status("queued", format!("Queued {strategy_id} report generation")),
    )
    .await
    {
        return;
    }

    let symbols_note = if params.symbols.is_empty() {
        "universe symbols".to_string()
    } else {
        params.symbols.join(", ")
    };
    if !emit(
        tx,
        ProgressEvent::status("scanning", format!("Scanning {symbols_note}")),
    )
    .await
    {
        return;
    }

    let lane = generation_lane(strategy_id);
    let step = tokio::time::timeout(
        budget,
        limiter.run_step(lane, "generate_report", cancel, || {
            let provider = provider.clone();
            async move {
                provider
                    .generate_strategy_report(strategy_id, params, cancel)
                    .await
            }
        }),
    );
    // Client disconnect (closed channel) cancels the in-flight call.
    let generated = tokio::select! {
        () = tx.closed() => {
            cancel.cancel();
            tracing::info!(strategy = strategy_id, trace_id, "client gone, generation cancelled");
            return;
        }
        result = step => result
            .map_err(|_| ProviderError::Timeout(budget))
            .and_then(|r| r.map(|out| out.value)),
    };

    let report = match generated {
        Ok(report) => report,
        Err(ProviderError::Cancelled) => {
            // Cancellation is silent by contract: the client is gone.
            tracing::info!(strategy = strategy_id, trace_id, "generation cancelled");
            return;
        }
        Err(e) => {
            tracing::warn!(strategy = strategy_id, trace_id, "generation failed: {e}");
            emit(
                tx,
                ProgressEvent::Error {
                    stage: "generating".to_string(),
                    error_type: e.kind().to_string(),
                    error_message: e.to_string(),
                    trace_id: trace_id.to_string(),
                    hint: hint_for(&e),
                },
            )
            .await;
            return;
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    if !emit(
        tx,
        ProgressEvent::status(
            "persisting",
            format!("Writing report with {} trades", report.trades.len()),
        ),
    )
    .await
    {
        return;
    }

    match reports.save_report(strategy_id, &report) {
        Ok(filename) => {
            if !emit(
                tx,
                ProgressEvent::Completed {
                    filename: Some(filename.clone()),
                    message: format!("Report complete: {} trades", report.trades.len()),
                },
            )
            .await
            {
                return;
            }
            emit(
                tx,
                ProgressEvent::Done {
                    filename: Some(filename),
                },
            )
            .await;
        }
        Err(e) => {
            tracing::warn!(strategy = strategy_id, trace_id, "report persist failed: {e}");
            emit(
                tx,
                ProgressEvent::Error {
                    stage: "persisting".to_string(),
                    error_type: "fatal".to_string(),
                    error_message: e.to_string(),
                    trace_id: trace_id.to_string(),
                    hint: None,
                },
            )
            .await;
        }
    }
}
