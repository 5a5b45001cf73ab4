//! Home snapshot cache: coalesced refresh with atomic snapshot publication.
//!
//! A non-forced refresh while another refresh is in flight joins the running
//! flight and resolves with the same snapshot value; a non-forced refresh
//! within the freshness window returns the cached snapshot untouched. Forced
//! refreshes cancel the running flight cooperatively and replace it.
//!
//! Field-level refresh failures never fail the refresh: the previous value of
//! that field is kept, the failure lands in `meta.errors`, and `meta.partial`
//! is set. The new snapshot is swapped in atomically at the very end.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::limiter::RateLimiter;
use crate::orchestrator::{Orchestrator, SuiteOptions};
use crate::playbook;
use crate::provider::{MarketProvider, ProviderKind};
use crate::snapshot::{Snapshot, SnapshotMeta};

type FlightFuture = Shared<BoxFuture<'static, Arc<Snapshot>>>;
type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct Flight {
    future: FlightFuture,
    cancel: CancellationToken,
    id: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    pub force: bool,
    /// Skip the scanner suite and only refresh dashboard fields.
    pub home_only: bool,
}

pub struct HomeCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    provider: Arc<dyn MarketProvider>,
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<Orchestrator>,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    last_refresh_started: Mutex<Option<Instant>>,
    inflight: Mutex<Option<Flight>>,
    next_flight_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

impl HomeCache {
    pub fn new(
        provider: Arc<dyn MarketProvider>,
        limiter: Arc<RateLimiter>,
        orchestrator: Arc<Orchestrator>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                provider,
                limiter,
                orchestrator,
                refresh_interval,
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                last_refresh_started: Mutex::new(None),
                inflight: Mutex::new(None),
                next_flight_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().expect("snapshot lock").clone()
    }

    /// Replace the published snapshot and notify subscribers.
    pub fn set_snapshot(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.inner.publish(snapshot)
    }

    /// Clone-mutate-republish helper for pipeline phases that patch single
    /// fields without a full refresh.
    pub fn update(
        &self,
        f: impl FnOnce(&mut crate::snapshot::SnapshotData, &mut SnapshotMeta),
    ) -> Arc<Snapshot> {
        let mut next = (*self.get_snapshot()).clone();
        f(&mut next.data, &mut next.meta);
        self.inner.publish(next)
    }

    pub fn subscribe(&self, listener: impl Fn(&Snapshot) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("listeners lock")
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.inner.listeners.lock().expect("listeners lock");
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Push the cached snapshot to subscribers without refreshing. Returns
    /// false when nothing has ever been loaded or nobody is listening.
    pub fn render_cached_immediately(&self) -> bool {
        let snapshot = self.get_snapshot();
        if snapshot.meta.last_success_at.is_none() && snapshot.data.opportunities.is_empty() {
            return false;
        }
        let listeners = self.inner.listeners_snapshot();
        if listeners.is_empty() {
            return false;
        }
        notify(&listeners, &snapshot);
        true
    }

    /// Coalescing refresh. See module docs for the force/freshness contract.
    pub async fn refresh_silent(&self, opts: RefreshOptions) -> Arc<Snapshot> {
        let flight = {
            let mut slot = self.inner.inflight.lock().expect("inflight lock");
            if !opts.force {
                if let Some(f) = slot.as_ref() {
                    f.future.clone()
                } else if self.inner.is_fresh() {
                    return self.get_snapshot();
                } else {
                    install_flight(&self.inner, &mut slot, opts.home_only)
                }
            } else {
                install_flight(&self.inner, &mut slot, opts.home_only)
            }
        };
        flight.await
    }

    /// Always start a new refresh, cancelling the running one cooperatively.
    pub async fn refresh_now(&self, home_only: bool) -> Arc<Snapshot> {
        self.refresh_silent(RefreshOptions {
            force: true,
            home_only,
        })
        .await
    }
}

impl CacheInner {
    fn is_fresh(&self) -> bool {
        let started = self.last_refresh_started.lock().expect("refresh clock");
        match *started {
            Some(at) => at.elapsed() < self.refresh_interval,
            None => false,
        }
    }

    fn listeners_snapshot(&self) -> Vec<Listener> {
        self.listeners
            .lock()
            .expect("listeners lock")
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let published = Arc::new(snapshot);
        *self.snapshot.write().expect("snapshot lock") = published.clone();
        notify(&self.listeners_snapshot(), &published);
        published
    }
}

/// Cancel any running flight and install a new one. Caller holds the
/// inflight lock.
fn install_flight(
    inner: &Arc<CacheInner>,
    slot: &mut Option<Flight>,
    home_only: bool,
) -> FlightFuture {
    if let Some(old) = slot.take() {
        tracing::info!("cancelling in-flight refresh, starting a new one");
        old.cancel.cancel();
    }

    let id = inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let future: FlightFuture = {
        let inner = inner.clone();
        let cancel = cancel.clone();
        async move {
            let snapshot = inner.do_refresh(home_only, &cancel).await;
            let mut slot = inner.inflight.lock().expect("inflight lock");
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
            snapshot
        }
        .boxed()
        .shared()
    };

    // Detached driver: the refresh completes even if every caller drops.
    tokio::spawn({
        let future = future.clone();
        async move {
            future.await;
        }
    });

    *slot = Some(Flight {
        future: future.clone(),
        cancel,
        id,
    });
    future
}

impl CacheInner {
    /// One full refresh pass. Never fails; a cancelled pass republishes the
    /// previous snapshot unchanged.
    async fn do_refresh(&self, home_only: bool, cancel: &CancellationToken) -> Arc<Snapshot> {
        *self.last_refresh_started.lock().expect("refresh clock") = Some(Instant::now());

        let previous = self.snapshot.read().expect("snapshot lock").clone();
        let mut data = previous.data.clone();
        let mut meta = SnapshotMeta {
            last_success_at: previous.meta.last_success_at,
            errors: Vec::new(),
            partial: false,
        };

        // Fan out dashboard fields; same-provider calls serialize in their
        // limiter lane, different providers proceed in parallel.
        let (regime, playbook_report, signals, source_health, market, sectors, active_trades) = tokio::join!(
            self.field(ProviderKind::Finnhub, "regime", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_regime().await }
                }
            }),
            self.field(ProviderKind::Finnhub, "playbook", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_playbook().await }
                }
            }),
            self.field(ProviderKind::Yahoo, "signals", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_signals().await }
                }
            }),
            self.field(ProviderKind::Fred, "source_health", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_source_health().await }
                }
            }),
            self.field(ProviderKind::Yahoo, "market", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_market_summary().await }
                }
            }),
            self.field(ProviderKind::Finnhub, "sectors", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_sector_map().await }
                }
            }),
            self.field(ProviderKind::Tradier, "active_trades", cancel, {
                let p = self.provider.clone();
                move || {
                    let p = p.clone();
                    async move { p.get_active_trades().await }
                }
            }),
        );

        apply_field(&mut data.regime, regime, "regime", &mut meta);
        apply_field(&mut data.playbook, playbook_report, "playbook", &mut meta);
        apply_field(&mut data.signals, signals, "signals", &mut meta);
        apply_field(&mut data.market, market, "market", &mut meta);
        apply_field(&mut data.sectors, sectors, "sectors", &mut meta);
        apply_field(&mut data.active_trades, active_trades, "active_trades", &mut meta);
        apply_field(&mut data.source_health, source_health, "source_health", &mut meta);

        // Risk posture is derived from the regime rather than fetched.
        if let Some(regime) = &data.regime {
            data.risk = Some(serde_json::json!({
                "posture": regime.regime_label,
                "score": regime.regime_score,
            }));
        }

        if !home_only && !cancel.is_cancelled() {
            let suite = self
                .orchestrator
                .run_scanner_suite(&SuiteOptions::default(), cancel, |_| {})
                .await;
            for err in &suite.errors {
                meta.push_error(format!("scanner: {err}"));
            }
            if suite.partial || !suite.errors.is_empty() {
                meta.partial = true;
            }
            data.opportunities = playbook::rank(
                &suite.opportunities,
                data.playbook.as_ref(),
                data.regime.as_ref(),
            );
        }

        if cancel.is_cancelled() {
            tracing::info!("refresh cancelled; keeping previous snapshot");
            return previous;
        }

        if meta.errors.is_empty() {
            meta.last_success_at = Some(chrono::Utc::now());
        } else {
            tracing::warn!(errors = meta.errors.len(), partial = meta.partial,
                "refresh completed with errors");
        }

        self.publish(Snapshot { data, meta })
    }

    /// One rate-limited field fetch.
    async fn field<T, F, Fut>(
        &self,
        provider: ProviderKind,
        label: &str,
        cancel: &CancellationToken,
        step: F,
    ) -> Result<T, crate::error::ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::ProviderError>>,
    {
        self.limiter
            .run_step(provider, label, cancel, step)
            .await
            .map(|out| out.value)
    }
}

/// Keep the previous value on failure; record the error and mark partial.
fn apply_field<T>(
    slot: &mut Option<T>,
    result: Result<T, crate::error::ProviderError>,
    label: &str,
    meta: &mut SnapshotMeta,
) {
    match result {
        Ok(value) => *slot = Some(value),
        Err(e) => {
            meta.push_error(format!("{label}: {e}"));
            meta.partial = true;
        }
    }
}

fn notify(listeners: &[Listener], snapshot: &Snapshot) {
    for listener in listeners {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener(snapshot);
        }));
        if result.is_err() {
            tracing::warn!("snapshot listener panicked; ignoring");
        }
    }
}
