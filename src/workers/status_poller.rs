//! Client-side confirmation poller for a single PIX charge.
//!
//! The poller asks the payments backend for the charge status until the
//! charge settles, fails, expires or the consumer stops it. Transport
//! failures are absorbed into an exponential backoff and reported only to the
//! injected [`PollObserver`]; the [`StatusListener`] sees successful checks
//! and, once, the completion.
//!
//! Scheduling is a single owned timer task. Every cycle ends by computing the
//! next interval and re-arming the timer in one step under the state lock, so
//! the next delay always reflects the outcome that was just applied.

use crate::config::{ConfigError, PollerConfig};
use crate::logging::mask_charge_id;
use crate::payments::error::{GatewayError, StoreError};
use crate::payments::gateway::{check_status, PaymentGateway};
use crate::payments::store::PaymentRecordStore;
use crate::payments::types::{ChargeRef, ChargeStatus, PaymentRecord, StatusResult};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Consumer-facing hooks
// ---------------------------------------------------------------------------

/// Presentation-side callbacks.
pub trait StatusListener: Send + Sync {
    /// Fired after every successful check, terminal or not.
    fn on_status_change(&self, _status: &ChargeStatus) {}

    /// Fired exactly once, after the record store was written.
    fn on_completed(&self) {}
}

pub struct NoopListener;

impl StatusListener for NoopListener {}

/// Operational hook. Polling failures never reach the listener, so this is
/// where they become visible.
pub trait PollObserver: Send + Sync {
    fn on_check_failed(
        &self,
        charge_ref: &ChargeRef,
        error: &GatewayError,
        consecutive_failures: u32,
        next_interval: Duration,
    );

    fn on_check_skipped(&self, _charge_ref: &ChargeRef, _reason: SkipReason) {}

    fn on_stopped(&self, _charge_ref: &ChargeRef, _reason: &StopReason) {}

    fn on_store_failed(&self, _charge_ref: &ChargeRef, _error: &StoreError) {}
}

/// Default observer: structured `tracing` events.
pub struct TracingObserver;

impl PollObserver for TracingObserver {
    fn on_check_failed(
        &self,
        charge_ref: &ChargeRef,
        error: &GatewayError,
        consecutive_failures: u32,
        next_interval: Duration,
    ) {
        warn!(
            charge = %mask_charge_id(charge_ref.id()),
            error_kind = error.kind(),
            error = %error,
            consecutive_failures,
            next_interval_ms = next_interval.as_millis() as u64,
            "PIX status check failed"
        );
    }

    fn on_check_skipped(&self, charge_ref: &ChargeRef, reason: SkipReason) {
        debug!(
            charge = %mask_charge_id(charge_ref.id()),
            reason = ?reason,
            "PIX status check skipped"
        );
    }

    fn on_stopped(&self, charge_ref: &ChargeRef, reason: &StopReason) {
        info!(
            charge = %mask_charge_id(charge_ref.id()),
            reason = %reason,
            "PIX status poller stopped"
        );
    }

    fn on_store_failed(&self, charge_ref: &ChargeRef, error: &StoreError) {
        error!(
            charge = %mask_charge_id(charge_ref.id()),
            error = %error,
            "failed to persist settled PIX payment"
        );
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Terminal success observed; the completion signal was fired.
    Completed,
    /// The backend reported a terminal non-success status.
    TerminalFailure(ChargeStatus),
    /// The charge expiry passed without a terminal status.
    Expired,
    /// Stopped by the consumer.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::TerminalFailure(status) => write!(f, "terminal_failure({})", status),
            StopReason::Expired => write!(f, "expired"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Running,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRunning,
    InFlight,
    TooSoon,
}

/// Result of one check cycle, mostly useful to manual triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Checked(ChargeStatus),
    Failed,
    Skipped(SkipReason),
    /// The response arrived after the poller stopped and was dropped.
    Discarded,
}

/// Point-in-time copy of the poll state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    pub phase: PollPhase,
    pub current_interval: Duration,
    pub consecutive_failures: u32,
    pub last_status: Option<ChargeStatus>,
    pub has_pending_timer: bool,
    pub in_flight: bool,
}

struct PollState {
    phase: PollPhase,
    current_interval: Duration,
    consecutive_failures: u32,
    last_checked_at: Option<Instant>,
    last_status: Option<ChargeStatus>,
    expires_deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    in_flight: bool,
    cycle_seq: u64,
}

// ---------------------------------------------------------------------------
// Interval policy
// ---------------------------------------------------------------------------

/// `pending_interval * growth_factor ^ failures`, clamped to the configured bounds.
pub fn backoff_interval(config: &PollerConfig, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.min(64) as i32;
    let secs = config.pending_interval.as_secs_f64() * config.growth_factor.powi(exponent);
    let raw = if secs.is_finite() && secs < config.max_interval.as_secs_f64() {
        Duration::from_secs_f64(secs)
    } else {
        config.max_interval
    };
    config.clamp(raw)
}

/// Interval after a successful check. Statuses other than pending and
/// processing keep the current interval.
pub fn interval_for_status(
    config: &PollerConfig,
    status: &ChargeStatus,
    current: Duration,
) -> Duration {
    let next = match status {
        ChargeStatus::Processing => config.processing_interval,
        ChargeStatus::Pending => config.pending_interval,
        _ => current,
    };
    config.clamp(next)
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub struct PaymentStatusPollerBuilder {
    charge_ref: ChargeRef,
    expires_at: Option<DateTime<Utc>>,
    config: PollerConfig,
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn PaymentRecordStore>,
    listener: Arc<dyn StatusListener>,
    observer: Arc<dyn PollObserver>,
}

impl PaymentStatusPollerBuilder {
    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PollObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<PaymentStatusPoller, ConfigError> {
        self.config.validate()?;
        if self.charge_ref.id().trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "charge reference id cannot be empty".to_string(),
            ));
        }

        let poll_id = Uuid::new_v4();
        let span = info_span!(
            "pix_poller",
            poll_id = %poll_id,
            charge = %mask_charge_id(self.charge_ref.id()),
            lookup = self.charge_ref.kind(),
            gateway = self.gateway.name(),
        );
        let (phase_tx, _) = watch::channel(PollPhase::Idle);

        let state = PollState {
            phase: PollPhase::Idle,
            current_interval: self.config.clamp(self.config.pending_interval),
            consecutive_failures: 0,
            last_checked_at: None,
            last_status: None,
            expires_deadline: None,
            timer: None,
            timer_seq: 0,
            in_flight: false,
            cycle_seq: 0,
        };

        Ok(PaymentStatusPoller {
            inner: Arc::new(Inner {
                poll_id,
                charge_ref: self.charge_ref,
                expires_at: self.expires_at,
                config: self.config,
                gateway: self.gateway,
                store: self.store,
                listener: self.listener,
                observer: self.observer,
                state: Mutex::new(state),
                phase_tx,
                span,
            }),
        })
    }
}

/// Polls one PIX charge until it settles, fails, expires or is stopped.
///
/// Must be started from within a Tokio runtime. Dropping the poller stops it.
pub struct PaymentStatusPoller {
    inner: Arc<Inner>,
}

struct Inner {
    poll_id: Uuid,
    charge_ref: ChargeRef,
    expires_at: Option<DateTime<Utc>>,
    config: PollerConfig,
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn PaymentRecordStore>,
    listener: Arc<dyn StatusListener>,
    observer: Arc<dyn PollObserver>,
    state: Mutex<PollState>,
    phase_tx: watch::Sender<PollPhase>,
    span: Span,
}

impl PaymentStatusPoller {
    pub fn builder(
        charge_ref: ChargeRef,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn PaymentRecordStore>,
    ) -> PaymentStatusPollerBuilder {
        PaymentStatusPollerBuilder {
            charge_ref,
            expires_at: None,
            config: PollerConfig::default(),
            gateway,
            store,
            listener: Arc::new(NoopListener),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn poll_id(&self) -> Uuid {
        self.inner.poll_id
    }

    pub fn charge_ref(&self) -> &ChargeRef {
        &self.inner.charge_ref
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.expires_at
    }

    /// Expiry shown by the countdown; defaults to now + `default_expiry`.
    pub fn display_expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.inner.expires_at.unwrap_or_else(|| {
            now + chrono::Duration::from_std(self.inner.config.default_expiry)
                .unwrap_or(chrono::Duration::minutes(30))
        })
    }

    /// Checks immediately, then keeps checking on the current interval.
    /// A no-op while running; a stopped poller is never restarted.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.state();
        match &state.phase {
            PollPhase::Running => {
                inner
                    .span
                    .in_scope(|| debug!("start ignored: poller already running"));
                return;
            }
            PollPhase::Stopped(reason) => {
                inner.span.in_scope(
                    || debug!(reason = %reason, "start ignored: poller already stopped"),
                );
                return;
            }
            PollPhase::Idle => {}
        }

        state.phase = PollPhase::Running;
        state.expires_deadline = inner.expires_at.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + remaining
        });
        Inner::arm_timer(inner, &mut state, Duration::ZERO);
        drop(state);

        inner.phase_tx.send_replace(PollPhase::Running);
        inner.span.in_scope(|| {
            info!(
                expires_at = ?inner.expires_at,
                pending_interval_ms = inner.config.pending_interval.as_millis() as u64,
                "PIX status poller started"
            )
        });
    }

    /// Cancels the scheduled check. Idempotent. A check already in flight
    /// finishes but its result is discarded.
    pub fn stop(&self) {
        self.inner.halt(StopReason::Cancelled);
    }

    /// Runs one cycle now, subject to the same de-duplication as the timer.
    pub async fn check_now(&self) -> CycleOutcome {
        Inner::run_cycle(&self.inner)
            .instrument(self.inner.span.clone())
            .await
    }

    pub fn status(&self) -> Option<ChargeStatus> {
        self.inner.state().last_status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().phase == PollPhase::Running
    }

    pub fn snapshot(&self) -> PollSnapshot {
        let state = self.inner.state();
        PollSnapshot {
            phase: state.phase.clone(),
            current_interval: state.current_interval,
            consecutive_failures: state.consecutive_failures,
            last_status: state.last_status.clone(),
            has_pending_timer: state.timer.is_some(),
            in_flight: state.in_flight,
        }
    }

    /// Resolves once the poller stops, after any completion callback ran.
    pub async fn wait_stopped(&self) -> StopReason {
        let mut rx = self.inner.phase_tx.subscribe();
        loop {
            if let PollPhase::Stopped(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return StopReason::Cancelled;
            }
        }
    }
}

impl Drop for PaymentStatusPoller {
    fn drop(&mut self) {
        self.inner.halt(StopReason::Cancelled);
    }
}

/// Clears the in-flight flag if the cycle future is dropped mid-request.
struct InFlightGuard<'a> {
    inner: &'a Inner,
    cycle: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.cycle_seq == self.cycle {
            state.in_flight = false;
        }
    }
}

enum Next {
    Continue,
    Complete(PaymentRecord),
    Stop(StopReason),
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(state: &PollState) -> bool {
        state
            .expires_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Replaces any outstanding timer with one firing after `delay`.
    fn arm_timer(this: &Arc<Self>, state: &mut PollState, delay: Duration) {
        if let Some(handle) = state.timer.take() {
            handle.abort();
        }
        state.timer_seq += 1;
        let seq = state.timer_seq;
        let inner = Arc::clone(this);
        let span = this.span.clone();
        state.timer = Some(tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                Inner::on_timer_fired(&inner, seq).await;
            }
            .instrument(span),
        ));
    }

    async fn on_timer_fired(this: &Arc<Self>, seq: u64) {
        {
            let mut state = this.state();
            if state.timer_seq != seq {
                return;
            }
            // The running task no longer counts as a pending timer.
            state.timer = None;
        }
        Inner::run_cycle(this).await;
    }

    async fn run_cycle(this: &Arc<Self>) -> CycleOutcome {
        let now = Instant::now();
        let admitted = {
            let mut state = this.state();
            if state.phase != PollPhase::Running {
                Err(SkipReason::NotRunning)
            } else if state.in_flight {
                Err(SkipReason::InFlight)
            } else {
                let elapsed = state
                    .last_checked_at
                    .map(|last| now.saturating_duration_since(last));
                match elapsed {
                    Some(elapsed) if elapsed < this.config.min_check_spacing => {
                        if state.timer.is_none() {
                            Inner::arm_timer(
                                this,
                                &mut state,
                                this.config.min_check_spacing - elapsed,
                            );
                        }
                        Err(SkipReason::TooSoon)
                    }
                    _ => {
                        state.in_flight = true;
                        state.cycle_seq += 1;
                        state.last_checked_at = Some(now);
                        Ok(state.cycle_seq)
                    }
                }
            }
        };

        let cycle = match admitted {
            Ok(cycle) => cycle,
            Err(reason) => {
                this.observer.on_check_skipped(&this.charge_ref, reason);
                return CycleOutcome::Skipped(reason);
            }
        };
        let _guard = InFlightGuard { inner: this, cycle };

        let timeout = this.config.request_timeout;
        let result = match tokio::time::timeout(
            timeout,
            check_status(this.gateway.as_ref(), &this.charge_ref),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(status_result) => Inner::apply_success(this, status_result).await,
            Err(error) => Inner::apply_failure(this, error),
        }
    }

    async fn apply_success(this: &Arc<Self>, result: StatusResult) -> CycleOutcome {
        let status = result.status.clone();
        let next = {
            let mut state = this.state();
            state.in_flight = false;
            if state.phase != PollPhase::Running {
                drop(state);
                debug!(status = %status, "discarding status received after stop");
                return CycleOutcome::Discarded;
            }

            state.consecutive_failures = 0;
            state.last_status = Some(status.clone());
            state.current_interval =
                interval_for_status(&this.config, &status, state.current_interval);

            let next = if status.is_terminal_success() {
                Next::Complete(PaymentRecord::from_status(
                    &this.charge_ref,
                    &result,
                    this.expires_at,
                ))
            } else if status.is_terminal_failure() {
                Next::Stop(StopReason::TerminalFailure(status.clone()))
            } else if Inner::is_expired(&state) {
                Next::Stop(StopReason::Expired)
            } else {
                Next::Continue
            };

            match &next {
                Next::Continue => {
                    let interval = state.current_interval;
                    Inner::arm_timer(this, &mut state, interval);
                    debug!(
                        status = %status,
                        next_interval_ms = interval.as_millis() as u64,
                        "PIX status checked"
                    );
                }
                Next::Complete(_) => Inner::settle(&mut state, StopReason::Completed),
                Next::Stop(reason) => Inner::settle(&mut state, reason.clone()),
            }
            next
        };

        this.listener.on_status_change(&status);

        match next {
            Next::Continue => {}
            Next::Complete(record) => {
                info!(status = %status, amount = %record.amount, "PIX payment settled");
                // Runs to completion even if the caller of this cycle is dropped.
                let inner = Arc::clone(this);
                let finish = tokio::spawn(
                    async move {
                        if let Err(e) = inner.store.put(record).await {
                            inner.observer.on_store_failed(&inner.charge_ref, &e);
                        }
                        inner.listener.on_completed();
                        inner.publish_stopped(StopReason::Completed);
                    }
                    .instrument(this.span.clone()),
                );
                if let Err(e) = finish.await {
                    error!(error = %e, "PIX completion task failed");
                }
            }
            Next::Stop(reason) => this.publish_stopped(reason),
        }

        CycleOutcome::Checked(status)
    }

    fn apply_failure(this: &Arc<Self>, error: GatewayError) -> CycleOutcome {
        let (failures, interval, expired) = {
            let mut state = this.state();
            state.in_flight = false;
            if state.phase != PollPhase::Running {
                drop(state);
                debug!(error = %error, "discarding failure received after stop");
                return CycleOutcome::Discarded;
            }

            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.current_interval = backoff_interval(&this.config, state.consecutive_failures);

            let expired = Inner::is_expired(&state);
            if expired {
                Inner::settle(&mut state, StopReason::Expired);
            } else {
                let interval = state.current_interval;
                Inner::arm_timer(this, &mut state, interval);
            }
            (state.consecutive_failures, state.current_interval, expired)
        };

        this.observer
            .on_check_failed(&this.charge_ref, &error, failures, interval);
        if expired {
            this.publish_stopped(StopReason::Expired);
        }

        CycleOutcome::Failed
    }

    /// Moves to `Stopped` and drops the pending timer. Callers publish the
    /// stop once their callbacks have run.
    fn settle(state: &mut PollState, reason: StopReason) {
        state.phase = PollPhase::Stopped(reason);
        if let Some(handle) = state.timer.take() {
            handle.abort();
        }
    }

    fn halt(&self, reason: StopReason) {
        {
            let mut state = self.state();
            if matches!(state.phase, PollPhase::Stopped(_)) {
                return;
            }
            Inner::settle(&mut state, reason.clone());
        }
        self.publish_stopped(reason);
    }

    fn publish_stopped(&self, reason: StopReason) {
        self.span
            .in_scope(|| self.observer.on_stopped(&self.charge_ref, &reason));
        self.phase_tx.send_replace(PollPhase::Stopped(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::GatewayResult;
    use crate::payments::store::InMemoryPaymentStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Lookup {
        Internal,
        External,
    }

    /// Replays scripted responses; answers `pending` once the script runs out.
    #[derive(Default)]
    struct ScriptedGateway {
        script: Mutex<VecDeque<GatewayResult<StatusResult>>>,
        calls: Mutex<Vec<(Instant, Lookup)>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<GatewayResult<StatusResult>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn gated(script: Vec<GatewayResult<StatusResult>>, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(script)
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn lookups(&self) -> Vec<Lookup> {
            self.calls.lock().unwrap().iter().map(|(_, l)| *l).collect()
        }

        async fn respond(&self, lookup: Lookup, id: &str) -> GatewayResult<StatusResult> {
            self.calls.lock().unwrap().push((Instant::now(), lookup));
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(id, ChargeStatus::Pending)))
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn check_status_by_internal_id(&self, id: &str) -> GatewayResult<StatusResult> {
            self.respond(Lookup::Internal, id).await
        }

        async fn check_status_by_external_id(&self, id: &str) -> GatewayResult<StatusResult> {
            self.respond(Lookup::External, id).await
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        statuses: Mutex<Vec<ChargeStatus>>,
        completed: AtomicUsize,
    }

    impl StatusListener for RecordingListener {
        fn on_status_change(&self, status: &ChargeStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn on_completed(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Delays every write; reads go straight through.
    struct SlowStore {
        records: InMemoryPaymentStore,
        delay: Duration,
    }

    #[async_trait]
    impl PaymentRecordStore for SlowStore {
        async fn put(&self, record: PaymentRecord) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.records.put(record).await
        }

        async fn get(&self, charge_id: &str) -> Result<Option<PaymentRecord>, StoreError> {
            self.records.get(charge_id).await
        }
    }

    fn status(id: &str, status: ChargeStatus) -> StatusResult {
        StatusResult {
            charge_id: id.to_string(),
            status,
            amount: "120.00".parse().expect("decimal"),
            base_amount: Some("110.00".parse().expect("decimal")),
            due_date: None,
            description: None,
        }
    }

    fn network_error() -> GatewayResult<StatusResult> {
        Err(GatewayError::NetworkError {
            message: "connection refused".to_string(),
        })
    }

    struct Harness {
        poller: PaymentStatusPoller,
        gateway: Arc<ScriptedGateway>,
        listener: Arc<RecordingListener>,
        store: Arc<InMemoryPaymentStore>,
    }

    fn harness_with(
        charge_ref: ChargeRef,
        gateway: ScriptedGateway,
        expires_at: Option<DateTime<Utc>>,
    ) -> Harness {
        let gateway = Arc::new(gateway);
        let listener = Arc::new(RecordingListener::default());
        let store = Arc::new(InMemoryPaymentStore::new());
        let poller = PaymentStatusPoller::builder(charge_ref, gateway.clone(), store.clone())
            .expires_at(expires_at)
            .listener(listener.clone())
            .build()
            .expect("valid poller");
        Harness {
            poller,
            gateway,
            listener,
            store,
        }
    }

    fn harness(gateway: ScriptedGateway) -> Harness {
        harness_with(ChargeRef::External("pix_abc123".to_string()), gateway, None)
    }

    // --- interval policy ----------------------------------------------------

    #[test]
    fn backoff_schedule_grows_and_caps() {
        let config = PollerConfig::default();
        assert_eq!(backoff_interval(&config, 1), Duration::from_millis(7_500));
        assert_eq!(backoff_interval(&config, 2), Duration::from_millis(11_250));
        assert_eq!(backoff_interval(&config, 3), Duration::from_millis(16_875));
        assert_eq!(backoff_interval(&config, 5), Duration::from_secs(30));
        assert_eq!(backoff_interval(&config, u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn backoff_is_monotonic() {
        let config = PollerConfig::default();
        let mut previous = Duration::ZERO;
        for failures in 1..20 {
            let next = backoff_interval(&config, failures);
            assert!(next >= previous);
            assert!(next <= config.max_interval);
            previous = next;
        }
    }

    #[test]
    fn status_interval_mapping() {
        let config = PollerConfig::default();
        let backed_off = Duration::from_secs(20);
        assert_eq!(
            interval_for_status(&config, &ChargeStatus::Processing, backed_off),
            Duration::from_secs(2)
        );
        assert_eq!(
            interval_for_status(&config, &ChargeStatus::Pending, backed_off),
            Duration::from_secs(5)
        );
        assert_eq!(
            interval_for_status(&config, &ChargeStatus::Unknown("review".into()), backed_off),
            backed_off
        );
    }

    // --- lifecycle ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let h = harness(ScriptedGateway::new(vec![]));
        h.poller.start();
        h.poller.start();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.gateway.call_count(), 1);
        assert!(h.poller.snapshot().has_pending_timer);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(h.gateway.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_triggers_inside_spacing_window_make_one_call() {
        let h = harness(ScriptedGateway::new(vec![]));
        h.poller.start();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            h.poller.check_now().await,
            CycleOutcome::Skipped(SkipReason::TooSoon)
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            h.poller.check_now().await,
            CycleOutcome::Skipped(SkipReason::TooSoon)
        );

        assert_eq!(h.gateway.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_while_in_flight_is_skipped() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedGateway::gated(vec![], gate.clone()));
        h.poller.start();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(h.poller.snapshot().in_flight);
        assert_eq!(
            h.poller.check_now().await,
            CycleOutcome::Skipped(SkipReason::InFlight)
        );

        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!h.poller.snapshot().in_flight);
        assert_eq!(h.gateway.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_is_safe() {
        let h = harness(ScriptedGateway::new(vec![]));
        h.poller.stop();
        h.poller.stop();
        h.poller.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.gateway.call_count(), 0);
        assert_eq!(h.poller.wait_stopped().await, StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer() {
        let h = harness(ScriptedGateway::new(vec![]));
        h.poller.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.poller.stop();

        assert!(!h.poller.snapshot().has_pending_timer);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.gateway.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_poller_stops_polling() {
        let h = harness(ScriptedGateway::new(vec![]));
        let gateway = h.gateway.clone();
        h.poller.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(h);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.call_count(), 1);
    }

    // --- outcomes -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn terminal_success_completes_once_and_persists() {
        let h = harness(ScriptedGateway::new(vec![Ok(status(
            "pix_abc123",
            ChargeStatus::Confirmed,
        ))]));
        h.poller.start();

        assert_eq!(h.poller.wait_stopped().await, StopReason::Completed);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.gateway.call_count(), 1);
        assert_eq!(h.listener.completed.load(Ordering::SeqCst), 1);
        let record = h
            .store
            .get("pix_abc123")
            .await
            .unwrap()
            .expect("settled record stored");
        assert_eq!(record.status, ChargeStatus::Confirmed);
        assert!(!h.poller.snapshot().has_pending_timer);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_manual_check_still_completes() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(status("pix_abc123", ChargeStatus::Pending)),
            Ok(status("pix_abc123", ChargeStatus::Paid)),
        ]));
        let listener = Arc::new(RecordingListener::default());
        let store = Arc::new(SlowStore {
            records: InMemoryPaymentStore::new(),
            delay: Duration::from_secs(10),
        });
        let poller = PaymentStatusPoller::builder(
            ChargeRef::External("pix_abc123".to_string()),
            gateway.clone(),
            store.clone(),
        )
        .listener(listener.clone())
        .build()
        .expect("valid poller");
        poller.start();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let manual = tokio::time::timeout(Duration::from_millis(100), poller.check_now()).await;
        assert!(manual.is_err());
        assert_eq!(listener.completed.load(Ordering::SeqCst), 0);

        let reason = tokio::time::timeout(Duration::from_secs(30), poller.wait_stopped())
            .await
            .expect("stop is published");
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
        assert!(store.records.get("pix_abc123").await.unwrap().is_some());
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_record_is_keyed_by_polled_id() {
        let h = harness_with(
            ChargeRef::Internal("4412".to_string()),
            ScriptedGateway::new(vec![Ok(status("pix_ext_99", ChargeStatus::Paid))]),
            None,
        );
        h.poller.start();
        assert_eq!(h.poller.wait_stopped().await, StopReason::Completed);

        let record = h
            .store
            .get("4412")
            .await
            .unwrap()
            .expect("record under the polled id");
        assert_eq!(record.gateway_charge_id.as_deref(), Some("pix_ext_99"));
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_without_echoed_id_is_still_stored() {
        let h = harness(ScriptedGateway::new(vec![Ok(status(
            "",
            ChargeStatus::Paid,
        ))]));
        h.poller.start();
        assert_eq!(h.poller.wait_stopped().await, StopReason::Completed);

        assert_eq!(h.listener.completed.load(Ordering::SeqCst), 1);
        let record = h.store.get("pix_abc123").await.unwrap();
        assert!(record.is_some_and(|r| r.gateway_charge_id.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_stops_without_completion() {
        let h = harness(ScriptedGateway::new(vec![
            Ok(status("pix_abc123", ChargeStatus::Pending)),
            Ok(status("pix_abc123", ChargeStatus::Cancelled)),
        ]));
        h.poller.start();

        assert_eq!(
            h.poller.wait_stopped().await,
            StopReason::TerminalFailure(ChargeStatus::Cancelled)
        );
        assert_eq!(h.listener.completed.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.listener.statuses.lock().unwrap().last(),
            Some(&ChargeStatus::Cancelled)
        );
        assert!(h.store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_stop_is_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedGateway::gated(
            vec![Ok(status("pix_abc123", ChargeStatus::Paid))],
            gate.clone(),
        ));
        h.poller.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.gateway.call_count(), 1);

        h.poller.stop();
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.listener.statuses.lock().unwrap().is_empty());
        assert_eq!(h.listener.completed.load(Ordering::SeqCst), 0);
        assert!(h.store.is_empty().await);
        let snapshot = h.poller.snapshot();
        assert_eq!(snapshot.phase, PollPhase::Stopped(StopReason::Cancelled));
        assert_eq!(snapshot.last_status, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.gateway.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_times_out_as_failure() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(ScriptedGateway::gated(vec![], gate));
        h.poller.start();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let snapshot = h.poller.snapshot();
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(!snapshot.in_flight);
        assert_eq!(snapshot.current_interval, Duration::from_millis(7_500));
        assert!(snapshot.has_pending_timer);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_expiry_stops_polling() {
        let expired = Utc::now() - chrono::Duration::minutes(1);
        let h = harness_with(
            ChargeRef::Internal("4412".to_string()),
            ScriptedGateway::new(vec![network_error(), network_error()]),
            Some(expired),
        );
        h.poller.start();

        assert_eq!(h.poller.wait_stopped().await, StopReason::Expired);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.call_count(), 1);
        assert!(h.listener.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_after_expiry_stops_polling() {
        let expired = Utc::now() - chrono::Duration::minutes(1);
        let h = harness_with(
            ChargeRef::Internal("4412".to_string()),
            ScriptedGateway::new(vec![]),
            Some(expired),
        );
        h.poller.start();

        assert_eq!(h.poller.wait_stopped().await, StopReason::Expired);
        assert_eq!(
            h.listener.statuses.lock().unwrap().as_slice(),
            &[ChargeStatus::Pending]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_passing_mid_poll_stops_on_next_failure() {
        let expires_at = Utc::now() + chrono::Duration::seconds(12);
        let h = harness_with(
            ChargeRef::Internal("4412".to_string()),
            ScriptedGateway::new(vec![network_error(); 10]),
            Some(expires_at),
        );
        h.poller.start();

        // Checks at 0s and 7.5s back off; the one at 18.75s lands past expiry.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.poller.is_running());
        assert_eq!(h.gateway.call_count(), 2);

        assert_eq!(h.poller.wait_stopped().await, StopReason::Expired);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.call_count(), 3);
        assert_eq!(h.poller.snapshot().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_expiry_never_stops_polling() {
        let h = harness(ScriptedGateway::new(vec![network_error(); 10]));
        h.poller.start();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(h.poller.is_running());
        assert!(h.gateway.call_count() > 5);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        let h = harness(ScriptedGateway::new(vec![
            network_error(),
            network_error(),
            network_error(),
            Ok(status("pix_abc123", ChargeStatus::Processing)),
        ]));
        h.poller.start();

        // 0 + 7.5s + 11.25s + 16.875s
        tokio::time::sleep(Duration::from_millis(35_700)).await;
        let snapshot = h.poller.snapshot();
        assert_eq!(h.gateway.call_count(), 4);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.current_interval, Duration::from_secs(2));
    }

    // --- routing ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn routes_lookup_by_reference_kind() {
        let internal = harness_with(
            ChargeRef::Internal("88".to_string()),
            ScriptedGateway::new(vec![]),
            None,
        );
        internal.poller.start();
        let external = harness(ScriptedGateway::new(vec![]));
        external.poller.start();
        let both = harness_with(
            ChargeRef::from_identifiers(Some("88"), Some("pix_88")).unwrap(),
            ScriptedGateway::new(vec![]),
            None,
        );
        both.poller.start();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(internal.gateway.lookups(), vec![Lookup::Internal]);
        assert_eq!(external.gateway.lookups(), vec![Lookup::External]);
        assert_eq!(both.gateway.lookups(), vec![Lookup::External]);
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(ScriptedGateway::default());
        let store: Arc<dyn PaymentRecordStore> = Arc::new(InMemoryPaymentStore::new());
        let result = PaymentStatusPoller::builder(
            ChargeRef::Internal("1".to_string()),
            gateway,
            store,
        )
        .config(PollerConfig {
            growth_factor: 0.9,
            ..PollerConfig::default()
        })
        .build();
        assert!(result.is_err());
    }
}
