//! Per-alert debounce queue.
//!
//! Alerts are keyed by their label set. The first arrival of a key schedules
//! a firing one quiet period later; further arrivals before that only replace
//! the payload. A single timer task fires due keys, each on its own task, and
//! never runs two firings of the same key at once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertKey};
use crate::error::ReconcileError;

/// Default quiet period before a key fires.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(30);

/// Default time a firing may take before it is abandoned.
pub const DEFAULT_HANDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time in-flight firings get to finish on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A pending (or just fired) alert.
#[derive(Debug, Clone)]
pub struct QueuedAlert {
    pub key: AlertKey,
    /// Latest payload received for the key
    pub alert: Alert,
    pub fire_at: Instant,
    pub first_seen: DateTime<Utc>,
    /// Deliveries coalesced into this entry
    pub arrivals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New entry, fires one quiet period from now
    Scheduled,
    /// Payload replaced on an existing entry
    Coalesced,
}

/// Receives alerts whose quiet period has elapsed.
#[async_trait]
pub trait FiredAlertHandler: Send + Sync {
    async fn handle(&self, fired: QueuedAlert) -> Result<(), ReconcileError>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<AlertKey, QueuedAlert>,
    in_flight: HashSet<AlertKey>,
}

/// Coalescing timer queue shared by the ingress and the timer task.
#[derive(Debug)]
pub struct DebounceQueue {
    quiet_period: Duration,
    handle_timeout: Duration,
    drain_timeout: Duration,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl DebounceQueue {
    #[must_use]
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            handle_timeout: DEFAULT_HANDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Queue `alert`, coalescing with a pending entry for the same label set.
    pub async fn enqueue(&self, alert: Alert) -> EnqueueOutcome {
        let key = alert.key();
        let mut state = self.state.lock().await;

        if let Some(entry) = state.pending.get_mut(&key) {
            entry.alert = alert;
            entry.arrivals = entry.arrivals.saturating_add(1);
            debug!(key = %key, arrivals = entry.arrivals, "Coalesced alert into pending entry");
            return EnqueueOutcome::Coalesced;
        }

        debug!(key = %key, alertname = alert.name(), "Scheduled alert");
        state.pending.insert(
            key,
            QueuedAlert {
                key,
                alert,
                fire_at: Instant::now() + self.quiet_period,
                first_seen: Utc::now(),
                arrivals: 1,
            },
        );
        drop(state);

        self.wake.notify_one();
        EnqueueOutcome::Scheduled
    }

    /// Number of keys waiting to fire.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Timer loop. Returns once `shutdown` is cancelled and in-flight
    /// firings have drained or been aborted.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn FiredAlertHandler>,
        shutdown: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();
        let mut running = HashMap::new();

        info!(
            quiet_period = ?self.quiet_period,
            handle_timeout = ?self.handle_timeout,
            "Debounce queue started"
        );

        loop {
            let next = self.dispatch_due(&handler, &mut tasks, &mut running).await;

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.complete(joined, &mut running).await;
                }
                () = self.wake.notified() => {}
                () = sleep_until(next) => {}
            }
        }

        self.drain(tasks, running).await;
    }

    /// Dispatch every due entry whose key is not in flight and return the
    /// nearest remaining deadline.
    async fn dispatch_due(
        &self,
        handler: &Arc<dyn FiredAlertHandler>,
        tasks: &mut JoinSet<()>,
        running: &mut HashMap<Id, AlertKey>,
    ) -> Option<Instant> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let due: Vec<AlertKey> = state
            .pending
            .values()
            .filter(|entry| entry.fire_at <= now && !state.in_flight.contains(&entry.key))
            .map(|entry| entry.key)
            .collect();

        for key in due {
            let Some(fired) = state.pending.remove(&key) else {
                continue;
            };
            state.in_flight.insert(key);

            let handler = Arc::clone(handler);
            let timeout = self.handle_timeout;
            let handle = tasks.spawn(fire(handler, fired, timeout));
            running.insert(handle.id(), key);
        }

        // Entries blocked behind an in-flight firing are woken by its completion
        state
            .pending
            .values()
            .filter(|entry| !state.in_flight.contains(&entry.key))
            .map(|entry| entry.fire_at)
            .min()
    }

    async fn complete(
        &self,
        joined: Result<(Id, ()), JoinError>,
        running: &mut HashMap<Id, AlertKey>,
    ) {
        let id = match joined {
            Ok((id, ())) => id,
            Err(e) => {
                if e.is_panic() {
                    error!(error = %e, "Reconciliation task panicked");
                }
                e.id()
            }
        };

        if let Some(key) = running.remove(&id) {
            self.state.lock().await.in_flight.remove(&key);
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>, mut running: HashMap<Id, AlertKey>) {
        let dropped = {
            let mut state = self.state.lock().await;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "Dropping unfired alerts on shutdown");
        }

        if tasks.is_empty() {
            info!("Debounce queue stopped");
            return;
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight reconciliations");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = tasks.join_next_with_id().await {
                self.complete(joined, &mut running).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                aborted = tasks.len(),
                drain_timeout = ?self.drain_timeout,
                "Drain timeout elapsed, aborting in-flight reconciliations"
            );
            tasks.shutdown().await;
        }
        info!("Debounce queue stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn fire(handler: Arc<dyn FiredAlertHandler>, fired: QueuedAlert, timeout: Duration) {
    let key = fired.key;
    debug!(
        key = %key,
        alertname = fired.alert.name(),
        arrivals = fired.arrivals,
        "Firing alert"
    );

    match tokio::time::timeout(timeout, handler.handle(fired)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_conflict() => {
            warn!(key = %key, error = %e, "Lost write race, dropping firing");
        }
        Ok(Err(e)) => {
            error!(key = %key, error = %e, "Reconciliation failed, dropping firing");
        }
        Err(_) => {
            error!(key = %key, timeout = ?timeout, "Reconciliation timed out, dropping firing");
        }
    }
}
