//! Bounded-concurrency admission with one-shot draining shutdown.
//!
//! Every backend call runs inside [`AdmissionGate::execute`], which holds one
//! of `capacity` slots for the duration of the call.
//!
//! # Admission race
//!
//! While waiting for a slot, three events race and the first one wins:
//!
//! ```text
//!  shutdown signal ──► Shutdown error
//!  caller cancel / deadline ──► Cancelled / Timeout error
//!  slot acquired ──► re-check closing flag ──► closing: release, Shutdown error
//!                                         └──► open: register in-flight, run
//! ```
//!
//! The closing flag is checked and the in-flight registration taken under
//! the same read lock that [`AdmissionGate::shutdown`] takes for writing, so
//! a call either registers before shutdown starts draining or is rejected.
//!
//! # Shutdown
//!
//! [`AdmissionGate::shutdown`] runs its closing logic exactly once: it sets
//! the closing flag, fires the shutdown signal, closes the semaphore, and
//! then waits until every admitted call has finished. Admitted calls are
//! never interrupted by shutdown.
//!
//! # Lifecycle
//!
//! [`AdmissionController`] owns the current gate for the process. `init` is
//! idempotent while a gate is open and replaces a shut-down gate with a
//! fresh one; a shut-down gate is never reopened.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    context::CallContext,
    error::{ClassifiedError, ConfigError, GatewayResult},
    metrics::Metrics,
};

/// Upper bound applied to calls whose context carries no deadline.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct GateState {
    closing: bool,
}

/// A fixed-capacity admission gate.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: usize,
    semaphore: Semaphore,
    state: RwLock<GateState>,
    shutdown_signal: CancellationToken,
    in_flight: TaskTracker,
    metrics: Metrics,
}

impl AdmissionGate {
    /// Creates an open gate with `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `capacity` is zero or above the
    /// semaphore's permit limit.
    pub fn new(capacity: usize, metrics: Metrics) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "capacity",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(ConfigError::AboveMaximum {
                field: "capacity",
                max: Semaphore::MAX_PERMITS.to_string(),
                value: capacity.to_string(),
            });
        }
        Ok(Self {
            capacity,
            semaphore: Semaphore::new(capacity),
            state: RwLock::new(GateState::default()),
            shutdown_signal: CancellationToken::new(),
            in_flight: TaskTracker::new(),
            metrics,
        })
    }

    /// Runs `operation` inside one admission slot.
    ///
    /// Without a deadline on `ctx`, [`DEFAULT_ADMISSION_TIMEOUT`] bounds both
    /// the wait for a slot and the operation itself. A panic inside
    /// `operation` is caught and returned as a `Panicked` error; the slot and
    /// the in-flight registration are released on every path.
    ///
    /// # Errors
    ///
    /// - `Shutdown` if shutdown began before the slot was claimed
    /// - `Cancelled` / `Timeout` if `ctx` ends first
    /// - whatever `operation` returns
    pub async fn execute<T, Fut>(&self, ctx: &CallContext, operation: Fut) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
    {
        let deadline = ctx.deadline().unwrap_or_else(|| Instant::now() + DEFAULT_ADMISSION_TIMEOUT);

        if self.is_closing() {
            self.metrics.record_admission_rejected();
            return Err(ClassifiedError::shutdown());
        }

        let acquired = tokio::select! {
            biased;
            () = self.shutdown_signal.cancelled() => Err(ClassifiedError::shutdown()),
            () = ctx.cancelled() => {
                Err(ClassifiedError::cancelled("cancelled while waiting for admission"))
            },
            () = tokio::time::sleep_until(deadline) => {
                Err(ClassifiedError::timeout("deadline exceeded while waiting for admission"))
            },
            permit = self.semaphore.acquire() => permit.map_err(|_| ClassifiedError::shutdown()),
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(err) => {
                self.metrics.record_admission_rejected();
                return Err(err);
            },
        };

        // Shutdown may have begun between the slot freeing up and this claim.
        let in_flight = {
            let state = self.state.read();
            if state.closing {
                drop(permit);
                self.metrics.record_admission_rejected();
                return Err(ClassifiedError::shutdown());
            }
            self.in_flight.token()
        };

        let result = run_guarded(ctx, deadline, operation, &self.metrics).await;

        drop(in_flight);
        drop(permit);
        result
    }

    /// Stops admitting calls and waits for admitted ones to finish.
    ///
    /// Returns `true` for the call that performed the shutdown; later or
    /// concurrent calls return `false` after the same drain completes.
    pub async fn shutdown(&self) -> bool {
        let first = {
            let mut state = self.state.write();
            let first = !state.closing;
            state.closing = true;
            first
        };

        if first {
            tracing::info!(capacity = self.capacity, "admission gate shutting down");
            self.shutdown_signal.cancel();
            self.semaphore.close();
            self.in_flight.close();
        }

        self.in_flight.wait().await;

        if first {
            tracing::info!("admission gate drained");
        }
        first
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state.read().closing
    }

    /// Slots currently held; zero once shutdown has begun.
    #[must_use]
    pub fn current_load(&self) -> usize {
        if self.is_closing() {
            return 0;
        }
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Configured capacity; zero once shutdown has begun.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        if self.is_closing() { 0 } else { self.capacity }
    }

    /// Admitted calls that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Runs `operation` until completion, cancellation, or `deadline`, converting
/// a panic into an error.
async fn run_guarded<T, Fut>(
    ctx: &CallContext,
    deadline: Instant,
    operation: Fut,
    metrics: &Metrics,
) -> GatewayResult<T>
where
    Fut: Future<Output = GatewayResult<T>>,
{
    let bounded = async {
        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(ClassifiedError::cancelled("operation cancelled")),
            outcome = tokio::time::timeout_at(deadline, operation) => outcome.unwrap_or_else(|_| {
                Err(ClassifiedError::timeout("operation exceeded its deadline"))
            }),
        }
    };

    match AssertUnwindSafe(bounded).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let payload = panic_message(payload.as_ref());
            metrics.record_panic();
            tracing::error!(panic = %payload, "operation panicked inside admission slot");
            Err(ClassifiedError::panicked(payload))
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Owner of the process's admission gate.
///
/// Constructed once by bootstrap and passed to every
/// [`Gateway`](crate::Gateway) that should share the concurrency budget.
/// With no gate initialized, calls run unlimited (fail-open).
#[derive(Debug, Default)]
pub struct AdmissionController {
    gate: RwLock<Option<Arc<AdmissionGate>>>,
    metrics: Metrics,
}

impl AdmissionController {
    /// A controller with no gate; calls run unlimited until [`init`](Self::init).
    #[must_use]
    pub fn new(metrics: Metrics) -> Self {
        Self { gate: RwLock::new(None), metrics }
    }

    /// A controller with an open gate of `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid capacity.
    pub fn with_capacity(capacity: usize, metrics: Metrics) -> Result<Self, ConfigError> {
        let controller = Self::new(metrics);
        controller.init(capacity)?;
        Ok(controller)
    }

    /// Creates a gate of `capacity` slots unless an open one exists.
    ///
    /// An open gate keeps its original capacity. A shut-down gate is replaced
    /// by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid capacity.
    pub fn init(&self, capacity: usize) -> Result<(), ConfigError> {
        if self.gate.read().as_ref().is_some_and(|gate| !gate.is_closing()) {
            return Ok(());
        }

        let mut slot = self.gate.write();
        if slot.as_ref().is_some_and(|gate| !gate.is_closing()) {
            return Ok(());
        }
        *slot = Some(Arc::new(AdmissionGate::new(capacity, self.metrics.clone())?));
        tracing::debug!(capacity, "admission gate initialized");
        Ok(())
    }

    /// The current gate, if any.
    #[must_use]
    pub fn gate(&self) -> Option<Arc<AdmissionGate>> {
        self.gate.read().clone()
    }

    /// Runs `operation` through the current gate, or unlimited when there is
    /// none.
    ///
    /// # Errors
    ///
    /// See [`AdmissionGate::execute`].
    pub async fn execute<T, Fut>(&self, ctx: &CallContext, operation: Fut) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
    {
        match self.gate() {
            Some(gate) => gate.execute(ctx, operation).await,
            None => {
                let deadline =
                    ctx.deadline().unwrap_or_else(|| Instant::now() + DEFAULT_ADMISSION_TIMEOUT);
                run_guarded(ctx, deadline, operation, &self.metrics).await
            },
        }
    }

    /// Shuts down the current gate; see [`AdmissionGate::shutdown`].
    /// Returns `false` when there is no gate or it was already shut down.
    pub async fn shutdown(&self) -> bool {
        match self.gate() {
            Some(gate) => gate.shutdown().await,
            None => false,
        }
    }

    /// Slots in use; zero without an open gate.
    #[must_use]
    pub fn current_load(&self) -> usize {
        self.gate().map_or(0, |gate| gate.current_load())
    }

    /// Capacity; zero without an open gate.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.gate().map_or(0, |gate| gate.max_capacity())
    }

    /// Counters shared with every gate this controller creates.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
