//! Async bounded pool with retrying connection creation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

use crate::error::{ConnectionError, truncate_message};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// How connection creation is retried. Backoff before attempt `n + 1` is
/// `backoff_base ^ n` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: f64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff_base: f64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff_base,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, 0.0)
    }

    /// Delay after the failed attempt number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_base.max(0.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2.0)
    }
}

struct Slot<T> {
    item: T,
    created_at: Instant,
    last_used: Instant,
}

struct AsyncPoolState<T> {
    idle: Vec<Slot<T>>,
}

/// An async bounded pool for reusable connection-like objects.
pub struct AsyncPool<T> {
    max: usize,
    retry: RetryPolicy,
    factory: Box<dyn Fn() -> FactoryFuture<T> + Send + Sync>,
    state: Mutex<AsyncPoolState<T>>,
    available: Notify,
    /// Connections that exist or are being created.
    in_flight: AtomicUsize,
    /// Connections currently checked out.
    in_use: AtomicUsize,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A claimed creation slot in an [`AsyncPool`].
struct Reservation<'a, T> {
    pool: &'a AsyncPool<T>,
    kept: bool,
}

impl<T> Reservation<'_, T> {
    /// The slot now belongs to a live connection.
    fn keep(mut self) {
        self.kept = true;
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.pool.available.notify_one();
        }
    }
}

/// A pooled async value that returns to the pool on drop.
pub struct AsyncPooled<T> {
    pool: Arc<AsyncPool<T>>,
    slot: Option<Slot<T>>,
}

impl<T> AsyncPool<T> {
    pub fn new<F, Fut, E>(max: usize, retry: RetryPolicy, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        let factory = Box::new(move || {
            let fut = factory();
            Box::pin(async move { fut.await.map_err(|err| err.to_string()) }) as FactoryFuture<T>
        });
        Arc::new(Self {
            max: max.max(1),
            retry,
            factory,
            state: Mutex::new(AsyncPoolState { idle: Vec::new() }),
            available: Notify::new(),
            in_flight: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<T>, ConnectionError> {
        let started = Instant::now();
        let deadline = timeout.map(|limit| started + limit);
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(ConnectionError::Cancelled);
            }
            // Register interest before checking state so a release between
            // the check and the wait is not lost.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = self.state.lock().idle.pop();
            if let Some(slot) = slot {
                return Ok(self.hand_out(slot));
            }
            if let Some(reservation) = self.reserve() {
                let item = self.create(cancel).await?;
                reservation.keep();
                let now = Instant::now();
                return Ok(self.hand_out(Slot {
                    item,
                    created_at: now,
                    last_used: now,
                }));
            }

            let wait = match deadline {
                None => None,
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(ConnectionError::Exhausted {
                            waited_ms: elapsed_ms(started),
                        });
                    }
                    Some(limit - now)
                }
            };

            match (cancel, wait) {
                (Some(token), Some(duration)) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = token.cancelled() => return Err(ConnectionError::Cancelled),
                        _ = sleep(duration) => return Err(ConnectionError::Exhausted {
                            waited_ms: elapsed_ms(started),
                        }),
                    }
                }
                (Some(token), None) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = token.cancelled() => return Err(ConnectionError::Cancelled),
                    }
                }
                (None, Some(duration)) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = sleep(duration) => return Err(ConnectionError::Exhausted {
                            waited_ms: elapsed_ms(started),
                        }),
                    }
                }
                (None, None) => {
                    notified.await;
                }
            }
        }
    }

    /// Claims a creation slot if fewer than `max` connections exist. The
    /// slot is given back when the reservation drops without being kept,
    /// including when the acquiring future is dropped mid-connect.
    fn reserve(&self) -> Option<Reservation<'_, T>> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.max).then_some(current + 1)
            })
            .ok()
            .map(|_| Reservation {
                pool: self,
                kept: false,
            })
    }

    /// Runs the factory with retries. The reserved slot stays claimed during
    /// backoff so concurrent callers cannot overshoot `max`.
    async fn create(&self, cancel: Option<&CancelToken>) -> Result<T, ConnectionError> {
        let mut last_error = String::new();
        for attempt in 0..self.retry.attempts {
            let connected = match cancel {
                Some(token) => {
                    tokio::select! {
                        connected = (self.factory)() => connected,
                        _ = token.cancelled() => return Err(ConnectionError::Cancelled),
                    }
                }
                None => (self.factory)().await,
            };
            match connected {
                Ok(item) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "connection established after retry");
                    }
                    return Ok(item);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        attempts = self.retry.attempts,
                        error = %err,
                        "connection attempt failed"
                    );
                    last_error = err;
                }
            }
            if attempt + 1 < self.retry.attempts {
                let delay = self.retry.backoff(attempt);
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = sleep(delay) => {},
                            _ = token.cancelled() => return Err(ConnectionError::Cancelled),
                        }
                    }
                    None => sleep(delay).await,
                }
            }
        }
        Err(ConnectionError::Connect {
            attempts: self.retry.attempts,
            message: truncate_message(&last_error),
        })
    }

    fn hand_out(self: &Arc<Self>, slot: Slot<T>) -> AsyncPooled<T> {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        AsyncPooled {
            pool: Arc::clone(self),
            slot: Some(slot),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn release(&self, mut slot: Slot<T>) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        slot.last_used = Instant::now();
        {
            let mut state = self.state.lock();
            if state.idle.len() < self.max {
                state.idle.push(slot);
                drop(state);
                self.available.notify_one();
                return;
            }
        }
        // Over capacity: the slot is closed when it drops here.
        drop(slot);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }

    fn discard(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> AsyncPooled<T> {
    fn slot(&self) -> &Slot<T> {
        match self.slot.as_ref() {
            Some(slot) => slot,
            None => unreachable!("pooled slot is only taken on drop or discard"),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.slot().created_at
    }

    pub fn last_used(&self) -> Instant {
        self.slot().last_used
    }

    /// Time since the connection was last returned to the pool.
    pub fn idle_for(&self) -> Duration {
        self.slot().last_used.elapsed()
    }

    pub fn touch(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.last_used = Instant::now();
        }
    }

    /// Closes the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.slot.take().is_some() {
            self.pool.discard();
        }
    }
}

impl<T> AsRef<T> for AsyncPooled<T> {
    fn as_ref(&self) -> &T {
        &self.slot().item
    }
}

impl<T> Drop for AsyncPooled<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
