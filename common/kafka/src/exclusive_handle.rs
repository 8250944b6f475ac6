//! Serialized access to a blocking, single-threaded client handle.
//!
//! librdkafka consumers must not be driven from several threads at once, and
//! most of their calls block on network round trips. [`ExclusiveHandle`] owns
//! one such handle and hands it out to one action at a time:
//!
//! - callers wait for a single-permit semaphore, which suspends the task
//!   without occupying a runtime worker;
//! - the action itself runs on the blocking pool, so a slow commit never
//!   stalls unrelated tasks;
//! - teardown goes through the same permit, so the handle is closed exactly
//!   once and only after in-flight actions are done.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::metrics_consts::{
    HANDLE_ACTION_DURATION_MS, HANDLE_ACTION_FAILURES, HANDLE_CLOSED, HANDLE_PERMIT_WAIT_MS,
};

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(20);

/// A client handle that blocks the calling thread and must only be used by
/// one thread at a time.
pub trait BlockingHandle: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Release the handle's resources, giving up after roughly `timeout`.
    fn close(self, timeout: Duration) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum HandleError<E> {
    #[error("failed to create handle: {0}")]
    Setup(#[source] E),
    #[error("handle operation failed: {0}")]
    Operation(#[source] E),
    #[error("failed to close handle: {0}")]
    Close(#[source] E),
    #[error("closing handle timed out after {0:?}")]
    CloseTimedOut(Duration),
    #[error("handle is closed")]
    Closed,
    #[error("blocking handle task failed: {0}")]
    Panicked(#[source] JoinError),
}

/// Everything needed to build an [`ExclusiveHandle`].
pub struct ExclusiveHandleSettings<F> {
    factory: F,
    blocking_runtime: Option<RuntimeHandle>,
    close_timeout: Duration,
}

impl<F> ExclusiveHandleSettings<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            blocking_runtime: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Run blocking work on this runtime's blocking pool instead of the
    /// ambient one
    pub fn with_blocking_runtime(mut self, runtime: RuntimeHandle) -> Self {
        self.blocking_runtime = Some(runtime);
        self
    }

    /// A zero timeout falls back to [`DEFAULT_CLOSE_TIMEOUT`]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = if timeout.is_zero() {
            DEFAULT_CLOSE_TIMEOUT
        } else {
            timeout
        };
        self
    }
}

struct Shared<H: BlockingHandle> {
    // Uncontended: the permit already guarantees a single user. The mutex only
    // lets the handle travel into 'static blocking closures.
    handle: Mutex<Option<H>>,
    permit: Arc<Semaphore>,
    // Flipped once the handle's close has actually finished
    closed: watch::Sender<bool>,
    blocking_runtime: Option<RuntimeHandle>,
    close_timeout: Duration,
}

impl<H: BlockingHandle> Shared<H> {
    fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        spawn_blocking_on(self.blocking_runtime.as_ref(), f)
    }

    fn take_handle(&self) -> Option<H> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<H: BlockingHandle> Drop for Shared<H> {
    fn drop(&mut self) {
        // Last reference: nobody else can be holding the permit.
        let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let timeout = self.close_timeout;
        let close = move || match handle.close(timeout) {
            Ok(()) => {
                metrics::counter!(HANDLE_CLOSED, "outcome" => "dropped").increment(1);
                debug!("Closed handle on drop");
            }
            Err(e) => {
                metrics::counter!(HANDLE_CLOSED, "outcome" => "error").increment(1);
                warn!("Failed to close handle on drop: {e}");
            }
        };

        match self
            .blocking_runtime
            .clone()
            .or_else(|| RuntimeHandle::try_current().ok())
        {
            Some(runtime) => {
                drop(runtime.spawn_blocking(close));
            }
            None => close(),
        }
    }
}

// Flags the handle as closed on drop, so racing closers are released even
// when the close itself panics
struct MarkClosed<'a>(&'a watch::Sender<bool>);

impl Drop for MarkClosed<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

fn spawn_blocking_on<F, R>(runtime: Option<&RuntimeHandle>, f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match runtime {
        Some(runtime) => runtime.spawn_blocking(f),
        None => tokio::task::spawn_blocking(f),
    }
}

/// Guard giving serialized, off-scheduler access to a [`BlockingHandle`].
///
/// Clones share the same handle and permit.
pub struct ExclusiveHandle<H: BlockingHandle> {
    shared: Arc<Shared<H>>,
}

impl<H: BlockingHandle> Clone for ExclusiveHandle<H> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<H: BlockingHandle> ExclusiveHandle<H> {
    /// Build the handle on the blocking pool and wrap it.
    ///
    /// The permit is only created once the factory has succeeded, so a failed
    /// setup never exposes a guard.
    pub async fn new<F>(settings: ExclusiveHandleSettings<F>) -> Result<Self, HandleError<H::Error>>
    where
        F: FnOnce() -> Result<H, H::Error> + Send + 'static,
    {
        let ExclusiveHandleSettings {
            factory,
            blocking_runtime,
            close_timeout,
        } = settings;

        let handle = match spawn_blocking_on(blocking_runtime.as_ref(), factory).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Failed to create handle: {e}");
                return Err(HandleError::Setup(e));
            }
            Err(join_err) => return Err(HandleError::Panicked(join_err)),
        };

        let shared = Shared {
            handle: Mutex::new(Some(handle)),
            permit: Arc::new(Semaphore::new(1)),
            closed: watch::Sender::new(false),
            blocking_runtime,
            close_timeout,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Construct a guard, run `body` with it, and always close it afterwards.
    ///
    /// The body's error wins over a close error; a close error is returned
    /// when the body succeeded.
    pub async fn scoped<F, B, Fut, T, E>(
        settings: ExclusiveHandleSettings<F>,
        body: B,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<H, H::Error> + Send + 'static,
        B: FnOnce(ExclusiveHandle<H>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<HandleError<H::Error>>,
    {
        let handle = Self::new(settings).await?;
        let result = body(handle.clone()).await;
        let closed = handle.close().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Failed to close handle after scoped body failed: {close_err}");
                Err(e)
            }
        }
    }

    /// Run `action` against the handle with exclusive access, on the blocking pool.
    ///
    /// Calls are served in FIFO order. The permit is released when the action
    /// returns or panics, even if the caller stopped waiting for the result.
    pub async fn with_handle<F, T>(&self, action: F) -> Result<T, HandleError<H::Error>>
    where
        F: FnOnce(&mut H) -> Result<T, H::Error> + Send + 'static,
        T: Send + 'static,
    {
        let wait_start = Instant::now();
        let permit = self
            .shared
            .permit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HandleError::Closed)?;
        metrics::histogram!(HANDLE_PERMIT_WAIT_MS).record(wait_start.elapsed().as_millis() as f64);

        let shared = self.shared.clone();
        let task = self.shared.spawn_blocking(move || {
            let _permit: OwnedSemaphorePermit = permit;
            let started = Instant::now();

            let mut guard = shared.handle.lock().unwrap_or_else(PoisonError::into_inner);
            let result = match guard.as_mut() {
                Some(handle) => action(handle).map_err(HandleError::Operation),
                None => Err(HandleError::Closed),
            };
            drop(guard);

            metrics::histogram!(HANDLE_ACTION_DURATION_MS)
                .record(started.elapsed().as_millis() as f64);
            result
        });

        let result = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(HandleError::Panicked(join_err)),
        };
        if let Err(e) = &result {
            metrics::counter!(HANDLE_ACTION_FAILURES).increment(1);
            debug!("Handle action failed: {e}");
        }
        result
    }

    /// Close the underlying handle once every in-flight action has finished.
    ///
    /// Callers still queued for the permit, and any later callers, get
    /// [`HandleError::Closed`]. Closing an already closed guard is a no-op; a
    /// close racing one still in progress returns once that one has finished
    /// closing the handle, and only the first close reports its outcome.
    pub async fn close(&self) -> Result<(), HandleError<H::Error>> {
        let Ok(permit) = self.shared.permit.clone().acquire_owned().await else {
            let mut closed = self.shared.closed.subscribe();
            drop(closed.wait_for(|done| *done).await);
            return Ok(());
        };
        self.shared.permit.close();

        let Some(handle) = self.shared.take_handle() else {
            self.shared.closed.send_replace(true);
            return Ok(());
        };

        let timeout = self.shared.close_timeout;
        info!(timeout_ms = timeout.as_millis() as u64, "Closing handle");
        // Runs to completion even if this caller stops waiting
        let shared = self.shared.clone();
        let task = self.shared.spawn_blocking(move || {
            let _closed = MarkClosed(&shared.closed);
            handle.close(timeout)
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HandleError::Close(e)),
            Ok(Err(join_err)) => Err(HandleError::Panicked(join_err)),
            Err(_) => Err(HandleError::CloseTimedOut(timeout)),
        };
        drop(permit);

        match &result {
            Ok(()) => {
                metrics::counter!(HANDLE_CLOSED, "outcome" => "closed").increment(1);
                info!("Handle closed");
            }
            Err(e) => {
                metrics::counter!(HANDLE_CLOSED, "outcome" => "error").increment(1);
                warn!("Failed to close handle: {e}");
            }
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.permit.is_closed()
    }

    pub fn close_timeout(&self) -> Duration {
        self.shared.close_timeout
    }
}
