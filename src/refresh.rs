//! Single-flight background jobs.
//!
//! A [`Coalescer`] runs at most one job at a time. A job is a list of items,
//! each offered to an ordered list of [`Worker`]s until one of them reports
//! a usable result. A request made while a job is running is rejected rather
//! than queued: callers retry on the next change, which will see the newer
//! state anyway.
//!
//! The single job slot is a one-permit semaphore. Shutting down cancels the
//! running job, reclaims the permit to prove the job is gone, and closes the
//! semaphore so nothing can start again.

use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One way of processing an item.
#[async_trait]
pub trait Worker<T>: Send + Sync {
    /// Returns `Ok(true)` when the item is handled and later workers can be
    /// skipped. Errors are logged and treated like `Ok(false)`.
    ///
    /// Long-running work should stop early once `cancel` fires.
    async fn process(&self, cancel: &CancellationToken, item: &T) -> Result<bool>;
}

type State = Arc<StdMutex<Option<watch::Sender<bool>>>>;

/// Runs jobs one at a time and tells whether one is running.
pub struct Coalescer<T> {
    workers: Arc<[Arc<dyn Worker<T>>]>,
    token: Arc<Semaphore>,
    shutdown: CancellationToken,
    state: State,
}

impl<T> fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("workers", &self.workers.len())
            .field("available", &self.token.available_permits())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(workers: Vec<Arc<dyn Worker<T>>>) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            workers: workers.into(),
            token: Arc::new(Semaphore::new(1)),
            shutdown: CancellationToken::new(),
            state: Arc::new(StdMutex::new(Some(state))),
        }
    }

    /// Follows the busy flag. The stream ends after shutdown.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(state) => state.subscribe(),
            None => watch::channel(false).1,
        }
    }

    /// Whether a job is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.token.is_closed() && self.token.available_permits() == 0
    }

    /// Starts a job over a copy of `items` and returns without waiting
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` after shutdown, or `AlreadyExists`
    /// while another job is running.
    pub fn request(&self, items: &[T]) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::failed_precondition("shut down"));
        }

        let permit = match Arc::clone(&self.token).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(Error::already_exists("already running"));
            }
            Err(TryAcquireError::Closed) => return Err(Error::failed_precondition("shut down")),
        };

        announce(&self.state, true);

        let items = items.to_vec();
        let workers = Arc::clone(&self.workers);
        let state = Arc::clone(&self.state);
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            debug!("processing {} items", items.len());

            'items: for item in &items {
                for worker in workers.iter() {
                    if cancel.is_cancelled() {
                        debug!("job cancelled");
                        break 'items;
                    }

                    match worker.process(&cancel, item).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => warn!("worker failed: {e}"),
                    }
                }
            }

            // Idle must be announced before the next job can announce busy.
            announce(&state, false);
            drop(permit);
        });

        Ok(())
    }

    /// Cancels the running job and disables the coalescer for good.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the running job does not stop within
    /// `timeout`. The coalescer stays usable for another `shutdown` attempt
    /// in that case; new requests are rejected either way.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shutdown.cancel();

        match tokio::time::timeout(timeout, Arc::clone(&self.token).acquire_owned()).await {
            Err(_) => Err(Error::deadline_exceeded(format!(
                "job did not stop within {timeout:?}"
            ))),
            // Already shut down.
            Ok(Err(_)) => Ok(()),
            Ok(Ok(permit)) => {
                permit.forget();
                self.token.close();
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                Ok(())
            }
        }
    }
}

fn announce(state: &State, busy: bool) {
    if let Some(state) = &*state.lock().unwrap_or_else(PoisonError::into_inner) {
        state.send_replace(busy);
    }
}
