//! A single pooled connection with transparent reconnection.
//!
//! The pool holds exactly one [`Connection`] behind a single slot. The slot
//! is both the mutual exclusion gate and the borrowed resource: whoever holds
//! it owns the connection, and it is empty exactly while a command executes
//! or while a reconnection is in progress.
//!
//! # Error handling
//!
//! After [`Pool::exec`] completes:
//! * success or a server-reported [`CommandError`] puts the connection back
//! * any other error discards the connection, returns the error to the
//!   caller, and keeps the slot while a background task dials a new
//!   connection, retrying at a fixed interval until it succeeds
//!
//! [`CommandError`]: crate::protocol::CommandError
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use futures_util::FutureExt;
//! use mpdhub::{config::Config, error::Result, pool::{Context, Pool}, protocol::Command};
//!
//! async fn example(config: &Config) -> Result<()> {
//!     let pool = Pool::connect(config).await?;
//!     pool.exec(&Context::with_timeout(Duration::from_secs(1)), |conn| {
//!         async move { conn.command(&Command::new("next")).await }.boxed()
//!     })
//!     .await
//! }
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    connection::Connection,
    error::{Error, ErrorKind, Result},
    protocol::Command,
};

/// Deadline and cancellation of one call.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// No deadline and no cancellation.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Binds the call to `cancel`.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes when the deadline passes; never without one.
    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

struct Inner {
    config: Config,
    slot: Slot,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reconnector: StdMutex<Option<JoinHandle<()>>>,
    version: StdMutex<String>,
    dials: AtomicU64,
}

/// Serializes every command onto one connection.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.inner.config.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Dials the first connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server cannot be reached, or the
    /// server's [`CommandError`](crate::protocol::CommandError) if it rejects
    /// the password.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let inner = Inner {
            config: config.clone(),
            slot: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reconnector: StdMutex::new(None),
            version: StdMutex::new(String::new()),
            dials: AtomicU64::new(0),
        };

        let conn = inner.dial().await?;
        *inner.slot.lock().await = Some(conn);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Runs `f` with exclusive use of the connection.
    ///
    /// The context's deadline bounds every I/O operation `f` performs.
    /// Cancelling the context forces that deadline to expire, so `f` fails on
    /// its pending or next I/O; the connection is then replaced.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when the pool is closed, `Cancelled` or
    /// `DeadlineExceeded` when the context ends before the connection is
    /// available, otherwise whatever `f` returns.
    pub async fn exec<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    {
        if self.is_closed() {
            return Err(Error::failed_precondition("connection pool is closed"));
        }

        // The slot stays locked while a reconnection is in progress.
        let mut slot = tokio::select! {
            slot = Arc::clone(&self.inner.slot).lock_owned() => slot,
            () = ctx.cancel.cancelled() => {
                return Err(Error::cancelled("cancelled while waiting for the connection"));
            }
            () = ctx.expired() => {
                return Err(Error::deadline_exceeded(
                    "deadline exceeded while waiting for the connection",
                ));
            }
        };
        let Some(conn) = slot.as_mut() else {
            return Err(Error::failed_precondition("connection pool is closed"));
        };

        let deadline = conn.deadline().clone();
        deadline.set(ctx.deadline);

        let result = {
            let mut call = f(conn);
            tokio::select! {
                biased;

                result = &mut call => result,
                () = ctx.cancel.cancelled() => {
                    deadline.expire();
                    call.await
                }
            }
        };

        match result {
            Ok(value) => {
                deadline.set(None);
                Ok(value)
            }
            Err(e) if e.is_command_error() => {
                deadline.set(None);
                Err(e)
            }
            Err(e) => {
                warn!("discarding connection to {}: {e}", self.inner.config.address);
                slot.take();
                self.reconnect(slot)?;

                if ctx.cancel.is_cancelled() && e.kind == ErrorKind::DeadlineExceeded {
                    return Err(Error::cancelled(format!("command cancelled: {e}")));
                }
                Err(e)
            }
        }
    }

    /// Spawns the loop that refills `slot`, keeping it locked until done.
    fn reconnect(&self, mut slot: OwnedMutexGuard<Option<Connection>>) -> Result<()> {
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                let dialed = tokio::select! {
                    () = inner.shutdown.cancelled() => break,
                    dialed = inner.dial() => dialed,
                };

                match dialed {
                    Ok(conn) => {
                        info!("reconnected to {}", inner.config.address);
                        *slot = Some(conn);
                        break;
                    }
                    Err(e) => warn!("reconnecting to {} failed: {e}", inner.config.address),
                }

                tokio::select! {
                    () = inner.shutdown.cancelled() => break,
                    () = tokio::time::sleep(inner.config.reconnect_interval) => {}
                }
            }
        });

        // Any previous reconnector has released the slot, so it is done.
        *self.inner.reconnector.lock()? = Some(task);
        Ok(())
    }

    /// Closes the pool for good.
    ///
    /// Stops a pending reconnection, waits for the command in flight, and
    /// says goodbye to the server. Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let reconnector = self.inner.reconnector.lock()?.take();
        if let Some(task) = reconnector {
            task.await?;
        }

        let conn = self.inner.slot.lock().await.take();
        match conn {
            Some(conn) => {
                debug!("closing connection to {}", self.inner.config.address);
                conn.close().await
            }
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Protocol version of the most recent connection.
    #[must_use]
    pub fn version(&self) -> String {
        self.inner
            .version
            .lock()
            .map(|version| version.clone())
            .unwrap_or_default()
    }

    /// Number of connections dialed so far, the first one included.
    #[must_use]
    pub fn dials(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Inner {
    /// Dials, authenticates and configures a new connection.
    async fn dial(&self) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let config = &self.config;
        let mut conn = Connection::dial(&config.address, config.connect_timeout).await?;
        conn.deadline()
            .set(Some(Instant::now() + config.connect_timeout));

        if let Some(password) = &config.password {
            conn.command(&Command::new("password").arg(password)).await?;
        }

        if let Some(limit) = config.binary_limit {
            match conn.command(&Command::new("binarylimit").arg(limit)).await {
                Ok(()) => {}
                Err(e) if e.is_command_error() => {
                    warn!("server does not accept binary limit {limit}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        conn.deadline().set(None);
        *self.version.lock()? = conn.version().to_owned();
        Ok(conn)
    }
}
