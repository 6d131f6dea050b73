//! Server-pushed change events.
//!
//! The watcher keeps a dedicated connection blocked in `idle` and forwards
//! every `changed: <subsystem>` line as an [`Event`]. It alternates between
//! two states:
//!
//! * **waiting**: an `idle` command is outstanding. Stopping the watcher
//!   sends `noidle` on the same connection and the reply is decoded as usual.
//! * **recovering**: the connection broke. The watcher emits
//!   [`Event::Reconnecting`], pings until the pool has a fresh connection,
//!   then emits [`Event::Reconnect`] and goes back to waiting.
//!
//! Events are delivered on a bounded queue and dropped when it is full.
//! Consumers must treat every event, and especially a missed one, as
//! "something changed, fetch again".

use std::{fmt, time::Duration};

use futures_util::FutureExt;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, Result},
    pool::{Context, Pool},
};

/// A change notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A subsystem such as `player` or `database` changed.
    Changed(String),
    /// The connection broke; changes may be missed until [`Event::Reconnect`].
    Reconnecting,
    /// A new connection is up. Anything may have changed in between.
    Reconnect,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Changed(subsystem) => write!(f, "{subsystem}"),
            Event::Reconnecting => write!(f, "reconnecting"),
            Event::Reconnect => write!(f, "reconnect"),
        }
    }
}

/// Owner of the idle loop.
pub struct Watcher {
    pool: Pool,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("pool", &self.pool)
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Connects and starts watching the configured subsystems.
    ///
    /// Returns the watcher and the receiving end of its event queue, which
    /// holds up to `config.watch_queue` events.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Pool::connect`].
    pub async fn connect(config: &Config) -> Result<(Self, mpsc::Receiver<Event>)> {
        let pool = Pool::connect(config).await?;
        let (events, rx) = mpsc::channel(config.watch_queue);
        let stop = CancellationToken::new();

        let task = tokio::spawn(watch(
            pool.clone(),
            config.subsystems.clone(),
            stop.clone(),
            events,
        ));

        let watcher = Self {
            pool,
            stop,
            task: Mutex::new(Some(task)),
        };
        Ok((watcher, rx))
    }

    /// Stops the loop and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the loop does not exit within `timeout`.
    /// The connection is left open in that case, and calling `close` again
    /// resumes waiting.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.stop.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            let joined = tokio::time::timeout(timeout, handle).await.map_err(|_| {
                Error::deadline_exceeded(format!("watcher did not stop within {timeout:?}"))
            })?;
            task.take();
            joined?;
        }

        self.pool.close().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn watch(
    pool: Pool,
    subsystems: Vec<String>,
    stop: CancellationToken,
    events: mpsc::Sender<Event>,
) {
    let interval = pool.config().reconnect_interval;

    while !stop.is_cancelled() {
        let filter = subsystems.clone();
        let token = stop.clone();
        let result = pool
            .exec(&Context::background(), move |conn| {
                async move { conn.idle(&filter, &token).await }.boxed()
            })
            .await;

        match result {
            Ok(changes) => {
                for subsystem in changes {
                    emit(&events, Event::Changed(subsystem));
                }
            }
            Err(_) if stop.is_cancelled() => break,
            Err(e) if e.is_command_error() => {
                error!("server refused to idle: {e}");
                tokio::select! {
                    () = stop.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            Err(e) => {
                warn!("watcher lost its connection: {e}");
                if !recover(&pool, &stop, &events, interval).await {
                    break;
                }
            }
        }
    }

    debug!("watcher stopped");
}

/// Waits for a working connection. Returns `false` when stopped first.
async fn recover(
    pool: &Pool,
    stop: &CancellationToken,
    events: &mpsc::Sender<Event>,
    interval: Duration,
) -> bool {
    emit(events, Event::Reconnecting);

    // No deadline: the pool may still be dialing when this is queued.
    let ctx = Context::background();
    loop {
        let pinged = tokio::select! {
            () = stop.cancelled() => return false,
            pinged = pool.exec(&ctx, |conn| {
                async move { conn.ping().await }.boxed()
            }) => pinged,
        };

        match pinged {
            Ok(()) => break,
            Err(e) => debug!("watcher still disconnected: {e}"),
        }

        tokio::select! {
            () = stop.cancelled() => return false,
            () = tokio::time::sleep(interval) => {}
        }
    }

    info!("watcher reconnected");
    emit(events, Event::Reconnect);
    true
}

/// Queues `event` unless the queue is full.
fn emit(events: &mpsc::Sender<Event>, event: Event) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => debug!("event queue full, dropping {event}"),
        Err(TrySendError::Closed(event)) => trace!("nobody listens for {event}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_events() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, Event::Changed("player".to_owned()));
        emit(&tx, Event::Changed("mixer".to_owned()));

        assert_eq!(rx.recv().await, Some(Event::Changed("player".to_owned())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_display_as_names() {
        assert_eq!(Event::Changed("database".to_owned()).to_string(), "database");
        assert_eq!(Event::Reconnecting.to_string(), "reconnecting");
        assert_eq!(Event::Reconnect.to_string(), "reconnect");
    }
}
