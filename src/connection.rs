//! A single connection to the server.
//!
//! A [`Connection`] owns one transport stream and the version the server
//! announced in its greeting. It sends one command per line and decodes the
//! responses with the routines in [`protocol::response`](crate::protocol::response).
//!
//! # Deadlines
//!
//! Sockets have no native deadline in async Rust, so every read and write is
//! raced against the connection's [`Deadline`]. The deadline can be moved from
//! another task through a cloned handle; forcing it to "now" makes the pending
//! I/O fail with `DeadlineExceeded`. This is how callers interrupt a command
//! on a protocol that has no abort: the connection is discarded afterwards.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mpdhub::{connection::Connection, error::Result, protocol::{Command, Sentinel}};
//!
//! async fn example() -> Result<()> {
//!     let mut conn = Connection::dial("localhost:6600", Duration::from_secs(5)).await?;
//!     conn.write_command(&Command::new("status")).await?;
//!     let status = conn.read_map(Sentinel::Ok).await?;
//!     println!("state: {:?}", status.get("state"));
//!     Ok(())
//! }
//! ```

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::watch,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    protocol::{
        response::{self, Sentinel},
        Command, Output, Song,
    },
};

/// Transport streams a [`Connection`] can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A movable I/O deadline, shared between a connection and its owner.
#[derive(Clone, Debug)]
pub struct Deadline {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl Default for Deadline {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl Deadline {
    /// Sets the deadline; `None` means I/O may block indefinitely.
    pub fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    /// Forces pending and future I/O to fail until the deadline is reset.
    pub fn expire(&self) {
        self.set(Some(Instant::now()));
    }

    #[must_use]
    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Runs `io` until it completes or the deadline passes, whichever is
    /// first. Moving the deadline while `io` is pending takes effect
    /// immediately.
    pub async fn run<T, F>(&self, io: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut rx = self.tx.subscribe();
        tokio::pin!(io);

        loop {
            let at = *rx.borrow_and_update();
            let expired = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                result = &mut io => return result,
                () = expired => return Err(Error::deadline_exceeded("i/o deadline reached")),
                changed = rx.changed() => {
                    // The sender lives as long as `self`.
                    if changed.is_err() {
                        return Err(Error::internal("deadline sender dropped"));
                    }
                }
            }
        }
    }
}

/// Writes one request line and flushes it.
async fn write_line(
    writer: &mut WriteHalf<Box<dyn Stream>>,
    deadline: &Deadline,
    line: String,
) -> Result<()> {
    deadline
        .run(async move {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        })
        .await
}

/// Renders a command for logging without leaking the password.
fn redacted(command: &Command) -> String {
    if command.verb() == "password" {
        "password [REDACTED]".to_owned()
    } else {
        command.to_string()
    }
}

/// One transport stream plus the server's protocol version.
pub struct Connection {
    reader: BufReader<ReadHalf<Box<dyn Stream>>>,
    writer: WriteHalf<Box<dyn Stream>>,
    deadline: Deadline,
    version: String,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version)
            .field("deadline", &self.deadline.get())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dials `address` and reads the greeting, both within `timeout`.
    ///
    /// An address starting with `/` is the path of a local socket; anything
    /// else is `host:port`.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the server cannot be reached in time,
    /// or `DataLoss` when it does not greet like a music player daemon.
    pub async fn dial(address: &str, timeout: Duration) -> Result<Self> {
        let at = Instant::now() + timeout;

        let stream = tokio::time::timeout_at(at, open(address)).await??;
        let conn = Self::handshake(stream, Some(at)).await?;

        debug!("connected to {address} (protocol {})", conn.version);
        Ok(conn)
    }

    /// Wraps an established stream and reads the greeting.
    pub async fn handshake<S>(stream: S, deadline: Option<Instant>) -> Result<Self>
    where
        S: Stream,
    {
        let stream: Box<dyn Stream> = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(reader),
            writer,
            deadline: Deadline::default(),
            version: String::new(),
        };

        conn.deadline.set(deadline);
        conn.version = conn
            .deadline
            .run(response::read_greeting(&mut conn.reader))
            .await?;
        conn.deadline.set(None);

        Ok(conn)
    }

    /// The protocol version from the greeting, as sent.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The protocol version from the greeting.
    ///
    /// # Errors
    ///
    /// Returns `DataLoss` if the server sent something that is not semver.
    pub fn server_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version).map_err(Into::into)
    }

    /// The handle to move this connection's I/O deadline.
    #[must_use]
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Sends one command.
    pub async fn write_command(&mut self, command: &Command) -> Result<()> {
        trace!("> {}", redacted(command));
        write_line(&mut self.writer, &self.deadline, format!("{command}\n")).await
    }

    /// Sends several commands in a single write.
    pub async fn write_commands(&mut self, commands: &[Command]) -> Result<()> {
        let mut burst = String::new();
        for command in commands {
            trace!("> {}", redacted(command));
            burst.push_str(&command.to_string());
            burst.push('\n');
        }
        write_line(&mut self.writer, &self.deadline, burst).await
    }

    pub async fn read_line(&mut self) -> Result<String> {
        self.deadline
            .run(response::read_line(&mut self.reader))
            .await
    }

    pub async fn read_end(&mut self, sentinel: Sentinel) -> Result<()> {
        self.deadline
            .run(response::read_end(&mut self.reader, sentinel))
            .await
    }

    pub async fn read_map(&mut self, sentinel: Sentinel) -> Result<BTreeMap<String, String>> {
        self.deadline
            .run(response::read_map(&mut self.reader, sentinel))
            .await
    }

    pub async fn read_list(&mut self, sentinel: Sentinel, key: &str) -> Result<Vec<String>> {
        self.deadline
            .run(response::read_list(&mut self.reader, sentinel, key))
            .await
    }

    pub async fn read_song(&mut self, sentinel: Sentinel) -> Result<Song> {
        self.deadline
            .run(response::read_song(&mut self.reader, sentinel))
            .await
    }

    pub async fn read_songs(&mut self, sentinel: Sentinel) -> Result<Vec<Song>> {
        self.deadline
            .run(response::read_songs(&mut self.reader, sentinel))
            .await
    }

    pub async fn read_maps(
        &mut self,
        sentinel: Sentinel,
        record_key: &str,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        self.deadline
            .run(response::read_maps(&mut self.reader, sentinel, record_key))
            .await
    }

    pub async fn read_outputs(&mut self, sentinel: Sentinel) -> Result<Vec<Output>> {
        self.deadline
            .run(response::read_outputs(&mut self.reader, sentinel))
            .await
    }

    pub async fn read_binary(
        &mut self,
        sentinel: Sentinel,
    ) -> Result<(BTreeMap<String, String>, Vec<u8>)> {
        self.deadline
            .run(response::read_binary(&mut self.reader, sentinel))
            .await
    }

    /// Sends a command that answers with nothing but `OK`.
    pub async fn command(&mut self, command: &Command) -> Result<()> {
        self.write_command(command).await?;
        self.read_end(Sentinel::Ok).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.command(&Command::new("ping")).await
    }

    /// Blocks until one of `subsystems` changes and returns the changed
    /// subsystem names. An empty `subsystems` waits for any change.
    ///
    /// When `stop` fires first, `noidle` is sent on this connection and the
    /// reply is decoded as usual, so the connection stays usable.
    pub async fn idle(
        &mut self,
        subsystems: &[String],
        stop: &CancellationToken,
    ) -> Result<Vec<String>> {
        let command = subsystems
            .iter()
            .fold(Command::new("idle"), |command, subsystem| command.arg(subsystem));
        self.write_command(&command).await?;

        let reader = &mut self.reader;
        let writer = &mut self.writer;
        let deadline = &self.deadline;

        let changes = deadline.run(response::read_list(reader, Sentinel::Ok, "changed"));
        tokio::pin!(changes);

        tokio::select! {
            biased;

            result = &mut changes => return result,
            () = stop.cancelled() => {}
        }

        trace!("> noidle");
        write_line(writer, deadline, "noidle\n".to_owned()).await?;
        changes.await
    }

    /// Says goodbye to the server and shuts the stream down.
    pub async fn close(mut self) -> Result<()> {
        self.write_command(&Command::new("close")).await?;
        let writer = &mut self.writer;
        self.deadline
            .run(async move { writer.shutdown().await.map_err(Into::into) })
            .await
    }
}

async fn open(address: &str) -> Result<Box<dyn Stream>> {
    if address.starts_with('/') {
        return open_local(address).await;
    }

    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

#[cfg(unix)]
async fn open_local(path: &str) -> Result<Box<dyn Stream>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn open_local(path: &str) -> Result<Box<dyn Stream>> {
    Err(Error::invalid_argument(format!(
        "local socket {path} is not supported on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn reads_greeting_over_duplex() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"OK MPD 0.23.5\n").await.unwrap();

        let conn = Connection::handshake(client, None).await.unwrap();
        assert_eq!(conn.version(), "0.23.5");
        assert_eq!(conn.server_version().unwrap(), semver::Version::new(0, 23, 5));
    }

    #[tokio::test]
    async fn forced_deadline_interrupts_pending_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"OK MPD 0.23.5\n").await.unwrap();
        let mut conn = Connection::handshake(client, None).await.unwrap();

        let deadline = conn.deadline().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            deadline.expire();
        });

        // The server never answers; only the deadline can end this read.
        let err = conn.read_map(Sentinel::Ok).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        drop(server);
    }

    #[tokio::test]
    async fn idle_is_interrupted_with_noidle() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_rx, mut server_tx) = tokio::io::split(server);
        server_tx.write_all(b"OK MPD 0.23.5\n").await.unwrap();
        let mut conn = Connection::handshake(client, None).await.unwrap();

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_rx).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "idle \"player\"");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "noidle");
            server_tx.write_all(b"changed: player\nOK\n").await.unwrap();
        });

        let stop = CancellationToken::new();
        stop.cancel();
        let changes = conn.idle(&["player".to_owned()], &stop).await.unwrap();
        assert_eq!(changes, vec!["player".to_owned()]);
        server.await.unwrap();
    }
}
