//! The command surface over a [`Pool`].
//!
//! Every method takes a [`Context`] that bounds its I/O and may cancel it.
//! Server-reported failures come back as errors for which
//! [`Error::is_command_error`](crate::error::Error::is_command_error) holds;
//! the connection stays usable after those. Any other error means the
//! connection was replaced in the background.
//!
//! Several commands can be sent as one uninterruptible batch with a
//! [`CommandList`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mpdhub::{client::Client, config::Config, error::Result, pool::Context, protocol::Command};
//!
//! async fn example() -> Result<()> {
//!     let client = Client::connect(&Config::default()).await?;
//!     let ctx = Context::with_timeout(Duration::from_secs(1));
//!
//!     let status = client.status(&ctx).await?;
//!     println!("state: {:?}", status.get("state"));
//!
//!     let mut list = client.command_list();
//!     list.add(Command::new("clear"))
//!         .add(Command::new("add").arg("music/album"));
//!     list.end(&ctx).await
//! }
//! ```

use std::{collections::BTreeMap, mem, sync::Mutex as StdMutex};

use futures_util::FutureExt;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    config::Config,
    error::{ErrorKind, Result},
    pool::{Context, Pool},
    protocol::{Command, CommandError, Output, ParseError, Sentinel, Song},
};

/// Commands that reply with nothing but `OK`.
macro_rules! simple {
    ($(#[$attr:meta])* $name:ident => $verb:literal) => {
        $(#[$attr])*
        pub async fn $name(&self, ctx: &Context) -> Result<()> {
            self.run(ctx, Command::new($verb)).await
        }
    };
    ($(#[$attr:meta])* $name:ident($arg:ident: $ty:ty) => $verb:literal) => {
        $(#[$attr])*
        pub async fn $name(&self, ctx: &Context, $arg: $ty) -> Result<()> {
            self.run(ctx, Command::new($verb).arg($arg)).await
        }
    };
}

/// A client sharing one pooled connection.
pub struct Client {
    pool: Pool,
    healthcheck: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

impl Client {
    /// Connects and, when configured, starts pinging the server at the
    /// health check interval.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Pool::connect`].
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = Pool::connect(config).await?;

        let healthcheck = config
            .healthcheck_interval
            .map(|interval| tokio::spawn(healthcheck(pool.clone(), interval)));

        Ok(Self {
            pool,
            healthcheck: StdMutex::new(healthcheck),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Protocol version of the current connection.
    #[must_use]
    pub fn version(&self) -> String {
        self.pool.version()
    }

    /// Stops the health check and closes the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if saying goodbye to the server fails.
    pub async fn close(&self) -> Result<()> {
        let healthcheck = self.healthcheck.lock()?.take();
        if let Some(task) = healthcheck {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    return Err(e.into());
                }
            }
        }

        self.pool.close().await
    }

    /// Starts a batch of commands.
    #[must_use]
    pub fn command_list(&self) -> CommandList<'_> {
        CommandList::new(&self.pool)
    }

    /// Sends `command` and expects nothing but `OK`.
    ///
    /// # Errors
    ///
    /// Returns the server's error if it rejects the command, or a transport
    /// error.
    pub async fn run(&self, ctx: &Context, command: Command) -> Result<()> {
        self.pool
            .exec(ctx, move |conn| {
                async move { conn.command(&command).await }.boxed()
            })
            .await
    }

    /// Sends `command` and decodes its reply as one map.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run), or `DataLoss` when the reply is not a map.
    pub async fn map(&self, ctx: &Context, command: Command) -> Result<BTreeMap<String, String>> {
        self.pool
            .exec(ctx, move |conn| {
                async move {
                    conn.write_command(&command).await?;
                    conn.read_map(Sentinel::Ok).await
                }
                .boxed()
            })
            .await
    }

    async fn songs(&self, ctx: &Context, command: Command) -> Result<Vec<Song>> {
        self.pool
            .exec(ctx, move |conn| {
                async move {
                    conn.write_command(&command).await?;
                    conn.read_songs(Sentinel::Ok).await
                }
                .boxed()
            })
            .await
    }

    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.pool
            .exec(ctx, |conn| async move { conn.ping().await }.boxed())
            .await
    }

    /// Player state: volume, playback state, song position and more.
    ///
    /// Values are returned as sent; numeric fields are not interpreted.
    pub async fn status(&self, ctx: &Context) -> Result<BTreeMap<String, String>> {
        self.map(ctx, Command::new("status")).await
    }

    /// Database and uptime statistics.
    pub async fn stats(&self, ctx: &Context) -> Result<BTreeMap<String, String>> {
        self.map(ctx, Command::new("stats")).await
    }

    /// Server configuration. Only answered over local sockets.
    pub async fn config(&self, ctx: &Context) -> Result<BTreeMap<String, String>> {
        self.map(ctx, Command::new("config")).await
    }

    pub async fn replay_gain_status(&self, ctx: &Context) -> Result<BTreeMap<String, String>> {
        self.map(ctx, Command::new("replay_gain_status")).await
    }

    /// The current song; empty when nothing is queued.
    pub async fn current_song(&self, ctx: &Context) -> Result<Song> {
        self.pool
            .exec(ctx, |conn| {
                async move {
                    conn.write_command(&Command::new("currentsong")).await?;
                    conn.read_song(Sentinel::Ok).await
                }
                .boxed()
            })
            .await
    }

    /// Every song in the queue.
    pub async fn playlist_info(&self, ctx: &Context) -> Result<Vec<Song>> {
        self.songs(ctx, Command::new("playlistinfo")).await
    }

    /// Every song below `path`, or in the whole database.
    pub async fn list_all_info(&self, ctx: &Context, path: Option<&str>) -> Result<Vec<Song>> {
        let command = match path {
            Some(path) => Command::new("listallinfo").arg(path),
            None => Command::new("listallinfo"),
        };
        self.songs(ctx, command).await
    }

    /// The songs of a stored playlist.
    pub async fn list_playlist_info(&self, ctx: &Context, name: &str) -> Result<Vec<Song>> {
        self.songs(ctx, Command::new("listplaylistinfo").arg(name))
            .await
    }

    /// Stored playlists with their modification time.
    pub async fn list_playlists(&self, ctx: &Context) -> Result<Vec<BTreeMap<String, String>>> {
        self.pool
            .exec(ctx, |conn| {
                async move {
                    conn.write_command(&Command::new("listplaylists")).await?;
                    conn.read_maps(Sentinel::Ok, "playlist").await
                }
                .boxed()
            })
            .await
    }

    pub async fn outputs(&self, ctx: &Context) -> Result<Vec<Output>> {
        self.pool
            .exec(ctx, |conn| {
                async move {
                    conn.write_command(&Command::new("outputs")).await?;
                    conn.read_outputs(Sentinel::Ok).await
                }
                .boxed()
            })
            .await
    }

    simple!(enable_output(id: u32) => "enableoutput");
    simple!(disable_output(id: u32) => "disableoutput");

    /// Sets a runtime attribute of an output.
    pub async fn output_set(&self, ctx: &Context, id: u32, name: &str, value: &str) -> Result<()> {
        self.run(ctx, Command::new("outputset").arg(id).arg(name).arg(value))
            .await
    }

    /// Starts playback, at queue position `pos` if given.
    pub async fn play(&self, ctx: &Context, pos: Option<u32>) -> Result<()> {
        let command = match pos {
            Some(pos) => Command::new("play").arg(pos),
            None => Command::new("play"),
        };
        self.run(ctx, command).await
    }

    simple!(
        /// Pauses (`true`) or resumes (`false`) playback.
        pause(paused: bool) => "pause"
    );
    simple!(stop => "stop");
    simple!(next => "next");
    simple!(previous => "previous");
    simple!(
        /// Seeks to an absolute position, in seconds, in the current song.
        seek_cur(seconds: f64) => "seekcur"
    );
    simple!(set_vol(volume: u32) => "setvol");
    simple!(random(on: bool) => "random");
    simple!(repeat(on: bool) => "repeat");
    simple!(single(on: bool) => "single");
    simple!(consume(on: bool) => "consume");
    simple!(crossfade(seconds: u32) => "crossfade");
    simple!(
        /// One of `off`, `track`, `album` or `auto`.
        replay_gain_mode(mode: &str) => "replay_gain_mode"
    );

    /// Starts a database update below `path`, or of everything, and returns
    /// the job id.
    pub async fn update(&self, ctx: &Context, path: Option<&str>) -> Result<u32> {
        self.start_update(ctx, "update", path).await
    }

    /// Like [`update`](Self::update), but rereads unmodified files too.
    pub async fn rescan(&self, ctx: &Context, path: Option<&str>) -> Result<u32> {
        self.start_update(ctx, "rescan", path).await
    }

    async fn start_update(&self, ctx: &Context, verb: &str, path: Option<&str>) -> Result<u32> {
        let command = match path {
            Some(path) => Command::new(verb).arg(path),
            None => Command::new(verb),
        };

        let reply = self.map(ctx, command).await?;
        let job = reply.get("updating_db").ok_or_else(|| ParseError::UnexpectedKey {
            expected: "updating_db".to_owned(),
            found: reply.keys().next().cloned().unwrap_or_default(),
        })?;

        job.parse().map_err(|_| {
            ParseError::InvalidValue {
                key: "updating_db".to_owned(),
                value: job.clone(),
            }
            .into()
        })
    }

    /// The cover file in the directory of `uri`. Empty when there is none.
    pub async fn album_art(&self, ctx: &Context, uri: &str) -> Result<Vec<u8>> {
        self.picture(ctx, "albumart", uri).await
    }

    /// The picture embedded in the tags of `uri`. Empty when there is none.
    pub async fn read_picture(&self, ctx: &Context, uri: &str) -> Result<Vec<u8>> {
        self.picture(ctx, "readpicture", uri).await
    }

    /// Fetches a picture chunk by chunk on one connection.
    async fn picture(&self, ctx: &Context, verb: &'static str, uri: &str) -> Result<Vec<u8>> {
        let uri = uri.to_owned();

        let result = self
            .pool
            .exec(ctx, move |conn| {
                async move {
                    let mut data = Vec::new();
                    loop {
                        let command = Command::new(verb).arg(uri.as_str()).arg(data.len());
                        conn.write_command(&command).await?;
                        let (reply, chunk) = conn.read_binary(Sentinel::Ok).await?;

                        let Some(size) = reply.get("size") else {
                            return Ok(data);
                        };
                        let size: usize = size.parse().map_err(|_| ParseError::InvalidValue {
                            key: "size".to_owned(),
                            value: size.clone(),
                        })?;

                        if chunk.is_empty() {
                            break;
                        }
                        data.extend_from_slice(&chunk);
                        if data.len() >= size {
                            break;
                        }
                    }

                    trace!("read {} bytes of {verb} for {uri}", data.len());
                    Ok(data)
                }
                .boxed()
            })
            .await;

        match result {
            Err(e) if e.command_error().is_some_and(|ack| ack.code == CommandError::NO_EXIST) => {
                Ok(Vec::new())
            }
            result => result,
        }
    }
}

/// Pings through the pool so a dead connection is replaced early.
async fn healthcheck(pool: Pool, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let ctx = Context::with_timeout(interval);
        match pool
            .exec(&ctx, |conn| async move { conn.ping().await }.boxed())
            .await
        {
            Ok(()) => trace!("health check passed"),
            Err(e) if e.kind == ErrorKind::FailedPrecondition => break,
            Err(e) => warn!("health check failed: {e}"),
        }
    }
}

/// A batch of commands run back to back without interleaving.
///
/// The batch is sent as a single write between `command_list_ok_begin` and
/// `command_list_end`. Both buffers are emptied by every call to
/// [`end`](Self::end), whatever its outcome.
#[derive(Debug)]
pub struct CommandList<'a> {
    pool: &'a Pool,
    commands: Vec<Command>,
    checks: Vec<Sentinel>,
}

impl<'a> CommandList<'a> {
    #[must_use]
    pub fn new(pool: &'a Pool) -> Self {
        Self {
            pool,
            commands: Vec::new(),
            checks: Vec::new(),
        }
    }

    /// Appends a command that answers with nothing but its `list_OK`.
    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self.checks.push(Sentinel::ListOk);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Runs the batch.
    ///
    /// # Errors
    ///
    /// Returns the first failure. When a command is rejected, the server
    /// skips the rest of the batch and its error names the failing
    /// position.
    pub async fn end(&mut self, ctx: &Context) -> Result<()> {
        let commands = mem::take(&mut self.commands);
        let checks = mem::take(&mut self.checks);
        if commands.is_empty() {
            return Ok(());
        }

        self.pool
            .exec(ctx, move |conn| {
                async move {
                    let mut burst = Vec::with_capacity(commands.len() + 2);
                    burst.push(Command::new("command_list_ok_begin"));
                    burst.extend(commands);
                    burst.push(Command::new("command_list_end"));
                    conn.write_commands(&burst).await?;

                    for check in checks {
                        conn.read_end(check).await?;
                    }
                    conn.read_end(Sentinel::Ok).await
                }
                .boxed()
            })
            .await
    }
}
