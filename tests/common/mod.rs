#![allow(dead_code)]
//! A scripted music player daemon for integration tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};

use mpdhub::config::Config;

pub const GREETING: &str = "OK MPD 0.23.5\n";

/// Sent through the change channel to drop idling connections.
const DISCONNECT: &str = "\0disconnect";

/// What the server answers to one command.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Response lines, each ending in a newline. The sentinel is appended.
    Ok(String),
    /// `ACK [<code>@<index>] {<verb>} <message>`
    Ack(u32, String),
    /// Written as is, without a sentinel.
    Raw(Vec<u8>),
    /// Never answers.
    Hang,
    /// Drops the connection.
    Close,
}

type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

pub struct MockServer {
    pub address: String,
    received: Arc<Mutex<Vec<String>>>,
    executed: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    changes: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    /// Starts a server that answers every command with a plain `OK`.
    pub async fn start() -> Self {
        Self::with_script(|_| Reply::Ok(String::new())).await
    }

    pub async fn with_script<F>(script: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let script: Script = Arc::new(script);
        let received = Arc::new(Mutex::new(Vec::new()));
        let executed = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (changes, _) = broadcast::channel(16);

        let task = tokio::spawn({
            let received = Arc::clone(&received);
            let executed = Arc::clone(&executed);
            let connections = Arc::clone(&connections);
            let changes = changes.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let session = Session {
                        script: Arc::clone(&script),
                        received: Arc::clone(&received),
                        executed: Arc::clone(&executed),
                        changes: changes.subscribe(),
                    };
                    tokio::spawn(session.serve(stream));
                }
            }
        });

        Self {
            address,
            received,
            executed,
            connections,
            changes,
            task,
        }
    }

    /// A configuration for this server with short intervals.
    pub fn config(&self) -> Config {
        Config {
            reconnect_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
            ..Config::with_address(&self.address)
        }
    }

    /// Every line received, in order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Commands handed to the script, in order. Lines the server handles
    /// itself and commands skipped in a failed command list are missing.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Number of accepted connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wakes every idling connection with `changed: <subsystem>`.
    pub fn change(&self, subsystem: &str) {
        let _ = self.changes.send(subsystem.to_owned());
    }

    /// Drops every idling connection.
    pub fn disconnect_idle(&self) {
        let _ = self.changes.send(DISCONNECT.to_owned());
    }

    /// Waits until `line` was received.
    pub async fn wait_for(&self, line: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.received().iter().any(|received| received == line) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never received {line:?}: {:?}", self.received()));
    }
}

struct Session {
    script: Script,
    received: Arc<Mutex<Vec<String>>>,
    executed: Arc<Mutex<Vec<String>>>,
    changes: broadcast::Receiver<String>,
}

enum Outcome {
    Continue,
    Hang,
    Close,
}

impl Session {
    async fn serve(mut self, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        if writer.write_all(GREETING.as_bytes()).await.is_err() {
            return;
        }

        while let Ok(Some(line)) = lines.next_line().await {
            self.received.lock().unwrap().push(line.clone());
            let mut out = Vec::new();

            let outcome = if line == "close" {
                Outcome::Close
            } else if line == "noidle" {
                // Outside of idle, the server ignores it.
                Outcome::Continue
            } else if line.starts_with("idle") {
                // Answer a change or a `noidle`, whichever comes first.
                tokio::select! {
                    changed = self.changes.recv() => match changed {
                        Ok(subsystem) if subsystem == DISCONNECT => Outcome::Close,
                        Ok(subsystem) => {
                            out.extend(format!("changed: {subsystem}\nOK\n").bytes());
                            Outcome::Continue
                        }
                        Err(_) => {
                            out.extend(b"OK\n");
                            Outcome::Continue
                        }
                    },
                    next = lines.next_line() => match next {
                        Ok(Some(next)) => {
                            self.received.lock().unwrap().push(next);
                            out.extend(b"OK\n");
                            Outcome::Continue
                        }
                        _ => Outcome::Close,
                    }
                }
            } else if line == "command_list_ok_begin" {
                let mut batch = Vec::new();
                loop {
                    match lines.next_line().await {
                        Ok(Some(next)) if next == "command_list_end" => {
                            self.received.lock().unwrap().push(next);
                            break;
                        }
                        Ok(Some(next)) => {
                            self.received.lock().unwrap().push(next.clone());
                            batch.push(next);
                        }
                        _ => return,
                    }
                }
                self.run_batch(&batch, &mut out)
            } else {
                self.run(&line, None, &mut out)
            };

            if !out.is_empty() && writer.write_all(&out).await.is_err() {
                return;
            }
            match outcome {
                Outcome::Continue => {}
                Outcome::Hang => std::future::pending::<()>().await,
                Outcome::Close => return,
            }
        }
    }

    /// Runs one command; `index` is its position inside a command list.
    fn run(&self, line: &str, index: Option<usize>, out: &mut Vec<u8>) -> Outcome {
        self.executed.lock().unwrap().push(line.to_owned());
        let verb = line.split_whitespace().next().unwrap_or_default();

        match (self.script)(line) {
            Reply::Ok(body) => {
                out.extend(body.bytes());
                out.extend(if index.is_some() { &b"list_OK\n"[..] } else { &b"OK\n"[..] });
                Outcome::Continue
            }
            Reply::Ack(code, message) => {
                let index = index.unwrap_or_default();
                out.extend(format!("ACK [{code}@{index}] {{{verb}}} {message}\n").bytes());
                Outcome::Continue
            }
            Reply::Raw(bytes) => {
                out.extend(bytes);
                Outcome::Continue
            }
            Reply::Hang => Outcome::Hang,
            Reply::Close => Outcome::Close,
        }
    }

    /// The server stops at the first failing command of a list.
    fn run_batch(&self, batch: &[String], out: &mut Vec<u8>) -> Outcome {
        for (index, line) in batch.iter().enumerate() {
            let before = out.len();
            match self.run(line, Some(index), out) {
                Outcome::Continue if out[before..].starts_with(b"ACK") => {
                    return Outcome::Continue;
                }
                Outcome::Continue => {}
                other => return other,
            }
        }
        out.extend(b"OK\n");
        Outcome::Continue
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
