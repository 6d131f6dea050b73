//! Response decoding.
//!
//! Every routine reads from any [`AsyncBufRead`] and is parameterized by the
//! [`Sentinel`] that terminates the response, so the same code decodes both
//! direct replies (`OK`) and items of a command list (`list_OK`).
//!
//! Decoding rules shared by all routines:
//!
//! * an `ACK` line short-circuits into a [`CommandError`] before any other
//!   rule applies
//! * a line that is neither `key: value` nor the expected sentinel is a
//!   [`ParseError`]
//! * end of stream is a transport error
//!
//! A [`ParseError`] means the reader is no longer aligned with the server's
//! responses; callers must discard the connection.

use std::{collections::BTreeMap, sync::LazyLock};

use regex_lite::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::tags::{Output, Song};
use crate::error::{Error, Result};

/// Prefix of every error response line.
pub const ACK: &str = "ACK";

/// Terminator of a complete response.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Sentinel {
    /// `OK`: end of a direct response or of a whole command list.
    #[default]
    Ok,
    /// `list_OK`: end of one command inside a command list.
    ListOk,
}

impl Sentinel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Ok => "OK",
            Sentinel::ListOk => "list_OK",
        }
    }
}

/// An error reported by the server in an `ACK` line.
///
/// The connection remains usable after the server reports one.
#[derive(Clone, Debug, Error, Eq, PartialEq, Hash)]
#[error("{command}: {message} (code {code}, argument {index})")]
pub struct CommandError {
    /// Protocol error number, e.g. 50 for "no such file".
    pub code: u32,
    /// Position of the failing command within a command list.
    pub index: usize,
    /// Name of the command that failed. May be empty.
    pub command: String,
    pub message: String,
}

impl CommandError {
    /// `ACK_ERROR_NO_EXIST`
    pub const NO_EXIST: u32 = 50;

    /// Parses an `ACK [<code>@<index>] {<command>} <message>` line.
    pub fn parse(line: &str) -> std::result::Result<Self, ParseError> {
        static GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^ACK \[([0-9]+)@([0-9]+)\] \{([^}]*)\} ?(.*)$")
                .expect("error line grammar is a valid regex")
        });

        let malformed = || ParseError::MalformedAck(line.to_owned());
        let captures = GRAMMAR.captures(line).ok_or_else(malformed)?;

        let code = captures[1].parse().map_err(|_| malformed())?;
        let index = captures[2].parse().map_err(|_| malformed())?;

        Ok(Self {
            code,
            index,
            command: captures[3].to_owned(),
            message: captures[4].to_owned(),
        })
    }
}

/// The response did not have the expected shape.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("unexpected line {0:?}")]
    UnexpectedLine(String),

    #[error("unexpected key {found:?}, expected {expected:?}")]
    UnexpectedKey { expected: String, found: String },

    #[error("invalid value {value:?} for {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("malformed error line {0:?}")]
    MalformedAck(String),

    #[error("missing newline after {0} bytes of binary data")]
    BinaryTerminator(u64),

    #[error("response line is not valid utf-8")]
    Utf8,

    #[error("unexpected greeting {0:?}")]
    Greeting(String),
}

/// One classified response line.
enum Line {
    End,
    Pair(String, String),
}

/// Reads one line without its terminating newline.
///
/// # Errors
///
/// Returns `Unavailable` when the stream ends, even halfway a line.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Err(Error::unavailable("connection closed by server"));
    }
    buf.pop();

    let line = String::from_utf8(buf).map_err(|_| ParseError::Utf8)?;
    trace!("< {line}");
    Ok(line)
}

/// Reads and classifies the next line.
async fn next<R>(reader: &mut R, sentinel: Sentinel) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    classify(line, sentinel)
}

fn classify(line: String, sentinel: Sentinel) -> Result<Line> {
    if line == sentinel.as_str() {
        return Ok(Line::End);
    }

    if line.starts_with(ACK) {
        return Err(CommandError::parse(&line)?.into());
    }

    if let Some((key, value)) = line.split_once(": ") {
        return Ok(Line::Pair(key.to_owned(), value.to_owned()));
    }

    // An empty value may come without the separating space.
    if let Some(key) = line.strip_suffix(':') {
        if !key.is_empty() && !key.contains(' ') {
            return Ok(Line::Pair(key.to_owned(), String::new()));
        }
    }

    Err(ParseError::UnexpectedLine(line).into())
}

/// Reads the server greeting `OK MPD <version>` and returns the version.
pub async fn read_greeting<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    match line.strip_prefix("OK MPD ") {
        Some(version) if !version.is_empty() => Ok(version.to_owned()),
        _ => Err(ParseError::Greeting(line).into()),
    }
}

/// Expects nothing but the sentinel.
pub async fn read_end<R>(reader: &mut R, sentinel: Sentinel) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match next(reader, sentinel).await? {
        Line::End => Ok(()),
        Line::Pair(key, value) => Err(ParseError::UnexpectedLine(format!("{key}: {value}")).into()),
    }
}

/// Reads `key: value` lines into a map; the last value of a key wins.
pub async fn read_map<R>(reader: &mut R, sentinel: Sentinel) -> Result<BTreeMap<String, String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut map = BTreeMap::new();
    loop {
        match next(reader, sentinel).await? {
            Line::End => return Ok(map),
            Line::Pair(key, value) => {
                map.insert(key, value);
            }
        }
    }
}

/// Reads lines that all share `key` and returns their values in order.
pub async fn read_list<R>(reader: &mut R, sentinel: Sentinel, key: &str) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut list = Vec::new();
    loop {
        match next(reader, sentinel).await? {
            Line::End => return Ok(list),
            Line::Pair(found, value) => {
                if found != key {
                    return Err(ParseError::UnexpectedKey {
                        expected: key.to_owned(),
                        found,
                    }
                    .into());
                }
                list.push(value);
            }
        }
    }
}

/// Reads a single song; repeated keys accumulate.
pub async fn read_song<R>(reader: &mut R, sentinel: Sentinel) -> Result<Song>
where
    R: AsyncBufRead + Unpin,
{
    let mut song = Song::new();
    loop {
        match next(reader, sentinel).await? {
            Line::End => return Ok(song),
            Line::Pair(key, value) => song.push(key, value),
        }
    }
}

/// Reads a sequence of songs.
///
/// A `file` line starts a new song. `directory` and `playlist` lines end the
/// current song, and the lines that follow them are skipped until the next
/// `file` line.
pub async fn read_songs<R>(reader: &mut R, sentinel: Sentinel) -> Result<Vec<Song>>
where
    R: AsyncBufRead + Unpin,
{
    let mut songs = Vec::new();
    let mut current: Option<Song> = None;
    loop {
        match next(reader, sentinel).await? {
            Line::End => {
                songs.extend(current);
                return Ok(songs);
            }
            Line::Pair(key, value) => match key.as_str() {
                Song::FILE => {
                    songs.extend(current.take());
                    let mut song = Song::new();
                    song.push(key, value);
                    current = Some(song);
                }
                "directory" | "playlist" => songs.extend(current.take()),
                _ => {
                    if let Some(song) = current.as_mut() {
                        song.push(key, value);
                    }
                }
            },
        }
    }
}

/// Reads a list of records, each starting with `record_key`.
pub async fn read_maps<R>(
    reader: &mut R,
    sentinel: Sentinel,
    record_key: &str,
) -> Result<Vec<BTreeMap<String, String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut maps = Vec::new();
    let mut current: Option<BTreeMap<String, String>> = None;
    loop {
        match next(reader, sentinel).await? {
            Line::End => {
                maps.extend(current);
                return Ok(maps);
            }
            Line::Pair(key, value) => {
                if key == record_key {
                    maps.extend(current.take());
                    current = Some(BTreeMap::from([(key, value)]));
                } else if let Some(map) = current.as_mut() {
                    map.insert(key, value);
                } else {
                    return Err(ParseError::UnexpectedKey {
                        expected: record_key.to_owned(),
                        found: key,
                    }
                    .into());
                }
            }
        }
    }
}

/// Reads the `outputs` response into typed records.
pub async fn read_outputs<R>(reader: &mut R, sentinel: Sentinel) -> Result<Vec<Output>>
where
    R: AsyncBufRead + Unpin,
{
    const RECORD_KEY: &str = "outputid";

    let mut outputs = Vec::new();
    let mut current: Option<Output> = None;
    loop {
        let (key, value) = match next(reader, sentinel).await? {
            Line::End => {
                outputs.extend(current);
                return Ok(outputs);
            }
            Line::Pair(key, value) => (key, value),
        };
        let invalid = |key: &str, value: &str| ParseError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };

        if key == RECORD_KEY {
            outputs.extend(current.take());
            let id = value.parse().map_err(|_| invalid(&key, &value))?;
            current = Some(Output {
                id,
                ..Output::default()
            });
            continue;
        }

        let Some(output) = current.as_mut() else {
            return Err(ParseError::UnexpectedKey {
                expected: RECORD_KEY.to_owned(),
                found: key,
            }
            .into());
        };
        match key.as_str() {
            "outputname" => output.name = value,
            "plugin" => output.plugin = value,
            "outputenabled" => {
                output.enabled = match value.as_str() {
                    "1" => true,
                    "0" => false,
                    _ => return Err(invalid(&key, &value).into()),
                };
            }
            "attribute" => {
                let (name, attr) = value.split_once('=').ok_or_else(|| invalid(&key, &value))?;
                output.attributes.insert(name.to_owned(), attr.to_owned());
            }
            _ => trace!("ignoring output field {key}"),
        }
    }
}

/// Reads a map that may announce a binary payload with `binary: <N>`.
///
/// The payload is exactly N raw bytes, followed by a newline and then the
/// sentinel. All three must be read successfully. A response without a
/// `binary` line yields an empty payload.
pub async fn read_binary<R>(
    reader: &mut R,
    sentinel: Sentinel,
) -> Result<(BTreeMap<String, String>, Vec<u8>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut map = BTreeMap::new();
    loop {
        match next(reader, sentinel).await? {
            Line::End => return Ok((map, Vec::new())),
            Line::Pair(key, value) => {
                if key != "binary" {
                    map.insert(key, value);
                    continue;
                }

                let length: u64 = value.parse().map_err(|_| ParseError::InvalidValue {
                    key: key.clone(),
                    value: value.clone(),
                })?;
                map.insert(key, value);

                // Grows with the bytes received, not with the announced length.
                let mut data = Vec::new();
                (&mut *reader).take(length).read_to_end(&mut data).await?;
                if data.len() as u64 != length {
                    return Err(Error::unavailable(format!(
                        "connection closed after {} of {length} binary bytes",
                        data.len()
                    )));
                }
                trace!("< [{length} bytes]");

                if reader.read_u8().await? != b'\n' {
                    return Err(ParseError::BinaryTerminator(length).into());
                }

                read_end(reader, sentinel).await?;
                return Ok((map, data));
            }
        }
    }
}
