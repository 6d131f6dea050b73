//! Music Player Daemon wire protocol.
//!
//! # Submodules
//!
//! * [`command`] - request rendering and argument quoting
//! * [`response`] - response decoding, server errors and sentinels
//! * [`tags`] - decoded records such as songs and outputs
//!
//! The protocol is line oriented: one request per line, responses made of
//! `key: value` lines terminated by `OK`, or by `list_OK` for each command in
//! a command list. Errors are reported in a single `ACK` line. The only
//! exception to line framing is the binary payload of picture transfers,
//! announced by a `binary: <length>` line.

pub mod command;
pub mod response;
pub mod tags;

pub use command::{Arg, Command};
pub use response::{CommandError, ParseError, Sentinel};
pub use tags::{Output, Song};
