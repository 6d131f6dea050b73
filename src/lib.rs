//! A client for the Music Player Daemon protocol, plus the plumbing to
//! publish its state to many readers.
//!
//! # Protocol client
//!
//! * [`connection`] - one stream with movable I/O deadlines
//! * [`pool`] - a single shared connection that reconnects by itself
//! * [`client`] - typed commands and command lists
//! * [`watcher`] - server-pushed change events through `idle`
//!
//! # Publishing
//!
//! * [`cache`] - immutable JSON snapshots with conditional GET
//! * [`refresh`] - single-flight background jobs
//! * [`images`] - album art discovery on top of [`refresh`]
//! * [`hub`] - watcher events drive client calls into caches
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use mpdhub::{client::Client, config::Config, error::Result, hub::Hub, watcher::Watcher};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(stop: CancellationToken) -> Result<()> {
//!     let config = Config::default();
//!     let client = Arc::new(Client::connect(&config).await?);
//!     let (watcher, events) = Watcher::connect(&config).await?;
//!
//!     let hub = Hub::new(client, None, Duration::from_secs(5));
//!     hub.run(events, stop).await;
//!     watcher.close(Duration::from_secs(1)).await
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod images;
pub mod pool;
pub mod protocol;
pub mod refresh;
pub mod signal;
pub mod watcher;
