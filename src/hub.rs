//! Keeps one [`ResponseCache`] per resource up to date.
//!
//! The hub turns watcher events into client calls: every changed subsystem
//! refetches the resources it affects, and a reconnect refetches everything
//! because any number of events may have been missed. Readers only ever
//! touch the caches.
//!
//! A failed refresh is logged and leaves the previous snapshot in place.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ResponseCache,
    client::Client,
    error::{ErrorKind, Result},
    images::ImageBatch,
    pool::Context,
    watcher::Event,
};

/// A piece of server state published as JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    /// Player status.
    Status,
    /// The current song and its images.
    Current,
    /// The queue.
    Queue,
    /// Database statistics.
    Stats,
    /// Audio outputs.
    Outputs,
    /// Every song in the database.
    Library,
    /// Stored playlists.
    Playlists,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Resource::Status,
        Resource::Current,
        Resource::Queue,
        Resource::Stats,
        Resource::Outputs,
        Resource::Library,
        Resource::Playlists,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Resource::Status => "status",
            Resource::Current => "current",
            Resource::Queue => "queue",
            Resource::Stats => "stats",
            Resource::Outputs => "outputs",
            Resource::Library => "library",
            Resource::Playlists => "playlists",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|resource| resource.name() == name)
    }

    /// The resources a change of `subsystem` makes stale.
    #[must_use]
    pub fn for_subsystem(subsystem: &str) -> &'static [Resource] {
        match subsystem {
            "player" => &[Resource::Status, Resource::Current],
            "mixer" | "options" => &[Resource::Status],
            "playlist" => &[Resource::Queue, Resource::Status, Resource::Current],
            "database" => &[Resource::Library, Resource::Stats],
            "update" => &[Resource::Status, Resource::Stats],
            "output" => &[Resource::Outputs],
            "stored_playlist" => &[Resource::Playlists],
            _ => &[],
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner of the per-resource caches.
pub struct Hub {
    client: Arc<Client>,
    caches: BTreeMap<Resource, ResponseCache>,
    images: Option<Arc<ImageBatch>>,
    images_state: ResponseCache,
    timeout: Duration,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("client", &self.client)
            .field("images", &self.images)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Creates empty caches. Every call to the server is bounded by
    /// `timeout`.
    #[must_use]
    pub fn new(client: Arc<Client>, images: Option<Arc<ImageBatch>>, timeout: Duration) -> Self {
        let caches = Resource::ALL
            .into_iter()
            .map(|resource| (resource, ResponseCache::default()))
            .collect();

        Self {
            client,
            caches,
            images,
            images_state: ResponseCache::from_bytes(br#"{"busy":false}"#.to_vec()),
            timeout,
        }
    }

    #[must_use]
    pub fn cache(&self, resource: Resource) -> &ResponseCache {
        // Every resource gets a cache in `new`.
        &self.caches[&resource]
    }

    /// Whether image discovery is running, as `{"busy": bool}`.
    #[must_use]
    pub fn images_state(&self) -> &ResponseCache {
        &self.images_state
    }

    /// Fetches one resource and publishes it if it changed.
    ///
    /// # Errors
    ///
    /// Returns the client's error; the cache keeps its previous snapshot.
    pub async fn refresh(&self, resource: Resource) -> Result<bool> {
        let ctx = Context::with_timeout(self.timeout);
        let cache = self.cache(resource);

        match resource {
            Resource::Status => cache.set(&self.client.status(&ctx).await?, false),
            Resource::Current => {
                let song = self.client.current_song(&ctx).await?;
                let images = self
                    .images
                    .as_ref()
                    .and_then(|images| images.urls(&song))
                    .unwrap_or_default();
                cache.set(&json!({ "song": song, "images": images }), false)
            }
            Resource::Queue => {
                let queue = self.client.playlist_info(&ctx).await?;
                if let Some(images) = &self.images {
                    match images.update(&queue) {
                        Ok(()) => {}
                        Err(e) if e.kind == ErrorKind::AlreadyExists => {
                            debug!("image discovery still running");
                        }
                        Err(e) => warn!("not looking for images: {e}"),
                    }
                }
                cache.set(&queue, false)
            }
            Resource::Stats => cache.set(&self.client.stats(&ctx).await?, false),
            Resource::Outputs => cache.set(&self.client.outputs(&ctx).await?, false),
            Resource::Library => cache.set(&self.client.list_all_info(&ctx, None).await?, false),
            Resource::Playlists => cache.set(&self.client.list_playlists(&ctx).await?, false),
        }
    }

    /// Refreshes `resources`, logging failures.
    pub async fn refresh_many(&self, resources: &[Resource]) {
        for &resource in resources {
            match self.refresh(resource).await {
                Ok(true) => debug!("{resource} changed"),
                Ok(false) => trace!("{resource} unchanged"),
                Err(e) => warn!("refreshing {resource} failed: {e}"),
            }
        }
    }

    pub async fn refresh_all(&self) {
        self.refresh_many(&Resource::ALL).await;
    }

    /// Brings the caches up to date after `event`.
    pub async fn handle(&self, event: &Event) {
        match event {
            Event::Changed(subsystem) => {
                let resources = Resource::for_subsystem(subsystem);
                if resources.is_empty() {
                    trace!("ignoring change of {subsystem}");
                }
                self.refresh_many(resources).await;
            }
            Event::Reconnecting => info!("server connection lost, caches may be stale"),
            Event::Reconnect => self.refresh_all().await,
        }
    }

    /// Fills every cache, then follows `events` until `stop` fires or the
    /// watcher goes away.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>, stop: CancellationToken) {
        self.refresh_all().await;

        let mut images = self.images.as_ref().map(|images| images.subscribe());

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        trace!("event: {event}");
                        self.handle(&event).await;
                    }
                    None => {
                        debug!("event queue closed");
                        break;
                    }
                },
                busy = busy_changed(&mut images) => {
                    if let Err(e) = self.images_state.set(&json!({ "busy": busy }), false) {
                        warn!("publishing image state failed: {e}");
                    }
                    // Finished discovery may have found the current song's images.
                    if !busy {
                        self.refresh_many(&[Resource::Current]).await;
                    }
                }
            }
        }
    }
}

/// The next busy flag; never resolves without a coalescer or after its
/// shutdown.
async fn busy_changed(state: &mut Option<watch::Receiver<bool>>) -> bool {
    if let Some(rx) = state {
        if rx.changed().await.is_ok() {
            return *rx.borrow_and_update();
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystems_map_to_resources() {
        assert_eq!(
            Resource::for_subsystem("player"),
            &[Resource::Status, Resource::Current]
        );
        assert_eq!(Resource::for_subsystem("output"), &[Resource::Outputs]);
        assert!(Resource::for_subsystem("sticker").is_empty());
    }

    #[test]
    fn names_round_trip() {
        for resource in Resource::ALL {
            assert_eq!(Resource::from_name(resource.name()), Some(resource));
        }
        assert_eq!(Resource::from_name("nope"), None);
    }
}
