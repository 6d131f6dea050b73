//! Image discovery for songs.
//!
//! An [`ImageBackend`] knows how to find pictures for a song and where they
//! can be fetched afterwards. An [`ImageBatch`] runs an ordered list of
//! backends over many songs as one background job of a [`Coalescer`], so a
//! burst of queue changes starts at most one discovery pass.
//!
//! [`AlbumArt`] is the built-in backend: it asks the server for the cover
//! file next to the song, falling back to the picture embedded in its tags,
//! and keeps the result in memory.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    client::Client,
    error::Result,
    pool::Context,
    protocol::Song,
    refresh::{Coalescer, Worker},
};

/// A source of song images.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// URLs of the images found for `song`.
    ///
    /// `None` means the song was not looked at yet; an empty list means
    /// nothing was found.
    fn urls(&self, song: &Song) -> Option<Vec<String>>;

    /// Looks for images of a song that was not looked at yet.
    async fn update(&self, cancel: &CancellationToken, song: &Song) -> Result<()>;

    /// Looks for images again, replacing what was found before.
    async fn rescan(&self, cancel: &CancellationToken, song: &Song) -> Result<()>;
}

/// One song of a discovery job.
#[derive(Clone, Debug)]
pub struct ImageTask {
    pub song: Song,
    /// Forces every backend to look again.
    pub rescan: bool,
}

/// Runs one backend as a coalescer worker.
struct BackendWorker(Arc<dyn ImageBackend>);

#[async_trait]
impl Worker<ImageTask> for BackendWorker {
    async fn process(&self, cancel: &CancellationToken, task: &ImageTask) -> Result<bool> {
        let backend = &self.0;

        if task.rescan {
            backend.rescan(cancel, &task.song).await?;
            return Ok(false);
        }

        match backend.urls(&task.song) {
            Some(urls) => return Ok(!urls.is_empty()),
            None => backend.update(cancel, &task.song).await?,
        }
        Ok(backend.urls(&task.song).is_some_and(|urls| !urls.is_empty()))
    }
}

/// Backends in order of preference, behind a single-flight job runner.
pub struct ImageBatch {
    backends: Vec<Arc<dyn ImageBackend>>,
    coalescer: Coalescer<ImageTask>,
}

impl std::fmt::Debug for ImageBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBatch")
            .field("backends", &self.backends.len())
            .field("coalescer", &self.coalescer)
            .finish()
    }
}

impl ImageBatch {
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn ImageBackend>>) -> Self {
        let workers: Vec<Arc<dyn Worker<ImageTask>>> = backends
            .iter()
            .map(|backend| Arc::new(BackendWorker(Arc::clone(backend))) as _)
            .collect();

        Self {
            backends,
            coalescer: Coalescer::new(workers),
        }
    }

    /// Looks for images of the songs no backend has resolved yet.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` while a job runs, or `FailedPrecondition`
    /// after shutdown.
    pub fn update(&self, songs: &[Song]) -> Result<()> {
        let tasks: Vec<_> = songs
            .iter()
            .filter(|song| !self.is_resolved(song))
            .map(|song| ImageTask {
                song: song.clone(),
                rescan: false,
            })
            .collect();

        if tasks.is_empty() {
            return Ok(());
        }
        self.coalescer.request(&tasks)
    }

    /// Makes every backend look at `songs` again.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update).
    pub fn rescan(&self, songs: &[Song]) -> Result<()> {
        let tasks: Vec<_> = songs
            .iter()
            .map(|song| ImageTask {
                song: song.clone(),
                rescan: true,
            })
            .collect();
        self.coalescer.request(&tasks)
    }

    /// URLs from the first backend that found any.
    #[must_use]
    pub fn urls(&self, song: &Song) -> Option<Vec<String>> {
        self.backends
            .iter()
            .find_map(|backend| backend.urls(song).filter(|urls| !urls.is_empty()))
    }

    /// Some backend found images, or every backend looked and found none.
    fn is_resolved(&self, song: &Song) -> bool {
        self.urls(song).is_some()
            || self
                .backends
                .iter()
                .all(|backend| backend.urls(song).is_some())
    }

    /// Follows whether a discovery job is running.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.coalescer.subscribe()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.coalescer.is_busy()
    }

    /// Stops the running job and rejects all further requests.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if the job does not stop within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.coalescer.shutdown(timeout).await
    }
}

/// Pictures fetched from the server, kept in memory.
///
/// Images are served from `<prefix>/<md5 of the picture>`, so songs sharing
/// a cover share one URL.
pub struct AlbumArt {
    client: Arc<Client>,
    prefix: String,
    timeout: Duration,
    songs: StdMutex<HashMap<String, Option<String>>>,
    pictures: StdMutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for AlbumArt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlbumArt")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AlbumArt {
    #[must_use]
    pub fn new(client: Arc<Client>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            timeout,
            songs: StdMutex::new(HashMap::new()),
            pictures: StdMutex::new(HashMap::new()),
        }
    }

    /// The picture behind an id from one of the URLs.
    #[must_use]
    pub fn picture(&self, id: &str) -> Option<Arc<Vec<u8>>> {
        self.pictures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    async fn fetch(&self, cancel: &CancellationToken, file: &str) -> Result<()> {
        let ctx = Context::with_timeout(self.timeout).with_cancel(cancel.clone());

        let mut picture = self.client.album_art(&ctx, file).await?;
        if picture.is_empty() {
            picture = self.client.read_picture(&ctx, file).await?;
        }

        let id = if picture.is_empty() {
            trace!("no picture for {file}");
            None
        } else {
            let id = format!("{:x}", Md5::digest(&picture));
            debug!("found picture {id} for {file} ({} bytes)", picture.len());
            self.pictures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.clone(), Arc::new(picture));
            Some(id)
        };

        self.songs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.to_owned(), id);
        Ok(())
    }
}

#[async_trait]
impl ImageBackend for AlbumArt {
    fn urls(&self, song: &Song) -> Option<Vec<String>> {
        // Streams and other songs without a file have no pictures.
        let Some(file) = song.file() else {
            return Some(Vec::new());
        };

        let songs = self.songs.lock().unwrap_or_else(PoisonError::into_inner);
        songs.get(file).map(|id| {
            id.iter()
                .map(|id| format!("{}/{id}", self.prefix))
                .collect()
        })
    }

    async fn update(&self, cancel: &CancellationToken, song: &Song) -> Result<()> {
        match song.file() {
            Some(file) if self.urls(song).is_none() => self.fetch(cancel, file).await,
            _ => Ok(()),
        }
    }

    async fn rescan(&self, cancel: &CancellationToken, song: &Song) -> Result<()> {
        match song.file() {
            Some(file) => self.fetch(cancel, file).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Finds one image for songs whose file starts with its prefix.
    struct Prefix {
        prefix: &'static str,
        looked: StdMutex<HashMap<String, bool>>,
        updates: AtomicUsize,
    }

    impl Prefix {
        fn new(prefix: &'static str) -> Arc<Self> {
            Arc::new(Self {
                prefix,
                looked: StdMutex::new(HashMap::new()),
                updates: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageBackend for Prefix {
        fn urls(&self, song: &Song) -> Option<Vec<String>> {
            let file = song.file()?;
            self.looked.lock().unwrap().get(file).map(|found| {
                if *found {
                    vec![format!("/{}/{file}", self.prefix)]
                } else {
                    Vec::new()
                }
            })
        }

        async fn update(&self, _: &CancellationToken, song: &Song) -> Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let file = song.file().unwrap_or_default();
            self.looked
                .lock()
                .unwrap()
                .insert(file.to_owned(), file.starts_with(self.prefix));
            Ok(())
        }

        async fn rescan(&self, cancel: &CancellationToken, song: &Song) -> Result<()> {
            self.update(cancel, song).await
        }
    }

    fn song(file: &str) -> Song {
        [(Song::FILE, file)].into_iter().collect()
    }

    async fn wait_idle(batch: &ImageBatch) {
        let mut state = batch.subscribe();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|busy| !busy))
            .await
            .unwrap()
            .unwrap();
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn first_backend_with_images_wins() {
        let local = Prefix::new("local");
        let remote = Prefix::new("remote");
        let batch = ImageBatch::new(vec![local.clone() as Arc<dyn ImageBackend>, remote.clone()]);

        let songs = [song("local/a.flac"), song("remote/b.flac")];
        batch.update(&songs).unwrap();
        wait_idle(&batch).await;

        assert_eq!(
            batch.urls(&songs[0]),
            Some(vec!["/local/local/a.flac".to_owned()])
        );
        assert_eq!(
            batch.urls(&songs[1]),
            Some(vec!["/remote/remote/b.flac".to_owned()])
        );

        // The second backend was only asked about the song the first missed.
        assert_eq!(local.updates.load(Ordering::SeqCst), 2);
        assert_eq!(remote.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_skips_resolved_songs() {
        let local = Prefix::new("local");
        let batch = ImageBatch::new(vec![local.clone() as Arc<dyn ImageBackend>]);

        let songs = [song("local/a.flac"), song("elsewhere/b.flac")];
        batch.update(&songs).unwrap();
        wait_idle(&batch).await;
        assert_eq!(local.updates.load(Ordering::SeqCst), 2);

        batch.update(&songs).unwrap();
        assert!(!batch.is_busy());
        assert_eq!(local.updates.load(Ordering::SeqCst), 2);

        batch.rescan(&songs).unwrap();
        wait_idle(&batch).await;
        assert_eq!(local.updates.load(Ordering::SeqCst), 4);
    }
}
