//! Immutable response snapshots with conditional GET.
//!
//! A [`ResponseCache`] holds the serialized body of one resource together
//! with a gzip copy and the time it last changed. Writers replace the
//! snapshot wholesale; readers clone an `Arc` to it and never block a writer
//! for longer than that clone.
//!
//! Writes that do not change the body are ignored, so readers can revalidate
//! with `If-None-Match` or `If-Modified-Since` and get `304 Not Modified`
//! until something actually changed.
//!
//! Every effective write also raises a "changed" signal. The signal holds at
//! most one pending notification: several writes between two reads collapse
//! into one.

use std::{
    io::Read,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use flate2::{read::GzEncoder, Compression};
use http::{
    header::{
        ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
        IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, VARY,
    },
    HeaderMap, Method, Request, Response, StatusCode,
};
use serde::Serialize;
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// One published version of a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub body: Vec<u8>,
    /// Gzip copy of `body`; absent when compression failed.
    pub gzip: Option<Vec<u8>>,
    pub modified: SystemTime,
}

impl Snapshot {
    fn new(body: Vec<u8>, modified: SystemTime) -> Self {
        let gzip = compress(&body);
        Self {
            body,
            gzip,
            modified,
        }
    }

    /// `"<seconds>.<nanoseconds>"` of the modification time.
    #[must_use]
    pub fn etag(&self) -> String {
        let since_epoch = self
            .modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!(
            "\"{}.{}\"",
            since_epoch.as_secs(),
            since_epoch.subsec_nanos()
        )
    }
}

/// The latest snapshot of one resource plus its change signal.
#[derive(Debug)]
pub struct ResponseCache {
    entry: RwLock<Arc<Snapshot>>,
    changed_tx: mpsc::Sender<()>,
    changed_rx: Mutex<mpsc::Receiver<()>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::from_bytes(b"null".to_vec())
    }
}

impl ResponseCache {
    /// Creates a cache holding `initial` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `initial` cannot be serialized.
    pub fn new<T>(initial: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self::from_bytes(serde_json::to_vec(initial)?))
    }

    /// Creates a cache holding a pre-serialized body.
    #[must_use]
    pub fn from_bytes(body: Vec<u8>) -> Self {
        let (changed_tx, changed_rx) = mpsc::channel(1);
        Self {
            entry: RwLock::new(Arc::new(Snapshot::new(body, SystemTime::now()))),
            changed_tx,
            changed_rx: Mutex::new(changed_rx),
        }
    }

    /// Stores `value` as JSON if it differs from the current body, or
    /// unconditionally when `force` is set. Returns whether a new snapshot
    /// was published.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if `value` cannot be serialized. The current
    /// snapshot is kept in that case.
    pub fn set<T>(&self, value: &T, force: bool) -> Result<bool>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)?;
        Ok(self.set_bytes(body, force))
    }

    /// Like [`set`](Self::set), for a body that is already serialized.
    pub fn set_bytes(&self, body: Vec<u8>, force: bool) -> bool {
        if !force && self.get().body == body {
            return false;
        }

        // Compress outside the write lock.
        let gzip = compress(&body);

        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        if !force && entry.body == body {
            return false;
        }

        let mut modified = SystemTime::now();
        if modified <= entry.modified {
            modified = entry.modified + Duration::from_nanos(1);
        }

        *entry = Arc::new(Snapshot {
            body,
            gzip,
            modified,
        });
        drop(entry);

        // A pending notification already covers this write.
        let _ = self.changed_tx.try_send(());
        true
    }

    /// The current snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Snapshot> {
        Arc::clone(&self.entry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Waits until the snapshot changed since the last call.
    pub async fn changed(&self) {
        // The sender lives in `self`, so the channel never closes.
        let _ = self.changed_rx.lock().await.recv().await;
    }

    /// Consumes a pending change notification, if any.
    #[must_use]
    pub fn try_changed(&self) -> bool {
        self.changed_rx
            .try_lock()
            .is_ok_and(|mut rx| rx.try_recv().is_ok())
    }

    /// Answers `request` from the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the response cannot be built.
    pub fn serve<B>(&self, request: &Request<B>) -> Result<Response<Vec<u8>>> {
        self.serve_pending(request, false)
    }

    /// Like [`serve`](Self::serve), answering `202 Accepted` instead of
    /// `200 OK` while `pending` says a newer snapshot is being prepared.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the response cannot be built.
    pub fn serve_pending<B>(
        &self,
        request: &Request<B>,
        pending: bool,
    ) -> Result<Response<Vec<u8>>> {
        let snapshot = self.get();
        let etag = snapshot.etag();
        let headers = request.headers();

        let mut response = Response::builder()
            .header(CACHE_CONTROL, "max-age=0")
            .header(ETAG, &etag)
            .header(LAST_MODIFIED, http_date(snapshot.modified)?);
        if snapshot.gzip.is_some() {
            response = response.header(VARY, "Accept-Encoding");
        }

        if not_modified(headers, &etag, snapshot.modified) {
            return Ok(response.status(StatusCode::NOT_MODIFIED).body(Vec::new())?);
        }

        let (body, gzipped) = match &snapshot.gzip {
            Some(gzip) if accepts_gzip(headers) => (gzip, true),
            _ => (&snapshot.body, false),
        };

        response = response
            .status(if pending {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            })
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len());
        if gzipped {
            response = response.header(CONTENT_ENCODING, "gzip");
        }

        let body = if request.method() == Method::HEAD {
            Vec::new()
        } else {
            body.clone()
        };
        Ok(response.body(body)?)
    }
}

/// Best-effort gzip copy.
fn compress(body: &[u8]) -> Option<Vec<u8>> {
    let mut gzip = Vec::new();
    let mut encoder = GzEncoder::new(body, Compression::default());
    match encoder.read_to_end(&mut gzip) {
        Ok(_) => Some(gzip),
        Err(e) => {
            warn!("serving uncompressed: {e}");
            None
        }
    }
}

/// `If-None-Match` takes precedence; `If-Modified-Since` is compared at
/// second precision.
fn not_modified(headers: &HeaderMap, etag: &str, modified: SystemTime) -> bool {
    if let Some(value) = headers.get(IF_NONE_MATCH) {
        return value.to_str().is_ok_and(|tags| {
            tags.split(',')
                .map(str::trim)
                .any(|tag| tag == "*" || tag == etag)
        });
    }

    let Some(since) = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
    else {
        return false;
    };

    let seconds = |time: SystemTime| {
        time.duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_secs())
            .unwrap_or_default()
    };
    seconds(modified) <= seconds(since)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| {
            let mut params = coding.split(';').map(str::trim);
            let name = params.next().unwrap_or_default();
            let quality = params
                .find_map(|param| param.strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (name.eq_ignore_ascii_case("gzip") || name == "*") && quality > 0.0
        })
}

/// Formats `time` as an IMF-fixdate.
fn http_date(time: SystemTime) -> Result<String> {
    OffsetDateTime::from(time)
        .format(format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        ))
        .map_err(Error::internal)
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    PrimitiveDateTime::parse(
        value.trim(),
        format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        ),
    )
    .ok()
    .map(|time| time.assume_utc().into())
}
