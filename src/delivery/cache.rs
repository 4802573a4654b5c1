//! Client-side response cache for optimized artifacts.
//!
//! [`DeliveryCache`] stores fetched bodies on disk, one file per URL named by
//! the SHA-256 of the URL. A request already in the cache is served without
//! touching the network; a miss is fetched, stored and then served. Hits and
//! misses are counted so the performance monitor can report cache efficiency.
//!
//! The cache can run in its own thread behind a message channel
//! ([`CacheWorker`]), mirroring a service worker: callers post
//! [`CacheRequest`] messages and read [`CacheReply`] messages back. Both
//! message types serialize as `{"type": "...", ...}` JSON so a foreign host
//! can drive the worker through [`DeliveryCache::handle_json`].

use crate::cache::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// How long [`WorkerChannel::request_stats`] waits for the worker.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ureq::Error> for FetchError {
    fn from(e: ureq::Error) -> Self {
        FetchError::Http(e.to_string())
    }
}

/// Retrieves the body behind a URL.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain HTTP fetcher.
pub struct UreqFetcher {
    agent: ureq::Agent,
}

impl UreqFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Default for UreqFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Fetcher for UreqFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.agent.get(url).call()?;
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits as a percentage of all counted requests; 0 with no requests.
    pub efficiency: f64,
}

impl CacheStats {
    pub fn new(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        let efficiency = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };
        Self {
            hits,
            misses,
            efficiency,
        }
    }

    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheRequest {
    PrefetchImages { urls: Vec<String> },
    GetCacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheReply {
    CacheStats(CacheStats),
}

/// On-disk cache in front of a [`Fetcher`].
pub struct DeliveryCache {
    dir: PathBuf,
    max_age: Option<Duration>,
    fetcher: Box<dyn Fetcher>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DeliveryCache {
    /// Open (creating if needed) a cache directory.
    pub fn open(dir: &Path, fetcher: impl Fetcher + 'static) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_age: None,
            fetcher: Box::new(fetcher),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Entries older than `max_age` count as misses and are refetched.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.dir.join(format!("{:x}", digest))
    }

    fn is_fresh(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        match self.max_age {
            None => meta.is_file(),
            Some(max_age) => meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .is_some_and(|age| age <= max_age),
        }
    }

    /// Cached body for `url`, without counting or fetching.
    pub fn lookup(&self, url: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(url);
        if !self.is_fresh(&path) {
            return None;
        }
        std::fs::read(path).ok()
    }

    fn store(&self, url: &str, body: &[u8]) {
        if let Err(e) = write_atomic(&self.entry_path(url), body) {
            tracing::warn!(url, error = %e, "failed to store cache entry");
        }
    }

    /// Serve from cache, or fetch and store on a miss.
    pub fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(body) = self.lookup(url) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(body);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let body = self.fetcher.fetch(url)?;
        self.store(url, &body);
        Ok(body)
    }

    /// Warm the cache. Failures are logged and skipped; counters are not
    /// touched. Returns the number of URLs newly stored.
    pub fn prefetch(&self, urls: &[String]) -> usize {
        let mut stored = 0;
        for url in urls {
            if self.lookup(url).is_some() {
                continue;
            }
            match self.fetcher.fetch(url) {
                Ok(body) => {
                    self.store(url, &body);
                    stored += 1;
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "prefetch failed"),
            }
        }
        tracing::debug!(requested = urls.len(), stored, "prefetch done");
        stored
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::new(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn handle(&self, request: &CacheRequest) -> Option<CacheReply> {
        match request {
            CacheRequest::PrefetchImages { urls } => {
                self.prefetch(urls);
                None
            }
            CacheRequest::GetCacheStats => Some(CacheReply::CacheStats(self.stats())),
        }
    }

    /// [`handle`](Self::handle) over JSON messages. Unparseable input is
    /// logged and ignored.
    pub fn handle_json(&self, message: &str) -> Option<String> {
        let request: CacheRequest = match serde_json::from_str(message) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed cache message");
                return None;
            }
        };
        let reply = self.handle(&request)?;
        serde_json::to_string(&reply).ok()
    }
}

impl Fetcher for DeliveryCache {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get(url)
    }
}

/// Message channel to a cache, in-thread or on a worker.
pub trait DeliveryCacheChannel: Send + Sync {
    /// Fire-and-forget request.
    fn post(&self, request: CacheRequest);

    /// Current stats, or `None` when the cache cannot answer.
    fn request_stats(&self) -> Option<CacheStats>;
}

/// Channel that calls the cache directly on the caller's thread.
pub struct DirectChannel(pub Arc<DeliveryCache>);

impl DeliveryCacheChannel for DirectChannel {
    fn post(&self, request: CacheRequest) {
        self.0.handle(&request);
    }

    fn request_stats(&self) -> Option<CacheStats> {
        match self.0.handle(&CacheRequest::GetCacheStats)? {
            CacheReply::CacheStats(stats) => Some(stats),
        }
    }
}

enum Envelope {
    Request {
        request: CacheRequest,
        reply: Option<Sender<CacheReply>>,
    },
    Shutdown,
}

/// Cache running on a dedicated thread. Dropping the worker stops the
/// thread after the messages already queued.
pub struct CacheWorker {
    tx: Sender<Envelope>,
    handle: Option<JoinHandle<()>>,
}

impl CacheWorker {
    pub fn spawn(cache: Arc<DeliveryCache>) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let handle = std::thread::spawn(move || {
            for envelope in rx {
                match envelope {
                    Envelope::Shutdown => break,
                    Envelope::Request { request, reply } => {
                        let response = cache.handle(&request);
                        if let (Some(reply), Some(response)) = (reply, response) {
                            let _ = reply.send(response);
                        }
                    }
                }
            }
        });
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn channel(&self) -> WorkerChannel {
        WorkerChannel {
            tx: self.tx.clone(),
        }
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Envelope::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("cache worker panicked");
        }
    }
}

/// Sending side of a [`CacheWorker`]. Outliving the worker is harmless:
/// posts are dropped and stats requests return `None`.
#[derive(Clone)]
pub struct WorkerChannel {
    tx: Sender<Envelope>,
}

impl DeliveryCacheChannel for WorkerChannel {
    fn post(&self, request: CacheRequest) {
        if self
            .tx
            .send(Envelope::Request {
                request,
                reply: None,
            })
            .is_err()
        {
            tracing::debug!("cache worker gone, dropping message");
        }
    }

    fn request_stats(&self) -> Option<CacheStats> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Envelope::Request {
                request: CacheRequest::GetCacheStats,
                reply: Some(reply_tx),
            })
            .ok()?;
        match reply_rx.recv_timeout(STATS_TIMEOUT).ok()? {
            CacheReply::CacheStats(stats) => Some(stats),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves fixed bodies and records every URL it is asked for.
    #[derive(Default)]
    pub struct MapFetcher {
        pub bodies: HashMap<String, Vec<u8>>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl MapFetcher {
        pub fn with(entries: &[(&str, &[u8])]) -> Self {
            Self {
                bodies: entries
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.to_vec()))
                    .collect(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Fetcher for MapFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Http(format!("404 {url}")))
        }
    }

    #[test]
    fn miss_then_hit_without_network() {
        let tmp = TempDir::new().unwrap();
        let fetcher = MapFetcher::with(&[("/a.avif", &b"avif-bytes"[..])]);
        let calls = Arc::clone(&fetcher.calls);
        let cache = DeliveryCache::open(tmp.path(), fetcher).unwrap();

        assert_eq!(cache.get("/a.avif").unwrap(), b"avif-bytes");
        assert_eq!(cache.get("/a.avif").unwrap(), b"avif-bytes");
        assert_eq!(calls.lock().unwrap().len(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.efficiency, 50.0);
    }

    #[test]
    fn failed_fetch_counts_miss_and_stores_nothing() {
        let tmp = TempDir::new().unwrap();
        let cache = DeliveryCache::open(tmp.path(), MapFetcher::default()).unwrap();
        assert!(cache.get("/missing.jpg").is_err());
        assert!(cache.lookup("/missing.jpg").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn efficiency_is_zero_without_requests() {
        assert_eq!(CacheStats::new(0, 0).efficiency, 0.0);
        assert_eq!(CacheStats::new(3, 1).efficiency, 75.0);
    }

    #[test]
    fn expired_entries_are_refetched() {
        let tmp = TempDir::new().unwrap();
        let fetcher = MapFetcher::with(&[("/a.jpg", &b"jpg"[..])]);
        let calls = Arc::clone(&fetcher.calls);
        let cache = DeliveryCache::open(tmp.path(), fetcher)
            .unwrap()
            .with_max_age(Duration::from_secs(60));
        cache.get("/a.jpg").unwrap();

        let entry = cache.entry_path("/a.jpg");
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&entry)
            .unwrap()
            .set_modified(old)
            .unwrap();

        cache.get("/a.jpg").unwrap();
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn prefetch_warms_without_counting() {
        let tmp = TempDir::new().unwrap();
        let fetcher = MapFetcher::with(&[("/a.webp", &b"a"[..]), ("/b.webp", &b"b"[..])]);
        let calls = Arc::clone(&fetcher.calls);
        let cache = DeliveryCache::open(tmp.path(), fetcher).unwrap();

        let urls = vec!["/a.webp".into(), "/b.webp".into(), "/gone.webp".into()];
        assert_eq!(cache.prefetch(&urls), 2);
        assert_eq!(cache.stats().requests(), 0);

        cache.get("/b.webp").unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn message_wire_format() {
        let req: CacheRequest =
            serde_json::from_str(r#"{"type":"PREFETCH_IMAGES","urls":["/x.avif"]}"#).unwrap();
        assert_eq!(
            req,
            CacheRequest::PrefetchImages {
                urls: vec!["/x.avif".into()]
            }
        );
        let req: CacheRequest = serde_json::from_str(r#"{"type":"GET_CACHE_STATS"}"#).unwrap();
        assert_eq!(req, CacheRequest::GetCacheStats);

        let reply = serde_json::to_value(CacheReply::CacheStats(CacheStats::new(1, 1))).unwrap();
        assert_eq!(reply["type"], "CACHE_STATS");
        assert_eq!(reply["data"]["hits"], 1);
        assert_eq!(reply["data"]["efficiency"], 50.0);
    }

    #[test]
    fn handle_json_ignores_garbage() {
        let tmp = TempDir::new().unwrap();
        let cache = DeliveryCache::open(tmp.path(), MapFetcher::default()).unwrap();
        assert!(cache.handle_json("{not json").is_none());
        assert!(cache.handle_json(r#"{"type":"PREFETCH_IMAGES","urls":[]}"#).is_none());
        let reply = cache.handle_json(r#"{"type":"GET_CACHE_STATS"}"#).unwrap();
        assert!(reply.contains("CACHE_STATS"));
    }

    #[test]
    fn worker_answers_over_channel() {
        let tmp = TempDir::new().unwrap();
        let fetcher = MapFetcher::with(&[("/a.jpg", &b"a"[..])]);
        let cache = Arc::new(DeliveryCache::open(tmp.path(), fetcher).unwrap());
        let worker = CacheWorker::spawn(Arc::clone(&cache));
        let channel = worker.channel();

        channel.post(CacheRequest::PrefetchImages {
            urls: vec!["/a.jpg".into()],
        });
        // Requests are handled in order, so the prefetch is done by now.
        let stats = channel.request_stats().unwrap();
        assert_eq!(stats.requests(), 0);
        assert!(cache.lookup("/a.jpg").is_some());

        drop(worker);
        assert!(channel.request_stats().is_none());
    }

    #[test]
    fn direct_channel_reports_stats() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(DeliveryCache::open(tmp.path(), MapFetcher::with(&[("/a", &b"a"[..])])).unwrap());
        cache.get("/a").unwrap();
        cache.get("/a").unwrap();
        let stats = DirectChannel(Arc::clone(&cache)).request_stats().unwrap();
        assert_eq!(stats.efficiency, 50.0);
    }
}
