//! # Distributed Cache Client
//!
//! Ties the DHT and the signed-content layers together:
//!
//! - [`CacheClient::load`] computes the URL's infohash, collects provider
//!   endpoints from the swarm, fetches the signed response from one of
//!   them, verifies it block by block, and tees the verified parts into
//!   the local store while streaming them to the caller.
//! - [`CacheClient::store_response`] verifies and persists a signed
//!   response produced locally (the injector path) and starts announcing
//!   its infohash.
//! - [`CacheClient::serve`] answers other peers' requests from the local
//!   store over plain TCP.
//!
//! On startup the stored entries are swept (dropping those older than the
//! configured maximum age, and any that fail to parse) and every
//! surviving key gets its own announcer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::VerifyingKey;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::announce::Announcer;
use crate::error::{Error, Result};
use crate::id::infohash;
use crate::lru::PersistentLruCache;
use crate::node::DhtNode;
use crate::response::{Head, Part, PartReader, PartWriter, Reader};
use crate::sign;
use crate::store::{HttpStore, StoreReader};
use crate::stream::VerifyingReader;

/// TCP connect budget per candidate provider.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Providers tried before a load gives up.
const MAX_PROVIDER_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dht: DhtNode,
    store: Arc<HttpStore>,
    /// Recency index bounding the store; its evictions drive entry removal.
    lru: Mutex<PersistentLruCache>,
    pk: VerifyingKey,
    announcers: Mutex<HashMap<String, Announcer>>,
    /// Endpoints whose signed stream failed verification, per infohash.
    unreliable: Mutex<HashMap<crate::id::NodeId, HashSet<SocketAddr>>>,
}

/// A verified response being streamed to the caller. Parts start with the
/// verified head; the same parts are simultaneously persisted.
pub struct Session {
    head: Head,
    pending: Option<Part>,
    parts: Box<dyn PartReader>,
    _conn: Option<OwnedWriteHalf>,
}

impl Session {
    pub fn head(&self) -> &Head {
        &self.head
    }
}

#[async_trait::async_trait]
impl PartReader for Session {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        if let Some(head) = self.pending.take() {
            return Ok(Some(head));
        }
        self.parts.read_part().await
    }
}

impl CacheClient {
    /// Open the store and index under `repo_root`, sweep entries older
    /// than `max_cached_age` (or unreadable), and announce the rest.
    pub async fn new(
        dht: DhtNode,
        repo_root: PathBuf,
        pk: VerifyingKey,
        max_cached_age: Option<Duration>,
        index_capacity: usize,
    ) -> Result<CacheClient> {
        let store = Arc::new(HttpStore::open(repo_root.join("cache")).await?);
        let lru = PersistentLruCache::load(repo_root.join("lru"), index_capacity).await?;
        let client = CacheClient {
            inner: Arc::new(ClientInner {
                dht,
                store,
                lru: Mutex::new(lru),
                pk,
                announcers: Mutex::new(HashMap::new()),
                unreliable: Mutex::new(HashMap::new()),
            }),
        };

        let now = unix_seconds();
        let mut keep_keys = Vec::new();
        client
            .inner
            .store
            .for_each(|reader| {
                let uri = reader.uri().map(str::to_string);
                let age = reader
                    .injection()
                    .map(|inj| now.saturating_sub(inj.ts.max(0) as u64));
                let keep = match (&uri, age, max_cached_age) {
                    (None, _, _) => false,
                    (Some(_), Some(age), Some(max)) if age > max.as_secs() => false,
                    (Some(_), None, _) => false,
                    _ => true,
                };
                if keep {
                    keep_keys.push(uri.unwrap_or_default());
                }
                async move { keep }
            })
            .await?;

        info!(entries = keep_keys.len(), "announcing stored cache entries");
        for key in keep_keys {
            note_stored(&client.inner, &key).await;
            client.announce(&key).await;
        }
        Ok(client)
    }

    pub fn protocol_version(&self) -> &'static str {
        sign::PROTOCOL_VERSION
    }

    pub fn store(&self) -> &HttpStore {
        &self.inner.store
    }

    /// Ensure an announcer loop exists for this key, and nudge it.
    async fn announce(&self, key: &str) {
        let mut announcers = self.inner.announcers.lock().await;
        let announcer = announcers.entry(key.to_string()).or_insert_with(|| {
            Announcer::new(infohash(key), self.inner.dht.downgrade())
        });
        announcer.update();
    }

    /// Serve a stored entry without touching the network.
    pub async fn load_local(&self, url: &str) -> Result<StoreReader> {
        let reader = self.inner.store.reader(url).await?;
        if let Err(e) = self.inner.lru.lock().await.find(url).await {
            debug!(%url, error = %e, "failed to refresh cache index entry");
        }
        Ok(reader)
    }

    /// Fetch `url` from the distributed cache: discover providers via the
    /// swarm, stream the first verifiable response, and persist it while
    /// it flows to the caller.
    pub async fn load(&self, url: &str) -> Result<Session> {
        let hash = infohash(url);
        // Joining the swarm makes us a provider once the entry is stored.
        self.announce(url).await;

        let peers = self.inner.dht.tracker_get_peers(hash).await?;
        let own = [self.inner.dht.wan_endpoint(), self.inner.dht.local_addr()];
        let candidates: Vec<SocketAddr> = {
            let unreliable = self.inner.unreliable.lock().await;
            let tainted = unreliable.get(&hash);
            peers
                .into_iter()
                .filter(|ep| !own.contains(ep))
                .filter(|ep| tainted.map_or(true, |set| !set.contains(ep)))
                .take(MAX_PROVIDER_ATTEMPTS)
                .collect()
        };
        if candidates.is_empty() {
            return Err(Error::NotFound);
        }

        for endpoint in candidates {
            match self.load_from(url, endpoint).await {
                Ok(session) => return Ok(session),
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    if !e.is_node_failure() {
                        // A bad signature or malformed stream taints this
                        // endpoint for the content, not just this attempt.
                        self.inner
                            .unreliable
                            .lock()
                            .await
                            .entry(hash)
                            .or_default()
                            .insert(endpoint);
                    }
                    debug!(%url, %endpoint, error = %e, "provider failed, trying next");
                }
            }
        }
        Err(Error::NotFound)
    }

    async fn load_from(&self, url: &str, endpoint: SocketAddr) -> Result<Session> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::TimedOut)??;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(request_for(url).as_bytes()).await?;

        let verifier = VerifyingReader::new(Reader::new(read_half), self.inner.pk);
        let (sink, sink_rx) = mpsc::channel(64);
        let mut tee = TeeReader {
            inner: verifier,
            sink: Some(sink),
        };

        // The head must verify before we commit to this provider.
        let head = match tee.read_part().await? {
            Some(Part::Head(head)) => head,
            _ => return Err(Error::BadMessage("provider sent no head")),
        };

        // Persist in the background; a store failure must not abort the
        // stream the caller is consuming.
        let inner = self.inner.clone();
        let key = url.to_string();
        tokio::spawn(async move {
            let mut parts = ChannelReader { rx: sink_rx };
            match inner.store.store(&key, &mut parts).await {
                Ok(()) => note_stored(&inner, &key).await,
                Err(e) => warn!(%key, error = %e, "failed to store fetched response"),
            }
        });

        Ok(Session {
            pending: Some(Part::Head(head.clone())),
            head,
            parts: Box::new(tee),
            _conn: Some(write_half),
        })
    }

    /// Verify and persist a locally produced signed response (the
    /// injector path), then start announcing it.
    pub async fn store_response(
        &self,
        url: &str,
        reader: &mut (dyn PartReader + '_),
    ) -> Result<()> {
        let mut verifier = VerifyingReader::new(BorrowedReader(reader), self.inner.pk);
        self.inner.store.store(url, &mut verifier).await?;
        note_stored(&self.inner, url).await;
        self.announce(url).await;
        Ok(())
    }

    /// Answer peers' requests from the local store until the listener
    /// fails or the task is dropped.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, from) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "cache listener failed");
                    return;
                }
            };
            let store = self.inner.store.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(store, stream).await {
                    debug!(%from, error = %e, "serving peer failed");
                }
            });
        }
    }
}

/// Adapter so a borrowed part reader can feed an owning pipeline stage.
struct BorrowedReader<'a>(&'a mut (dyn PartReader + 'a));

#[async_trait::async_trait]
impl PartReader for BorrowedReader<'_> {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        self.0.read_part().await
    }
}

/// Duplicates every part into a channel for the store task.
struct TeeReader<R> {
    inner: R,
    sink: Option<mpsc::Sender<Part>>,
}

#[async_trait::async_trait]
impl<R: PartReader> PartReader for TeeReader<R> {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        match self.inner.read_part().await {
            Ok(Some(part)) => {
                if let Some(sink) = &self.sink {
                    // The store task may have died; that is its problem.
                    let _ = sink.send(part.clone()).await;
                }
                Ok(Some(part))
            }
            Ok(None) => {
                self.sink.take();
                Ok(None)
            }
            Err(e) => {
                // Closing the sink mid-stream leaves the store task with a
                // truncated stream, which it refuses to commit.
                self.sink.take();
                Err(e)
            }
        }
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<Part>,
}

#[async_trait::async_trait]
impl PartReader for ChannelReader {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        Ok(self.rx.recv().await)
    }
}

/// Refresh the key in the recency index; an index eviction takes the
/// evicted entry (and its announcer) out of the store too.
async fn note_stored(inner: &Arc<ClientInner>, key: &str) {
    let evicted = match inner.lru.lock().await.insert(key, &[]).await {
        Ok(evicted) => evicted,
        Err(e) => {
            warn!(%key, error = %e, "failed to index stored entry");
            return;
        }
    };
    if let Some(evicted) = evicted.filter(|k| k.as_str() != key) {
        debug!(key = %evicted, "cache index evicted entry");
        if let Err(e) = inner.store.remove(&evicted).await {
            warn!(key = %evicted, error = %e, "failed to drop evicted entry");
        }
        inner.announcers.lock().await.remove(&evicted);
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Minimal request a provider answers from its store.
fn request_for(url: &str) -> String {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split(['/', '?'])
        .next()
        .unwrap_or_default();
    format!(
        "GET {url} HTTP/1.1\r\nHost: {host}\r\n{}: {}\r\n\r\n",
        sign::VERSION_HDR,
        sign::PROTOCOL_VERSION
    )
}

async fn serve_connection(store: Arc<HttpStore>, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half);

    let mut request_line = String::new();
    lines.read_line(&mut request_line).await?;
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or(Error::Malformed("request line"))?
        .to_string();
    // Drain the remaining request headers.
    loop {
        let mut line = String::new();
        if lines.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut writer = PartWriter::new(write_half);
    match store.reader(&target).await {
        Ok(mut entry) => {
            debug!(%target, "serving stored entry");
            crate::response::copy_parts(&mut entry, &mut writer).await
        }
        Err(Error::NotFound) => {
            let mut head = Head::new(404);
            head.headers.insert("Content-Length", "0");
            writer.write_part(&Part::Head(head)).await?;
            writer.flush().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Reader;
    use crate::sign::test_vectors::*;
    use crate::stream::SigningReader;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn origin_response_bytes() -> Vec<u8> {
        let mut raw = origin_head().serialize().into_bytes();
        raw.extend_from_slice(&body());
        raw
    }

    async fn standalone_client(root: PathBuf, max_age: Option<Duration>) -> (CacheClient, DhtNode) {
        let dht = DhtNode::bootstrap(loopback(), &[]).await.unwrap();
        let client = CacheClient::new(dht.clone(), root, public_key(), max_age, 64)
            .await
            .unwrap();
        (client, dht)
    }

    async fn store_signed(client: &CacheClient, url: &str) {
        let origin = Reader::new(std::io::Cursor::new(origin_response_bytes()));
        let mut signer = SigningReader::new(origin, url, INJ_ID, INJ_TS, signing_key());
        client.store_response(url, &mut signer).await.unwrap();
    }

    #[tokio::test]
    async fn store_then_load_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (client, dht) = standalone_client(dir.path().to_path_buf(), None).await;

        store_signed(&client, URI).await;

        let mut local = client.load_local(URI).await.unwrap();
        let mut served = Vec::new();
        while let Some(part) = local.read_part().await.unwrap() {
            if let Part::ChunkBody(data) = part {
                served.extend_from_slice(&data);
            }
        }
        assert_eq!(served, body());

        assert!(matches!(
            client.load_local("https://example.com/other").await,
            Err(Error::NotFound)
        ));
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn startup_sweep_drops_entries_past_max_age() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (client, dht) = standalone_client(dir.path().to_path_buf(), None).await;
            let origin = Reader::new(std::io::Cursor::new(origin_response_bytes()));
            let mut signer = SigningReader::new(origin, URI, INJ_ID, INJ_TS, signing_key());
            client.store_response(URI, &mut signer).await.unwrap();
            dht.shutdown().await;
        }

        // The test vector's injection timestamp is from 2018, far past any
        // one-hour age bound.
        let (client, dht) =
            standalone_client(dir.path().to_path_buf(), Some(Duration::from_secs(3600))).await;
        assert!(matches!(client.load_local(URI).await, Err(Error::NotFound)));
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn startup_sweep_keeps_entries_with_unbounded_age() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (client, dht) = standalone_client(dir.path().to_path_buf(), None).await;
            let origin = Reader::new(std::io::Cursor::new(origin_response_bytes()));
            let mut signer = SigningReader::new(origin, URI, INJ_ID, INJ_TS, signing_key());
            client.store_response(URI, &mut signer).await.unwrap();
            dht.shutdown().await;
        }

        let (client, dht) = standalone_client(dir.path().to_path_buf(), None).await;
        assert!(client.load_local(URI).await.is_ok());
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn serve_answers_requests_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let (client, dht) = standalone_client(dir.path().to_path_buf(), None).await;

        store_signed(&client, URI).await;

        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let client = client.clone();
            tokio::spawn(async move { client.serve(listener).await })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(request_for(URI).as_bytes())
            .await
            .unwrap();

        let mut verifier = VerifyingReader::new(Reader::new(read_half), public_key());
        let mut fetched = Vec::new();
        while let Some(part) = verifier.read_part().await.unwrap() {
            if let Part::ChunkBody(data) = part {
                fetched.extend_from_slice(&data);
            }
        }
        assert_eq!(fetched, body());

        server.abort();
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn index_eviction_drops_store_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dht = DhtNode::bootstrap(loopback(), &[]).await.unwrap();
        let client = CacheClient::new(
            dht.clone(),
            dir.path().to_path_buf(),
            public_key(),
            None,
            1,
        )
        .await
        .unwrap();

        let other = "https://example.com/bar";
        store_signed(&client, URI).await;
        store_signed(&client, other).await;

        // Capacity one: storing the second entry pushed the first out.
        assert!(matches!(client.load_local(URI).await, Err(Error::NotFound)));
        assert!(client.load_local(other).await.is_ok());
        dht.shutdown().await;
    }

    #[test]
    fn request_line_carries_full_url_and_host() {
        let req = request_for("https://example.com/foo?q=1");
        assert!(req.starts_with("GET https://example.com/foo?q=1 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com\r\n"));
        assert!(req.contains("X-Ouinet-Version: 0\r\n"));
    }
}
