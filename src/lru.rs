//! # Persistent LRU Cache
//!
//! Bounded key/value map persisted as one file per entry, named by the
//! SHA-1 hex of the key. Each file holds
//! `[u64 timestamp_ms][u32 key_len][key][value]`, so the recency order
//! survives restarts: opening the cache scans the directory, rebuilds the
//! list ordered by timestamp (ties broken by discovery order) and evicts
//! the oldest entries down to the configured bound.
//!
//! `find` refreshes the entry's on-disk timestamp and moves it to the
//! front; `insert` may evict the tail and reports the evicted key so the
//! owner can drop any state tied to it. File operations on one entry are
//! serialized by a one-slot lock per entry.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

fn ms_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn encode_entry(ts: u64, key: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + key.len() + value.len());
    out.extend_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_entry(bytes: &[u8]) -> Option<(u64, String, Vec<u8>)> {
    if bytes.len() < 12 {
        return None;
    }
    let ts = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let key_len = u32::from_be_bytes(bytes[8..12].try_into().ok()?) as usize;
    if bytes.len() < 12 + key_len {
        return None;
    }
    let key = String::from_utf8(bytes[12..12 + key_len].to_vec()).ok()?;
    Some((ts, key, bytes[12 + key_len..].to_vec()))
}

struct Element {
    key: String,
    path: PathBuf,
    /// One-slot scheduler: file operations on this entry do not overlap.
    slot: Mutex<()>,
}

pub struct PersistentLruCache {
    dir: PathBuf,
    max_size: usize,
    /// Most recently used first.
    list: VecDeque<Arc<Element>>,
    map: HashMap<String, Arc<Element>>,
}

impl PersistentLruCache {
    /// Open (creating if needed) the cache directory and rebuild the
    /// recency list from the entry files. Entries beyond `max_size` and
    /// malformed files are removed.
    pub async fn load(dir: impl Into<PathBuf>, max_size: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut found: Vec<(u64, u64, PathBuf, String)> = Vec::new();
        let mut discovery = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::read(&path).await.ok().and_then(|b| decode_entry(&b)) {
                Some((ts, key, _)) => {
                    found.push((ts, discovery, path, key));
                    discovery += 1;
                }
                None => {
                    warn!(path = %path.display(), "removing malformed cache entry");
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        // Oldest first; evict from the front down to the bound.
        found.sort();
        while found.len() > max_size {
            let (_, _, path, key) = found.remove(0);
            debug!(%key, "evicting entry past capacity");
            let _ = tokio::fs::remove_file(&path).await;
        }

        let mut cache = PersistentLruCache {
            dir,
            max_size,
            list: VecDeque::new(),
            map: HashMap::new(),
        };
        for (_, _, path, key) in found {
            let element = Arc::new(Element {
                key: key.clone(),
                path,
                slot: Mutex::new(()),
            });
            cache.list.push_front(element.clone());
            cache.map.insert(key, element);
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Keys in recency order, most recent first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(|e| e.key.as_str())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest: [u8; 20] = Sha1::digest(key.as_bytes()).into();
        self.dir.join(hex::encode(digest))
    }

    fn move_to_front(&mut self, key: &str) {
        if let Some(pos) = self.list.iter().position(|e| e.key == key) {
            if let Some(element) = self.list.remove(pos) {
                self.list.push_front(element);
            }
        }
    }

    /// Insert or refresh an entry. Returns the key evicted to make room,
    /// if any.
    pub async fn insert(&mut self, key: &str, value: &[u8]) -> Result<Option<String>> {
        let element = match self.map.get(key) {
            Some(element) => {
                let element = element.clone();
                self.move_to_front(key);
                element
            }
            None => {
                let element = Arc::new(Element {
                    key: key.to_string(),
                    path: self.path_for(key),
                    slot: Mutex::new(()),
                });
                self.list.push_front(element.clone());
                self.map.insert(key.to_string(), element.clone());
                element
            }
        };

        let mut evicted = None;
        if self.map.len() > self.max_size {
            if let Some(tail) = self.list.pop_back() {
                self.map.remove(&tail.key);
                let _ = tokio::fs::remove_file(&tail.path).await;
                evicted = Some(tail.key.clone());
            }
        }

        // The new entry itself may have been the tail of a zero-sized cache.
        if evicted.as_deref() != Some(key) {
            let _slot = element.slot.lock().await;
            let bytes = encode_entry(ms_since_epoch(), key, value);
            tokio::fs::write(&element.path, bytes).await?;
        }
        Ok(evicted)
    }

    /// Look the key up, refreshing its recency in memory and on disk.
    pub async fn find(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let element = match self.map.get(key) {
            Some(element) => element.clone(),
            None => return Ok(None),
        };
        self.move_to_front(key);

        let _slot = element.slot.lock().await;
        let bytes = match tokio::fs::read(&element.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.drop_entry(key).await;
                return Err(Error::Io(e));
            }
        };
        let (_, stored_key, value) = match decode_entry(&bytes) {
            Some(parsed) => parsed,
            None => {
                drop(_slot);
                self.drop_entry(key).await;
                return Err(Error::Malformed("lru entry"));
            }
        };
        debug_assert_eq!(stored_key, key);

        let refreshed = encode_entry(ms_since_epoch(), key, &value);
        if let Err(e) = tokio::fs::write(&element.path, refreshed).await {
            // Stale timestamps only make the order conservative.
            warn!(%key, error = %e, "failed to refresh lru timestamp");
        }
        Ok(Some(value))
    }

    /// Remove an entry outright.
    pub async fn remove(&mut self, key: &str) {
        self.drop_entry(key).await;
    }

    async fn drop_entry(&mut self, key: &str) {
        if let Some(element) = self.map.remove(key) {
            if let Some(pos) = self.list.iter().position(|e| e.key == key) {
                self.list.remove(pos);
            }
            let _ = tokio::fs::remove_file(&element.path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    async fn file_count(dir: &Path) -> usize {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_file() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn eviction_follows_recency() {
        let dir = tempfile::tempdir().unwrap();
        let mut lru = PersistentLruCache::load(dir.path(), 10).await.unwrap();

        for i in 1..=11 {
            lru.insert(&format!("k{i}"), b"v").await.unwrap();
        }
        assert_eq!(lru.len(), 10);
        assert_eq!(file_count(dir.path()).await, 10);
        assert!(!lru.contains("k1"));
        assert!(lru.contains("k2"));

        // Touching k2 protects it; the next insertion evicts k3 instead.
        assert_eq!(lru.find("k2").await.unwrap(), Some(b"v".to_vec()));
        let evicted = lru.insert("k12", b"v").await.unwrap();
        assert_eq!(evicted.as_deref(), Some("k3"));
        assert!(lru.contains("k2"));
        assert!(!lru.contains("k3"));
        assert_eq!(lru.len(), 10);
    }

    #[tokio::test]
    async fn order_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut lru = PersistentLruCache::load(dir.path(), 10).await.unwrap();
            for key in ["a", "b", "c"] {
                lru.insert(key, key.as_bytes()).await.unwrap();
                sleep(Duration::from_millis(5)).await;
            }
            // Touch "a" so it is the most recent on disk.
            lru.find("a").await.unwrap();
        }

        let mut reloaded = PersistentLruCache::load(dir.path(), 2).await.unwrap();
        // Capacity 2: the stalest entry ("b") was dropped during load.
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("a"));
        assert!(reloaded.contains("c"));
        assert!(!reloaded.contains("b"));
        assert_eq!(reloaded.find("a").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn malformed_files_are_removed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("junk"), b"xx").await.unwrap();
        let lru = PersistentLruCache::load(dir.path(), 10).await.unwrap();
        assert!(lru.is_empty());
        assert_eq!(file_count(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut lru = PersistentLruCache::load(dir.path(), 4).await.unwrap();
        lru.insert("https://example.com/x", b"payload").await.unwrap();
        assert_eq!(
            lru.find("https://example.com/x").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(lru.find("missing").await.unwrap(), None);

        lru.remove("https://example.com/x").await;
        assert!(lru.is_empty());
        assert_eq!(file_count(dir.path()).await, 0);
    }
}
