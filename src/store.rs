//! # On-Disk HTTP Store
//!
//! Persists one signed response per key (the URL) as a directory
//! `root/XX/YYYY…` where `XXYYYY…` is the hex SHA-1 of the key, holding:
//!
//! | File | Contents |
//! |------|----------|
//! | `head` | response head, framing stripped, trailer headers merged in |
//! | `body` | the raw concatenated data blocks |
//! | `sigs` | one line per block: `OFFSET SIG PREV_HASH` |
//!
//! A store writes into a fresh temporary directory and commits with an
//! atomic rename, so partial entries are never observed. Replacing an
//! existing entry removes it first; losing that race to a concurrent
//! writer is harmless because signed responses are immutable.
//!
//! The input stream must carry each block's signature on the block's own
//! chunk header, which is exactly what [`crate::stream::VerifyingReader`]
//! emits; [`StoreReader`] replays an entry in the same shape.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::response::{ChunkHdr, Head, Headers, Part, PartReader};
use crate::sign;

const HEAD_FILE: &str = "head";
const BODY_FILE: &str = "body";
const SIGS_FILE: &str = "sigs";

/// Content-addressed store of signed HTTP responses.
pub struct HttpStore {
    root: PathBuf,
    /// One writer per key at a time.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HttpStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(HttpStore {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest: [u8; 20] = Sha1::digest(key.as_bytes()).into();
        let hex = hex::encode(digest);
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    async fn key_slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist a signed response read from `reader` under `key`.
    pub async fn store(&self, key: &str, reader: &mut (dyn PartReader + '_)) -> Result<()> {
        let slot = self.key_slot(key).await;
        let _guard = slot.lock().await;

        let tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.root)
            .map_err(Error::Io)?;

        let mut head: Option<Head> = None;
        let mut sigs = String::new();
        let mut body = fs::File::create(tmp.path().join(BODY_FILE)).await?;
        let mut body_len: u64 = 0;
        let mut pending_hdr: Option<ChunkHdr> = None;
        let mut saw_trailer = false;

        while let Some(part) = reader.read_part().await? {
            match part {
                Part::Head(h) => {
                    if head.is_some() {
                        return Err(Error::BadMessage("duplicate head"));
                    }
                    head = Some(h);
                }
                Part::ChunkHdr(hdr) => {
                    if hdr.size > 0 {
                        let sig = sign::block_sig_from_exts(&hdr.exts)
                            .ok_or(Error::BadMessage("unsigned data block"))?;
                        let prev = sign::chain_hash_from_exts(&hdr.exts);
                        let _ = write!(
                            sigs,
                            "{:x} {} {}\n",
                            body_len,
                            BASE64.encode(sig),
                            prev.map(|p| BASE64.encode(p)).unwrap_or_default()
                        );
                        pending_hdr = Some(hdr);
                    }
                }
                Part::ChunkBody(data) => {
                    if head.is_none() || pending_hdr.is_none() {
                        return Err(Error::BadMessage("data outside a signed block"));
                    }
                    body.write_all(&data).await?;
                    body_len += data.len() as u64;
                    pending_hdr = None;
                }
                Part::Trailer(trailer) => {
                    let h = head.as_mut().ok_or(Error::BadMessage("trailer before head"))?;
                    for (name, value) in trailer.iter() {
                        h.headers.set(name, value);
                    }
                    saw_trailer = true;
                }
            }
        }
        if !saw_trailer {
            // An interrupted tee must not commit a partial entry.
            return Err(Error::BadMessage("truncated response"));
        }
        body.flush().await?;
        drop(body);

        let mut head = head.ok_or(Error::BadMessage("missing head"))?;
        head.headers.remove("Transfer-Encoding");
        head.headers.remove("Trailer");
        head.headers.remove("Content-Length");
        fs::write(tmp.path().join(HEAD_FILE), head.serialize()).await?;
        fs::write(tmp.path().join(SIGS_FILE), sigs).await?;

        let target = self.entry_path(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::metadata(&target).await.is_ok() {
            // Not atomic with the rename below; a racing writer may win,
            // which is fine for immutable content.
            fs::remove_dir_all(&target).await?;
        }
        fs::rename(tmp.into_path(), &target).await?;
        debug!(%key, "stored signed response");
        Ok(())
    }

    /// A replay reader over the stored entry for `key`.
    pub async fn reader(&self, key: &str) -> Result<StoreReader> {
        let path = self.entry_path(key);
        if fs::metadata(&path).await.is_err() {
            return Err(Error::NotFound);
        }
        StoreReader::open(path).await
    }

    pub async fn contains(&self, key: &str) -> bool {
        fs::metadata(self.entry_path(key)).await.is_ok()
    }

    /// Remove the entry for `key` if present.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let slot = self.key_slot(key).await;
        let _guard = slot.lock().await;
        match fs::remove_dir_all(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Visit every entry with a replay reader. Entries for which `keep`
    /// returns `false`, and entries that fail to open, are removed.
    pub async fn for_each<F, Fut>(&self, mut keep: F) -> Result<()>
    where
        F: FnMut(StoreReader) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            if shard.file_name().len() != 2 {
                // Skip temporaries from in-flight commits.
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                match StoreReader::open(path.clone()).await {
                    Ok(reader) => {
                        if !keep(reader).await {
                            debug!(path = %path.display(), "dropping cache entry");
                            let _ = fs::remove_dir_all(&path).await;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "removing unreadable cache entry");
                        let _ = fs::remove_dir_all(&path).await;
                    }
                }
            }
        }
        Ok(())
    }
}

struct SigEntry {
    offset: u64,
    sig: String,
    prev_hash: Option<String>,
}

/// Replays a stored entry as a chunked response: the parsed head with
/// chunked framing restored, one chunk per recorded block carrying its
/// signature (and chain hash) extension, a zero chunk, and an empty
/// trailer. All signature headers are already in the head.
pub struct StoreReader {
    head: Option<Head>,
    parsed_head: Head,
    sigs: Vec<SigEntry>,
    body: fs::File,
    body_size: u64,
    next_block: usize,
    read_pos: u64,
    pending_body: Option<Vec<u8>>,
    emitted_tail: bool,
    done: bool,
}

impl StoreReader {
    pub async fn open(dir: PathBuf) -> Result<StoreReader> {
        let head_raw = fs::read_to_string(dir.join(HEAD_FILE)).await?;
        let parsed_head = Head::parse(&head_raw)?;

        let sigs_raw = fs::read_to_string(dir.join(SIGS_FILE)).await?;
        let mut sigs = Vec::new();
        for line in sigs_raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let offset = fields
                .next()
                .and_then(|o| u64::from_str_radix(o, 16).ok())
                .ok_or(Error::Malformed("signature entry offset"))?;
            let sig = fields
                .next()
                .ok_or(Error::Malformed("signature entry"))?
                .to_string();
            let prev_hash = fields.next().map(str::to_string);
            sigs.push(SigEntry {
                offset,
                sig,
                prev_hash,
            });
        }

        let body = fs::File::open(dir.join(BODY_FILE)).await?;
        let body_size = body.metadata().await?.len();

        // The head the response is replayed with declares chunked framing.
        let mut head = parsed_head.clone();
        head.headers.set("Transfer-Encoding", "chunked");

        Ok(StoreReader {
            head: Some(head),
            parsed_head,
            sigs,
            body,
            body_size,
            next_block: 0,
            read_pos: 0,
            pending_body: None,
            emitted_tail: false,
            done: false,
        })
    }

    /// The stored head as it sits on disk (framing stripped).
    pub fn head(&self) -> &Head {
        &self.parsed_head
    }

    /// The key this entry was stored under.
    pub fn uri(&self) -> Option<&str> {
        self.parsed_head.headers.get(sign::URI_HDR)
    }

    /// The injection id and timestamp recorded in the head.
    pub fn injection(&self) -> Option<crate::stream::InjectionMeta> {
        self.parsed_head
            .headers
            .get(sign::INJECTION_HDR)
            .and_then(crate::stream::parse_injection)
    }

    fn block_ext(&self, entry: &SigEntry) -> Result<String> {
        let sig: [u8; 64] = BASE64
            .decode(&entry.sig)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::Malformed("stored block signature"))?;
        let prev = match &entry.prev_hash {
            Some(encoded) => Some(
                BASE64
                    .decode(encoded)
                    .ok()
                    .and_then(|b| <[u8; 64]>::try_from(b).ok())
                    .ok_or(Error::Malformed("stored chain hash"))?,
            ),
            None => None,
        };
        Ok(sign::block_chunk_ext(Some(&sig), prev.as_ref()))
    }
}

#[async_trait::async_trait]
impl PartReader for StoreReader {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        if let Some(head) = self.head.take() {
            return Ok(Some(Part::Head(head)));
        }
        if let Some(block) = self.pending_body.take() {
            return Ok(Some(Part::ChunkBody(block)));
        }
        if self.done {
            return Ok(None);
        }

        if self.next_block < self.sigs.len() {
            let index = self.next_block;
            let start = self.sigs[index].offset;
            let end = self
                .sigs
                .get(index + 1)
                .map(|s| s.offset)
                .unwrap_or(self.body_size);
            if start != self.read_pos || end < start || end - start > sign::DATA_BLOCK_SIZE as u64
            {
                return Err(Error::Malformed("stored block bounds"));
            }
            let exts = self.block_ext(&self.sigs[index])?;

            let mut block = vec![0u8; (end - start) as usize];
            self.body.read_exact(&mut block).await?;
            self.next_block += 1;
            self.read_pos = end;

            // Queue the body right behind its header.
            let hdr = Part::ChunkHdr(ChunkHdr::new(block.len(), exts));
            self.pending_body = Some(block);
            return Ok(Some(hdr));
        }

        if !self.emitted_tail {
            self.emitted_tail = true;
            return Ok(Some(Part::ChunkHdr(ChunkHdr::new(0, ""))));
        }
        self.done = true;
        Ok(Some(Part::Trailer(Headers::new())))
    }
}
