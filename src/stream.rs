//! # Signed Response Streams
//!
//! Two [`PartReader`] adapters form the signed-content pipeline:
//!
//! - [`SigningReader`] wraps an origin response and produces the signed
//!   chunked form: injection headers and `Sig0` on the head, one output
//!   chunk per 64 KiB data block with the previous block's signature as a
//!   chunk extension, a zero-sized chunk carrying the last block's
//!   signature, and a trailer with `X-Ouinet-Data-Size`, `Digest` and
//!   `Sig1`. Responses that are not cacheable pass through untouched.
//!
//! - [`VerifyingReader`] consumes a signed stream and yields only verified
//!   parts: the head once at least one signature checks out, each data
//!   block once its signature and hash chain verify, and the trailer once
//!   the final signature, digest and data size all match. Any violation
//!   tears the stream down with `BadMessage`.
//!
//! The verifier accepts block signatures either trailing on the next
//! chunk header (the injector's wire form) or leading on the block's own
//! header (the store's replay form), and re-emits every verified block in
//! the leading form together with an `ouihash` chain-hash extension, so
//! downstream consumers can resume verification mid-stream.

use std::collections::VecDeque;

use async_trait::async_trait;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::response::{ChunkHdr, Head, Headers, Part, PartReader};
use crate::sign;

/// A stalled signed stream is torn down after this long without a part.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Injection identity split out of `X-Ouinet-Injection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionMeta {
    pub id: String,
    pub ts: i64,
}

/// Parse `id=<uuid>,ts=<unix-seconds>`.
pub fn parse_injection(value: &str) -> Option<InjectionMeta> {
    let mut id = None;
    let mut ts = None;
    for item in value.split(',') {
        let (key, val) = item.trim().split_once('=')?;
        match key {
            "id" => id = Some(val.to_string()),
            "ts" => ts = val.parse::<i64>().ok(),
            _ => {}
        }
    }
    Some(InjectionMeta {
        id: id?,
        ts: ts?,
    })
}

/// Headers that only make sense on one hop and never enter the cache.
const HOP_BY_HOP: [&str; 6] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Upgrade",
];

/// Whether an origin response can be signed and cached at all, and the
/// cacheable form of its head.
fn to_cache_response(head: &Head) -> Option<Head> {
    if head.status < 200 || head.status == 204 || head.status == 304 {
        return None;
    }
    if head.content_length().is_none() && !head.is_chunked() {
        // No way to delimit the body; pass through without injection.
        return None;
    }
    let mut out = head.clone();
    for name in HOP_BY_HOP {
        out.headers.remove(name);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// SigningReader
// ---------------------------------------------------------------------------

/// Wraps an origin response and emits its signed chunked form.
pub struct SigningReader<R> {
    inner: R,
    uri: String,
    injection: InjectionMeta,
    sk: SigningKey,
    key_id: String,

    injecting: bool,
    head: Option<Head>,
    /// Data buffered toward the next full block.
    block_buf: Vec<u8>,
    block_offset: u64,
    body_len: u64,
    body_hash: Sha256,
    block_hash: Sha512,
    trailer_in: Headers,
    pending: VecDeque<Part>,
    input_done: bool,
    finished: bool,
}

impl<R: PartReader> SigningReader<R> {
    pub fn new(inner: R, uri: impl Into<String>, injection_id: impl Into<String>, injection_ts: i64, sk: SigningKey) -> Self {
        let key_id = sign::key_id_for(&sk.verifying_key());
        SigningReader {
            inner,
            uri: uri.into(),
            injection: InjectionMeta {
                id: injection_id.into(),
                ts: injection_ts,
            },
            sk,
            key_id,
            injecting: false,
            head: None,
            block_buf: Vec::new(),
            block_offset: 0,
            body_len: 0,
            body_hash: Sha256::new(),
            block_hash: Sha512::new(),
            trailer_in: Headers::new(),
            pending: VecDeque::new(),
            input_done: false,
            finished: false,
        }
    }

    fn process_head(&mut self, head: Head) {
        match to_cache_response(&head) {
            Some(cacheable) => {
                self.injecting = true;
                let signed = sign::injection_head(
                    &self.uri,
                    cacheable,
                    &self.injection.id,
                    self.injection.ts,
                    &self.sk,
                    &self.key_id,
                );
                self.head = Some(signed.clone());
                self.pending.push_back(Part::Head(signed));
            }
            None => {
                debug!(uri = %self.uri, "origin response is not cacheable, proxying unsigned");
                self.pending.push_back(Part::Head(head));
            }
        }
    }

    /// Emit one output chunk for a completed block. The chunk extension
    /// carries the signature of the *previous* block.
    fn emit_block(&mut self, block: Vec<u8>) {
        let exts = if self.block_offset > 0 {
            let digest: [u8; 64] = self.block_hash.finalize_reset().into();
            let exts = sign::signed_block_chunk_ext(&self.injection.id, &digest, &self.sk);
            self.block_hash.update(digest);
            exts
        } else {
            String::new()
        };
        self.block_hash.update(&block);
        self.block_offset += block.len() as u64;
        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(block.len(), exts)));
        self.pending.push_back(Part::ChunkBody(block));
    }

    fn process_data(&mut self, data: Vec<u8>) {
        if !self.injecting {
            self.pending.push_back(Part::ChunkBody(data));
            return;
        }
        self.body_len += data.len() as u64;
        self.body_hash.update(&data);
        self.block_buf.extend_from_slice(&data);
        while self.block_buf.len() >= sign::DATA_BLOCK_SIZE {
            let rest = self.block_buf.split_off(sign::DATA_BLOCK_SIZE);
            let block = std::mem::replace(&mut self.block_buf, rest);
            self.emit_block(block);
        }
    }

    fn process_end(&mut self) {
        self.input_done = true;
        if !self.injecting {
            if !self.trailer_in.is_empty() {
                self.pending.push_back(Part::Trailer(std::mem::take(&mut self.trailer_in)));
            }
            self.finished = true;
            return;
        }

        if !self.block_buf.is_empty() {
            let block = std::mem::take(&mut self.block_buf);
            self.emit_block(block);
        }

        // Zero-sized chunk carrying the last block's signature.
        let digest: [u8; 64] = self.block_hash.finalize_reset().into();
        let exts = sign::signed_block_chunk_ext(&self.injection.id, &digest, &self.sk);
        self.pending.push_back(Part::ChunkHdr(ChunkHdr::new(0, exts)));

        let head = self.head.take().unwrap_or_default();
        let body_digest: [u8; 32] = self.body_hash.clone().finalize().into();
        let trailer = sign::injection_trailer(
            &head,
            std::mem::take(&mut self.trailer_in),
            self.body_len,
            &body_digest,
            &self.sk,
            &self.key_id,
            self.injection.ts,
        );
        self.pending.push_back(Part::Trailer(trailer));
        self.finished = true;
    }
}

#[async_trait]
impl<R: PartReader> PartReader for SigningReader<R> {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            if self.finished {
                return Ok(None);
            }
            match self.inner.read_part().await? {
                Some(Part::Head(head)) => self.process_head(head),
                // Origin chunk framing and extensions are dropped; blocks
                // are re-chunked to our own size and we cannot sign
                // foreign extensions.
                Some(Part::ChunkHdr(_)) => {}
                Some(Part::ChunkBody(data)) => self.process_data(data),
                Some(Part::Trailer(trailer)) => {
                    self.trailer_in = trailer;
                }
                None => self.process_end(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// VerifyingReader
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum VerifyState {
    AwaitHead,
    Streaming,
    Done,
    Failed,
}

/// Wraps a signed stream and yields only verified parts.
pub struct VerifyingReader<R> {
    inner: R,
    pk: VerifyingKey,

    state: VerifyState,
    head: Option<Head>,
    bsigs: Option<sign::BlockSigs>,
    injection: Option<InjectionMeta>,

    /// Chain hash over the blocks verified so far.
    chain: Option<[u8; 64]>,
    /// Data accumulated toward the block being verified.
    block_buf: Vec<u8>,
    /// Signature seen on the header *preceding* its block data.
    upcoming_sig: Option<[u8; 64]>,
    seen_data: bool,
    body_len: u64,
    body_hash: Sha256,
    pending: VecDeque<Part>,
}

impl<R: PartReader> VerifyingReader<R> {
    pub fn new(inner: R, pk: VerifyingKey) -> Self {
        VerifyingReader {
            inner,
            pk,
            state: VerifyState::AwaitHead,
            head: None,
            bsigs: None,
            injection: None,
            chain: None,
            block_buf: Vec::new(),
            upcoming_sig: None,
            seen_data: false,
            body_len: 0,
            body_hash: Sha256::new(),
            pending: VecDeque::new(),
        }
    }

    fn fail(&mut self, what: &'static str) -> Error {
        self.state = VerifyState::Failed;
        warn!(reason = what, "signed stream verification failed");
        Error::BadMessage(what)
    }

    fn process_head(&mut self, head: Head) -> Result<()> {
        let verified = sign::injection_verify(&head, &self.pk)
            .map_err(|_| self.fail("head signature"))?;

        let bsigs_value = verified
            .headers
            .get(sign::BSIGS_HDR)
            .ok_or_else(|| self.fail("missing block signature parameters"))?;
        let bsigs = sign::BlockSigs::parse(bsigs_value)
            .ok_or_else(|| self.fail("block signature parameters"))?;
        if bsigs.size != sign::DATA_BLOCK_SIZE as u64 {
            return Err(self.fail("block size"));
        }

        let injection = verified
            .headers
            .get(sign::INJECTION_HDR)
            .and_then(parse_injection)
            .ok_or_else(|| self.fail("injection header"))?;

        self.bsigs = Some(bsigs);
        self.injection = Some(injection);
        self.head = Some(verified.clone());
        self.state = VerifyState::Streaming;
        self.pending.push_back(Part::Head(verified));
        Ok(())
    }

    /// Verify the accumulated block against `sig`, then emit it with its
    /// signature and the previous chain hash as extensions.
    fn verify_and_emit_block(&mut self, sig: [u8; 64]) -> Result<()> {
        let bsigs = self.bsigs.as_ref().expect("streaming implies bsigs");
        let injection = self.injection.as_ref().expect("streaming implies injection");

        let mut hasher = Sha512::new();
        if let Some(prev) = &self.chain {
            hasher.update(prev);
        }
        hasher.update(&self.block_buf);
        let digest: [u8; 64] = hasher.finalize().into();

        let payload = sign::block_sig_payload(&injection.id, &digest);
        if bsigs
            .pk
            .verify(&payload, &Signature::from_bytes(&sig))
            .is_err()
        {
            return Err(self.fail("data block signature"));
        }

        let exts = sign::block_chunk_ext(Some(&sig), self.chain.as_ref());
        let block = std::mem::take(&mut self.block_buf);
        self.chain = Some(digest);
        self.body_len += block.len() as u64;
        self.body_hash.update(&block);
        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(block.len(), exts)));
        self.pending.push_back(Part::ChunkBody(block));
        Ok(())
    }

    fn process_chunk_hdr(&mut self, hdr: ChunkHdr) -> Result<()> {
        if let Some(hash) = sign::chain_hash_from_exts(&hdr.exts) {
            // A chain hash on the first data-bearing chunk lets us verify
            // a stream joined mid-flight.
            if !self.seen_data && self.chain.is_none() {
                self.chain = Some(hash);
            }
        }

        let sig = sign::block_sig_from_exts(&hdr.exts);
        match sig {
            Some(sig) if !self.block_buf.is_empty() || (hdr.size == 0 && self.upcoming_sig.is_none()) => {
                // Trailing form: the signature covers the data accumulated
                // so far. Unless the stream is ending, that must be one
                // whole block.
                if self.upcoming_sig.is_some() {
                    return Err(self.fail("conflicting block signatures"));
                }
                if hdr.size > 0 && self.block_buf.len() != sign::DATA_BLOCK_SIZE {
                    return Err(self.fail("data block boundary"));
                }
                if !self.block_buf.is_empty() {
                    self.verify_and_emit_block(sig)?;
                }
            }
            Some(sig) => {
                // Leading form: the signature covers the block about to
                // arrive (the store replay shape).
                if self.upcoming_sig.is_some() {
                    return Err(self.fail("conflicting block signatures"));
                }
                self.upcoming_sig = Some(sig);
            }
            None => {}
        }

        if hdr.size == 0 {
            // End of data. A short final block in leading form is verified
            // now; trailing unsigned data is a protocol violation.
            if let Some(sig) = self.upcoming_sig.take() {
                if !self.block_buf.is_empty() {
                    self.verify_and_emit_block(sig)?;
                }
            }
            if !self.block_buf.is_empty() {
                return Err(self.fail("unsigned trailing data"));
            }
        }
        Ok(())
    }

    fn process_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.seen_data = true;
        self.block_buf.extend_from_slice(&data);
        if self.block_buf.len() > sign::DATA_BLOCK_SIZE {
            return Err(self.fail("data block overrun"));
        }
        if self.block_buf.len() == sign::DATA_BLOCK_SIZE {
            if let Some(sig) = self.upcoming_sig.take() {
                self.verify_and_emit_block(sig)?;
            }
        }
        Ok(())
    }

    fn process_trailer(&mut self, trailer: Headers) -> Result<()> {
        let head = self.head.take().ok_or_else(|| self.fail("trailer before head"))?;

        // The final head: everything received so far plus the trailer.
        let mut full = head;
        for (name, value) in trailer.iter() {
            full.headers.set(name, value);
        }

        // Some signature on the final head must cover the data size and
        // body digest and check out. (The verifier renumbers signature
        // headers, so the final one is not necessarily named `Sig1`.)
        let covers = |sig: &sign::HttpSignature, h: &str| {
            sig.headers.split(' ').any(|n| n.eq_ignore_ascii_case(h))
        };
        let stripped = full.without_framing();
        let final_ok = full
            .headers
            .iter()
            .filter(|(name, _)| sign::is_signature_header(name))
            .filter_map(|(_, value)| sign::HttpSignature::parse(value))
            .filter(|sig| covers(sig, sign::DATA_SIZE_HDR) && covers(sig, "Digest"))
            .any(|sig| sig.verify(&stripped, &self.pk).0);
        if !final_ok {
            return Err(self.fail("final signature"));
        }

        let declared_size: u64 = full
            .headers
            .get(sign::DATA_SIZE_HDR)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| self.fail("data size header"))?;
        if declared_size != self.body_len {
            return Err(self.fail("data size mismatch"));
        }

        let digest: [u8; 32] = self.body_hash.clone().finalize().into();
        match full.headers.get("Digest") {
            Some(declared) if declared == sign::http_digest(&digest) => {}
            _ => return Err(self.fail("body digest mismatch")),
        }

        self.state = VerifyState::Done;
        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(0, "")));
        self.pending.push_back(Part::Trailer(trailer));
        Ok(())
    }
}

#[async_trait]
impl<R: PartReader> PartReader for VerifyingReader<R> {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            match self.state {
                VerifyState::Done => return Ok(None),
                VerifyState::Failed => return Err(Error::BadMessage("stream failed")),
                _ => {}
            }

            // Watchdog: a peer that stops sending mid-stream gets cut off.
            let part = match tokio::time::timeout(READ_TIMEOUT, self.inner.read_part()).await {
                Ok(part) => part?,
                Err(_) => {
                    self.state = VerifyState::Failed;
                    return Err(Error::TimedOut);
                }
            };

            match (self.state, part) {
                (VerifyState::AwaitHead, Some(Part::Head(head))) => self.process_head(head)?,
                (VerifyState::AwaitHead, _) => return Err(self.fail("expected head")),
                (VerifyState::Streaming, Some(Part::ChunkHdr(hdr))) => {
                    self.process_chunk_hdr(hdr)?
                }
                (VerifyState::Streaming, Some(Part::ChunkBody(data))) => {
                    self.process_data(data)?
                }
                (VerifyState::Streaming, Some(Part::Trailer(trailer))) => {
                    self.process_trailer(trailer)?
                }
                (VerifyState::Streaming, Some(Part::Head(_))) => {
                    return Err(self.fail("unexpected head"))
                }
                (VerifyState::Streaming, None) => return Err(self.fail("truncated stream")),
                (VerifyState::Done | VerifyState::Failed, _) => unreachable!(),
            }
        }
    }
}
