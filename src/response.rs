//! # HTTP Response Parts
//!
//! Streaming model for HTTP/1.1 responses: a response is a sequence of
//! [`Part`]s: one `Head`, then either raw body data or
//! `ChunkHdr`/`ChunkBody` pairs, then for chunked responses a final
//! `Trailer`. Chunk headers keep their raw extension string so signature
//! extensions survive a round trip byte-for-byte.
//!
//! [`Reader`] parses parts from any `AsyncRead`; [`PartWriter`] serializes
//! them back. [`PartReader`] is the capability every stage of the signed
//! pipeline (signer, verifier, store reader) implements, so stages chain.

use std::fmt::Write as _;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Upper bound on a head or trailer block.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Read slab for non-chunked bodies.
const BODY_SLAB: usize = 16 * 1024;

/// Ordered header collection preserving duplicates, with case-insensitive
/// name lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every occurrence of `name` with a single field, keeping the
    /// first occurrence's position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.0[pos].1 = value;
                let mut i = pos + 1;
                while i < self.0.len() {
                    if self.0[i].0.eq_ignore_ascii_case(name) {
                        self.0.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    /// Append a field, keeping existing occurrences.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A response head: status plus ordered headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Head {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl Head {
    pub fn new(status: u16) -> Self {
        Head {
            status,
            reason: reason_for(status).to_string(),
            headers: Headers::new(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .values("Transfer-Encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Copy of the head with framing headers stripped; the form signature
    /// strings are computed over.
    pub fn without_framing(&self) -> Head {
        let mut out = self.clone();
        out.headers.remove("Transfer-Encoding");
        out.headers.remove("Content-Length");
        out.headers.remove("Trailer");
        out
    }

    pub fn parse(raw: &str) -> Result<Head> {
        let mut lines = raw.split("\r\n");
        let status_line = lines.next().ok_or(Error::Malformed("status line"))?;
        let mut pieces = status_line.splitn(3, ' ');
        let version = pieces.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::Malformed("http version"));
        }
        let status = pieces
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(Error::Malformed("status code"))?;
        let reason = pieces.next().unwrap_or_default().to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::Malformed("header line"))?;
            headers.insert(name.trim(), value.trim());
        }
        Ok(Head {
            status,
            reason,
            headers,
        })
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

fn reason_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// A chunk-size line: the declared size and the raw extension string
/// (everything after the size, leading `;` included).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHdr {
    pub size: usize,
    pub exts: String,
}

impl ChunkHdr {
    pub fn new(size: usize, exts: impl Into<String>) -> Self {
        ChunkHdr {
            size,
            exts: exts.into(),
        }
    }
}

/// One piece of a streamed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Head(Head),
    ChunkHdr(ChunkHdr),
    ChunkBody(Vec<u8>),
    Trailer(Headers),
}

/// Capability implemented by every response source: parsed sockets,
/// signing and verifying adapters, and store readers.
#[async_trait]
pub trait PartReader: Send {
    /// The next part, or `None` when the response is complete.
    async fn read_part(&mut self) -> Result<Option<Part>>;
}

enum ReadState {
    AtHead,
    RawBody { remaining: Option<u64> },
    AtChunkHdr,
    InChunk { remaining: usize },
    AtTrailer,
    Done,
}

/// Parses an HTTP/1.1 response from a byte stream into [`Part`]s.
///
/// Non-chunked bodies are surfaced as bare `ChunkBody` parts (no chunk
/// headers, no trailer), mirroring what the signer expects from origins.
pub struct Reader<R> {
    input: BufReader<R>,
    state: ReadState,
}

impl<R: AsyncRead + Unpin + Send> Reader<R> {
    pub fn new(input: R) -> Self {
        Reader {
            input: BufReader::new(input),
            state: ReadState::AtHead,
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = self.input.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Malformed("truncated response")
                } else {
                    Error::Io(e)
                }
            })?;
            if byte == b'\n' {
                break;
            }
            if byte != b'\r' {
                line.push(byte);
            }
            if line.len() > MAX_HEAD_SIZE {
                return Err(Error::Malformed("oversized header line"));
            }
        }
        String::from_utf8(line).map_err(|_| Error::Malformed("non-utf8 header"))
    }

    async fn read_head_block(&mut self) -> Result<String> {
        let mut block = String::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            block.push_str(&line);
            block.push_str("\r\n");
            if block.len() > MAX_HEAD_SIZE {
                return Err(Error::Malformed("oversized head"));
            }
        }
        Ok(block)
    }

    async fn read_trailer(&mut self) -> Result<Headers> {
        let mut headers = Headers::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::Malformed("trailer line"))?;
            headers.insert(name.trim(), value.trim());
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PartReader for Reader<R> {
    async fn read_part(&mut self) -> Result<Option<Part>> {
        loop {
            match self.state {
                ReadState::AtHead => {
                    let status_line = self.read_line().await?;
                    let rest = self.read_head_block().await?;
                    let head = Head::parse(&format!("{status_line}\r\n{rest}"))?;
                    self.state = if head.is_chunked() {
                        ReadState::AtChunkHdr
                    } else {
                        ReadState::RawBody {
                            remaining: head.content_length(),
                        }
                    };
                    return Ok(Some(Part::Head(head)));
                }
                ReadState::RawBody { remaining } => {
                    let want = match remaining {
                        Some(0) => {
                            self.state = ReadState::Done;
                            return Ok(None);
                        }
                        Some(n) => (n as usize).min(BODY_SLAB),
                        None => BODY_SLAB,
                    };
                    let mut buf = vec![0u8; want];
                    let read = self.input.read(&mut buf).await?;
                    if read == 0 {
                        if remaining.is_some() {
                            return Err(Error::Malformed("truncated body"));
                        }
                        self.state = ReadState::Done;
                        return Ok(None);
                    }
                    buf.truncate(read);
                    self.state = ReadState::RawBody {
                        remaining: remaining.map(|n| n - read as u64),
                    };
                    return Ok(Some(Part::ChunkBody(buf)));
                }
                ReadState::AtChunkHdr => {
                    let line = self.read_line().await?;
                    let (size_part, exts) = match line.find(';') {
                        Some(pos) => (&line[..pos], line[pos..].to_string()),
                        None => (line.as_str(), String::new()),
                    };
                    let size = usize::from_str_radix(size_part.trim(), 16)
                        .map_err(|_| Error::Malformed("chunk size"))?;
                    self.state = if size == 0 {
                        ReadState::AtTrailer
                    } else {
                        ReadState::InChunk { remaining: size }
                    };
                    return Ok(Some(Part::ChunkHdr(ChunkHdr { size, exts })));
                }
                ReadState::InChunk { remaining } => {
                    // Bounded reads, so a hostile chunk size cannot force
                    // a matching allocation. A large chunk surfaces as
                    // several body parts.
                    let want = remaining.min(BODY_SLAB);
                    let mut buf = vec![0u8; want];
                    self.input.read_exact(&mut buf).await.map_err(|e| {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            Error::Malformed("truncated chunk")
                        } else {
                            Error::Io(e)
                        }
                    })?;
                    if remaining == want {
                        // Chunk data is followed by CRLF.
                        let line = self.read_line().await?;
                        if !line.is_empty() {
                            return Err(Error::Malformed("chunk terminator"));
                        }
                        self.state = ReadState::AtChunkHdr;
                    } else {
                        self.state = ReadState::InChunk {
                            remaining: remaining - want,
                        };
                    }
                    return Ok(Some(Part::ChunkBody(buf)));
                }
                ReadState::AtTrailer => {
                    let trailer = self.read_trailer().await?;
                    self.state = ReadState::Done;
                    return Ok(Some(Part::Trailer(trailer)));
                }
                ReadState::Done => return Ok(None),
            }
        }
    }
}

/// Serializes [`Part`]s back onto a byte stream.
pub struct PartWriter<W> {
    output: W,
    chunked: bool,
}

impl<W: AsyncWrite + Unpin + Send> PartWriter<W> {
    pub fn new(output: W) -> Self {
        PartWriter {
            output,
            chunked: false,
        }
    }

    pub async fn write_part(&mut self, part: &Part) -> Result<()> {
        match part {
            Part::Head(head) => {
                self.chunked = head.is_chunked();
                self.output.write_all(head.serialize().as_bytes()).await?;
            }
            Part::ChunkHdr(hdr) => {
                let line = format!("{:x}{}\r\n", hdr.size, hdr.exts);
                self.output.write_all(line.as_bytes()).await?;
            }
            Part::ChunkBody(data) => {
                self.output.write_all(data).await?;
                if self.chunked {
                    self.output.write_all(b"\r\n").await?;
                }
            }
            Part::Trailer(fields) => {
                let mut block = String::new();
                for (name, value) in fields.iter() {
                    let _ = write!(block, "{name}: {value}\r\n");
                }
                block.push_str("\r\n");
                self.output.write_all(block.as_bytes()).await?;
            }
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.output.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

/// Drain `reader` into `writer` until the response ends.
pub async fn copy_parts<W: AsyncWrite + Unpin + Send>(
    reader: &mut (dyn PartReader + '_),
    writer: &mut PartWriter<W>,
) -> Result<()> {
    while let Some(part) = reader.read_part().await? {
        writer.write_part(&part).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(raw: &[u8]) -> Result<Vec<Part>> {
        let mut reader = Reader::new(raw);
        let mut parts = Vec::new();
        while let Some(part) = reader.read_part().await? {
            parts.push(part);
        }
        Ok(parts)
    }

    #[tokio::test]
    async fn parses_chunked_response_with_extensions() {
        let raw = b"HTTP/1.1 200 OK\r\n\
                    Content-Type: text/plain\r\n\
                    Transfer-Encoding: chunked\r\n\
                    Trailer: Digest\r\n\
                    \r\n\
                    4;ouisig=\"QUJD\"\r\n\
                    wxyz\r\n\
                    0\r\n\
                    Digest: SHA-256=zzz\r\n\
                    \r\n";
        let parts = collect(raw).await.unwrap();
        assert_eq!(parts.len(), 5);
        match &parts[0] {
            Part::Head(h) => {
                assert_eq!(h.status, 200);
                assert!(h.is_chunked());
                assert_eq!(h.headers.get("content-type"), Some("text/plain"));
            }
            p => panic!("unexpected {p:?}"),
        }
        match &parts[1] {
            Part::ChunkHdr(h) => {
                assert_eq!(h.size, 4);
                assert_eq!(h.exts, ";ouisig=\"QUJD\"");
            }
            p => panic!("unexpected {p:?}"),
        }
        assert_eq!(parts[2], Part::ChunkBody(b"wxyz".to_vec()));
        assert_eq!(parts[3], Part::ChunkHdr(ChunkHdr::new(0, "")));
        match &parts[4] {
            Part::Trailer(t) => assert_eq!(t.get("Digest"), Some("SHA-256=zzz")),
            p => panic!("unexpected {p:?}"),
        }
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let parts = collect(raw).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], Part::ChunkBody(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn truncated_content_length_body_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nhello";
        assert!(matches!(collect(raw).await, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn bad_chunk_size_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(matches!(collect(raw).await, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let mut head = Head::new(200);
        head.headers.insert("Content-Type", "text/html");
        head.headers.insert("Transfer-Encoding", "chunked");
        let parts = vec![
            Part::Head(head),
            Part::ChunkHdr(ChunkHdr::new(3, ";x=\"eQ==\"")),
            Part::ChunkBody(b"abc".to_vec()),
            Part::ChunkHdr(ChunkHdr::new(0, "")),
            Part::Trailer({
                let mut t = Headers::new();
                t.insert("Digest", "SHA-256=abc");
                t
            }),
        ];

        let mut writer = PartWriter::new(Vec::new());
        for part in &parts {
            writer.write_part(part).await.unwrap();
        }
        let bytes = writer.into_inner();
        let reparsed = collect(&bytes).await.unwrap();
        assert_eq!(reparsed, parts);
    }

    #[test]
    fn headers_set_replaces_all_repeats() {
        let mut h = Headers::new();
        h.insert("Server", "Apache1");
        h.insert("X-Other", "v");
        h.insert("Server", "Apache2");
        h.set("Server", "NginX");
        assert_eq!(h.values("server").collect::<Vec<_>>(), vec!["NginX"]);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn without_framing_strips_transport_headers() {
        let mut head = Head::new(200);
        head.headers.insert("Transfer-Encoding", "chunked");
        head.headers.insert("Content-Length", "10");
        head.headers.insert("Trailer", "Digest");
        head.headers.insert("Content-Type", "text/plain");
        let stripped = head.without_framing();
        assert_eq!(stripped.headers.len(), 1);
        assert!(stripped.headers.contains("Content-Type"));
    }
}
