//! # KRPC Wire Messages
//!
//! Bencoded UDP message model for the Mainline DHT:
//!
//! | Kind  | Shape |
//! |-------|-------|
//! | Query | `{y:"q", t:<tid>, q:<name>, a:{id, …}}` |
//! | Reply | `{y:"r", t:<tid>, ip:<compact ep>, r:{id, …}}` |
//! | Error | `{y:"e", t:<tid>, e:[<code>, <msg>]}` |
//!
//! Contacts travel in `nodes`/`nodes6` fields as 26-byte (IPv4) or
//! 38-byte (IPv6) records: 20 id bytes, then big-endian IP and port.
//! Peers travel in `values` as a list of 6- or 18-byte endpoint strings.
//!
//! Encoding emits dictionary keys in byte-lexicographic order (the codec
//! enforces it); decoding is strict and never panics on hostile input.
//! Unknown dictionary keys are skipped so that messages from other
//! implementations (version strings and the like) still parse.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bendy::decoding::{Decoder, Object};
use bendy::encoding::{AsString, Error as EncodingError, SingleItemEncoder, ToBencode};

use crate::error::{Error, Result};
use crate::id::NodeId;

/// KRPC error code for protocol violations (missing/malformed fields).
pub const ERR_PROTOCOL: i64 = 203;
/// KRPC error code for unknown query types.
pub const ERR_UNKNOWN_METHOD: i64 = 204;

/// A DHT node: id plus UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeContact {
    pub id: NodeId,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query(QueryMsg),
    Reply(ReplyMsg),
    Error(ErrorMsg),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMsg {
    pub tx: Vec<u8>,
    pub name: String,
    pub args: QueryArgs,
    /// BEP-43 read-only flag; such senders never enter the routing table.
    pub read_only: bool,
}

/// Query arguments, all optional at the wire level. The inbound handler
/// validates presence and answers with error 203 when required ones are
/// missing, so the transaction id survives malformed queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    pub id: Option<NodeId>,
    pub target: Option<NodeId>,
    pub info_hash: Option<NodeId>,
    pub port: Option<u16>,
    pub implied_port: bool,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyMsg {
    pub tx: Vec<u8>,
    pub id: Option<NodeId>,
    /// The requester's endpoint as observed by the replier (BEP-42 `ip`).
    pub observed_endpoint: Option<SocketAddr>,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub tx: Vec<u8>,
    pub code: i64,
    pub message: String,
}

impl QueryMsg {
    pub fn ping(tx: Vec<u8>, id: NodeId) -> Self {
        QueryMsg {
            tx,
            name: "ping".into(),
            args: QueryArgs {
                id: Some(id),
                ..QueryArgs::default()
            },
            read_only: false,
        }
    }

    pub fn find_node(tx: Vec<u8>, id: NodeId, target: NodeId) -> Self {
        QueryMsg {
            tx,
            name: "find_node".into(),
            args: QueryArgs {
                id: Some(id),
                target: Some(target),
                ..QueryArgs::default()
            },
            read_only: false,
        }
    }

    pub fn get_peers(tx: Vec<u8>, id: NodeId, info_hash: NodeId) -> Self {
        QueryMsg {
            tx,
            name: "get_peers".into(),
            args: QueryArgs {
                id: Some(id),
                info_hash: Some(info_hash),
                ..QueryArgs::default()
            },
            read_only: false,
        }
    }

    pub fn announce_peer(
        tx: Vec<u8>,
        id: NodeId,
        info_hash: NodeId,
        port: Option<u16>,
        token: Vec<u8>,
    ) -> Self {
        QueryMsg {
            tx,
            name: "announce_peer".into(),
            args: QueryArgs {
                id: Some(id),
                info_hash: Some(info_hash),
                implied_port: port.is_none(),
                port,
                token: Some(token),
                ..QueryArgs::default()
            },
            read_only: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Compact endpoint / contact codec
// ---------------------------------------------------------------------------

/// Big-endian IP followed by big-endian port: 6 bytes for IPv4, 18 for IPv6.
pub fn encode_endpoint(ep: &SocketAddr) -> Vec<u8> {
    let mut out = match ep.ip() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    out.extend_from_slice(&ep.port().to_be_bytes());
    out
}

pub fn decode_endpoint(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip: [u8; 4] = bytes[..4].try_into().ok()?;
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        18 => {
            let ip: [u8; 16] = bytes[..16].try_into().ok()?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => None,
    }
}

/// Serialize IPv4 contacts into a `nodes` field (26-byte records).
pub fn encode_contacts(contacts: &[NodeContact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contacts.len() * 26);
    for c in contacts {
        if c.endpoint.is_ipv4() {
            out.extend_from_slice(c.id.as_bytes());
            out.extend_from_slice(&encode_endpoint(&c.endpoint));
        }
    }
    out
}

/// Serialize IPv6 contacts into a `nodes6` field (38-byte records).
pub fn encode_contacts6(contacts: &[NodeContact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contacts.len() * 38);
    for c in contacts {
        if c.endpoint.is_ipv6() {
            out.extend_from_slice(c.id.as_bytes());
            out.extend_from_slice(&encode_endpoint(&c.endpoint));
        }
    }
    out
}

fn decode_contact_records(bytes: &[u8], record_len: usize) -> Result<Vec<NodeContact>> {
    if bytes.len() % record_len != 0 {
        return Err(Error::Malformed("compact contact list"));
    }
    let mut out = Vec::with_capacity(bytes.len() / record_len);
    for rec in bytes.chunks_exact(record_len) {
        let id = NodeId::from_slice(&rec[..20]).ok_or(Error::Malformed("contact id"))?;
        let endpoint =
            decode_endpoint(&rec[20..]).ok_or(Error::Malformed("contact endpoint"))?;
        out.push(NodeContact { id, endpoint });
    }
    Ok(out)
}

/// Parse a `nodes` field: 26-byte records.
pub fn decode_contacts(bytes: &[u8]) -> Result<Vec<NodeContact>> {
    decode_contact_records(bytes, 26)
}

/// Parse a `nodes6` field: 38-byte records.
pub fn decode_contacts6(bytes: &[u8]) -> Result<Vec<NodeContact>> {
    decode_contact_records(bytes, 38)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct QueryPayload<'a>(&'a QueryArgs);

impl ToBencode for QueryPayload<'_> {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodingError> {
        let a = self.0;
        encoder.emit_dict(|mut d| {
            if let Some(id) = &a.id {
                d.emit_pair(b"id", AsString(id.as_bytes()))?;
            }
            if a.implied_port {
                d.emit_pair(b"implied_port", 1)?;
            }
            if let Some(ih) = &a.info_hash {
                d.emit_pair(b"info_hash", AsString(ih.as_bytes()))?;
            }
            if let Some(port) = a.port {
                d.emit_pair(b"port", port)?;
            }
            if let Some(target) = &a.target {
                d.emit_pair(b"target", AsString(target.as_bytes()))?;
            }
            if let Some(token) = &a.token {
                d.emit_pair(b"token", AsString(token))?;
            }
            Ok(())
        })
    }
}

struct ReplyPayload<'a>(&'a ReplyMsg);

impl ToBencode for ReplyPayload<'_> {
    const MAX_DEPTH: usize = 3;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodingError> {
        let r = self.0;
        encoder.emit_dict(|mut d| {
            if let Some(id) = &r.id {
                d.emit_pair(b"id", AsString(id.as_bytes()))?;
            }
            if !r.nodes.is_empty() {
                d.emit_pair(b"nodes", AsString(encode_contacts(&r.nodes)))?;
            }
            if !r.nodes6.is_empty() {
                d.emit_pair(b"nodes6", AsString(encode_contacts6(&r.nodes6)))?;
            }
            if let Some(token) = &r.token {
                d.emit_pair(b"token", AsString(token))?;
            }
            if !r.peers.is_empty() {
                d.emit_pair(b"values", PeerList(&r.peers))?;
            }
            Ok(())
        })
    }
}

struct PeerList<'a>(&'a [SocketAddr]);

impl ToBencode for PeerList<'_> {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodingError> {
        encoder.emit_list(|l| {
            for peer in self.0 {
                l.emit(AsString(encode_endpoint(peer)))?;
            }
            Ok(())
        })
    }
}

struct ErrorBody<'a>(&'a ErrorMsg);

impl ToBencode for ErrorBody<'_> {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodingError> {
        encoder.emit_list(|l| {
            l.emit_int(self.0.code)?;
            l.emit_str(&self.0.message)
        })
    }
}

impl ToBencode for Message {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> std::result::Result<(), EncodingError> {
        encoder.emit_dict(|mut d| match self {
            Message::Query(q) => {
                d.emit_pair(b"a", QueryPayload(&q.args))?;
                d.emit_pair(b"q", &q.name)?;
                if q.read_only {
                    d.emit_pair(b"ro", 1)?;
                }
                d.emit_pair(b"t", AsString(&q.tx))?;
                d.emit_pair(b"y", "q")
            }
            Message::Reply(r) => {
                if let Some(ep) = &r.observed_endpoint {
                    d.emit_pair(b"ip", AsString(encode_endpoint(ep)))?;
                }
                d.emit_pair(b"r", ReplyPayload(r))?;
                d.emit_pair(b"t", AsString(&r.tx))?;
                d.emit_pair(b"y", "r")
            }
            Message::Error(e) => {
                d.emit_pair(b"e", ErrorBody(e))?;
                d.emit_pair(b"t", AsString(&e.tx))?;
                d.emit_pair(b"y", "e")
            }
        })
    }
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_bencode().map_err(|_| Error::Malformed("krpc encode"))
    }

    /// Strict decode: one bencoded dictionary, no trailing garbage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let mut decoder = Decoder::new(bytes);
        let object = decoder
            .next_object()
            .map_err(|_| Error::Malformed("krpc message"))?
            .ok_or(Error::Malformed("krpc message"))?;
        let message = decode_message(object)?;
        let trailing = decoder.next_object();
        match trailing {
            Ok(None) => Ok(message),
            _ => Err(Error::Malformed("trailing garbage")),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn malformed<E>(_: E) -> Error {
    Error::Malformed("krpc message")
}

fn skip_object(object: Object) -> Result<()> {
    match object {
        Object::List(l) => {
            l.into_raw().map_err(malformed)?;
        }
        Object::Dict(d) => {
            d.into_raw().map_err(malformed)?;
        }
        _ => {}
    }
    Ok(())
}

fn decode_message(object: Object) -> Result<Message> {
    let mut dict = object.try_into_dictionary().map_err(malformed)?;

    let mut tx: Option<Vec<u8>> = None;
    let mut kind: Option<u8> = None;
    let mut name: Option<String> = None;
    let mut read_only = false;
    let mut observed_endpoint = None;
    let mut args_raw: Option<Vec<u8>> = None;
    let mut reply_raw: Option<Vec<u8>> = None;
    let mut error_raw: Option<Vec<u8>> = None;

    while let Some((key, value)) = dict.next_pair().map_err(malformed)? {
        match key {
            b"t" => tx = Some(value.try_into_bytes().map_err(malformed)?.to_vec()),
            b"y" => {
                let y = value.try_into_bytes().map_err(malformed)?;
                kind = y.first().copied();
            }
            b"q" => {
                let n = value.try_into_bytes().map_err(malformed)?;
                name = Some(
                    String::from_utf8(n.to_vec()).map_err(|_| Error::Malformed("query name"))?,
                );
            }
            b"ro" => {
                if let Object::Integer(raw) = value {
                    read_only = raw == "1";
                }
            }
            b"ip" => {
                let raw = value.try_into_bytes().map_err(malformed)?;
                observed_endpoint = decode_endpoint(raw);
            }
            b"a" => {
                let d = value.try_into_dictionary().map_err(malformed)?;
                args_raw = Some(d.into_raw().map_err(malformed)?.to_vec());
            }
            b"r" => {
                let d = value.try_into_dictionary().map_err(malformed)?;
                reply_raw = Some(d.into_raw().map_err(malformed)?.to_vec());
            }
            b"e" => {
                let l = value.try_into_list().map_err(malformed)?;
                error_raw = Some(l.into_raw().map_err(malformed)?.to_vec());
            }
            _ => skip_object(value)?,
        }
    }

    let tx = tx.ok_or(Error::Malformed("missing transaction id"))?;

    match kind {
        Some(b'q') => {
            let name = name.ok_or(Error::Malformed("missing query name"))?;
            let raw = args_raw.ok_or(Error::Malformed("missing query args"))?;
            let (args, ro_in_args) = decode_query_args(&raw)?;
            Ok(Message::Query(QueryMsg {
                tx,
                name,
                args,
                read_only: read_only || ro_in_args,
            }))
        }
        Some(b'r') => {
            let raw = reply_raw.ok_or(Error::Malformed("missing reply args"))?;
            let mut reply = decode_reply_args(&raw)?;
            reply.tx = tx;
            reply.observed_endpoint = observed_endpoint;
            Ok(Message::Reply(reply))
        }
        Some(b'e') => {
            let raw = error_raw.ok_or(Error::Malformed("missing error body"))?;
            let (code, message) = decode_error_body(&raw)?;
            Ok(Message::Error(ErrorMsg { tx, code, message }))
        }
        _ => Err(Error::Malformed("message type")),
    }
}

fn decode_query_args(raw: &[u8]) -> Result<(QueryArgs, bool)> {
    let mut decoder = Decoder::new(raw);
    let object = decoder
        .next_object()
        .map_err(malformed)?
        .ok_or(Error::Malformed("query args"))?;
    let mut dict = object.try_into_dictionary().map_err(malformed)?;

    let mut args = QueryArgs::default();
    let mut read_only = false;
    while let Some((key, value)) = dict.next_pair().map_err(malformed)? {
        match key {
            b"id" => {
                args.id = NodeId::from_slice(value.try_into_bytes().map_err(malformed)?);
            }
            b"target" => {
                args.target = NodeId::from_slice(value.try_into_bytes().map_err(malformed)?);
            }
            b"info_hash" => {
                args.info_hash = NodeId::from_slice(value.try_into_bytes().map_err(malformed)?);
            }
            b"port" => {
                if let Object::Integer(raw) = value {
                    args.port = raw.parse::<u16>().ok();
                }
            }
            b"implied_port" => {
                if let Object::Integer(raw) = value {
                    args.implied_port = raw != "0";
                }
            }
            b"token" => {
                args.token = Some(value.try_into_bytes().map_err(malformed)?.to_vec());
            }
            b"ro" => {
                if let Object::Integer(raw) = value {
                    read_only = raw == "1";
                }
            }
            _ => skip_object(value)?,
        }
    }
    Ok((args, read_only))
}

fn decode_reply_args(raw: &[u8]) -> Result<ReplyMsg> {
    let mut decoder = Decoder::new(raw);
    let object = decoder
        .next_object()
        .map_err(malformed)?
        .ok_or(Error::Malformed("reply args"))?;
    let mut dict = object.try_into_dictionary().map_err(malformed)?;

    let mut reply = ReplyMsg::default();
    while let Some((key, value)) = dict.next_pair().map_err(malformed)? {
        match key {
            b"id" => {
                reply.id = NodeId::from_slice(value.try_into_bytes().map_err(malformed)?);
            }
            b"nodes" => {
                reply.nodes = decode_contacts(value.try_into_bytes().map_err(malformed)?)?;
            }
            b"nodes6" => {
                reply.nodes6 = decode_contacts6(value.try_into_bytes().map_err(malformed)?)?;
            }
            b"token" => {
                reply.token = Some(value.try_into_bytes().map_err(malformed)?.to_vec());
            }
            b"values" => {
                let mut list = value.try_into_list().map_err(malformed)?;
                while let Some(item) = list.next_object().map_err(malformed)? {
                    let raw = item.try_into_bytes().map_err(malformed)?;
                    if let Some(ep) = decode_endpoint(raw) {
                        reply.peers.push(ep);
                    }
                }
            }
            _ => skip_object(value)?,
        }
    }
    Ok(reply)
}

fn decode_error_body(raw: &[u8]) -> Result<(i64, String)> {
    let mut decoder = Decoder::new(raw);
    let object = decoder
        .next_object()
        .map_err(malformed)?
        .ok_or(Error::Malformed("error body"))?;
    let mut list = object.try_into_list().map_err(malformed)?;

    let code = match list.next_object().map_err(malformed)? {
        Some(Object::Integer(raw)) => raw.parse::<i64>().map_err(malformed)?,
        _ => return Err(Error::Malformed("error code")),
    };
    let message = match list.next_object().map_err(malformed)? {
        Some(obj) => {
            String::from_utf8_lossy(obj.try_into_bytes().map_err(malformed)?).into_owned()
        }
        None => String::new(),
    };
    while let Some(extra) = list.next_object().map_err(malformed)? {
        skip_object(extra)?;
    }
    Ok((code, message))
}
