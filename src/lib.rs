//! # Cachet - Peer-to-Peer HTTP Content Distribution
//!
//! Cachet serves HTTP responses from a decentralized cache backed by the
//! BitTorrent Mainline DHT. Responses are split into fixed-size blocks,
//! each individually Ed25519-signed and hash-chained, so any peer can
//! redistribute content and any consumer can verify it incrementally as
//! the bytes arrive, without trusting the peer that sent them.
//!
//! ## Architecture
//!
//! The codebase uses the **actor pattern** for stateful components: the
//! DHT node is a private actor owning the routing table, swarm tracker
//! and token store, reached through a cheap-to-clone handle over async
//! channels. Everything else is cooperating tasks wired together with
//! [`response::PartReader`] pipelines.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 160-bit node ids, XOR metric, BEP-42 derivation, infohashes |
//! | `krpc` | bencoded DHT wire messages and compact contact records |
//! | `mux` | the single UDP socket: FIFO sends, fan-out receives |
//! | `routing` | split-bucket Kademlia routing table |
//! | `node` | DHT node actor: queries, inbound handlers, bootstrap |
//! | `lookup` | iterative closest-node search |
//! | `announce` | periodic per-infohash swarm announcer |
//! | `response` | HTTP response part model and chunked codec |
//! | `sign` | head/block signatures and verification |
//! | `stream` | signing and verifying stream adapters |
//! | `store` | on-disk `{head, body, sigs}` entry store |
//! | `lru` | persisted bounded LRU index |
//! | `cache` | the client tying DHT, verifier and store together |

pub mod announce;
pub mod cache;
pub mod error;
pub mod id;
pub mod krpc;
pub mod lookup;
pub mod lru;
pub mod mux;
pub mod node;
pub mod response;
pub mod routing;
pub mod sign;
pub mod store;
pub mod stream;

pub use cache::{CacheClient, Session};
pub use error::{Error, Result};
pub use id::{infohash, NodeId};
pub use node::{DhtNode, WeakDhtNode, DEFAULT_BOOTSTRAP};
