//! # Node Identity and XOR Metric
//!
//! 160-bit identifiers used both for DHT nodes and for content infohashes:
//!
//! - [`NodeId`]: fixed 20-byte value with bit access and XOR distance
//! - [`NodeId::for_endpoint`]: BEP-42 id derivation from an external IP
//! - [`infohash`]: SHA-1 of a URL, the key content is announced under
//!
//! Distance between two ids is their bytewise XOR, compared
//! lexicographically. `closer_to(ref, a, b)` is a strict total order for
//! any fixed reference, which is what keeps lookup candidate maps sorted.

use std::fmt;
use std::net::IpAddr;

use rand::Rng;
use sha1::{Digest, Sha1};

/// Number of bits in a node id.
pub const ID_BITS: usize = 160;

/// A 160-bit DHT identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 20]);

/// XOR distance between two ids. Lexicographic order on this type is
/// closeness order.
pub type Distance = [u8; 20];

impl NodeId {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        NodeId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(NodeId(arr))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Bit `n`, most-significant first.
    pub fn bit(&self, n: usize) -> bool {
        debug_assert!(n < ID_BITS);
        self.0[n / 8] & (0x80 >> (n % 8)) != 0
    }

    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// A random id whose first `depth` bits match `self`, with the rest
    /// uniformly random. Used for per-bucket refresh lookups.
    pub fn random_in_prefix(&self, depth: usize, rng: &mut impl Rng) -> NodeId {
        let mut out = [0u8; 20];
        rng.fill(&mut out[..]);
        let full_bytes = depth / 8;
        let rem_bits = depth % 8;
        out[..full_bytes].copy_from_slice(&self.0[..full_bytes]);
        if rem_bits > 0 {
            let mask = 0xffu8 << (8 - rem_bits);
            out[full_bytes] = (self.0[full_bytes] & mask) | (out[full_bytes] & !mask);
        }
        NodeId(out)
    }

    /// Derive a BEP-42 compliant id for a node reachable at `ip`.
    ///
    /// The checksum's top 21 bits land in bytes 0..2; the 3-bit nonce is
    /// kept in the low bits of byte 19 so peers can re-verify the id.
    pub fn for_endpoint(ip: &IpAddr, rng: &mut impl Rng) -> NodeId {
        let nonce = rng.gen::<u8>() & 0x07;
        let checksum = bep42_checksum(ip, nonce);

        let mut id = [0u8; 20];
        id[0] = (checksum >> 24) as u8;
        id[1] = (checksum >> 16) as u8;
        id[2] = ((checksum >> 8) as u8 & 0xe0) | (rng.gen::<u8>() & 0x1f);
        rng.fill(&mut id[3..19]);
        id[19] = (rng.gen::<u8>() & !0x07) | nonce;
        NodeId(id)
    }

    /// Whether this id is a valid BEP-42 derivation for `ip`.
    pub fn matches_endpoint(&self, ip: &IpAddr) -> bool {
        let nonce = self.0[19] & 0x07;
        let checksum = bep42_checksum(ip, nonce);
        self.0[0] == (checksum >> 24) as u8
            && self.0[1] == (checksum >> 16) as u8
            && self.0[2] & 0xe0 == (checksum >> 8) as u8 & 0xe0
    }
}

/// True iff `a` is strictly closer to `reference` than `b` under the XOR
/// metric.
pub fn closer_to(reference: &NodeId, a: &NodeId, b: &NodeId) -> bool {
    for i in 0..20 {
        let da = a.0[i] ^ reference.0[i];
        let db = b.0[i] ^ reference.0[i];
        if da < db {
            return true;
        }
        if db < da {
            return false;
        }
    }
    false
}

/// The DHT key a URL's content is announced under: SHA-1 of the URL.
pub fn infohash(url: &str) -> NodeId {
    let digest: [u8; 20] = Sha1::digest(url.as_bytes()).into();
    NodeId(digest)
}

fn bep42_checksum(ip: &IpAddr, nonce: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            const MASK: [u8; 4] = [0xfc, 0xc0, 0x0f, 0x01];
            let mut bytes = v4.octets();
            for (b, m) in bytes.iter_mut().zip(MASK) {
                *b &= m;
            }
            bytes[0] |= nonce << 5;
            crc32c::crc32c(&bytes)
        }
        IpAddr::V6(v6) => {
            const MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&v6.octets()[..8]);
            for (b, m) in bytes.iter_mut().zip(MASK) {
                *b &= m;
            }
            bytes[0] |= nonce << 5;
            crc32c::crc32c(&bytes)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;

    fn id_with_last(byte: u8) -> NodeId {
        let mut b = [0u8; 20];
        b[19] = byte;
        NodeId::from_bytes(b)
    }

    #[test]
    fn closer_to_orders_by_xor_distance() {
        let reference = NodeId::from_bytes([0u8; 20]);
        let a = id_with_last(0x01);
        let mut b_bytes = [0u8; 20];
        b_bytes[0] = 0x80;
        let b = NodeId::from_bytes(b_bytes);

        assert!(closer_to(&reference, &a, &b));
        assert!(!closer_to(&reference, &b, &a));
        assert!(!closer_to(&reference, &a, &a));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = infohash("a");
        let b = infohash("b");
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 20]);
    }

    #[test]
    fn bit_reads_most_significant_first() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0b1010_0000;
        bytes[19] = 0b0000_0001;
        let id = NodeId::from_bytes(bytes);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(id.bit(159));
        assert!(!id.bit(158));
    }

    #[test]
    fn bep42_id_carries_checksum_of_masked_ip() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let mut rng = StdRng::seed_from_u64(7);
        let id = NodeId::for_endpoint(&ip, &mut rng);

        let nonce = id.as_bytes()[19] & 0x07;
        let masked = [
            (203u8 & 0xfc) | (nonce << 5),
            0 & 0xc0,
            113 & 0x0f,
            7 & 0x01,
        ];
        let checksum = crc32c::crc32c(&masked);
        assert_eq!(id.as_bytes()[0], (checksum >> 24) as u8);
        assert_eq!(id.as_bytes()[1], (checksum >> 16) as u8);
        assert_eq!(id.as_bytes()[2] & 0xe0, (checksum >> 8) as u8 & 0xe0);
        assert!(id.matches_endpoint(&ip));
    }

    #[test]
    fn bep42_nonce_vector() {
        // Fixed nonce 0b101 against the masked-byte reference vector.
        let masked = [(203u8 & 0xfc) | (0b101 << 5), 0, 113 & 0x0f, 7 & 0x01];
        let checksum = crc32c::crc32c(&masked);
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        // Any id carrying this nonce and checksum prefix must validate.
        let mut bytes = [0u8; 20];
        bytes[0] = (checksum >> 24) as u8;
        bytes[1] = (checksum >> 16) as u8;
        bytes[2] = (checksum >> 8) as u8 & 0xe0;
        bytes[19] = 0b101;
        assert!(NodeId::from_bytes(bytes).matches_endpoint(&ip));
        bytes[1] ^= 0x01;
        assert!(!NodeId::from_bytes(bytes).matches_endpoint(&ip));
    }

    #[test]
    fn random_in_prefix_preserves_leading_bits() {
        let mut rng = StdRng::seed_from_u64(99);
        let base = infohash("prefix");
        for depth in [0usize, 1, 7, 8, 13, 21, 160] {
            let id = base.random_in_prefix(depth, &mut rng);
            for bit in 0..depth {
                assert_eq!(id.bit(bit), base.bit(bit), "depth {depth} bit {bit}");
            }
        }
    }

    #[test]
    fn infohash_is_sha1_of_url() {
        // sha1("https://example.com/foo")
        let id = infohash("https://example.com/foo");
        assert_eq!(id.to_string().len(), 40);
        assert_eq!(id, infohash("https://example.com/foo"));
        assert_ne!(id, infohash("https://example.com/bar"));
    }
}
