//! # Signed HTTP Responses
//!
//! Wire format for cryptographically signed responses, after
//! draft-cavage-http-signatures-11 with algorithm `hs2019` (Ed25519):
//!
//! - `X-Ouinet-Sig0`: initial signature over the head as first sent,
//!   binding status, injection metadata and block-signature parameters.
//! - `ouisig` chunk extensions: per-block signatures over
//!   `INJECTION_ID ‖ NUL ‖ HASH[i]`, with `HASH[0] = SHA-512(BLOCK[0])`
//!   and `HASH[i] = SHA-512(HASH[i-1] ‖ BLOCK[i])`. An optional `ouihash`
//!   extension carries the previous chain hash for mid-stream starts.
//! - `X-Ouinet-Sig1`: final trailer signature that additionally covers
//!   `X-Ouinet-Data-Size` and the body `Digest`. Once received, it
//!   supersedes `Sig0`.
//!
//! Verification accepts any number of `X-Ouinet-Sig*` headers: signatures
//! by unknown keys are preserved, malformed or failing ones are dropped,
//! at least one must check out, and headers covered by no good signature
//! are stripped from the verified head.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::response::{Head, Headers};

/// Common prefix of all protocol headers.
pub const HEADER_PREFIX: &str = "X-Ouinet-";
/// Protocol version header and current value.
pub const VERSION_HDR: &str = "X-Ouinet-Version";
pub const PROTOCOL_VERSION: &str = "0";
/// The original request URI, so a stored response stands on its own.
pub const URI_HDR: &str = "X-Ouinet-URI";
/// Injection identifier and timestamp: `id=<uuid>,ts=<unix-seconds>`.
pub const INJECTION_HDR: &str = "X-Ouinet-Injection";
/// Block-signature parameters: key id, algorithm and block size.
pub const BSIGS_HDR: &str = "X-Ouinet-BSigs";
/// Body length in bytes, carried in the trailer.
pub const DATA_SIZE_HDR: &str = "X-Ouinet-Data-Size";
/// Signature header prefix; `Sig0` is initial, `Sig1` final.
pub const SIG_HDR_PREFIX: &str = "X-Ouinet-Sig";
pub const INITIAL_SIG_HDR: &str = "X-Ouinet-Sig0";
pub const FINAL_SIG_HDR: &str = "X-Ouinet-Sig1";
/// Chunk-extension names for block signatures and chain hashes.
pub const BLOCK_SIG_EXT: &str = "ouisig";
pub const BLOCK_CHAIN_HASH_EXT: &str = "ouihash";
/// The only supported signature algorithm.
pub const SIG_ALGORITHM: &str = "hs2019";
/// Size of one signed data block.
pub const DATA_BLOCK_SIZE: usize = 65536;

const KEY_ID_PREFIX: &str = "ed25519=";

/// `ed25519=<base64 raw public key>`.
pub fn key_id_for(pk: &VerifyingKey) -> String {
    format!("{KEY_ID_PREFIX}{}", BASE64.encode(pk.as_bytes()))
}

pub fn decode_key_id(key_id: &str) -> Option<VerifyingKey> {
    let encoded = key_id.strip_prefix(KEY_ID_PREFIX)?;
    let bytes = BASE64.decode(encoded).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

/// `Digest` header value for a SHA-256 body digest.
pub fn http_digest(digest: &[u8; 32]) -> String {
    format!("SHA-256={}", BASE64.encode(digest))
}

// ---------------------------------------------------------------------------
// Signature string construction
// ---------------------------------------------------------------------------

/// Lowercase header names in input order; repeated headers collapse into
/// one entry with trimmed, comma-concatenated values.
fn prep_sig_head(head: &Head) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    out.push(("(response-status)".into(), head.status.to_string()));
    for (name, value) in head.headers.iter() {
        let name = name.to_ascii_lowercase();
        let value = value.trim();
        match out.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => out.push((name, value.to_string())),
        }
    }
    out
}

/// The `name: value` lines joined by LF, and the space-separated header
/// list that goes into the `headers=` parameter.
fn sig_string_and_headers(sig_head: &[(String, String)]) -> (String, String) {
    let mut sig_string = String::new();
    let mut headers = String::new();
    for (i, (name, value)) in sig_head.iter().enumerate() {
        if i > 0 {
            sig_string.push('\n');
            headers.push(' ');
        }
        sig_string.push_str(name);
        sig_string.push_str(": ");
        sig_string.push_str(value);
        headers.push_str(name);
    }
    (sig_string, headers)
}

/// Produce a `Signature:`-style header value signing `head`.
pub fn http_signature(head: &Head, sk: &SigningKey, key_id: &str, created: i64) -> String {
    let mut sig_head = prep_sig_head(head);
    // `(created)` goes right after `(response-status)`.
    sig_head.insert(1, ("(created)".into(), created.to_string()));

    let (sig_string, headers) = sig_string_and_headers(&sig_head);
    let signature = BASE64.encode(sk.sign(sig_string.as_bytes()).to_bytes());

    format!(
        "keyId=\"{key_id}\",algorithm=\"{SIG_ALGORITHM}\",created={created},\
         headers=\"{headers}\",signature=\"{signature}\""
    )
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

/// Add injection headers to an origin response head and sign it.
///
/// The returned head declares chunked transfer encoding and the trailers
/// that will carry the body digest and final signature.
pub fn injection_head(
    uri: &str,
    mut head: Head,
    injection_id: &str,
    injection_ts: i64,
    sk: &SigningKey,
    key_id: &str,
) -> Head {
    head.headers.set(VERSION_HDR, PROTOCOL_VERSION);
    head.headers.set(URI_HDR, uri);
    head.headers.set(
        INJECTION_HDR,
        format!("id={injection_id},ts={injection_ts}"),
    );
    head.headers.set(
        BSIGS_HDR,
        format!(
            "keyId=\"{key_id}\",algorithm=\"{SIG_ALGORITHM}\",size={DATA_BLOCK_SIZE}"
        ),
    );

    let to_sign = head.without_framing();
    head.headers.set(
        INITIAL_SIG_HDR,
        http_signature(&to_sign, sk, key_id, injection_ts),
    );

    // Declare chunked framing and the pending trailer headers.
    head.headers.remove("Content-Length");
    head.headers.set("Transfer-Encoding", "chunked");
    let trailer = match head.headers.get("Trailer") {
        Some(existing) if !existing.is_empty() => {
            format!("{existing}, {DATA_SIZE_HDR}, Digest, {FINAL_SIG_HDR}")
        }
        _ => format!("{DATA_SIZE_HDR}, Digest, {FINAL_SIG_HDR}"),
    };
    head.headers.set("Trailer", trailer);
    head
}

/// Build the signed trailer: `X-Ouinet-Data-Size`, `Digest`, and the final
/// signature over the whole head (minus the initial signature and framing).
pub fn injection_trailer(
    head: &Head,
    mut trailer: Headers,
    content_length: u64,
    content_digest: &[u8; 32],
    sk: &SigningKey,
    key_id: &str,
    ts: i64,
) -> Headers {
    trailer.set(DATA_SIZE_HDR, content_length.to_string());
    trailer.set("Digest", http_digest(content_digest));

    let mut to_sign = head.without_framing();
    to_sign.headers.remove(INITIAL_SIG_HDR);
    for (name, value) in trailer.iter() {
        to_sign.headers.set(name, value);
    }

    trailer.set(FINAL_SIG_HDR, http_signature(&to_sign, sk, key_id, ts));
    trailer
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// A parsed `Signature:`-style header value.
#[derive(Debug, Clone, Default)]
pub struct HttpSignature {
    pub key_id: String,
    pub algorithm: String,
    pub created: String,
    pub expires: String,
    pub headers: String,
    pub signature: String,
}

// A comma is inside quotes if the number of quotes before it is odd.
fn has_comma_in_quotes(s: &str) -> bool {
    let mut quotes_seen = 0;
    for c in s.chars() {
        match c {
            '"' => quotes_seen += 1,
            ',' if quotes_seen % 2 != 0 => return true,
            _ => {}
        }
    }
    false
}

fn unquote(value: &str) -> Option<&str> {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

impl HttpSignature {
    pub fn parse(sig: &str) -> Option<HttpSignature> {
        if has_comma_in_quotes(sig) {
            warn!("commas in quoted signature arguments are not supported");
            return None;
        }

        let mut hs = HttpSignature {
            // A missing list is not the same as an empty one.
            headers: "(created)".into(),
            ..HttpSignature::default()
        };

        for item in sig.split(',') {
            let (key, value) = item.split_once('=')?;
            let key = key.trim();
            match key {
                // Unquoted values.
                "created" => hs.created = value.into(),
                "expires" => hs.expires = value.into(),
                // Quoted values.
                "keyId" => hs.key_id = unquote(value)?.into(),
                "algorithm" => hs.algorithm = unquote(value)?.into(),
                "headers" => hs.headers = unquote(value)?.into(),
                "signature" => hs.signature = unquote(value)?.into(),
                _ => return None,
            }
        }

        if hs.key_id.is_empty() || hs.signature.is_empty() {
            warn!("HTTP signature with empty key id or signature");
            return None;
        }
        Some(hs)
    }

    /// Flattened, trimmed, comma-joined values of `name`, or `None` when
    /// the header is missing entirely.
    fn flatten_header_values(head: &Head, name: &str) -> Option<String> {
        let mut out: Option<String> = None;
        for value in head.headers.values(name) {
            let value = value.trim();
            match &mut out {
                Some(s) => {
                    s.push_str(", ");
                    s.push_str(value);
                }
                None => out = Some(value.to_string()),
            }
        }
        out
    }

    fn verification_head(&self, head: &Head) -> Option<Vec<(String, String)>> {
        let mut vh = Vec::new();
        for name in self.headers.split(' ').filter(|n| !n.is_empty()) {
            if !name.starts_with('(') {
                // A listed header missing from the head fails verification;
                // an empty one is fine.
                let value = Self::flatten_header_values(head, name)?;
                vh.push((name.to_string(), value));
            } else if name == "(response-status)" {
                vh.push((name.to_string(), head.status.to_string()));
            } else if name == "(created)" {
                vh.push((name.to_string(), self.created.clone()));
            } else if name == "(expires)" {
                vh.push((name.to_string(), self.expires.clone()));
            } else {
                warn!(pseudo = name, "unknown signature pseudo-header");
                return None;
            }
        }
        Some(vh)
    }

    /// Check this signature against `head` with `pk`. On success, also
    /// report the headers *not* covered by the signature.
    pub fn verify(&self, head: &Head, pk: &VerifyingKey) -> (bool, Headers) {
        let vh = match self.verification_head(head) {
            Some(vh) => vh,
            None => return (false, Headers::new()),
        };
        let (sig_string, _) = sig_string_and_headers(&vh);

        let decoded = match BASE64.decode(&self.signature) {
            Ok(d) => d,
            Err(_) => return (false, Headers::new()),
        };
        let sig_bytes: [u8; 64] = match decoded.try_into() {
            Ok(b) => b,
            Err(_) => {
                warn!("invalid HTTP signature length");
                return (false, Headers::new());
            }
        };
        if pk
            .verify(sig_string.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .is_err()
        {
            return (false, Headers::new());
        }

        let covered: Vec<&str> = vh.iter().map(|(n, _)| n.as_str()).collect();
        let mut extra = Headers::new();
        for (name, value) in head.headers.iter() {
            if !covered
                .iter()
                .any(|c| c.eq_ignore_ascii_case(name))
            {
                extra.insert(name, value);
            }
        }
        (true, extra)
    }
}

pub(crate) fn is_signature_header(name: &str) -> bool {
    let prefix = SIG_HDR_PREFIX.as_bytes();
    let name = name.as_bytes();
    name.len() > prefix.len()
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
        && name[prefix.len()..].iter().all(|b| b.is_ascii_digit())
}

/// Verify a signed head against `pk`.
///
/// Returns the head with failing signatures dropped, surviving ones
/// renumbered from `X-Ouinet-Sig0`, and headers covered by no good
/// signature removed. Fails with `BadSignature` if no signature checks out.
pub fn injection_verify(head: &Head, pk: &VerifyingKey) -> Result<Head> {
    let mut sig_headers: Vec<(String, String)> = Vec::new();
    let mut out = head.clone();
    let mut to_verify = head.without_framing();
    for (name, value) in head.headers.iter() {
        if is_signature_header(name) {
            sig_headers.push((name.to_string(), value.to_string()));
        }
    }
    for (name, _) in &sig_headers {
        to_verify.headers.remove(name);
        out.headers.remove(name);
    }

    let our_key_id = key_id_for(pk);
    let mut sig_ok = false;
    // All headers are extra until some good signature covers them.
    let mut extra: Option<Headers> = None;
    let mut kept: Vec<String> = Vec::new();

    for (name, value) in &sig_headers {
        let sig = match HttpSignature::parse(value) {
            Some(sig) => sig,
            None => {
                warn!(header = %name, "malformed HTTP signature");
                continue; // drop
            }
        };
        if sig.key_id != our_key_id {
            debug!(header = %name, "unknown key for HTTP signature");
            kept.push(value.clone());
            continue;
        }
        if !sig.algorithm.is_empty() && sig.algorithm != SIG_ALGORITHM {
            warn!(header = %name, algorithm = %sig.algorithm, "unsupported signature algorithm");
            continue; // drop
        }
        let (ok, not_covered) = sig.verify(&to_verify, pk);
        if !ok {
            warn!(header = %name, "head does not match HTTP signature");
            continue; // drop
        }
        sig_ok = true;
        kept.push(value.clone());
        extra = Some(match extra {
            // Intersect: still extra only if this signature misses it too.
            Some(prev) => {
                let mut next = Headers::new();
                for (n, v) in prev.iter() {
                    if not_covered.values(n).any(|nv| nv == v) {
                        next.insert(n, v);
                    }
                }
                next
            }
            None => not_covered,
        });
    }

    if !sig_ok {
        return Err(Error::BadSignature);
    }

    if let Some(extra) = extra {
        for (name, _) in extra.iter() {
            if !is_signature_header(name) {
                debug!(header = %name, "dropping header not covered by any signature");
            }
        }
        for (name, _) in extra.iter() {
            out.headers.remove(name);
        }
    }
    for (i, value) in kept.into_iter().enumerate() {
        out.headers.insert(format!("{SIG_HDR_PREFIX}{i}"), value);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Block signatures
// ---------------------------------------------------------------------------

/// Parsed `X-Ouinet-BSigs` parameters.
#[derive(Debug, Clone)]
pub struct BlockSigs {
    pub pk: VerifyingKey,
    pub algorithm: String,
    pub size: u64,
}

impl BlockSigs {
    pub fn parse(bsigs: &str) -> Option<BlockSigs> {
        if has_comma_in_quotes(bsigs) {
            warn!("commas in quoted block-signature arguments are not supported");
            return None;
        }

        let mut pk = None;
        let mut algorithm = String::new();
        let mut size = 0u64;
        for item in bsigs.split(',') {
            let (key, value) = item.split_once('=')?;
            match key.trim() {
                "size" => size = value.trim().parse().ok().unwrap_or(0),
                "keyId" => pk = decode_key_id(unquote(value)?),
                "algorithm" => algorithm = unquote(value)?.into(),
                _ => return None,
            }
        }

        let pk = match pk {
            Some(pk) => pk,
            None => {
                warn!("missing or invalid key id in block signatures header");
                return None;
            }
        };
        if algorithm != SIG_ALGORITHM {
            warn!("missing or invalid algorithm in block signatures header");
            return None;
        }
        if size == 0 {
            warn!("missing or invalid size in block signatures header");
            return None;
        }
        Some(BlockSigs {
            pk,
            algorithm,
            size,
        })
    }
}

/// The byte string a data block signature covers:
/// `INJECTION_ID ‖ NUL ‖ CHAIN_HASH`.
pub fn block_sig_payload(injection_id: &str, chain_digest: &[u8; 64]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(injection_id.len() + 1 + 64);
    payload.extend_from_slice(injection_id.as_bytes());
    payload.push(0);
    payload.extend_from_slice(chain_digest);
    payload
}

/// Chunk-extension string carrying a block signature and, optionally, the
/// previous chain hash.
pub fn block_chunk_ext(sig: Option<&[u8; 64]>, prev_digest: Option<&[u8; 64]>) -> String {
    let mut exts = String::new();
    if let Some(sig) = sig {
        exts.push_str(&format!(";{BLOCK_SIG_EXT}=\"{}\"", BASE64.encode(sig)));
    }
    if let Some(digest) = prev_digest {
        exts.push_str(&format!(
            ";{BLOCK_CHAIN_HASH_EXT}=\"{}\"",
            BASE64.encode(digest)
        ));
    }
    exts
}

/// Sign one block digest and wrap the signature in a chunk extension.
pub fn signed_block_chunk_ext(
    injection_id: &str,
    chain_digest: &[u8; 64],
    sk: &SigningKey,
) -> String {
    let payload = block_sig_payload(injection_id, chain_digest);
    let sig = sk.sign(&payload).to_bytes();
    block_chunk_ext(Some(&sig), None)
}

fn chunk_ext_value<'a>(exts: &'a str, wanted: &str) -> Option<&'a str> {
    for token in exts.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((name, value)) = token.split_once('=') {
            if name == wanted {
                return unquote(value).or(Some(value));
            }
        }
    }
    None
}

/// Extract a block signature from a chunk-extension string.
pub fn block_sig_from_exts(exts: &str) -> Option<[u8; 64]> {
    let value = chunk_ext_value(exts, BLOCK_SIG_EXT)?;
    let decoded = BASE64.decode(value).ok()?;
    match decoded.try_into() {
        Ok(sig) => Some(sig),
        Err(_) => {
            warn!("malformed data block signature");
            None
        }
    }
}

/// Extract a chain hash (`ouihash`) from a chunk-extension string.
pub fn chain_hash_from_exts(exts: &str) -> Option<[u8; 64]> {
    let value = chunk_ext_value(exts, BLOCK_CHAIN_HASH_EXT)?;
    let decoded = BASE64.decode(value).ok()?;
    decoded.try_into().ok()
}

#[cfg(test)]
pub(crate) mod test_vectors {
    //! Shared fixture: a response signed with a fixed key, injection id
    //! and timestamp, split into three 65,536-byte-max blocks.

    use super::*;

    pub const INJ_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";
    pub const INJ_TS: i64 = 1516048310;
    pub const URI: &str = "https://example.com/foo";
    pub const SK_B64: &str = "MfWAV5YllPAPeMuLXwN2mUkV9YaSSJVUcj/2YOaFmwQ=";
    pub const PK_B64: &str = "DlBwx8WbSsZP7eni20bf5VKUH3t1XAF/+hlDoLbZzuw=";
    pub const BODY_DIGEST: &str = "SHA-256=E4RswXyAONCaILm5T/ZezbHI87EKvKIdxURKxiVHwKE=";

    pub const BLOCK_SIGS_B64: [&str; 3] = [
        "AwiYuUjLYh/jZz9d0/ev6dpoWqjU/sUWUmGL36/D9tI30oaqFgQGgcbVCyBtl0a7x4saCmxRHC4JW7cYEPWwCw==",
        "c+ZJUJI/kc81q8sLMhwe813Zdc+VPa4DejdVkO5ZhdIPPojbZnRt8OMyFMEiQtHYHXrZIK2+pKj2AO03j70TBA==",
        "m6sz1NpU/8iF6KNN6drY+Yk361GiW0lfa0aaX5TH0GGW/L5GsHyg8ozA0ejm29a+aTjp/qIoI1VrEVj1XG/gDA==",
    ];

    pub const BLOCK_CHAIN_HASHES_B64: [&str; 2] = [
        "aERfr5o+kpvR4ZH7xC0mBJ4QjqPUELDzjmzt14WmntxH2p3EQmATZODXMPoFiXaZL6KNI50Ve4WJf/x3ma4ieA==",
        "slwciqMQBddB71VWqpba+MpP9tBiyTE/XFmO5I1oiVJy3iFniKRkksbP78hCEWOM6tH31TGEFWP1loa4pqrLww==",
    ];

    pub fn signing_key() -> SigningKey {
        let bytes: [u8; 32] = BASE64.decode(SK_B64).unwrap().try_into().unwrap();
        SigningKey::from_bytes(&bytes)
    }

    pub fn public_key() -> VerifyingKey {
        signing_key().verifying_key()
    }

    pub fn body_blocks() -> [Vec<u8>; 3] {
        let fill = DATA_BLOCK_SIZE - 8;
        let mut b0 = b"0123".to_vec();
        b0.extend(std::iter::repeat(b'x').take(fill));
        b0.extend_from_slice(b"4567");
        let mut b1 = b"89AB".to_vec();
        b1.extend(std::iter::repeat(b'x').take(fill));
        b1.extend_from_slice(b"CDEF");
        [b0, b1, b"abcd".to_vec()]
    }

    pub fn body() -> Vec<u8> {
        body_blocks().concat()
    }

    /// The origin response head before injection.
    pub fn origin_head() -> Head {
        let mut head = Head::new(200);
        head.headers.insert("Date", "Mon, 15 Jan 2018 20:31:50 GMT");
        head.headers.insert("Server", "Apache1");
        head.headers.insert("Content-Type", "text/html");
        head.headers
            .insert("Content-Disposition", "inline; filename=\"foo.html\"");
        head.headers.insert("Content-Length", "131076");
        head.headers.insert("Server", "Apache2");
        head
    }
}

#[cfg(test)]
mod tests {
    use super::test_vectors::*;
    use super::*;
    use sha2::{Digest, Sha256, Sha512};

    #[test]
    fn key_id_round_trip() {
        let pk = public_key();
        assert_eq!(BASE64.encode(pk.as_bytes()), PK_B64);
        let key_id = key_id_for(&pk);
        assert_eq!(key_id, format!("ed25519={PK_B64}"));
        assert_eq!(decode_key_id(&key_id), Some(pk));
        assert_eq!(decode_key_id("ed25519=garbage"), None);
        assert_eq!(decode_key_id("rsa=abcd"), None);
    }

    #[test]
    fn body_digest_matches_vector() {
        let digest: [u8; 32] = Sha256::digest(body()).into();
        assert_eq!(http_digest(&digest), BODY_DIGEST);
    }

    fn signed_head_with_trailer_merged() -> Head {
        let sk = signing_key();
        let key_id = key_id_for(&public_key());
        let mut head = injection_head(URI, origin_head(), INJ_ID, INJ_TS, &sk, &key_id);

        let digest: [u8; 32] = Sha256::digest(body()).into();
        let trailer = injection_trailer(
            &head,
            Headers::new(),
            body().len() as u64,
            &digest,
            &sk,
            &key_id,
            INJ_TS + 1,
        );
        for (name, value) in trailer.iter() {
            head.headers.set(name, value);
        }
        head
    }

    #[test]
    fn injection_head_signs_expected_header_list() {
        let head = signed_head_with_trailer_merged();

        assert_eq!(head.headers.get(VERSION_HDR), Some(PROTOCOL_VERSION));
        assert_eq!(head.headers.get(URI_HDR), Some(URI));
        assert_eq!(
            head.headers.get(INJECTION_HDR),
            Some(format!("id={INJ_ID},ts={INJ_TS}").as_str())
        );
        assert_eq!(head.headers.get("Transfer-Encoding"), Some("chunked"));
        assert_eq!(
            head.headers.get("Trailer"),
            Some("X-Ouinet-Data-Size, Digest, X-Ouinet-Sig1")
        );
        assert!(head.headers.get("Content-Length").is_none());
        assert_eq!(head.headers.get(DATA_SIZE_HDR), Some("131076"));
        assert_eq!(head.headers.get("Digest"), Some(BODY_DIGEST));

        let sig0 = HttpSignature::parse(head.headers.get(INITIAL_SIG_HDR).unwrap()).unwrap();
        assert_eq!(
            sig0.headers,
            "(response-status) (created) date server content-type content-disposition \
             x-ouinet-version x-ouinet-uri x-ouinet-injection x-ouinet-bsigs"
        );
        assert_eq!(sig0.created, INJ_TS.to_string());

        let sig1 = HttpSignature::parse(head.headers.get(FINAL_SIG_HDR).unwrap()).unwrap();
        assert_eq!(
            sig1.headers,
            "(response-status) (created) date server content-type content-disposition \
             x-ouinet-version x-ouinet-uri x-ouinet-injection x-ouinet-bsigs \
             x-ouinet-data-size digest"
        );
    }

    #[test]
    fn verify_accepts_good_head_and_strips_extras() {
        let mut head = signed_head_with_trailer_merged();
        // An unexpected header does not break verification but is removed.
        head.headers.insert("X-Foo", "bar");
        // Moving a header while keeping its value is harmless.
        let date = head.headers.get("Date").unwrap().to_string();
        head.headers.remove("Date");
        head.headers.insert("Date", date);

        let verified = injection_verify(&head, &public_key()).unwrap();
        assert!(verified.headers.get("X-Foo").is_none());
        assert!(verified.headers.get(INJECTION_HDR).is_some());
    }

    #[test]
    fn verify_drops_garbage_signature_but_keeps_unknown_key() {
        let head = signed_head_with_trailer_merged();
        let sig1 = head.headers.get(FINAL_SIG_HDR).unwrap().to_string();

        // A corrupted third signature is dropped from the output.
        let corrupted = sig1.replacen("signature=\"", "signature=\"GARBAGE", 1);
        let mut with_bad = head.clone();
        with_bad.headers.insert("X-Ouinet-Sig2", corrupted);
        let verified = injection_verify(&with_bad, &public_key()).unwrap();
        assert!(verified.headers.get("X-Ouinet-Sig2").is_none());

        // A signature by some other key is preserved verbatim.
        let foreign = sig1.replacen(&PK_B64[..7], "GARBAGE", 1);
        let mut with_foreign = head.clone();
        with_foreign.headers.insert("X-Ouinet-Sig2", foreign);
        let verified = injection_verify(&with_foreign, &public_key()).unwrap();
        assert!(verified.headers.get("X-Ouinet-Sig2").is_some());
    }

    #[test]
    fn verify_rejects_altered_signed_header() {
        let mut head = signed_head_with_trailer_merged();
        head.headers.set("Server", "NginX");
        assert!(matches!(
            injection_verify(&head, &public_key()),
            Err(Error::BadSignature)
        ));
    }

    #[test]
    fn verify_rejects_unsigned_head() {
        let head = origin_head();
        assert!(injection_verify(&head, &public_key()).is_err());
    }

    #[test]
    fn bsigs_parse() {
        let value = format!(
            "keyId=\"ed25519={PK_B64}\",algorithm=\"hs2019\",size=65536"
        );
        let bsigs = BlockSigs::parse(&value).unwrap();
        assert_eq!(bsigs.size, 65536);
        assert_eq!(bsigs.pk, public_key());

        assert!(BlockSigs::parse("keyId=\"ed25519=xx\",algorithm=\"hs2019\",size=65536").is_none());
        assert!(BlockSigs::parse(&format!(
            "keyId=\"ed25519={PK_B64}\",algorithm=\"rsa\",size=65536"
        ))
        .is_none());
        assert!(BlockSigs::parse(&format!(
            "keyId=\"ed25519={PK_B64}\",algorithm=\"hs2019\",size=0"
        ))
        .is_none());
    }

    #[test]
    fn first_block_signature_matches_vector() {
        let blocks = body_blocks();
        let digest: [u8; 64] = Sha512::digest(&blocks[0]).into();
        let exts = signed_block_chunk_ext(INJ_ID, &digest, &signing_key());
        assert_eq!(exts, format!(";ouisig=\"{}\"", BLOCK_SIGS_B64[0]));

        let sig = block_sig_from_exts(&exts).unwrap();
        let payload = block_sig_payload(INJ_ID, &digest);
        assert!(public_key()
            .verify(&payload, &Signature::from_bytes(&sig))
            .is_ok());
    }

    #[test]
    fn chunk_ext_parsing() {
        let digest = [7u8; 64];
        let sig = [9u8; 64];
        let exts = block_chunk_ext(Some(&sig), Some(&digest));
        assert_eq!(block_sig_from_exts(&exts), Some(sig));
        assert_eq!(chain_hash_from_exts(&exts), Some(digest));

        assert_eq!(block_sig_from_exts(""), None);
        assert_eq!(block_sig_from_exts(";other=\"x\""), None);
        // Wrong length signatures are rejected.
        assert_eq!(
            block_sig_from_exts(&format!(";ouisig=\"{}\"", BASE64.encode([1u8; 10]))),
            None
        );
    }

    #[test]
    fn signature_parse_requirements() {
        assert!(HttpSignature::parse("").is_none());
        assert!(HttpSignature::parse("keyId=\"k\"").is_none()); // no signature
        assert!(HttpSignature::parse("signature=\"s\"").is_none()); // no key
        let hs = HttpSignature::parse("keyId=\"k\",signature=\"s\"").unwrap();
        assert_eq!(hs.headers, "(created)"); // default
        assert!(HttpSignature::parse("keyId=\"k\",signature=\"s\",bogus=\"v\"").is_none());
        assert!(HttpSignature::parse("keyId=\"a,b\",signature=\"s\"").is_none());
    }
}
