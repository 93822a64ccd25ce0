//! End-to-end distributed cache: one peer injects and serves a signed
//! response, another discovers it through the DHT swarm, fetches it,
//! verifies it block by block and keeps its own copy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::net::{TcpListener, UdpSocket};

use cachet::cache::CacheClient;
use cachet::response::{Part, PartReader, Reader};
use cachet::stream::SigningReader;
use cachet::DhtNode;

const URL: &str = "https://example.com/data.bin";
const INJECTION_ID: &str = "7f000001-aaaa-bbbb-cccc-000000000001";

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

fn body() -> Vec<u8> {
    // Two blocks: one full 64 KiB block plus a short tail.
    (0..70_000u32).map(|i| (i % 251) as u8).collect()
}

fn origin_response() -> Vec<u8> {
    let body = body();
    let mut raw = format!(
        "HTTP/1.1 200 OK\r\n\
         Date: Wed, 01 Jul 2026 10:00:00 GMT\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(&body);
    raw
}

/// Bind a TCP listener and a DHT node sharing one port number, so the
/// implied-port announce points at the serving socket.
async fn peer(seeds: &[String]) -> (DhtNode, TcpListener) {
    // Reserve a port where both protocols are free.
    loop {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let udp_free = UdpSocket::bind(("127.0.0.1", port)).await.is_ok();
        if !udp_free {
            continue;
        }
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        match DhtNode::bootstrap(bind, seeds).await {
            Ok(node) => return (node, listener),
            Err(_) => continue,
        }
    }
}

#[tokio::test]
async fn load_fetches_verifies_and_stores_from_a_peer() {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    // The provider and two more swarm members (announce records live on
    // the nodes closest to the infohash, never on the announcer itself).
    let (node_a, listener_a) = peer(&[]).await;
    let seeds = vec![node_a.local_addr().to_string()];
    let (node_b, _listener_b) = peer(&seeds).await;
    let (node_c, _listener_c) = peer(&seeds).await;

    let dir_a = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let pk = signing_key().verifying_key();

    let client_a = CacheClient::new(node_a.clone(), dir_a.path().into(), pk, None, 64)
        .await
        .unwrap();
    let client_c = CacheClient::new(node_c.clone(), dir_c.path().into(), pk, None, 64)
        .await
        .unwrap();

    // Wait until A knows the other swarm members, so its first announce
    // lands on them instead of backing off.
    for _ in 0..100 {
        if node_a.node_count().await >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Inject on A and serve it to the swarm.
    let origin = Reader::new(std::io::Cursor::new(origin_response()));
    let mut signer = SigningReader::new(origin, URL, INJECTION_ID, now, signing_key());
    client_a.store_response(URL, &mut signer).await.unwrap();
    let server = {
        let client_a = client_a.clone();
        tokio::spawn(async move { client_a.serve(listener_a).await })
    };

    // C discovers A through the swarm and fetches the entry. The announce
    // runs in the background, so retry until it has propagated.
    let mut session = None;
    for _ in 0..100 {
        match client_c.load(URL).await {
            Ok(found) => {
                session = Some(found);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let mut session = session.expect("entry should be discoverable via the DHT");

    assert_eq!(session.head().status, 200);
    assert_eq!(
        session.head().headers.get("X-Ouinet-URI"),
        Some(URL)
    );

    let mut fetched = Vec::new();
    while let Some(part) = session.read_part().await.unwrap() {
        if let Part::ChunkBody(data) = part {
            fetched.extend_from_slice(&data);
        }
    }
    assert_eq!(fetched, body());

    // The tee persisted the entry on C as well.
    let mut cached_locally = false;
    for _ in 0..50 {
        if client_c.load_local(URL).await.is_ok() {
            cached_locally = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cached_locally, "fetched entry should be stored locally");

    server.abort();
    node_a.shutdown().await;
    node_b.shutdown().await;
    node_c.shutdown().await;
}
