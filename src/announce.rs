//! # Swarm Announcer
//!
//! Keeps one infohash announced on the DHT: announce, sleep somewhere
//! between five and thirty minutes, repeat; on failure retry after a
//! short randomized back-off. The announcer holds only a weak handle to
//! the node, so it winds down by itself once the node is gone. Dropping
//! the announcer cancels it immediately.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::Error;
use crate::id::NodeId;
use crate::node::WeakDhtNode;

/// Re-announce period bounds.
const MIN_PERIOD: Duration = Duration::from_secs(5 * 60);
const MAX_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Retry back-off bounds after a failed announce.
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct Announcer {
    task: JoinHandle<()>,
    nudge: Arc<Notify>,
}

impl Announcer {
    pub fn new(infohash: NodeId, dht: WeakDhtNode) -> Announcer {
        let nudge = Arc::new(Notify::new());
        let task = tokio::spawn(run(infohash, dht, nudge.clone()));
        Announcer { task, nudge }
    }

    /// Skip the current sleep and announce again soon; used right after a
    /// fresh store.
    pub fn update(&self) {
        self.nudge.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn uniform(rng: &mut StdRng, min: Duration, max: Duration) -> Duration {
    Duration::from_millis(rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64))
}

async fn run(infohash: NodeId, dht: WeakDhtNode, nudge: Arc<Notify>) {
    let mut rng = StdRng::from_entropy();
    loop {
        let Some(node) = dht.upgrade() else { return };
        debug!(%infohash, "announcing");
        let result = node.tracker_announce(infohash, None).await;
        drop(node);

        let wait = match result {
            Ok(peers) => {
                debug!(%infohash, swarm = peers.len(), "announce complete");
                uniform(&mut rng, MIN_PERIOD, MAX_PERIOD)
            }
            Err(Error::Aborted) => return,
            Err(e) => {
                warn!(%infohash, error = %e, "announce failed, backing off");
                uniform(&mut rng, MIN_BACKOFF, MAX_BACKOFF)
            }
        };
        tokio::select! {
            _ = sleep(wait) => {}
            _ = nudge.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DhtNode;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[tokio::test]
    async fn announcer_exits_once_the_node_is_gone() {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let node = DhtNode::bootstrap(bind, &[]).await.unwrap();
        let announcer = Announcer::new(crate::id::infohash("https://example.com/"), node.downgrade());

        node.shutdown().await;
        drop(node);

        // Kick it out of its back-off sleep so it notices the dead handle.
        for _ in 0..50 {
            announcer.update();
            if announcer.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(announcer.is_finished());
    }

    #[test]
    fn uniform_durations_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let d = uniform(&mut rng, MIN_BACKOFF, MAX_BACKOFF);
            assert!(d >= MIN_BACKOFF && d <= MAX_BACKOFF);
        }
    }
}
