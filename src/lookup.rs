//! # Iterative Closest-Node Lookup
//!
//! Parallel Kademlia lookup toward a target id. A shared candidate map,
//! ordered by XOR distance to the target, is worked on by [`ALPHA`]
//! cooperating tasks:
//!
//! 1. take the closest candidate that is neither confirmed nor being
//!    queried, or fall back to a bootstrap endpoint with unknown id;
//! 2. send it `find_node`; on a reply mark it confirmed and merge the
//!    returned contacts, keeping only those strictly closer than the
//!    farthest confirmed candidate once [`MAX_RESULTS`] are confirmed;
//! 3. stop when nothing is left to try and no query is in flight.
//!
//! Failed candidates are dropped and retried against others, so the
//! result is the closest confirmed contacts in closest-first order.
//!
//! The network side lives behind [`LookupRpc`] so the algorithm can be
//! exercised against a scripted swarm in tests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::error::Result;
use crate::id::{Distance, NodeId};
use crate::krpc::NodeContact;

/// Maximum confirmed contacts a lookup returns.
pub const MAX_RESULTS: usize = 8;

/// Lookup concurrency factor.
const ALPHA: usize = 3;

/// Fallback poll period for workers waiting on their peers' progress.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Network capabilities a lookup needs.
#[async_trait]
pub trait LookupRpc: Clone + Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    /// Known non-bad contacts closest to `target`, used to seed the map.
    async fn closest_known(&self, target: NodeId, count: usize) -> Vec<NodeContact>;

    /// One `find_node` query toward `target`.
    async fn find_node(
        &self,
        endpoint: SocketAddr,
        endpoint_id: Option<NodeId>,
        target: NodeId,
    ) -> Result<Vec<NodeContact>>;

    /// Lookup bookkeeping, used for bucket refresh scheduling.
    async fn note_lookup(&self, target: NodeId);
}

struct Candidate {
    id: NodeId,
    endpoint: SocketAddr,
    confirmed: bool,
    in_progress: bool,
}

struct State {
    /// Keyed by XOR distance to the target, so iteration order is
    /// closeness order.
    candidates: BTreeMap<Distance, Candidate>,
    confirmed: usize,
    in_flight: usize,
    extra: Vec<SocketAddr>,
}

impl State {
    /// Drop the farthest candidates until `MAX_RESULTS` confirmed remain
    /// and no unconfirmed one sits beyond the farthest confirmed.
    fn prune(&mut self) {
        loop {
            let Some((key, candidate)) = self.candidates.iter().next_back() else {
                break;
            };
            let key = *key;
            if candidate.confirmed {
                if self.confirmed == MAX_RESULTS {
                    break;
                }
                self.confirmed -= 1;
            }
            self.candidates.remove(&key);
        }
    }

    fn merge(&mut self, local_id: NodeId, target: &NodeId, contacts: Vec<NodeContact>) -> bool {
        let mut added = false;
        for contact in contacts {
            if contact.id == local_id {
                continue;
            }
            let key = contact.id.xor_distance(target);
            if self.candidates.contains_key(&key) {
                continue;
            }
            if self.confirmed >= MAX_RESULTS {
                // Only contacts strictly closer than the farthest
                // confirmed candidate are worth visiting.
                match self.candidates.iter().next_back() {
                    Some((farthest, _)) if key >= *farthest => continue,
                    _ => {}
                }
            }
            self.candidates.insert(
                key,
                Candidate {
                    id: contact.id,
                    endpoint: contact.endpoint,
                    confirmed: false,
                    in_progress: false,
                },
            );
            added = true;
        }
        added
    }
}

enum Task {
    Known(Distance, NodeId, SocketAddr),
    Unknown(SocketAddr),
    Wait,
    Finished,
}

/// Run a full lookup toward `target`, seeded from the routing table and
/// the given extra bootstrap endpoints.
pub async fn find_closest_nodes<R: LookupRpc>(
    rpc: &R,
    target: NodeId,
    extra: Vec<SocketAddr>,
) -> Vec<NodeContact> {
    let seeds = rpc.closest_known(target, MAX_RESULTS).await;
    let mut state = State {
        candidates: BTreeMap::new(),
        confirmed: 0,
        in_flight: 0,
        extra,
    };
    for contact in seeds {
        state.candidates.insert(
            contact.id.xor_distance(&target),
            Candidate {
                id: contact.id,
                endpoint: contact.endpoint,
                confirmed: false,
                in_progress: false,
            },
        );
    }

    let state = Arc::new(Mutex::new(state));
    let notify = Arc::new(Notify::new());
    let mut workers = JoinSet::new();
    for _ in 0..ALPHA {
        let rpc = rpc.clone();
        let state = state.clone();
        let notify = notify.clone();
        workers.spawn(async move { worker(rpc, target, state, notify).await });
    }
    while workers.join_next().await.is_some() {}

    rpc.note_lookup(target).await;

    let state = state.lock().await;
    let result: Vec<NodeContact> = state
        .candidates
        .values()
        .filter(|c| c.confirmed)
        .map(|c| NodeContact {
            id: c.id,
            endpoint: c.endpoint,
        })
        .collect();
    debug!(%target, found = result.len(), "lookup finished");
    result
}

async fn worker<R: LookupRpc>(
    rpc: R,
    target: NodeId,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
) {
    loop {
        let task = {
            let mut st = state.lock().await;
            let mut chosen = None;
            for (key, candidate) in st.candidates.iter_mut() {
                if !candidate.confirmed && !candidate.in_progress {
                    candidate.in_progress = true;
                    chosen = Some((*key, candidate.id, candidate.endpoint));
                    break;
                }
            }
            match chosen {
                Some((key, id, endpoint)) => {
                    st.in_flight += 1;
                    Task::Known(key, id, endpoint)
                }
                None => match st.extra.pop() {
                    Some(endpoint) => {
                        st.in_flight += 1;
                        Task::Unknown(endpoint)
                    }
                    None if st.in_flight == 0 => Task::Finished,
                    None => Task::Wait,
                },
            }
        };

        let (key, id, endpoint) = match task {
            Task::Finished => break,
            Task::Wait => {
                // The notify covers the common case; the timeout covers a
                // wakeup racing our registration.
                let _ = tokio::time::timeout(WAIT_SLICE, notify.notified()).await;
                continue;
            }
            Task::Known(key, id, endpoint) => (Some(key), Some(id), endpoint),
            Task::Unknown(endpoint) => (None, None, endpoint),
        };

        let result = rpc.find_node(endpoint, id, target).await;

        {
            let mut st = state.lock().await;
            st.in_flight -= 1;
            match result {
                Err(e) => {
                    trace!(%endpoint, error = %e, "lookup candidate failed");
                    if let Some(key) = key {
                        st.candidates.remove(&key);
                    }
                }
                Ok(contacts) => {
                    if let Some(key) = key {
                        // The candidate may have been pruned meanwhile.
                        if let Some(candidate) = st.candidates.get_mut(&key) {
                            candidate.confirmed = true;
                            candidate.in_progress = false;
                            st.confirmed += 1;
                            if st.confirmed >= MAX_RESULTS {
                                st.prune();
                            }
                        }
                    }
                    st.merge(rpc.local_id(), &target, contacts);
                }
            }
        }
        notify.notify_waiters();
    }
    // Let waiting workers observe termination.
    notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::id::closer_to;
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    fn make_id(n: u16) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = (n >> 8) as u8;
        bytes[1] = (n & 0xff) as u8;
        bytes[10] = n as u8;
        NodeId::from_bytes(bytes)
    }

    fn make_ep(n: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8)), 6881)
    }

    /// A scripted swarm: every reachable node answers `find_node` with
    /// the swarm-wide closest contacts to the target.
    #[derive(Clone)]
    struct MockSwarm {
        local: NodeId,
        contacts: Arc<Vec<NodeContact>>,
        by_endpoint: Arc<HashMap<SocketAddr, NodeId>>,
        unreachable: Arc<HashSet<NodeId>>,
        seeds: Arc<Vec<NodeContact>>,
        queried: Arc<StdMutex<Vec<SocketAddr>>>,
    }

    impl MockSwarm {
        fn new(count: u16, unreachable: &[u16], seed_count: usize) -> Self {
            let contacts: Vec<NodeContact> = (0..count)
                .map(|n| NodeContact {
                    id: make_id(n.wrapping_mul(2551).wrapping_add(17)),
                    endpoint: make_ep(n),
                })
                .collect();
            let by_endpoint = contacts.iter().map(|c| (c.endpoint, c.id)).collect();
            let unreachable = unreachable
                .iter()
                .map(|&n| contacts[n as usize].id)
                .collect();
            let seeds = contacts.iter().take(seed_count).copied().collect();
            MockSwarm {
                local: NodeId::from_bytes([0xEE; 20]),
                contacts: Arc::new(contacts),
                by_endpoint: Arc::new(by_endpoint),
                unreachable: Arc::new(unreachable),
                seeds: Arc::new(seeds),
                queried: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn sorted_toward(&self, target: &NodeId) -> Vec<NodeContact> {
            let mut all: Vec<NodeContact> = self.contacts.as_ref().clone();
            all.sort_by(|a, b| {
                if closer_to(target, &a.id, &b.id) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            });
            all
        }

        fn expected(&self, target: &NodeId) -> Vec<NodeId> {
            self.sorted_toward(target)
                .into_iter()
                .filter(|c| !self.unreachable.contains(&c.id))
                .take(MAX_RESULTS)
                .map(|c| c.id)
                .collect()
        }
    }

    #[async_trait]
    impl LookupRpc for MockSwarm {
        fn local_id(&self) -> NodeId {
            self.local
        }

        async fn closest_known(&self, _target: NodeId, count: usize) -> Vec<NodeContact> {
            self.seeds.iter().take(count).copied().collect()
        }

        async fn find_node(
            &self,
            endpoint: SocketAddr,
            _endpoint_id: Option<NodeId>,
            target: NodeId,
        ) -> Result<Vec<NodeContact>> {
            self.queried.lock().unwrap().push(endpoint);
            let id = self.by_endpoint.get(&endpoint).ok_or(Error::TimedOut)?;
            if self.unreachable.contains(id) {
                return Err(Error::TimedOut);
            }
            Ok(self.sorted_toward(&target))
        }

        async fn note_lookup(&self, _target: NodeId) {}
    }

    fn assert_sorted_and_unique(target: &NodeId, contacts: &[NodeContact]) {
        let mut seen = HashSet::new();
        for c in contacts {
            assert!(seen.insert(c.id), "duplicate contact {:?}", c.id);
        }
        for pair in contacts.windows(2) {
            assert!(
                !closer_to(target, &pair[1].id, &pair[0].id),
                "results out of order"
            );
        }
    }

    #[tokio::test]
    async fn lookup_finds_the_closest_nodes() {
        let swarm = MockSwarm::new(40, &[], 4);
        let target = make_id(0x4242);

        let found = find_closest_nodes(&swarm, target, Vec::new()).await;
        assert_eq!(found.len(), MAX_RESULTS);
        assert_sorted_and_unique(&target, &found);

        let ids: Vec<NodeId> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, swarm.expected(&target));
    }

    #[tokio::test]
    async fn unreachable_candidates_are_replaced() {
        // Knock out a few nodes including some of the closest.
        let swarm = MockSwarm::new(40, &[0, 3, 7, 11, 19], 4);
        let target = make_id(0x0101);

        let found = find_closest_nodes(&swarm, target, Vec::new()).await;
        assert_sorted_and_unique(&target, &found);
        let ids: Vec<NodeId> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, swarm.expected(&target));
    }

    #[tokio::test]
    async fn bootstrap_endpoints_seed_an_empty_table() {
        let mut swarm = MockSwarm::new(25, &[], 0);
        swarm.seeds = Arc::new(Vec::new());
        let target = make_id(0x1234);

        let bootstrap = vec![swarm.contacts[5].endpoint];
        let found = find_closest_nodes(&swarm, target, bootstrap).await;
        assert_eq!(found.len(), MAX_RESULTS);
        assert_sorted_and_unique(&target, &found);
    }

    #[tokio::test]
    async fn lookup_with_no_leads_returns_nothing() {
        let mut swarm = MockSwarm::new(10, &[], 0);
        swarm.seeds = Arc::new(Vec::new());
        let found = find_closest_nodes(&swarm, make_id(1), Vec::new()).await;
        assert!(found.is_empty());
    }
}
