//! # Routing Table
//!
//! Split-bucket Kademlia routing tree specialized to 160-bit ids and the
//! BitTorrent query set. Leaves are buckets of up to [`BUCKET_SIZE`]
//! nodes, oldest first. A full leaf may split iff its range contains our
//! own id, its depth is not at a multiple of `TREE_BASE` (which amortizes
//! the tree into 32-ary branching), or it sits under the deepest ancestor
//! of our id that holds at least `BUCKET_SIZE` nodes.
//!
//! ## Node states
//!
//! | State | Meaning |
//! |-------|---------|
//! | good | replied in the last 15 min, or replied ever and queried us in the last 15 min |
//! | questionable | replied at some point, but not fresh |
//! | bad | three or more consecutive failed queries |
//!
//! Each bucket keeps two bounded replacement queues: `verified` candidates
//! have replied to us, `unverified` ones must be pinged first. Queue sizes
//! never exceed the bucket's questionable-node count.
//!
//! Mutating operations return the contacts that should be pinged as a
//! consequence; the table itself never touches the network.

use std::collections::VecDeque;

use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::id::NodeId;
use crate::krpc::NodeContact;

/// Maximum number of nodes per bucket.
pub const BUCKET_SIZE: usize = 8;

/// Depth period at which splitting away from our own id is throttled.
const TREE_BASE: usize = 5;

/// A node with no activity for this long is questionable.
const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Consecutive failed queries after which a node is bad.
const MAX_FAILED_QUERIES: u32 = 3;

#[derive(Debug, Clone)]
struct RoutingNode {
    contact: NodeContact,
    /// Time of the last message received from this node.
    last_recv: Instant,
    /// Time of the last reply received from this node.
    last_reply: Option<Instant>,
    queries_failed: u32,
    ping_in_flight: bool,
}

impl RoutingNode {
    fn replied(contact: NodeContact, when: Instant) -> Self {
        RoutingNode {
            contact,
            last_recv: when,
            last_reply: Some(when),
            queries_failed: 0,
            ping_in_flight: false,
        }
    }

    fn is_bad(&self) -> bool {
        self.queries_failed >= MAX_FAILED_QUERIES
    }

    fn is_good(&self, now: Instant) -> bool {
        if self.is_bad() {
            return false;
        }
        match self.last_reply {
            Some(reply) if now.duration_since(reply) < QUESTIONABLE_AFTER => true,
            Some(_) => now.duration_since(self.last_recv) < QUESTIONABLE_AFTER,
            None => false,
        }
    }

    fn is_questionable(&self, now: Instant) -> bool {
        !self.is_bad() && !self.is_good(now)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: NodeContact,
    seen: Instant,
}

impl Candidate {
    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.seen) >= QUESTIONABLE_AFTER
    }
}

#[derive(Debug, Default)]
struct Bucket {
    /// Oldest first; refreshed nodes move to the tail.
    nodes: Vec<RoutingNode>,
    verified_candidates: VecDeque<Candidate>,
    unverified_candidates: VecDeque<Candidate>,
    last_refresh: Option<Instant>,
}

impl Bucket {
    fn questionable_count(&self, now: Instant) -> usize {
        self.nodes.iter().filter(|n| n.is_questionable(now)).count()
    }

    fn remove_candidate(&mut self, contact: &NodeContact) {
        if let Some(pos) = self
            .verified_candidates
            .iter()
            .position(|c| c.contact == *contact)
        {
            self.verified_candidates.remove(pos);
        }
        if let Some(pos) = self
            .unverified_candidates
            .iter()
            .position(|c| c.contact == *contact)
        {
            self.unverified_candidates.remove(pos);
        }
    }

    fn drop_stale_candidates(&mut self, now: Instant) {
        while self
            .verified_candidates
            .front()
            .map_or(false, |c| c.is_stale(now))
        {
            self.verified_candidates.pop_front();
        }
        while self
            .unverified_candidates
            .front()
            .map_or(false, |c| c.is_stale(now))
        {
            self.unverified_candidates.pop_front();
        }
    }

    /// Candidate queues never outgrow the questionable-node count.
    fn trim_candidates(&mut self, now: Instant) {
        let questionable = self.questionable_count(now);
        while self.verified_candidates.len() > questionable {
            self.verified_candidates.pop_front();
        }
        while self.verified_candidates.len() + self.unverified_candidates.len() > questionable {
            self.unverified_candidates.pop_front();
        }
    }
}

#[derive(Debug)]
struct TreeNode {
    depth: usize,
    /// First `depth` bits meaningful; the id range this node covers.
    prefix: NodeId,
    bucket: Option<Bucket>,
    children: Option<(usize, usize)>,
}

/// The routing table: a binary tree whose leaves are buckets, keyed by
/// proximity to our own id.
pub struct RoutingTable {
    self_id: NodeId,
    arena: Vec<TreeNode>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        RoutingTable {
            self_id,
            arena: vec![TreeNode {
                depth: 0,
                prefix: NodeId::from_bytes([0u8; 20]),
                bucket: Some(Bucket::default()),
                children: None,
            }],
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn node_count(&self) -> usize {
        self.arena
            .iter()
            .filter_map(|n| n.bucket.as_ref())
            .map(|b| b.nodes.len())
            .sum()
    }

    /// Tree descent to the leaf whose range contains `id`.
    fn leaf_for(&self, id: &NodeId) -> usize {
        let mut idx = 0;
        while let Some((left, right)) = self.arena[idx].children {
            idx = if id.bit(self.arena[idx].depth) {
                right
            } else {
                left
            };
        }
        idx
    }

    /// Descent collecting the ancestor chain, root first, leaf last.
    fn path_to_leaf(&self, id: &NodeId) -> Vec<usize> {
        let mut path = vec![0];
        let mut idx = 0;
        while let Some((left, right)) = self.arena[idx].children {
            idx = if id.bit(self.arena[idx].depth) {
                right
            } else {
                left
            };
            path.push(idx);
        }
        path
    }

    fn subtree_node_count(&self, idx: usize) -> usize {
        match self.arena[idx].children {
            Some((l, r)) => self.subtree_node_count(l) + self.subtree_node_count(r),
            None => self.arena[idx]
                .bucket
                .as_ref()
                .map_or(0, |b| b.nodes.len()),
        }
    }

    /// Root of the smallest subtree containing our id with at least
    /// `BUCKET_SIZE` nodes. Leaves below it may always split when full.
    fn exhaustive_subtree_root(&self) -> usize {
        let path = self.path_to_leaf(&self.self_id);
        let mut count = self.subtree_node_count(path[path.len() - 1]);
        let mut i = path.len() - 1;
        while count < BUCKET_SIZE && i > 0 {
            i -= 1;
            let (left, right) = self.arena[path[i]].children.unwrap_or((0, 0));
            let off_path = if self.self_id.bit(self.arena[path[i]].depth) {
                left
            } else {
                right
            };
            count += self.subtree_node_count(off_path);
        }
        path[i]
    }

    fn split_leaf(&mut self, idx: usize) {
        let depth = self.arena[idx].depth;
        let prefix = self.arena[idx].prefix;
        let bucket = self.arena[idx].bucket.take().unwrap_or_default();

        let mut right_prefix_bytes = *prefix.as_bytes();
        right_prefix_bytes[depth / 8] |= 0x80 >> (depth % 8);
        let right_prefix = NodeId::from_bytes(right_prefix_bytes);

        let mut left_bucket = Bucket {
            last_refresh: bucket.last_refresh,
            ..Bucket::default()
        };
        let mut right_bucket = Bucket {
            last_refresh: bucket.last_refresh,
            ..Bucket::default()
        };

        for node in bucket.nodes {
            if node.contact.id.bit(depth) {
                right_bucket.nodes.push(node);
            } else {
                left_bucket.nodes.push(node);
            }
        }
        for cand in bucket.verified_candidates {
            if cand.contact.id.bit(depth) {
                right_bucket.verified_candidates.push_back(cand);
            } else {
                left_bucket.verified_candidates.push_back(cand);
            }
        }
        for cand in bucket.unverified_candidates {
            if cand.contact.id.bit(depth) {
                right_bucket.unverified_candidates.push_back(cand);
            } else {
                left_bucket.unverified_candidates.push_back(cand);
            }
        }

        let left = self.arena.len();
        self.arena.push(TreeNode {
            depth: depth + 1,
            prefix,
            bucket: Some(left_bucket),
            children: None,
        });
        let right = self.arena.len();
        self.arena.push(TreeNode {
            depth: depth + 1,
            prefix: right_prefix,
            bucket: Some(right_bucket),
            children: None,
        });
        self.arena[idx].children = Some((left, right));
    }

    /// Find the bucket for `id`, splitting full buckets on the way down
    /// where the split rules allow it.
    fn find_bucket_splitting(&mut self, id: &NodeId) -> usize {
        let mut ancestors = self.path_to_leaf(id);
        let mut idx = *ancestors.last().unwrap_or(&0);

        {
            let bucket = self.arena[idx].bucket.as_ref().expect("leaf has bucket");
            if bucket.nodes.iter().any(|n| n.contact.id == *id) {
                return idx;
            }
        }

        let exhaustive_root = self.exhaustive_subtree_root();
        loop {
            let depth = self.arena[idx].depth;
            let full = self.arena[idx]
                .bucket
                .as_ref()
                .map_or(false, |b| b.nodes.len() == BUCKET_SIZE);
            if !full || depth >= crate::id::ID_BITS {
                break;
            }
            let contains_self = self.leaf_contains_self(idx);
            let in_exhaustive = ancestors.contains(&exhaustive_root);
            if !contains_self && depth % TREE_BASE == 0 && !in_exhaustive {
                break;
            }

            self.split_leaf(idx);
            let (left, right) = self.arena[idx].children.expect("just split");
            idx = if id.bit(depth) { right } else { left };
            ancestors.push(idx);
        }

        idx
    }

    fn leaf_contains_self(&self, idx: usize) -> bool {
        let depth = self.arena[idx].depth;
        let prefix = self.arena[idx].prefix;
        (0..depth).all(|bit| prefix.bit(bit) == self.self_id.bit(bit))
    }

    /// Record a node, space permitting. Returns contacts to ping: the node
    /// itself when it is unverified and a slot may open for it, and any
    /// questionable nodes that need a liveness check.
    pub fn try_add(&mut self, contact: NodeContact, verified: bool) -> Vec<NodeContact> {
        let now = Instant::now();
        let idx = self.find_bucket_splitting(&contact.id);
        let bucket = self.arena[idx].bucket.as_mut().expect("leaf has bucket");

        // Already present: move to the tail and refresh.
        if let Some(pos) = bucket.nodes.iter().position(|n| n.contact == contact) {
            let mut node = bucket.nodes.remove(pos);
            node.last_recv = now;
            if verified {
                node.last_reply = Some(now);
                node.queries_failed = 0;
                node.ping_in_flight = false;
            }
            bucket.nodes.push(node);
            return Vec::new();
        }

        bucket.remove_candidate(&contact);

        if bucket.nodes.len() < BUCKET_SIZE {
            if verified {
                bucket.nodes.push(RoutingNode::replied(contact, now));
                return Vec::new();
            }
            // Ping first; insertion happens when the reply comes back.
            return vec![contact];
        }

        // Replace a bad node if there is one.
        if let Some(pos) = bucket.nodes.iter().position(|n| n.is_bad()) {
            if verified {
                bucket.nodes.remove(pos);
                bucket.nodes.push(RoutingNode::replied(contact, now));
                return Vec::new();
            }
            return vec![contact];
        }

        // Full bucket of non-bad nodes: ping all questionable ones, then
        // queue the contact as a replacement candidate.
        let mut pings = Vec::new();
        let mut questionable = 0usize;
        for node in bucket.nodes.iter_mut() {
            if node.is_questionable(now) {
                questionable += 1;
                if !node.ping_in_flight {
                    node.ping_in_flight = true;
                    pings.push(node.contact);
                }
            }
        }

        let candidate = Candidate {
            contact,
            seen: now,
        };
        if verified {
            if questionable > 0 {
                bucket.verified_candidates.push_back(candidate);
            }
        } else {
            while bucket
                .verified_candidates
                .front()
                .map_or(false, |c| c.is_stale(now))
            {
                bucket.verified_candidates.pop_front();
            }
            if bucket.verified_candidates.len() < questionable {
                bucket.unverified_candidates.push_back(candidate);
            }
        }
        bucket.trim_candidates(now);
        pings
    }

    /// Record a failed query. When this turns the node bad, promote a
    /// verified candidate or ask for an unverified one to be pinged.
    pub fn fail_node(&mut self, contact: &NodeContact) -> Vec<NodeContact> {
        let now = Instant::now();
        let idx = self.leaf_for(&contact.id);
        let bucket = self.arena[idx].bucket.as_mut().expect("leaf has bucket");

        let pos = match bucket.nodes.iter().position(|n| n.contact == *contact) {
            Some(pos) => pos,
            None => return Vec::new(),
        };

        bucket.nodes[pos].queries_failed += 1;
        if !bucket.nodes[pos].is_bad() {
            if bucket.nodes[pos].is_questionable(now) && !bucket.nodes[pos].ping_in_flight {
                bucket.nodes[pos].ping_in_flight = true;
                return vec![*contact];
            }
            return Vec::new();
        }

        trace!(node = %contact.id, "routing node turned bad");
        bucket.drop_stale_candidates(now);

        let mut pings = Vec::new();
        if let Some(candidate) = bucket.verified_candidates.pop_front() {
            bucket.nodes.remove(pos);
            let node = RoutingNode {
                contact: candidate.contact,
                last_recv: candidate.seen,
                last_reply: Some(candidate.seen),
                queries_failed: 0,
                ping_in_flight: false,
            };
            let at = bucket
                .nodes
                .iter()
                .position(|n| n.last_recv > node.last_recv)
                .unwrap_or(bucket.nodes.len());
            bucket.nodes.insert(at, node);
        } else if let Some(candidate) = bucket.unverified_candidates.pop_front() {
            pings.push(candidate.contact);
        }

        bucket.trim_candidates(now);
        pings
    }

    /// The `count` known non-bad contacts closest to `target`: the leaf
    /// containing the target first, then sibling subtrees outward.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeContact> {
        let now = Instant::now();
        let path = self.path_to_leaf(target);
        let mut output = Vec::new();

        let mut visited = usize::MAX;
        for &idx in path.iter().rev() {
            self.collect_closest(idx, visited, target, count, now, &mut output);
            if output.len() >= count {
                break;
            }
            visited = idx;
        }
        output
    }

    fn collect_closest(
        &self,
        idx: usize,
        skip: usize,
        target: &NodeId,
        count: usize,
        now: Instant,
        output: &mut Vec<NodeContact>,
    ) {
        if idx == skip || output.len() >= count {
            return;
        }
        match self.arena[idx].children {
            Some((left, right)) => {
                let (first, second) = if target.bit(self.arena[idx].depth) {
                    (right, left)
                } else {
                    (left, right)
                };
                self.collect_closest(first, skip, target, count, now, output);
                self.collect_closest(second, skip, target, count, now, output);
            }
            None => {
                if let Some(bucket) = self.arena[idx].bucket.as_ref() {
                    for node in &bucket.nodes {
                        if !node.is_bad() {
                            output.push(node.contact);
                            if output.len() >= count {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Mark the bucket covering `target` as freshly looked up.
    pub fn note_lookup(&mut self, target: &NodeId) {
        let idx = self.leaf_for(target);
        if let Some(bucket) = self.arena[idx].bucket.as_mut() {
            bucket.last_refresh = Some(Instant::now());
        }
    }

    /// One random lookup target per leaf bucket. Used right after
    /// bootstrap so that peers who should route to us learn about us.
    pub fn refresh_targets(&self, rng: &mut impl Rng) -> Vec<NodeId> {
        self.leaves()
            .into_iter()
            .map(|idx| {
                self.arena[idx]
                    .prefix
                    .random_in_prefix(self.arena[idx].depth, rng)
            })
            .collect()
    }

    /// Random lookup targets for buckets untouched for `threshold`.
    pub fn stale_refresh_targets(
        &self,
        threshold: Duration,
        rng: &mut impl Rng,
    ) -> Vec<NodeId> {
        let now = Instant::now();
        self.leaves()
            .into_iter()
            .filter(|&idx| {
                let bucket = match self.arena[idx].bucket.as_ref() {
                    Some(b) => b,
                    None => return false,
                };
                match bucket.last_refresh {
                    Some(at) => now.duration_since(at) >= threshold,
                    None => true,
                }
            })
            .map(|idx| {
                self.arena[idx]
                    .prefix
                    .random_in_prefix(self.arena[idx].depth, rng)
            })
            .collect()
    }

    fn leaves(&self) -> Vec<usize> {
        (0..self.arena.len())
            .filter(|&i| self.arena[i].children.is_none())
            .collect()
    }

    #[cfg(test)]
    fn candidate_invariant_holds(&self) -> bool {
        let now = Instant::now();
        self.arena
            .iter()
            .filter_map(|n| n.bucket.as_ref())
            .all(|b| {
                let q = b.questionable_count(now);
                b.verified_candidates.len() <= q
                    && b.verified_candidates.len() + b.unverified_candidates.len() <= q
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::closer_to;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn contact(seed: u8) -> NodeContact {
        let mut bytes = [0u8; 20];
        bytes[0] = seed;
        bytes[19] = seed;
        NodeContact {
            id: NodeId::from_bytes(bytes),
            endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)), 6881),
        }
    }

    fn contact_with_prefix(first: u8, rest: u8) -> NodeContact {
        let mut bytes = [rest; 20];
        bytes[0] = first;
        NodeContact {
            id: NodeId::from_bytes(bytes),
            endpoint: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, rest, first)),
                6881,
            ),
        }
    }

    fn self_id() -> NodeId {
        NodeId::from_bytes([0u8; 20])
    }

    #[tokio::test]
    async fn verified_contacts_fill_a_bucket() {
        let mut table = RoutingTable::new(self_id());
        for i in 1..=BUCKET_SIZE as u8 {
            assert!(table.try_add(contact(i), true).is_empty());
        }
        assert_eq!(table.node_count(), BUCKET_SIZE);
    }

    #[tokio::test]
    async fn unverified_contact_requests_ping_instead_of_inserting() {
        let mut table = RoutingTable::new(self_id());
        let c = contact(1);
        let pings = table.try_add(c, false);
        assert_eq!(pings, vec![c]);
        assert_eq!(table.node_count(), 0);

        // The ping reply arrives.
        assert!(table.try_add(c, true).is_empty());
        assert_eq!(table.node_count(), 1);
    }

    #[tokio::test]
    async fn bucket_containing_self_splits_when_full() {
        let mut table = RoutingTable::new(self_id());
        // Ids spread over both halves of the space.
        for i in 0..BUCKET_SIZE as u8 {
            table.try_add(contact_with_prefix(i * 0x20, i + 1), true);
        }
        assert_eq!(table.node_count(), BUCKET_SIZE);
        // One more in the lower half; the root splits rather than dropping it.
        table.try_add(contact_with_prefix(0x01, 42), true);
        assert_eq!(table.node_count(), BUCKET_SIZE + 1);
    }

    #[tokio::test]
    async fn no_node_in_more_than_one_bucket() {
        let mut table = RoutingTable::new(self_id());
        for i in 0..30u8 {
            table.try_add(contact_with_prefix(i.wrapping_mul(9), i + 1), true);
        }
        // Re-adding any contact must not increase the count.
        let count = table.node_count();
        for i in 0..30u8 {
            table.try_add(contact_with_prefix(i.wrapping_mul(9), i + 1), true);
        }
        assert_eq!(table.node_count(), count);
    }

    #[tokio::test]
    async fn closest_is_bounded_sorted_and_duplicate_free() {
        let mut table = RoutingTable::new(self_id());
        for i in 0..60u8 {
            table.try_add(contact_with_prefix(i.wrapping_mul(7), i + 1), true);
        }
        let target = contact(0xF0).id;
        let closest = table.closest(&target, BUCKET_SIZE);
        assert!(closest.len() <= BUCKET_SIZE);

        let mut seen = std::collections::HashSet::new();
        for c in &closest {
            assert!(seen.insert(c.id), "duplicate {:?}", c.id);
        }

        // Everything not returned is no closer than the best returned one.
        let best = closest
            .iter()
            .min_by(|a, b| {
                if closer_to(&target, &a.id, &b.id) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .copied()
            .unwrap();
        let leaf_best = table.closest(&target, 1)[0];
        assert_eq!(
            best.id.xor_distance(&target),
            leaf_best.id.xor_distance(&target)
        );
    }

    /// Eight nodes near our own id (so the exhaustive subtree stays on our
    /// side of the tree) plus eight sharing the far `10000…` prefix, whose
    /// bucket bottoms out at depth 5 and can no longer split.
    fn table_with_full_far_bucket() -> (RoutingTable, Vec<NodeContact>) {
        let mut table = RoutingTable::new(self_id());
        for i in 1..=BUCKET_SIZE as u8 {
            table.try_add(contact_with_prefix(i, i), true);
        }
        let residents: Vec<_> = (0..BUCKET_SIZE as u8)
            .map(|i| contact_with_prefix(0x80 | i, i + 1))
            .collect();
        for c in &residents {
            table.try_add(*c, true);
        }
        (table, residents)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_node_is_replaced_by_verified_candidate() {
        let (mut table, residents) = table_with_full_far_bucket();

        // Age everything into questionable territory.
        tokio::time::advance(QUESTIONABLE_AFTER + Duration::from_secs(1)).await;

        // A fresh verified contact for the full far bucket becomes a
        // candidate and triggers pings of the questionable residents.
        let candidate = contact_with_prefix(0x80, 99);
        let pings = table.try_add(candidate, true);
        assert!(!pings.is_empty(), "questionable residents should be pinged");
        assert!(table.candidate_invariant_holds());
        let count_before = table.node_count();

        // Three failures on one resident promote the candidate.
        let victim = residents[0];
        table.fail_node(&victim);
        table.fail_node(&victim);
        table.fail_node(&victim);

        assert_eq!(table.node_count(), count_before);
        let closest = table.closest(&victim.id, BUCKET_SIZE * 4);
        assert!(closest.iter().any(|c| *c == candidate));
        assert!(!closest.iter().any(|c| *c == victim));
        assert!(table.candidate_invariant_holds());
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_queues_respect_questionable_bound() {
        let (mut table, _) = table_with_full_far_bucket();

        // All residents fresh: no questionable nodes, so the candidate is
        // dropped on the floor.
        table.try_add(contact_with_prefix(0x80, 7), true);
        assert!(table.candidate_invariant_holds());

        tokio::time::advance(QUESTIONABLE_AFTER + Duration::from_secs(1)).await;
        for i in 0..4u8 {
            table.try_add(contact_with_prefix(0x80, 50 + i), true);
            table.try_add(contact_with_prefix(0x81, 70 + i), false);
        }
        assert!(table.candidate_invariant_holds());
    }

    #[tokio::test]
    async fn refresh_targets_cover_each_leaf() {
        let mut table = RoutingTable::new(self_id());
        for i in 0..40u8 {
            table.try_add(contact_with_prefix(i.wrapping_mul(11), i + 1), true);
        }
        let mut rng = rand::rngs::mock::StepRng::new(2, 1);
        let targets = table.refresh_targets(&mut rng);
        assert_eq!(targets.len(), table.leaves().len());
        for (idx, target) in table.leaves().into_iter().zip(&targets) {
            let depth = table.arena[idx].depth;
            let prefix = table.arena[idx].prefix;
            for bit in 0..depth {
                assert_eq!(target.bit(bit), prefix.bit(bit));
            }
        }
    }
}
