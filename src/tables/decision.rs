use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{RouteTable, TableOutput, TableRole};
use crate::peer::{PeerHandle, PeerId};
use crate::routes::{RouteMessage, RouteOp, RouteOutcome};

/// Picks the best route per prefix across all peers' post-ingress
/// contributions. This is the one table that knows about multiple
/// peers; everything upstream sees only its own peer's messages.
pub struct DecisionTable {
    name: String,
    default_local_pref: u32,
    peers: HashMap<PeerId, PeerHandle>,
    /// All eligible candidates per prefix, at most one per origin peer
    candidates: BTreeMap<IpNetwork, Vec<RouteMessage>>,
    /// The current winner per prefix
    winners: BTreeMap<IpNetwork, RouteMessage>,
    /// (origin peer, prefix) index over winners, the dump iterator's
    /// walk order
    winner_index: BTreeSet<(PeerId, IpNetwork)>,
    /// Buffered route_used signals for the resolver
    usage_signals: Vec<(IpNetwork, PeerId, bool)>,
}

impl DecisionTable {
    pub fn new(name: &str, default_local_pref: u32) -> Self {
        DecisionTable {
            name: format!("DecisionTable-{}", name),
            default_local_pref,
            peers: HashMap::new(),
            candidates: BTreeMap::new(),
            winners: BTreeMap::new(),
            winner_index: BTreeSet::new(),
            usage_signals: vec![],
        }
    }

    pub fn add_peer(&mut self, handle: PeerHandle) {
        self.peers.insert(handle.id, handle);
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    pub fn winner(&self, net: &IpNetwork) -> Option<&RouteMessage> {
        self.winners.get(net)
    }

    pub fn winner_count(&self) -> usize {
        self.winners.len()
    }

    pub fn candidates_of(&self, net: &IpNetwork) -> Option<&Vec<RouteMessage>> {
        self.candidates.get(net)
    }

    /// Next winner attributed to one peer strictly after `after`, in
    /// prefix order (the dump walk's cursor resumption)
    pub fn next_winner_of_peer(
        &self,
        peer: PeerId,
        after: Option<IpNetwork>,
    ) -> Option<&RouteMessage> {
        let start = match after {
            Some(net) => {
                use std::ops::Bound::*;
                return self
                    .winner_index
                    .range((Excluded((peer, net)), Unbounded))
                    .take_while(|(p, _)| *p == peer)
                    .filter_map(|(_, net)| self.winners.get(net))
                    .next();
            }
            None => (peer, lowest_net()),
        };
        self.winner_index
            .range(start..)
            .take_while(|(p, _)| *p == peer)
            .filter_map(|(_, net)| self.winners.get(net))
            .next()
    }

    /// Usage signals accumulated since the last drain, for the resolver
    pub fn take_usage_signals(&mut self) -> Vec<(IpNetwork, PeerId, bool)> {
        std::mem::take(&mut self.usage_signals)
    }

    fn peer(&self, id: PeerId) -> Option<&PeerHandle> {
        self.peers.get(&id)
    }

    /// RFC 4271 decision process; stop at the first decisive step.
    /// `Ordering::Greater` means `a` is preferred.
    fn compare(&self, a: &RouteMessage, b: &RouteMessage) -> Ordering {
        let (attrs_a, attrs_b) = (a.attributes(), b.attributes());

        // 1. Higher LOCAL_PREF
        let pref_a = attrs_a.local_pref().unwrap_or(self.default_local_pref);
        let pref_b = attrs_b.local_pref().unwrap_or(self.default_local_pref);
        if pref_a != pref_b {
            return pref_a.cmp(&pref_b);
        }

        // 2. Shorter AS_PATH (confed segments cost nothing)
        let len_a = attrs_a.as_path().path_len();
        let len_b = attrs_b.as_path().path_len();
        if len_a != len_b {
            return len_b.cmp(&len_a);
        }

        // 3. Lower ORIGIN (IGP < EGP < INCOMPLETE)
        if attrs_a.origin() != attrs_b.origin() {
            return attrs_b.origin().cmp(&attrs_a.origin());
        }

        let peer_a = self.peer(a.origin);
        let peer_b = self.peer(b.origin);

        // 4. Lower MED, only between routes from the same neighbour AS
        if let (Some(pa), Some(pb)) = (peer_a, peer_b) {
            if pa.remote_as == pb.remote_as {
                let med_a = attrs_a.med().unwrap_or(0);
                let med_b = attrs_b.med().unwrap_or(0);
                if med_a != med_b {
                    return med_b.cmp(&med_a);
                }
            }
        }

        // 5. EBGP beats IBGP
        let ebgp_a = peer_a.map(|p| p.peer_type.is_ebgp()).unwrap_or(false);
        let ebgp_b = peer_b.map(|p| p.peer_type.is_ebgp()).unwrap_or(false);
        if ebgp_a != ebgp_b {
            return ebgp_a.cmp(&ebgp_b);
        }

        // 6. Lower IGP metric to the next-hop
        let metric_a = a.route.igp_metric.unwrap_or(u32::MAX);
        let metric_b = b.route.igp_metric.unwrap_or(u32::MAX);
        if metric_a != metric_b {
            return metric_b.cmp(&metric_a);
        }

        // 7. Lower router id, then lower peer address, then unique id
        if let (Some(pa), Some(pb)) = (peer_a, peer_b) {
            if pa.bgp_id != pb.bgp_id {
                return pb.bgp_id.cmp(&pa.bgp_id);
            }
            if pa.addr != pb.addr {
                return pb.addr.cmp(&pa.addr);
            }
        }
        b.origin.cmp(&a.origin)
    }

    /// Re-run the decision for a prefix; emits whatever the winner
    /// change looks like downstream.
    fn select(&mut self, net: IpNetwork) -> Vec<RouteOp> {
        let best = match self.candidates.get(&net) {
            Some(candidates) if !candidates.is_empty() => {
                let mut best = &candidates[0];
                for candidate in candidates.iter().skip(1) {
                    if self.compare(candidate, best) == Ordering::Greater {
                        best = candidate;
                    }
                }
                Some(best.clone())
            }
            _ => None,
        };

        let previous = self.winners.get(&net).cloned();
        match (previous, best) {
            (None, None) => vec![],
            (None, Some(new)) => {
                debug!("{}: first winner for {} from peer {}", self.name, net, new.origin);
                self.set_winner(net, new.clone());
                vec![RouteOp::Add(new)]
            }
            (Some(old), None) => {
                debug!("{}: no candidates left for {}", self.name, net);
                self.clear_winner(&net, &old);
                vec![RouteOp::Delete(old)]
            }
            (Some(old), Some(new)) => {
                let same_route = std::sync::Arc::ptr_eq(&old.route, &new.route)
                    && old.genid == new.genid;
                if same_route {
                    return vec![];
                }
                debug!(
                    "{}: winner for {} moves from peer {} to peer {}",
                    self.name, net, old.origin, new.origin
                );
                self.clear_winner(&net, &old);
                self.set_winner(net, new.clone());
                vec![RouteOp::Replace(old, new)]
            }
        }
    }

    fn set_winner(&mut self, net: IpNetwork, msg: RouteMessage) {
        self.winner_index.insert((msg.origin, net));
        self.usage_signals.push((net, msg.origin, true));
        self.winners.insert(net, msg);
    }

    fn clear_winner(&mut self, net: &IpNetwork, old: &RouteMessage) {
        self.winner_index.remove(&(old.origin, *net));
        self.usage_signals.push((*net, old.origin, false));
        self.winners.remove(net);
    }

    fn upsert_candidate(&mut self, msg: RouteMessage) {
        let candidates = self.candidates.entry(msg.net()).or_default();
        candidates.retain(|c| c.origin != msg.origin);
        candidates.push(msg);
    }

    fn remove_candidate(&mut self, net: &IpNetwork, origin: PeerId) -> bool {
        match self.candidates.get_mut(net) {
            Some(candidates) => {
                let before = candidates.len();
                candidates.retain(|c| c.origin != origin);
                let removed = candidates.len() != before;
                if candidates.is_empty() {
                    self.candidates.remove(net);
                }
                removed
            }
            None => false,
        }
    }
}

impl RouteTable for DecisionTable {
    fn role(&self) -> TableRole {
        TableRole::Decision
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        trace!("{}: candidate {} from peer {}", self.name, msg.net(), msg.origin);
        assert!(
            msg.route.nexthop_resolved(),
            "{}: unresolved candidate for {}",
            self.name,
            msg.net()
        );
        let net = msg.net();
        self.upsert_candidate(msg);
        let ops = self.select(net);
        let outcome = if ops.is_empty() {
            // Book-keeping only; the candidate lost
            RouteOutcome::Unused
        } else {
            RouteOutcome::Used
        };
        TableOutput {
            outcome: Some(outcome),
            ops,
            timers: vec![],
        }
    }

    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, now: Instant) -> TableOutput {
        let net = old.net();
        self.remove_candidate(&net, old.origin);
        self.add_route(new, now)
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        let net = msg.net();
        if !self.remove_candidate(&net, msg.origin) {
            return TableOutput::outcome(RouteOutcome::Unused);
        }
        let ops = self.select(net);
        TableOutput {
            outcome: Some(RouteOutcome::Used),
            ops,
            timers: vec![],
        }
    }
}

fn lowest_net() -> IpNetwork {
    "0.0.0.0/0".parse().expect("static prefix")
}

impl fmt::Display for DecisionTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<DecisionTable prefixes={} winners={}>",
            self.candidates.len(),
            self.winners.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AsPath, Attribute, AttributeList, PathOrigin};
    use crate::peer::PeerType;
    use crate::routes::SubnetRoute;
    use std::sync::Arc;

    fn handle(id: PeerId, bgp_id: &str, addr: &str, remote_as: u32, peer_type: PeerType) -> PeerHandle {
        PeerHandle {
            id,
            bgp_id: bgp_id.parse().unwrap(),
            addr: addr.parse().unwrap(),
            remote_as,
            peer_type,
            local_addr: "10.0.0.1".parse().unwrap(),
            subnet: None,
            directly_connected: true,
            confederation_peer: false,
        }
    }

    fn table() -> DecisionTable {
        let mut table = DecisionTable::new("v4u", 100);
        table.add_peer(handle(16, "10.0.0.10", "10.0.0.10", 65010, PeerType::Ebgp));
        table.add_peer(handle(17, "10.0.0.20", "10.0.0.20", 65020, PeerType::Ebgp));
        table.add_peer(handle(18, "10.0.0.30", "10.0.0.30", 65001, PeerType::Ibgp));
        table
    }

    fn candidate(peer: PeerId, net: &str, attrs: Vec<Attribute>, metric: u32) -> RouteMessage {
        let attrs = Arc::new(AttributeList::new(attrs));
        let route = Arc::new(
            SubnetRoute::new(net.parse().unwrap(), attrs, peer).with_metric(metric),
        );
        RouteMessage::new(route, peer, 1)
    }

    fn attrs(as_path: Vec<u32>) -> Vec<Attribute> {
        vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(as_path)),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
        ]
    }

    #[test]
    fn test_first_candidate_wins() {
        let mut table = table();
        let out = table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), Instant::now());
        assert!(matches!(out.ops[0], RouteOp::Add(_)));
        assert_eq!(table.winner_count(), 1);
    }

    #[test]
    fn test_shorter_as_path_retained() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        // Longer path loses on arrival: book-keeping only
        let out = table.add_route(
            candidate(17, "192.0.2.0/24", attrs(vec![65020, 65030]), 5),
            now,
        );
        assert_eq!(out.outcome, Some(RouteOutcome::Unused));
        assert!(out.ops.is_empty());
        assert_eq!(table.winner(&"192.0.2.0/24".parse().unwrap()).unwrap().origin, 16);
    }

    #[test]
    fn test_winner_change_emits_replace() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010, 65011]), 5), now);
        let out = table.add_route(candidate(17, "192.0.2.0/24", attrs(vec![65020]), 5), now);
        match &out.ops[0] {
            RouteOp::Replace(old, new) => {
                assert_eq!(old.origin, 16);
                assert_eq!(new.origin, 17);
            }
            other => panic!("expected replace, got {:?}", other),
        }
    }

    #[test]
    fn test_loss_of_all_candidates_emits_delete() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        let out = table.delete_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        assert!(matches!(out.ops[0], RouteOp::Delete(_)));
        assert_eq!(table.winner_count(), 0);
    }

    #[test]
    fn test_ebgp_beats_ibgp() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(18, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        let out = table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        assert!(matches!(out.ops[0], RouteOp::Replace(_, _)));
        assert_eq!(table.winner(&"192.0.2.0/24".parse().unwrap()).unwrap().origin, 16);
    }

    #[test]
    fn test_med_only_compared_within_same_as() {
        let mut table = table();
        // Two peers in the same neighbouring AS
        table.add_peer(handle(19, "10.0.0.40", "10.0.0.40", 65010, PeerType::Ebgp));
        let now = Instant::now();
        let mut low_med = attrs(vec![65010]);
        low_med.push(Attribute::Med(10));
        let mut high_med = attrs(vec![65010]);
        high_med.push(Attribute::Med(50));

        table.add_route(candidate(16, "192.0.2.0/24", high_med, 5), now);
        let out = table.add_route(candidate(19, "192.0.2.0/24", low_med, 5), now);
        // Lower MED from the same AS takes over
        assert!(matches!(out.ops[0], RouteOp::Replace(_, _)));
        assert_eq!(table.winner(&"192.0.2.0/24".parse().unwrap()).unwrap().origin, 19);
    }

    #[test]
    fn test_router_id_tiebreak() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(17, "192.0.2.0/24", attrs(vec![65020]), 5), now);
        let out = table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010]), 5), now);
        // 10.0.0.10 < 10.0.0.20
        assert!(matches!(out.ops[0], RouteOp::Replace(_, _)));
        assert_eq!(table.winner(&"192.0.2.0/24".parse().unwrap()).unwrap().origin, 16);
    }

    #[test]
    fn test_usage_signals_track_winner() {
        let mut table = table();
        let now = Instant::now();
        table.add_route(candidate(16, "192.0.2.0/24", attrs(vec![65010, 65011]), 5), now);
        table.add_route(candidate(17, "192.0.2.0/24", attrs(vec![65020]), 5), now);
        let signals = table.take_usage_signals();
        // gained 16, lost 16, gained 17
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].2, true);
        assert_eq!(signals[1], ("192.0.2.0/24".parse().unwrap(), 16, false));
        assert_eq!(signals[2], ("192.0.2.0/24".parse().unwrap(), 17, true));
    }
}
