use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{RouteTable, TableOutput, TableRole};
use crate::peer::{Genid, PeerId};
use crate::routes::{RouteMessage, RouteOp, RouteOutcome, SubnetRoute};

/// How many prefixes one background deletion step retires before
/// yielding back to the scheduler
const DELETION_BATCH: usize = 10;

/// A generation of routes whose peering has gone down, being deleted in
/// the background while deletes propagate downstream.
#[derive(Debug)]
struct RetiredGeneration {
    genid: Genid,
    routes: BTreeMap<IpNetwork, Arc<SubnetRoute>>,
}

/// Per-peer ingress store: the most recent route this peer advertised
/// for each prefix, tagged with the genid it was stored under.
pub struct RibInTable {
    name: String,
    peer: PeerId,
    genid: Genid,
    routes: BTreeMap<IpNetwork, Arc<SubnetRoute>>,
    retired: Vec<RetiredGeneration>,
}

impl RibInTable {
    pub fn new(peer: PeerId, genid: Genid) -> Self {
        RibInTable {
            name: format!("RibIn-{}", peer),
            peer,
            genid,
            routes: BTreeMap::new(),
            retired: vec![],
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn genid(&self) -> Genid {
        self.genid
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn lookup_route(&self, net: &IpNetwork) -> Option<(&Arc<SubnetRoute>, Genid)> {
        self.routes.get(net).map(|route| (route, self.genid))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpNetwork, &Arc<SubnetRoute>)> {
        self.routes.iter()
    }

    /// Is a retired generation still draining?
    pub fn deleting(&self) -> bool {
        !self.retired.is_empty()
    }

    /// One bounded step of background deletion. Emits deletes for up to
    /// [`DELETION_BATCH`] prefixes of the oldest retired generation and
    /// reports the genid of any generation that finished draining, so
    /// the caller can send `peering_down_complete` downstream.
    pub fn deletion_step(&mut self) -> (Vec<RouteOp>, Option<Genid>) {
        let generation = match self.retired.first_mut() {
            Some(generation) => generation,
            None => return (vec![], None),
        };
        let mut ops = Vec::with_capacity(DELETION_BATCH);
        while ops.len() < DELETION_BATCH {
            let net = match generation.routes.keys().next() {
                Some(net) => *net,
                None => break,
            };
            let route = generation.routes.remove(&net).expect("key just seen");
            ops.push(RouteOp::Delete(
                RouteMessage::new(route, self.peer, generation.genid).from_previous_peering(),
            ));
        }
        if generation.routes.is_empty() {
            let genid = generation.genid;
            self.retired.remove(0);
            debug!("{}: background deletion complete for genid {}", self.name, genid);
            (ops, Some(genid))
        } else {
            (ops, None)
        }
    }
}

impl RouteTable for RibInTable {
    fn role(&self) -> TableRole {
        TableRole::RibIn
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        trace!("{}: add {}", self.name, msg);
        let previous = self.routes.insert(msg.net(), msg.route.clone());
        let op = match previous {
            Some(old) => RouteOp::Replace(RouteMessage::new(old, self.peer, self.genid), msg),
            None => {
                // A prior incarnation may still be draining this prefix in
                // the background; claim it so downstream sees one replace
                // instead of an add racing a stale delete.
                let mut retired_copy = None;
                for generation in self.retired.iter_mut() {
                    if let Some(old) = generation.routes.remove(&msg.net()) {
                        retired_copy = Some((old, generation.genid));
                        break;
                    }
                }
                match retired_copy {
                    Some((old, old_genid)) => RouteOp::Replace(
                        RouteMessage::new(old, self.peer, old_genid).from_previous_peering(),
                        msg,
                    ),
                    None => RouteOp::Add(msg),
                }
            }
        };
        TableOutput::used(op)
    }

    fn replace_route(&mut self, _old: RouteMessage, new: RouteMessage, now: Instant) -> TableOutput {
        // The ingress edge never sees true replaces; an UPDATE re-announcing
        // a prefix arrives as an add and is converted here.
        self.add_route(new, now)
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        trace!("{}: delete {}", self.name, msg);
        match self.routes.remove(&msg.net()) {
            Some(old) => TableOutput::used(RouteOp::Delete(RouteMessage::new(
                old, self.peer, self.genid,
            ))),
            // A withdraw for a prefix this peer never advertised is noise
            None => TableOutput::outcome(RouteOutcome::Unused),
        }
    }

    fn lookup_route(&self, net: &IpNetwork) -> Option<(&Arc<SubnetRoute>, Genid)> {
        RibInTable::lookup_route(self, net)
    }

    fn peering_went_down(&mut self, peer: PeerId, genid: Genid) -> Vec<RouteOp> {
        assert_eq!(peer, self.peer, "{}: lifecycle event for wrong peer", self.name);
        let routes = std::mem::take(&mut self.routes);
        debug!(
            "{}: peering down, retiring {} routes under genid {}",
            self.name,
            routes.len(),
            genid
        );
        self.retired.push(RetiredGeneration { genid, routes });
        vec![]
    }

    fn peering_came_up(&mut self, peer: PeerId, genid: Genid) {
        assert_eq!(peer, self.peer, "{}: lifecycle event for wrong peer", self.name);
        assert!(
            self.routes.is_empty(),
            "{}: routes left behind across incarnations",
            self.name
        );
        self.genid = genid;
    }
}

impl fmt::Display for RibInTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<RibIn peer={} genid={} routes={}>",
            self.peer,
            self.genid,
            self.routes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AsPath, Attribute, AttributeList, PathOrigin};

    fn msg(table: &RibInTable, net: &str, med: u32) -> RouteMessage {
        let attrs = Arc::new(AttributeList::new(vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
            Attribute::Med(med),
        ]));
        let route = Arc::new(SubnetRoute::new(net.parse().unwrap(), attrs, table.peer()));
        RouteMessage::new(route, table.peer(), table.genid())
    }

    #[test]
    fn test_add_then_replace() {
        let mut table = RibInTable::new(16, 1);
        let now = Instant::now();
        let out = table.add_route(msg(&table, "192.0.2.0/24", 10), now);
        assert!(matches!(out.ops[0], RouteOp::Add(_)));

        let out = table.add_route(msg(&table, "192.0.2.0/24", 20), now);
        match &out.ops[0] {
            RouteOp::Replace(old, new) => {
                assert_eq!(old.attributes().med(), Some(10));
                assert_eq!(new.attributes().med(), Some(20));
            }
            other => panic!("expected replace, got {:?}", other),
        }
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn test_delete_unknown_is_unused() {
        let mut table = RibInTable::new(16, 1);
        let out = table.delete_route(msg(&table, "192.0.2.0/24", 10), Instant::now());
        assert_eq!(out.outcome, Some(RouteOutcome::Unused));
        assert!(out.ops.is_empty());
    }

    #[test]
    fn test_background_deletion() {
        let mut table = RibInTable::new(16, 1);
        let now = Instant::now();
        for i in 0..25 {
            table.add_route(msg(&table, &format!("10.{}.0.0/16", i), 10), now);
        }
        table.peering_went_down(16, 1);
        assert_eq!(table.route_count(), 0);
        assert!(table.deleting());

        // New incarnation can fill while the old generation drains
        table.peering_came_up(16, 2);
        table.add_route(msg(&table, "192.0.2.0/24", 10), now);

        let mut deletes = 0;
        let mut completed = None;
        while completed.is_none() {
            let (ops, done) = table.deletion_step();
            for op in &ops {
                match op {
                    RouteOp::Delete(msg) => {
                        assert_eq!(msg.genid, 1);
                        assert!(msg.from_previous_peering);
                        deletes += 1;
                    }
                    other => panic!("expected delete, got {:?}", other),
                }
            }
            completed = done;
        }
        assert_eq!(deletes, 25);
        assert_eq!(completed, Some(1));
        assert!(!table.deleting());
        assert_eq!(table.route_count(), 1);
    }
}
