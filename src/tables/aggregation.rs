use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{RouteTable, TableOutput, TableRole};
use crate::attributes::{AsPath, AsSegment, Attribute, AttributeList, PathOrigin};
use crate::config::AggregateConfig;
use crate::peer::{RouterInfo, AGGREGATION_PEER, GENID_UNKNOWN};
use crate::routes::{AggregationMarker, RouteMessage, RouteOp, SubnetRoute};

/// One configured aggregate and its current contributors
struct AggregateRoute {
    net: IpNetwork,
    brief_mode: bool,
    attributes: Option<Arc<AttributeList>>,
    is_suppressed: bool,
    was_announced: bool,
    components: BTreeMap<IpNetwork, RouteMessage>,
}

impl AggregateRoute {
    fn new(net: IpNetwork, brief_mode: bool) -> Self {
        AggregateRoute {
            net,
            brief_mode,
            attributes: None,
            is_suppressed: false,
            was_announced: false,
            components: BTreeMap::new(),
        }
    }

    fn contributor_marker(&self) -> AggregationMarker {
        if self.is_suppressed {
            AggregationMarker::EbgpNotAggregated
        } else {
            AggregationMarker::EbgpWasAggregated
        }
    }
}

/// Materialises configured aggregate prefixes from the winners flowing
/// past and steers contributors with aggregation markers.
///
/// Contributors always continue to IBGP peers and the local RIB; what
/// the EBGP side sees depends on whether their aggregate is currently
/// announced or suppressed.
pub struct AggregationTable {
    name: String,
    router: RouterInfo,
    configs: BTreeMap<IpNetwork, AggregateConfig>,
    aggregates: BTreeMap<IpNetwork, AggregateRoute>,
}

impl AggregationTable {
    pub fn new(name: &str, router: RouterInfo, configs: Vec<AggregateConfig>) -> Self {
        AggregationTable {
            name: format!("AggregationTable-{}", name),
            router,
            configs: configs
                .into_iter()
                .filter(|config| config.enabled)
                .map(|config| (config.prefix, config))
                .collect(),
            aggregates: BTreeMap::new(),
        }
    }

    /// Currently-announced aggregates, for the background dump
    pub fn announced(&self) -> impl Iterator<Item = (&IpNetwork, &Arc<AttributeList>)> {
        self.aggregates.values().filter_map(|aggr| {
            if aggr.was_announced {
                aggr.attributes.as_ref().map(|attrs| (&aggr.net, attrs))
            } else {
                None
            }
        })
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Marker a snapshot route should carry when dumped to a branch.
    /// `None` means the route must not be dumped there at all (it would
    /// collide with the announced aggregate).
    pub fn mark_for_dump(&self, net: &IpNetwork, to_ibgp: bool) -> Option<AggregationMarker> {
        let aggr_net = match self.covering_aggregate(net) {
            Some(aggr_net) => aggr_net,
            None => return Some(AggregationMarker::Ignore),
        };
        if to_ibgp {
            // IBGP branches always take the real route
            return Some(AggregationMarker::Ignore);
        }
        match self.aggregates.get(&aggr_net) {
            Some(aggr) => {
                if aggr.net != *net || aggr.is_suppressed {
                    Some(aggr.contributor_marker())
                } else {
                    None
                }
            }
            None => Some(AggregationMarker::Ignore),
        }
    }

    /// The most specific enabled aggregate covering this net, if the
    /// net is strictly more specific than the aggregate.
    fn covering_aggregate(&self, net: &IpNetwork) -> Option<IpNetwork> {
        self.configs
            .values()
            .filter(|config| {
                config.prefix.prefix() < net.prefix()
                    && config.prefix.contains(net.ip())
                    && config.prefix.is_ipv4() == net.is_ipv4()
            })
            .map(|config| config.prefix)
            .max_by_key(|prefix| prefix.prefix())
    }

    fn marked(msg: &RouteMessage, marker: AggregationMarker) -> RouteMessage {
        msg.with_route(Arc::new(msg.route.with_marker(marker)))
    }

    /// Recompute the aggregate's attribute list and emit whatever the
    /// transition requires: the aggregate itself appearing, changing,
    /// or going away, and contributors re-marked when suppression
    /// flips.
    fn reevaluate(&mut self, aggr_net: IpNetwork) -> Vec<RouteOp> {
        let router = self.router.clone();
        let aggr = self.aggregates.get_mut(&aggr_net).expect("aggregate exists");
        let old_attributes = aggr.attributes.clone();
        let old_was_suppressed = aggr.is_suppressed;
        let old_was_announced = aggr.was_announced;
        aggr.is_suppressed = false;

        // Fold every contributor into the new attribute list
        let mut med: Option<u32> = None;
        let mut origin = PathOrigin::Igp;
        let mut as_path = AsPath::empty();
        let mut atomic = false;
        for (index, component) in aggr.components.values().enumerate() {
            let attrs = component.attributes();
            if index == 0 {
                med = attrs.med();
                origin = attrs.origin();
                as_path = attrs.as_path();
            } else {
                if attrs.med() != med {
                    // MED must be uniform across contributors
                    aggr.is_suppressed = true;
                    break;
                }
                if attrs.origin() > origin {
                    origin = attrs.origin();
                }
                if aggr.brief_mode {
                    if as_path != attrs.as_path() {
                        as_path = AsPath::empty();
                        atomic = true;
                    }
                } else {
                    as_path = as_path.merge_for_aggregate(&attrs.as_path());
                }
            }
            if attrs.atomic_aggregate() {
                atomic = true;
            }
        }

        let mut new_attrs = AttributeList::new(vec![
            Attribute::Origin(origin),
            Attribute::NextHop(unspecified_nexthop(&aggr.net)),
        ]);
        let med_allowed = !matches!(as_path.segments.first(), Some(AsSegment::Set(_)));
        new_attrs.insert(Attribute::AsPath(as_path));
        if let (Some(med), true) = (med, med_allowed) {
            new_attrs.insert(Attribute::Med(med));
        }
        if atomic {
            new_attrs.insert(Attribute::AtomicAggregate);
        }
        new_attrs.insert(Attribute::Aggregator {
            asn: router.local_as,
            speaker: router.bgp_id,
        });
        let new_attrs = Arc::new(new_attrs);
        let attrs_changed = old_attributes.as_deref() != Some(new_attrs.as_ref());
        aggr.attributes = Some(new_attrs.clone());

        let mut ops = vec![];

        // The announced aggregate no longer matches reality: withdraw it
        if old_was_announced && (aggr.is_suppressed || attrs_changed) {
            let old_attrs = old_attributes.expect("announced implies attributes");
            let msg = {
                let mut route =
                    SubnetRoute::new(aggr.net, old_attrs, AGGREGATION_PEER).with_metric(0);
                route.marker = AggregationMarker::EbgpAggregate;
                RouteMessage::new(Arc::new(route), AGGREGATION_PEER, GENID_UNKNOWN)
            };
            ops.push(RouteOp::Delete(msg));
            aggr.was_announced = false;
        }

        // Suppression flipped: every contributor changes sides on EBGP
        if old_was_suppressed != aggr.is_suppressed {
            let (old_marker, new_marker) = if old_was_suppressed {
                (
                    AggregationMarker::EbgpNotAggregated,
                    AggregationMarker::EbgpWasAggregated,
                )
            } else {
                (
                    AggregationMarker::EbgpWasAggregated,
                    AggregationMarker::EbgpNotAggregated,
                )
            };
            let components: Vec<RouteMessage> = aggr.components.values().cloned().collect();
            let aggregate_net = aggr.net;
            let suppressed_now = aggr.is_suppressed;
            for component in components {
                // Skip pieces that would collide with the aggregate
                if !(old_was_announced && component.net() == aggregate_net) {
                    ops.push(RouteOp::Delete(Self::marked(&component, old_marker)));
                }
                if !(!suppressed_now && component.net() == aggregate_net) {
                    ops.push(RouteOp::Add(Self::marked(&component, new_marker)));
                }
            }
        }

        // Announce the fresh aggregate
        let aggr = self.aggregates.get_mut(&aggr_net).expect("aggregate exists");
        if !aggr.was_announced
            && !aggr.is_suppressed
            && !aggr.components.is_empty()
            && (old_was_suppressed || attrs_changed)
        {
            let msg = {
                let mut route =
                    SubnetRoute::new(aggr.net, new_attrs, AGGREGATION_PEER).with_metric(0);
                route.marker = AggregationMarker::EbgpAggregate;
                RouteMessage::new(Arc::new(route), AGGREGATION_PEER, GENID_UNKNOWN)
            };
            ops.push(RouteOp::Add(msg));
            aggr.was_announced = true;
        }

        ops
    }
}

fn unspecified_nexthop(net: &IpNetwork) -> IpAddr {
    if net.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

impl RouteTable for AggregationTable {
    fn role(&self) -> TableRole {
        TableRole::Aggregation
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        assert!(
            msg.route.nexthop_resolved(),
            "{}: unresolved route for {}",
            self.name,
            msg.net()
        );
        let aggr_net = match self.covering_aggregate(&msg.net()) {
            Some(aggr_net) => aggr_net,
            // Not an aggregation candidate: straight through
            None => return TableOutput::used(RouteOp::Add(msg)),
        };
        trace!("{}: {} contributes to {}", self.name, msg.net(), aggr_net);
        let must_push = msg.push;

        let brief = self
            .configs
            .get(&aggr_net)
            .map(|config| config.brief_mode)
            .unwrap_or(false);
        let aggr = self
            .aggregates
            .entry(aggr_net)
            .or_insert_with(|| AggregateRoute::new(aggr_net, brief));
        aggr.components.insert(msg.net(), msg.clone());

        let mut ops = vec![];
        // The EBGP side sees the contributor marked per current
        // suppression state (collisions with the aggregate net excluded)
        if aggr.net != msg.net() || aggr.is_suppressed {
            ops.push(RouteOp::Add(Self::marked(&msg, aggr.contributor_marker())));
        }
        ops.extend(self.reevaluate(aggr_net));
        // The IBGP side and the local RIB always get the real route
        ops.push(RouteOp::Add(Self::marked(
            &msg,
            AggregationMarker::IbgpOnly,
        )));
        if must_push {
            ops.push(RouteOp::Push);
        }
        TableOutput::pass_through(ops)
    }

    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, now: Instant) -> TableOutput {
        let old_candidate = self.covering_aggregate(&old.net()).is_some();
        let new_candidate = self.covering_aggregate(&new.net()).is_some();
        if !old_candidate && !new_candidate {
            return TableOutput::used(RouteOp::Replace(old, new));
        }
        let mut out = self.delete_route(old, now);
        let add_out = self.add_route(new, now);
        out.ops.extend(add_out.ops);
        out.outcome = add_out.outcome;
        out
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        let aggr_net = match self.covering_aggregate(&msg.net()) {
            Some(aggr_net) => aggr_net,
            None => return TableOutput::used(RouteOp::Delete(msg)),
        };
        let must_push = msg.push;
        let aggr = match self.aggregates.get_mut(&aggr_net) {
            Some(aggr) => aggr,
            None => {
                // Aggregate appeared in config after this route passed
                return TableOutput::used(RouteOp::Delete(msg));
            }
        };

        let mut ops = vec![];
        if aggr.net != msg.net() || aggr.is_suppressed {
            ops.push(RouteOp::Delete(Self::marked(
                &msg,
                aggr.contributor_marker(),
            )));
        }
        aggr.components.remove(&msg.net());
        let empty = aggr.components.is_empty();
        ops.extend(self.reevaluate(aggr_net));
        if empty {
            debug!("{}: last contributor of {} gone", self.name, aggr_net);
            self.aggregates.remove(&aggr_net);
        }
        ops.push(RouteOp::Delete(Self::marked(
            &msg,
            AggregationMarker::IbgpOnly,
        )));
        if must_push {
            ops.push(RouteOp::Push);
        }
        TableOutput::pass_through(ops)
    }
}

impl fmt::Display for AggregationTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<AggregationTable configured={} active={}>",
            self.configs.len(),
            self.aggregates.len()
        )
    }
}
