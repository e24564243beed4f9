use std::fmt;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::attributes::AttributeList;
use crate::peer::{Genid, PeerId};

/// How a route relates to configured aggregation.
///
/// The marker is encoded into the route so the per-branch steering filter
/// can decide which side of the speaker may see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationMarker {
    /// Not an aggregation candidate
    Ignore,
    /// Contributor propagated to IBGP peers and the local RIB only
    IbgpOnly,
    /// Contributor folded into a currently-announced aggregate
    EbgpWasAggregated,
    /// Contributor advertised as-is because its aggregate is suppressed
    EbgpNotAggregated,
    /// The aggregate route itself
    EbgpAggregate,
}

impl AggregationMarker {
    /// May a branch of the given side carry this route?
    pub fn allows_ibgp(self) -> bool {
        matches!(self, AggregationMarker::Ignore | AggregationMarker::IbgpOnly)
    }

    /// Folded-away contributors stay off the EBGP side entirely; their
    /// IBGP delivery rides the IbgpOnly copy
    pub fn allows_ebgp(self) -> bool {
        matches!(
            self,
            AggregationMarker::Ignore
                | AggregationMarker::EbgpNotAggregated
                | AggregationMarker::EbgpAggregate
        )
    }
}

/// The unit of route state flowing through the pipeline.
///
/// Immutable once built; storage and in-flight messages share it by
/// reference count. A table that needs a different marker or metric
/// builds a sibling route around the same attribute list.
#[derive(Clone, Debug)]
pub struct SubnetRoute {
    pub net: IpNetwork,
    pub attributes: Arc<AttributeList>,
    /// Peer this route entered the pipeline from
    pub origin: PeerId,
    /// IGP metric to the next-hop, filled in once resolved
    pub igp_metric: Option<u32>,
    pub marker: AggregationMarker,
}

impl SubnetRoute {
    pub fn new(net: IpNetwork, attributes: Arc<AttributeList>, origin: PeerId) -> Self {
        SubnetRoute {
            net,
            attributes,
            origin,
            igp_metric: None,
            marker: AggregationMarker::Ignore,
        }
    }

    /// Sibling route with the resolved metric filled in
    pub fn with_metric(&self, igp_metric: u32) -> Self {
        SubnetRoute {
            igp_metric: Some(igp_metric),
            ..self.clone()
        }
    }

    /// Sibling route with a different aggregation marker
    pub fn with_marker(&self, marker: AggregationMarker) -> Self {
        SubnetRoute {
            marker,
            ..self.clone()
        }
    }

    /// Sibling route with replaced attributes (post-filter)
    pub fn with_attributes(&self, attributes: Arc<AttributeList>) -> Self {
        SubnetRoute {
            attributes,
            ..self.clone()
        }
    }

    pub fn nexthop_resolved(&self) -> bool {
        self.igp_metric.is_some()
    }
}

impl fmt::Display for SubnetRoute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Route {} from={} metric={}>",
            self.net,
            self.origin,
            self.igp_metric
                .map(|metric| metric.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

/// The carrier that flows between tables. Lives only for the duration of
/// one dispatch; the route reference keeps the underlying state alive.
#[derive(Clone, Debug)]
pub struct RouteMessage {
    pub route: Arc<SubnetRoute>,
    pub origin: PeerId,
    pub genid: Genid,
    /// Batch boundary follows this message
    pub push: bool,
    /// Carries state from a peering incarnation that has gone down
    pub from_previous_peering: bool,
}

impl RouteMessage {
    pub fn new(route: Arc<SubnetRoute>, origin: PeerId, genid: Genid) -> Self {
        RouteMessage {
            route,
            origin,
            genid,
            push: false,
            from_previous_peering: false,
        }
    }

    pub fn net(&self) -> IpNetwork {
        self.route.net
    }

    pub fn attributes(&self) -> &Arc<AttributeList> {
        &self.route.attributes
    }

    pub fn with_push(mut self) -> Self {
        self.push = true;
        self
    }

    pub fn from_previous_peering(mut self) -> Self {
        self.from_previous_peering = true;
        self
    }

    /// Same message around a different route (filters rewriting
    /// attributes, tables changing markers)
    pub fn with_route(&self, route: Arc<SubnetRoute>) -> Self {
        RouteMessage {
            route,
            ..self.clone()
        }
    }
}

impl fmt::Display for RouteMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Msg {} origin={} genid={}{}>",
            self.net(),
            self.origin,
            self.genid,
            if self.push { " push" } else { "" },
        )
    }
}

/// One logical operation travelling an edge of the table graph
#[derive(Clone, Debug)]
pub enum RouteOp {
    Add(RouteMessage),
    /// Same prefix, same origin peer; old then new, semantically atomic
    Replace(RouteMessage, RouteMessage),
    Delete(RouteMessage),
    /// Batch boundary
    Push,
}

impl RouteOp {
    pub fn net(&self) -> Option<IpNetwork> {
        match self {
            RouteOp::Add(msg) | RouteOp::Delete(msg) => Some(msg.net()),
            RouteOp::Replace(_, new) => Some(new.net()),
            RouteOp::Push => None,
        }
    }
}

/// What a table did with a message; not an error channel (see the
/// pipeline error taxonomy).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Used,
    Unused,
    Filtered,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AsPath, Attribute, PathOrigin};

    fn route() -> SubnetRoute {
        let attrs = Arc::new(crate::attributes::AttributeList::new(vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
        ]));
        SubnetRoute::new("192.0.2.0/24".parse().unwrap(), attrs, 16)
    }

    #[test]
    fn test_siblings_share_attributes() {
        let original = route();
        let resolved = original.with_metric(20);
        assert!(Arc::ptr_eq(&original.attributes, &resolved.attributes));
        assert!(resolved.nexthop_resolved());
        assert!(!original.nexthop_resolved());
    }

    #[test]
    fn test_marker_sides() {
        assert!(AggregationMarker::Ignore.allows_ebgp());
        assert!(AggregationMarker::Ignore.allows_ibgp());
        assert!(!AggregationMarker::IbgpOnly.allows_ebgp());
        assert!(AggregationMarker::EbgpAggregate.allows_ebgp());
        assert!(!AggregationMarker::EbgpAggregate.allows_ibgp());
        // Aggregated-away contributors are carried by neither side
        assert!(!AggregationMarker::EbgpWasAggregated.allows_ebgp());
        assert!(!AggregationMarker::EbgpWasAggregated.allows_ibgp());
        assert!(AggregationMarker::EbgpNotAggregated.allows_ebgp());
    }
}
