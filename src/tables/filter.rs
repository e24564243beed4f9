use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::trace;

use crate::attributes::{community, Attribute};
use crate::peer::{Genid, PeerHandle, PeerType, RouterInfo};
use crate::routes::RouteMessage;

/// What one filter decided about a message. A passing filter may have
/// rewritten the working attribute list.
#[derive(Debug)]
pub enum FilterVerdict {
    Pass(RouteMessage),
    Drop,
}

/// Origin-peer facts a filter needs beyond what the message carries
#[derive(Clone, Copy, Debug)]
pub struct FilterContext {
    pub origin_type: PeerType,
    pub origin_bgp_id: Ipv4Addr,
    pub origin_is_originate: bool,
}

/// One transformation step on a branch. Filters either pass the message,
/// drop it, or mutate a working copy of its attributes and pass it on.
pub trait RouteFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, msg: RouteMessage, ctx: &FilterContext) -> FilterVerdict;
}

/// Rewrite helper: clone the attribute list, apply `mutate`, and rebuild
/// the message around the canonicalised result.
fn rewrite<F>(msg: RouteMessage, mutate: F) -> RouteMessage
where
    F: FnOnce(&mut crate::attributes::AttributeList),
{
    let mut attrs = (**msg.attributes()).clone();
    mutate(&mut attrs);
    let route = Arc::new(msg.route.with_attributes(Arc::new(attrs)));
    msg.with_route(route)
}

/// Drops routes whose aggregation marker forbids this side of the
/// speaker (contributors folded into an aggregate stay off EBGP
/// branches, the aggregate itself stays off IBGP ones).
pub struct AggregationSteeringFilter {
    is_ibgp: bool,
}

impl AggregationSteeringFilter {
    pub fn new(is_ibgp: bool) -> Self {
        AggregationSteeringFilter { is_ibgp }
    }
}

impl RouteFilter for AggregationSteeringFilter {
    fn name(&self) -> &'static str {
        "aggregation-steering"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let allowed = if self.is_ibgp {
            msg.route.marker.allows_ibgp()
        } else {
            msg.route.marker.allows_ebgp()
        };
        if allowed {
            FilterVerdict::Pass(msg)
        } else {
            FilterVerdict::Drop
        }
    }
}

/// Drops routes already carrying a given AS (ingress loop prevention)
pub struct SimpleAsFilter {
    asn: u32,
}

impl SimpleAsFilter {
    pub fn new(asn: u32) -> Self {
        SimpleAsFilter { asn }
    }
}

impl RouteFilter for SimpleAsFilter {
    fn name(&self) -> &'static str {
        "simple-as"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        if msg.attributes().as_path().contains(self.asn) {
            FilterVerdict::Drop
        } else {
            FilterVerdict::Pass(msg)
        }
    }
}

/// Route reflector ingress checks: our own ORIGINATOR_ID or cluster id
/// coming back means a reflection loop.
pub struct RouteReflectorInputFilter {
    bgp_id: Ipv4Addr,
    cluster_id: Ipv4Addr,
}

impl RouteReflectorInputFilter {
    pub fn new(bgp_id: Ipv4Addr, cluster_id: Ipv4Addr) -> Self {
        RouteReflectorInputFilter { bgp_id, cluster_id }
    }
}

impl RouteFilter for RouteReflectorInputFilter {
    fn name(&self) -> &'static str {
        "rr-input"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let attrs = msg.attributes();
        if attrs.originator_id() == Some(self.bgp_id) {
            return FilterVerdict::Drop;
        }
        if let Some(cluster_list) = attrs.cluster_list() {
            if cluster_list.contains(&self.cluster_id) {
                return FilterVerdict::Drop;
            }
        }
        FilterVerdict::Pass(msg)
    }
}

/// Prepends the local AS on egress; confederation peers get a confed
/// segment instead, everyone else gets confed segments stripped first.
pub struct AsPrependFilter {
    asn: u32,
    confederation_peer: bool,
}

impl AsPrependFilter {
    pub fn new(asn: u32, confederation_peer: bool) -> Self {
        AsPrependFilter {
            asn,
            confederation_peer,
        }
    }
}

impl RouteFilter for AsPrependFilter {
    fn name(&self) -> &'static str {
        "as-prepend"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let confed = self.confederation_peer;
        let asn = self.asn;
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            let mut as_path = attrs.as_path();
            if confed {
                as_path.prepend_confed(asn);
            } else {
                as_path.remove_confed_segments();
                as_path.prepend(asn);
            }
            attrs.insert(Attribute::AsPath(as_path));
        }))
    }
}

/// Replaces NEXT_HOP with our address on the link, unless the peer is
/// directly connected and the existing next-hop already lies on the
/// shared subnet (third-party next-hop).
pub struct NexthopRewriteFilter {
    local_nexthop: std::net::IpAddr,
    directly_connected: bool,
    subnet: Option<IpNetwork>,
}

impl NexthopRewriteFilter {
    pub fn new(
        local_nexthop: std::net::IpAddr,
        directly_connected: bool,
        subnet: Option<IpNetwork>,
    ) -> Self {
        NexthopRewriteFilter {
            local_nexthop,
            directly_connected,
            subnet,
        }
    }
}

impl RouteFilter for NexthopRewriteFilter {
    fn name(&self) -> &'static str {
        "nexthop-rewrite"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        if self.directly_connected {
            if let (Some(subnet), Some(next_hop)) = (self.subnet, msg.attributes().next_hop()) {
                if subnet.contains(next_hop) {
                    return FilterVerdict::Pass(msg);
                }
            }
        }
        let local = self.local_nexthop;
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.insert(Attribute::NextHop(local));
        }))
    }
}

/// A self-originated route must not carry the peer's own address as its
/// next-hop; rewrite it back to ours.
pub struct NexthopPeerCheckFilter {
    local_nexthop: std::net::IpAddr,
    peer_address: std::net::IpAddr,
}

impl NexthopPeerCheckFilter {
    pub fn new(local_nexthop: std::net::IpAddr, peer_address: std::net::IpAddr) -> Self {
        NexthopPeerCheckFilter {
            local_nexthop,
            peer_address,
        }
    }
}

impl RouteFilter for NexthopPeerCheckFilter {
    fn name(&self) -> &'static str {
        "nexthop-peer-check"
    }

    fn filter(&self, msg: RouteMessage, ctx: &FilterContext) -> FilterVerdict {
        if !ctx.origin_is_originate {
            return FilterVerdict::Pass(msg);
        }
        if msg.attributes().next_hop() != Some(self.peer_address) {
            return FilterVerdict::Pass(msg);
        }
        let local = self.local_nexthop;
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.insert(Attribute::NextHop(local));
        }))
    }
}

/// Plain IBGP does not re-advertise IBGP-learned routes
pub struct IbgpLoopFilter;

impl RouteFilter for IbgpLoopFilter {
    fn name(&self) -> &'static str {
        "ibgp-loop"
    }

    fn filter(&self, msg: RouteMessage, ctx: &FilterContext) -> FilterVerdict {
        if ctx.origin_type == PeerType::Ibgp {
            FilterVerdict::Drop
        } else {
            FilterVerdict::Pass(msg)
        }
    }
}

/// Route-reflector egress to IBGP: reflect client routes, stamping
/// ORIGINATOR_ID and prepending our cluster id; plain-IBGP to plain-IBGP
/// still drops.
pub struct RrIbgpLoopFilter {
    rr_client: bool,
    bgp_id: Ipv4Addr,
    cluster_id: Ipv4Addr,
}

impl RrIbgpLoopFilter {
    pub fn new(rr_client: bool, bgp_id: Ipv4Addr, cluster_id: Ipv4Addr) -> Self {
        RrIbgpLoopFilter {
            rr_client,
            bgp_id,
            cluster_id,
        }
    }
}

impl RouteFilter for RrIbgpLoopFilter {
    fn name(&self) -> &'static str {
        "rr-ibgp-loop"
    }

    fn filter(&self, msg: RouteMessage, ctx: &FilterContext) -> FilterVerdict {
        if ctx.origin_type == PeerType::Ibgp && !self.rr_client {
            return FilterVerdict::Drop;
        }
        let originator = if ctx.origin_type == PeerType::Internal {
            self.bgp_id
        } else {
            ctx.origin_bgp_id
        };
        let cluster_id = self.cluster_id;
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            if attrs.originator_id().is_none() {
                attrs.insert(Attribute::OriginatorId(originator));
            }
            attrs.prepend_cluster_id(cluster_id);
        }))
    }
}

/// Reflection attributes never leave the AS
pub struct RrPurgeFilter;

impl RouteFilter for RrPurgeFilter {
    fn name(&self) -> &'static str {
        "rr-purge"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let attrs = msg.attributes();
        if attrs.originator_id().is_none() && attrs.cluster_list().is_none() {
            return FilterVerdict::Pass(msg);
        }
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.remove(9);
            attrs.remove(10);
        }))
    }
}

/// Insert the configured LOCAL_PREF on EBGP ingress. A value already
/// present came from a misbehaving peer (or this filter run twice), so
/// it is replaced.
pub struct LocalPrefInsertionFilter {
    default_local_pref: u32,
}

impl LocalPrefInsertionFilter {
    pub fn new(default_local_pref: u32) -> Self {
        LocalPrefInsertionFilter { default_local_pref }
    }
}

impl RouteFilter for LocalPrefInsertionFilter {
    fn name(&self) -> &'static str {
        "local-pref-insertion"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let pref = self.default_local_pref;
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.insert(Attribute::LocalPref(pref));
        }))
    }
}

/// LOCAL_PREF is AS-internal; strip it on EBGP egress
pub struct LocalPrefRemovalFilter;

impl RouteFilter for LocalPrefRemovalFilter {
    fn name(&self) -> &'static str {
        "local-pref-removal"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        if msg.attributes().local_pref().is_none() {
            return FilterVerdict::Pass(msg);
        }
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.remove(5);
        }))
    }
}

/// Set MED from the route's IGP metric on egress
pub struct MedInsertionFilter;

impl RouteFilter for MedInsertionFilter {
    fn name(&self) -> &'static str {
        "med-insertion"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let metric = match msg.route.igp_metric {
            Some(metric) => metric,
            None => return FilterVerdict::Pass(msg),
        };
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.insert(Attribute::Med(metric));
        }))
    }
}

/// The received MED was between us and the sending AS; strip it before
/// the route heads to a different neighbour.
pub struct MedRemovalFilter;

impl RouteFilter for MedRemovalFilter {
    fn name(&self) -> &'static str {
        "med-removal"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        if msg.attributes().med().is_none() {
            return FilterVerdict::Pass(msg);
        }
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.remove(4);
        }))
    }
}

/// RFC 1997 well-known community handling for the output peer type
pub struct KnownCommunityFilter {
    peer_type: PeerType,
}

impl KnownCommunityFilter {
    pub fn new(peer_type: PeerType) -> Self {
        KnownCommunityFilter { peer_type }
    }
}

impl RouteFilter for KnownCommunityFilter {
    fn name(&self) -> &'static str {
        "known-community"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        let communities = match msg.attributes().communities() {
            Some(communities) => communities,
            None => return FilterVerdict::Pass(msg),
        };
        // NO_ADVERTISE doesn't go to anyone
        if communities.contains(community::NO_ADVERTISE) {
            return FilterVerdict::Drop;
        }
        if self.peer_type == PeerType::Ebgp && communities.contains(community::NO_EXPORT) {
            return FilterVerdict::Drop;
        }
        if matches!(self.peer_type, PeerType::Ebgp | PeerType::EbgpConfed)
            && communities.contains(community::NO_EXPORT_SUBCONFED)
        {
            return FilterVerdict::Drop;
        }
        FilterVerdict::Pass(msg)
    }
}

/// Transitive/partial processing for attribute types we don't interpret
pub struct UnknownAttributeFilter;

impl RouteFilter for UnknownAttributeFilter {
    fn name(&self) -> &'static str {
        "unknown-attribute"
    }

    fn filter(&self, msg: RouteMessage, _ctx: &FilterContext) -> FilterVerdict {
        FilterVerdict::Pass(rewrite(msg, |attrs| {
            attrs.process_unknown_attributes();
        }))
    }
}

struct FilterVersion {
    version: u32,
    filters: Vec<Box<dyn RouteFilter>>,
}

/// An ordered per-branch filter chain.
///
/// Reconfiguring never rewrites stored state: a new version is
/// installed, while genids plumbed under an older version keep it until
/// their peering finishes going down.
pub struct FilterBank {
    name: String,
    versions: Vec<FilterVersion>,
    /// Which version each live genid is bound to
    bound: HashMap<Genid, u32>,
    next_version: u32,
}

impl FilterBank {
    pub fn new(name: String, filters: Vec<Box<dyn RouteFilter>>) -> Self {
        FilterBank {
            name,
            versions: vec![FilterVersion {
                version: 0,
                filters,
            }],
            bound: HashMap::new(),
            next_version: 1,
        }
    }

    /// Standard ingress chain for one peer
    pub fn ingress(peer: &PeerHandle, router: &RouterInfo) -> Self {
        let mut filters: Vec<Box<dyn RouteFilter>> = vec![];
        if peer.peer_type.is_ebgp() {
            filters.push(Box::new(SimpleAsFilter::new(router.local_as)));
            filters.push(Box::new(LocalPrefInsertionFilter::new(
                router.default_local_pref,
            )));
        }
        if router.route_reflector() && peer.peer_type.is_ibgp() {
            filters.push(Box::new(RouteReflectorInputFilter::new(
                router.bgp_id,
                router.cluster_id(),
            )));
        }
        FilterBank::new(format!("FilterIn-{}", peer.id), filters)
    }

    /// Standard egress chain for one branch
    pub fn egress(peer: &PeerHandle, router: &RouterInfo) -> Self {
        let is_ibgp = peer.peer_type.is_ibgp();
        let mut filters: Vec<Box<dyn RouteFilter>> = vec![Box::new(
            AggregationSteeringFilter::new(is_ibgp),
        )];
        filters.push(Box::new(KnownCommunityFilter::new(peer.peer_type)));
        match peer.peer_type {
            PeerType::Ebgp | PeerType::EbgpConfed => {
                filters.push(Box::new(RrPurgeFilter));
                if peer.peer_type == PeerType::Ebgp {
                    filters.push(Box::new(LocalPrefRemovalFilter));
                    filters.push(Box::new(MedRemovalFilter));
                    filters.push(Box::new(MedInsertionFilter));
                }
                filters.push(Box::new(AsPrependFilter::new(
                    router.local_as,
                    peer.confederation_peer,
                )));
                filters.push(Box::new(NexthopRewriteFilter::new(
                    peer.local_addr,
                    peer.directly_connected,
                    peer.subnet,
                )));
                filters.push(Box::new(NexthopPeerCheckFilter::new(
                    peer.local_addr,
                    peer.addr,
                )));
            }
            PeerType::Ibgp | PeerType::IbgpClient => {
                if router.route_reflector() {
                    filters.push(Box::new(RrIbgpLoopFilter::new(
                        peer.peer_type == PeerType::IbgpClient,
                        router.bgp_id,
                        router.cluster_id(),
                    )));
                } else {
                    filters.push(Box::new(IbgpLoopFilter));
                }
            }
            PeerType::Internal => (),
        }
        if peer.peer_type != PeerType::Internal {
            filters.push(Box::new(UnknownAttributeFilter));
        }
        FilterBank::new(format!("FilterOut-{}", peer.id), filters)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> &FilterVersion {
        self.versions.last().expect("at least one filter version")
    }

    /// Run the chain. The version is selected by the message's genid so
    /// in-flight state from before a reconfiguration keeps its policy.
    pub fn apply(&self, mut msg: RouteMessage, ctx: &FilterContext) -> FilterVerdict {
        let version = match self.bound.get(&msg.genid) {
            Some(version) => self
                .versions
                .iter()
                .find(|v| v.version == *version)
                .unwrap_or_else(|| self.current()),
            None => self.current(),
        };
        for filter in &version.filters {
            match filter.filter(msg, ctx) {
                FilterVerdict::Pass(passed) => msg = passed,
                FilterVerdict::Drop => {
                    trace!("{}: dropped by {}", self.name, filter.name());
                    return FilterVerdict::Drop;
                }
            }
        }
        FilterVerdict::Pass(msg)
    }

    /// Install a new chain as the current version
    pub fn reconfigure(&mut self, filters: Vec<Box<dyn RouteFilter>>) {
        let version = self.next_version;
        self.next_version += 1;
        self.versions.push(FilterVersion { version, filters });
        self.collect_unreferenced();
    }

    /// A peering came up under this genid; pin it to the current version
    pub fn bind_genid(&mut self, genid: Genid) {
        self.bound.insert(genid, self.current().version);
    }

    /// A peering under this genid has fully gone down
    pub fn release_genid(&mut self, genid: Genid) {
        self.bound.remove(&genid);
        self.collect_unreferenced();
    }

    fn collect_unreferenced(&mut self) {
        let current = self.current().version;
        let bound = &self.bound;
        self.versions
            .retain(|v| v.version == current || bound.values().any(|b| *b == v.version));
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }
}

impl fmt::Display for FilterBank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FilterBank {} versions={} filters={}>",
            self.name,
            self.versions.len(),
            self.current().filters.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AsPath, AttributeList, Community, CommunityList, PathOrigin};
    use crate::peer::ORIGINATE_PEER;
    use crate::routes::{AggregationMarker, SubnetRoute};
    use std::sync::Arc;

    fn ctx(origin_type: PeerType) -> FilterContext {
        FilterContext {
            origin_type,
            origin_bgp_id: "10.0.0.10".parse().unwrap(),
            origin_is_originate: false,
        }
    }

    fn msg_with(attrs: Vec<Attribute>) -> RouteMessage {
        let attrs = Arc::new(AttributeList::new(attrs));
        let route = Arc::new(SubnetRoute::new(
            "192.0.2.0/24".parse().unwrap(),
            attrs,
            16,
        ));
        RouteMessage::new(route, 16, 1)
    }

    fn base_attrs() -> Vec<Attribute> {
        vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
        ]
    }

    #[test]
    fn test_simple_as_filter() {
        let filter = SimpleAsFilter::new(65001);
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(_) => (),
            FilterVerdict::Drop => panic!("should pass"),
        }
        let mut looped = base_attrs();
        looped[1] = Attribute::AsPath(AsPath::from_sequence(vec![65001, 65010]));
        assert!(matches!(
            filter.filter(msg_with(looped), &ctx(PeerType::Ebgp)),
            FilterVerdict::Drop
        ));
    }

    #[test]
    fn test_as_prepend() {
        let filter = AsPrependFilter::new(65001, false);
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(msg.attributes().as_path().flattened(), vec![65001, 65010]);
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_as_prepend_confed() {
        let filter = AsPrependFilter::new(65001, true);
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::EbgpConfed)) {
            FilterVerdict::Pass(msg) => {
                let path = msg.attributes().as_path();
                assert!(path.contains(65001));
                // Confed prepend doesn't inflate the comparable length
                assert_eq!(path.path_len(), 1);
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_nexthop_rewrite_third_party() {
        // Directly connected, next-hop on the shared subnet: preserved
        let filter = NexthopRewriteFilter::new(
            "10.0.0.1".parse().unwrap(),
            true,
            Some("10.0.0.0/24".parse().unwrap()),
        );
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(msg.attributes().next_hop(), Some("10.0.0.10".parse().unwrap()));
            }
            FilterVerdict::Drop => panic!("should pass"),
        }

        // Not directly connected: rewritten
        let filter = NexthopRewriteFilter::new("10.0.0.1".parse().unwrap(), false, None);
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(msg.attributes().next_hop(), Some("10.0.0.1".parse().unwrap()));
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_nexthop_peer_check_only_self_originated() {
        let filter =
            NexthopPeerCheckFilter::new("10.0.0.1".parse().unwrap(), "10.0.0.10".parse().unwrap());
        // Route from a real peer: untouched even though next-hop matches
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(msg.attributes().next_hop(), Some("10.0.0.10".parse().unwrap()));
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
        // Self-originated with the peer's own address: rewritten
        let self_ctx = FilterContext {
            origin_type: PeerType::Internal,
            origin_bgp_id: Ipv4Addr::UNSPECIFIED,
            origin_is_originate: true,
        };
        let mut msg = msg_with(base_attrs());
        msg.origin = ORIGINATE_PEER;
        match filter.filter(msg, &self_ctx) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(msg.attributes().next_hop(), Some("10.0.0.1".parse().unwrap()));
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_ibgp_loop_filter() {
        let filter = IbgpLoopFilter;
        assert!(matches!(
            filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ibgp)),
            FilterVerdict::Drop
        ));
        assert!(matches!(
            filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)),
            FilterVerdict::Pass(_)
        ));
    }

    #[test]
    fn test_rr_loop_stamps_reflection_attributes() {
        let filter = RrIbgpLoopFilter::new(
            true,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.99".parse().unwrap(),
        );
        match filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ibgp)) {
            FilterVerdict::Pass(msg) => {
                assert_eq!(
                    msg.attributes().originator_id(),
                    Some("10.0.0.10".parse().unwrap())
                );
                assert_eq!(
                    msg.attributes().cluster_list().unwrap(),
                    &["10.0.0.99".parse::<Ipv4Addr>().unwrap()]
                );
            }
            FilterVerdict::Drop => panic!("should pass"),
        }

        // Plain IBGP to plain IBGP without a client still drops
        let filter = RrIbgpLoopFilter::new(
            false,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.99".parse().unwrap(),
        );
        assert!(matches!(
            filter.filter(msg_with(base_attrs()), &ctx(PeerType::Ibgp)),
            FilterVerdict::Drop
        ));
    }

    #[test]
    fn test_rr_purge() {
        let mut attrs = base_attrs();
        attrs.push(Attribute::OriginatorId("10.0.0.5".parse().unwrap()));
        attrs.push(Attribute::ClusterList(vec!["10.0.0.99".parse().unwrap()]));
        match RrPurgeFilter.filter(msg_with(attrs), &ctx(PeerType::Ibgp)) {
            FilterVerdict::Pass(msg) => {
                assert!(msg.attributes().originator_id().is_none());
                assert!(msg.attributes().cluster_list().is_none());
            }
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_local_pref_insert_remove() {
        let insert = LocalPrefInsertionFilter::new(100);
        let passed = match insert.filter(msg_with(base_attrs()), &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => msg,
            FilterVerdict::Drop => panic!("should pass"),
        };
        assert_eq!(passed.attributes().local_pref(), Some(100));

        match LocalPrefRemovalFilter.filter(passed, &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => assert_eq!(msg.attributes().local_pref(), None),
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_med_insertion_uses_igp_metric() {
        let mut msg = msg_with(base_attrs());
        let resolved = Arc::new(msg.route.with_metric(5));
        msg = msg.with_route(resolved);
        match MedInsertionFilter.filter(msg, &ctx(PeerType::Ebgp)) {
            FilterVerdict::Pass(msg) => assert_eq!(msg.attributes().med(), Some(5)),
            FilterVerdict::Drop => panic!("should pass"),
        }
    }

    #[test]
    fn test_known_community() {
        let mut attrs = base_attrs();
        attrs.push(Attribute::Communities(CommunityList(vec![
            Community::STANDARD(community::NO_EXPORT),
        ])));
        let ebgp = KnownCommunityFilter::new(PeerType::Ebgp);
        assert!(matches!(
            ebgp.filter(msg_with(attrs.clone()), &ctx(PeerType::Ebgp)),
            FilterVerdict::Drop
        ));
        let ibgp = KnownCommunityFilter::new(PeerType::Ibgp);
        assert!(matches!(
            ibgp.filter(msg_with(attrs), &ctx(PeerType::Ebgp)),
            FilterVerdict::Pass(_)
        ));

        let mut no_adv = base_attrs();
        no_adv.push(Attribute::Communities(CommunityList(vec![
            Community::STANDARD(community::NO_ADVERTISE),
        ])));
        assert!(matches!(
            ibgp.filter(msg_with(no_adv), &ctx(PeerType::Ebgp)),
            FilterVerdict::Drop
        ));
    }

    #[test]
    fn test_steering_filter() {
        let ibgp_side = AggregationSteeringFilter::new(true);
        let ebgp_side = AggregationSteeringFilter::new(false);
        let mut msg = msg_with(base_attrs());
        let marked = Arc::new(msg.route.with_marker(AggregationMarker::IbgpOnly));
        msg = msg.with_route(marked);
        assert!(matches!(
            ibgp_side.filter(msg.clone(), &ctx(PeerType::Ebgp)),
            FilterVerdict::Pass(_)
        ));
        assert!(matches!(
            ebgp_side.filter(msg, &ctx(PeerType::Ebgp)),
            FilterVerdict::Drop
        ));
    }

    #[test]
    fn test_bank_versioning() {
        let mut bank = FilterBank::new("test".into(), vec![Box::new(SimpleAsFilter::new(65001))]);
        bank.bind_genid(1);
        bank.reconfigure(vec![Box::new(SimpleAsFilter::new(65002))]);
        // Old version retained while genid 1 is live
        assert_eq!(bank.version_count(), 2);

        // genid 1 still filtered under the old policy
        let mut looped = base_attrs();
        looped[1] = Attribute::AsPath(AsPath::from_sequence(vec![65001]));
        assert!(matches!(
            bank.apply(msg_with(looped), &ctx(PeerType::Ebgp)),
            FilterVerdict::Drop
        ));

        bank.release_genid(1);
        assert_eq!(bank.version_count(), 1);
    }
}
