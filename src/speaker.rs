use std::collections::HashMap;
use std::error;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use bgp_rs::Update;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};

use crate::attributes::{parse_update, AttributeList};
use crate::config::{PeerConfig, ServerConfig};
use crate::families::Family;
use crate::peer::{Genid, PeerHandle, PeerId, FIRST_PEER_ID, LOCAL_RIB_PEER};
use crate::pipeline::{Pipeline, PipelineStats, RouteReaderEntry};
use crate::tables::UpdateSink;
use crate::utils::{format_time_as_elapsed, ParseError};

/// Builds the per-(peer, family) send-side sinks; the daemon hands out
/// UPDATE builders, tests hand out recorders.
pub type SinkFactory = Box<dyn FnMut(PeerId, Family) -> Box<dyn UpdateSink> + Send>;

#[derive(Debug)]
pub enum SpeakerError {
    /// No configured peering for this address
    UnknownPeer(IpAddr),
    /// The peer doesn't carry this family
    UnknownFamily(Family),
    /// The peering isn't established
    PeerNotUp(IpAddr),
    /// Couldn't make sense of an UPDATE
    Parse(ParseError),
}

impl fmt::Display for SpeakerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Speaker Error: ")?;
        use SpeakerError::*;
        match self {
            UnknownPeer(addr) => write!(f, "Unknown peer {}", addr)?,
            UnknownFamily(family) => write!(f, "Peer doesn't carry {}", family)?,
            PeerNotUp(addr) => write!(f, "Peering with {} is not established", addr)?,
            Parse(err) => write!(f, "{}", err)?,
        }
        Ok(())
    }
}

impl error::Error for SpeakerError {}

impl From<ParseError> for SpeakerError {
    fn from(error: ParseError) -> Self {
        SpeakerError::Parse(error)
    }
}

#[derive(Debug, Default)]
pub struct MessageCounts {
    received: u64,
    sent: u64,
}

impl MessageCounts {
    pub fn received(&self) -> u64 {
        self.received
    }
    pub fn increment_received(&mut self) {
        self.received += 1;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
    pub fn increment_sent(&mut self) {
        self.sent += 1;
    }
}

/// Registry entry for one configured peering
struct PeerState {
    config: Arc<PeerConfig>,
    id: PeerId,
    /// Genid of the current incarnation; None while down
    genid: Option<Genid>,
    counts: MessageCounts,
    connect_time: Option<DateTime<Utc>>,
}

impl PeerState {
    fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id,
            bgp_id: self.config.router_id,
            addr: self.config.remote_ip,
            remote_as: self.config.remote_as,
            peer_type: self.config.peer_type,
            local_addr: self.config.local_address,
            subnet: self.config.subnet,
            directly_connected: self.config.directly_connected,
            confederation_peer: self.config.confederation_peer,
        }
    }
}

/// Summary of one peering for the management surface
#[derive(Clone, Debug, serde::Serialize)]
pub struct PeerSummary {
    pub peer: String,
    pub peer_type: String,
    pub remote_as: u32,
    pub enabled: bool,
    pub up: bool,
    pub genid: Option<Genid>,
    pub msg_received: u64,
    pub uptime: Option<String>,
    pub prefixes_received: usize,
    pub prefixes_damped: usize,
}

/// An in-progress route-table read
struct RouteReader {
    family: Family,
    entries: Vec<RouteReaderEntry>,
    position: usize,
}

/// The collaborator-facing surface over all four pipelines: parsed
/// UPDATEs in, peer lifecycle in, next-hop resolution in, UPDATE
/// builders out. One genid space, one peer registry.
pub struct Speaker {
    router_id: std::net::Ipv4Addr,
    pipelines: HashMap<Family, Pipeline>,
    peers: HashMap<IpAddr, PeerState>,
    sinks: SinkFactory,
    next_peer_id: PeerId,
    next_genid: Genid,
    readers: HashMap<u32, RouteReader>,
    next_reader: u32,
}

impl Speaker {
    pub fn new(config: &ServerConfig, mut sinks: SinkFactory, now: Instant) -> Self {
        let router = config.router_info();
        let mut pipelines = HashMap::new();
        for family in Family::all() {
            let aggregates: Vec<_> = config
                .aggregates
                .iter()
                .filter(|aggregate| {
                    aggregate.prefix.is_ipv4() == (family.afi == bgp_rs::AFI::IPV4)
                })
                .cloned()
                .collect();
            pipelines.insert(
                family,
                Pipeline::new(
                    family,
                    router.clone(),
                    config.damping.clone(),
                    aggregates,
                    config.local_address,
                    sinks(LOCAL_RIB_PEER, family),
                    now,
                ),
            );
        }

        let mut speaker = Speaker {
            router_id: config.router_id,
            pipelines,
            peers: HashMap::new(),
            sinks,
            next_peer_id: FIRST_PEER_ID,
            next_genid: 0,
            readers: HashMap::new(),
            next_reader: 0,
        };
        for peer_config in &config.peers {
            speaker.register_peer(peer_config.clone());
        }
        speaker
    }

    pub fn router_id(&self) -> std::net::Ipv4Addr {
        self.router_id
    }

    fn register_peer(&mut self, config: Arc<PeerConfig>) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        debug!("Registered peer {} as id {}", config.remote_ip, id);
        self.peers.insert(
            config.remote_ip,
            PeerState {
                config,
                id,
                genid: None,
                counts: MessageCounts::default(),
                connect_time: None,
            },
        );
        id
    }

    fn peer(&self, addr: IpAddr) -> Result<&PeerState, SpeakerError> {
        self.peers.get(&addr).ok_or(SpeakerError::UnknownPeer(addr))
    }

    fn pipeline(&mut self, family: Family) -> Result<&mut Pipeline, SpeakerError> {
        self.pipelines
            .get_mut(&family)
            .ok_or(SpeakerError::UnknownFamily(family))
    }

    // ------------------------------------------------------------------
    // FSM-facing lifecycle

    /// The session reached Established; plumb the peer into every
    /// family it carries under a fresh genid.
    pub fn peering_came_up(&mut self, addr: IpAddr, now: Instant) -> Result<Genid, SpeakerError> {
        self.next_genid += 1;
        let genid = self.next_genid;
        let (id, families, handle) = {
            let state = self
                .peers
                .get_mut(&addr)
                .ok_or(SpeakerError::UnknownPeer(addr))?;
            state.genid = Some(genid);
            state.connect_time = Some(Utc::now());
            (state.id, state.config.families.clone(), state.handle())
        };
        info!("Peering came up: {} (id={} genid={})", addr, id, genid);
        for family in families.iter().copied() {
            let sink = (self.sinks)(id, family);
            if let Some(pipeline) = self.pipelines.get_mut(&family) {
                pipeline.peering_came_up(handle.clone(), genid, sink, now);
            }
        }
        Ok(genid)
    }

    /// The session dropped; begin the bracketed down sequence
    pub fn peering_went_down(&mut self, addr: IpAddr, now: Instant) -> Result<(), SpeakerError> {
        let (id, families) = {
            let state = self
                .peers
                .get_mut(&addr)
                .ok_or(SpeakerError::UnknownPeer(addr))?;
            state.genid = None;
            state.connect_time = None;
            (state.id, state.config.families.clone())
        };
        info!("Peering went down: {} (id={})", addr, id);
        for family in families.iter().copied() {
            if let Some(pipeline) = self.pipelines.get_mut(&family) {
                pipeline.peering_went_down(id, now);
            }
        }
        Ok(())
    }

    /// Advisory: a peer was already down-and-deleting under this genid
    pub fn peering_is_down_signal(
        &mut self,
        addr: IpAddr,
        genid: Genid,
    ) -> Result<(), SpeakerError> {
        let (id, families) = {
            let state = self.peer(addr)?;
            (state.id, state.config.families.clone())
        };
        for family in families.iter().copied() {
            if let Some(pipeline) = self.pipelines.get_mut(&family) {
                pipeline.peering_is_down_signal(id, genid);
            }
        }
        Ok(())
    }

    /// Remove a peering entirely (after its down sequence drained)
    pub fn delete_peering(&mut self, addr: IpAddr) -> Result<(), SpeakerError> {
        let (id, families) = {
            let state = self.peer(addr)?;
            (state.id, state.config.families.clone())
        };
        for family in families.iter().copied() {
            if let Some(pipeline) = self.pipelines.get_mut(&family) {
                pipeline.delete_peering(id);
            }
        }
        self.peers.remove(&addr);
        info!("Peering deleted: {}", addr);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Route flow

    /// One parsed UPDATE from the codec
    pub fn process_update(
        &mut self,
        addr: IpAddr,
        update: &Update,
        now: Instant,
    ) -> Result<(), SpeakerError> {
        let parsed = parse_update(update)?;
        let (id, carried) = {
            let state = self
                .peers
                .get_mut(&addr)
                .ok_or(SpeakerError::UnknownPeer(addr))?;
            if state.genid.is_none() {
                return Err(SpeakerError::PeerNotUp(addr));
            }
            state.counts.increment_received();
            (state.id, state.config.families.contains(parsed.family))
        };
        if !carried {
            warn!("UPDATE from {} for uncarried family {}", addr, parsed.family);
            return Err(SpeakerError::UnknownFamily(parsed.family));
        }

        let attributes = Arc::new(parsed.attributes);
        let pipeline = self.pipeline(parsed.family)?;
        for net in parsed.withdrawn {
            pipeline.withdraw(id, net, now);
        }
        for net in parsed.announced {
            pipeline.announce(id, net, attributes.clone(), now);
        }
        pipeline.push_from_peer(id, now);
        Ok(())
    }

    /// Inject a route this speaker originates
    pub fn originate_route(
        &mut self,
        family: Family,
        net: IpNetwork,
        attributes: AttributeList,
        now: Instant,
    ) -> Result<(), SpeakerError> {
        self.pipeline(family)?
            .originate(net, Arc::new(attributes), now);
        Ok(())
    }

    pub fn withdraw_originated_route(
        &mut self,
        family: Family,
        net: IpNetwork,
        now: Instant,
    ) -> Result<(), SpeakerError> {
        self.pipeline(family)?.withdraw_originated(net, now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // RIB client (next-hop resolution)

    pub fn nexthop_changed(&mut self, nexthop: IpAddr, metric: u32, now: Instant) {
        for pipeline in self.pipelines.values_mut() {
            pipeline.nexthop_changed(nexthop, metric, now);
        }
    }

    pub fn nexthop_invalid(&mut self, nexthop: IpAddr, now: Instant) {
        for pipeline in self.pipelines.values_mut() {
            pipeline.nexthop_invalid(nexthop, now);
        }
    }

    /// Next-hops the daemon should go ask the RIB about
    pub fn pending_nexthops(&self) -> Vec<IpAddr> {
        let mut pending: Vec<IpAddr> = self
            .pipelines
            .values()
            .flat_map(|pipeline| pipeline.pending_nexthops())
            .collect();
        pending.sort();
        pending.dedup();
        pending
    }

    // ------------------------------------------------------------------
    // Send-side flow control

    pub fn output_no_longer_busy(&mut self, addr: IpAddr, now: Instant) -> Result<(), SpeakerError> {
        let (id, families) = {
            let state = self.peer(addr)?;
            (state.id, state.config.families.clone())
        };
        for family in families.iter().copied() {
            if let Some(pipeline) = self.pipelines.get_mut(&family) {
                pipeline.output_no_longer_busy(id, now);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler pump

    /// Run all due deferred work across pipelines; returns the number
    /// of tasks dispatched so callers can pump until quiescent.
    pub fn run_tasks(&mut self, now: Instant) -> usize {
        self.pipelines
            .values_mut()
            .map(|pipeline| pipeline.run_tasks(now))
            .sum()
    }

    /// Pump until nothing more is runnable at `now`
    pub fn run_until_idle(&mut self, now: Instant) {
        while self.run_tasks(now) > 0 {}
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pipelines
            .values()
            .filter_map(|pipeline| pipeline.next_deadline())
            .min()
    }

    pub fn has_deferred_work(&self) -> bool {
        self.pipelines
            .values()
            .any(|pipeline| pipeline.has_deferred_work())
    }

    // ------------------------------------------------------------------
    // Management surface

    pub fn peer_summaries(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|state| {
                let prefixes: usize = self
                    .pipelines
                    .values()
                    .map(|pipeline| pipeline.route_count_of_peer(state.id))
                    .sum();
                let damped: usize = self
                    .pipelines
                    .values()
                    .map(|pipeline| pipeline.damped_count_of_peer(state.id))
                    .sum();
                PeerSummary {
                    peer: state.config.remote_ip.to_string(),
                    peer_type: state.config.peer_type.to_string(),
                    remote_as: state.config.remote_as,
                    enabled: state.config.enabled,
                    up: state.genid.is_some(),
                    genid: state.genid,
                    msg_received: state.counts.received(),
                    uptime: state.connect_time.map(format_time_as_elapsed),
                    prefixes_received: prefixes,
                    prefixes_damped: damped,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.peer.cmp(&b.peer));
        summaries
    }

    /// Reconfigure damping at runtime; already-damped prefixes keep
    /// draining through their reuse timers either way
    pub fn set_damping_enabled(&mut self, enabled: bool) {
        for pipeline in self.pipelines.values_mut() {
            pipeline.set_damping_enabled(enabled);
        }
    }

    /// Per-prefix damping state for one family
    pub fn damping_entries(
        &self,
        family: Family,
        now: Instant,
    ) -> Result<Vec<(PeerId, IpNetwork, u32, bool)>, SpeakerError> {
        self.pipelines
            .get(&family)
            .map(|pipeline| pipeline.damping_entries(now))
            .ok_or(SpeakerError::UnknownFamily(family))
    }

    pub fn pipeline_stats(&self) -> Vec<(Family, PipelineStats)> {
        let mut stats: Vec<_> = self
            .pipelines
            .iter()
            .map(|(family, pipeline)| (*family, pipeline.stats()))
            .collect();
        stats.sort_by_key(|(family, _)| family.to_string());
        stats
    }

    /// Begin a stable-order walk over one family's stored routes
    pub fn create_route_reader(&mut self, family: Family) -> Result<u32, SpeakerError> {
        let entries = self
            .pipelines
            .get(&family)
            .ok_or(SpeakerError::UnknownFamily(family))?
            .read_routes();
        let token = self.next_reader;
        self.next_reader += 1;
        self.readers.insert(
            token,
            RouteReader {
                family,
                entries,
                position: 0,
            },
        );
        Ok(token)
    }

    /// Next route under a reader token; None at end-of-table
    pub fn read_next(&mut self, token: u32) -> Option<RouteReaderEntry> {
        let reader = self.readers.get_mut(&token)?;
        let entry = reader.entries.get(reader.position).cloned();
        reader.position += 1;
        if entry.is_none() {
            self.readers.remove(&token);
        }
        entry
    }

    pub fn drop_route_reader(&mut self, token: u32) {
        self.readers.remove(&token);
    }

    pub fn reader_family(&self, token: u32) -> Option<Family> {
        self.readers.get(&token).map(|reader| reader.family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attribute;
    use crate::config::{AggregateConfig, DampingConfig};
    use crate::peer::{PeerType, LOCAL_RIB_PEER};
    use crate::tables::rib_out::test_sink::{RecordingSink, SinkEvent};
    use crate::tables::UpdateBuilder;
    use bgp_rs::{ASPath, Origin, PathAttribute, Segment, Update, AFI, SAFI};
    use std::collections::HashMap as StdHashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn v4u() -> Family {
        Family::new(AFI::IPV4, SAFI::Unicast)
    }

    fn peer_config(ip: &str, asn: u32, peer_type: PeerType) -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            remote_ip: ip.parse().unwrap(),
            remote_as: asn,
            router_id: match ip.parse::<IpAddr>().unwrap() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            },
            peer_type,
            local_address: "10.0.0.1".parse().unwrap(),
            directly_connected: true,
            subnet: Some("10.0.0.0/24".parse().unwrap()),
            confederation_peer: false,
            families: crate::families::Families::new(vec![v4u()]),
            enabled: true,
        })
    }

    fn server_config(
        peers: Vec<Arc<PeerConfig>>,
        damping_enabled: bool,
        aggregates: Vec<AggregateConfig>,
    ) -> ServerConfig {
        ServerConfig {
            router_id: "10.0.0.1".parse().unwrap(),
            default_as: 65001,
            local_address: "10.0.0.1".parse().unwrap(),
            cluster_id: None,
            default_local_pref: 100,
            confederation_id: None,
            damping: DampingConfig {
                enabled: damping_enabled,
                ..DampingConfig::default()
            },
            aggregates,
            peers,
        }
    }

    type SinkMap = Arc<StdMutex<StdHashMap<(PeerId, Family), RecordingSink>>>;

    fn recording_factory(map: SinkMap) -> SinkFactory {
        Box::new(move |peer, family| {
            let sink = RecordingSink::new();
            map.lock().unwrap().insert((peer, family), sink.clone());
            Box::new(sink)
        })
    }

    fn events_of(map: &SinkMap, peer: PeerId) -> Vec<SinkEvent> {
        map.lock()
            .unwrap()
            .get(&(peer, v4u()))
            .map(|sink| sink.events())
            .unwrap_or_default()
    }

    fn adds_of(map: &SinkMap, peer: PeerId) -> Vec<String> {
        events_of(map, peer)
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Add(net) | SinkEvent::Replace(net) => Some(net),
                _ => None,
            })
            .collect()
    }

    fn deletes_of(map: &SinkMap, peer: PeerId) -> Vec<String> {
        events_of(map, peer)
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Delete(net) => Some(net),
                _ => None,
            })
            .collect()
    }

    fn announce_update(nets: &[&str], next_hop: &str, as_path: Vec<u32>) -> Update {
        Update {
            withdrawn_routes: vec![],
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(as_path)],
                }),
                PathAttribute::NEXT_HOP(next_hop.parse().unwrap()),
            ],
            announced_routes: nets
                .iter()
                .map(|net| {
                    bgp_rs::NLRIEncoding::IP(crate::utils::prefix_from_str(net).unwrap())
                })
                .collect(),
        }
    }

    fn withdraw_update(nets: &[&str]) -> Update {
        Update {
            withdrawn_routes: nets
                .iter()
                .map(|net| {
                    bgp_rs::NLRIEncoding::IP(crate::utils::prefix_from_str(net).unwrap())
                })
                .collect(),
            attributes: vec![],
            announced_routes: vec![],
        }
    }

    const A: &str = "10.0.0.10";
    const B: &str = "10.0.0.20";
    const C: &str = "10.0.0.30";

    fn addr(ip: &str) -> IpAddr {
        ip.parse().unwrap()
    }

    /// Shared-handle builder sink so tests can inspect produced UPDATEs
    #[derive(Clone)]
    struct SharedBuilder(Arc<StdMutex<UpdateBuilder>>);

    impl SharedBuilder {
        fn new(family: Family) -> Self {
            SharedBuilder(Arc::new(StdMutex::new(UpdateBuilder::new(family))))
        }

        fn take_updates(&self) -> Vec<Update> {
            self.0.lock().unwrap().take_updates()
        }
    }

    impl crate::tables::UpdateSink for SharedBuilder {
        fn start_packet(&mut self, ibgp: bool) {
            self.0.lock().unwrap().start_packet(ibgp);
        }
        fn add_route(&mut self, msg: &crate::routes::RouteMessage, family: Family) {
            self.0.lock().unwrap().add_route(msg, family);
        }
        fn replace_route(
            &mut self,
            old: &crate::routes::RouteMessage,
            new: &crate::routes::RouteMessage,
            family: Family,
        ) {
            self.0.lock().unwrap().replace_route(old, new, family);
        }
        fn delete_route(&mut self, msg: &crate::routes::RouteMessage, family: Family) {
            self.0.lock().unwrap().delete_route(msg, family);
        }
        fn push_packet(&mut self) -> crate::tables::SinkStatus {
            self.0.lock().unwrap().push_packet()
        }
    }

    type BuilderMap = Arc<StdMutex<StdHashMap<(PeerId, Family), SharedBuilder>>>;

    fn builder_factory(map: BuilderMap) -> SinkFactory {
        Box::new(move |peer, family| {
            let sink = SharedBuilder::new(family);
            map.lock().unwrap().insert((peer, family), sink.clone());
            Box::new(sink)
        })
    }

    fn as_path_of(update: &Update) -> Vec<u32> {
        update
            .attributes
            .iter()
            .find_map(|attr| match attr {
                PathAttribute::AS_PATH(path) => Some(
                    path.segments
                        .iter()
                        .flat_map(|segment| match segment {
                            Segment::AS_SEQUENCE(asns) | Segment::AS_SET(asns) => {
                                asns.iter().copied()
                            }
                        })
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_single_add_single_peer_ebgp() {
        let builders: BuilderMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, builder_factory(builders.clone()), now);

        speaker.nexthop_changed(addr(A), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);

        // Peer B sees the route with our AS prepended and the original
        // (third-party, on-subnet) next-hop preserved
        let b_updates = builders.lock().unwrap()[&(17, v4u())].clone().take_updates();
        assert_eq!(b_updates.len(), 1);
        assert_eq!(b_updates[0].announced_routes.len(), 1);
        assert_eq!(as_path_of(&b_updates[0]), vec![65001, 65010]);
        assert!(b_updates[0]
            .attributes
            .iter()
            .any(|attr| matches!(attr, PathAttribute::NEXT_HOP(nh) if *nh == addr(A))));
        // LOCAL_PREF stripped on EBGP egress
        assert!(!b_updates[0]
            .attributes
            .iter()
            .any(|attr| matches!(attr, PathAttribute::LOCAL_PREF(_))));

        // The local RIB branch gets the winner without EBGP egress policy
        let rib_updates = builders.lock().unwrap()[&(LOCAL_RIB_PEER, v4u())]
            .clone()
            .take_updates();
        assert_eq!(rib_updates.len(), 1);
        assert_eq!(as_path_of(&rib_updates[0]), vec![65010]);

        // Never back to the origin peer
        let a_updates = builders.lock().unwrap()[&(16, v4u())].clone().take_updates();
        assert!(a_updates.is_empty());
    }

    #[test]
    fn test_loser_on_arrival_stays_quiet() {
        let builders: BuilderMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, builder_factory(builders.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.nexthop_changed(addr(B), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);
        let rib = builders.lock().unwrap()[&(LOCAL_RIB_PEER, v4u())].clone();
        let before = rib.take_updates().len();
        assert_eq!(before, 1);

        // Longer AS_PATH from B loses on arrival: no downstream traffic
        speaker
            .process_update(
                addr(B),
                &announce_update(&["192.0.2.0/24"], B, vec![65020, 65030]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);
        assert!(rib.take_updates().is_empty());

        // Decision kept A's route as the single winner
        let token = speaker.create_route_reader(v4u()).unwrap();
        let mut winners = 0;
        while let Some(entry) = speaker.read_next(token) {
            if entry.winner {
                winners += 1;
                assert_eq!(entry.peer, 16);
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_dump_feeds_new_peer_exactly_once() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
                peer_config(C, 65030, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.nexthop_changed(addr(B), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker
            .process_update(
                addr(B),
                &announce_update(&["192.0.2.0/24"], B, vec![65020, 65030]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);

        // C comes up; B withdraws while the dump is still pending
        speaker.peering_came_up(addr(C), now).unwrap();
        speaker
            .process_update(addr(B), &withdraw_update(&["192.0.2.0/24"]), now)
            .unwrap();
        speaker.run_until_idle(now);

        // C received A's (winning) route exactly once, and no delete
        // from B's withdrawal
        let adds = adds_of(&sinks, 18);
        assert_eq!(adds, vec!["192.0.2.0/24"]);
        assert!(deletes_of(&sinks, 18).is_empty());

        // The dump finished and unplumbed itself
        for (family, stats) in speaker.pipeline_stats() {
            if family == v4u() {
                assert!(stats.branches.iter().all(|branch| !branch.dumping));
            }
        }
    }

    #[test]
    fn test_flap_damping_cutoff_and_release_on_delete() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(vec![peer_config(A, 65010, PeerType::Ebgp)], true, vec![]);
        let t0 = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), t0);
        speaker.nexthop_changed(addr(A), 10, t0);
        speaker.peering_came_up(addr(A), t0).unwrap();
        speaker.run_until_idle(t0);

        let flap = |speaker: &mut Speaker, announce: bool, at: Instant| {
            if announce {
                speaker
                    .process_update(
                        addr(A),
                        &announce_update(&["198.51.100.0/24"], A, vec![65010]),
                        at,
                    )
                    .unwrap();
            } else {
                speaker
                    .process_update(addr(A), &withdraw_update(&["198.51.100.0/24"]), at)
                    .unwrap();
            }
            speaker.run_until_idle(at);
        };

        flap(&mut speaker, true, t0);
        flap(&mut speaker, false, t0 + Duration::from_secs(1));
        // Third event crosses the cutoff: suppressed from here on
        flap(&mut speaker, true, t0 + Duration::from_secs(2));

        let events = events_of(&sinks, LOCAL_RIB_PEER);
        let data_events: Vec<&SinkEvent> = events
            .iter()
            .filter(|event| !matches!(event, SinkEvent::Start | SinkEvent::PushPacket))
            .collect();
        assert_eq!(data_events.len(), 2); // one add, one delete
        assert!(matches!(data_events[0], SinkEvent::Add(_)));
        assert!(matches!(data_events[1], SinkEvent::Delete(_)));

        // A delete while damped clears the state without propagating
        flap(&mut speaker, false, t0 + Duration::from_secs(3));
        let after_delete = events_of(&sinks, LOCAL_RIB_PEER).len();
        assert_eq!(after_delete, events.len());

        // The reuse timer finds nothing to release
        speaker.run_until_idle(t0 + Duration::from_secs(4000));
        assert_eq!(events_of(&sinks, LOCAL_RIB_PEER).len(), after_delete);
    }

    #[test]
    fn test_aggregate_suppression_brief_mode() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
                peer_config(C, 65001, PeerType::Ibgp),
            ],
            false,
            vec![AggregateConfig {
                prefix: "10.0.0.0/16".parse().unwrap(),
                brief_mode: true,
                enabled: true,
            }],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.peering_came_up(addr(C), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["10.0.1.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker
            .process_update(
                addr(A),
                &announce_update(&["10.0.2.0/24"], A, vec![65020, 65030]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);

        // EBGP branch: the aggregate only, never the contributors
        let b_adds = adds_of(&sinks, 17);
        assert!(!b_adds.is_empty());
        assert!(b_adds.iter().all(|net| net == "10.0.0.0/16"));

        // IBGP branch and local RIB: the real contributors, no aggregate
        for branch in [18, LOCAL_RIB_PEER] {
            let adds = adds_of(&sinks, branch);
            assert!(adds.contains(&"10.0.1.0/24".to_string()));
            assert!(adds.contains(&"10.0.2.0/24".to_string()));
            assert!(!adds.contains(&"10.0.0.0/16".to_string()));
        }
    }

    #[test]
    fn test_fanout_ordering_with_slow_branch() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
                peer_config(C, 65030, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.peering_came_up(addr(C), now).unwrap();
        speaker.run_until_idle(now);

        // B's send layer wedges after its first packet
        sinks.lock().unwrap()[&(17, v4u())].set_busy_after(1);

        let prefixes = [
            "10.1.0.0/16",
            "10.2.0.0/16",
            "10.3.0.0/16",
            "10.4.0.0/16",
            "10.5.0.0/16",
        ];
        for prefix in prefixes {
            speaker
                .process_update(addr(A), &announce_update(&[prefix], A, vec![65010]), now)
                .unwrap();
        }
        speaker.run_until_idle(now);

        // The fast branch saw everything in order
        assert_eq!(adds_of(&sinks, 18), prefixes.to_vec());
        // The slow branch is behind but hasn't lost its place
        assert!(adds_of(&sinks, 17).len() < prefixes.len());

        // Drain B as its send layer frees up
        for _ in 0..10 {
            speaker.output_no_longer_busy(addr(B), now).unwrap();
            speaker.run_until_idle(now);
        }
        assert_eq!(adds_of(&sinks, 17), prefixes.to_vec());
    }

    #[test]
    fn test_insert_then_delete_round_trip() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker
            .process_update(addr(A), &withdraw_update(&["192.0.2.0/24"]), now)
            .unwrap();
        speaker.run_until_idle(now);

        // Every branch is back to its pre-insertion state
        for branch in [17, LOCAL_RIB_PEER] {
            assert_eq!(adds_of(&sinks, branch), vec!["192.0.2.0/24"]);
            assert_eq!(deletes_of(&sinks, branch), vec!["192.0.2.0/24"]);
        }
        for (family, stats) in speaker.pipeline_stats() {
            if family == v4u() {
                assert_eq!(stats.winners, 0);
                assert_eq!(stats.queue_len, 0);
            }
        }
    }

    #[test]
    fn test_peer_bounce_without_updates_is_invisible() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_went_down(addr(A), now).unwrap();
        speaker.run_until_idle(now);

        assert!(events_of(&sinks, LOCAL_RIB_PEER).is_empty());
        assert!(events_of(&sinks, 17).is_empty());

        // Down sequence fully drained; final removal is legal
        speaker.delete_peering(addr(A)).unwrap();
    }

    #[test]
    fn test_peer_down_withdraws_contribution() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(
            vec![
                peer_config(A, 65010, PeerType::Ebgp),
                peer_config(B, 65020, PeerType::Ebgp),
            ],
            false,
            vec![],
        );
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.nexthop_changed(addr(B), 5, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.peering_came_up(addr(B), now).unwrap();
        speaker.run_until_idle(now);

        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker
            .process_update(
                addr(B),
                &announce_update(&["192.0.2.0/24"], B, vec![65020, 65030]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);

        // A goes down; its winner is withdrawn and B's candidate takes
        // over via the background deletion
        speaker.peering_went_down(addr(A), now).unwrap();
        speaker.run_until_idle(now);

        let rib_events = events_of(&sinks, LOCAL_RIB_PEER);
        let last_data = rib_events
            .iter()
            .rev()
            .find(|event| !matches!(event, SinkEvent::Start | SinkEvent::PushPacket))
            .unwrap();
        assert!(matches!(last_data, SinkEvent::Replace(_) | SinkEvent::Add(_)));

        let token = speaker.create_route_reader(v4u()).unwrap();
        let mut winner_origins = vec![];
        while let Some(entry) = speaker.read_next(token) {
            if entry.winner {
                winner_origins.push(entry.peer);
            }
        }
        assert_eq!(winner_origins, vec![17]);
    }

    #[test]
    fn test_originated_route_reaches_peers_and_local_rib() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(vec![peer_config(A, 65010, PeerType::Ebgp)], false, vec![]);
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr("10.0.0.1"), 0, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.run_until_idle(now);

        let attrs = AttributeList::new(vec![
            Attribute::Origin(crate::attributes::PathOrigin::Igp),
            Attribute::AsPath(crate::attributes::AsPath::empty()),
            Attribute::NextHop(addr("10.0.0.1")),
        ]);
        speaker
            .originate_route(v4u(), "203.0.113.0/24".parse().unwrap(), attrs, now)
            .unwrap();
        speaker.run_until_idle(now);

        assert_eq!(adds_of(&sinks, 16), vec!["203.0.113.0/24"]);
        assert_eq!(adds_of(&sinks, LOCAL_RIB_PEER), vec!["203.0.113.0/24"]);

        speaker
            .withdraw_originated_route(v4u(), "203.0.113.0/24".parse().unwrap(), now)
            .unwrap();
        speaker.run_until_idle(now);
        assert_eq!(deletes_of(&sinks, 16), vec!["203.0.113.0/24"]);
    }

    #[test]
    fn test_route_reader_walks_stable_order() {
        let sinks: SinkMap = Arc::new(StdMutex::new(StdHashMap::new()));
        let config = server_config(vec![peer_config(A, 65010, PeerType::Ebgp)], false, vec![]);
        let now = Instant::now();
        let mut speaker = Speaker::new(&config, recording_factory(sinks.clone()), now);
        speaker.nexthop_changed(addr(A), 10, now);
        speaker.peering_came_up(addr(A), now).unwrap();
        speaker.run_until_idle(now);
        speaker
            .process_update(
                addr(A),
                &announce_update(&["192.0.2.0/24", "10.9.0.0/16"], A, vec![65010]),
                now,
            )
            .unwrap();
        speaker.run_until_idle(now);

        let token = speaker.create_route_reader(v4u()).unwrap();
        let first = speaker.read_next(token).unwrap();
        let second = speaker.read_next(token).unwrap();
        assert!(first.net < second.net);
        assert!(first.winner && second.winner);
        assert!(speaker.read_next(token).is_none());
        // Token is gone after end-of-table
        assert!(speaker.read_next(token).is_none());
    }
}
