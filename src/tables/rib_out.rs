use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bgp_rs::{MPReachNLRI, MPUnreachNLRI, NLRIEncoding, PathAttribute, Update, AFI, SAFI};
use log::{trace, warn};

use super::{RouteTable, TableOutput, TableRole};
use crate::attributes::{wire_attributes, AttributeList};
use crate::families::Family;
use crate::peer::PeerId;
use crate::routes::{RouteMessage, RouteOp, RouteOutcome};
use crate::utils::prefix_from_network;

/// Rough ceiling on the NLRI payload packed into one UPDATE; the codec
/// owns the exact wire limit, this keeps builders comfortably under it
const UPDATE_SIZE_THRESHOLD: usize = 3800;

/// What the send layer did with a finalised packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    NotBusy,
    Busy,
    Error,
}

/// The peer's send code, consuming an ordered sequence of UPDATE
/// builder calls.
pub trait UpdateSink: Send {
    fn start_packet(&mut self, ibgp: bool);
    fn add_route(&mut self, msg: &RouteMessage, family: Family);
    fn replace_route(&mut self, old: &RouteMessage, new: &RouteMessage, family: Family);
    fn delete_route(&mut self, msg: &RouteMessage, family: Family);
    fn push_packet(&mut self) -> SinkStatus;
}

/// Coalesces a branch's outbound operations into UPDATE-sized batches
/// handed to the peer's send code.
///
/// Routes sharing an attribute list ride in the same packet until the
/// size threshold; a push finalises whatever is open. When the sink
/// reports busy the branch stops pulling from the fanout until the
/// send queues drain.
pub struct RibOutTable {
    name: String,
    peer: PeerId,
    family: Family,
    ibgp: bool,
    sink: Box<dyn UpdateSink>,
    busy: bool,
    packet_open: bool,
    /// Attribute digest of the announcements in the open packet
    open_digest: Option<u64>,
    open_size: usize,
    errors: usize,
}

impl RibOutTable {
    pub fn new(peer: PeerId, family: Family, ibgp: bool, sink: Box<dyn UpdateSink>) -> Self {
        RibOutTable {
            name: format!("RibOut-{}", peer),
            peer,
            family,
            ibgp,
            sink,
            busy: false,
            packet_open: false,
            open_digest: None,
            open_size: 0,
            errors: 0,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Is this an IBGP-side branch (peer type or the local RIB)?
    pub fn ibgp(&self) -> bool {
        self.ibgp
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// The send layer drained; the branch may pull again
    pub fn output_no_longer_busy(&mut self) {
        self.busy = false;
    }

    fn ensure_packet(&mut self, digest: Option<u64>) {
        if self.packet_open {
            let mismatch = match (digest, self.open_digest) {
                (Some(new), Some(open)) => new != open,
                // Withdraws share any open packet
                (None, _) => false,
                (Some(_), None) => false,
            };
            if mismatch || self.open_size >= UPDATE_SIZE_THRESHOLD {
                self.finalise();
            }
        }
        if !self.packet_open {
            self.sink.start_packet(self.ibgp);
            self.packet_open = true;
            self.open_size = 0;
            self.open_digest = None;
        }
        if digest.is_some() {
            self.open_digest = digest;
        }
    }

    fn finalise(&mut self) {
        if !self.packet_open {
            return;
        }
        self.packet_open = false;
        self.open_digest = None;
        self.open_size = 0;
        match self.sink.push_packet() {
            SinkStatus::NotBusy => (),
            SinkStatus::Busy => {
                trace!("{}: send layer busy", self.name);
                self.busy = true;
            }
            SinkStatus::Error => {
                // Session trouble is the FSM's problem, not the
                // pipeline's; count it and carry on
                warn!("{}: send layer error", self.name);
                self.errors += 1;
            }
        }
    }

    fn size_of(msg: &RouteMessage) -> usize {
        // prefix byte + masked address bytes
        1 + (usize::from(msg.net().prefix()) + 7) / 8
    }
}

impl RouteTable for RibOutTable {
    fn role(&self) -> TableRole {
        TableRole::RibOut
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        assert!(
            msg.attributes().has_as_path(),
            "{}: route for {} without AS_PATH",
            self.name,
            msg.net()
        );
        self.ensure_packet(Some(msg.attributes().digest()));
        self.open_size += Self::size_of(&msg);
        self.sink.add_route(&msg, self.family);
        TableOutput::outcome(RouteOutcome::Used)
    }

    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, _now: Instant) -> TableOutput {
        self.ensure_packet(Some(new.attributes().digest()));
        self.open_size += Self::size_of(&new);
        self.sink.replace_route(&old, &new, self.family);
        TableOutput::outcome(RouteOutcome::Used)
    }

    fn delete_route(&mut self, msg: RouteMessage, _now: Instant) -> TableOutput {
        self.ensure_packet(None);
        self.open_size += Self::size_of(&msg);
        self.sink.delete_route(&msg, self.family);
        TableOutput::outcome(RouteOutcome::Used)
    }

    fn push(&mut self) -> TableOutput {
        self.finalise();
        TableOutput::outcome(RouteOutcome::Used)
    }
}

impl fmt::Display for RibOutTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<RibOut peer={} family={} busy={}>",
            self.peer, self.family, self.busy
        )
    }
}

/// The default sink: assembles real UPDATE structures for the codec.
/// IPv4 unicast uses the classic NLRI/withdrawn lists; everything else
/// rides MP_REACH/MP_UNREACH.
pub struct UpdateBuilder {
    family: Family,
    attributes: Option<Arc<AttributeList>>,
    announced: Vec<RouteMessage>,
    withdrawn: Vec<RouteMessage>,
    finished: VecDeque<Update>,
}

impl UpdateBuilder {
    pub fn new(family: Family) -> Self {
        UpdateBuilder {
            family,
            attributes: None,
            announced: vec![],
            withdrawn: vec![],
            finished: VecDeque::new(),
        }
    }

    /// Finalised packets ready for the wire, oldest first
    pub fn take_updates(&mut self) -> Vec<Update> {
        self.finished.drain(..).collect()
    }

    fn classic(&self) -> bool {
        self.family == Family::new(AFI::IPV4, SAFI::Unicast)
    }
}

impl UpdateSink for UpdateBuilder {
    fn start_packet(&mut self, _ibgp: bool) {
        self.attributes = None;
        self.announced.clear();
        self.withdrawn.clear();
    }

    fn add_route(&mut self, msg: &RouteMessage, _family: Family) {
        self.attributes = Some(msg.attributes().clone());
        self.announced.push(msg.clone());
    }

    fn replace_route(&mut self, _old: &RouteMessage, new: &RouteMessage, family: Family) {
        // Announcing the new version implicitly replaces the old one
        self.add_route(new, family);
    }

    fn delete_route(&mut self, msg: &RouteMessage, _family: Family) {
        self.withdrawn.push(msg.clone());
    }

    fn push_packet(&mut self) -> SinkStatus {
        if self.announced.is_empty() && self.withdrawn.is_empty() {
            return SinkStatus::NotBusy;
        }
        let mut update = Update {
            withdrawn_routes: vec![],
            attributes: vec![],
            announced_routes: vec![],
        };
        let nlri = |msg: &RouteMessage| NLRIEncoding::IP(prefix_from_network(&msg.net()));
        if self.classic() {
            update.withdrawn_routes = self.withdrawn.iter().map(nlri).collect();
            update.announced_routes = self.announced.iter().map(nlri).collect();
            if let Some(attrs) = &self.attributes {
                update.attributes = wire_attributes(attrs, self.family);
            }
        } else {
            if let Some(attrs) = &self.attributes {
                update.attributes = wire_attributes(attrs, self.family);
                let next_hop = attrs
                    .next_hop()
                    .map(|nh| match nh {
                        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
                    })
                    .unwrap_or_default();
                update.attributes.push(PathAttribute::MP_REACH_NLRI(MPReachNLRI {
                    afi: self.family.afi,
                    safi: self.family.safi,
                    next_hop,
                    announced_routes: self.announced.iter().map(nlri).collect(),
                }));
            }
            if !self.withdrawn.is_empty() {
                update
                    .attributes
                    .push(PathAttribute::MP_UNREACH_NLRI(MPUnreachNLRI {
                        afi: self.family.afi,
                        safi: self.family.safi,
                        withdrawn_routes: self.withdrawn.iter().map(nlri).collect(),
                    }));
            }
        }
        self.attributes = None;
        self.announced.clear();
        self.withdrawn.clear();
        self.finished.push_back(update);
        SinkStatus::NotBusy
    }
}

#[cfg(test)]
pub(crate) mod test_sink {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex};

    /// What a recording sink saw, in order
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum SinkEvent {
        Start,
        Add(String),
        Replace(String),
        Delete(String),
        PushPacket,
    }

    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: StdArc<Mutex<Vec<SinkEvent>>>,
        pub busy_after: StdArc<Mutex<Option<usize>>>,
        packets: usize,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Report Busy once the given number of packets has been pushed
        pub fn set_busy_after(&self, packets: usize) {
            *self.busy_after.lock().unwrap() = Some(packets);
        }
    }

    impl UpdateSink for RecordingSink {
        fn start_packet(&mut self, _ibgp: bool) {
            self.events.lock().unwrap().push(SinkEvent::Start);
        }

        fn add_route(&mut self, msg: &RouteMessage, _family: Family) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Add(msg.net().to_string()));
        }

        fn replace_route(&mut self, _old: &RouteMessage, new: &RouteMessage, _family: Family) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Replace(new.net().to_string()));
        }

        fn delete_route(&mut self, msg: &RouteMessage, _family: Family) {
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Delete(msg.net().to_string()));
        }

        fn push_packet(&mut self) -> SinkStatus {
            self.events.lock().unwrap().push(SinkEvent::PushPacket);
            self.packets += 1;
            match *self.busy_after.lock().unwrap() {
                Some(limit) if self.packets >= limit => SinkStatus::Busy,
                _ => SinkStatus::NotBusy,
            }
        }
    }
}
