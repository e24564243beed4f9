use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use log::{debug, trace};

use super::{ReuseRequest, RouteTable, TableOutput, TableRole};
use crate::config::DampingConfig;
use crate::peer::{Genid, PeerId};
use crate::routes::{RouteMessage, RouteOp, RouteOutcome, SubnetRoute};

/// Figure-of-merit penalty charged per route event (RFC 2439)
pub const PENALTY: f64 = 1000.0;

/// Per-prefix damping history
#[derive(Debug)]
struct DampState {
    last_event: Instant,
    merit: f64,
    damped: bool,
}

/// Route parked while its prefix is damped, re-injected downstream when
/// the reuse timer fires
#[derive(Debug)]
struct ParkedRoute {
    route: Arc<SubnetRoute>,
    genid: Genid,
}

/// RFC 2439 route-flap damping on one EBGP peer's ingress.
///
/// Each add/replace decays and bumps the figure of merit; past the
/// cutoff the prefix is suppressed until the merit decays back to the
/// reuse threshold. A delete releases damping immediately without
/// propagating, because downstream never saw the parked route.
pub struct DampingTable {
    name: String,
    peer: PeerId,
    config: DampingConfig,
    entries: BTreeMap<IpNetwork, DampState>,
    parked: BTreeMap<IpNetwork, ParkedRoute>,
}

impl DampingTable {
    pub fn new(peer: PeerId, config: DampingConfig) -> Self {
        DampingTable {
            name: format!("Damping-{}", peer),
            peer,
            config,
            entries: BTreeMap::new(),
            parked: BTreeMap::new(),
        }
    }

    /// Disabling stops new routes entering damping; already-damped
    /// prefixes keep draining through their reuse timers.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn is_damped(&self, net: &IpNetwork) -> bool {
        self.entries
            .get(net)
            .map(|state| state.damped)
            .unwrap_or(false)
    }

    pub fn damped_count(&self) -> usize {
        self.entries.values().filter(|state| state.damped).count()
    }

    /// Current figure of merit per prefix (management introspection)
    pub fn merit_of(&self, net: &IpNetwork, now: Instant) -> Option<(u32, bool)> {
        self.entries
            .get(net)
            .map(|state| (self.decayed(state, now) as u32, state.damped))
    }

    /// All tracked prefixes with their decayed merit and damped flag
    pub fn entries(&self, now: Instant) -> Vec<(IpNetwork, u32, bool)> {
        self.entries
            .iter()
            .map(|(net, state)| (*net, self.decayed(state, now) as u32, state.damped))
            .collect()
    }

    fn half_life(&self, damped: bool) -> Duration {
        if damped {
            self.config.half_life_unreachable
        } else {
            self.config.half_life_reachable
        }
    }

    fn decayed(&self, state: &DampState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_event).as_secs_f64();
        let half_life = self.half_life(state.damped).as_secs_f64();
        if half_life <= 0.0 {
            return state.merit;
        }
        state.merit * 0.5_f64.powf(elapsed / half_life)
    }

    /// Seconds until the merit decays to the reuse threshold
    fn reuse_delay(&self, merit: f64) -> Duration {
        let reuse = f64::from(self.config.reuse_threshold.max(1));
        let half_life = self.half_life(true).as_secs_f64();
        let delay = half_life * (merit / reuse).log2();
        let delay = Duration::from_secs_f64(delay.max(0.0));
        delay.min(self.config.max_suppress)
    }

    /// Decay + penalty; true when the prefix just crossed the cutoff
    fn update_merit(&mut self, net: IpNetwork, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        let cutoff = f64::from(self.config.cutoff_threshold);
        let half_life_ok = self.config.half_life_reachable.as_secs_f64();
        let half_life_ng = self.config.half_life_unreachable.as_secs_f64();
        let state = self.entries.get_mut(&net).expect("caller checked entry");
        let elapsed = now.saturating_duration_since(state.last_event).as_secs_f64();
        let half_life = if state.damped {
            half_life_ng
        } else {
            half_life_ok
        };
        state.merit = state.merit * 0.5_f64.powf(elapsed / half_life) + PENALTY;
        state.last_event = now;
        let (merit, crossed) = if !state.damped && state.merit >= cutoff {
            state.damped = true;
            (state.merit, true)
        } else {
            (state.merit, false)
        };
        trace!("{}: merit for {} now {:.0}", self.name, net, merit);
        crossed
    }

    /// The reuse timer fired: re-inject the parked route if the prefix
    /// is still damped.
    pub fn reuse_timer_fired(&mut self, net: IpNetwork, now: Instant) -> Vec<RouteOp> {
        let half_life = self.config.half_life_unreachable.as_secs_f64();
        let state = match self.entries.get_mut(&net) {
            Some(state) => state,
            None => return vec![],
        };
        if !state.damped {
            // Released earlier (deleted while damped); nothing to re-inject
            return vec![];
        }
        let elapsed = now.saturating_duration_since(state.last_event).as_secs_f64();
        state.damped = false;
        state.merit *= 0.5_f64.powf(elapsed / half_life);
        state.last_event = now;
        match self.parked.remove(&net) {
            Some(parked) => {
                debug!("{}: releasing damped route {}", self.name, net);
                vec![
                    RouteOp::Add(RouteMessage::new(parked.route, self.peer, parked.genid)),
                    RouteOp::Push,
                ]
            }
            None => vec![],
        }
    }
}

impl RouteTable for DampingTable {
    fn role(&self) -> TableRole {
        TableRole::Damping
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn add_route(&mut self, msg: RouteMessage, now: Instant) -> TableOutput {
        if !self.entries.contains_key(&msg.net()) {
            // First event for this prefix starts its history and passes
            if self.config.enabled {
                self.entries.insert(
                    msg.net(),
                    DampState {
                        last_event: now,
                        merit: PENALTY,
                        damped: false,
                    },
                );
            }
            return TableOutput::used(RouteOp::Add(msg));
        }

        let crossed_cutoff = self.update_merit(msg.net(), now);
        let state = self.entries.get(&msg.net()).expect("entry exists");
        if crossed_cutoff {
            debug!("{}: damping {}", self.name, msg.net());
            let delay = self.reuse_delay(state.merit);
            self.parked.insert(
                msg.net(),
                ParkedRoute {
                    route: msg.route.clone(),
                    genid: msg.genid,
                },
            );
            return TableOutput {
                outcome: Some(RouteOutcome::Unused),
                ops: vec![],
                timers: vec![ReuseRequest {
                    net: msg.net(),
                    delay,
                }],
            };
        }
        if state.damped {
            // Still suppressed: remember the latest route, propagate nothing
            self.parked.insert(
                msg.net(),
                ParkedRoute {
                    route: msg.route.clone(),
                    genid: msg.genid,
                },
            );
            return TableOutput::outcome(RouteOutcome::Unused);
        }
        TableOutput::used(RouteOp::Add(msg))
    }

    fn replace_route(&mut self, old: RouteMessage, new: RouteMessage, now: Instant) -> TableOutput {
        let net = old.net();
        assert_eq!(net, new.net(), "{}: replace across prefixes", self.name);
        if !self.entries.contains_key(&net) {
            // Damping was enabled after this route first passed through
            return TableOutput::used(RouteOp::Replace(old, new));
        }

        let already_damped = self.is_damped(&net);
        if already_damped {
            if self.config.enabled {
                // Still an event: keep the merit decaying-and-bumping,
                // keep suppressing; the running reuse timer will release
                // whatever route is parked last
                self.update_merit(net, now);
                self.parked.insert(
                    net,
                    ParkedRoute {
                        route: new.route.clone(),
                        genid: new.genid,
                    },
                );
                return TableOutput::outcome(RouteOutcome::Unused);
            }
            // Damping since disabled: release and forward as a plain add
            let state = self.entries.get_mut(&net).expect("entry exists");
            state.damped = false;
            self.parked.remove(&net);
            return TableOutput::used(RouteOp::Add(new));
        }

        let crossed_cutoff = self.update_merit(net, now);
        if crossed_cutoff {
            debug!("{}: damping {} on replace", self.name, net);
            let state = self.entries.get(&net).expect("entry exists");
            let delay = self.reuse_delay(state.merit);
            self.parked.insert(
                net,
                ParkedRoute {
                    route: new.route.clone(),
                    genid: new.genid,
                },
            );
            // Downstream saw the old route; take it away while damped
            return TableOutput {
                outcome: Some(RouteOutcome::Unused),
                ops: vec![RouteOp::Delete(old)],
                timers: vec![ReuseRequest { net, delay }],
            };
        }
        TableOutput::used(RouteOp::Replace(old, new))
    }

    fn delete_route(&mut self, msg: RouteMessage, now: Instant) -> TableOutput {
        let net = msg.net();
        if !self.entries.contains_key(&net) {
            return TableOutput::used(RouteOp::Delete(msg));
        }
        if self.is_damped(&net) {
            // Downstream never saw the parked route, so nothing to
            // propagate; the timer finds the state released and idles
            debug!("{}: delete releases damped {}", self.name, net);
            let state = self.entries.get_mut(&net).expect("checked above");
            state.damped = false;
            self.parked.remove(&net);
            return TableOutput::outcome(RouteOutcome::Used);
        }
        // A withdrawal is a route event like any other
        let crossed_cutoff = self.update_merit(net, now);
        if crossed_cutoff {
            // Suppressed with nothing parked; a re-advertisement while
            // damped parks there, otherwise the timer just clears state
            debug!("{}: damping {} on delete", self.name, net);
            let state = self.entries.get(&net).expect("checked above");
            let delay = self.reuse_delay(state.merit);
            return TableOutput {
                outcome: Some(RouteOutcome::Used),
                ops: vec![RouteOp::Delete(msg)],
                timers: vec![ReuseRequest { net, delay }],
            };
        }
        TableOutput::used(RouteOp::Delete(msg))
    }

    fn peering_went_down(&mut self, peer: PeerId, _genid: Genid) -> Vec<RouteOp> {
        assert_eq!(peer, self.peer, "{}: lifecycle event for wrong peer", self.name);
        vec![]
    }
}

impl fmt::Display for DampingTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<DampingTable peer={} entries={} damped={}>",
            self.peer,
            self.entries.len(),
            self.damped_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AsPath, Attribute, AttributeList, PathOrigin};

    fn config() -> DampingConfig {
        DampingConfig {
            enabled: true,
            half_life_reachable: Duration::from_secs(900),
            half_life_unreachable: Duration::from_secs(900),
            reuse_threshold: 750,
            cutoff_threshold: 2000,
            max_suppress: Duration::from_secs(3600),
        }
    }

    fn msg(net: &str) -> RouteMessage {
        let attrs = Arc::new(AttributeList::new(vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
        ]));
        let route = Arc::new(SubnetRoute::new(net.parse().unwrap(), attrs, 16));
        RouteMessage::new(route, 16, 1)
    }

    #[test]
    fn test_flap_crosses_cutoff_on_third_event() {
        let mut table = DampingTable::new(16, config());
        let start = Instant::now();
        // advertise, withdraw, advertise at one-second spacing
        let out = table.add_route(msg("198.51.100.0/24"), start);
        assert!(matches!(out.ops[0], RouteOp::Add(_)));
        let out = table.delete_route(msg("198.51.100.0/24"), start + Duration::from_secs(1));
        assert!(matches!(out.ops[0], RouteOp::Delete(_)));
        let out = table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(2));
        assert_eq!(out.outcome, Some(RouteOutcome::Unused));
        assert!(out.ops.is_empty());
        assert_eq!(out.timers.len(), 1);
        assert!(table.is_damped(&"198.51.100.0/24".parse().unwrap()));

        // Further events stay suppressed
        let out = table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(3));
        assert_eq!(out.outcome, Some(RouteOutcome::Unused));
        assert!(out.ops.is_empty());
    }

    #[test]
    fn test_delete_clears_damping_without_propagating() {
        let mut table = DampingTable::new(16, config());
        let start = Instant::now();
        table.add_route(msg("198.51.100.0/24"), start);
        table.delete_route(msg("198.51.100.0/24"), start + Duration::from_secs(1));
        table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(2));
        assert!(table.is_damped(&"198.51.100.0/24".parse().unwrap()));

        let out = table.delete_route(msg("198.51.100.0/24"), start + Duration::from_secs(3));
        assert!(out.ops.is_empty());
        assert!(!table.is_damped(&"198.51.100.0/24".parse().unwrap()));

        // Timer firing later finds nothing to release
        let ops = table.reuse_timer_fired(
            "198.51.100.0/24".parse().unwrap(),
            start + Duration::from_secs(100),
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn test_reuse_timer_reinjects_last_route() {
        let mut table = DampingTable::new(16, config());
        let start = Instant::now();
        table.add_route(msg("198.51.100.0/24"), start);
        table.delete_route(msg("198.51.100.0/24"), start + Duration::from_secs(1));
        table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(2));

        let ops = table.reuse_timer_fired(
            "198.51.100.0/24".parse().unwrap(),
            start + Duration::from_secs(2000),
        );
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], RouteOp::Add(_)));
        assert!(matches!(ops[1], RouteOp::Push));
        assert!(!table.is_damped(&"198.51.100.0/24".parse().unwrap()));
    }

    #[test]
    fn test_disabled_admits_no_new_damping() {
        let mut table = DampingTable::new(16, config());
        table.set_enabled(false);
        let start = Instant::now();
        for i in 0..10 {
            let out = table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(i));
            assert_eq!(out.outcome, Some(RouteOutcome::Used));
        }
        assert!(!table.is_damped(&"198.51.100.0/24".parse().unwrap()));
    }

    #[test]
    fn test_replace_that_damps_withdraws_old() {
        let mut table = DampingTable::new(16, config());
        let start = Instant::now();
        table.add_route(msg("198.51.100.0/24"), start);
        let out = table.add_route(msg("198.51.100.0/24"), start + Duration::from_secs(1));
        assert_eq!(out.outcome, Some(RouteOutcome::Used));
        let out = table.replace_route(
            msg("198.51.100.0/24"),
            msg("198.51.100.0/24"),
            start + Duration::from_secs(2),
        );
        // The merit crosses the cutoff: downstream loses the old route
        assert_eq!(out.outcome, Some(RouteOutcome::Unused));
        assert!(matches!(out.ops[0], RouteOp::Delete(_)));
        assert_eq!(out.timers.len(), 1);
    }
}
