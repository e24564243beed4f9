use std::net::IpAddr;

use bgp_rs::{ASPath, Identifier, NLRIEncoding, PathAttribute, Segment, Update, AFI, SAFI};
use ipnetwork::IpNetwork;

use super::{AsPath, AsSegment, Attribute, AttributeList, CommunityList, PathOrigin};
use crate::families::Family;
use crate::utils::{bytes_to_ipv6, network_from_prefix, transform_u32_to_bytes, ParseError};

/// A parsed UPDATE: one family's worth of reachability changes plus the
/// canonicalised attribute list they share.
#[derive(Debug)]
pub struct ParsedUpdate {
    pub family: Family,
    pub attributes: AttributeList,
    pub announced: Vec<IpNetwork>,
    pub withdrawn: Vec<IpNetwork>,
}

/// Convert a wire-facing UPDATE into internal form.
///
/// Classic NLRI/withdrawn lists imply IPv4 unicast; MP_REACH/MP_UNREACH
/// select the family and carry the next-hop for the IPv6 pipelines.
pub fn parse_update(update: &Update) -> Result<ParsedUpdate, ParseError> {
    let mut family = Family::new(AFI::IPV4, SAFI::Unicast); // BGP4 default
    let mut announced: Vec<IpNetwork> = Vec::with_capacity(update.announced_routes.len());
    let mut withdrawn: Vec<IpNetwork> = Vec::with_capacity(update.withdrawn_routes.len());
    let mut mp_next_hop: Option<IpAddr> = None;

    for nlri in &update.announced_routes {
        announced.push(network_from_nlri(nlri)?);
    }
    for nlri in &update.withdrawn_routes {
        withdrawn.push(network_from_nlri(nlri)?);
    }

    if let Some(PathAttribute::MP_REACH_NLRI(mp_reach)) = update.get(Identifier::MP_REACH_NLRI) {
        family = Family::new(mp_reach.afi, mp_reach.safi);
        mp_next_hop = match mp_reach.next_hop.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.clone_from_slice(&mp_reach.next_hop[..4]);
                Some(IpAddr::from(octets))
            }
            len if len >= 16 => Some(bytes_to_ipv6(&mp_reach.next_hop)),
            _ => {
                return Err(ParseError::new(String::from(
                    "Invalid Next-hop on MPReachNLRI",
                )))
            }
        };
        for nlri in &mp_reach.announced_routes {
            announced.push(network_from_nlri(nlri)?);
        }
    }
    if let Some(PathAttribute::MP_UNREACH_NLRI(mp_unreach)) = update.get(Identifier::MP_UNREACH_NLRI)
    {
        family = Family::new(mp_unreach.afi, mp_unreach.safi);
        for nlri in &mp_unreach.withdrawn_routes {
            withdrawn.push(network_from_nlri(nlri)?);
        }
    }

    let mut attributes = internal_attributes(&update.attributes);
    // The IPv6 pipelines carry the MP_REACH next-hop as the one true
    // NEXT_HOP; it never coexists with an IPv4 one there.
    if let Some(next_hop) = mp_next_hop {
        attributes.insert(Attribute::NextHop(next_hop));
    }

    Ok(ParsedUpdate {
        family,
        attributes,
        announced,
        withdrawn,
    })
}

fn network_from_nlri(nlri: &NLRIEncoding) -> Result<IpNetwork, ParseError> {
    match nlri {
        NLRIEncoding::IP(prefix) => network_from_prefix(prefix),
        other => Err(ParseError::new(format!(
            "Unsupported NLRI encoding: {:?}",
            other
        ))),
    }
}

fn internal_attributes(attrs: &[PathAttribute]) -> AttributeList {
    let mut converted: Vec<Attribute> = Vec::with_capacity(attrs.len());
    let mut communities = CommunityList::default();
    for attr in attrs {
        match attr {
            PathAttribute::ORIGIN(origin) => {
                converted.push(Attribute::Origin(match origin {
                    bgp_rs::Origin::IGP => PathOrigin::Igp,
                    bgp_rs::Origin::EGP => PathOrigin::Egp,
                    bgp_rs::Origin::INCOMPLETE => PathOrigin::Incomplete,
                }));
            }
            PathAttribute::AS_PATH(as_path) => {
                converted.push(Attribute::AsPath(internal_as_path(as_path)));
            }
            PathAttribute::NEXT_HOP(next_hop) => converted.push(Attribute::NextHop(*next_hop)),
            PathAttribute::MULTI_EXIT_DISC(med) => converted.push(Attribute::Med(*med)),
            PathAttribute::LOCAL_PREF(pref) => converted.push(Attribute::LocalPref(*pref)),
            PathAttribute::ATOMIC_AGGREGATOR => converted.push(Attribute::AtomicAggregate),
            PathAttribute::AGGREGATOR((asn, speaker)) => converted.push(Attribute::Aggregator {
                asn: *asn,
                speaker: *speaker,
            }),
            PathAttribute::COMMUNITY(values) => {
                for value in values {
                    communities.0.push(super::Community::STANDARD(*value));
                }
            }
            PathAttribute::EXTENDED_COMMUNITIES(values) => {
                for value in values {
                    communities.0.push(super::Community::EXTENDED(*value));
                }
            }
            PathAttribute::ORIGINATOR_ID(id) => {
                converted.push(Attribute::OriginatorId(transform_u32_to_bytes(*id).into()));
            }
            PathAttribute::CLUSTER_LIST(ids) => {
                converted.push(Attribute::ClusterList(
                    ids.iter()
                        .map(|id| transform_u32_to_bytes(*id).into())
                        .collect(),
                ));
            }
            // MP_REACH/MP_UNREACH handled by the caller; anything else is
            // a type this speaker doesn't interpret and the codec already
            // consumed its raw form
            _ => (),
        }
    }
    if !communities.is_empty() {
        converted.push(Attribute::Communities(communities));
    }
    AttributeList::new(converted)
}

fn internal_as_path(as_path: &ASPath) -> AsPath {
    AsPath {
        segments: as_path
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::AS_SEQUENCE(asns) => AsSegment::Sequence(asns.clone()),
                Segment::AS_SET(asns) => AsSegment::Set(asns.clone()),
            })
            .collect(),
    }
}

/// Build the wire-facing attribute vector for an outbound UPDATE.
///
/// NEXT_HOP rides as a classic attribute for IPv4 unicast only; other
/// families get it in the MP_REACH_NLRI the caller constructs. Confed
/// segments are flattened at this boundary; their wire encoding toward
/// confederation peers is owned by the codec collaborator.
pub fn wire_attributes(attrs: &AttributeList, family: Family) -> Vec<PathAttribute> {
    let mut wire: Vec<PathAttribute> = Vec::with_capacity(6);
    wire.push(PathAttribute::ORIGIN(match attrs.origin() {
        PathOrigin::Igp => bgp_rs::Origin::IGP,
        PathOrigin::Egp => bgp_rs::Origin::EGP,
        PathOrigin::Incomplete => bgp_rs::Origin::INCOMPLETE,
    }));
    wire.push(PathAttribute::AS_PATH(wire_as_path(&attrs.as_path())));
    if family == Family::new(AFI::IPV4, SAFI::Unicast) {
        if let Some(next_hop) = attrs.next_hop() {
            wire.push(PathAttribute::NEXT_HOP(next_hop));
        }
    }
    if let Some(med) = attrs.med() {
        wire.push(PathAttribute::MULTI_EXIT_DISC(med));
    }
    if let Some(pref) = attrs.local_pref() {
        wire.push(PathAttribute::LOCAL_PREF(pref));
    }
    if attrs.atomic_aggregate() {
        wire.push(PathAttribute::ATOMIC_AGGREGATOR);
    }
    if let Some(Attribute::Aggregator { asn, speaker }) = attrs.get(7) {
        wire.push(PathAttribute::AGGREGATOR((*asn, *speaker)));
    }
    if let Some(communities) = attrs.communities() {
        let standard = communities.standard();
        if !standard.is_empty() {
            wire.push(PathAttribute::COMMUNITY(standard));
        }
        let extended = communities.extended();
        if !extended.is_empty() {
            wire.push(PathAttribute::EXTENDED_COMMUNITIES(extended));
        }
    }
    if let Some(id) = attrs.originator_id() {
        wire.push(PathAttribute::ORIGINATOR_ID(u32::from_be_bytes(id.octets())));
    }
    if let Some(cluster_list) = attrs.cluster_list() {
        wire.push(PathAttribute::CLUSTER_LIST(
            cluster_list
                .iter()
                .map(|id| u32::from_be_bytes(id.octets()))
                .collect(),
        ));
    }
    wire
}

fn wire_as_path(as_path: &AsPath) -> ASPath {
    ASPath {
        segments: as_path
            .segments
            .iter()
            .map(|segment| match segment {
                AsSegment::Sequence(asns) | AsSegment::ConfedSequence(asns) => {
                    Segment::AS_SEQUENCE(asns.clone())
                }
                AsSegment::Set(asns) | AsSegment::ConfedSet(asns) => Segment::AS_SET(asns.clone()),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_rs::Origin;

    fn sample_update() -> Update {
        Update {
            withdrawn_routes: vec![NLRIEncoding::IP(crate::utils::prefix_from_str(
                "198.51.100.0/24",
            )
            .unwrap())],
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![65010])],
                }),
                PathAttribute::NEXT_HOP("10.0.0.10".parse().unwrap()),
                PathAttribute::MULTI_EXIT_DISC(50),
            ],
            announced_routes: vec![NLRIEncoding::IP(
                crate::utils::prefix_from_str("192.0.2.0/24").unwrap(),
            )],
        }
    }

    #[test]
    fn test_parse_update() {
        let parsed = parse_update(&sample_update()).unwrap();
        assert_eq!(parsed.family, Family::new(AFI::IPV4, SAFI::Unicast));
        assert_eq!(parsed.announced, vec!["192.0.2.0/24".parse().unwrap()]);
        assert_eq!(parsed.withdrawn, vec!["198.51.100.0/24".parse().unwrap()]);
        assert_eq!(
            parsed.attributes.next_hop(),
            Some("10.0.0.10".parse().unwrap())
        );
        assert_eq!(parsed.attributes.med(), Some(50));
        assert_eq!(parsed.attributes.as_path().flattened(), vec![65010]);
    }

    #[test]
    fn test_wire_attributes_round_trip() {
        let parsed = parse_update(&sample_update()).unwrap();
        let wire = wire_attributes(&parsed.attributes, parsed.family);
        let back = internal_attributes(&wire);
        assert_eq!(back, parsed.attributes);
    }

    #[test]
    fn test_wire_v6_omits_classic_next_hop() {
        let mut attrs = AttributeList::new(vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
        ]);
        attrs.insert(Attribute::NextHop("2001:db8::1".parse().unwrap()));
        let wire = wire_attributes(&attrs, Family::new(AFI::IPV6, SAFI::Unicast));
        assert!(!wire
            .iter()
            .any(|attr| matches!(attr, PathAttribute::NEXT_HOP(_))));
    }
}
