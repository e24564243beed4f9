mod aspath;
pub mod community;
mod convert;

pub use aspath::{AsPath, AsSegment};
pub use community::{Community, CommunityList};
pub use convert::{parse_update, wire_attributes, ParsedUpdate};

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

/// ORIGIN attribute value; ordering matches the decision preference
/// (IGP beats EGP beats INCOMPLETE).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathOrigin {
    Igp,
    Egp,
    Incomplete,
}

impl fmt::Display for PathOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PathOrigin::Igp => "IGP",
            PathOrigin::Egp => "EGP",
            PathOrigin::Incomplete => "Incomplete",
        };
        write!(f, "{}", word)
    }
}

/// Attribute flag bits as they appear on the wire; only unknown
/// attributes keep their raw flags.
pub const FLAG_OPTIONAL: u8 = 0x80;
pub const FLAG_TRANSITIVE: u8 = 0x40;
pub const FLAG_PARTIAL: u8 = 0x20;

/// One path attribute in the internal, already-validated form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    Origin(PathOrigin),
    AsPath(AsPath),
    NextHop(IpAddr),
    Med(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u32, speaker: Ipv4Addr },
    Communities(CommunityList),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    /// Attribute types this speaker does not interpret; kept with their
    /// wire flags so transitive handling can be applied.
    Unknown { flags: u8, code: u8, data: Vec<u8> },
}

impl Attribute {
    /// Wire type code, used as the canonical sort key
    pub fn type_code(&self) -> u8 {
        match self {
            Attribute::Origin(_) => 1,
            Attribute::AsPath(_) => 2,
            Attribute::NextHop(_) => 3,
            Attribute::Med(_) => 4,
            Attribute::LocalPref(_) => 5,
            Attribute::AtomicAggregate => 6,
            Attribute::Aggregator { .. } => 7,
            Attribute::Communities(_) => 8,
            Attribute::OriginatorId(_) => 9,
            Attribute::ClusterList(_) => 10,
            Attribute::Unknown { code, .. } => *code,
        }
    }
}

/// Canonical, order-normalized path attribute collection.
///
/// The stored form is immutable and shared by reference (`Arc`); a filter
/// that needs to change attributes clones a working copy, mutates it, and
/// canonicalises again before the result is stored downstream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttributeList {
    // Kept sorted by type code; at most one attribute per code
    attrs: Vec<Attribute>,
}

impl AttributeList {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        let mut list = AttributeList { attrs };
        list.canonicalize();
        list
    }

    /// Sort by type code and keep the last attribute for a duplicated
    /// code (later insertion wins, matching replace semantics).
    fn canonicalize(&mut self) {
        self.attrs.reverse();
        self.attrs
            .sort_by(|a, b| a.type_code().cmp(&b.type_code()));
        self.attrs.dedup_by_key(|attr| attr.type_code());
    }

    pub fn iter(&self) -> std::slice::Iter<Attribute> {
        self.attrs.iter()
    }

    pub fn get(&self, code: u8) -> Option<&Attribute> {
        self.attrs
            .binary_search_by(|attr| attr.type_code().cmp(&code))
            .ok()
            .map(|idx| &self.attrs[idx])
    }

    /// Insert or replace the attribute with the same type code
    pub fn insert(&mut self, attr: Attribute) {
        match self
            .attrs
            .binary_search_by(|a| a.type_code().cmp(&attr.type_code()))
        {
            Ok(idx) => self.attrs[idx] = attr,
            Err(idx) => self.attrs.insert(idx, attr),
        }
    }

    pub fn remove(&mut self, code: u8) -> Option<Attribute> {
        self.attrs
            .binary_search_by(|attr| attr.type_code().cmp(&code))
            .ok()
            .map(|idx| self.attrs.remove(idx))
    }

    /// Content digest used for de-duplication and update packing
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.attrs.hash(&mut hasher);
        hasher.finish()
    }

    pub fn origin(&self) -> PathOrigin {
        match self.get(1) {
            Some(Attribute::Origin(origin)) => *origin,
            _ => PathOrigin::Incomplete,
        }
    }

    pub fn as_path(&self) -> AsPath {
        match self.get(2) {
            Some(Attribute::AsPath(path)) => path.clone(),
            _ => AsPath::empty(),
        }
    }

    pub fn has_as_path(&self) -> bool {
        matches!(self.get(2), Some(Attribute::AsPath(_)))
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        match self.get(3) {
            Some(Attribute::NextHop(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn med(&self) -> Option<u32> {
        match self.get(4) {
            Some(Attribute::Med(med)) => Some(*med),
            _ => None,
        }
    }

    pub fn local_pref(&self) -> Option<u32> {
        match self.get(5) {
            Some(Attribute::LocalPref(pref)) => Some(*pref),
            _ => None,
        }
    }

    pub fn atomic_aggregate(&self) -> bool {
        self.get(6).is_some()
    }

    pub fn communities(&self) -> Option<&CommunityList> {
        match self.get(8) {
            Some(Attribute::Communities(list)) => Some(list),
            _ => None,
        }
    }

    pub fn originator_id(&self) -> Option<Ipv4Addr> {
        match self.get(9) {
            Some(Attribute::OriginatorId(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn cluster_list(&self) -> Option<&[Ipv4Addr]> {
        match self.get(10) {
            Some(Attribute::ClusterList(list)) => Some(list),
            _ => None,
        }
    }

    /// Prepend our cluster id, growing a CLUSTER_LIST if absent
    pub fn prepend_cluster_id(&mut self, cluster_id: Ipv4Addr) {
        let mut list = match self.remove(10) {
            Some(Attribute::ClusterList(list)) => list,
            _ => vec![],
        };
        list.insert(0, cluster_id);
        self.insert(Attribute::ClusterList(list));
    }

    /// Apply the RFC 4271 rules for attributes unknown to this speaker:
    /// non-transitive unknowns are dropped, transitive unknowns are kept
    /// with the partial bit set.
    pub fn process_unknown_attributes(&mut self) {
        self.attrs.retain(|attr| match attr {
            Attribute::Unknown { flags, .. } => flags & FLAG_TRANSITIVE != 0,
            _ => true,
        });
        for attr in self.attrs.iter_mut() {
            if let Attribute::Unknown { flags, .. } = attr {
                *flags |= FLAG_PARTIAL;
            }
        }
    }
}

impl fmt::Display for AttributeList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<PaList origin={} as_path=[{}] nexthop={}>",
            self.origin(),
            self.as_path(),
            self.next_hop()
                .map(|nh| nh.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AttributeList {
        AttributeList::new(vec![
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
            Attribute::Origin(PathOrigin::Igp),
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
        ])
    }

    #[test]
    fn test_canonical_order() {
        let list = sample();
        let codes: Vec<u8> = list.iter().map(Attribute::type_code).collect();
        assert_eq!(codes, vec![1, 2, 3]);
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = sample();
        let b = AttributeList::new(vec![
            Attribute::AsPath(AsPath::from_sequence(vec![65010])),
            Attribute::NextHop("10.0.0.10".parse().unwrap()),
            Attribute::Origin(PathOrigin::Igp),
        ]);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a, b);

        let mut c = a.clone();
        c.insert(Attribute::Med(50));
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_insert_replaces() {
        let mut list = sample();
        list.insert(Attribute::LocalPref(100));
        list.insert(Attribute::LocalPref(200));
        assert_eq!(list.local_pref(), Some(200));
        assert!(list.remove(5).is_some());
        assert_eq!(list.local_pref(), None);
    }

    #[test]
    fn test_cluster_list_prepend() {
        let mut list = sample();
        list.prepend_cluster_id("10.0.0.1".parse().unwrap());
        list.prepend_cluster_id("10.0.0.2".parse().unwrap());
        assert_eq!(
            list.cluster_list().unwrap(),
            &[
                "10.0.0.2".parse::<Ipv4Addr>().unwrap(),
                "10.0.0.1".parse::<Ipv4Addr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_unknown_attribute_rules() {
        let mut list = AttributeList::new(vec![
            Attribute::Origin(PathOrigin::Igp),
            Attribute::Unknown {
                flags: FLAG_OPTIONAL | FLAG_TRANSITIVE,
                code: 201,
                data: vec![1, 2],
            },
            Attribute::Unknown {
                flags: FLAG_OPTIONAL,
                code: 202,
                data: vec![3],
            },
        ]);
        list.process_unknown_attributes();
        assert!(list.get(202).is_none());
        match list.get(201) {
            Some(Attribute::Unknown { flags, .. }) => {
                assert_ne!(flags & FLAG_PARTIAL, 0);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
