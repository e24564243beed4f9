use std::fmt;

use itertools::Itertools;

/// One AS_PATH segment.
///
/// Confederation segment types are carried internally even though the
/// wire-facing types only model sequence and set; the boundary conversion
/// flattens them (confed segments only ever face confederation peers,
/// whose wire encoding is owned by the codec collaborator).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AsSegment {
    Sequence(Vec<u32>),
    Set(Vec<u32>),
    ConfedSequence(Vec<u32>),
    ConfedSet(Vec<u32>),
}

impl AsSegment {
    fn asns(&self) -> &[u32] {
        match self {
            AsSegment::Sequence(asns)
            | AsSegment::Set(asns)
            | AsSegment::ConfedSequence(asns)
            | AsSegment::ConfedSet(asns) => asns,
        }
    }

    fn is_confed(&self) -> bool {
        matches!(
            self,
            AsSegment::ConfedSequence(_) | AsSegment::ConfedSet(_)
        )
    }

    /// Contribution to the path length tiebreak: each sequence ASN counts
    /// one, a set counts one in total, confed segments count zero
    /// (RFC 5065).
    fn path_len(&self) -> u32 {
        match self {
            AsSegment::Sequence(asns) => asns.len() as u32,
            AsSegment::Set(_) => 1,
            AsSegment::ConfedSequence(_) | AsSegment::ConfedSet(_) => 0,
        }
    }
}

impl fmt::Display for AsSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let join = |asns: &[u32]| asns.iter().map(|asn| asn.to_string()).join(" ");
        match self {
            AsSegment::Sequence(asns) => write!(f, "{}", join(asns)),
            AsSegment::Set(asns) => write!(f, "{{{}}}", join(asns)),
            AsSegment::ConfedSequence(asns) => write!(f, "({})", join(asns)),
            AsSegment::ConfedSet(asns) => write!(f, "({{{}}})", join(asns)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AsPath {
    pub segments: Vec<AsSegment>,
}

impl AsPath {
    pub fn empty() -> Self {
        AsPath { segments: vec![] }
    }

    pub fn from_sequence(asns: Vec<u32>) -> Self {
        AsPath {
            segments: vec![AsSegment::Sequence(asns)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Does any segment mention the given AS?
    pub fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|seg| seg.asns().contains(&asn))
    }

    /// Path length used by the decision tiebreak
    pub fn path_len(&self) -> u32 {
        self.segments.iter().map(AsSegment::path_len).sum()
    }

    /// Prepend our AS to the leading sequence, growing one if the path
    /// is empty or starts with a set.
    pub fn prepend(&mut self, asn: u32) {
        match self.segments.first_mut() {
            Some(AsSegment::Sequence(asns)) => asns.insert(0, asn),
            _ => self.segments.insert(0, AsSegment::Sequence(vec![asn])),
        }
    }

    /// Prepend our AS to the leading confed sequence, growing one if
    /// the path does not start with one.
    pub fn prepend_confed(&mut self, asn: u32) {
        match self.segments.first_mut() {
            Some(AsSegment::ConfedSequence(asns)) => asns.insert(0, asn),
            _ => self
                .segments
                .insert(0, AsSegment::ConfedSequence(vec![asn])),
        }
    }

    /// Strip confederation segments before the path leaves the
    /// confederation boundary.
    pub fn remove_confed_segments(&mut self) {
        self.segments.retain(|seg| !seg.is_confed());
    }

    /// All ASNs in sequence order, sets and confed segments flattened
    pub fn flattened(&self) -> Vec<u32> {
        self.segments
            .iter()
            .flat_map(|seg| seg.asns().iter().copied())
            .collect()
    }

    /// Merge two contributor paths for an aggregate (RFC 4271 9.2.2.2):
    /// the longest common leading sequence is kept, everything else is
    /// folded into an AS_SET.
    pub fn merge_for_aggregate(&self, other: &AsPath) -> AsPath {
        let ours = self.flattened();
        let theirs = other.flattened();
        let common = ours
            .iter()
            .zip(theirs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let rest: Vec<u32> = ours[common..]
            .iter()
            .chain(theirs[common..].iter())
            .copied()
            .sorted()
            .dedup()
            .collect();
        let mut segments = Vec::with_capacity(2);
        if common > 0 {
            segments.push(AsSegment::Sequence(ours[..common].to_vec()));
        }
        if !rest.is_empty() {
            segments.push(AsSegment::Set(rest));
        }
        AsPath { segments }
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.segments.iter().join(" "))
    }
}
