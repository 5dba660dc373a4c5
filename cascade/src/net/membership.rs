//! Static, totally ordered cluster membership.
//!
//! Members are sorted by name once at startup. A member's index in that order
//! is its [`PartitionId`]; partition 0 is the coordinator.

use thiserror::Error;

use crate::types::PartitionId;

use super::Endpoint;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership is empty")]
    Empty,
    #[error("duplicate member name: {0}")]
    DuplicateName(String),
    #[error("local member {0} is not part of the membership")]
    UnknownLocal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    name: String,
    endpoint: Endpoint,
}

impl Member {
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

#[derive(Debug, Clone)]
pub struct Membership {
    members: Vec<Member>,
    local: PartitionId,
}

impl Membership {
    /// Sorts `members` by name and locates `local_name` among them.
    ///
    /// # Errors
    ///
    /// Fails on an empty list, duplicate names, or a local name that is not
    /// listed.
    pub fn new(mut members: Vec<Member>, local_name: &str) -> Result<Self, MembershipError> {
        if members.is_empty() {
            return Err(MembershipError::Empty);
        }
        members.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = members.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(MembershipError::DuplicateName(pair[0].name.clone()));
        }
        let local = members
            .iter()
            .position(|m| m.name == local_name)
            .ok_or_else(|| MembershipError::UnknownLocal(local_name.to_owned()))?;
        Ok(Self {
            members,
            local: PartitionId::new(local as u32),
        })
    }

    /// This node's partition.
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.local
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.local == PartitionId::COORDINATOR
    }

    /// Number of other members.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.members.len() - 1
    }

    /// Every partition except the local one, in order.
    pub fn peers(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.members.len() as u32)
            .map(PartitionId::new)
            .filter(move |p| *p != self.local)
    }

    #[must_use]
    pub fn member(&self, partition: PartitionId) -> Option<&Member> {
        self.members.get(partition.index())
    }

    #[must_use]
    pub fn endpoint(&self, partition: PartitionId) -> Option<Endpoint> {
        self.member(partition).map(Member::endpoint)
    }

    #[must_use]
    pub fn contains(&self, partition: PartitionId) -> bool {
        partition.index() < self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<Member> {
        vec![
            Member::new("charlie", Endpoint::localhost(7003)),
            Member::new("alpha", Endpoint::localhost(7001)),
            Member::new("bravo", Endpoint::localhost(7002)),
        ]
    }

    #[test]
    fn sorted_by_name() {
        let m = Membership::new(members(), "bravo").unwrap();
        assert_eq!(m.partition(), PartitionId::new(1));
        assert_eq!(m.member(PartitionId::new(0)).unwrap().name(), "alpha");
        assert_eq!(m.endpoint(PartitionId::new(2)), Some(Endpoint::localhost(7003)));
        assert!(!m.is_coordinator());
    }

    #[test]
    fn peers_skip_local() {
        let m = Membership::new(members(), "alpha").unwrap();
        assert!(m.is_coordinator());
        assert_eq!(m.peer_count(), 2);
        let peers: Vec<_> = m.peers().collect();
        assert_eq!(peers, vec![PartitionId::new(1), PartitionId::new(2)]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Membership::new(vec![], "a"),
            Err(MembershipError::Empty)
        ));
        assert!(matches!(
            Membership::new(members(), "delta"),
            Err(MembershipError::UnknownLocal(_))
        ));
        let mut dup = members();
        dup.push(Member::new("alpha", Endpoint::localhost(7009)));
        assert!(matches!(
            Membership::new(dup, "alpha"),
            Err(MembershipError::DuplicateName(name)) if name == "alpha"
        ));
    }
}
