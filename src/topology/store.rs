//! Topology Store
//!
//! Holds the declared members of the replica set together with the role
//! and liveness this node has observed for each of them. Role assignments
//! are tagged with the term that decided them; assignments from older terms
//! are rejected.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::replication::LogPosition;
use super::descriptor::TopologyDescriptor;
use super::member::{Member, MemberHealth, MemberRole};
use super::{MemberId, Term};

/// Outcome of recording a failed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeFailure {
    /// The failure pushed the member over the threshold in this call
    pub became_unreachable: bool,
    /// The member held the primary role when it became unreachable
    pub was_primary: bool,
    /// Term of the primary assignment that was lost
    pub term: Term,
}

struct TopologyState {
    members: BTreeMap<MemberId, Member>,
    /// Current primary and the term that elected it
    primary: Option<(MemberId, Term)>,
    /// Highest term any role assignment was made in
    assignment_term: Term,
    /// Last time a primary was known to be alive
    primary_seen_at: Instant,
}

/// Topology store for one replica set, as seen from one member
pub struct TopologyStore {
    set_name: String,
    self_id: MemberId,
    descriptor: TopologyDescriptor,
    state: RwLock<TopologyState>,
}

impl TopologyStore {
    /// Build the store from a bootstrap descriptor
    pub fn new(descriptor: TopologyDescriptor, self_id: MemberId) -> Result<Self> {
        descriptor.validate()?;
        if descriptor.member(self_id).is_none() {
            return Err(Error::MemberNotFound(self_id));
        }

        let mut members = BTreeMap::new();
        for member_descriptor in &descriptor.members {
            let mut member = Member::new(member_descriptor.clone());
            if member.id() == self_id {
                member.health = MemberHealth::Up;
                if !member.is_arbiter() {
                    member.role = MemberRole::Secondary;
                }
            }
            members.insert(member.id(), member);
        }

        Ok(Self {
            set_name: descriptor.set_name.clone(),
            self_id,
            descriptor,
            state: RwLock::new(TopologyState {
                members,
                primary: None,
                assignment_term: 0,
                primary_seen_at: Instant::now(),
            }),
        })
    }

    /// Replica-set identifier
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// This member's id
    pub fn self_id(&self) -> MemberId {
        self.self_id
    }

    /// The bootstrap descriptor this store was built from
    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    /// Get a member's state
    pub async fn member(&self, id: MemberId) -> Option<Member> {
        self.state.read().await.members.get(&id).cloned()
    }

    /// Get this member's state
    pub async fn self_member(&self) -> Result<Member> {
        self.member(self.self_id)
            .await
            .ok_or(Error::MemberNotFound(self.self_id))
    }

    /// All members in id order
    pub async fn members(&self) -> Vec<Member> {
        self.state.read().await.members.values().cloned().collect()
    }

    /// All members except this one
    pub async fn peers(&self) -> Vec<Member> {
        let state = self.state.read().await;
        state
            .members
            .values()
            .filter(|m| m.id() != self.self_id)
            .cloned()
            .collect()
    }

    /// Members the heartbeat monitor probes: every other non-arbiter
    pub async fn probe_targets(&self) -> Vec<Member> {
        let state = self.state.read().await;
        state
            .members
            .values()
            .filter(|m| m.id() != self.self_id && !m.is_arbiter())
            .cloned()
            .collect()
    }

    /// Voting members, arbiters included
    pub async fn voting_members(&self) -> Vec<Member> {
        let state = self.state.read().await;
        state.members.values().filter(|m| m.is_voting()).cloned().collect()
    }

    /// Number of voting members
    pub fn voting_count(&self) -> usize {
        self.descriptor.voting_count()
    }

    /// Votes needed for a strict majority of voting members
    pub fn majority(&self) -> usize {
        self.descriptor.majority()
    }

    /// Electable members not known to be unreachable or frozen, best
    /// candidate first.
    ///
    /// Ranking is priority descending, then log position descending, then id.
    pub async fn ranked_candidates(&self) -> Vec<Member> {
        let state = self.state.read().await;
        let mut candidates: Vec<Member> = state
            .members
            .values()
            .filter(|m| m.is_electable() && m.is_reachable() && !m.frozen)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then(b.log_position.cmp(&a.log_position))
                .then(a.id().cmp(&b.id()))
        });
        candidates
    }

    /// Current primary and the term it was elected in
    pub async fn primary(&self) -> Option<(MemberId, Term)> {
        self.state.read().await.primary
    }

    /// Current primary's state
    pub async fn current_primary(&self) -> Option<Member> {
        let state = self.state.read().await;
        state
            .primary
            .and_then(|(id, _)| state.members.get(&id).cloned())
    }

    /// Highest term any role assignment was recorded for
    pub async fn assignment_term(&self) -> Term {
        self.state.read().await.assignment_term
    }

    /// Record that `id` was elected primary in `term`.
    ///
    /// Fails for arbiters and other non-electable members, for terms older than
    /// the latest assignment, and for a second primary in the same term.
    pub async fn assign_primary(&self, id: MemberId, term: Term) -> Result<()> {
        let mut state = self.state.write().await;

        match state.members.get(&id) {
            None => return Err(Error::MemberNotFound(id)),
            Some(member) if !member.is_electable() => return Err(Error::NotElectable(id)),
            Some(_) => {}
        }

        if term < state.assignment_term {
            return Err(Error::StaleTerm {
                received: term,
                current: state.assignment_term,
            });
        }

        if let Some((existing, existing_term)) = state.primary {
            if existing_term == term && existing != id {
                return Err(Error::ConflictingPrimary {
                    term,
                    existing,
                    claimed: id,
                });
            }
            if existing == id && existing_term == term {
                state.primary_seen_at = Instant::now();
                return Ok(());
            }
            if let Some(old) = state.members.get_mut(&existing) {
                old.role = MemberRole::Secondary;
                old.role_term = term;
            }
        }

        if let Some(member) = state.members.get_mut(&id) {
            member.role = MemberRole::Primary;
            member.role_term = term;
        }
        state.primary = Some((id, term));
        state.assignment_term = term;
        state.primary_seen_at = Instant::now();

        tracing::debug!("Topology: member {} is primary for term {}", id, term);
        Ok(())
    }

    /// Drop any primary assignment older than `term`.
    ///
    /// Returns the member that lost the role, if any.
    pub async fn clear_primary(&self, term: Term) -> Option<MemberId> {
        let mut state = self.state.write().await;
        if term > state.assignment_term {
            state.assignment_term = term;
        }

        match state.primary {
            Some((id, primary_term)) if primary_term < term => {
                state.primary = None;
                if let Some(member) = state.members.get_mut(&id) {
                    member.role = MemberRole::Secondary;
                    member.role_term = term;
                }
                Some(id)
            }
            _ => None,
        }
    }

    /// Drop the primary assignment if `id` holds it at or below `term`
    /// (the member stepped down without a new election).
    pub async fn relinquish_primary(&self, id: MemberId, term: Term) -> bool {
        let mut state = self.state.write().await;
        match state.primary {
            Some((primary, primary_term)) if primary == id && primary_term <= term => {
                state.primary = None;
                if let Some(member) = state.members.get_mut(&id) {
                    member.role = MemberRole::Secondary;
                }
                true
            }
            _ => false,
        }
    }

    /// Record a successful probe of `id`.
    ///
    /// Returns true if the member was unreachable before this probe.
    pub async fn record_probe_success(
        &self,
        id: MemberId,
        rtt: Duration,
        log_position: LogPosition,
        reported_role: MemberRole,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let primary = state.primary.map(|(p, _)| p);
        let member = state
            .members
            .get_mut(&id)
            .ok_or(Error::MemberNotFound(id))?;

        let recovered = member.health == MemberHealth::Unreachable;
        member.touch(rtt);
        if log_position > member.log_position {
            member.log_position = log_position;
        }
        // Primary claims go through term checks in the election coordinator
        if reported_role != MemberRole::Primary && primary != Some(id) {
            member.role = reported_role;
        }

        if primary == Some(id) {
            state.primary_seen_at = Instant::now();
        }

        if recovered {
            tracing::info!("Member {} is reachable again", id);
        }
        Ok(recovered)
    }

    /// Record a failed probe of `id`
    pub async fn record_probe_failure(&self, id: MemberId, threshold: u32) -> Result<ProbeFailure> {
        let mut state = self.state.write().await;
        let primary = state.primary;
        let member = state
            .members
            .get_mut(&id)
            .ok_or(Error::MemberNotFound(id))?;

        member.consecutive_failures = member.consecutive_failures.saturating_add(1);
        let mut outcome = ProbeFailure {
            became_unreachable: false,
            was_primary: false,
            term: 0,
        };

        if member.health != MemberHealth::Unreachable && member.consecutive_failures >= threshold {
            member.health = MemberHealth::Unreachable;
            member.ping_ms = None;
            outcome.became_unreachable = true;

            if let Some((primary_id, term)) = primary {
                if primary_id == id {
                    outcome.was_primary = true;
                    outcome.term = term;
                }
            }

            tracing::warn!(
                "Member {} unreachable after {} failed probes",
                id,
                member.consecutive_failures
            );
        }

        Ok(outcome)
    }

    /// Whether `id` answered its last probe
    pub async fn is_up(&self, id: MemberId) -> bool {
        let state = self.state.read().await;
        state
            .members
            .get(&id)
            .map(|m| m.health == MemberHealth::Up)
            .unwrap_or(false)
    }

    /// Raise a member's known log position
    pub async fn update_log_position(&self, id: MemberId, position: LogPosition) {
        let mut state = self.state.write().await;
        if let Some(member) = state.members.get_mut(&id) {
            if position > member.log_position {
                member.log_position = position;
            }
        }
    }

    /// Mark or clear a member as too far behind to count towards quorums.
    ///
    /// Returns true if the flag changed.
    pub async fn set_stale(&self, id: MemberId, stale: bool) -> bool {
        let mut state = self.state.write().await;
        match state.members.get_mut(&id) {
            Some(member) if member.stale != stale => {
                member.stale = stale;
                if stale {
                    tracing::warn!("Member {} is stale, excluded from write quorums", id);
                } else {
                    tracing::info!("Member {} caught up, counting towards write quorums", id);
                }
                true
            }
            _ => false,
        }
    }

    /// Record whether a member is refusing to stand for election
    pub async fn set_frozen(&self, id: MemberId, frozen: bool) {
        let mut state = self.state.write().await;
        if let Some(member) = state.members.get_mut(&id) {
            member.frozen = frozen;
        }
    }

    /// Note that the current primary is alive
    pub async fn touch_primary(&self) {
        self.state.write().await.primary_seen_at = Instant::now();
    }

    /// Time since a primary was last known to be alive
    pub async fn time_since_primary_seen(&self) -> Duration {
        self.state.read().await.primary_seen_at.elapsed()
    }

    /// Summary for status reporting
    pub async fn summary(&self) -> TopologySummary {
        let state = self.state.read().await;
        let mut summary = TopologySummary {
            set_name: self.set_name.clone(),
            total_members: state.members.len(),
            voting_members: self.voting_count(),
            majority: self.majority(),
            up_members: 0,
            unreachable_members: 0,
            stale_members: 0,
            primary_id: state.primary.map(|(id, _)| id),
            primary_term: state.primary.map(|(_, term)| term),
        };

        for member in state.members.values() {
            match member.health {
                MemberHealth::Up => summary.up_members += 1,
                MemberHealth::Unreachable => summary.unreachable_members += 1,
                MemberHealth::Unknown => {}
            }
            if member.stale {
                summary.stale_members += 1;
            }
        }

        summary
    }
}

/// Topology summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySummary {
    pub set_name: String,
    pub total_members: usize,
    pub voting_members: usize,
    pub majority: usize,
    pub up_members: usize,
    pub unreachable_members: usize,
    pub stale_members: usize,
    pub primary_id: Option<MemberId>,
    pub primary_term: Option<Term>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MemberDescriptor;

    fn store(self_id: MemberId) -> TopologyStore {
        TopologyStore::new(TopologyDescriptor::sample(), self_id).unwrap()
    }

    #[tokio::test]
    async fn test_store_creation() {
        let topology = store(0);
        assert_eq!(topology.set_name(), "rs0");
        assert_eq!(topology.members().await.len(), 3);
        assert_eq!(topology.peers().await.len(), 2);
        assert_eq!(topology.majority(), 2);

        let targets = topology.probe_targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id(), 1);

        assert!(TopologyStore::new(TopologyDescriptor::sample(), 9).is_err());
    }

    #[tokio::test]
    async fn test_assign_primary_rules() {
        let topology = store(1);

        topology.assign_primary(0, 3).await.unwrap();
        assert_eq!(topology.primary().await, Some((0, 3)));
        assert_eq!(topology.current_primary().await.unwrap().role, MemberRole::Primary);

        // Second primary in the same term
        assert!(matches!(
            topology.assign_primary(1, 3).await,
            Err(Error::ConflictingPrimary { .. })
        ));

        // Older term
        assert!(matches!(
            topology.assign_primary(1, 2).await,
            Err(Error::StaleTerm { .. })
        ));

        // Arbiter, whatever the term
        assert!(matches!(
            topology.assign_primary(2, 9).await,
            Err(Error::NotElectable(2))
        ));

        // Newer term replaces the old primary
        topology.assign_primary(1, 4).await.unwrap();
        assert_eq!(topology.primary().await, Some((1, 4)));
        assert_eq!(topology.member(0).await.unwrap().role, MemberRole::Secondary);
    }

    #[tokio::test]
    async fn test_probe_failure_threshold() {
        let topology = store(1);
        topology.assign_primary(0, 1).await.unwrap();

        let first = topology.record_probe_failure(0, 3).await.unwrap();
        assert!(!first.became_unreachable);
        let second = topology.record_probe_failure(0, 3).await.unwrap();
        assert!(!second.became_unreachable);

        let third = topology.record_probe_failure(0, 3).await.unwrap();
        assert!(third.became_unreachable);
        assert!(third.was_primary);
        assert_eq!(third.term, 1);

        // Already unreachable: no second signal
        let fourth = topology.record_probe_failure(0, 3).await.unwrap();
        assert!(!fourth.became_unreachable);

        let recovered = topology
            .record_probe_success(0, Duration::from_millis(1), 7, MemberRole::Primary)
            .await
            .unwrap();
        assert!(recovered);
        assert!(topology.is_up(0).await);
        assert_eq!(topology.member(0).await.unwrap().log_position, 7);
    }

    #[tokio::test]
    async fn test_ranked_candidates() {
        let descriptor = TopologyDescriptor {
            set_name: "rs1".into(),
            members: vec![
                MemberDescriptor::new(0, "a:1", 10),
                MemberDescriptor::new(1, "b:1", 10),
                MemberDescriptor::new(2, "c:1", 50),
                MemberDescriptor::arbiter(3, "d:1"),
            ],
        };
        let topology = TopologyStore::new(descriptor, 0).unwrap();
        topology.update_log_position(1, 20).await;
        topology.update_log_position(0, 5).await;

        let ranked: Vec<MemberId> = topology
            .ranked_candidates()
            .await
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(ranked, vec![2, 1, 0]);

        for _ in 0..3 {
            topology.record_probe_failure(2, 3).await.unwrap();
        }
        let ranked: Vec<MemberId> = topology
            .ranked_candidates()
            .await
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(ranked, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_clear_and_relinquish() {
        let topology = store(1);
        topology.assign_primary(0, 2).await.unwrap();

        assert_eq!(topology.clear_primary(2).await, None);
        assert_eq!(topology.clear_primary(3).await, Some(0));
        assert!(topology.primary().await.is_none());
        assert_eq!(topology.assignment_term().await, 3);

        topology.assign_primary(1, 3).await.unwrap();
        assert!(!topology.relinquish_primary(0, 3).await);
        assert!(topology.relinquish_primary(1, 3).await);
        assert!(topology.primary().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_flag_and_summary() {
        let topology = store(0);
        assert!(topology.set_stale(1, true).await);
        assert!(!topology.set_stale(1, true).await);

        let summary = topology.summary().await;
        assert_eq!(summary.total_members, 3);
        assert_eq!(summary.stale_members, 1);
        assert_eq!(summary.up_members, 1);
        assert!(summary.primary_id.is_none());
    }
}
