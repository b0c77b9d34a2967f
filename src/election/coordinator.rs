//! Election Coordinator
//!
//! Owns this member's election state. Every role transition happens under
//! one mutex; vote collection runs outside it and is abandoned as soon as
//! a higher term is observed.

use std::sync::Arc;
use std::time::Instant;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;

use super::ElectionConfig;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::replication::{LogPosition, Message, OpLog};
use crate::state::StateTracker;
use crate::topology::{MemberHealth, MemberId, Term, TopologyStore};

/// Election state of this member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Following the primary, if one is known
    Follower { term: Term, primary: Option<MemberId> },
    /// Standing for election in `term`
    Candidate { term: Term },
    /// Won the election for `term`
    Primary { term: Term },
}

impl ElectionState {
    pub fn term(&self) -> Term {
        match *self {
            ElectionState::Follower { term, .. }
            | ElectionState::Candidate { term }
            | ElectionState::Primary { term } => term,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ElectionState::Primary { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElectionState::Follower { .. } => "follower",
            ElectionState::Candidate { .. } => "candidate",
            ElectionState::Primary { .. } => "primary",
        }
    }
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name().to_uppercase())
    }
}

/// Result of one election attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This member is primary
    Won,
    /// Not enough votes in the dry run or the real round
    Lost,
    /// Another member is the better candidate, or this one is frozen
    Deferred,
}

struct Inner {
    state: ElectionState,
    /// Vote cast, as (term, candidate)
    voted_for: Option<(Term, MemberId)>,
    /// End of the step-down freeze
    frozen_until: Option<Instant>,
}

/// Election coordinator for one member
pub struct ElectionCoordinator {
    self_id: MemberId,
    topology: Arc<TopologyStore>,
    state_tracker: Arc<StateTracker>,
    oplog: Arc<RwLock<OpLog>>,
    transport: Arc<dyn Transport>,
    config: ElectionConfig,
    inner: Mutex<Inner>,
    /// Current term, watched by in-flight elections
    term_tx: watch::Sender<Term>,
}

impl ElectionCoordinator {
    /// Create the coordinator, reloading the persisted term and vote
    pub async fn new(
        topology: Arc<TopologyStore>,
        state_tracker: Arc<StateTracker>,
        oplog: Arc<RwLock<OpLog>>,
        transport: Arc<dyn Transport>,
        config: ElectionConfig,
    ) -> Result<Self> {
        let term = state_tracker.current_term().await?;
        let voted_for = state_tracker.voted_for().await?;
        let (term_tx, _) = watch::channel(term);

        if term > 0 {
            tracing::info!(
                "Member {} resuming at term {} (vote: {:?})",
                topology.self_id(),
                term,
                voted_for
            );
        }

        Ok(Self {
            self_id: topology.self_id(),
            topology,
            state_tracker,
            oplog,
            transport,
            config,
            inner: Mutex::new(Inner {
                state: ElectionState::Follower { term, primary: None },
                voted_for,
                frozen_until: None,
            }),
            term_tx,
        })
    }

    /// Current state
    pub async fn state(&self) -> ElectionState {
        self.inner.lock().await.state
    }

    /// Current term
    pub fn term(&self) -> Term {
        *self.term_tx.borrow()
    }

    pub async fn is_primary(&self) -> bool {
        self.inner.lock().await.state.is_primary()
    }

    /// Term this member is primary for, if it is primary
    pub async fn primary_term(&self) -> Option<Term> {
        match self.inner.lock().await.state {
            ElectionState::Primary { term } => Some(term),
            _ => None,
        }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    async fn log_head(&self) -> (LogPosition, Term) {
        let log = self.oplog.read().await;
        (log.last_position(), log.last_term())
    }

    /// Move to `term` as a follower. Caller holds the lock.
    async fn adopt_term(&self, inner: &mut Inner, term: Term) -> Result<()> {
        let previous = inner.state;
        self.state_tracker.set_current_term(term).await?;
        inner.state = ElectionState::Follower { term, primary: None };
        self.term_tx.send_replace(term);
        self.topology.clear_primary(term).await;

        match previous {
            ElectionState::Primary { .. } | ElectionState::Candidate { .. } => {
                self.state_tracker.set_current_primary(None).await?;
                tracing::info!(
                    "Member {} stepping down from {}: term {} -> {}",
                    self.self_id,
                    previous,
                    previous.term(),
                    term
                );
            }
            ElectionState::Follower { .. } => {
                tracing::debug!("Member {} adopting term {}", self.self_id, term);
            }
        }
        Ok(())
    }

    /// Learn of `term`, and optionally of the primary elected in it.
    ///
    /// A higher term turns any state back into a follower; stale terms are
    /// discarded. Returns true if this member stepped down.
    pub async fn observe_term(&self, term: Term, primary: Option<MemberId>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let current = inner.state.term();
        if term < current {
            return Ok(false);
        }

        let mut stepped_down = false;
        if term > current {
            stepped_down = !matches!(inner.state, ElectionState::Follower { .. });
            self.adopt_term(&mut inner, term).await?;
        }

        let Some(claimed) = primary else {
            return Ok(stepped_down);
        };
        if claimed == self.self_id {
            return Ok(stepped_down);
        }

        match inner.state {
            ElectionState::Primary { term } => {
                tracing::error!(
                    "Member {} claims primary in term {} held by this member",
                    claimed,
                    term
                );
                return Err(Error::ConflictingPrimary {
                    term,
                    existing: self.self_id,
                    claimed,
                });
            }
            ElectionState::Candidate { term } => {
                tracing::info!(
                    "Member {} abandoning candidacy: member {} is primary for term {}",
                    self.self_id,
                    claimed,
                    term
                );
                inner.state = ElectionState::Follower { term, primary: Some(claimed) };
                stepped_down = true;
            }
            ElectionState::Follower { term, primary } => {
                if primary != Some(claimed) {
                    tracing::info!("Member {} following primary {} in term {}", self.self_id, claimed, term);
                }
                inner.state = ElectionState::Follower { term, primary: Some(claimed) };
            }
        }

        // A claim relayed about a member we cannot reach is not evidence it is alive
        let reachable = self
            .topology
            .member(claimed)
            .await
            .map(|m| m.is_reachable())
            .unwrap_or(false);
        if reachable {
            if let Err(e) = self.topology.assign_primary(claimed, term).await {
                tracing::warn!("Ignoring primary claim for member {} in term {}: {}", claimed, term, e);
            }
        }

        Ok(stepped_down)
    }

    /// Forget `id` as primary (it stepped down or became unreachable)
    pub async fn forget_primary(&self, id: MemberId, term: Term) {
        let mut inner = self.inner.lock().await;
        if let ElectionState::Follower { term: current, primary: Some(p) } = inner.state {
            if p == id {
                inner.state = ElectionState::Follower { term: current, primary: None };
            }
        }
        if self.topology.relinquish_primary(id, term.max(inner.state.term())).await {
            tracing::info!("Member {} no longer primary", id);
        }
    }

    /// Answer a vote request.
    pub async fn handle_vote_request(
        &self,
        term: Term,
        candidate_id: MemberId,
        last_position: LogPosition,
        last_term: Term,
        dry_run: bool,
    ) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let mut current = inner.state.term();

        let reject = |term: Term, reason: String| -> Result<Message> {
            tracing::debug!(
                "Member {} denies {}vote to {} for term {}: {}",
                self.self_id,
                if dry_run { "dry-run " } else { "" },
                candidate_id,
                term,
                reason
            );
            Ok(Message::VoteResponse {
                member_id: self.self_id,
                term,
                granted: false,
                reason: Some(reason),
            })
        };

        if term < current {
            return reject(current, format!("stale term {} (current {})", term, current));
        }

        if term > current && !dry_run {
            self.adopt_term(&mut inner, term).await?;
            current = term;
        }

        let candidate = match self.topology.member(candidate_id).await {
            Some(member) => member,
            None => return reject(current, "unknown member".into()),
        };
        if !candidate.is_electable() {
            return reject(current, "candidate is not electable".into());
        }

        if let Some((voted_term, voted)) = inner.voted_for {
            if voted_term == term && voted != candidate_id {
                return reject(current, format!("already voted for {} in term {}", voted, term));
            }
        }

        let (our_position, our_term) = self.log_head().await;
        if (last_term, last_position) < (our_term, our_position) {
            return reject(
                current,
                format!(
                    "candidate log ({}, {}) behind ours ({}, {})",
                    last_term, last_position, our_term, our_position
                ),
            );
        }

        let frozen = matches!(inner.frozen_until, Some(until) if until > Instant::now());
        for member in self.topology.members().await {
            if member.id() == candidate_id || !member.is_electable() {
                continue;
            }
            if member.priority() <= candidate.priority() {
                continue;
            }
            let available = if member.id() == self.self_id {
                !frozen
            } else {
                member.health == MemberHealth::Up && !member.stale && !member.frozen
            };
            if available {
                return reject(
                    current,
                    format!("member {} has higher priority {}", member.id(), member.priority()),
                );
            }
        }

        if dry_run {
            if let Some(primary) = self.topology.current_primary().await {
                let healthy = if primary.id() == self.self_id {
                    inner.state.is_primary()
                } else {
                    primary.health == MemberHealth::Up
                        && self.topology.time_since_primary_seen().await < self.config.max_timeout()
                };
                if healthy && primary.id() != candidate_id && candidate.priority() <= primary.priority() {
                    return reject(current, format!("primary {} is healthy", primary.id()));
                }
            }
        } else {
            self.state_tracker
                .set_voted_for(Some((term, candidate_id)))
                .await?;
            inner.voted_for = Some((term, candidate_id));
            tracing::info!("Member {} votes for {} in term {}", self.self_id, candidate_id, term);
        }

        Ok(Message::VoteResponse {
            member_id: self.self_id,
            term: current,
            granted: true,
            reason: None,
        })
    }

    /// Ask every reachable voter for its vote at `term`; returns the number
    /// of votes granted, this member's own included.
    async fn collect_votes(
        &self,
        term: Term,
        last_position: LogPosition,
        last_term: Term,
        dry_run: bool,
    ) -> Result<usize> {
        let majority = self.topology.majority();
        let voters: Vec<_> = self
            .topology
            .voting_members()
            .await
            .into_iter()
            .filter(|m| m.id() != self.self_id && m.is_reachable())
            .collect();

        let request = Message::RequestVote {
            set_name: self.topology.set_name().to_string(),
            term,
            candidate_id: self.self_id,
            last_position,
            last_term,
            dry_run,
        };

        let vote_timeout = self.config.vote_timeout();
        let mut pending: FuturesUnordered<_> = voters
            .iter()
            .map(|member| {
                let transport = Arc::clone(&self.transport);
                let host = member.host().to_string();
                let id = member.id();
                let request = request.clone();
                async move { (id, timeout(vote_timeout, transport.send(&host, request)).await) }
            })
            .collect();

        // Observing this term or a later one makes the round pointless
        let cancel_at = if dry_run { term } else { term + 1 };
        let mut term_rx = self.term_tx.subscribe();
        let mut granted = 1usize;

        while granted < majority {
            tokio::select! {
                next = pending.next() => {
                    let Some((id, result)) = next else { break };
                    match result {
                        Ok(Ok(Message::VoteResponse { term: voter_term, granted: yes, reason, .. })) => {
                            if voter_term > term {
                                self.observe_term(voter_term, None).await?;
                                return Err(Error::Cancelled);
                            }
                            if yes {
                                granted += 1;
                                tracing::debug!("Member {} granted vote for term {}", id, term);
                            } else {
                                tracing::debug!(
                                    "Member {} denied vote for term {}: {}",
                                    id,
                                    term,
                                    reason.unwrap_or_default()
                                );
                            }
                        }
                        Ok(Ok(other)) => {
                            tracing::debug!("Unexpected {} from member {} to vote request", other.type_name(), id);
                        }
                        Ok(Err(e)) => {
                            tracing::debug!("Vote request to member {} failed: {}", id, e);
                        }
                        Err(_) => {
                            tracing::debug!("Vote request to member {} timed out", id);
                        }
                    }
                }
                changed = term_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::ShuttingDown);
                    }
                    if *term_rx.borrow_and_update() >= cancel_at {
                        tracing::info!("Election for term {} abandoned: higher term observed", term);
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        Ok(granted)
    }

    /// Run one election attempt: candidacy gate, dry run, real round.
    pub async fn run_election(&self) -> Result<ElectionOutcome> {
        let me = self.topology.self_member().await?;
        if !me.is_electable() {
            return Err(Error::NotElectable(self.self_id));
        }
        if self.is_frozen().await {
            return Ok(ElectionOutcome::Deferred);
        }
        if self.is_primary().await {
            return Ok(ElectionOutcome::Won);
        }

        let (last_position, last_term) = self.log_head().await;
        self.topology.update_log_position(self.self_id, last_position).await;

        match self.topology.ranked_candidates().await.first() {
            Some(top) if top.id() == self.self_id => {}
            Some(top) => {
                tracing::debug!("Member {} defers to better candidate {}", self.self_id, top.id());
                return Ok(ElectionOutcome::Deferred);
            }
            None => return Ok(ElectionOutcome::Deferred),
        }

        let majority = self.topology.majority();
        let proposed = self.term() + 1;

        let granted = self.collect_votes(proposed, last_position, last_term, true).await?;
        if granted < majority {
            tracing::info!(
                "Member {} dry run for term {}: {}/{} votes",
                self.self_id,
                proposed,
                granted,
                majority
            );
            return Ok(ElectionOutcome::Lost);
        }

        let term = {
            let mut inner = self.inner.lock().await;
            if inner.state.term() + 1 != proposed || inner.state.is_primary() {
                return Ok(ElectionOutcome::Lost);
            }
            self.state_tracker.set_current_term(proposed).await?;
            self.state_tracker
                .set_voted_for(Some((proposed, self.self_id)))
                .await?;
            inner.voted_for = Some((proposed, self.self_id));
            inner.state = ElectionState::Candidate { term: proposed };
            self.term_tx.send_replace(proposed);
            self.topology.clear_primary(proposed).await;
            proposed
        };

        tracing::info!(
            "Member {} standing for election in term {} (log at {}/{})",
            self.self_id,
            term,
            last_term,
            last_position
        );

        let granted = self.collect_votes(term, last_position, last_term, false).await?;

        let mut inner = self.inner.lock().await;
        if inner.state != (ElectionState::Candidate { term }) {
            return Ok(ElectionOutcome::Lost);
        }

        if granted >= majority {
            self.topology.assign_primary(self.self_id, term).await?;
            inner.state = ElectionState::Primary { term };
            self.state_tracker.set_current_primary(Some(self.self_id)).await?;
            tracing::info!(
                "Member {} elected primary for term {} with {}/{} votes",
                self.self_id,
                term,
                granted,
                self.topology.voting_count()
            );
            Ok(ElectionOutcome::Won)
        } else {
            inner.state = ElectionState::Follower { term, primary: None };
            tracing::info!(
                "Member {} lost election for term {}: {}/{} votes",
                self.self_id,
                term,
                granted,
                majority
            );
            Ok(ElectionOutcome::Lost)
        }
    }

    /// Stand for election, retrying with backoff.
    ///
    /// Returns true once this member is primary, false when it defers or
    /// another primary appears.
    pub async fn campaign(&self) -> Result<bool> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.config.backoff(attempt);
                tracing::debug!("Member {} retrying election in {:?}", self.self_id, delay);
                tokio::time::sleep(delay).await;
            }

            if self.is_primary().await {
                return Ok(true);
            }
            if let Some(primary) = self.topology.current_primary().await {
                if primary.id() != self.self_id && primary.health == MemberHealth::Up {
                    return Ok(false);
                }
            }

            match self.run_election().await {
                Ok(ElectionOutcome::Won) => return Ok(true),
                Ok(ElectionOutcome::Deferred) => return Ok(false),
                Ok(ElectionOutcome::Lost) => {}
                Err(Error::Cancelled) => return Ok(false),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Election attempt {} failed: {}", attempt + 1, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::ElectionTimeout {
            attempts: max_attempts,
        })
    }

    /// React to a primary-loss signal
    pub async fn on_primary_loss(&self, lost: Option<MemberId>, term: Term) -> Result<bool> {
        if self.is_primary().await {
            return Ok(false);
        }
        if let Some(lost) = lost {
            tracing::info!("Member {} lost primary {} of term {}", self.self_id, lost, term);
            self.forget_primary(lost, term).await;
        }
        if !self.topology.self_member().await?.is_electable() {
            return Ok(false);
        }
        self.campaign().await
    }

    /// Call an election if this member outranks the current primary by
    /// priority and has caught up with it.
    pub async fn check_priority_takeover(&self) -> Result<bool> {
        if !matches!(self.state().await, ElectionState::Follower { .. }) {
            return Ok(false);
        }
        let Some(primary) = self.topology.current_primary().await else {
            return Ok(false);
        };
        if primary.id() == self.self_id {
            return Ok(false);
        }
        let me = self.topology.self_member().await?;
        if !me.is_electable() || me.priority() <= primary.priority() {
            return Ok(false);
        }
        let (last_position, _) = self.log_head().await;
        if last_position < primary.log_position {
            return Ok(false);
        }

        tracing::info!(
            "Member {} (priority {}) calling priority takeover from primary {} (priority {})",
            self.self_id,
            me.priority(),
            primary.id(),
            primary.priority()
        );

        match self.run_election().await {
            Ok(outcome) => Ok(outcome == ElectionOutcome::Won),
            Err(Error::Cancelled) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Step down from primary and refuse to stand for the freeze period
    pub async fn step_down(&self) -> Result<Term> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ElectionState::Primary { term } => {
                inner.state = ElectionState::Follower { term, primary: None };
                inner.frozen_until = Some(Instant::now() + self.config.stepdown_period());
                self.topology.relinquish_primary(self.self_id, term).await;
                self.topology.set_frozen(self.self_id, true).await;
                self.state_tracker.set_current_primary(None).await?;
                tracing::info!(
                    "Member {} stepped down in term {}, not standing for {:?}",
                    self.self_id,
                    term,
                    self.config.stepdown_period()
                );
                Ok(term)
            }
            _ => Err(Error::NotPrimary {
                primary: self.topology.primary().await.map(|(id, _)| id),
            }),
        }
    }

    /// Whether this member is inside a step-down freeze
    pub async fn is_frozen(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.frozen_until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                inner.frozen_until = None;
                self.topology.set_frozen(self.self_id, false).await;
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::network::{LocalNetwork, MessageHandler};
    use crate::replication::{ErrorCode, Operation};
    use crate::topology::{MemberRole, TopologyDescriptor};
    use std::time::Duration;

    async fn coordinator(self_id: MemberId) -> (ElectionCoordinator, Arc<TopologyStore>, Arc<RwLock<OpLog>>) {
        coordinator_on(&LocalNetwork::new(), self_id, ElectionConfig::default()).await
    }

    async fn coordinator_on(
        network: &Arc<LocalNetwork>,
        self_id: MemberId,
        config: ElectionConfig,
    ) -> (ElectionCoordinator, Arc<TopologyStore>, Arc<RwLock<OpLog>>) {
        let topology = Arc::new(TopologyStore::new(TopologyDescriptor::sample(), self_id).unwrap());
        let tracker = Arc::new(StateTracker::in_memory(self_id).unwrap());
        let oplog = Arc::new(RwLock::new(OpLog::new()));
        let host = topology.self_member().await.unwrap().host().to_string();
        let transport: Arc<dyn Transport> = Arc::new(network.transport(&host));
        let election = ElectionCoordinator::new(
            Arc::clone(&topology),
            tracker,
            Arc::clone(&oplog),
            transport,
            config,
        )
        .await
        .unwrap();
        (election, topology, oplog)
    }

    /// Voter that never answers in time
    struct Unresponsive;

    #[async_trait]
    impl MessageHandler for Unresponsive {
        async fn handle(&self, _message: Message) -> Message {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Message::Error {
                code: ErrorCode::Internal,
                message: "too late".into(),
            }
        }
    }

    fn granted(message: &Message) -> bool {
        matches!(message, Message::VoteResponse { granted: true, .. })
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        // The arbiter votes
        let (election, _topology, _) = coordinator(2).await;

        let first = election.handle_vote_request(1, 0, 0, 0, false).await.unwrap();
        assert!(granted(&first));
        assert_eq!(election.term(), 1);

        // Repeating the same vote is fine, a second candidate is not
        assert!(granted(&election.handle_vote_request(1, 0, 0, 0, false).await.unwrap()));
        let second = election.handle_vote_request(1, 1, 0, 0, false).await.unwrap();
        assert!(!granted(&second));

        // Stale term
        let stale = election.handle_vote_request(0, 0, 0, 0, false).await.unwrap();
        assert!(matches!(stale, Message::VoteResponse { granted: false, term: 1, .. }));
    }

    #[tokio::test]
    async fn test_arbiter_candidate_rejected() {
        let (election, _, _) = coordinator(1).await;
        let response = election.handle_vote_request(5, 2, 0, 0, false).await.unwrap();
        assert!(!granted(&response));
    }

    #[tokio::test]
    async fn test_higher_priority_member_blocks_vote() {
        // Arbiter sees member 0 up: member 1 must not win
        let (election, topology, _) = coordinator(2).await;
        topology
            .record_probe_success(0, Duration::from_millis(1), 0, MemberRole::Secondary)
            .await
            .unwrap();
        assert!(!granted(&election.handle_vote_request(1, 1, 0, 0, false).await.unwrap()));

        // Member 0 unreachable: member 1 may win
        for _ in 0..3 {
            topology.record_probe_failure(0, 3).await.unwrap();
        }
        assert!(granted(&election.handle_vote_request(1, 1, 0, 0, false).await.unwrap()));
    }

    #[tokio::test]
    async fn test_stale_log_rejected() {
        let (election, _, oplog) = coordinator(1).await;
        {
            let mut log = oplog.write().await;
            log.append(1, Operation::Noop { message: "a".into() });
            log.append(1, Operation::Noop { message: "b".into() });
        }
        assert!(!granted(&election.handle_vote_request(2, 0, 1, 1, false).await.unwrap()));
        assert!(granted(&election.handle_vote_request(3, 0, 2, 1, false).await.unwrap()));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (election, _, _) = coordinator(2).await;
        let response = election.handle_vote_request(4, 0, 0, 0, true).await.unwrap();
        assert!(granted(&response));
        assert_eq!(election.term(), 0);

        // A real vote at that term is still available to someone else
        assert!(granted(&election.handle_vote_request(4, 0, 0, 0, false).await.unwrap()));
    }

    #[tokio::test]
    async fn test_higher_term_steps_down() {
        let (election, topology, _) = coordinator(0).await;
        {
            let mut inner = election.inner.lock().await;
            inner.state = ElectionState::Primary { term: 3 };
        }
        topology.assign_primary(0, 3).await.unwrap();

        assert!(election.observe_term(4, None).await.unwrap());
        assert_eq!(election.state().await, ElectionState::Follower { term: 4, primary: None });
        assert!(topology.primary().await.is_none());

        // Stale terms are discarded
        assert!(!election.observe_term(2, Some(1)).await.unwrap());
        assert_eq!(election.term(), 4);
    }

    #[tokio::test]
    async fn test_step_down_requires_primary() {
        let (election, topology, _) = coordinator(0).await;
        assert!(matches!(election.step_down().await, Err(Error::NotPrimary { .. })));

        {
            let mut inner = election.inner.lock().await;
            inner.state = ElectionState::Primary { term: 2 };
        }
        topology.assign_primary(0, 2).await.unwrap();

        assert_eq!(election.step_down().await.unwrap(), 2);
        assert!(!election.is_primary().await);
        assert!(election.is_frozen().await);
        assert!(topology.member(0).await.unwrap().frozen);
        assert_eq!(election.run_election().await.unwrap(), ElectionOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_arbiter_never_stands() {
        let (election, _, _) = coordinator(2).await;
        assert!(matches!(election.run_election().await, Err(Error::NotElectable(2))));
        assert!(!election.on_primary_loss(Some(0), 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_higher_term_cancels_vote_collection() {
        let network = LocalNetwork::new();
        let voter: Arc<dyn MessageHandler> = Arc::new(Unresponsive);
        network.register("mongodb-secondary:27017", &voter).await;
        network.register("mongodb-arbiter:27017", &voter).await;
        let config = ElectionConfig {
            vote_timeout_ms: 30_000,
            ..Default::default()
        };
        let (election, _, _) = coordinator_on(&network, 0, config).await;
        let election = Arc::new(election);

        let candidate = Arc::clone(&election);
        let round = tokio::spawn(async move { candidate.run_election().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!round.is_finished());

        election.observe_term(5, Some(1)).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), round)
            .await
            .expect("round still waiting on votes")
            .unwrap();
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert_eq!(election.term(), 5);
        assert_eq!(election.state().await, ElectionState::Follower { term: 5, primary: Some(1) });
    }

    #[tokio::test]
    async fn test_campaign_gives_up_after_max_attempts() {
        // Nobody else is on the network
        let network = LocalNetwork::new();
        let config = ElectionConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            jitter_ms: 0,
            ..Default::default()
        };
        let (election, _, _) = coordinator_on(&network, 0, config).await;

        let result = election.campaign().await;
        assert!(matches!(result, Err(Error::ElectionTimeout { attempts: 3 })));
        assert!(result.unwrap_err().is_retryable());

        // Dry runs never raised the term
        assert_eq!(election.term(), 0);
        assert!(!election.is_primary().await);
    }
}
