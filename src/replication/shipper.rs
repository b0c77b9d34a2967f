//! Log Shipper
//!
//! Primary side of replication: appends client operations, pushes them to
//! secondaries in position order and waits for the write concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{timeout, timeout_at, Instant};

use super::oplog::{LogPosition, OpLog, Operation};
use super::{Message, ReplicationConfig, WriteConcern};
use crate::election::ElectionCoordinator;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::state::StateTracker;
use crate::topology::{Member, MemberHealth, MemberId, Term, TopologyStore};

/// Rewind rounds per member per shipping pass
const MAX_SHIP_ROUNDS: usize = 8;

// Lock order: oplog, match_position, next_position.

/// Acknowledged write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub position: LogPosition,
    pub term: Term,
    /// Members the write was durable on when it was acknowledged
    pub acked: usize,
}

/// Log shipper
pub struct LogShipper {
    self_id: MemberId,
    topology: Arc<TopologyStore>,
    state_tracker: Arc<StateTracker>,
    oplog: Arc<RwLock<OpLog>>,
    election: Arc<ElectionCoordinator>,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    /// Next position to send to each secondary
    next_position: RwLock<HashMap<MemberId, LogPosition>>,
    /// Highest position each secondary acknowledged
    match_position: RwLock<HashMap<MemberId, LogPosition>>,
    /// Highest position acknowledged by a majority
    commit_position: RwLock<LogPosition>,
    /// One shipping pass per secondary at a time
    ship_locks: HashMap<MemberId, Mutex<()>>,
    /// Bumped whenever an acknowledgment arrives
    progress: watch::Sender<u64>,
}

impl LogShipper {
    pub async fn new(
        topology: Arc<TopologyStore>,
        state_tracker: Arc<StateTracker>,
        oplog: Arc<RwLock<OpLog>>,
        election: Arc<ElectionCoordinator>,
        transport: Arc<dyn Transport>,
        config: ReplicationConfig,
    ) -> Result<Self> {
        // A persisted commit position may point past the rebuilt oplog
        let persisted = state_tracker.commit_position().await?;
        let commit_position = persisted.min(oplog.read().await.last_position());
        let self_id = topology.self_id();
        let ship_locks = topology
            .descriptor()
            .members
            .iter()
            .filter(|m| m.id != self_id && m.is_data_bearing())
            .map(|m| (m.id, Mutex::new(())))
            .collect();
        let (progress, _) = watch::channel(0);

        Ok(Self {
            self_id,
            topology,
            state_tracker,
            oplog,
            election,
            transport,
            config,
            next_position: RwLock::new(HashMap::new()),
            match_position: RwLock::new(HashMap::new()),
            commit_position: RwLock::new(commit_position),
            ship_locks,
            progress,
        })
    }

    /// Highest position acknowledged by a majority
    pub async fn commit_position(&self) -> LogPosition {
        *self.commit_position.read().await
    }

    /// Highest position `id` is known to hold
    pub async fn match_position(&self, id: MemberId) -> LogPosition {
        self.match_position.read().await.get(&id).copied().unwrap_or(0)
    }

    /// Reset per-secondary progress after winning `term` and mark the start
    /// of the term in the log.
    pub async fn on_elected(&self, term: Term) -> Result<LogPosition> {
        let position = {
            let mut log = self.oplog.write().await;
            let last = log.last_position();

            let mut matched = self.match_position.write().await;
            let mut next = self.next_position.write().await;
            next.clear();
            matched.clear();
            for &id in self.ship_locks.keys() {
                next.insert(id, last + 1);
                matched.insert(id, 0);
            }

            log.append(
                term,
                Operation::Noop {
                    message: format!("new primary {} for term {}", self.self_id, term),
                },
            )
        };

        self.topology.update_log_position(self.self_id, position).await;
        tracing::info!("Member {} primary for term {}, log at {}", self.self_id, term, position);

        self.ship_all().await;
        Ok(position)
    }

    /// Accept a client write and wait until it satisfies `write_concern`.
    ///
    /// Fails with `NotPrimary` on a secondary and with `QuorumUnavailable`
    /// when the concern cannot be met by the topology or was not met within
    /// the write timeout. The concern is never weakened.
    pub async fn write(&self, operation: Operation, write_concern: WriteConcern) -> Result<WriteAck> {
        let term = match self.election.primary_term().await {
            Some(term) => term,
            None => {
                return Err(Error::NotPrimary {
                    primary: self.topology.primary().await.map(|(id, _)| id),
                })
            }
        };

        let descriptor = self.topology.descriptor();
        let data_bearing = descriptor.members.iter().filter(|m| m.is_data_bearing()).count();
        let data_bearing_voters = descriptor
            .members
            .iter()
            .filter(|m| m.is_data_bearing() && m.is_voting())
            .count();
        let required = write_concern.required_acks(descriptor.voting_count(), data_bearing_voters, data_bearing)?;

        let position = self.oplog.write().await.append(term, operation);
        self.topology.update_log_position(self.self_id, position).await;
        tracing::debug!(
            "Write at position {} in term {} waiting for w:{} ({} acks)",
            position,
            term,
            write_concern,
            required
        );

        let deadline = Instant::now() + self.config.write_timeout();
        let wait = self.await_acks(position, term, write_concern, required, deadline);
        tokio::pin!(wait);
        let ship = self.ship_all();
        tokio::pin!(ship);
        let mut shipped = false;

        loop {
            tokio::select! {
                outcome = &mut wait => return outcome,
                _ = &mut ship, if !shipped => shipped = true,
            }
        }
    }

    async fn await_acks(
        &self,
        position: LogPosition,
        term: Term,
        write_concern: WriteConcern,
        required: usize,
        deadline: Instant,
    ) -> Result<WriteAck> {
        let mut progress = self.progress.subscribe();

        loop {
            let acked = self.count_acks(position, write_concern).await;
            if acked >= required {
                return Ok(WriteAck { position, term, acked });
            }
            if self.election.primary_term().await != Some(term) {
                return Err(Error::NotPrimary {
                    primary: self.topology.primary().await.map(|(id, _)| id),
                });
            }

            match timeout_at(deadline, progress.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::ShuttingDown),
                Err(_) => {
                    let acked = self.count_acks(position, write_concern).await;
                    if acked >= required {
                        return Ok(WriteAck { position, term, acked });
                    }
                    tracing::warn!(
                        "Write at position {} timed out with {}/{} acknowledgments",
                        position,
                        acked,
                        required
                    );
                    return Err(Error::QuorumUnavailable { acked, required });
                }
            }
        }
    }

    /// Members holding `position` that count towards `write_concern`
    async fn count_acks(&self, position: LogPosition, write_concern: WriteConcern) -> usize {
        let members = self.topology.members().await;
        let last = self.oplog.read().await.last_position();
        let matched = self.match_position.read().await;

        members
            .iter()
            .filter(|m| counts_towards(m, write_concern))
            .filter(|m| {
                let held = if m.id() == self.self_id {
                    last
                } else {
                    matched.get(&m.id()).copied().unwrap_or(0)
                };
                held >= position
            })
            .count()
    }

    /// Ship to every data-bearing secondary
    pub async fn ship_all(&self) {
        let targets: Vec<Member> = self
            .topology
            .peers()
            .await
            .into_iter()
            .filter(|m| !m.is_arbiter())
            .collect();

        let passes = targets.iter().map(|member| async move {
            if let Err(e) = self.ship_to(member.id(), member.host()).await {
                tracing::debug!("Shipping to member {} failed: {}", member.id(), e);
            }
        });
        futures::future::join_all(passes).await;
    }

    /// Background pass: ship, then refresh staleness for members that
    /// were not reached.
    pub async fn tick(&self) -> Result<()> {
        if !self.election.is_primary().await {
            return Ok(());
        }
        self.ship_all().await;

        let last = self.oplog.read().await.last_position();
        for id in self.ship_locks.keys().copied().collect::<Vec<_>>() {
            let matched = self.match_position(id).await;
            self.refresh_staleness(id, matched, last).await;
        }
        Ok(())
    }

    /// Push entries to one secondary until it has caught up, it rejects
    /// repeatedly, or this member stops being primary.
    async fn ship_to(&self, id: MemberId, host: &str) -> Result<()> {
        let Some(lock) = self.ship_locks.get(&id) else {
            return Err(Error::MemberNotFound(id));
        };
        // Heartbeats bring it back
        if self.topology.member(id).await.map(|m| m.health) == Some(MemberHealth::Unreachable) {
            return Err(Error::UnreachableMember(id));
        }
        let _guard = lock.lock().await;

        for _ in 0..MAX_SHIP_ROUNDS {
            let Some(term) = self.election.primary_term().await else {
                return Ok(());
            };

            let (request, last, sent) = {
                let log = self.oplog.read().await;
                let last = log.last_position();
                let next = {
                    let mut next_position = self.next_position.write().await;
                    let next = next_position.entry(id).or_insert(last + 1);
                    if *next > last + 1 {
                        *next = last + 1;
                    }
                    *next
                };
                let prev_position = next - 1;
                let prev_term = log.term_at(prev_position).unwrap_or(0);
                let entries = log.entries_from(next, self.config.max_batch_entries);
                let sent = prev_position + entries.len() as LogPosition;

                let request = Message::AppendEntries {
                    set_name: self.topology.set_name().to_string(),
                    term,
                    primary_id: self.self_id,
                    prev_position,
                    prev_term,
                    entries,
                    commit_position: *self.commit_position.read().await,
                };
                (request, last, sent)
            };

            let response = match timeout(self.config.write_timeout(), self.transport.send(host, request)).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::ConnectionTimeout(host.to_string())),
            };

            match response {
                Message::AppendEntriesResponse {
                    term: member_term,
                    success,
                    match_position,
                    ..
                } => {
                    if member_term > term {
                        tracing::info!(
                            "Member {} reports term {} above ours ({})",
                            id,
                            member_term,
                            term
                        );
                        self.election.observe_term(member_term, None).await?;
                        return Err(Error::StaleTerm {
                            received: term,
                            current: member_term,
                        });
                    }

                    if success {
                        self.record_match(id, match_position).await?;
                        self.refresh_staleness(id, match_position, last).await;
                        if match_position >= last || sent >= last {
                            return Ok(());
                        }
                    } else {
                        let mut next_position = self.next_position.write().await;
                        let next = next_position.entry(id).or_insert(1);
                        let rewound = (match_position + 1).min(next.saturating_sub(1)).max(1);
                        tracing::debug!(
                            "Member {} rejected entries before {}, rewinding to {}",
                            id,
                            *next,
                            rewound
                        );
                        *next = rewound;
                    }
                }
                Message::Error { code, message } => {
                    return Err(Error::Network(format!("{:?}: {}", code, message)));
                }
                other => {
                    return Err(Error::Network(format!(
                        "Unexpected {} in reply to AppendEntries",
                        other.type_name()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Record that `id` holds everything up to `position`
    async fn record_match(&self, id: MemberId, position: LogPosition) -> Result<()> {
        {
            let mut matched = self.match_position.write().await;
            let entry = matched.entry(id).or_insert(0);
            if position > *entry {
                *entry = position;
            }
            let mut next_position = self.next_position.write().await;
            next_position.insert(id, *entry + 1);
        }
        self.topology.update_log_position(id, position).await;
        self.advance_commit().await?;
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
        Ok(())
    }

    /// Mark a member stale when it lags too far, clear it once it is back
    /// within the lag limit and holds the commit position
    async fn refresh_staleness(&self, id: MemberId, matched: LogPosition, last: LogPosition) {
        let lag = last.saturating_sub(matched);
        let Some(member) = self.topology.member(id).await else {
            return;
        };

        if lag > self.config.max_lag_entries {
            if !member.stale {
                self.topology.set_stale(id, true).await;
            }
        } else if member.stale && matched >= self.commit_position().await {
            if self.topology.set_stale(id, false).await {
                self.progress.send_modify(|n| *n = n.wrapping_add(1));
            }
        }
    }

    /// Raise the commit position to the highest entry of the current term
    /// held by a majority of data-bearing voters.
    async fn advance_commit(&self) -> Result<()> {
        let Some(term) = self.election.primary_term().await else {
            return Ok(());
        };

        let majority = self.topology.majority();
        let members = self.topology.members().await;
        let candidate = {
            let log = self.oplog.read().await;
            let matched = self.match_position.read().await;
            let mut held: Vec<LogPosition> = members
                .iter()
                .filter(|m| counts_towards(m, WriteConcern::Majority))
                .map(|m| {
                    if m.id() == self.self_id {
                        log.last_position()
                    } else {
                        matched.get(&m.id()).copied().unwrap_or(0)
                    }
                })
                .collect();
            if held.len() < majority {
                return Ok(());
            }
            held.sort_unstable_by(|a, b| b.cmp(a));
            let position = held[majority - 1];
            if log.term_at(position) != Some(term) {
                return Ok(());
            }
            position
        };

        let advanced = {
            let mut commit = self.commit_position.write().await;
            if candidate > *commit {
                *commit = candidate;
                true
            } else {
                false
            }
        };
        if advanced {
            self.state_tracker.set_commit_position(candidate).await?;
            tracing::trace!("Commit position advanced to {}", candidate);
        }
        Ok(())
    }

    /// Run the background shipping loop until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.ship_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Replication error: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Lag of every secondary behind the primary's log
    pub async fn lag(&self) -> HashMap<MemberId, u64> {
        let last = self.oplog.read().await.last_position();
        let matched = self.match_position.read().await;
        self.ship_locks
            .keys()
            .map(|id| (*id, last.saturating_sub(matched.get(id).copied().unwrap_or(0))))
            .collect()
    }

    /// How long a write waits for its concern
    pub fn write_timeout(&self) -> Duration {
        self.config.write_timeout()
    }
}

/// Whether an acknowledgment from `member` counts towards `write_concern`
fn counts_towards(member: &Member, write_concern: WriteConcern) -> bool {
    if member.is_arbiter() || member.stale {
        return false;
    }
    write_concern.counts_non_voting() || member.is_voting()
}
