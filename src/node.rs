//! Replica Node
//!
//! Wires one member's components together, answers peer requests and runs
//! the background loops (heartbeats, log shipping, elections).

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::election::{ElectionConfig, ElectionCoordinator, ElectionState};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, PrimaryLoss};
use crate::network::{MessageHandler, Transport};
use crate::replication::{
    ErrorCode, LogShipper, MemberStatus, Message, NodeStatus, OpLog, Operation, OplogApplier,
    ReplicationConfig, WriteAck, WriteConcern,
};
use crate::state::StateTracker;
use crate::topology::{MemberId, MemberRole, Term, TopologyDescriptor, TopologyStore};

/// Tunables for one node
#[derive(Debug, Clone, Default)]
pub struct NodeSettings {
    pub heartbeat: HeartbeatConfig,
    pub election: ElectionConfig,
    pub replication: ReplicationConfig,
}

/// One member of the replica set
pub struct ReplicaNode {
    topology: Arc<TopologyStore>,
    state_tracker: Arc<StateTracker>,
    oplog: Arc<RwLock<OpLog>>,
    election: Arc<ElectionCoordinator>,
    shipper: Arc<LogShipper>,
    applier: Arc<OplogApplier>,
    monitor: Arc<HeartbeatMonitor>,
    loss_rx: Mutex<Option<mpsc::Receiver<PrimaryLoss>>>,
    settings: NodeSettings,
}

impl ReplicaNode {
    /// Build member `self_id` of the set described by `descriptor`
    pub async fn new(
        descriptor: TopologyDescriptor,
        self_id: MemberId,
        state_tracker: Arc<StateTracker>,
        transport: Arc<dyn Transport>,
        settings: NodeSettings,
    ) -> Result<Arc<Self>> {
        let topology = Arc::new(TopologyStore::new(descriptor, self_id)?);
        let oplog = Arc::new(RwLock::new(OpLog::new()));

        let election = Arc::new(
            ElectionCoordinator::new(
                Arc::clone(&topology),
                Arc::clone(&state_tracker),
                Arc::clone(&oplog),
                Arc::clone(&transport),
                settings.election.clone(),
            )
            .await?,
        );

        let shipper = Arc::new(
            LogShipper::new(
                Arc::clone(&topology),
                Arc::clone(&state_tracker),
                Arc::clone(&oplog),
                Arc::clone(&election),
                Arc::clone(&transport),
                settings.replication.clone(),
            )
            .await?,
        );

        let applier = Arc::new(
            OplogApplier::new(
                Arc::clone(&topology),
                Arc::clone(&state_tracker),
                Arc::clone(&oplog),
                Arc::clone(&election),
            )
            .await?,
        );

        let (loss_tx, loss_rx) = mpsc::channel(4);
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&topology),
            Arc::clone(&election),
            transport,
            settings.heartbeat.clone(),
            loss_tx,
        ));

        let self_member = topology.self_member().await?;
        tracing::info!(
            "Member {} ({}) of replica set {} ready: priority {}, {}",
            self_id,
            self_member.host(),
            topology.set_name(),
            self_member.priority(),
            if self_member.is_arbiter() { "arbiter" } else { "data-bearing" }
        );
        tracing::info!(
            "Restored term {}, last known primary {:?}, last applied position {}",
            election.term(),
            state_tracker.current_primary().await?,
            state_tracker.last_applied_position().await?
        );

        Ok(Arc::new(Self {
            topology,
            state_tracker,
            oplog,
            election,
            shipper,
            applier,
            monitor,
            loss_rx: Mutex::new(Some(loss_rx)),
            settings,
        }))
    }

    pub fn self_id(&self) -> MemberId {
        self.topology.self_id()
    }

    pub fn set_name(&self) -> &str {
        self.topology.set_name()
    }

    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn shipper(&self) -> &Arc<LogShipper> {
        &self.shipper
    }

    pub fn oplog(&self) -> &Arc<RwLock<OpLog>> {
        &self.oplog
    }

    pub fn state_tracker(&self) -> &Arc<StateTracker> {
        &self.state_tracker
    }

    /// Accept a client write; only the primary accepts writes
    pub async fn write(&self, operation: Operation, write_concern: Option<WriteConcern>) -> Result<WriteAck> {
        let write_concern = write_concern.unwrap_or(self.settings.replication.default_write_concern);
        self.shipper.write(operation, write_concern).await
    }

    /// Step down from primary
    pub async fn step_down(&self) -> Result<Term> {
        self.election.step_down().await
    }

    /// Current status of this node
    pub async fn status(&self) -> NodeStatus {
        let state = self.election.state().await;
        let (commit_position, lag) = if state.is_primary() {
            (self.shipper.commit_position().await, self.shipper.lag().await)
        } else {
            (self.applier.commit_position().await, HashMap::new())
        };

        NodeStatus {
            set_name: self.topology.set_name().to_string(),
            member_id: self.self_id(),
            state: state.name().to_string(),
            term: state.term(),
            primary: self.topology.primary().await.map(|(id, _)| id),
            last_position: self.oplog.read().await.last_position(),
            commit_position,
            members: self
                .topology
                .members()
                .await
                .iter()
                .map(MemberStatus::from)
                .collect(),
            lag,
        }
    }

    /// Role this member reports to heartbeats
    async fn reported_role(&self) -> MemberRole {
        match self.election.state().await {
            ElectionState::Primary { .. } => MemberRole::Primary,
            _ if self.topology.descriptor().member(self.self_id()).map(|m| m.arbiter_only).unwrap_or(false) => {
                MemberRole::Arbiter
            }
            _ => MemberRole::Secondary,
        }
    }

    fn reject(code: ErrorCode, message: impl Into<String>) -> Message {
        Message::Error {
            code,
            message: message.into(),
        }
    }

    async fn dispatch(&self, message: Message) -> Result<Message> {
        match message {
            Message::Heartbeat { set_name, from, term } => {
                if set_name != self.set_name() {
                    return Ok(Self::reject(ErrorCode::WrongReplicaSet, set_name));
                }
                if self.topology.member(from).await.is_none() {
                    return Ok(Self::reject(ErrorCode::UnknownMember, format!("member {}", from)));
                }
                if term > self.election.term() {
                    self.election.observe_term(term, None).await?;
                }

                let role = self.reported_role().await;
                let primary = if role == MemberRole::Primary {
                    Some(self.self_id())
                } else {
                    self.topology.primary().await.map(|(id, _)| id)
                };

                Ok(Message::HeartbeatResponse {
                    member_id: self.self_id(),
                    term: self.election.term(),
                    role,
                    log_position: self.oplog.read().await.last_position(),
                    primary,
                    frozen: self.election.is_frozen().await,
                })
            }

            Message::RequestVote {
                set_name,
                term,
                candidate_id,
                last_position,
                last_term,
                dry_run,
            } => {
                if set_name != self.set_name() {
                    return Ok(Self::reject(ErrorCode::WrongReplicaSet, set_name));
                }
                self.election
                    .handle_vote_request(term, candidate_id, last_position, last_term, dry_run)
                    .await
            }

            Message::AppendEntries {
                set_name,
                term,
                primary_id,
                prev_position,
                prev_term,
                entries,
                commit_position,
            } => {
                if set_name != self.set_name() {
                    return Ok(Self::reject(ErrorCode::WrongReplicaSet, set_name));
                }
                self.applier
                    .handle_append_entries(term, primary_id, prev_position, prev_term, entries, commit_position)
                    .await
            }

            Message::StatusRequest => Ok(Message::StatusResponse {
                status: self.status().await,
            }),

            other => Ok(Self::reject(
                ErrorCode::Unexpected,
                format!("{} is not a request", other.type_name()),
            )),
        }
    }

    /// Finish taking over after winning an election
    async fn on_elected(&self) {
        let Some(term) = self.election.primary_term().await else {
            return;
        };
        if let Err(e) = self.shipper.on_elected(term).await {
            tracing::error!("Failed to start term {} as primary: {}", term, e);
        }
    }

    async fn election_loop(&self, mut loss_rx: mpsc::Receiver<PrimaryLoss>, mut shutdown: watch::Receiver<bool>) {
        let mut takeover = tokio::time::interval(self.settings.heartbeat.interval());
        takeover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                loss = loss_rx.recv() => {
                    let Some(loss) = loss else { break };
                    // Signals raised while this one was queued say the same thing
                    while loss_rx.try_recv().is_ok() {}

                    // A campaign may sit in backoff for a while
                    let outcome = tokio::select! {
                        outcome = self.election.on_primary_loss(loss.lost, loss.term) => Some(outcome),
                        _ = shutdown_requested(&mut shutdown) => None,
                    };
                    match outcome {
                        Some(Ok(true)) => self.on_elected().await,
                        Some(Ok(false)) => {}
                        Some(Err(e)) => tracing::warn!("Election after primary loss failed: {}", e),
                        None => break,
                    }
                }
                _ = takeover.tick() => {
                    let outcome = tokio::select! {
                        outcome = self.election.check_priority_takeover() => Some(outcome),
                        _ = shutdown_requested(&mut shutdown) => None,
                    };
                    match outcome {
                        Some(Ok(true)) => self.on_elected().await,
                        Some(Ok(false)) => {}
                        Some(Err(e)) => tracing::warn!("Priority takeover failed: {}", e),
                        None => break,
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

    /// Run the background loops until `shutdown` turns true
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let loss_rx = self
            .loss_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("node is already running".into()))?;

        let monitor = Arc::clone(&self.monitor);
        let rx = shutdown.clone();
        let heartbeat = tokio::spawn(async move { monitor.run(rx).await });

        let shipper = Arc::clone(&self.shipper);
        let rx = shutdown.clone();
        let replication = tokio::spawn(async move { shipper.run(rx).await });

        let node = Arc::clone(self);
        let election = tokio::spawn(async move { node.election_loop(loss_rx, shutdown).await });

        let (heartbeat, replication, election) = tokio::join!(heartbeat, replication, election);
        for result in [heartbeat, replication, election] {
            if let Err(e) = result {
                tracing::error!("Background task failed: {}", e);
            }
        }

        tracing::info!("Member {} stopped", self.self_id());
        Ok(())
    }
}

/// Resolves once `shutdown` turns true or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl MessageHandler for ReplicaNode {
    async fn handle(&self, message: Message) -> Message {
        let kind = message.type_name();
        match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Failed to handle {}: {}", kind, e);
                Self::reject(ErrorCode::Internal, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;

    async fn node(network: &Arc<LocalNetwork>, id: MemberId) -> Arc<ReplicaNode> {
        node_with(network, id, NodeSettings::default()).await
    }

    async fn node_with(network: &Arc<LocalNetwork>, id: MemberId, settings: NodeSettings) -> Arc<ReplicaNode> {
        let descriptor = TopologyDescriptor::sample();
        let host = descriptor.member(id).unwrap().host.clone();
        let transport: Arc<dyn Transport> = Arc::new(network.transport(&host));
        let tracker = Arc::new(StateTracker::in_memory(id).unwrap());
        let node = ReplicaNode::new(descriptor, id, tracker, transport, settings)
            .await
            .unwrap();
        let handler: Arc<dyn MessageHandler> = node.clone();
        network.register(&host, &handler).await;
        node
    }

    #[tokio::test]
    async fn test_heartbeat_response() {
        let network = LocalNetwork::new();
        let arbiter = node(&network, 2).await;

        let response = arbiter
            .handle(Message::Heartbeat {
                set_name: "rs0".into(),
                from: 0,
                term: 3,
            })
            .await;

        match response {
            Message::HeartbeatResponse { member_id, term, role, primary, .. } => {
                assert_eq!(member_id, 2);
                assert_eq!(term, 3);
                assert_eq!(role, MemberRole::Arbiter);
                assert_eq!(primary, None);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_wrong_set_rejected() {
        let network = LocalNetwork::new();
        let secondary = node(&network, 1).await;

        let response = secondary
            .handle(Message::Heartbeat {
                set_name: "rs9".into(),
                from: 0,
                term: 1,
            })
            .await;
        assert!(matches!(
            response,
            Message::Error { code: ErrorCode::WrongReplicaSet, .. }
        ));

        let response = secondary
            .handle(Message::Heartbeat {
                set_name: "rs0".into(),
                from: 7,
                term: 1,
            })
            .await;
        assert!(matches!(
            response,
            Message::Error { code: ErrorCode::UnknownMember, .. }
        ));
    }

    #[tokio::test]
    async fn test_write_on_secondary_is_rejected() {
        let network = LocalNetwork::new();
        let secondary = node(&network, 1).await;

        let result = secondary
            .write(Operation::Noop { message: "x".into() }, None)
            .await;
        assert!(matches!(result, Err(Error::NotPrimary { primary: None })));

        let status = secondary.status().await;
        assert_eq!(status.state, "follower");
        assert_eq!(status.members.len(), 3);
    }

    #[tokio::test]
    async fn test_run_only_once() {
        let network = LocalNetwork::new();
        let member = node(&network, 1).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = Arc::clone(&member);
        let rx = shutdown_rx.clone();
        let task = tokio::spawn(async move { running.run(rx).await });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(member.run(shutdown_rx).await.is_err());
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_reports_commit_within_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf(), 1).unwrap();
            tracker.set_current_term(4).await.unwrap();
            tracker.set_current_primary(Some(0)).await.unwrap();
            tracker.set_last_applied_position(50).await.unwrap();
            tracker.set_commit_position(50).await.unwrap();
        }

        let network = LocalNetwork::new();
        let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), 1).unwrap());
        let transport: Arc<dyn Transport> = Arc::new(network.transport("mongodb-secondary:27017"));
        let member = ReplicaNode::new(TopologyDescriptor::sample(), 1, tracker, transport, NodeSettings::default())
            .await
            .unwrap();

        let status = member.status().await;
        assert_eq!(status.term, 4);
        assert_eq!(status.last_position, 0);
        assert!(status.commit_position <= status.last_position);
        assert!(status.lag.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_election_backoff() {
        // Alone on the network, member 0 loses every round
        let network = LocalNetwork::new();
        let settings = NodeSettings {
            heartbeat: HeartbeatConfig {
                interval_ms: 10,
                timeout_ms: 10,
                ..Default::default()
            },
            election: ElectionConfig {
                timeout_min_ms: 20,
                timeout_max_ms: 30,
                max_attempts: 5,
                backoff_base_ms: 10_000,
                backoff_max_ms: 10_000,
                jitter_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let member = node_with(&network, 0, settings).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = Arc::clone(&member);
        let task = tokio::spawn(async move { running.run(shutdown_rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!member.election().is_primary().await);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("run outlived shutdown")
            .unwrap()
            .unwrap();
    }
}
