//! Heartbeat Monitor
//!
//! Probes every other data-bearing member on a fixed interval, keeps the
//! topology's liveness fields current and signals primary loss to the
//! election loop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use super::HeartbeatConfig;
use crate::election::ElectionCoordinator;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::replication::{LogPosition, Message};
use crate::topology::{Member, MemberId, MemberRole, Term, TopologyStore};

/// Primary-loss signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryLoss {
    /// Primary that became unreachable; `None` when no primary has been
    /// known for longer than the election timeout
    pub lost: Option<MemberId>,
    /// Term of the lost primary, or the current term
    pub term: Term,
}

struct Presence {
    /// Randomized election timeout currently armed
    timeout: Duration,
    /// Last absence signal
    last_signal: Option<Instant>,
}

/// Heartbeat monitor for one member
pub struct HeartbeatMonitor {
    self_id: MemberId,
    topology: Arc<TopologyStore>,
    election: Arc<ElectionCoordinator>,
    transport: Arc<dyn Transport>,
    config: HeartbeatConfig,
    loss_tx: mpsc::Sender<PrimaryLoss>,
    presence: Mutex<Presence>,
}

impl HeartbeatMonitor {
    pub fn new(
        topology: Arc<TopologyStore>,
        election: Arc<ElectionCoordinator>,
        transport: Arc<dyn Transport>,
        config: HeartbeatConfig,
        loss_tx: mpsc::Sender<PrimaryLoss>,
    ) -> Self {
        let timeout = election.config().random_timeout();
        Self {
            self_id: topology.self_id(),
            topology,
            election,
            transport,
            config,
            loss_tx,
            presence: Mutex::new(Presence {
                timeout,
                last_signal: None,
            }),
        }
    }

    /// Probe every target once, concurrently
    pub async fn probe_all(&self) {
        let targets = self.topology.probe_targets().await;
        let probes = targets.iter().map(|member| self.probe(member));
        futures::future::join_all(probes).await;
    }

    async fn probe(&self, member: &Member) {
        let request = Message::Heartbeat {
            set_name: self.topology.set_name().to_string(),
            from: self.self_id,
            term: self.election.term(),
        };

        let started = Instant::now();
        let result = match timeout(self.config.timeout(), self.transport.send(member.host(), request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(member.host().to_string())),
        };

        let outcome = match result {
            Ok(Message::HeartbeatResponse {
                term,
                role,
                log_position,
                primary,
                frozen,
                ..
            }) => {
                self.on_success(member.id(), started.elapsed(), term, role, log_position, primary, frozen)
                    .await
            }
            Ok(Message::Error { code, message }) => {
                Err(Error::Network(format!("{:?}: {}", code, message)))
            }
            Ok(other) => Err(Error::Network(format!(
                "Unexpected {} in reply to Heartbeat",
                other.type_name()
            ))),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            tracing::debug!("Heartbeat to member {} failed: {}", member.id(), e);
            if let Err(e) = self.on_failure(member.id()).await {
                tracing::warn!("Failed to record probe failure for member {}: {}", member.id(), e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_success(
        &self,
        id: MemberId,
        rtt: Duration,
        term: Term,
        role: MemberRole,
        log_position: LogPosition,
        primary: Option<MemberId>,
        frozen: bool,
    ) -> Result<()> {
        self.topology
            .record_probe_success(id, rtt, log_position, role)
            .await?;
        self.topology.set_frozen(id, frozen).await;

        // The member we recorded as primary no longer claims the role
        if let Some((current, primary_term)) = self.topology.primary().await {
            if current == id && role != MemberRole::Primary {
                self.election.forget_primary(id, primary_term).await;
            }
        }

        let claimed = if role == MemberRole::Primary { Some(id) } else { primary };
        if let Err(e) = self.election.observe_term(term, claimed).await {
            tracing::warn!("Heartbeat from member {}: {}", id, e);
        }
        Ok(())
    }

    async fn on_failure(&self, id: MemberId) -> Result<()> {
        let failure = self
            .topology
            .record_probe_failure(id, self.config.failure_threshold)
            .await?;

        if failure.became_unreachable && failure.was_primary {
            tracing::warn!("Primary {} of term {} is unreachable", id, failure.term);
            self.signal(PrimaryLoss {
                lost: Some(id),
                term: failure.term,
            });
        }
        Ok(())
    }

    /// Signal primary loss when no primary has been seen for longer than
    /// the election timeout. Returns true if a signal was sent.
    pub async fn check_primary_presence(&self) -> bool {
        if self.election.is_primary().await {
            return false;
        }

        let silent_for = self.topology.time_since_primary_seen().await;
        let mut presence = self.presence.lock().await;
        if silent_for < presence.timeout {
            return false;
        }
        if let Some(last) = presence.last_signal {
            if last.elapsed() < presence.timeout {
                return false;
            }
        }

        presence.last_signal = Some(Instant::now());
        presence.timeout = self.election.config().random_timeout();
        drop(presence);

        let lost = self.topology.primary().await;
        tracing::info!(
            "No primary seen for {:?} (last known: {:?})",
            silent_for,
            lost.map(|(id, _)| id)
        );
        self.signal(PrimaryLoss {
            lost: lost.map(|(id, _)| id),
            term: lost.map(|(_, term)| term).unwrap_or_else(|| self.election.term()),
        });
        true
    }

    fn signal(&self, loss: PrimaryLoss) {
        if let Err(e) = self.loss_tx.try_send(loss) {
            // A signal is already queued; the election loop will act on it
            tracing::debug!("Primary-loss signal dropped: {}", e);
        }
    }

    /// Probe on the configured interval until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                    self.check_primary_presence().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::ElectionConfig;
    use crate::network::LocalNetwork;
    use crate::replication::OpLog;
    use crate::state::StateTracker;
    use crate::topology::{MemberHealth, TopologyDescriptor};
    use tokio::sync::RwLock;

    async fn monitor(
        network: &Arc<LocalNetwork>,
        config: HeartbeatConfig,
        election_config: ElectionConfig,
    ) -> (HeartbeatMonitor, Arc<TopologyStore>, mpsc::Receiver<PrimaryLoss>) {
        let topology = Arc::new(TopologyStore::new(TopologyDescriptor::sample(), 1).unwrap());
        let tracker = Arc::new(StateTracker::in_memory(1).unwrap());
        let oplog = Arc::new(RwLock::new(OpLog::new()));
        let transport: Arc<dyn Transport> = Arc::new(network.transport("mongodb-secondary:27017"));
        let election = Arc::new(
            ElectionCoordinator::new(
                Arc::clone(&topology),
                tracker,
                oplog,
                Arc::clone(&transport),
                election_config,
            )
            .await
            .unwrap(),
        );
        let (loss_tx, loss_rx) = mpsc::channel(4);
        let monitor = HeartbeatMonitor::new(Arc::clone(&topology), election, transport, config, loss_tx);
        (monitor, topology, loss_rx)
    }

    #[tokio::test]
    async fn test_unreachable_primary_signals_loss() {
        // Nothing is registered for member 0, so every probe fails
        let network = LocalNetwork::new();
        let config = HeartbeatConfig {
            interval_ms: 10,
            timeout_ms: 50,
            failure_threshold: 2,
        };
        let (monitor, topology, mut loss_rx) = monitor(&network, config, ElectionConfig::default()).await;
        topology.assign_primary(0, 1).await.unwrap();

        monitor.probe_all().await;
        assert!(loss_rx.try_recv().is_err());
        assert_eq!(topology.member(0).await.unwrap().consecutive_failures, 1);

        monitor.probe_all().await;
        let loss = loss_rx.try_recv().unwrap();
        assert_eq!(loss, PrimaryLoss { lost: Some(0), term: 1 });
        assert_eq!(topology.member(0).await.unwrap().health, MemberHealth::Unreachable);

        // Arbiters are never probed
        assert_eq!(topology.member(2).await.unwrap().health, MemberHealth::Unknown);
    }

    #[tokio::test]
    async fn test_absent_primary_signals_once_per_timeout() {
        let network = LocalNetwork::new();
        let election_config = ElectionConfig {
            timeout_min_ms: 20,
            timeout_max_ms: 30,
            ..Default::default()
        };
        let (monitor, _topology, mut loss_rx) =
            monitor(&network, HeartbeatConfig::default(), election_config).await;

        assert!(!monitor.check_primary_presence().await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(monitor.check_primary_presence().await);
        assert!(!monitor.check_primary_presence().await);

        let loss = loss_rx.try_recv().unwrap();
        assert_eq!(loss.lost, None);
        assert_eq!(loss.term, 0);
    }
}
