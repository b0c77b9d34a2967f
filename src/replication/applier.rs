//! Oplog Applier
//!
//! Secondary side of replication: accepts entries pushed by the primary in
//! strict position order and applies them idempotently.

use std::sync::Arc;
use tokio::sync::RwLock;

use super::oplog::{AppendOutcome, LogPosition, OpEntry, OpLog};
use super::Message;
use crate::election::ElectionCoordinator;
use crate::error::Result;
use crate::state::StateTracker;
use crate::topology::{MemberId, Term, TopologyStore};

/// Applies shipped entries on a secondary
pub struct OplogApplier {
    self_id: MemberId,
    topology: Arc<TopologyStore>,
    state_tracker: Arc<StateTracker>,
    oplog: Arc<RwLock<OpLog>>,
    election: Arc<ElectionCoordinator>,
    /// Commit position advertised by the primary
    commit_position: RwLock<LogPosition>,
}

impl OplogApplier {
    pub async fn new(
        topology: Arc<TopologyStore>,
        state_tracker: Arc<StateTracker>,
        oplog: Arc<RwLock<OpLog>>,
        election: Arc<ElectionCoordinator>,
    ) -> Result<Self> {
        // Never ahead of what this member holds
        let persisted = state_tracker.commit_position().await?;
        let commit_position = persisted.min(oplog.read().await.last_position());
        Ok(Self {
            self_id: topology.self_id(),
            topology,
            state_tracker,
            oplog,
            election,
            commit_position: RwLock::new(commit_position),
        })
    }

    /// Commit position last advertised by the primary
    pub async fn commit_position(&self) -> LogPosition {
        *self.commit_position.read().await
    }

    fn response(&self, term: Term, success: bool, match_position: LogPosition) -> Message {
        Message::AppendEntriesResponse {
            member_id: self.self_id,
            term,
            success,
            match_position,
        }
    }

    /// Handle an append entries request from the primary
    pub async fn handle_append_entries(
        &self,
        term: Term,
        primary_id: MemberId,
        prev_position: LogPosition,
        prev_term: Term,
        entries: Vec<OpEntry>,
        commit_position: LogPosition,
    ) -> Result<Message> {
        let current_term = self.election.term();

        // Reject if term is stale
        if term < current_term {
            let last = self.oplog.read().await.last_position();
            tracing::debug!(
                "Rejecting entries from member {} at stale term {} (current {})",
                primary_id,
                term,
                current_term
            );
            return Ok(self.response(current_term, false, last));
        }

        // Learn the term and the primary elected in it
        if let Err(e) = self.election.observe_term(term, Some(primary_id)).await {
            tracing::warn!("Rejecting entries from member {}: {}", primary_id, e);
            let last = self.oplog.read().await.last_position();
            return Ok(self.response(self.election.term(), false, last));
        }
        self.topology.touch_primary().await;

        let count = entries.len() as LogPosition;
        let last = {
            let mut log = self.oplog.write().await;

            // Check log consistency
            if !log.matches(prev_position, prev_term) {
                let last = log.last_position();
                tracing::debug!(
                    "Log mismatch at {} (term {}), local log ends at {}",
                    prev_position,
                    prev_term,
                    last
                );
                return Ok(self.response(term, false, last.min(prev_position.saturating_sub(1))));
            }

            for entry in entries {
                let position = entry.position;
                match log.append_replicated(entry) {
                    Ok(AppendOutcome::Appended) | Ok(AppendOutcome::Duplicate) => {}
                    Ok(AppendOutcome::Replaced { truncated }) => {
                        tracing::warn!(
                            "Discarded {} entries from position {} written under an older term",
                            truncated,
                            position
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Cannot apply entry at position {}: {}", position, e);
                        let last = log.last_position();
                        return Ok(self.response(term, false, last));
                    }
                }
            }
            log.last_position()
        };

        self.state_tracker.set_last_applied_position(last).await?;
        self.topology.update_log_position(self.self_id, last).await;

        let matched = prev_position + count;
        let committed = commit_position.min(matched);
        {
            let mut commit = self.commit_position.write().await;
            if committed > *commit {
                *commit = committed;
                self.state_tracker.set_commit_position(committed).await?;
            }
        }

        if count > 0 {
            tracing::trace!("Applied {} entries, log at {}", count, last);
        }
        Ok(self.response(term, true, matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::ElectionConfig;
    use crate::network::{LocalNetwork, Transport};
    use crate::replication::Operation;
    use crate::topology::TopologyDescriptor;

    fn entry(position: LogPosition, term: Term) -> OpEntry {
        OpEntry {
            position,
            term,
            timestamp: chrono::Utc::now(),
            operation: Operation::Insert {
                collection: "users".into(),
                document: format!(r#"{{"_id":{}}}"#, position),
            },
        }
    }

    async fn applier() -> (OplogApplier, Arc<RwLock<OpLog>>, Arc<TopologyStore>) {
        applier_with(Arc::new(StateTracker::in_memory(1).unwrap())).await
    }

    async fn applier_with(tracker: Arc<StateTracker>) -> (OplogApplier, Arc<RwLock<OpLog>>, Arc<TopologyStore>) {
        let topology = Arc::new(TopologyStore::new(TopologyDescriptor::sample(), 1).unwrap());
        let oplog = Arc::new(RwLock::new(OpLog::new()));
        let network = LocalNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.transport("mongodb-secondary:27017"));
        let election = Arc::new(
            ElectionCoordinator::new(
                Arc::clone(&topology),
                Arc::clone(&tracker),
                Arc::clone(&oplog),
                transport,
                ElectionConfig::default(),
            )
            .await
            .unwrap(),
        );
        let applier = OplogApplier::new(Arc::clone(&topology), tracker, Arc::clone(&oplog), election)
            .await
            .unwrap();
        (applier, oplog, topology)
    }

    fn outcome(message: &Message) -> (Term, bool, LogPosition) {
        match message {
            Message::AppendEntriesResponse { term, success, match_position, .. } => {
                (*term, *success, *match_position)
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_applies_in_order_and_learns_primary() {
        let (applier, oplog, topology) = applier().await;

        let response = applier
            .handle_append_entries(1, 0, 0, 0, vec![entry(1, 1), entry(2, 1)], 1)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (1, true, 2));
        assert_eq!(oplog.read().await.last_position(), 2);
        assert_eq!(applier.commit_position().await, 1);
        assert_eq!(topology.primary().await, Some((0, 1)));

        // Redelivery is idempotent
        let response = applier
            .handle_append_entries(1, 0, 0, 0, vec![entry(1, 1), entry(2, 1)], 2)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (1, true, 2));
        assert_eq!(oplog.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_missing_prev() {
        let (applier, _, _) = applier().await;
        applier
            .handle_append_entries(1, 0, 0, 0, vec![entry(1, 1)], 0)
            .await
            .unwrap();

        let response = applier
            .handle_append_entries(1, 0, 4, 1, vec![entry(5, 1)], 0)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (1, false, 1));
    }

    #[tokio::test]
    async fn test_rejects_stale_term() {
        let (applier, _, _) = applier().await;
        applier.handle_append_entries(3, 0, 0, 0, vec![], 0).await.unwrap();

        let response = applier
            .handle_append_entries(2, 0, 0, 0, vec![entry(1, 2)], 0)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (3, false, 0));
    }

    #[tokio::test]
    async fn test_truncates_older_term_suffix() {
        let (applier, oplog, _) = applier().await;
        applier
            .handle_append_entries(1, 0, 0, 0, vec![entry(1, 1), entry(2, 1), entry(3, 1)], 0)
            .await
            .unwrap();

        let response = applier
            .handle_append_entries(2, 0, 1, 1, vec![entry(2, 2)], 0)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (2, true, 2));
        let log = oplog.read().await;
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.last_term(), 2);
    }

    #[tokio::test]
    async fn test_restart_commit_not_ahead_of_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf(), 1).unwrap();
            tracker.set_commit_position(50).await.unwrap();
        }

        let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), 1).unwrap());
        let (applier, oplog, _) = applier_with(tracker).await;
        assert_eq!(oplog.read().await.last_position(), 0);
        assert_eq!(applier.commit_position().await, 0);

        // Commit follows what has been applied, not what the primary advertises
        let response = applier
            .handle_append_entries(1, 0, 0, 0, vec![entry(1, 1), entry(2, 1)], 50)
            .await
            .unwrap();
        assert_eq!(outcome(&response), (1, true, 2));
        assert_eq!(applier.commit_position().await, 2);
    }
}
