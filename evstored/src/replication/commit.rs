use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use evstored_api::{CorrelationId, SubscriptionId};

use crate::message::Envelope;

/// A client write stored on the master, waiting for the commit quorum
#[derive(Debug)]
pub struct PendingWrite {
    pub correlation_id: CorrelationId,
    pub envelope: Envelope,
    pub first_position: i64,
    pub end_position: i64,
    pub deadline: Instant,
}

/// Quorum commit bookkeeping of the master
///
/// A position is committed once the master and enough `Slave` replicas
/// have it durable to form a majority of the cluster.
#[derive(Debug)]
pub struct CommitTracker {
    cluster_size: usize,
    commit_timeout: Duration,
    master_position: i64,
    /// Durable position of every `Slave`, by subscription
    acks: HashMap<SubscriptionId, i64>,
    /// In write order, so also ordered by position and deadline
    pending: VecDeque<PendingWrite>,
    commit_position: i64,
}

impl CommitTracker {
    pub fn new(cluster_size: usize, commit_timeout: Duration) -> Self {
        Self {
            cluster_size,
            commit_timeout,
            master_position: -1,
            acks: HashMap::new(),
            pending: VecDeque::new(),
            commit_position: -1,
        }
    }

    pub fn quorum(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    pub fn commit_position(&self) -> i64 {
        self.commit_position
    }

    pub fn slave_count(&self) -> usize {
        self.acks.len()
    }

    pub fn add_pending(
        &mut self,
        correlation_id: CorrelationId,
        envelope: Envelope,
        first_position: i64,
        end_position: i64,
        now: Instant,
    ) {
        self.pending.push_back(PendingWrite {
            correlation_id,
            envelope,
            first_position,
            end_position,
            deadline: now + self.commit_timeout,
        });
    }

    pub fn master_flushed(&mut self, position: i64) {
        self.master_position = self.master_position.max(position);
        self.recompute();
    }

    /// A `Slave` got its log durable up to `position`
    pub fn replica_acked(&mut self, subscription_id: SubscriptionId, position: i64) {
        let acked = self.acks.entry(subscription_id).or_insert(-1);
        *acked = (*acked).max(position);
        self.recompute();
    }

    /// A replica starts counting toward the quorum
    pub fn add_slave(&mut self, subscription_id: SubscriptionId, position: i64) {
        self.replica_acked(subscription_id, position);
    }

    pub fn remove_slave(&mut self, subscription_id: SubscriptionId) {
        self.acks.remove(&subscription_id);
    }

    fn recompute(&mut self) {
        let mut positions: Vec<_> = std::iter::once(self.master_position)
            .chain(self.acks.values().copied())
            .collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(quorum_position) = positions.get(self.quorum() - 1) {
            self.commit_position = self.commit_position.max(*quorum_position);
        }
    }

    /// Writes that are now fully committed
    pub fn take_committed(&mut self) -> Vec<PendingWrite> {
        let mut committed = vec![];
        while self
            .pending
            .front()
            .map_or(false, |w| w.end_position <= self.commit_position)
        {
            committed.extend(self.pending.pop_front());
        }
        committed
    }

    /// Writes whose commit timeout expired
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<PendingWrite> {
        let mut timed_out = vec![];
        while self.pending.front().map_or(false, |w| w.deadline <= now) {
            timed_out.extend(self.pending.pop_front());
        }
        timed_out
    }

    /// Forget everything, returning the writes that were still pending
    pub fn reset(&mut self) -> Vec<PendingWrite> {
        self.acks.clear();
        self.master_position = -1;
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::Channel(flume::unbounded().0)
    }

    #[test]
    fn single_node_commits_on_flush() {
        let mut tracker = CommitTracker::new(1, Duration::from_secs(2));
        let now = Instant::now();
        tracker.add_pending(CorrelationId::new_random(), envelope(), 0, 100, now);
        assert!(tracker.take_committed().is_empty());

        tracker.master_flushed(100);
        assert_eq!(tracker.take_committed().len(), 1);
        assert_eq!(tracker.commit_position(), 100);
    }

    #[test]
    fn three_nodes_need_one_slave_ack() {
        let mut tracker = CommitTracker::new(3, Duration::from_secs(2));
        let now = Instant::now();
        let slave = SubscriptionId::new_random();
        tracker.add_slave(slave, 0);
        tracker.add_pending(CorrelationId::new_random(), envelope(), 0, 100, now);
        tracker.add_pending(CorrelationId::new_random(), envelope(), 100, 200, now);

        tracker.master_flushed(200);
        assert!(tracker.take_committed().is_empty());

        tracker.replica_acked(slave, 150);
        let committed = tracker.take_committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].end_position, 100);

        // acks never move backwards
        tracker.replica_acked(slave, 50);
        assert_eq!(tracker.commit_position(), 150);

        tracker.replica_acked(slave, 200);
        assert_eq!(tracker.take_committed().len(), 1);
    }

    #[test]
    fn commit_is_the_quorum_th_highest_position() {
        let mut tracker = CommitTracker::new(5, Duration::from_secs(2));
        let slaves: Vec<_> = (0..4).map(|_| SubscriptionId::new_random()).collect();
        tracker.master_flushed(500);
        for (slave, position) in slaves.iter().zip([100, 400, 300, 200]) {
            tracker.replica_acked(*slave, position);
        }
        // 500, 400, 300 | 200, 100
        assert_eq!(tracker.commit_position(), 300);

        tracker.remove_slave(slaves[1]);
        assert_eq!(tracker.slave_count(), 3);
        // never decreases even after losing a slave
        assert_eq!(tracker.commit_position(), 300);
    }

    #[test]
    fn writes_time_out_in_order() {
        let mut tracker = CommitTracker::new(3, Duration::from_millis(100));
        let start = Instant::now();
        tracker.add_pending(CorrelationId::new_random(), envelope(), 0, 100, start);
        tracker.add_pending(
            CorrelationId::new_random(),
            envelope(),
            100,
            200,
            start + Duration::from_millis(50),
        );

        assert!(tracker.take_timed_out(start).is_empty());
        let timed_out = tracker.take_timed_out(start + Duration::from_millis(120));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].first_position, 0);
        assert_eq!(tracker.reset().len(), 1);
    }
}
