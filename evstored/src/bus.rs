//! Queues connecting the actors
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::message::{
    ClientMessage, ElectionMessage, GossipMessage, Message, ReplicationMessage, StorageMessage,
    SystemMessage,
};

pub trait Publisher: Send + Sync {
    fn publish(&self, msg: Message);
}

impl Publisher for flume::Sender<Message> {
    fn publish(&self, msg: Message) {
        if self.send(msg).is_err() {
            // receiver is gone only while the node is going down
            trace!("Queue disconnected, message dropped");
        }
    }
}

/// Queues of all the actors behind the controller
#[derive(Clone)]
pub struct OutputBus {
    pub elections: flume::Sender<Message>,
    pub gossip: flume::Sender<Message>,
    pub storage_writer: flume::Sender<Message>,
    pub storage_chaser: flume::Sender<Message>,
    pub replica: flume::Sender<Message>,
    pub master_replication: flume::Sender<Message>,
    pub timer: flume::Sender<Message>,
    pub peer: flume::Sender<Message>,
}

/// Receiving ends matching an [`OutputBus`]
pub struct OutputQueues {
    pub elections: flume::Receiver<Message>,
    pub gossip: flume::Receiver<Message>,
    pub storage_writer: flume::Receiver<Message>,
    pub storage_chaser: flume::Receiver<Message>,
    pub replica: flume::Receiver<Message>,
    pub master_replication: flume::Receiver<Message>,
    pub timer: flume::Receiver<Message>,
    pub peer: flume::Receiver<Message>,
}

impl OutputBus {
    pub fn new() -> (Self, OutputQueues) {
        let (elections_tx, elections_rx) = flume::unbounded();
        let (gossip_tx, gossip_rx) = flume::unbounded();
        let (storage_writer_tx, storage_writer_rx) = flume::unbounded();
        let (storage_chaser_tx, storage_chaser_rx) = flume::unbounded();
        let (replica_tx, replica_rx) = flume::unbounded();
        let (master_replication_tx, master_replication_rx) = flume::unbounded();
        let (timer_tx, timer_rx) = flume::unbounded();
        let (peer_tx, peer_rx) = flume::unbounded();
        (
            Self {
                elections: elections_tx,
                gossip: gossip_tx,
                storage_writer: storage_writer_tx,
                storage_chaser: storage_chaser_tx,
                replica: replica_tx,
                master_replication: master_replication_tx,
                timer: timer_tx,
                peer: peer_tx,
            },
            OutputQueues {
                elections: elections_rx,
                gossip: gossip_rx,
                storage_writer: storage_writer_rx,
                storage_chaser: storage_chaser_rx,
                replica: replica_rx,
                master_replication: master_replication_rx,
                timer: timer_rx,
                peer: peer_rx,
            },
        )
    }

    fn targets(&self, msg: &Message) -> Vec<&flume::Sender<Message>> {
        match msg {
            Message::System(m) => match m {
                SystemMessage::SystemInit => vec![
                    &self.elections,
                    &self.gossip,
                    &self.storage_writer,
                    &self.storage_chaser,
                    &self.master_replication,
                ],
                SystemMessage::WaitForChaserToCatchUp { .. } => vec![&self.storage_chaser],
                SystemMessage::WriteEpoch => vec![&self.storage_writer],
                SystemMessage::BecomeShuttingDown { .. } => vec![
                    &self.elections,
                    &self.gossip,
                    &self.storage_writer,
                    &self.storage_chaser,
                    &self.replica,
                    &self.master_replication,
                ],
                m if m.new_state().is_some() => vec![
                    &self.gossip,
                    &self.storage_writer,
                    &self.storage_chaser,
                    &self.replica,
                    &self.master_replication,
                ],
                _ => vec![],
            },
            Message::Election(ElectionMessage::ElectionsDone { .. }) => vec![&self.gossip],
            Message::Election(_) => vec![&self.elections],
            Message::Gossip(GossipMessage::GossipReceived(_)) => vec![&self.gossip],
            Message::Gossip(GossipMessage::GossipUpdated(_)) => vec![&self.elections],
            Message::Replication(m) => match m {
                ReplicationMessage::ReconnectToMaster { .. }
                | ReplicationMessage::SubscribeToMaster { .. }
                | ReplicationMessage::AckLogPosition(_)
                | ReplicationMessage::HeartbeatTick { .. } => vec![&self.replica],
                ReplicationMessage::ReplicaSubscribed(_)
                | ReplicationMessage::CreateChunk(_)
                | ReplicationMessage::RawChunkBulk(_)
                | ReplicationMessage::DataChunkBulk(_) => vec![&self.storage_writer],
                ReplicationMessage::ReplicaSubscriptionRequest { .. }
                | ReplicationMessage::ReplicaLogPositionAck { .. }
                | ReplicationMessage::ReplicaWriteAck { .. }
                | ReplicationMessage::ReplicaConnectionClosed { .. } => {
                    vec![&self.master_replication]
                }
                ReplicationMessage::ReplicaSubscriptionRetry(_)
                | ReplicationMessage::SlaveAssignment(_)
                | ReplicationMessage::CloneAssignment(_) => vec![],
            },
            Message::Client(ClientMessage::WriteEvents { .. }) => vec![&self.storage_writer],
            Message::Client(ClientMessage::TcpForwardMessage(_)) => vec![&self.replica],
            Message::Client(_) => vec![],
            Message::Storage(StorageMessage::CommitAck { .. }) => vec![&self.replica],
            Message::Storage(_) => vec![&self.master_replication],
            Message::Timer(_) => vec![&self.timer],
            Message::Peer(_) => vec![&self.peer],
        }
    }
}

impl Publisher for OutputBus {
    fn publish(&self, msg: Message) {
        let targets = self.targets(&msg);
        match targets.split_last() {
            None => debug!(?msg, "Message has no handler"),
            Some((last, rest)) => {
                for tx in rest {
                    tx.publish(msg.clone());
                }
                last.publish(msg);
            }
        }
    }
}

/// How often actors waiting on their queues check the shutdown flag
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drain `rx` into `handle` until the queue is gone or the node is shutting down
///
/// `handle` returns `false` when the actor is done.
pub fn run_queue(
    rx: &flume::Receiver<Message>,
    is_node_shutting_down: &Arc<AtomicBool>,
    mut handle: impl FnMut(Message) -> bool,
) {
    while !is_node_shutting_down.load(Ordering::SeqCst) {
        match rx.recv_timeout(QUEUE_POLL_INTERVAL) {
            Ok(msg) => {
                if !handle(msg) {
                    return;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use evstored_api::{CorrelationId, EpochId, MemberInfo, NodeId, VNodeState};

    use super::*;

    fn member() -> MemberInfo {
        let addr = SocketAddr::from_str("127.0.0.1:1112").expect("valid addr");
        MemberInfo {
            instance_id: NodeId::new_random(),
            time_stamp: 0,
            state: VNodeState::Master,
            is_alive: true,
            internal_tcp: addr,
            internal_secure_tcp: None,
            external_tcp: addr,
            external_secure_tcp: None,
            external_http: addr,
            last_commit_position: -1,
            writer_checkpoint: 0,
            chaser_checkpoint: 0,
            epoch_position: -1,
            epoch_number: -1,
            epoch_id: EpochId::nil(),
            node_priority: 0,
        }
    }

    #[test]
    fn elections_outcome_goes_to_gossip_only() {
        let (bus, queues) = OutputBus::new();

        bus.publish(
            ElectionMessage::ElectionsDone {
                view: 0,
                master: member(),
            }
            .into(),
        );

        assert!(matches!(
            queues.gossip.try_recv(),
            Ok(Message::Election(ElectionMessage::ElectionsDone { view: 0, .. }))
        ));
        assert!(queues.elections.is_empty());
        assert!(queues.storage_writer.is_empty());
        assert!(queues.replica.is_empty());
    }

    #[test]
    fn shutdown_reaches_every_service_but_timer_and_peer() {
        let (bus, queues) = OutputBus::new();

        bus.publish(
            SystemMessage::BecomeShuttingDown {
                correlation_id: CorrelationId::new_random(),
                exit_process: false,
            }
            .into(),
        );

        for rx in [
            &queues.elections,
            &queues.gossip,
            &queues.storage_writer,
            &queues.storage_chaser,
            &queues.replica,
            &queues.master_replication,
        ] {
            assert_eq!(rx.len(), 1);
        }
        assert!(queues.timer.is_empty());
        assert!(queues.peer.is_empty());
    }
}
