//! Messages flowing through the node's queues
//!
//! Every actor owns a queue of [`Message`]s. Actors publish to the main
//! queue, the vnode controller decides what to do with each message in
//! its current state and forwards it to the actors that own it.
use std::net::SocketAddr;
use std::time::Duration;

use derive_more::From;
use evstored_api::peer::{self, PeerMessage};
use evstored_api::{
    CorrelationId, MasterEndpoints, MemberInfo, NodeId, OperationResult, SubscriptionId,
    VNodeState,
};

use crate::peer::ConnectionHandle;

#[derive(Clone, Debug, From)]
pub enum Message {
    System(SystemMessage),
    Election(ElectionMessage),
    Gossip(GossipMessage),
    Replication(ReplicationMessage),
    Client(ClientMessage),
    Storage(StorageMessage),
    Timer(TimerMessage),
    Peer(PeerSend),
}

#[derive(Clone, Debug)]
pub enum SystemMessage {
    SystemInit,
    SystemStart,
    ServiceInitialized {
        service: &'static str,
    },
    RequestShutdown,
    ServiceShutdown {
        service: &'static str,
    },
    ShutdownTimeout,

    BecomeUnknown {
        correlation_id: CorrelationId,
    },
    BecomePreReplica {
        correlation_id: CorrelationId,
        master: MemberInfo,
    },
    BecomeCatchingUp {
        correlation_id: CorrelationId,
        master: MemberInfo,
    },
    BecomeClone {
        correlation_id: CorrelationId,
        master: MemberInfo,
    },
    BecomeSlave {
        correlation_id: CorrelationId,
        master: MemberInfo,
    },
    BecomePreMaster {
        correlation_id: CorrelationId,
    },
    BecomeMaster {
        correlation_id: CorrelationId,
    },
    BecomeShuttingDown {
        correlation_id: CorrelationId,
        exit_process: bool,
    },
    BecomeShutdown {
        correlation_id: CorrelationId,
    },

    WaitForChaserToCatchUp {
        correlation_id: CorrelationId,
        total_time: Duration,
    },
    ChaserCaughtUp {
        correlation_id: CorrelationId,
    },

    VNodeConnectionEstablished {
        endpoint: SocketAddr,
    },
    VNodeConnectionLost {
        endpoint: SocketAddr,
    },
    NoQuorum,
    WriteEpoch,
}

impl SystemMessage {
    /// State the node enters with this message, if it is a state change
    pub fn new_state(&self) -> Option<VNodeState> {
        Some(match self {
            SystemMessage::BecomeUnknown { .. } => VNodeState::Unknown,
            SystemMessage::BecomePreReplica { .. } => VNodeState::PreReplica,
            SystemMessage::BecomeCatchingUp { .. } => VNodeState::CatchingUp,
            SystemMessage::BecomeClone { .. } => VNodeState::Clone,
            SystemMessage::BecomeSlave { .. } => VNodeState::Slave,
            SystemMessage::BecomePreMaster { .. } => VNodeState::PreMaster,
            SystemMessage::BecomeMaster { .. } => VNodeState::Master,
            SystemMessage::BecomeShuttingDown { .. } => VNodeState::ShuttingDown,
            SystemMessage::BecomeShutdown { .. } => VNodeState::Shutdown,
            _ => return None,
        })
    }

    pub fn master(&self) -> Option<&MemberInfo> {
        match self {
            SystemMessage::BecomePreReplica { master, .. }
            | SystemMessage::BecomeCatchingUp { master, .. }
            | SystemMessage::BecomeClone { master, .. }
            | SystemMessage::BecomeSlave { master, .. } => Some(master),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ElectionMessage {
    StartElections,
    ElectionsTimedOut { view: i32 },
    SendViewChangeProof,
    ViewChange(peer::ViewChange),
    ViewChangeProof(peer::ViewChangeProof),
    Prepare(peer::Prepare),
    PrepareOk(peer::PrepareOk),
    Proposal(peer::Proposal),
    Accept(peer::Accept),
    ElectionsDone { view: i32, master: MemberInfo },
}

impl ElectionMessage {
    /// Election traffic received from a peer, or the message back if it is something else
    pub fn from_peer(msg: PeerMessage) -> Result<Self, PeerMessage> {
        Ok(match msg {
            PeerMessage::ViewChange(m) => ElectionMessage::ViewChange(m),
            PeerMessage::ViewChangeProof(m) => ElectionMessage::ViewChangeProof(m),
            PeerMessage::Prepare(m) => ElectionMessage::Prepare(m),
            PeerMessage::PrepareOk(m) => ElectionMessage::PrepareOk(m),
            PeerMessage::Proposal(m) => ElectionMessage::Proposal(m),
            PeerMessage::Accept(m) => ElectionMessage::Accept(m),
            other => return Err(other),
        })
    }
}

#[derive(Clone, Debug)]
pub enum GossipMessage {
    GossipReceived(peer::Gossip),
    /// Current view of the cluster, published every gossip round
    GossipUpdated(Vec<MemberInfo>),
}

#[derive(Clone, Debug)]
pub enum ReplicationMessage {
    // replica side
    ReconnectToMaster {
        state_correlation_id: CorrelationId,
        master: MemberInfo,
    },
    SubscribeToMaster {
        state_correlation_id: CorrelationId,
        master_id: NodeId,
        subscription_id: SubscriptionId,
    },
    ReplicaSubscribed(peer::ReplicaSubscribed),
    ReplicaSubscriptionRetry(peer::ReplicaSubscriptionRetry),
    CreateChunk(peer::CreateChunk),
    RawChunkBulk(peer::RawChunkBulk),
    DataChunkBulk(peer::DataChunkBulk),
    AckLogPosition(peer::AckLogPosition),
    SlaveAssignment(peer::RoleAssignment),
    CloneAssignment(peer::RoleAssignment),
    HeartbeatTick {
        generation: u64,
    },

    // master side
    ReplicaSubscriptionRequest {
        connection: ConnectionHandle,
        request: peer::SubscribeReplica,
    },
    ReplicaLogPositionAck {
        connection_id: u64,
        ack: peer::AckLogPosition,
    },
    ReplicaWriteAck {
        connection_id: u64,
        ack: peer::WriteAck,
    },
    ReplicaConnectionClosed {
        connection_id: u64,
    },
}

impl ReplicationMessage {
    /// Master and subscription a message received from the master belongs to
    pub fn subscription(&self) -> Option<(NodeId, SubscriptionId)> {
        Some(match self {
            ReplicationMessage::ReplicaSubscribed(m) => (m.master_id, m.subscription_id),
            ReplicationMessage::ReplicaSubscriptionRetry(m) => (m.master_id, m.subscription_id),
            ReplicationMessage::CreateChunk(m) => (m.master_id, m.subscription_id),
            ReplicationMessage::RawChunkBulk(m) => (m.master_id, m.subscription_id),
            ReplicationMessage::DataChunkBulk(m) => (m.master_id, m.subscription_id),
            ReplicationMessage::SlaveAssignment(m) | ReplicationMessage::CloneAssignment(m) => {
                (m.master_id, m.subscription_id)
            }
            _ => return None,
        })
    }
}

/// Where the outcome of a client write goes
#[derive(Clone, Debug)]
pub enum Envelope {
    Channel(flume::Sender<ClientResponse>),
    /// Write forwarded by another node, answered over its connection
    Peer {
        connection: ConnectionHandle,
        internal_corr_id: CorrelationId,
    },
}

impl Envelope {
    pub fn reply(&self, response: ClientResponse) {
        match self {
            Envelope::Channel(tx) => {
                // caller might have given up waiting
                let _ = tx.send(response);
            }
            Envelope::Peer {
                connection,
                internal_corr_id,
            } => {
                let (result, first_position, last_position) = match response {
                    ClientResponse::WriteCompleted {
                        result,
                        first_position,
                        last_position,
                    } => (result, first_position, last_position),
                    // a forwarding node gives up on its own timeout
                    ClientResponse::NotHandled(_) => return,
                };
                connection.send(PeerMessage::ForwardWriteCompleted(
                    peer::ForwardWriteCompleted {
                        internal_corr_id: *internal_corr_id,
                        result,
                        first_position,
                        last_position,
                    },
                ));
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientResponse {
    WriteCompleted {
        result: OperationResult,
        first_position: i64,
        last_position: i64,
    },
    NotHandled(NotHandledReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    NotMaster(MasterEndpoints),
}

#[derive(Clone, Debug)]
pub enum ClientMessage {
    WriteEvents {
        correlation_id: CorrelationId,
        require_master: bool,
        events: Vec<Vec<u8>>,
        envelope: Envelope,
    },
    /// Write forwarded to the master over the replica connection
    TcpForwardMessage(peer::ForwardWrite),
    ForwardedWriteCompleted(peer::ForwardWriteCompleted),
    ForwardingTimeout {
        internal_corr_id: CorrelationId,
    },
}

#[derive(Clone, Debug)]
pub enum StorageMessage {
    /// Master wrote (and flushed) a client write, waiting for the commit quorum
    WritePending {
        correlation_id: CorrelationId,
        envelope: Envelope,
        first_position: i64,
        /// Position right after the last written record
        end_position: i64,
    },
    /// Writer checkpoint got flushed up to `position`
    Flushed { position: i64 },
    /// Replica wrote and flushed replicated data up to `log_position`
    CommitAck {
        subscription_id: SubscriptionId,
        log_position: i64,
    },
}

#[derive(Clone, Debug)]
pub enum TimerMessage {
    Schedule {
        delay: Duration,
        message: Box<Message>,
    },
}

/// A message to be sent to a peer's internal endpoint
#[derive(Clone, Debug)]
pub struct PeerSend {
    pub to: SocketAddr,
    pub message: PeerMessage,
}

impl Message {
    pub fn schedule(delay: Duration, message: Message) -> Self {
        Message::Timer(TimerMessage::Schedule {
            delay,
            message: Box::new(message),
        })
    }

    pub fn peer_send(to: SocketAddr, message: PeerMessage) -> Self {
        Message::Peer(PeerSend { to, message })
    }
}
