//! Messages exchanged between nodes
//!
//! All internal traffic (elections, gossip, replication, forwarded
//! client writes) goes over the same kind of connection, as a stream
//! of `[u32 len][PeerMessage]` frames.
use binrw::{binrw, BinRead, BinWrite};
use std::io::Cursor;
use std::net::SocketAddr;

use crate::member::addr;
use crate::{
    ChunkHeader, ChunkId, CorrelationId, EpochId, EpochRecord, MemberInfo, NodeId,
    OperationResult, SubscriptionId,
};

/// Vote for a new view
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewChange {
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub attempted_view: i32,
}

/// Periodic announcement of the installed view
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewChangeProof {
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub installed_view: i32,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub view: i32,
}

/// Reply to `Prepare`, carrying the sender as a master candidate
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareOk {
    pub view: i32,
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub epoch_number: i32,
    pub epoch_position: i64,
    pub epoch_id: EpochId,
    pub last_commit_position: i64,
    pub writer_checkpoint: i64,
    pub chaser_checkpoint: i64,
    pub node_priority: i32,
}

/// Master candidate picked by the leader of a view
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub master_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub master_internal: SocketAddr,
    pub view: i32,
    pub epoch_number: i32,
    pub epoch_position: i64,
    pub epoch_id: EpochId,
    pub last_commit_position: i64,
    pub writer_checkpoint: i64,
    pub chaser_checkpoint: i64,
    pub node_priority: i32,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
    pub server_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub server_internal: SocketAddr,
    pub master_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub master_internal: SocketAddr,
    pub view: i32,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gossip {
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub sender_internal: SocketAddr,
    #[br(temp)]
    #[bw(calc = u32::try_from(members.len()).expect("too many members"))]
    members_len: u32,
    #[br(count = members_len)]
    pub members: Vec<MemberInfo>,
}

/// Sent by a replica to the master it wants to replicate from
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeReplica {
    /// Replica's (non-flushed) writer position
    pub log_position: i64,
    pub chunk_id: ChunkId,
    #[br(temp)]
    #[bw(calc = u32::try_from(last_epochs.len()).expect("too many epochs"))]
    epochs_len: u32,
    /// Most recent first
    #[br(count = epochs_len)]
    pub last_epochs: Vec<EpochRecord>,
    pub replica_id: NodeId,
    #[br(parse_with = addr::parse)]
    #[bw(write_with = addr::write)]
    pub replica_internal: SocketAddr,
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSubscribed {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
    /// Replica has to truncate its log to this position before applying data
    pub subscription_position: i64,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSubscriptionRetry {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CreateChunk {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
    pub chunk_header: ChunkHeader,
    pub file_size: u64,
    /// The whole completed chunk file follows as `RawChunkBulk`
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub is_completed_chunk: bool,
}

/// Bytes of a completed chunk file, sent verbatim
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawChunkBulk {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
    pub chunk_start_number: u32,
    pub chunk_end_number: u32,
    pub raw_position: u64,
    #[br(temp)]
    #[bw(calc = u32::try_from(raw_bytes.len()).expect("bulk too large"))]
    raw_len: u32,
    #[br(count = raw_len)]
    pub raw_bytes: Vec<u8>,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub complete_chunk: bool,
}

/// Record data of the chunk being written, starting at `subscription_position`
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChunkBulk {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
    pub chunk_start_number: u32,
    pub chunk_end_number: u32,
    pub subscription_position: i64,
    #[br(temp)]
    #[bw(calc = u32::try_from(data_bytes.len()).expect("bulk too large"))]
    data_len: u32,
    #[br(count = data_len)]
    pub data_bytes: Vec<u8>,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub complete_chunk: bool,
}

/// Replica's durable log position, sent in every replica role
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AckLogPosition {
    pub subscription_id: SubscriptionId,
    pub replication_log_position: i64,
}

/// Write acknowledgement counted toward the commit quorum
///
/// Only sent by replicas in `Slave` role.
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteAck {
    pub subscription_id: SubscriptionId,
    pub log_position: i64,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoleAssignment {
    pub master_id: NodeId,
    pub subscription_id: SubscriptionId,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    #[br(temp)]
    #[bw(calc = u32::try_from(data.len()).expect("event too large"))]
    len: u32,
    #[br(count = len)]
    pub data: Vec<u8>,
}

/// Client write forwarded by a non-master node
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardWrite {
    pub internal_corr_id: CorrelationId,
    #[br(temp)]
    #[bw(calc = u32::try_from(events.len()).expect("too many events"))]
    events_len: u32,
    #[br(count = events_len)]
    pub events: Vec<EventData>,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ForwardWriteCompleted {
    pub internal_corr_id: CorrelationId,
    pub result: OperationResult,
    pub first_position: i64,
    pub last_position: i64,
}

#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub msg_num: u64,
}

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    #[brw(magic(1u8))]
    ViewChange(ViewChange),
    #[brw(magic(2u8))]
    ViewChangeProof(ViewChangeProof),
    #[brw(magic(3u8))]
    Prepare(Prepare),
    #[brw(magic(4u8))]
    PrepareOk(PrepareOk),
    #[brw(magic(5u8))]
    Proposal(Proposal),
    #[brw(magic(6u8))]
    Accept(Accept),

    #[brw(magic(16u8))]
    Gossip(Gossip),

    #[brw(magic(32u8))]
    SubscribeReplica(SubscribeReplica),
    #[brw(magic(33u8))]
    ReplicaSubscribed(ReplicaSubscribed),
    #[brw(magic(34u8))]
    ReplicaSubscriptionRetry(ReplicaSubscriptionRetry),
    #[brw(magic(35u8))]
    CreateChunk(CreateChunk),
    #[brw(magic(36u8))]
    RawChunkBulk(RawChunkBulk),
    #[brw(magic(37u8))]
    DataChunkBulk(DataChunkBulk),
    #[brw(magic(38u8))]
    AckLogPosition(AckLogPosition),
    #[brw(magic(39u8))]
    WriteAck(WriteAck),
    #[brw(magic(40u8))]
    SlaveAssignment(RoleAssignment),
    #[brw(magic(41u8))]
    CloneAssignment(RoleAssignment),

    #[brw(magic(48u8))]
    ForwardWrite(ForwardWrite),
    #[brw(magic(49u8))]
    ForwardWriteCompleted(ForwardWriteCompleted),

    #[brw(magic(64u8))]
    HeartbeatRequest(Heartbeat),
    #[brw(magic(65u8))]
    HeartbeatResponse(Heartbeat),
}

impl PeerMessage {
    pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

    /// Encode as a length prefixed frame
    pub fn to_frame(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        cursor.set_position(4);
        self.write(&mut cursor).expect("can't fail");
        let mut buf = cursor.into_inner();
        let len = u32::try_from(buf.len() - 4).expect("frame too large");
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    /// Validate a frame length prefix
    pub fn frame_len(prefix: [u8; 4]) -> Option<usize> {
        let len = u32::from_be_bytes(prefix);
        if len == 0 || Self::MAX_FRAME_SIZE < len {
            None
        } else {
            usize::try_from(len).ok()
        }
    }

    /// Decode a frame body (without the length prefix)
    pub fn from_body(body: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(body))
    }
}
