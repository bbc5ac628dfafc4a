use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use convi::ExpectFrom;
use evstored_api::peer::{
    self, CreateChunk, DataChunkBulk, PeerMessage, RawChunkBulk, ReplicaSubscribed,
    ReplicaSubscriptionRetry, RoleAssignment, SubscribeReplica,
};
use evstored_api::{NodeId, OperationResult, SubscriptionId, VNodeState};
use tracing::{debug, info, trace, warn};

use super::commit::{CommitTracker, PendingWrite};
use crate::bus::Publisher;
use crate::cluster::NodeProgress;
use crate::db::{BulkReader, Chunk, ChunkDb, DbResult};
use crate::epoch::{EpochManager, EpochResult};
use crate::message::{
    ClientResponse, Message, ReplicationMessage, StorageMessage, SystemMessage,
};
use crate::node::NodeShared;
use crate::peer::ConnectionHandle;
use crate::services::{ServiceError, ServiceResult};
use crate::task::AutoJoinHandle;

pub const SERVICE_NAME: &str = "MasterReplication";

/// How often subscriptions are fed and commit timeouts checked
pub const PUMP_INTERVAL: Duration = Duration::from_millis(10);

const BULK_SIZE: usize = 32 * 1024;
const MAX_BULKS_PER_PUMP: usize = 16;
/// Messages queued on a connection before streaming to it pauses
const MAX_CONNECTION_BACKLOG: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplicaRole {
    CatchingUp,
    Clone,
    Slave,
}

/// Where a subscription stands in the chunk it is being sent
enum ChunkStream {
    Raw(BulkReader),
    Data(BulkReader),
}

impl ChunkStream {
    fn chunk(&self) -> &Arc<Chunk> {
        match self {
            ChunkStream::Raw(r) | ChunkStream::Data(r) => r.chunk(),
        }
    }
}

struct ReplicaSubscription {
    connection: ConnectionHandle,
    replica_id: NodeId,
    replica_internal: SocketAddr,
    role: ReplicaRole,
    /// Log position the next bulk starts at
    send_position: i64,
    ack_position: i64,
    stream: Option<ChunkStream>,
}

impl ReplicaSubscription {
    fn send(&self, msg: PeerMessage) {
        if !self.connection.send(msg) {
            trace!(replica = %self.replica_id, "Replica connection gone");
        }
    }

    /// Send as much of the flushed log as the connection takes
    fn stream(
        &mut self,
        db: &ChunkDb,
        master_id: NodeId,
        subscription_id: SubscriptionId,
        buf: &mut [u8],
    ) -> DbResult<()> {
        for _ in 0..MAX_BULKS_PER_PUMP {
            if MAX_CONNECTION_BACKLOG <= self.connection.backlog() {
                break;
            }
            let flushed = db.writer_checkpoint().read();
            if flushed <= self.send_position {
                break;
            }
            let Some(chunk) = db.get_chunk_for(self.send_position) else {
                break;
            };
            let header = *chunk.header();

            let is_same_chunk = self
                .stream
                .as_ref()
                .map_or(false, |s| Arc::ptr_eq(s.chunk(), &chunk));
            if !is_same_chunk {
                self.stream = None;
                let at_start = self.send_position == chunk.start_position();
                if chunk.is_completed() && at_start {
                    self.send(PeerMessage::CreateChunk(CreateChunk {
                        master_id,
                        subscription_id,
                        chunk_header: header,
                        file_size: chunk.file_size()?,
                        is_completed_chunk: true,
                    }));
                    let mut reader = chunk.acquire_bulk_reader()?;
                    reader.set_raw_position(0)?;
                    self.stream = Some(ChunkStream::Raw(reader));
                } else {
                    if at_start {
                        self.send(PeerMessage::CreateChunk(CreateChunk {
                            master_id,
                            subscription_id,
                            chunk_header: header,
                            file_size: Chunk::active_file_size(&header),
                            is_completed_chunk: false,
                        }));
                    }
                    let mut reader = chunk.acquire_bulk_reader()?;
                    reader
                        .set_data_position(u64::expect_from(header.local_position(self.send_position)))?;
                    self.stream = Some(ChunkStream::Data(reader));
                }
            }

            match self.stream.as_mut() {
                Some(ChunkStream::Raw(reader)) => {
                    let res = reader.read_next_raw_bytes(buf)?;
                    self.send(PeerMessage::RawChunkBulk(RawChunkBulk {
                        master_id,
                        subscription_id,
                        chunk_start_number: header.chunk_start_number,
                        chunk_end_number: header.chunk_end_number,
                        raw_position: res.old_position,
                        raw_bytes: buf[..res.bytes_read].to_vec(),
                        complete_chunk: res.is_eof,
                    }));
                    if res.is_eof {
                        self.send_position = chunk.end_position();
                        self.stream = None;
                    }
                }
                Some(ChunkStream::Data(reader)) => {
                    let data_end = chunk.start_position()
                        + i64::expect_from(chunk.physical_data_size());
                    let available = flushed.min(data_end) - self.send_position;
                    let len = usize::expect_from(available.max(0)).min(buf.len());
                    let res = reader.read_next_data_bytes(&mut buf[..len])?;
                    if res.bytes_read == 0 && !res.is_eof {
                        break;
                    }
                    self.send(PeerMessage::DataChunkBulk(DataChunkBulk {
                        master_id,
                        subscription_id,
                        chunk_start_number: header.chunk_start_number,
                        chunk_end_number: header.chunk_end_number,
                        subscription_position: self.send_position,
                        data_bytes: buf[..res.bytes_read].to_vec(),
                        complete_chunk: res.is_eof,
                    }));
                    self.send_position += i64::expect_from(res.bytes_read);
                    if res.is_eof {
                        self.send_position = chunk.end_position();
                        self.stream = None;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Master side of replication
///
/// Accepts replica subscriptions, streams the log to them, assigns
/// replica roles and tracks the commit quorum of client writes.
pub struct MasterReplication<P> {
    publisher: P,
    db: Arc<ChunkDb>,
    epochs: Arc<EpochManager>,
    progress: Arc<NodeProgress>,
    instance_id: NodeId,
    cluster_size: usize,

    state: VNodeState,
    subscriptions: HashMap<SubscriptionId, ReplicaSubscription>,
    commits: CommitTracker,
    buf: Vec<u8>,
}

impl<P> MasterReplication<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        db: Arc<ChunkDb>,
        epochs: Arc<EpochManager>,
        progress: Arc<NodeProgress>,
        instance_id: NodeId,
        cluster_size: usize,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            db,
            epochs,
            progress,
            instance_id,
            cluster_size,
            state: VNodeState::Initializing,
            subscriptions: HashMap::new(),
            commits: CommitTracker::new(cluster_size, commit_timeout),
            buf: vec![0u8; BULK_SIZE],
        }
    }

    #[cfg(test)]
    pub fn role_of(&self, subscription_id: SubscriptionId) -> Option<ReplicaRole> {
        self.subscriptions.get(&subscription_id).map(|s| s.role)
    }

    #[cfg(test)]
    pub fn commit_position(&self) -> i64 {
        self.commits.commit_position()
    }

    /// Handle one message, returning `false` once the service is done
    pub fn handle(&mut self, msg: Message) -> ServiceResult<bool> {
        match msg {
            Message::System(SystemMessage::BecomeShuttingDown { .. }) => {
                self.step_down();
                self.publisher.publish(
                    SystemMessage::ServiceShutdown {
                        service: SERVICE_NAME,
                    }
                    .into(),
                );
                return Ok(false);
            }
            Message::System(m) => {
                if let Some(state) = m.new_state() {
                    self.handle_state_change(state);
                }
            }
            Message::Replication(ReplicationMessage::ReplicaSubscriptionRequest {
                connection,
                request,
            }) => self.handle_subscribe(connection, request)?,
            Message::Replication(ReplicationMessage::ReplicaLogPositionAck {
                connection_id,
                ack,
            }) => self.handle_log_position_ack(connection_id, ack),
            Message::Replication(ReplicationMessage::ReplicaWriteAck { connection_id, ack }) => {
                self.handle_write_ack(connection_id, ack)
            }
            Message::Replication(ReplicationMessage::ReplicaConnectionClosed { connection_id }) => {
                self.handle_connection_closed(connection_id)
            }
            Message::Storage(StorageMessage::WritePending {
                correlation_id,
                envelope,
                first_position,
                end_position,
            }) => {
                if self.state == VNodeState::Master {
                    self.commits.add_pending(
                        correlation_id,
                        envelope,
                        first_position,
                        end_position,
                        Instant::now(),
                    );
                    self.complete_committed();
                } else {
                    envelope.reply(ClientResponse::WriteCompleted {
                        result: OperationResult::CommitTimeout,
                        first_position: -1,
                        last_position: -1,
                    });
                }
            }
            Message::Storage(StorageMessage::Flushed { position }) => {
                if self.state == VNodeState::Master {
                    self.commits.master_flushed(position);
                    self.complete_committed();
                }
            }
            other => trace!(msg = ?other, "Ignored by master replication"),
        }
        Ok(true)
    }

    fn handle_state_change(&mut self, state: VNodeState) {
        let was_master = self.state == VNodeState::Master;
        self.state = state;
        if state == VNodeState::Master && !was_master {
            self.commits.master_flushed(self.db.writer_checkpoint().read());
        } else if state != VNodeState::Master && was_master {
            self.step_down();
        }
    }

    /// Drop all replicas and fail writes still waiting for the quorum
    fn step_down(&mut self) {
        for (subscription_id, subscription) in self.subscriptions.drain() {
            debug!(%subscription_id, replica = %subscription.replica_id, "Dropping subscription");
            subscription.connection.close();
        }
        for write in self.commits.reset() {
            Self::reply_timed_out(write);
        }
    }

    fn reply_timed_out(write: PendingWrite) {
        write.envelope.reply(ClientResponse::WriteCompleted {
            result: OperationResult::CommitTimeout,
            first_position: -1,
            last_position: -1,
        });
    }

    fn handle_subscribe(
        &mut self,
        connection: ConnectionHandle,
        request: SubscribeReplica,
    ) -> ServiceResult<()> {
        if self.state != VNodeState::Master || request.master_id != self.instance_id {
            debug!(
                replica = %request.replica_id,
                state = ?self.state,
                requested_master = %request.master_id,
                "Subscription rejected, asking to retry"
            );
            connection.send(PeerMessage::ReplicaSubscriptionRetry(
                ReplicaSubscriptionRetry {
                    master_id: self.instance_id,
                    subscription_id: request.subscription_id,
                },
            ));
            return Ok(());
        }

        let position = self.subscription_position(&request)?;
        info!(
            replica = %request.replica_id,
            endpoint = %request.replica_internal,
            subscription_id = %request.subscription_id,
            replica_position = request.log_position,
            position,
            "Replica subscribed"
        );

        // a replica has one subscription at most
        let stale: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.replica_id == request.replica_id)
            .map(|(id, _)| *id)
            .collect();
        for subscription_id in stale {
            self.remove_subscription(subscription_id);
        }

        connection.send(PeerMessage::ReplicaSubscribed(ReplicaSubscribed {
            master_id: self.instance_id,
            subscription_id: request.subscription_id,
            subscription_position: position,
        }));
        self.subscriptions.insert(
            request.subscription_id,
            ReplicaSubscription {
                connection,
                replica_id: request.replica_id,
                replica_internal: request.replica_internal,
                role: ReplicaRole::CatchingUp,
                send_position: position,
                ack_position: position,
                stream: None,
            },
        );
        Ok(())
    }

    /// Position the replica has to truncate to before receiving data
    fn subscription_position(&self, request: &SubscribeReplica) -> EpochResult<i64> {
        let mut common = None;
        for (idx, epoch) in request.last_epochs.iter().enumerate() {
            if self.epochs.is_known(epoch.epoch_number, epoch.epoch_id)? {
                common = Some((idx, epoch));
                break;
            }
        }
        let Some((idx, common)) = common else {
            return Ok(0);
        };

        let mut position = request
            .log_position
            .min(self.db.writer_checkpoint().read());
        if let Some(after) = self.epochs.epoch_after(common.epoch_number)? {
            position = position.min(after.epoch_position);
        }
        if let Some(replica_after) = idx.checked_sub(1).and_then(|i| request.last_epochs.get(i)) {
            position = position.min(replica_after.epoch_position);
        }

        // scavenged chunks can only be sent whole
        if let Some(chunk) = self.db.get_chunk_for(position) {
            if chunk.is_scavenged() {
                position = chunk.start_position();
            }
        }
        Ok(position)
    }

    fn find_subscription(
        &mut self,
        connection_id: u64,
        subscription_id: SubscriptionId,
    ) -> Option<&mut ReplicaSubscription> {
        self.subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.connection.id() == connection_id)
    }

    fn handle_log_position_ack(&mut self, connection_id: u64, ack: peer::AckLogPosition) {
        let writer = self.db.writer_checkpoint().read();
        let Some(subscription) = self.find_subscription(connection_id, ack.subscription_id)
        else {
            trace!(subscription_id = %ack.subscription_id, "Ack for unknown subscription");
            return;
        };
        subscription.ack_position = subscription.ack_position.max(ack.replication_log_position);
        if subscription.role != ReplicaRole::CatchingUp || subscription.ack_position < writer {
            return;
        }

        let slaves = self
            .subscriptions
            .values()
            .filter(|s| s.role == ReplicaRole::Slave)
            .count();
        let role = if slaves < self.cluster_size / 2 {
            ReplicaRole::Slave
        } else {
            ReplicaRole::Clone
        };
        self.assign_role(ack.subscription_id, role);
    }

    fn handle_write_ack(&mut self, connection_id: u64, ack: peer::WriteAck) {
        let Some(subscription) = self.find_subscription(connection_id, ack.subscription_id)
        else {
            return;
        };
        subscription.ack_position = subscription.ack_position.max(ack.log_position);
        if subscription.role != ReplicaRole::Slave {
            trace!(subscription_id = %ack.subscription_id, "Write ack of a non-slave ignored");
            return;
        }
        self.commits.replica_acked(ack.subscription_id, ack.log_position);
        self.complete_committed();
    }

    fn handle_connection_closed(&mut self, connection_id: u64) {
        let closed: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.connection.id() == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for subscription_id in closed {
            self.remove_subscription(subscription_id);
        }
    }

    fn remove_subscription(&mut self, subscription_id: SubscriptionId) {
        let Some(removed) = self.subscriptions.remove(&subscription_id) else {
            return;
        };
        info!(
            %subscription_id,
            replica = %removed.replica_id,
            endpoint = %removed.replica_internal,
            role = ?removed.role,
            "Replica subscription removed"
        );
        if removed.role != ReplicaRole::Slave {
            return;
        }
        self.commits.remove_slave(subscription_id);

        let promoted = self
            .subscriptions
            .iter()
            .find(|(_, s)| s.role == ReplicaRole::Clone)
            .map(|(id, _)| *id);
        if let Some(promoted) = promoted {
            self.assign_role(promoted, ReplicaRole::Slave);
        }
    }

    fn assign_role(&mut self, subscription_id: SubscriptionId, role: ReplicaRole) {
        let Some(subscription) = self.subscriptions.get_mut(&subscription_id) else {
            return;
        };
        subscription.role = role;
        let assignment = RoleAssignment {
            master_id: self.instance_id,
            subscription_id,
        };
        info!(%subscription_id, replica = %subscription.replica_id, ?role, "Assigning replica role");
        match role {
            ReplicaRole::Slave => {
                subscription.send(PeerMessage::SlaveAssignment(assignment));
                let ack_position = subscription.ack_position;
                self.commits.add_slave(subscription_id, ack_position);
                self.complete_committed();
            }
            ReplicaRole::Clone => subscription.send(PeerMessage::CloneAssignment(assignment)),
            ReplicaRole::CatchingUp => {}
        }
    }

    fn complete_committed(&mut self) {
        let committed = self.commits.take_committed();
        if committed.is_empty() {
            return;
        }
        self.progress
            .update_last_commit_position(self.commits.commit_position());
        for write in committed {
            trace!(
                correlation_id = %write.correlation_id,
                first = write.first_position,
                end = write.end_position,
                "Write committed"
            );
            write.envelope.reply(ClientResponse::WriteCompleted {
                result: OperationResult::Success,
                first_position: write.first_position,
                last_position: write.end_position,
            });
        }
    }

    /// Feed subscriptions and time out writes stuck waiting for the quorum
    pub fn pump(&mut self) {
        if self.state != VNodeState::Master {
            return;
        }

        let mut failed = vec![];
        for (subscription_id, subscription) in self.subscriptions.iter_mut() {
            if let Err(e) =
                subscription.stream(&self.db, self.instance_id, *subscription_id, &mut self.buf)
            {
                warn!(%subscription_id, error = %e, "Streaming to replica failed");
                failed.push(*subscription_id);
            }
        }
        for subscription_id in failed {
            if let Some(subscription) = self.subscriptions.get(&subscription_id) {
                subscription.connection.close();
            }
            self.remove_subscription(subscription_id);
        }

        let timed_out = self.commits.take_timed_out(Instant::now());
        if !timed_out.is_empty() {
            warn!(
                count = timed_out.len(),
                slaves = self.commits.slave_count(),
                "Writes timed out waiting for commit"
            );
            if self.commits.slave_count() + 1 < self.commits.quorum() {
                self.publisher.publish(SystemMessage::NoQuorum.into());
            }
            for write in timed_out {
                Self::reply_timed_out(write);
            }
        }
    }

    fn run(
        &mut self,
        rx: &flume::Receiver<Message>,
        is_node_shutting_down: &AtomicBool,
    ) -> ServiceResult<()> {
        while !is_node_shutting_down.load(Ordering::SeqCst) {
            match rx.recv_timeout(PUMP_INTERVAL) {
                Ok(msg) => {
                    if !self.handle(msg)? {
                        return Ok(());
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(()),
            }
            self.pump();
        }
        Ok(())
    }
}

pub struct MasterReplicationService {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl MasterReplicationService {
    pub fn new(shared: Arc<NodeShared>, rx: flume::Receiver<Message>) -> anyhow::Result<Self> {
        let mut service = MasterReplication::new(
            shared.main_queue().clone(),
            shared.db().clone(),
            shared.epochs().clone(),
            shared.progress().clone(),
            shared.info().instance_id,
            shared.params().cluster_size,
            shared.params().commit_timeout,
        );
        Ok(Self {
            join_handle: AutoJoinHandle::spawn_res("master-replication", move || {
                let guard = shared.panic_guard("master-replication");
                service.run(&rx, shared.is_node_shutting_down_flag())?;
                guard.done();
                Ok::<_, ServiceError>(())
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use evstored_api::{
        CorrelationId, DataRecord, EpochId, EpochRecord, LogRecord,
    };

    use super::*;
    use crate::db::{ChunkDbConfig, ChunkWriter};
    use crate::message::Envelope;
    use crate::peer::ConnectionCommand;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<ChunkDb>,
        epochs: Arc<EpochManager>,
        writer: ChunkWriter,
        master: MasterReplication<flume::Sender<Message>>,
        out: flume::Receiver<Message>,
        id: NodeId,
    }

    fn fixture(chunk_size: u32, cluster_size: usize) -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            chunk_size,
        )?)?);
        let epochs = Arc::new(EpochManager::init(db.clone(), 10)?);
        let progress = Arc::new(NodeProgress::new(db.clone(), epochs.clone()));
        let (tx, rx) = flume::unbounded();
        let id = NodeId::new_random();
        let mut master = MasterReplication::new(
            tx,
            db.clone(),
            epochs.clone(),
            progress,
            id,
            cluster_size,
            Duration::from_millis(50),
        );
        master.handle(
            SystemMessage::BecomeMaster {
                correlation_id: CorrelationId::new_random(),
            }
            .into(),
        )?;
        Ok(Fixture {
            writer: ChunkWriter::open(db.clone())?,
            _dir: dir,
            db,
            epochs,
            master,
            out: rx,
            id,
        })
    }

    fn write_data(writer: &mut ChunkWriter, count: usize) -> anyhow::Result<()> {
        for _ in 0..count {
            writer.write_record(|log_position| {
                LogRecord::Data(DataRecord {
                    log_position,
                    timestamp: 0,
                    correlation_id: CorrelationId::nil(),
                    data: vec![5; 200],
                })
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    struct Replica {
        id: NodeId,
        subscription_id: SubscriptionId,
        connection: ConnectionHandle,
        rx: flume::Receiver<ConnectionCommand>,
    }

    fn replica(connection_id: u64) -> Replica {
        let (connection, rx) = ConnectionHandle::new(
            connection_id,
            SocketAddr::from_str("127.0.0.1:2112").expect("valid addr"),
        );
        Replica {
            id: NodeId::new_random(),
            subscription_id: SubscriptionId::new_random(),
            connection,
            rx,
        }
    }

    impl Replica {
        fn subscribe(
            &self,
            f: &mut Fixture,
            log_position: i64,
            last_epochs: Vec<EpochRecord>,
        ) -> anyhow::Result<()> {
            f.master.handle(
                ReplicationMessage::ReplicaSubscriptionRequest {
                    connection: self.connection.clone(),
                    request: SubscribeReplica {
                        log_position,
                        chunk_id: Default::default(),
                        last_epochs,
                        replica_id: self.id,
                        replica_internal: SocketAddr::from_str("127.0.0.1:2112")?,
                        master_id: f.id,
                        subscription_id: self.subscription_id,
                    },
                }
                .into(),
            )?;
            Ok(())
        }

        fn received(&self) -> Vec<PeerMessage> {
            self.rx
                .try_iter()
                .filter_map(|cmd| match cmd {
                    ConnectionCommand::Send(msg) => Some(msg),
                    ConnectionCommand::Close => None,
                })
                .collect()
        }

        fn ack_log_position(&self, f: &mut Fixture, log_position: i64) -> anyhow::Result<()> {
            f.master.handle(
                ReplicationMessage::ReplicaLogPositionAck {
                    connection_id: self.connection.id(),
                    ack: peer::AckLogPosition {
                        subscription_id: self.subscription_id,
                        replication_log_position: log_position,
                    },
                }
                .into(),
            )?;
            Ok(())
        }

        fn write_ack(&self, f: &mut Fixture, log_position: i64) -> anyhow::Result<()> {
            f.master.handle(
                ReplicationMessage::ReplicaWriteAck {
                    connection_id: self.connection.id(),
                    ack: peer::WriteAck {
                        subscription_id: self.subscription_id,
                        log_position,
                    },
                }
                .into(),
            )?;
            Ok(())
        }
    }

    fn subscribed_position(received: &[PeerMessage]) -> Option<i64> {
        received.iter().find_map(|m| match m {
            PeerMessage::ReplicaSubscribed(s) => Some(s.subscription_position),
            _ => None,
        })
    }

    #[test]
    fn diverged_replica_restarts_at_its_own_epoch() -> anyhow::Result<()> {
        let mut f = fixture(1 << 20, 3)?;
        let e0 = f.epochs.write_new_epoch(&mut f.writer, f.id)?;
        write_data(&mut f.writer, 3)?;
        let e1 = f.epochs.write_new_epoch(&mut f.writer, f.id)?;
        write_data(&mut f.writer, 2)?;

        // replica wrote its own epoch 1 one record earlier, then more data
        let replica_e1 = EpochRecord {
            epoch_position: e1.epoch_position - 245,
            epoch_id: EpochId::new_random(),
            ..e1
        };
        let r = replica(1);
        r.subscribe(&mut f, e1.epoch_position + 300, vec![replica_e1, e0])?;
        f.master.pump();

        let received = r.received();
        assert_eq!(subscribed_position(&received), Some(replica_e1.epoch_position));
        let first_data = received.iter().find_map(|m| match m {
            PeerMessage::DataChunkBulk(d) => Some(d.subscription_position),
            _ => None,
        });
        assert_eq!(first_data, Some(replica_e1.epoch_position));
        Ok(())
    }

    #[test]
    fn replica_without_common_epoch_starts_from_scratch() -> anyhow::Result<()> {
        let mut f = fixture(1 << 20, 3)?;
        let e0 = f.epochs.write_new_epoch(&mut f.writer, f.id)?;
        write_data(&mut f.writer, 2)?;

        let r = replica(1);
        let foreign = EpochRecord {
            epoch_id: EpochId::new_random(),
            ..e0
        };
        r.subscribe(&mut f, 490, vec![foreign])?;
        f.master.pump();

        let received = r.received();
        assert_eq!(subscribed_position(&received), Some(0));
        assert!(matches!(
            received.get(1),
            Some(PeerMessage::CreateChunk(CreateChunk {
                is_completed_chunk: false,
                ..
            }))
        ));
        let sent: usize = received
            .iter()
            .filter_map(|m| match m {
                PeerMessage::DataChunkBulk(d) => Some(d.data_bytes.len()),
                _ => None,
            })
            .sum();
        assert_eq!(i64::try_from(sent)?, f.db.writer_checkpoint().read());
        Ok(())
    }

    #[test]
    fn subscription_is_rejected_unless_master() -> anyhow::Result<()> {
        let mut f = fixture(1 << 20, 3)?;
        f.master.handle(
            SystemMessage::BecomeUnknown {
                correlation_id: CorrelationId::new_random(),
            }
            .into(),
        )?;
        let r = replica(1);
        r.subscribe(&mut f, 0, vec![])?;
        assert!(matches!(
            r.received().as_slice(),
            [PeerMessage::ReplicaSubscriptionRetry(retry)] if retry.subscription_id == r.subscription_id
        ));
        assert_eq!(f.master.role_of(r.subscription_id), None);
        Ok(())
    }

    #[test]
    fn completed_chunk_is_sent_as_raw_file() -> anyhow::Result<()> {
        let mut f = fixture(1024, 3)?;
        write_data(&mut f.writer, 6)?;
        let completed = f.db.get_chunk(0).expect("chunk 0");
        assert!(completed.is_completed());
        let file = std::fs::read(completed.path())?;

        let r = replica(1);
        r.subscribe(&mut f, 0, vec![])?;
        f.master.pump();

        let received = r.received();
        assert!(matches!(
            received.get(1),
            Some(PeerMessage::CreateChunk(CreateChunk {
                is_completed_chunk: true,
                ..
            }))
        ));
        let mut raw = vec![];
        let mut completes = 0;
        for m in &received {
            if let PeerMessage::RawChunkBulk(b) = m {
                assert_eq!(b.raw_position, u64::try_from(raw.len())?);
                raw.extend_from_slice(&b.raw_bytes);
                completes += usize::from(b.complete_chunk);
            }
        }
        assert_eq!(raw, file);
        assert_eq!(completes, 1);

        // the active chunk follows as record data
        assert!(received.iter().any(|m| matches!(
            m,
            PeerMessage::DataChunkBulk(d) if d.subscription_position == 1024
        )));
        Ok(())
    }

    #[test]
    fn roles_follow_cluster_size_and_slave_acks_commit() -> anyhow::Result<()> {
        let mut f = fixture(1 << 20, 3)?;
        f.epochs.write_new_epoch(&mut f.writer, f.id)?;
        f.writer.flush()?;
        let position = f.db.writer_checkpoint().read();

        let slave = replica(1);
        let clone = replica(2);
        slave.subscribe(&mut f, position, vec![])?;
        clone.subscribe(&mut f, position, vec![])?;
        f.master.pump();
        // still behind the master
        slave.ack_log_position(&mut f, position - 1)?;
        assert_eq!(f.master.role_of(slave.subscription_id), Some(ReplicaRole::CatchingUp));

        slave.ack_log_position(&mut f, position)?;
        clone.ack_log_position(&mut f, position)?;
        assert_eq!(f.master.role_of(slave.subscription_id), Some(ReplicaRole::Slave));
        assert_eq!(f.master.role_of(clone.subscription_id), Some(ReplicaRole::Clone));
        assert!(slave
            .received()
            .iter()
            .any(|m| matches!(m, PeerMessage::SlaveAssignment(_))));
        assert!(clone
            .received()
            .iter()
            .any(|m| matches!(m, PeerMessage::CloneAssignment(_))));

        let (client_tx, client_rx) = flume::unbounded();
        let before = f.db.writer_checkpoint().read();
        write_data(&mut f.writer, 1)?;
        let end = f.db.writer_checkpoint().read();
        f.master.handle(
            StorageMessage::WritePending {
                correlation_id: CorrelationId::new_random(),
                envelope: Envelope::Channel(client_tx),
                first_position: before,
                end_position: end,
            }
            .into(),
        )?;
        f.master
            .handle(StorageMessage::Flushed { position: end }.into())?;
        // acks of a clone don't count
        clone.write_ack(&mut f, end)?;
        assert!(client_rx.try_recv().is_err());

        slave.write_ack(&mut f, end)?;
        assert_eq!(
            client_rx.try_recv()?,
            ClientResponse::WriteCompleted {
                result: OperationResult::Success,
                first_position: before,
                last_position: end,
            }
        );
        assert_eq!(f.master.commit_position(), end);

        // losing the slave promotes the clone
        f.master.handle(
            ReplicationMessage::ReplicaConnectionClosed {
                connection_id: slave.connection.id(),
            }
            .into(),
        )?;
        assert_eq!(f.master.role_of(clone.subscription_id), Some(ReplicaRole::Slave));
        assert!(clone
            .received()
            .iter()
            .any(|m| matches!(m, PeerMessage::SlaveAssignment(_))));
        Ok(())
    }

    #[test]
    fn write_without_quorum_times_out() -> anyhow::Result<()> {
        let mut f = fixture(1 << 20, 3)?;
        write_data(&mut f.writer, 1)?;
        let end = f.db.writer_checkpoint().read();

        let (client_tx, client_rx) = flume::unbounded();
        f.master.handle(
            StorageMessage::WritePending {
                correlation_id: CorrelationId::new_random(),
                envelope: Envelope::Channel(client_tx),
                first_position: 0,
                end_position: end,
            }
            .into(),
        )?;
        f.master
            .handle(StorageMessage::Flushed { position: end }.into())?;
        std::thread::sleep(Duration::from_millis(60));
        f.master.pump();

        assert_eq!(
            client_rx.try_recv()?,
            ClientResponse::WriteCompleted {
                result: OperationResult::CommitTimeout,
                first_position: -1,
                last_position: -1,
            }
        );
        assert!(f
            .out
            .try_iter()
            .any(|m| matches!(m, Message::System(SystemMessage::NoQuorum))));
        Ok(())
    }
}
