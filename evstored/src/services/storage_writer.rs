use std::sync::Arc;

use convi::ExpectFrom;
use evstored_api::peer::{self, CreateChunk, DataChunkBulk, RawChunkBulk, ReplicaSubscribed};
use evstored_api::{
    now_millis, CorrelationId, DataRecord, LogRecord, MemberInfo, NodeId, OperationResult,
    SubscriptionId, VNodeState,
};
use tracing::{debug, info, trace, warn};

use super::{ServiceError, ServiceResult};
use crate::bus::{run_queue, Publisher};
use crate::cluster::NodeProgress;
use crate::db::{ChunkWriter, DbError};
use crate::epoch::EpochManager;
use crate::message::{
    ClientMessage, ClientResponse, Envelope, Message, NotHandledReason, ReplicationMessage,
    StorageMessage, SystemMessage,
};
use crate::node::NodeShared;
use crate::task::AutoJoinHandle;

pub const SERVICE_NAME: &str = "StorageWriter";

/// Appends client writes on the master, applies the replication stream on replicas
pub struct StorageWriter<P> {
    publisher: P,
    writer: ChunkWriter,
    epochs: Arc<EpochManager>,
    progress: Arc<NodeProgress>,
    instance_id: NodeId,

    state: VNodeState,
    master: Option<MemberInfo>,
    /// Replication stream whose data is applied
    subscription: Option<SubscriptionId>,
}

impl<P> StorageWriter<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        writer: ChunkWriter,
        epochs: Arc<EpochManager>,
        progress: Arc<NodeProgress>,
        instance_id: NodeId,
    ) -> Self {
        Self {
            publisher,
            writer,
            epochs,
            progress,
            instance_id,
            state: VNodeState::Initializing,
            master: None,
            subscription: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.writer.position()
    }

    /// Handle one message, returning `false` once the writer is done
    pub fn handle(&mut self, msg: Message) -> ServiceResult<bool> {
        match msg {
            Message::System(SystemMessage::SystemInit) => {
                self.publisher.publish(
                    SystemMessage::ServiceInitialized {
                        service: SERVICE_NAME,
                    }
                    .into(),
                );
            }
            Message::System(SystemMessage::BecomeShuttingDown { .. }) => {
                self.writer.flush()?;
                self.publisher.publish(
                    SystemMessage::ServiceShutdown {
                        service: SERVICE_NAME,
                    }
                    .into(),
                );
                return Ok(false);
            }
            Message::System(SystemMessage::WriteEpoch) => {
                if self.state == VNodeState::Master {
                    self.write_epoch()?;
                }
            }
            Message::System(m) => {
                if let Some(state) = m.new_state() {
                    self.handle_state_change(state, m.master().cloned())?;
                }
            }
            Message::Client(ClientMessage::WriteEvents {
                correlation_id,
                events,
                envelope,
                ..
            }) => self.handle_write_events(correlation_id, events, envelope)?,
            Message::Replication(ReplicationMessage::ReplicaSubscribed(m)) => {
                self.handle_replica_subscribed(m)?
            }
            Message::Replication(ReplicationMessage::CreateChunk(m)) => {
                self.handle_create_chunk(m)?
            }
            Message::Replication(ReplicationMessage::RawChunkBulk(m)) => {
                self.handle_raw_chunk_bulk(m)?
            }
            Message::Replication(ReplicationMessage::DataChunkBulk(m)) => {
                self.handle_data_chunk_bulk(m)?
            }
            other => trace!(msg = ?other, "Ignored by storage writer"),
        }
        Ok(true)
    }

    fn handle_state_change(
        &mut self,
        state: VNodeState,
        master: Option<MemberInfo>,
    ) -> ServiceResult<()> {
        let prev = self.state;
        self.state = state;
        if master.is_some() {
            self.master = master;
        }
        match state {
            VNodeState::Master => {
                self.subscription = None;
                self.write_epoch()?;
            }
            VNodeState::PreReplica | VNodeState::Unknown | VNodeState::PreMaster => {
                if prev != state {
                    self.writer.flush()?;
                }
                self.subscription = None;
            }
            VNodeState::CatchingUp | VNodeState::Clone | VNodeState::Slave => {}
            VNodeState::Initializing
            | VNodeState::Manager
            | VNodeState::ShuttingDown
            | VNodeState::Shutdown => {}
        }
        Ok(())
    }

    fn write_epoch(&mut self) -> ServiceResult<()> {
        let epoch = self
            .epochs
            .write_new_epoch(&mut self.writer, self.instance_id)?;
        self.publisher.publish(
            StorageMessage::Flushed {
                position: self.writer.position(),
            }
            .into(),
        );
        debug!(
            number = epoch.epoch_number,
            position = epoch.epoch_position,
            "Epoch written as master"
        );
        Ok(())
    }

    fn handle_write_events(
        &mut self,
        correlation_id: CorrelationId,
        events: Vec<Vec<u8>>,
        envelope: Envelope,
    ) -> ServiceResult<()> {
        if self.state != VNodeState::Master {
            // role changed while the write was queued
            envelope.reply(ClientResponse::NotHandled(NotHandledReason::NotReady));
            return Ok(());
        }

        let chunk_size = usize::expect_from(self.writer.db().chunk_size());
        if let Some(len) = events
            .iter()
            .map(|e| e.len() + DataRecord::FRAMED_OVERHEAD)
            .find(|len| chunk_size < *len)
        {
            warn!(%correlation_id, len, "Event does not fit in a chunk");
            envelope.reply(ClientResponse::WriteCompleted {
                result: OperationResult::InvalidTransaction,
                first_position: -1,
                last_position: -1,
            });
            return Ok(());
        }

        let first_position = self.writer.position();
        let mut end_position = first_position;
        let timestamp = now_millis();
        for event in &events {
            let (_start, end) = self.writer.write_record(|log_position| {
                LogRecord::Data(DataRecord {
                    log_position,
                    timestamp,
                    correlation_id,
                    data: event.clone(),
                })
            })?;
            end_position = end;
        }
        self.writer.flush()?;
        trace!(%correlation_id, first_position, end_position, "Events written");

        self.publisher.publish(
            StorageMessage::WritePending {
                correlation_id,
                envelope,
                first_position,
                end_position,
            }
            .into(),
        );
        self.publisher.publish(
            StorageMessage::Flushed {
                position: self.writer.position(),
            }
            .into(),
        );
        Ok(())
    }

    fn handle_replica_subscribed(&mut self, m: ReplicaSubscribed) -> ServiceResult<()> {
        self.subscription = Some(m.subscription_id);
        let position = m.subscription_position;
        if position < self.writer.position() {
            warn!(
                writer = self.writer.position(),
                subscription_position = position,
                master = %m.master_id,
                "Log diverged from the master, truncating"
            );
            self.writer.truncate_to(position)?;
            let truncated_to = self.writer.position();
            self.epochs.truncated(truncated_to)?;
            self.progress.reset_last_commit_position(truncated_to);

            if truncated_to != position {
                // pushed back to a scavenged chunk start; the master has to
                // stream from there, so the subscription starts over
                info!(
                    truncated_to,
                    subscription_position = position,
                    "Truncation moved before the subscription position, resubscribing"
                );
                self.subscription = None;
                self.request_resubscription();
                return Ok(());
            }
        }
        debug!(
            subscription_id = %m.subscription_id,
            position,
            "Replica subscribed"
        );
        self.ack();
        Ok(())
    }

    fn request_resubscription(&self) {
        if let Some(master) = self.master.as_ref() {
            self.publisher.publish(
                SystemMessage::VNodeConnectionLost {
                    endpoint: master.internal_tcp,
                }
                .into(),
            );
        }
    }

    fn is_current_subscription(&self, subscription_id: SubscriptionId) -> bool {
        if self.subscription == Some(subscription_id) {
            return true;
        }
        debug!(%subscription_id, "Replication data from a stale subscription dropped");
        false
    }

    /// Errors caused by the replication stream not matching the local log
    ///
    /// Not fatal: the replica starts over with a new subscription.
    fn handle_replication_result(&mut self, res: Result<(), DbError>) -> ServiceResult<()> {
        match res {
            Ok(()) => {
                self.ack();
                Ok(())
            }
            Err(
                e @ (DbError::ReplicationOutOfSync { .. }
                | DbError::UnexpectedChunk { .. }
                | DbError::NoActiveChunk { .. }),
            ) => {
                warn!(error = %e, "Replication stream out of sync, resubscribing");
                self.subscription = None;
                self.request_resubscription();
                Ok(())
            }
            Err(e) => Err(ServiceError::Db(e)),
        }
    }

    fn handle_create_chunk(&mut self, m: CreateChunk) -> ServiceResult<()> {
        if !self.is_current_subscription(m.subscription_id) {
            return Ok(());
        }
        debug!(
            start = m.chunk_header.chunk_start_number,
            end = m.chunk_header.chunk_end_number,
            completed = m.is_completed_chunk,
            "Creating replicated chunk"
        );
        match self
            .writer
            .add_new_chunk(m.chunk_header, m.file_size, m.is_completed_chunk)
        {
            Ok(()) => Ok(()),
            Err(e) => self.handle_replication_result(Err(e)),
        }
    }

    fn handle_raw_chunk_bulk(&mut self, m: RawChunkBulk) -> ServiceResult<()> {
        if !self.is_current_subscription(m.subscription_id) {
            return Ok(());
        }
        let res = self
            .writer
            .write_raw_chunk_bytes(m.raw_position, &m.raw_bytes)
            .and_then(|()| {
                if m.complete_chunk {
                    self.writer.complete_raw_chunk()
                } else {
                    Ok(())
                }
            });
        if m.complete_chunk || res.is_err() {
            self.handle_replication_result(res)
        } else {
            Ok(())
        }
    }

    fn handle_data_chunk_bulk(&mut self, m: DataChunkBulk) -> ServiceResult<()> {
        if !self.is_current_subscription(m.subscription_id) {
            return Ok(());
        }
        let res = self
            .writer
            .append_raw_data(m.subscription_position, &m.data_bytes)
            .and_then(|()| {
                if m.complete_chunk {
                    self.writer.complete_replicated_chunk()
                } else {
                    self.writer.flush()
                }
            });
        self.handle_replication_result(res)
    }

    fn ack(&self) {
        let Some(subscription_id) = self.subscription else {
            return;
        };
        let log_position = self.writer.position();
        self.publisher.publish(
            ReplicationMessage::AckLogPosition(peer::AckLogPosition {
                subscription_id,
                replication_log_position: log_position,
            })
            .into(),
        );
        self.publisher.publish(
            StorageMessage::CommitAck {
                subscription_id,
                log_position,
            }
            .into(),
        );
    }
}

pub struct StorageWriterService {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl StorageWriterService {
    pub fn new(shared: Arc<NodeShared>, rx: flume::Receiver<Message>) -> anyhow::Result<Self> {
        let mut writer = StorageWriter::new(
            shared.main_queue().clone(),
            ChunkWriter::open(shared.db().clone())?,
            shared.epochs().clone(),
            shared.progress().clone(),
            shared.info().instance_id,
        );
        Ok(Self {
            join_handle: AutoJoinHandle::spawn_res("storage-writer", move || {
                let guard = shared.panic_guard("storage-writer");
                let mut res = Ok(());
                run_queue(&rx, shared.is_node_shutting_down_flag(), |msg| {
                    match writer.handle(msg) {
                        Ok(cont) => cont,
                        Err(e) => {
                            res = Err(e);
                            false
                        }
                    }
                });
                res?;
                guard.done();
                Ok::<_, ServiceError>(())
            })?,
        })
    }
}
