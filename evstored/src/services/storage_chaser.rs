use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evstored_api::{CorrelationId, VNodeState};
use tracing::{debug, info, trace};

use super::{ServiceError, ServiceResult};
use crate::bus::Publisher;
use crate::cluster::NodeProgress;
use crate::db::ChunkDb;
use crate::epoch::EpochManager;
use crate::message::{Message, SystemMessage};
use crate::node::NodeShared;
use crate::task::AutoJoinHandle;

pub const SERVICE_NAME: &str = "StorageChaser";

/// How long the chaser waits for messages before looking at the writer again
pub const CHASE_INTERVAL: Duration = Duration::from_millis(10);

/// Follows the flushed writer checkpoint, record by record
///
/// Everything behind the chaser checkpoint was read back and found
/// consistent. Epochs written by other nodes (replicated data) get
/// known to the [`EpochManager`] here.
pub struct StorageChaser<P> {
    publisher: P,
    db: Arc<ChunkDb>,
    epochs: Arc<EpochManager>,
    progress: Arc<NodeProgress>,

    state: VNodeState,
    position: i64,
    /// Database generation `position` belongs to
    generation: u64,
    waiting: Option<(CorrelationId, Instant)>,
}

impl<P> StorageChaser<P>
where
    P: Publisher,
{
    pub fn new(
        publisher: P,
        db: Arc<ChunkDb>,
        epochs: Arc<EpochManager>,
        progress: Arc<NodeProgress>,
    ) -> Self {
        let position = db.chaser_checkpoint().read();
        let generation = db.generation();
        Self {
            publisher,
            db,
            epochs,
            progress,
            state: VNodeState::Initializing,
            position,
            generation,
            waiting: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Handle one message, returning `false` once the chaser is done
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
                self.db.chaser_checkpoint().flush()?;
                self.publisher.publish(
                    SystemMessage::ServiceShutdown {
                        service: SERVICE_NAME,
                    }
                    .into(),
                );
                return Ok(false);
            }
            Message::System(SystemMessage::WaitForChaserToCatchUp {
                correlation_id,
                total_time,
            }) => {
                trace!(%correlation_id, ?total_time, "Waiting for chaser to catch up");
                self.waiting = Some((correlation_id, Instant::now() - total_time));
                self.chase()?;
            }
            Message::System(m) => {
                if let Some(state) = m.new_state() {
                    self.state = state;
                }
            }
            other => trace!(msg = ?other, "Ignored by storage chaser"),
        }
        Ok(true)
    }

    /// Read everything the writer flushed so far
    pub fn chase(&mut self) -> ServiceResult<()> {
        let generation = self.db.generation();
        if generation != self.generation {
            self.generation = generation;
            self.position = self.db.chaser_checkpoint().read();
            debug!(position = self.position, "Log truncated, chaser restarts");
        }

        let writer = self.db.writer_checkpoint().read();
        let start = self.position;
        while self.position < writer {
            let read = match self.db.read_forward(self.position) {
                Ok(read) => read,
                Err(e) if self.db.generation() != self.generation => {
                    debug!(error = %e, "Read raced with a truncation");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match read {
                Some((record, next)) if next <= writer => {
                    if let Some(epoch) = record.epoch() {
                        let is_new = self
                            .epochs
                            .last_epoch()
                            .map_or(true, |last| last.epoch_number < epoch.epoch_number);
                        if is_new {
                            debug!(
                                number = epoch.epoch_number,
                                position = epoch.epoch_position,
                                "Chaser found new epoch"
                            );
                            self.epochs.cache_epoch(epoch)?;
                        }
                    }
                    self.position = next;
                }
                Some(_) => break,
                None => {
                    // tail of a completed chunk holds no records
                    match self.db.get_chunk_for(self.position) {
                        Some(chunk) if chunk.is_completed() && chunk.end_position() <= writer => {
                            self.position = chunk.end_position();
                        }
                        _ => break,
                    }
                }
            }
        }

        if start != self.position {
            self.db.chaser_checkpoint().write(self.position);
            self.db.chaser_checkpoint().flush()?;
            if self.state.is_replica() || self.state == VNodeState::PreReplica {
                self.progress.update_last_commit_position(self.position);
            }
            trace!(position = self.position, "Chaser advanced");
        }

        if let Some((correlation_id, since)) = self.waiting {
            if writer <= self.position {
                info!(
                    %correlation_id,
                    position = self.position,
                    took = ?since.elapsed(),
                    "Chaser caught up"
                );
                self.waiting = None;
                self.publisher
                    .publish(SystemMessage::ChaserCaughtUp { correlation_id }.into());
            }
        }
        Ok(())
    }

    fn run(
        &mut self,
        rx: &flume::Receiver<Message>,
        is_node_shutting_down: &AtomicBool,
    ) -> ServiceResult<()> {
        while !is_node_shutting_down.load(Ordering::SeqCst) {
            match rx.recv_timeout(CHASE_INTERVAL) {
                Ok(msg) => {
                    if !self.handle(msg)? {
                        return Ok(());
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(()),
            }
            if !self.db.is_closed() {
                self.chase()?;
            }
        }
        Ok(())
    }
}

pub struct StorageChaserService {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl StorageChaserService {
    pub fn new(shared: Arc<NodeShared>, rx: flume::Receiver<Message>) -> anyhow::Result<Self> {
        let mut chaser = StorageChaser::new(
            shared.main_queue().clone(),
            shared.db().clone(),
            shared.epochs().clone(),
            shared.progress().clone(),
        );
        Ok(Self {
            join_handle: AutoJoinHandle::spawn_res("storage-chaser", move || {
                let guard = shared.panic_guard("storage-chaser");
                chaser.run(&rx, shared.is_node_shutting_down_flag())?;
                guard.done();
                Ok::<_, ServiceError>(())
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use evstored_api::{DataRecord, LogRecord, NodeId};

    use super::*;
    use crate::db::{ChunkDbConfig, ChunkWriter};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<ChunkDb>,
        epochs: Arc<EpochManager>,
        writer: ChunkWriter,
        chaser: StorageChaser<flume::Sender<Message>>,
        out: flume::Receiver<Message>,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            1024,
        )?)?);
        let epochs = Arc::new(EpochManager::init(db.clone(), 10)?);
        let progress = Arc::new(NodeProgress::new(db.clone(), epochs.clone()));
        let (tx, rx) = flume::unbounded();
        Ok(Fixture {
            writer: ChunkWriter::open(db.clone())?,
            chaser: StorageChaser::new(tx, db.clone(), epochs.clone(), progress),
            _dir: dir,
            db,
            epochs,
            out: rx,
        })
    }

    fn write_data(writer: &mut ChunkWriter, count: usize) -> anyhow::Result<()> {
        for _ in 0..count {
            writer.write_record(|log_position| {
                LogRecord::Data(DataRecord {
                    log_position,
                    timestamp: 0,
                    correlation_id: CorrelationId::nil(),
                    data: vec![3; 200],
                })
            })?;
        }
        Ok(())
    }

    #[test]
    fn chaser_follows_flushed_writer_across_chunks() -> anyhow::Result<()> {
        let mut f = fixture()?;
        write_data(&mut f.writer, 3)?;
        // not flushed yet
        f.chaser.chase()?;
        assert_eq!(f.chaser.position(), 0);

        f.writer.flush()?;
        write_data(&mut f.writer, 5)?;
        f.writer.flush()?;
        f.chaser.chase()?;
        assert_eq!(f.chaser.position(), f.db.writer_checkpoint().read());
        assert_eq!(f.db.chaser_checkpoint().read(), f.chaser.position());
        assert!(1024 < f.chaser.position());
        Ok(())
    }

    #[test]
    fn chaser_caches_replicated_epochs_and_reports_catch_up() -> anyhow::Result<()> {
        let mut f = fixture()?;
        let other = crate::epoch::EpochManager::init(f.db.clone(), 10)?;
        // written through a second manager, as replicated data would be
        let epoch = other.write_new_epoch(&mut f.writer, NodeId::new_random())?;
        write_data(&mut f.writer, 1)?;
        f.writer.flush()?;
        assert_eq!(f.epochs.last_epoch(), None);

        let correlation_id = CorrelationId::new_random();
        f.chaser.handle(
            SystemMessage::WaitForChaserToCatchUp {
                correlation_id,
                total_time: Duration::ZERO,
            }
            .into(),
        )?;
        assert_eq!(f.epochs.last_epoch(), Some(epoch));
        assert!(f.out.try_iter().any(|m| matches!(
            m,
            Message::System(SystemMessage::ChaserCaughtUp { correlation_id: c }) if c == correlation_id
        )));
        Ok(())
    }

    #[test]
    fn chaser_restarts_after_truncation() -> anyhow::Result<()> {
        let mut f = fixture()?;
        write_data(&mut f.writer, 8)?;
        f.writer.flush()?;
        f.chaser.chase()?;
        let end = f.chaser.position();

        // records are 245 bytes framed, so 490 is the third one
        f.writer.truncate_to(490)?;
        assert_eq!(f.db.writer_checkpoint().read(), 490);
        f.chaser.chase()?;
        assert_eq!(f.chaser.position(), 490);
        assert!(f.chaser.position() < end);

        write_data(&mut f.writer, 2)?;
        f.writer.flush()?;
        f.chaser.chase()?;
        assert_eq!(f.chaser.position(), f.db.writer_checkpoint().read());
        Ok(())
    }
}
