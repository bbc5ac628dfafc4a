//! Leadership epochs
//!
//! Every master writes an epoch record at the start of its term. Epoch
//! records form a backward linked list through `prev_epoch_position`,
//! with `epoch.chk` pointing at the newest one.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use evstored_api::{now_millis, EpochId, EpochRecord, LogRecord, NodeId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{ChunkDb, ChunkWriter, DbError};

#[derive(Error, Debug)]
pub enum EpochError {
    #[error("database error")]
    Db(#[from] DbError),
    #[error("checkpoint error")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
    #[error("record at {position} is not an epoch")]
    NotAnEpoch { position: i64 },
    #[error(
        "epoch #{number}@{position} does not follow the last epoch #{last_number}@{last_position}"
    )]
    OutOfOrder {
        number: i32,
        position: i64,
        last_number: i32,
        last_position: i64,
    },
}

pub type EpochResult<T> = std::result::Result<T, EpochError>;

pub struct EpochManager {
    db: Arc<ChunkDb>,
    cache_size: usize,
    /// Oldest first
    epochs: Mutex<VecDeque<EpochRecord>>,
}

impl EpochManager {
    pub const DEFAULT_CACHE_SIZE: usize = 1000;

    pub fn init(db: Arc<ChunkDb>, cache_size: usize) -> EpochResult<Self> {
        let manager = Self {
            db,
            cache_size: cache_size.max(1),
            epochs: Mutex::new(VecDeque::new()),
        };
        manager.reload()?;
        Ok(manager)
    }

    /// Rebuild the cache from the log
    pub fn reload(&self) -> EpochResult<()> {
        let epoch_chk = self.db.epoch_checkpoint().read();
        let mut epochs = VecDeque::new();

        if 0 <= epoch_chk {
            let mut position = epoch_chk;
            while 0 <= position && epochs.len() < self.cache_size {
                let epoch = self.read_epoch_at(position)?;
                position = epoch.prev_epoch_position;
                epochs.push_front(epoch);
            }
        } else if 0 < self.db.writer_checkpoint().read() {
            self.scan_forward(&mut epochs)?;
            if let Some(last) = epochs.back() {
                info!(
                    position = last.epoch_position,
                    number = last.epoch_number,
                    "Epoch checkpoint restored by scanning the log"
                );
                self.db.epoch_checkpoint().write(last.epoch_position);
                self.db.epoch_checkpoint().flush()?;
            }
        }

        if let Some(last) = epochs.back() {
            debug!(
                number = last.epoch_number,
                position = last.epoch_position,
                cached = epochs.len(),
                "Epochs loaded"
            );
        }
        *self.epochs.lock().expect("Locking failed") = epochs;
        Ok(())
    }

    fn scan_forward(&self, epochs: &mut VecDeque<EpochRecord>) -> EpochResult<()> {
        let writer = self.db.writer_checkpoint().read();
        let mut position = 0;
        while let Some((record, next)) = self.db.read_forward(position)? {
            if writer <= record.log_position() {
                break;
            }
            if let Some(epoch) = record.epoch() {
                epochs.push_back(epoch);
                if self.cache_size < epochs.len() {
                    epochs.pop_front();
                }
            }
            position = next;
        }
        Ok(())
    }

    fn read_epoch_at(&self, position: i64) -> EpochResult<EpochRecord> {
        self.db
            .read_record_at(position)?
            .epoch()
            .ok_or(EpochError::NotAnEpoch { position })
    }

    pub fn last_epoch(&self) -> Option<EpochRecord> {
        self.epochs.lock().expect("Locking failed").back().copied()
    }

    /// Up to `count` most recent epochs, newest first
    pub fn last_epochs(&self, count: usize) -> Vec<EpochRecord> {
        self.epochs
            .lock()
            .expect("Locking failed")
            .iter()
            .rev()
            .take(count)
            .copied()
            .collect()
    }

    /// Find an epoch by number, reading the log when it is older than the cache
    pub fn epoch(&self, number: i32) -> EpochResult<Option<EpochRecord>> {
        let oldest = {
            let epochs = self.epochs.lock().expect("Locking failed");
            if let Some(epoch) = epochs.iter().find(|e| e.epoch_number == number) {
                return Ok(Some(*epoch));
            }
            match epochs.front() {
                Some(oldest) if number < oldest.epoch_number => *oldest,
                _ => return Ok(None),
            }
        };
        let mut position = oldest.prev_epoch_position;
        while 0 <= position {
            let epoch = self.read_epoch_at(position)?;
            if epoch.epoch_number == number {
                return Ok(Some(epoch));
            }
            if epoch.epoch_number < number {
                break;
            }
            position = epoch.prev_epoch_position;
        }
        Ok(None)
    }

    /// The epoch right after epoch `number`
    pub fn epoch_after(&self, number: i32) -> EpochResult<Option<EpochRecord>> {
        let oldest = {
            let epochs = self.epochs.lock().expect("Locking failed");
            if let Some(epoch) = epochs.iter().find(|e| number < e.epoch_number) {
                if epochs
                    .front()
                    .map_or(true, |oldest| oldest.epoch_number <= number)
                {
                    return Ok(Some(*epoch));
                }
            }
            match epochs.front() {
                Some(oldest) if number < oldest.epoch_number => *oldest,
                _ => return Ok(None),
            }
        };
        let mut after = oldest;
        let mut position = oldest.prev_epoch_position;
        while 0 <= position {
            let epoch = self.read_epoch_at(position)?;
            if epoch.epoch_number <= number {
                break;
            }
            after = epoch;
            position = epoch.prev_epoch_position;
        }
        Ok(Some(after))
    }

    /// Is there an epoch with this number and id in the history
    pub fn is_known(&self, number: i32, id: EpochId) -> EpochResult<bool> {
        Ok(self
            .epoch(number)?
            .map_or(false, |epoch| epoch.epoch_id == id))
    }

    /// Write a new epoch record at the current writer position
    pub fn write_new_epoch(
        &self,
        writer: &mut ChunkWriter,
        leader_instance_id: NodeId,
    ) -> EpochResult<EpochRecord> {
        let last = self.last_epoch();
        let epoch_number = last.map_or(0, |e| e.epoch_number + 1);
        let prev_epoch_position = last.map_or(-1, |e| e.epoch_position);
        let epoch_id = EpochId::new_random();
        let time_stamp = now_millis();

        let mut epoch = None;
        writer.write_record(|epoch_position| {
            let record = EpochRecord {
                epoch_position,
                epoch_number,
                epoch_id,
                prev_epoch_position,
                time_stamp,
                leader_instance_id,
            };
            epoch = Some(record);
            LogRecord::System(record.to_system_record())
        })?;
        writer.flush()?;
        let epoch = epoch.expect("can't fail");

        self.cache_epoch(epoch)?;
        info!(
            number = epoch.epoch_number,
            position = epoch.epoch_position,
            id = %epoch.epoch_id,
            "New epoch written"
        );
        Ok(epoch)
    }

    /// Record an epoch that is already in the log (e.g. replicated)
    ///
    /// Re-caching the last known epoch is a no-op.
    pub fn cache_epoch(&self, epoch: EpochRecord) -> EpochResult<()> {
        {
            let mut epochs = self.epochs.lock().expect("Locking failed");
            if let Some(last) = epochs.back() {
                if last == &epoch {
                    return Ok(());
                }
                if epoch.epoch_number <= last.epoch_number
                    || epoch.epoch_position <= last.epoch_position
                {
                    warn!(
                        number = epoch.epoch_number,
                        position = epoch.epoch_position,
                        "Refusing out of order epoch"
                    );
                    return Err(EpochError::OutOfOrder {
                        number: epoch.epoch_number,
                        position: epoch.epoch_position,
                        last_number: last.epoch_number,
                        last_position: last.epoch_position,
                    });
                }
            }
            epochs.push_back(epoch);
            if self.cache_size < epochs.len() {
                epochs.pop_front();
            }
        }
        self.db.epoch_checkpoint().write(epoch.epoch_position);
        self.db.epoch_checkpoint().flush()?;
        Ok(())
    }

    /// Forget epochs at or past `position` after the log got truncated
    pub fn truncated(&self, position: i64) -> EpochResult<()> {
        let (needs_reload, last) = {
            let mut epochs = self.epochs.lock().expect("Locking failed");
            let before = epochs.len();
            epochs.retain(|e| e.epoch_position < position);
            (epochs.is_empty() && before != 0, epochs.back().copied())
        };
        if needs_reload {
            return self.reload();
        }
        if let Some(last) = last {
            if self.db.epoch_checkpoint().read() != last.epoch_position {
                self.db.epoch_checkpoint().write(last.epoch_position);
                self.db.epoch_checkpoint().flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChunkDbConfig;
    use evstored_api::{CorrelationId, DataRecord};

    fn open(dir: &std::path::Path) -> anyhow::Result<Arc<ChunkDb>> {
        Ok(Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir, 4096,
        )?)?))
    }

    fn data(writer: &mut ChunkWriter) -> anyhow::Result<()> {
        writer.write_record(|log_position| {
            LogRecord::Data(DataRecord {
                log_position,
                timestamp: 0,
                correlation_id: CorrelationId::nil(),
                data: vec![1; 300],
            })
        })?;
        Ok(())
    }

    #[test]
    fn epochs_are_numbered_and_linked() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open(dir.path())?;
        let epochs = EpochManager::init(db.clone(), 10)?;
        let mut writer = ChunkWriter::open(db.clone())?;
        let leader = NodeId::new_random();

        let e0 = epochs.write_new_epoch(&mut writer, leader)?;
        data(&mut writer)?;
        let e1 = epochs.write_new_epoch(&mut writer, leader)?;
        data(&mut writer)?;
        let e2 = epochs.write_new_epoch(&mut writer, leader)?;

        assert_eq!((e0.epoch_number, e0.epoch_position), (0, 0));
        assert_eq!(e1.prev_epoch_position, e0.epoch_position);
        assert_eq!(e2.epoch_number, 2);
        assert!(e1.epoch_position < e2.epoch_position);
        assert_eq!(db.epoch_checkpoint().read(), e2.epoch_position);
        assert_eq!(epochs.last_epochs(2), [e2, e1]);
        assert_eq!(epochs.epoch_after(0)?, Some(e1));
        assert_eq!(epochs.epoch_after(2)?, None);

        assert!(matches!(
            epochs.cache_epoch(EpochRecord {
                epoch_number: 2,
                epoch_position: e2.epoch_position + 100,
                ..e2
            }),
            Err(EpochError::OutOfOrder { .. })
        ));
        assert!(matches!(
            epochs.cache_epoch(EpochRecord {
                epoch_number: 3,
                epoch_position: e2.epoch_position,
                epoch_id: EpochId::new_random(),
                ..e2
            }),
            Err(EpochError::OutOfOrder { .. })
        ));
        epochs.cache_epoch(e2)?;
        Ok(())
    }

    #[test]
    fn epochs_reload_from_the_chain() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let written = {
            let db = open(dir.path())?;
            let epochs = EpochManager::init(db.clone(), 10)?;
            let mut writer = ChunkWriter::open(db.clone())?;
            let mut written = vec![];
            for _ in 0..5 {
                data(&mut writer)?;
                written.push(epochs.write_new_epoch(&mut writer, NodeId::new_random())?);
            }
            db.close()?;
            written
        };

        let db = open(dir.path())?;
        let epochs = EpochManager::init(db.clone(), 3)?;
        assert_eq!(epochs.last_epoch(), written.last().copied());
        assert_eq!(epochs.last_epochs(10).len(), 3);
        // older than the cache, found by following the links
        assert_eq!(epochs.epoch(0)?, Some(written[0]));
        assert_eq!(epochs.epoch_after(0)?, Some(written[1]));
        assert!(epochs.is_known(1, written[1].epoch_id)?);
        assert!(!epochs.is_known(1, EpochId::new_random())?);

        // lost epoch checkpoint is rebuilt by scanning
        db.epoch_checkpoint().write(-1);
        db.epoch_checkpoint().flush()?;
        epochs.reload()?;
        assert_eq!(epochs.last_epoch(), written.last().copied());
        assert_eq!(db.epoch_checkpoint().read(), written[4].epoch_position);
        Ok(())
    }
}
