use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use convi::ExpectFrom;
use evstored_api::{ChunkHeader, LogRecord};
use tracing::{debug, info};

use super::chunk::Chunk;
use super::{ChunkDb, DbError, DbResult};
use crate::ioutil::{fsync, ftruncate, pwrite_all};

/// A completed chunk being received byte-for-byte
struct RawChunk {
    header: ChunkHeader,
    path: PathBuf,
    file: File,
}

/// The only writer of the log
///
/// Appends to the active chunk and advances the (non-flushed) writer
/// checkpoint. [`ChunkWriter::flush`] makes both durable.
pub struct ChunkWriter {
    db: Arc<ChunkDb>,
    current: Option<Arc<Chunk>>,
    raw: Option<RawChunk>,
    position: i64,
    buf: Vec<u8>,
}

impl ChunkWriter {
    pub fn open(db: Arc<ChunkDb>) -> DbResult<Self> {
        let position = db.writer_checkpoint().read();
        let current = db.get_chunk_for(position).filter(|c| !c.is_completed());
        debug!(position, "Chunk writer opened");
        Ok(Self {
            db,
            current,
            raw: None,
            position,
            buf: vec![],
        })
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    /// Position the next record will be written at
    pub fn position(&self) -> i64 {
        self.position
    }

    fn set_position(&mut self, position: i64) {
        self.position = position;
        self.db.writer_checkpoint().write(position);
    }

    fn ensure_chunk(&mut self) -> DbResult<Arc<Chunk>> {
        if let Some(chunk) = self.current.as_ref() {
            return Ok(chunk.clone());
        }
        let number = self.db.config().chunk_number_of(self.position);
        let chunk = match self.db.get_chunk(number).filter(|c| !c.is_completed()) {
            Some(chunk) => chunk,
            None => self.db.add_new_chunk(ChunkHeader::new(
                self.db.chunk_size(),
                number,
                number,
                false,
            ))?,
        };
        let expected = chunk.start_position() + i64::expect_from(chunk.physical_data_size());
        if expected != self.position {
            return Err(DbError::NoActiveChunk {
                position: self.position,
            });
        }
        self.current = Some(chunk.clone());
        Ok(chunk)
    }

    /// Append a record whose log position is the current writer position
    ///
    /// Returns the new writer position, or `None` if the active chunk had
    /// no room for it. The chunk gets completed in that case, and the
    /// record has to be rebuilt with the new position and written again.
    pub fn write(&mut self, record: &LogRecord) -> DbResult<Option<i64>> {
        self.buf.clear();
        let len = record.write_framed(&mut self.buf);
        if u64::from(self.db.chunk_size()) < u64::expect_from(len) {
            return Err(DbError::RecordTooLarge { len });
        }
        let chunk = self.ensure_chunk()?;
        if chunk.append(&self.buf)? {
            self.set_position(self.position + i64::expect_from(len));
            Ok(Some(self.position))
        } else {
            self.complete_chunk()?;
            Ok(None)
        }
    }

    /// Write a record built for the position it will land at
    ///
    /// Returns the record position and the position after it.
    pub fn write_record(
        &mut self,
        mut make: impl FnMut(i64) -> LogRecord,
    ) -> DbResult<(i64, i64)> {
        for _ in 0..2 {
            let start = self.position;
            let record = make(start);
            if let Some(end) = self.write(&record)? {
                return Ok((start, end));
            }
        }
        Err(DbError::RecordTooLarge {
            len: self.buf.len(),
        })
    }

    /// Seal the active chunk and move to the start of the next one
    pub fn complete_chunk(&mut self) -> DbResult<()> {
        let chunk = self.ensure_chunk()?;
        chunk.complete()?;
        self.current = None;
        self.set_position(chunk.end_position());
        self.db.writer_checkpoint().flush()?;
        info!(
            start = chunk.header().chunk_start_number,
            end = chunk.header().chunk_end_number,
            "Chunk completed"
        );
        self.ensure_chunk()?;
        Ok(())
    }

    /// Start a chunk announced by the master
    ///
    /// A completed chunk is received as raw file bytes into a temporary
    /// file; an active one becomes the local active chunk.
    pub fn add_new_chunk(
        &mut self,
        header: ChunkHeader,
        file_size: u64,
        is_completed: bool,
    ) -> DbResult<()> {
        if header.chunk_start_position() != self.position {
            return Err(DbError::ReplicationOutOfSync {
                expected: self.position,
                got: header.chunk_start_position(),
            });
        }
        self.raw = None;
        if is_completed {
            let path = self.db.config().naming().new_temp_path();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            ftruncate(file.as_raw_fd(), file_size)?;
            debug!(path = %path.display(), start = header.chunk_start_number, "Receiving raw chunk");
            self.raw = Some(RawChunk { header, path, file });
        } else {
            self.current = None;
            self.current = Some(self.db.add_new_chunk(header)?);
        }
        Ok(())
    }

    /// Write replicated raw chunk bytes at `raw_position` of the file
    pub fn write_raw_chunk_bytes(&mut self, raw_position: u64, bytes: &[u8]) -> DbResult<()> {
        let Some(raw) = self.raw.as_ref() else {
            return Err(DbError::NoActiveChunk {
                position: self.position,
            });
        };
        pwrite_all(raw.file.as_raw_fd(), raw_position, bytes)?;
        Ok(())
    }

    /// Install the raw chunk received so far in place of the chunks it covers
    pub fn complete_raw_chunk(&mut self) -> DbResult<()> {
        let Some(raw) = self.raw.take() else {
            return Err(DbError::NoActiveChunk {
                position: self.position,
            });
        };
        fsync(raw.file.as_raw_fd())?;
        drop(raw.file);
        self.current = None;
        let chunk = self.db.switch_chunk(&raw.path)?;
        debug_assert_eq!(chunk.header().chunk_start_number, raw.header.chunk_start_number);
        self.set_position(chunk.end_position());
        self.flush()?;
        Ok(())
    }

    /// Append replicated record frames that start at `log_position`
    pub fn append_raw_data(&mut self, log_position: i64, data: &[u8]) -> DbResult<()> {
        if log_position != self.position {
            return Err(DbError::ReplicationOutOfSync {
                expected: self.position,
                got: log_position,
            });
        }
        let chunk = self.ensure_chunk()?;
        if !chunk.append(data)? {
            return Err(DbError::ReplicationOutOfSync {
                expected: chunk.end_position(),
                got: log_position + i64::expect_from(data.len()),
            });
        }
        self.set_position(self.position + i64::expect_from(data.len()));
        Ok(())
    }

    /// Seal the active chunk once the master says it is complete
    pub fn complete_replicated_chunk(&mut self) -> DbResult<()> {
        let chunk = self.ensure_chunk()?;
        chunk.complete()?;
        self.current = None;
        self.set_position(chunk.end_position());
        self.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> DbResult<()> {
        if let Some(chunk) = self.current.as_ref() {
            chunk.flush()?;
        }
        self.db.writer_checkpoint().flush()?;
        Ok(())
    }

    /// Roll the log back to `position`, reopening the active chunk
    pub fn truncate_to(&mut self, position: i64) -> DbResult<()> {
        self.current = None;
        self.raw = None;
        self.db.truncate_to(position)?;
        self.position = self.db.writer_checkpoint().read();
        self.current = self
            .db
            .get_chunk_for(self.position)
            .filter(|c| !c.is_completed());
        Ok(())
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            drop(raw.file);
            let _ = std::fs::remove_file(&raw.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use evstored_api::{CorrelationId, DataRecord};

    use super::*;
    use crate::db::ChunkDbConfig;

    pub(crate) fn data_record(log_position: i64, len: usize) -> LogRecord {
        LogRecord::Data(DataRecord {
            log_position,
            timestamp: 0,
            correlation_id: CorrelationId::nil(),
            data: vec![7; len],
        })
    }

    #[test]
    fn records_never_straddle_chunks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            1024,
        )?)?);
        let mut writer = ChunkWriter::open(db.clone())?;

        let mut positions = vec![];
        for _ in 0..10 {
            positions.push(writer.write_record(|pos| data_record(pos, 300))?);
        }
        writer.flush()?;

        for (start, end) in &positions {
            assert_eq!(
                db.config().chunk_number_of(*start),
                db.config().chunk_number_of(*end - 1)
            );
        }
        assert!(db.get_chunk(0).expect("chunk 0").is_completed());

        let mut pos = 0;
        let mut read = vec![];
        while let Some((record, next)) = db.read_forward(pos)? {
            if db.writer_checkpoint().read() <= record.log_position() {
                break;
            }
            read.push((record.log_position(), next));
            pos = next;
        }
        assert_eq!(read, positions);
        Ok(())
    }

    #[test]
    fn record_too_large_for_a_chunk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            1024,
        )?)?);
        let mut writer = ChunkWriter::open(db)?;
        assert!(matches!(
            writer.write_record(|pos| data_record(pos, 2000)),
            Err(DbError::RecordTooLarge { .. })
        ));
        Ok(())
    }

    #[test]
    fn writer_resumes_after_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, end) = {
            let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
                dir.path(),
                4096,
            )?)?);
            let mut writer = ChunkWriter::open(db.clone())?;
            writer.write_record(|pos| data_record(pos, 100))?;
            let res = writer.write_record(|pos| data_record(pos, 100))?;
            writer.flush()?;
            db.close()?;
            res
        };

        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            4096,
        )?)?);
        let mut writer = ChunkWriter::open(db.clone())?;
        assert_eq!(writer.position(), end);
        let (start, _) = writer.write_record(|pos| data_record(pos, 100))?;
        writer.flush()?;
        assert_eq!(start, end);
        assert_eq!(db.read_record_at(start)?, data_record(start, 100));
        Ok(())
    }

    #[test]
    fn online_truncation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Arc::new(ChunkDb::open(ChunkDbConfig::with_file_checkpoints(
            dir.path(),
            1024,
        )?)?);
        let mut writer = ChunkWriter::open(db.clone())?;
        let mut positions = vec![];
        for _ in 0..8 {
            positions.push(writer.write_record(|pos| data_record(pos, 200))?);
        }
        writer.flush()?;
        db.chaser_checkpoint().write(writer.position());
        db.chaser_checkpoint().flush()?;

        let (cut, _) = positions[2];
        writer.truncate_to(cut)?;

        assert_eq!(db.generation(), 1);
        assert_eq!(writer.position(), cut);
        assert_eq!(db.writer_checkpoint().read(), cut);
        assert_eq!(db.chaser_checkpoint().read(), cut);
        assert!(db.get_chunk(1).is_none());

        let (start, _) = writer.write_record(|pos| data_record(pos, 10))?;
        writer.flush()?;
        assert_eq!(start, cut);
        assert_eq!(db.read_record_at(cut)?, data_record(cut, 10));
        Ok(())
    }
}
