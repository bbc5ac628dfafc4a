//! Chunked transaction log
//!
//! The log is a sequence of fixed-size chunk files. Only the last
//! chunk is ever written to; all the others are completed (sealed with
//! a footer) and immutable, except for being replaced as a whole by
//! scavenging or removed by truncation.
mod bulk_reader;
mod chunk;
mod manager;
mod naming;
mod scavenger;
mod truncator;
mod writer;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use convi::ExpectFrom;
use evstored_api::{ChunkHeader, LogRecord};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

pub use self::bulk_reader::{BulkReadResult, BulkReader};
pub use self::chunk::Chunk;
pub use self::manager::ChunkManager;
pub use self::naming::FileNamingStrategy;
pub use self::scavenger::ScavengeStats;
pub use self::truncator::truncate_db;
pub use self::writer::ChunkWriter;
use crate::checkpoint::{CheckpointError, FileCheckpoint, SharedCheckpoint};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("checkpoint error")]
    Checkpoint(#[from] CheckpointError),
    #[error("chunk #{number} not found")]
    ChunkNotFound { number: u32 },
    #[error("extraneous chunk #{number} found past the writer checkpoint")]
    ExtraneousChunk { number: u32 },
    #[error("invalid chunk header in {}", path.display())]
    BadChunkHeader {
        path: PathBuf,
        #[source]
        source: binrw::Error,
    },
    #[error("invalid position map")]
    BadPosMap(#[source] binrw::Error),
    #[error("chunk file {} is truncated", path.display())]
    ChunkFileTruncated { path: PathBuf },
    #[error("chunk {} is not completed", path.display())]
    ChunkNotCompleted { path: PathBuf },
    #[error("chunk {} is read-only", path.display())]
    ChunkReadOnly { path: PathBuf },
    #[error("chunk {} hash mismatch", path.display())]
    HashMismatch { path: PathBuf },
    #[error("corrupt record at {position}")]
    CorruptRecord {
        position: i64,
        #[source]
        source: binrw::Error,
    },
    #[error("writer checkpoint {position} points inside a completed chunk")]
    WriterInsideCompletedChunk { position: i64 },
    #[error("chaser checkpoint {chaser} is ahead of writer checkpoint {writer}")]
    ChaserAheadOfWriter { chaser: i64, writer: i64 },
    #[error("record of {len} bytes does not fit in a chunk")]
    RecordTooLarge { len: usize },
    #[error("no active chunk at {position}")]
    NoActiveChunk { position: i64 },
    #[error("unexpected chunk #{got}, expected #{expected}")]
    UnexpectedChunk { expected: u32, got: u32 },
    #[error("replicated data at {got} does not match writer position {expected}")]
    ReplicationOutOfSync { expected: i64, got: i64 },
    #[error("position {position} past the end of file ({len})")]
    PositionOutOfBounds { position: u64, len: u64 },
    #[error("can not truncate chunk {} at {position}", path.display())]
    CantTruncateChunk { path: PathBuf, position: i64 },
    #[error("can not scavenge chunks #{start}-#{end}")]
    InvalidScavengeRange { start: u32, end: u32 },
    #[error("no record at {position}")]
    RecordNotFound { position: i64 },
    #[error("database is closed")]
    Closed,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(TypedBuilder, Clone, Debug)]
pub struct ChunkDbConfig {
    pub path: PathBuf,
    #[builder(default = ChunkDbConfig::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u32,
    pub writer_checkpoint: SharedCheckpoint,
    pub chaser_checkpoint: SharedCheckpoint,
    pub epoch_checkpoint: SharedCheckpoint,
    pub truncate_checkpoint: SharedCheckpoint,
    #[builder(default = true)]
    pub verify_hashes: bool,
}

impl ChunkDbConfig {
    pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024 * 1024;

    /// Config with checkpoints stored in files next to the chunks
    pub fn with_file_checkpoints(path: &Path, chunk_size: u32) -> DbResult<Self> {
        std::fs::create_dir_all(path)?;
        let chk = |name: &'static str, initial: i64| -> DbResult<SharedCheckpoint> {
            Ok(Arc::new(FileCheckpoint::open(
                &path.join(format!("{name}.chk")),
                name,
                initial,
            )?))
        };
        Ok(Self::builder()
            .path(path.to_owned())
            .chunk_size(chunk_size)
            .writer_checkpoint(chk("writer", 0)?)
            .chaser_checkpoint(chk("chaser", 0)?)
            .epoch_checkpoint(chk("epoch", -1)?)
            .truncate_checkpoint(chk("truncate", -1)?)
            .build())
    }

    pub fn naming(&self) -> FileNamingStrategy {
        FileNamingStrategy::new(&self.path)
    }

    pub fn chunk_number_of(&self, position: i64) -> u32 {
        u32::expect_from(position / i64::from(self.chunk_size))
    }
}

pub struct ChunkDb {
    config: ChunkDbConfig,
    manager: RwLock<ChunkManager>,
    /// Bumped whenever the log gets truncated
    generation: AtomicU64,
    is_closed: AtomicBool,
}

impl ChunkDb {
    pub fn open(config: ChunkDbConfig) -> DbResult<Self> {
        std::fs::create_dir_all(&config.path)?;

        let truncate_chk = config.truncate_checkpoint.read();
        if 0 <= truncate_chk {
            warn!(
                truncate_chk,
                "Truncate checkpoint is present, resuming truncation"
            );
            truncate_db(&config, truncate_chk)?;
        }

        let manager = Self::load_chunks(&config)?;

        let writer = config.writer_checkpoint.read();
        let chaser = config.chaser_checkpoint.read();
        if writer < chaser {
            return Err(DbError::ChaserAheadOfWriter { chaser, writer });
        }

        info!(
            path = %config.path.display(),
            writer,
            chaser,
            chunks = manager.chunks_count(),
            "Chunk database opened"
        );
        Ok(Self {
            config,
            manager: RwLock::new(manager),
            generation: AtomicU64::new(0),
            is_closed: AtomicBool::new(false),
        })
    }

    fn load_chunks(config: &ChunkDbConfig) -> DbResult<ChunkManager> {
        let naming = config.naming();
        naming.remove_temp_files()?;

        let writer = config.writer_checkpoint.read();
        let last_chunk_num = config.chunk_number_of(writer);

        if !naming.versions_for(last_chunk_num + 1)?.is_empty() {
            return Err(DbError::ExtraneousChunk {
                number: last_chunk_num + 1,
            });
        }

        let mut manager = ChunkManager::default();
        let mut chunk_num = 0;
        while chunk_num <= last_chunk_num {
            let versions = naming.versions_for(chunk_num)?;
            let Some(((_, latest), older)) = versions.split_first() else {
                if chunk_num == last_chunk_num {
                    break;
                }
                return Err(DbError::ChunkNotFound { number: chunk_num });
            };
            for (_, path) in older {
                debug!(path = %path.display(), "Removing old chunk version");
                std::fs::remove_file(path)?;
            }

            let header_start = i64::from(chunk_num) * i64::from(config.chunk_size);
            let active_data_size = (chunk_num == last_chunk_num)
                .then(|| u64::expect_from(writer - header_start));
            let chunk = Arc::new(Chunk::open_existing(latest, active_data_size)?);
            if chunk.header().chunk_start_number != chunk_num {
                return Err(DbError::UnexpectedChunk {
                    expected: chunk_num,
                    got: chunk.header().chunk_start_number,
                });
            }
            if chunk.is_completed() {
                if config.verify_hashes {
                    chunk.verify_hash()?;
                }
                if chunk.header().covers(last_chunk_num) {
                    return Err(DbError::WriterInsideCompletedChunk { position: writer });
                }
            }
            chunk_num = chunk.header().chunk_end_number + 1;
            manager.add_chunk(chunk);
        }

        if manager.get_chunk(last_chunk_num).is_none() {
            let chunk = Self::create_chunk_file(
                config,
                ChunkHeader::new(config.chunk_size, last_chunk_num, last_chunk_num, false),
            )?;
            manager.add_chunk(chunk);
        }

        Ok(manager)
    }

    fn create_chunk_file(config: &ChunkDbConfig, header: ChunkHeader) -> DbResult<Arc<Chunk>> {
        let path = config.naming().path_for(header.chunk_start_number, 0);
        Ok(Arc::new(Chunk::create_new(
            &path,
            header,
            Chunk::active_file_size(&header),
        )?))
    }

    pub fn config(&self) -> &ChunkDbConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> u32 {
        self.config.chunk_size
    }

    pub fn writer_checkpoint(&self) -> &SharedCheckpoint {
        &self.config.writer_checkpoint
    }

    pub fn chaser_checkpoint(&self) -> &SharedCheckpoint {
        &self.config.chaser_checkpoint
    }

    pub fn epoch_checkpoint(&self) -> &SharedCheckpoint {
        &self.config.epoch_checkpoint
    }

    pub fn truncate_checkpoint(&self) -> &SharedCheckpoint {
        &self.config.truncate_checkpoint
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get_chunk(&self, number: u32) -> Option<Arc<Chunk>> {
        self.manager
            .read()
            .expect("Locking failed")
            .get_chunk(number)
            .cloned()
    }

    pub fn get_chunk_for(&self, position: i64) -> Option<Arc<Chunk>> {
        if position < 0 {
            return None;
        }
        self.get_chunk(self.config.chunk_number_of(position))
    }

    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.manager
            .read()
            .expect("Locking failed")
            .iter()
            .cloned()
            .collect()
    }

    /// Add a new active chunk
    ///
    /// An existing empty chunk with the same start number is replaced,
    /// which is what happens when a replica receives a chunk
    /// created by the master.
    pub(crate) fn add_new_chunk(&self, header: ChunkHeader) -> DbResult<Arc<Chunk>> {
        let mut manager = self.manager.write().expect("Locking failed");
        if let Some(existing) = manager.get_chunk(header.chunk_start_number).cloned() {
            if existing.is_completed()
                || existing.header().chunk_start_number != header.chunk_start_number
                || existing.physical_data_size() != 0
            {
                return Err(DbError::UnexpectedChunk {
                    expected: manager.chunks_count(),
                    got: header.chunk_start_number,
                });
            }
            let path = existing.path();
            debug!(path = %path.display(), "Replacing empty chunk");
            std::fs::remove_file(path)?;
        } else if header.chunk_start_number != manager.chunks_count() {
            return Err(DbError::UnexpectedChunk {
                expected: manager.chunks_count(),
                got: header.chunk_start_number,
            });
        }
        let chunk = Self::create_chunk_file(&self.config, header)?;
        manager.add_chunk(chunk.clone());
        Ok(chunk)
    }

    /// Put a completed chunk file (e.g. scavenged, or received from the master)
    /// in place of the chunks it covers
    pub(crate) fn switch_chunk(&self, temp_path: &Path) -> DbResult<Arc<Chunk>> {
        let chunk = Chunk::open_existing(temp_path, None)?;
        chunk.verify_hash()?;
        let start = chunk.header().chunk_start_number;

        let mut manager = self.manager.write().expect("Locking failed");
        let naming = self.config.naming();
        let new_path = naming.path_for(start, naming.next_version_for(start)?);
        std::fs::rename(temp_path, &new_path)?;
        chunk.set_path(new_path.clone());
        let chunk = Arc::new(chunk);

        for replaced in manager.add_chunk(chunk.clone()) {
            let path = replaced.path();
            if path != new_path {
                debug!(path = %path.display(), "Removing replaced chunk");
                std::fs::remove_file(path)?;
            }
        }
        info!(
            path = %new_path.display(),
            start,
            end = chunk.header().chunk_end_number,
            "Chunk switched"
        );
        Ok(chunk)
    }

    /// Read the record at or after `position`
    ///
    /// Returns the record and the position right after it. Callers
    /// are responsible for not reading past the writer checkpoint.
    pub fn read_forward(&self, mut position: i64) -> DbResult<Option<(LogRecord, i64)>> {
        loop {
            let Some(chunk) = self.get_chunk_for(position) else {
                return Ok(None);
            };
            let local = u64::expect_from(chunk.header().local_position(position));
            let Some((logical, physical)) = chunk.locate(local) else {
                position = chunk.end_position();
                continue;
            };
            match chunk.read_frame(physical)? {
                Some((record, frame_len)) => {
                    let next = chunk.start_position() + i64::expect_from(logical + frame_len);
                    return Ok(Some((record, next)));
                }
                None if chunk.is_completed() => position = chunk.end_position(),
                None => return Ok(None),
            }
        }
    }

    /// Read the record that starts exactly at `position`
    pub fn read_record_at(&self, position: i64) -> DbResult<LogRecord> {
        match self.read_forward(position)? {
            Some((record, _)) if record.log_position() == position => Ok(record),
            _ => Err(DbError::RecordNotFound { position }),
        }
    }

    /// Truncate the log while the node is running
    ///
    /// The caller must not hold a writer; it has to be reopened afterwards.
    pub fn truncate_to(&self, position: i64) -> DbResult<()> {
        info!(position, "Truncating database");
        self.config.truncate_checkpoint.write(position);
        self.config.truncate_checkpoint.flush()?;

        let mut manager = self.manager.write().expect("Locking failed");
        manager.clear();
        if let Err(e) = truncate_db(&self.config, position) {
            error!(position, error = %e, "Truncation failed, reloading chunks");
            *manager = Self::load_chunks(&self.config)?;
            return Err(e);
        }
        *manager = Self::load_chunks(&self.config)?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Merge completed chunks `start..=end`, keeping system records and
    /// the data records `keep` accepts
    pub fn scavenge(
        &self,
        start: u32,
        end: u32,
        keep: impl FnMut(&LogRecord) -> bool,
    ) -> DbResult<ScavengeStats> {
        scavenger::scavenge(self, start, end, keep)
    }

    pub fn close(&self) -> DbResult<()> {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for chunk in self.chunks() {
            chunk.flush()?;
        }
        for chk in [
            &self.config.writer_checkpoint,
            &self.config.chaser_checkpoint,
            &self.config.epoch_checkpoint,
            &self.config.truncate_checkpoint,
        ] {
            chk.flush()?;
        }
        info!("Chunk database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }
}
