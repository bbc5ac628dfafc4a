use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use binrw::{BinRead, BinWrite};
use convi::ExpectFrom;
use evstored_api::{ChunkFlags, ChunkFooter, ChunkHeader, LogRecord, PosMapEntry};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::bulk_reader::BulkReader;
use super::{DbError, DbResult};
use crate::ioutil::{fsync, ftruncate, pread_exact, pwrite_all};

/// Write side of an active chunk
///
/// Tracks the file position of the next write and the running hash
/// of everything written so far.
struct WriterWorkItem {
    file: File,
    position: u64,
    hasher: Sha256,
}

impl WriterWorkItem {
    fn append_data(&mut self, buf: &[u8]) -> DbResult<()> {
        pwrite_all(self.file.as_raw_fd(), self.position, buf)?;
        self.hasher.update(buf);
        self.position += u64::expect_from(buf.len());
        Ok(())
    }

    fn resize_stream(&mut self, len: u64) -> DbResult<()> {
        ftruncate(self.file.as_raw_fd(), len)?;
        Ok(())
    }

    fn flush_to_disk(&self) -> DbResult<()> {
        fsync(self.file.as_raw_fd())?;
        Ok(())
    }
}

/// A single chunk file
pub struct Chunk {
    path: RwLock<PathBuf>,
    header: ChunkHeader,
    /// Used for positional reads only, so can be shared
    file: File,
    footer: RwLock<Option<ChunkFooter>>,
    pos_map: Vec<PosMapEntry>,
    physical_data_size: AtomicU64,
    writer: Mutex<Option<WriterWorkItem>>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("path", &self.path())
            .field("header", &self.header)
            .field("completed", &self.is_completed())
            .field("physical_data_size", &self.physical_data_size())
            .finish()
    }
}

impl Chunk {
    /// Size of the file of an active chunk with `header`
    pub fn active_file_size(header: &ChunkHeader) -> u64 {
        ChunkHeader::BYTE_SIZE_U64 + Self::capacity_of(header) + ChunkFooter::BYTE_SIZE_U64
    }

    fn capacity_of(header: &ChunkHeader) -> u64 {
        u64::expect_from(header.chunk_end_position() - header.chunk_start_position())
    }

    /// Create a new, empty, active chunk file
    pub fn create_new(path: &Path, header: ChunkHeader, file_size: u64) -> DbResult<Self> {
        trace!(path = %path.display(), start = header.chunk_start_number, "Creating new chunk file");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut work_item = WriterWorkItem {
            file: file.try_clone()?,
            position: 0,
            hasher: Sha256::new(),
        };
        work_item.resize_stream(file_size)?;
        work_item.append_data(&header.to_bytes())?;
        work_item.flush_to_disk()?;

        Ok(Self {
            path: RwLock::new(path.to_owned()),
            header,
            file,
            footer: RwLock::new(None),
            pos_map: vec![],
            physical_data_size: AtomicU64::new(0),
            writer: Mutex::new(Some(work_item)),
        })
    }

    /// Open an existing chunk file
    ///
    /// A chunk without a valid footer is opened for writing at
    /// `active_data_size`, or rejected if `None`.
    pub fn open_existing(path: &Path, active_data_size: Option<u64>) -> DbResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < ChunkHeader::BYTE_SIZE_U64 {
            return Err(DbError::ChunkFileTruncated {
                path: path.to_owned(),
            });
        }
        let header = Self::read_header_from(&file, path)?;

        if let Some(footer) = Self::try_read_footer(&file, file_len)? {
            let map_start = ChunkHeader::BYTE_SIZE_U64 + u64::from(footer.physical_data_size);
            if map_start + u64::from(footer.map_size) + ChunkFooter::BYTE_SIZE_U64 != file_len {
                return Err(DbError::ChunkFileTruncated {
                    path: path.to_owned(),
                });
            }
            let pos_map = Self::read_pos_map(&file, map_start, footer.map_size)?;
            debug!(path = %path.display(), "Opened completed chunk");
            return Ok(Self {
                path: RwLock::new(path.to_owned()),
                header,
                file,
                footer: RwLock::new(Some(footer)),
                pos_map,
                physical_data_size: AtomicU64::new(u64::from(footer.physical_data_size)),
                writer: Mutex::new(None),
            });
        }

        let Some(data_size) = active_data_size else {
            return Err(DbError::ChunkNotCompleted {
                path: path.to_owned(),
            });
        };
        if header.is_scavenged || Self::capacity_of(&header) < data_size {
            return Err(DbError::ChunkNotCompleted {
                path: path.to_owned(),
            });
        }

        let mut work_item = WriterWorkItem {
            file: file.try_clone()?,
            position: ChunkHeader::BYTE_SIZE_U64 + data_size,
            hasher: Sha256::new(),
        };
        let expected_len = Self::active_file_size(&header);
        if file_len != expected_len {
            work_item.resize_stream(expected_len)?;
        }
        Self::hash_file_range(&file, &mut work_item.hasher, 0, work_item.position)?;
        debug!(path = %path.display(), data_size, "Opened active chunk");

        Ok(Self {
            path: RwLock::new(path.to_owned()),
            header,
            file,
            footer: RwLock::new(None),
            pos_map: vec![],
            physical_data_size: AtomicU64::new(data_size),
            writer: Mutex::new(Some(work_item)),
        })
    }

    /// Read just the header of a chunk file
    pub fn read_header(path: &Path) -> DbResult<ChunkHeader> {
        let file = File::open(path)?;
        if file.metadata()?.len() < ChunkHeader::BYTE_SIZE_U64 {
            return Err(DbError::ChunkFileTruncated {
                path: path.to_owned(),
            });
        }
        Self::read_header_from(&file, path)
    }

    fn read_header_from(file: &File, path: &Path) -> DbResult<ChunkHeader> {
        let mut header_bytes = [0u8; ChunkHeader::BYTE_SIZE];
        pread_exact(file.as_raw_fd(), 0, &mut header_bytes)?;
        ChunkHeader::from_bytes(&header_bytes).map_err(|source| DbError::BadChunkHeader {
            path: path.to_owned(),
            source,
        })
    }

    fn try_read_footer(file: &File, file_len: u64) -> DbResult<Option<ChunkFooter>> {
        if file_len < ChunkHeader::BYTE_SIZE_U64 + ChunkFooter::BYTE_SIZE_U64 {
            return Ok(None);
        }
        let mut buf = [0u8; ChunkFooter::BYTE_SIZE];
        pread_exact(
            file.as_raw_fd(),
            file_len - ChunkFooter::BYTE_SIZE_U64,
            &mut buf,
        )?;
        Ok(ChunkFooter::from_bytes(&buf)
            .ok()
            .filter(|footer| footer.flags.is_completed()))
    }

    fn read_pos_map(file: &File, offset: u64, map_size: u32) -> DbResult<Vec<PosMapEntry>> {
        if map_size == 0 {
            return Ok(vec![]);
        }
        let mut buf = vec![0u8; usize::expect_from(map_size)];
        pread_exact(file.as_raw_fd(), offset, &mut buf)?;
        let mut cursor = Cursor::new(buf);
        let mut map = Vec::with_capacity(usize::expect_from(map_size) / PosMapEntry::BYTE_SIZE);
        while cursor.position() < u64::from(map_size) {
            map.push(PosMapEntry::read(&mut cursor).map_err(DbError::BadPosMap)?);
        }
        Ok(map)
    }

    fn hash_file_range(file: &File, hasher: &mut Sha256, start: u64, end: u64) -> DbResult<()> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut pos = start;
        while pos < end {
            let n = usize::expect_from((end - pos).min(u64::expect_from(buf.len())));
            pread_exact(file.as_raw_fd(), pos, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            pos += u64::expect_from(n);
        }
        Ok(())
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        *self.footer.read().expect("Locking failed")
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().expect("Locking failed").clone()
    }

    pub(crate) fn set_path(&self, path: PathBuf) {
        *self.path.write().expect("Locking failed") = path;
    }

    pub fn is_completed(&self) -> bool {
        self.footer().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn start_position(&self) -> i64 {
        self.header.chunk_start_position()
    }

    pub fn end_position(&self) -> i64 {
        self.header.chunk_end_position()
    }

    pub fn physical_data_size(&self) -> u64 {
        self.physical_data_size.load(Ordering::SeqCst)
    }

    pub fn file_size(&self) -> DbResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn pos_map(&self) -> &[PosMapEntry] {
        &self.pos_map
    }

    /// Append framed records to the data region
    ///
    /// Returns `false` if they don't fit.
    pub fn append(&self, data: &[u8]) -> DbResult<bool> {
        let mut writer = self.writer.lock().expect("Locking failed");
        let Some(work_item) = writer.as_mut() else {
            return Err(DbError::ChunkReadOnly { path: self.path() });
        };
        let physical = self.physical_data_size();
        if Self::capacity_of(&self.header) < physical + u64::expect_from(data.len()) {
            return Ok(false);
        }
        work_item.append_data(data)?;
        self.physical_data_size
            .store(physical + u64::expect_from(data.len()), Ordering::SeqCst);
        Ok(true)
    }

    pub fn flush(&self) -> DbResult<()> {
        if let Some(work_item) = self.writer.lock().expect("Locking failed").as_ref() {
            work_item.flush_to_disk()?;
        }
        Ok(())
    }

    /// Seal the chunk: write the footer and shrink the file to its final size
    pub fn complete(&self) -> DbResult<ChunkFooter> {
        self.complete_with_map(&[])
    }

    pub(crate) fn complete_with_map(&self, map: &[PosMapEntry]) -> DbResult<ChunkFooter> {
        let mut writer = self.writer.lock().expect("Locking failed");
        let Some(mut work_item) = writer.take() else {
            return Err(DbError::ChunkReadOnly { path: self.path() });
        };
        let physical = self.physical_data_size();

        let mut map_bytes = Cursor::new(vec![]);
        for entry in map {
            entry.write(&mut map_bytes).expect("can't fail");
        }
        let map_bytes = map_bytes.into_inner();
        work_item.append_data(&map_bytes)?;

        let mut flags = ChunkFlags::IS_COMPLETED;
        if self.header.is_scavenged {
            flags |= ChunkFlags::IS_SCAVENGED;
        }
        let footer = ChunkFooter {
            flags: ChunkFlags(flags),
            physical_data_size: u32::expect_from(physical),
            logical_data_size: if self.header.is_scavenged {
                self.end_position() - self.start_position()
            } else {
                i64::expect_from(physical)
            },
            map_size: u32::expect_from(map_bytes.len()),
            hash: work_item.hasher.clone().finalize().into(),
        };
        let footer_pos = work_item.position;
        pwrite_all(work_item.file.as_raw_fd(), footer_pos, &footer.to_bytes())?;
        work_item.resize_stream(footer_pos + ChunkFooter::BYTE_SIZE_U64)?;
        work_item.flush_to_disk()?;

        *self.footer.write().expect("Locking failed") = Some(footer);
        debug!(path = %self.path().display(), physical, "Chunk completed");
        Ok(footer)
    }

    /// Check the footer hash against the file content
    pub fn verify_hash(&self) -> DbResult<()> {
        let Some(footer) = self.footer() else {
            return Ok(());
        };
        let mut hasher = Sha256::new();
        let end = ChunkHeader::BYTE_SIZE_U64
            + u64::from(footer.physical_data_size)
            + u64::from(footer.map_size);
        Self::hash_file_range(&self.file, &mut hasher, 0, end)?;
        let hash: [u8; 32] = hasher.finalize().into();
        if hash != footer.hash {
            return Err(DbError::HashMismatch { path: self.path() });
        }
        Ok(())
    }

    /// Read the record frame starting at `physical` offset of the data region
    ///
    /// Returns the record and the frame length, or `None` if no complete
    /// frame is available there.
    pub fn read_frame(&self, physical: u64) -> DbResult<Option<(LogRecord, u64)>> {
        let data_size = self.physical_data_size();
        if data_size < physical + LogRecord::FRAME_OVERHEAD_U64 {
            return Ok(None);
        }
        let fd = self.file.as_raw_fd();
        let file_pos = ChunkHeader::BYTE_SIZE_U64 + physical;
        let mut prefix = [0u8; 4];
        pread_exact(fd, file_pos, &mut prefix)?;
        let position = self.start_position() + i64::expect_from(physical);
        let body_len = u64::from(
            LogRecord::frame_body_len(prefix)
                .map_err(|source| DbError::CorruptRecord { position, source })?,
        );
        let frame_len = body_len + LogRecord::FRAME_OVERHEAD_U64;
        if data_size < physical + frame_len {
            return Ok(None);
        }
        let mut frame = vec![0u8; usize::expect_from(frame_len)];
        pread_exact(fd, file_pos, &mut frame)?;
        let record = LogRecord::read_framed(&frame)
            .map_err(|source| DbError::CorruptRecord { position, source })?;
        Ok(Some((record, frame_len)))
    }

    /// Find where the first record at or after a local logical position is stored
    ///
    /// Returns `(logical, physical)` local positions.
    pub fn locate(&self, local_logical: u64) -> Option<(u64, u64)> {
        if !self.header.is_scavenged {
            return Some((local_logical, local_logical));
        }
        let idx = self
            .pos_map
            .partition_point(|entry| entry.log_pos < local_logical);
        self.pos_map
            .get(idx)
            .map(|entry| (entry.log_pos, u64::from(entry.actual_pos)))
    }

    /// Open a reader with its own file handle
    pub fn acquire_bulk_reader(self: &Arc<Self>) -> DbResult<BulkReader> {
        let file = File::open(self.path())?;
        Ok(BulkReader::new(self.clone(), file))
    }
}
