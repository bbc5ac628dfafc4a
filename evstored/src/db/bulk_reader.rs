use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use convi::ExpectFrom;
use evstored_api::ChunkHeader;

use super::chunk::Chunk;
use super::{DbError, DbResult};
use crate::ioutil::pread_full;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BulkReadResult {
    /// Position before the read (raw file position or data position)
    pub old_position: u64,
    pub bytes_read: usize,
    pub is_eof: bool,
}

/// Sequential reader of a chunk file
///
/// Owns a separate file handle, so it never interferes with the
/// writer or other readers.
pub struct BulkReader {
    chunk: Arc<Chunk>,
    file: File,
    /// Raw position in the file
    position: u64,
}

impl BulkReader {
    pub(crate) fn new(chunk: Arc<Chunk>, file: File) -> Self {
        Self {
            chunk,
            file,
            position: 0,
        }
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    fn file_len(&self) -> DbResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_raw_position(&mut self, raw_position: u64) -> DbResult<()> {
        let len = self.file_len()?;
        if len <= raw_position {
            return Err(DbError::PositionOutOfBounds {
                position: raw_position,
                len,
            });
        }
        self.position = raw_position;
        Ok(())
    }

    pub fn set_data_position(&mut self, data_position: u64) -> DbResult<()> {
        let raw_position = data_position + ChunkHeader::BYTE_SIZE_U64;
        let len = self.file_len()?;
        if len <= raw_position {
            return Err(DbError::PositionOutOfBounds {
                position: raw_position,
                len,
            });
        }
        self.position = raw_position;
        Ok(())
    }

    /// Read file bytes verbatim, EOF at the end of file
    pub fn read_next_raw_bytes(&mut self, buf: &mut [u8]) -> DbResult<BulkReadResult> {
        let old_position = self.position;
        let bytes_read = pread_full(self.file.as_raw_fd(), self.position, buf)?;
        self.position += u64::expect_from(bytes_read);
        Ok(BulkReadResult {
            old_position,
            bytes_read,
            is_eof: self.file_len()? == self.position,
        })
    }

    /// Read record data, skipping the header
    ///
    /// Reads never go past the chunk's data size, and EOF is reported
    /// only once a completed chunk has been read to its end.
    pub fn read_next_data_bytes(&mut self, buf: &mut [u8]) -> DbResult<BulkReadResult> {
        if self.position == 0 {
            self.position = ChunkHeader::BYTE_SIZE_U64;
        }
        let old_position = self.position - ChunkHeader::BYTE_SIZE_U64;
        let data_size = self.chunk.physical_data_size();
        let to_read = usize::expect_from(
            data_size
                .saturating_sub(old_position)
                .min(u64::expect_from(buf.len())),
        );
        let bytes_read = pread_full(self.file.as_raw_fd(), self.position, &mut buf[..to_read])?;
        self.position += u64::expect_from(bytes_read);
        Ok(BulkReadResult {
            old_position,
            bytes_read,
            is_eof: self.chunk.is_completed()
                && old_position + u64::expect_from(bytes_read) == data_size,
        })
    }
}
