//! Chunk file header and footer
//!
//! A chunk file is `[header][data][position map][footer]`, where the
//! position map exists only in scavenged chunks and the footer only
//! once the chunk was completed. Header and footer are both fixed
//! size, so a chunk can be located and validated without parsing
//! its records.
use binrw::{binrw, BinRead, BinWrite};
use std::io::Cursor;

use crate::ChunkId;

#[binrw]
#[brw(big, magic = b"EVCH")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    #[br(assert(version != 0))]
    pub version: u8,
    /// Size of the data region of a (non-scavenged) chunk
    pub chunk_size: u32,
    pub chunk_start_number: u32,
    pub chunk_end_number: u32,
    #[br(map = |x: u8| x != 0)]
    #[bw(map = |x: &bool| u8::from(*x))]
    pub is_scavenged: bool,
    pub chunk_id: ChunkId,
    /// Milliseconds since unix epoch
    #[brw(pad_after = 86)]
    pub creation_time: i64,
}

impl ChunkHeader {
    pub const BYTE_SIZE: usize = 128;
    pub const BYTE_SIZE_U64: u64 = 128;
    pub const CURRENT_VERSION: u8 = 1;

    pub fn new(chunk_size: u32, start_number: u32, end_number: u32, is_scavenged: bool) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            chunk_size,
            chunk_start_number: start_number,
            chunk_end_number: end_number,
            is_scavenged,
            chunk_id: ChunkId::new_random(),
            creation_time: crate::now_millis(),
        }
    }

    pub fn chunk_start_position(&self) -> i64 {
        i64::from(self.chunk_start_number) * i64::from(self.chunk_size)
    }

    /// Log position right after the last position this chunk can hold
    pub fn chunk_end_position(&self) -> i64 {
        (i64::from(self.chunk_end_number) + 1) * i64::from(self.chunk_size)
    }

    /// Translate a global log position to one relative to the chunk start
    pub fn local_position(&self, global: i64) -> i64 {
        global - self.chunk_start_position()
    }

    pub fn global_position(&self, local: i64) -> i64 {
        self.chunk_start_position() + local
    }

    pub fn covers(&self, chunk_number: u32) -> bool {
        self.chunk_start_number <= chunk_number && chunk_number <= self.chunk_end_number
    }

    pub fn to_bytes(&self) -> [u8; Self::BYTE_SIZE] {
        let mut buf = [0u8; Self::BYTE_SIZE];
        self.write(&mut Cursor::new(&mut buf[..]))
            .expect("can't fail");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }
}

/// Flags stored in the footer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChunkFlags(pub u8);

impl ChunkFlags {
    pub const IS_COMPLETED: u8 = 0b01;
    pub const IS_SCAVENGED: u8 = 0b10;

    pub fn is_completed(self) -> bool {
        self.0 & Self::IS_COMPLETED != 0
    }

    pub fn is_scavenged(self) -> bool {
        self.0 & Self::IS_SCAVENGED != 0
    }
}

#[binrw]
#[brw(big, magic = b"EVCF")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkFooter {
    #[br(map = |x: u8| ChunkFlags(x))]
    #[bw(map = |flags: &ChunkFlags| flags.0)]
    pub flags: ChunkFlags,
    /// Bytes of record data actually stored in the file
    pub physical_data_size: u32,
    /// Span of log positions the chunk covers
    pub logical_data_size: i64,
    /// Bytes of the position map following the data
    pub map_size: u32,
    /// SHA-256 of everything preceding the footer
    #[brw(pad_after = 75)]
    pub hash: [u8; 32],
}

impl ChunkFooter {
    pub const BYTE_SIZE: usize = 128;
    pub const BYTE_SIZE_U64: u64 = 128;

    pub fn to_bytes(&self) -> [u8; Self::BYTE_SIZE] {
        let mut buf = [0u8; Self::BYTE_SIZE];
        self.write(&mut Cursor::new(&mut buf[..]))
            .expect("can't fail");
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }
}

/// Entry of a scavenged chunk's position map
///
/// Maps position of a record relative to chunk start position
/// to where it actually is in the data region.
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PosMapEntry {
    pub log_pos: u64,
    pub actual_pos: u32,
}

impl PosMapEntry {
    pub const BYTE_SIZE: usize = 12;
}
