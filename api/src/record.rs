//! Log records
//!
//! Every record in a chunk is framed as `[u32 len][record][u32 len]`.
//! The repeated length makes it possible to detect torn writes,
//! and to walk the log backwards.
use binrw::{binrw, BinRead, BinWrite};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;

use crate::{CorrelationId, EpochId, NodeId};

#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    #[brw(magic(1u8))]
    Data(DataRecord),
    #[brw(magic(2u8))]
    System(SystemRecord),
}

/// Client written data
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRecord {
    pub log_position: i64,
    pub timestamp: i64,
    pub correlation_id: CorrelationId,
    #[br(temp)]
    #[bw(calc = u32::try_from(data.len()).expect("record too large"))]
    data_len: u32,
    #[br(count = data_len)]
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum SystemRecordType {
    Invalid = 0,
    Epoch = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum SystemRecordSerialization {
    Unknown = 0,
    Binary = 1,
}

/// Record written by the node itself
#[binrw]
#[brw(big)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemRecord {
    pub log_position: i64,
    pub timestamp: i64,
    pub record_type: SystemRecordType,
    pub serialization: SystemRecordSerialization,
    pub reserved: u64,
    #[br(temp)]
    #[bw(calc = u32::try_from(data.len()).expect("record too large"))]
    data_len: u32,
    #[br(count = data_len)]
    pub data: Vec<u8>,
}

/// Leadership term boundary
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EpochRecord {
    /// Log position of the system record carrying this epoch
    pub epoch_position: i64,
    pub epoch_number: i32,
    pub epoch_id: EpochId,
    /// Position of the previous epoch, `-1` for the first one
    pub prev_epoch_position: i64,
    pub time_stamp: i64,
    pub leader_instance_id: NodeId,
}

impl EpochRecord {
    pub fn to_system_record(&self) -> SystemRecord {
        let mut data = Cursor::new(vec![]);
        self.write(&mut data).expect("can't fail");
        SystemRecord {
            log_position: self.epoch_position,
            timestamp: self.time_stamp,
            record_type: SystemRecordType::Epoch,
            serialization: SystemRecordSerialization::Binary,
            reserved: 0,
            data: data.into_inner(),
        }
    }
}

impl DataRecord {
    /// Size of a framed data record minus its payload
    pub const FRAMED_OVERHEAD: usize = LogRecord::FRAME_OVERHEAD + 1 + 8 + 8 + 16 + 4;
}

impl SystemRecord {
    pub fn epoch(&self) -> Option<EpochRecord> {
        if self.record_type != SystemRecordType::Epoch {
            return None;
        }
        EpochRecord::read(&mut Cursor::new(&self.data)).ok()
    }
}

impl LogRecord {
    /// Length prefix and suffix
    pub const FRAME_OVERHEAD: usize = 8;
    pub const FRAME_OVERHEAD_U64: u64 = 8;
    pub const MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Data(r) => r.log_position,
            LogRecord::System(r) => r.log_position,
        }
    }

    pub fn epoch(&self) -> Option<EpochRecord> {
        match self {
            LogRecord::System(r) => r.epoch(),
            LogRecord::Data(_) => None,
        }
    }

    /// Append the framed record to `buf`, returning the frame length
    pub fn write_framed(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        {
            let mut cursor = Cursor::new(&mut *buf);
            cursor.set_position(u64::try_from(start + 4).expect("can't fail"));
            self.write(&mut cursor).expect("can't fail");
        }
        let body_len = u32::try_from(buf.len() - start - 4).expect("record too large");
        buf[start..start + 4].copy_from_slice(&body_len.to_be_bytes());
        buf.extend_from_slice(&body_len.to_be_bytes());
        buf.len() - start
    }

    pub fn to_framed_bytes(&self) -> Vec<u8> {
        let mut buf = vec![];
        self.write_framed(&mut buf);
        buf
    }

    /// Length of the record body announced by a frame prefix
    pub fn frame_body_len(prefix: [u8; 4]) -> binrw::BinResult<u32> {
        let len = u32::from_be_bytes(prefix);
        if len == 0 || Self::MAX_RECORD_SIZE < len {
            return Err(binrw::Error::AssertFail {
                pos: 0,
                message: format!("invalid record length: {len}"),
            });
        }
        Ok(len)
    }

    /// Parse a whole frame (prefix, body and suffix)
    pub fn read_framed(frame: &[u8]) -> binrw::BinResult<Self> {
        if frame.len() < Self::FRAME_OVERHEAD {
            return Err(binrw::Error::AssertFail {
                pos: 0,
                message: "frame too short".into(),
            });
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&frame[..4]);
        let body_len = usize::try_from(Self::frame_body_len(prefix)?).expect("can't fail");
        if frame.len() != body_len + Self::FRAME_OVERHEAD
            || frame[frame.len() - 4..] != frame[..4]
        {
            return Err(binrw::Error::AssertFail {
                pos: 0,
                message: "record suffix does not match".into(),
            });
        }
        Self::read(&mut Cursor::new(&frame[4..4 + body_len]))
    }
}
