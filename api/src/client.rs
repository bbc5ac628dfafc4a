use binrw::binrw;
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Outcome of a client write
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum OperationResult {
    Success = 0,
    CommitTimeout = 2,
    ForwardTimeout = 3,
    /// Write could never be stored, e.g. an event larger than a chunk
    InvalidTransaction = 6,
}
