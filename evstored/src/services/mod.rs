//! Storage actors
//!
//! The storage writer is the single owner of the [`ChunkWriter`](crate::db::ChunkWriter),
//! the storage chaser follows what the writer made durable.
mod storage_chaser;
mod storage_writer;

use thiserror::Error;

pub use self::storage_chaser::{StorageChaserService, SERVICE_NAME as STORAGE_CHASER_SERVICE};
pub use self::storage_writer::{StorageWriterService, SERVICE_NAME as STORAGE_WRITER_SERVICE};
use crate::checkpoint::CheckpointError;
use crate::db::DbError;
use crate::epoch::EpochError;

/// Errors that stop a storage actor (and with it, the node)
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("database error")]
    Db(#[from] DbError),
    #[error("epoch error")]
    Epoch(#[from] EpochError),
    #[error("checkpoint error")]
    Checkpoint(#[from] CheckpointError),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
