use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use convi::ExpectFrom;
use evstored_api::ChunkHeader;
use tracing::{debug, info};

use super::chunk::Chunk;
use super::{ChunkDbConfig, DbError, DbResult};
use crate::ioutil::{fsync, ftruncate, write_zeros};

/// Roll the on-disk log back to `truncate_chk`
///
/// Every step is safe to repeat, so a crash at any point is handled by
/// running the whole procedure again (the truncate checkpoint is
/// cleared only at the very end).
pub fn truncate_db(config: &ChunkDbConfig, mut truncate_chk: i64) -> DbResult<()> {
    let naming = config.naming();
    let writer = config.writer_checkpoint.read();
    let old_last_chunk_num = config.chunk_number_of(writer);
    let new_last_chunk_num = config.chunk_number_of(truncate_chk);

    info!(writer, truncate_chk, "Truncating chunk files");

    if !naming.versions_for(old_last_chunk_num + 1)?.is_empty() {
        return Err(DbError::ExtraneousChunk {
            number: old_last_chunk_num + 1,
        });
    }

    let mut target = None;
    let mut chunk_num = 0;
    while chunk_num <= new_last_chunk_num {
        let versions = naming.versions_for(chunk_num)?;
        let Some((_, path)) = versions.into_iter().next() else {
            if chunk_num != new_last_chunk_num {
                return Err(DbError::ChunkNotFound { number: chunk_num });
            }
            break;
        };
        let header = Chunk::read_header(&path)?;
        if new_last_chunk_num <= header.chunk_end_number {
            target = Some((header, path));
            break;
        }
        chunk_num = header.chunk_end_number + 1;
    }

    // Highest first, so the chunks on disk always form a prefix of the log
    for number in (new_last_chunk_num + 1..=old_last_chunk_num).rev() {
        remove_all_versions(config, number)?;
    }

    if let Some((header, path)) = target {
        if header.is_scavenged {
            truncate_chk = header.chunk_start_position();
            info!(
                truncate_chk,
                start = header.chunk_start_number,
                end = header.chunk_end_number,
                "Truncation point is inside a scavenged chunk, moving it to the chunk start"
            );
            for number in (header.chunk_start_number..=new_last_chunk_num).rev() {
                remove_all_versions(config, number)?;
            }
        } else {
            truncate_chunk_and_fill_with_zeros(&header, &path, truncate_chk)?;
        }
    }

    let epoch = config.epoch_checkpoint.read();
    if truncate_chk <= epoch {
        debug!(epoch, truncate_chk, "Invalidating epoch checkpoint");
        config.epoch_checkpoint.write(-1);
        config.epoch_checkpoint.flush()?;
    }

    if truncate_chk < config.chaser_checkpoint.read() {
        config.chaser_checkpoint.write(truncate_chk);
        config.chaser_checkpoint.flush()?;
    }

    if truncate_chk < config.writer_checkpoint.read() {
        config.writer_checkpoint.write(truncate_chk);
        config.writer_checkpoint.flush()?;
    }

    config.truncate_checkpoint.write(-1);
    config.truncate_checkpoint.flush()?;

    info!(truncate_chk, "Truncation done");
    Ok(())
}

fn remove_all_versions(config: &ChunkDbConfig, number: u32) -> DbResult<()> {
    for (_, path) in config.naming().versions_for(number)? {
        debug!(path = %path.display(), "Removing chunk file");
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Turn the chunk back into an active one, with data ending at `truncate_chk`
fn truncate_chunk_and_fill_with_zeros(
    header: &ChunkHeader,
    path: &std::path::Path,
    truncate_chk: i64,
) -> DbResult<()> {
    if header.is_scavenged
        || header.chunk_start_number != header.chunk_end_number
        || truncate_chk < header.chunk_start_position()
        || header.chunk_end_position() <= truncate_chk
    {
        return Err(DbError::CantTruncateChunk {
            path: path.to_owned(),
            position: truncate_chk,
        });
    }
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let fd = file.as_raw_fd();
    let file_size = Chunk::active_file_size(header);
    ftruncate(fd, file_size)?;
    let data_end =
        ChunkHeader::BYTE_SIZE_U64 + u64::expect_from(header.local_position(truncate_chk));
    debug!(path = %path.display(), data_end, "Zero-filling chunk");
    write_zeros(fd, data_end, file_size - data_end)?;
    fsync(fd)?;
    Ok(())
}
