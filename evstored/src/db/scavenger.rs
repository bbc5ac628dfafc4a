use std::sync::Arc;

use convi::ExpectFrom;
use evstored_api::{ChunkHeader, LogRecord, PosMapEntry};
use tracing::{debug, info};

use super::chunk::Chunk;
use super::{ChunkDb, DbError, DbResult};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScavengeStats {
    pub records_kept: u64,
    pub records_removed: u64,
    pub old_data_size: u64,
    pub new_data_size: u64,
}

/// Completed chunks covering exactly `start..=end`
fn chunks_in_range(db: &ChunkDb, start: u32, end: u32) -> DbResult<Vec<Arc<Chunk>>> {
    let invalid = || DbError::InvalidScavengeRange { start, end };
    if end < start {
        return Err(invalid());
    }
    let mut chunks = vec![];
    let mut number = start;
    while number <= end {
        let chunk = db.get_chunk(number).ok_or_else(invalid)?;
        let header = chunk.header();
        if header.chunk_start_number != number || end < header.chunk_end_number {
            return Err(invalid());
        }
        if !chunk.is_completed() {
            return Err(invalid());
        }
        number = header.chunk_end_number + 1;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Merge chunks `start..=end` into a single new chunk version
///
/// System records are always kept; data records only if `keep` says so.
pub(crate) fn scavenge(
    db: &ChunkDb,
    start: u32,
    end: u32,
    mut keep: impl FnMut(&LogRecord) -> bool,
) -> DbResult<ScavengeStats> {
    let chunks = chunks_in_range(db, start, end)?;
    let header = ChunkHeader::new(db.chunk_size(), start, end, true);
    let range_start = header.chunk_start_position();
    let range_end = header.chunk_end_position();

    let temp_path = db.config().naming().new_temp_path();
    let merged = Chunk::create_new(&temp_path, header, Chunk::active_file_size(&header))?;
    debug!(start, end, path = %temp_path.display(), "Scavenging chunks");

    let mut stats = ScavengeStats::default();
    let mut map = vec![];
    for chunk in &chunks {
        stats.old_data_size += chunk.physical_data_size();
    }

    let mut position = range_start;
    while position < range_end {
        let Some((record, next)) = db.read_forward(position)? else {
            break;
        };
        if range_end <= record.log_position() {
            break;
        }
        position = next;
        let is_system = matches!(record, LogRecord::System(_));
        if !is_system && !keep(&record) {
            stats.records_removed += 1;
            continue;
        }
        map.push(PosMapEntry {
            log_pos: u64::expect_from(record.log_position() - range_start),
            actual_pos: u32::expect_from(merged.physical_data_size()),
        });
        merged.append(&record.to_framed_bytes())?;
        stats.records_kept += 1;
    }

    stats.new_data_size = merged.physical_data_size();
    merged.complete_with_map(&map)?;
    drop(merged);

    db.switch_chunk(&temp_path)?;
    info!(
        start,
        end,
        kept = stats.records_kept,
        removed = stats.records_removed,
        old_size = stats.old_data_size,
        new_size = stats.new_data_size,
        "Scavenging done"
    );
    Ok(stats)
}
