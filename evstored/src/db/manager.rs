use std::collections::BTreeMap;
use std::sync::Arc;

use super::chunk::Chunk;

/// Ordered set of open chunks
///
/// Keyed by chunk start number. A scavenged chunk covers a range of
/// numbers, so lookups go to the closest chunk starting at or before
/// the number and check its end.
#[derive(Debug, Default)]
pub struct ChunkManager {
    chunks: BTreeMap<u32, Arc<Chunk>>,
}

impl ChunkManager {
    pub fn get_chunk(&self, number: u32) -> Option<&Arc<Chunk>> {
        self.chunks
            .range(..=number)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.header().covers(number))
    }

    pub fn last_chunk(&self) -> Option<&Arc<Chunk>> {
        self.chunks.values().next_back()
    }

    /// Number the next new chunk would get
    pub fn chunks_count(&self) -> u32 {
        self.last_chunk()
            .map(|chunk| chunk.header().chunk_end_number + 1)
            .unwrap_or_default()
    }

    /// Add a chunk, returning the chunks it replaced
    pub fn add_chunk(&mut self, chunk: Arc<Chunk>) -> Vec<Arc<Chunk>> {
        let start = chunk.header().chunk_start_number;
        let end = chunk.header().chunk_end_number;
        let replaced_keys: Vec<u32> = self
            .chunks
            .iter()
            .filter(|(_, c)| {
                let header = c.header();
                header.chunk_start_number <= end && start <= header.chunk_end_number
            })
            .map(|(key, _)| *key)
            .collect();
        let replaced = replaced_keys
            .into_iter()
            .filter_map(|key| self.chunks.remove(&key))
            .collect();
        self.chunks.insert(start, chunk);
        replaced
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.values()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
