//! Server-side XOR computation (§4.X).
//!
//! Each entry in an incoming [`MirrorQuery`] names a chunk and a bit
//! vector (explicit, or a seed the PRNG expands to one). The responder
//! XORs together every database block whose bit is set within that
//! chunk's block range and returns the accumulator. A query carries one
//! entry per reply block; entries never share an accumulator, so the
//! mirror can compute and return them independently of each other.

use crate::bitvec::{self, ChunkLayout};
use crate::error::RaidPirError;
use crate::prng;
use crate::protocol::{ChunkEntry, MirrorQuery};
use crate::store::BlockStore;

/// Computes every reply block owed for `query`, in entry order.
pub fn answer(store: &BlockStore, query: &MirrorQuery) -> Result<Vec<Vec<u8>>, RaidPirError> {
    match query {
        MirrorQuery::Plain(vector) => Ok(vec![xor_plain(store, vector)?]),
        MirrorQuery::Chunked(k, entries) | MirrorQuery::Seeded(k, entries) => {
            let layout = ChunkLayout::new(*k as usize, store.blockcount())?;
            entries
                .iter()
                .map(|entry| xor_entry(store, &layout, entry))
                .collect()
        }
        MirrorQuery::SeededOne(k, entry) => {
            let layout = ChunkLayout::new(*k as usize, store.blockcount())?;
            Ok(vec![xor_entry(store, &layout, entry)?])
        }
    }
}

fn xor_plain(store: &BlockStore, vector: &[u8]) -> Result<Vec<u8>, RaidPirError> {
    let mut acc = vec![0u8; store.blocksize()];
    let mut block_buf = vec![0u8; store.blocksize()];
    for i in 0..store.blockcount() {
        if bitvec::test_bit(vector, i) {
            store.read_block_into(i, &mut block_buf)?;
            bitvec::xor_into(&mut acc, &block_buf)?;
        }
    }
    Ok(acc)
}

fn xor_entry(
    store: &BlockStore,
    layout: &ChunkLayout,
    entry: &ChunkEntry,
) -> Result<Vec<u8>, RaidPirError> {
    let chunk_index = entry.chunk_index() as usize;
    let (first, last) = layout.block_range(chunk_index);

    let bits = match entry {
        ChunkEntry::Explicit { vector, .. } => vector.clone(),
        ChunkEntry::Seeded { seed, .. } => {
            prng::expand(seed, layout.chunk_byte_len(chunk_index))?
        }
    };

    let mut acc = vec![0u8; store.blocksize()];
    let mut block_buf = vec![0u8; store.blocksize()];
    for b in first..last {
        if bitvec::test_bit(&bits, b - first) {
            store.read_block_into(b, &mut block_buf)?;
            bitvec::xor_into(&mut acc, &block_buf)?;
        }
    }
    Ok(acc)
}
