//! End-to-end correctness and coverage properties (spec.md §8, properties
//! 1-2), exercised offline: query construction feeds straight into the XOR
//! responder and the reconstructor, with no sockets involved. Covers every
//! request mode across randomly generated `k`, `r`, block counts, and
//! requested-block sets.

use proptest::prelude::*;
use raid_pir::query::{self, Mode};
use raid_pir::reconstruct::Reconstructor;
use raid_pir::responder;
use raid_pir::store::BlockStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;

const BLOCKSIZE: usize = 8;

fn block_value(index: u32) -> u8 {
    (index % 251) as u8
}

fn make_store(blockcount: usize) -> (tempfile::TempDir, BlockStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..blockcount {
        file.write_all(&vec![block_value(i as u32); BLOCKSIZE]).unwrap();
    }
    let store = BlockStore::open(&path, BLOCKSIZE, blockcount).unwrap();
    (dir, store)
}

/// Runs `blocks` through `build_queries` -> `responder::answer` ->
/// `Reconstructor`, with no mirror ever failing, and asserts every
/// requested block comes back byte-identical to the database (property 1)
/// and that the plan credits exactly the expected number of contributors
/// per block (property 2).
fn assert_round_trip(mode: Mode, k: usize, r: usize, blockcount: usize, blocks: &[u32], seed: u64) {
    let (_dir, store) = make_store(blockcount);
    let mut rng = StdRng::seed_from_u64(seed);
    let built = query::build_queries(blocks, blockcount, k, r, mode, &mut rng).unwrap();

    let expected_contributors = if mode == Mode::Plain { k } else { r };
    for entry in &built.plan.entries {
        assert_eq!(
            entry.contributors.len(),
            expected_contributors,
            "block {} has the wrong number of planned contributors",
            entry.block_index
        );
    }
    assert_eq!(built.plan.entries.len(), blocks.len());

    let mut reconstructor = Reconstructor::new(&built.plan, BLOCKSIZE);
    for (mirror, (queries, labels)) in built
        .queries
        .iter()
        .zip(built.reply_labels.iter())
        .enumerate()
    {
        for (message, label_set) in queries.iter().zip(labels.iter()) {
            let replies = responder::answer(&store, message).unwrap();
            assert_eq!(replies.len(), label_set.len());
            for (label, reply) in label_set.iter().zip(replies.iter()) {
                if let Some(finished) = reconstructor.contribute(mirror, *label, reply).unwrap() {
                    assert_eq!(finished, vec![block_value(*label); BLOCKSIZE]);
                }
            }
        }
    }
    assert!(reconstructor.is_complete(), "not every requested block was reconstructed");
}

fn plain_case() -> impl Strategy<Value = (usize, usize, Vec<u32>, u64)> {
    (8usize..96, 2usize..6, any::<u64>()).prop_flat_map(|(blockcount, k, seed)| {
        (
            Just(blockcount),
            Just(k),
            prop::collection::btree_set(0u32..blockcount as u32, 1..6),
            Just(seed),
        )
    }).prop_map(|(blockcount, k, blocks, seed)| {
        (blockcount, k, blocks.into_iter().collect(), seed)
    })
}

fn chunked_case() -> impl Strategy<Value = (usize, usize, usize, Vec<u32>, u64)> {
    (2usize..6, 1usize..4, any::<u64>()).prop_flat_map(|(k, chunks_per_mirror, seed)| {
        let blockcount = k * 8 * chunks_per_mirror;
        (
            Just(k),
            2usize..=k,
            Just(blockcount),
            prop::collection::btree_set(0u32..blockcount as u32, 1..6),
            Just(seed),
        )
    }).prop_map(|(k, r, blockcount, blocks, seed)| {
        (k, r, blockcount, blocks.into_iter().collect(), seed)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plain_mode_reconstructs_every_requested_block(
        (blockcount, k, blocks, seed) in plain_case()
    ) {
        prop_assume!(!blocks.is_empty());
        assert_round_trip(Mode::Plain, k, 0, blockcount, &blocks, seed);
    }

    #[test]
    fn chunked_mode_reconstructs_every_requested_block(
        (k, r, blockcount, blocks, seed) in chunked_case()
    ) {
        prop_assume!(!blocks.is_empty());
        assert_round_trip(Mode::Chunked, k, r, blockcount, &blocks, seed);
    }

    #[test]
    fn seeded_mode_reconstructs_every_requested_block(
        (k, r, blockcount, blocks, seed) in chunked_case()
    ) {
        prop_assume!(!blocks.is_empty());
        assert_round_trip(Mode::Seeded, k, r, blockcount, &blocks, seed);
    }

    #[test]
    fn seeded_parallel_mode_reconstructs_every_requested_block(
        (k, r, blockcount, blocks, seed) in chunked_case()
    ) {
        prop_assume!(!blocks.is_empty());
        assert_round_trip(Mode::SeededParallel, k, r, blockcount, &blocks, seed);
    }
}
