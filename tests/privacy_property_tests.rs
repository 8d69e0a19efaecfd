//! Statistical PIR privacy (spec.md §8, property 3): for any single mirror
//! and two equal-size block requests, that mirror's share of the query must
//! be drawn from the same distribution regardless of which blocks were
//! actually requested.
//!
//! This is tested the way the shape of the construction makes checkable
//! without a distinguisher: every mirror except the one holding the
//! "combiner" share draws its bits purely from the shared RNG, so fixing
//! the RNG seed and varying only the requested block must leave those
//! mirrors' shares bit-for-bit identical. The combiner share differs (it
//! has to, or reconstruction couldn't work) but must keep the same shape
//! (byte length) no matter which block was requested.

use proptest::prelude::*;
use raid_pir::protocol::{ChunkEntry, MirrorQuery};
use raid_pir::query::{self, Mode};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn plain_share(built: &query::BuiltQueries, mirror: usize) -> Vec<u8> {
    match &built.queries[mirror][0] {
        MirrorQuery::Plain(v) => v.clone(),
        other => panic!("expected a Plain query, got {:?}", other),
    }
}

fn chunked_explicit_share(built: &query::BuiltQueries, mirror: usize) -> Vec<u8> {
    match &built.queries[mirror][0] {
        MirrorQuery::Chunked(_, entries) => match &entries[0] {
            ChunkEntry::Explicit { vector, .. } => vector.clone(),
            other => panic!("expected an explicit entry, got {:?}", other),
        },
        other => panic!("expected a Chunked query, got {:?}", other),
    }
}

proptest! {
    #[test]
    fn plain_mode_non_combiner_shares_are_request_independent(
        blockcount in 16usize..128,
        k in 2usize..6,
        seed in any::<u64>(),
    ) {
        let block_a = 0u32;
        let block_b = (blockcount as u32) - 1;
        prop_assume!(block_a != block_b);

        let mut rng_a = StdRng::seed_from_u64(seed);
        let built_a = query::build_queries(&[block_a], blockcount, k, 0, Mode::Plain, &mut rng_a).unwrap();
        let mut rng_b = StdRng::seed_from_u64(seed);
        let built_b = query::build_queries(&[block_b], blockcount, k, 0, Mode::Plain, &mut rng_b).unwrap();

        // The first k-1 mirrors' shares come only from the shared RNG
        // sequence, never from the requested block index.
        for mirror in 0..k - 1 {
            prop_assert_eq!(
                plain_share(&built_a, mirror),
                plain_share(&built_b, mirror),
                "mirror {}'s share leaked which block was requested",
                mirror
            );
        }

        // The combiner share necessarily differs, but any single mirror's
        // view must have the same shape whichever block was requested.
        let combiner = k - 1;
        prop_assert_eq!(plain_share(&built_a, combiner).len(), plain_share(&built_b, combiner).len());
    }

    #[test]
    fn chunked_mode_non_combiner_shares_are_request_independent_within_a_chunk(
        chunks_per_mirror in 1usize..4,
        k in 2usize..6,
        r in 2usize..6,
        seed in any::<u64>(),
    ) {
        prop_assume!(r <= k);
        let blockcount = k * 8 * chunks_per_mirror;
        // Two distinct blocks guaranteed to land in chunk 0 together.
        let block_a = 0u32;
        let block_b = 1u32;

        let mut rng_a = StdRng::seed_from_u64(seed);
        let built_a = query::build_queries(&[block_a], blockcount, k, r, Mode::Chunked, &mut rng_a).unwrap();
        let mut rng_b = StdRng::seed_from_u64(seed);
        let built_b = query::build_queries(&[block_b], blockcount, k, r, Mode::Chunked, &mut rng_b).unwrap();

        let contributors_a = &built_a.plan.entries[0].contributors;
        let contributors_b = &built_b.plan.entries[0].contributors;
        prop_assert_eq!(contributors_a, contributors_b, "same chunk must assign the same responsible mirrors");

        let combiner = contributors_a[0];
        for &mirror in &contributors_a[1..] {
            prop_assert_eq!(
                chunked_explicit_share(&built_a, mirror),
                chunked_explicit_share(&built_b, mirror),
                "mirror {}'s non-combiner share leaked which block in the chunk was requested",
                mirror
            );
        }
        prop_assert_eq!(
            chunked_explicit_share(&built_a, combiner).len(),
            chunked_explicit_share(&built_b, combiner).len()
        );
    }
}
