//! Reconstructor (§4.R): combines mirror responses back into blocks.
//!
//! Built from a [`ReconstructionPlan`], one running XOR accumulator per
//! requested block, each waiting on a fixed set of contributor indices
//! (mirror roles assigned by the query builder - see the module comment
//! on `query.rs` for why reassigning a failed mirror means rerouting its
//! *logical* contributor index to a different physical connection rather
//! than changing this plan). A block is finished the moment its last
//! contributor arrives; XOR being commutative and associative, arrival
//! order never matters.

use crate::bitvec;
use crate::error::RaidPirError;
use crate::query::ReconstructionPlan;
use std::collections::{HashMap, HashSet};

struct Accumulator {
    bytes: Vec<u8>,
    remaining: HashSet<usize>,
}

pub struct Reconstructor {
    accumulators: HashMap<u32, Accumulator>,
}

impl Reconstructor {
    pub fn new(plan: &ReconstructionPlan, blocksize: usize) -> Self {
        let mut accumulators = HashMap::with_capacity(plan.entries.len());
        for entry in &plan.entries {
            accumulators.insert(
                entry.block_index,
                Accumulator {
                    bytes: vec![0u8; blocksize],
                    remaining: entry.contributors.iter().copied().collect(),
                },
            );
        }
        Reconstructor { accumulators }
    }

    /// Applies one contributor's reply for `block_index`. Returns the
    /// finished block once every planned contributor has landed.
    pub fn contribute(
        &mut self,
        contributor: usize,
        block_index: u32,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, RaidPirError> {
        let acc = self.accumulators.get_mut(&block_index).ok_or_else(|| {
            RaidPirError::ProtocolError(format!(
                "reply for block {} which is not part of the plan (already finished, or never requested)",
                block_index
            ))
        })?;
        if !acc.remaining.remove(&contributor) {
            return Err(RaidPirError::ProtocolError(format!(
                "contributor {} is not a pending source for block {}",
                contributor, block_index
            )));
        }
        bitvec::xor_into(&mut acc.bytes, data)?;
        if acc.remaining.is_empty() {
            let finished = self.accumulators.remove(&block_index).unwrap();
            Ok(Some(finished.bytes))
        } else {
            Ok(None)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub fn pending_blocks(&self) -> Vec<u32> {
        self.accumulators.keys().copied().collect()
    }

    /// The contributor indices still owed for `block_index`, if it hasn't
    /// finished yet.
    pub fn remaining_contributors(&self, block_index: u32) -> Option<&HashSet<usize>> {
        self.accumulators.get(&block_index).map(|a| &a.remaining)
    }
}
