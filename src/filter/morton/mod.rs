//! Morton filter as described in Breslow & Jayasena's paper: a cuckoo filter
//! compressed into cache-line-sized blocks. Each block packs a fingerprint
//! storage array (FSA), per-bucket fullness counters (FCA) and an overflow
//! tracking array (OTA); buckets share the block's fingerprint slots instead
//! of owning fixed ones, which is where the space saving comes from.

mod block;

use std::hash::Hasher;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use twox_hash::XxHash32;

use crate::filter::{Filter, FilterError};
use block::Block;

const HASH_BITS: usize = 32;

/// Give up on an insert after this many displacements.
const MAX_KICKS: usize = 8000;

// Alternate-bucket displacements, indexed by fingerprint mod 32. All entries
// are odd: together with an even bucket-count domain this keeps the
// sign-by-parity step self-inverse after reduction mod N.
const OFFSETS: [usize; 32] = [
    83, 149, 211, 277, 337, 397, 457, 521, 587, 653, 719, 787, 853, 919, 983, 1051, 1117, 1181,
    1249, 1319, 1399, 1459, 1511, 1571, 1637, 1699, 1759, 1823, 1889, 1951, 2017, 1579,
];

/// 32-bit xxHash with a fixed seed. The serialized filter is consumed by
/// external tools, so the hash must not vary between runs or hosts.
pub fn hash32(key: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(key);
    hasher.finish() as u32
}

/// Derives a `bits`-wide fingerprint from the top bits of the key hash.
/// Zero is reserved for empty slots, so it maps to 1.
pub fn fingerprint(key: &[u8], bits: usize) -> u32 {
    let fp = hash32(key) >> (HASH_BITS - bits);
    if fp == 0 {
        1
    } else {
        fp
    }
}

/// Bit-level geometry of a single block.
///
/// The default is the 512-bit configuration from the paper: 46 eight-bit
/// fingerprints, 64 buckets of three slots with two-bit counters, and a
/// 16-bit OTA, which together fill one cache line exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub fingerprint_bits: usize,
    pub buckets_per_block: usize,
    pub slots_per_bucket: usize,
    pub fingerprints_per_block: usize,
    pub ota_bits: usize,
}

impl Default for BlockLayout {
    fn default() -> Self {
        BlockLayout {
            fingerprint_bits: 8,
            buckets_per_block: 64,
            slots_per_bucket: 3,
            fingerprints_per_block: 46,
            ota_bits: 16,
        }
    }
}

impl BlockLayout {
    /// Width of one fullness counter: enough bits for the values `0..=S`.
    pub fn counter_bits(&self) -> usize {
        (self.slots_per_bucket + 1).next_power_of_two().trailing_zeros() as usize
    }

    /// Physical size of a serialized block in bits.
    pub fn block_bits(&self) -> usize {
        self.fingerprints_per_block * self.fingerprint_bits
            + self.buckets_per_block * self.counter_bits()
            + self.ota_bits
    }

    fn validate(&self) -> Result<(), FilterError> {
        if self.fingerprint_bits == 0 || self.fingerprint_bits > HASH_BITS {
            return Err(FilterError::ParameterError {
                param: "fingerprint_bits",
                constraint: "must be in 1..=32",
                value: self.fingerprint_bits,
            });
        }
        if self.buckets_per_block == 0 {
            return Err(FilterError::ParameterError {
                param: "buckets_per_block",
                constraint: "must be nonzero",
                value: self.buckets_per_block,
            });
        }
        if self.slots_per_bucket == 0 {
            return Err(FilterError::ParameterError {
                param: "slots_per_bucket",
                constraint: "must be nonzero",
                value: self.slots_per_bucket,
            });
        }
        if self.fingerprints_per_block == 0 {
            return Err(FilterError::ParameterError {
                param: "fingerprints_per_block",
                constraint: "must be nonzero",
                value: self.fingerprints_per_block,
            });
        }
        if self.ota_bits == 0 {
            return Err(FilterError::ParameterError {
                param: "ota_bits",
                constraint: "must be nonzero",
                value: self.ota_bits,
            });
        }
        Ok(())
    }
}

/// A Morton filter: an ordered sequence of equally-shaped blocks addressed
/// by two-choice hashing over `blocks * buckets_per_block` logical buckets.
#[derive(Debug)]
pub struct MortonFilter {
    blocks: Vec<Block>,
    layout: BlockLayout,
    items: u64,
    rng: Xoshiro256PlusPlus,
}

impl MortonFilter {
    /// Constructs a filter with the default layout and a random eviction
    /// seed.
    pub fn new(blocks: usize) -> Result<Self, FilterError> {
        Self::with_layout(blocks, BlockLayout::default(), rand::random())
    }

    /// Constructs a filter with the default layout and a fixed eviction
    /// seed, for reproducible serialized output.
    pub fn with_seed(blocks: usize, seed: u64) -> Result<Self, FilterError> {
        Self::with_layout(blocks, BlockLayout::default(), seed)
    }

    pub fn with_layout(
        blocks: usize,
        layout: BlockLayout,
        seed: u64,
    ) -> Result<Self, FilterError> {
        layout.validate()?;
        if blocks == 0 {
            return Err(FilterError::ParameterError {
                param: "blocks",
                constraint: "must be nonzero",
                value: blocks,
            });
        }
        let buckets = blocks * layout.buckets_per_block;
        // An odd domain would break the sign-by-parity cancellation of the
        // alternate-bucket function: reduction mod an odd count can turn an
        // odd displacement even.
        if buckets % 2 != 0 {
            return Err(FilterError::ParameterError {
                param: "buckets",
                constraint: "blocks * buckets_per_block must be even",
                value: buckets,
            });
        }
        Ok(MortonFilter {
            blocks: (0..blocks).map(|no| Block::new(no, layout)).collect(),
            layout,
            items: 0,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        })
    }

    /// Number of fingerprints stored.
    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The global two-choice hashing domain, `blocks * buckets_per_block`.
    pub fn bucket_count(&self) -> usize {
        self.blocks.len() * self.layout.buckets_per_block
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    fn fingerprint(&self, key: &[u8]) -> u32 {
        fingerprint(key, self.layout.fingerprint_bits)
    }

    /// Primary bucket for a key.
    fn primary_bucket(&self, key: &[u8]) -> usize {
        hash32(key) as usize % self.bucket_count()
    }

    fn locate(&self, bucket: usize) -> (usize, usize) {
        (
            bucket / self.layout.buckets_per_block,
            bucket % self.layout.buckets_per_block,
        )
    }

    fn displacement(&self, fp: u32) -> usize {
        OFFSETS[fp as usize % OFFSETS.len()] % self.bucket_count()
    }

    /// The partner bucket of `bucket` for fingerprint `fp`. Self-inverse:
    /// odd buckets add the displacement, even buckets subtract it, and the
    /// two applications cancel under a single wrap into `[0, N)`.
    pub fn alternate_bucket(&self, bucket: usize, fp: u32) -> usize {
        let n = self.bucket_count();
        let d = self.displacement(fp);
        let sum = if bucket & 1 == 1 {
            bucket + d
        } else {
            bucket + n - d
        };
        if sum >= n {
            sum - n
        } else {
            sum
        }
    }

    fn bucket_fits(&self, bucket: usize) -> bool {
        let (blk, lbi) = self.locate(bucket);
        self.blocks[blk].fits(lbi)
    }

    /// Inserts `key`. Re-inserting a key already reported present is a
    /// no-op: a second copy of the same fingerprint in the same bucket
    /// would be ambiguous during eviction.
    pub fn insert(&mut self, key: &[u8]) -> Result<(), FilterError> {
        let fp = self.fingerprint(key);
        if self.check(key) {
            return Ok(());
        }
        let primary = self.primary_bucket(key);
        let (blk1, lbi1) = self.locate(primary);
        if self.blocks[blk1].fits(lbi1) {
            self.blocks[blk1].simple_store(lbi1, fp)?;
            self.items += 1;
            return Ok(());
        }
        // the OTA bit must be up before anything can land at the secondary
        self.blocks[blk1].set_ota(lbi1);
        let secondary = self.alternate_bucket(primary, fp);
        let (blk2, lbi2) = self.locate(secondary);
        if self.blocks[blk2].fits(lbi2) {
            self.blocks[blk2].simple_store(lbi2, fp)?;
            self.items += 1;
            return Ok(());
        }
        self.resolve_conflict(primary, fp)?;
        self.items += 1;
        Ok(())
    }

    /// Whether `key` might be in the filter. No false negatives; the OTA
    /// bit decides whether the secondary bucket needs probing at all.
    pub fn check(&self, key: &[u8]) -> bool {
        let fp = self.fingerprint(key);
        let primary = self.primary_bucket(key);
        let (blk1, lbi1) = self.locate(primary);
        if self.blocks[blk1].read_and_cmp(lbi1, fp) {
            return true;
        }
        if !self.blocks[blk1].get_ota(lbi1) {
            return false;
        }
        let secondary = self.alternate_bucket(primary, fp);
        let (blk2, lbi2) = self.locate(secondary);
        self.blocks[blk2].read_and_cmp(lbi2, fp)
    }

    /// Cuckoo eviction. Carries the homeless `(bucket, fp)` pair through up
    /// to `MAX_KICKS` displacements; every iteration either stores it or
    /// swaps it for a resident that then becomes homeless.
    fn resolve_conflict(&mut self, bucket: usize, fp: u32) -> Result<(), FilterError> {
        let mut bucket = bucket;
        let mut fp = fp;
        for _ in 0..MAX_KICKS {
            let (blk, lbi) = self.locate(bucket);
            let kicked = if self.blocks[blk].bucket_capacity(lbi) == self.layout.slots_per_bucket {
                self.kick_from_bucket(bucket, fp)?
            } else {
                self.kick_from_block(bucket, fp)?
            };
            match kicked {
                None => return Ok(()),
                Some((next_bucket, evicted)) => {
                    bucket = next_bucket;
                    fp = evicted;
                }
            }
        }
        Err(FilterError::CapacityExhausted { kicks: MAX_KICKS })
    }

    /// Bucket overflow: the target bucket holds `S` fingerprints. Relocate
    /// one of them to its alternate bucket if that one has room; otherwise
    /// overwrite a random resident and hand the victim back for the next
    /// round.
    fn kick_from_bucket(
        &mut self,
        bucket: usize,
        fp: u32,
    ) -> Result<Option<(usize, u32)>, FilterError> {
        let (blk, lbi) = self.locate(bucket);
        let candidates = self.blocks[blk].bucket_slots(lbi);
        for &candidate in &candidates {
            let alt = self.alternate_bucket(bucket, candidate);
            if self.bucket_fits(alt) {
                self.blocks[blk].set_ota(lbi);
                let (alt_blk, alt_lbi) = self.locate(alt);
                self.blocks[alt_blk].simple_store(alt_lbi, candidate)?;
                // the store may have shifted this block's FSA, so re-scan
                // the bucket instead of reusing a slot index
                self.blocks[blk].replace(lbi, candidate, fp)?;
                return Ok(None);
            }
        }
        let victim = candidates[self.rng.gen_range(0..candidates.len())];
        self.blocks[blk].set_ota(lbi);
        self.blocks[blk].replace(lbi, victim, fp)?;
        Ok(Some((self.alternate_bucket(bucket, victim), victim)))
    }

    /// Block overflow: the target bucket has a free logical slot but the
    /// block's FSA is exhausted. Push any resident of the block to its
    /// alternate bucket (necessarily in another block) to free a physical
    /// slot, then store `fp` where it wanted to go.
    fn kick_from_block(
        &mut self,
        bucket: usize,
        fp: u32,
    ) -> Result<Option<(usize, u32)>, FilterError> {
        let (blk, lbi) = self.locate(bucket);
        let base = self.blocks[blk].no() * self.layout.buckets_per_block;
        let candidates = self.blocks[blk].entries();
        for &(home, candidate) in &candidates {
            let alt = self.alternate_bucket(base + home, candidate);
            if self.bucket_fits(alt) {
                let (alt_blk, alt_lbi) = self.locate(alt);
                self.blocks[blk].set_ota(home);
                self.blocks[alt_blk].simple_store(alt_lbi, candidate)?;
                self.blocks[blk].remove(home, candidate)?;
                self.blocks[blk].simple_store(lbi, fp)?;
                return Ok(None);
            }
        }
        let (home, victim) = candidates[self.rng.gen_range(0..candidates.len())];
        self.blocks[blk].set_ota(home);
        self.blocks[blk].remove(home, victim)?;
        self.blocks[blk].simple_store(lbi, fp)?;
        Ok(Some((self.alternate_bucket(base + home, victim), victim)))
    }

    /// The whole filter as ASCII bits: per block `FSA ‖ FCA ‖ OTA`, each
    /// block followed by a line feed. This is the on-disk contract consumed
    /// by downstream tools.
    pub fn serialize(&self) -> String {
        let mut out =
            String::with_capacity(self.blocks.len() * (self.layout.block_bits() + 1));
        for block in &self.blocks {
            out.push_str(&block.serialize());
            out.push('\n');
        }
        out
    }
}

impl Filter for MortonFilter {
    fn insert(&mut self, key: &[u8]) -> Result<(), FilterError> {
        MortonFilter::insert(self, key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.check(key)
    }

    /// Upper bound with both candidate buckets fully loaded: `2S` stored
    /// fingerprints compared against a `fingerprint_bits`-wide tag.
    fn fp_rate(&self) -> f64 {
        (2 * self.layout.slots_per_bucket) as f64
            / (1u64 << self.layout.fingerprint_bits) as f64
    }
}


#[cfg(test)]
mod serialization_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SEED: u64 = 1337;

    #[test]
    fn empty_filter_serializes_to_all_zero_lines() {
        let filter = MortonFilter::with_seed(3, SEED).unwrap();
        let expected = format!("{}\n", "0".repeat(512)).repeat(3);
        assert_eq!(filter.serialize(), expected);
    }

    #[test]
    fn each_block_serializes_to_one_line_of_block_bits() {
        let mut filter = MortonFilter::with_seed(2, SEED).unwrap();
        for i in 0..50usize {
            filter.insert(format!("item{}", i).as_bytes()).unwrap();
        }
        let serialized = filter.serialize();
        assert!(serialized.ends_with('\n'));
        let lines: Vec<&str> = serialized.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert_eq!(line.len(), filter.layout().block_bits());
            assert!(line.bytes().all(|b| b == b'0' || b == b'1'));
        }
    }

    #[test]
    fn single_insert_sets_exactly_fingerprint_and_counter_bits() {
        let mut filter = MortonFilter::with_seed(1, SEED).unwrap();
        filter.insert(b"10.11.1.2").unwrap();
        let fp = fingerprint(b"10.11.1.2", 8);
        let ones = filter.serialize().bytes().filter(|&b| b == b'1').count();
        // one stored fingerprint plus one fullness counter at 1
        assert_eq!(ones as u32, fp.count_ones() + 1);
    }

    #[test]
    fn serialization_is_deterministic_for_a_fixed_seed() {
        let build = || {
            let mut filter = MortonFilter::with_seed(4, SEED).unwrap();
            for i in 0..150usize {
                filter.insert(format!("item{}", i).as_bytes()).unwrap();
            }
            filter.serialize()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn serialized_filter_round_trips_through_a_file() -> anyhow::Result<()> {
        let mut filter = MortonFilter::with_seed(2, SEED).unwrap();
        for i in 0..30usize {
            filter.insert(format!("item{}", i).as_bytes())?;
        }
        let serialized = filter.serialize();
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(serialized.as_bytes())?;
        let on_disk = std::fs::read_to_string(file.path())?;
        assert_eq!(on_disk, serialized);
        Ok(())
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fingerprints_are_nonzero_and_in_range(
            key in proptest::collection::vec(any::<u8>(), 0..64),
            bits in 1usize..=32,
        ) {
            let fp = fingerprint(&key, bits);
            prop_assert_ne!(fp, 0);
            if bits < 32 {
                prop_assert!((fp as u64) < (1u64 << bits));
            }
        }

        #[test]
        fn alternate_bucket_roundtrip(
            blocks in 1usize..64,
            bucket_seed in any::<u64>(),
            fp in 1u32..256,
        ) {
            let filter = MortonFilter::with_seed(blocks, 7).unwrap();
            let n = filter.bucket_count();
            let bucket = (bucket_seed % n as u64) as usize;
            let alt = filter.alternate_bucket(bucket, fp);
            prop_assert!(alt < n);
            prop_assert_eq!(filter.alternate_bucket(alt, fp), bucket);
        }

        #[test]
        fn no_false_negatives_on_arbitrary_keys(
            keys in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                1..200,
            ),
        ) {
            // 16 blocks hold 736 fingerprints, far beyond the workload
            let mut filter = MortonFilter::with_seed(16, 99).unwrap();
            for key in &keys {
                filter.insert(key).unwrap();
            }
            for key in &keys {
                prop_assert!(filter.check(key));
            }
        }
    }
}
