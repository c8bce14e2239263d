use bitvec::prelude::*;

use super::BlockLayout;
use crate::filter::FilterError;

// lingo:
// - slot: one fingerprint-sized window in the FSA. Slots are not partitioned
//   per bucket; bucket b owns the run of slots starting at the sum of the
//   fullness counters of all buckets before it.
// - FSA/FCA/OTA: fingerprint storage, fullness counters, overflow tracking.
//   All three are MSB-first packed bit arrays, serialized in that order.
#[derive(Debug)]
pub(crate) struct Block {
    no: usize,
    fsa: BitVec<u8, Msb0>,
    fca: BitVec<u8, Msb0>,
    ota: BitVec<u8, Msb0>,
    layout: BlockLayout,
}

impl Block {
    pub(crate) fn new(no: usize, layout: BlockLayout) -> Self {
        Block {
            no,
            fsa: bitvec![u8, Msb0; 0; layout.fingerprints_per_block * layout.fingerprint_bits],
            fca: bitvec![u8, Msb0; 0; layout.buckets_per_block * layout.counter_bits()],
            ota: bitvec![u8, Msb0; 0; layout.ota_bits],
            layout,
        }
    }

    pub(crate) fn no(&self) -> usize {
        self.no
    }

    pub(crate) fn bucket_capacity(&self, lbi: usize) -> usize {
        let bits = self.layout.counter_bits();
        self.fca[lbi * bits..(lbi + 1) * bits].load_be::<usize>()
    }

    fn set_bucket_capacity(&mut self, lbi: usize, cap: usize) {
        let bits = self.layout.counter_bits();
        self.fca[lbi * bits..(lbi + 1) * bits].store_be(cap);
    }

    /// Slot index of the first fingerprint owned by bucket `lbi`.
    fn bucket_start(&self, lbi: usize) -> usize {
        (0..lbi).map(|b| self.bucket_capacity(b)).sum()
    }

    /// True while the FSA has an unused slot. Fingerprint 0 is the empty
    /// sentinel, and stored fingerprints are left-compacted, so it suffices
    /// to look at the last slot.
    pub(crate) fn has_capacity(&self) -> bool {
        self.slot(self.layout.fingerprints_per_block - 1) == 0
    }

    /// True iff bucket `lbi` has a free logical slot and the FSA has room.
    pub(crate) fn fits(&self, lbi: usize) -> bool {
        self.bucket_capacity(lbi) < self.layout.slots_per_bucket && self.has_capacity()
    }

    pub(crate) fn slot(&self, index: usize) -> u32 {
        let bits = self.layout.fingerprint_bits;
        self.fsa[index * bits..(index + 1) * bits].load_be::<u32>()
    }

    fn write_slot(&mut self, index: usize, fp: u32) {
        let bits = self.layout.fingerprint_bits;
        self.fsa[index * bits..(index + 1) * bits].store_be(fp);
    }

    /// Appends `fp` to bucket `lbi`'s run, shifting the FSA suffix one slot
    /// towards the end. The discarded trailing slot is zero by the
    /// `has_capacity` precondition.
    pub(crate) fn simple_store(&mut self, lbi: usize, fp: u32) -> Result<(), FilterError> {
        let cap = self.bucket_capacity(lbi);
        if cap == self.layout.slots_per_bucket || !self.has_capacity() {
            return Err(FilterError::InvariantViolation(
                "simple_store called without a free slot",
            ));
        }
        let bits = self.layout.fingerprint_bits;
        let pos = (self.bucket_start(lbi) + cap) * bits;
        let tail = &mut self.fsa[pos..];
        if tail.len() > bits {
            tail.shift_right(bits);
        }
        self.fsa[pos..pos + bits].store_be(fp);
        self.set_bucket_capacity(lbi, cap + 1);
        Ok(())
    }

    /// Linear scan of bucket `lbi` for `fp`.
    pub(crate) fn read_and_cmp(&self, lbi: usize, fp: u32) -> bool {
        let start = self.bucket_start(lbi);
        (start..start + self.bucket_capacity(lbi)).any(|slot| self.slot(slot) == fp)
    }

    /// The fingerprints currently stored in bucket `lbi`, in insertion order.
    pub(crate) fn bucket_slots(&self, lbi: usize) -> Vec<u32> {
        let start = self.bucket_start(lbi);
        (start..start + self.bucket_capacity(lbi))
            .map(|slot| self.slot(slot))
            .collect()
    }

    /// All stored fingerprints tagged with their owning bucket, derived by
    /// walking the FCA front to back.
    pub(crate) fn entries(&self) -> Vec<(usize, u32)> {
        let mut entries = Vec::with_capacity(self.layout.fingerprints_per_block);
        let mut slot = 0;
        for bucket in 0..self.layout.buckets_per_block {
            for _ in 0..self.bucket_capacity(bucket) {
                entries.push((bucket, self.slot(slot)));
                slot += 1;
            }
        }
        entries
    }

    /// Overwrites one copy of `old` in bucket `lbi` with `new`. Capacities
    /// are untouched.
    pub(crate) fn replace(&mut self, lbi: usize, old: u32, new: u32) -> Result<(), FilterError> {
        let start = self.bucket_start(lbi);
        for slot in start..start + self.bucket_capacity(lbi) {
            if self.slot(slot) == old {
                self.write_slot(slot, new);
                return Ok(());
            }
        }
        Err(FilterError::InvariantViolation(
            "replace: fingerprint not found in its bucket",
        ))
    }

    /// Deletes one copy of `fp` from bucket `lbi`, closing the gap by
    /// shifting the FSA suffix one slot towards the front.
    pub(crate) fn remove(&mut self, lbi: usize, fp: u32) -> Result<(), FilterError> {
        let bits = self.layout.fingerprint_bits;
        let cap = self.bucket_capacity(lbi);
        let start = self.bucket_start(lbi);
        for slot in start..start + cap {
            if self.slot(slot) == fp {
                let tail = &mut self.fsa[slot * bits..];
                if tail.len() > bits {
                    tail.shift_left(bits);
                } else {
                    tail.fill(false);
                }
                self.set_bucket_capacity(lbi, cap - 1);
                return Ok(());
            }
        }
        Err(FilterError::InvariantViolation(
            "remove: fingerprint not found in its bucket",
        ))
    }

    fn ota_index(&self, lbi: usize) -> usize {
        lbi % self.layout.ota_bits
    }

    /// Records that some fingerprint whose primary bucket is `lbi` may live
    /// at its secondary location. Never cleared.
    pub(crate) fn set_ota(&mut self, lbi: usize) {
        let index = self.ota_index(lbi);
        self.ota.set(index, true);
    }

    pub(crate) fn get_ota(&self, lbi: usize) -> bool {
        self.ota[self.ota_index(lbi)]
    }

    /// `FSA ‖ FCA ‖ OTA` as ASCII bits, MSB first within each array.
    pub(crate) fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.fsa.len() + self.fca.len() + self.ota.len());
        let bits = self
            .fsa
            .iter()
            .by_vals()
            .chain(self.fca.iter().by_vals())
            .chain(self.ota.iter().by_vals());
        for bit in bits {
            out.push(if bit { '1' } else { '0' });
        }
        out
    }
}
