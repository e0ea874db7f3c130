//! Adaptive random-sampling page hash.
//!
//! A page is fingerprinted by mixing `strength` 4-byte words drawn from a
//! fixed random permutation of the page's word positions. The strength is
//! tuned at run time by the hash controller: weak hashes are cheap, strong
//! hashes collide less. Because the mixing step is invertible, a hash
//! computed at one strength can be converted to any other strength by
//! extending or unwinding the mix, without re-reading unchanged words.

use crate::host::{MemHost, PAGE_SIZE};

use alloc::vec::Vec;

/// Number of 4-byte words in a page; the strength needed to read it whole.
pub const HASH_STRENGTH_FULL: usize = PAGE_SIZE / 4;

/// Maximum strength; positions past the page length re-read the first words
/// ("loop-back") for a stronger but non-terminating mix.
pub const HASH_STRENGTH_MAX: usize = HASH_STRENGTH_FULL + 10;

/// Cap on the exponent used when stepping the strength up or down.
pub const HASH_STRENGTH_DELTA_MAX: u32 = 5;

// 32/3 < they < 32/2
const SHIFTL: u32 = 8;
const SHIFTR: u32 = 12;

/// Minimal xorshift generator, good enough for scan-order shuffling.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform value in `[0, bound)`. `bound` must be non-zero.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Sampling state: the position permutation, the live strength and the
/// cost/benefit counters feeding the hash controller.
pub struct HashState {
    /// Random permutation of word positions, fixed for the engine lifetime.
    random_nums: Vec<u32>,
    /// Current sampling strength, in [1, HASH_STRENGTH_MAX].
    pub strength: usize,
    /// Exponent for the next strength step (step size is 2^delta).
    pub strength_delta: u32,
    /// Time saved by sampled hashing, in hash-word units.
    pub pos: u64,
    /// Time wasted on collisions and full compares, in hash-word units.
    pub neg: u64,
    /// Cost of one page compare relative to hashing one word, calibrated
    /// at startup.
    pub memcmp_cost: u64,
    pub rng: XorShift64,
}

#[inline]
fn page_word(page: &[u8], pos: usize) -> u32 {
    let base = pos * 4;
    u32::from_ne_bytes([page[base], page[base + 1], page[base + 2], page[base + 3]])
}

impl HashState {
    pub fn new(seed: u64) -> Self {
        let mut rng = XorShift64::new(seed);
        let mut random_nums: Vec<u32> = (0..HASH_STRENGTH_FULL as u32).collect();
        for i in 0..HASH_STRENGTH_FULL {
            let rand_range = (HASH_STRENGTH_FULL - i) as u64;
            let swap_index = rng.below(rand_range) as usize;
            random_nums.swap(i, swap_index);
        }

        Self {
            random_nums,
            strength: HASH_STRENGTH_FULL >> 4,
            strength_delta: 0,
            pos: 0,
            neg: 0,
            memcmp_cost: 1,
            rng,
        }
    }

    #[inline]
    fn mix_range(&self, page: &[u8], mut hash: u32, from: usize, to: usize) -> u32 {
        for index in from..to {
            let pos = self.random_nums[index] as usize;
            hash = hash.wrapping_add(page_word(page, pos));
            hash = hash.wrapping_add(hash << SHIFTL);
            hash ^= hash >> SHIFTR;
        }
        hash
    }

    #[inline]
    fn unmix_range(&self, page: &[u8], mut hash: u32, from: usize, to: usize) -> u32 {
        let mut index = from;
        while index > to {
            index -= 1;
            hash ^= hash >> SHIFTR;
            hash ^= hash >> (SHIFTR * 2);
            hash = hash.wrapping_sub(hash << SHIFTL);
            hash = hash.wrapping_add(hash << (SHIFTL * 2));
            let pos = self.random_nums[index] as usize;
            hash = hash.wrapping_sub(page_word(page, pos));
        }
        hash
    }

    /// Word position sampled at permutation index `index`.
    #[cfg(test)]
    pub(crate) fn sample_position(&self, index: usize) -> usize {
        self.random_nums[index] as usize
    }

    /// Hash a page at the given strength.
    pub fn sample_hash(&self, page: &[u8], strength: usize) -> u32 {
        debug_assert_eq!(page.len(), PAGE_SIZE);

        let mut hash = 0xdeadbeef_u32;
        let loop_to = strength.min(HASH_STRENGTH_FULL);
        hash = self.mix_range(page, hash, 0, loop_to);

        if strength > HASH_STRENGTH_FULL {
            hash = self.mix_range(page, hash, 0, strength - HASH_STRENGTH_FULL);
        }
        hash
    }

    /// Convert a hash computed at strength `from` to the value it would have
    /// had at strength `to`, extending or unwinding the mix. Bit-exact with
    /// `sample_hash(page, to)`.
    pub fn delta_hash(&self, page: &[u8], from: usize, to: usize, hash: u32) -> u32 {
        if to > from {
            if from >= HASH_STRENGTH_FULL {
                self.mix_range(page, hash, from - HASH_STRENGTH_FULL, to - HASH_STRENGTH_FULL)
            } else if to <= HASH_STRENGTH_FULL {
                self.mix_range(page, hash, from, to)
            } else {
                let h = self.mix_range(page, hash, from, HASH_STRENGTH_FULL);
                self.mix_range(page, h, 0, to - HASH_STRENGTH_FULL)
            }
        } else if from <= HASH_STRENGTH_FULL {
            self.unmix_range(page, hash, from, to)
        } else if to >= HASH_STRENGTH_FULL {
            self.unmix_range(page, hash, from - HASH_STRENGTH_FULL, to - HASH_STRENGTH_FULL)
        } else {
            let h = self.unmix_range(page, hash, from - HASH_STRENGTH_FULL, 0);
            self.unmix_range(page, h, HASH_STRENGTH_FULL, to)
        }
    }

    /// Hash at the live strength, crediting the words not read.
    pub fn page_hash(&mut self, page: &[u8], cost_accounting: bool) -> u32 {
        let val = self.sample_hash(page, self.strength);
        if cost_accounting {
            self.pos += (HASH_STRENGTH_FULL - self.strength.min(HASH_STRENGTH_FULL)) as u64;
        }
        val
    }

    /// Extend a current-strength hash to HASH_STRENGTH_MAX. Zero is reserved
    /// for "not yet computed", so a zero result is substituted with one.
    pub fn page_hash_max(&mut self, page: &[u8], hash_old: u32) -> u32 {
        let mut hash_max = self.delta_hash(page, self.strength, HASH_STRENGTH_MAX, hash_old);
        if hash_max == 0 {
            hash_max = 1;
        }
        self.neg += (HASH_STRENGTH_MAX - self.strength) as u64;
        hash_max
    }

    pub fn inc_strength(&mut self, delta: u32) {
        self.strength += 1usize << delta;
        if self.strength > HASH_STRENGTH_MAX {
            self.strength = HASH_STRENGTH_MAX;
        }
    }

    pub fn dec_strength(&mut self, delta: u32) {
        let change = 1usize << delta;
        if self.strength <= change + 1 {
            self.strength = 1;
        } else {
            self.strength -= change;
        }
    }

    pub fn inc_strength_delta(&mut self) {
        self.strength_delta += 1;
        if self.strength_delta > HASH_STRENGTH_DELTA_MAX {
            self.strength_delta = HASH_STRENGTH_DELTA_MAX;
        }
    }

    /// Measure the cost of a full page compare relative to hashing one word.
    /// Runs the full-strength hash and a page compare until each consumes a
    /// comparable stretch of wall time, then records the ratio.
    pub fn calibrate(&mut self, host: &dyn MemHost) -> bool {
        let p1 = match host.alloc_scratch_page() {
            Some(p) => p,
            None => return false,
        };
        let p2 = match host.alloc_scratch_page() {
            Some(p) => p,
            None => {
                host.free_scratch_page(p1);
                return false;
            }
        };

        {
            let fill = self.rng.next_u32() as u8;
            let a1 = host.page_map_mut(p1);
            let a2 = host.page_map_mut(p2);
            // SAFETY: both frames were just handed to us by the host and are
            // mapped for the engine's exclusive use until freed below.
            unsafe {
                core::ptr::write_bytes(a1, fill, PAGE_SIZE);
                core::ptr::copy_nonoverlapping(a1, a2, PAGE_SIZE);
                // the two pages must differ in the last byte
                *a2.add(PAGE_SIZE - 1) = !*a2.add(PAGE_SIZE - 1);
            }
        }

        let bytes1 = crate::host::page_bytes(host, p1);
        let bytes2 = crate::host::page_bytes(host, p2);
        let window_ms = (HASH_STRENGTH_FULL / 10) as u64;

        let mut loopnum: u64 = 0;
        let time_start = host.monotonic_ms();
        while host.monotonic_ms() - time_start < window_ms {
            for _ in 0..100 {
                core::hint::black_box(self.sample_hash(bytes1, HASH_STRENGTH_FULL));
            }
            loopnum += 100;
        }
        let hash_cost = 100 * (host.monotonic_ms() - time_start).max(1);
        let cost_unit = (hash_cost / HASH_STRENGTH_FULL as u64).max(1);

        let time_start = host.monotonic_ms();
        for _ in 0..loopnum {
            core::hint::black_box(bytes1 == bytes2);
        }
        let memcmp_cost = 100 * (host.monotonic_ms() - time_start).max(1);
        self.memcmp_cost = (memcmp_cost / cost_unit).max(1);
        log::info!("mm/uksm: relative memcmp_cost = {}", self.memcmp_cost);

        host.free_scratch_page(p1);
        host.free_scratch_page(p2);
        true
    }
}
