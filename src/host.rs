//! Host memory-manager boundary.
//!
//! The engine never walks page tables itself. Everything that touches a
//! PTE, a page lock or an anon-vma goes through [`MemHost`], which the host
//! kernel implements over its own mm primitives. The engine side of the
//! contract: it holds the area's mm read lock across `follow_page` and PTE
//! mutation, and the page lock across write-protect and replace.

use alloc::vec::Vec;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Physical frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(pub u64);

/// Opaque PTE snapshot. Only the host interprets the bits; the engine just
/// hands values back for compare-and-restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteVal(pub u64);

/// Host process address-space handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmId(pub u32);

/// Host mapping (VMA) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub u32);

/// Host anon-vma handle, the root object reverse walks traverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnonVmaId(pub u32);

bitflags::bitflags! {
    /// Mapping attributes relevant to eligibility.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const FILE_BACKED = 1 << 0;
        const IO          = 1 << 1;
        const DONT_EXPAND = 1 << 2;
        const RESERVED    = 1 << 3;
        const HUGETLB     = 1 << 4;
        const INSERTED    = 1 << 5;
        const NONLINEAR   = 1 << 6;
        const MIXED_MAP   = 1 << 7;
        const SAO         = 1 << 8;
        const SHARED      = 1 << 9;
        const MAY_SHARE   = 1 << 10;
        const GROWS_UP    = 1 << 11;
        const GROWS_DOWN  = 1 << 12;
    }
}

impl VmFlags {
    /// What kind of mapping is considered? Only plain private anonymous
    /// memory enters the engine.
    pub fn can_enter(self) -> bool {
        !self.intersects(
            VmFlags::FILE_BACKED
                | VmFlags::IO
                | VmFlags::DONT_EXPAND
                | VmFlags::RESERVED
                | VmFlags::HUGETLB
                | VmFlags::INSERTED
                | VmFlags::NONLINEAR
                | VmFlags::MIXED_MAP
                | VmFlags::SAO
                | VmFlags::SHARED
                | VmFlags::MAY_SHARE
                | VmFlags::GROWS_UP
                | VmFlags::GROWS_DOWN,
        )
    }
}

// Low bits of a page's mapping word. Anonymous pages carry ANON; merged
// pages carry ANON | KSM with the stable node handle in the upper bits.
// Freeing an anonymous page resets the word to zero, which is what the
// keyhole check relies on.
pub const MAPPING_ANON: u64 = 0x1;
pub const MAPPING_KSM: u64 = 0x2;
pub const MAPPING_FLAG_BITS: u32 = 2;

#[inline]
pub fn mapping_is_anon(token: u64) -> bool {
    token & MAPPING_ANON != 0
}

#[inline]
pub fn mapping_is_ksm(token: u64) -> bool {
    token & (MAPPING_ANON | MAPPING_KSM) == (MAPPING_ANON | MAPPING_KSM)
}

/// PTE pair returned by a successful write-protect.
#[derive(Debug, Clone, Copy)]
pub struct WpPte {
    /// Value the PTE had before the protect (what a restore puts back).
    pub orig: PteVal,
    /// Value now installed (what replace/restore expect to find).
    pub wprot: PteVal,
}

/// Why a host primitive could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFault {
    /// No page, page gone, or PTE no longer what the caller expected.
    NoPage,
    /// Raised page count indicated concurrent I/O on the page.
    Busy,
}

/// Outcome of a forced write fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// COW has been broken; the mapping is private again.
    Wrote,
    /// The mapping vanished underneath the fault.
    Sigbus,
    /// Fault handling failed on memory pressure.
    Oom,
    /// Transient failure; the fault should be retried.
    Retry,
}

/// Outcome of `try_to_unmap_one`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapOutcome {
    Done,
    Fail,
}

/// Primitives the engine requires from the host memory manager.
pub trait MemHost: Send + Sync {
    // Areas and address spaces.
    fn area_mm(&self, area: AreaId) -> MmId;
    fn area_start(&self, area: AreaId) -> u64;
    fn area_pages(&self, area: AreaId) -> usize;
    fn area_flags(&self, area: AreaId) -> VmFlags;
    fn area_anon_vma(&self, area: AreaId) -> Option<AnonVmaId>;
    /// Trylock the per-mm read lock; the scanner never blocks on it.
    fn mm_try_read_lock(&self, mm: MmId) -> bool;
    fn mm_read_unlock(&self, mm: MmId);
    /// True once the owning process is past the point of no return.
    fn mm_exiting(&self, mm: MmId) -> bool;

    // Pages.
    /// Resolve the page mapped at `addr`, taking a reference when `get`.
    fn follow_page(&self, area: AreaId, addr: u64, get: bool) -> Option<Pfn>;
    /// Map the frame for reading in the engine's address space.
    fn page_map(&self, pfn: Pfn) -> *const u8;
    /// Map the frame for writing; only used on engine-owned scratch pages.
    fn page_map_mut(&self, pfn: Pfn) -> *mut u8;
    /// get_page_unless_zero.
    fn try_get_page(&self, pfn: Pfn) -> bool;
    fn get_page(&self, pfn: Pfn);
    fn put_page(&self, pfn: Pfn);
    fn page_trylock(&self, pfn: Pfn) -> bool;
    fn page_lock(&self, pfn: Pfn);
    fn page_unlock(&self, pfn: Pfn);
    fn page_count(&self, pfn: Pfn) -> u32;
    fn page_mapcount(&self, pfn: Pfn) -> u32;
    fn page_swapcache(&self, pfn: Pfn) -> bool;
    /// Raw mapping word; see the MAPPING_* constants.
    fn page_mapping(&self, pfn: Pfn) -> u64;
    fn set_page_mapping(&self, pfn: Pfn, token: u64);
    fn page_anon_vma(&self, pfn: Pfn) -> Option<AnonVmaId>;
    fn mark_page_accessed(&self, pfn: Pfn);
    /// Virtual address of the page inside the area, if still mapped there.
    fn page_address_in_area(&self, pfn: Pfn, area: AreaId) -> Option<u64>;

    // PTE mutation. All three require the caller to hold the page lock and
    // the area's mm read lock.
    /// Snapshot + write-protect + TLB flush, with the
    /// `mapcount + 1 + swapcache == page_count` check against concurrent
    /// direct I/O.
    fn write_protect_page(&self, area: AreaId, pfn: Pfn) -> Result<WpPte, HostFault>;
    /// Atomically repoint the PTE from `old` to `new`, transferring rmap
    /// accounting, provided the PTE still equals `expected`.
    fn replace_page(&self, area: AreaId, old: Pfn, new: Pfn, expected: PteVal)
        -> Result<(), HostFault>;
    /// Inverse of write-protect: put `orig` back if the PTE still equals
    /// `expected_wprot`.
    fn restore_pte(
        &self,
        area: AreaId,
        addr: u64,
        orig: PteVal,
        expected_wprot: PteVal,
    ) -> Result<(), HostFault>;
    /// Force a write fault at `addr` to break COW.
    fn handle_write_fault(&self, area: AreaId, addr: u64) -> FaultOutcome;
    /// Current PTE value at `addr`, if present.
    fn pte_snapshot(&self, area: AreaId, addr: u64) -> Option<PteVal>;
    fn pte_pfn(&self, pte: PteVal) -> Option<Pfn>;
    fn pte_writable(&self, pte: PteVal) -> bool;

    // Anon-vma graph, for reverse walks.
    /// Pin the anon-vma (external reference count +1).
    fn anon_vma_get(&self, av: AnonVmaId);
    /// Drop the pin; the host frees the anon-vma once the count and its
    /// mapping list are both empty.
    fn anon_vma_put(&self, av: AnonVmaId);
    fn anon_vma_lock(&self, av: AnonVmaId);
    fn anon_vma_unlock(&self, av: AnonVmaId);
    /// All areas (including forks) attached to the anon-vma.
    fn anon_vma_areas(&self, av: AnonVmaId) -> Vec<AreaId>;
    fn area_start_end(&self, area: AreaId) -> (u64, u64);

    // Reverse-walk visitors, dispatched by the engine per (page, area,
    // address) triple.
    fn page_referenced_one(&self, pfn: Pfn, area: AreaId, addr: u64) -> bool;
    fn try_to_unmap_one(&self, pfn: Pfn, area: AreaId, addr: u64) -> UnmapOutcome;
    fn page_mapped(&self, pfn: Pfn) -> bool;

    // Calibration support.
    fn alloc_scratch_page(&self) -> Option<Pfn>;
    fn free_scratch_page(&self, pfn: Pfn);
    fn monotonic_ms(&self) -> u64;
}

/// View a frame as a byte slice for hashing and comparison.
///
/// The caller must hold a reference (or the page lock) on the frame so the
/// host keeps it mapped for the duration of the borrow.
#[inline]
pub(crate) fn page_bytes<'a>(host: &'a dyn MemHost, pfn: Pfn) -> &'a [u8] {
    let ptr = host.page_map(pfn);
    // SAFETY: the host maps every live frame for PAGE_SIZE bytes; the
    // reference held by the caller keeps the frame alive.
    unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_rejects_special_mappings() {
        assert!(VmFlags::empty().can_enter());
        assert!(!VmFlags::FILE_BACKED.can_enter());
        assert!(!VmFlags::SHARED.can_enter());
        assert!(!(VmFlags::GROWS_DOWN | VmFlags::HUGETLB).can_enter());
    }

    #[test]
    fn mapping_token_flags() {
        assert!(mapping_is_anon(MAPPING_ANON));
        assert!(!mapping_is_ksm(MAPPING_ANON));
        assert!(mapping_is_ksm(MAPPING_ANON | MAPPING_KSM));
        assert!(!mapping_is_anon(0));
    }
}
