//! In-memory host for exercising the engine.
//!
//! Models just enough of a memory manager to be honest about the parts the
//! engine leans on: per-frame reference and map counts, the mapping word
//! the keyhole protocol reads, write-protected PTEs, COW faults, anon-vma
//! pinning with fork sharing, and a deterministic millisecond clock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::host::{
    mapping_is_ksm, AnonVmaId, AreaId, FaultOutcome, HostFault, MemHost, MmId, Pfn, PteVal,
    UnmapOutcome, VmFlags, WpPte, MAPPING_ANON, PAGE_SHIFT, PAGE_SIZE,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Pte {
    pfn: u64,
    writable: bool,
}

impl Pte {
    fn encode(self) -> PteVal {
        PteVal((self.pfn << 1) | self.writable as u64)
    }

    fn decode(val: PteVal) -> Self {
        Self {
            pfn: val.0 >> 1,
            writable: val.0 & 1 != 0,
        }
    }
}

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    count: u32,
    mapcount: u32,
    mapping: u64,
    anon_vma: Option<u32>,
    swapcache: bool,
    locked: bool,
    free: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            count: 0,
            mapcount: 0,
            mapping: 0,
            anon_vma: None,
            swapcache: false,
            locked: false,
            free: true,
        }
    }
}

struct Area {
    mm: u32,
    start: u64,
    pages: usize,
    flags: VmFlags,
    anon_vma: Option<u32>,
    ptes: BTreeMap<u64, Pte>,
    unmapped: bool,
}

struct Mm {
    read_locks: u32,
    busy: bool,
    exiting: bool,
}

struct AnonVma {
    external_refs: u32,
    areas: Vec<u32>,
    locked: bool,
    dead: bool,
}

#[derive(Default)]
struct State {
    frames: Vec<Frame>,
    free_frames: Vec<u64>,
    areas: BTreeMap<u32, Area>,
    mms: BTreeMap<u32, Mm>,
    anon_vmas: BTreeMap<u32, AnonVma>,
    next_area: u32,
    next_mm: u32,
    next_av: u32,
}

impl State {
    fn alloc_frame(&mut self) -> u64 {
        if let Some(pfn) = self.free_frames.pop() {
            let f = &mut self.frames[pfn as usize];
            f.data.fill(0);
            f.count = 0;
            f.mapcount = 0;
            f.mapping = 0;
            f.anon_vma = None;
            f.swapcache = false;
            f.locked = false;
            f.free = false;
            return pfn;
        }
        let pfn = self.frames.len() as u64;
        let mut frame = Frame::new();
        frame.free = false;
        self.frames.push(frame);
        pfn
    }

    fn frame(&self, pfn: Pfn) -> &Frame {
        &self.frames[pfn.0 as usize]
    }

    fn frame_mut(&mut self, pfn: Pfn) -> &mut Frame {
        &mut self.frames[pfn.0 as usize]
    }

    // freeing an anonymous page resets its mapping word, which is what the
    // engine's keyhole check relies on
    fn put_frame(&mut self, pfn: Pfn) {
        let f = self.frame_mut(pfn);
        assert!(f.count > 0, "put on a dead frame");
        f.count -= 1;
        if f.count == 0 {
            assert_eq!(f.mapcount, 0);
            f.mapping = 0;
            f.anon_vma = None;
            f.free = true;
            self.free_frames.push(pfn.0);
        }
    }

    fn unmap_pte(&mut self, area: u32, addr: u64) {
        let pte = self.areas.get_mut(&area).unwrap().ptes.remove(&addr);
        if let Some(pte) = pte {
            let pfn = Pfn(pte.pfn);
            self.frame_mut(pfn).mapcount -= 1;
            self.put_frame(pfn);
        }
    }

    fn maybe_free_anon_vma(&mut self, av: u32) {
        if let Some(v) = self.anon_vmas.get(&av) {
            if v.external_refs == 0 && v.areas.is_empty() {
                self.anon_vmas.get_mut(&av).unwrap().dead = true;
            }
        }
    }
}

pub struct MockHost {
    state: Mutex<State>,
    clock: AtomicU64,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            clock: AtomicU64::new(0),
        })
    }

    pub fn new_process(&self) -> MmId {
        let mut st = self.state.lock();
        let id = st.next_mm;
        st.next_mm += 1;
        st.mms.insert(
            id,
            Mm {
                read_locks: 0,
                busy: false,
                exiting: false,
            },
        );
        MmId(id)
    }

    /// Map `pages` fresh writable anonymous pages at `start`.
    pub fn mmap_anon(&self, mm: MmId, start: u64, pages: usize) -> AreaId {
        let mut st = self.state.lock();
        let area_id = st.next_area;
        st.next_area += 1;
        let av_id = st.next_av;
        st.next_av += 1;
        st.anon_vmas.insert(
            av_id,
            AnonVma {
                external_refs: 0,
                areas: alloc::vec![area_id],
                locked: false,
                dead: false,
            },
        );

        let mut ptes = BTreeMap::new();
        for i in 0..pages {
            let pfn = st.alloc_frame();
            let f = &mut st.frames[pfn as usize];
            f.count = 1;
            f.mapcount = 1;
            f.mapping = MAPPING_ANON;
            f.anon_vma = Some(av_id);
            ptes.insert(
                start + ((i as u64) << PAGE_SHIFT),
                Pte { pfn, writable: true },
            );
        }

        st.areas.insert(
            area_id,
            Area {
                mm: mm.0,
                start,
                pages,
                flags: VmFlags::empty(),
                anon_vma: Some(av_id),
                ptes,
                unmapped: false,
            },
        );
        AreaId(area_id)
    }

    /// Fork: a second process maps the same frames COW, sharing the
    /// anon-vma root.
    pub fn fork_area(&self, area: AreaId) -> (MmId, AreaId) {
        let mm = self.new_process();
        let mut st = self.state.lock();
        let (start, av, ptes) = {
            let a = st.areas.get(&area.0).unwrap();
            (a.start, a.anon_vma, a.ptes.clone())
        };
        let child_id = st.next_area;
        st.next_area += 1;

        let mut child_ptes = BTreeMap::new();
        for (addr, mut pte) in ptes {
            // both sides lose write access
            st.areas
                .get_mut(&area.0)
                .unwrap()
                .ptes
                .insert(addr, Pte { writable: false, ..pte });
            pte.writable = false;
            let f = &mut st.frames[pte.pfn as usize];
            f.count += 1;
            f.mapcount += 1;
            child_ptes.insert(addr, pte);
        }

        let pages = st.areas.get(&area.0).unwrap().pages;
        if let Some(av) = av {
            st.anon_vmas.get_mut(&av).unwrap().areas.push(child_id);
        }
        st.areas.insert(
            child_id,
            Area {
                mm: mm.0,
                start,
                pages,
                flags: VmFlags::empty(),
                anon_vma: av,
                ptes: child_ptes,
                unmapped: false,
            },
        );
        (mm, AreaId(child_id))
    }

    /// Unmap every page of the area, as munmap would. The area record
    /// stays so late engine references still resolve.
    pub fn munmap(&self, area: AreaId) {
        let mut st = self.state.lock();
        let addrs: Vec<u64> = st.areas.get(&area.0).unwrap().ptes.keys().copied().collect();
        for addr in addrs {
            st.unmap_pte(area.0, addr);
        }
        let av = {
            let a = st.areas.get_mut(&area.0).unwrap();
            a.unmapped = true;
            a.anon_vma
        };
        if let Some(av) = av {
            st.anon_vmas
                .get_mut(&av)
                .unwrap()
                .areas
                .retain(|&a| a != area.0);
            st.maybe_free_anon_vma(av);
        }
    }

    fn cow_break(st: &mut State, area: u32, addr: u64) -> FaultOutcome {
        let pte = match st.areas.get(&area).and_then(|a| a.ptes.get(&addr)) {
            Some(p) => *p,
            None => return FaultOutcome::Sigbus,
        };
        if pte.writable {
            return FaultOutcome::Wrote;
        }
        let old = Pfn(pte.pfn);
        let shared =
            st.frame(old).mapcount > 1 || mapping_is_ksm(st.frame(old).mapping);
        if !shared {
            st.areas.get_mut(&area).unwrap().ptes.insert(
                addr,
                Pte {
                    pfn: pte.pfn,
                    writable: true,
                },
            );
            return FaultOutcome::Wrote;
        }

        let av = st.areas.get(&area).unwrap().anon_vma;
        let new = st.alloc_frame();
        let copy = *st.frame(old).data;
        {
            let f = &mut st.frames[new as usize];
            *f.data = copy;
            f.count = 1;
            f.mapcount = 1;
            f.mapping = MAPPING_ANON;
            f.anon_vma = av;
        }
        st.areas
            .get_mut(&area)
            .unwrap()
            .ptes
            .insert(addr, Pte { pfn: new, writable: true });
        st.frame_mut(old).mapcount -= 1;
        st.put_frame(old);
        FaultOutcome::Wrote
    }

    /// Emulate a user-space write of one byte. Returns true when the write
    /// broke a merged page out of the stable copy (the host would report
    /// that through the cow hook).
    pub fn user_write(&self, area: AreaId, addr: u64, offset: usize, byte: u8) -> bool {
        let mut st = self.state.lock();
        let pte = *st.areas.get(&area.0).unwrap().ptes.get(&addr).unwrap();
        let was_merged = !pte.writable && mapping_is_ksm(st.frame(Pfn(pte.pfn)).mapping);
        if !pte.writable {
            assert_eq!(Self::cow_break(&mut st, area.0, addr), FaultOutcome::Wrote);
        }
        let pte = *st.areas.get(&area.0).unwrap().ptes.get(&addr).unwrap();
        st.frames[pte.pfn as usize].data[offset] = byte;
        was_merged
    }

    /// Overwrite a page's contents wholesale, COW-breaking first if needed.
    /// Returns true when the write detached a merged page.
    pub fn fill_page(&self, area: AreaId, addr: u64, data: &[u8; PAGE_SIZE]) -> bool {
        let mut st = self.state.lock();
        let pte = *st.areas.get(&area.0).unwrap().ptes.get(&addr).unwrap();
        let was_shared = !pte.writable
            && mapping_is_ksm(st.frame(Pfn(pte.pfn)).mapping);
        if !pte.writable {
            assert_eq!(Self::cow_break(&mut st, area.0, addr), FaultOutcome::Wrote);
        }
        let pte = *st.areas.get(&area.0).unwrap().ptes.get(&addr).unwrap();
        *st.frames[pte.pfn as usize].data = *data;
        was_shared
    }

    pub fn read_byte(&self, area: AreaId, addr: u64, offset: usize) -> u8 {
        let st = self.state.lock();
        let pte = st.areas.get(&area.0).unwrap().ptes.get(&addr).unwrap();
        st.frames[pte.pfn as usize].data[offset]
    }

    /// The frame currently mapped at (area, addr), without a reference.
    pub fn page_at(&self, area: AreaId, addr: u64) -> Option<Pfn> {
        let st = self.state.lock();
        st.areas
            .get(&area.0)
            .and_then(|a| a.ptes.get(&addr))
            .map(|p| Pfn(p.pfn))
    }

    pub fn set_mm_busy(&self, mm: MmId, busy: bool) {
        self.state.lock().mms.get_mut(&mm.0).unwrap().busy = busy;
    }

    pub fn set_mm_exiting(&self, mm: MmId) {
        self.state.lock().mms.get_mut(&mm.0).unwrap().exiting = true;
    }

    /// Migrate a frame's contents and identity to a fresh frame, fixing up
    /// every PTE, as the host's page migration would.
    pub fn migrate_frame(&self, old: Pfn) -> Pfn {
        let mut st = self.state.lock();
        let new = st.alloc_frame();
        let (data, count, mapcount, mapping, av, swap) = {
            let f = st.frame(old);
            (*f.data, f.count, f.mapcount, f.mapping, f.anon_vma, f.swapcache)
        };
        {
            let f = &mut st.frames[new as usize];
            *f.data = data;
            f.count = count;
            f.mapcount = mapcount;
            f.mapping = mapping;
            f.anon_vma = av;
            f.swapcache = swap;
        }
        let area_ids: Vec<u32> = st.areas.keys().copied().collect();
        for id in area_ids {
            let addrs: Vec<u64> = st.areas[&id]
                .ptes
                .iter()
                .filter(|(_, p)| p.pfn == old.0)
                .map(|(a, _)| *a)
                .collect();
            for addr in addrs {
                let pte = st.areas[&id].ptes[&addr];
                st.areas
                    .get_mut(&id)
                    .unwrap()
                    .ptes
                    .insert(addr, Pte { pfn: new, ..pte });
            }
        }
        {
            let f = &mut st.frames[old.0 as usize];
            f.count = 0;
            f.mapcount = 0;
            f.mapping = 0;
            f.free = true;
        }
        st.free_frames.push(old.0);
        Pfn(new)
    }

    pub fn frame_count(&self, pfn: Pfn) -> u32 {
        self.state.lock().frame(pfn).count
    }
}

impl MemHost for MockHost {
    fn area_mm(&self, area: AreaId) -> MmId {
        MmId(self.state.lock().areas[&area.0].mm)
    }

    fn area_start(&self, area: AreaId) -> u64 {
        self.state.lock().areas[&area.0].start
    }

    fn area_pages(&self, area: AreaId) -> usize {
        self.state.lock().areas[&area.0].pages
    }

    fn area_flags(&self, area: AreaId) -> VmFlags {
        self.state.lock().areas[&area.0].flags
    }

    fn area_anon_vma(&self, area: AreaId) -> Option<AnonVmaId> {
        self.state.lock().areas[&area.0].anon_vma.map(AnonVmaId)
    }

    fn mm_try_read_lock(&self, mm: MmId) -> bool {
        let mut st = self.state.lock();
        let m = st.mms.get_mut(&mm.0).unwrap();
        if m.busy {
            return false;
        }
        m.read_locks += 1;
        true
    }

    fn mm_read_unlock(&self, mm: MmId) {
        let mut st = self.state.lock();
        let m = st.mms.get_mut(&mm.0).unwrap();
        assert!(m.read_locks > 0);
        m.read_locks -= 1;
    }

    fn mm_exiting(&self, mm: MmId) -> bool {
        self.state.lock().mms[&mm.0].exiting
    }

    fn follow_page(&self, area: AreaId, addr: u64, get: bool) -> Option<Pfn> {
        let mut st = self.state.lock();
        let a = st.areas.get(&area.0)?;
        if a.unmapped {
            return None;
        }
        let pte = *a.ptes.get(&addr)?;
        if get {
            st.frame_mut(Pfn(pte.pfn)).count += 1;
        }
        Some(Pfn(pte.pfn))
    }

    fn page_map(&self, pfn: Pfn) -> *const u8 {
        self.state.lock().frame(pfn).data.as_ptr()
    }

    fn page_map_mut(&self, pfn: Pfn) -> *mut u8 {
        self.state.lock().frame_mut(pfn).data.as_mut_ptr()
    }

    fn try_get_page(&self, pfn: Pfn) -> bool {
        let mut st = self.state.lock();
        let f = st.frame_mut(pfn);
        if f.free || f.count == 0 {
            return false;
        }
        f.count += 1;
        true
    }

    fn get_page(&self, pfn: Pfn) {
        self.state.lock().frame_mut(pfn).count += 1;
    }

    fn put_page(&self, pfn: Pfn) {
        self.state.lock().put_frame(pfn);
    }

    fn page_trylock(&self, pfn: Pfn) -> bool {
        let mut st = self.state.lock();
        let f = st.frame_mut(pfn);
        if f.locked {
            return false;
        }
        f.locked = true;
        true
    }

    fn page_lock(&self, pfn: Pfn) {
        let mut st = self.state.lock();
        let f = st.frame_mut(pfn);
        assert!(!f.locked, "page lock held elsewhere");
        f.locked = true;
    }

    fn page_unlock(&self, pfn: Pfn) {
        let mut st = self.state.lock();
        let f = st.frame_mut(pfn);
        assert!(f.locked);
        f.locked = false;
    }

    fn page_count(&self, pfn: Pfn) -> u32 {
        self.state.lock().frame(pfn).count
    }

    fn page_mapcount(&self, pfn: Pfn) -> u32 {
        self.state.lock().frame(pfn).mapcount
    }

    fn page_swapcache(&self, pfn: Pfn) -> bool {
        self.state.lock().frame(pfn).swapcache
    }

    fn page_mapping(&self, pfn: Pfn) -> u64 {
        self.state.lock().frame(pfn).mapping
    }

    fn set_page_mapping(&self, pfn: Pfn, token: u64) {
        self.state.lock().frame_mut(pfn).mapping = token;
    }

    fn page_anon_vma(&self, pfn: Pfn) -> Option<AnonVmaId> {
        self.state.lock().frame(pfn).anon_vma.map(AnonVmaId)
    }

    fn mark_page_accessed(&self, _pfn: Pfn) {}

    fn page_address_in_area(&self, pfn: Pfn, area: AreaId) -> Option<u64> {
        let st = self.state.lock();
        st.areas
            .get(&area.0)?
            .ptes
            .iter()
            .find(|(_, p)| p.pfn == pfn.0)
            .map(|(addr, _)| *addr)
    }

    fn write_protect_page(&self, area: AreaId, pfn: Pfn) -> Result<WpPte, HostFault> {
        let mut st = self.state.lock();
        let addr = st
            .areas
            .get(&area.0)
            .and_then(|a| {
                a.ptes
                    .iter()
                    .find(|(_, p)| p.pfn == pfn.0)
                    .map(|(addr, _)| *addr)
            })
            .ok_or(HostFault::NoPage)?;
        let pte = st.areas[&area.0].ptes[&addr];

        if pte.writable {
            // no O_DIRECT-style extra references allowed while we flip it
            let f = st.frame(pfn);
            let swapped = f.swapcache as u32;
            if f.mapcount + 1 + swapped != f.count {
                return Err(HostFault::Busy);
            }
            let wprot = Pte {
                pfn: pte.pfn,
                writable: false,
            };
            st.areas.get_mut(&area.0).unwrap().ptes.insert(addr, wprot);
            Ok(WpPte {
                orig: pte.encode(),
                wprot: wprot.encode(),
            })
        } else {
            Ok(WpPte {
                orig: pte.encode(),
                wprot: pte.encode(),
            })
        }
    }

    fn replace_page(
        &self,
        area: AreaId,
        old: Pfn,
        new: Pfn,
        expected: PteVal,
    ) -> Result<(), HostFault> {
        let mut st = self.state.lock();
        let addr = st
            .areas
            .get(&area.0)
            .and_then(|a| {
                a.ptes
                    .iter()
                    .find(|(_, p)| p.pfn == old.0)
                    .map(|(addr, _)| *addr)
            })
            .ok_or(HostFault::NoPage)?;
        let pte = st.areas[&area.0].ptes[&addr];
        if pte.encode() != expected {
            return Err(HostFault::NoPage);
        }

        st.frame_mut(new).count += 1;
        st.frame_mut(new).mapcount += 1;
        st.areas.get_mut(&area.0).unwrap().ptes.insert(
            addr,
            Pte {
                pfn: new.0,
                writable: false,
            },
        );
        st.frame_mut(old).mapcount -= 1;
        st.put_frame(old);
        Ok(())
    }

    fn restore_pte(
        &self,
        area: AreaId,
        addr: u64,
        orig: PteVal,
        expected_wprot: PteVal,
    ) -> Result<(), HostFault> {
        let mut st = self.state.lock();
        let pte = *st
            .areas
            .get(&area.0)
            .and_then(|a| a.ptes.get(&addr))
            .ok_or(HostFault::NoPage)?;
        if pte.encode() != expected_wprot {
            // already copied, let it be
            return Err(HostFault::NoPage);
        }
        st.areas
            .get_mut(&area.0)
            .unwrap()
            .ptes
            .insert(addr, Pte::decode(orig));
        Ok(())
    }

    fn handle_write_fault(&self, area: AreaId, addr: u64) -> FaultOutcome {
        let mut st = self.state.lock();
        Self::cow_break(&mut st, area.0, addr)
    }

    fn pte_snapshot(&self, area: AreaId, addr: u64) -> Option<PteVal> {
        let st = self.state.lock();
        st.areas
            .get(&area.0)?
            .ptes
            .get(&addr)
            .map(|p| p.encode())
    }

    fn pte_pfn(&self, pte: PteVal) -> Option<Pfn> {
        Some(Pfn(Pte::decode(pte).pfn))
    }

    fn pte_writable(&self, pte: PteVal) -> bool {
        Pte::decode(pte).writable
    }

    fn anon_vma_get(&self, av: AnonVmaId) {
        let mut st = self.state.lock();
        let v = st.anon_vmas.get_mut(&av.0).unwrap();
        assert!(!v.dead, "pinning a freed anon-vma");
        v.external_refs += 1;
    }

    fn anon_vma_put(&self, av: AnonVmaId) {
        let mut st = self.state.lock();
        let v = st.anon_vmas.get_mut(&av.0).unwrap();
        assert!(v.external_refs > 0);
        v.external_refs -= 1;
        st.maybe_free_anon_vma(av.0);
    }

    fn anon_vma_lock(&self, av: AnonVmaId) {
        let mut st = self.state.lock();
        let v = st.anon_vmas.get_mut(&av.0).unwrap();
        assert!(!v.locked);
        v.locked = true;
    }

    fn anon_vma_unlock(&self, av: AnonVmaId) {
        let mut st = self.state.lock();
        let v = st.anon_vmas.get_mut(&av.0).unwrap();
        assert!(v.locked);
        v.locked = false;
    }

    fn anon_vma_areas(&self, av: AnonVmaId) -> Vec<AreaId> {
        self.state.lock().anon_vmas[&av.0]
            .areas
            .iter()
            .map(|&a| AreaId(a))
            .collect()
    }

    fn area_start_end(&self, area: AreaId) -> (u64, u64) {
        let st = self.state.lock();
        let a = &st.areas[&area.0];
        (a.start, a.start + ((a.pages as u64) << PAGE_SHIFT))
    }

    fn page_referenced_one(&self, _pfn: Pfn, _area: AreaId, _addr: u64) -> bool {
        true
    }

    fn try_to_unmap_one(&self, pfn: Pfn, area: AreaId, addr: u64) -> UnmapOutcome {
        let mut st = self.state.lock();
        match st.areas.get(&area.0).and_then(|a| a.ptes.get(&addr)) {
            Some(p) if p.pfn == pfn.0 => {
                st.unmap_pte(area.0, addr);
                UnmapOutcome::Done
            }
            _ => UnmapOutcome::Done,
        }
    }

    fn page_mapped(&self, pfn: Pfn) -> bool {
        self.state.lock().frame(pfn).mapcount > 0
    }

    fn alloc_scratch_page(&self) -> Option<Pfn> {
        let mut st = self.state.lock();
        let pfn = st.alloc_frame();
        st.frames[pfn as usize].count = 1;
        Some(Pfn(pfn))
    }

    fn free_scratch_page(&self, pfn: Pfn) {
        self.state.lock().put_frame(pfn);
    }

    fn monotonic_ms(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}
