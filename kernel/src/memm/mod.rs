//! Virtual memory mapping services over the 4-level long mode page tables.
//!
//! All walks are parameterised by the [`HhdmBase`] under which table physical
//! addresses are interpreted, so the same engine runs identity mapped in the
//! UEFI loader, through the physmap at runtime, and against plain host
//! allocations under test.

pub mod pmm;

use amd64::paging::{self, PageSize, Pte, TABLE_LEN};

use crate::addr::{HhdmBase, PAddr, VAddr, PHYSMAP_BASE, PHYSMAP_PML4_SLOT};

// the physmap slot constant and its canonical base must agree
const _: () = assert!(paging::pml4_slot_base(PHYSMAP_PML4_SLOT) == PHYSMAP_BASE);

/// The direct map shares its PML4 slot with the kernel image (top 2 GiB), so
/// only physical addresses below this may enter the physmap.
pub const PHYSMAP_CEILING: u64 = paging::PML4E_MAPPED_SIZE - 2 * paging::PDPE_MAPPED_SIZE;

#[inline]
unsafe fn table_mut<'a>(paddr: PAddr, base: HhdmBase) -> &'a mut [Pte; TABLE_LEN] {
    &mut *paddr.to_vaddr(base).as_mut_ptr()
}

#[inline]
unsafe fn table_ref<'a>(paddr: PAddr, base: HhdmBase) -> &'a [Pte; TABLE_LEN] {
    &*paddr.to_vaddr(base).as_ptr()
}

/// Map one page of `size` bytes at `virt` onto `phys`.
///
/// Missing intermediate tables are allocated from `get_frame` and installed
/// writable; they additionally become user-accessible iff the requested leaf
/// is, so user leaves stay reachable without opening supervisor-only
/// subtrees. `leaf_flags` carries the WRITE/NO_EXECUTE/USERLAND/GLOBAL/cache
/// policy for the leaf itself; PRESENT and HUGE_PAGE are managed here.
///
/// The caller must `invlpg` the page afterwards if the translation may be
/// cached.
///
/// # Panics
/// * `virt` or `phys` not aligned to `size` is a programming error.
/// * Frame exhaustion while building tables is fatal.
/// * Replacing an existing non-leaf entry with a leaf at the same level is a
///   table-corruption bug and panics.
///
/// # Safety:
/// * `pml4_vaddr` must reference the 512-entry top-level table of the
///   hierarchy being edited, valid for writes under `base`, as must every
///   table it references.
/// * Frames returned by `get_frame` must be unused and addressable under
///   `base`.
/// * `EFER::NXE` must be set if `leaf_flags` uses `NO_EXECUTE`.
pub unsafe fn map_page<F>(
    pml4_vaddr: VAddr,
    virt: VAddr,
    phys: PAddr,
    size: PageSize,
    leaf_flags: Pte,
    base: HhdmBase,
    get_frame: &mut F,
) where
    F: FnMut() -> Option<PAddr>,
{
    assert!(virt.is_aligned(size.bytes()), "virt {:#x} unaligned for {:?}", virt, size);
    assert!(phys.is_aligned(size.bytes()), "phys {:#x} unaligned for {:?}", phys, size);

    let leaf_level = size.leaf_level();
    let mut branch_flags = Pte::PRESENT | Pte::WRITE;
    if leaf_flags.contains(Pte::USERLAND) {
        branch_flags |= Pte::USERLAND;
    }

    let mut table: &mut [Pte; TABLE_LEN] = &mut *pml4_vaddr.as_mut_ptr();
    let mut level = 4;

    while level > leaf_level {
        let index = paging::table_index(virt.0, level);
        let entry = table[index];

        if !entry.is_present() {
            let frame = match get_frame() {
                Some(frame) => frame,
                None => panic!("out of physical memory while building page tables"),
            };
            let fresh = table_mut(frame, base);
            fresh.fill(Pte::empty());
            table[index] = Pte::from_paddr(frame.0) | branch_flags;
        } else {
            assert!(
                !entry.is_leaf(level),
                "mapping {:#x} would shadow a {}-level leaf",
                virt,
                level
            );
            // open the subtree to userland if this mapping needs it
            if branch_flags.contains(Pte::USERLAND) && !entry.contains(Pte::USERLAND) {
                table[index] = entry | Pte::USERLAND;
            }
        }

        table = table_mut(PAddr(table[index].paddr()), base);
        level -= 1;
    }

    let index = paging::table_index(virt.0, level);
    let existing = table[index];
    assert!(
        !existing.is_present() || existing.is_leaf(level),
        "mapping {:#x} would replace a page table with a leaf",
        virt
    );

    let mut leaf = Pte::from_paddr(phys.0) | leaf_flags | Pte::PRESENT;
    if level > 1 {
        leaf |= Pte::HUGE_PAGE;
    }
    table[index] = leaf;
}

/// Direct-map the physical range `[start, end)` into the physmap slot,
/// supervisor read/write, no-execute, using the fewest possible leaves:
/// 1 GiB, then 2 MiB, then 4 KiB as alignment and remaining length permit.
///
/// # Panics
/// `start` and `end` must be 4 KiB aligned, ordered, and below
/// [`PHYSMAP_CEILING`].
///
/// # Safety:
/// See [`map_page`].
pub unsafe fn phys_map_region<F>(
    pml4_vaddr: VAddr,
    start: PAddr,
    end: PAddr,
    base: HhdmBase,
    get_frame: &mut F,
) where
    F: FnMut() -> Option<PAddr>,
{
    assert!(start < end, "empty physmap range");
    assert!(start.is_aligned(paging::PTE_MAPPED_SIZE) && end.is_aligned(paging::PTE_MAPPED_SIZE));
    assert!(end.0 <= PHYSMAP_CEILING, "physmap range reaches the kernel image window");

    let leaf_flags = Pte::WRITE | Pte::NO_EXECUTE | Pte::GLOBAL;

    let mut paddr = start;
    while paddr < end {
        let remaining = end.0 - paddr.0;
        let size = if paddr.is_aligned(PageSize::Page1G.bytes())
            && remaining >= PageSize::Page1G.bytes()
        {
            PageSize::Page1G
        } else if paddr.is_aligned(PageSize::Page2M.bytes())
            && remaining >= PageSize::Page2M.bytes()
        {
            PageSize::Page2M
        } else {
            PageSize::Page4K
        };

        map_page(
            pml4_vaddr,
            paddr.to_vaddr(HhdmBase::Physmap),
            paddr,
            size,
            leaf_flags,
            base,
            get_frame,
        );
        paddr = PAddr(paddr.0 + size.bytes());
    }
}

/// Leaf permissions for an ELF `PT_LOAD` segment: `PF_W` selects writable,
/// a clear `PF_X` selects no-execute. Shared between the loader's segment
/// mapping and the tests that model it.
pub fn elf_segment_flags(p_flags: u32) -> Pte {
    const PF_X: u32 = 0b001;
    const PF_W: u32 = 0b010;

    let mut leaf = Pte::empty();
    if p_flags & PF_X == 0 {
        leaf |= Pte::NO_EXECUTE;
    }
    if p_flags & PF_W != 0 {
        leaf |= Pte::WRITE;
    }
    leaf
}

/// Walk the tables for `virt`. Returns the translated physical address, the
/// leaf size, and the leaf entry; `None` if any level is non-present.
///
/// # Safety:
/// `pml4_vaddr` and every table it references must be valid for reads under
/// `base`.
pub unsafe fn translate(
    pml4_vaddr: VAddr,
    virt: VAddr,
    base: HhdmBase,
) -> Option<(PAddr, PageSize, Pte)> {
    let mut table: &[Pte; TABLE_LEN] = &*pml4_vaddr.as_ptr();
    let mut level = 4;

    loop {
        let entry = table[paging::table_index(virt.0, level)];
        if !entry.is_present() {
            return None;
        }
        if entry.is_leaf(level) {
            let size = match level {
                1 => PageSize::Page4K,
                2 => PageSize::Page2M,
                3 => PageSize::Page1G,
                _ => return None, // PML4 entries cannot be leaves
            };
            let offset = virt.0 & (size.bytes() - 1);
            return Some((PAddr(entry.paddr() + offset), size, entry));
        }
        table = table_ref(PAddr(entry.paddr()), base);
        level -= 1;
    }
}

/// Log each present level of the walk for `virt`; used by the fault paths.
///
/// # Safety:
/// See [`translate`].
pub unsafe fn log_walk(pml4_vaddr: VAddr, virt: VAddr, base: HhdmBase) {
    let mut table: &[Pte; TABLE_LEN] = &*pml4_vaddr.as_ptr();
    let mut level = 4;

    loop {
        let index = paging::table_index(virt.0, level);
        let entry = table[index];
        log::error!("  L{} [{:03}] = {:#018x}", level, index, entry.bits());
        if !entry.is_present() || entry.is_leaf(level) || level == 1 {
            return;
        }
        table = table_ref(PAddr(entry.paddr()), base);
        level -= 1;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Host-side frame source: 4 KiB aligned heap allocations addressed
    /// through `HhdmBase::Identity`.
    pub struct TestArena {
        frames: Vec<*mut u8>,
    }

    impl TestArena {
        const LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(0x1000, 0x1000) };

        pub fn new() -> Self {
            TestArena { frames: Vec::new() }
        }

        pub fn alloc(&mut self) -> PAddr {
            let ptr = unsafe { alloc_zeroed(Self::LAYOUT) };
            assert!(!ptr.is_null());
            self.frames.push(ptr);
            PAddr(ptr as u64)
        }

        pub fn allocated(&self) -> usize {
            self.frames.len()
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            for &ptr in &self.frames {
                unsafe { dealloc(ptr, Self::LAYOUT) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestArena;
    use super::*;

    #[test]
    fn map_4k_then_walk() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let virt = VAddr(0xFFFF_FFFF_C000_0000);
        let phys = PAddr(0x0010_0000);
        unsafe {
            map_page(
                pml4_vaddr,
                virt,
                phys,
                PageSize::Page4K,
                Pte::WRITE | Pte::NO_EXECUTE | Pte::GLOBAL,
                HhdmBase::Identity,
                &mut || Some(arena.alloc()),
            );
        }

        let (paddr, size, leaf) =
            unsafe { translate(pml4_vaddr, VAddr(virt.0 + 0x123), HhdmBase::Identity) }.unwrap();
        assert_eq!(paddr, PAddr(phys.0 + 0x123));
        assert_eq!(size, PageSize::Page4K);
        assert!(leaf.contains(Pte::WRITE | Pte::NO_EXECUTE | Pte::GLOBAL));
        assert!(!leaf.contains(Pte::USERLAND));
    }

    #[test]
    fn intermediates_are_user_iff_a_user_leaf_was_requested() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let kvirt = VAddr(0xFFFF_FFFF_C000_0000);
        let uvirt = VAddr(0x0000_7000_0000_0000);
        unsafe {
            map_page(pml4_vaddr, kvirt, PAddr(0x1000), PageSize::Page4K, Pte::WRITE,
                HhdmBase::Identity, &mut || Some(arena.alloc()));
            map_page(pml4_vaddr, uvirt, PAddr(0x2000), PageSize::Page4K,
                Pte::WRITE | Pte::USERLAND | Pte::NO_EXECUTE,
                HhdmBase::Identity, &mut || Some(arena.alloc()));
        }

        let table: &[Pte; TABLE_LEN] = unsafe { &*pml4_vaddr.as_ptr() };
        let kernel_pml4e = table[paging::table_index(kvirt.0, 4)];
        let user_pml4e = table[paging::table_index(uvirt.0, 4)];
        assert!(!kernel_pml4e.contains(Pte::USERLAND));
        assert!(user_pml4e.contains(Pte::USERLAND));
    }

    #[test]
    fn huge_leaves_set_the_ps_bit() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        unsafe {
            map_page(pml4_vaddr, VAddr(0x4000_0000), PAddr(0x4000_0000), PageSize::Page1G,
                Pte::WRITE, HhdmBase::Identity, &mut || Some(arena.alloc()));
            map_page(pml4_vaddr, VAddr(0x2020_0000), PAddr(0x0020_0000), PageSize::Page2M,
                Pte::WRITE, HhdmBase::Identity, &mut || Some(arena.alloc()));
        }

        let (paddr, size, leaf) =
            unsafe { translate(pml4_vaddr, VAddr(0x4000_0000 + 0x12345), HhdmBase::Identity) }
                .unwrap();
        assert_eq!(size, PageSize::Page1G);
        assert_eq!(paddr, PAddr(0x4000_0000 + 0x12345));
        assert!(leaf.contains(Pte::HUGE_PAGE));

        let (paddr, size, _) =
            unsafe { translate(pml4_vaddr, VAddr(0x2020_0000 + 0x999), HhdmBase::Identity) }
                .unwrap();
        assert_eq!(size, PageSize::Page2M);
        assert_eq!(paddr, PAddr(0x0020_0000 + 0x999));
    }

    #[test]
    #[should_panic]
    fn misaligned_huge_mapping_aborts() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);
        unsafe {
            map_page(pml4_vaddr, VAddr(0x0020_1000), PAddr(0), PageSize::Page2M, Pte::WRITE,
                HhdmBase::Identity, &mut || Some(arena.alloc()));
        }
    }

    #[test]
    fn physmap_uses_fewest_possible_leaves() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        // 1 GiB + 2 MiB + 4 KiB: exactly one leaf of each size, and exactly
        // one table per level (pdpt, pd, pt) beyond the provided pml4.
        let end = PAddr(PageSize::Page1G.bytes() + PageSize::Page2M.bytes() + 0x1000);
        unsafe {
            phys_map_region(pml4_vaddr, PAddr(0), end, HhdmBase::Identity,
                &mut || Some(arena.alloc()));
        }
        assert_eq!(arena.allocated(), 1 + 3);

        let cases = [
            (PHYSMAP_BASE, PageSize::Page1G, 0u64),
            (PHYSMAP_BASE + PageSize::Page1G.bytes(), PageSize::Page2M, PageSize::Page1G.bytes()),
            (
                PHYSMAP_BASE + PageSize::Page1G.bytes() + PageSize::Page2M.bytes(),
                PageSize::Page4K,
                PageSize::Page1G.bytes() + PageSize::Page2M.bytes(),
            ),
        ];
        for (virt, expect_size, expect_paddr) in cases {
            let (paddr, size, leaf) =
                unsafe { translate(pml4_vaddr, VAddr(virt), HhdmBase::Identity) }.unwrap();
            assert_eq!(size, expect_size);
            assert_eq!(paddr, PAddr(expect_paddr));
            assert!(leaf.contains(Pte::WRITE | Pte::NO_EXECUTE | Pte::GLOBAL));
        }
    }

    #[test]
    fn two_segment_kernel_image_layout() {
        use crate::addr::KERNEL_BASE;

        // text: R-X, two pages; bss: RW-, one page, 2 MiB above the base.
        // This models the loader's PT_LOAD walk over the shared engine.
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let text_flags = elf_segment_flags(0b101);
        let bss_flags = elf_segment_flags(0b110);
        assert_eq!(text_flags, Pte::empty());
        assert_eq!(bss_flags, Pte::WRITE | Pte::NO_EXECUTE);

        let text_phys = [arena.alloc(), arena.alloc()];
        let bss_phys = arena.alloc();
        unsafe {
            for (i, frame) in text_phys.iter().enumerate() {
                map_page(pml4_vaddr, VAddr(KERNEL_BASE + i as u64 * 0x1000), *frame,
                    PageSize::Page4K, text_flags, HhdmBase::Identity,
                    &mut || Some(arena.alloc()));
            }
            map_page(pml4_vaddr, VAddr(KERNEL_BASE + 0x20_0000), bss_phys,
                PageSize::Page4K, bss_flags, HhdmBase::Identity,
                &mut || Some(arena.alloc()));
        }

        for i in 0..2u64 {
            let (paddr, _, leaf) = unsafe {
                translate(pml4_vaddr, VAddr(KERNEL_BASE + i * 0x1000), HhdmBase::Identity)
            }
            .unwrap();
            assert_eq!(paddr, text_phys[i as usize]);
            assert!(!leaf.contains(Pte::WRITE), "text must not be writable");
            assert!(!leaf.contains(Pte::NO_EXECUTE), "text must be executable");
            assert!(!leaf.contains(Pte::USERLAND));
        }

        let (paddr, _, leaf) = unsafe {
            translate(pml4_vaddr, VAddr(KERNEL_BASE + 0x20_0000), HhdmBase::Identity)
        }
        .unwrap();
        assert_eq!(paddr, bss_phys);
        assert!(leaf.contains(Pte::WRITE | Pte::NO_EXECUTE));

        // the freshly allocated bss frame is zero-filled
        let bss = unsafe { core::slice::from_raw_parts(bss_phys.0 as *const u8, 0x1000) };
        assert!(bss.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn physmap_must_not_reach_the_kernel_window() {
        let mut arena = TestArena::new();
        let pml4 = arena.alloc();
        unsafe {
            phys_map_region(
                pml4.to_vaddr(HhdmBase::Identity),
                PAddr(PHYSMAP_CEILING - 0x1000),
                PAddr(PHYSMAP_CEILING + 0x1000),
                HhdmBase::Identity,
                &mut || Some(arena.alloc()),
            );
        }
    }
}
