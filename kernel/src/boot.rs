//! Loader-to-kernel handoff structures and the UEFI memory map collapse.
//!
//! The layouts here are the wire format between `bl` and the kernel entry
//! point; both sides compile this module, so the ABI cannot skew. The
//! descriptor mirror matches the UEFI `EFI_MEMORY_DESCRIPTOR` layout so the
//! kernel does not carry a firmware crate.

use crate::addr::PAddr;

/// Handoff payload passed by value to the kernel entry point (SysV ABI).
#[repr(C)]
pub struct BootInfo {
    /// Physical address of the ACPI 2.0 XSDP, as found in the UEFI
    /// configuration table.
    pub xsdp_paddr: u64,
    /// Raw firmware memory map snapshot taken for `ExitBootServices`.
    pub mmap: MMap,
    /// The `kernel.map` symbol blob, read verbatim from the ESP.
    pub ksyms: KernelSyms,
}

#[repr(C)]
pub struct KernelSyms {
    pub ptr: *const u8,
    pub len: u64,
}

/// Raw UEFI memory map snapshot. `descriptor_size` is the firmware's stride,
/// which may exceed `size_of::<MemoryDescriptor>()`; all walks must honour
/// it.
#[repr(C)]
pub struct MMap {
    pub key: usize,
    pub mmap: *mut MemoryDescriptor,
    pub mmap_size: u64,
    pub descriptor_size: u64,
    pub num_descriptors: u64,
}

impl MMap {
    /// Iterate the descriptors with the firmware stride.
    ///
    /// # Safety:
    /// `self.mmap` must point to `num_descriptors` descriptors laid out at
    /// `descriptor_size` intervals, live for the iteration.
    pub unsafe fn descriptors(&self) -> impl Iterator<Item = &MemoryDescriptor> {
        let base = self.mmap as *const u8;
        let stride = self.descriptor_size as usize;
        (0..self.num_descriptors as usize)
            .map(move |i| &*(base.add(i * stride) as *const MemoryDescriptor))
    }
}

/// Mirror of `EFI_MEMORY_DESCRIPTOR`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub ty: u32,
    pub phys_start: u64,
    pub virt_start: u64,
    pub page_count: u64,
    pub attribute: u64,
}

// UEFI memory type numbers consumed by the classifier.
pub const LOADER_CODE: u32 = 1;
pub const LOADER_DATA: u32 = 2;
pub const BOOT_SERVICES_CODE: u32 = 3;
pub const BOOT_SERVICES_DATA: u32 = 4;
pub const CONVENTIONAL: u32 = 7;
pub const ACPI_RECLAIM: u32 = 9;

/// Classification of a physical run after collapsing the firmware map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// General purpose memory, usable by the physical memory manager.
    Free,
    /// ACPI reclaimable: usable once the tables have been consumed.
    Acpi,
    /// Everything else; never handed out.
    Reserved,
}

impl RunKind {
    pub fn classify(uefi_type: u32) -> RunKind {
        match uefi_type {
            CONVENTIONAL | LOADER_CODE | LOADER_DATA | BOOT_SERVICES_CODE
            | BOOT_SERVICES_DATA => RunKind::Free,
            ACPI_RECLAIM => RunKind::Acpi,
            _ => RunKind::Reserved,
        }
    }
}

/// A contiguous run of identically classified 4 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub kind: RunKind,
    pub base: PAddr,
    pub page_count: u64,
}

impl Run {
    #[inline]
    pub fn end(&self) -> u64 {
        self.base.0 + self.page_count * 0x1000
    }
}

pub const MAX_RUNS: usize = 256;

/// The collapsed memory map: at most [`MAX_RUNS`] classified runs.
pub struct RunTable {
    runs: [Run; MAX_RUNS],
    len: usize,
}

impl RunTable {
    /// Collapse the raw firmware map: classify each descriptor and coalesce
    /// physically contiguous neighbours of the same class. Descriptors beyond
    /// the run capacity are dropped with a warning rather than silently.
    ///
    /// # Safety:
    /// See [`MMap::descriptors`].
    pub unsafe fn collapse(mmap: &MMap) -> RunTable {
        Self::from_descriptors(mmap.descriptors())
    }

    pub fn from_descriptors<'a>(descriptors: impl Iterator<Item = &'a MemoryDescriptor>) -> RunTable {
        let empty = Run { kind: RunKind::Reserved, base: PAddr(0), page_count: 0 };
        let mut table = RunTable { runs: [empty; MAX_RUNS], len: 0 };

        for desc in descriptors {
            if desc.page_count == 0 {
                continue;
            }
            let kind = RunKind::classify(desc.ty);

            if table.len > 0 {
                let last = &mut table.runs[table.len - 1];
                if last.kind == kind && last.end() == desc.phys_start {
                    last.page_count += desc.page_count;
                    continue;
                }
            }

            if table.len == MAX_RUNS {
                log::warn!("memory map exceeds {} runs; trailing regions dropped", MAX_RUNS);
                break;
            }
            table.runs[table.len] = Run {
                kind,
                base: PAddr(desc.phys_start),
                page_count: desc.page_count,
            };
            table.len += 1;
        }

        table
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs[..self.len]
    }

    /// Physical end of the highest run; the extent the direct map must cover.
    pub fn phys_top(&self) -> PAddr {
        PAddr(self.runs().iter().map(Run::end).max().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(ty: u32, first_page: u64, page_count: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            ty,
            phys_start: first_page * 0x1000,
            virt_start: 0,
            page_count,
            attribute: 0,
        }
    }

    #[test]
    fn representative_map_collapses_to_three_runs() {
        let descs = [
            desc(CONVENTIONAL, 0, 1),
            desc(BOOT_SERVICES_DATA, 1, 2),
            desc(0, 3, 1),
            desc(ACPI_RECLAIM, 4, 1),
            desc(ACPI_RECLAIM, 5, 1),
        ];
        let table = RunTable::from_descriptors(descs.iter());
        let runs = table.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], Run { kind: RunKind::Free, base: PAddr(0), page_count: 3 });
        assert_eq!(runs[1], Run { kind: RunKind::Reserved, base: PAddr(0x3000), page_count: 1 });
        assert_eq!(runs[2], Run { kind: RunKind::Acpi, base: PAddr(0x4000), page_count: 2 });
        assert_eq!(table.phys_top(), PAddr(0x6000));
    }

    #[test]
    fn discontiguous_same_kind_runs_stay_split() {
        let descs = [desc(CONVENTIONAL, 0, 1), desc(CONVENTIONAL, 2, 1)];
        let table = RunTable::from_descriptors(descs.iter());
        assert_eq!(table.runs().len(), 2);
    }

    #[test]
    fn reclassified_boundaries_split() {
        let descs = [
            desc(CONVENTIONAL, 0, 2),
            desc(ACPI_RECLAIM, 2, 1),
            desc(CONVENTIONAL, 3, 2),
        ];
        let table = RunTable::from_descriptors(descs.iter());
        let runs = table.runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].kind, RunKind::Free);
        assert_eq!(runs[1].kind, RunKind::Acpi);
        assert_eq!(runs[2].kind, RunKind::Free);
    }

    #[test]
    fn capacity_is_bounded() {
        // alternate kinds so nothing coalesces
        let descs: Vec<MemoryDescriptor> = (0..600)
            .map(|i| desc(if i % 2 == 0 { CONVENTIONAL } else { 0 }, i, 1))
            .collect();
        let table = RunTable::from_descriptors(descs.iter());
        assert_eq!(table.runs().len(), MAX_RUNS);
    }
}
