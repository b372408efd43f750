//! Physical frame allocation and virtual address classification.
//!
//! The rest of the kernel consumes these strictly as capabilities: a frame
//! source for the paging engine and fault handler, and a region classifier
//! for the fault handler and syscall validation. The policy below (watermark
//! over the firmware map's free regions) is deliberately simple; nothing
//! outside this module may depend on it.

use spin::{Mutex, Once};

use crate::addr::{PAddr, VAddr};
use crate::boot::{self, MMap};

/// Frame-allocator capability consumed by the paging engine and the
/// page-fault handler.
pub trait FrameAlloc {
    /// Hand out one 4 KiB frame. Contents are unspecified.
    fn alloc_frame(&mut self) -> Option<PAddr>;

    /// Hand out `count` physically contiguous 4 KiB frames.
    fn alloc_frames(&mut self, count: u64) -> Option<PAddr>;
}

#[derive(Debug, Clone, Copy)]
struct FreeRun {
    next: u64,
    end: u64,
}

/// Watermark allocator over the usable regions of the firmware memory map.
///
/// `LOADER_DATA` regions are excluded: they hold the kernel image, its page
/// tables, and the boot payload. Everything below 1 MiB is excluded as well,
/// keeping legacy firmware structures and the AP trampoline page untouched.
pub struct RunPmm {
    runs: [Option<FreeRun>; boot::MAX_RUNS],
    len: usize,
}

const LOW_MEMORY_FLOOR: u64 = 0x10_0000;

impl RunPmm {
    /// Build from the raw firmware map snapshot.
    ///
    /// # Safety:
    /// See [`MMap::descriptors`].
    pub unsafe fn from_mmap(mmap: &MMap) -> RunPmm {
        let usable = mmap.descriptors().filter(|d| {
            matches!(
                d.ty,
                boot::CONVENTIONAL | boot::BOOT_SERVICES_CODE | boot::BOOT_SERVICES_DATA
                    | boot::LOADER_CODE
            )
        });

        let mut pmm = RunPmm { runs: [None; boot::MAX_RUNS], len: 0 };
        for desc in usable {
            let base = desc.phys_start.max(LOW_MEMORY_FLOOR);
            let end = desc.phys_start + desc.page_count * 0x1000;
            if base >= end {
                continue;
            }
            if pmm.len == boot::MAX_RUNS {
                log::warn!("free memory exceeds {} runs; trailing regions unused", boot::MAX_RUNS);
                break;
            }
            pmm.runs[pmm.len] = Some(FreeRun { next: base, end });
            pmm.len += 1;
        }
        pmm
    }

    /// Build from explicit `(base, len_bytes)` regions. Used by tests and by
    /// late ACPI reclamation.
    pub fn from_regions(regions: &[(PAddr, u64)]) -> RunPmm {
        let mut pmm = RunPmm { runs: [None; boot::MAX_RUNS], len: 0 };
        for &(base, len) in regions {
            assert!(pmm.len < boot::MAX_RUNS);
            pmm.runs[pmm.len] = Some(FreeRun { next: base.0, end: base.0 + len });
            pmm.len += 1;
        }
        pmm
    }

    pub fn free_bytes(&self) -> u64 {
        self.runs[..self.len]
            .iter()
            .flatten()
            .map(|r| r.end - r.next)
            .sum()
    }

    /// Adopt the ACPI-reclaimable runs of the collapsed map. Only valid once
    /// every consumer of the firmware tables has copied what it needs.
    pub fn reclaim_acpi_runs(&mut self, runs: &boot::RunTable) {
        let mut reclaimed = 0u64;
        for run in runs.runs().iter().filter(|r| r.kind == boot::RunKind::Acpi) {
            if self.len == boot::MAX_RUNS {
                log::warn!("no room to reclaim further ACPI runs");
                break;
            }
            let base = run.base.0.max(LOW_MEMORY_FLOOR);
            if base >= run.end() {
                continue;
            }
            self.runs[self.len] = Some(FreeRun { next: base, end: run.end() });
            self.len += 1;
            reclaimed += run.end() - base;
        }
        if reclaimed > 0 {
            log::info!("pmm: reclaimed {} KiB of ACPI memory", reclaimed / 1024);
        }
    }
}

impl FrameAlloc for RunPmm {
    fn alloc_frame(&mut self) -> Option<PAddr> {
        self.alloc_frames(1)
    }

    fn alloc_frames(&mut self, count: u64) -> Option<PAddr> {
        let bytes = count * 0x1000;
        for run in self.runs[..self.len].iter_mut().flatten() {
            if run.end - run.next >= bytes {
                let base = run.next;
                run.next += bytes;
                return Some(PAddr(base));
            }
        }
        None
    }
}

/// How the virtual memory manager classifies an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Declared kernel region: demand mapped supervisor, global.
    Kernel,
    /// Declared user region of the running address space: demand mapped
    /// user-accessible, non-global.
    User,
    /// Known to nobody; touching it is a fault.
    Unknown,
}

/// Address classification capability.
pub trait AddrClassifier {
    fn classify(&self, vaddr: VAddr) -> Region;

    /// The "valid address" predicate: known to either partition.
    fn is_valid_vaddr(&self, vaddr: VAddr) -> bool {
        self.classify(vaddr) != Region::Unknown
    }
}

/// Fixed kernel/user partition bounds; the simplest classifier that can
/// drive demand paging and syscall buffer validation.
#[derive(Debug, Clone, Copy)]
pub struct PartitionVmm {
    pub kernel_base: VAddr,
    pub kernel_end: VAddr,
    pub user_base: VAddr,
    pub user_end: VAddr,
}

/// Demand-paged kernel heap window.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_FFFF_C000_0000;
pub const KERNEL_HEAP_END: u64 = 0xFFFF_FFFF_D000_0000;

/// Userland partition: everything in the canonical lower half above the
/// traditional null guard window.
pub const USER_BASE: u64 = 0x0000_0000_0040_0000;
pub const USER_END: u64 = 0x0000_8000_0000_0000;

impl PartitionVmm {
    pub const fn new() -> PartitionVmm {
        PartitionVmm {
            kernel_base: VAddr(KERNEL_HEAP_BASE),
            kernel_end: VAddr(KERNEL_HEAP_END),
            user_base: VAddr(USER_BASE),
            user_end: VAddr(USER_END),
        }
    }

    /// Whether `[base, base + len)` lies entirely within the user partition.
    pub fn user_range_valid(&self, base: VAddr, len: u64) -> bool {
        let end = match base.0.checked_add(len) {
            Some(end) => end,
            None => return false,
        };
        base.0 >= self.user_base.0 && end <= self.user_end.0
    }
}

impl AddrClassifier for PartitionVmm {
    fn classify(&self, vaddr: VAddr) -> Region {
        if vaddr >= self.kernel_base && vaddr < self.kernel_end {
            Region::Kernel
        } else if vaddr >= self.user_base && vaddr < self.user_end {
            Region::User
        } else {
            Region::Unknown
        }
    }
}

// process-wide state: init-once at boot, read-many afterwards

static PMM: Once<Mutex<RunPmm>> = Once::new();
static VMM: Once<PartitionVmm> = Once::new();

pub fn init_pmm(pmm: RunPmm) {
    assert!(PMM.get().is_none(), "PMM initialised twice");
    log::info!("pmm: {} KiB free", pmm.free_bytes() / 1024);
    PMM.call_once(|| Mutex::new(pmm));
}

pub fn init_vmm(vmm: PartitionVmm) {
    assert!(VMM.get().is_none(), "VMM initialised twice");
    VMM.call_once(|| vmm);
}

pub fn pmm_ready() -> bool {
    PMM.get().is_some()
}

/// # Panics
/// Panics when used before [`init_pmm`]; stage ordering is a boot invariant.
pub fn pmm() -> &'static Mutex<RunPmm> {
    PMM.get().expect("PMM used before initialisation")
}

/// # Panics
/// Panics when used before [`init_vmm`].
pub fn vmm() -> &'static PartitionVmm {
    VMM.get().expect("VMM used before initialisation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_walks_runs_in_order() {
        let mut pmm = RunPmm::from_regions(&[
            (PAddr(0x10_0000), 0x2000),
            (PAddr(0x20_0000), 0x4000),
        ]);
        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x10_0000)));
        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x10_1000)));
        // first run exhausted
        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x20_0000)));
        assert_eq!(pmm.free_bytes(), 0x3000);
    }

    #[test]
    fn contiguous_allocation_skips_short_runs() {
        let mut pmm = RunPmm::from_regions(&[
            (PAddr(0x10_0000), 0x2000),
            (PAddr(0x20_0000), 0x4000),
        ]);
        assert_eq!(pmm.alloc_frames(4), Some(PAddr(0x20_0000)));
        assert_eq!(pmm.alloc_frames(4), None);
        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x10_0000)));
    }

    #[test]
    fn acpi_runs_join_the_pool_on_reclaim() {
        use crate::boot::{MemoryDescriptor, RunTable, ACPI_RECLAIM};

        let mut pmm = RunPmm::from_regions(&[(PAddr(0x10_0000), 0x1000)]);
        let descs = [MemoryDescriptor {
            ty: ACPI_RECLAIM,
            phys_start: 0x20_0000,
            virt_start: 0,
            page_count: 2,
            attribute: 0,
        }];
        let runs = RunTable::from_descriptors(descs.iter());

        assert_eq!(pmm.free_bytes(), 0x1000);
        pmm.reclaim_acpi_runs(&runs);
        assert_eq!(pmm.free_bytes(), 0x3000);

        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x10_0000)));
        assert_eq!(pmm.alloc_frame(), Some(PAddr(0x20_0000)));
    }

    #[test]
    fn partition_classifier() {
        let vmm = PartitionVmm::new();
        assert_eq!(vmm.classify(VAddr(0xFFFF_FFFF_C000_0123)), Region::Kernel);
        assert_eq!(vmm.classify(VAddr(0x0000_0000_0040_0000)), Region::User);
        assert_eq!(vmm.classify(VAddr(0x1000)), Region::Unknown);
        assert_eq!(vmm.classify(VAddr(0xFFFF_FFFF_E000_0000)), Region::Unknown);
        assert!(vmm.is_valid_vaddr(VAddr(0xFFFF_FFFF_C000_0123)));
        assert!(!vmm.is_valid_vaddr(VAddr(0x1000)));

        assert!(vmm.user_range_valid(VAddr(0x40_0000), 0x1000));
        assert!(!vmm.user_range_valid(VAddr(0x40_0000), u64::MAX));
        assert!(!vmm.user_range_valid(VAddr(0x1000), 16));
    }
}
