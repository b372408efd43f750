//! CPU exception gates and their default handlers.
//!
//! Everything at vectors 0..32 is installed during BSP bring-up. Most
//! handlers dump the interrupt frame and panic; the page-fault handler is
//! the demand-paging engine.

use amd64::interrupts::PfErrCode;
use amd64::paging::{self, PageSize, Pte};
use amd64::{registers, PrivLvl};

use crate::addr::{HhdmBase, PAddr, VAddr};
use crate::memm::{self, pmm};
use crate::memm::pmm::{AddrClassifier, FrameAlloc, Region};

use super::{register_exception, Context};

/// Install the default gates for vectors 0..32. `#BP` and `#DB` open at DPL
/// 3 so userland can raise them; `#DF` runs on its own IST stack.
pub fn install() {
    register_exception(0, PrivLvl::Ring0, 0, divide_error);
    register_exception(1, PrivLvl::Ring3, 0, debug_trap);
    register_exception(2, PrivLvl::Ring0, 0, unhandled_exception);
    register_exception(3, PrivLvl::Ring3, 0, breakpoint_trap);
    register_exception(8, PrivLvl::Ring0, 1, double_fault);
    register_exception(14, PrivLvl::Ring0, 0, page_fault);

    for vector in [4u8, 5, 6, 7, 9, 10, 11, 12, 13, 15, 16, 17, 18, 19, 20, 21] {
        register_exception(vector, PrivLvl::Ring0, 0, unhandled_exception);
    }
    for vector in 22..32u8 {
        register_exception(vector, PrivLvl::Ring0, 0, unhandled_exception);
    }
}

/// Log the full saved context of an interrupt.
pub(crate) fn dump_frame(ctx: &Context) {
    log::error!(
        "vector {:#04x} err {:#x} at {:04x}:{:016x} rflags {:#x}",
        ctx.int_num, ctx.err_code, ctx.cs, ctx.rip, ctx.rflags
    );
    log::error!(
        "rax {:016x} rbx {:016x} rcx {:016x} rdx {:016x}",
        ctx.regs.rax, ctx.regs.rbx, ctx.regs.rcx, ctx.regs.rdx
    );
    log::error!(
        "rsi {:016x} rdi {:016x} rbp {:016x} rsp {:016x}",
        ctx.regs.rsi, ctx.regs.rdi, ctx.regs.rbp, ctx.rsp
    );
    log::error!(
        "r8  {:016x} r9  {:016x} r10 {:016x} r11 {:016x}",
        ctx.regs.r8, ctx.regs.r9, ctx.regs.r10, ctx.regs.r11
    );
    log::error!(
        "r12 {:016x} r13 {:016x} r14 {:016x} r15 {:016x}",
        ctx.regs.r12, ctx.regs.r13, ctx.regs.r14, ctx.regs.r15
    );
}

fn fault_site(ctx: &Context) -> &'static str {
    match ctx.privilege() {
        PrivLvl::Ring3 => "user",
        _ => "kernel",
    }
}

fn divide_error(ctx: &mut Context) {
    dump_frame(ctx);
    panic!("#DE divide error in {} mode", fault_site(ctx));
}

fn debug_trap(ctx: &mut Context) {
    dump_frame(ctx);
    if ctx.privilege().is_userland() {
        // pending process termination support
        panic!("#DB from userland");
    }
}

fn breakpoint_trap(ctx: &mut Context) {
    dump_frame(ctx);
    if ctx.privilege().is_userland() {
        // pending process termination support
        panic!("#BP from userland");
    }
}

fn double_fault(ctx: &mut Context) {
    dump_frame(ctx);
    panic!("#DF double fault in {} mode", fault_site(ctx));
}

fn unhandled_exception(ctx: &mut Context) {
    dump_frame(ctx);
    panic!(
        "unhandled CPU exception {:#04x} in {} mode",
        ctx.int_num,
        fault_site(ctx)
    );
}

/// The demand-paging policy, factored over the allocator and classifier
/// capabilities. Returns the leaf flags it installed, or the reason the
/// fault is fatal.
///
/// # Safety:
/// `pml4_vaddr` must reference the active hierarchy under `base`, and any
/// frame the allocator returns must be unused and addressable under `base`.
unsafe fn demand_map(
    fault_page: VAddr,
    err: PfErrCode,
    pml4_vaddr: VAddr,
    base: HhdmBase,
    alloc: &mut dyn FrameAlloc,
    vmm: &dyn AddrClassifier,
) -> Result<Pte, &'static str> {
    if err.contains(PfErrCode::RSV) {
        return Err("reserved bit violation: page tables corrupt");
    }

    if err.contains(PfErrCode::P) {
        // the translation exists: this is a protection violation, not a
        // missing page, and nothing may be allocated for it
        return Err("protection violation: invalid access to mapped page");
    }

    let mut leaf = Pte::NO_EXECUTE;
    if err.contains(PfErrCode::RW) {
        leaf |= Pte::WRITE;
    }
    match vmm.classify(fault_page) {
        Region::Kernel => leaf |= Pte::GLOBAL,
        Region::User => leaf |= Pte::USERLAND,
        Region::Unknown => return Err("address in neither kernel nor user region"),
    }

    let frame = match alloc.alloc_frame() {
        Some(frame) => frame,
        None => return Err("out of physical memory"),
    };
    // fresh demand-paged memory must not leak prior contents
    core::ptr::write_bytes(frame.to_vaddr(base).as_mut_ptr::<u8>(), 0, 0x1000);

    memm::map_page(
        pml4_vaddr,
        fault_page,
        frame,
        PageSize::Page4K,
        leaf,
        base,
        &mut || alloc.alloc_frame(),
    );
    Ok(leaf)
}

fn page_fault(ctx: &mut Context) {
    let err = unsafe { PfErrCode::from_bits_unchecked(ctx.err_code) };
    let fault_addr = VAddr(registers::cr2_read());
    let fault_page = fault_addr.align_down(paging::PTE_MAPPED_SIZE);

    if !pmm::pmm_ready() {
        dump_frame(ctx);
        panic!("#PF at {:#x} before the PMM is initialised", fault_addr);
    }

    let pml4_vaddr = PAddr(registers::cr3_read()).to_vaddr(HhdmBase::Physmap);
    let mut alloc = pmm::pmm().lock();

    let result = unsafe {
        demand_map(
            fault_page,
            err,
            pml4_vaddr,
            HhdmBase::Physmap,
            &mut *alloc,
            pmm::vmm(),
        )
    };

    match result {
        Ok(_) => paging::invlpg(fault_page.0),
        Err(reason) => {
            dump_frame(ctx);
            log::error!("#PF at {:#x} ({:?}) in {} mode: {}", fault_addr, err, fault_site(ctx), reason);
            unsafe { memm::log_walk(pml4_vaddr, fault_addr, HhdmBase::Physmap) };
            panic!("#PF at {:#x}: {}", fault_addr, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memm::pmm::PartitionVmm;
    use crate::memm::test_support::TestArena;
    use crate::memm::translate;

    /// A PMM over a host arena that hands out identity-addressed frames and
    /// counts them.
    struct CountingPmm {
        arena: TestArena,
        handed_out: usize,
    }

    impl FrameAlloc for CountingPmm {
        fn alloc_frame(&mut self) -> Option<PAddr> {
            self.handed_out += 1;
            Some(self.arena.alloc())
        }
        fn alloc_frames(&mut self, _count: u64) -> Option<PAddr> {
            unimplemented!()
        }
    }

    #[test]
    fn demand_pages_a_kernel_heap_access() {
        let mut pmm = CountingPmm { arena: TestArena::new(), handed_out: 0 };
        let vmm = PartitionVmm::new();
        let pml4 = pmm.arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        // write fault, non-present, at a declared kernel heap page
        let fault_page = VAddr(0xFFFF_FFFF_C000_0123).align_down(0x1000);
        let err = PfErrCode::RW;

        let leaf = unsafe {
            demand_map(fault_page, err, pml4_vaddr, HhdmBase::Identity, &mut pmm, &vmm)
        }
        .unwrap();

        // exactly one data frame, plus the three intermediate tables
        assert_eq!(pmm.handed_out, 1 + 3);
        assert!(leaf.contains(Pte::WRITE | Pte::NO_EXECUTE | Pte::GLOBAL));
        assert!(!leaf.contains(Pte::USERLAND));

        // the second access translates without faulting
        let (_, size, entry) =
            unsafe { translate(pml4_vaddr, VAddr(0xFFFF_FFFF_C000_0123), HhdmBase::Identity) }
                .unwrap();
        assert_eq!(size, PageSize::Page4K);
        assert!(entry.contains(Pte::GLOBAL));
    }

    #[test]
    fn user_region_faults_map_user_accessible() {
        let mut pmm = CountingPmm { arena: TestArena::new(), handed_out: 0 };
        let vmm = PartitionVmm::new();
        let pml4 = pmm.arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let fault_page = VAddr(0x0000_0000_0040_0000);
        let leaf = unsafe {
            demand_map(fault_page, PfErrCode::RW | PfErrCode::US, pml4_vaddr,
                HhdmBase::Identity, &mut pmm, &vmm)
        }
        .unwrap();
        assert!(leaf.contains(Pte::USERLAND));
        assert!(!leaf.contains(Pte::GLOBAL));
    }

    #[test]
    fn protection_faults_never_allocate() {
        let mut pmm = CountingPmm { arena: TestArena::new(), handed_out: 0 };
        let vmm = PartitionVmm::new();
        let pml4 = pmm.arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let result = unsafe {
            demand_map(VAddr(0xFFFF_FFFF_C000_0000), PfErrCode::P | PfErrCode::RW,
                pml4_vaddr, HhdmBase::Identity, &mut pmm, &vmm)
        };
        assert!(result.is_err());
        assert_eq!(pmm.handed_out, 0);
    }

    #[test]
    fn reserved_bit_violations_are_fatal() {
        let mut pmm = CountingPmm { arena: TestArena::new(), handed_out: 0 };
        let vmm = PartitionVmm::new();
        let pml4 = pmm.arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let result = unsafe {
            demand_map(VAddr(0xFFFF_FFFF_C000_0000), PfErrCode::RSV, pml4_vaddr,
                HhdmBase::Identity, &mut pmm, &vmm)
        };
        assert!(result.is_err());
        assert_eq!(pmm.handed_out, 0);
    }

    #[test]
    fn unknown_addresses_are_fatal() {
        let mut pmm = CountingPmm { arena: TestArena::new(), handed_out: 0 };
        let vmm = PartitionVmm::new();
        let pml4 = pmm.arena.alloc();
        let pml4_vaddr = pml4.to_vaddr(HhdmBase::Identity);

        let result = unsafe {
            demand_map(VAddr(0x1000), PfErrCode::RW, pml4_vaddr, HhdmBase::Identity,
                &mut pmm, &vmm)
        };
        assert!(result.is_err());
        assert_eq!(pmm.handed_out, 0);
    }
}
