//! SMP bring-up: the AP trampoline and the INIT-SIPI sequencing.
//!
//! Application processors start in 16-bit real mode at the SIPI vector's
//! page. The trampoline below climbs to long mode using a parameter block
//! the BSP fills in (CR3, stack top, entry point), and the Rust-side entry
//! finishes per-core init and reports in through `CORES_ONLINE`.

use core::sync::atomic::{AtomicUsize, Ordering};

use amd64::paging::{PageSize, Pte};
use amd64::registers;

use crate::addr::{HhdmBase, PAddr, VAddr};
use crate::memm::{self, pmm::FrameAlloc};
use crate::time::hpet;
use crate::{apic, cpu};

/// Physical page the trampoline is copied to; its SIPI vector is
/// `TRAMPOLINE_PHYS >> 12`. Below the 1 MiB floor the PMM never allocates
/// from.
pub const TRAMPOLINE_PHYS: PAddr = PAddr(0x8000);

/// Pages per AP kernel stack.
const AP_STACK_PAGES: u64 = 4;

/// Hold time between INIT and SIPI.
const INIT_HOLD_NS: u64 = 10_000_000;
/// How long an AP gets to report in before it is skipped.
const AP_TIMEOUT_NS: u64 = 100_000_000;

/// Cores that completed early init. The release increment in [`ap_entry`]
/// pairs with acquire loads on the BSP, ordering the AP's table loads before
/// the BSP observes it online.
pub static CORES_ONLINE: AtomicUsize = AtomicUsize::new(1);

/// Parameter block the BSP writes into the tail of the trampoline page.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrampolineParams {
    pub cr3: u64,
    pub stack_top: u64,
    pub entry_point: u64,
}

pub const TRAMPOLINE_PARAMS_LEN: u64 = 24;

const _: () = assert!(core::mem::size_of::<TrampolineParams>() as u64 == TRAMPOLINE_PARAMS_LEN);

// The trampoline proper: real mode -> protected mode (tiny GDT) -> PAE +
// EFER.LME/NXE + CR3 -> long mode -> load stack, call the entry point. All
// absolute references are rebased to TRAMPOLINE_PHYS since the blob executes
// from there, not from where the linker put it. The parameter block sits in
// the last 24 bytes.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.global __ap_trampoline_start
.global __ap_trampoline_end

.balign 16
__ap_trampoline_start:
.code16
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds
    lgdtl AP_GDT_DESC_ABS
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $AP_PM32_ABS

.code32
__ap_pm32:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    // PAE on
    movl %cr4, %eax
    orl $(1 << 5), %eax
    movl %eax, %cr4

    // BSP-provided address space
    movl AP_PARAM_CR3_ABS, %eax
    movl %eax, %cr3

    // long mode + no-execute
    movl $0xC0000080, %ecx
    rdmsr
    orl $((1 << 8) | (1 << 11)), %eax
    wrmsr

    // paging + protection on: the far jump lands in 64-bit code
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0
    ljmpl $0x18, $AP_LM64_ABS

.code64
__ap_lm64:
    movq AP_PARAM_STACK_ABS, %rsp
    xorl %ebp, %ebp
    movq AP_PARAM_ENTRY_ABS, %rax
    callq *%rax
2:  hlt
    jmp 2b

.balign 8
__ap_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF    // 32-bit code, base 0, limit 4G
    .quad 0x00CF92000000FFFF    // 32-bit data, base 0, limit 4G
    .quad 0x00AF9A000000FFFF    // 64-bit code
__ap_gdt_desc:
    .word __ap_gdt_desc - __ap_gdt - 1
    .long AP_GDT_ABS

.balign 8
__ap_param_cr3:
    .quad 0
__ap_param_stack:
    .quad 0
__ap_param_entry:
    .quad 0
__ap_trampoline_end:

// The blob executes from AP_TRAMPOLINE_PHYS, not from its link address;
// every absolute reference is rebased accordingly.
.set AP_TRAMPOLINE_PHYS, 0x8000
.set AP_PM32_ABS,        __ap_pm32        - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_LM64_ABS,        __ap_lm64        - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_GDT_ABS,         __ap_gdt         - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_GDT_DESC_ABS,    __ap_gdt_desc    - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_PARAM_CR3_ABS,   __ap_param_cr3   - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_PARAM_STACK_ABS, __ap_param_stack - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
.set AP_PARAM_ENTRY_ABS, __ap_param_entry - __ap_trampoline_start + AP_TRAMPOLINE_PHYS
"#,
    options(att_syntax)
);

extern "C" {
    static __ap_trampoline_start: u8;
    static __ap_trampoline_end: u8;
}

fn trampoline_blob() -> &'static [u8] {
    unsafe {
        let start = core::ptr::addr_of!(__ap_trampoline_start);
        let end = core::ptr::addr_of!(__ap_trampoline_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

/// Control surface the sequencing logic drives, so the protocol can run
/// against a mock transport under test.
pub trait ApControl {
    fn send_init(&mut self, apic_id: u32);
    fn send_sipi(&mut self, apic_id: u32, vector: u8);
    fn now_ns(&self) -> u64;
    fn cores_online(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApBootError {
    /// The AP did not report in within the 100 ms window; non-fatal, the AP
    /// is skipped.
    Timeout { apic_id: u32 },
}

/// One AP's INIT-SIPI sequence: INIT, a 10 ms hold measured on the wall
/// clock, SIPI, then a bounded spin for the `cores_online` increment.
pub fn start_ap(ctl: &mut impl ApControl, apic_id: u32, sipi_vector: u8) -> Result<(), ApBootError> {
    let expected = ctl.cores_online();

    ctl.send_init(apic_id);
    let init_sent = ctl.now_ns();
    while ctl.now_ns().wrapping_sub(init_sent) < INIT_HOLD_NS {
        core::hint::spin_loop();
    }

    ctl.send_sipi(apic_id, sipi_vector);
    let sipi_sent = ctl.now_ns();
    while ctl.cores_online() == expected {
        if ctl.now_ns().wrapping_sub(sipi_sent) > AP_TIMEOUT_NS {
            return Err(ApBootError::Timeout { apic_id });
        }
        core::hint::spin_loop();
    }

    Ok(())
}

struct LapicApControl;

impl ApControl for LapicApControl {
    fn send_init(&mut self, apic_id: u32) {
        apic::lapic().send_init_ipi(apic_id);
    }
    fn send_sipi(&mut self, apic_id: u32, vector: u8) {
        apic::lapic().send_sipi(apic_id, vector);
    }
    fn now_ns(&self) -> u64 {
        use crate::time::Timer;
        hpet::hpet().now_ns()
    }
    fn cores_online(&self) -> usize {
        CORES_ONLINE.load(Ordering::Acquire)
    }
}

/// Install the trampoline and boot every AP in `apic_ids` (the BSP's own id
/// is skipped). Timeouts are logged and skipped; other APs still boot.
///
/// # Safety:
/// Requires the physmap, HPET, LAPIC, and per-core table infrastructure to
/// be initialised, and `apic_ids` to come from the firmware's MADT.
pub unsafe fn boot_aps(apic_ids: &[u32]) {
    let blob = trampoline_blob();
    assert!(
        blob.len() as u64 <= PageSize::Page4K.bytes(),
        "AP trampoline exceeds one page"
    );

    let bsp_id = apic::lapic().apic_id();
    let pml4_paddr = registers::cr3_read();
    assert!(pml4_paddr < u32::MAX as u64, "trampoline loads CR3 as a 32-bit value");

    // the trampoline frame must be identity mapped RWX supervisor; the
    // loader-inherited tables usually cover low memory already, possibly
    // with a huge leaf this mapping must not shadow
    let pml4_vaddr = PAddr(pml4_paddr).to_vaddr(HhdmBase::Physmap);
    let identity_virt = TRAMPOLINE_PHYS.to_vaddr(HhdmBase::Identity);
    match memm::translate(pml4_vaddr, identity_virt, HhdmBase::Physmap) {
        Some((paddr, _, leaf)) => {
            assert_eq!(paddr, TRAMPOLINE_PHYS, "low memory is not identity mapped");
            assert!(
                leaf.contains(Pte::WRITE) && !leaf.contains(Pte::NO_EXECUTE),
                "trampoline page is mapped without RWX"
            );
        }
        None => {
            let mut pmm = crate::memm::pmm::pmm().lock();
            memm::map_page(
                pml4_vaddr,
                identity_virt,
                TRAMPOLINE_PHYS,
                PageSize::Page4K,
                Pte::WRITE,
                HhdmBase::Physmap,
                &mut || pmm.alloc_frame(),
            );
            drop(pmm);
            amd64::paging::invlpg(TRAMPOLINE_PHYS.0);
        }
    }

    let dest = TRAMPOLINE_PHYS.to_vaddr(HhdmBase::Physmap);
    core::ptr::copy_nonoverlapping(blob.as_ptr(), dest.as_mut_ptr::<u8>(), blob.len());

    let params_vaddr = VAddr(dest.0 + blob.len() as u64 - TRAMPOLINE_PARAMS_LEN);
    let sipi_vector = (TRAMPOLINE_PHYS.0 >> 12) as u8;
    let mut ctl = LapicApControl;

    for &apic_id in apic_ids.iter().filter(|&&id| id != bsp_id) {
        let stack_base = match crate::memm::pmm::pmm().lock().alloc_frames(AP_STACK_PAGES) {
            Some(base) => base,
            None => panic!("out of physical memory allocating an AP stack"),
        };
        let stack_top = PAddr(stack_base.0 + AP_STACK_PAGES * PageSize::Page4K.bytes())
            .to_vaddr(HhdmBase::Physmap);

        let params = TrampolineParams {
            cr3: pml4_paddr,
            stack_top: stack_top.0 & !0xF,
            entry_point: ap_entry as usize as u64,
        };
        core::ptr::write_volatile(params_vaddr.as_mut_ptr::<TrampolineParams>(), params);

        match start_ap(&mut ctl, apic_id, sipi_vector) {
            Ok(()) => log::info!("smp: apic id {} online", apic_id),
            Err(ApBootError::Timeout { apic_id }) => {
                log::warn!("smp: apic id {} did not come up within 100 ms, skipping", apic_id);
            }
        }
    }

    log::info!("smp: {} cores online", CORES_ONLINE.load(Ordering::Acquire));
}

/// Rust-side AP entry, reached from the trampoline's 64-bit tail: per-core
/// GDT/IDT/TSS, spurious-vector enable, report in, and wait for the
/// scheduler to adopt the core.
extern "sysv64" fn ap_entry() -> ! {
    let core_idx = CORES_ONLINE.load(Ordering::Acquire);
    unsafe {
        cpu::core_init(core_idx);
    }
    apic::lapic().enable_spurious();

    CORES_ONLINE.fetch_add(1, Ordering::Release);

    amd64::hlt_loop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Mock transport: HPET time advances on every read; the "AP" reports in
    /// a fixed delay after the SIPI.
    struct MockControl {
        now: Cell<u64>,
        init_sent_at: Cell<Option<u64>>,
        sipi_sent_at: Cell<Option<u64>>,
        sipi_vector: Cell<Option<u8>>,
        online: Cell<usize>,
        ap_boot_delay_ns: u64,
        ap_responds: bool,
    }

    impl MockControl {
        fn new(ap_boot_delay_ns: u64, ap_responds: bool) -> MockControl {
            MockControl {
                now: Cell::new(0),
                init_sent_at: Cell::new(None),
                sipi_sent_at: Cell::new(None),
                sipi_vector: Cell::new(None),
                online: Cell::new(1),
                ap_boot_delay_ns,
                ap_responds,
            }
        }
    }

    impl ApControl for MockControl {
        fn send_init(&mut self, _apic_id: u32) {
            self.init_sent_at.set(Some(self.now.get()));
        }
        fn send_sipi(&mut self, _apic_id: u32, vector: u8) {
            self.sipi_sent_at.set(Some(self.now.get()));
            self.sipi_vector.set(Some(vector));
        }
        fn now_ns(&self) -> u64 {
            // monotonically increasing mock clock
            self.now.set(self.now.get() + 50_000);
            let now = self.now.get();
            if self.ap_responds {
                if let Some(sipi) = self.sipi_sent_at.get() {
                    if now.wrapping_sub(sipi) >= self.ap_boot_delay_ns {
                        self.online.set(2);
                    }
                }
            }
            now
        }
        fn cores_online(&self) -> usize {
            self.online.get()
        }
    }

    #[test]
    fn init_sipi_sequencing_observes_the_hold_time() {
        // AP reports in 15 ms after SIPI; well inside the 100 ms window
        let mut ctl = MockControl::new(15_000_000, true);
        start_ap(&mut ctl, 1, 0x08).unwrap();

        let init = ctl.init_sent_at.get().expect("INIT was sent");
        let sipi = ctl.sipi_sent_at.get().expect("SIPI was sent");
        assert!(sipi - init >= INIT_HOLD_NS, "SIPI must wait >= 10 ms after INIT");
        assert_eq!(ctl.sipi_vector.get(), Some(0x08));
        assert_eq!(ctl.cores_online(), 2);
    }

    #[test]
    fn two_aps_bring_the_count_to_three() {
        // the counter accumulates across APs: each mock adds one
        let mut total = 1usize;
        for apic_id in [1u32, 2] {
            let mut ctl = MockControl::new(15_000_000, true);
            start_ap(&mut ctl, apic_id, 0x08).unwrap();
            total += ctl.cores_online() - 1;
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn silent_aps_time_out_and_are_skipped() {
        let mut ctl = MockControl::new(0, false);
        assert_eq!(
            start_ap(&mut ctl, 5, 0x08),
            Err(ApBootError::Timeout { apic_id: 5 })
        );
        // the timeout consumed at least the 100 ms window
        let sipi = ctl.sipi_sent_at.get().unwrap();
        assert!(ctl.now.get() - sipi >= AP_TIMEOUT_NS);
    }

    #[test]
    fn parameter_block_layout_is_fixed() {
        assert_eq!(core::mem::size_of::<TrampolineParams>(), 24);
        assert_eq!(core::mem::offset_of!(TrampolineParams, cr3), 0);
        assert_eq!(core::mem::offset_of!(TrampolineParams, stack_top), 8);
        assert_eq!(core::mem::offset_of!(TrampolineParams, entry_point), 16);
    }

    #[test]
    fn trampoline_fits_one_page_and_ends_with_the_params() {
        let blob = trampoline_blob();
        assert!(blob.len() <= 0x1000);
        assert!(blob.len() as u64 > TRAMPOLINE_PARAMS_LEN);
        // the parameter block tail assembles as zeroes
        let tail = &blob[blob.len() - TRAMPOLINE_PARAMS_LEN as usize..];
        assert!(tail.iter().all(|&b| b == 0));
    }
}
