//! Per-core descriptor tables and the process-wide IDT.
//!
//! Each core owns a 7-slot GDT (null, kernel code/data, user code/data, and
//! the two-slot TSS descriptor) and a TSS whose `rsp0` is rewritten on
//! context switches. The IDT is shared: gates are opened once during BSP
//! bring-up and every core loads the same table.

use core::cell::UnsafeCell;

use amd64::interrupts::{lidt, Idt};
use amd64::registers::{self, rdtscp};
use amd64::segmentation::{
    lgdt, ltr, reload_segments, CodeSegDesc, DataSegDesc, SegSel, SysSegDesc, TaskStateSeg,
};
use amd64::{interrupts::Ssdt, PrivLvl};

pub const KERNEL_CODE_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 1);
pub const KERNEL_DATA_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 2);
pub const USER_CODE_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring3, 3);
pub const USER_DATA_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring3, 4);
pub const TSS_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 5);

pub const MAX_CORES: usize = 16;

/// Stack used for `#DF` via IST 1, so a corrupt kernel stack still reaches
/// the double-fault dump.
const DF_STACK_SIZE: usize = 0x2000;

#[repr(C)]
struct CoreTables {
    gdt: [u64; 7],
    tss: TaskStateSeg,
    df_stack: [u8; DF_STACK_SIZE],
}

struct Cores(UnsafeCell<[CoreTables; MAX_CORES]>);

// mutated only by the owning core (set_rsp0) or during that core's single
// bring-up call
unsafe impl Sync for Cores {}

const CORE_INIT: CoreTables = CoreTables {
    gdt: [0; 7],
    tss: TaskStateSeg::new(),
    df_stack: [0; DF_STACK_SIZE],
};

static CORES: Cores = Cores(UnsafeCell::new([CORE_INIT; MAX_CORES]));

struct IdtCell(UnsafeCell<Idt>);

// written only while gates are opened during single-threaded bring-up
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new(Idt::empty()));

/// Open a gate in the shared IDT. Bring-up only; the table is read-only once
/// interrupts are enabled.
///
/// # Safety:
/// Must not race dispatch: only call before the affected vector can fire.
pub unsafe fn with_idt(f: impl FnOnce(&mut Idt)) {
    f(&mut *IDT.0.get())
}

/// Load per-core GDT and TSS, reload the segment registers, load the shared
/// IDT, and record the core index for [`current_core`].
///
/// # Safety:
/// `core_idx` must be unique per running core and below [`MAX_CORES`]; call
/// exactly once per core, before that core enables interrupts.
pub unsafe fn core_init(core_idx: usize) {
    assert!(core_idx < MAX_CORES, "core index {} exceeds MAX_CORES", core_idx);
    let core = &mut (*CORES.0.get())[core_idx];

    core.tss = TaskStateSeg::new();
    let df_stack_top = core.df_stack.as_ptr() as u64 + DF_STACK_SIZE as u64;
    core.tss.set_ist(1, df_stack_top & !0xF);

    let tss_desc = SysSegDesc::new(
        &core.tss as *const _ as u64,
        TaskStateSeg::LIMIT,
        Ssdt::AvlTss,
        PrivLvl::Ring0,
    );
    let [tss_lo, tss_hi] = tss_desc.to_bits();
    core.gdt = [
        0,
        CodeSegDesc::ring(PrivLvl::Ring0).bits(),
        DataSegDesc::ring(PrivLvl::Ring0).bits(),
        CodeSegDesc::ring(PrivLvl::Ring3).bits(),
        DataSegDesc::ring(PrivLvl::Ring3).bits(),
        tss_lo,
        tss_hi,
    ];

    lgdt(&core.gdt);
    reload_segments(KERNEL_CODE_SEL, KERNEL_DATA_SEL);
    ltr(TSS_SEL);
    lidt(IDT.0.get());

    registers::wrmsr(registers::TSC_AUX_MSR, core_idx as u64);
}

/// Index of the executing core, as recorded by [`core_init`].
#[inline]
pub fn current_core() -> usize {
    rdtscp().1 as usize
}

/// Point the executing core's `tss.rsp0` at `stack_top`; the stack the CPU
/// switches to on a ring3 -> ring0 transition.
pub fn set_rsp0(stack_top: u64) {
    unsafe {
        (*CORES.0.get())[current_core()].tss.set_rsp0(stack_top);
    }
}
