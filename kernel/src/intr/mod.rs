//! The interrupt dispatch fabric.
//!
//! 256 per-vector entry stubs are emitted at compile time by assembler-level
//! iteration, at a fixed 16-byte stride from `__isr_stub_table`. Each stub
//! pushes a synthetic zero error code when the CPU does not push one, then
//! the vector number, and jumps to the common prologue. The prologue saves
//! the general purpose registers, hands the resulting [`Context`] to the
//! dispatcher, and unwinds through the common epilogue with `iretq`.

pub mod exceptions;
pub mod syscall;

use core::cell::UnsafeCell;
use core::mem::size_of;

use amd64::interrupts::{Gate, Ssdt};
use amd64::PrivLvl;

use crate::addr::VAddr;
use crate::{apic, cpu, sched};

/// Vectors for which the CPU itself pushes an error code; every other stub
/// pushes a zero placeholder so a single frame layout suffices.
/// (Intel SDM Vol. 3A §6.15.)
pub const PUSHES_ERR_CODE: [u8; 10] = [8, 10, 11, 12, 13, 14, 17, 21, 29, 30];

pub const IRQ_BASE_VECTOR: u8 = 32;
pub const SYSCALL_VECTOR: u8 = 0x80;
pub const SCHED_TICK_VECTOR: u8 = 0xFE;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// General purpose registers as laid out by the common prologue, ascending
/// addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GprFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Everything on the stack when the dispatcher runs: the saved registers,
/// the stub-pushed vector and error code, and the CPU-pushed `iretq` frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub regs: GprFrame,
    pub int_num: u64,
    pub err_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<Context>() == 22 * 8);

impl Context {
    /// Privilege level the interrupt arrived from.
    #[inline]
    pub fn privilege(&self) -> PrivLvl {
        PrivLvl::from_bits((self.cs & 0b11) as u8)
    }
}

// stub table and common entry/exit path

const STUB_STRIDE: u64 = 16;

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.global __isr_stub_table
.global __interrupt_epilogue

// One entry stub per vector at a fixed 16-byte stride. Vectors where the
// CPU pushes an error code get only the vector number; the rest get a zero
// placeholder first.
.altmacro
.macro isr_stub vec
    .balign 16
    .if (\vec == 8) || (\vec == 10) || (\vec == 11) || (\vec == 12) || (\vec == 13) || (\vec == 14) || (\vec == 17) || (\vec == 21) || (\vec == 29) || (\vec == 30)
    push \vec
    .else
    push 0
    push \vec
    .endif
    jmp __interrupt_common
.endm

.balign 16
__isr_stub_table:
.set vec_i, 0
.rept 256
    isr_stub %vec_i
    .set vec_i, vec_i + 1
.endr

// Save the GPRs so the stack holds a complete Context, hand its address to
// the dispatcher, and unwind back through iretq. Push order is the reverse
// of the GprFrame field order.
__interrupt_common:
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    call __interrupt_dispatch
    jmp __interrupt_epilogue

__interrupt_epilogue:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax

    // discard the vector number and error code
    add rsp, 16
    iretq
"#
);

extern "C" {
    static __isr_stub_table: u8;
}

/// Address of the entry stub for `vector`.
fn stub_addr(vector: u8) -> u64 {
    unsafe { core::ptr::addr_of!(__isr_stub_table) as u64 + vector as u64 * STUB_STRIDE }
}

/// What a vector means for the dispatcher, beyond its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    /// CPU exception; no end-of-interrupt.
    Exception,
    /// External interrupt delivered through the LAPIC; requires an EOI after
    /// the handler returns.
    External,
    /// Software raised (e.g. `int 0x80`); no end-of-interrupt.
    Software,
}

pub type Handler = fn(&mut Context);

#[derive(Clone, Copy)]
struct VectorEntry {
    handler: Option<Handler>,
    kind: VectorKind,
}

/// The 256-entry dispatch table. Entries are registered exactly once during
/// bring-up and read lock-free from interrupt context thereafter.
pub struct VectorTable {
    entries: UnsafeCell<[VectorEntry; 256]>,
}

// registration is single-threaded bring-up; dispatch reads only
unsafe impl Sync for VectorTable {}

impl VectorTable {
    pub const fn new() -> VectorTable {
        const EMPTY: VectorEntry = VectorEntry { handler: None, kind: VectorKind::Exception };
        VectorTable { entries: UnsafeCell::new([EMPTY; 256]) }
    }

    /// # Panics
    /// A vector is registered at most once; a second registration is a bug.
    pub fn register(&self, vector: u8, kind: VectorKind, handler: Handler) {
        let entries = unsafe { &mut *self.entries.get() };
        assert!(
            entries[vector as usize].handler.is_none(),
            "vector {:#x} registered twice",
            vector
        );
        entries[vector as usize] = VectorEntry { handler: Some(handler), kind };
    }

    fn get(&self, vector: u8) -> VectorEntry {
        unsafe { (*self.entries.get())[vector as usize] }
    }
}

static VECTORS: VectorTable = VectorTable::new();

/// Register an exception handler and open its interrupt gate. `dpl` is
/// `Ring3` only for the vectors userland may raise (`#BP`, `#DB`); `ist`
/// selects a TSS stack, 0 for none.
pub fn register_exception(vector: u8, dpl: PrivLvl, ist: u8, handler: Handler) {
    VECTORS.register(vector, VectorKind::Exception, handler);
    open_gate(vector, dpl, ist);
}

/// Register an external (LAPIC-delivered) interrupt handler; the dispatcher
/// signals end-of-interrupt after it returns.
pub fn register_external(vector: u8, handler: Handler) {
    VECTORS.register(vector, VectorKind::External, handler);
    open_gate(vector, PrivLvl::Ring0, 0);
}

/// Register a software interrupt handler; `dpl` is `Ring3` for gates
/// userland may invoke.
pub fn register_software(vector: u8, dpl: PrivLvl, handler: Handler) {
    VECTORS.register(vector, VectorKind::Software, handler);
    open_gate(vector, dpl, 0);
}

fn open_gate(vector: u8, dpl: PrivLvl, ist: u8) {
    let gate = Gate::new(
        stub_addr(vector),
        cpu::KERNEL_CODE_SEL,
        ist,
        Ssdt::InterruptGate,
        dpl,
    );
    unsafe {
        cpu::with_idt(|idt| idt.open_gate(vector, gate));
    }
}

#[no_mangle]
extern "sysv64" fn __interrupt_dispatch(ctx: &mut Context) {
    let entry = VECTORS.get(ctx.int_num as u8);
    match entry.handler {
        Some(handler) => {
            handler(ctx);
            if entry.kind == VectorKind::External {
                apic::end_of_interrupt();
            }
        }
        None => {
            exceptions::dump_frame(ctx);
            panic!(
                "unhandled interrupt vector {:#x} (err {:#x})",
                ctx.int_num, ctx.err_code
            );
        }
    }
}

/// Unwind into `thread`'s saved context.
///
/// For a user thread, `tss.rsp0` is pointed at its kernel stack and its
/// address space root is installed first. The end-of-interrupt is signalled
/// before the epilogue so lower-priority interrupts can fire once `iretq`
/// re-enables them; between the CR3 load and the stack switch no memory is
/// touched.
///
/// # Safety:
/// `thread.saved_rsp` must point at a well-formed [`Context`] on a mapped
/// stack, and the thread's CR3 (user threads) must map that stack and the
/// epilogue.
#[cfg(target_arch = "x86_64")]
pub unsafe fn switch_to(thread: &sched::Thread) -> ! {
    if thread.user {
        cpu::set_rsp0(thread.kstack_top.0);
        if amd64::registers::cr3_read() != thread.cr3.0 {
            amd64::registers::cr3_write(thread.cr3.0);
        }
    }
    apic::end_of_interrupt();
    core::arch::asm!(
        "mov rsp, {}",
        "jmp __interrupt_epilogue",
        in(reg) thread.saved_rsp.0,
        options(noreturn),
    );
}

/// Build an `iretq`-shaped [`Context`] at the top of `kstack_top` so that
/// unwinding through the common epilogue enters `entry` as a fresh thread.
///
/// Registers are zeroed and `rflags` starts as `0x202` (IF plus the
/// must-be-set bit). With a user stack the selectors carry RPL 3 and `rsp`
/// is the user stack top; otherwise the thread runs on the kernel stack
/// directly below the frame.
///
/// Returns the stack pointer to store as the thread's `saved_rsp`.
///
/// # Safety:
/// `kstack_top` must be 16-byte aligned with at least `size_of::<Context>()`
/// writable bytes below it.
pub unsafe fn prepare_interrupt_frame(
    kstack_top: VAddr,
    ustack_top: Option<VAddr>,
    entry: u64,
) -> VAddr {
    let frame_base = VAddr(kstack_top.0 - size_of::<Context>() as u64);
    let ctx = &mut *frame_base.as_mut_ptr::<Context>();

    *ctx = core::mem::zeroed();
    ctx.rip = entry;
    ctx.rflags = 0x202;
    match ustack_top {
        Some(ustack) => {
            ctx.cs = cpu::USER_CODE_SEL.to_bits() as u64;
            ctx.ss = cpu::USER_DATA_SEL.to_bits() as u64;
            ctx.rsp = ustack.0;
        }
        None => {
            ctx.cs = cpu::KERNEL_CODE_SEL.to_bits() as u64;
            ctx.ss = cpu::KERNEL_DATA_SEL.to_bits() as u64;
            ctx.rsp = frame_base.0;
        }
    }

    frame_base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_the_push_order() {
        assert_eq!(size_of::<Context>(), 176);
        let base = core::mem::offset_of!(Context, regs);
        assert_eq!(base, 0);
        assert_eq!(core::mem::offset_of!(GprFrame, r15), 0);
        assert_eq!(core::mem::offset_of!(GprFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(Context, int_num), 15 * 8);
        assert_eq!(core::mem::offset_of!(Context, err_code), 16 * 8);
        assert_eq!(core::mem::offset_of!(Context, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(Context, ss), 21 * 8);
    }

    #[test]
    fn error_code_vector_set_is_architectural() {
        // Intel SDM Vol. 3A §6.15: #DF #TS #NP #SS #GP #PF #AC #CP #VC #SX
        assert_eq!(PUSHES_ERR_CODE, [8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
        for v in [0u8, 1, 3, 6, 16, 18, 19, 32, 0x80, 0xFE, 0xFF] {
            assert!(!PUSHES_ERR_CODE.contains(&v));
        }
    }

    #[test]
    fn vector_table_registration_is_one_shot() {
        let table = VectorTable::new();
        fn nop(_: &mut Context) {}
        table.register(0x41, VectorKind::External, nop);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            table.register(0x41, VectorKind::External, nop);
        }));
        assert!(result.is_err(), "duplicate registration must be detected");
    }

    #[test]
    fn kernel_frame_preparation() {
        let mut stack = vec![0u8; 0x1000];
        let top = VAddr((stack.as_mut_ptr() as u64 + 0x1000) & !0xF);

        let rsp = unsafe { prepare_interrupt_frame(top, None, 0xFFFF_FFFF_8000_1234) };
        assert_eq!(rsp.0, top.0 - 176);

        let ctx = unsafe { &*rsp.as_ptr::<Context>() };
        assert_eq!(ctx.rip, 0xFFFF_FFFF_8000_1234);
        assert_eq!(ctx.rflags, 0x202);
        assert_eq!(ctx.cs, cpu::KERNEL_CODE_SEL.to_bits() as u64);
        assert_eq!(ctx.ss, cpu::KERNEL_DATA_SEL.to_bits() as u64);
        assert_eq!(ctx.rsp, rsp.0);
        assert_eq!(ctx.regs.rax, 0);
        assert_eq!(ctx.privilege(), PrivLvl::Ring0);
    }

    #[test]
    fn user_frame_preparation_sets_rpl3_selectors() {
        let mut stack = vec![0u8; 0x1000];
        let top = VAddr((stack.as_mut_ptr() as u64 + 0x1000) & !0xF);

        let user_stack = VAddr(0x0000_7FFF_FFFF_0000);
        let rsp = unsafe { prepare_interrupt_frame(top, Some(user_stack), 0x40_0000) };
        let ctx = unsafe { &*rsp.as_ptr::<Context>() };
        assert_eq!(ctx.cs & 0b11, 3);
        assert_eq!(ctx.ss & 0b11, 3);
        assert_eq!(ctx.rsp, user_stack.0);
        assert_eq!(ctx.privilege(), PrivLvl::Ring3);
    }

    #[test]
    fn stub_addresses_are_strided() {
        assert_eq!(stub_addr(1) - stub_addr(0), STUB_STRIDE);
        assert_eq!(stub_addr(255) - stub_addr(0), 255 * STUB_STRIDE);
    }
}
