//! Interrupt gates, the Interrupt Descriptor Table, and interrupt-flag
//! control.

use core::mem::size_of;

use super::{registers::RFLAGS, segmentation::SegSel, PrivLvl};

// ERROR CODES

// Error code docs are taken from https://www.amd.com/system/files/TechDocs/24593.pdf
bitflags::bitflags! {
    /// Selector error code flags.
    pub struct SelErrCode: u64 {
        /// EXT: If set, the exception source is external to the processor.
        const EXTERNAL = 1 << 0;
        /// IDT: If set, the error-code selector-index field references a gate
        /// descriptor located in the IDT; if clear, the GDT or LDT as
        /// indicated by the TI bit.
        const IDT = 1 << 1;
        /// TI: If set, the selector-index field references a descriptor in
        /// the LDT; relevant only when the IDT bit is clear.
        const LDT = 1 << 2;
        /// The selector-index field.
        const INDEX_MASK = 0b11111111_11111000;
    }

    /// Page Fault error code flags.
    pub struct PfErrCode: u64 {
        /// P: If clear, the page fault was caused by a not-present page. If
        /// set, the page fault was caused by a page-protection violation.
        const P = 1 << 0;
        /// R/W: If clear, the access that caused the page fault is a memory
        /// read. If set, a write.
        const RW = 1 << 1;
        /// U/S: If clear, an access in supervisor mode (CPL 0, 1, or 2)
        /// caused the page fault. If set, an access in user mode (CPL 3).
        const US = 1 << 2;
        /// RSV: If set, the page fault is a result of the processor reading a
        /// 1 from a reserved field within a page-translation-table entry.
        const RSV = 1 << 3;
        /// I/D: If set, the access that caused the page fault was an
        /// instruction fetch. Only defined when `EFER::NXE` is enabled.
        const ID = 1 << 4;
        /// PK: A data access to a user-mode address caused a protection key
        /// violation (`CR4::PKE` only).
        const PK = 1 << 5;
        /// SS: The page fault was caused by a shadow stack access
        /// (`CR4::CET` only).
        const SS = 1 << 6;
    }
}

// GATES

const GATE_FLAG_PRESENT: u8 = 0b1000_0000;
const GATE_DPL_MASK: u8 = 0b0110_0000;
const GATE_SSDT_MASK: u8 = 0b0000_1111;

/// System-Segment Descriptor Type.
///
/// Long mode specific.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ssdt {
    Ldt = 0b0010,
    AvlTss = 0b1001,
    BusyTss = 0b1011,
    CallGate = 0b1100,
    InterruptGate = 0b1110,
    TrapGate = 0b1111,
}

impl Ssdt {
    pub fn from_bits(from: u8) -> Self {
        match from {
            0b0010 => Ssdt::Ldt,
            0b1001 => Ssdt::AvlTss,
            0b1011 => Ssdt::BusyTss,
            0b1100 => Ssdt::CallGate,
            0b1110 => Ssdt::InterruptGate,
            0b1111 => Ssdt::TrapGate,
            _ => panic!("Invalid x86 system-segment descriptor type"),
        }
    }
}

/// An interrupt gate or trap gate descriptor entry of the Interrupt
/// Descriptor Table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Gate {
    /// Partial interrupt service routine address
    isr_ptr_lo: u16,
    /// Segment selector to a code segment
    pub selector: u16,
    /// Low three bits are the Interrupt Stack Table (IST) index, that when
    /// not zero, select a stack from the TSS to execute the handler on. This
    /// is useful for handling errors that have corrupted the stack.
    ///
    /// When zero, the legacy stack-switching mechanism is used.
    ist: u8,
    /// Low nibble: `Ssdt::InterruptGate` or `Ssdt::TrapGate`.
    ///
    /// High nibble: bit 4 clear, bits [5:6] DPL, bit 7 present.
    flags: u8,
    /// Partial interrupt service routine address
    isr_ptr_mid: u16,
    /// Partial interrupt service routine address
    isr_ptr_hi: u32,
    reserved: u32,
}

impl Gate {
    pub const fn missing() -> Self {
        Gate {
            isr_ptr_lo: 0,
            selector: 0,
            ist: 0,
            flags: Ssdt::InterruptGate as u8,
            isr_ptr_mid: 0,
            isr_ptr_hi: 0,
            reserved: 0,
        }
    }

    /// # Panics
    /// * `ssdt` must be either `Ssdt::InterruptGate` or `Ssdt::TrapGate`.
    /// * `ist` (Interrupt Stack Table index) must be less than 8.
    pub fn new(target_laddr: u64, selector: SegSel, ist: u8, ssdt: Ssdt, dpl: PrivLvl) -> Self {
        match ssdt {
            Ssdt::InterruptGate | Ssdt::TrapGate => (),
            _ => panic!("invalid descriptor type for a gate: {:?}", ssdt),
        }
        assert!(ist < 8, "IST index must be between 0 and 7 inclusive");

        Gate {
            isr_ptr_lo: target_laddr as u16,
            selector: selector.to_bits(),
            ist,
            flags: ssdt as u8 | (dpl as u8) << GATE_DPL_MASK.trailing_zeros() | GATE_FLAG_PRESENT,
            isr_ptr_mid: (target_laddr >> 16) as u16,
            isr_ptr_hi: (target_laddr >> 32) as u32,
            reserved: 0,
        }
    }

    #[inline]
    pub fn get_target(&self) -> u64 {
        self.isr_ptr_lo as u64 | (self.isr_ptr_mid as u64) << 16 | (self.isr_ptr_hi as u64) << 32
    }

    #[inline]
    pub fn get_ist(&self) -> u8 {
        self.ist
    }

    #[inline]
    pub fn get_ssdt(&self) -> Ssdt {
        Ssdt::from_bits(self.flags & GATE_SSDT_MASK)
    }

    #[inline]
    pub fn get_dpl(&self) -> PrivLvl {
        PrivLvl::from_bits((self.flags & GATE_DPL_MASK) >> GATE_DPL_MASK.trailing_zeros())
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags & GATE_FLAG_PRESENT == GATE_FLAG_PRESENT
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gate")
            .field("target", &self.get_target())
            .field("selector", &self.selector)
            .field("present", &self.is_present())
            .field("ssdt", &self.get_ssdt())
            .field("dpl", &self.get_dpl())
            .field("ist", &self.ist)
            .finish()
    }
}

const _: () = assert!(size_of::<Gate>() == 16);

/// Interrupt Descriptor Table: 256 gates, one per vector.
///
/// Vectors 0..32 are CPU exceptions, the rest are software defined.
#[repr(C, align(16))]
pub struct Idt {
    pub gates: [Gate; 256],
}

impl Idt {
    pub const fn empty() -> Self {
        Idt { gates: [Gate::missing(); 256] }
    }

    /// Install a gate at `vector`.
    ///
    /// # Panics
    /// A gate may be opened exactly once; panics if the slot is already
    /// present.
    pub fn open_gate(&mut self, vector: u8, gate: Gate) {
        let slot = &mut self.gates[vector as usize];
        assert!(
            !slot.is_present(),
            "IDT gate {} is already present; vectors are registered once",
            vector
        );
        *slot = gate;
    }
}

/// Load the Interrupt Descriptor Table into IDTR.
///
/// # Safety:
/// `idt` must remain in memory, fully initialised, for at least as long as it
/// is loaded.
#[cfg(target_arch = "x86_64")]
pub unsafe fn lidt(idt: *const Idt) {
    let dto = super::segmentation::DescriptorTableOp {
        limit: size_of::<Idt>() as u16 - 1,
        base: idt as u64,
    };
    core::arch::asm!("lidt [{}]", in(reg) &dto, options(readonly, nostack, preserves_flags));
}

/// Disable Interrupts
pub fn cli() {
    unsafe {
        core::arch::asm!("cli", options(nostack, nomem, preserves_flags));
    }
}
/// Enable Interrupts
pub fn sti() {
    unsafe {
        core::arch::asm!("sti", options(nostack, nomem, preserves_flags));
    }
}
/// Enable Interrupts and Halt
///
/// Useful for preventing race conditions between interrupts and a hlt.
pub fn sti_hlt() {
    unsafe {
        core::arch::asm!("sti; hlt", options(nostack, nomem, preserves_flags));
    }
}

/// Disable interrupts, returning the prior RFLAGS image for
/// [`restore_interrupts`]. Brackets critical sections that must run atomically
/// with respect to handlers on the current core.
pub fn save_and_disable_interrupts() -> RFLAGS {
    let saved = RFLAGS::read();
    cli();
    saved
}

/// Re-enable interrupts iff they were enabled in `saved`.
pub fn restore_interrupts(saved: RFLAGS) {
    if saved.contains(RFLAGS::IF) {
        sti();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_target_split() {
        let gate = Gate::new(
            0xFFFF_FFFF_8012_3456,
            SegSel::new_gdt(PrivLvl::Ring0, 1),
            0,
            Ssdt::InterruptGate,
            PrivLvl::Ring3,
        );
        assert_eq!(gate.get_target(), 0xFFFF_FFFF_8012_3456);
        assert_eq!(gate.get_dpl(), PrivLvl::Ring3);
        assert_eq!(gate.get_ssdt(), Ssdt::InterruptGate);
        assert!(gate.is_present());
    }

    #[test]
    #[should_panic]
    fn gates_open_once() {
        let mut idt = Idt::empty();
        let gate = Gate::new(
            0x1000,
            SegSel::new_gdt(PrivLvl::Ring0, 1),
            0,
            Ssdt::InterruptGate,
            PrivLvl::Ring0,
        );
        idt.open_gate(0x40, gate);
        idt.open_gate(0x40, gate);
    }
}
