//! Interaction and access to some common x86-64 registers.

use core::arch::asm;

pub const APIC_BASE_MSR: u32 = 0x0000001B;
pub const EFER_MSR: u32 = 0xC0000080;
pub const TSC_DEADLINE_MSR: u32 = 0x000006E0;
/// Base of the x2APIC MSR window; register at MMIO offset `o` is `0x800 + (o >> 4)`.
pub const X2APIC_MSR_BASE: u32 = 0x00000800;
pub const KERNEL_GS_BASE_MSR: u32 = 0xC0000102;
/// IA32_TSC_AUX, returned in ECX by `rdtscp`; holds the core index.
pub const TSC_AUX_MSR: u32 = 0xC0000103;

bitflags::bitflags! {
    #[repr(transparent)]
    pub struct RFLAGS: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must-Be-Set legacy bit; set in every freshly constructed RFLAGS image.
        const MBS = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt Enable Flag
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;

        /// I/O Privilege Level mask
        const IOPL_MASK = 0b11 << 12;

        /// Nested Task Flag
        const NT = 1 << 14;
        /// Resume Flag
        const RF = 1 << 16;
        /// Virtual-8086 mode Flag
        const VM = 1 << 17;
        /// Alignment Check Flag
        const AC = 1 << 18;
        /// Virtual Interrupt Flag
        const VIF = 1 << 19;
        /// Virtual Interrupt Pending
        const VIP = 1 << 20;
        /// CPUID available
        const ID = 1 << 21;
    }

    /// Control Register 0 (CR0) flags
    pub struct CR0: u64 {
        /// Protected Mode Enable: When set, CPU is in protected mode.
        const PE = 1 << 0;
        /// Monitor Co-Processor.
        const MP = 1 << 1;
        /// Emulation: When set, no x87 floating-point unit present.
        const EM = 1 << 2;
        /// Task Switched.
        const TS = 1 << 3;
        /// Extension Type.
        const ET = 1 << 4;
        /// Numeric Error.
        const NE = 1 << 5;
        /// Write Protect: When set, supervisor writes honour read-only pages.
        const WP = 1 << 16;
        /// Alignment Mask.
        const AM = 1 << 18;
        /// Not write-through: Globally enables/disables write-through caching.
        const NW = 1 << 29;
        /// Cache disable: Globally enables/disables the memory cache.
        const CD = 1 << 30;
        /// Paging: When set, paging is enabled.
        const PG = 1 << 31;
    }

    /// Control Register 4 (CR4) flags
    pub struct CR4: u64 {
        /// Virtual 8086 Mode Extensions: When set, enables support for the
        /// virtual interrupt flag (VIF) in virtual-8086 mode.
        const VME = 1 << 0;
        /// Protected-mode Virtual Interrupts: When set, enables support for
        /// the virtual interrupt flag (VIF) in protected mode.
        const PVI = 1 << 1;
        /// Time Stamp Disable: When set, RDTSC can only be executed in
        /// ring 0, otherwise at any privilege level.
        const TSD = 1 << 2;
        /// Debugging Extensions: When set, enables debug register based
        /// breaks on I/O space access.
        const DE = 1 << 3;
        /// Page Size Extension: When set, page size is increased to 4 MiB.
        /// Ignored in long mode or when PAE is set.
        const PSE = 1 << 4;
        /// Physical Address Extension. Required for long mode page tables.
        const PAE = 1 << 5;
        /// Machine Check Exception: When set, enables machine check
        /// interrupts to occur.
        const MCE = 1 << 6;
        /// Page Global Enabled: When set, address translations may be shared
        /// between address spaces.
        const PGE = 1 << 7;
        /// Performance-Monitoring Counter enable: When set, RDPMC can be
        /// executed at any privilege level, else ring 0 only.
        const PCE = 1 << 8;
        /// OS support for FXSAVE and FXRSTOR: When set, enables SSE
        /// instructions and fast FPU save & restore.
        const OSFXSR = 1 << 9;
        /// OS support for unmasked SIMD floating-point exceptions.
        const OSXMMEXCPT = 1 << 10;
        /// User-Mode Instruction Prevention: When set, SGDT, SIDT, SLDT,
        /// SMSW and STR cannot be executed if CPL > 0.
        const UMIP = 1 << 11;
        /// 57-Bit Linear Addresses: When set, enables 5-level paging.
        const LA57 = 1 << 12;
        /// Enables RDFSBASE, RDGSBASE, WRFSBASE, and WRGSBASE.
        const FSGSBASE = 1 << 16;
        /// PCID Enable: When set, enables process-context identifiers.
        const PCIDE = 1 << 17;
        /// XSAVE and Processor Extended States Enable
        const OSXSAVE = 1 << 18;
        /// Supervisor Mode Execution Protection Enable: When set, execution
        /// of code in a higher ring generates a fault.
        const SMEP = 1 << 20;
        /// Supervisor Mode Access Prevention Enable: When set, access of
        /// data in a higher ring generates a fault.
        const SMAP = 1 << 21;
        /// Protection Key Enable
        const PKE = 1 << 22;
    }

    /// Extended Feature Enable Register (EFER) flags
    pub struct EFER: u64 {
        /// System Call Extensions
        const SCE = 1 << 0;
        /// Long Mode Enable
        const LME = 1 << 8;
        /// Long Mode Active
        const LMA = 1 << 10;
        /// No-Execute Enable
        const NXE = 1 << 11;
        /// Secure Virtual Machine Enable
        const SVME = 1 << 12;
        /// Fast FXSAVE/FXRSTOR
        const FFXSR = 1 << 14;
        /// Translation Cache Extension
        const TCE = 1 << 15;
    }

    /// IA32_APIC_BASE flags. The 4 KiB aligned xAPIC MMIO base occupies the
    /// high bits.
    pub struct ApicBase: u64 {
        /// Processor is the bootstrap processor.
        const BSP = 1 << 8;
        /// x2APIC mode enable.
        const EXTD = 1 << 10;
        /// APIC global enable.
        const EN = 1 << 11;
    }
}

impl RFLAGS {
    pub fn read() -> Self {
        let rflags: u64;
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(preserves_flags));
            Self::from_bits_unchecked(rflags)
        }
    }
}

impl CR0 {
    pub fn read() -> Self {
        let cr0: u64;
        unsafe {
            asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
            Self::from_bits_unchecked(cr0)
        }
    }

    /// # Safety:
    /// Caller must guarantee that the new system behaviour as a consequence of
    /// setting CR0 will not violate memory safety, or otherwise cause
    /// erroneous behaviour.
    pub unsafe fn write(self) {
        // memory clobber: protection state changes must not be reordered
        // against surrounding accesses
        asm!("mov cr0, {}", in(reg) self.bits, options(nostack, preserves_flags));
    }
}

impl CR4 {
    pub fn read() -> Self {
        let cr4: u64;
        unsafe {
            asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            Self::from_bits_unchecked(cr4)
        }
    }

    /// # Safety:
    /// See [`CR0::write`].
    pub unsafe fn write(self) {
        asm!("mov cr4, {}", in(reg) self.bits, options(nostack, preserves_flags));
    }
}

/// Toggle CR0.WP, controlling whether supervisor writes honour read-only
/// page mappings.
///
/// # Safety:
/// Disabling write protection permits writes through read-only mappings;
/// caller must re-enable it once done.
pub unsafe fn set_write_protect(enable: bool) {
    let cr0 = CR0::read();
    if enable {
        (cr0 | CR0::WP).write();
    } else {
        (cr0 & !CR0::WP).write();
    }
}

/// Control Register 2 (CR2) contains the Page Fault Linear Address (PFLA)
/// when a page fault occurs.
pub fn cr2_read() -> u64 {
    let cr2: u64;
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

/// Read the active PML4 physical address from CR3, masking the low flag bits.
pub fn cr3_read() -> u64 {
    let cr3: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3 & !0xFFF
}

/// Install a new top-level page table. Implicitly flushes all non-global TLB
/// entries.
///
/// # Safety:
/// `pml4_paddr` must be the 4 KiB aligned physical address of a valid PML4
/// whose mappings keep the currently executing code and stack reachable.
pub unsafe fn cr3_write(pml4_paddr: u64) {
    // memory clobber: the compiler must not move loads/stores across the
    // address space switch
    asm!("mov cr3, {}", in(reg) pml4_paddr, options(nostack, preserves_flags));
}

/// Reload CR3, wiping the local non-global TLB entries.
pub fn cr3_reload() {
    unsafe {
        asm!(
            "mov rax, cr3",
            "mov cr3, rax",
            out("rax") _,
            options(nostack, preserves_flags)
        );
    }
}

pub fn rdmsr(msr: u32) -> u64 {
    let (high, low): (u64, u64);
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
    high << 32 | low
}

/// # Safety:
/// Writing model-specific registers can change MMU and feature state; the
/// caller must guarantee the write is sound. Carries a memory clobber for
/// that reason.
pub unsafe fn wrmsr(msr: u32, data: u64) {
    let (high, low): (u64, u64) = (data >> 32, data & 0xFFFF_FFFF);
    asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") low,
        in("edx") high,
        options(nostack, preserves_flags),
    );
}

/// Read the time-stamp counter. Not serialising; may sample out of order
/// with respect to surrounding loads.
#[inline]
pub fn rdtsc() -> u64 {
    let (high, low): (u64, u64);
    unsafe {
        asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
    high << 32 | low
}

/// Read the time-stamp counter behind an `lfence`, ordering the sample after
/// all prior loads. Use for calibration windows.
#[inline]
pub fn rdtsc_ordered() -> u64 {
    let (high, low): (u64, u64);
    unsafe {
        asm!(
            "lfence",
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
    high << 32 | low
}

/// `rdtscp`: the sample is ordered after all prior instructions. Returns
/// `(tsc, ia32_tsc_aux)`.
#[inline]
pub fn rdtscp() -> (u64, u32) {
    let (high, low): (u64, u64);
    let aux: u32;
    unsafe {
        asm!(
            "rdtscp",
            out("eax") low,
            out("edx") high,
            out("ecx") aux,
            options(nomem, nostack, preserves_flags),
        );
    }
    (high << 32 | low, aux)
}

/// Raw `cpuid` with explicit leaf and subleaf.
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let (eax, ecx, edx): (u32, u32, u32);
    let ebx: u64;
    unsafe {
        // rbx is reserved by LLVM; bounce it through another register
        asm!(
            "xchg {tmp}, rbx",
            "cpuid",
            "xchg {tmp}, rbx",
            tmp = inout(reg) 0u64 => ebx,
            inout("eax") leaf => eax,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
            options(nostack, preserves_flags),
        );
    }
    CpuidResult { eax, ebx: ebx as u32, ecx, edx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}
