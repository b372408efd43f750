//! Local APIC (xAPIC and x2APIC), the I/O APIC, and the LAPIC timer.
//!
//! In x2APIC mode every register is a single MSR access and an IPI is one
//! 64-bit write; in xAPIC mode registers are 32-bit MMIO slots addressed
//! through the physmap, and the ICR is two writes with a delivery-status
//! poll. The legacy 8259 PICs are masked outright during init.

use core::sync::atomic::{AtomicU64, Ordering};

use raw_cpuid::CpuId;
use spin::Once;

use amd64::ports::outb;
use amd64::registers::{self, rdmsr, wrmsr, ApicBase};
use amd64::PrivLvl;

use crate::addr::{HhdmBase, PAddr, VAddr};
use crate::intr::{self, Context, SCHED_TICK_VECTOR, SPURIOUS_VECTOR};
use crate::time::hpet::Hpet;
use crate::time::Timer;

// register offsets, MMIO flavour; the x2APIC MSR for offset `o` is
// `0x800 + (o >> 4)`
const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SPURIOUS: u32 = 0x0F0;
const REG_ERROR_STATUS: u32 = 0x280;
const REG_ICR_LO: u32 = 0x300;
const REG_ICR_HI: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INIT_COUNT: u32 = 0x380;
const REG_TIMER_CURRENT_COUNT: u32 = 0x390;
const REG_TIMER_DIVIDE: u32 = 0x3E0;

const X2APIC_SELF_IPI_MSR: u32 = 0x83F;

const SPURIOUS_ENABLE: u32 = 1 << 8;

// ICR fields
const ICR_DELIVERY_FIXED: u64 = 0b000 << 8;
const ICR_DELIVERY_INIT: u64 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u64 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_TRIGGER_LEVEL: u64 = 1 << 15;
const ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;

// LVT timer fields
const LVT_MASKED: u32 = 1 << 16;
const LVT_MODE_ONESHOT: u32 = 0b00 << 17;
const LVT_MODE_TSC_DEADLINE: u32 = 0b10 << 17;

/// Divide-by-16, the factor used for every timer calibration and arm.
const TIMER_DIVIDE_BY_16: u32 = 0b011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApicMode {
    /// MMIO register file mapped through the physmap.
    XApic(VAddr),
    /// MSR register file.
    X2Apic,
}

pub struct Lapic {
    mode: ApicMode,
}

/// The 64-bit ICR image for an IPI: destination in the top word, then
/// delivery mode, level, trigger, and vector.
fn compose_icr(dest_apic_id: u32, delivery: u64, level_trigger: bool, vector: u8) -> u64 {
    let mut icr = (dest_apic_id as u64) << 32 | delivery | ICR_LEVEL_ASSERT | vector as u64;
    if level_trigger {
        icr |= ICR_TRIGGER_LEVEL;
    }
    icr
}

impl Lapic {
    fn read(&self, reg: u32) -> u32 {
        match self.mode {
            ApicMode::XApic(base) => unsafe {
                core::ptr::read_volatile(VAddr(base.0 + reg as u64).as_ptr::<u32>())
            },
            ApicMode::X2Apic => rdmsr(registers::X2APIC_MSR_BASE + (reg >> 4)) as u32,
        }
    }

    fn write(&self, reg: u32, value: u32) {
        match self.mode {
            ApicMode::XApic(base) => unsafe {
                core::ptr::write_volatile(VAddr(base.0 + reg as u64).as_mut_ptr::<u32>(), value)
            },
            ApicMode::X2Apic => unsafe {
                wrmsr(registers::X2APIC_MSR_BASE + (reg >> 4), value as u64)
            },
        }
    }

    pub fn apic_id(&self) -> u32 {
        match self.mode {
            ApicMode::XApic(_) => self.read(REG_ID) >> 24,
            ApicMode::X2Apic => self.read(REG_ID),
        }
    }

    pub fn end_of_interrupt(&self) {
        self.write(REG_EOI, 0);
    }

    /// Software-enable the APIC with the spurious vector installed.
    pub fn enable_spurious(&self) {
        self.write(REG_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32);
    }

    fn write_icr(&self, icr: u64) {
        match self.mode {
            ApicMode::XApic(_) => {
                self.write(REG_ICR_HI, (icr >> 32 << 24) as u32);
                self.write(REG_ICR_LO, icr as u32);
            }
            ApicMode::X2Apic => unsafe {
                // a single MSR write carries destination and command together
                wrmsr(registers::X2APIC_MSR_BASE + (REG_ICR_LO >> 4), icr);
            },
        }
    }

    /// Spin until the previous xAPIC IPI has left the ICR. No-op in x2APIC
    /// mode, which has no delivery-status bit.
    pub fn wait_for_delivery(&self) {
        if let ApicMode::XApic(_) = self.mode {
            while self.read(REG_ICR_LO) & ICR_DELIVERY_STATUS_PENDING != 0 {
                core::hint::spin_loop();
            }
        }
    }

    /// INIT-assert then INIT-deassert, resetting the target AP.
    pub fn send_init_ipi(&self, apic_id: u32) {
        self.write_icr(compose_icr(apic_id, ICR_DELIVERY_INIT, true, 0));
        self.wait_for_delivery();
        self.write_icr(
            (apic_id as u64) << 32 | ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL,
        );
        self.wait_for_delivery();
    }

    /// Startup IPI: the AP begins real-mode execution at `vector << 12`.
    pub fn send_sipi(&self, apic_id: u32, vector: u8) {
        self.write_icr(compose_icr(apic_id, ICR_DELIVERY_STARTUP, false, vector));
        self.wait_for_delivery();
    }

    pub fn send_self_ipi(&self, vector: u8) {
        match self.mode {
            ApicMode::XApic(_) => {
                // destination shorthand 0b01: self
                self.write(REG_ICR_LO, 1 << 18 | ICR_DELIVERY_FIXED as u32 | vector as u32);
            }
            ApicMode::X2Apic => unsafe { wrmsr(X2APIC_SELF_IPI_MSR, vector as u64) },
        }
    }

    fn clear_errors(&self) {
        self.write(REG_ERROR_STATUS, 0);
    }
}

static LAPIC: Once<Lapic> = Once::new();
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Bring up the local APIC: prefer x2APIC when CPUID offers it, otherwise
/// fall back to the MMIO interface at the MADT-provided base. Masks the
/// legacy PICs first.
pub fn init(lapic_mmio_base: PAddr) -> &'static Lapic {
    assert!(LAPIC.get().is_none(), "LAPIC initialised twice");

    // the 8259s must never deliver once the APIC owns the vectors
    unsafe {
        outb(0x21, 0xFF);
        outb(0xA1, 0xFF);
    }

    let has_x2apic = CpuId::new().get_feature_info().map_or(false, |f| f.has_x2apic());
    let mode = if has_x2apic {
        unsafe {
            let base = rdmsr(registers::APIC_BASE_MSR);
            wrmsr(
                registers::APIC_BASE_MSR,
                base | ApicBase::EN.bits() | ApicBase::EXTD.bits(),
            );
        }
        ApicMode::X2Apic
    } else {
        ApicMode::XApic(lapic_mmio_base.to_vaddr(HhdmBase::Physmap))
    };

    let lapic = LAPIC.call_once(|| Lapic { mode });
    lapic.clear_errors();
    lapic.enable_spurious();
    intr::register_software(SPURIOUS_VECTOR, PrivLvl::Ring0, spurious_handler);

    log::info!("lapic: {:?}, id {}", mode, lapic.apic_id());
    lapic
}

/// # Panics
/// Panics when used before [`init`].
pub fn lapic() -> &'static Lapic {
    LAPIC.get().expect("LAPIC used before initialisation")
}

pub fn ready() -> bool {
    LAPIC.get().is_some()
}

pub fn end_of_interrupt() {
    lapic().end_of_interrupt();
}

/// Spurious interrupts are counted and otherwise ignored; no EOI is due.
fn spurious_handler(_ctx: &mut Context) {
    SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

/// Map a legacy IRQ line to its vector.
pub const fn irq_vector(line: u8) -> u8 {
    assert!(line < 16);
    intr::IRQ_BASE_VECTOR + line
}

// LAPIC timer

/// The LAPIC timer in one-shot counted mode; the arming fallback when
/// TSC-deadline is unavailable.
pub struct LapicTimer {
    ticks_per_second: u64,
}

impl LapicTimer {
    /// Measure the timer tick rate against the HPET: divide-by-16, three
    /// 10 ms windows of counting down from the maximum, averaged.
    pub fn calibrate(hpet: &Hpet) -> LapicTimer {
        const WINDOW_NS: u64 = 10_000_000;
        const SAMPLES: u64 = 3;

        let lapic = lapic();
        lapic.write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        // count while masked; calibration must not deliver ticks
        lapic.write(REG_LVT_TIMER, LVT_MASKED | LVT_MODE_ONESHOT | SCHED_TICK_VECTOR as u32);

        let mut acc: u128 = 0;
        for _ in 0..SAMPLES {
            lapic.write(REG_TIMER_INIT_COUNT, u32::MAX);
            hpet.busy_wait_ns(WINDOW_NS);
            let remaining = lapic.read(REG_TIMER_CURRENT_COUNT);
            lapic.write(REG_TIMER_INIT_COUNT, 0);

            let elapsed = (u32::MAX - remaining) as u128;
            acc += elapsed * 1_000_000_000 / WINDOW_NS as u128;
        }

        let ticks_per_second = (acc / SAMPLES as u128) as u64;
        log::info!("lapic timer: {} ticks/s at divide 16", ticks_per_second);
        LapicTimer { ticks_per_second }
    }

    #[inline]
    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}

impl Timer for LapicTimer {
    /// The one-shot timer is not a clock.
    fn now_ns(&self) -> u64 {
        panic!("the LAPIC one-shot timer cannot be read as a clock")
    }

    fn arm_interrupt_timer(&self, ns: u64) {
        let lapic = lapic();
        let ticks =
            (self.ticks_per_second as u128 * ns as u128 / 1_000_000_000).max(1) as u32;
        lapic.write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        lapic.write(REG_LVT_TIMER, LVT_MODE_ONESHOT | SCHED_TICK_VECTOR as u32);
        lapic.write(REG_TIMER_INIT_COUNT, ticks);
    }
}

/// Switch the LVT timer entry to TSC-deadline mode delivering the scheduler
/// tick; required before [`crate::time::tsc::Tsc`] may arm deadlines.
pub fn enable_tsc_deadline_mode() {
    lapic().write(REG_LVT_TIMER, LVT_MODE_TSC_DEADLINE | SCHED_TICK_VECTOR as u32);
}

// I/O APIC

const IOAPIC_REG_SELECT: u64 = 0x00;
const IOAPIC_REG_WINDOW: u64 = 0x10;
const IOAPIC_REDIR_TABLE_BASE: u32 = 0x10;

/// An I/O APIC register window, addressed through the physmap.
pub struct IoApic {
    mmio_base: VAddr,
    pub gsi_base: u32,
}

impl IoApic {
    /// # Safety:
    /// `mmio_paddr` must be the I/O APIC register block reported by the MADT
    /// and covered by the physmap.
    pub unsafe fn new(mmio_paddr: PAddr, gsi_base: u32) -> IoApic {
        IoApic { mmio_base: mmio_paddr.to_vaddr(HhdmBase::Physmap), gsi_base }
    }

    fn write(&self, reg: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile(
                VAddr(self.mmio_base.0 + IOAPIC_REG_SELECT).as_mut_ptr::<u32>(),
                reg,
            );
            core::ptr::write_volatile(
                VAddr(self.mmio_base.0 + IOAPIC_REG_WINDOW).as_mut_ptr::<u32>(),
                value,
            );
        }
    }

    /// Route a global system interrupt to `vector` on the core with
    /// `dest_apic_id`, edge triggered, fixed delivery, unmasked.
    pub fn route(&self, gsi: u32, vector: u8, dest_apic_id: u32) {
        let index = gsi - self.gsi_base;
        self.write(IOAPIC_REDIR_TABLE_BASE + index * 2 + 1, dest_apic_id << 24);
        self.write(IOAPIC_REDIR_TABLE_BASE + index * 2, vector as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icr_composition_packs_destination_and_command() {
        // dest << 32 | delivery mode | level | trigger | vector
        let icr = compose_icr(3, ICR_DELIVERY_INIT, true, 0);
        assert_eq!(icr >> 32, 3);
        assert_eq!(icr & 0x700, ICR_DELIVERY_INIT);
        assert_ne!(icr & ICR_LEVEL_ASSERT, 0);
        assert_ne!(icr & ICR_TRIGGER_LEVEL, 0);
        assert_eq!(icr & 0xFF, 0);

        let sipi = compose_icr(7, ICR_DELIVERY_STARTUP, false, 0x08);
        assert_eq!(sipi >> 32, 7);
        assert_eq!(sipi & 0x700, ICR_DELIVERY_STARTUP);
        assert_eq!(sipi & ICR_TRIGGER_LEVEL, 0);
        assert_eq!(sipi & 0xFF, 0x08);
    }

    #[test]
    fn irq_lines_map_to_the_legacy_window() {
        assert_eq!(irq_vector(0), 32);
        assert_eq!(irq_vector(15), 47);
    }
}
