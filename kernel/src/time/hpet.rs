//! High Precision Event Timer: a free-running main counter with a known
//! period, discovered through ACPI and addressed through the physmap.
//!
//! The HPET is the calibration reference for both the TSC and the LAPIC
//! timer, and the wall clock for SMP bring-up timeouts.

use spin::Once;

use crate::addr::VAddr;
use crate::time::Timer;

// register block offsets
const REG_GENERAL_CAPS: u64 = 0x000;
const REG_GENERAL_CONFIG: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;
const TIMER_BLOCK_BASE: u64 = 0x100;
const TIMER_BLOCK_STRIDE: u64 = 0x20;

const CONFIG_ENABLE: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpetError {
    /// The capabilities register reports a zero or absurd tick period.
    InvalidPeriod,
}

/// An HPET register block.
pub struct Hpet {
    mmio_base: VAddr,
    period_fs: u64,
    freq_hz: u64,
    num_timers: u8,
}

impl Hpet {
    /// Read the capability register and derive the counter frequency.
    ///
    /// # Safety:
    /// `mmio_base` must map the HPET register block, readable and writable,
    /// for the lifetime of the value.
    pub unsafe fn new(mmio_base: VAddr) -> Result<Hpet, HpetError> {
        let caps = read_reg(mmio_base, REG_GENERAL_CAPS);

        // tick period in femtoseconds, capability bits 63:32
        let period_fs = caps >> 32;
        if period_fs == 0 || period_fs > 100_000_000 {
            return Err(HpetError::InvalidPeriod);
        }

        Ok(Hpet {
            mmio_base,
            period_fs,
            freq_hz: 1_000_000_000_000_000 / period_fs,
            num_timers: ((caps >> 8) & 0x1F) as u8 + 1,
        })
    }

    #[inline]
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }

    #[inline]
    pub fn period_fs(&self) -> u64 {
        self.period_fs
    }

    #[inline]
    pub fn num_timers(&self) -> u8 {
        self.num_timers
    }

    /// Start the main counter. Idempotent: enabling an enabled HPET changes
    /// nothing.
    pub fn enable(&self) {
        unsafe {
            let config = read_reg(self.mmio_base, REG_GENERAL_CONFIG);
            if config & CONFIG_ENABLE == 0 {
                write_reg(self.mmio_base, REG_GENERAL_CONFIG, config | CONFIG_ENABLE);
            }
        }
    }

    #[inline]
    pub fn counter(&self) -> u64 {
        unsafe { read_reg(self.mmio_base, REG_MAIN_COUNTER) }
    }

    /// Configuration/capability register of timer sub-block `n`.
    pub fn timer_config(&self, n: u8) -> u64 {
        assert!(n < self.num_timers, "HPET timer {} out of range", n);
        unsafe { read_reg(self.mmio_base, TIMER_BLOCK_BASE + TIMER_BLOCK_STRIDE * n as u64) }
    }

    /// Spin until `ns` nanoseconds have elapsed on the main counter.
    pub fn busy_wait_ns(&self, ns: u64) {
        let start = self.now_ns();
        while self.now_ns().wrapping_sub(start) < ns {
            core::hint::spin_loop();
        }
    }

    fn counter_to_ns(&self, ticks: u64) -> u64 {
        (ticks as u128 * self.period_fs as u128 / 1_000_000) as u64
    }
}

impl crate::time::Timer for Hpet {
    fn now_ns(&self) -> u64 {
        self.counter_to_ns(self.counter())
    }
}

// field accessors are free functions so `new` can probe before constructing

#[inline]
unsafe fn read_reg(base: VAddr, offset: u64) -> u64 {
    core::ptr::read_volatile(VAddr(base.0 + offset).as_ptr::<u64>())
}

#[inline]
unsafe fn write_reg(base: VAddr, offset: u64, value: u64) {
    core::ptr::write_volatile(VAddr(base.0 + offset).as_mut_ptr::<u64>(), value)
}

static HPET: Once<Hpet> = Once::new();

/// # Panics
/// Panics if called twice; init order is a boot invariant.
pub fn init(hpet: Hpet) {
    assert!(HPET.get().is_none(), "HPET initialised twice");
    log::info!(
        "hpet: {} Hz, {} fs period, {} timers",
        hpet.freq_hz(),
        hpet.period_fs(),
        hpet.num_timers()
    );
    hpet.enable();
    HPET.call_once(|| hpet);
}

pub fn ready() -> bool {
    HPET.get().is_some()
}

/// # Panics
/// Panics when used before [`init`].
pub fn hpet() -> &'static Hpet {
    HPET.get().expect("HPET used before initialisation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timer;

    /// A fake register block in host memory: period 100 ns (10 MHz).
    fn fake_hpet_block() -> Vec<u64> {
        let mut regs = vec![0u64; 0x80];
        regs[0] = 100_000_000u64 << 32 | 2 << 8; // period fs; 3 timers
        regs
    }

    #[test]
    fn derives_frequency_from_the_period() {
        let regs = fake_hpet_block();
        let hpet = unsafe { Hpet::new(VAddr(regs.as_ptr() as u64)) }.unwrap();
        assert_eq!(hpet.freq_hz(), 10_000_000);
        assert_eq!(hpet.num_timers(), 3);
    }

    #[test]
    fn enable_is_idempotent() {
        let mut regs = fake_hpet_block();
        let hpet = unsafe { Hpet::new(VAddr(regs.as_mut_ptr() as u64)) }.unwrap();

        hpet.enable();
        let config_after_first = regs[(REG_GENERAL_CONFIG / 8) as usize];
        assert_eq!(config_after_first & CONFIG_ENABLE, CONFIG_ENABLE);

        hpet.enable();
        assert_eq!(regs[(REG_GENERAL_CONFIG / 8) as usize], config_after_first);
    }

    #[test]
    fn counter_converts_to_ns() {
        let mut regs = fake_hpet_block();
        regs[(REG_MAIN_COUNTER / 8) as usize] = 12_345; // ticks of 100 ns
        let hpet = unsafe { Hpet::new(VAddr(regs.as_ptr() as u64)) }.unwrap();
        assert_eq!(hpet.now_ns(), 1_234_500);
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut regs = fake_hpet_block();
        regs[0] = 0;
        assert_eq!(
            unsafe { Hpet::new(VAddr(regs.as_ptr() as u64)) }.err(),
            Some(HpetError::InvalidPeriod)
        );
    }
}
