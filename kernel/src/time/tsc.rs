//! Time-stamp counter calibration against the HPET.
//!
//! The TSC is only adopted as the scheduler clock when CPUID reports both
//! TSC-deadline arming and an invariant (constant-rate) counter; otherwise
//! the scheduler falls back to HPET reads and LAPIC one-shot arming.

use amd64::registers::{self, rdtsc_ordered, rdtscp};
use raw_cpuid::CpuId;

use super::hpet::Hpet;
use super::Timer;

/// Length of one calibration window.
const CAL_WINDOW_NS: u64 = 10_000_000;
/// Windows measured and averaged.
const CAL_SAMPLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TscError {
    /// CPUID does not report `IA32_TSC_DEADLINE` support.
    NoTscDeadline,
    /// The counter's rate varies with P-states; useless as a clock.
    NotInvariant,
}

pub struct Tsc {
    freq_hz: u64,
}

impl Tsc {
    /// Verify the CPUID prerequisites and measure the counter frequency
    /// against the HPET.
    pub fn init(hpet: &Hpet) -> Result<Tsc, TscError> {
        let cpuid = CpuId::new();
        if !cpuid.get_feature_info().map_or(false, |f| f.has_tsc_deadline()) {
            return Err(TscError::NoTscDeadline);
        }
        if !cpuid.get_advanced_power_mgmt_info().map_or(false, |apm| apm.has_invariant_tsc()) {
            return Err(TscError::NotInvariant);
        }

        let freq_hz = calibrate_hz(rdtsc_ordered, || hpet.now_ns());
        log::info!("tsc: calibrated to {} Hz", freq_hz);
        Ok(Tsc { freq_hz })
    }

    #[inline]
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }
}

impl Timer for Tsc {
    fn now_ns(&self) -> u64 {
        (rdtsc_ordered() as u128 * 1_000_000_000 / self.freq_hz as u128) as u64
    }

    /// Write an absolute deadline of `now + ns` into `IA32_TSC_DEADLINE`;
    /// the LAPIC timer must be in TSC-deadline mode.
    fn arm_interrupt_timer(&self, ns: u64) {
        let (now, _) = rdtscp();
        let ticks =
            ((self.freq_hz as u128 * ns as u128 + 999_999_999) / 1_000_000_000) as u64;
        unsafe {
            registers::wrmsr(registers::TSC_DEADLINE_MSR, now + ticks);
        }
    }
}

/// Measure the rate of `counter` in ticks per second using `now_ns` as the
/// reference clock: [`CAL_SAMPLES`] windows of [`CAL_WINDOW_NS`] each,
/// averaged.
pub fn calibrate_hz(mut counter: impl FnMut() -> u64, mut now_ns: impl FnMut() -> u64) -> u64 {
    let mut acc: u128 = 0;

    for _ in 0..CAL_SAMPLES {
        let t0 = now_ns();
        let c0 = counter();

        let mut t1 = now_ns();
        while t1.wrapping_sub(t0) < CAL_WINDOW_NS {
            core::hint::spin_loop();
            t1 = now_ns();
        }
        let c1 = counter();

        // scale by the actually elapsed window, not the nominal one
        acc += (c1 - c0) as u128 * 1_000_000_000 / (t1 - t0) as u128;
    }

    (acc / CAL_SAMPLES as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn calibration_tracks_a_mocked_source_within_half_a_percent() {
        // mock HPET at 10 MHz granularity, mock TSC advancing at 2.5 GHz
        let time_ns = Cell::new(0u64);
        let now = || {
            time_ns.set(time_ns.get() + 100);
            time_ns.get()
        };
        let counter = || time_ns.get() * 5 / 2;

        let freq = calibrate_hz(counter, now);
        let target = 2_500_000_000u64;
        let tolerance = target / 200; // 0.5 %
        assert!(
            freq.abs_diff(target) <= tolerance,
            "calibrated {} Hz, expected within {} of {}",
            freq,
            tolerance,
            target
        );
    }

    #[test]
    fn calibration_is_stable_across_jittery_windows() {
        // reference clock advances unevenly, counter stays locked to it
        let time_ns = Cell::new(0u64);
        let step = Cell::new(37u64);
        let now = || {
            step.set(step.get().rotate_left(1) | 1);
            time_ns.set(time_ns.get() + (step.get() % 300));
            time_ns.get()
        };
        let counter = || time_ns.get() * 3;

        let freq = calibrate_hz(counter, now);
        let target = 3_000_000_000u64;
        assert!(freq.abs_diff(target) <= target / 200);
    }
}
