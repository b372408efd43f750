//! The timer stack: HPET for discovery-time and calibration clocks, TSC as
//! the preferred scheduler clock, LAPIC one-shot as the arming fallback.

pub mod hpet;
pub mod tsc;

use spin::Once;

/// Timer capability: a monotonic nanosecond clock, optionally able to fire
/// the scheduler-tick interrupt at a relative deadline.
///
/// Implementations: [`hpet::Hpet`] (clock only), [`tsc::Tsc`] (both, via
/// TSC-deadline), and [`crate::apic::LapicTimer`] (arming only).
pub trait Timer: Sync {
    fn now_ns(&self) -> u64;

    /// Arm the scheduler-tick interrupt `ns` from now.
    ///
    /// # Panics
    /// Implementations without an interrupt source panic; the selection in
    /// [`init_sched_timer`] never routes arming to one.
    fn arm_interrupt_timer(&self, ns: u64) {
        let _ = ns;
        panic!("this timer cannot arm interrupts");
    }
}

static SCHED_CLOCK: Once<&'static (dyn Timer + Sync)> = Once::new();
static SCHED_ARM: Once<&'static (dyn Timer + Sync)> = Once::new();

/// Record the scheduler's clock and arming capabilities. The preferred
/// configuration is the TSC for both; without an invariant deadline-capable
/// TSC the clock falls back to the HPET and arming to the LAPIC one-shot
/// timer.
pub fn init_sched_timer(clock: &'static (dyn Timer + Sync), arm: &'static (dyn Timer + Sync)) {
    assert!(SCHED_CLOCK.get().is_none(), "scheduler timer initialised twice");
    SCHED_CLOCK.call_once(|| clock);
    SCHED_ARM.call_once(|| arm);
}

/// # Panics
/// Panics before [`init_sched_timer`].
pub fn now_ns() -> u64 {
    SCHED_CLOCK.get().expect("scheduler clock used before initialisation").now_ns()
}

/// # Panics
/// Panics before [`init_sched_timer`].
pub fn arm_interrupt_timer(ns: u64) {
    SCHED_ARM.get().expect("scheduler timer used before initialisation").arm_interrupt_timer(ns)
}
