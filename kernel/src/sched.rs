//! Scheduler hooks.
//!
//! The core does not schedule; it exposes the thread record the dispatcher
//! can unwind into ([`crate::intr::switch_to`]), frame preparation for fresh
//! threads, and the scheduler-tick vector. Policy lives with whoever
//! registers the tick handler.

use core::sync::atomic::{AtomicPtr, Ordering};

use amd64::PrivLvl;
use spin::Once;

use crate::addr::{PAddr, VAddr};
use crate::intr::{self, Context, SCHED_TICK_VECTOR};

/// Execution state the context switch needs; everything else about a thread
/// belongs to the scheduler.
#[derive(Debug)]
pub struct Thread {
    /// Top of the thread's kernel stack; becomes `tss.rsp0` for user
    /// threads.
    pub kstack_top: VAddr,
    /// Stack pointer left by the common prologue (or by
    /// [`crate::intr::prepare_interrupt_frame`] for a fresh thread).
    pub saved_rsp: VAddr,
    /// Physical PML4 root of the thread's address space.
    pub cr3: PAddr,
    /// Whether the thread runs in ring 3.
    pub user: bool,
}

/// The thread currently executing on this core, if the scheduler has
/// installed one. Set by the scheduler around [`crate::intr::switch_to`].
static RUNNING_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_running_thread(thread: *mut Thread) {
    RUNNING_THREAD.store(thread, Ordering::Release);
}

pub fn running_thread() -> *mut Thread {
    RUNNING_THREAD.load(Ordering::Acquire)
}

/// What the tick handler receives: where the interrupt landed and the
/// interrupted context, ready for [`crate::intr::switch_to`] bookkeeping.
pub struct TickContext {
    pub privilege: PrivLvl,
    pub thread_ctx: *mut Context,
}

static TICK_HANDLER: Once<fn(TickContext)> = Once::new();

/// Register the scheduler's tick entry and open the tick vector. One-shot.
pub fn set_tick_handler(handler: fn(TickContext)) {
    assert!(TICK_HANDLER.get().is_none(), "scheduler tick handler registered twice");
    TICK_HANDLER.call_once(|| handler);
    intr::register_external(SCHED_TICK_VECTOR, tick_entry);
}

fn tick_entry(ctx: &mut Context) {
    if let Some(handler) = TICK_HANDLER.get() {
        handler(TickContext { privilege: ctx.privilege(), thread_ctx: ctx });
    }
}
