/*
 * System Timer
 *
 * Programs the 8254 interval timer to interrupt TIMER_FREQ times per
 * second and turns those interrupts into the kernel tick: the counter the
 * whole system keeps time by, the sleep calls built on it, and the
 * preemption signal for the scheduler.
 *
 * The interrupt entry stub lives here too. The embedder installs
 * `timer_interrupt_entry` at vector TIMER_VECTOR in its descriptor table;
 * everything after that vector fires is this module's business.
 */

use core::arch::naked_asm;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;
use static_assertions::const_assert;
use x86_64::instructions::port::Port;

use crate::arch::x86_64::context::SavedContext;
use crate::arch::x86_64::interrupts;
use crate::scheduler;
use crate::scheduler::Tick;

/// Timer interrupts per second. The 8254 divisor must fit sixteen bits and
/// stay fine enough to be useful.
pub const TIMER_FREQ: u32 = 100;
const_assert!(TIMER_FREQ >= 19);
const_assert!(TIMER_FREQ <= 1000);

/// Input clock of the 8254, in Hz.
const PIT_HZ: u32 = 1_193_180;

/// Vector the remapped IRQ0 arrives at.
pub const TIMER_VECTOR: u8 = 0x20;

const PIC_1_OFFSET: u8 = 0x20;
const PIC_2_OFFSET: u8 = 0x28;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Ticks since the timer was initialized.
static TICKS: AtomicI64 = AtomicI64::new(0);

/// Busy-wait iterations that fit in one tick, measured by `calibrate`.
static LOOPS_PER_TICK: AtomicU64 = AtomicU64::new(1 << 10);

fn pit_divisor(freq: u32) -> u16 {
    ((PIT_HZ + freq / 2) / freq) as u16
}

/// Program the interval timer and unmask its interrupt line. The vector
/// must already be installed; interrupts stay disabled until the scheduler
/// starts.
pub fn init() {
    let divisor = pit_divisor(TIMER_FREQ);
    unsafe {
        let mut command = Port::<u8>::new(0x43);
        let mut channel0 = Port::<u8>::new(0x40);

        // Channel 0, access mode lo/hi, mode 2 (rate generator), binary.
        command.write(0x34);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    let mut pics = PICS.lock();
    unsafe {
        pics.initialize();
        // Only the timer line; everything else stays masked.
        pics.write_masks(0xFE, 0xFF);
    }

    log::info!("timer: {} Hz, PIT divisor {}", TIMER_FREQ, divisor);
}

/// Ticks since boot.
pub fn ticks() -> Tick {
    TICKS.load(Ordering::Relaxed)
}

/// Ticks elapsed since `then`, a value previously returned by [`ticks`].
pub fn elapsed(then: Tick) -> Tick {
    ticks() - then
}

/// Suspend the calling thread for approximately `t` ticks. Returns at the
/// first tick at or past the deadline; non-positive durations return
/// immediately.
pub fn sleep(t: Tick) {
    assert!(interrupts::are_enabled(), "sleep with interrupts disabled");
    if t <= 0 {
        return;
    }
    let start = ticks();
    scheduler::sleep_until(start + t);
}

/// Suspend the calling thread for approximately `ms` milliseconds.
pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1000);
}

/// Suspend the calling thread for approximately `us` microseconds.
pub fn usleep(us: i64) {
    real_time_sleep(us, 1_000_000);
}

/// Suspend the calling thread for approximately `ns` nanoseconds.
pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1_000_000_000);
}

/// How many ticks `num / denom` seconds round down to.
fn duration_ticks(num: i64, denom: i64) -> Tick {
    num * TIMER_FREQ as i64 / denom
}

/// Sleep for `num / denom` seconds: as whole ticks through the scheduler
/// when the duration is that long, as a calibrated busy-wait below tick
/// granularity.
fn real_time_sleep(num: i64, denom: i64) {
    assert!(interrupts::are_enabled(), "sleep with interrupts disabled");
    let t = duration_ticks(num, denom);
    if t > 0 {
        sleep(t);
    } else {
        real_time_delay(num, denom);
    }
}

fn real_time_delay(num: i64, denom: i64) {
    // Scale down by 1000 so the multiplication cannot overflow.
    assert!(denom % 1000 == 0);
    let loops = LOOPS_PER_TICK.load(Ordering::Relaxed) as i64;
    busy_wait(loops * num / 1000 * TIMER_FREQ as i64 / (denom / 1000));
}

/// Spin for `loops` iterations. Marked never-inline so the loop costs the
/// same from every call site, which is what the calibration measured.
#[inline(never)]
fn busy_wait(loops: i64) {
    let mut n = loops;
    while n > 0 {
        core::hint::spin_loop();
        n -= 1;
    }
}

/// Whether `loops` iterations of the busy wait span more than one tick.
fn too_many_loops(loops: u64) -> bool {
    let start = ticks();
    while ticks() == start {
        core::hint::spin_loop();
    }

    let start = ticks();
    busy_wait(loops as i64);
    start != ticks()
}

/// Measure how many busy-wait iterations fit in one tick, for the
/// sub-tick delays. Needs the timer interrupting, so call it after
/// [`init`] with interrupts enabled.
pub fn calibrate() {
    assert!(interrupts::are_enabled(), "calibration needs a running timer");

    // Coarse pass: the largest power of two that still fits in a tick.
    let mut loops_per_tick: u64 = 1 << 10;
    while !too_many_loops(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0);
    }

    // Refine the bits just below the leading one, each tested on its own
    // against the power-of-two estimate.
    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !too_many_loops(high_bit | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }

    LOOPS_PER_TICK.store(loops_per_tick, Ordering::Relaxed);
    log::info!(
        "timer: calibrated {} loops/s",
        loops_per_tick * TIMER_FREQ as u64
    );
}

/// IRQ0 entry. Stores the interrupted register file in saved-context
/// layout on the interrupted stack, hands its address to the dispatcher
/// and restores on the way out.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_interrupt_entry() -> ! {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym timer_tick_dispatch,
    )
}

/// One timer interrupt: advance the clock, run the scheduler's tick
/// bookkeeping, acknowledge the controller, and yield on the way out if
/// the running thread's slice expired.
extern "C" fn timer_tick_dispatch(frame: *mut SavedContext) {
    interrupts::enter_interrupt_context();

    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    // Privilege level of the interrupted code selects the statistics
    // bucket.
    let user_frame = unsafe { ((*frame).frame.cs & 3) == 3 };
    let should_yield = scheduler::tick(now, user_frame);

    unsafe {
        PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
    }
    interrupts::leave_interrupt_context();

    // The yield happens after the handler proper so the switch never runs
    // in interrupt context; the interrupt return completes when this
    // thread is next scheduled.
    if should_yield {
        scheduler::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_rounds_to_nearest() {
        assert_eq!(pit_divisor(100), 11932);
        assert_eq!(pit_divisor(1000), 1193);
        assert_eq!(pit_divisor(19), 62799);
    }

    #[test]
    fn divisor_fits_sixteen_bits_across_the_legal_range() {
        for freq in [19u32, 50, 100, 250, 1000] {
            let d = pit_divisor(freq);
            assert!(d > 0);
        }
    }

    #[test]
    fn duration_conversion_truncates_toward_zero() {
        // 10 ms at 100 Hz is exactly one tick.
        assert_eq!(duration_ticks(10, 1000), 1);
        // Shorter than a tick truncates to zero and takes the delay path.
        assert_eq!(duration_ticks(9, 1000), 0);
        assert_eq!(duration_ticks(100, 1_000_000), 0);
        assert_eq!(duration_ticks(1, 1), TIMER_FREQ as i64);
    }

    #[test]
    fn busy_wait_tolerates_nonpositive_counts() {
        busy_wait(0);
        busy_wait(-5);
    }
}
