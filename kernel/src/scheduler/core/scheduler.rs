//! Context-switch entry points and the sleep/wake protocol
//!
//! The handoff between threads happens in two phases. The outgoing thread
//! (`yield_cpu`) picks its successor, publishes the transient
//! `next`/`prev` links, drops the scheduler lock, and swaps. The incoming
//! thread (`gain`) retakes the lock and finishes the bookkeeping for
//! whoever it displaced: requeue it, leave it parked, or reap it. Only this
//! split makes it safe to free an exited thread's stack — by the time its
//! successor runs `gain`, nothing is executing on it.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::arch::{context, interrupts, timer};
use crate::arch::timer::TimeUs;
use crate::libutils::sync::KMutex;
use crate::scheduler::cpu;
use crate::scheduler::thread::state::{ContextPhase, SchedCause, ThreadKind, ThreadState};
use crate::scheduler::thread::tcb::{self, Tcb};
use crate::scheduler::QUANTUM_US;

use super::runqueue::SchedQueues;

/// The scheduler lock. Ready queues, the timeout list, and every TCB
/// scheduling field are touched only while this is held. It is released
/// before every context swap and reacquired by the incoming side's `gain`.
static SCHED: Mutex<SchedQueues> = Mutex::new(SchedQueues::new());

/// ALARM vector handler: the quantum expired under the current thread.
pub(crate) fn alarm_handler() {
    yield_cpu(SchedCause::Quantum);
}

/// ICI vector handler. Receiving the interrupt is the point: it gets a
/// halted core out of `hlt` so it re-enters selection.
pub(crate) fn ici_handler() {}

/// Give up the CPU. The feedback policy adjusts the current thread's
/// priority according to `cause`, a successor is chosen, and control
/// returns here only when this thread is dispatched again — possibly on a
/// different core.
pub fn yield_cpu(cause: SchedCause) {
    timer::cancel_alarm();
    let preempt = interrupts::preempt_off();

    let current = cpu::current_thread();
    let cur = current.as_ptr();

    let mut sched = SCHED.lock();
    let next = unsafe {
        (*cur).adjust_priority(cause);
        let current_eligible = (*cur).normalize_for_yield();

        sched
            .select(timer::now_us())
            .or(if current_eligible { Some(current) } else { None })
            .unwrap_or_else(|| cpu::current_ccb().idle_tcb())
    };

    unsafe {
        (*cur).next = next.as_ptr();
        (*next.as_ptr()).prev = cur;
    }

    // The lock must open before the swap so the incoming thread's gain()
    // can take it.
    drop(sched);

    if next != current {
        cpu::set_current_thread(next);
        unsafe { context::switch(&mut (*cur).context, &(*next.as_ptr()).context) };
    }

    gain(preempt);
}

/// Start a timeslice on the incoming thread. Completes the two-phase
/// handoff for the displaced thread, then arms the quantum alarm —
/// `QUANTUM_US / (priority + 1)`, so high-priority threads come back to the
/// policy sooner.
pub(crate) fn gain(preempt: bool) {
    let current = cpu::current_thread();
    let cur = current.as_ptr();

    let mut reap: Option<NonNull<Tcb>> = None;
    {
        let mut sched = SCHED.lock();
        unsafe {
            let prev = (*cur).prev;
            (*cur).state = ThreadState::Running;
            (*cur).phase = ContextPhase::Dirty;

            if prev != cur {
                (*prev).phase = ContextPhase::Clean;
                match (*prev).state {
                    ThreadState::Ready => {
                        if (*prev).kind != ThreadKind::Idle {
                            sched.queue_add(NonNull::new_unchecked(prev));
                        }
                    }
                    ThreadState::Exited => {
                        if let Some(ptcb) = (*prev).owner_ptcb {
                            ptcb.as_ref().thread_exited.store(true, Ordering::Release);
                        }
                        (*(*prev).owner_pcb)
                            .thread_count
                            .fetch_sub(1, Ordering::AcqRel);
                        reap = Some(NonNull::new_unchecked(prev));
                    }
                    ThreadState::Stopped => {}
                    other => panic!("displaced thread in state {}", other),
                }
            }
        }
    }

    // The exited thread's stack is quiescent and the scheduler lock is
    // open again; the active-thread lock inside release_tcb is never
    // nested under it.
    if let Some(exited) = reap {
        unsafe { tcb::release_tcb(exited) };
    }

    if preempt {
        interrupts::preempt_on();
    }

    let priority = unsafe { (*cur).priority };
    timer::arm_alarm_us(QUANTUM_US / (priority as TimeUs + 1));
}

/// Make a parked thread runnable. Returns whether anything happened; a
/// wakeup racing a timeout or another wakeup simply finds the thread
/// already awake and reports `false`.
pub fn wakeup(tcb: NonNull<Tcb>) -> bool {
    let preempt = interrupts::preempt_off();

    let awakened = {
        let mut sched = SCHED.lock();
        unsafe { sched.wake(tcb) }
    };

    if preempt {
        interrupts::preempt_on();
    }
    awakened
}

/// Atomically park the current thread and release `mx`.
///
/// The mutex opens only after the thread is marked unschedulable, all
/// under the scheduler lock — so a waker that acquires `mx` afterwards is
/// guaranteed to observe the parked state, and no wakeup can be lost.
/// Exited threads never return from this call.
pub fn sleep_releasing(
    state: ThreadState,
    mx: Option<&KMutex>,
    cause: SchedCause,
    timeout: TimeUs,
) {
    assert!(
        matches!(state, ThreadState::Stopped | ThreadState::Exited),
        "sleep target must be Stopped or Exited, not {}",
        state
    );

    let preempt = interrupts::preempt_off();
    let current = cpu::current_thread();

    {
        let mut sched = SCHED.lock();
        unsafe {
            (*current.as_ptr()).state = state;
            if state != ThreadState::Exited {
                sched.register_timeout(current, timeout, timer::now_us());
            }
        }
        if let Some(m) = mx {
            m.unlock();
        }
    }

    yield_cpu(cause);

    if preempt {
        interrupts::preempt_on();
    }
}
