//! Thread control blocks
//!
//! A thread's TCB and its stack share one page-aligned allocation:
//!
//! ```text
//! +--------------+  <- page-aligned block start
//! |  TCB header  |
//! +--------------+  <- header rounded up to a page
//! |    stack     |
//! |      ^       |
//! +--------------+  <- initial stack pointer
//! ```
//!
//! A stack overrun therefore tramples the overrunning thread's own pages
//! before anything else. The block is freed by the *successor* thread's
//! `gain`, once the exited thread has been switched off its stack.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::mem;
use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::context::{self, CpuContext};
use crate::arch::timer::{TimeUs, NO_TIMEOUT};
use crate::libutils::list::ListNode;
use crate::process::{Pcb, Ptcb};
use crate::scheduler::{LOWEST_PRIORITY, TOP_PRIORITY};

use super::state::{ContextPhase, SchedCause, ThreadKind, ThreadState};

/// System page size.
pub const PAGE_SIZE: usize = 4096;

/// Fixed stack size for every normal thread.
pub const THREAD_STACK_SIZE: usize = 64 * 1024;

/// Header space, rounded up to whole pages so the stack starts page-aligned.
const TCB_RESERVED: usize = (mem::size_of::<Tcb>() + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;

/// Total size of the composite allocation.
const THREAD_BLOCK_SIZE: usize = TCB_RESERVED + THREAD_STACK_SIZE;

/// Count of live normal threads. Idle threads never count. Guarded by its
/// own lock, taken only at spawn/release and never inside the scheduler
/// lock.
static ACTIVE_THREADS: Mutex<u32> = Mutex::new(0);

/// Number of live normal threads.
pub fn active_threads() -> u32 {
    *ACTIVE_THREADS.lock()
}

/// Thread control block.
///
/// Scheduling fields (`state`, `phase`, `priority`, the list node, and the
/// transient `next`/`prev` links) are only read or written under the
/// scheduler lock; `context` is owned by whichever core is switching while
/// `phase == Dirty`.
pub struct Tcb {
    pub(crate) owner_pcb: *mut Pcb,
    pub(crate) owner_ptcb: Option<NonNull<Ptcb>>,
    pub(crate) kind: ThreadKind,
    pub(crate) state: ThreadState,
    pub(crate) phase: ContextPhase,
    pub(crate) thread_func: Option<fn()>,
    pub(crate) wakeup_time: TimeUs,
    pub(crate) priority: i32,
    pub(crate) mutex_flag: bool,
    pub(crate) prev_queue: i32,
    pub(crate) sched_node: ListNode,
    pub(crate) context: CpuContext,
    pub(crate) next: *mut Tcb,
    pub(crate) prev: *mut Tcb,
}

impl Tcb {
    /// An idle thread's TCB. It lives inside a CCB and borrows the core's
    /// boot stack, so no block is allocated for it.
    pub(crate) const fn new_idle() -> Self {
        Self {
            owner_pcb: core::ptr::null_mut(),
            owner_ptcb: None,
            kind: ThreadKind::Idle,
            state: ThreadState::Init,
            phase: ContextPhase::Clean,
            thread_func: None,
            wakeup_time: NO_TIMEOUT,
            priority: TOP_PRIORITY,
            mutex_flag: false,
            prev_queue: TOP_PRIORITY,
            sched_node: ListNode::new(),
            context: CpuContext::zero(),
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
        }
    }

    /// Recover the TCB from its embedded list node.
    ///
    /// # Safety
    /// `node` must be the `sched_node` of a live TCB.
    pub(crate) unsafe fn from_node(node: NonNull<ListNode>) -> NonNull<Tcb> {
        let offset = mem::offset_of!(Tcb, sched_node);
        NonNull::new_unchecked(node.as_ptr().cast::<u8>().sub(offset).cast::<Tcb>())
    }

    /// The TCB's embedded list node.
    ///
    /// # Safety
    /// `tcb` must point to a live TCB.
    pub(crate) unsafe fn node_of(tcb: NonNull<Tcb>) -> NonNull<ListNode> {
        NonNull::new_unchecked(&mut (*tcb.as_ptr()).sched_node)
    }

    /// Apply the feedback rule for a yield cause, clamped to the valid
    /// priority range.
    ///
    /// Leaving a mutex wait restores the pre-demotion level *first*, so the
    /// cause rule applies to the restored value: the first mutex sleep
    /// demotes to the bottom, and the next yield for any other reason puts
    /// the thread back where it was.
    pub(crate) fn adjust_priority(&mut self, cause: SchedCause) {
        if self.mutex_flag && cause != SchedCause::Mutex {
            self.priority = self.prev_queue;
            self.mutex_flag = false;
        }

        match cause {
            SchedCause::Quantum => self.priority -= 1,
            SchedCause::Io => self.priority += 1,
            SchedCause::Mutex => {
                if !self.mutex_flag {
                    self.prev_queue = self.priority;
                }
                self.priority = LOWEST_PRIORITY;
                self.mutex_flag = true;
            }
            SchedCause::Pipe | SchedCause::Poll | SchedCause::Idle | SchedCause::User => {}
        }

        self.priority = self.priority.clamp(LOWEST_PRIORITY, TOP_PRIORITY);
    }

    /// Yield-time state normalization. Returns whether the thread stays
    /// eligible to run.
    pub(crate) fn normalize_for_yield(&mut self) -> bool {
        match self.state {
            ThreadState::Running => {
                self.state = ThreadState::Ready;
                true
            }
            // Awakened before it managed to sleep.
            ThreadState::Ready => true,
            ThreadState::Stopped | ThreadState::Exited => false,
            ThreadState::Init => panic!("Init thread reached yield"),
        }
    }
}

fn thread_block_layout() -> Layout {
    // Size and alignment are compile-time constants; this cannot fail.
    Layout::from_size_align(THREAD_BLOCK_SIZE, PAGE_SIZE).expect("thread block layout")
}

/// First code a spawned thread runs. Finishes the handoff from whoever
/// switched to us, then enters the thread function, which must never
/// return (exiting goes through `sleep_releasing(Exited, ..)`).
extern "C" fn thread_start() -> ! {
    crate::scheduler::core::scheduler::gain(true);

    let current = crate::scheduler::cpu::current_thread();
    let func =
        unsafe { (*current.as_ptr()).thread_func }.expect("normal thread without an entry point");
    func();

    unreachable!("thread function returned to the spawn trampoline");
}

/// Allocate and initialize a TCB for a new thread of `pcb`. The thread is
/// born `Init`; a later `wakeup` makes it runnable, and its first dispatch
/// enters `func` through the spawn trampoline.
///
/// Allocation failure is fatal.
pub fn spawn_thread(pcb: NonNull<Pcb>, func: fn()) -> NonNull<Tcb> {
    let raw = unsafe { alloc_zeroed(thread_block_layout()) };
    let Some(block) = NonNull::new(raw) else {
        panic!("out of memory spawning a thread ({} bytes)", THREAD_BLOCK_SIZE);
    };

    let tcb = block.cast::<Tcb>();
    unsafe {
        tcb.as_ptr().write(Tcb {
            owner_pcb: pcb.as_ptr(),
            owner_ptcb: None,
            kind: ThreadKind::Normal,
            state: ThreadState::Init,
            phase: ContextPhase::Clean,
            thread_func: Some(func),
            wakeup_time: NO_TIMEOUT,
            priority: TOP_PRIORITY,
            mutex_flag: false,
            prev_queue: TOP_PRIORITY,
            sched_node: ListNode::new(),
            context: CpuContext::zero(),
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
        });

        let stack_top = block.as_ptr().add(THREAD_BLOCK_SIZE);
        context::prepare(&mut (*tcb.as_ptr()).context, stack_top, thread_start);
    }

    *ACTIVE_THREADS.lock() += 1;
    log::debug!("spawned thread {:p}", tcb);
    tcb
}

/// Free an exited thread's block and drop it from the active count.
///
/// # Safety
/// `tcb` must come from `spawn_thread`, be `Exited` with a `Clean` context,
/// and be referenced by nobody else. Called by the successor thread's
/// `gain`, after the scheduler lock has been dropped.
pub(crate) unsafe fn release_tcb(tcb: NonNull<Tcb>) {
    debug_assert_eq!(tcb.as_ref().state, ThreadState::Exited);
    debug_assert_eq!(tcb.as_ref().phase, ContextPhase::Clean);

    log::debug!("releasing thread {:p}", tcb);
    dealloc(tcb.as_ptr().cast::<u8>(), thread_block_layout());
    *ACTIVE_THREADS.lock() -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::boot_pcb;

    fn dummy_entry() {}

    #[test]
    fn spawn_initializes_header_and_counts() {
        let before = active_threads();

        let tcb = spawn_thread(boot_pcb(), dummy_entry);
        assert_eq!(active_threads(), before + 1);

        unsafe {
            let t = tcb.as_ref();
            assert_eq!(t.state, ThreadState::Init);
            assert_eq!(t.phase, ContextPhase::Clean);
            assert_eq!(t.kind, ThreadKind::Normal);
            assert_eq!(t.priority, TOP_PRIORITY);
            assert_eq!(t.prev_queue, TOP_PRIORITY);
            assert_eq!(t.wakeup_time, NO_TIMEOUT);
            assert!(!t.mutex_flag);
            assert!(t.thread_func.is_some());
        }

        // The block is page-aligned and the prepared stack pointer lands
        // inside the stack region, above the rounded header.
        let base = tcb.as_ptr() as usize;
        assert_eq!(base % PAGE_SIZE, 0);
        let sp = unsafe { tcb.as_ref().context.stack_pointer() } as usize;
        assert!(sp > base + TCB_RESERVED);
        assert!(sp <= base + THREAD_BLOCK_SIZE);

        let second = spawn_thread(boot_pcb(), dummy_entry);
        assert_eq!(active_threads(), before + 2);

        unsafe {
            (*tcb.as_ptr()).state = ThreadState::Exited;
            (*second.as_ptr()).state = ThreadState::Exited;
            release_tcb(tcb);
            release_tcb(second);
        }
        assert_eq!(active_threads(), before);
    }

    #[test]
    fn node_roundtrips_to_its_tcb() {
        let mut tcb = Box::new(Tcb::new_idle());
        let ptr = NonNull::from(tcb.as_mut());
        unsafe {
            let node = Tcb::node_of(ptr);
            assert_eq!(Tcb::from_node(node), ptr);
        }
    }

    #[test]
    fn quantum_expiry_demotes_until_clamped() {
        let mut t = Tcb::new_idle();
        t.priority = TOP_PRIORITY;

        for expected in (LOWEST_PRIORITY..TOP_PRIORITY).rev() {
            t.adjust_priority(SchedCause::Quantum);
            assert_eq!(t.priority, expected);
        }

        // Already at the bottom: clamped, not negative.
        t.adjust_priority(SchedCause::Quantum);
        assert_eq!(t.priority, LOWEST_PRIORITY);
    }

    #[test]
    fn io_yield_promotes_until_clamped() {
        let mut t = Tcb::new_idle();
        t.priority = TOP_PRIORITY - 1;

        t.adjust_priority(SchedCause::Io);
        assert_eq!(t.priority, TOP_PRIORITY);

        t.adjust_priority(SchedCause::Io);
        assert_eq!(t.priority, TOP_PRIORITY);
    }

    #[test]
    fn mutex_demotes_and_next_cause_restores() {
        let mut t = Tcb::new_idle();
        t.priority = 5;

        t.adjust_priority(SchedCause::Mutex);
        assert_eq!(t.priority, LOWEST_PRIORITY);
        assert_eq!(t.prev_queue, 5);
        assert!(t.mutex_flag);

        // A second mutex wait keeps the original saved level.
        t.adjust_priority(SchedCause::Mutex);
        assert_eq!(t.priority, LOWEST_PRIORITY);
        assert_eq!(t.prev_queue, 5);

        // The next non-mutex yield restores first, then applies its rule.
        t.adjust_priority(SchedCause::Io);
        assert_eq!(t.priority, 6);
        assert!(!t.mutex_flag);
    }

    #[test]
    fn neutral_causes_leave_priority_alone() {
        for cause in [
            SchedCause::Pipe,
            SchedCause::Poll,
            SchedCause::Idle,
            SchedCause::User,
        ] {
            let mut t = Tcb::new_idle();
            t.priority = 3;
            t.adjust_priority(cause);
            assert_eq!(t.priority, 3);
        }
    }

    #[test]
    fn normalization_tracks_eligibility() {
        let mut t = Tcb::new_idle();

        t.state = ThreadState::Running;
        assert!(t.normalize_for_yield());
        assert_eq!(t.state, ThreadState::Ready);

        t.state = ThreadState::Ready;
        assert!(t.normalize_for_yield());

        t.state = ThreadState::Stopped;
        assert!(!t.normalize_for_yield());

        t.state = ThreadState::Exited;
        assert!(!t.normalize_for_yield());
    }
}
