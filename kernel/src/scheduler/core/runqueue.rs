//! Ready queues, timeout list, and the feedback policy
//!
//! One instance of [`SchedQueues`] lives behind the scheduler lock. All of
//! its methods assume the caller holds that lock; they touch TCB scheduling
//! fields through raw pointers, which is sound for exactly that reason.
//!
//! The policy pieces live here too: the congestion counter estimating
//! starvation pressure at low priority levels, the fail-safe selection
//! tick, and the boost that lifts every queued thread one level up.

use core::ptr::NonNull;

use crate::arch::smp;
use crate::arch::timer::{TimeUs, NO_TIMEOUT};
use crate::libutils::list::List;
use crate::scheduler::thread::state::{ContextPhase, ThreadState};
use crate::scheduler::thread::tcb::Tcb;
use crate::scheduler::{FAILSAFE_PERIOD, LOWEST_PRIORITY, MAX_CONGESTION, PRIORITY_LEVELS, TOP_PRIORITY};

pub(crate) struct SchedQueues {
    /// FIFO ready queues, one per priority level.
    ready: [List; PRIORITY_LEVELS],
    /// Sleeping threads with a deadline, ascending by wake time.
    timeouts: List,
    /// Starvation pressure estimate, clamped at zero.
    congestion: i32,
    /// Monotonic count of selections, for the fail-safe boost.
    fail_safe: u32,
}

impl SchedQueues {
    pub(crate) const fn new() -> Self {
        const EMPTY: List = List::new();
        Self {
            ready: [EMPTY; PRIORITY_LEVELS],
            timeouts: List::new(),
            congestion: 0,
            fail_safe: 0,
        }
    }

    /// Append a ready thread to its level's queue and wake a parked core
    /// to come and get it.
    ///
    /// # Safety
    /// Caller holds the scheduler lock; `tcb` is live and unqueued.
    pub(crate) unsafe fn queue_add(&mut self, tcb: NonNull<Tcb>) {
        let level = (*tcb.as_ptr()).priority as usize;
        self.ready[level].push_back(Tcb::node_of(tcb));
        smp::kick_one();
    }

    /// Give a sleeping thread a deadline and slot it into the timeout list,
    /// keeping the list sorted (stable for equal wake times).
    ///
    /// # Safety
    /// Caller holds the scheduler lock; `tcb` is live and on no list.
    pub(crate) unsafe fn register_timeout(
        &mut self,
        tcb: NonNull<Tcb>,
        timeout: TimeUs,
        now: TimeUs,
    ) {
        if timeout == NO_TIMEOUT {
            return;
        }

        let t = tcb.as_ptr();
        // A saturated deadline must stay below the sentinel, or the entry
        // would look timeout-free while sitting on the list.
        (*t).wakeup_time = now.saturating_add(timeout).min(NO_TIMEOUT - 1);

        let mut at = self.timeouts.front();
        while let Some(node) = at {
            let other = Tcb::from_node(node);
            if (*other.as_ptr()).wakeup_time > (*t).wakeup_time {
                break;
            }
            at = node.as_ref().next();
        }

        match at {
            Some(node) => self.timeouts.insert_before(node, Tcb::node_of(tcb)),
            None => self.timeouts.push_back(Tcb::node_of(tcb)),
        }
    }

    /// Transition a parked thread to `Ready`, unlinking it from the timeout
    /// list if it had a deadline. Threads whose context is still live on
    /// some core are not enqueued here; the displacing core's `gain` does
    /// that when it observes the `Ready` state.
    ///
    /// # Safety
    /// Caller holds the scheduler lock; `tcb` is live, `Stopped` or `Init`.
    pub(crate) unsafe fn make_ready(&mut self, tcb: NonNull<Tcb>) {
        let t = tcb.as_ptr();
        debug_assert!((*t).state.is_wakeable(), "make_ready on {}", (*t).state);

        if (*t).wakeup_time != NO_TIMEOUT {
            debug_assert_eq!((*t).state, ThreadState::Stopped);
            self.timeouts.remove(Tcb::node_of(tcb));
            (*t).wakeup_time = NO_TIMEOUT;
        }

        (*t).state = ThreadState::Ready;

        if (*t).phase == ContextPhase::Clean {
            self.queue_add(tcb);
        }
    }

    /// The wakeup state machine: parked threads become ready, anything
    /// else is a spurious wakeup and a no-op.
    ///
    /// # Safety
    /// Caller holds the scheduler lock; `tcb` is live.
    pub(crate) unsafe fn wake(&mut self, tcb: NonNull<Tcb>) -> bool {
        if tcb.as_ref().state.is_wakeable() {
            self.make_ready(tcb);
            true
        } else {
            false
        }
    }

    /// Pick the next thread to run: expire due sleepers, then scan the
    /// ready queues from the top level down. Also advances the congestion
    /// heuristic and fires the boost when pressure or the fail-safe says
    /// so.
    ///
    /// # Safety
    /// Caller holds the scheduler lock.
    pub(crate) unsafe fn select(&mut self, now: TimeUs) -> Option<NonNull<Tcb>> {
        while let Some(head) = self.timeouts.front() {
            let sleeper = Tcb::from_node(head);
            if (*sleeper.as_ptr()).wakeup_time > now {
                break;
            }
            self.make_ready(sleeper);
        }

        let mut selected = None;
        for level in (0..PRIORITY_LEVELS).rev() {
            if let Some(node) = self.ready[level].pop_front() {
                selected = Some((Tcb::from_node(node), level));
                break;
            }
        }

        match selected {
            // Nothing runnable, or the pick came from the bottom: pressure
            // is draining.
            None => self.congestion -= 1,
            Some((_, level)) if level == LOWEST_PRIORITY as usize => self.congestion -= 1,
            // Work remains below the level we picked from: those threads
            // are starving.
            Some((_, level)) => {
                let lower_busy = (0..level).any(|l| !self.ready[l].is_empty());
                if lower_busy {
                    self.congestion += 1;
                } else {
                    self.congestion -= 1;
                }
            }
        }
        if self.congestion < 0 {
            self.congestion = 0;
        }

        self.fail_safe = self.fail_safe.wrapping_add(1);
        if self.congestion >= MAX_CONGESTION || self.fail_safe == FAILSAFE_PERIOD {
            self.boost();
        }

        selected.map(|(tcb, _)| tcb)
    }

    /// Lift every queued thread one priority level, top level excepted,
    /// preserving order within each level. Resets the congestion estimate.
    ///
    /// # Safety
    /// Caller holds the scheduler lock.
    pub(crate) unsafe fn boost(&mut self) {
        self.congestion = 0;

        for level in (LOWEST_PRIORITY as usize..TOP_PRIORITY as usize).rev() {
            while let Some(node) = self.ready[level].pop_front() {
                let tcb = Tcb::from_node(node);
                (*tcb.as_ptr()).priority += 1;
                self.ready[level + 1].push_back(node);
            }
        }

        log::debug!("priority boost applied");
    }

    #[cfg(test)]
    fn congestion(&self) -> i32 {
        self.congestion
    }

    #[cfg(test)]
    fn level_len(&self, level: i32) -> usize {
        self.ready[level as usize].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::thread::state::ThreadKind;

    /// A TCB header detached from any real stack, parked at `priority`.
    fn tcb(priority: i32) -> Box<Tcb> {
        let mut t = Box::new(Tcb::new_idle());
        t.kind = ThreadKind::Normal;
        t.state = ThreadState::Stopped;
        t.priority = priority;
        t
    }

    fn ptr(t: &mut Tcb) -> NonNull<Tcb> {
        NonNull::from(t)
    }

    #[test]
    fn ready_queue_is_fifo_within_level() {
        let mut q = SchedQueues::new();
        let mut a = tcb(4);
        let mut b = tcb(4);
        let mut c = tcb(4);

        unsafe {
            q.make_ready(ptr(&mut a));
            q.make_ready(ptr(&mut b));
            q.make_ready(ptr(&mut c));

            assert_eq!(q.select(0), Some(ptr(&mut a)));
            assert_eq!(q.select(0), Some(ptr(&mut b)));
            assert_eq!(q.select(0), Some(ptr(&mut c)));
            assert_eq!(q.select(0), None);
        }
    }

    #[test]
    fn selection_prefers_higher_levels() {
        let mut q = SchedQueues::new();
        let mut low = tcb(1);
        let mut mid = tcb(4);
        let mut high = tcb(6);

        unsafe {
            q.make_ready(ptr(&mut low));
            q.make_ready(ptr(&mut high));
            q.make_ready(ptr(&mut mid));

            assert_eq!(q.select(0), Some(ptr(&mut high)));
            assert_eq!(q.select(0), Some(ptr(&mut mid)));
            assert_eq!(q.select(0), Some(ptr(&mut low)));
        }
    }

    #[test]
    fn every_queued_tcb_sits_at_its_priority_level() {
        let mut q = SchedQueues::new();
        let mut a = tcb(2);
        let mut b = tcb(5);

        unsafe {
            q.make_ready(ptr(&mut a));
            q.make_ready(ptr(&mut b));
        }
        assert_eq!(q.level_len(2), 1);
        assert_eq!(q.level_len(5), 1);
        assert_eq!(q.level_len(3), 0);
    }

    #[test]
    fn wake_is_idempotent() {
        let mut q = SchedQueues::new();
        let mut t = tcb(3);

        unsafe {
            assert!(q.wake(ptr(&mut t)));
            assert_eq!(t.state, ThreadState::Ready);
            assert_eq!(q.level_len(3), 1);

            // Second wakeup observes Ready and does nothing.
            assert!(!q.wake(ptr(&mut t)));
            assert_eq!(q.level_len(3), 1);
        }
    }

    #[test]
    fn wake_of_running_thread_is_a_noop() {
        let mut q = SchedQueues::new();
        let mut t = tcb(3);
        t.state = ThreadState::Running;

        unsafe {
            assert!(!q.wake(ptr(&mut t)));
        }
        assert_eq!(t.state, ThreadState::Running);
        assert_eq!(q.level_len(3), 0);
    }

    #[test]
    fn make_ready_defers_enqueue_while_context_is_dirty() {
        let mut q = SchedQueues::new();
        let mut t = tcb(3);
        t.phase = ContextPhase::Dirty;

        unsafe { q.make_ready(ptr(&mut t)) };

        // Ready, but not queued: the displacing core's gain() will do it.
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(q.level_len(3), 0);
    }

    #[test]
    fn timeouts_expire_in_deadline_order() {
        let mut q = SchedQueues::new();
        let mut a = tcb(5);
        let mut b = tcb(5);
        let mut c = tcb(5);

        unsafe {
            q.register_timeout(ptr(&mut a), 30_000, 0);
            q.register_timeout(ptr(&mut b), 10_000, 0);
            q.register_timeout(ptr(&mut c), 20_000, 0);

            // Nothing due yet.
            assert_eq!(q.select(9_999), None);

            assert_eq!(q.select(10_000), Some(ptr(&mut b)));
            assert_eq!(q.select(10_000), None);

            assert_eq!(q.select(20_000), Some(ptr(&mut c)));
            assert_eq!(q.select(30_000), Some(ptr(&mut a)));
        }

        assert_eq!(a.wakeup_time, NO_TIMEOUT);
        assert_eq!(b.wakeup_time, NO_TIMEOUT);
        assert_eq!(c.wakeup_time, NO_TIMEOUT);
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let mut q = SchedQueues::new();
        let mut a = tcb(5);
        let mut b = tcb(5);

        unsafe {
            q.register_timeout(ptr(&mut a), 10_000, 0);
            q.register_timeout(ptr(&mut b), 10_000, 0);

            assert_eq!(q.select(10_000), Some(ptr(&mut a)));
            assert_eq!(q.select(10_000), Some(ptr(&mut b)));
        }
    }

    #[test]
    fn wakeup_beats_pending_timeout() {
        let mut q = SchedQueues::new();
        let mut t = tcb(5);

        unsafe {
            q.register_timeout(ptr(&mut t), 10_000, 0);
            assert!(q.wake(ptr(&mut t)));
        }
        // Off the timeout list, deadline cleared, queued as ready.
        assert_eq!(t.wakeup_time, NO_TIMEOUT);
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(q.level_len(5), 1);

        // The deadline passing later finds nothing to expire.
        unsafe {
            assert_eq!(q.select(20_000), Some(ptr(&mut t)));
            assert_eq!(q.select(20_000), None);
        }
    }

    #[test]
    fn no_timeout_never_joins_the_list() {
        let mut q = SchedQueues::new();
        let mut t = tcb(5);

        unsafe { q.register_timeout(ptr(&mut t), NO_TIMEOUT, 0) };
        assert_eq!(t.wakeup_time, NO_TIMEOUT);
        unsafe { assert_eq!(q.select(TimeUs::MAX - 1), None) };
    }

    #[test]
    fn boost_lifts_everything_but_the_top_level() {
        let mut q = SchedQueues::new();
        let mut bottom = tcb(LOWEST_PRIORITY);
        let mut first = tcb(3);
        let mut second = tcb(3);
        let mut top = tcb(TOP_PRIORITY);

        unsafe {
            q.make_ready(ptr(&mut bottom));
            q.make_ready(ptr(&mut first));
            q.make_ready(ptr(&mut second));
            q.make_ready(ptr(&mut top));
            q.boost();
        }

        assert_eq!(bottom.priority, LOWEST_PRIORITY + 1);
        assert_eq!(first.priority, 4);
        assert_eq!(second.priority, 4);
        assert_eq!(top.priority, TOP_PRIORITY);

        // Order within the moved level is preserved.
        unsafe {
            assert_eq!(q.select(0), Some(ptr(&mut top)));
            assert_eq!(q.select(0), Some(ptr(&mut first)));
            assert_eq!(q.select(0), Some(ptr(&mut second)));
            assert_eq!(q.select(0), Some(ptr(&mut bottom)));
        }
    }

    #[test]
    fn congestion_builds_while_low_levels_starve() {
        let mut q = SchedQueues::new();
        let mut busy = tcb(5);
        let mut starved = tcb(2);

        unsafe {
            q.make_ready(ptr(&mut starved));

            // The same high-level thread keeps winning while level 2 waits;
            // every such selection raises the pressure until boost fires.
            for round in 1..=MAX_CONGESTION {
                busy.state = ThreadState::Stopped;
                q.make_ready(ptr(&mut busy));
                assert_eq!(q.select(0), Some(ptr(&mut busy)));

                if round < MAX_CONGESTION {
                    assert_eq!(q.congestion(), round);
                }
            }
        }

        // The boost reset the pressure and promoted the starved thread.
        assert_eq!(q.congestion(), 0);
        assert_eq!(starved.priority, 3);
        assert_eq!(q.level_len(3), 1);
    }

    #[test]
    fn congestion_drains_when_no_lower_work_exists() {
        let mut q = SchedQueues::new();
        let mut only = tcb(5);

        unsafe {
            // Build some pressure first.
            let mut lower = tcb(1);
            q.make_ready(ptr(&mut lower));
            only.state = ThreadState::Stopped;
            q.make_ready(ptr(&mut only));
            assert_eq!(q.select(0), Some(ptr(&mut only)));
            assert_eq!(q.congestion(), 1);

            // Drain the starved level, then selections with nothing below
            // bleed the counter back to its floor.
            assert_eq!(q.select(0), Some(ptr(&mut lower)));
            only.state = ThreadState::Stopped;
            q.make_ready(ptr(&mut only));
            assert_eq!(q.select(0), Some(ptr(&mut only)));
            assert_eq!(q.congestion(), 0);

            // Clamped at zero, never negative.
            assert_eq!(q.select(0), None);
            assert_eq!(q.congestion(), 0);
        }
    }

    #[test]
    fn fail_safe_boosts_after_five_hundred_selections() {
        let mut q = SchedQueues::new();
        let mut waiting = tcb(2);

        unsafe {
            for _ in 0..FAILSAFE_PERIOD - 1 {
                assert_eq!(q.select(0), None);
            }
            assert_eq!(q.congestion(), 0);

            // Sits at level 2 during the 500th selection; nothing else is
            // runnable, so only the fail-safe can promote it.
            q.make_ready(ptr(&mut waiting));
            let mut top_pick = tcb(6);
            q.make_ready(ptr(&mut top_pick));

            assert_eq!(q.select(0), Some(ptr(&mut top_pick)));
        }

        assert_eq!(waiting.priority, 3);
        assert_eq!(q.level_len(3), 1);
    }
}
