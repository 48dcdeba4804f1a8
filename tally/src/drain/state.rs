//! Scheduling state of the drain task
//!
//! The drain task moves through `Idle -> Scheduled -> Running -> Idle`. All
//! transitions are a compare-exchange on one word, which packs the phase into
//! the low two bits and a cycle ticket into the rest. Every successful
//! schedule mints a new ticket and the deferred run must present it. A run
//! holding an old ticket, say because `preempt` claimed the cycle first, fails
//! its transition and does nothing.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};

const PHASE_BITS: u32 = 2;
const PHASE_MASK: u64 = (1 << PHASE_BITS) - 1;
const TICKET_MASK: u64 = u64::MAX >> PHASE_BITS;

/// Phase of the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing scheduled, nothing running.
    Idle,
    /// A run is deferred and has not started yet.
    Scheduled,
    /// A drain cycle is in progress.
    Running,
}

impl Phase {
    fn bits(self) -> u64 {
        match self {
            Phase::Idle => 0,
            Phase::Scheduled => 1,
            Phase::Running => 2,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & PHASE_MASK {
            0 => Phase::Idle,
            1 => Phase::Scheduled,
            _ => Phase::Running,
        }
    }
}

#[inline]
fn encode(phase: Phase, ticket: u64) -> u64 {
    ((ticket & TICKET_MASK) << PHASE_BITS) | phase.bits()
}

#[inline]
fn decode(word: u64) -> (Phase, u64) {
    (Phase::from_bits(word), word >> PHASE_BITS)
}

#[inline]
fn next_ticket(ticket: u64) -> u64 {
    ticket.wrapping_add(1) & TICKET_MASK
}

#[derive(Debug)]
pub(crate) struct CycleState {
    word: AtomicU64,
}

impl CycleState {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(encode(Phase::Idle, 0)),
        }
    }

    pub(crate) fn load(&self) -> (Phase, u64) {
        decode(self.word.load(Ordering::SeqCst))
    }

    /// `Idle(n) -> Scheduled(n + 1)`. Returns the new ticket if this caller
    /// made the transition, `None` if a cycle is already scheduled or running.
    pub(crate) fn try_schedule(&self) -> Option<u64> {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            let (phase, ticket) = decode(current);
            if phase != Phase::Idle {
                return None;
            }
            let ticket = next_ticket(ticket);
            match self.word.compare_exchange_weak(
                current,
                encode(Phase::Scheduled, ticket),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(ticket),
                Err(x) => current = x,
            }
        }
    }

    /// `Scheduled(t) -> Running(t)` for the given ticket only.
    pub(crate) fn try_start(&self, ticket: u64) -> bool {
        self.word
            .compare_exchange(
                encode(Phase::Scheduled, ticket),
                encode(Phase::Running, ticket),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `Idle(n) | Scheduled(n) -> Running(n + 1)`. Any deferred run holding
    /// ticket `n` is superseded. Returns `None` if a cycle is running.
    pub(crate) fn try_preempt(&self) -> Option<u64> {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            let (phase, ticket) = decode(current);
            if phase == Phase::Running {
                return None;
            }
            let ticket = next_ticket(ticket);
            match self.word.compare_exchange_weak(
                current,
                encode(Phase::Running, ticket),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(ticket),
                Err(x) => current = x,
            }
        }
    }

    /// `Scheduled(t) -> Idle(t)` for a deferred run that will never start.
    /// Returns `false` if ticket `t` is no longer scheduled.
    pub(crate) fn abandon(&self, ticket: u64) -> bool {
        self.word
            .compare_exchange(
                encode(Phase::Scheduled, ticket),
                encode(Phase::Idle, ticket),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `Running(t) -> Idle(t)`.
    pub(crate) fn finish(&self, ticket: u64) {
        let res = self.word.compare_exchange(
            encode(Phase::Running, ticket),
            encode(Phase::Idle, ticket),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        debug_assert!(res.is_ok(), "finished a cycle that was not running");
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use super::{CycleState, Phase, TICKET_MASK, encode, next_ticket};

    #[test]
    fn schedule_coalesces_until_finished() {
        let state = CycleState::new();
        let ticket = state.try_schedule().expect("idle state must schedule");
        assert_eq!(state.load(), (Phase::Scheduled, ticket));

        assert!(state.try_schedule().is_none());
        assert!(state.try_start(ticket));
        assert!(state.try_schedule().is_none());
        assert_eq!(state.load(), (Phase::Running, ticket));

        state.finish(ticket);
        assert_eq!(state.load(), (Phase::Idle, ticket));
        assert_eq!(state.try_schedule(), Some(next_ticket(ticket)));
    }

    #[test]
    fn start_requires_matching_ticket() {
        let state = CycleState::new();
        let ticket = state.try_schedule().expect("idle state must schedule");
        assert!(!state.try_start(ticket + 1));
        assert!(state.try_start(ticket));
        assert!(!state.try_start(ticket));
    }

    #[test]
    fn preempt_supersedes_scheduled_run() {
        let state = CycleState::new();
        let stale = state.try_schedule().expect("idle state must schedule");
        let ticket = state.try_preempt().expect("scheduled state must preempt");
        assert_ne!(stale, ticket);
        assert!(state.try_preempt().is_none());

        state.finish(ticket);
        // The deferred run fires late and must not start.
        assert!(!state.try_start(stale));
        assert_eq!(state.load(), (Phase::Idle, ticket));
    }

    #[test]
    fn abandon_returns_scheduled_ticket_to_idle() {
        let state = CycleState::new();
        let ticket = state.try_schedule().expect("idle state must schedule");
        assert!(state.abandon(ticket));
        assert_eq!(state.load(), (Phase::Idle, ticket));
        assert!(!state.try_start(ticket));

        let next = state.try_schedule().expect("idle state must schedule");
        assert!(state.try_start(next));
        // A running or finished ticket cannot be abandoned.
        assert!(!state.abandon(next));
        state.finish(next);
        assert!(!state.abandon(next));
        assert_eq!(state.load(), (Phase::Idle, next));
    }

    #[test]
    fn ticket_wraps_within_mask() {
        assert_eq!(next_ticket(TICKET_MASK), 0);
        let word = encode(Phase::Running, TICKET_MASK);
        assert_eq!(super::decode(word), (Phase::Running, TICKET_MASK));
    }
}

#[cfg(all(test, loom))]
mod loom_test {
    use loom::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::{CycleState, Phase};

    #[test]
    fn concurrent_schedules_mint_one_ticket() {
        loom::model(|| {
            let state = Arc::new(CycleState::new());
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let state = Arc::clone(&state);
                    thread::spawn(move || state.try_schedule())
                })
                .collect();
            let won = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(Option::is_some)
                .count();
            assert_eq!(won, 1);
            assert_eq!(state.load().0, Phase::Scheduled);
        });
    }

    #[test]
    fn at_most_one_cycle_runs() {
        loom::model(|| {
            let state = Arc::new(CycleState::new());
            let active = Arc::new(AtomicUsize::new(0));

            let worker = |state: Arc<CycleState>, active: Arc<AtomicUsize>, preempt: bool| {
                thread::spawn(move || {
                    let ticket = if preempt {
                        state.try_preempt()
                    } else {
                        state.try_schedule().filter(|t| state.try_start(*t))
                    };
                    if let Some(ticket) = ticket {
                        let before = active.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(before, 0, "two cycles running at once");
                        active.fetch_sub(1, Ordering::SeqCst);
                        state.finish(ticket);
                    }
                })
            };

            let a = worker(Arc::clone(&state), Arc::clone(&active), false);
            let b = worker(Arc::clone(&state), Arc::clone(&active), true);
            a.join().unwrap();
            b.join().unwrap();

            assert_ne!(state.load().0, Phase::Running);
        });
    }
}
