use crate::errors::{panic_message, BarrierError};
use log::{error, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Code run once per rendezvous by the last party to arrive, while all others are parked.
pub trait BarrierAction: Send {
    fn run(&mut self) -> anyhow::Result<()>;
}

impl<F> BarrierAction for F
where
    F: FnMut() -> anyhow::Result<()> + Send,
{
    fn run(&mut self) -> anyhow::Result<()> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    /// Accepting arrivals.
    Open,
    /// The elected party is running the action; everyone else is parked.
    RunningAction,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    phase: BarrierPhase,
    broken: bool,
}

/// What `wait` tells a party that made it through a rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// Generation the party arrived in (0 for the first rendezvous).
    pub generation: u64,
    /// True for exactly one party per generation: the one that ran the action.
    pub is_leader: bool,
}

/// Reusable rendezvous for a fixed number of parties with a single action.
///
/// The K-th arrival runs the action on its own thread with the state lock
/// released, then opens the next generation and wakes everyone. Exactly one
/// execution of the action happens per rendezvous. If the action fails or
/// panics, or `break_barrier` is called, the barrier is broken for good and
/// every current and future `wait` returns an error instead of hanging.
pub struct CycleBarrier<A: BarrierAction> {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
    action: Mutex<A>,
}

impl<A: BarrierAction> CycleBarrier<A> {
    /// `parties` is clamped to at least one.
    pub fn new(parties: usize, action: A) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                phase: BarrierPhase::Open,
                broken: false,
            }),
            released: Condvar::new(),
            action: Mutex::new(action),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn is_broken(&self) -> bool {
        self.lock_state().map_or(true, |s| s.broken)
    }

    pub fn phase(&self) -> BarrierPhase {
        self.lock_state().map_or(BarrierPhase::Open, |s| s.phase)
    }

    /// Completed rendezvous so far.
    pub fn generation(&self) -> u64 {
        self.lock_state().map_or(0, |s| s.generation)
    }

    /// Marks the barrier broken and wakes every parked party.
    pub fn break_barrier(&self) {
        match self.state.lock() {
            Ok(mut state) => state.broken = true,
            Err(poisoned) => poisoned.into_inner().broken = true,
        }
        self.released.notify_all();
    }

    /// Arrives at the barrier and blocks until the rendezvous completes.
    pub fn wait(&self) -> Result<BarrierWaitResult, BarrierError> {
        let mut state = self.lock_state()?;
        if state.broken {
            return Err(BarrierError::Broken);
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived < self.parties {
            // --- Park until the leader opens the next generation ---
            while state.generation == generation && !state.broken {
                state = self.released.wait(state).map_err(|_| BarrierError::Broken)?;
            }
            if state.generation == generation {
                return Err(BarrierError::Broken);
            }
            return Ok(BarrierWaitResult { generation, is_leader: false });
        }

        // --- Last arrival: run the action ---
        state.phase = BarrierPhase::RunningAction;
        drop(state);
        trace!("Barrier generation {} complete; running action.", generation);

        let outcome = {
            let mut action = self.action.lock().map_err(|_| BarrierError::Broken)?;
            catch_unwind(AssertUnwindSafe(|| action.run()))
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = match outcome {
            Ok(Ok(())) if !state.broken => {
                state.arrived = 0;
                state.generation += 1;
                state.phase = BarrierPhase::Open;
                Ok(BarrierWaitResult { generation, is_leader: true })
            }
            // Someone broke the barrier while the action was running.
            Ok(Ok(())) => Err(BarrierError::Broken),
            Ok(Err(e)) => {
                error!("Barrier action failed in generation {}: {:#}", generation, e);
                state.broken = true;
                Err(BarrierError::ActionFailed(format!("{:#}", e)))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Barrier action panicked in generation {}: {}", generation, message);
                state.broken = true;
                Err(BarrierError::ActionPanicked(message))
            }
        };
        drop(state);
        self.released.notify_all();
        result
    }

    /// Consumes the barrier and hands back its action (e.g. to read final results).
    pub fn into_action(self) -> A {
        match self.action.into_inner() {
            Ok(action) => action,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BarrierState>, BarrierError> {
        self.state.lock().map_err(|_| BarrierError::Broken)
    }
}

/// Breaks the barrier if the owning thread unwinds. Keeps a panicking worker
/// from leaving the other parties parked forever.
pub struct BreakOnPanic<'a, A: BarrierAction> {
    barrier: &'a CycleBarrier<A>,
}

impl<'a, A: BarrierAction> BreakOnPanic<'a, A> {
    pub fn new(barrier: &'a CycleBarrier<A>) -> Self {
        Self { barrier }
    }
}

impl<A: BarrierAction> Drop for BreakOnPanic<'_, A> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Worker thread panicked; breaking barrier.");
            self.barrier.break_barrier();
        }
    }
}
