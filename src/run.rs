use crate::balance::{BalanceStrategy, LoadBalancer};
use crate::barrier::{BarrierAction, BreakOnPanic, CycleBarrier};
use crate::cell::{Cell, MutationModel};
use crate::coordinator::{CycleCoordinator, RunState, TerminationReason};
use crate::errors::{panic_message, BarrierError, RunError};
use crate::progress::{self, ProgressObserver, DISPATCHER_THREAD_NAME};
use crate::sinks::{BenchmarkSink, NullSink, PersistenceSink};
use crate::stats::SharedStatistics;
use crate::work_unit::{CycleContext, CycleOutcome, WorkUnit, WorkerId};
use cellsim_common::{SimParams, Snapshot};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Splits `total` cells over `k` workers: `total / k` each, the remainder to the last.
pub fn partition_sizes(total: usize, k: usize) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }
    let share = total / k;
    let mut sizes = vec![share; k];
    sizes[k - 1] += total % k;
    debug_assert_eq!(sizes.iter().sum::<usize>(), total);
    sizes
}

/// Cooperative cancellation for a run. Cheap to clone; every clone controls the same run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Requests a stop at the next cycle boundary. Idempotent, and harmless once the run is over.
    pub fn stop(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            info!("Stop requested.");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Summary of a completed (or stopped) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub reason: TerminationReason,
    pub cycles_completed: u32,
    /// Cells held by each worker at the end, by worker id.
    pub final_sizes: Vec<usize>,
    pub total_cells: u64,
    /// Population after each cycle; index 0 is the founding population.
    pub history: Vec<i64>,
    pub snapshots: Vec<Snapshot>,
    pub final_snapshot: Option<Snapshot>,
    pub elapsed: Duration,
}

/// One simulation iteration: K workers advancing their share of the population in lockstep.
pub struct SimulationRun {
    params: SimParams,
    model: Arc<dyn MutationModel>,
    strategy: BalanceStrategy,
    population: Option<Vec<Cell>>,
    persistence: Arc<dyn PersistenceSink>,
    benchmark: Arc<dyn BenchmarkSink>,
    observers: Vec<Box<dyn ProgressObserver>>,
    stop: StopHandle,
}

impl SimulationRun {
    pub fn new(params: SimParams, model: Arc<dyn MutationModel>) -> Self {
        Self {
            strategy: BalanceStrategy::from_params(&params),
            params,
            model,
            population: None,
            persistence: Arc::new(NullSink),
            benchmark: Arc::new(NullSink),
            observers: Vec::new(),
            stop: StopHandle::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: BalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Starts from these cells instead of `initial_cells` founders. Cells are
    /// dealt out in order, so the last worker receives the tail.
    pub fn with_population(mut self, cells: Vec<Cell>) -> Self {
        self.population = Some(cells);
        self
    }

    pub fn with_persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = sink;
        self
    }

    pub fn with_benchmark(mut self, sink: Arc<dyn BenchmarkSink>) -> Self {
        self.benchmark = sink;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs to termination. All worker threads have been joined when this returns.
    pub fn run(self) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let SimulationRun { params, model, strategy, population, persistence, benchmark, observers, stop } = self;

        let workers = params.workers;
        if workers == 0 {
            return Err(RunError::InvalidParams("at least one worker is required".to_string()));
        }
        if params.max_cycles == 0 {
            return Err(RunError::InvalidParams("max_cycles must be at least 1".to_string()));
        }

        // --- Partition the founding population ---
        let mut cells = population.unwrap_or_else(|| {
            let founders = params.initial_cells.min(usize::MAX as u64) as usize;
            vec![Cell::founder(params.initial_drivers); founders]
        });
        let total = cells.len();
        if total < workers {
            return Err(RunError::InvalidParams(format!(
                "{} initial cells cannot be split over {} workers",
                total, workers
            )));
        }
        let sizes = partition_sizes(total, workers);
        let mut units = Vec::with_capacity(workers);
        for (id, &size) in sizes.iter().enumerate().rev() {
            let share = cells.split_off(cells.len() - size);
            units.push(WorkUnit::new(id, share, params.seed));
        }
        units.reverse();

        let stats = SharedStatistics::new(params.max_cycles, total as u64);
        let initial_drivers: i64 = units
            .iter()
            .flat_map(|u| u.population.iter())
            .map(|c| c.driver_mutations as i64)
            .sum();
        stats.set_initial_drivers(initial_drivers);

        let state = RunState::new(units, stats, Arc::clone(&stop.flag));

        info!(
            "Starting run: {} workers, {} cells {:?}, up to {} cycles, balancing '{}', seed {}.",
            workers,
            total,
            sizes,
            params.max_cycles,
            strategy.name(),
            params.seed
        );

        // --- Progress dispatcher (the extra thread) ---
        let (progress, dispatcher) = progress::spawn_dispatcher(observers)
            .map_err(|source| RunError::Spawn { thread: DISPATCHER_THREAD_NAME.to_string(), source })?;

        let coordinator = CycleCoordinator::new(&state, &params, LoadBalancer::new(strategy), progress);
        let barrier = CycleBarrier::new(workers, coordinator);
        let env = WorkerEnv {
            model: model.as_ref(),
            persistence: persistence.as_ref(),
            benchmark: benchmark.as_ref(),
            persist_interval: params.persist_interval.filter(|&n| n > 0),
        };

        // --- Workers ---
        let mut spawn_error = None;
        let exits: Vec<WorkerExit> = thread::scope(|s| {
            let (state, barrier, env) = (&state, &barrier, &env);
            let mut handles = Vec::with_capacity(workers);
            for id in 0..workers {
                let name = format!("cellsim-worker-{}", id);
                let spawned = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(s, move || worker_loop(id, state, barrier, env));
                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(source) => {
                        error!("Failed to spawn {}: {}", name, source);
                        barrier.break_barrier();
                        spawn_error = Some(RunError::Spawn { thread: name, source });
                        break;
                    }
                }
            }
            handles.into_iter().map(|(id, handle)| (id, handle.join())).collect()
        });

        let outcome = barrier.into_action().into_outcome();
        if dispatcher.join().is_err() {
            warn!("Progress dispatcher panicked; some progress events were not delivered.");
        }

        // --- Outcome mapping ---
        if let Some(e) = spawn_error {
            return Err(e);
        }
        map_worker_exits(exits)?;
        let reason = match outcome.reason {
            Some(reason) => reason,
            None => {
                error!("All workers exited but no termination reason was recorded.");
                return Err(RunError::BarrierBroken);
            }
        };

        // --- Report ---
        let history = state.stats.cell_count.to_vec(outcome.cycles_completed);
        let final_sizes: Vec<usize> = state.into_units().iter().map(|u| u.len()).collect();
        let total_cells = final_sizes.iter().map(|&n| n as u64).sum();
        let elapsed = started.elapsed();
        info!(
            "Run finished ({}) after {} cycles: {} cells {:?} in {:.3} s.",
            reason,
            outcome.cycles_completed,
            total_cells,
            final_sizes,
            elapsed.as_secs_f64()
        );

        Ok(RunReport {
            reason,
            cycles_completed: outcome.cycles_completed,
            final_sizes,
            total_cells,
            history,
            snapshots: outcome.snapshots,
            final_snapshot: outcome.final_snapshot,
            elapsed,
        })
    }
}

/// How one worker thread ended: joined cleanly with its loop result, or panicked.
type WorkerExit = (WorkerId, thread::Result<Result<(), BarrierError>>);

/// Collapses worker exits into one outcome: worker death > action failure > broken barrier.
fn map_worker_exits(exits: Vec<WorkerExit>) -> Result<(), RunError> {
    let mut action_failure = None;
    let mut broken = false;
    for (id, exit) in exits {
        match exit {
            Ok(Ok(())) => {}
            Ok(Err(BarrierError::ActionFailed(message))) | Ok(Err(BarrierError::ActionPanicked(message))) => {
                action_failure = Some(message)
            }
            Ok(Err(BarrierError::Broken)) => broken = true,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Worker {} panicked: {}", id, message);
                return Err(RunError::WorkerPanicked { worker: id, message });
            }
        }
    }
    if let Some(message) = action_failure {
        return Err(RunError::ActionFailed(message));
    }
    if broken {
        return Err(RunError::BarrierBroken);
    }
    Ok(())
}

/// Borrowed collaborators every worker shares.
struct WorkerEnv<'a> {
    model: &'a dyn MutationModel,
    persistence: &'a dyn PersistenceSink,
    benchmark: &'a dyn BenchmarkSink,
    persist_interval: Option<u32>,
}

fn worker_loop<A: BarrierAction>(
    id: WorkerId,
    state: &RunState,
    barrier: &CycleBarrier<A>,
    env: &WorkerEnv<'_>,
) -> Result<(), BarrierError> {
    let _guard = BreakOnPanic::new(barrier);
    let mut exhausted_since: Option<u32> = None;

    loop {
        let cycle = state.current_cycle();
        // A stopped worker skips its cycle but still arrives, so the action sees the stop.
        if !state.is_stopped() {
            let mut unit = state.units[id].lock().map_err(|_| BarrierError::Broken)?;
            let ctx = CycleContext {
                cycle,
                model: env.model,
                stats: &state.stats,
                persistence: env.persistence,
                benchmark: env.benchmark,
                persist_interval: env.persist_interval,
            };
            match unit.run_cycle(&ctx) {
                CycleOutcome::Exhausted => {
                    if exhausted_since.is_none() {
                        debug!("Worker {} has no cells left at cycle {}.", id, cycle);
                        exhausted_since = Some(cycle);
                    }
                }
                CycleOutcome::Continue => {
                    if let Some(since) = exhausted_since.take() {
                        debug!("Worker {} resumed at cycle {} (idle since {}).", id, cycle, since);
                    }
                }
            }
        }

        barrier.wait()?;
        if state.is_last_cycle() {
            return Ok(());
        }
    }
}
