use crate::balance::LoadBalancer;
use crate::barrier::BarrierAction;
use crate::cell::Cell;
use crate::progress::{Metric, ProgressSink};
use crate::stats::SharedStatistics;
use crate::work_unit::WorkUnit;
use anyhow::Result;
use cellsim_common::{SimParams, Snapshot};
use log::{debug, error, info, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Why a run ended. When several hold at once the earlier variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// A stop was requested through the run's `StopHandle`.
    Stopped,
    /// The whole population died out.
    Extinct,
    /// The population reached the configured ceiling.
    PopulationLimit,
    /// The configured number of cycles completed.
    MaxCycles,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::Extinct => "extinct",
            TerminationReason::PopulationLimit => "population limit",
            TerminationReason::MaxCycles => "max cycles",
        };
        f.write_str(text)
    }
}

/// State shared by the workers and the barrier action for one run.
#[derive(Debug)]
pub struct RunState {
    /// Cycle the workers are processing (1-based).
    pub cycle: AtomicU32,
    /// Technical-last-cycle latch. Set once by the barrier action, never cleared.
    pub last_cycle: AtomicBool,
    pub stop: Arc<AtomicBool>,
    pub stats: SharedStatistics,
    /// One slot per worker, indexed by worker id. Uncontended: a worker holds its
    /// own slot during a cycle, the barrier action holds all of them in between.
    pub units: Vec<Mutex<WorkUnit>>,
}

impl RunState {
    pub fn new(units: Vec<WorkUnit>, stats: SharedStatistics, stop: Arc<AtomicBool>) -> Self {
        Self {
            cycle: AtomicU32::new(1),
            last_cycle: AtomicBool::new(false),
            stop,
            stats,
            units: units.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn current_cycle(&self) -> u32 {
        self.cycle.load(Ordering::Acquire)
    }

    pub fn is_last_cycle(&self) -> bool {
        self.last_cycle.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Consumes the state and returns the units in worker-id order.
    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
            .into_iter()
            .map(|slot| match slot.into_inner() {
                Ok(unit) => unit,
                Err(poisoned) => poisoned.into_inner(),
            })
            .collect()
    }
}

/// What the coordinator hands back once the run is over.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOutcome {
    pub reason: Option<TerminationReason>,
    pub cycles_completed: u32,
    pub snapshots: Vec<Snapshot>,
    pub final_snapshot: Option<Snapshot>,
}

/// The barrier action: runs once per cycle while every worker is parked.
pub struct CycleCoordinator<'a> {
    state: &'a RunState,
    balancer: LoadBalancer,
    progress: ProgressSink,
    max_cycles: u32,
    max_population: Option<u64>,
    record_interval: u32,
    reason: Option<TerminationReason>,
    cycles_completed: u32,
    snapshots: Vec<Snapshot>,
    final_snapshot: Option<Snapshot>,
}

impl<'a> CycleCoordinator<'a> {
    pub fn new(state: &'a RunState, params: &SimParams, balancer: LoadBalancer, progress: ProgressSink) -> Self {
        Self {
            state,
            balancer,
            progress,
            max_cycles: params.max_cycles,
            max_population: params.max_population.filter(|&m| m > 0),
            record_interval: params.record_interval.max(1),
            reason: None,
            cycles_completed: 0,
            snapshots: Vec::new(),
            final_snapshot: None,
        }
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    /// Closes the progress channel and returns what was collected.
    pub fn into_outcome(mut self) -> CoordinatorOutcome {
        self.progress.close();
        CoordinatorOutcome {
            reason: self.reason,
            cycles_completed: self.cycles_completed,
            snapshots: self.snapshots,
            final_snapshot: self.final_snapshot,
        }
    }

    /// Termination predicate, first match wins.
    fn termination(&self, cycle: u32, total: u64) -> Option<TerminationReason> {
        if self.state.is_stopped() {
            Some(TerminationReason::Stopped)
        } else if total == 0 {
            Some(TerminationReason::Extinct)
        } else if self.max_population.is_some_and(|limit| total >= limit) {
            Some(TerminationReason::PopulationLimit)
        } else if cycle >= self.max_cycles {
            Some(TerminationReason::MaxCycles)
        } else {
            None
        }
    }

    fn progress_fraction(&self, cycle: u32, total: u64) -> f64 {
        match self.reason {
            Some(TerminationReason::Stopped) | Some(TerminationReason::Extinct) => 1.0,
            _ => {
                let by_cycle = cycle as f64 / self.max_cycles.max(1) as f64;
                let by_population = self.max_population.map_or(0.0, |limit| total as f64 / limit as f64);
                by_cycle.max(by_population)
            }
        }
    }

    /// Every worker saw the stop before starting `cycle`, so nothing ran and
    /// the run ends with the previous cycle.
    fn stop_before(&mut self, cycle: u32, units: &[MutexGuard<'_, WorkUnit>]) {
        let completed = cycle.saturating_sub(1);
        info!("Run stopped before cycle {} started; {} cycles completed.", cycle, completed);
        self.reason = Some(TerminationReason::Stopped);
        self.cycles_completed = completed;
        self.state.last_cycle.store(true, Ordering::Release);

        if completed > 0 {
            let final_snapshot = self.snapshot(completed, units, true);
            if self.snapshots.last().map(|s| s.cycle) != Some(completed) {
                self.snapshots.push(Snapshot { driver_histogram: None, ..final_snapshot.clone() });
            }
            self.final_snapshot = Some(final_snapshot);
        }

        self.progress.update_progress(1.0);
        self.progress.finish(completed as i64);
    }

    fn snapshot(&self, cycle: u32, units: &[MutexGuard<'_, WorkUnit>], with_histogram: bool) -> Snapshot {
        let stats = &self.state.stats;
        let unit_sizes: Vec<u64> = units.iter().map(|u| u.len() as u64).collect();
        let driver_histogram = if with_histogram {
            let populations: Vec<&[Cell]> = units.iter().map(|u| u.population.as_slice()).collect();
            Some(driver_histogram(&populations))
        } else {
            None
        };
        Snapshot {
            cycle,
            total_cells: unit_sizes.iter().sum(),
            unit_sizes,
            driver_mutations: stats.driver_mutations.get(cycle),
            passenger_mutations: stats.passenger_mutations.get(cycle),
            divisions: stats.divisions.get(cycle),
            deaths: stats.deaths.get(cycle),
            driver_histogram,
        }
    }
}

impl BarrierAction for CycleCoordinator<'_> {
    fn run(&mut self) -> Result<()> {
        let state = self.state;
        let cycle = state.current_cycle();
        let mut units = state
            .units
            .iter()
            .enumerate()
            .map(|(id, slot)| slot.lock().map_err(|_| anyhow::anyhow!("work unit {} lock poisoned", id)))
            .collect::<Result<Vec<_>>>()?;

        // --- 1. Aggregate and check the population invariant ---
        let total: u64 = units.iter().map(|u| u.len() as u64).sum();
        let recorded = state.stats.cell_count.get(cycle);
        if recorded != total as i64 {
            debug_assert_eq!(recorded, total as i64, "cell_count[{}] disagrees with the unit sizes", cycle);
            error!(
                "Cell count for cycle {} recorded as {} but units hold {}. Clamping to the measured total.",
                cycle, recorded, total
            );
            state.stats.cell_count.set(cycle, total as i64);
        }

        // --- 2. Termination predicate (latched) ---
        if !state.is_last_cycle() && state.is_stopped() && units.iter().all(|u| u.last_processed_cycle != cycle) {
            self.stop_before(cycle, &units);
            return Ok(());
        }
        if !state.is_last_cycle() {
            if let Some(reason) = self.termination(cycle, total) {
                info!("Run terminating after cycle {}: {} ({} cells).", cycle, reason, total);
                self.reason = Some(reason);
                state.last_cycle.store(true, Ordering::Release);
            }
        }
        let last = state.is_last_cycle();
        self.cycles_completed = cycle;

        // --- 3. Record before balancing so sizes reflect this cycle's growth ---
        if last {
            let final_snapshot = self.snapshot(cycle, &units, true);
            self.snapshots.push(Snapshot { driver_histogram: None, ..final_snapshot.clone() });
            self.final_snapshot = Some(final_snapshot);
        } else if cycle % self.record_interval == 0 {
            let snapshot = self.snapshot(cycle, &units, false);
            self.snapshots.push(snapshot);
        }

        // --- 4. Prepare the next cycle ---
        if !last {
            state.stats.copy_forward(cycle);
            if cycle > 1 {
                let mut refs: Vec<&mut WorkUnit> = units.iter_mut().map(|guard| &mut **guard).collect();
                let report = self.balancer.rebalance(&mut refs)?;
                trace!("Cycle {} balance: {:?}", cycle, report);
            }
            state.cycle.store(cycle + 1, Ordering::Release);
        }
        drop(units);

        // --- 5. Progress ---
        self.progress.update(Metric::Cycle, cycle as i64);
        self.progress.update(Metric::CellCount, total as i64);
        let fraction = self.progress_fraction(cycle, total);
        self.progress.update_progress(fraction);
        if last {
            self.progress.finish(cycle as i64);
        }

        debug!("Cycle {} aggregated: {} cells.", cycle, total);
        Ok(())
    }
}

/// Number of cells per driver-mutation count, merged across units in parallel.
pub fn driver_histogram(populations: &[&[Cell]]) -> Vec<u64> {
    populations
        .par_iter()
        .map(|cells| {
            let mut counts: Vec<u64> = Vec::new();
            for cell in cells.iter() {
                let bucket = cell.driver_mutations as usize;
                if counts.len() <= bucket {
                    counts.resize(bucket + 1, 0);
                }
                counts[bucket] += 1;
            }
            counts
        })
        .reduce(Vec::new, |mut a, b| {
            if a.len() < b.len() {
                a.resize(b.len(), 0);
            }
            for (slot, count) in a.iter_mut().zip(b) {
                *slot += count;
            }
            a
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceStrategy;

    fn state_with(sizes: &[usize], max_cycles: u32) -> RunState {
        let total: usize = sizes.iter().sum();
        let units = sizes
            .iter()
            .enumerate()
            .map(|(id, &n)| WorkUnit::new(id, vec![Cell::founder(0); n], 7))
            .collect();
        RunState::new(units, SharedStatistics::new(max_cycles, total as u64), Arc::new(AtomicBool::new(false)))
    }

    fn coordinator<'a>(state: &'a RunState, params: &SimParams) -> CycleCoordinator<'a> {
        CycleCoordinator::new(
            state,
            params,
            LoadBalancer::new(BalanceStrategy::from_params(params)),
            ProgressSink::disabled(),
        )
    }

    #[test]
    fn advances_until_max_cycles_then_latches() {
        let params = SimParams::neutral(2, 10, 3);
        let state = state_with(&[5, 5], 3);
        let mut coord = coordinator(&state, &params);

        for expected in 1..=3 {
            assert_eq!(state.current_cycle(), expected);
            coord.run().unwrap();
        }
        assert!(state.is_last_cycle());
        assert_eq!(state.current_cycle(), 3);
        assert_eq!(coord.reason(), Some(TerminationReason::MaxCycles));

        let outcome = coord.into_outcome();
        assert_eq!(outcome.cycles_completed, 3);
        assert_eq!(outcome.snapshots.len(), 3);
        let last = outcome.final_snapshot.unwrap();
        assert_eq!(last.total_cells, 10);
        assert_eq!(last.driver_histogram, Some(vec![10]));
    }

    #[test]
    fn latch_is_monotonic_and_reason_is_not_overwritten() {
        let params = SimParams::neutral(2, 10, 1);
        let state = state_with(&[5, 5], 1);
        let mut coord = coordinator(&state, &params);
        coord.run().unwrap();
        assert_eq!(coord.reason(), Some(TerminationReason::MaxCycles));

        state.stop.store(true, Ordering::SeqCst);
        coord.run().unwrap();
        assert!(state.is_last_cycle());
        assert_eq!(coord.reason(), Some(TerminationReason::MaxCycles));
    }

    #[test]
    fn stop_takes_precedence_over_every_other_reason() {
        let mut params = SimParams::neutral(1, 10, 1);
        params.max_population = Some(5);
        let state = state_with(&[10], 1);
        state.units[0].lock().unwrap().last_processed_cycle = 1;
        state.stop.store(true, Ordering::SeqCst);
        let mut coord = coordinator(&state, &params);
        coord.run().unwrap();
        assert_eq!(coord.reason(), Some(TerminationReason::Stopped));
        assert_eq!(coord.into_outcome().cycles_completed, 1);
    }

    #[test]
    fn stop_seen_by_every_worker_before_the_cycle_does_not_count_it() {
        let params = SimParams::neutral(2, 10, 50);
        let state = state_with(&[5, 5], 50);
        let (sink, events) = ProgressSink::channel();
        let mut coord = CycleCoordinator::new(
            &state,
            &params,
            LoadBalancer::new(BalanceStrategy::from_params(&params)),
            sink,
        );
        state.stop.store(true, Ordering::SeqCst);
        coord.run().unwrap();

        assert!(state.is_last_cycle());
        assert_eq!(state.current_cycle(), 1);
        let outcome = coord.into_outcome();
        assert_eq!(outcome.reason, Some(TerminationReason::Stopped));
        assert_eq!(outcome.cycles_completed, 0);
        assert!(outcome.snapshots.is_empty());
        assert!(outcome.final_snapshot.is_none());

        let received: Vec<(Metric, i64)> = events.iter().map(|e| (e.metric, e.new)).collect();
        assert_eq!(received, vec![(Metric::Progress, 100), (Metric::Finished, 0)]);
    }

    #[test]
    fn stop_between_cycles_ends_on_the_previous_cycle() {
        let mut params = SimParams::neutral(2, 10, 50);
        params.record_interval = 10;
        let state = state_with(&[5, 5], 50);
        let mut coord = coordinator(&state, &params);
        for cycle in 1..=3 {
            for slot in &state.units {
                slot.lock().unwrap().last_processed_cycle = cycle;
            }
            coord.run().unwrap();
        }
        assert_eq!(state.current_cycle(), 4);

        state.stop.store(true, Ordering::SeqCst);
        coord.run().unwrap();

        let outcome = coord.into_outcome();
        assert_eq!(outcome.reason, Some(TerminationReason::Stopped));
        assert_eq!(outcome.cycles_completed, 3);
        let cycles: Vec<u32> = outcome.snapshots.iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![3]);
        let last = outcome.final_snapshot.unwrap();
        assert_eq!((last.cycle, last.total_cells), (3, 10));
        assert_eq!(last.driver_histogram, Some(vec![10]));
    }

    #[test]
    fn shrinking_population_does_not_rewind_progress() {
        let mut params = SimParams::neutral(1, 6, 100);
        params.max_population = Some(10);
        let state = state_with(&[6], 100);
        let (sink, events) = ProgressSink::channel();
        let mut coord = CycleCoordinator::new(
            &state,
            &params,
            LoadBalancer::new(BalanceStrategy::from_params(&params)),
            sink,
        );
        coord.run().unwrap();

        {
            let mut unit = state.units[0].lock().unwrap();
            unit.population.truncate(4);
        }
        state.stats.cell_count.add(2, -2);
        coord.run().unwrap();
        drop(coord);

        let progress: Vec<i64> = events.iter().filter(|e| e.metric == Metric::Progress).map(|e| e.new).collect();
        assert_eq!(progress, vec![60]);
    }

    #[test]
    fn extinction_beats_max_cycles_and_population_limit_beats_max_cycles() {
        let params = SimParams::neutral(2, 0, 1);
        let state = state_with(&[0, 0], 1);
        let mut coord = coordinator(&state, &params);
        coord.run().unwrap();
        assert_eq!(coord.reason(), Some(TerminationReason::Extinct));

        let mut params = SimParams::neutral(2, 10, 1);
        params.max_population = Some(10);
        let state = state_with(&[5, 5], 1);
        let mut coord = coordinator(&state, &params);
        coord.run().unwrap();
        assert_eq!(coord.reason(), Some(TerminationReason::PopulationLimit));
    }

    #[test]
    fn balancing_waits_for_the_second_cycle() {
        let params = SimParams::neutral(2, 10, 10);
        let state = state_with(&[10, 0], 10);
        let mut coord = coordinator(&state, &params);

        coord.run().unwrap();
        let sizes: Vec<usize> = state.units.iter().map(|u| u.lock().unwrap().len()).collect();
        assert_eq!(sizes, vec![10, 0]);

        coord.run().unwrap();
        let sizes: Vec<usize> = state.units.iter().map(|u| u.lock().unwrap().len()).collect();
        assert_eq!(sizes, vec![5, 5]);
        assert_eq!(state.stats.cell_count.get(3), 10);
    }

    #[test]
    fn zero_population_limit_means_unlimited() {
        let mut params = SimParams::neutral(1, 4, 2);
        params.max_population = Some(0);
        let state = state_with(&[4], 2);
        let mut coord = coordinator(&state, &params);
        coord.run().unwrap();
        assert!(!state.is_last_cycle());
    }

    #[test]
    fn record_interval_thins_snapshots_but_keeps_the_last() {
        let mut params = SimParams::neutral(1, 3, 5);
        params.record_interval = 2;
        let state = state_with(&[3], 5);
        let mut coord = coordinator(&state, &params);
        for _ in 0..5 {
            coord.run().unwrap();
        }
        let cycles: Vec<u32> = coord.into_outcome().snapshots.iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![2, 4, 5]);
    }

    #[test]
    fn histogram_merges_units() {
        let a = vec![Cell::founder(0), Cell::founder(2)];
        let b = vec![Cell::founder(2), Cell::founder(1), Cell::founder(4)];
        assert_eq!(driver_histogram(&[a.as_slice(), b.as_slice()]), vec![1, 1, 2, 0, 1]);
        assert!(driver_histogram(&[]).is_empty());
    }
}
