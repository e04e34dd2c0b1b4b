use crate::cell::{Cell, CellFate, MutationModel};
use crate::sinks::{BenchmarkSink, CycleSample, PersistenceSink};
use crate::stats::SharedStatistics;
use cellsim_common::UnitSnapshot;
use log::{trace, warn};
use rand::prelude::*;
use std::time::{Duration, Instant};

pub type WorkerId = usize;

/// Result of advancing one work unit by one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Nothing left to advance. The worker keeps arriving at the barrier anyway.
    Exhausted,
}

/// Timing of the last cycle that had work: how many cells it advanced and how long it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub cells: usize,
    pub duration: Duration,
}

impl Throughput {
    /// Seconds per cell, or `None` when the sample carries no information.
    pub fn cost_per_cell(&self) -> Option<f64> {
        let secs = self.duration.as_secs_f64();
        if self.cells == 0 || secs <= 0.0 {
            None
        } else {
            Some(secs / self.cells as f64)
        }
    }
}

/// Everything a worker needs from the run to advance its unit.
pub struct CycleContext<'a> {
    pub cycle: u32,
    pub model: &'a dyn MutationModel,
    pub stats: &'a SharedStatistics,
    pub persistence: &'a dyn PersistenceSink,
    pub benchmark: &'a dyn BenchmarkSink,
    /// Persist a unit snapshot every N cycles; `None` disables persistence.
    pub persist_interval: Option<u32>,
}

/// One worker's partition of the population.
#[derive(Debug)]
pub struct WorkUnit {
    pub id: WorkerId,
    pub population: Vec<Cell>,
    pub last_processed_cycle: u32,
    rng: StdRng,
    /// Benchmark of the last cycle that had work; `None` until one ran.
    last_throughput: Option<Throughput>,
    /// `(after - before) / before` over the last processed cycle.
    last_growth_rate: f64,
}

impl WorkUnit {
    pub fn new(id: WorkerId, population: Vec<Cell>, seed: u64) -> Self {
        // Decorrelate worker streams while keeping the run reproducible per seed.
        let unit_seed = seed.wrapping_add((id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        Self {
            id,
            population,
            last_processed_cycle: 0,
            rng: StdRng::seed_from_u64(unit_seed),
            last_throughput: None,
            last_growth_rate: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.population.len()
    }

    pub fn is_empty(&self) -> bool {
        self.population.is_empty()
    }

    pub fn last_throughput(&self) -> Option<Throughput> {
        self.last_throughput
    }

    pub fn last_growth_rate(&self) -> f64 {
        self.last_growth_rate
    }

    /// Overrides the timing sample. Used by callers that measure externally.
    pub fn set_benchmark(&mut self, throughput: Option<Throughput>, growth_rate: f64) {
        self.last_throughput = throughput;
        self.last_growth_rate = growth_rate;
    }

    /// Advances every cell by one cycle and publishes the deltas.
    pub fn run_cycle(&mut self, ctx: &CycleContext<'_>) -> CycleOutcome {
        let cycle = ctx.cycle;
        self.last_processed_cycle = cycle;

        if self.population.is_empty() {
            self.last_throughput = None;
            self.last_growth_rate = 0.0;
            trace!("Worker {} exhausted at cycle {}.", self.id, cycle);
            return CycleOutcome::Exhausted;
        }

        let start = Instant::now();
        let cells_before = self.population.len();

        let mut divisions = 0i64;
        let mut deaths = 0i64;
        let mut driver_gain_total = 0i64;
        let mut passenger_gain_total = 0i64;

        // --- Advance cells (serial within a worker) ---
        let current = std::mem::take(&mut self.population);
        let mut next = Vec::with_capacity(current.len() + current.len() / 4);
        for cell in current {
            match ctx.model.fate(&cell, cycle, &mut self.rng) {
                CellFate::Survive => next.push(cell),
                CellFate::Die => deaths += 1,
                CellFate::Divide { driver_gain, passenger_gain } => {
                    let daughter = Cell {
                        driver_mutations: cell.driver_mutations.saturating_add(driver_gain),
                        passenger_mutations: cell.passenger_mutations.saturating_add(passenger_gain),
                        born_cycle: cycle,
                    };
                    next.push(cell);
                    next.push(daughter);
                    divisions += 1;
                    driver_gain_total += driver_gain as i64;
                    passenger_gain_total += passenger_gain as i64;
                }
            }
        }
        self.population = next;

        // --- Publish deltas (atomic add only) ---
        let cells_after = self.population.len();
        ctx.stats.cell_count.add(cycle, cells_after as i64 - cells_before as i64);
        ctx.stats.driver_mutations.add(cycle, driver_gain_total);
        ctx.stats.passenger_mutations.add(cycle, passenger_gain_total);
        ctx.stats.divisions.add(cycle, divisions);
        ctx.stats.deaths.add(cycle, deaths);

        // --- Benchmark sample ---
        let elapsed = start.elapsed();
        self.last_throughput = Some(Throughput { cells: cells_before, duration: elapsed });
        self.last_growth_rate = (cells_after as f64 - cells_before as f64) / cells_before as f64;
        ctx.benchmark.record(CycleSample {
            worker_id: self.id,
            cycle,
            cells_before: cells_before as u64,
            cells_after: cells_after as u64,
            duration_us: elapsed.as_micros().min(u64::MAX as u128) as u64,
        });

        // --- Optional persistence; failures never abort the cycle ---
        if let Some(interval) = ctx.persist_interval {
            if interval > 0 && cycle % interval == 0 {
                if let Err(e) = ctx.persistence.write(&self.snapshot(cycle), cycle) {
                    warn!("Worker {} failed to persist cycle {}: {:#}", self.id, cycle, e);
                }
            }
        }

        trace!(
            "Worker {} cycle {}: {} -> {} cells ({} divisions, {} deaths) in {:.3} ms",
            self.id,
            cycle,
            cells_before,
            cells_after,
            divisions,
            deaths,
            elapsed.as_secs_f64() * 1000.0
        );

        if self.population.is_empty() {
            CycleOutcome::Exhausted
        } else {
            CycleOutcome::Continue
        }
    }

    /// Summary of the unit for persistence.
    pub fn snapshot(&self, cycle: u32) -> UnitSnapshot {
        let n = self.population.len();
        let (driver_sum, passenger_sum, max_drivers) = self.population.iter().fold(
            (0u64, 0u64, 0u32),
            |(d, p, m), c| (d + c.driver_mutations as u64, p + c.passenger_mutations as u64, m.max(c.driver_mutations)),
        );
        let mean = |sum: u64| if n > 0 { sum as f64 / n as f64 } else { 0.0 };
        UnitSnapshot {
            worker_id: self.id,
            cycle,
            cells: n as u64,
            mean_drivers: mean(driver_sum),
            max_drivers,
            mean_passengers: mean(passenger_sum),
        }
    }
}
