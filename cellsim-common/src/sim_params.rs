use serde::{Deserialize, Serialize};
use crate::config::BalanceStrategyKind;

/// Simulation parameters derived from the configuration, used frequently during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // Pool & run length
    pub workers: usize,
    pub max_cycles: u32,
    pub max_population: Option<u64>,
    pub seed: u64,
    pub record_interval: u32,

    // Initial population
    pub initial_cells: u64,
    pub initial_drivers: u32,

    // Cell model
    pub division_probability: f64,
    pub death_probability: f64,
    pub driver_fitness_gain: f64,
    pub driver_rate: f64,
    pub passenger_rate: f64,
    pub max_drivers: u32,

    // Balancing
    pub strategy: BalanceStrategyKind,
    pub balance_tolerance: f64,
    pub balance_smoothing: f64,
    pub balance_gain: f64,

    // Persistence
    pub persist_interval: Option<u32>, // None = per-unit persistence disabled
}

impl SimParams {
    /// Parameters for a run that only needs the scheduler knobs; the cell model
    /// is neutral (no division, no death). Mostly useful for embedding and tests.
    pub fn neutral(workers: usize, initial_cells: u64, max_cycles: u32) -> Self {
        SimParams {
            workers,
            max_cycles,
            max_population: None,
            seed: 0,
            record_interval: 1,
            initial_cells,
            initial_drivers: 0,
            division_probability: 0.0,
            death_probability: 0.0,
            driver_fitness_gain: 0.0,
            driver_rate: 0.0,
            passenger_rate: 0.0,
            max_drivers: 0,
            strategy: BalanceStrategyKind::EqualizeCount,
            balance_tolerance: 0.0,
            balance_smoothing: 1.0,
            balance_gain: 0.0,
            persist_interval: None,
        }
    }

    /// Same parameters with a different seed, used for successive iterations.
    pub fn with_seed(&self, seed: u64) -> Self {
        SimParams { seed, ..self.clone() }
    }
}
