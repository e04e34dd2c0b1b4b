use anyhow::Result;
use cellsim_common::SimParams;
use rand::prelude::*;
use rand_distr::Poisson;
use serde::{Deserialize, Serialize};

/// One simulated cell. The unit of work that workers advance and the balancer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub driver_mutations: u32,
    pub passenger_mutations: u32,
    /// Cycle in which the cell was created (0 for the founding population).
    pub born_cycle: u32,
}

impl Cell {
    pub fn founder(driver_mutations: u32) -> Self {
        Self { driver_mutations, passenger_mutations: 0, born_cycle: 0 }
    }
}

/// What happens to a cell during one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFate {
    Survive,
    Die,
    /// The cell divides; the daughter inherits the parent's mutations plus these.
    Divide { driver_gain: u32, passenger_gain: u32 },
}

/// Decides the fate of each cell, once per cell per cycle.
///
/// Must be a pure function of its inputs apart from the supplied RNG, because
/// it is called concurrently from every worker thread.
pub trait MutationModel: Send + Sync {
    fn fate(&self, cell: &Cell, cycle: u32, rng: &mut StdRng) -> CellFate;
}

/// Model that never changes anything. Handy for exercising the scheduler alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct InertModel;

impl MutationModel for InertModel {
    fn fate(&self, _cell: &Cell, _cycle: u32, _rng: &mut StdRng) -> CellFate {
        CellFate::Survive
    }
}

/// Simple branching process: drivers raise the division probability
/// geometrically, mutations arrive as Poisson counts at division.
#[derive(Debug, Clone)]
pub struct BranchingModel {
    division_probability: f64,
    death_probability: f64,
    driver_fitness_gain: f64,
    max_drivers: u32,
    driver_dist: Option<Poisson<f64>>,
    passenger_dist: Option<Poisson<f64>>,
}

impl BranchingModel {
    pub fn new(params: &SimParams) -> Result<Self> {
        // Poisson requires a strictly positive mean; a zero rate just disables sampling.
        let poisson = |rate: f64| -> Result<Option<Poisson<f64>>> {
            if rate > 0.0 {
                Ok(Some(Poisson::new(rate).map_err(|e| anyhow::anyhow!("Invalid Poisson rate {}: {}", rate, e))?))
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            division_probability: params.division_probability,
            death_probability: params.death_probability,
            driver_fitness_gain: params.driver_fitness_gain,
            max_drivers: params.max_drivers,
            driver_dist: poisson(params.driver_rate)?,
            passenger_dist: poisson(params.passenger_rate)?,
        })
    }

    /// Division probability for a cell carrying `drivers` driver mutations.
    pub fn division_probability(&self, drivers: u32) -> f64 {
        let boost = (1.0 + self.driver_fitness_gain).powi(drivers.min(i32::MAX as u32) as i32);
        (self.division_probability * boost).clamp(0.0, 1.0)
    }
}

impl MutationModel for BranchingModel {
    fn fate(&self, cell: &Cell, _cycle: u32, rng: &mut StdRng) -> CellFate {
        if rng.random::<f64>() < self.death_probability {
            return CellFate::Die;
        }
        if rng.random::<f64>() >= self.division_probability(cell.driver_mutations) {
            return CellFate::Survive;
        }

        let sample = |dist: &Option<Poisson<f64>>, rng: &mut StdRng| -> u32 {
            dist.as_ref().map_or(0, |d| d.sample(rng) as u32)
        };
        let headroom = self.max_drivers.saturating_sub(cell.driver_mutations);
        let driver_gain = sample(&self.driver_dist, rng).min(headroom);
        let passenger_gain = sample(&self.passenger_dist, rng);
        CellFate::Divide { driver_gain, passenger_gain }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(division: f64, death: f64) -> SimParams {
        let mut p = SimParams::neutral(1, 1, 1);
        p.division_probability = division;
        p.death_probability = death;
        p.driver_fitness_gain = 0.5;
        p.driver_rate = 2.0;
        p.max_drivers = 3;
        p
    }

    #[test]
    fn certain_death_always_dies() {
        let model = BranchingModel::new(&params(1.0, 1.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(model.fate(&Cell::founder(0), 1, &mut rng), CellFate::Die);
        }
    }

    #[test]
    fn drivers_raise_division_probability_up_to_one() {
        let model = BranchingModel::new(&params(0.2, 0.0)).unwrap();
        assert!((model.division_probability(0) - 0.2).abs() < 1e-12);
        assert!((model.division_probability(1) - 0.3).abs() < 1e-12);
        assert_eq!(model.division_probability(10), 1.0);
    }

    #[test]
    fn driver_gain_respects_cap() {
        let model = BranchingModel::new(&params(1.0, 0.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let parent = Cell::founder(2);
        for _ in 0..200 {
            match model.fate(&parent, 1, &mut rng) {
                CellFate::Divide { driver_gain, .. } => assert!(driver_gain <= 1),
                other => panic!("expected division, got {:?}", other),
            }
        }
    }

    #[test]
    fn zero_rates_produce_no_mutations() {
        let mut p = params(1.0, 0.0);
        p.driver_rate = 0.0;
        p.passenger_rate = 0.0;
        let model = BranchingModel::new(&p).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            model.fate(&Cell::founder(0), 1, &mut rng),
            CellFate::Divide { driver_gain: 0, passenger_gain: 0 }
        );
    }
}
