use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::SimParams;
use std::path::Path;

// Configuration for the worker pool and run length
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunConfig {
    pub workers: usize,
    pub max_cycles: u32,
    #[serde(default)]
    pub max_population: u64, // 0 = unlimited
    pub seed: u64,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_record_interval")]
    pub record_interval: u32, // Record a snapshot every N cycles
}

// Initial population, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InitialConditions {
    pub initial_cells: u64,
    #[serde(default)]
    pub initial_drivers: u32,
}

// Per-cell stochastic parameters consumed by the branching model
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MutationConfig {
    pub division_probability: f64,
    pub death_probability: f64,
    #[serde(default = "default_driver_fitness_gain")]
    pub driver_fitness_gain: f64, // Relative division boost per driver mutation
    #[serde(default)]
    pub driver_rate: f64, // Mean new drivers per division
    #[serde(default)]
    pub passenger_rate: f64, // Mean new passengers per division
    #[serde(default = "default_max_drivers")]
    pub max_drivers: u32,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategyKind {
    Empty,
    EqualizeCount,
    DutyRatio,
    DutyGain,
}

impl std::str::FromStr for BalanceStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "empty" | "none" => Ok(Self::Empty),
            "equalize_count" | "count" => Ok(Self::EqualizeCount),
            "duty_ratio" | "ratio" => Ok(Self::DutyRatio),
            "duty_gain" | "gain" => Ok(Self::DutyGain),
            other => anyhow::bail!("Unknown balancing strategy '{}'.", other),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BalancingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: BalanceStrategyKind,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64, // Relative imbalance below which duty strategies do nothing
    #[serde(default = "default_smoothing")]
    pub smoothing: f64, // EMA weight of the newest timing sample (0, 1]
    #[serde(default = "default_gain")]
    pub gain: f64, // Growth-rate weight for the duty_gain strategy
}

impl Default for BalancingConfig {
    fn default() -> Self {
        BalancingConfig {
            strategy: default_strategy(),
            tolerance: default_tolerance(),
            smoothing: default_smoothing(),
            gain: default_gain(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Bincode,
    MessagePack,
}

// Configuration for output settings, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    #[serde(default = "default_true")]
    pub save_history: bool,
    #[serde(default = "default_true")]
    pub save_snapshots: bool,
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    #[serde(default)]
    pub persist_units: bool, // Per-worker CSV rows written during the run
    #[serde(default = "default_persist_interval")]
    pub persist_interval: u32,
    #[serde(default)]
    pub save_benchmarks: bool,
}

// Main simulation configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub run: RunConfig,
    pub initial_conditions: InitialConditions,
    pub mutation: MutationConfig,
    #[serde(default)]
    pub balancing: BalancingConfig,
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from a TOML string.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.run.workers == 0 {
            anyhow::bail!("workers must be greater than 0.");
        }
        if self.run.max_cycles == 0 {
            anyhow::bail!("max_cycles must be greater than 0.");
        }
        if self.initial_conditions.initial_cells < self.run.workers as u64 {
            anyhow::bail!(
                "initial_cells ({}) must be at least the number of workers ({}).",
                self.initial_conditions.initial_cells,
                self.run.workers
            );
        }
        for (name, p) in [
            ("division_probability", self.mutation.division_probability),
            ("death_probability", self.mutation.death_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                anyhow::bail!("{} must be within [0, 1], got {}.", name, p);
            }
        }
        if self.mutation.driver_rate < 0.0 || self.mutation.passenger_rate < 0.0 {
            anyhow::bail!("Mutation rates must not be negative.");
        }
        if !(self.balancing.smoothing > 0.0 && self.balancing.smoothing <= 1.0) {
            anyhow::bail!("balancing.smoothing must be within (0, 1].");
        }
        if self.balancing.tolerance < 0.0 || self.balancing.gain < 0.0 {
            anyhow::bail!("balancing.tolerance and balancing.gain must not be negative.");
        }
        if self.output.persist_units && self.output.persist_interval == 0 {
            anyhow::bail!("persist_interval must be greater than 0 when persist_units is set.");
        }
        Ok(())
    }

    /// Converts the configuration into simulation parameters used at runtime.
    pub fn get_sim_params(&self) -> SimParams {
        let record_interval = self.run.record_interval.max(1);
        let max_population = if self.run.max_population == 0 {
            None
        } else {
            Some(self.run.max_population)
        };

        SimParams {
            // Pool & run length
            workers: self.run.workers,
            max_cycles: self.run.max_cycles,
            max_population,
            seed: self.run.seed,
            record_interval,
            // Initial population
            initial_cells: self.initial_conditions.initial_cells,
            initial_drivers: self.initial_conditions.initial_drivers,
            // Cell model
            division_probability: self.mutation.division_probability,
            death_probability: self.mutation.death_probability,
            driver_fitness_gain: self.mutation.driver_fitness_gain,
            driver_rate: self.mutation.driver_rate,
            passenger_rate: self.mutation.passenger_rate,
            max_drivers: self.mutation.max_drivers,
            // Balancing
            strategy: self.balancing.strategy,
            balance_tolerance: self.balancing.tolerance,
            balance_smoothing: self.balancing.smoothing,
            balance_gain: self.balancing.gain,
            // Persistence
            persist_interval: if self.output.persist_units {
                Some(self.output.persist_interval)
            } else {
                None
            },
        }
    }
}

fn default_iterations() -> u32 {
    1
}

fn default_record_interval() -> u32 {
    1
}

fn default_driver_fitness_gain() -> f64 {
    0.1
}

fn default_max_drivers() -> u32 {
    32
}

fn default_strategy() -> BalanceStrategyKind {
    BalanceStrategyKind::EqualizeCount
}

fn default_tolerance() -> f64 {
    0.05
}

fn default_smoothing() -> f64 {
    0.5
}

fn default_gain() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_format() -> OutputFormat {
    OutputFormat::Json
}

fn default_persist_interval() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [run]
        workers = 4
        max_cycles = 50
        seed = 7

        [initial_conditions]
        initial_cells = 100

        [mutation]
        division_probability = 0.2
        death_probability = 0.1

        [output]
        base_filename = "out"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = SimulationConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.run.iterations, 1);
        assert_eq!(config.balancing.strategy, BalanceStrategyKind::EqualizeCount);
        assert_eq!(config.output.format, OutputFormat::Json);

        let params = config.get_sim_params();
        assert_eq!(params.workers, 4);
        assert_eq!(params.max_population, None);
        assert_eq!(params.persist_interval, None);
        assert_eq!(params.record_interval, 1);
    }

    #[test]
    fn strategy_parses_from_snake_case() {
        let text = MINIMAL.replace(
            "[output]",
            "[balancing]\nstrategy = \"duty_gain\"\ngain = 2.0\n\n[output]",
        );
        let config = SimulationConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.balancing.strategy, BalanceStrategyKind::DutyGain);
        assert_eq!(config.balancing.gain, 2.0);
    }

    #[test]
    fn rejects_fewer_cells_than_workers() {
        let text = MINIMAL.replace("initial_cells = 100", "initial_cells = 3");
        assert!(SimulationConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let text = MINIMAL.replace("death_probability = 0.1", "death_probability = 1.5");
        assert!(SimulationConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn strategy_from_str_accepts_aliases() {
        assert_eq!("count".parse::<BalanceStrategyKind>().unwrap(), BalanceStrategyKind::EqualizeCount);
        assert_eq!("Duty_Ratio".parse::<BalanceStrategyKind>().unwrap(), BalanceStrategyKind::DutyRatio);
        assert!("round_robin".parse::<BalanceStrategyKind>().is_err());
    }
}
