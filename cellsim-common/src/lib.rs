pub mod config;
pub mod sim_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use config::{
    BalanceStrategyKind, BalancingConfig, InitialConditions, MutationConfig, OutputConfig,
    OutputFormat, RunConfig, SimulationConfig,
};
pub use sim_params::SimParams;
pub use snapshot::{Snapshot, UnitSnapshot};
