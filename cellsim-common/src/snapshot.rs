use serde::{Serialize, Deserialize};

/// A snapshot of the aggregated run state at the end of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// The cycle that had just completed when the snapshot was taken.
    pub cycle: u32,
    /// Total number of cells across all work units.
    pub total_cells: u64,
    /// Population size of each work unit, indexed by worker id.
    pub unit_sizes: Vec<u64>,
    /// Cumulative driver mutations acquired up to and including this cycle.
    pub driver_mutations: i64,
    /// Cumulative passenger mutations acquired up to and including this cycle.
    pub passenger_mutations: i64,
    /// Divisions that happened during this cycle.
    pub divisions: i64,
    /// Deaths that happened during this cycle.
    pub deaths: i64,
    /// `driver_histogram[n]` counts the living cells carrying exactly `n` drivers.
    /// Only filled for the final snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_histogram: Option<Vec<u64>>,
}

/// What a single worker hands to a persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitSnapshot {
    pub worker_id: usize,
    pub cycle: u32,
    pub cells: u64,
    pub mean_drivers: f64,
    pub max_drivers: u32,
    pub mean_passengers: f64,
}
