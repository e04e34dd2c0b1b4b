//! Lockstep parallel population simulator.
//!
//! A run splits the founding population over K worker threads. Each worker
//! advances its own `WorkUnit` one cycle at a time, then waits at a
//! `CycleBarrier`; the last to arrive runs the `CycleCoordinator`, which
//! aggregates statistics, decides whether to continue and rebalances cells.

pub mod balance;
pub mod barrier;
pub mod cell;
pub mod coordinator;
pub mod errors;
pub mod output;
pub mod progress;
pub mod run;
pub mod sinks;
pub mod stats;
pub mod work_unit;

pub use balance::{BalanceReport, BalanceStrategy, LoadBalancer};
pub use cell::{BranchingModel, Cell, CellFate, InertModel, MutationModel};
pub use coordinator::TerminationReason;
pub use errors::{BarrierError, RunError};
pub use progress::{ChannelObserver, LogObserver, Metric, ProgressBarObserver, ProgressEvent, ProgressObserver};
pub use run::{partition_sizes, RunReport, SimulationRun, StopHandle};
pub use sinks::{BenchmarkSink, CsvPersistence, CycleSample, NullSink, PersistenceSink, TimingRecorder};
