use anyhow::{Context, Result};
use cellsim_common::UnitSnapshot;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Receives per-worker state while a run is in progress.
///
/// Called concurrently from worker threads. Failures are logged by the caller
/// and never abort the cycle.
pub trait PersistenceSink: Send + Sync {
    fn write(&self, unit: &UnitSnapshot, cycle: u32) -> Result<()>;
}

/// Timing of one worker's cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub worker_id: usize,
    pub cycle: u32,
    pub cells_before: u64,
    pub cells_after: u64,
    pub duration_us: u64,
}

impl CycleSample {
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us)
    }
}

/// Receives per-worker per-cycle timing samples.
pub trait BenchmarkSink: Send + Sync {
    fn record(&self, sample: CycleSample);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn write(&self, _unit: &UnitSnapshot, _cycle: u32) -> Result<()> {
        Ok(())
    }
}

impl BenchmarkSink for NullSink {
    fn record(&self, _sample: CycleSample) {}
}

/// Appends unit snapshots as CSV rows to a single file shared by all workers.
pub struct CsvPersistence {
    writer: Mutex<csv::Writer<File>>,
}

impl CsvPersistence {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let writer = csv::Writer::from_path(path_ref)
            .with_context(|| format!("Failed to create unit CSV '{}'", path_ref.display()))?;
        debug!("Persisting unit snapshots to {}", path_ref.display());
        Ok(Self { writer: Mutex::new(writer) })
    }
}

impl PersistenceSink for CsvPersistence {
    fn write(&self, unit: &UnitSnapshot, _cycle: u32) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("Unit CSV writer lock poisoned"))?;
        writer.serialize(unit)?;
        writer.flush()?;
        Ok(())
    }
}

/// Collects timing samples in memory for later export.
#[derive(Debug, Default)]
pub struct TimingRecorder {
    samples: Mutex<Vec<CycleSample>>,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<CycleSample> {
        match self.samples.lock() {
            Ok(samples) => samples.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Writes all samples collected so far, sorted by (cycle, worker).
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut samples = self.samples();
        samples.sort_by_key(|s| (s.cycle, s.worker_id));
        let mut writer = csv::Writer::from_path(path.as_ref())
            .with_context(|| format!("Failed to create benchmark CSV '{}'", path.as_ref().display()))?;
        for sample in &samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl BenchmarkSink for TimingRecorder {
    fn record(&self, sample: CycleSample) {
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample),
            Err(_) => error!("Timing recorder lock poisoned; dropping sample for worker {}.", sample.worker_id),
        }
    }
}
