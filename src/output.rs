use crate::run::RunReport;
use anyhow::{Context, Result};
use cellsim_common::{OutputFormat, Snapshot};
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Base filename for one iteration. Single-iteration runs keep the base unchanged.
pub fn iteration_base(base_filename: &str, iteration: u32, iterations: u32) -> String {
    if iterations > 1 {
        format!("{}_iter{:03}", base_filename, iteration)
    } else {
        base_filename.to_string()
    }
}

pub fn snapshot_path(base: &str, format: OutputFormat) -> PathBuf {
    let extension = match format {
        OutputFormat::Json => "json",
        OutputFormat::Bincode => "bin",
        OutputFormat::MessagePack => "msgpack",
    };
    PathBuf::from(format!("{}_snapshots.{}", base, extension))
}

/// Writes every recorded snapshot in the configured format.
pub fn save_snapshots(base: &str, format: OutputFormat, snapshots: &[Snapshot]) -> Result<PathBuf> {
    let path = snapshot_path(base, format);
    let file = File::create(&path).with_context(|| format!("Failed to create snapshot file '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);

    match format {
        OutputFormat::Json => serde_json::to_writer(&mut writer, snapshots).context("Error serializing snapshots to JSON")?,
        OutputFormat::Bincode => {
            bincode::serialize_into(&mut writer, snapshots).context("Error serializing snapshots to bincode")?
        }
        OutputFormat::MessagePack => {
            rmp_serde::encode::write(&mut writer, &snapshots).context("Error serializing snapshots to MessagePack")?
        }
    }
    writer.flush()?;
    info!("{} snapshots saved to {} ({:?} format)", snapshots.len(), path.display(), format);
    Ok(path)
}

/// One row per cycle: population plus the per-cycle counters when a snapshot exists for it.
pub fn save_history_csv<P: AsRef<Path>>(path: P, report: &RunReport) -> Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create history CSV '{}'", path.display()))?;
    writer.write_record(["cycle", "cell_count", "divisions", "deaths", "driver_mutations"])?;

    let mut snapshots = report.snapshots.iter().peekable();
    for (cycle, cells) in report.history.iter().enumerate() {
        while snapshots.peek().is_some_and(|s| (s.cycle as usize) < cycle) {
            snapshots.next();
        }
        let matching = snapshots.peek().filter(|s| s.cycle as usize == cycle);
        let field = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([
            cycle.to_string(),
            cells.to_string(),
            field(matching.map(|s| s.divisions)),
            field(matching.map(|s| s.deaths)),
            field(matching.map(|s| s.driver_mutations)),
        ])?;
    }
    writer.flush()?;
    info!("Cell count history saved to {}", path.display());
    Ok(())
}

/// Run summary (reason, sizes, final snapshot) as pretty JSON.
pub fn save_summary_json<P: AsRef<Path>>(path: P, report: &RunReport) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create summary file '{}'", path.display()))?;
    let summary = serde_json::json!({
        "reason": report.reason,
        "cycles_completed": report.cycles_completed,
        "total_cells": report.total_cells,
        "final_sizes": report.final_sizes,
        "elapsed_secs": report.elapsed.as_secs_f64(),
        "final_snapshot": report.final_snapshot,
    });
    serde_json::to_writer_pretty(BufWriter::new(file), &summary).context("Error serializing run summary")?;
    info!("Run summary saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TerminationReason;
    use std::time::Duration;

    fn snapshot(cycle: u32, total: u64) -> Snapshot {
        Snapshot {
            cycle,
            total_cells: total,
            unit_sizes: vec![total],
            driver_mutations: 1,
            passenger_mutations: 0,
            divisions: cycle as i64,
            deaths: 0,
            driver_histogram: None,
        }
    }

    fn report() -> RunReport {
        RunReport {
            reason: TerminationReason::MaxCycles,
            cycles_completed: 3,
            final_sizes: vec![5, 6],
            total_cells: 11,
            history: vec![8, 9, 10, 11],
            snapshots: vec![snapshot(2, 10), snapshot(3, 11)],
            final_snapshot: Some(snapshot(3, 11)),
            elapsed: Duration::from_millis(12),
        }
    }

    #[test]
    fn iteration_suffix_only_for_multiple_iterations() {
        assert_eq!(iteration_base("out/run", 0, 1), "out/run");
        assert_eq!(iteration_base("out/run", 4, 10), "out/run_iter004");
        assert_eq!(snapshot_path("a", OutputFormat::MessagePack), PathBuf::from("a_snapshots.msgpack"));
    }

    #[test]
    fn json_snapshots_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sim").to_string_lossy().into_owned();
        let written = vec![snapshot(1, 4), snapshot(2, 5)];
        let path = save_snapshots(&base, OutputFormat::Json, &written).unwrap();
        let read: Vec<Snapshot> = serde_json::from_reader(File::open(path).unwrap()).unwrap();
        assert_eq!(read, written);
    }

    #[test]
    fn history_rows_leave_unrecorded_cycles_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        save_history_csv(&path, &report()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "cycle,cell_count,divisions,deaths,driver_mutations");
        assert_eq!(lines[1], "0,8,,,");
        assert_eq!(lines[3], "2,10,2,0,1");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn summary_names_the_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        save_summary_json(&path, &report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["reason"], "max_cycles");
        assert_eq!(value["total_cells"], 11);
    }
}
