use log::warn;
use std::sync::atomic::{AtomicI64, Ordering};

/// Fixed-length per-cycle counter array, allocated once per run.
#[derive(Debug)]
pub struct History {
    values: Box<[AtomicI64]>,
}

impl History {
    fn new(len: usize) -> Self {
        Self { values: (0..len).map(|_| AtomicI64::new(0)).collect() }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Worker-side update: commutative add into the current cycle's slot.
    #[inline]
    pub fn add(&self, cycle: u32, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.values.get(cycle as usize) {
            Some(slot) => {
                slot.fetch_add(delta, Ordering::Relaxed);
            }
            None => warn!("History index {} out of range (len {}). Dropping delta {}.", cycle, self.values.len(), delta),
        }
    }

    #[inline]
    pub fn get(&self, cycle: u32) -> i64 {
        self.values.get(cycle as usize).map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Barrier-side plain write. Only call while every worker is parked.
    pub fn set(&self, cycle: u32, value: i64) {
        match self.values.get(cycle as usize) {
            Some(slot) => slot.store(value, Ordering::Relaxed),
            None => warn!("History index {} out of range (len {}). Ignoring write.", cycle, self.values.len()),
        }
    }

    /// Barrier-side: seed slot `cycle + 1` with the value of slot `cycle`.
    pub fn copy_forward(&self, cycle: u32) {
        self.set(cycle + 1, self.get(cycle));
    }

    /// Plain copy of slots `0..=up_to`.
    pub fn to_vec(&self, up_to: u32) -> Vec<i64> {
        let end = (up_to as usize + 1).min(self.values.len());
        self.values[..end].iter().map(|slot| slot.load(Ordering::Relaxed)).collect()
    }
}

/// Cross-worker counters, indexed by cycle and sized `max_cycles + 2` up front.
///
/// Access discipline, not enforced by a lock: during a cycle workers only
/// `add` into slot `cycle`; between cycles the barrier action (the only thread
/// running) reads slots and writes slot `cycle + 1`. The barrier's mutex
/// provides the happens-before edge between the two phases, so `Relaxed` is
/// enough on the atomics themselves.
#[derive(Debug)]
pub struct SharedStatistics {
    /// Cumulative population size at the end of each cycle.
    pub cell_count: History,
    /// Cumulative driver mutations acquired.
    pub driver_mutations: History,
    /// Cumulative passenger mutations acquired.
    pub passenger_mutations: History,
    /// Divisions per cycle (not carried forward).
    pub divisions: History,
    /// Deaths per cycle (not carried forward).
    pub deaths: History,
}

impl SharedStatistics {
    pub fn new(max_cycles: u32, initial_cells: u64) -> Self {
        let len = max_cycles as usize + 2;
        let stats = Self {
            cell_count: History::new(len),
            driver_mutations: History::new(len),
            passenger_mutations: History::new(len),
            divisions: History::new(len),
            deaths: History::new(len),
        };
        // Slot 0 is the founding population; cycle 1 starts from the same baseline.
        stats.cell_count.set(0, initial_cells as i64);
        stats.cell_count.set(1, initial_cells as i64);
        stats
    }

    /// Carries the cumulative series into the next cycle's slot.
    pub fn copy_forward(&self, cycle: u32) {
        self.cell_count.copy_forward(cycle);
        self.driver_mutations.copy_forward(cycle);
        self.passenger_mutations.copy_forward(cycle);
    }

    pub fn set_initial_drivers(&self, total_drivers: i64) {
        self.driver_mutations.set(0, total_drivers);
        self.driver_mutations.set(1, total_drivers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sized_for_all_cycles_plus_baseline() {
        let stats = SharedStatistics::new(10, 100);
        assert_eq!(stats.cell_count.len(), 12);
        assert_eq!(stats.cell_count.get(0), 100);
        assert_eq!(stats.cell_count.get(1), 100);
        assert_eq!(stats.cell_count.get(2), 0);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let stats = Arc::new(SharedStatistics::new(4, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        stats.cell_count.add(1, 1);
                        stats.deaths.add(1, -1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.cell_count.get(1), 80_000);
        assert_eq!(stats.deaths.get(1), -80_000);
    }

    #[test]
    fn copy_forward_only_touches_cumulative_series() {
        let stats = SharedStatistics::new(5, 10);
        stats.cell_count.add(1, 5);
        stats.divisions.add(1, 5);
        stats.copy_forward(1);
        assert_eq!(stats.cell_count.get(2), 15);
        assert_eq!(stats.divisions.get(2), 0);
    }

    #[test]
    fn out_of_range_access_is_ignored() {
        let stats = SharedStatistics::new(1, 1);
        stats.cell_count.add(99, 1);
        stats.cell_count.set(99, 1);
        assert_eq!(stats.cell_count.get(99), 0);
        assert_eq!(stats.cell_count.to_vec(99).len(), 3);
    }
}
