use crate::work_unit::{WorkUnit, WorkerId};
use anyhow::Result;
use cellsim_common::{BalanceStrategyKind, SimParams};
use log::{debug, error, trace};

/// Ties between fractional remainders closer than this go to the lower worker id.
const REMAINDER_EPSILON: f64 = 1e-9;

/// Read-only view of a unit that strategies plan from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitLoad {
    pub id: WorkerId,
    pub size: usize,
    /// Seconds per cell measured in the unit's last busy cycle.
    pub cost_per_cell: Option<f64>,
    pub growth_rate: f64,
}

impl UnitLoad {
    pub fn of(unit: &WorkUnit) -> Self {
        Self {
            id: unit.id,
            size: unit.len(),
            cost_per_cell: unit.last_throughput().and_then(|t| t.cost_per_cell()),
            growth_rate: unit.last_growth_rate(),
        }
    }
}

/// "Move `count` cells from the unit at position `from` to the unit at position `to`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: usize,
    pub to: usize,
    pub count: usize,
}

/// Which policy to apply, with its tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BalanceStrategy {
    /// Never moves anything.
    Empty,
    /// Sizes end up within one cell of each other; lowest ids take the remainder.
    EqualizeCount,
    /// Sizes proportional to measured throughput (cells per second).
    DutyRatio { tolerance: f64, smoothing: f64 },
    /// Like `DutyRatio`, additionally discounting units that are growing fast.
    DutyGain { tolerance: f64, smoothing: f64, gain: f64 },
}

impl BalanceStrategy {
    pub fn from_params(params: &SimParams) -> Self {
        match params.strategy {
            BalanceStrategyKind::Empty => BalanceStrategy::Empty,
            BalanceStrategyKind::EqualizeCount => BalanceStrategy::EqualizeCount,
            BalanceStrategyKind::DutyRatio => BalanceStrategy::DutyRatio {
                tolerance: params.balance_tolerance,
                smoothing: params.balance_smoothing,
            },
            BalanceStrategyKind::DutyGain => BalanceStrategy::DutyGain {
                tolerance: params.balance_tolerance,
                smoothing: params.balance_smoothing,
                gain: params.balance_gain,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BalanceStrategy::Empty => "empty",
            BalanceStrategy::EqualizeCount => "equalize_count",
            BalanceStrategy::DutyRatio { .. } => "duty_ratio",
            BalanceStrategy::DutyGain { .. } => "duty_gain",
        }
    }
}

/// Outcome of one balancing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub transfers: usize,
    pub moved_cells: usize,
}

/// Redistributes cells between work units.
///
/// Only ever called from the barrier action, so it has exclusive access to
/// every unit. Its own state is the smoothed per-cell cost of each worker.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    /// EMA of seconds-per-cell, indexed by worker id.
    smoothed_cost: Vec<Option<f64>>,
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self { strategy, smoothed_cost: Vec::new() }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Computes the transfers for the given loads without touching any unit.
    pub fn plan(&mut self, loads: &[UnitLoad]) -> Vec<Transfer> {
        if loads.len() < 2 {
            return Vec::new();
        }
        let sizes: Vec<usize> = loads.iter().map(|l| l.size).collect();
        let total: usize = sizes.iter().sum();

        let targets = match self.strategy {
            BalanceStrategy::Empty => return Vec::new(),
            BalanceStrategy::EqualizeCount => equal_targets(total, loads.len()),
            BalanceStrategy::DutyRatio { tolerance, smoothing } => {
                let weights = self.throughput_weights(loads, smoothing, 0.0);
                let targets = apportion(total, &weights);
                if within_tolerance(&sizes, &targets, tolerance) {
                    return Vec::new();
                }
                targets
            }
            BalanceStrategy::DutyGain { tolerance, smoothing, gain } => {
                let weights = self.throughput_weights(loads, smoothing, gain);
                let targets = apportion(total, &weights);
                if within_tolerance(&sizes, &targets, tolerance) {
                    return Vec::new();
                }
                targets
            }
        };

        trace!("Balancing {:?} towards {:?} ({})", sizes, targets, self.strategy.name());
        plan_transfers(&sizes, &targets)
    }

    /// Plans and applies one balancing pass. Units must be passed in worker-id order.
    pub fn rebalance(&mut self, units: &mut [&mut WorkUnit]) -> Result<BalanceReport> {
        if units.len() < 2 {
            return Ok(BalanceReport::default());
        }
        let loads: Vec<UnitLoad> = units.iter().map(|u| UnitLoad::of(u)).collect();
        let total_before: usize = loads.iter().map(|l| l.size).sum();

        let transfers = self.plan(&loads);
        let mut report = BalanceReport::default();
        for transfer in &transfers {
            report.moved_cells += apply_transfer(units, *transfer)?;
            report.transfers += 1;
        }

        let total_after: usize = units.iter().map(|u| u.len()).sum();
        debug_assert_eq!(total_before, total_after, "balancing changed the total population");
        if total_before != total_after {
            error!(
                "Conservation violated by {} balancer: {} cells before, {} after.",
                self.strategy.name(),
                total_before,
                total_after
            );
            anyhow::bail!("load balancer changed total population from {} to {}", total_before, total_after);
        }

        if report.moved_cells > 0 {
            debug!(
                "Balancer ({}) moved {} cells in {} transfers.",
                self.strategy.name(),
                report.moved_cells,
                report.transfers
            );
        }
        Ok(report)
    }

    /// Throughput weight per unit, `1 / cost`, with the EMA updated from the new samples.
    /// Units without any cost estimate get the mean of the known weights.
    fn throughput_weights(&mut self, loads: &[UnitLoad], smoothing: f64, gain: f64) -> Vec<f64> {
        let max_id = loads.iter().map(|l| l.id).max().unwrap_or(0);
        if self.smoothed_cost.len() <= max_id {
            self.smoothed_cost.resize(max_id + 1, None);
        }

        let mut weights: Vec<Option<f64>> = Vec::with_capacity(loads.len());
        for load in loads {
            let slot = &mut self.smoothed_cost[load.id];
            if let Some(sample) = load.cost_per_cell {
                *slot = Some(match *slot {
                    Some(prev) => smoothing * sample + (1.0 - smoothing) * prev,
                    None => sample,
                });
            }
            let weight = slot.filter(|c| *c > 0.0).map(|cost| {
                let growth_penalty = 1.0 + gain * load.growth_rate.max(0.0);
                1.0 / (cost * growth_penalty)
            });
            weights.push(weight);
        }

        let known: Vec<f64> = weights.iter().flatten().copied().filter(|w| w.is_finite()).collect();
        if known.is_empty() {
            return vec![1.0; loads.len()];
        }
        let fallback = known.iter().sum::<f64>() / known.len() as f64;
        weights
            .into_iter()
            .map(|w| w.filter(|w| w.is_finite()).unwrap_or(fallback))
            .collect()
    }
}

/// Moves cells off the donor's tail onto the receiver. Returns how many moved.
fn apply_transfer(units: &mut [&mut WorkUnit], transfer: Transfer) -> Result<usize> {
    let Transfer { from, to, count } = transfer;
    if from == to || count == 0 {
        return Ok(0);
    }
    if from >= units.len() || to >= units.len() {
        anyhow::bail!("transfer {:?} references a unit outside 0..{}", transfer, units.len());
    }

    let donor_len = units[from].population.len();
    let count = if count > donor_len {
        error!(
            "Transfer of {} cells from worker {} exceeds its size {}. Clamping.",
            count, units[from].id, donor_len
        );
        donor_len
    } else {
        count
    };

    let moved = units[from].population.split_off(donor_len - count);
    units[to].population.extend(moved);
    Ok(count)
}

/// `total / k` each, the remainder one each to the lowest positions.
pub fn equal_targets(total: usize, k: usize) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }
    let base = total / k;
    let remainder = total % k;
    (0..k).map(|i| base + usize::from(i < remainder)).collect()
}

/// Largest-remainder apportionment of `total` by `weights`; ties go to the lowest position.
/// Non-positive or non-finite weight sums fall back to equal shares.
pub fn apportion(total: usize, weights: &[f64]) -> Vec<usize> {
    let k = weights.len();
    let weight_sum: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if k == 0 || !(weight_sum.is_finite() && weight_sum > 0.0) {
        return equal_targets(total, k);
    }

    let quotas: Vec<f64> = weights.iter().map(|w| total as f64 * w.max(0.0) / weight_sum).collect();
    let mut targets: Vec<usize> = quotas.iter().map(|q| (q.floor() as usize).min(total)).collect();
    let assigned: usize = targets.iter().sum();

    if assigned > total {
        // Floating point pushed the floors over; start again from equal shares.
        return equal_targets(total, k);
    }

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| {
        let ra = quotas[a] - quotas[a].floor();
        let rb = quotas[b] - quotas[b].floor();
        if (ra - rb).abs() <= REMAINDER_EPSILON {
            a.cmp(&b)
        } else {
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    for &i in order.iter().cycle().take(total - assigned) {
        targets[i] += 1;
    }
    targets
}

/// Matches surplus positions to deficit positions in ascending order.
pub fn plan_transfers(sizes: &[usize], targets: &[usize]) -> Vec<Transfer> {
    debug_assert_eq!(sizes.len(), targets.len());
    debug_assert_eq!(sizes.iter().sum::<usize>(), targets.iter().sum::<usize>());

    let mut surplus: Vec<(usize, usize)> = sizes
        .iter()
        .zip(targets)
        .enumerate()
        .filter(|(_, (s, t))| s > t)
        .map(|(i, (s, t))| (i, s - t))
        .collect();
    let mut deficit: Vec<(usize, usize)> = sizes
        .iter()
        .zip(targets)
        .enumerate()
        .filter(|(_, (s, t))| s < t)
        .map(|(i, (s, t))| (i, t - s))
        .collect();

    let mut transfers = Vec::new();
    let (mut si, mut di) = (0, 0);
    while si < surplus.len() && di < deficit.len() {
        let count = surplus[si].1.min(deficit[di].1);
        transfers.push(Transfer { from: surplus[si].0, to: deficit[di].0, count });
        surplus[si].1 -= count;
        deficit[di].1 -= count;
        if surplus[si].1 == 0 {
            si += 1;
        }
        if deficit[di].1 == 0 {
            di += 1;
        }
    }
    transfers
}

/// True when no unit is further from its target than `tolerance * mean size`.
fn within_tolerance(sizes: &[usize], targets: &[usize], tolerance: f64) -> bool {
    let total: usize = sizes.iter().sum();
    if total == 0 {
        return true;
    }
    let mean = total as f64 / sizes.len() as f64;
    let worst = sizes
        .iter()
        .zip(targets)
        .map(|(&s, &t)| (s as f64 - t as f64).abs())
        .fold(0.0, f64::max);
    worst / mean < tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::work_unit::Throughput;
    use std::time::Duration;

    fn units_with_sizes(sizes: &[usize]) -> Vec<WorkUnit> {
        sizes
            .iter()
            .enumerate()
            .map(|(id, &n)| WorkUnit::new(id, vec![Cell::founder(0); n], 0))
            .collect()
    }

    fn sizes(units: &[WorkUnit]) -> Vec<usize> {
        units.iter().map(|u| u.len()).collect()
    }

    fn rebalance(balancer: &mut LoadBalancer, units: &mut [WorkUnit]) -> BalanceReport {
        let mut refs: Vec<&mut WorkUnit> = units.iter_mut().collect();
        balancer.rebalance(&mut refs).unwrap()
    }

    fn all_strategies() -> Vec<BalanceStrategy> {
        vec![
            BalanceStrategy::Empty,
            BalanceStrategy::EqualizeCount,
            BalanceStrategy::DutyRatio { tolerance: 0.0, smoothing: 0.5 },
            BalanceStrategy::DutyGain { tolerance: 0.0, smoothing: 0.5, gain: 1.0 },
        ]
    }

    #[test]
    fn equalize_count_matches_reference_scenario() {
        let mut units = units_with_sizes(&[60, 25, 25, 25]);
        let mut balancer = LoadBalancer::new(BalanceStrategy::EqualizeCount);
        let report = rebalance(&mut balancer, &mut units);
        assert_eq!(sizes(&units), vec![34, 34, 34, 33]);
        assert_eq!(report.moved_cells, 26);
    }

    #[test]
    fn equalize_count_is_reproducible() {
        let run = || {
            let mut units = units_with_sizes(&[3, 91, 0, 17, 42]);
            rebalance(&mut LoadBalancer::new(BalanceStrategy::EqualizeCount), &mut units);
            sizes(&units)
        };
        let first = run();
        assert_eq!(first, run());
        let (min, max) = (first.iter().min().unwrap(), first.iter().max().unwrap());
        assert!(max - min <= 1);
    }

    #[test]
    fn every_strategy_conserves_cells() {
        for strategy in all_strategies() {
            let mut units = units_with_sizes(&[120, 7, 0, 55, 33, 1]);
            for (i, unit) in units.iter_mut().enumerate() {
                let cells = unit.len().max(1);
                unit.set_benchmark(
                    Some(Throughput { cells, duration: Duration::from_micros(10 + 37 * i as u64) }),
                    0.1 * i as f64,
                );
            }
            let before: usize = sizes(&units).iter().sum();
            let mut balancer = LoadBalancer::new(strategy);
            for _ in 0..3 {
                rebalance(&mut balancer, &mut units);
                assert_eq!(sizes(&units).iter().sum::<usize>(), before, "{}", strategy.name());
            }
        }
    }

    #[test]
    fn zero_or_one_unit_is_a_noop() {
        for strategy in all_strategies() {
            let mut balancer = LoadBalancer::new(strategy);
            let mut none: Vec<WorkUnit> = Vec::new();
            assert_eq!(rebalance(&mut balancer, &mut none), BalanceReport::default());
            let mut one = units_with_sizes(&[9]);
            assert_eq!(rebalance(&mut balancer, &mut one), BalanceReport::default());
            assert_eq!(sizes(&one), vec![9]);
        }
    }

    #[test]
    fn empty_strategy_never_moves() {
        let mut units = units_with_sizes(&[100, 0]);
        rebalance(&mut LoadBalancer::new(BalanceStrategy::Empty), &mut units);
        assert_eq!(sizes(&units), vec![100, 0]);
    }

    #[test]
    fn duty_ratio_gives_faster_units_more_cells() {
        let mut units = units_with_sizes(&[50, 50]);
        // Worker 0 spends 3x as long per cell as worker 1.
        units[0].set_benchmark(Some(Throughput { cells: 50, duration: Duration::from_millis(30) }), 0.0);
        units[1].set_benchmark(Some(Throughput { cells: 50, duration: Duration::from_millis(10) }), 0.0);
        let mut balancer = LoadBalancer::new(BalanceStrategy::DutyRatio { tolerance: 0.0, smoothing: 1.0 });
        rebalance(&mut balancer, &mut units);
        assert_eq!(sizes(&units), vec![25, 75]);
    }

    #[test]
    fn duty_ratio_respects_tolerance() {
        let mut units = units_with_sizes(&[50, 50]);
        units[0].set_benchmark(Some(Throughput { cells: 50, duration: Duration::from_millis(11) }), 0.0);
        units[1].set_benchmark(Some(Throughput { cells: 50, duration: Duration::from_millis(10) }), 0.0);
        let mut balancer = LoadBalancer::new(BalanceStrategy::DutyRatio { tolerance: 0.25, smoothing: 1.0 });
        let report = rebalance(&mut balancer, &mut units);
        assert_eq!(report.moved_cells, 0);
        assert_eq!(sizes(&units), vec![50, 50]);
    }

    #[test]
    fn duty_gain_discounts_growing_units() {
        let mut units = units_with_sizes(&[60, 60]);
        let same = Throughput { cells: 60, duration: Duration::from_millis(10) };
        units[0].set_benchmark(Some(same), 1.0);
        units[1].set_benchmark(Some(same), 0.0);
        let mut balancer = LoadBalancer::new(BalanceStrategy::DutyGain { tolerance: 0.0, smoothing: 1.0, gain: 1.0 });
        rebalance(&mut balancer, &mut units);
        assert_eq!(sizes(&units), vec![40, 80]);
    }

    #[test]
    fn duty_strategies_without_samples_equalize() {
        let mut units = units_with_sizes(&[10, 0, 0]);
        let mut balancer = LoadBalancer::new(BalanceStrategy::DutyRatio { tolerance: 0.0, smoothing: 0.5 });
        rebalance(&mut balancer, &mut units);
        assert_eq!(sizes(&units), vec![4, 3, 3]);
    }

    #[test]
    fn apportion_sums_to_total_and_breaks_ties_low() {
        assert_eq!(apportion(10, &[1.0, 1.0, 1.0]), vec![4, 3, 3]);
        assert_eq!(apportion(7, &[0.0, 0.0]), vec![4, 3]);
        assert_eq!(apportion(100, &[3.0, 1.0]), vec![75, 25]);
        for total in [0usize, 1, 17, 1000] {
            let t = apportion(total, &[0.3, 2.7, 1.1, f64::MIN_POSITIVE]);
            assert_eq!(t.iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn plan_transfers_pairs_in_id_order() {
        let transfers = plan_transfers(&[10, 0, 6, 0], &[4, 4, 4, 4]);
        assert_eq!(
            transfers,
            vec![
                Transfer { from: 0, to: 1, count: 4 },
                Transfer { from: 0, to: 3, count: 2 },
                Transfer { from: 2, to: 3, count: 2 },
            ]
        );
    }
}
