use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::error::AlignError;
use crate::xcorr::{PairwiseMeasurementSet, PeakCandidate};

/// Solver knobs carried through the session option surface.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SolverOptions {
    /// Cap on candidate-selection sweeps.
    pub max_iterations: usize,
    /// Candidates below this absolute coefficient are ignored.
    pub min_coefficient: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 10,
            min_coefficient: 0.0,
        }
    }
}

impl SolverOptions {
    /// Apply one option pair if the key belongs to the solver. Returns
    /// `false` for keys owned by other components. Values are checked here
    /// so a bad value fails during configuration, before any stage runs.
    pub fn apply_pair(&mut self, key: &str, value: &str) -> Result<bool, AlignError> {
        match key {
            "solvermaxiterations" => {
                let parsed: usize = value.parse().map_err(|_| {
                    AlignError::invalid_option(key, format!("'{}' is not an integer", value))
                })?;
                if parsed == 0 {
                    return Err(AlignError::invalid_option(key, "must be at least 1"));
                }
                self.max_iterations = parsed;
                Ok(true)
            }
            "solvermincoefficient" => {
                let parsed: f64 = value.parse().map_err(|_| {
                    AlignError::invalid_option(key, format!("'{}' is not a number", value))
                })?;
                if !(0.0..1.0).contains(&parsed) {
                    return Err(AlignError::invalid_option(key, "must lie in [0, 1)"));
                }
                self.min_coefficient = parsed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn validate(&self) -> Result<(), AlignError> {
        if self.max_iterations == 0 {
            return Err(AlignError::InvalidConfig(
                "solver iteration cap must be at least 1".into(),
            ));
        }
        if !(self.min_coefficient.is_finite() && (0.0..1.0).contains(&self.min_coefficient)) {
            return Err(AlignError::InvalidConfig(format!(
                "solver coefficient floor {} outside [0, 1)",
                self.min_coefficient
            )));
        }
        Ok(())
    }
}

/// The fitted network: one correction per record plus quality measures.
#[derive(Clone, Debug, Serialize)]
pub struct Solution {
    /// Relative time correction per record, in seconds, zero mean.
    pub corrections: Vec<f64>,
    /// Residual-based error estimate per record, in seconds.
    pub errors: Vec<f64>,
    /// Resolved sign per record, +1 or -1.
    pub polarities: Vec<i8>,
    pub mean: f64,
    pub std_dev: f64,
    /// Disjoint internally-connected subgroups in the measurement graph.
    pub cluster_count: usize,
    /// Chosen measurements whose sign disagrees with the resolved record
    /// polarities. Reported, never fatal.
    pub polarity_conflicts: usize,
    /// Candidate-selection sweeps actually run.
    pub sweeps: usize,
}

// One usable edge of the measurement graph: the surviving candidates of a
// pair plus the index of the currently chosen one.
struct Edge {
    i: usize,
    j: usize,
    candidates: Vec<(usize, PeakCandidate)>,
    chosen: usize,
}

impl Edge {
    fn pick(&self) -> &PeakCandidate {
        &self.candidates[self.chosen].1
    }

    fn weight(&self) -> f64 {
        let c = self.pick().coeff;
        (c * c).max(1e-6)
    }

    fn sign(&self) -> i8 {
        self.pick().sign()
    }
}

fn initial_pick(candidates: &[(usize, PeakCandidate)]) -> usize {
    let mut best = 0;
    for (idx, (_, cand)) in candidates.iter().enumerate().skip(1) {
        let current = &candidates[best].1;
        let order = cand
            .coeff
            .abs()
            .partial_cmp(&current.coeff.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                current
                    .lag
                    .abs()
                    .partial_cmp(&cand.lag.abs())
                    .unwrap_or(Ordering::Equal)
            });
        if order == Ordering::Greater {
            best = idx;
        }
    }
    best
}

// Signed difference t_y - t_x implied by the chosen candidate of the edge
// between x and y.
fn directed_lag(edges: &[Edge], index: &BTreeMap<(usize, usize), usize>, x: usize, y: usize) -> f64 {
    if x < y {
        edges[index[&(x, y)]].pick().lag
    } else {
        -edges[index[&(y, x)]].pick().lag
    }
}

fn edge_weight(edges: &[Edge], index: &BTreeMap<(usize, usize), usize>, x: usize, y: usize) -> f64 {
    let key = if x < y { (x, y) } else { (y, x) };
    edges[index[&key]].weight()
}

/// Re-pick candidates against triangle closures through common neighbours
/// until a sweep changes nothing or the iteration cap is hit. Returns the
/// number of sweeps run.
fn select_candidates(
    edges: &mut [Edge],
    index: &BTreeMap<(usize, usize), usize>,
    adjacency: &BTreeMap<usize, BTreeSet<usize>>,
    max_iterations: usize,
) -> usize {
    let mut sweeps = 0;
    while sweeps < max_iterations {
        sweeps += 1;
        let mut changed = false;
        for e in 0..edges.len() {
            let (i, j) = (edges[e].i, edges[e].j);
            // Closure estimates of t_j - t_i through every common neighbour.
            let mut estimates: Vec<(f64, f64)> = Vec::new();
            if let (Some(ni), Some(nj)) = (adjacency.get(&i), adjacency.get(&j)) {
                for &k in ni.intersection(nj) {
                    let est = directed_lag(edges, index, i, k) + directed_lag(edges, index, k, j);
                    let w = edge_weight(edges, index, i, k).min(edge_weight(edges, index, k, j));
                    if w > 0.0 {
                        estimates.push((est, w));
                    }
                }
            }
            if estimates.is_empty() {
                continue;
            }
            let wsum: f64 = estimates.iter().map(|(_, w)| w).sum();
            let mut ranked: Vec<(usize, f64)> = edges[e]
                .candidates
                .iter()
                .enumerate()
                .map(|(c, (_, cand))| {
                    let misfit: f64 = estimates
                        .iter()
                        .map(|(est, w)| w * (cand.lag - est) * (cand.lag - est))
                        .sum::<f64>()
                        / wsum;
                    (c, misfit)
                })
                .collect();
            ranked.sort_by(|a, b| {
                let ca = &edges[e].candidates[a.0].1;
                let cb = &edges[e].candidates[b.0].1;
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        cb.coeff
                            .abs()
                            .partial_cmp(&ca.coeff.abs())
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| {
                        ca.lag
                            .abs()
                            .partial_cmp(&cb.lag.abs())
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| ca.lag.partial_cmp(&cb.lag).unwrap_or(Ordering::Equal))
            });
            let winner = ranked[0].0;
            if winner != edges[e].chosen {
                edges[e].chosen = winner;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    sweeps
}

// Components of the measurement graph, BFS in ascending index order.
fn components(adjacency: &BTreeMap<usize, BTreeSet<usize>>) -> Vec<Vec<usize>> {
    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut out = Vec::new();
    for &root in adjacency.keys() {
        if seen.contains(&root) {
            continue;
        }
        let mut members = Vec::new();
        let mut queue = VecDeque::from([root]);
        seen.insert(root);
        while let Some(v) = queue.pop_front() {
            members.push(v);
            for &next in &adjacency[&v] {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        members.sort_unstable();
        out.push(members);
    }
    out
}

fn resolve_polarities(
    n_records: usize,
    edges: &[Edge],
    index: &BTreeMap<(usize, usize), usize>,
    adjacency: &BTreeMap<usize, BTreeSet<usize>>,
    groups: &[Vec<usize>],
) -> (Vec<i8>, usize) {
    let mut polarity = vec![1i8; n_records];
    let mut in_tree: BTreeSet<(usize, usize)> = BTreeSet::new();
    for group in groups {
        let root = group[0];
        let mut seen: BTreeSet<usize> = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(v) = queue.pop_front() {
            for &next in &adjacency[&v] {
                if seen.insert(next) {
                    let key = if v < next { (v, next) } else { (next, v) };
                    polarity[next] = polarity[v] * edges[index[&key]].sign();
                    in_tree.insert(key);
                    queue.push_back(next);
                }
            }
        }
    }
    let conflicts = edges
        .iter()
        .filter(|e| !in_tree.contains(&(e.i, e.j)))
        .filter(|e| e.sign() != polarity[e.i] * polarity[e.j])
        .count();
    (polarity, conflicts)
}

/// Fit the pairwise-difference system, resolving candidate ambiguity and
/// polarity first. Also returns the measurement set with each pair's chosen
/// candidate moved to the front, nothing dropped.
pub fn solve(
    n_records: usize,
    measurements: &PairwiseMeasurementSet,
    options: &SolverOptions,
) -> Result<(Solution, PairwiseMeasurementSet), AlignError> {
    options.validate()?;

    // Drop candidates under the coefficient floor; a pair with none left
    // contributes no edge.
    let mut edges: Vec<Edge> = Vec::new();
    for (&(i, j), pair) in &measurements.pairs {
        let surviving: Vec<(usize, PeakCandidate)> = pair
            .candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.coeff.abs() >= options.min_coefficient)
            .map(|(idx, c)| (idx, *c))
            .collect();
        if surviving.is_empty() {
            continue;
        }
        let chosen = initial_pick(&surviving);
        edges.push(Edge {
            i,
            j,
            candidates: surviving,
            chosen,
        });
    }
    if edges.is_empty() {
        return Err(AlignError::UnderdeterminedSystem(
            "no record pair is connected by a usable measurement".into(),
        ));
    }

    let mut index: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut adjacency: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (e, edge) in edges.iter().enumerate() {
        index.insert((edge.i, edge.j), e);
        adjacency.entry(edge.i).or_default().insert(edge.j);
        adjacency.entry(edge.j).or_default().insert(edge.i);
    }

    let groups = components(&adjacency);
    let cluster_count = groups.len();
    println!(
        "[info] solver: {} measurements over {} of {} records, {} cluster(s)",
        edges.len(),
        adjacency.len(),
        n_records,
        cluster_count
    );
    if adjacency.len() < n_records {
        println!(
            "[warn] {} record(s) carry no measurement and keep zero correction",
            n_records - adjacency.len()
        );
    }

    let sweeps = select_candidates(&mut edges, &index, &adjacency, options.max_iterations);
    if sweeps == options.max_iterations && options.max_iterations > 1 {
        println!(
            "[warn] candidate selection stopped at the iteration cap ({})",
            options.max_iterations
        );
    } else {
        println!("[info] candidate selection settled after {} sweep(s)", sweeps);
    }

    let (polarities, polarity_conflicts) =
        resolve_polarities(n_records, &edges, &index, &adjacency, &groups);
    if polarity_conflicts > 0 {
        println!(
            "[warn] inconsistent polarity: {} chosen measurement(s) disagree with the resolved signs",
            polarity_conflicts
        );
    }
    let flipped = polarities.iter().filter(|&&p| p < 0).count();
    if flipped > 0 {
        println!("[info] polarity: {} record(s) resolved as inverted", flipped);
    }

    // Weighted least squares per component with one zero-sum gauge row,
    // then an exact de-mean of the component.
    let mut corrections = vec![0.0; n_records];
    for group in &groups {
        let local: BTreeMap<usize, usize> = group
            .iter()
            .enumerate()
            .map(|(local_idx, &global)| (global, local_idx))
            .collect();
        let rows: Vec<&Edge> = edges
            .iter()
            .filter(|e| local.contains_key(&e.i))
            .collect();
        let nv = group.len();
        let mut a = DMatrix::zeros(rows.len() + 1, nv);
        let mut b = DVector::zeros(rows.len() + 1);
        for (r, edge) in rows.iter().enumerate() {
            let sw = edge.weight().sqrt();
            a[(r, local[&edge.i])] = -sw;
            a[(r, local[&edge.j])] = sw;
            b[r] = sw * edge.pick().lag;
        }
        for c in 0..nv {
            a[(rows.len(), c)] = 1.0;
        }
        let svd = a.svd(true, true);
        let x = svd
            .solve(&b, 1.0e-12)
            .map_err(|e| AlignError::UnderdeterminedSystem(e.to_string()))?;
        let mean = x.iter().sum::<f64>() / nv as f64;
        for (&global, &local_idx) in &local {
            corrections[global] = x[local_idx] - mean;
        }
    }

    // Per-record error from the residual disagreement of its own chosen
    // observations, with a small-sample degree correction.
    let mut wsum = vec![0.0; n_records];
    let mut rsum = vec![0.0; n_records];
    let mut degree = vec![0usize; n_records];
    for edge in &edges {
        let res = edge.pick().lag - (corrections[edge.j] - corrections[edge.i]);
        let w = edge.weight();
        for v in [edge.i, edge.j] {
            wsum[v] += w;
            rsum[v] += w * res * res;
            degree[v] += 1;
        }
    }
    let errors: Vec<f64> = (0..n_records)
        .map(|v| {
            if degree[v] == 0 || wsum[v] <= 0.0 {
                0.0
            } else {
                let correction = degree[v] as f64 / (degree[v].saturating_sub(1).max(1)) as f64;
                (rsum[v] / wsum[v] * correction).sqrt()
            }
        })
        .collect();

    let mean = corrections.iter().sum::<f64>() / n_records.max(1) as f64;
    let std_dev = (corrections
        .iter()
        .map(|c| (c - mean) * (c - mean))
        .sum::<f64>()
        / n_records.max(1) as f64)
        .sqrt();

    // Promote each chosen candidate to the front of its raw pair.
    let mut reordered = measurements.clone();
    for edge in &edges {
        let original = edge.candidates[edge.chosen].0;
        if let Some(pair) = reordered.pairs.get_mut(&(edge.i, edge.j)) {
            if original > 0 && original < pair.candidates.len() {
                let chosen = pair.candidates.remove(original);
                pair.candidates.insert(0, chosen);
            }
        }
    }

    Ok((
        Solution {
            corrections,
            errors,
            polarities,
            mean,
            std_dev,
            cluster_count,
            polarity_conflicts,
            sweeps,
        },
        reordered,
    ))
}

#[cfg(test)]
mod tests {
    use super::{solve, SolverOptions};
    use crate::xcorr::{PairMeasurement, PairwiseMeasurementSet, PeakCandidate};

    fn measurement_set(pairs: &[((usize, usize), &[(f64, f64)])]) -> PairwiseMeasurementSet {
        let mut set = PairwiseMeasurementSet::default();
        for ((i, j), candidates) in pairs {
            set.pairs.insert(
                (*i, *j),
                PairMeasurement {
                    candidates: candidates
                        .iter()
                        .map(|&(lag, coeff)| PeakCandidate { lag, coeff })
                        .collect(),
                    positive_only: false,
                    overlap: 100,
                },
            );
        }
        set
    }

    #[test]
    fn three_records_recover_known_shifts() {
        // True relative shifts {0, +2, +5}.
        let set = measurement_set(&[
            ((0, 1), &[(2.0, 0.9)]),
            ((0, 2), &[(5.0, 0.8)]),
            ((1, 2), &[(3.0, 0.85)]),
        ]);
        let (solution, _) = solve(3, &set, &SolverOptions::default()).unwrap();
        let c = &solution.corrections;
        assert!((c[1] - c[0] - 2.0).abs() < 1e-9);
        assert!((c[2] - c[0] - 5.0).abs() < 1e-9);
        assert!((c[2] - c[1] - 3.0).abs() < 1e-9);
        assert!(solution.mean.abs() < 1e-12);
        assert!(c.iter().sum::<f64>().abs() < 1e-9);
        assert_eq!(solution.cluster_count, 1);
        assert_eq!(solution.polarity_conflicts, 0);
        assert!(solution.errors.iter().all(|e| e.abs() < 1e-9));
    }

    #[test]
    fn disjoint_subsets_produce_two_clusters() {
        let set = measurement_set(&[((0, 1), &[(1.0, 0.9)]), ((2, 3), &[(2.0, 0.9)])]);
        let (solution, _) = solve(4, &set, &SolverOptions::default()).unwrap();
        assert_eq!(solution.cluster_count, 2);
        let c = &solution.corrections;
        assert!((c[1] - c[0] - 1.0).abs() < 1e-9);
        assert!((c[3] - c[2] - 2.0).abs() < 1e-9);
        // Each component is de-meaned on its own.
        assert!((c[0] + c[1]).abs() < 1e-9);
        assert!((c[2] + c[3]).abs() < 1e-9);
        assert!(solution.mean.abs() < 1e-12);
    }

    #[test]
    fn ambiguous_peak_resolved_by_network() {
        // The strongest candidate of pair (0,1) is a cycle-skipped 7.0; the
        // closure through record 2 (5.0 - 3.0 = 2.0) identifies the true one.
        let set = measurement_set(&[
            ((0, 1), &[(7.0, 0.9), (2.0, 0.8)]),
            ((0, 2), &[(5.0, 0.9)]),
            ((1, 2), &[(3.0, 0.9)]),
        ]);
        let (solution, reordered) = solve(3, &set, &SolverOptions::default()).unwrap();
        let c = &solution.corrections;
        assert!((c[1] - c[0] - 2.0).abs() < 1e-9, "kept the wrong peak");
        assert_eq!(solution.sweeps, 2);
        // The chosen candidate leads the reordered pair, nothing dropped.
        let pair = &reordered.pairs[&(0, 1)];
        assert_eq!(pair.candidates.len(), 2);
        assert_eq!(pair.candidates[0].lag, 2.0);
        assert_eq!(pair.candidates[1].lag, 7.0);
    }

    #[test]
    fn inverted_record_gets_negative_polarity() {
        let set = measurement_set(&[
            ((0, 1), &[(2.0, -0.9)]),
            ((0, 2), &[(5.0, 0.8)]),
            ((1, 2), &[(3.0, -0.85)]),
        ]);
        let (solution, _) = solve(3, &set, &SolverOptions::default()).unwrap();
        assert_eq!(solution.polarities, vec![1, -1, 1]);
        assert_eq!(solution.polarity_conflicts, 0);
        // Lags are unaffected by the sign resolution.
        let c = &solution.corrections;
        assert!((c[2] - c[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn polarity_conflict_is_counted_not_fatal() {
        // An odd sign cycle cannot be made consistent.
        let set = measurement_set(&[
            ((0, 1), &[(2.0, -0.9)]),
            ((0, 2), &[(5.0, -0.8)]),
            ((1, 2), &[(3.0, -0.85)]),
        ]);
        let (solution, _) = solve(3, &set, &SolverOptions::default()).unwrap();
        assert_eq!(solution.polarity_conflicts, 1);
    }

    #[test]
    fn empty_network_is_underdetermined() {
        let set = PairwiseMeasurementSet::default();
        let err = solve(3, &set, &SolverOptions::default()).unwrap_err();
        assert!(err.to_string().contains("usable measurement"));
    }

    #[test]
    fn coefficient_floor_can_empty_the_network() {
        let set = measurement_set(&[((0, 1), &[(2.0, 0.1)])]);
        let options = SolverOptions {
            min_coefficient: 0.5,
            ..SolverOptions::default()
        };
        assert!(solve(2, &set, &options).is_err());
    }

    #[test]
    fn unmeasured_record_keeps_zero_correction() {
        let set = measurement_set(&[((0, 1), &[(2.0, 0.9)])]);
        let (solution, _) = solve(3, &set, &SolverOptions::default()).unwrap();
        assert_eq!(solution.cluster_count, 1);
        assert_eq!(solution.corrections[2], 0.0);
        assert_eq!(solution.errors[2], 0.0);
        assert_eq!(solution.polarities[2], 1);
    }

    #[test]
    fn invalid_options_rejected_at_solve_time() {
        let set = measurement_set(&[((0, 1), &[(2.0, 0.9)])]);
        let zero_iter = SolverOptions {
            max_iterations: 0,
            ..SolverOptions::default()
        };
        assert!(solve(2, &set, &zero_iter).is_err());

        let bad_floor = SolverOptions {
            min_coefficient: 1.0,
            ..SolverOptions::default()
        };
        assert!(solve(2, &set, &bad_floor).is_err());
    }

    #[test]
    fn option_pairs_apply_and_validate() {
        let mut options = SolverOptions::default();
        assert!(options.apply_pair("solvermaxiterations", "3").unwrap());
        assert_eq!(options.max_iterations, 3);
        assert!(options.apply_pair("solvermincoefficient", "0.25").unwrap());
        assert_eq!(options.min_coefficient, 0.25);

        // Keys owned elsewhere fall through untouched.
        assert!(!options.apply_pair("peakcount", "4").unwrap());

        assert!(options.apply_pair("solvermaxiterations", "zero").is_err());
        assert!(options.apply_pair("solvermaxiterations", "0").is_err());
        assert!(options.apply_pair("solvermincoefficient", "1.5").is_err());
    }
}
