use faer::{Mat, MatRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::hint::black_box;
use std::time::Instant;
use thousands::*;

use crate::mrpt::{count_first_leaf_indices_all, MrptIndex};
use crate::projection::ProjectionMatrix;

/////////////
// Helpers //
/////////////

/// One point of the parameter lattice
///
/// A full query configuration together with its estimated cost and recall.
/// The empty value (n_trees = 0) is the infeasibility sentinel returned
/// when no configuration reaches a target recall.
///
/// ### Fields
///
/// * `n_trees` - Trees used at query time
/// * `depth` - Evaluation depth of the trees
/// * `votes` - Vote threshold for election
/// * `estimated_qtime` - Estimated query latency in seconds
/// * `estimated_recall` - Estimated recall at k, in [0, 1]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Parameters {
    pub n_trees: usize,
    pub depth: usize,
    pub votes: usize,
    pub estimated_qtime: f64,
    pub estimated_recall: f64,
}

impl Parameters {
    /// Whether this is the infeasibility sentinel
    pub fn is_empty(&self) -> bool {
        self.n_trees == 0
    }
}

/// Profiling results stored by `autotune`
///
/// ### Fields
///
/// * `depth_min` - Smallest profiled evaluation depth
/// * `votes_max` - Largest profiled vote threshold
/// * `recalls` - Per depth, a votes_max x n_trees matrix of estimated
///   recall at (vote threshold, tree count)
/// * `cs_sizes` - Per depth, the matching estimated candidate-set sizes
/// * `beta_projection` - Theil-Sen fit of projection time vs pool size
/// * `beta_voting` - Per depth, fits of voting time vs tree count keyed by
///   profiled vote threshold
/// * `beta_exact` - Theil-Sen fit of exact-ranking time vs candidate count
/// * `opt_pars` - The recall/latency Pareto frontier, ascending in both
pub struct TunerStats {
    pub(crate) depth_min: usize,
    pub(crate) votes_max: usize,
    pub(crate) recalls: Vec<Mat<f64>>,
    pub(crate) cs_sizes: Vec<Mat<f64>>,
    pub(crate) beta_projection: (f64, f64),
    pub(crate) beta_voting: Vec<BTreeMap<usize, (f64, f64)>>,
    pub(crate) beta_exact: (f64, f64),
    pub(crate) opt_pars: Vec<Parameters>,
}

/// Theil-Sen robust linear regression
///
/// Slope = median over the pairwise slopes of all ordered pairs i != j,
/// intercept = median of the residuals under that slope. Both medians use
/// the selection convention of picking the element at index len / 2.
/// Degenerate inputs fall back to a constant fit: a single sample fixes
/// the intercept at its value, no samples yield the zero fit.
///
/// ### Params
///
/// * `x` - Sample abscissae
/// * `y` - Sample ordinates
///
/// ### Returns
///
/// The `(intercept, slope)` pair
pub fn fit_theil_sen(x: &[f64], y: &[f64]) -> (f64, f64) {
    assert_eq!(x.len(), y.len(), "sample lengths differ");
    let n = x.len();

    if n == 0 {
        return (0.0, 0.0);
    }
    if n == 1 {
        return (y[0], 0.0);
    }

    let mut slopes = Vec::with_capacity(n * (n - 1));
    for i in 0..n {
        for j in 0..n {
            if i != j {
                slopes.push((y[j] - y[i]) / (x[j] - x[i]));
            }
        }
    }

    let m = slopes.len();
    let (_, &mut slope, _) = slopes.select_nth_unstable_by(m / 2, |a, b| a.total_cmp(b));

    let mut residuals: Vec<f64> = x
        .iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| yi - slope * xi)
        .collect();
    let (_, &mut intercept, _) = residuals.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b));

    (intercept, slope)
}

fn predict_theil_sen(beta: (f64, f64), x: f64) -> f64 {
    beta.0 + beta.1 * x
}

/// Voting-time fit for a vote threshold
///
/// Returns the fit of the smallest profiled threshold >= v, falling back
/// to the largest profiled one when v lies past the end of the map.
fn voting_beta(beta: &BTreeMap<usize, (f64, f64)>, v: usize) -> Option<(f64, f64)> {
    beta.range(v..)
        .next()
        .map(|(_, &b)| b)
        .or_else(|| beta.iter().next_back().map(|(_, &b)| b))
}

fn col_to_vec(m: MatRef<f32>, j: usize) -> Vec<f32> {
    m.col(j).iter().copied().collect()
}

///////////////
// Autotuner //
///////////////

impl<'a> MrptIndex<'a> {
    /// Profile the forest and assemble the recall/latency Pareto frontier
    ///
    /// Requires a forest grown at the maximum parameter budget: the
    /// profiled lattice covers every (tree count, depth, vote threshold)
    /// combination with trees in [1, n_trees], depths in
    /// [depth_min, depth] and thresholds in [1, min(trees, votes_max)].
    ///
    /// Phase one estimates recall and candidate-set size for the whole
    /// lattice from a single routing pass per test query: every tree is
    /// routed once to full depth while the node reached at every
    /// intermediate depth is recorded, and per-point vote counts are
    /// tallied cumulatively across trees. Ground truth per query is exact.
    /// These estimates are deterministic for a fixed forest and query set.
    ///
    /// Phase two measures the three latency components (projection,
    /// voting, exact ranking) over sampled problem sizes and fits each
    /// series with Theil-Sen regression. Lattice points are then ranked by
    /// estimated query time and the frontier keeps those that strictly
    /// improve recall.
    ///
    /// ### Params
    ///
    /// * `queries` - Held-out test queries, dim rows x n_test columns
    /// * `k` - Neighbour count to tune for
    /// * `depth_min` - Smallest evaluation depth to profile (>= 1)
    /// * `votes_max` - Largest vote threshold to profile
    /// * `verbose` - Print profiling progress
    pub fn autotune(
        &mut self,
        queries: MatRef<f32>,
        k: usize,
        depth_min: usize,
        votes_max: usize,
        verbose: bool,
    ) {
        assert!(!self.is_empty(), "autotune requires a grown forest");
        assert_eq!(queries.nrows(), self.dim, "query dimensionality mismatch");
        let n_test = queries.ncols();
        assert!(n_test >= 1, "autotune requires at least one test query");
        assert!(
            depth_min >= 1 && depth_min <= self.depth,
            "depth_min must lie in [1, depth], got {}",
            depth_min
        );
        assert!(
            votes_max >= 1 && votes_max <= self.n_trees,
            "votes_max must lie in [1, n_trees], got {}",
            votes_max
        );
        assert!(
            k >= 1 && k <= self.n_samples,
            "k must lie in [1, n_samples], got {}",
            k
        );

        let span = self.depth - depth_min + 1;

        // Exact ground truth per test query
        let all: Vec<usize> = (0..self.n_samples).collect();
        let truth: Vec<FxHashSet<usize>> = (0..n_test)
            .into_par_iter()
            .map(|i| {
                let q = col_to_vec(queries, i);
                let (indices, _) = self.exact_knn(&q, k, &all);
                indices
                    .into_iter()
                    .filter(|&v| v >= 0)
                    .map(|v| v as usize)
                    .collect()
            })
            .collect();

        if verbose {
            println!(
                "Computed exact ground truth for {} test queries.",
                n_test.separate_with_underscores()
            );
        }

        let mut recalls: Vec<Mat<f64>> = (0..span)
            .map(|_| Mat::zeros(votes_max, self.n_trees))
            .collect();
        let mut cs_sizes: Vec<Mat<f64>> = (0..span)
            .map(|_| Mat::zeros(votes_max, self.n_trees))
            .collect();

        for i in 0..n_test {
            let q = col_to_vec(queries, i);
            self.count_elected(&q, &truth[i], depth_min, votes_max, &mut recalls, &mut cs_sizes);
        }

        let recall_denom = (k * n_test) as f64;
        let cs_denom = n_test as f64;
        for d in 0..span {
            for t in 0..self.n_trees {
                for v in 0..votes_max {
                    recalls[d][(v, t)] /= recall_denom;
                    cs_sizes[d][(v, t)] /= cs_denom;
                }
            }
        }

        let (beta_projection, beta_voting, beta_exact) =
            self.fit_times(queries, k, depth_min, votes_max, verbose);

        // Estimated query time over the full lattice, then the frontier
        let mut pars = Vec::new();
        for (di, d) in (depth_min..=self.depth).enumerate() {
            for t in 1..=self.n_trees {
                for v in 1..=votes_max.min(t) {
                    let qtime = predict_theil_sen(beta_projection, (t * d) as f64)
                        + voting_beta(&beta_voting[di], v)
                            .map(|b| predict_theil_sen(b, t as f64))
                            .unwrap_or(0.0)
                        + predict_theil_sen(beta_exact, cs_sizes[di][(v - 1, t - 1)]);

                    pars.push(Parameters {
                        n_trees: t,
                        depth: d,
                        votes: v,
                        estimated_qtime: qtime,
                        estimated_recall: recalls[di][(v - 1, t - 1)],
                    });
                }
            }
        }
        pars.sort_by(|a, b| a.estimated_qtime.total_cmp(&b.estimated_qtime));

        let mut opt_pars = Vec::new();
        let mut best_recall = -1.0;
        for par in pars {
            if par.estimated_recall > best_recall {
                best_recall = par.estimated_recall;
                opt_pars.push(par);
            }
        }

        self.stats = Some(TunerStats {
            depth_min,
            votes_max,
            recalls,
            cs_sizes,
            beta_projection,
            beta_voting,
            beta_exact,
            opt_pars,
        });
    }

    /// Tally one test query into the recall and candidate-size matrices
    ///
    /// Routes every tree once to full depth, recording the node reached at
    /// each profiled depth, then accumulates cumulatively across trees:
    /// column t of the per-query matrices equals column t - 1 plus tree
    /// t's contributions. A point reaching its v-th vote in tree t adds
    /// one to the candidate-size cell (v, t) and, when it is a true
    /// neighbour, to the recall cell.
    fn count_elected(
        &self,
        q: &[f32],
        truth: &FxHashSet<usize>,
        depth_min: usize,
        votes_max: usize,
        recalls: &mut [Mat<f64>],
        cs_sizes: &mut [Mat<f64>],
    ) {
        let projected = self.projection.project(q);
        let span = self.depth - depth_min + 1;

        let start_indices: Vec<Vec<usize>> = (0..self.n_trees)
            .into_par_iter()
            .map(|t| {
                let mut found = vec![0_usize; span];
                let mut node = 0_usize;
                for d in 0..self.depth {
                    let j = t * self.depth + d;
                    let left = 2 * node + 1;
                    node = if projected[j] <= self.split_points[t * self.n_array + node] {
                        left
                    } else {
                        left + 1
                    };
                    if d + 1 >= depth_min {
                        found[d + 1 - depth_min] = node + 1 - (1 << (d + 1));
                    }
                }
                found
            })
            .collect();

        for (di, depth_crnt) in (depth_min..=self.depth).enumerate() {
            let leaf_first = &self.leaf_first_indices_all[depth_crnt];
            let mut votes = vec![0_u32; self.n_samples];

            let mut recall_tmp = Mat::<f64>::zeros(votes_max, self.n_trees);
            let mut cs_tmp = Mat::<f64>::zeros(votes_max, self.n_trees);

            for t in 0..self.n_trees {
                if t > 0 {
                    for v in 0..votes_max {
                        recall_tmp[(v, t)] = recall_tmp[(v, t - 1)];
                        cs_tmp[(v, t)] = cs_tmp[(v, t - 1)];
                    }
                }

                let leaf = start_indices[t][di];
                let leaf_begin = leaf_first[leaf];
                let leaf_end = leaf_first[leaf + 1];
                for &idx in &self.tree_leaves[t][leaf_begin..leaf_end] {
                    votes[idx] += 1;
                    let v = votes[idx] as usize;
                    if v <= votes_max {
                        cs_tmp[(v - 1, t)] += 1.0;
                        if truth.contains(&idx) {
                            recall_tmp[(v - 1, t)] += 1.0;
                        }
                    }
                }
            }

            for t in 0..self.n_trees {
                for v in 0..votes_max {
                    recalls[di][(v, t)] += recall_tmp[(v, t)];
                    cs_sizes[di][(v, t)] += cs_tmp[(v, t)];
                }
            }
        }
    }

    /// Measure the latency components and fit them
    ///
    /// Projection time is measured against auxiliary pools at sampled tree
    /// counts, voting time against the real forest per (depth, threshold)
    /// over random test queries, and exact-ranking time against uniformly
    /// drawn candidate sets averaged over repeated trials. Timed results
    /// go through `black_box` so the measured work cannot be elided.
    fn fit_times(
        &self,
        queries: MatRef<f32>,
        k: usize,
        depth_min: usize,
        votes_max: usize,
        verbose: bool,
    ) -> ((f64, f64), Vec<BTreeMap<usize, (f64, f64)>>, (f64, f64)) {
        let n_test = queries.ncols();
        let mut rng = StdRng::from_os_rng();

        // Canonical tree counts merged with evenly spaced ones, clamped to
        // the forest that actually exists
        let mut tested_trees: Vec<usize> = vec![1, 2, 3, 4, 5, 7, 10, 15, 20, 25, 30, 40, 50];
        let n_tested_trees = 10.min(self.n_trees);
        let incr = self.n_trees / n_tested_trees;
        for i in 1..=n_tested_trees {
            let t = i * incr;
            if !tested_trees.contains(&t) {
                tested_trees.push(t);
            }
        }
        tested_trees.retain(|&t| t <= self.n_trees);
        tested_trees.sort_unstable();

        // Projection time vs pool size
        let q0 = col_to_vec(queries, 0);
        let mut projection_x = Vec::new();
        let mut projection_times = Vec::new();
        for d in depth_min..=self.depth {
            for &t in &tested_trees {
                let n_rows = t * d;
                let aux = ProjectionMatrix::new(n_rows, self.dim, self.density, 0);

                let start = Instant::now();
                let projected = aux.project(&q0);
                let elapsed = start.elapsed().as_secs_f64();
                black_box(projected);

                projection_x.push(n_rows as f64);
                projection_times.push(elapsed);
            }
        }

        // The smallest thresholds are always profiled; larger ones are
        // sampled evenly up to votes_max
        let min_all_votes = 5.min(votes_max);
        let mut thresholds: Vec<usize> = (1..=min_all_votes).collect();
        let inc = votes_max / min_all_votes;
        for i in 1..=min_all_votes {
            let v = i * inc;
            if v > min_all_votes {
                thresholds.push(v);
            }
        }

        // Voting time vs tree count, per (depth, threshold)
        let mut beta_voting = Vec::with_capacity(self.depth - depth_min + 1);
        for d in depth_min..=self.depth {
            let mut beta = BTreeMap::new();
            for &v in &thresholds {
                let mut voting_x = Vec::with_capacity(tested_trees.len());
                let mut voting_times = Vec::with_capacity(tested_trees.len());

                for &t in &tested_trees {
                    let ri = rng.random_range(0..n_test);
                    let q = col_to_vec(queries, ri);
                    let projected = self.projection.project(&q);

                    let start = Instant::now();
                    let elected = self.vote(&projected, v, t, d);
                    let elapsed = start.elapsed().as_secs_f64();
                    black_box(elected);

                    voting_x.push(t as f64);
                    voting_times.push(elapsed);

                    if verbose {
                        println!(
                            "  depth: {} votes: {} trees: {} voting time: {:.3e} s",
                            d, v, t, elapsed
                        );
                    }
                }
                beta.insert(v, fit_theil_sen(&voting_x, &voting_times));
            }
            beta_voting.push(beta);
        }

        // Exact-ranking time vs candidate-set size, averaged over trials
        let s_max = self.n_samples / 20;
        let n_s_tested = 20;
        let mut s_tested: Vec<usize> = vec![1, 2, 5, 10, 20, 50, 100, 200, 300, 400, 500];
        let increment = s_max / n_s_tested;
        if increment > 0 {
            for i in 1..=n_s_tested {
                let s = i * increment;
                if !s_tested.contains(&s) {
                    s_tested.push(s);
                }
            }
        }

        let n_sim = 100;
        let mut exact_x = Vec::with_capacity(s_tested.len());
        let mut exact_times = Vec::with_capacity(s_tested.len());
        for &s in &s_tested {
            let mut mean_exact_time = 0.0;
            for _ in 0..n_sim {
                let ri = rng.random_range(0..n_test);
                let q = col_to_vec(queries, ri);
                let candidates: Vec<usize> =
                    (0..s).map(|_| rng.random_range(0..self.n_samples)).collect();

                let start = Instant::now();
                let result = self.exact_knn(&q, k, &candidates);
                mean_exact_time += start.elapsed().as_secs_f64();
                black_box(result);
            }

            exact_x.push(s as f64);
            exact_times.push(mean_exact_time / n_sim as f64);
        }

        (
            fit_theil_sen(&projection_x, &projection_times),
            beta_voting,
            fit_theil_sen(&exact_x, &exact_times),
        )
    }

    /////////////////////////
    // Frontier and trims //
    /////////////////////////

    /// Cheapest profiled configuration reaching a target recall
    ///
    /// ### Params
    ///
    /// * `target_recall` - Desired recall at k, in [0, 1]
    ///
    /// ### Returns
    ///
    /// The first frontier entry whose estimated recall exceeds
    /// target - 1e-4, or the empty sentinel when the target is infeasible
    pub fn optimal_parameters(&self, target_recall: f64) -> Parameters {
        let stats = self
            .stats
            .as_ref()
            .expect("optimal-parameter lookups require a profiled index: run autotune first");

        let tr = target_recall - 0.0001;
        stats
            .opt_pars
            .iter()
            .find(|p| p.estimated_recall > tr)
            .copied()
            .unwrap_or_default()
    }

    /// The full Pareto frontier, ascending in estimated query time
    pub fn optimal_parameter_list(&self) -> Vec<Parameters> {
        let stats = self
            .stats
            .as_ref()
            .expect("optimal-parameter lookups require a profiled index: run autotune first");
        stats.opt_pars.clone()
    }

    /// Estimated recall for a profiled configuration
    ///
    /// ### Params
    ///
    /// * `n_trees` - Tree count in [1, n_trees]
    /// * `depth` - Evaluation depth in [depth_min, depth]
    /// * `votes` - Vote threshold in [1, votes_max]
    pub fn recall(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        let stats = self
            .stats
            .as_ref()
            .expect("recall estimates require a profiled index: run autotune first");
        assert!(
            votes >= 1 && votes <= stats.votes_max,
            "votes outside the profiled range"
        );
        stats.recalls[depth - stats.depth_min][(votes - 1, n_trees - 1)]
    }

    /// Estimated candidate-set size for a profiled configuration
    ///
    /// ### Params
    ///
    /// * `n_trees` - Tree count in [1, n_trees]
    /// * `depth` - Evaluation depth in [depth_min, depth]
    /// * `votes` - Vote threshold in [1, votes_max]
    pub fn candidate_set_size(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        let stats = self
            .stats
            .as_ref()
            .expect("candidate-size estimates require a profiled index: run autotune first");
        assert!(
            votes >= 1 && votes <= stats.votes_max,
            "votes outside the profiled range"
        );
        stats.cs_sizes[depth - stats.depth_min][(votes - 1, n_trees - 1)]
    }

    /// Estimated projection latency for a configuration
    ///
    /// Evaluates the fitted projection model at the pool size
    /// n_trees * depth.
    pub fn projection_time(&self, n_trees: usize, depth: usize) -> f64 {
        let stats = self
            .stats
            .as_ref()
            .expect("latency estimates require a profiled index: run autotune first");
        predict_theil_sen(stats.beta_projection, (n_trees * depth) as f64)
    }

    /// Estimated voting latency for a configuration
    ///
    /// Uses the fit of the smallest profiled threshold >= votes; past the
    /// largest profiled threshold the last fit applies.
    pub fn voting_time(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        let stats = self
            .stats
            .as_ref()
            .expect("latency estimates require a profiled index: run autotune first");
        voting_beta(&stats.beta_voting[depth - stats.depth_min], votes)
            .map(|beta| predict_theil_sen(beta, n_trees as f64))
            .unwrap_or(0.0)
    }

    /// Estimated exact-ranking latency for a configuration
    ///
    /// Evaluates the fitted exact-search model at the estimated
    /// candidate-set size of the configuration.
    pub fn exact_time(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        let stats = self
            .stats
            .as_ref()
            .expect("latency estimates require a profiled index: run autotune first");
        predict_theil_sen(
            stats.beta_exact,
            self.candidate_set_size(n_trees, depth, votes),
        )
    }

    /// Estimated total query latency for a configuration
    pub fn query_time(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        self.projection_time(n_trees, depth)
            + self.voting_time(n_trees, depth, votes)
            + self.exact_time(n_trees, depth, votes)
    }

    /// Build an independently owned forest trimmed to a target recall
    ///
    /// Keeps the first n_trees' leaf vectors, the per-tree prefix of the
    /// split-point block and the projection rows of the kept levels
    /// (strided over the original depth so each tree keeps its own random
    /// vectors). The result shares nothing mutable with the parent. An
    /// infeasible target yields an empty forest whose queries return the
    /// -1 sentinel fill.
    ///
    /// ### Params
    ///
    /// * `target_recall` - Desired recall at k, in [0, 1]
    ///
    /// ### Returns
    ///
    /// The trimmed forest, with the tuned vote count stored for
    /// `query_tuned`
    pub fn subset(&self, target_recall: f64) -> MrptIndex<'a> {
        let pars = self.optimal_parameters(target_recall);
        if pars.is_empty() {
            return MrptIndex::empty(self.data);
        }

        let n_trees = pars.n_trees;
        let depth = pars.depth;
        let n_array = 1_usize << (depth + 1);

        let mut split_points = Vec::with_capacity(n_array * n_trees);
        for t in 0..n_trees {
            let begin = t * self.n_array;
            split_points.extend_from_slice(&self.split_points[begin..begin + n_array]);
        }

        MrptIndex {
            data: self.data,
            n_samples: self.n_samples,
            dim: self.dim,
            n_trees,
            depth,
            density: self.density,
            n_pool: n_trees * depth,
            n_array,
            votes: pars.votes,
            split_points,
            tree_leaves: self.tree_leaves[..n_trees].to_vec(),
            leaf_first_indices_all: count_first_leaf_indices_all(self.n_samples, depth),
            projection: self.projection.subset(n_trees, depth, self.depth),
            stats: None,
        }
    }

    /// Trim this forest in place to a target recall
    ///
    /// The in-place variant of `subset`. An infeasible target leaves the
    /// forest untouched.
    ///
    /// ### Params
    ///
    /// * `target_recall` - Desired recall at k, in [0, 1]
    pub fn delete_extra_trees(&mut self, target_recall: f64) {
        let pars = self.optimal_parameters(target_recall);
        if pars.is_empty() {
            return;
        }

        let depth_max = self.depth;
        let n_array = 1_usize << (pars.depth + 1);

        let mut split_points = Vec::with_capacity(n_array * pars.n_trees);
        for t in 0..pars.n_trees {
            let begin = t * self.n_array;
            split_points.extend_from_slice(&self.split_points[begin..begin + n_array]);
        }

        self.n_trees = pars.n_trees;
        self.depth = pars.depth;
        self.votes = pars.votes;
        self.n_pool = pars.n_trees * pars.depth;
        self.n_array = n_array;
        self.split_points = split_points;
        self.tree_leaves.truncate(pars.n_trees);
        self.leaf_first_indices_all.truncate(pars.depth + 1);
        self.projection = self.projection.subset(pars.n_trees, pars.depth, depth_max);
    }
}

///////////
// Tests //
///////////
