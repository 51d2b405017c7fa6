#![allow(clippy::needless_range_loop)] // I want these loops!

pub mod autotune;
pub mod mrpt;
pub mod projection;
pub mod synthetic;
pub mod utils;

use faer::MatRef;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thousands::*;

use crate::mrpt::*;

//////////
// MRPT //
//////////

/// Build an MRPT index
///
/// ### Params
///
/// * `data` - The data matrix, dim rows x n_samples columns (column j is
///   point j)
/// * `n_trees` - Number of trees in the forest
/// * `depth` - Depth of every tree
/// * `density` - Expected fill ratio of the projection pool, in (0, 1];
///   1 selects the dense Gaussian pool
/// * `seed` - Random seed for reproducibility; 0 seeds from entropy
///
/// ### Returns
///
/// The grown `MrptIndex`.
pub fn build_mrpt_index(
    data: MatRef<'_, f32>,
    n_trees: usize,
    depth: usize,
    density: f32,
    seed: u64,
) -> MrptIndex<'_> {
    MrptIndex::grow(data, n_trees, depth, density, seed)
}

/// Build an MRPT index at a maximum budget and autotune it
///
/// Grows the forest at (trees_max, depth_max), profiles it over the test
/// queries and, when a target recall is given, trims it in place to the
/// cheapest configuration reaching the target. Without a target the
/// returned index keeps the full budget and the profiling results for
/// later `optimal_parameters` / `subset` calls.
///
/// ### Params
///
/// * `data` - The data matrix, dim rows x n_samples columns
/// * `queries` - Held-out test queries, dim rows x n_test columns
/// * `target_recall` - Optional recall target for the in-place trim
/// * `k` - Neighbour count to tune for
/// * `trees_max` - Tree budget for the saturation build
/// * `depth_min` - Smallest evaluation depth to profile (>= 1)
/// * `depth_max` - Depth of the saturation build
/// * `votes_max` - Largest vote threshold to profile
/// * `density` - Expected fill ratio of the projection pool, in (0, 1]
/// * `seed` - Random seed for reproducibility; 0 seeds from entropy
/// * `verbose` - Print profiling progress
///
/// ### Returns
///
/// The profiled (and possibly trimmed) `MrptIndex`.
#[allow(clippy::too_many_arguments)]
pub fn build_autotuned_mrpt_index<'a>(
    data: MatRef<'a, f32>,
    queries: MatRef<'_, f32>,
    target_recall: Option<f64>,
    k: usize,
    trees_max: usize,
    depth_min: usize,
    depth_max: usize,
    votes_max: usize,
    density: f32,
    seed: u64,
    verbose: bool,
) -> MrptIndex<'a> {
    let mut index = MrptIndex::grow(data, trees_max, depth_max, density, seed);
    index.autotune(queries, k, depth_min, votes_max, verbose);

    if let Some(target) = target_recall {
        index.delete_extra_trees(target);
    }

    index
}

/// Helper function to query a given MRPT index
///
/// ### Params
///
/// * `query_mat` - The query matrix, dim rows x n_queries columns
/// * `index` - The MrptIndex to query
/// * `k` - Number of neighbours to return
/// * `votes_required` - Votes needed for a point to enter the exact
///   search, in [1, n_trees]
/// * `return_dist` - Shall the distances between the points be returned
/// * `verbose` - Controls verbosity of the function
///
/// ### Returns
///
/// A tuple of `(knn_indices, optional distances)`; rows are padded with
/// -1 where fewer than k points were elected
pub fn query_mrpt_index(
    query_mat: MatRef<'_, f32>,
    index: &MrptIndex<'_>,
    k: usize,
    votes_required: usize,
    return_dist: bool,
    verbose: bool,
) -> (Vec<Vec<i32>>, Option<Vec<Vec<f32>>>) {
    let n_samples = query_mat.ncols();
    let counter = Arc::new(AtomicUsize::new(0));

    if return_dist {
        let results: Vec<(Vec<i32>, Vec<f32>)> = (0..n_samples)
            .into_par_iter()
            .map(|i| {
                let query_vec: Vec<f32> = query_mat.col(i).iter().copied().collect();
                let result = index.query(&query_vec, k, votes_required);

                if verbose {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count.is_multiple_of(100_000) {
                        println!(
                            "  Processed {} / {} samples.",
                            count.separate_with_underscores(),
                            n_samples.separate_with_underscores()
                        );
                    }
                }

                result
            })
            .collect();

        let (indices, distances) = results.into_iter().unzip();
        (indices, Some(distances))
    } else {
        let indices: Vec<Vec<i32>> = (0..n_samples)
            .into_par_iter()
            .map(|i| {
                let query_vec: Vec<f32> = query_mat.col(i).iter().copied().collect();
                let (neighbours, _) = index.query(&query_vec, k, votes_required);

                if verbose {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count.is_multiple_of(100_000) {
                        println!(
                            "  Processed {} / {} samples.",
                            count.separate_with_underscores(),
                            n_samples.separate_with_underscores()
                        );
                    }
                }

                neighbours
            })
            .collect();

        (indices, None)
    }
}
