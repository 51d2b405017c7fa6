use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::autotune::TunerStats;
use crate::projection::*;
use crate::utils::dist::*;

//////////////////
// Leaf layout //
//////////////////

/// Leaf sizes of a median-split tree, left to right
///
/// At every internal node with m points the left child receives m - m/2
/// (the extra point on odd counts goes left) and the right child m/2, so
/// the sizes are fully determined by n and the depth alone.
pub(crate) fn count_leaf_sizes(n: usize, level: usize, tree_depth: usize, out: &mut Vec<usize>) {
    if level == tree_depth {
        out.push(n);
        return;
    }
    count_leaf_sizes(n - n / 2, level + 1, tree_depth, out);
    count_leaf_sizes(n / 2, level + 1, tree_depth, out);
}

/// Prefix sums over the leaf sizes at a given depth
///
/// Returns a vector of length 2^depth + 1 such that leaf l occupies
/// `[out[l], out[l + 1])` in a tree's concatenated leaf array.
pub(crate) fn count_first_leaf_indices(n: usize, depth: usize) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(1 << depth);
    count_leaf_sizes(n, 0, depth, &mut sizes);

    let mut indices = Vec::with_capacity(sizes.len() + 1);
    indices.push(0);
    for s in sizes {
        indices.push(indices[indices.len() - 1] + s);
    }
    indices
}

/// Leaf offset tables for every depth in 0..=depth_max
///
/// The tables are shared across trees: the split recurrence makes leaf
/// sizes identical in every tree.
pub(crate) fn count_first_leaf_indices_all(n: usize, depth_max: usize) -> Vec<Vec<usize>> {
    (0..=depth_max)
        .map(|d| count_first_leaf_indices(n, d))
        .collect()
}

////////////////
// Main index //
////////////////

/// Multiple random projection tree index for approximate k-NN search
///
/// A forest of balanced binary RP-trees built with median splits over
/// random projections of the data. Queries route to one leaf per tree,
/// aggregate per-point votes across trees and run an exact squared
/// Euclidean ranking over the points whose vote count reached the
/// requested threshold.
///
/// The index borrows the data matrix: column j of `data` is point j and
/// the matrix must outlive the index.
///
/// ### Fields
///
/// * `data` - Borrowed data matrix, dim rows x n_samples columns
/// * `n_samples` - Number of data points
/// * `dim` - Data dimensionality
/// * `n_trees` - Trees in the forest
/// * `depth` - Tree depth (all trees share it)
/// * `density` - Expected fill ratio of the projection pool
/// * `n_pool` - Random vectors in the pool (n_trees * depth)
/// * `n_array` - Split-point slots per tree (2^(depth + 1))
/// * `votes` - Tuned vote threshold; 0 until an autotuned trim sets it
/// * `split_points` - Flat split values, tree-major (tree t owns
///   `[t * n_array, (t + 1) * n_array)`)
/// * `tree_leaves` - Per tree, a permutation of [0, n_samples) with the
///   leaves concatenated left to right
/// * `leaf_first_indices_all` - Leaf offset tables per depth 0..=depth
/// * `projection` - The random projection pool
/// * `stats` - Profiling results once `autotune` has run
pub struct MrptIndex<'a> {
    pub(crate) data: MatRef<'a, f32>,
    pub(crate) n_samples: usize,
    pub(crate) dim: usize,
    pub(crate) n_trees: usize,
    pub(crate) depth: usize,
    pub(crate) density: f32,
    pub(crate) n_pool: usize,
    pub(crate) n_array: usize,
    pub(crate) votes: usize,
    pub(crate) split_points: Vec<f32>,
    pub(crate) tree_leaves: Vec<Vec<usize>>,
    pub(crate) leaf_first_indices_all: Vec<Vec<usize>>,
    pub(crate) projection: ProjectionMatrix,
    pub(crate) stats: Option<TunerStats>,
}

impl<'a> MrptIndex<'a> {
    //////////////////////
    // Index generation //
    //////////////////////

    /// Grow the forest
    ///
    /// Builds the projection pool, computes the per-tree projections and
    /// grows all trees in parallel. Each tree uses its own row block of
    /// the pool, so parallel growth stays deterministic for a fixed seed.
    ///
    /// Depths with 2^depth > n_samples are allowed; the deterministic size
    /// recurrence simply produces empty leaves.
    ///
    /// ### Params
    ///
    /// * `data` - Data matrix, dim rows x n_samples columns (column j is
    ///   point j)
    /// * `n_trees` - Number of trees to build
    /// * `depth` - Depth of every tree
    /// * `density` - Expected fill ratio of the projection pool, in (0, 1];
    ///   1 selects the dense Gaussian pool
    /// * `seed` - Random seed; 0 seeds from platform entropy
    ///
    /// ### Returns
    ///
    /// The grown index, ready for querying
    pub fn grow(
        data: MatRef<'a, f32>,
        n_trees: usize,
        depth: usize,
        density: f32,
        seed: u64,
    ) -> MrptIndex<'a> {
        let n_samples = data.ncols();
        let dim = data.nrows();

        assert!(n_samples >= 1, "cannot grow an index over an empty matrix");
        assert!(dim >= 1, "data must have at least one dimension");
        assert!(n_trees >= 1, "n_trees must be at least 1");
        assert!(
            density > 0.0 && density <= 1.0,
            "density must lie in (0, 1], got {}",
            density
        );

        let n_pool = n_trees * depth;
        let n_array = 1_usize << (depth + 1);

        let projection = ProjectionMatrix::new(n_pool, dim, density, seed);
        let leaf_first_indices_all = count_first_leaf_indices_all(n_samples, depth);

        let built: Vec<(Vec<usize>, Vec<f32>)> = (0..n_trees)
            .into_par_iter()
            .map(|t| {
                let tree_projections = projection.project_block(t * depth, depth, data);

                let mut indices: Vec<usize> = (0..n_samples).collect();
                let mut splits = vec![0.0f32; n_array];
                grow_subtree(
                    &mut indices,
                    0,
                    0,
                    depth,
                    &tree_projections,
                    n_samples,
                    &mut splits,
                );
                (indices, splits)
            })
            .collect();

        let mut split_points = Vec::with_capacity(n_array * n_trees);
        let mut tree_leaves = Vec::with_capacity(n_trees);
        for (indices, splits) in built {
            split_points.extend_from_slice(&splits);
            tree_leaves.push(indices);
        }

        MrptIndex {
            data,
            n_samples,
            dim,
            n_trees,
            depth,
            density,
            n_pool,
            n_array,
            votes: 0,
            split_points,
            tree_leaves,
            leaf_first_indices_all,
            projection,
            stats: None,
        }
    }

    /// Index with zero trees, the result of an infeasible trim
    pub(crate) fn empty(data: MatRef<'a, f32>) -> MrptIndex<'a> {
        let n_samples = data.ncols();
        let dim = data.nrows();

        MrptIndex {
            data,
            n_samples,
            dim,
            n_trees: 0,
            depth: 0,
            density: 1.0,
            n_pool: 0,
            n_array: 2,
            votes: 0,
            split_points: Vec::new(),
            tree_leaves: Vec::new(),
            leaf_first_indices_all: count_first_leaf_indices_all(n_samples, 0),
            projection: ProjectionMatrix::empty(dim),
            stats: None,
        }
    }

    ///////////
    // Query //
    ///////////

    /// Find the k approximate nearest neighbours of a query point
    ///
    /// Projects the query through the pool, routes it to one leaf per tree
    /// (in parallel across trees), tallies votes per data point and runs
    /// the exact squared Euclidean ranking over the points whose count
    /// reached `votes_required`. Vote tallying is deliberately serial so
    /// the threshold-crossing election fires exactly once per point.
    ///
    /// ### Params
    ///
    /// * `q` - Query vector of length dim
    /// * `k` - Number of neighbours to return, in [1, n_samples]
    /// * `votes_required` - Votes needed for election, in [1, n_trees]
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)`, both of length k, sorted by
    /// ascending distance. Distances are Euclidean (square roots). When
    /// fewer than k points are elected the tails are padded with -1 and
    /// -1.0. An empty forest returns the fully padded result.
    pub fn query(&self, q: &[f32], k: usize, votes_required: usize) -> (Vec<i32>, Vec<f32>) {
        if self.is_empty() {
            return (vec![-1; k], vec![-1.0; k]);
        }

        assert_eq!(q.len(), self.dim, "query dimensionality mismatch");
        assert!(
            k >= 1 && k <= self.n_samples,
            "k must lie in [1, n_samples], got {}",
            k
        );
        assert!(
            votes_required >= 1 && votes_required <= self.n_trees,
            "votes_required must lie in [1, n_trees], got {}",
            votes_required
        );

        let projected = self.projection.project(q);
        let elected = self.vote(&projected, votes_required, self.n_trees, self.depth);

        self.exact_knn(q, k, &elected)
    }

    /// Query with the vote threshold chosen by autotuning
    ///
    /// Requires a trimmed index (`subset` / `delete_extra_trees` store the
    /// tuned vote count).
    ///
    /// ### Params
    ///
    /// * `q` - Query vector of length dim
    /// * `k` - Number of neighbours to return
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)` as for `query`
    pub fn query_tuned(&self, q: &[f32], k: usize) -> (Vec<i32>, Vec<f32>) {
        if self.is_empty() {
            return (vec![-1; k], vec![-1.0; k]);
        }
        assert!(
            self.votes > 0,
            "no tuned vote count: run autotune and subset/delete_extra_trees first"
        );
        self.query(q, k, self.votes)
    }

    /// Route a projected query and collect the elected candidates
    ///
    /// Routes trees `[0, n_trees)` down to `depth_crnt` levels. The level
    /// stride into the projected query stays the full tree depth, so the
    /// same projection serves every evaluation depth. Returns the points
    /// whose vote count reached `votes_required`, in election order.
    pub(crate) fn vote(
        &self,
        projected: &[f32],
        votes_required: usize,
        n_trees: usize,
        depth_crnt: usize,
    ) -> Vec<usize> {
        let leaf_first = &self.leaf_first_indices_all[depth_crnt];

        let found_leaves: Vec<usize> = (0..n_trees)
            .into_par_iter()
            .map(|t| {
                let mut node = 0_usize;
                for d in 0..depth_crnt {
                    let j = t * self.depth + d;
                    let left = 2 * node + 1;
                    node = if projected[j] <= self.split_points[t * self.n_array + node] {
                        left
                    } else {
                        left + 1
                    };
                }
                node + 1 - (1 << depth_crnt)
            })
            .collect();

        let max_leaf_size = self.n_samples / (1 << depth_crnt) + 1;
        let mut votes = vec![0_u32; self.n_samples];
        let mut elected = Vec::with_capacity(n_trees * max_leaf_size);

        for (t, &leaf) in found_leaves.iter().enumerate() {
            let leaf_begin = leaf_first[leaf];
            let leaf_end = leaf_first[leaf + 1];
            for &idx in &self.tree_leaves[t][leaf_begin..leaf_end] {
                votes[idx] += 1;
                if votes[idx] as usize == votes_required {
                    elected.push(idx);
                }
            }
        }

        elected
    }

    /// Exact k-NN over a candidate list
    ///
    /// Computes squared Euclidean distances from every candidate to the
    /// query in parallel, then ranks them. k = 1 short-circuits through a
    /// linear minimum; otherwise an index permutation is partially sorted
    /// over the first min(k, m) positions. The partial sort is unstable,
    /// so no order among equal distances is guaranteed.
    ///
    /// ### Params
    ///
    /// * `q` - Query vector of length dim
    /// * `k` - Number of neighbours to return
    /// * `candidates` - Data point indices to rank
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)` of length k, ascending by distance,
    /// padded with -1 / -1.0 past the candidate count. Distances are
    /// square roots of the squared norms.
    pub fn exact_knn(&self, q: &[f32], k: usize, candidates: &[usize]) -> (Vec<i32>, Vec<f32>) {
        if candidates.is_empty() {
            return (vec![-1; k], vec![-1.0; k]);
        }

        let distances: Vec<f32> = candidates
            .par_iter()
            .map(|&idx| euclidean_sq_to_col(self.data, idx, q))
            .collect();

        if k == 1 {
            let mut best = 0;
            for i in 1..distances.len() {
                if distances[i] < distances[best] {
                    best = i;
                }
            }
            return (
                vec![candidates[best] as i32],
                vec![distances[best].sqrt()],
            );
        }

        let m = candidates.len();
        let n_to_sort = k.min(m);
        let mut idx: Vec<usize> = (0..m).collect();

        let by_dist = |&a: &usize, &b: &usize| -> Ordering {
            distances[a]
                .partial_cmp(&distances[b])
                .unwrap_or(Ordering::Equal)
        };
        if n_to_sort < m {
            idx.select_nth_unstable_by(n_to_sort - 1, by_dist);
        }
        idx[..n_to_sort].sort_unstable_by(by_dist);

        let mut out = vec![-1_i32; k];
        let mut out_distances = vec![-1.0_f32; k];
        for i in 0..n_to_sort {
            out[i] = candidates[idx[i]] as i32;
            out_distances[i] = distances[idx[i]].sqrt();
        }

        (out, out_distances)
    }

    ///////////////
    // Accessors //
    ///////////////

    /// Number of trees in the index
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    /// Depth of the trees
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Tuned vote threshold; 0 until a trim has stored one
    pub fn votes(&self) -> usize {
        self.votes
    }

    /// Expected fill ratio of the projection pool
    pub fn density(&self) -> f32 {
        self.density
    }

    /// Number of data points the index was built over
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Dimensionality of the data
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Whether the index can serve queries
    pub fn is_empty(&self) -> bool {
        self.n_trees == 0
    }

    /// Split value of a node (testing accessor)
    ///
    /// ### Params
    ///
    /// * `tree` - Tree index in [0, n_trees)
    /// * `node` - Implicit-binary-tree node index (root = 0, children of i
    ///   are 2i + 1 and 2i + 2)
    pub fn split_point(&self, tree: usize, node: usize) -> f32 {
        self.split_points[tree * self.n_array + node]
    }

    /// Data point stored at a position of a leaf (testing accessor)
    ///
    /// ### Params
    ///
    /// * `tree` - Tree index in [0, n_trees)
    /// * `leaf` - Leaf index in [0, 2^depth)
    /// * `index` - Position within the leaf
    pub fn leaf_point(&self, tree: usize, leaf: usize, index: usize) -> usize {
        let leaf_first = &self.leaf_first_indices_all[self.depth];
        self.tree_leaves[tree][leaf_first[leaf] + index]
    }

    /// Number of points in a leaf (testing accessor)
    ///
    /// ### Params
    ///
    /// * `tree` - Tree index in [0, n_trees)
    /// * `leaf` - Leaf index in [0, 2^depth)
    pub fn leaf_size(&self, _tree: usize, leaf: usize) -> usize {
        let leaf_first = &self.leaf_first_indices_all[self.depth];
        leaf_first[leaf + 1] - leaf_first[leaf]
    }

    /////////////////
    // Persistence //
    /////////////////

    /// Save the index to a file
    ///
    /// The record layout is fixed and explicitly little-endian:
    /// n_trees (i32), depth (i32), density (f32), the split-point block
    /// (tree-major f32), per tree an i32 size followed by the leaf
    /// indices, and finally the projection pool: CSR triplets preceded by
    /// an i32 count when density < 1, the dense row-major entries
    /// otherwise.
    ///
    /// ### Params
    ///
    /// * `path` - Output file path
    ///
    /// ### Returns
    ///
    /// `Ok(())` on success; any I/O failure is propagated
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);

        write_i32(&mut w, self.n_trees as i32)?;
        write_i32(&mut w, self.depth as i32)?;
        write_f32(&mut w, self.density)?;

        for &s in &self.split_points {
            write_f32(&mut w, s)?;
        }

        for leaves in &self.tree_leaves {
            write_i32(&mut w, leaves.len() as i32)?;
            for &idx in leaves {
                write_i32(&mut w, idx as i32)?;
            }
        }

        if let Some(entries) = self.projection.dense_data() {
            for &v in entries {
                write_f32(&mut w, v)?;
            }
        } else {
            let triplets = self.projection.triplets();
            write_i32(&mut w, triplets.len() as i32)?;
            for &(row, col, val) in &triplets {
                write_i32(&mut w, row as i32)?;
                write_i32(&mut w, col as i32)?;
                write_f32(&mut w, val)?;
            }
        }

        w.flush()
    }

    /// Load an index from a file
    ///
    /// The caller supplies the same data matrix the saved index was built
    /// over; only the trees and the projection pool are stored on disk.
    ///
    /// ### Params
    ///
    /// * `data` - Data matrix, dim rows x n_samples columns
    /// * `path` - Input file path
    ///
    /// ### Returns
    ///
    /// The reconstructed index; any I/O failure is propagated
    pub fn load<P: AsRef<Path>>(data: MatRef<'a, f32>, path: P) -> io::Result<MrptIndex<'a>> {
        let mut r = BufReader::new(File::open(path)?);

        let n_samples = data.ncols();
        let dim = data.nrows();

        let n_trees = read_i32(&mut r)? as usize;
        let depth = read_i32(&mut r)? as usize;
        let density = read_f32(&mut r)?;

        let n_pool = n_trees * depth;
        let n_array = 1_usize << (depth + 1);

        let mut split_points = vec![0.0f32; n_array * n_trees];
        for s in split_points.iter_mut() {
            *s = read_f32(&mut r)?;
        }

        let mut tree_leaves = Vec::with_capacity(n_trees);
        for _ in 0..n_trees {
            let size = read_i32(&mut r)? as usize;
            let mut leaves = Vec::with_capacity(size);
            for _ in 0..size {
                leaves.push(read_i32(&mut r)? as usize);
            }
            tree_leaves.push(leaves);
        }

        let projection = if density < 1.0 {
            let nnz = read_i32(&mut r)? as usize;
            let mut triplets = Vec::with_capacity(nnz);
            for _ in 0..nnz {
                let row = read_i32(&mut r)? as u32;
                let col = read_i32(&mut r)? as u32;
                let val = read_f32(&mut r)?;
                triplets.push((row, col, val));
            }
            ProjectionMatrix::from_triplets(n_pool, dim, &triplets)
        } else {
            let mut entries = Vec::with_capacity(n_pool * dim);
            for _ in 0..n_pool * dim {
                entries.push(read_f32(&mut r)?);
            }
            ProjectionMatrix::from_dense_data(n_pool, dim, entries)
        };

        Ok(MrptIndex {
            data,
            n_samples,
            dim,
            n_trees,
            depth,
            density,
            n_pool,
            n_array,
            votes: 0,
            split_points,
            tree_leaves,
            leaf_first_indices_all: count_first_leaf_indices_all(n_samples, depth),
            projection,
            stats: None,
        })
    }
}

//////////////////
// Tree growing //
//////////////////

/// Recursively grow one subtree over a range of data point indices
///
/// Partitions the range by the median of the projected coordinates at the
/// current level: the left child receives the extra point on odd counts.
/// The split value reproduces the partition during routing: the value of
/// the last point assigned left for odd counts, the mean of the largest
/// left and smallest right values for even counts. Empty ranges (trees
/// deeper than log2 n) terminate without touching the split slots.
fn grow_subtree(
    slice: &mut [usize],
    level: usize,
    node: usize,
    depth: usize,
    projections: &[f32],
    n_samples: usize,
    splits: &mut [f32],
) {
    if level == depth {
        return;
    }

    let n = slice.len();
    if n == 0 {
        return;
    }

    let row = &projections[level * n_samples..(level + 1) * n_samples];
    let by_proj = |&a: &usize, &b: &usize| -> Ordering {
        row[a].partial_cmp(&row[b]).unwrap_or(Ordering::Equal)
    };

    slice.select_nth_unstable_by(n / 2, by_proj);
    let mid = n - n / 2;

    if n % 2 == 1 {
        splits[node] = row[slice[n / 2]];
    } else {
        let left_max = slice[..mid]
            .iter()
            .map(|&i| row[i])
            .fold(f32::NEG_INFINITY, f32::max);
        splits[node] = (left_max + row[slice[mid]]) / 2.0;
    }

    let (left, right) = slice.split_at_mut(mid);
    grow_subtree(left, level + 1, 2 * node + 1, depth, projections, n_samples, splits);
    grow_subtree(right, level + 1, 2 * node + 2, depth, projections, n_samples, splits);
}

/////////////////////
// Binary framing //
/////////////////////

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0_u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> io::Result<f32> {
    let mut buf = [0_u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::generate_gaussian_data;
    use crate::utils::recall_at_k;
    use approx::assert_relative_eq;
    use faer::Mat;
    use tempfile::NamedTempFile;

    /// 8 points on a 2D grid: (0,0), (0,1), (1,0), (1,1), ..., (3,1)
    fn grid_matrix() -> Mat<f32> {
        let points = [
            [0.0, 0.0],
            [0.0, 1.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [2.0, 0.0],
            [2.0, 1.0],
            [3.0, 0.0],
            [3.0, 1.0],
        ];
        Mat::from_fn(2, 8, |i, j| points[j][i])
    }

    #[test]
    fn test_leaf_offsets_even() {
        let offsets = count_first_leaf_indices(8, 2);
        assert_eq!(offsets, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_leaf_offsets_odd_extra_point_left() {
        let offsets = count_first_leaf_indices(7, 1);
        assert_eq!(offsets, vec![0, 4, 7]);

        let offsets = count_first_leaf_indices(7, 2);
        assert_eq!(offsets, vec![0, 2, 4, 6, 7]);
    }

    #[test]
    fn test_leaf_offsets_deeper_than_data() {
        // 2^2 > 3: some leaves end up empty
        let offsets = count_first_leaf_indices(3, 2);
        assert_eq!(offsets.len(), 5);
        assert_eq!(*offsets.last().unwrap(), 3);
        assert_eq!(offsets, vec![0, 1, 2, 3, 3]);
    }

    #[test]
    fn test_leaf_offsets_depth_zero() {
        let offsets = count_first_leaf_indices(5, 0);
        assert_eq!(offsets, vec![0, 5]);
    }

    #[test]
    fn test_grow_grid_leaves_are_balanced() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);

        for leaf in 0..4 {
            assert_eq!(index.leaf_size(0, leaf), 2);
        }
    }

    #[test]
    fn test_grow_leaves_form_permutation() {
        let data = generate_gaussian_data::<f32>(8, 137, 3);
        let index = MrptIndex::grow(data.as_ref(), 4, 3, 1.0, 5);

        for t in 0..4 {
            let mut seen = vec![false; 137];
            for leaf in 0..(1 << 3) {
                for i in 0..index.leaf_size(t, leaf) {
                    let p = index.leaf_point(t, leaf, i);
                    assert!(!seen[p], "point {} appears twice in tree {}", p, t);
                    seen[p] = true;
                }
            }
            assert!(seen.iter().all(|&s| s), "tree {} misses points", t);
        }
    }

    #[test]
    fn test_split_values_partition_projections() {
        let data = generate_gaussian_data::<f32>(6, 101, 11);
        let depth = 3;
        let index = MrptIndex::grow(data.as_ref(), 3, depth, 1.0, 23);

        for t in 0..3 {
            let proj = index
                .projection
                .project_block(t * depth, depth, data.as_ref());

            // Walk every internal level; the ranges at level l follow the
            // same size recurrence as the leaves of a depth-l tree.
            for level in 0..depth {
                let ranges = count_first_leaf_indices(101, level);
                for node_in_level in 0..(1 << level) {
                    let node = (1 << level) - 1 + node_in_level;
                    let begin = ranges[node_in_level];
                    let end = ranges[node_in_level + 1];
                    let n = end - begin;
                    if n == 0 {
                        continue;
                    }
                    let mid = begin + (n - n / 2);
                    let split = index.split_point(t, node);

                    for i in begin..mid {
                        let p = index.tree_leaves[t][i];
                        assert!(
                            proj[level * 101 + p] <= split,
                            "left point above split at tree {} node {}",
                            t,
                            node
                        );
                    }
                    for i in mid..end {
                        let p = index.tree_leaves[t][i];
                        assert!(
                            proj[level * 101 + p] >= split,
                            "right point below split at tree {} node {}",
                            t,
                            node
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_grow_reproducibility() {
        let data = generate_gaussian_data::<f32>(10, 200, 17);

        let a = MrptIndex::grow(data.as_ref(), 5, 4, 1.0, 42);
        let b = MrptIndex::grow(data.as_ref(), 5, 4, 1.0, 42);

        assert_eq!(a.split_points, b.split_points);
        assert_eq!(a.tree_leaves, b.tree_leaves);
    }

    #[test]
    fn test_grow_sparse_reproducibility() {
        let data = generate_gaussian_data::<f32>(16, 150, 29);

        let a = MrptIndex::grow(data.as_ref(), 4, 3, 0.25, 7);
        let b = MrptIndex::grow(data.as_ref(), 4, 3, 0.25, 7);

        assert_eq!(a.split_points, b.split_points);
        assert_eq!(a.tree_leaves, b.tree_leaves);
    }

    #[test]
    fn test_query_grid_exact_match() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);

        let (indices, distances) = index.query(&[0.0, 0.0], 1, 1);

        assert_eq!(indices, vec![0]);
        assert_relative_eq!(distances[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_query_grid_top_four() {
        let mat = grid_matrix();
        // Depth 1 gives leaves of four, so a single tree elects four
        // candidates with a single vote
        let index = MrptIndex::grow(mat.as_ref(), 1, 1, 1.0, 42);

        let (indices, distances) = index.query(&[0.0, 0.0], 4, 1);

        assert_eq!(indices.len(), 4);
        for i in 0..4 {
            assert!(indices[i] >= 0);
        }
        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        for i in 1..4 {
            assert!(distances[i] >= distances[i - 1]);
        }
    }

    #[test]
    fn test_query_every_point_finds_itself() {
        // No projection ties between distinct points, so a point's query
        // follows its own routing path in every tree
        let data = generate_gaussian_data::<f32>(8, 100, 31);
        let index = MrptIndex::grow(data.as_ref(), 5, 3, 1.0, 13);

        for j in 0..100 {
            let q: Vec<f32> = data.as_ref().col(j).iter().copied().collect();
            let (indices, distances) = index.query(&q, 1, 1);
            assert_eq!(indices[0], j as i32);
            assert_relative_eq!(distances[0], 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_query_votes_required_all_trees() {
        let data = generate_gaussian_data::<f32>(8, 100, 37);
        let index = MrptIndex::grow(data.as_ref(), 4, 2, 1.0, 19);

        // A data point lands in its own leaf in every tree
        let q: Vec<f32> = data.as_ref().col(7).iter().copied().collect();
        let (indices, _) = index.query(&q, 1, 4);
        assert_eq!(indices[0], 7);
    }

    #[test]
    fn test_query_depth_zero_is_linear_scan() {
        let data = generate_gaussian_data::<f32>(6, 50, 41);
        let index = MrptIndex::grow(data.as_ref(), 1, 0, 1.0, 3);

        let q: Vec<f32> = data.as_ref().col(10).iter().copied().collect();
        let (indices, _) = index.query(&q, 5, 1);

        // Single leaf holds everything; results match the exact search
        let all: Vec<usize> = (0..50).collect();
        let (exact, _) = index.exact_knn(&q, 5, &all);
        assert_eq!(indices, exact);
    }

    #[test]
    fn test_query_pads_with_sentinel() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);

        // Leaves hold two points, so k = 5 cannot be filled with one vote
        let (indices, distances) = index.query(&[0.0, 0.0], 5, 1);

        assert_eq!(indices.len(), 5);
        assert!(indices[2..].iter().all(|&i| i == -1));
        assert!(distances[2..].iter().all(|&d| d == -1.0));
    }

    #[test]
    fn test_exact_knn_empty_candidates() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);

        let (indices, distances) = index.exact_knn(&[0.0, 0.0], 3, &[]);
        assert_eq!(indices, vec![-1, -1, -1]);
        assert_eq!(distances, vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_exact_knn_k_one_linear_min() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);

        let candidates = vec![5, 2, 7, 0];
        let (indices, distances) = index.exact_knn(&[3.0, 1.0], 1, &candidates);

        assert_eq!(indices, vec![7]);
        assert_relative_eq!(distances[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_exact_knn_distances_non_decreasing() {
        let data = generate_gaussian_data::<f32>(12, 300, 43);
        let index = MrptIndex::grow(data.as_ref(), 1, 0, 1.0, 1);

        let q: Vec<f32> = (0..12).map(|i| i as f32 * 0.1).collect();
        let all: Vec<usize> = (0..300).collect();
        let (indices, distances) = index.exact_knn(&q, 10, &all);

        for i in 1..10 {
            assert!(indices[i] >= 0);
            assert!(distances[i] >= distances[i - 1]);
        }
    }

    #[test]
    fn test_recall_on_gaussian_data() {
        let data = generate_gaussian_data::<f32>(16, 1000, 1234);
        let index = MrptIndex::grow(data.as_ref(), 20, 6, 0.25, 7);

        let queries = generate_gaussian_data::<f32>(16, 50, 4321);
        let all: Vec<usize> = (0..1000).collect();

        let mut total_recall = 0.0;
        for i in 0..50 {
            let q: Vec<f32> = queries.as_ref().col(i).iter().copied().collect();

            let (truth, _) = index.exact_knn(&q, 10, &all);
            let truth: Vec<usize> = truth.iter().map(|&v| v as usize).collect();

            let (found, _) = index.query(&q, 10, 1);
            total_recall += recall_at_k(&found, &truth);
        }

        let mean_recall = total_recall / 50.0;
        assert!(
            mean_recall >= 0.8,
            "mean recall@10 too low: {}",
            mean_recall
        );
    }

    #[test]
    fn test_save_load_round_trip_dense() {
        let data = generate_gaussian_data::<f32>(10, 120, 47);
        let index = MrptIndex::grow(data.as_ref(), 4, 3, 1.0, 9);

        let file = NamedTempFile::new().unwrap();
        index.save(file.path()).unwrap();
        let loaded = MrptIndex::load(data.as_ref(), file.path()).unwrap();

        assert_eq!(loaded.n_trees, index.n_trees);
        assert_eq!(loaded.depth, index.depth);
        assert_eq!(loaded.split_points, index.split_points);
        assert_eq!(loaded.tree_leaves, index.tree_leaves);
        assert_eq!(
            loaded.projection.dense_data().unwrap(),
            index.projection.dense_data().unwrap()
        );
    }

    #[test]
    fn test_save_load_round_trip_sparse() {
        let data = generate_gaussian_data::<f32>(16, 150, 53);
        let index = MrptIndex::grow(data.as_ref(), 5, 4, 0.25, 11);

        let file = NamedTempFile::new().unwrap();
        index.save(file.path()).unwrap();
        let loaded = MrptIndex::load(data.as_ref(), file.path()).unwrap();

        assert_eq!(loaded.split_points, index.split_points);
        assert_eq!(loaded.tree_leaves, index.tree_leaves);
        assert_eq!(loaded.projection.triplets(), index.projection.triplets());
    }

    #[test]
    fn test_save_load_queries_identical() {
        let data = generate_gaussian_data::<f32>(12, 400, 59);
        let index = MrptIndex::grow(data.as_ref(), 8, 5, 0.3, 13);

        let file = NamedTempFile::new().unwrap();
        index.save(file.path()).unwrap();
        let loaded = MrptIndex::load(data.as_ref(), file.path()).unwrap();

        let queries = generate_gaussian_data::<f32>(12, 100, 61);
        for i in 0..100 {
            let q: Vec<f32> = queries.as_ref().col(i).iter().copied().collect();
            let (idx_a, dist_a) = index.query(&q, 5, 2);
            let (idx_b, dist_b) = loaded.query(&q, 5, 2);
            assert_eq!(idx_a, idx_b);
            assert_eq!(dist_a, dist_b);
        }
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let data = generate_gaussian_data::<f32>(4, 10, 67);
        let result = MrptIndex::load(data.as_ref(), "/nonexistent/mrpt.bin");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_index_query_returns_sentinels() {
        let mat = grid_matrix();
        let index = MrptIndex::empty(mat.as_ref());

        assert!(index.is_empty());
        let (indices, distances) = index.query(&[0.0, 0.0], 3, 1);
        assert_eq!(indices, vec![-1, -1, -1]);
        assert_eq!(distances, vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn test_query_wrong_dim_panics() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);
        let _ = index.query(&[0.0, 0.0, 0.0], 1, 1);
    }

    #[test]
    #[should_panic(expected = "votes_required")]
    fn test_query_votes_out_of_range_panics() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 2, 2, 1.0, 42);
        let _ = index.query(&[0.0, 0.0], 1, 3);
    }

    #[test]
    #[should_panic(expected = "k must lie")]
    fn test_query_k_too_large_panics() {
        let mat = grid_matrix();
        let index = MrptIndex::grow(mat.as_ref(), 1, 2, 1.0, 42);
        let _ = index.query(&[0.0, 0.0], 9, 1);
    }
}
