use faer::MatRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/////////////
// Helpers //
/////////////

/// Seeded RNG with the convention that seed 0 draws a nondeterministic
/// seed from the platform entropy source. Any other value is reproducible.
fn make_rng(seed: u64) -> StdRng {
    if seed == 0 {
        StdRng::from_os_rng()
    } else {
        StdRng::seed_from_u64(seed)
    }
}

///////////////////////
// Projection matrix //
///////////////////////

/// Dense random projection pool
///
/// Stores the stacked random vectors row-major for cache-friendly
/// row-block slicing during tree construction.
///
/// ### Fields
///
/// * `n_rows` - Number of random vectors (n_trees * depth)
/// * `n_cols` - Data dimensionality
/// * `data` - Flat row-major matrix entries, each drawn from N(0, 1)
pub struct DenseProjection {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f32>,
}

/// Sparse random projection pool in compressed sparse row form
///
/// Each cell is zero with probability 1 - density and N(0, 1) otherwise.
/// CSR keeps row slicing O(nnz in the slice), which the per-tree row-block
/// products and the trimming path rely on.
///
/// ### Fields
///
/// * `n_rows` - Number of random vectors (n_trees * depth)
/// * `n_cols` - Data dimensionality
/// * `indptr` - Row start offsets into `col_indices` / `values` (len n_rows + 1)
/// * `col_indices` - Column index per stored entry
/// * `values` - Stored entry values
pub struct SparseProjection {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    col_indices: Vec<u32>,
    values: Vec<f32>,
}

/// Random projection matrix for the RP-tree pool
///
/// Tagged variant over the dense and sparse representations. The choice is
/// made at construction time from the density parameter and never changes
/// afterwards; both variants expose the same projection capabilities.
pub enum ProjectionMatrix {
    Dense(DenseProjection),
    Sparse(SparseProjection),
}

impl ProjectionMatrix {
    /// Build a projection pool, picking the representation from the density
    ///
    /// Density >= 1 yields the dense Gaussian variant, anything below the
    /// sparse variant with the given expected fill ratio.
    ///
    /// ### Params
    ///
    /// * `n_rows` - Number of random vectors to generate
    /// * `n_cols` - Data dimensionality
    /// * `density` - Expected ratio of non-zero entries, in (0, 1]
    /// * `seed` - Random seed; 0 seeds from platform entropy
    ///
    /// ### Returns
    ///
    /// The constructed pool
    pub fn new(n_rows: usize, n_cols: usize, density: f32, seed: u64) -> Self {
        if density < 1.0 {
            Self::sparse(n_rows, n_cols, density, seed)
        } else {
            Self::dense(n_rows, n_cols, seed)
        }
    }

    /// Build a dense pool with every entry drawn from N(0, 1)
    ///
    /// Entries are generated in row-major order, so a fixed seed produces
    /// an identical matrix across runs.
    ///
    /// ### Params
    ///
    /// * `n_rows` - Number of random vectors
    /// * `n_cols` - Data dimensionality
    /// * `seed` - Random seed; 0 seeds from platform entropy
    pub fn dense(n_rows: usize, n_cols: usize, seed: u64) -> Self {
        let mut rng = make_rng(seed);
        let data: Vec<f32> = (0..n_rows * n_cols)
            .map(|_| rng.sample(StandardNormal))
            .collect();

        ProjectionMatrix::Dense(DenseProjection {
            n_rows,
            n_cols,
            data,
        })
    }

    /// Build a sparse pool
    ///
    /// Iterates cells in row-major order; for each cell a uniform draw
    /// decides inclusion and included cells get an N(0, 1) value. The
    /// iteration order makes generation reproducible for a fixed seed.
    ///
    /// ### Params
    ///
    /// * `n_rows` - Number of random vectors
    /// * `n_cols` - Data dimensionality
    /// * `density` - Inclusion probability per cell, in (0, 1]
    /// * `seed` - Random seed; 0 seeds from platform entropy
    pub fn sparse(n_rows: usize, n_cols: usize, density: f32, seed: u64) -> Self {
        assert!(
            density > 0.0 && density <= 1.0,
            "density must lie in (0, 1], got {}",
            density
        );

        let mut rng = make_rng(seed);
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();

        indptr.push(0);
        for _ in 0..n_rows {
            for col in 0..n_cols {
                let u: f32 = rng.random();
                if u > density {
                    continue;
                }
                col_indices.push(col as u32);
                values.push(rng.sample(StandardNormal));
            }
            indptr.push(col_indices.len());
        }

        ProjectionMatrix::Sparse(SparseProjection {
            n_rows,
            n_cols,
            indptr,
            col_indices,
            values,
        })
    }

    /// Pool with no rows, used by trimmed-to-zero forests
    pub(crate) fn empty(n_cols: usize) -> Self {
        ProjectionMatrix::Dense(DenseProjection {
            n_rows: 0,
            n_cols,
            data: Vec::new(),
        })
    }

    /// Number of random vectors in the pool
    pub fn n_rows(&self) -> usize {
        match self {
            ProjectionMatrix::Dense(m) => m.n_rows,
            ProjectionMatrix::Sparse(m) => m.n_rows,
        }
    }

    /// Data dimensionality the pool projects from
    pub fn n_cols(&self) -> usize {
        match self {
            ProjectionMatrix::Dense(m) => m.n_cols,
            ProjectionMatrix::Sparse(m) => m.n_cols,
        }
    }

    /// Whether the sparse representation is in use
    pub fn is_sparse(&self) -> bool {
        matches!(self, ProjectionMatrix::Sparse(_))
    }

    ////////////////
    // Projection //
    ////////////////

    /// Project a single vector through the full pool
    ///
    /// ### Params
    ///
    /// * `q` - Input vector of length `n_cols`
    ///
    /// ### Returns
    ///
    /// The projected coordinates, one per pool row
    pub fn project(&self, q: &[f32]) -> Vec<f32> {
        debug_assert_eq!(q.len(), self.n_cols());

        match self {
            ProjectionMatrix::Dense(m) => (0..m.n_rows)
                .map(|r| {
                    let row = &m.data[r * m.n_cols..(r + 1) * m.n_cols];
                    row.iter().zip(q.iter()).map(|(a, b)| a * b).sum()
                })
                .collect(),
            ProjectionMatrix::Sparse(m) => (0..m.n_rows)
                .map(|r| {
                    let begin = m.indptr[r];
                    let end = m.indptr[r + 1];
                    m.col_indices[begin..end]
                        .iter()
                        .zip(m.values[begin..end].iter())
                        .map(|(&c, &v)| v * q[c as usize])
                        .sum()
                })
                .collect(),
        }
    }

    /// Project every column of a data matrix through a row block
    ///
    /// Computes the `n_rows x n_samples` product of pool rows
    /// `[row_begin, row_begin + n_rows)` against the full data matrix.
    /// This is the per-tree projection used during growth: tree t owns
    /// rows `[t * depth, (t + 1) * depth)`.
    ///
    /// ### Params
    ///
    /// * `row_begin` - First pool row of the block
    /// * `n_rows` - Number of rows in the block
    /// * `x` - Data matrix, dim rows x n_samples columns
    ///
    /// ### Returns
    ///
    /// Flat row-major result: entry `r * n_samples + j` is the projection
    /// of point j onto block row r
    pub fn project_block(&self, row_begin: usize, n_rows: usize, x: MatRef<f32>) -> Vec<f32> {
        debug_assert_eq!(x.nrows(), self.n_cols());
        let n_samples = x.ncols();
        let mut out = vec![0.0f32; n_rows * n_samples];

        match self {
            ProjectionMatrix::Dense(m) => {
                for r in 0..n_rows {
                    let row_start = (row_begin + r) * m.n_cols;
                    let row = &m.data[row_start..row_start + m.n_cols];
                    for j in 0..n_samples {
                        out[r * n_samples + j] = row
                            .iter()
                            .zip(x.col(j).iter())
                            .map(|(a, b)| a * b)
                            .sum();
                    }
                }
            }
            ProjectionMatrix::Sparse(m) => {
                for r in 0..n_rows {
                    let begin = m.indptr[row_begin + r];
                    let end = m.indptr[row_begin + r + 1];
                    let cols = &m.col_indices[begin..end];
                    let vals = &m.values[begin..end];
                    for j in 0..n_samples {
                        let mut acc = 0.0f32;
                        for (&c, &v) in cols.iter().zip(vals.iter()) {
                            acc += v * x[(c as usize, j)];
                        }
                        out[r * n_samples + j] = acc;
                    }
                }
            }
        }

        out
    }

    //////////////
    // Trimming //
    //////////////

    /// Copy out the pool of a trimmed forest
    ///
    /// For each kept tree t in `[0, n_trees)`, copies rows
    /// `[t * depth_max, t * depth_max + depth)`; the stride stays the
    /// per-tree `depth_max` of this pool, only the prefix kept per tree
    /// shrinks. The result
    /// owns its storage and shares nothing with the parent.
    ///
    /// ### Params
    ///
    /// * `n_trees` - Trees kept by the trim
    /// * `depth` - Levels kept per tree
    /// * `depth_max` - Per-tree row stride of this (parent) pool
    pub fn subset(&self, n_trees: usize, depth: usize, depth_max: usize) -> ProjectionMatrix {
        match self {
            ProjectionMatrix::Dense(m) => {
                let mut data = Vec::with_capacity(n_trees * depth * m.n_cols);
                for t in 0..n_trees {
                    let begin = t * depth_max * m.n_cols;
                    data.extend_from_slice(&m.data[begin..begin + depth * m.n_cols]);
                }
                ProjectionMatrix::Dense(DenseProjection {
                    n_rows: n_trees * depth,
                    n_cols: m.n_cols,
                    data,
                })
            }
            ProjectionMatrix::Sparse(m) => {
                let mut indptr = Vec::with_capacity(n_trees * depth + 1);
                let mut col_indices = Vec::new();
                let mut values = Vec::new();

                indptr.push(0);
                for t in 0..n_trees {
                    for d in 0..depth {
                        let r = t * depth_max + d;
                        let begin = m.indptr[r];
                        let end = m.indptr[r + 1];
                        col_indices.extend_from_slice(&m.col_indices[begin..end]);
                        values.extend_from_slice(&m.values[begin..end]);
                        indptr.push(col_indices.len());
                    }
                }
                ProjectionMatrix::Sparse(SparseProjection {
                    n_rows: n_trees * depth,
                    n_cols: m.n_cols,
                    indptr,
                    col_indices,
                    values,
                })
            }
        }
    }

    /////////////////
    // Persistence //
    /////////////////

    /// Number of stored entries (dense pools store every cell)
    pub(crate) fn nnz(&self) -> usize {
        match self {
            ProjectionMatrix::Dense(m) => m.data.len(),
            ProjectionMatrix::Sparse(m) => m.values.len(),
        }
    }

    /// Dense row-major entries; None for the sparse variant
    pub(crate) fn dense_data(&self) -> Option<&[f32]> {
        match self {
            ProjectionMatrix::Dense(m) => Some(&m.data),
            ProjectionMatrix::Sparse(_) => None,
        }
    }

    /// Stored sparse entries as (row, col, value) in row-major order
    pub(crate) fn triplets(&self) -> Vec<(u32, u32, f32)> {
        match self {
            ProjectionMatrix::Dense(_) => Vec::new(),
            ProjectionMatrix::Sparse(m) => {
                let mut out = Vec::with_capacity(m.values.len());
                for r in 0..m.n_rows {
                    for idx in m.indptr[r]..m.indptr[r + 1] {
                        out.push((r as u32, m.col_indices[idx], m.values[idx]));
                    }
                }
                out
            }
        }
    }

    /// Rebuild a sparse pool from stored triplets
    ///
    /// Triplets may arrive in any order; they are bucketed per row before
    /// the CSR arrays are assembled.
    pub(crate) fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        triplets: &[(u32, u32, f32)],
    ) -> ProjectionMatrix {
        let mut rows: Vec<Vec<(u32, f32)>> = vec![Vec::new(); n_rows];
        for &(r, c, v) in triplets {
            rows[r as usize].push((c, v));
        }

        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len());

        indptr.push(0);
        for row in &mut rows {
            row.sort_unstable_by_key(|&(c, _)| c);
            for &(c, v) in row.iter() {
                col_indices.push(c);
                values.push(v);
            }
            indptr.push(col_indices.len());
        }

        ProjectionMatrix::Sparse(SparseProjection {
            n_rows,
            n_cols,
            indptr,
            col_indices,
            values,
        })
    }

    /// Rebuild a dense pool from stored row-major entries
    pub(crate) fn from_dense_data(n_rows: usize, n_cols: usize, data: Vec<f32>) -> ProjectionMatrix {
        assert_eq!(data.len(), n_rows * n_cols);
        ProjectionMatrix::Dense(DenseProjection {
            n_rows,
            n_cols,
            data,
        })
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use faer::Mat;

    #[test]
    fn test_dense_reproducibility() {
        let a = ProjectionMatrix::dense(6, 4, 42);
        let b = ProjectionMatrix::dense(6, 4, 42);

        assert_eq!(a.dense_data().unwrap(), b.dense_data().unwrap());
    }

    #[test]
    fn test_dense_different_seeds() {
        let a = ProjectionMatrix::dense(6, 4, 42);
        let b = ProjectionMatrix::dense(6, 4, 43);

        assert_ne!(a.dense_data().unwrap(), b.dense_data().unwrap());
    }

    #[test]
    fn test_sparse_reproducibility() {
        let a = ProjectionMatrix::sparse(8, 16, 0.25, 7);
        let b = ProjectionMatrix::sparse(8, 16, 0.25, 7);

        assert_eq!(a.triplets(), b.triplets());
    }

    #[test]
    fn test_sparse_density_bounds() {
        // Full density keeps every cell
        let full = ProjectionMatrix::sparse(4, 8, 1.0, 1);
        assert_eq!(full.nnz(), 32);

        // Low density stores strictly fewer
        let thin = ProjectionMatrix::sparse(4, 8, 0.1, 1);
        assert!(thin.nnz() < 32);
    }

    #[test]
    fn test_project_matches_manual_dot() {
        let p = ProjectionMatrix::dense(3, 4, 42);
        let q = vec![1.0f32, -2.0, 0.5, 3.0];

        let projected = p.project(&q);
        let data = p.dense_data().unwrap();

        for r in 0..3 {
            let expected: f32 = (0..4).map(|c| data[r * 4 + c] * q[c]).sum();
            assert_relative_eq!(projected[r], expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sparse_project_matches_triplets() {
        let p = ProjectionMatrix::sparse(5, 6, 0.5, 11);
        let q = vec![0.5f32, 1.0, -1.0, 2.0, 0.0, -0.5];

        let projected = p.project(&q);

        let mut expected = vec![0.0f32; 5];
        for (r, c, v) in p.triplets() {
            expected[r as usize] += v * q[c as usize];
        }
        for r in 0..5 {
            assert_relative_eq!(projected[r], expected[r], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_project_block_matches_project() {
        let p = ProjectionMatrix::dense(6, 3, 9);
        let x = Mat::from_fn(3, 4, |i, j| (i * 4 + j) as f32 * 0.1 - 0.5);

        // Project each column individually through the full pool
        let block = p.project_block(2, 2, x.as_ref());

        for j in 0..4 {
            let col: Vec<f32> = x.col(j).iter().copied().collect();
            let full = p.project(&col);
            assert_relative_eq!(block[j], full[2], epsilon = 1e-6);
            assert_relative_eq!(block[4 + j], full[3], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_sparse_project_block_matches_project() {
        let p = ProjectionMatrix::sparse(6, 3, 0.6, 13);
        let x = Mat::from_fn(3, 5, |i, j| (i as f32 - j as f32) * 0.3);

        let block = p.project_block(3, 3, x.as_ref());

        for j in 0..5 {
            let col: Vec<f32> = x.col(j).iter().copied().collect();
            let full = p.project(&col);
            for r in 0..3 {
                assert_relative_eq!(block[r * 5 + j], full[3 + r], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_subset_strides_over_depth_max() {
        // 2 trees at depth_max 3; keep both trees at depth 2
        let p = ProjectionMatrix::dense(6, 4, 21);
        let sub = p.subset(2, 2, 3);

        assert_eq!(sub.n_rows(), 4);
        let full = p.dense_data().unwrap();
        let trimmed = sub.dense_data().unwrap();

        // Tree 0 keeps rows 0, 1; tree 1 keeps rows 3, 4
        assert_eq!(&trimmed[0..8], &full[0..8]);
        assert_eq!(&trimmed[8..16], &full[12..20]);
    }

    #[test]
    fn test_sparse_subset_strides_over_depth_max() {
        let p = ProjectionMatrix::sparse(6, 8, 0.5, 3);
        let sub = p.subset(2, 2, 3);

        assert_eq!(sub.n_rows(), 4);

        let full: Vec<_> = p.triplets();
        let expected: Vec<(u32, u32, f32)> = full
            .iter()
            .filter(|&&(r, _, _)| r % 3 < 2)
            .map(|&(r, c, v)| ((r / 3) * 2 + r % 3, c, v))
            .collect();

        assert_eq!(sub.triplets(), expected);
    }

    #[test]
    fn test_triplet_round_trip() {
        let p = ProjectionMatrix::sparse(5, 7, 0.4, 17);
        let trips = p.triplets();

        let rebuilt = ProjectionMatrix::from_triplets(5, 7, &trips);
        assert_eq!(rebuilt.triplets(), trips);

        let q = vec![1.0f32; 7];
        assert_eq!(p.project(&q), rebuilt.project(&q));
    }

    #[test]
    fn test_empty_pool() {
        let p = ProjectionMatrix::empty(4);
        assert_eq!(p.n_rows(), 0);
        assert!(p.project(&[1.0, 2.0, 3.0, 4.0]).is_empty());
    }
}
