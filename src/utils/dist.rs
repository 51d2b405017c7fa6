use faer::MatRef;

///////////////
// Distances //
///////////////

/// Squared Euclidean distance between a data-matrix column and a query
///
/// ### Implementation note
///
/// Uses an iterator-based approach which allows LLVM to auto-vectorise
/// optimally for the target CPU. Returns the squared distance; the query
/// path takes square roots only on the final k results.
///
/// ### Params
///
/// * `x` - Data matrix, dim rows x n_samples columns
/// * `col` - Column (data point) index
/// * `q` - Query slice of length dim
///
/// ### Returns
///
/// The squared Euclidean distance
#[inline(always)]
pub fn euclidean_sq_to_col(x: MatRef<f32>, col: usize, q: &[f32]) -> f32 {
    x.col(col)
        .iter()
        .zip(q.iter())
        .map(|(&a, &b)| {
            let diff = a - b;
            diff * diff
        })
        .sum()
}

/// Squared Euclidean distance between two slices
///
/// ### Params
///
/// * `a` - First vector
/// * `b` - Second vector
///
/// ### Returns
///
/// The squared Euclidean distance
#[inline(always)]
pub fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

///////////
// Tests //
///////////
