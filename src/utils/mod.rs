pub mod dist;

use rustc_hash::FxHashSet;

////////////////
// Validation //
////////////////

/// Recall of an approximate result list against exact ground truth
///
/// Sentinel entries (-1) in the approximate list are ignored.
///
/// ### Params
///
/// * `approx` - Indices returned by an approximate query, -1 padded
/// * `exact` - The true nearest neighbour indices
///
/// ### Returns
///
/// Fraction of the true neighbours present in the approximate list
pub fn recall_at_k(approx: &[i32], exact: &[usize]) -> f64 {
    if exact.is_empty() {
        return 0.0;
    }

    let found: FxHashSet<i32> = approx.iter().copied().filter(|&v| v >= 0).collect();
    let matches = exact
        .iter()
        .filter(|&&idx| found.contains(&(idx as i32)))
        .count();

    matches as f64 / exact.len() as f64
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recall_perfect() {
        let approx = vec![0, 1, 2, 3];
        let exact = vec![3, 2, 1, 0];
        assert_eq!(recall_at_k(&approx, &exact), 1.0);
    }

    #[test]
    fn test_recall_partial() {
        let approx = vec![0, 1, 8, 9];
        let exact = vec![0, 1, 2, 3];
        assert_eq!(recall_at_k(&approx, &exact), 0.5);
    }

    #[test]
    fn test_recall_ignores_sentinels() {
        let approx = vec![0, -1, -1, -1];
        let exact = vec![0, 1, 2, 3];
        assert_eq!(recall_at_k(&approx, &exact), 0.25);
    }

    #[test]
    fn test_recall_empty_truth() {
        assert_eq!(recall_at_k(&[0, 1], &[]), 0.0);
    }
}
