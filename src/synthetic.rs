use faer::traits::ComplexField;
use faer::Mat;
use num_traits::{Float, FromPrimitive};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Generate isotropic Gaussian data
///
/// Every coordinate is an independent N(0, 1) draw. Laid out with one
/// column per point, matching the orientation the index consumes.
///
/// ### Params
///
/// * `dim` - Embedding dimensionality
/// * `n_samples` - Number of points
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (dim, n_samples); column j is point j
pub fn generate_gaussian_data<T>(dim: usize, n_samples: usize, seed: u64) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Mat::<T>::zeros(dim, n_samples);

    for j in 0..n_samples {
        for i in 0..dim {
            let value: f64 = rng.sample(StandardNormal);
            data[(i, j)] = T::from_f64(value).unwrap();
        }
    }

    data
}

/// Generate synthetic data with cluster structure
///
/// Creates multiple Gaussian clusters with separated centres, shuffling
/// the assignments so clusters are not stored contiguously.
///
/// ### Params
///
/// * `dim` - Embedding dimensionality
/// * `n_samples` - Number of points
/// * `n_clusters` - Number of distinct clusters
/// * `cluster_std` - Standard deviation within clusters
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (dim, n_samples); column j is point j
pub fn generate_clustered_data<T>(
    dim: usize,
    n_samples: usize,
    n_clusters: usize,
    cluster_std: f64,
    seed: u64,
) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Mat::<T>::zeros(dim, n_samples);

    // Cluster centres with reasonable separation
    let mut centres = Vec::with_capacity(n_clusters);
    for _ in 0..n_clusters {
        let centre: Vec<f64> = (0..dim).map(|_| rng.random_range(-5.0..5.0)).collect();
        centres.push(centre);
    }

    // Shuffled cluster assignments, balanced up to the remainder
    let base_size = n_samples / n_clusters;
    let remainder = n_samples % n_clusters;

    let mut cluster_assignments = Vec::with_capacity(n_samples);
    for cluster_idx in 0..n_clusters {
        let n_in_cluster = base_size + if cluster_idx < remainder { 1 } else { 0 };
        cluster_assignments.extend(vec![cluster_idx; n_in_cluster]);
    }
    cluster_assignments.shuffle(&mut rng);

    for (j, &cluster_idx) in cluster_assignments.iter().enumerate() {
        let centre = &centres[cluster_idx];
        for i in 0..dim {
            let noise: f64 = rng.sample(StandardNormal);
            data[(i, j)] = T::from_f64(centre[i] + noise * cluster_std).unwrap();
        }
    }

    data
}

///////////
// Tests //
///////////
