//! Small numeric helpers shared across the pipeline.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn, Matrix3};
use nalgebra_sparse::CscMatrix;

/// Symmetric part of a 3×3 tensor.
pub fn symmetric_part(tensor: &Matrix3<f64>) -> Matrix3<f64> {
    (tensor + tensor.transpose()) / 2.0
}

/// Sparse matrix–vector product `y = A x`.
///
/// Written out by column so the accumulation order is fixed and independent
/// of any parallel decomposition upstream.
pub fn csc_mul_vector(matrix: &CscMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    assert_eq!(matrix.ncols(), x.len(), "dimension mismatch in sparse matrix-vector product");
    let mut y = DVector::zeros(matrix.nrows());
    for (j, col) in matrix.col_iter().enumerate() {
        let xj = x[j];
        if xj != 0.0 {
            for (&i, &value) in col.row_indices().iter().zip(col.values()) {
                y[i] += value * xj;
            }
        }
    }
    y
}

/// Sparse transposed matrix–vector product `y = Aᵀ x`.
pub fn csc_tr_mul_vector(matrix: &CscMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    assert_eq!(matrix.nrows(), x.len(), "dimension mismatch in sparse transposed matrix-vector product");
    let mut y = DVector::zeros(matrix.ncols());
    for (j, col) in matrix.col_iter().enumerate() {
        let mut dot = 0.0;
        for (&i, &value) in col.row_indices().iter().zip(col.values()) {
            dot += value * x[i];
        }
        y[j] = dot;
    }
    y
}

/// Cholesky factorization that also rejects nearly rank-deficient matrices.
///
/// A positive-semidefinite normal matrix can slip through a plain Cholesky
/// with round-off-sized pivots; the factor diagonal is therefore required to
/// span no more than `1/tolerance` in ratio.
pub fn well_conditioned_cholesky(matrix: DMatrix<f64>, tolerance: f64) -> Option<Cholesky<f64, Dyn>> {
    let cholesky = matrix.cholesky()?;
    let factor = cholesky.l_dirty();
    let mut smallest = f64::INFINITY;
    let mut largest = 0.0f64;
    for i in 0..factor.nrows() {
        let diagonal = factor[(i, i)];
        smallest = smallest.min(diagonal);
        largest = largest.max(diagonal);
    }
    (smallest.is_finite() && smallest > tolerance * largest).then_some(cholesky)
}

/// Median of a sample set. Averages the middle pair for even lengths.
fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(f64::total_cmp);
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / 2.0
    }
}

/// Consistency factor making the MAD estimate the standard deviation for
/// normally distributed samples.
const MAD_CONSISTENCY: f64 = 0.6745;

/// Flags outliers by the modified Z-score criterion: a sample is an outlier
/// when `0.6745 |x - median| / MAD` exceeds `threshold`.
///
/// Returns the indices of the flagged samples. When the median absolute
/// deviation vanishes (at least half the samples identical) every deviating
/// sample is flagged.
pub fn mad_outliers(samples: &[f64], threshold: f64) -> Vec<usize> {
    if samples.len() < 2 {
        return Vec::new();
    }

    let mut sorted = samples.to_vec();
    let center = median(&mut sorted);

    let mut deviations: Vec<f64> = samples.iter().map(|x| (x - center).abs()).collect();
    let mut sorted_deviations = deviations.clone();
    let mad = median(&mut sorted_deviations);

    if mad == 0.0 {
        return deviations
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0.0)
            .map(|(i, _)| i)
            .collect();
    }

    deviations
        .iter_mut()
        .for_each(|d| *d = MAD_CONSISTENCY * *d / mad);
    deviations
        .iter()
        .enumerate()
        .filter(|(_, &score)| score > threshold)
        .map(|(i, _)| i)
        .collect()
}
