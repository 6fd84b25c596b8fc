//! Unsupervised decompositions used by the exploratory analysis.

use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{FerError, Result};

const EPS: f64 = 1e-10;
const POWER_ITERATIONS: usize = 12;

/// Principal component analysis with whitening.
#[derive(Debug, Clone)]
pub struct Pca {
    pub mean: Array1<f64>,
    /// `k × d`, rows ordered by decreasing variance.
    pub components: Array2<f64>,
    pub explained_variance: Array1<f64>,
    pub total_variance: f64,
    pub whiten: bool,
}

impl Pca {
    /// Fits the top `n_components` directions of `x` (`n × d`) by randomized
    /// subspace iteration followed by a Rayleigh-Ritz step.
    pub fn fit(x: ArrayView2<'_, f64>, n_components: usize, seed: u64) -> Result<Self> {
        let (n, d) = x.dim();
        if n == 0 {
            return Err(FerError::Empty("PCA needs at least one sample"));
        }
        let k = n_components.min(n).min(d);
        if k == 0 {
            return Err(FerError::InvalidConfig("PCA needs at least one component".into()));
        }

        let mean = x
            .mean_axis(Axis(0))
            .ok_or(FerError::Empty("PCA needs at least one sample"))?;
        let centered = &x - &mean;
        let dof = (n.max(2) - 1) as f64;
        let total_variance = centered.iter().map(|v| v * v).sum::<f64>() / dof;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut q = Array2::from_shape_fn((d, k), |_| rng.sample::<f64, _>(StandardNormal));
        orthonormalize_columns(&mut q);
        for _ in 0..POWER_ITERATIONS {
            let y = centered.dot(&q);
            q = centered.t().dot(&y);
            orthonormalize_columns(&mut q);
        }

        // Project onto the subspace and diagonalize the small k × k problem.
        let b = centered.dot(&q);
        let (eigenvalues, eigenvectors) = symmetric_eigen(b.t().dot(&b));
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

        let rotated = q.dot(&eigenvectors);
        let mut components = Array2::zeros((k, d));
        let mut explained_variance = Array1::zeros(k);
        for (row, &i) in order.iter().enumerate() {
            components.row_mut(row).assign(&rotated.column(i));
            explained_variance[row] = eigenvalues[i].max(0.0) / dof;
        }
        debug!("PCA fitted {k} components on {n}×{d}");

        Ok(Self {
            mean,
            components,
            explained_variance,
            total_variance,
            whiten: true,
        })
    }

    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        if self.total_variance <= EPS {
            return Array1::zeros(self.explained_variance.len());
        }
        &self.explained_variance / self.total_variance
    }

    /// Projects `x` onto the components, scaled to unit variance when whitening.
    pub fn transform(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut projected = (&x - &self.mean).dot(&self.components.t());
        if self.whiten {
            for (mut col, &var) in projected.columns_mut().into_iter().zip(&self.explained_variance) {
                let scale = if var > EPS { var.sqrt().recip() } else { 0.0 };
                col.mapv_inplace(|v| v * scale);
            }
        }
        projected
    }
}

#[derive(Debug, Clone)]
pub struct NmfConfig {
    pub n_components: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub seed: u64,
}

impl NmfConfig {
    pub fn new(n_components: usize, seed: u64) -> Self {
        Self {
            n_components,
            max_iter: 200,
            tol: 1e-4,
            seed,
        }
    }
}

/// Non-negative matrix factorization `X ≈ W H` under Frobenius loss.
#[derive(Debug, Clone)]
pub struct Nmf {
    /// `k × d`, every entry non-negative.
    pub components: Array2<f64>,
    pub reconstruction_error: f64,
    pub n_iter: usize,
}

impl Nmf {
    pub fn fit(x: ArrayView2<'_, f64>, config: &NmfConfig) -> Result<Self> {
        let (n, d) = x.dim();
        let k = config.n_components;
        if n == 0 {
            return Err(FerError::Empty("NMF needs at least one sample"));
        }
        if k == 0 {
            return Err(FerError::InvalidConfig("NMF needs at least one component".into()));
        }
        if x.iter().any(|&v| v < 0.0) {
            return Err(FerError::InvalidConfig("NMF input must be non-negative".into()));
        }

        let scale = (x.mean().unwrap_or(0.0) / k as f64).sqrt();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut draw = |shape: (usize, usize)| {
            Array2::from_shape_fn(shape, |_| scale * rng.sample::<f64, _>(StandardNormal).abs())
        };
        let mut w = draw((n, k));
        let mut h = draw((k, d));

        let x_norm2: f64 = x.iter().map(|v| v * v).sum();
        let initial_error = frobenius_error(x, &w, &h, x_norm2);
        let mut previous_error = initial_error;
        let mut n_iter = 0;

        for iter in 1..=config.max_iter {
            let numer = w.t().dot(&x);
            let denom = w.t().dot(&w).dot(&h);
            Zip::from(&mut h)
                .and(&numer)
                .and(&denom)
                .for_each(|h, &a, &b| *h *= a / (b + EPS));

            let numer = x.dot(&h.t());
            let denom = w.dot(&h.dot(&h.t()));
            Zip::from(&mut w)
                .and(&numer)
                .and(&denom)
                .for_each(|w, &a, &b| *w *= a / (b + EPS));

            n_iter = iter;
            if config.tol > 0.0 && iter % 10 == 0 {
                let error = frobenius_error(x, &w, &h, x_norm2);
                if initial_error > 0.0 && (previous_error - error) / initial_error < config.tol {
                    break;
                }
                previous_error = error;
            }
        }

        let reconstruction_error = frobenius_error(x, &w, &h, x_norm2);
        debug!("NMF k={k} stopped after {n_iter} iterations, error {reconstruction_error:.3}");

        Ok(Self {
            components: h,
            reconstruction_error,
            n_iter,
        })
    }

    /// Average of the component images.
    pub fn mean_component(&self) -> Array1<f64> {
        self.components
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.components.ncols()))
    }
}

/// `||X - WH||_F` without materializing `WH`.
fn frobenius_error(x: ArrayView2<'_, f64>, w: &Array2<f64>, h: &Array2<f64>, x_norm2: f64) -> f64 {
    let cross: f64 = (w * &x.dot(&h.t())).sum();
    let gram: f64 = (&w.t().dot(w) * &h.dot(&h.t())).sum();
    (x_norm2 - 2.0 * cross + gram).max(0.0).sqrt()
}

/// Modified Gram-Schmidt on the columns; degenerate columns become zero.
fn orthonormalize_columns(q: &mut Array2<f64>) {
    for j in 0..q.ncols() {
        for i in 0..j {
            let prev = q.column(i).to_owned();
            let proj = prev.dot(&q.column(j));
            q.column_mut(j).scaled_add(-proj, &prev);
        }
        let norm = q.column(j).dot(&q.column(j)).sqrt();
        if norm > 1e-12 {
            q.column_mut(j).mapv_inplace(|v| v / norm);
        } else {
            q.column_mut(j).fill(0.0);
        }
    }
}

/// Cyclic Jacobi eigen-decomposition of a small symmetric matrix.
/// Returns eigenvalues and eigenvectors as columns.
fn symmetric_eigen(mut a: Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let k = a.nrows();
    let mut v = Array2::eye(k);

    for _sweep in 0..100 {
        let off: f64 = (0..k)
            .flat_map(|i| (0..k).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[[i, j]] * a[[i, j]])
            .sum();
        if off < 1e-20 {
            break;
        }
        for p in 0..k {
            for q in p + 1..k {
                if a[[p, q]].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = (t * t + 1.0).sqrt().recip();
                let s = t * c;

                for r in 0..k {
                    let arp = a[[r, p]];
                    let arq = a[[r, q]];
                    a[[r, p]] = c * arp - s * arq;
                    a[[r, q]] = s * arp + c * arq;
                }
                for r in 0..k {
                    let apr = a[[p, r]];
                    let aqr = a[[q, r]];
                    a[[p, r]] = c * apr - s * aqr;
                    a[[q, r]] = s * apr + c * aqr;
                }
                for r in 0..k {
                    let vrp = v[[r, p]];
                    let vrq = v[[r, q]];
                    v[[r, p]] = c * vrp - s * vrq;
                    v[[r, q]] = s * vrp + c * vrq;
                }
            }
        }
    }

    (a.diag().to_owned(), v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    fn rank_one(n: usize) -> (Array2<f64>, Array1<f64>) {
        let direction = array![1.0f64, 2.0, 0.0, -1.0, 3.0, 1.0];
        let direction = &direction / direction.dot(&direction).sqrt();
        let offset = array![5.0, 5.0, 5.0, 5.0, 5.0, 5.0];
        let mut x = Array2::zeros((n, 6));
        for i in 0..n {
            let a = i as f64 - n as f64 / 2.0;
            x.row_mut(i).assign(&(&offset + &(&direction * a)));
        }
        (x, direction)
    }

    #[test]
    fn pca_recovers_rank_one_direction() {
        let (x, direction) = rank_one(40);
        let pca = Pca::fit(x.view(), 2, 7).unwrap();

        let alignment = pca.components.row(0).dot(&direction).abs();
        assert!(alignment > 0.999, "alignment {alignment}");
        let ratio = pca.explained_variance_ratio();
        assert!(ratio[0] > 0.999);
        assert!(ratio[1] < 1e-6);
    }

    #[test]
    fn pca_mean_is_column_mean() {
        let x = array![[0.0, 10.0], [2.0, 20.0], [4.0, 30.0]];
        let pca = Pca::fit(x.view(), 1, 1).unwrap();
        assert!((pca.mean[0] - 2.0).abs() < 1e-12);
        assert!((pca.mean[1] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn whitened_projection_has_unit_variance() {
        let (x, _) = rank_one(30);
        let pca = Pca::fit(x.view(), 1, 3).unwrap();
        let z = pca.transform(x.view());
        let var = z.column(0).iter().map(|v| v * v).sum::<f64>() / 29.0;
        assert!((var - 1.0).abs() < 1e-6, "variance {var}");
    }

    #[test]
    fn jacobi_diagonalizes() {
        let m = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 1.0]];
        let (values, vectors) = symmetric_eigen(m.clone());
        let reconstructed = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for (a, b) in reconstructed.iter().zip(m.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn nmf_components_are_non_negative_and_error_shrinks() {
        let w0 = array![[1.0f64, 0.0], [0.5, 0.5], [0.0, 1.0], [2.0, 1.0], [0.3, 1.7]];
        let h0 = array![[3.0, 0.0, 1.0, 2.0], [0.0, 4.0, 1.0, 0.5]];
        let x = w0.dot(&h0);

        let one_step = Nmf::fit(
            x.view(),
            &NmfConfig {
                max_iter: 1,
                ..NmfConfig::new(2, 5)
            },
        )
        .unwrap();
        let converged = Nmf::fit(x.view(), &NmfConfig::new(2, 5)).unwrap();

        assert!(converged.components.iter().all(|&v| v >= 0.0));
        assert_eq!(converged.components.dim(), (2, 4));
        assert!(converged.reconstruction_error <= one_step.reconstruction_error);
        assert_eq!(converged.mean_component().len(), 4);
    }

    #[test]
    fn nmf_rejects_negative_input() {
        let x = array![[1.0, -1.0]];
        assert!(Nmf::fit(x.view(), &NmfConfig::new(1, 0)).is_err());
    }

    #[test]
    fn empty_input_is_an_error() {
        let x = Array2::<f64>::zeros((0, 4));
        assert!(Pca::fit(x.view(), 2, 0).is_err());
        assert!(Nmf::fit(x.slice(s![.., ..]), &NmfConfig::new(2, 0)).is_err());
    }
}
