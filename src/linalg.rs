// linalg.rs — Small dense linear algebra for the per-pixel solves.
//
// Two very different sizes of problem show up in flow estimation:
//
// 1. Tiny symmetric systems (2×2 structure tensors, Hessians, covariances),
//    solved millions of times. These use fixed-size arrays and a cyclic
//    Jacobi eigen-solver, with no heap allocation.
//
// 2. The Fleet-Jepson affine fit: an overdetermined k×6 system (k up to a
//    few hundred normals) solved by SVD pseudo-inverse. That one goes
//    through nalgebra's DMatrix.
//
// Neither path panics or errors on ill-conditioning. Jacobi reports
// non-convergence as a value, and the pseudo-inverse reports its condition
// number. The caller turns both into an Invalid pixel.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Sweeps before Jacobi gives up. Symmetric 2×2 / 3×3 inputs converge in a
/// handful; hitting the cap means NaN or Inf crept into the matrix.
const MAX_SWEEPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinalgError {
    #[error("Jacobi eigen-decomposition did not converge in {0} sweeps")]
    NoConvergence(usize),
}

// ---------------------------------------------------------------------------
// Jacobi eigen-decomposition
// ---------------------------------------------------------------------------

/// Eigenpairs of a symmetric N×N matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymmetricEigen<const N: usize> {
    pub values: [f64; N],
    /// Column k is the unit eigenvector of `values[k]`.
    pub vectors: [[f64; N]; N],
}

impl<const N: usize> SymmetricEigen<N> {
    /// Order eigenpairs by ascending eigenvalue.
    pub fn sort(&mut self) {
        let mut order: [usize; N] = std::array::from_fn(|i| i);
        order.sort_by(|&a, &b| self.values[a].total_cmp(&self.values[b]));
        let values = self.values;
        let vectors = self.vectors;
        for (dst, &src) in order.iter().enumerate() {
            self.values[dst] = values[src];
            for row in 0..N {
                self.vectors[row][dst] = vectors[row][src];
            }
        }
    }

    /// Eigenvector `k` as an array.
    pub fn vector(&self, k: usize) -> [f64; N] {
        std::array::from_fn(|row| self.vectors[row][k])
    }
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
///
/// Only the upper triangle drives the rotations; the input is assumed
/// symmetric. The eigenpairs come back unsorted, call `sort()` for
/// ascending order.
pub fn jacobi<const N: usize>(m: [[f64; N]; N]) -> Result<SymmetricEigen<N>, LinalgError> {
    let mut a = m;
    let mut v = identity::<N>();

    let scale: f64 = a.iter().flatten().map(|x| x * x).sum();
    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..N)
            .flat_map(|p| (p + 1..N).map(move |q| (p, q)))
            .map(|(p, q)| a[p][q] * a[p][q])
            .sum();
        if off <= 1e-24 * scale {
            return Ok(SymmetricEigen {
                values: std::array::from_fn(|i| a[i][i]),
                vectors: v,
            });
        }

        for p in 0..N {
            for q in p + 1..N {
                if a[p][q] == 0.0 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..N {
                    let (akp, akq) = (a[k][p], a[k][q]);
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..N {
                    let (apk, aqk) = (a[p][k], a[q][k]);
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let (vp, vq) = (row[p], row[q]);
                    row[p] = c * vp - s * vq;
                    row[q] = s * vp + c * vq;
                }
            }
        }
    }
    Err(LinalgError::NoConvergence(MAX_SWEEPS))
}

/// `|λ|max / |λ|min` of a symmetric 2×2 matrix, infinite when singular.
pub fn condition_number2(m: [[f64; 2]; 2]) -> Result<f64, LinalgError> {
    let eig = jacobi(m)?;
    let (a, b) = (eig.values[0].abs(), eig.values[1].abs());
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    Ok(if lo == 0.0 { f64::INFINITY } else { hi / lo })
}

// ---------------------------------------------------------------------------
// Tiny fixed-size helpers
// ---------------------------------------------------------------------------

pub fn identity<const N: usize>() -> [[f64; N]; N] {
    std::array::from_fn(|i| std::array::from_fn(|j| if i == j { 1.0 } else { 0.0 }))
}

#[inline]
pub fn det2(m: [[f64; 2]; 2]) -> f64 {
    m[0][0] * m[1][1] - m[0][1] * m[1][0]
}

/// Inverse of a 2×2 matrix, `None` if the determinant is zero or not finite.
pub fn inverse2(m: [[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = det2(m);
    if det == 0.0 || !det.is_finite() {
        return None;
    }
    Some([
        [m[1][1] / det, -m[0][1] / det],
        [-m[1][0] / det, m[0][0] / det],
    ])
}

pub fn mat_vec<const N: usize>(m: &[[f64; N]; N], v: &[f64; N]) -> [f64; N] {
    std::array::from_fn(|i| (0..N).map(|j| m[i][j] * v[j]).sum())
}

pub fn mat_mul<const N: usize>(a: &[[f64; N]; N], b: &[[f64; N]; N]) -> [[f64; N]; N] {
    std::array::from_fn(|i| std::array::from_fn(|j| (0..N).map(|k| a[i][k] * b[k][j]).sum()))
}

pub fn mat_add<const N: usize>(a: &[[f64; N]; N], b: &[[f64; N]; N]) -> [[f64; N]; N] {
    std::array::from_fn(|i| std::array::from_fn(|j| a[i][j] + b[i][j]))
}

pub fn transpose<const N: usize>(m: &[[f64; N]; N]) -> [[f64; N]; N] {
    std::array::from_fn(|i| std::array::from_fn(|j| m[j][i]))
}

/// Frobenius norm.
pub fn frobenius<const N: usize>(m: &[[f64; N]; N]) -> f64 {
    m.iter().flatten().map(|x| x * x).sum::<f64>().sqrt()
}

// ---------------------------------------------------------------------------
// Pseudo-inverse
// ---------------------------------------------------------------------------

/// Moore-Penrose inverse together with the numbers needed to judge it.
#[derive(Debug, Clone)]
pub struct Pseudoinverse {
    /// n×m inverse of an m×n input.
    pub matrix: DMatrix<f64>,
    /// `σ_max / σ_min` over the retained singular values; infinite if none.
    pub condition: f64,
    /// Number of singular values retained.
    pub rank: usize,
}

impl Pseudoinverse {
    /// Least-squares solution `A⁺ b`.
    pub fn solve(&self, b: &DVector<f64>) -> DVector<f64> {
        &self.matrix * b
    }
}

/// SVD-based pseudo-inverse. Singular values `<= tolerance` are dropped.
///
/// Never fails on ill-conditioning: the condition number is reported and
/// the caller decides whether the solve is usable.
pub fn pseudoinverse(a: &DMatrix<f64>, tolerance: f64) -> Pseudoinverse {
    let (rows, cols) = a.shape();
    let svd = a.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Pseudoinverse {
            matrix: DMatrix::zeros(cols, rows),
            condition: f64::INFINITY,
            rank: 0,
        };
    };

    let sigma = &svd.singular_values;
    let sigma_max = sigma.iter().cloned().fold(0.0, f64::max);
    let mut sigma_min = f64::INFINITY;
    let mut rank = 0;
    let inv = DVector::from_iterator(
        sigma.len(),
        sigma.iter().map(|&s| {
            if s > tolerance && s > 0.0 {
                rank += 1;
                sigma_min = sigma_min.min(s);
                1.0 / s
            } else {
                0.0
            }
        }),
    );

    let matrix = v_t.transpose() * DMatrix::from_diagonal(&inv) * u.transpose();
    let condition = if rank == 0 { f64::INFINITY } else { sigma_max / sigma_min };
    Pseudoinverse {
        matrix,
        condition,
        rank,
    }
}
