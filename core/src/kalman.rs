//! Error-covariance engines: standard and UD-factorized Kalman filters
//!
//! The navigation filter separates the mechanization (which carries the
//! full state) from the error-covariance bookkeeping, which lives behind
//! the [`ErrorCovariance`] trait. Two engines implement it:
//!
//! - [`KalmanFilter`] holds `P` directly and runs the textbook equations:
//!   `P <- Phi P Phi^T + Gamma Q Gamma^T` for the time update and
//!   `K = P H^T (H P H^T + R)^-1`, `P <- (I - K H) P` for the measurement
//!   update.
//! - [`UdKalmanFilter`] never forms `P`: it carries the factors of
//!   `P = U D U^T` with `U` unit-upper-triangular and `D` diagonal. The
//!   time update is Thornton's modified weighted Gram-Schmidt over
//!   `[Phi U | Gamma]`; measurement updates are Bierman rank-one updates,
//!   one scalar measurement at a time. A measurement noise matrix with
//!   off-diagonal terms is first decorrelated through its own UD factors
//!   applied to `H` and the innovation.
//!
//! Both engines return the state correction `K * innovation` from the
//! measurement update; applying it to the full state is the caller's job.

use crate::matrix::{Matrix, MatrixError};

/// Covariance propagation and update primitives shared by the filter
/// variants. Jacobians are supplied by the caller (see `linearize`).
pub trait ErrorCovariance {
    /// `P <- Phi P Phi^T + Gamma Q Gamma^T`.
    fn time_update(
        &mut self,
        phi: &Matrix<f64>,
        gamma: &Matrix<f64>,
        q: &Matrix<f64>,
    ) -> Result<(), MatrixError>;

    /// Fold in an observation with Jacobian `h`, noise `r`, and innovation
    /// `z - h(x)`; returns the state correction to add.
    fn measurement_update(
        &mut self,
        h: &Matrix<f64>,
        r: &Matrix<f64>,
        innovation: &Matrix<f64>,
    ) -> Result<Matrix<f64>, MatrixError>;

    /// Current covariance (reconstituted for the factored engine).
    fn covariance(&self) -> Matrix<f64>;

    /// Overwrite the covariance (refactored for the factored engine).
    fn set_covariance(&mut self, p: &Matrix<f64>) -> Result<(), MatrixError>;

    fn dimension(&self) -> usize;

    fn boxed_clone(&self) -> Box<dyn ErrorCovariance>;
}

/// Standard covariance filter holding `P` explicitly.
pub struct KalmanFilter {
    p: Matrix<f64>,
}

impl KalmanFilter {
    pub fn new(p_diagonal: &[f64]) -> Self {
        let n = p_diagonal.len();
        let p = Matrix::new(n, n);
        for (i, value) in p_diagonal.iter().enumerate() {
            p.set(i, i, *value);
        }
        KalmanFilter { p }
    }
}

impl ErrorCovariance for KalmanFilter {
    fn time_update(
        &mut self,
        phi: &Matrix<f64>,
        gamma: &Matrix<f64>,
        q: &Matrix<f64>,
    ) -> Result<(), MatrixError> {
        let propagated = &(&(phi * &self.p) * &phi.transpose())
            + &(&(gamma * q) * &gamma.transpose());
        self.p = propagated;
        Ok(())
    }

    fn measurement_update(
        &mut self,
        h: &Matrix<f64>,
        r: &Matrix<f64>,
        innovation: &Matrix<f64>,
    ) -> Result<Matrix<f64>, MatrixError> {
        let p_ht = &self.p * &h.transpose();
        let s = &(h * &p_ht) + r;
        let gain = &p_ht * &s.inverse()?;
        let correction = &gain * innovation;
        let identity = Matrix::identity(self.p.rows());
        self.p = &(&identity - &(&gain * h)) * &self.p;
        Ok(correction)
    }

    fn covariance(&self) -> Matrix<f64> {
        self.p.copy()
    }

    fn set_covariance(&mut self, p: &Matrix<f64>) -> Result<(), MatrixError> {
        if p.rows() != self.p.rows() || p.cols() != self.p.cols() {
            return Err(MatrixError::SizeMismatch(
                p.rows(),
                p.cols(),
                self.p.rows(),
                self.p.cols(),
            ));
        }
        self.p = p.copy();
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.p.rows()
    }

    fn boxed_clone(&self) -> Box<dyn ErrorCovariance> {
        Box::new(KalmanFilter { p: self.p.copy() })
    }
}

/// UD-factorized covariance filter: `P = U D U^T` kept in factored form.
pub struct UdKalmanFilter {
    /// Unit upper triangular factor.
    u: Matrix<f64>,
    /// Diagonal factor.
    d: Vec<f64>,
}

impl UdKalmanFilter {
    pub fn new(p_diagonal: &[f64]) -> Self {
        let n = p_diagonal.len();
        UdKalmanFilter {
            u: Matrix::identity(n),
            d: p_diagonal.to_vec(),
        }
    }

    /// Thornton temporal update: modified weighted Gram-Schmidt over the
    /// augmented square-root pair `W = [Phi U | Gamma]`,
    /// `Dbar = diag(D, q_diag)`.
    fn thornton(
        &mut self,
        phi: &Matrix<f64>,
        gamma: &Matrix<f64>,
        q_diag: &[f64],
    ) -> Result<(), MatrixError> {
        let n = self.u.rows();
        let q = q_diag.len();
        let phi_u = phi * &self.u;
        let total = n + q;

        // Row-major working copy of W.
        let mut w = vec![0.0f64; n * total];
        for i in 0..n {
            for k in 0..n {
                w[i * total + k] = phi_u.get(i, k);
            }
            for k in 0..q {
                w[i * total + n + k] = gamma.get(i, k);
            }
        }
        let mut dbar = vec![0.0f64; total];
        dbar[..n].copy_from_slice(&self.d);
        dbar[n..].copy_from_slice(q_diag);

        let u_new = Matrix::identity(n);
        let mut d_new = vec![0.0f64; n];
        for i in (0..n).rev() {
            let mut dii = 0.0;
            for k in 0..total {
                dii += w[i * total + k] * dbar[k] * w[i * total + k];
            }
            d_new[i] = dii;
            if dii == 0.0 {
                continue; // deflated direction; leave U column at e_i
            }
            for j in 0..i {
                let mut dot = 0.0;
                for k in 0..total {
                    dot += w[j * total + k] * dbar[k] * w[i * total + k];
                }
                let u_ji = dot / dii;
                u_new.set(j, i, u_ji);
                for k in 0..total {
                    w[j * total + k] -= u_ji * w[i * total + k];
                }
            }
        }
        self.u = u_new;
        self.d = d_new;
        Ok(())
    }

    /// Bierman rank-one observational update for one scalar measurement
    /// with row Jacobian `h_row` and variance `r`. Returns the Kalman gain
    /// as a column vector.
    fn bierman(&mut self, h_row: &[f64], r: f64) -> Result<Vec<f64>, MatrixError> {
        let n = self.u.rows();
        // f = U^T h, v = D f
        let mut f = vec![0.0f64; n];
        for j in 0..n {
            let mut acc = h_row[j];
            for i in 0..j {
                acc += self.u.get(i, j) * h_row[i];
            }
            f[j] = acc;
        }
        let mut v = vec![0.0f64; n];
        for j in 0..n {
            v[j] = self.d[j] * f[j];
        }

        let mut k = vec![0.0f64; n];
        let mut alpha = r + f[0] * v[0];
        if alpha == 0.0 {
            return Err(MatrixError::Singular("zero innovation variance"));
        }
        self.d[0] *= r / alpha;
        k[0] = v[0];
        for j in 1..n {
            let beta = alpha;
            alpha += f[j] * v[j];
            if alpha == 0.0 {
                return Err(MatrixError::Singular("zero innovation variance"));
            }
            let lambda = -f[j] / beta;
            self.d[j] *= beta / alpha;
            for i in 0..j {
                let u_old = self.u.get(i, j);
                self.u.set(i, j, u_old + lambda * k[i]);
                k[i] += v[j] * u_old;
            }
            k[j] = v[j];
        }
        for gain in k.iter_mut() {
            *gain /= alpha;
        }
        Ok(k)
    }
}

impl ErrorCovariance for UdKalmanFilter {
    fn time_update(
        &mut self,
        phi: &Matrix<f64>,
        gamma: &Matrix<f64>,
        q: &Matrix<f64>,
    ) -> Result<(), MatrixError> {
        // The process noise supplied by the filter setup is diagonal; a
        // full Q would first need its own UD factorization folded into
        // Gamma.
        let mut q_diag = vec![0.0f64; q.rows()];
        for (i, value) in q_diag.iter_mut().enumerate() {
            *value = q.get(i, i);
        }
        self.thornton(phi, gamma, &q_diag)
    }

    fn measurement_update(
        &mut self,
        h: &Matrix<f64>,
        r: &Matrix<f64>,
        innovation: &Matrix<f64>,
    ) -> Result<Matrix<f64>, MatrixError> {
        let n = self.u.rows();
        let m = h.rows();

        // Decorrelate the measurement set when R carries off-diagonal
        // terms: R = Ur Dr Ur^T, then Ur^-1 H and Ur^-1 nu see the
        // diagonal noise Dr.
        let (h_eff, nu_eff, r_diag) = if r.is_diagonal() {
            let mut diag = vec![0.0f64; m];
            for (i, value) in diag.iter_mut().enumerate() {
                *value = r.get(i, i);
            }
            (h.copy(), innovation.copy(), diag)
        } else {
            let ud = r.decompose_ud()?;
            let ur = ud.partial(m, m, 0, 0)?;
            let ur_inv = ur.inverse()?;
            let mut diag = vec![0.0f64; m];
            for (i, value) in diag.iter_mut().enumerate() {
                *value = ud.get(i, i + m);
            }
            (&ur_inv * h, &ur_inv * innovation, diag)
        };

        // Sequential scalar updates, re-evaluating each innovation against
        // the corrections already applied.
        let correction = Matrix::new(n, 1);
        let mut h_row = vec![0.0f64; n];
        for j in 0..m {
            for (idx, value) in h_row.iter_mut().enumerate() {
                *value = h_eff.get(j, idx);
            }
            let mut nu = nu_eff.get(j, 0);
            for (idx, value) in h_row.iter().enumerate() {
                nu -= value * correction.get(idx, 0);
            }
            let gain = self.bierman(&h_row, r_diag[j])?;
            for (idx, g) in gain.iter().enumerate() {
                correction.set(idx, 0, correction.get(idx, 0) + g * nu);
            }
        }
        Ok(correction)
    }

    fn covariance(&self) -> Matrix<f64> {
        let n = self.u.rows();
        let d_mat = Matrix::new(n, n);
        for i in 0..n {
            d_mat.set(i, i, self.d[i]);
        }
        &(&self.u * &d_mat) * &self.u.transpose()
    }

    fn set_covariance(&mut self, p: &Matrix<f64>) -> Result<(), MatrixError> {
        let n = p.rows();
        let ud = p.decompose_ud()?;
        self.u = ud.partial(n, n, 0, 0)?.copy();
        let mut d = vec![0.0f64; n];
        for (i, value) in d.iter_mut().enumerate() {
            *value = ud.get(i, i + n);
        }
        self.d = d;
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.u.rows()
    }

    fn boxed_clone(&self) -> Box<dyn ErrorCovariance> {
        Box::new(UdKalmanFilter {
            u: self.u.copy(),
            d: self.d.clone(),
        })
    }
}
