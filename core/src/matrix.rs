//! Dense matrix kernel with shared storage and composable views
//!
//! This module is the numerical substrate for the navigation filters. It is a
//! hand-built dense kernel rather than a wrapper around `nalgebra` because the
//! filters need two properties the general-purpose crates do not give us
//! together:
//!
//! 1. **Value-like handles over shared storage.** Assignment and `Clone` are
//!    O(1) and alias the underlying buffer; [`Matrix::copy`] is the explicit
//!    deep clone. Mutation through any handle writes through to the shared
//!    buffer. Storage is reference counted (`Rc<RefCell<...>>`) and freed when
//!    the last handle drops. The kernel is deliberately single-threaded.
//! 2. **Composable O(1) views.** [`Matrix::transpose`] and
//!    [`Matrix::partial`] return lightweight views that share storage with
//!    their source. A view is the composition of at most one transpose flag
//!    and one partial rectangle, held in a canonical (storage-oriented) form
//!    so that composing them in either order observes the same elements.
//!
//! On top of the view machinery the kernel provides the factorizations the
//! Kalman filters rely on: LU with partial (row) pivoting, UD factorization
//! of symmetric matrices, Householder reduction to Hessenberg form, a
//! double-shift QR eigensolver with inverse-iteration eigenvectors, a matrix
//! square root through the spectral decomposition, and Gauss-Jordan
//! inversion.
//!
//! Element types are generic over [`Element`]; the decompositions that need
//! ordering and square roots are restricted to [`Float`] scalars, while LU,
//! inversion, and the linear solvers also work for `Complex` elements (the
//! eigenvector inverse iteration depends on that).
//!
//! Bounds checks on element access are `debug_assert!` only; release builds
//! resolve indices straight through the view.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use std::rc::Rc;

use num_complex::Complex;
use num_traits::{Float, One, Zero};
use thiserror::Error;

/// Errors raised by the matrix kernel.
///
/// Arithmetic operators panic on size mismatch (they cannot return a
/// `Result`); every factorization and solver returns one of these instead.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix size mismatch: {0}x{1} against {2}x{3}")]
    SizeMismatch(usize, usize, usize, usize),
    #[error("matrix is not square ({0}x{1})")]
    NotSquare(usize, usize),
    #[error("matrix is not symmetric")]
    NotSymmetric,
    #[error("matrix is not in the packed [L|U] layout")]
    NotLu,
    #[error("matrix is singular: {0}")]
    Singular(&'static str),
    #[error("eigenvalue iteration produced a non-finite subdiagonal")]
    EigenValues,
    #[error("eigenvector inverse iteration failed to converge")]
    EigenVectors,
    #[error("view of {0}x{1} at offset ({2}, {3}) exceeds parent dimensions")]
    ViewOutOfBounds(usize, usize, usize, usize),
    #[error("row or column index out of range")]
    IndexOutOfRange,
}

/// Scalar types the kernel can hold.
///
/// Satisfied by `f32`/`f64` and by `Complex<F>` for float `F`, which is what
/// the eigensolver hands back.
pub trait Element:
    Copy
    + PartialEq
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + fmt::Debug
    + fmt::Display
    + 'static
{
}

impl<T> Element for T where
    T: Copy
        + PartialEq
        + Zero
        + One
        + Add<Output = T>
        + Sub<Output = T>
        + Mul<Output = T>
        + Div<Output = T>
        + Neg<Output = T>
        + AddAssign
        + SubAssign
        + MulAssign
        + DivAssign
        + fmt::Debug
        + fmt::Display
        + 'static
{
}

/// Partial rectangle of a view, expressed in storage orientation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Partial {
    rows: usize,
    cols: usize,
    row_offset: usize,
    col_offset: usize,
}

/// View state: at most one transpose and one partial rectangle.
///
/// The partial rectangle is always kept in storage orientation (before the
/// transpose is applied), which makes the composition of transpose and
/// partial order-invariant: `a.partial(r, c, ro, co).transpose()` and
/// `a.transpose().partial(c, r, co, ro)` resolve to the same state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct View {
    transposed: bool,
    partial: Option<Partial>,
}

/// Dense two-dimensional matrix with reference-counted storage.
///
/// `Clone` is a shallow alias: both handles observe and mutate the same
/// buffer. Use [`Matrix::copy`] to unlink.
pub struct Matrix<T> {
    storage: Rc<RefCell<Vec<T>>>,
    storage_rows: usize,
    storage_cols: usize,
    view: View,
}

impl<T> Clone for Matrix<T> {
    /// Shallow alias; storage is shared and its reference count incremented.
    fn clone(&self) -> Self {
        Matrix {
            storage: Rc::clone(&self.storage),
            storage_rows: self.storage_rows,
            storage_cols: self.storage_cols,
            view: self.view,
        }
    }
}

impl<T: Element> Matrix<T> {
    /// Zero-initialized `rows` x `cols` matrix with fresh storage.
    pub fn new(rows: usize, cols: usize) -> Self {
        Matrix {
            storage: Rc::new(RefCell::new(vec![T::zero(); rows * cols])),
            storage_rows: rows,
            storage_cols: cols,
            view: View::default(),
        }
    }

    /// Matrix initialized from a row-major slice.
    pub fn from_row_slice(rows: usize, cols: usize, values: &[T]) -> Self {
        assert_eq!(
            rows * cols,
            values.len(),
            "initializer length does not match {}x{}",
            rows,
            cols
        );
        Matrix {
            storage: Rc::new(RefCell::new(values.to_vec())),
            storage_rows: rows,
            storage_cols: cols,
            view: View::default(),
        }
    }

    /// Scalar matrix `value * I` of the given size.
    pub fn scalar(size: usize, value: T) -> Self {
        let result = Matrix::new(size, size);
        for i in 0..size {
            result.set(i, i, value);
        }
        result
    }

    /// Identity matrix of the given size.
    pub fn identity(size: usize) -> Self {
        Matrix::scalar(size, T::one())
    }

    /// Dimensions of the region the view exposes, in storage orientation.
    fn base_dims(&self) -> (usize, usize) {
        match self.view.partial {
            Some(p) => (p.rows, p.cols),
            None => (self.storage_rows, self.storage_cols),
        }
    }

    /// Observed row count (swapped with columns under a transpose view).
    pub fn rows(&self) -> usize {
        let (r, c) = self.base_dims();
        if self.view.transposed { c } else { r }
    }

    /// Observed column count.
    pub fn cols(&self) -> usize {
        let (r, c) = self.base_dims();
        if self.view.transposed { r } else { c }
    }

    /// Resolve an observed index pair to a flat storage index.
    fn resolve(&self, i: usize, j: usize) -> usize {
        let (i, j) = if self.view.transposed { (j, i) } else { (i, j) };
        let (ro, co) = match self.view.partial {
            Some(p) => (p.row_offset, p.col_offset),
            None => (0, 0),
        };
        (i + ro) * self.storage_cols + (j + co)
    }

    /// Element at (`i`, `j`), resolved through the view.
    pub fn get(&self, i: usize, j: usize) -> T {
        debug_assert!(
            i < self.rows() && j < self.cols(),
            "index ({}, {}) out of bounds for {}x{} matrix",
            i,
            j,
            self.rows(),
            self.cols()
        );
        self.storage.borrow()[self.resolve(i, j)]
    }

    /// Write the element at (`i`, `j`) through the view.
    ///
    /// Takes `&self`: mutation through a shared view is the point of the
    /// storage model, so writes go through interior mutability.
    pub fn set(&self, i: usize, j: usize, value: T) {
        debug_assert!(
            i < self.rows() && j < self.cols(),
            "index ({}, {}) out of bounds for {}x{} matrix",
            i,
            j,
            self.rows(),
            self.cols()
        );
        let idx = self.resolve(i, j);
        self.storage.borrow_mut()[idx] = value;
    }

    /// Transposed view sharing storage with `self`. Applying it twice
    /// restores the original orientation.
    pub fn transpose(&self) -> Self {
        let mut result = self.clone();
        result.view.transposed = !result.view.transposed;
        result
    }

    /// Rectangular sub-view of `new_rows` x `new_cols` anchored at
    /// (`row_offset`, `col_offset`), in observed coordinates. Shares storage.
    pub fn partial(
        &self,
        new_rows: usize,
        new_cols: usize,
        row_offset: usize,
        col_offset: usize,
    ) -> Result<Self, MatrixError> {
        if new_rows + row_offset > self.rows() || new_cols + col_offset > self.cols() {
            return Err(MatrixError::ViewOutOfBounds(
                new_rows, new_cols, row_offset, col_offset,
            ));
        }
        let mut result = self.clone();
        // Convert the observed rectangle into storage orientation before
        // composing with any existing partial.
        let (p_rows, p_cols, p_ro, p_co) = if self.view.transposed {
            (new_cols, new_rows, col_offset, row_offset)
        } else {
            (new_rows, new_cols, row_offset, col_offset)
        };
        let base = self.view.partial.unwrap_or(Partial {
            rows: self.storage_rows,
            cols: self.storage_cols,
            row_offset: 0,
            col_offset: 0,
        });
        result.view.partial = Some(Partial {
            rows: p_rows,
            cols: p_cols,
            row_offset: base.row_offset + p_ro,
            col_offset: base.col_offset + p_co,
        });
        Ok(result)
    }

    /// Single-row view.
    pub fn row_vector(&self, row: usize) -> Result<Self, MatrixError> {
        self.partial(1, self.cols(), row, 0)
    }

    /// Single-column view.
    pub fn column_vector(&self, col: usize) -> Result<Self, MatrixError> {
        self.partial(self.rows(), 1, 0, col)
    }

    /// Deep, viewless copy with fresh storage.
    pub fn copy(&self) -> Self {
        let rows = self.rows();
        let cols = self.cols();
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(self.get(i, j));
            }
        }
        Matrix {
            storage: Rc::new(RefCell::new(data)),
            storage_rows: rows,
            storage_cols: cols,
            view: View::default(),
        }
    }

    /// Zero every element visible through the view.
    pub fn clear(&self) {
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, T::zero());
            }
        }
    }

    /// Overwrite the visible region with the elements of `other`.
    pub fn replace(&self, other: &Matrix<T>) -> Result<(), MatrixError> {
        if self.rows() != other.rows() || self.cols() != other.cols() {
            return Err(MatrixError::SizeMismatch(
                self.rows(),
                self.cols(),
                other.rows(),
                other.cols(),
            ));
        }
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, other.get(i, j));
            }
        }
        Ok(())
    }

    /// Swap two rows in place.
    pub fn exchange_rows(&self, r1: usize, r2: usize) -> Result<(), MatrixError> {
        if r1 >= self.rows() || r2 >= self.rows() {
            return Err(MatrixError::IndexOutOfRange);
        }
        for j in 0..self.cols() {
            let tmp = self.get(r1, j);
            self.set(r1, j, self.get(r2, j));
            self.set(r2, j, tmp);
        }
        Ok(())
    }

    /// Swap two columns in place.
    pub fn exchange_columns(&self, c1: usize, c2: usize) -> Result<(), MatrixError> {
        if c1 >= self.cols() || c2 >= self.cols() {
            return Err(MatrixError::IndexOutOfRange);
        }
        for i in 0..self.rows() {
            let tmp = self.get(i, c1);
            self.set(i, c1, self.get(i, c2));
            self.set(i, c2, tmp);
        }
        Ok(())
    }

    pub fn is_square(&self) -> bool {
        self.rows() == self.cols()
    }

    pub fn is_symmetric(&self) -> bool {
        if !self.is_square() {
            return false;
        }
        for i in 0..self.rows() {
            for j in (i + 1)..self.cols() {
                if self.get(i, j) != self.get(j, i) {
                    return false;
                }
            }
        }
        true
    }

    pub fn is_diagonal(&self) -> bool {
        if !self.is_square() {
            return false;
        }
        for i in 0..self.rows() {
            for j in (i + 1)..self.cols() {
                if self.get(i, j) != T::zero() || self.get(j, i) != T::zero() {
                    return false;
                }
            }
        }
        true
    }

    /// Whether this matrix holds the packed `[L|U]` layout produced by
    /// [`Matrix::decompose_lup`]: n x 2n, unit lower triangle on the left,
    /// upper triangle on the right.
    pub fn is_lu(&self) -> bool {
        let n = self.rows();
        if n * 2 != self.cols() {
            return false;
        }
        for i in 0..n.saturating_sub(1) {
            for j in (i + 1)..n {
                if self.get(i, j) != T::zero() {
                    return false; // strict upper part of L
                }
                if self.get(j, i + n) != T::zero() {
                    return false; // strict lower part of U
                }
            }
        }
        true
    }

    /// Sum of the diagonal.
    pub fn trace(&self) -> Result<T, MatrixError> {
        if !self.is_square() {
            return Err(MatrixError::NotSquare(self.rows(), self.cols()));
        }
        let mut tr = T::zero();
        for i in 0..self.rows() {
            tr += self.get(i, i);
        }
        Ok(tr)
    }

    /// Add `other` into `self` with its upper-left corner at
    /// (`row`, `column`); elements falling outside `self` are dropped.
    pub fn pivot_merge(&self, row: usize, column: usize, other: &Matrix<T>) {
        for i in 0..other.rows() {
            if row + i >= self.rows() {
                break;
            }
            for j in 0..other.cols() {
                if column + j >= self.cols() {
                    break;
                }
                let sum = self.get(row + i, column + j) + other.get(i, j);
                self.set(row + i, column + j, sum);
            }
        }
    }

    /// LU decomposition with partial pivoting.
    ///
    /// Pivoting exchanges rows and is triggered only when a diagonal entry
    /// is exactly zero; rescue pivoting for ill-conditioned but non-singular
    /// diagonals is the caller's concern. The factors satisfy
    /// `L * U == P * A` where `P` is the permutation described by
    /// [`Lup::pivots`].
    pub fn decompose_lup(&self) -> Result<Lup<T>, MatrixError> {
        if !self.is_square() {
            return Err(MatrixError::NotSquare(self.rows(), self.cols()));
        }
        let n = self.rows();
        let lu = Matrix::new(n, 2 * n);
        // Left half becomes L, right half starts as a full copy of A and is
        // reduced in place to U.
        for i in 0..n {
            lu.set(i, i, T::one());
            for j in 0..n {
                lu.set(i, j + n, self.get(i, j));
            }
        }
        let mut pivots: Vec<usize> = (0..n).collect();
        let mut swaps = 0usize;
        for i in 0..n {
            if lu.get(i, i + n) == T::zero() {
                let mut k = i;
                loop {
                    k += 1;
                    if k == n {
                        return Err(MatrixError::Singular("no usable pivot row"));
                    }
                    if lu.get(k, i + n) != T::zero() {
                        break;
                    }
                }
                // Exchange rows i and k of the active U half and of the
                // already-built L columns.
                for j in i..n {
                    let tmp = lu.get(i, j + n);
                    lu.set(i, j + n, lu.get(k, j + n));
                    lu.set(k, j + n, tmp);
                }
                for j in 0..i {
                    let tmp = lu.get(i, j);
                    lu.set(i, j, lu.get(k, j));
                    lu.set(k, j, tmp);
                }
                pivots.swap(i, k);
                swaps += 1;
            }
            for i2 in (i + 1)..n {
                let factor = lu.get(i2, i + n) / lu.get(i, i + n);
                lu.set(i2, i, factor);
                lu.set(i2, i + n, T::zero());
                for j2 in (i + 1)..n {
                    let updated = lu.get(i2, j2 + n) - factor * lu.get(i, j2 + n);
                    lu.set(i2, j2 + n, updated);
                }
            }
        }
        Ok(Lup { lu, pivots, swaps })
    }

    /// Solve `A x = y` where `self` is the packed `[L|U]` layout of `A`
    /// (no pivoting applied; see [`Lup::solve`] for the pivoted form).
    /// Runs forward substitution over L, then backward substitution over U.
    pub fn solve_linear_eq_with_lu(&self, y: &Matrix<T>) -> Result<Matrix<T>, MatrixError> {
        if !self.is_lu() {
            return Err(MatrixError::NotLu);
        }
        let n = self.rows();
        if y.cols() != 1 || y.rows() != n {
            return Err(MatrixError::SizeMismatch(y.rows(), y.cols(), n, 1));
        }
        let l = self.partial(n, n, 0, 0)?;
        let u = self.partial(n, n, 0, n)?;
        // L (U x) = y: solve for y' = U x first.
        let y_work = y.copy();
        let y_prime = Matrix::new(n, 1);
        for i in 0..n {
            if l.get(i, i) == T::zero() {
                return Err(MatrixError::Singular("zero on L diagonal"));
            }
            y_prime.set(i, 0, y_work.get(i, 0) / l.get(i, i));
            for j in (i + 1)..n {
                let updated = y_work.get(j, 0) - l.get(j, i) * y_prime.get(i, 0);
                y_work.set(j, 0, updated);
            }
        }
        // Then U x = y'.
        let x = Matrix::new(n, 1);
        for i in (0..n).rev() {
            if u.get(i, i) == T::zero() {
                return Err(MatrixError::Singular("zero on U diagonal"));
            }
            x.set(i, 0, y_prime.get(i, 0) / u.get(i, i));
            for j in (0..i).rev() {
                let updated = y_prime.get(j, 0) - u.get(j, i) * x.get(i, 0);
                y_prime.set(j, 0, updated);
            }
        }
        Ok(x)
    }

    /// Determinant through the LU factors: the product of the U diagonal,
    /// negated once per row exchange.
    pub fn determinant(&self) -> Result<T, MatrixError> {
        let lup = self.decompose_lup()?;
        let n = self.rows();
        let mut det = if lup.swaps % 2 == 0 {
            T::one()
        } else {
            -T::one()
        };
        for i in 0..n {
            det *= lup.lu.get(i, i) * lup.lu.get(i, i + n);
        }
        Ok(det)
    }

    /// Gauss-Jordan inversion with row exchange on zero pivots.
    pub fn inverse(&self) -> Result<Matrix<T>, MatrixError> {
        if !self.is_square() {
            return Err(MatrixError::NotSquare(self.rows(), self.cols()));
        }
        let n = self.rows();
        let left = self.copy();
        let right = Matrix::identity(n);
        for i in 0..n {
            if left.get(i, i) == T::zero() {
                let mut i2 = i;
                loop {
                    i2 += 1;
                    if i2 == n {
                        return Err(MatrixError::Singular("inverse does not exist"));
                    }
                    if left.get(i2, i) != T::zero() {
                        break;
                    }
                }
                left.exchange_rows(i, i2)?;
                right.exchange_rows(i, i2)?;
            }
            let pivot = left.get(i, i);
            if pivot != T::one() {
                for j in 0..n {
                    right.set(i, j, right.get(i, j) / pivot);
                }
                for j in (i + 1)..n {
                    left.set(i, j, left.get(i, j) / pivot);
                }
                left.set(i, i, T::one());
            }
            for k in 0..n {
                if k == i {
                    continue;
                }
                let factor = left.get(k, i);
                if factor != T::zero() {
                    for j in 0..n {
                        let updated = right.get(k, j) - right.get(i, j) * factor;
                        right.set(k, j, updated);
                    }
                    for j in (i + 1)..n {
                        let updated = left.get(k, j) - left.get(i, j) * factor;
                        left.set(k, j, updated);
                    }
                    left.set(k, i, T::zero());
                }
            }
        }
        Ok(right)
    }

    /// UD factorization of a symmetric matrix.
    ///
    /// Returns an n x 2n matrix with the unit-upper-triangular `U` in the
    /// left half and the diagonal `D` in the right half, such that
    /// `U * D * U^T` reconstructs the input.
    pub fn decompose_ud(&self) -> Result<Matrix<T>, MatrixError> {
        if !self.is_symmetric() {
            return Err(MatrixError::NotSymmetric);
        }
        let n = self.rows();
        let p = self.copy();
        let ud = Matrix::new(n, 2 * n);
        for i in (0..n).rev() {
            let d_i = p.get(i, i);
            ud.set(i, i + n, d_i);
            ud.set(i, i, T::one());
            if d_i == T::zero() {
                continue; // rank-deficient tail; leave U column as e_i
            }
            for j in 0..i {
                let u_ji = p.get(j, i) / d_i;
                ud.set(j, i, u_ji);
                for k in 0..=j {
                    let updated = p.get(k, j) - ud.get(k, i) * d_i * u_ji;
                    p.set(k, j, updated);
                }
            }
        }
        Ok(ud)
    }
}

/// Result of [`Matrix::decompose_lup`]: packed factors plus the row
/// permutation.
pub struct Lup<T> {
    /// n x 2n packed `[L|U]` matrix.
    pub lu: Matrix<T>,
    /// `pivots[i]` is the row of the original matrix that ended up in row
    /// `i` of the factors.
    pub pivots: Vec<usize>,
    /// Number of row exchanges performed.
    pub swaps: usize,
}

impl<T: Element> Lup<T> {
    /// Solve `A x = y` using the pivoted factors (`L U x = P y`).
    pub fn solve(&self, y: &Matrix<T>) -> Result<Matrix<T>, MatrixError> {
        let n = self.lu.rows();
        if y.cols() != 1 || y.rows() != n {
            return Err(MatrixError::SizeMismatch(y.rows(), y.cols(), n, 1));
        }
        let permuted = Matrix::new(n, 1);
        for i in 0..n {
            permuted.set(i, 0, y.get(self.pivots[i], 0));
        }
        self.lu.solve_linear_eq_with_lu(&permuted)
    }
}

impl<F> Matrix<F>
where
    F: Float + Element,
    Complex<F>: Element,
{
    /// Lift into a complex matrix with zero imaginary parts.
    pub fn to_complex(&self) -> Matrix<Complex<F>> {
        let result = Matrix::new(self.rows(), self.cols());
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                result.set(i, j, Complex::new(self.get(i, j), F::zero()));
            }
        }
        result
    }

    /// Reduce to upper Hessenberg form by Householder similarity
    /// transformations applied from the left and right.
    ///
    /// When `transform` is given it must be square of the same size; the
    /// accumulated product of the reflections is multiplied into it, so an
    /// identity input ends up holding the full similarity transform.
    pub fn hessenberg(
        &self,
        mut transform: Option<&mut Matrix<F>>,
    ) -> Result<Matrix<F>, MatrixError> {
        if !self.is_square() {
            return Err(MatrixError::NotSquare(self.rows(), self.cols()));
        }
        let n = self.rows();
        let mut result = self.copy();
        for j in 0..n.saturating_sub(2) {
            let mut t = F::zero();
            for i in (j + 1)..n {
                t = t + result.get(i, j).powi(2);
            }
            let mut s = t.sqrt();
            if result.get(j + 1, j) < F::zero() {
                s = -s;
            }

            let omega = Matrix::new(n - (j + 1), 1);
            for i in 0..omega.rows() {
                omega.set(i, 0, result.get(j + i + 1, j));
            }
            omega.set(0, 0, omega.get(0, 0) + s);

            let p = Matrix::identity(n);
            let denom = t + result.get(j + 1, j) * s;
            if denom != F::zero() {
                let reflector = &(&omega * &omega.transpose()) / denom;
                p.pivot_merge(j + 1, j + 1, &-&reflector);
            }

            result = &(&p * &result) * &p;
            if let Some(acc) = transform.as_mut() {
                let product = &**acc * &p;
                acc.replace(&product)?;
            }
        }

        // Force the entries below the first subdiagonal to exact zero; for a
        // symmetric input the mirrored entries are zeroed as well.
        let sym = self.is_symmetric();
        for j in 0..n.saturating_sub(2) {
            for i in (j + 2)..n {
                result.set(i, j, F::zero());
                if sym {
                    result.set(j, i, F::zero());
                }
            }
        }
        Ok(result)
    }

    /// Eigenvalues of the 2x2 block anchored at (`row`, `column`).
    fn eigen22(&self, row: usize, column: usize) -> (Complex<F>, Complex<F>) {
        let a = self.get(row, column);
        let b = self.get(row, column + 1);
        let c = self.get(row + 1, column);
        let d = self.get(row + 1, column + 1);
        let two = F::one() + F::one();
        let four = two + two;
        let root2 = (a - d).powi(2) + b * c * four;
        if root2 > F::zero() {
            let root = root2.sqrt();
            (
                Complex::new((a + d + root) / two, F::zero()),
                Complex::new((a + d - root) / two, F::zero()),
            )
        } else {
            let root = (-root2).sqrt();
            (
                Complex::new((a + d) / two, root / two),
                Complex::new((a + d) / two, -root / two),
            )
        }
    }

    /// Eigen decomposition by double-shift QR over the Hessenberg form.
    ///
    /// Returns an n x (n+1) complex matrix whose first n columns are the
    /// (normalized) eigenvectors and whose last column holds the
    /// eigenvalues. The shift pair is taken from the trailing 2x2 block;
    /// deflation removes one eigenvalue when the last subdiagonal entry
    /// drops below `abs_tol + rel_tol * min(|A(m-1,m-1)|, |A(m,m)|)` and two
    /// when the block above it decouples. Eigenvectors come from inverse
    /// iteration on `A - lambda I`, with the shift nudged by 2e-3 whenever
    /// it would land on a diagonal element; iteration stops when
    /// `1 - mu^2 / v^2 < 1.1` and fails after 100 rounds.
    pub fn eigen(
        &self,
        abs_tol: F,
        rel_tol: F,
    ) -> Result<Matrix<Complex<F>>, MatrixError> {
        if !self.is_square() {
            return Err(MatrixError::NotSquare(self.rows(), self.cols()));
        }
        let n = self.rows();
        let result: Matrix<Complex<F>> = Matrix::new(n, n + 1);
        let two = F::one() + F::one();
        let half = F::one() / two;

        let mut mu_sum = F::zero();
        let mut mu_multi = F::zero();
        let mut p1 = Complex::new(F::zero(), F::zero());
        let mut p2 = Complex::new(F::zero(), F::zero());
        let mut m = n;
        let mut first = true;

        let mut transform = Matrix::identity(n);
        let mut a = self.hessenberg(Some(&mut transform))?;
        let a_hess = a.copy();

        loop {
            if m == 1 {
                result.set(0, n, Complex::new(a.get(0, 0), F::zero()));
                break;
            } else if m == 2 {
                let (upper, lower) = a.eigen22(0, 0);
                result.set(0, n, upper);
                result.set(1, n, lower);
                break;
            }

            // Shift selection from the trailing 2x2 block. The very first
            // sweep runs unshifted; afterwards a shift that moved by more
            // than half its magnitude since the previous sweep is treated
            // as unreliable and replaced by its stable partner.
            {
                let (p1_new, p2_new) = a.eigen22(m - 2, m - 2);
                if first {
                    first = false;
                } else if (p1_new - p1).norm() > p1_new.norm() * half {
                    if (p2_new - p2).norm() > p2_new.norm() * half {
                        mu_sum = (p1 + p2).re;
                        mu_multi = (p1 * p2).re;
                    } else {
                        mu_sum = p2_new.re * two;
                        mu_multi = p2_new.re.powi(2);
                    }
                } else if (p2_new - p2).norm() > p2_new.norm() * half {
                    mu_sum = p1_new.re * two;
                    mu_multi = p1_new.re * p1_new.re;
                } else {
                    mu_sum = (p1_new + p2_new).re;
                    mu_multi = (p1_new * p2_new).re;
                }
                p1 = p1_new;
                p2 = p2_new;
            }

            // One implicit double-shift sweep of Householder reflections.
            for i in 0..(m - 1) {
                let (b1, b2, b3) = if i == 0 {
                    (
                        a.get(0, 0) * a.get(0, 0) - mu_sum * a.get(0, 0)
                            + mu_multi
                            + a.get(0, 1) * a.get(1, 0),
                        a.get(1, 0) * (a.get(0, 0) + a.get(1, 1) - mu_sum),
                        a.get(2, 1) * a.get(1, 0),
                    )
                } else {
                    (
                        a.get(i, i - 1),
                        a.get(i + 1, i - 1),
                        if i == m - 2 {
                            F::zero()
                        } else {
                            a.get(i + 2, i - 1)
                        },
                    )
                };
                let r = (b1 * b1 + b2 * b2 + b3 * b3).sqrt();

                let omega = Matrix::new(3, 1);
                omega.set(
                    0,
                    0,
                    b1 + r * if b1 >= F::zero() { F::one() } else { -F::one() },
                );
                omega.set(1, 0, b2);
                if b3 != F::zero() {
                    omega.set(2, 0, b3);
                }
                let p = Matrix::identity(n);
                let denom = (&omega.transpose() * &omega).get(0, 0);
                if denom != F::zero() {
                    p.pivot_merge(i, i, &(&(&omega * &omega.transpose()) * (-two / denom)));
                }
                a = &(&p * &a) * &p;
            }

            let probe = a.get(m - 1, m - 2);
            if probe.is_nan() || probe.is_infinite() {
                return Err(MatrixError::EigenValues);
            }

            // Deflation test.
            let a_m2_abs = a.get(m - 2, m - 2).abs();
            let a_m1_abs = a.get(m - 1, m - 1).abs();
            let epsilon = abs_tol + rel_tol * a_m2_abs.min(a_m1_abs);
            if a.get(m - 1, m - 2).abs() < epsilon {
                m -= 1;
                result.set(m, n, Complex::new(a.get(m, m), F::zero()));
            } else if a.get(m - 2, m - 3).abs() < epsilon {
                let (upper, lower) = a.eigen22(m - 2, m - 2);
                result.set(m - 1, n, upper);
                result.set(m - 2, n, lower);
                m -= 2;
            }
        }

        // Eigenvectors by inverse iteration on the Hessenberg form.
        let x: Matrix<Complex<F>> = Matrix::identity(n);
        let a_c = a_hess.to_complex();
        let shim_gate = F::from(1e-3).unwrap();
        let shim = F::from(2e-3).unwrap();
        let converge_limit = F::from(1.1).unwrap();

        for j in 0..n {
            let a_shifted = a_c.copy();
            let mut approx_lambda = result.get(j, n);
            if (a_shifted.get(j, j) - approx_lambda).norm() <= shim_gate {
                approx_lambda += Complex::new(shim, F::zero());
            }
            for i in 0..n {
                a_shifted.set(i, i, a_shifted.get(i, i) - approx_lambda);
            }
            let lu = a_shifted.decompose_lup()?;

            let target_x = Matrix::new(n, 1);
            for i in 0..n {
                target_x.set(i, 0, x.get(i, j));
            }
            let mut loops = 0usize;
            loop {
                let target_x_new = lu.solve(&target_x)?;
                let mu = (&target_x_new.transpose() * &target_x).get(0, 0).norm_sqr();
                let v2 = (&target_x_new.transpose() * &target_x_new)
                    .get(0, 0)
                    .norm_sqr();
                let v2s = v2.sqrt();
                for i in 0..n {
                    target_x.set(
                        i,
                        0,
                        target_x_new.get(i, 0) / Complex::new(v2s, F::zero()),
                    );
                }
                if F::one() - mu * mu / v2 < converge_limit {
                    for i in 0..n {
                        x.set(i, j, target_x.get(i, 0));
                    }
                    break;
                }
                loops += 1;
                if loops > 100 {
                    return Err(MatrixError::EigenVectors);
                }
            }
        }

        // Rotate back through the Hessenberg transform and normalize.
        for j in 0..n {
            for i in 0..n {
                let mut acc = Complex::new(F::zero(), F::zero());
                for k in 0..n {
                    acc += Complex::new(transform.get(i, k), F::zero()) * x.get(k, j);
                }
                result.set(i, j, acc);
            }
            let mut norm2 = F::zero();
            for i in 0..n {
                norm2 = norm2 + result.get(i, j).norm_sqr();
            }
            let norm = norm2.sqrt();
            for i in 0..n {
                result.set(i, j, result.get(i, j) / Complex::new(norm, F::zero()));
            }
        }

        Ok(result)
    }

    /// Matrix square root `V * D^(1/2) * V^(-1)` through the eigen
    /// decomposition.
    pub fn sqrt(&self, abs_tol: F, rel_tol: F) -> Result<Matrix<Complex<F>>, MatrixError> {
        let eigen_mat = self.eigen(abs_tol, rel_tol)?;
        let n = self.rows();
        let v_scaled = eigen_mat.partial(n, n, 0, 0)?;
        let v_inverse = v_scaled.inverse()?;
        for i in 0..n {
            let root = eigen_mat.get(i, n).sqrt();
            let column = v_scaled.column_vector(i)?;
            for k in 0..n {
                column.set(k, 0, column.get(k, 0) * root);
            }
        }
        Ok(&v_scaled * &v_inverse)
    }
}

// ---- value equality across views ----

impl<T: Element> PartialEq for Matrix<T> {
    /// Element-wise equality of the observed values; views with different
    /// storage or different view stacks compare equal when they observe the
    /// same elements.
    fn eq(&self, other: &Self) -> bool {
        if self.rows() != other.rows() || self.cols() != other.cols() {
            return false;
        }
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                if self.get(i, j) != other.get(i, j) {
                    return false;
                }
            }
        }
        true
    }
}

// ---- arithmetic operators ----
//
// Binary operators return freshly allocated viewless results; the compound
// assignment forms mutate in place (through the view, when the left side is
// one). Size mismatches panic, matching how the rest of the ecosystem's
// dense types behave in operator position.

impl<T: Element> AddAssign<&Matrix<T>> for Matrix<T> {
    fn add_assign(&mut self, rhs: &Matrix<T>) {
        assert_eq!(
            (self.rows(), self.cols()),
            (rhs.rows(), rhs.cols()),
            "matrix addition dimension mismatch"
        );
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, self.get(i, j) + rhs.get(i, j));
            }
        }
    }
}

impl<T: Element> SubAssign<&Matrix<T>> for Matrix<T> {
    fn sub_assign(&mut self, rhs: &Matrix<T>) {
        assert_eq!(
            (self.rows(), self.cols()),
            (rhs.rows(), rhs.cols()),
            "matrix subtraction dimension mismatch"
        );
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, self.get(i, j) - rhs.get(i, j));
            }
        }
    }
}

impl<T: Element> MulAssign<T> for Matrix<T> {
    fn mul_assign(&mut self, scalar: T) {
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, self.get(i, j) * scalar);
            }
        }
    }
}

impl<T: Element> DivAssign<T> for Matrix<T> {
    fn div_assign(&mut self, scalar: T) {
        for i in 0..self.rows() {
            for j in 0..self.cols() {
                self.set(i, j, self.get(i, j) / scalar);
            }
        }
    }
}

impl<T: Element> Add for &Matrix<T> {
    type Output = Matrix<T>;
    fn add(self, rhs: &Matrix<T>) -> Matrix<T> {
        let mut result = self.copy();
        result += rhs;
        result
    }
}

impl<T: Element> Sub for &Matrix<T> {
    type Output = Matrix<T>;
    fn sub(self, rhs: &Matrix<T>) -> Matrix<T> {
        let mut result = self.copy();
        result -= rhs;
        result
    }
}

impl<T: Element> Mul for &Matrix<T> {
    type Output = Matrix<T>;
    fn mul(self, rhs: &Matrix<T>) -> Matrix<T> {
        assert_eq!(
            self.cols(),
            rhs.rows(),
            "matrix product dimension mismatch"
        );
        let result = Matrix::new(self.rows(), rhs.cols());
        for i in 0..result.rows() {
            for j in 0..result.cols() {
                let mut acc = T::zero();
                for k in 0..self.cols() {
                    acc += self.get(i, k) * rhs.get(k, j);
                }
                result.set(i, j, acc);
            }
        }
        result
    }
}

impl<T: Element> Mul<T> for &Matrix<T> {
    type Output = Matrix<T>;
    fn mul(self, scalar: T) -> Matrix<T> {
        let mut result = self.copy();
        result *= scalar;
        result
    }
}

impl<T: Element> Div<T> for &Matrix<T> {
    type Output = Matrix<T>;
    fn div(self, scalar: T) -> Matrix<T> {
        let mut result = self.copy();
        result /= scalar;
        result
    }
}

impl<T: Element> Neg for &Matrix<T> {
    type Output = Matrix<T>;
    fn neg(self) -> Matrix<T> {
        let result = self.copy();
        for i in 0..result.rows() {
            for j in 0..result.cols() {
                result.set(i, j, -result.get(i, j));
            }
        }
        result
    }
}

impl<T: Element> fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix {}x{} {}", self.rows(), self.cols(), self)
    }
}

impl<T: Element> fmt::Display for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for i in 0..self.rows() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{{")?;
            for j in 0..self.cols() {
                if j > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", self.get(i, j))?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}}")
    }
}
