//! Row-major dataset matrix
//!
//! The index operates over a dense N×d matrix of `f32` features. The matrix
//! either borrows a caller-owned buffer (the default, zero-copy) or owns its
//! storage. Indexes take ownership when constructed with `copy_dataset` or
//! after `add_points` grows the dataset.

use std::borrow::Cow;

use crate::{AnnError, Result};

/// Dense row-major matrix over borrowed or owned storage
///
/// # Examples
/// ```
/// use bramble_core::Matrix;
///
/// let data = vec![0.0, 0.0, 1.0, 1.0];
/// let m = Matrix::from_slice(&data, 2, 2).unwrap();
/// assert_eq!(m.rows(), 2);
/// assert_eq!(m.row(1), &[1.0, 1.0]);
/// ```
#[derive(Debug, Clone)]
pub struct Matrix<'a> {
    data: Cow<'a, [f32]>,
    rows: usize,
    cols: usize,
}

impl<'a> Matrix<'a> {
    /// Create a matrix borrowing a caller-owned buffer
    ///
    /// # Errors
    /// Returns `AnnError::InvalidParameter` if `data.len() != rows * cols`.
    pub fn from_slice(data: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(AnnError::InvalidParameter(format!(
                "matrix buffer holds {} values, expected {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            data: Cow::Borrowed(data),
            rows,
            cols,
        })
    }

    /// Create a matrix taking ownership of its buffer
    ///
    /// # Errors
    /// Returns `AnnError::InvalidParameter` if `data.len() != rows * cols`.
    pub fn from_vec(data: Vec<f32>, rows: usize, cols: usize) -> Result<Matrix<'static>> {
        if data.len() != rows * cols {
            return Err(AnnError::InvalidParameter(format!(
                "matrix buffer holds {} values, expected {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Matrix {
            data: Cow::Owned(data),
            rows,
            cols,
        })
    }

    /// Number of rows (points)
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (dimensions per point)
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// True if the matrix holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Borrow row `i` as a slice
    ///
    /// # Panics
    /// Panics if `i >= rows`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Borrow the full backing buffer
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// True if the matrix owns its buffer
    pub fn is_owned(&self) -> bool {
        matches!(self.data, Cow::Owned(_))
    }

    /// Convert into a matrix that owns its storage, copying if borrowed
    pub fn into_owned(self) -> Matrix<'static> {
        Matrix {
            data: Cow::Owned(self.data.into_owned()),
            rows: self.rows,
            cols: self.cols,
        }
    }
}
