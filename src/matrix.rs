//! Dense integer matrix used on the wire and by the engine.
//!
//! Storage is a single row-major `Vec<i32>`, so the "every row has the same
//! length" invariant holds by construction once a `Matrix` exists. Arithmetic
//! wraps on overflow, matching fixed-width two's complement integers; results
//! that overflow `i32` are not detected.

use std::fmt;
use std::ops::Index;

use crate::error::{Error, Result};

/// Row-major matrix of `i32`.
#[derive(Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<i32>,
}

impl Matrix {
    /// Create a `rows x cols` matrix filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    /// Build a matrix from nested rows.
    ///
    /// Fails with `MalformedPayload` if the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<i32>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(Error::malformed(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Build a matrix from a flat row-major buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<i32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::malformed(format!(
                "{} elements cannot fill a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Borrow row `i`.
    pub fn row(&self, i: usize) -> &[i32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Iterate over rows in order.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[i32]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Copy out as nested rows.
    pub fn to_rows(&self) -> Vec<Vec<i32>> {
        self.iter_rows().map(<[i32]>::to_vec).collect()
    }

    pub(crate) fn set(&mut self, i: usize, j: usize, value: i32) {
        self.data[i * self.cols + j] = value;
    }

    /// Zero-pad into a `size x size` square.
    ///
    /// `size` must be at least as large as both dimensions.
    pub fn pad(&self, size: usize) -> Matrix {
        debug_assert!(size >= self.rows && size >= self.cols);
        let mut padded = Matrix::zeros(size, size);
        for (i, row) in self.iter_rows().enumerate() {
            padded.data[i * size..i * size + self.cols].copy_from_slice(row);
        }
        padded
    }

    /// Keep only the top-left `rows x cols` block.
    pub fn crop(&self, rows: usize, cols: usize) -> Matrix {
        debug_assert!(rows <= self.rows && cols <= self.cols);
        let mut data = Vec::with_capacity(rows * cols);
        for row in self.iter_rows().take(rows) {
            data.extend_from_slice(&row[..cols]);
        }
        Matrix { rows, cols, data }
    }

    /// Split an even-sized square into its four quadrants `[11, 12, 21, 22]`.
    pub(crate) fn split(&self) -> [Matrix; 4] {
        debug_assert!(self.is_square() && self.rows % 2 == 0);
        let half = self.rows / 2;
        let quadrant = |row_off: usize, col_off: usize| {
            let mut q = Matrix::zeros(half, half);
            for i in 0..half {
                let src = (i + row_off) * self.cols + col_off;
                q.data[i * half..(i + 1) * half].copy_from_slice(&self.data[src..src + half]);
            }
            q
        };
        [
            quadrant(0, 0),
            quadrant(0, half),
            quadrant(half, 0),
            quadrant(half, half),
        ]
    }

    /// Inverse of [`Matrix::split`].
    pub(crate) fn combine(c11: &Matrix, c12: &Matrix, c21: &Matrix, c22: &Matrix) -> Matrix {
        let half = c11.rows;
        let size = half * 2;
        let mut out = Matrix::zeros(size, size);
        for i in 0..half {
            for j in 0..half {
                out.set(i, j, c11[(i, j)]);
                out.set(i, j + half, c12[(i, j)]);
                out.set(i + half, j, c21[(i, j)]);
                out.set(i + half, j + half, c22[(i, j)]);
            }
        }
        out
    }

    pub(crate) fn add(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, i32::wrapping_add)
    }

    pub(crate) fn sub(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, i32::wrapping_sub)
    }

    fn zip_with(&self, other: &Matrix, f: impl Fn(i32, i32) -> i32) -> Matrix {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = i32;

    fn index(&self, (i, j): (usize, usize)) -> &i32 {
        &self.data[i * self.cols + j]
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix({}x{}) ", self.rows, self.cols)?;
        f.debug_list().entries(self.iter_rows()).finish()
    }
}

/// Smallest power of two that can hold a dimension of `n` (at least 1).
pub fn padded_size(n: usize) -> usize {
    n.max(1).next_power_of_two()
}
