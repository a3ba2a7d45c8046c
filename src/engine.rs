//! Divide-and-conquer matrix multiplication.
//!
//! [`multiply`] pads both operands to the next power of two, recurses with the
//! seven-product (Strassen) identity down to [`BASE_CASE_SIZE`], then crops the
//! result back to `A.rows x B.cols`.
//!
//! The recursion is sequential: every sub-product runs on the calling thread.
//! Any speed-up measured against [`multiply_direct`] therefore comes from doing
//! fewer multiplications, not from using more cores.

use tracing::trace;

use crate::error::{Error, Result};
use crate::matrix::{padded_size, Matrix};

/// Squares at or below this size are multiplied with the triple loop.
pub const BASE_CASE_SIZE: usize = 2;

/// Multiply `a` by `b` using padded seven-product recursion.
pub fn multiply(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    check_dimensions(a, b)?;

    let size = padded_size(a.rows().max(a.cols()).max(b.rows()).max(b.cols()));
    trace!(
        a_rows = a.rows(),
        a_cols = a.cols(),
        b_cols = b.cols(),
        padded = size,
        "Multiplying"
    );

    let product = multiply_recursive(&a.pad(size), &b.pad(size));
    Ok(product.crop(a.rows(), b.cols()))
}

/// Multiply `a` by `b` with the plain triple loop, no padding.
///
/// This is the baseline the engine is timed against.
pub fn multiply_direct(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    check_dimensions(a, b)?;
    Ok(standard_multiply(a, b))
}

fn check_dimensions(a: &Matrix, b: &Matrix) -> Result<()> {
    if a.cols() != b.rows() {
        return Err(Error::DimensionMismatch {
            a_rows: a.rows(),
            a_cols: a.cols(),
            b_rows: b.rows(),
            b_cols: b.cols(),
        });
    }
    Ok(())
}

fn multiply_recursive(a: &Matrix, b: &Matrix) -> Matrix {
    if a.rows() <= BASE_CASE_SIZE {
        return standard_multiply(a, b);
    }

    let [a11, a12, a21, a22] = a.split();
    let [b11, b12, b21, b22] = b.split();

    let m1 = multiply_recursive(&a11.add(&a22), &b11.add(&b22));
    let m2 = multiply_recursive(&a21.add(&a22), &b11);
    let m3 = multiply_recursive(&a11, &b12.sub(&b22));
    let m4 = multiply_recursive(&a22, &b21.sub(&b11));
    let m5 = multiply_recursive(&a11.add(&a12), &b22);
    let m6 = multiply_recursive(&a21.sub(&a11), &b11.add(&b12));
    let m7 = multiply_recursive(&a12.sub(&a22), &b21.add(&b22));

    let c11 = m1.add(&m4).sub(&m5).add(&m7);
    let c12 = m3.add(&m5);
    let c21 = m2.add(&m4);
    let c22 = m1.sub(&m2).add(&m3).add(&m6);

    Matrix::combine(&c11, &c12, &c21, &c22)
}

fn standard_multiply(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(a.rows(), b.cols());
    for i in 0..a.rows() {
        let row = a.row(i);
        for j in 0..b.cols() {
            let mut sum = 0i32;
            for (k, &x) in row.iter().enumerate() {
                sum = sum.wrapping_add(x.wrapping_mul(b[(k, j)]));
            }
            out.set(i, j, sum);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(rng: &mut StdRng, rows: usize, cols: usize, range: i32) -> Matrix {
        let data = (0..rows * cols)
            .map(|_| rng.gen_range(-range..=range))
            .collect();
        Matrix::from_vec(rows, cols, data).unwrap()
    }

    #[test]
    fn test_multiply_2x2() {
        let a = Matrix::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap();
        let b = Matrix::from_rows(vec![vec![5, 6], vec![7, 8]]).unwrap();
        let c = multiply(&a, &b).unwrap();
        assert_eq!(c.to_rows(), vec![vec![19, 22], vec![43, 50]]);
    }

    #[test]
    fn test_multiply_square_matches_direct() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in [1, 2, 3, 4, 5, 7, 8, 9, 16, 20, 33] {
            let a = random(&mut rng, n, n, 9);
            let b = random(&mut rng, n, n, 9);
            assert_eq!(
                multiply(&a, &b).unwrap(),
                multiply_direct(&a, &b).unwrap(),
                "n = {}",
                n
            );
        }
    }

    #[test]
    fn test_multiply_rectangular() {
        let mut rng = StdRng::seed_from_u64(11);
        for (r, k, c) in [(1, 3, 1), (2, 5, 3), (7, 2, 9), (3, 17, 4), (12, 1, 12)] {
            let a = random(&mut rng, r, k, 50);
            let b = random(&mut rng, k, c, 50);
            let product = multiply(&a, &b).unwrap();
            assert_eq!(product.rows(), r);
            assert_eq!(product.cols(), c);
            assert_eq!(product, multiply_direct(&a, &b).unwrap());
        }
    }

    #[test]
    fn test_multiply_identity() {
        let a = Matrix::from_rows(vec![vec![3, -1, 4], vec![1, 5, -9], vec![2, 6, 5]]).unwrap();
        let mut eye = Matrix::zeros(3, 3).to_rows();
        for (i, row) in eye.iter_mut().enumerate() {
            row[i] = 1;
        }
        let eye = Matrix::from_rows(eye).unwrap();
        assert_eq!(multiply(&a, &eye).unwrap(), a);
        assert_eq!(multiply(&eye, &a).unwrap(), a);
    }

    #[test]
    fn test_multiply_dimension_mismatch() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 2);
        let err = multiply(&a, &b).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                a_rows: 2,
                a_cols: 3,
                b_rows: 2,
                b_cols: 2
            }
        ));
        assert!(multiply_direct(&a, &b).is_err());
    }

    #[test]
    fn test_multiply_empty_inner_dimension() {
        let a = Matrix::zeros(3, 0);
        let b = Matrix::zeros(0, 2);
        let c = multiply(&a, &b).unwrap();
        assert_eq!(c, Matrix::zeros(3, 2));
    }

    #[test]
    fn test_multiply_wraps_on_overflow() {
        let a = Matrix::from_rows(vec![vec![i32::MAX, i32::MAX]]).unwrap();
        let b = Matrix::from_rows(vec![vec![2], vec![2]]).unwrap();
        let expected = i32::MAX.wrapping_mul(2).wrapping_mul(2);
        assert_eq!(multiply(&a, &b).unwrap()[(0, 0)], expected);
        assert_eq!(multiply_direct(&a, &b).unwrap()[(0, 0)], expected);
    }

    #[test]
    fn test_multiply_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random(&mut rng, 13, 13, 100);
        let b = random(&mut rng, 13, 13, 100);
        assert_eq!(multiply(&a, &b).unwrap(), multiply(&a, &b).unwrap());
    }
}
