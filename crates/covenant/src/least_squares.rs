use nalgebra::{DMatrix, DVector};

use crate::error::{DslError, DslResult};

/// Tolerance below which singular values are treated as zero when the normal
/// equations need the pseudo-inverse fallback.
const PSEUDO_INVERSE_EPS: f64 = 1e-10;

/// Ordinary least squares used for conditional-expectation estimates.
///
/// `x` holds one regressor per row, `path_count` observations per row; `y`
/// is the regressand. `fit` returns the orthogonal projection of `y` onto
/// the row space of `x` — the fitted value per path, not the coefficients.
#[derive(Debug)]
pub struct LeastSquares {
    x: DMatrix<f64>,
    y: DVector<f64>,
}

impl LeastSquares {
    pub fn new(rows: Vec<Vec<f64>>, y: Vec<f64>) -> DslResult<Self> {
        let path_count = y.len();
        if rows.is_empty() {
            return Err(DslError::numeric("least squares requires at least one regressor"));
        }
        for row in &rows {
            if row.len() != path_count {
                return Err(DslError::numeric(format!(
                    "regressor length {} does not match {} observations",
                    row.len(),
                    path_count
                )));
            }
        }
        let x = DMatrix::from_fn(rows.len(), path_count, |i, j| rows[i][j]);
        Ok(Self {
            x,
            y: DVector::from_vec(y),
        })
    }

    /// Solves the normal equations, falling back to the pseudo-inverse when
    /// the Gram matrix is singular (e.g. constant price paths make the
    /// regressor rows collinear).
    pub fn fit(&self) -> DslResult<Vec<f64>> {
        let gram = &self.x * self.x.transpose();
        let rhs = &self.x * &self.y;

        let coefficients = match gram.clone().cholesky() {
            Some(factor) => factor.solve(&rhs),
            None => {
                let pseudo_inverse = gram
                    .pseudo_inverse(PSEUDO_INVERSE_EPS)
                    .map_err(|_| DslError::numeric("least-squares design matrix is singular"))?;
                &pseudo_inverse * &rhs
            }
        };

        let fitted = self.x.transpose() * coefficients;
        if fitted.iter().any(|value| !value.is_finite()) {
            return Err(DslError::numeric("least-squares fit produced non-finite values"));
        }
        Ok(fitted.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_fit(rows: Vec<Vec<f64>>, y: Vec<f64>, expected: &[f64]) {
        let fitted = LeastSquares::new(rows, y).unwrap().fit().unwrap();
        assert_eq!(fitted.len(), expected.len());
        for (got, want) in fitted.iter().zip(expected) {
            assert!(
                (got - want).abs() < 1e-12,
                "fitted {got} differs from expected {want} (all fitted: {fitted:?})"
            );
        }
    }

    #[test]
    fn fits_constant_regressand() {
        assert_fit(
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]],
            vec![1.0, 1.0, 1.0],
            &[1.0, 1.0, 1.0],
        );
    }

    #[test]
    fn fits_linear_regressand() {
        assert_fit(
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]],
            vec![0.0, 1.0, 2.0],
            &[0.0, 1.0, 2.0],
        );
    }

    #[test]
    fn rank_deficient_design_uses_pseudo_inverse() {
        // second row is a multiple of the first, so the Gram matrix is singular
        let fitted = LeastSquares::new(
            vec![vec![1.0, 1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0, 2.0]],
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap()
        .fit()
        .unwrap();
        for value in fitted {
            assert!((value - 2.5).abs() < 1e-9, "projection onto constants is the mean");
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = LeastSquares::new(vec![vec![1.0, 2.0]], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err.kind(), crate::error::DslErrorKind::Numeric);
    }
}
