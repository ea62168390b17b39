//! Coordinate conditioning.
//!
//! A conditioning transform changes one facet's coordinates to satisfy a
//! property (orthonormal columns, unit SD, positivity, ...). When the
//! transform is linear it is returned as a matrix for the opposing facet, so
//! that `U Vᵗ` (the cell estimates) is unchanged:
//!
//! ```text
//! U' = U T   ⇒   V' = V T⁻ᵗ
//! ```
//!
//! Missing entities are masked out before the transform and left untouched.

use nalgebra::DMatrix;

use crate::domain::{Conditioning, Coords};
use crate::error::{AlsError, ConditionError};

/// Diagonal entries of `R` below this (relative to the largest) mark a
/// rank-deficient facet.
const RANK_TOL: f64 = 1e-10;

/// Output of [`condcoord`].
#[derive(Debug, Clone)]
pub struct Conditioned {
    pub coords: Coords,
    /// Right-multiply the opposing facet's coordinates by this matrix to keep
    /// the estimates unchanged. `None` for identity or non-linear transforms.
    pub opposing_transform: Option<DMatrix<f64>>,
}

impl Conditioned {
    fn unchanged(coords: &Coords) -> Self {
        Self {
            coords: coords.clone(),
            opposing_transform: None,
        }
    }
}

/// Apply `spec` to the valid entities of `coords`.
pub fn condcoord(coords: &Coords, spec: &Conditioning) -> Result<Conditioned, AlsError> {
    match spec {
        Conditioning::None => Ok(Conditioned::unchanged(coords)),
        Conditioning::Orthonormal => orthonormal(coords),
        Conditioning::Std => standardize(coords),
        Conditioning::NonNeg1D => {
            if coords.ndim() != 1 {
                return Err(ConditionError::RequiresOneDimension { ndim: coords.ndim() }.into());
            }
            nonlinear(coords, |sub| sub.map(f64::exp))
        }
        Conditioning::AllSame => nonlinear(coords, all_same),
        Conditioning::Custom(f) => {
            let sub = coords.valid_matrix();
            let out = (f.0)(&sub);
            if out.shape() != sub.shape() {
                return Err(ConditionError::CustomShape {
                    rows: sub.nrows(),
                    cols: sub.ncols(),
                    got_rows: out.nrows(),
                    got_cols: out.ncols(),
                }
                .into());
            }
            nonlinear(coords, move |_| out)
        }
    }
}

fn orthonormal(coords: &Coords) -> Result<Conditioned, AlsError> {
    let ndim = coords.ndim();
    let sub = coords.valid_matrix();
    let n_valid = sub.nrows();
    if n_valid < ndim {
        return Err(ConditionError::UnderDetermined {
            valid: n_valid,
            ndim,
        }
        .into());
    }

    let qr = sub.qr();
    let mut q = qr.q();
    let mut r = qr.r();

    let max_diag = r.diagonal().iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if !(max_diag > 0.0) || r.diagonal().iter().any(|v| v.abs() <= RANK_TOL * max_diag) {
        return Err(ConditionError::UnderDetermined {
            valid: n_valid,
            ndim,
        }
        .into());
    }

    // Fix signs so R has a positive diagonal; keeps the result deterministic
    // across iterations.
    for k in 0..ndim {
        if r[(k, k)] < 0.0 {
            let mut qk = q.column_mut(k);
            qk *= -1.0;
            let mut rk = r.row_mut(k);
            rk *= -1.0;
        }
    }

    let mut out = coords.clone();
    out.scatter_valid(&q)?;
    Ok(Conditioned {
        coords: out,
        opposing_transform: Some(r.transpose()),
    })
}

fn standardize(coords: &Coords) -> Result<Conditioned, AlsError> {
    let ndim = coords.ndim();
    let mut sub = coords.valid_matrix();
    let n = sub.nrows();
    if n < 2 {
        return Ok(Conditioned::unchanged(coords));
    }

    let mut scales = DMatrix::<f64>::identity(ndim, ndim);
    for d in 0..ndim {
        let col = sub.column(d);
        let mean = col.mean();
        let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let sd = var.sqrt();
        if sd.is_finite() && sd > 0.0 {
            let mut c = sub.column_mut(d);
            c /= sd;
            scales[(d, d)] = sd;
        }
    }

    let mut out = coords.clone();
    out.scatter_valid(&sub)?;
    Ok(Conditioned {
        coords: out,
        opposing_transform: Some(scales),
    })
}

fn all_same(sub: &DMatrix<f64>) -> DMatrix<f64> {
    let n = sub.nrows();
    if n == 0 {
        return sub.clone();
    }
    let means = sub.row_mean();
    DMatrix::from_fn(n, sub.ncols(), |_, d| means[d])
}

fn nonlinear(
    coords: &Coords,
    f: impl FnOnce(&DMatrix<f64>) -> DMatrix<f64>,
) -> Result<Conditioned, AlsError> {
    let sub = coords.valid_matrix();
    let mut out = coords.clone();
    out.scatter_valid(&f(&sub))?;
    Ok(Conditioned {
        coords: out,
        opposing_transform: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CustomConditioner;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_coords(n: usize, ndim: usize, seed: u64, missing: &[usize]) -> Coords {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = DMatrix::from_fn(n, ndim, |_, _| rng.gen_range(-3.0..3.0));
        let valid = (0..n).map(|i| !missing.contains(&i)).collect();
        Coords::new(values, valid).unwrap()
    }

    #[test]
    fn orthonormal_columns_and_unchanged_estimates() {
        let rows = random_coords(12, 3, 1, &[4, 9]);
        let cols = random_coords(7, 3, 2, &[]);
        let before = rows.values() * cols.values().transpose();

        let c = condcoord(&rows, &Conditioning::Orthonormal).unwrap();
        let sub = c.coords.valid_matrix();
        let gram = sub.transpose() * &sub;
        for a in 0..3 {
            for b in 0..3 {
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(a, b)], expected, epsilon = 1e-10);
            }
        }

        let mut cols2 = cols.clone();
        cols2.transform(c.opposing_transform.as_ref().unwrap()).unwrap();
        let after = c.coords.values() * cols2.values().transpose();
        for i in 0..12 {
            if rows.is_valid(i) {
                for j in 0..7 {
                    assert_abs_diff_eq!(before[(i, j)], after[(i, j)], epsilon = 1e-9);
                }
            }
        }
        assert!(!c.coords.is_valid(4) && !c.coords.is_valid(9));
    }

    #[test]
    fn orthonormal_fails_when_under_determined() {
        let rows = random_coords(4, 3, 5, &[0, 1]);
        let err = condcoord(&rows, &Conditioning::Orthonormal).unwrap_err();
        assert!(matches!(
            err,
            AlsError::Condition(ConditionError::UnderDetermined { valid: 2, ndim: 3 })
        ));
    }

    #[test]
    fn std_gives_unit_sd_and_compensates() {
        let rows = random_coords(20, 2, 8, &[3]);
        let cols = random_coords(5, 2, 9, &[]);
        let c = condcoord(&rows, &Conditioning::Std).unwrap();
        let sub = c.coords.valid_matrix();
        for d in 0..2 {
            let col = sub.column(d);
            let mean = col.mean();
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sub.nrows() as f64;
            assert_abs_diff_eq!(var.sqrt(), 1.0, epsilon = 1e-10);
        }
        let mut cols2 = cols.clone();
        cols2.transform(c.opposing_transform.as_ref().unwrap()).unwrap();
        let before = rows.values() * cols.values().transpose();
        let after = c.coords.values() * cols2.values().transpose();
        assert_abs_diff_eq!(before[(0, 0)], after[(0, 0)], epsilon = 1e-9);
    }

    #[test]
    fn nonneg_requires_one_dimension() {
        let two = random_coords(5, 2, 1, &[]);
        assert!(condcoord(&two, &Conditioning::NonNeg1D).is_err());
        let one = random_coords(5, 1, 1, &[2]);
        let c = condcoord(&one, &Conditioning::NonNeg1D).unwrap();
        assert!(c.coords.valid_matrix().iter().all(|v| *v > 0.0));
        assert!(!c.coords.is_valid(2));
    }

    #[test]
    fn all_same_collapses_to_mean() {
        let coords = Coords::new(
            DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 99.0, 99.0]),
            vec![true, true, false],
        )
        .unwrap();
        let c = condcoord(&coords, &Conditioning::AllSame).unwrap();
        assert_eq!(c.coords.row(0).unwrap()[0], 2.0);
        assert_eq!(c.coords.row(1).unwrap()[1], 3.0);
        assert!(c.coords.row(2).is_none());
    }

    #[test]
    fn custom_conditioner_sees_only_valid_rows() {
        let coords = random_coords(6, 2, 4, &[1, 5]);
        let doubler = CustomConditioner::new(|m: &DMatrix<f64>| {
            assert_eq!(m.nrows(), 4);
            m * 2.0
        });
        let c = condcoord(&coords, &Conditioning::Custom(doubler)).unwrap();
        assert_abs_diff_eq!(
            c.coords.row(0).unwrap()[0],
            2.0 * coords.row(0).unwrap()[0],
            epsilon = 1e-12
        );
        assert!(!c.coords.is_valid(1));

        let bad = CustomConditioner::new(|_m: &DMatrix<f64>| DMatrix::zeros(1, 1));
        assert!(matches!(
            condcoord(&coords, &Conditioning::Custom(bad)),
            Err(AlsError::Condition(ConditionError::CustomShape { .. }))
        ));
    }
}
