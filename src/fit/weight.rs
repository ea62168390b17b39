//! Influence weights for the opposing facet.
//!
//! Entities far from the origin dominate a least-squares solve. Weighting each
//! by the inverse of its squared distance keeps a few extreme entities from
//! pulling the whole opposing facet around, which is one of the ways a random
//! start drifts into a degenerate geometry.

use crate::domain::Coords;

/// Squared-distance floor, relative to the mean squared distance.
const REL_DISTANCE_FLOOR: f64 = 1e-6;

/// Absolute squared-distance floor.
const ABS_DISTANCE_FLOOR: f64 = 1e-12;

/// Weight per entity: `1 / max(d², floor)`, normalized to mean 1 over the
/// valid entities. Missing entities get weight 0.
///
/// With `obs_counts`, the weights are further multiplied by
/// `ln(1 + n_obs)` (floored at `ln 2`) and renormalized.
pub fn weight_coord(coords: &Coords, obs_counts: Option<&[usize]>) -> Vec<f64> {
    let d2: Vec<Option<f64>> = coords
        .distances()
        .into_iter()
        .map(|d| d.map(|v| v * v))
        .collect();

    let valid: Vec<f64> = d2.iter().flatten().copied().collect();
    if valid.is_empty() {
        return vec![0.0; coords.n_entities()];
    }
    let mean_d2 = valid.iter().sum::<f64>() / valid.len() as f64;
    let floor = (mean_d2 * REL_DISTANCE_FLOOR).max(ABS_DISTANCE_FLOOR);

    let mut weights: Vec<f64> = d2
        .iter()
        .enumerate()
        .map(|(i, d)| match d {
            Some(v) => {
                let w = 1.0 / v.max(floor);
                match obs_counts {
                    Some(counts) => w * (1.0 + counts[i] as f64).ln().max(std::f64::consts::LN_2),
                    None => w,
                }
            }
            None => 0.0,
        })
        .collect();

    normalize_mean_one(&mut weights, coords.validity());
    weights
}

fn normalize_mean_one(weights: &mut [f64], valid: &[bool]) {
    let (sum, n) = weights
        .iter()
        .zip(valid)
        .filter(|(_, ok)| **ok)
        .fold((0.0, 0usize), |(s, n), (w, _)| (s + w, n + 1));
    if n == 0 || !(sum.is_finite() && sum > 0.0) {
        return;
    }
    let scale = n as f64 / sum;
    for (w, ok) in weights.iter_mut().zip(valid) {
        if *ok {
            *w *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn weights_are_positive_and_finite_for_valid_entities() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let n = rng.gen_range(2..40);
            let ndim = rng.gen_range(1..5);
            let values = DMatrix::from_fn(n, ndim, |_, _| rng.gen_range(-50.0..50.0));
            let valid: Vec<bool> = (0..n).map(|i| i == 0 || rng.gen_bool(0.8)).collect();
            let coords = Coords::new(values, valid.clone()).unwrap();
            let counts: Vec<usize> = (0..n).map(|_| rng.gen_range(1..30)).collect();

            for w in [weight_coord(&coords, None), weight_coord(&coords, Some(&counts))] {
                for (wi, ok) in w.iter().zip(&valid) {
                    if *ok {
                        assert!(wi.is_finite() && *wi > 0.0, "bad weight {wi}");
                    } else {
                        assert_eq!(*wi, 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn entity_at_origin_gets_finite_weight() {
        let coords = Coords::from_matrix(DMatrix::from_row_slice(3, 1, &[0.0, 1.0, 2.0])).unwrap();
        let w = weight_coord(&coords, None);
        assert!(w.iter().all(|v| v.is_finite() && *v > 0.0));
        assert!(w[0] > w[1] && w[1] > w[2]);
        let mean = w.iter().sum::<f64>() / 3.0;
        assert_abs_diff_eq!(mean, 1.0, epsilon = 1e-12);
    }
}
