//! Degenerate-solution escape.
//!
//! A random start can put one or two entities far from the rest; ALS then
//! happily converges to a configuration that reproduces the observed cells but
//! predicts missing ones badly. We detect that geometry with a pseudo-z-score
//! of the largest distance from the origin and, when it fires, shake the whole
//! facet with uniform noise. The returned flag makes the opposing facet get
//! shaken on the next half-step too, so both move within one full cycle.

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use crate::domain::{Conditioning, Coords, JoltSpec};
use crate::error::AlsError;
use crate::fit::condition::condcoord;
use crate::math::{mean, median_mut, std_dev};

/// Lower bound on the outlier-free SD used as the z denominator.
const SD_FLOOR: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct JoltOutcome {
    pub coords: Coords,
    /// Thread into the next half-step's call.
    pub flag: bool,
    pub jolted: bool,
    pub z: Option<f64>,
}

/// `(max d − mean d) / SD(lower half of d)`, with the SD floored at 1.
///
/// `None` for fewer than 2 valid entities.
pub fn pseudo_z(coords: &Coords) -> Option<f64> {
    let d: Vec<f64> = coords.distances().into_iter().flatten().collect();
    if d.len() < 2 {
        return None;
    }
    let max = d.iter().fold(f64::NEG_INFINITY, |m, v| m.max(*v));
    let mu = mean(&d)?;

    let mut sorted = d.clone();
    let median = median_mut(&mut sorted)?;
    let lower: Vec<f64> = d.iter().copied().filter(|v| *v < median).collect();
    let sd = std_dev(&lower).unwrap_or(0.0).max(SD_FLOOR);

    Some((max - mu) / sd)
}

/// Perturb `coords` if its geometry is outlier-dominated or `flag` is set.
///
/// When neither condition holds the input is returned unchanged with the flag
/// cleared.
pub fn jolt(
    coords: &Coords,
    spec: &JoltSpec,
    flag: bool,
    conditioning: &Conditioning,
    rng: &mut StdRng,
) -> Result<JoltOutcome, AlsError> {
    let z = pseudo_z(coords);
    let triggered = z.is_some_and(|z| z > spec.sigma);

    if !triggered && !flag {
        return Ok(JoltOutcome {
            coords: coords.clone(),
            flag: false,
            jolted: false,
            z,
        });
    }

    let d: Vec<f64> = coords.distances().into_iter().flatten().collect();
    let scale = match mean(&d) {
        Some(m) if m > 0.0 => spec.magnitude * m,
        _ => spec.magnitude,
    };

    let dist = Uniform::new_inclusive(-1.0, 1.0);
    let sub = coords.valid_matrix();
    let raw = sub.map(|_| rng.sample(dist) * scale);

    let noise = if spec.condition_noise && !conditioning.is_none() {
        let mut holder = Coords::missing(raw.nrows(), raw.ncols());
        for i in 0..raw.nrows() {
            let row: Vec<f64> = raw.row(i).iter().copied().collect();
            holder.set(i, Some(&row));
        }
        let conditioned = condcoord(&holder, conditioning)?.coords.valid_matrix();
        // Keep the requested amplitude after conditioning rescales the noise.
        let norm = conditioned.norm();
        if norm > 0.0 {
            conditioned * (raw.norm() / norm)
        } else {
            raw
        }
    } else {
        raw
    };

    let mut out = coords.clone();
    out.scatter_valid(&(sub + noise))?;

    log::debug!(
        "jolt: z={:?} sigma={} carried_flag={} scale={:.4}",
        z,
        spec.sigma,
        flag,
        scale
    );

    Ok(JoltOutcome {
        coords: out,
        flag: triggered && !flag,
        jolted: true,
        z,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use rand::SeedableRng;

    fn clustered_with_outlier() -> Coords {
        let mut values = DMatrix::from_fn(30, 2, |i, d| 0.1 * ((i + d) % 5) as f64);
        values[(7, 0)] = 40.0;
        values[(7, 1)] = -35.0;
        Coords::from_matrix(values).unwrap()
    }

    #[test]
    fn untriggered_jolt_is_identity() {
        let coords = Coords::new(
            DMatrix::from_fn(10, 2, |i, d| (i as f64 - 4.5) * 0.2 + d as f64),
            vec![true, true, false, true, true, true, true, true, true, true],
        )
        .unwrap();
        let spec = JoltSpec::default();
        let mut rng = StdRng::seed_from_u64(1);
        let out = jolt(&coords, &spec, false, &Conditioning::None, &mut rng).unwrap();
        assert!(!out.jolted);
        assert!(!out.flag);
        assert_eq!(out.coords, coords);
    }

    #[test]
    fn outlier_triggers_and_sets_flag() {
        let coords = clustered_with_outlier();
        let z = pseudo_z(&coords).unwrap();
        assert!(z > 4.0, "expected a large pseudo-z, got {z}");

        let mut rng = StdRng::seed_from_u64(2);
        let out = jolt(&coords, &JoltSpec::default(), false, &Conditioning::None, &mut rng).unwrap();
        assert!(out.jolted);
        assert!(out.flag);
        assert_ne!(out.coords, coords);
    }

    #[test]
    fn carried_flag_jolts_once_and_clears() {
        let coords = Coords::from_matrix(DMatrix::from_fn(8, 1, |i, _| i as f64 * 0.1)).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let out = jolt(&coords, &JoltSpec::default(), true, &Conditioning::None, &mut rng).unwrap();
        assert!(out.jolted);
        assert!(!out.flag);
    }

    #[test]
    fn missing_entities_survive_jolting() {
        let mut coords = clustered_with_outlier();
        coords.set(3, None);
        let mut rng = StdRng::seed_from_u64(4);
        let out = jolt(&coords, &JoltSpec::default(), true, &Conditioning::Std, &mut rng).unwrap();
        assert!(!out.coords.is_valid(3));
        assert_eq!(out.coords.count_valid(), 29);
    }
}
