//! Read/write anchor bank JSON files.
//!
//! A bank is the portable record of a finished run's coordinates, keyed by
//! entity id. A later run over data that shares some of those ids can load the
//! bank and hold the shared entities fixed, which places both runs in the same
//! coordinate space.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::domain::{Coords, DataMatrix, Facet};
use crate::error::AlsError;
use crate::fit::{Anchors, CoordResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorBank {
    pub tool: String,
    pub ndim: usize,
    pub created: DateTime<Utc>,
    pub rows: BTreeMap<String, Vec<f64>>,
    pub cols: BTreeMap<String, Vec<f64>>,
}

impl AnchorBank {
    /// Bank every valid entity of a finished run.
    pub fn from_result(data: &DataMatrix, result: &CoordResult) -> Self {
        let bank = |facet: Facet| -> BTreeMap<String, Vec<f64>> {
            let coords = result.coords(facet);
            data.ids(facet)
                .iter()
                .enumerate()
                .filter_map(|(i, id)| Some((id.clone(), coords.row(i)?.iter().copied().collect())))
                .collect()
        };
        Self {
            tool: "alsm".to_string(),
            ndim: result.ndim,
            created: Utc::now(),
            rows: bank(Facet::Rows),
            cols: bank(Facet::Cols),
        }
    }

    pub fn entries(&self, facet: Facet) -> &BTreeMap<String, Vec<f64>> {
        match facet {
            Facet::Rows => &self.rows,
            Facet::Cols => &self.cols,
        }
    }

    /// Coordinates for `ids` in order; ids not in the bank are missing.
    pub fn resolve(&self, facet: Facet, ids: &[String]) -> Result<Coords, AlsError> {
        let mut values = DMatrix::zeros(ids.len(), self.ndim);
        let mut valid = vec![false; ids.len()];
        for (i, id) in ids.iter().enumerate() {
            let Some(v) = self.entries(facet).get(id) else { continue };
            if v.len() != self.ndim {
                return Err(AlsError::Anchor(format!(
                    "{facet} entity '{id}' has {} coordinates, bank ndim is {}",
                    v.len(),
                    self.ndim
                )));
            }
            values.row_mut(i).copy_from_slice(v);
            valid[i] = true;
        }
        Coords::new(values, valid)
    }

    /// Anchors for a run over `data` at dimensionality `ndim`.
    ///
    /// A facet with no banked entity in `data` stays free.
    pub fn anchors_for(&self, data: &DataMatrix, ndim: usize) -> Result<Anchors, AlsError> {
        if ndim != self.ndim {
            return Err(AlsError::Anchor(format!(
                "bank was built with ndim={}, run uses ndim={ndim}",
                self.ndim
            )));
        }
        let mut anchors = Anchors::none();
        for facet in Facet::BOTH {
            let coords = self.resolve(facet, data.ids(facet))?;
            let n = coords.count_valid();
            if n > 0 {
                log::info!("anchoring {n} {facet} entities from bank");
                anchors = anchors.with(facet, coords);
            }
        }
        Ok(anchors)
    }
}

/// Write an anchor bank JSON file.
pub fn write_anchor_bank(path: &Path, bank: &AnchorBank) -> Result<(), AlsError> {
    let file = File::create(path).map_err(|source| AlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), bank)?;
    Ok(())
}

/// Read an anchor bank JSON file.
pub fn read_anchor_bank(path: &Path) -> Result<AnchorBank, AlsError> {
    let file = File::open(path).map_err(|source| AlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let bank: AnchorBank = serde_json::from_reader(BufReader::new(file))?;
    if bank.ndim == 0 {
        return Err(AlsError::Anchor("bank has ndim=0".to_string()));
    }
    Ok(bank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::data::{SampleSpec, create_data};
    use crate::domain::{AlsConfig, DimSpec};
    use crate::fit::{CancelToken, coord};

    fn small_run() -> (DataMatrix, CoordResult) {
        let data = create_data(&SampleSpec {
            nrows: 30,
            ncols: 20,
            ndim: 2,
            seed: 4,
            ..SampleSpec::default()
        })
        .unwrap()
        .data;
        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            ..AlsConfig::default()
        };
        let result = coord(&data, &config, &Anchors::none(), &CancelToken::new()).unwrap();
        (data, result)
    }

    #[test]
    fn bank_round_trips_through_json() {
        let (data, result) = small_run();
        let bank = AnchorBank::from_result(&data, &result);
        assert_eq!(bank.rows.len(), 30);
        assert_eq!(bank.cols.len(), 20);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.json");
        write_anchor_bank(&path, &bank).unwrap();
        let back = read_anchor_bank(&path).unwrap();
        assert_eq!(back.ndim, bank.ndim);
        assert_eq!(back.created, bank.created);
        assert_eq!(back.rows.keys().collect::<Vec<_>>(), bank.rows.keys().collect::<Vec<_>>());

        let cols = back.resolve(Facet::Cols, data.ids(Facet::Cols)).unwrap();
        assert_eq!(cols.validity(), result.cols().validity());
        assert_relative_eq!(cols.values(), result.cols().values(), max_relative = 1e-12);
    }

    #[test]
    fn unknown_ids_resolve_to_missing() {
        let (data, result) = small_run();
        let bank = AnchorBank::from_result(&data, &result);
        let ids = vec![data.ids(Facet::Rows)[3].clone(), "stranger".to_string()];
        let rows = bank.resolve(Facet::Rows, &ids).unwrap();
        assert!(rows.is_valid(0));
        assert!(!rows.is_valid(1));
        assert_eq!(rows.row(0), result.rows().row(3));
    }

    #[test]
    fn wrong_ndim_is_an_anchor_error() {
        let (data, result) = small_run();
        let bank = AnchorBank::from_result(&data, &result);
        let err = bank.anchors_for(&data, 3).unwrap_err();
        assert!(matches!(err, AlsError::Anchor(_)));

        let mut broken = bank.clone();
        if let Some(v) = broken.cols.values_mut().next() {
            v.push(0.0);
        }
        let err = broken.resolve(Facet::Cols, data.ids(Facet::Cols)).unwrap_err();
        assert!(matches!(err, AlsError::Anchor(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_anchor_bank(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, AlsError::Io { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
