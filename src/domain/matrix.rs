//! Masked numeric containers.
//!
//! Missing cells and missing coordinates are carried by an explicit boolean
//! validity mask instead of a magic sentinel value. The sentinel form is only
//! produced or consumed at the boundary (`from_sentinel` / `to_sentinel`) for
//! collaborators that still speak it.

use nalgebra::{DMatrix, RowDVector};

use crate::error::AlsError;

/// A 2-D array of `f64` with a per-cell validity mask.
///
/// Invalid cells always hold `0.0` in `values`, so the raw buffer never
/// contains garbage, but callers must consult the mask before reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedMatrix {
    values: DMatrix<f64>,
    valid: DMatrix<bool>,
}

impl MaskedMatrix {
    /// Build from a value buffer and a mask of the same shape.
    ///
    /// Every valid cell must be finite.
    pub fn new(mut values: DMatrix<f64>, valid: DMatrix<bool>) -> Result<Self, AlsError> {
        if values.shape() != valid.shape() {
            return Err(AlsError::data(format!(
                "value shape {:?} does not match mask shape {:?}",
                values.shape(),
                valid.shape()
            )));
        }
        for j in 0..values.ncols() {
            for i in 0..values.nrows() {
                if valid[(i, j)] {
                    if !values[(i, j)].is_finite() {
                        return Err(AlsError::data(format!(
                            "non-finite observation at cell ({i}, {j})"
                        )));
                    }
                } else {
                    values[(i, j)] = 0.0;
                }
            }
        }
        Ok(Self { values, valid })
    }

    /// A fully-observed matrix.
    pub fn complete(values: DMatrix<f64>) -> Result<Self, AlsError> {
        let valid = DMatrix::from_element(values.nrows(), values.ncols(), true);
        Self::new(values, valid)
    }

    /// A matrix with every cell missing.
    pub fn missing(nrows: usize, ncols: usize) -> Self {
        Self {
            values: DMatrix::zeros(nrows, ncols),
            valid: DMatrix::from_element(nrows, ncols, false),
        }
    }

    /// Build cell by cell; `None` marks a missing cell.
    ///
    /// Non-finite values returned by `f` are stored as missing.
    pub fn from_fn(nrows: usize, ncols: usize, mut f: impl FnMut(usize, usize) -> Option<f64>) -> Self {
        let mut out = Self::missing(nrows, ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                out.set(i, j, f(i, j));
            }
        }
        out
    }

    /// Interpret `nanval` as the missing-cell marker.
    pub fn from_sentinel(values: DMatrix<f64>, nanval: f64) -> Result<Self, AlsError> {
        let valid = values.map(|v| v != nanval);
        Self::new(values, valid)
    }

    /// Export with `nanval` written into every missing cell.
    pub fn to_sentinel(&self, nanval: f64) -> DMatrix<f64> {
        DMatrix::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.get(i, j).unwrap_or(nanval)
        })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.shape()
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        if self.valid[(i, j)] {
            Some(self.values[(i, j)])
        } else {
            None
        }
    }

    pub fn is_valid(&self, i: usize, j: usize) -> bool {
        self.valid[(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, value: Option<f64>) {
        match value {
            Some(v) if v.is_finite() => {
                self.values[(i, j)] = v;
                self.valid[(i, j)] = true;
            }
            _ => {
                self.values[(i, j)] = 0.0;
                self.valid[(i, j)] = false;
            }
        }
    }

    /// Raw values; missing cells read as `0.0`.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn mask(&self) -> &DMatrix<bool> {
        &self.valid
    }

    pub fn transpose(&self) -> Self {
        Self {
            values: self.values.transpose(),
            valid: self.valid.transpose(),
        }
    }

    pub fn count_valid(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    pub fn row_count(&self, i: usize) -> usize {
        self.valid.row(i).iter().filter(|v| **v).count()
    }

    pub fn col_count(&self, j: usize) -> usize {
        self.valid.column(j).iter().filter(|v| **v).count()
    }

    /// Column indices with data in row `i`.
    pub fn row_index(&self, i: usize) -> Vec<usize> {
        (0..self.ncols()).filter(|&j| self.valid[(i, j)]).collect()
    }

    /// Iterate `(row, col, value)` over valid cells in column-major order.
    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let nrows = self.nrows();
        self.valid
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .map(move |(k, _)| {
                let (i, j) = (k % nrows, k / nrows);
                (i, j, self.values[(i, j)])
            })
    }

    /// Apply `f` to every valid cell; cells for which `f` returns `None`
    /// become missing.
    pub fn map_valid(&self, mut f: impl FnMut(usize, usize, f64) -> Option<f64>) -> Self {
        Self::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.get(i, j).and_then(|v| f(i, j, v))
        })
    }

    /// Combine two matrices of the same shape cell by cell; a cell is valid
    /// only where both inputs are valid and `f` returns a value.
    pub fn zip_valid(
        &self,
        other: &MaskedMatrix,
        mut f: impl FnMut(f64, f64) -> Option<f64>,
    ) -> Result<Self, AlsError> {
        if self.shape() != other.shape() {
            return Err(AlsError::DimensionMismatch {
                context: "masked matrix zip".to_string(),
                expected: self.nrows() * self.ncols(),
                got: other.nrows() * other.ncols(),
            });
        }
        Ok(Self::from_fn(self.nrows(), self.ncols(), |i, j| {
            match (self.get(i, j), other.get(i, j)) {
                (Some(a), Some(b)) => f(a, b),
                _ => None,
            }
        }))
    }

    /// Valid values of row `i`.
    pub fn row_values(&self, i: usize) -> Vec<f64> {
        (0..self.ncols()).filter_map(|j| self.get(i, j)).collect()
    }

    /// Valid values of column `j`.
    pub fn col_values(&self, j: usize) -> Vec<f64> {
        (0..self.nrows()).filter_map(|i| self.get(i, j)).collect()
    }

    /// All valid values, column-major.
    pub fn valid_values(&self) -> Vec<f64> {
        self.iter_valid().map(|(_, _, v)| v).collect()
    }
}

/// One facet's coordinate array: entities × dimensions, with a per-entity
/// validity flag. An entity is either fully valid or fully missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Coords {
    values: DMatrix<f64>,
    valid: Vec<bool>,
}

impl Coords {
    pub fn new(mut values: DMatrix<f64>, valid: Vec<bool>) -> Result<Self, AlsError> {
        if values.nrows() != valid.len() {
            return Err(AlsError::DimensionMismatch {
                context: "coordinate validity mask".to_string(),
                expected: values.nrows(),
                got: valid.len(),
            });
        }
        for (i, &ok) in valid.iter().enumerate() {
            if ok {
                if values.row(i).iter().any(|v| !v.is_finite()) {
                    return Err(AlsError::non_finite(format!("coordinates of entity {i}")));
                }
            } else {
                values.row_mut(i).fill(0.0);
            }
        }
        Ok(Self { values, valid })
    }

    /// Every entity valid.
    pub fn from_matrix(values: DMatrix<f64>) -> Result<Self, AlsError> {
        let valid = vec![true; values.nrows()];
        Self::new(values, valid)
    }

    /// Placeholder array: every entity missing.
    pub fn missing(n_entities: usize, ndim: usize) -> Self {
        Self {
            values: DMatrix::zeros(n_entities, ndim),
            valid: vec![false; n_entities],
        }
    }

    pub fn n_entities(&self) -> usize {
        self.values.nrows()
    }

    pub fn ndim(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid[i]
    }

    pub fn validity(&self) -> &[bool] {
        &self.valid
    }

    /// Raw values; missing entities read as zero rows.
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn row(&self, i: usize) -> Option<RowDVector<f64>> {
        if self.valid[i] {
            Some(self.values.row(i).into_owned())
        } else {
            None
        }
    }

    /// Write (or clear, with `None`) one entity's coordinates.
    ///
    /// A row containing any non-finite entry is stored as missing.
    pub fn set(&mut self, i: usize, row: Option<&[f64]>) {
        match row {
            Some(r) if r.len() == self.ndim() && r.iter().all(|v| v.is_finite()) => {
                for (d, &v) in r.iter().enumerate() {
                    self.values[(i, d)] = v;
                }
                self.valid[i] = true;
            }
            _ => {
                self.values.row_mut(i).fill(0.0);
                self.valid[i] = false;
            }
        }
    }

    pub fn count_valid(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    pub fn valid_indices(&self) -> Vec<usize> {
        (0..self.n_entities()).filter(|&i| self.valid[i]).collect()
    }

    /// Sub-array of valid entities, in index order.
    pub fn valid_matrix(&self) -> DMatrix<f64> {
        let idx = self.valid_indices();
        DMatrix::from_fn(idx.len(), self.ndim(), |r, d| self.values[(idx[r], d)])
    }

    /// Overwrite the valid entities with rows of `sub` (in index order).
    /// Missing entities are left untouched.
    pub fn scatter_valid(&mut self, sub: &DMatrix<f64>) -> Result<(), AlsError> {
        let idx = self.valid_indices();
        if sub.nrows() != idx.len() || sub.ncols() != self.ndim() {
            return Err(AlsError::DimensionMismatch {
                context: "scatter of valid coordinates".to_string(),
                expected: idx.len() * self.ndim(),
                got: sub.nrows() * sub.ncols(),
            });
        }
        for (r, &i) in idx.iter().enumerate() {
            for d in 0..self.ndim() {
                let v = sub[(r, d)];
                if !v.is_finite() {
                    return Err(AlsError::non_finite("conditioned coordinates"));
                }
                self.values[(i, d)] = v;
            }
        }
        Ok(())
    }

    /// Right-multiply every valid entity by `m` (ndim × ndim).
    pub fn transform(&mut self, m: &DMatrix<f64>) -> Result<(), AlsError> {
        let sub = self.valid_matrix() * m;
        self.scatter_valid(&sub)
    }

    /// Euclidean distance from the origin for each valid entity.
    pub fn distances(&self) -> Vec<Option<f64>> {
        (0..self.n_entities())
            .map(|i| self.valid[i].then(|| self.values.row(i).norm()))
            .collect()
    }

    /// Export with `nanval` broadcast across missing entities.
    pub fn to_sentinel(&self, nanval: f64) -> DMatrix<f64> {
        let mut out = self.values.clone();
        for (i, &ok) in self.valid.iter().enumerate() {
            if !ok {
                out.row_mut(i).fill(nanval);
            }
        }
        out
    }

    /// Interpret rows equal to `nanval` (in any entry) as missing.
    pub fn from_sentinel(values: DMatrix<f64>, nanval: f64) -> Result<Self, AlsError> {
        let valid = (0..values.nrows())
            .map(|i| values.row(i).iter().all(|v| *v != nanval))
            .collect();
        Self::new(values, valid)
    }
}
