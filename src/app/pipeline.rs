//! Shared run logic behind the `fit` and `dims` subcommands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! sample generation -> (anchors) -> ALS -> estimates/errors -> statistics
//!
//! The front-end can then focus on presentation.

use std::path::PathBuf;

use crate::data::{SampleData, SampleSpec, create_data};
use crate::domain::{AlsConfig, ErrorConfig, SelectionConfig};
use crate::error::AlsError;
use crate::fit::{Anchors, CancelToken, CoordResult, DimSelection, coord, select_dims};
use crate::io::{AnchorBank, read_anchor_bank};
use crate::report::{Report, ResidualOptions, analyze};

/// Everything one `alsm fit` run needs.
#[derive(Debug, Clone)]
pub struct FitRequest {
    pub sample: SampleSpec,
    pub als: AlsConfig,
    pub error: ErrorConfig,
    pub ecut: Option<f64>,
    /// Snap estimates to the data's ordinal categories.
    pub snap: bool,
    pub top_n: usize,
    pub anchors: Option<PathBuf>,
    pub export_bank: Option<PathBuf>,
    pub export: Option<PathBuf>,
}

/// All computed outputs of a single `alsm fit` run.
#[derive(Debug, Clone)]
pub struct FitOutput {
    pub sample: SampleData,
    pub result: CoordResult,
    pub report: Report,
    pub bank: AnchorBank,
}

/// Execute the full fit pipeline and return the computed outputs.
pub fn run_fit(request: &FitRequest, cancel: &CancelToken) -> Result<FitOutput, AlsError> {
    let sample = create_data(&request.sample)?;
    let data = &sample.data;
    log::info!(
        "generated {}x{} {} sample ({} observed)",
        data.nrows(),
        data.ncols(),
        data.kind().display_name(),
        data.cells().count_valid()
    );

    let anchors = match &request.anchors {
        Some(path) => {
            let ndim = request
                .als
                .ndim
                .candidates()
                .first()
                .copied()
                .ok_or_else(|| AlsError::config("no dimensionality given"))?;
            read_anchor_bank(path)?.anchors_for(data, ndim)?
        }
        None => Anchors::none(),
    };

    let result = coord(data, &request.als, &anchors, cancel)?;

    let residual_opts = ResidualOptions {
        ecut: request.ecut,
        snap: if request.snap { data.kind().categories() } else { None },
    };
    let report = analyze(data, &result, &request.error, &residual_opts, request.top_n)?;
    let bank = AnchorBank::from_result(data, &result);

    Ok(FitOutput {
        sample,
        result,
        report,
        bank,
    })
}

/// Generate the sample and sweep the configured candidates.
pub fn run_dims(
    sample: &SampleSpec,
    als: &AlsConfig,
    selection: &SelectionConfig,
    cancel: &CancelToken,
) -> Result<(SampleData, DimSelection), AlsError> {
    let data = create_data(sample)?;
    let sweep = select_dims(&data.data, als, selection, cancel)?;
    Ok((data, sweep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DimSpec, Facet, SeedSpec};
    use crate::io::write_anchor_bank;

    fn request() -> FitRequest {
        FitRequest {
            sample: SampleSpec {
                nrows: 40,
                ncols: 30,
                ndim: 2,
                noise: 0.2,
                missing: 0.05,
                seed: 8,
                ..SampleSpec::default()
            },
            als: AlsConfig::default(),
            error: ErrorConfig::default(),
            ecut: None,
            snap: false,
            top_n: 5,
            anchors: None,
            export_bank: None,
            export: None,
        }
    }

    #[test]
    fn fit_then_refit_against_own_bank() {
        let first = run_fit(&request(), &CancelToken::new()).unwrap();
        assert!(first.result.converged());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.json");
        write_anchor_bank(&path, &first.bank).unwrap();

        let second = run_fit(
            &FitRequest {
                anchors: Some(path),
                ..request()
            },
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(second.result.anchored, [true, true]);
        // Both facets frozen at their banked values.
        for facet in Facet::BOTH {
            let a = first.result.coords(facet).values();
            let b = second.result.coords(facet).values();
            assert!((a - b).abs().max() < 1e-9);
        }
    }

    #[test]
    fn dims_sweep_reports_every_candidate() {
        let als = AlsConfig {
            ndim: DimSpec::Search(vec![1, 2, 3]),
            seed: SeedSpec::Auto(vec![1, 2]),
            ..AlsConfig::default()
        };
        let (_, sweep) = run_dims(&request().sample, &als, &SelectionConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(sweep.stats.len() + sweep.skipped.len(), 6);
    }
}
