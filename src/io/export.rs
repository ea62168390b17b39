//! Export per-entity results to CSV.
//!
//! The export is meant to be easy to consume in spreadsheets or downstream scripts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::Facet;
use crate::error::AlsError;
use crate::fit::CoordResult;
use crate::report::Report;

/// Write one line per entity of both facets: coordinates plus summary statistics.
///
/// Missing coordinates and statistics are written as empty fields.
pub fn write_coords_csv(path: &Path, result: &CoordResult, report: &Report) -> Result<(), AlsError> {
    let io_err = |source: std::io::Error| AlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufWriter::new(File::create(path).map_err(io_err)?);

    let dims: Vec<String> = (1..=result.ndim).map(|d| format!("dim{d}")).collect();
    writeln!(
        file,
        "facet,id,{},n_obs,measure,se,rmsr,rmsear,mean_abs_fit",
        dims.join(",")
    )
    .map_err(io_err)?;

    for facet in Facet::BOTH {
        let coords = result.coords(facet);
        for (i, e) in report.facet(facet).entities.iter().enumerate() {
            let dims = match coords.row(i) {
                Some(r) => r.iter().map(|v| format!("{v:.10}")).collect::<Vec<_>>().join(","),
                None => vec![""; result.ndim].join(","),
            };
            writeln!(
                file,
                "{},{},{},{},{},{},{},{},{}",
                facet.display_name(),
                csv_field(&e.id),
                dims,
                e.n_obs,
                fmt_field(e.measure),
                fmt_field(e.se),
                fmt_field(e.rmsr),
                fmt_field(e.rmsear),
                fmt_field(e.mean_abs_fit),
            )
            .map_err(io_err)?;
        }
    }

    file.flush().map_err(io_err)?;
    Ok(())
}

fn fmt_field(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_default()
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleSpec, create_data};
    use crate::domain::{AlsConfig, DimSpec, ErrorConfig};
    use crate::fit::{Anchors, CancelToken, coord};
    use crate::report::{ResidualOptions, analyze};

    #[test]
    fn csv_has_one_line_per_entity() {
        let mut data = create_data(&SampleSpec {
            nrows: 12,
            ncols: 8,
            ndim: 2,
            noise: 0.1,
            seed: 3,
            ..SampleSpec::default()
        })
        .unwrap()
        .data;
        // Row 0 loses every observation and must export as empty fields.
        let mut cells = data.cells().clone();
        for j in 0..cells.ncols() {
            cells.set(0, j, None);
        }
        data = data.with_cells(cells).unwrap();

        let config = AlsConfig {
            ndim: DimSpec::Fixed(2),
            ..AlsConfig::default()
        };
        let result = coord(&data, &config, &Anchors::none(), &CancelToken::new()).unwrap();
        let report = analyze(&data, &result, &ErrorConfig::default(), &ResidualOptions::default(), 3).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coords.csv");
        write_coords_csv(&path, &result, &report).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 1 + 12 + 8);
        assert!(lines[0].starts_with("facet,id,dim1,dim2,n_obs"));
        assert!(lines[1].starts_with("rows,"));
        assert!(lines[1].contains(",,,0,"), "empty row line: {}", lines[1]);
        assert!(lines[13].starts_with("cols,"));
        let fields = lines[0].split(',').count();
        assert!(lines.iter().all(|l| l.split(',').count() == fields));
    }

    #[test]
    fn quotes_awkward_ids() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("plain"), "plain");
    }
}
