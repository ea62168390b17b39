//! Formatted terminal output.
//!
//! Formatting stays in one place so the engine code stays clean and output
//! changes are localized.

use crate::domain::{AlsConfig, DataMatrix, Facet};
use crate::fit::{CoordResult, DimSelection};
use crate::report::{CellMisfit, FacetStats, Report};

/// Dataset, configuration and convergence of one run.
pub fn format_run_summary(data: &DataMatrix, result: &CoordResult, config: &AlsConfig) -> String {
    let mut out = String::new();

    out.push_str("=== alsm - ALS decomposition ===\n");
    out.push_str(&format!(
        "Data: {} x {} | {} observed ({:.1}%) | kind={}\n",
        data.nrows(),
        data.ncols(),
        data.cells().count_valid(),
        100.0 * data.cells().count_valid() as f64 / (data.nrows() * data.ncols()).max(1) as f64,
        data.kind().display_name(),
    ));
    out.push_str(&format!(
        "Config: ndim={} seed={} solve={:?} miss={:?} condition=[{}, {}]\n",
        result.ndim,
        result.seed,
        config.solve_method.resolve(data.kind()),
        config.miss_method,
        config.conditioning(Facet::Rows).display_name(),
        config.conditioning(Facet::Cols).display_name(),
    ));
    if result.anchored.iter().any(|a| *a) {
        out.push_str(&format!(
            "Anchored: rows={} cols={}\n",
            result.anchored[0], result.anchored[1]
        ));
    }

    out.push_str("\nConvergence:\n");
    out.push_str(&format!(
        "- status: {:?} after {} iterations ({} half-steps)\n",
        result.status,
        result.iterations,
        result.log.half_steps()
    ));
    for facet in Facet::BOTH {
        out.push_str(&format!(
            "- last change {:<4}: {}\n",
            facet.display_name(),
            fmt_opt(result.log.last_change(facet), 6)
        ));
    }
    out.push_str(&format!("- speed: {}\n", fmt_opt(result.log.speed(), 3)));
    if result.jolts > 0 {
        out.push_str(&format!("- jolts: {}\n", result.jolts));
    }
    for facet in Facet::BOTH {
        let w = result.warnings[facet.index()];
        if w.solve_failed {
            out.push_str(&format!("  ({facet}: {} entities failed to solve)\n", w.n_failed));
        }
        if w.had_dead {
            out.push_str(&format!("  ({facet}: dead entities skipped)\n"));
        }
    }
    out.push('\n');

    out
}

/// Objectivity table of a dimensionality sweep.
pub fn format_selection(selection: &DimSelection) -> String {
    let mut out = String::new();

    out.push_str("Dimensionality diagnostics:\n");
    out.push_str(&format!(
        "  {:>4} {:>6} {:>10} {:>10} {:>12}\n",
        "ndim", "seed", "accuracy", "stability", "objectivity"
    ));
    for s in &selection.stats {
        let chosen = if s.candidate == selection.best.candidate { "*" } else { " " };
        out.push_str(&format!(
            "{chosen} {:>4} {:>6} {:>10} {:>10} {:>12.4}\n",
            s.candidate.ndim,
            s.candidate.seed,
            fmt_opt(s.accuracy.as_ref().map(|a| a.accuracy), 4),
            fmt_opt(s.stability.as_ref().map(|st| st.stability), 4),
            s.objectivity,
        ));
    }
    for (c, reason) in &selection.skipped {
        out.push_str(&format!("  (skipped ndim={} seed={}) {reason}\n", c.ndim, c.seed));
    }
    out.push('\n');

    out
}

/// Overall fit, facet reliabilities and the worst-fitting cells.
pub fn format_report(report: &Report) -> String {
    let mut out = String::new();

    out.push_str("Fit:\n");
    out.push_str(&format!(
        "- RMSR={} RMSEAR={} | EAR method={:?} | |fit|>2: {}\n",
        fmt_opt(report.rmsr, 4),
        fmt_opt(report.rmsear, 4),
        report.error.method,
        fmt_opt(report.misfit_share.map(|s| 100.0 * s), 1) + "%",
    ));

    out.push_str("\nFacets:\n");
    out.push_str(&format!(
        "  {:<5} {:>6} {:>10} {:>10} {:>11} {:>12}\n",
        "facet", "n", "stdev", "sterr", "separation", "reliability"
    ));
    for f in &report.facets {
        out.push_str(&format_facet_line(f));
    }

    out.push_str("\nTop misfitting cells:\n");
    out.push_str(&format_misfits(&report.misfits));

    out
}

fn format_facet_line(f: &FacetStats) -> String {
    format!(
        "  {:<5} {:>6} {:>10} {:>10} {:>11} {:>12}\n",
        f.facet.display_name(),
        f.entities.len(),
        fmt_opt(f.stdev, 4),
        fmt_opt(f.sterr, 4),
        fmt_opt(f.separation, 3),
        fmt_opt(f.reliability, 3),
    )
}

fn format_misfits(cells: &[CellMisfit]) -> String {
    let mut out = String::new();
    out.push_str(format!("{:<16} {:<16} {:>10} {:>10} {:>8}\n", "row", "col", "observed", "estimate", "fit").trim_end());
    out.push('\n');
    out.push_str(format!("{:-<16} {:-<16} {:-<10} {:-<10} {:-<8}\n", "", "", "", "", "").trim_end());
    out.push('\n');
    for c in cells {
        out.push_str(
            format!(
                "{:<16} {:<16} {:>10.3} {:>10.3} {:>8.2}\n",
                truncate(&c.row_id, 16),
                truncate(&c.col_id, 16),
                c.observed,
                c.estimate,
                c.fit,
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(x) if x.is_infinite() => "inf".to_string(),
        Some(x) => format!("{x:.decimals$}"),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}
