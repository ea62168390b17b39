//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and initializes logging
//! - maps flags onto the engine configuration
//! - runs the fit or the dimensionality sweep
//! - prints reports and writes optional exports

use std::time::Duration;

use clap::Parser;

use crate::cli::{AlsArgs, Command, DimsArgs, FitArgs, SampleArgs, SplitKind};
use crate::data::SampleSpec;
use crate::domain::{AlsConfig, DimSpec, ErrorConfig, JoltSpec, SeedSpec, SelectionConfig, SplitMethod};
use crate::error::AlsError;
use crate::fit::CancelToken;

pub mod pipeline;

/// Entry point for the `alsm` binary.
pub fn run() -> Result<(), AlsError> {
    let cli = crate::cli::Cli::parse();
    init_logging(cli.verbose);

    let cancel = cancel_token(cli.time_limit)?;
    match cli.command {
        Command::Fit(args) => handle_fit(args, &cancel),
        Command::Dims(args) => handle_dims(args, &cancel),
    }
}

/// Token for one invocation; `--time-limit` arms a deadline on it.
pub fn cancel_token(time_limit: Option<f64>) -> Result<CancelToken, AlsError> {
    let cancel = CancelToken::new();
    if let Some(secs) = time_limit {
        let limit = Duration::try_from_secs_f64(secs).map_err(|_| {
            AlsError::config(format!("--time-limit must be a non-negative number of seconds, got {secs}"))
        })?;
        cancel.cancel_after(limit);
    }
    Ok(cancel)
}

/// `RUST_LOG` wins; otherwise `-v` picks the level.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    // A second init (tests, embedding) is harmless.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).try_init();
}

fn handle_fit(args: FitArgs, cancel: &CancelToken) -> Result<(), AlsError> {
    let request = fit_request_from_args(&args);
    let run = pipeline::run_fit(&request, cancel)?;

    println!(
        "{}",
        crate::report::format_run_summary(&run.sample.data, &run.result, &request.als)
    );
    println!("{}", crate::report::format_report(&run.report));

    if let Some(path) = &request.export_bank {
        crate::io::write_anchor_bank(path, &run.bank)?;
        log::info!("anchor bank written to {}", path.display());
    }
    if let Some(path) = &request.export {
        crate::io::write_coords_csv(path, &run.result, &run.report)?;
        log::info!("coordinates written to {}", path.display());
    }

    Ok(())
}

fn handle_dims(args: DimsArgs, cancel: &CancelToken) -> Result<(), AlsError> {
    let sample = sample_spec_from_args(&args.sample);
    let als = AlsConfig {
        ndim: DimSpec::Search(args.search.clone()),
        seed: SeedSpec::Auto(args.seeds.clone()),
        ..als_config_from_args(&args.als)
    };
    let selection = SelectionConfig {
        pseudo_missing_fraction: args.pseudo_missing,
        pseudo_missing_seed: args.pseudo_missing_seed,
        split: match args.split {
            SplitKind::Alternate => SplitMethod::Alternate,
            SplitKind::Random => SplitMethod::Random(args.split_seed),
        },
        skip_stability: args.skip_stability,
    };

    let (_, sweep) = pipeline::run_dims(&sample, &als, &selection, cancel)?;
    println!("{}", crate::report::format_selection(&sweep));
    println!(
        "Best: ndim={} seed={} (objectivity {:.4})",
        sweep.best.candidate.ndim, sweep.best.candidate.seed, sweep.best.objectivity
    );
    Ok(())
}

pub fn sample_spec_from_args(args: &SampleArgs) -> SampleSpec {
    SampleSpec {
        nrows: args.rows,
        ncols: args.cols,
        ndim: args.true_ndim,
        noise: args.noise,
        missing: args.missing,
        kind: args.kind,
        categories: args.categories,
        seed: args.data_seed,
    }
}

pub fn als_config_from_args(args: &AlsArgs) -> AlsConfig {
    AlsConfig {
        max_iterations: args.max_iter,
        stop_when_change: args.stop_when,
        solve_method: args.solve,
        miss_method: args.miss,
        condition: [args.condition_rows.into(), args.condition_cols.into()],
        jolt: args.jolt_sigma.map(|sigma| JoltSpec {
            sigma,
            magnitude: args.jolt_magnitude,
            condition_noise: args.jolt_condition,
        }),
        weight_by_influence: !args.no_influence_weights,
        weight_by_observation_count: args.count_weights,
        ..AlsConfig::default()
    }
}

pub fn fit_request_from_args(args: &FitArgs) -> pipeline::FitRequest {
    pipeline::FitRequest {
        sample: sample_spec_from_args(&args.sample),
        als: AlsConfig {
            ndim: DimSpec::Fixed(args.ndim),
            seed: SeedSpec::Fixed(args.seed),
            refresh_anchors: args.refresh_anchors,
            ..als_config_from_args(&args.als)
        },
        error: ErrorConfig {
            obs_rule: args.obs_rule,
            ear_method: args.ear,
            unbias: !args.no_unbias,
            ear_floor: args.ear_floor,
            ..ErrorConfig::default()
        },
        ecut: args.ecut,
        snap: args.snap,
        top_n: args.top,
        anchors: args.anchors.clone(),
        export_bank: args.export_bank.clone(),
        export: args.export.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::domain::{Conditioning, MissMethod};

    #[test]
    fn fit_flags_map_onto_config() {
        let cli = Cli::parse_from([
            "alsm", "fit", "--ndim", "4", "--seed", "9", "--condition-rows", "std", "--jolt-sigma", "3.5",
            "--no-influence-weights", "--miss", "impute-cells", "--no-unbias", "--refresh-anchors",
        ]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        let req = fit_request_from_args(&args);
        assert_eq!(req.als.ndim, DimSpec::Fixed(4));
        assert_eq!(req.als.seed, SeedSpec::Fixed(9));
        assert!(matches!(req.als.condition[0], Conditioning::Std));
        assert!(matches!(req.als.condition[1], Conditioning::None));
        assert_eq!(req.als.jolt.map(|j| j.sigma), Some(3.5));
        assert!(!req.als.weight_by_influence);
        assert_eq!(req.als.miss_method, MissMethod::ImputeCells);
        assert!(req.als.refresh_anchors);
        assert!(!req.error.unbias);
        req.als.validate().unwrap();
    }

    #[test]
    fn expired_time_limit_cancels_the_fit() {
        let cli = Cli::parse_from(["alsm", "--time-limit", "0", "fit", "--rows", "20", "--cols", "15"]);
        let cancel = cancel_token(cli.time_limit).unwrap();
        for _ in 0..400 {
            if cancel.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        let err = pipeline::run_fit(&fit_request_from_args(&args), &cancel).unwrap_err();
        assert!(matches!(err, AlsError::Cancelled));
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn negative_time_limit_is_rejected() {
        let err = cancel_token(Some(-1.0)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(cancel_token(None).unwrap().check().is_ok());
    }
}
