use std::path::PathBuf;

use clap::Parser;

use crate::checks::CheckState;
use crate::error::AlignError;
use crate::stages::{MoveoutStage, RaiseStage, Stage, TaperStage, WindowStage};
use crate::xcorr::CorrelationConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Interactive cross-correlation alignment of record sets",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  ccalign shots.manifest\n  ccalign shots.manifest --window 4.0:12.0 --taper 0.2 peakCount 3\n  ccalign survey.xml --no-moveout --report survey_alignment.json minSpacing 0.5\n  ccalign shots.manifest --no-plot --skip-header-checks useAbsoluteCoefficient off\n"
)]
pub struct Args {
    /// Manifest describing the record set (key/value text, or XML by extension)
    pub manifest: PathBuf,

    /// Cut every record to one absolute window, START:END in seconds
    #[arg(long, allow_hyphen_values = true)]
    pub window: Option<String>,

    /// Fraction of each record tapered at either end
    #[arg(long, default_value_t = 0.1)]
    pub taper: f64,

    /// Exponent applied to sample amplitudes before correlation
    #[arg(long, default_value_t = 1.0)]
    pub raise: f64,

    /// Do not shift records by their prior corrections
    #[arg(long = "no-moveout")]
    pub no_moveout: bool,

    /// Only correlate records at most this many positions apart
    #[arg(long = "max-pair-gap", visible_alias = "gap")]
    pub max_pair_gap: Option<usize>,

    /// Number of parallel worker threads
    #[arg(long, default_value_t = 2)]
    pub cpu: usize,

    /// Directory the review plots are written to
    #[arg(long = "plot-dir", default_value = ".")]
    pub plot_dir: PathBuf,

    /// Skip review plots entirely
    #[arg(long = "no-plot")]
    pub no_plot: bool,

    /// Where the accepted session report is written
    #[arg(long, default_value = "ccalign_session.json")]
    pub report: PathBuf,

    /// Load records without structural validation
    #[arg(long = "skip-structural-checks")]
    pub skip_structural_checks: bool,

    /// Load records without header validation
    #[arg(long = "skip-header-checks")]
    pub skip_header_checks: bool,

    /// Print per-pair correlation detail
    #[arg(long)]
    pub debug: bool,

    /// Trailing option pairs, e.g. `peakCount 3 minSpacing 0.5`
    #[arg(trailing_var_arg = true)]
    pub options: Vec<String>,
}

/// Parse a `START:END` window argument, both ends in seconds.
pub fn parse_window(text: &str) -> Result<(f64, f64), AlignError> {
    let Some((start_text, end_text)) = text.split_once(':') else {
        return Err(AlignError::invalid_option(
            "window",
            format!("'{}' is not of the form START:END", text),
        ));
    };
    let start: f64 = start_text.trim().parse().map_err(|_| {
        AlignError::invalid_option("window", format!("'{}' is not a number", start_text.trim()))
    })?;
    let end: f64 = end_text.trim().parse().map_err(|_| {
        AlignError::invalid_option("window", format!("'{}' is not a number", end_text.trim()))
    })?;
    if !start.is_finite() || !end.is_finite() || end <= start {
        return Err(AlignError::invalid_option(
            "window",
            "window end must lie after its start",
        ));
    }
    Ok((start, end))
}

/// Assemble the preprocessing pipeline the session runs each cycle. Stage
/// parameters are checked here so a bad flag fails before any records load.
pub fn build_stages(args: &Args) -> Result<Vec<Box<dyn Stage>>, AlignError> {
    if !(0.0..=0.5).contains(&args.taper) {
        return Err(AlignError::invalid_option(
            "taper",
            "fraction must lie in [0, 0.5]",
        ));
    }
    if !args.raise.is_finite() || args.raise <= 0.0 {
        return Err(AlignError::invalid_option(
            "raise",
            "exponent must be positive",
        ));
    }
    if args.max_pair_gap == Some(0) {
        return Err(AlignError::invalid_option(
            "max-pair-gap",
            "must be at least 1",
        ));
    }
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();
    if !args.no_moveout {
        stages.push(Box::new(MoveoutStage));
    }
    if let Some(ref text) = args.window {
        let (start, end) = parse_window(text)?;
        stages.push(Box::new(WindowStage { start, end }));
    }
    stages.push(Box::new(TaperStage {
        fraction: args.taper,
    }));
    stages.push(Box::new(RaiseStage {
        exponent: args.raise,
    }));
    Ok(stages)
}

/// Correlation settings before any trailing option pairs are applied.
pub fn correlation_config(args: &Args) -> CorrelationConfig {
    CorrelationConfig {
        max_pair_gap: args.max_pair_gap,
        debug: args.debug,
        ..CorrelationConfig::default()
    }
}

/// Check toggles the process starts out with.
pub fn initial_checks(args: &Args) -> CheckState {
    CheckState {
        skip_structural: args.skip_structural_checks,
        skip_header: args.skip_header_checks,
    }
}
