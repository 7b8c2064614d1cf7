use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checks::{CheckGuard, CheckSet, CheckState};
use crate::error::AlignError;
use crate::plot::Visualizer;
use crate::prompt::{menu, prompt_value, InputProvider};
use crate::record::RecordSet;
use crate::solver::{solve, Solution, SolverOptions};
use crate::stages::{run_pipeline, Stage, StageConfig};
use crate::xcorr::{correlate, CorrelationConfig, PairwiseMeasurementSet};

// ---------------------------------------------------------------------------
// option pairs

/// Options merged from the trailing key/value pairs on the command line.
/// Correlation keys are handled here; `solver*` keys are forwarded to the
/// solver's own parser so each component owns its value checks.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub correlation: CorrelationConfig,
    pub solver: SolverOptions,
}

impl SessionOptions {
    /// Fold a flat key/value sequence over the given starting configuration.
    /// Keys match case-insensitively with underscores ignored. Any malformed
    /// or unknown entry fails here, before a session ever starts.
    pub fn from_pairs(
        pairs: &[String],
        correlation: CorrelationConfig,
        solver: SolverOptions,
    ) -> Result<Self, AlignError> {
        if pairs.len() % 2 != 0 {
            let key = pairs.last().map(String::as_str).unwrap_or("");
            return Err(AlignError::invalid_option(key, "option key without a value"));
        }
        let mut options = SessionOptions {
            correlation,
            solver,
        };
        for pair in pairs.chunks_exact(2) {
            options.apply(&pair[0], &pair[1])?;
        }
        Ok(options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), AlignError> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "peakcount" => {
                let count: usize = value.parse().map_err(|_| {
                    AlignError::invalid_option(key, format!("'{}' is not an integer", value))
                })?;
                if count < 1 {
                    return Err(AlignError::invalid_option(key, "must be at least 1"));
                }
                self.correlation.peak_count = count;
            }
            "minspacing" => {
                let spacing: f64 = value.parse().map_err(|_| {
                    AlignError::invalid_option(key, format!("'{}' is not a number", value))
                })?;
                if !spacing.is_finite() || spacing < 0.0 {
                    return Err(AlignError::invalid_option(key, "must be non-negative"));
                }
                self.correlation.min_spacing = spacing;
            }
            "useabsolutecoefficient" => {
                self.correlation.use_absolute = parse_bool(value).ok_or_else(|| {
                    AlignError::invalid_option(key, format!("'{}' is not a boolean", value))
                })?;
            }
            _ => {
                if !self.solver.apply_pair(&normalized, value)? {
                    return Err(AlignError::invalid_option(key, "unknown option key"));
                }
            }
        }
        Ok(())
    }
}

/// Accepts the usual spellings of a switch value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// session state machine

/// Settings one alignment cycle actually ran with. Cycles that end in a redo
/// stay on the trail so an accepted report shows the whole path taken.
#[derive(Clone, Debug, Serialize)]
pub struct CycleAudit {
    pub cycle: usize,
    pub stages: Vec<StageConfig>,
    pub correlation: CorrelationConfig,
    pub solver: SolverOptions,
}

/// Everything an accepted session hands back to the caller.
#[derive(Debug)]
pub struct SessionOutcome {
    pub solution: Solution,
    pub measurements: PairwiseMeasurementSet,
    pub processed: RecordSet,
    pub audits: Vec<CycleAudit>,
    pub plot_files: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Configuring,
    Preprocessing,
    ConfiguringCorrelation,
    Correlating,
    Solving,
    Reviewing,
    Accepted,
    Aborted,
}

struct Session<'a> {
    input: &'a mut dyn InputProvider,
    visualizer: &'a dyn Visualizer,
    stages: Vec<Box<dyn Stage>>,
    options: SessionOptions,
    pristine: RecordSet,

    processed: RecordSet,
    // stage choices of the first cycle, replayed verbatim on every redo
    pinned: Option<Vec<StageConfig>>,
    stage_configs: Vec<StageConfig>,
    measurements: PairwiseMeasurementSet,
    solution: Option<Solution>,
    plot_files: Vec<PathBuf>,
    audits: Vec<CycleAudit>,
}

/// Run one interactive alignment session over `set`. Structural and header
/// checks are suspended for the whole session and restored on every exit
/// path, including errors raised mid-cycle.
pub fn run_session<'a>(
    checks: &mut CheckState,
    set: RecordSet,
    stages: Vec<Box<dyn Stage>>,
    options: SessionOptions,
    input: &'a mut dyn InputProvider,
    visualizer: &'a dyn Visualizer,
) -> Result<SessionOutcome, AlignError> {
    let guard = CheckGuard::acquire(checks, CheckSet::ALL);
    let mut session = Session {
        input,
        visualizer,
        stages,
        options,
        processed: set.clone(),
        pristine: set,
        pinned: None,
        stage_configs: Vec::new(),
        measurements: PairwiseMeasurementSet::default(),
        solution: None,
        plot_files: Vec::new(),
        audits: Vec::new(),
    };
    let result = session.drive(guard.active());
    guard.release();
    result
}

impl<'a> Session<'a> {
    fn drive(&mut self, checks: &CheckState) -> Result<SessionOutcome, AlignError> {
        let mut phase = Phase::Configuring;
        loop {
            phase = match phase {
                Phase::Configuring => self.configure()?,
                Phase::Preprocessing => self.preprocess(checks)?,
                Phase::ConfiguringCorrelation => self.configure_correlation()?,
                Phase::Correlating => self.correlate_pairs()?,
                Phase::Solving => self.solve_network()?,
                Phase::Reviewing => self.review()?,
                Phase::Accepted => return self.finish(),
                Phase::Aborted => return Err(AlignError::UserAborted),
            };
        }
    }

    /// One-time validation of the merged options before any stage runs.
    fn configure(&mut self) -> Result<Phase, AlignError> {
        let correlation = &self.options.correlation;
        if correlation.peak_count < 1 {
            return Err(AlignError::invalid_option("peakCount", "must be at least 1"));
        }
        if !correlation.min_spacing.is_finite() || correlation.min_spacing < 0.0 {
            return Err(AlignError::invalid_option("minSpacing", "must be non-negative"));
        }
        println!(
            "[info] session over {} records, dt {} s",
            self.pristine.len(),
            self.pristine.dt
        );
        Ok(Phase::Preprocessing)
    }

    fn preprocess(&mut self, checks: &CheckState) -> Result<Phase, AlignError> {
        println!("[info] preprocessing cycle {}", self.audits.len() + 1);
        let (processed, configs) =
            run_pipeline(&self.pristine, &self.stages, self.pinned.as_deref())?;
        processed.validate(checks)?;
        if self.pinned.is_none() {
            self.pinned = Some(configs.clone());
        }
        self.stage_configs = configs;
        self.processed = processed;
        Ok(Phase::ConfiguringCorrelation)
    }

    fn configure_correlation(&mut self) -> Result<Phase, AlignError> {
        loop {
            {
                let cfg = &self.options.correlation;
                println!();
                println!("correlation settings");
                println!("  peakCount              {}", cfg.peak_count);
                println!("  minSpacing             {} s", cfg.min_spacing);
                println!("  useAbsoluteCoefficient {}", cfg.use_absolute);
            }
            let choice = menu(
                self.input,
                "correlate with these settings?",
                &[
                    "continue with these settings",
                    "change a setting",
                    "abort the session",
                ],
            )?;
            match choice {
                0 => return Ok(Phase::Correlating),
                1 => self.edit_correlation()?,
                _ => return Ok(Phase::Aborted),
            }
        }
    }

    /// Prompt for each correlation knob in turn. Empty input keeps the
    /// current value; so does input that fails to parse.
    fn edit_correlation(&mut self) -> Result<(), AlignError> {
        let ask = format!("peakCount [{}]> ", self.options.correlation.peak_count);
        if let Some(text) = prompt_value(self.input, &ask)? {
            match text.parse::<usize>() {
                Ok(count) if count >= 1 => self.options.correlation.peak_count = count,
                _ => println!(
                    "[warn] '{}' is not a valid peak count, keeping {}",
                    text, self.options.correlation.peak_count
                ),
            }
        }
        let ask = format!("minSpacing [{}]> ", self.options.correlation.min_spacing);
        if let Some(text) = prompt_value(self.input, &ask)? {
            match text.parse::<f64>() {
                Ok(spacing) if spacing.is_finite() && spacing >= 0.0 => {
                    self.options.correlation.min_spacing = spacing
                }
                _ => println!(
                    "[warn] '{}' is not a valid spacing, keeping {}",
                    text, self.options.correlation.min_spacing
                ),
            }
        }
        let ask = format!(
            "useAbsoluteCoefficient [{}]> ",
            self.options.correlation.use_absolute
        );
        if let Some(text) = prompt_value(self.input, &ask)? {
            match parse_bool(&text) {
                Some(flag) => self.options.correlation.use_absolute = flag,
                None => println!(
                    "[warn] '{}' is not a boolean, keeping {}",
                    text, self.options.correlation.use_absolute
                ),
            }
        }
        Ok(())
    }

    fn correlate_pairs(&mut self) -> Result<Phase, AlignError> {
        self.measurements = correlate(&self.processed, &self.options.correlation)?;
        println!("[info] correlated {} record pairs", self.measurements.len());
        Ok(Phase::Solving)
    }

    fn solve_network(&mut self) -> Result<Phase, AlignError> {
        self.audits.push(CycleAudit {
            cycle: self.audits.len() + 1,
            stages: self.stage_configs.clone(),
            correlation: self.options.correlation,
            solver: self.options.solver,
        });
        match solve(self.processed.len(), &self.measurements, &self.options.solver) {
            Ok((solution, reordered)) => {
                self.measurements = reordered;
                self.solution = Some(solution);
            }
            // Not fatal: the user decides at review whether to retry with
            // different settings or give up.
            Err(AlignError::UnderdeterminedSystem(reason)) => {
                println!("[warn] solve failed: {}", reason);
                self.solution = None;
            }
            Err(other) => return Err(other),
        }
        Ok(Phase::Reviewing)
    }

    fn review(&mut self) -> Result<Phase, AlignError> {
        let choice = match &self.solution {
            Some(solution) => {
                print_solution(&self.processed, solution);
                self.plot_files = self.visualizer.render(&self.processed, solution)?;
                menu(
                    self.input,
                    "review the solution",
                    &[
                        "accept this solution",
                        "redo with different settings",
                        "abort the session",
                    ],
                )?
            }
            None => {
                1 + menu(
                    self.input,
                    "no solution to review",
                    &["redo with different settings", "abort the session"],
                )?
            }
        };
        match choice {
            0 => Ok(Phase::Accepted),
            1 => {
                self.visualizer.discard(&self.plot_files);
                self.plot_files.clear();
                self.measurements = PairwiseMeasurementSet::default();
                self.solution = None;
                println!("[info] cycle discarded, back to preprocessing");
                Ok(Phase::Preprocessing)
            }
            _ => Ok(Phase::Aborted),
        }
    }

    fn finish(&mut self) -> Result<SessionOutcome, AlignError> {
        let Some(solution) = self.solution.take() else {
            return Err(AlignError::InvalidConfig(
                "no solution available to accept".into(),
            ));
        };
        Ok(SessionOutcome {
            solution,
            measurements: std::mem::take(&mut self.measurements),
            processed: self.processed.clone(),
            audits: std::mem::take(&mut self.audits),
            plot_files: std::mem::take(&mut self.plot_files),
        })
    }
}

fn print_solution(set: &RecordSet, solution: &Solution) {
    println!();
    println!("  record                correction      error  polarity");
    for (i, record) in set.records.iter().enumerate() {
        println!(
            "  {:<18} {:>+11.4} s {:>8.4} s      {:>+2}",
            record.name, solution.corrections[i], solution.errors[i], solution.polarities[i]
        );
    }
    println!();
    println!(
        "  mean {:+.4} s, std {:.4} s, {} cluster(s), {} polarity conflict(s)",
        solution.mean, solution.std_dev, solution.cluster_count, solution.polarity_conflicts
    );
    println!();
}

// ---------------------------------------------------------------------------
// acceptance output

/// Final per-record table with totals folded in. The total is the prior
/// correction carried in from the manifest plus the newly solved one.
pub fn print_totals(outcome: &SessionOutcome) {
    println!();
    println!("  record                   prior      solved       total      error  polarity");
    for (i, record) in outcome.processed.records.iter().enumerate() {
        let solved = outcome.solution.corrections[i];
        println!(
            "  {:<18} {:>+9.4} s {:>+9.4} s {:>+9.4} s {:>8.4} s      {:>+2}",
            record.name,
            record.prior_correction,
            solved,
            record.prior_correction + solved,
            outcome.solution.errors[i],
            outcome.solution.polarities[i]
        );
    }
    println!();
}

#[derive(Serialize)]
struct RecordReport<'a> {
    name: &'a str,
    start: f64,
    prior_correction: f64,
    samples: usize,
    correction: f64,
    total_correction: f64,
    error: f64,
    polarity: i8,
}

#[derive(Serialize)]
struct PairReport<'a> {
    first: usize,
    second: usize,
    positive_only: bool,
    overlap: usize,
    candidates: &'a [crate::xcorr::PeakCandidate],
}

#[derive(Serialize)]
struct Report<'a> {
    dt: f64,
    records: Vec<RecordReport<'a>>,
    mean: f64,
    std_dev: f64,
    cluster_count: usize,
    polarity_conflicts: usize,
    cycles: &'a [CycleAudit],
    measurements: Vec<PairReport<'a>>,
}

/// Write the accepted session as a JSON report.
pub fn write_report(path: &Path, outcome: &SessionOutcome) -> Result<(), AlignError> {
    let solution = &outcome.solution;
    let records = outcome
        .processed
        .records
        .iter()
        .enumerate()
        .map(|(i, record)| RecordReport {
            name: &record.name,
            start: record.start,
            prior_correction: record.prior_correction,
            samples: record.data.len(),
            correction: solution.corrections[i],
            total_correction: record.prior_correction + solution.corrections[i],
            error: solution.errors[i],
            polarity: solution.polarities[i],
        })
        .collect();
    let measurements = outcome
        .measurements
        .pairs
        .iter()
        .map(|(&(first, second), pair)| PairReport {
            first,
            second,
            positive_only: pair.positive_only,
            overlap: pair.overlap,
            candidates: &pair.candidates,
        })
        .collect();
    let report = Report {
        dt: outcome.processed.dt,
        records,
        mean: solution.mean,
        std_dev: solution.std_dev,
        cluster_count: solution.cluster_count,
        polarity_conflicts: solution.polarity_conflicts,
        cycles: &outcome.audits,
        measurements,
    };
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &report)?;
    println!("[info] wrote report {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
