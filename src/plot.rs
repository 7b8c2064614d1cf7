use std::path::{Path, PathBuf};

use plotters::prelude::PathElement;
use plotters::prelude::*;

use crate::error::AlignError;
use crate::record::RecordSet;
use crate::solver::Solution;

const PLOT_FONT_SCALE: f64 = 1.2;

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn plot_err<E: std::fmt::Display>(e: E) -> AlignError {
    AlignError::Plot(e.to_string())
}

/// Review-time visualization collaborator. `render` writes the charts for
/// one cycle and reports the files it created; `discard` removes them when
/// the cycle is redone.
pub trait Visualizer {
    fn render(&self, set: &RecordSet, solution: &Solution) -> Result<Vec<PathBuf>, AlignError>;

    fn discard(&self, files: &[PathBuf]) {
        for file in files {
            match std::fs::remove_file(file) {
                Ok(()) => println!("[plot] removed {}", file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => println!("[warn] could not remove {}: {}", file.display(), e),
            }
        }
    }
}

/// Draws nothing; stands in when plotting is switched off.
pub struct NullVisualizer;

impl Visualizer for NullVisualizer {
    fn render(&self, _set: &RecordSet, _solution: &Solution) -> Result<Vec<PathBuf>, AlignError> {
        Ok(Vec::new())
    }
}

/// Writes `aligned_records.png` and `corrections.png` into one directory.
pub struct PlotVisualizer {
    pub dir: PathBuf,
}

impl PlotVisualizer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        PlotVisualizer {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl Visualizer for PlotVisualizer {
    fn render(&self, set: &RecordSet, solution: &Solution) -> Result<Vec<PathBuf>, AlignError> {
        std::fs::create_dir_all(&self.dir)?;
        let aligned = self.dir.join("aligned_records.png");
        let corrections = self.dir.join("corrections.png");
        plot_aligned_records(&aligned, set, solution)?;
        plot_corrections(&corrections, set, solution)?;
        Ok(vec![aligned, corrections])
    }
}

/// Overlay of every record on the corrected time axis, normalized per
/// record and flipped by its resolved polarity.
fn plot_aligned_records(
    filename: &Path,
    set: &RecordSet,
    solution: &Solution,
) -> Result<(), AlignError> {
    if set.is_empty() {
        return Err(AlignError::Plot("no records to plot".into()));
    }

    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    for (i, rec) in set.records.iter().enumerate() {
        let shift = solution.corrections[i];
        x_min = x_min.min(rec.start - shift);
        x_max = x_max.max(rec.end(set.dt) - shift);
    }
    if !(x_min < x_max) {
        x_min -= 1.0;
        x_max += 1.0;
    }

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(x_min..x_max, -1.1..1.1)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("Corrected time (s)")
        .y_desc("Normalized amplitude")
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()
        .map_err(plot_err)?;

    for (i, rec) in set.records.iter().enumerate() {
        let shift = solution.corrections[i];
        let flip = solution.polarities[i] as f64;
        let peak = rec.data.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let scale = if peak > 0.0 { flip / peak } else { flip };
        let color = Palette99::pick(i).to_rgba();
        let label = format!("{} ({:+.4} s)", rec.name, shift);
        chart
            .draw_series(LineSeries::new(
                rec.data.iter().enumerate().map(|(k, &v)| {
                    (rec.start + k as f64 * set.dt - shift, v * scale)
                }),
                &color,
            ))
            .map_err(plot_err)?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], color));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(20)).into_font())
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    println!("[plot] wrote {}", filename.display());
    Ok(())
}

/// Per-record corrections with their error estimates as vertical bars.
fn plot_corrections(
    filename: &Path,
    set: &RecordSet,
    solution: &Solution,
) -> Result<(), AlignError> {
    if set.is_empty() {
        return Err(AlignError::Plot("no records to plot".into()));
    }

    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for i in 0..set.len() {
        y_min = y_min.min(solution.corrections[i] - solution.errors[i]);
        y_max = y_max.max(solution.corrections[i] + solution.errors[i]);
    }
    let pad = (0.1 * (y_max - y_min)).max(0.05);
    let (y_min, y_max) = (y_min - pad, y_max + pad);

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let names: Vec<String> = set.records.iter().map(|r| r.name.clone()).collect();
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(-1i32..set.len() as i32, y_min..y_max)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("Record")
        .y_desc("Correction (s)")
        .x_label_formatter(&|x| {
            names
                .get(*x as usize)
                .cloned()
                .unwrap_or_default()
        })
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series((0..set.len()).map(|i| {
            ErrorBar::new_vertical(
                i as i32,
                solution.corrections[i] - solution.errors[i],
                solution.corrections[i],
                solution.corrections[i] + solution.errors[i],
                BLUE.filled(),
                12,
            )
        }))
        .map_err(plot_err)?;

    chart
        .draw_series((0..set.len()).map(|i| {
            let marker = if solution.polarities[i] < 0 { RED } else { BLUE };
            Circle::new((i as i32, solution.corrections[i]), 4, marker.filled())
        }))
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    println!("[plot] wrote {}", filename.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NullVisualizer, PlotVisualizer, Visualizer};
    use crate::record::{Record, RecordSet};
    use crate::solver::Solution;

    fn sample_inputs() -> (RecordSet, Solution) {
        let set = RecordSet {
            dt: 0.5,
            records: vec![
                Record {
                    name: "STA1".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: (0..50).map(|i| ((i as f64) * 0.3).sin()).collect(),
                },
                Record {
                    name: "STA2".into(),
                    start: 1.0,
                    prior_correction: 0.0,
                    data: (0..50).map(|i| ((i as f64) * 0.3).cos()).collect(),
                },
            ],
        };
        let solution = Solution {
            corrections: vec![-0.5, 0.5],
            errors: vec![0.1, 0.2],
            polarities: vec![1, -1],
            mean: 0.0,
            std_dev: 0.5,
            cluster_count: 1,
            polarity_conflicts: 0,
            sweeps: 1,
        };
        (set, solution)
    }

    #[test]
    fn renders_and_discards_both_charts() {
        let dir = tempfile::tempdir().unwrap();
        let visualizer = PlotVisualizer::new(dir.path());
        let (set, solution) = sample_inputs();

        let files = visualizer.render(&set, &solution).unwrap();
        assert_eq!(files.len(), 2);
        for file in &files {
            assert!(file.exists(), "{} missing", file.display());
        }

        visualizer.discard(&files);
        for file in &files {
            assert!(!file.exists(), "{} still present", file.display());
        }
        // Discarding again is quiet.
        visualizer.discard(&files);
    }

    #[test]
    fn null_visualizer_reports_no_files() {
        let (set, solution) = sample_inputs();
        let files = NullVisualizer.render(&set, &solution).unwrap();
        assert!(files.is_empty());
    }
}
