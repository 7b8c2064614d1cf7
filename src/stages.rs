use std::f64::consts::PI;

use serde::Serialize;

use crate::error::AlignError;
use crate::record::RecordSet;

/// Parameters one stage actually applied, kept for the audit trail and fed
/// back on redo so a stage repeats its earlier choices.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageConfig {
    Moveout { shifts: Vec<f64> },
    Window { start: f64, end: f64 },
    Taper { fraction: f64 },
    Raise { exponent: f64 },
}

impl StageConfig {
    pub fn describe(&self) -> String {
        match self {
            StageConfig::Moveout { shifts } => {
                let max = shifts.iter().fold(0.0f64, |m, s| m.max(s.abs()));
                format!("moveout (max shift {:.4} s)", max)
            }
            StageConfig::Window { start, end } => format!("window {}..{} s", start, end),
            StageConfig::Taper { fraction } => format!("taper {:.3}", fraction),
            StageConfig::Raise { exponent } => format!("raise {:.3}", exponent),
        }
    }
}

/// One preprocessing transform. Pure with respect to its input set, keeps
/// record count and order, and reports what it applied.
pub trait Stage {
    fn name(&self) -> &'static str;
    fn apply(
        &self,
        set: &RecordSet,
        prior: Option<&StageConfig>,
    ) -> Result<(RecordSet, StageConfig), AlignError>;
}

fn wrong_prior(stage: &str, prior: &StageConfig) -> AlignError {
    AlignError::InvalidConfig(format!(
        "stage {} cannot reuse configuration {:?}",
        stage, prior
    ))
}

/// Shifts each record's time axis by its prior correction so previously
/// aligned sets line up again before windowing.
pub struct MoveoutStage;

impl Stage for MoveoutStage {
    fn name(&self) -> &'static str {
        "moveout"
    }

    fn apply(
        &self,
        set: &RecordSet,
        prior: Option<&StageConfig>,
    ) -> Result<(RecordSet, StageConfig), AlignError> {
        let shifts: Vec<f64> = match prior {
            None => set.records.iter().map(|r| -r.prior_correction).collect(),
            Some(StageConfig::Moveout { shifts }) => {
                if shifts.len() != set.len() {
                    return Err(AlignError::InvalidConfig(format!(
                        "moveout configuration holds {} shifts for {} records",
                        shifts.len(),
                        set.len()
                    )));
                }
                shifts.clone()
            }
            Some(other) => return Err(wrong_prior(self.name(), other)),
        };
        let mut out = set.clone();
        for (rec, shift) in out.records.iter_mut().zip(&shifts) {
            rec.start += shift;
        }
        Ok((out, StageConfig::Moveout { shifts }))
    }
}

/// Cuts every record to one absolute time window. Records that do not cover
/// the window are padded with zeros so sample counts stay uniform.
pub struct WindowStage {
    pub start: f64,
    pub end: f64,
}

impl Stage for WindowStage {
    fn name(&self) -> &'static str {
        "window"
    }

    fn apply(
        &self,
        set: &RecordSet,
        prior: Option<&StageConfig>,
    ) -> Result<(RecordSet, StageConfig), AlignError> {
        let (start, end) = match prior {
            None => (self.start, self.end),
            Some(StageConfig::Window { start, end }) => (*start, *end),
            Some(other) => return Err(wrong_prior(self.name(), other)),
        };
        if !(start.is_finite() && end.is_finite() && start < end) {
            return Err(AlignError::InvalidConfig(format!(
                "window bounds {}..{} are not an increasing finite pair",
                start, end
            )));
        }
        let n = ((end - start) / set.dt).round() as usize + 1;
        let mut out = set.clone();
        for rec in &mut out.records {
            let offset = ((start - rec.start) / set.dt).round() as i64;
            let len = rec.data.len() as i64;
            if offset < 0 || offset + n as i64 > len {
                println!(
                    "[warn] record {}: window extends outside data, zero padding",
                    rec.name
                );
            }
            let mut cut = vec![0.0; n];
            for (k, slot) in cut.iter_mut().enumerate() {
                let idx = offset + k as i64;
                if (0..len).contains(&idx) {
                    *slot = rec.data[idx as usize];
                }
            }
            rec.start += offset as f64 * set.dt;
            rec.data = cut;
        }
        Ok((out, StageConfig::Window { start, end }))
    }
}

/// Hann-edge taper over a fraction of each end of every record.
pub struct TaperStage {
    pub fraction: f64,
}

impl Stage for TaperStage {
    fn name(&self) -> &'static str {
        "taper"
    }

    fn apply(
        &self,
        set: &RecordSet,
        prior: Option<&StageConfig>,
    ) -> Result<(RecordSet, StageConfig), AlignError> {
        let fraction = match prior {
            None => self.fraction,
            Some(StageConfig::Taper { fraction }) => *fraction,
            Some(other) => return Err(wrong_prior(self.name(), other)),
        };
        if !(fraction.is_finite() && (0.0..=0.5).contains(&fraction)) {
            return Err(AlignError::InvalidConfig(format!(
                "taper fraction {} outside 0..0.5",
                fraction
            )));
        }
        let mut out = set.clone();
        for rec in &mut out.records {
            let n = rec.data.len();
            let m = ((fraction * n as f64).floor() as usize).min(n / 2);
            for i in 0..m {
                let factor = 0.5 * (1.0 - (PI * i as f64 / m as f64).cos());
                rec.data[i] *= factor;
                rec.data[n - 1 - i] *= factor;
            }
        }
        Ok((out, StageConfig::Taper { fraction }))
    }
}

/// Sign-preserving amplitude power, sharpening or flattening peaks.
pub struct RaiseStage {
    pub exponent: f64,
}

impl Stage for RaiseStage {
    fn name(&self) -> &'static str {
        "raise"
    }

    fn apply(
        &self,
        set: &RecordSet,
        prior: Option<&StageConfig>,
    ) -> Result<(RecordSet, StageConfig), AlignError> {
        let exponent = match prior {
            None => self.exponent,
            Some(StageConfig::Raise { exponent }) => *exponent,
            Some(other) => return Err(wrong_prior(self.name(), other)),
        };
        if !(exponent.is_finite() && exponent > 0.0) {
            return Err(AlignError::InvalidConfig(format!(
                "raise exponent {} must be finite and positive",
                exponent
            )));
        }
        let mut out = set.clone();
        for rec in &mut out.records {
            for v in &mut rec.data {
                *v = v.signum() * v.abs().powf(exponent);
            }
        }
        Ok((out, StageConfig::Raise { exponent }))
    }
}

/// Run the stages in order, threading the transformed set through and
/// collecting each applied configuration. `prior` pins every stage to the
/// choices of an earlier cycle.
pub fn run_pipeline(
    set: &RecordSet,
    stages: &[Box<dyn Stage>],
    prior: Option<&[StageConfig]>,
) -> Result<(RecordSet, Vec<StageConfig>), AlignError> {
    if let Some(configs) = prior {
        if configs.len() != stages.len() {
            return Err(AlignError::InvalidConfig(format!(
                "{} stage configurations for {} stages",
                configs.len(),
                stages.len()
            )));
        }
    }
    let mut current = set.clone();
    let mut applied = Vec::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        let prior_config = prior.map(|configs| &configs[i]);
        let (next, config) = stage.apply(&current, prior_config)?;
        println!("[info] stage {}: {}", stage.name(), config.describe());
        current = next;
        applied.push(config);
    }
    Ok((current, applied))
}

#[cfg(test)]
mod tests {
    use super::{
        run_pipeline, MoveoutStage, RaiseStage, Stage, StageConfig, TaperStage, WindowStage,
    };
    use crate::record::{Record, RecordSet};

    fn set_of(records: Vec<(f64, f64, Vec<f64>)>) -> RecordSet {
        RecordSet {
            dt: 1.0,
            records: records
                .into_iter()
                .enumerate()
                .map(|(i, (start, correction, data))| Record {
                    name: format!("R{}", i),
                    start,
                    prior_correction: correction,
                    data,
                })
                .collect(),
        }
    }

    #[test]
    fn moveout_applies_negated_prior_corrections() {
        let set = set_of(vec![
            (10.0, 2.0, vec![0.0; 4]),
            (10.0, -1.0, vec![0.0; 4]),
        ]);
        let (out, config) = MoveoutStage.apply(&set, None).unwrap();
        assert_eq!(out.records[0].start, 8.0);
        assert_eq!(out.records[1].start, 11.0);
        assert_eq!(
            config,
            StageConfig::Moveout {
                shifts: vec![-2.0, 1.0]
            }
        );
    }

    #[test]
    fn moveout_reuses_recorded_shifts() {
        let set = set_of(vec![(0.0, 5.0, vec![0.0; 4])]);
        let prior = StageConfig::Moveout { shifts: vec![1.5] };
        let (out, config) = MoveoutStage.apply(&set, Some(&prior)).unwrap();
        assert_eq!(out.records[0].start, 1.5);
        assert_eq!(config, prior);
    }

    #[test]
    fn window_cuts_to_uniform_length() {
        let set = set_of(vec![
            (0.0, 0.0, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            (2.0, 0.0, vec![10.0, 11.0, 12.0, 13.0]),
        ]);
        let stage = WindowStage {
            start: 2.0,
            end: 4.0,
        };
        let (out, config) = stage.apply(&set, None).unwrap();
        assert_eq!(out.records[0].data, vec![2.0, 3.0, 4.0]);
        assert_eq!(out.records[0].start, 2.0);
        assert_eq!(out.records[1].data, vec![10.0, 11.0, 12.0]);
        assert_eq!(
            config,
            StageConfig::Window {
                start: 2.0,
                end: 4.0
            }
        );
    }

    #[test]
    fn window_pads_short_records_with_zeros() {
        let set = set_of(vec![(3.0, 0.0, vec![7.0, 8.0])]);
        let stage = WindowStage {
            start: 2.0,
            end: 5.0,
        };
        let (out, _) = stage.apply(&set, None).unwrap();
        assert_eq!(out.records[0].data, vec![0.0, 7.0, 8.0, 0.0]);
        assert_eq!(out.records[0].start, 2.0);
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        let set = set_of(vec![(0.0, 0.0, vec![0.0; 4])]);
        let stage = WindowStage {
            start: 4.0,
            end: 2.0,
        };
        assert!(stage.apply(&set, None).is_err());
    }

    #[test]
    fn taper_zeroes_edges_and_keeps_interior() {
        let set = set_of(vec![(0.0, 0.0, vec![1.0; 10])]);
        let stage = TaperStage { fraction: 0.2 };
        let (out, _) = stage.apply(&set, None).unwrap();
        let data = &out.records[0].data;
        assert_eq!(data[0], 0.0);
        assert_eq!(data[9], 0.0);
        assert!(data[1] > 0.0 && data[1] < 1.0);
        assert_eq!(data[4], 1.0);
        assert_eq!(data[5], 1.0);
    }

    #[test]
    fn taper_rejects_fraction_above_half() {
        let set = set_of(vec![(0.0, 0.0, vec![1.0; 10])]);
        let stage = TaperStage { fraction: 0.9 };
        assert!(stage.apply(&set, None).is_err());
    }

    #[test]
    fn raise_preserves_sign() {
        let set = set_of(vec![(0.0, 0.0, vec![-4.0, 0.0, 9.0])]);
        let stage = RaiseStage { exponent: 0.5 };
        let (out, _) = stage.apply(&set, None).unwrap();
        assert_eq!(out.records[0].data, vec![-2.0, 0.0, 3.0]);
    }

    #[test]
    fn pipeline_records_each_stage_and_replays_them() {
        let set = set_of(vec![
            (0.0, 1.0, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            (0.0, -1.0, vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]),
        ]);
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(MoveoutStage),
            Box::new(WindowStage {
                start: 0.0,
                end: 3.0,
            }),
            Box::new(RaiseStage { exponent: 2.0 }),
        ];
        let (first, configs) = run_pipeline(&set, &stages, None).unwrap();
        assert_eq!(configs.len(), 3);
        let (second, replayed) = run_pipeline(&set, &stages, Some(&configs)).unwrap();
        assert_eq!(configs, replayed);
        for (a, b) in first.records.iter().zip(&second.records) {
            assert_eq!(a.data, b.data);
            assert_eq!(a.start, b.start);
        }
    }

    #[test]
    fn pipeline_rejects_mismatched_replay_length() {
        let set = set_of(vec![(0.0, 0.0, vec![1.0, 2.0])]);
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(MoveoutStage)];
        let err = run_pipeline(&set, &stages, Some(&[])).unwrap_err();
        assert!(err.to_string().contains("stage configurations"));
    }
}
