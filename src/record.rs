use crate::checks::CheckState;
use crate::error::AlignError;

/// One time-series record: uniformly sampled data plus the header fields the
/// alignment session needs.
#[derive(Clone, Debug)]
pub struct Record {
    /// Station or channel identifier, unique within a set.
    pub name: String,
    /// Time of the first sample in seconds, on the shared session clock.
    pub start: f64,
    /// Correction already applied by earlier sessions, in seconds.
    pub prior_correction: f64,
    pub data: Vec<f64>,
}

impl Record {
    /// Time of the last sample.
    pub fn end(&self, dt: f64) -> f64 {
        self.start + (self.data.len().saturating_sub(1)) as f64 * dt
    }
}

/// A set of records sharing one sampling interval.
#[derive(Clone, Debug, Default)]
pub struct RecordSet {
    /// Sampling interval in seconds, common to every record.
    pub dt: f64,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Intersection of all record time spans, `None` when the records do not
    /// overlap at all.
    pub fn common_span(&self) -> Option<(f64, f64)> {
        let mut span: Option<(f64, f64)> = None;
        for rec in &self.records {
            let (lo, hi) = (rec.start, rec.end(self.dt));
            span = Some(match span {
                None => (lo, hi),
                Some((a, b)) => (a.max(lo), b.min(hi)),
            });
        }
        span.filter(|(a, b)| a <= b)
    }

    /// Validate the set against the toggles currently in force.
    ///
    /// Structural checks cover the sampling interval, sample counts and
    /// sample values; header checks cover names and the per-record time
    /// fields. Either group is skipped when its toggle says so.
    pub fn validate(&self, checks: &CheckState) -> Result<(), AlignError> {
        if !checks.skip_structural {
            self.check_structure()?;
        }
        if !checks.skip_header {
            self.check_headers()?;
        }
        Ok(())
    }

    fn check_structure(&self) -> Result<(), AlignError> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(AlignError::InvalidConfig(format!(
                "sampling interval must be finite and positive, got {}",
                self.dt
            )));
        }
        let mut count: Option<usize> = None;
        for rec in &self.records {
            if rec.data.is_empty() {
                return Err(AlignError::record(&rec.name, "record holds no samples"));
            }
            match count {
                None => count = Some(rec.data.len()),
                Some(n) if n != rec.data.len() => {
                    return Err(AlignError::record(
                        &rec.name,
                        format!("sample count {} differs from {} in the set", rec.data.len(), n),
                    ));
                }
                Some(_) => {}
            }
            if let Some(pos) = rec.data.iter().position(|v| !v.is_finite()) {
                return Err(AlignError::record(
                    &rec.name,
                    format!("non-finite sample at index {}", pos),
                ));
            }
        }
        Ok(())
    }

    fn check_headers(&self) -> Result<(), AlignError> {
        for (i, rec) in self.records.iter().enumerate() {
            if rec.name.trim().is_empty() {
                return Err(AlignError::record(
                    &format!("#{}", i),
                    "record name is empty",
                ));
            }
            for (field, value) in [
                ("start time", rec.start),
                ("prior correction", rec.prior_correction),
            ] {
                if !value.is_finite() {
                    return Err(AlignError::record(
                        &rec.name,
                        format!("{} is not finite", field),
                    ));
                }
            }
            if self.records[..i].iter().any(|r| r.name == rec.name) {
                return Err(AlignError::record(&rec.name, "duplicate record name"));
            }
        }
        Ok(())
    }
}
