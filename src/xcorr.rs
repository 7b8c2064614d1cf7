use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use num_complex::Complex;
use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::Serialize;

use crate::error::AlignError;
use crate::record::{Record, RecordSet};

/// Knobs for the pairwise correlation pass.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CorrelationConfig {
    /// Number of peak candidates to keep per pair, best first.
    pub peak_count: usize,
    /// Minimum separation between reported peaks, in seconds.
    pub min_spacing: f64,
    /// Score peaks on the absolute coefficient so inverted arrivals rank.
    pub use_absolute: bool,
    /// Only correlate pairs whose record indices are at most this far apart.
    pub max_pair_gap: Option<usize>,
    /// Print per-pair peak detail.
    #[serde(skip)]
    pub debug: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            peak_count: 5,
            min_spacing: 10.0,
            use_absolute: true,
            max_pair_gap: None,
            debug: false,
        }
    }
}

/// One correlation peak: a relative delay in seconds and the signed
/// normalized coefficient there.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PeakCandidate {
    pub lag: f64,
    pub coeff: f64,
}

impl PeakCandidate {
    /// Polarity hint: the sign of the coefficient at the peak.
    pub fn sign(&self) -> i8 {
        if self.coeff < 0.0 {
            -1
        } else {
            1
        }
    }
}

/// Peak candidates for one record pair, strongest first.
#[derive(Clone, Debug, Default)]
pub struct PairMeasurement {
    pub candidates: Vec<PeakCandidate>,
    /// Whether inverted peaks were excluded from the search.
    pub positive_only: bool,
    /// Sample count of the shorter record, bounding the overlap at any lag.
    pub overlap: usize,
}

impl PairMeasurement {
    pub fn best(&self) -> Option<&PeakCandidate> {
        self.candidates.first()
    }
}

/// All pairwise measurements of one correlation pass, keyed by record index
/// pair with the smaller index first. The map keeps pairs in a stable order
/// so downstream passes are deterministic.
#[derive(Clone, Debug, Default)]
pub struct PairwiseMeasurementSet {
    pub pairs: BTreeMap<(usize, usize), PairMeasurement>,
}

impl PairwiseMeasurementSet {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

// --- FFT plumbing ---

struct FftPair {
    len: usize,
    forward: Arc<dyn RealToComplex<f64>>,
    inverse: Arc<dyn ComplexToReal<f64>>,
}

impl FftPair {
    fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        FftPair {
            len,
            forward,
            inverse,
        }
    }

    fn forward(&self, input: &mut [f64], output: &mut [Complex<f64>]) -> Result<(), AlignError> {
        if input.len() != self.len || output.len() != self.len / 2 + 1 {
            return Err(AlignError::InvalidConfig(
                "fft buffer length does not match the planned length".into(),
            ));
        }
        self.forward
            .process(input, output)
            .map_err(|e| AlignError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    fn inverse(&self, spectrum: &mut [Complex<f64>], output: &mut [f64]) -> Result<(), AlignError> {
        if spectrum.len() != self.len / 2 + 1 || output.len() != self.len {
            return Err(AlignError::InvalidConfig(
                "fft buffer length does not match the planned length".into(),
            ));
        }
        self.inverse
            .process(spectrum, output)
            .map_err(|e| AlignError::InvalidConfig(e.to_string()))?;
        let scale = 1.0 / self.len as f64;
        for value in output.iter_mut() {
            *value *= scale;
        }
        Ok(())
    }
}

// --- peak extraction ---

#[derive(Clone, Copy)]
struct RawPeak {
    lag: f64,
    coeff: f64,
    score: f64,
}

fn score_of(coeff: f64, use_absolute: bool) -> f64 {
    if use_absolute {
        coeff.abs()
    } else {
        coeff
    }
}

/// Local maxima of the score series with parabolic sub-sample refinement,
/// returned unsorted. `lag_base` is the lag in seconds at index 0 and
/// `dt` the lag step.
fn local_maxima(coeffs: &[f64], lag_base: f64, dt: f64, use_absolute: bool) -> Vec<RawPeak> {
    let scores: Vec<f64> = coeffs.iter().map(|&c| score_of(c, use_absolute)).collect();
    let n = scores.len();
    let mut peaks = Vec::new();
    for m in 0..n {
        let here = scores[m];
        if m > 0 && scores[m - 1] > here {
            continue;
        }
        if m + 1 < n && scores[m + 1] > here {
            continue;
        }
        // Interior peaks get a parabolic fit through the three samples.
        let (delta, refined_score) = if m > 0 && m + 1 < n {
            let (lo, mid, hi) = (scores[m - 1], here, scores[m + 1]);
            let denom = lo - 2.0 * mid + hi;
            if denom.abs() > 0.0 {
                let d = (0.5 * (lo - hi) / denom).clamp(-0.5, 0.5);
                (d, mid - 0.25 * (lo - hi) * d)
            } else {
                (0.0, mid)
            }
        } else {
            (0.0, here)
        };
        let sign = if use_absolute && coeffs[m] < 0.0 {
            -1.0
        } else {
            1.0
        };
        peaks.push(RawPeak {
            lag: lag_base + (m as f64 + delta) * dt,
            coeff: sign * refined_score,
            score: refined_score,
        });
    }
    peaks
}

/// Sort strongest first, deterministic under score ties: prefer the smaller
/// absolute lag, then the smaller signed lag.
fn rank_peaks(peaks: &mut [RawPeak]) {
    peaks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.lag
                    .abs()
                    .partial_cmp(&b.lag.abs())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.lag.partial_cmp(&b.lag).unwrap_or(Ordering::Equal))
    });
}

fn pick_spaced(peaks: &[RawPeak], peak_count: usize, min_spacing: f64) -> Vec<PeakCandidate> {
    let mut picked: Vec<PeakCandidate> = Vec::with_capacity(peak_count);
    for peak in peaks {
        if picked.len() == peak_count {
            break;
        }
        if picked
            .iter()
            .all(|p| (p.lag - peak.lag).abs() >= min_spacing)
        {
            picked.push(PeakCandidate {
                lag: peak.lag,
                coeff: peak.coeff,
            });
        }
    }
    picked
}

// --- pairwise correlation ---

/// Full normalized cross-correlation of one pair. The returned lags are
/// observations of `t_j - t_i`, start-time offsets included. `None` when
/// either record has zero energy or no peak stands out.
fn correlate_pair(
    a: &Record,
    b: &Record,
    dt: f64,
    config: &CorrelationConfig,
    fft: &FftPair,
) -> Result<Option<PairMeasurement>, AlignError> {
    let (la, lb) = (a.data.len(), b.data.len());
    let energy_a: f64 = a.data.iter().map(|v| v * v).sum();
    let energy_b: f64 = b.data.iter().map(|v| v * v).sum();
    if energy_a <= 0.0 || energy_b <= 0.0 {
        return Ok(None);
    }
    let norm = (energy_a * energy_b).sqrt();

    let fft_len = fft.len;
    let half = fft_len / 2 + 1;
    let mut buf_a = vec![0.0; fft_len];
    let mut buf_b = vec![0.0; fft_len];
    buf_a[..la].copy_from_slice(&a.data);
    buf_b[..lb].copy_from_slice(&b.data);

    let mut spec_a = vec![Complex::new(0.0, 0.0); half];
    let mut spec_b = vec![Complex::new(0.0, 0.0); half];
    fft.forward(&mut buf_a, &mut spec_a)?;
    fft.forward(&mut buf_b, &mut spec_b)?;

    let mut cross: Vec<Complex<f64>> = spec_a
        .iter()
        .zip(spec_b.iter())
        .map(|(x, y)| x * y.conj())
        .collect();
    // DC and Nyquist bins must stay purely real for the C2R inverse.
    cross[0].im = 0.0;
    if fft_len % 2 == 0 {
        cross[half - 1].im = 0.0;
    }

    let mut corr = vec![0.0; fft_len];
    fft.inverse(&mut cross, &mut corr)?;

    // corr[m] holds sum_t a[t + m] * b[t] for m in -(lb-1)..=(la-1), with
    // negative m wrapped around the end. A peak at shift m is a lag of
    // (start_b - start_a) - m * dt seconds.
    let span = la + lb - 1;
    let mut coeffs = vec![0.0; span];
    for (k, slot) in coeffs.iter_mut().enumerate() {
        let m = k as i64 - (lb as i64 - 1);
        let idx = m.rem_euclid(fft_len as i64) as usize;
        *slot = corr[idx] / norm;
    }
    // Flip so the axis ascends in lag seconds: index k then sits at
    // lag_base + k * dt.
    let lag_base = (b.start - a.start) - (la as f64 - 1.0) * dt;
    coeffs.reverse();
    let mut peaks = local_maxima(&coeffs, lag_base, dt, config.use_absolute);
    if peaks.is_empty() {
        return Ok(None);
    }
    rank_peaks(&mut peaks);
    let candidates = pick_spaced(&peaks, config.peak_count, config.min_spacing);
    if candidates.is_empty() {
        return Ok(None);
    }
    Ok(Some(PairMeasurement {
        candidates,
        positive_only: !config.use_absolute,
        overlap: la.min(lb),
    }))
}

fn validate_config(set: &RecordSet, config: &CorrelationConfig) -> Result<(), AlignError> {
    if config.peak_count == 0 {
        return Err(AlignError::InvalidConfig(
            "peak count must be at least 1".into(),
        ));
    }
    if !(config.min_spacing.is_finite() && config.min_spacing >= 0.0) {
        return Err(AlignError::InvalidConfig(format!(
            "minimum peak spacing {} must be finite and non-negative",
            config.min_spacing
        )));
    }
    if config.max_pair_gap == Some(0) {
        return Err(AlignError::InvalidConfig(
            "pair gap must be at least 1".into(),
        ));
    }
    if !(set.dt.is_finite() && set.dt > 0.0) {
        return Err(AlignError::InvalidConfig(format!(
            "sampling interval must be finite and positive, got {}",
            set.dt
        )));
    }
    Ok(())
}

/// Correlate every admissible record pair and keep the ranked peak
/// candidates for each. Pairs with no usable peak are dropped with a
/// warning rather than failing the pass.
pub fn correlate(
    set: &RecordSet,
    config: &CorrelationConfig,
) -> Result<PairwiseMeasurementSet, AlignError> {
    validate_config(set, config)?;

    let n = set.len();
    let mut pair_keys: Vec<(usize, usize)> = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            if let Some(gap) = config.max_pair_gap {
                if j - i > gap {
                    continue;
                }
            }
            pair_keys.push((i, j));
        }
    }
    if pair_keys.is_empty() {
        println!("[warn] no record pairs to correlate");
        return Ok(PairwiseMeasurementSet::default());
    }

    // One plan per distinct padded length; with uniform records that is one.
    let mut plans: BTreeMap<usize, FftPair> = BTreeMap::new();
    for &(i, j) in &pair_keys {
        let span = set.records[i].data.len() + set.records[j].data.len() - 1;
        let fft_len = span.next_power_of_two();
        plans.entry(fft_len).or_insert_with(|| FftPair::new(fft_len));
    }
    println!(
        "[info] correlating {} pairs across {} records",
        pair_keys.len(),
        n
    );

    let results: Vec<((usize, usize), Option<PairMeasurement>)> = pair_keys
        .par_iter()
        .map(|&(i, j)| {
            let a = &set.records[i];
            let b = &set.records[j];
            let span = a.data.len() + b.data.len() - 1;
            let fft_len = span.next_power_of_two();
            let plan = &plans[&fft_len];
            correlate_pair(a, b, set.dt, config, plan).map(|m| ((i, j), m))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut measurements = PairwiseMeasurementSet::default();
    for ((i, j), outcome) in results {
        match outcome {
            Some(pair) => {
                if config.debug {
                    if let Some(best) = pair.best() {
                        println!(
                            "[debug] pair {}-{}: lag {:+.6} s, coeff {:+.4} ({} candidates)",
                            set.records[i].name,
                            set.records[j].name,
                            best.lag,
                            best.coeff,
                            pair.candidates.len()
                        );
                    }
                }
                measurements.pairs.insert((i, j), pair);
            }
            None => {
                println!(
                    "[warn] pair {}-{}: no usable correlation peak, skipped",
                    set.records[i].name, set.records[j].name
                );
            }
        }
    }
    println!(
        "[info] kept measurements for {} of {} pairs",
        measurements.len(),
        pair_keys.len()
    );
    Ok(measurements)
}

#[cfg(test)]
mod tests {
    use super::{correlate, CorrelationConfig};
    use crate::record::{Record, RecordSet};

    fn pulse(center: f64, width: f64, amp: f64, start: f64, dt: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = start + i as f64 * dt;
                let x = (t - center) / width;
                amp * (-x * x).exp()
            })
            .collect()
    }

    fn two_records(shift: f64, amp_b: f64, start_b: f64) -> RecordSet {
        let dt = 0.5;
        let n = 200;
        RecordSet {
            dt,
            records: vec![
                Record {
                    name: "STA1".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: pulse(30.0, 2.0, 1.0, 0.0, dt, n),
                },
                Record {
                    name: "STA2".into(),
                    start: start_b,
                    prior_correction: 0.0,
                    data: pulse(30.0 + shift, 2.0, amp_b, start_b, dt, n),
                },
            ],
        }
    }

    #[test]
    fn known_shift_is_recovered() {
        let set = two_records(3.0, 1.0, 0.0);
        let measurements = correlate(&set, &CorrelationConfig::default()).unwrap();
        let pair = &measurements.pairs[&(0, 1)];
        let best = *pair.best().unwrap();
        assert!((best.lag - 3.0).abs() < 1e-6, "lag {}", best.lag);
        assert!(best.coeff > 0.999, "coeff {}", best.coeff);
        assert_eq!(best.sign(), 1);
        assert!(!pair.positive_only);
        assert_eq!(pair.overlap, 200);
    }

    #[test]
    fn start_offsets_enter_the_lag() {
        // Same waveform relative to each record's own start, so the lag is
        // purely the start-time difference.
        let dt = 0.5;
        let n = 200;
        let data = pulse(30.0, 2.0, 1.0, 0.0, dt, n);
        let set = RecordSet {
            dt,
            records: vec![
                Record {
                    name: "A".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: data.clone(),
                },
                Record {
                    name: "B".into(),
                    start: 7.5,
                    prior_correction: 0.0,
                    data,
                },
            ],
        };
        let measurements = correlate(&set, &CorrelationConfig::default()).unwrap();
        let best = *measurements.pairs[&(0, 1)].best().unwrap();
        assert!((best.lag - 7.5).abs() < 1e-6, "lag {}", best.lag);
    }

    #[test]
    fn peak_count_one_yields_exactly_one_candidate() {
        let set = two_records(3.0, 1.0, 0.0);
        let config = CorrelationConfig {
            peak_count: 1,
            ..CorrelationConfig::default()
        };
        let measurements = correlate(&set, &config).unwrap();
        assert_eq!(measurements.pairs[&(0, 1)].candidates.len(), 1);
    }

    #[test]
    fn spacing_is_enforced_between_candidates() {
        // Secondary arrival 6 s after the main one produces side peaks.
        let dt = 0.5;
        let n = 240;
        let mut data_b = pulse(36.0, 2.0, 1.0, 0.0, dt, n);
        for (slot, v) in data_b
            .iter_mut()
            .zip(pulse(42.0, 2.0, 0.6, 0.0, dt, n))
        {
            *slot += v;
        }
        let set = RecordSet {
            dt,
            records: vec![
                Record {
                    name: "A".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: pulse(30.0, 2.0, 1.0, 0.0, dt, n),
                },
                Record {
                    name: "B".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: data_b,
                },
            ],
        };

        let loose = CorrelationConfig {
            min_spacing: 0.0,
            ..CorrelationConfig::default()
        };
        let strict = CorrelationConfig {
            min_spacing: 100.0,
            ..CorrelationConfig::default()
        };
        let many = correlate(&set, &loose).unwrap().pairs[&(0, 1)]
            .candidates
            .clone();
        let few = correlate(&set, &strict).unwrap().pairs[&(0, 1)]
            .candidates
            .clone();
        assert!(many.len() > 1);
        assert_eq!(few.len(), 1);

        let spaced = CorrelationConfig {
            min_spacing: 4.0,
            ..CorrelationConfig::default()
        };
        let picked = correlate(&set, &spaced).unwrap().pairs[&(0, 1)]
            .candidates
            .clone();
        for (x, a) in picked.iter().enumerate() {
            for b in picked.iter().skip(x + 1) {
                assert!((a.lag - b.lag).abs() >= 4.0);
            }
        }
    }

    #[test]
    fn inverted_record_scores_negative_under_absolute() {
        let set = two_records(3.0, -1.0, 0.0);
        let measurements = correlate(&set, &CorrelationConfig::default()).unwrap();
        let best = *measurements.pairs[&(0, 1)].best().unwrap();
        assert!((best.lag - 3.0).abs() < 1e-6);
        assert!(best.coeff < -0.999, "coeff {}", best.coeff);
        assert_eq!(best.sign(), -1);
    }

    #[test]
    fn positive_only_scoring_ignores_inverted_peak() {
        let set = two_records(3.0, -1.0, 0.0);
        let config = CorrelationConfig {
            use_absolute: false,
            ..CorrelationConfig::default()
        };
        let measurements = correlate(&set, &config).unwrap();
        if let Some(pair) = measurements.pairs.get(&(0, 1)) {
            assert!(pair.positive_only);
            for candidate in &pair.candidates {
                assert!(candidate.coeff < 0.5, "kept {:?}", candidate);
            }
        }
    }

    #[test]
    fn zero_energy_pair_is_dropped() {
        let dt = 0.5;
        let set = RecordSet {
            dt,
            records: vec![
                Record {
                    name: "A".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: pulse(10.0, 1.0, 1.0, 0.0, dt, 100),
                },
                Record {
                    name: "B".into(),
                    start: 0.0,
                    prior_correction: 0.0,
                    data: vec![0.0; 100],
                },
            ],
        };
        let measurements = correlate(&set, &CorrelationConfig::default()).unwrap();
        assert!(measurements.is_empty());
    }

    #[test]
    fn pair_gap_limits_which_pairs_run() {
        let dt = 0.5;
        let records: Vec<Record> = (0..4)
            .map(|i| Record {
                name: format!("R{}", i),
                start: 0.0,
                prior_correction: 0.0,
                data: pulse(20.0 + i as f64, 1.5, 1.0, 0.0, dt, 120),
            })
            .collect();
        let set = RecordSet { dt, records };
        let config = CorrelationConfig {
            max_pair_gap: Some(1),
            ..CorrelationConfig::default()
        };
        let measurements = correlate(&set, &config).unwrap();
        let keys: Vec<(usize, usize)> = measurements.pairs.keys().copied().collect();
        assert_eq!(keys, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn zero_peak_count_is_rejected() {
        let set = two_records(1.0, 1.0, 0.0);
        let config = CorrelationConfig {
            peak_count: 0,
            ..CorrelationConfig::default()
        };
        assert!(correlate(&set, &config).is_err());
    }

    #[test]
    fn negative_spacing_is_rejected() {
        let set = two_records(1.0, 1.0, 0.0);
        let config = CorrelationConfig {
            min_spacing: -1.0,
            ..CorrelationConfig::default()
        };
        assert!(correlate(&set, &config).is_err());
    }
}
