use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::checks::CheckState;
use crate::error::AlignError;
use crate::record::{Record, RecordSet};

/// Parsed manifest before any sample file is touched.
#[derive(Debug, Clone)]
pub struct ManifestData {
    /// Sampling interval in seconds, shared by every listed record.
    pub dt: f64,
    pub entries: Vec<RecordEntry>,
}

/// One `record =` line (or `<record>` element) of a manifest.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub path: PathBuf,
    pub name: Option<String>,
    pub start: f64,
    pub correction: f64,
}

impl RecordEntry {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("record")
                .to_string(),
        }
    }
}

fn parse_field_f64(raw: &str, field: &str, path: &Path) -> Result<f64, AlignError> {
    raw.trim().parse::<f64>().map_err(|_| {
        AlignError::manifest(path, format!("invalid value for {}: '{}'", field, raw.trim()))
    })
}

fn parse_record_entry(raw: &str, path: &Path) -> Result<RecordEntry, AlignError> {
    let tokens: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    let file = tokens
        .first()
        .ok_or_else(|| AlignError::manifest(path, "record line has no file path"))?;
    let mut entry = RecordEntry {
        path: PathBuf::from(file),
        name: None,
        start: 0.0,
        correction: 0.0,
    };
    for token in &tokens[1..] {
        let Some(index) = token.find('=') else {
            return Err(AlignError::manifest(
                path,
                format!("record attribute '{}' is not key=value", token),
            ));
        };
        let (key, value) = token.split_at(index);
        let key = key.trim().to_ascii_lowercase().replace('_', "");
        let value = value.trim_start_matches('=').trim();
        match key.as_str() {
            "name" | "station" => entry.name = Some(value.to_string()),
            "start" | "t0" => entry.start = parse_field_f64(value, "start", path)?,
            "correction" | "prior" => {
                entry.correction = parse_field_f64(value, "correction", path)?;
            }
            other => {
                return Err(AlignError::manifest(
                    path,
                    format!("unknown record attribute '{}'", other),
                ));
            }
        }
    }
    Ok(entry)
}

fn parse_manifest_kv(path: &Path) -> Result<ManifestData, AlignError> {
    let file = File::open(path).map_err(|e| AlignError::manifest(path, e.to_string()))?;
    let reader = BufReader::new(file);
    let mut params = HashMap::new();
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.splitn(2, '#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some(index) = line.find('=') else { continue };
        let (key, value) = line.split_at(index);
        let key = key.trim().to_ascii_lowercase().replace('_', "");
        let value = value
            .trim_start_matches('=')
            .trim()
            .trim_matches('"')
            .trim_matches('\'');
        if matches!(key.as_str(), "record" | "rec" | "trace") {
            entries.push(parse_record_entry(value, path)?);
        } else {
            params.insert(key, value.to_string());
        }
    }
    let dt_raw = ["dt", "samplinginterval", "interval"]
        .iter()
        .find_map(|k| params.get(*k))
        .ok_or_else(|| AlignError::manifest(path, "sampling interval (dt) missing"))?;
    let dt = parse_field_f64(dt_raw, "dt", path)?;
    if entries.is_empty() {
        return Err(AlignError::manifest(path, "manifest lists no records"));
    }
    Ok(ManifestData { dt, entries })
}

/// Parse a manifest, dispatching on the file extension.
pub fn parse_manifest(path: &Path) -> Result<ManifestData, AlignError> {
    if path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("xml"))
        .unwrap_or(false)
    {
        return crate::xml::parse_xml_manifest(path);
    }
    parse_manifest_kv(path)
}

/// Read one sample file. Raw little-endian f32 for the `.f32` extension,
/// plain text with one or more values per line otherwise.
pub fn read_samples(path: &Path) -> Result<Vec<f64>, AlignError> {
    let is_raw = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("f32"))
        .unwrap_or(false);
    if is_raw {
        let bytes = std::fs::read(path).map_err(|e| AlignError::manifest(path, e.to_string()))?;
        if bytes.len() % 4 != 0 {
            return Err(AlignError::manifest(
                path,
                format!("raw f32 file length {} is not a multiple of 4", bytes.len()),
            ));
        }
        return Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect());
    }
    let file = File::open(path).map_err(|e| AlignError::manifest(path, e.to_string()))?;
    let reader = BufReader::new(file);
    let mut samples = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.splitn(2, '#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        for token in line.split_whitespace() {
            samples.push(parse_field_f64(token, "sample", path)?);
        }
    }
    Ok(samples)
}

/// Load a manifest and every sample file it lists, then validate the set
/// against the toggles currently in force. Relative sample paths resolve
/// against the manifest's directory.
pub fn load_records(path: &Path, checks: &CheckState) -> Result<RecordSet, AlignError> {
    let manifest = parse_manifest(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut set = RecordSet {
        dt: manifest.dt,
        records: Vec::with_capacity(manifest.entries.len()),
    };
    for entry in &manifest.entries {
        let sample_path = if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            base.join(&entry.path)
        };
        let data = read_samples(&sample_path)?;
        set.records.push(Record {
            name: entry.display_name(),
            start: entry.start,
            prior_correction: entry.correction,
            data,
        });
    }
    set.validate(checks)?;
    println!(
        "[info] loaded {} records from {} (dt = {} s)",
        set.len(),
        path.display(),
        set.dt
    );
    Ok(set)
}
