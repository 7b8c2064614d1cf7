use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};

use crate::error::AlignError;
use crate::manifest::{ManifestData, RecordEntry};

fn is_tag(node: Node<'_, '_>, tag: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(tag)
}

fn attr_f64(node: Node<'_, '_>, name: &str, path: &Path) -> Result<Option<f64>, AlignError> {
    match node.attribute(name).map(str::trim) {
        Some(v) if !v.is_empty() => v.parse::<f64>().map(Some).map_err(|_| {
            AlignError::manifest(path, format!("invalid value for {}: '{}'", name, v))
        }),
        _ => Ok(None),
    }
}

fn parse_record_node(node: Node<'_, '_>, path: &Path) -> Result<RecordEntry, AlignError> {
    let file = node
        .attribute("path")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AlignError::manifest(path, "record element has no path attribute"))?;
    Ok(RecordEntry {
        path: PathBuf::from(file),
        name: node.attribute("name").map(|s| s.trim().to_string()),
        start: attr_f64(node, "start", path)?.unwrap_or(0.0),
        correction: attr_f64(node, "correction", path)?.unwrap_or(0.0),
    })
}

pub fn parse_xml_manifest(path: &Path) -> Result<ManifestData, AlignError> {
    let xml = std::fs::read_to_string(path).map_err(|e| AlignError::manifest(path, e.to_string()))?;
    let doc = Document::parse(&xml).map_err(|e| AlignError::manifest(path, e.to_string()))?;

    let root = doc
        .descendants()
        .find(|n| is_tag(*n, "recordset"))
        .ok_or_else(|| AlignError::manifest(path, "recordset element not found"))?;

    let dt = attr_f64(root, "dt", path)?
        .ok_or_else(|| AlignError::manifest(path, "sampling interval (dt) missing"))?;

    let entries = root
        .children()
        .filter(|n| is_tag(*n, "record"))
        .map(|n| parse_record_node(n, path))
        .collect::<Result<Vec<_>, _>>()?;
    if entries.is_empty() {
        return Err(AlignError::manifest(path, "manifest lists no records"));
    }

    Ok(ManifestData { dt, entries })
}
