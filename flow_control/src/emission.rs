//! CSV output of per-step agent state.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::{self, File};
use std::path::Path;

use crate::env::{AgentKind, EmissionRecord};

const HEADER: [&str; 7] = ["run", "time", "id", "type", "edge_id", "position", "speed"];

#[derive(Serialize)]
struct EmissionRow<'a> {
    run: usize,
    time: f64,
    id: &'a str,
    #[serde(rename = "type")]
    kind: AgentKind,
    edge_id: &'a str,
    position: f64,
    speed: f64,
}

impl<'a> EmissionRow<'a> {
    fn new(run: usize, record: &'a EmissionRecord) -> Self {
        Self {
            run,
            time: record.time,
            id: &record.id,
            kind: record.kind,
            edge_id: &record.edge,
            position: record.position,
            speed: record.speed,
        }
    }
}

/// Write `(run, record)` rows to `path`, creating parent directories.
///
/// The header is written even when there are no rows.
pub fn write_csv(path: &Path, rows: &[(usize, EmissionRecord)]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create emission directory: {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create emission file: {:?}", path))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

    writer.write_record(HEADER)?;
    for (run, record) in rows {
        writer.serialize(EmissionRow::new(*run, record))?;
    }

    writer.flush()?;
    Ok(())
}
