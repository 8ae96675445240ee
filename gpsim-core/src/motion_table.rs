//! Motion table (CSV) artifact written by every build
//!
//! Header: `t_s,lat,lon,alt_m,speed_mps,bearing_deg,segment_index`

use crate::model::MotionSample;
use anyhow::{Context, Result};
use std::path::Path;

pub const MOTION_TABLE_HEADER: [&str; 7] = [
    "t_s",
    "lat",
    "lon",
    "alt_m",
    "speed_mps",
    "bearing_deg",
    "segment_index",
];

pub fn write_motion_csv(path: &Path, samples: &[MotionSample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("opening {} for writing", path.display()))?;
    if samples.is_empty() {
        w.write_record(MOTION_TABLE_HEADER)?;
    }
    for sample in samples {
        w.serialize(sample)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_motion_csv(path: &Path) -> Result<Vec<MotionSample>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut samples = Vec::new();
    for rec in rdr.deserialize() {
        let sample: MotionSample = rec.with_context(|| format!("parsing {}", path.display()))?;
        samples.push(sample);
    }
    Ok(samples)
}
