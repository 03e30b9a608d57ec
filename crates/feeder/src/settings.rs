//! Settings that survive across runs: pen heights and speeds, stored as
//! JSON next to wherever the user points us.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSettings {
    /// Pen-up servo pulse width, in 1/12 MHz units.
    pub pen_up_value: u32,
    /// Pen-down servo pulse width, same units.
    pub pen_down_value: u32,
    /// Drawing speed, percent of full.
    pub speed_pct: f64,
    /// Travel (pen up) speed, percent of full.
    pub travel_speed_pct: f64,
    /// Draw at constant speed instead of profiling velocity.
    pub const_speed: bool,
}

impl Default for StoredSettings {
    fn default() -> Self {
        StoredSettings {
            pen_up_value: 18000,
            pen_down_value: 12750,
            speed_pct: 65.0,
            travel_speed_pct: 75.0,
            const_speed: false,
        }
    }
}

/// Load settings, falling back to defaults when the file doesn't exist
/// yet. A file that exists but doesn't parse is an error; silently
/// clobbering it on the next save would lose whatever the user had.
pub fn load(path: &Path) -> anyhow::Result<StoredSettings> {
    match std::fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoredSettings::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save(path: &Path, settings: &StoredSettings) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(settings)?)?;
    Ok(())
}
