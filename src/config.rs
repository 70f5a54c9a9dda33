use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::source::SourceParams;
use crate::tracking::{EyeParams, TailParams};

/// On-disk tracking configuration. Missing fields fall back to defaults
/// thanks to #[serde(default)], and the file is rewritten after load so
/// newly added parameters show up for editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub tail: TailParams,
    pub eyes: EyeParams,
    pub source: SourceParams,
    /// Diagnostic image shown on the display path; `None` means raw frames.
    pub display_mode: Option<String>,
    /// Capacity of the drop-oldest display channel.
    pub display_depth: usize,
    /// Columns surfaced for live plots.
    pub monitored_headers: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tail: TailParams::default(),
            eyes: EyeParams::default(),
            source: SourceParams::default(),
            display_mode: None,
            display_depth: 3,
            monitored_headers: vec![
                "tail_sum".to_string(),
                "th_e0".to_string(),
                "th_e1".to_string(),
            ],
        }
    }
}

impl TrackingConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config = if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match serde_json::from_str::<TrackingConfig>(&content) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error parsing {}: {}. Loading defaults.", path, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        // Always save back so new fields are populated in the file.
        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
