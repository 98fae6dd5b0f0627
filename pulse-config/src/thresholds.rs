use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Error};

use pulse_api_types::{ThresholdConfig, ThresholdOverride, Thresholds};

use crate::{file_get_json_opt, store_json, DataDir};

/// Alert thresholds on disk: global defaults in `thresholds.json`,
/// per-resource overrides in `overrides.json`.
pub struct ThresholdStore {
    thresholds_path: PathBuf,
    overrides_path: PathBuf,
}

impl ThresholdStore {
    pub fn new(dir: &DataDir) -> Self {
        Self {
            thresholds_path: dir.thresholds_path(),
            overrides_path: dir.overrides_path(),
        }
    }

    pub fn load(&self) -> Result<ThresholdConfig, Error> {
        let defaults: Thresholds = file_get_json_opt(&self.thresholds_path)
            .with_context(|| format!("unable to load {:?}", self.thresholds_path))?
            .unwrap_or_default();
        let overrides: HashMap<String, ThresholdOverride> =
            file_get_json_opt(&self.overrides_path)
                .with_context(|| format!("unable to load {:?}", self.overrides_path))?
                .unwrap_or_default();
        Ok(ThresholdConfig {
            defaults,
            overrides,
        })
    }

    pub fn save(&self, config: &ThresholdConfig) -> Result<(), Error> {
        store_json(&self.thresholds_path, &config.defaults)?;
        store_json(&self.overrides_path, &config.overrides)
    }
}
