//! Model configuration files.
//!
//! A model is described by `<config_dir>/<model_name>.toml`, a flat table of
//! hyperparameters that must at least define `seq_len`.

use crate::error::{TrainingError, TrainingResult};
use crate::state::ModelConfig;
use std::path::{Path, PathBuf};

#[must_use]
pub fn model_config_path(config_dir: &Path, model_name: &str) -> PathBuf {
    config_dir.join(format!("{model_name}.toml"))
}

pub fn load_model_config(config_dir: &Path, model_name: &str) -> TrainingResult<ModelConfig> {
    let path = model_config_path(config_dir, model_name);
    if !path.exists() {
        return Err(TrainingError::Configuration(format!(
            "path to your model config {} does not exist",
            path.display()
        )));
    }

    let text = std::fs::read_to_string(&path)
        .map_err(|e| TrainingError::Configuration(format!("failed to read {}: {e}", path.display())))?;
    let config = ModelConfig::from_toml_str(&text)
        .map_err(|e| TrainingError::Configuration(format!("{}: {e}", path.display())))?;

    config.seq_len()?;
    Ok(config)
}
