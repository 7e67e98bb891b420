//! CLI commands

use std::path::Path;

use keel_move::MoveConfig;
use tracing::debug;

use crate::{Error, Result};

pub mod move_cluster;

/// Load engine settings from a YAML file, or the defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<MoveConfig> {
    let Some(path) = path else {
        return Ok(MoveConfig::default());
    };

    let yaml = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let config = MoveConfig::from_yaml(&yaml)?;
    debug!(path = %path.display(), ?config, "Loaded move config");
    Ok(config)
}
