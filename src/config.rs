//! Optional YAML configuration file for the CLI.
//!
//! Command-line flags win over file values; file values win over defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Kubeconfig used to reach the cluster.
    pub kubeconfig: Option<PathBuf>,
    /// Overall command timeout in seconds; 0 disables it.
    pub timeout: Option<u64>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }
}
