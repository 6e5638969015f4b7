//! Optional TOML configuration carrying CLI defaults.
//!
//! Everything here can be overridden per invocation with command-line
//! flags; the file only spares operators from repeating the same profile
//! and directory arguments.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use cipherstat_he::Profile;

use crate::error::{PipelineError, PipelineResult};

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineSection {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_profile() -> String {
    "B".to_string()
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            key_dir: default_key_dir(),
            results_dir: default_results_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineSection::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> PipelineResult<()> {
        Profile::resolve_str(&self.pipeline.profile)?;
        Ok(())
    }

    pub fn load(path: &Path) -> PipelineResult<Config> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("reading config {}", path.display()), e))?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            PipelineError::InvalidSchema(format!("config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }
}
