use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    audio::analyzer::AnalysisConfig,
    error::ConfigError,
    scheduler::{
        autodj::OrchestratorConfig, compatibility::CompatibilityConfig,
        mix_scheduler::SchedulerConfig, transition_planner::PlannerConfig,
    },
};

/// Top-level engine settings. Every section falls back to its defaults when
/// missing from the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub analysis: AnalysisConfig,
    pub compatibility: CompatibilityConfig,
    pub planner: PlannerConfig,
    pub scheduler: SchedulerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            analysis: AnalysisConfig::default(),
            compatibility: CompatibilityConfig::default(),
            planner: PlannerConfig::default(),
            scheduler: SchedulerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text)?;
        log::info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
