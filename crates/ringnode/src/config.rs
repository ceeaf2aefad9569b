use anyhow::{Context, Result};
use ringmesh_routing::{OverlayConfig, Topology};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

/// Shape of a simulated overlay run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Nodes joined one at a time
    pub nodes: usize,
    /// Random keys routed in each lookup round
    pub lookups: usize,
    /// Nodes killed before the second round
    pub failures: usize,
    pub seed: u64,
    #[serde(default)]
    pub topology: Topology,
    /// Upper bound on waiting for the network to go quiet
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,
}

fn default_settle_timeout() -> u64 {
    30
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 64,
            lookups: 200,
            failures: 4,
            seed: 42,
            topology: Topology::Euclidean,
            settle_timeout_secs: default_settle_timeout(),
        }
    }
}

impl SimulationConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit log lines as JSON
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;
        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.config_file_path = config_path;
        config.validate()?;

        Ok(config)
    }

    /// Create a new default configuration and write it out
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config = Config {
            overlay: OverlayConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: config_path.clone(),
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    /// Reject settings no simulation can run with
    pub fn validate(&self) -> Result<()> {
        self.overlay
            .validate()
            .context("Invalid overlay configuration")?;
        if self.simulation.nodes == 0 {
            anyhow::bail!("simulation.nodes must be at least 1");
        }
        if self.simulation.failures >= self.simulation.nodes {
            anyhow::bail!(
                "simulation.failures ({}) must leave at least one live node out of {}",
                self.simulation.failures,
                self.simulation.nodes
            );
        }
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ringnode")
            .join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let created = Config::create_default(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert_eq!(created.config_path(), path.as_path());

        let loaded = Config::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.overlay, OverlayConfig::default());
        assert_eq!(loaded.simulation, SimulationConfig::default());
        assert_eq!(loaded.logging, LoggingConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("absent.yaml"))).unwrap_err();
        assert!(err.to_string().contains("--init"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "overlay:\n  leaf_set_half_size: 4\nsimulation:\n  nodes: 10\n  lookups: 5\n  failures: 1\n  seed: 7\n  topology: uniform\n",
        )
        .unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.overlay.leaf_set_half_size, 4);
        assert_eq!(config.overlay.digit_bits, OverlayConfig::default().digit_bits);
        assert_eq!(config.simulation.topology, Topology::Uniform);
        assert_eq!(config.simulation.settle_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_overlay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "overlay:\n  digit_bits: 12\n").unwrap();
        assert!(Config::load(Some(path)).is_err());
    }

    #[test]
    fn test_failures_must_leave_live_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::create_default(Some(dir.path().join("config.yaml"))).unwrap();
        config.simulation.nodes = 3;
        config.simulation.failures = 3;
        assert!(config.validate().is_err());
    }
}
