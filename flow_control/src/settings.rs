//! Configuration management with file layering, environment variable support and validation.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Simulation-level parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Steps per rollout before the environment reports done
    pub horizon: usize,
    /// Seconds advanced per simulation step
    pub sim_step: f64,
    pub pedestrians: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            horizon: 400,
            sim_step: 0.5,
            pedestrians: true,
        }
    }
}

/// Layout and demand of the crosswalk scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub road_length: f64,
    pub crosswalk_position: f64,
    pub crosswalk_width: f64,
    pub sidewalk_length: f64,
    pub num_rl_vehicles: usize,
    pub num_human_vehicles: usize,
    pub vehicle_spacing: f64,
    pub initial_speed: f64,
    pub max_speed: f64,
    pub max_accel: f64,
    pub max_decel: f64,
    pub num_pedestrians: usize,
    pub pedestrian_speed: f64,
    /// Seconds between two pedestrian departures
    pub pedestrian_spawn_interval: f64,
    /// Subtracted from a vehicle's reward while it occupies an occupied crosswalk
    pub crosswalk_penalty: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            road_length: 200.0,
            crosswalk_position: 120.0,
            crosswalk_width: 6.0,
            sidewalk_length: 15.0,
            num_rl_vehicles: 2,
            num_human_vehicles: 1,
            vehicle_spacing: 25.0,
            initial_speed: 5.0,
            max_speed: 15.0,
            max_accel: 3.0,
            max_decel: 3.0,
            num_pedestrians: 4,
            pedestrian_speed: 1.3,
            pedestrian_spawn_interval: 10.0,
            crosswalk_penalty: 1.0,
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("road_length", self.road_length),
            ("crosswalk_position", self.crosswalk_position),
            ("crosswalk_width", self.crosswalk_width),
            ("sidewalk_length", self.sidewalk_length),
            ("vehicle_spacing", self.vehicle_spacing),
            ("initial_speed", self.initial_speed),
            ("max_speed", self.max_speed),
            ("max_accel", self.max_accel),
            ("max_decel", self.max_decel),
            ("pedestrian_speed", self.pedestrian_speed),
            ("pedestrian_spawn_interval", self.pedestrian_spawn_interval),
            ("crosswalk_penalty", self.crosswalk_penalty),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("Scenario value {} must be finite, got {}", name, value));
            }
        }

        if self.road_length <= 0.0 || self.sidewalk_length <= 0.0 || self.crosswalk_width <= 0.0 {
            return Err(anyhow!("Road, sidewalk and crosswalk lengths must be positive"));
        }
        if !(0.0..self.road_length).contains(&self.crosswalk_position) {
            return Err(anyhow!(
                "Crosswalk position {} lies outside the road (length {})",
                self.crosswalk_position,
                self.road_length
            ));
        }
        let total = self.num_rl_vehicles + self.num_human_vehicles;
        if self.vehicle_spacing < 0.0
            || (total > 0 && (total - 1) as f64 * self.vehicle_spacing >= self.road_length)
        {
            return Err(anyhow!("{} vehicles at spacing {} do not fit on the road", total, self.vehicle_spacing));
        }
        if self.max_speed <= 0.0 {
            return Err(anyhow!("Max speed must be positive"));
        }
        if self.max_accel < 0.0 || self.max_decel < 0.0 {
            return Err(anyhow!("Acceleration bounds cannot be negative"));
        }
        if self.pedestrian_speed < 0.0 || self.pedestrian_spawn_interval < 0.0 {
            return Err(anyhow!("Pedestrian speed and spawn interval cannot be negative"));
        }
        Ok(())
    }
}

/// Policy network loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Algorithm the expert was trained with; informational only
    pub algo: String,
    pub load_model: bool,
    pub load_path: PathBuf,
    /// Sample actions in `run_experiment`
    pub stochastic: bool,
    /// Sample actions in `run_rollout`; the mean action is used otherwise
    pub rollout_stochastic: bool,
    /// Hidden layer sizes when a fresh network is built
    pub hidden_sizes: Vec<usize>,
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            algo: "PPO".to_string(),
            load_model: true,
            load_path: PathBuf::from("model_files/bay0.json"),
            stochastic: true,
            rollout_stochastic: false,
            hidden_sizes: vec![32, 32],
            seed: None,
        }
    }
}

/// Parameters of `Experiment::run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub num_runs: usize,
    pub num_steps: usize,
    pub convert_to_csv: bool,
    pub multiagent: bool,
    pub emission_path: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_runs: 1,
            num_steps: 1_000,
            convert_to_csv: false,
            multiagent: true,
            emission_path: PathBuf::from("data"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub simulation: SimulationConfig,
    pub scenario: ScenarioConfig,
    pub policy: PolicyConfig,
    pub experiment: ExperimentConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, an optional file and `FLOW__` environment variables
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml));

        builder = match config_file {
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("Configuration file not found: {:?}", path));
                }
                builder.add_source(File::from(path))
            }
            None => builder.add_source(File::with_name("flow").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("FLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("policy.hidden_sizes")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.simulation.horizon == 0 {
            return Err(anyhow!("Simulation horizon cannot be 0"));
        }
        if !(self.simulation.sim_step.is_finite() && self.simulation.sim_step > 0.0) {
            return Err(anyhow!("Simulation step must be positive"));
        }

        self.scenario.validate()?;

        if self.experiment.num_runs == 0 {
            return Err(anyhow!("Number of runs cannot be 0"));
        }
        if self.experiment.num_steps == 0 {
            return Err(anyhow!("Number of steps cannot be 0"));
        }
        if self.experiment.num_steps > self.simulation.horizon {
            warn!(
                "Experiment steps ({}) exceed the horizon ({}); runs end at the horizon",
                self.experiment.num_steps, self.simulation.horizon
            );
        }

        if self.policy.load_model && !self.policy.load_path.exists() {
            warn!("Policy weights file does not exist: {:?}", self.policy.load_path);
        }
        if !self.policy.load_model && self.policy.hidden_sizes.iter().any(|&h| h == 0) {
            return Err(anyhow!("Hidden layer sizes must be positive"));
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(anyhow!("Unknown log format '{}'; expected 'text' or 'json'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let settings = Settings::load(None).unwrap();
        let defaults = Settings::default();

        assert_eq!(settings.simulation.horizon, defaults.simulation.horizon);
        assert_eq!(settings.experiment.num_steps, defaults.experiment.num_steps);
        assert_eq!(settings.policy.algo, "PPO");
        assert_eq!(settings.scenario.num_rl_vehicles, defaults.scenario.num_rl_vehicles);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        fs::write(
            &path,
            r#"
[simulation]
horizon = 50

[experiment]
num_runs = 3
convert_to_csv = true
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.simulation.horizon, 50);
        assert_eq!(settings.experiment.num_runs, 3);
        assert!(settings.experiment.convert_to_csv);
        // untouched keys keep their defaults
        assert_eq!(settings.simulation.sim_step, 0.5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.simulation.horizon = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "yaml".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scenario.crosswalk_position = 500.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scenario.num_human_vehicles = 20;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let mut settings = Settings::default();
        settings.simulation.sim_step = f64::NAN;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scenario.max_decel = f64::INFINITY;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scenario.vehicle_spacing = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_nan_max_speed_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nan.toml");
        fs::write(&path, "[scenario]\nmax_speed = nan\n").unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("max_speed"));
    }
}
