//! End-to-end tests for the replay drivers on the crosswalk environment,
//! plus a custom pedestrian backend plugged into the master kernel.

use anyhow::{anyhow, Result};
use flow_control::{
    env::MultiAgentEnv,
    kernel::{pedestrian::KernelPedestrian, Kernel, PED_NOT_FOUND},
    policy::{ImitatingNetwork, NetworkConfig},
    replay,
    settings::Settings,
    sim::{PointSimulation, SimHandle},
};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

/// Helper function to create settings for a short, deterministic replay
fn short_settings(model: Option<std::path::PathBuf>) -> Settings {
    let mut settings = Settings::default();
    settings.simulation.horizon = 60;
    settings.experiment.num_steps = 60;
    settings.policy.stochastic = false;
    settings.policy.seed = Some(3);
    match model {
        Some(path) => settings.policy.load_path = path,
        None => settings.policy.load_model = false,
    }
    settings
}

#[test]
fn test_experiment_with_untrained_network() {
    let dir = tempdir().unwrap();
    let mut settings = short_settings(None);
    settings.experiment.num_runs = 2;
    settings.experiment.convert_to_csv = true;
    settings.experiment.emission_path = dir.path().to_path_buf();

    let info = replay::run_experiment(&settings, Arc::new(AtomicBool::new(false))).unwrap();

    assert_eq!(info.returns.len(), 2);
    assert!(!info.interrupted);
    assert!(info.steps.iter().all(|&s| s > 0 && s <= 60));

    let emission = std::fs::read_to_string(info.emission_file.unwrap()).unwrap();
    assert!(emission.starts_with("run,time,id,type,edge_id,position,speed"));
    assert!(emission.contains("pedestrian"));
    assert!(emission.contains("vehicle"));
}

#[test]
fn test_rollout_with_saved_model_is_deterministic() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("model_files").join("crosswalk.json");
    let settings = short_settings(Some(model.clone()));

    replay::init_model(&settings, &model).unwrap();
    assert!(model.exists());

    let first = replay::run_rollout(&settings, Arc::new(AtomicBool::new(false))).unwrap();
    let second = replay::run_rollout(&settings, Arc::new(AtomicBool::new(false))).unwrap();

    assert_eq!(first.steps, second.steps);
    assert!((first.total_reward - second.total_reward).abs() < 1e-9);
}

#[test]
fn test_rollout_uses_mean_action_by_default() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("stochastic.json");
    let mut settings = Settings::default();
    settings.simulation.horizon = 60;
    settings.policy.load_path = model.clone();
    assert!(settings.policy.stochastic);
    assert!(!settings.policy.rollout_stochastic);

    // written with a variance head, so sampling would be possible
    replay::init_model(&settings, &model).unwrap();

    let first = replay::run_rollout(&settings, Arc::new(AtomicBool::new(false))).unwrap();
    let second = replay::run_rollout(&settings, Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(first.steps, second.steps);
    assert_eq!(first.total_reward, second.total_reward);
}

#[test]
fn test_missing_model_propagates_error() {
    let dir = tempdir().unwrap();
    let settings = short_settings(Some(dir.path().join("absent.json")));

    let err = replay::run_rollout(&settings, Arc::new(AtomicBool::new(false))).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to load policy network"));
}

#[test]
fn test_stochastic_request_needs_variance_head() {
    let dir = tempdir().unwrap();
    let model = dir.path().join("deterministic.json");
    ImitatingNetwork::new(1, 3, &NetworkConfig::default())
        .unwrap()
        .save(&model)
        .unwrap();

    let mut settings = short_settings(Some(model));
    settings.policy.stochastic = true;
    assert!(replay::run_experiment(&settings, Arc::new(AtomicBool::new(false))).is_err());
}

#[test]
fn test_rollout_env_reaches_done() {
    let settings = short_settings(None);
    let mut env = replay::build_env(&settings).unwrap();
    let mut policy = replay::build_policy(&settings, env.observation_dim(), env.action_dim(), false).unwrap();

    let summary = replay::rollout(&mut env, &mut policy, &AtomicBool::new(false)).unwrap();
    assert!(summary.steps <= env.horizon());
    assert!(!summary.interrupted);
}

/// Pedestrian backend that keeps its own table and only uses the simulator
/// for the clock; exercises the kernel seam with a non-default backend.
#[derive(Default)]
struct TablePedestrians {
    api: Option<SimHandle>,
    table: BTreeMap<String, (String, f64, f64)>,
    updates: usize,
}

impl KernelPedestrian for TablePedestrians {
    type Api = SimHandle;

    fn pass_api(&mut self, api: SimHandle) {
        self.api = Some(api);
    }

    fn update(&mut self, reset: bool) -> Result<()> {
        if self.api.is_none() {
            return Err(anyhow!("no api"));
        }
        if reset {
            self.table.clear();
        }
        self.updates += 1;
        Ok(())
    }

    fn add(&mut self, ped_id: &str, edge: &str, pos: f64, _lane: u32, speed: f64) -> Result<()> {
        self.table.insert(ped_id.to_string(), (edge.to_string(), pos, speed));
        Ok(())
    }

    fn get_next_edge(&self, _ped_id: &str) -> String {
        String::new()
    }

    fn remove(&mut self, ped_id: &str) -> Result<()> {
        self.table
            .remove(ped_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown pedestrian {}", ped_id))
    }

    fn get_ids(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    fn speed(&self, ped_id: &str) -> Option<f64> {
        self.table.get(ped_id).map(|p| p.2)
    }

    fn position(&self, ped_id: &str) -> Option<f64> {
        self.table.get(ped_id).map(|p| p.1)
    }

    fn lane_position(&self, ped_id: &str) -> Option<f64> {
        self.position(ped_id)
    }

    fn edge(&self, ped_id: &str) -> Option<String> {
        self.table.get(ped_id).map(|p| p.0.clone())
    }

    fn set_speed(&mut self, ped_id: &str, speed: f64) -> Result<()> {
        let entry = self
            .table
            .get_mut(ped_id)
            .ok_or_else(|| anyhow!("unknown pedestrian {}", ped_id))?;
        entry.2 = speed;
        Ok(())
    }
}

#[test]
fn test_kernel_accepts_custom_pedestrian_backend() {
    let mut sim = PointSimulation::new(1.0);
    sim.add_edge("road", 100.0, 1, None);
    let mut kernel = Kernel::new(sim.into_handle(), TablePedestrians::default());

    kernel.pedestrian.add("p0", "walkway", 4.0, 0, 1.2).unwrap();
    kernel.pedestrian.set_speed("p0", 0.8).unwrap();
    kernel.update(false).unwrap();

    assert_eq!(kernel.pedestrian.updates, 1);
    assert_eq!(kernel.pedestrian.get_speeds(&["p0", "p1"], PED_NOT_FOUND), vec![0.8, PED_NOT_FOUND]);
    assert_eq!(kernel.pedestrian.get_lane_position("p0", PED_NOT_FOUND), 4.0);
    assert_eq!(kernel.pedestrian.get_edge("p1", ""), "");

    kernel.reset().unwrap();
    assert!(kernel.pedestrian.get_ids().is_empty());
    assert!(kernel.pedestrian.remove("p0").is_err());
}

#[tokio::test]
async fn test_stop_flag_interrupts_blocking_experiment() {
    let settings = short_settings(None);
    let stop = Arc::new(AtomicBool::new(true));

    let info = tokio::task::spawn_blocking(move || replay::run_experiment(&settings, stop))
        .await
        .unwrap()
        .unwrap();

    assert!(info.interrupted);
    assert_eq!(info.steps, vec![0]);
}
