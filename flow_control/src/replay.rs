//! Replay of a trained imitation policy on the crosswalk environment.
//!
//! Two drivers share the same setup: [`run_experiment`] goes through
//! [`Experiment::run`], [`run_rollout`] steps the environment by hand and only
//! queries the policy for RL vehicles that are in the network.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::env::{Actions, CrosswalkEnv, MultiAgentEnv, Observations};
use crate::experiment::{Experiment, ExperimentInfo};
use crate::policy::{ImitatingNetwork, NetworkConfig, Policy};
use crate::settings::Settings;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RolloutSummary {
    pub total_reward: f64,
    pub steps: usize,
    pub interrupted: bool,
}

pub fn build_env(settings: &Settings) -> Result<CrosswalkEnv> {
    CrosswalkEnv::new(settings.simulation.clone(), settings.scenario.clone())
        .context("Failed to create environment")
}

/// Load the configured policy, or build an untrained one when loading is disabled.
///
/// `stochastic` selects sampled over mean actions; the network needs a variance head for it.
pub fn build_policy(
    settings: &Settings,
    obs_dim: usize,
    action_dim: usize,
    stochastic: bool,
) -> Result<ImitatingNetwork> {
    let policy = &settings.policy;
    let network = if policy.load_model {
        let network = ImitatingNetwork::load(&policy.load_path)
            .context("Failed to load policy network")?
            .with_stochastic(stochastic)?;
        if network.obs_dim() != obs_dim || network.action_dim() != action_dim {
            return Err(anyhow!(
                "Policy expects observations of size {} and actions of size {}, environment provides {} and {}",
                network.obs_dim(),
                network.action_dim(),
                obs_dim,
                action_dim
            ));
        }
        network
    } else {
        warn!("load_model is disabled; acting with an untrained network");
        let mut config = network_config(settings);
        config.stochastic |= stochastic;
        ImitatingNetwork::new(action_dim, obs_dim, &config)?.with_stochastic(stochastic)?
    };

    info!(algo = %policy.algo, stochastic = network.is_stochastic(), "Policy ready");
    Ok(match policy.seed {
        Some(seed) => network.with_seed(seed),
        None => network,
    })
}

fn network_config(settings: &Settings) -> NetworkConfig {
    NetworkConfig {
        hidden_sizes: settings.policy.hidden_sizes.clone(),
        stochastic: settings.policy.stochastic,
        seed: settings.policy.seed,
    }
}

/// One action per observed agent, or `None` when nothing is observed.
pub fn rl_actions<P: Policy>(policy: &mut P, state: &Observations) -> Result<Option<Actions>> {
    if state.is_empty() {
        return Ok(None);
    }
    let mut actions = Actions::new();
    for (vehicle_id, obs) in state {
        let accel = policy
            .get_accel_from_observation(obs)
            .with_context(|| format!("Policy failed for vehicle '{}'", vehicle_id))?;
        actions.insert(vehicle_id.clone(), accel);
    }
    Ok(Some(actions))
}

/// Drive `env` with `policy` until the episode is done.
///
/// Steps without actions while no RL vehicle is in the network.
#[instrument(skip_all, fields(env = env.name()))]
pub fn rollout<E, P>(env: &mut E, policy: &mut P, stop: &AtomicBool) -> Result<RolloutSummary>
where
    E: MultiAgentEnv,
    P: Policy,
{
    env.reset()?;
    let mut summary = RolloutSummary::default();

    loop {
        if stop.load(Ordering::Relaxed) {
            warn!("Rollout interrupted after {} steps", summary.steps);
            summary.interrupted = true;
            break;
        }

        let rl_vehicles = env.rl_ids();
        let outcome = if rl_vehicles.is_empty() {
            env.step(None)?
        } else {
            let observations = env.get_state();
            let mut actions = Actions::new();
            for vehicle_id in rl_vehicles {
                let obs = observations
                    .get(&vehicle_id)
                    .ok_or_else(|| anyhow!("No observation for RL vehicle '{}'", vehicle_id))?;
                let accel = policy.get_accel_from_observation(obs)?;
                actions.insert(vehicle_id, accel);
            }
            env.step(Some(&actions))?
        };

        summary.total_reward += outcome.total_reward();
        summary.steps += 1;
        if outcome.dones.all {
            break;
        }
    }

    info!("Final Reward: {}", summary.total_reward);
    Ok(summary)
}

#[instrument(skip_all)]
pub fn run_experiment(settings: &Settings, stop: Arc<AtomicBool>) -> Result<ExperimentInfo> {
    let env = build_env(settings)?;
    let mut policy = build_policy(
        settings,
        env.observation_dim(),
        env.action_dim(),
        settings.policy.stochastic,
    )?;

    let exp_cfg = &settings.experiment;
    let mut experiment = Experiment::new(env)
        .with_emission_dir(&exp_cfg.emission_path)
        .with_stop_flag(stop);
    experiment.run(
        exp_cfg.num_runs,
        exp_cfg.num_steps,
        |state| rl_actions(&mut policy, state),
        exp_cfg.convert_to_csv,
        exp_cfg.multiagent,
    )
}

#[instrument(skip_all)]
pub fn run_rollout(settings: &Settings, stop: Arc<AtomicBool>) -> Result<RolloutSummary> {
    let mut env = build_env(settings)?;
    let mut policy = build_policy(
        settings,
        env.observation_dim(),
        env.action_dim(),
        settings.policy.rollout_stochastic,
    )?;
    rollout(&mut env, &mut policy, &stop)
}

/// Write an untrained network sized for the configured environment.
pub fn init_model(settings: &Settings, output: &Path) -> Result<()> {
    let env = build_env(settings)?;
    let network = ImitatingNetwork::new(env.action_dim(), env.observation_dim(), &network_config(settings))?;
    network.save(output)
}
