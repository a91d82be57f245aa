//! Multi-agent environment contract used by the replay drivers.

pub mod crosswalk;

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

pub use crosswalk::CrosswalkEnv;

/// Observation per agent id.
pub type Observations = BTreeMap<String, Vec<f64>>;
/// Scalar action per agent id.
pub type Actions = BTreeMap<String, f64>;
pub type Rewards = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dones {
    pub agents: BTreeMap<String, bool>,
    /// True once the whole episode is over (gym's `__all__`).
    pub all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub observations: Observations,
    pub rewards: Rewards,
    pub dones: Dones,
    pub infos: BTreeMap<String, serde_json::Value>,
}

impl StepOutcome {
    pub fn total_reward(&self) -> f64 {
        self.rewards.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Vehicle,
    Pedestrian,
}

/// State of one agent at one time step, as written to emission files.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionRecord {
    pub time: f64,
    pub id: String,
    pub kind: AgentKind,
    pub edge: String,
    pub position: f64,
    pub speed: f64,
}

pub trait MultiAgentEnv {
    fn name(&self) -> &str;

    /// Length of each agent's observation vector.
    fn observation_dim(&self) -> usize;

    fn action_dim(&self) -> usize {
        1
    }

    /// Maximum number of steps in one rollout.
    fn horizon(&self) -> usize;

    fn reset(&mut self) -> Result<Observations>;

    /// Apply `rl_actions` (if any) and advance one step.
    fn step(&mut self, rl_actions: Option<&Actions>) -> Result<StepOutcome>;

    /// Observations of the current step.
    fn get_state(&self) -> Observations;

    /// Ids of RL-controlled agents currently in the network.
    fn rl_ids(&self) -> Vec<String>;

    /// Mean speed of all vehicles currently in the network, if any.
    fn mean_speed(&self) -> Option<f64>;

    fn emission(&self) -> Vec<EmissionRecord>;

    fn sim_time(&self) -> f64;
}
