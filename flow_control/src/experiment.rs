//! Repeated rollouts of an environment under an action callback, with
//! return statistics and optional emission output.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::emission;
use crate::env::{Actions, EmissionRecord, MultiAgentEnv, Observations, StepOutcome};

/// Statistics collected by [`Experiment::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExperimentInfo {
    pub returns: Vec<f64>,
    pub per_step_returns: Vec<Vec<f64>>,
    /// Mean vehicle speed of each run
    pub mean_speeds: Vec<f64>,
    pub steps: Vec<usize>,
    pub mean_return: f64,
    pub std_return: f64,
    pub interrupted: bool,
    pub emission_file: Option<PathBuf>,
}

pub struct Experiment<E: MultiAgentEnv> {
    env: E,
    emission_dir: PathBuf,
    stop: Option<Arc<AtomicBool>>,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Reward of one step: summed over agents for a multi-agent run, the single
/// agent's reward otherwise.
fn step_reward(outcome: &StepOutcome, multiagent: bool) -> Result<f64> {
    if multiagent {
        return Ok(outcome.total_reward());
    }
    match outcome.rewards.len() {
        0 => Ok(0.0),
        1 => Ok(outcome.total_reward()),
        n => Err(anyhow!(
            "Single-agent run got rewards for {} agents; run with multiagent enabled",
            n
        )),
    }
}

impl<E: MultiAgentEnv> Experiment<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            emission_dir: PathBuf::from("data"),
            stop: None,
        }
    }

    /// Directory that receives `<env name>_emission.csv`.
    pub fn with_emission_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.emission_dir = dir.into();
        self
    }

    /// Flag checked before every step; once set, the experiment stops early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::Relaxed))
    }

    /// Run `num_runs` rollouts of at most `num_steps` steps each.
    ///
    /// `rl_actions` maps the current observations to the actions passed to
    /// `step`; `None` steps the environment without RL commands.
    #[instrument(skip(self, rl_actions), fields(env = self.env.name()))]
    pub fn run<F>(
        &mut self,
        num_runs: usize,
        num_steps: usize,
        mut rl_actions: F,
        convert_to_csv: bool,
        multiagent: bool,
    ) -> Result<ExperimentInfo>
    where
        F: FnMut(&Observations) -> Result<Option<Actions>>,
    {
        if num_steps > self.env.horizon() {
            warn!(
                "num_steps ({}) is greater than the horizon ({}); runs end at the horizon",
                num_steps,
                self.env.horizon()
            );
        }

        let started = Instant::now();
        let mut info = ExperimentInfo::default();
        let mut emission_rows: Vec<(usize, EmissionRecord)> = Vec::new();

        'runs: for run in 0..num_runs {
            let mut state = self.env.reset()?;
            let mut ret = 0.0;
            let mut step_returns = Vec::new();
            let mut speeds = Vec::new();

            for _ in 0..num_steps {
                if self.stopped() {
                    warn!("Experiment interrupted during run {}", run);
                    info.interrupted = true;
                    Self::record_run(&mut info, ret, step_returns, &speeds);
                    break 'runs;
                }

                let actions = rl_actions(&state)?;
                let outcome = self.env.step(actions.as_ref())?;

                if let Some(speed) = self.env.mean_speed() {
                    speeds.push(speed);
                }
                if convert_to_csv {
                    emission_rows.extend(self.env.emission().into_iter().map(|r| (run, r)));
                }

                let reward = step_reward(&outcome, multiagent)?;
                step_returns.push(reward);
                ret += reward;

                let done = outcome.dones.all;
                state = outcome.observations;
                if done {
                    break;
                }
            }

            info!("Round {}, return: {}", run, ret);
            Self::record_run(&mut info, ret, step_returns, &speeds);
        }

        let (mean_return, std_return) = mean_std(&info.returns);
        info.mean_return = mean_return;
        info.std_return = std_return;
        let (mean_speed, std_speed) = mean_std(&info.mean_speeds);
        info!("Average, std returns: {}, {}", mean_return, std_return);
        info!("Average, std speeds: {}, {}", mean_speed, std_speed);

        if convert_to_csv {
            let path = self
                .emission_dir
                .join(format!("{}_emission.csv", self.env.name()));
            emission::write_csv(&path, &emission_rows)?;
            info!("Emission data written to {:?}", path);
            info.emission_file = Some(path);
        }

        info!("Total time: {:?}", started.elapsed());
        Ok(info)
    }

    fn record_run(info: &mut ExperimentInfo, ret: f64, step_returns: Vec<f64>, speeds: &[f64]) {
        info.steps.push(step_returns.len());
        info.returns.push(ret);
        info.per_step_returns.push(step_returns);
        info.mean_speeds.push(mean_std(speeds).0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Dones, Rewards};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    /// Two agents receive reward 1 each step; the episode ends after `length` steps.
    struct CountingEnv {
        length: usize,
        t: usize,
        actions_seen: Vec<Option<Actions>>,
    }

    impl CountingEnv {
        fn new(length: usize) -> Self {
            Self { length, t: 0, actions_seen: Vec::new() }
        }

        fn agents(&self) -> Vec<String> {
            vec!["a".to_string(), "b".to_string()]
        }
    }

    impl MultiAgentEnv for CountingEnv {
        fn name(&self) -> &str {
            "counting"
        }
        fn observation_dim(&self) -> usize {
            1
        }
        fn horizon(&self) -> usize {
            self.length
        }
        fn reset(&mut self) -> Result<Observations> {
            self.t = 0;
            Ok(self.get_state())
        }
        fn step(&mut self, rl_actions: Option<&Actions>) -> Result<StepOutcome> {
            self.actions_seen.push(rl_actions.cloned());
            self.t += 1;
            let rewards: Rewards = self.agents().into_iter().map(|id| (id, 1.0)).collect();
            Ok(StepOutcome {
                observations: self.get_state(),
                rewards,
                dones: Dones { all: self.t >= self.length, ..Dones::default() },
                ..StepOutcome::default()
            })
        }
        fn get_state(&self) -> Observations {
            self.agents().into_iter().map(|id| (id, vec![self.t as f64])).collect()
        }
        fn rl_ids(&self) -> Vec<String> {
            self.agents()
        }
        fn mean_speed(&self) -> Option<f64> {
            Some(2.0)
        }
        fn emission(&self) -> Vec<EmissionRecord> {
            vec![EmissionRecord {
                time: self.t as f64,
                id: "a".to_string(),
                kind: crate::env::AgentKind::Vehicle,
                edge: "e".to_string(),
                position: 0.0,
                speed: 2.0,
            }]
        }
        fn sim_time(&self) -> f64 {
            self.t as f64
        }
    }

    fn constant(state: &Observations) -> Result<Option<Actions>> {
        if state.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.keys().map(|id| (id.clone(), 0.5)).collect()))
    }

    #[test]
    fn test_returns_sum_agent_rewards_until_done() {
        let mut exp = Experiment::new(CountingEnv::new(5));
        let info = exp.run(2, 100, constant, false, true).unwrap();

        assert_eq!(info.returns, vec![10.0, 10.0]);
        assert_eq!(info.steps, vec![5, 5]);
        assert_eq!(info.mean_return, 10.0);
        assert_eq!(info.std_return, 0.0);
        assert_eq!(info.mean_speeds, vec![2.0, 2.0]);
        assert!(info.emission_file.is_none());
        assert!(exp.env().actions_seen.iter().all(|a| a.as_ref().map(|m| m.len()) == Some(2)));
    }

    #[test]
    #[traced_test]
    fn test_logs_each_round() {
        let mut exp = Experiment::new(CountingEnv::new(5));
        exp.run(2, 5, constant, false, true).unwrap();
        assert!(logs_contain("Round 0, return: 10"));
        assert!(logs_contain("Round 1, return: 10"));
    }

    #[test]
    fn test_num_steps_caps_the_run() {
        let mut exp = Experiment::new(CountingEnv::new(50));
        let info = exp.run(1, 3, constant, false, true).unwrap();
        assert_eq!(info.per_step_returns, vec![vec![2.0, 2.0, 2.0]]);
    }

    #[test]
    fn test_single_agent_mode_rejects_multiple_rewards() {
        let mut exp = Experiment::new(CountingEnv::new(5));
        assert!(exp.run(1, 5, constant, false, false).is_err());
    }

    #[test]
    fn test_callback_errors_propagate() {
        let mut exp = Experiment::new(CountingEnv::new(5));
        let result = exp.run(1, 5, |_| Err(anyhow!("policy failed")), false, true);
        assert!(result.unwrap_err().to_string().contains("policy failed"));
    }

    #[test]
    fn test_stop_flag_interrupts() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut exp = Experiment::new(CountingEnv::new(5)).with_stop_flag(stop);
        let info = exp.run(3, 5, constant, false, true).unwrap();

        assert!(info.interrupted);
        assert_eq!(info.returns, vec![0.0]);
        assert!(exp.env().actions_seen.is_empty());
    }

    #[test]
    fn test_convert_to_csv_writes_emission() {
        let dir = tempdir().unwrap();
        let mut exp = Experiment::new(CountingEnv::new(2)).with_emission_dir(dir.path());
        let info = exp.run(2, 10, constant, true, true).unwrap();

        let path = info.emission_file.unwrap();
        assert_eq!(path, dir.path().join("counting_emission.csv"));
        let contents = std::fs::read_to_string(path).unwrap();
        // header + 2 runs x 2 steps
        assert_eq!(contents.lines().count(), 5);
    }
}
