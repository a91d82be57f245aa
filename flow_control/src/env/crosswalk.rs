//! Single road crossed by a pedestrian crosswalk.
//!
//! RL vehicles are controlled by acceleration. Pedestrians are spawned on the
//! southern sidewalk at a fixed interval and walk over the crossing to the
//! northern sidewalk.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::{Actions, AgentKind, EmissionRecord, MultiAgentEnv, Observations, StepOutcome};
use crate::kernel::pedestrian::KernelPedestrian;
use crate::kernel::{Kernel, PointPedestrianKernel, PED_NOT_FOUND};
use crate::settings::{ScenarioConfig, SimulationConfig};
use crate::sim::{PointSimulation, Vehicle};

pub const ROAD: &str = "road";
pub const SIDEWALK_SOUTH: &str = "sidewalk_south";
pub const CROSSING: &str = ":crossing_0";
pub const SIDEWALK_NORTH: &str = "sidewalk_north";

const OBSERVATION_DIM: usize = 3;

pub struct CrosswalkEnv {
    kernel: Kernel<PointPedestrianKernel>,
    simulation: SimulationConfig,
    scenario: ScenarioConfig,
    step_count: usize,
    spawned_pedestrians: usize,
}

impl CrosswalkEnv {
    pub fn new(simulation: SimulationConfig, scenario: ScenarioConfig) -> Result<Self> {
        scenario.validate()?;

        let mut sim = PointSimulation::new(simulation.sim_step);
        sim.add_edge(ROAD, scenario.road_length, 1, None);
        sim.add_edge(SIDEWALK_SOUTH, scenario.sidewalk_length, 1, Some(CROSSING));
        sim.add_edge(CROSSING, scenario.crosswalk_width, 1, Some(SIDEWALK_NORTH));
        sim.add_edge(SIDEWALK_NORTH, scenario.sidewalk_length, 1, None);

        let kernel = Kernel::new(sim.into_handle(), PointPedestrianKernel::new());
        let pedestrians = if simulation.pedestrians { scenario.num_pedestrians } else { 0 };
        info!(
            rl_vehicles = scenario.num_rl_vehicles,
            human_vehicles = scenario.num_human_vehicles,
            pedestrians,
            "Crosswalk environment created"
        );

        Ok(Self {
            kernel,
            simulation,
            scenario,
            step_count: 0,
            spawned_pedestrians: 0,
        })
    }

    pub fn kernel(&self) -> &Kernel<PointPedestrianKernel> {
        &self.kernel
    }

    fn spawn_vehicles(&mut self) -> Result<()> {
        let total = self.scenario.num_rl_vehicles + self.scenario.num_human_vehicles;
        for k in 0..total {
            let rl = k < self.scenario.num_rl_vehicles;
            let id = if rl {
                format!("rl_{}", k)
            } else {
                format!("human_{}", k - self.scenario.num_rl_vehicles)
            };
            // leader first
            let pos = (total - 1 - k) as f64 * self.scenario.vehicle_spacing;
            let mut vehicle = Vehicle::new(id, ROAD, pos, self.scenario.initial_speed, rl);
            vehicle.max_speed = self.scenario.max_speed;
            vehicle.max_accel = self.scenario.max_accel;
            vehicle.max_decel = self.scenario.max_decel;
            self.kernel.vehicle.add(vehicle)?;
        }
        Ok(())
    }

    fn spawn_due_pedestrians(&mut self) -> Result<()> {
        if !self.simulation.pedestrians {
            return Ok(());
        }
        let now = self.kernel.sim_time();
        while self.spawned_pedestrians < self.scenario.num_pedestrians
            && now >= self.spawned_pedestrians as f64 * self.scenario.pedestrian_spawn_interval
        {
            let id = format!("ped_{}", self.spawned_pedestrians);
            self.kernel
                .pedestrian
                .add(&id, SIDEWALK_SOUTH, 0.0, 0, self.scenario.pedestrian_speed)?;
            self.spawned_pedestrians += 1;
        }
        Ok(())
    }

    fn pedestrian_on_crossing(&self) -> bool {
        self.kernel
            .pedestrian
            .get_ids()
            .iter()
            .any(|id| self.kernel.pedestrian.get_edge(id, "") == CROSSING)
    }

    fn in_crosswalk_zone(&self, pos: f64) -> bool {
        let start = self.scenario.crosswalk_position;
        (start..=start + self.scenario.crosswalk_width).contains(&pos)
    }

    fn observe(&self, veh_id: &str, ped_flag: f64) -> Option<Vec<f64>> {
        let speed = self.kernel.vehicle.get_speed(veh_id)?;
        let pos = self.kernel.vehicle.get_position(veh_id)?;
        Some(vec![
            speed / self.scenario.max_speed,
            (self.scenario.crosswalk_position - pos) / self.scenario.road_length,
            ped_flag,
        ])
    }
}

impl MultiAgentEnv for CrosswalkEnv {
    fn name(&self) -> &str {
        "crosswalk"
    }

    fn observation_dim(&self) -> usize {
        OBSERVATION_DIM
    }

    fn horizon(&self) -> usize {
        self.simulation.horizon
    }

    fn reset(&mut self) -> Result<Observations> {
        self.kernel.reset()?;
        self.step_count = 0;
        self.spawned_pedestrians = 0;
        self.spawn_vehicles()?;
        self.spawn_due_pedestrians()?;
        debug!("Environment reset");
        Ok(self.get_state())
    }

    fn step(&mut self, rl_actions: Option<&Actions>) -> Result<StepOutcome> {
        let rl_before: BTreeSet<String> = self.kernel.vehicle.get_rl_ids().into_iter().collect();

        if let Some(actions) = rl_actions {
            let mut ids = Vec::with_capacity(actions.len());
            let mut accels = Vec::with_capacity(actions.len());
            for (id, accel) in actions {
                if !accel.is_finite() {
                    return Err(anyhow!("Non-finite action {} for vehicle '{}'", accel, id));
                }
                if !rl_before.contains(id) {
                    warn!(vehicle = %id, "action for a vehicle that is not an RL vehicle in the network");
                    continue;
                }
                ids.push(id.clone());
                accels.push(*accel);
            }
            self.kernel.vehicle.apply_acceleration(&ids, &accels)?;
        }

        self.kernel.simulation_step();
        self.step_count += 1;
        self.kernel.update(false)?;
        self.spawn_due_pedestrians()?;

        let blocked = self.pedestrian_on_crossing();
        let mut outcome = StepOutcome::default();
        for id in &rl_before {
            let reward = match (
                self.kernel.vehicle.get_speed(id),
                self.kernel.vehicle.get_position(id),
            ) {
                (Some(speed), Some(pos)) => {
                    let mut r = speed / self.scenario.max_speed;
                    if blocked && self.in_crosswalk_zone(pos) {
                        r -= self.scenario.crosswalk_penalty;
                    }
                    outcome.dones.agents.insert(id.clone(), false);
                    r
                }
                _ => {
                    outcome.dones.agents.insert(id.clone(), true);
                    0.0
                }
            };
            outcome.rewards.insert(id.clone(), reward);
        }

        outcome.infos.insert(
            "__common__".to_string(),
            serde_json::json!({
                "time": self.kernel.sim_time(),
                "pedestrian_on_crossing": blocked,
            }),
        );
        outcome.observations = self.get_state();
        outcome.dones.all =
            self.step_count >= self.simulation.horizon || self.kernel.vehicle.get_ids().is_empty();
        if outcome.dones.all {
            debug!(steps = self.step_count, "episode finished");
        }
        Ok(outcome)
    }

    fn get_state(&self) -> Observations {
        let flag = if self.pedestrian_on_crossing() { 1.0 } else { 0.0 };
        self.kernel
            .vehicle
            .get_rl_ids()
            .into_iter()
            .filter_map(|id| self.observe(&id, flag).map(|obs| (id, obs)))
            .collect()
    }

    fn rl_ids(&self) -> Vec<String> {
        self.kernel.vehicle.get_rl_ids()
    }

    fn mean_speed(&self) -> Option<f64> {
        let speeds: Vec<f64> = self
            .kernel
            .vehicle
            .get_ids()
            .iter()
            .filter_map(|id| self.kernel.vehicle.get_speed(id))
            .collect();
        if speeds.is_empty() {
            None
        } else {
            Some(speeds.iter().sum::<f64>() / speeds.len() as f64)
        }
    }

    fn emission(&self) -> Vec<EmissionRecord> {
        let time = self.kernel.sim_time();
        let vehicles = self.kernel.vehicle.get_ids().into_iter().map(|id| EmissionRecord {
            time,
            edge: self.kernel.vehicle.get_edge(&id).unwrap_or_default().to_string(),
            position: self.kernel.vehicle.get_position(&id).unwrap_or(PED_NOT_FOUND),
            speed: self.kernel.vehicle.get_speed(&id).unwrap_or(PED_NOT_FOUND),
            kind: AgentKind::Vehicle,
            id,
        });
        let pedestrians = self.kernel.pedestrian.get_ids().into_iter().map(|id| EmissionRecord {
            time,
            edge: self.kernel.pedestrian.get_edge(&id, ""),
            position: self.kernel.pedestrian.get_position(&id, PED_NOT_FOUND),
            speed: self.kernel.pedestrian.get_speed(&id, PED_NOT_FOUND),
            kind: AgentKind::Pedestrian,
            id,
        });
        vehicles.chain(pedestrians).collect()
    }

    fn sim_time(&self) -> f64 {
        self.kernel.sim_time()
    }
}
