//! Vehicle sub-kernel for the point simulation.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use crate::sim::{SimHandle, Vehicle};

#[derive(Debug, Clone, PartialEq)]
struct VehicleState {
    edge: String,
    pos: f64,
    speed: f64,
    rl: bool,
}

/// Caches vehicle state per step and forwards commands to the simulator.
#[derive(Debug, Default)]
pub struct PointVehicleKernel {
    api: Option<SimHandle>,
    states: BTreeMap<String, VehicleState>,
}

impl PointVehicleKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass_api(&mut self, api: SimHandle) {
        self.api = Some(api);
    }

    fn api(&self) -> Result<&SimHandle> {
        self.api
            .as_ref()
            .ok_or_else(|| anyhow!("Vehicle kernel has no simulator API; call pass_api first"))
    }

    /// Refresh the cache. The table is rebuilt from scratch every step.
    pub fn update(&mut self, _reset: bool) -> Result<()> {
        let states: BTreeMap<_, _> = self
            .api()?
            .lock()
            .vehicles()
            .map(|v| {
                (
                    v.id.clone(),
                    VehicleState {
                        edge: v.edge.clone(),
                        pos: v.pos,
                        speed: v.speed,
                        rl: v.rl,
                    },
                )
            })
            .collect();
        self.states = states;
        Ok(())
    }

    pub fn add(&mut self, vehicle: Vehicle) -> Result<()> {
        let state = VehicleState {
            edge: vehicle.edge.clone(),
            pos: vehicle.pos,
            speed: vehicle.speed,
            rl: vehicle.rl,
        };
        let id = vehicle.id.clone();
        self.api()?.lock().add_vehicle(vehicle)?;
        self.states.insert(id, state);
        Ok(())
    }

    pub fn get_ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    pub fn get_rl_ids(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| s.rl)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_speed(&self, veh_id: &str) -> Option<f64> {
        self.states.get(veh_id).map(|s| s.speed)
    }

    pub fn get_position(&self, veh_id: &str) -> Option<f64> {
        self.states.get(veh_id).map(|s| s.pos)
    }

    pub fn get_edge(&self, veh_id: &str) -> Option<&str> {
        self.states.get(veh_id).map(|s| s.edge.as_str())
    }

    /// Command accelerations for the next step.
    ///
    /// Nothing is commanded unless every id is in the network.
    pub fn apply_acceleration(&self, veh_ids: &[String], accels: &[f64]) -> Result<()> {
        if veh_ids.len() != accels.len() {
            return Err(anyhow!(
                "Got {} vehicle ids but {} accelerations",
                veh_ids.len(),
                accels.len()
            ));
        }
        let mut sim = self.api()?.lock();
        if let Some(unknown) = veh_ids.iter().find(|id| sim.vehicle(id.as_str()).is_none()) {
            return Err(anyhow!("Unknown vehicle '{}'", unknown));
        }
        for (id, accel) in veh_ids.iter().zip(accels) {
            sim.apply_acceleration(id, *accel)?;
        }
        Ok(())
    }
}
