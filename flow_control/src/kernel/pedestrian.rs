//! Pedestrian sub-kernel: the contract every simulator backend fulfils for
//! pedestrian state, plus the backend for the in-process point simulation.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::sim::SimHandle;

/// Value returned by the numeric getters when a pedestrian is not found.
pub const PED_NOT_FOUND: f64 = -1001.0;

/// Pedestrian state interface implemented per simulator backend.
///
/// A backend is created by the master kernel and receives the simulator
/// handle later through [`KernelPedestrian::pass_api`]. Getters come in two
/// layers: the required `Option` lookups, and provided `get_*` wrappers that
/// substitute a caller-chosen error value, with list forms for several ids.
pub trait KernelPedestrian {
    /// Handle used to talk to the simulator.
    type Api;

    /// Acquire the API generated by the simulation kernel.
    fn pass_api(&mut self, api: Self::Api);

    /// Refresh cached state from the current time step.
    ///
    /// `reset` is true when the simulator was reset in the last step.
    fn update(&mut self, reset: bool) -> Result<()>;

    /// Add a pedestrian at `pos` metres along `edge`, on `lane`, walking at `speed`.
    fn add(&mut self, ped_id: &str, edge: &str, pos: f64, lane: u32, speed: f64) -> Result<()>;

    /// Next edge on the walking route, crossings and walking areas included.
    ///
    /// Empty when there is no further edge or the person is not walking.
    fn get_next_edge(&self, ped_id: &str) -> String;

    /// Remove all traces of the pedestrian, and remove it from the simulator
    /// if it is still in the network.
    fn remove(&mut self, ped_id: &str) -> Result<()>;

    /// Pedestrians currently in the network.
    fn get_ids(&self) -> Vec<String>;

    fn speed(&self, ped_id: &str) -> Option<f64>;

    /// Position relative to the current edge.
    fn position(&self, ped_id: &str) -> Option<f64>;

    /// Position along the current lane measured in metres from the lane start.
    fn lane_position(&self, ped_id: &str) -> Option<f64>;

    fn edge(&self, ped_id: &str) -> Option<String>;

    /// Set the maximum walking speed in m/s for subsequent steps.
    fn set_speed(&mut self, ped_id: &str, speed: f64) -> Result<()>;

    fn get_speed(&self, ped_id: &str, error: f64) -> f64 {
        self.speed(ped_id).unwrap_or(error)
    }

    fn get_speeds<S: AsRef<str>>(&self, ped_ids: &[S], error: f64) -> Vec<f64> {
        ped_ids.iter().map(|id| self.get_speed(id.as_ref(), error)).collect()
    }

    fn get_position(&self, ped_id: &str, error: f64) -> f64 {
        self.position(ped_id).unwrap_or(error)
    }

    fn get_positions<S: AsRef<str>>(&self, ped_ids: &[S], error: f64) -> Vec<f64> {
        ped_ids.iter().map(|id| self.get_position(id.as_ref(), error)).collect()
    }

    fn get_lane_position(&self, ped_id: &str, error: f64) -> f64 {
        self.lane_position(ped_id).unwrap_or(error)
    }

    fn get_lane_positions<S: AsRef<str>>(&self, ped_ids: &[S], error: f64) -> Vec<f64> {
        ped_ids
            .iter()
            .map(|id| self.get_lane_position(id.as_ref(), error))
            .collect()
    }

    fn get_edge(&self, ped_id: &str, error: &str) -> String {
        self.edge(ped_id).unwrap_or_else(|| error.to_string())
    }

    fn get_edges<S: AsRef<str>>(&self, ped_ids: &[S], error: &str) -> Vec<String> {
        ped_ids.iter().map(|id| self.get_edge(id.as_ref(), error)).collect()
    }
}

/// Per-step snapshot of one pedestrian.
#[derive(Debug, Clone, PartialEq)]
struct PedestrianState {
    edge: String,
    next_edge: Option<String>,
    pos: f64,
    speed: f64,
}

/// Pedestrian kernel backed by [`crate::sim::PointSimulation`].
#[derive(Debug, Default)]
pub struct PointPedestrianKernel {
    api: Option<SimHandle>,
    states: BTreeMap<String, PedestrianState>,
}

impl PointPedestrianKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn api(&self) -> Result<&SimHandle> {
        self.api
            .as_ref()
            .ok_or_else(|| anyhow!("Pedestrian kernel has no simulator API; call pass_api first"))
    }

    pub fn num_pedestrians(&self) -> usize {
        self.states.len()
    }
}

impl KernelPedestrian for PointPedestrianKernel {
    type Api = SimHandle;

    fn pass_api(&mut self, api: SimHandle) {
        self.api = Some(api);
    }

    #[instrument(level = "debug", skip(self))]
    fn update(&mut self, reset: bool) -> Result<()> {
        if reset {
            self.states.clear();
        }
        let sim = self.api()?.lock();

        let mut states = BTreeMap::new();
        for person in sim.persons() {
            states.insert(
                person.id.clone(),
                PedestrianState {
                    edge: person.edge().to_string(),
                    next_edge: person.next_edge().map(str::to_string),
                    pos: person.pos,
                    speed: person.speed,
                },
            );
        }
        drop(sim);

        for id in self.states.keys().filter(|id| !states.contains_key(*id)) {
            debug!(pedestrian = %id, "pedestrian left the network");
        }
        self.states = states;
        Ok(())
    }

    fn add(&mut self, ped_id: &str, edge: &str, pos: f64, lane: u32, speed: f64) -> Result<()> {
        self.api()?
            .lock()
            .add_person(ped_id, edge, pos, lane, speed)
            .with_context(|| format!("Failed to add pedestrian '{}'", ped_id))?;

        let next_edge = self
            .api()?
            .lock()
            .person(ped_id)
            .and_then(|p| p.next_edge().map(str::to_string));
        self.states.insert(
            ped_id.to_string(),
            PedestrianState {
                edge: edge.to_string(),
                next_edge,
                pos,
                speed,
            },
        );
        debug!(pedestrian = %ped_id, edge, pos, lane, speed, "pedestrian added");
        Ok(())
    }

    fn get_next_edge(&self, ped_id: &str) -> String {
        self.states
            .get(ped_id)
            .and_then(|s| s.next_edge.clone())
            .unwrap_or_default()
    }

    fn remove(&mut self, ped_id: &str) -> Result<()> {
        let known = self.states.remove(ped_id).is_some();
        let in_network = self.api()?.lock().remove_person(ped_id);
        if !known && !in_network {
            return Err(anyhow!("Unknown pedestrian '{}'", ped_id));
        }
        if !known {
            warn!(pedestrian = %ped_id, "removed pedestrian missing from the kernel cache");
        }
        Ok(())
    }

    fn get_ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    fn speed(&self, ped_id: &str) -> Option<f64> {
        self.states.get(ped_id).map(|s| s.speed)
    }

    fn position(&self, ped_id: &str) -> Option<f64> {
        self.states.get(ped_id).map(|s| s.pos)
    }

    // Lanes of a point edge start where the edge starts, so both offsets coincide.
    fn lane_position(&self, ped_id: &str) -> Option<f64> {
        self.position(ped_id)
    }

    fn edge(&self, ped_id: &str) -> Option<String> {
        self.states.get(ped_id).map(|s| s.edge.clone())
    }

    fn set_speed(&mut self, ped_id: &str, speed: f64) -> Result<()> {
        self.api()?.lock().set_person_max_speed(ped_id, speed)
    }
}
