//! In-process point simulation used as the reference simulator backend.
//!
//! Agents are points moving along edges. There is no car following, lane
//! changing or collision handling; the kernels only need positions, speeds
//! and routes.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Shared handle passed to every sub-kernel through `pass_api`.
pub type SimHandle = Arc<Mutex<PointSimulation>>;

/// Default comfortable acceleration of vehicles without a command, in m/s^2.
const DEFAULT_ACCEL: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub length: f64,
    pub lanes: u32,
    pub successor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
    pub route: Vec<String>,
    pub route_index: usize,
    pub pos: f64,
    pub lane: u32,
    pub speed: f64,
    pub max_speed: f64,
}

impl Person {
    pub fn edge(&self) -> &str {
        &self.route[self.route_index]
    }

    pub fn next_edge(&self) -> Option<&str> {
        self.route.get(self.route_index + 1).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Vehicle {
    pub id: String,
    pub edge: String,
    pub pos: f64,
    pub speed: f64,
    pub max_speed: f64,
    pub max_accel: f64,
    pub max_decel: f64,
    pub rl: bool,
    pub(crate) commanded_accel: Option<f64>,
}

impl Vehicle {
    pub fn new(id: impl Into<String>, edge: impl Into<String>, pos: f64, speed: f64, rl: bool) -> Self {
        Self {
            id: id.into(),
            edge: edge.into(),
            pos,
            speed,
            max_speed: 15.0,
            max_accel: 3.0,
            max_decel: 3.0,
            rl,
            commanded_accel: None,
        }
    }
}

#[derive(Debug)]
pub struct PointSimulation {
    sim_step: f64,
    time: f64,
    edges: HashMap<String, Edge>,
    persons: BTreeMap<String, Person>,
    vehicles: BTreeMap<String, Vehicle>,
}

impl PointSimulation {
    pub fn new(sim_step: f64) -> Self {
        Self {
            sim_step,
            time: 0.0,
            edges: HashMap::new(),
            persons: BTreeMap::new(),
            vehicles: BTreeMap::new(),
        }
    }

    pub fn into_handle(self) -> SimHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn sim_step(&self) -> f64 {
        self.sim_step
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn add_edge(&mut self, id: &str, length: f64, lanes: u32, successor: Option<&str>) {
        self.edges.insert(
            id.to_string(),
            Edge {
                id: id.to_string(),
                length,
                lanes,
                successor: successor.map(str::to_string),
            },
        );
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Remove every agent and rewind the clock. The network is kept.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.persons.clear();
        self.vehicles.clear();
    }

    // --- persons ---

    /// Insert a person whose route follows edge successors from `edge`.
    pub fn add_person(&mut self, id: &str, edge: &str, pos: f64, lane: u32, speed: f64) -> Result<()> {
        if self.persons.contains_key(id) {
            return Err(anyhow!("Person '{}' already exists", id));
        }
        let start = self
            .edges
            .get(edge)
            .ok_or_else(|| anyhow!("Unknown edge '{}'", edge))?;
        if lane >= start.lanes {
            return Err(anyhow!("Edge '{}' has no lane {}", edge, lane));
        }
        if !(0.0..=start.length).contains(&pos) {
            return Err(anyhow!("Position {} is outside edge '{}'", pos, edge));
        }

        let mut route = vec![edge.to_string()];
        let mut current = start;
        while let Some(next) = current.successor.as_deref() {
            if route.iter().any(|e| e == next) {
                break;
            }
            current = self
                .edges
                .get(next)
                .ok_or_else(|| anyhow!("Edge '{}' has unknown successor '{}'", current.id, next))?;
            route.push(next.to_string());
        }

        self.persons.insert(
            id.to_string(),
            Person {
                id: id.to_string(),
                route,
                route_index: 0,
                pos,
                lane,
                speed,
                max_speed: speed.max(0.0),
            },
        );
        Ok(())
    }

    pub fn remove_person(&mut self, id: &str) -> bool {
        self.persons.remove(id).is_some()
    }

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.persons.get(id)
    }

    pub fn persons(&self) -> impl Iterator<Item = &Person> {
        self.persons.values()
    }

    pub fn set_person_max_speed(&mut self, id: &str, speed: f64) -> Result<()> {
        let person = self
            .persons
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown person '{}'", id))?;
        person.max_speed = speed.max(0.0);
        Ok(())
    }

    // --- vehicles ---

    pub fn add_vehicle(&mut self, vehicle: Vehicle) -> Result<()> {
        if !self.edges.contains_key(&vehicle.edge) {
            return Err(anyhow!("Unknown edge '{}'", vehicle.edge));
        }
        if self.vehicles.contains_key(&vehicle.id) {
            return Err(anyhow!("Vehicle '{}' already exists", vehicle.id));
        }
        self.vehicles.insert(vehicle.id.clone(), vehicle);
        Ok(())
    }

    pub fn vehicle(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.get(id)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    /// Command an acceleration for the next step only.
    pub fn apply_acceleration(&mut self, id: &str, accel: f64) -> Result<()> {
        let vehicle = self
            .vehicles
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown vehicle '{}'", id))?;
        vehicle.commanded_accel = Some(accel);
        Ok(())
    }

    /// Advance the simulation by one `sim_step`.
    pub fn step(&mut self) {
        let dt = self.sim_step;
        self.time += dt;

        let mut arrived = Vec::new();
        for vehicle in self.vehicles.values_mut() {
            let accel = vehicle
                .commanded_accel
                .take()
                .unwrap_or(DEFAULT_ACCEL)
                .clamp(-vehicle.max_decel, vehicle.max_accel);
            vehicle.speed = (vehicle.speed + accel * dt).clamp(0.0, vehicle.max_speed);
            vehicle.pos += vehicle.speed * dt;

            let length = self.edges.get(&vehicle.edge).map_or(0.0, |e| e.length);
            if vehicle.pos >= length {
                arrived.push(vehicle.id.clone());
            }
        }
        for id in arrived {
            debug!(vehicle = %id, time = self.time, "vehicle arrived");
            self.vehicles.remove(&id);
        }

        let mut arrived = Vec::new();
        for person in self.persons.values_mut() {
            person.speed = person.max_speed;
            person.pos += person.speed * dt;
            loop {
                let length = self.edges.get(person.edge()).map_or(0.0, |e| e.length);
                if person.pos < length {
                    break;
                }
                if person.next_edge().is_none() {
                    arrived.push(person.id.clone());
                    break;
                }
                person.pos -= length;
                person.route_index += 1;
                person.lane = 0;
            }
        }
        for id in arrived {
            debug!(person = %id, time = self.time, "person arrived");
            self.persons.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walkway() -> PointSimulation {
        let mut sim = PointSimulation::new(1.0);
        sim.add_edge("a", 10.0, 1, Some("b"));
        sim.add_edge("b", 4.0, 1, None);
        sim.add_edge("road", 50.0, 1, None);
        sim
    }

    #[test]
    fn test_person_route_follows_successors() {
        let mut sim = walkway();
        sim.add_person("p0", "a", 0.0, 0, 1.0).unwrap();

        let person = sim.person("p0").unwrap();
        assert_eq!(person.route, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(person.next_edge(), Some("b"));
    }

    #[test]
    fn test_person_moves_to_next_edge_and_arrives() {
        let mut sim = walkway();
        sim.add_person("p0", "a", 9.0, 0, 2.0).unwrap();

        sim.step();
        let person = sim.person("p0").unwrap();
        assert_eq!(person.edge(), "b");
        assert!((person.pos - 1.0).abs() < 1e-9);

        sim.step();
        sim.step();
        assert!(sim.person("p0").is_none());
    }

    #[test]
    fn test_add_person_rejects_bad_input() {
        let mut sim = walkway();
        assert!(sim.add_person("p0", "missing", 0.0, 0, 1.0).is_err());
        assert!(sim.add_person("p0", "a", 11.0, 0, 1.0).is_err());
        assert!(sim.add_person("p0", "a", 0.0, 3, 1.0).is_err());
        sim.add_person("p0", "a", 0.0, 0, 1.0).unwrap();
        assert!(sim.add_person("p0", "a", 0.0, 0, 1.0).is_err());
    }

    #[test]
    fn test_commanded_acceleration_lasts_one_step() {
        let mut sim = walkway();
        sim.add_vehicle(Vehicle::new("rl_0", "road", 0.0, 5.0, true)).unwrap();

        sim.apply_acceleration("rl_0", -10.0).unwrap();
        sim.step();
        // clamped to max_decel
        assert!((sim.vehicle("rl_0").unwrap().speed - 2.0).abs() < 1e-9);

        sim.step();
        assert!((sim.vehicle("rl_0").unwrap().speed - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_network() {
        let mut sim = walkway();
        sim.add_vehicle(Vehicle::new("v", "road", 0.0, 0.0, false)).unwrap();
        sim.step();
        sim.reset();

        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.vehicles().count(), 0);
        assert!(sim.edge("road").is_some());
    }
}
