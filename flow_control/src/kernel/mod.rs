//! Kernel layer between environment code and the simulator.
//!
//! The master [`Kernel`] owns the simulator handle and one sub-kernel per
//! kind of agent. Sub-kernels never point back at the master; anything that
//! needs more than one of them goes through the master.

pub mod pedestrian;
pub mod vehicle;

use anyhow::Result;

use crate::sim::SimHandle;
use pedestrian::KernelPedestrian;
use vehicle::PointVehicleKernel;

pub use pedestrian::{PointPedestrianKernel, PED_NOT_FOUND};

pub struct Kernel<P = PointPedestrianKernel>
where
    P: KernelPedestrian<Api = SimHandle>,
{
    simulation: SimHandle,
    pub vehicle: PointVehicleKernel,
    pub pedestrian: P,
}

impl<P> Kernel<P>
where
    P: KernelPedestrian<Api = SimHandle>,
{
    /// Build the kernel and hand the simulator API to every sub-kernel.
    pub fn new(simulation: SimHandle, mut pedestrian: P) -> Self {
        let mut vehicle = PointVehicleKernel::new();
        vehicle.pass_api(simulation.clone());
        pedestrian.pass_api(simulation.clone());
        Self {
            simulation,
            vehicle,
            pedestrian,
        }
    }

    pub fn simulation(&self) -> &SimHandle {
        &self.simulation
    }

    /// Advance the simulator by one step.
    pub fn simulation_step(&self) {
        self.simulation.lock().step();
    }

    pub fn sim_time(&self) -> f64 {
        self.simulation.lock().time()
    }

    /// Clear all agents from the simulator and the sub-kernel caches.
    pub fn reset(&mut self) -> Result<()> {
        self.simulation.lock().reset();
        self.update(true)
    }

    /// Refresh every sub-kernel from the current simulator state.
    pub fn update(&mut self, reset: bool) -> Result<()> {
        self.vehicle.update(reset)?;
        self.pedestrian.update(reset)
    }
}
