//! Flow control - replay of imitation-learning policies for traffic agents
//!
//! A kernel layer over a simulator backend (vehicles and pedestrians), a
//! multi-agent environment contract, and drivers that run a trained policy
//! against it.

pub mod cli;
pub mod emission;
pub mod env;
pub mod experiment;
pub mod kernel;
pub mod policy;
pub mod replay;
pub mod settings;
pub mod sim;
pub mod telemetry;

pub use env::MultiAgentEnv;
pub use kernel::pedestrian::KernelPedestrian;
pub use policy::Policy;
