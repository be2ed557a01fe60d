//! # qnetsim
//!
//! A discrete-event simulator for quantum communication networks: a
//! virtual-time event kernel drives quantum routers, optical channels,
//! photon sources, detectors, and Bell-state-measurement stations, with a
//! layered protocol stack (resource reservation, entanglement swapping
//! and purification, heralded entanglement generation) per router.
//!
//! Execution is single-threaded cooperative discrete-event: handlers run
//! to completion, apparent asynchrony is a scheduled continuation, and
//! every random draw flows from one seeded generator owned by the
//! timeline, so identical inputs and seed reproduce runs bit for bit.
//!
//! ```
//! use qnetsim::simulation::{Simulation, SECOND};
//!
//! let mut sim = Simulation::new(SECOND, 1);
//! sim.network.add_endpoint("alice").unwrap();
//! sim.network.add_endpoint("bob").unwrap();
//! sim.network.connect_classical("alice", "bob", 1e3, None).unwrap();
//! sim.init().unwrap();
//! sim.run().unwrap();
//! ```

pub mod app;
pub mod components;
pub mod error;
pub mod network;
pub mod protocols;
pub mod quantum;
pub mod report;
pub mod simulation;

pub use error::SimError;
pub use network::{Network, NodeId};
pub use simulation::{Simulation, Time, Timeline, SECOND};
