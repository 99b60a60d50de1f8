//! Coordinator internals: metadata store, queue routes, reaper and
//! sweeper loops. The `scribad` binary wires these together; tests
//! drive them directly.

pub mod reaper;
pub mod routes;
pub mod store;
pub mod sweeper;
