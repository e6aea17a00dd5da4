//! GPUOPS node agent library.
//!
//! Collects per-process CPU/GPU/network/SSH samples, ships them to the
//! controller, and executes the enforcement actions it gets back.

pub mod client;
pub mod collector;
pub mod executor;
