//! Shared types for the GPUOPS controller / node-agent pair.
//!
//! Both binaries speak HTTP+JSON; the payload shapes live here so the
//! controller and agent cannot drift apart.

pub mod action;
pub mod report;
pub mod tracing_init;

pub use action::{Action, ActionsResponse};
pub use report::{GpuUsage, MetricReport, ProcessSample, ResolveResponse};
