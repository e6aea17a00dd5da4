//! GPUOPS controller library.
//!
//! Bills per-process resource consumption reported by node agents against
//! per-user balances, derives enforcement statuses, and hands each node the
//! actions it must execute.

pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod metrics;
pub mod outbox;
pub mod pricing;
pub mod server;
pub mod storage;

pub use config::ControllerConfig;
pub use server::{AppState, build_router};
