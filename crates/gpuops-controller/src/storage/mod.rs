//! Storage layer for the GPUOPS controller.

pub mod db;
pub mod models;
pub mod queries_accounts;
pub mod queries_registry;
pub mod queries_reports;
pub mod queries_requests;
pub mod queries_usage;
pub mod queries_users;

#[cfg(test)]
mod tests;

pub use db::{Database, DatabaseError, unix_timestamp};
pub use models::{
    NodeStatus, PowerUser, PriceRow, ProfileChangeRequest, RechargeRecord, SshListEntry,
    UsageRecord, User, UserAccount, UserNodeAccount, UserRequest,
};
pub use queries_accounts::NewUserAccount;
pub use queries_registry::{Resolution, SshList, WILDCARD_NODE};
pub use queries_reports::NodeStatusUpdate;
pub use queries_users::{BalanceUpdate, BillingPolicy};
