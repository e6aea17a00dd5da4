//! Usage-record queries.

use gpuops_core::report::ProcessSample;
use sqlx::SqliteConnection;

use super::db::{Database, DatabaseError};
use super::models::UsageRecord;
use super::queries_users::clamp_limit;

/// Maximum stored command length; longer command lines are cut at ingest.
pub const MAX_COMMAND_LEN: usize = 256;

/// Insert one billed observation. `billing_username` must be the identity
/// resolved at ingest time; it is never rewritten except by the profile
/// rename cascade.
pub async fn insert_usage_record(
    conn: &mut SqliteConnection,
    node_id: &str,
    local_username: &str,
    billing_username: &str,
    timestamp: i64,
    proc: &ProcessSample,
    cost: f64,
) -> Result<(), DatabaseError> {
    // CPU-only records keep an empty array so the column is always a JSON
    // array, never null.
    let gpu_json = serde_json::to_string(&proc.gpu_usage)
        .map_err(|e| DatabaseError::Invalid(format!("gpu_usage serialization: {e}")))?;

    let local_username = local_username.trim();
    let local_username = if local_username.is_empty() {
        proc.username.trim()
    } else {
        local_username
    };

    let mut command = proc.command.trim().to_string();
    if command.len() > MAX_COMMAND_LEN {
        let mut cut = MAX_COMMAND_LEN;
        while !command.is_char_boundary(cut) {
            cut -= 1;
        }
        command.truncate(cut);
    }

    sqlx::query(
        "INSERT INTO usage_records \
           (node_id, local_username, username, timestamp, pid, cpu_percent, memory_mb, \
            gpu_count, command, gpu_usage, cost) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(node_id)
    .bind(local_username)
    .bind(billing_username)
    .bind(timestamp)
    .bind(proc.pid)
    .bind(proc.cpu_percent)
    .bind(proc.memory_mb)
    .bind(proc.gpu_usage.len() as i64)
    .bind(command)
    .bind(gpu_json)
    .bind(cost)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Database {
    /// Usage records for one billing user, newest first.
    pub async fn list_usage_by_user(
        &self,
        username: &str,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, DatabaseError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DatabaseError::Invalid("username must not be empty".into()));
        }
        let limit = clamp_limit(limit, 200, 5000);
        let rows = sqlx::query_as::<_, UsageRecord>(
            "SELECT * FROM usage_records WHERE username = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(username)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Admin usage listing with optional billing / local filters, and a flag
    /// to show only records whose billing user has no registered identity.
    pub async fn list_usage_admin(
        &self,
        billing_username: &str,
        local_username: &str,
        unregistered_only: bool,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, DatabaseError> {
        let limit = clamp_limit(limit, 200, 5000);

        let mut sql = String::from("SELECT * FROM usage_records WHERE 1 = 1");
        if !billing_username.trim().is_empty() {
            sql.push_str(" AND username = ?");
        }
        if !local_username.trim().is_empty() {
            sql.push_str(" AND local_username = ?");
        }
        if unregistered_only {
            sql.push_str(
                " AND NOT (\
                   EXISTS (SELECT 1 FROM user_accounts ua WHERE ua.username = usage_records.username) \
                   OR EXISTS (SELECT 1 FROM power_users pu WHERE pu.username = usage_records.username))",
            );
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, UsageRecord>(&sql);
        if !billing_username.trim().is_empty() {
            query = query.bind(billing_username.trim().to_string());
        }
        if !local_username.trim().is_empty() {
            query = query.bind(local_username.trim().to_string());
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(rows)
    }

    /// Whether the billing username belongs to a registered identity.
    pub async fn is_registered_identity(&self, username: &str) -> Result<bool, DatabaseError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM user_accounts WHERE username = ?1) \
                 OR EXISTS (SELECT 1 FROM power_users WHERE username = ?1)",
        )
        .bind(username)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }
}
