//! Billing-account queries: implicit creation, debit, recharge.
//!
//! The debit and recharge paths run inside the caller's transaction; SQLite's
//! single-writer transactions serialise concurrent balance updates on the
//! same user, so read-modify-write here is safe.

use sqlx::SqliteConnection;

use crate::billing::status::{UserStatus, status_for_balance};

use super::db::{Database, DatabaseError, unix_timestamp};
use super::models::User;

/// Threshold and debit policy carried into the balance mutators.
#[derive(Debug, Clone, Copy)]
pub struct BillingPolicy {
    pub default_balance: f64,
    pub warning_threshold: f64,
    pub limited_threshold: f64,
    pub dry_run: bool,
}

/// Outcome of a balance mutation: the status before, and the row after.
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub prev_status: UserStatus,
    pub user: User,
}

impl Database {
    /// Get a billing user by name.
    pub async fn get_user(&self, username: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("user {username}")))
    }

    /// List billing users ordered by name.
    pub async fn list_users(&self, limit: i64) -> Result<Vec<User>, DatabaseError> {
        let limit = clamp_limit(limit, 1000, 10_000);
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY username LIMIT ?")
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(users)
    }
}

/// Create the billing user if absent (seeded at the default balance) and
/// return the current row.
pub async fn ensure_user(
    conn: &mut SqliteConnection,
    username: &str,
    default_balance: f64,
) -> Result<User, DatabaseError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(DatabaseError::Invalid("username must not be empty".into()));
    }

    sqlx::query("INSERT OR IGNORE INTO users (username, balance, status) VALUES (?, ?, 'normal')")
        .bind(username)
        .bind(default_balance)
        .execute(&mut *conn)
        .await?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_one(&mut *conn)
        .await?;
    Ok(user)
}

/// Debit `amount` from the user (creating it first if needed), re-derive the
/// status and maintain `blocked_at`: set on first entry into blocked, kept
/// while blocked, cleared on any exit.
pub async fn deduct_balance(
    conn: &mut SqliteConnection,
    username: &str,
    amount: f64,
    now: i64,
    policy: &BillingPolicy,
) -> Result<BalanceUpdate, DatabaseError> {
    let current = ensure_user(conn, username, policy.default_balance).await?;
    let prev_status = UserStatus::parse(&current.status);

    let new_balance = if policy.dry_run {
        current.balance
    } else {
        current.balance - amount
    };
    let new_status =
        status_for_balance(new_balance, policy.warning_threshold, policy.limited_threshold);
    let new_blocked_at = match new_status {
        UserStatus::Blocked => Some(current.blocked_at.unwrap_or(now)),
        _ => None,
    };

    sqlx::query("UPDATE users SET balance = ?, status = ?, blocked_at = ?, updated_at = ? WHERE username = ?")
        .bind(new_balance)
        .bind(new_status.as_str())
        .bind(new_blocked_at)
        .bind(now)
        .bind(current.username.as_str())
        .execute(&mut *conn)
        .await?;

    Ok(BalanceUpdate {
        prev_status,
        user: User {
            balance: new_balance,
            status: new_status.as_str().to_string(),
            blocked_at: new_blocked_at,
            updated_at: now,
            ..current
        },
    })
}

/// Credit `amount` to the user and record the recharge. Recharges apply even
/// in dry-run mode.
pub async fn recharge(
    conn: &mut SqliteConnection,
    username: &str,
    amount: f64,
    method: &str,
    now: i64,
    policy: &BillingPolicy,
) -> Result<BalanceUpdate, DatabaseError> {
    if amount <= 0.0 {
        return Err(DatabaseError::Invalid("amount must be positive".into()));
    }
    let method = method.trim();
    if method.is_empty() {
        return Err(DatabaseError::Invalid("method must not be empty".into()));
    }

    let current = ensure_user(conn, username, policy.default_balance).await?;
    let prev_status = UserStatus::parse(&current.status);

    let new_balance = current.balance + amount;
    let new_status =
        status_for_balance(new_balance, policy.warning_threshold, policy.limited_threshold);
    let new_blocked_at = match new_status {
        UserStatus::Blocked => Some(current.blocked_at.unwrap_or(now)),
        _ => None,
    };

    sqlx::query(
        "UPDATE users SET balance = ?, status = ?, blocked_at = ?, last_charge_time = ?, updated_at = ? \
         WHERE username = ?",
    )
    .bind(new_balance)
    .bind(new_status.as_str())
    .bind(new_blocked_at)
    .bind(now)
    .bind(now)
    .bind(current.username.as_str())
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO recharge_records (username, amount, method, created_at) VALUES (?, ?, ?, ?)")
        .bind(current.username.as_str())
        .bind(amount)
        .bind(method)
        .bind(unix_timestamp())
        .execute(&mut *conn)
        .await?;

    Ok(BalanceUpdate {
        prev_status,
        user: User {
            balance: new_balance,
            status: new_status.as_str().to_string(),
            blocked_at: new_blocked_at,
            last_charge_time: Some(now),
            updated_at: now,
            ..current
        },
    })
}

/// Clamp a caller-supplied limit into (0, max], falling back to `default`.
pub fn clamp_limit(limit: i64, default: i64, max: i64) -> i64 {
    if limit <= 0 || limit > max { default } else { limit }
}
