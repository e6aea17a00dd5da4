//! Identity-account queries: registered user accounts and power users.
//!
//! The controller only stores credential hashes; password verification
//! happens in the external web tier that mints sessions.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHasher, SaltString};

use super::db::{Database, DatabaseError, unix_timestamp};
use super::models::{PowerUser, UserAccount};
use super::queries_users::{clamp_limit, ensure_user};

/// Argon2id hash for a stored account credential. Length is the caller's
/// concern; anything the hasher itself rejects is an invalid input.
fn credential_hash(password: &str) -> Result<String, DatabaseError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DatabaseError::Invalid(format!("password hashing failed: {e}")))
}

/// Fields required to register a user account.
#[derive(Debug, Clone, Default)]
pub struct NewUserAccount {
    pub username: String,
    pub email: String,
    pub real_name: String,
    pub student_id: String,
    pub advisor: String,
    pub expected_graduation_year: i64,
    pub phone: String,
}

impl Database {
    /// Create a registered user account and seed its billing user at the
    /// default balance, in one transaction.
    pub async fn create_user_account(
        &self,
        account: &NewUserAccount,
        password: &str,
        default_balance: f64,
    ) -> Result<(), DatabaseError> {
        let username = account.username.trim();
        let email = account.email.trim().to_lowercase();
        let student_id = account.student_id.trim();
        if username.is_empty() || email.is_empty() || student_id.is_empty() {
            return Err(DatabaseError::Invalid(
                "username/email/student_id must not be empty".into(),
            ));
        }
        if password.len() < 8 {
            return Err(DatabaseError::Invalid("password must be at least 8 characters".into()));
        }
        let hash = credential_hash(password)?;

        let mut tx = self.pool().begin().await?;

        let (taken,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM user_accounts \
               WHERE username = ? OR email = ? OR student_id = ?)",
        )
        .bind(username)
        .bind(email.as_str())
        .bind(student_id)
        .fetch_one(&mut *tx)
        .await?;
        if taken {
            return Err(DatabaseError::Conflict(
                "an account with this username, email or student id already exists".into(),
            ));
        }

        sqlx::query(
            "INSERT INTO user_accounts \
               (username, email, password_hash, real_name, student_id, advisor, \
                expected_graduation_year, phone, role) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'user')",
        )
        .bind(username)
        .bind(email.as_str())
        .bind(hash)
        .bind(account.real_name.trim())
        .bind(student_id)
        .bind(account.advisor.trim())
        .bind(account.expected_graduation_year)
        .bind(account.phone.trim())
        .execute(&mut *tx)
        .await?;

        ensure_user(&mut *tx, username, default_balance).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_user_account(&self, username: &str) -> Result<UserAccount, DatabaseError> {
        sqlx::query_as::<_, UserAccount>("SELECT * FROM user_accounts WHERE username = ?")
            .bind(username.trim())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("account {username}")))
    }

    /// Create a power user. Errors with conflict when the name is taken.
    pub async fn create_power_user(
        &self,
        username: &str,
        password: &str,
        can_view_board: bool,
        can_view_nodes: bool,
        can_review_requests: bool,
        created_by: &str,
    ) -> Result<(), DatabaseError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DatabaseError::Invalid("username must not be empty".into()));
        }
        if password.len() < 8 {
            return Err(DatabaseError::Invalid("password must be at least 8 characters".into()));
        }
        let created_by = if created_by.trim().is_empty() { "admin" } else { created_by.trim() };
        let hash = credential_hash(password)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO power_users \
               (username, password_hash, can_view_board, can_view_nodes, can_review_requests, \
                created_by, updated_by) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(hash)
        .bind(can_view_board)
        .bind(can_view_nodes)
        .bind(can_review_requests)
        .bind(created_by)
        .bind(created_by)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::Conflict("power user already exists".into()));
        }
        Ok(())
    }

    pub async fn list_power_users(&self, limit: i64) -> Result<Vec<PowerUser>, DatabaseError> {
        let limit = clamp_limit(limit, 1000, 5000);
        let rows = sqlx::query_as::<_, PowerUser>(
            "SELECT * FROM power_users ORDER BY username LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_power_user(&self, username: &str) -> Result<PowerUser, DatabaseError> {
        sqlx::query_as::<_, PowerUser>("SELECT * FROM power_users WHERE username = ?")
            .bind(username.trim())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("power user {username}")))
    }

    pub async fn update_power_user_permissions(
        &self,
        username: &str,
        can_view_board: bool,
        can_view_nodes: bool,
        can_review_requests: bool,
        updated_by: &str,
    ) -> Result<(), DatabaseError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DatabaseError::Invalid("username must not be empty".into()));
        }
        let updated_by = if updated_by.trim().is_empty() { "admin" } else { updated_by.trim() };
        let result = sqlx::query(
            "UPDATE power_users \
             SET can_view_board = ?, can_view_nodes = ?, can_review_requests = ?, \
                 updated_by = ?, updated_at = ? \
             WHERE username = ?",
        )
        .bind(can_view_board)
        .bind(can_view_nodes)
        .bind(can_review_requests)
        .bind(updated_by)
        .bind(unix_timestamp())
        .bind(username)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("power user {username}")));
        }
        Ok(())
    }

    pub async fn delete_power_user(&self, username: &str) -> Result<(), DatabaseError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(DatabaseError::Invalid("username must not be empty".into()));
        }
        let result = sqlx::query("DELETE FROM power_users WHERE username = ?")
            .bind(username)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("power user {username}")));
        }
        Ok(())
    }
}
