//! Bind/open request and profile-change workflow queries.

use sqlx::SqliteConnection;

use super::db::{Database, DatabaseError};
use super::models::{ProfileChangeRequest, UserRequest};
use super::queries_registry::upsert_binding;
use super::queries_users::clamp_limit;

/// Create a bind/open request inside the caller's transaction. Returns the
/// new request id.
pub async fn create_user_request(
    conn: &mut SqliteConnection,
    request_type: &str,
    billing_username: &str,
    node_id: &str,
    local_username: &str,
    message: &str,
) -> Result<i64, DatabaseError> {
    let request_type = request_type.trim();
    if request_type != "bind" && request_type != "open" {
        return Err(DatabaseError::Invalid("request_type must be bind or open".into()));
    }
    let billing_username = billing_username.trim();
    let node_id = node_id.trim();
    let local_username = local_username.trim();
    if billing_username.is_empty() || node_id.is_empty() || local_username.is_empty() {
        return Err(DatabaseError::Invalid(
            "billing_username/node_id/local_username must not be empty".into(),
        ));
    }

    let result = sqlx::query(
        "INSERT INTO user_requests \
           (request_type, billing_username, node_id, local_username, message, status) \
         VALUES (?, ?, ?, ?, ?, 'pending')",
    )
    .bind(request_type)
    .bind(billing_username)
    .bind(node_id)
    .bind(local_username)
    .bind(message.trim())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Review a pending bind/open request. Approving a bind request upserts the
/// binding in the same transaction; rejecting only flips the status.
pub async fn review_user_request(
    conn: &mut SqliteConnection,
    request_id: i64,
    new_status: &str,
    reviewed_by: &str,
    now: i64,
) -> Result<UserRequest, DatabaseError> {
    if request_id <= 0 {
        return Err(DatabaseError::Invalid("request_id must be positive".into()));
    }
    let new_status = new_status.trim();
    if new_status != "approved" && new_status != "rejected" {
        return Err(DatabaseError::Invalid("status must be approved or rejected".into()));
    }
    let reviewed_by = if reviewed_by.trim().is_empty() { "admin" } else { reviewed_by.trim() };

    let request = sqlx::query_as::<_, UserRequest>(
        "SELECT * FROM user_requests WHERE request_id = ?",
    )
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("request {request_id}")))?;
    if request.status != "pending" {
        return Err(DatabaseError::Conflict("request was already reviewed".into()));
    }

    sqlx::query(
        "UPDATE user_requests \
         SET status = ?, reviewed_by = ?, reviewed_at = ?, updated_at = ? WHERE request_id = ?",
    )
    .bind(new_status)
    .bind(reviewed_by)
    .bind(now)
    .bind(now)
    .bind(request_id)
    .execute(&mut *conn)
    .await?;

    if new_status == "approved" && request.request_type == "bind" {
        upsert_binding(
            conn,
            &request.node_id,
            &request.local_username,
            &request.billing_username,
        )
        .await?;
    }

    Ok(UserRequest {
        status: new_status.to_string(),
        reviewed_by: Some(reviewed_by.to_string()),
        reviewed_at: Some(now),
        updated_at: now,
        ..request
    })
}

impl Database {
    pub async fn list_user_requests_by_billing(
        &self,
        billing_username: &str,
        limit: i64,
    ) -> Result<Vec<UserRequest>, DatabaseError> {
        let billing_username = billing_username.trim();
        if billing_username.is_empty() {
            return Err(DatabaseError::Invalid("billing_username must not be empty".into()));
        }
        let limit = clamp_limit(limit, 200, 5000);
        let rows = sqlx::query_as::<_, UserRequest>(
            "SELECT * FROM user_requests WHERE billing_username = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(billing_username)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Admin request listing with an optional status filter.
    pub async fn list_user_requests_admin(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<UserRequest>, DatabaseError> {
        let status = status.trim();
        let limit = clamp_limit(limit, 200, 5000);
        let rows = if status.is_empty() {
            sqlx::query_as::<_, UserRequest>(
                "SELECT * FROM user_requests ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, UserRequest>(
                "SELECT * FROM user_requests WHERE status = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };
        Ok(rows)
    }

    /// Create a profile-change request. At most one pending request per
    /// billing user; the old identity triple is snapshotted at creation.
    pub async fn create_profile_change_request(
        &self,
        billing_username: &str,
        new_username: &str,
        new_email: &str,
        new_student_id: &str,
        reason: &str,
    ) -> Result<i64, DatabaseError> {
        let billing_username = billing_username.trim();
        let new_username = new_username.trim();
        let new_email = new_email.trim().to_lowercase();
        let new_student_id = new_student_id.trim();
        let reason = reason.trim();
        if billing_username.is_empty()
            || new_username.is_empty()
            || new_email.is_empty()
            || new_student_id.is_empty()
        {
            return Err(DatabaseError::Invalid(
                "username/email/student_id must not be empty".into(),
            ));
        }
        if reason.is_empty() {
            return Err(DatabaseError::Invalid(
                "a change reason is required for review".into(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        let old: Option<(String, String, String)> = sqlx::query_as(
            "SELECT username, email, student_id FROM user_accounts WHERE username = ?",
        )
        .bind(billing_username)
        .fetch_optional(&mut *tx)
        .await?;
        let (old_username, old_email, old_student_id) = old
            .ok_or_else(|| DatabaseError::NotFound(format!("account {billing_username}")))?;

        let (has_pending,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM profile_change_requests \
               WHERE billing_username = ? AND status = 'pending')",
        )
        .bind(billing_username)
        .fetch_one(&mut *tx)
        .await?;
        if has_pending {
            return Err(DatabaseError::Conflict(
                "a profile change request is already pending review".into(),
            ));
        }

        let result = sqlx::query(
            "INSERT INTO profile_change_requests \
               (billing_username, old_username, old_email, old_student_id, \
                new_username, new_email, new_student_id, reason, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
        )
        .bind(billing_username)
        .bind(old_username)
        .bind(old_email)
        .bind(old_student_id)
        .bind(new_username)
        .bind(new_email)
        .bind(new_student_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_profile_change_requests_by_user(
        &self,
        billing_username: &str,
        limit: i64,
    ) -> Result<Vec<ProfileChangeRequest>, DatabaseError> {
        let billing_username = billing_username.trim();
        if billing_username.is_empty() {
            return Err(DatabaseError::Invalid("billing_username must not be empty".into()));
        }
        let limit = clamp_limit(limit, 200, 1000);
        let rows = sqlx::query_as::<_, ProfileChangeRequest>(
            "SELECT * FROM profile_change_requests WHERE billing_username = ? \
             ORDER BY request_id DESC LIMIT ?",
        )
        .bind(billing_username)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Admin listing, pending requests first.
    pub async fn list_profile_change_requests_admin(
        &self,
        status: &str,
        billing_username: &str,
        limit: i64,
    ) -> Result<Vec<ProfileChangeRequest>, DatabaseError> {
        let status = status.trim();
        let billing_username = billing_username.trim();
        let limit = clamp_limit(limit, 500, 5000);

        let mut sql = String::from("SELECT * FROM profile_change_requests WHERE 1 = 1");
        if !status.is_empty() {
            sql.push_str(" AND status = ?");
        }
        if !billing_username.is_empty() {
            sql.push_str(" AND billing_username = ?");
        }
        sql.push_str(
            " ORDER BY CASE status WHEN 'pending' THEN 0 ELSE 1 END, request_id DESC LIMIT ?",
        );

        let mut query = sqlx::query_as::<_, ProfileChangeRequest>(&sql);
        if !status.is_empty() {
            query = query.bind(status.to_string());
        }
        if !billing_username.is_empty() {
            query = query.bind(billing_username.to_string());
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(rows)
    }
}

/// Review a pending profile-change request.
///
/// Approval re-verifies uniqueness of each changed field, updates the
/// account row, and — when the username changed — rewrites every table that
/// references it (users, usage_records, recharge_records, user_node_accounts,
/// user_requests, profile_change_requests) in the same transaction.
pub async fn review_profile_change_request(
    conn: &mut SqliteConnection,
    request_id: i64,
    new_status: &str,
    reviewed_by: &str,
    now: i64,
) -> Result<ProfileChangeRequest, DatabaseError> {
    if request_id <= 0 {
        return Err(DatabaseError::Invalid("request_id must be positive".into()));
    }
    let new_status = new_status.trim();
    if new_status != "approved" && new_status != "rejected" {
        return Err(DatabaseError::Invalid("status must be approved or rejected".into()));
    }
    let reviewed_by = if reviewed_by.trim().is_empty() { "admin" } else { reviewed_by.trim() };

    let request = sqlx::query_as::<_, ProfileChangeRequest>(
        "SELECT * FROM profile_change_requests WHERE request_id = ?",
    )
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("request {request_id}")))?;
    if request.status != "pending" {
        return Err(DatabaseError::Conflict("request was already reviewed".into()));
    }

    if new_status == "approved" {
        let new_email = request.new_email.trim().to_lowercase();

        if request.new_username.trim() != request.old_username.trim() {
            ensure_free(conn, "username", request.new_username.trim(), "new username already exists").await?;
        }
        if new_email != request.old_email.trim().to_lowercase() {
            ensure_free(conn, "email", &new_email, "new email already exists").await?;
        }
        if request.new_student_id.trim() != request.old_student_id.trim() {
            ensure_free(conn, "student_id", request.new_student_id.trim(), "new student id already exists").await?;
        }

        let result = sqlx::query(
            "UPDATE user_accounts SET username = ?, email = ?, student_id = ?, updated_at = ? \
             WHERE username = ?",
        )
        .bind(request.new_username.trim())
        .bind(new_email.as_str())
        .bind(request.new_student_id.trim())
        .bind(now)
        .bind(request.old_username.trim())
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::Conflict(
                "the original account no longer exists".into(),
            ));
        }

        if request.new_username != request.old_username {
            let cascades = [
                "UPDATE users SET username = ?1 WHERE username = ?2",
                "UPDATE usage_records SET username = ?1 WHERE username = ?2",
                "UPDATE recharge_records SET username = ?1 WHERE username = ?2",
                "UPDATE user_node_accounts SET billing_username = ?1 WHERE billing_username = ?2",
                "UPDATE user_requests SET billing_username = ?1 WHERE billing_username = ?2",
                "UPDATE profile_change_requests SET billing_username = ?1 WHERE billing_username = ?2",
            ];
            for sql in cascades {
                sqlx::query(sql)
                    .bind(request.new_username.trim())
                    .bind(request.old_username.trim())
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }

    sqlx::query(
        "UPDATE profile_change_requests \
         SET status = ?, reviewed_by = ?, reviewed_at = ?, updated_at = ? WHERE request_id = ?",
    )
    .bind(new_status)
    .bind(reviewed_by)
    .bind(now)
    .bind(now)
    .bind(request_id)
    .execute(&mut *conn)
    .await?;

    let updated = sqlx::query_as::<_, ProfileChangeRequest>(
        "SELECT * FROM profile_change_requests WHERE request_id = ?",
    )
    .bind(request_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(updated)
}

async fn ensure_free(
    conn: &mut SqliteConnection,
    column: &str,
    value: &str,
    conflict_msg: &str,
) -> Result<(), DatabaseError> {
    let sql = format!("SELECT EXISTS (SELECT 1 FROM user_accounts WHERE {column} = ?)");
    let (exists,): (bool,) = sqlx::query_as(&sql).bind(value).fetch_one(&mut *conn).await?;
    if exists {
        return Err(DatabaseError::Conflict(conflict_msg.into()));
    }
    Ok(())
}
