//! Identity registry queries: node-account bindings and the three SSH lists.
//!
//! The node id `"*"` is a reserved wildcard meaning "all nodes". Lookups on
//! SSH lists union the node-specific row and the `"*"` row; bindings never
//! contain the wildcard.

use sqlx::SqliteConnection;

use super::db::{Database, DatabaseError, unix_timestamp};
use super::models::{SshListEntry, UserNodeAccount};
use super::queries_users::clamp_limit;

/// Reserved node id that matches every node in SSH-list lookups.
pub const WILDCARD_NODE: &str = "*";

/// Which SSH list a call operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshList {
    Whitelist,
    Blacklist,
    Exemption,
}

impl SshList {
    const fn table(self) -> &'static str {
        match self {
            Self::Whitelist => "ssh_whitelist",
            Self::Blacklist => "ssh_blacklist",
            Self::Exemption => "ssh_exemptions",
        }
    }
}

/// Result of resolving a (node, local user) pair. First match wins in the
/// order the variants are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Exempted,
    Blacklisted,
    Bound(String),
    Whitelisted,
    Unknown,
}

fn require_pair(node_id: &str, local_username: &str) -> Result<(), DatabaseError> {
    if node_id.trim().is_empty() || local_username.trim().is_empty() {
        return Err(DatabaseError::Invalid(
            "node_id/local_username must not be empty".into(),
        ));
    }
    Ok(())
}

/// Billing username bound to (node, local), if any. Used on the billing hot
/// path inside the report transaction.
pub async fn resolve_billing_username(
    conn: &mut SqliteConnection,
    node_id: &str,
    local_username: &str,
) -> Result<Option<String>, DatabaseError> {
    require_pair(node_id, local_username)?;
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT billing_username FROM user_node_accounts WHERE node_id = ? AND local_username = ?",
    )
    .bind(node_id.trim())
    .bind(local_username.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(billing,)| billing))
}

/// Insert or update a binding inside the caller's transaction.
pub async fn upsert_binding(
    conn: &mut SqliteConnection,
    node_id: &str,
    local_username: &str,
    billing_username: &str,
) -> Result<(), DatabaseError> {
    let node_id = node_id.trim();
    let local_username = local_username.trim();
    let billing_username = billing_username.trim();
    if node_id.is_empty() || local_username.is_empty() || billing_username.is_empty() {
        return Err(DatabaseError::Invalid(
            "node_id/local_username/billing_username must not be empty".into(),
        ));
    }
    if node_id == WILDCARD_NODE {
        return Err(DatabaseError::Invalid(
            "the wildcard node is reserved for SSH lists, not bindings".into(),
        ));
    }
    sqlx::query(
        "INSERT INTO user_node_accounts (node_id, local_username, billing_username, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (node_id, local_username) DO UPDATE SET \
           billing_username = excluded.billing_username, updated_at = excluded.updated_at",
    )
    .bind(node_id)
    .bind(local_username)
    .bind(billing_username)
    .bind(unix_timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Database {
    /// Insert or update a binding.
    pub async fn upsert_user_node_account(
        &self,
        node_id: &str,
        local_username: &str,
        billing_username: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        upsert_binding(&mut *tx, node_id, local_username, billing_username).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a binding; errors with not-found when no row matched.
    pub async fn delete_user_node_account(
        &self,
        node_id: &str,
        local_username: &str,
        billing_username: &str,
    ) -> Result<(), DatabaseError> {
        require_pair(node_id, local_username)?;
        let result = sqlx::query(
            "DELETE FROM user_node_accounts \
             WHERE node_id = ? AND local_username = ? AND billing_username = ?",
        )
        .bind(node_id.trim())
        .bind(local_username.trim())
        .bind(billing_username.trim())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound("binding not found".into()));
        }
        Ok(())
    }

    /// Move a binding to a new (node, local, billing) triple in one
    /// transaction. The old row must exist.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_user_node_account(
        &self,
        old_node_id: &str,
        old_local_username: &str,
        old_billing_username: &str,
        new_node_id: &str,
        new_local_username: &str,
        new_billing_username: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "DELETE FROM user_node_accounts \
             WHERE node_id = ? AND local_username = ? AND billing_username = ?",
        )
        .bind(old_node_id.trim())
        .bind(old_local_username.trim())
        .bind(old_billing_username.trim())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound("binding not found".into()));
        }
        upsert_binding(&mut *tx, new_node_id, new_local_username, new_billing_username).await?;
        tx.commit().await?;
        Ok(())
    }

    /// List bindings, optionally filtered by billing user.
    pub async fn list_user_node_accounts(
        &self,
        billing_username: &str,
        limit: i64,
    ) -> Result<Vec<UserNodeAccount>, DatabaseError> {
        let limit = clamp_limit(limit, 5000, 20_000);
        let rows = if billing_username.trim().is_empty() {
            sqlx::query_as::<_, UserNodeAccount>(
                "SELECT * FROM user_node_accounts \
                 ORDER BY billing_username, node_id, local_username LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, UserNodeAccount>(
                "SELECT * FROM user_node_accounts WHERE billing_username = ? \
                 ORDER BY node_id, local_username LIMIT ?",
            )
            .bind(billing_username.trim())
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };
        Ok(rows)
    }

    /// Membership check with wildcard union.
    pub async fn is_listed(
        &self,
        list: SshList,
        node_id: &str,
        local_username: &str,
    ) -> Result<bool, DatabaseError> {
        require_pair(node_id, local_username)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE local_username = ? AND (node_id = ? OR node_id = '*'))",
            list.table()
        );
        let (exists,): (bool,) = sqlx::query_as(&sql)
            .bind(local_username.trim())
            .bind(node_id.trim())
            .fetch_one(self.pool())
            .await?;
        Ok(exists)
    }

    /// List entries. An empty node filter lists everything; `"*"` lists only
    /// wildcard rows; a node id lists the node's rows unioned with `"*"`,
    /// wildcard rows first.
    pub async fn list_ssh_entries(
        &self,
        list: SshList,
        node_id: &str,
        limit: i64,
    ) -> Result<Vec<SshListEntry>, DatabaseError> {
        let node_id = node_id.trim();
        let limit = clamp_limit(limit, 1000, 200_000);
        let table = list.table();
        let rows = if node_id.is_empty() {
            sqlx::query_as::<_, SshListEntry>(&format!(
                "SELECT * FROM {table} ORDER BY node_id, local_username LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else if node_id == WILDCARD_NODE {
            sqlx::query_as::<_, SshListEntry>(&format!(
                "SELECT * FROM {table} WHERE node_id = '*' ORDER BY local_username LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, SshListEntry>(&format!(
                "SELECT * FROM {table} WHERE node_id = ? OR node_id = '*' \
                 ORDER BY CASE WHEN node_id = '*' THEN 0 ELSE 1 END, local_username LIMIT ?"
            ))
            .bind(node_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };
        Ok(rows)
    }

    /// Upsert a batch of local usernames onto one node's list.
    pub async fn upsert_ssh_entries(
        &self,
        list: SshList,
        node_id: &str,
        usernames: &[String],
        created_by: &str,
    ) -> Result<(), DatabaseError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(DatabaseError::Invalid("node_id must not be empty".into()));
        }
        if usernames.iter().all(|u| u.trim().is_empty()) {
            return Err(DatabaseError::Invalid("usernames must not be empty".into()));
        }
        let created_by = if created_by.trim().is_empty() { "admin" } else { created_by.trim() };

        let sql = format!(
            "INSERT INTO {} (node_id, local_username, created_by, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (node_id, local_username) DO UPDATE SET \
               created_by = excluded.created_by, updated_at = excluded.updated_at",
            list.table()
        );
        let mut tx = self.pool().begin().await?;
        for username in usernames {
            let username = username.trim();
            if username.is_empty() {
                continue;
            }
            sqlx::query(&sql)
                .bind(node_id)
                .bind(username)
                .bind(created_by)
                .bind(unix_timestamp())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete a list entry and return the node ids that effectively lost the
    /// user (for kick enqueueing).
    ///
    /// Deleting a node-scoped row also removes the `"*"` row for the same
    /// local user, so a node-level removal never leaves the user globally
    /// allowed. Deleting the `"*"` row touches only the wildcard.
    pub async fn delete_ssh_entry_with_nodes(
        &self,
        list: SshList,
        node_id: &str,
        local_username: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        require_pair(node_id, local_username)?;
        let node_id = node_id.trim();
        let local_username = local_username.trim();
        let table = list.table();

        let mut affected = vec![node_id.to_string()];
        let result = if node_id == WILDCARD_NODE {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE node_id = '*' AND local_username = ?"
            ))
            .bind(local_username)
            .execute(self.pool())
            .await?
        } else {
            let (has_global,): (bool,) = sqlx::query_as(&format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE node_id = '*' AND local_username = ?)"
            ))
            .bind(local_username)
            .fetch_one(self.pool())
            .await?;
            if has_global {
                affected.push(WILDCARD_NODE.to_string());
            }
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE local_username = ? AND (node_id = ? OR node_id = '*')"
            ))
            .bind(local_username)
            .bind(node_id)
            .execute(self.pool())
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound("list entry not found".into()));
        }
        affected.sort();
        affected.dedup();
        Ok(affected)
    }

    /// Local users allowed to log in on the node: bindings plus whitelist
    /// (wildcard included). Consumed by the node's PAM hook.
    pub async fn list_allowed_local_users(
        &self,
        node_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(DatabaseError::Invalid("node_id must not be empty".into()));
        }
        let limit = clamp_limit(limit, 50_000, 200_000);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT local_username FROM ( \
               SELECT local_username FROM user_node_accounts WHERE node_id = ?1 \
               UNION ALL \
               SELECT local_username FROM ssh_whitelist WHERE node_id = ?1 OR node_id = '*' \
             ) ORDER BY local_username LIMIT ?2",
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    /// Local users denied SSH on the node (blacklist, wildcard included).
    pub async fn list_denied_local_users(
        &self,
        node_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        self.list_local_users_of(SshList::Blacklist, node_id, limit).await
    }

    /// Local users exempt from enforcement on the node.
    pub async fn list_exempt_local_users(
        &self,
        node_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        self.list_local_users_of(SshList::Exemption, node_id, limit).await
    }

    async fn list_local_users_of(
        &self,
        list: SshList,
        node_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(DatabaseError::Invalid("node_id must not be empty".into()));
        }
        let limit = clamp_limit(limit, 50_000, 200_000);
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT local_username FROM {} WHERE node_id = ? OR node_id = '*' \
             ORDER BY local_username LIMIT ?",
            list.table()
        ))
        .bind(node_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    /// Full resolution for (node, local): exemption, then blacklist, then
    /// binding, then whitelist, else unknown.
    pub async fn resolve_identity(
        &self,
        node_id: &str,
        local_username: &str,
    ) -> Result<Resolution, DatabaseError> {
        if self.is_listed(SshList::Exemption, node_id, local_username).await? {
            return Ok(Resolution::Exempted);
        }
        if self.is_listed(SshList::Blacklist, node_id, local_username).await? {
            return Ok(Resolution::Blacklisted);
        }
        let mut conn = self.pool().acquire().await?;
        if let Some(billing) = resolve_billing_username(&mut conn, node_id, local_username).await? {
            if !billing.trim().is_empty() {
                return Ok(Resolution::Bound(billing));
            }
        }
        drop(conn);
        if self.is_listed(SshList::Whitelist, node_id, local_username).await? {
            return Ok(Resolution::Whitelisted);
        }
        Ok(Resolution::Unknown)
    }
}
