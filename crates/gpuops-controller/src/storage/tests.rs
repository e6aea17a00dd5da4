//! Storage layer tests against an in-memory database.

use gpuops_core::report::{GpuUsage, ProcessSample};

use crate::billing::status::UserStatus;

use super::db::Database;
use super::queries_registry::{self, Resolution, SshList};
use super::queries_reports::{self, NodeStatusUpdate};
use super::queries_requests;
use super::queries_usage;
use super::queries_users::{self, BillingPolicy};
use super::{DatabaseError, NewUserAccount};

async fn test_db() -> Database {
    Database::open_in_memory().await.unwrap()
}

fn policy() -> BillingPolicy {
    BillingPolicy {
        default_balance: 10.0,
        warning_threshold: 5.0,
        limited_threshold: 1.0,
        dry_run: false,
    }
}

// === Users and balances ===

#[tokio::test]
async fn ensure_user_is_idempotent() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let first = queries_users::ensure_user(&mut conn, "alice", 10.0).await.unwrap();
    assert_eq!(first.balance, 10.0);
    assert_eq!(first.status, "normal");

    // A second sight must not reseed the balance.
    queries_users::deduct_balance(&mut conn, "alice", 3.0, 100, &policy()).await.unwrap();
    let again = queries_users::ensure_user(&mut conn, "alice", 10.0).await.unwrap();
    assert_eq!(again.balance, 7.0);
}

#[tokio::test]
async fn deduct_derives_status_and_blocked_at() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    // 10 -> 4: warning.
    let update = queries_users::deduct_balance(&mut conn, "bob", 6.0, 100, &policy()).await.unwrap();
    assert_eq!(update.prev_status, UserStatus::Normal);
    assert_eq!(update.user.status, "warning");
    assert!(update.user.blocked_at.is_none());

    // 4 -> -1: blocked, blocked_at set to now.
    let update = queries_users::deduct_balance(&mut conn, "bob", 5.0, 200, &policy()).await.unwrap();
    assert_eq!(update.prev_status, UserStatus::Warning);
    assert_eq!(update.user.status, "blocked");
    assert_eq!(update.user.blocked_at, Some(200));

    // Staying blocked keeps the original blocked_at.
    let update = queries_users::deduct_balance(&mut conn, "bob", 1.0, 300, &policy()).await.unwrap();
    assert_eq!(update.user.blocked_at, Some(200));

    // Recharge out of blocked clears blocked_at atomically with the status.
    let update =
        queries_users::recharge(&mut conn, "bob", 50.0, "bank", 400, &policy()).await.unwrap();
    assert_eq!(update.prev_status, UserStatus::Blocked);
    assert_eq!(update.user.status, "normal");
    assert!(update.user.blocked_at.is_none());
}

#[tokio::test]
async fn dry_run_skips_the_debit() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();
    let dry = BillingPolicy { dry_run: true, ..policy() };

    let update = queries_users::deduct_balance(&mut conn, "carol", 100.0, 100, &dry).await.unwrap();
    assert_eq!(update.user.balance, 10.0);
    assert_eq!(update.user.status, "normal");
}

#[tokio::test]
async fn recharge_validates_input_and_records() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let err = queries_users::recharge(&mut conn, "dave", 0.0, "bank", 100, &policy()).await;
    assert!(matches!(err, Err(DatabaseError::Invalid(_))));
    let err = queries_users::recharge(&mut conn, "dave", 5.0, " ", 100, &policy()).await;
    assert!(matches!(err, Err(DatabaseError::Invalid(_))));

    queries_users::recharge(&mut conn, "dave", 5.0, "bank", 100, &policy()).await.unwrap();
    let (count, total): (i64, f64) = sqlx::query_as(
        "SELECT COUNT(1), COALESCE(SUM(amount), 0) FROM recharge_records WHERE username = 'dave'",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(total, 5.0);
}

// === Report ledger ===

#[tokio::test]
async fn report_admission_is_idempotent() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    assert!(queries_reports::try_insert_report(&mut conn, "r-1", "n1", 100, 60).await.unwrap());
    assert!(!queries_reports::try_insert_report(&mut conn, "r-1", "n1", 100, 60).await.unwrap());
    // Same node, different id: admitted.
    assert!(queries_reports::try_insert_report(&mut conn, "r-2", "n1", 160, 60).await.unwrap());
}

#[tokio::test]
async fn node_status_rolls_monthly_traffic() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let base = NodeStatusUpdate {
        node_id: "n1".into(),
        last_seen_at: 100,
        report_id: "r-1".into(),
        report_ts: 100,
        interval_seconds: 60,
        net_rx_bytes: 10 * 1024 * 1024,
        net_tx_bytes: 0,
        month: "2026-07".into(),
        ..Default::default()
    };
    queries_reports::upsert_node_status(&mut conn, &base).await.unwrap();

    // First sight counts from zero.
    let node = db.get_node_status("n1").await.unwrap();
    assert_eq!(node.net_rx_mb_month, 10.0);

    // Delta within the same month accumulates.
    let more = NodeStatusUpdate {
        report_id: "r-2".into(),
        net_rx_bytes: 15 * 1024 * 1024,
        ..base.clone()
    };
    queries_reports::upsert_node_status(&mut conn, &more).await.unwrap();
    assert_eq!(db.get_node_status("n1").await.unwrap().net_rx_mb_month, 15.0);

    // Counter reset contributes zero, not a negative delta.
    let reset = NodeStatusUpdate {
        report_id: "r-3".into(),
        net_rx_bytes: 2 * 1024 * 1024,
        ..base.clone()
    };
    queries_reports::upsert_node_status(&mut conn, &reset).await.unwrap();
    assert_eq!(db.get_node_status("n1").await.unwrap().net_rx_mb_month, 15.0);

    // New month zeroes before adding the delta.
    let next_month = NodeStatusUpdate {
        report_id: "r-4".into(),
        net_rx_bytes: 5 * 1024 * 1024,
        month: "2026-08".into(),
        ..base.clone()
    };
    queries_reports::upsert_node_status(&mut conn, &next_month).await.unwrap();
    let node = db.get_node_status("n1").await.unwrap();
    assert_eq!(node.traffic_month, "2026-08");
    assert_eq!(node.net_rx_mb_month, 3.0);
}

// === Usage records ===

#[tokio::test]
async fn usage_record_truncates_command_and_keeps_gpu_array() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let proc = ProcessSample {
        username: "alice".into(),
        pid: 42,
        cpu_percent: 50.0,
        memory_mb: 128.0,
        command: "x".repeat(500),
        gpu_usage: vec![GpuUsage {
            gpu_index: 0,
            model: "A100".into(),
            utilization: 0.5,
            memory_mb: 1024.0,
        }],
    };
    queries_usage::insert_usage_record(&mut conn, "n1", "alice", "alice", 100, &proc, 1.5)
        .await
        .unwrap();

    let records = db.list_usage_by_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].command.len(), 256);
    assert_eq!(records[0].gpu_count, 1);
    let parsed: Vec<GpuUsage> = serde_json::from_str(&records[0].gpu_usage).unwrap();
    assert_eq!(parsed[0].model, "A100");

    // CPU-only records store an empty array, never null.
    let cpu_only = ProcessSample {
        username: "alice".into(),
        pid: 43,
        cpu_percent: 10.0,
        gpu_usage: Vec::new(),
        ..Default::default()
    };
    queries_usage::insert_usage_record(&mut conn, "n1", "alice", "alice", 100, &cpu_only, 0.1)
        .await
        .unwrap();
    let records = db.list_usage_by_user("alice", 10).await.unwrap();
    let row = records.iter().find(|r| r.pid == 43).unwrap();
    assert_eq!(row.gpu_usage, "[]");
}

// === Bindings and resolution ===

#[tokio::test]
async fn resolution_order_is_exemption_blacklist_binding_whitelist() {
    let db = test_db().await;

    db.upsert_user_node_account("n1", "ubuntu", "alice").await.unwrap();
    assert_eq!(
        db.resolve_identity("n1", "ubuntu").await.unwrap(),
        Resolution::Bound("alice".into())
    );

    db.upsert_ssh_entries(SshList::Blacklist, "n1", &["ubuntu".into()], "admin").await.unwrap();
    assert_eq!(db.resolve_identity("n1", "ubuntu").await.unwrap(), Resolution::Blacklisted);

    db.upsert_ssh_entries(SshList::Exemption, "*", &["ubuntu".into()], "admin").await.unwrap();
    assert_eq!(db.resolve_identity("n1", "ubuntu").await.unwrap(), Resolution::Exempted);

    db.upsert_ssh_entries(SshList::Whitelist, "n1", &["guest".into()], "admin").await.unwrap();
    assert_eq!(db.resolve_identity("n1", "guest").await.unwrap(), Resolution::Whitelisted);

    assert_eq!(db.resolve_identity("n1", "stranger").await.unwrap(), Resolution::Unknown);
}

#[tokio::test]
async fn wildcard_never_binds() {
    let db = test_db().await;
    let err = db.upsert_user_node_account("*", "ubuntu", "alice").await;
    assert!(matches!(err, Err(DatabaseError::Invalid(_))));
}

#[tokio::test]
async fn wildcard_rows_match_every_node() {
    let db = test_db().await;
    db.upsert_ssh_entries(SshList::Whitelist, "*", &["carol".into()], "admin").await.unwrap();

    assert!(db.is_listed(SshList::Whitelist, "n1", "carol").await.unwrap());
    assert!(db.is_listed(SshList::Whitelist, "n2", "carol").await.unwrap());
    assert!(!db.is_listed(SshList::Whitelist, "n1", "dave").await.unwrap());
}

#[tokio::test]
async fn node_scoped_delete_also_removes_wildcard_row() {
    let db = test_db().await;
    db.upsert_ssh_entries(SshList::Whitelist, "n1", &["carol".into()], "admin").await.unwrap();
    db.upsert_ssh_entries(SshList::Whitelist, "*", &["carol".into()], "admin").await.unwrap();

    let nodes = db
        .delete_ssh_entry_with_nodes(SshList::Whitelist, "n1", "carol")
        .await
        .unwrap();
    assert_eq!(nodes, vec!["*".to_string(), "n1".to_string()]);

    // Nothing of carol remains on any node.
    assert!(!db.is_listed(SshList::Whitelist, "n1", "carol").await.unwrap());
    assert!(!db.is_listed(SshList::Whitelist, "n2", "carol").await.unwrap());
    assert_eq!(db.resolve_identity("n1", "carol").await.unwrap(), Resolution::Unknown);
}

#[tokio::test]
async fn wildcard_delete_leaves_node_rows() {
    let db = test_db().await;
    db.upsert_ssh_entries(SshList::Blacklist, "n1", &["eve".into()], "admin").await.unwrap();
    db.upsert_ssh_entries(SshList::Blacklist, "*", &["eve".into()], "admin").await.unwrap();

    let nodes = db.delete_ssh_entry_with_nodes(SshList::Blacklist, "*", "eve").await.unwrap();
    assert_eq!(nodes, vec!["*".to_string()]);
    assert!(db.is_listed(SshList::Blacklist, "n1", "eve").await.unwrap());
    assert!(!db.is_listed(SshList::Blacklist, "n2", "eve").await.unwrap());
}

#[tokio::test]
async fn deleting_missing_entry_is_not_found() {
    let db = test_db().await;
    let err = db.delete_ssh_entry_with_nodes(SshList::Exemption, "n1", "ghost").await;
    assert!(matches!(err, Err(DatabaseError::NotFound(_))));
}

#[tokio::test]
async fn allowed_users_unions_bindings_and_whitelist() {
    let db = test_db().await;
    db.upsert_user_node_account("n1", "ubuntu", "alice").await.unwrap();
    db.upsert_ssh_entries(SshList::Whitelist, "n1", &["guest".into()], "admin").await.unwrap();
    db.upsert_ssh_entries(SshList::Whitelist, "*", &["shared".into()], "admin").await.unwrap();

    let allowed = db.list_allowed_local_users("n1", 100).await.unwrap();
    assert_eq!(allowed, vec!["guest", "shared", "ubuntu"]);

    let allowed_elsewhere = db.list_allowed_local_users("n2", 100).await.unwrap();
    assert_eq!(allowed_elsewhere, vec!["shared"]);
}

// === Requests ===

#[tokio::test]
async fn approving_bind_request_creates_binding() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let id = queries_requests::create_user_request(&mut conn, "bind", "alice", "n1", "ubuntu", "")
        .await
        .unwrap();
    let updated =
        queries_requests::review_user_request(&mut conn, id, "approved", "root", 500).await.unwrap();
    assert_eq!(updated.status, "approved");
    assert_eq!(updated.reviewed_by.as_deref(), Some("root"));

    assert_eq!(
        db.resolve_identity("n1", "ubuntu").await.unwrap(),
        Resolution::Bound("alice".into())
    );

    // A reviewed request cannot be reviewed again.
    let err = queries_requests::review_user_request(&mut conn, id, "rejected", "root", 600).await;
    assert!(matches!(err, Err(DatabaseError::Conflict(_))));
}

#[tokio::test]
async fn rejecting_request_only_flips_status() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    let id = queries_requests::create_user_request(&mut conn, "bind", "bob", "n1", "ubuntu", "")
        .await
        .unwrap();
    queries_requests::review_user_request(&mut conn, id, "rejected", "", 500).await.unwrap();
    assert_eq!(db.resolve_identity("n1", "ubuntu").await.unwrap(), Resolution::Unknown);
}

#[tokio::test]
async fn only_one_pending_profile_change_per_user() {
    let db = test_db().await;
    db.create_user_account(
        &NewUserAccount {
            username: "alice".into(),
            email: "alice@example.com".into(),
            student_id: "s-1".into(),
            ..Default::default()
        },
        "password123",
        10.0,
    )
    .await
    .unwrap();

    db.create_profile_change_request("alice", "alicia", "alicia@example.com", "s-1", "typo")
        .await
        .unwrap();
    let err = db
        .create_profile_change_request("alice", "alicja", "alicja@example.com", "s-1", "typo")
        .await;
    assert!(matches!(err, Err(DatabaseError::Conflict(_))));
}

#[tokio::test]
async fn profile_rename_cascades_across_all_tables() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    db.create_user_account(
        &NewUserAccount {
            username: "alice".into(),
            email: "alice@example.com".into(),
            student_id: "s-1".into(),
            ..Default::default()
        },
        "password123",
        10.0,
    )
    .await
    .unwrap();

    // History referencing alice in every table.
    for pid in [1, 2, 3] {
        let proc = ProcessSample { username: "alice".into(), pid, cpu_percent: 50.0, ..Default::default() };
        queries_usage::insert_usage_record(&mut conn, "n1", "alice", "alice", 100, &proc, 0.1)
            .await
            .unwrap();
    }
    queries_users::recharge(&mut conn, "alice", 5.0, "bank", 100, &policy()).await.unwrap();
    queries_registry::upsert_binding(&mut conn, "n1", "ubuntu", "alice").await.unwrap();
    queries_requests::create_user_request(&mut conn, "open", "alice", "n2", "alice", "").await.unwrap();

    let id = db
        .create_profile_change_request("alice", "alicia", "alice@example.com", "s-1", "rename")
        .await
        .unwrap();
    let updated =
        queries_requests::review_profile_change_request(&mut conn, id, "approved", "root", 900)
            .await
            .unwrap();
    assert_eq!(updated.status, "approved");

    // No table mentions the old name.
    for (table, column) in [
        ("users", "username"),
        ("usage_records", "username"),
        ("recharge_records", "username"),
        ("user_node_accounts", "billing_username"),
        ("user_requests", "billing_username"),
        ("profile_change_requests", "billing_username"),
        ("user_accounts", "username"),
    ] {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(1) FROM {table} WHERE {column} = 'alice'"))
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 0, "{table}.{column} still references the old name");
    }

    let usage = db.list_usage_by_user("alicia", 100).await.unwrap();
    assert_eq!(usage.len(), 3);
    assert_eq!(
        db.resolve_identity("n1", "ubuntu").await.unwrap(),
        Resolution::Bound("alicia".into())
    );
}

#[tokio::test]
async fn rename_onto_taken_username_is_rejected() {
    let db = test_db().await;
    let mut conn = db.pool().acquire().await.unwrap();

    for (name, mail, sid) in [("alice", "alice@example.com", "s-1"), ("bob", "bob@example.com", "s-2")] {
        db.create_user_account(
            &NewUserAccount {
                username: name.into(),
                email: mail.into(),
                student_id: sid.into(),
                ..Default::default()
            },
            "password123",
            10.0,
        )
        .await
        .unwrap();
    }

    let id = db
        .create_profile_change_request("alice", "bob", "alice@example.com", "s-1", "collision")
        .await
        .unwrap();
    let err =
        queries_requests::review_profile_change_request(&mut conn, id, "approved", "root", 900).await;
    assert!(matches!(err, Err(DatabaseError::Conflict(_))));

    // The request is still pending after the failed approval.
    let rows = db.list_profile_change_requests_by_user("alice", 10).await.unwrap();
    assert_eq!(rows[0].status, "pending");
}

// === Prices and accounts ===

#[tokio::test]
async fn price_upsert_overwrites() {
    let db = test_db().await;
    db.upsert_price("A100", 2.0).await.unwrap();
    db.upsert_price("A100", 2.5).await.unwrap();

    let prices = db.list_prices().await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].price_per_minute, 2.5);

    assert!(matches!(db.upsert_price(" ", 1.0).await, Err(DatabaseError::Invalid(_))));
    assert!(matches!(db.upsert_price("H100", -1.0).await, Err(DatabaseError::Invalid(_))));
}

#[tokio::test]
async fn power_user_lifecycle() {
    let db = test_db().await;
    db.create_power_user("ops", "password123", true, false, true, "root").await.unwrap();

    let err = db.create_power_user("ops", "password123", true, true, true, "root").await;
    assert!(matches!(err, Err(DatabaseError::Conflict(_))));

    let user = db.get_power_user("ops").await.unwrap();
    assert!(user.can_view_board);
    assert!(!user.can_view_nodes);
    assert!(user.can_review_requests);
    // Stored as an argon2id PHC string, never plaintext.
    assert!(user.password_hash.starts_with("$argon2id$"));

    db.update_power_user_permissions("ops", false, true, false, "root").await.unwrap();
    let user = db.get_power_user("ops").await.unwrap();
    assert!(user.can_view_nodes);
    assert!(!user.can_review_requests);

    db.delete_power_user("ops").await.unwrap();
    assert!(matches!(db.get_power_user("ops").await, Err(DatabaseError::NotFound(_))));
}

#[tokio::test]
async fn user_account_creation_seeds_billing_user() {
    let db = test_db().await;
    db.create_user_account(
        &NewUserAccount {
            username: "frank".into(),
            email: "frank@example.com".into(),
            student_id: "s-9".into(),
            ..Default::default()
        },
        "password123",
        42.0,
    )
    .await
    .unwrap();

    let user = db.get_user("frank").await.unwrap();
    assert_eq!(user.balance, 42.0);
    assert!(db.is_registered_identity("frank").await.unwrap());
    assert!(!db.is_registered_identity("nobody").await.unwrap());
}

#[tokio::test]
async fn credential_hashes_are_salted() {
    let db = test_db().await;
    db.create_power_user("ops-a", "samepassword", false, false, false, "root").await.unwrap();
    db.create_power_user("ops-b", "samepassword", false, false, false, "root").await.unwrap();

    let a = db.get_power_user("ops-a").await.unwrap();
    let b = db.get_power_user("ops-b").await.unwrap();
    assert_ne!(a.password_hash, b.password_hash);
    assert_ne!(a.password_hash, "samepassword");
}
