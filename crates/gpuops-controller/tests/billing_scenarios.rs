//! End-to-end billing scenarios exercising the engine and the HTTP surface.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, TimeZone, Utc};
use tower::ServiceExt;

use gpuops_controller::billing::process_report;
use gpuops_controller::config::ControllerConfig;
use gpuops_controller::server::{AppState, build_router};
use gpuops_controller::storage::{Database, SshList};
use gpuops_core::{Action, GpuUsage, MetricReport, ProcessSample};

const ADMIN_TOKEN: &str = "test-admin-token";
const AGENT_TOKEN: &str = "test-agent-token";

fn test_config() -> ControllerConfig {
    ControllerConfig {
        default_balance: 10.0,
        warning_threshold: 5.0,
        limited_threshold: 1.0,
        kill_grace_period_seconds: 30,
        sample_interval_seconds: 60,
        cpu_price_per_core_minute: 0.20,
        admin_token: ADMIN_TOKEN.to_string(),
        agent_token: AGENT_TOKEN.to_string(),
        ..Default::default()
    }
}

async fn test_state() -> AppState {
    AppState::new(Database::open_in_memory().await.unwrap(), test_config())
}

fn at(unix: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix, 0).unwrap()
}

fn cpu_proc(user: &str, pid: i32, cpu_percent: f64) -> ProcessSample {
    ProcessSample {
        username: user.to_string(),
        pid,
        cpu_percent,
        memory_mb: 256.0,
        command: format!("python train.py --worker {pid}"),
        gpu_usage: Vec::new(),
    }
}

fn gpu_proc(user: &str, pid: i32, model: &str, utilization: f64) -> ProcessSample {
    ProcessSample {
        username: user.to_string(),
        pid,
        cpu_percent: 0.0,
        memory_mb: 1024.0,
        command: "python train.py".to_string(),
        gpu_usage: vec![GpuUsage {
            gpu_index: 0,
            model: model.to_string(),
            utilization,
            memory_mb: 8192.0,
        }],
    }
}

fn report(node: &str, id: &str, users: Vec<ProcessSample>) -> MetricReport {
    MetricReport {
        node_id: node.to_string(),
        report_id: id.to_string(),
        timestamp: String::new(),
        interval_seconds: 60,
        users,
        ..Default::default()
    }
}

async fn set_balance(state: &AppState, username: &str, balance: f64) {
    let mut conn = state.db.pool().acquire().await.unwrap();
    gpuops_controller::storage::queries_users::ensure_user(&mut conn, username, balance)
        .await
        .unwrap();
    sqlx::query("UPDATE users SET balance = ? WHERE username = ?")
        .bind(balance)
        .bind(username)
        .execute(state.db.pool())
        .await
        .unwrap();
}

// === Scenario 1: first sight seeds the user ===

#[tokio::test]
async fn first_sight_seeds_user_and_bills_cpu() {
    let state = test_state().await;

    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![cpu_proc("alice", 101, 50.0)]),
        at(1_700_000_000),
    )
    .await
    .unwrap();

    // cost = 0.5 core * 0.20/core-minute * 1 minute = 0.1000
    let alice = state.db.get_user("alice").await.unwrap();
    assert!((alice.balance - 9.90).abs() < 1e-9);
    assert_eq!(alice.status, "normal");
    assert!(outcome.actions.is_empty());
    assert_eq!(outcome.usage_records, 1);

    let records = state.db.list_usage_by_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!((records[0].cost - 0.1000).abs() < 1e-9);
}

#[tokio::test]
async fn noise_floor_skips_idle_cpu_processes() {
    let state = test_state().await;

    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![cpu_proc("alice", 101, 0.5)]),
        at(1_700_000_000),
    )
    .await
    .unwrap();

    assert_eq!(outcome.usage_records, 0);
    // The user is never even created: nothing billable was seen.
    assert!(state.db.get_user("alice").await.is_err());
}

// === Scenario 2: GPU billing drives the block/kill ladder ===

#[tokio::test]
async fn gpu_billing_blocks_then_kills_after_grace() {
    let state = test_state().await;
    state.db.upsert_price("A100", 2.0).await.unwrap();
    set_balance(&state, "bob", 0.50).await;

    let t0 = 1_700_000_000;
    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![gpu_proc("bob", 999, "A100", 1.0)]),
        at(t0),
    )
    .await
    .unwrap();

    // 0.50 - 2.00 = -1.50: blocked, but inside the 30 s grace window.
    let bob = state.db.get_user("bob").await.unwrap();
    assert!((bob.balance + 1.50).abs() < 1e-9);
    assert_eq!(bob.status, "blocked");
    assert_eq!(bob.blocked_at, Some(t0));

    let kinds: Vec<&str> = outcome.actions.iter().map(Action::kind).collect();
    assert_eq!(kinds, ["block_user", "notify"]);

    // 31 s later the same pid is still alive: the kill fires.
    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-2", vec![gpu_proc("bob", 999, "A100", 1.0)]),
        at(t0 + 31),
    )
    .await
    .unwrap();

    assert_eq!(outcome.actions.len(), 1);
    match &outcome.actions[0] {
        Action::KillProcess { username, pids, .. } => {
            assert_eq!(username, "bob");
            assert_eq!(pids, &vec![999]);
        }
        other => panic!("expected kill_process, got {other:?}"),
    }
    // blocked_at still marks the first entry into blocked.
    assert_eq!(state.db.get_user("bob").await.unwrap().blocked_at, Some(t0));
}

#[tokio::test]
async fn report_observing_recovery_emits_unblock() {
    let state = test_state().await;
    set_balance(&state, "bob", 50.0).await;
    // A stale blocked state whose balance has since been restored; the next
    // report observes the blocked -> normal transition.
    sqlx::query("UPDATE users SET status = 'blocked', blocked_at = ? WHERE username = 'bob'")
        .bind(1_699_999_000_i64)
        .execute(state.db.pool())
        .await
        .unwrap();

    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![cpu_proc("bob", 999, 50.0)]),
        at(1_700_000_160),
    )
    .await
    .unwrap();

    let kinds: Vec<&str> = outcome.actions.iter().map(Action::kind).collect();
    assert_eq!(kinds, ["unblock_user"]);
    let bob = state.db.get_user("bob").await.unwrap();
    assert_eq!(bob.status, "normal");
    assert!(bob.blocked_at.is_none());
}

#[tokio::test]
async fn recharge_restores_status_and_clears_blocked_at() {
    let state = test_state().await;
    state.db.upsert_price("A100", 2.0).await.unwrap();
    set_balance(&state, "bob", 0.50).await;

    process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![gpu_proc("bob", 999, "A100", 1.0)]),
        at(1_700_000_000),
    )
    .await
    .unwrap();
    assert_eq!(state.db.get_user("bob").await.unwrap().status, "blocked");

    let mut conn = state.db.pool().acquire().await.unwrap();
    let policy = gpuops_controller::storage::BillingPolicy {
        default_balance: 10.0,
        warning_threshold: 5.0,
        limited_threshold: 1.0,
        dry_run: false,
    };
    gpuops_controller::storage::queries_users::recharge(
        &mut conn,
        "bob",
        100.0,
        "bank",
        1_700_000_100,
        &policy,
    )
    .await
    .unwrap();
    drop(conn);

    let bob = state.db.get_user("bob").await.unwrap();
    assert!((bob.balance - 98.50).abs() < 1e-9);
    assert_eq!(bob.status, "normal");
    assert!(bob.blocked_at.is_none());
}

// === Scenario 3: duplicate report ===

#[tokio::test]
async fn duplicate_report_bills_once_and_still_drains_outbox() {
    let state = test_state().await;

    let metric_report = report("n1", "r-1", vec![cpu_proc("alice", 101, 50.0)]);
    process_report(&state.db, &state.config, &state.outbox, &metric_report, at(1_700_000_000))
        .await
        .unwrap();

    // An operator action lands between the original and the retry.
    state.outbox.enqueue(
        "n1",
        Action::KickSshUser { username: "mallory".into(), reason: "operator kick".into() },
    );

    let retry =
        process_report(&state.db, &state.config, &state.outbox, &metric_report, at(1_700_000_030))
            .await
            .unwrap();
    assert!(retry.duplicate);
    assert_eq!(retry.usage_records, 0);
    assert_eq!(retry.actions.len(), 1);
    assert!(matches!(&retry.actions[0], Action::KickSshUser { username, .. } if username == "mallory"));

    // Exactly one usage record and one debit.
    let records = state.db.list_usage_by_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!((state.db.get_user("alice").await.unwrap().balance - 9.90).abs() < 1e-9);
}

// === Scenario 4: binding resolution ===

#[tokio::test]
async fn bound_local_user_bills_the_billing_account() {
    let state = test_state().await;
    state.db.upsert_user_node_account("n1", "ubuntu", "alice").await.unwrap();
    set_balance(&state, "alice", 5.05).await;

    let outcome = process_report(
        &state.db,
        &state.config,
        &state.outbox,
        &report("n1", "r-1", vec![cpu_proc("ubuntu", 101, 50.0)]),
        at(1_700_000_000),
    )
    .await
    .unwrap();

    // The record lands on the billing account with the local preserved.
    let records = state.db.list_usage_by_user("alice", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].local_username, "ubuntu");
    assert!((state.db.get_user("alice").await.unwrap().balance - 4.95).abs() < 1e-9);
    assert_eq!(state.db.get_user("alice").await.unwrap().status, "warning");
    // "ubuntu" itself was never billed.
    assert!(state.db.get_user("ubuntu").await.is_err());

    // The warning notice is addressed to the local account the agent knows.
    assert_eq!(outcome.actions.len(), 1);
    assert!(matches!(&outcome.actions[0], Action::Notify { username, .. } if username == "ubuntu"));
}

// === P2: balance conservation ===

#[tokio::test]
async fn balances_conserve_across_reports_and_recharges() {
    let state = test_state().await;
    state.db.upsert_price("A100", 2.0).await.unwrap();

    for (i, utilization) in [0.3, 0.7, 1.0, 0.25].iter().enumerate() {
        process_report(
            &state.db,
            &state.config,
            &state.outbox,
            &report("n1", &format!("r-{i}"), vec![
                gpu_proc("alice", 100 + i as i32, "A100", *utilization),
                cpu_proc("alice", 200 + i as i32, 37.5),
            ]),
            at(1_700_000_000 + 60 * i as i64),
        )
        .await
        .unwrap();
    }

    let mut conn = state.db.pool().acquire().await.unwrap();
    let policy = gpuops_controller::storage::BillingPolicy {
        default_balance: 10.0,
        warning_threshold: 5.0,
        limited_threshold: 1.0,
        dry_run: false,
    };
    gpuops_controller::storage::queries_users::recharge(
        &mut conn, "alice", 3.5, "bank", 1_700_001_000, &policy,
    )
    .await
    .unwrap();
    drop(conn);

    let (cost_sum,): (f64,) =
        sqlx::query_as("SELECT COALESCE(SUM(cost), 0) FROM usage_records WHERE username = 'alice'")
            .fetch_one(state.db.pool())
            .await
            .unwrap();
    let balance = state.db.get_user("alice").await.unwrap().balance;
    assert!(
        (balance - (10.0 + 3.5 - cost_sum)).abs() < 1e-6,
        "balance {balance} vs default + recharges - costs {}",
        10.0 + 3.5 - cost_sum
    );
}

// === HTTP surface ===

fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

#[tokio::test]
async fn metrics_endpoint_requires_the_agent_token() {
    let state = test_state().await;
    let app = build_router(state);

    let unauthenticated = Request::builder()
        .method("POST")
        .uri("/api/metrics")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "node_id": "n1", "report_id": "r-1" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(unauthenticated).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let authenticated = Request::builder()
        .method("POST")
        .uri("/api/metrics")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-agent-token", AGENT_TOKEN)
        .body(Body::from(
            serde_json::json!({ "node_id": "n1", "report_id": "r-1" }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(authenticated).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["actions"], serde_json::json!([]));
}

#[tokio::test]
async fn admin_endpoints_reject_without_credentials() {
    let state = test_state().await;
    let app = build_router(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/admin/users").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/users")
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// === Scenario 5: whitelist deletion kicks everywhere ===

#[tokio::test]
async fn whitelist_deletion_kicks_on_every_affected_node() {
    let state = test_state().await;

    // Two known nodes, established by earlier reports.
    for node in ["n1", "n2"] {
        process_report(
            &state.db,
            &state.config,
            &state.outbox,
            &report(node, &format!("seed-{node}"), vec![]),
            at(1_700_000_000),
        )
        .await
        .unwrap();
    }

    // carol is whitelisted on n1 and globally, and exempt on n2.
    state
        .db
        .upsert_ssh_entries(SshList::Whitelist, "n1", &["carol".into()], "admin")
        .await
        .unwrap();
    state
        .db
        .upsert_ssh_entries(SshList::Whitelist, "*", &["carol".into()], "admin")
        .await
        .unwrap();
    state
        .db
        .upsert_ssh_entries(SshList::Exemption, "n2", &["carol".into()], "admin")
        .await
        .unwrap();

    let app = build_router(state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/admin/whitelist?node_id=n1&local_username=carol")
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Both rows are gone: the node-scoped delete took the wildcard with it.
    assert!(!state.db.is_listed(SshList::Whitelist, "n1", "carol").await.unwrap());
    assert!(!state.db.is_listed(SshList::Whitelist, "n3", "carol").await.unwrap());

    // n1 gets exactly one kick; n2 is protected by the exemption.
    let n1_actions = state.outbox.drain("n1");
    assert_eq!(n1_actions.len(), 1);
    assert!(matches!(&n1_actions[0], Action::KickSshUser { username, .. } if username == "carol"));
    assert!(state.outbox.drain("n2").is_empty());
}

#[tokio::test]
async fn blacklist_addition_kicks_immediately() {
    let state = test_state().await;
    let app = build_router(state.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/admin/blacklist",
            Some(ADMIN_TOKEN),
            serde_json::json!({ "node_id": "n1", "usernames": ["mallory"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(state.db.is_listed(SshList::Blacklist, "n1", "mallory").await.unwrap());
    let actions = state.outbox.drain("n1");
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], Action::KickSshUser { username, .. } if username == "mallory"));
}

// === Scenario 6: profile change rename via the admin API ===

#[tokio::test]
async fn approved_profile_change_renames_everywhere() {
    let state = test_state().await;

    state
        .db
        .create_user_account(
            &gpuops_controller::storage::NewUserAccount {
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

    // Billing history under the old name.
    for i in 0..3 {
        process_report(
            &state.db,
            &state.config,
            &state.outbox,
            &report("n1", &format!("r-{i}"), vec![cpu_proc("alice", 100 + i, 50.0)]),
            at(1_700_000_000 + 60 * i64::from(i)),
        )
        .await
        .unwrap();
    }
    let mut conn = state.db.pool().acquire().await.unwrap();
    gpuops_controller::storage::queries_users::recharge(
        &mut conn,
        "alice",
        1.0,
        "bank",
        1_700_001_000,
        &gpuops_controller::storage::BillingPolicy {
            default_balance: 10.0,
            warning_threshold: 5.0,
            limited_threshold: 1.0,
            dry_run: false,
        },
    )
    .await
    .unwrap();
    drop(conn);

    let request_id = state
        .db
        .create_profile_change_request("alice", "alicia", "alice@example.com", "s-1", "rename")
        .await
        .unwrap();

    let app = build_router(state.clone());
    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/api/admin/profile-change-requests/{request_id}/approve"),
            Some(ADMIN_TOKEN),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["request"]["status"], "approved");

    assert_eq!(state.db.list_usage_by_user("alicia", 10).await.unwrap().len(), 3);
    assert!(state.db.list_usage_by_user("alice", 10).await.unwrap().is_empty());
    let (recharges,): (i64,) = sqlx::query_as(
        "SELECT COUNT(1) FROM recharge_records WHERE username = 'alicia'",
    )
    .fetch_one(state.db.pool())
    .await
    .unwrap();
    assert_eq!(recharges, 1);
}
