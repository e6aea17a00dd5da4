//! The metric-ingest and billing pipeline.
//!
//! Each report is processed inside one transaction whose first statement is
//! the idempotency insert. A rollback at any point leaves no partial record;
//! a duplicate report commits immediately and still drains the node's
//! outbox so operator actions are never lost to agent retries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gpuops_core::{Action, MetricReport};
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::outbox::ActionOutbox;
use crate::pricing::PriceIndex;
use crate::storage::queries_registry::resolve_billing_username;
use crate::storage::queries_reports::{load_prices, try_insert_report, upsert_node_status};
use crate::storage::queries_usage::insert_usage_record;
use crate::storage::queries_users::deduct_balance;
use crate::storage::{Database, DatabaseError, NodeStatusUpdate};

use super::actions::{CpuControl, Transition, decide_actions};
use super::status::{UserStatus, round4};

/// Upper bound on a report's self-declared interval before the configured
/// default is used instead.
const MAX_REPORT_INTERVAL_SECONDS: i64 = 600;

/// What one report did, for metrics and logging.
#[derive(Debug)]
pub struct ReportOutcome {
    pub actions: Vec<Action>,
    pub duplicate: bool,
    pub usage_records: i64,
}

#[derive(Default)]
struct BillingAgg {
    cost: f64,
    /// local username -> pids owned by that local account this tick.
    locals: BTreeMap<String, Vec<i32>>,
}

impl ControllerConfig {
    fn billing_policy(&self) -> crate::storage::BillingPolicy {
        crate::storage::BillingPolicy {
            default_balance: self.default_balance,
            warning_threshold: self.warning_threshold,
            limited_threshold: self.limited_threshold,
            dry_run: self.dry_run,
        }
    }

    fn cpu_control(&self) -> Option<CpuControl> {
        self.enable_cpu_control.then_some(CpuControl {
            limited_percent: self.cpu_limit_percent_limited,
            blocked_percent: self.cpu_limit_percent_blocked,
        })
    }
}

/// Process one metric report: admit, bill, derive statuses, synthesize
/// actions, and append whatever the operator queued for the node.
pub async fn process_report(
    db: &Database,
    config: &ControllerConfig,
    outbox: &ActionOutbox,
    report: &MetricReport,
    received_at: DateTime<Utc>,
) -> Result<ReportOutcome, DatabaseError> {
    let node_id = report.node_id.trim();
    if node_id.is_empty() {
        return Err(DatabaseError::Invalid("node_id must not be empty".into()));
    }
    if report.report_id.trim().is_empty() {
        return Err(DatabaseError::Invalid(
            "report_id must not be empty (it is the idempotency key)".into(),
        ));
    }

    let now = received_at.timestamp();
    let month = received_at.format("%Y-%m").to_string();

    // A missing or garbled agent clock falls back to the controller's.
    let report_ts = DateTime::parse_from_rfc3339(report.timestamp.trim())
        .map(|t| t.timestamp())
        .unwrap_or(now);

    // Clamp the billing interval: non-positive or implausibly long intervals
    // are replaced by the configured default.
    let interval_seconds = if report.interval_seconds > 0
        && report.interval_seconds <= MAX_REPORT_INTERVAL_SECONDS
    {
        report.interval_seconds
    } else {
        config.sample_interval_seconds
    };
    let mut interval_minutes = interval_seconds as f64 / 60.0;
    if interval_minutes <= 0.0 {
        interval_minutes = 1.0;
    }

    let mut tx = db.pool().begin().await?;

    let admitted = try_insert_report(
        &mut *tx,
        report.report_id.trim(),
        node_id,
        report_ts,
        interval_seconds,
    )
    .await?;
    if !admitted {
        tx.commit().await?;
        debug!(node_id, report_id = report.report_id.as_str(), "duplicate report, outbox only");
        return Ok(ReportOutcome {
            actions: outbox.drain(node_id),
            duplicate: true,
            usage_records: 0,
        });
    }

    let price_index = PriceIndex::new(load_prices(&mut *tx).await?);
    let cpu_core_price = price_index.cpu_core_price(config.cpu_price_per_core_minute);

    // One resolver lookup per local user per report, not per process.
    let mut resolve_cache: BTreeMap<String, String> = BTreeMap::new();
    let mut aggs: BTreeMap<String, BillingAgg> = BTreeMap::new();

    let mut usage_records = 0_i64;
    let mut gpu_process_count = 0_i64;
    let mut cpu_process_count = 0_i64;
    let mut cost_total = 0.0_f64;

    for proc in &report.users {
        let local_username = proc.username.trim();
        if local_username.is_empty() || proc.pid <= 0 {
            continue;
        }

        let billing_username = match resolve_cache.get(local_username) {
            Some(hit) => hit.clone(),
            None => {
                let resolved = resolve_billing_username(&mut *tx, node_id, local_username)
                    .await?
                    .filter(|billing| !billing.trim().is_empty())
                    .unwrap_or_else(|| local_username.to_string());
                resolve_cache.insert(local_username.to_string(), resolved.clone());
                resolved
            }
        };

        let gpu_cost: f64 = proc
            .gpu_usage
            .iter()
            .map(|gpu| {
                let price = price_index
                    .price_of(&gpu.model)
                    .unwrap_or(config.default_price_per_minute);
                price * interval_minutes * gpu.utilization
            })
            .sum();
        let cpu_cost = (proc.cpu_percent / 100.0) * cpu_core_price * interval_minutes;
        let cost = round4(gpu_cost + cpu_cost);

        // Noise floor: no GPU use and under 1% CPU is neither billed nor
        // recorded.
        if proc.gpu_usage.is_empty() && proc.cpu_percent < 1.0 {
            continue;
        }

        insert_usage_record(
            &mut *tx,
            node_id,
            local_username,
            &billing_username,
            report_ts,
            proc,
            cost,
        )
        .await?;
        usage_records += 1;
        cost_total += cost;
        if proc.gpu_usage.is_empty() {
            cpu_process_count += 1;
        } else {
            gpu_process_count += 1;
        }

        let agg = aggs.entry(billing_username).or_default();
        agg.cost += cost;
        agg.locals
            .entry(local_username.to_string())
            .or_default()
            .push(proc.pid);
    }

    let policy = config.billing_policy();
    let cpu_control = config.cpu_control();
    let grace_seconds = config.kill_grace_period_seconds as i64;
    let mut actions: Vec<Action> = Vec::new();

    for (billing_username, agg) in &aggs {
        let update = deduct_balance(&mut *tx, billing_username, agg.cost, now, &policy).await?;
        let new_status = UserStatus::parse(&update.user.status);

        // Debiting keys on the billing account; actions key on the local
        // account, or the agent cannot apply them.
        for (local_username, pids) in &agg.locals {
            actions.extend(decide_actions(&Transition {
                now,
                prev_status: update.prev_status,
                new_status,
                balance: update.user.balance,
                blocked_at: update.user.blocked_at,
                local_username,
                pids,
                grace_seconds,
                cpu_control,
            }));
        }
    }

    upsert_node_status(
        &mut *tx,
        &NodeStatusUpdate {
            node_id: node_id.to_string(),
            last_seen_at: now,
            report_id: report.report_id.trim().to_string(),
            report_ts,
            interval_seconds,
            cpu_model: report.cpu_model.clone(),
            cpu_count: report.cpu_count,
            gpu_model: report.gpu_model.clone(),
            gpu_count: report.gpu_count,
            net_rx_bytes: report.net_rx_bytes as i64,
            net_tx_bytes: report.net_tx_bytes as i64,
            gpu_process_count,
            cpu_process_count,
            usage_records_count: usage_records,
            ssh_active_count: report.ssh_users.len() as i64,
            cost_total: round4(cost_total),
            month,
        },
    )
    .await?;

    tx.commit().await?;

    actions.extend(outbox.drain(node_id));

    info!(
        node_id,
        report_id = report.report_id.as_str(),
        usage_records,
        actions = actions.len(),
        cost_total = round4(cost_total),
        "report billed"
    );

    Ok(ReportOutcome { actions, duplicate: false, usage_records })
}
