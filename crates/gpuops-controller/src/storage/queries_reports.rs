//! Report-ledger, node-status and price queries.

use sqlx::SqliteConnection;

use super::db::{Database, DatabaseError, unix_timestamp};
use super::models::{NodeStatus, PriceRow};
use super::queries_users::clamp_limit;

/// Admit a report into the ledger. Returns `false` when the report id was
/// seen before, in which case the caller must skip billing entirely.
pub async fn try_insert_report(
    conn: &mut SqliteConnection,
    report_id: &str,
    node_id: &str,
    timestamp: i64,
    interval_seconds: i64,
) -> Result<bool, DatabaseError> {
    let report_id = report_id.trim();
    if report_id.is_empty() {
        return Err(DatabaseError::Invalid("report_id must not be empty".into()));
    }
    let interval_seconds = if interval_seconds <= 0 { 60 } else { interval_seconds };

    let result = sqlx::query(
        "INSERT OR IGNORE INTO metric_reports (report_id, node_id, timestamp, interval_seconds) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(report_id)
    .bind(node_id)
    .bind(timestamp)
    .bind(interval_seconds)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Everything the node-status upsert records about one admitted report.
#[derive(Debug, Clone, Default)]
pub struct NodeStatusUpdate {
    pub node_id: String,
    pub last_seen_at: i64,
    pub report_id: String,
    pub report_ts: i64,
    pub interval_seconds: i64,
    pub cpu_model: String,
    pub cpu_count: i64,
    pub gpu_model: String,
    pub gpu_count: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub gpu_process_count: i64,
    pub cpu_process_count: i64,
    pub usage_records_count: i64,
    pub ssh_active_count: i64,
    pub cost_total: f64,
    /// `YYYY-MM` of the received-at timestamp.
    pub month: String,
}

/// Upsert the node row, rolling the monthly traffic counters.
///
/// The monthly delta is `max(0, current - previous)`: a counter that moved
/// backwards (agent restart, counter wrap) contributes zero rather than a
/// negative delta. A new month tag resets the counters before adding.
pub async fn upsert_node_status(
    conn: &mut SqliteConnection,
    update: &NodeStatusUpdate,
) -> Result<(), DatabaseError> {
    if update.node_id.trim().is_empty() || update.report_id.trim().is_empty() {
        return Err(DatabaseError::Invalid("node_id/report_id must not be empty".into()));
    }

    let prev = sqlx::query_as::<_, (i64, i64, String, f64, f64)>(
        "SELECT net_rx_bytes, net_tx_bytes, traffic_month, net_rx_mb_month, net_tx_mb_month \
         FROM nodes WHERE node_id = ?",
    )
    .bind(update.node_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let (mut rx_mb_month, mut tx_mb_month) = match &prev {
        Some((_, _, month, rx_mb, tx_mb)) if *month == update.month => (*rx_mb, *tx_mb),
        _ => (0.0, 0.0),
    };
    // A node never seen before counts from zero, so its whole cumulative
    // counter lands in the current month.
    let (prev_rx, prev_tx) = prev.map_or((0, 0), |(rx, tx, _, _, _)| (rx, tx));
    if update.net_rx_bytes >= prev_rx {
        rx_mb_month += (update.net_rx_bytes - prev_rx) as f64 / 1024.0 / 1024.0;
    }
    if update.net_tx_bytes >= prev_tx {
        tx_mb_month += (update.net_tx_bytes - prev_tx) as f64 / 1024.0 / 1024.0;
    }

    sqlx::query(
        "INSERT INTO nodes (\
           node_id, last_seen_at, last_report_id, last_report_ts, interval_seconds, \
           cpu_model, cpu_count, gpu_model, gpu_count, \
           net_rx_bytes, net_tx_bytes, net_rx_mb_month, net_tx_mb_month, traffic_month, \
           gpu_process_count, cpu_process_count, usage_records_count, ssh_active_count, \
           cost_total, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (node_id) DO UPDATE SET \
           last_seen_at = excluded.last_seen_at, \
           last_report_id = excluded.last_report_id, \
           last_report_ts = excluded.last_report_ts, \
           interval_seconds = excluded.interval_seconds, \
           cpu_model = excluded.cpu_model, \
           cpu_count = excluded.cpu_count, \
           gpu_model = excluded.gpu_model, \
           gpu_count = excluded.gpu_count, \
           net_rx_bytes = excluded.net_rx_bytes, \
           net_tx_bytes = excluded.net_tx_bytes, \
           net_rx_mb_month = excluded.net_rx_mb_month, \
           net_tx_mb_month = excluded.net_tx_mb_month, \
           traffic_month = excluded.traffic_month, \
           gpu_process_count = excluded.gpu_process_count, \
           cpu_process_count = excluded.cpu_process_count, \
           usage_records_count = excluded.usage_records_count, \
           ssh_active_count = excluded.ssh_active_count, \
           cost_total = excluded.cost_total, \
           updated_at = excluded.updated_at",
    )
    .bind(update.node_id.as_str())
    .bind(update.last_seen_at)
    .bind(update.report_id.as_str())
    .bind(update.report_ts)
    .bind(if update.interval_seconds <= 0 { 60 } else { update.interval_seconds })
    .bind(update.cpu_model.trim())
    .bind(update.cpu_count.max(0))
    .bind(update.gpu_model.trim())
    .bind(update.gpu_count.max(0))
    .bind(update.net_rx_bytes)
    .bind(update.net_tx_bytes)
    .bind(rx_mb_month)
    .bind(tx_mb_month)
    .bind(update.month.as_str())
    .bind(update.gpu_process_count)
    .bind(update.cpu_process_count)
    .bind(update.usage_records_count)
    .bind(update.ssh_active_count)
    .bind(update.cost_total)
    .bind(unix_timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load the full price table. Small; rebuilt per report.
pub async fn load_prices(conn: &mut SqliteConnection) -> Result<Vec<PriceRow>, DatabaseError> {
    let rows = sqlx::query_as::<_, PriceRow>(
        "SELECT gpu_model, price_per_minute FROM resource_prices",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

impl Database {
    /// Insert or update one resource price.
    pub async fn upsert_price(&self, model: &str, price: f64) -> Result<(), DatabaseError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(DatabaseError::Invalid("gpu_model must not be empty".into()));
        }
        if price < 0.0 {
            return Err(DatabaseError::Invalid("price_per_minute must not be negative".into()));
        }
        sqlx::query(
            "INSERT INTO resource_prices (gpu_model, price_per_minute, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (gpu_model) DO UPDATE SET \
               price_per_minute = excluded.price_per_minute, updated_at = excluded.updated_at",
        )
        .bind(model)
        .bind(price)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_prices(&self) -> Result<Vec<PriceRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, PriceRow>(
            "SELECT gpu_model, price_per_minute FROM resource_prices ORDER BY gpu_model",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// List node statuses, most recently seen first.
    pub async fn list_nodes(&self, limit: i64) -> Result<Vec<NodeStatus>, DatabaseError> {
        let limit = clamp_limit(limit, 200, 2000);
        let rows = sqlx::query_as::<_, NodeStatus>(
            "SELECT * FROM nodes ORDER BY last_seen_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_node_status(&self, node_id: &str) -> Result<NodeStatus, DatabaseError> {
        sqlx::query_as::<_, NodeStatus>("SELECT * FROM nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("node {node_id}")))
    }
}
