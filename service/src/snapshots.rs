//! Append-only analytics store and its flush queue.
//!
//! `enqueue` never blocks and never fails visibly to the mutation path: the
//! snapshot rides a bounded channel to a dedicated worker thread that appends
//! batches to a separate SQLite database. A failed flush is retried with
//! jittered backoff; only an exhausted retry budget drops the batch, counted
//! and logged as an operational alert (the mutation already committed).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use rand::{Rng, RngCore};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};
use tally_types::api::{AggregateMetrics, HistoryPage};
use tally_types::{StatSnapshot, Timestamp};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::SnapshotMetrics;

const FLUSH_RETRY_BASE: Duration = Duration::from_millis(50);

enum FlushRequest {
    Snapshot(StatSnapshot),
}

/// Filters for history queries; all optional, all ANDed.
#[derive(Clone, Debug, Default)]
pub struct HistoryFilter {
    pub player_id: Option<String>,
    pub alias_id: Option<i64>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

pub struct SnapshotPersistence {
    sender: mpsc::Sender<FlushRequest>,
    read_conn: Mutex<Connection>,
    metrics: Arc<SnapshotMetrics>,
}

impl SnapshotPersistence {
    pub fn load_and_start(
        path: &Path,
        buffer_size: usize,
        batch_size: usize,
        linger: Duration,
        retry_limit: usize,
        metrics: Arc<SnapshotMetrics>,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open snapshot store")?;
        init_schema(&conn).context("init snapshot schema")?;
        drop(conn);

        let read_conn = Connection::open(path).context("open snapshot read connection")?;
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let worker_metrics = Arc::clone(&metrics);
        let worker_path = path.to_path_buf();
        std::thread::spawn(move || {
            flush_worker(
                worker_path,
                batch_size.max(1),
                linger,
                retry_limit,
                receiver,
                worker_metrics,
            )
        });

        Ok(Self {
            sender,
            read_conn: Mutex::new(read_conn),
            metrics,
        })
    }

    /// Fire-and-forget enqueue; a full buffer drops the snapshot (counted)
    /// rather than slowing the mutation path down.
    pub fn enqueue(&self, snapshot: StatSnapshot) {
        match self.sender.try_send(FlushRequest::Snapshot(snapshot)) {
            Ok(()) => self.metrics.inc_queue_depth(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_dropped();
                warn!("snapshot queue full; dropping snapshot");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_dropped();
                warn!("snapshot worker gone; dropping snapshot");
            }
        }
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        match self.read_conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("snapshot read connection lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Paginated per-player history plus aggregates over the whole filtered
    /// window.
    pub fn history(
        &self,
        stat_id: i64,
        filter: &HistoryFilter,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<HistoryPage> {
        self.query_window(stat_id, filter, page, per_page, false)
    }

    /// Like `history` but restricted to snapshots that carried a global
    /// value, with aggregates computed over that column.
    pub fn global_history(
        &self,
        stat_id: i64,
        filter: &HistoryFilter,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<HistoryPage> {
        self.query_window(stat_id, filter, page, per_page, true)
    }

    fn query_window(
        &self,
        stat_id: i64,
        filter: &HistoryFilter,
        page: u64,
        per_page: u64,
        global_only: bool,
    ) -> anyhow::Result<HistoryPage> {
        let per_page = per_page.max(1);
        let mut clauses = vec!["stat_id = ?"];
        let mut args: Vec<SqlValue> = vec![SqlValue::Integer(stat_id)];
        if let Some(player_id) = &filter.player_id {
            clauses.push("player_id = ?");
            args.push(SqlValue::Text(player_id.clone()));
        }
        if let Some(alias_id) = filter.alias_id {
            clauses.push("alias_id = ?");
            args.push(SqlValue::Integer(alias_id));
        }
        if let Some(start) = filter.start {
            clauses.push("created_at >= ?");
            args.push(SqlValue::Integer(start));
        }
        if let Some(end) = filter.end {
            clauses.push("created_at <= ?");
            args.push(SqlValue::Integer(end));
        }
        if global_only {
            clauses.push("global_value IS NOT NULL");
        }
        let where_sql = clauses.join(" AND ");
        let metric_column = if global_only { "global_value" } else { "value" };

        let conn = self.reader();
        let count: u64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM stat_snapshots WHERE {where_sql}"),
                rusqlite::params_from_iter(args.iter().cloned()),
                |row| row.get(0),
            )
            .context("count snapshots")?;

        // min/max/average in one aggregate pass; the median needs an ordered
        // probe. Even-sized windows take the lower middle so the median is a
        // value that actually occurred.
        let (min, max, average) = conn
            .query_row(
                &format!(
                    "SELECT MIN({metric_column}), MAX({metric_column}), AVG({metric_column})
                     FROM stat_snapshots WHERE {where_sql}"
                ),
                rusqlite::params_from_iter(args.iter().cloned()),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("aggregate snapshots")?;
        let median = if count == 0 {
            None
        } else {
            let median_offset = ((count - 1) / 2) as i64;
            conn.query_row(
                &format!(
                    "SELECT {metric_column} FROM stat_snapshots WHERE {where_sql}
                     ORDER BY {metric_column} ASC LIMIT 1 OFFSET ?"
                ),
                rusqlite::params_from_iter(
                    args.iter()
                        .cloned()
                        .chain([SqlValue::Integer(median_offset)]),
                ),
                |row| row.get(0),
            )
            .context("median snapshot")?
        };

        // Fetch one extra row to learn whether this is the last page without
        // a second count query.
        let limit = (per_page + 1) as i64;
        let offset = (page * per_page) as i64;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT player_id, alias_id, stat_id, delta, value, global_value, created_at
                 FROM stat_snapshots WHERE {where_sql}
                 ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
            ))
            .context("prepare history query")?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(args.iter().cloned().chain([
                SqlValue::Integer(limit),
                SqlValue::Integer(offset),
            ])))
            .context("run history query")?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().context("read history row")? {
            snapshots.push(map_snapshot(row).context("map history row")?);
        }
        let is_last_page = snapshots.len() as u64 <= per_page;
        snapshots.truncate(per_page as usize);

        Ok(HistoryPage {
            snapshots,
            count,
            items_per_page: per_page,
            is_last_page,
            metrics: AggregateMetrics {
                min,
                max,
                median,
                average,
            },
        })
    }

    /// Retention: drop snapshots older than the cutoff.
    pub fn prune_before(&self, cutoff: Timestamp) -> anyhow::Result<usize> {
        let deleted = self
            .reader()
            .execute(
                "DELETE FROM stat_snapshots WHERE created_at < ?1",
                params![cutoff],
            )
            .context("prune snapshots")?;
        Ok(deleted)
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS stat_snapshots (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             player_id TEXT NOT NULL,
             alias_id INTEGER NOT NULL,
             stat_id INTEGER NOT NULL,
             delta REAL NOT NULL,
             value REAL NOT NULL,
             global_value REAL,
             created_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS stat_snapshots_stat_created
             ON stat_snapshots(stat_id, created_at);",
    )
}

fn map_snapshot(row: &Row<'_>) -> rusqlite::Result<StatSnapshot> {
    Ok(StatSnapshot {
        player_id: row.get(0)?,
        alias_id: row.get(1)?,
        stat_id: row.get(2)?,
        delta: row.get(3)?,
        value: row.get(4)?,
        global_value: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn flush_worker(
    path: PathBuf,
    batch_size: usize,
    linger: Duration,
    retry_limit: usize,
    mut receiver: mpsc::Receiver<FlushRequest>,
    metrics: Arc<SnapshotMetrics>,
) {
    let mut conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(err) => {
            error!("snapshot store open failed: {err}");
            return;
        }
    };
    let mut rng = rand::thread_rng();

    while let Some(request) = receiver.blocking_recv() {
        let mut batch = Vec::with_capacity(batch_size);
        let FlushRequest::Snapshot(snapshot) = request;
        metrics.dec_queue_depth();
        batch.push(snapshot);
        drain_into(&mut receiver, &mut batch, batch_size, &metrics);
        if batch.len() < batch_size && !linger.is_zero() {
            // Give a burst of small writes a moment to coalesce.
            std::thread::sleep(linger);
            drain_into(&mut receiver, &mut batch, batch_size, &metrics);
        }

        let mut attempt = 0;
        loop {
            match append_batch(&mut conn, &batch) {
                Ok(()) => {
                    metrics.add_flushed(batch.len() as u64);
                    break;
                }
                Err(err) if attempt < retry_limit => {
                    metrics.inc_retries();
                    let backoff = jittered_backoff(
                        &mut rng,
                        FLUSH_RETRY_BASE.saturating_mul(1u32 << attempt.min(10) as u32),
                    );
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "snapshot flush failed, retrying: {err}"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => {
                    metrics.add_dropped(batch.len() as u64);
                    error!(
                        snapshots = batch.len(),
                        "snapshot flush failed after {retry_limit} retries, dropping batch: {err}"
                    );
                    break;
                }
            }
        }
    }
}

fn drain_into(
    receiver: &mut mpsc::Receiver<FlushRequest>,
    batch: &mut Vec<StatSnapshot>,
    batch_size: usize,
    metrics: &SnapshotMetrics,
) {
    while batch.len() < batch_size {
        match receiver.try_recv() {
            Ok(FlushRequest::Snapshot(snapshot)) => {
                metrics.dec_queue_depth();
                batch.push(snapshot);
            }
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
}

fn append_batch(conn: &mut Connection, batch: &[StatSnapshot]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    for snapshot in batch {
        tx.execute(
            "INSERT INTO stat_snapshots
                 (player_id, alias_id, stat_id, delta, value, global_value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.player_id,
                snapshot.alias_id,
                snapshot.stat_id,
                snapshot.delta,
                snapshot.value,
                snapshot.global_value,
                snapshot.created_at,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

// "Equal jitter": delay is in [backoff/2, backoff].
fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}
