//! Relational counter store.
//!
//! One SQLite database (WAL, foreign keys on) holds the identity rows the
//! core's cascades need plus the stat and leaderboard tables. The connection
//! is mutex-serialized; callers on the request path run store work under
//! `spawn_blocking`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tally_types::{
    Leaderboard, LeaderboardEntry, PlayerStat, RefreshInterval, SortMode, Stat, Timestamp,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("corrupt entry props: {0}")]
    Props(#[from] serde_json::Error),
    #[error("store task failed")]
    Task,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields an administrator supplies when defining a stat.
#[derive(Clone, Debug, Default)]
pub struct StatDefinition {
    pub internal_name: String,
    pub name: String,
    pub default_value: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub max_change: Option<f64>,
    pub min_time_between_updates: u64,
    pub global: bool,
}

/// Admin-editable subset of a stat definition. None leaves a field as-is.
#[derive(Clone, Debug, Default)]
pub struct StatPatch {
    pub name: Option<String>,
    pub min_value: Option<Option<f64>>,
    pub max_value: Option<Option<f64>>,
    pub max_change: Option<Option<f64>>,
    pub min_time_between_updates: Option<u64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("store connection lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    // ── players & aliases ────────────────────────────────────────────────

    pub fn create_player(&self, id: &str, dev_build: bool, now: Timestamp) -> StoreResult<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO players (id, dev_build, created_at) VALUES (?1, ?2, ?3)",
            params![id, dev_build as i64, now],
        )?;
        Ok(())
    }

    pub fn player_exists(&self, id: &str) -> StoreResult<bool> {
        let exists = self
            .lock()
            .query_row(
                "SELECT 1 FROM players WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    /// Deletes a player; stat rows, aliases, and entries cascade with it.
    pub fn delete_player(&self, id: &str) -> StoreResult<bool> {
        let deleted = self
            .lock()
            .execute("DELETE FROM players WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn create_alias(
        &self,
        player_id: &str,
        service: &str,
        identifier: &str,
    ) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO aliases (player_id, service, identifier) VALUES (?1, ?2, ?3)",
            params![player_id, service, identifier],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── stats ────────────────────────────────────────────────────────────

    pub fn create_stat(&self, definition: &StatDefinition) -> StoreResult<Stat> {
        let conn = self.lock();
        let stat = conn.query_row(
            "INSERT INTO stats (internal_name, name, default_value, min_value, max_value,
                                max_change, min_time_between_updates, global, global_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
             RETURNING id, internal_name, name, default_value, min_value, max_value,
                       max_change, min_time_between_updates, global, global_value",
            params![
                definition.internal_name,
                definition.name,
                definition.default_value,
                definition.min_value,
                definition.max_value,
                definition.max_change,
                definition.min_time_between_updates as i64,
                definition.global as i64,
            ],
            map_stat,
        )?;
        Ok(stat)
    }

    pub fn update_stat(&self, internal_name: &str, patch: &StatPatch) -> StoreResult<Option<Stat>> {
        let conn = self.lock();
        let Some(current) = stat_by_internal_name(&conn, internal_name)? else {
            return Ok(None);
        };
        let name = patch.name.clone().unwrap_or(current.name);
        let min_value = patch.min_value.unwrap_or(current.min_value);
        let max_value = patch.max_value.unwrap_or(current.max_value);
        let max_change = patch.max_change.unwrap_or(current.max_change);
        let min_time = patch
            .min_time_between_updates
            .unwrap_or(current.min_time_between_updates);
        let stat = conn.query_row(
            "UPDATE stats SET name = ?2, min_value = ?3, max_value = ?4, max_change = ?5,
                              min_time_between_updates = ?6
             WHERE internal_name = ?1
             RETURNING id, internal_name, name, default_value, min_value, max_value,
                       max_change, min_time_between_updates, global, global_value",
            params![
                internal_name,
                name,
                min_value,
                max_value,
                max_change,
                min_time as i64
            ],
            map_stat,
        )?;
        Ok(Some(stat))
    }

    pub fn stat_by_internal_name(&self, internal_name: &str) -> StoreResult<Option<Stat>> {
        stat_by_internal_name(&self.lock(), internal_name)
    }

    pub fn global_stats(&self) -> StoreResult<Vec<Stat>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, internal_name, name, default_value, min_value, max_value,
                    max_change, min_time_between_updates, global, global_value
             FROM stats WHERE global = 1 ORDER BY id ASC",
        )?;
        let stats = stmt
            .query_map([], map_stat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    // ── player-stat counters ─────────────────────────────────────────────

    pub fn player_stat(&self, player_id: &str, stat_id: i64) -> StoreResult<Option<PlayerStat>> {
        let row = self
            .lock()
            .query_row(
                "SELECT id, player_id, stat_id, value, created_at, updated_at
                 FROM player_stats WHERE player_id = ?1 AND stat_id = ?2",
                params![player_id, stat_id],
                map_player_stat,
            )
            .optional()?;
        Ok(row)
    }

    pub fn player_stats(&self, player_id: &str) -> StoreResult<Vec<PlayerStat>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, player_id, stat_id, value, created_at, updated_at
             FROM player_stats WHERE player_id = ?1 ORDER BY stat_id ASC",
        )?;
        let rows = stmt
            .query_map(params![player_id], map_player_stat)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The atomic apply. A single upsert statement: inserts the first row for
    /// the pair, or advances the stored value by `delta` server-side. The
    /// conflict arm never writes a value computed by the caller, so two racing
    /// requests both land their deltas instead of one overwriting the other.
    /// RETURNING hands back the authoritative post-write row.
    pub fn apply_delta(
        &self,
        player_id: &str,
        stat_id: i64,
        insert_value: f64,
        delta: f64,
        now: Timestamp,
    ) -> StoreResult<PlayerStat> {
        let row = self.lock().query_row(
            "INSERT INTO player_stats (player_id, stat_id, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (player_id, stat_id) DO UPDATE SET
                 value = player_stats.value + ?5,
                 updated_at = ?4
             RETURNING id, player_id, stat_id, value, created_at, updated_at",
            params![player_id, stat_id, insert_value, now, delta],
            map_player_stat,
        )?;
        Ok(row)
    }

    /// Atomic increment of the relational global counter.
    pub fn add_global_value(&self, stat_id: i64, delta: f64) -> StoreResult<f64> {
        let value = self.lock().query_row(
            "UPDATE stats SET global_value = global_value + ?2 WHERE id = ?1
             RETURNING global_value",
            params![stat_id, delta],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Recovery path for the dual global counters: recompute from the source
    /// of truth (the player rows) and overwrite the cached column.
    pub fn recompute_global_value(&self, stat_id: i64) -> StoreResult<f64> {
        let value = self.lock().query_row(
            "UPDATE stats SET global_value =
                 (SELECT COALESCE(SUM(value), 0) FROM player_stats WHERE stat_id = ?1)
             WHERE id = ?1
             RETURNING global_value",
            params![stat_id],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Bulk reset: the only path that removes player-stat rows directly.
    pub fn reset_player_stats(&self, player_id: &str) -> StoreResult<usize> {
        let deleted = self.lock().execute(
            "DELETE FROM player_stats WHERE player_id = ?1",
            params![player_id],
        )?;
        Ok(deleted)
    }

    // ── leaderboards ─────────────────────────────────────────────────────

    pub fn create_leaderboard(
        &self,
        internal_name: &str,
        name: &str,
        sort_mode: SortMode,
        unique_entries: bool,
    ) -> StoreResult<Leaderboard> {
        let board = self.lock().query_row(
            "INSERT INTO leaderboards (internal_name, name, sort_mode, unique_entries, refresh_interval)
             VALUES (?1, ?2, ?3, ?4, 'never')
             RETURNING id, internal_name, name, sort_mode, unique_entries, refresh_interval",
            params![internal_name, name, sort_mode.as_str(), unique_entries as i64],
            map_leaderboard,
        )?;
        Ok(board)
    }

    pub fn leaderboard_by_internal_name(
        &self,
        internal_name: &str,
    ) -> StoreResult<Option<Leaderboard>> {
        let board = self
            .lock()
            .query_row(
                "SELECT id, internal_name, name, sort_mode, unique_entries, refresh_interval
                 FROM leaderboards WHERE internal_name = ?1",
                params![internal_name],
                map_leaderboard,
            )
            .optional()?;
        Ok(board)
    }

    /// Changes the refresh interval. Moving away from `Never` archives the
    /// board's live entries rather than deleting them.
    pub fn set_refresh_interval(
        &self,
        leaderboard_id: i64,
        interval: RefreshInterval,
        now: Timestamp,
    ) -> StoreResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let previous: String = tx.query_row(
            "SELECT refresh_interval FROM leaderboards WHERE id = ?1",
            params![leaderboard_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE leaderboards SET refresh_interval = ?2 WHERE id = ?1",
            params![leaderboard_id, interval.as_str()],
        )?;
        let mut archived = 0;
        if previous == "never" && interval != RefreshInterval::Never {
            archived = tx.execute(
                "UPDATE leaderboard_entries SET archived_at = ?2
                 WHERE leaderboard_id = ?1 AND archived_at IS NULL",
                params![leaderboard_id, now],
            )?;
        }
        tx.commit()?;
        Ok(archived)
    }

    /// Entry creation is the score-submission collaborator's seam. On a
    /// unique-entries board an alias keeps a single row whose score is
    /// replaced in place (created_at keeps the original submission time).
    pub fn create_entry(
        &self,
        board: &Leaderboard,
        alias_id: i64,
        score: f64,
        props: &BTreeMap<String, String>,
        now: Timestamp,
    ) -> StoreResult<LeaderboardEntry> {
        let props_json = serde_json::to_string(props)?;
        let conn = self.lock();
        if board.unique_entries {
            let existing = conn
                .query_row(
                    "UPDATE leaderboard_entries SET score = ?3, props = ?4
                     WHERE leaderboard_id = ?1 AND alias_id = ?2
                       AND deleted_at IS NULL AND archived_at IS NULL
                     RETURNING id, leaderboard_id, alias_id, score, hidden, deleted_at,
                               archived_at, created_at, props",
                    params![board.id, alias_id, score, props_json],
                    map_entry,
                )
                .optional()?;
            if let Some(entry) = existing {
                return Ok(entry?);
            }
        }
        let entry = conn.query_row(
            "INSERT INTO leaderboard_entries
                 (leaderboard_id, alias_id, score, hidden, created_at, props)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             RETURNING id, leaderboard_id, alias_id, score, hidden, deleted_at,
                       archived_at, created_at, props",
            params![board.id, alias_id, score, now, props_json],
            map_entry,
        )??;
        Ok(entry)
    }

    /// Soft delete: the row stays for audit and possible restore; filtered
    /// listings stop returning it.
    pub fn soft_delete_entry(&self, entry_id: i64, now: Timestamp) -> StoreResult<bool> {
        let updated = self.lock().execute(
            "UPDATE leaderboard_entries SET deleted_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![entry_id, now],
        )?;
        Ok(updated > 0)
    }

    /// Admin edit of an existing entry.
    pub fn update_entry(
        &self,
        entry_id: i64,
        score: Option<f64>,
        hidden: Option<bool>,
    ) -> StoreResult<Option<LeaderboardEntry>> {
        let entry = self
            .lock()
            .query_row(
                "UPDATE leaderboard_entries SET
                     score = COALESCE(?2, score),
                     hidden = COALESCE(?3, hidden)
                 WHERE id = ?1
                 RETURNING id, leaderboard_id, alias_id, score, hidden, deleted_at,
                           archived_at, created_at, props",
                params![entry_id, score, hidden.map(|value| value as i64)],
                map_entry,
            )
            .optional()?;
        entry.transpose().map_err(StoreError::from)
    }
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         CREATE TABLE IF NOT EXISTS players (
             id TEXT PRIMARY KEY,
             dev_build INTEGER NOT NULL DEFAULT 0,
             created_at INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS aliases (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             player_id TEXT NOT NULL REFERENCES players(id) ON DELETE CASCADE,
             service TEXT NOT NULL,
             identifier TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS stats (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             internal_name TEXT NOT NULL UNIQUE,
             name TEXT NOT NULL,
             default_value REAL NOT NULL DEFAULT 0,
             min_value REAL,
             max_value REAL,
             max_change REAL,
             min_time_between_updates INTEGER NOT NULL DEFAULT 0,
             global INTEGER NOT NULL DEFAULT 0,
             global_value REAL NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS player_stats (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             player_id TEXT NOT NULL REFERENCES players(id) ON DELETE CASCADE,
             stat_id INTEGER NOT NULL REFERENCES stats(id) ON DELETE CASCADE,
             value REAL NOT NULL,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL,
             UNIQUE (player_id, stat_id)
         );
         CREATE TABLE IF NOT EXISTS leaderboards (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             internal_name TEXT NOT NULL UNIQUE,
             name TEXT NOT NULL,
             sort_mode TEXT NOT NULL DEFAULT 'desc',
             unique_entries INTEGER NOT NULL DEFAULT 1,
             refresh_interval TEXT NOT NULL DEFAULT 'never'
         );
         CREATE TABLE IF NOT EXISTS leaderboard_entries (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             leaderboard_id INTEGER NOT NULL REFERENCES leaderboards(id) ON DELETE CASCADE,
             alias_id INTEGER NOT NULL REFERENCES aliases(id) ON DELETE CASCADE,
             score REAL NOT NULL,
             hidden INTEGER NOT NULL DEFAULT 0,
             deleted_at INTEGER,
             archived_at INTEGER,
             created_at INTEGER NOT NULL,
             props TEXT NOT NULL DEFAULT '{}'
         );
         CREATE INDEX IF NOT EXISTS player_stats_stat ON player_stats(stat_id);
         CREATE INDEX IF NOT EXISTS entries_board_score
             ON leaderboard_entries(leaderboard_id, score);
         CREATE INDEX IF NOT EXISTS entries_alias ON leaderboard_entries(alias_id);",
    )
}

fn stat_by_internal_name(
    conn: &Connection,
    internal_name: &str,
) -> StoreResult<Option<Stat>> {
    let stat = conn
        .query_row(
            "SELECT id, internal_name, name, default_value, min_value, max_value,
                    max_change, min_time_between_updates, global, global_value
             FROM stats WHERE internal_name = ?1",
            params![internal_name],
            map_stat,
        )
        .optional()?;
    Ok(stat)
}

fn map_stat(row: &Row<'_>) -> rusqlite::Result<Stat> {
    Ok(Stat {
        id: row.get(0)?,
        internal_name: row.get(1)?,
        name: row.get(2)?,
        default_value: row.get(3)?,
        min_value: row.get(4)?,
        max_value: row.get(5)?,
        max_change: row.get(6)?,
        min_time_between_updates: row.get::<_, i64>(7)? as u64,
        global: row.get::<_, i64>(8)? != 0,
        global_value: row.get(9)?,
    })
}

fn map_player_stat(row: &Row<'_>) -> rusqlite::Result<PlayerStat> {
    Ok(PlayerStat {
        id: row.get(0)?,
        player_id: row.get(1)?,
        stat_id: row.get(2)?,
        value: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_leaderboard(row: &Row<'_>) -> rusqlite::Result<Leaderboard> {
    let sort_mode: String = row.get(3)?;
    let refresh_interval: String = row.get(5)?;
    Ok(Leaderboard {
        id: row.get(0)?,
        internal_name: row.get(1)?,
        name: row.get(2)?,
        sort_mode: sort_mode.parse().unwrap_or(SortMode::Desc),
        unique_entries: row.get::<_, i64>(4)? != 0,
        refresh_interval: refresh_interval.parse().unwrap_or(RefreshInterval::Never),
    })
}

/// Entries carry a JSON props column; surface a parse failure as a
/// `StoreError` instead of panicking on corrupt data.
pub(crate) fn map_entry(
    row: &Row<'_>,
) -> rusqlite::Result<Result<LeaderboardEntry, serde_json::Error>> {
    let id = row.get(0)?;
    let leaderboard_id = row.get(1)?;
    let alias_id = row.get(2)?;
    let score = row.get(3)?;
    let hidden = row.get::<_, i64>(4)? != 0;
    let deleted_at = row.get(5)?;
    let archived_at = row.get(6)?;
    let created_at = row.get(7)?;
    let props_json: String = row.get(8)?;
    Ok(
        serde_json::from_str::<BTreeMap<String, String>>(&props_json).map(|props| {
            LeaderboardEntry {
                id,
                leaderboard_id,
                alias_id,
                score,
                hidden,
                deleted_at,
                archived_at,
                created_at,
                props,
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_player("p1", false, 100).unwrap();
        store
    }

    fn simple_stat(store: &Store, internal_name: &str) -> Stat {
        store
            .create_stat(&StatDefinition {
                internal_name: internal_name.to_string(),
                name: internal_name.to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn apply_delta_inserts_then_increments() {
        let store = seeded_store();
        let stat = simple_stat(&store, "gold");

        let first = store.apply_delta("p1", stat.id, 10.0, 10.0, 200).unwrap();
        assert_eq!(first.value, 10.0);
        assert_eq!(first.created_at, 200);

        let second = store.apply_delta("p1", stat.id, 3.0, 3.0, 300).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.value, 13.0);
        assert_eq!(second.created_at, 200);
        assert_eq!(second.updated_at, 300);
    }

    #[test]
    fn conflict_arm_adds_delta_not_callers_sum() {
        let store = seeded_store();
        let stat = simple_stat(&store, "gold");
        store.apply_delta("p1", stat.id, 10.0, 10.0, 200).unwrap();

        // A racing caller that computed insert_value against a stale read
        // still lands only its delta.
        let row = store.apply_delta("p1", stat.id, 999.0, 5.0, 201).unwrap();
        assert_eq!(row.value, 15.0);
    }

    #[test]
    fn deleting_a_player_cascades_to_stat_rows() {
        let store = seeded_store();
        let stat = simple_stat(&store, "gold");
        store.apply_delta("p1", stat.id, 1.0, 1.0, 200).unwrap();

        assert!(store.delete_player("p1").unwrap());
        assert!(store.player_stat("p1", stat.id).unwrap().is_none());
    }

    #[test]
    fn recompute_overwrites_drifted_global_value() {
        let store = seeded_store();
        store.create_player("p2", false, 100).unwrap();
        let stat = store
            .create_stat(&StatDefinition {
                internal_name: "kills".to_string(),
                name: "Kills".to_string(),
                global: true,
                ..Default::default()
            })
            .unwrap();
        store.apply_delta("p1", stat.id, 4.0, 4.0, 200).unwrap();
        store.apply_delta("p2", stat.id, 6.0, 6.0, 200).unwrap();

        // Drift the cached column, then reconcile from the player rows.
        store.add_global_value(stat.id, 100.0).unwrap();
        assert_eq!(store.recompute_global_value(stat.id).unwrap(), 10.0);
    }

    #[test]
    fn unique_board_replaces_score_in_place() {
        let store = seeded_store();
        let alias = store.create_alias("p1", "username", "one").unwrap();
        let board = store
            .create_leaderboard("speedrun", "Speedrun", SortMode::Asc, true)
            .unwrap();

        let first = store
            .create_entry(&board, alias, 120.0, &BTreeMap::new(), 500)
            .unwrap();
        let second = store
            .create_entry(&board, alias, 110.0, &BTreeMap::new(), 600)
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.score, 110.0);
        assert_eq!(second.created_at, 500);
    }

    #[test]
    fn moving_refresh_interval_off_never_archives_entries() {
        let store = seeded_store();
        let alias = store.create_alias("p1", "username", "one").unwrap();
        let board = store
            .create_leaderboard("weekly", "Weekly", SortMode::Desc, false)
            .unwrap();
        store
            .create_entry(&board, alias, 10.0, &BTreeMap::new(), 500)
            .unwrap();

        let archived = store
            .set_refresh_interval(board.id, RefreshInterval::Weekly, 900)
            .unwrap();
        assert_eq!(archived, 1);

        // Already-archived entries are left alone on a second change.
        let archived = store
            .set_refresh_interval(board.id, RefreshInterval::Daily, 901)
            .unwrap();
        assert_eq!(archived, 0);
    }
}
