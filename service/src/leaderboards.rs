//! Leaderboard listing and rank computation.
//!
//! Listings and ranks always query the entry table directly; nothing here is
//! cached, because a rank is sensitive to every concurrent write. Ordering is
//! score per the board's sort mode with `created_at` ascending as tie-break,
//! which fixes a deterministic total order for both pagination and rank.
//! Queries run on the same mutex-serialized WAL connection as writes, so a
//! request always reads monotonically; replica reads are out of scope.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tally_types::api::{EntriesPage, RankedEntry};
use tally_types::{Leaderboard, LeaderboardEntry, SortMode};

use crate::store::{map_entry, Store, StoreError, StoreResult};

pub const DEFAULT_ITEMS_PER_PAGE: u64 = 50;

/// Composable entry filters. The restricted defaults (no hidden, no deleted,
/// no dev-build, no archived) are what an unprivileged API consumer gets; the
/// caller's policy layer decides which switches it may flip.
#[derive(Clone, Debug, Default)]
pub struct EntryFilter {
    /// Target one alias's entries; their positions become true global ranks.
    pub alias_id: Option<i64>,
    pub with_deleted: bool,
    pub include_hidden: bool,
    pub include_dev: bool,
    pub include_archived: bool,
    pub prop_key: Option<String>,
    pub prop_value: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct PageRequest {
    pub page: u64,
    pub per_page: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: DEFAULT_ITEMS_PER_PAGE,
        }
    }
}

/// `(WHERE fragment, args)` shared by the listing, the count, and the rank
/// set so all three always see the same population.
fn filter_sql(
    board: &Leaderboard,
    filter: &EntryFilter,
    target_alias: bool,
) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["leaderboard_id = ?".to_string()];
    let mut args = vec![SqlValue::Integer(board.id)];
    if !filter.with_deleted {
        clauses.push("deleted_at IS NULL".to_string());
    }
    if !filter.include_hidden {
        clauses.push("hidden = 0".to_string());
    }
    if !filter.include_archived {
        clauses.push("archived_at IS NULL".to_string());
    }
    if !filter.include_dev {
        clauses.push(
            "alias_id IN (SELECT aliases.id FROM aliases
                          JOIN players ON players.id = aliases.player_id
                          WHERE players.dev_build = 0)"
                .to_string(),
        );
    }
    if let (Some(key), Some(value)) = (&filter.prop_key, &filter.prop_value) {
        clauses.push("json_extract(props, ?) = ?".to_string());
        args.push(SqlValue::Text(format!("$.{key}")));
        args.push(SqlValue::Text(value.clone()));
    }
    if target_alias {
        if let Some(alias_id) = filter.alias_id {
            clauses.push("alias_id = ?".to_string());
            args.push(SqlValue::Integer(alias_id));
        }
    }
    (clauses.join(" AND "), args)
}

fn order_sql(board: &Leaderboard) -> &'static str {
    match board.sort_mode {
        SortMode::Desc => "ORDER BY score DESC, created_at ASC, id ASC",
        SortMode::Asc => "ORDER BY score ASC, created_at ASC, id ASC",
    }
}

/// Zero-based index of `id` in the globally ordered id set.
fn position_in(ids: &[i64], id: i64) -> Option<u64> {
    ids.iter().position(|candidate| *candidate == id).map(|index| index as u64)
}

/// The rank set: every entry whose score is better than or equal to the
/// target's (exact ties included), under the same filters and ordering as
/// the listing. The target's index in that set is its true rank, independent
/// of whatever page the caller happens to be viewing.
fn rank_of(
    conn: &Connection,
    board: &Leaderboard,
    filter: &EntryFilter,
    entry: &LeaderboardEntry,
) -> StoreResult<u64> {
    let (where_sql, mut args) = filter_sql(board, filter, false);
    let comparison = match board.sort_mode {
        SortMode::Desc => "score >= ?",
        SortMode::Asc => "score <= ?",
    };
    args.push(SqlValue::Real(entry.score));
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM leaderboard_entries WHERE {where_sql} AND {comparison} {}",
        order_sql(board)
    ))?;
    let ids = stmt
        .query_map(rusqlite::params_from_iter(args), |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(position_in(&ids, entry.id).unwrap_or_else(|| {
        // The entry passed the listing filters, so it belongs to the set;
        // reaching this means a concurrent write moved it mid-request.
        tracing::warn!(entry = entry.id, "entry missing from its own rank set");
        ids.len() as u64
    }))
}

/// Filtered, ordered, paginated listing. Fetches `per_page + 1` rows so the
/// last page is detected without a second count query. Positions are
/// page-relative (`index + page * per_page`) unless the filter targets an
/// alias, in which case each returned entry carries its true global rank,
/// recomputed fresh on every request.
pub fn list_entries(
    store: &Store,
    board: &Leaderboard,
    filter: &EntryFilter,
    page: &PageRequest,
) -> StoreResult<EntriesPage> {
    let per_page = page.per_page.max(1);
    let conn = store.lock();
    let (where_sql, args) = filter_sql(board, filter, true);

    let count: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM leaderboard_entries WHERE {where_sql}"),
        rusqlite::params_from_iter(args.iter().cloned()),
        |row| row.get(0),
    )?;

    let limit = (per_page + 1) as i64;
    let offset = (page.page * per_page) as i64;
    let mut stmt = conn.prepare(&format!(
        "SELECT id, leaderboard_id, alias_id, score, hidden, deleted_at,
                archived_at, created_at, props
         FROM leaderboard_entries WHERE {where_sql} {} LIMIT ? OFFSET ?",
        order_sql(board)
    ))?;
    let mut entries = Vec::new();
    let rows = stmt.query_map(
        rusqlite::params_from_iter(args.iter().cloned().chain([
            SqlValue::Integer(limit),
            SqlValue::Integer(offset),
        ])),
        map_entry,
    )?;
    for row in rows {
        entries.push(row?.map_err(StoreError::from)?);
    }
    let is_last_page = entries.len() as u64 <= per_page;
    entries.truncate(per_page as usize);

    let mut ranked = Vec::with_capacity(entries.len());
    if filter.alias_id.is_some() {
        for entry in entries {
            let position = rank_of(&conn, board, filter, &entry)?;
            ranked.push(RankedEntry { position, entry });
        }
    } else {
        for (index, entry) in entries.into_iter().enumerate() {
            ranked.push(RankedEntry {
                position: index as u64 + page.page * per_page,
                entry,
            });
        }
    }

    Ok(EntriesPage {
        entries: ranked,
        count,
        items_per_page: per_page,
        is_last_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Store,
        board: Leaderboard,
        aliases: Vec<i64>,
    }

    fn fixture(sort_mode: SortMode, players: usize) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let mut aliases = Vec::new();
        for index in 0..players {
            let player_id = format!("p{index}");
            store.create_player(&player_id, false, 100).unwrap();
            aliases.push(
                store
                    .create_alias(&player_id, "username", &format!("alias{index}"))
                    .unwrap(),
            );
        }
        let board = store
            .create_leaderboard("high-scores", "High scores", sort_mode, false)
            .unwrap();
        Fixture {
            store,
            board,
            aliases,
        }
    }

    fn seed_entry(fixture: &Fixture, alias: i64, score: f64, created_at: i64) -> LeaderboardEntry {
        fixture
            .store
            .create_entry(&fixture.board, alias, score, &BTreeMap::new(), created_at)
            .unwrap()
    }

    #[test]
    fn orders_by_score_then_created_at() {
        let fixture = fixture(SortMode::Desc, 3);
        seed_entry(&fixture, fixture.aliases[0], 50.0, 1_000);
        seed_entry(&fixture, fixture.aliases[1], 50.0, 2_000);
        seed_entry(&fixture, fixture.aliases[2], 30.0, 3_000);

        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest::default(),
        )
        .unwrap();
        let order: Vec<i64> = page
            .entries
            .iter()
            .map(|ranked| ranked.entry.alias_id)
            .collect();
        assert_eq!(
            order,
            vec![fixture.aliases[0], fixture.aliases[1], fixture.aliases[2]]
        );
        assert_eq!(page.count, 3);
        assert!(page.is_last_page);

        // Stable across repeated calls with no intervening writes.
        let again = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(
            again
                .entries
                .iter()
                .map(|ranked| ranked.entry.id)
                .collect::<Vec<_>>(),
            page.entries
                .iter()
                .map(|ranked| ranked.entry.id)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn ascending_boards_put_lowest_first() {
        let fixture = fixture(SortMode::Asc, 2);
        seed_entry(&fixture, fixture.aliases[0], 95.5, 1_000);
        seed_entry(&fixture, fixture.aliases[1], 64.2, 2_000);

        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(page.entries[0].entry.alias_id, fixture.aliases[1]);
    }

    #[test]
    fn tied_second_place_ranks_one() {
        let fixture = fixture(SortMode::Desc, 3);
        seed_entry(&fixture, fixture.aliases[0], 50.0, 1_000);
        seed_entry(&fixture, fixture.aliases[1], 50.0, 2_000);
        seed_entry(&fixture, fixture.aliases[2], 30.0, 3_000);

        let filter = EntryFilter {
            alias_id: Some(fixture.aliases[1]),
            ..Default::default()
        };
        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &filter,
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].position, 1);
    }

    #[test]
    fn strictly_best_score_ranks_zero() {
        let fixture = fixture(SortMode::Desc, 3);
        seed_entry(&fixture, fixture.aliases[0], 10.0, 1_000);
        seed_entry(&fixture, fixture.aliases[1], 90.0, 2_000);
        seed_entry(&fixture, fixture.aliases[2], 40.0, 3_000);

        let filter = EntryFilter {
            alias_id: Some(fixture.aliases[1]),
            ..Default::default()
        };
        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &filter,
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(page.entries[0].position, 0);
    }

    #[test]
    fn tied_top_scores_rank_by_created_at() {
        let fixture = fixture(SortMode::Desc, 4);
        for (index, alias) in fixture.aliases.iter().enumerate() {
            seed_entry(&fixture, *alias, 100.0, 1_000 + index as i64);
        }

        for (index, alias) in fixture.aliases.iter().enumerate() {
            let filter = EntryFilter {
                alias_id: Some(*alias),
                ..Default::default()
            };
            let page = list_entries(
                &fixture.store,
                &fixture.board,
                &filter,
                &PageRequest::default(),
            )
            .unwrap();
            assert_eq!(page.entries[0].position, index as u64);
        }
    }

    #[test]
    fn rank_is_independent_of_the_viewed_page() {
        let fixture = fixture(SortMode::Desc, 5);
        for (index, alias) in fixture.aliases.iter().enumerate() {
            seed_entry(&fixture, *alias, 100.0 - index as f64, 1_000 + index as i64);
        }

        // The worst alias ranks 4 even though a page-1 listing would show it
        // at index 0 of its page.
        let filter = EntryFilter {
            alias_id: Some(fixture.aliases[4]),
            ..Default::default()
        };
        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &filter,
            &PageRequest { page: 0, per_page: 2 },
        )
        .unwrap();
        assert_eq!(page.entries[0].position, 4);
    }

    #[test]
    fn pagination_probes_for_the_last_page() {
        let fixture = fixture(SortMode::Desc, 5);
        for (index, alias) in fixture.aliases.iter().enumerate() {
            seed_entry(&fixture, *alias, 100.0 - index as f64, 1_000 + index as i64);
        }

        let request = PageRequest { page: 0, per_page: 2 };
        let first = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &request,
        )
        .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(!first.is_last_page);
        assert_eq!(first.count, 5);

        let last = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest { page: 2, per_page: 2 },
        )
        .unwrap();
        assert_eq!(last.entries.len(), 1);
        assert!(last.is_last_page);
        // Page-relative position: index within page + page * per_page.
        assert_eq!(last.entries[0].position, 4);
    }

    #[test]
    fn restricted_filters_hide_soft_deleted_hidden_and_dev_entries() {
        let fixture = fixture(SortMode::Desc, 3);
        let visible = seed_entry(&fixture, fixture.aliases[0], 50.0, 1_000);
        let deleted = seed_entry(&fixture, fixture.aliases[1], 60.0, 2_000);
        let hidden = seed_entry(&fixture, fixture.aliases[2], 70.0, 3_000);
        fixture.store.soft_delete_entry(deleted.id, 4_000).unwrap();
        fixture
            .store
            .update_entry(hidden.id, None, Some(true))
            .unwrap();

        // A dev-build player's entry.
        fixture.store.create_player("dev", true, 100).unwrap();
        let dev_alias = fixture.store.create_alias("dev", "username", "dev").unwrap();
        seed_entry(&fixture, dev_alias, 99.0, 5_000);

        let restricted = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(restricted.entries.len(), 1);
        assert_eq!(restricted.entries[0].entry.id, visible.id);

        let privileged = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter {
                with_deleted: true,
                include_hidden: true,
                include_dev: true,
                ..Default::default()
            },
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(privileged.entries.len(), 4);
    }

    #[test]
    fn prop_filter_narrows_the_population_and_the_rank_set() {
        let fixture = fixture(SortMode::Desc, 3);
        let mut props = BTreeMap::new();
        props.insert("map".to_string(), "aztec".to_string());
        fixture
            .store
            .create_entry(&fixture.board, fixture.aliases[0], 90.0, &BTreeMap::new(), 1_000)
            .unwrap();
        fixture
            .store
            .create_entry(&fixture.board, fixture.aliases[1], 50.0, &props, 2_000)
            .unwrap();
        fixture
            .store
            .create_entry(&fixture.board, fixture.aliases[2], 40.0, &props, 3_000)
            .unwrap();

        let filter = EntryFilter {
            alias_id: Some(fixture.aliases[2]),
            prop_key: Some("map".to_string()),
            prop_value: Some("aztec".to_string()),
            ..Default::default()
        };
        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &filter,
            &PageRequest::default(),
        )
        .unwrap();
        // The 90-point entry is outside the filtered population, so the
        // 40-point entry ranks second, not third.
        assert_eq!(page.entries[0].position, 1);
    }

    #[test]
    fn archived_entries_leave_the_listing() {
        let fixture = fixture(SortMode::Desc, 2);
        seed_entry(&fixture, fixture.aliases[0], 10.0, 1_000);
        seed_entry(&fixture, fixture.aliases[1], 20.0, 2_000);
        fixture
            .store
            .set_refresh_interval(fixture.board.id, tally_types::RefreshInterval::Weekly, 5_000)
            .unwrap();

        let page = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter::default(),
            &PageRequest::default(),
        )
        .unwrap();
        assert!(page.entries.is_empty());

        let archived = list_entries(
            &fixture.store,
            &fixture.board,
            &EntryFilter {
                include_archived: true,
                ..Default::default()
            },
            &PageRequest::default(),
        )
        .unwrap();
        assert_eq!(archived.entries.len(), 2);
    }
}
