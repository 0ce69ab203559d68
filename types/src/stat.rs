use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Definition of a tracked counter: per-player, optionally aggregated
/// globally across all players of a game.
///
/// `global_value` is the relational mirror of the global counter. It is
/// advanced by the mutation pipeline and overwritten by the periodic
/// reconciliation job; it can transiently disagree with the fast-cache
/// counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub id: i64,
    pub internal_name: String,
    pub name: String,
    pub default_value: f64,
    /// Lower bound on the post-change value. None = unbounded.
    pub min_value: Option<f64>,
    /// Upper bound on the post-change value. None = unbounded.
    pub max_value: Option<f64>,
    /// Largest accepted |change| per update. None = unbounded.
    pub max_change: Option<f64>,
    /// Minimum seconds between accepted updates for the same player.
    pub min_time_between_updates: u64,
    pub global: bool,
    pub global_value: f64,
}

/// One row per (player, stat) pair, created on first successful change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStat {
    pub id: i64,
    pub player_id: String,
    pub stat_id: i64,
    pub value: f64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Immutable analytics record of a single applied change.
///
/// `created_at` may be backdated via a caller-supplied continuity timestamp
/// (offline replay); every other invariant is evaluated against wall-clock
/// now at apply time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSnapshot {
    pub player_id: String,
    pub alias_id: i64,
    pub stat_id: i64,
    pub delta: f64,
    /// The per-player value after the change was applied.
    pub value: f64,
    /// The global value after the change, for global stats only.
    pub global_value: Option<f64>,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_wire_names_are_camel_case() {
        let stat = Stat {
            id: 1,
            internal_name: "gold-collected".to_string(),
            name: "Gold collected".to_string(),
            default_value: 0.0,
            min_value: Some(0.0),
            max_value: None,
            max_change: Some(100.0),
            min_time_between_updates: 5,
            global: true,
            global_value: 0.0,
        };
        let json = serde_json::to_value(&stat).unwrap();
        assert_eq!(json["internalName"], "gold-collected");
        assert_eq!(json["minTimeBetweenUpdates"], 5);
        assert!(json["maxValue"].is_null());
    }

    #[test]
    fn snapshot_global_value_omitted_for_non_global() {
        let snapshot = StatSnapshot {
            player_id: "p1".to_string(),
            alias_id: 7,
            stat_id: 1,
            delta: 2.5,
            value: 12.5,
            global_value: None,
            created_at: 1_700_000_000,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["globalValue"].is_null());
        assert_eq!(json["delta"], 2.5);
    }
}
