//! Wire types for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::{LeaderboardEntry, PlayerStat, StatSnapshot, Timestamp};

/// Body of `PUT /v1/stats/:internal_name`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatChangeRequest {
    pub change: f64,
    /// Backdates the recorded snapshot when replaying client-buffered
    /// offline events in their original order. Gate checks still run
    /// against wall-clock now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuity_timestamp: Option<Timestamp>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatChangeResponse {
    pub player_stat: PlayerStat,
}

/// Uniform 4xx/5xx body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// A leaderboard entry annotated with its position.
///
/// For untargeted listings the position is page-relative
/// (`index + page * items_per_page`); when the query targets an alias it is
/// the entry's true global rank.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub position: u64,
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntriesPage {
    pub entries: Vec<RankedEntry>,
    pub count: u64,
    pub items_per_page: u64,
    pub is_last_page: bool,
}

/// Aggregates computed over the filtered snapshot window.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub average: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub snapshots: Vec<StatSnapshot>,
    pub count: u64,
    pub items_per_page: u64,
    pub is_last_page: bool,
    pub metrics: AggregateMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn ranked_entry_flattens_the_entry() {
        let ranked = RankedEntry {
            position: 4,
            entry: LeaderboardEntry {
                id: 9,
                leaderboard_id: 2,
                alias_id: 3,
                score: 77.0,
                hidden: false,
                deleted_at: None,
                archived_at: None,
                created_at: 1_700_000_000,
                props: BTreeMap::new(),
            },
        };
        let json = serde_json::to_value(&ranked).unwrap();
        assert_eq!(json["position"], 4);
        assert_eq!(json["score"], 77.0);
        assert!(json.get("entry").is_none());
    }

    #[test]
    fn change_request_accepts_missing_continuity() {
        let request: StatChangeRequest = serde_json::from_str("{\"change\": -3.5}").unwrap();
        assert_eq!(request.change, -3.5);
        assert!(request.continuity_timestamp.is_none());
    }
}
