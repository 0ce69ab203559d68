use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Direction a leaderboard orders scores in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Asc,
    Desc,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl std::str::FromStr for SortMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err("valid values: asc, desc"),
        }
    }
}

/// How often a leaderboard starts over. Anything other than `Never`
/// archives the live entries when first configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshInterval {
    Never,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RefreshInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl std::str::FromStr for RefreshInterval {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err("valid values: never, daily, weekly, monthly, yearly"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub id: i64,
    pub internal_name: String,
    pub name: String,
    pub sort_mode: SortMode,
    /// When true, an alias holds at most one entry on this leaderboard.
    pub unique_entries: bool,
    pub refresh_interval: RefreshInterval,
}

/// One scored row on a leaderboard.
///
/// Ordering is (score per the leaderboard's sort mode, then `created_at`
/// ascending). The tie-break makes the total order deterministic, which both
/// pagination and rank computation depend on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub id: i64,
    pub leaderboard_id: i64,
    pub alias_id: i64,
    pub score: f64,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub props: BTreeMap<String, String>,
}
