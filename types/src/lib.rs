pub mod api;
pub mod leaderboard;
pub mod stat;

pub use leaderboard::{Leaderboard, LeaderboardEntry, RefreshInterval, SortMode};
pub use stat::{PlayerStat, Stat, StatSnapshot};

/// Unix timestamp in seconds.
pub type Timestamp = i64;
