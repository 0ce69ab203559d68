//! Fire-and-forget audit events for "who changed what" display.
//!
//! Emitted as structured tracing events under the `activity` target so a
//! subscriber can route them separately; not required for correctness.

pub fn stat_changed(player_id: &str, stat: &str, delta: f64, value: f64) {
    tracing::info!(
        target: "activity",
        action = "stat_changed",
        player = %player_id,
        stat = %stat,
        delta,
        value,
        "player stat changed"
    );
}

pub fn stat_definition_changed(actor: &str, stat: &str) {
    tracing::info!(
        target: "activity",
        action = "stat_definition_changed",
        actor = %actor,
        stat = %stat,
        "stat definition changed"
    );
}

pub fn entry_updated(actor: &str, entry_id: i64, score: Option<f64>, hidden: Option<bool>) {
    tracing::info!(
        target: "activity",
        action = "leaderboard_entry_updated",
        actor = %actor,
        entry = entry_id,
        score = score.unwrap_or(f64::NAN),
        hidden = ?hidden,
        "leaderboard entry updated"
    );
}
