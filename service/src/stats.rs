//! The stat mutation pipeline.
//!
//! Gate checks (throttle, magnitude, range) run against a read that can be
//! stale relative to the atomic increment that follows: two concurrent
//! requests may both pass the range gate against the same `current` and both
//! land their deltas, transiently pushing the stored value past a configured
//! bound. This is a deliberate relaxed-consistency trade-off: the increment
//! is what must never lose an update, while the bounds are advisory under
//! concurrency. Do not "fix" it by serializing the gates into a transaction.

use std::sync::Arc;

use tally_types::{PlayerStat, Stat, StatSnapshot, Timestamp};
use thiserror::Error;

use crate::cache::{global_stat_key, player_stat_key, player_stats_key, Invalidation};
use crate::integrations::PlayerStatUpdated;
use crate::store::StoreError;
use crate::{activity, unix_now, Service};

#[derive(Debug, Error)]
pub enum StatChangeError {
    #[error("stat {0} not found")]
    UnknownStat(String),
    #[error("player {0} not found")]
    UnknownPlayer(String),
    #[error("stat was updated too recently, try again in {retry_after_seconds}s")]
    Throttled { retry_after_seconds: u64 },
    #[error("stat change cannot be greater than {max}")]
    ChangeTooLarge { max: f64 },
    #[error("stat would fall below the minimum value of {min}")]
    BelowMin { min: f64 },
    #[error("stat would exceed the maximum value of {max}")]
    AboveMax { max: f64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StatChangeError {
    /// Gate rejections are the caller's fault; store trouble is ours.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

#[derive(Clone, Debug)]
pub struct ChangeRequest {
    pub player_id: String,
    pub alias_id: i64,
    pub internal_name: String,
    pub change: f64,
    pub continuity_timestamp: Option<Timestamp>,
}

/// Rejects updates that arrive before the stat's cool-down has elapsed.
/// Accepts at exactly the boundary second.
fn check_throttle(
    stat: &Stat,
    existing: Option<&PlayerStat>,
    now: Timestamp,
) -> Result<(), StatChangeError> {
    if stat.min_time_between_updates == 0 {
        return Ok(());
    }
    let Some(row) = existing else {
        return Ok(());
    };
    let elapsed = now.saturating_sub(row.updated_at);
    if elapsed < stat.min_time_between_updates as i64 {
        return Err(StatChangeError::Throttled {
            retry_after_seconds: (stat.min_time_between_updates as i64 - elapsed) as u64,
        });
    }
    Ok(())
}

/// Rejects |change| above the configured per-update ceiling; accepts
/// equality.
fn check_magnitude(stat: &Stat, change: f64) -> Result<(), StatChangeError> {
    if let Some(max) = stat.max_change {
        if change.abs() > max {
            return Err(StatChangeError::ChangeTooLarge { max });
        }
    }
    Ok(())
}

/// Rejects a change whose projected result leaves [min, max]; either bound
/// may be unset, and exact boundary values are accepted.
fn check_range(stat: &Stat, current: f64, change: f64) -> Result<(), StatChangeError> {
    let next = current + change;
    if let Some(min) = stat.min_value {
        if next < min {
            return Err(StatChangeError::BelowMin { min });
        }
    }
    if let Some(max) = stat.max_value {
        if next > max {
            return Err(StatChangeError::AboveMax { max });
        }
    }
    Ok(())
}

/// Applies a change end to end: load, gate, atomically apply, then hand the
/// side effects to the background path. Returns the authoritative post-write
/// row. Retrying a timed-out call reapplies the same delta, so a client
/// retry after an ambiguous failure can double-apply; that consistency gap
/// is inherited and documented, not resolved here.
pub async fn apply_change(
    service: Arc<Service>,
    request: ChangeRequest,
) -> Result<PlayerStat, StatChangeError> {
    let now = unix_now();
    let store = service.store();

    let loaded = {
        let store = Arc::clone(&store);
        let player_id = request.player_id.clone();
        let internal_name = request.internal_name.clone();
        tokio::task::spawn_blocking(move || -> Result<_, StatChangeError> {
            let stat = store
                .stat_by_internal_name(&internal_name)?
                .ok_or(StatChangeError::UnknownStat(internal_name))?;
            if !store.player_exists(&player_id)? {
                return Err(StatChangeError::UnknownPlayer(player_id));
            }
            let existing = store.player_stat(&player_id, stat.id)?;
            Ok((stat, existing))
        })
        .await
        .map_err(|_| StoreError::Task)?
    };
    let (stat, existing) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => {
            service.pipeline_metrics().record_rejection(&err);
            return Err(err);
        }
    };

    let current = existing
        .as_ref()
        .map(|row| row.value)
        .unwrap_or(stat.default_value);
    let gated = check_throttle(&stat, existing.as_ref(), now)
        .and_then(|()| check_magnitude(&stat, request.change))
        .and_then(|()| check_range(&stat, current, request.change));
    if let Err(err) = gated {
        service.pipeline_metrics().record_rejection(&err);
        return Err(err);
    }

    // The atomic apply. insert_value only matters for the first row; the
    // conflict arm advances the stored value server-side.
    let row = {
        let store = Arc::clone(&store);
        let player_id = request.player_id.clone();
        let stat_id = stat.id;
        let insert_value = current + request.change;
        let delta = request.change;
        tokio::task::spawn_blocking(move || {
            store.apply_delta(&player_id, stat_id, insert_value, delta, now)
        })
        .await
        .map_err(|_| StoreError::Task)??
    };

    service.pipeline_metrics().inc_applied();
    let created_at = request.continuity_timestamp.unwrap_or(now);
    tokio::spawn(finish_apply(
        Arc::clone(&service),
        stat,
        row.clone(),
        request,
        created_at,
    ));

    Ok(row)
}

/// The deferred tail of a successful apply. Nothing here can fail the
/// mutation: the relational write already committed, so every error below is
/// logged and swallowed.
async fn finish_apply(
    service: Arc<Service>,
    stat: Stat,
    row: PlayerStat,
    request: ChangeRequest,
    created_at: Timestamp,
) {
    let global_value = if stat.global {
        // Two independently-updated counters: the relational column and the
        // fast-cache key. They can transiently disagree; reconciliation
        // recomputes both from the player rows.
        let relational = {
            let store = service.store();
            let stat_id = stat.id;
            let delta = request.change;
            match tokio::task::spawn_blocking(move || store.add_global_value(stat_id, delta)).await
            {
                Ok(Ok(value)) => Some(value),
                Ok(Err(err)) => {
                    tracing::warn!(
                        stat = %stat.internal_name,
                        "global value update failed: {err}"
                    );
                    None
                }
                Err(err) => {
                    tracing::warn!("global value task failed: {err}");
                    None
                }
            }
        };
        let cached = service
            .cache()
            .add_global(&global_stat_key(stat.id), request.change)
            .await;
        relational.or(cached)
    } else {
        None
    };

    service.invalidator().defer(Invalidation::Keys(vec![
        player_stat_key(&request.player_id, &stat.internal_name),
        player_stats_key(&request.player_id),
    ]));

    let update = PlayerStatUpdated {
        player_stat: row.clone(),
        stat: stat.clone(),
        delta: request.change,
    };
    for hook in service.integrations() {
        hook.notify(&update);
    }

    if let Some(snapshots) = service.snapshots() {
        snapshots.enqueue(StatSnapshot {
            player_id: request.player_id.clone(),
            alias_id: request.alias_id,
            stat_id: stat.id,
            delta: request.change,
            value: row.value,
            global_value,
            created_at,
        });
    }

    activity::stat_changed(&request.player_id, &stat.internal_name, request.change, row.value);
}
