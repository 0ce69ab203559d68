//! Registered external integrations.
//!
//! Hooks are notified after a successful mutation with the updated row. The
//! pipeline does not know or care what a hook does; `notify` must return
//! quickly (spawn real work) and failures stay inside the hook.

use serde::Serialize;
use tally_types::{PlayerStat, Stat};

/// Payload handed to every registered hook after a successful apply.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatUpdated {
    pub player_stat: PlayerStat,
    pub stat: Stat,
    pub delta: f64,
}

pub trait IntegrationHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Best-effort, fire-and-forget. Never surfaces errors to the caller.
    fn notify(&self, update: &PlayerStatUpdated);
}

/// Forwards updates to an external HTTP endpoint.
pub struct WebhookHook {
    client: reqwest::Client,
    url: String,
}

impl WebhookHook {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

impl IntegrationHook for WebhookHook {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, update: &PlayerStatUpdated) {
        let client = self.client.clone();
        let url = self.url.clone();
        let payload = match serde_json::to_value(update) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("webhook payload encode failed: {err}");
                return;
            }
        };
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = response.status().as_u16(),
                        "webhook delivery rejected"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("webhook delivery failed: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) struct CountingHook {
        pub calls: Arc<AtomicUsize>,
    }

    impl IntegrationHook for CountingHook {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn notify(&self, _update: &PlayerStatUpdated) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn payload_serializes_with_camel_case_names() {
        let update = PlayerStatUpdated {
            player_stat: PlayerStat {
                id: 1,
                player_id: "p1".to_string(),
                stat_id: 2,
                value: 3.0,
                created_at: 0,
                updated_at: 0,
            },
            stat: Stat {
                id: 2,
                internal_name: "gold".to_string(),
                name: "Gold".to_string(),
                default_value: 0.0,
                min_value: None,
                max_value: None,
                max_change: None,
                min_time_between_updates: 0,
                global: false,
                global_value: 0.0,
            },
            delta: 3.0,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["playerStat"]["playerId"], "p1");
        assert_eq!(json["stat"]["internalName"], "gold");
    }
}
