use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Service;

mod http;

pub struct Api {
    service: Arc<Service>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
    allow_no_origin: bool,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn default_governor_config() -> Option<IpGovernorConfig> {
    GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .finish()
}

impl Api {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub fn router(&self) -> Router {
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS");
        let allow_any_origin = allowed_origins.contains("*");
        // Game SDK traffic is server-to-server or native and carries no
        // Origin header; only explicit opt-out blocks origin-less requests.
        let allow_no_origin = parse_env_flag("ALLOW_HTTP_NO_ORIGIN").unwrap_or(true);
        let cors_origins = allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();
        let origin_config = OriginConfig {
            allowed_origins: Arc::new(allowed_origins),
            allow_any_origin,
            allow_no_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-request-id"),
            header::HeaderName::from_static("x-player-id"),
            header::HeaderName::from_static("x-alias-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        // Rate limiting: environment variables override config.
        let http_rate_per_sec = parse_env_u64("RATE_LIMIT_HTTP_PER_SEC")
            .or(self.service.config().http_rate_limit_per_second);
        let http_rate_burst = parse_env_u32("RATE_LIMIT_HTTP_BURST")
            .or(self.service.config().http_rate_limit_burst);
        let mutate_rate_per_min = parse_env_u64("RATE_LIMIT_MUTATE_PER_MIN")
            .or(self.service.config().mutate_rate_limit_per_minute);
        let mutate_rate_burst = parse_env_u32("RATE_LIMIT_MUTATE_BURST")
            .or(self.service.config().mutate_rate_limit_burst);

        let governor_conf = match (http_rate_per_sec, http_rate_burst) {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                let config = GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .or_else(|| {
                        tracing::warn!("invalid rate-limit config; falling back to defaults");
                        default_governor_config()
                    });
                config.map(Arc::new)
            }
            _ => None,
        };

        // The mutation route gets its own, stricter per-minute limiter.
        let mutate_governor_conf = match (mutate_rate_per_min, mutate_rate_burst) {
            (Some(rate_per_minute), Some(burst_size)) if rate_per_minute > 0 && burst_size > 0 => {
                let nanos_per_request = (60_000_000_000u64 / rate_per_minute).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                let config = GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .or_else(|| {
                        tracing::warn!(
                            "invalid mutate rate-limit config; falling back to defaults"
                        );
                        default_governor_config()
                    });
                config.map(Arc::new)
            }
            _ => None,
        };

        let mutate_route = match mutate_governor_conf {
            Some(config) => Router::new()
                .route("/v1/stats/:internal_name", put(http::apply_stat_change))
                .layer(GovernorLayer { config }),
            None => Router::new().route("/v1/stats/:internal_name", put(http::apply_stat_change)),
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/livez", get(http::livez))
            .route("/readyz", get(http::readyz))
            .route("/health", get(http::health))
            .route("/config", get(http::config))
            .route("/metrics/http", get(http::http_metrics))
            .route("/metrics/pipeline", get(http::pipeline_metrics))
            .route("/metrics/cache", get(http::cache_metrics))
            .route("/metrics/snapshots", get(http::snapshot_metrics))
            .route("/metrics/system", get(http::system_metrics))
            .route("/metrics/prometheus", get(http::prometheus_metrics))
            .route("/v1/stats/:internal_name", get(http::get_stat))
            .route("/v1/stats/:internal_name/history", get(http::stat_history))
            .route(
                "/v1/stats/:internal_name/global-history",
                get(http::stat_global_history),
            )
            .route("/v1/players/:player_id/stats", get(http::get_player_stats))
            .route(
                "/v1/players/:player_id/stats/:internal_name",
                get(http::get_player_stat),
            )
            .route(
                "/v1/leaderboards/:internal_name/entries",
                get(http::list_leaderboard_entries),
            )
            .route("/v1/admin/stats", post(http::admin_create_stat))
            .route(
                "/v1/admin/stats/:internal_name",
                patch(http::admin_update_stat),
            )
            .route("/v1/admin/players", post(http::admin_create_player))
            .route(
                "/v1/admin/players/:player_id",
                delete(http::admin_delete_player),
            )
            .route(
                "/v1/admin/players/:player_id/aliases",
                post(http::admin_create_alias),
            )
            .route(
                "/v1/admin/players/:player_id/stats",
                delete(http::admin_reset_player_stats),
            )
            .route(
                "/v1/admin/leaderboards",
                post(http::admin_create_leaderboard),
            )
            .route(
                "/v1/admin/leaderboards/:internal_name",
                patch(http::admin_update_leaderboard),
            )
            .route(
                "/v1/admin/leaderboards/:internal_name/entries",
                post(http::admin_create_entry),
            )
            .route(
                "/v1/admin/entries/:entry_id",
                patch(http::admin_update_entry).delete(http::admin_delete_entry),
            );

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        let router = router.merge(mutate_route);

        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = match self.service.config().http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.service.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.service.clone())
    }
}

fn parse_allowed_origins(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_env_flag(var: &str) -> Option<bool> {
    match std::env::var(var).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES") => Some(true),
        Ok("0") | Ok("false") | Ok("FALSE") | Ok("no") | Ok("NO") => Some(false),
        _ => None,
    }
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    } else if !config.allow_no_origin {
        return (StatusCode::FORBIDDEN, "Origin required").into_response();
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(service): AxumState<Arc<Service>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    match response.status() {
        StatusCode::PAYLOAD_TOO_LARGE => service.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => service.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatDefinition;
    use crate::ServiceConfig;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tally_types::SortMode;
    use tower::ServiceExt;

    async fn test_api() -> (Arc<Service>, Router) {
        // Rate limiting is off: oneshot requests carry no peer address for
        // the key extractor.
        let config = ServiceConfig {
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            mutate_rate_limit_per_minute: None,
            mutate_rate_limit_burst: None,
            ..Default::default()
        };
        let service = Arc::new(Service::new_with_config(config, Vec::new()).unwrap());
        let router = Api::new(Arc::clone(&service)).router();
        (service, router)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_change(internal_name: &str, body: Value) -> Request {
        Request::builder()
            .method("PUT")
            .uri(format!("/v1/stats/{internal_name}"))
            .header("content-type", "application/json")
            .header("x-player-id", "p1")
            .header("x-alias-id", "1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn put_stat_applies_and_reports_rejections() {
        let (service, router) = test_api().await;
        service.store().create_player("p1", false, 0).unwrap();
        service
            .store()
            .create_stat(&StatDefinition {
                internal_name: "gold".to_string(),
                name: "Gold".to_string(),
                max_change: Some(10.0),
                min_time_between_updates: 60,
                ..Default::default()
            })
            .unwrap();

        let response = router
            .clone()
            .oneshot(put_change("gold", json!({ "change": 10.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["playerStat"]["value"], 10.0);

        // Within the throttle window: 400 with a human-readable message.
        let response = router
            .clone()
            .oneshot(put_change("gold", json!({ "change": 1.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("updated too recently"));

        // Unknown stats are 404, not 400.
        let response = router
            .clone()
            .oneshot(put_change("mana", json!({ "change": 1.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // A missing identity header never reaches the pipeline.
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/stats/gold")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "change": 1.0 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn entries_listing_annotates_positions_and_ranks() {
        let (service, router) = test_api().await;
        let store = service.store();
        let mut aliases = Vec::new();
        for index in 0..3 {
            let player = format!("p{index}");
            store.create_player(&player, false, 0).unwrap();
            aliases.push(
                store
                    .create_alias(&player, "username", &format!("alias{index}"))
                    .unwrap(),
            );
        }
        let board = store
            .create_leaderboard("high-scores", "High scores", SortMode::Desc, false)
            .unwrap();
        for (index, (alias, score)) in aliases
            .iter()
            .zip([50.0, 50.0, 30.0])
            .enumerate()
        {
            store
                .create_entry(
                    &board,
                    *alias,
                    score,
                    &Default::default(),
                    1_000 + index as i64,
                )
                .unwrap();
        }

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/leaderboards/high-scores/entries")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 3);
        assert_eq!(body["isLastPage"], true);
        let scores: Vec<f64> = body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["score"].as_f64().unwrap())
            .collect();
        assert_eq!(scores, vec![50.0, 50.0, 30.0]);

        // Targeting the second 50-scorer returns its true rank.
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/v1/leaderboards/high-scores/entries?aliasId={}",
                        aliases[1]
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["entries"][0]["position"], 1);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/leaderboards/unknown/entries")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn player_stat_reads_are_served_through_the_cache() {
        let (service, router) = test_api().await;
        service.store().create_player("p1", false, 0).unwrap();
        let stat = service
            .store()
            .create_stat(&StatDefinition {
                internal_name: "gold".to_string(),
                name: "Gold".to_string(),
                ..Default::default()
            })
            .unwrap();
        service
            .store()
            .apply_delta("p1", stat.id, 12.0, 12.0, 100)
            .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/players/p1/stats/gold")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["value"], 12.0);

        let misses = service.cache_metrics_snapshot().misses;
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/players/p1/stats/gold")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Second read was a hit.
        assert_eq!(service.cache_metrics_snapshot().misses, misses);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/players/p1/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admin_routes_reject_without_a_configured_token() {
        let (_, router) = test_api().await;
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/admin/stats")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "internalName": "gold", "name": "Gold" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints_answer() {
        let (_, router) = test_api().await;
        for uri in [
            "/healthz",
            "/livez",
            "/readyz",
            "/health",
            "/metrics/pipeline",
            "/metrics/cache",
            "/metrics/snapshots",
            "/metrics/http",
        ] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/metrics/prometheus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("tally_pipeline_applied_total"));
    }

    #[tokio::test]
    async fn history_is_unavailable_without_an_analytics_store() {
        let (service, router) = test_api().await;
        service
            .store()
            .create_stat(&StatDefinition {
                internal_name: "gold".to_string(),
                name: "Gold".to_string(),
                ..Default::default()
            })
            .unwrap();
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/stats/gold/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
