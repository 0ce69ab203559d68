use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tally_service::{Api, Service, ServiceConfig};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "tally-service".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("tally-service");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(about = "Competitive-metrics backend for tally.")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,
    #[arg(long, default_value_t = 7780)]
    port: u16,
    /// Counter store path; omit for an in-memory store.
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Analytics store path; omit to disable snapshots and history.
    #[arg(long)]
    snapshots_path: Option<PathBuf>,
    #[arg(long)]
    snapshot_buffer: Option<usize>,
    #[arg(long)]
    snapshot_batch_size: Option<usize>,
    #[arg(long)]
    snapshot_linger_ms: Option<u64>,
    #[arg(long)]
    snapshot_retry_limit: Option<usize>,
    #[arg(long)]
    snapshot_retention_days: Option<u64>,
    #[arg(long)]
    invalidation_buffer: Option<usize>,
    #[arg(long)]
    cache_redis_url: Option<String>,
    #[arg(long)]
    cache_redis_prefix: Option<String>,
    #[arg(long)]
    cache_ttl_seconds: Option<u64>,
    /// Fix entry TTLs at write time instead of refreshing them on each hit.
    #[arg(long)]
    cache_fixed_ttl: bool,
    /// Seconds between global-counter reconciliation runs; 0 disables.
    #[arg(long)]
    reconcile_interval_seconds: Option<u64>,
    #[arg(long)]
    items_per_page: Option<u64>,
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,
    #[arg(long)]
    mutate_rate_limit_per_minute: Option<u64>,
    #[arg(long)]
    mutate_rate_limit_burst: Option<u32>,
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
    /// Integration endpoint notified after each successful stat change.
    #[arg(long)]
    webhook_url: Option<String>,
}

fn map_optional_limit<T: PartialEq + From<u8>>(value: Option<T>, default: Option<T>) -> Option<T> {
    match value {
        Some(value) if value == T::from(0) => None,
        Some(value) => Some(value),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    let defaults = ServiceConfig::default();
    Ok(ServiceConfig {
        db_path: args.db_path.clone(),
        snapshots_path: args.snapshots_path.clone(),
        snapshot_buffer: map_optional_limit(args.snapshot_buffer, defaults.snapshot_buffer),
        snapshot_batch_size: map_optional_limit(
            args.snapshot_batch_size,
            defaults.snapshot_batch_size,
        ),
        snapshot_linger_ms: args.snapshot_linger_ms.or(defaults.snapshot_linger_ms),
        snapshot_retry_limit: args.snapshot_retry_limit.or(defaults.snapshot_retry_limit),
        snapshot_retention_days: args.snapshot_retention_days,
        invalidation_buffer: map_optional_limit(
            args.invalidation_buffer,
            defaults.invalidation_buffer,
        ),
        cache_redis_url: args.cache_redis_url.clone(),
        cache_redis_prefix: args
            .cache_redis_prefix
            .clone()
            .or_else(|| defaults.cache_redis_prefix.clone()),
        cache_ttl_seconds: map_optional_limit(args.cache_ttl_seconds, defaults.cache_ttl_seconds),
        cache_sliding: Some(!args.cache_fixed_ttl),
        reconcile_interval_seconds: args
            .reconcile_interval_seconds
            .or(defaults.reconcile_interval_seconds),
        items_per_page: map_optional_limit(args.items_per_page, defaults.items_per_page),
        http_rate_limit_per_second: map_optional_limit(
            args.http_rate_limit_per_second,
            defaults.http_rate_limit_per_second,
        ),
        http_rate_limit_burst: map_optional_limit(
            args.http_rate_limit_burst,
            defaults.http_rate_limit_burst,
        ),
        mutate_rate_limit_per_minute: map_optional_limit(
            args.mutate_rate_limit_per_minute,
            defaults.mutate_rate_limit_per_minute,
        ),
        mutate_rate_limit_burst: map_optional_limit(
            args.mutate_rate_limit_burst,
            defaults.mutate_rate_limit_burst,
        ),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
        webhook_url: args.webhook_url.clone(),
    })
}

fn is_production() -> bool {
    matches!(std::env::var("TALLY_ENV").as_deref(), Ok("production"))
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ADMIN_AUTH_TOKEN")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_env("ALLOWED_HTTP_ORIGINS")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing()?;
    ensure_production_env()?;

    let config = build_config(&args)?;
    if config.db_path.is_none() {
        tracing::warn!("no --db-path set; counter store is in memory and will not survive restart");
    }

    let service = Arc::new(
        Service::new_with_config(config, Vec::new()).context("failed to build service")?,
    );
    service.start_reconciliation();
    service.start_retention();

    let api = Api::new(Arc::clone(&service));
    let app = api.router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
