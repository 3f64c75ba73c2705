use actix_cors::Cors;
use actix_web::{http::header, App, HttpServer};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fragment_orchestrator::api::{self, ApiContext};
use fragment_orchestrator::config_service;
use fragment_orchestrator::coordinator::CoordinatorContext;
use fragment_orchestrator::detection::DetectionEngine;
use fragment_orchestrator::progress::ProgressBus;
use fragment_orchestrator::providers::{HttpProviderClient, ProviderClient};
use fragment_orchestrator::router::{self, ProviderRegistry};
use fragment_orchestrator::state_service::{MemoryStateStore, RedisStateStore, StateStore};
use shared_types::ProviderId;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    platform::init_tracing("fragment_orchestrator").expect("failed to init tracing");

    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9464".to_string())
        .parse()
        .expect("METRICS_ADDR must be host:port");
    if let Err(e) = platform::init_metrics(metrics_addr) {
        warn!(error = %e, "metrics exporter disabled");
    }

    let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_dir = PathBuf::from(
        std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string()),
    );
    let config = Arc::new(
        config_service::load_layered(&config_dir, &app_env).expect("failed to load configuration"),
    );
    info!(
        providers = config.providers.len(),
        environment = %app_env,
        "configuration loaded"
    );

    // Redis unavailability is soft: records stay in memory and response
    // caching is disabled.
    let (store, cache_enabled): (Arc<dyn StateStore>, bool) = match &config.redis {
        Some(redis_config) => match RedisStateStore::new(redis_config) {
            Ok(store) => (Arc::new(store), true),
            Err(e) => {
                warn!(error = %e, "redis unavailable, continuing with in-memory records");
                (Arc::new(MemoryStateStore::new()), false)
            }
        },
        None => (Arc::new(MemoryStateStore::new()), false),
    };

    let registry = Arc::new(ProviderRegistry::new(
        config.providers.clone(),
        config.circuit_breaker.clone(),
    ));
    let clients: Arc<HashMap<ProviderId, Arc<dyn ProviderClient>>> = Arc::new(
        config
            .providers
            .iter()
            .map(|p| {
                let client: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(p.clone()));
                (p.id.clone(), client)
            })
            .collect(),
    );

    let bus = Arc::new(ProgressBus::new(config.pipeline.max_replay));
    let detection = Arc::new(DetectionEngine::with_defaults());
    let probe_interval = Duration::from_millis(config.pipeline.health_probe_interval_ms);

    let coordinator = Arc::new(CoordinatorContext {
        config,
        detection,
        registry: registry.clone(),
        clients: clients.clone(),
        bus,
        store,
        records: DashMap::new(),
        cancellations: DashMap::new(),
        cache_enabled,
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(router::run_health_probe(
        registry,
        clients,
        probe_interval,
        shutdown.child_token(),
    ));

    let bind_addr = std::env::var("APP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    info!(%bind_addr, "starting HTTP server");

    let api_ctx = ApiContext {
        coordinator,
        app_env: app_env.clone(),
    };

    let server_env = app_env.clone();
    let result = HttpServer::new(move || {
        let cors = if server_env == "prod" {
            let allowed = std::env::var("ALLOWED_ORIGIN")
                .unwrap_or_else(|_| "https://localhost".to_string());
            Cors::default()
                .allowed_origin(&allowed)
                .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                .max_age(3600)
        } else {
            Cors::permissive()
        };

        let ctx = api_ctx.clone();
        App::new()
            .wrap(cors)
            .configure(move |cfg| api::configure(cfg, ctx))
    })
    .bind(&bind_addr)?
    .run()
    .await;

    shutdown.cancel();
    result
}
