mod config;
mod db;
mod models;
mod responses;
mod routes;
mod services;
mod state;
pub mod utils;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::HeaderValue;
use axum::http::Method;
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use config::Config;
use db::postgres_billing_event_log_repository::PostgresBillingEventLogRepository;
use db::postgres_entitlement_repository::PostgresEntitlementRepository;
use reqwest::Client;
use responses::JsonResponse;
use routes::features::{check_feature, consume_feature};
use routes::subscription::{create_checkout, create_portal, get_subscription};
use routes::tokens::{get_token_balance, purchase_tokens};
use services::entitlement::EntitlementService;
use services::stripe::LiveStripeService;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utils::jwt::JwtKeys;

use crate::db::billing_event_log_repository::BillingEventLogRepository;
use crate::db::entitlement_repository::EntitlementRepository;
use crate::state::AppState;

#[cfg(feature = "tls")]
use axum_server::tls_rustls::RustlsConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _sentry_guard = std::env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let config = Config::from_env();

    let rate_limit_ms: u64 = std::env::var("RATE_LIMITER_MILLISECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        // Default: 200ms/token (~5 req/sec)
        .unwrap_or(200);
    let rate_limit_burst: u32 = std::env::var("RATE_LIMITER_BURST")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        // Allow short bursts during client polling (the reconciliation loop)
        .unwrap_or(20);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(rate_limit_ms)
            .burst_size(rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .expect("rate limiter configuration should be valid"),
    );

    // Background task to clean up old rate-limit buckets
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pg_pool = establish_connection(&config.database_url).await;

    let db = Arc::new(PostgresEntitlementRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn EntitlementRepository>;
    let billing_events = Arc::new(PostgresBillingEventLogRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn BillingEventLogRepository>;

    let stripe = Arc::new(LiveStripeService::from_settings(&config.stripe));
    let jwt_keys = Arc::new(JwtKeys::from_env().expect("JWT secret must be configured"));
    let http_client = Arc::new(Client::new());

    let state = AppState {
        db: db.clone(),
        billing_events,
        entitlements: EntitlementService::new(db),
        stripe,
        http_client,
        config: Arc::new(config.clone()),
        jwt_keys,
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<HeaderValue>()
                .expect("FRONTEND_ORIGIN should be a valid origin"),
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        .route("/subscription", get(get_subscription))
        .route("/subscription/checkout", post(create_checkout))
        .route("/subscription/portal", post(create_portal))
        .route("/tokens/purchase", post(purchase_tokens))
        .route("/tokens/balance", get(get_token_balance))
        .route("/features/check", post(check_feature))
        .route("/features/consume", post(consume_feature));

    // The webhook stays outside CORS/auth layers: the processor calls it
    // server-to-server with its own signature scheme.
    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api_routes)
        .route("/api/stripe/webhook", post(routes::stripe::webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(cors);

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));

    #[cfg(feature = "tls")]
    {
        let tls_config = RustlsConfig::from_pem_file(
            std::env::var("DEV_CERT_LOCATION").expect("DEV_CERT_LOCATION must be set"),
            std::env::var("DEV_KEY_LOCATION").expect("DEV_KEY_LOCATION must be set"),
        )
        .await
        .expect("Failed to load TLS certs");

        info!("Running with TLS at https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .serve(make_service)
            .await?;

        return Ok(());
    }

    #[allow(unreachable_code)]
    {
        let listener = TcpListener::bind(addr).await?;
        info!("Running without TLS at http://{}", addr);
        axum::serve(listener, make_service).await?;
        Ok(())
    }
}

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("Hello, Nutrilog!").into_response()
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> PgPool {
    let pool = PgPool::connect(database_url)
        .await
        .expect("Failed to connect to the database");

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .expect("Failed to verify database connection");

    info!("Successfully connected to the database");
    pool
}
