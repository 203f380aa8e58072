use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::require_api_key,
    authority::LicenseAuthority,
    clock::Clock,
    events::{self, EventBus, EVENT_QUEUE_CAPACITY},
    handlers::{
        activate_license, create_user, delete_user, generate_license, get_discord_config,
        get_setting, health, license_stats, list_licenses, list_settings, list_users,
        put_discord_config, put_setting, update_license, verify_license,
    },
    settings::SettingsRegistry,
    store::Store,
    webhooks, AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("PRUDA_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PRUDA_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            api_key: std::env::var("PRUDA_API_KEY").ok(),
            data_dir: std::env::var("PRUDA_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(900),
            cors_origins: std::env::var("PRUDA_CORS_ORIGINS").ok(),
        }
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    // Resolve data directory.
    let data_dir = match cfg.data_dir {
        Some(d) => {
            std::fs::create_dir_all(&d).context("create data dir")?;
            d
        }
        None => crate::dirs::data_dir()?,
    };

    info!(data_dir = %data_dir.display(), "using data directory");

    // Open redb store.
    let db_path = data_dir.join("pruda.db");
    let store = Store::open(&db_path).context("open store")?;

    // Event bus with its dispatcher (audit log + Discord webhook).
    let (events, rx) = EventBus::channel(EVENT_QUEUE_CAPACITY);
    events::spawn_dispatcher(rx, store.clone(), webhooks::http_client());

    let settings = SettingsRegistry::new(store.clone());
    let authority = LicenseAuthority::new(
        store.clone(),
        settings.clone(),
        Clock::system(),
        events,
    );

    // Spawn the background expiry sweep.
    authority.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        store,
        settings,
        authority,
        api_key: cfg.api_key,
    };

    let cors = build_cors(cfg.cors_origins.as_deref());

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "pruda server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

/// The full route table. Split out of [`run`] so tests can drive it
/// directly.
pub fn router(state: AppState) -> Router {
    // Public routes: the client-facing verification protocol and health.
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/licenses/verify", post(verify_license))
        .route("/api/licenses/activate", post(activate_license));

    // Admin routes (API key required if configured).
    let protected = Router::new()
        .route("/api/licenses/generate", post(generate_license))
        .route("/api/licenses", get(list_licenses))
        .route("/api/licenses/stats", get(license_stats))
        .route("/api/licenses/{id}", put(update_license))
        .route("/api/settings", get(list_settings))
        .route("/api/settings/{key}", get(get_setting))
        .route("/api/settings/{key}", post(put_setting))
        .route("/api/discord", get(get_discord_config))
        .route("/api/discord", post(put_discord_config))
        .route("/api/discord", put(put_discord_config))
        .route("/api/users", get(list_users))
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", delete(delete_user))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
