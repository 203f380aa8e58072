pub mod auth;
pub mod authority;
pub mod clock;
pub mod dirs;
pub mod error;
pub mod events;
pub mod handlers;
pub mod hwid;
pub mod keycodec;
pub mod server;
pub mod settings;
pub mod store;
pub mod webhooks;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub settings: settings::SettingsRegistry,
    pub authority: authority::LicenseAuthority,
    /// Optional API key for write-protecting admin endpoints.
    pub api_key: Option<String>,
}

pub use server::{router, run, ServerConfig};
