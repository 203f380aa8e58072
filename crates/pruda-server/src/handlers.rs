use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::authority::{DurationUnit, IssueRequest, LicensePatch, LicenseType};
use crate::error::AuthorityError;
use crate::store::{
    DiscordConfig, HwidPolicy, LicenseFeatures, LicenseFilter, LicenseStatus, LicenseView,
    UserInsertOutcome, UserRecord, UserView,
};
use crate::{webhooks, AppState};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Licenses ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateLicenseRequest {
    pub license_type: String,
    pub duration: Option<i64>,
    pub duration_type: Option<String>,
    pub discord_username: Option<String>,
    pub hwid_lock: Option<String>,
    #[serde(default)]
    pub features: LicenseFeatures,
    pub user_id: Option<u64>,
}

pub async fn generate_license(
    State(state): State<AppState>,
    Json(body): Json<GenerateLicenseRequest>,
) -> Response {
    let req = match issue_request(body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };

    match state.authority.issue(req).await {
        Ok(rec) => {
            info!(license_id = rec.id, key = %rec.key, "audit: license.generate");
            let now = state.authority.clock().now();
            (
                StatusCode::CREATED,
                Json(json!({"license": LicenseView::from_record(&rec, now)})),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn issue_request(body: GenerateLicenseRequest) -> Result<IssueRequest, AuthorityError> {
    let license_type = LicenseType::parse(&body.license_type).ok_or_else(|| {
        AuthorityError::Validation(format!("unknown license type {:?}", body.license_type))
    })?;

    let duration_unit = match body.duration_type.as_deref() {
        Some(raw) => Some(DurationUnit::parse(raw).ok_or_else(|| {
            AuthorityError::Validation(format!("unknown duration type {raw:?}"))
        })?),
        None => None,
    };

    let hwid_policy = match body.hwid_lock.as_deref() {
        Some(raw) => HwidPolicy::parse(raw).ok_or_else(|| {
            AuthorityError::Validation(format!("unknown hwid lock {raw:?}"))
        })?,
        None => HwidPolicy::Required,
    };

    Ok(IssueRequest {
        license_type,
        duration: body.duration,
        duration_unit,
        discord_username: body.discord_username,
        hwid_policy,
        features: body.features,
        user_id: body.user_id,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub search: Option<String>,
}

pub async fn list_licenses(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match LicenseStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                return AuthorityError::Validation(format!("unknown status {raw:?}"))
                    .into_response()
            }
        },
        None => None,
    };

    let filter = LicenseFilter {
        status,
        search: query.search,
    };

    match state.authority.list(&filter) {
        Ok(records) => {
            let now = state.authority.clock().now();
            let views: Vec<LicenseView> = records
                .iter()
                .map(|rec| LicenseView::from_record(rec, now))
                .collect();
            Json(views).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_count: usize,
    active_count: usize,
    pending_count: usize,
    expired_count: usize,
}

pub async fn license_stats(State(state): State<AppState>) -> Response {
    match state.authority.stats() {
        Ok(counts) => Json(StatsResponse {
            total_count: counts.total,
            active_count: counts.active,
            pending_count: counts.pending,
            expired_count: counts.expired,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLicenseRequest {
    pub status: Option<String>,
    pub expires_at: Option<i64>,
}

pub async fn update_license(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<UpdateLicenseRequest>,
) -> Response {
    let status = match body.status.as_deref() {
        Some(raw) => match LicenseStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                return AuthorityError::Conflict(format!("illegal status transition to {raw:?}"))
                    .into_response()
            }
        },
        None => None,
    };

    let patch = LicensePatch {
        status,
        expires_at: body.expires_at,
    };

    match state.authority.update_license(id, patch).await {
        Ok(rec) => {
            info!(license_id = rec.id, status = rec.status.as_str(), "audit: license.update");
            let now = state.authority.clock().now();
            Json(json!({"license": LicenseView::from_record(&rec, now)})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyLicenseRequest {
    pub license_key: String,
    #[serde(default)]
    pub hwid: String,
}

pub async fn verify_license(
    State(state): State<AppState>,
    Json(body): Json<VerifyLicenseRequest>,
) -> Response {
    match state.authority.verify(&body.license_key, &body.hwid).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn activate_license(
    State(state): State<AppState>,
    Json(body): Json<VerifyLicenseRequest>,
) -> Response {
    match state.authority.activate(&body.license_key, &body.hwid).await {
        Ok(rec) => {
            info!(license_id = rec.id, "audit: license.activate");
            let now = state.authority.clock().now();
            Json(json!({
                "success": true,
                "license": LicenseView::from_record(&rec, now),
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

pub async fn list_settings(State(state): State<AppState>) -> Response {
    match state.settings.list() {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

pub async fn get_setting(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.settings.get(&key) {
        Ok(Some(value)) => Json(json!({"key": key, "value": value})).into_response(),
        Ok(None) => AuthorityError::NotFound(format!("no setting named {key:?}")).into_response(),
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SettingValue {
    pub value: String,
}

pub async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> Response {
    match state.settings.set(&key, &body.value) {
        Ok(()) => {
            info!(key = %key, value = %body.value, "audit: setting.update");
            Json(json!({"key": key, "value": body.value})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Discord integration ───────────────────────────────────────────────────────

pub async fn get_discord_config(State(state): State<AppState>) -> Response {
    match state.store.get_discord_config() {
        Ok(cfg) => Json(cfg).into_response(),
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

pub async fn put_discord_config(
    State(state): State<AppState>,
    Json(cfg): Json<DiscordConfig>,
) -> Response {
    if let Some(url) = cfg.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        if let Err(reason) = webhooks::validate_webhook_url(url) {
            return AuthorityError::Validation(reason).into_response();
        }
    }

    match state.store.put_discord_config(&cfg) {
        Ok(()) => {
            info!(enabled = cfg.is_enabled, "audit: discord.configure");
            Json(cfg).into_response()
        }
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

// ── Users ─────────────────────────────────────────────────────────────────────

pub async fn list_users(State(state): State<AppState>) -> Response {
    match state.store.list_users() {
        Ok(users) => {
            let views: Vec<UserView> = users.iter().map(UserView::from).collect();
            Json(views).into_response()
        }
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub discord_id: Option<String>,
    pub discord_username: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Response {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return AuthorityError::Validation("username and password are required".to_owned())
            .into_response();
    }

    let rec = UserRecord {
        id: 0,
        username: body.username.trim().to_owned(),
        password_hash: hex::encode(Sha256::digest(body.password.as_bytes())),
        email: body.email,
        discord_id: body.discord_id,
        discord_username: body.discord_username,
        is_admin: body.is_admin,
        created_at: state.authority.clock().now(),
    };

    match state.store.insert_user(rec) {
        Ok(UserInsertOutcome::Inserted(user)) => {
            info!(user_id = user.id, username = %user.username, "audit: user.create");
            (
                StatusCode::CREATED,
                Json(json!({"user": UserView::from(&user)})),
            )
                .into_response()
        }
        Ok(UserInsertOutcome::DuplicateUsername) => {
            AuthorityError::Conflict("username is already taken".to_owned()).into_response()
        }
        Err(e) => AuthorityError::from(e).into_response(),
    }
}

pub async fn delete_user(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.store.delete_user(id) {
        Ok(true) => {
            info!(user_id = id, "audit: user.delete");
            Json(json!({"deleted": true})).into_response()
        }
        Ok(false) => AuthorityError::NotFound("user not found".to_owned()).into_response(),
        Err(e) => AuthorityError::from(e).into_response(),
    }
}
