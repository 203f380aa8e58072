use axum_test::TestServer;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use pruda_server::authority::{IssueRequest, LicenseAuthority, LicenseType, DAY_SECS};
use pruda_server::clock::Clock;
use pruda_server::events::{EventBus, EventKind, LifecycleEvent};
use pruda_server::settings::SettingsRegistry;
use pruda_server::store::{DiscordConfig, HwidPolicy, LicenseFeatures, Store};
use pruda_server::{router, AppState};

const T0: i64 = 1_700_000_000;
const HWID: &str = "A3-7F-10-22";

struct Harness {
    server: TestServer,
    clock: Clock,
    rx: mpsc::Receiver<LifecycleEvent>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with_key(None)
}

fn harness_with_key(api_key: Option<String>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("pruda.db")).unwrap();
    let settings = SettingsRegistry::new(store.clone());
    let clock = Clock::manual(T0);
    let (events, rx) = EventBus::channel(64);
    let authority = LicenseAuthority::new(store.clone(), settings.clone(), clock.clone(), events);

    let state = AppState {
        store,
        settings,
        authority,
        api_key,
    };
    let server = TestServer::new(router(state)).unwrap();

    Harness {
        server,
        clock,
        rx,
        _dir: dir,
    }
}

async fn generate(server: &TestServer, body: Value) -> Value {
    let resp = server.post("/api/licenses/generate").json(&body).await;
    assert_eq!(resp.status_code(), 201, "{}", resp.text());
    resp.json::<Value>()
}

fn drain_kinds(rx: &mut mpsc::Receiver<LifecycleEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind);
    }
    kinds
}

// ── End-to-end scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn issue_verify_activate_round_trip() {
    let h = harness();

    let created = generate(
        &h.server,
        json!({
            "licenseType": "standard",
            "hwidLock": "required",
            "features": {"scriptAccess": true, "prioritySupport": false, "betaFeatures": false},
        }),
    )
    .await;

    let key = created["license"]["licenseKey"].as_str().unwrap().to_owned();
    assert!(key.starts_with("PRUDA-"), "unexpected key {key}");
    assert_eq!(created["license"]["status"], "pending");

    let verify = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await
        .json::<Value>();
    assert_eq!(verify["valid"], true);
    assert_eq!(verify["activated"], false);
    assert_eq!(verify["status"], "pending");

    let activate = h
        .server
        .post("/api/licenses/activate")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await;
    assert_eq!(activate.status_code(), 200);
    assert_eq!(activate.json::<Value>()["success"], true);

    let verify = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await
        .json::<Value>();
    assert_eq!(verify["valid"], true);
    assert_eq!(verify["activated"], true);
    assert_eq!(verify["status"], "active");
    assert_eq!(verify["expires"], json!(T0 + 30 * DAY_SECS));
    assert_eq!(verify["features"]["scriptAccess"], true);
}

#[tokio::test]
async fn hwid_mismatch_leaves_binding_untouched() {
    let h = harness();
    let created = generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "required", "features": {}}),
    )
    .await;
    let key = created["license"]["licenseKey"].as_str().unwrap().to_owned();

    h.server
        .post("/api/licenses/activate")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await;

    let verify = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": key, "hwid": "FF-FF-FF-FF"}))
        .await
        .json::<Value>();
    assert_eq!(verify["valid"], false);
    assert_eq!(verify["message"], "HwidMismatch");

    let licenses = h.server.get("/api/licenses").await.json::<Value>();
    assert_eq!(licenses[0]["hwid"], HWID);
}

#[tokio::test]
async fn lazy_expiry_shows_up_in_stats_and_verify() {
    let h = harness();
    let created = generate(
        &h.server,
        json!({
            "licenseType": "custom",
            "duration": 1,
            "durationType": "days",
            "hwidLock": "none",
            "features": {},
        }),
    )
    .await;
    let key = created["license"]["licenseKey"].as_str().unwrap().to_owned();

    h.clock.advance(25 * 3_600);

    let stats = h.server.get("/api/licenses/stats").await.json::<Value>();
    assert_eq!(stats["totalCount"], 1);
    assert_eq!(stats["activeCount"], 0);
    assert_eq!(stats["expiredCount"], 1);

    let verify = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": key, "hwid": ""}))
        .await
        .json::<Value>();
    assert_eq!(verify["valid"], false);
    assert_eq!(verify["status"], "expired");
}

#[tokio::test]
async fn renew_reactivates_and_fires_one_renewed_event() {
    let mut h = harness();
    let created = generate(
        &h.server,
        json!({
            "licenseType": "custom",
            "duration": 1,
            "durationType": "days",
            "hwidLock": "none",
            "features": {},
        }),
    )
    .await;
    let id = created["license"]["id"].as_u64().unwrap();

    h.clock.advance(2 * DAY_SECS);
    let new_expiry = T0 + 2 * DAY_SECS + 30 * DAY_SECS;

    let resp = h
        .server
        .put(&format!("/api/licenses/{id}"))
        .json(&json!({"status": "active", "expiresAt": new_expiry}))
        .await;
    assert_eq!(resp.status_code(), 200, "{}", resp.text());
    let body = resp.json::<Value>();
    assert_eq!(body["license"]["status"], "active");
    assert_eq!(body["license"]["expiresAt"], json!(new_expiry));

    let kinds = drain_kinds(&mut h.rx);
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::Renewed).count(),
        1
    );
}

#[tokio::test]
async fn revoke_is_terminal_until_renewed() {
    let h = harness();
    let created = generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "required", "features": {}}),
    )
    .await;
    let id = created["license"]["id"].as_u64().unwrap();
    let key = created["license"]["licenseKey"].as_str().unwrap().to_owned();

    h.server
        .post("/api/licenses/activate")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await;

    let resp = h
        .server
        .put(&format!("/api/licenses/{id}"))
        .json(&json!({"status": "revoked"}))
        .await;
    assert_eq!(resp.status_code(), 200);

    let activate = h
        .server
        .post("/api/licenses/activate")
        .json(&json!({"licenseKey": key, "hwid": HWID}))
        .await;
    assert_eq!(activate.status_code(), 410);

    let renew = h
        .server
        .put(&format!("/api/licenses/{id}"))
        .json(&json!({"status": "active"}))
        .await;
    assert_eq!(renew.status_code(), 200);
    assert_eq!(renew.json::<Value>()["license"]["status"], "active");
}

// ── Protocol details ─────────────────────────────────────────────────────────

#[tokio::test]
async fn verify_answers_200_for_unknown_keys() {
    let h = harness();
    let resp = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": "PRUDA-ZZZZ-ZZZZ-ZZZZ-ZZZZ", "hwid": HWID}))
        .await;
    assert_eq!(resp.status_code(), 200);
    let body = resp.json::<Value>();
    assert_eq!(body["valid"], false);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn activate_unknown_key_is_404() {
    let h = harness();
    let resp = h
        .server
        .post("/api/licenses/activate")
        .json(&json!({"licenseKey": "PRUDA-ZZZZ-ZZZZ-ZZZZ-ZZZZ", "hwid": HWID}))
        .await;
    assert_eq!(resp.status_code(), 404);
}

#[tokio::test]
async fn generate_rejects_unknown_license_type() {
    let h = harness();
    let resp = h
        .server
        .post("/api/licenses/generate")
        .json(&json!({"licenseType": "forever", "hwidLock": "none", "features": {}}))
        .await;
    assert_eq!(resp.status_code(), 400);
}

#[tokio::test]
async fn update_rejects_unknown_status_and_unknown_id() {
    let h = harness();
    let created = generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "none", "features": {}}),
    )
    .await;
    let id = created["license"]["id"].as_u64().unwrap();

    let resp = h
        .server
        .put(&format!("/api/licenses/{id}"))
        .json(&json!({"status": "suspended"}))
        .await;
    assert_eq!(resp.status_code(), 409);

    let resp = h
        .server
        .put("/api/licenses/999")
        .json(&json!({"status": "revoked"}))
        .await;
    assert_eq!(resp.status_code(), 404);
}

#[tokio::test]
async fn list_supports_status_filter_and_search() {
    let h = harness();
    generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "none", "features": {}}),
    )
    .await;
    generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "required", "features": {}}),
    )
    .await;

    let active = h
        .server
        .get("/api/licenses")
        .add_query_param("status", "active")
        .await
        .json::<Value>();
    assert_eq!(active.as_array().unwrap().len(), 1);

    let pending = h
        .server
        .get("/api/licenses")
        .add_query_param("status", "pending")
        .await
        .json::<Value>();
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let none = h
        .server
        .get("/api/licenses")
        .add_query_param("search", "ZZZZZZZZ")
        .await
        .json::<Value>();
    assert_eq!(none.as_array().unwrap().len(), 0);
}

// ── Admin auth ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_endpoints_require_the_api_key() {
    let h = harness_with_key(Some("super-secret".to_owned()));

    let resp = h
        .server
        .post("/api/licenses/generate")
        .json(&json!({"licenseType": "standard", "hwidLock": "none", "features": {}}))
        .await;
    assert_eq!(resp.status_code(), 401);

    let resp = h
        .server
        .post("/api/licenses/generate")
        .add_header(
            http::HeaderName::from_static("authorization"),
            http::HeaderValue::from_static("Bearer super-secret"),
        )
        .json(&json!({"licenseType": "standard", "hwidLock": "none", "features": {}}))
        .await;
    assert_eq!(resp.status_code(), 201);

    // the client verification protocol stays public
    let resp = h
        .server
        .post("/api/licenses/verify")
        .json(&json!({"licenseKey": "PRUDA-ZZZZ-ZZZZ-ZZZZ-ZZZZ", "hwid": HWID}))
        .await;
    assert_eq!(resp.status_code(), 200);
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn settings_change_key_format_for_new_licenses() {
    let h = harness();

    let resp = h
        .server
        .post("/api/settings/licensePrefix")
        .json(&json!({"value": "APEX"}))
        .await;
    assert_eq!(resp.status_code(), 200);
    let resp = h
        .server
        .post("/api/settings/licenseLength")
        .json(&json!({"value": "12"}))
        .await;
    assert_eq!(resp.status_code(), 200);

    let settings = h.server.get("/api/settings").await.json::<Value>();
    assert!(settings
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["key"] == "licensePrefix" && s["value"] == "APEX"));

    let created = generate(
        &h.server,
        json!({"licenseType": "standard", "hwidLock": "none", "features": {}}),
    )
    .await;
    let key = created["license"]["licenseKey"].as_str().unwrap();
    assert!(key.starts_with("APEX-"), "key {key} should use new prefix");
    assert_eq!(key.len(), 4 + 12 + 3); // APEX + 12 chars + 3 hyphens
}

#[tokio::test]
async fn invalid_setting_values_are_rejected() {
    let h = harness();
    let resp = h
        .server
        .post("/api/settings/licenseLength")
        .json(&json!({"value": "15"}))
        .await;
    assert_eq!(resp.status_code(), 400);

    let resp = h
        .server
        .post("/api/settings/defaultLicenseDuration")
        .json(&json!({"value": "0"}))
        .await;
    assert_eq!(resp.status_code(), 400);

    let resp = h.server.get("/api/settings/licenseLength").await;
    assert_eq!(resp.status_code(), 404); // nothing was stored
}

#[tokio::test]
async fn unknown_setting_keys_are_stored_verbatim() {
    let h = harness();
    let resp = h
        .server
        .post("/api/settings/showVersionNumber")
        .json(&json!({"value": "true"}))
        .await;
    assert_eq!(resp.status_code(), 200);

    let resp = h.server.get("/api/settings/showVersionNumber").await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.json::<Value>()["value"], "true");
}

// ── Discord integration ──────────────────────────────────────────────────────

#[tokio::test]
async fn discord_config_round_trip_with_url_validation() {
    let h = harness();

    let resp = h
        .server
        .post("/api/discord")
        .json(&json!({"webhookUrl": "http://discord.com/api/webhooks/1/x", "isEnabled": true}))
        .await;
    assert_eq!(resp.status_code(), 400, "plain http must be rejected");

    let resp = h
        .server
        .post("/api/discord")
        .json(&json!({
            "webhookUrl": "https://discord.com/api/webhooks/1/x",
            "serverId": "123",
            "isEnabled": true,
        }))
        .await;
    assert_eq!(resp.status_code(), 200);

    let cfg = h.server.get("/api/discord").await.json::<Value>();
    assert_eq!(cfg["webhookUrl"], "https://discord.com/api/webhooks/1/x");
    assert_eq!(cfg["isEnabled"], true);
}

#[tokio::test]
async fn lifecycle_events_reach_the_discord_webhook() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("pruda.db")).unwrap();
    let settings = SettingsRegistry::new(store.clone());
    let clock = Clock::manual(T0);

    let (events, rx) = EventBus::channel(64);
    pruda_server::events::spawn_dispatcher(rx, store.clone(), pruda_server::webhooks::http_client());

    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock)
        .await;

    // config checked at delivery time, so writing it directly is enough
    store
        .put_discord_config(&DiscordConfig {
            webhook_url: Some(format!("{}/hook", mock.uri())),
            is_enabled: true,
            ..Default::default()
        })
        .unwrap();

    let authority = LicenseAuthority::new(store, settings, clock, events);
    authority
        .issue(IssueRequest {
            license_type: LicenseType::Standard,
            duration: None,
            duration_unit: None,
            discord_username: Some("kai#1234".to_owned()),
            hwid_policy: HwidPolicy::None,
            features: LicenseFeatures::default(),
            user_id: None,
        })
        .await
        .unwrap();

    // delivery is fire-and-forget; poll briefly
    let mut received = Vec::new();
    for _ in 0..50 {
        received = mock.received_requests().await.unwrap();
        if !received.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(received.len(), 1, "expected exactly one webhook delivery");
    let body: Value = received[0].body_json().unwrap();
    assert_eq!(body["embeds"][0]["title"], "License issued");
    assert!(body.to_string().contains("kai#1234"));
}

// ── Users ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn user_crud_round_trip() {
    let h = harness();

    let resp = h
        .server
        .post("/api/users")
        .json(&json!({
            "username": "alice",
            "password": "hunter2",
            "email": "alice@example.com",
            "isAdmin": true,
        }))
        .await;
    assert_eq!(resp.status_code(), 201);
    let body = resp.json::<Value>();
    let id = body["user"]["id"].as_u64().unwrap();
    assert!(body["user"].get("password").is_none());
    assert!(body["user"].get("passwordHash").is_none());

    let resp = h
        .server
        .post("/api/users")
        .json(&json!({"username": "alice", "password": "other"}))
        .await;
    assert_eq!(resp.status_code(), 409);

    let users = h.server.get("/api/users").await.json::<Value>();
    assert_eq!(users.as_array().unwrap().len(), 1);
    assert_eq!(users[0]["username"], "alice");

    let resp = h.server.delete(&format!("/api/users/{id}")).await;
    assert_eq!(resp.status_code(), 200);
    let resp = h.server.delete(&format!("/api/users/{id}")).await;
    assert_eq!(resp.status_code(), 404);
}

#[tokio::test]
async fn user_creation_requires_username_and_password() {
    let h = harness();
    let resp = h
        .server
        .post("/api/users")
        .json(&json!({"username": "  ", "password": "x"}))
        .await;
    assert_eq!(resp.status_code(), 400);

    let resp = h
        .server
        .post("/api/users")
        .json(&json!({"username": "bob", "password": ""}))
        .await;
    assert_eq!(resp.status_code(), 400);
}

#[tokio::test]
async fn health_is_public() {
    let h = harness_with_key(Some("secret".to_owned()));
    let resp = h.server.get("/health").await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.json::<Value>()["status"], "ok");
}
