//! Discord webhook delivery.
//!
//! The dispatcher reads the integration config at delivery time, so config
//! changes take effect without a restart. Delivery is best-effort: failures
//! are logged and never retried.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde_json::json;
use tracing::{debug, warn};

use crate::events::{EventKind, LifecycleEvent};
use crate::store::Store;

// ── SSRF guard ───────────────────────────────────────────────────────────────

/// Private, loopback, and link-local ranges that must never be webhook
/// targets.
static BLOCKED_RANGES: &[&str] = &[
    "127.0.0.0/8",    // IPv4 loopback
    "10.0.0.0/8",     // RFC-1918 private
    "172.16.0.0/12",  // RFC-1918 private
    "192.168.0.0/16", // RFC-1918 private
    "169.254.0.0/16", // link-local / cloud metadata
    "::1/128",        // IPv6 loopback
    "fc00::/7",       // IPv6 unique-local
    "fe80::/10",      // IPv6 link-local
];

fn is_private_ip(ip: IpAddr) -> bool {
    BLOCKED_RANGES.iter().any(|r| {
        r.parse::<IpNet>()
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    })
}

/// Validates an admin-supplied webhook URL before it is persisted.
///
/// Rules (in order):
/// 1. Must be a syntactically valid URL.
/// 2. Scheme must be `https`.
/// 3. If the host is a bare IP address, it must not be in a
///    private/loopback/link-local range.
///
/// Returns `Ok(())` when safe, `Err(human-readable reason)` otherwise.
pub fn validate_webhook_url(url: &str) -> Result<(), String> {
    let uri: http::Uri = url
        .parse()
        .map_err(|_| "webhookUrl is not a valid URL".to_string())?;

    if uri.scheme_str() != Some("https") {
        return Err("webhookUrl must use https://".to_string());
    }

    let host = uri
        .host()
        .ok_or_else(|| "webhookUrl is missing a host".to_string())?;

    // Strip IPv6 brackets before parsing.
    let bare = host.trim_matches(|c| c == '[' || c == ']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(
                "webhookUrl must not target private, loopback, or link-local addresses"
                    .to_string(),
            );
        }
    }

    Ok(())
}

// ── Delivery ─────────────────────────────────────────────────────────────────

/// Shared outbound client with a short timeout.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("build webhook reqwest client")
}

/// Posts a lifecycle event to the configured Discord webhook, if the
/// integration is enabled.
pub async fn notify_discord(store: &Store, client: &reqwest::Client, event: &LifecycleEvent) {
    let cfg = match store.get_discord_config() {
        Ok(Some(cfg)) if cfg.is_enabled => cfg,
        Ok(_) => return,
        Err(e) => {
            warn!(error = %e, "failed to read discord config for delivery");
            return;
        }
    };

    let Some(url) = cfg.webhook_url.filter(|u| !u.is_empty()) else {
        return;
    };

    deliver(client, &url, event).await;
}

/// POST the event as a Discord embed payload.
pub async fn deliver(client: &reqwest::Client, url: &str, event: &LifecycleEvent) {
    let payload = embed_payload(event);

    match client.post(url).json(&payload).send().await {
        Ok(resp) => {
            debug!(url, status = %resp.status(), "discord webhook delivered");
        }
        Err(e) => {
            warn!(url, error = %e, "discord webhook delivery failed");
        }
    }
}

fn embed_payload(event: &LifecycleEvent) -> serde_json::Value {
    let title = match event.kind {
        EventKind::Issued => "License issued",
        EventKind::Activated => "License activated",
        EventKind::Renewed => "License renewed",
        EventKind::Revoked => "License revoked",
        EventKind::Expired => "License expired",
        EventKind::ExpiringSoon => "License expiring soon",
    };

    let mut fields = vec![
        json!({"name": "Key", "value": event.key, "inline": true}),
        json!({"name": "License ID", "value": event.license_id.to_string(), "inline": true}),
    ];
    if let Some(user) = &event.discord_username {
        fields.push(json!({"name": "User", "value": user, "inline": true}));
    }

    json!({
        "embeds": [{
            "title": title,
            "fields": fields,
            "footer": {"text": format!("pruda · {}", event.at)},
        }],
    })
}
