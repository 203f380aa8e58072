use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stored license status. The observable status additionally applies lazy
/// expiry; see [`LicenseRecord::effective_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl LicenseStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LicenseStatus::Pending),
            "active" => Some(LicenseStatus::Active),
            "expired" => Some(LicenseStatus::Expired),
            "revoked" => Some(LicenseStatus::Revoked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Pending => "pending",
            LicenseStatus::Active => "active",
            LicenseStatus::Expired => "expired",
            LicenseStatus::Revoked => "revoked",
        }
    }
}

/// HWID binding requirement captured at issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwidPolicy {
    Required,
    Optional,
    None,
}

impl HwidPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "required" => Some(HwidPolicy::Required),
            "optional" => Some(HwidPolicy::Optional),
            "none" => Some(HwidPolicy::None),
            _ => None,
        }
    }
}

/// Feature switches carried by a license. Unknown keys survive round trips
/// but the authority never inspects them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseFeatures {
    #[serde(default)]
    pub script_access: bool,
    #[serde(default)]
    pub priority_support: bool,
    #[serde(default)]
    pub beta_features: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A license row as persisted. `features` is kept as a JSON string in
/// storage and decoded at the edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub id: u64,
    pub key: String,
    pub status: LicenseStatus,
    pub hwid: Option<String>,
    pub user_id: Option<u64>,
    pub discord_username: Option<String>,
    pub features: String,
    pub hwid_policy: HwidPolicy,
    pub created_at: i64,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl LicenseRecord {
    /// The status an observer sees at `now`: a stored `pending`/`active`
    /// record past its expiry reads as `expired` without any prior write.
    pub fn effective_status(&self, now: i64) -> LicenseStatus {
        match self.status {
            LicenseStatus::Pending | LicenseStatus::Active => {
                if matches!(self.expires_at, Some(exp) if now >= exp) {
                    LicenseStatus::Expired
                } else {
                    self.status
                }
            }
            other => other,
        }
    }

    /// Decodes the stored feature JSON; malformed blobs read as defaults.
    pub fn features(&self) -> LicenseFeatures {
        serde_json::from_str(&self.features).unwrap_or_default()
    }
}

/// Wire shape of a license: camelCase fields, lazy expiry applied, features
/// decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseView {
    pub id: u64,
    pub license_key: String,
    pub status: LicenseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_username: Option<String>,
    pub features: LicenseFeatures,
    pub hwid_policy: HwidPolicy,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl LicenseView {
    pub fn from_record(rec: &LicenseRecord, now: i64) -> Self {
        Self {
            id: rec.id,
            license_key: rec.key.clone(),
            status: rec.effective_status(now),
            hwid: rec.hwid.clone(),
            user_id: rec.user_id,
            discord_username: rec.discord_username.clone(),
            features: rec.features(),
            hwid_policy: rec.hwid_policy,
            created_at: rec.created_at,
            activated_at: rec.activated_at,
            expires_at: rec.expires_at,
        }
    }
}

/// A policy knob row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// A dashboard user. The password hash never leaves the store layer; list
/// and create responses go through [`UserView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub discord_id: Option<String>,
    pub discord_username: Option<String>,
    pub is_admin: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: u64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_username: Option<String>,
    pub is_admin: bool,
    pub created_at: i64,
}

impl From<&UserRecord> for UserView {
    fn from(rec: &UserRecord) -> Self {
        Self {
            id: rec.id,
            username: rec.username.clone(),
            email: rec.email.clone(),
            discord_id: rec.discord_id.clone(),
            discord_username: rec.discord_username.clone(),
            is_admin: rec.is_admin,
            created_at: rec.created_at,
        }
    }
}

/// Discord integration config, a singleton row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub license_role_id: Option<String>,
    #[serde(default)]
    pub admin_role_id: Option<String>,
    #[serde(default)]
    pub is_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: LicenseStatus, expires_at: Option<i64>) -> LicenseRecord {
        LicenseRecord {
            id: 1,
            key: "PRUDA-AB12-CD34-EF56-7890".into(),
            status,
            hwid: None,
            user_id: None,
            discord_username: None,
            features: "{}".into(),
            hwid_policy: HwidPolicy::Required,
            created_at: 1_000,
            activated_at: None,
            expires_at,
        }
    }

    #[test]
    fn effective_status_applies_lazy_expiry() {
        let r = record(LicenseStatus::Active, Some(2_000));
        assert_eq!(r.effective_status(1_999), LicenseStatus::Active);
        assert_eq!(r.effective_status(2_000), LicenseStatus::Expired);
        assert_eq!(r.effective_status(9_999), LicenseStatus::Expired);
    }

    #[test]
    fn effective_status_expires_pending_too() {
        let r = record(LicenseStatus::Pending, Some(2_000));
        assert_eq!(r.effective_status(2_001), LicenseStatus::Expired);
    }

    #[test]
    fn revoked_is_not_rewritten_by_expiry() {
        let r = record(LicenseStatus::Revoked, Some(2_000));
        assert_eq!(r.effective_status(9_999), LicenseStatus::Revoked);
    }

    #[test]
    fn no_expiry_never_expires() {
        let r = record(LicenseStatus::Active, None);
        assert_eq!(r.effective_status(i64::MAX), LicenseStatus::Active);
    }

    #[test]
    fn features_preserve_unknown_keys() {
        let json = r#"{"scriptAccess":true,"betaFeatures":false,"tier":"gold"}"#;
        let f: LicenseFeatures = serde_json::from_str(json).unwrap();
        assert!(f.script_access);
        assert!(!f.priority_support);
        assert_eq!(f.extra.get("tier"), Some(&serde_json::json!("gold")));

        let round = serde_json::to_string(&f).unwrap();
        assert!(round.contains("\"tier\":\"gold\""));
    }

    #[test]
    fn malformed_feature_blob_reads_as_defaults() {
        let mut r = record(LicenseStatus::Active, None);
        r.features = "not json".into();
        assert_eq!(r.features(), LicenseFeatures::default());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LicenseStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(serde_json::to_string(&HwidPolicy::None).unwrap(), "\"none\"");
    }

    #[test]
    fn view_applies_expiry_and_camel_case() {
        let r = record(LicenseStatus::Active, Some(2_000));
        let v = LicenseView::from_record(&r, 3_000);
        assert_eq!(v.status, LicenseStatus::Expired);
        assert_eq!(v.license_key, r.key);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"licenseKey\""));
        assert!(json.contains("\"hwidPolicy\":\"required\""));
    }
}
