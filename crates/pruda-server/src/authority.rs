//! The license state machine: issue, activate, verify, renew, revoke, plus
//! the background expiry sweep.
//!
//! Transitions for a single key are serialized by a keyed mutex; the redb
//! write transaction underneath is the commit boundary. Expiry is derived on
//! every read; the sweep only persists what readers already observe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::AuthorityError;
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::hwid::{self, HwidCheck, MAX_HWID_LEN};
use crate::keycodec::{self, MAX_GENERATE_ATTEMPTS};
use crate::settings::{Policy, SettingsRegistry};
use crate::store::{
    HwidPolicy, InsertOutcome, LicenseFeatures, LicenseFilter, LicenseRecord, LicenseStatus,
    StatusCounts, Store,
};

pub const DAY_SECS: i64 = 86_400;

/// Sweep horizon for `expiringSoon` notices.
pub const EXPIRY_WARNING_WINDOW: i64 = 3 * DAY_SECS;

/// Minimum gap between two `expiringSoon` notices for the same license.
pub const EXPIRY_NOTICE_INTERVAL: i64 = DAY_SECS;

/// License type presets offered by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseType {
    Standard,
    Premium,
    Annual,
    Custom,
}

impl LicenseType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(LicenseType::Standard),
            "premium" => Some(LicenseType::Premium),
            "annual" => Some(LicenseType::Annual),
            "custom" => Some(LicenseType::Custom),
            _ => None,
        }
    }

    /// Preset duration in days; `None` for custom.
    pub fn preset_days(&self) -> Option<i64> {
        match self {
            LicenseType::Standard => Some(30),
            LicenseType::Premium => Some(90),
            LicenseType::Annual => Some(365),
            LicenseType::Custom => None,
        }
    }
}

/// Calendar approximation: months are 30 days, years 365.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Days,
    Months,
    Years,
}

impl DurationUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "days" => Some(DurationUnit::Days),
            "months" => Some(DurationUnit::Months),
            "years" => Some(DurationUnit::Years),
            _ => None,
        }
    }

    pub fn day_multiplier(&self) -> i64 {
        match self {
            DurationUnit::Days => 1,
            DurationUnit::Months => 30,
            DurationUnit::Years => 365,
        }
    }
}

/// Validated issuance input, assembled by the HTTP layer.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub license_type: LicenseType,
    pub duration: Option<i64>,
    pub duration_unit: Option<DurationUnit>,
    pub discord_username: Option<String>,
    pub hwid_policy: HwidPolicy,
    pub features: LicenseFeatures,
    pub user_id: Option<u64>,
}

/// Snapshot returned by `verify`. Never an error for unknown keys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub valid: bool,
    pub activated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LicenseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<LicenseFeatures>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerifyOutcome {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            activated: false,
            status: None,
            expires: None,
            features: None,
            message: Some(message.into()),
        }
    }
}

/// Admin patch for PUT /api/licenses/{id}.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePatch {
    pub status: Option<LicenseStatus>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub expiring_soon: usize,
}

#[derive(Clone)]
pub struct LicenseAuthority {
    store: Store,
    settings: SettingsRegistry,
    clock: Clock,
    events: EventBus,
    /// Per-key write locks; all transitions for one license serialize here.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Single-flight guard for the sweep.
    sweep_gate: Arc<Mutex<()>>,
}

impl LicenseAuthority {
    pub fn new(store: Store, settings: SettingsRegistry, clock: Clock, events: EventBus) -> Self {
        Self {
            store,
            settings,
            clock,
            events,
            locks: Arc::new(Mutex::new(HashMap::new())),
            sweep_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    // ── Issue ────────────────────────────────────────────────────────────

    pub async fn issue(&self, req: IssueRequest) -> Result<LicenseRecord, AuthorityError> {
        let policy = self.settings.policy()?;
        let duration_days = resolve_duration(&req, &policy)?;
        let now = self.clock.now();
        let expires_at = duration_days
            .checked_mul(DAY_SECS)
            .and_then(|secs| now.checked_add(secs))
            .ok_or_else(|| AuthorityError::Validation("duration too large".to_owned()))?;

        let features = serde_json::to_string(&req.features)
            .map_err(|e| AuthorityError::Internal(e.into()))?;
        let discord_username = req
            .discord_username
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        // A license with no HWID requirement never waits for activation.
        let (status, activated_at) = match req.hwid_policy {
            HwidPolicy::None => (LicenseStatus::Active, Some(now)),
            _ => (LicenseStatus::Pending, None),
        };

        let key_policy = policy.key_policy();
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let rec = LicenseRecord {
                id: 0,
                key: keycodec::generate(&key_policy),
                status,
                hwid: None,
                user_id: req.user_id,
                discord_username: discord_username.clone(),
                features: features.clone(),
                hwid_policy: req.hwid_policy,
                created_at: now,
                activated_at,
                expires_at: Some(expires_at),
            };
            match self.store.insert_license(rec)? {
                InsertOutcome::Inserted(rec) => {
                    self.emit(EventKind::Issued, &rec);
                    return Ok(rec);
                }
                InsertOutcome::DuplicateKey => continue,
            }
        }

        Err(AuthorityError::KeyExhaustion(MAX_GENERATE_ATTEMPTS))
    }

    // ── Verify ───────────────────────────────────────────────────────────

    /// Read-only status snapshot. Unknown or malformed keys answer
    /// `{valid:false}` rather than an error; only storage failures surface.
    pub async fn verify(
        &self,
        key_input: &str,
        hwid_input: &str,
    ) -> Result<VerifyOutcome, AuthorityError> {
        let policy = self.settings.policy()?;
        let key_policy = policy.key_policy();
        let key = keycodec::canonicalize(&key_policy, key_input);
        if !keycodec::validate(&key_policy, &key) {
            return Ok(VerifyOutcome::invalid("malformed license key"));
        }

        let Some(rec) = self.store.get_license_by_key(&key)? else {
            return Ok(VerifyOutcome::invalid("unknown license key"));
        };

        let now = self.clock.now();
        match rec.effective_status(now) {
            LicenseStatus::Expired => {
                // opportunistic persist; idempotent, emits at most once
                self.persist_expiry(&rec, now).await?;
                Ok(VerifyOutcome {
                    valid: false,
                    activated: rec.activated_at.is_some(),
                    status: Some(LicenseStatus::Expired),
                    expires: rec.expires_at,
                    features: None,
                    message: Some("license expired".to_owned()),
                })
            }
            LicenseStatus::Revoked => Ok(VerifyOutcome {
                valid: false,
                activated: rec.activated_at.is_some(),
                status: Some(LicenseStatus::Revoked),
                expires: rec.expires_at,
                features: None,
                message: Some("license revoked".to_owned()),
            }),
            LicenseStatus::Pending => Ok(VerifyOutcome {
                valid: true,
                activated: false,
                status: Some(LicenseStatus::Pending),
                expires: rec.expires_at,
                features: Some(rec.features()),
                message: None,
            }),
            LicenseStatus::Active => {
                let bound_ok = match (&rec.hwid, rec.hwid_policy) {
                    (_, HwidPolicy::None) => true,
                    // activated without binding (optional policy)
                    (None, _) => true,
                    (Some(bound), _) => !matches!(
                        hwid::check(
                            bound,
                            hwid_input,
                            policy.strict_hwid_check,
                            policy.allow_multiple_devices,
                        ),
                        HwidCheck::Mismatch
                    ),
                };

                if bound_ok {
                    Ok(VerifyOutcome {
                        valid: true,
                        activated: true,
                        status: Some(LicenseStatus::Active),
                        expires: rec.expires_at,
                        features: Some(rec.features()),
                        message: None,
                    })
                } else {
                    Ok(VerifyOutcome {
                        valid: false,
                        activated: true,
                        status: Some(LicenseStatus::Active),
                        expires: None,
                        features: None,
                        message: Some(AuthorityError::HwidMismatch.to_string()),
                    })
                }
            }
        }
    }

    // ── Activate ─────────────────────────────────────────────────────────

    pub async fn activate(
        &self,
        key_input: &str,
        hwid_input: &str,
    ) -> Result<LicenseRecord, AuthorityError> {
        let policy = self.settings.policy()?;
        let key_policy = policy.key_policy();
        let key = keycodec::canonicalize(&key_policy, key_input);
        if !keycodec::validate(&key_policy, &key) {
            return Err(AuthorityError::Validation("malformed license key".to_owned()));
        }

        let hwid = hwid::normalize(hwid_input);
        if hwid.len() > MAX_HWID_LEN {
            return Err(AuthorityError::Validation(format!(
                "hwid exceeds {MAX_HWID_LEN} bytes"
            )));
        }

        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let Some(rec) = self.store.get_license_by_key(&key)? else {
            return Err(AuthorityError::NotFound("license not found".to_owned()));
        };

        let now = self.clock.now();
        if rec.effective_status(now) == LicenseStatus::Expired {
            self.persist_expiry_locked(rec.id, now)?;
            return Err(AuthorityError::Gone("license expired".to_owned()));
        }

        match rec.status {
            LicenseStatus::Revoked => Err(AuthorityError::Gone("license revoked".to_owned())),
            LicenseStatus::Expired => Err(AuthorityError::Gone("license expired".to_owned())),
            LicenseStatus::Active => self.reactivate_bound(rec, hwid, &policy),
            LicenseStatus::Pending => {
                if rec.hwid_policy == HwidPolicy::Required && hwid.is_empty() {
                    return Err(AuthorityError::Validation(
                        "hwid is required to activate this license".to_owned(),
                    ));
                }
                let mut rec = rec;
                rec.hwid = (!hwid.is_empty()).then(|| hwid.to_owned());
                rec.status = LicenseStatus::Active;
                rec.activated_at = Some(now);
                self.store.update_license(&rec)?;
                self.emit(EventKind::Activated, &rec);
                Ok(rec)
            }
        }
    }

    /// Repeat activation of an already-active license: idempotent on the
    /// same device, policy-checked on a different one. An unbound license
    /// (optional policy) binds to the first device that shows up.
    fn reactivate_bound(
        &self,
        rec: LicenseRecord,
        hwid: &str,
        policy: &Policy,
    ) -> Result<LicenseRecord, AuthorityError> {
        match (&rec.hwid, rec.hwid_policy) {
            (_, HwidPolicy::None) => Ok(rec),
            (None, _) => {
                if hwid.is_empty() {
                    return Ok(rec);
                }
                let mut rec = rec;
                rec.hwid = Some(hwid.to_owned());
                self.store.update_license(&rec)?;
                Ok(rec)
            }
            (Some(bound), _) => match hwid::check(
                bound,
                hwid,
                policy.strict_hwid_check,
                policy.allow_multiple_devices,
            ) {
                HwidCheck::Match | HwidCheck::Compatible => Ok(rec),
                HwidCheck::Mismatch => Err(AuthorityError::HwidMismatch),
            },
        }
    }

    // ── Admin patch: renew / revoke ──────────────────────────────────────

    pub async fn update_license(
        &self,
        id: u64,
        patch: LicensePatch,
    ) -> Result<LicenseRecord, AuthorityError> {
        let Some(existing) = self.store.get_license(id)? else {
            return Err(AuthorityError::NotFound("license not found".to_owned()));
        };

        let lock = self.key_lock(&existing.key).await;
        let _guard = lock.lock().await;

        // re-read under the lock
        let Some(mut rec) = self.store.get_license(id)? else {
            return Err(AuthorityError::NotFound("license not found".to_owned()));
        };

        let now = self.clock.now();
        match patch.status {
            Some(LicenseStatus::Revoked) => {
                if rec.status == LicenseStatus::Revoked {
                    return Err(AuthorityError::Conflict("license is already revoked".to_owned()));
                }
                rec.status = LicenseStatus::Revoked;
                self.store.update_license(&rec)?;
                self.emit(EventKind::Revoked, &rec);
                Ok(rec)
            }
            Some(LicenseStatus::Active) => {
                if rec.effective_status(now) == LicenseStatus::Pending {
                    return Err(AuthorityError::Conflict(
                        "cannot renew a pending license".to_owned(),
                    ));
                }

                let policy = self.settings.policy()?;
                let new_expiry = match patch.expires_at {
                    Some(exp) => {
                        if exp <= now {
                            return Err(AuthorityError::Validation(
                                "expiresAt must be in the future".to_owned(),
                            ));
                        }
                        exp
                    }
                    None => {
                        let base = rec.expires_at.unwrap_or(now).max(now);
                        base.checked_add(policy.default_duration_days * DAY_SECS)
                            .ok_or_else(|| {
                                AuthorityError::Validation("duration too large".to_owned())
                            })?
                    }
                };
                rec.expires_at = Some(new_expiry);

                // a license that was never bound but must be goes back to
                // pending so the client re-activates
                if rec.hwid.is_none() && rec.hwid_policy == HwidPolicy::Required {
                    rec.status = LicenseStatus::Pending;
                    rec.activated_at = None;
                } else {
                    rec.status = LicenseStatus::Active;
                    if rec.activated_at.is_none() {
                        rec.activated_at = Some(now);
                    }
                }

                self.store.update_license(&rec)?;
                self.emit(EventKind::Renewed, &rec);
                Ok(rec)
            }
            Some(other) => Err(AuthorityError::Conflict(format!(
                "illegal status transition to {}",
                other.as_str()
            ))),
            None => match patch.expires_at {
                Some(exp) => {
                    if exp < rec.created_at {
                        return Err(AuthorityError::Validation(
                            "expiresAt predates the license".to_owned(),
                        ));
                    }
                    rec.expires_at = Some(exp);
                    self.store.update_license(&rec)?;
                    self.emit(EventKind::Renewed, &rec);
                    Ok(rec)
                }
                None => Err(AuthorityError::Validation("empty patch".to_owned())),
            },
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn list(&self, filter: &LicenseFilter) -> Result<Vec<LicenseRecord>, AuthorityError> {
        Ok(self.store.list_licenses(filter, self.clock.now())?)
    }

    pub fn stats(&self) -> Result<StatusCounts, AuthorityError> {
        Ok(self.store.count_by_status(self.clock.now())?)
    }

    // ── Sweep ────────────────────────────────────────────────────────────

    /// Persists lazy expiry and emits `expired` / `expiringSoon` events.
    /// Single-flight: a sweep that finds another one running returns
    /// immediately.
    pub async fn sweep(&self) -> Result<SweepReport, AuthorityError> {
        let Ok(_gate) = self.sweep_gate.try_lock() else {
            debug!("sweep already in progress, skipping");
            return Ok(SweepReport::default());
        };

        let now = self.clock.now();
        let mut report = SweepReport::default();

        for rec in self.store.stale_licenses(now)? {
            if self.persist_expiry(&rec, now).await? {
                report.expired += 1;
            }
        }

        for rec in self.store.expiring_licenses(now, EXPIRY_WARNING_WINDOW)? {
            let due = match self.store.last_expiry_notice(rec.id)? {
                None => true,
                Some(last) => now - last >= EXPIRY_NOTICE_INTERVAL,
            };
            if due {
                self.emit(EventKind::ExpiringSoon, &rec);
                self.store.record_expiry_notice(rec.id, now)?;
                report.expiring_soon += 1;
            }
        }

        Ok(report)
    }

    /// Runs the sweep on a fixed interval until the task is dropped.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) if report.expired > 0 || report.expiring_soon > 0 => {
                        debug!(
                            expired = report.expired,
                            expiring_soon = report.expiring_soon,
                            "expiry sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
        })
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist_expiry(&self, rec: &LicenseRecord, now: i64) -> Result<bool, AuthorityError> {
        let lock = self.key_lock(&rec.key).await;
        let _guard = lock.lock().await;
        self.persist_expiry_locked(rec.id, now)
    }

    /// Caller holds the key lock. Re-reads the record so a racing writer's
    /// transition is never clobbered; emits `expired` only on the actual
    /// stored transition.
    fn persist_expiry_locked(&self, id: u64, now: i64) -> Result<bool, AuthorityError> {
        let Some(mut rec) = self.store.get_license(id)? else {
            return Ok(false);
        };
        let stored_live = matches!(
            rec.status,
            LicenseStatus::Pending | LicenseStatus::Active
        );
        if !stored_live || !matches!(rec.expires_at, Some(exp) if now >= exp) {
            return Ok(false);
        }
        rec.status = LicenseStatus::Expired;
        self.store.update_license(&rec)?;
        self.emit(EventKind::Expired, &rec);
        Ok(true)
    }

    fn emit(&self, kind: EventKind, rec: &LicenseRecord) {
        self.events.publish(LifecycleEvent {
            kind,
            license_id: rec.id,
            key: rec.key.clone(),
            at: self.clock.now(),
            discord_username: rec.discord_username.clone(),
        });
    }
}

fn resolve_duration(req: &IssueRequest, policy: &Policy) -> Result<i64, AuthorityError> {
    if let Some(days) = req.license_type.preset_days() {
        return Ok(days);
    }
    let n = req.duration.unwrap_or(policy.default_duration_days);
    if n < 1 {
        return Err(AuthorityError::Validation(
            "duration must be at least 1".to_owned(),
        ));
    }
    let unit = req.duration_unit.unwrap_or(DurationUnit::Days);
    n.checked_mul(unit.day_multiplier())
        .ok_or_else(|| AuthorityError::Validation("duration too large".to_owned()))
}
