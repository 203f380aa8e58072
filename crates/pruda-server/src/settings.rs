//! Policy knobs backed by the `settings` table.
//!
//! Reads go through a process-wide cache that is invalidated on every write,
//! so the authority sees fresh policy without re-reading the store on each
//! request. The registry is an explicit handle threaded into the authority;
//! there is no global.

use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::error::AuthorityError;
use crate::keycodec::{KeyPolicy, SUPPORTED_LENGTHS};
use crate::store::{Setting, Store};

pub const LICENSE_PREFIX: &str = "licensePrefix";
pub const LICENSE_LENGTH: &str = "licenseLength";
pub const DEFAULT_LICENSE_DURATION: &str = "defaultLicenseDuration";
pub const STRICT_HWID_CHECK: &str = "strictHwidCheck";
pub const ALLOW_MULTIPLE_DEVICES: &str = "allowMultipleDevices";

/// Typed snapshot of the recognized settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub license_prefix: String,
    pub license_length: usize,
    pub default_duration_days: i64,
    pub strict_hwid_check: bool,
    pub allow_multiple_devices: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            license_prefix: "PRUDA".to_owned(),
            license_length: 16,
            default_duration_days: 30,
            strict_hwid_check: true,
            allow_multiple_devices: false,
        }
    }
}

impl Policy {
    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            prefix: self.license_prefix.clone(),
            length: self.license_length,
        }
    }
}

#[derive(Clone)]
pub struct SettingsRegistry {
    store: Store,
    cache: Arc<RwLock<Option<Policy>>>,
}

impl SettingsRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Current policy snapshot, read through the cache.
    pub fn policy(&self) -> Result<Policy> {
        if let Some(policy) = self.cache.read().expect("settings cache poisoned").as_ref() {
            return Ok(policy.clone());
        }
        let policy = self.load()?;
        *self.cache.write().expect("settings cache poisoned") = Some(policy.clone());
        Ok(policy)
    }

    fn load(&self) -> Result<Policy> {
        let defaults = Policy::default();
        let get = |key: &str| self.store.get_setting(key);

        Ok(Policy {
            license_prefix: get(LICENSE_PREFIX)?.unwrap_or(defaults.license_prefix),
            license_length: get(LICENSE_LENGTH)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.license_length),
            default_duration_days: get(DEFAULT_LICENSE_DURATION)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_duration_days),
            strict_hwid_check: get(STRICT_HWID_CHECK)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.strict_hwid_check),
            allow_multiple_devices: get(ALLOW_MULTIPLE_DEVICES)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.allow_multiple_devices),
        })
    }

    /// Validates, persists, and invalidates the cache. Unrecognized keys are
    /// stored verbatim; the dashboard keeps a few knobs the authority never
    /// reads.
    pub fn set(&self, key: &str, value: &str) -> Result<(), AuthorityError> {
        validate_setting(key, value)?;
        self.store.put_setting(key, value)?;
        *self.cache.write().expect("settings cache poisoned") = None;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get_setting(key)
    }

    pub fn list(&self) -> Result<Vec<Setting>> {
        self.store.list_settings()
    }
}

fn validate_setting(key: &str, value: &str) -> Result<(), AuthorityError> {
    match key {
        LICENSE_PREFIX => {
            let ok = (1..=8).contains(&value.len())
                && value
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            if !ok {
                return Err(AuthorityError::Validation(
                    "licensePrefix must be 1-8 characters of A-Z0-9".to_owned(),
                ));
            }
        }
        LICENSE_LENGTH => {
            let ok = value
                .parse::<usize>()
                .map(|n| SUPPORTED_LENGTHS.contains(&n))
                .unwrap_or(false);
            if !ok {
                return Err(AuthorityError::Validation(
                    "licenseLength must be one of 12, 16, 20, 24".to_owned(),
                ));
            }
        }
        DEFAULT_LICENSE_DURATION => {
            let ok = value.parse::<i64>().map(|n| n >= 1).unwrap_or(false);
            if !ok {
                return Err(AuthorityError::Validation(
                    "defaultLicenseDuration must be at least 1 day".to_owned(),
                ));
            }
        }
        STRICT_HWID_CHECK | ALLOW_MULTIPLE_DEVICES => {
            if value.parse::<bool>().is_err() {
                return Err(AuthorityError::Validation(format!(
                    "{key} must be true or false"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}
