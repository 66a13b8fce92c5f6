//! Device configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub facility: FacilityConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub biometric: BiometricConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier, included in upload metadata
    pub id: String,

    /// Data directory (session store, cached definitions)
    pub data_dir: PathBuf,
}

/// Facility policy, administered centrally and consumed here as opaque
/// external input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilityConfig {
    /// Minimum days before a previously enrolled participant may be
    /// re-screened without being flagged as a duplicate
    #[serde(default = "default_window_days")]
    pub re_enrollment_window_days: i64,

    /// Recruitment coupons handed out per completed session
    #[serde(default = "default_coupon_count")]
    pub coupons_to_issue: u32,

    /// Whether ineligible participants still receive coupons
    #[serde(default)]
    pub issue_to_ineligible: bool,

    /// Whether sample collection happens right after eligibility or is
    /// deferred to just before completion
    #[serde(default = "default_true")]
    pub collect_samples_immediately: bool,

    /// Whether contact-info / recruitment-pool features are active
    #[serde(default)]
    pub contact_info_enabled: bool,
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            re_enrollment_window_days: default_window_days(),
            coupons_to_issue: default_coupon_count(),
            issue_to_ineligible: false,
            collect_samples_immediately: true,
            contact_info_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the central server
    pub server_url: String,

    /// Facility credential sent with every request
    pub facility_token: String,

    /// Seconds between definition version checks
    #[serde(default = "default_definition_interval")]
    pub definition_check_interval_secs: u64,

    /// Seconds between upload queue polls
    #[serde(default = "default_upload_poll_interval")]
    pub upload_poll_interval_secs: u64,

    /// Attempts before an upload is marked FAILED_TERMINAL
    #[serde(default = "default_max_attempts")]
    pub max_upload_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiometricConfig {
    /// Capture deadline in milliseconds
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,

    /// Minimum acceptable capture quality (device units, 0-100)
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,
}

impl Default for BiometricConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: default_capture_timeout(),
            min_quality: default_min_quality(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "tablet-1".to_string(),
            data_dir: PathBuf::from("/var/lib/tracelink"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            facility_token: String::new(),
            definition_check_interval_secs: default_definition_interval(),
            upload_poll_interval_secs: default_upload_poll_interval(),
            max_upload_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

// Defaults
fn default_window_days() -> i64 { 90 }
fn default_coupon_count() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_definition_interval() -> u64 { 300 }
fn default_upload_poll_interval() -> u64 { 15 }
fn default_max_attempts() -> u32 { 5 }
fn default_backoff_base() -> u64 { 2_000 }
fn default_backoff_cap() -> u64 { 300_000 }
fn default_capture_timeout() -> u64 { 10_000 }
fn default_min_quality() -> u8 { 40 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let toml = r#"
            [device]
            id = "tablet-7"
            data_dir = "/data/tracelink"

            [sync]
            server_url = "https://central.example.org"
            facility_token = "tok-123"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.device.id, "tablet-7");
        assert_eq!(config.facility.re_enrollment_window_days, 90);
        assert_eq!(config.facility.coupons_to_issue, 3);
        assert!(!config.facility.issue_to_ineligible);
        assert!(config.facility.collect_samples_immediately);
        assert_eq!(config.sync.max_upload_attempts, 5);
        assert_eq!(config.biometric.capture_timeout_ms, 10_000);
    }

    #[test]
    fn test_policy_overrides() {
        let toml = r#"
            [device]
            id = "tablet-7"
            data_dir = "/data/tracelink"

            [facility]
            re_enrollment_window_days = 30
            coupons_to_issue = 5
            issue_to_ineligible = true
            collect_samples_immediately = false

            [sync]
            server_url = "https://central.example.org"
            facility_token = "tok-123"
            max_upload_attempts = 8
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.facility.re_enrollment_window_days, 30);
        assert_eq!(config.facility.coupons_to_issue, 5);
        assert!(config.facility.issue_to_ineligible);
        assert!(!config.facility.collect_samples_immediately);
        assert_eq!(config.sync.max_upload_attempts, 8);
    }
}
