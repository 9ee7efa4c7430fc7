//! Configuration for a convergence pass.
//!
//! Loaded from YAML by the host process and passed explicitly into the
//! engine, mailbox and backup workflow. Every field has a default so a config
//! file only needs to name what differs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Default device group name
pub const DEFAULT_DEVICE_GROUP: &str = "failoverGroup";

/// Default management port
pub const DEFAULT_MGMT_PORT: u16 = 443;

/// Default number of stored backups to keep
pub const DEFAULT_MAX_UCS_FILES: u32 = 7;

/// Default prefix for stored backup names
pub const DEFAULT_UCS_PREFIX: &str = "ucsAutosave_";

/// Which instance address DNS records point at
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DnsIpType {
    /// Public address, falling back to private
    Public,
    /// Private address
    #[default]
    Private,
}

/// DNS update settings; present only when a DNS provider is configured
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// Address type to publish
    #[serde(default)]
    pub ip_type: DnsIpType,
    /// Application port published with each record
    #[serde(default = "DnsConfig::default_app_port")]
    pub app_port: u16,
}

impl DnsConfig {
    fn default_app_port() -> u16 {
        DEFAULT_MGMT_PORT
    }
}

/// A library file renamed around a backup save on older device versions
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRename {
    /// File name as shipped
    pub from: String,
    /// File name used while the backup is saved
    pub to: String,
}

/// Backup capture and restore settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    /// Local directory for validation and restore copies
    pub working_dir: PathBuf,
    /// Base configuration file cleaned before a restore
    pub base_config_path: PathBuf,
    /// Directory holding the library files that break saves before 13.1
    pub legacy_library_dir: PathBuf,
    /// Files renamed in `legacy_library_dir` before a save
    pub legacy_library_files: Vec<LegacyRename>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/tmp/autoscale"),
            base_config_path: PathBuf::from("/config/bigip_base.conf"),
            legacy_library_dir: PathBuf::from(
                "/config/cloud/node_modules/@f5devcentral/f5-cloud-libs/node_modules/ajv/lib/dotjs",
            ),
            legacy_library_files: vec![
                LegacyRename {
                    from: "_limit.js".to_string(),
                    to: "limit.js".to_string(),
                },
                LegacyRename {
                    from: "_limitItems.js".to_string(),
                    to: "limitItems.js".to_string(),
                },
            ],
        }
    }
}

/// Pass census settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CensusConfig {
    /// Directory holding one record per running pass
    pub run_dir: PathBuf,
    /// Age after which a running pass is considered stuck
    pub stale_after_secs: u64,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/var/run/autoscale"),
            stale_after_secs: 10 * 60,
        }
    }
}

impl CensusConfig {
    /// Stale timeout as a duration
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Default retry budget for collaborator calls
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts in milliseconds
    pub retry_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default_retry();
        Self {
            max_retries: policy.max_retries,
            retry_interval_ms: policy.retry_interval.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    /// Build the policy this config describes
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_interval_ms),
        )
    }
}

/// Top-level autoscale configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscaleConfig {
    /// Device group every member joins
    pub device_group: String,
    /// Primary refuses new members while set
    pub block_sync: bool,
    /// Management port used when an instance record has none
    pub mgmt_port: u16,
    /// Stored backups kept by the provider
    pub max_ucs_files: u32,
    /// Prefix for stored backup names
    pub ucs_prefix: String,
    /// Marker file present only on the primary
    pub primary_marker_path: PathBuf,
    /// DNS update settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    /// Backup settings
    pub backup: BackupConfig,
    /// Pass census settings
    pub census: CensusConfig,
    /// Default retry budget
    pub retry: RetryConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            device_group: DEFAULT_DEVICE_GROUP.to_string(),
            block_sync: false,
            mgmt_port: DEFAULT_MGMT_PORT,
            max_ucs_files: DEFAULT_MAX_UCS_FILES,
            ucs_prefix: DEFAULT_UCS_PREFIX.to_string(),
            primary_marker_path: PathBuf::from("/config/cloud/primary"),
            dns: None,
            backup: BackupConfig::default(),
            census: CensusConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AutoscaleConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject configurations no pass could run with
    pub fn validate(&self) -> Result<()> {
        if self.device_group.trim().is_empty() {
            return Err(Error::validation_for_field(
                "deviceGroup",
                "device group must not be empty",
            ));
        }
        if self.max_ucs_files == 0 {
            return Err(Error::validation_for_field(
                "maxUcsFiles",
                "at least one backup must be retained",
            ));
        }
        if self.mgmt_port == 0 {
            return Err(Error::validation_for_field("mgmtPort", "port must be non-zero"));
        }
        if let Some(dns) = &self.dns {
            if dns.app_port == 0 {
                return Err(Error::validation_for_field(
                    "dns.appPort",
                    "port must be non-zero",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AutoscaleConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, AutoscaleConfig::default());
        assert_eq!(config.device_group, "failoverGroup");
        assert_eq!(config.max_ucs_files, 7);
        assert!(config.dns.is_none());
    }

    #[test]
    fn test_partial_document_overrides_only_named_fields() {
        let yaml = r#"
deviceGroup: autoscaleGroup
blockSync: true
dns:
  ipType: public
  appPort: 8443
backup:
  workingDir: /tmp/ucs
retry:
  maxRetries: 5
  retryIntervalMs: 250
"#;
        let config = AutoscaleConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.device_group, "autoscaleGroup");
        assert!(config.block_sync);
        let dns = config.dns.as_ref().unwrap();
        assert_eq!(dns.ip_type, DnsIpType::Public);
        assert_eq!(dns.app_port, 8443);
        assert_eq!(config.backup.working_dir, PathBuf::from("/tmp/ucs"));
        assert_eq!(
            config.backup.base_config_path,
            PathBuf::from("/config/bigip_base.conf")
        );
        let policy = config.retry.policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_unusable_values() {
        let err = AutoscaleConfig::from_yaml_str("deviceGroup: ''").unwrap_err();
        assert!(err.to_string().contains("device group"));

        let err = AutoscaleConfig::from_yaml_str("maxUcsFiles: 0").unwrap_err();
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("maxUcsFiles")),
            other => panic!("Expected Validation variant, got {other:?}"),
        }

        let err = AutoscaleConfig::from_yaml_str("dns:\n  appPort: 0").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_malformed_yaml_is_serialization_error() {
        let err = AutoscaleConfig::from_yaml_str("deviceGroup: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autoscale.yaml");
        std::fs::write(&path, "maxUcsFiles: 3\n").unwrap();

        let config = AutoscaleConfig::from_file(&path).unwrap();
        assert_eq!(config.max_ucs_files, 3);

        let err = AutoscaleConfig::from_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
