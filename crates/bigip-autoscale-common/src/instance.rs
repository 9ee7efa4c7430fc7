//! Instance records shared through the instance directory.
//!
//! The directory provider owns these records and creates them when it first
//! sees an instance in the cloud inventory. A convergence pass only mutates the
//! fields it owns on the local record (status, primary flag, version flag,
//! primary status, join/backup timestamps) and writes that record back.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds a non-OK belief about the primary may persist before the primary
/// is considered expired
pub const PRIMARY_EXPIRE_AFTER_SECS: i64 = 3 * 60;

/// Stored records older than this many seconds may be deleted by the provider
pub const MAX_STORED_INSTANCE_AGE_SECS: i64 = 24 * 60 * 60;

/// Directory snapshot keyed by instance ID
///
/// Ordered so that every pass walks instances in the same order.
pub type Instances = BTreeMap<String, Instance>;

/// Lifecycle status of an instance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Normal operation
    #[default]
    Ok,
    /// Elected primary still restoring state; guards re-entrancy
    BecomingPrimary,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::BecomingPrimary => write!(f, "BECOMING_PRIMARY"),
        }
    }
}

/// An instance's belief about the current primary's health
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrimaryHealth {
    /// Primary passes every check
    Ok,
    /// External instances exist but the primary is not one of them
    NotExternal,
    /// The cloud inventory no longer reports the primary
    NotInCloudList,
    /// A visible instance runs a newer version than the primary
    VersionNotUpToDate,
    /// No primary known
    #[default]
    Unknown,
}

impl fmt::Display for PrimaryHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::NotExternal => write!(f, "NOT_EXTERNAL"),
            Self::NotInCloudList => write!(f, "NOT_IN_CLOUD_LIST"),
            Self::VersionNotUpToDate => write!(f, "VERSION_NOT_UP_TO_DATE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Local belief about the primary, persisted on each instance's record
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryStatus {
    /// Instance believed to be primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Health of that primary as last observed
    #[serde(default)]
    pub status: PrimaryHealth,
    /// When the belief was last recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    /// When `status` last changed value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_change: Option<DateTime<Utc>>,
}

impl PrimaryStatus {
    /// Record an observation
    ///
    /// `last_status_change` only advances when the status value changes, so
    /// expiry does not depend on how often passes run.
    pub fn record(&mut self, instance_id: Option<&str>, status: PrimaryHealth, now: DateTime<Utc>) {
        if self.status != status || self.last_status_change.is_none() {
            self.last_status_change = Some(now);
        }
        self.instance_id = instance_id.map(str::to_string);
        self.status = status;
        self.last_update = Some(now);
    }

    /// Whether the primary has been unhealthy for longer than [`PRIMARY_EXPIRE_AFTER_SECS`]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status == PrimaryHealth::Ok {
            return false;
        }
        match self.last_status_change {
            Some(changed) => now - changed > Duration::seconds(PRIMARY_EXPIRE_AFTER_SECS),
            None => false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// One appliance in the autoscale group
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Stable ID assigned by the provider
    pub id: String,
    /// Device hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Device machine ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Management interface MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Software version (dotted, e.g. "14.1.2.3")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Private (data plane) address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    /// Public address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    /// Management address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_ip: Option<String>,
    /// Management port, when not the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_port: Option<u16>,
    /// Whether this instance is the primary
    #[serde(default)]
    pub is_primary: bool,
    /// Whether the cloud inventory currently reports this instance
    #[serde(default = "default_true")]
    pub provider_visible: bool,
    /// Instance lives outside the autoscale group but participates in the cluster
    #[serde(default)]
    pub external: bool,
    /// Lifecycle status
    #[serde(default)]
    pub status: InstanceStatus,
    /// Whether this instance runs the highest version among visible instances
    #[serde(default = "default_true")]
    pub version_ok: bool,
    /// This instance's belief about the primary
    #[serde(default)]
    pub primary_status: PrimaryStatus,
    /// Last successful backup
    #[serde(default = "epoch")]
    pub last_backup: DateTime<Utc>,
    /// Last time this instance asked to join the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_join_request: Option<DateTime<Utc>>,
    /// Last time the provider refreshed this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Instance {
    /// Create a record with defaults for everything but the ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: None,
            machine_id: None,
            mac_address: None,
            version: None,
            private_ip: None,
            public_ip: None,
            mgmt_ip: None,
            mgmt_port: None,
            is_primary: false,
            provider_visible: true,
            external: false,
            status: InstanceStatus::Ok,
            version_ok: true,
            primary_status: PrimaryStatus::default(),
            last_backup: epoch(),
            last_join_request: None,
            last_update: None,
        }
    }

    /// Set the hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the private address
    pub fn with_private_ip(mut self, ip: impl Into<String>) -> Self {
        self.private_ip = Some(ip.into());
        self
    }

    /// Set the public address
    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = Some(ip.into());
        self
    }

    /// Set the management address
    pub fn with_mgmt_ip(mut self, ip: impl Into<String>) -> Self {
        self.mgmt_ip = Some(ip.into());
        self
    }

    /// Set the software version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Mark as primary
    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }

    /// Mark as external
    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Set provider visibility
    pub fn with_provider_visible(mut self, visible: bool) -> Self {
        self.provider_visible = visible;
        self
    }

    /// Set the lifecycle status
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the stored record is older than [`MAX_STORED_INSTANCE_AGE_SECS`]
    ///
    /// Records the provider never stamped are treated as fresh.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.last_update {
            Some(updated) => now - updated > Duration::seconds(MAX_STORED_INSTANCE_AGE_SECS),
            None => false,
        }
    }
}

/// Compare dotted version strings numerically ("13.1.0.2" < "14.0")
///
/// Missing components count as zero; non-numeric components compare as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(['.', '-'])
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Recompute `version_ok` for every instance in the snapshot
///
/// An instance is up to date when its version is at least the highest version
/// reported by any provider-visible instance. Instances without a known
/// version are left as they are.
pub fn mark_version_ok(instances: &mut Instances) {
    let highest = instances
        .values()
        .filter(|i| i.provider_visible)
        .filter_map(|i| i.version.as_deref())
        .max_by(|a, b| compare_versions(a, b))
        .map(str::to_string);

    let Some(highest) = highest else {
        return;
    };

    for instance in instances.values_mut() {
        if let Some(version) = instance.version.as_deref() {
            instance.version_ok = compare_versions(version, &highest) != Ordering::Less;
        }
    }
}

/// Whether at least one instance in the snapshot is external
pub fn has_external(instances: &Instances) -> bool {
    instances.values().any(|i| i.external)
}
