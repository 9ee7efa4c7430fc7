//! Device command client contract
//!
//! Operations the convergence engine issues against the local BIG-IP. The
//! concrete REST client lives outside this crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use bigip_autoscale_common::{Credentials, Error, JoinRequest};

/// Identity reported by the local device
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device hostname
    pub hostname: String,
    /// Hardware/VM machine ID
    pub machine_id: String,
    /// Base MAC address
    pub mac_address: String,
    /// Software version, e.g. "14.1.2"
    pub version: String,
}

/// Where the device's management plane listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagementAddress {
    /// Management IP
    pub host: String,
    /// Management port
    pub port: u16,
}

/// Config sync reachability of peers as seen by the device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Hostnames of peers in sync contact
    pub connected: Vec<String>,
    /// Hostnames of peers the device cannot reach
    pub disconnected: Vec<String>,
}

/// Parameters for joining the local device to a remote primary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterJoin {
    /// Device group to join
    pub device_group: String,
    /// Primary management address
    pub remote_host: String,
    /// Primary management port
    pub remote_port: u16,
    /// Primary admin account
    pub remote_credentials: Credentials,
}

/// Options for loading a backup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Keep the running license instead of the archived one
    pub no_license: bool,
    /// Reset device trust after the load
    pub reset_trust: bool,
}

/// A local user account snapshot that can be restored verbatim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAccount {
    /// Account name
    pub name: String,
    /// Device-encrypted password hash
    pub encrypted_password: String,
}

/// Commands issued to the local device
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Credentials this client authenticates with
    fn credentials(&self) -> Credentials;

    /// Identity of the device
    async fn device_info(&self) -> Result<DeviceInfo, Error>;

    /// Management address of the device
    async fn management_address(&self) -> Result<ManagementAddress, Error>;

    /// Wait until the device is active and ready for configuration
    async fn ready(&self) -> Result<(), Error>;

    /// Set the config sync address
    async fn set_config_sync_ip(&self, ip: &str) -> Result<(), Error>;

    /// Create a sync-failover device group containing `hostnames`
    async fn create_device_group(&self, name: &str, hostnames: &[String]) -> Result<(), Error>;

    /// Delete a device group if present
    async fn delete_device_group(&self, name: &str) -> Result<(), Error>;

    /// Reset device trust to a standalone state
    async fn reset_trust(&self) -> Result<(), Error>;

    /// Join the local device to a remote primary's device group
    async fn join_cluster(&self, join: &ClusterJoin) -> Result<(), Error>;

    /// Add a remote device to the local device group using its temporary account
    async fn add_to_cluster(&self, request: &JoinRequest) -> Result<(), Error>;

    /// Remove devices from trust and the device group
    async fn remove_from_cluster(&self, hostnames: &[String], device_group: &str)
        -> Result<(), Error>;

    /// Peer reachability for config sync
    async fn sync_status(&self) -> Result<SyncStatus, Error>;

    /// Create a local admin account
    async fn create_admin_user(&self, username: &str, password: &str) -> Result<(), Error>;

    /// Snapshot a local user account
    async fn get_user(&self, name: &str) -> Result<UserAccount, Error>;

    /// Restore a user account snapshot
    async fn restore_user(&self, account: &UserAccount) -> Result<(), Error>;

    /// Save a full backup named `name`; returns its path on the device
    async fn save_ucs(&self, name: &str) -> Result<PathBuf, Error>;

    /// Load a backup
    async fn load_ucs(&self, path: &Path, options: LoadOptions) -> Result<(), Error>;

    /// Reload the base system configuration
    async fn load_base_config(&self) -> Result<(), Error>;
}
