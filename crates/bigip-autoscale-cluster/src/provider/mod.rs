//! Cloud provider collaborator contracts
//!
//! The convergence engine never talks to a cloud API directly. Instance
//! discovery, record storage, election, backups, the mailbox transport,
//! public key storage and DNS are each a trait here, implemented by a
//! concrete provider adapter outside this crate.
//!
//! Optional behavior is gated on the [`Features`] the directory reports.
//! Asking [`Providers`] for a capability that was not supplied returns
//! [`Error::Unimplemented`] instead of panicking.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use bigip_autoscale_common::{Credentials, Error, Instance, Instances, Message, MessageAction};

/// Optional provider capabilities
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    /// Provider can carry mailbox messages between instances
    Messaging,
    /// Message payloads are encrypted per recipient
    Encryption,
    /// All members share one admin password
    SharedPassword,
}

impl Feature {
    /// Capability name used in `Unimplemented` errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Messaging => "messaging",
            Self::Encryption => "encryption",
            Self::SharedPassword => "shared-password",
        }
    }
}

/// Capability set reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Mailbox transport available
    pub messaging: bool,
    /// Per-instance payload encryption available
    pub encryption: bool,
    /// Admin password shared across members
    pub shared_password: bool,
}

impl Features {
    /// No optional capabilities
    pub fn none() -> Self {
        Self::default()
    }

    /// Enable a capability
    pub fn with(mut self, feature: Feature) -> Self {
        match feature {
            Feature::Messaging => self.messaging = true,
            Feature::Encryption => self.encryption = true,
            Feature::SharedPassword => self.shared_password = true,
        }
        self
    }

    /// Whether the capability is present
    pub fn has_feature(&self, feature: Feature) -> bool {
        match feature {
            Feature::Messaging => self.messaging,
            Feature::Encryption => self.encryption,
            Feature::SharedPassword => self.shared_password,
        }
    }
}

/// A backup held in provider storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUcs {
    /// Object name in provider storage
    pub name: String,
    /// Archive contents
    pub data: Vec<u8>,
}

/// One DNS record pointing at a cluster member
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DnsRecord {
    /// Member hostname
    pub name: String,
    /// Address clients should use
    pub ip: String,
    /// Application port
    pub port: u16,
}

/// Instance directory backed by the cloud provider
///
/// Owns the instance records. This crate reads a fresh snapshot at the start
/// of every pass and writes back only the local record.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Optional capabilities of this provider
    fn features(&self) -> Features;

    /// All known instances keyed by ID
    async fn get_instances(&self) -> Result<Instances, Error>;

    /// Persist one instance record
    async fn put_instance(&self, id: &str, instance: &Instance) -> Result<(), Error>;

    /// Fetch the primary's admin credentials for a direct join
    ///
    /// # Arguments
    ///
    /// * `mgmt_ip` - Management address of the primary
    /// * `port` - Management port of the primary
    async fn get_primary_credentials(&self, mgmt_ip: &str, port: u16)
        -> Result<Credentials, Error>;

    /// Publish the local (primary) credentials for others to fetch
    async fn put_primary_credentials(&self) -> Result<(), Error>;

    /// Pick a primary from the snapshot; the result must be one of its keys
    async fn elect_primary(&self, instances: &Instances) -> Result<String, Error>;

    /// Provider-specific check that `id` may remain primary
    async fn is_valid_primary(&self, id: &str, instances: &Instances) -> Result<bool, Error>;

    /// Notification that `id` is the elected primary
    async fn primary_elected(&self, id: &str) -> Result<(), Error>;

    /// Tag the instance set as running the primary
    async fn tag_primary_instance(&self, id: &str, instances: &Instances) -> Result<(), Error>;

    /// Notification that `id` was rejected as primary
    async fn primary_invalidated(&self, id: &str) -> Result<(), Error>;

    /// Upload a backup, keeping at most `max_copies` with names starting `prefix`
    async fn store_ucs(&self, path: &Path, max_copies: u32, prefix: &str) -> Result<(), Error>;

    /// The most recent stored backup, if any
    async fn get_stored_ucs(&self) -> Result<Option<StoredUcs>, Error>;

    /// Delete a stored backup by name
    async fn delete_stored_ucs(&self, name: &str) -> Result<(), Error>;
}

/// Mailbox transport between instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Send a message
    async fn send_message(&self, message: &Message) -> Result<(), Error>;

    /// Pending messages for `to_instance_id` with one of the given actions
    async fn get_messages(
        &self,
        actions: &[MessageAction],
        to_instance_id: &str,
    ) -> Result<Vec<Message>, Error>;

    /// Acknowledge a processed message by its completion handle
    async fn complete_message(&self, handle: &str) -> Result<(), Error>;

    /// The primary finished syncing this instance; rotate shared credentials
    async fn sync_complete(&self, from_user: &str, from_password: &str) -> Result<(), Error>;
}

/// Per-instance public key storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublicKeyStore: Send + Sync {
    /// PEM public key of `instance_id`
    async fn get_public_key(&self, instance_id: &str) -> Result<String, Error>;

    /// Publish the PEM public key of `instance_id`
    async fn put_public_key(&self, instance_id: &str, key: &str) -> Result<(), Error>;
}

/// DNS provider updated with the current membership
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Replace the published records
    async fn update(&self, records: &[DnsRecord]) -> Result<(), Error>;
}

/// Rewrites cloud-specific identifiers inside a backup before it is loaded
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UcsReconciler: Send + Sync {
    /// Write a reconciled copy of `original` to `updated`
    async fn reconcile(&self, original: &Path, updated: &Path) -> Result<(), Error>;
}

/// The provider collaborators for one pass
///
/// Only the directory is mandatory. Capability accessors return
/// [`Error::Unimplemented`] when the matching collaborator is absent.
#[derive(Clone)]
pub struct Providers {
    /// Instance directory
    pub directory: Arc<dyn InstanceDirectory>,
    /// Mailbox transport
    pub messaging: Option<Arc<dyn Messaging>>,
    /// Public key storage
    pub keys: Option<Arc<dyn PublicKeyStore>>,
    /// DNS provider
    pub dns: Option<Arc<dyn DnsProvider>>,
    /// Backup reconciler used on restore
    pub reconciler: Option<Arc<dyn UcsReconciler>>,
}

impl Providers {
    /// Providers with only a directory
    pub fn new(directory: Arc<dyn InstanceDirectory>) -> Self {
        Self {
            directory,
            messaging: None,
            keys: None,
            dns: None,
            reconciler: None,
        }
    }

    /// Attach a mailbox transport
    pub fn with_messaging(mut self, messaging: Arc<dyn Messaging>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    /// Attach public key storage
    pub fn with_keys(mut self, keys: Arc<dyn PublicKeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Attach a DNS provider
    pub fn with_dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Attach a backup reconciler
    pub fn with_reconciler(mut self, reconciler: Arc<dyn UcsReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Whether the directory reports the capability
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.directory.features().has_feature(feature)
    }

    /// The mailbox transport, or `Unimplemented`
    pub fn messaging(&self) -> Result<&dyn Messaging, Error> {
        self.messaging
            .as_deref()
            .ok_or_else(|| Error::unimplemented(Feature::Messaging.name()))
    }

    /// The public key store, or `Unimplemented`
    pub fn keys(&self) -> Result<&dyn PublicKeyStore, Error> {
        self.keys
            .as_deref()
            .ok_or_else(|| Error::unimplemented(Feature::Encryption.name()))
    }

    /// The backup reconciler, or `Unimplemented`
    pub fn reconciler(&self) -> Result<&dyn UcsReconciler, Error> {
        self.reconciler
            .as_deref()
            .ok_or_else(|| Error::unimplemented("ucs-reconcile"))
    }
}
