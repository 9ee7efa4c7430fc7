//! Mailbox protocol for joining a cluster through the provider's transport
//!
//! Used when instances cannot assume direct reach into each other's
//! management plane. A member that wants to join creates a temporary admin
//! account on itself and sends its address and that account to the primary in
//! an `ADD_TO_CLUSTER` message. The primary adds the member with those
//! credentials and answers with `SYNC_COMPLETE`, carrying its own current admin
//! credentials. When the provider supports encryption, every payload is
//! encrypted for its recipient.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use bigip_autoscale_common::{
    Error, Instance, JoinRequest, Message, MessageAction, RetryExecutor, SyncCompletePayload,
};

use crate::crypto::{random_credentials, PayloadCipher, PrivateKey};
use crate::device::DeviceClient;
use crate::provider::{Feature, Providers};

/// What a drain did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Senders added to the cluster
    pub joined: Vec<String>,
    /// Senders whose join request failed
    pub failed: Vec<String>,
    /// `SYNC_COMPLETE` messages forwarded to the provider
    pub synced: usize,
    /// Duplicate requests discarded
    pub duplicates: usize,
}

/// Encrypted message exchange between members and the primary
pub struct MailboxProtocol {
    providers: Providers,
    device: Arc<dyn DeviceClient>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    retry: RetryExecutor,
    device_group: String,
    private_key: OnceCell<PrivateKey>,
}

impl MailboxProtocol {
    /// Create a mailbox for the given collaborators
    pub fn new(
        providers: Providers,
        device: Arc<dyn DeviceClient>,
        retry: RetryExecutor,
        device_group: impl Into<String>,
    ) -> Self {
        Self {
            providers,
            device,
            cipher: None,
            retry,
            device_group: device_group.into(),
            private_key: OnceCell::new(),
        }
    }

    /// Use `cipher` for payload encryption
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    fn encrypting(&self) -> bool {
        self.providers.has_feature(Feature::Encryption)
    }

    fn cipher(&self) -> Result<&dyn PayloadCipher, Error> {
        self.cipher
            .as_deref()
            .ok_or_else(|| Error::unimplemented(Feature::Encryption.name()))
    }

    /// Publish the local public key so peers can encrypt for us
    pub async fn publish_public_key(&self, instance_id: &str) -> Result<(), Error> {
        let key = self.cipher()?.local_public_key().await?;
        let keys = self.providers.keys()?;
        let key = key.as_str();
        self.retry
            .run("put_public_key", move || keys.put_public_key(instance_id, key))
            .await
    }

    /// Ask the primary to add the local instance to the cluster
    ///
    /// Leaves the local device standalone first so the primary can add it
    /// cleanly.
    pub async fn request_join(&self, local: &Instance, primary_id: &str) -> Result<(), Error> {
        let messaging = self.providers.messaging()?;
        let hostname = local
            .hostname
            .clone()
            .ok_or_else(|| Error::validation_for_field("hostname", "local hostname unknown"))?;
        let device = self.device.as_ref();
        let group = self.device_group.as_str();

        self.retry
            .run("reset_trust", move || device.reset_trust())
            .await?;
        self.retry
            .run("delete_device_group", move || device.delete_device_group(group))
            .await?;
        let address = self
            .retry
            .run("management_address", move || device.management_address())
            .await?;

        let credentials = random_credentials();
        let (username, password) = (credentials.username.as_str(), credentials.password.as_str());
        self.retry
            .run("create_admin_user", move || {
                device.create_admin_user(username, password)
            })
            .await?;

        let request = JoinRequest {
            host: address.host,
            port: address.port,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            hostname,
            device_group: self.device_group.clone(),
        };
        let data = self.seal(primary_id, &serde_json::to_string(&request)?).await?;

        let message = Message::new(MessageAction::AddToCluster, primary_id, &local.id, data);
        let message = &message;
        self.retry
            .run("send_message", move || messaging.send_message(message))
            .await?;

        info!(primary_id = %primary_id, "Sent join request");
        Ok(())
    }

    /// Process pending messages addressed to the local instance
    ///
    /// A primary that is not sync-blocked handles `ADD_TO_CLUSTER`; members
    /// handle `SYNC_COMPLETE`. Every sender added to the cluster gets a
    /// `SYNC_COMPLETE` back.
    pub async fn drain(
        &self,
        local: &Instance,
        local_is_primary: bool,
        block_sync: bool,
    ) -> Result<DrainReport, Error> {
        let mut actions = Vec::new();
        if local_is_primary && !block_sync {
            actions.push(MessageAction::AddToCluster);
        }
        if !local_is_primary {
            actions.push(MessageAction::SyncComplete);
        }
        if actions.is_empty() {
            debug!("No message actions to process");
            return Ok(DrainReport::default());
        }

        let messaging = self.providers.messaging()?;
        let local_id = local.id.as_str();
        let wanted = actions.as_slice();
        let messages = self
            .retry
            .run("get_messages", move || messaging.get_messages(wanted, local_id))
            .await?;
        debug!(count = messages.len(), "Fetched messages");

        let mut report = DrainReport::default();
        let mut seen = HashSet::new();

        for message in &messages {
            if !actions.contains(&message.action) {
                continue;
            }
            let handled = match message.action {
                MessageAction::AddToCluster => {
                    if !seen.insert(message.from_instance_id.clone()) {
                        debug!(from = %message.from_instance_id, "Discarding duplicate join request");
                        report.duplicates += 1;
                        true
                    } else {
                        self.add_member(message, &mut report).await
                    }
                }
                MessageAction::SyncComplete => self.forward_sync_complete(message, &mut report).await,
            };

            if handled {
                self.complete(message).await;
            }
        }

        for sender in &report.joined {
            if let Err(e) = self.send_sync_complete(local_id, sender).await {
                warn!(to = %sender, error = %e, "Failed to send sync complete");
            }
        }

        Ok(report)
    }

    /// Returns whether the message is finished with and may be acknowledged
    async fn add_member(&self, message: &Message, report: &mut DrainReport) -> bool {
        let request: JoinRequest = match self.open_payload(message).await {
            Ok(request) => request,
            Err(e) => {
                warn!(from = %message.from_instance_id, error = %e, "Dropping unreadable join request");
                return true;
            }
        };

        let device = self.device.as_ref();
        let request = &request;
        match self
            .retry
            .run("add_to_cluster", move || device.add_to_cluster(request))
            .await
        {
            Ok(()) => {
                info!(from = %message.from_instance_id, hostname = %request.hostname, "Added member to cluster");
                report.joined.push(message.from_instance_id.clone());
                true
            }
            Err(e) => {
                warn!(from = %message.from_instance_id, error = %e, "Failed to add member");
                report.failed.push(message.from_instance_id.clone());
                false
            }
        }
    }

    async fn forward_sync_complete(&self, message: &Message, report: &mut DrainReport) -> bool {
        let payload: SyncCompletePayload = match self.open_payload(message).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(from = %message.from_instance_id, error = %e, "Dropping unreadable sync complete");
                return true;
            }
        };

        let Ok(messaging) = self.providers.messaging() else {
            return false;
        };
        let (user, password) = (payload.from_user.as_str(), payload.from_password.as_str());
        match self
            .retry
            .run("sync_complete", move || messaging.sync_complete(user, password))
            .await
        {
            Ok(()) => {
                report.synced += 1;
                true
            }
            Err(e) => {
                warn!(from = %message.from_instance_id, error = %e, "Sync complete hook failed");
                false
            }
        }
    }

    async fn send_sync_complete(&self, local_id: &str, to: &str) -> Result<(), Error> {
        let credentials = self.device.credentials();
        let payload = SyncCompletePayload {
            from_user: credentials.username,
            from_password: credentials.password,
        };
        let data = self.seal(to, &serde_json::to_string(&payload)?).await?;
        let message = Message::new(MessageAction::SyncComplete, to, local_id, data);

        let messaging = self.providers.messaging()?;
        let message = &message;
        self.retry
            .run("send_message", move || messaging.send_message(message))
            .await
    }

    async fn complete(&self, message: &Message) {
        let Some(handle) = message.completion_handle.as_deref() else {
            return;
        };
        let Ok(messaging) = self.providers.messaging() else {
            return;
        };
        if let Err(e) = self
            .retry
            .run("complete_message", move || messaging.complete_message(handle))
            .await
        {
            warn!(error = %e, "Failed to acknowledge message");
        }
    }

    /// Encrypt for `recipient` when the provider encrypts payloads
    async fn seal(&self, recipient: &str, plaintext: &str) -> Result<String, Error> {
        if !self.encrypting() {
            return Ok(plaintext.to_string());
        }
        let keys = self.providers.keys()?;
        let public_key = self
            .retry
            .run("get_public_key", move || keys.get_public_key(recipient))
            .await?;
        self.cipher()?.encrypt(&public_key, plaintext).await
    }

    async fn open_payload<T: serde::de::DeserializeOwned>(&self, message: &Message) -> Result<T, Error> {
        let plaintext = if self.encrypting() {
            let cipher = self.cipher()?;
            let key = self
                .private_key
                .get_or_try_init(|| cipher.load_private_key())
                .await?;
            cipher.decrypt(key, &message.data).await?
        } else {
            message.data.clone()
        };
        Ok(serde_json::from_str(&plaintext)?)
    }
}
