//! Mailbox message envelope and payloads.
//!
//! Messages travel through the provider's messaging transport when instances
//! cannot reach each other's management plane. `data` holds either the JSON
//! payload itself or, when the provider supports encryption, that JSON
//! encrypted for the recipient.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a message asks the recipient to do
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageAction {
    /// Sender wants the primary to add it to the cluster
    AddToCluster,
    /// Primary finished syncing the sender; carries the primary's credentials
    SyncComplete,
}

impl fmt::Display for MessageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddToCluster => write!(f, "ADD_TO_CLUSTER"),
            Self::SyncComplete => write!(f, "SYNC_COMPLETE"),
        }
    }
}

/// Message envelope honored by every messaging provider
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Requested action
    pub action: MessageAction,
    /// Recipient instance ID
    pub to_instance_id: String,
    /// Sender instance ID
    pub from_instance_id: String,
    /// Plaintext or ciphertext payload
    pub data: String,
    /// Opaque provider handle used to acknowledge the message once processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_handle: Option<String>,
}

impl Message {
    /// Create a message with no completion handle
    pub fn new(
        action: MessageAction,
        to_instance_id: impl Into<String>,
        from_instance_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            action,
            to_instance_id: to_instance_id.into(),
            from_instance_id: from_instance_id.into(),
            data: data.into(),
            completion_handle: None,
        }
    }
}

/// Payload of an `ADD_TO_CLUSTER` message
///
/// Carries a temporary admin account the primary uses to reach the sender.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Sender's management address
    pub host: String,
    /// Sender's management port
    pub port: u16,
    /// Temporary admin user on the sender
    pub username: String,
    /// Temporary admin password on the sender
    pub password: String,
    /// Sender's device hostname
    pub hostname: String,
    /// Device group to join
    pub device_group: String,
}

/// Payload of a `SYNC_COMPLETE` message
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompletePayload {
    /// Primary's admin user
    pub from_user: String,
    /// Primary's current admin password
    pub from_password: String,
}

/// An admin account on a device
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Account name
    pub username: String,
    /// Account password
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}
