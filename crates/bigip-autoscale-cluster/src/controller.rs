//! Convergence pass driver
//!
//! One pass loads a fresh instance snapshot, validates or elects the primary,
//! advances the local instance's status and dispatches the requested cluster
//! action. Passes are idempotent and re-run periodically by the host; a pass
//! that fails leaves external state for the next one to pick up.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument};

use bigip_autoscale_common::{AutoscaleConfig, Error, InstanceStatus, RetryExecutor, RetryPolicy};

use crate::backup::BackupWorkflow;
use crate::census::PassCensus;
use crate::crypto::PayloadCipher;
use crate::device::DeviceClient;
use crate::mailbox::MailboxProtocol;
use crate::phases::{self, PassContext};
use crate::provider::{DnsProvider, InstanceDirectory, Messaging, Providers, PublicKeyStore, UcsReconciler};

/// Cluster action requested for a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterAction {
    /// Join the cluster, or set it up when primary
    Join,
    /// Re-validate membership after a scaling event
    Update,
    /// Set the config sync address so blocked peers can sync in
    UnblockSync,
    /// Capture a backup on the primary
    BackupUcs,
}

impl ClusterAction {
    /// Whether the action manages cluster membership (join or update)
    ///
    /// Only these actions drain the mailbox, update DNS and take part in the
    /// pass census.
    pub fn manages_membership(&self) -> bool {
        matches!(self, Self::Join | Self::Update)
    }
}

impl fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Update => write!(f, "update"),
            Self::UnblockSync => write!(f, "unblock-sync"),
            Self::BackupUcs => write!(f, "backup-ucs"),
        }
    }
}

impl FromStr for ClusterAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join" => Ok(Self::Join),
            "update" => Ok(Self::Update),
            "unblock-sync" => Ok(Self::UnblockSync),
            "backup-ucs" => Ok(Self::BackupUcs),
            other => Err(Error::validation_for_field(
                "clusterAction",
                format!("unknown cluster action: {other}"),
            )),
        }
    }
}

/// How a pass ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// The action was dispatched
    Completed {
        /// Primary at the end of the pass
        primary_id: Option<String>,
        /// Whether the local instance is that primary
        local_is_primary: bool,
    },
    /// Another pass is still becoming primary on this instance
    AlreadyBecomingPrimary,
    /// Restore did not finish; the next pass retries becoming primary
    BecomingPrimary,
    /// The pass failed; the error was logged
    Failed {
        /// Error message
        reason: String,
    },
}

/// Collaborators and configuration shared by every pass on one instance
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder("i-0abc", directory, device)
///     .config(config)
///     .messaging(messaging)
///     .build();
/// ```
pub struct Context {
    /// ID of the instance this process runs on
    pub instance_id: String,
    /// Autoscale configuration
    pub config: AutoscaleConfig,
    /// Cloud provider collaborators
    pub providers: Providers,
    /// Local device client
    pub device: Arc<dyn DeviceClient>,
    /// Executor wrapping every collaborator call
    pub retry: RetryExecutor,
    /// Mailbox protocol
    pub mailbox: MailboxProtocol,
    /// Backup capture and restore
    pub backup: BackupWorkflow,
    /// Guard against overlapping passes, when enabled
    pub census: Option<PassCensus>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        instance_id: impl Into<String>,
        directory: Arc<dyn InstanceDirectory>,
        device: Arc<dyn DeviceClient>,
    ) -> ContextBuilder {
        ContextBuilder::new(instance_id.into(), directory, device)
    }

    /// Create a context for testing with a single attempt per call
    #[cfg(test)]
    pub fn for_testing(
        instance_id: &str,
        directory: Arc<dyn InstanceDirectory>,
        device: Arc<dyn DeviceClient>,
    ) -> Self {
        Self::builder(instance_id, directory, device)
            .retry_policy(RetryPolicy::no_retry())
            .build()
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    instance_id: String,
    config: AutoscaleConfig,
    providers: Providers,
    device: Arc<dyn DeviceClient>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    retry_policy: Option<RetryPolicy>,
    census: bool,
}

impl ContextBuilder {
    fn new(
        instance_id: String,
        directory: Arc<dyn InstanceDirectory>,
        device: Arc<dyn DeviceClient>,
    ) -> Self {
        Self {
            instance_id,
            config: AutoscaleConfig::default(),
            providers: Providers::new(directory),
            device,
            cipher: None,
            retry_policy: None,
            census: false,
        }
    }

    /// Set the autoscale configuration
    pub fn config(mut self, config: AutoscaleConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a mailbox transport
    pub fn messaging(mut self, messaging: Arc<dyn Messaging>) -> Self {
        self.providers = self.providers.with_messaging(messaging);
        self
    }

    /// Attach public key storage
    pub fn keys(mut self, keys: Arc<dyn PublicKeyStore>) -> Self {
        self.providers = self.providers.with_keys(keys);
        self
    }

    /// Attach a DNS provider
    pub fn dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.providers = self.providers.with_dns(dns);
        self
    }

    /// Attach the backup reconciler used on restore
    pub fn reconciler(mut self, reconciler: Arc<dyn UcsReconciler>) -> Self {
        self.providers = self.providers.with_reconciler(reconciler);
        self
    }

    /// Attach the payload cipher used by the mailbox
    pub fn cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Override the retry policy from the configuration
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Register join/update passes in the configured run directory
    pub fn census(mut self) -> Self {
        self.census = true;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let policy = self
            .retry_policy
            .unwrap_or_else(|| self.config.retry.policy());
        let retry = RetryExecutor::new(policy);

        let mut mailbox = MailboxProtocol::new(
            self.providers.clone(),
            self.device.clone(),
            retry.clone(),
            self.config.device_group.clone(),
        );
        if let Some(cipher) = self.cipher {
            mailbox = mailbox.with_cipher(cipher);
        }
        let backup = BackupWorkflow::new(
            self.providers.clone(),
            self.device.clone(),
            retry.clone(),
            self.config.clone(),
        );
        let census = self.census.then(|| PassCensus::new(&self.config.census));

        Context {
            instance_id: self.instance_id,
            config: self.config,
            providers: self.providers,
            device: self.device,
            retry,
            mailbox,
            backup,
            census,
        }
    }
}

/// Run one convergence pass
///
/// Returns the first error that ends the pass. Use [`converge`] when the
/// caller only needs the outcome.
#[instrument(skip(ctx), fields(instance_id = %ctx.instance_id, action = %action))]
pub async fn run_pass(ctx: &Context, action: ClusterAction) -> Result<PassOutcome, Error> {
    let _registered = match &ctx.census {
        Some(census) => census.enter(action)?,
        None => None,
    };
    let mut pass = phases::handle_discovery(ctx, action, Utc::now()).await?;

    if pass.local.status == InstanceStatus::BecomingPrimary
        && !pass.local.primary_status.is_expired(pass.now)
    {
        info!("Currently becoming primary, ending pass");
        return Ok(PassOutcome::AlreadyBecomingPrimary);
    }

    phases::handle_primary(ctx, &mut pass).await?;
    phases::handle_becoming_primary(ctx, &mut pass).await?;

    if pass.local.status != InstanceStatus::Ok {
        info!(
            status = %pass.local.status,
            "Local instance not ready, skipping cluster action"
        );
        return Ok(PassOutcome::BecomingPrimary);
    }

    phases::handle_action(ctx, &mut pass).await?;

    if action.manages_membership() {
        phases::handle_mailbox(ctx, &pass).await?;
        phases::handle_dns(ctx, &pass).await?;
    }

    Ok(outcome(&pass))
}

/// Run one convergence pass, logging instead of returning errors
pub async fn converge(ctx: &Context, action: ClusterAction) -> PassOutcome {
    match run_pass(ctx, action).await {
        Ok(outcome) => {
            info!(instance_id = %ctx.instance_id, action = %action, outcome = ?outcome, "Pass finished");
            outcome
        }
        Err(e) => {
            error!(instance_id = %ctx.instance_id, action = %action, error = %e, "Pass failed");
            PassOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}

fn outcome(pass: &PassContext) -> PassOutcome {
    PassOutcome::Completed {
        primary_id: pass.primary_id.clone(),
        local_is_primary: pass.local_is_primary(),
    }
}
