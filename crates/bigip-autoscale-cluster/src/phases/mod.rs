//! Phase handlers for a convergence pass.
//!
//! Each phase of a pass is handled by a dedicated module and works on the
//! same [`PassContext`], threaded through by reference.

mod actions;
mod becoming;
mod discovery;
mod dns;
mod primary;

pub use actions::{handle_action, handle_mailbox, join_primary};
pub use becoming::handle_becoming_primary;
pub use discovery::handle_discovery;
pub use dns::{dns_records, handle_dns};
pub use primary::{external_consistency_check, find_primary, handle_primary, primary_health};

use chrono::{DateTime, Utc};
use tracing::debug;

use bigip_autoscale_common::{Error, Instance, Instances, PrimaryHealth};

use crate::controller::{ClusterAction, Context};

/// State of one pass, owned by the pass driver
#[derive(Clone, Debug)]
pub struct PassContext {
    /// Requested action
    pub action: ClusterAction,
    /// Wall clock at the start of the pass
    pub now: DateTime<Utc>,
    /// Directory snapshot, with the local record kept current
    pub instances: Instances,
    /// The local instance's record
    pub local: Instance,
    /// Current or newly elected primary
    pub primary_id: Option<String>,
    /// Health of the primary as judged by this pass
    pub primary_health: PrimaryHealth,
    /// Primary has been unhealthy longer than the expiry window
    pub primary_expired: bool,
    /// Provider rejected the primary
    pub primary_invalid: bool,
    /// Primary differs from the one the local instance last recorded
    pub new_primary: bool,
}

impl PassContext {
    /// Start a pass from a snapshot and the local record
    pub fn new(
        action: ClusterAction,
        now: DateTime<Utc>,
        instances: Instances,
        local: Instance,
    ) -> Self {
        Self {
            action,
            now,
            instances,
            local,
            primary_id: None,
            primary_health: PrimaryHealth::Unknown,
            primary_expired: false,
            primary_invalid: false,
            new_primary: false,
        }
    }

    /// The primary's record, if the snapshot has one
    pub fn primary(&self) -> Option<&Instance> {
        self.primary_id
            .as_ref()
            .and_then(|id| self.instances.get(id))
    }

    /// Whether the local instance is the primary
    pub fn local_is_primary(&self) -> bool {
        self.primary_id.as_deref() == Some(self.local.id.as_str())
    }

    /// The primary was rejected or is unhealthy
    pub fn primary_bad(&self) -> bool {
        self.primary_invalid || self.primary_health != PrimaryHealth::Ok
    }
}

/// Write the local record back to the directory and the snapshot
pub async fn persist_local(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    pass.local.last_update = Some(pass.now);

    let directory = ctx.providers.directory.as_ref();
    let id = pass.local.id.as_str();
    let record = &pass.local;
    ctx.retry
        .run("put_instance", move || directory.put_instance(id, record))
        .await?;

    debug!(
        instance_id = %pass.local.id,
        status = %pass.local.status,
        is_primary = pass.local.is_primary,
        "Persisted local instance"
    );
    pass.instances
        .insert(pass.local.id.clone(), pass.local.clone());
    Ok(())
}
