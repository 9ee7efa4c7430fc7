//! Snapshot loading and local identity refresh

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use bigip_autoscale_common::instance::mark_version_ok;
use bigip_autoscale_common::Error;

use super::PassContext;
use crate::controller::{ClusterAction, Context};

/// Load the directory snapshot and refresh the local record
///
/// Fails without retry when the directory is empty or does not contain the
/// local instance. The local record picks up the device's current identity
/// and `version_ok` is recomputed across the whole snapshot. Nothing is
/// written back here.
pub async fn handle_discovery(
    ctx: &Context,
    action: ClusterAction,
    now: DateTime<Utc>,
) -> Result<PassContext, Error> {
    let directory = ctx.providers.directory.as_ref();
    let mut instances = ctx
        .retry
        .run("get_instances", move || directory.get_instances())
        .await?;

    if instances.is_empty() {
        return Err(Error::validation("instance list is empty"));
    }

    let mut local = instances.get(&ctx.instance_id).cloned().ok_or_else(|| {
        Error::validation(format!(
            "local instance {} not in instance list",
            ctx.instance_id
        ))
    })?;

    let device = ctx.device.as_ref();
    let info = ctx
        .retry
        .run("device_info", move || device.device_info())
        .await?;
    local.hostname = Some(info.hostname);
    local.machine_id = Some(info.machine_id);
    local.mac_address = Some(info.mac_address);
    local.version = Some(info.version);
    instances.insert(local.id.clone(), local);

    mark_version_ok(&mut instances);
    let local = instances
        .get(&ctx.instance_id)
        .cloned()
        .ok_or_else(|| Error::internal_with_context("discovery", "local record vanished"))?;

    info!(
        instances = instances.len(),
        hostname = ?local.hostname,
        version_ok = local.version_ok,
        "Loaded instance snapshot"
    );
    debug!(instance_ids = ?instances.keys().collect::<Vec<_>>(), "Snapshot members");

    Ok(PassContext::new(action, now, instances, local))
}
