//! BECOMING_PRIMARY transition for a newly elected local primary

use tracing::{error, info};

use bigip_autoscale_common::{Error, InstanceStatus, PrimaryHealth};

use super::actions::write_primary_marker;
use super::{persist_local, PassContext};
use crate::controller::Context;

/// Move a newly elected local primary through BECOMING_PRIMARY
///
/// The local record is persisted as BECOMING_PRIMARY with an UNKNOWN primary
/// belief, which holds off overlapping passes until the belief expires. Once
/// any stored backup is restored the instance returns to OK. A failed restore
/// leaves it BECOMING_PRIMARY for a later pass to retry.
pub async fn handle_becoming_primary(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    let resuming = pass.local.status == InstanceStatus::BecomingPrimary;

    if !pass.local_is_primary() {
        if resuming {
            info!("Lost primary role while becoming primary");
            pass.local.status = InstanceStatus::Ok;
            persist_local(ctx, pass).await?;
        }
        return Ok(());
    }

    if !pass.new_primary && !resuming {
        return Ok(());
    }

    info!(resuming, "Becoming primary");
    let local_id = pass.local.id.clone();
    pass.local.status = InstanceStatus::BecomingPrimary;
    pass.local
        .primary_status
        .record(Some(&local_id), PrimaryHealth::Unknown, pass.now);
    persist_local(ctx, pass).await?;

    match ctx.backup.restore_if_available(&pass.local).await {
        Ok(restored) => {
            info!(restored, "Became primary");
            pass.local.status = InstanceStatus::Ok;
            pass.local
                .primary_status
                .record(Some(&local_id), pass.primary_health, pass.now);
            persist_local(ctx, pass).await?;
            write_primary_marker(&ctx.config.primary_marker_path).await
        }
        Err(e) => {
            error!(error = %e, "Failed to become primary, next pass retries");
            Ok(())
        }
    }
}
