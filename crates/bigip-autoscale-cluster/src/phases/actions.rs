//! Cluster action dispatch: join, update, unblock-sync, backup-ucs

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Duration;
use tracing::{debug, info, warn};

use bigip_autoscale_common::{Error, InstanceStatus, JOIN_DEBOUNCE_SECS};

use super::{persist_local, PassContext};
use crate::controller::{ClusterAction, Context};
use crate::device::ClusterJoin;
use crate::provider::Feature;

/// Run the requested cluster action
///
/// Only called once the local instance is OK. Tells the provider which
/// instance is primary before dispatching.
pub async fn handle_action(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    if let Some(primary_id) = pass.primary_id.as_deref() {
        let directory = ctx.providers.directory.as_ref();
        let instances = &pass.instances;
        ctx.retry
            .run("primary_elected", move || directory.primary_elected(primary_id))
            .await?;
        ctx.retry
            .run("tag_primary_instance", move || {
                directory.tag_primary_instance(primary_id, instances)
            })
            .await?;
    }

    match pass.action {
        ClusterAction::Join => handle_join(ctx, pass).await,
        ClusterAction::Update => handle_update(ctx, pass).await,
        ClusterAction::UnblockSync => set_config_sync_ip(ctx, pass).await,
        ClusterAction::BackupUcs => handle_backup(ctx, pass).await,
    }
}

async fn handle_join(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    if pass.local_is_primary() {
        info!("Setting up cluster as primary");
        set_config_sync_ip(ctx, pass).await?;

        let hostname = pass
            .local
            .hostname
            .clone()
            .ok_or_else(|| Error::validation_for_field("hostname", "local hostname unknown"))?;
        let hostnames = vec![hostname];
        let device = ctx.device.as_ref();
        let group = ctx.config.device_group.as_str();
        let members = hostnames.as_slice();
        ctx.retry
            .run("create_device_group", move || {
                device.create_device_group(group, members)
            })
            .await?;

        if !ctx.providers.has_feature(Feature::Messaging) {
            let directory = ctx.providers.directory.as_ref();
            ctx.retry
                .run("put_primary_credentials", move || {
                    directory.put_primary_credentials()
                })
                .await?;
        }
        write_primary_marker(&ctx.config.primary_marker_path).await
    } else {
        remove_primary_marker(&ctx.config.primary_marker_path).await?;
        set_config_sync_ip(ctx, pass).await?;
        if pass.primary_id.is_some() {
            join_primary(ctx, pass).await?;
        }
        Ok(())
    }
}

async fn handle_update(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    if pass.local_is_primary() {
        if !pass.new_primary && !pass.primary_bad() {
            prune_disconnected(ctx, pass).await?;
        }
        Ok(())
    } else {
        remove_primary_marker(&ctx.config.primary_marker_path).await?;
        if pass.new_primary || pass.primary_invalid {
            join_primary(ctx, pass).await?;
        }
        Ok(())
    }
}

async fn handle_backup(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    if !pass.local_is_primary() || pass.local.status != InstanceStatus::Ok {
        debug!("Not primary, skipping backup");
        return Ok(());
    }

    let name = ctx.backup.capture(&pass.local).await?;
    info!(name = %name, "Backup captured");
    pass.local.last_backup = pass.now;
    persist_local(ctx, pass).await
}

/// Join the local instance to the primary's cluster
///
/// Debounced on `last_join_request`: a second request within the window is
/// skipped. Uses the mailbox when the provider has a messaging transport and
/// a direct device join otherwise.
pub async fn join_primary(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    let Some(primary_id) = pass.primary_id.clone() else {
        return Ok(());
    };

    if let Some(last) = pass.local.last_join_request {
        let elapsed = pass.now - last;
        if elapsed < Duration::seconds(JOIN_DEBOUNCE_SECS) {
            info!(
                primary_id = %primary_id,
                elapsed_secs = elapsed.num_seconds(),
                "Join requested recently, skipping"
            );
            return Ok(());
        }
    }

    if ctx.providers.has_feature(Feature::Messaging) {
        info!(primary_id = %primary_id, "Requesting to join through mailbox");
        ctx.mailbox.request_join(&pass.local, &primary_id).await?;
    } else {
        info!(primary_id = %primary_id, "Joining primary directly");
        join_directly(ctx, pass, &primary_id).await?;
    }

    pass.local.last_join_request = Some(pass.now);
    persist_local(ctx, pass).await
}

async fn join_directly(ctx: &Context, pass: &PassContext, primary_id: &str) -> Result<(), Error> {
    let primary = pass
        .instances
        .get(primary_id)
        .ok_or_else(|| Error::validation(format!("primary {primary_id} not in instance list")))?;
    let host = primary
        .mgmt_ip
        .clone()
        .or_else(|| primary.private_ip.clone())
        .ok_or_else(|| Error::validation_for_field("mgmtIp", "primary has no management address"))?;
    let port = primary.mgmt_port.unwrap_or(ctx.config.mgmt_port);

    let directory = ctx.providers.directory.as_ref();
    let remote = host.as_str();
    let credentials = ctx
        .retry
        .run("get_primary_credentials", move || {
            directory.get_primary_credentials(remote, port)
        })
        .await?;

    let join = ClusterJoin {
        device_group: ctx.config.device_group.clone(),
        remote_host: host.clone(),
        remote_port: port,
        remote_credentials: credentials,
    };
    let device = ctx.device.as_ref();
    let join = &join;
    ctx.retry
        .run("join_cluster", move || device.join_cluster(join))
        .await
}

/// Remove peers the device cannot reach that are gone from the directory
async fn prune_disconnected(ctx: &Context, pass: &PassContext) -> Result<(), Error> {
    let device = ctx.device.as_ref();
    let status = ctx
        .retry
        .run("sync_status", move || device.sync_status())
        .await?;

    let known: BTreeSet<&str> = pass
        .instances
        .values()
        .filter_map(|i| i.hostname.as_deref())
        .collect();
    let gone: Vec<String> = status
        .disconnected
        .into_iter()
        .filter(|hostname| !known.contains(hostname.as_str()))
        .collect();

    if gone.is_empty() {
        debug!("No disconnected devices to remove");
        return Ok(());
    }

    info!(hostnames = ?gone, "Removing disconnected devices from cluster");
    let group = ctx.config.device_group.as_str();
    let hostnames = gone.as_slice();
    ctx.retry
        .run("remove_from_cluster", move || {
            device.remove_from_cluster(hostnames, group)
        })
        .await
}

async fn set_config_sync_ip(ctx: &Context, pass: &PassContext) -> Result<(), Error> {
    let ip = pass
        .local
        .private_ip
        .as_deref()
        .ok_or_else(|| Error::validation_for_field("privateIp", "no address for config sync"))?;
    let device = ctx.device.as_ref();
    ctx.retry
        .run("set_config_sync_ip", move || device.set_config_sync_ip(ip))
        .await
}

/// Process pending mailbox messages when the provider has a transport
pub async fn handle_mailbox(ctx: &Context, pass: &PassContext) -> Result<(), Error> {
    if !ctx.providers.has_feature(Feature::Messaging) {
        return Ok(());
    }
    let report = ctx
        .mailbox
        .drain(&pass.local, pass.local_is_primary(), ctx.config.block_sync)
        .await?;
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Some join requests failed");
    }
    Ok(())
}

/// Mark this instance as primary on local disk
pub(crate) async fn write_primary_marker(path: &Path) -> Result<(), Error> {
    tokio::fs::write(path, b"")
        .await
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

/// Clear a stale primary marker; absent is fine
pub(crate) async fn remove_primary_marker(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removed stale primary marker");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("removing {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use bigip_autoscale_common::{AutoscaleConfig, Credentials, Instance, Instances, RetryPolicy};
    use chrono::Utc;

    use crate::device::{MockDeviceClient, SyncStatus};
    use crate::provider::{Features, MockInstanceDirectory, MockMessaging};

    fn member(id: &str, hostname: &str) -> Instance {
        Instance::new(id)
            .with_hostname(hostname)
            .with_private_ip(format!("10.0.0.{}", &id[2..]))
            .with_mgmt_ip(format!("10.0.1.{}", &id[2..]))
    }

    fn pass(local_id: &str, primary_id: &str, action: ClusterAction, members: Vec<Instance>) -> PassContext {
        let instances: Instances = members.into_iter().map(|i| (i.id.clone(), i)).collect();
        let local = instances[local_id].clone();
        let mut pass = PassContext::new(action, Utc::now(), instances, local);
        pass.primary_id = Some(primary_id.to_string());
        pass.primary_health = bigip_autoscale_common::PrimaryHealth::Ok;
        pass.local.is_primary = local_id == primary_id;
        pass
    }

    fn context(
        local_id: &str,
        directory: MockInstanceDirectory,
        device: MockDeviceClient,
        messaging: Option<MockMessaging>,
        dir: &tempfile::TempDir,
    ) -> Context {
        let mut config = AutoscaleConfig::default();
        config.primary_marker_path = dir.path().join("primary");
        config.backup.working_dir = dir.path().join("work");
        let mut builder = Context::builder(local_id, Arc::new(directory), Arc::new(device))
            .config(config)
            .retry_policy(RetryPolicy::no_retry());
        if let Some(messaging) = messaging {
            builder = builder.messaging(Arc::new(messaging));
        }
        builder.build()
    }

    /// Story: The primary sets up the device group, publishes its
    /// credentials when there is no mailbox, and marks itself primary
    #[tokio::test]
    async fn story_primary_join_sets_up_cluster() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().times(1).returning(|_| Ok(()));
        directory.expect_tag_primary_instance().times(1).returning(|_, _| Ok(()));
        directory.expect_put_primary_credentials().times(1).returning(|| Ok(()));

        let mut device = MockDeviceClient::new();
        device
            .expect_set_config_sync_ip()
            .withf(|ip| ip == "10.0.0.1")
            .times(1)
            .returning(|_| Ok(()));
        device
            .expect_create_device_group()
            .withf(|group, hostnames| group == "failoverGroup" && hostnames == ["bigip1".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context("i-1", directory, device, None, &dir);
        let mut pass = pass("i-1", "i-1", ClusterAction::Join, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();
        assert!(dir.path().join("primary").exists());
    }

    /// Story: A member without a mailbox fetches the primary's credentials and joins directly
    #[tokio::test]
    async fn story_member_joins_directly_without_messaging() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("primary"), b"").unwrap();

        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        directory
            .expect_get_primary_credentials()
            .withf(|host, port| host == "10.0.1.1" && *port == 443)
            .times(1)
            .returning(|_, _| Ok(Credentials::new("admin", "primary-pass")));
        directory.expect_put_instance().times(1).returning(|_, _| Ok(()));

        let mut device = MockDeviceClient::new();
        device.expect_set_config_sync_ip().returning(|_| Ok(()));
        device
            .expect_join_cluster()
            .withf(|join| {
                join.remote_host == "10.0.1.1"
                    && join.device_group == "failoverGroup"
                    && join.remote_credentials.password == "primary-pass"
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Join, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();

        assert!(!dir.path().join("primary").exists(), "stale marker removed");
        assert_eq!(pass.local.last_join_request, Some(pass.now));
    }

    /// Story: Two join attempts within five minutes produce one set of
    /// trust reset, credential and send calls
    #[tokio::test]
    async fn story_join_is_debounced() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory
            .expect_features()
            .returning(|| Features::none().with(Feature::Messaging));
        directory.expect_put_instance().times(1).returning(|_, _| Ok(()));

        let mut device = MockDeviceClient::new();
        device.expect_reset_trust().times(1).returning(|| Ok(()));
        device.expect_delete_device_group().times(1).returning(|_| Ok(()));
        device.expect_management_address().times(1).returning(|| {
            Ok(crate::device::ManagementAddress {
                host: "10.0.1.2".to_string(),
                port: 443,
            })
        });
        device.expect_create_admin_user().times(1).returning(|_, _| Ok(()));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut messaging = MockMessaging::new();
        let sink = sent.clone();
        messaging.expect_send_message().times(1).returning(move |message| {
            sink.lock().unwrap().push(message.clone());
            Ok(())
        });

        let ctx = context("i-2", directory, device, Some(messaging), &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Join, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        join_primary(&ctx, &mut pass).await.unwrap();
        join_primary(&ctx, &mut pass).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_instance_id, "i-1");
        assert_eq!(sent[0].from_instance_id, "i-2");
    }

    #[tokio::test]
    async fn test_join_allowed_after_debounce_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory
            .expect_get_primary_credentials()
            .times(1)
            .returning(|_, _| Ok(Credentials::new("admin", "p")));
        directory.expect_put_instance().returning(|_, _| Ok(()));
        let mut device = MockDeviceClient::new();
        device.expect_join_cluster().times(1).returning(|_| Ok(()));

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);
        pass.local.last_join_request = Some(pass.now - Duration::minutes(6));

        join_primary(&ctx, &mut pass).await.unwrap();
        assert_eq!(pass.local.last_join_request, Some(pass.now));
    }

    /// Story: On update, the primary removes unreachable peers that are no
    /// longer in the directory and keeps the ones that are
    #[tokio::test]
    async fn story_primary_prunes_departed_devices() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));

        let mut device = MockDeviceClient::new();
        device.expect_sync_status().returning(|| {
            Ok(SyncStatus {
                connected: vec!["bigip1".to_string()],
                disconnected: vec!["bigip2".to_string(), "bigip-gone".to_string()],
            })
        });
        device
            .expect_remove_from_cluster()
            .withf(|hostnames, group| hostnames == ["bigip-gone".to_string()] && group == "failoverGroup")
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context("i-1", directory, device, None, &dir);
        let mut pass = pass("i-1", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_primary_skips_pruning() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        let mut device = MockDeviceClient::new();
        device.expect_sync_status().never();

        let ctx = context("i-1", directory, device, None, &dir);
        let mut pass = pass("i-1", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1")]);
        pass.new_primary = true;

        handle_action(&ctx, &mut pass).await.unwrap();
    }

    #[tokio::test]
    async fn test_member_update_rejoins_only_when_primary_changed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        directory.expect_get_primary_credentials().never();
        let device = MockDeviceClient::new();

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();
    }

    #[tokio::test]
    async fn test_member_update_ignores_unhealthy_primary() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        directory.expect_get_primary_credentials().never();
        let mut device = MockDeviceClient::new();
        device.expect_join_cluster().never();

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);
        pass.primary_health = bigip_autoscale_common::PrimaryHealth::NotInCloudList;

        handle_action(&ctx, &mut pass).await.unwrap();
        assert_eq!(pass.local.last_join_request, None);
    }

    #[tokio::test]
    async fn test_member_update_rejoins_invalidated_primary() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        directory
            .expect_get_primary_credentials()
            .times(1)
            .returning(|_, _| Ok(Credentials::new("admin", "p")));
        directory.expect_put_instance().times(1).returning(|_, _| Ok(()));
        let mut device = MockDeviceClient::new();
        device.expect_join_cluster().times(1).returning(|_| Ok(()));

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::Update, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);
        pass.primary_invalid = true;

        handle_action(&ctx, &mut pass).await.unwrap();
        assert_eq!(pass.local.last_join_request, Some(pass.now));
    }

    #[tokio::test]
    async fn test_backup_skipped_on_member() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        let mut device = MockDeviceClient::new();
        device.expect_save_ucs().never();

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::BackupUcs, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();
    }

    #[tokio::test]
    async fn test_unblock_sync_only_sets_sync_address() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_primary_elected().returning(|_| Ok(()));
        directory.expect_tag_primary_instance().returning(|_, _| Ok(()));
        let mut device = MockDeviceClient::new();
        device
            .expect_set_config_sync_ip()
            .withf(|ip| ip == "10.0.0.2")
            .times(1)
            .returning(|_| Ok(()));

        let ctx = context("i-2", directory, device, None, &dir);
        let mut pass = pass("i-2", "i-1", ClusterAction::UnblockSync, vec![member("i-1", "bigip1"), member("i-2", "bigip2")]);

        handle_action(&ctx, &mut pass).await.unwrap();
    }
}
