//! Primary validation and election

use tracing::{info, warn};

use bigip_autoscale_common::instance::has_external;
use bigip_autoscale_common::{Error, Instance, Instances, PrimaryHealth};

use super::{persist_local, PassContext};
use crate::controller::Context;

/// The instance flagged primary in the snapshot
///
/// Two instances can both claim the role between independent passes; the
/// first by ID wins here and the next pass sorts out the other.
pub fn find_primary(instances: &Instances) -> Option<&Instance> {
    let mut primaries = instances.values().filter(|i| i.is_primary);
    let primary = primaries.next()?;
    let others: Vec<&str> = primaries.map(|i| i.id.as_str()).collect();
    if !others.is_empty() {
        warn!(
            primary_id = %primary.id,
            others = ?others,
            "Multiple instances claim primary"
        );
    }
    Some(primary)
}

/// Whether `primary` is acceptable given the external instances in the snapshot
///
/// When any instance is external, the primary must be external too.
pub fn external_consistency_check(primary: &Instance, instances: &Instances) -> bool {
    !has_external(instances) || primary.external
}

/// Health of a primary, first failing check wins
pub fn primary_health(primary: &Instance, instances: &Instances) -> PrimaryHealth {
    if !primary.version_ok {
        PrimaryHealth::VersionNotUpToDate
    } else if !external_consistency_check(primary, instances) {
        PrimaryHealth::NotExternal
    } else if !primary.provider_visible {
        PrimaryHealth::NotInCloudList
    } else {
        PrimaryHealth::Ok
    }
}

/// Validate the current primary and elect a new one when needed
///
/// Records the local belief about the primary, asks the provider whether the
/// primary is still valid, and elects when there is no primary, the provider
/// rejected it, or it has been unhealthy past the expiry window.
pub async fn handle_primary(ctx: &Context, pass: &mut PassContext) -> Result<(), Error> {
    let current = find_primary(&pass.instances).cloned();
    let previous_primary = pass.local.primary_status.instance_id.clone();

    match &current {
        Some(primary) => {
            pass.primary_health = primary_health(primary, &pass.instances);
            pass.primary_id = Some(primary.id.clone());
        }
        None => pass.primary_health = PrimaryHealth::Unknown,
    }
    pass.local.primary_status.record(
        pass.primary_id.as_deref(),
        pass.primary_health,
        pass.now,
    );
    pass.primary_expired = pass.local.primary_status.is_expired(pass.now);
    persist_local(ctx, pass).await?;

    if let Some(primary_id) = pass.primary_id.clone() {
        let directory = ctx.providers.directory.as_ref();
        let instances = &pass.instances;
        let id = primary_id.as_str();
        let valid = ctx
            .retry
            .run("is_valid_primary", move || {
                directory.is_valid_primary(id, instances)
            })
            .await?;

        if !valid {
            warn!(primary_id = %primary_id, "Provider rejected primary");
            pass.primary_invalid = true;
            ctx.retry
                .run("primary_invalidated", move || directory.primary_invalidated(id))
                .await?;
        }
    }

    let visible_or_gone = pass.primary().map_or(true, |p| p.provider_visible);
    let needs_election = pass.primary_id.is_none()
        || pass.primary_invalid
        || (pass.primary_expired && visible_or_gone);

    if needs_election {
        info!(
            current_primary = ?pass.primary_id,
            invalid = pass.primary_invalid,
            expired = pass.primary_expired,
            "Electing primary"
        );
        let elected = elect(ctx, pass).await?;
        pass.primary_health = pass
            .instances
            .get(&elected)
            .map(|p| primary_health(p, &pass.instances))
            .unwrap_or_default();
        pass.primary_id = Some(elected);
        pass.primary_invalid = false;
        pass.primary_expired = false;
    }

    pass.new_primary = pass.primary_id != previous_primary;
    pass.local.is_primary = pass.local_is_primary();

    if pass.new_primary || needs_election {
        info!(
            primary_id = ?pass.primary_id,
            new_primary = pass.new_primary,
            local_is_primary = pass.local.is_primary,
            "Primary determined"
        );
        pass.local.primary_status.record(
            pass.primary_id.as_deref(),
            pass.primary_health,
            pass.now,
        );
    }
    persist_local(ctx, pass).await
}

async fn elect(ctx: &Context, pass: &PassContext) -> Result<String, Error> {
    let directory = ctx.providers.directory.as_ref();
    let instances = &pass.instances;
    let elected = ctx
        .retry
        .run("elect_primary", move || directory.elect_primary(instances))
        .await?;

    if !pass.instances.contains_key(&elected) {
        return Err(Error::validation(format!(
            "elected primary {elected} is not in the instance list"
        )));
    }
    Ok(elected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use crate::controller::ClusterAction;
    use crate::device::MockDeviceClient;
    use crate::provider::{Features, MockInstanceDirectory};

    fn snapshot(entries: Vec<Instance>) -> Instances {
        entries.into_iter().map(|i| (i.id.clone(), i)).collect()
    }

    fn pass_for(local_id: &str, instances: Instances) -> PassContext {
        let local = instances[local_id].clone();
        PassContext::new(ClusterAction::Update, Utc::now(), instances, local)
    }

    fn directory(valid: bool, elected: Option<&'static str>) -> MockInstanceDirectory {
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_put_instance().returning(|_, _| Ok(()));
        directory
            .expect_is_valid_primary()
            .returning(move |_, _| Ok(valid));
        directory.expect_primary_invalidated().returning(|_| Ok(()));
        match elected {
            Some(id) => {
                directory
                    .expect_elect_primary()
                    .times(1)
                    .returning(move |_| Ok(id.to_string()));
            }
            None => {
                directory.expect_elect_primary().never();
            }
        }
        directory
    }

    fn ctx_with(directory: MockInstanceDirectory) -> Context {
        Context::for_testing("i-2", Arc::new(directory), Arc::new(MockDeviceClient::new()))
    }

    #[test]
    fn test_external_primary_required_when_externals_exist() {
        let instances = snapshot(vec![
            Instance::new("i-1").with_primary(true),
            Instance::new("i-2").with_external(true),
        ]);
        let primary = &instances["i-1"];
        assert!(!external_consistency_check(primary, &instances));
        assert_eq!(primary_health(primary, &instances), PrimaryHealth::NotExternal);
    }

    #[test]
    fn test_any_primary_accepted_without_externals() {
        let instances = snapshot(vec![Instance::new("i-1").with_primary(true), Instance::new("i-2")]);
        assert!(external_consistency_check(&instances["i-1"], &instances));
        assert_eq!(primary_health(&instances["i-1"], &instances), PrimaryHealth::Ok);
    }

    #[test]
    fn test_health_precedence() {
        let mut stale = Instance::new("i-1")
            .with_primary(true)
            .with_provider_visible(false);
        stale.version_ok = false;
        let instances = snapshot(vec![stale.clone(), Instance::new("i-2").with_external(true)]);
        assert_eq!(
            primary_health(&instances["i-1"], &instances),
            PrimaryHealth::VersionNotUpToDate
        );

        stale.version_ok = true;
        let instances = snapshot(vec![stale, Instance::new("i-2")]);
        assert_eq!(
            primary_health(&instances["i-1"], &instances),
            PrimaryHealth::NotInCloudList
        );
    }

    #[test]
    fn test_first_primary_wins_when_several_claim() {
        let instances = snapshot(vec![
            Instance::new("i-b").with_primary(true),
            Instance::new("i-a").with_primary(true),
        ]);
        assert_eq!(find_primary(&instances).map(|p| p.id.as_str()), Some("i-a"));
        assert!(find_primary(&snapshot(vec![Instance::new("i-1")])).is_none());
    }

    #[tokio::test]
    async fn test_valid_primary_skips_election() {
        let instances = snapshot(vec![
            Instance::new("i-1").with_primary(true),
            Instance::new("i-2"),
        ]);
        let ctx = ctx_with(directory(true, None));
        let mut pass = pass_for("i-2", instances);

        handle_primary(&ctx, &mut pass).await.unwrap();

        assert_eq!(pass.primary_id.as_deref(), Some("i-1"));
        assert!(pass.new_primary);
        assert!(!pass.local.is_primary);
        assert_eq!(pass.local.primary_status.status, PrimaryHealth::Ok);
    }

    #[tokio::test]
    async fn test_rejected_primary_is_invalidated_and_replaced() {
        let instances = snapshot(vec![
            Instance::new("i-1").with_primary(true),
            Instance::new("i-2"),
        ]);
        let mut directory = MockInstanceDirectory::new();
        directory.expect_features().returning(Features::none);
        directory.expect_put_instance().returning(|_, _| Ok(()));
        directory
            .expect_is_valid_primary()
            .returning(|_, _| Ok(false));
        directory
            .expect_primary_invalidated()
            .withf(|id| id == "i-1")
            .times(1)
            .returning(|_| Ok(()));
        directory
            .expect_elect_primary()
            .times(1)
            .returning(|_| Ok("i-2".to_string()));

        let ctx = ctx_with(directory);
        let mut pass = pass_for("i-2", instances);
        handle_primary(&ctx, &mut pass).await.unwrap();

        assert_eq!(pass.primary_id.as_deref(), Some("i-2"));
        assert!(pass.local.is_primary);
        assert!(pass.new_primary);
    }

    #[tokio::test]
    async fn test_expired_primary_triggers_election() {
        let mut local = Instance::new("i-2");
        let past = Utc::now() - Duration::minutes(4);
        local
            .primary_status
            .record(Some("i-1"), PrimaryHealth::VersionNotUpToDate, past);
        let mut primary = Instance::new("i-1").with_primary(true);
        primary.version_ok = false;
        let instances = snapshot(vec![primary, local]);

        let ctx = ctx_with(directory(true, Some("i-2")));
        let mut pass = pass_for("i-2", instances);
        handle_primary(&ctx, &mut pass).await.unwrap();

        assert_eq!(pass.primary_id.as_deref(), Some("i-2"));
        assert!(pass.local.is_primary);
    }

    #[tokio::test]
    async fn test_unhealthy_primary_within_window_is_kept() {
        let mut local = Instance::new("i-2");
        let recent = Utc::now() - Duration::minutes(2);
        local
            .primary_status
            .record(Some("i-1"), PrimaryHealth::NotInCloudList, recent);
        let primary = Instance::new("i-1")
            .with_primary(true)
            .with_provider_visible(false);
        let instances = snapshot(vec![primary, local]);

        let ctx = ctx_with(directory(true, None));
        let mut pass = pass_for("i-2", instances);
        handle_primary(&ctx, &mut pass).await.unwrap();

        assert_eq!(pass.primary_id.as_deref(), Some("i-1"));
        assert_eq!(pass.primary_health, PrimaryHealth::NotInCloudList);
        assert!(!pass.primary_expired);
        assert!(!pass.new_primary);
        assert!(pass.primary_bad());
    }

    #[tokio::test]
    async fn test_election_result_must_be_in_snapshot() {
        let instances = snapshot(vec![Instance::new("i-1"), Instance::new("i-2")]);
        let ctx = ctx_with(directory(true, Some("i-9")));
        let mut pass = pass_for("i-2", instances);

        let err = handle_primary(&ctx, &mut pass).await.unwrap_err();
        assert!(err.to_string().contains("i-9"));
    }
}
