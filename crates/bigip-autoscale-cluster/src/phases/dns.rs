//! DNS record publication

use tracing::{debug, info};

use bigip_autoscale_common::config::{DnsConfig, DnsIpType};
use bigip_autoscale_common::{Error, Instances};

use super::PassContext;
use crate::controller::Context;
use crate::provider::DnsRecord;

/// One record per instance with a known hostname and an address of the configured type
///
/// Public records fall back to the private address when an instance has no
/// public one.
pub fn dns_records(instances: &Instances, config: &DnsConfig) -> Vec<DnsRecord> {
    instances
        .values()
        .filter_map(|instance| {
            let name = instance.hostname.clone()?;
            let ip = match config.ip_type {
                DnsIpType::Public => instance
                    .public_ip
                    .clone()
                    .or_else(|| instance.private_ip.clone()),
                DnsIpType::Private => instance.private_ip.clone(),
            }?;
            Some(DnsRecord {
                name,
                ip,
                port: config.app_port,
            })
        })
        .collect()
}

/// Publish the membership to the DNS provider, when one is configured
pub async fn handle_dns(ctx: &Context, pass: &PassContext) -> Result<(), Error> {
    let (Some(provider), Some(config)) = (ctx.providers.dns.as_deref(), ctx.config.dns.as_ref())
    else {
        debug!("No DNS provider configured");
        return Ok(());
    };

    let records = dns_records(&pass.instances, config);
    info!(records = records.len(), "Updating DNS");
    let records = records.as_slice();
    ctx.retry
        .run("dns_update", move || provider.update(records))
        .await
}
