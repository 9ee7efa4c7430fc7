//! Convergence control loop for BIG-IP autoscale clusters
//!
//! Each pass elects or validates a primary, moves a newly elected primary
//! through BECOMING_PRIMARY, and joins, prunes, syncs or backs up the local
//! device according to the requested action.
//!
//! Related crates:
//! - `bigip-autoscale-common`: instance records, messages, errors, retry, configuration

pub mod backup;
pub mod census;
pub mod controller;
pub mod crypto;
pub mod device;
pub mod mailbox;
pub mod phases;
pub mod provider;

// Re-export controller types
pub use controller::{converge, run_pass, ClusterAction, Context, ContextBuilder, PassOutcome};

pub use backup::BackupWorkflow;
pub use census::{CensusGuard, PassCensus};
pub use crypto::{PayloadCipher, PrivateKey};
pub use device::DeviceClient;
pub use mailbox::{DrainReport, MailboxProtocol};
pub use provider::{
    DnsProvider, DnsRecord, Feature, Features, InstanceDirectory, Messaging, Providers,
    PublicKeyStore, StoredUcs, UcsReconciler,
};

// Re-export common error types
pub use bigip_autoscale_common::{Error, Result};
