//! Backup (UCS) capture, validation and restore
//!
//! The primary periodically saves a full configuration backup and uploads it
//! to provider storage. Every upload is downloaded again and its archive
//! structure checked; a corrupted copy is deleted rather than kept as the
//! latest backup. A newly elected primary restores the latest stored backup
//! before taking over.

use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use bigip_autoscale_common::instance::compare_versions;
use bigip_autoscale_common::{AutoscaleConfig, Error, Instance, RetryExecutor};

use crate::device::{DeviceClient, LoadOptions};
use crate::provider::{Feature, Providers};

/// Devices below this version break saves unless the legacy library files are renamed
pub const LEGACY_SAVE_VERSION: &str = "13.1";

/// Start of the base configuration stanza removed before a restore
pub const DYNAD_KEY_STANZA: &str = "sys dynad key {";

const RESTORE_FILE: &str = "restore.ucs";
const RESTORE_UPDATED_FILE: &str = "restore_updated.ucs";

/// Capture and restore of full device backups
pub struct BackupWorkflow {
    providers: Providers,
    device: Arc<dyn DeviceClient>,
    retry: RetryExecutor,
    config: AutoscaleConfig,
}

impl BackupWorkflow {
    /// Create a workflow for the given collaborators
    pub fn new(
        providers: Providers,
        device: Arc<dyn DeviceClient>,
        retry: RetryExecutor,
        config: AutoscaleConfig,
    ) -> Self {
        Self {
            providers,
            device,
            retry,
            config,
        }
    }

    /// Save, upload and validate a backup of the local device
    ///
    /// Returns the stored backup's name. If the stored copy fails its
    /// integrity check it is deleted and a `Corruption` error is returned.
    pub async fn capture(&self, local: &Instance) -> Result<String, Error> {
        let legacy = local
            .version
            .as_deref()
            .is_some_and(|v| compare_versions(v, LEGACY_SAVE_VERSION) == Ordering::Less);

        let name = format!(
            "{}{}.ucs",
            self.config.ucs_prefix,
            Utc::now().timestamp_millis()
        );
        info!(name = %name, legacy, "Saving backup");

        if legacy {
            self.rename_legacy_files(false).await?;
        }
        let device = self.device.as_ref();
        let ucs_name = name.as_str();
        let saved = self
            .retry
            .run("save_ucs", move || device.save_ucs(ucs_name))
            .await;
        if legacy {
            if let Err(e) = self.rename_legacy_files(true).await {
                warn!(error = %e, "Failed to restore legacy library file names");
            }
        }
        let path = saved?;

        let directory = self.providers.directory.as_ref();
        let (max_copies, prefix) = (self.config.max_ucs_files, self.config.ucs_prefix.as_str());
        let saved_path = path.as_path();
        self.retry
            .run("store_ucs", move || {
                directory.store_ucs(saved_path, max_copies, prefix)
            })
            .await?;

        self.validate_stored().await
    }

    /// Download the latest stored backup and check its archive structure
    async fn validate_stored(&self) -> Result<String, Error> {
        let directory = self.providers.directory.as_ref();
        let stored = self
            .retry
            .run("get_stored_ucs", move || directory.get_stored_ucs())
            .await?
            .ok_or_else(|| {
                Error::internal_with_context("backup", "no stored backup found after upload")
            })?;

        let work_dir = &self.config.backup.working_dir;
        let local_copy = work_dir.join(file_name(&stored.name));
        let checked: Result<(), Error> = async {
            tokio::fs::create_dir_all(work_dir)
                .await
                .map_err(|e| Error::io(format!("creating {}", work_dir.display()), e))?;
            tokio::fs::write(&local_copy, &stored.data)
                .await
                .map_err(|e| Error::io(format!("writing {}", local_copy.display()), e))?;
            verify_archive_blocking(local_copy.clone(), stored.name.clone()).await
        }
        .await;
        remove_if_present(&local_copy).await;

        match checked {
            Ok(()) => {
                info!(name = %stored.name, "Stored backup validated");
                Ok(stored.name)
            }
            Err(e) => {
                warn!(name = %stored.name, error = %e, "Stored backup failed validation, deleting");
                let stored_name = stored.name.as_str();
                if let Err(delete_err) = self
                    .retry
                    .run("delete_stored_ucs", move || {
                        directory.delete_stored_ucs(stored_name)
                    })
                    .await
                {
                    warn!(name = %stored.name, error = %delete_err, "Failed to delete corrupted backup");
                }
                Err(e)
            }
        }
    }

    /// Restore the latest stored backup, if there is one
    ///
    /// Returns whether a backup was loaded.
    pub async fn restore_if_available(&self, local: &Instance) -> Result<bool, Error> {
        let directory = self.providers.directory.as_ref();
        let Some(stored) = self
            .retry
            .run("get_stored_ucs", move || directory.get_stored_ucs())
            .await?
        else {
            info!(instance_id = %local.id, "No stored backup to restore");
            return Ok(false);
        };
        info!(instance_id = %local.id, name = %stored.name, "Restoring stored backup");

        let work_dir = &self.config.backup.working_dir;
        let original = work_dir.join(RESTORE_FILE);
        let updated = work_dir.join(RESTORE_UPDATED_FILE);

        let restored: Result<(), Error> = async {
            let reconciler = self.providers.reconciler()?;
            let device = self.device.as_ref();

            let account = if self.providers.has_feature(Feature::SharedPassword) {
                None
            } else {
                let user = self.device.credentials().username;
                let user = user.as_str();
                Some(
                    self.retry
                        .run("get_user", move || device.get_user(user))
                        .await?,
                )
            };

            tokio::fs::create_dir_all(work_dir)
                .await
                .map_err(|e| Error::io(format!("creating {}", work_dir.display()), e))?;
            tokio::fs::write(&original, &stored.data)
                .await
                .map_err(|e| Error::io(format!("writing {}", original.display()), e))?;

            strip_base_config(&self.config.backup.base_config_path).await?;
            self.retry
                .run("load_base_config", move || device.load_base_config())
                .await?;
            self.retry.run("ready", move || device.ready()).await?;

            reconciler.reconcile(&original, &updated).await?;

            let options = LoadOptions {
                no_license: true,
                reset_trust: true,
            };
            let updated_path = updated.as_path();
            self.retry
                .run("load_ucs", move || device.load_ucs(updated_path, options))
                .await?;
            self.retry.run("ready", move || device.ready()).await?;

            if let Some(account) = &account {
                self.retry
                    .run("restore_user", move || device.restore_user(account))
                    .await?;
            }
            Ok(())
        }
        .await;

        remove_if_present(&original).await;
        remove_if_present(&updated).await;

        restored.map(|()| {
            info!(name = %stored.name, "Backup restored");
            true
        })
    }

    /// Rename the legacy library files out of the way, or back when `restore` is set
    async fn rename_legacy_files(&self, restore: bool) -> Result<(), Error> {
        let dir = &self.config.backup.legacy_library_dir;
        for rename in &self.config.backup.legacy_library_files {
            let (from, to) = if restore {
                (dir.join(&rename.to), dir.join(&rename.from))
            } else {
                (dir.join(&rename.from), dir.join(&rename.to))
            };
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => debug!(from = %from.display(), to = %to.display(), "Renamed legacy file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("renaming {}", from.display()), e)),
            }
        }
        Ok(())
    }
}

/// Check that a gzip'd tar archive reads through to the end
///
/// Reads every entry's contents. Any decode error, or an archive with no
/// entries, is reported as `Corruption` naming `name`.
pub fn verify_archive(path: &Path, name: &str) -> Result<(), Error> {
    let file = File::open(path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let corrupt = |e: io::Error| Error::corruption(name, e.to_string());

    let mut entries = 0usize;
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
        entries += 1;
    }

    if entries == 0 {
        return Err(Error::corruption(name, "archive has no entries"));
    }
    debug!(name = %name, entries, "Archive verified");
    Ok(())
}

async fn verify_archive_blocking(path: PathBuf, name: String) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || verify_archive(&path, &name))
        .await
        .map_err(|e| Error::internal_with_context("backup", e.to_string()))?
}

/// Remove every `sys dynad key { ... }` stanza from a base configuration
///
/// An unterminated stanza is removed through the end of the text.
pub fn strip_dynad_key(config: &str) -> String {
    let mut out = String::with_capacity(config.len());
    let mut rest = config;

    while let Some(start) = rest.find(DYNAD_KEY_STANZA) {
        out.push_str(&rest[..start]);
        let stanza = &rest[start..];
        let open = DYNAD_KEY_STANZA.len() - 1;

        let mut depth = 0usize;
        let mut end = stanza.len();
        for (i, c) in stanza[open..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = open + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }

        rest = &stanza[end..];
        rest = rest.strip_prefix('\n').unwrap_or(rest);
    }

    out.push_str(rest);
    out
}

async fn strip_base_config(path: &Path) -> Result<(), Error> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No base config to clean");
            return Ok(());
        }
        Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
    };

    let cleaned = strip_dynad_key(&text);
    if cleaned != text {
        info!(path = %path.display(), "Removing dynad key from base config");
        tokio::fs::write(path, cleaned)
            .await
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    }
    Ok(())
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local backup copy"),
    }
}

fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
