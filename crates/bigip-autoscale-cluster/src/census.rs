//! Census of running convergence passes on this instance
//!
//! Each join/update pass records itself as `{pid}.json` in the run directory.
//! A new pass refuses to start while another live pass is younger than the
//! stale timeout, and kills one that has outlived it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use bigip_autoscale_common::config::CensusConfig;
use bigip_autoscale_common::Error;

use crate::controller::ClusterAction;

/// A running pass as recorded in the run directory
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PassRecord {
    /// Process running the pass
    pub pid: u32,
    /// Action the pass was started for
    pub action: String,
    /// When the pass started
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
enum PidState {
    Alive,
    Missing,
}

/// Process-level guard against overlapping passes on one instance
#[derive(Clone, Debug)]
pub struct PassCensus {
    run_dir: PathBuf,
    stale_after: Duration,
}

impl PassCensus {
    /// Create a census over the configured run directory
    pub fn new(config: &CensusConfig) -> Self {
        Self {
            run_dir: config.run_dir.clone(),
            stale_after: config.stale_after(),
        }
    }

    /// Register the current process for `action`
    ///
    /// Returns `None` for actions that do not manage membership. Fails with
    /// `Conflict` while another live pass is within its stale timeout.
    pub fn enter(&self, action: ClusterAction) -> Result<Option<CensusGuard>, Error> {
        self.enter_as(action, std::process::id(), Utc::now())
    }

    fn enter_as(
        &self,
        action: ClusterAction,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<CensusGuard>, Error> {
        if !action.manages_membership() {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.run_dir)
            .map_err(|e| Error::io(format!("creating {}", self.run_dir.display()), e))?;

        for (path, record) in self.records()? {
            if record.pid == pid {
                continue;
            }
            match pid_state(record.pid) {
                PidState::Missing => {
                    debug!(pid = record.pid, "Pruning record of finished pass");
                    remove_record(&path);
                }
                PidState::Alive => {
                    // a start time in the future counts as just started
                    let age = (now - record.started_at).to_std().unwrap_or_default();
                    if age < self.stale_after {
                        return Err(Error::conflict(format!(
                            "{} pass already running as pid {} for {}s",
                            record.action,
                            record.pid,
                            age.as_secs()
                        )));
                    }
                    warn!(
                        pid = record.pid,
                        action = %record.action,
                        age_secs = age.as_secs(),
                        "Terminating stale pass"
                    );
                    terminate(record.pid);
                    remove_record(&path);
                }
            }
        }

        let record = PassRecord {
            pid,
            action: action.to_string(),
            started_at: now,
        };
        let path = self.run_dir.join(format!("{pid}.json"));
        let json = serde_json::to_vec(&record)?;
        std::fs::write(&path, json)
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        info!(pid, action = %action, "Pass registered");

        Ok(Some(CensusGuard { path }))
    }

    /// All readable records in the run directory
    ///
    /// Unreadable records are removed.
    pub fn records(&self) -> Result<Vec<(PathBuf, PassRecord)>, Error> {
        let entries = match std::fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(format!("reading {}", self.run_dir.display()), e));
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| Error::io(format!("reading {}", self.run_dir.display()), e))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PassRecord>(&bytes).ok());
            match parsed {
                Some(record) => records.push((path, record)),
                None => {
                    warn!(path = %path.display(), "Removing unreadable pass record");
                    remove_record(&path);
                }
            }
        }
        records.sort_by_key(|(_, record)| record.pid);
        Ok(records)
    }
}

/// Removes the pass record when the pass ends
#[derive(Debug)]
pub struct CensusGuard {
    path: PathBuf,
}

impl CensusGuard {
    /// Location of this pass's record
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CensusGuard {
    fn drop(&mut self) {
        remove_record(&self.path);
    }
}

fn pid_state(pid: u32) -> PidState {
    let Ok(raw) = i32::try_from(pid) else {
        return PidState::Missing;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => PidState::Alive,
        Err(Errno::ESRCH) => PidState::Missing,
        Err(err) => {
            debug!(%err, pid, "pid check returned unexpected error");
            PidState::Alive
        }
    }
}

fn terminate(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(%err, pid, "Failed to terminate stale pass"),
    }
}

fn remove_record(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove pass record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Child, Command};

    use chrono::Duration as ChronoDuration;

    fn census(dir: &tempfile::TempDir) -> PassCensus {
        census_with_timeout(dir, 600)
    }

    fn census_with_timeout(dir: &tempfile::TempDir, stale_after_secs: u64) -> PassCensus {
        PassCensus::new(&CensusConfig {
            run_dir: dir.path().join("run"),
            stale_after_secs,
        })
    }

    fn write_record(census: &PassCensus, pid: u32, started_at: DateTime<Utc>) -> PathBuf {
        std::fs::create_dir_all(&census.run_dir).unwrap();
        let path = census.run_dir.join(format!("{pid}.json"));
        let record = PassRecord {
            pid,
            action: "update".to_string(),
            started_at,
        };
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
        path
    }

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn test_non_membership_actions_are_not_counted() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);
        assert!(census.enter(ClusterAction::BackupUcs).unwrap().is_none());
        assert!(census.enter(ClusterAction::UnblockSync).unwrap().is_none());
        assert!(!census.run_dir.exists());
    }

    #[test]
    fn test_guard_removes_record_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);

        let guard = census.enter(ClusterAction::Join).unwrap().unwrap();
        let path = guard.path().to_path_buf();
        let records = census.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.pid, std::process::id());
        assert_eq!(records[0].1.action, "join");

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_dead_pass_is_pruned() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);
        let stale = write_record(&census, 4_000_000, Utc::now());

        let guard = census.enter(ClusterAction::Update).unwrap();
        assert!(guard.is_some());
        assert!(!stale.exists());
    }

    #[test]
    fn test_unreadable_record_is_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);
        std::fs::create_dir_all(&census.run_dir).unwrap();
        let junk = census.run_dir.join("123.json");
        std::fs::write(&junk, b"not json").unwrap();

        assert!(census.records().unwrap().is_empty());
        assert!(!junk.exists());
    }

    /// Story: A second update pass on the same instance backs off while the
    /// first is still within its timeout
    #[test]
    fn story_live_pass_blocks_overlap() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);
        let mut child = sleeper();
        let record = write_record(&census, child.id(), Utc::now() - ChronoDuration::seconds(30));

        let result = census.enter(ClusterAction::Update);

        child.kill().unwrap();
        child.wait().unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.to_string().contains("already running"));
        assert!(record.exists());
    }

    /// Story: A pass stuck past the timeout is killed and replaced
    #[test]
    fn story_stale_pass_is_terminated() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census(&dir);
        let mut child = sleeper();
        let record = write_record(&census, child.id(), Utc::now() - ChronoDuration::hours(1));

        let guard = census.enter(ClusterAction::Join).unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        assert!(!record.exists());
        assert!(guard.is_some());
    }

    #[test]
    fn test_stale_timeout_follows_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census_with_timeout(&dir, 60);
        assert_eq!(census.stale_after, Duration::from_secs(60));

        let mut child = sleeper();
        let record = write_record(&census, child.id(), Utc::now() - ChronoDuration::minutes(2));

        let guard = census.enter(ClusterAction::Update).unwrap();

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        assert!(!record.exists());
        assert!(guard.is_some());
    }

    #[test]
    fn test_future_start_time_counts_as_live() {
        let dir = tempfile::TempDir::new().unwrap();
        let census = census_with_timeout(&dir, 60);
        let mut child = sleeper();
        write_record(&census, child.id(), Utc::now() + ChronoDuration::minutes(5));

        let result = census.enter(ClusterAction::Join);

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(matches!(result.unwrap_err(), Error::Conflict { .. }));
    }
}
