//! Operator-facing ledger operations used by the `transcode-relay` CLI.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{chown, Gid, Group, Uid, User};
use serde::Serialize;

use crate::config::{Config, DirectoryConfig};
use crate::error::{RelayError, Result};
use crate::ledger::{Cleared, HostRef, HostState, Ledger, ProcessRecord, Target};

/// Address shown for the synthetic local fallback entry.
pub const LOCAL_FALLBACK_ADDRESS: &str = "localhost (fallback)";

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub pid: u32,
    pub command: String,
}

impl From<&ProcessRecord> for JobInfo {
    fn from(p: &ProcessRecord) -> Self {
        Self {
            pid: p.process_id,
            command: p.command.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// 0 for the local fallback entry.
    pub id: i64,
    pub address: String,
    pub weight: i64,
    pub state: HostState,
    pub jobs: Vec<JobInfo>,
}

/// Per-host status, plus a local fallback entry when local jobs are running.
pub fn status(ledger: &Ledger) -> Result<Vec<HostStatus>> {
    let snapshot = ledger.snapshot()?;

    let jobs_for = |target: Target| -> Vec<JobInfo> {
        snapshot
            .processes
            .iter()
            .filter(|p| p.target == target)
            .map(JobInfo::from)
            .collect()
    };

    let mut report: Vec<HostStatus> = snapshot
        .hosts_with_state()
        .map(|(host, state)| HostStatus {
            id: host.id.0,
            address: host.address.clone(),
            weight: host.weight,
            state,
            jobs: jobs_for(Target::Host(host.id)),
        })
        .collect();

    let local = jobs_for(Target::Local);
    if !local.is_empty() {
        report.push(HostStatus {
            id: 0,
            address: LOCAL_FALLBACK_ADDRESS.to_string(),
            weight: 0,
            state: HostState::Active,
            jobs: local,
        });
    }

    Ok(report)
}

const SHARED_DIR_MODE: u32 = 0o770;
const SHARED_FILE_MODE: u32 = 0o660;

/// Ledger sidecar files that exist while a WAL-mode database is open.
const LEDGER_SIDECARS: [&str; 2] = ["-wal", "-shm"];

/// Recreate the ledger after `confirm` agrees, create the control socket
/// directory and hand both over to the configured owner. Existing hosts and
/// history are lost.
pub fn initialize(config: &Config, confirm: impl FnOnce() -> bool) -> Result<Ledger> {
    let path = config.ledger_path();
    if path.exists() && !confirm() {
        return Err(RelayError::Aborted(
            "ledger initialization not confirmed".to_string(),
        ));
    }

    let (uid, gid) = resolve_owner(&config.directories)?;
    let ledger = Ledger::initialize(&path)?;
    std::fs::create_dir_all(&config.directories.persist)?;

    if uid.is_some() || gid.is_some() {
        if let Some(state_dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            share(state_dir, uid, gid, SHARED_DIR_MODE)?;
        }
        share(&config.directories.persist, uid, gid, SHARED_DIR_MODE)?;
        share(&path, uid, gid, SHARED_FILE_MODE)?;
        for suffix in LEDGER_SIDECARS {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            let sidecar = Path::new(&sidecar);
            if sidecar.exists() {
                share(sidecar, uid, gid, SHARED_FILE_MODE)?;
            }
        }
    }

    Ok(ledger)
}

/// Owner and group from `directories.owner`/`directories.group`, given as a
/// name or a numeric id. Empty means leave unchanged.
pub fn resolve_owner(dirs: &DirectoryConfig) -> Result<(Option<Uid>, Option<Gid>)> {
    let uid = match dirs.owner.as_str() {
        "" => None,
        owner => Some(match owner.parse::<u32>() {
            Ok(raw) => Uid::from_raw(raw),
            Err(_) => User::from_name(owner)?
                .map(|u| u.uid)
                .ok_or_else(|| RelayError::InvalidConfig(format!("unknown user '{}'", owner)))?,
        }),
    };
    let gid = match dirs.group.as_str() {
        "" => None,
        group => Some(match group.parse::<u32>() {
            Ok(raw) => Gid::from_raw(raw),
            Err(_) => Group::from_name(group)?
                .map(|g| g.gid)
                .ok_or_else(|| RelayError::InvalidConfig(format!("unknown group '{}'", group)))?,
        }),
    };
    Ok((uid, gid))
}

fn share(path: &Path, uid: Option<Uid>, gid: Option<Gid>, mode: u32) -> Result<()> {
    chown(path, uid, gid)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    tracing::debug!(path = %path.display(), mode = %format!("{:o}", mode), "Ownership applied");
    Ok(())
}

/// Remove process rows and state history for one host, or for everything.
/// This is how a `bad` host returns to rotation and how rows left by a
/// killed dispatcher are discarded.
pub fn clear(ledger: &Ledger, host: Option<&HostRef>) -> Result<Cleared> {
    let cleared = ledger.clear(host)?;
    let scope = host.map_or_else(|| "all".to_string(), |h| h.to_string());
    tracing::info!(
        host = %scope,
        processes = cleared.processes,
        events = cleared.states,
        "Ledger rows cleared"
    );
    Ok(cleared)
}

pub fn render_table(report: &[HostStatus]) -> String {
    let mut out = String::new();
    if report.is_empty() {
        out.push_str("No hosts configured.\n");
        return out;
    }

    out.push_str(&format!(
        "{:<6} {:<28} {:<8} {:<8} {:<6} ACTIVE COMMANDS\n",
        "ID", "HOSTNAME", "WEIGHT", "STATE", "JOBS"
    ));
    out.push_str(&format!("{}\n", "-".repeat(80)));

    for host in report {
        let weight = if host.id == 0 {
            "-".to_string()
        } else {
            host.weight.to_string()
        };
        let first = host
            .jobs
            .first()
            .map(|j| format!("PID {}: {}", j.pid, j.command))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<6} {:<28} {:<8} {:<8} {:<6} {}\n",
            host.id,
            host.address,
            weight,
            host.state,
            host.jobs.len(),
            first
        ));
        for job in host.jobs.iter().skip(1) {
            out.push_str(&format!(
                "{:<60} PID {}: {}\n",
                "", job.pid, job.command
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default().with_ledger_path(dir.path().join("state/relay.db"));
        config.directories.persist = dir.path().join("persist");
        config.directories.owner = String::new();
        config.directories.group = String::new();
        config
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn initialize_requires_confirmation_for_existing_ledger() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = config.ledger_path();

        // Fresh file: no prompt needed
        let ledger = initialize(&config, || panic!("should not ask")).unwrap();
        ledger.add_host("gpu1.lan", 1).unwrap();
        drop(ledger);
        assert!(config.directories.persist.is_dir());

        let err = initialize(&config, || false).unwrap_err();
        assert!(matches!(err, RelayError::Aborted(_)));
        assert_eq!(Ledger::open(&path).unwrap().list_hosts().unwrap().len(), 1);

        let ledger = initialize(&config, || true).unwrap();
        assert!(ledger.list_hosts().unwrap().is_empty());
    }

    #[test]
    fn initialize_hands_ledger_to_configured_owner() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.directories.owner = Uid::current().to_string();
        config.directories.group = Gid::current().to_string();
        let path = config.ledger_path();

        let ledger = initialize(&config, || true).unwrap();

        let state_dir = path.parent().unwrap();
        assert_eq!(mode_of(state_dir), 0o770);
        assert_eq!(mode_of(&config.directories.persist), 0o770);
        assert_eq!(mode_of(&path), 0o660);

        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.uid(), Uid::current().as_raw());
        assert_eq!(meta.gid(), Gid::current().as_raw());

        // Still usable through the handle and through a fresh connection
        ledger.add_host("gpu1.lan", 1).unwrap();
        assert_eq!(Ledger::open(&path).unwrap().list_hosts().unwrap().len(), 1);
    }

    #[test]
    fn resolve_owner_by_id_name_or_unset() {
        let mut dirs = DirectoryConfig {
            owner: String::new(),
            group: String::new(),
            ..Default::default()
        };
        assert_eq!(resolve_owner(&dirs).unwrap(), (None, None));

        dirs.owner = "1234".to_string();
        dirs.group = "root".to_string();
        assert_eq!(
            resolve_owner(&dirs).unwrap(),
            (Some(Uid::from_raw(1234)), Some(Gid::from_raw(0)))
        );

        dirs.owner = "no-such-relay-user".to_string();
        assert!(matches!(
            resolve_owner(&dirs),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn table_lists_every_job() {
        let report = vec![HostStatus {
            id: 1,
            address: "gpu1.lan".to_string(),
            weight: 2,
            state: HostState::Active,
            jobs: vec![
                JobInfo {
                    pid: 10,
                    command: "ffmpeg -i a.mkv".to_string(),
                },
                JobInfo {
                    pid: 11,
                    command: "ffmpeg -i b.mkv".to_string(),
                },
            ],
        }];
        let table = render_table(&report);
        assert!(table.contains("gpu1.lan"));
        assert!(table.contains("PID 10: ffmpeg -i a.mkv"));
        assert!(table.contains("PID 11: ffmpeg -i b.mkv"));
        assert_eq!(render_table(&[]), "No hosts configured.\n");
    }
}
