//! On-disk state: one YAML document per cluster.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::FleetError;
use crate::model::VirtualMachine;
use crate::paths;
use crate::util;

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> FleetError {
    move |source| FleetError::Io { context, source }
}

/// Read the cluster object. `Ok(None)` means the cluster was never saved.
pub fn load(root: &Path, cluster: &str) -> Result<Option<VirtualMachine>, FleetError> {
    let path = paths::state_file(root, cluster);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(format!("reading {}", path.display()))(e)),
    };
    let vm: VirtualMachine =
        facet_yaml::from_str(&contents).map_err(|e| FleetError::StateParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(Some(vm))
}

/// Write the cluster object through a temp file and rename.
pub fn save(root: &Path, vm: &VirtualMachine) -> Result<PathBuf, FleetError> {
    let path = paths::state_file(root, vm.name());
    let dir = paths::data_dir(root, vm.name());
    fs::create_dir_all(&dir).map_err(io_err(format!("creating {}", dir.display())))?;

    let yaml = facet_yaml::to_string(vm).map_err(|e| FleetError::Io {
        context: format!("serializing cluster {}", vm.name()),
        source: std::io::Error::other(e.to_string()),
    })?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err(format!("creating {}", tmp.display())))?;
        file.write_all(yaml.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(io_err(format!("writing {}", tmp.display())))?;
    }
    fs::rename(&tmp, &path).map_err(io_err(format!("replacing {}", path.display())))?;

    tracing::debug!(path = %path.display(), "saved cluster state");
    Ok(path)
}

/// Move the state file aside to `<path>.<unix-seconds>`.
pub fn archive(root: &Path, cluster: &str) -> Result<PathBuf, FleetError> {
    let path = paths::state_file(root, cluster);
    let mut stamp = util::unix_now();
    let mut target = archive_path(&path, stamp);
    while target.exists() {
        stamp += 1;
        target = archive_path(&path, stamp);
    }
    fs::rename(&path, &target).map_err(io_err(format!("archiving {}", path.display())))?;
    tracing::info!(path = %target.display(), "archived cluster state");
    Ok(target)
}

fn archive_path(path: &Path, stamp: u64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{stamp}"));
    PathBuf::from(name)
}

/// Exclusive advisory lock on one cluster, released on drop.
#[derive(Debug)]
pub struct ClusterLock {
    _file: File,
}

pub fn lock(root: &Path, cluster: &str) -> Result<ClusterLock, FleetError> {
    let dir = paths::data_dir(root, cluster);
    fs::create_dir_all(&dir).map_err(io_err(format!("creating {}", dir.display())))?;
    let path = paths::lock_file(root, cluster);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(io_err(format!("opening {}", path.display())))?;
    match file.try_lock() {
        Ok(()) => Ok(ClusterLock { _file: file }),
        Err(TryLockError::WouldBlock) => Err(FleetError::Locked {
            name: cluster.to_string(),
            path: path.display().to_string(),
        }),
        Err(TryLockError::Error(e)) => Err(io_err(format!("locking {}", path.display()))(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, Host, HostStatus, Phase};

    fn sample() -> VirtualMachine {
        let mut vm = VirtualMachine::new("demo");
        vm.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        vm.spec.hosts.push(Host {
            role: "node".into(),
            count: 2,
            image: "22.04".into(),
            ..Host::default()
        });
        vm.spec.hosts[0].mounts.insert("/data".into(), "/data".into());
        vm.spec.hosts[0].resources.insert("cpu".into(), "2".into());
        vm.status.phase = Phase::Success;
        vm.status.hosts.push(HostStatus {
            id: "demo-node-0".into(),
            role: "node".into(),
            index: 0,
            state: "Running".into(),
            ips: vec!["192.168.64.5".into()],
            image_id: "abc".into(),
            ..HostStatus::default()
        });
        vm.status.set_condition(Condition::ok("SyncVMs", "ok"));
        vm
    }

    #[test]
    fn missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "demo").unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let vm = sample();
        let path = save(dir.path(), &vm).unwrap();
        assert_eq!(path, dir.path().join("data/demo/VirtualMachineFile"));
        assert!(!path.with_extension("tmp").exists());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("creationTimestamp"), "{text}");
        assert!(text.contains("imageID"), "{text}");

        let loaded = load(dir.path(), "demo").unwrap().unwrap();
        assert_eq!(loaded, vm);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::state_file(dir.path(), "demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "spec: [not: {valid").unwrap();
        assert!(matches!(
            load(dir.path(), "demo"),
            Err(FleetError::StateParse { .. })
        ));
    }

    #[test]
    fn sparse_file_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::state_file(dir.path(), "demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "metadata:\n  name: demo\nstatus:\n  conditions:\n    - type: SyncVMs\n",
        )
        .unwrap();

        let vm = load(dir.path(), "demo").unwrap().unwrap();
        assert_eq!(vm.name(), "demo");
        assert!(vm.spec.hosts.is_empty());
        assert!(vm.metadata.creation_timestamp.is_none());
        assert_eq!(vm.status.phase, Phase::InProcess);
        assert_eq!(vm.status.conditions[0].kind, "SyncVMs");
        assert!(!vm.status.conditions[0].is_true());
    }

    #[test]
    fn archive_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = save(dir.path(), &sample()).unwrap();
        let archived = archive(dir.path(), "demo").unwrap();
        assert!(!path.exists());
        assert!(archived.exists());
        let name = archived.file_name().unwrap().to_str().unwrap();
        let stamp = name.strip_prefix("VirtualMachineFile.").unwrap();
        assert!(stamp.parse::<u64>().is_ok(), "{name}");
        assert!(load(dir.path(), "demo").unwrap().is_none());
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let held = lock(dir.path(), "demo").unwrap();
        assert!(matches!(
            lock(dir.path(), "demo"),
            Err(FleetError::Locked { .. })
        ));
        drop(held);
        lock(dir.path(), "demo").unwrap();
    }
}
