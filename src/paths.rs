use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "VirtualMachineFile";

/// Default state root: `~/.vmfleet`
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vmfleet")
}

/// Per-cluster data directory: `<root>/data/<cluster>/`
pub fn data_dir(root: &Path, cluster: &str) -> PathBuf {
    root.join("data").join(cluster)
}

/// Persisted cluster object: `<root>/data/<cluster>/VirtualMachineFile`
pub fn state_file(root: &Path, cluster: &str) -> PathBuf {
    data_dir(root, cluster).join(STATE_FILE)
}

/// Advisory lock held while a command mutates the cluster.
pub fn lock_file(root: &Path, cluster: &str) -> PathBuf {
    data_dir(root, cluster).join(".lock")
}

/// Rendered per-role configs: `<root>/etc/<cluster>/`
pub fn etc_dir(root: &Path, cluster: &str) -> PathBuf {
    root.join("etc").join(cluster)
}

/// Cloud-config for one role: `<root>/etc/<cluster>/<role>.yaml`
pub fn cloud_config(root: &Path, cluster: &str, role: &str) -> PathBuf {
    etc_dir(root, cluster).join(format!("{role}.yaml"))
}

/// Shell-script form of a role's cloud-config: `<root>/etc/<cluster>/<role>.sh`
pub fn cloud_script(root: &Path, cluster: &str, role: &str) -> PathBuf {
    etc_dir(root, cluster).join(format!("{role}.sh"))
}

/// `<root>/etc/config.toml`
pub fn settings_file(root: &Path) -> PathBuf {
    root.join("etc").join("config.toml")
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn log_file(root: &Path) -> PathBuf {
    logs_dir(root).join("vmfleet.log")
}

/// Scratch space for inline action content.
pub fn tmp_dir(root: &Path) -> PathBuf {
    root.join("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let root = Path::new("/r");
        assert_eq!(
            state_file(root, "demo"),
            Path::new("/r/data/demo/VirtualMachineFile")
        );
        assert_eq!(cloud_config(root, "demo", "node"), Path::new("/r/etc/demo/node.yaml"));
        assert_eq!(cloud_script(root, "demo", "node"), Path::new("/r/etc/demo/node.sh"));
        assert_eq!(settings_file(root), Path::new("/r/etc/config.toml"));
        assert_eq!(log_file(root), Path::new("/r/logs/vmfleet.log"));
    }
}
