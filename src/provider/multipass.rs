//! Multipass: full VMs driven through the `multipass` CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use super::{Provider, base_status, exists, filter_ips, lookup_result};
use crate::config::ProviderKind;
use crate::error::FleetError;
use crate::identity;
use crate::model::{Host, HostStatus, RESOURCE_CPU, RESOURCE_DISK, RESOURCE_MEMORY};
use crate::paths;
use crate::shell::CommandRunner;
use crate::util;

const NOT_FOUND: [&str; 1] = ["does not exist"];

pub struct Multipass<R> {
    runner: R,
    root: PathBuf,
    verbose: bool,
}

impl<R: CommandRunner> Multipass<R> {
    pub fn new(runner: R, root: &Path, verbose: bool) -> Self {
        Self {
            runner,
            root: root.to_path_buf(),
            verbose,
        }
    }

    fn launch_args(&self, id: &str, host: &Host, cloud_config: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["launch".into(), "--name".into(), id.into()];
        for (flag, key) in [
            ("--cpus", RESOURCE_CPU),
            ("--memory", RESOURCE_MEMORY),
            ("--disk", RESOURCE_DISK),
        ] {
            if let Some(v) = host.resource(key) {
                args.push(flag.into());
                args.push(v.into());
            }
        }
        args.push("--cloud-init".into());
        args.push(cloud_config.into());
        if self.verbose {
            args.push("-vvv".into());
        }
        if !host.image.is_empty() {
            args.push(host.image.clone());
        }
        args
    }
}

// ── JSON shapes ──────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct InfoReply {
    #[facet(default)]
    info: BTreeMap<String, InfoEntry>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct InfoEntry {
    #[facet(default)]
    state: String,
    #[facet(default)]
    ipv4: Vec<String>,
    #[facet(default)]
    image_hash: String,
    #[facet(default)]
    release: String,
    #[facet(default)]
    load: Vec<f64>,
    #[facet(default)]
    memory: MemoryUsage,
    #[facet(default)]
    disks: BTreeMap<String, DiskUsage>,
    #[facet(default)]
    mounts: BTreeMap<String, MountEntry>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MemoryUsage {
    #[facet(default)]
    used: u64,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DiskUsage {
    #[facet(default)]
    used: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MountEntry {
    #[facet(default)]
    source_path: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ListReply {
    #[facet(default)]
    list: Vec<ListEntry>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ListEntry {
    #[facet(default)]
    name: String,
    #[facet(default)]
    state: String,
    #[facet(default)]
    ipv4: Vec<String>,
    #[facet(default)]
    release: String,
}

fn status_from_info(mut status: HostStatus, entry: InfoEntry) -> HostStatus {
    status.state = entry.state;
    status.ips = filter_ips(entry.ipv4);
    status.image_id = entry.image_hash;
    status.image_name = entry.release;

    if !entry.load.is_empty() {
        let load: Vec<String> = entry.load.iter().map(|l| l.to_string()).collect();
        status.used.insert(RESOURCE_CPU.into(), load.join(" "));
    }
    if entry.memory.used > 0 {
        status
            .used
            .insert(RESOURCE_MEMORY.into(), util::humanize_bytes(entry.memory.used));
    }
    if let Some(used) = entry
        .disks
        .get("sda1")
        .and_then(|d| d.used.trim().parse::<u64>().ok())
    {
        status.used.insert(RESOURCE_DISK.into(), util::humanize_bytes(used));
    }
    for (guest, mount) in entry.mounts {
        status.mounts.insert(mount.source_path, guest);
    }
    status
}

impl<R: CommandRunner> Provider for Multipass<R> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Multipass
    }

    async fn create_vm(&self, cluster: &str, host: &Host, index: u32) -> Result<(), FleetError> {
        let id = identity::make_id(cluster, &host.role, index);
        if exists(self, &id).await? {
            tracing::info!(id = %id, "instance already exists, skipping launch");
            return Ok(());
        }
        let cloud_config = paths::cloud_config(&self.root, cluster, &host.role);
        let args = self.launch_args(&id, host, &cloud_config.display().to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.checked("multipass", &args).await?;
        tracing::info!(id = %id, "launched instance");
        Ok(())
    }

    async fn delete_vm(&self, _cluster: &str, host: &HostStatus) -> Result<(), FleetError> {
        if !exists(self, &host.id).await? {
            tracing::info!(id = %host.id, "instance already absent");
            return Ok(());
        }
        self.runner.checked("multipass", &["stop", &host.id]).await?;
        self.runner
            .checked("multipass", &["delete", "--purge", &host.id])
            .await?;
        tracing::info!(id = %host.id, "deleted instance");
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<String, FleetError> {
        let out = self
            .runner
            .output("multipass", &["info", id, "--format", "json"])
            .await?;
        lookup_result(id, out, &NOT_FOUND)
    }

    async fn list(&self) -> Result<String, FleetError> {
        self.runner
            .checked("multipass", &["list", "--format", "json"])
            .await
    }

    async fn inspect(&self, cluster: &str, host: &Host, index: u32) -> Result<HostStatus, FleetError> {
        let status = base_status(cluster, host, index);
        let raw = self.get_by_id(&status.id).await?;
        let mut reply: InfoReply = facet_json::from_str(&raw).map_err(|e| FleetError::Decode {
            context: format!("multipass info {}", status.id),
            message: e.to_string(),
        })?;
        let entry = reply
            .info
            .remove(&status.id)
            .ok_or_else(|| FleetError::NotFound {
                id: status.id.clone(),
            })?;
        Ok(status_from_info(status, entry))
    }

    async fn inspect_by_list(
        &self,
        cluster: &str,
        host: &Host,
        index: u32,
    ) -> Result<HostStatus, FleetError> {
        let mut status = base_status(cluster, host, index);
        let raw = self.list().await?;
        let reply: ListReply = facet_json::from_str(&raw).map_err(|e| FleetError::Decode {
            context: "multipass list".into(),
            message: e.to_string(),
        })?;
        let entry = reply
            .list
            .into_iter()
            .find(|e| e.name == status.id)
            .ok_or_else(|| FleetError::NotFound {
                id: status.id.clone(),
            })?;
        status.state = entry.state;
        status.ips = filter_ips(entry.ipv4);
        status.image_name = entry.release;
        Ok(status)
    }

    async fn mount(&self, id: &str, host_path: &str, guest_path: &str) -> Result<(), FleetError> {
        let target = format!("{id}:{guest_path}");
        self.runner
            .checked("multipass", &["mount", host_path, &target])
            .await?;
        tracing::info!(id, host_path, guest_path, "mounted");
        Ok(())
    }

    async fn unmount(&self, id: &str, guest_path: &str) -> Result<(), FleetError> {
        let target = format!("{id}:{guest_path}");
        self.runner.checked("multipass", &["umount", &target]).await?;
        tracing::info!(id, guest_path, "unmounted");
        Ok(())
    }
}
