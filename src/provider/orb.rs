//! OrbStack machines: lightweight Linux machines without cloud-init.
//!
//! The rendered cloud-config is flattened to a bash script and run as root
//! after `orb create`. Host directories are always shared, so mounts are no-ops.

use std::path::{Path, PathBuf};

use facet::Facet;

use super::{Provider, base_status, exists, filter_ips, lookup_result};
use crate::cloudinit;
use crate::config::ProviderKind;
use crate::error::FleetError;
use crate::identity;
use crate::model::{Host, HostStatus};
use crate::paths;
use crate::shell::CommandRunner;

const NOT_FOUND: [&str; 1] = ["machine not found"];
const DEFAULT_IMAGE: &str = "ubuntu";

pub struct Orb<R> {
    runner: R,
    root: PathBuf,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MachineInfo {
    #[facet(default)]
    id: String,
    #[facet(default)]
    name: String,
    #[facet(default)]
    image: MachineImage,
    #[facet(default)]
    state: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MachineImage {
    #[facet(default)]
    distro: String,
    #[facet(default)]
    version: String,
    #[facet(default)]
    arch: String,
}

/// Login address for a machine, the first entry of its IP list.
pub fn login_address(id: &str) -> String {
    format!("{id}@orb")
}

/// IPv4 addresses from `ip -4 addr show` lines scoped global, prefix length stripped.
fn parse_global_addrs(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| l.trim_start().starts_with("inet ") && l.contains("scope global"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
        .collect()
}

impl<R: CommandRunner> Orb<R> {
    pub fn new(runner: R, root: &Path) -> Self {
        Self {
            runner,
            root: root.to_path_buf(),
        }
    }

    fn status_from_info(&self, mut status: HostStatus, info: MachineInfo) -> HostStatus {
        status.state = info.state;
        status.image_id = info.id;
        let img = &info.image;
        status.image_name = format!("{}:{} {}", img.distro, img.version, img.arch);
        status
    }

    async fn addresses(&self, id: &str) -> Result<Vec<String>, FleetError> {
        let text = self
            .runner
            .checked("orb", &["run", "-m", id, "ip", "-4", "addr", "show"])
            .await?;
        let mut ips = vec![login_address(id)];
        ips.extend(filter_ips(parse_global_addrs(&text)));
        Ok(ips)
    }
}

impl<R: CommandRunner> Provider for Orb<R> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Orb
    }

    async fn create_vm(&self, cluster: &str, host: &Host, index: u32) -> Result<(), FleetError> {
        let id = identity::make_id(cluster, &host.role, index);
        if exists(self, &id).await? {
            tracing::info!(id = %id, "machine already exists, skipping create");
            return Ok(());
        }

        let config = cloudinit::read_user_data(&paths::cloud_config(&self.root, cluster, &host.role))?;
        let script_path = paths::cloud_script(&self.root, cluster, &host.role);
        tokio::fs::write(&script_path, cloudinit::to_script(&config))
            .await
            .map_err(|e| FleetError::Io {
                context: format!("writing {}", script_path.display()),
                source: e,
            })?;

        let image = if host.image.is_empty() {
            DEFAULT_IMAGE
        } else {
            host.image.as_str()
        };
        self.runner.checked("orb", &["create", image, &id]).await?;
        let script = script_path.display().to_string();
        self.runner
            .checked("orb", &["-m", &id, "-u", "root", "bash", &script])
            .await?;
        tracing::info!(id = %id, image, "created machine");
        Ok(())
    }

    async fn delete_vm(&self, _cluster: &str, host: &HostStatus) -> Result<(), FleetError> {
        if !exists(self, &host.id).await? {
            tracing::info!(id = %host.id, "machine already absent");
            return Ok(());
        }
        self.runner.checked("orbctl", &["delete", "-f", &host.id]).await?;
        tracing::info!(id = %host.id, "deleted machine");
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<String, FleetError> {
        let out = self
            .runner
            .output("orb", &["info", id, "--format", "json"])
            .await?;
        lookup_result(id, out, &NOT_FOUND)
    }

    async fn list(&self) -> Result<String, FleetError> {
        self.runner.checked("orb", &["list", "--format", "json"]).await
    }

    async fn inspect(&self, cluster: &str, host: &Host, index: u32) -> Result<HostStatus, FleetError> {
        let status = base_status(cluster, host, index);
        let raw = self.get_by_id(&status.id).await?;
        let info: MachineInfo = facet_json::from_str(&raw).map_err(|e| FleetError::Decode {
            context: format!("orb info {}", status.id),
            message: e.to_string(),
        })?;
        if info.name != status.id {
            return Err(FleetError::NotFound { id: status.id });
        }
        let mut status = self.status_from_info(status, info);
        if status.is_running() {
            status.ips = self.addresses(&status.id).await?;
        }
        Ok(status)
    }

    async fn inspect_by_list(
        &self,
        cluster: &str,
        host: &Host,
        index: u32,
    ) -> Result<HostStatus, FleetError> {
        let status = base_status(cluster, host, index);
        let raw = self.list().await?;
        let machines: Vec<MachineInfo> = facet_json::from_str(&raw).map_err(|e| FleetError::Decode {
            context: "orb list".into(),
            message: e.to_string(),
        })?;
        let info = machines
            .into_iter()
            .find(|m| m.name == status.id)
            .ok_or_else(|| FleetError::NotFound {
                id: status.id.clone(),
            })?;
        let mut status = self.status_from_info(status, info);
        if status.is_running() {
            status.ips = self.addresses(&status.id).await?;
        }
        Ok(status)
    }

    async fn mount(&self, id: &str, host_path: &str, guest_path: &str) -> Result<(), FleetError> {
        tracing::warn!(id, host_path, guest_path, "orb shares host paths already, mount skipped");
        Ok(())
    }

    async fn unmount(&self, id: &str, guest_path: &str) -> Result<(), FleetError> {
        tracing::warn!(id, guest_path, "orb shares host paths already, unmount skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedRunner;

    const INFO: &str = r#"{
        "id": "01HXYZ",
        "name": "demo-node-0",
        "image": {"distro": "ubuntu", "version": "jammy", "arch": "arm64", "variant": "default"},
        "config": {"isolated": false},
        "state": "running"
    }"#;

    const IP_ADDR: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536
    inet 127.0.0.1/8 scope host lo
2: eth0@if5: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 198.19.249.12/24 metric 100 brd 198.19.249.255 scope global dynamic eth0
    inet6 fd07:b51a:cc66:0:a617:db5e:c612:3a5/64 scope global
    inet6 fe80::a617:dbff:fe5e:c612/64 scope link
3: docker0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500
    inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0
";

    fn node() -> Host {
        Host {
            role: "node".into(),
            count: 1,
            ..Host::default()
        }
    }

    #[test]
    fn global_addresses() {
        assert_eq!(
            parse_global_addrs(IP_ADDR),
            ["198.19.249.12", "172.17.0.1"]
        );
    }

    #[tokio::test]
    async fn inspect_running_machine() {
        let orb = Orb::new(ScriptedRunner::default(), Path::new("/r"));
        orb.runner.on("orb info demo-node-0", true, INFO, "");
        orb.runner.on("orb run -m demo-node-0 ip -4 addr show", true, IP_ADDR, "");
        let st = orb.inspect("demo", &node(), 0).await.unwrap();
        assert!(st.is_running());
        assert_eq!(st.image_name, "ubuntu:jammy arm64");
        assert_eq!(st.ips, ["demo-node-0@orb", "198.19.249.12"]);
    }

    #[tokio::test]
    async fn machine_not_found() {
        let orb = Orb::new(ScriptedRunner::default(), Path::new("/r"));
        orb.runner.on("orb info", false, "", "machine not found: demo-node-0");
        assert!(orb.inspect("demo", &node(), 0).await.unwrap_err().is_not_found());

        let st = HostStatus {
            id: "demo-node-0".into(),
            ..HostStatus::default()
        };
        orb.delete_vm("demo", &st).await.unwrap();
        assert_eq!(orb.runner.count("orbctl delete"), 0);
    }

    #[tokio::test]
    async fn create_writes_script_and_runs_it() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = paths::cloud_config(dir.path(), "demo", "node");
        std::fs::create_dir_all(yaml.parent().unwrap()).unwrap();
        std::fs::write(&yaml, "#cloud-config\nruncmd:\n- echo hi\n").unwrap();

        let orb = Orb::new(ScriptedRunner::default(), dir.path());
        orb.runner.on("orb info", false, "", "machine not found");
        orb.create_vm("demo", &node(), 0).await.unwrap();

        let script = paths::cloud_script(dir.path(), "demo", "node");
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.contains("echo hi\n"));
        let calls = orb.runner.calls();
        assert_eq!(calls[1], "orb create ubuntu demo-node-0");
        assert_eq!(
            calls[2],
            format!("orb -m demo-node-0 -u root bash {}", script.display())
        );
    }

    #[tokio::test]
    async fn mounts_are_noops() {
        let orb = Orb::new(ScriptedRunner::default(), Path::new("/r"));
        orb.mount("demo-node-0", "/a", "/b").await.unwrap();
        orb.unmount("demo-node-0", "/b").await.unwrap();
        assert!(orb.runner.calls().is_empty());
    }
}
