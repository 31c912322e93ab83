pub mod multipass;
pub mod orb;

use std::path::Path;

use crate::config::ProviderKind;
use crate::error::FleetError;
use crate::identity;
use crate::model::{Host, HostStatus};
use crate::shell::{CommandOutput, ProcessRunner};

pub use multipass::Multipass;
pub use orb::Orb;

/// Subnets that belong to container bridges inside the guest, never the
/// address we want to reach it on.
const HIDDEN_SUBNETS: [&str; 2] = ["172.17.", "10.96."];

/// The external tool that creates, inspects and destroys instances.
///
/// Implementations surface every failure as an error and never retry;
/// retrying is the pipeline's job.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    /// Launch the instance unless it already exists.
    async fn create_vm(&self, cluster: &str, host: &Host, index: u32) -> Result<(), FleetError>;

    /// Stop and remove the instance if it exists.
    async fn delete_vm(&self, cluster: &str, host: &HostStatus) -> Result<(), FleetError>;

    /// Raw lookup output for one instance, or `NotFound`.
    async fn get_by_id(&self, id: &str) -> Result<String, FleetError>;

    async fn get(&self, cluster: &str, role: &str, index: u32) -> Result<String, FleetError> {
        self.get_by_id(&identity::make_id(cluster, role, index)).await
    }

    /// Raw listing of every instance the backend knows about.
    async fn list(&self) -> Result<String, FleetError>;

    async fn inspect(&self, cluster: &str, host: &Host, index: u32) -> Result<HostStatus, FleetError>;

    /// Same as `inspect`, answered from the full listing.
    async fn inspect_by_list(
        &self,
        cluster: &str,
        host: &Host,
        index: u32,
    ) -> Result<HostStatus, FleetError>;

    async fn mount(&self, id: &str, host_path: &str, guest_path: &str) -> Result<(), FleetError>;

    async fn unmount(&self, id: &str, guest_path: &str) -> Result<(), FleetError>;
}

// ── shared helpers ───────────────────────────────────────

/// Lookup that distinguishes "absent" from "lookup failed".
pub async fn exists<P: Provider>(provider: &P, id: &str) -> Result<bool, FleetError> {
    match provider.get_by_id(id).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Turn raw lookup output into the instance's document or `NotFound`.
///
/// Backends report absence with a non-zero exit and prose, so the markers are
/// matched against both streams.
pub fn lookup_result(id: &str, out: CommandOutput, markers: &[&str]) -> Result<String, FleetError> {
    let combined = out.combined();
    if markers.iter().any(|m| combined.contains(m)) {
        return Err(FleetError::NotFound { id: id.to_string() });
    }
    if out.success && out.stdout.trim().is_empty() {
        return Err(FleetError::NotFound { id: id.to_string() });
    }
    if !out.success {
        return Err(FleetError::ExternalCommand {
            command: format!("lookup {id}"),
            message: combined.trim().to_string(),
        });
    }
    Ok(out.stdout)
}

/// Drop bridge addresses, keeping order.
pub fn filter_ips<I, S>(ips: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ips.into_iter()
        .map(Into::into)
        .filter(|ip: &String| !HIDDEN_SUBNETS.iter().any(|p| ip.starts_with(p)))
        .collect()
}

/// Skeleton status for an instance before backend fields are filled in.
pub fn base_status(cluster: &str, host: &Host, index: u32) -> HostStatus {
    HostStatus {
        id: identity::make_id(cluster, &host.role, index),
        role: host.role.clone(),
        index,
        capacity: host.resources.clone(),
        ..HostStatus::default()
    }
}

// ── AnyProvider ───────────────────────────────────────────

/// Backend chosen at runtime from settings or the cluster's spec.
pub enum AnyProvider {
    Multipass(Multipass<ProcessRunner>),
    Orb(Orb<ProcessRunner>),
}

impl AnyProvider {
    pub fn new(kind: ProviderKind, runner: ProcessRunner, root: &Path, verbose: bool) -> Self {
        match kind {
            ProviderKind::Multipass => AnyProvider::Multipass(Multipass::new(runner, root, verbose)),
            ProviderKind::Orb => AnyProvider::Orb(Orb::new(runner, root)),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            AnyProvider::Multipass($p) => $call,
            AnyProvider::Orb($p) => $call,
        }
    };
}

impl Provider for AnyProvider {
    fn kind(&self) -> ProviderKind {
        delegate!(self, p => p.kind())
    }

    async fn create_vm(&self, cluster: &str, host: &Host, index: u32) -> Result<(), FleetError> {
        delegate!(self, p => p.create_vm(cluster, host, index).await)
    }

    async fn delete_vm(&self, cluster: &str, host: &HostStatus) -> Result<(), FleetError> {
        delegate!(self, p => p.delete_vm(cluster, host).await)
    }

    async fn get_by_id(&self, id: &str) -> Result<String, FleetError> {
        delegate!(self, p => p.get_by_id(id).await)
    }

    async fn list(&self) -> Result<String, FleetError> {
        delegate!(self, p => p.list().await)
    }

    async fn inspect(&self, cluster: &str, host: &Host, index: u32) -> Result<HostStatus, FleetError> {
        delegate!(self, p => p.inspect(cluster, host, index).await)
    }

    async fn inspect_by_list(
        &self,
        cluster: &str,
        host: &Host,
        index: u32,
    ) -> Result<HostStatus, FleetError> {
        delegate!(self, p => p.inspect_by_list(cluster, host, index).await)
    }

    async fn mount(&self, id: &str, host_path: &str, guest_path: &str) -> Result<(), FleetError> {
        delegate!(self, p => p.mount(id, host_path, guest_path).await)
    }

    async fn unmount(&self, id: &str, guest_path: &str) -> Result<(), FleetError> {
        delegate!(self, p => p.unmount(id, guest_path).await)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn out(success: bool, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            success,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn lookup_markers() {
        let markers = ["does not exist"];
        assert!(lookup_result("a", out(false, "", "info failed: instance \"a\" does not exist"), &markers)
            .unwrap_err()
            .is_not_found());
        assert!(lookup_result("a", out(true, "  \n", ""), &markers).unwrap_err().is_not_found());
        assert!(matches!(
            lookup_result("a", out(false, "", "daemon unreachable"), &markers),
            Err(FleetError::ExternalCommand { .. })
        ));
        assert_eq!(lookup_result("a", out(true, "{}", ""), &markers).unwrap(), "{}");
    }

    #[test]
    fn bridge_ips_filtered() {
        let ips = filter_ips(["192.168.64.2", "172.17.0.1", "10.96.0.1", "10.1.0.4"]);
        assert_eq!(ips, ["192.168.64.2", "10.1.0.4"]);
    }
}
