//! Running commands on instances once they are up.

pub mod orb;
pub mod ssh;

use std::path::Path;

use crate::config::{ProviderKind, Settings};
use crate::error::{AggregateError, FleetError};
use crate::fanout::fan_out;
use crate::model::SshSpec;
use crate::retry::{RetryPolicy, retry};
use crate::shell::ProcessRunner;

pub use orb::OrbLogin;
pub use ssh::SshPool;

/// Command and file transport to one instance address.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait RemoteExec {
    /// Run a shell command, returning stdout.
    async fn run(&self, target: &str, command: &str) -> Result<String, FleetError>;

    /// Copy a local file to `remote` on the target.
    async fn copy(&self, target: &str, local: &Path, remote: &str) -> Result<(), FleetError>;

    /// One cheap reachability check.
    async fn probe(&self, target: &str) -> Result<(), FleetError>;
}

/// Probe every target until it answers or the budget runs out.
pub async fn wait_ready<X: RemoteExec>(
    remote: &X,
    targets: &[String],
    policy: &RetryPolicy,
    limit: usize,
) -> Result<(), AggregateError> {
    let tasks = targets.iter().map(|t| {
        let task = async move { retry(policy, t, |_| remote.probe(t)).await };
        (t.clone(), task)
    });
    fan_out(limit, tasks).await.into_result().map(|_| ())
}

// ── AnyRemote ─────────────────────────────────────────────

/// Transport matching the cluster's backend.
pub enum AnyRemote {
    Ssh(SshPool),
    Orb(OrbLogin<ProcessRunner>),
}

impl AnyRemote {
    pub fn new(kind: ProviderKind, ssh: &SshSpec, settings: &Settings, runner: ProcessRunner) -> Self {
        match kind {
            ProviderKind::Multipass => AnyRemote::Ssh(SshPool::new(
                &settings.ssh.user,
                settings.ssh.port,
                Path::new(&ssh.pk_file),
                Some(ssh.pk_passwd.as_str()).filter(|p| !p.is_empty()),
            )),
            ProviderKind::Orb => AnyRemote::Orb(OrbLogin::new(runner, &settings.ssh.user)),
        }
    }
}

impl RemoteExec for AnyRemote {
    async fn run(&self, target: &str, command: &str) -> Result<String, FleetError> {
        match self {
            AnyRemote::Ssh(r) => r.run(target, command).await,
            AnyRemote::Orb(r) => r.run(target, command).await,
        }
    }

    async fn copy(&self, target: &str, local: &Path, remote: &str) -> Result<(), FleetError> {
        match self {
            AnyRemote::Ssh(r) => r.copy(target, local, remote).await,
            AnyRemote::Orb(r) => r.copy(target, local, remote).await,
        }
    }

    async fn probe(&self, target: &str) -> Result<(), FleetError> {
        match self {
            AnyRemote::Ssh(r) => r.probe(target).await,
            AnyRemote::Orb(r) => r.probe(target).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::StubRemote;
    use super::*;

    #[tokio::test]
    async fn ready_after_retry() {
        let remote = StubRemote::default();
        remote.flaky.lock().unwrap().insert("10.0.0.1".into());
        let targets = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        wait_ready(&remote, &targets, &RetryPolicy::fixed(3, Duration::ZERO), 4)
            .await
            .unwrap();
        let probes = remote.calls().iter().filter(|c| c.as_str() == "probe 10.0.0.1").count();
        assert_eq!(probes, 2);
    }

    #[tokio::test]
    async fn unreachable_targets_are_named() {
        let remote = StubRemote::with_down(&["10.0.0.2"]);
        let targets = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let err = wait_ready(&remote, &targets, &RetryPolicy::fixed(2, Duration::ZERO), 4)
            .await
            .unwrap_err();
        assert_eq!(err.targets().collect::<Vec<_>>(), ["10.0.0.2"]);
        let probes = remote.calls().iter().filter(|c| c.as_str() == "probe 10.0.0.2").count();
        assert_eq!(probes, 2);
    }
}
