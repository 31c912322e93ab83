//! Fan a command or a file out to a selected set of instances.

use std::path::Path;

use crate::config::TimingConfig;
use crate::error::FleetError;
use crate::fanout::fan_out;
use crate::model::Status;
use crate::remote::{RemoteExec, wait_ready};

/// Which instances a command goes to. Hostnames win over IPs, IPs over
/// roles; an empty selector means every instance.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub roles: Vec<String>,
    pub ips: Vec<String>,
    pub hostnames: Vec<String>,
}

/// Resolve a selector to target addresses, in status order without repeats.
pub fn resolve(status: &Status, selector: &Selector) -> Result<Vec<String>, FleetError> {
    let mut targets: Vec<String> = Vec::new();
    if !selector.hostnames.is_empty() {
        for name in &selector.hostnames {
            let host = status
                .host_by_id(name)
                .ok_or_else(|| FleetError::NotFound { id: name.clone() })?;
            let ip = host.primary_ip().ok_or_else(|| FleetError::Unready {
                id: name.clone(),
                message: "no address recorded".into(),
            })?;
            targets.push(ip.to_string());
        }
    } else if !selector.ips.is_empty() {
        targets = selector.ips.clone();
    } else {
        targets = status
            .hosts
            .iter()
            .filter(|h| selector.roles.is_empty() || selector.roles.contains(&h.role))
            .filter_map(|h| h.primary_ip().map(str::to_string))
            .collect();
    }

    let mut seen = std::collections::BTreeSet::new();
    targets.retain(|t| seen.insert(t.clone()));
    if targets.is_empty() {
        return Err(FleetError::Configuration {
            message: "no instances match the selection".into(),
        });
    }
    Ok(targets)
}

/// Run `command` on every target once all of them answer a probe.
/// Returns stdout per target in target order.
pub async fn run_command<X: RemoteExec>(
    remote: &X,
    targets: &[String],
    command: &str,
    timing: &TimingConfig,
) -> Result<Vec<(String, String)>, FleetError> {
    wait_ready(remote, targets, &timing.ready_retry(), timing.max_parallel).await?;
    tracing::info!(targets = targets.len(), command, "running remote command");
    let tasks = targets
        .iter()
        .map(|t| (t.clone(), remote.run(t, command)));
    Ok(fan_out(timing.max_parallel, tasks).await.into_result()?)
}

/// Copy `local` to `dest` on every target.
pub async fn copy_file<X: RemoteExec>(
    remote: &X,
    targets: &[String],
    local: &Path,
    dest: &str,
    timing: &TimingConfig,
) -> Result<(), FleetError> {
    if !local.is_file() {
        return Err(FleetError::Configuration {
            message: format!("{} is not a file", local.display()),
        });
    }
    wait_ready(remote, targets, &timing.ready_retry(), timing.max_parallel).await?;
    tracing::info!(targets = targets.len(), src = %local.display(), dest, "copying file");
    let tasks = targets
        .iter()
        .map(|t| (t.clone(), remote.copy(t, local, dest)));
    fan_out(timing.max_parallel, tasks).await.into_result()?;
    Ok(())
}
