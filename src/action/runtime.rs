use std::collections::BTreeSet;
use std::path::Path;

use super::{Action, ActionPhase, ActionStep};
use crate::config::TimingConfig;
use crate::distribute;
use crate::error::{AggregateError, FleetError, TargetFailure};
use crate::fanout::fan_out;
use crate::identity;
use crate::model::VirtualMachine;
use crate::paths;
use crate::provider::Provider;
use crate::remote::RemoteExec;

/// Applies action documents to the instances of one cluster.
pub struct ActionRuntime<'a, P, X> {
    provider: &'a P,
    remote: &'a X,
    vm: &'a VirtualMachine,
    root: &'a Path,
    timing: &'a TimingConfig,
}

/// Instances an action resolved to.
#[derive(Debug, Default)]
struct Targets {
    ids: Vec<String>,
    ips: Vec<String>,
}

impl<'a, P: Provider, X: RemoteExec> ActionRuntime<'a, P, X> {
    pub fn new(
        provider: &'a P,
        remote: &'a X,
        vm: &'a VirtualMachine,
        root: &'a Path,
        timing: &'a TimingConfig,
    ) -> Self {
        Self {
            provider,
            remote,
            vm,
            root,
            timing,
        }
    }

    /// Apply every document in order; a failed document does not stop the
    /// next one. Each document's status is updated in place.
    pub async fn apply_all(&self, actions: &mut [Action]) -> Result<(), AggregateError> {
        let mut failures = Vec::new();
        for (i, action) in actions.iter_mut().enumerate() {
            if let Err(error) = self.apply(action).await {
                tracing::error!(action = i, %error, "action failed");
                failures.push(TargetFailure {
                    target: format!("action[{i}]"),
                    error,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { failures })
        }
    }

    /// Run one document. The first failing step marks it Failed and skips
    /// the rest of its steps.
    pub async fn apply(&self, action: &mut Action) -> Result<(), FleetError> {
        action.status.phase = ActionPhase::InProcess;
        action.status.message.clear();

        match self.run_steps(action).await {
            Ok(message) => {
                action.status.phase = ActionPhase::Complete;
                action.status.message = message;
                Ok(())
            }
            Err(e) => {
                action.status.phase = ActionPhase::Failed;
                action.status.message = e.to_string();
                Err(e)
            }
        }
    }

    async fn run_steps(&self, action: &Action) -> Result<String, FleetError> {
        let targets = self.resolve(action)?;
        if targets.ids.is_empty() {
            tracing::warn!("action matches no instances");
            return Ok("no matching instances".into());
        }
        tracing::info!(targets = ?targets.ids, "applying action");

        let steps = action.steps();
        for step in &steps {
            tracing::debug!(step = step.name(), "running action step");
            self.run_step(step, &targets).await?;
        }
        Ok(format!(
            "{} step(s) on {} instance(s)",
            steps.len(),
            targets.ids.len()
        ))
    }

    /// Identities named by `ons`, sorted and deduplicated, each mapped to its
    /// primary address.
    fn resolve(&self, action: &Action) -> Result<Targets, FleetError> {
        let mut ids = BTreeSet::new();
        for on in &action.spec.ons {
            if on.indexes.is_empty() {
                let count = self.vm.host_template(&on.role).map_or(0, |h| h.count);
                ids.extend((0..count).map(|i| identity::make_id(self.vm.name(), &on.role, i)));
            } else {
                ids.extend(
                    on.indexes
                        .iter()
                        .map(|&i| identity::make_id(self.vm.name(), &on.role, i)),
                );
            }
        }

        let mut targets = Targets::default();
        for id in ids {
            let ip = self
                .vm
                .status
                .host_by_id(&id)
                .and_then(|h| h.primary_ip())
                .ok_or_else(|| FleetError::NotFound { id: id.clone() })?;
            targets.ips.push(ip.to_string());
            targets.ids.push(id);
        }
        Ok(targets)
    }

    async fn run_step(&self, step: &ActionStep, targets: &Targets) -> Result<(), FleetError> {
        match step {
            ActionStep::Mount { source, target } => {
                require(step, &[source, target])?;
                let tasks = targets.ids.iter().map(|id| {
                    (id.clone(), self.provider.mount(id, source, target))
                });
                fan_out(self.timing.max_parallel, tasks).await.into_result()?;
            }
            ActionStep::Unmount { target } => {
                let tasks = targets
                    .ids
                    .iter()
                    .map(|id| (id.clone(), self.provider.unmount(id, target)));
                fan_out(self.timing.max_parallel, tasks).await.into_result()?;
            }
            ActionStep::Exec { command } => {
                distribute::run_command(self.remote, &targets.ips, command, self.timing).await?;
            }
            ActionStep::Copy { source, target } => {
                require(step, &[source, target])?;
                distribute::copy_file(self.remote, &targets.ips, Path::new(source), target, self.timing)
                    .await?;
            }
            ActionStep::CopyContent { content, target } => {
                require(step, &[target])?;
                self.copy_content(content, target, targets).await?;
            }
        }
        Ok(())
    }

    async fn copy_content(&self, content: &str, target: &str, targets: &Targets) -> Result<(), FleetError> {
        let tmp = paths::tmp_dir(self.root);
        let io = |context: String| move |source: std::io::Error| FleetError::Io { context, source };
        std::fs::create_dir_all(&tmp).map_err(io(format!("creating {}", tmp.display())))?;
        let dir = tempfile::Builder::new()
            .prefix("action-")
            .tempdir_in(&tmp)
            .map_err(io(format!("creating temp dir in {}", tmp.display())))?;
        let file = dir.path().join("action-content");
        std::fs::write(&file, content).map_err(io(format!("writing {}", file.display())))?;
        distribute::copy_file(self.remote, &targets.ips, &file, target, self.timing).await
    }
}

fn require(step: &ActionStep, fields: &[&String]) -> Result<(), FleetError> {
    if fields.iter().any(|f| f.is_empty()) {
        return Err(FleetError::Configuration {
            message: format!("{} step has an empty source or target", step.name()),
        });
    }
    Ok(())
}
