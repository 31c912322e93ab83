//! Staged reconciliation of one cluster object.
//!
//! A pipeline is a fixed list of steps chosen from the object's timestamps.
//! Every step records one condition; a failing step never aborts the run,
//! and only `FinalStatus` decides the object's phase.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cloudinit::{ConfigRenderer, RenderInput};
use crate::config::TimingConfig;
use crate::diff;
use crate::error::{AggregateError, FleetError};
use crate::fanout::fan_out;
use crate::identity;
use crate::model::{Condition, Host, HostStatus, Phase, VirtualMachine};
use crate::paths;
use crate::progress::StageProgress;
use crate::provider::Provider;
use crate::remote::{RemoteExec, wait_ready};
use crate::retry::{RetryPolicy, retry};

// ── condition types and reasons ──────────────────────────

pub const COND_INITIALIZED: &str = "Initialized";
pub const COND_CONFIG: &str = "Config";
pub const COND_INIT_VMS: &str = "InitVMs";
pub const COND_APPLY_VMS: &str = "ApplyVMs";
pub const COND_MOUNTS: &str = "MountsVMs";
pub const COND_SYNC: &str = "SyncVMs";
pub const COND_PING: &str = "PingVms";
pub const COND_READY: &str = "Ready";
pub const COND_DELETE: &str = "DeleteVMs";

const REASON_CONFIG: &str = "ConfigGenerateError";
const REASON_CREATE: &str = "CreateVMError";
const REASON_APPLY: &str = "ApplyVMsError";
const REASON_DELETE: &str = "DeleteVMsError";
const REASON_STATUS: &str = "VMStatus";
const REASON_PING: &str = "PingVMs";
const REASON_MOUNT: &str = "MountVMsError";
const REASON_NOT_READY: &str = "NotReady";

// ── pipelines ────────────────────────────────────────────

/// One stage of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InitStatus,
    ApplyConfig,
    CreateVMs,
    ApplyVMs,
    MountsVMs,
    SyncVMs,
    PingVms,
    FinalStatus,
    DeleteVMs,
}

impl Step {
    pub fn label(self) -> &'static str {
        match self {
            Step::InitStatus => "InitStatus",
            Step::ApplyConfig => "ApplyConfig",
            Step::CreateVMs => "CreateVMs",
            Step::ApplyVMs => "ApplyVMs",
            Step::MountsVMs => "MountsVMs",
            Step::SyncVMs => "SyncVMs",
            Step::PingVms => "PingVms",
            Step::FinalStatus => "FinalStatus",
            Step::DeleteVMs => "DeleteVMs",
        }
    }
}

/// Which pipeline a run went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Initial,
    Reconcile,
    Delete,
}

impl Pipeline {
    pub fn select(vm: &VirtualMachine) -> Self {
        if vm.is_deleting() {
            Pipeline::Delete
        } else if vm.is_created() {
            Pipeline::Reconcile
        } else {
            Pipeline::Initial
        }
    }

    pub fn steps(self) -> &'static [Step] {
        match self {
            Pipeline::Initial => &[
                Step::InitStatus,
                Step::ApplyConfig,
                Step::CreateVMs,
                Step::MountsVMs,
                Step::SyncVMs,
                Step::PingVms,
                Step::FinalStatus,
            ],
            Pipeline::Reconcile => &[
                Step::InitStatus,
                Step::ApplyConfig,
                Step::ApplyVMs,
                Step::SyncVMs,
                Step::PingVms,
                Step::FinalStatus,
            ],
            Pipeline::Delete => &[Step::InitStatus, Step::DeleteVMs],
        }
    }
}

// ── Reconciler ───────────────────────────────────────────

/// Drives one cluster object through its pipeline.
pub struct Reconciler<'a, P, X> {
    provider: &'a P,
    remote: &'a X,
    renderer: &'a dyn ConfigRenderer,
    root: &'a Path,
    timing: &'a TimingConfig,
}

/// Condition types recorded during the current run.
struct Ledger {
    recorded: BTreeSet<&'static str>,
}

impl Ledger {
    fn all_true(&self, vm: &VirtualMachine) -> bool {
        self.recorded
            .iter()
            .all(|kind| vm.status.condition(kind).is_some_and(Condition::is_true))
    }

    fn failing(&self, vm: &VirtualMachine) -> Vec<&'static str> {
        self.recorded
            .iter()
            .copied()
            .filter(|kind| !vm.status.condition(kind).is_some_and(Condition::is_true))
            .collect()
    }
}

enum Op {
    Create(Host, u32),
    Delete(HostStatus),
}

impl<'a, P: Provider, X: RemoteExec> Reconciler<'a, P, X> {
    pub fn new(
        provider: &'a P,
        remote: &'a X,
        renderer: &'a dyn ConfigRenderer,
        root: &'a Path,
        timing: &'a TimingConfig,
    ) -> Self {
        Self {
            provider,
            remote,
            renderer,
            root,
            timing,
        }
    }

    /// Run the pipeline matching the object's timestamps.
    ///
    /// `current` is the object as last persisted; the reconcile pipeline
    /// diffs against it. Stage failures land in the condition log, never in
    /// the return value.
    pub async fn run(
        &self,
        vm: &mut VirtualMachine,
        current: Option<&VirtualMachine>,
        progress: &mut StageProgress,
    ) -> Pipeline {
        let pipeline = Pipeline::select(vm);
        let steps = pipeline.steps();
        tracing::info!(cluster = vm.name(), ?pipeline, "reconciling");

        let mut ledger = Ledger {
            recorded: BTreeSet::new(),
        };
        progress.start(steps.len());
        for &step in steps {
            let stage = progress.begin(step.label());
            let condition = match step {
                Step::InitStatus => Some(self.init_status(vm, pipeline)),
                Step::ApplyConfig => Some(self.apply_config(vm)),
                Step::CreateVMs => Some(self.create_vms(vm).await),
                Step::ApplyVMs => Some(self.apply_vms(vm, current).await),
                Step::MountsVMs if !ledger.all_true(vm) => None,
                Step::MountsVMs => Some(self.mount_vms(vm).await),
                Step::SyncVMs => Some(self.sync_vms(vm).await),
                Step::PingVms if !ledger.all_true(vm) => None,
                Step::PingVms => Some(self.ping_vms(vm).await),
                Step::FinalStatus => Some(self.final_status(vm, &ledger)),
                Step::DeleteVMs => Some(self.delete_vms(vm).await),
            };

            match condition {
                Some(condition) => {
                    if !condition.is_true() {
                        tracing::warn!(
                            step = step.label(),
                            reason = %condition.reason,
                            message = %condition.message,
                            "stage failed"
                        );
                    }
                    stage.finish(&condition);
                    if step != Step::FinalStatus {
                        ledger.recorded.insert(kind_of(step));
                    }
                    vm.status.set_condition(condition);
                }
                None => {
                    tracing::warn!(step = step.label(), "skipped: earlier stages failed");
                    stage.skip(&format!("{}: skipped, earlier stages failed", step.label()));
                }
            }
        }
        pipeline
    }

    // ── stages ───────────────────────────────────────────

    fn init_status(&self, vm: &mut VirtualMachine, pipeline: Pipeline) -> Condition {
        vm.status.phase = Phase::InProcess;
        let message = match pipeline {
            Pipeline::Initial => "creating cluster",
            Pipeline::Reconcile => "reconciling cluster",
            Pipeline::Delete => "deleting cluster",
        };
        Condition::ok(COND_INITIALIZED, message)
    }

    fn apply_config(&self, vm: &VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_CONFIG, "cloud-config rendered");
        for host in vm.hosts_by_role() {
            let input = RenderInput {
                role: &host.role,
                proxy: &vm.spec.proxy,
                no_proxy: &vm.spec.no_proxy,
                public_key: Path::new(&vm.spec.ssh.public_file),
                private_key: Path::new(&vm.spec.ssh.pk_file),
            };
            let out = paths::cloud_config(self.root, vm.name(), &host.role);
            if let Err(e) = self.renderer.render(&input, &out) {
                cond.fail(REASON_CONFIG, format!("role {}: {e}", host.role));
                break;
            }
        }
        cond
    }

    async fn create_vms(&self, vm: &VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_INIT_VMS, "instances created");
        let templates = templates(vm);
        let counter = AtomicU32::new(0);
        let stagger = self.timing.create_stagger();
        let cluster = vm.name();

        let tasks = vm.instances().into_iter().map(|(id, role, index)| {
            let host = templates.get(&role);
            let counter = &counter;
            let task = async move {
                let Some(host) = host else {
                    return Err(missing_template(&role));
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(stagger * n).await;
                self.provider.create_vm(cluster, host, index).await
            };
            (id, task)
        });

        if let Err(e) = fan_out(self.timing.max_parallel, tasks).await.into_result() {
            cond.fail(REASON_CREATE, e.to_string());
        }
        cond
    }

    async fn apply_vms(
        &self,
        vm: &mut VirtualMachine,
        current: Option<&VirtualMachine>,
    ) -> Condition {
        let mut cond = Condition::ok(COND_APPLY_VMS, "");
        let plan = diff::diff(current, vm);
        let desired: BTreeSet<String> = vm.instances().into_iter().map(|(id, _, _)| id).collect();

        // desired instances the last sync never observed are created again,
        // which repairs partial failures from earlier runs
        let recorded: &[HostStatus] = current.map(|c| c.status.hosts.as_slice()).unwrap_or_default();
        let mut add: BTreeSet<String> = plan.add.iter().cloned().collect();
        add.extend(
            desired
                .iter()
                .filter(|id| !recorded.iter().any(|h| &h.id == *id))
                .cloned(),
        );

        // likewise, recorded instances no longer desired are deleted again
        let mut ops: Vec<(String, Result<Op, FleetError>)> = Vec::new();
        let mut delete: BTreeMap<String, HostStatus> = BTreeMap::new();
        for id in &plan.delete {
            match identity::parse_id(id) {
                Some((_, role, index)) => {
                    let status = recorded
                        .iter()
                        .find(|h| h.role == role && h.index == index)
                        .cloned()
                        .unwrap_or(HostStatus {
                            id: id.clone(),
                            role,
                            index,
                            ..HostStatus::default()
                        });
                    delete.insert(id.clone(), status);
                }
                None => ops.push((id.clone(), Err(malformed_id(id)))),
            }
        }
        for host in recorded.iter().filter(|h| !desired.contains(&h.id)) {
            delete.entry(host.id.clone()).or_insert_with(|| host.clone());
        }

        let templates = templates(vm);
        for id in &add {
            let op = match identity::parse_id(id) {
                Some((_, role, index)) => match templates.get(&role) {
                    Some(host) => Ok(Op::Create(host.clone(), index)),
                    None => Err(missing_template(&role)),
                },
                None => Err(malformed_id(id)),
            };
            ops.push((id.clone(), op));
        }
        for (id, status) in &delete {
            ops.push((id.clone(), Ok(Op::Delete(status.clone()))));
        }

        if ops.is_empty() {
            cond.message = "nothing to change".into();
            return cond;
        }
        cond.message = format!("{} to add, {} to delete", add.len(), delete.len());
        tracing::info!(add = add.len(), delete = delete.len(), "applying topology change");

        let stagger = self.timing.apply_stagger();
        let cluster = vm.name();
        let tasks = ops.into_iter().map(|(id, op)| {
            let task = async move {
                match op? {
                    Op::Create(host, index) => {
                        tokio::time::sleep(stagger * index).await;
                        self.provider.create_vm(cluster, &host, index).await
                    }
                    Op::Delete(status) => {
                        tokio::time::sleep(stagger * status.index).await;
                        self.provider.delete_vm(cluster, &status).await
                    }
                }
            };
            (id, task)
        });
        let outcome = fan_out(self.timing.max_parallel, tasks).await;

        // an instance whose delete failed stays recorded so the next run or
        // a reset retries it
        let undeleted: Vec<HostStatus> = outcome
            .failed
            .iter()
            .filter_map(|f| delete.get(&f.target).cloned())
            .collect();
        vm.status.hosts.retain(|h| desired.contains(&h.id));
        vm.status.hosts.extend(undeleted);

        if let Err(e) = outcome.into_result() {
            cond.fail(REASON_APPLY, e.to_string());
        }
        cond
    }

    async fn mount_vms(&self, vm: &VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_MOUNTS, "");
        let templates = templates(vm);
        let tasks = vm
            .instances()
            .into_iter()
            .filter_map(|(id, role, _)| {
                let host = templates.get(&role)?;
                (!host.mounts.is_empty()).then_some((id, host))
            })
            .map(|(id, host)| {
                let task_id = id.clone();
                let task = async move {
                    for (source, dest) in &host.mounts {
                        self.provider.mount(&task_id, source, dest).await?;
                    }
                    Ok::<_, FleetError>(host.mounts.len())
                };
                (id, task)
            });

        match fan_out(self.timing.max_parallel, tasks).await.into_result() {
            Ok(done) => {
                let total: usize = done.iter().map(|(_, n)| n).sum();
                cond.message = format!("{total} mount(s) applied");
            }
            Err(e) => cond.fail(REASON_MOUNT, e.to_string()),
        }
        cond
    }

    async fn sync_vms(&self, vm: &mut VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_SYNC, "");
        let templates = templates(vm);
        let cluster = vm.name().to_string();
        let policy = self.timing.sync_retry();

        let tasks = vm.instances().into_iter().map(|(id, role, index)| {
            let host = templates.get(&role);
            let cluster = cluster.as_str();
            let policy = &policy;
            let task_id = id.clone();
            let task = async move {
                let Some(host) = host else {
                    return Err(missing_template(&role));
                };
                self.sync_one(cluster, &task_id, host, index, policy).await
            };
            (id, task)
        });
        let outcome = fan_out(self.timing.max_parallel, tasks).await;

        let mut problems: Vec<String> = outcome
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.target, f.error))
            .collect();
        problems.extend(
            outcome
                .succeeded
                .iter()
                .filter(|(_, st)| !st.is_running())
                .map(|(id, st)| format!("{id}: state {}", st.state)),
        );

        let synced = outcome.succeeded.len();
        let desired: BTreeSet<String> = vm.instances().into_iter().map(|(id, _, _)| id).collect();
        let undeleted: Vec<HostStatus> = vm
            .status
            .hosts
            .iter()
            .filter(|h| !desired.contains(&h.id))
            .cloned()
            .collect();
        vm.status.hosts = outcome.succeeded.into_iter().map(|(_, st)| st).collect();
        vm.status.hosts.extend(undeleted);

        if problems.is_empty() {
            cond.message = format!("{synced} instance(s) running");
        } else {
            cond.fail(REASON_STATUS, problems.join("; "));
        }
        cond
    }

    /// Inspect until running or out of budget. A non-running instance that
    /// never comes up is returned as last seen.
    async fn sync_one(
        &self,
        cluster: &str,
        id: &str,
        host: &Host,
        index: u32,
        policy: &RetryPolicy,
    ) -> Result<HostStatus, FleetError> {
        let last = tokio::sync::Mutex::new(None::<HostStatus>);
        let seen = &last;
        let outcome = retry(policy, id, |_| async move {
            let status = match self.provider.inspect(cluster, host, index).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "inspect failed, trying listing");
                    self.provider.inspect_by_list(cluster, host, index).await?
                }
            };
            if status.is_running() {
                return Ok(status);
            }
            let message = format!("state {}", status.state);
            *seen.lock().await = Some(status);
            Err(FleetError::Unready {
                id: id.to_string(),
                message,
            })
        })
        .await;

        match outcome {
            Ok(status) => Ok(status),
            Err(e @ FleetError::Unready { .. }) => last.into_inner().ok_or(e),
            Err(e) => Err(e),
        }
    }

    async fn ping_vms(&self, vm: &VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_PING, "");
        let mut problems = Vec::new();
        let mut targets = Vec::new();
        for host in &vm.status.hosts {
            if !host.is_running() {
                problems.push(format!("{}: skipped, state {}", host.id, host.state));
                continue;
            }
            match host.primary_ip() {
                Some(ip) => targets.push(ip.to_string()),
                None => problems.push(format!("{}: no address", host.id)),
            }
        }

        if let Err(e) = wait_ready(
            self.remote,
            &targets,
            &self.timing.ready_retry(),
            self.timing.max_parallel,
        )
        .await
        {
            problems.push(e.to_string());
        }

        if problems.is_empty() {
            cond.message = format!("{} instance(s) reachable", targets.len());
        } else {
            cond.fail(REASON_PING, problems.join("; "));
        }
        cond
    }

    fn final_status(&self, vm: &mut VirtualMachine, ledger: &Ledger) -> Condition {
        let failing = ledger.failing(vm);
        let mut cond = Condition::ok(COND_READY, "all stages passed");
        if failing.is_empty() {
            vm.status.phase = Phase::Success;
        } else {
            vm.status.phase = Phase::Failed;
            cond.fail(REASON_NOT_READY, format!("failed: {}", failing.join(", ")));
        }
        tracing::info!(cluster = vm.name(), phase = ?vm.status.phase, "reconcile finished");
        cond
    }

    async fn delete_vms(&self, vm: &mut VirtualMachine) -> Condition {
        let mut cond = Condition::ok(COND_DELETE, "");
        let mut targets: Vec<HostStatus> = vm.status.hosts.clone();
        for (id, role, index) in vm.instances() {
            if vm.status.host_by_id(&id).is_none() {
                targets.push(HostStatus {
                    id,
                    role,
                    index,
                    ..HostStatus::default()
                });
            }
        }

        let cluster = vm.name().to_string();
        let tasks = targets.into_iter().map(|status| {
            let cluster = cluster.as_str();
            let id = status.id.clone();
            let task = async move { self.provider.delete_vm(cluster, &status).await };
            (id, task)
        });
        let outcome = fan_out(self.timing.max_parallel, tasks).await;

        let deleted: BTreeSet<String> = outcome.succeeded.iter().map(|(id, _)| id.clone()).collect();
        vm.status.hosts.retain(|h| !deleted.contains(&h.id));
        cond.message = format!("{} instance(s) deleted", deleted.len());

        if !outcome.failed.is_empty() {
            let err = AggregateError {
                failures: outcome.failed,
            };
            cond.fail(REASON_DELETE, err.to_string());
        }
        cond
    }
}

fn kind_of(step: Step) -> &'static str {
    match step {
        Step::InitStatus => COND_INITIALIZED,
        Step::ApplyConfig => COND_CONFIG,
        Step::CreateVMs => COND_INIT_VMS,
        Step::ApplyVMs => COND_APPLY_VMS,
        Step::MountsVMs => COND_MOUNTS,
        Step::SyncVMs => COND_SYNC,
        Step::PingVms => COND_PING,
        Step::FinalStatus => COND_READY,
        Step::DeleteVMs => COND_DELETE,
    }
}

fn templates(vm: &VirtualMachine) -> BTreeMap<String, Host> {
    vm.hosts_by_role()
        .into_iter()
        .map(|h| (h.role.clone(), h))
        .collect()
}

fn missing_template(role: &str) -> FleetError {
    FleetError::Configuration {
        message: format!("no host template for role '{role}'"),
    }
}

fn malformed_id(id: &str) -> FleetError {
    FleetError::Configuration {
        message: format!("cannot parse instance id '{id}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConditionStatus;
    use crate::provider::testing::StubProvider;
    use crate::remote::testing::StubRemote;

    struct StubRenderer;

    impl ConfigRenderer for StubRenderer {
        fn render(&self, input: &RenderInput<'_>, out: &Path) -> Result<(), FleetError> {
            std::fs::create_dir_all(out.parent().unwrap()).unwrap();
            std::fs::write(out, format!("#cloud-config\n# {}\n", input.role)).unwrap();
            Ok(())
        }
    }

    struct FailingRenderer;

    impl ConfigRenderer for FailingRenderer {
        fn render(&self, _: &RenderInput<'_>, _: &Path) -> Result<(), FleetError> {
            Err(FleetError::Configuration {
                message: "cannot read ssh key".into(),
            })
        }
    }

    fn cluster(name: &str, hosts: &[(&str, u32)]) -> VirtualMachine {
        let mut vm = VirtualMachine::new(name);
        vm.spec.hosts = hosts
            .iter()
            .map(|(role, count)| Host {
                role: role.to_string(),
                count: *count,
                ..Host::default()
            })
            .collect();
        vm
    }

    async fn run_with(
        provider: &StubProvider,
        remote: &StubRemote,
        renderer: &dyn ConfigRenderer,
        vm: &mut VirtualMachine,
        current: Option<&VirtualMachine>,
    ) -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        let timing = TimingConfig::immediate();
        let reconciler = Reconciler::new(provider, remote, renderer, dir.path(), &timing);
        reconciler.run(vm, current, &mut StageProgress::quiet()).await
    }

    fn status_of(vm: &VirtualMachine, kind: &str) -> ConditionStatus {
        vm.status.condition(kind).map(|c| c.status).unwrap_or_default()
    }

    #[test]
    fn pipeline_selection() {
        let mut vm = cluster("demo", &[("node", 1)]);
        assert_eq!(Pipeline::select(&vm), Pipeline::Initial);
        vm.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        assert_eq!(Pipeline::select(&vm), Pipeline::Reconcile);
        vm.metadata.deletion_timestamp = Some("2024-01-02T00:00:00Z".into());
        assert_eq!(Pipeline::select(&vm), Pipeline::Delete);
        assert_eq!(Pipeline::Delete.steps(), [Step::InitStatus, Step::DeleteVMs]);
    }

    #[tokio::test]
    async fn initial_pipeline_succeeds() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 2)]);

        let pipeline = run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        assert_eq!(pipeline, Pipeline::Initial);
        assert_eq!(vm.status.phase, Phase::Success);
        let ids: Vec<_> = vm.status.hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["demo-node-0", "demo-node-1"]);
        let kinds: Vec<_> = vm.status.conditions.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(
            kinds,
            ["Initialized", "Config", "InitVMs", "MountsVMs", "SyncVMs", "PingVms", "Ready"]
        );
        assert!(vm.status.conditions.iter().all(Condition::is_true));
        assert_eq!(remote.calls().iter().filter(|c| c.starts_with("probe")).count(), 2);
    }

    #[tokio::test]
    async fn one_failed_create_keeps_the_other() {
        let provider = StubProvider::failing(&["demo-node-1"]);
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 2)]);

        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        assert_eq!(vm.status.phase, Phase::Failed);
        assert_eq!(provider.launches(), ["demo-node-0"]);
        let created = vm.status.condition("InitVMs").unwrap();
        assert_eq!(created.status, ConditionStatus::False);
        assert_eq!(created.reason, "CreateVMError");
        assert!(created.message.contains("demo-node-1"));

        // the sibling that did launch is still recorded
        let ids: Vec<_> = vm.status.hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["demo-node-0"]);
        assert_eq!(status_of(&vm, "SyncVMs"), ConditionStatus::False);
        // later stages that need a healthy cluster were skipped
        assert!(vm.status.condition("MountsVMs").is_none());
        assert!(vm.status.condition("PingVms").is_none());
        assert_eq!(vm.status.condition("Ready").unwrap().reason, "NotReady");
    }

    #[tokio::test]
    async fn render_failure_fails_config_stage() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 1)]);

        run_with(&provider, &remote, &FailingRenderer, &mut vm, None).await;

        let config = vm.status.condition("Config").unwrap();
        assert_eq!(config.reason, "ConfigGenerateError");
        assert!(config.message.contains("role node"));
        assert_eq!(vm.status.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn mounts_are_applied_per_instance() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 2)]);
        vm.spec.hosts[0].mounts.insert("/src".into(), "/data".into());

        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        let mut mounts = provider.mounts.lock().unwrap().clone();
        mounts.sort();
        assert_eq!(mounts, ["demo-node-0 /src:/data", "demo-node-1 /src:/data"]);
        assert_eq!(vm.status.condition("MountsVMs").unwrap().message, "2 mount(s) applied");
    }

    #[tokio::test]
    async fn scale_applies_only_the_difference() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        let mut current = cluster("demo", &[("master", 1), ("node", 1)]);
        provider.seed("demo", "master", 0);
        provider.seed("demo", "node", 0);
        current.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        for (id, role) in [("demo-master-0", "master"), ("demo-node-0", "node")] {
            current.status.hosts.push(HostStatus {
                id: id.into(),
                role: role.into(),
                state: "Running".into(),
                ..HostStatus::default()
            });
        }

        let mut vm = current.clone();
        vm.spec.hosts = cluster("demo", &[("master", 3)]).spec.hosts;
        let pipeline = run_with(&provider, &remote, &StubRenderer, &mut vm, Some(&current)).await;

        assert_eq!(pipeline, Pipeline::Reconcile);
        assert_eq!(provider.launches(), ["demo-master-1", "demo-master-2"]);
        assert_eq!(provider.deletions(), ["demo-node-0"]);
        assert_eq!(provider.ids(), ["demo-master-0", "demo-master-1", "demo-master-2"]);
        assert_eq!(vm.status.condition("ApplyVMs").unwrap().message, "2 to add, 1 to delete");
        assert!(vm.status.condition("InitVMs").is_none());
        assert_eq!(vm.status.phase, Phase::Success);
        assert_eq!(vm.status.hosts.len(), 3);
    }

    #[tokio::test]
    async fn failed_scale_down_delete_is_retried() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        provider.seed("demo", "master", 0);
        provider.seed("demo", "node", 0);
        provider.fail_delete.lock().unwrap().insert("demo-node-0".into());
        let mut current = cluster("demo", &[("master", 1), ("node", 1)]);
        current.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        for (id, role) in [("demo-master-0", "master"), ("demo-node-0", "node")] {
            current.status.hosts.push(HostStatus {
                id: id.into(),
                role: role.into(),
                state: "Running".into(),
                ..HostStatus::default()
            });
        }

        let mut vm = current.clone();
        vm.spec.hosts = cluster("demo", &[("master", 1)]).spec.hosts;
        run_with(&provider, &remote, &StubRenderer, &mut vm, Some(&current)).await;

        let apply = vm.status.condition("ApplyVMs").unwrap();
        assert_eq!(apply.reason, "ApplyVMsError");
        assert!(apply.message.contains("demo-node-0"), "{}", apply.message);
        assert_eq!(vm.status.phase, Phase::Failed);
        let ids: Vec<_> = vm.status.hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["demo-master-0", "demo-node-0"]);

        // next run: the saved spec already says master:1, the leftover still goes
        provider.fail_delete.lock().unwrap().clear();
        let current = vm.clone();
        run_with(&provider, &remote, &StubRenderer, &mut vm, Some(&current)).await;

        assert_eq!(provider.deletions(), ["demo-node-0"]);
        assert_eq!(provider.ids(), ["demo-master-0"]);
        assert_eq!(vm.status.condition("ApplyVMs").unwrap().message, "0 to add, 1 to delete");
        assert_eq!(status_of(&vm, "ApplyVMs"), ConditionStatus::True);
        let ids: Vec<_> = vm.status.hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["demo-master-0"]);
        assert_eq!(vm.status.phase, Phase::Success);
    }

    #[tokio::test]
    async fn reset_reaches_instances_a_scale_down_left_behind() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        provider.seed("demo", "master", 0);
        provider.seed("demo", "node", 0);
        let mut vm = cluster("demo", &[("master", 1)]);
        vm.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        vm.metadata.deletion_timestamp = Some("2024-01-02T00:00:00Z".into());
        for (id, role) in [("demo-master-0", "master"), ("demo-node-0", "node")] {
            vm.status.hosts.push(HostStatus {
                id: id.into(),
                role: role.into(),
                ..HostStatus::default()
            });
        }
        provider.fail_delete.lock().unwrap().insert("demo-node-0".into());

        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        let delete = vm.status.condition("DeleteVMs").unwrap();
        assert_eq!(delete.reason, "DeleteVMsError");
        assert!(delete.message.contains("demo-node-0"), "{}", delete.message);
        let ids: Vec<_> = vm.status.hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["demo-node-0"]);

        provider.fail_delete.lock().unwrap().clear();
        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        assert!(vm.status.condition("DeleteVMs").unwrap().is_true());
        assert!(vm.status.hosts.is_empty());
        assert!(provider.ids().is_empty());
    }

    #[tokio::test]
    async fn reconcile_recreates_unobserved_instances() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        provider.seed("demo", "node", 0);
        let mut current = cluster("demo", &[("node", 2)]);
        current.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        current.status.hosts.push(HostStatus {
            id: "demo-node-0".into(),
            role: "node".into(),
            state: "Running".into(),
            ..HostStatus::default()
        });

        let mut vm = current.clone();
        run_with(&provider, &remote, &StubRenderer, &mut vm, Some(&current)).await;

        assert_eq!(provider.launches(), ["demo-node-1"]);
        assert_eq!(vm.status.phase, Phase::Success);
    }

    #[tokio::test]
    async fn stale_failure_does_not_pin_the_cluster() {
        let provider = StubProvider::default();
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 1)]);
        let mut stale = Condition::ok("InitVMs", "");
        stale.fail("CreateVMError", "from an earlier run");
        vm.status.conditions.push(stale);
        vm.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        let current = vm.clone();

        run_with(&provider, &remote, &StubRenderer, &mut vm, Some(&current)).await;

        assert_eq!(vm.status.phase, Phase::Success);
        assert_eq!(status_of(&vm, "InitVMs"), ConditionStatus::False);
    }

    #[tokio::test]
    async fn stopped_instance_fails_sync() {
        let mut provider = StubProvider::default();
        provider.stopped.insert("demo-node-0".into());
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 1)]);

        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        let sync = vm.status.condition("SyncVMs").unwrap();
        assert_eq!(sync.reason, "VMStatus");
        assert!(sync.message.contains("state Stopped"), "{}", sync.message);
        assert_eq!(vm.status.hosts[0].state, "Stopped");
        assert!(vm.status.condition("PingVms").is_none());
        assert_eq!(vm.status.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn unreachable_instance_fails_ping() {
        let provider = StubProvider::default();
        // the stub hands out 192.168.64.10 to the first launch
        let remote = StubRemote::with_down(&["192.168.64.10"]);
        let mut vm = cluster("demo", &[("node", 1)]);

        run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        let ping = vm.status.condition("PingVms").unwrap();
        assert_eq!(ping.reason, "PingVMs");
        assert!(ping.message.contains("192.168.64.10"));
        assert_eq!(vm.status.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn delete_removes_status_and_spec_instances() {
        let provider = StubProvider::default();
        provider.seed("demo", "node", 0);
        provider.seed("demo", "node", 1);
        let remote = StubRemote::default();
        let mut vm = cluster("demo", &[("node", 2)]);
        vm.metadata.creation_timestamp = Some("2024-01-01T00:00:00Z".into());
        vm.metadata.deletion_timestamp = Some("2024-01-02T00:00:00Z".into());
        vm.status.phase = Phase::Success;
        vm.status.hosts.push(HostStatus {
            id: "demo-node-0".into(),
            role: "node".into(),
            ..HostStatus::default()
        });

        let pipeline = run_with(&provider, &remote, &StubRenderer, &mut vm, None).await;

        assert_eq!(pipeline, Pipeline::Delete);
        assert_eq!(provider.deletions(), ["demo-node-0", "demo-node-1"]);
        assert!(provider.ids().is_empty());
        assert!(vm.status.hosts.is_empty());
        assert!(vm.status.condition("DeleteVMs").unwrap().is_true());
        assert_eq!(vm.status.phase, Phase::InProcess);
    }
}
