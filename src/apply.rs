//! One `run` or `reset`: lock, load, merge, reconcile, persist.

use std::path::{Path, PathBuf};

use crate::args::{self, Desired};
use crate::config::{ProviderKind, Settings};
use crate::error::FleetError;
use crate::model::VirtualMachine;
use crate::progress::StageProgress;
use crate::provider::Provider;
use crate::reconcile::{Pipeline, Reconciler};
use crate::remote::RemoteExec;
use crate::store::{self, ClusterLock};
use crate::util;

/// A merged, validated object ready to be reconciled. Holds the cluster lock.
pub struct Plan {
    pub vm: VirtualMachine,
    /// The object as it was on disk before this invocation.
    pub current: Option<VirtualMachine>,
    _lock: ClusterLock,
}

impl Plan {
    /// Backend recorded in the merged spec.
    pub fn provider_kind(&self) -> Result<ProviderKind, FleetError> {
        self.vm.spec.provider.parse()
    }
}

/// What a finished run left behind.
#[derive(Debug)]
pub struct Applied {
    pub vm: VirtualMachine,
    pub pipeline: Pipeline,
    pub state_path: PathBuf,
    pub archived: Option<PathBuf>,
}

/// Lock the cluster, merge `desired` over the saved object and validate.
pub fn plan(
    root: &Path,
    desired: impl Into<Desired>,
    settings: &Settings,
) -> Result<Plan, FleetError> {
    let desired: Desired = desired.into();
    let lock = store::lock(root, desired.name())?;
    let loaded = store::load(root, desired.name())?;

    if desired.vm.is_deleting() && loaded.is_none() {
        return Err(FleetError::Configuration {
            message: format!("cluster {} does not exist", desired.name()),
        });
    }

    let current = loaded.clone();
    let mut vm = args::merge(loaded, desired);
    args::fill_defaults(&mut vm, settings);

    if vm.is_deleting() {
        if vm.metadata.creation_timestamp.is_none() {
            vm.metadata.creation_timestamp = vm.metadata.deletion_timestamp.clone();
        }
    } else {
        args::validate(&vm)?;
    }

    Ok(Plan {
        vm,
        current,
        _lock: lock,
    })
}

/// Run the pipeline and persist the outcome. Stage failures are recorded in
/// the saved object; only persistence errors come back as `Err`.
pub async fn execute<P: Provider, X: RemoteExec>(
    root: &Path,
    plan: Plan,
    reconciler: &Reconciler<'_, P, X>,
    progress: &mut StageProgress,
) -> Result<Applied, FleetError> {
    let Plan {
        mut vm,
        current,
        _lock,
    } = plan;

    let pipeline = reconciler.run(&mut vm, current.as_ref(), progress).await;
    if pipeline == Pipeline::Initial {
        vm.metadata.creation_timestamp = Some(util::utc_now_rfc3339());
    }

    let state_path = store::save(root, &vm)?;
    let archived = if vm.is_deleting() {
        Some(store::archive(root, vm.name())?)
    } else {
        None
    };

    Ok(Applied {
        vm,
        pipeline,
        state_path,
        archived,
    })
}
