use std::collections::BTreeSet;

use crate::model::VirtualMachine;

/// Instances to create and to remove, both sorted and duplicate-free.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub add: Vec<String>,
    pub delete: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.delete.is_empty()
    }
}

fn expand(vm: &VirtualMachine) -> BTreeSet<String> {
    vm.instances().into_iter().map(|(id, _, _)| id).collect()
}

/// Set difference between the desired and current topologies.
pub fn diff(current: Option<&VirtualMachine>, desired: &VirtualMachine) -> Diff {
    let want = expand(desired);
    let have = current.map(expand).unwrap_or_default();
    Diff {
        add: want.difference(&have).cloned().collect(),
        delete: have.difference(&want).cloned().collect(),
    }
}
