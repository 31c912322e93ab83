//! The persisted cluster object and everything hanging off it.
//!
//! `VirtualMachine` is the only root: hosts, statuses and conditions have no
//! lifecycle outside it. Wire names are camelCase.

use std::collections::BTreeMap;

use facet::Facet;

use crate::identity;
use crate::util;

pub const API_VERSION: &str = "vmfleet/v1";
pub const KIND: &str = "VirtualMachine";

pub const ROLE_MASTER: &str = "master";
pub const ROLE_NODE: &str = "node";
pub const ROLE_DEV: &str = "dev";

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_DISK: &str = "disk";

// ── VirtualMachine ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[facet(default)]
    pub kind: String,
    #[facet(default)]
    pub api_version: String,
    #[facet(default)]
    pub metadata: Metadata,
    #[facet(default)]
    pub spec: Spec,
    #[facet(default)]
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Metadata {
    #[facet(default)]
    pub name: String,
    /// RFC 3339; `None` until the initial pipeline has run.
    #[facet(default)]
    pub creation_timestamp: Option<String>,
    /// RFC 3339; set by `reset`.
    #[facet(default)]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Spec {
    #[facet(default)]
    pub hosts: Vec<Host>,
    #[facet(default)]
    pub ssh: SshSpec,
    /// Backend name (`multipass` or `orb`); empty means the configured default.
    #[facet(default)]
    pub provider: String,
    #[facet(default)]
    pub proxy: String,
    #[facet(default)]
    pub no_proxy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct SshSpec {
    #[facet(default)]
    pub public_file: String,
    #[facet(default)]
    pub pk_file: String,
    #[facet(default)]
    pub pk_passwd: String,
}

/// Desired template for every instance of one role.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Host {
    #[facet(default)]
    pub role: String,
    #[facet(default)]
    pub count: u32,
    /// host path -> guest path
    #[facet(default)]
    pub mounts: BTreeMap<String, String>,
    #[facet(default)]
    pub resources: BTreeMap<String, String>,
    #[facet(default)]
    pub image: String,
}

impl Host {
    pub fn resource(&self, key: &str) -> Option<&str> {
        self.resources.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

// ── Status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Phase {
    #[default]
    InProcess,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Condition {
    #[facet(rename = "type")]
    pub kind: String,
    #[facet(default = ConditionStatus::Unknown)]
    pub status: ConditionStatus,
    #[facet(default)]
    pub last_heartbeat_time: String,
    #[facet(default)]
    pub reason: String,
    #[facet(default)]
    pub message: String,
}

impl Condition {
    /// A fresh, optimistic condition for a stage.
    pub fn ok(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: ConditionStatus::True,
            last_heartbeat_time: util::utc_now_rfc3339(),
            reason: String::new(),
            message: message.to_string(),
        }
    }

    /// Flip to False, recording why.
    pub fn fail(&mut self, reason: &str, message: impl Into<String>) {
        self.status = ConditionStatus::False;
        self.reason = reason.to_string();
        self.message = message.into();
        self.last_heartbeat_time = util::utc_now_rfc3339();
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Status {
    #[facet(default = Phase::InProcess)]
    pub phase: Phase,
    #[facet(default)]
    pub hosts: Vec<HostStatus>,
    #[facet(default)]
    pub conditions: Vec<Condition>,
}

impl Status {
    /// Insert or update by type. An existing entry with the same status,
    /// reason and message is left untouched, heartbeat included.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing)
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message => {}
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn host(&self, role: &str, index: u32) -> Option<&HostStatus> {
        self.hosts.iter().find(|h| h.role == role && h.index == index)
    }

    pub fn host_by_id(&self, id: &str) -> Option<&HostStatus> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Every IP of every host carrying `role`.
    pub fn ips_by_role(&self, role: &str) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.role == role)
            .flat_map(|h| h.ips.iter().cloned())
            .collect()
    }

    /// Roles of the host owning `ip`.
    pub fn roles_by_ip(&self, ip: &str) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.ips.iter().any(|i| i == ip))
            .map(|h| h.role.clone())
            .collect()
    }
}

/// What the backend last reported for one instance.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct HostStatus {
    #[facet(default)]
    pub id: String,
    #[facet(default)]
    pub role: String,
    #[facet(default)]
    pub index: u32,
    #[facet(default)]
    pub state: String,
    #[facet(default)]
    pub ips: Vec<String>,
    #[facet(rename = "imageID")]
    #[facet(default)]
    pub image_id: String,
    #[facet(default)]
    pub image_name: String,
    #[facet(default)]
    pub capacity: BTreeMap<String, String>,
    #[facet(default)]
    pub used: BTreeMap<String, String>,
    /// host path -> guest path
    #[facet(default)]
    pub mounts: BTreeMap<String, String>,
}

impl HostStatus {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    pub fn primary_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str)
    }
}

// ── VirtualMachine helpers ───────────────────────────────

impl VirtualMachine {
    pub fn new(name: &str) -> Self {
        Self {
            kind: KIND.to_string(),
            api_version: API_VERSION.to_string(),
            metadata: Metadata {
                name: name.to_string(),
                ..Metadata::default()
            },
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_created(&self) -> bool {
        self.metadata.creation_timestamp.is_some()
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Hosts merged by role, in first-seen order. Repeated roles add their
    /// counts; the first entry's template wins for everything else.
    pub fn hosts_by_role(&self) -> Vec<Host> {
        let mut merged: Vec<Host> = Vec::new();
        for host in &self.spec.hosts {
            match merged.iter_mut().find(|h| h.role == host.role) {
                Some(existing) => existing.count += host.count,
                None => merged.push(host.clone()),
            }
        }
        merged
    }

    pub fn host_template(&self, role: &str) -> Option<Host> {
        self.hosts_by_role().into_iter().find(|h| h.role == role)
    }

    /// Every desired instance as `(id, role, index)`.
    pub fn instances(&self) -> Vec<(String, String, u32)> {
        self.hosts_by_role()
            .iter()
            .flat_map(|h| {
                (0..h.count).map(|i| (identity::make_id(self.name(), &h.role, i), h.role.clone(), i))
            })
            .collect()
    }
}
