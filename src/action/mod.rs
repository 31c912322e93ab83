//! Declarative action documents: which instances, and what to do on them.

pub mod runtime;

use facet::Facet;

use crate::error::FleetError;
use crate::model::{API_VERSION, ROLE_MASTER, ROLE_NODE};

pub use runtime::ActionRuntime;

pub const ACTION_KIND: &str = "Action";

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct Action {
    #[facet(default)]
    pub kind: String,
    #[facet(default)]
    pub api_version: String,
    #[facet(default)]
    pub spec: ActionSpec,
    #[facet(default)]
    pub status: ActionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ActionSpec {
    #[facet(default)]
    pub ons: Vec<ActionOn>,
    #[facet(default)]
    pub data: Vec<ActionData>,
}

/// A role, optionally narrowed to some indexes. No indexes means every
/// instance of the role.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ActionOn {
    #[facet(default)]
    pub role: String,
    #[facet(default)]
    pub indexes: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct SourceAndTarget {
    #[facet(default)]
    pub source: String,
    #[facet(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ContentAndTarget {
    #[facet(default)]
    pub content: String,
    #[facet(default)]
    pub target: String,
}

/// One block of work. Every populated field runs, in the order of
/// [`ActionData::steps`].
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
#[facet(rename_all = "camelCase")]
pub struct ActionData {
    #[facet(default)]
    pub mount: Option<SourceAndTarget>,
    #[facet(default)]
    pub umount: String,
    #[facet(default)]
    pub exec: String,
    #[facet(default)]
    pub copy: Option<SourceAndTarget>,
    #[facet(default)]
    pub copy_content: Option<ContentAndTarget>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum ActionPhase {
    #[default]
    InProcess,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ActionStatus {
    #[facet(default = ActionPhase::InProcess)]
    pub phase: ActionPhase,
    #[facet(default)]
    pub message: String,
}

/// A single typed operation taken from an [`ActionData`] block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStep {
    Mount { source: String, target: String },
    Unmount { target: String },
    Exec { command: String },
    Copy { source: String, target: String },
    CopyContent { content: String, target: String },
}

impl ActionStep {
    pub fn name(&self) -> &'static str {
        match self {
            ActionStep::Mount { .. } => "mount",
            ActionStep::Unmount { .. } => "umount",
            ActionStep::Exec { .. } => "exec",
            ActionStep::Copy { .. } => "copy",
            ActionStep::CopyContent { .. } => "copyContent",
        }
    }
}

impl ActionData {
    /// Populated fields in execution order: mount, umount, exec, copy, copyContent.
    pub fn steps(&self) -> Vec<ActionStep> {
        let mut steps = Vec::new();
        if let Some(m) = &self.mount {
            steps.push(ActionStep::Mount {
                source: m.source.clone(),
                target: m.target.clone(),
            });
        }
        if !self.umount.is_empty() {
            steps.push(ActionStep::Unmount {
                target: self.umount.clone(),
            });
        }
        if !self.exec.is_empty() {
            steps.push(ActionStep::Exec {
                command: self.exec.clone(),
            });
        }
        if let Some(c) = &self.copy {
            steps.push(ActionStep::Copy {
                source: c.source.clone(),
                target: c.target.clone(),
            });
        }
        if let Some(c) = &self.copy_content {
            steps.push(ActionStep::CopyContent {
                content: c.content.clone(),
                target: c.target.clone(),
            });
        }
        steps
    }
}

impl Action {
    pub fn steps(&self) -> Vec<ActionStep> {
        self.spec.data.iter().flat_map(ActionData::steps).collect()
    }
}

// ── documents ────────────────────────────────────────────

/// Split a multi-document YAML stream and decode each document.
///
/// Documents that fail to decode are skipped with a warning.
pub fn parse_documents(text: &str) -> Result<Vec<Action>, FleetError> {
    let mut actions = Vec::new();
    for (i, doc) in split_documents(text).into_iter().enumerate() {
        match facet_yaml::from_str::<Action>(&doc) {
            Ok(action) => actions.push(action),
            Err(e) => tracing::warn!(document = i, error = %e, "skipping undecodable action"),
        }
    }
    if actions.is_empty() {
        return Err(FleetError::Decode {
            context: "action file".into(),
            message: "no valid action documents".into(),
        });
    }
    Ok(actions)
}

fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            docs.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);
    docs.into_iter()
        .filter(|d| d.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#')))
        .collect()
}

/// Render actions back as one multi-document YAML stream.
pub fn to_documents(actions: &[Action]) -> Result<String, FleetError> {
    let mut out = String::new();
    for action in actions {
        let yaml = facet_yaml::to_string(action).map_err(|e| FleetError::Decode {
            context: "action".into(),
            message: e.to_string(),
        })?;
        out.push_str("---\n");
        out.push_str(yaml.strip_prefix("---\n").unwrap_or(&yaml));
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

/// A sample document showing every kind of step.
pub fn default_action() -> Action {
    let st = |source: &str, target: &str| SourceAndTarget {
        source: source.into(),
        target: target.into(),
    };
    Action {
        kind: ACTION_KIND.into(),
        api_version: API_VERSION.into(),
        spec: ActionSpec {
            ons: vec![
                ActionOn {
                    role: ROLE_NODE.into(),
                    indexes: Vec::new(),
                },
                ActionOn {
                    role: ROLE_MASTER.into(),
                    indexes: vec![0, 1],
                },
            ],
            data: vec![
                ActionData {
                    mount: Some(st("/source", "/target")),
                    ..ActionData::default()
                },
                ActionData {
                    umount: "/target".into(),
                    ..ActionData::default()
                },
                ActionData {
                    exec: "ls -l /".into(),
                    ..ActionData::default()
                },
                ActionData {
                    copy: Some(st("/source", "/target")),
                    ..ActionData::default()
                },
                ActionData {
                    copy_content: Some(ContentAndTarget {
                        content: "write code\ndfff".into(),
                        target: "/target".into(),
                    }),
                    ..ActionData::default()
                },
            ],
        },
        status: ActionStatus::default(),
    }
}
