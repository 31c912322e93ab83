//! Tables and JSON for `list` and `inspect`.

use std::fmt::Write as _;

use console::{Alignment, pad_str, style};
use facet::Facet;

use crate::error::FleetError;
use crate::model::{Condition, HostStatus, VirtualMachine};

const UNKNOWN: &str = "UNKNOWN";

/// One line of the `list` table.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct HostRow {
    pub name: String,
    pub state: String,
    pub role: String,
    pub ipv4: String,
    pub image: String,
}

#[derive(Debug, Facet)]
struct ListJson {
    name: String,
    phase: String,
    hosts: Vec<HostRow>,
    conditions: Vec<Condition>,
}

/// Desired instances first, in spec order, then any recorded host the spec
/// no longer names.
pub fn host_rows(vm: &VirtualMachine) -> Vec<HostRow> {
    let mut rows: Vec<HostRow> = vm
        .instances()
        .into_iter()
        .map(|(id, role, _)| match vm.status.host_by_id(&id) {
            Some(h) => row(h),
            None => HostRow {
                name: id,
                state: UNKNOWN.into(),
                role,
                ipv4: String::new(),
                image: String::new(),
            },
        })
        .collect();
    for h in &vm.status.hosts {
        if !rows.iter().any(|r| r.name == h.id) {
            rows.push(row(h));
        }
    }
    rows
}

fn row(h: &HostStatus) -> HostRow {
    HostRow {
        name: h.id.clone(),
        state: if h.state.is_empty() { UNKNOWN.into() } else { h.state.clone() },
        role: h.role.clone(),
        ipv4: h.ips.join(","),
        image: h.image_name.clone(),
    }
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .map(|r| console::measure_text_width(&r[i]))
                .chain([h.len()])
                .max()
                .unwrap_or(0)
        })
        .collect();
    let line = |cells: Vec<String>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| pad_str(c, *w, Alignment::Left, None).into_owned())
            .collect::<Vec<_>>()
            .join("   ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    let header = line(headers.iter().map(|h| h.to_string()).collect());
    let _ = writeln!(out, "{}", style(header).bold());
    for r in rows {
        let _ = writeln!(out, "{}", line(r.clone()));
    }
    out
}

/// Host table, phase, then the condition ledger.
pub fn render_list(vm: &VirtualMachine) -> String {
    let rows: Vec<Vec<String>> = host_rows(vm)
        .into_iter()
        .map(|r| vec![r.name, r.state, r.role, r.ipv4, r.image])
        .collect();
    let mut out = table(&["NAME", "STATE", "ROLE", "IPV4", "IMAGE"], &rows);

    let _ = writeln!(out, "\nPhase: {:?}", vm.status.phase);
    if !vm.status.conditions.is_empty() {
        let conditions: Vec<Vec<String>> = vm
            .status
            .conditions
            .iter()
            .map(|c| {
                let status = format!("{:?}", c.status);
                let status = if c.is_true() {
                    style(status).green().to_string()
                } else {
                    style(status).red().to_string()
                };
                vec![
                    c.kind.clone(),
                    status,
                    c.reason.clone(),
                    c.message.clone(),
                    c.last_heartbeat_time.clone(),
                ]
            })
            .collect();
        out.push('\n');
        out.push_str(&table(
            &["CONDITION", "STATUS", "REASON", "MESSAGE", "HEARTBEAT"],
            &conditions,
        ));
    }
    out
}

pub fn list_json(vm: &VirtualMachine) -> Result<String, FleetError> {
    to_json(&ListJson {
        name: vm.name().to_string(),
        phase: format!("{:?}", vm.status.phase),
        hosts: host_rows(vm),
        conditions: vm.status.conditions.clone(),
    })
}

/// Detail view of one instance.
pub fn render_inspect(h: &HostStatus) -> String {
    let mut out = String::new();
    let field = |out: &mut String, name: &str, value: &str| {
        let _ = writeln!(out, "{:<10} {value}", format!("{name}:"));
    };
    field(&mut out, "Name", &h.id);
    field(&mut out, "State", if h.state.is_empty() { UNKNOWN } else { &h.state });
    field(&mut out, "IPv4", &h.ips.join(", "));
    field(&mut out, "Release", &h.image_name);
    field(&mut out, "Image", &h.image_id);

    let _ = writeln!(out, "Mounts:");
    for (source, target) in &h.mounts {
        let _ = writeln!(out, "  {source} => {target}");
    }
    let _ = writeln!(out, "Capacity:");
    for (k, v) in &h.capacity {
        let _ = writeln!(out, "  {k}: {v}");
    }
    let _ = writeln!(out, "Used:");
    for (k, v) in &h.used {
        let _ = writeln!(out, "  {k}: {v}");
    }
    out
}

pub fn inspect_json(h: &HostStatus) -> Result<String, FleetError> {
    to_json(h)
}

fn to_json<'a, T: Facet<'a>>(value: &T) -> Result<String, FleetError> {
    facet_json::to_string(value).map_err(|e| FleetError::Decode {
        context: "json output".into(),
        message: e.to_string(),
    })
}
