//! Turning `run`/`reset` flags into a desired cluster object.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;

use crate::config::{ProviderKind, Settings};
use crate::error::FleetError;
use crate::identity;
use crate::model::{
    Host, RESOURCE_CPU, RESOURCE_DISK, RESOURCE_MEMORY, ROLE_NODE, VirtualMachine,
};
use crate::util;

/// Flags accepted by `vmfleet run`.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Topology as role:count pairs, e.g. master:1,node:2 (defaults to node:1 for a new cluster)
    #[arg(long)]
    pub nodes: Option<String>,

    /// Shared folders as role@host_path:guest_path (repeatable)
    #[arg(long = "mounts")]
    pub mounts: Vec<String>,

    /// Image reference passed to the backend
    #[arg(long)]
    pub image: Option<String>,

    /// CPUs per instance
    #[arg(long)]
    pub cpus: Option<String>,

    /// Memory per instance (e.g. 4G)
    #[arg(long)]
    pub memory: Option<String>,

    /// Disk per instance (e.g. 50G)
    #[arg(long)]
    pub disk: Option<String>,

    /// Backend: multipass or orb
    #[arg(long)]
    pub provider: Option<String>,

    /// SSH public key installed on every instance
    #[arg(long)]
    pub public_key: Option<PathBuf>,

    /// SSH private key used to reach instances
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long = "pk-passwd")]
    pub pk_passwd: Option<String>,

    /// HTTP proxy host:port written into the guests
    #[arg(long)]
    pub proxy: Option<String>,

    /// Comma-separated no_proxy list
    #[arg(long = "no-proxy")]
    pub no_proxy: Option<String>,
}

fn config_err(message: impl Into<String>) -> FleetError {
    FleetError::Configuration {
        message: message.into(),
    }
}

// ── parsing ──────────────────────────────────────────────

/// Parse `role:count,role:count`. Any malformed entry fails the whole input.
pub fn parse_nodes(input: &str) -> Result<BTreeMap<String, u32>, FleetError> {
    let mut nodes = BTreeMap::new();
    for entry in input.split(',').map(str::trim) {
        let (role, count) = entry
            .split_once(':')
            .ok_or_else(|| config_err(format!("node entry '{entry}' must be role:count")))?;
        let role = role.trim();
        check_role(role)?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| config_err(format!("node entry '{entry}': count must be an integer")))?;
        if nodes.insert(role.to_string(), count).is_some() {
            return Err(config_err(format!("role '{role}' listed twice")));
        }
    }
    Ok(nodes)
}

/// Parse `role@host_path:guest_path` entries into role -> (host -> guest).
pub fn parse_mounts<S: AsRef<str>>(
    entries: &[S],
) -> Result<BTreeMap<String, BTreeMap<String, String>>, FleetError> {
    let mut mounts: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for entry in entries.iter().map(AsRef::as_ref) {
        let (role, paths) = entry
            .split_once('@')
            .ok_or_else(|| config_err(format!("mount '{entry}' must be role@host:guest")))?;
        check_role(role)?;
        let (source, target) = paths
            .split_once(':')
            .filter(|(s, t)| !s.is_empty() && !t.is_empty())
            .ok_or_else(|| config_err(format!("mount '{entry}' must be role@host:guest")))?;
        mounts
            .entry(role.to_string())
            .or_default()
            .insert(source.to_string(), target.to_string());
    }
    Ok(mounts)
}

/// Cluster names end up in instance ids and paths, so only `[a-z0-9_]` is allowed.
pub fn check_cluster_name(name: &str) -> Result<(), FleetError> {
    if name.contains('-') {
        return Err(config_err(format!(
            "cluster name '{name}' must not contain '-'"
        )));
    }
    if !identity::is_valid_name(name) {
        return Err(config_err(format!(
            "cluster name '{name}' may only use lowercase letters, digits and '_'"
        )));
    }
    Ok(())
}

fn check_role(role: &str) -> Result<(), FleetError> {
    if !identity::is_valid_name(role) {
        return Err(config_err(format!(
            "role '{role}' may only use lowercase letters, digits and '_'"
        )));
    }
    Ok(())
}

// ── desired object ───────────────────────────────────────

/// Per-instance template fields given on the command line. They apply to
/// every role of the merged spec, so `run --cpus 4` also resizes a saved
/// topology.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostOverrides {
    pub image: Option<String>,
    pub resources: BTreeMap<String, String>,
}

impl HostOverrides {
    fn from_args(args: &RunArgs) -> Self {
        let resources = [
            (RESOURCE_CPU, &args.cpus),
            (RESOURCE_MEMORY, &args.memory),
            (RESOURCE_DISK, &args.disk),
        ]
        .into_iter()
        .filter_map(|(key, flag)| flag.clone().map(|v| (key.to_string(), v)))
        .collect();
        Self {
            image: args.image.clone(),
            resources,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.resources.is_empty()
    }

    fn apply(&self, host: &mut Host) {
        if let Some(image) = &self.image {
            host.image = image.clone();
        }
        for (key, value) in &self.resources {
            host.resources.insert(key.clone(), value.clone());
        }
    }
}

/// What one `run` or `reset` asked for.
#[derive(Debug, Clone, Default)]
pub struct Desired {
    pub vm: VirtualMachine,
    pub overrides: HostOverrides,
}

impl Desired {
    pub fn name(&self) -> &str {
        self.vm.name()
    }
}

impl From<VirtualMachine> for Desired {
    fn from(vm: VirtualMachine) -> Self {
        Self {
            vm,
            overrides: HostOverrides::default(),
        }
    }
}

/// Desired object built only from what the flags say. Fields the user left
/// out stay empty so `merge` keeps the saved values.
pub fn build_desired(
    cluster: &str,
    args: &RunArgs,
    settings: &Settings,
) -> Result<Desired, FleetError> {
    check_cluster_name(cluster)?;
    let mut vm = VirtualMachine::new(cluster);

    let mounts = parse_mounts(args.mounts.as_slice())?;
    if let Some(nodes) = &args.nodes {
        let nodes = parse_nodes(nodes)?;
        if let Some(role) = mounts.keys().find(|r| !nodes.contains_key(*r)) {
            return Err(config_err(format!("mount for role '{role}' which is not in --nodes")));
        }
        vm.spec.hosts = nodes
            .into_iter()
            .map(|(role, count)| {
                let mut host = host_template(&role, count, args, settings);
                host.mounts = mounts.get(&role).cloned().unwrap_or_default();
                host
            })
            .collect();
    } else if !mounts.is_empty() {
        return Err(config_err("--mounts needs --nodes"));
    }

    if let Some(provider) = &args.provider {
        let kind: ProviderKind = provider.parse()?;
        vm.spec.provider = kind.to_string();
    }
    if let Some(path) = &args.public_key {
        vm.spec.ssh.public_file = expand_home(path).display().to_string();
    }
    if let Some(path) = &args.private_key {
        vm.spec.ssh.pk_file = expand_home(path).display().to_string();
    }
    if let Some(pass) = &args.pk_passwd {
        vm.spec.ssh.pk_passwd = pass.clone();
    }
    if let Some(proxy) = &args.proxy {
        vm.spec.proxy = proxy.clone();
    }
    if let Some(no_proxy) = &args.no_proxy {
        vm.spec.no_proxy = no_proxy.clone();
    }
    Ok(Desired {
        vm,
        overrides: HostOverrides::from_args(args),
    })
}

fn host_template(role: &str, count: u32, args: &RunArgs, settings: &Settings) -> Host {
    let pick = |flag: &Option<String>, fallback: &str| flag.clone().unwrap_or_else(|| fallback.to_string());
    let defaults = &settings.defaults;
    let mut host = Host {
        role: role.to_string(),
        count,
        image: pick(&args.image, &defaults.image),
        ..Host::default()
    };
    host.resources
        .insert(RESOURCE_CPU.into(), pick(&args.cpus, &defaults.cpus));
    host.resources
        .insert(RESOURCE_MEMORY.into(), pick(&args.memory, &defaults.memory));
    host.resources
        .insert(RESOURCE_DISK.into(), pick(&args.disk, &defaults.disk));
    host
}

/// Desired object for `reset`: only the deletion mark.
pub fn build_reset(cluster: &str) -> Result<VirtualMachine, FleetError> {
    check_cluster_name(cluster)?;
    let mut vm = VirtualMachine::new(cluster);
    vm.metadata.deletion_timestamp = Some(util::utc_now_rfc3339());
    Ok(vm)
}

/// Overlay the non-empty fields of `desired` onto the saved object, then the
/// template overrides onto every role. A new cluster without `--nodes` starts
/// as a single `node`.
pub fn merge(loaded: Option<VirtualMachine>, desired: Desired) -> VirtualMachine {
    let Desired { vm: desired, overrides } = desired;
    let mut vm = match loaded {
        Some(saved) => overlay_saved(saved, desired),
        None => desired,
    };
    if vm.spec.hosts.is_empty() && !vm.is_deleting() {
        vm.spec.hosts.push(Host {
            role: ROLE_NODE.to_string(),
            count: 1,
            ..Host::default()
        });
    }
    for host in &mut vm.spec.hosts {
        overrides.apply(host);
    }
    vm
}

fn overlay_saved(mut vm: VirtualMachine, desired: VirtualMachine) -> VirtualMachine {
    fn overlay(dst: &mut String, src: String) {
        if !src.is_empty() {
            *dst = src;
        }
    }

    let VirtualMachine {
        kind,
        api_version,
        metadata,
        spec,
        ..
    } = desired;
    if vm.kind.is_empty() {
        vm.kind = kind;
    }
    if vm.api_version.is_empty() {
        vm.api_version = api_version;
    }
    if metadata.deletion_timestamp.is_some() {
        vm.metadata.deletion_timestamp = metadata.deletion_timestamp;
    }
    if !spec.hosts.is_empty() {
        vm.spec.hosts = spec.hosts;
    }
    overlay(&mut vm.spec.provider, spec.provider);
    overlay(&mut vm.spec.proxy, spec.proxy);
    overlay(&mut vm.spec.no_proxy, spec.no_proxy);
    overlay(&mut vm.spec.ssh.public_file, spec.ssh.public_file);
    overlay(&mut vm.spec.ssh.pk_file, spec.ssh.pk_file);
    overlay(&mut vm.spec.ssh.pk_passwd, spec.ssh.pk_passwd);
    vm
}

/// Fill whatever is still empty after the merge from settings.
pub fn fill_defaults(vm: &mut VirtualMachine, settings: &Settings) {
    if vm.spec.hosts.is_empty() && !vm.is_deleting() {
        vm.spec
            .hosts
            .push(host_template(ROLE_NODE, 1, &RunArgs::default(), settings));
    }
    let defaults = &settings.defaults;
    for host in &mut vm.spec.hosts {
        if host.image.is_empty() {
            host.image = defaults.image.clone();
        }
        for (key, value) in [
            (RESOURCE_CPU, &defaults.cpus),
            (RESOURCE_MEMORY, &defaults.memory),
            (RESOURCE_DISK, &defaults.disk),
        ] {
            if host.resource(key).is_none() {
                host.resources.insert(key.to_string(), value.clone());
            }
        }
    }
    let fill = |dst: &mut String, src: &str| {
        if dst.is_empty() {
            *dst = src.to_string();
        }
    };
    fill(&mut vm.spec.provider, &settings.provider);
    fill(&mut vm.spec.proxy, &settings.network.proxy);
    fill(&mut vm.spec.no_proxy, &settings.network.no_proxy);
    fill(
        &mut vm.spec.ssh.public_file,
        &expand_home(Path::new(&settings.ssh.public_key)).display().to_string(),
    );
    fill(
        &mut vm.spec.ssh.pk_file,
        &expand_home(Path::new(&settings.ssh.private_key)).display().to_string(),
    );
    fill(&mut vm.spec.ssh.pk_passwd, &settings.ssh.passphrase);
}

/// Everything that must hold before any backend call.
pub fn validate(vm: &VirtualMachine) -> Result<(), FleetError> {
    check_cluster_name(vm.name())?;
    vm.spec.provider.parse::<ProviderKind>()?;

    let ssh = &vm.spec.ssh;
    if ssh.public_file.is_empty() || ssh.pk_file.is_empty() {
        return Err(config_err(
            "ssh keys missing: pass --public-key and --private-key or set [ssh] in config.toml",
        ));
    }
    let public = std::fs::read_to_string(&ssh.public_file)
        .map_err(|e| config_err(format!("cannot read public key {}: {e}", ssh.public_file)))?;
    ssh_key::PublicKey::from_openssh(public.trim())
        .map_err(|e| config_err(format!("{} is not an OpenSSH public key: {e}", ssh.public_file)))?;
    std::fs::metadata(&ssh.pk_file)
        .map_err(|e| config_err(format!("cannot read private key {}: {e}", ssh.pk_file)))?;

    if vm.spec.hosts.is_empty() {
        return Err(config_err("no hosts to create"));
    }
    for host in &vm.spec.hosts {
        check_role(&host.role)?;
        if let Some(cpu) = host.resource(RESOURCE_CPU) {
            match cpu.parse::<u32>() {
                Ok(n) if n >= 1 => {}
                _ => {
                    return Err(config_err(format!(
                        "role {}: cpu must be a positive integer (got '{cpu}')",
                        host.role
                    )));
                }
            }
        }
        for key in [RESOURCE_MEMORY, RESOURCE_DISK] {
            if let Some(size) = host.resource(key) {
                util::parse_size(size)?;
            }
        }
    }
    Ok(())
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|h| h.join(rest)).unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
