use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::Parser;

use vmfleet::action::{self, ActionRuntime};
use vmfleet::apply::{self, Applied};
use vmfleet::args::{self, Desired};
use vmfleet::cli::{Cli, Command};
use vmfleet::cloudinit::CloudInitRenderer;
use vmfleet::config::{self, ProviderKind, Settings};
use vmfleet::distribute::{self, Selector};
use vmfleet::error::FleetError;
use vmfleet::identity;
use vmfleet::logging;
use vmfleet::model::{HostStatus, Phase, VirtualMachine};
use vmfleet::output;
use vmfleet::paths;
use vmfleet::progress::{OutputMode, StageProgress};
use vmfleet::provider::{AnyProvider, Provider};
use vmfleet::reconcile::{COND_DELETE, Pipeline, Reconciler};
use vmfleet::remote::AnyRemote;
use vmfleet::shell::ProcessRunner;
use vmfleet::store;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = if cli.plain || !std::io::stderr().is_terminal() {
        OutputMode::Plain
    } else {
        OutputMode::Normal
    };
    let file_handle = logging::init(cli.verbose, mode);

    let root = cli.root.clone().unwrap_or_else(paths::default_root);
    let settings_path = paths::settings_file(&root);
    let settings = config::load_settings(&settings_path)?;

    // Only commands that touch instances get a log file.
    if matches!(
        cli.command,
        Command::Run(_) | Command::Reset | Command::Exec { .. } | Command::Scp { .. } | Command::Action { .. }
    ) {
        if let Err(error) = file_handle.set_file(&paths::log_file(&root)) {
            tracing::warn!(%error, "file logging disabled");
        }
    }

    let ctx = Ctx {
        root,
        name: cli.name,
        verbose: cli.verbose,
        mode,
        settings,
    };

    match cli.command {
        Command::Run(run_args) => {
            let desired = args::build_desired(&ctx.name, &run_args, &ctx.settings)?;
            let applied = reconcile(&ctx, desired).await?;
            report(&applied)?;
        }
        Command::Reset => {
            let desired = args::build_reset(&ctx.name)?;
            let applied = reconcile(&ctx, desired).await?;
            report(&applied)?;
        }
        Command::List { json } => {
            let vm = load(&ctx)?;
            if json {
                println!("{}", output::list_json(&vm)?);
            } else {
                print!("{}", output::render_list(&vm));
            }
        }
        Command::Inspect { hostname, json } => {
            let vm = load(&ctx)?;
            let host = inspect_host(&ctx, &vm, &hostname).await?;
            if json {
                println!("{}", output::inspect_json(&host)?);
            } else {
                print!("{}", output::render_inspect(&host));
            }
        }
        Command::Exec { command, select } => {
            let vm = load(&ctx)?;
            let targets = distribute::resolve(&vm.status, &Selector::from(select))?;
            let remote = ctx.remote(&vm)?;
            let results =
                distribute::run_command(&remote, &targets, &command, &ctx.settings.timing).await?;
            for (target, stdout) in results {
                println!("==> {target}");
                print!("{stdout}");
                if !stdout.is_empty() && !stdout.ends_with('\n') {
                    println!();
                }
            }
        }
        Command::Scp { src, dst, select } => {
            let vm = load(&ctx)?;
            let targets = distribute::resolve(&vm.status, &Selector::from(select))?;
            let remote = ctx.remote(&vm)?;
            distribute::copy_file(&remote, &targets, &src, &dst, &ctx.settings.timing).await?;
            println!("copied {} to {} instance(s)", src.display(), targets.len());
        }
        Command::Action {
            file,
            print_default,
            yes,
        } => {
            if print_default {
                print!("{}", action::to_documents(&[action::default_action()])?);
                return Ok(());
            }
            if let Some(file) = file {
                run_actions(&ctx, &file, yes).await?;
            }
        }
        Command::Config => {
            let source = if settings_path.exists() {
                settings_path.display().to_string()
            } else {
                format!("{} (not found, using defaults)", settings_path.display())
            };
            println!("# {source}");
            print!("{}", settings_yaml(&ctx.settings)?);
        }
    }

    Ok(())
}

struct Ctx {
    root: PathBuf,
    name: String,
    verbose: bool,
    mode: OutputMode,
    settings: Settings,
}

impl Ctx {
    fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(self.settings.timing.command_timeout())
    }

    fn provider(&self, vm: &VirtualMachine) -> Result<AnyProvider, FleetError> {
        let kind = vm.spec.provider.parse::<ProviderKind>()?;
        Ok(AnyProvider::new(kind, self.runner(), &self.root, self.verbose))
    }

    fn remote(&self, vm: &VirtualMachine) -> Result<AnyRemote, FleetError> {
        let kind = vm.spec.provider.parse::<ProviderKind>()?;
        Ok(AnyRemote::new(kind, &vm.spec.ssh, &self.settings, self.runner()))
    }
}

fn load(ctx: &Ctx) -> Result<VirtualMachine, FleetError> {
    args::check_cluster_name(&ctx.name)?;
    store::load(&ctx.root, &ctx.name)?.ok_or_else(|| FleetError::Configuration {
        message: format!("cluster {} does not exist", ctx.name),
    })
}

async fn reconcile(ctx: &Ctx, desired: impl Into<Desired>) -> Result<Applied, FleetError> {
    let plan = apply::plan(&ctx.root, desired, &ctx.settings)?;
    let provider = AnyProvider::new(plan.provider_kind()?, ctx.runner(), &ctx.root, ctx.verbose);
    let remote = ctx.remote(&plan.vm)?;
    let reconciler = Reconciler::new(
        &provider,
        &remote,
        &CloudInitRenderer,
        &ctx.root,
        &ctx.settings.timing,
    );
    let mut progress = StageProgress::new(ctx.mode);
    apply::execute(&ctx.root, plan, &reconciler, &mut progress).await
}

fn report(applied: &Applied) -> miette::Result<()> {
    let vm = &applied.vm;
    match &applied.archived {
        Some(path) => println!("cluster {} removed, state archived to {}", vm.name(), path.display()),
        None => println!(
            "cluster {}: {:?} ({:?} pipeline), state saved to {}",
            vm.name(),
            vm.status.phase,
            applied.pipeline,
            applied.state_path.display()
        ),
    }

    if applied.pipeline == Pipeline::Delete {
        if let Some(c) = vm.status.condition(COND_DELETE).filter(|c| !c.is_true()) {
            miette::bail!("cluster {} was not fully removed: {}", vm.name(), c.message);
        }
    } else if vm.status.phase == Phase::Failed {
        let failing: Vec<_> = vm
            .status
            .conditions
            .iter()
            .filter(|c| !c.is_true())
            .map(|c| format!("{} ({})", c.kind, c.reason))
            .collect();
        miette::bail!("cluster {} is not ready: {}", vm.name(), failing.join(", "));
    }
    Ok(())
}

/// Live view of one instance, falling back to the saved status when the
/// backend cannot answer.
async fn inspect_host(ctx: &Ctx, vm: &VirtualMachine, id: &str) -> Result<HostStatus, FleetError> {
    let saved = vm.status.host_by_id(id).cloned();
    let template = identity::parse_id(id)
        .filter(|(cluster, _, _)| cluster == vm.name())
        .and_then(|(_, role, index)| vm.host_template(&role).map(|h| (h, index)));

    if let Some((host, index)) = template {
        let provider = ctx.provider(vm)?;
        match provider.inspect(vm.name(), &host, index).await {
            Ok(live) => return Ok(live),
            Err(error) if saved.is_some() => {
                tracing::warn!(id, %error, "backend lookup failed, showing saved status");
            }
            Err(error) => return Err(error),
        }
    }
    saved.ok_or_else(|| FleetError::NotFound { id: id.to_string() })
}

async fn run_actions(ctx: &Ctx, file: &Path, yes: bool) -> Result<(), FleetError> {
    let text = std::fs::read_to_string(file).map_err(|source| FleetError::Io {
        context: format!("failed to read {}", file.display()),
        source,
    })?;
    let mut actions = action::parse_documents(&text)?;
    let vm = load(ctx)?;

    if !yes {
        let question = format!("Apply {} action(s) to cluster {}?", actions.len(), vm.name());
        let confirmed = inquire::Confirm::new(&question)
            .with_default(false)
            .prompt()
            .map_err(|e| FleetError::Configuration {
                message: format!("confirmation failed: {e} (pass --yes to skip it)"),
            })?;
        if !confirmed {
            println!("aborted");
            return Ok(());
        }
    }

    let provider = ctx.provider(&vm)?;
    let remote = ctx.remote(&vm)?;
    let runtime = ActionRuntime::new(&provider, &remote, &vm, &ctx.root, &ctx.settings.timing);
    let result = runtime.apply_all(&mut actions).await;
    print!("{}", action::to_documents(&actions)?);
    result.map_err(Into::into)
}

fn settings_yaml(settings: &Settings) -> Result<String, FleetError> {
    facet_yaml::to_string(settings).map_err(|e| FleetError::Decode {
        context: "settings".into(),
        message: e.to_string(),
    })
}
