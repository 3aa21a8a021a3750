mod classify;
mod config;
mod doctor;
mod error;
mod fsutil;
mod interpreter;
mod launch;
mod lock;
mod package;
mod platform;
mod shell;
mod strategy;
mod sync;
#[cfg(test)]
mod testing;
mod uninstall;
mod venv;

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{
    load_config_or_default, project_path, read_config, required_home_dir, resolve_config_path,
    BootstrapPaths, Config, DEFAULT_CONFIG_YAML,
};
use crate::doctor::{collect_doctor_checks, summarize, DoctorInputs};
use crate::error::BootstrapError;
use crate::fsutil::ensure_parent;
use crate::interpreter::{resolve, InterpreterHandle, ResolveRequest};
use crate::launch::exec_entry_point;
use crate::lock::RuntimeLockFile;
use crate::platform::{CommandRunner, Platform, RealCommandRunner};
use crate::shell::{is_managed_launcher, StartupFileStatus};
use crate::strategy::{InstallRequest, InstallationStrategySelector, IntegrationChoices};
use crate::sync::{sync, SyncOutcome};
use crate::uninstall::{uninstall, LauncherRemoval, UninstallRequest};
use crate::venv::{ensure, IsolatedRuntimeRecord};

#[derive(Parser, Debug)]
#[command(
    name = "chatti-bootstrap",
    version,
    about = "Prepare a Python runtime for chatti and install it"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        #[arg(long, env = "CHATTI_PYTHON")]
        python: Option<PathBuf>,
        #[arg(long)]
        package: Option<String>,
        #[arg(long)]
        requirements: Option<PathBuf>,
        #[arg(long, overrides_with = "no_add_to_path")]
        add_to_path: bool,
        #[arg(long, overrides_with = "add_to_path")]
        no_add_to_path: bool,
        #[arg(long, overrides_with = "no_launcher")]
        launcher: bool,
        #[arg(long, overrides_with = "launcher")]
        no_launcher: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    Dev {
        #[arg(long, env = "CHATTI_PYTHON")]
        python: Option<PathBuf>,
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(last = true)]
        args: Vec<OsString>,
    },
    Uninstall {
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
    },
    Doctor {
        #[arg(long, env = "CHATTI_PYTHON")]
        python: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    platform: Platform,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn main() -> Result<(), BootstrapError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        platform: Platform::current(),
    };

    let result = match cli.command {
        Commands::Install {
            python,
            package,
            requirements,
            add_to_path,
            no_add_to_path,
            launcher,
            no_launcher,
            yes,
        } => handle_install(
            &ctx,
            InstallArgs {
                python,
                package,
                requirements,
                add_to_path: flag_choice(add_to_path, no_add_to_path),
                launcher: flag_choice(launcher, no_launcher),
                yes,
            },
        ),
        Commands::Dev {
            python,
            project,
            args,
        } => handle_dev(&ctx, python, project, args),
        Commands::Uninstall { yes, dry_run } => handle_uninstall(&ctx, yes, dry_run),
        Commands::Doctor { python, strict } => handle_doctor(&ctx, python, strict),
        Commands::Paths => handle_paths(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(ErrorDetails {
                    error_code: err.error_code().to_string(),
                    hint: err.remediation(),
                }),
            };
            print_json(&payload)?;
        } else {
            eprintln!("error: {err}");
            if let Some(hint) = err.remediation() {
                eprintln!("hint: {hint}");
            }
        }
        std::process::exit(err.exit_code());
    }

    Ok(())
}

/// `CHATTI_LOG` takes a full filter directive; `CHATTI_DEBUG=1` traces every
/// subprocess; otherwise only warnings reach stderr.
fn init_tracing() {
    let fallback = if env::var("CHATTI_DEBUG").map(|v| v == "1").unwrap_or(false) {
        "chatti_bootstrap=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env("CHATTI_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn flag_choice(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Explicit flag, then `--yes`, then an interactive question, then no.
fn decide(
    ctx: &Context,
    flag: Option<bool>,
    yes: bool,
    prompt: &str,
) -> Result<bool, BootstrapError> {
    if let Some(choice) = flag {
        return Ok(choice);
    }
    if yes {
        return Ok(true);
    }
    if !ctx.json && std::io::stdin().is_terminal() {
        let theme = ColorfulTheme::default();
        return Ok(Confirm::with_theme(&theme)
            .with_prompt(prompt)
            .default(true)
            .interact()?);
    }
    Ok(false)
}

struct Loaded {
    cfg: Config,
    home: PathBuf,
    paths: BootstrapPaths,
}

fn load(ctx: &Context) -> Result<Loaded, BootstrapError> {
    let (cfg, _) = load_config_or_default(&ctx.config_path)?;
    let home = required_home_dir()?;
    let paths = BootstrapPaths::resolve(&cfg, &ctx.config_path, &home, ctx.platform)?;
    Ok(Loaded { cfg, home, paths })
}

struct InstallArgs {
    python: Option<PathBuf>,
    package: Option<String>,
    requirements: Option<PathBuf>,
    add_to_path: Option<bool>,
    launcher: Option<bool>,
    yes: bool,
}

fn handle_install(ctx: &Context, args: InstallArgs) -> Result<(), BootstrapError> {
    let Loaded { cfg, home, paths } = load(ctx)?;
    let project = env::current_dir()?;
    let dist_dir = project_path(&project, &cfg.paths.dist_dir, &home, "paths.dist_dir")?;
    let requirement = cfg.requirement()?;

    let integration = IntegrationChoices {
        extend_search_path: decide(
            ctx,
            args.add_to_path,
            args.yes,
            &format!(
                "If a private runtime is used, add {} to PATH in your shell startup files?",
                paths.bin_dir.display()
            ),
        )?,
        install_launcher: decide(
            ctx,
            args.launcher,
            args.yes,
            &format!(
                "If a private runtime is used, install a `{}` launcher in {}?",
                cfg.app.entry_point,
                paths.bin_dir.display()
            ),
        )?,
    };

    let search_path = env::var_os("PATH");
    let command_names = ctx.platform.interpreter_command_names();
    let request = InstallRequest {
        interpreter: ResolveRequest {
            override_path: args.python.as_deref(),
            requirement,
            candidates: &paths.interpreter_candidates,
            command_names: &command_names,
            search_path: search_path.as_deref(),
        },
        explicit_package: args.package,
        dist_dir,
        package_name: cfg.app.package.clone(),
        extra_requirements: args.requirements,
        private_runtime: paths.private_runtime.clone(),
        entry_point: cfg.app.entry_point.clone(),
        bin_dir: paths.bin_dir.clone(),
        launcher_path: paths.launcher_path.clone(),
        startup_files: paths.startup_files.clone(),
        integration,
    };

    let runner = RealCommandRunner { quiet: ctx.json };
    let report = InstallationStrategySelector::new(ctx.platform, &runner)
        .run(&request)
        .map_err(|failure| {
            let trail: Vec<&str> = failure.report.states.iter().map(|s| s.label()).collect();
            debug!(states = ?trail, "install stopped");
            failure.error
        })?;

    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    if let (Some(branch), Some(handle)) = (report.branch, &report.interpreter) {
        println!(
            "installed {} into the {} using Python {} ({})",
            report.package.as_deref().unwrap_or(&cfg.app.package),
            branch.label(),
            handle.version,
            handle.path.display()
        );
    }
    if let Some(runtime) = &report.runtime {
        println!("private runtime: {}", runtime.root.display());
    }
    match &report.sync {
        Some(SyncOutcome::Installed { entries, .. }) => {
            println!("dependencies: installed {entries} entries")
        }
        Some(SyncOutcome::UpToDate { .. }) => println!("dependencies: up to date"),
        None => {}
    }
    for outcome in &report.search_path {
        if outcome.status == StartupFileStatus::Appended {
            println!(
                "added {} to PATH in {}",
                paths.bin_dir.display(),
                outcome.path.display()
            );
        }
    }
    if let Some(launcher) = &report.launcher {
        println!("launcher: {}", launcher.path.display());
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

/// Provisions the per-project runtime and syncs the project manifest when one exists.
fn prepare_dev_runtime<R: CommandRunner>(
    root: &Path,
    manifest: &Path,
    handle: &InterpreterHandle,
    platform: Platform,
    runner: &R,
) -> Result<IsolatedRuntimeRecord, BootstrapError> {
    let mut lock_file = RuntimeLockFile::open(root)?;
    let lock = lock_file.acquire()?;
    let record = ensure(root, handle, platform, runner, &lock)?;
    if manifest.is_file() {
        sync(manifest, &record, runner, &lock)?;
    } else {
        warn!(manifest = %manifest.display(), "no dependency manifest; skipping sync");
    }
    Ok(record)
}

/// Development mode: per-project runtime, project manifest, then hand off to
/// the dev entry script with the remaining arguments.
fn handle_dev(
    ctx: &Context,
    python: Option<PathBuf>,
    project: Option<PathBuf>,
    args: Vec<OsString>,
) -> Result<(), BootstrapError> {
    let Loaded { cfg, home, paths } = load(ctx)?;
    let project = match project {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    let root = project_path(&project, &cfg.paths.dev_runtime, &home, "paths.dev_runtime")?;
    let manifest = project_path(&project, &cfg.paths.manifest, &home, "paths.manifest")?;
    let script = project_path(&project, &cfg.app.dev_entry, &home, "app.dev_entry")?;

    if !script.is_file() {
        return Err(BootstrapError::Config(format!(
            "development entry script {} does not exist",
            script.display()
        )));
    }

    let search_path = env::var_os("PATH");
    let command_names = ctx.platform.interpreter_command_names();
    let request = ResolveRequest {
        override_path: python.as_deref(),
        requirement: cfg.requirement()?,
        candidates: &paths.interpreter_candidates,
        command_names: &command_names,
        search_path: search_path.as_deref(),
    };
    let runner = RealCommandRunner { quiet: ctx.json };
    let handle = resolve(&request, &runner)?;
    let record = prepare_dev_runtime(&root, &manifest, &handle, ctx.platform, &runner)?;

    let mut forwarded = vec![script.into_os_string()];
    forwarded.extend(args);
    let code = exec_entry_point(&record.interpreter, &forwarded)?;
    std::process::exit(code);
}

fn handle_uninstall(ctx: &Context, yes: bool, dry_run: bool) -> Result<(), BootstrapError> {
    let Loaded { cfg, paths, .. } = load(ctx)?;
    let launcher_is_ours = is_managed_launcher(&paths.launcher_path);
    let remove_launcher = if !launcher_is_ours {
        false
    } else if dry_run {
        yes
    } else {
        decide(
            ctx,
            None,
            yes,
            &format!("Remove launcher {}?", paths.launcher_path.display()),
        )?
    };

    let runner = RealCommandRunner { quiet: true };
    let report = uninstall(
        &UninstallRequest {
            private_runtime: paths.private_runtime.clone(),
            package: cfg.app.package.clone(),
            launcher_path: paths.launcher_path.clone(),
            remove_launcher,
            startup_files: paths.startup_files.clone(),
            dry_run,
        },
        ctx.platform,
        &runner,
    )?;

    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    let verb = if dry_run { "would remove" } else { "removed" };
    if report.runtime_removed {
        println!("{verb} private runtime {}", report.runtime.display());
    } else {
        println!("no private runtime at {}", report.runtime.display());
    }
    match report.launcher {
        LauncherRemoval::Removed => println!("{verb} launcher {}", report.launcher_path.display()),
        LauncherRemoval::Kept => println!("kept launcher {}", report.launcher_path.display()),
        LauncherRemoval::NotManaged => println!(
            "left {} alone: not written by chatti-bootstrap",
            report.launcher_path.display()
        ),
        LauncherRemoval::Absent => {}
    }
    for line in &report.advisory {
        println!("{line}");
    }
    Ok(())
}

fn handle_doctor(ctx: &Context, python: Option<PathBuf>, strict: bool) -> Result<(), BootstrapError> {
    let Loaded { cfg, paths, .. } = load(ctx)?;
    let search_path = env::var_os("PATH");
    let runner = RealCommandRunner { quiet: true };
    let checks = collect_doctor_checks(
        &DoctorInputs {
            cfg: &cfg,
            paths: &paths,
            override_path: python.as_deref(),
            search_path: search_path.as_deref(),
        },
        ctx.platform,
        &runner,
    );
    let (ok, primary_error) = summarize(&checks, strict);

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: primary_error,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok && !check.remediation.is_empty() {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(BootstrapError::Process(primary_error.unwrap_or_else(|| {
        "one or more readiness checks failed".to_string()
    })))
}

fn handle_paths(ctx: &Context) -> Result<(), BootstrapError> {
    let (cfg, config_exists) = load_config_or_default(&ctx.config_path)?;
    let home = required_home_dir()?;
    let paths = BootstrapPaths::resolve(&cfg, &ctx.config_path, &home, ctx.platform)?;
    let project = env::current_dir()?;
    let dev_runtime = project_path(&project, &cfg.paths.dev_runtime, &home, "paths.dev_runtime")?;
    let mut payload = serde_json::to_value(&paths)?;
    payload["config_exists"] = json!(config_exists);
    payload["dev_runtime"] = json!(dev_runtime);
    output(ctx, payload)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), BootstrapError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let (cfg, exists) = load_config_or_default(&ctx.config_path)?;
            if ctx.json {
                return output(
                    ctx,
                    json!({"path": ctx.config_path, "exists": exists, "config": cfg}),
                );
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), BootstrapError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BootstrapError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
