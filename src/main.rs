//! Provisio CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use provisio::cli::{Cli, Commands, OutputFormatter, StateCommands};
use provisio::config::{ConfigHasher, ConfigParser, ConfigValidator, Manifest, find_config_file};
use provisio::engine::Engine;
use provisio::error::{ConfigError, ProvisioError, Result};
use provisio::graph::ResourceAddress;
use provisio::planner::{CancelHandle, Plan, cancel_pair};
use provisio::state::{
    HistoryEntry, HistoryOperation, StateBackend, StateStore, backend_from_config, generate_holder_id,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code when drift is found or an apply did not complete.
const EXIT_INCOMPLETE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { destroy, out, detailed } => {
            cmd_plan(config, destroy, out.as_deref(), detailed, &formatter).await
        }
        Commands::Apply {
            plan_file,
            yes,
            parallelism,
        } => cmd_apply(config, plan_file.as_deref(), yes, parallelism, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Refresh => cmd_refresh(config, false, &formatter).await,
        Commands::Drift => cmd_refresh(config, true, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (manifest, base_dir) = load_manifest(config_path)?;
    let result = ConfigValidator::new().check(&manifest);

    // Graph errors only make sense once the declarations themselves are valid.
    if result.is_valid() {
        Engine::with_builtin_providers(manifest.execution, &base_dir).build_graph(&manifest)?;
    }

    print_out(&formatter.format_validation(&manifest, &result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let graph = Engine::with_builtin_providers(manifest.execution, &base_dir).build_graph(&manifest)?;
    print_out(&formatter.format_graph(&graph))?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_plan(
    config_path: Option<&Path>,
    destroy: bool,
    out: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let engine = Engine::with_builtin_providers(manifest.execution, &base_dir);

    let backend = backend_from_config(&manifest.state, &base_dir).await?;
    let store = StateStore::read_only(backend).await?;
    let snapshot = store.snapshot();

    let plan = if destroy {
        engine.plan_destroy(Some(&manifest), &snapshot)?
    } else {
        engine.plan(&manifest, &snapshot)?
    };

    print_out(&formatter.format_plan(&plan, detailed))?;

    if let Some(path) = out {
        plan.save_to_file(path)?;
        eprintln!("{}", formatter.success(&format!("Plan saved to {}", path.display())));
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_apply(
    config_path: Option<&Path>,
    plan_file: Option<&Path>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let mut engine = Engine::with_builtin_providers(manifest.execution, &base_dir);
    if let Some(parallelism) = parallelism {
        engine = engine.with_parallelism(parallelism);
    }

    let store = open_store(&manifest, &base_dir).await?;
    let result = apply_with_store(&engine, &manifest, plan_file, auto_approve, Arc::clone(&store), formatter).await;
    close_store(&store).await;
    result
}

async fn apply_with_store(
    engine: &Engine,
    manifest: &Manifest,
    plan_file: Option<&Path>,
    auto_approve: bool,
    store: Arc<StateStore>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let plan = if let Some(path) = plan_file {
        let plan = Plan::load_from_file(path)?;
        if !plan.destroy && plan.config_hash != ConfigHasher::new().hash_manifest(manifest) {
            warn!("Manifest changed since plan {} was created", plan.id);
        }
        info!("Applying saved plan {} ({})", plan.id, plan.summary());
        Some(plan)
    } else if auto_approve {
        None
    } else {
        let snapshot = store.snapshot();
        let plan = engine.plan(manifest, &snapshot)?;
        if plan.is_empty() {
            print_out(&formatter.format_plan(&plan, false))?;
            if !plan.changes_recorded_dependencies(&snapshot) {
                return Ok(ExitCode::SUCCESS);
            }
            // No provider calls, only state bookkeeping: no prompt.
            info!("Recording changed dependencies of unchanged resources");
        } else {
            print_out(&formatter.format_plan(&plan, true))?;
            if !confirm("Do you want to apply this plan?")? {
                eprintln!("Apply cancelled.");
                return Ok(ExitCode::SUCCESS);
            }
        }
        Some(plan)
    };

    let (handle, cancel) = cancel_pair();
    let interrupt = watch_interrupt(handle);
    let report = match plan {
        Some(plan) => engine.apply(Arc::new(plan), store, cancel).await,
        None => engine
            .apply_config(manifest, store, cancel)
            .await
            .map(|(plan, report)| {
                if plan.is_empty() {
                    eprintln!("{}", formatter.success("No changes to apply."));
                }
                report
            }),
    };
    interrupt.abort();

    let report = report?;
    print_out(&formatter.format_report(&report))?;

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}

async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let engine = Engine::with_builtin_providers(manifest.execution, &base_dir);

    let store = open_store(&manifest, &base_dir).await?;
    let result = destroy_with_store(&engine, &manifest, auto_approve, Arc::clone(&store), formatter).await;
    close_store(&store).await;
    result
}

async fn destroy_with_store(
    engine: &Engine,
    manifest: &Manifest,
    auto_approve: bool,
    store: Arc<StateStore>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let plan = engine.plan_destroy(Some(manifest), &store.snapshot())?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("Nothing to destroy."));
        return Ok(ExitCode::SUCCESS);
    }

    print_out(&formatter.format_plan(&plan, false))?;

    if !auto_approve {
        eprintln!(
            "{}",
            formatter.warning(&format!(
                "This will delete {} resources of {}.",
                plan.delete_count(),
                manifest.qualified_name()
            ))
        );
        if !confirm("Type 'y' to confirm destruction")? {
            eprintln!("Destroy cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let (handle, cancel) = cancel_pair();
    let interrupt = watch_interrupt(handle);
    let report = engine.apply(Arc::new(plan), store, cancel).await;
    interrupt.abort();

    let report = report?;
    print_out(&formatter.format_report(&report))?;

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    })
}

async fn cmd_refresh(config_path: Option<&Path>, dry_run: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let engine = Engine::with_builtin_providers(manifest.execution, &base_dir);
    let backend = backend_from_config(&manifest.state, &base_dir).await?;

    let report = if dry_run {
        let store = StateStore::read_only(backend).await?;
        engine.refresh(&store, true).await?
    } else {
        let store = StateStore::open(backend, &generate_holder_id()).await?;
        let report = engine.refresh(&store, false).await;
        close_store(&store).await;
        report?
    };

    print_out(&formatter.format_drift(&report))?;

    Ok(if dry_run && report.has_drift() {
        ExitCode::from(EXIT_INCOMPLETE)
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (manifest, base_dir) = load_valid_manifest(config_path)?;
    let backend = backend_from_config(&manifest.state, &base_dir).await?;

    match command {
        StateCommands::List => {
            let store = StateStore::read_only(backend).await?;
            print_out(&formatter.format_state_list(&store.snapshot()))?;
        }
        StateCommands::Show { address } => {
            let address = ResourceAddress::parse(&address)?;
            let store = StateStore::read_only(backend).await?;
            match store.get(&address) {
                Some(record) => print_out(&formatter.format_record(&record))?,
                None => {
                    eprintln!("{}", formatter.error(&format!("{address} is not in state")));
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        StateCommands::Rm { address } => {
            let address = ResourceAddress::parse(&address)?;
            let store = StateStore::open(backend, &generate_holder_id()).await?;
            let result = forget(&store, &address).await;
            close_store(&store).await;
            result?;
            eprintln!("{}", formatter.success(&format!("Removed {address} from state")));
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = backend.acquire_lock(&holder).await?;
            print_out(&formatter.success(&format!("State locked: {}", lock.lock_id)))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            return unlock(backend.as_ref(), lock_id, force, formatter).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn forget(store: &StateStore, address: &ResourceAddress) -> Result<()> {
    let record = store.get(address).ok_or_else(|| {
        ProvisioError::Config(ConfigError::validation(
            format!("{address} is not in state"),
            "address",
        ))
    })?;

    store.delete(address, Some(record.serial)).await?;
    store
        .add_history(HistoryEntry::new(HistoryOperation::StateRm, vec![address.to_string()], true))
        .await
}

async fn unlock(
    backend: &dyn StateBackend,
    lock_id: Option<String>,
    force: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let lock_id = match (lock_id, force) {
        (Some(id), _) => id,
        (None, true) => match backend.get_lock_info().await? {
            Some(lock) => {
                warn!("Force unlocking state held by {}", lock.holder);
                lock.lock_id
            }
            None => {
                eprintln!("{}", formatter.success("State is not locked."));
                return Ok(ExitCode::SUCCESS);
            }
        },
        (None, false) => {
            eprintln!("{}", formatter.error("Please provide --lock-id or use --force"));
            return Ok(ExitCode::FAILURE);
        }
    };

    backend.release_lock(&lock_id).await?;
    eprintln!("{}", formatter.success("State unlocked."));
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads the manifest and returns it with the directory it was found in.
fn load_manifest(config_path: Option<&Path>) -> Result<(Manifest, PathBuf)> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file(".")?,
    };
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let base_dir = std::path::absolute(&base_dir)
        .map_err(|e| ProvisioError::internal(format!("Cannot resolve {}: {e}", base_dir.display())))?;

    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let manifest = parser.load_with_env(&config_file)?;

    Ok((manifest, base_dir))
}

fn load_valid_manifest(config_path: Option<&Path>) -> Result<(Manifest, PathBuf)> {
    let (manifest, base_dir) = load_manifest(config_path)?;
    let result = ConfigValidator::new().validate(&manifest)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((manifest, base_dir))
}

async fn open_store(manifest: &Manifest, base_dir: &Path) -> Result<Arc<StateStore>> {
    let backend = backend_from_config(&manifest.state, base_dir).await?;
    Ok(Arc::new(StateStore::open(backend, &generate_holder_id()).await?))
}

async fn close_store(store: &StateStore) {
    if let Err(e) = store.close().await {
        warn!("Failed to release state lock: {e}");
    }
}

/// Cancels the run on Ctrl-C. Operations already started finish first.
fn watch_interrupt(handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for running operations to finish");
            handle.cancel();
        }
    })
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn print_out(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}
