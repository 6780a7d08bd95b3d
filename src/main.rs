//! Converge CLI entrypoint.
//!
//! Wires the configured store, scheduler and registry together and
//! dispatches the command-line commands.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, OutputFormatter, ScopeArgs, StateCommands};
use converge::config::{ConfigParser, ConfigValidator, ManifestFile, ServiceConfig};
use converge::error::Result;
use converge::model::ResolveFilter;
use converge::reconciler::{AutoReconciler, Reconciler};
use converge::rectify::RectifyContext;
use converge::scheduler::{DockerRegistry, InMemoryRegistry, Registry, SingularityClient};
use converge::state::{
    MemoryStateManager, SqlStateManager, StateManager, plan_write, prepare_write,
};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
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
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
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

/// Runs the CLI command.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Validate { manifest, warnings } => {
            cmd_validate(&manifest, warnings, &formatter)
        }
        Commands::Update { manifest, dry_run } => {
            cmd_update(config_path, &manifest, dry_run, &formatter).await
        }
        Commands::Plan { detailed, scope } => {
            cmd_plan(config_path, scope, detailed, &formatter).await
        }
        Commands::Rectify { scope } => cmd_rectify(config_path, scope, &formatter).await,
        Commands::Run { interval, scope } => cmd_run(config_path, interval, scope).await,
        ref history @ Commands::History { .. } => {
            cmd_history(config_path, history, &formatter).await
        }
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Loads and validates the service configuration.
fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let parser = ConfigParser::new();
    parser.load_dotenv()?;
    let config = parser.load(path)?;

    let result = ConfigValidator::new().validate_config(&config).into_config_result()?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    debug!(storage = %config.storage.url, "Configuration loaded");
    Ok(config)
}

/// Opens the configured desired-state store.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn StateManager>> {
    if config.storage.is_memory() {
        warn!("Using in-memory storage; desired state is lost on exit");
        return Ok(Arc::new(MemoryStateManager::new()));
    }

    let store =
        SqlStateManager::connect(&config.storage.url, config.storage.max_connections).await?;
    Ok(Arc::new(store))
}

/// Builds a reconciler over the configured capabilities.
async fn build_reconciler(config: &ServiceConfig, scope: ScopeArgs) -> Result<Reconciler> {
    let state = open_store(config).await?;
    let deployer = Arc::new(SingularityClient::with_timeout(config.scheduler.timeout_secs)?);

    let registry: Arc<dyn Registry> = match &config.registry.url {
        Some(url) => Arc::new(DockerRegistry::new(url, config.registry.timeout_secs)?),
        None => Arc::new(InMemoryRegistry::permissive()),
    };

    let filter: ResolveFilter = scope.apply(config.scope.clone());
    info!(backend = state.backend_type(), scope = %filter, "Reconciler ready");

    Ok(Reconciler::new(RectifyContext {
        deployer,
        registry,
        filter,
        state,
    }))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")?;
    Ok(())
}

/// Validates a manifest file without touching the store.
fn cmd_validate(
    manifest: &Path,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    info!("Validating {}", manifest.display());

    let state = ManifestFile::load(manifest)?.to_state()?;
    let result = ConfigValidator::new().validate_state(&state);
    emit(&formatter.format_validation(&result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Replaces the desired state with a manifest file.
async fn cmd_update(
    config_path: Option<&Path>,
    manifest: &Path,
    dry_run: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let state = ManifestFile::load(manifest)?.to_state()?;

    let result = ConfigValidator::new().validate_state(&state).into_state_result()?;
    for warning in &result.warnings {
        debug!("{warning}");
    }

    let store = open_store(&config).await?;

    let summary = if dry_run {
        let current = store.read_state().await?;
        let next = prepare_write(&state)?;
        plan_write(&current.deployments, &next.deployments).summary()
    } else {
        let user = config.user();
        info!(%user, "Writing desired state from {}", manifest.display());
        store.write_state(&state, &user).await?
    };

    emit(&formatter.format_write(&summary, dry_run))?;
    Ok(ExitCode::SUCCESS)
}

/// Shows the differences between desired and running state.
async fn cmd_plan(
    config_path: Option<&Path>,
    scope: ScopeArgs,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let reconciler = build_reconciler(&config, scope).await?;

    let diffs = reconciler.plan().await?;
    emit(&formatter.format_diffs(&diffs, detailed))?;

    Ok(ExitCode::SUCCESS)
}

/// Runs a single reconciliation cycle.
async fn cmd_rectify(
    config_path: Option<&Path>,
    scope: ScopeArgs,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let reconciler = build_reconciler(&config, scope).await?;

    let report = reconciler.run_cycle().await;
    emit(&formatter.format_report(&report))?;

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Reconciles on an interval until interrupted.
async fn cmd_run(
    config_path: Option<&Path>,
    interval: Option<u64>,
    scope: ScopeArgs,
) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(secs) = interval {
        config.reconcile.interval_secs = secs;
        ConfigValidator::new().validate_config(&config).into_config_result()?;
    }

    let reconciler = build_reconciler(&config, scope).await?;
    let handle = AutoReconciler::new(reconciler, config.reconcile.interval())
        .with_history_size(config.reconcile.history_size)
        .start();

    info!(
        interval = ?config.reconcile.interval(),
        "Reconciling until interrupted"
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, waiting for the current cycle");

    let skipped = handle.skipped_cycles();
    let latest = handle.latest();
    handle.stop().await;

    if skipped > 0 {
        info!(skipped, "Cycles skipped while a previous cycle was running");
    }

    Ok(match latest {
        Some(report) if !report.is_success() => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Shows the revision history of one deployment.
async fn cmd_history(
    config_path: Option<&Path>,
    command: &Commands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let Some(id) = command.history_id() else {
        return Ok(ExitCode::FAILURE);
    };

    let config = load_config(config_path)?;
    let store = open_store(&config).await?;

    let rows = store.history(&id).await?;
    if rows.is_empty() {
        warn!("No history recorded for {id}");
    }
    emit(&formatter.format_history(&rows))?;

    Ok(ExitCode::SUCCESS)
}

/// Inspects the desired-state store.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let state = store.read_state().await?;

    match command {
        StateCommands::Show => emit(&formatter.format_state(&state))?,
        StateCommands::Export => emit(&ManifestFile::from_state(&state).to_yaml()?)?,
    }

    Ok(ExitCode::SUCCESS)
}
