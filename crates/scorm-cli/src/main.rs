//! SCORM RTE CLI
//!
//! Validates extracted SCORM packages and hosts one learner session over
//! HTTP for a browser-based host page.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use scorm_package::{Extraction, PackageResolver, PackageStatus, PackageValidation};
use scorm_rte::{
    create_router, AppState, Config, FileResumeCache, HttpTransport, Learner, MemoryTransport, SessionLaunch,
    SessionServices, SessionTransport, TransportKind,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Default port for the HTTP server.
const DEFAULT_PORT: u16 = 3000;

/// SCORM RTE - run-time host for SCORM 1.2 and 2004 packages
#[derive(Parser, Debug)]
#[command(name = "scorm-rte")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate an extracted package directory
    Validate {
        /// Directory the package was extracted into
        #[arg(value_name = "PACKAGE_DIR")]
        package_dir: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Launch a package and serve the host boundary
    Serve {
        /// Package directory name under packagesDir
        #[arg(long, value_name = "ID")]
        package: String,

        /// Course the attempt belongs to
        #[arg(long, value_name = "ID")]
        course: String,

        /// Learner identifier
        #[arg(long, value_name = "ID")]
        learner_id: String,

        /// Learner display name (`Last, First`)
        #[arg(long, value_name = "NAME", default_value = "")]
        learner_name: String,

        /// Path to configuration file (default: scorm.json in current directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<String>,

        /// Directory holding extracted packages (overrides packagesDir)
        #[arg(long, value_name = "DIR")]
        packages_dir: Option<String>,

        /// Seconds to wait for Initialize (overrides initTimeoutSecs)
        #[arg(long, value_name = "SECS")]
        init_timeout: Option<u64>,

        /// Port for the HTTP server
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match args.command {
        Command::Validate { package_dir, json } => run_validate(&package_dir, json),
        Command::Serve {
            package,
            course,
            learner_id,
            learner_name,
            config,
            packages_dir,
            init_timeout,
            port,
        } => {
            let overrides = Overrides {
                config_path: config,
                packages_dir,
                init_timeout,
            };
            let launch = LaunchArgs {
                package,
                course,
                learner: Learner::new(learner_id, learner_name),
            };
            run_serve(overrides, launch, port).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

// ============================================================================
// validate
// ============================================================================

/// Validates a package directory and prints the report.
///
/// Exits non-zero unless the package is `valid`.
fn run_validate(package_dir: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let package_id = package_dir
        .file_name()
        .map_or_else(|| "package".to_string(), |name| name.to_string_lossy().into_owned());

    let extraction = if package_dir.is_dir() {
        Extraction::Extracted {
            root: package_dir.to_path_buf(),
        }
    } else {
        Extraction::Failed {
            reason: format!("'{}' is not a directory", package_dir.display()),
        }
    };
    let report = PackageResolver::validate(&package_id, &extraction);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.status == PackageStatus::Valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn print_report(report: &PackageValidation) {
    let mark = |ok: bool| if ok { "ok" } else { "FAILED" };

    println!("Package:  {}", report.package_id);
    println!("Status:   {}", report.status);
    println!("Version:  SCORM {}", report.version);
    if let Some(title) = &report.title {
        println!("Title:    {title}");
    }
    if let Some(path) = &report.launch_path {
        match &report.launch_query {
            Some(query) => println!("Launch:   {path}?{query}"),
            None => println!("Launch:   {path}"),
        }
    }
    println!();
    println!("  manifest found       {}", mark(report.checks.manifest_found));
    println!("  launch file exists   {}", mark(report.checks.launch_exists));
    println!("  launch file readable {}", mark(report.checks.launch_readable));

    if !report.errors.is_empty() {
        println!();
        println!("Issues:");
        for issue in &report.errors {
            println!("  - {issue}");
        }
    }
}

// ============================================================================
// serve
// ============================================================================

/// Config values given on the command line.
struct Overrides {
    config_path: Option<String>,
    packages_dir: Option<String>,
    init_timeout: Option<u64>,
}

/// The session to launch.
struct LaunchArgs {
    package: String,
    course: String,
    learner: Learner,
}

/// Starts a session and serves it until Ctrl+C.
async fn run_serve(overrides: Overrides, launch: LaunchArgs, port: u16) -> anyhow::Result<ExitCode> {
    let mut config = load_config(overrides.config_path.as_deref())?;

    if let Some(dir) = overrides.packages_dir {
        config.packages_dir = dir;
    }
    if let Some(secs) = overrides.init_timeout {
        config.init_timeout_secs = secs;
    }

    // Re-validate after overrides
    config.validate()?;
    print_config(&config);

    let services = build_services(&config)?;
    let state = AppState::new(config, services);

    let validation = state.resolver.resolve(&launch.package);
    let resolved = validation.to_launch().map_err(|e| {
        anyhow::anyhow!("Package '{}' cannot be launched: {e}", launch.package)
    })?;

    let session = state
        .registry
        .launch(
            SessionLaunch {
                course_id: launch.course,
                learner: launch.learner,
                launch: resolved,
                init_timeout: state.config.init_timeout(),
            },
            &state.services,
            state.broadcaster.clone(),
        )
        .await;

    let registry = Arc::clone(&state.registry);
    let router = create_router(state);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port")
    })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    let status = session.status();
    println!();
    println!("Attempt:  {} ({:?})", status.attempt_id, status.attempt_origin);
    println!("Entry:    {}", status.entry);
    println!("Launch:   http://{addr}{}", status.launch_url);
    println!("Events:   ws://{addr}/ws");
    println!();
    println!("Press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
    }

    tracing::info!("Shutting down");
    if let Some(session) = registry.detach_active().await {
        session.adapter().flush().await;
        let status = session.status();
        println!();
        println!(
            "Session ended: {} commits sent, {} failed, progress {:.0}%",
            status.commits_dispatched, status.commits_failed, status.progress_percent
        );
    }
    server_handle.abort();

    Ok(ExitCode::SUCCESS)
}

/// Builds the attempt service and resume cache from configuration.
fn build_services(config: &Config) -> anyhow::Result<SessionServices> {
    let transport: Arc<dyn SessionTransport> = match config.transport.kind {
        TransportKind::Memory => {
            tracing::info!("Using in-process attempt store");
            Arc::new(MemoryTransport::new())
        }
        TransportKind::Http => {
            let base_url = config.transport.base_url.clone().unwrap_or_default();
            tracing::info!(%base_url, "Using remote attempt service");
            Arc::new(HttpTransport::new(
                &base_url,
                Duration::from_secs(config.transport.timeout_secs),
            )?)
        }
    };

    Ok(SessionServices {
        transport,
        cache: Arc::new(FileResumeCache::new(&config.cache_dir)),
    })
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn print_config(config: &Config) {
    println!("Packages: {}", config.packages_dir);
    println!("Cache:    {}", config.cache_dir);
    println!("Timeout:  {}s for Initialize", config.init_timeout_secs);
    match (&config.transport.kind, &config.transport.base_url) {
        (TransportKind::Http, Some(url)) => println!("Service:  {url}"),
        _ => println!("Service:  in-process"),
    }
}
