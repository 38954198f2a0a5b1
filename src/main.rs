use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use modelkeeper::config::Config;
use modelkeeper::ipc::{self, client::IpcClient, server::IpcServer, Command, Response};
use modelkeeper::models::download::{format_bytes, ProgressBarReporter};
use modelkeeper::models::manager::{InstallRequest, ModelManager};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelkeeper")]
#[command(about = "Install, verify, update and roll back local model artifacts", long_about = None)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Send the command to a running daemon
    #[arg(long, global = true)]
    remote: bool,

    /// Override the models directory
    #[arg(long, global = true, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    /// Override the host application version used for compatibility checks
    #[arg(long, global = true, value_name = "VERSION")]
    app_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed models with newer compatible versions
    Check,
    /// Install one or more models
    Install {
        #[arg(required_unless_present = "recommended")]
        models: Vec<String>,
        /// Install every model the registry tags as recommended
        #[arg(long, conflicts_with_all = ["models", "version", "variant", "force"])]
        recommended: bool,
        /// Pin a version instead of the registry's current one
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        variant: Option<String>,
        /// Reinstall even when the version is already present
        #[arg(long)]
        force: bool,
    },
    /// Apply available updates
    Update {
        model: Option<String>,
        /// Also apply major (breaking) updates
        #[arg(long)]
        force: bool,
    },
    /// Return a model to an earlier version
    Rollback {
        model: String,
        /// Defaults to the closest earlier version
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Show installed models, backups and untracked files
    List,
    /// Prune old backups and stale partial downloads
    Cleanup {
        /// Backups kept per model; 0 also drops the rollback target
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Delete an installed model
    Remove {
        model: String,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Re-check installed files against their recorded digests
    Verify { model: Option<String> },
    /// Replace the local registry with a remote document
    Refresh { url: String },
    /// Mark a model as used now
    Touch {
        model: String,
        #[arg(long)]
        variant: Option<String>,
    },
    /// Enable or disable automatic non-breaking updates in the daemon
    AutoUpdate { state: Toggle },
    /// Show manager status
    Status,
    /// Serve commands over a Unix socket
    Daemon {
        /// Minutes between automatic update runs
        #[arg(long, default_value_t = 360, value_parser = clap::value_parser!(u64).range(1..))]
        interval_mins: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so --json output on stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Daemon { interval_mins } => {
            let manager = build_manager(&cli.models_dir, &cli.app_version, false)?;
            return run_daemon(manager, Duration::from_secs(interval_mins.saturating_mul(60))).await;
        }
        Commands::Check => Command::Check,
        Commands::Install {
            recommended: true,
            ..
        } => Command::InstallRecommended,
        Commands::Install {
            models,
            version,
            variant,
            force,
            ..
        } => {
            let mut requests: Vec<InstallRequest> = models
                .into_iter()
                .map(|model_id| InstallRequest {
                    model_id,
                    version: version.clone(),
                    variant: variant.clone(),
                    force,
                })
                .collect();
            match requests.len() {
                1 => Command::Install(requests.remove(0)),
                _ => Command::InstallMany(requests),
            }
        }
        Commands::Update { model, force } => Command::Update {
            model_id: model,
            force,
        },
        Commands::Rollback {
            model,
            version,
            variant,
        } => Command::Rollback {
            model_id: model,
            version,
            variant,
        },
        Commands::List => Command::List,
        Commands::Cleanup { keep } => Command::Cleanup { keep_count: keep },
        Commands::Remove { model, variant } => Command::Remove {
            model_id: model,
            variant,
        },
        Commands::Verify { model } => Command::Verify { model_id: model },
        Commands::Refresh { url } => Command::Refresh { url },
        Commands::Touch { model, variant } => Command::Touch {
            model_id: model,
            variant,
        },
        Commands::AutoUpdate { state } => Command::SetAutoUpdate(matches!(state, Toggle::On)),
        Commands::Status => Command::Status,
    };

    let response = if cli.remote {
        IpcClient::new()?.send_command(&command).await?
    } else {
        let interactive = !cli.json
            && std::io::stderr().is_terminal()
            && matches!(command, Command::Install(_) | Command::Rollback { .. });
        let manager = build_manager(&cli.models_dir, &cli.app_version, interactive)?;
        ipc::execute(&manager, command).await
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialize result")?
        );
    } else {
        print_response(&response);
    }

    if response.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

fn build_manager(
    models_dir: &Option<PathBuf>,
    app_version: &Option<String>,
    progress_bar: bool,
) -> anyhow::Result<ModelManager> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = models_dir {
        config.paths.models_dir = Some(dir.clone());
    }
    if let Some(version) = app_version {
        config.app.version = version.clone();
    }
    config.validate()?;

    let manager = ModelManager::from_config(&config).with_context(|| {
        format!(
            "Failed to open models directory {}",
            config
                .models_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default()
        )
    })?;

    Ok(if progress_bar {
        manager.with_reporter(Arc::new(ProgressBarReporter::new("Downloading")))
    } else {
        manager
    })
}

async fn run_daemon(manager: ModelManager, interval: Duration) -> anyhow::Result<()> {
    let manager = Arc::new(manager);

    let ipc_server = IpcServer::new(Arc::clone(&manager))?;
    let server = tokio::spawn(async move {
        if let Err(e) = ipc_server.start().await {
            tracing::error!("IPC server error: {e}");
        }
    });

    tracing::info!("Daemon started, waiting for commands");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                auto_update(&manager).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    // Aborting drops the server, which removes the socket
    server.abort();
    let _ = server.await;
    Ok(())
}

async fn auto_update(manager: &ModelManager) {
    match manager.state().load() {
        Ok(state) if state.auto_update_enabled => {}
        Ok(_) => return,
        Err(e) => {
            tracing::error!("Cannot read local state: {e}");
            return;
        }
    }

    match manager.update(None, false).await {
        Ok(summary) => {
            for report in &summary.applied {
                tracing::info!(
                    "Auto-updated '{}' to {}",
                    report.model_id,
                    report.version
                );
            }
            for failure in &summary.failed {
                tracing::error!("Auto-update failed: {}", failure.message);
            }
        }
        Err(e) => tracing::error!("Auto-update check failed: {e}"),
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Ok => println!("OK"),
        Response::Updates(updates) => {
            if updates.is_empty() {
                println!("All models are up to date");
            }
            for u in updates {
                println!(
                    "{} ({}): {} -> {} [{}{}] {}",
                    u.model_id,
                    u.variant,
                    u.installed_version,
                    u.available_version,
                    u.update_type,
                    if u.is_breaking { ", breaking" } else { "" },
                    format_bytes(u.size_bytes)
                );
            }
        }
        Response::Operation(report) => println!(
            "✓ {} {} ({}) {}",
            report.model_id, report.version, report.variant, report.action
        ),
        Response::Operations(results) => {
            for result in results {
                match result {
                    Ok(report) => println!(
                        "✓ {} {} ({}) {}",
                        report.model_id, report.version, report.variant, report.action
                    ),
                    Err(failure) => eprintln!("✗ {}", failure.message),
                }
            }
        }
        Response::OperationFailed(failure) => {
            eprintln!("✗ {}", failure.message);
            if let Some(path) = &failure.partial_artifact {
                eprintln!("  Left behind: {}", path.display());
            }
        }
        Response::UpdateSummary(summary) => {
            if summary.applied.is_empty() && summary.skipped.is_empty() && summary.failed.is_empty() {
                println!("All models are up to date");
            }
            for report in &summary.applied {
                println!(
                    "✓ {} {} -> {}",
                    report.model_id,
                    report.previous_version.as_deref().unwrap_or("-"),
                    report.version
                );
            }
            for skipped in &summary.skipped {
                println!(
                    "- {} {} -> {} skipped (breaking, use --force)",
                    skipped.model_id, skipped.installed_version, skipped.available_version
                );
            }
            for failure in &summary.failed {
                eprintln!("✗ {}", failure.message);
            }
        }
        Response::Inventory(inventory) => {
            if inventory.installed.is_empty() {
                println!("No models installed");
            }
            for m in &inventory.installed {
                println!(
                    "{} {} ({}) {}{}",
                    m.model_id,
                    m.version,
                    m.variant,
                    format_bytes(m.size_bytes),
                    if m.low_trust { " [unverified]" } else { "" }
                );
            }
            if !inventory.backups.is_empty() {
                println!("\nBackups:");
                for b in &inventory.backups {
                    println!("  {} {} {}", b.model_id, b.version, format_bytes(b.size_bytes));
                }
            }
            if !inventory.untracked.is_empty() {
                println!("\nUntracked files:");
                for path in &inventory.untracked {
                    println!("  {}", path.display());
                }
            }
        }
        Response::Cleanup(report) => {
            for path in report.pruned_backups.iter().chain(&report.removed_partials) {
                println!("Removed {}", path.display());
            }
            println!(
                "✓ {} backup(s) and {} partial file(s) removed",
                report.pruned_backups.len(),
                report.removed_partials.len()
            );
        }
        Response::Removed(model) => println!(
            "✓ Removed '{}' {} ({}), freed {}",
            model.model_id,
            model.version,
            model.variant,
            format_bytes(model.size_bytes)
        ),
        Response::Verified(results) => {
            for r in results {
                match &r.error {
                    None => println!("✓ {} {} ({})", r.model_id, r.version, r.variant),
                    Some(e) => eprintln!("✗ {} {} ({}): {e}", r.model_id, r.version, r.variant),
                }
            }
        }
        Response::Refreshed { models } => println!("✓ Registry refreshed ({models} models)"),
        Response::Status(status) => {
            println!("Host version: {}", status.app_version);
            println!("Models dir:   {}", status.models_dir.display());
            println!("Installed:    {}", status.installed);
            println!(
                "Auto-update:  {}",
                if status.auto_update_enabled { "on" } else { "off" }
            );
            println!(
                "Last check:   {}",
                status
                    .last_check
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
            );
        }
        Response::Error { message, .. } => eprintln!("Error: {message}"),
    }
}
