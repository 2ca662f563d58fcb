use clap::{Parser, Subcommand};
use colored::Colorize;
use labwarden_cloud_linode::LinodeProvider;
use labwarden_cloud_proxmox::ProxmoxProvider;
use labwarden_config::Secrets;
use labwarden_core::{
    apply, plan, ApplyError, ApplyOptions, ApplyReport, DesiredState, ExportStore, ObservedState,
    OpKind, Plan, ProviderRegistry, ResourceKey, StateManager,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Root password for the Linode edge node. Read from the environment so
/// it never lands in a config file.
const EDGE_PASSWORD_VAR: &str = "LABWARDEN_EDGE_ROOT_PASSWORD";

#[derive(Parser)]
#[command(name = "labwarden")]
#[command(about = "Homelab fleet reconciler: Proxmox cluster + Linode edge", long_about = None)]
struct Cli {
    /// Path to the lab config (default: search lab.kdl upward)
    #[arg(short, long, global = true, env = "LAB_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what an apply would change
    Plan {
        /// Re-read live resources from the providers before diffing
        #[arg(short, long)]
        refresh: bool,
    },
    /// Reconcile the fleet towards the configured state
    Apply {
        /// Approve destructive replace operations
        #[arg(short, long)]
        yes: bool,
        /// Keep applying independent resources after a failure
        #[arg(long)]
        continue_on_error: bool,
        /// Re-read live resources from the providers before diffing
        #[arg(short, long)]
        refresh: bool,
    },
    /// Delete every managed resource, in reverse dependency order
    Destroy {
        /// Confirm the deletion
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the exported values of the last apply
    Outputs,
    /// Render the Ansible inventory for the cluster VMs
    Inventory {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("labwarden=info")),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("labwarden {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => labwarden_config::find_config_file()?,
    };

    let secrets = Secrets {
        edge_root_password: std::env::var(EDGE_PASSWORD_VAR).ok(),
    };
    let desired = labwarden_config::load_desired_state(&config_path, &secrets)?;

    let registry = build_registry(&desired);
    let manager = StateManager::new(std::env::current_dir()?);

    match cli.command {
        Commands::Plan { refresh } => {
            let mut state = manager.load().await?;
            if refresh {
                refresh_state(&mut state, &registry).await?;
            }

            let plan = plan(&desired, &state)?;
            print_plan(&plan);

            if plan.requires_confirmation() {
                println!();
                println!(
                    "{}",
                    "! plan contains destructive replaces, apply will need --yes".yellow()
                );
            }
        }
        Commands::Apply {
            yes,
            continue_on_error,
            refresh,
        } => {
            let lock = manager.acquire_lock().await?;
            let mut state = manager.load().await?;
            if refresh {
                refresh_state(&mut state, &registry).await?;
                manager.save(&state).await?;
            }

            let plan = plan(&desired, &state)?;
            print_plan(&plan);

            if !plan.has_changes {
                println!();
                println!("{}", "✓ fleet already matches the configuration".green());
                lock.release().await?;
                return Ok(());
            }

            if plan.requires_confirmation() && !yes {
                println!();
                for op in plan.destructive_operations() {
                    println!(
                        "  {} {} will be destroyed and recreated",
                        "±".red().bold(),
                        op.key.to_string().red()
                    );
                }
                println!();
                println!("{}", "✗ refusing to replace without --yes".red().bold());
                lock.release().await?;
                anyhow::bail!("destructive plan not approved");
            }

            let exports = ExportStore::new();
            let options = ApplyOptions {
                continue_on_error,
                approve_destructive: yes,
            };

            println!();
            println!("{}", "▶ applying...".green().bold());
            let result = apply(&plan, &desired, &mut state, &registry, &exports, &options).await;

            // Whatever happened, persist what we know.
            manager.save(&state).await?;

            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    lock.release().await?;
                    return Err(handle_apply_error(e));
                }
            };

            publish_fleet_exports(&desired, &exports);
            print_report(&report);
            print_exports(&exports);
            lock.release().await?;

            if !report.is_success() {
                anyhow::bail!("apply finished with failures");
            }
        }
        Commands::Destroy { yes } => {
            let lock = manager.acquire_lock().await?;
            let mut state = manager.load().await?;

            if state.is_empty() {
                println!("{}", "✓ nothing to destroy".green());
                lock.release().await?;
                return Ok(());
            }

            let empty = desired.emptied();
            let plan = plan(&empty, &state)?;
            print_plan(&plan);

            if !yes {
                println!();
                println!(
                    "{}",
                    "✗ this deletes every managed resource, re-run with --yes".red().bold()
                );
                lock.release().await?;
                anyhow::bail!("destroy not confirmed");
            }

            let exports = ExportStore::new();
            let options = ApplyOptions {
                continue_on_error: false,
                approve_destructive: true,
            };

            println!();
            println!("{}", "▶ destroying...".red().bold());
            let result = apply(&plan, &empty, &mut state, &registry, &exports, &options).await;
            manager.save(&state).await?;

            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    lock.release().await?;
                    return Err(handle_apply_error(e));
                }
            };

            print_report(&report);
            lock.release().await?;

            if !report.is_success() {
                anyhow::bail!("destroy finished with failures");
            }
        }
        Commands::Outputs => {
            let state = manager.load().await?;
            let exports = collect_exports(&desired, &state);
            if exports.snapshot().is_empty() {
                println!("{}", "no exports recorded, run apply first".yellow());
            } else {
                print_exports(&exports);
            }
        }
        Commands::Inventory { output } => {
            let state = manager.load().await?;
            let exports = collect_exports(&desired, &state);
            let yaml = labwarden_inventory::render_inventory(&desired, &exports.snapshot())?;

            match output {
                Some(path) => {
                    tokio::fs::write(&path, &yaml).await?;
                    println!(
                        "{} inventory written to {}",
                        "✓".green(),
                        path.display().to_string().cyan()
                    );
                }
                None => print!("{yaml}"),
            }
        }
        Commands::Version => unreachable!(),
    }

    Ok(())
}

fn build_registry(desired: &DesiredState) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ProxmoxProvider::new(
        desired.settings().node_name.clone(),
    )));
    registry.register(Arc::new(LinodeProvider::new()));
    registry
}

/// Re-read every recorded resource from its provider, dropping records
/// for resources that no longer exist.
async fn refresh_state(
    state: &mut ObservedState,
    registry: &ProviderRegistry,
) -> anyhow::Result<()> {
    println!("{}", "▶ refreshing state from providers...".blue());

    let targets: Vec<(ResourceKey, String)> = state
        .records()
        .map(|r| (r.key(), r.provider.clone()))
        .collect();

    for (key, provider_name) in targets {
        let Some(provider) = registry.get(&provider_name) else {
            tracing::warn!(resource = %key, provider = %provider_name, "no adapter registered, skipping refresh");
            continue;
        };
        match provider.read(key.kind, &key.name).await {
            Ok(Some(attributes)) => {
                if let Some(record) = state.get_mut(&key) {
                    for (attr, value) in attributes {
                        record.set_attribute(attr, value);
                    }
                }
            }
            Ok(None) => {
                println!("  {} {} is gone on the provider", "ℹ".yellow(), key);
                state.remove(&key);
            }
            Err(e) => {
                anyhow::bail!("refresh of {key} failed: {e}");
            }
        }
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("{}", "plan:".bold());
    for op in &plan.operations {
        let line = match op.op {
            OpKind::Create => format!("  {} create {}", "+".green().bold(), op.key).green(),
            OpKind::Update => format!("  {} update {}", "~".yellow().bold(), op.key).yellow(),
            OpKind::Replace => format!("  {} replace {}", "±".red().bold(), op.key).red(),
            OpKind::Delete => format!("  {} delete {}", "-".red().bold(), op.key).red(),
            OpKind::NoOp => continue,
        };
        println!("{line}");
        for (attr, change) in &op.diff {
            println!(
                "      {}: {} -> {}",
                attr,
                change
                    .from
                    .as_ref()
                    .map(value_to_string)
                    .unwrap_or_else(|| "(none)".to_string()),
                change
                    .to
                    .as_ref()
                    .map(value_to_string)
                    .unwrap_or_else(|| "(none)".to_string()),
            );
        }
    }
    println!();
    println!("{}", plan.summary().to_string().bold());
}

fn print_report(report: &ApplyReport) {
    println!();
    for applied in &report.applied {
        println!("  {} {} {}", "✓".green(), applied.op, applied.key);
    }
    for failed in &report.failed {
        println!(
            "  {} {} {}: {}",
            "✗".red().bold(),
            failed.op,
            failed.key,
            failed.error.red()
        );
    }
    for skipped in &report.skipped {
        println!(
            "  {} {} {} {}",
            "ℹ".yellow(),
            skipped.op,
            skipped.key,
            "(not attempted)".yellow()
        );
    }
    println!();
    let summary = format!("{report} in {}ms", report.duration_ms);
    if report.is_success() {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.red().bold());
    }
}

fn print_exports(exports: &ExportStore) {
    let snapshot = exports.snapshot();
    if snapshot.is_empty() {
        return;
    }
    println!();
    println!("{}", "outputs:".bold());
    for (key, value) in snapshot.iter() {
        println!("  {} = {}", key.cyan(), value);
    }
}

fn handle_apply_error(e: ApplyError) -> anyhow::Error {
    if let ApplyError::DestructiveNotApproved(key) = &e {
        eprintln!(
            "{}",
            format!("✗ replacing {key} is destructive, re-run with --yes").red()
        );
    }
    e.into()
}

/// Fleet-level exports that belong to no single resource.
fn publish_fleet_exports(desired: &DesiredState, exports: &ExportStore) {
    let vm_count = desired
        .resources()
        .iter()
        .filter(|r| r.provider == labwarden_config::PROXMOX_PROVIDER)
        .count();
    // Ignore conflicts: a resource-level export with these names would
    // be a config bug, but not one worth failing the apply over.
    let _ = exports.publish("nodeName", desired.settings().node_name.clone());
    let _ = exports.publish("vmCount", vm_count.to_string());
}

/// Rebuild the export surface from persisted state, for commands that
/// run without applying.
fn collect_exports(desired: &DesiredState, state: &ObservedState) -> ExportStore {
    let exports = ExportStore::new();
    for spec in desired.resources() {
        let Some(record) = state.get(&spec.key()) else {
            continue;
        };
        let mut context = record.attributes.clone();
        context.insert("id".to_string(), serde_json::json!(record.id));
        for (export_key, attribute) in &spec.exports {
            if let Some(value) = context.get(attribute) {
                let _ = exports.publish(export_key.clone(), value_to_string(value));
            }
        }
    }
    if !state.is_empty() {
        publish_fleet_exports(desired, &exports);
    }
    exports
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
