//! cordon - egress lockdown bootstrap for sandboxed coding agents
//!
//! Converts an unrestricted network into a default-deny egress-filtered
//! one: flushes existing policy, preserves container DNS wiring, builds a
//! trusted allow-list from remote range metadata plus resolved service
//! domains, keeps the host network reachable, installs the lockdown, and
//! verifies it with live probes. Any fatal error after mutation begins
//! rolls the host back to a permissive ruleset.
//!
//! # Usage
//!
//! ```bash
//! cordon up                      # Run the full bootstrap
//! cordon up --config custom.json # With an explicit config file
//! cordon down                    # Reset to permissive accept
//! cordon status                  # Inspect the installed policy
//! cordon export                  # Print the would-be batches, no mutation
//! ```
//!
//! Exit code is 0 on verified success and 1 on any fatal condition.

use clap::{Parser, Subcommand};
use cordon::core::bootstrap::{self, Bootstrap};
use cordon::core::domains::SystemResolver;
use cordon::core::gateway::{self, GatewayDetector, IpRouteDetector};
use cordon::core::meta::{self, HttpRangeSource, RangeSource};
use cordon::core::nft::{NftSink, PolicySink};
use cordon::core::policy;
use cordon::{audit, config, utils};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cordon")]
#[command(version)]
#[command(about = "Egress lockdown bootstrap for sandboxed coding agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flush, rebuild the allow-list, lock down egress, and verify
    Up {
        /// Path to a config file (default: XDG config dir)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Reset the packet filter to permissive accept
    Down,
    /// Show whether the lockdown is installed and how big the allow-list is
    Status,
    /// Print the generated batches as JSON without touching the kernel
    Export {
        /// Path to a config file (default: XDG config dir)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    // Timestamped status lines on the diagnostic stream; stdout stays
    // clean for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let _ = utils::ensure_dirs();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> cordon::Result<()> {
    match command {
        Commands::Up { config } => {
            let config = config::load_config(config.as_deref()).await?;
            let _lock = utils::acquire_instance_lock()?;

            let sink = NftSink::new();
            let ranges = HttpRangeSource::new(
                config.meta_url.clone(),
                config.token_env.clone(),
                config.fetch_timeout(),
            )?;
            let domains = SystemResolver::new(config.resolve_timeout());
            let detector = IpRouteDetector::new();

            let pipeline = Bootstrap::new(&config, &sink, &ranges, &domains, &detector);
            let report = pipeline.run().await?;

            println!("Egress lockdown verified.");
            println!("  run id:        {}", report.run_id);
            println!(
                "  allow-list:    {} range(s) ({} remote, {} resolved)",
                report.aggregated_ranges, report.remote_entries, report.domain_entries
            );
            println!("  host network:  {}", report.host_network);
            println!("  fingerprint:   {}", report.fingerprint);
        }
        Commands::Down => {
            let _lock = utils::acquire_instance_lock()?;
            let sink = NftSink::new();
            let run_id = Uuid::new_v4();

            match sink.flush_ruleset().await {
                Ok(()) => {
                    audit::log_reset(run_id, true, None).await;
                    println!("Packet filter reset to permissive accept.");
                }
                Err(e) => {
                    audit::log_reset(run_id, false, Some(e.to_string())).await;
                    return Err(e);
                }
            }
        }
        Commands::Status => {
            let sink = NftSink::new();
            let ruleset = sink.list_ruleset().await?;
            print_status(&ruleset).await;
        }
        Commands::Export { config } => {
            let config = config::load_config(config.as_deref()).await?;

            let ranges = HttpRangeSource::new(
                config.meta_url.clone(),
                config.token_env.clone(),
                config.fetch_timeout(),
            )?;
            let document = ranges.fetch().await?;
            let raw_ranges = meta::parse_ranges(
                &document,
                &config.required_categories,
                &config.optional_categories,
            )?;

            let domains = SystemResolver::new(config.resolve_timeout());
            let collection = bootstrap::build_collection(&config, &domains, &raw_ranges).await;

            let detector = IpRouteDetector::new();
            let host_network =
                gateway::derive_host_network(detector.default_gateway().await?)?;

            let export = serde_json::json!({
                "allowlist": policy::collection_batch(&collection),
                "lockdown": policy::lockdown_batch(host_network),
            });
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
    }
    Ok(())
}

/// Reports lockdown state from the live ruleset listing.
async fn print_status(ruleset: &Value) {
    let objects = ruleset
        .get("nftables")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let table_installed = objects.iter().any(|obj| {
        obj.get("table")
            .and_then(|t| t.get("name"))
            .and_then(Value::as_str)
            == Some(policy::POLICY_TABLE)
    });

    if !table_installed {
        println!("Lockdown: not installed (no '{}' table)", policy::POLICY_TABLE);
        return;
    }

    let element_count: usize = objects
        .iter()
        .filter_map(|obj| obj.get("set"))
        .filter(|set| {
            set.get("name").and_then(Value::as_str) == Some(policy::ALLOW_SET)
                && set.get("table").and_then(Value::as_str) == Some(policy::POLICY_TABLE)
        })
        .filter_map(|set| set.get("elem").and_then(Value::as_array))
        .map(Vec::len)
        .sum();

    println!("Lockdown: installed");
    println!("  table:      {}", policy::POLICY_TABLE);
    println!("  allow-list: {} element(s) in @{}", element_count, policy::ALLOW_SET);

    if let Ok(log) = audit::AuditLog::new()
        && let Ok(events) = log.read_recent(1).await
        && let Some(last) = events.first()
    {
        let event_name = serde_json::to_string(&last.event_type).unwrap_or_default();
        println!(
            "  last event: {} ({}) at {}",
            event_name.trim_matches('"'),
            if last.success { "ok" } else { "failed" },
            last.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}
