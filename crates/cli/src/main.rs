use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use switchyard_controller::{Controller, ControllerConfig, LogExecutor};
use switchyard_core::{Filter, ObjectSource, WatchedObject};
use switchyard_kubehub::KubeSource;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "switchyardctl", version, about = "Watch the active pod and signal failover")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Label selector for the active pod
    #[arg(long = "selector", global = true, env = "SWITCHYARD_SELECTOR", default_value = "mode=active")]
    selector: String,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "SWITCHYARD_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the failover controller until Ctrl-C
    Run {
        /// Also fail over when the running active pod is deleted
        #[arg(long = "failover-on-delete", action = ArgAction::SetTrue)]
        failover_on_delete: bool,
    },
    /// List pods matching the selector once
    Ls,
}

fn init_tracing() {
    let env = std::env::var("SWITCHYARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SWITCHYARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SWITCHYARD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let filter = Filter::new(cli.selector.clone(), cli.namespace.clone());

    match cli.command {
        Commands::Run { failover_on_delete } => {
            let mut cfg = ControllerConfig::from_env(filter.clone());
            cfg.policy.trigger_on_delete |= failover_on_delete;
            let source = Arc::new(KubeSource::try_default(&filter).await?);
            let mut ctrl = Controller::new(source, cfg);
            ctrl.with_failover(LogExecutor);

            let cancel = CancellationToken::new();
            // Exits non-zero through main's Err.
            ctrl.start(&cancel).await.context("starting controller")?;
            info!(selector = %filter.label_selector, "controller running; Ctrl-C to stop");

            tokio::select! {
                _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                _ = ctrl.stopped() => warn!("controller stopped unexpectedly"),
            }
            cancel.cancel();
            ctrl.stopped().await;
            info!("bye");
        }
        Commands::Ls => {
            info!(selector = %filter.label_selector, ns = ?filter.namespace, "ls invoked");
            let source = KubeSource::try_default(&filter).await?;
            let page = source.list(&filter).await.context("listing pods")?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<32} {:<10} {:>10}  AGE", "NAMESPACE", "NAME", "PHASE", "RV");
                    for o in &page.items {
                        println!(
                            "{:<16} {:<32} {:<10} {:>10}  {}",
                            o.key.namespace, o.key.name, o.phase.as_str(), o.resource_version.0, render_age(o)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&page.items)?),
            }
        }
    }
    Ok(())
}

fn render_age(o: &WatchedObject) -> String {
    let created = o
        .raw
        .get("metadata")
        .and_then(|m| m.get("creationTimestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created.with_timezone(&Utc)).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
