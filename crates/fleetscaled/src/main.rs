//! fleetscaled — run one autoscaling tick against the local backend.
//!
//! # Usage
//!
//! ```text
//! fleetscaled config init --target-group web --topic ops
//! fleetscaled node add i-0a1 --primary
//! fleetscaled metrics put i-0a1 82.5
//! fleetscaled tick
//! fleetscaled dashboard show
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::config::{DEFAULT_DASHBOARD_NAME, parse_duration};
use fleet_core::{
    Clock, Collaborators, FleetConfig, LeaseProvider, MetricRef, NodeState, ScalerSettings,
    SystemClock, UtilizationMetric,
};
use fleetscale_state::{LocalBackend, LocalBehavior, StateStore};
use fleetscaled::{ActionOutcome, ControlLoop, lease_ttl};

const DEFAULT_LOG_FILTER: &str = "info,fleetscaled=debug,fleetscale=debug";

#[derive(Parser)]
#[command(name = "fleetscaled", about = "fleetscale autoscaling control loop")]
struct Cli {
    /// Settings file.
    #[arg(long, global = true, default_value = "fleet.toml")]
    config: PathBuf,

    /// Local state database.
    #[arg(long, global = true, default_value = "fleetscale.redb")]
    state: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one tick under the tick lease.
    Tick {
        /// Lease holder name (defaults to fleetscaled-<pid>).
        #[arg(long)]
        holder: Option<String>,

        /// Status checks a started node reports not-ready before booting.
        #[arg(long, default_value = "0")]
        boot_checks: u32,

        /// Health checks a registered node reports initial before healthy.
        #[arg(long, default_value = "0")]
        health_checks: u32,
    },
    /// Settings file management.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Local fleet inventory.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
    /// Local utilization samples.
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },
    /// Stored dashboard definition.
    Dashboard {
        #[command(subcommand)]
        command: DashboardCommand,
    },
    /// Delivered alerts.
    Alerts {
        #[command(subcommand)]
        command: AlertsCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a scaffold settings file.
    Init {
        #[arg(long, default_value = "eu-north-1")]
        region: String,
        #[arg(long, default_value = "fleet-targets")]
        target_group: String,
        #[arg(long, default_value = "ScalingAlerts")]
        topic: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Add a node to the local fleet.
    Add {
        id: String,
        /// Add the node stopped instead of running.
        #[arg(long)]
        stopped: bool,
        /// Tag the node with the configured primary tag.
        #[arg(long)]
        primary: bool,
        /// Extra tag, KEY=VALUE. Repeatable.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },
    /// List local nodes.
    List,
}

#[derive(Subcommand)]
enum MetricsCommand {
    /// Record one utilization sample for a node.
    Put {
        node: String,
        value: f64,
        /// "cpu" or "memory" (defaults to the configured scaling metric).
        #[arg(long)]
        metric: Option<String>,
        /// Age of the sample, e.g. "90s".
        #[arg(long, default_value = "0s")]
        ago: String,
    },
}

#[derive(Subcommand)]
enum DashboardCommand {
    /// Print the stored dashboard body.
    Show {
        /// Dashboard name (defaults to the configured dashboard.name).
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum AlertsCommand {
    /// Print delivered alerts, oldest first.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Command::Tick {
            holder,
            boot_checks,
            health_checks,
        } => {
            let behavior = LocalBehavior {
                boot_checks: *boot_checks,
                health_checks: *health_checks,
            };
            run_tick(&cli, holder.clone(), behavior).await
        }
        Command::Config {
            command:
                ConfigCommand::Init {
                    region,
                    target_group,
                    topic,
                    force,
                },
        } => config_init(&cli.config, region, target_group, topic, *force),
        Command::Node { command } => node_command(&cli, command),
        Command::Metrics {
            command:
                MetricsCommand::Put {
                    node,
                    value,
                    metric,
                    ago,
                },
        } => metrics_put(&cli, node, *value, metric.as_deref(), ago),
        Command::Dashboard {
            command: DashboardCommand::Show { name },
        } => dashboard_show(&cli, name.as_deref()),
        Command::Alerts {
            command: AlertsCommand::List,
        } => alerts_list(&cli),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Settings for operator commands that work without a config file.
fn optional_settings(cli: &Cli) -> Option<ScalerSettings> {
    match FleetConfig::load_settings(&cli.config) {
        Ok(settings) => Some(settings),
        Err(e) => {
            debug!(path = ?cli.config, error = %e, "settings unavailable, using defaults");
            None
        }
    }
}

/// The metric a sample is recorded under: the configured reference unless
/// another metric kind is requested explicitly.
fn sample_metric(
    settings: Option<&ScalerSettings>,
    requested: Option<&str>,
) -> anyhow::Result<MetricRef> {
    let requested = requested
        .map(|m| UtilizationMetric::parse(m).ok_or_else(|| anyhow!("unknown metric {m:?}")))
        .transpose()?;
    Ok(match (settings, requested) {
        (Some(s), None) => s.metric.clone(),
        (Some(s), Some(kind)) if kind == s.metric_kind => s.metric.clone(),
        (_, Some(kind)) => kind.default_ref(),
        (None, None) => UtilizationMetric::Cpu.default_ref(),
    })
}

fn dashboard_name(settings: Option<&ScalerSettings>, requested: Option<&str>) -> String {
    match (requested, settings) {
        (Some(name), _) => name.to_string(),
        (None, Some(s)) => s.dashboard_name.clone(),
        (None, None) => DEFAULT_DASHBOARD_NAME.to_string(),
    }
}

fn open_backend(cli: &Cli, behavior: LocalBehavior, clock: Arc<dyn Clock>) -> anyhow::Result<LocalBackend> {
    let store = StateStore::open(&cli.state)
        .with_context(|| format!("opening state database {}", cli.state.display()))?;
    debug!(path = ?cli.state, "state store opened");
    Ok(LocalBackend::new(store, behavior, clock))
}

async fn run_tick(cli: &Cli, holder: Option<String>, behavior: LocalBehavior) -> anyhow::Result<()> {
    let settings = FleetConfig::load_settings(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = Arc::new(open_backend(cli, behavior, clock.clone())?);

    let holder = holder.unwrap_or_else(|| format!("fleetscaled-{}", std::process::id()));
    let ttl = lease_ttl(&settings);
    let lease = backend
        .acquire(&holder, ttl, clock.now())
        .await
        .context("acquiring tick lease")?
        .ok_or_else(|| anyhow!("tick lease is held by another process; not running"))?;
    info!(%holder, expires_at = %lease.expires_at(), "tick lease acquired");

    let control = ControlLoop::new(settings, &Collaborators::from_backend(backend.clone(), clock));
    let result = control.tick(&lease).await;

    if let Err(e) = backend.release(&lease).await {
        warn!(error = %e, "failed to release tick lease");
    }
    let report = result.context("tick aborted")?;

    println!("stages:   {:?}", report.stages);
    if let Some(avg) = report.fleet_average {
        println!("average:  {avg:.2}%");
    }
    if let Some(decision) = report.decision {
        println!("decision: {decision}");
    }
    match &report.action {
        ActionOutcome::None => {}
        ActionOutcome::ScaledUp { node_id, origin } => {
            println!("action:   scaled up {node_id} ({origin:?})")
        }
        ActionOutcome::ScaleUpIncomplete {
            node_id,
            state,
            reason,
        } => println!(
            "action:   scale-up incomplete for {} in {state}: {reason}",
            node_id.as_deref().unwrap_or("<not launched>")
        ),
        ActionOutcome::ScaledDown { node_id } => println!("action:   scaled down {node_id}"),
        ActionOutcome::ScaleDownSkipped => println!("action:   scale-down skipped (all primary)"),
        ActionOutcome::ScaleDownFailed { node_id, reason } => {
            println!("action:   scale-down of {node_id} failed: {reason}")
        }
    }
    println!("healthy:  {:?}", report.healthy);
    for w in &report.warnings {
        println!("warning:  {w}");
    }
    Ok(())
}

fn config_init(
    path: &Path,
    region: &str,
    target_group: &str,
    topic: &str,
    force: bool,
) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let toml = FleetConfig::scaffold(region, target_group, topic).to_toml_string()?;
    std::fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn node_command(cli: &Cli, command: &NodeCommand) -> anyhow::Result<()> {
    let backend = open_backend(cli, LocalBehavior::default(), Arc::new(SystemClock))?;
    match command {
        NodeCommand::Add {
            id,
            stopped,
            primary,
            tags,
        } => {
            let state = if *stopped {
                NodeState::Stopped
            } else {
                NodeState::Running
            };
            let mut all: Vec<(String, String)> = tags.clone();
            if *primary {
                let tag = optional_settings(cli)
                    .map(|settings| settings.primary_tag)
                    .unwrap_or_default();
                all.push((tag.key, tag.value));
            }
            let borrowed: Vec<(&str, &str)> =
                all.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            backend.add_node(id, state, &borrowed)?;
            println!("added {id} ({state})");
        }
        NodeCommand::List => {
            for node in backend.store().list_nodes()? {
                let tags: Vec<String> = node.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{:<22} {:<14} {}", node.id, node.state, tags.join(","));
            }
        }
    }
    Ok(())
}

fn metrics_put(
    cli: &Cli,
    node: &str,
    value: f64,
    metric: Option<&str>,
    ago: &str,
) -> anyhow::Result<()> {
    let metric = sample_metric(optional_settings(cli).as_ref(), metric)?;
    let ago = parse_duration(ago).ok_or_else(|| anyhow!("invalid duration {ago:?}"))?;
    let clock = Arc::new(SystemClock);
    let at = clock.now() - chrono::Duration::from_std(ago)?;

    let backend = open_backend(cli, LocalBehavior::default(), clock)?;
    backend.record_sample(node, &metric, at, value)?;
    println!("recorded {value} for {node} as {}/{} at {at}", metric.namespace, metric.name);
    Ok(())
}

fn dashboard_show(cli: &Cli, name: Option<&str>) -> anyhow::Result<()> {
    let name = dashboard_name(optional_settings(cli).as_ref(), name);
    let backend = open_backend(cli, LocalBehavior::default(), Arc::new(SystemClock))?;
    let dashboard = backend
        .store()
        .get_dashboard(&name)?
        .ok_or_else(|| anyhow!("no dashboard named {name:?}"))?;
    println!("{}", serde_json::to_string_pretty(&dashboard.body)?);
    Ok(())
}

fn alerts_list(cli: &Cli) -> anyhow::Result<()> {
    let backend = open_backend(cli, LocalBehavior::default(), Arc::new(SystemClock))?;
    for alert in backend.store().list_alerts()? {
        println!("{}  [{}] {}: {}", alert.sent_at, alert.topic, alert.subject, alert.body);
    }
    Ok(())
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overridden() -> ScalerSettings {
        let mut config = FleetConfig::scaffold("eu-north-1", "web", "ops");
        if let Some(scaling) = config.scaling.as_mut() {
            scaling.namespace = Some("Custom/App".to_string());
            scaling.metric_name = Some("BusyPercent".to_string());
        }
        config.settings(Path::new(".")).unwrap()
    }

    #[test]
    fn samples_follow_configured_metric() {
        let settings = overridden();

        let metric = sample_metric(Some(&settings), None).unwrap();
        assert_eq!(metric, settings.metric);
        assert_eq!(metric.namespace, "Custom/App");

        let metric = sample_metric(Some(&settings), Some("cpu")).unwrap();
        assert_eq!(metric.name, "BusyPercent");

        let memory = sample_metric(Some(&settings), Some("memory")).unwrap();
        assert_eq!(memory, UtilizationMetric::Memory.default_ref());

        let fallback = sample_metric(None, None).unwrap();
        assert_eq!(fallback, UtilizationMetric::Cpu.default_ref());

        assert!(sample_metric(None, Some("disk")).is_err());
    }

    #[test]
    fn dashboard_name_prefers_flag_then_settings() {
        let mut settings = overridden();
        settings.dashboard_name = "web-fleet".to_string();

        assert_eq!(dashboard_name(Some(&settings), None), "web-fleet");
        assert_eq!(dashboard_name(Some(&settings), Some("other")), "other");
        assert_eq!(dashboard_name(None, None), DEFAULT_DASHBOARD_NAME);
    }

    #[test]
    fn tags_parse_as_key_value() {
        assert_eq!(parse_tag("Team=web"), Ok(("Team".to_string(), "web".to_string())));
        assert!(parse_tag("Team").is_err());
    }
}
