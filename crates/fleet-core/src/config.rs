//! fleet.toml settings parser.
//!
//! [`FleetConfig`] mirrors the file; every tunable is optional and falls
//! back to the defaults below. [`FleetConfig::settings`] validates the file
//! and resolves it into [`ScalerSettings`], the typed form the components
//! are built from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{LaunchSpec, MetricRef};

pub const DEFAULT_HIGH_THRESHOLD: f64 = 70.0;
pub const DEFAULT_LOW_THRESHOLD: f64 = 20.0;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SERVICE_PORT: u16 = 80;
pub const DEFAULT_DASHBOARD_NAME: &str = "AutoScalingMonitoring";
pub const DEFAULT_PRIMARY_TAG_KEY: &str = "Role";
pub const DEFAULT_PRIMARY_TAG_VALUE: &str = "Primary";
/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Startup script for launched nodes: serves HTTP 200 on the service port
/// so the load balancer health check can pass. `{port}` is substituted by
/// [`default_bootstrap`].
pub const DEFAULT_BOOTSTRAP: &str = r#"#!/bin/bash
set -e
PORT={port}
mkdir -p /srv/fleetscale
echo "ok $(hostname -f)" > /srv/fleetscale/index.html
cd /srv/fleetscale
nohup python3 -m http.server "$PORT" >/var/log/fleetscale-health.log 2>&1 &
"#;

/// The built-in bootstrap script listening on `port`.
pub fn default_bootstrap(port: u16) -> String {
    DEFAULT_BOOTSTRAP.replace("{port}", &port.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub provider: ProviderConfig,
    pub launch: LaunchConfig,
    pub load_balancer: LoadBalancerConfig,
    pub alerts: AlertsConfig,
    pub primary: Option<PrimaryConfig>,
    pub scaling: Option<ScalingConfig>,
    pub lifecycle: Option<LifecycleConfig>,
    pub dashboard: Option<DashboardConfig>,
    pub behavior: Option<BehaviorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub image: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub subnet: Option<String>,
    pub tags: Option<BTreeMap<String, String>>,
    /// Path to a startup script, relative to the settings file.
    pub bootstrap_file: Option<PathBuf>,
    /// Inline startup script; ignored when `bootstrap_file` is set.
    pub bootstrap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub target_group: String,
    pub port: Option<u16>,
    /// Load balancer reference used only for dashboard panels.
    pub load_balancer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    pub tag_key: Option<String>,
    pub tag_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// "cpu" or "memory".
    pub metric: Option<String>,
    pub namespace: Option<String>,
    pub metric_name: Option<String>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub window: Option<String>,
    pub period: Option<String>,
    /// "lowest_utilization" or "last_listed".
    pub scale_down_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub poll_interval: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// "full" or "launch_only".
    pub profile: Option<String>,
    pub reuse_stopped: Option<bool>,
    pub render_dashboard: Option<bool>,
    pub publish_metrics: Option<bool>,
    pub concurrent_metrics: Option<bool>,
}

// ── Resolved settings ─────────────────────────────────────────────

/// Utilization signal the fleet is scaled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilizationMetric {
    Cpu,
    Memory,
}

impl UtilizationMetric {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Default metric reference for this signal.
    pub fn default_ref(&self) -> MetricRef {
        let (namespace, name) = match self {
            Self::Cpu => ("AWS/EC2", "CPUUtilization"),
            Self::Memory => ("CWAgent", "mem_used_percent"),
        };
        MetricRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            dimension: "InstanceId".to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Memory => "Memory",
        }
    }
}

/// Scaling thresholds in percent. `low <= high`, both finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    low: f64,
    high: f64,
}

impl Thresholds {
    pub fn new(low: f64, high: f64) -> Result<Self, ConfigError> {
        if !low.is_finite() || !high.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "thresholds must be finite (low={low}, high={high})"
            )));
        }
        if low > high {
            return Err(ConfigError::Invalid(format!(
                "low threshold {low} exceeds high threshold {high}"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }
}

/// Which non-primary node a scale-down stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleDownPolicy {
    /// Lowest measured utilization; ties go to the later inventory position.
    #[default]
    LowestUtilization,
    /// Last candidate in inventory order.
    LastListed,
}

impl ScaleDownPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "lowest_utilization" => Some(Self::LowestUtilization),
            "last_listed" => Some(Self::LastListed),
            _ => None,
        }
    }
}

/// Preset bundles of behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BehaviorProfile {
    /// Always launch a new node; no dashboard or custom metrics.
    LaunchOnly,
    /// Reuse stopped nodes, render the dashboard, publish custom metrics.
    #[default]
    Full,
}

impl BehaviorProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "launch_only" => Some(Self::LaunchOnly),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviorFlags {
    pub reuse_stopped: bool,
    pub render_dashboard: bool,
    pub publish_metrics: bool,
    pub concurrent_metrics: bool,
}

impl BehaviorFlags {
    pub fn for_profile(profile: BehaviorProfile) -> Self {
        match profile {
            BehaviorProfile::LaunchOnly => Self {
                reuse_stopped: false,
                render_dashboard: false,
                publish_metrics: false,
                concurrent_metrics: false,
            },
            BehaviorProfile::Full => Self {
                reuse_stopped: true,
                render_dashboard: true,
                publish_metrics: true,
                concurrent_metrics: false,
            },
        }
    }
}

impl Default for BehaviorFlags {
    fn default() -> Self {
        Self::for_profile(BehaviorProfile::default())
    }
}

/// Tag that marks a node as primary (protected from scale-down).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryTag {
    pub key: String,
    pub value: String,
}

impl PrimaryTag {
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.get(&self.key).is_some_and(|v| v == &self.value)
    }
}

impl Default for PrimaryTag {
    fn default() -> Self {
        Self {
            key: DEFAULT_PRIMARY_TAG_KEY.to_string(),
            value: DEFAULT_PRIMARY_TAG_VALUE.to_string(),
        }
    }
}

/// Polling budget for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_LIFECYCLE_TIMEOUT,
        }
    }
}

/// Validated settings the control loop is built from.
#[derive(Debug, Clone)]
pub struct ScalerSettings {
    pub region: String,
    pub launch: LaunchSpec,
    pub target_group: String,
    pub service_port: u16,
    pub load_balancer_ref: Option<String>,
    pub primary_tag: PrimaryTag,
    pub metric_kind: UtilizationMetric,
    pub metric: MetricRef,
    pub thresholds: Thresholds,
    pub window: Duration,
    pub period: Duration,
    pub scale_down_policy: ScaleDownPolicy,
    pub lifecycle: PollBudget,
    pub alert_topic: String,
    pub dashboard_name: String,
    pub behavior: BehaviorFlags,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and resolve a settings file in one step.
    pub fn load_settings(path: &Path) -> Result<ScalerSettings, ConfigError> {
        let config = Self::from_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.settings(base_dir)
    }

    /// Validate and resolve into [`ScalerSettings`]. Relative bootstrap
    /// paths are resolved against `base_dir`.
    pub fn settings(&self, base_dir: &Path) -> Result<ScalerSettings, ConfigError> {
        let scaling = self.scaling.as_ref();
        let lifecycle = self.lifecycle.as_ref();
        let behavior = self.behavior.as_ref();

        let metric_kind = match scaling.and_then(|s| s.metric.as_deref()) {
            Some(m) => UtilizationMetric::parse(m)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown scaling metric {m:?}")))?,
            None => UtilizationMetric::Cpu,
        };
        let mut metric = metric_kind.default_ref();
        if let Some(ns) = scaling.and_then(|s| s.namespace.clone()) {
            metric.namespace = ns;
        }
        if let Some(name) = scaling.and_then(|s| s.metric_name.clone()) {
            metric.name = name;
        }

        let thresholds = Thresholds::new(
            scaling.and_then(|s| s.low).unwrap_or(DEFAULT_LOW_THRESHOLD),
            scaling.and_then(|s| s.high).unwrap_or(DEFAULT_HIGH_THRESHOLD),
        )?;

        let window = duration_field("scaling.window", scaling.and_then(|s| s.window.as_deref()))?
            .unwrap_or(DEFAULT_WINDOW);
        let period = duration_field("scaling.period", scaling.and_then(|s| s.period.as_deref()))?
            .unwrap_or(DEFAULT_PERIOD);
        if period.is_zero() || window < period {
            return Err(ConfigError::Invalid(format!(
                "look-back window {window:?} must cover at least one non-zero period {period:?}"
            )));
        }

        let scale_down_policy = match scaling.and_then(|s| s.scale_down_policy.as_deref()) {
            Some(p) => ScaleDownPolicy::parse(p)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown scale-down policy {p:?}")))?,
            None => ScaleDownPolicy::default(),
        };

        let interval = duration_field(
            "lifecycle.poll_interval",
            lifecycle.and_then(|l| l.poll_interval.as_deref()),
        )?
        .unwrap_or(DEFAULT_POLL_INTERVAL);
        let timeout = duration_field("lifecycle.timeout", lifecycle.and_then(|l| l.timeout.as_deref()))?
            .unwrap_or(DEFAULT_LIFECYCLE_TIMEOUT);
        if interval.is_zero() {
            return Err(ConfigError::Invalid("lifecycle.poll_interval must be non-zero".into()));
        }

        let profile = match behavior.and_then(|b| b.profile.as_deref()) {
            Some(p) => BehaviorProfile::parse(p)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown behavior profile {p:?}")))?,
            None => BehaviorProfile::default(),
        };
        let mut flags = BehaviorFlags::for_profile(profile);
        if let Some(b) = behavior {
            flags.reuse_stopped = b.reuse_stopped.unwrap_or(flags.reuse_stopped);
            flags.render_dashboard = b.render_dashboard.unwrap_or(flags.render_dashboard);
            flags.publish_metrics = b.publish_metrics.unwrap_or(flags.publish_metrics);
            flags.concurrent_metrics = b.concurrent_metrics.unwrap_or(flags.concurrent_metrics);
        }

        let primary_tag = match &self.primary {
            Some(p) => PrimaryTag {
                key: p.tag_key.clone().unwrap_or_else(|| DEFAULT_PRIMARY_TAG_KEY.to_string()),
                value: p
                    .tag_value
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PRIMARY_TAG_VALUE.to_string()),
            },
            None => PrimaryTag::default(),
        };

        if self.load_balancer.target_group.trim().is_empty() {
            return Err(ConfigError::Invalid("load_balancer.target_group is empty".into()));
        }

        Ok(ScalerSettings {
            region: self.provider.region.clone(),
            launch: self.launch_spec(base_dir)?,
            target_group: self.load_balancer.target_group.clone(),
            service_port: self.service_port(),
            load_balancer_ref: self.load_balancer.load_balancer.clone(),
            primary_tag,
            metric_kind,
            metric,
            thresholds,
            window,
            period,
            scale_down_policy,
            lifecycle: PollBudget { interval, timeout },
            alert_topic: self.alerts.topic.clone(),
            dashboard_name: self
                .dashboard
                .as_ref()
                .and_then(|d| d.name.clone())
                .unwrap_or_else(|| DEFAULT_DASHBOARD_NAME.to_string()),
            behavior: flags,
        })
    }

    fn service_port(&self) -> u16 {
        self.load_balancer.port.unwrap_or(DEFAULT_SERVICE_PORT)
    }

    fn launch_spec(&self, base_dir: &Path) -> Result<LaunchSpec, ConfigError> {
        let launch = &self.launch;
        let bootstrap = match (&launch.bootstrap_file, &launch.bootstrap) {
            (Some(file), _) => std::fs::read(base_dir.join(file))?,
            (None, Some(inline)) => inline.clone().into_bytes(),
            (None, None) => default_bootstrap(self.service_port()).into_bytes(),
        };
        let tags = launch.tags.clone().unwrap_or_else(|| {
            BTreeMap::from([("Purpose".to_string(), "ScaledInstance".to_string())])
        });
        Ok(LaunchSpec {
            image: launch.image.clone(),
            instance_type: launch.instance_type.clone(),
            key_name: launch.key_name.clone(),
            security_groups: launch.security_groups.clone(),
            subnet: launch.subnet.clone(),
            tags,
            bootstrap,
        })
    }

    /// Scaffold a minimal fleet.toml.
    pub fn scaffold(region: &str, target_group: &str, topic: &str) -> Self {
        FleetConfig {
            provider: ProviderConfig {
                region: region.to_string(),
            },
            launch: LaunchConfig {
                image: "ami-00000000000000000".to_string(),
                instance_type: "t3.micro".to_string(),
                key_name: None,
                security_groups: Vec::new(),
                subnet: None,
                tags: None,
                bootstrap_file: None,
                bootstrap: None,
            },
            load_balancer: LoadBalancerConfig {
                target_group: target_group.to_string(),
                port: Some(DEFAULT_SERVICE_PORT),
                load_balancer: None,
            },
            alerts: AlertsConfig {
                topic: topic.to_string(),
            },
            primary: Some(PrimaryConfig {
                tag_key: Some(DEFAULT_PRIMARY_TAG_KEY.to_string()),
                tag_value: Some(DEFAULT_PRIMARY_TAG_VALUE.to_string()),
            }),
            scaling: Some(ScalingConfig {
                metric: Some("cpu".to_string()),
                namespace: None,
                metric_name: None,
                high: Some(DEFAULT_HIGH_THRESHOLD),
                low: Some(DEFAULT_LOW_THRESHOLD),
                window: Some("5m".to_string()),
                period: Some("60s".to_string()),
                scale_down_policy: Some("lowest_utilization".to_string()),
            }),
            lifecycle: Some(LifecycleConfig {
                poll_interval: Some("15s".to_string()),
                timeout: Some("300s".to_string()),
            }),
            dashboard: None,
            behavior: None,
        }
    }
}

fn duration_field(field: &'static str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    let Some(v) = value else {
        return Ok(None);
    };
    let d = parse_duration(v).ok_or_else(|| ConfigError::Duration {
        field,
        value: v.to_string(),
    })?;
    if d > MAX_DURATION {
        return Err(ConfigError::Invalid(format!(
            "{field} = {v:?} exceeds the {}s maximum",
            MAX_DURATION.as_secs()
        )));
    }
    Ok(Some(d))
}

/// Parse a duration string like "15s", "500ms", "5m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
