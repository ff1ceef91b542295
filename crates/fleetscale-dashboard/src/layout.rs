//! Declarative dashboard layout.
//!
//! The layout is a pure function of the healthy node set and the settings;
//! it is rebuilt from scratch every tick and never diffed against the
//! previous definition.

use serde::{Deserialize, Serialize};

use fleet_core::{MetricRef, NodeId, ScalerSettings};

/// Namespace of the custom metrics the control loop publishes.
pub const CUSTOM_NAMESPACE: &str = "FleetScale";
pub const SCALING_EVENTS_METRIC: &str = "ScalingEvents";
pub const RUNNING_NODES_METRIC: &str = "RunningNodes";

const GRID_COLUMNS: u32 = 24;
const PANEL_SIZE: u32 = 6;
const HALF_WIDTH: u32 = GRID_COLUMNS / 2;

// ── Widget tree ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSpec {
    pub widgets: Vec<Widget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub properties: WidgetProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetProperties {
    pub title: String,
    /// Each row is `[namespace, name, dim1, val1, ...]`.
    pub metrics: Vec<Vec<String>>,
    pub period: u64,
    pub stat: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<YAxis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YAxis {
    pub left: AxisRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl YAxis {
    fn percent() -> Self {
        Self {
            left: AxisRange {
                min: 0.0,
                max: Some(100.0),
            },
        }
    }

    fn from_zero() -> Self {
        Self {
            left: AxisRange { min: 0.0, max: None },
        }
    }
}

// ── Layout inputs ───────────────────────────────────────────────

/// Everything the layout depends on besides the healthy set.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutParams {
    pub region: String,
    pub metric: MetricRef,
    pub metric_label: String,
    pub period_secs: u64,
    pub target_group: String,
    pub load_balancer_ref: Option<String>,
}

impl LayoutParams {
    pub fn from_settings(settings: &ScalerSettings) -> Self {
        Self {
            region: settings.region.clone(),
            metric: settings.metric.clone(),
            metric_label: settings.metric_kind.label().to_string(),
            period_secs: settings.period.as_secs().max(1),
            target_group: settings.target_group.clone(),
            load_balancer_ref: settings.load_balancer_ref.clone(),
        }
    }

    fn node_row(&self, id: &str) -> Vec<String> {
        vec![
            self.metric.namespace.clone(),
            self.metric.name.clone(),
            self.metric.dimension.clone(),
            id.to_string(),
        ]
    }

    fn metric_widget(
        &self,
        (x, y, width, height): (u32, u32, u32, u32),
        title: String,
        metrics: Vec<Vec<String>>,
        stat: &str,
    ) -> Widget {
        Widget {
            kind: "metric".to_string(),
            x,
            y,
            width,
            height,
            properties: WidgetProperties {
                title,
                metrics,
                period: self.period_secs,
                stat: stat.to_string(),
                region: self.region.clone(),
                view: None,
                stacked: None,
                y_axis: None,
            },
        }
    }
}

/// Build the full widget tree for the given healthy nodes.
///
/// Node ids are sorted and de-duplicated first, so the same set always
/// yields the same layout regardless of input order.
pub fn render_layout(healthy: &[NodeId], params: &LayoutParams) -> DashboardSpec {
    let mut nodes: Vec<&str> = healthy.iter().map(String::as_str).collect();
    nodes.sort_unstable();
    nodes.dedup();

    let per_row = GRID_COLUMNS / PANEL_SIZE;
    let mut widgets = Vec::with_capacity(nodes.len() + 5);

    for (i, id) in nodes.iter().enumerate() {
        let i = i as u32;
        let at = ((i % per_row) * PANEL_SIZE, (i / per_row) * PANEL_SIZE, PANEL_SIZE, PANEL_SIZE);
        let mut w = params.metric_widget(
            at,
            format!("{}: {id}", params.metric_label),
            vec![params.node_row(id)],
            "Average",
        );
        w.properties.y_axis = Some(YAxis::percent());
        widgets.push(w);
    }

    let rows = (nodes.len() as u32).div_ceil(per_row);
    let mut y = rows * PANEL_SIZE;

    // Aggregate panel over every healthy node.
    let mut aggregate = params.metric_widget(
        (0, y, GRID_COLUMNS, PANEL_SIZE),
        format!("Overall {} (All Instances)", params.metric_label),
        nodes.iter().map(|id| params.node_row(id)).collect(),
        "Average",
    );
    aggregate.properties.view = Some("timeSeries".to_string());
    aggregate.properties.stacked = Some(false);
    aggregate.properties.y_axis = Some(YAxis::percent());
    widgets.push(aggregate);
    y += PANEL_SIZE;

    let events = params.metric_widget(
        (0, y, HALF_WIDTH, PANEL_SIZE),
        "Scaling Events".to_string(),
        ["ScaleUp", "ScaleDown"]
            .iter()
            .map(|action| {
                vec![
                    CUSTOM_NAMESPACE.to_string(),
                    SCALING_EVENTS_METRIC.to_string(),
                    "Action".to_string(),
                    action.to_string(),
                ]
            })
            .collect(),
        "Sum",
    );
    let running = params.metric_widget(
        (HALF_WIDTH, y, HALF_WIDTH, PANEL_SIZE),
        "Running Instances".to_string(),
        vec![vec![
            CUSTOM_NAMESPACE.to_string(),
            RUNNING_NODES_METRIC.to_string(),
        ]],
        "Maximum",
    );
    widgets.extend([events, running]);
    y += PANEL_SIZE;

    if let Some(lb) = &params.load_balancer_ref {
        let row = |name: &str| {
            vec![vec![
                "AWS/ApplicationELB".to_string(),
                name.to_string(),
                "TargetGroup".to_string(),
                params.target_group.clone(),
                "LoadBalancer".to_string(),
                lb.clone(),
            ]]
        };
        let mut requests = params.metric_widget(
            (0, y, HALF_WIDTH, PANEL_SIZE),
            "Load Balancer Request Count".to_string(),
            row("RequestCount"),
            "Sum",
        );
        let mut latency = params.metric_widget(
            (HALF_WIDTH, y, HALF_WIDTH, PANEL_SIZE),
            "Load Balancer Latency".to_string(),
            row("Latency"),
            "Average",
        );
        for w in [&mut requests, &mut latency] {
            w.properties.view = Some("timeSeries".to_string());
            w.properties.y_axis = Some(YAxis::from_zero());
        }
        widgets.extend([requests, latency]);
    }

    DashboardSpec { widgets }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(lb: Option<&str>) -> LayoutParams {
        LayoutParams {
            region: "eu-north-1".to_string(),
            metric: MetricRef {
                namespace: "AWS/EC2".to_string(),
                name: "CPUUtilization".to_string(),
                dimension: "InstanceId".to_string(),
            },
            metric_label: "CPU".to_string(),
            period_secs: 60,
            target_group: "targetgroup/web/abc".to_string(),
            load_balancer_ref: lb.map(str::to_string),
        }
    }

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn node_panels_wrap_at_grid_width() {
        let nodes = ids(&["i-1", "i-2", "i-3", "i-4", "i-5"]);
        let spec = render_layout(&nodes, &params(None));

        let positions: Vec<(u32, u32)> = spec.widgets[..5].iter().map(|w| (w.x, w.y)).collect();
        assert_eq!(positions, vec![(0, 0), (6, 0), (12, 0), (18, 0), (0, 6)]);
        assert_eq!(spec.widgets[0].properties.title, "CPU: i-1");

        let aggregate = &spec.widgets[5];
        assert_eq!((aggregate.x, aggregate.y, aggregate.width), (0, 12, 24));
        assert_eq!(aggregate.properties.metrics.len(), 5);
        assert_eq!(aggregate.properties.title, "Overall CPU (All Instances)");

        let (events, running) = (&spec.widgets[6], &spec.widgets[7]);
        assert_eq!((events.x, events.y, events.width), (0, 18, 12));
        assert_eq!((running.x, running.y, running.width), (12, 18, 12));
        assert_eq!(spec.widgets.len(), 8);
    }

    #[test]
    fn full_row_does_not_leave_a_gap() {
        let spec = render_layout(&ids(&["a", "b", "c", "d"]), &params(None));
        assert_eq!(spec.widgets[4].y, 6);
    }

    #[test]
    fn empty_healthy_set_still_has_fleet_panels() {
        let spec = render_layout(&[], &params(None));
        assert_eq!(spec.widgets.len(), 3);
        assert_eq!(spec.widgets[0].y, 0);
        assert!(spec.widgets[0].properties.metrics.is_empty());
    }

    #[test]
    fn input_order_and_duplicates_do_not_matter() {
        let a = render_layout(&ids(&["i-b", "i-a", "i-c"]), &params(None));
        let b = render_layout(&ids(&["i-c", "i-a", "i-b", "i-a"]), &params(None));
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }

    #[test]
    fn load_balancer_panels_when_configured() {
        let spec = render_layout(&ids(&["i-1"]), &params(Some("app/web/123")));
        assert_eq!(spec.widgets.len(), 6);

        let latency = &spec.widgets[5];
        assert_eq!((latency.x, latency.y), (12, 18));
        assert_eq!(latency.properties.metrics[0][1], "Latency");
        assert_eq!(latency.properties.metrics[0][5], "app/web/123");
    }

    #[test]
    fn serializes_to_dashboard_body_shape() {
        let spec = render_layout(&ids(&["i-1"]), &params(None));
        let body = serde_json::to_value(&spec).unwrap();

        let first = &body["widgets"][0];
        assert_eq!(first["type"], "metric");
        assert_eq!(first["properties"]["yAxis"]["left"]["max"], 100.0);
        assert_eq!(
            first["properties"]["metrics"][0],
            serde_json::json!(["AWS/EC2", "CPUUtilization", "InstanceId", "i-1"])
        );
        assert!(first["properties"].get("view").is_none());

        let parsed: DashboardSpec = serde_json::from_value(body).unwrap();
        assert_eq!(parsed, spec);
    }
}
