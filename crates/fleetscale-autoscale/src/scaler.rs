//! Decision engine — threshold comparison and scale-down selection.
//!
//! Both functions are pure: they read only their arguments, so a tick's
//! decision can be replayed from the logged average and thresholds.

use std::fmt;

use tracing::debug;

use fleet_core::{FleetSnapshot, Node, ScaleAction, ScaleDownPolicy, Thresholds};

/// Outcome of comparing the fleet average against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl ScalingDecision {
    /// The scale action this decision requests, if any.
    pub fn action(&self) -> Option<ScaleAction> {
        match self {
            Self::ScaleUp => Some(ScaleAction::ScaleUp),
            Self::ScaleDown => Some(ScaleAction::ScaleDown),
            Self::NoAction => None,
        }
    }
}

impl fmt::Display for ScalingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ScaleUp => "scale-up",
            Self::ScaleDown => "scale-down",
            Self::NoAction => "no-action",
        })
    }
}

/// Strict comparisons: an average equal to either threshold is `NoAction`.
///
/// No cooldown or hysteresis is applied; every tick decides from its own
/// average. A NaN average compares false on both sides and is `NoAction`.
pub fn decide(average: f64, thresholds: &Thresholds) -> ScalingDecision {
    let decision = if average > thresholds.high() {
        ScalingDecision::ScaleUp
    } else if average < thresholds.low() {
        ScalingDecision::ScaleDown
    } else {
        ScalingDecision::NoAction
    };
    debug!(
        average,
        low = thresholds.low(),
        high = thresholds.high(),
        %decision,
        "scaling decision"
    );
    decision
}

/// Pick the one running node a scale-down stops. Primary nodes are never
/// eligible; `None` when every running node is primary.
pub fn select_scale_down_candidate(
    snapshot: &FleetSnapshot,
    policy: ScaleDownPolicy,
) -> Option<&Node> {
    let candidates = snapshot.scale_down_candidates();
    let chosen = match policy {
        ScaleDownPolicy::LastListed => candidates.last().copied(),
        // `<=` lets a later node win a tie.
        ScaleDownPolicy::LowestUtilization => candidates.into_iter().fold(None, |best: Option<&Node>, node| {
            match best {
                Some(b) if b.utilization < node.utilization => Some(b),
                _ if node.utilization.is_nan() => best.or(Some(node)),
                _ => Some(node),
            }
        }),
    };
    if let Some(node) = chosen {
        debug!(node = %node.id, utilization = node.utilization, ?policy, "scale-down candidate");
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_core::NodeState;

    fn thresholds() -> Thresholds {
        Thresholds::new(20.0, 70.0).unwrap()
    }

    fn fleet(nodes: &[(&str, bool, f64)]) -> FleetSnapshot {
        FleetSnapshot {
            running: nodes
                .iter()
                .map(|(id, primary, util)| {
                    let mut n = Node::new(*id, NodeState::Running, *primary);
                    n.utilization = *util;
                    n
                })
                .collect(),
            stopped: vec![],
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn above_high_scales_up() {
        assert_eq!(decide(75.0, &thresholds()), ScalingDecision::ScaleUp);
        assert_eq!(decide(70.0001, &thresholds()), ScalingDecision::ScaleUp);
    }

    #[test]
    fn below_low_scales_down() {
        assert_eq!(decide(10.0, &thresholds()), ScalingDecision::ScaleDown);
        assert_eq!(decide(0.0, &thresholds()), ScalingDecision::ScaleDown);
    }

    #[test]
    fn boundaries_are_no_action() {
        assert_eq!(decide(70.0, &thresholds()), ScalingDecision::NoAction);
        assert_eq!(decide(20.0, &thresholds()), ScalingDecision::NoAction);
        assert_eq!(decide(45.0, &thresholds()), ScalingDecision::NoAction);
    }

    #[test]
    fn equal_thresholds_only_act_off_the_point() {
        let t = Thresholds::new(50.0, 50.0).unwrap();
        assert_eq!(decide(50.0, &t), ScalingDecision::NoAction);
        assert_eq!(decide(50.5, &t), ScalingDecision::ScaleUp);
        assert_eq!(decide(49.5, &t), ScalingDecision::ScaleDown);
    }

    #[test]
    fn nan_average_is_no_action() {
        assert_eq!(decide(f64::NAN, &thresholds()), ScalingDecision::NoAction);
    }

    #[test]
    fn decision_maps_to_action() {
        assert_eq!(ScalingDecision::ScaleUp.action(), Some(ScaleAction::ScaleUp));
        assert_eq!(ScalingDecision::ScaleDown.action(), Some(ScaleAction::ScaleDown));
        assert_eq!(ScalingDecision::NoAction.action(), None);
    }

    #[test]
    fn sole_non_primary_is_selected() {
        let snapshot = fleet(&[("i-primary", true, 5.0), ("i-worker", false, 15.0)]);
        for policy in [ScaleDownPolicy::LowestUtilization, ScaleDownPolicy::LastListed] {
            let node = select_scale_down_candidate(&snapshot, policy).unwrap();
            assert_eq!(node.id, "i-worker");
        }
    }

    #[test]
    fn all_primary_has_no_candidate() {
        let snapshot = fleet(&[("i-a", true, 1.0), ("i-b", true, 2.0)]);
        assert!(select_scale_down_candidate(&snapshot, ScaleDownPolicy::default()).is_none());
        assert!(select_scale_down_candidate(&fleet(&[]), ScaleDownPolicy::LastListed).is_none());
    }

    #[test]
    fn lowest_utilization_prefers_idle_node() {
        let snapshot = fleet(&[("i-a", false, 3.0), ("i-b", false, 12.0), ("i-c", false, 8.0)]);
        let node = select_scale_down_candidate(&snapshot, ScaleDownPolicy::LowestUtilization);
        assert_eq!(node.unwrap().id, "i-a");

        let node = select_scale_down_candidate(&snapshot, ScaleDownPolicy::LastListed);
        assert_eq!(node.unwrap().id, "i-c");
    }

    #[test]
    fn lowest_utilization_tie_goes_to_later_node() {
        let snapshot = fleet(&[("i-a", false, 4.0), ("i-b", false, 4.0), ("i-c", true, 0.0)]);
        let node = select_scale_down_candidate(&snapshot, ScaleDownPolicy::LowestUtilization);
        assert_eq!(node.unwrap().id, "i-b");
    }

    #[test]
    fn nan_utilization_is_chosen_last() {
        let snapshot = fleet(&[("i-a", false, f64::NAN), ("i-b", false, 9.0)]);
        let node = select_scale_down_candidate(&snapshot, ScaleDownPolicy::LowestUtilization);
        assert_eq!(node.unwrap().id, "i-b");
    }

    #[test]
    fn primary_never_selected_for_any_composition() {
        // Every primary/non-primary mix of a five-node fleet, both policies.
        for mask in 0u32..32 {
            let nodes: Vec<(String, bool, f64)> = (0..5)
                .map(|i| (format!("i-{i}"), mask & (1 << i) != 0, (i * 7 % 5) as f64))
                .collect();
            let borrowed: Vec<(&str, bool, f64)> =
                nodes.iter().map(|(id, p, u)| (id.as_str(), *p, *u)).collect();
            let snapshot = fleet(&borrowed);

            for policy in [ScaleDownPolicy::LowestUtilization, ScaleDownPolicy::LastListed] {
                match select_scale_down_candidate(&snapshot, policy) {
                    Some(node) => assert!(!node.primary, "mask {mask:05b} picked {}", node.id),
                    None => assert_eq!(mask, 0b11111),
                }
            }
        }
    }
}
