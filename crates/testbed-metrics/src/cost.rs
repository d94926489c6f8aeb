//! Rough infrastructure cost of an experiment

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use testbed_common::crd::{ClusterType, Experiment};

/// On-demand hourly rate (USD) of common GCE machine types
const HOURLY_RATES: &[(&str, f64)] = &[
    ("e2-medium", 0.0335),
    ("e2-standard-2", 0.0670),
    ("e2-standard-4", 0.1340),
    ("e2-standard-8", 0.2680),
    ("n1-standard-1", 0.0475),
    ("n1-standard-2", 0.0950),
    ("n1-standard-4", 0.1900),
    ("n2-standard-2", 0.0971),
    ("n2-standard-4", 0.1942),
    ("n2-standard-8", 0.3884),
];

/// Rate used for machine types missing from the table
pub const FALLBACK_HOURLY_RATE: f64 = 0.10;

/// Fraction of the on-demand rate paid for preemptible nodes
pub const PREEMPTIBLE_FACTOR: f64 = 0.20;

const NOTE: &str = "Rough estimate based on on-demand GCE pricing; actual cost may differ.";

/// Estimated spend of an experiment's clusters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// Sum over targets
    #[serde(rename = "totalUSD")]
    pub total_usd: f64,
    /// Hours between creation and completion
    pub duration_hours: f64,
    /// Cost per GKE target
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_target: BTreeMap<String, f64>,
    /// Caveat shown alongside the numbers
    pub note: String,
}

/// Hourly rate of a machine type, falling back to [`FALLBACK_HOURLY_RATE`]
pub fn hourly_rate(machine_type: &str) -> f64 {
    HOURLY_RATES
        .iter()
        .find(|(name, _)| *name == machine_type)
        .map(|(_, rate)| *rate)
        .unwrap_or(FALLBACK_HOURLY_RATE)
}

/// Estimate cost once the experiment has a completion time.
///
/// Each GKE target costs rate × nodes × hours, using the sizing recorded in
/// status when available. Hub targets are free.
pub fn estimate_cost(experiment: &Experiment) -> Option<CostEstimate> {
    let status = experiment.status.as_ref()?;
    let completed_at = status.completed_at?;
    let created_at = experiment.metadata.creation_timestamp.as_ref()?.0;
    let hours = (completed_at - created_at).num_milliseconds() as f64 / 3_600_000.0;

    let mut estimate = CostEstimate {
        total_usd: 0.0,
        duration_hours: hours,
        per_target: BTreeMap::new(),
        note: NOTE.to_string(),
    };

    for target in &experiment.spec.targets {
        if target.cluster.cluster_type != ClusterType::Gke {
            continue;
        }
        let observed = status.targets.iter().find(|t| t.name == target.name);
        let machine_type = observed
            .and_then(|t| t.machine_type.as_deref())
            .or(target.cluster.machine_type.as_deref())
            .unwrap_or_default();
        let nodes = observed
            .and_then(|t| t.node_count)
            .or(target.cluster.node_count)
            .filter(|n| *n > 0)
            .unwrap_or(1);

        let mut rate = hourly_rate(machine_type);
        if target.cluster.preemptible {
            rate *= PREEMPTIBLE_FACTOR;
        }
        let cost = rate * f64::from(nodes) * hours;
        estimate.per_target.insert(target.name.clone(), cost);
        estimate.total_usd += cost;
    }

    Some(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use testbed_common::crd::{ClusterSpec, ExperimentSpec, ExperimentStatus, Target, TargetStatus};

    fn gke(name: &str, machine_type: Option<&str>, nodes: Option<u32>, preemptible: bool) -> Target {
        Target {
            name: name.to_string(),
            cluster: ClusterSpec {
                cluster_type: ClusterType::Gke,
                machine_type: machine_type.map(str::to_string),
                node_count: nodes,
                preemptible,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn experiment(targets: Vec<Target>, statuses: Vec<TargetStatus>, hours: Option<i64>) -> Experiment {
        let created = DateTime::from_timestamp(1_707_350_400, 0).unwrap();
        let mut exp = Experiment::new(
            "cost",
            ExperimentSpec {
                targets,
                ..Default::default()
            },
        );
        exp.metadata.creation_timestamp = Some(Time(created));
        exp.status = Some(ExperimentStatus {
            targets: statuses,
            completed_at: hours.map(|h| created + TimeDelta::hours(h)),
            ..Default::default()
        });
        exp
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn undefined_before_completion() {
        let exp = experiment(vec![gke("app", Some("e2-medium"), Some(2), false)], vec![], None);
        assert!(estimate_cost(&exp).is_none());
    }

    #[test]
    fn e2_medium_two_nodes_two_hours() {
        let exp = experiment(vec![gke("app", Some("e2-medium"), Some(2), false)], vec![], Some(2));
        let estimate = estimate_cost(&exp).unwrap();
        assert!(approx(estimate.per_target["app"], 0.134));
        assert!(approx(estimate.total_usd, 0.134));
        assert!(approx(estimate.duration_hours, 2.0));
    }

    #[test]
    fn preemptible_and_fallback_rates() {
        let exp = experiment(
            vec![
                gke("spot", Some("n2-standard-4"), Some(1), true),
                gke("unknown", Some("c3-highmem-8"), None, false),
            ],
            vec![],
            Some(1),
        );
        let estimate = estimate_cost(&exp).unwrap();
        assert!(approx(estimate.per_target["spot"], 0.1942 * 0.2));
        assert!(approx(estimate.per_target["unknown"], 0.10));
    }

    #[test]
    fn status_sizing_overrides_spec() {
        let status = TargetStatus {
            machine_type: Some("e2-standard-4".to_string()),
            node_count: Some(3),
            ..TargetStatus::pending("app")
        };
        let exp = experiment(vec![gke("app", None, None, false)], vec![status], Some(1));
        assert!(approx(estimate_cost(&exp).unwrap().per_target["app"], 0.134 * 3.0));
    }

    #[test]
    fn hub_targets_cost_nothing() {
        let mut hub = gke("hub", Some("e2-standard-8"), Some(5), false);
        hub.cluster.cluster_type = ClusterType::Hub;
        let estimate = estimate_cost(&experiment(vec![hub], vec![], Some(4))).unwrap();
        assert!(estimate.per_target.is_empty());
        assert_eq!(estimate.total_usd, 0.0);
        assert!(estimate.note.contains("Rough estimate"));
    }

    #[test]
    fn json_uses_total_usd_key() {
        let exp = experiment(vec![gke("app", Some("e2-medium"), Some(1), false)], vec![], Some(1));
        let json = serde_json::to_value(estimate_cost(&exp).unwrap()).unwrap();
        assert!(json.get("totalUSD").is_some());
        assert!(json.get("durationHours").is_some());
    }
}
