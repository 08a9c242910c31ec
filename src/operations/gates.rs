use log::info;
use serde::{Deserialize, Serialize};

use super::{columns_free, ensure_valid, Operation};
use crate::data::model::Column;
use crate::error::{CytoError, Result};
use crate::experiment::{ColumnMetadata, Experiment};

/// Fetch a numeric channel or fail with a configuration error.
fn channel_values<'a>(experiment: &'a Experiment, channel: &str) -> Result<&'a [f64]> {
    experiment
        .column(channel)
        .and_then(Column::as_f64)
        .ok_or_else(|| CytoError::Configuration(format!("no numeric channel '{channel}'")))
}

fn gate_is_configured(experiment: &Experiment, name: &str, channels: &[&str]) -> bool {
    !name.is_empty()
        && channels.iter().all(|c| !c.is_empty() && experiment.has_channel(c))
        && columns_free(experiment, &[name.to_string()])
}

fn add_gate(
    experiment: &Experiment,
    name: &str,
    membership: Vec<bool>,
    metadata: ColumnMetadata,
) -> Result<Experiment> {
    let inside = membership.iter().filter(|&&b| b).count();
    let mut derived = experiment.clone();
    derived.add_column(name, Column::Bool(membership), metadata)?;
    info!(
        "gate '{name}': {inside} of {} events inside",
        derived.len()
    );
    Ok(derived)
}

// ---------------------------------------------------------------------------
// ThresholdOp
// ---------------------------------------------------------------------------

/// Marks events whose `channel` value is strictly above `threshold`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOp {
    pub name: String,
    pub channel: String,
    pub threshold: f64,
}

impl Operation for ThresholdOp {
    fn id(&self) -> &'static str {
        "cytoflow.operations.threshold"
    }

    fn friendly_id(&self) -> &'static str {
        "Threshold"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self, experiment: &Experiment) -> bool {
        gate_is_configured(experiment, &self.name, &[self.channel.as_str()])
            && !self.threshold.is_nan()
    }

    fn apply(&self, experiment: &Experiment) -> Result<Experiment> {
        ensure_valid(self, experiment)?;
        let values = channel_values(experiment, &self.channel)?;
        let membership = values.iter().map(|&v| v > self.threshold).collect();
        let metadata = ColumnMetadata::derived(self.id())
            .with_attr("channel", self.channel.clone())
            .with_attr("threshold", self.threshold);
        add_gate(experiment, &self.name, membership, metadata)
    }
}

// ---------------------------------------------------------------------------
// RangeOp
// ---------------------------------------------------------------------------

/// Marks events with `low <= channel value <= high`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeOp {
    pub name: String,
    pub channel: String,
    pub low: f64,
    pub high: f64,
}

impl Operation for RangeOp {
    fn id(&self) -> &'static str {
        "cytoflow.operations.range"
    }

    fn friendly_id(&self) -> &'static str {
        "Range"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self, experiment: &Experiment) -> bool {
        // NaN bounds fail the comparison too.
        gate_is_configured(experiment, &self.name, &[self.channel.as_str()])
            && self.low <= self.high
    }

    fn apply(&self, experiment: &Experiment) -> Result<Experiment> {
        ensure_valid(self, experiment)?;
        let values = channel_values(experiment, &self.channel)?;
        let membership = values
            .iter()
            .map(|&v| v >= self.low && v <= self.high)
            .collect();
        let metadata = ColumnMetadata::derived(self.id())
            .with_attr("channel", self.channel.clone())
            .with_attr("low", self.low)
            .with_attr("high", self.high);
        add_gate(experiment, &self.name, membership, metadata)
    }
}

// ---------------------------------------------------------------------------
// PolygonOp
// ---------------------------------------------------------------------------

/// Marks events inside a polygon drawn on two channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolygonOp {
    pub name: String,
    pub x_channel: String,
    pub y_channel: String,
    /// Polygon vertices in (x, y) order; the polygon closes itself.
    pub vertices: Vec<(f64, f64)>,
}

impl PolygonOp {
    /// Even-odd rule: cast a ray to +x and count edge crossings.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl Operation for PolygonOp {
    fn id(&self) -> &'static str {
        "cytoflow.operations.polygon"
    }

    fn friendly_id(&self) -> &'static str {
        "Polygon"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self, experiment: &Experiment) -> bool {
        let channels = [self.x_channel.as_str(), self.y_channel.as_str()];
        gate_is_configured(experiment, &self.name, &channels)
            && self.vertices.len() >= 3
            && self
                .vertices
                .iter()
                .all(|(x, y)| x.is_finite() && y.is_finite())
    }

    fn apply(&self, experiment: &Experiment) -> Result<Experiment> {
        ensure_valid(self, experiment)?;
        let xs = channel_values(experiment, &self.x_channel)?;
        let ys = channel_values(experiment, &self.y_channel)?;
        let membership = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| self.contains(x, y))
            .collect();
        let vertices: Vec<serde_json::Value> = self
            .vertices
            .iter()
            .map(|&(x, y)| serde_json::json!([x, y]))
            .collect();
        let metadata = ColumnMetadata::derived(self.id())
            .with_attr("x_channel", self.x_channel.clone())
            .with_attr("y_channel", self.y_channel.clone())
            .with_attr("vertices", vertices);
        add_gate(experiment, &self.name, membership, metadata)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::data::model::{ConditionType, Tube, Value};

    fn experiment() -> Experiment {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
        let tube = Tube::new(
            "t1",
            vec![
                ("Y2-A".to_string(), vec![100.0, 2005.0, 2006.0, 9000.0]),
                ("B1-A".to_string(), vec![0.5, 1.5, 0.5, 5.0]),
            ],
        )
        .unwrap();
        let dox = BTreeMap::from([("Dox".to_string(), Value::Float(10.0))]);
        ex.add_tube(tube, &dox).unwrap();
        ex
    }

    #[test]
    fn threshold_is_strict() {
        let ex = experiment();
        let op = ThresholdOp {
            name: "Y2-A+".into(),
            channel: "Y2-A".into(),
            threshold: 2005.0,
        };
        let out = op.apply(&ex).unwrap();
        assert_eq!(out["Y2-A+"], Column::Bool(vec![false, false, true, true]));
        assert_eq!(out.len(), ex.len());
        assert!(out.column("Y2-A+").is_some() && ex.column("Y2-A+").is_none());
        assert_eq!(
            out.metadata()["Y2-A+"].produced_by.as_deref(),
            Some("cytoflow.operations.threshold")
        );
    }

    #[test]
    fn threshold_requires_name_and_channel() {
        let ex = experiment();
        let mut op = ThresholdOp {
            name: String::new(),
            channel: "Y2-A".into(),
            threshold: 1.0,
        };
        assert!(!op.is_valid(&ex));
        assert!(matches!(op.apply(&ex), Err(CytoError::Validation(_))));
        op.name = "gate".into();
        op.channel = "V2-A".into();
        assert!(!op.is_valid(&ex));
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let ex = experiment();
        let op = RangeOp {
            name: "mid".into(),
            channel: "Y2-A".into(),
            low: 2005.0,
            high: 9000.0,
        };
        let out = op.apply(&ex).unwrap();
        assert_eq!(out["mid"], Column::Bool(vec![false, true, true, true]));

        let inverted = RangeOp {
            low: 10.0,
            high: 1.0,
            ..op
        };
        assert!(!inverted.is_valid(&ex));
    }

    #[test]
    fn polygon_uses_both_channels() {
        let ex = experiment();
        let op = PolygonOp {
            name: "poly".into(),
            x_channel: "Y2-A".into(),
            y_channel: "B1-A".into(),
            vertices: vec![(1000.0, 0.0), (3000.0, 0.0), (3000.0, 1.0), (1000.0, 1.0)],
        };
        let out = op.apply(&ex).unwrap();
        assert_eq!(out["poly"], Column::Bool(vec![false, false, true, false]));
    }

    #[test]
    fn polygon_needs_three_vertices() {
        let ex = experiment();
        let op = PolygonOp {
            name: "line".into(),
            x_channel: "Y2-A".into(),
            y_channel: "B1-A".into(),
            vertices: vec![(0.0, 0.0), (1.0, 1.0)],
        };
        assert!(!op.is_valid(&ex));
    }

    #[test]
    fn gate_name_may_not_shadow_a_column() {
        let ex = experiment();
        let op = ThresholdOp {
            name: "Dox".into(),
            channel: "Y2-A".into(),
            threshold: 0.0,
        };
        assert!(!op.is_valid(&ex));
    }
}
