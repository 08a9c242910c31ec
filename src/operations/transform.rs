use std::collections::BTreeSet;

use log::info;
use serde::{Deserialize, Serialize};

use super::{ensure_valid, Operation};
use crate::error::Result;
use crate::experiment::Experiment;

/// Linearization parameter of the hyperlog transform.
pub const HLOG_B: f64 = 500.0;
/// Display range of the hyperlog transform.
pub const HLOG_R: f64 = 10_000.0;
/// Decades covered by an 18-bit instrument: `log10(2^18)`.
pub const HLOG_D: f64 = 5.418_539_921_951_662;

const HLOG_MAX_ITER: usize = 200;

// ---------------------------------------------------------------------------
// Transform – a deterministic per-value remapping
// ---------------------------------------------------------------------------

/// A per-value channel transform. This is also the descriptor recorded in a
/// channel's `xforms` history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Transform {
    /// Hyperlog: linear around zero, logarithmic for large magnitudes.
    Hlog { b: f64, r: f64, d: f64 },
    /// `log10(max(value, floor))`.
    Log { floor: f64 },
}

impl Default for Transform {
    fn default() -> Self {
        Transform::hlog()
    }
}

impl Transform {
    /// Hyperlog with the usual cytometry defaults.
    pub fn hlog() -> Self {
        Transform::Hlog {
            b: HLOG_B,
            r: HLOG_R,
            d: HLOG_D,
        }
    }

    /// The name downstream operations check for in a channel's history.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Transform::Hlog { .. } => "hlog",
            Transform::Log { .. } => "log",
        }
    }

    pub fn is_valid(&self) -> bool {
        match *self {
            Transform::Hlog { b, r, d } => {
                [b, r, d].iter().all(|p| p.is_finite()) && b >= 0.0 && r > 0.0 && d > 0.0
            }
            Transform::Log { floor } => floor.is_finite() && floor > 0.0,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Transform::Hlog { b, r, d } => hlog(value, b, r, d),
            Transform::Log { floor } => value.max(floor).log10(),
        }
    }
}

/// Inverse hyperlog: maps display units `y` in `[-r, r]` back to data units.
pub fn hlog_inv(y: f64, b: f64, r: f64, d: f64) -> f64 {
    let aux = d / r * y;
    let s = if y < 0.0 { -1.0 } else { 1.0 };
    s * 10f64.powf(s * aux) + b * aux - s
}

/// Hyperlog of `x`, found by bisection on the monotonic `hlog_inv`.
/// Values beyond the display range are clamped to `±r`.
pub fn hlog(x: f64, b: f64, r: f64, d: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let (mut lo, mut hi) = (-r, r);
    if x >= hlog_inv(hi, b, r, d) {
        return hi;
    }
    if x <= hlog_inv(lo, b, r, d) {
        return lo;
    }
    for _ in 0..HLOG_MAX_ITER {
        let mid = 0.5 * (lo + hi);
        if hlog_inv(mid, b, r, d) < x {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= r * 1e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

// ---------------------------------------------------------------------------
// TransformOp
// ---------------------------------------------------------------------------

/// Applies `transform` to every value of each configured channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformOp {
    pub name: String,
    pub channels: Vec<String>,
    pub transform: Transform,
}

impl TransformOp {
    pub fn hlog(name: impl Into<String>, channels: &[&str]) -> Self {
        TransformOp {
            name: name.into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            transform: Transform::hlog(),
        }
    }
}

impl Operation for TransformOp {
    fn id(&self) -> &'static str {
        "cytoflow.operations.transform"
    }

    fn friendly_id(&self) -> &'static str {
        match self.transform {
            Transform::Hlog { .. } => "Hyperlog",
            Transform::Log { .. } => "Log",
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self, experiment: &Experiment) -> bool {
        let unique: BTreeSet<&String> = self.channels.iter().collect();
        !self.name.is_empty()
            && !self.channels.is_empty()
            && unique.len() == self.channels.len()
            && self.channels.iter().all(|c| experiment.has_channel(c))
            && self.transform.is_valid()
    }

    fn apply(&self, experiment: &Experiment) -> Result<Experiment> {
        ensure_valid(self, experiment)?;
        let mut derived = experiment.clone();
        for channel in &self.channels {
            derived.map_channel(channel, |v| self.transform.apply(v), self.transform.clone())?;
        }
        info!(
            "{} '{}' applied to {}",
            self.transform.canonical_name(),
            self.name,
            self.channels.join(", ")
        );
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::data::model::{ConditionType, Tube, Value};
    use crate::error::CytoError;

    fn experiment() -> Experiment {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
        let tube = Tube::new(
            "t1",
            vec![
                ("Y2-A".to_string(), vec![-50.0, 0.0, 10.0, 5000.0]),
                ("B1-A".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
            ],
        )
        .unwrap();
        ex.add_tube(tube, &BTreeMap::from([("Dox".to_string(), Value::Float(1.0))]))
            .unwrap();
        ex
    }

    #[test]
    fn hlog_inverts_hlog_inv() {
        for y in [-9000.0, -10.0, 0.0, 1.5, 1234.0, 9999.0] {
            let x = hlog_inv(y, HLOG_B, HLOG_R, HLOG_D);
            let back = hlog(x, HLOG_B, HLOG_R, HLOG_D);
            assert!((back - y).abs() < 1e-6, "y={y} back={back}");
        }
    }

    #[test]
    fn hlog_is_monotonic_and_zero_preserving() {
        let t = Transform::hlog();
        assert!(t.apply(0.0).abs() < 1e-6);
        let xs = [-1e5, -100.0, -1.0, 0.0, 1.0, 100.0, 1e4, 1e5, 1e9];
        let ys: Vec<f64> = xs.iter().map(|&x| t.apply(x)).collect();
        assert!(ys.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(t.apply(1e12), HLOG_R);
    }

    #[test]
    fn transform_appends_history_and_keeps_shape() {
        let ex = experiment();
        let op = TransformOp::hlog("Hyperlog", &["Y2-A"]);
        let once = op.apply(&ex).unwrap();
        let twice = op.apply(&once).unwrap();

        assert_eq!(twice.len(), ex.len());
        assert_eq!(twice.data().column_names(), ex.data().column_names());
        assert_eq!(twice.metadata()["Y2-A"].xforms.len(), 2);
        assert!(twice.has_transform("Y2-A", "hlog"));
        assert!(!twice.has_transform("B1-A", "hlog"));
        assert_eq!(twice["B1-A"], ex["B1-A"]);
        assert!(ex.metadata()["Y2-A"].xforms.is_empty());
    }

    #[test]
    fn log_transform_clamps_to_floor() {
        let ex = experiment();
        let op = TransformOp {
            name: "log".into(),
            channels: vec!["Y2-A".into()],
            transform: Transform::Log { floor: 1.0 },
        };
        let out = op.apply(&ex).unwrap();
        let y = out["Y2-A"].as_f64().unwrap();
        assert_eq!(y[0], 0.0);
        assert!((y[2] - 1.0).abs() < 1e-12);
        assert!(out.has_transform("Y2-A", "log"));
    }

    #[test]
    fn unknown_or_repeated_channels_are_invalid() {
        let ex = experiment();
        let missing = TransformOp::hlog("h", &["V2-A"]);
        assert!(matches!(missing.apply(&ex), Err(CytoError::Validation(_))));
        let repeated = TransformOp::hlog("h", &["Y2-A", "Y2-A"]);
        assert!(!repeated.is_valid(&ex));
    }

    #[test]
    fn descriptor_serializes_with_canonical_name() {
        let json = serde_json::to_value(Transform::Log { floor: 1.0 }).unwrap();
        assert_eq!(json["name"], "log");
    }
}
