use std::collections::BTreeMap;

use proptest::prelude::*;
use rusty_cyto::data::filter::filtered_indices;
use rusty_cyto::operations::transform::{hlog, HLOG_B, HLOG_D, HLOG_R};
use rusty_cyto::{
    CompareOp, ConditionType, Experiment, Operation, PolygonOp, Predicate, RangeOp,
    ThresholdOp, TransformOp, Tube, Value,
};

fn experiment(x: &[f64], y: &[f64]) -> Experiment {
    let mut ex = Experiment::new();
    ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
    let tube = Tube::new(
        "t",
        vec![("X".to_string(), x.to_vec()), ("Y".to_string(), y.to_vec())],
    )
    .unwrap();
    ex.add_tube(tube, &BTreeMap::from([("Dox".to_string(), Value::Float(1.0))]))
        .unwrap();
    ex
}

fn events() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
    (1usize..60).prop_flat_map(|n| {
        (
            prop::collection::vec(-1e6f64..1e6, n),
            prop::collection::vec(-1e6f64..1e6, n),
        )
    })
}

proptest! {
    #[test]
    fn threshold_gate_is_row_local((x, y) in events(), threshold in -1e6f64..1e6) {
        let ex = experiment(&x, &y);
        let before = ex.clone();
        let op = ThresholdOp { name: "gate".into(), channel: "X".into(), threshold };
        let out = op.apply(&ex).unwrap();

        prop_assert_eq!(&ex, &before);
        prop_assert_eq!(out.len(), ex.len());
        let gate = out["gate"].as_bool().unwrap();
        for (row, &inside) in gate.iter().enumerate() {
            prop_assert_eq!(inside, x[row] > threshold);
        }
    }

    #[test]
    fn range_gate_is_row_local((x, y) in events(), a in -1e6f64..1e6, b in -1e6f64..1e6) {
        let ex = experiment(&x, &y);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let op = RangeOp { name: "range".into(), channel: "Y".into(), low, high };
        let out = op.apply(&ex).unwrap();
        let gate = out["range"].as_bool().unwrap();
        prop_assert_eq!(gate.len(), y.len());
        for (row, &inside) in gate.iter().enumerate() {
            prop_assert_eq!(inside, y[row] >= low && y[row] <= high);
        }
    }

    #[test]
    fn polygon_gate_is_row_local(
        (x, y) in events(),
        (x0, x1) in (-1e6f64..1e6, -1e6f64..1e6),
        (y0, y1) in (-1e6f64..1e6, -1e6f64..1e6),
    ) {
        let ex = experiment(&x, &y);
        let before = ex.clone();
        let (left, right) = if x0 <= x1 { (x0, x1) } else { (x1, x0) };
        let (bottom, top) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
        let op = PolygonOp {
            name: "poly".into(),
            x_channel: "X".into(),
            y_channel: "Y".into(),
            vertices: vec![(left, bottom), (right, bottom), (right, top), (left, top)],
        };
        let out = op.apply(&ex).unwrap();

        prop_assert_eq!(&ex, &before);
        prop_assert_eq!(out.len(), ex.len());
        let gate = out["poly"].as_bool().unwrap();
        prop_assert_eq!(gate.len(), x.len());
        for (row, &inside) in gate.iter().enumerate() {
            // Edges are left to the ray cast; strict interior and exterior are not.
            if x[row] > left && x[row] < right && y[row] > bottom && y[row] < top {
                prop_assert!(inside, "row {} should be inside", row);
            } else if x[row] < left || x[row] > right || y[row] < bottom || y[row] > top {
                prop_assert!(!inside, "row {} should be outside", row);
            }
        }
    }

    #[test]
    fn transform_keeps_shape_and_input((x, y) in events()) {
        let ex = experiment(&x, &y);
        let before = ex.clone();
        let out = TransformOp::hlog("h", &["X"]).apply(&ex).unwrap();
        prop_assert_eq!(&ex, &before);
        prop_assert_eq!(out.len(), ex.len());
        prop_assert_eq!(out.data().column_names(), ex.data().column_names());
        prop_assert_eq!(&out["Y"], &ex["Y"]);
    }

    #[test]
    fn hlog_is_monotonic(a in -1e7f64..1e7, b in -1e7f64..1e7) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(hlog(lo, HLOG_B, HLOG_R, HLOG_D) <= hlog(hi, HLOG_B, HLOG_R, HLOG_D) + 1e-7);
    }

    #[test]
    fn parsed_comparison_matches_manual_filter((x, y) in events(), t in -1e6f64..1e6) {
        let ex = experiment(&x, &y);
        let parsed = Predicate::parse(&format!("X > {t:e} and not Y < {t:e}")).unwrap();
        let built = Predicate::compare("X", CompareOp::Gt, t)
            .and(Predicate::compare("Y", CompareOp::Lt, t).negate());
        prop_assert_eq!(&parsed, &built);

        let rows = filtered_indices(ex.data(), &parsed).unwrap();
        let expected: Vec<usize> = (0..x.len()).filter(|&i| x[i] > t && y[i] >= t).collect();
        prop_assert_eq!(rows, expected);
    }
}
