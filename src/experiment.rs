use std::collections::{BTreeMap, BTreeSet};
use std::ops::Index;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::data::filter::{filtered_indices, Predicate};
use crate::data::model::{Column, ConditionType, EventTable, Tube, Value};
use crate::error::{CytoError, Result};
use crate::operations::transform::Transform;

/// Reserved string column stamped with each event's tube id.
pub const TUBE_COLUMN: &str = "Tube";

// ---------------------------------------------------------------------------
// Column metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Channel,
    Condition,
    Derived,
}

/// Annotation record kept for every column of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub kind: ColumnKind,
    /// Transforms applied to a channel, oldest first.
    #[serde(default)]
    pub xforms: Vec<Transform>,
    /// Id of the operation that produced a derived column.
    #[serde(default)]
    pub produced_by: Option<String>,
    /// Free-form annotations (gate parameters, fit settings, ...).
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl ColumnMetadata {
    pub fn new(kind: ColumnKind) -> Self {
        ColumnMetadata {
            kind,
            xforms: Vec::new(),
            produced_by: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Metadata for a column produced by the operation `op_id`.
    pub fn derived(op_id: &str) -> Self {
        ColumnMetadata {
            produced_by: Some(op_id.to_string()),
            ..ColumnMetadata::new(ColumnKind::Derived)
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// Events from one or more tubes, stamped with their condition values.
///
/// Operations never mutate an `Experiment` they are handed; they clone it,
/// extend the clone and return that. The only mutating public calls are
/// [`Experiment::add_conditions`] and [`Experiment::add_tube`], which the
/// import step uses to build the initial experiment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Experiment {
    data: EventTable,
    channels: Vec<String>,
    conditions: BTreeMap<String, ConditionType>,
    metadata: BTreeMap<String, ColumnMetadata>,
    tubes: Vec<String>,
}

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register experimental conditions. Only allowed before the first tube.
    pub fn add_conditions<I, S>(&mut self, conditions: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, ConditionType)>,
        S: Into<String>,
    {
        if !self.tubes.is_empty() {
            return Err(CytoError::Configuration(
                "conditions must be added before any tube".to_string(),
            ));
        }

        let mut staged = BTreeMap::new();
        for (name, ty) in conditions {
            let name = name.into();
            if name.is_empty() {
                return Err(CytoError::Configuration(
                    "condition name must not be empty".to_string(),
                ));
            }
            if name == TUBE_COLUMN {
                return Err(CytoError::Configuration(format!(
                    "'{TUBE_COLUMN}' is reserved for the tube id"
                )));
            }
            if self.conditions.contains_key(&name) || staged.insert(name.clone(), ty).is_some() {
                return Err(CytoError::Configuration(format!(
                    "condition '{name}' is already registered"
                )));
            }
        }

        for (name, ty) in staged {
            self.metadata.insert(
                name.clone(),
                ColumnMetadata::new(ColumnKind::Condition).with_attr("type", ty.to_string()),
            );
            self.conditions.insert(name, ty);
        }
        Ok(())
    }

    /// Append a tube's events, stamping every row with `values`.
    ///
    /// `values` must name exactly the registered conditions. The first tube
    /// fixes the experiment's channels; later tubes must carry the same set.
    /// Every row is also stamped with the tube id in [`TUBE_COLUMN`], so tube
    /// ids must be unique.
    pub fn add_tube(&mut self, tube: Tube, values: &BTreeMap<String, Value>) -> Result<()> {
        let registered: BTreeSet<&str> = self.conditions.keys().map(String::as_str).collect();
        let supplied: BTreeSet<&str> = values.keys().map(String::as_str).collect();
        if registered != supplied {
            let missing: Vec<&str> = registered.difference(&supplied).copied().collect();
            let extra: Vec<&str> = supplied.difference(&registered).copied().collect();
            return Err(CytoError::Configuration(format!(
                "tube '{}' conditions don't match: missing [{}], unexpected [{}]",
                tube.id,
                missing.join(", "),
                extra.join(", ")
            )));
        }

        let mut stamped = Vec::with_capacity(values.len());
        for (name, ty) in &self.conditions {
            let raw = &values[name];
            let value = ty.coerce(raw).ok_or_else(|| {
                CytoError::Configuration(format!(
                    "condition '{name}' is declared {ty} but tube '{}' gave a {} ({raw})",
                    tube.id,
                    raw.type_name()
                ))
            })?;
            stamped.push((name.clone(), value));
        }

        if self.tubes.contains(&tube.id) {
            return Err(CytoError::Configuration(format!(
                "a tube with id '{}' was already added",
                tube.id
            )));
        }
        if tube.channels().is_empty() {
            return Err(CytoError::Configuration(format!(
                "tube '{}' has no channels",
                tube.id
            )));
        }
        if let Some(clash) = tube
            .channels()
            .iter()
            .find(|c| c.as_str() == TUBE_COLUMN || self.conditions.contains_key(c.as_str()))
        {
            return Err(CytoError::Configuration(format!(
                "channel '{clash}' clashes with a condition column"
            )));
        }
        let first_tube = self.tubes.is_empty();
        if !first_tube {
            let ours: BTreeSet<&String> = self.channels.iter().collect();
            let theirs: BTreeSet<&String> = tube.channels().iter().collect();
            if ours != theirs {
                return Err(CytoError::Configuration(format!(
                    "tube '{}' channels differ from the experiment's",
                    tube.id
                )));
            }
        }

        let tube_id = tube.id.clone();
        let n = tube.len();
        let channel_order: Vec<String> = tube.channels().to_vec();
        let mut chunk: Vec<(String, Column)> = tube
            .into_columns()
            .map(|(name, values)| (name, Column::Float(values)))
            .collect();
        chunk.extend(
            stamped
                .into_iter()
                .map(|(name, value)| (name, Column::repeat(&value, n))),
        );
        chunk.push((TUBE_COLUMN.to_string(), Column::Str(vec![tube_id.clone(); n])));
        self.data.append_rows(chunk)?;

        if first_tube {
            for channel in &channel_order {
                self.metadata
                    .insert(channel.clone(), ColumnMetadata::new(ColumnKind::Channel));
            }
            self.metadata.insert(
                TUBE_COLUMN.to_string(),
                ColumnMetadata::new(ColumnKind::Condition).with_attr("type", "string"),
            );
            self.channels = channel_order;
        }
        debug!("added tube '{tube_id}' with {n} events");
        self.tubes.push(tube_id);
        Ok(())
    }

    // -- read-only accessors --

    pub fn data(&self) -> &EventTable {
        &self.data
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn conditions(&self) -> &BTreeMap<String, ConditionType> {
        &self.conditions
    }

    pub fn metadata(&self) -> &BTreeMap<String, ColumnMetadata> {
        &self.metadata
    }

    /// Ids of the tubes added so far, in insertion order.
    pub fn tube_ids(&self) -> &[String] {
        &self.tubes
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.data.column(name)
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }

    /// Whether `channel`'s history contains a transform with this canonical name.
    pub fn has_transform(&self, channel: &str, canonical_name: &str) -> bool {
        self.metadata
            .get(channel)
            .map(|m| m.xforms.iter().any(|x| x.canonical_name() == canonical_name))
            .unwrap_or(false)
    }

    /// Rows matching `predicate`, as a read-only view.
    pub fn subset(&self, predicate: &Predicate) -> Result<RowView<'_>> {
        let rows = filtered_indices(&self.data, predicate)?;
        Ok(RowView {
            experiment: self,
            rows,
        })
    }

    /// Parse `expression` and return the matching rows.
    pub fn query(&self, expression: &str) -> Result<RowView<'_>> {
        self.subset(&Predicate::parse(expression)?)
    }

    /// Row indices grouped by the value of column `by`, each group in row order.
    pub fn group_rows(&self, by: &str) -> Result<BTreeMap<Value, Vec<usize>>> {
        let column = self.column(by).ok_or_else(|| {
            CytoError::Configuration(format!("no column named '{by}' to group by"))
        })?;
        let mut groups: BTreeMap<Value, Vec<usize>> = BTreeMap::new();
        for row in 0..column.len() {
            if let Some(key) = column.get(row) {
                groups.entry(key).or_default().push(row);
            }
        }
        Ok(groups)
    }

    // -- derivation helpers used by operations on their own clone --

    /// Append a derived column. An existing column is never overwritten.
    pub(crate) fn add_column(
        &mut self,
        name: &str,
        column: Column,
        metadata: ColumnMetadata,
    ) -> Result<()> {
        self.data.push_column(name, column)?;
        self.metadata.insert(name.to_string(), metadata);
        Ok(())
    }

    /// Replace a channel's values with `f(value)` and record `xform` in its history.
    pub(crate) fn map_channel<F>(&mut self, channel: &str, f: F, xform: Transform) -> Result<()>
    where
        F: Fn(f64) -> f64,
    {
        if !self.has_channel(channel) {
            return Err(CytoError::Configuration(format!(
                "no channel named '{channel}'"
            )));
        }
        let values = self
            .data
            .column(channel)
            .and_then(Column::as_f64)
            .ok_or_else(|| {
                CytoError::Configuration(format!("channel '{channel}' is not numeric"))
            })?;
        let mapped: Vec<f64> = values.iter().map(|&v| f(v)).collect();
        self.data.replace_column(channel, Column::Float(mapped))?;
        self.metadata
            .entry(channel.to_string())
            .or_insert_with(|| ColumnMetadata::new(ColumnKind::Channel))
            .xforms
            .push(xform);
        Ok(())
    }
}

impl Index<&str> for Experiment {
    type Output = Column;

    /// Panics if there is no such column; use [`Experiment::column`] to probe.
    fn index(&self, name: &str) -> &Column {
        match self.column(name) {
            Some(column) => column,
            None => panic!("experiment has no column named '{name}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// RowView – read-only subset of rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RowView<'a> {
    experiment: &'a Experiment,
    rows: Vec<usize>,
}

impl<'a> RowView<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of the selected rows in the parent experiment.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn experiment(&self) -> &'a Experiment {
        self.experiment
    }

    /// Values of `column` for the selected rows.
    pub fn values(&self, column: &str) -> Option<Vec<Value>> {
        let col = self.experiment.column(column)?;
        self.rows.iter().map(|&r| col.get(r)).collect()
    }

    /// Values of a numeric `column` for the selected rows.
    pub fn f64_values(&self, column: &str) -> Option<Vec<f64>> {
        let col = self.experiment.column(column)?.as_f64()?;
        Some(self.rows.iter().map(|&r| col[r]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tube(id: &str, values: &[f64]) -> Tube {
        Tube::new(
            id,
            vec![
                ("FSC-A".to_string(), values.to_vec()),
                ("Y2-A".to_string(), values.iter().map(|v| v * 10.0).collect()),
            ],
        )
        .unwrap()
    }

    fn dox(v: f64) -> BTreeMap<String, Value> {
        BTreeMap::from([("Dox".to_string(), Value::Float(v))])
    }

    fn two_tube_experiment() -> Experiment {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
        ex.add_tube(tube("t1", &[1.0, 2.0]), &dox(10.0)).unwrap();
        ex.add_tube(tube("t2", &[3.0, 4.0, 5.0]), &dox(1.0)).unwrap();
        ex
    }

    #[test]
    fn tubes_append_rows_in_order_with_conditions() {
        let ex = two_tube_experiment();
        assert_eq!(ex.len(), 5);
        assert_eq!(ex.channels(), ["FSC-A", "Y2-A"]);
        assert_eq!(ex["FSC-A"].as_f64().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ex["Dox"].as_f64().unwrap(), &[10.0, 10.0, 1.0, 1.0, 1.0]);
        assert_eq!(ex.tube_ids(), ["t1", "t2"]);
        assert_eq!(ex.metadata()["Y2-A"].kind, ColumnKind::Channel);
        assert_eq!(ex.metadata()["Dox"].kind, ColumnKind::Condition);
    }

    #[test]
    fn conditions_are_frozen_after_first_tube() {
        let mut ex = two_tube_experiment();
        let err = ex.add_conditions([("Time", ConditionType::Int)]).unwrap_err();
        assert!(matches!(err, CytoError::Configuration(_)));
    }

    #[test]
    fn duplicate_conditions_are_rejected_atomically() {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
        let err = ex
            .add_conditions([("Strain", ConditionType::String), ("Dox", ConditionType::Int)])
            .unwrap_err();
        assert!(matches!(err, CytoError::Configuration(_)));
        assert!(!ex.conditions().contains_key("Strain"));
    }

    #[test]
    fn missing_condition_key_is_a_configuration_error() {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float), ("Strain", ConditionType::String)])
            .unwrap();
        let err = ex.add_tube(tube("t1", &[1.0]), &dox(1.0)).unwrap_err();
        assert!(matches!(err, CytoError::Configuration(_)));
        assert!(ex.is_empty());
    }

    #[test]
    fn wrong_condition_type_is_rejected_and_ints_widen() {
        let mut ex = Experiment::new();
        ex.add_conditions([("Dox", ConditionType::Float)]).unwrap();
        let bad = BTreeMap::from([("Dox".to_string(), Value::from("high"))]);
        assert!(ex.add_tube(tube("t1", &[1.0]), &bad).is_err());

        let int = BTreeMap::from([("Dox".to_string(), Value::Integer(2))]);
        ex.add_tube(tube("t1", &[1.0]), &int).unwrap();
        assert_eq!(ex["Dox"], Column::Float(vec![2.0]));
    }

    #[test]
    fn later_tubes_must_match_channels() {
        let mut ex = two_tube_experiment();
        let other = Tube::new("t3", vec![("B1-A".to_string(), vec![1.0])]).unwrap();
        assert!(ex.add_tube(other, &dox(1.0)).is_err());
        assert_eq!(ex.len(), 5);
    }

    #[test]
    fn query_returns_a_row_view() {
        let ex = two_tube_experiment();
        let view = ex.query("Dox < 5 and `FSC-A` >= 4").unwrap();
        assert_eq!(view.rows(), [3, 4]);
        assert_eq!(view.f64_values("Y2-A").unwrap(), vec![40.0, 50.0]);
    }

    #[test]
    fn add_column_never_overwrites() {
        let mut ex = two_tube_experiment();
        let err = ex
            .add_column(
                "Dox",
                Column::Bool(vec![true; 5]),
                ColumnMetadata::derived("test"),
            )
            .unwrap_err();
        assert!(matches!(err, CytoError::Configuration(_)));
        assert_eq!(ex["Dox"].dtype(), ConditionType::Float);
    }

    #[test]
    fn every_row_carries_its_tube_id() {
        let ex = two_tube_experiment();
        let tubes: Vec<String> = ["t1", "t1", "t2", "t2", "t2"].map(String::from).into();
        assert_eq!(ex[TUBE_COLUMN], Column::Str(tubes));
        assert_eq!(ex.metadata()[TUBE_COLUMN].kind, ColumnKind::Condition);
        assert!(!ex.conditions().contains_key(TUBE_COLUMN));

        // Replicates with identical conditions still form separate groups.
        let groups = ex.group_rows(TUBE_COLUMN).unwrap();
        assert_eq!(groups[&Value::from("t1")], vec![0, 1]);
        assert_eq!(groups[&Value::from("t2")], vec![2, 3, 4]);
    }

    #[test]
    fn tube_ids_and_the_tube_column_are_reserved() {
        let mut ex = two_tube_experiment();
        let err = ex.add_tube(tube("t1", &[9.0]), &dox(1.0)).unwrap_err();
        assert!(matches!(err, CytoError::Configuration(_)));
        assert_eq!(ex.len(), 5);

        let mut fresh = Experiment::new();
        assert!(fresh.add_conditions([(TUBE_COLUMN, ConditionType::String)]).is_err());
    }

    #[test]
    fn group_rows_follow_column_values() {
        let ex = two_tube_experiment();
        let groups = ex.group_rows("Dox").unwrap();
        assert_eq!(groups[&Value::Float(1.0)], vec![2, 3, 4]);
        assert_eq!(groups[&Value::Float(10.0)], vec![0, 1]);
    }
}
