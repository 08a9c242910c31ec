//! Flow-cytometry experiment model and analysis pipeline.
//!
//! An [`Experiment`] holds the events of one or more tubes, each event
//! stamped with its tube's experimental conditions. Analysis steps implement
//! [`Operation`]: they take an `Experiment` and derive a new one, adding
//! gate, transform or clustering results without ever dropping rows.

pub mod data;
pub mod error;
pub mod experiment;
pub mod operations;
pub mod workflow;

pub use data::filter::{CompareOp, Predicate};
pub use data::model::{Column, ConditionType, EventTable, Tube, Value};
pub use error::{CytoError, Result};
pub use experiment::{ColumnKind, ColumnMetadata, Experiment, RowView, TUBE_COLUMN};
pub use operations::{
    Estimate, MixtureModelOp, MixtureSettings, Operation, PolygonOp, PopulationMeans, RangeOp,
    ThresholdOp, Transform, TransformOp,
};
pub use workflow::Workflow;
