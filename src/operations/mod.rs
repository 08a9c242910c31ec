/// Operations: everything that turns one `Experiment` into another.
///
/// ```text
///   Experiment ──▶ TransformOp (hlog, log)   rewrite channel values, extend xforms
///        │
///        ├──────▶ ThresholdOp / RangeOp / PolygonOp   add a boolean gate column
///        │
///        └──────▶ MixtureModelOp   estimate() per group, then apply():
///                                  classification + per-population probabilities
/// ```
///
/// No operation removes or reorders rows or columns. `apply` borrows its
/// input immutably and returns a fresh, fully built `Experiment`.
pub mod gates;
pub mod gmm;
pub mod mixture;
pub mod transform;

use crate::data::filter::Predicate;
use crate::error::{CytoError, Result};
use crate::experiment::Experiment;

pub use gates::{PolygonOp, RangeOp, ThresholdOp};
pub use mixture::{MixtureModelOp, MixtureSettings, PopulationMeans};
pub use transform::{Transform, TransformOp};

/// The contract shared by every transform, gate and clustering operation.
pub trait Operation: Send + Sync {
    /// Stable identifier, e.g. `"cytoflow.operations.threshold"`.
    fn id(&self) -> &'static str;

    /// Human-readable operation kind, e.g. `"Threshold"`.
    fn friendly_id(&self) -> &'static str;

    /// The configured instance name.
    fn name(&self) -> &str;

    /// Whether the configuration is complete and fits `experiment`.
    fn is_valid(&self, experiment: &Experiment) -> bool;

    /// Derive a new experiment with this operation applied.
    fn apply(&self, experiment: &Experiment) -> Result<Experiment>;
}

/// Operations that must learn model state from data before `apply`.
pub trait Estimate: Operation {
    type Summary;

    /// Fit the operation's model. Must succeed once before the first `apply`.
    fn estimate(
        &mut self,
        experiment: &Experiment,
        subset: Option<&Predicate>,
    ) -> Result<Self::Summary>;
}

/// Shared `apply` prologue: fail with `Validation` unless `op.is_valid`.
pub(crate) fn ensure_valid<O: Operation + ?Sized>(op: &O, experiment: &Experiment) -> Result<()> {
    if op.is_valid(experiment) {
        Ok(())
    } else {
        Err(CytoError::Validation(op.name().to_string()))
    }
}

/// Output columns must not already exist in the experiment.
pub(crate) fn columns_free(experiment: &Experiment, names: &[String]) -> bool {
    names.iter().all(|n| experiment.column(n).is_none())
}
