use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::gmm::{FitOptions, GaussianMixture};
use super::{columns_free, ensure_valid, Estimate, Operation};
use crate::data::filter::{filtered_indices, Predicate};
use crate::data::model::{Column, Value};
use crate::error::{CytoError, Result};
use crate::experiment::{ColumnMetadata, Experiment, TUBE_COLUMN};

/// Per-group population means: group value → one mean vector per population.
pub type PopulationMeans = BTreeMap<Value, Vec<Vec<f64>>>;

// ---------------------------------------------------------------------------
// MixtureSettings – recorded fitting configuration
// ---------------------------------------------------------------------------

/// Everything that makes a fit reproducible. Recorded into the output
/// column's metadata on every `apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureSettings {
    pub seed: u64,
    pub max_iter: usize,
    pub tol: f64,
    pub reg_covar: f64,
}

impl Default for MixtureSettings {
    fn default() -> Self {
        MixtureSettings {
            seed: 0,
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
        }
    }
}

/// Models from the last successful `estimate`, plus the configuration they
/// were fitted under.
#[derive(Debug, Clone)]
struct FittedState {
    channels: Vec<String>,
    num_populations: usize,
    group_by: String,
    settings: MixtureSettings,
    models: BTreeMap<Value, GaussianMixture>,
}

// ---------------------------------------------------------------------------
// MixtureModelOp
// ---------------------------------------------------------------------------

/// Fits a Gaussian mixture per group and assigns every event a population.
///
/// Protein expression is roughly lognormal, so the configured channels must
/// already carry a linearizing transform (usually `hlog`); the operation
/// refuses to run otherwise.
///
/// `apply` adds an `Int` column named `name` holding the most likely
/// population, and one `Float` column `"{name}_{k}"` per population holding
/// its posterior probability.
///
/// Groups default to one per tube ([`TUBE_COLUMN`]); `group_by` may name any
/// other column to pool tubes that share a condition value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixtureModelOp {
    pub name: String,
    pub channels: Vec<String>,
    pub num_populations: usize,
    /// Canonical name of the transform every channel must have been through.
    pub transform: String,
    /// Column whose values split events into independently fitted groups.
    #[serde(default = "default_group_by")]
    pub group_by: String,
    #[serde(default)]
    pub settings: MixtureSettings,
    #[serde(skip)]
    fitted: Option<FittedState>,
}

fn default_group_by() -> String {
    TUBE_COLUMN.to_string()
}

impl Default for MixtureModelOp {
    fn default() -> Self {
        MixtureModelOp {
            name: String::new(),
            channels: Vec::new(),
            num_populations: 0,
            transform: String::new(),
            group_by: default_group_by(),
            settings: MixtureSettings::default(),
            fitted: None,
        }
    }
}

impl MixtureModelOp {
    pub fn new(
        name: impl Into<String>,
        channels: &[&str],
        num_populations: usize,
        transform: impl Into<String>,
        group_by: impl Into<String>,
    ) -> Self {
        MixtureModelOp {
            name: name.into(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            num_populations,
            transform: transform.into(),
            group_by: group_by.into(),
            settings: MixtureSettings::default(),
            fitted: None,
        }
    }

    pub fn with_settings(mut self, settings: MixtureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn probability_column(&self, population: usize) -> String {
        format!("{}_{population}", self.name)
    }

    /// Names of every column `apply` adds.
    pub fn output_columns(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain((0..self.num_populations).map(|k| self.probability_column(k)))
            .collect()
    }

    pub fn is_estimated(&self) -> bool {
        self.fitted.is_some()
    }

    /// The fitted model for one group, if estimated.
    pub fn model(&self, group: &Value) -> Option<&GaussianMixture> {
        self.fitted.as_ref()?.models.get(group)
    }

    /// Every configured channel must have been transformed with `transform`.
    pub fn check_transform(&self, experiment: &Experiment) -> Result<()> {
        for channel in &self.channels {
            if !experiment.has_transform(channel, &self.transform) {
                return Err(CytoError::Precondition(format!(
                    "channel '{channel}' must be transformed with '{}' before clustering",
                    self.transform
                )));
            }
        }
        Ok(())
    }

    /// Configuration complete and compatible, ignoring output-name clashes.
    fn is_configured(&self, experiment: &Experiment) -> bool {
        let unique: BTreeSet<&String> = self.channels.iter().collect();
        !self.name.is_empty()
            && !self.channels.is_empty()
            && unique.len() == self.channels.len()
            && self.channels.iter().all(|c| experiment.has_channel(c))
            && self.num_populations > 0
            && !self.transform.is_empty()
            && !self.group_by.is_empty()
            && experiment.column(&self.group_by).is_some()
            && self.settings.max_iter > 0
            && self.settings.tol > 0.0
            && self.settings.reg_covar >= 0.0
    }

    fn channel_columns<'a>(&self, experiment: &'a Experiment) -> Result<Vec<&'a [f64]>> {
        self.channels
            .iter()
            .map(|c| {
                experiment
                    .column(c)
                    .and_then(Column::as_f64)
                    .ok_or_else(|| CytoError::Configuration(format!("no numeric channel '{c}'")))
            })
            .collect()
    }

    fn fit_options(&self) -> FitOptions {
        FitOptions {
            n_components: self.num_populations,
            max_iter: self.settings.max_iter,
            tol: self.settings.tol,
            reg_covar: self.settings.reg_covar,
            seed: self.settings.seed,
        }
    }

    fn fitted_for_current_config(&self) -> Result<&FittedState> {
        let state = self
            .fitted
            .as_ref()
            .ok_or_else(|| CytoError::State("must estimate before applying".to_string()))?;
        if state.channels != self.channels
            || state.num_populations != self.num_populations
            || state.group_by != self.group_by
            || state.settings != self.settings
        {
            return Err(CytoError::State(
                "configuration changed since the last estimate; estimate again".to_string(),
            ));
        }
        Ok(state)
    }
}

impl Estimate for MixtureModelOp {
    type Summary = PopulationMeans;

    fn estimate(
        &mut self,
        experiment: &Experiment,
        subset: Option<&Predicate>,
    ) -> Result<PopulationMeans> {
        if !self.is_configured(experiment) {
            return Err(CytoError::Validation(self.name.clone()));
        }
        self.check_transform(experiment)?;

        let selected: Option<BTreeSet<usize>> = match subset {
            Some(predicate) => Some(
                filtered_indices(experiment.data(), predicate)?
                    .into_iter()
                    .collect(),
            ),
            None => None,
        };

        let columns = self.channel_columns(experiment)?;
        let groups: Vec<(Value, Array2<f64>)> = experiment
            .group_rows(&self.group_by)?
            .into_iter()
            .map(|(key, rows)| {
                let rows: Vec<usize> = match &selected {
                    Some(keep) => rows.into_iter().filter(|r| keep.contains(r)).collect(),
                    None => rows,
                };
                let matrix = Array2::from_shape_fn((rows.len(), columns.len()), |(i, j)| {
                    columns[j][rows[i]]
                });
                (key, matrix)
            })
            .collect();

        let options = self.fit_options();
        let fits: Vec<(Value, GaussianMixture)> = groups
            .into_par_iter()
            .map(|(key, matrix)| {
                debug!("fitting '{}' group {key} on {} events", self.name, matrix.nrows());
                GaussianMixture::fit(&matrix, &options)
                    .map(|model| (key.clone(), model))
                    .map_err(|e| {
                        warn!("'{}' group {key}: fit failed: {e}", self.name);
                        CytoError::Fit {
                            group: key.to_string(),
                            reason: e.to_string(),
                        }
                    })
            })
            .collect::<Result<_>>()?;

        let mut models = BTreeMap::new();
        for (key, model) in fits {
            info!(
                "'{}' group {key}: fitted, mean log-likelihood {:.4}",
                self.name,
                model.log_likelihood()
            );
            models.insert(key, model);
        }

        let means = models
            .iter()
            .map(|(key, model)| (key.clone(), model.means()))
            .collect();
        self.fitted = Some(FittedState {
            channels: self.channels.clone(),
            num_populations: self.num_populations,
            group_by: self.group_by.clone(),
            settings: self.settings.clone(),
            models,
        });
        Ok(means)
    }
}

impl Operation for MixtureModelOp {
    fn id(&self) -> &'static str {
        "cytoflow.operations.mixture_model"
    }

    fn friendly_id(&self) -> &'static str {
        "Mixture Model"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self, experiment: &Experiment) -> bool {
        self.is_configured(experiment) && columns_free(experiment, &self.output_columns())
    }

    fn apply(&self, experiment: &Experiment) -> Result<Experiment> {
        let state = self.fitted_for_current_config()?;
        ensure_valid(self, experiment)?;
        self.check_transform(experiment)?;

        let columns = self.channel_columns(experiment)?;
        let n = experiment.len();
        let k = self.num_populations;
        let mut classes = vec![0i64; n];
        let mut probabilities = vec![vec![0.0f64; n]; k];
        let mut event = vec![0.0; columns.len()];

        for (key, rows) in experiment.group_rows(&self.group_by)? {
            let model = state
                .models
                .get(&key)
                .ok_or_else(|| CytoError::Lookup(key.to_string()))?;
            for row in rows {
                let cells = event.iter_mut().zip(&columns).zip(&self.channels);
                for ((slot, column), channel) in cells {
                    *slot = column[row];
                    if !slot.is_finite() {
                        return Err(CytoError::NonFinite {
                            group: key.to_string(),
                            row,
                            channel: channel.clone(),
                        });
                    }
                }
                let posterior = model.predict_proba(&event);
                classes[row] = super::gmm::argmax(&posterior) as i64;
                for (population, p) in posterior.into_iter().enumerate() {
                    probabilities[population][row] = p;
                }
            }
        }

        let fits: serde_json::Map<String, serde_json::Value> = state
            .models
            .iter()
            .map(|(key, model)| {
                (
                    key.to_string(),
                    json!({
                        "means": model.means(),
                        "weights": model.weights(),
                        "log_likelihood": model.log_likelihood(),
                    }),
                )
            })
            .collect();
        let classification_meta = ColumnMetadata::derived(self.id())
            .with_attr("channels", self.channels.clone())
            .with_attr("num_populations", self.num_populations)
            .with_attr("transform", self.transform.clone())
            .with_attr("group_by", self.group_by.clone())
            .with_attr(
                "settings",
                json!({
                    "seed": self.settings.seed,
                    "max_iter": self.settings.max_iter,
                    "tol": self.settings.tol,
                    "reg_covar": self.settings.reg_covar,
                }),
            )
            .with_attr("fits", fits);

        let mut derived = experiment.clone();
        derived.add_column(&self.name, Column::Int(classes), classification_meta)?;
        for (population, values) in probabilities.into_iter().enumerate() {
            let meta = ColumnMetadata::derived(self.id())
                .with_attr("population", population)
                .with_attr("classification", self.name.clone());
            derived.add_column(&self.probability_column(population), Column::Float(values), meta)?;
        }
        info!(
            "'{}' classified {n} events into {k} populations across {} groups",
            self.name,
            state.models.len()
        );
        Ok(derived)
    }
}
